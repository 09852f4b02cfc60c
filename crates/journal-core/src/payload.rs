//! MessagePack payload codec.
//!
//! `JournalRow::message` is caller-opaque bytes the journal never
//! inspects (§4.1); these helpers exist for `Serializer` implementers
//! that want a concrete wire format for that payload rather than
//! rolling their own: named-field MessagePack via
//! `rmp_serde::to_vec_named` / `rmp_serde::from_slice`.

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Encodes `payload` as MessagePack with named fields, for storage in
/// [`crate::model::JournalRow::message`].
pub fn encode_payload<T: Serialize>(payload: &T) -> Result<Vec<u8>, rmp_serde::encode::Error> {
    rmp_serde::to_vec_named(payload)
}

/// Decodes a MessagePack-encoded payload previously produced by
/// [`encode_payload`].
pub fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, rmp_serde::decode::Error> {
    rmp_serde::from_slice(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sample {
        id: u32,
        label: String,
    }

    #[test]
    fn round_trips_through_msgpack() {
        let sample = Sample {
            id: 7,
            label: "seven".into(),
        };
        let bytes = encode_payload(&sample).unwrap();
        let decoded: Sample = decode_payload(&bytes).unwrap();
        assert_eq!(sample, decoded);
    }

    #[test]
    fn decode_rejects_garbage() {
        let err = decode_payload::<Sample>(&[0xff, 0x00, 0x01]);
        assert!(err.is_err());
    }
}
