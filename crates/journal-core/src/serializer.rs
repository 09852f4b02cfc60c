//! The `Serializer` contract (C2): maps in-memory events to/from row
//! payload bytes, manifest, and tags.
//!
//! An implementer must preserve the `message` field byte-for-byte; the
//! journal never inspects or re-encodes opaque event payloads.

use uuid::Uuid;

use crate::error::JournalError;
use crate::id::SequentialIdGenerator;
use crate::model::{AtomicWrite, JournalRow, TagMode};

/// Converts between domain events and the rows the journal persists.
///
/// Bound by `Send + Sync` so a single serializer instance can be shared
/// across the concurrent write pipeline and the read query engines.
pub trait Serializer: Send + Sync {
    /// Serializes a batch of atomic writes.
    ///
    /// Each atomic write yields either the list of rows it expands to
    /// (one row per event in the group, sharing a fresh `write_uuid`
    /// minted by `id_gen`, C9) or a serialization error for that write
    /// alone. Errors do not abort sibling writes; the returned vector
    /// has the same length and order as `atomic_writes`.
    fn serialize(
        &self,
        atomic_writes: &[AtomicWrite],
        timestamp: i64,
        tag_mode: TagMode,
        id_gen: &SequentialIdGenerator,
    ) -> Vec<Result<Vec<JournalRow>, JournalError>> {
        atomic_writes
            .iter()
            .map(|write| self.serialize_one_group(write, timestamp, tag_mode, id_gen.next_id()))
            .collect()
    }

    /// Serializes a single atomic write into its row set, tagging every
    /// row with the given `write_uuid` (minted once per group by the
    /// caller, C9).
    fn serialize_one_group(
        &self,
        atomic_write: &AtomicWrite,
        timestamp: i64,
        tag_mode: TagMode,
        write_uuid: Uuid,
    ) -> Result<Vec<JournalRow>, JournalError> {
        atomic_write
            .events
            .iter()
            .map(|event| self.serialize_single(event, timestamp, tag_mode, write_uuid))
            .collect()
    }

    /// Serializes a single event, tagging the resulting row with the
    /// given `write_uuid` so siblings in the same atomic write can be
    /// correlated downstream.
    fn serialize_single(
        &self,
        event: &crate::model::PersistentRepr,
        timestamp: i64,
        tag_mode: TagMode,
        write_uuid: Uuid,
    ) -> Result<JournalRow, JournalError>;

    /// Serializes a single event for `update` (C4 aux). Does not assign
    /// tags; `update` never re-tags a row per spec §4.3.
    fn serialize_for_update(
        &self,
        persistence_id: &str,
        sequence_number: u64,
        payload: &[u8],
        manifest: &str,
    ) -> Result<JournalRow, JournalError>;

    /// Deserializes one stored row back into a domain event, possibly
    /// fanning out into zero, one, or many logical envelopes. Errors are
    /// per-row and must not terminate the caller's stream.
    fn deserialize(
        &self,
        row: &JournalRow,
    ) -> Result<crate::model::EventSequence<Vec<u8>>, JournalError>;
}
