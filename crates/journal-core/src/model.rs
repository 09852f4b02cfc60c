//! Row shapes and in-memory value types for the journal.
//!
//! These mirror the three physical tables described by the data model:
//! the event row, the tag row (tag-table layout only), and the metadata
//! row (delete-compatibility mode only).

use uuid::Uuid;

/// String partitioning key selecting the per-entity event log.
pub type PersistenceId = String;

/// 64-bit monotone counter within a persistence id. Always >= 1 for a
/// persisted row.
pub type SequenceNumber = u64;

/// Database-assigned global identity of an event row; the read cursor.
pub type Ordering = i64;

/// Physical representation of tags: inline CSV on the event row, or a
/// separate, normalized tag table. Fixed per deployment at bootstrap
/// (invariant I4); switching requires offline migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TagMode {
    /// Tags stored as a delimited string on `journal_row.tags`.
    Csv,
    /// Tags stored as rows in `journal_tag_row`, joined back to events.
    #[default]
    TagTable,
}

/// Separator used by the CSV tag layout. The source snippet this crate
/// is modeled on does not document its separator; `;` is chosen here
/// and persisted tags must not contain it (see `validate_tag`).
pub const CSV_TAG_SEPARATOR: char = ';';

/// Rejects a tag that contains the reserved CSV separator.
///
/// Only meaningful under [`TagMode::Csv`]; tag-table layout has no such
/// restriction since tags are stored as whole column values.
pub fn validate_tag(tag: &str) -> Result<(), crate::error::JournalError> {
    if tag.contains(CSV_TAG_SEPARATOR) {
        return Err(crate::error::JournalError::InvalidTag {
            tag: tag.to_string(),
            separator: CSV_TAG_SEPARATOR,
        });
    }
    Ok(())
}

/// Wraps a set of tags into the CSV column form `;tag1;tag2;`, so that a
/// `LIKE '%;tag;%'` filter never matches a tag that is merely a prefix or
/// suffix of another (invariant required by §4.6).
pub fn encode_csv_tags<'a>(tags: impl IntoIterator<Item = &'a str>) -> String {
    let mut out = String::new();
    out.push(CSV_TAG_SEPARATOR);
    for tag in tags {
        out.push_str(tag);
        out.push(CSV_TAG_SEPARATOR);
    }
    out
}

/// Splits a CSV tag column back into its component tags.
pub fn decode_csv_tags(column: &str) -> Vec<String> {
    column
        .split(CSV_TAG_SEPARATOR)
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

/// One persisted event row (`journal_row`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalRow {
    /// Database-assigned identity; `None` before insert.
    pub ordering: Option<Ordering>,
    /// Partitioning key.
    pub persistence_id: PersistenceId,
    /// Strictly increasing sequence number within `persistence_id`.
    pub sequence_number: SequenceNumber,
    /// Caller-supplied wall time; may be 0.
    pub timestamp: i64,
    /// Soft-delete flag.
    pub deleted: bool,
    /// Opaque event payload bytes. Never inspected or re-encoded by the
    /// journal; preserved byte-for-byte.
    pub message: Vec<u8>,
    /// Serializer hint identifying the payload's wire shape.
    pub manifest: String,
    /// Serializer hint identifying the logical event type.
    pub event_manifest: Option<i64>,
    /// Serializer hint correlating a payload with a specific identifier
    /// scheme.
    pub identifier: Option<i64>,
    /// CSV tag column; populated only under [`TagMode::Csv`].
    pub tags: Option<String>,
    /// Logical tag set; populated for both layouts in memory, but only
    /// persisted inline under [`TagMode::Csv`] (tag-table layout moves
    /// it to [`TagRow`] instead).
    pub tag_array: Vec<String>,
    /// Correlates every row written by the same atomic write group.
    pub write_uuid: Uuid,
}

/// One tag-table row (`journal_tag_row`), tag-table layout only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagRow {
    /// Foreign key to `journal_row.ordering`.
    pub ordering_id: Ordering,
    /// The tag value.
    pub tag_value: String,
    /// Denormalized for efficient filtered scans.
    pub persistence_id: PersistenceId,
    /// Denormalized for efficient filtered scans.
    pub sequence_number: SequenceNumber,
    /// Mirrors the owning event row's write group.
    pub write_uuid: Uuid,
}

/// One metadata row (`journal_metadata`), delete-compatibility mode only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataRow {
    /// Partitioning key.
    pub persistence_id: PersistenceId,
    /// Historical high-water mark sequence number.
    pub sequence_number: SequenceNumber,
}

/// A single logical event plus the identity it will be (or was) written
/// under, independent of its row encoding.
#[derive(Debug, Clone)]
pub struct PersistentRepr {
    /// Partitioning key.
    pub persistence_id: PersistenceId,
    /// Sequence number this event occupies.
    pub sequence_number: SequenceNumber,
    /// Opaque payload bytes.
    pub payload: Vec<u8>,
    /// Serializer hint.
    pub manifest: String,
    /// Tags attached to this event by the caller.
    pub tags: Vec<String>,
}

/// A group of events to be persisted atomically, sharing one `write_uuid`
/// once serialized.
#[derive(Debug, Clone)]
pub struct AtomicWrite {
    /// The events in this group, in the order they must be written.
    pub events: Vec<PersistentRepr>,
}

/// Result of deserializing one stored row back into a domain event: an
/// adapter may expand a single row into zero, one, or more logical
/// envelopes (fan-out). Mirrors the source's `EventSequence.{Empty,
/// Single, Create(a,b)}` shape without hard-coding an arity of two.
#[derive(Debug, Clone)]
pub enum EventSequence<T> {
    /// The row produced no logical event (e.g. a filtered adapter).
    Empty,
    /// The row produced exactly one logical event.
    Single(T),
    /// The row produced more than one logical event.
    Many(Vec<T>),
}

impl<T> EventSequence<T> {
    /// Number of logical elements this sequence carries.
    pub fn len(&self) -> usize {
        match self {
            EventSequence::Empty => 0,
            EventSequence::Single(_) => 1,
            EventSequence::Many(v) => v.len(),
        }
    }

    /// True if this sequence carries no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flattens this sequence into a plain `Vec`.
    pub fn into_vec(self) -> Vec<T> {
        match self {
            EventSequence::Empty => Vec::new(),
            EventSequence::Single(t) => vec![t],
            EventSequence::Many(v) => v,
        }
    }
}

/// Envelope emitted by the query streams (C6/C7/C8):
/// `{ordering, persistence_id, sequence_number, event, timestamp}`.
#[derive(Debug, Clone)]
pub struct Envelope<T> {
    /// Global read cursor.
    pub ordering: Ordering,
    /// Partitioning key.
    pub persistence_id: PersistenceId,
    /// Sequence number within `persistence_id`.
    pub sequence_number: SequenceNumber,
    /// The deserialized domain event.
    pub event: T,
    /// Caller-supplied wall time carried by the source row.
    pub timestamp: i64,
}

/// Outcome of replaying one row during C6 replay-by-id: the
/// deserialized event paired with the cursor it was read at.
#[derive(Debug, Clone)]
pub struct ReplayCompletion<T> {
    /// The deserialized domain event.
    pub event: T,
    /// Global read cursor of the row this event was read from.
    pub ordering: Ordering,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_round_trip_rejects_substring_false_positive() {
        let encoded = encode_csv_tags(["blue", "green"]);
        assert_eq!(encoded, ";blue;green;");
        assert!(encoded.contains(";blue;"));
        assert!(!encoded.contains(";bluebird;"));
    }

    #[test]
    fn csv_decode_round_trips() {
        let encoded = encode_csv_tags(["a", "b", "c"]);
        assert_eq!(decode_csv_tags(&encoded), vec!["a", "b", "c"]);
    }

    #[test]
    fn validate_tag_rejects_separator() {
        assert!(validate_tag("has;separator").is_err());
        assert!(validate_tag("clean").is_ok());
    }

    #[test]
    fn event_sequence_len_matches_variant() {
        assert_eq!(EventSequence::<i32>::Empty.len(), 0);
        assert_eq!(EventSequence::Single(1).len(), 1);
        assert_eq!(EventSequence::Many(vec![1, 2, 3]).len(), 3);
    }
}
