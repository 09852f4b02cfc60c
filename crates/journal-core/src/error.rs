//! Error taxonomy (spec §7).
//!
//! The core recovers nothing silently: transactional operations attempt
//! rollback, aggregate rollback failures with the root cause, and
//! re-raise rather than swallow.

use uuid::Uuid;

use crate::model::{PersistenceId, SequenceNumber};

/// Errors surfaced by the journal across the write, delete, and read
/// pipelines.
#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    /// Serialization of one atomic write failed. Carried positionally in
    /// the result of `write_messages`; sibling writes are unaffected.
    #[error("failed to serialize write for persistence id {persistence_id}: {source}")]
    Serialization {
        /// The persistence id whose write failed to serialize.
        persistence_id: PersistenceId,
        /// The underlying cause.
        #[source]
        source: anyhow::Error,
    },

    /// A transactional insert/delete/update failed against storage.
    /// Propagates to every caller whose rows were in the failing batch.
    #[error("storage operation failed: {0}")]
    Storage(#[source] anyhow::Error),

    /// Rollback of a failed transaction itself failed; both causes are
    /// preserved.
    #[error("storage operation failed: {root_cause}; rollback also failed: {rollback_cause}")]
    StorageWithFailedRollback {
        /// The error that triggered the rollback attempt.
        root_cause: anyhow::Error,
        /// The error raised while rolling back.
        rollback_cause: anyhow::Error,
    },

    /// The write queue overflowed under the drop-newest policy.
    /// Non-retriable for that attempt.
    #[error("write queue is full (buffer_size exceeded)")]
    QueueFull,

    /// The write pipeline has been shut down.
    #[error("write queue is closed")]
    QueueClosed,

    /// A single row failed to deserialize during a read. Carried as a
    /// failed result inside the read stream; does not terminate it.
    #[error("failed to deserialize row at ordering {ordering}: {source}")]
    Deserialization {
        /// The row's global ordering.
        ordering: i64,
        /// The underlying cause.
        #[source]
        source: anyhow::Error,
    },

    /// `update(persistence_id, seq, ...)` failed; includes the target
    /// identity per spec §4.3.
    #[error("update failed for persistence id {persistence_id} at sequence {sequence_number}: {source}")]
    Update {
        /// Target persistence id.
        persistence_id: PersistenceId,
        /// Target sequence number.
        sequence_number: SequenceNumber,
        /// The underlying cause.
        #[source]
        source: anyhow::Error,
    },

    /// Database connection acquisition repeatedly failed.
    #[error("fatal I/O error acquiring a database connection: {0}")]
    FatalIo(#[source] anyhow::Error),

    /// A tag contains the reserved CSV separator and cannot be stored
    /// under [`crate::model::TagMode::Csv`].
    #[error("tag {tag:?} contains the reserved separator {separator:?}")]
    InvalidTag {
        /// The offending tag.
        tag: String,
        /// The reserved separator character.
        separator: char,
    },

    /// A write group referenced by `write_uuid` could not be correlated
    /// (defensive; should not occur under normal operation).
    #[error("no rows found for write group {0}")]
    UnknownWriteGroup(Uuid),
}
