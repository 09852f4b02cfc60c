//! Replay by id (C6): ordered, bounded, filtered stream of events for
//! one persistence id. See spec §4.5.

use futures::stream::{self, Stream};
use sqlx::Row;

use journal_core::prelude::*;

use crate::errmap::SqlxResultExt;
use crate::SqliteJournal;

/// One element of a replay stream: either a successfully deserialized
/// event, or a per-row deserialization failure that does not terminate
/// the stream.
pub type ReplayItem = Result<ReplayCompletion<Vec<u8>>, JournalError>;

impl SqliteJournal {
    /// Replays events for `persistence_id` with `from_seq <= seq <=
    /// to_seq AND deleted = false`, ordered by `sequence_number`
    /// ascending, bounded by `max` rows.
    ///
    /// The page is materialized into memory before it is emitted,
    /// trading memory for transactional consistency of the page — this
    /// operation is meant to be driven by an outer batching loop (§4.5).
    pub async fn messages(
        &self,
        persistence_id: &str,
        from_seq: u64,
        to_seq: u64,
        max: u64,
    ) -> Result<impl Stream<Item = ReplayItem>, JournalError> {
        let inner = self.inner();
        let limit = if max <= i64::MAX as u64 { max as i64 } else { -1 };

        let rows = sqlx::query(
            r#"
            SELECT ordering, persistence_id, sequence_number, timestamp,
                   deleted, message, manifest, event_manifest, identifier, tags
            FROM journal_row
            WHERE persistence_id = ? AND sequence_number >= ? AND sequence_number <= ?
                  AND deleted = 0
            ORDER BY sequence_number ASC
            LIMIT ?
            "#,
        )
        .bind(persistence_id)
        .bind(from_seq as i64)
        .bind(to_seq as i64)
        .bind(limit)
        .fetch_all(inner.pool.pool())
        .await
        .storage_err()?;

        let serializer = inner.serializer.clone();
        let mut items: Vec<ReplayItem> = Vec::new();
        for row in rows {
            let ordering: i64 = row.get("ordering");
            let journal_row = JournalRow {
                ordering: Some(ordering),
                persistence_id: row.get("persistence_id"),
                sequence_number: row.get::<i64, _>("sequence_number") as u64,
                timestamp: row.get("timestamp"),
                deleted: row.get("deleted"),
                message: row.get("message"),
                manifest: row.get("manifest"),
                event_manifest: row.get("event_manifest"),
                identifier: row.get("identifier"),
                tags: row.get("tags"),
                tag_array: Vec::new(),
                write_uuid: uuid::Uuid::nil(),
            };
            push_deserialized(&*serializer, ordering, journal_row, &mut items);
        }

        Ok(stream::iter(items))
    }
}

fn push_deserialized(
    serializer: &dyn Serializer,
    ordering: i64,
    row: JournalRow,
    out: &mut Vec<ReplayItem>,
) {
    match serializer.deserialize(&row) {
        Err(e) => out.push(Err(JournalError::Deserialization {
            ordering,
            source: anyhow::anyhow!(e.to_string()),
        })),
        Ok(sequence) => {
            for event in sequence.into_vec() {
                out.push(Ok(ReplayCompletion { event, ordering }));
            }
        }
    }
}
