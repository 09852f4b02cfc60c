//! Write pipeline (C4) and update (C4 aux).
//!
//! A bounded, drop-newest queue feeds a weight-batching stage; a pool of
//! worker tasks drains it with bounded parallelism and performs the
//! transactional multi-table insert. See spec §4.2.

use std::sync::Arc;

use sqlx::Sqlite;

use journal_core::prelude::*;

use crate::errmap::SqlxResultExt;
use crate::Inner;

/// One atomic write's rows plus the handle used to resolve every caller
/// awaiting that write once its containing batch completes.
pub struct QueuedWrite {
    pub(crate) rows: Vec<JournalRow>,
    pub(crate) completion: tokio::sync::oneshot::Sender<Result<(), Arc<JournalError>>>,
}

impl QueuedWrite {
    fn weight(&self) -> usize {
        self.rows.len()
    }
}

pub(crate) fn spawn_workers(inner: Arc<Inner>, queue_rx: async_channel::Receiver<QueuedWrite>) {
    let parallelism = inner.config.parallelism.max(1);
    for _ in 0..parallelism {
        let inner = Arc::clone(&inner);
        let queue_rx = queue_rx.clone();
        tokio::spawn(async move { worker_loop(inner, queue_rx).await });
    }
}

async fn worker_loop(inner: Arc<Inner>, queue_rx: async_channel::Receiver<QueuedWrite>) {
    loop {
        let first = match queue_rx.recv().await {
            Ok(item) => item,
            Err(_) => break, // every sender dropped; pipeline shut down
        };

        let mut weight = first.weight();
        let mut batch = vec![first];
        while weight < inner.config.batch_size {
            match queue_rx.try_recv() {
                Ok(item) => {
                    weight += item.weight();
                    batch.push(item);
                }
                Err(_) => break, // upstream idle for now
            }
        }

        let result = write_batch(&inner, &batch).await;
        match &result {
            Ok(()) => tracing::debug!(writes = batch.len(), rows = weight, "committed write batch"),
            Err(e) => tracing::error!(error = %e, "write batch failed"),
        }
        for item in batch {
            let _ = item.completion.send(result.clone());
        }
    }
}

async fn write_batch(inner: &Inner, batch: &[QueuedWrite]) -> Result<(), Arc<JournalError>> {
    let rows: Vec<&JournalRow> = batch.iter().flat_map(|w| w.rows.iter()).collect();
    if rows.is_empty() {
        return Ok(());
    }

    let hot_path = rows.len() == 1 && (inner.config.tag_mode == TagMode::Csv || rows[0].tag_array.is_empty());

    let result = if hot_path {
        insert_hot_path(inner, rows[0]).await
    } else {
        insert_transactional(inner, &rows).await
    };

    result.map_err(Arc::new)
}

/// Single-statement insert with no surrounding transaction: the hot path
/// for a batch of exactly one row under CSV layout, or any layout when
/// that row carries no tags (§4.2).
async fn insert_hot_path(inner: &Inner, row: &JournalRow) -> Result<(), JournalError> {
    sqlx::query(
        r#"
        INSERT INTO journal_row
            (persistence_id, sequence_number, timestamp, deleted, message, manifest, event_manifest, identifier, tags, write_uuid)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&row.persistence_id)
    .bind(row.sequence_number as i64)
    .bind(row.timestamp)
    .bind(row.deleted)
    .bind(&row.message)
    .bind(&row.manifest)
    .bind(row.event_manifest)
    .bind(row.identifier)
    .bind(&row.tags)
    .bind(row.write_uuid.as_bytes().to_vec())
    .execute(inner.pool.pool())
    .await
    .storage_err()?;
    Ok(())
}

async fn insert_transactional(inner: &Inner, rows: &[&JournalRow]) -> Result<(), JournalError> {
    let mut tx = inner.pool.begin().await.storage_err()?;

    let outcome = do_transactional_inserts(&mut tx, inner, rows).await;
    match outcome {
        Ok(()) => {
            tx.commit().await.storage_err()?;
            Ok(())
        }
        Err(e) => match tx.rollback().await {
            Ok(()) => Err(e),
            Err(rollback_err) => Err(JournalError::StorageWithFailedRollback {
                root_cause: anyhow::anyhow!(e.to_string()),
                rollback_cause: anyhow::Error::new(rollback_err),
            }),
        },
    }
}

async fn do_transactional_inserts(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    inner: &Inner,
    rows: &[&JournalRow],
) -> Result<(), JournalError> {
    match inner.config.tag_mode {
        TagMode::Csv => {
            let chunk_size = choose_chunk_size(
                rows.len(),
                inner.config.max_row_by_row_size,
                inner.config.db_round_trip_batch_size,
            );
            bulk_insert_rows(tx, rows, chunk_size).await
        }
        TagMode::TagTable => {
            for run in contiguous_runs(rows) {
                match run {
                    Run::NoTag(chunk) => {
                        let chunk_size = choose_chunk_size(
                            chunk.len(),
                            inner.config.max_row_by_row_size,
                            inner.config.db_round_trip_batch_size,
                        );
                        bulk_insert_rows(tx, chunk, chunk_size).await?;
                    }
                    Run::HasTag(chunk) => {
                        let tag_rows = insert_rows_capturing_ids(tx, chunk).await?;
                        let chunk_size = choose_chunk_size(
                            tag_rows.len(),
                            inner.config.max_row_by_row_size,
                            inner.config.db_round_trip_tag_batch_size,
                        );
                        bulk_insert_tag_rows(tx, &tag_rows, chunk_size).await?;
                    }
                }
            }
            Ok(())
        }
    }
}

enum Run<'a> {
    NoTag(&'a [&'a JournalRow]),
    HasTag(&'a [&'a JournalRow]),
}

/// Splits a batch into contiguous runs of no-tag / has-tag rows,
/// preserving batch order (§4.2 "multi-path insert").
fn contiguous_runs<'a>(rows: &'a [&'a JournalRow]) -> Vec<Run<'a>> {
    let mut out = Vec::new();
    let mut start = 0;
    while start < rows.len() {
        let has_tag = !rows[start].tag_array.is_empty();
        let mut end = start + 1;
        while end < rows.len() && !rows[end].tag_array.is_empty() == has_tag {
            end += 1;
        }
        let slice = &rows[start..end];
        out.push(if has_tag { Run::HasTag(slice) } else { Run::NoTag(slice) });
        start = end;
    }
    out
}

/// `BulkCopy.Default` (chunked) vs `MultipleRows` (single statement):
/// chunk only once the run exceeds `max_row_by_row_size`.
fn choose_chunk_size(run_len: usize, max_row_by_row_size: usize, round_trip_batch_size: usize) -> usize {
    if run_len > max_row_by_row_size {
        round_trip_batch_size.max(1)
    } else {
        run_len.max(1)
    }
}

async fn bulk_insert_rows(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    rows: &[&JournalRow],
    chunk_size: usize,
) -> Result<(), JournalError> {
    for chunk in rows.chunks(chunk_size.max(1)) {
        let mut qb = sqlx::QueryBuilder::<Sqlite>::new(
            "INSERT INTO journal_row (persistence_id, sequence_number, timestamp, deleted, message, manifest, event_manifest, identifier, tags, write_uuid) ",
        );
        qb.push_values(chunk.iter(), |mut b, row| {
            b.push_bind(row.persistence_id.clone())
                .push_bind(row.sequence_number as i64)
                .push_bind(row.timestamp)
                .push_bind(row.deleted)
                .push_bind(row.message.clone())
                .push_bind(row.manifest.clone())
                .push_bind(row.event_manifest)
                .push_bind(row.identifier)
                .push_bind(row.tags.clone())
                .push_bind(row.write_uuid.as_bytes().to_vec());
        });
        qb.build().execute(&mut **tx).await.storage_err()?;
    }
    Ok(())
}

/// Row-by-row insert to recover the database-assigned `ordering`: the
/// driver's bulk-copy path cannot return generated identities, and the
/// tag table needs `ordering_id` (§4.2, §9).
async fn insert_rows_capturing_ids(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    rows: &[&JournalRow],
) -> Result<Vec<TagRow>, JournalError> {
    let mut tag_rows = Vec::new();
    for row in rows {
        let ordering: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO journal_row
                (persistence_id, sequence_number, timestamp, deleted, message, manifest, event_manifest, identifier, tags, write_uuid)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING ordering
            "#,
        )
        .bind(&row.persistence_id)
        .bind(row.sequence_number as i64)
        .bind(row.timestamp)
        .bind(row.deleted)
        .bind(&row.message)
        .bind(&row.manifest)
        .bind(row.event_manifest)
        .bind(row.identifier)
        .bind(&row.tags)
        .bind(row.write_uuid.as_bytes().to_vec())
        .fetch_one(&mut **tx)
        .await
        .storage_err()?;

        for tag in &row.tag_array {
            tag_rows.push(TagRow {
                ordering_id: ordering,
                tag_value: tag.clone(),
                persistence_id: row.persistence_id.clone(),
                sequence_number: row.sequence_number,
                write_uuid: row.write_uuid,
            });
        }
    }
    Ok(tag_rows)
}

async fn bulk_insert_tag_rows(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    tag_rows: &[TagRow],
    chunk_size: usize,
) -> Result<(), JournalError> {
    for chunk in tag_rows.chunks(chunk_size.max(1)) {
        let mut qb = sqlx::QueryBuilder::<Sqlite>::new(
            "INSERT INTO journal_tag_row (ordering_id, tag_value, persistence_id, sequence_number, write_uuid) ",
        );
        qb.push_values(chunk.iter(), |mut b, t| {
            b.push_bind(t.ordering_id)
                .push_bind(t.tag_value.clone())
                .push_bind(t.persistence_id.clone())
                .push_bind(t.sequence_number as i64)
                .push_bind(t.write_uuid.as_bytes().to_vec());
        });
        qb.build().execute(&mut **tx).await.storage_err()?;
    }
    Ok(())
}

impl crate::SqliteJournal {
    /// Writes a batch of atomic groups, returning one slot per input
    /// write: `None` on success, `Some(error)` on that write's failure.
    /// Sibling writes in the same call are unaffected by one write's
    /// serialization failure (§4.2).
    pub async fn write_messages(
        &self,
        atomic_writes: Vec<AtomicWrite>,
        timestamp: i64,
    ) -> Vec<Option<JournalError>> {
        let inner = self.inner();
        let serialized = inner.serializer.serialize(
            &atomic_writes,
            timestamp,
            inner.config.tag_mode,
            &inner.id_gen,
        );

        let mut results: Vec<Option<JournalError>> = Vec::with_capacity(serialized.len());
        let mut pending: Vec<(usize, tokio::sync::oneshot::Receiver<Result<(), Arc<JournalError>>>)> =
            Vec::new();

        for outcome in serialized {
            let idx = results.len();
            match outcome {
                Err(e) => {
                    results.push(Some(e));
                }
                Ok(rows) => {
                    if inner.config.tag_mode == TagMode::Csv {
                        let bad = rows
                            .iter()
                            .flat_map(|r| r.tag_array.iter())
                            .find(|t| t.contains(CSV_TAG_SEPARATOR));
                        if let Some(tag) = bad {
                            results.push(Some(JournalError::InvalidTag {
                                tag: tag.clone(),
                                separator: CSV_TAG_SEPARATOR,
                            }));
                            continue;
                        }
                    }

                    let (tx, rx) = tokio::sync::oneshot::channel();
                    let queued = QueuedWrite { rows, completion: tx };
                    match inner.queue_tx.try_send(queued) {
                        Ok(()) => {
                            results.push(None);
                            pending.push((idx, rx));
                        }
                        Err(async_channel::TrySendError::Full(_)) => {
                            tracing::warn!("write queue full, dropping write");
                            results.push(Some(JournalError::QueueFull));
                        }
                        Err(async_channel::TrySendError::Closed(_)) => {
                            tracing::warn!("write queue closed, dropping write");
                            results.push(Some(JournalError::QueueClosed));
                        }
                    }
                }
            }
        }

        for (idx, rx) in pending {
            match rx.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => results[idx] = Some(JournalError::Storage(anyhow::anyhow!(e.to_string()))),
                Err(_) => {
                    results[idx] = Some(JournalError::Storage(anyhow::anyhow!(
                        "write worker dropped its completion handle"
                    )))
                }
            }
        }

        results
    }

    /// Overwrites the `message` of the row `(persistence_id,
    /// sequence_number)`. Does not re-tag (§4.3).
    ///
    /// The source this crate is modeled on raises only when
    /// serialization *succeeds* (an inverted condition, see spec §9 open
    /// questions). This implementation uses the corrected semantics:
    /// raise [`JournalError::Update`] on serialization *failure*.
    pub async fn update(
        &self,
        persistence_id: &str,
        sequence_number: u64,
        payload: &[u8],
        manifest: &str,
    ) -> Result<(), JournalError> {
        let inner = self.inner();
        let row = inner
            .serializer
            .serialize_for_update(persistence_id, sequence_number, payload, manifest)
            .map_err(|e| JournalError::Update {
                persistence_id: persistence_id.to_string(),
                sequence_number,
                source: anyhow::anyhow!(e.to_string()),
            })?;

        let result = sqlx::query(
            "UPDATE journal_row SET message = ? WHERE persistence_id = ? AND sequence_number = ?",
        )
        .bind(&row.message)
        .bind(persistence_id)
        .bind(sequence_number as i64)
        .execute(inner.pool.pool())
        .await
        .map_err(|e| JournalError::Update {
            persistence_id: persistence_id.to_string(),
            sequence_number,
            source: anyhow::Error::new(e),
        })?;

        if result.rows_affected() == 0 {
            return Err(JournalError::Update {
                persistence_id: persistence_id.to_string(),
                sequence_number,
                source: anyhow::anyhow!("no row exists at this persistence id and sequence number"),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc as StdArc;

    use journal_core::model::PersistentRepr;

    use crate::tests::PassthroughSerializer;
    use crate::SqliteJournal;

    use super::*;

    fn write_one(pid: &str, seq: u64, payload: &[u8], tags: Vec<String>) -> AtomicWrite {
        AtomicWrite {
            events: vec![PersistentRepr {
                persistence_id: pid.to_string(),
                sequence_number: seq,
                payload: payload.to_vec(),
                manifest: "m".into(),
                tags,
            }],
        }
    }

    #[tokio::test]
    async fn single_write_round_trips() {
        let journal = SqliteJournal::in_memory(JournalConfig::default(), StdArc::new(PassthroughSerializer))
            .await
            .unwrap();

        let results = journal
            .write_messages(vec![write_one("a", 1, b"hello", vec![])], 42)
            .await;
        assert_eq!(results.len(), 1);
        assert!(results[0].is_none());

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM journal_row")
            .fetch_one(journal.inner().pool.pool())
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn atomic_group_is_all_or_nothing_visible() {
        let journal = SqliteJournal::in_memory(JournalConfig::default(), StdArc::new(PassthroughSerializer))
            .await
            .unwrap();

        let group = AtomicWrite {
            events: vec![
                PersistentRepr {
                    persistence_id: "a".into(),
                    sequence_number: 1,
                    payload: b"one".to_vec(),
                    manifest: "m".into(),
                    tags: vec!["blue".into()],
                },
                PersistentRepr {
                    persistence_id: "a".into(),
                    sequence_number: 2,
                    payload: b"two".to_vec(),
                    manifest: "m".into(),
                    tags: vec![],
                },
            ],
        };

        let results = journal.write_messages(vec![group], 0).await;
        assert_eq!(results.len(), 1);
        assert!(results[0].is_none());

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM journal_row")
            .fetch_one(journal.inner().pool.pool())
            .await
            .unwrap();
        assert_eq!(count, 2);

        let tag_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM journal_tag_row")
            .fetch_one(journal.inner().pool.pool())
            .await
            .unwrap();
        assert_eq!(tag_count, 1);
    }

    #[tokio::test]
    async fn csv_layout_never_touches_tag_table() {
        let mut config = JournalConfig::default();
        config.tag_mode = TagMode::Csv;
        let journal = SqliteJournal::in_memory(config, StdArc::new(PassthroughSerializer))
            .await
            .unwrap();

        let results = journal
            .write_messages(vec![write_one("a", 1, b"hi", vec!["green".into()])], 0)
            .await;
        assert_eq!(results.len(), 1);
        assert!(results[0].is_none());

        let row_tags: Option<String> = sqlx::query_scalar("SELECT tags FROM journal_row WHERE persistence_id = 'a'")
            .fetch_one(journal.inner().pool.pool())
            .await
            .unwrap();
        assert_eq!(row_tags.as_deref(), Some(";green;"));
    }

    #[tokio::test]
    async fn csv_layout_rejects_tag_containing_separator() {
        let mut config = JournalConfig::default();
        config.tag_mode = TagMode::Csv;
        let journal = SqliteJournal::in_memory(config, StdArc::new(PassthroughSerializer))
            .await
            .unwrap();

        let results = journal
            .write_messages(vec![write_one("a", 1, b"hi", vec!["bad;tag".into()])], 0)
            .await;
        assert!(matches!(results[0], Some(JournalError::InvalidTag { .. })));
    }

    #[tokio::test]
    async fn update_overwrites_message_without_retagging() {
        let journal = SqliteJournal::in_memory(JournalConfig::default(), StdArc::new(PassthroughSerializer))
            .await
            .unwrap();

        journal
            .write_messages(vec![write_one("a", 1, b"before", vec!["blue".into()])], 0)
            .await;

        journal.update("a", 1, b"after", "m").await.unwrap();

        let message: Vec<u8> = sqlx::query_scalar("SELECT message FROM journal_row WHERE persistence_id = 'a'")
            .fetch_one(journal.inner().pool.pool())
            .await
            .unwrap();
        assert_eq!(message, b"after");

        let tag_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM journal_tag_row")
            .fetch_one(journal.inner().pool.pool())
            .await
            .unwrap();
        assert_eq!(tag_count, 1, "update must not re-tag the row");
    }

    #[tokio::test]
    async fn update_unknown_row_fails_with_target_identity() {
        let journal = SqliteJournal::in_memory(JournalConfig::default(), StdArc::new(PassthroughSerializer))
            .await
            .unwrap();

        let err = journal.update("missing", 1, b"x", "m").await.unwrap_err();
        match err {
            JournalError::Update {
                persistence_id,
                sequence_number,
                ..
            } => {
                assert_eq!(persistence_id, "missing");
                assert_eq!(sequence_number, 1);
            }
            other => panic!("expected Update error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn saturated_queue_fails_new_writes_with_queue_full() {
        let mut config = JournalConfig::default();
        config.buffer_size = 1;
        let journal = SqliteJournal::in_memory(config, StdArc::new(PassthroughSerializer))
            .await
            .unwrap();

        // The current-thread test runtime never polls the spawned worker
        // task until this function itself awaits, so the synchronous
        // enqueue loop below races ahead of any draining.
        let writes: Vec<AtomicWrite> = (0..50)
            .map(|i| write_one("p", i as u64 + 1, b"x", vec![]))
            .collect();
        let results = journal.write_messages(writes, 0).await;
        assert!(
            results.iter().any(|r| matches!(r, Some(JournalError::QueueFull))),
            "expected at least one QueueFull under a saturated queue"
        );
    }
}
