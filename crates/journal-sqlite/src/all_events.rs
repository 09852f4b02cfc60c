//! All-events query (C8) and the supplemented `persistence_ids`
//! surface. Same gap-tolerance design as the tag query engine (C7),
//! unfiltered. See spec §4.7 and SPEC_FULL.md §11.

use std::collections::HashSet;

use async_stream::stream;
use futures::stream::Stream;
use sqlx::{Row, SqlitePool};

use journal_core::model::{Envelope, Ordering, PersistenceId};
use journal_core::prelude::*;

use crate::cursor::{self, QueryMode};
use crate::SqliteJournal;

/// One envelope emitted by [`SqliteJournal::all_events`]:
/// `{ordering, persistence_id, sequence_number, event, timestamp}`
/// (§4.7).
pub type AllEventsItem = Envelope<Vec<u8>>;

/// One persistence id newly observed by [`SqliteJournal::persistence_ids`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistenceIdsItem {
    /// The persistence id.
    pub persistence_id: PersistenceId,
    /// Global read cursor of the row that first surfaced it in this
    /// stream's scan order.
    pub ordering: Ordering,
}

impl SqliteJournal {
    /// Streams every event strictly after `offset`, ordered by
    /// `ordering` ascending, unfiltered by tag.
    ///
    /// Shares the ordering-gap tolerance and current/live semantics of
    /// [`SqliteJournal::events_by_tag`].
    pub fn all_events(
        &self,
        offset: u64,
        mode: QueryMode,
    ) -> impl Stream<Item = Result<AllEventsItem, JournalError>> {
        let inner = self.inner();
        let pool = inner.pool.clone();
        let serializer = inner.serializer.clone();
        let page_size = inner.config.max_buffer_size.max(1) as i64;
        let safety_window = inner.config.safety_window;
        let poll_period = crate::refresh_interval(&inner.config);

        stream! {
            let mut last_emitted: Ordering = offset as Ordering;

            loop {
                let max_in_db = match cursor::max_ordering(&pool).await {
                    Ok(v) => v,
                    Err(e) => {
                        yield Err(JournalError::Storage(anyhow::Error::new(e)));
                        return;
                    }
                };
                let upper = cursor::fetch_upper_bound(max_in_db, last_emitted, safety_window);

                if upper <= last_emitted {
                    if mode == QueryMode::Current {
                        return;
                    }
                    tokio::time::sleep(poll_period).await;
                    continue;
                }

                let rows = match fetch_all_page(&pool, last_emitted, upper, page_size).await {
                    Ok(rows) => rows,
                    Err(e) => {
                        yield Err(JournalError::Storage(anyhow::Error::new(e)));
                        return;
                    }
                };

                let fetched_full_page = rows.len() as i64 == page_size;
                tracing::debug!(fetched = rows.len(), upper, "all-events poll cycle fetched page");

                if rows.is_empty() {
                    last_emitted = upper;
                } else {
                    for row in rows {
                        let ordering = row.ordering.expect("persisted row has ordering");
                        last_emitted = ordering;
                        match serializer.deserialize(&row) {
                            Err(e) => yield Err(JournalError::Deserialization {
                                ordering,
                                source: anyhow::anyhow!(e.to_string()),
                            }),
                            Ok(sequence) => {
                                for event in sequence.into_vec() {
                                    yield Ok(Envelope {
                                        ordering,
                                        persistence_id: row.persistence_id.clone(),
                                        sequence_number: row.sequence_number,
                                        event,
                                        timestamp: row.timestamp,
                                    });
                                }
                            }
                        }
                    }
                    if !fetched_full_page {
                        last_emitted = upper;
                    }
                }
                tracing::debug!(last_emitted, "all-events poll cursor advanced");

                if fetched_full_page {
                    continue;
                }

                if mode == QueryMode::Current {
                    return;
                }
                tokio::time::sleep(poll_period).await;
            }
        }
    }

    /// Streams distinct persistence ids newly observed after `offset`,
    /// ordered by the `ordering` of the row that first exhibits them.
    ///
    /// Not present in the source this crate is modeled on; added
    /// because every other read surface here is already keyed by
    /// `ordering`, and enumerating live persistence ids is the natural
    /// projection of [`SqliteJournal::all_events`] (SPEC_FULL.md §11).
    pub fn persistence_ids(
        &self,
        offset: u64,
        mode: QueryMode,
    ) -> impl Stream<Item = Result<PersistenceIdsItem, JournalError>> {
        let inner = self.inner();
        let pool = inner.pool.clone();
        let page_size = inner.config.max_buffer_size.max(1) as i64;
        let safety_window = inner.config.safety_window;
        let poll_period = crate::refresh_interval(&inner.config);

        stream! {
            let mut last_emitted: Ordering = offset as Ordering;
            let mut seen: HashSet<PersistenceId> = HashSet::new();

            loop {
                let max_in_db = match cursor::max_ordering(&pool).await {
                    Ok(v) => v,
                    Err(e) => {
                        yield Err(JournalError::Storage(anyhow::Error::new(e)));
                        return;
                    }
                };
                let upper = cursor::fetch_upper_bound(max_in_db, last_emitted, safety_window);

                if upper <= last_emitted {
                    if mode == QueryMode::Current {
                        return;
                    }
                    tokio::time::sleep(poll_period).await;
                    continue;
                }

                let rows = match fetch_pid_page(&pool, last_emitted, upper, page_size).await {
                    Ok(rows) => rows,
                    Err(e) => {
                        yield Err(JournalError::Storage(anyhow::Error::new(e)));
                        return;
                    }
                };

                let fetched_full_page = rows.len() as i64 == page_size;
                tracing::debug!(fetched = rows.len(), upper, "persistence-id poll cycle fetched page");

                if rows.is_empty() {
                    last_emitted = upper;
                } else {
                    for (ordering, persistence_id) in rows {
                        last_emitted = ordering;
                        if seen.insert(persistence_id.clone()) {
                            yield Ok(PersistenceIdsItem {
                                persistence_id,
                                ordering,
                            });
                        }
                    }
                    if !fetched_full_page {
                        last_emitted = upper;
                    }
                }
                tracing::debug!(last_emitted, "persistence-id poll cursor advanced");

                if fetched_full_page {
                    continue;
                }

                if mode == QueryMode::Current {
                    return;
                }
                tokio::time::sleep(poll_period).await;
            }
        }
    }
}

async fn fetch_all_page(
    pool: &SqlitePool,
    after: Ordering,
    upper: Ordering,
    limit: i64,
) -> Result<Vec<JournalRow>, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        SELECT ordering, persistence_id, sequence_number, timestamp,
               deleted, message, manifest, event_manifest, identifier, tags
        FROM journal_row
        WHERE ordering > ? AND ordering <= ? AND deleted = 0
        ORDER BY ordering ASC
        LIMIT ?
        "#,
    )
    .bind(after)
    .bind(upper)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| JournalRow {
            ordering: Some(row.get("ordering")),
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
        })
        .collect())
}

async fn fetch_pid_page(
    pool: &SqlitePool,
    after: Ordering,
    upper: Ordering,
    limit: i64,
) -> Result<Vec<(Ordering, PersistenceId)>, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        SELECT ordering, persistence_id
        FROM journal_row
        WHERE ordering > ? AND ordering <= ? AND deleted = 0
        ORDER BY ordering ASC
        LIMIT ?
        "#,
    )
    .bind(after)
    .bind(upper)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| (row.get("ordering"), row.get("persistence_id")))
        .collect())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures::StreamExt;
    use journal_core::model::PersistentRepr;

    use crate::tests::PassthroughSerializer;
    use crate::SqliteJournal;

    use super::*;

    fn write_one(pid: &str, seq: u64) -> AtomicWrite {
        AtomicWrite {
            events: vec![PersistentRepr {
                persistence_id: pid.to_string(),
                sequence_number: seq,
                payload: vec![seq as u8],
                manifest: "m".into(),
                tags: vec![],
            }],
        }
    }

    #[tokio::test]
    async fn all_events_emits_everything_in_order() {
        let mut config = JournalConfig::default();
        config.safety_window = 0;
        let journal = SqliteJournal::in_memory(config, Arc::new(PassthroughSerializer))
            .await
            .unwrap();

        journal.write_messages(vec![write_one("a", 1)], 0).await;
        journal.write_messages(vec![write_one("b", 1)], 0).await;
        journal.write_messages(vec![write_one("a", 2)], 0).await;

        let items: Vec<_> = journal
            .all_events(0, QueryMode::Current)
            .collect()
            .await;
        let payloads: Vec<u8> = items.into_iter().map(|i| i.unwrap().event[0]).collect();
        assert_eq!(payloads, vec![1, 1, 2]);
    }

    #[tokio::test]
    async fn all_events_excludes_deleted_rows() {
        let mut config = JournalConfig::default();
        config.safety_window = 0;
        let journal = SqliteJournal::in_memory(config, Arc::new(PassthroughSerializer))
            .await
            .unwrap();

        journal.write_messages(vec![write_one("a", 1)], 0).await;
        journal.write_messages(vec![write_one("a", 2)], 0).await;
        journal.delete("a", 1).await.unwrap();

        let items: Vec<_> = journal
            .all_events(0, QueryMode::Current)
            .collect()
            .await;
        assert_eq!(items.len(), 1);
    }

    #[tokio::test]
    async fn persistence_ids_deduplicates() {
        let mut config = JournalConfig::default();
        config.safety_window = 0;
        let journal = SqliteJournal::in_memory(config, Arc::new(PassthroughSerializer))
            .await
            .unwrap();

        journal.write_messages(vec![write_one("a", 1)], 0).await;
        journal.write_messages(vec![write_one("b", 1)], 0).await;
        journal.write_messages(vec![write_one("a", 2)], 0).await;

        let items: Vec<_> = journal
            .persistence_ids(0, QueryMode::Current)
            .collect()
            .await;
        let ids: Vec<String> = items.into_iter().map(|i| i.unwrap().persistence_id).collect();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
    }

    struct FanOutSerializer;

    impl journal_core::serializer::Serializer for FanOutSerializer {
        fn serialize_single(
            &self,
            event: &PersistentRepr,
            timestamp: i64,
            tag_mode: TagMode,
            write_uuid: uuid::Uuid,
        ) -> Result<JournalRow, JournalError> {
            PassthroughSerializer.serialize_single(event, timestamp, tag_mode, write_uuid)
        }

        fn serialize_for_update(
            &self,
            p: &str,
            s: u64,
            payload: &[u8],
            m: &str,
        ) -> Result<JournalRow, JournalError> {
            PassthroughSerializer.serialize_for_update(p, s, payload, m)
        }

        fn deserialize(
            &self,
            row: &JournalRow,
        ) -> Result<journal_core::model::EventSequence<Vec<u8>>, JournalError> {
            let split: Vec<Vec<u8>> = row.message.iter().map(|b| vec![*b]).collect();
            Ok(journal_core::model::EventSequence::Many(split))
        }
    }

    #[tokio::test]
    async fn adapter_fan_out_expands_one_row_into_many_envelopes() {
        let mut config = JournalConfig::default();
        config.safety_window = 0;
        let journal = SqliteJournal::in_memory(config, Arc::new(FanOutSerializer))
            .await
            .unwrap();

        journal
            .write_messages(
                vec![AtomicWrite {
                    events: vec![PersistentRepr {
                        persistence_id: "a".into(),
                        sequence_number: 1,
                        payload: vec![10, 20, 30],
                        manifest: "m".into(),
                        tags: vec![],
                    }],
                }],
                0,
            )
            .await;

        let items: Vec<_> = journal.all_events(0, QueryMode::Current).collect().await;
        let payloads: Vec<u8> = items.into_iter().map(|i| i.unwrap().event[0]).collect();
        assert_eq!(payloads, vec![10, 20, 30]);
    }
}
