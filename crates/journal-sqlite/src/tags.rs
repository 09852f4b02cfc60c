//! Tag query engine (C7): events-by-tag for both physical tag layouts,
//! current and live. See spec §4.6.

use async_stream::stream;
use futures::stream::Stream;
use sqlx::{Row, SqlitePool};

use journal_core::model::{decode_csv_tags, Envelope, Ordering, TagMode};
use journal_core::prelude::*;

use crate::cursor::{self, QueryMode};
use crate::SqliteJournal;

/// One envelope emitted by [`SqliteJournal::events_by_tag`]:
/// `{ordering, persistence_id, sequence_number, event, timestamp}`
/// (§4.6).
pub type TagEventItem = Envelope<Vec<u8>>;

impl SqliteJournal {
    /// Streams events tagged `tag`, strictly after `offset`, ordered by
    /// `ordering` ascending.
    ///
    /// In [`QueryMode::Current`] the stream terminates once caught up to
    /// the safety-window horizon; in [`QueryMode::Live`] it polls
    /// forever at the configured refresh interval.
    pub fn events_by_tag(
        &self,
        tag: &str,
        offset: u64,
        mode: QueryMode,
    ) -> impl Stream<Item = Result<TagEventItem, JournalError>> {
        let inner = self.inner();
        let pool = inner.pool.clone();
        let serializer = inner.serializer.clone();
        let tag_mode = inner.config.tag_mode;
        let page_size = inner.config.max_buffer_size.max(1) as i64;
        let safety_window = inner.config.safety_window;
        let poll_period = crate::refresh_interval(&inner.config);
        let tag = tag.to_string();

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

                let rows = match fetch_tagged_page(
                    &pool,
                    tag_mode,
                    &tag,
                    last_emitted,
                    upper,
                    page_size,
                )
                .await
                {
                    Ok(rows) => rows,
                    Err(e) => {
                        yield Err(JournalError::Storage(anyhow::Error::new(e)));
                        return;
                    }
                };

                let fetched_full_page = rows.len() as i64 == page_size;
                tracing::debug!(tag = %tag, fetched = rows.len(), upper, "tag poll cycle fetched page");

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
                tracing::debug!(tag = %tag, last_emitted, "tag poll cursor advanced");

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

async fn fetch_tagged_page(
    pool: &SqlitePool,
    tag_mode: TagMode,
    tag: &str,
    after: Ordering,
    upper: Ordering,
    limit: i64,
) -> Result<Vec<JournalRow>, sqlx::Error> {
    let rows = match tag_mode {
        TagMode::Csv => {
            let pattern = format!("%{sep}{tag}{sep}%", sep = CSV_TAG_SEPARATOR, tag = tag);
            sqlx::query(
                r#"
                SELECT ordering, persistence_id, sequence_number, timestamp,
                       deleted, message, manifest, event_manifest, identifier, tags
                FROM journal_row
                WHERE ordering > ? AND ordering <= ? AND deleted = 0 AND tags LIKE ?
                ORDER BY ordering ASC
                LIMIT ?
                "#,
            )
            .bind(after)
            .bind(upper)
            .bind(pattern)
            .bind(limit)
            .fetch_all(pool)
            .await?
        }
        TagMode::TagTable => {
            sqlx::query(
                r#"
                SELECT jr.ordering, jr.persistence_id, jr.sequence_number, jr.timestamp,
                       jr.deleted, jr.message, jr.manifest, jr.event_manifest, jr.identifier, jr.tags
                FROM journal_tag_row jt
                INNER JOIN journal_row jr ON jr.ordering = jt.ordering_id
                WHERE jt.tag_value = ? AND jr.ordering > ? AND jr.ordering <= ? AND jr.deleted = 0
                ORDER BY jr.ordering ASC
                LIMIT ?
                "#,
            )
            .bind(tag)
            .bind(after)
            .bind(upper)
            .bind(limit)
            .fetch_all(pool)
            .await?
        }
    };

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let tags: Option<String> = row.get("tags");
        // Defends against substring false positives the `LIKE` pattern
        // alone could admit under a different separator choice (§4.6).
        if tag_mode == TagMode::Csv {
            let decoded = tags.as_deref().map(decode_csv_tags).unwrap_or_default();
            if !decoded.iter().any(|t| t == tag) {
                continue;
            }
        }
        out.push(JournalRow {
            ordering: Some(row.get("ordering")),
            persistence_id: row.get("persistence_id"),
            sequence_number: row.get::<i64, _>("sequence_number") as u64,
            timestamp: row.get("timestamp"),
            deleted: row.get("deleted"),
            message: row.get("message"),
            manifest: row.get("manifest"),
            event_manifest: row.get("event_manifest"),
            identifier: row.get("identifier"),
            tags,
            tag_array: Vec::new(),
            write_uuid: uuid::Uuid::nil(),
        });
    }
    Ok(out)
}
