//! Delete protocol (C5): soft-delete range, watermark bookkeeping, and
//! `highest_sequence_nr`. See spec §4.4.

use sqlx::Sqlite;

use journal_core::prelude::*;

use crate::errmap::SqlxResultExt;
use crate::{Inner, SqliteJournal};

impl SqliteJournal {
    /// Soft-deletes `(persistence_id, seq <= max_seq)`, retains exactly
    /// the soft-deleted high-watermark row, and (in compatibility mode)
    /// upserts a metadata row recording the historical maximum so
    /// `highest_sequence_nr` survives the eventual hard-delete.
    pub async fn delete(&self, persistence_id: &str, max_seq: u64) -> Result<(), JournalError> {
        let inner = self.inner();
        let mut tx = inner.pool.begin().await.storage_err()?;

        let outcome = apply_delete(&mut tx, inner, persistence_id, max_seq).await;

        match outcome {
            Ok(()) => {
                tx.commit().await.storage_err()?;
                tracing::debug!(persistence_id, max_seq, "delete committed");
                Ok(())
            }
            Err(e) => match tx.rollback().await {
                Ok(()) => {
                    tracing::warn!(persistence_id, max_seq, error = %e, "delete rolled back");
                    Err(e)
                }
                Err(rollback_err) => Err(JournalError::StorageWithFailedRollback {
                    root_cause: anyhow::anyhow!(e.to_string()),
                    rollback_cause: anyhow::Error::new(rollback_err),
                }),
            },
        }
    }

    /// Returns the highest sequence number known for `persistence_id`,
    /// optionally restricted to sequence numbers greater than
    /// `from_seq`. Returns 0 for an empty journal.
    ///
    /// In compatibility mode, the result is the max over both
    /// `journal_row` and `journal_metadata`, so the watermark survives
    /// a hard-delete that removed every live event row (§4.4, P4).
    pub async fn highest_sequence_nr(
        &self,
        persistence_id: &str,
        from_seq: u64,
    ) -> Result<u64, JournalError> {
        let inner = self.inner();
        let from_seq = from_seq as i64;

        let max: Option<i64> = if inner.config.delete_compatibility_mode {
            if from_seq > 0 {
                sqlx::query_scalar(
                    r#"
                    SELECT MAX(seq) FROM (
                        SELECT MAX(sequence_number) AS seq FROM journal_row
                            WHERE persistence_id = ? AND sequence_number > ?
                        UNION ALL
                        SELECT MAX(sequence_number) AS seq FROM journal_metadata
                            WHERE persistence_id = ? AND sequence_number > ?
                    ) AS combined
                    "#,
                )
                .bind(persistence_id)
                .bind(from_seq)
                .bind(persistence_id)
                .bind(from_seq)
                .fetch_one(inner.pool.pool())
                .await
                .storage_err()?
            } else {
                sqlx::query_scalar(
                    r#"
                    SELECT MAX(seq) FROM (
                        SELECT MAX(sequence_number) AS seq FROM journal_row WHERE persistence_id = ?
                        UNION ALL
                        SELECT MAX(sequence_number) AS seq FROM journal_metadata WHERE persistence_id = ?
                    ) AS combined
                    "#,
                )
                .bind(persistence_id)
                .bind(persistence_id)
                .fetch_one(inner.pool.pool())
                .await
                .storage_err()?
            }
        } else if from_seq > 0 {
            sqlx::query_scalar(
                "SELECT MAX(sequence_number) FROM journal_row WHERE persistence_id = ? AND sequence_number > ?",
            )
            .bind(persistence_id)
            .bind(from_seq)
            .fetch_one(inner.pool.pool())
            .await
            .storage_err()?
        } else {
            sqlx::query_scalar(
                "SELECT MAX(sequence_number) FROM journal_row WHERE persistence_id = ?",
            )
            .bind(persistence_id)
            .fetch_one(inner.pool.pool())
            .await
            .storage_err()?
        };

        Ok(max.unwrap_or(0) as u64)
    }
}

async fn apply_delete(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    inner: &Inner,
    persistence_id: &str,
    max_seq: u64,
) -> Result<(), JournalError> {
    sqlx::query("UPDATE journal_row SET deleted = 1 WHERE persistence_id = ? AND sequence_number <= ?")
        .bind(persistence_id)
        .bind(max_seq as i64)
        .execute(&mut **tx)
        .await
        .storage_err()?;

    let max_marked: Option<i64> = sqlx::query_scalar(
        "SELECT MAX(sequence_number) FROM journal_row WHERE persistence_id = ? AND deleted = 1",
    )
    .bind(persistence_id)
    .fetch_one(&mut **tx)
    .await
    .storage_err()?;

    let Some(max_marked) = max_marked else {
        // Nothing was ever written under this persistence id; nothing to
        // hard-delete or record.
        tracing::debug!(persistence_id, "soft-delete touched no rows");
        return Ok(());
    };
    tracing::debug!(persistence_id, max_marked, "soft-delete watermark recorded");

    if inner.config.delete_compatibility_mode {
        sqlx::query(
            r#"
            INSERT INTO journal_metadata (persistence_id, sequence_number)
            VALUES (?, ?)
            ON CONFLICT (persistence_id, sequence_number) DO NOTHING
            "#,
        )
        .bind(persistence_id)
        .bind(max_marked)
        .execute(&mut **tx)
        .await
        .storage_err()?;
    }

    // Hard-delete everything at or below max_seq except the retained
    // high-watermark row itself.
    sqlx::query(
        "DELETE FROM journal_row WHERE persistence_id = ? AND sequence_number <= ? AND sequence_number < ?",
    )
    .bind(persistence_id)
    .bind(max_seq as i64)
    .bind(max_marked)
    .execute(&mut **tx)
    .await
    .storage_err()?;
    tracing::debug!(persistence_id, max_seq, "hard-delete phase complete");

    if inner.config.delete_compatibility_mode {
        sqlx::query("DELETE FROM journal_metadata WHERE persistence_id = ? AND sequence_number < ?")
            .bind(persistence_id)
            .bind(max_marked)
            .execute(&mut **tx)
            .await
            .storage_err()?;
    }

    if inner.config.tag_mode == TagMode::TagTable {
        sqlx::query("DELETE FROM journal_tag_row WHERE persistence_id = ? AND sequence_number <= ?")
            .bind(persistence_id)
            .bind(max_seq as i64)
            .execute(&mut **tx)
            .await
            .storage_err()?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

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
    async fn highest_sequence_nr_is_zero_for_empty_journal() {
        let journal = SqliteJournal::in_memory(JournalConfig::default(), Arc::new(PassthroughSerializer))
            .await
            .unwrap();
        assert_eq!(journal.highest_sequence_nr("ghost", 0).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn delete_hides_rows_but_preserves_high_water_mark() {
        let journal = SqliteJournal::in_memory(JournalConfig::default(), Arc::new(PassthroughSerializer))
            .await
            .unwrap();

        for seq in 1..=5 {
            journal.write_messages(vec![write_one("p", seq)], 0).await;
        }

        journal.delete("p", 3).await.unwrap();

        let remaining: Vec<i64> = sqlx::query_scalar(
            "SELECT sequence_number FROM journal_row WHERE persistence_id = 'p' AND deleted = 0 ORDER BY sequence_number",
        )
        .fetch_all(journal.inner().pool.pool())
        .await
        .unwrap();
        assert_eq!(remaining, vec![4, 5]);

        assert_eq!(journal.highest_sequence_nr("p", 0).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn compat_mode_survives_deleting_every_event() {
        let mut config = JournalConfig::default();
        config.delete_compatibility_mode = true;
        let journal = SqliteJournal::in_memory(config, Arc::new(PassthroughSerializer))
            .await
            .unwrap();

        for seq in 1..=3 {
            journal.write_messages(vec![write_one("p", seq)], 0).await;
        }

        journal.delete("p", 3).await.unwrap();
        assert_eq!(journal.highest_sequence_nr("p", 0).await.unwrap(), 3);

        // Only the retained high-water-mark row (seq 3, soft-deleted)
        // should remain, plus its metadata row.
        let row_count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM journal_row WHERE persistence_id = 'p'",
        )
        .fetch_one(journal.inner().pool.pool())
        .await
        .unwrap();
        assert_eq!(row_count, 1);

        let meta_count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM journal_metadata WHERE persistence_id = 'p'",
        )
        .fetch_one(journal.inner().pool.pool())
        .await
        .unwrap();
        assert_eq!(meta_count, 1);
    }

    #[tokio::test]
    async fn tag_rows_are_cleaned_up_on_delete() {
        let journal = SqliteJournal::in_memory(JournalConfig::default(), Arc::new(PassthroughSerializer))
            .await
            .unwrap();

        journal
            .write_messages(
                vec![AtomicWrite {
                    events: vec![PersistentRepr {
                        persistence_id: "p".into(),
                        sequence_number: 1,
                        payload: b"x".to_vec(),
                        manifest: "m".into(),
                        tags: vec!["blue".into()],
                    }],
                }],
                0,
            )
            .await;

        journal.delete("p", 1).await.unwrap();

        let tag_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM journal_tag_row")
            .fetch_one(journal.inner().pool.pool())
            .await
            .unwrap();
        assert_eq!(tag_count, 0);
    }
}
