#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **journal-sqlite** – SQLite-backed durable event-sourcing journal.
//!
//! This crate provides the concrete storage driver for the journal
//! described by `journal-core`: a bounded, weight-batching write
//! pipeline with transactional multi-table inserts, a soft-delete
//! protocol with optional legacy-compatibility bookkeeping, and
//! streaming reads (replay-by-id, tag-filtered and unfiltered
//! current/live queries) with ordering-gap tolerance.
//!
//! The database uses up to three tables: `journal_row` for events,
//! `journal_tag_row` for the tag-table layout, and `journal_metadata`
//! for delete-compatibility bookkeeping.

use std::sync::Arc;
use std::time::Duration;

use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

use journal_core::prelude::*;

mod all_events;
mod cursor;
mod delete;
mod errmap;
mod replay;
mod tags;
mod write;

pub use all_events::{AllEventsItem, PersistenceIdsItem};
pub use cursor::QueryMode;
pub use replay::ReplayItem;
pub use tags::TagEventItem;
pub use write::QueuedWrite;

/// The concrete connection source every query and write method reads
/// from: a cheaply-cloneable handle to a pooled SQLite connection set.
///
/// A thin wrapper rather than a bare `SqlitePool` field so the journal
/// has one named place to grow pool-level concerns (e.g. per-call
/// tracing, health checks) without touching every call site.
#[derive(Clone)]
pub struct ConnectionFactory(SqlitePool);

impl ConnectionFactory {
    fn new(pool: SqlitePool) -> Self {
        Self(pool)
    }

    /// The underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.0
    }
}

impl std::ops::Deref for ConnectionFactory {
    type Target = SqlitePool;

    fn deref(&self) -> &SqlitePool {
        &self.0
    }
}

/// A durable event-sourcing journal backed by SQLite.
///
/// Cheaply cloneable: internally reference-counted, so handles can be
/// shared across tasks the way a connection pool is.
#[derive(Clone)]
pub struct SqliteJournal {
    inner: Arc<Inner>,
}

pub(crate) struct Inner {
    pub(crate) pool: ConnectionFactory,
    pub(crate) config: JournalConfig,
    pub(crate) serializer: Arc<dyn Serializer>,
    pub(crate) id_gen: SequentialIdGenerator,
    pub(crate) queue_tx: async_channel::Sender<QueuedWrite>,
}

impl SqliteJournal {
    /// Opens or creates a SQLite database at the given path.
    ///
    /// Runs migrations automatically when `config.auto_initialize` is
    /// set (the default).
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened or migrated.
    pub async fn open<P: AsRef<std::path::Path>>(
        path: P,
        config: JournalConfig,
        serializer: Arc<dyn Serializer>,
    ) -> anyhow::Result<Self> {
        let database_url = format!("sqlite://{}?mode=rwc", path.as_ref().display());
        let pool = SqlitePoolOptions::new()
            .max_connections((config.parallelism as u32).max(1) + 1)
            .connect(&database_url)
            .await?;
        Self::from_pool(pool, config, serializer).await
    }

    /// Opens an in-memory SQLite database. Useful for tests.
    pub async fn in_memory(
        config: JournalConfig,
        serializer: Arc<dyn Serializer>,
    ) -> anyhow::Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::from_pool(pool, config, serializer).await
    }

    /// Creates a journal from an existing pool, so a connection pool can
    /// be shared across multiple components.
    pub async fn from_pool(
        pool: SqlitePool,
        config: JournalConfig,
        serializer: Arc<dyn Serializer>,
    ) -> anyhow::Result<Self> {
        if config.auto_initialize {
            migrate(&pool, &config).await?;
        }

        let (queue_tx, queue_rx) = async_channel::bounded(config.buffer_size.max(1));
        let inner = Arc::new(Inner {
            pool: ConnectionFactory::new(pool),
            id_gen: SequentialIdGenerator::new(),
            queue_tx,
            config,
            serializer,
        });

        write::spawn_workers(Arc::clone(&inner), queue_rx);

        Ok(Self { inner })
    }

    /// Configuration this journal was constructed with.
    pub fn config(&self) -> &JournalConfig {
        &self.inner.config
    }

    pub(crate) fn inner(&self) -> &Inner {
        &self.inner
    }
}

async fn migrate(pool: &SqlitePool, config: &JournalConfig) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS journal_row (
            ordering INTEGER PRIMARY KEY AUTOINCREMENT,
            persistence_id TEXT NOT NULL,
            sequence_number INTEGER NOT NULL,
            timestamp INTEGER NOT NULL,
            deleted INTEGER NOT NULL DEFAULT 0,
            message BLOB NOT NULL,
            manifest TEXT NOT NULL,
            event_manifest INTEGER,
            identifier INTEGER,
            tags TEXT,
            write_uuid BLOB NOT NULL,
            UNIQUE(persistence_id, sequence_number)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_journal_row_pid_seq ON journal_row(persistence_id, sequence_number)",
    )
    .execute(pool)
    .await?;

    if config.tag_mode == TagMode::TagTable {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS journal_tag_row (
                ordering_id INTEGER NOT NULL REFERENCES journal_row(ordering),
                tag_value TEXT NOT NULL,
                persistence_id TEXT NOT NULL,
                sequence_number INTEGER NOT NULL,
                write_uuid BLOB NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_journal_tag_row_tag ON journal_tag_row(tag_value, ordering_id)",
        )
        .execute(pool)
        .await?;
    }

    if config.delete_compatibility_mode {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS journal_metadata (
                persistence_id TEXT NOT NULL,
                sequence_number INTEGER NOT NULL,
                PRIMARY KEY (persistence_id, sequence_number)
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    Ok(())
}

pub(crate) fn refresh_interval(config: &JournalConfig) -> Duration {
    config.refresh_interval
}
