//! Journal configuration (spec §6).

use std::time::Duration;

use crate::model::TagMode;

/// Dialect selector. Controls bulk-copy strategy and the
/// `use_clone_connection` workaround flag; concrete SQL emission for
/// dialects other than sqlite is out of scope for this crate (spec §1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    /// Microsoft SQL Server 2017+.
    SqlServer2017,
    /// Microsoft.Data.Sqlite provider.
    SqliteMs,
    /// System.Data.SQLite provider.
    SqliteClassic,
    /// PostgreSQL.
    Postgres,
    /// MySQL / MariaDB.
    MySql,
}

/// Full configuration surface for a journal instance.
#[derive(Debug, Clone)]
pub struct JournalConfig {
    /// Dialect selector; informs bulk-copy strategy only.
    pub provider: ProviderKind,
    /// Write-pipeline concurrency (bounded-parallelism DB-write stage).
    pub parallelism: usize,
    /// Write queue capacity; overflow uses drop-newest (§5, P7).
    pub buffer_size: usize,
    /// Max rows per write transaction in the weight-batching stage.
    pub batch_size: usize,
    /// Row-count threshold above which a bulk insert chunks through the
    /// default bulk-copy strategy rather than a single multi-row insert.
    pub max_row_by_row_size: usize,
    /// Max rows per bulk-copy round trip for the event table.
    pub db_round_trip_batch_size: usize,
    /// Max rows per bulk-copy round trip for the tag table.
    pub db_round_trip_tag_batch_size: usize,
    /// Layout selector; fixed at bootstrap (invariant I4).
    pub tag_mode: TagMode,
    /// Enables the metadata-table delete-compatibility protocol.
    pub delete_compatibility_mode: bool,
    /// Live-query polling period.
    pub refresh_interval: Duration,
    /// Page size for query streams.
    pub max_buffer_size: usize,
    /// Run DDL on startup.
    pub auto_initialize: bool,
    /// Number of orderings to hold back from live-query emission to
    /// tolerate commit-order/ordering-assignment skew (§4.6).
    pub safety_window: i64,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::SqliteMs,
            parallelism: 2,
            buffer_size: 4096,
            batch_size: 256,
            max_row_by_row_size: 64,
            db_round_trip_batch_size: 512,
            db_round_trip_tag_batch_size: 512,
            tag_mode: TagMode::TagTable,
            delete_compatibility_mode: false,
            refresh_interval: Duration::from_millis(500),
            max_buffer_size: 256,
            auto_initialize: true,
            safety_window: 1,
        }
    }
}
