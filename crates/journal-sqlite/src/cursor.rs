//! Ordering-gap tolerance shared by the tag query engine (C7) and the
//! all-events query (C8).
//!
//! `ordering` is assigned by SQLite on insert commit, but rows from
//! earlier transactions can become visible after rows from later ones
//! (commit-order skew under concurrent writers). The "safety window"
//! (Issue #502 in the source this crate is modeled on) withholds the
//! most recent `safety_window` orderings from every poll so that a
//! straggling commit has a chance to land before the cursor passes it.

use sqlx::SqlitePool;

use journal_core::model::Ordering;

/// Whether a query stream stops once caught up (`Current`) or polls
/// forever (`Live`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryMode {
    /// Terminates once no further rows are available.
    Current,
    /// Polls indefinitely until the consumer drops the stream.
    Live,
}

/// Returns `max(ordering)` over `journal_row`, or `0` if the table is
/// empty.
pub(crate) async fn max_ordering(pool: &SqlitePool) -> Result<Ordering, sqlx::Error> {
    let max: Option<i64> = sqlx::query_scalar("SELECT MAX(ordering) FROM journal_row")
        .fetch_one(pool)
        .await?;
    Ok(max.unwrap_or(0))
}

/// Computes the inclusive upper bound safe to fetch up to this poll,
/// given the database's current maximum ordering and the configured
/// safety window. Never regresses below `last_emitted`.
pub(crate) fn fetch_upper_bound(
    max_in_db: Ordering,
    last_emitted: Ordering,
    safety_window: Ordering,
) -> Ordering {
    (max_in_db - safety_window).max(last_emitted)
}
