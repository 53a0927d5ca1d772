//! Storage contracts for the governor.
//!
//! The queue store is the single source of truth and the only
//! synchronization primitive between concurrent ticks: every transition is a
//! conditional update that succeeds for exactly one caller.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use crate::error::Result;
use crate::types::{
    ActivityRecord, Cursor, DaySummary, QueueCounts, QueueItem, QueueItemId, RequestId,
    ScoreKey, ScoreKind, ScoreRecord, SignalScope, UnitKey,
};

pub mod memory;
#[cfg(feature = "database")]
pub mod postgres;

pub use memory::InMemoryStore;
#[cfg(feature = "database")]
pub use postgres::PostgresStore;

/// Result of inserting a pending item for a unit.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EnqueueOutcome {
    Inserted(QueueItemId),
    /// Another tick already enqueued a pending item for the unit.
    Existing(QueueItemId),
    /// The competing pending item was claimed before it could be looked up.
    Contended,
}

/// Result of an idempotent activity insert.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InsertOutcome {
    Inserted,
    Duplicate,
}

#[async_trait]
pub trait QueueStore: Send + Sync {
    /// All items for a unit, newest window first.
    async fn items_for_unit(&self, unit: &UnitKey) -> Result<Vec<QueueItem>>;

    async fn insert_pending(&self, item: &QueueItem) -> Result<EnqueueOutcome>;

    async fn get(&self, id: QueueItemId) -> Result<Option<QueueItem>>;

    /// `pending -> running`. Returns `false` when another caller won the race
    /// or the unit already has a running item.
    async fn claim_pending(
        &self,
        id: QueueItemId,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// `error -> pending`, only while `attempts < max_attempts`.
    async fn reset_errored(
        &self,
        id: QueueItemId,
        max_attempts: u32,
    ) -> Result<bool>;

    /// Moves every running item whose lease started before `cutoff` to
    /// `error` and increments its attempts. Returns the reaped items.
    async fn reap_expired(&self, cutoff: DateTime<Utc>) -> Result<Vec<QueueItem>>;

    async fn count_running(&self) -> Result<u64>;

    /// `running -> completed`. Returns `false` if the lease was lost.
    async fn complete(
        &self,
        id: QueueItemId,
        oldest: &Cursor,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    async fn status_counts(&self) -> Result<QueueCounts>;
}

#[async_trait]
pub trait ActivityStore: Send + Sync {
    async fn insert_activity(
        &self,
        record: &ActivityRecord,
    ) -> Result<InsertOutcome>;

    async fn latest_activity_at(
        &self,
        scope: &SignalScope,
        author_id: &str,
    ) -> Result<Option<DateTime<Utc>>>;

    /// Activity with `since <= timestamp <= until`, oldest first.
    async fn activity_window(
        &self,
        scope: &SignalScope,
        author_id: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<ActivityRecord>>;

    async fn day_summary(
        &self,
        scope: &SignalScope,
        author_id: &str,
        day: NaiveDate,
    ) -> Result<DaySummary>;
}

#[async_trait]
pub trait ScoreStore: Send + Sync {
    async fn insert_score(&self, record: &ScoreRecord) -> Result<()>;

    /// Newest `last_updated` among the user's smart rows.
    async fn last_processed(
        &self,
        user_id: &str,
        scope: &SignalScope,
    ) -> Result<Option<DateTime<Utc>>>;

    /// Deletes rows of `kind` sharing `key` except the one produced by
    /// `keep`. Returns the number of deleted rows.
    async fn delete_duplicates(
        &self,
        key: &ScoreKey,
        kind: ScoreKind,
        keep: RequestId,
    ) -> Result<u64>;

    async fn scores_for(&self, key: &ScoreKey) -> Result<Vec<ScoreRecord>>;
}

/// Everything a governor needs from its backing store.
pub trait GovernorStore: QueueStore + ActivityStore + ScoreStore {}

impl<T> GovernorStore for T where T: QueueStore + ActivityStore + ScoreStore {}
