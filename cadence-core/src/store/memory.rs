use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::Mutex;

use super::{
    ActivityStore, EnqueueOutcome, InsertOutcome, QueueStore, ScoreStore,
};
use crate::error::Result;
use crate::types::{
    ActivityRecord, Cursor, DaySummary, QueueCounts, QueueItem, QueueItemId,
    QueueStatus, RequestId, ScoreKey, ScoreKind, ScoreRecord, SignalScope,
    UnitKey,
};

/// Process-local store with the same conditional-update semantics as the
/// Postgres backend. Clones share state.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("InMemoryStore");

        match self.state.try_lock() {
            Ok(state) => {
                debug
                    .field("items", &state.items.len())
                    .field("activity", &state.activity.len())
                    .field("scores", &state.scores.len());
            }
            Err(_) => {
                debug.field("state", &"<locked>");
            }
        }

        debug.finish()
    }
}

type ActivityKey = (SignalScope, String);

#[derive(Debug, Default)]
struct MemoryState {
    items: Vec<QueueItem>,
    activity: BTreeMap<ActivityKey, ActivityRecord>,
    scores: Vec<ScoreRecord>,
}

impl MemoryState {
    fn has_status(&self, unit: &UnitKey, status: QueueStatus) -> bool {
        self.items
            .iter()
            .any(|item| item.status == status && &item.unit == unit)
    }

    fn item_mut(&mut self, id: QueueItemId) -> Option<&mut QueueItem> {
        self.items.iter_mut().find(|item| item.id == id)
    }

    fn authored<'a>(
        &'a self,
        scope: &'a SignalScope,
        author_id: &'a str,
    ) -> impl Iterator<Item = &'a ActivityRecord> + 'a {
        self.activity
            .values()
            .filter(move |r| &r.scope == scope && r.author_id == author_id)
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every queue item, in insertion order.
    pub async fn all_items(&self) -> Vec<QueueItem> {
        self.state.lock().await.items.clone()
    }

    pub async fn activity_count(&self) -> usize {
        self.state.lock().await.activity.len()
    }
}

#[async_trait]
impl QueueStore for InMemoryStore {
    async fn items_for_unit(&self, unit: &UnitKey) -> Result<Vec<QueueItem>> {
        let state = self.state.lock().await;
        let mut items: Vec<QueueItem> = state
            .items
            .iter()
            .filter(|item| &item.unit == unit)
            .cloned()
            .collect();
        items.sort_by(|a, b| b.newest_cursor.cmp(&a.newest_cursor));
        Ok(items)
    }

    async fn insert_pending(&self, item: &QueueItem) -> Result<EnqueueOutcome> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.items.iter().find(|candidate| {
            candidate.status == QueueStatus::Pending
                && candidate.unit == item.unit
        }) {
            return Ok(EnqueueOutcome::Existing(existing.id));
        }

        let mut pending = item.clone();
        pending.status = QueueStatus::Pending;
        state.items.push(pending);
        Ok(EnqueueOutcome::Inserted(item.id))
    }

    async fn get(&self, id: QueueItemId) -> Result<Option<QueueItem>> {
        let state = self.state.lock().await;
        Ok(state.items.iter().find(|item| item.id == id).cloned())
    }

    async fn claim_pending(
        &self,
        id: QueueItemId,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        let Some(unit) = state
            .items
            .iter()
            .find(|item| item.id == id && item.status == QueueStatus::Pending)
            .map(|item| item.unit.clone())
        else {
            return Ok(false);
        };

        if state.has_status(&unit, QueueStatus::Running) {
            return Ok(false);
        }

        if let Some(item) = state.item_mut(id) {
            item.status = QueueStatus::Running;
            item.started_at = Some(now);
        }
        Ok(true)
    }

    async fn reset_errored(
        &self,
        id: QueueItemId,
        max_attempts: u32,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        let Some(unit) = state
            .items
            .iter()
            .find(|item| {
                item.id == id
                    && item.status == QueueStatus::Error
                    && item.attempts < max_attempts
            })
            .map(|item| item.unit.clone())
        else {
            return Ok(false);
        };

        if state.has_status(&unit, QueueStatus::Pending) {
            return Ok(false);
        }

        if let Some(item) = state.item_mut(id) {
            item.status = QueueStatus::Pending;
            item.started_at = None;
        }
        Ok(true)
    }

    async fn reap_expired(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<QueueItem>> {
        let mut state = self.state.lock().await;
        let mut reaped = Vec::new();
        for item in state.items.iter_mut() {
            let expired = item.status == QueueStatus::Running
                && item.started_at.is_some_and(|started| started < cutoff);
            if expired {
                item.status = QueueStatus::Error;
                item.attempts = item.attempts.saturating_add(1);
                reaped.push(item.clone());
            }
        }
        Ok(reaped)
    }

    async fn count_running(&self) -> Result<u64> {
        let state = self.state.lock().await;
        Ok(state
            .items
            .iter()
            .filter(|item| item.status == QueueStatus::Running)
            .count() as u64)
    }

    async fn complete(
        &self,
        id: QueueItemId,
        oldest: &Cursor,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.item_mut(id) {
            Some(item) if item.status == QueueStatus::Running => {
                item.status = QueueStatus::Completed;
                item.oldest_cursor = Some(oldest.clone());
                item.finished_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn status_counts(&self) -> Result<QueueCounts> {
        let state = self.state.lock().await;
        let mut counts = QueueCounts::default();
        for item in &state.items {
            counts.record(item.status, 1);
        }
        Ok(counts)
    }
}

#[async_trait]
impl ActivityStore for InMemoryStore {
    async fn insert_activity(
        &self,
        record: &ActivityRecord,
    ) -> Result<InsertOutcome> {
        let mut state = self.state.lock().await;
        let key = (record.scope.clone(), record.external_id.clone());
        if state.activity.contains_key(&key) {
            return Ok(InsertOutcome::Duplicate);
        }
        state.activity.insert(key, record.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn latest_activity_at(
        &self,
        scope: &SignalScope,
        author_id: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        let state = self.state.lock().await;
        Ok(state.authored(scope, author_id).map(|r| r.timestamp).max())
    }

    async fn activity_window(
        &self,
        scope: &SignalScope,
        author_id: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<ActivityRecord>> {
        let state = self.state.lock().await;
        let mut window: Vec<ActivityRecord> = state
            .authored(scope, author_id)
            .filter(|r| r.timestamp >= since && r.timestamp <= until)
            .cloned()
            .collect();
        window.sort_by(|a, b| a.cursor().cmp(&b.cursor()));
        Ok(window)
    }

    async fn day_summary(
        &self,
        scope: &SignalScope,
        author_id: &str,
        day: NaiveDate,
    ) -> Result<DaySummary> {
        let state = self.state.lock().await;
        let mut summary = DaySummary::default();
        for record in state
            .authored(scope, author_id)
            .filter(|r| r.timestamp.date_naive() == day)
        {
            summary.count += 1;
            summary.latest = summary.latest.max(Some(record.timestamp));
        }
        Ok(summary)
    }
}

#[async_trait]
impl ScoreStore for InMemoryStore {
    async fn insert_score(&self, record: &ScoreRecord) -> Result<()> {
        let mut state = self.state.lock().await;
        state.scores.push(record.clone());
        Ok(())
    }

    async fn last_processed(
        &self,
        user_id: &str,
        scope: &SignalScope,
    ) -> Result<Option<DateTime<Utc>>> {
        let state = self.state.lock().await;
        Ok(state
            .scores
            .iter()
            .filter(|s| {
                s.kind() == ScoreKind::Smart
                    && s.key.user_id == user_id
                    && s.key.project_id == scope.project_id
                    && s.key.signal_source_id == scope.signal_source_id
            })
            .map(|s| s.last_updated)
            .max())
    }

    async fn delete_duplicates(
        &self,
        key: &ScoreKey,
        kind: ScoreKind,
        keep: RequestId,
    ) -> Result<u64> {
        let mut state = self.state.lock().await;
        let before = state.scores.len();
        state.scores.retain(|s| {
            !(&s.key == key && s.kind() == kind && s.request_id != keep)
        });
        Ok((before - state.scores.len()) as u64)
    }

    async fn scores_for(&self, key: &ScoreKey) -> Result<Vec<ScoreRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .scores
            .iter()
            .filter(|s| &s.key == key)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().expect("valid timestamp")
    }

    fn unit() -> UnitKey {
        UnitKey::new("guild", "channel")
    }

    #[tokio::test]
    async fn only_one_pending_item_per_unit() {
        let store = InMemoryStore::new();
        let first = QueueItem::pending(unit(), Cursor::at(ts(100)), ts(100));
        let second = QueueItem::pending(unit(), Cursor::at(ts(90)), ts(100));

        assert_eq!(
            store.insert_pending(&first).await.unwrap(),
            EnqueueOutcome::Inserted(first.id)
        );
        assert_eq!(
            store.insert_pending(&second).await.unwrap(),
            EnqueueOutcome::Existing(first.id)
        );
    }

    #[tokio::test]
    async fn claim_is_first_writer_wins() {
        let store = InMemoryStore::new();
        let item = QueueItem::pending(unit(), Cursor::at(ts(100)), ts(100));
        store.insert_pending(&item).await.unwrap();

        assert!(store.claim_pending(item.id, ts(101)).await.unwrap());
        assert!(!store.claim_pending(item.id, ts(102)).await.unwrap());

        let claimed = store.get(item.id).await.unwrap().unwrap();
        assert_eq!(claimed.status, QueueStatus::Running);
        assert_eq!(claimed.started_at, Some(ts(101)));
    }

    #[tokio::test]
    async fn claim_refuses_second_running_item_for_unit() {
        let store = InMemoryStore::new();
        let running = QueueItem::pending(unit(), Cursor::at(ts(100)), ts(100));
        store.insert_pending(&running).await.unwrap();
        assert!(store.claim_pending(running.id, ts(100)).await.unwrap());

        let next = QueueItem::pending(unit(), Cursor::at(ts(50)), ts(100));
        store.insert_pending(&next).await.unwrap();
        assert!(!store.claim_pending(next.id, ts(101)).await.unwrap());
    }

    #[tokio::test]
    async fn duplicate_activity_is_an_outcome() {
        let store = InMemoryStore::new();
        let record = ActivityRecord {
            unit: unit(),
            scope: SignalScope::new("p1", "discord"),
            external_id: "m1".into(),
            author_id: "u1".into(),
            content: "hello".into(),
            timestamp: ts(10),
        };

        assert_eq!(
            store.insert_activity(&record).await.unwrap(),
            InsertOutcome::Inserted
        );
        assert_eq!(
            store.insert_activity(&record).await.unwrap(),
            InsertOutcome::Duplicate
        );
        assert_eq!(store.activity_count().await, 1);
    }
}
