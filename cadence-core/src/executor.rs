//! Fetch executor: runs one bounded batch for a claimed queue item.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::adapter::GovernedUnit;
use crate::error::Result;
use crate::store::{ActivityStore, InsertOutcome, QueueStore, ScoreStore};
use crate::types::{ActivityRecord, Cursor, QueueItem, ScoreKey, ScoreKind, ScoreRecord};

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BatchOutcome {
    pub fetched: usize,
    pub stored: usize,
    pub duplicates: usize,
    /// Low-water mark recorded on the item.
    pub oldest: Cursor,
    /// The source returned nothing older than the window's anchor.
    pub exhausted: bool,
    /// `false` when the lease was lost before completion could be recorded.
    pub completed: bool,
    /// Authors seen in the batch, stored or already present, in a stable
    /// order.
    pub authors: Vec<String>,
}

pub struct FetchExecutor<S> {
    store: Arc<S>,
    page_size: usize,
}

impl<S> std::fmt::Debug for FetchExecutor<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchExecutor")
            .field("page_size", &self.page_size)
            .finish()
    }
}

impl<S> Clone for FetchExecutor<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            page_size: self.page_size,
        }
    }
}

impl<S: QueueStore + ActivityStore + ScoreStore> FetchExecutor<S> {
    pub fn new(store: Arc<S>, page_size: usize) -> Self {
        Self { store, page_size }
    }

    /// Fetch one page older than the item's newest cursor, store it, upsert
    /// raw day scores for every author and day in the batch, then complete
    /// the item.
    ///
    /// Errors propagate without touching the item: it stays `running` until
    /// the lease reaper moves it to `error`. A retried batch finds its
    /// activity already stored and still rebuilds the derived scores.
    ///
    /// `now` is the tick clock; the item's `finished_at` is `now` plus the
    /// time this call took.
    pub async fn execute(
        &self,
        item: &QueueItem,
        unit: &GovernedUnit,
        now: DateTime<Utc>,
    ) -> Result<BatchOutcome> {
        let started = Instant::now();
        let adapter = &unit.adapter;
        let page = adapter
            .fetch_page(&unit.context, &item.newest_cursor, self.page_size)
            .await?;
        let fetched = page.activity.len();

        let mut stored = 0;
        let mut duplicates = 0;
        let mut oldest = item.newest_cursor.clone();
        let mut touched: BTreeMap<String, BTreeSet<NaiveDate>> = BTreeMap::new();

        for activity in page.activity {
            let cursor = activity.cursor();
            if adapter.cursor_ordering(&cursor, &oldest).is_lt() {
                oldest = cursor;
            }

            let record = ActivityRecord {
                unit: item.unit.clone(),
                scope: unit.context.scope.clone(),
                external_id: activity.external_id,
                author_id: activity.author_id,
                content: activity.content,
                timestamp: activity.timestamp,
            };
            match self.store.insert_activity(&record).await? {
                InsertOutcome::Inserted => stored += 1,
                InsertOutcome::Duplicate => {
                    duplicates += 1;
                    debug!(
                        unit = %item.unit,
                        external_id = %record.external_id,
                        "activity already stored"
                    );
                }
            }
            touched
                .entry(record.author_id)
                .or_default()
                .insert(record.timestamp.date_naive());
        }

        // Filtered platforms may scan past items they do not return.
        if let Some(scanned_to) = page.scanned_to
            && adapter.cursor_ordering(&scanned_to, &oldest).is_lt()
        {
            oldest = scanned_to;
        }

        let finished_at = now
            + chrono::Duration::from_std(started.elapsed())
                .unwrap_or_else(|_| chrono::Duration::zero());

        for (author, days) in &touched {
            for day in days {
                self.upsert_raw_score(unit, author, *day, finished_at).await?;
            }
        }

        let exhausted = oldest == item.newest_cursor;
        let completed = self.store.complete(item.id, &oldest, finished_at).await?;
        if completed {
            info!(
                item_id = %item.id,
                unit = %item.unit,
                platform = adapter.name(),
                fetched,
                stored,
                duplicates,
                oldest = %oldest,
                exhausted,
                "window completed"
            );
        } else {
            warn!(
                item_id = %item.id,
                unit = %item.unit,
                "lease lost before completion; batch will be refetched"
            );
        }

        Ok(BatchOutcome {
            fetched,
            stored,
            duplicates,
            oldest,
            exhausted,
            completed,
            authors: touched.into_keys().collect(),
        })
    }

    /// A raw row holds the author's activity count for the day.
    async fn upsert_raw_score(
        &self,
        unit: &GovernedUnit,
        author: &str,
        day: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let scope = &unit.context.scope;
        let summary = self.store.day_summary(scope, author, day).await?;
        let key = ScoreKey::new(author, scope, day);
        let record =
            ScoreRecord::raw(key.clone(), summary.count as f64, summary.latest.unwrap_or(now));
        self.store.insert_score(&record).await?;
        self.store
            .delete_duplicates(&key, ScoreKind::Raw, record.request_id)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{
        FetchError, FetchedActivity, FetchedPage, PlatformAdapter, UnitContext,
    };
    use crate::store::InMemoryStore;
    use crate::types::{QueueStatus, SignalScope, UnitKey};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use url::Url;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().expect("valid timestamp")
    }

    #[derive(Debug)]
    struct FixedBatch(Vec<FetchedActivity>);

    #[async_trait]
    impl PlatformAdapter for FixedBatch {
        fn name(&self) -> &'static str {
            "fixed"
        }

        async fn fetch_activity(
            &self,
            _context: &UnitContext,
            before: &Cursor,
            limit: usize,
        ) -> std::result::Result<Vec<FetchedActivity>, FetchError> {
            Ok(self
                .0
                .iter()
                .filter(|a| &a.cursor() < before)
                .take(limit)
                .cloned()
                .collect())
        }
    }

    #[derive(Debug)]
    struct Offline;

    #[async_trait]
    impl PlatformAdapter for Offline {
        fn name(&self) -> &'static str {
            "offline"
        }

        async fn fetch_activity(
            &self,
            _context: &UnitContext,
            _before: &Cursor,
            _limit: usize,
        ) -> std::result::Result<Vec<FetchedActivity>, FetchError> {
            Err(FetchError::Status {
                status: 503,
                body: "maintenance".into(),
            })
        }
    }

    fn unit(adapter: Arc<dyn PlatformAdapter>) -> GovernedUnit {
        GovernedUnit::new(
            UnitContext {
                key: UnitKey::new("guild", "general"),
                scope: SignalScope::new("p1", "discord"),
                endpoint: Url::parse("http://localhost/").unwrap(),
                credentials: None,
            },
            adapter,
        )
    }

    fn message(id: &str, author: &str, secs: i64) -> FetchedActivity {
        FetchedActivity {
            external_id: id.into(),
            author_id: author.into(),
            content: format!("message {id}"),
            timestamp: ts(secs),
        }
    }

    async fn claimed(store: &InMemoryStore, unit: &GovernedUnit, now: i64) -> QueueItem {
        let item = QueueItem::pending(unit.key(), Cursor::at(ts(now)), ts(now));
        store.insert_pending(&item).await.unwrap();
        assert!(store.claim_pending(item.id, ts(now)).await.unwrap());
        item
    }

    #[tokio::test]
    async fn stores_batch_and_records_low_water_mark() {
        let store = Arc::new(InMemoryStore::new());
        let unit = unit(Arc::new(FixedBatch(vec![
            message("m3", "alice", 300),
            message("m2", "bob", 200),
            message("m1", "alice", 100),
        ])));
        let item = claimed(&store, &unit, 1_000).await;
        let executor = FetchExecutor::new(Arc::clone(&store), 10);

        let outcome = executor.execute(&item, &unit, ts(1_000)).await.unwrap();
        assert_eq!(outcome.stored, 3);
        assert_eq!(outcome.oldest, Cursor::new(ts(100), "m1"));
        assert_eq!(outcome.authors, vec!["alice".to_string(), "bob".to_string()]);
        assert!(outcome.completed);

        let done = store.get(item.id).await.unwrap().unwrap();
        assert_eq!(done.status, QueueStatus::Completed);
        assert_eq!(done.oldest_cursor, Some(Cursor::new(ts(100), "m1")));

        let key = ScoreKey::new("alice", &unit.context.scope, ts(0).date_naive());
        let raw = store.scores_for(&key).await.unwrap();
        assert_eq!(raw.len(), 1);
        assert_eq!(raw[0].raw_value, Some(2.0));
    }

    #[tokio::test]
    async fn refetched_activity_counts_as_duplicates() {
        let store = Arc::new(InMemoryStore::new());
        let unit = unit(Arc::new(FixedBatch(vec![message("m1", "alice", 100)])));
        let executor = FetchExecutor::new(Arc::clone(&store), 10);

        let first = claimed(&store, &unit, 1_000).await;
        executor.execute(&first, &unit, ts(1_000)).await.unwrap();

        let second = claimed(&store, &unit, 2_000).await;
        let outcome = executor.execute(&second, &unit, ts(2_000)).await.unwrap();
        assert_eq!(outcome.stored, 0);
        assert_eq!(outcome.duplicates, 1);
        assert_eq!(outcome.authors, vec!["alice".to_string()]);
        assert_eq!(store.activity_count().await, 1);

        let key = ScoreKey::new("alice", &unit.context.scope, ts(100).date_naive());
        let raw = store.scores_for(&key).await.unwrap();
        assert_eq!(raw.len(), 1);
        assert_eq!(raw[0].raw_value, Some(1.0));
    }

    #[tokio::test]
    async fn retried_batch_rebuilds_raw_scores_lost_with_the_lease() {
        let store = Arc::new(InMemoryStore::new());
        let unit = unit(Arc::new(FixedBatch(vec![
            message("m2", "bob", 200),
            message("m1", "alice", 100),
        ])));
        // A previous run stored the activity, then died before scoring.
        for activity in [message("m2", "bob", 200), message("m1", "alice", 100)] {
            store
                .insert_activity(&ActivityRecord {
                    unit: unit.key(),
                    scope: unit.context.scope.clone(),
                    external_id: activity.external_id,
                    author_id: activity.author_id,
                    content: activity.content,
                    timestamp: activity.timestamp,
                })
                .await
                .unwrap();
        }

        let item = claimed(&store, &unit, 1_000).await;
        let outcome = FetchExecutor::new(Arc::clone(&store), 10)
            .execute(&item, &unit, ts(1_000))
            .await
            .unwrap();
        assert_eq!(outcome.duplicates, 2);
        assert_eq!(outcome.authors, vec!["alice".to_string(), "bob".to_string()]);

        for author in ["alice", "bob"] {
            let key = ScoreKey::new(author, &unit.context.scope, ts(0).date_naive());
            let raw = store.scores_for(&key).await.unwrap();
            assert_eq!(raw.len(), 1, "{author} has one raw row");
        }
    }

    #[derive(Debug)]
    struct SparseCategory {
        scanned_to: Cursor,
    }

    #[async_trait]
    impl PlatformAdapter for SparseCategory {
        fn name(&self) -> &'static str {
            "sparse"
        }

        async fn fetch_activity(
            &self,
            _context: &UnitContext,
            _before: &Cursor,
            _limit: usize,
        ) -> std::result::Result<Vec<FetchedActivity>, FetchError> {
            Ok(Vec::new())
        }

        async fn fetch_page(
            &self,
            _context: &UnitContext,
            _before: &Cursor,
            _limit: usize,
        ) -> std::result::Result<FetchedPage, FetchError> {
            Ok(FetchedPage {
                activity: Vec::new(),
                scanned_to: Some(self.scanned_to.clone()),
            })
        }
    }

    #[tokio::test]
    async fn empty_filtered_page_advances_to_scanned_position() {
        let store = Arc::new(InMemoryStore::new());
        let scanned_to = Cursor::new(ts(400), "41");
        let unit = unit(Arc::new(SparseCategory {
            scanned_to: scanned_to.clone(),
        }));
        let item = claimed(&store, &unit, 1_000).await;

        let outcome = FetchExecutor::new(Arc::clone(&store), 10)
            .execute(&item, &unit, ts(1_000))
            .await
            .unwrap();
        assert_eq!(outcome.fetched, 0);
        assert!(!outcome.exhausted);
        assert_eq!(outcome.oldest, scanned_to);

        let done = store.get(item.id).await.unwrap().unwrap();
        assert_eq!(done.status, QueueStatus::Completed);
        assert!(!done.is_exhausted());
    }

    #[derive(Debug)]
    struct SlowFeed;

    #[async_trait]
    impl PlatformAdapter for SlowFeed {
        fn name(&self) -> &'static str {
            "slow"
        }

        async fn fetch_activity(
            &self,
            _context: &UnitContext,
            _before: &Cursor,
            _limit: usize,
        ) -> std::result::Result<Vec<FetchedActivity>, FetchError> {
            tokio::time::sleep(std::time::Duration::from_secs(30)).await;
            Ok(vec![message("m1", "alice", 100)])
        }
    }

    #[tokio::test(start_paused = true)]
    async fn finished_at_includes_fetch_time() {
        let store = Arc::new(InMemoryStore::new());
        let unit = unit(Arc::new(SlowFeed));
        let item = claimed(&store, &unit, 1_000).await;

        FetchExecutor::new(Arc::clone(&store), 10)
            .execute(&item, &unit, ts(1_000))
            .await
            .unwrap();

        let done = store.get(item.id).await.unwrap().unwrap();
        assert_eq!(done.started_at, Some(ts(1_000)));
        assert_eq!(done.finished_at, Some(ts(1_030)));
    }

    #[tokio::test]
    async fn empty_batch_marks_window_exhausted() {
        let store = Arc::new(InMemoryStore::new());
        let unit = unit(Arc::new(FixedBatch(Vec::new())));
        let item = claimed(&store, &unit, 1_000).await;

        let outcome = FetchExecutor::new(Arc::clone(&store), 10)
            .execute(&item, &unit, ts(1_000))
            .await
            .unwrap();
        assert!(outcome.exhausted);
        assert_eq!(outcome.oldest, item.newest_cursor);
        assert!(store.get(item.id).await.unwrap().unwrap().is_exhausted());
    }

    #[tokio::test]
    async fn fetch_error_leaves_item_running() {
        let store = Arc::new(InMemoryStore::new());
        let unit = unit(Arc::new(Offline));
        let item = claimed(&store, &unit, 1_000).await;

        let result = FetchExecutor::new(Arc::clone(&store), 10)
            .execute(&item, &unit, ts(1_000))
            .await;
        assert!(matches!(result, Err(crate::CadenceError::Fetch(_))));
        assert_eq!(
            store.get(item.id).await.unwrap().unwrap().status,
            QueueStatus::Running
        );
    }
}
