#![cfg(feature = "postgres-tests")]

use chrono::{DateTime, TimeZone, Utc};
use sqlx::PgPool;

use cadence_core::store::{
    ActivityStore, EnqueueOutcome, InsertOutcome, PostgresStore, QueueStore, ScoreStore,
};
use cadence_core::types::{
    ActivityRecord, Cursor, QueueItem, QueueStatus, ScoreKey, ScoreKind, ScoreRecord,
    SignalScope, UnitKey,
};

fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().expect("valid timestamp")
}

fn unit(channel: &str) -> UnitKey {
    UnitKey::new("guild", channel)
}

#[sqlx::test(migrator = "cadence_core::MIGRATOR")]
async fn store_initializes_against_migrated_schema(pool: PgPool) {
    PostgresStore::new(pool)
        .await
        .expect("store should connect and validate schema");
}

#[sqlx::test(migrator = "cadence_core::MIGRATOR")]
async fn second_pending_item_merges_into_first(pool: PgPool) {
    let store = PostgresStore::new(pool).await.expect("store");
    let first = QueueItem::pending(unit("general"), Cursor::at(ts(1_000)), ts(1_000));
    let second = QueueItem::pending(unit("general"), Cursor::at(ts(2_000)), ts(2_000));

    assert_eq!(
        store.insert_pending(&first).await.unwrap(),
        EnqueueOutcome::Inserted(first.id)
    );
    assert_eq!(
        store.insert_pending(&second).await.unwrap(),
        EnqueueOutcome::Existing(first.id)
    );
}

#[sqlx::test(migrator = "cadence_core::MIGRATOR")]
async fn claim_is_first_writer_wins(pool: PgPool) {
    let store = PostgresStore::new(pool).await.expect("store");
    let item = QueueItem::pending(unit("general"), Cursor::at(ts(1_000)), ts(1_000));
    store.insert_pending(&item).await.unwrap();

    let (a, b) = tokio::join!(
        store.claim_pending(item.id, ts(1_001)),
        store.claim_pending(item.id, ts(1_001))
    );
    let wins = [a.unwrap(), b.unwrap()].iter().filter(|won| **won).count();
    assert_eq!(wins, 1);

    let running = store.get(item.id).await.unwrap().expect("item exists");
    assert_eq!(running.status, QueueStatus::Running);
    assert_eq!(running.started_at, Some(ts(1_001)));
    assert_eq!(store.count_running().await.unwrap(), 1);
}

#[sqlx::test(migrator = "cadence_core::MIGRATOR")]
async fn unit_never_holds_two_running_items(pool: PgPool) {
    let store = PostgresStore::new(pool).await.expect("store");
    let first = QueueItem::pending(unit("general"), Cursor::at(ts(1_000)), ts(1_000));
    store.insert_pending(&first).await.unwrap();
    assert!(store.claim_pending(first.id, ts(1_000)).await.unwrap());

    let second = QueueItem::pending(unit("general"), Cursor::at(ts(900)), ts(1_001));
    store.insert_pending(&second).await.unwrap();
    assert!(!store.claim_pending(second.id, ts(1_001)).await.unwrap());
    assert_eq!(
        store.get(second.id).await.unwrap().unwrap().status,
        QueueStatus::Pending
    );
}

#[sqlx::test(migrator = "cadence_core::MIGRATOR")]
async fn reap_transitions_each_item_once(pool: PgPool) {
    let store = PostgresStore::new(pool).await.expect("store");
    let item = QueueItem::pending(unit("general"), Cursor::at(ts(1_000)), ts(1_000));
    store.insert_pending(&item).await.unwrap();
    store.claim_pending(item.id, ts(1_000)).await.unwrap();

    assert!(store.reap_expired(ts(1_000)).await.unwrap().is_empty());

    let reaped = store.reap_expired(ts(1_001)).await.unwrap();
    assert_eq!(reaped.len(), 1);
    assert_eq!(reaped[0].status, QueueStatus::Error);
    assert_eq!(reaped[0].attempts, 1);

    assert!(store.reap_expired(ts(1_002)).await.unwrap().is_empty());
    assert_eq!(store.get(item.id).await.unwrap().unwrap().attempts, 1);

    assert!(!store.reset_errored(item.id, 1).await.unwrap());
    assert!(store.reset_errored(item.id, 2).await.unwrap());
    let revived = store.get(item.id).await.unwrap().unwrap();
    assert_eq!(revived.status, QueueStatus::Pending);
    assert_eq!(revived.started_at, None);
}

#[sqlx::test(migrator = "cadence_core::MIGRATOR")]
async fn complete_requires_a_live_lease(pool: PgPool) {
    let store = PostgresStore::new(pool).await.expect("store");
    let item = QueueItem::pending(unit("general"), Cursor::at(ts(1_000)), ts(1_000));
    store.insert_pending(&item).await.unwrap();
    let oldest = Cursor::new(ts(400), "m4");

    assert!(!store.complete(item.id, &oldest, ts(1_005)).await.unwrap());

    store.claim_pending(item.id, ts(1_000)).await.unwrap();
    assert!(store.complete(item.id, &oldest, ts(1_005)).await.unwrap());

    let done = store.get(item.id).await.unwrap().unwrap();
    assert_eq!(done.status, QueueStatus::Completed);
    assert_eq!(done.oldest_cursor, Some(oldest));
    assert_eq!(done.finished_at, Some(ts(1_005)));

    let counts = store.status_counts().await.unwrap();
    assert_eq!(counts.completed, 1);
    assert_eq!(counts.running, 0);
}

#[sqlx::test(migrator = "cadence_core::MIGRATOR")]
async fn activity_inserts_are_idempotent(pool: PgPool) {
    let store = PostgresStore::new(pool).await.expect("store");
    let scope = SignalScope::new("p1", "discord");
    let record = ActivityRecord {
        unit: unit("general"),
        scope: scope.clone(),
        external_id: "m1".into(),
        author_id: "alice".into(),
        content: "gm".into(),
        timestamp: ts(86_400 + 60),
    };

    assert_eq!(store.insert_activity(&record).await.unwrap(), InsertOutcome::Inserted);
    assert_eq!(store.insert_activity(&record).await.unwrap(), InsertOutcome::Duplicate);

    assert_eq!(
        store.latest_activity_at(&scope, "alice").await.unwrap(),
        Some(ts(86_400 + 60))
    );
    let summary = store
        .day_summary(&scope, "alice", ts(86_400).date_naive())
        .await
        .unwrap();
    assert_eq!(summary.count, 1);
    let window = store
        .activity_window(&scope, "alice", ts(0), ts(86_400 + 60))
        .await
        .unwrap();
    assert_eq!(window.len(), 1);
}

#[sqlx::test(migrator = "cadence_core::MIGRATOR")]
async fn duplicate_scores_keep_requested_row(pool: PgPool) {
    let store = PostgresStore::new(pool).await.expect("store");
    let scope = SignalScope::new("p1", "discord");
    let key = ScoreKey::new("alice", &scope, ts(0).date_naive());
    let first = ScoreRecord::smart(key.clone(), 40.0, Some("steady".into()), ts(100));
    let second = ScoreRecord::smart(key.clone(), 55.0, None, ts(100));
    let raw = ScoreRecord::raw(key.clone(), 2.0, ts(100));
    for record in [&first, &second, &raw] {
        store.insert_score(record).await.unwrap();
    }

    let deleted = store
        .delete_duplicates(&key, ScoreKind::Smart, second.request_id)
        .await
        .unwrap();
    assert_eq!(deleted, 1);

    let rows = store.scores_for(&key).await.unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().any(|r| r.request_id == second.request_id));
    assert!(rows.iter().all(|r| r.request_id != first.request_id));
    assert_eq!(
        store.last_processed("alice", &scope).await.unwrap(),
        Some(ts(100))
    );
}
