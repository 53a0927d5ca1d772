//! Postgres-backed governor store.
//!
//! Every state transition is a single conditional `UPDATE ... WHERE status =`
//! statement. The partial unique indexes on `(unit_namespace, unit_resource)`
//! turn a second running or pending item for a unit into a 23505 error, which
//! is reported as a lost race rather than a failure.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    ActivityStore, EnqueueOutcome, InsertOutcome, QueueStore, ScoreStore,
};
use crate::error::{CadenceError, Result};
use crate::types::{
    ActivityRecord, Cursor, DaySummary, QueueCounts, QueueItem, QueueItemId,
    QueueStatus, RequestId, ScoreKey, ScoreKind, ScoreRecord, SignalScope,
    UnitKey,
};

const RUNNING_UNIT_INDEX: &str = "uq_queue_items_running_unit";

const ITEM_COLUMNS: &str = "id, unit_namespace, unit_resource, status, \
    attempts, started_at, finished_at, newest_cursor_at, newest_cursor_id, \
    oldest_cursor_at, oldest_cursor_id, created_at";

#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl fmt::Debug for PostgresStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresStore")
            .field("pool_size", &self.pool.size())
            .field("idle_connections", &self.pool.num_idle())
            .finish()
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            db_err.code().as_deref() == Some("23505")
        }
        _ => false,
    }
}

fn day_bounds(day: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = day.and_time(NaiveTime::MIN).and_utc();
    (start, start + chrono::Duration::days(1))
}

#[derive(sqlx::FromRow)]
struct QueueItemRow {
    id: Uuid,
    unit_namespace: String,
    unit_resource: String,
    status: String,
    attempts: i32,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    newest_cursor_at: DateTime<Utc>,
    newest_cursor_id: String,
    oldest_cursor_at: Option<DateTime<Utc>>,
    oldest_cursor_id: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<QueueItemRow> for QueueItem {
    type Error = CadenceError;

    fn try_from(row: QueueItemRow) -> Result<Self> {
        let oldest_cursor = match (row.oldest_cursor_at, row.oldest_cursor_id)
        {
            (Some(at), Some(id)) => Some(Cursor::new(at, id)),
            (None, None) => None,
            _ => {
                return Err(CadenceError::Internal(format!(
                    "queue item {} has a half-written oldest cursor",
                    row.id
                )));
            }
        };

        Ok(QueueItem {
            id: QueueItemId(row.id),
            unit: UnitKey::new(row.unit_namespace, row.unit_resource),
            status: row.status.parse()?,
            attempts: row.attempts.max(0) as u32,
            started_at: row.started_at,
            finished_at: row.finished_at,
            newest_cursor: Cursor::new(row.newest_cursor_at, row.newest_cursor_id),
            oldest_cursor,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ActivityRow {
    project_id: String,
    signal_source_id: String,
    external_id: String,
    unit_namespace: String,
    unit_resource: String,
    author_id: String,
    content: String,
    occurred_at: DateTime<Utc>,
}

impl From<ActivityRow> for ActivityRecord {
    fn from(row: ActivityRow) -> Self {
        ActivityRecord {
            unit: UnitKey::new(row.unit_namespace, row.unit_resource),
            scope: SignalScope::new(row.project_id, row.signal_source_id),
            external_id: row.external_id,
            author_id: row.author_id,
            content: row.content,
            timestamp: row.occurred_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ScoreRow {
    user_id: String,
    project_id: String,
    signal_source_id: String,
    day: NaiveDate,
    raw_value: Option<f64>,
    value: Option<f64>,
    summary: Option<String>,
    last_updated: DateTime<Utc>,
    request_id: Uuid,
}

impl From<ScoreRow> for ScoreRecord {
    fn from(row: ScoreRow) -> Self {
        ScoreRecord {
            key: ScoreKey {
                user_id: row.user_id,
                project_id: row.project_id,
                signal_source_id: row.signal_source_id,
                day: row.day,
            },
            raw_value: row.raw_value,
            value: row.value,
            summary: row.summary,
            last_updated: row.last_updated,
            request_id: RequestId(row.request_id),
        }
    }
}

impl PostgresStore {
    /// Wrap an existing pool after verifying DB health and schema.
    pub async fn new(pool: PgPool) -> Result<Self> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&pool)
            .await
            .map_err(|e| {
                CadenceError::Store(format!(
                    "governor store failed Postgres health check: {e}"
                ))
            })?;
        info!("Governor store connected to Postgres");

        // Claim safety depends on this index; refuse to run without it.
        let idx_exists = sqlx::query_scalar::<_, i32>(
            r#"
            SELECT 1
            FROM pg_indexes
            WHERE indexname = $1
            LIMIT 1
            "#,
        )
        .bind(RUNNING_UNIT_INDEX)
        .fetch_optional(&pool)
        .await
        .map_err(|e| {
            CadenceError::Store(format!(
                "governor store schema validation failed: {e}"
            ))
        })?
        .is_some();

        if !idx_exists {
            return Err(CadenceError::Store(format!(
                "Required index {RUNNING_UNIT_INDEX} is missing; run migrations"
            )));
        }

        Ok(Self { pool })
    }

    /// Open a pool for `database_url`, optionally apply migrations, and
    /// validate the schema.
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        run_migrations: bool,
    ) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| {
                CadenceError::Store(format!("failed to connect to Postgres: {e}"))
            })?;

        if run_migrations {
            migrate(&pool).await?;
        }

        Self::new(pool).await
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Apply the bundled migrations to `pool`.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    crate::MIGRATOR
        .run(pool)
        .await
        .map_err(|e| CadenceError::Store(format!("migrations failed: {e}")))?;
    info!("Governor schema migrations applied");
    Ok(())
}

#[async_trait]
impl QueueStore for PostgresStore {
    async fn items_for_unit(&self, unit: &UnitKey) -> Result<Vec<QueueItem>> {
        let rows = sqlx::query_as::<_, QueueItemRow>(&format!(
            r#"
            SELECT {ITEM_COLUMNS}
            FROM queue_items
            WHERE unit_namespace = $1 AND unit_resource = $2
            ORDER BY newest_cursor_at DESC, newest_cursor_id DESC
            "#
        ))
        .bind(&unit.namespace)
        .bind(&unit.resource)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            CadenceError::Store(format!("unit item lookup failed: {e}"))
        })?;

        rows.into_iter().map(QueueItem::try_from).collect()
    }

    async fn insert_pending(&self, item: &QueueItem) -> Result<EnqueueOutcome> {
        // Plain INSERT; a competing pending row trips the partial unique
        // index and is treated as a merge.
        let insert_res = sqlx::query(
            r#"
            INSERT INTO queue_items (
                id, unit_namespace, unit_resource, status, attempts,
                started_at, finished_at, newest_cursor_at, newest_cursor_id,
                oldest_cursor_at, oldest_cursor_id, created_at
            )
            VALUES ($1, $2, $3, 'pending', 0, NULL, NULL, $4, $5, NULL, NULL, $6)
            "#,
        )
        .bind(item.id.0)
        .bind(&item.unit.namespace)
        .bind(&item.unit.resource)
        .bind(item.newest_cursor.timestamp)
        .bind(&item.newest_cursor.external_id)
        .bind(item.created_at)
        .execute(&self.pool)
        .await;

        match insert_res {
            Ok(_) => Ok(EnqueueOutcome::Inserted(item.id)),
            Err(err) if is_unique_violation(&err) => {
                let existing = sqlx::query_scalar::<_, Uuid>(
                    r#"
                    SELECT id
                    FROM queue_items
                    WHERE unit_namespace = $1
                      AND unit_resource = $2
                      AND status = 'pending'
                    LIMIT 1
                    "#,
                )
                .bind(&item.unit.namespace)
                .bind(&item.unit.resource)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| {
                    CadenceError::Store(format!(
                        "enqueue conflict lookup failed: {e}"
                    ))
                })?;

                debug!(unit = %item.unit, "enqueue merged into existing pending item");
                Ok(existing
                    .map(|id| EnqueueOutcome::Existing(QueueItemId(id)))
                    .unwrap_or(EnqueueOutcome::Contended))
            }
            Err(e) => Err(CadenceError::Store(format!(
                "enqueue insert failed: {e}"
            ))),
        }
    }

    async fn get(&self, id: QueueItemId) -> Result<Option<QueueItem>> {
        let row = sqlx::query_as::<_, QueueItemRow>(&format!(
            "SELECT {ITEM_COLUMNS} FROM queue_items WHERE id = $1"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CadenceError::Store(format!("item lookup failed: {e}")))?;

        row.map(QueueItem::try_from).transpose()
    }

    async fn claim_pending(
        &self,
        id: QueueItemId,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE queue_items
            SET status = 'running',
                started_at = $2
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id.0)
        .bind(now)
        .execute(&self.pool)
        .await;

        match res {
            Ok(done) => Ok(done.rows_affected() == 1),
            Err(err) if is_unique_violation(&err) => {
                debug!(item_id = %id, "claim lost: unit already has a running item");
                Ok(false)
            }
            Err(e) => Err(CadenceError::Store(format!("claim update failed: {e}"))),
        }
    }

    async fn reset_errored(
        &self,
        id: QueueItemId,
        max_attempts: u32,
    ) -> Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE queue_items
            SET status = 'pending',
                started_at = NULL
            WHERE id = $1
              AND status = 'error'
              AND attempts < $2
            "#,
        )
        .bind(id.0)
        .bind(i32::try_from(max_attempts).unwrap_or(i32::MAX))
        .execute(&self.pool)
        .await;

        match res {
            Ok(done) => Ok(done.rows_affected() == 1),
            Err(err) if is_unique_violation(&err) => Ok(false),
            Err(e) => Err(CadenceError::Store(format!(
                "error reset update failed: {e}"
            ))),
        }
    }

    async fn reap_expired(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<QueueItem>> {
        let rows = sqlx::query_as::<_, QueueItemRow>(&format!(
            r#"
            UPDATE queue_items
            SET status = 'error',
                attempts = attempts + 1
            WHERE status = 'running'
              AND started_at < $1
            RETURNING {ITEM_COLUMNS}
            "#
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CadenceError::Store(format!("lease reap failed: {e}")))?;

        rows.into_iter().map(QueueItem::try_from).collect()
    }

    async fn count_running(&self) -> Result<u64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*)::bigint FROM queue_items WHERE status = 'running'",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            CadenceError::Store(format!("running count failed: {e}"))
        })?;

        Ok(count.max(0) as u64)
    }

    async fn complete(
        &self,
        id: QueueItemId,
        oldest: &Cursor,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let done = sqlx::query(
            r#"
            UPDATE queue_items
            SET status = 'completed',
                oldest_cursor_at = $2,
                oldest_cursor_id = $3,
                finished_at = $4
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(id.0)
        .bind(oldest.timestamp)
        .bind(&oldest.external_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            CadenceError::Store(format!("completion update failed: {e}"))
        })?;

        Ok(done.rows_affected() == 1)
    }

    async fn status_counts(&self) -> Result<QueueCounts> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            r#"
            SELECT status, COUNT(*)::bigint
            FROM queue_items
            GROUP BY status
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            CadenceError::Store(format!("status count aggregation failed: {e}"))
        })?;

        let mut counts = QueueCounts::default();
        for (status, count) in rows {
            let Ok(status) = status.parse::<QueueStatus>() else {
                continue;
            };
            counts.record(status, count.max(0) as u64);
        }
        Ok(counts)
    }
}

#[async_trait]
impl ActivityStore for PostgresStore {
    async fn insert_activity(
        &self,
        record: &ActivityRecord,
    ) -> Result<InsertOutcome> {
        let done = sqlx::query(
            r#"
            INSERT INTO activity_records (
                project_id, signal_source_id, external_id, unit_namespace,
                unit_resource, author_id, content, occurred_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (project_id, signal_source_id, external_id) DO NOTHING
            "#,
        )
        .bind(&record.scope.project_id)
        .bind(&record.scope.signal_source_id)
        .bind(&record.external_id)
        .bind(&record.unit.namespace)
        .bind(&record.unit.resource)
        .bind(&record.author_id)
        .bind(&record.content)
        .bind(record.timestamp)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            CadenceError::Store(format!("activity insert failed: {e}"))
        })?;

        Ok(if done.rows_affected() == 0 {
            InsertOutcome::Duplicate
        } else {
            InsertOutcome::Inserted
        })
    }

    async fn latest_activity_at(
        &self,
        scope: &SignalScope,
        author_id: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        sqlx::query_scalar::<_, Option<DateTime<Utc>>>(
            r#"
            SELECT MAX(occurred_at)
            FROM activity_records
            WHERE project_id = $1
              AND signal_source_id = $2
              AND author_id = $3
            "#,
        )
        .bind(&scope.project_id)
        .bind(&scope.signal_source_id)
        .bind(author_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            CadenceError::Store(format!("latest activity lookup failed: {e}"))
        })
    }

    async fn activity_window(
        &self,
        scope: &SignalScope,
        author_id: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<ActivityRecord>> {
        let rows = sqlx::query_as::<_, ActivityRow>(
            r#"
            SELECT project_id, signal_source_id, external_id, unit_namespace,
                   unit_resource, author_id, content, occurred_at
            FROM activity_records
            WHERE project_id = $1
              AND signal_source_id = $2
              AND author_id = $3
              AND occurred_at >= $4
              AND occurred_at <= $5
            ORDER BY occurred_at ASC, external_id ASC
            "#,
        )
        .bind(&scope.project_id)
        .bind(&scope.signal_source_id)
        .bind(author_id)
        .bind(since)
        .bind(until)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            CadenceError::Store(format!("activity window query failed: {e}"))
        })?;

        Ok(rows.into_iter().map(ActivityRecord::from).collect())
    }

    async fn day_summary(
        &self,
        scope: &SignalScope,
        author_id: &str,
        day: NaiveDate,
    ) -> Result<DaySummary> {
        let (start, end) = day_bounds(day);
        let (count, latest) =
            sqlx::query_as::<_, (i64, Option<DateTime<Utc>>)>(
                r#"
                SELECT COUNT(*)::bigint, MAX(occurred_at)
                FROM activity_records
                WHERE project_id = $1
                  AND signal_source_id = $2
                  AND author_id = $3
                  AND occurred_at >= $4
                  AND occurred_at < $5
                "#,
            )
            .bind(&scope.project_id)
            .bind(&scope.signal_source_id)
            .bind(author_id)
            .bind(start)
            .bind(end)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                CadenceError::Store(format!("day summary query failed: {e}"))
            })?;

        Ok(DaySummary {
            count: count.max(0) as u64,
            latest,
        })
    }
}

#[async_trait]
impl ScoreStore for PostgresStore {
    async fn insert_score(&self, record: &ScoreRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO score_records (
                user_id, project_id, signal_source_id, day, raw_value,
                value, summary, last_updated, request_id
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(&record.key.user_id)
        .bind(&record.key.project_id)
        .bind(&record.key.signal_source_id)
        .bind(record.key.day)
        .bind(record.raw_value)
        .bind(record.value)
        .bind(&record.summary)
        .bind(record.last_updated)
        .bind(record.request_id.0)
        .execute(&self.pool)
        .await
        .map_err(|e| CadenceError::Store(format!("score insert failed: {e}")))?;

        Ok(())
    }

    async fn last_processed(
        &self,
        user_id: &str,
        scope: &SignalScope,
    ) -> Result<Option<DateTime<Utc>>> {
        sqlx::query_scalar::<_, Option<DateTime<Utc>>>(
            r#"
            SELECT MAX(last_updated)
            FROM score_records
            WHERE user_id = $1
              AND project_id = $2
              AND signal_source_id = $3
              AND value IS NOT NULL
            "#,
        )
        .bind(user_id)
        .bind(&scope.project_id)
        .bind(&scope.signal_source_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            CadenceError::Store(format!("last processed lookup failed: {e}"))
        })
    }

    async fn delete_duplicates(
        &self,
        key: &ScoreKey,
        kind: ScoreKind,
        keep: RequestId,
    ) -> Result<u64> {
        let kind_filter = match kind {
            ScoreKind::Raw => "raw_value IS NOT NULL",
            ScoreKind::Smart => "value IS NOT NULL",
        };

        let done = sqlx::query(&format!(
            r#"
            DELETE FROM score_records
            WHERE user_id = $1
              AND project_id = $2
              AND signal_source_id = $3
              AND day = $4
              AND request_id <> $5
              AND {kind_filter}
            "#
        ))
        .bind(&key.user_id)
        .bind(&key.project_id)
        .bind(&key.signal_source_id)
        .bind(key.day)
        .bind(keep.0)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            CadenceError::Store(format!("duplicate score cleanup failed: {e}"))
        })?;

        Ok(done.rows_affected())
    }

    async fn scores_for(&self, key: &ScoreKey) -> Result<Vec<ScoreRecord>> {
        let rows = sqlx::query_as::<_, ScoreRow>(
            r#"
            SELECT user_id, project_id, signal_source_id, day, raw_value,
                   value, summary, last_updated, request_id
            FROM score_records
            WHERE user_id = $1
              AND project_id = $2
              AND signal_source_id = $3
              AND day = $4
            ORDER BY id ASC
            "#,
        )
        .bind(&key.user_id)
        .bind(&key.project_id)
        .bind(&key.signal_source_id)
        .bind(key.day)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CadenceError::Store(format!("score lookup failed: {e}")))?;

        Ok(rows.into_iter().map(ScoreRecord::from).collect())
    }
}
