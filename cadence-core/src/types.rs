//! Queue, activity, and score records shared by every component.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CadenceError;

/// Unique identifier for queue items.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct QueueItemId(pub Uuid);

impl Default for QueueItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl QueueItemId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for QueueItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Correlation id of the computation that produced a score row.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub Uuid);

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Granularity at which sync progress and concurrency are tracked, e.g.
/// guild/channel or forum/category.
#[derive(
    Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct UnitKey {
    pub namespace: String,
    pub resource: String,
}

impl UnitKey {
    pub fn new(namespace: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            resource: resource.into(),
        }
    }
}

impl fmt::Display for UnitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.resource)
    }
}

/// Position marker in an external activity feed.
///
/// Ordering is by timestamp first, then by external id. A cursor with an
/// empty external id is a synthetic anchor (e.g. "now") rather than a real
/// item.
#[derive(
    Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Cursor {
    pub timestamp: DateTime<Utc>,
    pub external_id: String,
}

impl Cursor {
    pub fn new(timestamp: DateTime<Utc>, external_id: impl Into<String>) -> Self {
        Self {
            timestamp,
            external_id: external_id.into(),
        }
    }

    pub fn at(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            external_id: String::new(),
        }
    }

    pub fn is_synthetic(&self) -> bool {
        self.external_id.is_empty()
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_synthetic() {
            write!(f, "{}", self.timestamp.to_rfc3339())
        } else {
            write!(f, "{}#{}", self.timestamp.to_rfc3339(), self.external_id)
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Running,
    Completed,
    Error,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Running => "running",
            QueueStatus::Completed => "completed",
            QueueStatus::Error => "error",
        }
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueStatus {
    type Err = CadenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(QueueStatus::Pending),
            "running" => Ok(QueueStatus::Running),
            "completed" => Ok(QueueStatus::Completed),
            "error" => Ok(QueueStatus::Error),
            other => Err(CadenceError::Internal(format!(
                "unknown queue status {other}"
            ))),
        }
    }
}

/// One window of a unit's history. Rows are never deleted; they only move
/// through `pending -> running -> completed | error`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: QueueItemId,
    pub unit: UnitKey,
    pub status: QueueStatus,
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Upper (more recent) bound of the window.
    pub newest_cursor: Cursor,
    /// Lower bound, known once the window has been fetched.
    pub oldest_cursor: Option<Cursor>,
    pub created_at: DateTime<Utc>,
}

impl QueueItem {
    pub fn pending(unit: UnitKey, newest: Cursor, now: DateTime<Utc>) -> Self {
        Self {
            id: QueueItemId::new(),
            unit,
            status: QueueStatus::Pending,
            attempts: 0,
            started_at: None,
            finished_at: None,
            newest_cursor: newest,
            oldest_cursor: None,
            created_at: now,
        }
    }

    /// A completed window whose batch came back empty: the source has no
    /// data older than `newest_cursor`.
    pub fn is_exhausted(&self) -> bool {
        self.status == QueueStatus::Completed
            && self.oldest_cursor.as_ref() == Some(&self.newest_cursor)
    }
}

/// Per-status counts across the whole queue.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub pending: u64,
    pub running: u64,
    pub completed: u64,
    pub error: u64,
}

impl QueueCounts {
    pub fn record(&mut self, status: QueueStatus, count: u64) {
        match status {
            QueueStatus::Pending => self.pending += count,
            QueueStatus::Running => self.running += count,
            QueueStatus::Completed => self.completed += count,
            QueueStatus::Error => self.error += count,
        }
    }
}

/// Project and signal source that activity and scores are attributed to.
#[derive(
    Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct SignalScope {
    pub project_id: String,
    pub signal_source_id: String,
}

impl SignalScope {
    pub fn new(
        project_id: impl Into<String>,
        signal_source_id: impl Into<String>,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            signal_source_id: signal_source_id.into(),
        }
    }
}

/// Raw activity persisted by the fetch executor. The natural key is
/// `(scope, external_id)`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub unit: UnitKey,
    pub scope: SignalScope,
    pub external_id: String,
    pub author_id: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ActivityRecord {
    pub fn cursor(&self) -> Cursor {
        Cursor::new(self.timestamp, self.external_id.clone())
    }
}

/// Activity totals for one author on one day.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DaySummary {
    pub count: u64,
    pub latest: Option<DateTime<Utc>>,
}

#[derive(
    Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ScoreKey {
    pub user_id: String,
    pub project_id: String,
    pub signal_source_id: String,
    pub day: NaiveDate,
}

impl ScoreKey {
    pub fn new(
        user_id: impl Into<String>,
        scope: &SignalScope,
        day: NaiveDate,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            project_id: scope.project_id.clone(),
            signal_source_id: scope.signal_source_id.clone(),
            day,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreKind {
    /// One day's activity score.
    Raw,
    /// Aggregated multi-day score.
    Smart,
}

/// A raw row carries `raw_value` only, a smart row carries `value` only.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScoreRecord {
    pub key: ScoreKey,
    pub raw_value: Option<f64>,
    pub value: Option<f64>,
    pub summary: Option<String>,
    pub last_updated: DateTime<Utc>,
    pub request_id: RequestId,
}

impl ScoreRecord {
    pub fn raw(key: ScoreKey, raw_value: f64, last_updated: DateTime<Utc>) -> Self {
        Self {
            key,
            raw_value: Some(raw_value),
            value: None,
            summary: None,
            last_updated,
            request_id: RequestId::new(),
        }
    }

    pub fn smart(
        key: ScoreKey,
        value: f64,
        summary: Option<String>,
        last_updated: DateTime<Utc>,
    ) -> Self {
        Self {
            key,
            raw_value: None,
            value: Some(value),
            summary,
            last_updated,
            request_id: RequestId::new(),
        }
    }

    pub fn kind(&self) -> ScoreKind {
        if self.value.is_some() {
            ScoreKind::Smart
        } else {
            ScoreKind::Raw
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().expect("valid timestamp")
    }

    #[test]
    fn cursor_orders_by_timestamp_then_id() {
        let a = Cursor::new(ts(10), "b");
        let b = Cursor::new(ts(10), "c");
        let c = Cursor::new(ts(11), "a");
        assert!(a < b);
        assert!(b < c);
        assert!(Cursor::at(ts(10)) < a);
    }

    #[test]
    fn status_round_trips_through_column_values() {
        for status in [
            QueueStatus::Pending,
            QueueStatus::Running,
            QueueStatus::Completed,
            QueueStatus::Error,
        ] {
            assert_eq!(status.as_str().parse::<QueueStatus>().unwrap(), status);
        }
        assert!("leased".parse::<QueueStatus>().is_err());
    }

    #[test]
    fn score_kind_follows_populated_column() {
        let key = ScoreKey::new(
            "u1",
            &SignalScope::new("p1", "discord"),
            ts(0).date_naive(),
        );
        assert_eq!(ScoreRecord::raw(key.clone(), 3.0, ts(0)).kind(), ScoreKind::Raw);
        assert_eq!(
            ScoreRecord::smart(key, 42.0, None, ts(0)).kind(),
            ScoreKind::Smart
        );
    }
}
