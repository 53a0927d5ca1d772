use serde::{Deserialize, Serialize};

use crate::error::{CadenceError, Result};

/// Knobs that tune governor behaviour.
///
/// All fields carry defaults so a deployment only has to spell out what it
/// wants to change.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct GovernorConfig {
    /// Lease timeout and retry ceiling.
    pub lease: LeaseConfig,
    /// In-flight bound and fetch page size.
    pub queue: QueueConfig,
    /// Retention horizon and head refresh cadence.
    pub backfill: BackfillConfig,
    /// Score recompute settings handed to the scoring collaborator.
    pub scoring: ScoringConfig,
    /// Units of work the governor keeps in sync.
    pub units: Vec<UnitConfig>,
}

impl GovernorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.lease.timeout_secs <= 0 {
            return Err(CadenceError::Config(
                "lease.timeout_secs must be positive".into(),
            ));
        }
        if self.lease.max_attempts == 0 {
            return Err(CadenceError::Config(
                "lease.max_attempts must be at least 1".into(),
            ));
        }
        if self.queue.page_size == 0 {
            return Err(CadenceError::Config(
                "queue.page_size must be at least 1".into(),
            ));
        }
        if self.backfill.retention_days <= 0 {
            return Err(CadenceError::Config(
                "backfill.retention_days must be positive".into(),
            ));
        }
        if !(self.scoring.max_value.is_finite() && self.scoring.max_value >= 0.0)
        {
            return Err(CadenceError::Config(
                "scoring.max_value must be a non-negative number".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    /// Seconds a running item may hold its lease before it is reaped.
    pub timeout_secs: i64,
    /// Items reaped this many times are left in `error` for an operator.
    pub max_attempts: u32,
}

impl LeaseConfig {
    pub fn timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.timeout_secs)
    }
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            max_attempts: 3,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Upper bound on running items across all units.
    pub max_concurrent: usize,
    /// Items requested from a platform per claimed window.
    pub page_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            page_size: 100,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BackfillConfig {
    /// How far back history is synced.
    pub retention_days: i64,
    /// Re-anchor at "now" once the newest window is older than this. `None`
    /// disables head refresh.
    pub refresh_after_secs: Option<i64>,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            retention_days: 90,
            refresh_after_secs: Some(15 * 60),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub enabled: bool,
    /// Lookback window handed to the scoring collaborator.
    pub previous_days: u32,
    /// Scores are clamped to `[0, max_value]`.
    pub max_value: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            previous_days: 7,
            max_value: 100.0,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlatformKind {
    Discord,
    Discourse,
}

/// Static description of one unit of work.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UnitConfig {
    pub platform: PlatformKind,
    /// Guild id for Discord, forum host for Discourse.
    pub namespace: String,
    /// Channel id for Discord, category id (or `all`) for Discourse.
    pub resource: String,
    pub project_id: String,
    pub signal_source_id: String,
    /// Overrides the platform's default API base URL.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Name of the environment variable holding the API token.
    #[serde(default)]
    pub token_env: Option<String>,
    /// API username, required by Discourse.
    #[serde(default)]
    pub username: Option<String>,
}
