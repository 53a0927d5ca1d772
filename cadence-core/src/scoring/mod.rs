//! Score recompute trigger.
//!
//! After new activity lands for a user, the trigger decides whether the
//! user's smart score is stale, asks the scoring collaborator for a new one,
//! and resolves duplicate rows left by concurrent recomputes.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::ScoringConfig;
use crate::error::Result;
use crate::store::{ActivityStore, ScoreStore};
use crate::types::{RequestId, ScoreKey, ScoreKind, ScoreRecord, SignalScope};

pub mod client;

pub use client::{
    ActivityWindow, HttpScoringClient, ScoreOutcome, ScoringCollaborator, ScoringError,
};

/// True when the user has never been scored, or the latest activity differs
/// from the last processed one at second granularity.
pub fn is_recompute_due(
    last_processed: Option<DateTime<Utc>>,
    latest_activity: DateTime<Utc>,
) -> bool {
    match last_processed {
        None => true,
        Some(last) => last.timestamp() != latest_activity.timestamp(),
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TriggerOutcome {
    NotDue,
    NoActivity,
    Scored {
        value: f64,
        request_id: RequestId,
        duplicates_removed: u64,
    },
    Failed {
        reason: String,
    },
}

pub struct ScoreTrigger<S> {
    store: Arc<S>,
    scorer: Arc<dyn ScoringCollaborator>,
    config: ScoringConfig,
}

impl<S> std::fmt::Debug for ScoreTrigger<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScoreTrigger")
            .field("scorer", &self.scorer)
            .field("config", &self.config)
            .finish()
    }
}

impl<S> Clone for ScoreTrigger<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            scorer: Arc::clone(&self.scorer),
            config: self.config.clone(),
        }
    }
}

impl<S: ActivityStore + ScoreStore> ScoreTrigger<S> {
    pub fn new(
        store: Arc<S>,
        scorer: Arc<dyn ScoringCollaborator>,
        config: ScoringConfig,
    ) -> Self {
        Self {
            store,
            scorer,
            config,
        }
    }

    /// Recompute the smart score for one author if it is due.
    ///
    /// Collaborator failures are logged and reported as
    /// [`TriggerOutcome::Failed`]; nothing is written, so the next arrival
    /// of activity retries. Store errors propagate.
    pub async fn evaluate(
        &self,
        scope: &SignalScope,
        author_id: &str,
    ) -> Result<TriggerOutcome> {
        let Some(latest) = self.store.latest_activity_at(scope, author_id).await? else {
            return Ok(TriggerOutcome::NoActivity);
        };
        let last = self.store.last_processed(author_id, scope).await?;
        if !is_recompute_due(last, latest) {
            debug!(author = author_id, %latest, "score already current");
            return Ok(TriggerOutcome::NotDue);
        }

        let since = latest - chrono::Duration::days(i64::from(self.config.previous_days));
        let activity = self
            .store
            .activity_window(scope, author_id, since, latest)
            .await?;
        let window = ActivityWindow {
            user_id: author_id.to_string(),
            scope: scope.clone(),
            day: latest.date_naive(),
            since,
            until: latest,
            activity,
        };

        let (value, summary) = match self.scorer.score(&window, &self.config).await {
            Ok(ScoreOutcome::Scored { value, summary }) if value.is_finite() => {
                (value.clamp(0.0, self.config.max_value), summary)
            }
            Ok(ScoreOutcome::Scored { value, .. }) => {
                return Ok(self.failed(author_id, format!("non-finite score {value}")));
            }
            Ok(ScoreOutcome::Failed { error }) => {
                return Ok(self.failed(author_id, error));
            }
            Err(err) => {
                return Ok(self.failed(author_id, err.to_string()));
            }
        };

        let key = ScoreKey::new(author_id, scope, window.day);
        let record = ScoreRecord::smart(key.clone(), value, summary, latest);
        self.store.insert_score(&record).await?;
        let duplicates_removed = self
            .store
            .delete_duplicates(&key, ScoreKind::Smart, record.request_id)
            .await?;
        if duplicates_removed > 0 {
            debug!(
                author = author_id,
                day = %key.day,
                duplicates_removed,
                "resolved concurrent score writes"
            );
        }

        info!(
            author = author_id,
            project = %scope.project_id,
            source = %scope.signal_source_id,
            day = %key.day,
            value,
            "smart score recomputed"
        );
        Ok(TriggerOutcome::Scored {
            value,
            request_id: record.request_id,
            duplicates_removed,
        })
    }

    fn failed(&self, author_id: &str, reason: String) -> TriggerOutcome {
        warn!(author = author_id, %reason, "scoring failed; will retry on next activity");
        TriggerOutcome::Failed { reason }
    }
}
