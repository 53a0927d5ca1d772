//! The scoring collaborator: an opaque model call that turns an activity
//! window into a bounded engagement score.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::config::ScoringConfig;
use crate::types::{ActivityRecord, SignalScope};

#[derive(Error, Debug)]
pub enum ScoringError {
    #[error("scoring request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("scoring service returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("scoring service rejected the window: {0}")]
    Rejected(String),
}

/// Activity handed to the scorer for one user.
#[derive(Clone, Debug, Serialize)]
pub struct ActivityWindow {
    pub user_id: String,
    pub scope: SignalScope,
    /// Day the resulting score is filed under.
    pub day: NaiveDate,
    pub since: DateTime<Utc>,
    pub until: DateTime<Utc>,
    pub activity: Vec<ActivityRecord>,
}

/// What the scorer said. Only `value` and `error` are inspected.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScoreOutcome {
    Failed {
        error: String,
    },
    Scored {
        value: f64,
        #[serde(default)]
        summary: Option<String>,
    },
}

#[async_trait]
pub trait ScoringCollaborator: Send + Sync + std::fmt::Debug {
    async fn score(
        &self,
        window: &ActivityWindow,
        config: &ScoringConfig,
    ) -> Result<ScoreOutcome, ScoringError>;
}

#[derive(Serialize)]
struct ScoreRequest<'a> {
    window: &'a ActivityWindow,
    previous_days: u32,
    max_value: f64,
}

/// POSTs the window as JSON and expects a [`ScoreOutcome`] back.
#[derive(Clone, Debug)]
pub struct HttpScoringClient {
    http: reqwest::Client,
    endpoint: Url,
    api_key: Option<String>,
}

impl HttpScoringClient {
    pub fn new(http: reqwest::Client, endpoint: Url) -> Self {
        Self {
            http,
            endpoint,
            api_key: None,
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }
}

#[async_trait]
impl ScoringCollaborator for HttpScoringClient {
    async fn score(
        &self,
        window: &ActivityWindow,
        config: &ScoringConfig,
    ) -> Result<ScoreOutcome, ScoringError> {
        let mut request = self.http.post(self.endpoint.clone()).json(&ScoreRequest {
            window,
            previous_days: config.previous_days,
            max_value: config.max_value,
        });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ScoringError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json::<ScoreOutcome>().await?)
    }
}
