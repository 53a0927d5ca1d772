//! Platform adapters: the seam between the generic governor and each
//! external activity source.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::config::{PlatformKind, UnitConfig};
use crate::error::{CadenceError, Result};
use crate::types::{Cursor, SignalScope, UnitKey};

pub mod discord;
pub mod discourse;

pub use discord::DiscordAdapter;
pub use discourse::DiscourseAdapter;

/// Any failure talking to a platform. The governor does not distinguish
/// variants: the item stays running and the lease reaper recovers it.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("platform returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("rate limited; retry after {retry_after_secs:?}s")]
    RateLimited { retry_after_secs: Option<f64> },

    #[error("invalid endpoint: {0}")]
    Endpoint(String),

    #[error("unexpected payload: {0}")]
    Decode(String),
}

/// One item of external activity as returned by a platform.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FetchedActivity {
    pub external_id: String,
    pub author_id: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl FetchedActivity {
    pub fn cursor(&self) -> Cursor {
        Cursor::new(self.timestamp, self.external_id.clone())
    }
}

/// The result of one fetch call.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FetchedPage {
    pub activity: Vec<FetchedActivity>,
    /// How far down the source the adapter looked, when that is below the
    /// oldest returned item. Only set when everything between `before` and
    /// this cursor was either returned or filtered out.
    pub scanned_to: Option<Cursor>,
}

#[derive(Clone)]
pub struct Credentials {
    pub token: String,
    pub username: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("token", &"<redacted>")
            .field("username", &self.username)
            .finish()
    }
}

/// Everything an adapter needs to fetch one unit's activity.
#[derive(Clone, Debug)]
pub struct UnitContext {
    pub key: UnitKey,
    pub scope: SignalScope,
    pub endpoint: Url,
    pub credentials: Option<Credentials>,
}

#[async_trait]
pub trait PlatformAdapter: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    fn unit_key_from_context(&self, context: &UnitContext) -> UnitKey {
        context.key.clone()
    }

    /// Up to `limit` items strictly older than `before`, newest first.
    async fn fetch_activity(
        &self,
        context: &UnitContext,
        before: &Cursor,
        limit: usize,
    ) -> std::result::Result<Vec<FetchedActivity>, FetchError>;

    /// Like `fetch_activity`, for adapters that filter what they read and
    /// can report a scan position past the last item they kept.
    async fn fetch_page(
        &self,
        context: &UnitContext,
        before: &Cursor,
        limit: usize,
    ) -> std::result::Result<FetchedPage, FetchError> {
        Ok(FetchedPage {
            activity: self.fetch_activity(context, before, limit).await?,
            scanned_to: None,
        })
    }

    fn cursor_ordering(&self, a: &Cursor, b: &Cursor) -> Ordering {
        a.cmp(b)
    }
}

/// A unit of work bound to the adapter that serves it.
#[derive(Clone, Debug)]
pub struct GovernedUnit {
    pub context: UnitContext,
    pub adapter: Arc<dyn PlatformAdapter>,
}

impl GovernedUnit {
    pub fn new(context: UnitContext, adapter: Arc<dyn PlatformAdapter>) -> Self {
        Self { context, adapter }
    }

    pub fn key(&self) -> UnitKey {
        self.adapter.unit_key_from_context(&self.context)
    }
}

/// Build a governed unit from static configuration. `token` is the already
/// resolved secret named by `UnitConfig::token_env`.
pub fn build_unit(
    config: &UnitConfig,
    token: Option<String>,
    http: reqwest::Client,
) -> Result<GovernedUnit> {
    let (adapter, default_endpoint): (Arc<dyn PlatformAdapter>, String) =
        match config.platform {
            PlatformKind::Discord => (
                Arc::new(DiscordAdapter::new(http)),
                discord::DEFAULT_API_BASE.to_string(),
            ),
            PlatformKind::Discourse => (
                Arc::new(DiscourseAdapter::new(http)),
                format!("https://{}", config.namespace),
            ),
        };

    let raw_endpoint = config.endpoint.clone().unwrap_or(default_endpoint);
    let endpoint = Url::parse(&raw_endpoint).map_err(|e| {
        CadenceError::Config(format!(
            "unit {}/{} has invalid endpoint {raw_endpoint}: {e}",
            config.namespace, config.resource
        ))
    })?;

    let credentials = token.map(|token| Credentials {
        token,
        username: config.username.clone(),
    });

    Ok(GovernedUnit::new(
        UnitContext {
            key: UnitKey::new(&config.namespace, &config.resource),
            scope: SignalScope::new(&config.project_id, &config.signal_source_id),
            endpoint,
            credentials,
        },
        adapter,
    ))
}

/// Append path segments to a base URL, keeping any existing base path.
pub(crate) fn join_segments(
    base: &Url,
    segments: &[&str],
) -> std::result::Result<Url, FetchError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| FetchError::Endpoint(format!("{base} cannot be a base URL")))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_config(platform: PlatformKind) -> UnitConfig {
        UnitConfig {
            platform,
            namespace: "forum.example.org".into(),
            resource: "all".into(),
            project_id: "p1".into(),
            signal_source_id: "forum".into(),
            endpoint: None,
            token_env: None,
            username: Some("system".into()),
        }
    }

    #[test]
    fn discourse_defaults_endpoint_to_namespace_host() {
        let unit = build_unit(
            &unit_config(PlatformKind::Discourse),
            Some("secret".into()),
            reqwest::Client::new(),
        )
        .expect("unit builds");

        assert_eq!(unit.context.endpoint.as_str(), "https://forum.example.org/");
        assert_eq!(unit.adapter.name(), "discourse");
        assert_eq!(unit.key(), UnitKey::new("forum.example.org", "all"));
        assert!(!format!("{:?}", unit.context).contains("secret"));
    }

    #[test]
    fn invalid_endpoint_is_a_config_error() {
        let mut config = unit_config(PlatformKind::Discord);
        config.endpoint = Some("not a url".into());
        let err = build_unit(&config, None, reqwest::Client::new())
            .expect_err("endpoint rejected");
        assert!(matches!(err, CadenceError::Config(_)));
    }

    #[test]
    fn join_keeps_base_path() {
        let base = Url::parse("https://discord.com/api/v10").unwrap();
        let url = join_segments(&base, &["channels", "42", "messages"]).unwrap();
        assert_eq!(url.as_str(), "https://discord.com/api/v10/channels/42/messages");
    }
}
