use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;

use super::{FetchError, FetchedActivity, PlatformAdapter, UnitContext, join_segments};
use crate::types::Cursor;

pub const DEFAULT_API_BASE: &str = "https://discord.com/api/v10";

/// Discord caps `limit` on the channel messages endpoint.
const MAX_PAGE_SIZE: usize = 100;

/// Milliseconds since the Unix epoch at the start of the Discord epoch
/// (2015-01-01T00:00:00Z).
const DISCORD_EPOCH_MS: i64 = 1_420_070_400_000;

/// Channel message history. `namespace` is the guild id, `resource` the
/// channel id.
#[derive(Clone, Debug)]
pub struct DiscordAdapter {
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct DiscordMessage {
    id: String,
    #[serde(default)]
    content: String,
    timestamp: DateTime<Utc>,
    author: DiscordAuthor,
}

#[derive(Debug, Deserialize)]
struct DiscordAuthor {
    id: String,
}

#[derive(Debug, Deserialize)]
struct RateLimitBody {
    retry_after: Option<f64>,
}

impl DiscordAdapter {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    /// Snowflake to page `before`. Real cursors carry the message id;
    /// synthetic anchors are converted from their timestamp.
    pub fn before_snowflake(cursor: &Cursor) -> u64 {
        if let Ok(id) = cursor.external_id.parse::<u64>() {
            return id;
        }
        snowflake_from_timestamp(cursor.timestamp)
    }
}

/// Smallest snowflake that could have been minted at `timestamp`.
pub fn snowflake_from_timestamp(timestamp: DateTime<Utc>) -> u64 {
    let since_epoch = (timestamp.timestamp_millis() - DISCORD_EPOCH_MS).max(0);
    (since_epoch as u64) << 22
}

#[async_trait]
impl PlatformAdapter for DiscordAdapter {
    fn name(&self) -> &'static str {
        "discord"
    }

    async fn fetch_activity(
        &self,
        context: &UnitContext,
        before: &Cursor,
        limit: usize,
    ) -> Result<Vec<FetchedActivity>, FetchError> {
        let url = join_segments(
            &context.endpoint,
            &["channels", &context.key.resource, "messages"],
        )?;
        let limit = limit.clamp(1, MAX_PAGE_SIZE);
        let before_id = Self::before_snowflake(before);

        let mut request = self.http.get(url).query(&[
            ("limit", limit.to_string()),
            ("before", before_id.to_string()),
        ]);
        if let Some(credentials) = &context.credentials {
            request = request
                .header(reqwest::header::AUTHORIZATION, format!("Bot {}", credentials.token));
        }

        let response = request.send().await?;
        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let body = response.json::<RateLimitBody>().await.ok();
            return Err(FetchError::RateLimited {
                retry_after_secs: body.and_then(|b| b.retry_after),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FetchError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let messages: Vec<DiscordMessage> = response.json().await?;
        debug!(
            unit = %context.key,
            before = before_id,
            fetched = messages.len(),
            "discord page fetched"
        );

        let mut activity: Vec<FetchedActivity> = messages
            .into_iter()
            .map(|message| FetchedActivity {
                external_id: message.id,
                author_id: message.author.id,
                content: message.content,
                timestamp: message.timestamp,
            })
            .collect();
        activity.sort_by(|a, b| b.cursor().cmp(&a.cursor()));
        Ok(activity)
    }

    /// Snowflakes are time-ordered, so message ids order correctly even
    /// when two messages share a timestamp.
    fn cursor_ordering(&self, a: &Cursor, b: &Cursor) -> std::cmp::Ordering {
        match (a.external_id.parse::<u64>(), b.external_id.parse::<u64>()) {
            (Ok(x), Ok(y)) => x.cmp(&y),
            _ => a.cmp(b),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn snowflake_round_trips_discord_epoch() {
        let epoch = Utc.timestamp_millis_opt(DISCORD_EPOCH_MS).unwrap();
        assert_eq!(snowflake_from_timestamp(epoch), 0);

        let later = epoch + chrono::Duration::milliseconds(1);
        assert_eq!(snowflake_from_timestamp(later), 1 << 22);
    }

    #[test]
    fn real_cursor_uses_message_id() {
        let ts = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        assert_eq!(
            DiscordAdapter::before_snowflake(&Cursor::new(ts, "1175928372838400000")),
            1_175_928_372_838_400_000
        );
        assert_eq!(
            DiscordAdapter::before_snowflake(&Cursor::at(ts)),
            snowflake_from_timestamp(ts)
        );
    }

    #[test]
    fn message_payload_decodes() {
        let payload = r#"[{
            "id": "1175928372838400000",
            "content": "gm",
            "timestamp": "2023-11-20T12:00:00.000000+00:00",
            "author": { "id": "80351110224678912", "username": "nelly" },
            "type": 0
        }]"#;
        let messages: Vec<DiscordMessage> =
            serde_json::from_str(payload).expect("payload decodes");
        assert_eq!(messages[0].author.id, "80351110224678912");
        assert_eq!(messages[0].timestamp.timestamp(), 1_700_481_600);
    }

    #[test]
    fn ordering_prefers_snowflakes() {
        let adapter = DiscordAdapter::new(reqwest::Client::new());
        let ts = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let a = Cursor::new(ts, "9");
        let b = Cursor::new(ts, "10");
        assert_eq!(adapter.cursor_ordering(&a, &b), std::cmp::Ordering::Less);
    }
}
