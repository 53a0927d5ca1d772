use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;

use super::{
    FetchError, FetchedActivity, FetchedPage, PlatformAdapter, UnitContext, join_segments,
};
use crate::types::Cursor;

/// `posts.json` pages are fixed-size server side; a category filter can
/// leave a page nearly empty, so a fetch walks at most this many pages.
const MAX_PAGES: usize = 5;

/// Resource value meaning "every category".
pub const ALL_CATEGORIES: &str = "all";

/// Forum posts from a Discourse instance. `namespace` is the forum host,
/// `resource` a category id or [`ALL_CATEGORIES`].
#[derive(Clone, Debug)]
pub struct DiscourseAdapter {
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct LatestPosts {
    #[serde(default)]
    latest_posts: Vec<DiscoursePost>,
}

#[derive(Debug, Deserialize)]
struct DiscoursePost {
    id: u64,
    username: String,
    #[serde(default)]
    raw: Option<String>,
    #[serde(default)]
    cooked: Option<String>,
    created_at: DateTime<Utc>,
    #[serde(default)]
    category_id: Option<u64>,
}

impl DiscoursePost {
    fn is_older_than(&self, before: &Cursor) -> bool {
        match before.external_id.parse::<u64>() {
            Ok(id) => self.id < id,
            Err(_) => self.created_at < before.timestamp,
        }
    }

    fn into_activity(self) -> FetchedActivity {
        FetchedActivity {
            external_id: self.id.to_string(),
            author_id: self.username,
            content: self.raw.or(self.cooked).unwrap_or_default(),
            timestamp: self.created_at,
        }
    }
}

impl DiscourseAdapter {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    async fn fetch_posts(
        &self,
        context: &UnitContext,
        before: Option<u64>,
    ) -> Result<Vec<DiscoursePost>, FetchError> {
        let url = join_segments(&context.endpoint, &["posts.json"])?;
        let mut request = self.http.get(url);
        if let Some(before) = before {
            request = request.query(&[("before", before)]);
        }
        if let Some(credentials) = &context.credentials {
            request = request.header("Api-Key", &credentials.token);
            if let Some(username) = &credentials.username {
                request = request.header("Api-Username", username);
            }
        }

        let response = request.send().await?;
        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<f64>().ok());
            return Err(FetchError::RateLimited { retry_after_secs });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FetchError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let page: LatestPosts = response
            .json()
            .await
            .map_err(|e| FetchError::Decode(e.to_string()))?;
        Ok(page.latest_posts)
    }
}

fn category_filter(resource: &str) -> Result<Option<u64>, FetchError> {
    if resource == ALL_CATEGORIES {
        return Ok(None);
    }
    resource
        .parse::<u64>()
        .map(Some)
        .map_err(|_| FetchError::Endpoint(format!("invalid category id {resource}")))
}

/// Accumulates posts across `posts.json` pages for one fetch.
struct PageScan<'a> {
    before: &'a Cursor,
    category: Option<u64>,
    limit: usize,
    kept: Vec<DiscoursePost>,
    lowest_seen: Option<Cursor>,
    reached_start: bool,
}

impl<'a> PageScan<'a> {
    fn new(before: &'a Cursor, category: Option<u64>, limit: usize) -> Self {
        Self {
            before,
            category,
            limit,
            kept: Vec::new(),
            lowest_seen: None,
            reached_start: false,
        }
    }

    /// Take one page. Returns the `before` id for the next page, or `None`
    /// when the scan should stop.
    fn absorb(&mut self, page: Vec<DiscoursePost>) -> Option<u64> {
        let Some(lowest) = page.iter().map(|post| post.id).min() else {
            self.reached_start = true;
            return None;
        };

        for post in page {
            if !post.is_older_than(self.before) {
                continue;
            }
            if self
                .lowest_seen
                .as_ref()
                .and_then(|seen| seen.external_id.parse::<u64>().ok())
                .is_none_or(|seen| post.id < seen)
            {
                self.lowest_seen = Some(Cursor::new(post.created_at, post.id.to_string()));
            }
            if self.category.is_none_or(|id| post.category_id == Some(id)) {
                self.kept.push(post);
            }
        }

        if lowest <= 1 {
            self.reached_start = true;
            return None;
        }
        if self.kept.len() >= self.limit {
            return None;
        }
        Some(lowest)
    }

    fn finish(mut self) -> FetchedPage {
        self.kept.sort_by(|a, b| b.id.cmp(&a.id));
        self.kept.dedup_by_key(|post| post.id);
        let truncated = self.kept.len() > self.limit;
        self.kept.truncate(self.limit);

        // A truncated scan read past posts it did not return, and a scan
        // that hit the first post has nothing older to skip to.
        let scanned_to = if truncated || self.reached_start {
            None
        } else {
            self.lowest_seen
        };
        FetchedPage {
            activity: self
                .kept
                .into_iter()
                .map(DiscoursePost::into_activity)
                .collect(),
            scanned_to,
        }
    }
}

#[async_trait]
impl PlatformAdapter for DiscourseAdapter {
    fn name(&self) -> &'static str {
        "discourse"
    }

    async fn fetch_activity(
        &self,
        context: &UnitContext,
        before: &Cursor,
        limit: usize,
    ) -> Result<Vec<FetchedActivity>, FetchError> {
        Ok(self.fetch_page(context, before, limit).await?.activity)
    }

    /// Walks up to [`MAX_PAGES`] pages. With a category filter the result
    /// may be empty while `scanned_to` still moves the window down.
    async fn fetch_page(
        &self,
        context: &UnitContext,
        before: &Cursor,
        limit: usize,
    ) -> Result<FetchedPage, FetchError> {
        let category = category_filter(&context.key.resource)?;
        let mut scan = PageScan::new(before, category, limit);
        let mut page_before = before.external_id.parse::<u64>().ok();

        for page_number in 0..MAX_PAGES {
            let page = self.fetch_posts(context, page_before).await?;
            debug!(
                unit = %context.key,
                page = page_number,
                before = ?page_before,
                fetched = page.len(),
                "discourse page fetched"
            );
            match scan.absorb(page) {
                Some(next) => page_before = Some(next),
                None => break,
            }
        }

        Ok(scan.finish())
    }

    /// Post ids increase monotonically within a forum.
    fn cursor_ordering(&self, a: &Cursor, b: &Cursor) -> std::cmp::Ordering {
        match (a.external_id.parse::<u64>(), b.external_id.parse::<u64>()) {
            (Ok(x), Ok(y)) => x.cmp(&y),
            _ => a.cmp(b),
        }
    }
}
