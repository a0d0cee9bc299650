//! Client for the Twitter/X v2 user-timeline endpoint.
//!
//! One `fetch_since` call is one bounded page: items strictly newer than the
//! cursor, ascending `(created_at, id)`, truncated to the page cap so a long
//! backlog is drained across successive polls instead of one unbounded call.
use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::RETRY_AFTER;
use reqwest::StatusCode;
use tracing::debug;

use perch_common::{Cursor, FeedSource, FetchPage, Item, SourceError};

use super::types::TimelineResponse;
use crate::parse_retry_after;

#[derive(Clone)]
pub struct TwitterTimeline {
    http: reqwest::Client,
    base_url: String,
    bearer: String,
    page_cap: u32,
}

impl TwitterTimeline {
    pub fn new(base_url: impl Into<String>, bearer_token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            bearer: bearer_token.into(),
            page_cap: 100,
        }
    }

    /// Cap on items returned per poll; the remainder waits for the next cycle.
    pub fn with_page_cap(mut self, cap: u32) -> Self {
        self.page_cap = cap.max(1);
        self
    }
}

/// Map a non-success timeline status onto the source failure taxonomy.
fn classify_status(status: StatusCode, retry_after: Option<Duration>) -> SourceError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => SourceError::RateLimited { retry_after },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SourceError::AuthExpired,
        StatusCode::NOT_FOUND => SourceError::Gone,
        other => SourceError::Transient(format!("timeline request failed with {other}")),
    }
}

/// Shape a raw timeline response into an ordered, cursor-filtered page.
///
/// The endpoint returns newest-first and may overlap the cursor on retries;
/// re-sorting and filtering here keeps the `fetch_since` contract honest
/// regardless of upstream quirks. A tweet without a parseable `created_at`
/// fails the whole page rather than being dropped silently.
fn page_from_response(
    resp: TimelineResponse,
    cursor: Option<&Cursor>,
    page_cap: usize,
) -> Result<FetchPage, SourceError> {
    let usernames: HashMap<String, String> = resp
        .includes
        .and_then(|i| i.users)
        .unwrap_or_default()
        .into_iter()
        .map(|u| (u.id, u.username))
        .collect();

    let mut items = Vec::new();
    for tw in resp.data.unwrap_or_default() {
        let raw_ts = tw
            .created_at
            .as_deref()
            .ok_or_else(|| SourceError::Transient(format!("tweet {} missing created_at", tw.id)))?;
        let timestamp: DateTime<Utc> = DateTime::parse_from_rfc3339(raw_ts)
            .map_err(|e| SourceError::Transient(format!("tweet {}: bad created_at: {e}", tw.id)))?
            .with_timezone(&Utc);

        let author = tw
            .author_id
            .as_ref()
            .and_then(|id| usernames.get(id).cloned())
            .or(tw.author_id.clone())
            .unwrap_or_default();
        let link = Some(format!("https://x.com/i/status/{}", tw.id));

        items.push(Item {
            item_id: tw.id,
            timestamp,
            author,
            text: tw.text,
            link,
        });
    }

    if let Some(cur) = cursor {
        items.retain(|i| i.position() > *cur);
    }
    items.sort_by(|a, b| a.position().cmp(&b.position()));
    items.truncate(page_cap);

    Ok(FetchPage { items })
}

#[async_trait]
impl FeedSource for TwitterTimeline {
    async fn fetch_since(
        &self,
        source_id: &str,
        cursor: Option<&Cursor>,
    ) -> Result<FetchPage, SourceError> {
        let url = format!("{}/2/users/{}/tweets", self.base_url, source_id);
        let max_results = self.page_cap.clamp(5, 100).to_string();

        let mut req = self
            .http
            .get(&url)
            .bearer_auth(&self.bearer)
            .query(&[
                ("max_results", max_results.as_str()),
                ("tweet.fields", "created_at,author_id"),
                ("expansions", "author_id"),
                ("user.fields", "username"),
            ]);
        if let Some(cur) = cursor {
            req = req.query(&[("since_id", cur.item_id.as_str())]);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| SourceError::Transient(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(resp.headers().get(RETRY_AFTER));
            return Err(classify_status(status, retry_after));
        }

        let body: TimelineResponse = resp
            .json()
            .await
            .map_err(|e| SourceError::Transient(format!("timeline decode failed: {e}")))?;

        let page = page_from_response(body, cursor, self.page_cap as usize)?;
        debug!(source_id, items = page.items.len(), "twitter.fetch");
        Ok(page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixture() -> TimelineResponse {
        serde_json::from_str(
            r#"{
              "data": [
                {"id": "103", "text": "third", "author_id": "7", "created_at": "2026-08-01T00:00:03Z"},
                {"id": "101", "text": "first", "author_id": "7", "created_at": "2026-08-01T00:00:01Z"},
                {"id": "102", "text": "second", "author_id": "7", "created_at": "2026-08-01T00:00:02Z"}
              ],
              "includes": {"users": [{"id": "7", "username": "acme"}]},
              "meta": {"result_count": 3, "newest_id": "103"}
            }"#,
        )
        .unwrap()
    }

    fn at(secs: u32, id: &str) -> Cursor {
        Cursor {
            timestamp: Utc.with_ymd_and_hms(2026, 8, 1, 0, 0, secs).unwrap(),
            item_id: id.to_string(),
        }
    }

    #[test]
    fn newest_first_response_comes_out_ascending() {
        let page = page_from_response(fixture(), None, 100).unwrap();
        let ids: Vec<_> = page.items.iter().map(|i| i.item_id.as_str()).collect();
        assert_eq!(ids, ["101", "102", "103"]);
        assert_eq!(page.items[0].author, "acme");
        assert!(page.items[0].link.as_deref().unwrap().contains("101"));
    }

    #[test]
    fn items_at_or_before_cursor_are_filtered() {
        let page = page_from_response(fixture(), Some(&at(2, "102")), 100).unwrap();
        let ids: Vec<_> = page.items.iter().map(|i| i.item_id.as_str()).collect();
        assert_eq!(ids, ["103"]);
    }

    #[test]
    fn page_cap_keeps_the_oldest_items() {
        // Deferring the newest to the next poll preserves in-order delivery.
        let page = page_from_response(fixture(), None, 2).unwrap();
        let ids: Vec<_> = page.items.iter().map(|i| i.item_id.as_str()).collect();
        assert_eq!(ids, ["101", "102"]);
    }

    #[test]
    fn missing_created_at_fails_the_page() {
        let resp: TimelineResponse =
            serde_json::from_str(r#"{"data": [{"id": "1", "text": "x"}]}"#).unwrap();
        assert!(matches!(
            page_from_response(resp, None, 100),
            Err(SourceError::Transient(_))
        ));
    }

    #[test]
    fn status_mapping_covers_the_taxonomy() {
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, Some(Duration::from_secs(9))),
            SourceError::RateLimited {
                retry_after: Some(d)
            } if d == Duration::from_secs(9)
        ));
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, None),
            SourceError::AuthExpired
        ));
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND, None),
            SourceError::Gone
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, None),
            SourceError::Transient(_)
        ));
    }
}
