//! Telegram Bot API sink adapter.
//!
//! Delivers one item per `sendMessage` call. The base URL is configurable so
//! self-hosted bot API servers work unchanged. Throttling arrives either as
//! HTTP 429 with a `Retry-After` header or as `parameters.retry_after` in
//! the response body; both are honoured.
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;

use perch_common::{Delivery, Item, SinkError};

use crate::parse_retry_after;

#[derive(Clone)]
pub struct TelegramSink {
    http: reqwest::Client,
    base_url: String,
    bot_token: String,
}

impl TelegramSink {
    pub fn new(base_url: impl Into<String>, bot_token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            bot_token: bot_token.into(),
        }
    }
}

/// Envelope every Bot API response is wrapped in.
#[derive(Debug, Deserialize, Default)]
struct BotApiResponse {
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize, Default)]
struct ResponseParameters {
    #[serde(default)]
    retry_after: Option<u64>,
}

/// Plain-text rendering of a relayed item.
fn render_text(item: &Item) -> String {
    match &item.link {
        Some(link) => format!("{}: {}\n{}", item.author, item.text, link),
        None => format!("{}: {}", item.author, item.text),
    }
}

/// Map a failed `sendMessage` onto the sink failure taxonomy.
fn classify_failure(
    status: StatusCode,
    header_retry_after: Option<Duration>,
    body: &BotApiResponse,
) -> SinkError {
    let description = body
        .description
        .clone()
        .unwrap_or_else(|| format!("sendMessage failed with {status}"));

    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = body
            .parameters
            .as_ref()
            .and_then(|p| p.retry_after)
            .map(Duration::from_secs)
            .or(header_retry_after);
        return SinkError::RateLimited { retry_after };
    }
    if status.is_client_error() {
        // Bad chat id, blocked bot, malformed text: permanent for this item.
        return SinkError::Rejected(description);
    }
    SinkError::Transient(description)
}

#[async_trait]
impl Delivery for TelegramSink {
    async fn deliver(&self, destination_id: &str, item: &Item) -> Result<(), SinkError> {
        let url = format!("{}/bot{}/sendMessage", self.base_url, self.bot_token);
        let resp = self
            .http
            .post(&url)
            .json(&serde_json::json!({
                "chat_id": destination_id,
                "text": render_text(item),
            }))
            .send()
            .await
            .map_err(|e| SinkError::Transient(e.to_string()))?;

        let status = resp.status();
        let header_retry_after = parse_retry_after(resp.headers().get(RETRY_AFTER));
        let body: BotApiResponse = resp.json().await.unwrap_or_default();

        if status.is_success() && body.ok {
            debug!(destination_id, item_id = %item.item_id, "telegram.delivered");
            return Ok(());
        }
        Err(classify_failure(status, header_retry_after, &body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn item(link: Option<&str>) -> Item {
        Item {
            item_id: "1".into(),
            timestamp: Utc.timestamp_opt(0, 0).unwrap(),
            author: "acme".into(),
            text: "hello".into(),
            link: link.map(str::to_string),
        }
    }

    #[test]
    fn rendering_includes_author_and_link() {
        assert_eq!(
            render_text(&item(Some("https://x.com/i/status/1"))),
            "acme: hello\nhttps://x.com/i/status/1"
        );
        assert_eq!(render_text(&item(None)), "acme: hello");
    }

    #[test]
    fn body_retry_after_wins_over_header() {
        let body: BotApiResponse = serde_json::from_str(
            r#"{"ok": false, "description": "Too Many Requests", "parameters": {"retry_after": 31}}"#,
        )
        .unwrap();
        let err = classify_failure(
            StatusCode::TOO_MANY_REQUESTS,
            Some(Duration::from_secs(5)),
            &body,
        );
        assert!(matches!(
            err,
            SinkError::RateLimited {
                retry_after: Some(d)
            } if d == Duration::from_secs(31)
        ));
    }

    #[test]
    fn client_errors_are_rejections() {
        let body: BotApiResponse =
            serde_json::from_str(r#"{"ok": false, "description": "chat not found"}"#).unwrap();
        match classify_failure(StatusCode::BAD_REQUEST, None, &body) {
            SinkError::Rejected(reason) => assert_eq!(reason, "chat not found"),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn server_errors_are_transient() {
        let err = classify_failure(StatusCode::BAD_GATEWAY, None, &BotApiResponse::default());
        assert!(matches!(err, SinkError::Transient(_)));
    }
}
