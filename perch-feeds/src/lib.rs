//! Concrete source and sink adapters used by the relay.
//!
//! The core only depends on the `FeedSource`/`Delivery` contracts from
//! `perch-common`; this crate supplies the Twitter/X timeline source and the
//! Telegram Bot API sink, including the mapping from HTTP outcomes to the
//! shared failure taxonomy. Secrets never appear in log output.
pub mod telegram;
pub mod twitter;

pub use telegram::TelegramSink;
pub use twitter::TwitterTimeline;

use std::time::Duration;

/// Parse a `Retry-After` header value (delta-seconds form only).
pub(crate) fn parse_retry_after(value: Option<&reqwest::header::HeaderValue>) -> Option<Duration> {
    value
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn retry_after_parses_delta_seconds() {
        let v = HeaderValue::from_static("12");
        assert_eq!(
            parse_retry_after(Some(&v)),
            Some(Duration::from_secs(12))
        );
    }

    #[test]
    fn retry_after_ignores_garbage() {
        let v = HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT");
        assert_eq!(parse_retry_after(Some(&v)), None);
        assert_eq!(parse_retry_after(None), None);
    }
}
