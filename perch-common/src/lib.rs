//! Common types and contracts shared across Perch crates.
//!
//! This crate defines the relay data model, the error taxonomy, the
//! capability traits implemented by concrete adapters, and the shared
//! observability helpers. It is intentionally lightweight and
//! dependency-minimal so that every crate can depend on it without
//! introducing heavy transitive costs.
//!
//! # Overview
//!
//! - [`MonitoredSource`], [`Item`], [`Cursor`], [`Checkpoint`]: relay data model
//! - [`FeedSource`], [`Delivery`], [`CheckpointStore`]: capability contracts
//! - [`SourceError`], [`SinkError`], [`StoreError`]: failure taxonomy
//! - [`observability`]: centralised tracing/logging initialisation
use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod observability;

/// One upstream feed/account to watch and where to relay it.
///
/// Created from configuration; immutable during a run except for the
/// enabled flag, which the scheduler flips off when the upstream reports
/// the source is gone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoredSource {
    /// Opaque upstream identifier (e.g. a Twitter user id).
    pub source_id: String,
    /// Destination for relayed items (e.g. a Telegram chat id).
    pub destination_id: String,
    /// How often to poll this source.
    pub poll_interval: Duration,
    /// Disabled sources are never polled.
    pub enabled: bool,
}

/// Position marker meaning "everything up to here has been processed".
///
/// Ordered by `(timestamp, item_id)`; the id breaks timestamp ties the same
/// way the source adapter orders items within a page. `Option<Cursor>` is
/// used where "never polled" is a valid state.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Cursor {
    pub timestamp: DateTime<Utc>,
    pub item_id: String,
}

/// One unit of content fetched from an upstream source. Immutable once fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    /// Unique within its source.
    pub item_id: String,
    pub timestamp: DateTime<Utc>,
    pub author: String,
    pub text: String,
    /// Canonical link to the original post, when the source provides one.
    pub link: Option<String>,
}

impl Item {
    /// The cursor position naming this item.
    pub fn position(&self) -> Cursor {
        Cursor {
            timestamp: self.timestamp,
            item_id: self.item_id.clone(),
        }
    }
}

/// Durable per-source state loaded from the checkpoint store.
#[derive(Debug, Clone, Default)]
pub struct Checkpoint {
    /// Last committed position, `None` if the source was never polled.
    pub cursor: Option<Cursor>,
    /// Recently delivered item ids, retained for a bounded window.
    pub delivered: HashSet<String>,
}

/// A finite page of new items produced by one `fetch_since` call.
#[derive(Debug, Clone, Default)]
pub struct FetchPage {
    /// Strictly newer than the requested cursor, ascending `(timestamp, item_id)`.
    pub items: Vec<Item>,
}

/// Failure modes of an upstream source adapter.
#[derive(thiserror::Error, Debug)]
pub enum SourceError {
    /// Upstream signalled throttling; honor `retry_after` when present.
    #[error("upstream rate limited (retry_after={retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    /// Credentials are stale; polling pauses until they are refreshed externally.
    #[error("upstream credentials expired or rejected")]
    AuthExpired,

    /// Network-level failure; retried with bounded exponential backoff.
    #[error("transient source failure: {0}")]
    Transient(String),

    /// The monitored account/feed no longer exists. Terminal for the source.
    #[error("monitored source no longer exists")]
    Gone,
}

/// Failure modes of a downstream sink adapter, per delivery attempt.
#[derive(thiserror::Error, Debug)]
pub enum SinkError {
    /// Destination throttled us; retry the same item later.
    #[error("destination rate limited (retry_after={retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    /// Content or destination invalid. Permanent for this item: log and skip.
    #[error("destination rejected item: {0}")]
    Rejected(String),

    /// Network-level failure; retried with backoff, bounded attempts.
    #[error("transient delivery failure: {0}")]
    Transient(String),
}

/// Failure modes of the checkpoint store.
///
/// Fatal only for the affected commit: the cycle's progress is lost and
/// re-derived safely on the next fetch, since the durable cursor did not
/// advance.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("checkpoint store unavailable: {0}")]
    Unavailable(String),
}

/// Capability contract for an upstream source.
///
/// Implementations encapsulate auth, pagination, and protocol details. Items
/// must be strictly newer than `cursor`, ascending by `(timestamp, item_id)`,
/// capped at the adapter's page budget (the remainder is picked up by the
/// next poll), and never silently dropped within the fetched page.
#[async_trait]
pub trait FeedSource: Send + Sync {
    async fn fetch_since(
        &self,
        source_id: &str,
        cursor: Option<&Cursor>,
    ) -> Result<FetchPage, SourceError>;
}

/// Capability contract for the downstream destination.
///
/// One call per item; the pipeline treats each delivery independently and
/// assumes no batching guarantee of the sink.
#[async_trait]
pub trait Delivery: Send + Sync {
    async fn deliver(&self, destination_id: &str, item: &Item) -> Result<(), SinkError>;
}

/// Capability contract for durable per-source checkpoints.
///
/// `commit` atomically advances the cursor and records delivered ids, or
/// fails entirely; no partial update is visible to a subsequent `load`.
/// Committing the same `(cursor, ids)` twice must be a no-op the second
/// time. Callers must not advance in-memory state when `commit` errors.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, source_id: &str) -> Result<Checkpoint, StoreError>;

    async fn commit(
        &self,
        source_id: &str,
        cursor: &Cursor,
        delivered: &[String],
    ) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64, id: &str) -> Cursor {
        Cursor {
            timestamp: Utc.timestamp_opt(secs, 0).unwrap(),
            item_id: id.to_string(),
        }
    }

    #[test]
    fn cursor_orders_by_timestamp_then_id() {
        assert!(at(1, "9") < at(2, "1"));
        assert!(at(5, "10") < at(5, "11"));
        assert_eq!(at(5, "10"), at(5, "10"));
    }

    #[test]
    fn item_position_round_trips() {
        let item = Item {
            item_id: "42".into(),
            timestamp: Utc.timestamp_opt(7, 0).unwrap(),
            author: "someone".into(),
            text: "hello".into(),
            link: None,
        };
        assert_eq!(item.position(), at(7, "42"));
    }
}
