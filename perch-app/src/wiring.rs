//! Construction of the running relay from loaded configuration.
//!
//! Phased like the rest of the workspace: durable store first, then the
//! adapters, then the scheduler with every enabled source registered.
//! All dependencies are passed down by construction; nothing is ambient.
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use perch_config::PerchConfig;
use perch_feeds::{TelegramSink, TwitterTimeline};
use perch_relay::{RelayEvent, RelayScheduler, RelayTuning};
use perch_store::SqliteCheckpointStore;

pub async fn build(cfg: &PerchConfig) -> Result<RelayScheduler> {
    let store = SqliteCheckpointStore::connect(
        &cfg.store.database_url,
        cfg.store.retention_per_source,
    )
    .await?;

    let source = TwitterTimeline::new(cfg.twitter.base_url.as_str(), cfg.twitter.bearer_token.as_str())
        .with_page_cap(cfg.relay.max_items_per_poll);
    let sink = TelegramSink::new(cfg.telegram.base_url.as_str(), cfg.telegram.bot_token.as_str());

    let tuning = RelayTuning {
        max_concurrent_fetches: cfg.relay.max_concurrent_fetches,
        backoff_base: Duration::from_secs(cfg.relay.backoff_base_secs),
        backoff_cap: Duration::from_secs(cfg.relay.backoff_cap_secs),
        auth_retry: Duration::from_secs(cfg.relay.auth_retry_secs),
        delivery_attempts: cfg.relay.delivery_attempts,
    };

    let (mut scheduler, events) =
        RelayScheduler::new(Arc::new(store), Arc::new(source), Arc::new(sink), tuning);

    let sources = cfg.monitored_sources();
    let enabled = sources.iter().filter(|s| s.enabled).count();
    info!(total = sources.len(), enabled, "wiring.sources");
    for src in sources {
        scheduler.watch(src);
    }

    spawn_event_logger(events);
    Ok(scheduler)
}

/// Surface scheduler alerts in the operator log.
fn spawn_event_logger(mut events: mpsc::UnboundedReceiver<RelayEvent>) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                RelayEvent::SourceDisabled { source_id } => {
                    error!(source_id, "source no longer exists; polling disabled");
                }
                RelayEvent::AuthStalled { source_id } => {
                    warn!(source_id, "upstream rejected credentials; polling paused");
                }
            }
        }
    });
}
