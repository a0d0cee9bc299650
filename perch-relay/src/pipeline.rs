//! Relay pipeline: one poll cycle for one source.
//!
//! Order of operations is load → fetch → sieve → deliver → commit. The
//! commit carries the cursor of the last item actually handled this cycle
//! (not the fetch cursor), so a mid-cycle sink failure degrades to
//! re-fetching and re-filtering instead of skipping undelivered items.
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, info, warn};

use perch_common::{
    CheckpointStore, Cursor, Delivery, FeedSource, MonitoredSource, SinkError, SourceError,
    StoreError,
};

use crate::dedup::{sieve, Sieved};

/// Why a delivery loop stopped before draining the batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkDisruption {
    None,
    /// Destination throttled us; remaining items are deferred.
    RateLimited { retry_after: Option<Duration> },
    /// Transient sink failures exhausted the in-cycle attempt budget.
    TransientExhausted,
}

/// Summary of one poll cycle, used by the scheduler to pick the next state.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub fetched: usize,
    pub delivered: usize,
    pub rejected: usize,
    pub deferred: usize,
    pub disruption: SinkDisruption,
}

/// Cycle-level failures the scheduler branches on.
#[derive(thiserror::Error, Debug)]
pub enum CycleError {
    #[error(transparent)]
    Fetch(#[from] SourceError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct RelayPipeline {
    store: Arc<dyn CheckpointStore>,
    source: Arc<dyn FeedSource>,
    sink: Arc<dyn Delivery>,
    /// In-cycle attempts per item on transient sink failures.
    delivery_attempts: u32,
    /// Pause between those attempts (zero in tests).
    retry_pause: Duration,
}

impl RelayPipeline {
    pub fn new(
        store: Arc<dyn CheckpointStore>,
        source: Arc<dyn FeedSource>,
        sink: Arc<dyn Delivery>,
    ) -> Self {
        Self {
            store,
            source,
            sink,
            delivery_attempts: 3,
            retry_pause: Duration::from_millis(250),
        }
    }

    pub fn with_delivery_attempts(mut self, attempts: u32) -> Self {
        self.delivery_attempts = attempts.max(1);
        self
    }

    pub fn with_retry_pause(mut self, pause: Duration) -> Self {
        self.retry_pause = pause;
        self
    }

    /// Run one poll cycle: fetch new items, filter against the delivered-id
    /// window, deliver in order, then commit up to the last handled item.
    ///
    /// Per-item failures never abort the cycle; the first sink throttle (or
    /// an exhausted transient) stops the delivery loop and defers the rest
    /// to the next cycle. A commit failure surfaces as `CycleError::Store`
    /// and no in-memory state is advanced on it.
    pub async fn run_cycle(&self, src: &MonitoredSource) -> Result<CycleReport, CycleError> {
        let checkpoint = self.store.load(&src.source_id).await?;
        let page = self
            .source
            .fetch_since(&src.source_id, checkpoint.cursor.as_ref())
            .await?;
        let fetched = page.items.len();

        let Sieved { fresh, fetched_tip } = sieve(page.items, &checkpoint.delivered);
        debug!(
            source_id = %src.source_id,
            fetched,
            fresh = fresh.len(),
            "cycle.sieved"
        );

        let total_fresh = fresh.len();
        let mut handled_ids: Vec<String> = Vec::new();
        let mut last_handled: Option<Cursor> = None;
        let mut delivered = 0usize;
        let mut rejected = 0usize;
        let mut disruption = SinkDisruption::None;

        'batch: for item in &fresh {
            let mut attempt = 0u32;
            loop {
                match self.sink.deliver(&src.destination_id, item).await {
                    Ok(()) => {
                        delivered += 1;
                        handled_ids.push(item.item_id.clone());
                        last_handled = Some(item.position());
                        break;
                    }
                    Err(SinkError::Rejected(reason)) => {
                        // Permanent for this item: record it as handled so a
                        // bad item can never wedge its source.
                        warn!(
                            source_id = %src.source_id,
                            item_id = %item.item_id,
                            reason,
                            "cycle.item_rejected"
                        );
                        rejected += 1;
                        handled_ids.push(item.item_id.clone());
                        last_handled = Some(item.position());
                        break;
                    }
                    Err(SinkError::RateLimited { retry_after }) => {
                        disruption = SinkDisruption::RateLimited { retry_after };
                        break 'batch;
                    }
                    Err(SinkError::Transient(cause)) => {
                        attempt += 1;
                        if attempt >= self.delivery_attempts {
                            warn!(
                                source_id = %src.source_id,
                                item_id = %item.item_id,
                                cause,
                                attempts = attempt,
                                "cycle.delivery_attempts_exhausted"
                            );
                            disruption = SinkDisruption::TransientExhausted;
                            break 'batch;
                        }
                        sleep(self.retry_pause * attempt).await;
                    }
                }
            }
        }

        let handled = handled_ids.len();
        let deferred = total_fresh - handled;

        // With nothing deferred the cursor may jump to the fetched tip,
        // which also covers pages that were entirely duplicates. With a
        // partial batch it stops at the last handled item so the remainder
        // is re-fetched next cycle.
        let commit_cursor = if deferred == 0 {
            fetched_tip
        } else {
            last_handled
        };

        if let Some(cursor) = commit_cursor {
            let already_there =
                handled_ids.is_empty() && checkpoint.cursor.as_ref() >= Some(&cursor);
            if !already_there {
                self.store
                    .commit(&src.source_id, &cursor, &handled_ids)
                    .await?;
            }
        }

        if delivered > 0 || deferred > 0 {
            info!(
                source_id = %src.source_id,
                fetched,
                delivered,
                rejected,
                deferred,
                "cycle.complete"
            );
        }

        Ok(CycleReport {
            fetched,
            delivered,
            rejected,
            deferred,
            disruption,
        })
    }
}
