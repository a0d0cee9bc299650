//! Poll scheduler: one task per monitored source, a shared fetch budget,
//! and cooperative shutdown.
//!
//! Each source runs the state machine
//! `Idle -> Polling -> { Delivering -> Committing -> Idle } | BackingOff -> Idle`
//! strictly sequentially; the shared semaphore bounds how many sources may
//! be mid-cycle at once so a high source count cannot exceed the upstream's
//! aggregate rate limit. Shutdown is signalled over a broadcast channel and
//! only observed at the waiting points, never inside a cycle, so an
//! in-flight cycle always finishes its delivery attempt and commit.
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use perch_common::{CheckpointStore, Delivery, FeedSource, MonitoredSource, SourceError};

use crate::backoff::Backoff;
use crate::pipeline::{CycleError, CycleReport, RelayPipeline, SinkDisruption};

/// Scheduler and pipeline knobs, decoupled from the config file format.
#[derive(Debug, Clone)]
pub struct RelayTuning {
    /// Global budget: at most this many poll cycles in flight at once.
    pub max_concurrent_fetches: usize,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// How long a source stays paused after an auth failure.
    pub auth_retry: Duration,
    pub delivery_attempts: u32,
}

impl Default for RelayTuning {
    fn default() -> Self {
        Self {
            max_concurrent_fetches: 4,
            backoff_base: Duration::from_secs(5),
            backoff_cap: Duration::from_secs(300),
            auth_retry: Duration::from_secs(300),
            delivery_attempts: 3,
        }
    }
}

/// Operator-visible notifications emitted by source tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    /// The upstream account/feed no longer exists; polling stopped for good.
    SourceDisabled { source_id: String },
    /// Credentials were rejected; polling paused until the next probe.
    AuthStalled { source_id: String },
}

#[derive(Clone)]
pub struct ShutdownHandle {
    tx: broadcast::Sender<()>,
}

impl ShutdownHandle {
    pub fn signal(&self) {
        let _ = self.tx.send(());
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }
}

/// What a source task does after finishing a cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
enum NextPoll {
    After(Duration),
    Disable,
}

/// Pure transition function from a cycle outcome to the next wait.
///
/// Kept free of I/O and time so every branch of the state machine is
/// directly testable.
fn plan_next(
    outcome: &Result<CycleReport, CycleError>,
    backoff: &mut Backoff,
    tuning: &RelayTuning,
    poll_interval: Duration,
) -> NextPoll {
    match outcome {
        Ok(report) => match &report.disruption {
            SinkDisruption::None => {
                backoff.reset();
                NextPoll::After(poll_interval)
            }
            SinkDisruption::RateLimited { retry_after } => {
                NextPoll::After(backoff.next_delay().max(retry_after.unwrap_or_default()))
            }
            SinkDisruption::TransientExhausted => NextPoll::After(backoff.next_delay()),
        },
        Err(CycleError::Fetch(SourceError::RateLimited { retry_after })) => {
            NextPoll::After(backoff.next_delay().max(retry_after.unwrap_or_default()))
        }
        Err(CycleError::Fetch(SourceError::Transient(_))) => NextPoll::After(backoff.next_delay()),
        Err(CycleError::Fetch(SourceError::AuthExpired)) => {
            backoff.reset();
            NextPoll::After(tuning.auth_retry)
        }
        Err(CycleError::Fetch(SourceError::Gone)) => NextPoll::Disable,
        Err(CycleError::Store(_)) => NextPoll::After(backoff.next_delay()),
    }
}

pub struct RelayScheduler {
    pipeline: Arc<RelayPipeline>,
    tuning: RelayTuning,
    budget: Arc<Semaphore>,
    joinset: JoinSet<Result<()>>,
    shutdown_tx: broadcast::Sender<()>,
    events_tx: mpsc::UnboundedSender<RelayEvent>,
}

impl RelayScheduler {
    /// Build a scheduler over the given capabilities. The returned receiver
    /// carries operator-visible [`RelayEvent`]s.
    pub fn new(
        store: Arc<dyn CheckpointStore>,
        source: Arc<dyn FeedSource>,
        sink: Arc<dyn Delivery>,
        tuning: RelayTuning,
    ) -> (Self, mpsc::UnboundedReceiver<RelayEvent>) {
        let (shutdown_tx, _) = broadcast::channel(16);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let pipeline = Arc::new(
            RelayPipeline::new(store, source, sink)
                .with_delivery_attempts(tuning.delivery_attempts),
        );
        let budget = Arc::new(Semaphore::new(tuning.max_concurrent_fetches.max(1)));
        (
            Self {
                pipeline,
                tuning,
                budget,
                joinset: JoinSet::new(),
                shutdown_tx,
                events_tx,
            },
            events_rx,
        )
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown_tx.clone(),
        }
    }

    /// Spawn the polling task for one source. Disabled sources are skipped.
    pub fn watch(&mut self, src: MonitoredSource) {
        if !src.enabled {
            debug!(source_id = %src.source_id, "scheduler.source_disabled_in_config");
            return;
        }
        let pipeline = self.pipeline.clone();
        let tuning = self.tuning.clone();
        let budget = self.budget.clone();
        let shutdown = self.shutdown_tx.subscribe();
        let events = self.events_tx.clone();
        self.joinset
            .spawn(source_loop(pipeline, tuning, budget, shutdown, events, src));
    }

    /// Signal shutdown and wait for every source task to finish its cycle.
    pub async fn graceful_shutdown(mut self) -> Result<()> {
        let _ = self.shutdown_tx.send(());
        while let Some(res) = self.joinset.join_next().await {
            res??;
        }
        Ok(())
    }

    /// Block until CTRL-C (or an external signal), then shut down cleanly.
    pub async fn run_until_ctrl_c(self) -> Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = shutdown_rx.recv() => {}
        }
        self.graceful_shutdown().await
    }
}

async fn source_loop(
    pipeline: Arc<RelayPipeline>,
    tuning: RelayTuning,
    budget: Arc<Semaphore>,
    mut shutdown: broadcast::Receiver<()>,
    events: mpsc::UnboundedSender<RelayEvent>,
    src: MonitoredSource,
) -> Result<()> {
    let mut backoff = Backoff::new(tuning.backoff_base, tuning.backoff_cap);
    // First poll fires immediately; afterwards `plan_next` decides.
    let mut delay = Duration::ZERO;

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                debug!(source_id = %src.source_id, "scheduler.shutdown");
                return Ok(());
            }
            _ = sleep(delay) => {}
        }

        let permit = tokio::select! {
            _ = shutdown.recv() => return Ok(()),
            permit = budget.acquire() => {
                permit.map_err(|_| anyhow::anyhow!("fetch budget semaphore closed"))?
            }
        };

        // The permit spans the whole cycle: fetch, deliveries, and commit.
        let outcome = pipeline.run_cycle(&src).await;
        drop(permit);

        match &outcome {
            Ok(report) if report.disruption != SinkDisruption::None => {
                warn!(
                    source_id = %src.source_id,
                    deferred = report.deferred,
                    disruption = ?report.disruption,
                    "scheduler.cycle_disrupted"
                );
            }
            Ok(_) => {}
            Err(CycleError::Fetch(SourceError::AuthExpired)) => {
                warn!(source_id = %src.source_id, "scheduler.auth_stalled");
                let _ = events.send(RelayEvent::AuthStalled {
                    source_id: src.source_id.clone(),
                });
            }
            Err(CycleError::Fetch(SourceError::Gone)) => {
                error!(source_id = %src.source_id, "scheduler.source_gone");
                let _ = events.send(RelayEvent::SourceDisabled {
                    source_id: src.source_id.clone(),
                });
            }
            Err(e) => {
                warn!(
                    source_id = %src.source_id,
                    error = %e,
                    attempt = backoff.attempt(),
                    "scheduler.cycle_failed"
                );
            }
        }

        match plan_next(&outcome, &mut backoff, &tuning, src.poll_interval) {
            NextPoll::After(next) => delay = next,
            NextPoll::Disable => {
                info!(source_id = %src.source_id, "scheduler.source_stopped");
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use perch_common::StoreError;

    fn tuning() -> RelayTuning {
        RelayTuning {
            max_concurrent_fetches: 2,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(60),
            auth_retry: Duration::from_secs(120),
            delivery_attempts: 3,
        }
    }

    fn clean_report() -> CycleReport {
        CycleReport {
            fetched: 0,
            delivered: 0,
            rejected: 0,
            deferred: 0,
            disruption: SinkDisruption::None,
        }
    }

    #[test]
    fn clean_cycle_resets_backoff_and_waits_the_interval() {
        let t = tuning();
        let mut b = Backoff::new(t.backoff_base, t.backoff_cap);
        b.next_delay();
        b.next_delay();

        let next = plan_next(&Ok(clean_report()), &mut b, &t, Duration::from_secs(30));
        assert_eq!(next, NextPoll::After(Duration::from_secs(30)));
        assert_eq!(b.attempt(), 0);
    }

    #[test]
    fn upstream_retry_after_floors_the_backoff_delay() {
        let t = tuning();
        let mut b = Backoff::new(t.backoff_base, t.backoff_cap);
        let outcome = Err(CycleError::Fetch(SourceError::RateLimited {
            retry_after: Some(Duration::from_secs(90)),
        }));
        match plan_next(&outcome, &mut b, &t, Duration::from_secs(30)) {
            NextPoll::After(d) => assert!(d >= Duration::from_secs(90)),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(b.attempt(), 1);
    }

    #[test]
    fn sink_throttle_backs_off_like_a_fetch_throttle() {
        let t = tuning();
        let mut b = Backoff::new(t.backoff_base, t.backoff_cap);
        let outcome = Ok(CycleReport {
            disruption: SinkDisruption::RateLimited {
                retry_after: Some(Duration::from_secs(45)),
            },
            deferred: 2,
            ..clean_report()
        });
        match plan_next(&outcome, &mut b, &t, Duration::from_secs(30)) {
            NextPoll::After(d) => assert!(d >= Duration::from_secs(45)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn auth_expiry_pauses_for_the_auth_retry_interval() {
        let t = tuning();
        let mut b = Backoff::new(t.backoff_base, t.backoff_cap);
        let outcome = Err(CycleError::Fetch(SourceError::AuthExpired));
        assert_eq!(
            plan_next(&outcome, &mut b, &t, Duration::from_secs(30)),
            NextPoll::After(t.auth_retry)
        );
        assert_eq!(b.attempt(), 0);
    }

    #[test]
    fn gone_disables_the_source() {
        let t = tuning();
        let mut b = Backoff::new(t.backoff_base, t.backoff_cap);
        let outcome = Err(CycleError::Fetch(SourceError::Gone));
        assert_eq!(
            plan_next(&outcome, &mut b, &t, Duration::from_secs(30)),
            NextPoll::Disable
        );
    }

    #[test]
    fn store_failures_back_off_instead_of_hot_looping() {
        let t = tuning();
        let mut b = Backoff::new(t.backoff_base, t.backoff_cap);
        let outcome = Err(CycleError::Store(StoreError::Unavailable("down".into())));
        match plan_next(&outcome, &mut b, &t, Duration::from_secs(30)) {
            NextPoll::After(d) => assert!(d >= Duration::from_millis(1)),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(b.attempt(), 1);
    }
}
