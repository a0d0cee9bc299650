//! The relay core: dedup, backoff, per-source scheduling, and the poll →
//! deliver → commit pipeline.
//!
//! Everything here is written against the capability traits in
//! `perch-common`; no concrete adapter or store type appears below this
//! crate's public surface, so the whole pipeline is testable with in-memory
//! fakes.
pub mod backoff;
pub mod dedup;
pub mod pipeline;
pub mod scheduler;

pub use backoff::Backoff;
pub use pipeline::{CycleError, CycleReport, RelayPipeline, SinkDisruption};
pub use scheduler::{RelayEvent, RelayScheduler, RelayTuning, ShutdownHandle};
