//! Twitter/X timeline source adapter.
//!
//! Submodules provide the HTTP client wrapper and strongly typed response
//! models. The client speaks the v2 user-timeline endpoint with bearer auth
//! and maps upstream failures onto the shared `SourceError` taxonomy.
pub mod client;
pub mod types;

pub use client::TwitterTimeline;
