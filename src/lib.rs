// src/lib.rs
// Public library surface for integration tests (and potential reuse).

pub mod config;
pub mod ingest;
pub mod metrics;

// ---- Re-exports for stable public API ----
pub use crate::config::{AcquireConfig, Credentials, TapConfig};
pub use crate::ingest::{
    AcquisitionLoop, Filter, LoopSummary, PaginationWalker, ResultId, ResultRecord,
    WalkOutcome,
};
