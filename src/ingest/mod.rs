// src/ingest/mod.rs
pub mod archive;
pub mod backoff;
pub mod providers;
pub mod scheduler;
pub mod store;
pub mod types;
pub mod walker;

use metrics::{describe_counter, describe_gauge};
use once_cell::sync::OnceCell;

pub use backoff::{BackoffCfg, BackoffScheduler, SharedCooldown};
pub use scheduler::{spawn_loops, AcquisitionLoop, LoopSummary};
pub use store::{FileStore, MemoryStore, ResultSink, WatermarkStore};
pub use types::{Filter, Page, PageCursor, ResultId, ResultRecord, ResultType, SearchClient};
pub use walker::{PaginationWalker, WalkOutcome};

/// One-time metrics registration (so series show up on /metrics).
pub fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("tap_search_calls_total", "Search calls issued.");
        describe_counter!(
            "tap_rate_limited_total",
            "Search calls answered with a rate-limit error."
        );
        describe_counter!(
            "tap_transient_errors_total",
            "Search calls failed with a non rate-limit error."
        );
        describe_counter!("tap_records_upserted_total", "Records written to the sink.");
        describe_counter!(
            "tap_records_skipped_total",
            "Records dropped for lacking an identifier."
        );
        describe_counter!("tap_empty_pages_total", "Pages that carried no records.");
        describe_counter!("tap_walks_total", "Completed pagination walks.");
        describe_gauge!(
            "tap_rate_limit_remaining",
            "Calls left in the current rate-limit window."
        );
        describe_gauge!("tap_watermark", "Stored watermark per filter.");
    });
}
