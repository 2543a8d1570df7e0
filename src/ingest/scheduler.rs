// src/ingest/scheduler.rs
use anyhow::Result;
use metrics::gauge;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::acquire::AcquireConfig;
use crate::ingest::backoff::{BackoffScheduler, SharedCooldown};
use crate::ingest::store::{ResultSink, WatermarkStore};
use crate::ingest::types::{Cancelled, Filter, ResultId, SearchClient};
use crate::ingest::walker::PaginationWalker;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopSummary {
    pub filter: Filter,
    pub walks: u64,
    pub records: u64,
    pub watermark: Option<ResultId>,
}

/// Walk, commit the watermark, walk again, until cancelled.
pub struct AcquisitionLoop {
    filter: Filter,
    cfg: AcquireConfig,
    walker: PaginationWalker,
    watermarks: Arc<dyn WatermarkStore>,
    cancel: CancellationToken,
}

impl AcquisitionLoop {
    pub fn new(
        filter: Filter,
        cfg: AcquireConfig,
        client: Arc<dyn SearchClient>,
        watermarks: Arc<dyn WatermarkStore>,
        sink: Arc<dyn ResultSink>,
        cooldown: SharedCooldown,
        cancel: CancellationToken,
    ) -> Self {
        let backoff = Arc::new(BackoffScheduler::new(
            cfg.backoff(),
            cooldown,
            cancel.clone(),
        ));
        let walker = PaginationWalker::new(client, sink, backoff, cfg.empty_page_pause());
        Self {
            filter,
            cfg,
            walker,
            watermarks,
            cancel,
        }
    }

    /// Runs until the cancellation token fires. Errors only when the initial
    /// watermark read fails.
    pub async fn run(&self) -> Result<LoopSummary> {
        let key = self.filter.key();
        let mut summary = LoopSummary {
            filter: self.filter.clone(),
            ..Default::default()
        };

        let mut since = if self.cfg.clean_start {
            tracing::info!(filter = %key, "clean start, ignoring stored watermark");
            None
        } else {
            self.watermarks.get(&self.filter).await?
        };
        summary.watermark = since;
        tracing::info!(filter = %key, since_id = ?since.map(|s| s.0), "collecting from the search API");

        while !self.cancel.is_cancelled() {
            let outcome = match self.walker.walk(&self.filter, since).await {
                Ok(o) => o,
                Err(Cancelled) => break,
            };
            summary.walks += 1;
            summary.records += outcome.total_records as u64;

            if let Some(new_id) = outcome.max_id {
                match self.commit(new_id).await {
                    Ok(stored) => since = since.max(Some(stored)),
                    Err(Cancelled) => break,
                }
                summary.watermark = since;
            }

            tracing::info!(
                filter = %key,
                records = outcome.total_records,
                pages = outcome.pages,
                since_id = ?since.map(|s| s.0),
                "walk complete"
            );
        }

        tracing::warn!(filter = %key, walks = summary.walks, "acquisition loop stopped");
        Ok(summary)
    }

    /// Store `candidate` unless the stored watermark is already at least as high.
    /// Returns the watermark in effect afterwards.
    async fn commit(&self, candidate: ResultId) -> Result<ResultId, Cancelled> {
        let backoff = self.walker.backoff();
        let stored = backoff
            .persist(|| self.watermarks.get(&self.filter))
            .await?;
        if let Some(s) = stored.filter(|s| *s >= candidate) {
            return Ok(s);
        }
        backoff
            .persist(|| self.watermarks.set(&self.filter, candidate))
            .await?;
        gauge!("tap_watermark", "filter" => self.filter.key()).set(candidate.0 as f64);
        Ok(candidate)
    }
}

/// Spawn one task per loop. Loops share nothing but the stores, the client and the
/// cooldown they were built with.
pub fn spawn_loops(loops: Vec<AcquisitionLoop>) -> JoinSet<Result<LoopSummary>> {
    let mut set = JoinSet::new();
    for l in loops {
        set.spawn(async move { l.run().await });
    }
    set
}
