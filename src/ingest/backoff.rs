// src/ingest/backoff.rs
//! Pacing and retry policy around remote calls.
//!
//! Every call is preceded by a mandatory pacing delay. Rate-limit errors wait a fixed
//! cooldown, every other error a shorter one, and both are retried without limit.
//! Only cancellation ends a call without a value.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use metrics::counter;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::ingest::types::{Cancelled, SearchError};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffCfg {
    pub pacing: Duration,
    pub rate_limit_cooldown: Duration,
    pub error_cooldown: Duration,
}

impl Default for BackoffCfg {
    fn default() -> Self {
        Self {
            pacing: Duration::from_secs(2),
            rate_limit_cooldown: Duration::from_secs(60),
            error_cooldown: Duration::from_secs(30),
        }
    }
}

/// Cooldown deadline shared by every loop of the process. The remote limit is global
/// to the credentials, so one loop hitting it holds the others back too.
#[derive(Debug, Clone, Default)]
pub struct SharedCooldown {
    until: Arc<Mutex<Option<Instant>>>,
}

impl SharedCooldown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push the deadline out to `now + d` (never pulls it in).
    pub fn hold_for(&self, d: Duration) {
        let deadline = Instant::now() + d;
        let mut until = self.until.lock().expect("cooldown mutex poisoned");
        match *until {
            Some(u) if u >= deadline => {}
            _ => *until = Some(deadline),
        }
    }

    pub fn remaining(&self) -> Option<Duration> {
        let until = *self.until.lock().expect("cooldown mutex poisoned");
        until
            .map(|u| u.saturating_duration_since(Instant::now()))
            .filter(|d| !d.is_zero())
    }
}

#[derive(Debug, Default)]
struct Counters {
    calls: AtomicU64,
    rate_limited: AtomicU64,
    transient_errors: AtomicU64,
    store_errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackoffStats {
    pub calls: u64,
    pub rate_limited: u64,
    pub transient_errors: u64,
    pub store_errors: u64,
}

pub struct BackoffScheduler {
    cfg: BackoffCfg,
    cooldown: SharedCooldown,
    cancel: CancellationToken,
    counters: Counters,
}

impl BackoffScheduler {
    pub fn new(cfg: BackoffCfg, cooldown: SharedCooldown, cancel: CancellationToken) -> Self {
        Self {
            cfg,
            cooldown,
            cancel,
            counters: Counters::default(),
        }
    }

    pub fn stats(&self) -> BackoffStats {
        BackoffStats {
            calls: self.counters.calls.load(Ordering::Relaxed),
            rate_limited: self.counters.rate_limited.load(Ordering::Relaxed),
            transient_errors: self.counters.transient_errors.load(Ordering::Relaxed),
            store_errors: self.counters.store_errors.load(Ordering::Relaxed),
        }
    }

    /// Sleep for `d` unless cancelled first.
    pub async fn pause(&self, d: Duration) -> Result<(), Cancelled> {
        if self.cancel.is_cancelled() {
            return Err(Cancelled);
        }
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Cancelled),
            _ = tokio::time::sleep(d) => Ok(()),
        }
    }

    /// Run a remote operation until it succeeds.
    pub async fn call<T, F, Fut>(&self, mut operation: F) -> Result<T, Cancelled>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SearchError>>,
    {
        loop {
            self.pause(self.cfg.pacing).await?;
            if let Some(rest) = self.cooldown.remaining() {
                tracing::debug!(wait_ms = rest.as_millis() as u64, "waiting out shared cooldown");
                self.pause(rest).await?;
            }

            self.counters.calls.fetch_add(1, Ordering::Relaxed);
            counter!("tap_search_calls_total").increment(1);

            let res = tokio::select! {
                _ = self.cancel.cancelled() => return Err(Cancelled),
                res = operation() => res,
            };

            match res {
                Ok(value) => return Ok(value),
                Err(SearchError::RateLimited { retry_after }) => {
                    self.counters.rate_limited.fetch_add(1, Ordering::Relaxed);
                    counter!("tap_rate_limited_total").increment(1);
                    tracing::warn!(
                        cooldown_s = self.cfg.rate_limit_cooldown.as_secs_f64(),
                        retry_after_s = retry_after.map(|d| d.as_secs()),
                        "rate limit reached, taking a break"
                    );
                    self.cooldown.hold_for(self.cfg.rate_limit_cooldown);
                    self.pause(self.cfg.rate_limit_cooldown).await?;
                }
                Err(e) => {
                    self.counters.transient_errors.fetch_add(1, Ordering::Relaxed);
                    counter!("tap_transient_errors_total").increment(1);
                    tracing::error!(
                        error = %e,
                        cooldown_s = self.cfg.error_cooldown.as_secs_f64(),
                        "search call failed, taking a break"
                    );
                    self.pause(self.cfg.error_cooldown).await?;
                }
            }
        }
    }

    /// Retry a store write with the error cooldown until it succeeds. No pacing.
    pub async fn persist<T, F, Fut>(&self, mut write: F) -> Result<T, Cancelled>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        loop {
            if self.cancel.is_cancelled() {
                return Err(Cancelled);
            }
            match write().await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    self.counters.store_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(
                        error = ?e,
                        cooldown_s = self.cfg.error_cooldown.as_secs_f64(),
                        "store write failed, retrying"
                    );
                    self.pause(self.cfg.error_cooldown).await?;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn scheduler(cancel: CancellationToken) -> BackoffScheduler {
        BackoffScheduler::new(BackoffCfg::default(), SharedCooldown::new(), cancel)
    }

    #[tokio::test(start_paused = true)]
    async fn first_call_is_paced() {
        let s = scheduler(CancellationToken::new());
        let t0 = Instant::now();
        let v = s.call(|| async { Ok::<_, SearchError>(1) }).await.unwrap();
        assert_eq!(v, 1);
        assert_eq!(t0.elapsed(), Duration::from_secs(2));
        assert_eq!(s.stats().calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_use_short_cooldown() {
        let s = scheduler(CancellationToken::new());
        let n = AtomicUsize::new(0);
        let n = &n;
        let t0 = Instant::now();
        let v = s
            .call(|| async move {
                if n.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(SearchError::Network("reset".into()))
                } else {
                    Ok("ok")
                }
            })
            .await
            .unwrap();
        assert_eq!(v, "ok");
        // 3 pacing delays + 2 error cooldowns
        assert_eq!(t0.elapsed(), Duration::from_secs(2 * 3 + 30 * 2));
        assert_eq!(s.stats().transient_errors, 2);
        assert_eq!(s.stats().rate_limited, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_interrupts_retry_forever() {
        let cancel = CancellationToken::new();
        let s = scheduler(cancel.clone());
        let stopper = {
            let c = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(500)).await;
                c.cancel();
            })
        };
        let res = s
            .call(|| async { Err::<(), _>(SearchError::Api { status: 503, message: "down".into() }) })
            .await;
        assert_eq!(res, Err(Cancelled));
        stopper.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn shared_cooldown_holds_other_schedulers() {
        let shared = SharedCooldown::new();
        shared.hold_for(Duration::from_secs(60));
        let s = BackoffScheduler::new(BackoffCfg::default(), shared.clone(), CancellationToken::new());
        let t0 = Instant::now();
        s.call(|| async { Ok::<_, SearchError>(()) }).await.unwrap();
        // pacing runs concurrently with the cooldown clock, so the total is the cooldown
        assert_eq!(t0.elapsed(), Duration::from_secs(60));
        assert!(shared.remaining().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn hold_never_shortens_deadline() {
        let c = SharedCooldown::new();
        c.hold_for(Duration::from_secs(60));
        c.hold_for(Duration::from_secs(5));
        assert_eq!(c.remaining(), Some(Duration::from_secs(60)));
    }
}
