// tests/ingest_walker.rs
use search_tap::ingest::backoff::{BackoffCfg, BackoffScheduler, SharedCooldown};
use search_tap::ingest::providers::scripted::{page, ScriptedClient};
use search_tap::ingest::store::ResultSink;
use search_tap::ingest::types::{Cancelled, Page, PageCursor, SearchError};
use search_tap::ingest::{Filter, MemoryStore, PaginationWalker, ResultId, ResultRecord};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

fn walker(
    client: Arc<ScriptedClient>,
    store: Arc<MemoryStore>,
    cancel: CancellationToken,
) -> PaginationWalker {
    let backoff = Arc::new(BackoffScheduler::new(
        BackoffCfg::default(),
        SharedCooldown::new(),
        cancel,
    ));
    PaginationWalker::new(client, store, backoff, Duration::from_secs(10))
}

#[tokio::test(start_paused = true)]
async fn follows_cursors_until_exhausted() {
    let client = Arc::new(ScriptedClient::new(vec![
        Ok(page(&[10, 9], Some("8"))),
        Ok(page(&[42, 8], Some("7"))),
        Ok(page(&[7], None)),
    ]));
    let store = Arc::new(MemoryStore::new());
    let w = walker(client.clone(), store.clone(), CancellationToken::new());

    let out = w.walk(&Filter::query("rust"), None).await.unwrap();

    assert_eq!(out.max_id, Some(ResultId(42)));
    assert_eq!(out.total_records, 5);
    assert_eq!(out.pages, 3);

    let calls = client.calls();
    assert_eq!(calls.len(), 3);
    let cursors: Vec<_> = calls.iter().map(|c| c.cursor.clone()).collect();
    assert_eq!(
        cursors,
        vec![
            None,
            Some(PageCursor("8".into())),
            Some(PageCursor("7".into()))
        ]
    );
    assert_eq!(store.record_count(), 5);
}

#[tokio::test(start_paused = true)]
async fn lower_bound_is_fixed_for_the_whole_walk() {
    let client = Arc::new(ScriptedClient::new(vec![
        Ok(page(&[120], Some("119"))),
        Ok(page(&[110], None)),
    ]));
    let store = Arc::new(MemoryStore::new());
    let w = walker(client.clone(), store, CancellationToken::new());

    let out = w.walk(&Filter::query("rust"), Some(ResultId(100))).await.unwrap();

    assert_eq!(out.max_id, Some(ResultId(120)));
    assert!(client
        .calls()
        .iter()
        .all(|c| c.since_id == Some(ResultId(100))));
}

#[tokio::test(start_paused = true)]
async fn empty_page_keeps_watermark_and_pauses() {
    let client = Arc::new(ScriptedClient::new(vec![Ok(Page::default())]));
    let store = Arc::new(MemoryStore::new());
    let w = walker(client.clone(), store.clone(), CancellationToken::new());

    let t0 = Instant::now();
    let out = w.walk(&Filter::query("quiet"), Some(ResultId(100))).await.unwrap();

    assert_eq!(out.max_id, Some(ResultId(100)));
    assert_eq!(out.total_records, 0);
    assert_eq!(client.calls().len(), 1);
    // pacing + idle pause
    assert_eq!(t0.elapsed(), Duration::from_secs(2 + 10));
    assert_eq!(store.record_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn empty_page_from_scratch_has_no_watermark() {
    let client = Arc::new(ScriptedClient::new(vec![]));
    let w = walker(client, Arc::new(MemoryStore::new()), CancellationToken::new());

    let out = w.walk(&Filter::query("quiet"), None).await.unwrap();
    assert_eq!(out.max_id, None);
    assert_eq!(out.total_records, 0);
}

#[tokio::test(start_paused = true)]
async fn rate_limit_is_waited_out_once() {
    let client = Arc::new(ScriptedClient::new(vec![
        Err(SearchError::RateLimited { retry_after: None }),
        Ok(page(&[5], None)),
    ]));
    let store = Arc::new(MemoryStore::new());
    let w = walker(client.clone(), store, CancellationToken::new());

    let t0 = Instant::now();
    let out = w.walk(&Filter::query("busy"), None).await.unwrap();

    assert_eq!(out.max_id, Some(ResultId(5)));
    assert_eq!(client.calls().len(), 2);
    let stats = w.backoff().stats();
    assert_eq!(stats.rate_limited, 1);
    assert_eq!(stats.transient_errors, 0);
    // pacing, one cooldown, pacing again
    assert_eq!(t0.elapsed(), Duration::from_secs(2 + 60 + 2));
}

#[tokio::test(start_paused = true)]
async fn transient_errors_are_absorbed() {
    let client = Arc::new(ScriptedClient::new(vec![
        Err(SearchError::Network("connection reset".into())),
        Err(SearchError::Api {
            status: 503,
            message: "over capacity".into(),
        }),
        Ok(page(&[3], None)),
    ]));
    let w = walker(client.clone(), Arc::new(MemoryStore::new()), CancellationToken::new());

    let t0 = Instant::now();
    let out = w.walk(&Filter::query("flaky"), None).await.unwrap();

    assert_eq!(out.max_id, Some(ResultId(3)));
    assert_eq!(w.backoff().stats().transient_errors, 2);
    assert_eq!(t0.elapsed(), Duration::from_secs(2 * 3 + 30 * 2));
}

#[tokio::test(start_paused = true)]
async fn unparseable_timestamps_do_not_stop_the_walk() {
    let bad = search_tap::ResultRecord::from_value(json!({
        "id": 77,
        "created_at": "not a date",
        "user": {"created_at": 12}
    }))
    .unwrap();
    let client = Arc::new(ScriptedClient::new(vec![Ok(Page::new(
        vec![bad, search_tap::ingest::providers::scripted::record(76)],
        None,
    ))]));
    let store = Arc::new(MemoryStore::new());
    let w = walker(client, store.clone(), CancellationToken::new());

    let out = w.walk(&Filter::query("x"), None).await.unwrap();

    assert_eq!(out.total_records, 2);
    assert_eq!(out.malformed, 1);
    let stored = store.record(ResultId(77)).unwrap();
    assert_eq!(stored.payload["created_at"], json!("not a date"));
    let good = store.record(ResultId(76)).unwrap();
    assert_eq!(good.payload["created_at"], json!("2008-08-27T13:08:45+00:00"));
}

#[tokio::test(start_paused = true)]
async fn cancellation_stops_a_rate_limited_walk() {
    let client = Arc::new(ScriptedClient::new(
        (0..100)
            .map(|_| Err(SearchError::RateLimited { retry_after: None }))
            .collect(),
    ));
    let cancel = CancellationToken::new();
    let w = walker(client.clone(), Arc::new(MemoryStore::new()), cancel.clone());

    let stopper = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(150)).await;
        cancel.cancel();
    });
    let res = w.walk(&Filter::query("x"), None).await;
    stopper.await.unwrap();

    assert_eq!(res, Err(Cancelled));
    // calls at t=2, 64, 126
    assert_eq!(client.calls().len(), 3);
}

/// Fails the first `failures` writes, then delegates to an in-memory store.
struct FlakySink {
    failures: usize,
    attempts: AtomicUsize,
    inner: MemoryStore,
}

#[async_trait::async_trait]
impl ResultSink for FlakySink {
    async fn upsert(&self, record: &ResultRecord) -> anyhow::Result<()> {
        if self.attempts.fetch_add(1, Ordering::SeqCst) < self.failures {
            anyhow::bail!("disk full");
        }
        self.inner.upsert(record).await
    }
}

#[tokio::test(start_paused = true)]
async fn store_failures_are_retried_after_error_cooldown() {
    let client = Arc::new(ScriptedClient::new(vec![Ok(page(&[31], None))]));
    let sink = Arc::new(FlakySink {
        failures: 2,
        attempts: AtomicUsize::new(0),
        inner: MemoryStore::new(),
    });
    let backoff = Arc::new(BackoffScheduler::new(
        BackoffCfg::default(),
        SharedCooldown::new(),
        CancellationToken::new(),
    ));
    let w = PaginationWalker::new(client.clone(), sink.clone(), backoff, Duration::from_secs(10));

    let t0 = Instant::now();
    let out = w.walk(&Filter::query("x"), None).await.unwrap();

    assert_eq!(out.max_id, Some(ResultId(31)));
    assert_eq!(client.calls().len(), 1);
    let stats = w.backoff().stats();
    assert_eq!(stats.store_errors, 2);
    assert_eq!(stats.transient_errors, 0);
    // pacing once, then one error cooldown per failed write
    assert_eq!(t0.elapsed(), Duration::from_secs(2 + 30 * 2));
    assert_eq!(sink.attempts.load(Ordering::SeqCst), 3);
    assert!(sink.inner.record(ResultId(31)).is_some());
}

#[tokio::test(start_paused = true)]
async fn cancellation_stops_store_retries() {
    let client = Arc::new(ScriptedClient::new(vec![Ok(page(&[31], None))]));
    let sink = Arc::new(FlakySink {
        failures: usize::MAX,
        attempts: AtomicUsize::new(0),
        inner: MemoryStore::new(),
    });
    let cancel = CancellationToken::new();
    let backoff = Arc::new(BackoffScheduler::new(
        BackoffCfg::default(),
        SharedCooldown::new(),
        cancel.clone(),
    ));
    let w = PaginationWalker::new(client, sink.clone(), backoff, Duration::from_secs(10));

    let stopper = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(100)).await;
        cancel.cancel();
    });
    let res = w.walk(&Filter::query("x"), None).await;
    stopper.await.unwrap();

    assert_eq!(res, Err(Cancelled));
    // writes at t=2, 32, 62, 92
    assert_eq!(sink.attempts.load(Ordering::SeqCst), 4);
    assert_eq!(sink.inner.record_count(), 0);
}
