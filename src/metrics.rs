use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

/// Install the Prometheus recorder and serve `/metrics` on `addr`.
/// Must be called from inside the tokio runtime.
pub fn install(addr: SocketAddr) -> Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("prometheus: install exporter")?;
    crate::ingest::ensure_metrics_described();
    tracing::info!(%addr, "metrics exporter listening");
    Ok(())
}
