use std::net::SocketAddr;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::{Router, extract::State, routing::get};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Install the Prometheus recorder
/// Returns a handle that renders the metrics for scraping
pub fn init_metrics() -> Result<PrometheusHandle> {
    // Buckets in milliseconds: 1ms .. 60s
    let duration_buckets = [
        1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0, 60000.0,
    ];

    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Suffix("duration_ms".to_string()),
            &duration_buckets,
        )
        .context("Failed to set buckets for duration histograms")?
        .install_recorder()
        .context("Failed to install Prometheus recorder")
}

/// Initialize tracker metrics to zero so they appear in Prometheus before the
/// first event
pub fn initialize_tracker_metrics() {
    // Reconciler
    metrics::counter!("reconcile.runs").absolute(0);
    metrics::counter!("reconcile.trajectories.created").absolute(0);
    metrics::counter!("reconcile.trajectories.appended").absolute(0);
    metrics::counter!("reconcile.trajectories.finalized").absolute(0);
    metrics::counter!("reconcile.trajectories.purged").absolute(0);
    metrics::counter!("reconcile.reports.conflict").absolute(0);
    metrics::counter!("reconcile.reports.duplicate").absolute(0);
    metrics::counter!("reconcile.reports.rejected").absolute(0);
    metrics::counter!("reconcile.reports.failed").absolute(0);
    metrics::gauge!("reconcile.trajectories.open").set(0.0);

    // Aggregator
    metrics::counter!("aggregate.runs").absolute(0);
    metrics::counter!("aggregate.skipped").absolute(0);
    metrics::counter!("aggregate.failures").absolute(0);
    metrics::counter!("aggregate.trajectories").absolute(0);
    metrics::counter!("aggregate.increments").absolute(0);
    metrics::gauge!("aggregate.watermark").set(0.0);

    // Route memo
    metrics::counter!("route_memo.cache.hit").absolute(0);
    metrics::counter!("route_memo.cache.miss").absolute(0);
    metrics::counter!("route_memo.lookup.failed").absolute(0);
    metrics::counter!("route_memo.lookup.timeout").absolute(0);
    metrics::counter!("route_refresh.routes_written").absolute(0);
    metrics::counter!("route_refresh.window.failed").absolute(0);

    // OpenSky
    metrics::counter!("opensky.states.fetched").absolute(0);
    metrics::counter!("opensky.states.failed").absolute(0);
    metrics::counter!("opensky.flights.fetched").absolute(0);
    metrics::counter!("opensky.flights.failed").absolute(0);
    metrics::gauge!("opensky.states.aircraft").set(0.0);
}

/// Update uptime and memory gauges every 5 seconds until cancelled
pub async fn process_metrics_task(cancel: CancellationToken) {
    let start_time = Instant::now();
    let mut interval = tokio::time::interval(Duration::from_secs(5));

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        metrics::gauge!("process.uptime.seconds").set(start_time.elapsed().as_secs() as f64);
        metrics::gauge!("process.is_up").set(1.0);

        #[cfg(target_os = "linux")]
        if let Some(bytes) = resident_memory_bytes() {
            metrics::gauge!("process.memory.bytes").set(bytes);
        }
    }
}

#[cfg(target_os = "linux")]
fn resident_memory_bytes() -> Option<f64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    let line = status.lines().find(|line| line.starts_with("VmRSS:"))?;
    let kb: f64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb * 1024.0)
}

async fn render_metrics(State(handle): State<PrometheusHandle>) -> String {
    handle.render()
}

/// Serve `/metrics` on `port` until `cancel` fires
pub async fn start_metrics_server(
    port: u16,
    handle: PrometheusHandle,
    cancel: CancellationToken,
) -> Result<()> {
    tokio::spawn(process_metrics_task(cancel.clone()));

    let app = Router::new()
        .route("/metrics", get(render_metrics))
        .with_state(handle);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind metrics server to {addr}"))?;

    info!("Starting metrics server on http://{}/metrics", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("Metrics server failed")
}
