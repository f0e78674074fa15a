use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, warn};

use trajectory_tracker::aggregator::AggregationOutcome;
use trajectory_tracker::config::TrackerConfig;
use trajectory_tracker::db::PgPool;
use trajectory_tracker::route_memo::RouteEstimatesRepository;
use trajectory_tracker::route_refresh::RouteRefresher;
use trajectory_tracker::snapshot::CurrentStatesRepository;

use super::aggregate::aggregate_locked;
use super::pull_states::pull_states_once;
use super::reconcile::reconcile_once;
use super::{build_aggregator, build_opensky_client, build_reconciler};

/// Pause between hourly flight-history windows in the scheduled refresh
const ROUTE_REFRESH_PAUSE: Duration = Duration::from_secs(30);

/// Run every periodic job in one process until Ctrl+C.
///
/// Polling, reconciling, aggregating and refreshing routes each get their
/// own task and interval, so a slow job never delays another.
pub async fn handle_run(pool: PgPool, config: &TrackerConfig) -> Result<()> {
    sentry::configure_scope(|scope| {
        scope.set_tag("operation", "run");
    });

    let cancel = CancellationToken::new();

    if let Some(port) = config.metrics_port {
        let handle = trajectory_tracker::metrics::init_metrics()?;
        trajectory_tracker::metrics::initialize_tracker_metrics();

        let metrics_cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) =
                trajectory_tracker::metrics::start_metrics_server(port, handle, metrics_cancel)
                    .await
            {
                error!("Metrics server exited: {:#}", e);
            }
        });
    }

    let client = Arc::new(build_opensky_client(config)?);
    let states = Arc::new(CurrentStatesRepository::new(pool.clone()));
    let (reconciler, route_memo) = build_reconciler(&pool, config);
    let reconciler = Arc::new(reconciler);
    let aggregator = Arc::new(build_aggregator(&pool, config));
    let refresher = Arc::new(
        RouteRefresher::new(
            client.clone(),
            Arc::new(RouteEstimatesRepository::new(pool.clone())),
        )
        .with_pause(ROUTE_REFRESH_PAUSE),
    );

    let schedule = &config.schedule;
    let mut tasks = Vec::new();

    tasks.push(spawn_periodic(
        "poll_states",
        Duration::from_secs(schedule.poll_interval_secs),
        cancel.clone(),
        {
            let client = client.clone();
            let states = states.clone();
            move || {
                let client = client.clone();
                let states = states.clone();
                async move {
                    if let Err(e) = pull_states_once(&client, &states).await {
                        warn!("Poll failed: {:#}", e);
                    }
                }
            }
        },
    ));

    tasks.push(spawn_periodic(
        "reconcile",
        Duration::from_secs(schedule.reconcile_interval_secs),
        cancel.clone(),
        {
            let states = states.clone();
            let reconciler = reconciler.clone();
            move || {
                let states = states.clone();
                let reconciler = reconciler.clone();
                async move {
                    if let Err(e) = reconcile_once(&*states, &reconciler).await {
                        error!("Reconcile failed: {:#}", e);
                    }
                }
            }
        },
    ));

    tasks.push(spawn_periodic(
        "aggregate",
        Duration::from_secs(schedule.aggregate_interval_secs),
        cancel.clone(),
        {
            let aggregator = aggregator.clone();
            move || {
                let aggregator = aggregator.clone();
                async move {
                    match aggregate_locked(&aggregator).await {
                        Ok(AggregationOutcome::Completed(_)) => {}
                        Ok(AggregationOutcome::AlreadyRunning) => {
                            info!("Previous aggregation still running, skipping tick");
                        }
                        Err(e) => error!("Aggregation failed: {:#}", e),
                    }
                }
            }
        },
    ));

    tasks.push(spawn_periodic(
        "refresh_routes",
        Duration::from_secs(schedule.route_refresh_interval_secs),
        cancel.clone(),
        {
            let refresher = refresher.clone();
            let route_memo = route_memo.clone();
            move || {
                let refresher = refresher.clone();
                let route_memo = route_memo.clone();
                async move {
                    let summary = refresher.refresh_recent(Utc::now().timestamp()).await;
                    if summary.routes_written > 0 {
                        route_memo.invalidate_all();
                    }
                }
            }
        },
    ));

    info!(
        "Scheduler started: poll every {}s, reconcile every {}s, aggregate every {}s, refresh routes every {}s",
        schedule.poll_interval_secs,
        schedule.reconcile_interval_secs,
        schedule.aggregate_interval_secs,
        schedule.route_refresh_interval_secs
    );

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal (Ctrl+C), stopping scheduled jobs...");
    cancel.cancel();

    for task in tasks {
        if let Err(e) = task.await {
            error!("Scheduled task panicked: {}", e);
        }
    }

    info!("Graceful shutdown complete");
    Ok(())
}

/// Run `job` every `period` until `cancel` fires. A job in flight when
/// cancellation arrives is dropped at its next await point.
fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    cancel: CancellationToken,
    job: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(
        async move {
            let mut interval = tokio::time::interval(period.max(Duration::from_secs(1)));
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = job() => {}
                }
            }

            info!("Stopped");
        }
        .instrument(tracing::info_span!("scheduled", job = name)),
    )
}
