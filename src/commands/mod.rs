pub mod aggregate;
pub mod load_airports;
pub mod migrate;
pub mod pull_states;
pub mod reconcile;
pub mod refresh_routes;
pub mod run;

pub use aggregate::handle_aggregate;
pub use load_airports::handle_load_airports;
pub use migrate::handle_migrate;
pub use pull_states::handle_pull_states;
pub use reconcile::handle_reconcile;
pub use refresh_routes::handle_refresh_routes;
pub use run::handle_run;

use std::sync::Arc;

use anyhow::Result;
use trajectory_tracker::aggregator::StatsAggregator;
use trajectory_tracker::airport_stats_repo::AirportStatsRepository;
use trajectory_tracker::config::TrackerConfig;
use trajectory_tracker::db::PgPool;
use trajectory_tracker::opensky_client::OpenSkyClient;
use trajectory_tracker::reconciler::TrajectoryReconciler;
use trajectory_tracker::route_memo::{CachedRouteMemo, RouteEstimatesRepository};
use trajectory_tracker::trajectories_repo::TrajectoriesRepository;

/// Lock shared by the `aggregate` command and the scheduler's aggregate task
pub(crate) const AGGREGATE_LOCK_NAME: &str = "trajectory-tracker-aggregate";

pub(crate) fn build_reconciler(
    pool: &PgPool,
    config: &TrackerConfig,
) -> (TrajectoryReconciler, Arc<CachedRouteMemo>) {
    let route_memo = Arc::new(CachedRouteMemo::new(
        Arc::new(RouteEstimatesRepository::new(pool.clone())),
        config.route_cache_ttl(),
        config.route_lookup_timeout(),
    ));

    let reconciler = TrajectoryReconciler::new(
        Arc::new(TrajectoriesRepository::new(pool.clone())),
        route_memo.clone(),
        config.reconciler_settings(),
    );

    (reconciler, route_memo)
}

pub(crate) fn build_aggregator(pool: &PgPool, config: &TrackerConfig) -> StatsAggregator {
    StatsAggregator::new(
        Arc::new(TrajectoriesRepository::new(pool.clone())),
        Arc::new(AirportStatsRepository::new(pool.clone())),
        config.aggregator_settings(),
    )
}

pub(crate) fn build_opensky_client(config: &TrackerConfig) -> Result<OpenSkyClient> {
    if config.opensky.username.is_none() {
        tracing::warn!("No OpenSky credentials configured, using anonymous rate limits");
    }
    OpenSkyClient::new(&config.opensky, config.retry_policy())
}
