use anyhow::Result;
use tracing::info;

use trajectory_tracker::aggregator::{AggregationOutcome, StatsAggregator};
use trajectory_tracker::config::TrackerConfig;
use trajectory_tracker::db::PgPool;
use trajectory_tracker::instance_lock::InstanceLock;

use super::{AGGREGATE_LOCK_NAME, build_aggregator};

/// Run one aggregation while holding the cross-process aggregate lock
pub async fn aggregate_locked(aggregator: &StatsAggregator) -> Result<AggregationOutcome> {
    let Some(lock) = InstanceLock::try_acquire(AGGREGATE_LOCK_NAME)? else {
        info!("Another process is aggregating, skipping this run");
        return Ok(AggregationOutcome::AlreadyRunning);
    };

    let outcome = aggregator.aggregate().await;
    drop(lock);
    outcome
}

pub async fn handle_aggregate(pool: PgPool, config: &TrackerConfig) -> Result<()> {
    sentry::configure_scope(|scope| {
        scope.set_tag("operation", "aggregate");
    });

    let aggregator = build_aggregator(&pool, config);

    match aggregate_locked(&aggregator).await? {
        AggregationOutcome::Completed(summary) => info!(
            "Aggregation complete: {} trajectories, {} increments, watermark {}, {} old stats rows removed",
            summary.trajectories, summary.increments, summary.watermark, summary.purged_stats
        ),
        AggregationOutcome::AlreadyRunning => info!("Aggregation skipped"),
    }

    Ok(())
}
