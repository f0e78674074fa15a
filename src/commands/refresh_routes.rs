use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tracing::info;

use trajectory_tracker::config::TrackerConfig;
use trajectory_tracker::db::PgPool;
use trajectory_tracker::route_memo::RouteEstimatesRepository;
use trajectory_tracker::route_refresh::RouteRefresher;

use super::build_opensky_client;

/// Refresh the route memo from flight history.
///
/// Without `days` only the day that ended 24 hours ago is fetched; with
/// `days` the memo is backfilled over that many days ending yesterday.
pub async fn handle_refresh_routes(
    pool: PgPool,
    config: &TrackerConfig,
    days: Option<u32>,
    pause_secs: u64,
) -> Result<()> {
    sentry::configure_scope(|scope| {
        scope.set_tag("operation", "refresh-routes");
    });

    let client = Arc::new(build_opensky_client(config)?);
    let repo = Arc::new(RouteEstimatesRepository::new(pool));
    let refresher =
        RouteRefresher::new(client, repo.clone()).with_pause(Duration::from_secs(pause_secs));

    let now = Utc::now().timestamp();
    let summary = match days {
        Some(days) => {
            info!("Backfilling route memo over {} days ending yesterday", days);
            refresher.backfill(now, days).await
        }
        None => refresher.refresh_recent(now).await,
    };

    info!(
        "Route memo now holds {} callsigns ({} written this run)",
        repo.count().await?,
        summary.routes_written
    );

    if summary.windows > 0 && summary.failed_windows == summary.windows {
        anyhow::bail!("Every route refresh window failed");
    }
    Ok(())
}
