use anyhow::{Context, Result};
use tracing::info;

use trajectory_tracker::config::TrackerConfig;
use trajectory_tracker::db::PgPool;
use trajectory_tracker::reconciler::{ReconcileSummary, TrajectoryReconciler};
use trajectory_tracker::snapshot::{CurrentStatesRepository, SnapshotSource};

use super::build_reconciler;

/// One reconcile pass over the stored snapshot
pub async fn reconcile_once(
    source: &dyn SnapshotSource,
    reconciler: &TrajectoryReconciler,
) -> Result<ReconcileSummary> {
    let batch = source
        .fetch_current_batch()
        .await
        .context("Failed to load current snapshot")?;

    Ok(reconciler.reconcile(batch).await)
}

pub async fn handle_reconcile(pool: PgPool, config: &TrackerConfig) -> Result<()> {
    sentry::configure_scope(|scope| {
        scope.set_tag("operation", "reconcile");
    });

    let (reconciler, _route_memo) = build_reconciler(&pool, config);
    let source = CurrentStatesRepository::new(pool);

    let summary = reconcile_once(&source, &reconciler).await?;
    info!(
        "Reconcile finished: {} created, {} appended, {} finalized, {} purged",
        summary.created, summary.appended, summary.finalized, summary.purged
    );

    if summary.failed > 0 {
        anyhow::bail!("{} store operations failed during reconcile", summary.failed);
    }
    Ok(())
}
