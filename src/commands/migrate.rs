use anyhow::Result;
use tracing::info;

use trajectory_tracker::db::{PgPool, run_migrations};

pub async fn handle_migrate(pool: PgPool) -> Result<()> {
    sentry::configure_scope(|scope| {
        scope.set_tag("operation", "migrate");
    });

    let applied = run_migrations(&pool).await?;
    if applied == 0 {
        info!("Database schema is up to date");
    }
    Ok(())
}
