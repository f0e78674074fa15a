use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::info;

use trajectory_tracker::airports::read_airports;
use trajectory_tracker::airports_repo::AirportsRepository;
use trajectory_tracker::db::PgPool;

pub async fn handle_load_airports(pool: PgPool, file: PathBuf) -> Result<()> {
    sentry::configure_scope(|scope| {
        scope.set_tag("operation", "load-airports");
    });

    info!("Loading airports from {}", file.display());

    let loaded = tokio::task::spawn_blocking(move || {
        let handle = File::open(&file)
            .with_context(|| format!("Failed to open airport file: {}", file.display()))?;
        read_airports(BufReader::new(handle))
    })
    .await??;

    let repo = AirportsRepository::new(pool);
    let upserted = repo.upsert_airports(&loaded.airports).await?;
    let total = repo.get_airport_count().await?;

    info!(
        "Upserted {} airports ({} rows skipped), {} airports stored",
        upserted, loaded.skipped, total
    );
    Ok(())
}
