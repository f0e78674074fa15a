use anyhow::{Context, Result};
use tracing::info;

use trajectory_tracker::config::TrackerConfig;
use trajectory_tracker::db::PgPool;
use trajectory_tracker::opensky_client::OpenSkyClient;
use trajectory_tracker::snapshot::CurrentStatesRepository;

use super::build_opensky_client;

/// Fetch the latest states and replace the stored snapshot.
/// Returns the number of aircraft stored.
pub async fn pull_states_once(
    client: &OpenSkyClient,
    repo: &CurrentStatesRepository,
) -> Result<usize> {
    let snapshot = client
        .get_states(None)
        .await
        .context("Failed to fetch states from OpenSky")?;

    let states = snapshot.current_states();
    let skipped = snapshot.states.len() - states.len();
    let stored = repo.replace_batch(states).await?;

    info!(
        "Stored {} aircraft states for time {} ({} without position skipped)",
        stored, snapshot.time, skipped
    );
    Ok(stored)
}

pub async fn handle_pull_states(pool: PgPool, config: &TrackerConfig) -> Result<()> {
    sentry::configure_scope(|scope| {
        scope.set_tag("operation", "pull-states");
    });

    let client = build_opensky_client(config)?;
    let repo = CurrentStatesRepository::new(pool);

    pull_states_once(&client, &repo).await?;
    Ok(())
}
