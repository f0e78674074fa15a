use std::io::IsTerminal;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use trajectory_tracker::config::{TrackerConfig, config_path};
use trajectory_tracker::db::build_pool;
use trajectory_tracker::log_format::TargetFirstFormat;

mod commands;

#[derive(Parser, Debug)]
#[command(
    name = "trajectory-tracker",
    version,
    about = "Reconstruct aircraft trajectories from OpenSky snapshots and count airport traffic"
)]
struct Cli {
    /// TOML configuration file (default: ./tracker.toml when present)
    #[arg(long, env = "TRACKER_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Apply pending database migrations
    Migrate,
    /// Run polling, reconciling, aggregation and route refresh on schedules
    Run,
    /// Fetch one snapshot of aircraft states and store it
    PullStates,
    /// Reconcile the stored snapshot into trajectories once
    Reconcile,
    /// Roll new trajectories into airport daily stats once
    Aggregate,
    /// Refresh the callsign to route memo from flight history
    RefreshRoutes {
        /// Backfill this many days ending yesterday instead of the usual day
        #[arg(long)]
        days: Option<u32>,
        /// Seconds to wait between hourly history requests
        #[arg(long, default_value_t = 30)]
        pause_secs: u64,
    },
    /// Load the airport reference table from an OpenFlights-style CSV file
    LoadAirports {
        /// Airport data file (no header row)
        #[arg(long)]
        file: PathBuf,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .event_format(TargetFirstFormat::new(std::io::stdout().is_terminal()));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(sentry_tracing::layer())
        .init();
}

fn init_sentry() -> Option<sentry::ClientInitGuard> {
    let dsn = std::env::var("SENTRY_DSN").ok().filter(|dsn| !dsn.is_empty())?;

    Some(sentry::init((
        dsn,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            environment: std::env::var("TRACKER_ENV").ok().map(Into::into),
            ..Default::default()
        },
    )))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Guard must outlive every command so queued events are flushed
    let _sentry = init_sentry();
    init_tracing();

    let cli = Cli::parse();

    info!(
        "trajectory-tracker {} starting",
        option_env!("VERGEN_GIT_DESCRIBE").unwrap_or(env!("CARGO_PKG_VERSION"))
    );

    let config = TrackerConfig::load(config_path(cli.config).as_deref())?;
    let database_url = config.require_database_url()?;
    let pool = build_pool(database_url, config.pool_size).context("Failed to create database pool")?;

    match cli.command {
        Commands::Migrate => commands::handle_migrate(pool).await,
        Commands::Run => commands::handle_run(pool, &config).await,
        Commands::PullStates => commands::handle_pull_states(pool, &config).await,
        Commands::Reconcile => commands::handle_reconcile(pool, &config).await,
        Commands::Aggregate => commands::handle_aggregate(pool, &config).await,
        Commands::RefreshRoutes { days, pause_secs } => {
            commands::handle_refresh_routes(pool, &config, days, pause_secs).await
        }
        Commands::LoadAirports { file } => commands::handle_load_airports(pool, file).await,
    }
}
