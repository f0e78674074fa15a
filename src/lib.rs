//! Trajectory tracker - reconstructs aircraft trajectories from polled
//! position snapshots and rolls them into per-airport daily traffic counts.

pub mod aggregator;
pub mod airport_stats;
pub mod airport_stats_repo;
pub mod airports;
pub mod airports_repo;
pub mod config;
pub mod db;
pub mod instance_lock;
pub mod log_format;
pub mod memory_store;
pub mod metrics;
pub mod opensky_client;
pub mod position;
pub mod reconciler;
pub mod retry;
pub mod route_memo;
pub mod route_refresh;
pub mod schema;
pub mod snapshot;
pub mod trajectories;
pub mod trajectories_repo;

pub use aggregator::{AggregationOutcome, AggregationSummary, StatsAggregator, WatermarkCommit};
pub use position::{PositionReport, Waypoint};
pub use reconciler::{ReconcileSummary, TrajectoryReconciler};
pub use trajectories::Trajectory;
