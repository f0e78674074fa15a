use anyhow::{Context, Result};
use async_trait::async_trait;
use diesel::prelude::*;
use diesel::sql_types;
use tracing::debug;

use crate::db::PgPool;
use crate::position::Waypoint;
use crate::trajectories::{Trajectory, TrajectoryModel, waypoint_json};

/// Version-checked append of one waypoint to an open trajectory
#[derive(Debug, Clone, PartialEq)]
pub struct AppendRequest {
    pub icao24: String,
    /// `last_update` observed when the trajectory was read
    pub expected_last_update: i64,
    pub waypoint: Waypoint,
    pub new_last_update: i64,
    /// Replaces the stored code when set, keeps it when `None`
    pub arrival_airport: Option<String>,
    /// Replaces the stored code when set, keeps it when `None`
    pub departure_airport: Option<String>,
}

/// Storage for open and recently finished trajectories
///
/// Every mutation of an existing trajectory goes through
/// [`TrajectoryStore::conditional_append`], [`TrajectoryStore::finalize_stale`]
/// or [`TrajectoryStore::purge_finished_older_than`]; nothing rewrites a path
/// from a client-side copy.
#[async_trait]
pub trait TrajectoryStore: Send + Sync {
    /// The open trajectory of an aircraft, if any
    async fn find_open(&self, icao24: &str) -> Result<Option<Trajectory>>;

    /// Insert a new open trajectory.
    ///
    /// Returns `false` when another open trajectory for the same aircraft
    /// already exists (a concurrent insert won).
    async fn insert(&self, trajectory: &Trajectory) -> Result<bool>;

    /// Append a waypoint if the trajectory is still open and its `last_update`
    /// still equals `expected_last_update`. Returns whether the append applied.
    async fn conditional_append(&self, request: &AppendRequest) -> Result<bool>;

    /// Finish every open trajectory with `now - last_update > threshold_secs`,
    /// stamping `finished_at = now`. Returns the number finalized.
    async fn finalize_stale(&self, threshold_secs: i64, now: i64) -> Result<usize>;

    /// Delete finished trajectories with `now - finished_at > retention_secs`.
    /// Returns the number deleted.
    async fn purge_finished_older_than(&self, retention_secs: i64, now: i64) -> Result<usize>;

    /// All trajectories with `last_update > lower_bound`, open or finished,
    /// ordered by `last_update` ascending
    async fn scan_since(&self, lower_bound: i64) -> Result<Vec<Trajectory>>;

    async fn count_open(&self) -> Result<i64>;
}

#[derive(Clone)]
pub struct TrajectoriesRepository {
    pool: PgPool,
}

impl TrajectoriesRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a trajectory by its ID
    pub async fn get_by_id(&self, trajectory_id: uuid::Uuid) -> Result<Option<Trajectory>> {
        use crate::schema::trajectories::dsl::*;

        let pool = self.pool.clone();

        let model = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;

            let model: Option<TrajectoryModel> = trajectories
                .filter(id.eq(trajectory_id))
                .select(TrajectoryModel::as_select())
                .first(&mut conn)
                .optional()?;

            Ok::<Option<TrajectoryModel>, anyhow::Error>(model)
        })
        .await??;

        model.map(Trajectory::try_from).transpose()
    }
}

#[async_trait]
impl TrajectoryStore for TrajectoriesRepository {
    async fn find_open(&self, icao24_param: &str) -> Result<Option<Trajectory>> {
        use crate::schema::trajectories::dsl::*;

        let pool = self.pool.clone();
        let icao24_val = icao24_param.to_string();

        let model = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;

            let model: Option<TrajectoryModel> = trajectories
                .filter(icao24.eq(&icao24_val))
                .filter(finished.eq(false))
                .select(TrajectoryModel::as_select())
                .first(&mut conn)
                .optional()
                .with_context(|| format!("Failed to look up open trajectory for {icao24_val}"))?;

            Ok::<Option<TrajectoryModel>, anyhow::Error>(model)
        })
        .await??;

        model.map(Trajectory::try_from).transpose()
    }

    async fn insert(&self, trajectory: &Trajectory) -> Result<bool> {
        use crate::schema::trajectories;

        let pool = self.pool.clone();
        let model: TrajectoryModel = trajectory.clone().into();

        let rows = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;

            // The partial unique index on (icao24) WHERE NOT finished turns a
            // racing second insert into a no-op
            let rows = diesel::insert_into(trajectories::table)
                .values(&model)
                .on_conflict_do_nothing()
                .execute(&mut conn)
                .with_context(|| format!("Failed to insert trajectory for {}", model.icao24))?;

            Ok::<usize, anyhow::Error>(rows)
        })
        .await??;

        Ok(rows == 1)
    }

    async fn conditional_append(&self, request: &AppendRequest) -> Result<bool> {
        let pool = self.pool.clone();
        let request = request.clone();
        let appended = serde_json::Value::Array(vec![waypoint_json(&request.waypoint)]);

        let rows = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;

            let rows = diesel::sql_query(
                r#"
                UPDATE trajectories
                SET path = path || $3,
                    last_update = $4,
                    arrival_airport = COALESCE($5, arrival_airport),
                    departure_airport = COALESCE($6, departure_airport)
                WHERE icao24 = $1
                  AND last_update = $2
                  AND NOT finished
                "#,
            )
            .bind::<sql_types::Text, _>(&request.icao24)
            .bind::<sql_types::BigInt, _>(request.expected_last_update)
            .bind::<sql_types::Jsonb, _>(&appended)
            .bind::<sql_types::BigInt, _>(request.new_last_update)
            .bind::<sql_types::Nullable<sql_types::Text>, _>(&request.arrival_airport)
            .bind::<sql_types::Nullable<sql_types::Text>, _>(&request.departure_airport)
            .execute(&mut conn)
            .with_context(|| format!("Failed to append waypoint for {}", request.icao24))?;

            Ok::<usize, anyhow::Error>(rows)
        })
        .await??;

        Ok(rows > 0)
    }

    async fn finalize_stale(&self, threshold_secs: i64, now: i64) -> Result<usize> {
        use crate::schema::trajectories::dsl::*;

        let pool = self.pool.clone();

        let rows = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;

            let rows = diesel::update(
                trajectories
                    .filter(finished.eq(false))
                    .filter(last_update.lt(now - threshold_secs)),
            )
            .set((finished.eq(true), finished_at.eq(now)))
            .execute(&mut conn)
            .context("Failed to finalize stale trajectories")?;

            Ok::<usize, anyhow::Error>(rows)
        })
        .await??;

        debug!("Finalized {} stale trajectories", rows);
        Ok(rows)
    }

    async fn purge_finished_older_than(&self, retention_secs: i64, now: i64) -> Result<usize> {
        use crate::schema::trajectories::dsl::*;

        let pool = self.pool.clone();

        let rows = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;

            let rows = diesel::delete(
                trajectories
                    .filter(finished.eq(true))
                    .filter(finished_at.ne(0))
                    .filter(finished_at.lt(now - retention_secs)),
            )
            .execute(&mut conn)
            .context("Failed to purge expired trajectories")?;

            Ok::<usize, anyhow::Error>(rows)
        })
        .await??;

        debug!("Purged {} expired trajectories", rows);
        Ok(rows)
    }

    async fn scan_since(&self, lower_bound: i64) -> Result<Vec<Trajectory>> {
        use crate::schema::trajectories::dsl::*;

        let pool = self.pool.clone();

        let models = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;

            let models: Vec<TrajectoryModel> = trajectories
                .filter(last_update.gt(lower_bound))
                .order((last_update.asc(), id.asc()))
                .select(TrajectoryModel::as_select())
                .load(&mut conn)
                .context("Failed to scan trajectories")?;

            Ok::<Vec<TrajectoryModel>, anyhow::Error>(models)
        })
        .await??;

        models.into_iter().map(Trajectory::try_from).collect()
    }

    async fn count_open(&self) -> Result<i64> {
        use crate::schema::trajectories::dsl::*;

        let pool = self.pool.clone();

        let count = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;

            let count = trajectories
                .filter(finished.eq(false))
                .count()
                .get_result::<i64>(&mut conn)?;

            Ok::<i64, anyhow::Error>(count)
        })
        .await??;

        Ok(count)
    }
}
