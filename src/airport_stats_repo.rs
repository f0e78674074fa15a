use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use diesel::prelude::*;
use diesel::sql_types;
use diesel::upsert::excluded;
use tracing::debug;

use crate::airport_stats::{AirportDailyStats, AirportDailyStatsModel, Movement, StatIncrement};
use crate::db::PgPool;

/// Storage for per-airport daily counters and the aggregation watermark
#[async_trait]
pub trait AirportStatsStore: Send + Sync {
    /// Add one arrival or departure to (airport, day), creating the row on
    /// first contribution
    async fn upsert_increment(&self, airport_code: &str, day: NaiveDate, is_arrival: bool)
    -> Result<()>;

    /// Highest `last_update` already folded into the counters, 0 if never run
    async fn get_watermark(&self) -> Result<i64>;

    /// Advance the watermark; never moves it backwards
    async fn set_watermark(&self, watermark: i64) -> Result<()>;

    /// Apply a group of increments together with the watermark that covers them.
    ///
    /// The default applies them one by one and is not atomic; stores that
    /// support transactions override it so a failure leaves nothing behind.
    async fn commit_group(&self, increments: &[StatIncrement], watermark: i64) -> Result<()> {
        for increment in increments {
            self.upsert_increment(
                &increment.airport_code,
                increment.day,
                increment.movement.is_arrival(),
            )
            .await?;
        }
        self.set_watermark(watermark).await
    }

    async fn get_stats(&self, airport_code: &str, day: NaiveDate)
    -> Result<Option<AirportDailyStats>>;

    /// Delete counters for days strictly before `cutoff`
    async fn purge_before(&self, cutoff: NaiveDate) -> Result<usize>;
}

#[derive(Clone)]
pub struct AirportStatsRepository {
    pool: PgPool,
}

impl AirportStatsRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// All counters for one day, busiest airports first
    pub async fn get_stats_for_day(&self, day_param: NaiveDate) -> Result<Vec<AirportDailyStats>> {
        use crate::schema::airport_daily_stats::dsl::*;

        let pool = self.pool.clone();

        let models = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;

            let models: Vec<AirportDailyStatsModel> = airport_daily_stats
                .filter(day.eq(day_param))
                .order(((arrival_count + departure_count).desc(), airport_code.asc()))
                .select(AirportDailyStatsModel::as_select())
                .load(&mut conn)
                .context("Failed to load airport stats")?;

            Ok::<Vec<AirportDailyStatsModel>, anyhow::Error>(models)
        })
        .await??;

        Ok(models.into_iter().map(AirportDailyStats::from).collect())
    }
}

fn upsert_increment_sync(conn: &mut PgConnection, increment: &StatIncrement) -> Result<()> {
    use crate::schema::airport_daily_stats::dsl::*;

    let model = AirportDailyStatsModel::from(increment);

    diesel::insert_into(airport_daily_stats)
        .values(&model)
        .on_conflict((airport_code, day))
        .do_update()
        .set((
            arrival_count.eq(arrival_count + excluded(arrival_count)),
            departure_count.eq(departure_count + excluded(departure_count)),
            updated_at.eq(excluded(updated_at)),
        ))
        .execute(conn)
        .with_context(|| {
            format!(
                "Failed to increment {} count for {} on {}",
                increment.movement, increment.airport_code, increment.day
            )
        })?;

    Ok(())
}

fn set_watermark_sync(conn: &mut PgConnection, watermark: i64) -> Result<()> {
    diesel::sql_query(
        r#"
        INSERT INTO aggregation_watermark (id, last_update, updated_at)
        VALUES (1, $1, NOW())
        ON CONFLICT (id) DO UPDATE SET
            last_update = GREATEST(aggregation_watermark.last_update, EXCLUDED.last_update),
            updated_at = NOW()
        "#,
    )
    .bind::<sql_types::BigInt, _>(watermark)
    .execute(conn)
    .context("Failed to update aggregation watermark")?;

    Ok(())
}

#[async_trait]
impl AirportStatsStore for AirportStatsRepository {
    async fn upsert_increment(
        &self,
        airport_code: &str,
        day: NaiveDate,
        is_arrival: bool,
    ) -> Result<()> {
        let pool = self.pool.clone();
        let movement = Movement::from_is_arrival(is_arrival);
        let increment = StatIncrement::new(airport_code, day, movement);

        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            upsert_increment_sync(&mut conn, &increment)
        })
        .await??;

        Ok(())
    }

    async fn get_watermark(&self) -> Result<i64> {
        use crate::schema::aggregation_watermark::dsl::*;

        let pool = self.pool.clone();

        let watermark = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;

            let watermark: Option<i64> = aggregation_watermark
                .filter(id.eq(1))
                .select(last_update)
                .first(&mut conn)
                .optional()
                .context("Failed to read aggregation watermark")?;

            Ok::<i64, anyhow::Error>(watermark.unwrap_or(0))
        })
        .await??;

        Ok(watermark)
    }

    async fn set_watermark(&self, watermark: i64) -> Result<()> {
        let pool = self.pool.clone();

        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            set_watermark_sync(&mut conn, watermark)
        })
        .await??;

        Ok(())
    }

    async fn commit_group(&self, increments: &[StatIncrement], watermark: i64) -> Result<()> {
        let pool = self.pool.clone();
        let count = increments.len();
        let increments = increments.to_vec();

        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;

            conn.transaction::<(), anyhow::Error, _>(|conn| {
                for increment in &increments {
                    upsert_increment_sync(conn, increment)?;
                }
                set_watermark_sync(conn, watermark)
            })
        })
        .await??;

        debug!("Committed {} increments with watermark {}", count, watermark);
        Ok(())
    }

    async fn get_stats(
        &self,
        airport_code_param: &str,
        day_param: NaiveDate,
    ) -> Result<Option<AirportDailyStats>> {
        use crate::schema::airport_daily_stats::dsl::*;

        let pool = self.pool.clone();
        let airport_code_val = airport_code_param.to_string();

        let model = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;

            let model: Option<AirportDailyStatsModel> = airport_daily_stats
                .filter(airport_code.eq(&airport_code_val))
                .filter(day.eq(day_param))
                .select(AirportDailyStatsModel::as_select())
                .first(&mut conn)
                .optional()?;

            Ok::<Option<AirportDailyStatsModel>, anyhow::Error>(model)
        })
        .await??;

        Ok(model.map(AirportDailyStats::from))
    }

    async fn purge_before(&self, cutoff: NaiveDate) -> Result<usize> {
        use crate::schema::airport_daily_stats::dsl::*;

        let pool = self.pool.clone();

        let rows = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;

            let rows = diesel::delete(airport_daily_stats.filter(day.lt(cutoff)))
                .execute(&mut conn)
                .context("Failed to purge old airport stats")?;

            Ok::<usize, anyhow::Error>(rows)
        })
        .await??;

        debug!("Purged {} airport stats rows before {}", rows, cutoff);
        Ok(rows)
    }
}
