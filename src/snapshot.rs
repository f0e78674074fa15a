//! Latest polled snapshot of aircraft positions
//!
//! The snapshot is overwritten every poll rather than queued: a slow
//! reconcile cycle only ever sees the most recent batch.

use anyhow::{Context, Result};
use async_trait::async_trait;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::db::PgPool;
use crate::position::PositionReport;

/// Provider of the current batch of position reports
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Latest batch; may be empty. All reports share one request time.
    async fn fetch_current_batch(&self) -> Result<Vec<PositionReport>>;
}

/// One aircraft's state in the latest snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Queryable, Selectable, Insertable)]
#[diesel(table_name = crate::schema::current_states)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct CurrentState {
    pub icao24: String,
    pub request_time: i64,
    pub callsign: Option<String>,
    pub origin_country: Option<String>,
    pub longitude: f64,
    pub latitude: f64,
    pub baro_altitude: Option<f64>,
    pub on_ground: bool,
    pub velocity: Option<f64>,
    pub true_track: Option<f64>,
}

impl From<&CurrentState> for PositionReport {
    fn from(state: &CurrentState) -> Self {
        PositionReport::new(
            state.icao24.as_str(),
            state.callsign.as_deref(),
            state.request_time,
            state.longitude,
            state.latitude,
        )
    }
}

#[derive(Clone)]
pub struct CurrentStatesRepository {
    pool: PgPool,
}

impl CurrentStatesRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Replace the stored snapshot with `states` in one transaction
    pub async fn replace_batch(&self, states: Vec<CurrentState>) -> Result<usize> {
        use crate::schema::current_states::dsl::*;

        let pool = self.pool.clone();

        // icao24 is the primary key; a feed repeating an aircraft keeps the last row
        let mut by_icao24 = std::collections::HashMap::new();
        for state in states {
            by_icao24.insert(state.icao24.clone(), state);
        }
        let states: Vec<CurrentState> = by_icao24.into_values().collect();

        let rows = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;

            conn.transaction::<usize, anyhow::Error, _>(|conn| {
                // DELETE rather than TRUNCATE so concurrent readers keep seeing
                // the previous batch until this transaction commits
                diesel::delete(current_states)
                    .execute(conn)
                    .context("Failed to clear current states")?;

                let mut total = 0;
                for chunk in states.chunks(1000) {
                    total += diesel::insert_into(current_states)
                        .values(chunk)
                        .execute(conn)
                        .context("Failed to insert current states")?;
                }
                Ok(total)
            })
        })
        .await??;

        debug!("Stored snapshot with {} aircraft states", rows);
        Ok(rows)
    }

    pub async fn get_all(&self) -> Result<Vec<CurrentState>> {
        use crate::schema::current_states::dsl::*;

        let pool = self.pool.clone();

        let states = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;

            let states: Vec<CurrentState> = current_states
                .order(icao24.asc())
                .select(CurrentState::as_select())
                .load(&mut conn)
                .context("Failed to load current states")?;

            Ok::<Vec<CurrentState>, anyhow::Error>(states)
        })
        .await??;

        Ok(states)
    }
}

#[async_trait]
impl SnapshotSource for CurrentStatesRepository {
    async fn fetch_current_batch(&self) -> Result<Vec<PositionReport>> {
        let states = self.get_all().await?;
        Ok(states.iter().map(PositionReport::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_state_to_report() {
        let state = CurrentState {
            icao24: "3C6444".to_string(),
            request_time: 1_700_000_000,
            callsign: Some("DLH4AB  ".to_string()),
            origin_country: Some("Germany".to_string()),
            longitude: 8.57,
            latitude: 50.03,
            baro_altitude: Some(10_000.0),
            on_ground: false,
            velocity: Some(230.0),
            true_track: Some(90.0),
        };

        let report = PositionReport::from(&state);

        assert_eq!(report.icao24, "3c6444");
        assert_eq!(report.normalized_callsign().as_deref(), Some("DLH4AB"));
        assert_eq!(report.request_time, 1_700_000_000);
        assert_eq!(report.longitude, 8.57);
        assert_eq!(report.latitude, 50.03);
    }
}
