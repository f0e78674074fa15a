use std::collections::HashMap;

use anyhow::{Context, Result};
use diesel::prelude::*;
use diesel::upsert::excluded;
use tracing::info;

use crate::airports::{Airport, AirportModel};
use crate::db::PgPool;

const BATCH_SIZE: usize = 1000;

pub struct AirportsRepository {
    pool: PgPool,
}

impl AirportsRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert or update airports keyed by ICAO code.
    /// A code repeated in the input keeps its last row.
    pub async fn upsert_airports(&self, airports_list: &[Airport]) -> Result<usize> {
        use crate::schema::airports::dsl::*;

        let mut deduped: HashMap<&str, &Airport> = HashMap::new();
        for airport in airports_list {
            deduped.insert(airport.icao.as_str(), airport);
        }
        let models: Vec<AirportModel> = deduped.into_values().map(AirportModel::from).collect();
        let total_airports = models.len();

        let pool = self.pool.clone();

        let upserted = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;

            let mut total = 0;
            for (batch_num, batch) in models.chunks(BATCH_SIZE).enumerate() {
                total += diesel::insert_into(airports)
                    .values(batch)
                    .on_conflict(icao)
                    .do_update()
                    .set((
                        iata.eq(excluded(iata)),
                        name.eq(excluded(name)),
                        city.eq(excluded(city)),
                        country.eq(excluded(country)),
                        latitude.eq(excluded(latitude)),
                        longitude.eq(excluded(longitude)),
                        altitude_ft.eq(excluded(altitude_ft)),
                        updated_at.eq(excluded(updated_at)),
                    ))
                    .execute(&mut conn)
                    .context("Failed to upsert airports")?;

                if total_airports > BATCH_SIZE {
                    info!(
                        "Processed batch {} of {} ({}/{} airports)",
                        batch_num + 1,
                        total_airports.div_ceil(BATCH_SIZE),
                        total,
                        total_airports
                    );
                }
            }

            Ok::<usize, anyhow::Error>(total)
        })
        .await??;

        Ok(upserted)
    }

    pub async fn get_airport_count(&self) -> Result<i64> {
        use crate::schema::airports::dsl::*;

        let pool = self.pool.clone();

        let count = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            let count = airports.count().get_result::<i64>(&mut conn)?;
            Ok::<i64, anyhow::Error>(count)
        })
        .await??;

        Ok(count)
    }

    pub async fn get_airport_by_icao(&self, code: &str) -> Result<Option<Airport>> {
        use crate::schema::airports::dsl::*;

        let pool = self.pool.clone();
        let code = code.trim().to_uppercase();

        let model = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;

            let model: Option<AirportModel> = airports
                .filter(icao.eq(&code))
                .select(AirportModel::as_select())
                .first(&mut conn)
                .optional()
                .with_context(|| format!("Failed to look up airport {code}"))?;

            Ok::<Option<AirportModel>, anyhow::Error>(model)
        })
        .await??;

        Ok(model.map(Airport::from))
    }
}
