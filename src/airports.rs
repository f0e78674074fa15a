use std::io::Read;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// OpenFlights `airports.dat` column positions
const NAME: usize = 1;
const CITY: usize = 2;
const COUNTRY: usize = 3;
const IATA: usize = 4;
const ICAO: usize = 5;
const LATITUDE: usize = 6;
const LONGITUDE: usize = 7;
const ALTITUDE: usize = 8;

/// Reference airport keyed by ICAO code, the code trajectories and stats use
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Airport {
    pub icao: String,
    pub iata: Option<String>,
    pub name: String,
    pub city: Option<String>,
    pub country: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude_ft: Option<i32>,
}

/// Result of reading an airport data file
#[derive(Debug, Default)]
pub struct AirportsFile {
    pub airports: Vec<Airport>,
    /// Rows missing an ICAO code or a valid position
    pub skipped: usize,
}

/// Empty and `\N` cells are missing values
fn to_opt_string(s: &str) -> Option<String> {
    let t = s.trim();
    if t.is_empty() || t == "\\N" {
        None
    } else {
        Some(t.to_string())
    }
}

fn to_opt_f64(s: &str) -> Option<f64> {
    to_opt_string(s)?.parse::<f64>().ok().filter(|v| v.is_finite())
}

fn is_icao_code(code: &str) -> bool {
    code.len() == 4 && code.chars().all(|c| c.is_ascii_alphanumeric())
}

impl Airport {
    fn from_record(record: &csv::StringRecord) -> Option<Self> {
        let field = |i: usize| record.get(i).and_then(to_opt_string);

        let icao = field(ICAO)?.to_uppercase();
        if !is_icao_code(&icao) {
            return None;
        }

        let latitude = record.get(LATITUDE).and_then(to_opt_f64)?;
        let longitude = record.get(LONGITUDE).and_then(to_opt_f64)?;
        if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
            return None;
        }

        Some(Self {
            icao,
            iata: field(IATA)
                .map(|code| code.to_uppercase())
                .filter(|code| code.len() <= 4),
            name: field(NAME)?,
            city: field(CITY),
            country: field(COUNTRY),
            latitude,
            longitude,
            altitude_ft: record
                .get(ALTITUDE)
                .and_then(to_opt_f64)
                .map(|feet| feet.round() as i32),
        })
    }
}

/// Read OpenFlights-style airport rows (no header, quoted fields).
///
/// Unusable rows are skipped and counted; only I/O failures are errors.
pub fn read_airports<R: Read>(reader: R) -> Result<AirportsFile> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(reader);

    let mut file = AirportsFile::default();
    for (index, result) in csv_reader.records().enumerate() {
        let record = match result {
            Ok(record) => record,
            Err(e) if e.is_io_error() => {
                return Err(e).context("Failed to read airport data");
            }
            Err(e) => {
                warn!("Skipping malformed airport row {}: {}", index + 1, e);
                file.skipped += 1;
                continue;
            }
        };

        match Airport::from_record(&record) {
            Some(airport) => file.airports.push(airport),
            None => {
                debug!("Skipping airport row {} without ICAO code or position", index + 1);
                file.skipped += 1;
            }
        }
    }

    Ok(file)
}

/// Diesel model for the airports table
#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = crate::schema::airports)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct AirportModel {
    pub icao: String,
    pub iata: Option<String>,
    pub name: String,
    pub city: Option<String>,
    pub country: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude_ft: Option<i32>,
    pub updated_at: DateTime<Utc>,
}

impl From<AirportModel> for Airport {
    fn from(model: AirportModel) -> Self {
        Self {
            icao: model.icao,
            iata: model.iata,
            name: model.name,
            city: model.city,
            country: model.country,
            latitude: model.latitude,
            longitude: model.longitude,
            altitude_ft: model.altitude_ft,
        }
    }
}

impl From<&Airport> for AirportModel {
    fn from(airport: &Airport) -> Self {
        Self {
            icao: airport.icao.clone(),
            iata: airport.iata.clone(),
            name: airport.name.clone(),
            city: airport.city.clone(),
            country: airport.country.clone(),
            latitude: airport.latitude,
            longitude: airport.longitude,
            altitude_ft: airport.altitude_ft,
            updated_at: Utc::now(),
        }
    }
}
