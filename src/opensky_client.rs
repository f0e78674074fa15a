use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::OpenSkySettings;
use crate::position::PositionReport;
use crate::retry::{RetryPolicy, Transient};
use crate::route_memo::RouteEstimate;
use crate::snapshot::{CurrentState, SnapshotSource};

/// Longest interval `/flights/all` accepts
pub const MAX_FLIGHTS_INTERVAL_SECS: i64 = 2 * 60 * 60;

const FLIGHTS_TIMEOUT: Duration = Duration::from_secs(35);

#[derive(Debug, Error)]
pub enum OpenSkyError {
    #[error("request to {operation} failed: {source}")]
    Http {
        operation: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("{operation} returned {status}: {body}")]
    Status {
        operation: &'static str,
        status: StatusCode,
        body: String,
    },

    #[error("could not decode {operation} response: {message}")]
    Decode {
        operation: &'static str,
        message: String,
    },

    #[error("flights interval [{begin}, {end}) must be non-empty and at most two hours")]
    InvalidInterval { begin: i64, end: i64 },
}

impl Transient for OpenSkyError {
    fn is_transient(&self) -> bool {
        match self {
            OpenSkyError::Http { source, .. } => source.is_timeout() || source.is_connect(),
            OpenSkyError::Status { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            OpenSkyError::Decode { .. } | OpenSkyError::InvalidInterval { .. } => false,
        }
    }
}

/// One aircraft state from `/states/all`
///
/// The API encodes each state as a positional JSON array.
#[derive(Debug, Clone, PartialEq)]
pub struct StateVector {
    pub icao24: String,
    pub callsign: Option<String>,
    pub origin_country: Option<String>,
    pub time_position: Option<i64>,
    pub last_contact: Option<i64>,
    pub longitude: Option<f64>,
    pub latitude: Option<f64>,
    pub baro_altitude: Option<f64>,
    pub on_ground: bool,
    pub velocity: Option<f64>,
    pub true_track: Option<f64>,
    pub vertical_rate: Option<f64>,
    pub geo_altitude: Option<f64>,
    pub squawk: Option<String>,
    pub spi: bool,
    pub position_source: Option<i64>,
}

impl StateVector {
    /// Parse one positional row; `None` when the row has no icao24
    pub fn from_row(row: &[Value]) -> Option<Self> {
        let text = |i: usize| row.get(i).and_then(Value::as_str).map(str::to_string);
        let float = |i: usize| row.get(i).and_then(Value::as_f64);
        let int = |i: usize| row.get(i).and_then(Value::as_i64);
        let flag = |i: usize| row.get(i).and_then(Value::as_bool).unwrap_or(false);

        let icao24 = text(0)?;
        if icao24.trim().is_empty() {
            return None;
        }

        Some(Self {
            icao24,
            callsign: text(1),
            origin_country: text(2),
            time_position: int(3),
            last_contact: int(4),
            longitude: float(5),
            latitude: float(6),
            baro_altitude: float(7),
            on_ground: flag(8),
            velocity: float(9),
            true_track: float(10),
            vertical_rate: float(11),
            geo_altitude: float(13),
            squawk: text(14),
            spi: flag(15),
            position_source: int(16),
        })
    }

    /// Row for the `current_states` table; `None` without a position
    pub fn to_current_state(&self, request_time: i64) -> Option<CurrentState> {
        Some(CurrentState {
            icao24: self.icao24.trim().to_lowercase(),
            request_time,
            callsign: self.callsign.clone(),
            origin_country: self.origin_country.clone(),
            longitude: self.longitude?,
            latitude: self.latitude?,
            baro_altitude: self.baro_altitude,
            on_ground: self.on_ground,
            velocity: self.velocity,
            true_track: self.true_track,
        })
    }
}

/// Response of `/states/all`
#[derive(Debug, Clone, PartialEq)]
pub struct StatesSnapshot {
    /// Epoch seconds the states refer to; shared by every report
    pub time: i64,
    pub states: Vec<StateVector>,
}

impl StatesSnapshot {
    pub fn current_states(&self) -> Vec<CurrentState> {
        self.states
            .iter()
            .filter_map(|s| s.to_current_state(self.time))
            .collect()
    }

    pub fn position_reports(&self) -> Vec<PositionReport> {
        self.current_states()
            .iter()
            .map(PositionReport::from)
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct RawStatesResponse {
    time: i64,
    states: Option<Vec<Vec<Value>>>,
}

/// One finished flight from `/flights/all`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlightRecord {
    pub icao24: String,
    pub first_seen: i64,
    pub est_departure_airport: Option<String>,
    pub last_seen: i64,
    pub est_arrival_airport: Option<String>,
    pub callsign: Option<String>,
}

impl FlightRecord {
    pub fn route_estimate(&self) -> Option<RouteEstimate> {
        RouteEstimate::from_feed(
            self.callsign.as_deref(),
            self.est_arrival_airport.as_deref(),
            self.est_departure_airport.as_deref(),
        )
    }
}

/// Client for the OpenSky Network REST API
pub struct OpenSkyClient {
    client: Client,
    base_url: String,
    username: Option<String>,
    password: Option<String>,
    retry: RetryPolicy,
}

impl OpenSkyClient {
    pub fn new(settings: &OpenSkySettings, retry: RetryPolicy) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .user_agent(concat!("trajectory-tracker/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build OpenSky HTTP client")?;

        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            username: settings.username.clone(),
            password: settings.password.clone(),
            retry,
        })
    }

    /// Fetch all state vectors, for `time` or the latest when `None`
    pub async fn get_states(&self, time: Option<i64>) -> Result<StatesSnapshot, OpenSkyError> {
        let mut params = Vec::new();
        if let Some(t) = time {
            params.push(("time", t.to_string()));
        }

        let snapshot = self
            .retry
            .run("opensky /states/all", || self.fetch_states(params.clone()))
            .await
            .inspect_err(|_| metrics::counter!("opensky.states.failed").increment(1))?;

        metrics::counter!("opensky.states.fetched").increment(1);
        metrics::gauge!("opensky.states.aircraft").set(snapshot.states.len() as f64);
        info!(
            "Fetched {} state vectors for time {}",
            snapshot.states.len(),
            snapshot.time
        );

        Ok(snapshot)
    }

    /// Fetch flights seen within `[begin, end)`; the interval may span at
    /// most two hours
    pub async fn get_flights(&self, begin: i64, end: i64) -> Result<Vec<FlightRecord>, OpenSkyError> {
        if end <= begin || end - begin > MAX_FLIGHTS_INTERVAL_SECS {
            return Err(OpenSkyError::InvalidInterval { begin, end });
        }

        let flights = self
            .retry
            .run("opensky /flights/all", || self.fetch_flights(begin, end))
            .await
            .inspect_err(|_| metrics::counter!("opensky.flights.failed").increment(1))?;

        metrics::counter!("opensky.flights.fetched").increment(1);
        debug!("Fetched {} flights for [{}, {})", flights.len(), begin, end);

        Ok(flights)
    }

    fn request(&self, path: &str) -> reqwest::RequestBuilder {
        let request = self.client.get(format!("{}{}", self.base_url, path));
        match &self.username {
            Some(username) => request.basic_auth(username, self.password.as_deref()),
            None => request,
        }
    }

    async fn fetch_states(
        &self,
        params: Vec<(&'static str, String)>,
    ) -> Result<StatesSnapshot, OpenSkyError> {
        const OPERATION: &str = "/states/all";

        let response = self
            .request(OPERATION)
            .query(&params)
            .send()
            .await
            .map_err(|source| OpenSkyError::Http {
                operation: OPERATION,
                source,
            })?;

        let body = read_success_body(OPERATION, response).await?;
        parse_states(&body)
    }

    async fn fetch_flights(&self, begin: i64, end: i64) -> Result<Vec<FlightRecord>, OpenSkyError> {
        const OPERATION: &str = "/flights/all";

        let response = self
            .request(OPERATION)
            .query(&[("begin", begin), ("end", end)])
            .timeout(FLIGHTS_TIMEOUT)
            .send()
            .await
            .map_err(|source| OpenSkyError::Http {
                operation: OPERATION,
                source,
            })?;

        // No flights in the interval is reported as 404
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }

        let body = read_success_body(OPERATION, response).await?;
        serde_json::from_str(&body).map_err(|e| OpenSkyError::Decode {
            operation: OPERATION,
            message: e.to_string(),
        })
    }
}

async fn read_success_body(
    operation: &'static str,
    response: reqwest::Response,
) -> Result<String, OpenSkyError> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|source| OpenSkyError::Http { operation, source })?;

    if !status.is_success() {
        return Err(OpenSkyError::Status {
            operation,
            status,
            body: body.chars().take(500).collect(),
        });
    }

    Ok(body)
}

/// Parse a `/states/all` body; a null `states` array means no aircraft
pub fn parse_states(body: &str) -> Result<StatesSnapshot, OpenSkyError> {
    let raw: RawStatesResponse = serde_json::from_str(body).map_err(|e| OpenSkyError::Decode {
        operation: "/states/all",
        message: e.to_string(),
    })?;

    let states = raw
        .states
        .unwrap_or_default()
        .iter()
        .filter_map(|row| StateVector::from_row(row))
        .collect();

    Ok(StatesSnapshot {
        time: raw.time,
        states,
    })
}

#[async_trait]
impl SnapshotSource for OpenSkyClient {
    async fn fetch_current_batch(&self) -> Result<Vec<PositionReport>> {
        let snapshot = self.get_states(None).await?;
        Ok(snapshot.position_reports())
    }
}
