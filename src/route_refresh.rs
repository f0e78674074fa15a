use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::opensky_client::{FlightRecord, OpenSkyClient};
use crate::route_memo::{RouteEstimate, RouteMemoWriter};

const DAY_SECS: i64 = 24 * 60 * 60;

/// Length of one `/flights/all` request window
pub const REFRESH_WINDOW_SECS: i64 = 60 * 60;

/// Provider of finished-flight history
#[async_trait]
pub trait FlightHistorySource: Send + Sync {
    async fn flights_between(&self, begin: i64, end: i64) -> Result<Vec<FlightRecord>>;
}

#[async_trait]
impl FlightHistorySource for OpenSkyClient {
    async fn flights_between(&self, begin: i64, end: i64) -> Result<Vec<FlightRecord>> {
        Ok(self.get_flights(begin, end).await?)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshSummary {
    pub windows: usize,
    pub failed_windows: usize,
    pub flights: usize,
    pub routes_written: usize,
}

/// Keeps the callsign to route memo fed from flight history
///
/// Finished flights show up in the history feed with a delay of about a day,
/// so the scheduled refresh looks at the day that ended 24 hours ago.
pub struct RouteRefresher {
    source: Arc<dyn FlightHistorySource>,
    writer: Arc<dyn RouteMemoWriter>,
    /// Delay between windows to stay under the feed's rate limit
    pause: Duration,
}

impl RouteRefresher {
    pub fn new(source: Arc<dyn FlightHistorySource>, writer: Arc<dyn RouteMemoWriter>) -> Self {
        Self {
            source,
            writer,
            pause: Duration::ZERO,
        }
    }

    pub fn with_pause(mut self, pause: Duration) -> Self {
        self.pause = pause;
        self
    }

    /// Refresh from the day `[now - 2d, now - 1d)`
    pub async fn refresh_recent(&self, now: i64) -> RefreshSummary {
        self.refresh_range(now - 2 * DAY_SECS, now - DAY_SECS).await
    }

    /// Backfill `days` days ending yesterday
    pub async fn backfill(&self, now: i64, days: u32) -> RefreshSummary {
        let yesterday = now - DAY_SECS;
        self.refresh_range(yesterday - i64::from(days) * DAY_SECS, yesterday)
            .await
    }

    /// Walk `[begin, end)` in one-hour windows. A failed window is logged and
    /// skipped; the rest of the range is still processed.
    pub async fn refresh_range(&self, begin: i64, end: i64) -> RefreshSummary {
        let mut summary = RefreshSummary::default();
        let mut window_start = begin;

        while window_start < end {
            let window_end = (window_start + REFRESH_WINDOW_SECS).min(end);
            summary.windows += 1;

            match self.refresh_window(window_start, window_end).await {
                Ok((flights, written)) => {
                    summary.flights += flights;
                    summary.routes_written += written;
                }
                Err(e) => {
                    summary.failed_windows += 1;
                    metrics::counter!("route_refresh.window.failed").increment(1);
                    warn!(
                        "Route refresh for [{}, {}) failed: {:#}",
                        window_start, window_end, e
                    );
                }
            }

            window_start = window_end;
            if window_start < end && !self.pause.is_zero() {
                tokio::time::sleep(self.pause).await;
            }
        }

        metrics::counter!("route_refresh.routes_written").increment(summary.routes_written as u64);
        info!(
            "Route refresh over {} windows ({} failed): {} flights, {} routes written",
            summary.windows, summary.failed_windows, summary.flights, summary.routes_written
        );

        summary
    }

    /// Returns (flights fetched, routes written)
    async fn refresh_window(&self, begin: i64, end: i64) -> Result<(usize, usize)> {
        let flights = self.source.flights_between(begin, end).await?;
        let routes = routes_from_flights(&flights);

        debug!(
            "Window [{}, {}): {} flights, {} usable routes",
            begin,
            end,
            flights.len(),
            routes.len()
        );

        let written = self.writer.upsert_routes(&routes).await?;
        Ok((flights.len(), written))
    }
}

/// Usable route estimates: callsign present and at least one airport known
pub fn routes_from_flights(flights: &[FlightRecord]) -> Vec<RouteEstimate> {
    flights
        .iter()
        .filter_map(FlightRecord::route_estimate)
        .filter(|route| !route.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::InMemoryRouteMemo;
    use crate::route_memo::RouteMemo;
    use std::sync::Mutex;

    struct RecordingSource {
        calls: Mutex<Vec<(i64, i64)>>,
        fail_begin: Option<i64>,
    }

    #[async_trait]
    impl FlightHistorySource for RecordingSource {
        async fn flights_between(&self, begin: i64, end: i64) -> Result<Vec<FlightRecord>> {
            self.calls.lock().unwrap().push((begin, end));
            if Some(begin) == self.fail_begin {
                anyhow::bail!("feed unavailable");
            }
            Ok(vec![FlightRecord {
                icao24: "3c6444".to_string(),
                first_seen: begin,
                est_departure_airport: Some("LFPG".to_string()),
                last_seen: end - 1,
                est_arrival_airport: Some("EDDF".to_string()),
                callsign: Some(format!("DLH{} ", begin / REFRESH_WINDOW_SECS)),
            }])
        }
    }

    fn flight(callsign: Option<&str>, arrival: Option<&str>, departure: Option<&str>) -> FlightRecord {
        FlightRecord {
            icao24: "abc123".to_string(),
            first_seen: 0,
            est_departure_airport: departure.map(str::to_string),
            last_seen: 0,
            est_arrival_airport: arrival.map(str::to_string),
            callsign: callsign.map(str::to_string),
        }
    }

    #[test]
    fn test_routes_from_flights_skips_blank_and_unknown() {
        let flights = vec![
            flight(Some("DLH4AB "), Some("EDDF"), None),
            flight(Some("   "), Some("EDDF"), Some("LFPG")),
            flight(None, Some("EDDF"), Some("LFPG")),
            flight(Some("SWR12"), None, None),
        ];

        let routes = routes_from_flights(&flights);

        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].callsign, "DLH4AB");
    }

    #[tokio::test]
    async fn test_refresh_range_walks_hourly_windows_past_failures() {
        let source = Arc::new(RecordingSource {
            calls: Mutex::new(Vec::new()),
            fail_begin: Some(REFRESH_WINDOW_SECS),
        });
        let memo = Arc::new(InMemoryRouteMemo::new());
        let refresher = RouteRefresher::new(source.clone(), memo.clone());

        let summary = refresher
            .refresh_range(0, 2 * REFRESH_WINDOW_SECS + 600)
            .await;

        assert_eq!(summary.windows, 3);
        assert_eq!(summary.failed_windows, 1);
        assert_eq!(summary.routes_written, 2);
        assert_eq!(
            *source.calls.lock().unwrap(),
            vec![
                (0, REFRESH_WINDOW_SECS),
                (REFRESH_WINDOW_SECS, 2 * REFRESH_WINDOW_SECS),
                (2 * REFRESH_WINDOW_SECS, 2 * REFRESH_WINDOW_SECS + 600),
            ]
        );

        let route = memo.lookup("DLH0").await.unwrap().unwrap();
        assert_eq!(route.arrival_airport.as_deref(), Some("EDDF"));
    }

    #[tokio::test]
    async fn test_backfill_ends_yesterday() {
        let source = Arc::new(RecordingSource {
            calls: Mutex::new(Vec::new()),
            fail_begin: None,
        });
        let memo = Arc::new(InMemoryRouteMemo::new());
        let refresher = RouteRefresher::new(source.clone(), memo);
        let now = 100 * DAY_SECS;

        let summary = refresher.backfill(now, 1).await;

        assert_eq!(summary.windows, 24);
        let calls = source.calls.lock().unwrap();
        assert_eq!(calls.first().map(|c| c.0), Some(now - 2 * DAY_SECS));
        assert_eq!(calls.last().map(|c| c.1), Some(now - DAY_SECS));
    }
}
