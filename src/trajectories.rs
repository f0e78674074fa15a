use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::position::{PositionReport, Waypoint};

/// Seconds without an update before an open trajectory is finalized
pub const DEFAULT_STALENESS_THRESHOLD_SECS: i64 = 1800;

/// Seconds a finished trajectory is kept before the retention sweep removes it
pub const DEFAULT_RETENTION_SECS: i64 = 5 * 24 * 60 * 60;

/// Lifecycle state of a trajectory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrajectoryStatus {
    /// Still accepting waypoints (at most one per aircraft)
    Open,
    /// Closed after going stale; never accepts another append
    Finished,
}

/// Continuous path of one aircraft, built up from successive position reports
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    /// Surrogate key; an aircraft accumulates many finished trajectories over time
    pub id: Uuid,

    /// ICAO 24-bit address of the aircraft
    pub icao24: String,

    /// Callsign from the report that opened the trajectory
    pub callsign: Option<String>,

    /// Estimated departure airport code, backfilled from the route memo
    pub departure_airport: Option<String>,

    /// Estimated arrival airport code, backfilled from the route memo
    pub arrival_airport: Option<String>,

    /// Waypoints in chronological order, append-only
    pub path: Vec<Waypoint>,

    /// Epoch seconds of the last applied report.
    /// Also the version token checked by conditional appends.
    pub last_update: i64,

    pub finished: bool,

    /// Epoch seconds when the trajectory was finalized, 0 while open
    pub finished_at: i64,

    pub created_at: DateTime<Utc>,
}

impl Trajectory {
    /// Open a new trajectory from the first report seen for an aircraft
    pub fn open_from_report(
        report: &PositionReport,
        arrival_airport: Option<String>,
        departure_airport: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            icao24: report.icao24.clone(),
            callsign: report.normalized_callsign(),
            departure_airport,
            arrival_airport,
            path: vec![report.waypoint()],
            last_update: report.request_time,
            finished: false,
            finished_at: 0,
            created_at: Utc::now(),
        }
    }

    pub fn status(&self) -> TrajectoryStatus {
        if self.finished {
            TrajectoryStatus::Finished
        } else {
            TrajectoryStatus::Open
        }
    }

    pub fn is_open(&self) -> bool {
        !self.finished
    }

    /// Open and not updated for longer than `threshold_secs`
    pub fn is_stale(&self, now: i64, threshold_secs: i64) -> bool {
        !self.finished && now - self.last_update > threshold_secs
    }

    /// Finished longer than `retention_secs` ago.
    /// `finished_at == 0` means still open and never matches.
    pub fn is_expired(&self, now: i64, retention_secs: i64) -> bool {
        self.finished && self.finished_at != 0 && now - self.finished_at > retention_secs
    }

    pub fn finalize(&mut self, now: i64) {
        self.finished = true;
        self.finished_at = now;
    }

    /// Apply an append that already passed the version check.
    /// Unresolved airport codes keep the stored value.
    pub fn apply_append(
        &mut self,
        waypoint: Waypoint,
        new_last_update: i64,
        arrival_airport: Option<&str>,
        departure_airport: Option<&str>,
    ) {
        self.path.push(waypoint);
        self.last_update = new_last_update;
        if let Some(code) = arrival_airport {
            self.arrival_airport = Some(code.to_string());
        }
        if let Some(code) = departure_airport {
            self.departure_airport = Some(code.to_string());
        }
    }

    /// UTC calendar day of `last_update`
    pub fn last_update_day(&self) -> Result<chrono::NaiveDate> {
        DateTime::from_timestamp(self.last_update, 0)
            .map(|ts| ts.date_naive())
            .with_context(|| {
                format!(
                    "Trajectory {} has out-of-range last_update {}",
                    self.id, self.last_update
                )
            })
    }
}

/// JSON form of a waypoint as stored in the `path` column
pub fn waypoint_json(waypoint: &Waypoint) -> serde_json::Value {
    json!({
        "longitude": waypoint.longitude,
        "latitude": waypoint.latitude,
    })
}

/// Diesel model for the trajectories table
#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = crate::schema::trajectories)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct TrajectoryModel {
    pub id: Uuid,
    pub icao24: String,
    pub callsign: Option<String>,
    pub departure_airport: Option<String>,
    pub arrival_airport: Option<String>,
    pub path: serde_json::Value,
    pub last_update: i64,
    pub finished: bool,
    pub finished_at: i64,
    pub created_at: DateTime<Utc>,
}

impl From<Trajectory> for TrajectoryModel {
    fn from(trajectory: Trajectory) -> Self {
        Self {
            id: trajectory.id,
            path: serde_json::Value::Array(trajectory.path.iter().map(waypoint_json).collect()),
            icao24: trajectory.icao24,
            callsign: trajectory.callsign,
            departure_airport: trajectory.departure_airport,
            arrival_airport: trajectory.arrival_airport,
            last_update: trajectory.last_update,
            finished: trajectory.finished,
            finished_at: trajectory.finished_at,
            created_at: trajectory.created_at,
        }
    }
}

impl TryFrom<TrajectoryModel> for Trajectory {
    type Error = anyhow::Error;

    fn try_from(model: TrajectoryModel) -> Result<Self> {
        let path: Vec<Waypoint> = serde_json::from_value(model.path)
            .with_context(|| format!("Malformed path for trajectory {}", model.id))?;

        Ok(Self {
            id: model.id,
            icao24: model.icao24,
            callsign: model.callsign,
            departure_airport: model.departure_airport,
            arrival_airport: model.arrival_airport,
            path,
            last_update: model.last_update,
            finished: model.finished,
            finished_at: model.finished_at,
            created_at: model.created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_trajectory(last_update: i64) -> Trajectory {
        let report = PositionReport::new("a1", Some(" dlh4ab "), last_update, 10.0, 20.0);
        Trajectory::open_from_report(&report, None, None)
    }

    #[test]
    fn test_open_from_report() {
        let trajectory = open_trajectory(100);

        assert_eq!(trajectory.icao24, "a1");
        assert_eq!(trajectory.callsign.as_deref(), Some("DLH4AB"));
        assert_eq!(trajectory.path, vec![Waypoint::new(10.0, 20.0)]);
        assert_eq!(trajectory.last_update, 100);
        assert_eq!(trajectory.status(), TrajectoryStatus::Open);
        assert_eq!(trajectory.finished_at, 0);
    }

    #[test]
    fn test_staleness_is_strict() {
        let trajectory = open_trajectory(100);

        assert!(!trajectory.is_stale(1900, DEFAULT_STALENESS_THRESHOLD_SECS));
        assert!(trajectory.is_stale(1901, DEFAULT_STALENESS_THRESHOLD_SECS));
    }

    #[test]
    fn test_finished_trajectory_is_never_stale() {
        let mut trajectory = open_trajectory(100);
        trajectory.finalize(2000);

        assert_eq!(trajectory.status(), TrajectoryStatus::Finished);
        assert!(!trajectory.is_stale(100_000, DEFAULT_STALENESS_THRESHOLD_SECS));
    }

    #[test]
    fn test_expiry_boundary_and_open_sentinel() {
        let mut trajectory = open_trajectory(100);
        assert!(!trajectory.is_expired(10_000_000, DEFAULT_RETENTION_SECS));

        trajectory.finalize(1000);
        assert!(!trajectory.is_expired(1000 + DEFAULT_RETENTION_SECS, DEFAULT_RETENTION_SECS));
        assert!(trajectory.is_expired(1001 + DEFAULT_RETENTION_SECS, DEFAULT_RETENTION_SECS));
    }

    #[test]
    fn test_apply_append_keeps_known_airports() {
        let mut trajectory = open_trajectory(100);
        trajectory.apply_append(Waypoint::new(11.0, 21.0), 105, Some("EDDF"), None);
        trajectory.apply_append(Waypoint::new(12.0, 22.0), 110, None, Some("LFPG"));

        assert_eq!(trajectory.path.len(), 3);
        assert_eq!(trajectory.last_update, 110);
        assert_eq!(trajectory.arrival_airport.as_deref(), Some("EDDF"));
        assert_eq!(trajectory.departure_airport.as_deref(), Some("LFPG"));
    }

    #[test]
    fn test_model_conversion_preserves_path_order() {
        let mut trajectory = open_trajectory(100);
        trajectory.apply_append(Waypoint::new(11.0, 21.0), 105, None, None);

        let model: TrajectoryModel = trajectory.clone().into();
        assert_eq!(
            model.path,
            json!([
                {"longitude": 10.0, "latitude": 20.0},
                {"longitude": 11.0, "latitude": 21.0}
            ])
        );

        let restored = Trajectory::try_from(model).unwrap();
        assert_eq!(restored, trajectory);
    }

    #[test]
    fn test_last_update_day() {
        let trajectory = open_trajectory(500);
        assert_eq!(
            trajectory.last_update_day().unwrap(),
            chrono::NaiveDate::from_ymd_opt(1970, 1, 1).unwrap()
        );
    }
}
