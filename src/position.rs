use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single point on a trajectory path
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Waypoint {
    pub longitude: f64,
    pub latitude: f64,
}

impl Waypoint {
    pub fn new(longitude: f64, latitude: f64) -> Self {
        Self {
            longitude,
            latitude,
        }
    }

    /// Coordinates are finite and inside the WGS84 range
    pub fn is_valid(&self) -> bool {
        self.longitude.is_finite()
            && self.latitude.is_finite()
            && (-180.0..=180.0).contains(&self.longitude)
            && (-90.0..=90.0).contains(&self.latitude)
    }
}

/// Position of one aircraft as seen in one polling cycle
///
/// All reports of one poll share the same `request_time`. Reports are never
/// persisted beyond the latest batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionReport {
    /// ICAO 24-bit transponder address in lowercase hex (e.g. "3c6444")
    pub icao24: String,

    /// Flight callsign as broadcast, may be blank or missing
    pub callsign: Option<String>,

    /// Epoch seconds of the poll that produced this report
    pub request_time: i64,

    pub longitude: f64,
    pub latitude: f64,
}

impl PositionReport {
    pub fn new(
        icao24: impl Into<String>,
        callsign: Option<&str>,
        request_time: i64,
        longitude: f64,
        latitude: f64,
    ) -> Self {
        Self {
            icao24: icao24.into().trim().to_lowercase(),
            callsign: callsign.map(str::to_string),
            request_time,
            longitude,
            latitude,
        }
    }

    pub fn waypoint(&self) -> Waypoint {
        Waypoint::new(self.longitude, self.latitude)
    }

    /// Callsign in the form used as a route memo key, `None` when blank
    pub fn normalized_callsign(&self) -> Option<String> {
        normalize_callsign(self.callsign.as_deref())
    }

    /// Check the report against the request time of the batch it arrived in
    pub fn validate(&self, batch_request_time: i64) -> Result<(), ReportRejection> {
        if self.icao24.trim().is_empty() {
            return Err(ReportRejection::MissingIcao24);
        }

        if !self.waypoint().is_valid() {
            return Err(ReportRejection::InvalidPosition {
                longitude: self.longitude,
                latitude: self.latitude,
            });
        }

        if self.request_time != batch_request_time {
            return Err(ReportRejection::MixedRequestTime {
                expected: batch_request_time,
                found: self.request_time,
            });
        }

        Ok(())
    }
}

/// Trim and upper-case a callsign; blank callsigns become `None`
pub fn normalize_callsign(raw: Option<&str>) -> Option<String> {
    let trimmed = raw?.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_uppercase())
    }
}

/// Reason a single report was refused by the reconciler
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ReportRejection {
    #[error("report has no aircraft identifier")]
    MissingIcao24,

    #[error("report has invalid position (lon {longitude}, lat {latitude})")]
    InvalidPosition { longitude: f64, latitude: f64 },

    #[error("report request time {found} does not match batch request time {expected}")]
    MixedRequestTime { expected: i64, found: i64 },
}

/// A batch split into acceptable reports and rejected ones
#[derive(Debug, Default)]
pub struct ValidatedBatch {
    /// Request time shared by the batch, taken from its first report
    pub request_time: Option<i64>,
    pub accepted: Vec<PositionReport>,
    pub rejected: Vec<(PositionReport, ReportRejection)>,
}

/// Validate every report of a polled batch independently
///
/// The first report defines the batch request time; any report with a
/// different time is rejected on its own without affecting the rest.
pub fn validate_batch(batch: Vec<PositionReport>) -> ValidatedBatch {
    let Some(request_time) = batch.first().map(|r| r.request_time) else {
        return ValidatedBatch::default();
    };

    let mut validated = ValidatedBatch {
        request_time: Some(request_time),
        ..Default::default()
    };

    for report in batch {
        match report.validate(request_time) {
            Ok(()) => validated.accepted.push(report),
            Err(reason) => validated.rejected.push((report, reason)),
        }
    }

    validated
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_callsign() {
        assert_eq!(
            normalize_callsign(Some("dlh4ab  ")),
            Some("DLH4AB".to_string())
        );
        assert_eq!(normalize_callsign(Some("   ")), None);
        assert_eq!(normalize_callsign(Some("")), None);
        assert_eq!(normalize_callsign(None), None);
    }

    #[test]
    fn test_new_normalizes_icao24() {
        let report = PositionReport::new(" 3C6444 ", Some("DLH4AB"), 100, 8.5, 50.0);
        assert_eq!(report.icao24, "3c6444");
    }

    #[test]
    fn test_validate_rejects_missing_icao24() {
        let report = PositionReport::new("", None, 100, 8.5, 50.0);
        assert_eq!(report.validate(100), Err(ReportRejection::MissingIcao24));
    }

    #[test]
    fn test_validate_rejects_bad_coordinates() {
        let report = PositionReport::new("abc123", None, 100, f64::NAN, 50.0);
        assert!(matches!(
            report.validate(100),
            Err(ReportRejection::InvalidPosition { .. })
        ));

        let report = PositionReport::new("abc123", None, 100, 8.5, 91.0);
        assert!(matches!(
            report.validate(100),
            Err(ReportRejection::InvalidPosition { .. })
        ));
    }

    #[test]
    fn test_validate_batch_rejects_mixed_request_time() {
        let batch = vec![
            PositionReport::new("a1", None, 100, 10.0, 20.0),
            PositionReport::new("a2", None, 101, 11.0, 21.0),
            PositionReport::new("a3", None, 100, 12.0, 22.0),
        ];

        let validated = validate_batch(batch);

        assert_eq!(validated.request_time, Some(100));
        assert_eq!(validated.accepted.len(), 2);
        assert_eq!(validated.rejected.len(), 1);
        assert_eq!(validated.rejected[0].0.icao24, "a2");
        assert_eq!(
            validated.rejected[0].1,
            ReportRejection::MixedRequestTime {
                expected: 100,
                found: 101
            }
        );
    }

    #[test]
    fn test_validate_empty_batch() {
        let validated = validate_batch(Vec::new());
        assert!(validated.request_time.is_none());
        assert!(validated.accepted.is_empty());
        assert!(validated.rejected.is_empty());
    }
}
