use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::position::{PositionReport, validate_batch};
use crate::route_memo::{RouteEstimate, RouteMemo};
use crate::trajectories::{DEFAULT_RETENTION_SECS, DEFAULT_STALENESS_THRESHOLD_SECS, Trajectory};
use crate::trajectories_repo::{AppendRequest, TrajectoryStore};

/// Thresholds used by the finalization and retention passes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcilerSettings {
    pub staleness_threshold_secs: i64,
    pub retention_secs: i64,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            staleness_threshold_secs: DEFAULT_STALENESS_THRESHOLD_SECS,
            retention_secs: DEFAULT_RETENTION_SECS,
        }
    }
}

/// Counters for one reconcile invocation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    /// Open trajectories closed by the staleness pass
    pub finalized: usize,
    /// Finished trajectories removed by the retention pass
    pub purged: usize,
    pub created: usize,
    pub appended: usize,
    /// Appends or inserts that lost to a concurrent writer
    pub conflicts: usize,
    /// Reports not newer than their open trajectory, or already stale with none open
    pub duplicates: usize,
    /// Malformed reports
    pub rejected: usize,
    /// Reports or passes that failed in the store
    pub failed: usize,
}

impl ReconcileSummary {
    fn record(&mut self, outcome: ReportOutcome) {
        match outcome {
            ReportOutcome::Created => self.created += 1,
            ReportOutcome::Appended => self.appended += 1,
            ReportOutcome::Conflict => self.conflicts += 1,
            ReportOutcome::Duplicate => self.duplicates += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReportOutcome {
    Created,
    Appended,
    Conflict,
    Duplicate,
}

/// Matches polled position reports to trajectories
///
/// Overlapping invocations are safe: every change to an existing trajectory is
/// a version-checked append keyed on the `last_update` read for that report,
/// so the slower of two racing runs drops its append instead of overwriting
/// the path.
pub struct TrajectoryReconciler {
    store: Arc<dyn TrajectoryStore>,
    route_memo: Arc<dyn RouteMemo>,
    settings: ReconcilerSettings,
}

impl TrajectoryReconciler {
    pub fn new(
        store: Arc<dyn TrajectoryStore>,
        route_memo: Arc<dyn RouteMemo>,
        settings: ReconcilerSettings,
    ) -> Self {
        Self {
            store,
            route_memo,
            settings,
        }
    }

    /// Reconcile a batch against the current wall clock
    pub async fn reconcile(&self, batch: Vec<PositionReport>) -> ReconcileSummary {
        self.reconcile_at(batch, Utc::now().timestamp()).await
    }

    /// Reconcile a batch with an explicit "now" in epoch seconds
    ///
    /// The finalization and retention passes run on every call, including
    /// calls with an empty batch. Store failures are logged and counted; they
    /// never abort the remaining reports.
    pub async fn reconcile_at(&self, batch: Vec<PositionReport>, now: i64) -> ReconcileSummary {
        let start = std::time::Instant::now();
        let mut summary = ReconcileSummary::default();

        match self
            .store
            .finalize_stale(self.settings.staleness_threshold_secs, now)
            .await
        {
            Ok(count) => summary.finalized = count,
            Err(e) => {
                summary.failed += 1;
                error!(error = %e, "Failed to finalize stale trajectories");
            }
        }

        match self
            .store
            .purge_finished_older_than(self.settings.retention_secs, now)
            .await
        {
            Ok(count) => summary.purged = count,
            Err(e) => {
                summary.failed += 1;
                error!(error = %e, "Failed to purge expired trajectories");
            }
        }

        let validated = validate_batch(batch);
        for (report, reason) in &validated.rejected {
            warn!("Rejected report for '{}': {}", report.icao24, reason);
        }
        summary.rejected = validated.rejected.len();

        for report in &validated.accepted {
            match self.process_report(report, now).await {
                Ok(outcome) => summary.record(outcome),
                Err(e) => {
                    summary.failed += 1;
                    error!(
                        icao24 = %report.icao24, request_time = report.request_time, error = %e,
                        "Failed to reconcile position report"
                    );
                }
            }
        }

        record_metrics(&summary);
        match self.store.count_open().await {
            Ok(open) => metrics::gauge!("reconcile.trajectories.open").set(open as f64),
            Err(e) => debug!("Could not count open trajectories: {:#}", e),
        }
        metrics::histogram!("reconcile.duration_ms")
            .record(start.elapsed().as_micros() as f64 / 1000.0);

        info!(
            "Reconciled {} reports: {} created, {} appended, {} conflicts, {} duplicates, {} rejected, {} failed; {} finalized, {} purged",
            validated.accepted.len() + summary.rejected,
            summary.created,
            summary.appended,
            summary.conflicts,
            summary.duplicates,
            summary.rejected,
            summary.failed,
            summary.finalized,
            summary.purged
        );

        summary
    }

    async fn process_report(&self, report: &PositionReport, now: i64) -> Result<ReportOutcome> {
        let open = self.store.find_open(&report.icao24).await?;

        match &open {
            Some(existing) if report.request_time <= existing.last_update => {
                debug!(
                    "Skipping report for {} at {}: trajectory already at {}",
                    report.icao24, report.request_time, existing.last_update
                );
                return Ok(ReportOutcome::Duplicate);
            }
            // A report that would be finalized on arrival is a replay of an old snapshot.
            None if now - report.request_time > self.settings.staleness_threshold_secs => {
                debug!(
                    "Skipping stale report for {} at {}: older than {}s at {}",
                    report.icao24,
                    report.request_time,
                    self.settings.staleness_threshold_secs,
                    now
                );
                return Ok(ReportOutcome::Duplicate);
            }
            _ => {}
        }

        let route = self.resolve_route(report).await;
        let arrival = route.as_ref().and_then(|r| r.arrival_airport.clone());
        let departure = route.and_then(|r| r.departure_airport);

        let Some(existing) = open else {
            let trajectory = Trajectory::open_from_report(report, arrival, departure);
            return if self.store.insert(&trajectory).await? {
                debug!(
                    "Opened trajectory {} for {} at {}",
                    trajectory.id, report.icao24, report.request_time
                );
                Ok(ReportOutcome::Created)
            } else {
                debug!(
                    "Concurrent insert won for {}, dropping report at {}",
                    report.icao24, report.request_time
                );
                Ok(ReportOutcome::Conflict)
            };
        };

        let request = AppendRequest {
            icao24: report.icao24.clone(),
            expected_last_update: existing.last_update,
            waypoint: report.waypoint(),
            new_last_update: report.request_time,
            arrival_airport: arrival,
            departure_airport: departure,
        };

        if self.store.conditional_append(&request).await? {
            debug!(
                "Appended waypoint to trajectory {} ({} -> {})",
                existing.id, existing.last_update, report.request_time
            );
            Ok(ReportOutcome::Appended)
        } else {
            debug!(
                "Version conflict on trajectory {}: expected last_update {}",
                existing.id, existing.last_update
            );
            Ok(ReportOutcome::Conflict)
        }
    }

    /// Route memo entry for the report's callsign; failures count as a miss
    async fn resolve_route(&self, report: &PositionReport) -> Option<RouteEstimate> {
        let callsign = report.normalized_callsign()?;

        match self.route_memo.lookup(&callsign).await {
            Ok(route) => route,
            Err(e) => {
                warn!("Route lookup for {} failed: {:#}", callsign, e);
                None
            }
        }
    }
}

fn record_metrics(summary: &ReconcileSummary) {
    metrics::counter!("reconcile.runs").increment(1);
    metrics::counter!("reconcile.trajectories.created").increment(summary.created as u64);
    metrics::counter!("reconcile.trajectories.appended").increment(summary.appended as u64);
    metrics::counter!("reconcile.trajectories.finalized").increment(summary.finalized as u64);
    metrics::counter!("reconcile.trajectories.purged").increment(summary.purged as u64);
    metrics::counter!("reconcile.reports.conflict").increment(summary.conflicts as u64);
    metrics::counter!("reconcile.reports.duplicate").increment(summary.duplicates as u64);
    metrics::counter!("reconcile.reports.rejected").increment(summary.rejected as u64);
    metrics::counter!("reconcile.reports.failed").increment(summary.failed as u64);
}
