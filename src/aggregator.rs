use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::airport_stats::{Movement, StatIncrement};
use crate::airport_stats_repo::AirportStatsStore;
use crate::trajectories::Trajectory;
use crate::trajectories_repo::TrajectoryStore;

/// When the aggregation watermark is written relative to the counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatermarkCommit {
    /// Write every increment on its own, then the watermark once at the end.
    /// A failure mid-run leaves increments without a watermark, so the retry
    /// counts those trajectories a second time.
    #[default]
    EndOfRun,
    /// Commit the increments of each `last_update` value together with the
    /// watermark advance to that value. Nothing is counted twice.
    PerVersion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregatorSettings {
    pub watermark_commit: WatermarkCommit,
    /// Days of airport stats to keep; 0 keeps everything
    pub stats_retention_days: u32,
}

impl Default for AggregatorSettings {
    fn default() -> Self {
        Self {
            watermark_commit: WatermarkCommit::EndOfRun,
            stats_retention_days: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregationSummary {
    pub previous_watermark: i64,
    pub watermark: i64,
    /// Trajectories scanned past the previous watermark
    pub trajectories: usize,
    /// Counter increments written
    pub increments: usize,
    /// Stats rows removed by the retention sweep
    pub purged_stats: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregationOutcome {
    Completed(AggregationSummary),
    /// Another run of this aggregator was still in progress; nothing was done
    AlreadyRunning,
}

/// Folds trajectories into per-airport daily counters past a watermark
///
/// Trajectories are selected on `last_update` alone, so an aircraft still in
/// flight is counted as soon as it is touched, and counted again when a later
/// append moves it past the watermark.
pub struct StatsAggregator {
    trajectories: Arc<dyn TrajectoryStore>,
    stats: Arc<dyn AirportStatsStore>,
    settings: AggregatorSettings,
    run_guard: Mutex<()>,
}

impl StatsAggregator {
    pub fn new(
        trajectories: Arc<dyn TrajectoryStore>,
        stats: Arc<dyn AirportStatsStore>,
        settings: AggregatorSettings,
    ) -> Self {
        Self {
            trajectories,
            stats,
            settings,
            run_guard: Mutex::new(()),
        }
    }

    pub async fn aggregate(&self) -> Result<AggregationOutcome> {
        self.aggregate_on(Utc::now().date_naive()).await
    }

    /// Run one aggregation pass, using `today` for the stats retention cutoff
    ///
    /// Any store failure aborts the run before the watermark covers the
    /// failed trajectories.
    pub async fn aggregate_on(&self, today: NaiveDate) -> Result<AggregationOutcome> {
        let Ok(_guard) = self.run_guard.try_lock() else {
            warn!("Aggregation already running, skipping this invocation");
            metrics::counter!("aggregate.skipped").increment(1);
            return Ok(AggregationOutcome::AlreadyRunning);
        };

        let start = std::time::Instant::now();
        let result = self.run(today).await;
        metrics::histogram!("aggregate.duration_ms")
            .record(start.elapsed().as_micros() as f64 / 1000.0);

        match result {
            Ok(summary) => {
                metrics::counter!("aggregate.runs").increment(1);
                metrics::counter!("aggregate.trajectories").increment(summary.trajectories as u64);
                metrics::counter!("aggregate.increments").increment(summary.increments as u64);
                metrics::gauge!("aggregate.watermark").set(summary.watermark as f64);

                info!(
                    "Aggregated {} trajectories into {} increments, watermark {} -> {}",
                    summary.trajectories,
                    summary.increments,
                    summary.previous_watermark,
                    summary.watermark
                );
                Ok(AggregationOutcome::Completed(summary))
            }
            Err(e) => {
                metrics::counter!("aggregate.failures").increment(1);
                error!(error = %e, "Aggregation run failed, watermark not advanced past failure");
                Err(e)
            }
        }
    }

    async fn run(&self, today: NaiveDate) -> Result<AggregationSummary> {
        let previous_watermark = self
            .stats
            .get_watermark()
            .await
            .context("Failed to read aggregation watermark")?;

        let trajectories = self
            .trajectories
            .scan_since(previous_watermark)
            .await
            .context("Failed to scan trajectories past watermark")?;

        debug!(
            "Found {} trajectories past watermark {}",
            trajectories.len(),
            previous_watermark
        );

        let mut summary = AggregationSummary {
            previous_watermark,
            watermark: previous_watermark,
            trajectories: trajectories.len(),
            ..Default::default()
        };

        match self.settings.watermark_commit {
            WatermarkCommit::EndOfRun => self.commit_end_of_run(&trajectories, &mut summary).await?,
            WatermarkCommit::PerVersion => {
                self.commit_per_version(&trajectories, &mut summary).await?
            }
        }

        if self.settings.stats_retention_days > 0 {
            summary.purged_stats = self.purge_old_stats(today).await;
        }

        Ok(summary)
    }

    async fn commit_end_of_run(
        &self,
        trajectories: &[Trajectory],
        summary: &mut AggregationSummary,
    ) -> Result<()> {
        let mut max_last_update = summary.previous_watermark;

        for trajectory in trajectories {
            for increment in increments_for(trajectory)? {
                self.stats
                    .upsert_increment(
                        &increment.airport_code,
                        increment.day,
                        increment.movement.is_arrival(),
                    )
                    .await
                    .with_context(|| format!("Failed to count trajectory {}", trajectory.id))?;
                summary.increments += 1;
            }
            max_last_update = max_last_update.max(trajectory.last_update);
        }

        if max_last_update > summary.previous_watermark {
            self.stats.set_watermark(max_last_update).await?;
            summary.watermark = max_last_update;
        }

        Ok(())
    }

    async fn commit_per_version(
        &self,
        trajectories: &[Trajectory],
        summary: &mut AggregationSummary,
    ) -> Result<()> {
        // scan_since orders by last_update, so equal versions are adjacent
        for group in trajectories.chunk_by(|a, b| a.last_update == b.last_update) {
            let version = group[0].last_update;

            let mut increments = Vec::new();
            for trajectory in group {
                increments.extend(increments_for(trajectory)?);
            }

            self.stats
                .commit_group(&increments, version)
                .await
                .with_context(|| format!("Failed to commit stats for last_update {version}"))?;

            summary.increments += increments.len();
            summary.watermark = version;
        }

        Ok(())
    }

    async fn purge_old_stats(&self, today: NaiveDate) -> usize {
        let Some(cutoff) =
            today.checked_sub_days(Days::new(u64::from(self.settings.stats_retention_days)))
        else {
            return 0;
        };

        match self.stats.purge_before(cutoff).await {
            Ok(purged) => {
                if purged > 0 {
                    info!("Removed {} airport stats rows before {}", purged, cutoff);
                }
                purged
            }
            Err(e) => {
                warn!("Failed to purge airport stats before {}: {:#}", cutoff, e);
                0
            }
        }
    }
}

/// Counter increments contributed by one trajectory, on the UTC day of its
/// `last_update`
pub fn increments_for(trajectory: &Trajectory) -> Result<Vec<StatIncrement>> {
    let day = trajectory.last_update_day()?;
    let mut increments = Vec::with_capacity(2);

    if let Some(code) = &trajectory.arrival_airport {
        increments.push(StatIncrement::new(code.as_str(), day, Movement::Arrival));
    }
    if let Some(code) = &trajectory.departure_airport {
        increments.push(StatIncrement::new(code.as_str(), day, Movement::Departure));
    }

    Ok(increments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::PositionReport;

    #[test]
    fn test_increments_for_both_airports() {
        let report = PositionReport::new("a1", Some("DLH4AB"), 500, 10.0, 20.0);
        let trajectory =
            Trajectory::open_from_report(&report, Some("EDDF".into()), Some("LFPG".into()));

        let increments = increments_for(&trajectory).unwrap();
        let day = NaiveDate::from_ymd_opt(1970, 1, 1).unwrap();

        assert_eq!(
            increments,
            vec![
                StatIncrement::new("EDDF", day, Movement::Arrival),
                StatIncrement::new("LFPG", day, Movement::Departure),
            ]
        );
    }

    #[test]
    fn test_increments_for_unresolved_trajectory_is_empty() {
        let report = PositionReport::new("a1", None, 500, 10.0, 20.0);
        let trajectory = Trajectory::open_from_report(&report, None, None);

        assert!(increments_for(&trajectory).unwrap().is_empty());
    }

    #[test]
    fn test_watermark_commit_deserializes_snake_case() {
        #[derive(Deserialize)]
        struct Wrapper {
            mode: WatermarkCommit,
        }

        let parsed: Wrapper = toml::from_str("mode = \"per_version\"").unwrap();
        assert_eq!(parsed.mode, WatermarkCommit::PerVersion);
    }
}
