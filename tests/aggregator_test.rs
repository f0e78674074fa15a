//! Aggregator behaviour against the in-memory stores

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::NaiveDate;
use tokio::sync::Notify;

use common::report;
use trajectory_tracker::aggregator::{
    AggregationOutcome, AggregationSummary, AggregatorSettings, StatsAggregator, WatermarkCommit,
};
use trajectory_tracker::airport_stats::{AirportDailyStats, StatIncrement};
use trajectory_tracker::airport_stats_repo::AirportStatsStore;
use trajectory_tracker::memory_store::{InMemoryAirportStatsStore, InMemoryTrajectoryStore};
use trajectory_tracker::position::Waypoint;
use trajectory_tracker::trajectories::Trajectory;
use trajectory_tracker::trajectories_repo::{AppendRequest, TrajectoryStore};

fn epoch_day() -> NaiveDate {
    NaiveDate::from_ymd_opt(1970, 1, 1).unwrap()
}

fn trajectory(
    icao24: &str,
    last_update: i64,
    arrival: Option<&str>,
    departure: Option<&str>,
    finished: bool,
) -> Trajectory {
    let mut trajectory = Trajectory::open_from_report(
        &report(icao24, None, last_update, 10.0, 20.0),
        arrival.map(str::to_string),
        departure.map(str::to_string),
    );
    if finished {
        trajectory.finalize(last_update + 1800);
    }
    trajectory
}

fn settings(watermark_commit: WatermarkCommit) -> AggregatorSettings {
    AggregatorSettings {
        watermark_commit,
        stats_retention_days: 0,
    }
}

fn completed(outcome: AggregationOutcome) -> AggregationSummary {
    match outcome {
        AggregationOutcome::Completed(summary) => summary,
        AggregationOutcome::AlreadyRunning => panic!("aggregation unexpectedly skipped"),
    }
}

async fn counts(stats: &dyn AirportStatsStore, airport: &str) -> (i64, i64) {
    stats
        .get_stats(airport, epoch_day())
        .await
        .unwrap()
        .map(|s| (s.arrival_count, s.departure_count))
        .unwrap_or((0, 0))
}

#[tokio::test]
async fn test_finished_arrival_counted_once() {
    let trajectories = Arc::new(InMemoryTrajectoryStore::new());
    let stats = Arc::new(InMemoryAirportStatsStore::new());
    trajectories
        .seed(trajectory("a1", 500, Some("EDDF"), None, true))
        .await;

    let aggregator = StatsAggregator::new(
        trajectories.clone(),
        stats.clone(),
        AggregatorSettings::default(),
    );

    let summary = completed(aggregator.aggregate_on(epoch_day()).await.unwrap());
    assert_eq!(summary.previous_watermark, 0);
    assert_eq!(summary.watermark, 500);
    assert_eq!(summary.increments, 1);
    assert_eq!(
        stats.get_stats("EDDF", epoch_day()).await.unwrap(),
        Some(AirportDailyStats {
            airport_code: "EDDF".to_string(),
            day: epoch_day(),
            arrival_count: 1,
            departure_count: 0,
        })
    );

    let summary = completed(aggregator.aggregate_on(epoch_day()).await.unwrap());
    assert_eq!(summary.trajectories, 0);
    assert_eq!(summary.watermark, 500);
    assert_eq!(counts(stats.as_ref(), "EDDF").await, (1, 0));
}

#[tokio::test]
async fn test_second_run_without_new_trajectories_changes_nothing() {
    for mode in [WatermarkCommit::EndOfRun, WatermarkCommit::PerVersion] {
        let trajectories = Arc::new(InMemoryTrajectoryStore::new());
        let stats = Arc::new(InMemoryAirportStatsStore::new());
        trajectories
            .seed(trajectory("a1", 300, Some("EDDF"), Some("LFPG"), true))
            .await;
        trajectories
            .seed(trajectory("b2", 400, Some("LFPG"), Some("EGLL"), true))
            .await;
        trajectories
            .seed(trajectory("c3", 400, None, Some("EDDF"), false))
            .await;

        let aggregator = StatsAggregator::new(trajectories.clone(), stats.clone(), settings(mode));

        let first = completed(aggregator.aggregate_on(epoch_day()).await.unwrap());
        assert_eq!(first.trajectories, 3, "{mode:?}");
        assert_eq!(first.increments, 5, "{mode:?}");
        assert_eq!(first.watermark, 400, "{mode:?}");
        let after_first = stats.all_stats().await;

        let second = completed(aggregator.aggregate_on(epoch_day()).await.unwrap());
        assert_eq!(second.trajectories, 0, "{mode:?}");
        assert_eq!(stats.all_stats().await, after_first, "{mode:?}");
        assert_eq!(stats.get_watermark().await.unwrap(), 400, "{mode:?}");

        assert_eq!(counts(stats.as_ref(), "EDDF").await, (1, 1), "{mode:?}");
        assert_eq!(counts(stats.as_ref(), "LFPG").await, (1, 1), "{mode:?}");
        assert_eq!(counts(stats.as_ref(), "EGLL").await, (0, 1), "{mode:?}");
    }
}

/// Fails the Nth write (single increment or group commit), once
struct FaultyStatsStore {
    inner: InMemoryAirportStatsStore,
    writes: AtomicUsize,
    fail_on_write: usize,
}

impl FaultyStatsStore {
    fn new(fail_on_write: usize) -> Self {
        Self {
            inner: InMemoryAirportStatsStore::new(),
            writes: AtomicUsize::new(0),
            fail_on_write,
        }
    }

    fn check_write(&self) -> Result<()> {
        let write = self.writes.fetch_add(1, Ordering::SeqCst) + 1;
        if write == self.fail_on_write {
            bail!("stats store write {write} failed");
        }
        Ok(())
    }
}

#[async_trait]
impl AirportStatsStore for FaultyStatsStore {
    async fn upsert_increment(
        &self,
        airport_code: &str,
        day: NaiveDate,
        is_arrival: bool,
    ) -> Result<()> {
        self.check_write()?;
        self.inner.upsert_increment(airport_code, day, is_arrival).await
    }

    async fn get_watermark(&self) -> Result<i64> {
        self.inner.get_watermark().await
    }

    async fn set_watermark(&self, watermark: i64) -> Result<()> {
        self.inner.set_watermark(watermark).await
    }

    async fn commit_group(&self, increments: &[StatIncrement], watermark: i64) -> Result<()> {
        self.check_write()?;
        self.inner.commit_group(increments, watermark).await
    }

    async fn get_stats(
        &self,
        airport_code: &str,
        day: NaiveDate,
    ) -> Result<Option<AirportDailyStats>> {
        self.inner.get_stats(airport_code, day).await
    }

    async fn purge_before(&self, cutoff: NaiveDate) -> Result<usize> {
        self.inner.purge_before(cutoff).await
    }
}

async fn two_arrivals() -> Arc<InMemoryTrajectoryStore> {
    let trajectories = Arc::new(InMemoryTrajectoryStore::new());
    trajectories
        .seed(trajectory("a1", 500, Some("EDDF"), None, true))
        .await;
    trajectories
        .seed(trajectory("b2", 600, Some("LFPG"), None, true))
        .await;
    trajectories
}

#[tokio::test]
async fn test_end_of_run_retry_double_counts_partially_written_run() {
    let trajectories = two_arrivals().await;
    let stats = Arc::new(FaultyStatsStore::new(2));
    let aggregator = StatsAggregator::new(
        trajectories,
        stats.clone(),
        settings(WatermarkCommit::EndOfRun),
    );

    assert!(aggregator.aggregate_on(epoch_day()).await.is_err());
    assert_eq!(stats.get_watermark().await.unwrap(), 0);
    assert_eq!(counts(stats.as_ref(), "EDDF").await, (1, 0));

    let summary = completed(aggregator.aggregate_on(epoch_day()).await.unwrap());
    assert_eq!(summary.watermark, 600);

    // EDDF was written by the failed run and again by the retry
    assert_eq!(counts(stats.as_ref(), "EDDF").await, (2, 0));
    assert_eq!(counts(stats.as_ref(), "LFPG").await, (1, 0));
}

#[tokio::test]
async fn test_per_version_retry_counts_each_trajectory_once() {
    let trajectories = two_arrivals().await;
    let stats = Arc::new(FaultyStatsStore::new(2));
    let aggregator = StatsAggregator::new(
        trajectories,
        stats.clone(),
        settings(WatermarkCommit::PerVersion),
    );

    assert!(aggregator.aggregate_on(epoch_day()).await.is_err());
    assert_eq!(stats.get_watermark().await.unwrap(), 500);
    assert_eq!(counts(stats.as_ref(), "EDDF").await, (1, 0));
    assert_eq!(counts(stats.as_ref(), "LFPG").await, (0, 0));

    let summary = completed(aggregator.aggregate_on(epoch_day()).await.unwrap());
    assert_eq!(summary.previous_watermark, 500);
    assert_eq!(summary.trajectories, 1);
    assert_eq!(summary.watermark, 600);

    assert_eq!(counts(stats.as_ref(), "EDDF").await, (1, 0));
    assert_eq!(counts(stats.as_ref(), "LFPG").await, (1, 0));
}

#[tokio::test]
async fn test_open_trajectory_counted_again_after_each_touch() {
    let trajectories = Arc::new(InMemoryTrajectoryStore::new());
    let stats = Arc::new(InMemoryAirportStatsStore::new());
    trajectories
        .insert(&trajectory("a1", 100, None, Some("LFPG"), false))
        .await
        .unwrap();

    let aggregator = StatsAggregator::new(
        trajectories.clone(),
        stats.clone(),
        settings(WatermarkCommit::EndOfRun),
    );

    completed(aggregator.aggregate_on(epoch_day()).await.unwrap());
    assert_eq!(counts(stats.as_ref(), "LFPG").await, (0, 1));

    let applied = trajectories
        .conditional_append(&AppendRequest {
            icao24: "a1".to_string(),
            expected_last_update: 100,
            waypoint: Waypoint::new(11.0, 21.0),
            new_last_update: 200,
            arrival_airport: None,
            departure_airport: None,
        })
        .await
        .unwrap();
    assert!(applied);

    let summary = completed(aggregator.aggregate_on(epoch_day()).await.unwrap());
    assert_eq!(summary.trajectories, 1);
    assert_eq!(counts(stats.as_ref(), "LFPG").await, (0, 2));
}

/// Parks `get_watermark` until released so a run can be held in flight
struct GatedStatsStore {
    inner: InMemoryAirportStatsStore,
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl AirportStatsStore for GatedStatsStore {
    async fn upsert_increment(
        &self,
        airport_code: &str,
        day: NaiveDate,
        is_arrival: bool,
    ) -> Result<()> {
        self.inner.upsert_increment(airport_code, day, is_arrival).await
    }

    async fn get_watermark(&self) -> Result<i64> {
        self.entered.notify_one();
        self.release.notified().await;
        self.inner.get_watermark().await
    }

    async fn set_watermark(&self, watermark: i64) -> Result<()> {
        self.inner.set_watermark(watermark).await
    }

    async fn get_stats(
        &self,
        airport_code: &str,
        day: NaiveDate,
    ) -> Result<Option<AirportDailyStats>> {
        self.inner.get_stats(airport_code, day).await
    }

    async fn purge_before(&self, cutoff: NaiveDate) -> Result<usize> {
        self.inner.purge_before(cutoff).await
    }
}

#[tokio::test]
async fn test_overlapping_aggregate_is_skipped() {
    let stats = Arc::new(GatedStatsStore {
        inner: InMemoryAirportStatsStore::new(),
        entered: Notify::new(),
        release: Notify::new(),
    });
    let aggregator = Arc::new(StatsAggregator::new(
        two_arrivals().await,
        stats.clone(),
        settings(WatermarkCommit::EndOfRun),
    ));

    let running = tokio::spawn({
        let aggregator = aggregator.clone();
        async move { aggregator.aggregate_on(epoch_day()).await }
    });
    stats.entered.notified().await;

    let overlapping = aggregator.aggregate_on(epoch_day()).await.unwrap();
    assert_eq!(overlapping, AggregationOutcome::AlreadyRunning);

    stats.release.notify_one();
    let summary = completed(running.await.unwrap().unwrap());
    assert_eq!(summary.watermark, 600);
    assert_eq!(counts(&stats.inner, "EDDF").await, (1, 0));
}

#[tokio::test]
async fn test_stats_retention_removes_old_days() {
    let day = |m, d| NaiveDate::from_ymd_opt(2024, m, d).unwrap();
    let stats = Arc::new(InMemoryAirportStatsStore::new());
    stats.upsert_increment("EDDF", day(1, 1), true).await.unwrap();
    stats.upsert_increment("EDDF", day(1, 31), true).await.unwrap();
    stats.upsert_increment("EDDF", day(2, 15), false).await.unwrap();

    let aggregator = StatsAggregator::new(
        Arc::new(InMemoryTrajectoryStore::new()),
        stats.clone(),
        AggregatorSettings {
            watermark_commit: WatermarkCommit::EndOfRun,
            stats_retention_days: 30,
        },
    );

    let summary = completed(aggregator.aggregate_on(day(3, 1)).await.unwrap());

    // Cutoff is 2024-01-31, which is kept
    assert_eq!(summary.purged_stats, 1);
    let remaining: Vec<NaiveDate> = stats.all_stats().await.iter().map(|s| s.day).collect();
    assert_eq!(remaining, vec![day(1, 31), day(2, 15)]);
}
