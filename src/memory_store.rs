//! In-process implementations of the store traits
//!
//! Each store keeps the invariants of its diesel counterpart: one open
//! trajectory per aircraft, version-checked appends and atomic group commits.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::airport_stats::{AirportDailyStats, Movement, StatIncrement};
use crate::airport_stats_repo::AirportStatsStore;
use crate::position::PositionReport;
use crate::route_memo::{RouteEstimate, RouteMemo, RouteMemoWriter};
use crate::snapshot::SnapshotSource;
use crate::trajectories::Trajectory;
use crate::trajectories_repo::{AppendRequest, TrajectoryStore};

#[derive(Default)]
pub struct InMemoryTrajectoryStore {
    trajectories: Mutex<Vec<Trajectory>>,
}

impl InMemoryTrajectoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a trajectory as-is, bypassing the open-trajectory check
    pub async fn seed(&self, trajectory: Trajectory) {
        self.trajectories.lock().await.push(trajectory);
    }

    /// Every stored trajectory of an aircraft, oldest first
    pub async fn for_aircraft(&self, icao24: &str) -> Vec<Trajectory> {
        let trajectories = self.trajectories.lock().await;
        let mut found: Vec<Trajectory> = trajectories
            .iter()
            .filter(|t| t.icao24 == icao24)
            .cloned()
            .collect();
        found.sort_by_key(|t| (t.created_at, t.last_update));
        found
    }

    pub async fn all(&self) -> Vec<Trajectory> {
        self.trajectories.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.trajectories.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.trajectories.lock().await.is_empty()
    }
}

#[async_trait]
impl TrajectoryStore for InMemoryTrajectoryStore {
    async fn find_open(&self, icao24: &str) -> Result<Option<Trajectory>> {
        let trajectories = self.trajectories.lock().await;
        Ok(trajectories
            .iter()
            .find(|t| t.icao24 == icao24 && t.is_open())
            .cloned())
    }

    async fn insert(&self, trajectory: &Trajectory) -> Result<bool> {
        let mut trajectories = self.trajectories.lock().await;

        if trajectory.is_open()
            && trajectories
                .iter()
                .any(|t| t.icao24 == trajectory.icao24 && t.is_open())
        {
            return Ok(false);
        }

        trajectories.push(trajectory.clone());
        Ok(true)
    }

    async fn conditional_append(&self, request: &AppendRequest) -> Result<bool> {
        let mut trajectories = self.trajectories.lock().await;

        let Some(trajectory) = trajectories.iter_mut().find(|t| {
            t.icao24 == request.icao24
                && t.is_open()
                && t.last_update == request.expected_last_update
        }) else {
            return Ok(false);
        };

        trajectory.apply_append(
            request.waypoint,
            request.new_last_update,
            request.arrival_airport.as_deref(),
            request.departure_airport.as_deref(),
        );
        Ok(true)
    }

    async fn finalize_stale(&self, threshold_secs: i64, now: i64) -> Result<usize> {
        let mut trajectories = self.trajectories.lock().await;
        let mut finalized = 0;
        for trajectory in trajectories.iter_mut() {
            if trajectory.is_stale(now, threshold_secs) {
                trajectory.finalize(now);
                finalized += 1;
            }
        }
        Ok(finalized)
    }

    async fn purge_finished_older_than(&self, retention_secs: i64, now: i64) -> Result<usize> {
        let mut trajectories = self.trajectories.lock().await;
        let before = trajectories.len();
        trajectories.retain(|t| !t.is_expired(now, retention_secs));
        Ok(before - trajectories.len())
    }

    async fn scan_since(&self, lower_bound: i64) -> Result<Vec<Trajectory>> {
        let trajectories = self.trajectories.lock().await;
        let mut found: Vec<Trajectory> = trajectories
            .iter()
            .filter(|t| t.last_update > lower_bound)
            .cloned()
            .collect();
        found.sort_by_key(|t| (t.last_update, t.id));
        Ok(found)
    }

    async fn count_open(&self) -> Result<i64> {
        let trajectories = self.trajectories.lock().await;
        Ok(trajectories.iter().filter(|t| t.is_open()).count() as i64)
    }
}

#[derive(Default)]
struct StatsState {
    stats: BTreeMap<(String, NaiveDate), AirportDailyStats>,
    watermark: i64,
}

impl StatsState {
    fn apply(&mut self, increment: &StatIncrement) {
        self.stats
            .entry((increment.airport_code.clone(), increment.day))
            .and_modify(|stats| stats.apply(increment.movement))
            .or_insert_with(|| AirportDailyStats::first_contribution(increment));
    }

    fn advance_watermark(&mut self, watermark: i64) {
        self.watermark = self.watermark.max(watermark);
    }
}

#[derive(Default)]
pub struct InMemoryAirportStatsStore {
    state: Mutex<StatsState>,
}

impl InMemoryAirportStatsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All counters ordered by (airport, day)
    pub async fn all_stats(&self) -> Vec<AirportDailyStats> {
        self.state.lock().await.stats.values().cloned().collect()
    }
}

#[async_trait]
impl AirportStatsStore for InMemoryAirportStatsStore {
    async fn upsert_increment(
        &self,
        airport_code: &str,
        day: NaiveDate,
        is_arrival: bool,
    ) -> Result<()> {
        let movement = Movement::from_is_arrival(is_arrival);
        self.state
            .lock()
            .await
            .apply(&StatIncrement::new(airport_code, day, movement));
        Ok(())
    }

    async fn get_watermark(&self) -> Result<i64> {
        Ok(self.state.lock().await.watermark)
    }

    async fn set_watermark(&self, watermark: i64) -> Result<()> {
        self.state.lock().await.advance_watermark(watermark);
        Ok(())
    }

    async fn commit_group(&self, increments: &[StatIncrement], watermark: i64) -> Result<()> {
        let mut state = self.state.lock().await;
        for increment in increments {
            state.apply(increment);
        }
        state.advance_watermark(watermark);
        Ok(())
    }

    async fn get_stats(&self, airport_code: &str, day: NaiveDate) -> Result<Option<AirportDailyStats>> {
        let state = self.state.lock().await;
        Ok(state.stats.get(&(airport_code.to_string(), day)).cloned())
    }

    async fn purge_before(&self, cutoff: NaiveDate) -> Result<usize> {
        let mut state = self.state.lock().await;
        let before = state.stats.len();
        state.stats.retain(|(_, day), _| *day >= cutoff);
        Ok(before - state.stats.len())
    }
}

/// Route memo backed by a concurrent map, with switchable failure mode
#[derive(Default)]
pub struct InMemoryRouteMemo {
    routes: DashMap<String, RouteEstimate>,
    lookups: AtomicUsize,
    failing: AtomicBool,
}

impl InMemoryRouteMemo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, route: RouteEstimate) {
        self.routes.insert(route.callsign.clone(), route);
    }

    /// Number of lookups that reached this memo
    pub fn lookup_count(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    /// Make every subsequent lookup return an error
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[async_trait]
impl RouteMemo for InMemoryRouteMemo {
    async fn lookup(&self, callsign: &str) -> Result<Option<RouteEstimate>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            bail!("route memo unavailable");
        }
        Ok(self.routes.get(callsign).map(|entry| entry.value().clone()))
    }
}

#[async_trait]
impl RouteMemoWriter for InMemoryRouteMemo {
    async fn upsert_routes(&self, routes: &[RouteEstimate]) -> Result<usize> {
        let mut latest: HashMap<&str, &RouteEstimate> = HashMap::new();
        for route in routes {
            latest.insert(route.callsign.as_str(), route);
        }
        let written = latest.len();
        for route in latest.into_values() {
            self.insert(route.clone());
        }
        Ok(written)
    }
}

/// Snapshot source returning a fixed batch until replaced
#[derive(Default)]
pub struct StaticSnapshotSource {
    batch: Mutex<Vec<PositionReport>>,
}

impl StaticSnapshotSource {
    pub fn new(batch: Vec<PositionReport>) -> Self {
        Self {
            batch: Mutex::new(batch),
        }
    }

    pub async fn replace(&self, batch: Vec<PositionReport>) {
        *self.batch.lock().await = batch;
    }
}

#[async_trait]
impl SnapshotSource for StaticSnapshotSource {
    async fn fetch_current_batch(&self) -> Result<Vec<PositionReport>> {
        Ok(self.batch.lock().await.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::Waypoint;

    fn open(icao24: &str, last_update: i64) -> Trajectory {
        let report = PositionReport::new(icao24, None, last_update, 10.0, 20.0);
        Trajectory::open_from_report(&report, None, None)
    }

    #[tokio::test]
    async fn test_insert_refuses_second_open_trajectory() {
        let store = InMemoryTrajectoryStore::new();

        assert!(store.insert(&open("a1", 100)).await.unwrap());
        assert!(!store.insert(&open("a1", 105)).await.unwrap());
        assert_eq!(store.count_open().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_conditional_append_checks_version() {
        let store = InMemoryTrajectoryStore::new();
        store.insert(&open("a1", 100)).await.unwrap();

        let stale = AppendRequest {
            icao24: "a1".to_string(),
            expected_last_update: 99,
            waypoint: Waypoint::new(11.0, 21.0),
            new_last_update: 105,
            arrival_airport: None,
            departure_airport: None,
        };
        assert!(!store.conditional_append(&stale).await.unwrap());

        let current = AppendRequest {
            expected_last_update: 100,
            ..stale
        };
        assert!(store.conditional_append(&current).await.unwrap());

        let stored = store.find_open("a1").await.unwrap().unwrap();
        assert_eq!(stored.path.len(), 2);
        assert_eq!(stored.last_update, 105);
    }

    #[tokio::test]
    async fn test_commit_group_advances_watermark_monotonically() {
        let store = InMemoryAirportStatsStore::new();
        let day = NaiveDate::from_ymd_opt(2025, 3, 1).unwrap();

        store
            .commit_group(&[StatIncrement::new("EDDF", day, Movement::Arrival)], 500)
            .await
            .unwrap();
        store.set_watermark(400).await.unwrap();

        assert_eq!(store.get_watermark().await.unwrap(), 500);
        let stats = store.get_stats("EDDF", day).await.unwrap().unwrap();
        assert_eq!((stats.arrival_count, stats.departure_count), (1, 0));
    }

    #[tokio::test]
    async fn test_purge_before_keeps_cutoff_day() {
        let store = InMemoryAirportStatsStore::new();
        let old = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
        let cutoff = NaiveDate::from_ymd_opt(2025, 2, 1).unwrap();

        store.upsert_increment("EDDF", old, true).await.unwrap();
        store.upsert_increment("EDDF", cutoff, false).await.unwrap();

        assert_eq!(store.purge_before(cutoff).await.unwrap(), 1);
        assert_eq!(store.all_stats().await.len(), 1);
    }
}
