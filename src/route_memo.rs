use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::upsert::excluded;
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::db::PgPool;
use crate::position::normalize_callsign;

/// Best-known airports for a callsign, learned from the route history feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteEstimate {
    /// Normalized callsign (trimmed, upper-case)
    pub callsign: String,
    pub arrival_airport: Option<String>,
    pub departure_airport: Option<String>,
}

impl RouteEstimate {
    /// Build an estimate from raw feed values.
    /// Returns `None` when the callsign is blank.
    pub fn from_feed(
        callsign: Option<&str>,
        arrival_airport: Option<&str>,
        departure_airport: Option<&str>,
    ) -> Option<Self> {
        Some(Self {
            callsign: normalize_callsign(callsign)?,
            arrival_airport: normalize_airport(arrival_airport),
            departure_airport: normalize_airport(departure_airport),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.arrival_airport.is_none() && self.departure_airport.is_none()
    }
}

fn normalize_airport(code: Option<&str>) -> Option<String> {
    let trimmed = code?.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_uppercase())
    }
}

/// Read side of the callsign to route memo
#[async_trait]
pub trait RouteMemo: Send + Sync {
    /// Look up the route estimate for a normalized callsign.
    /// A miss is `Ok(None)`, never an error.
    async fn lookup(&self, callsign: &str) -> Result<Option<RouteEstimate>>;
}

/// Write side of the memo, used by the route refresh job
#[async_trait]
pub trait RouteMemoWriter: Send + Sync {
    /// Insert or replace estimates; returns the number of rows written
    async fn upsert_routes(&self, routes: &[RouteEstimate]) -> Result<usize>;
}

/// Diesel model for the route_estimates table
#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = crate::schema::route_estimates)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct RouteEstimateModel {
    pub callsign: String,
    pub arrival_airport: Option<String>,
    pub departure_airport: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl From<RouteEstimateModel> for RouteEstimate {
    fn from(model: RouteEstimateModel) -> Self {
        Self {
            callsign: model.callsign,
            arrival_airport: model.arrival_airport,
            departure_airport: model.departure_airport,
        }
    }
}

impl From<&RouteEstimate> for RouteEstimateModel {
    fn from(route: &RouteEstimate) -> Self {
        Self {
            callsign: route.callsign.clone(),
            arrival_airport: route.arrival_airport.clone(),
            departure_airport: route.departure_airport.clone(),
            updated_at: Utc::now(),
        }
    }
}

#[derive(Clone)]
pub struct RouteEstimatesRepository {
    pool: PgPool,
}

impl RouteEstimatesRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn count(&self) -> Result<i64> {
        use crate::schema::route_estimates::dsl::*;

        let pool = self.pool.clone();

        let count = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            let count = route_estimates.count().get_result::<i64>(&mut conn)?;
            Ok::<i64, anyhow::Error>(count)
        })
        .await??;

        Ok(count)
    }
}

#[async_trait]
impl RouteMemo for RouteEstimatesRepository {
    async fn lookup(&self, callsign_param: &str) -> Result<Option<RouteEstimate>> {
        use crate::schema::route_estimates::dsl::*;

        let pool = self.pool.clone();
        let callsign_val = callsign_param.to_string();

        let model = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;

            let model: Option<RouteEstimateModel> = route_estimates
                .filter(callsign.eq(&callsign_val))
                .select(RouteEstimateModel::as_select())
                .first(&mut conn)
                .optional()
                .with_context(|| format!("Failed to look up route for {callsign_val}"))?;

            Ok::<Option<RouteEstimateModel>, anyhow::Error>(model)
        })
        .await??;

        Ok(model.map(RouteEstimate::from))
    }
}

#[async_trait]
impl RouteMemoWriter for RouteEstimatesRepository {
    async fn upsert_routes(&self, routes: &[RouteEstimate]) -> Result<usize> {
        use crate::schema::route_estimates::dsl::*;

        if routes.is_empty() {
            return Ok(0);
        }

        // Postgres refuses ON CONFLICT DO UPDATE touching the same row twice
        // in one statement, so keep only the last estimate per callsign
        let mut deduped: std::collections::HashMap<&str, &RouteEstimate> =
            std::collections::HashMap::new();
        for route in routes {
            deduped.insert(route.callsign.as_str(), route);
        }
        let models: Vec<RouteEstimateModel> =
            deduped.into_values().map(RouteEstimateModel::from).collect();

        let pool = self.pool.clone();

        let rows = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;

            let mut total = 0;
            for chunk in models.chunks(1000) {
                total += diesel::insert_into(route_estimates)
                    .values(chunk)
                    .on_conflict(callsign)
                    .do_update()
                    .set((
                        arrival_airport.eq(excluded(arrival_airport)),
                        departure_airport.eq(excluded(departure_airport)),
                        updated_at.eq(excluded(updated_at)),
                    ))
                    .execute(&mut conn)
                    .context("Failed to upsert route estimates")?;
            }

            Ok::<usize, anyhow::Error>(total)
        })
        .await??;

        debug!("Upserted {} route estimates", rows);
        Ok(rows)
    }
}

/// Read-through cache in front of a [`RouteMemo`]
///
/// Lookups that fail or exceed the timeout degrade to "unresolved" and are
/// not cached, so a later cycle can still backfill the airports.
pub struct CachedRouteMemo {
    inner: Arc<dyn RouteMemo>,
    cache: Cache<String, Option<RouteEstimate>>,
    lookup_timeout: Duration,
}

impl CachedRouteMemo {
    pub fn new(inner: Arc<dyn RouteMemo>, ttl: Duration, lookup_timeout: Duration) -> Self {
        Self {
            inner,
            cache: Cache::builder()
                .max_capacity(50_000)
                .time_to_live(ttl)
                .build(),
            lookup_timeout,
        }
    }

    /// Drop all cached entries, e.g. after a route refresh
    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }
}

#[async_trait]
impl RouteMemo for CachedRouteMemo {
    async fn lookup(&self, callsign: &str) -> Result<Option<RouteEstimate>> {
        if let Some(cached) = self.cache.get(callsign).await {
            metrics::counter!("route_memo.cache.hit").increment(1);
            return Ok(cached);
        }
        metrics::counter!("route_memo.cache.miss").increment(1);

        match tokio::time::timeout(self.lookup_timeout, self.inner.lookup(callsign)).await {
            Ok(Ok(estimate)) => {
                self.cache
                    .insert(callsign.to_string(), estimate.clone())
                    .await;
                Ok(estimate)
            }
            Ok(Err(e)) => {
                metrics::counter!("route_memo.lookup.failed").increment(1);
                warn!("Route lookup for {} failed: {:#}", callsign, e);
                Ok(None)
            }
            Err(_) => {
                metrics::counter!("route_memo.lookup.timeout").increment(1);
                warn!(
                    "Route lookup for {} timed out after {:?}",
                    callsign, self.lookup_timeout
                );
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::InMemoryRouteMemo;

    #[test]
    fn test_from_feed_normalizes() {
        let route = RouteEstimate::from_feed(Some(" dlh4ab "), Some("eddf"), Some(" "))
            .expect("callsign should be accepted");

        assert_eq!(route.callsign, "DLH4AB");
        assert_eq!(route.arrival_airport.as_deref(), Some("EDDF"));
        assert_eq!(route.departure_airport, None);
    }

    #[test]
    fn test_from_feed_rejects_blank_callsign() {
        assert!(RouteEstimate::from_feed(Some("   "), Some("EDDF"), None).is_none());
        assert!(RouteEstimate::from_feed(None, Some("EDDF"), None).is_none());
    }

    #[tokio::test]
    async fn test_cached_memo_serves_repeated_lookups_from_cache() {
        let inner = Arc::new(InMemoryRouteMemo::new());
        inner.insert(RouteEstimate {
            callsign: "DLH4AB".to_string(),
            arrival_airport: Some("EDDF".to_string()),
            departure_airport: Some("LFPG".to_string()),
        });

        let memo = CachedRouteMemo::new(
            inner.clone(),
            Duration::from_secs(60),
            Duration::from_millis(100),
        );

        let first = memo.lookup("DLH4AB").await.unwrap();
        let second = memo.lookup("DLH4AB").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(inner.lookup_count(), 1);
    }

    #[tokio::test]
    async fn test_cached_memo_degrades_failure_to_unresolved() {
        let inner = Arc::new(InMemoryRouteMemo::new());
        inner.set_failing(true);

        let memo = CachedRouteMemo::new(
            inner.clone(),
            Duration::from_secs(60),
            Duration::from_millis(100),
        );

        assert_eq!(memo.lookup("DLH4AB").await.unwrap(), None);

        // Failures are not cached
        inner.set_failing(false);
        inner.insert(RouteEstimate {
            callsign: "DLH4AB".to_string(),
            arrival_airport: Some("EDDF".to_string()),
            departure_airport: None,
        });
        let resolved = memo.lookup("DLH4AB").await.unwrap();
        assert_eq!(
            resolved.and_then(|r| r.arrival_airport).as_deref(),
            Some("EDDF")
        );
    }
}
