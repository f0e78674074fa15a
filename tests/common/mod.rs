//! Shared helpers for integration tests
//!
//! `TestDatabase` creates a throwaway PostgreSQL database per test, applies
//! the embedded migrations and drops it again when the value goes out of
//! scope. Tests that need PostgreSQL call [`TestDatabase::from_env`] and
//! return early when `TEST_DATABASE_URL` is unset.

#![allow(dead_code)]

use anyhow::{Context, Result};
use diesel::prelude::*;
use diesel_migrations::MigrationHarness;

use trajectory_tracker::db::{MIGRATIONS, PgPool, build_pool};
use trajectory_tracker::position::PositionReport;

pub struct TestDatabase {
    db_name: String,
    pool: PgPool,
    admin_url: String,
}

impl TestDatabase {
    /// `None` when `TEST_DATABASE_URL` is not set
    pub async fn from_env() -> Option<Self> {
        dotenvy::dotenv().ok();

        let base_url = std::env::var("TEST_DATABASE_URL").ok()?;
        match Self::create(&base_url).await {
            Ok(db) => Some(db),
            Err(e) => panic!("TEST_DATABASE_URL is set but the test database failed: {e:#}"),
        }
    }

    async fn create(base_url: &str) -> Result<Self> {
        let (server_url, query) = split_database_url(base_url)?;
        let db_name = format!("tracker_test_{}", uuid::Uuid::new_v4().simple());
        let admin_url = format!("{server_url}/postgres{query}");
        let test_url = format!("{server_url}/{db_name}{query}");

        let create_admin_url = admin_url.clone();
        let create_db_name = db_name.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = PgConnection::establish(&create_admin_url)
                .context("Failed to connect to PostgreSQL. Is it running?")?;
            // db_name is generated from a UUID, safe to interpolate
            diesel::sql_query(format!("CREATE DATABASE \"{create_db_name}\""))
                .execute(&mut conn)
                .with_context(|| format!("Failed to create database {create_db_name}"))?;
            Ok::<(), anyhow::Error>(())
        })
        .await??;

        let pool = build_pool(&test_url, 8)?;

        let migrate_pool = pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = migrate_pool.get()?;
            conn.run_pending_migrations(MIGRATIONS)
                .map_err(|e| anyhow::anyhow!("Failed to run migrations: {e}"))?;
            Ok::<(), anyhow::Error>(())
        })
        .await??;

        Ok(Self {
            db_name,
            pool,
            admin_url,
        })
    }

    pub fn pool(&self) -> PgPool {
        self.pool.clone()
    }

    pub fn name(&self) -> &str {
        &self.db_name
    }
}

impl Drop for TestDatabase {
    fn drop(&mut self) {
        let admin_url = self.admin_url.clone();
        let db_name = self.db_name.clone();

        // Drop may run inside the test runtime, so use a plain thread
        let cleanup = std::thread::spawn(move || {
            if let Ok(mut conn) = PgConnection::establish(&admin_url) {
                let sql = format!("DROP DATABASE IF EXISTS \"{db_name}\" WITH (FORCE)");
                if let Err(e) = diesel::sql_query(sql).execute(&mut conn) {
                    eprintln!("Warning: failed to drop test database {db_name}: {e}");
                }
            }
        });
        let _ = cleanup.join();
    }
}

/// Split `postgres://user@host:5432/name?opts` into
/// (`postgres://user@host:5432`, `?opts`)
fn split_database_url(url: &str) -> Result<(String, String)> {
    let (without_query, query) = match url.split_once('?') {
        Some((base, query)) => (base, format!("?{query}")),
        None => (url, String::new()),
    };

    let scheme_end = without_query.find("://").map(|i| i + 3).unwrap_or(0);
    let slash = without_query[scheme_end..]
        .rfind('/')
        .map(|i| i + scheme_end)
        .context("TEST_DATABASE_URL must include a database name")?;

    Ok((without_query[..slash].to_string(), query))
}

/// One report for a batch polled at `request_time`
pub fn report(
    icao24: &str,
    callsign: Option<&str>,
    request_time: i64,
    lon: f64,
    lat: f64,
) -> PositionReport {
    PositionReport::new(icao24, callsign, request_time, lon, lat)
}
