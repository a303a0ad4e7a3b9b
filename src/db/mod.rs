//! System of record for installed applications, versions, deployment
//! histories and timelines.
//!
//! All multi-statement contracts take an explicit [`sqlx::Transaction`];
//! per-installed-app write serialization is provided by [`AppLocks`], which
//! the pipeline worker and the delete path hold across their mutations.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite, Transaction};
use tokio::sync::{Mutex, OwnedMutexGuard};

pub(crate) mod chart_groups;
pub(crate) mod chart_repos;
pub(crate) mod history;
pub(crate) mod installed_apps;

pub use chart_groups::ChartGroupDeploymentRow;
pub use chart_repos::ChartRepoRow;
pub use history::StuckAttempt;
pub use installed_apps::{
    ChartVersionRef, Cluster, Environment, InstalledAppListItem, NewInstalledApp, NewVersion,
};

pub type DbPool = Pool<Sqlite>;

#[derive(Clone)]
pub struct Database {
    pool: DbPool,
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self> {
        // Create database file if it doesn't exist
        let db_path = database_url.trim_start_matches("sqlite://");
        if db_path != ":memory:" {
            if let Some(parent) = std::path::Path::new(db_path).parent() {
                std::fs::create_dir_all(parent)?;
            }
            if !std::path::Path::new(db_path).exists() {
                std::fs::File::create(db_path)?;
            }
        }

        // in-memory databases exist per connection, keep a single one
        let max_connections = if db_path == ":memory:" { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>, sqlx::Error> {
        self.pool.begin().await
    }
}

/// Per-installed-app async locks. Serializes version promotions, status
/// updates and delete handling for a single installed app while leaving
/// unrelated apps fully parallel.
#[derive(Clone, Default)]
pub struct AppLocks {
    inner: Arc<Mutex<HashMap<i64, Arc<Mutex<()>>>>>,
}

impl AppLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, installed_app_id: i64) -> OwnedMutexGuard<()> {
        let entry = {
            let mut map = self.inner.lock().await;
            map.entry(installed_app_id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        entry.lock_owned().await
    }
}

#[cfg(test)]
pub(crate) async fn test_database() -> Database {
    // a single connection so the in-memory database is shared
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let db = Database { pool };
    db.run_migrations().await.unwrap();
    db
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_database_connection() {
        let db = test_database().await;
        let result = sqlx::query("SELECT 1").fetch_one(db.pool()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_app_locks_are_per_key() {
        let locks = AppLocks::new();
        let g1 = locks.lock(1).await;
        // a different key must not block
        let _g2 = locks.lock(2).await;
        drop(g1);
        let _g1 = locks.lock(1).await;
    }
}
