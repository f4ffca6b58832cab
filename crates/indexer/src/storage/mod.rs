//! Cache store for the inferwatch indexer.
//!
//! This module provides database operations for:
//! - Participant snapshots (height-exact and latest-for-epoch lookups)
//! - Epoch status (finished epochs and their settlement heights)
//! - Auxiliary records (warm keys, hardware nodes)
//! - Rewards (per participant and per-epoch totals)
//! - Model aggregates
//! - Categorized inference lists
//! - Validator jail status and node health
//! - Completion marks for work that may store no rows
//!
//! Writes are single-row (or single-key) upserts; the sync engine is the only
//! writer.

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use tracing::info;

pub mod auxiliary;
pub mod inference;
pub mod marks;
pub mod model;
pub mod reward;
pub mod snapshot;
pub mod types;
pub mod validator;

pub use types::*;

const DEFAULT_MAX_CONNECTIONS: u32 = 5;
const DEFAULT_MIN_CONNECTIONS: u32 = 1;

/// Current time as stored in `cached_at` columns.
pub(crate) fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Database storage for the indexer.
///
/// Provides async access to a SQLite database with connection pooling.
#[derive(Debug, Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    /// Create a new storage instance with the given database URL.
    ///
    /// The database file is created if it doesn't exist. Pool sizes fall back
    /// to 5 / 1 connections when not given.
    ///
    /// # Example
    /// ```no_run
    /// # use inferwatch_indexer::storage::Storage;
    /// # async fn example() -> anyhow::Result<()> {
    /// let storage = Storage::new("sqlite://inferwatch.db", None, None).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn new(
        database_url: &str,
        max_connections: Option<u32>,
        min_connections: Option<u32>,
    ) -> Result<Self> {
        info!("Connecting to database: {}", database_url);

        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("Invalid database URL: {}", database_url))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS))
            .min_connections(min_connections.unwrap_or(DEFAULT_MIN_CONNECTIONS))
            .connect_with(options)
            .await
            .context("Failed to connect to database")?;

        info!("Database connection established");

        Ok(Self { pool })
    }

    /// Create a new storage instance with a specific file path.
    pub async fn new_with_path<P: AsRef<Path>>(
        path: P,
        max_connections: Option<u32>,
        min_connections: Option<u32>,
    ) -> Result<Self> {
        let database_url = format!("sqlite://{}", path.as_ref().display());
        Self::new(&database_url, max_connections, min_connections).await
    }

    /// Run database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Migrations completed successfully");

        Ok(())
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close the database connection pool.
    pub async fn close(&self) {
        info!("Closing database connection");
        self.pool.close().await;
    }

    async fn count(&self, table: &str) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("Failed to count {}", table))?;
        Ok(count as u64)
    }

    /// Get database statistics.
    pub async fn stats(&self) -> Result<DatabaseStats> {
        Ok(DatabaseStats {
            snapshot_count: self.count("participant_snapshots").await?,
            finished_epoch_count: self.count("epoch_status").await?,
            auxiliary_count: self.count("auxiliary_records").await?,
            reward_count: self.count("participant_rewards").await?,
            reward_total_count: self.count("epoch_reward_totals").await?,
            model_aggregate_count: self.count("model_aggregates").await?,
            inference_row_count: self.count("participant_inferences").await?,
            jail_status_count: self.count("jail_status").await?,
            node_health_count: self.count("node_health").await?,
            latest_epoch: self.latest_cached_epoch().await?,
        })
    }

    /// Check database health.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("Database health check failed")?;

        Ok(())
    }
}

/// Database statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseStats {
    /// Participant snapshot rows
    pub snapshot_count: u64,

    /// Epochs marked finished
    pub finished_epoch_count: u64,

    /// Warm key and hardware node rows
    pub auxiliary_count: u64,

    /// Per-participant reward rows
    pub reward_count: u64,

    /// Cached epoch reward totals
    pub reward_total_count: u64,

    /// Model aggregate rows
    pub model_aggregate_count: u64,

    /// Inference category rows
    pub inference_row_count: u64,

    /// Jail status rows
    pub jail_status_count: u64,

    /// Node health rows
    pub node_health_count: u64,

    /// Highest epoch with cached snapshots
    pub latest_epoch: Option<u64>,
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::Storage;
    use tempfile::NamedTempFile;

    pub async fn setup_storage() -> (Storage, NamedTempFile) {
        let temp_db = NamedTempFile::new().unwrap();
        let storage = Storage::new_with_path(temp_db.path(), None, None)
            .await
            .unwrap();
        storage.run_migrations().await.unwrap();
        (storage, temp_db)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::setup_storage;

    #[tokio::test]
    async fn test_storage_creation() {
        let (storage, _temp_db) = setup_storage().await;
        storage.health_check().await.unwrap();
        storage.close().await;
    }

    #[tokio::test]
    async fn test_database_stats() {
        let (storage, _temp_db) = setup_storage().await;

        let stats = storage.stats().await.unwrap();
        assert_eq!(stats.snapshot_count, 0);
        assert_eq!(stats.auxiliary_count, 0);
        assert_eq!(stats.inference_row_count, 0);
        assert_eq!(stats.latest_epoch, None);

        storage.close().await;
    }
}
