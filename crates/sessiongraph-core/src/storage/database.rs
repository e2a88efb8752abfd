//! SQLite connection pool
//!
//! The graph, the job queue and the ingestion log share one database file.
//! Workers, the scheduler and the CLI each open their own pool on it, so the
//! file runs in WAL mode with a busy timeout long enough to ride out another
//! process's write transaction.

use crate::storage::migrations;
use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

const MEMORY_PATH: &str = ":memory:";

/// Where and how to open the database
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub max_connections: u32,
    /// Apply pending migrations on open
    pub auto_migrate: bool,
    pub busy_timeout: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
            max_connections: 5,
            auto_migrate: true,
            busy_timeout: Duration::from_secs(10),
        }
    }
}

impl DatabaseConfig {
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// A private in-memory database; one connection, since every
    /// connection to `:memory:` would see its own empty database
    pub fn in_memory() -> Self {
        Self {
            path: PathBuf::from(MEMORY_PATH),
            max_connections: 1,
            ..Default::default()
        }
    }

    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    pub fn no_migrate(mut self) -> Self {
        self.auto_migrate = false;
        self
    }

    pub fn is_memory(&self) -> bool {
        self.path.as_os_str() == MEMORY_PATH
    }

    fn connect_options(&self) -> Result<SqliteConnectOptions> {
        let options = if self.is_memory() {
            SqliteConnectOptions::from_str("sqlite::memory:")?
        } else {
            SqliteConnectOptions::new()
                .filename(&self.path)
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
        };
        Ok(options
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(self.busy_timeout)
            .foreign_keys(true))
    }
}

/// `<data dir>/sessiongraph/graph.db`, or `./graph.db` without a data dir
pub fn default_database_path() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("sessiongraph").join("graph.db"))
        .unwrap_or_else(|| PathBuf::from("graph.db"))
}

/// An open, migrated database
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
    config: DatabaseConfig,
}

impl Database {
    pub async fn new(config: DatabaseConfig) -> Result<Self> {
        if !config.is_memory() {
            if let Some(parent) = config.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create database directory: {}", parent.display()))?;
            }
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect_with(config.connect_options()?)
            .await
            .with_context(|| format!("Failed to open database: {}", config.path.display()))?;
        debug!(path = %config.path.display(), max_connections = config.max_connections, "Database pool opened");

        let db = Self { pool, config };
        if db.config.auto_migrate {
            db.migrate().await?;
        }
        Ok(db)
    }

    pub async fn in_memory() -> Result<Self> {
        Self::new(DatabaseConfig::in_memory()).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    pub async fn migrate(&self) -> Result<()> {
        migrations::run_migrations(&self.pool)
            .await
            .context("Failed to run database migrations")?;
        debug!(path = %self.path().display(), "Database ready");
        Ok(())
    }

    pub async fn migration_status(&self) -> Result<migrations::MigrationStatus> {
        migrations::migration_status(&self.pool)
            .await
            .context("Failed to check migration status")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_database_is_migrated() {
        let db = Database::in_memory().await.unwrap();
        let status = db.migration_status().await.unwrap();
        assert!(!status.needs_migration);
        assert_eq!(status.current_version, migrations::CURRENT_VERSION);
    }

    #[test]
    fn test_config_builder() {
        let config = DatabaseConfig::with_path("/tmp/graph.db").max_connections(10).no_migrate();
        assert_eq!(config.path, PathBuf::from("/tmp/graph.db"));
        assert_eq!(config.max_connections, 10);
        assert!(!config.auto_migrate);
        assert!(!config.is_memory());
        assert!(DatabaseConfig::in_memory().is_memory());
    }

    #[tokio::test]
    async fn test_foreign_keys_enabled() {
        let db = Database::in_memory().await.unwrap();
        let (enabled,): (i32,) = sqlx::query_as("PRAGMA foreign_keys").fetch_one(db.pool()).await.unwrap();
        assert_eq!(enabled, 1);
    }

    #[tokio::test]
    async fn test_file_database_is_shared_between_pools() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("graph.db");

        let _first = Database::new(DatabaseConfig::with_path(&path)).await.unwrap();
        assert!(path.exists());

        // a second pool sees the migrated schema without re-applying it
        let second = Database::new(DatabaseConfig::with_path(&path)).await.unwrap();
        let status = second.migration_status().await.unwrap();
        assert!(!status.needs_migration);
    }
}
