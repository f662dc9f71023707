//! SQLite persistence for devices and borrowers.

pub mod models;
pub mod repository;

use std::str::FromStr;
use std::time::Duration;

use log::{debug, info};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tokio::sync::RwLock;

use crate::config::DatabaseConfig;
use crate::error::RepositoryError;

pub use models::Device;
pub use repository::{BorrowRepository, SqliteRepository};

const DEFAULT_MAX_CONNECTIONS: u32 = 4;

/// Connection pool that can be rebuilt in place when it goes stale.
#[derive(Debug)]
pub struct Database {
    pool: RwLock<SqlitePool>,
    options: SqliteConnectOptions,
    max_connections: u32,
    in_memory: bool,
}

impl Database {
    pub async fn open(config: &DatabaseConfig) -> Result<Self, RepositoryError> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", config.path))
            .map_err(|e| RepositoryError::Configuration(format!("invalid database path: {e}")))?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(10));

        let max_connections = config.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS);
        let pool = connect(&options, max_connections).await?;

        let db = Database {
            pool: RwLock::new(pool),
            options,
            max_connections,
            in_memory: false,
        };
        db.migrate().await?;
        info!("Opened database {}", config.path);
        Ok(db)
    }

    /// Single-connection in-memory database.
    #[cfg(test)]
    pub async fn in_memory() -> Result<Self, RepositoryError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options.clone())
            .await?;

        let db = Database {
            pool: RwLock::new(pool),
            options,
            max_connections: 1,
            in_memory: true,
        };
        db.migrate().await?;
        Ok(db)
    }

    pub async fn migrate(&self) -> Result<(), RepositoryError> {
        sqlx::migrate!("./migrations").run(&self.pool().await).await?;
        Ok(())
    }

    pub async fn pool(&self) -> SqlitePool {
        self.pool.read().await.clone()
    }

    /// Replaces the pool with freshly opened connections.
    ///
    /// An in-memory database only lives as long as its connection, so for
    /// those this just checks the existing one.
    pub async fn refresh(&self) -> Result<(), RepositoryError> {
        if self.in_memory {
            debug!("In-memory database, keeping current connection");
            return self.health_check().await;
        }

        let fresh = connect(&self.options, self.max_connections).await?;
        let stale = std::mem::replace(&mut *self.pool.write().await, fresh);
        stale.close().await;
        debug!("Database connection refreshed");
        Ok(())
    }

    pub async fn health_check(&self) -> Result<(), RepositoryError> {
        sqlx::query("SELECT 1").execute(&self.pool().await).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.read().await.close().await;
    }
}

async fn connect(
    options: &SqliteConnectOptions,
    max_connections: u32,
) -> Result<SqlitePool, RepositoryError> {
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(30))
        .connect_with(options.clone())
        .await?;
    Ok(pool)
}
