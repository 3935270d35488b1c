mod tasks;

pub use tasks::{NodeAssignment, TaskFilter, TaskUpdate};

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

/// PostgreSQL client for the task repository — the single source of truth
/// for task state.
pub struct TaskStore {
    pool: PgPool,
}

impl TaskStore {
    /// Connect to PostgreSQL and return a client with a connection pool.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        tracing::info!("Connecting to PostgreSQL");

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let store = Self { pool };
        store.health_check().await?;
        tracing::info!("PostgreSQL connection established");

        Ok(store)
    }

    /// Verify the connection is alive.
    pub async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(())
    }

    /// Run database migrations.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        tracing::info!("Running PostgreSQL migrations");

        sqlx::migrate!("src/store/migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Migration(e.to_string()))?;

        tracing::info!("PostgreSQL migrations complete");
        Ok(())
    }

    /// Get a reference to the underlying connection pool.
    #[allow(dead_code)]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("PostgreSQL connection error: {0}")]
    Connection(String),

    #[error("PostgreSQL query error: {0}")]
    Query(String),

    #[error("PostgreSQL migration error: {0}")]
    Migration(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<StoreError> for polyvox_common::PolyvoxError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => polyvox_common::PolyvoxError::NotFound(what),
            other => polyvox_common::PolyvoxError::Postgres(other.to_string()),
        }
    }
}
