//! Shared coordination state for the orchestration layer.
//!
//! All state that workers and submitters coordinate through lives behind
//! the traits in [`store`]: the Job State Store, the idempotency table, the
//! rate-limit counters, the work queue and the live-worker registry. Two
//! implementations are provided:
//!
//! - [`memory`]: process-local, for tests and single-process deployments.
//! - [`repositories`]: PostgreSQL via `sqlx`, for multi-process
//!   deployments. Every cross-writer operation is a single-row conditional
//!   `UPDATE`/`INSERT ... ON CONFLICT` or a row-locked transaction.

pub mod error;
pub mod memory;
pub mod models;
pub mod repositories;
pub mod store;

use sqlx::postgres::PgPoolOptions;

pub use error::StoreError;
pub use store::{
    Delivery, HeartbeatAck, IdempotencyStore, JobStore, RateLimitStore, StatusCounts, Stores,
    WorkQueue, WorkerRegistry,
};

pub type DbPool = sqlx::PgPool;

/// Create a connection pool from a database URL.
pub async fn create_pool(database_url: &str) -> Result<DbPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(20)
        .connect(database_url)
        .await
}

/// Verify the database answers a trivial query.
pub async fn health_check(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

/// Apply the embedded schema migrations.
pub async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}
