//! PostgreSQL connection management.
//!
//! Uses `sqlx::PgPool`; the pool size comes from `postgres.max_connections`.
//! Connections are reused across requests.

use anyhow::{Context, Result};
use sqlx::postgres::{PgPool, PgPoolOptions};

use crate::config::PostgresConfig;

/// Create a connection pool to the configured PostgreSQL database.
///
/// # Errors
///
/// Returns an error if the server cannot be reached or rejects the
/// credentials in the connection string.
pub async fn connect(config: &PostgresConfig) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.url)
        .await
        .with_context(|| "Failed to connect to PostgreSQL")?;

    Ok(pool)
}
