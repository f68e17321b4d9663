use anyhow::{Context, Result};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{debug, info};

/// Connection pool shared by the analysis stores and the conversation reader.
pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<PgPool> {
    let max_connections = max_connections.max(2);

    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .min_connections(1)
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Some(Duration::from_secs(300))) // 5 minutes
        .max_lifetime(Some(Duration::from_secs(3600))) // 1 hour
        .test_before_acquire(true)
        .connect(database_url)
        .await
        .context("Failed to connect to database")?;

    info!(
        "Database connection pool created with {} max connections",
        max_connections
    );
    Ok(pool)
}

pub async fn health_check(pool: &PgPool) -> Result<bool> {
    match sqlx::query_scalar::<_, i32>("SELECT 1").fetch_one(pool).await {
        Ok(_) => Ok(true),
        Err(e) => {
            debug!("Database health check failed: {}", e);
            Ok(false)
        }
    }
}
