//! Database connection pool and store selection.

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{info, warn};

use crate::config::KernelConfig;
use crate::store::{MemoryStore, ModuleStore, PgModuleStore};

/// Create a PostgreSQL connection pool.
pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
        .context("failed to connect to PostgreSQL")?;

    Ok(pool)
}

/// Check if the database connection is healthy.
pub async fn check_health(pool: &PgPool) -> bool {
    sqlx::query("SELECT 1").execute(pool).await.is_ok()
}

/// Open the store the configuration asks for.
///
/// With a `DATABASE_URL` this connects, creates the module tables and
/// returns a PostgreSQL store; otherwise an in-memory one.
pub async fn open_store(config: &KernelConfig) -> Result<Arc<dyn ModuleStore>> {
    let Some(url) = config.database_url.as_deref() else {
        warn!("DATABASE_URL not set, module state will not survive restarts");
        return Ok(Arc::new(MemoryStore::new()));
    };

    let pool = create_pool(url, config.database_max_connections).await?;
    let store = PgModuleStore::new(pool);
    store.ensure_schema().await?;
    info!(
        max_connections = config.database_max_connections,
        "module store connected"
    );
    Ok(Arc::new(store))
}
