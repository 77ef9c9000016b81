//! Standalone orchestrator.
//!
//! Runs store housekeeping (failing timed-out, exhausted and dependency-failed
//! jobs, sweeping old jobs and stale definitions, repeating definitions) for
//! every process sharing the database. Job functions live in the processes
//! that register them; this binary registers none.
//!
//! Environment:
//! - `DATABASE_URL` (required)
//! - `JOBFORGE_DB_MAX_CONNECTIONS` (default 5)
//! - `JOBFORGE_PREPARE_SCHEMA=true` to create the tables on startup
//! - `JOBFORGE_SCHEMA` and the `JOBFORGE_*` orchestrator settings

use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;

use jobforge_infra::{JobRegistry, Orchestrator, OrchestratorConfig, PostgresJobStore, StoreConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    jobforge_observability::init();

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let max_connections = match std::env::var("JOBFORGE_DB_MAX_CONNECTIONS") {
        Ok(raw) => raw
            .parse::<u32>()
            .with_context(|| format!("invalid JOBFORGE_DB_MAX_CONNECTIONS '{raw}'"))?,
        Err(_) => 5,
    };
    let store_config = StoreConfig::from_env()?;
    let orchestrator_config = OrchestratorConfig::from_env()?;

    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(&database_url)
        .await
        .context("failed to connect to postgres")?;
    let store = Arc::new(PostgresJobStore::with_config(pool, &store_config)?);

    if std::env::var("JOBFORGE_PREPARE_SCHEMA").is_ok_and(|v| v == "true" || v == "1") {
        store.prepare_schema().await?;
        tracing::info!(schema = %store_config.schema, "schema prepared");
    }

    let handle = Orchestrator::new(store, Arc::new(JobRegistry::new()), orchestrator_config).start();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown signal received");
    handle.shutdown().await;

    Ok(())
}
