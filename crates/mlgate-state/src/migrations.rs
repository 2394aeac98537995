//! SurrealDB schema migrations and initialization
//!
//! Sets up the registry tables with their uniqueness constraints. Every
//! statement uses `IF NOT EXISTS`, so reopening a durable store is a no-op.

use crate::error::StateError;
use crate::Result;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

/// Initialize all mlgate tables in SurrealDB
pub async fn init_schema(db: &Surreal<Any>) -> Result<()> {
    info!("Initializing mlgate SurrealDB schema");

    init_runs_table(db).await?;
    init_models_table(db).await?;
    init_model_versions_table(db).await?;

    info!("mlgate schema initialization complete");
    Ok(())
}

async fn apply(db: &Surreal<Any>, sql: &str) -> Result<()> {
    db.query(sql)
        .await
        .and_then(|res| res.check())
        .map_err(|e| StateError::SchemaSetup(e.to_string()))?;
    Ok(())
}

/// Initialize `runs` table
///
/// Schema:
/// ```text
/// TABLE runs {
///   run_id:             STRING (unique)
///   experiment:         STRING (indexed)
///   run_name:           STRING?
///   status:             STRING (RUNNING | FINISHED | FAILED)
///   metrics:            OBJECT<STRING, FLOAT>
///   artifacts:          ARRAY<STRING>
///   tags:               OBJECT<STRING, STRING>
///   started_at:         DATETIME (indexed)
///   ended_at:           DATETIME?
///   last_heartbeat_at:  DATETIME
/// }
/// ```
///
/// Status transitions (RUNNING → FINISHED | FAILED) are enforced by the ledger.
async fn init_runs_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing runs table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS runs SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR select FULL
                FOR update FULL
                FOR delete NONE;

        DEFINE INDEX IF NOT EXISTS idx_run_id ON TABLE runs COLUMNS run_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_run_experiment ON TABLE runs COLUMNS experiment;
        DEFINE INDEX IF NOT EXISTS idx_run_status ON TABLE runs COLUMNS status;
        DEFINE INDEX IF NOT EXISTS idx_run_started_at ON TABLE runs COLUMNS started_at;
    "#;

    apply(db, sql).await
}

/// Initialize `models` table (one row per registered model name)
async fn init_models_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing models table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS models SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR select FULL
                FOR update FULL
                FOR delete NONE;

        DEFINE INDEX IF NOT EXISTS idx_model_name ON TABLE models COLUMNS name UNIQUE;
    "#;

    apply(db, sql).await
}

/// Initialize `model_versions` table
///
/// `(name, version)` is unique; a duplicate version number aborts the
/// registering transaction instead of silently overwriting.
async fn init_model_versions_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing model_versions table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS model_versions SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR select FULL
                FOR update FULL
                FOR delete NONE;

        DEFINE INDEX IF NOT EXISTS idx_version_key ON TABLE model_versions COLUMNS name, version UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_version_stage ON TABLE model_versions COLUMNS name, stage;
    "#;

    apply(db, sql).await
}
