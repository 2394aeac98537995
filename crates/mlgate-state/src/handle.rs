//! SurrealDB Handle - Connection and Schema Setup
//!
//! A single handle is shared by the run ledger and the model registry so both
//! see the same database and serialize their writes through one lock.
//!
//! Supported store URIs:
//! - `mem://` (ephemeral, for tests and throwaway registries)
//! - `surrealkv://<dir>` (durable, local directory)
//! - `ws://` / `wss://` (remote SurrealDB server)

use std::sync::Arc;

use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{info, instrument};

use crate::error::StateError;
use crate::migrations;
use crate::Result;

const NAMESPACE: &str = "mlgate";
const DATABASE: &str = "registry";

/// SurrealDB connection handle for mlgate
#[derive(Clone)]
pub struct SurrealHandle {
    db: Surreal<Any>,
    write_lock: Arc<Mutex<()>>,
}

impl std::fmt::Debug for SurrealHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SurrealHandle").finish_non_exhaustive()
    }
}

impl SurrealHandle {
    /// Connect to an in-memory database and set up schema.
    pub async fn in_memory() -> Result<Self> {
        Self::connect("mem://").await
    }

    /// Connect to the store at `uri` and set up schema.
    ///
    /// For `surrealkv://` the directory is created if missing.
    #[instrument(skip_all, fields(uri = %uri))]
    pub async fn connect(uri: &str) -> Result<Self> {
        let endpoint = if uri == "mem://" || uri == "memory" {
            "mem://".to_string()
        } else if let Some(path) = uri.strip_prefix("surrealkv://") {
            if path.is_empty() {
                return Err(StateError::InvalidUri(uri.to_string()));
            }
            std::fs::create_dir_all(path).map_err(|e| {
                StateError::Connection(format!(
                    "Failed to create database directory {}: {}",
                    path, e
                ))
            })?;
            uri.to_string()
        } else if uri.starts_with("ws://") || uri.starts_with("wss://") {
            uri.to_string()
        } else {
            return Err(StateError::InvalidUri(uri.to_string()));
        };

        let db = surrealdb::engine::any::connect(endpoint.as_str())
            .await
            .map_err(|e| {
                StateError::Connection(format!("Failed to connect to {}: {}", endpoint, e))
            })?;

        db.use_ns(NAMESPACE)
            .use_db(DATABASE)
            .await
            .map_err(|e| StateError::Connection(e.to_string()))?;

        migrations::init_schema(&db).await?;

        info!("SurrealDB connected and schema initialized");
        Ok(Self {
            db,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    pub(crate) fn db(&self) -> &Surreal<Any> {
        &self.db
    }

    /// Serializes read-modify-write sequences across every store sharing
    /// this handle.
    pub(crate) async fn write_guard(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().await
    }
}
