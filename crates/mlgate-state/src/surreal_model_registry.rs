//! SurrealDB-backed ModelRegistry implementation
//!
//! Version assignment and stage moves are computed in memory with
//! [`apply_stage_transition`] under the handle's write lock, then written back
//! in one SurrealQL transaction so a crash can never leave two holders of a
//! stage or a version without its model row.

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use surrealdb::sql::Datetime as SurrealDatetime;
use tracing::{debug, instrument};

use crate::error::StorageError;
use crate::handle::SurrealHandle;
use crate::schema::{ModelRow, VersionRow};
use crate::storage_traits::{
    apply_stage_transition, ArtifactRef, DemotionPolicy, ModelRegistry, ModelVersion,
    RegisteredModel, RunId, Stage, StorageResult,
};

/// Stage update applied to an existing `model_versions` row.
#[derive(Debug, Clone, Serialize)]
struct StageChange {
    version: u64,
    stage: String,
}

const APPLY_STAGE_CHANGES: &str = "FOR $c IN $changes { \
     UPDATE model_versions SET stage = $c.stage, stage_updated_at = $now \
     WHERE name = $name AND version = $c.version; \
     };";

/// SurrealDB-backed implementation of [`ModelRegistry`].
#[derive(Debug, Clone)]
pub struct SurrealModelRegistry {
    handle: SurrealHandle,
}

impl SurrealModelRegistry {
    pub fn new(handle: SurrealHandle) -> Self {
        Self { handle }
    }

    /// Create an in-memory instance for testing.
    pub async fn in_memory() -> crate::Result<Self> {
        Ok(Self::new(SurrealHandle::in_memory().await?))
    }

    async fn load_model(&self, name: &str) -> StorageResult<Option<ModelRow>> {
        let name_owned = name.to_string();
        let mut res = self
            .handle
            .db()
            .query("SELECT * FROM models WHERE name = $name")
            .bind(("name", name_owned))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let rows: Vec<ModelRow> = res
            .take(0)
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(rows.into_iter().next())
    }

    async fn require_model(&self, name: &str) -> StorageResult<ModelRow> {
        self.load_model(name)
            .await?
            .ok_or_else(|| StorageError::ModelNotFound {
                name: name.to_string(),
            })
    }

    async fn load_versions(&self, name: &str) -> StorageResult<Vec<ModelVersion>> {
        let name_owned = name.to_string();
        let mut res = self
            .handle
            .db()
            .query("SELECT * FROM model_versions WHERE name = $name ORDER BY version ASC")
            .bind(("name", name_owned))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let rows: Vec<VersionRow> = res
            .take(0)
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        rows.into_iter().map(ModelVersion::try_from).collect()
    }

    fn pick(versions: Vec<ModelVersion>, name: &str, version: u64) -> StorageResult<ModelVersion> {
        versions
            .into_iter()
            .find(|v| v.version == version)
            .ok_or_else(|| StorageError::VersionNotFound {
                name: name.to_string(),
                version,
            })
    }

    /// Stage changes for every version in `changed` except `skip`.
    fn stage_changes(versions: &[ModelVersion], changed: &[u64], skip: Option<u64>) -> Vec<StageChange> {
        versions
            .iter()
            .filter(|v| changed.contains(&v.version) && Some(v.version) != skip)
            .map(|v| StageChange {
                version: v.version,
                stage: v.stage.as_str().to_string(),
            })
            .collect()
    }
}

#[async_trait]
impl ModelRegistry for SurrealModelRegistry {
    #[instrument(skip(self, artifact), fields(name = %name, run_id = %run_id, stage = %target_stage))]
    async fn register_version(
        &self,
        name: &str,
        run_id: &RunId,
        artifact: &ArtifactRef,
        target_stage: Stage,
        policy: DemotionPolicy,
    ) -> StorageResult<ModelVersion> {
        let _guard = self.handle.write_guard().await;
        let now = Utc::now();

        let existing = self.load_model(name).await?;
        let is_new_model = existing.is_none();
        let mut model = existing.unwrap_or_else(|| ModelRow {
            name: name.to_string(),
            description: None,
            created_at: now,
            latest_version: 0,
        });
        let version = model.latest_version + 1;
        model.latest_version = version;

        let mut versions = self.load_versions(name).await?;
        versions.push(ModelVersion {
            name: name.to_string(),
            version,
            run_id: run_id.clone(),
            stage: Stage::None,
            artifact: artifact.clone(),
            description: None,
            created_at: now,
            stage_updated_at: now,
        });
        let changed = if target_stage != Stage::None {
            apply_stage_transition(name, &mut versions, version, target_stage, policy, now)?
        } else {
            Vec::new()
        };

        let demotions = Self::stage_changes(&versions, &changed, Some(version));
        let registered = Self::pick(versions, name, version)?;

        let model_stmt = if is_new_model {
            "CREATE models CONTENT $model;"
        } else {
            "UPDATE models SET latest_version = $latest WHERE name = $name;"
        };
        let sql = format!(
            "BEGIN TRANSACTION; {model_stmt} CREATE model_versions CONTENT $row; \
             {APPLY_STAGE_CHANGES} COMMIT TRANSACTION;"
        );

        debug!(version, demoted = demotions.len(), "registering model version");

        self.handle
            .db()
            .query(sql)
            .bind(("model", model))
            .bind(("latest", version))
            .bind(("name", name.to_string()))
            .bind(("row", VersionRow::from(&registered)))
            .bind(("changes", demotions))
            .bind(("now", SurrealDatetime::from(now)))
            .await
            .and_then(|res| res.check())
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        Ok(registered)
    }

    #[instrument(skip(self), fields(name = %name, version, stage = %stage))]
    async fn transition_stage(
        &self,
        name: &str,
        version: u64,
        stage: Stage,
        policy: DemotionPolicy,
    ) -> StorageResult<ModelVersion> {
        let _guard = self.handle.write_guard().await;
        self.require_model(name).await?;

        let now = Utc::now();
        let mut versions = self.load_versions(name).await?;
        let changed = apply_stage_transition(name, &mut versions, version, stage, policy, now)?;
        let changes = Self::stage_changes(&versions, &changed, None);

        let sql = format!("BEGIN TRANSACTION; {APPLY_STAGE_CHANGES} COMMIT TRANSACTION;");
        self.handle
            .db()
            .query(sql)
            .bind(("name", name.to_string()))
            .bind(("changes", changes))
            .bind(("now", SurrealDatetime::from(now)))
            .await
            .and_then(|res| res.check())
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        Self::pick(versions, name, version)
    }

    async fn get_version(&self, name: &str, version: u64) -> StorageResult<ModelVersion> {
        self.require_model(name).await?;

        let mut res = self
            .handle
            .db()
            .query("SELECT * FROM model_versions WHERE name = $name AND version = $version")
            .bind(("name", name.to_string()))
            .bind(("version", version))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let rows: Vec<VersionRow> = res
            .take(0)
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        rows.into_iter()
            .next()
            .ok_or_else(|| StorageError::VersionNotFound {
                name: name.to_string(),
                version,
            })
            .and_then(ModelVersion::try_from)
    }

    async fn list_versions(&self, name: &str) -> StorageResult<Vec<ModelVersion>> {
        self.load_versions(name).await
    }

    #[instrument(skip(self, description), fields(name = %name, version))]
    async fn update_description(
        &self,
        name: &str,
        version: u64,
        description: Option<String>,
    ) -> StorageResult<ModelVersion> {
        let _guard = self.handle.write_guard().await;
        let mut current = self.get_version(name, version).await?;

        self.handle
            .db()
            .query("UPDATE model_versions SET description = $description WHERE name = $name AND version = $version")
            .bind(("description", description.clone()))
            .bind(("name", name.to_string()))
            .bind(("version", version))
            .await
            .and_then(|res| res.check())
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        current.description = description;
        Ok(current)
    }

    async fn get_model(&self, name: &str) -> StorageResult<Option<RegisteredModel>> {
        Ok(self.load_model(name).await?.map(RegisteredModel::from))
    }

    async fn list_models(&self) -> StorageResult<Vec<RegisteredModel>> {
        let mut res = self
            .handle
            .db()
            .query("SELECT * FROM models ORDER BY name ASC")
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let rows: Vec<ModelRow> = res
            .take(0)
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(rows.into_iter().map(RegisteredModel::from).collect())
    }
}
