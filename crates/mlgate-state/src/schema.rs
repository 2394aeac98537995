//! SurrealDB row types
//!
//! Rows are plain serde structs; timestamps go through the Surreal datetime
//! type so they compare and sort natively inside queries. Conversion to the
//! public `storage_traits` types happens at the boundary.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::storage_traits::{
    ArtifactRef, ModelVersion, RegisteredModel, RunId, RunRecord, RunStatus, Stage,
    StorageResult,
};

/// Serialize chrono DateTime to SurrealDB datetime format
mod surreal_datetime {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let sd = SurrealDatetime::from(*date);
        serde::Serialize::serialize(&sd, serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = SurrealDatetime::deserialize(deserializer)?;
        Ok(DateTime::from(sd))
    }
}

mod surreal_datetime_opt {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match date {
            Some(d) => {
                let sd = SurrealDatetime::from(*d);
                serde::Serialize::serialize(&Some(sd), serializer)
            }
            None => serde::Serialize::serialize(&None::<SurrealDatetime>, serializer),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = Option::<SurrealDatetime>::deserialize(deserializer)?;
        Ok(sd.map(DateTime::from))
    }
}

/// Row in the `runs` table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct RunRow {
    pub run_id: String,
    pub experiment: String,
    pub run_name: Option<String>,
    /// "RUNNING" | "FINISHED" | "FAILED"
    pub status: String,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(with = "surreal_datetime")]
    pub started_at: DateTime<Utc>,
    #[serde(with = "surreal_datetime_opt", default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(with = "surreal_datetime")]
    pub last_heartbeat_at: DateTime<Utc>,
}

impl From<&RunRecord> for RunRow {
    fn from(r: &RunRecord) -> Self {
        Self {
            run_id: r.run_id.0.clone(),
            experiment: r.experiment.clone(),
            run_name: r.run_name.clone(),
            status: r.status.as_str().to_string(),
            metrics: r.metrics.clone(),
            artifacts: r.artifacts.iter().map(|a| a.as_str().to_string()).collect(),
            tags: r.tags.clone(),
            started_at: r.started_at,
            ended_at: r.ended_at,
            last_heartbeat_at: r.last_heartbeat_at,
        }
    }
}

impl TryFrom<RunRow> for RunRecord {
    type Error = StorageError;

    fn try_from(row: RunRow) -> StorageResult<Self> {
        let artifacts = row
            .artifacts
            .into_iter()
            .map(ArtifactRef::try_from)
            .collect::<StorageResult<Vec<_>>>()?;
        Ok(RunRecord {
            run_id: RunId(row.run_id),
            experiment: row.experiment,
            run_name: row.run_name,
            status: row.status.parse::<RunStatus>()?,
            metrics: row.metrics,
            artifacts,
            tags: row.tags,
            started_at: row.started_at,
            ended_at: row.ended_at,
            last_heartbeat_at: row.last_heartbeat_at,
        })
    }
}

/// Row in the `models` table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ModelRow {
    pub name: String,
    pub description: Option<String>,
    #[serde(with = "surreal_datetime")]
    pub created_at: DateTime<Utc>,
    pub latest_version: u64,
}

impl From<ModelRow> for RegisteredModel {
    fn from(row: ModelRow) -> Self {
        RegisteredModel {
            name: row.name,
            description: row.description,
            created_at: row.created_at,
            latest_version: row.latest_version,
        }
    }
}

/// Row in the `model_versions` table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct VersionRow {
    pub name: String,
    pub version: u64,
    pub run_id: String,
    /// "None" | "Staging" | "Production" | "Archived"
    pub stage: String,
    pub artifact: String,
    pub description: Option<String>,
    #[serde(with = "surreal_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "surreal_datetime")]
    pub stage_updated_at: DateTime<Utc>,
}

impl From<&ModelVersion> for VersionRow {
    fn from(v: &ModelVersion) -> Self {
        Self {
            name: v.name.clone(),
            version: v.version,
            run_id: v.run_id.0.clone(),
            stage: v.stage.as_str().to_string(),
            artifact: v.artifact.as_str().to_string(),
            description: v.description.clone(),
            created_at: v.created_at,
            stage_updated_at: v.stage_updated_at,
        }
    }
}

impl TryFrom<VersionRow> for ModelVersion {
    type Error = StorageError;

    fn try_from(row: VersionRow) -> StorageResult<Self> {
        Ok(ModelVersion {
            name: row.name,
            version: row.version,
            run_id: RunId(row.run_id),
            stage: row.stage.parse::<Stage>()?,
            artifact: ArtifactRef::try_from(row.artifact)?,
            description: row.description,
            created_at: row.created_at,
            stage_updated_at: row.stage_updated_at,
        })
    }
}
