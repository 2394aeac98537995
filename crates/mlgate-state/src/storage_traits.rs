//! Storage trait definitions for mlgate
//!
//! These traits define the registry's persistence abstractions:
//! - `CasStore`: content-addressed artifact blobs (put/get by digest)
//! - `RunLedger`: training run lifecycle (metrics, artifacts, terminal status)
//! - `ModelRegistry`: registered models, sequential versions, stage slots
//!
//! All traits are async and backend-agnostic. In-memory fakes are provided
//! for testing via the `fakes` module.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Tag recorded on runs that were failed by the registry rather than the client.
pub const FAILURE_REASON_TAG: &str = "mlgate.failure_reason";

// ---------------------------------------------------------------------------
// CasStore: Content-Addressed Artifact Storage
// ---------------------------------------------------------------------------

/// Content digest (SHA-256 hex string).
///
/// The inner field is private to guarantee the string is always valid
/// lowercase hex produced by `from_bytes` or validated via `TryFrom<String>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentDigest(String);

impl ContentDigest {
    /// Compute the SHA-256 digest of the given bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        use sha2::Digest;
        let mut hasher = Sha256::new();
        hasher.update(data);
        ContentDigest(hex::encode(hasher.finalize()))
    }

    /// Return the full hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (first 12 hex chars).
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl TryFrom<String> for ContentDigest {
    type Error = StorageError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        if s.len() != 64 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StorageError::InvalidDigest { digest: s });
        }
        Ok(ContentDigest(s.to_ascii_lowercase()))
    }
}

impl From<ContentDigest> for String {
    fn from(d: ContentDigest) -> Self {
        d.0
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque artifact location owned by the registry's storage.
///
/// Artifacts uploaded through the registry are content-addressed and carry a
/// `cas://<sha256>` URI; any other non-empty URI is accepted and stored as-is.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ArtifactRef(String);

impl ArtifactRef {
    const CAS_SCHEME: &'static str = "cas://";

    /// Reference to a blob held in the registry's content-addressed store.
    pub fn cas(digest: &ContentDigest) -> Self {
        ArtifactRef(format!("{}{}", Self::CAS_SCHEME, digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The content digest, if this reference points into the CAS.
    pub fn digest(&self) -> Option<ContentDigest> {
        self.0
            .strip_prefix(Self::CAS_SCHEME)
            .and_then(|hex| ContentDigest::try_from(hex.to_string()).ok())
    }
}

impl TryFrom<String> for ArtifactRef {
    type Error = StorageError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        if s.trim().is_empty() {
            return Err(StorageError::InvalidArtifactRef { reference: s });
        }
        if let Some(hex) = s.strip_prefix(Self::CAS_SCHEME) {
            ContentDigest::try_from(hex.to_string())
                .map_err(|_| StorageError::InvalidArtifactRef { reference: s.clone() })?;
        }
        Ok(ArtifactRef(s))
    }
}

impl From<ArtifactRef> for String {
    fn from(r: ArtifactRef) -> Self {
        r.0
    }
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Content-addressed blob store.
///
/// Guarantees:
/// - `put(data)` always returns the SHA-256 digest of `data`.
/// - `get(digest)` returns the exact bytes previously stored.
/// - Same content always yields the same digest (deduplication).
#[async_trait]
pub trait CasStore: Send + Sync {
    /// Store bytes and return their content digest.
    async fn put(&self, data: &[u8]) -> StorageResult<ContentDigest>;

    /// Retrieve bytes by digest. Returns `StorageError::NotFound` if absent.
    async fn get(&self, digest: &ContentDigest) -> StorageResult<Vec<u8>>;

    /// Check whether a digest exists in the store.
    async fn contains(&self, digest: &ContentDigest) -> StorageResult<bool>;
}

// ---------------------------------------------------------------------------
// RunLedger: Training Run Persistence
// ---------------------------------------------------------------------------

/// Unique identifier for a training run
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    /// Generate a new random RunId
    pub fn new() -> Self {
        RunId(uuid::Uuid::new_v4().simple().to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Running,
    Finished,
    Failed,
}

impl RunStatus {
    /// Finished and Failed runs are immutable.
    pub fn is_terminal(self) -> bool {
        !matches!(self, RunStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "RUNNING",
            RunStatus::Finished => "FINISHED",
            RunStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = StorageError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "RUNNING" => Ok(RunStatus::Running),
            "FINISHED" => Ok(RunStatus::Finished),
            "FAILED" => Ok(RunStatus::Failed),
            _ => Err(StorageError::Backend(format!("unknown run status: {s}"))),
        }
    }
}

/// Attributes supplied when a run is created
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewRun {
    /// Experiment the run belongs to
    pub experiment: String,
    /// Optional human-readable run name
    pub run_name: Option<String>,
    /// Arbitrary string tags
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// Full run record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    pub experiment: String,
    pub run_name: Option<String>,
    pub status: RunStatus,
    pub metrics: BTreeMap<String, f64>,
    pub artifacts: Vec<ArtifactRef>,
    pub tags: BTreeMap<String, String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Refreshed by every mutation; drives the abandoned-run lease.
    pub last_heartbeat_at: DateTime<Utc>,
}

impl RunRecord {
    /// Fresh `Running` record for `new_run`.
    pub fn start(run_id: RunId, new_run: NewRun, now: DateTime<Utc>) -> Self {
        Self {
            run_id,
            experiment: new_run.experiment,
            run_name: new_run.run_name,
            status: RunStatus::Running,
            metrics: BTreeMap::new(),
            artifacts: Vec::new(),
            tags: new_run.tags,
            started_at: now,
            ended_at: None,
            last_heartbeat_at: now,
        }
    }

    /// Error unless the run still accepts mutations.
    pub fn ensure_running(&self) -> StorageResult<()> {
        if self.status.is_terminal() {
            return Err(StorageError::InvalidRunState {
                run_id: self.run_id.0.clone(),
                status: self.status.to_string(),
                expected: RunStatus::Running.to_string(),
            });
        }
        Ok(())
    }
}

/// Training run ledger.
///
/// Guarantees:
/// - A run transitions: Running → Finished | Failed (terminal).
/// - Terminal runs are immutable: metric/artifact logging and a second
///   `finish_run` fail with `InvalidRunState`.
/// - Logging the same metric name twice keeps the latest value.
/// - Logging the same artifact twice records it once.
#[async_trait]
pub trait RunLedger: Send + Sync {
    /// Create a new run in `Running` status.
    async fn create_run(&self, new_run: NewRun) -> StorageResult<RunRecord>;

    /// Record a scalar metric on an active run.
    async fn log_metric(&self, run_id: &RunId, name: &str, value: f64) -> StorageResult<()>;

    /// Attach an artifact reference to an active run.
    async fn log_artifact(&self, run_id: &RunId, artifact: &ArtifactRef) -> StorageResult<()>;

    /// Move an active run to a terminal status.
    async fn finish_run(&self, run_id: &RunId, status: RunStatus) -> StorageResult<RunRecord>;

    /// Retrieve a run record by ID.
    async fn get_run(&self, run_id: &RunId) -> StorageResult<RunRecord>;

    /// List runs, optionally filtered by experiment, oldest first.
    async fn list_runs(&self, experiment: Option<&str>) -> StorageResult<Vec<RunRecord>>;

    /// Fail every `Running` run whose heartbeat is older than `cutoff`,
    /// tagging it with [`FAILURE_REASON_TAG`]. Returns the expired run IDs.
    async fn expire_stale_runs(&self, cutoff: DateTime<Utc>) -> StorageResult<Vec<RunId>>;
}

// ---------------------------------------------------------------------------
// ModelRegistry: Registered Models, Versions and Stages
// ---------------------------------------------------------------------------

/// Deployment-intent label carried by a model version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Stage {
    #[default]
    None,
    Staging,
    Production,
    Archived,
}

impl Stage {
    pub const ALL: [Stage; 4] = [
        Stage::None,
        Stage::Staging,
        Stage::Production,
        Stage::Archived,
    ];

    /// Stages limited to a single occupant per registered model.
    pub fn is_slotted(self) -> bool {
        matches!(self, Stage::Staging | Stage::Production)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::None => "None",
            Stage::Staging => "Staging",
            Stage::Production => "Production",
            Stage::Archived => "Archived",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = StorageError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(Stage::None),
            "staging" => Ok(Stage::Staging),
            "production" => Ok(Stage::Production),
            "archived" => Ok(Stage::Archived),
            _ => Err(StorageError::InvalidStage {
                value: s.to_string(),
            }),
        }
    }
}

/// Where the previous holder of a stage goes when another version takes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DemotionPolicy {
    /// Previous holder returns to `None`.
    #[default]
    ToNone,
    /// Previous holder moves to `Archived`.
    ToArchived,
}

impl DemotionPolicy {
    pub fn demoted_stage(self) -> Stage {
        match self {
            DemotionPolicy::ToNone => Stage::None,
            DemotionPolicy::ToArchived => Stage::Archived,
        }
    }
}

impl FromStr for DemotionPolicy {
    type Err = StorageError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "to_none" | "none" => Ok(DemotionPolicy::ToNone),
            "to_archived" | "archived" => Ok(DemotionPolicy::ToArchived),
            _ => Err(StorageError::Backend(format!(
                "unknown demotion policy: {s}"
            ))),
        }
    }
}

/// Logical model name under which versions accumulate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisteredModel {
    pub name: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Highest version number ever assigned (0 before the first registration).
    pub latest_version: u64,
}

/// One immutable artifact bound to a registered model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelVersion {
    pub name: String,
    pub version: u64,
    pub run_id: RunId,
    pub stage: Stage,
    pub artifact: ArtifactRef,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub stage_updated_at: DateTime<Utc>,
}

impl ModelVersion {
    /// The version currently holding `stage`.
    ///
    /// With the single-slot rule intact there is at most one candidate. If a
    /// concurrent promotion left several, the most recently promoted wins,
    /// then the highest version number.
    pub fn holder_of(versions: &[ModelVersion], stage: Stage) -> Option<&ModelVersion> {
        versions
            .iter()
            .filter(|v| v.stage == stage)
            .max_by(|a, b| {
                a.stage_updated_at
                    .cmp(&b.stage_updated_at)
                    .then(a.version.cmp(&b.version))
            })
    }

    /// The version a reader of `stage` gets: the slot holder for slotted
    /// stages, the highest version number otherwise.
    pub fn latest_in_stage(versions: &[ModelVersion], stage: Stage) -> Option<&ModelVersion> {
        if stage.is_slotted() {
            Self::holder_of(versions, stage)
        } else {
            versions
                .iter()
                .filter(|v| v.stage == stage)
                .max_by_key(|v| v.version)
        }
    }
}

/// Move `version` into `stage`, demoting any other occupant of a slotted
/// stage according to `policy`.
///
/// Returns the version numbers whose stage changed (target included), in
/// ascending order, so backends can persist exactly those rows.
pub fn apply_stage_transition(
    name: &str,
    versions: &mut [ModelVersion],
    version: u64,
    stage: Stage,
    policy: DemotionPolicy,
    now: DateTime<Utc>,
) -> StorageResult<Vec<u64>> {
    if !versions.iter().any(|v| v.version == version) {
        return Err(StorageError::VersionNotFound {
            name: name.to_string(),
            version,
        });
    }

    let mut changed = Vec::new();
    for v in versions.iter_mut() {
        if v.version == version {
            v.stage = stage;
            v.stage_updated_at = now;
            changed.push(v.version);
        } else if stage.is_slotted() && v.stage == stage {
            v.stage = policy.demoted_stage();
            v.stage_updated_at = now;
            changed.push(v.version);
        }
    }
    changed.sort_unstable();
    Ok(changed)
}

/// Model registry.
///
/// Semantics:
/// - `register_version` assigns the next sequential version number (never
///   reused) and places it in `target_stage` in one atomic step.
/// - For `Staging` and `Production`, at most one version holds the stage;
///   taking it demotes the previous holder per `DemotionPolicy`.
/// - Versions are never deleted.
#[async_trait]
pub trait ModelRegistry: Send + Sync {
    /// Create a new version of `name` (creating the model on first use) and
    /// move it to `target_stage`.
    async fn register_version(
        &self,
        name: &str,
        run_id: &RunId,
        artifact: &ArtifactRef,
        target_stage: Stage,
        policy: DemotionPolicy,
    ) -> StorageResult<ModelVersion>;

    /// Move an existing version to `stage`.
    async fn transition_stage(
        &self,
        name: &str,
        version: u64,
        stage: Stage,
        policy: DemotionPolicy,
    ) -> StorageResult<ModelVersion>;

    /// Fetch one version. `ModelNotFound` / `VersionNotFound` if absent.
    async fn get_version(&self, name: &str, version: u64) -> StorageResult<ModelVersion>;

    /// All versions of `name` in ascending version order (empty if unknown).
    async fn list_versions(&self, name: &str) -> StorageResult<Vec<ModelVersion>>;

    /// Set or clear a version's description.
    async fn update_description(
        &self,
        name: &str,
        version: u64,
        description: Option<String>,
    ) -> StorageResult<ModelVersion>;

    async fn get_model(&self, name: &str) -> StorageResult<Option<RegisteredModel>>;

    async fn list_models(&self) -> StorageResult<Vec<RegisteredModel>>;
}
