//! SurrealKV-backed store smoke tests.

use std::collections::BTreeMap;

use mlgate_state::storage_traits::*;
use mlgate_state::{SurrealHandle, SurrealModelRegistry, SurrealRunLedger};

#[tokio::test]
async fn surrealkv_store_creates_directory_and_persists_rows() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("registry-db");
    let uri = format!("surrealkv://{}", db_path.display());

    let handle = SurrealHandle::connect(&uri).await.unwrap();
    assert!(db_path.is_dir());

    let ledger = SurrealRunLedger::new(handle.clone());
    let registry = SurrealModelRegistry::new(handle);

    let run = ledger
        .create_run(NewRun {
            experiment: "default".to_string(),
            run_name: Some("durable".to_string()),
            tags: BTreeMap::from([("team".to_string(), "ml".to_string())]),
        })
        .await
        .unwrap();
    let model = ArtifactRef::cas(&ContentDigest::from_bytes(b"weights"));
    ledger.log_artifact(&run.run_id, &model).await.unwrap();
    ledger
        .finish_run(&run.run_id, RunStatus::Finished)
        .await
        .unwrap();

    let version = registry
        .register_version(
            "clf-model",
            &run.run_id,
            &model,
            Stage::Staging,
            DemotionPolicy::ToNone,
        )
        .await
        .unwrap();
    assert_eq!(version.version, 1);

    let stored = ledger.get_run(&run.run_id).await.unwrap();
    assert_eq!(stored.run_name.as_deref(), Some("durable"));
    assert_eq!(stored.tags["team"], "ml");
    assert_eq!(
        registry.get_version("clf-model", 1).await.unwrap().artifact,
        model
    );
}
