use std::sync::Arc;

use masterdata_core::{
    Catalog, CategoryStore, KeyNamespace, KeyValueStore, MemoryKvStore, MigrationEngine,
};
use masterdata_store_sqlite::SqliteCanonicalStore;
use serde_json::json;
use tempfile::TempDir;

fn open(dir: &TempDir) -> SqliteCanonicalStore {
    let store = SqliteCanonicalStore::open(&dir.path().join("canonical.db"))
        .unwrap_or_else(|e| panic!("open canonical store: {e}"));
    store
        .ensure_tables(&Catalog::builtin().names())
        .unwrap_or_else(|e| panic!("register tables: {e}"));
    store
}

#[tokio::test]
async fn legacy_data_migrates_into_sqlite_and_reads_back_in_order() {
    let dir = TempDir::new().unwrap_or_else(|e| panic!("tempdir: {e}"));
    let kv = Arc::new(MemoryKvStore::with_entries([
        (
            "master_data_entity_types",
            r#"{"data":["Trust","Commercial","Society"],"version":1}"#,
        ),
        (
            "master_data_currencies",
            r#"[{"id":"INR","name":"Indian Rupee","isActive":true},{"id":"USD","name":"US Dollar","isActive":false}]"#,
        ),
        ("master_data_reward_types", "not-json"),
    ]));
    let catalog = Arc::new(Catalog::builtin());
    let remote = Arc::new(open(&dir));

    let engine = MigrationEngine::new(
        kv.clone(),
        remote.clone(),
        catalog.clone(),
        KeyNamespace::default(),
    );
    let report = engine.migrate_all_master_data().await;
    assert_eq!(report.migrated.len(), 2);
    assert_eq!(report.failed.len(), 1);
    assert!(report.completion_flag_set);
    drop(engine);
    drop(remote);

    // Reopen from disk: rows survived and keep their migration order.
    let reopened = open(&dir);
    assert_eq!(reopened.row_count("entity_types").unwrap_or(0), 3);
    assert_eq!(reopened.row_count("currencies").unwrap_or(0), 2);

    let store = CategoryStore::new(kv.clone(), catalog, KeyNamespace::default());
    let loaded = store
        .load_canonical("entity_types", &reopened)
        .await
        .unwrap_or_else(|e| panic!("load_canonical: {e}"));
    assert_eq!(
        loaded.value,
        vec![json!("Trust"), json!("Commercial"), json!("Society")]
    );

    let currencies = store
        .load_canonical("currencies", &reopened)
        .await
        .unwrap_or_else(|e| panic!("load_canonical: {e}"));
    assert_eq!(currencies.value[1]["is_active"], json!(false));
    assert_eq!(currencies.value[1]["display_order"], json!(1));
}

#[tokio::test]
async fn forced_rerun_leaves_existing_rows_alone() {
    let dir = TempDir::new().unwrap_or_else(|e| panic!("tempdir: {e}"));
    let kv = Arc::new(MemoryKvStore::with_entries([
        ("master_data_currencies", r#"[{"id":"EUR","name":"Euro"}]"#),
        ("master_data_countries", r#"["India","Germany"]"#),
    ]));
    let remote = Arc::new(open(&dir));
    let engine = MigrationEngine::new(
        kv.clone(),
        remote.clone(),
        Arc::new(Catalog::builtin()),
        KeyNamespace::default(),
    );

    engine.migrate_all_master_data().await;
    let second = engine
        .run_manual()
        .await
        .unwrap_or_else(|e| panic!("forced rerun: {e}"));
    assert!(second.failed.is_empty());
    assert!(second.migrated.is_empty());
    assert!(second.completion_flag_set);
    assert_eq!(remote.row_count("currencies").unwrap_or(0), 1);
    assert_eq!(remote.row_count("countries").unwrap_or(0), 2);
    assert_eq!(
        kv.get("master_data_migration_completed")
            .unwrap_or_else(|e| panic!("{e}"))
            .as_deref(),
        Some("true")
    );
}
