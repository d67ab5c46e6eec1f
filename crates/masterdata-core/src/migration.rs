//! One-shot migration of legacy master data into the canonical store.
//!
//! The engine walks the catalog in order, reads each legacy key, unwraps any
//! envelope and inserts the collection into the category's table. A failure
//! on one key is recorded and the batch keeps going. The completion flag is
//! set at the end of every pass, so the next call is a no-op until the flag
//! is cleared.
//!
//! Rows carry deterministic ids (the record's own `id`, otherwise
//! `<category>:<position>`), and rows already present in the canonical table
//! are skipped, so a forced re-run never duplicates data.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::catalog::{Catalog, CategoryDef};
use crate::config::KeyNamespace;
use crate::envelope::{normalize, ItemShape};
use crate::error::AppError;
use crate::kv::{read_value, KeyValueStore, KvError, RawValue};
use crate::remote::{row_id, CanonicalStore, Row};

/// Persisted "migration has run" marker.
#[derive(Clone)]
pub struct MigrationGate {
    kv: Arc<dyn KeyValueStore>,
    key: String,
}

impl MigrationGate {
    pub fn new(kv: Arc<dyn KeyValueStore>, namespace: &KeyNamespace) -> Self {
        Self {
            kv,
            key: namespace.migration_flag_key.clone(),
        }
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Unreadable flags count as "not completed".
    #[must_use]
    pub fn is_complete(&self) -> bool {
        matches!(
            self.kv.get(&self.key),
            Ok(Some(v)) if v.trim().trim_matches('"') == "true"
        )
    }

    pub fn mark_complete(&self) -> Result<(), KvError> {
        self.kv.set(&self.key, "true")
    }

    pub fn clear(&self) -> Result<(), KvError> {
        self.kv.remove(&self.key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigratedCategory {
    pub category: String,
    pub table: String,
    /// Rows inserted by this pass
    pub rows: usize,
    /// Rows skipped because the canonical table already held their id
    pub already_present: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedCategory {
    pub category: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedCategory {
    pub category: String,
    pub error: String,
}

/// Result of a migration pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    /// Flag was already set; nothing was read or written
    pub already_completed: bool,
    /// Another pass was running; this call did nothing
    pub already_running: bool,
    pub migrated: Vec<MigratedCategory>,
    pub skipped: Vec<SkippedCategory>,
    pub failed: Vec<FailedCategory>,
    pub completion_flag_set: bool,
}

impl MigrationReport {
    #[must_use]
    pub fn rows_migrated(&self) -> usize {
        self.migrated.iter().map(|m| m.rows).sum()
    }

    /// Whether the pass did real work.
    #[must_use]
    pub fn performed(&self) -> bool {
        !self.already_completed && !self.already_running
    }
}

pub struct MigrationEngine {
    kv: Arc<dyn KeyValueStore>,
    remote: Arc<dyn CanonicalStore>,
    catalog: Arc<Catalog>,
    namespace: KeyNamespace,
    gate: MigrationGate,
    in_flight: AtomicBool,
}

struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl MigrationEngine {
    pub fn new(
        kv: Arc<dyn KeyValueStore>,
        remote: Arc<dyn CanonicalStore>,
        catalog: Arc<Catalog>,
        namespace: KeyNamespace,
    ) -> Self {
        let gate = MigrationGate::new(kv.clone(), &namespace);
        Self {
            kv,
            remote,
            catalog,
            namespace,
            gate,
            in_flight: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn gate(&self) -> &MigrationGate {
        &self.gate
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.gate.is_complete()
    }

    /// Diagnostic override: the next pass migrates again.
    pub fn clear_completion_flag(&self) -> Result<(), KvError> {
        self.gate.clear()?;
        tracing::info!("Migration completion flag cleared");
        Ok(())
    }

    /// Migrate every catalog category. Never fails; see the report.
    pub async fn migrate_all_master_data(&self) -> MigrationReport {
        if self.gate.is_complete() {
            tracing::debug!("Master data migration already completed, skipping");
            return MigrationReport {
                already_completed: true,
                ..MigrationReport::default()
            };
        }
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("Master data migration already running");
            return MigrationReport {
                already_running: true,
                ..MigrationReport::default()
            };
        }
        let _guard = InFlight(&self.in_flight);
        // A pass that finished between the first check and the guard.
        if self.gate.is_complete() {
            return MigrationReport {
                already_completed: true,
                ..MigrationReport::default()
            };
        }

        let mut report = MigrationReport::default();
        for def in self.catalog.iter() {
            self.migrate_category(def, &mut report).await;
        }

        match self.gate.mark_complete() {
            Ok(()) => report.completion_flag_set = true,
            Err(e) => {
                tracing::error!("Failed to set migration completion flag: {}", e);
                report.failed.push(FailedCategory {
                    category: self.gate.key().to_string(),
                    error: e.to_string(),
                });
            }
        }

        tracing::info!(
            "Master data migration finished: {} migrated, {} skipped, {} failed",
            report.migrated.len(),
            report.skipped.len(),
            report.failed.len()
        );
        report
    }

    /// User-triggered re-run: clears the flag first and surfaces total failure.
    pub async fn run_manual(&self) -> Result<MigrationReport, AppError> {
        if self.in_flight.load(Ordering::SeqCst) {
            return Err(AppError::migration_in_progress());
        }
        self.gate.clear()?;
        let report = self.migrate_all_master_data().await;
        if report.already_running {
            return Err(AppError::migration_in_progress());
        }
        if !report.failed.is_empty() && report.migrated.is_empty() {
            let detail = report
                .failed
                .iter()
                .map(|f| format!("{}: {}", f.category, f.error))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(AppError::migration_failed(detail));
        }
        Ok(report)
    }

    async fn migrate_category(&self, def: &CategoryDef, report: &mut MigrationReport) {
        let key = self.namespace.legacy_key(&def.name);
        let fail = |report: &mut MigrationReport, error: String| {
            tracing::warn!("Migration of {} failed: {}", key, error);
            report.failed.push(FailedCategory {
                category: def.name.clone(),
                error,
            });
        };

        let value = match read_value(self.kv.as_ref(), &key) {
            Ok(RawValue::Parsed(v)) => v,
            Ok(RawValue::Absent) => {
                tracing::info!("Migration of {}: no legacy data", key);
                report.skipped.push(SkippedCategory {
                    category: def.name.clone(),
                    reason: "no legacy data".to_string(),
                });
                return;
            }
            Ok(RawValue::Unparsable(_)) => {
                fail(report, "stored value is not valid JSON".to_string());
                return;
            }
            Err(e) => {
                fail(report, e.to_string());
                return;
            }
        };

        let items = match normalize(value, def.shape) {
            Ok(n) => n.items,
            Err(e) => {
                fail(report, e.to_string());
                return;
            }
        };
        if items.is_empty() {
            tracing::info!("Migration of {}: empty collection", key);
            report.skipped.push(SkippedCategory {
                category: def.name.clone(),
                reason: "empty collection".to_string(),
            });
            return;
        }

        let present: HashSet<String> = match self.remote.select(&def.table, &[], None).await {
            Ok(rows) => rows.iter().filter_map(row_id).collect(),
            Err(e) => {
                tracing::error!("Canonical read of {} failed: {}", def.table, e);
                fail(report, e.to_string());
                return;
            }
        };
        let total = items.len();
        let rows: Vec<Row> = items
            .into_iter()
            .enumerate()
            .map(|(i, item)| to_canonical_row(&def.name, item, i))
            .filter(|row| !matches!(row_id(row), Some(id) if present.contains(&id)))
            .collect();
        let already_present = total - rows.len();
        if rows.is_empty() {
            tracing::info!("Migration of {}: all {} rows already in {}", key, total, def.table);
            report.skipped.push(SkippedCategory {
                category: def.name.clone(),
                reason: "already in canonical store".to_string(),
            });
            return;
        }

        let count = rows.len();
        match self.remote.insert(&def.table, rows).await {
            Ok(stored) => {
                tracing::info!("Migrated {} rows from {} into {}", stored.len(), key, def.table);
                report.migrated.push(MigratedCategory {
                    category: def.name.clone(),
                    table: def.table.clone(),
                    rows: count,
                    already_present,
                });
            }
            Err(e) => {
                tracing::error!("Canonical insert into {} failed: {}", def.table, e);
                fail(report, e.to_string());
            }
        }
    }
}

/// Map one stored item of `category` to a canonical row.
///
/// Strings become `{ id, name, is_active, display_order }`. Records keep their
/// fields (relation pointers included) with `isActive` renamed. Items without
/// an id get `<category>:<position>`.
#[must_use]
pub fn to_canonical_row(category: &str, item: Value, position: usize) -> Row {
    let mut row = match item {
        Value::Object(map) => map,
        Value::String(name) => {
            let mut map = Map::new();
            map.insert("name".to_string(), Value::String(name));
            map
        }
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        }
    };
    if let Some(active) = row.remove("isActive") {
        row.entry("is_active").or_insert(active);
    }
    row.entry("is_active").or_insert(Value::Bool(true));
    row.entry("display_order").or_insert(Value::from(position));
    if row_id(&row).is_none() {
        row.insert("id".to_string(), Value::String(format!("{category}:{position}")));
    }
    row
}

/// Inverse of [`to_canonical_row`] for reading a table back as a collection.
#[must_use]
pub fn from_canonical_rows(rows: Vec<Row>, shape: ItemShape) -> Vec<Value> {
    rows.into_iter()
        .filter_map(|row| match shape {
            ItemShape::Strings => row.get("name").filter(|v| v.is_string()).cloned(),
            ItemShape::Records | ItemShape::Any => Some(Value::Object(row)),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKvStore;
    use crate::remote::MemoryCanonicalStore;
    use serde_json::json;

    fn engine(
        kv: &Arc<MemoryKvStore>,
        remote: &Arc<MemoryCanonicalStore>,
    ) -> MigrationEngine {
        MigrationEngine::new(
            kv.clone(),
            remote.clone(),
            Arc::new(Catalog::builtin()),
            KeyNamespace::default(),
        )
    }

    fn all_tables() -> MemoryCanonicalStore {
        MemoryCanonicalStore::with_tables(Catalog::builtin().names())
    }

    #[tokio::test]
    async fn test_second_pass_is_a_noop() {
        let kv = Arc::new(MemoryKvStore::with_entries([(
            "master_data_countries",
            r#"["India","Germany"]"#,
        )]));
        let remote = Arc::new(all_tables());
        let engine = engine(&kv, &remote);

        let first = engine.migrate_all_master_data().await;
        assert_eq!(first.rows_migrated(), 2);
        assert!(first.completion_flag_set);
        assert!(engine.is_complete());

        let second = engine.migrate_all_master_data().await;
        assert!(second.already_completed);
        assert_eq!(remote.insert_calls(), 1);
    }

    #[tokio::test]
    async fn test_envelope_and_records_are_mapped() {
        let kv = Arc::new(MemoryKvStore::with_entries([(
            "master_data_currencies",
            r#"{"data":[{"id":"USD","name":"US Dollar","isActive":false}],"version":1}"#,
        )]));
        let remote = Arc::new(all_tables());
        engine(&kv, &remote).migrate_all_master_data().await;

        let rows = remote.rows("currencies");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("is_active"), Some(&json!(false)));
        assert!(!rows[0].contains_key("isActive"));
        assert_eq!(rows[0].get("display_order"), Some(&json!(0)));
    }

    #[tokio::test]
    async fn test_remote_failure_does_not_abort_batch() {
        let kv = Arc::new(MemoryKvStore::with_entries([
            ("master_data_countries", r#"["India"]"#),
            ("master_data_reward_types", r#"["Monetary"]"#),
        ]));
        let remote = Arc::new(all_tables());
        remote.fail_table("countries");

        let report = engine(&kv, &remote).migrate_all_master_data().await;
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].category, "countries");
        assert_eq!(report.migrated.len(), 1);
        assert!(report.completion_flag_set);
    }

    #[tokio::test]
    async fn test_run_manual_clears_flag_and_reports_total_failure() {
        let kv = Arc::new(MemoryKvStore::with_entries([(
            "master_data_countries",
            "not-json",
        )]));
        let remote = Arc::new(all_tables());
        let engine = engine(&kv, &remote);
        engine.gate().mark_complete().unwrap_or_else(|e| panic!("{e}"));

        let err = engine
            .run_manual()
            .await
            .err()
            .unwrap_or_else(|| panic!("expected failure"));
        assert_eq!(err.code, crate::error::ErrorCode::MIGRATION_FAILED);
        assert!(err.retryable);
        // The pass still completed and set the flag.
        assert!(engine.is_complete());
    }

    #[test]
    fn test_rows_read_back_as_strings() {
        let rows = vec![
            to_canonical_row("entity_types", json!("Trust"), 0),
            to_canonical_row("entity_types", json!("Society"), 1),
        ];
        assert_eq!(
            from_canonical_rows(rows, ItemShape::Strings),
            vec![json!("Trust"), json!("Society")]
        );
    }

    #[test]
    fn test_string_item_row() {
        let row = to_canonical_row("entity_types", json!("Trust"), 3);
        assert_eq!(
            Value::Object(row),
            json!({"name": "Trust", "is_active": true, "display_order": 3, "id": "entity_types:3"})
        );
    }

    #[test]
    fn test_record_keeps_its_own_id() {
        let row = to_canonical_row("currencies", json!({"id": "USD", "name": "US Dollar"}), 0);
        assert_eq!(row.get("id"), Some(&json!("USD")));
    }

    #[tokio::test]
    async fn test_forced_rerun_does_not_duplicate_rows() -> Result<(), AppError> {
        let kv = Arc::new(MemoryKvStore::with_entries([(
            "master_data_countries",
            r#"["India","Germany"]"#,
        )]));
        let remote = Arc::new(all_tables());
        let engine = engine(&kv, &remote);

        engine.migrate_all_master_data().await;
        let forced = engine.run_manual().await?;
        assert!(forced.performed());
        assert!(forced.failed.is_empty());
        assert!(forced
            .skipped
            .iter()
            .any(|s| s.category == "countries" && s.reason == "already in canonical store"));
        assert_eq!(remote.rows("countries").len(), 2);
        assert_eq!(remote.insert_calls(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_rerun_adds_only_new_items() {
        let kv = Arc::new(MemoryKvStore::with_entries([(
            "master_data_countries",
            r#"["India"]"#,
        )]));
        let remote = Arc::new(all_tables());
        let engine = engine(&kv, &remote);
        engine.migrate_all_master_data().await;

        kv.set("master_data_countries", r#"["India","Japan"]"#)
            .unwrap_or_else(|e| panic!("{e}"));
        engine
            .clear_completion_flag()
            .unwrap_or_else(|e| panic!("{e}"));
        let report = engine.migrate_all_master_data().await;
        assert_eq!(report.migrated.len(), 1);
        assert_eq!(report.migrated[0].rows, 1);
        assert_eq!(report.migrated[0].already_present, 1);
        assert_eq!(remote.rows("countries").len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_passes_migrate_once() {
        let kv = Arc::new(MemoryKvStore::with_entries([(
            "master_data_countries",
            r#"["India"]"#,
        )]));
        let remote = Arc::new(all_tables().with_latency(std::time::Duration::from_millis(20)));
        let engine = Arc::new(engine(&kv, &remote));

        let first = tokio::spawn({
            let engine = engine.clone();
            async move { engine.migrate_all_master_data().await }
        });
        let second = tokio::spawn({
            let engine = engine.clone();
            async move { engine.migrate_all_master_data().await }
        });
        let (first, second) = (
            first.await.unwrap_or_else(|e| panic!("{e}")),
            second.await.unwrap_or_else(|e| panic!("{e}")),
        );

        let performed = [&first, &second].iter().filter(|r| r.performed()).count();
        assert_eq!(performed, 1);
        assert_eq!(remote.rows("countries").len(), 1);
    }
}
