//! Administrative cleanup of master-data keys.

use serde::Serialize;
use serde_json::Value;

use crate::catalog::Catalog;
use crate::config::KeyNamespace;
use crate::envelope::normalize;
use crate::kv::{read_value, write_value, KeyValueStore, KvError, RawValue};
use crate::mode::ModeResolver;

/// Suffixes left behind by earlier schema versions.
const STALE_SUFFIXES: &[&str] = &["_backup", "_old", "_temp", "_v1", "_v2"];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub removed: Vec<String>,
    pub reseeded: Vec<String>,
    pub errors: Vec<String>,
}

impl CleanupReport {
    fn remove(&mut self, kv: &dyn KeyValueStore, key: String) {
        match kv.remove(&key) {
            Ok(()) => self.removed.push(key),
            Err(e) => {
                tracing::warn!("Could not remove {}: {}", key, e);
                self.errors.push(format!("{key}: {e}"));
            }
        }
    }
}

/// Remove every legacy and custom master-data key. Flags are kept.
pub fn clear_master_data(kv: &dyn KeyValueStore, namespace: &KeyNamespace) -> Result<CleanupReport, KvError> {
    let mut report = CleanupReport::default();
    for key in kv.keys()? {
        if namespace.is_legacy_data_key(&key) || namespace.is_custom_data_key(&key) {
            report.remove(kv, key);
        }
    }
    tracing::info!("Cleared {} master-data keys", report.removed.len());
    Ok(report)
}

/// Remove only custom-namespace keys.
pub fn clear_custom_data(kv: &dyn KeyValueStore, namespace: &KeyNamespace) -> Result<CleanupReport, KvError> {
    let mut report = CleanupReport::default();
    for key in kv.keys()? {
        if namespace.is_custom_data_key(&key) {
            report.remove(kv, key);
        }
    }
    tracing::info!("Cleared {} custom keys", report.removed.len());
    Ok(report)
}

/// Remove leftovers of earlier schema versions.
///
/// Alias keys are only removed once the primary key holds valid data, so a
/// still-needed repair source is never lost.
pub fn remove_stale_keys(
    kv: &dyn KeyValueStore,
    namespace: &KeyNamespace,
    catalog: &Catalog,
) -> Result<CleanupReport, KvError> {
    let mut report = CleanupReport::default();
    for key in kv.keys()? {
        if namespace.is_flag_key(&key) {
            continue;
        }
        let owned = key.starts_with(&namespace.legacy_prefix) || key.starts_with(&namespace.custom_prefix);
        if owned && STALE_SUFFIXES.iter().any(|s| key.ends_with(s)) {
            report.remove(kv, key);
            continue;
        }
        if let Some(def) = catalog.alias_owner(&key) {
            let primary = namespace.legacy_key(&def.name);
            let primary_ok = matches!(
                read_value(kv, &primary),
                Ok(RawValue::Parsed(v)) if normalize(v.clone(), def.shape).is_ok_and(|n| !n.items.is_empty())
            );
            if primary_ok {
                report.remove(kv, key);
            }
        }
    }
    tracing::info!("Removed {} stale keys", report.removed.len());
    Ok(report)
}

/// Explicit administrative reset: back to `mixed`, custom data removed and
/// legacy keys reseeded with defaults.
pub fn reset_to_defaults(
    kv: &dyn KeyValueStore,
    mode: &ModeResolver,
    catalog: &Catalog,
    namespace: &KeyNamespace,
) -> Result<CleanupReport, KvError> {
    mode.reset_to_defaults()?;
    let mut report = clear_custom_data(kv, namespace)?;
    for def in catalog.iter() {
        let key = namespace.legacy_key(&def.name);
        match write_value(kv, &key, &Value::Array(def.defaults.clone())) {
            Ok(()) => report.reseeded.push(key),
            Err(e) => report.errors.push(format!("{key}: {e}")),
        }
    }
    tracing::info!("Master data reset to defaults ({} categories)", report.reseeded.len());
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKvStore;
    use crate::mode::StorageMode;
    use std::sync::Arc;

    #[test]
    fn test_clear_keeps_flags_and_foreign_keys() -> Result<(), KvError> {
        let kv = MemoryKvStore::with_entries([
            ("master_data_countries", "[]"),
            ("custom_entityTypes", "[]"),
            ("master_data_mode", "custom_only"),
            ("master_data_migration_completed", "true"),
            ("portal_session", "{}"),
        ]);
        let ns = KeyNamespace::default();

        let report = clear_custom_data(&kv, &ns)?;
        assert_eq!(report.removed, vec!["custom_entityTypes".to_string()]);

        clear_master_data(&kv, &ns)?;
        assert_eq!(
            kv.keys()?,
            vec![
                "master_data_migration_completed".to_string(),
                "master_data_mode".to_string(),
                "portal_session".to_string()
            ]
        );
        Ok(())
    }

    #[test]
    fn test_stale_keys_and_aliases() -> Result<(), KvError> {
        let kv = MemoryKvStore::with_entries([
            ("master_data_countries_backup", "[]"),
            ("custom_currencies_v1", "[]"),
            ("master_data_entity_types", r#"["Trust"]"#),
            ("master_data_entityTypes", r#"["Trust"]"#),
            ("master_data_organizationTypes", r#"["Start-up"]"#),
            ("report_old", "x"),
        ]);
        let report = remove_stale_keys(&kv, &KeyNamespace::default(), &Catalog::builtin())?;
        assert_eq!(
            report.removed,
            vec![
                "custom_currencies_v1".to_string(),
                "master_data_countries_backup".to_string(),
                "master_data_entityTypes".to_string()
            ]
        );
        // Primary organization_types is absent, so its alias stays.
        assert!(kv.contains("master_data_organizationTypes")?);
        assert!(kv.contains("report_old")?);
        Ok(())
    }

    #[test]
    fn test_reset_to_defaults() -> Result<(), KvError> {
        let kv = Arc::new(MemoryKvStore::with_entries([
            ("master_data_mode", "custom_only"),
            ("custom_entityTypes", "[]"),
        ]));
        let ns = KeyNamespace::default();
        let mode = ModeResolver::new(kv.clone(), &ns);
        let catalog = Catalog::builtin();

        let report = reset_to_defaults(kv.as_ref(), &mode, &catalog, &ns)?;
        assert_eq!(mode.mode(), StorageMode::Mixed);
        assert_eq!(kv.get("custom_entityTypes")?, None);
        assert_eq!(report.reseeded.len(), catalog.len());
        assert!(kv.contains("master_data_reward_types")?);
        Ok(())
    }
}
