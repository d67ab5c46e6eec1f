//! Mode-aware load and save of master-data categories.
//!
//! In `mixed` mode the legacy key is authoritative and anything missing,
//! empty or unreadable is replaced by the category defaults (and persisted).
//! In `custom_only` mode the custom key is authoritative; a stored `[]` is a
//! deliberate answer and is never replaced. Problems that were healed along
//! the way come back as [`HealthIssue`]s next to the value.

use std::mem::discriminant;
use std::sync::Arc;

use serde_json::Value;

use crate::catalog::{Catalog, CategoryDef, CustomFallback};
use crate::config::KeyNamespace;
use crate::envelope::{normalize, ItemShape, Normalized};
use crate::error::{AppError, Healed, HealthIssue, IssueKind};
use crate::kv::{read_value, write_value, KeyValueStore, RawValue};
use crate::migration::{from_canonical_rows, MigrationGate};
use crate::mode::ModeResolver;
use crate::remote::{CanonicalStore, Order};

pub struct CategoryStore {
    kv: Arc<dyn KeyValueStore>,
    catalog: Arc<Catalog>,
    namespace: KeyNamespace,
    mode: ModeResolver,
    gate: MigrationGate,
}

impl CategoryStore {
    pub fn new(kv: Arc<dyn KeyValueStore>, catalog: Arc<Catalog>, namespace: KeyNamespace) -> Self {
        let mode = ModeResolver::new(kv.clone(), &namespace);
        let gate = MigrationGate::new(kv.clone(), &namespace);
        Self {
            kv,
            catalog,
            namespace,
            mode,
            gate,
        }
    }

    #[must_use]
    pub fn mode(&self) -> &ModeResolver {
        &self.mode
    }

    #[must_use]
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Key holding the authoritative copy of `def` under the current mode.
    #[must_use]
    pub fn authoritative_key(&self, def: &CategoryDef) -> String {
        if self.mode.is_custom_only() {
            self.namespace.custom_key(&def.name)
        } else {
            self.namespace.legacy_key(&def.name)
        }
    }

    fn def(&self, name: &str) -> Result<&CategoryDef, AppError> {
        self.catalog
            .get(name)
            .ok_or_else(|| AppError::unknown_category(name))
    }

    /// Load a category, healing what can be healed.
    ///
    /// Fails only for unknown categories or a storage backend that refuses
    /// reads.
    pub fn load(&self, name: &str) -> Result<Healed<Vec<Value>>, AppError> {
        let def = self.def(name)?;
        if self.mode.is_custom_only() {
            self.load_custom(def)
        } else {
            self.load_mixed(def)
        }
    }

    fn load_custom(&self, def: &CategoryDef) -> Result<Healed<Vec<Value>>, AppError> {
        let key = self.namespace.custom_key(&def.name);
        let mut issues = Vec::new();

        if let Some(items) = self.read_collection(&key, def.shape, &mut issues)? {
            return Ok(Healed::new(items, issues));
        }

        // Custom key absent or unusable: fall back without touching storage.
        let legacy_key = self.namespace.legacy_key(&def.name);
        let legacy = match read_value(self.kv.as_ref(), &legacy_key)? {
            RawValue::Parsed(v) => normalize(v, def.shape).ok().map(|n| n.items),
            RawValue::Absent | RawValue::Unparsable(_) => None,
        };
        let items = match legacy {
            Some(items) if !items.is_empty() => items,
            _ => match def.fallback {
                CustomFallback::LegacyOnly => Vec::new(),
                CustomFallback::LegacyThenDefaults => def.defaults.clone(),
            },
        };
        Ok(Healed::new(items, issues))
    }

    fn load_mixed(&self, def: &CategoryDef) -> Result<Healed<Vec<Value>>, AppError> {
        let key = self.namespace.legacy_key(&def.name);
        let mut issues = Vec::new();

        match self.read_collection(&key, def.shape, &mut issues)? {
            Some(items) if !items.is_empty() => return Ok(Healed::new(items, issues)),
            Some(_) if def.defaults.is_empty() => return Ok(Healed::new(Vec::new(), issues)),
            Some(_) => issues.push(HealthIssue::new(
                IssueKind::Missing,
                &key,
                "empty collection replaced by defaults",
            )),
            None => {
                if issues.is_empty() {
                    issues.push(HealthIssue::new(
                        IssueKind::Missing,
                        &key,
                        "no stored data, seeded defaults",
                    ));
                }
            }
        }

        let defaults = def.defaults.clone();
        if let Err(e) = write_value(self.kv.as_ref(), &key, &Value::Array(defaults.clone())) {
            tracing::warn!("Could not persist defaults for {}: {}", key, e);
            issues.push(HealthIssue::new(IssueKind::Storage, &key, e.to_string()));
        }
        Ok(Healed::new(defaults, issues))
    }

    /// Read and normalize `key`.
    ///
    /// `Some(items)` when the key holds a usable collection (possibly
    /// empty). An envelope or duplicate ids are rewritten raw in place.
    /// `None` when absent or unusable, with the reason pushed to `issues`.
    fn read_collection(
        &self,
        key: &str,
        shape: ItemShape,
        issues: &mut Vec<HealthIssue>,
    ) -> Result<Option<Vec<Value>>, AppError> {
        let value = match read_value(self.kv.as_ref(), key)? {
            RawValue::Absent => return Ok(None),
            RawValue::Unparsable(_) => {
                tracing::warn!("Stored value for {} is not valid JSON", key);
                issues.push(HealthIssue::new(IssueKind::Parse, key, "not valid JSON"));
                return Ok(None);
            }
            RawValue::Parsed(v) => v,
        };

        match normalize(value, shape) {
            Ok(normalized) => {
                self.rewrite_if_needed(key, &normalized, issues);
                Ok(Some(normalized.items))
            }
            Err(e) => {
                tracing::warn!("Stored value for {} has the wrong shape: {}", key, e);
                issues.push(HealthIssue::new(IssueKind::Parse, key, e.to_string()));
                Ok(None)
            }
        }
    }

    fn rewrite_if_needed(&self, key: &str, normalized: &Normalized, issues: &mut Vec<HealthIssue>) {
        if !normalized.needs_rewrite() {
            return;
        }
        if normalized.was_wrapped {
            issues.push(HealthIssue::new(
                IssueKind::Envelope,
                key,
                "legacy envelope unwrapped",
            ));
        }
        if normalized.duplicates_dropped > 0 {
            issues.push(HealthIssue::new(
                IssueKind::Duplicate,
                key,
                format!("{} duplicate items dropped", normalized.duplicates_dropped),
            ));
        }
        let raw = Value::Array(normalized.items.clone());
        if let Err(e) = write_value(self.kv.as_ref(), key, &raw) {
            tracing::warn!("Could not rewrite {} in raw form: {}", key, e);
            issues.push(HealthIssue::new(IssueKind::Storage, key, e.to_string()));
        }
    }

    /// Persist `items` to the authoritative namespace and verify the write.
    ///
    /// Items that do not fit the category shape are rejected before anything
    /// is written; duplicate ids are dropped (first wins). A verification
    /// mismatch is logged and reported, never retried.
    pub fn save(&self, name: &str, items: &[Value]) -> Result<(), Vec<HealthIssue>> {
        let Some(def) = self.catalog.get(name) else {
            return Err(vec![HealthIssue::new(
                IssueKind::UnknownCategory,
                name,
                "unknown category",
            )]);
        };
        let key = self.authoritative_key(def);
        let items = match normalize(Value::Array(items.to_vec()), def.shape) {
            Ok(n) => {
                if n.duplicates_dropped > 0 {
                    tracing::warn!("Dropped {} duplicate ids saving {}", n.duplicates_dropped, key);
                }
                n.items
            }
            Err(e) => {
                tracing::warn!("Rejected save of {}: {}", key, e);
                return Err(vec![HealthIssue::new(IssueKind::Parse, &key, e.to_string())]);
            }
        };
        let payload = Value::Array(items.clone());

        if let Err(e) = write_value(self.kv.as_ref(), &key, &payload) {
            tracing::error!("Write of {} failed: {}", key, e);
            return Err(vec![HealthIssue::new(IssueKind::Storage, &key, e.to_string())]);
        }

        match read_value(self.kv.as_ref(), &key) {
            Ok(RawValue::Parsed(Value::Array(stored))) if same_shape(&stored, &items) => Ok(()),
            Ok(other) => {
                tracing::error!(
                    "Write verification failed for {}: expected {} items, read back {:?}",
                    key,
                    items.len(),
                    other
                );
                Err(vec![HealthIssue::new(
                    IssueKind::WriteVerification,
                    &key,
                    "stored value does not match what was written",
                )])
            }
            Err(e) => {
                tracing::error!("Write verification read of {} failed: {}", key, e);
                Err(vec![HealthIssue::new(
                    IssueKind::WriteVerification,
                    &key,
                    e.to_string(),
                )])
            }
        }
    }

    /// Prefer the canonical store once migration has completed in `mixed`
    /// mode. Any remote failure falls back to [`CategoryStore::load`].
    pub async fn load_canonical(
        &self,
        name: &str,
        remote: &dyn CanonicalStore,
    ) -> Result<Healed<Vec<Value>>, AppError> {
        let def = self.def(name)?;
        if self.mode.is_custom_only() || !self.gate.is_complete() {
            return self.load(name);
        }

        match remote
            .select(&def.table, &[], Some(&Order::asc("display_order")))
            .await
        {
            Ok(rows) if !rows.is_empty() => Ok(Healed::clean(from_canonical_rows(rows, def.shape))),
            Ok(_) => self.load(name),
            Err(e) => {
                tracing::error!("Canonical read of {} failed: {}", def.table, e);
                let mut healed = self.load(name)?;
                healed.issues.push(HealthIssue::new(
                    IssueKind::Remote,
                    &def.table,
                    e.to_string(),
                ));
                Ok(healed)
            }
        }
    }
}

fn same_shape(stored: &[Value], written: &[Value]) -> bool {
    stored.len() == written.len()
        && stored
            .iter()
            .zip(written)
            .all(|(a, b)| discriminant(a) == discriminant(b))
}
