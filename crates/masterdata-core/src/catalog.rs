//! Fixed list of master-data categories and their built-in defaults.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::envelope::ItemShape;

/// What a `custom_only` read does when the custom key is absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CustomFallback {
    /// Use the legacy collection if one exists, otherwise an empty list
    LegacyOnly,
    /// Use the legacy collection, otherwise the built-in defaults (not persisted)
    LegacyThenDefaults,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryDef {
    /// Snake-case category name, e.g. `entity_types`
    pub name: String,
    /// Canonical store table receiving migrated rows
    pub table: String,
    pub shape: ItemShape,
    pub defaults: Vec<Value>,
    pub fallback: CustomFallback,
    /// Full key names written by earlier schema versions for the same data
    #[serde(default)]
    pub aliases: Vec<String>,
}

impl CategoryDef {
    pub fn new(name: impl Into<String>, shape: ItemShape, defaults: Vec<Value>) -> Self {
        let name = name.into();
        Self {
            table: name.clone(),
            name,
            shape,
            defaults,
            fallback: CustomFallback::LegacyOnly,
            aliases: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    #[must_use]
    pub fn with_fallback(mut self, fallback: CustomFallback) -> Self {
        self.fallback = fallback;
        self
    }

    #[must_use]
    pub fn with_alias(mut self, key: impl Into<String>) -> Self {
        self.aliases.push(key.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    categories: Vec<CategoryDef>,
}

impl Catalog {
    #[must_use]
    pub fn new(categories: Vec<CategoryDef>) -> Self {
        Self { categories }
    }

    /// Categories shipped with the portal, in migration order.
    #[must_use]
    pub fn builtin() -> Self {
        Self::new(vec![
            CategoryDef::new("countries", ItemShape::Strings, strings(&[
                "India",
                "United States",
                "United Kingdom",
                "Germany",
                "Singapore",
                "Australia",
            ]))
            .with_fallback(CustomFallback::LegacyThenDefaults),
            CategoryDef::new("currencies", ItemShape::Records, vec![
                json!({"id": "INR", "name": "Indian Rupee", "symbol": "₹", "isActive": true}),
                json!({"id": "USD", "name": "US Dollar", "symbol": "$", "isActive": true}),
                json!({"id": "EUR", "name": "Euro", "symbol": "€", "isActive": true}),
                json!({"id": "GBP", "name": "Pound Sterling", "symbol": "£", "isActive": true}),
            ])
            .with_fallback(CustomFallback::LegacyThenDefaults),
            CategoryDef::new("industry_segments", ItemShape::Records, vec![
                json!({"id": "seg-tech", "name": "Technology", "isActive": true}),
                json!({"id": "seg-health", "name": "Healthcare", "isActive": true}),
                json!({"id": "seg-fin", "name": "Financial Services", "isActive": true}),
                json!({"id": "seg-mfg", "name": "Manufacturing", "isActive": true}),
            ])
            .with_alias("master_data_industrySegments"),
            CategoryDef::new("reward_types", ItemShape::Strings, strings(&[
                "Monetary",
                "Non-Monetary",
                "Recognition",
            ])),
            CategoryDef::new("communication_types", ItemShape::Strings, strings(&[
                "Email",
                "Phone",
                "Video Call",
                "In Person",
            ])),
            CategoryDef::new("entity_types", ItemShape::Strings, strings(&[
                "Commercial",
                "Non-Profit Organization",
                "Society",
                "Trust",
            ]))
            .with_fallback(CustomFallback::LegacyThenDefaults)
            .with_alias("master_data_entityTypes"),
            CategoryDef::new("organization_types", ItemShape::Strings, strings(&[
                "Large Enterprise",
                "Medium Enterprise",
                "Small Enterprise",
                "Start-up",
                "Academic Institution",
            ]))
            .with_fallback(CustomFallback::LegacyThenDefaults)
            .with_alias("master_data_organizationTypes"),
            CategoryDef::new("engagement_models", ItemShape::Records, vec![
                json!({"id": "em-marketplace", "name": "Marketplace", "isActive": true}),
                json!({"id": "em-aggregator", "name": "Aggregator", "isActive": true}),
            ]),
            // Groups nest categories and sub-categories through *_id pointers.
            CategoryDef::new("domain_groups", ItemShape::Records, Vec::new()),
        ])
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&CategoryDef> {
        self.categories.iter().find(|c| c.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CategoryDef> {
        self.categories.iter()
    }

    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.categories.iter().map(|c| c.name.as_str()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.categories.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }

    /// Category owning `key` as an alias, if any.
    #[must_use]
    pub fn alias_owner(&self, key: &str) -> Option<&CategoryDef> {
        self.categories
            .iter()
            .find(|c| c.aliases.iter().any(|a| a == key))
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::builtin()
    }
}

fn strings(items: &[&str]) -> Vec<Value> {
    items.iter().map(|s| Value::String((*s).to_string())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_defaults_match_shapes() {
        let catalog = Catalog::builtin();
        for def in catalog.iter() {
            for item in &def.defaults {
                assert!(def.shape.accepts(item), "{}: {item}", def.name);
            }
        }
    }

    #[test]
    fn test_entity_type_defaults() {
        let catalog = Catalog::builtin();
        let def = catalog.get("entity_types").unwrap_or_else(|| panic!("entity_types missing"));
        assert_eq!(
            def.defaults,
            vec![
                json!("Commercial"),
                json!("Non-Profit Organization"),
                json!("Society"),
                json!("Trust")
            ]
        );
        assert_eq!(def.fallback, CustomFallback::LegacyThenDefaults);
    }

    #[test]
    fn test_fallback_policy_per_category() {
        let catalog = Catalog::builtin();
        let with_defaults: Vec<&str> = catalog
            .iter()
            .filter(|c| c.fallback == CustomFallback::LegacyThenDefaults)
            .map(|c| c.name.as_str())
            .collect();
        assert_eq!(
            with_defaults,
            vec!["countries", "currencies", "entity_types", "organization_types"]
        );
    }

    #[test]
    fn test_alias_lookup() {
        let catalog = Catalog::builtin();
        assert_eq!(
            catalog.alias_owner("master_data_entityTypes").map(|c| c.name.as_str()),
            Some("entity_types")
        );
        assert!(catalog.alias_owner("master_data_entity_types").is_none());
    }
}
