//! Runtime configuration: persisted key names, session lifetimes and
//! monitor intervals.
//!
//! Every field has a default, so an empty file (or no file) is a valid
//! configuration. Files ending in `.json` are parsed as JSON, everything else
//! as YAML.

use std::fs;
use std::path::Path;
use std::time::Duration as StdDuration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid YAML config: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid JSON config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid config value: {0}")]
    Invalid(String),
}

/// Names of every persisted key the kernel owns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyNamespace {
    /// Prefix of legacy per-category keys (`master_data_<category>`)
    pub legacy_prefix: String,
    /// Prefix of custom-only keys (`custom_<camelCaseCategory>`)
    pub custom_prefix: String,
    pub mode_key: String,
    pub migration_flag_key: String,
    pub session_key: String,
    pub remember_me_key: String,
    pub organizations_key: String,
}

impl Default for KeyNamespace {
    fn default() -> Self {
        Self {
            legacy_prefix: "master_data_".to_string(),
            custom_prefix: "custom_".to_string(),
            mode_key: "master_data_mode".to_string(),
            migration_flag_key: "master_data_migration_completed".to_string(),
            session_key: "portal_session".to_string(),
            remember_me_key: "portal_remember_me".to_string(),
            organizations_key: "registered_organizations".to_string(),
        }
    }
}

impl KeyNamespace {
    #[must_use]
    pub fn legacy_key(&self, category: &str) -> String {
        format!("{}{}", self.legacy_prefix, category)
    }

    #[must_use]
    pub fn custom_key(&self, category: &str) -> String {
        format!("{}{}", self.custom_prefix, camel_case(category))
    }

    /// Keys holding control flags rather than category data.
    #[must_use]
    pub fn is_flag_key(&self, key: &str) -> bool {
        key == self.mode_key || key == self.migration_flag_key
    }

    #[must_use]
    pub fn is_legacy_data_key(&self, key: &str) -> bool {
        key.starts_with(&self.legacy_prefix) && !self.is_flag_key(key)
    }

    #[must_use]
    pub fn is_custom_data_key(&self, key: &str) -> bool {
        key.starts_with(&self.custom_prefix) && !self.is_flag_key(key)
    }
}

/// `entity_types` -> `entityTypes`
#[must_use]
pub fn camel_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper_next = false;
    for ch in name.chars() {
        if ch == '_' || ch == '-' || ch == ' ' {
            upper_next = !out.is_empty();
            continue;
        }
        if upper_next {
            out.extend(ch.to_uppercase());
            upper_next = false;
        } else {
            out.push(ch);
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub session_ttl_secs: u64,
    pub remember_me_ttl_days: u64,
    pub revalidate_interval_secs: u64,
    /// Extra keys wiped on logout so tokens never leak across accounts.
    pub related_keys: Vec<String>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            session_ttl_secs: 8 * 60 * 60,
            remember_me_ttl_days: 30,
            revalidate_interval_secs: 60,
            related_keys: vec![
                "portal_auth_token".to_string(),
                "portal_current_user".to_string(),
                "portal_current_organization".to_string(),
                "portal_selected_membership".to_string(),
            ],
        }
    }
}

impl SessionSettings {
    #[must_use]
    pub fn session_ttl(&self) -> chrono::Duration {
        i64::try_from(self.session_ttl_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(chrono::Duration::MAX)
    }

    #[must_use]
    pub fn remember_me_ttl(&self) -> chrono::Duration {
        i64::try_from(self.remember_me_ttl_days)
            .ok()
            .and_then(chrono::Duration::try_days)
            .unwrap_or(chrono::Duration::MAX)
    }

    #[must_use]
    pub fn revalidate_interval(&self) -> StdDuration {
        StdDuration::from_secs(self.revalidate_interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    pub interval_secs: u64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self { interval_secs: 300 }
    }
}

impl HealthSettings {
    #[must_use]
    pub fn interval(&self) -> StdDuration {
        StdDuration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortalConfig {
    pub keys: KeyNamespace,
    pub session: SessionSettings,
    pub health: HealthSettings,
}

impl PortalConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));
        let config = if is_json {
            Self::from_json_str(&content)?
        } else {
            Self::from_yaml_str(&content)?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(content)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let keys = &self.keys;
        if keys.legacy_prefix.is_empty() || keys.custom_prefix.is_empty() {
            return Err(ConfigError::Invalid(
                "key prefixes must not be empty".to_string(),
            ));
        }
        if keys.legacy_prefix == keys.custom_prefix {
            return Err(ConfigError::Invalid(
                "legacy and custom prefixes must differ".to_string(),
            ));
        }
        for (name, value) in [
            ("mode_key", &keys.mode_key),
            ("migration_flag_key", &keys.migration_flag_key),
            ("session_key", &keys.session_key),
            ("remember_me_key", &keys.remember_me_key),
        ] {
            if value.is_empty() {
                return Err(ConfigError::Invalid(format!("{name} must not be empty")));
            }
        }
        if self.session.session_ttl_secs == 0 || self.session.revalidate_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "session durations must be positive".to_string(),
            ));
        }
        if self.session.remember_me_ttl_days == 0 {
            return Err(ConfigError::Invalid(
                "remember_me_ttl_days must be positive".to_string(),
            ));
        }
        if self.health.interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "health interval must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_camel_case() {
        assert_eq!(camel_case("entity_types"), "entityTypes");
        assert_eq!(camel_case("countries"), "countries");
        assert_eq!(camel_case("industry_segments"), "industrySegments");
        assert_eq!(camel_case("_leading"), "leading");
    }

    #[test]
    fn test_namespace_keys() {
        let ns = KeyNamespace::default();
        assert_eq!(ns.legacy_key("entity_types"), "master_data_entity_types");
        assert_eq!(ns.custom_key("entity_types"), "custom_entityTypes");
        assert!(ns.is_legacy_data_key("master_data_countries"));
        assert!(!ns.is_legacy_data_key("master_data_mode"));
        assert!(!ns.is_legacy_data_key("master_data_migration_completed"));
    }

    #[test]
    fn test_yaml_overrides_keep_defaults() -> Result<(), ConfigError> {
        let config = PortalConfig::from_yaml_str(
            "session:\n  session_ttl_secs: 3600\nkeys:\n  session_key: seeker_session\n",
        )?;
        config.validate()?;
        assert_eq!(config.session.session_ttl_secs, 3600);
        assert_eq!(config.session.revalidate_interval_secs, 60);
        assert_eq!(config.keys.session_key, "seeker_session");
        assert_eq!(config.keys.legacy_prefix, "master_data_");
        Ok(())
    }

    #[test]
    fn test_empty_yaml_is_default() -> Result<(), ConfigError> {
        assert_eq!(PortalConfig::from_yaml_str("  \n")?, PortalConfig::default());
        Ok(())
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let mut config = PortalConfig::default();
        config.session.revalidate_interval_secs = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_load_json_file() -> Result<(), Box<dyn std::error::Error>> {
        let temp = tempfile::TempDir::new()?;
        let path = temp.path().join("portal.json");
        fs::write(&path, r#"{"health": {"interval_secs": 120}}"#)?;
        let config = PortalConfig::load(&path)?;
        assert_eq!(config.health.interval_secs, 120);
        assert_eq!(config.session, SessionSettings::default());
        Ok(())
    }
}
