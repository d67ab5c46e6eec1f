//! Storage mode resolution for master-data categories.
//!
//! `mixed`: legacy per-key storage is authoritative and missing data is
//! replaced by built-in defaults. `custom_only`: the custom namespace is
//! authoritative and an explicit empty collection is a final answer.
//!
//! The resolver only ever touches the mode flag key.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::KeyNamespace;
use crate::kv::{KeyValueStore, KvError};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageMode {
    #[default]
    Mixed,
    CustomOnly,
}

impl StorageMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mixed => "mixed",
            Self::CustomOnly => "custom_only",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().trim_matches('"') {
            "mixed" => Some(Self::Mixed),
            "custom_only" => Some(Self::CustomOnly),
            _ => None,
        }
    }
}

impl std::fmt::Display for StorageMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for StorageMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("unknown storage mode: {s}"))
    }
}

/// Reads and transitions the process-wide mode flag.
pub struct ModeResolver {
    kv: Arc<dyn KeyValueStore>,
    key: String,
}

impl ModeResolver {
    pub fn new(kv: Arc<dyn KeyValueStore>, namespace: &KeyNamespace) -> Self {
        Self {
            kv,
            key: namespace.mode_key.clone(),
        }
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Current mode. Absent, unreadable or unknown flags read as `mixed`.
    #[must_use]
    pub fn mode(&self) -> StorageMode {
        match self.kv.get(&self.key) {
            Ok(Some(raw)) => StorageMode::parse(&raw).unwrap_or_else(|| {
                tracing::warn!("Unknown storage mode flag {:?}, treating as mixed", raw);
                StorageMode::Mixed
            }),
            Ok(None) => StorageMode::Mixed,
            Err(e) => {
                tracing::warn!("Could not read storage mode flag: {}", e);
                StorageMode::Mixed
            }
        }
    }

    #[must_use]
    pub fn is_custom_only(&self) -> bool {
        self.mode() == StorageMode::CustomOnly
    }

    /// Move to `custom_only`. Returns `true` when the flag actually changed.
    pub fn set_custom_only(&self) -> Result<bool, KvError> {
        if self.is_custom_only() {
            return Ok(false);
        }
        self.kv.set(&self.key, StorageMode::CustomOnly.as_str())?;
        tracing::info!("Storage mode switched to custom_only");
        Ok(true)
    }

    /// Administrative reset back to `mixed`. Never called implicitly.
    pub fn reset_to_defaults(&self) -> Result<(), KvError> {
        self.kv.set(&self.key, StorageMode::Mixed.as_str())?;
        tracing::info!("Storage mode reset to mixed");
        Ok(())
    }

    /// `false` when the flag holds something other than a known mode.
    #[must_use]
    pub fn flag_is_sane(&self) -> bool {
        match self.kv.get(&self.key) {
            Ok(Some(raw)) => StorageMode::parse(&raw).is_some(),
            Ok(None) => true,
            Err(_) => false,
        }
    }
}
