//! Key-value storage boundary.
//!
//! Every other component reads and writes persisted state through
//! [`KeyValueStore`], never through a concrete medium. Two implementations
//! ship with the crate:
//! - [`MemoryKvStore`]: process-local map, used by tests and embedders
//! - [`FileKvStore`]: a single JSON object file, rewritten atomically on every
//!   mutation with owner-only permissions

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde_json::Value;
use tempfile::NamedTempFile;
use thiserror::Error;

/// Permission mode for the backing file (owner rw only)
const FILE_PERMISSIONS: u32 = 0o600;

#[derive(Debug, Error)]
pub enum KvError {
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage file is corrupt: {0}")]
    Corrupt(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Contract every storage medium must satisfy.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, KvError>;
    fn set(&self, key: &str, value: &str) -> Result<(), KvError>;
    fn remove(&self, key: &str) -> Result<(), KvError>;
    fn keys(&self) -> Result<Vec<String>, KvError>;

    fn contains(&self, key: &str) -> Result<bool, KvError> {
        Ok(self.get(key)?.is_some())
    }
}

/// What a key holds once its text has been run through the JSON parser.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Absent,
    Parsed(Value),
    Unparsable(String),
}

impl RawValue {
    #[must_use]
    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }
}

/// Read a key and classify its content without ever failing on bad JSON.
pub fn read_value(kv: &dyn KeyValueStore, key: &str) -> Result<RawValue, KvError> {
    let Some(text) = kv.get(key)? else {
        return Ok(RawValue::Absent);
    };
    match serde_json::from_str::<Value>(&text) {
        Ok(value) => Ok(RawValue::Parsed(value)),
        Err(_) => Ok(RawValue::Unparsable(text)),
    }
}

/// Serialize `value` and store it under `key`.
pub fn write_value(kv: &dyn KeyValueStore, key: &str, value: &Value) -> Result<(), KvError> {
    let text = serde_json::to_string(value)?;
    kv.set(key, &text)
}

/// In-process store backed by an ordered map.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: RwLock<BTreeMap<String, String>>,
}

impl MemoryKvStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let map = entries
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self {
            entries: RwLock::new(map),
        }
    }

    /// Copy of every entry, for assertions and diagnostics.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.entries.read().clone()
    }
}

impl KeyValueStore for MemoryKvStore {
    fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), KvError> {
        self.entries
            .write()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), KvError> {
        self.entries.write().remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, KvError> {
        Ok(self.entries.read().keys().cloned().collect())
    }
}

/// Durable store keeping every key in one JSON object file.
///
/// The whole map is held in memory; each mutation rewrites the file through a
/// temporary sibling that is synced and then renamed over the original.
#[derive(Debug)]
pub struct FileKvStore {
    path: PathBuf,
    entries: RwLock<BTreeMap<String, String>>,
}

impl FileKvStore {
    /// Open an existing store file or start an empty one at `path`.
    pub fn open(path: &Path) -> Result<Self, KvError> {
        let entries = if path.exists() {
            let content = fs::read_to_string(path)?;
            if content.trim().is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_str::<BTreeMap<String, String>>(&content).map_err(|e| {
                    KvError::Corrupt(format!("{}: {}", path.display(), e))
                })?
            }
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            path: path.to_path_buf(),
            entries: RwLock::new(entries),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, entries: &BTreeMap<String, String>) -> Result<(), KvError> {
        let contents = serde_json::to_vec_pretty(entries)?;
        write_private_file(&self.path, &contents)
    }
}

impl KeyValueStore for FileKvStore {
    fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), KvError> {
        let mut entries = self.entries.write();
        let previous = entries.insert(key.to_string(), value.to_string());
        if let Err(e) = self.persist(&entries) {
            // Keep memory and disk in agreement when the write fails.
            match previous {
                Some(old) => entries.insert(key.to_string(), old),
                None => entries.remove(key),
            };
            return Err(e);
        }
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), KvError> {
        let mut entries = self.entries.write();
        let Some(previous) = entries.remove(key) else {
            return Ok(());
        };
        if let Err(e) = self.persist(&entries) {
            entries.insert(key.to_string(), previous);
            return Err(e);
        }
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, KvError> {
        Ok(self.entries.read().keys().cloned().collect())
    }
}

fn write_private_file(path: &Path, contents: &[u8]) -> Result<(), KvError> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)?;

    let mut temp = NamedTempFile::new_in(&parent)?;
    temp.write_all(contents)?;
    temp.as_file().sync_all()?;
    #[cfg(unix)]
    {
        temp.as_file()
            .set_permissions(fs::Permissions::from_mode(FILE_PERMISSIONS))?;
    }

    temp.persist(path).map_err(|e| KvError::Io(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_memory_store_roundtrip() -> Result<(), KvError> {
        let kv = MemoryKvStore::new();
        assert_eq!(kv.get("a")?, None);
        kv.set("a", "1")?;
        kv.set("b", "2")?;
        assert_eq!(kv.get("a")?.as_deref(), Some("1"));
        assert_eq!(kv.keys()?, vec!["a".to_string(), "b".to_string()]);
        kv.remove("a")?;
        assert!(!kv.contains("a")?);
        Ok(())
    }

    #[test]
    fn test_read_value_classifies_content() -> Result<(), KvError> {
        let kv = MemoryKvStore::with_entries([("good", "[1,2]"), ("bad", "not-json")]);
        assert_eq!(read_value(&kv, "missing")?, RawValue::Absent);
        assert_eq!(
            read_value(&kv, "good")?,
            RawValue::Parsed(serde_json::json!([1, 2]))
        );
        assert_eq!(
            read_value(&kv, "bad")?,
            RawValue::Unparsable("not-json".to_string())
        );
        Ok(())
    }

    #[test]
    fn test_file_store_persists_across_reopen() -> Result<(), Box<dyn std::error::Error>> {
        let temp = TempDir::new()?;
        let path = temp.path().join("storage.json");

        let kv = FileKvStore::open(&path)?;
        kv.set("master_data_mode", "custom_only")?;
        kv.set("custom_entityTypes", "[]")?;
        kv.remove("custom_entityTypes")?;
        drop(kv);

        let reopened = FileKvStore::open(&path)?;
        assert_eq!(
            reopened.get("master_data_mode")?.as_deref(),
            Some("custom_only")
        );
        assert_eq!(reopened.get("custom_entityTypes")?, None);
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn test_file_store_is_owner_only() -> Result<(), Box<dyn std::error::Error>> {
        let temp = TempDir::new()?;
        let path = temp.path().join("storage.json");
        let kv = FileKvStore::open(&path)?;
        kv.set("k", "v")?;

        let mode = fs::metadata(&path)?.permissions().mode() & 0o777;
        assert_eq!(mode, FILE_PERMISSIONS);
        Ok(())
    }

    #[test]
    fn test_file_store_rejects_corrupt_file() -> Result<(), Box<dyn std::error::Error>> {
        let temp = TempDir::new()?;
        let path = temp.path().join("storage.json");
        fs::write(&path, "{not json")?;

        let result = FileKvStore::open(&path);
        assert!(matches!(result, Err(KvError::Corrupt(_))));
        Ok(())
    }
}
