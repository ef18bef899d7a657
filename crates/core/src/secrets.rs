//! Storage for the API credential.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, trace};

/// Key under which the chat API credential is stored.
pub const API_KEY_NAME: &str = "api_key";

/// Environment variable that takes precedence over the stored key.
pub const API_KEY_ENV: &str = "SUBCHAT_API_KEY";

/// String key-value store for secrets; durability is up to the implementation.
pub trait SecretStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn clear(&self, key: &str) -> Result<()>;
}

/// Resolve the API key from the environment first, then from `store`.
pub fn resolve_api_key(store: &dyn SecretStore) -> Result<Option<String>> {
    if let Ok(key) = std::env::var(API_KEY_ENV) {
        if !key.trim().is_empty() {
            debug!("using API key from {API_KEY_ENV}");
            return Ok(Some(key));
        }
    }
    store.get(API_KEY_NAME)
}

/// Secrets kept as a JSON object in a single file.
pub struct FileSecretStore {
    path: PathBuf,
}

impl FileSecretStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<BTreeMap<String, String>> {
        trace!("FileSecretStore::load path={}", self.path.display());
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let text = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        Ok(serde_json::from_str(&text)?)
    }

    fn store(&self, map: &BTreeMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, serde_json::to_string_pretty(map)?)
            .with_context(|| format!("failed to write {}", self.path.display()))
    }
}

impl SecretStore for FileSecretStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.load()?.remove(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut map = self.load()?;
        map.insert(key.to_string(), value.to_string());
        self.store(&map)
    }

    fn clear(&self, key: &str) -> Result<()> {
        let mut map = self.load()?;
        if map.remove(key).is_some() {
            self.store(&map)?;
        }
        Ok(())
    }
}

/// Process-local store, handy for tests and one-shot runs.
#[derive(Default)]
pub struct MemorySecretStore {
    values: Mutex<BTreeMap<String, String>>,
}

impl SecretStore for MemorySecretStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn clear(&self, key: &str) -> Result<()> {
        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        values.remove(key);
        Ok(())
    }
}
