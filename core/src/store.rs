//! Interceptor-config and system key-value store

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::error::ProxyError;

/// Fixed id of the single system-prompt interceptor record.
pub const SYSTEM_PROMPT_CONFIG_ID: &str = "system_prompt";

/// KV key holding the most recent original system prompt seen on the wire.
pub const LAST_SEEN_SYSTEM_PROMPT_KEY: &str = "last_seen_system_prompt";

/// KV key holding the serialized form of the most recent tools array.
pub const LAST_SEEN_TOOLS_KEY: &str = "last_seen_tools";

/// Per-tool override: disable the tool outright or replace its description.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolOverride {
    pub is_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Payload of the system-prompt interceptor record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SystemPromptConfig {
    #[serde(default)]
    pub target_prompt: String,
    #[serde(default)]
    pub replacement_prompt: String,
    #[serde(default = "default_true")]
    pub tools_enabled: bool,
    #[serde(default)]
    pub tool_overrides: HashMap<String, ToolOverride>,
}

impl Default for SystemPromptConfig {
    fn default() -> Self {
        Self {
            target_prompt: String::new(),
            replacement_prompt: String::new(),
            tools_enabled: default_true(),
            tool_overrides: HashMap::new(),
        }
    }
}

fn default_true() -> bool {
    true
}

/// A stored interceptor record. An absent record behaves as disabled.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InterceptorConfig {
    pub is_enabled: bool,
    #[serde(default)]
    pub config: SystemPromptConfig,
}

/// External configuration store consumed by the interception pipeline.
///
/// The pipeline only reads interceptor records; the two `last_seen_*` keys
/// are written opportunistically (last-write-wins) through the background
/// writer, never read back by the interceptors themselves.
pub trait ConfigStore: Send + Sync {
    fn interceptor_config(&self, id: &str) -> Option<InterceptorConfig>;
    fn set_interceptor_config(
        &self,
        id: &str,
        is_enabled: bool,
        config: SystemPromptConfig,
    ) -> Result<(), ProxyError>;
    fn delete_interceptor_config(&self, id: &str) -> Result<(), ProxyError>;
    fn kv_get(&self, key: &str) -> Option<String>;
    fn kv_set(&self, key: &str, value: &str) -> Result<(), ProxyError>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    #[serde(default)]
    interceptors: HashMap<String, InterceptorConfig>,
    #[serde(default)]
    kv: HashMap<String, String>,
}

/// Write-through store backed by a single pretty-printed JSON document.
pub struct JsonFileStore {
    path: PathBuf,
    state: Mutex<StoreFile>,
}

impl JsonFileStore {
    /// Open (or create) the store file at `path`.
    pub fn open(path: PathBuf) -> anyhow::Result<Self> {
        let state = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            serde_json::from_str(&content)?
        } else {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            StoreFile::default()
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    fn persist(&self, state: &StoreFile) -> Result<(), ProxyError> {
        let content = serde_json::to_string_pretty(state)
            .map_err(|e| ProxyError::BackgroundWrite(format!("serialize store: {}", e)))?;
        std::fs::write(&self.path, content)
            .map_err(|e| ProxyError::BackgroundWrite(format!("write {:?}: {}", self.path, e)))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreFile> {
        self.state.lock().expect("store mutex poisoned")
    }
}

impl ConfigStore for JsonFileStore {
    fn interceptor_config(&self, id: &str) -> Option<InterceptorConfig> {
        self.lock().interceptors.get(id).cloned()
    }

    fn set_interceptor_config(
        &self,
        id: &str,
        is_enabled: bool,
        config: SystemPromptConfig,
    ) -> Result<(), ProxyError> {
        let mut state = self.lock();
        state
            .interceptors
            .insert(id.to_string(), InterceptorConfig { is_enabled, config });
        self.persist(&state)
    }

    fn delete_interceptor_config(&self, id: &str) -> Result<(), ProxyError> {
        let mut state = self.lock();
        state.interceptors.remove(id);
        self.persist(&state)
    }

    fn kv_get(&self, key: &str) -> Option<String> {
        self.lock().kv.get(key).cloned()
    }

    fn kv_set(&self, key: &str, value: &str) -> Result<(), ProxyError> {
        let mut state = self.lock();
        state.kv.insert(key.to_string(), value.to_string());
        self.persist(&state)
    }
}

/// In-memory store for tests and embedding.
#[derive(Default)]
pub struct MemoryStore {
    interceptors: dashmap::DashMap<String, InterceptorConfig>,
    kv: dashmap::DashMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConfigStore for MemoryStore {
    fn interceptor_config(&self, id: &str) -> Option<InterceptorConfig> {
        self.interceptors.get(id).map(|e| e.value().clone())
    }

    fn set_interceptor_config(
        &self,
        id: &str,
        is_enabled: bool,
        config: SystemPromptConfig,
    ) -> Result<(), ProxyError> {
        self.interceptors
            .insert(id.to_string(), InterceptorConfig { is_enabled, config });
        Ok(())
    }

    fn delete_interceptor_config(&self, id: &str) -> Result<(), ProxyError> {
        self.interceptors.remove(id);
        Ok(())
    }

    fn kv_get(&self, key: &str) -> Option<String> {
        self.kv.get(key).map(|e| e.value().clone())
    }

    fn kv_set(&self, key: &str, value: &str) -> Result<(), ProxyError> {
        self.kv.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_record_reads_as_none() {
        let store = MemoryStore::new();
        assert!(store.interceptor_config(SYSTEM_PROMPT_CONFIG_ID).is_none());
    }

    #[test]
    fn json_store_round_trips_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");

        let store = JsonFileStore::open(path.clone()).unwrap();
        let config = SystemPromptConfig {
            replacement_prompt: "Hi.\n{{env_block}}".to_string(),
            ..Default::default()
        };
        store
            .set_interceptor_config(SYSTEM_PROMPT_CONFIG_ID, true, config.clone())
            .unwrap();
        store.kv_set(LAST_SEEN_SYSTEM_PROMPT_KEY, "prompt").unwrap();

        // Re-open from disk and verify both sections survived.
        let reopened = JsonFileStore::open(path).unwrap();
        let record = reopened
            .interceptor_config(SYSTEM_PROMPT_CONFIG_ID)
            .unwrap();
        assert!(record.is_enabled);
        assert_eq!(record.config, config);
        assert_eq!(
            reopened.kv_get(LAST_SEEN_SYSTEM_PROMPT_KEY).as_deref(),
            Some("prompt")
        );
    }

    #[test]
    fn failed_store_write_is_a_background_write_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let store = JsonFileStore::open(path.clone()).unwrap();

        // Make the store path unwritable.
        std::fs::create_dir(&path).unwrap();

        let err = store.kv_set("k", "v").unwrap_err();
        assert!(matches!(err, ProxyError::BackgroundWrite(_)));
    }

    #[test]
    fn delete_removes_record() {
        let store = MemoryStore::new();
        store
            .set_interceptor_config(SYSTEM_PROMPT_CONFIG_ID, true, SystemPromptConfig::default())
            .unwrap();
        store.delete_interceptor_config(SYSTEM_PROMPT_CONFIG_ID).unwrap();
        assert!(store.interceptor_config(SYSTEM_PROMPT_CONFIG_ID).is_none());
    }

    #[test]
    fn tools_enabled_defaults_to_true() {
        let config: SystemPromptConfig = serde_json::from_str("{}").unwrap();
        assert!(config.tools_enabled);
    }
}
