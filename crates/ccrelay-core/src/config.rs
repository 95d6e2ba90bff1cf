use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{RelayError, Result};

pub const DEFAULT_PORT: u16 = 8181;
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Upstream model ids advertised when the mapping does not cover a name.
/// Unknown client model ids pass through to the upstream unchanged.
pub const PASSTHROUGH_MODELS: &[&str] = &[
    "claude-opus-4-6",
    "claude-sonnet-4-5",
    "claude-haiku-4-5",
];

/// Top-level proxy config, stored as `config.json` in the config directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Client-supplied model id → upstream model id. Unknown keys pass
    /// through unchanged.
    #[serde(default, rename = "modelMapping")]
    pub model_mapping: BTreeMap<String, String>,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            model_mapping: BTreeMap::new(),
            server: ServerConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}
fn default_port() -> u16 {
    DEFAULT_PORT
}

impl RelayConfig {
    /// Load `config.json` from the given directory. A missing file yields
    /// the defaults; a malformed file is an error rather than a silent
    /// fallback so a typo never drops the operator's model mapping.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join("config.json");
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = fs::read_to_string(&path)?;
        serde_json::from_str(&data)
            .map_err(|e| RelayError::Config(format!("{}: {e}", path.display())))
    }

    /// Resolve a client-supplied model id to the upstream id.
    pub fn resolve_model(&self, name: &str) -> String {
        self.model_mapping
            .get(name)
            .cloned()
            .unwrap_or_else(|| name.to_string())
    }
}

/// Local API key record, stored as `apikey.json`. When the file is absent
/// the proxy accepts all local callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub key: String,
    #[serde(rename = "createdAt")]
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl ApiKeyRecord {
    pub fn load(dir: &Path) -> Result<Option<Self>> {
        let path = dir.join("apikey.json");
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read_to_string(&path)?;
        let record = serde_json::from_str(&data)
            .map_err(|e| RelayError::Config(format!("{}: {e}", path.display())))?;
        Ok(Some(record))
    }
}

/// Per-user configuration directory: `$CCRELAY_HOME` override, else
/// `~/.ccrelay`.
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("CCRELAY_HOME") {
        return PathBuf::from(dir);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".ccrelay")
}

/// Replace a JSON document atomically: write a sibling temp file, then
/// rename over the target. Readers observe either the old or the new
/// document, never a partial write.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    let parent = path
        .parent()
        .ok_or_else(|| RelayError::Config(format!("no parent dir for {}", path.display())))?;
    fs::create_dir_all(parent)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json.as_bytes())?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_config_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = RelayConfig::load(dir.path()).unwrap();
        assert!(config.model_mapping.is_empty());
        assert_eq!(config.server.port, DEFAULT_PORT);
    }

    #[test]
    fn model_mapping_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = RelayConfig::default();
        config
            .model_mapping
            .insert("gpt-4".into(), "claude-sonnet-4-5".into());
        write_json_atomic(&dir.path().join("config.json"), &config).unwrap();

        let loaded = RelayConfig::load(dir.path()).unwrap();
        assert_eq!(loaded.resolve_model("gpt-4"), "claude-sonnet-4-5");
        // unknown ids pass through
        assert_eq!(loaded.resolve_model("claude-opus-4-6"), "claude-opus-4-6");
    }

    #[test]
    fn config_json_uses_camel_case_keys() {
        let mut config = RelayConfig::default();
        config.model_mapping.insert("a".into(), "b".into());
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains(r#""modelMapping""#));
        assert!(json.contains(r#""server""#));
    }

    #[test]
    fn malformed_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("config.json"), "{not json").unwrap();
        assert!(RelayConfig::load(dir.path()).is_err());
    }

    #[test]
    fn atomic_write_replaces_whole_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        write_json_atomic(&path, &serde_json::json!({"a": 1})).unwrap();
        write_json_atomic(&path, &serde_json::json!({"b": 2})).unwrap();
        let data = fs::read_to_string(&path).unwrap();
        assert!(data.contains("\"b\""));
        assert!(!data.contains("\"a\""));
        // no temp file left behind
        assert!(!dir.path().join("config.json.tmp").exists());
    }
}
