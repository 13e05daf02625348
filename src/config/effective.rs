//! Effective configuration with provenance
//!
//! Captures the merged configuration plus where each layer came from, and
//! owns the one write-back the service performs: persisting a generated
//! builder key into the config file.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use super::defaults::builtin_layer;
use super::merge::{env_layer, merge_layers};
use super::Config;

/// Keys whose values are hidden when the config is displayed.
const SECRET_KEYS: &[&str] = &[
    "password",
    "token",
    "secret",
    "private_key",
    "api_key",
    "builder_key",
    "credential",
];

const REDACTED: &str = "[REDACTED]";

/// Origin of a configuration source
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ConfigOrigin {
    Builtin,
    File,
    Env,
}

/// A contributing config source with provenance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSource {
    pub origin: ConfigOrigin,

    /// File path (None for builtin/env)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// SHA-256 digest of raw file bytes (None for builtin/env)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

/// Merged configuration plus its sources.
#[derive(Debug, Clone)]
pub struct EffectiveConfig {
    pub config: Config,
    pub sources: Vec<ConfigSource>,
    pub created_at: DateTime<Utc>,
    path: PathBuf,
    file_table: toml::Table,
}

impl EffectiveConfig {
    /// Merge builtin defaults, the TOML file at `path` (if present) and
    /// `LOCALSIGN_*` overrides from `env`, then validate.
    pub fn build<I>(path: &Path, env: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let builtin = builtin_layer();
        let mut layers = vec![builtin.clone()];
        let mut sources = vec![ConfigSource {
            origin: ConfigOrigin::Builtin,
            path: None,
            digest: None,
        }];

        let mut file_table = toml::Table::new();
        if path.exists() {
            let (table, digest) = Self::load_toml_file(path)?;
            layers.push(toml_to_json(toml::Value::Table(table.clone())));
            sources.push(ConfigSource {
                origin: ConfigOrigin::File,
                path: Some(path.to_string_lossy().to_string()),
                digest: Some(digest),
            });
            file_table = table;
        }

        if let Some(layer) = env_layer(env, &builtin) {
            layers.push(layer);
            sources.push(ConfigSource {
                origin: ConfigOrigin::Env,
                path: None,
                digest: None,
            });
        }

        let merged = merge_layers(layers);
        let config: Config = serde_json::from_value(merged)
            .map_err(|e| ConfigError::ParseError(format!("invalid configuration: {}", e)))?;
        config.validate()?;

        Ok(Self {
            config,
            sources,
            created_at: Utc::now(),
            path: path.to_path_buf(),
            file_table,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Generate a builder key if none is configured and write it into the
    /// config file. Returns `true` if a key was generated.
    ///
    /// A failed write is logged; the generated key is still used for this
    /// process.
    pub fn ensure_builder_key(&mut self) -> bool {
        if self
            .config
            .builder_key
            .as_deref()
            .is_some_and(|key| !key.trim().is_empty())
        {
            return false;
        }

        let key = generate_builder_key();
        self.config.builder_key = Some(key.clone());
        self.file_table
            .insert("builder_key".to_string(), toml::Value::String(key));

        match self.save() {
            Ok(()) => info!(path = %self.path.display(), "generated builder key"),
            Err(e) => warn!(path = %self.path.display(), error = %e, "failed to save generated builder key"),
        }
        true
    }

    /// Write the file layer back to the config path atomically.
    fn save(&self) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(&self.file_table)
            .map_err(|e| ConfigError::ParseError(format!("TOML serialize error: {}", e)))?;

        let parent = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent).map_err(|e| ConfigError::IoError(e.to_string()))?;

        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "config".to_string());
        let temp_path = parent.join(format!(".{}.tmp", file_name));

        let mut file = fs::File::create(&temp_path).map_err(|e| ConfigError::IoError(e.to_string()))?;
        file.write_all(contents.as_bytes())
            .and_then(|()| file.sync_all())
            .map_err(|e| ConfigError::IoError(e.to_string()))?;
        fs::rename(&temp_path, &self.path).map_err(|e| ConfigError::IoError(e.to_string()))?;
        Ok(())
    }

    /// The merged configuration as JSON with secret values replaced.
    pub fn redacted(&self) -> Result<(Value, Vec<String>), ConfigError> {
        let mut value = serde_json::to_value(&self.config)
            .map_err(|e| ConfigError::ParseError(format!("JSON serialize error: {}", e)))?;
        let mut redactions = Vec::new();
        redact_recursive(&mut value, String::new(), &mut redactions);
        Ok((value, redactions))
    }

    /// Pretty JSON document for `config show`.
    pub fn to_json(&self) -> Result<String, ConfigError> {
        let (config, redactions) = self.redacted()?;
        let document = serde_json::json!({
            "created_at": self.created_at,
            "config": config,
            "sources": self.sources,
            "redactions": redactions,
        });
        serde_json::to_string_pretty(&document)
            .map_err(|e| ConfigError::ParseError(format!("JSON serialize error: {}", e)))
    }

    fn load_toml_file(path: &Path) -> Result<(toml::Table, String), ConfigError> {
        let bytes = fs::read(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let digest = hex::encode(hasher.finalize());

        let contents = String::from_utf8(bytes)
            .map_err(|e| ConfigError::ParseError(format!("Invalid UTF-8: {}", e)))?;
        let table: toml::Table = toml::from_str(&contents)
            .map_err(|e| ConfigError::ParseError(format!("TOML parse error: {}", e)))?;

        Ok((table, digest))
    }
}

/// 32 random bytes, hex encoded.
pub fn generate_builder_key() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn toml_to_json(toml: toml::Value) -> Value {
    match toml {
        toml::Value::String(s) => Value::String(s),
        toml::Value::Integer(i) => Value::Number(i.into()),
        toml::Value::Float(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        toml::Value::Boolean(b) => Value::Bool(b),
        toml::Value::Datetime(dt) => Value::String(dt.to_string()),
        toml::Value::Array(arr) => Value::Array(arr.into_iter().map(toml_to_json).collect()),
        toml::Value::Table(table) => Value::Object(
            table
                .into_iter()
                .map(|(k, v)| (k, toml_to_json(v)))
                .collect(),
        ),
    }
}

fn redact_recursive(value: &mut Value, path: String, redactions: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            for (key, val) in map.iter_mut() {
                let key_lower = key.to_lowercase();
                let current_path = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", path, key)
                };

                let is_secret = SECRET_KEYS.iter().any(|s| key_lower.contains(s));
                if is_secret && !val.is_object() && !val.is_array() {
                    *val = Value::String(REDACTED.to_string());
                    redactions.push(current_path);
                } else {
                    redact_recursive(val, current_path, redactions);
                }
            }
        }
        Value::Array(arr) => {
            for (i, val) in arr.iter_mut().enumerate() {
                redact_recursive(val, format!("{}[{}]", path, i), redactions);
            }
        }
        _ => {}
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}
