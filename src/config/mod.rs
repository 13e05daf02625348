//! Configuration merge system
//!
//! Implements the 3-layer configuration merge:
//! 1. Built-in defaults
//! 2. Config file (`localsign.toml` unless overridden)
//! 3. `LOCALSIGN_*` environment overrides
//!
//! The result is an explicit [`Config`] value handed to the signing service;
//! nothing reads configuration from global state.

mod defaults;
mod effective;
mod merge;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use localsign_worker::{AnyBuilder, BuilderSecrets, Integrated, IntegratedConfig, SECRET_KEY, SECRET_URL};
use serde::{Deserialize, Serialize};

pub use defaults::{builtin_layer, DEFAULT_CONFIG_FILE};
pub use effective::{generate_builder_key, ConfigError, ConfigOrigin, ConfigSource, EffectiveConfig};
pub use merge::{deep_merge, env_layer, merge_layers};

/// Upper bound for `builder.integrated.job_timeout_mins` (one day).
const MAX_JOB_TIMEOUT_MINS: u64 = 24 * 60;

/// Builder id of the integrated builder.
pub const INTEGRATED_BUILDER_ID: &str = "Integrated";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// URL handed to the entrypoint for callbacks.
    pub server_url: String,
    /// Root of application and profile storage.
    pub save_dir: PathBuf,
    /// Shared secret handed to the entrypoint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub builder_key: Option<String>,
    pub builder: BuilderSection,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuilderSection {
    pub integrated: IntegratedConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: defaults::DEFAULT_SERVER_URL.to_string(),
            save_dir: PathBuf::from(defaults::DEFAULT_SAVE_DIR),
            builder_key: None,
            builder: BuilderSection::default(),
        }
    }
}

impl Config {
    /// Load from `path` and the process environment, generating and saving a
    /// builder key if none is configured.
    pub fn load(path: &Path) -> Result<EffectiveConfig, ConfigError> {
        Self::load_with_env(path, std::env::vars())
    }

    pub fn load_with_env<I>(path: &Path, env: I) -> Result<EffectiveConfig, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut effective = EffectiveConfig::build(path, env)?;
        effective.ensure_builder_key();
        Ok(effective)
    }

    /// Load from `path` and the process environment without writing
    /// anything back. A missing builder key stays missing.
    pub fn inspect(path: &Path) -> Result<EffectiveConfig, ConfigError> {
        Self::inspect_with_env(path, std::env::vars())
    }

    pub fn inspect_with_env<I>(path: &Path, env: I) -> Result<EffectiveConfig, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        EffectiveConfig::build(path, env)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let integrated = &self.builder.integrated;
        if !integrated.enable {
            return Err(ConfigError::ValidationError(
                "no builder enabled; set builder.integrated.enable = true".to_string(),
            ));
        }

        if integrated.job_timeout_mins == 0 || integrated.job_timeout_mins > MAX_JOB_TIMEOUT_MINS {
            return Err(ConfigError::ValidationError(format!(
                "builder.integrated.job_timeout_mins must be in (0, {}]",
                MAX_JOB_TIMEOUT_MINS
            )));
        }

        if integrated.entrypoint.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "builder.integrated.entrypoint must not be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Instantiate every enabled builder, keyed by builder id.
    pub fn make_builders(&self) -> BTreeMap<String, AnyBuilder> {
        let mut builders = BTreeMap::new();
        if self.builder.integrated.enable {
            builders.insert(
                INTEGRATED_BUILDER_ID.to_string(),
                AnyBuilder::from(Integrated::new(self.builder.integrated.clone())),
            );
        }
        builders
    }

    /// Secrets every builder's worker environment receives.
    pub fn builder_secrets(&self) -> BuilderSecrets {
        let mut secrets = BuilderSecrets::new();
        secrets.insert(
            SECRET_KEY.to_string(),
            self.builder_key.clone().unwrap_or_default(),
        );
        secrets.insert(SECRET_URL.to_string(), self.server_url.clone());
        secrets
    }

    pub fn apps_dir(&self) -> PathBuf {
        self.save_dir.join("apps")
    }

    pub fn profiles_dir(&self) -> PathBuf {
        self.save_dir.join("profiles")
    }
}
