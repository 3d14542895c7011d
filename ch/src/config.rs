//! Hub configuration

use std::fs;
use std::path::{Path, PathBuf};

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Namespace used when none is configured
pub const DEFAULT_NAMESPACE: &str = "cluster";

/// Hub configuration
///
/// Every process of one cluster must use the same `namespace`; envelopes
/// carrying another namespace are ignored, which lets independent hubs share a
/// transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubConfig {
    /// Namespace marker stamped on every envelope
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Log level for the `ch` binary (trace, debug, info, warn, error)
    #[serde(default, rename = "log-level")]
    pub log_level: Option<String>,
}

fn default_namespace() -> String {
    debug!("default_namespace: called");
    DEFAULT_NAMESPACE.to_string()
}

impl Default for HubConfig {
    fn default() -> Self {
        debug!("HubConfig::default: called");
        Self {
            namespace: default_namespace(),
            log_level: None,
        }
    }
}

impl HubConfig {
    /// Create a config for the given namespace
    pub fn with_namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    /// Load configuration with fallback chain
    ///
    /// Explicit path, then `.clusterhub.yml`, then
    /// `~/.config/clusterhub/clusterhub.yml`, then defaults.
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        debug!(?config_path, "HubConfig::load: called");
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        let local_config = PathBuf::from(".clusterhub.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("clusterhub").join("clusterhub.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        debug!("HubConfig::load: no config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}
