use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::node::Target;

pub const DEFAULT_CONFIG_FILE_NAME: &str = "img2tensor.toml";
pub const ENV_CONFIG_PATH: &str = "IMG2TENSOR_CONFIG";
pub const DEFAULT_LOG_FILTER: &str = "info";
pub const DEFAULT_LOG_RETENTION_FILES: usize = 7;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct PluginConfig {
    pub codegen: CodegenConfig,
    pub host: HostConfig,
    pub graph: GraphConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct CodegenConfig {
    /// Passed verbatim to the OpenCL program build.
    pub build_options: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct HostConfig {
    /// Advertise and run the host conversion path.
    pub fallback: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GraphConfig {
    pub preferred_target: Target,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    pub filter: String,
    pub retention_files: usize,
    pub dir: Option<PathBuf>,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            preferred_target: Target::Gpu,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_LOG_FILTER.to_string(),
            retention_files: DEFAULT_LOG_RETENTION_FILES,
            dir: None,
        }
    }
}

impl PluginConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create config directory: {}", parent.display())
            })?;
        }

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }
}

/// Resolve the config file path with 3-tier priority:
/// 1. CLI override if provided
/// 2. IMG2TENSOR_CONFIG environment variable
/// 3. Default: ./img2tensor.toml
pub fn config_path(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_path) = env::var_os(ENV_CONFIG_PATH) {
        return PathBuf::from(env_path);
    }

    PathBuf::from(DEFAULT_CONFIG_FILE_NAME)
}
