//! Runtime configuration for declm.
//!
//! Uses `figment` for layered configuration: defaults -> config file -> environment -> overrides.
//! Configuration is loaded from the user config directory and/or `.declm/config.toml`
//! in the workspace directory. It covers deployment concerns (where and how a
//! backbone is placed, how logs are written) and never the model itself, which
//! is described by [`crate::schema::ModelConfig`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Context length used when backbone metadata carries no length attribute.
pub const DEFAULT_CONTEXT_LEN: usize = 2048;

/// Top-level runtime configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// How pretrained backbones are loaded and placed.
    #[serde(default)]
    pub backbone: BackboneSettings,
    /// Log output configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Weight precision requested from the backbone provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    #[default]
    Half,
    Bfloat16,
    Full,
}

/// Device placement strategy requested from the backbone provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceMap {
    /// Shard layers across every visible accelerator, capped per device.
    #[default]
    Auto,
    /// Fill devices in order, moving on when a device's budget is spent.
    Sequential,
    Cpu,
}

/// Backbone load policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackboneSettings {
    #[serde(default)]
    pub precision: Precision,
    #[serde(default)]
    pub device_map: DeviceMap,
    /// Memory budget per accelerator, e.g. `13GiB`.
    #[serde(default = "default_max_memory")]
    pub max_memory_per_device: String,
    /// Number of accelerators the budget applies to.
    #[serde(default = "default_max_devices")]
    pub max_devices: usize,
    /// Stream weights instead of materialising a full copy in host memory.
    #[serde(default = "default_true")]
    pub low_cpu_mem_usage: bool,
    #[serde(default = "default_context_len")]
    pub default_context_len: usize,
}

impl Default for BackboneSettings {
    fn default() -> Self {
        Self {
            precision: Precision::Half,
            device_map: DeviceMap::Auto,
            max_memory_per_device: default_max_memory(),
            max_devices: default_max_devices(),
            low_cpu_mem_usage: true,
            default_context_len: default_context_len(),
        }
    }
}

impl BackboneSettings {
    /// Per-device memory caps keyed by device ordinal.
    pub fn max_memory(&self) -> Result<BTreeMap<usize, u64>, ConfigError> {
        let bytes = parse_memory_budget(&self.max_memory_per_device)?;
        Ok((0..self.max_devices).map(|i| (i, bytes)).collect())
    }
}

fn default_max_memory() -> String {
    "13GiB".to_string()
}

fn default_max_devices() -> usize {
    4
}

fn default_context_len() -> usize {
    DEFAULT_CONTEXT_LEN
}

/// Parse a memory budget such as `13GiB`, `512MiB`, `2GB` or a raw byte count.
pub fn parse_memory_budget(value: &str) -> Result<u64, ConfigError> {
    let trimmed = value.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, unit) = trimmed.split_at(split);
    let amount: u64 = digits.parse().map_err(|_| {
        ConfigError::invalid("backbone.max_memory_per_device", format!("'{value}' has no amount"))
    })?;
    let multiplier: u64 = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "kib" => 1 << 10,
        "mib" => 1 << 20,
        "gib" => 1 << 30,
        "kb" => 1_000,
        "mb" => 1_000_000,
        "gb" => 1_000_000_000,
        other => {
            return Err(ConfigError::invalid(
                "backbone.max_memory_per_device",
                format!("unknown unit '{other}'"),
            ));
        }
    };
    amount.checked_mul(multiplier).ok_or_else(|| {
        ConfigError::invalid("backbone.max_memory_per_device", format!("'{value}' overflows"))
    })
}

/// Log output configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive for the human-readable stderr layer.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Directory for daily-rolling JSON logs. Disabled when unset.
    #[serde(default)]
    pub json_log_dir: Option<PathBuf>,
    #[serde(default = "default_json_level")]
    pub json_level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_log_dir: None,
            json_level: default_json_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_json_level() -> String {
    "debug".to_string()
}

fn default_true() -> bool {
    true
}

/// Load runtime configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (passed as argument)
/// 2. Environment variables (prefixed with `DECLM_`)
/// 3. Workspace-local config (`.declm/config.toml`)
/// 4. User config (`~/.config/declm/config.toml`)
/// 5. Built-in defaults
pub fn load_runtime_config(
    workspace: Option<&Path>,
    overrides: Option<&RuntimeConfig>,
) -> Result<RuntimeConfig, ConfigError> {
    let mut figment = Figment::from(Serialized::defaults(RuntimeConfig::default()));

    if let Some(dirs) = directories::ProjectDirs::from("dev", "declm", "declm") {
        let user_config = dirs.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = workspace_config_path(ws);
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    // DECLM_BACKBONE__MAX_MEMORY_PER_DEVICE, DECLM_LOGGING__LEVEL, etc.
    figment = figment.merge(Env::prefixed("DECLM_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment.extract().map_err(|e| ConfigError::Load(Box::new(e)))
}

pub fn workspace_config_path(workspace: &Path) -> PathBuf {
    workspace.join(".declm").join("config.toml")
}

/// Write `config` as the workspace-local runtime config, returning its path.
pub fn write_workspace_config(
    workspace: &Path,
    config: &RuntimeConfig,
) -> Result<PathBuf, ConfigError> {
    let path = workspace_config_path(workspace);
    let content = toml::to_string_pretty(config).map_err(|e| ConfigError::Parse(e.to_string()))?;
    crate::persistence::write_atomic(&path, content.as_bytes())?;
    Ok(path)
}
