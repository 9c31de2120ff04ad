//! Configuration module for mapstate.

use std::collections::BTreeSet;
use std::path::Path;

use serde::Deserialize;
use tracing::error;

use crate::script::{ResourceLimits, StateKey, GLOBAL_MAP_ID};
use crate::{MapStateError, Result};

/// Lua engine configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Whether Lua states are created at all.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Run every map on the single global state instead of one state per map.
    #[serde(default)]
    pub compatibility_mode: bool,
    /// Include the Lua traceback when reporting script errors.
    #[serde(default)]
    pub traceback: bool,
    /// Root directory of the Lua scripts.
    #[serde(default = "default_script_path")]
    pub script_path: String,
    /// Comma separated map ids that get a state (empty = all maps).
    #[serde(default)]
    pub only_on_maps: String,
    /// Extra `package.path` entries, separated by `;`.
    #[serde(default)]
    pub require_paths: String,
}

fn default_enabled() -> bool {
    true
}

fn default_script_path() -> String {
    "lua_scripts".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            compatibility_mode: false,
            traceback: false,
            script_path: default_script_path(),
            only_on_maps: String::new(),
            require_paths: String::new(),
        }
    }
}

impl EngineConfig {
    /// Parse `only_on_maps` into a set of map ids.
    ///
    /// Invalid tokens are logged and skipped.
    pub fn allowed_maps(&self) -> BTreeSet<u32> {
        let mut maps = BTreeSet::new();
        for token in self.only_on_maps.split(',') {
            let token: String = token.chars().filter(|c| !c.is_whitespace()).collect();
            if token.is_empty() {
                continue;
            }
            match token.parse::<u32>() {
                Ok(id) => {
                    maps.insert(id);
                }
                Err(_) => {
                    error!(value = %token, "invalid map id in engine.only_on_maps");
                }
            }
        }
        maps
    }

    /// Whether a state should be created for the given map.
    pub fn should_map_load(&self, map_id: u32) -> bool {
        if !self.enabled {
            return false;
        }
        if map_id == GLOBAL_MAP_ID {
            return true;
        }
        if self.compatibility_mode {
            return false;
        }
        let allowed = self.allowed_maps();
        allowed.is_empty() || allowed.contains(&map_id)
    }

    /// Whether a state should be created for `key`.
    ///
    /// The reserved global map only ever hosts the global state itself.
    pub fn should_state_load(&self, key: StateKey) -> bool {
        if key.map_id() == GLOBAL_MAP_ID && !key.is_global() {
            return false;
        }
        self.should_map_load(key.map_id())
    }

    /// Extra require paths, trimmed and without empty entries.
    pub fn extra_require_paths(&self) -> Vec<String> {
        self.require_paths
            .split(';')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// Per-state resource limits.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Maximum instructions per entry into a state (0 = unlimited).
    #[serde(default = "default_max_instructions")]
    pub max_instructions: u64,
    /// Maximum Lua heap per state in megabytes (0 = unlimited).
    #[serde(default = "default_max_memory_mb")]
    pub max_memory_mb: usize,
}

fn default_max_instructions() -> u64 {
    1_000_000
}

fn default_max_memory_mb() -> usize {
    64
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_instructions: default_max_instructions(),
            max_memory_mb: default_max_memory_mb(),
        }
    }
}

impl From<&LimitsConfig> for ResourceLimits {
    fn from(config: &LimitsConfig) -> Self {
        Self {
            max_instructions: config.max_instructions,
            max_memory: config.max_memory_mb.saturating_mul(1024 * 1024),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Path to the log file.
    #[serde(default = "default_log_file")]
    pub file: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_file() -> String {
    "logs/mapstate.log".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: default_log_file(),
        }
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Lua engine configuration.
    #[serde(default)]
    pub engine: EngineConfig,
    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(MapStateError::Io)?;
        Self::parse(&content)
    }

    /// Load configuration from a TOML file and apply environment variable overrides.
    pub fn load_with_env<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| MapStateError::Config(format!("config parse error: {e}")))
    }

    /// Apply environment variable overrides to the configuration.
    ///
    /// Supported environment variables:
    /// - `MAPSTATE_SCRIPT_PATH`: Override the script directory
    pub fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("MAPSTATE_SCRIPT_PATH") {
            if !path.is_empty() {
                self.engine.script_path = path;
            }
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.engine.enabled && self.engine.script_path.trim().is_empty() {
            return Err(MapStateError::Validation(
                "engine is enabled but engine.script_path is empty".to_string(),
            ));
        }
        Ok(())
    }
}
