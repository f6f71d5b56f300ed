//! Fiberio Runtime Configuration
//!
//! Handles parsing and management of fiberio.toml configuration files.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Configuration file name searched for by [`RuntimeConfig::find_and_load`].
pub const CONFIG_FILE: &str = "fiberio.toml";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file not found: {0}")]
    NotFound(String),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Root configuration structure matching fiberio.toml.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RuntimeConfig {
    /// Worker pool settings
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Fiber settings
    #[serde(default)]
    pub fiber: FiberConfig,

    /// Readiness multiplexer settings
    #[serde(default)]
    pub io: IoConfig,

    /// Timer settings
    #[serde(default)]
    pub timer: TimerConfig,

    /// Hook layer settings
    #[serde(default)]
    pub hook: HookConfig,
}

impl RuntimeConfig {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        let content = std::fs::read_to_string(path)?;
        let config: RuntimeConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Find and load configuration by searching up from the given directory.
    pub fn find_and_load(start_dir: &Path) -> ConfigResult<Self> {
        let mut dir = start_dir.to_path_buf();
        loop {
            let config_path = dir.join(CONFIG_FILE);
            if config_path.exists() {
                return Self::load(&config_path);
            }
            if !dir.pop() {
                return Ok(Self::default());
            }
        }
    }

    /// Save configuration to a file.
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// Worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Worker slots, including the constructing thread when `use_caller` is set
    #[serde(default = "default_threads")]
    pub threads: usize,

    /// Whether the constructing thread takes part in scheduling
    #[serde(default = "default_true")]
    pub use_caller: bool,

    /// Scheduler name, used as the worker thread name prefix
    #[serde(default = "default_name")]
    pub name: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            threads: default_threads(),
            use_caller: true,
            name: default_name(),
        }
    }
}

fn default_threads() -> usize {
    1
}

fn default_true() -> bool {
    true
}

fn default_name() -> String {
    "fiberio".to_string()
}

/// Fiber configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FiberConfig {
    /// Stack size of every fiber, in bytes
    #[serde(default = "default_stack_size")]
    pub stack_size: usize,
}

impl Default for FiberConfig {
    fn default() -> Self {
        Self {
            stack_size: default_stack_size(),
        }
    }
}

fn default_stack_size() -> usize {
    crate::fiber::DEFAULT_STACK_SIZE
}

/// Readiness multiplexer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IoConfig {
    /// Upper bound on a single wait, in milliseconds
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,

    /// Number of readiness events fetched per wait
    #[serde(default = "default_max_events")]
    pub max_events: usize,
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            max_wait_ms: default_max_wait_ms(),
            max_events: default_max_events(),
        }
    }
}

fn default_max_wait_ms() -> u64 {
    3000
}

fn default_max_events() -> usize {
    256
}

/// Timer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimerConfig {
    /// Backward clock jump that forces every timer to expire, in milliseconds
    #[serde(default = "default_rollover_threshold_ms")]
    pub rollover_threshold_ms: u64,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            rollover_threshold_ms: default_rollover_threshold_ms(),
        }
    }
}

fn default_rollover_threshold_ms() -> u64 {
    crate::timer::ROLLOVER_THRESHOLD_MS
}

/// Hook layer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookConfig {
    /// Timeout applied by hooked `connect`, in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for HookConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

fn default_connect_timeout_ms() -> u64 {
    5000
}
