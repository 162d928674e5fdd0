// Configuration types for the worklet bridge

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// What happens to queued tasks when a runtime shuts down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ShutdownMode {
    /// Queued tasks are discarded and their continuations see `Cancelled`
    #[default]
    Cancel,
    /// Queued tasks still run before the thread exits
    Drain,
}

/// Delivery policy for shared value change notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NotifyPolicy {
    /// Every version is delivered to every listener
    #[default]
    EveryVersion,
    /// Pending notifications collapse to the newest value
    Latest,
}

/// Globals installed into every runtime at bootstrap
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoratorConfig {
    /// `console.*` routed to tracing
    pub console: bool,

    /// `performance.now()`
    pub performance: bool,

    /// `setImmediate(fn, ...args)`
    pub set_immediate: bool,
}

impl Default for DecoratorConfig {
    fn default() -> Self {
        Self {
            console: true,
            performance: true,
            set_immediate: true,
        }
    }
}

/// Configuration for a single runtime instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Memory limit per engine in bytes (0 = unlimited)
    pub memory_limit: usize,

    /// Maximum native stack size of the engine in bytes
    pub max_stack_size: usize,

    /// Decorators to install
    pub decorators: DecoratorConfig,

    /// Script evaluated after bootstrap, before the runtime accepts tasks
    pub bootstrap: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            memory_limit: 64 * 1024 * 1024, // 64MB
            max_stack_size: 1024 * 1024,
            decorators: DecoratorConfig::default(),
            bootstrap: None,
        }
    }
}

impl RuntimeConfig {
    /// Set the bootstrap script
    pub fn with_bootstrap(mut self, source: impl Into<String>) -> Self {
        self.bootstrap = Some(source.into());
        self
    }
}

/// Top-level configuration of an installed worklet bridge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkletsConfig {
    /// Name of the lazily created default worklet runtime
    pub default_runtime_name: String,

    /// Shutdown behaviour for queued tasks
    pub shutdown: ShutdownMode,

    /// Shared value notification policy
    pub notify: NotifyPolicy,

    /// Settings applied to every runtime created by the registry
    pub runtime: RuntimeConfig,
}

impl Default for WorkletsConfig {
    fn default() -> Self {
        Self {
            default_runtime_name: "default".to_string(),
            shutdown: ShutdownMode::default(),
            notify: NotifyPolicy::default(),
            runtime: RuntimeConfig::default(),
        }
    }
}

impl WorkletsConfig {
    /// Parse a configuration from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Load from `path` if given, else from the default location if it exists,
    /// else fall back to defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            return Self::load(path);
        }
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Render as TOML
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Per-user config file location (`<config dir>/worklets/config.toml`)
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "worklets")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }
}
