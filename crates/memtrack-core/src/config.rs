use std::time::Duration;

use memtrack_protocol::Severity;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Top-level memtrack configuration, loaded from memtrack.toml.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemtrackConfig {
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub fence: FenceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Ask the dispatch layer to skip calls that raised an error
    #[serde(default = "default_true")]
    pub suppress_on_error: bool,
    /// Lowest severity delivered to the diagnostic sink
    #[serde(default = "default_min_severity")]
    pub min_severity: Severity,
    /// Stop validating a device session after an internal tracker error
    #[serde(default = "default_true")]
    pub halt_on_internal_error: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FenceConfig {
    /// How often a blocked fence wait re-checks tracker state
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl FenceConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            suppress_on_error: true,
            min_severity: default_min_severity(),
            halt_on_internal_error: true,
        }
    }
}

impl Default for FenceConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl MemtrackConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, CoreError> {
        toml::from_str(content).map_err(|e| CoreError::ConfigError(e.to_string()))
    }

    /// Load configuration from file if it exists, otherwise return defaults.
    pub fn load_or_default(path: &str) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(CoreError::Io(_)) => Self::default(),
            Err(e) => {
                tracing::warn!("ignoring {}: {}", path, e);
                Self::default()
            }
        }
    }

    pub fn to_toml(&self) -> Result<String, CoreError> {
        toml::to_string_pretty(self).map_err(|e| CoreError::ConfigError(e.to_string()))
    }
}

/// Returns the default config file path.
/// Search order:
/// 1. System-wide config: `/etc/memtrack/memtrack.toml`
/// 2. Local fallback: `./memtrack.toml`
pub fn default_config_path() -> String {
    let system_path = "/etc/memtrack/memtrack.toml";
    if std::path::Path::new(system_path).exists() {
        return system_path.to_string();
    }
    "memtrack.toml".to_string()
}

fn default_true() -> bool {
    true
}

fn default_min_severity() -> Severity {
    Severity::Warning
}

fn default_poll_interval_ms() -> u64 {
    5
}
