//! Engine configuration and policy loading
//!
//! Every section has defaults, so an empty policy file is valid. A handful
//! of knobs can be overridden from the environment:
//!
//! | Variable                                  | Field                          |
//! |-------------------------------------------|--------------------------------|
//! | `RUNTIME_GUARD_RATE_LIMIT_RATE`           | `rate_limiter.default_rate`    |
//! | `RUNTIME_GUARD_RATE_LIMIT_BURST`          | `rate_limiter.default_burst`   |
//! | `RUNTIME_GUARD_ENFORCEMENT_ENABLED`       | `enforcement.enabled`          |
//! | `RUNTIME_GUARD_HASH_TIMEOUT_MS`           | `hash.timeout_ms`              |

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::rules::RuleDefinition;

const ENV_PREFIX: &str = "RUNTIME_GUARD_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiterConfig {
    /// Events/sec allowed per rule without an `every`
    pub default_rate: f64,
    pub default_burst: u64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            default_rate: 1.0,
            default_burst: 40,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisarmerConfig {
    pub enabled: bool,
    pub max_allowed: u64,
    pub period_ms: u64,
}

impl Default for DisarmerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_allowed: 5,
            period_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisarmerSettings {
    pub executable: DisarmerConfig,
    pub container: DisarmerConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnforcementConfig {
    /// When false, kill and network-filter actions are reported as failed
    pub enabled: bool,
    /// Executables that are never signalled
    pub excluded_binaries: Vec<String>,
    pub disarmer: DisarmerSettings,
}

impl Default for EnforcementConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            excluded_binaries: Vec::new(),
            disarmer: DisarmerSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HashConfig {
    /// How long a hash waits for the process to exit
    pub timeout_ms: u64,
    pub max_file_size: u64,
}

impl Default for HashConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            max_file_size: 500 * 1024 * 1024,
        }
    }
}

impl HashConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub rate_limiter: RateLimiterConfig,
    pub enforcement: EnforcementConfig,
    pub hash: HashConfig,
}

impl EngineConfig {
    /// Defaults with environment overrides applied
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply `RUNTIME_GUARD_*` overrides read through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = override_value(&lookup, "RATE_LIMIT_RATE")? {
            self.rate_limiter.default_rate = v;
        }
        if let Some(v) = override_value(&lookup, "RATE_LIMIT_BURST")? {
            self.rate_limiter.default_burst = v;
        }
        if let Some(v) = override_value(&lookup, "ENFORCEMENT_ENABLED")? {
            self.enforcement.enabled = v;
        }
        if let Some(v) = override_value(&lookup, "HASH_TIMEOUT_MS")? {
            self.hash.timeout_ms = v;
        }
        Ok(())
    }
}

fn override_value<T, F>(lookup: &F, name: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    let key = format!("{}{}", ENV_PREFIX, name);
    match lookup(&key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { key, value: raw }),
    }
}

/// Policy file: optional engine config plus the rule definitions
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Policy {
    #[serde(default)]
    pub config: EngineConfig,
    #[serde(default)]
    pub rules: Vec<RuleDefinition>,
}

impl Policy {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(raw).map_err(ConfigError::Parse)
    }
}

/// Error type for configuration loading
#[derive(Debug)]
pub enum ConfigError {
    Io { path: String, source: std::io::Error },
    Parse(serde_json::Error),
    InvalidEnv { key: String, value: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io { path, source } => write!(f, "failed to read {}: {}", path, source),
            ConfigError::Parse(e) => write!(f, "invalid policy: {}", e),
            ConfigError::InvalidEnv { key, value } => {
                write!(f, "invalid value {:?} for {}", value, key)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io { source, .. } => Some(source),
            ConfigError::Parse(e) => Some(e),
            ConfigError::InvalidEnv { .. } => None,
        }
    }
}
