//! Runner configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use quiver_traits::{ComputationTarget, EngineConfig, TargetType};

/// Errors loading a runner configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// File path.
        path: String,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The file is not valid TOML for this schema.
    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// The values are inconsistent.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// A priced target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Target identifier
    pub id: String,

    /// Target type
    #[serde(default = "default_target_type")]
    pub target_type: TargetType,

    /// Clean price
    pub price: f64,

    /// Discount factor to the valuation date
    pub discount_factor: f64,
}

impl TargetConfig {
    /// The computation target.
    pub fn target(&self) -> ComputationTarget {
        ComputationTarget::security(self.target_type, self.id.as_str())
    }
}

fn default_target_type() -> TargetType {
    TargetType::Bond
}

/// Runner configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Engine configuration
    pub engine: EngineConfig,

    /// Number of cycles to run
    pub cycles: u32,

    /// In-process invokers; 0 sizes the pool from the core count
    pub local_invokers: usize,

    /// Price change applied on each successive cycle
    pub price_shift: f64,

    /// Targets to value
    pub targets: Vec<TargetConfig>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            cycles: 1,
            local_invokers: 0,
            price_shift: 0.0,
            targets: Vec::new(),
        }
    }
}

impl RunnerConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cycles == 0 {
            return Err(ConfigError::Invalid("cycles must be at least 1".into()));
        }
        if self.targets.is_empty() {
            return Err(ConfigError::Invalid("no targets configured".into()));
        }
        if let Some(t) = self.targets.iter().find(|t| !t.discount_factor.is_finite()) {
            return Err(ConfigError::Invalid(format!(
                "target {} has a non-finite discount factor",
                t.id
            )));
        }
        Ok(())
    }
}
