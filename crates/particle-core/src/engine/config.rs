use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

use crate::core::check::{CheckLevel, FailurePolicy, NumericalPolicy};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("File I/O error for '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("TOML parsing error for '{path}': {source}")]
    Toml {
        path: String,
        source: toml::de::Error,
    },
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Settings of one [`Model`](super::Model).
///
/// Every field has a default, so a TOML file only needs the values it changes:
///
/// ```toml
/// name = "docking run"
/// check_level = "usage_and_internal"
/// gather_statistics = true
/// numerical_policy = "error"
/// failure_policy = "report"
/// incremental = true
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModelConfig {
    pub name: String,
    pub check_level: CheckLevel,
    pub gather_statistics: bool,
    pub numerical_policy: NumericalPolicy,
    /// Overrides the process-wide failure handler for this model when set.
    pub failure_policy: Option<FailurePolicy>,
    /// Score incremental restraints from the particles that changed since the last evaluation.
    pub incremental: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: "The Model".to_string(),
            check_level: CheckLevel::default(),
            gather_statistics: false,
            numerical_policy: NumericalPolicy::default(),
            failure_policy: None,
            incremental: false,
        }
    }
}

impl ModelConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_string_lossy().to_string(),
            source: e,
        })?;
        Self::parse(&content, &path.to_string_lossy())
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Self::parse(content, "<string>")
    }

    fn parse(content: &str, origin: &str) -> Result<Self, ConfigError> {
        let config: ModelConfig = toml::from_str(content).map_err(|e| ConfigError::Toml {
            path: origin.to_string(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::Invalid("model name must not be empty"));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct ModelConfigBuilder {
    name: Option<String>,
    check_level: Option<CheckLevel>,
    gather_statistics: Option<bool>,
    numerical_policy: Option<NumericalPolicy>,
    failure_policy: Option<FailurePolicy>,
    incremental: Option<bool>,
}

impl ModelConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
    pub fn check_level(mut self, level: CheckLevel) -> Self {
        self.check_level = Some(level);
        self
    }
    pub fn gather_statistics(mut self, enabled: bool) -> Self {
        self.gather_statistics = Some(enabled);
        self
    }
    pub fn numerical_policy(mut self, policy: NumericalPolicy) -> Self {
        self.numerical_policy = Some(policy);
        self
    }
    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = Some(policy);
        self
    }
    pub fn incremental(mut self, enabled: bool) -> Self {
        self.incremental = Some(enabled);
        self
    }

    pub fn build(self) -> Result<ModelConfig, ConfigError> {
        let defaults = ModelConfig::default();
        let config = ModelConfig {
            name: self.name.unwrap_or(defaults.name),
            check_level: self.check_level.unwrap_or(defaults.check_level),
            gather_statistics: self.gather_statistics.unwrap_or(defaults.gather_statistics),
            numerical_policy: self.numerical_policy.unwrap_or(defaults.numerical_policy),
            failure_policy: self.failure_policy.or(defaults.failure_policy),
            incremental: self.incremental.unwrap_or(defaults.incremental),
        };
        config.validate()?;
        Ok(config)
    }
}
