// SPDX-License-Identifier: MIT

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::policy::FailurePolicy;

/// Failure policies that can be expressed in a config file. Dead-lettering
/// needs a channel and is only available through the builder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum FailurePolicyConfig {
    Discard,
    #[default]
    Log,
    Retry {
        retries: usize,
    },
}

impl From<FailurePolicyConfig> for FailurePolicy {
    fn from(config: FailurePolicyConfig) -> Self {
        match config {
            FailurePolicyConfig::Discard => FailurePolicy::Discard,
            FailurePolicyConfig::Log => FailurePolicy::Log,
            FailurePolicyConfig::Retry { retries } => FailurePolicy::Retry { retries },
        }
    }
}

/// Dispatcher settings as read from JSON. Missing sizes fall back to the
/// builder defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DispatcherConfig {
    pub name: String,
    #[serde(default)]
    pub max_workers: Option<usize>,
    #[serde(default)]
    pub queue_capacity: Option<usize>,
    #[serde(default)]
    pub failure_policy: FailurePolicyConfig,
}

impl DispatcherConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_workers: None,
            queue_capacity: None,
            failure_policy: FailurePolicyConfig::default(),
        }
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&json)
    }
}
