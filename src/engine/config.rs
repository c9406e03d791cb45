//! Engine configuration.
//!
//! Configuration is a plain value handed to the engine at construction.
//! Hosts build it in code or deserialize it from their own config file;
//! nothing is read from the environment here.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::BranchName;

/// Engine configuration options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Branch created for a new database.
    pub default_branch: BranchName,
    /// How many times `merge_with_retry` attempts a merge.
    pub max_merge_attempts: u32,
    /// Message used for the first upload when none is given.
    pub default_initial_message: String,
    /// Message used for later uploads when none is given.
    pub default_commit_message: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_branch: BranchName::main(),
            max_merge_attempts: 3,
            default_initial_message: "Initial upload.".to_string(),
            default_commit_message: "New upload.".to_string(),
        }
    }
}

impl EngineConfig {
    const MAX_MERGE_ATTEMPTS: u32 = 100;

    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default branch.
    pub fn default_branch(mut self, branch: BranchName) -> Self {
        self.default_branch = branch;
        self
    }

    /// Set the merge attempt limit.
    pub fn max_merge_attempts(mut self, attempts: u32) -> Self {
        self.max_merge_attempts = attempts;
        self
    }

    pub fn default_initial_message(mut self, message: impl Into<String>) -> Self {
        self.default_initial_message = message.into();
        self
    }

    pub fn default_commit_message(mut self, message: impl Into<String>) -> Self {
        self.default_commit_message = message.into();
        self
    }

    /// Check every field, reporting all problems at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut violations = Vec::new();

        if self.max_merge_attempts == 0 {
            violations.push(ConfigViolation::new("max_merge_attempts", "must be at least 1"));
        } else if self.max_merge_attempts > Self::MAX_MERGE_ATTEMPTS {
            violations.push(ConfigViolation::new(
                "max_merge_attempts",
                format!("must be at most {}", Self::MAX_MERGE_ATTEMPTS),
            ));
        }
        if self.default_initial_message.trim().is_empty() {
            violations.push(ConfigViolation::new("default_initial_message", "must not be empty"));
        }
        if self.default_commit_message.trim().is_empty() {
            violations.push(ConfigViolation::new("default_commit_message", "must not be empty"));
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(ConfigError { violations })
        }
    }

    /// Parse a JSON document and validate it.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| ConfigError::single("<document>", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON config file and validate it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::single("<file>", format!("{}: {}", path.display(), e)))?;
        Self::from_json(&json)
    }
}

/// One problem with a configuration value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigViolation {
    pub field: String,
    pub problem: String,
}

impl ConfigViolation {
    pub fn new(field: impl Into<String>, problem: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            problem: problem.into(),
        }
    }
}

impl fmt::Display for ConfigViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.problem)
    }
}

/// Every problem found while validating a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}", display_violations(.violations))]
pub struct ConfigError {
    pub violations: Vec<ConfigViolation>,
}

impl ConfigError {
    pub(crate) fn single(field: impl Into<String>, problem: impl Into<String>) -> Self {
        Self {
            violations: vec![ConfigViolation::new(field, problem)],
        }
    }
}

fn display_violations(violations: &[ConfigViolation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
