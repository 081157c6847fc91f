//! Error types for configuration loading.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while reading or validating configuration and rule files.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("Failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// YAML parse failure
    #[error("Failed to parse YAML in {}: {source}", path.display())]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// JSON parse failure
    #[error("Failed to parse JSON in {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Two rules share an id
    #[error("Duplicate rule id '{0}'")]
    DuplicateRule(String),

    /// A pattern rule's regex does not compile
    #[error("Rule '{rule_id}' has an invalid pattern: {reason}")]
    InvalidPattern { rule_id: String, reason: String },

    /// A rule's parameters are out of range
    #[error("Rule '{rule_id}' is invalid: {reason}")]
    InvalidRule { rule_id: String, reason: String },

    /// A setting is out of range
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
