//! Shared configuration types for the resilience mesh.
//!
//! This crate owns everything that is read from disk:
//!
//! - [`MeshConfig`]: pipeline settings (queues, windows, liveness, retry policy)
//! - [`RuleSetFile`]: the declarative, hot-reloadable detection rule set
//! - [`default_rule_set`]: the built-in rules used when no rule file is configured
//!
//! Both files may be written as YAML (`.yaml`/`.yml`) or JSON; the format is
//! picked from the file extension.

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod defaults;
pub mod error;
pub mod rules;
pub mod settings;

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub use defaults::default_rule_set;
pub use error::ConfigError;
pub use rules::{ActionTemplate, AnomalyModel, RuleSetFile, RuleSpec, TriggerSpec};
pub use settings::{
    AnomalyConfig, AuditConfig, Baseline, BusConfig, CollectorConfig, CorrelatorConfig,
    EntityCommands, EntityLivenessConfig, ExecutorConfig, LivenessConfig, MeshConfig,
    PlannerConfig, ServerConfig, WatchedMetric,
};

/// Alert and finding severity, ordered from least to most urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Observe only
    #[serde(alias = "low")]
    Info,
    /// Needs attention, no automated action
    #[serde(alias = "warning", alias = "medium")]
    Warn,
    /// Automated remediation (restart)
    High,
    /// Full remediation plus human notification
    Critical,
}

impl Severity {
    /// Lowercase wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warn => "warn",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    /// Next severity up, saturating at `Critical`.
    #[must_use]
    pub const fn escalate(self) -> Self {
        match self {
            Self::Info => Self::Warn,
            Self::Warn => Self::High,
            Self::High | Self::Critical => Self::Critical,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "info" | "low" => Ok(Self::Info),
            "warn" | "warning" | "medium" => Ok(Self::Warn),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(ConfigError::Invalid(format!("unknown severity '{other}'"))),
        }
    }
}

/// File formats understood by the loaders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Yaml,
    Json,
}

impl FileFormat {
    /// Pick a format from the file extension (JSON unless `.yaml`/`.yml`).
    #[must_use]
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml") => {
                Self::Yaml
            }
            _ => Self::Json,
        }
    }
}

/// Read and deserialize a YAML or JSON file.
pub(crate) fn read_file<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_str(&raw, FileFormat::from_path(path), path)
}

pub(crate) fn parse_str<T: DeserializeOwned>(
    raw: &str,
    format: FileFormat,
    origin: &Path,
) -> Result<T, ConfigError> {
    match format {
        FileFormat::Yaml => serde_yaml::from_str(raw).map_err(|source| ConfigError::Yaml {
            path: origin.to_path_buf(),
            source,
        }),
        FileFormat::Json => serde_json::from_str(raw).map_err(|source| ConfigError::Json {
            path: origin.to_path_buf(),
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Info < Severity::Warn);
        assert!(Severity::Warn < Severity::High);
        assert!(Severity::High < Severity::Critical);
        assert_eq!(
            [Severity::Warn, Severity::Critical, Severity::Info]
                .into_iter()
                .max(),
            Some(Severity::Critical)
        );
    }

    #[test]
    fn test_severity_aliases() {
        let parsed: Severity = serde_json::from_str("\"warning\"").unwrap();
        assert_eq!(parsed, Severity::Warn);
        let parsed: Severity = serde_json::from_str("\"medium\"").unwrap();
        assert_eq!(parsed, Severity::Warn);
        assert_eq!("LOW".parse::<Severity>().unwrap(), Severity::Info);
        assert!("urgent".parse::<Severity>().is_err());
        assert_eq!(serde_json::to_string(&Severity::High).unwrap(), "\"high\"");
    }

    #[test]
    fn test_escalate_saturates() {
        assert_eq!(Severity::Info.escalate(), Severity::Warn);
        assert_eq!(Severity::High.escalate(), Severity::Critical);
        assert_eq!(Severity::Critical.escalate(), Severity::Critical);
    }

    #[test]
    fn test_format_from_path() {
        assert_eq!(FileFormat::from_path(Path::new("rules.yaml")), FileFormat::Yaml);
        assert_eq!(FileFormat::from_path(Path::new("rules.YML")), FileFormat::Yaml);
        assert_eq!(FileFormat::from_path(Path::new("rules.json")), FileFormat::Json);
        assert_eq!(FileFormat::from_path(Path::new("rules")), FileFormat::Json);
    }
}
