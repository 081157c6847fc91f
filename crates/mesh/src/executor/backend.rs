//! Remediation backends: the side effects behind each whitelisted action.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use mesh_config::{EntityCommands, ExecutorConfig};
use notify::{Notifier, NotifyEvent};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};
use uuid::Uuid;

/// Stderr kept in a command failure.
const MAX_STDERR: usize = 500;

/// Why an action failed.
#[derive(Debug, Error)]
pub enum ActionError {
    #[error("no {action} command configured for {entity}")]
    NotConfigured { entity: String, action: &'static str },

    #[error("{action} command for {entity} exited with {status}: {stderr}")]
    CommandFailed {
        entity: String,
        action: &'static str,
        status: String,
        stderr: String,
    },

    #[error("failed to start {action} command for {entity}: {source}")]
    Spawn {
        entity: String,
        action: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("config edit for {entity} failed: {source}")]
    Io {
        entity: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid target entity {0:?}")]
    InvalidTarget(String),

    #[error("invalid config key {0:?}")]
    InvalidKey(String),

    #[error("automated restarts suppressed for {0}")]
    Suppressed(String),

    #[error("notification failed: {detail}")]
    Notify { detail: String, permanent: bool },

    #[error("cancelled by shutdown")]
    Cancelled,
}

impl ActionError {
    /// Transient failures worth another attempt.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::CommandFailed { .. }
                | Self::Spawn { .. }
                | Self::Io { .. }
                | Self::Notify {
                    permanent: false,
                    ..
                }
        )
    }
}

/// Side effects of the whitelisted actions. Implementations must make
/// `edit_config` idempotent.
#[async_trait]
pub trait RemediationBackend: Send + Sync {
    async fn restart(&self, entity: &str) -> Result<(), ActionError>;

    async fn reload(&self, entity: &str) -> Result<(), ActionError>;

    /// Set `key=value` for the entity. Returns whether anything changed.
    async fn edit_config(&self, entity: &str, key: &str, value: &str)
        -> Result<bool, ActionError>;

    async fn notify(&self, entity: &str, alert_id: Uuid, message: &str)
        -> Result<(), ActionError>;

    /// Whether a restart issued earlier is still settling.
    fn is_restarting(&self, entity: &str) -> bool;
}

/// Runs operator-configured commands and edits `<config_dir>/<entity>.env`.
pub struct LocalBackend {
    commands: HashMap<String, EntityCommands>,
    config_dir: PathBuf,
    grace: TimeDelta,
    restarting: Mutex<HashMap<String, DateTime<Utc>>>,
    notifier: Arc<Notifier>,
}

impl LocalBackend {
    #[must_use]
    pub fn new(config: &ExecutorConfig, notifier: Arc<Notifier>) -> Self {
        Self {
            commands: config.entities.clone(),
            config_dir: config.config_dir.clone(),
            grace: crate::secs(config.restart_grace_secs),
            restarting: Mutex::new(HashMap::new()),
            notifier,
        }
    }

    #[must_use]
    pub fn config_path(&self, entity: &str) -> PathBuf {
        self.config_dir.join(format!("{entity}.env"))
    }

    fn argv(&self, entity: &str, action: &'static str) -> Result<&[String], ActionError> {
        let argv = self.commands.get(entity).map(|c| match action {
            "restart" => c.restart.as_slice(),
            _ => c.reload.as_slice(),
        });
        match argv {
            Some(argv) if !argv.is_empty() => Ok(argv),
            _ => Err(ActionError::NotConfigured {
                entity: entity.to_string(),
                action,
            }),
        }
    }

    async fn run(&self, entity: &str, action: &'static str) -> Result<(), ActionError> {
        let argv = self.argv(entity, action)?;
        debug!(entity, action, program = %argv[0], "Running remediation command");

        let output = Command::new(&argv[0])
            .args(&argv[1..])
            .env("MESH_ENTITY", entity)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| ActionError::Spawn {
                entity: entity.to_string(),
                action,
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ActionError::CommandFailed {
                entity: entity.to_string(),
                action,
                status: output.status.to_string(),
                stderr: stderr.trim().chars().take(MAX_STDERR).collect(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RemediationBackend for LocalBackend {
    async fn restart(&self, entity: &str) -> Result<(), ActionError> {
        validate_entity(entity)?;
        self.run(entity, "restart").await?;
        self.restarting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(entity.to_string(), Utc::now() + self.grace);
        info!(entity, grace_secs = self.grace.num_seconds(), "Entity restarted");
        Ok(())
    }

    async fn reload(&self, entity: &str) -> Result<(), ActionError> {
        validate_entity(entity)?;
        self.run(entity, "reload").await?;
        info!(entity, "Entity reloaded");
        Ok(())
    }

    async fn edit_config(
        &self,
        entity: &str,
        key: &str,
        value: &str,
    ) -> Result<bool, ActionError> {
        validate_entity(entity)?;
        validate_key(key)?;
        if value.contains(['\n', '\r']) {
            return Err(ActionError::InvalidKey(format!("{key} (multi-line value)")));
        }

        let path = self.config_path(entity);
        let io_err = |source: io::Error| ActionError::Io {
            entity: entity.to_string(),
            source,
        };
        let current = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(io_err(e)),
        };

        let Some(updated) = apply_edit(&current, key, value) else {
            debug!(entity, key, "Config already up to date");
            return Ok(false);
        };
        write_atomic(&self.config_dir, &path, &updated)
            .await
            .map_err(io_err)?;
        info!(entity, key, path = %path.display(), "Config updated");
        Ok(true)
    }

    async fn notify(&self, entity: &str, alert_id: Uuid, message: &str) -> Result<(), ActionError> {
        if !self.notifier.has_channels() {
            info!(entity, alert_id = %alert_id, message, "Notification (no channels configured)");
            return Ok(());
        }
        let event = NotifyEvent::Operator {
            entity: entity.to_string(),
            alert_id: Some(alert_id.to_string()),
            message: message.to_string(),
            timestamp: Utc::now(),
        };
        let mut failures = Vec::new();
        let mut permanent = true;
        for delivery in self.notifier.deliver(event).await {
            if let Err(e) = delivery.result {
                permanent &= e.is_permanent();
                failures.push(format!("{}: {e}", delivery.channel));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(ActionError::Notify {
                detail: failures.join("; "),
                permanent,
            })
        }
    }

    fn is_restarting(&self, entity: &str) -> bool {
        let mut restarting = self.restarting.lock().unwrap_or_else(PoisonError::into_inner);
        match restarting.get(entity) {
            Some(until) if Utc::now() < *until => true,
            Some(_) => {
                restarting.remove(entity);
                false
            }
            None => false,
        }
    }
}

/// Entity names become file names; keep them to a safe alphabet.
pub(crate) fn validate_entity(entity: &str) -> Result<(), ActionError> {
    let valid = !entity.is_empty()
        && !entity.starts_with('.')
        && entity
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(ActionError::InvalidTarget(entity.to_string()))
    }
}

fn validate_key(key: &str) -> Result<(), ActionError> {
    let mut chars = key.chars();
    let valid = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(ActionError::InvalidKey(key.to_string()))
    }
}

/// Set `key=value` in `KEY=VALUE` text: every existing assignment is
/// updated in place, otherwise the line is appended. `None` when the text
/// already holds exactly that value.
pub fn apply_edit(contents: &str, key: &str, value: &str) -> Option<String> {
    let wanted = format!("{key}={value}");
    let mut found = false;
    let mut changed = false;
    let mut lines: Vec<String> = Vec::new();

    for line in contents.lines() {
        let assignment = line.trim_start();
        let assignment = assignment.strip_prefix("export ").unwrap_or(assignment);
        let is_key = !assignment.starts_with('#')
            && assignment
                .split_once('=')
                .is_some_and(|(k, _)| k.trim() == key);
        if is_key {
            found = true;
            if line != wanted {
                changed = true;
            }
            lines.push(wanted.clone());
        } else {
            lines.push(line.to_string());
        }
    }

    if !found {
        lines.push(wanted);
        changed = true;
    }
    if !changed && (contents.is_empty() || contents.ends_with('\n')) {
        return None;
    }

    let mut out = lines.join("\n");
    out.push('\n');
    Some(out)
}

async fn write_atomic(dir: &Path, path: &Path, contents: &str) -> io::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = dir.join(format!(".{file_name}.{}.tmp", Uuid::new_v4().simple()));
    tokio::fs::write(&tmp, contents).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    Ok(())
}
