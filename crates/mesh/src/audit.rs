//! Append-only JSONL audit trail.
//!
//! One writer task owns the file and assigns sequence numbers. Producers hand
//! records over a bounded channel and wait when it is full, so audit
//! persistence slows the pipeline down instead of losing records. Sequence
//! numbers continue from the last record on disk after a restart.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::alert::{Alert, AlertStatus};
use crate::error::{MeshError, Result};
use crate::metrics::HealthMetrics;
use crate::planner::PatchPlan;

/// What happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditKind {
    AlertRaised {
        alert: Alert,
    },
    StatusChanged {
        from: AlertStatus,
        to: AlertStatus,
        reason: String,
    },
    PlanCreated {
        plan: PatchPlan,
    },
    PlanFinished {
        plan_id: Uuid,
        success: bool,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
}

impl AuditKind {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::AlertRaised { .. } => "alert_raised",
            Self::StatusChanged { .. } => "status_changed",
            Self::PlanCreated { .. } => "plan_created",
            Self::PlanFinished { .. } => "plan_finished",
        }
    }
}

/// One line of the audit file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub seq: u64,
    pub recorded_at: DateTime<Utc>,
    pub alert_id: Uuid,
    pub entity: String,
    #[serde(flatten)]
    pub kind: AuditKind,
}

/// Audit filter; every field is optional.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuditQuery {
    pub entity: Option<String>,
    pub alert_id: Option<Uuid>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    /// Keep only the newest `limit` matches
    pub limit: Option<usize>,
}

impl AuditQuery {
    #[must_use]
    pub fn matches(&self, record: &AuditRecord) -> bool {
        self.entity.as_ref().map_or(true, |e| *e == record.entity)
            && self.alert_id.map_or(true, |id| id == record.alert_id)
            && self.since.map_or(true, |t| record.recorded_at >= t)
            && self.until.map_or(true, |t| record.recorded_at <= t)
    }

    /// Filter records in file order, then apply the limit.
    #[must_use]
    pub fn apply(&self, records: Vec<AuditRecord>) -> Vec<AuditRecord> {
        let mut matched: Vec<AuditRecord> = records.into_iter().filter(|r| self.matches(r)).collect();
        if let Some(limit) = self.limit {
            let skip = matched.len().saturating_sub(limit);
            matched.drain(..skip);
        }
        matched
    }
}

struct Pending {
    alert_id: Uuid,
    entity: String,
    kind: AuditKind,
}

enum Command {
    Append(Pending),
    Flush(oneshot::Sender<std::io::Result<()>>),
}

/// Handle to the audit writer. Cheap to clone.
#[derive(Clone)]
pub struct AuditLog {
    tx: mpsc::Sender<Command>,
    path: PathBuf,
}

impl AuditLog {
    /// Open (or create) the audit file and start the writer task.
    pub async fn open(
        path: impl Into<PathBuf>,
        capacity: usize,
        metrics: Arc<HealthMetrics>,
    ) -> Result<(Self, JoinHandle<()>)> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let existing = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        let next_seq = parse_records(&existing, &path)
            .iter()
            .map(|r| r.seq + 1)
            .max()
            .unwrap_or(1);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        let mut writer = BufWriter::new(file);
        // A torn last line from a crash must not swallow the next record.
        if !existing.is_empty() && !existing.ends_with('\n') {
            writer.write_all(b"\n").await?;
        }

        info!(path = %path.display(), next_seq, "Audit log opened");

        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = tokio::spawn(run_writer(rx, writer, next_seq, metrics));
        Ok((Self { tx, path }, handle))
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Queue a record, waiting while the writer is behind.
    pub async fn append(&self, alert_id: Uuid, entity: &str, kind: AuditKind) -> Result<()> {
        self.tx
            .send(Command::Append(Pending {
                alert_id,
                entity: entity.to_string(),
                kind,
            }))
            .await
            .map_err(|_| MeshError::Closed)
    }

    /// Wait until everything queued so far is on disk.
    pub async fn flush(&self) -> Result<()> {
        let (done, wait) = oneshot::channel();
        self.tx
            .send(Command::Flush(done))
            .await
            .map_err(|_| MeshError::Closed)?;
        wait.await.map_err(|_| MeshError::Closed)??;
        Ok(())
    }

    /// Flush, then read matching records back from disk.
    pub async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditRecord>> {
        self.flush().await?;
        let path = self.path.clone();
        let records = tokio::task::spawn_blocking(move || read_records(&path))
            .await
            .map_err(|e| MeshError::Audit(e.to_string()))??;
        Ok(query.apply(records))
    }
}

async fn run_writer(
    mut rx: mpsc::Receiver<Command>,
    mut writer: BufWriter<tokio::fs::File>,
    mut next_seq: u64,
    metrics: Arc<HealthMetrics>,
) {
    while let Some(command) = rx.recv().await {
        match command {
            Command::Append(pending) => {
                let record = AuditRecord {
                    seq: next_seq,
                    recorded_at: Utc::now(),
                    alert_id: pending.alert_id,
                    entity: pending.entity,
                    kind: pending.kind,
                };
                match write_record(&mut writer, &record).await {
                    Ok(()) => next_seq += 1,
                    Err(e) => {
                        HealthMetrics::incr(&metrics.audit_errors);
                        error!(
                            alert_id = %record.alert_id,
                            entity = %record.entity,
                            kind = record.kind.name(),
                            error = %e,
                            "Failed to write audit record"
                        );
                    }
                }
                if rx.is_empty() {
                    if let Err(e) = writer.flush().await {
                        HealthMetrics::incr(&metrics.audit_errors);
                        error!(error = %e, "Failed to flush audit log");
                    }
                }
            }
            Command::Flush(done) => {
                let result = match writer.flush().await {
                    Ok(()) => writer.get_ref().sync_data().await,
                    Err(e) => Err(e),
                };
                let _ = done.send(result);
            }
        }
    }
    if let Err(e) = writer.flush().await {
        error!(error = %e, "Failed to flush audit log on shutdown");
    }
}

async fn write_record(
    writer: &mut BufWriter<tokio::fs::File>,
    record: &AuditRecord,
) -> std::io::Result<()> {
    let mut line = serde_json::to_vec(record).map_err(std::io::Error::other)?;
    line.push(b'\n');
    writer.write_all(&line).await
}

fn parse_records(raw: &str, path: &Path) -> Vec<AuditRecord> {
    raw.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .filter_map(|(idx, line)| match serde_json::from_str(line) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(
                    path = %path.display(),
                    line = idx + 1,
                    error = %e,
                    "Skipping corrupt audit line"
                );
                None
            }
        })
        .collect()
}

/// Read every readable record from an audit file. A missing file is empty.
pub fn read_records(path: &Path) -> Result<Vec<AuditRecord>> {
    match std::fs::read_to_string(path) {
        Ok(raw) => Ok(parse_records(&raw, path)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Severity;
    use serde_json::json;

    fn alert(entity: &str) -> Alert {
        Alert::synthetic(entity, "pattern", Severity::High, "r", "m".to_string(), json!({}))
    }

    #[tokio::test]
    async fn test_append_query_and_resume_seq() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit/mesh.jsonl");
        let metrics = Arc::new(HealthMetrics::new());

        let a = alert("api");
        let b = alert("db");
        {
            let (log, handle) = AuditLog::open(&path, 4, Arc::clone(&metrics)).await.unwrap();
            log.append(a.id, "api", AuditKind::AlertRaised { alert: a.clone() })
                .await
                .unwrap();
            log.append(b.id, "db", AuditKind::AlertRaised { alert: b.clone() })
                .await
                .unwrap();
            log.append(
                a.id,
                "api",
                AuditKind::StatusChanged {
                    from: AlertStatus::Open,
                    to: AlertStatus::Remediating,
                    reason: "plan started".to_string(),
                },
            )
            .await
            .unwrap();

            let api = log
                .query(&AuditQuery {
                    entity: Some("api".to_string()),
                    ..AuditQuery::default()
                })
                .await
                .unwrap();
            assert_eq!(api.len(), 2);
            assert_eq!(api[0].kind, AuditKind::AlertRaised { alert: a.clone() });
            assert_eq!(api[1].seq, 3);

            drop(log);
            handle.await.unwrap();
        }

        // Reopen: numbering continues and old records are still there.
        let (log, _handle) = AuditLog::open(&path, 4, metrics).await.unwrap();
        log.append(b.id, "db", AuditKind::StatusChanged {
            from: AlertStatus::Open,
            to: AlertStatus::Resolved,
            reason: "pulse".to_string(),
        })
        .await
        .unwrap();
        let all = log.query(&AuditQuery::default()).await.unwrap();
        let seqs: Vec<u64> = all.iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4]);

        let last = log
            .query(&AuditQuery {
                limit: Some(1),
                ..AuditQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(last[0].seq, 4);
    }

    #[tokio::test]
    async fn test_corrupt_lines_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let a = alert("api");
        let good = AuditRecord {
            seq: 7,
            recorded_at: Utc::now(),
            alert_id: a.id,
            entity: "api".to_string(),
            kind: AuditKind::AlertRaised { alert: a },
        };
        let mut raw = serde_json::to_string(&good).unwrap();
        raw.push_str("\n{garbage\n{\"seq\":");
        std::fs::write(&path, raw).unwrap();

        assert_eq!(read_records(&path).unwrap().len(), 1);

        let (log, _handle) = AuditLog::open(&path, 2, Arc::new(HealthMetrics::new()))
            .await
            .unwrap();
        let b = alert("db");
        log.append(b.id, "db", AuditKind::AlertRaised { alert: b })
            .await
            .unwrap();
        let records = log.query(&AuditQuery::default()).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].seq, 8);
    }

    #[test]
    fn test_query_time_range() {
        let a = alert("api");
        let t0: DateTime<Utc> = "2026-03-01T00:00:00Z".parse().unwrap();
        let records: Vec<AuditRecord> = (0..5)
            .map(|i| AuditRecord {
                seq: i + 1,
                recorded_at: t0 + chrono::TimeDelta::minutes(i as i64),
                alert_id: a.id,
                entity: "api".to_string(),
                kind: AuditKind::PlanFinished {
                    plan_id: Uuid::new_v4(),
                    success: true,
                    started_at: t0,
                    finished_at: t0,
                    detail: None,
                },
            })
            .collect();

        let query = AuditQuery {
            since: Some(t0 + chrono::TimeDelta::minutes(1)),
            until: Some(t0 + chrono::TimeDelta::minutes(3)),
            ..AuditQuery::default()
        };
        let seqs: Vec<u64> = query.apply(records).iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![2, 3, 4]);
    }
}
