//! Resilience mesh CLI
//!
//! Runs the self-healing pipeline with its admin API, and offers offline
//! helpers for validating rule files, reading the audit log and previewing
//! remediation plans.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use colored::Colorize;
use mesh::audit::{read_records, AuditKind, AuditQuery, AuditRecord};
use mesh::executor::LocalBackend;
use mesh::planner::PatchPlanner;
use mesh::rules::RuleSnapshot;
use mesh::server::build_router;
use mesh::{Alert, Mesh, Severity};
use mesh_config::{default_rule_set, MeshConfig, RuleSetFile};
use notify::Notifier;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Self-healing resilience mesh - detects anomalies and runs bounded remediation
#[derive(Parser)]
#[command(name = "mesh")]
#[command(about = "Self-healing resilience mesh - detects anomalies and runs bounded remediation")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Mesh configuration file (YAML or JSON)
    #[arg(short, long, env = "MESH_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Output format for command results
    #[arg(long, default_value = "text", global = true)]
    format: OutputFormat,

    /// Log output format
    #[arg(long, default_value = "text", global = true)]
    log_format: OutputFormat,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline and the admin API until Ctrl-C
    Run {
        /// Rule file; the built-in rules are used when absent
        #[arg(long, env = "MESH_RULES")]
        rules: Option<PathBuf>,

        /// Admin API listen address
        #[arg(long, env = "MESH_LISTEN")]
        listen: Option<String>,

        /// Audit log path
        #[arg(long, env = "MESH_AUDIT_PATH")]
        audit_path: Option<PathBuf>,

        /// Also read newline-delimited JSON records from stdin
        #[arg(long)]
        stdin: bool,
    },
    /// Compile a rule file and print its digest
    ValidateRules {
        /// Rule file (YAML or JSON)
        file: PathBuf,
    },
    /// Query the audit log
    Audit {
        /// Audit log path (defaults to the configured one)
        #[arg(long)]
        path: Option<PathBuf>,

        /// Only records for this entity
        #[arg(long)]
        entity: Option<String>,

        /// Records at or after this time (RFC 3339)
        #[arg(long)]
        since: Option<DateTime<Utc>>,

        /// Records at or before this time (RFC 3339)
        #[arg(long)]
        until: Option<DateTime<Utc>>,

        /// Keep only the newest N records
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Show the plan an alert would get
    Plan {
        #[arg(long)]
        severity: Severity,

        #[arg(long)]
        category: String,

        #[arg(long)]
        entity: String,

        /// Rule file whose category actions apply
        #[arg(long)]
        rules: Option<PathBuf>,
    },
}

fn init_tracing(verbose: bool, format: OutputFormat) {
    let default = if verbose {
        "mesh=debug,notify=debug,tower_http=debug"
    } else {
        "mesh=info,notify=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        OutputFormat::Json => builder.json().init(),
        OutputFormat::Text => builder.init(),
    }
}

fn load_config(path: Option<&Path>) -> Result<MeshConfig> {
    match path {
        Some(path) => MeshConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display())),
        None => Ok(MeshConfig::default()),
    }
}

fn load_rules(path: Option<&Path>) -> Result<RuleSetFile> {
    match path {
        Some(path) => RuleSetFile::load(path)
            .with_context(|| format!("Failed to load rules {}", path.display())),
        None => {
            info!("No rule file configured, using built-in rules");
            Ok(default_rule_set())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_format);
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            rules,
            listen,
            audit_path,
            stdin,
        } => run(config, rules, listen, audit_path, stdin).await,
        Commands::ValidateRules { file } => validate_rules(&file, cli.format),
        Commands::Audit {
            path,
            entity,
            since,
            until,
            limit,
        } => {
            let path = path.unwrap_or_else(|| config.audit.path.clone());
            let query = AuditQuery {
                entity,
                alert_id: None,
                since,
                until,
                limit,
            };
            audit(&path, &query, cli.format)
        }
        Commands::Plan {
            severity,
            category,
            entity,
            rules,
        } => plan(&config, rules.as_deref(), severity, &category, &entity, cli.format),
    }
}

async fn run(
    mut config: MeshConfig,
    rules: Option<PathBuf>,
    listen: Option<String>,
    audit_path: Option<PathBuf>,
    read_stdin: bool,
) -> Result<()> {
    if let Some(rules) = rules {
        config.rules_path = Some(rules);
    }
    if let Some(listen) = listen {
        config.server.listen = listen;
    }
    if let Some(audit_path) = audit_path {
        config.audit.path = audit_path;
    }
    let rules = load_rules(config.rules_path.as_deref())?;
    let listen = config.server.listen.clone();

    let notifier = Arc::new(Notifier::from_env());
    let backend = Arc::new(LocalBackend::new(&config.executor, Arc::clone(&notifier)));
    let mesh = Mesh::start(config, rules, backend, notifier)
        .await
        .context("Failed to start mesh")?;

    if read_stdin {
        let collector = mesh.collector().clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        collector.ingest_lines(&line);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "Stopped reading stdin");
                        break;
                    }
                }
            }
            info!("Stdin closed");
        });
    }

    let listener = TcpListener::bind(&listen)
        .await
        .with_context(|| format!("Failed to bind {listen}"))?;
    info!(listen = %listen, "Admin API listening");

    axum::serve(listener, build_router(Arc::clone(&mesh)))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    mesh.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl-C");
        return;
    }
    info!("Shutdown requested");
}

fn validate_rules(file: &Path, format: OutputFormat) -> Result<()> {
    let set = RuleSetFile::load(file)
        .with_context(|| format!("Failed to load rules {}", file.display()))?;
    let snapshot = RuleSnapshot::compile(&set, 1).context("Rule set is invalid")?;
    let info = snapshot.info();

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(info)?),
        OutputFormat::Text => {
            println!("{} {}", "✓".green(), file.display());
            println!("  version:  {}", info.version);
            println!("  rules:    {} ({} enabled)", info.rule_count, info.enabled_count);
            println!("  digest:   {}", info.digest);
        }
    }
    Ok(())
}

fn audit(path: &Path, query: &AuditQuery, format: OutputFormat) -> Result<()> {
    let records = read_records(path)
        .with_context(|| format!("Failed to read audit log {}", path.display()))?;
    let records = query.apply(records);

    match format {
        OutputFormat::Json => {
            for record in &records {
                println!("{}", serde_json::to_string(record)?);
            }
        }
        OutputFormat::Text => {
            for record in &records {
                println!("{}", describe(record));
            }
            if records.is_empty() {
                println!("{}", "No matching audit records".dimmed());
            }
        }
    }
    Ok(())
}

fn describe(record: &AuditRecord) -> String {
    let detail = match &record.kind {
        AuditKind::AlertRaised { alert } => format!(
            "{} {} {} {}",
            "alert".bold(),
            alert.severity.as_str().yellow(),
            alert.category,
            alert.message
        ),
        AuditKind::StatusChanged { from, to, reason } => {
            format!("{} {from} → {to} ({reason})", "status".bold())
        }
        AuditKind::PlanCreated { plan } => format!(
            "{} {}",
            "plan".bold(),
            plan.actions
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        ),
        AuditKind::PlanFinished {
            success, detail, ..
        } => {
            let outcome = if *success { "succeeded".green() } else { "failed".red() };
            match detail {
                Some(detail) => format!("{} {outcome}: {detail}", "plan".bold()),
                None => format!("{} {outcome}", "plan".bold()),
            }
        }
    };
    format!(
        "{:>6} {} {} {} {detail}",
        record.seq,
        record.recorded_at.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string().dimmed(),
        record.entity.cyan(),
        record.alert_id.simple().to_string().dimmed(),
    )
}

fn plan(
    config: &MeshConfig,
    rules: Option<&Path>,
    severity: Severity,
    category: &str,
    entity: &str,
    format: OutputFormat,
) -> Result<()> {
    let rules_path = rules.or(config.rules_path.as_deref());
    let set = load_rules(rules_path)?;
    let snapshot = RuleSnapshot::compile(&set, 1).context("Rule set is invalid")?;
    let planner = PatchPlanner::new(&config.planner, Some(&snapshot));

    let alert = Alert::synthetic(
        entity,
        category,
        severity,
        "cli",
        format!("{severity} {category} on {entity}"),
        json!({}),
    );
    let plan = planner.plan(&alert);

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&plan)?),
        OutputFormat::Text => {
            if plan.is_noop() {
                println!("{}", "No actions".dimmed());
            }
            for (i, action) in plan.actions.iter().enumerate() {
                println!("{}. {action}", i + 1);
            }
            if !planner.is_known(category) {
                println!("{}", "(unknown category: notify only)".yellow());
            }
            if plan.awaits_confirmation {
                println!("{}", "(alert stays remediating until the entity pulses)".dimmed());
            }
        }
    }
    Ok(())
}
