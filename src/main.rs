use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use planwatch::capture::{CommandCapture, Explainer, PgExplainCapture, PlanCapture};
use planwatch::config::{default_config_path, CaptureConfig, Config};
use planwatch::db::{PgStore, PlanStore};
use planwatch::index::IndexInferenceEngine;
use planwatch::ingest::ingest_lines;
use planwatch::rules::{bootstrap_checks, RuleEngine};
use planwatch::scheduler::Scheduler;

/// Watches a query workload, captures plans and flags performance anti-patterns
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Config file (defaults to <config dir>/planwatch/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the explain, check and index loops until interrupted
    Run,
    /// Create the store schema and the built-in checks
    Init,
    /// Read JSON-lines statement events from stdin
    Ingest {
        /// Queue stale statements for a new plan right away
        #[arg(long)]
        explain_stale: bool,
    },
    /// Manage performance checks
    Checks {
        #[command(subcommand)]
        action: ChecksAction,
    },
    /// Print index recommendations and snapshot statistics
    Report {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum ChecksAction {
    /// Create built-in and configured checks that do not exist yet
    Bootstrap,
    /// List the stored checks
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("planwatch=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let interactive = !matches!(cli.command, Command::Run | Command::Ingest { .. });

    let path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = Config::load(&path)?;
    config.resolve_passwords(|name| std::env::var(name).ok(), interactive)?;

    let store = PgStore::connect(&config.store)?;
    store
        .ping()
        .await
        .with_context(|| format!("Plan store {} is unreachable", config.store.display_string()))?;

    match cli.command {
        Command::Init => {
            store.init_schema().await?;
            let created = bootstrap_checks(&store, &config.checks).await?;
            info!(checks = created, "store initialised");
        }
        Command::Run => run(Arc::new(store), &config).await?,
        Command::Ingest { explain_stale } => {
            let explain_now = explain_stale || config.scheduler.explain_stale_now;
            let reader = BufReader::new(tokio::io::stdin());
            let summary = ingest_lines(&store, reader, explain_now).await?;
            info!(
                events = summary.events,
                created = summary.created,
                logs = summary.logs,
                rejected = summary.rejected,
                "ingest finished"
            );
        }
        Command::Checks { action } => match action {
            ChecksAction::Bootstrap => {
                let created = bootstrap_checks(&store, &config.checks).await?;
                println!("{} check(s) created", created);
            }
            ChecksAction::List => {
                for check in store.performance_checks().await? {
                    println!("[{}] {} (v{})", check.severity, check.name, check.version);
                    if !check.description.is_empty() {
                        println!("    {}", check.description);
                    }
                    println!("    {}", check.predicate);
                }
            }
        },
        Command::Report { json } => report(&store, json).await?,
    }
    Ok(())
}

async fn connect_capture(config: &CaptureConfig) -> Result<Arc<dyn PlanCapture>> {
    let capture: Arc<dyn PlanCapture> = match config {
        CaptureConfig::Postgres(target) => Arc::new(PgExplainCapture::connect(target)?),
        CaptureConfig::Command {
            program,
            args,
            timeout_secs,
        } => {
            let mut capture = CommandCapture::new(program.clone(), args.clone());
            if let Some(secs) = timeout_secs {
                capture = capture.with_timeout(Duration::from_secs(*secs));
            }
            Arc::new(capture)
        }
    };
    capture
        .ping()
        .await
        .with_context(|| format!("Capture engine {} is unavailable", capture.name()))?;
    Ok(capture)
}

async fn run(store: Arc<PgStore>, config: &Config) -> Result<()> {
    let capture = connect_capture(config.require_capture()?).await?;
    let created = bootstrap_checks(store.as_ref(), &config.checks).await?;
    if created > 0 {
        info!(checks = created, "created missing performance checks");
    }

    let store: Arc<dyn PlanStore> = store;
    let settings = &config.scheduler;
    let scheduler = Scheduler::new(settings.intervals())
        .add(Arc::new(Explainer::new(
            store.clone(),
            capture,
            settings.explain_batch_size,
        )))
        .add(Arc::new(RuleEngine::new(store.clone(), settings.check_batch_size)))
        .add(Arc::new(IndexInferenceEngine::new(store, settings.index_batch_size)));
    info!(tasks = ?scheduler.task_names(), "planwatch running");

    tokio::select! {
        result = scheduler.run() => result,
        signal = tokio::signal::ctrl_c() => {
            match signal {
                Ok(()) => info!("interrupted, shutting down"),
                Err(e) => warn!(error = %e, "could not listen for ctrl-c"),
            }
            Ok(())
        }
    }
}

async fn report(store: &dyn PlanStore, json: bool) -> Result<()> {
    let recommendations = store.index_recommendations().await?;
    let latest = store.latest_stats().await?;
    let daily = store.daily_counts().await?;

    if json {
        let out = serde_json::json!({
            "index_recommendations": recommendations,
            "latest": latest,
            "daily": daily,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("Index recommendations");
    if recommendations.is_empty() {
        println!("  (none)");
    }
    for rec in &recommendations {
        let label = rec.label.as_deref().unwrap_or("?");
        println!("  {:>6}  :{}({})", rec.count, label, rec.property);
    }

    println!();
    println!("Latest plan per statement");
    for stat in &latest {
        println!(
            "  {:>6}  violations={:<5} index_candidates={}",
            stat.count, stat.has_violation, stat.has_index
        );
    }

    println!();
    println!("Activity per day");
    for day in &daily {
        println!(
            "  {}  {:>6} runs, {:>6} plans, {:>6} with violations",
            day.date, day.query_logs, day.explains, day.with_violations
        );
    }
    Ok(())
}
