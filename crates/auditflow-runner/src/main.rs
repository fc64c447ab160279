//! auditflow-runner - batch audit-report integration pipeline.
//!
//! One invocation executes one batch (ingest → enrich → score, plus
//! optional outbox materialisation) and exits: `0` on success, including
//! "no work"; non-zero on a run-level failure. External scheduling starts
//! the next batch.
//!
//! All behavioural configuration comes from the environment (see
//! `config.rs`); the CLI only controls logging.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use auditflow_core::retry::RetryPolicy;
use auditflow_core::rules::RuleSetCache;
use auditflow_core::time::{Clock, SystemClock, ThreadRngJitter};
use auditflow_runner::api::GoAuditsClient;
use auditflow_runner::config::RunnerConfig;
use auditflow_runner::http::HttpClient;
use auditflow_runner::pipeline::Pipeline;
use auditflow_runner::secrets::{FileSecretProvider, SecretProvider};
use auditflow_runner::store::StateStore;
use clap::Parser;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// auditflow batch runner.
#[derive(Parser, Debug)]
#[command(name = "auditflow-runner")]
#[command(version, about, long_about = None)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log to file instead of stdout
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn init_tracing(args: &Args) -> Result<()> {
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(log_file) = &args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .context("failed to open log file")?;
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args)?;

    match run(&args).await {
        Ok(()) => Ok(()),
        Err(err) => {
            error!(error = %err, "runner failed");
            std::process::exit(1);
        },
    }
}

async fn run(_args: &Args) -> Result<()> {
    let config = RunnerConfig::from_env().context("configuration resolution failed")?;
    info!(db = %config.db_path().display(), dry_run = config.dry_run, "runner starting");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    std::fs::create_dir_all(&config.sql_host)
        .with_context(|| format!("failed to create data directory {:?}", config.sql_host))?;
    let store = Arc::new(
        StateStore::open(config.db_path(), Arc::clone(&clock), config.dry_run)
            .context("failed to open state store")?,
    );

    let secrets = FileSecretProvider::new(&config.secret_uri);
    let bearer = secrets
        .get_secret(&config.bearer_secret_name)
        .context("failed to read bearer token")?;

    let http = HttpClient::new(RetryPolicy::default(), Arc::new(ThreadRngJitter));
    let api = Arc::new(GoAuditsClient::new(
        http,
        config.summary_url.clone(),
        config.details_url.clone(),
        bearer,
        config.summary_filter_id,
    ));

    let rules = Arc::new(RuleSetCache::new(&config.ruleset_dir));
    let pipeline = Pipeline::new(config, store, api, clock, rules)
        .context("pipeline configuration failed")?;

    let handle = pipeline.begin_run().context("failed to start run")?;

    let mut sigterm = signal(SignalKind::terminate()).context("failed to register SIGTERM")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to register SIGINT")?;

    tokio::select! {
        result = pipeline.execute(&handle) => {
            let summary = result.context("run failed")?;
            info!(message = %summary.message, "batch complete");
            Ok(())
        }
        _ = sigterm.recv() => {
            info!("received SIGTERM, aborting run");
            pipeline.abort_run(&handle, "cancelled by SIGTERM");
            anyhow::bail!("run cancelled by SIGTERM");
        }
        _ = sigint.recv() => {
            info!("received SIGINT, aborting run");
            pipeline.abort_run(&handle, "cancelled by SIGINT");
            anyhow::bail!("run cancelled by SIGINT");
        }
    }
}
