//! `cronfleet`: one runner of the fleet.
//!
//! - `run`: heartbeat + scheduling loop until Ctrl-C
//! - `run-job <JOB_ID> [-- ARGS]`: race for one job once and execute it in the foreground
//! - `status`: read-only fleet health (stale runners, leases, recent executions)
//! - `init-db`: create the shared schema

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use cronfleet_core::{FleetConfig, JobId};
use cronfleet_scheduler::{
    CommandJob, EngineSettings, HeartbeatReporter, InFlight, JobExecutor, JobRegistry,
    LockError, LockManager, SchedulerEngine, SchedulerError,
};
use cronfleet_store::{HealthReader, LockStore, Outcome, PgLockStore, SqliteLockStore};
use tokio::sync::watch;
use tracing::{info, warn};

mod status;

const DEFAULT_LOG_FILTER: &str = "cronfleet=info,cronfleet_scheduler=info,cronfleet_store=info";

#[derive(Parser)]
#[command(name = "cronfleet")]
#[command(about = "Lease-coordinated cron runner", long_about = None)]
struct Cli {
    /// Config file (default: $CRONFLEET_CONFIG, then ~/.cronfleet/cronfleet.toml)
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the heartbeat reporter and the scheduling loop until Ctrl-C
    Run,

    /// Race for one job's lease right now and execute it once
    RunJob {
        /// Job id as configured in `[[jobs]]`
        job_id: String,

        /// Arguments appended to the job's command
        #[arg(last = true)]
        args: Vec<String>,
    },

    /// Show stale heartbeats, leases and recent executions
    Status {
        /// Heartbeats older than this many seconds are reported as stale
        #[arg(long, default_value = "90")]
        stale_after: u64,

        /// Only show executions of this job
        #[arg(long)]
        job: Option<String>,

        /// Executions to show per job
        #[arg(long, default_value = "10")]
        limit: usize,

        /// Print the snapshot as JSON
        #[arg(long)]
        json: bool,
    },

    /// Create the shared schema if it does not exist
    InitDb,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // load config: --config > CRONFLEET_CONFIG env > ~/.cronfleet/cronfleet.toml
    let config_path = cli
        .config
        .clone()
        .or_else(|| std::env::var("CRONFLEET_CONFIG").ok());
    let config = FleetConfig::load(config_path.as_deref()).context("loading configuration")?;

    match cli.command {
        Commands::Run => run(config).await,
        Commands::RunJob { job_id, args } => run_job(config, JobId::new(job_id), args).await,
        Commands::Status {
            stale_after,
            job,
            limit,
            json,
        } => {
            let store = open_store(&config).await?;
            let reader = HealthReader::new(store);
            let job = job.map(JobId::new);
            let snapshot = reader
                .snapshot(Duration::from_secs(stale_after), job.as_ref(), limit)
                .await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            } else {
                print!("{}", status::render(&snapshot));
            }
            Ok(())
        }
        Commands::InitDb => {
            open_store(&config).await?;
            println!("schema ready in {}", store_location(&config));
            Ok(())
        }
    }
}

async fn run(config: FleetConfig) -> anyhow::Result<()> {
    let identity = config.runner.identity();
    info!(
        runner_id = %identity.runner_id,
        instance_id = %identity.instance_id,
        store = %store_location(&config),
        "cronfleet runner starting"
    );
    if !config.database.uses_postgres() {
        warn!("SQLite lock store: every runner must share this host's clock and disk");
    }

    let store = open_store(&config).await?;
    let in_flight = InFlight::new();
    let lock = LockManager::new(
        Arc::clone(&store),
        identity.runner_id.clone(),
        config.runner.store_timeout(),
    );
    let engine = SchedulerEngine::new(
        config.job_definitions()?,
        &JobRegistry::new(),
        JobExecutor::new(lock),
        in_flight.clone(),
        EngineSettings::from(&config.runner),
    )?;

    let mut reporter = HeartbeatReporter::new(
        Arc::clone(&store),
        identity.runner_id.clone(),
        config.runner.heartbeat_period(),
        config.runner.store_timeout(),
        in_flight,
    );
    if let Some(note) = &config.runner.status_note {
        reporter = reporter.with_note(note.as_str());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let heartbeat = tokio::spawn(reporter.run(shutdown_rx.clone()));
    let scheduler = tokio::spawn(engine.run(shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested; waiting for in-flight jobs");
    let _ = shutdown_tx.send(true);

    scheduler.await?;
    heartbeat.await?;
    info!("cronfleet runner stopped");
    Ok(())
}

async fn run_job(config: FleetConfig, job_id: JobId, args: Vec<String>) -> anyhow::Result<()> {
    let identity = config.runner.identity();
    let Some(def) = config
        .job_definitions()?
        .into_iter()
        .find(|d| d.job_id == job_id)
    else {
        bail!("unknown job: {job_id}");
    };

    let mut registry = JobRegistry::new();
    if !args.is_empty() {
        let Some(command) = def.command.clone() else {
            bail!("{job_id} has no command to pass arguments to");
        };
        registry.register(job_id.clone(), Arc::new(CommandJob::new(command).with_args(args)));
    }

    let store = open_store(&config).await?;
    let lock = LockManager::new(store, identity.runner_id, config.runner.store_timeout());
    let engine = SchedulerEngine::new(
        vec![def],
        &registry,
        JobExecutor::new(lock),
        InFlight::new(),
        EngineSettings::from(&config.runner),
    )?;

    match engine.run_job_now(&job_id).await {
        Ok(report) if report.outcome == Outcome::Success => {
            info!(%job_id, token = report.fencing_token, "job succeeded");
            Ok(())
        }
        Ok(report) => bail!(
            "{job_id} finished with {}: {}",
            report.outcome,
            report.detail.unwrap_or_default()
        ),
        // Another runner has it; that is the normal losing side of the race.
        Err(SchedulerError::Lock(LockError::Busy { holder_id, .. })) => {
            info!(%job_id, %holder_id, "lock busy; not running");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

async fn open_store(config: &FleetConfig) -> anyhow::Result<Arc<dyn LockStore>> {
    if let Some(url) = &config.database.url {
        let store = PgLockStore::connect(
            url,
            config.database.max_connections,
            config.runner.store_timeout(),
        )
        .await
        .context("connecting to the PostgreSQL lock store")?;
        return Ok(Arc::new(store));
    }

    let path = &config.database.path;
    ensure_parent_dir(path);
    let store = SqliteLockStore::open(path, Duration::from_millis(config.database.busy_timeout_ms))
        .with_context(|| format!("opening lock store at {path}"))?;
    Ok(Arc::new(store))
}

/// Human-readable store location. Never includes the URL, which may carry a password.
fn store_location(config: &FleetConfig) -> String {
    if config.database.uses_postgres() {
        "PostgreSQL".to_string()
    } else {
        config.database.path.clone()
    }
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}
