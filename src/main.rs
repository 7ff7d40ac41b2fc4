//! Hermes - Model Handoff and Context Orchestration Core
//!
//! This is the main entry point: it runs the orchestration runtime in
//! the foreground, executes a single handoff job as a detached worker
//! (the `handoff-worker` subcommand the background handler spawns), and
//! reports daemon status from the persisted checkpoint.

use clap::{Parser, Subcommand};
use hermes_core::{
    error::{HermesError, Result},
    handoff::background,
    store::DaemonStateDoc,
    HermesConfig, RequestId, Runtime,
};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Hermes CLI arguments
#[derive(Parser)]
#[command(name = "hermes")]
#[command(about = "Model handoff and context orchestration core", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Set log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Configuration file (TOML); defaults are used when absent
    #[arg(long, env = "HERMES_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the runtime in the foreground until interrupted
    Serve,

    /// Execute one background handoff job from its rendezvous files
    ///
    /// Spawned by the background handler; not intended for direct use.
    HandoffWorker {
        /// Request id of the job
        id: String,

        /// Work directory holding the rendezvous files
        #[arg(long)]
        work_dir: PathBuf,
    },

    /// Print daemon status from the persisted checkpoint
    Status,
}

fn load_config(path: Option<&PathBuf>) -> Result<HermesConfig> {
    match path {
        Some(path) => HermesConfig::from_file(path)
            .map_err(|e| HermesError::Configuration(e.to_string())),
        None => Ok(HermesConfig::with_local_provider()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Serve => {
            let config = load_config(cli.config.as_ref())?;
            let runtime = Runtime::initialize(config).await?;
            runtime.daemon().start().await?;
            info!("Hermes serving; press Ctrl-C to stop");

            tokio::signal::ctrl_c().await?;
            info!("Interrupt received, shutting down");
            runtime.shutdown().await;
        }

        Commands::HandoffWorker { id, work_dir } => {
            let id = RequestId::from_string(&id)
                .map_err(|e| HermesError::Configuration(format!("invalid job id: {}", e)))?;
            if let Err(e) = background::run_child(id, &work_dir).await {
                warn!("Handoff worker {} failed: {}", id, e);
                return Err(e.into());
            }
        }

        Commands::Status => {
            let config = load_config(cli.config.as_ref())?;
            let path = config.store.resolved_base_dir().join("daemon-state.json");
            match std::fs::read_to_string(&path) {
                Ok(json) => {
                    let doc: DaemonStateDoc = serde_json::from_str(&json)
                        .map_err(|e| HermesError::Storage(format!("parse {}: {}", path.display(), e)))?;
                    println!(
                        "daemon: {}",
                        if doc.running { "running" } else { "stopped" }
                    );
                    if let Some(started) = doc.started_at {
                        println!("started: {}", started.to_rfc3339());
                    }
                    let mut workers: Vec<_> = doc.workers.iter().collect();
                    workers.sort_by_key(|(kind, _)| kind.as_str());
                    for (kind, state) in workers {
                        println!(
                            "  {:<16} runs={} ok={} failed={} avg={:.0}ms last={}",
                            kind.to_string(),
                            state.run_count,
                            state.success_count,
                            state.failure_count,
                            state.average_duration_ms,
                            state
                                .last_run
                                .map(|t| t.to_rfc3339())
                                .unwrap_or_else(|| "never".to_string()),
                        );
                    }
                }
                Err(_) => println!("daemon: no checkpoint at {}", path.display()),
            }
        }
    }

    Ok(())
}
