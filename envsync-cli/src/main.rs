//! DEV/PROD sync entrypoint
//!
//! Loads the resolved settings, prepares a run context (direction,
//! overrides, credentials), executes the sync and prints the run report.
//! Exit codes follow the platform's component contract: 1 for
//! configuration errors, 2 for everything else.

mod api;
mod config;
mod sync;

use std::path::PathBuf;
use std::process::ExitCode;

use chrono::Utc;
use clap::Parser;
use log::error;

use api::{ResilienceConfig, RetryPolicy, RunError, StorageApiClient};
use config::Settings;
use sync::{FileStateStore, RunContext, SyncOrchestrator};

#[derive(Parser)]
#[command(
    name = "envsync",
    version,
    about = "Keeps the development and production projects of a data platform aligned"
)]
struct Cli {
    /// Path to the resolved settings JSON
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Path to the persisted run state (sync markers, token cache)
    #[arg(short, long, default_value = "state.json")]
    state: PathBuf,

    /// Run identifier stamped into change descriptions. Defaults to the
    /// platform run id from the environment, then to a timestamp.
    #[arg(long)]
    run_id: Option<String>,
}

impl Cli {
    fn resolve_run_id(&self) -> String {
        self.run_id
            .clone()
            .or_else(|| std::env::var("KBC_RUNID").ok())
            .unwrap_or_else(|| Utc::now().format("%Y%m%d%H%M%S").to_string())
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match run(&cli).await {
        Ok(clean) => {
            if clean {
                ExitCode::SUCCESS
            } else {
                // The run finished but some components failed
                ExitCode::from(2)
            }
        }
        Err(e) => {
            error!("{}", e);
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

async fn run(cli: &Cli) -> Result<bool, RunError> {
    let settings = Settings::load(&cli.config)?;
    let state = FileStateStore::load(cli.state.clone())
        .map_err(|e| RunError::Configuration(format!("{:#}", e)))?;

    let resilience = ResilienceConfig::default();
    let client = StorageApiClient::new(RetryPolicy::new(resilience.retry.clone()));

    let ctx = RunContext::prepare(&client, &state, &settings, cli.resolve_run_id()).await?;
    let orchestrator = SyncOrchestrator::new(&client, &state, &resilience);
    let report = orchestrator.run(&ctx).await?;

    println!("{}", report.render());
    Ok(!report.has_failures())
}
