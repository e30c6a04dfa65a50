//! jobwatch - status of scheduled restic backup jobs
//!
//! Prints the jobs configured in the local backup service and keeps the
//! view current while watching.

use std::io;
use std::process::ExitCode;

use clap::Parser;
use tracing::error;

use jobwatch::cli::{Cli, Command};
use jobwatch::{logging, monitor, Cache, CacheConfig, JobsClient};

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init_logging(cli.verbose);

    let config = match CacheConfig::from_cli(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::from(2);
        }
    };

    let cache = match Cache::new(config) {
        Ok(cache) => cache,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };
    let client = JobsClient::new(cache.clone());
    let mut stdout = io::stdout().lock();

    let result = match &cli.command {
        Command::List => monitor::run_list(&client, &mut stdout).await.map(|_| true),
        Command::Watch => {
            let ctrl_c = async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!(event = "monitor.signal_failed", error = %e);
                }
            };
            monitor::run_watch(&client, &mut stdout, ctrl_c).await.map(|_| true)
        }
        Command::Queue { job_id } => monitor::run_queue(&client, job_id, &mut stdout).await.map(|_| true),
        Command::Health => monitor::run_health(&client, &mut stdout).await,
    };

    cache.shutdown();

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}
