//! Command-line interface parsing for jobwatch
//!
//! Global flags override the cache defaults; the subcommand picks the view.

use std::time::Duration;

use clap::{Parser, Subcommand};
use reqwest::Url;
use thiserror::Error;

use crate::config::{CacheConfig, DEFAULT_BASE_URL};

/// Error types for CLI argument handling
#[derive(Debug, Error)]
pub enum CliError {
    /// The base URL does not parse or cannot carry a path
    #[error("Invalid base URL '{url}': {reason}")]
    InvalidBaseUrl { url: String, reason: String },

    /// An interval flag was zero where a positive value is required
    #[error("Invalid value for --{flag}: must be greater than zero")]
    ZeroDuration { flag: &'static str },
}

/// jobwatch - status of scheduled restic backup jobs
#[derive(Parser, Debug)]
#[command(name = "jobwatch")]
#[command(about = "Status of scheduled restic backup jobs")]
#[command(version)]
pub struct Cli {
    /// Address of the backup service
    #[arg(long, global = true, value_name = "URL", default_value = DEFAULT_BASE_URL)]
    pub base_url: String,

    /// Poll interval for job ids and job details, in milliseconds
    #[arg(long, global = true, value_name = "MS", default_value_t = 5000)]
    pub poll_interval_ms: u64,

    /// Delay before an unused subscription is dropped, in milliseconds
    #[arg(long, global = true, value_name = "MS", default_value_t = 1000)]
    pub grace_ms: u64,

    /// Per-request timeout, in milliseconds
    #[arg(long, global = true, value_name = "MS", default_value_t = 10_000)]
    pub timeout_ms: u64,

    /// Log cache activity at debug level
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Print every job and its schedule once
    List,
    /// Keep the job list on screen, reprinting on every change until Ctrl-C
    Watch,
    /// Queue a run of a job
    Queue {
        /// Id of the job to queue
        #[arg(value_name = "JOB_ID")]
        job_id: String,
    },
    /// Check that the backup service is reachable
    Health,
}

impl CacheConfig {
    /// Builds the cache configuration from parsed CLI arguments
    ///
    /// # Returns
    /// * `Ok(CacheConfig)` with the flags applied over the defaults
    /// * `Err(CliError)` if the base URL is unusable or an interval is zero
    pub fn from_cli(cli: &Cli) -> Result<Self, CliError> {
        let url = Url::parse(&cli.base_url).map_err(|e| CliError::InvalidBaseUrl {
            url: cli.base_url.clone(),
            reason: e.to_string(),
        })?;
        if url.cannot_be_a_base() {
            return Err(CliError::InvalidBaseUrl {
                url: cli.base_url.clone(),
                reason: "URL cannot carry a path".to_string(),
            });
        }
        if cli.poll_interval_ms == 0 {
            return Err(CliError::ZeroDuration { flag: "poll-interval-ms" });
        }
        if cli.timeout_ms == 0 {
            return Err(CliError::ZeroDuration { flag: "timeout-ms" });
        }

        Ok(CacheConfig {
            base_url: cli.base_url.trim_end_matches('/').to_string(),
            poll_interval: Duration::from_millis(cli.poll_interval_ms),
            grace_period: Duration::from_millis(cli.grace_ms),
            request_timeout: Duration::from_millis(cli.timeout_ms),
            ..CacheConfig::default()
        })
    }
}
