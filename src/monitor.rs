//! Text status view of the backup jobs
//!
//! Renders the job list the way the status window lays it out: an active
//! job pane followed by every inactive job with its next scheduled run.

use std::collections::BTreeMap;
use std::future::Future;
use std::io::{self, Write};

use futures::stream::{BoxStream, SelectAll};
use futures::StreamExt;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::api::jobs::{JobsClient, ResticJob};
use crate::error::CacheError;
use crate::read::ReadState;

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("Failed to write output: {0}")]
    Io(#[from] io::Error),
}

/// Job id as a heading: first letter upper-cased
pub fn display_name(job_id: &str) -> String {
    let mut chars = job_id.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// One line of the job list
pub fn format_job_line(job_id: &str, state: &ReadState) -> String {
    let schedule = match state {
        ReadState::Pending => "loading...".to_string(),
        ReadState::Failed(e) => format!("unavailable ({e})"),
        ReadState::Ready(value) => schedule_of(value),
        ReadState::Stale { value, error } => format!("{} (refresh failed: {error})", schedule_of(value)),
    };
    format!("  {}  Next run: {}", display_name(job_id), schedule)
}

fn schedule_of(value: &Value) -> String {
    match serde_json::from_value::<ResticJob>(value.clone()) {
        Ok(job) if job.job.cron.is_empty() => "not scheduled".to_string(),
        Ok(job) => job.job.cron,
        Err(_) => "unreadable".to_string(),
    }
}

/// Job ids carried by a job-list read, empty until it is ready
pub fn job_ids_of(state: &ReadState) -> Vec<String> {
    state
        .value()
        .and_then(|value| serde_json::from_value::<Vec<String>>(value.clone()).ok())
        .unwrap_or_default()
}

/// Full status view for the given job-list state and per-job states
pub fn render_status(job_ids: &ReadState, jobs: &BTreeMap<String, ReadState>) -> String {
    let mut out = String::from("Active job\n  No Active Job\n\nInactive Jobs\n");
    match job_ids {
        ReadState::Pending => out.push_str("  Loading jobs...\n"),
        ReadState::Failed(e) => out.push_str(&format!("  Could not load jobs: {e}\n")),
        ReadState::Ready(_) | ReadState::Stale { .. } => {
            if let ReadState::Stale { error, .. } = job_ids {
                out.push_str(&format!("  Job list refresh failed: {error}\n"));
            }
            let ids = job_ids_of(job_ids);
            if ids.is_empty() {
                out.push_str("  No jobs configured\n");
            }
            for id in ids {
                let state = jobs.get(&id).cloned().unwrap_or(ReadState::Pending);
                out.push_str(&format_job_line(&id, &state));
                out.push('\n');
            }
        }
    }
    out
}

/// Prints every job and its schedule once
pub async fn run_list<W: Write>(client: &JobsClient, out: &mut W) -> Result<(), MonitorError> {
    let ids = client.job_ids().await?;
    let details = futures::future::join_all(ids.iter().map(|id| client.job(id))).await;

    let jobs: BTreeMap<String, ReadState> = ids
        .iter()
        .cloned()
        .zip(details)
        .map(|(id, detail)| {
            let state = match detail {
                Ok(job) => ReadState::Ready(serde_json::to_value(job).unwrap_or(Value::Null)),
                Err(e) => ReadState::Failed(e),
            };
            (id, state)
        })
        .collect();

    let listed = ReadState::Ready(Value::from(ids));
    out.write_all(render_status(&listed, &jobs).as_bytes())?;
    out.flush()?;
    Ok(())
}

/// Live job views keyed by id, merged into one stream of updates
struct JobWatches {
    ids: Vec<String>,
    updates: SelectAll<BoxStream<'static, (String, ReadState)>>,
}

impl JobWatches {
    fn new() -> Self {
        Self {
            ids: Vec::new(),
            updates: SelectAll::new(),
        }
    }

    /// Follows exactly `ids`, seeding `jobs` with their current states
    ///
    /// New subscriptions are taken before the old ones are dropped so jobs
    /// present in both lists keep their data. An id that cannot be watched
    /// is shown as failed.
    fn follow(&mut self, client: &JobsClient, ids: Vec<String>, jobs: &mut BTreeMap<String, ReadState>) {
        if ids == self.ids {
            return;
        }
        let mut updates = SelectAll::new();
        for id in &ids {
            match client.watch_job(id) {
                Ok(live) => {
                    jobs.insert(id.clone(), live.current());
                    let id = id.clone();
                    updates.push(live.into_stream().map(move |state| (id.clone(), state)).boxed());
                }
                Err(e) => {
                    warn!(event = "monitor.watch_failed", job_id = %id, error = %e);
                    jobs.insert(id.clone(), ReadState::Failed(e));
                }
            }
        }
        jobs.retain(|id, _| ids.contains(id));
        debug!(event = "monitor.jobs_followed", count = ids.len());
        self.updates = updates;
        self.ids = ids;
    }
}

/// Keeps the status view on `out`, reprinting on every change until `shutdown` resolves
pub async fn run_watch<W, S>(client: &JobsClient, out: &mut W, shutdown: S) -> Result<(), MonitorError>
where
    W: Write,
    S: Future<Output = ()>,
{
    let mut job_ids = client.watch_job_ids()?;
    let mut ids_state = job_ids.current();
    let mut jobs = BTreeMap::new();
    let mut watches = JobWatches::new();
    watches.follow(client, job_ids_of(&ids_state), &mut jobs);
    write_view(out, &ids_state, &jobs)?;

    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!(event = "monitor.watch_stopped");
                break;
            }
            next = job_ids.next() => {
                let Some(state) = next else { break };
                ids_state = state;
                watches.follow(client, job_ids_of(&ids_state), &mut jobs);
            }
            Some((id, state)) = watches.updates.next(), if !watches.updates.is_empty() => {
                jobs.insert(id, state);
            }
        }
        write_view(out, &ids_state, &jobs)?;
    }
    Ok(())
}

fn write_view<W: Write>(out: &mut W, job_ids: &ReadState, jobs: &BTreeMap<String, ReadState>) -> io::Result<()> {
    writeln!(out, "{}", render_status(job_ids, jobs))?;
    out.flush()
}

/// Queues a run of `job_id` and reports the outcome
pub async fn run_queue<W: Write>(client: &JobsClient, job_id: &str, out: &mut W) -> Result<(), MonitorError> {
    let queued = client.queue(job_id).await?;
    writeln!(out, "Queued {}", display_name(job_id))?;
    if let Some(job) = queued.filter(|job| !job.job.cron.is_empty()) {
        writeln!(out, "  Next run: {}", job.job.cron)?;
    }
    out.flush()?;
    Ok(())
}

/// Reports whether the service answers its health check
pub async fn run_health<W: Write>(client: &JobsClient, out: &mut W) -> Result<bool, MonitorError> {
    let health = client.health().await?;
    let status = if health.ok { "ok" } else { "unhealthy" };
    writeln!(out, "{}: {}", client.cache().config().base_url, status)?;
    out.flush()?;
    Ok(health.ok)
}
