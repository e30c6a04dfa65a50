//! Backup job endpoints
//!
//! | Method | Path                        | Response                 |
//! |--------|-----------------------------|--------------------------|
//! | GET    | `/api/v1/jobs`              | list of job ids          |
//! | GET    | `/api/v1/jobs/:jobId`       | `ResticJob`              |
//! | POST   | `/api/v1/jobs/:jobId/queue` | `ResticJob` or empty     |
//! | GET    | `/api/v1/health`            | `{ ok: bool }`           |

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::endpoint::{EndpointDescriptor, Params};
use crate::error::CacheError;
use crate::read::LiveRead;
use crate::schema::{EntityType, Field, ScalarKind, Schema, SchemaError};
use crate::subscription::Cache;

/// A backup job as the status view sees it, keyed by `job_id`
pub static RESTIC_JOB: EntityType = EntityType {
    name: "ResticJob",
    primary_key: "job_id",
    fields: &[
        Field::new("job_id", Schema::Scalar(ScalarKind::String)),
        Field::new(
            "job",
            Schema::Object(&[
                Field::new("cron", Schema::Scalar(ScalarKind::String)),
                Field::new("repository", Schema::Scalar(ScalarKind::Any)),
            ]),
        ),
    ],
};

static JOB_IDS: Schema = Schema::List(&Schema::Scalar(ScalarKind::String));
static JOB: Schema = Schema::Entity(&RESTIC_JOB);
/// The service answers a queue call with an empty body
static QUEUED_JOB: Schema = Schema::Optional(&JOB);
static HEALTH: Schema = Schema::Object(&[Field::new("ok", Schema::Scalar(ScalarKind::Bool))]);

/// Job entity returned by the detail and queue endpoints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResticJob {
    pub job_id: String,
    #[serde(default)]
    pub job: JobSchedule,
}

/// Schedule and target of a job
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobSchedule {
    /// Cron expression of the next runs
    #[serde(default)]
    pub cron: String,
    /// Repository the job backs up to; the service may send a URL string
    /// or a `{ url, password }` object
    #[serde(default)]
    pub repository: Value,
}

impl JobSchedule {
    /// Repository location, whichever form the service sent
    pub fn repository_url(&self) -> Option<&str> {
        match &self.repository {
            Value::String(url) => Some(url),
            Value::Object(fields) => fields.get("url").and_then(Value::as_str),
            _ => None,
        }
    }
}

/// Health check response
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Health {
    pub ok: bool,
}

/// Descriptors of every job endpoint, built once at startup
#[derive(Debug, Clone)]
pub struct JobEndpoints {
    pub job_ids: Arc<EndpointDescriptor>,
    pub job: Arc<EndpointDescriptor>,
    pub queue: Arc<EndpointDescriptor>,
    pub health: Arc<EndpointDescriptor>,
}

impl JobEndpoints {
    /// Builds the descriptors for a service at `base_url`
    ///
    /// Job ids and job details are polled every `poll_interval` while subscribed.
    pub fn new(base_url: &str, poll_interval: Duration) -> Self {
        Self {
            job_ids: EndpointDescriptor::get("getJobIds", base_url, "/api/v1/jobs", &JOB_IDS)
                .poll_every(poll_interval)
                .into_shared(),
            job: EndpointDescriptor::get("getJob", base_url, "/api/v1/jobs/:jobId", &JOB)
                .poll_every(poll_interval)
                .into_shared(),
            queue: EndpointDescriptor::post("queueJob", base_url, "/api/v1/jobs/:jobId/queue", &QUEUED_JOB)
                .into_shared(),
            health: EndpointDescriptor::get("health", base_url, "/api/v1/health", &HEALTH).into_shared(),
        }
    }
}

/// Parameters addressing one job
pub fn job_params(job_id: &str) -> Params {
    Params::new().with("jobId", job_id)
}

/// Typed access to the job endpoints through the cache
#[derive(Clone)]
pub struct JobsClient {
    cache: Cache,
    endpoints: JobEndpoints,
}

impl JobsClient {
    /// Creates a client using the cache's configured base URL and poll interval
    pub fn new(cache: Cache) -> Self {
        let endpoints = JobEndpoints::new(&cache.config().base_url, cache.config().poll_interval);
        Self { cache, endpoints }
    }

    pub fn with_endpoints(cache: Cache, endpoints: JobEndpoints) -> Self {
        Self { cache, endpoints }
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    pub fn endpoints(&self) -> &JobEndpoints {
        &self.endpoints
    }

    /// Ids of every configured job, waiting for the first response
    pub async fn job_ids(&self) -> Result<Vec<String>, CacheError> {
        let value = self.cache.suspend_read(&self.endpoints.job_ids, Params::new()).await?;
        decode(&self.endpoints.job_ids, value)
    }

    /// One job, waiting for the first response
    pub async fn job(&self, job_id: &str) -> Result<ResticJob, CacheError> {
        let value = self.cache.suspend_read(&self.endpoints.job, job_params(job_id)).await?;
        decode(&self.endpoints.job, value)
    }

    /// Queues a run of `job_id`
    ///
    /// Returns the job's post-queue state when the service sends one.
    pub async fn queue(&self, job_id: &str) -> Result<Option<ResticJob>, CacheError> {
        let value = self.cache.mutate(&self.endpoints.queue, job_params(job_id), None).await?;
        decode(&self.endpoints.queue, value)
    }

    pub async fn health(&self) -> Result<Health, CacheError> {
        let value = self.cache.suspend_read(&self.endpoints.health, Params::new()).await?;
        decode(&self.endpoints.health, value)
    }

    /// Live view of the job id list
    pub fn watch_job_ids(&self) -> Result<LiveRead, CacheError> {
        self.cache.live_read(&self.endpoints.job_ids, Params::new())
    }

    /// Live view of one job
    pub fn watch_job(&self, job_id: &str) -> Result<LiveRead, CacheError> {
        self.cache.live_read(&self.endpoints.job, job_params(job_id))
    }
}

/// Converts a denormalized value into its typed form
pub fn decode<T: DeserializeOwned>(endpoint: &EndpointDescriptor, value: Value) -> Result<T, CacheError> {
    serde_json::from_value(value).map_err(|e| CacheError::schema(endpoint.name, SchemaError::new("$", e.to_string())))
}
