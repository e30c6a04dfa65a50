//! Endpoints of the backup service
//!
//! Declares the remote resources the status view reads and the entity types
//! their responses are normalized into.

pub mod jobs;

pub use jobs::{JobEndpoints, JobSchedule, JobsClient, ResticJob, RESTIC_JOB};
