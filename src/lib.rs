//! jobwatch
//!
//! Reactive resource cache for the backup status window, plus the job API
//! and text views built on it. The binary wires these to a CLI; integration
//! tests use the library directly.

pub mod api;
pub mod cli;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod executor;
pub mod logging;
pub mod monitor;
pub mod read;
pub mod retry;
pub mod scheduler;
pub mod schema;
pub mod store;
pub mod subscription;
pub mod transport;

pub use api::jobs::JobsClient;
pub use config::CacheConfig;
pub use endpoint::{EndpointDescriptor, Params};
pub use error::CacheError;
pub use read::{CallbackSubscription, LiveRead, ReadState, SubscriptionHandle};
pub use schema::{EntityType, Field, ScalarKind, Schema};
pub use subscription::{Cache, Snapshot, SubscriptionKey, SubscriptionStatus};
pub use transport::{HttpTransport, Transport};
