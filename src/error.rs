//! Error taxonomy for the resource cache
//!
//! A single `CacheError` travels through every layer. It is `Clone` because one
//! in-flight request hands the same result to every waiter attached to it.

use thiserror::Error;

use crate::schema::SchemaError;
use crate::store::EntityKey;

/// Errors produced by the cache and its HTTP transport
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CacheError {
    /// Connection refused, reset or timed out
    #[error("network error calling {url}: {message}")]
    Network { url: String, message: String },

    /// The service answered with a 5xx status
    #[error("server error {status} from {url}")]
    Server { url: String, status: u16 },

    /// The service answered with a 4xx status
    #[error("client error {status} from {url}: {message}")]
    Client {
        url: String,
        status: u16,
        message: String,
    },

    /// The response body does not have the shape the endpoint declares
    #[error("response from {endpoint} does not match its schema: {source}")]
    SchemaMismatch {
        endpoint: String,
        #[source]
        source: SchemaError,
    },

    /// A reference in a normalized tree points at a record the store does not hold
    #[error("entity {0} is referenced but missing from the store")]
    EntityNotFound(EntityKey),

    /// A named path segment has no value
    #[error("missing parameter `{parameter}` for endpoint {endpoint}")]
    MissingParameter {
        endpoint: &'static str,
        parameter: String,
    },

    /// The URL prefix of an endpoint cannot be parsed
    #[error("invalid url for endpoint {endpoint}: {reason}")]
    InvalidUrl {
        endpoint: &'static str,
        reason: String,
    },

    /// Side-effecting endpoints can only be mutated, never subscribed to
    #[error("endpoint {0} has side effects and cannot be read")]
    NotReadable(&'static str),

    /// The cache has been shut down
    #[error("cache has been shut down")]
    Closed,
}

impl CacheError {
    /// Whether a retry can reasonably succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, CacheError::Network { .. } | CacheError::Server { .. })
    }

    /// Returns the HTTP status for `Client` and `Server` errors
    pub fn status(&self) -> Option<u16> {
        match self {
            CacheError::Client { status, .. } | CacheError::Server { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub(crate) fn schema(endpoint: &str, source: SchemaError) -> Self {
        CacheError::SchemaMismatch {
            endpoint: endpoint.to_string(),
            source,
        }
    }
}
