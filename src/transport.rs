//! HTTP transport
//!
//! The executor talks to the network through the [`Transport`] trait so that
//! timer-driven behaviour can be exercised against a scripted transport.

use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::Client;
use serde_json::Value;

use crate::endpoint::ResolvedRequest;
use crate::error::CacheError;
use crate::schema::SchemaError;

/// Longest client-error body kept in an error message
const MAX_ERROR_BODY: usize = 200;

/// Sends one request and classifies the outcome
///
/// Implementations map connection failures and timeouts to
/// `CacheError::Network`, 5xx to `Server`, 4xx to `Client` and an
/// unparseable body to `SchemaMismatch`. An empty body is `Value::Null`.
pub trait Transport: Send + Sync + 'static {
    fn send(&self, request: ResolvedRequest) -> BoxFuture<'static, Result<Value, CacheError>>;
}

/// Transport backed by a `reqwest` client
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// Creates a transport whose calls time out after `timeout`
    ///
    /// # Returns
    /// * `Ok(HttpTransport)` on success
    /// * `Err(CacheError::Network)` if the TLS backend cannot be initialised
    pub fn new(timeout: Duration) -> Result<Self, CacheError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CacheError::Network {
                url: String::new(),
                message: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self { client })
    }

    /// Create a transport with a custom HTTP client
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

impl Transport for HttpTransport {
    fn send(&self, request: ResolvedRequest) -> BoxFuture<'static, Result<Value, CacheError>> {
        let client = self.client.clone();
        Box::pin(async move {
            let url = request.url.to_string();
            let mut builder = client.request(request.method, request.url);
            if let Some(body) = &request.body {
                builder = builder.json(body);
            }

            let response = builder.send().await.map_err(|e| network(&url, &e))?;
            let status = response.status();
            let text = response.text().await.map_err(|e| network(&url, &e))?;

            if status.is_server_error() {
                return Err(CacheError::Server {
                    url,
                    status: status.as_u16(),
                });
            }
            if status.is_client_error() {
                return Err(CacheError::Client {
                    url,
                    status: status.as_u16(),
                    message: truncate(&text, MAX_ERROR_BODY),
                });
            }

            parse_body(&url, &text)
        })
    }
}

fn network(url: &str, error: &reqwest::Error) -> CacheError {
    let message = if error.is_timeout() {
        "request timed out".to_string()
    } else {
        error.to_string()
    };
    CacheError::Network {
        url: url.to_string(),
        message,
    }
}

fn parse_body(url: &str, text: &str) -> Result<Value, CacheError> {
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(text)
        .map_err(|e| CacheError::schema(url, SchemaError::new("$", format!("invalid JSON: {e}"))))
}

fn truncate(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((index, _)) => format!("{}...", &text[..index]),
        None => text.to_string(),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted transport for timer-driven tests

    use std::collections::{HashMap, VecDeque};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use futures::future::BoxFuture;
    use serde_json::Value;
    use tokio::time::Instant;

    use super::Transport;
    use crate::endpoint::ResolvedRequest;
    use crate::error::CacheError;

    /// A call observed by [`ScriptedTransport`]
    #[derive(Debug, Clone)]
    pub struct Call {
        pub method: reqwest::Method,
        pub path: String,
        pub at: Instant,
    }

    #[derive(Default)]
    struct Script {
        /// Queued one-shot responses per path, consumed in order
        queued: HashMap<String, VecDeque<Result<Value, CacheError>>>,
        /// Fallback response per path
        fixed: HashMap<String, Result<Value, CacheError>>,
        calls: Vec<Call>,
    }

    /// Answers by URL path after an optional delay and records every call
    #[derive(Clone, Default)]
    pub struct ScriptedTransport {
        script: Arc<Mutex<Script>>,
        delay: Arc<Mutex<Duration>>,
    }

    impl ScriptedTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_delay(self, delay: Duration) -> Self {
            *self.delay.lock().unwrap() = delay;
            self
        }

        /// Always answer `path` with `response`
        pub fn respond(&self, path: &str, response: Result<Value, CacheError>) {
            self.script.lock().unwrap().fixed.insert(path.to_string(), response);
        }

        /// Answer the next call to `path` with `response`
        pub fn respond_once(&self, path: &str, response: Result<Value, CacheError>) {
            self.script
                .lock()
                .unwrap()
                .queued
                .entry(path.to_string())
                .or_default()
                .push_back(response);
        }

        pub fn calls(&self) -> Vec<Call> {
            self.script.lock().unwrap().calls.clone()
        }

        pub fn calls_to(&self, path: &str) -> usize {
            self.calls().iter().filter(|call| call.path == path).count()
        }
    }

    impl Transport for ScriptedTransport {
        fn send(&self, request: ResolvedRequest) -> BoxFuture<'static, Result<Value, CacheError>> {
            let path = request.url.path().to_string();
            let delay = *self.delay.lock().unwrap();
            let response = {
                let mut script = self.script.lock().unwrap();
                script.calls.push(Call {
                    method: request.method.clone(),
                    path: path.clone(),
                    at: Instant::now(),
                });
                let queued = script.queued.get_mut(&path).and_then(VecDeque::pop_front);
                queued.or_else(|| script.fixed.get(&path).cloned()).unwrap_or_else(|| {
                    Err(CacheError::Client {
                        url: path.clone(),
                        status: 404,
                        message: "not scripted".to_string(),
                    })
                })
            };
            Box::pin(async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                response
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_body_empty_is_null() {
        assert_eq!(parse_body("u", "").unwrap(), Value::Null);
        assert_eq!(parse_body("u", "  \n").unwrap(), Value::Null);
    }

    #[test]
    fn test_parse_body_invalid_json_is_schema_mismatch() {
        let err = parse_body("http://127.0.0.1:42038/api/v1/jobs", "<html>").unwrap_err();
        assert!(matches!(err, CacheError::SchemaMismatch { .. }));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_parse_body_valid_json() {
        assert_eq!(
            parse_body("u", r#"["nightly","weekly"]"#).unwrap(),
            serde_json::json!(["nightly", "weekly"])
        );
    }

    #[test]
    fn test_truncate_long_bodies() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdefghij", 4), "abcd...");
    }
}
