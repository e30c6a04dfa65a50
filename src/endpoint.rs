//! Endpoint descriptors
//!
//! A descriptor maps a logical remote resource to a physical HTTP call. It is
//! built once at startup and shared, so the executor and the subscription
//! manager agree on exactly one URL per (endpoint, parameters) pair.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use reqwest::{Method, Url};
use serde_json::Value;

use crate::error::CacheError;
use crate::schema::Schema;

/// Parameter values for a path template and query string
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Params(BTreeMap<String, String>);

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a parameter, replacing any previous value
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Params {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl fmt::Display for Params {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (name, value) in &self.0 {
            if !first {
                f.write_str(",")?;
            }
            write!(f, "{name}={value}")?;
            first = false;
        }
        Ok(())
    }
}

/// Immutable description of a remote resource
#[derive(Debug, Clone)]
pub struct EndpointDescriptor {
    /// Name used in logs and errors
    pub name: &'static str,
    /// Scheme, host and port, e.g. `http://127.0.0.1:42038`
    pub url_prefix: String,
    /// Path template with `:name` segments, e.g. `/api/v1/jobs/:jobId`
    pub path: &'static str,
    pub method: Method,
    /// Declared shape of the response body
    pub schema: &'static Schema,
    /// Mutations are never polled and never deduplicated
    pub side_effect: bool,
    pub poll_interval: Option<Duration>,
}

impl EndpointDescriptor {
    /// A `GET` endpoint without side effects
    pub fn get(name: &'static str, url_prefix: impl Into<String>, path: &'static str, schema: &'static Schema) -> Self {
        Self {
            name,
            url_prefix: url_prefix.into(),
            path,
            method: Method::GET,
            schema,
            side_effect: false,
            poll_interval: None,
        }
    }

    /// A `POST` endpoint flagged as a mutation
    pub fn post(name: &'static str, url_prefix: impl Into<String>, path: &'static str, schema: &'static Schema) -> Self {
        Self {
            method: Method::POST,
            side_effect: true,
            ..Self::get(name, url_prefix, path, schema)
        }
    }

    /// Re-fetch every `interval` while subscribed
    pub fn poll_every(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Interval at which subscriptions to this endpoint are polled
    ///
    /// Always `None` for mutations and for zero intervals.
    pub fn effective_poll_interval(&self) -> Option<Duration> {
        if self.side_effect {
            return None;
        }
        self.poll_interval.filter(|interval| !interval.is_zero())
    }

    /// Identity used in subscription keys
    pub fn id(&self) -> String {
        format!("{} {}{}", self.method, self.url_prefix, self.path)
    }

    /// Named parameters of the path template, in order
    pub fn path_parameters(&self) -> impl Iterator<Item = &'static str> {
        self.path
            .split('/')
            .filter_map(|segment| segment.strip_prefix(':'))
    }

    /// Builds the concrete request for `params`
    ///
    /// Parameters the template does not use are appended as a query string.
    ///
    /// # Arguments
    /// * `params` - Named values; every `:name` segment needs a non-empty one
    /// * `body` - JSON body sent with the request
    ///
    /// # Returns
    /// * `Ok(ResolvedRequest)` with a percent-encoded URL
    /// * `Err(CacheError::MissingParameter)` for a path parameter without a value
    /// * `Err(CacheError::InvalidUrl)` if the URL prefix does not parse
    pub fn resolve(&self, params: &Params, body: Option<Value>) -> Result<ResolvedRequest, CacheError> {
        let mut url = Url::parse(&self.url_prefix).map_err(|e| CacheError::InvalidUrl {
            endpoint: self.name,
            reason: e.to_string(),
        })?;

        let mut used = BTreeSet::new();
        {
            let mut segments = url.path_segments_mut().map_err(|_| CacheError::InvalidUrl {
                endpoint: self.name,
                reason: format!("{} cannot be a base url", self.url_prefix),
            })?;
            segments.pop_if_empty();
            for segment in self.path.split('/').filter(|s| !s.is_empty()) {
                match segment.strip_prefix(':') {
                    Some(name) => {
                        let value = params
                            .get(name)
                            .filter(|value| !value.is_empty())
                            .ok_or_else(|| CacheError::MissingParameter {
                                endpoint: self.name,
                                parameter: name.to_string(),
                            })?;
                        used.insert(name);
                        segments.push(value);
                    }
                    None => {
                        segments.push(segment);
                    }
                }
            }
        }

        let mut query = params.iter().filter(|(name, _)| !used.contains(name)).peekable();
        if query.peek().is_some() {
            url.query_pairs_mut().extend_pairs(query);
        }

        Ok(ResolvedRequest {
            method: self.method.clone(),
            url,
            body,
        })
    }
}

/// A concrete HTTP call
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedRequest {
    pub method: Method,
    pub url: Url,
    pub body: Option<Value>,
}

impl ResolvedRequest {
    /// Key under which identical in-flight calls are shared
    pub fn key(&self) -> RequestKey {
        RequestKey {
            method: self.method.clone(),
            url: self.url.to_string(),
            body: self.body.as_ref().map(Value::to_string).unwrap_or_default(),
        }
    }
}

/// (method, resolved URL, serialized body)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
    pub method: Method,
    pub url: String,
    pub body: String,
}
