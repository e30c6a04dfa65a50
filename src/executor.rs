//! Request executor
//!
//! Issues HTTP calls through a [`Transport`]. Reads with an identical
//! (method, URL, body) key share one in-flight call: the first caller starts
//! it, later callers attach as waiters, and every waiter receives the same
//! result. The call itself lives only as long as at least one waiter does;
//! once the last waiter drops, the call is abandoned and its result never
//! reaches the store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::{BoxFuture, FutureExt, Shared, WeakShared};
use serde_json::Value;
use tracing::{debug, warn};

use crate::endpoint::{RequestKey, ResolvedRequest};
use crate::error::CacheError;
use crate::retry::RetryPolicy;
use crate::transport::Transport;

type SharedCall = Shared<BoxFuture<'static, Result<Value, CacheError>>>;
type InflightMap = Arc<Mutex<HashMap<RequestKey, WeakShared<BoxFuture<'static, Result<Value, CacheError>>>>>>;

/// Issues, deduplicates and retries HTTP requests
pub struct RequestExecutor {
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
    inflight: InflightMap,
}

impl RequestExecutor {
    pub fn new(transport: Arc<dyn Transport>, retry: RetryPolicy) -> Self {
        Self {
            transport,
            retry,
            inflight: Arc::default(),
        }
    }

    /// Executes a read, joining an identical call already in flight
    pub async fn execute(&self, request: &ResolvedRequest) -> Result<Value, CacheError> {
        self.join_or_start(request).await
    }

    /// Executes a mutation
    ///
    /// Mutations are never coalesced: every call reaches the network, in the
    /// order callers invoke this method.
    pub async fn execute_uncoalesced(&self, request: &ResolvedRequest) -> Result<Value, CacheError> {
        send_with_retry(self.transport.clone(), self.retry.clone(), request.clone()).await
    }

    /// Number of distinct calls that still have at least one waiter
    pub fn pending_requests(&self) -> usize {
        lock(&self.inflight)
            .values()
            .filter(|weak| weak.upgrade().is_some())
            .count()
    }

    /// Forgets every in-flight call; existing waiters still receive their result
    pub fn clear(&self) {
        lock(&self.inflight).clear();
    }

    fn join_or_start(&self, request: &ResolvedRequest) -> SharedCall {
        let key = request.key();
        let mut inflight = lock(&self.inflight);

        if let Some(call) = inflight.get(&key).and_then(WeakShared::upgrade) {
            debug!(event = "executor.request_joined", method = %key.method, url = %key.url);
            return call;
        }

        // Entries whose waiters all went away are dead weight.
        inflight.retain(|_, weak| weak.upgrade().is_some());

        let registry = self.inflight.clone();
        let own_key = key.clone();
        let transport = self.transport.clone();
        let retry = self.retry.clone();
        let request = request.clone();
        let call = async move {
            let result = send_with_retry(transport, retry, request).await;
            lock(&registry).remove(&own_key);
            result
        }
        .boxed()
        .shared();

        if let Some(weak) = call.downgrade() {
            inflight.insert(key, weak);
        }
        call
    }
}

async fn send_with_retry(
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
    request: ResolvedRequest,
) -> Result<Value, CacheError> {
    let mut backoff = retry.backoff();
    loop {
        match transport.send(request.clone()).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() => match backoff.next_delay() {
                Some(delay) => {
                    warn!(
                        event = "executor.retry_scheduled",
                        method = %request.method,
                        url = %request.url,
                        attempt = backoff.attempt(),
                        delay_ms = delay.as_millis() as u64,
                        error = %e
                    );
                    tokio::time::sleep(delay).await;
                }
                None => return Err(e),
            },
            Err(e) => return Err(e),
        }
    }
}

/// Locks a mutex, recovering the data if a holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
