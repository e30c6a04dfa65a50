//! Consumer-facing read modes
//!
//! * [`SubscriptionHandle::suspend`] parks the caller until the first value
//!   or error exists, then answers immediately on every later call.
//! * [`LiveRead`] never parks: it reports the current state, `Pending` when
//!   there is no data yet, and yields again on every relevant update.
//! * [`CallbackSubscription`] pushes every update into a closure.
//!
//! Every mode holds a subscription. Releasing it (explicitly or on drop)
//! decrements the key's subscriber count exactly once.

use std::fmt;
use std::sync::Weak;

use futures::stream::{self, Stream};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::CacheError;
use crate::subscription::{CacheInner, Snapshot, SubscriptionKey, SubscriptionStatus};

/// Result of a non-blocking read
#[derive(Debug, Clone, PartialEq)]
pub enum ReadState {
    /// No data yet
    Pending,
    Ready(Value),
    /// Data is present but the last refresh failed
    Stale { value: Value, error: CacheError },
    /// No data, the last attempt failed
    Failed(CacheError),
}

impl ReadState {
    pub fn value(&self) -> Option<&Value> {
        match self {
            ReadState::Ready(value) | ReadState::Stale { value, .. } => Some(value),
            _ => None,
        }
    }

    /// The failure carried by a stale or failed read
    pub fn error(&self) -> Option<&CacheError> {
        match self {
            ReadState::Stale { error, .. } | ReadState::Failed(error) => Some(error),
            _ => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, ReadState::Pending)
    }
}

impl From<&Snapshot> for ReadState {
    fn from(snapshot: &Snapshot) -> Self {
        match (&snapshot.value, &snapshot.error) {
            (Some(value), None) => ReadState::Ready(value.clone()),
            (Some(value), Some(error)) => ReadState::Stale {
                value: value.clone(),
                error: error.clone(),
            },
            (None, Some(error)) if snapshot.status == SubscriptionStatus::Error => ReadState::Failed(error.clone()),
            _ => ReadState::Pending,
        }
    }
}

/// A registered interest in one subscription key
///
/// Dropping the handle unsubscribes.
pub struct SubscriptionHandle {
    cache: Weak<CacheInner>,
    key: SubscriptionKey,
    events: watch::Receiver<Snapshot>,
    /// Last failure already reported by `suspend`
    seen_error_seq: u64,
    released: bool,
}

impl SubscriptionHandle {
    pub(crate) fn new(cache: Weak<CacheInner>, key: SubscriptionKey, events: watch::Receiver<Snapshot>) -> Self {
        Self {
            cache,
            key,
            events,
            seen_error_seq: 0,
            released: false,
        }
    }

    pub fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    /// Current state, without waiting
    pub fn read(&self) -> ReadState {
        ReadState::from(&*self.events.borrow())
    }

    /// Full current snapshot, including a poll error kept next to a value
    pub fn snapshot(&self) -> Snapshot {
        self.events.borrow().clone()
    }

    /// Returns the current value, parking until one exists
    ///
    /// A failure is returned once; calling again after that retries the
    /// request and parks until the new outcome.
    pub async fn suspend(&mut self) -> Result<Value, CacheError> {
        if self.released {
            return Err(CacheError::Closed);
        }
        loop {
            let snapshot = self.events.borrow_and_update().clone();
            if let Some(value) = snapshot.value {
                return Ok(value);
            }
            if snapshot.status == SubscriptionStatus::Error {
                match snapshot.error {
                    Some(error) if snapshot.error_seq > self.seen_error_seq => {
                        self.seen_error_seq = snapshot.error_seq;
                        return Err(error);
                    }
                    _ => self.refetch(),
                }
            }
            if self.events.changed().await.is_err() {
                return Err(CacheError::Closed);
            }
        }
    }

    /// Waits for the next update and returns the new state
    ///
    /// Returns `None` once the subscription has been torn down.
    pub async fn changed(&mut self) -> Option<ReadState> {
        if self.released {
            return None;
        }
        self.events.changed().await.ok()?;
        Some(ReadState::from(&*self.events.borrow_and_update()))
    }

    /// Re-issues the request if none is in flight
    pub fn refetch(&self) {
        if let Some(cache) = self.cache.upgrade() {
            cache.refetch(&self.key);
        }
    }

    /// Releases this handle's interest; later calls do nothing
    pub fn unsubscribe(&mut self) {
        if std::mem::replace(&mut self.released, true) {
            return;
        }
        if let Some(cache) = self.cache.upgrade() {
            cache.release(&self.key);
        }
    }

    fn receiver(&self) -> watch::Receiver<Snapshot> {
        self.events.clone()
    }
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("key", &self.key)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

/// Streaming read of one subscription
///
/// Every update is delivered as a [`ReadState`], including a failed refresh
/// of a value already present ([`ReadState::Stale`]).
#[derive(Debug)]
pub struct LiveRead {
    handle: SubscriptionHandle,
}

impl LiveRead {
    pub(crate) fn new(handle: SubscriptionHandle) -> Self {
        Self { handle }
    }

    /// Current value, or `Pending` if none has arrived yet
    pub fn current(&self) -> ReadState {
        self.handle.read()
    }

    pub fn snapshot(&self) -> Snapshot {
        self.handle.snapshot()
    }

    /// Waits for the next update
    pub async fn next(&mut self) -> Option<ReadState> {
        self.handle.changed().await
    }

    pub fn handle(&self) -> &SubscriptionHandle {
        &self.handle
    }

    /// Every update as a stream, ending when the subscription is torn down
    pub fn into_stream(self) -> impl Stream<Item = ReadState> + Send + 'static {
        stream::unfold(self, |mut live| async move {
            let state = live.next().await?;
            Some((state, live))
        })
    }
}

/// Subscription that forwards every update to a closure
///
/// The closure runs on a tokio task; `unsubscribe` (or drop) stops it and
/// releases the subscription immediately.
#[derive(Debug)]
pub struct CallbackSubscription {
    handle: SubscriptionHandle,
    task: Option<JoinHandle<()>>,
}

impl CallbackSubscription {
    pub(crate) fn spawn<F>(handle: SubscriptionHandle, mut on_update: F) -> Self
    where
        F: FnMut(ReadState) + Send + 'static,
    {
        let mut events = handle.receiver();
        let task = tokio::spawn(async move {
            on_update(ReadState::from(&*events.borrow_and_update()));
            while events.changed().await.is_ok() {
                let state = ReadState::from(&*events.borrow_and_update());
                on_update(state);
            }
        });
        Self {
            handle,
            task: Some(task),
        }
    }

    pub fn key(&self) -> &SubscriptionKey {
        self.handle.key()
    }

    /// Stops delivery and releases the subscription; later calls do nothing
    pub fn unsubscribe(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.handle.unsubscribe();
    }
}

impl Drop for CallbackSubscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
