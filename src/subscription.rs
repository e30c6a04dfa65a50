//! Subscription manager
//!
//! Consumers register interest in an (endpoint, parameters) pair. Interest is
//! reference counted per key: the first subscriber triggers the initial fetch,
//! polling runs while the count is positive, and the subscription record is
//! dropped a grace period after the last subscriber leaves. Updates are
//! published on a `watch` channel per key.
//!
//! [`Cache`] is the process-scoped owner of the store, the executor and all
//! subscriptions. Construct it once, share it by cloning, and tear it down
//! with [`Cache::shutdown`].

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::CacheConfig;
use crate::endpoint::{EndpointDescriptor, Params, ResolvedRequest};
use crate::error::CacheError;
use crate::executor::{lock, RequestExecutor};
use crate::read::{CallbackSubscription, LiveRead, ReadState, SubscriptionHandle};
use crate::scheduler::PollTimer;
use crate::schema::EntityType;
use crate::store::{EntityKey, EntityStore, Normalized};
use crate::transport::{HttpTransport, Transport};

/// Identity of a subscription: endpoint plus resolved parameters
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    pub endpoint: String,
    pub params: Params,
}

impl SubscriptionKey {
    pub fn new(descriptor: &EndpointDescriptor, params: Params) -> Self {
        Self {
            endpoint: descriptor.id(),
            params,
        }
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.params.is_empty() {
            write!(f, "{}", self.endpoint)
        } else {
            write!(f, "{} [{}]", self.endpoint, self.params)
        }
    }
}

/// Lifecycle state of a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
    /// No value yet, a request is in flight
    Fetching,
    /// A value is present
    Active,
    /// No value, the last attempt failed
    Error,
}

/// What subscribers of a key observe
///
/// Snapshots are built under the store lock, so a consumer never sees a
/// partially merged entity.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub status: SubscriptionStatus,
    /// Denormalized current value
    pub value: Option<Value>,
    /// Most recent failure, kept alongside a value when a poll fails
    pub error: Option<CacheError>,
    /// Incremented on every failure
    pub error_seq: u64,
    pub store_version: u64,
}

impl Snapshot {
    fn fetching(store_version: u64) -> Self {
        Self {
            status: SubscriptionStatus::Fetching,
            value: None,
            error: None,
            error_seq: 0,
            store_version,
        }
    }
}

struct Entry {
    descriptor: Arc<EndpointDescriptor>,
    request: ResolvedRequest,
    subscribers: usize,
    status: SubscriptionStatus,
    tree: Option<Normalized>,
    /// Records the last published value was built from
    dependencies: HashSet<EntityKey>,
    error: Option<CacheError>,
    error_seq: u64,
    /// Bumped when the count reaches zero; results from older tasks are discarded
    generation: u64,
    fetch: Option<JoinHandle<()>>,
    poller: Option<PollTimer>,
    grace: Option<JoinHandle<()>>,
    events: watch::Sender<Snapshot>,
}

impl Entry {
    fn new(descriptor: Arc<EndpointDescriptor>, request: ResolvedRequest, store_version: u64) -> Self {
        let (events, _) = watch::channel(Snapshot::fetching(store_version));
        Self {
            descriptor,
            request,
            subscribers: 0,
            status: SubscriptionStatus::Fetching,
            tree: None,
            dependencies: HashSet::new(),
            error: None,
            error_seq: 0,
            generation: 0,
            fetch: None,
            poller: None,
            grace: None,
            events,
        }
    }

    /// Rebuilds the snapshot from the store and notifies subscribers if it changed
    fn publish(&mut self, store: &EntityStore) {
        let mut dependencies = HashSet::new();
        let value = match &self.tree {
            Some(tree) => match store.denormalize(tree, &mut dependencies) {
                Ok(value) => {
                    if self.status == SubscriptionStatus::Error {
                        // A missing record came back.
                        self.status = SubscriptionStatus::Active;
                        if matches!(self.error, Some(CacheError::EntityNotFound(_))) {
                            self.error = None;
                        }
                    }
                    Some(value)
                }
                Err(e) => {
                    error!(
                        event = "cache.denormalize_failed",
                        endpoint = self.descriptor.name,
                        error = %e
                    );
                    if let CacheError::EntityNotFound(missing) = &e {
                        // Merging the record again must republish this entry.
                        dependencies.insert(missing.clone());
                    }
                    self.status = SubscriptionStatus::Error;
                    self.error = Some(e);
                    self.error_seq += 1;
                    None
                }
            },
            None => None,
        };
        self.dependencies = dependencies;

        let snapshot = Snapshot {
            status: self.status,
            value,
            error: self.error.clone(),
            error_seq: self.error_seq,
            store_version: store.version(),
        };
        self.events.send_if_modified(|current| {
            // The store version alone does not warrant waking anyone.
            let modified = current.status != snapshot.status
                || current.value != snapshot.value
                || current.error_seq != snapshot.error_seq
                || current.error.is_some() != snapshot.error.is_some();
            *current = snapshot;
            modified
        });
    }

    fn cancel_tasks(&mut self) {
        self.poller = None;
        if let Some(fetch) = self.fetch.take() {
            fetch.abort();
        }
        if let Some(grace) = self.grace.take() {
            grace.abort();
        }
    }
}

#[derive(Default)]
struct State {
    store: EntityStore,
    subscriptions: HashMap<SubscriptionKey, Entry>,
}

pub(crate) struct CacheInner {
    config: CacheConfig,
    executor: Arc<RequestExecutor>,
    state: Mutex<State>,
    closed: AtomicBool,
}

/// Reactive, normalizing cache of remote resources
///
/// Subscribing, reading and mutating spawn tokio tasks, so they must be
/// called from within a tokio runtime.
#[derive(Clone)]
pub struct Cache {
    inner: Arc<CacheInner>,
}

impl Cache {
    /// Creates a cache that talks HTTP through `reqwest`
    pub fn new(config: CacheConfig) -> Result<Self, CacheError> {
        let transport = HttpTransport::new(config.request_timeout)?;
        Ok(Self::with_transport(config, Arc::new(transport)))
    }

    /// Creates a cache over a custom transport
    pub fn with_transport(config: CacheConfig, transport: Arc<dyn Transport>) -> Self {
        let executor = Arc::new(RequestExecutor::new(transport, config.retry.clone()));
        Self {
            inner: Arc::new(CacheInner {
                config,
                executor,
                state: Mutex::new(State::default()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Registers interest in `descriptor` with `params`
    ///
    /// Fetches on first interest and keeps the value fresh while any handle
    /// for the same key is alive.
    ///
    /// # Arguments
    /// * `descriptor` - A read endpoint
    /// * `params` - Values for the path template; the rest become the query string
    ///
    /// # Returns
    /// * `Ok(SubscriptionHandle)` holding one unit of interest until dropped
    /// * `Err(CacheError::MissingParameter)` if a path parameter has no value
    /// * `Err(CacheError::NotReadable)` if the endpoint is a mutation
    /// * `Err(CacheError::Closed)` after [`shutdown`](Self::shutdown)
    pub fn subscribe(&self, descriptor: &Arc<EndpointDescriptor>, params: Params) -> Result<SubscriptionHandle, CacheError> {
        self.inner.ensure_open()?;
        if descriptor.side_effect {
            return Err(CacheError::NotReadable(descriptor.name));
        }
        let request = descriptor.resolve(&params, None)?;
        let key = SubscriptionKey::new(descriptor, params);

        let mut state = lock(&self.inner.state);
        let State { store, subscriptions } = &mut *state;
        let entry = subscriptions.entry(key.clone()).or_insert_with(|| {
            info!(event = "cache.subscription_created", key = %key);
            Entry::new(descriptor.clone(), request, store.version())
        });

        entry.subscribers += 1;
        if let Some(grace) = entry.grace.take() {
            grace.abort();
            debug!(event = "cache.subscription_revived", key = %key);
        }
        let events = entry.events.subscribe();

        if entry.tree.is_some() {
            entry.status = SubscriptionStatus::Active;
            self.inner.ensure_polling(&key, entry);
        } else if entry.fetch.is_none() {
            self.inner.start_fetch(&key, entry);
            self.inner.ensure_polling(&key, entry);
        }
        entry.publish(store);
        debug!(event = "cache.subscribed", key = %key, subscribers = entry.subscribers);

        Ok(SubscriptionHandle::new(Arc::downgrade(&self.inner), key, events))
    }

    /// Subscribes and invokes `on_update` with the current state and then on every change
    pub fn subscribe_with<F>(
        &self,
        descriptor: &Arc<EndpointDescriptor>,
        params: Params,
        on_update: F,
    ) -> Result<CallbackSubscription, CacheError>
    where
        F: FnMut(ReadState) + Send + 'static,
    {
        let handle = self.subscribe(descriptor, params)?;
        Ok(CallbackSubscription::spawn(handle, on_update))
    }

    /// Waits for the first value or error, then returns it
    ///
    /// The subscription lingers for the grace period afterwards, so an
    /// immediate [`try_read`](Self::try_read) answers without a round trip.
    pub async fn suspend_read(&self, descriptor: &Arc<EndpointDescriptor>, params: Params) -> Result<Value, CacheError> {
        let mut handle = self.subscribe(descriptor, params)?;
        handle.suspend().await
    }

    /// Non-blocking read that re-delivers on every relevant update
    pub fn live_read(&self, descriptor: &Arc<EndpointDescriptor>, params: Params) -> Result<LiveRead, CacheError> {
        self.subscribe(descriptor, params).map(LiveRead::new)
    }

    /// Current state of a key without registering interest
    pub fn try_read(&self, descriptor: &EndpointDescriptor, params: Params) -> Result<ReadState, CacheError> {
        descriptor.resolve(&params, None)?;
        let key = SubscriptionKey::new(descriptor, params);
        let state = lock(&self.inner.state);
        Ok(state
            .subscriptions
            .get(&key)
            .map(|entry| ReadState::from(&*entry.events.borrow()))
            .unwrap_or(ReadState::Pending))
    }

    /// Issues a mutation and merges its result into the store
    ///
    /// Never deduplicated. Subscriptions depending on any entity the
    /// response changes are updated without a separate fetch.
    ///
    /// # Arguments
    /// * `descriptor` - The endpoint to call
    /// * `params` - Values for the path template
    /// * `body` - Optional JSON request body
    ///
    /// # Returns
    /// * `Ok(Value)` - The denormalized response
    /// * `Err(CacheError)` if the call fails after retries or the response
    ///   does not match the endpoint's schema; the store is left untouched
    pub async fn mutate(
        &self,
        descriptor: &EndpointDescriptor,
        params: Params,
        body: Option<Value>,
    ) -> Result<Value, CacheError> {
        self.inner.ensure_open()?;
        let request = descriptor.resolve(&params, body)?;
        info!(event = "cache.mutation_started", endpoint = descriptor.name, url = %request.url);

        let raw = self
            .inner
            .executor
            .execute_uncoalesced(&request)
            .await
            .inspect_err(|e| warn!(event = "cache.mutation_failed", endpoint = descriptor.name, error = %e))?;

        self.inner.ensure_open()?;
        let mut state = lock(&self.inner.state);
        let State { store, subscriptions } = &mut *state;
        let outcome = store.normalize(&raw, descriptor.schema).map_err(|e| {
            let e = CacheError::schema(descriptor.name, e);
            error!(event = "cache.schema_mismatch", endpoint = descriptor.name, error = %e);
            e
        })?;
        fan_out(store, subscriptions, &outcome.changed, None);
        info!(
            event = "cache.mutation_completed",
            endpoint = descriptor.name,
            changed = outcome.changed.len()
        );

        store.denormalize(&outcome.tree, &mut HashSet::new())
    }

    /// Denormalized view of a stored entity
    pub fn entity(&self, entity: &EntityType, pk: &str) -> Option<Value> {
        lock(&self.inner.state).store.get(entity, pk).ok()
    }

    pub fn store_version(&self) -> u64 {
        lock(&self.inner.state).store.version()
    }

    /// Number of keys with at least one subscriber
    pub fn active_subscriptions(&self) -> usize {
        lock(&self.inner.state)
            .subscriptions
            .values()
            .filter(|entry| entry.subscribers > 0)
            .count()
    }

    /// Number of subscription records, including those in their grace period
    pub fn tracked_subscriptions(&self) -> usize {
        lock(&self.inner.state).subscriptions.len()
    }

    /// Number of running poll timers
    pub fn active_pollers(&self) -> usize {
        lock(&self.inner.state)
            .subscriptions
            .values()
            .filter(|entry| entry.poller.is_some())
            .count()
    }

    /// Number of in-flight reads with at least one waiter
    pub fn pending_requests(&self) -> usize {
        self.inner.executor.pending_requests()
    }

    /// Evicts entities no subscription references and no response carried recently
    pub fn collect_garbage(&self) -> usize {
        let mut state = lock(&self.inner.state);
        self.inner.sweep(&mut state)
    }

    /// Cancels every timer and fetch, drops all subscriptions and pending
    /// requests and empties the store
    ///
    /// Handles still held report `Closed`; every later call fails with it.
    pub fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut state = lock(&self.inner.state);
        for entry in state.subscriptions.values_mut() {
            entry.cancel_tasks();
        }
        let dropped = state.subscriptions.len();
        state.subscriptions.clear();
        state.store.clear();
        self.inner.executor.clear();
        info!(event = "cache.shutdown", subscriptions = dropped);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

impl CacheInner {
    fn ensure_open(&self) -> Result<(), CacheError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(CacheError::Closed)
        } else {
            Ok(())
        }
    }

    fn start_fetch(self: &Arc<Self>, key: &SubscriptionKey, entry: &mut Entry) {
        if entry.tree.is_none() {
            entry.status = SubscriptionStatus::Fetching;
        }
        let weak = Arc::downgrade(self);
        let executor = self.executor.clone();
        let request = entry.request.clone();
        let generation = entry.generation;
        let key = key.clone();
        debug!(event = "cache.fetch_started", key = %key);

        entry.fetch = Some(tokio::spawn(async move {
            let result = executor.execute(&request).await;
            if let Some(inner) = weak.upgrade() {
                inner.complete(&key, generation, result, true);
            }
        }));
    }

    fn ensure_polling(self: &Arc<Self>, key: &SubscriptionKey, entry: &mut Entry) {
        if entry.poller.is_some() || entry.subscribers == 0 {
            return;
        }
        let Some(interval) = entry.descriptor.effective_poll_interval() else {
            return;
        };
        let weak = Arc::downgrade(self);
        let poll_key = key.clone();
        let generation = entry.generation;
        entry.poller = Some(PollTimer::start(interval, move || {
            poll(weak.clone(), poll_key.clone(), generation)
        }));
        info!(
            event = "cache.polling_started",
            key = %key,
            interval_ms = interval.as_millis() as u64
        );
    }

    /// Applies a fetch or poll result to its subscription and fans out
    fn complete(self: &Arc<Self>, key: &SubscriptionKey, generation: u64, result: Result<Value, CacheError>, initial: bool) {
        let mut state = lock(&self.state);
        let State { store, subscriptions } = &mut *state;
        let Some(entry) = subscriptions.get_mut(key) else {
            return;
        };
        if entry.generation != generation {
            debug!(event = "cache.result_discarded", key = %key);
            return;
        }
        if initial {
            entry.fetch = None;
        }

        let normalized = result.and_then(|raw| {
            store
                .normalize(&raw, entry.descriptor.schema)
                .map_err(|e| CacheError::schema(entry.descriptor.name, e))
        });

        match normalized {
            Ok(outcome) => {
                entry.tree = Some(outcome.tree);
                entry.status = SubscriptionStatus::Active;
                entry.error = None;
                debug!(
                    event = "cache.fetch_completed",
                    key = %key,
                    changed = outcome.changed.len(),
                    version = outcome.version
                );
                fan_out(store, subscriptions, &outcome.changed, Some(key));
            }
            Err(e) => {
                if matches!(e, CacheError::SchemaMismatch { .. }) {
                    error!(event = "cache.schema_mismatch", key = %key, error = %e);
                } else {
                    warn!(event = "cache.fetch_failed", key = %key, error = %e);
                }
                entry.error = Some(e);
                entry.error_seq += 1;
                if entry.tree.is_none() {
                    entry.status = SubscriptionStatus::Error;
                }
                entry.publish(store);
            }
        }
    }

    /// Retries a subscription that has no request in flight
    pub(crate) fn refetch(self: &Arc<Self>, key: &SubscriptionKey) {
        if self.ensure_open().is_err() {
            return;
        }
        let mut state = lock(&self.state);
        let State { store, subscriptions } = &mut *state;
        let Some(entry) = subscriptions.get_mut(key) else {
            return;
        };
        if entry.subscribers == 0 || entry.fetch.is_some() {
            return;
        }
        self.start_fetch(key, entry);
        entry.publish(store);
    }

    /// Drops one subscriber; the last one stops polling and starts the grace period
    pub(crate) fn release(self: &Arc<Self>, key: &SubscriptionKey) {
        let mut state = lock(&self.state);
        let Some(entry) = state.subscriptions.get_mut(key) else {
            return;
        };
        entry.subscribers = entry.subscribers.saturating_sub(1);
        debug!(event = "cache.unsubscribed", key = %key, subscribers = entry.subscribers);
        if entry.subscribers > 0 {
            return;
        }

        entry.generation += 1;
        entry.cancel_tasks();
        info!(event = "cache.subscription_released", key = %key);

        let grace = self.config.grace_period;
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) if !grace.is_zero() => {
                let weak = Arc::downgrade(self);
                let key = key.clone();
                entry.grace = Some(runtime.spawn(async move {
                    tokio::time::sleep(grace).await;
                    if let Some(inner) = weak.upgrade() {
                        inner.expire(&key);
                    }
                }));
            }
            _ => self.expire_locked(&mut state, key),
        }
    }

    fn expire(&self, key: &SubscriptionKey) {
        let mut state = lock(&self.state);
        self.expire_locked(&mut state, key);
    }

    fn expire_locked(&self, state: &mut State, key: &SubscriptionKey) {
        let idle = matches!(state.subscriptions.get(key), Some(entry) if entry.subscribers == 0);
        if !idle {
            return;
        }
        if let Some(mut entry) = state.subscriptions.remove(key) {
            entry.cancel_tasks();
        }
        info!(event = "cache.subscription_expired", key = %key);
        self.sweep(state);
    }

    fn sweep(&self, state: &mut State) -> usize {
        let referenced: HashSet<EntityKey> = state
            .subscriptions
            .values()
            .flat_map(|entry| entry.dependencies.iter().cloned())
            .collect();
        let evicted = state.store.evict_unreferenced(&referenced, self.config.retention);
        if evicted > 0 {
            info!(event = "cache.entities_evicted", evicted, remaining = state.store.len());
        }
        evicted
    }
}

/// Publishes to the origin key and to every subscription whose value was
/// built from a changed record
fn fan_out(
    store: &EntityStore,
    subscriptions: &mut HashMap<SubscriptionKey, Entry>,
    changed: &HashSet<EntityKey>,
    origin: Option<&SubscriptionKey>,
) {
    for (key, entry) in subscriptions.iter_mut() {
        let affected = origin == Some(key) || entry.dependencies.iter().any(|dep| changed.contains(dep));
        if affected {
            entry.publish(store);
        }
    }
}

async fn poll(weak: Weak<CacheInner>, key: SubscriptionKey, generation: u64) {
    let (executor, request) = {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let state = lock(&inner.state);
        let Some(entry) = state.subscriptions.get(&key) else {
            return;
        };
        (inner.executor.clone(), entry.request.clone())
    };

    debug!(event = "cache.poll", key = %key);
    let result = executor.execute(&request).await;
    if let Some(inner) = weak.upgrade() {
        inner.complete(&key, generation, result, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Field, ScalarKind, Schema};
    use crate::transport::testing::ScriptedTransport;
    use serde_json::json;
    use std::time::Duration;

    const TEST_GRACE: Duration = Duration::from_millis(1000);

    static JOB: EntityType = EntityType {
        name: "ResticJob",
        primary_key: "job_id",
        fields: &[
            Field::new("job_id", Schema::Scalar(ScalarKind::String)),
            Field::new(
                "job",
                Schema::Object(&[
                    Field::new("cron", Schema::Scalar(ScalarKind::String)),
                    Field::new("repository", Schema::Scalar(ScalarKind::String)),
                ]),
            ),
        ],
    };
    static JOB_SCHEMA: Schema = Schema::Entity(&JOB);
    static IDS: Schema = Schema::List(&Schema::Scalar(ScalarKind::String));

    const PREFIX: &str = "http://127.0.0.1:42038";

    fn job_ids() -> Arc<EndpointDescriptor> {
        EndpointDescriptor::get("getJobIds", PREFIX, "/api/v1/jobs", &IDS)
            .poll_every(Duration::from_millis(5000))
            .into_shared()
    }

    fn job() -> Arc<EndpointDescriptor> {
        EndpointDescriptor::get("getJob", PREFIX, "/api/v1/jobs/:jobId", &JOB_SCHEMA)
            .poll_every(Duration::from_millis(5000))
            .into_shared()
    }

    fn queue() -> Arc<EndpointDescriptor> {
        EndpointDescriptor::post("queueJob", PREFIX, "/api/v1/jobs/:jobId/queue", &JOB_SCHEMA).into_shared()
    }

    fn params(job_id: &str) -> Params {
        Params::new().with("jobId", job_id)
    }

    fn nightly() -> Value {
        json!({"job_id": "nightly", "job": {"cron": "0 2 * * *", "repository": "r1"}})
    }

    fn not_found(path: &str) -> CacheError {
        CacheError::Client {
            url: path.to_string(),
            status: 404,
            message: "job not found".to_string(),
        }
    }

    fn cache(transport: &ScriptedTransport) -> Cache {
        let config = CacheConfig {
            grace_period: TEST_GRACE,
            ..CacheConfig::default()
        };
        Cache::with_transport(config, Arc::new(transport.clone()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_simultaneous_subscribers_share_one_fetch() {
        let transport = ScriptedTransport::new().with_delay(Duration::from_millis(50));
        transport.respond("/api/v1/jobs", Ok(json!(["nightly", "weekly"])));
        let cache = cache(&transport);
        let endpoint = job_ids();

        let mut handles: Vec<_> = (0..4)
            .map(|_| cache.subscribe(&endpoint, Params::new()).expect("subscribe"))
            .collect();
        for handle in handles.iter_mut() {
            assert_eq!(handle.suspend().await.expect("value"), json!(["nightly", "weekly"]));
        }

        assert_eq!(transport.calls_to("/api/v1/jobs"), 1);
        assert_eq!(cache.active_subscriptions(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_lifecycle() {
        let transport = ScriptedTransport::new();
        transport.respond("/api/v1/jobs", Ok(json!(["nightly"])));
        let cache = cache(&transport);
        let start = tokio::time::Instant::now();

        let mut handle = cache.subscribe(&job_ids(), Params::new()).expect("subscribe");
        handle.suspend().await.expect("value");
        tokio::time::sleep_until(start + Duration::from_millis(12_000)).await;
        handle.unsubscribe();
        assert_eq!(cache.active_pollers(), 0);

        tokio::time::sleep_until(start + Duration::from_millis(20_000)).await;

        let offsets: Vec<u128> = transport.calls().iter().map(|call| (call.at - start).as_millis()).collect();
        assert_eq!(offsets, vec![0, 5_000, 10_000]);
        assert_eq!(cache.tracked_subscriptions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubscribe_during_grace_reuses_value() {
        let transport = ScriptedTransport::new();
        transport.respond("/api/v1/jobs/nightly", Ok(nightly()));
        let cache = cache(&transport);

        let mut first = cache.subscribe(&job(), params("nightly")).expect("subscribe");
        first.suspend().await.expect("value");
        drop(first);
        tokio::time::sleep(TEST_GRACE / 2).await;

        let second = cache.subscribe(&job(), params("nightly")).expect("subscribe");

        assert_eq!(second.read(), ReadState::Ready(nightly()));
        assert_eq!(transport.calls_to("/api/v1/jobs/nightly"), 1);
        assert_eq!(cache.active_pollers(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscription_expires_after_grace() {
        let transport = ScriptedTransport::new();
        transport.respond("/api/v1/jobs/nightly", Ok(nightly()));
        let cache = cache(&transport);

        let mut handle = cache.subscribe(&job(), params("nightly")).expect("subscribe");
        handle.suspend().await.expect("value");
        drop(handle);

        assert_eq!(cache.active_subscriptions(), 0);
        assert_eq!(cache.tracked_subscriptions(), 1);
        tokio::time::sleep(TEST_GRACE + Duration::from_millis(1)).await;
        assert_eq!(cache.tracked_subscriptions(), 0);
        assert_eq!(cache.pending_requests(), 0);

        // The record outlives the subscription until retention runs out.
        assert_eq!(cache.entity(&JOB, "nightly"), Some(nightly()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_during_fetch_discards_result() {
        let transport = ScriptedTransport::new().with_delay(Duration::from_secs(1));
        transport.respond("/api/v1/jobs/nightly", Ok(nightly()));
        let cache = cache(&transport);

        let mut handle = cache.subscribe(&job(), params("nightly")).expect("subscribe");
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(cache.pending_requests(), 1);
        handle.unsubscribe();
        handle.unsubscribe();

        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(cache.pending_requests(), 0);
        assert_eq!(cache.entity(&JOB, "nightly"), None);
        assert_eq!(cache.store_version(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mutation_updates_dependent_subscription() {
        let transport = ScriptedTransport::new();
        transport.respond(
            "/api/v1/jobs/nightly",
            Ok(json!({"job_id": "nightly", "job": {"cron": "0 1 * * *", "repository": "r1"}})),
        );
        transport.respond("/api/v1/jobs/nightly/queue", Ok(nightly()));
        let cache = cache(&transport);

        let mut live = cache.live_read(&job(), params("nightly")).expect("live");
        live.next().await.expect("first value");

        let result = cache.mutate(&queue(), params("nightly"), None).await.expect("mutate");

        assert_eq!(result, nightly());
        assert_eq!(live.next().await, Some(ReadState::Ready(nightly())));
        assert_eq!(transport.calls_to("/api/v1/jobs/nightly"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_isolation_between_keys() {
        let transport = ScriptedTransport::new();
        transport.respond("/api/v1/jobs/nightly", Ok(nightly()));
        transport.respond("/api/v1/jobs/ghost", Err(not_found("/api/v1/jobs/ghost")));
        let cache = cache(&transport);

        let mut nightly_handle = cache.subscribe(&job(), params("nightly")).expect("subscribe");
        let mut ghost_handle = cache.subscribe(&job(), params("ghost")).expect("subscribe");

        assert_eq!(nightly_handle.suspend().await.expect("value"), nightly());
        let err = ghost_handle.suspend().await.unwrap_err();
        assert_eq!(err.status(), Some(404));

        tokio::time::sleep(Duration::from_millis(5_100)).await;

        assert_eq!(nightly_handle.read(), ReadState::Ready(nightly()));
        assert_eq!(transport.calls_to("/api/v1/jobs/nightly"), 2);
        assert_eq!(transport.calls_to("/api/v1/jobs/ghost"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_failure_keeps_value_and_reports_error() {
        let transport = ScriptedTransport::new();
        transport.respond_once("/api/v1/jobs", Ok(json!(["nightly"])));
        transport.respond("/api/v1/jobs", Err(not_found("/api/v1/jobs")));
        let cache = cache(&transport);

        let mut live = cache.live_read(&job_ids(), Params::new()).expect("live");
        live.next().await.expect("first value");

        tokio::time::sleep(Duration::from_millis(5_100)).await;

        let snapshot = live.snapshot();
        assert_eq!(snapshot.status, SubscriptionStatus::Active);
        assert_eq!(snapshot.value, Some(json!(["nightly"])));
        assert_eq!(snapshot.error.and_then(|e| e.status()), Some(404));

        // Polling carries on after a failure.
        tokio::time::sleep(Duration::from_millis(5_000)).await;
        assert_eq!(transport.calls_to("/api/v1/jobs"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_releasing_one_of_two_subscribers_keeps_fetch_running() {
        let transport = ScriptedTransport::new().with_delay(Duration::from_secs(1));
        transport.respond("/api/v1/jobs/nightly", Ok(nightly()));
        let cache = cache(&transport);

        let leaving = cache.subscribe(&job(), params("nightly")).expect("subscribe");
        let mut staying = cache.subscribe(&job(), params("nightly")).expect("subscribe");
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(leaving);

        assert_eq!(cache.pending_requests(), 1);
        assert_eq!(cache.active_subscriptions(), 1);
        assert_eq!(staying.suspend().await.expect("value"), nightly());
        assert_eq!(transport.calls_to("/api/v1/jobs/nightly"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_joins_request_still_in_flight() {
        // Each call outlives the 5s poll interval.
        let transport = ScriptedTransport::new().with_delay(Duration::from_secs(6));
        transport.respond("/api/v1/jobs", Ok(json!(["nightly"])));
        let cache = cache(&transport);
        let start = tokio::time::Instant::now();

        let mut handle = cache.subscribe(&job_ids(), Params::new()).expect("subscribe");
        handle.suspend().await.expect("value");
        tokio::time::sleep_until(start + Duration::from_millis(20_500)).await;

        // Ticks at 5s and 15s land on a call already running and join it.
        let offsets: Vec<u128> = transport.calls().iter().map(|call| (call.at - start).as_millis()).collect();
        assert_eq!(offsets, vec![0, 10_000, 20_000]);
        assert_eq!(cache.pending_requests(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_failure_is_delivered_to_live_readers() {
        let transport = ScriptedTransport::new();
        transport.respond_once("/api/v1/jobs", Ok(json!(["nightly"])));
        transport.respond_once("/api/v1/jobs", Err(not_found("/api/v1/jobs")));
        transport.respond("/api/v1/jobs", Ok(json!(["nightly"])));
        let cache = cache(&transport);

        let mut live = cache.live_read(&job_ids(), Params::new()).expect("live");
        assert_eq!(live.next().await, Some(ReadState::Ready(json!(["nightly"]))));

        let failed = live.next().await.expect("poll failure");
        assert_eq!(
            failed,
            ReadState::Stale {
                value: json!(["nightly"]),
                error: not_found("/api/v1/jobs"),
            }
        );

        // The next successful poll clears the error even though the value is unchanged.
        assert_eq!(live.next().await, Some(ReadState::Ready(json!(["nightly"]))));
        assert_eq!(transport.calls_to("/api/v1/jobs"), 3);
    }

    #[tokio::test]
    async fn test_missing_record_is_reported_as_failure() {
        let request = job().resolve(&params("nightly"), None).expect("resolve");
        let mut store = EntityStore::default();
        let mut entry = Entry::new(job(), request, store.version());
        let mut events = entry.events.subscribe();
        entry.status = SubscriptionStatus::Active;
        entry.tree = Some(Normalized::Ref(EntityKey::new(&JOB, "nightly")));

        entry.publish(&store);

        assert_eq!(entry.status, SubscriptionStatus::Error);
        let missing = CacheError::EntityNotFound(EntityKey::new(&JOB, "nightly"));
        assert_eq!(ReadState::from(&*events.borrow_and_update()), ReadState::Failed(missing));
        assert!(entry.dependencies.contains(&EntityKey::new(&JOB, "nightly")));

        store.normalize(&nightly(), &JOB_SCHEMA).expect("normalize");
        entry.publish(&store);

        assert_eq!(entry.status, SubscriptionStatus::Active);
        assert_eq!(ReadState::from(&*events.borrow_and_update()), ReadState::Ready(nightly()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_schema_mismatch_surfaces_without_retry() {
        let transport = ScriptedTransport::new();
        transport.respond("/api/v1/jobs", Ok(json!({"jobs": []})));
        let cache = cache(&transport);

        let err = cache.suspend_read(&job_ids(), Params::new()).await.unwrap_err();

        assert!(matches!(err, CacheError::SchemaMismatch { .. }));
        assert_eq!(transport.calls_to("/api/v1/jobs"), 1);
    }

    #[tokio::test]
    async fn test_missing_parameter_fails_synchronously() {
        let transport = ScriptedTransport::new();
        let cache = cache(&transport);

        let err = cache.subscribe(&job(), Params::new()).unwrap_err();

        assert!(matches!(err, CacheError::MissingParameter { .. }));
        assert!(transport.calls().is_empty());
        assert_eq!(cache.tracked_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_mutations_cannot_be_subscribed() {
        let cache = cache(&ScriptedTransport::new());

        let err = cache.subscribe(&queue(), params("nightly")).unwrap_err();

        assert_eq!(err, CacheError::NotReadable("queueJob"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_releases_everything() {
        let transport = ScriptedTransport::new();
        transport.respond("/api/v1/jobs", Ok(json!(["nightly"])));
        let cache = cache(&transport);

        let mut handle = cache.subscribe(&job_ids(), Params::new()).expect("subscribe");
        handle.suspend().await.expect("value");
        cache.shutdown();

        assert!(cache.is_closed());
        assert_eq!(cache.active_pollers(), 0);
        assert_eq!(cache.tracked_subscriptions(), 0);
        assert_eq!(handle.changed().await, None);
        assert_eq!(cache.subscribe(&job_ids(), Params::new()).unwrap_err(), CacheError::Closed);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(transport.calls_to("/api/v1/jobs"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_garbage_collection_respects_references() {
        let transport = ScriptedTransport::new();
        transport.respond("/api/v1/jobs/nightly", Ok(nightly()));
        transport.respond(
            "/api/v1/jobs/weekly",
            Ok(json!({"job_id": "weekly", "job": {"cron": "0 4 * * 0", "repository": "r2"}})),
        );
        let cache = cache(&transport);

        let mut kept = cache.subscribe(&job(), params("nightly")).expect("subscribe");
        kept.suspend().await.expect("value");
        cache.suspend_read(&job(), params("weekly")).await.expect("value");

        tokio::time::sleep(cache.config().retention + TEST_GRACE).await;
        cache.collect_garbage();

        assert!(cache.entity(&JOB, "nightly").is_some());
        assert!(cache.entity(&JOB, "weekly").is_none());
    }
}
