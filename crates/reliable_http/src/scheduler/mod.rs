//! The scheduler: pending queue, admission, cache sweep and dispatch.
//!
//! A single background task owns dispatch and expiration. It wakes on a fixed tick or when
//! notified (submission, completion, shutdown), purges expired cache items and then admits
//! records strictly FIFO from the head of the pending queue until the head is blocked.

pub mod admission;
pub mod cache;
mod facade;

use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bon::Builder;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tower::{ServiceBuilder, ServiceExt};
use tracing::{Instrument, Span};

use crate::error::RequestError;
use crate::http::{HttpError, Transport};
use crate::internal_event::{
    CacheItemsPurged, RequestCoalesced, RequestCompleted, RequestDispatched, RequestRetried,
    RequestSubmitted, emit,
};
use crate::recorder::Recorder;
use crate::request::record::{Attach, deliver};
use crate::request::{
    Callback, Completion, IdentityKey, Outcome, RequestId, RequestMethod, RequestRecord,
    RequestSpec,
};
use crate::retries::{DefaultRetryLogic, RetryBackoff, RetryLogic};

pub use admission::{Admission, AdmissionPolicy, ThrottleWindow};
pub use cache::RequestCache;

const DEFAULT_MAX_OUTSTANDING: usize = 10;
const DEFAULT_THROTTLE_CAPACITY: usize = 30;
const DEFAULT_THROTTLE_WINDOW: Duration = Duration::from_secs(10);
const DEFAULT_TICK: Duration = Duration::from_millis(50);
const DEFAULT_MASTER_WAIT: Duration = Duration::from_secs(30);

/// Scheduler configuration.
///
/// | Parameter | Default | Env variable |
/// |-----------|---------|--------------|
/// | `max_outstanding` | 10 | `RELIABLE_HTTP_MAX_OUTSTANDING` |
/// | `throttle_capacity` | 30 | `RELIABLE_HTTP_THROTTLE_CAPACITY` |
/// | `throttle_window` | 10s | `RELIABLE_HTTP_THROTTLE_WINDOW_MS` |
/// | `tick` | 50ms | `RELIABLE_HTTP_TICK_MS` |
/// | `master_wait` | 30s | `RELIABLE_HTTP_MASTER_WAIT_MS` |
/// | `retry_backoff` | none | |
///
/// # Example
///
/// ```rust
/// use reliable_http::SchedulerSettings;
/// use std::time::Duration;
///
/// let settings = SchedulerSettings::builder()
///     .max_outstanding(4)
///     .throttle_capacity(100)
///     .throttle_window(Duration::from_secs(60))
///     .build();
/// assert!(settings.validate().is_ok());
/// ```
#[derive(Clone, Debug, Builder)]
pub struct SchedulerSettings {
    /// Requests dispatched and not yet complete never exceed this.
    #[builder(default = DEFAULT_MAX_OUTSTANDING)]
    pub max_outstanding: usize,

    /// Dispatches allowed inside any trailing `throttle_window`.
    #[builder(default = DEFAULT_THROTTLE_CAPACITY)]
    pub throttle_capacity: usize,

    #[builder(default = DEFAULT_THROTTLE_WINDOW)]
    pub throttle_window: Duration,

    /// Cadence of the background loop when nothing wakes it earlier.
    #[builder(default = DEFAULT_TICK)]
    pub tick: Duration,

    /// Ceiling on how long the facades wait for a request, independent of its timeout.
    #[builder(default = DEFAULT_MASTER_WAIT)]
    pub master_wait: Duration,

    /// Delay before a failed request re-enters the queue.
    #[builder(default)]
    pub retry_backoff: RetryBackoff,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl SchedulerSettings {
    pub fn validate(&self) -> Result<(), RequestError> {
        let invalid = |message: &str| {
            Err(RequestError::InvalidConfiguration {
                message: message.to_string(),
            })
        };
        if self.max_outstanding == 0 {
            return invalid("max_outstanding must be at least 1");
        }
        if self.throttle_capacity == 0 {
            return invalid("throttle_capacity must be at least 1");
        }
        if self.throttle_window.is_zero() {
            return invalid("throttle_window must be greater than zero");
        }
        if self.tick.is_zero() {
            return invalid("tick must be greater than zero");
        }
        if self.master_wait.is_zero() {
            return invalid("master_wait must be greater than zero");
        }
        Ok(())
    }

    /// Defaults overridden by `RELIABLE_HTTP_*` variables, after loading `.env` if present.
    pub fn from_env() -> Result<Self, RequestError> {
        if let Err(error) = dotenvy::dotenv() {
            if !error.not_found() {
                warn!(message = "Failed to load .env file.", %error);
            }
        }
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, RequestError> {
        let mut settings = Self::default();
        if let Some(value) = parse_var(&lookup, "RELIABLE_HTTP_MAX_OUTSTANDING")? {
            settings.max_outstanding = value;
        }
        if let Some(value) = parse_var(&lookup, "RELIABLE_HTTP_THROTTLE_CAPACITY")? {
            settings.throttle_capacity = value;
        }
        if let Some(ms) = parse_var(&lookup, "RELIABLE_HTTP_THROTTLE_WINDOW_MS")? {
            settings.throttle_window = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var(&lookup, "RELIABLE_HTTP_TICK_MS")? {
            settings.tick = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var(&lookup, "RELIABLE_HTTP_MASTER_WAIT_MS")? {
            settings.master_wait = Duration::from_millis(ms);
        }
        settings.validate()?;
        Ok(settings)
    }
}

fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Result<Option<T>, RequestError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|error| RequestError::InvalidConfiguration {
                message: format!("{name}={raw:?}: {error}"),
            }),
    }
}

/// Point-in-time view of the scheduler's bookkeeping.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub queued: usize,
    pub outstanding: usize,
    pub cached: usize,
    /// Dispatch attempts so far, retries included.
    pub dispatched: u64,
}

struct State {
    queue: VecDeque<Arc<RequestRecord>>,
    cache: RequestCache,
    admission: AdmissionPolicy,
    outstanding: usize,
    dispatched: u64,
}

struct Shared {
    settings: SchedulerSettings,
    state: Mutex<State>,
    wake: Notify,
    dispatching: AtomicBool,
    shutdown: AtomicBool,
    recorder: Recorder,
    span: Span,
}

impl Shared {
    fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    fn purge_expired(&self) -> Vec<IdentityKey> {
        let mut state = self.state.lock();
        let purged = state.cache.purge_expired(Instant::now());
        if !purged.is_empty() {
            emit(CacheItemsPurged {
                count: purged.len(),
                remaining: state.cache.len(),
            });
        }
        purged
    }

    /// Empties the queue once the loop has stopped. Queued records leave the cache and their
    /// callbacks are released unanswered, which callers waiting on a channel see as a closed
    /// channel.
    fn abandon_queued(&self) {
        let (records, released) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let records: Vec<_> = state.queue.drain(..).collect();
            let mut released = Vec::new();
            for record in &records {
                state.cache.evict(record);
                released.extend(record.abandon());
            }
            (records, released)
        };
        if !records.is_empty() {
            warn!(
                message = "Abandoned queued requests on shutdown.",
                requests = records.len(),
                callbacks = released.len(),
            );
        }
    }
}

/// What the loop and every in-flight completion need.
struct Core<S, L> {
    shared: Arc<Shared>,
    transport: S,
    logic: L,
}

impl<S: Clone, L: Clone> Clone for Core<S, L> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            transport: self.transport.clone(),
            logic: self.logic.clone(),
        }
    }
}

impl<S, L> Core<S, L>
where
    S: Transport,
    L: RetryLogic,
{
    async fn run(self) {
        let mut ticker = tokio::time::interval(self.shared.settings.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(message = "Scheduler started.", tick_ms = self.shared.settings.tick.as_millis());

        while !self.shared.is_shutting_down() {
            self.shared.purge_expired();
            self.dispatch();
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.shared.wake.notified() => {}
            }
        }
        self.shared.abandon_queued();
        debug!(message = "Scheduler stopped.");
    }

    /// Admits records from the head of the queue until the head is blocked.
    fn dispatch(&self) {
        if self.shared.dispatching.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut launched = Vec::new();
        let mut defects = Vec::new();
        {
            let mut guard = self.shared.state.lock();
            let state = &mut *guard;
            while let Some(head) = state.queue.front() {
                let now = Instant::now();
                match state.admission.admit(state.outstanding, now, &head.spec().url) {
                    Admission::Ready => {}
                    Admission::MaxOutstanding { .. } | Admission::Throttled { .. } => break,
                }

                let Some(record) = state.queue.pop_front() else {
                    break;
                };
                let index = state.dispatched + 1;
                if let Err(error) = record.mark_pending(index, now) {
                    error!(message = "Aborting request in an impossible state.", id = %record.id(), %error);
                    state.cache.evict(&record);
                    defects.push((record, error));
                    continue;
                }
                state.admission.dispatched(now);
                state.dispatched = index;
                state.outstanding += 1;
                emit(RequestDispatched {
                    id: record.id(),
                    index,
                    url: &record.spec().url,
                    queued: state.queue.len(),
                    outstanding: state.outstanding,
                });
                launched.push(record);
            }
        }

        for (record, error) in defects {
            record.abort(HttpError::Aborted {
                reason: error.to_string(),
            });
        }
        for record in launched {
            let span = info_span!(parent: &self.shared.span, "request", id = %record.id());
            tokio::spawn(self.clone().execute(record).instrument(span));
        }
        self.shared.dispatching.store(false, Ordering::Release);
    }

    /// Runs one attempt under its timeout and feeds the result back to the record.
    async fn execute(self, record: Arc<RequestRecord>) {
        let timeout = record.spec().timeout;
        let result = ServiceBuilder::new()
            .timeout(timeout)
            .service(self.transport.clone())
            .oneshot(record.descriptor().clone())
            .await
            .map_err(|error| HttpError::from_boxed(error, timeout));

        let outstanding = {
            let mut state = self.shared.state.lock();
            state.outstanding = state.outstanding.saturating_sub(1);
            state.outstanding
        };

        match record.complete(result, &self.logic) {
            Ok(Completion::Retry { attempt, reason }) => {
                let delay = self.shared.settings.retry_backoff.delay(attempt);
                emit(RequestRetried {
                    id: record.id(),
                    attempt,
                    allowed: record.spec().retries,
                    reason: &reason,
                    delay,
                });
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                let mut state = self.shared.state.lock();
                if self.shared.is_shutting_down() {
                    state.cache.evict(&record);
                    drop(state);
                    let released = record.abandon();
                    debug!(message = "Dropping retry after shutdown.", id = %record.id(), callbacks = released.len());
                } else {
                    state.queue.push_back(record);
                }
            }
            Ok(Completion::Delivered) => {
                let snapshot = record.snapshot();
                emit(RequestCompleted {
                    id: record.id(),
                    latency: snapshot.latency,
                    failed: snapshot.error.is_some(),
                    outstanding,
                });
                self.shared.recorder.record(snapshot);
            }
            Err(error) => {
                error!(message = "Request completion failed.", id = %record.id(), %error);
            }
        }
        self.shared.wake.notify_one();
    }
}

/// Client-side request scheduler.
///
/// Owns a background task on the tokio runtime it was created in. The transport is any
/// [`Transport`], a `tower::Service` that turns a request descriptor into the response body.
pub struct Scheduler<S, L = DefaultRetryLogic> {
    core: Core<S, L>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl<S> Scheduler<S, DefaultRetryLogic>
where
    S: Transport,
{
    /// Starts a scheduler on the current tokio runtime.
    pub fn new(settings: SchedulerSettings, transport: S) -> Result<Self, RequestError> {
        Self::with_retry_logic(
            settings,
            transport,
            DefaultRetryLogic,
            info_span!("scheduler"),
        )
    }
}

impl<S, L> Scheduler<S, L>
where
    S: Transport,
    L: RetryLogic,
{
    /// Starts a scheduler with custom retry classification. The loop and every dispatched
    /// request log inside `span`.
    pub fn with_retry_logic(
        settings: SchedulerSettings,
        transport: S,
        logic: L,
        span: Span,
    ) -> Result<Self, RequestError> {
        settings.validate()?;
        let runtime = Handle::try_current().map_err(|_| RequestError::NoRuntime)?;

        let window = ThrottleWindow::new(settings.throttle_capacity, settings.throttle_window);
        let state = State {
            queue: VecDeque::new(),
            cache: RequestCache::new(),
            admission: AdmissionPolicy::new(settings.max_outstanding, window),
            outstanding: 0,
            dispatched: 0,
        };
        let shared = Arc::new(Shared {
            settings,
            state: Mutex::new(state),
            wake: Notify::new(),
            dispatching: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            recorder: Recorder::new(),
            span: span.clone(),
        });
        let core = Core {
            shared,
            transport,
            logic,
        };
        let handle = runtime.spawn(core.clone().run().instrument(span));
        Ok(Self {
            core,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Submits a request. `callback` receives the final outcome exactly once.
    ///
    /// Cacheable requests whose identity already has a queued, in-flight or fresh record are
    /// attached to it instead of issuing another operation; the returned id is that record's.
    pub fn submit<F>(&self, spec: RequestSpec, callback: F) -> Result<RequestId, RequestError>
    where
        F: FnOnce(Outcome) + Send + 'static,
    {
        spec.validate()?;
        let callback: Callback = Box::new(callback);
        let now = Instant::now();

        let (id, ready) = {
            let mut guard = self.shared().state.lock();
            // Checked under the lock so nothing is queued after the loop drained the queue.
            if self.shared().is_shutting_down() {
                return Err(RequestError::ShuttingDown);
            }
            let state = &mut *guard;
            if !spec.is_cacheable() {
                (enqueue(state, prepare(spec)?, callback, false), None)
            } else {
                let key = spec.identity();
                let (record, created) = state
                    .cache
                    .get_or_create(&key, now, || prepare(spec.clone()))?;
                if created {
                    (enqueue(state, record, callback, true), None)
                } else {
                    match record.attach(callback, now)? {
                        Attach::Attached => {
                            emit(RequestCoalesced { id: record.id(), key: &key });
                            (record.id(), None)
                        }
                        Attach::Deliver(callback, outcome) => {
                            emit(RequestCoalesced { id: record.id(), key: &key });
                            (record.id(), Some((callback, outcome)))
                        }
                        Attach::Rejected(callback) => {
                            let fresh = prepare(spec)?;
                            state.cache.insert(Arc::clone(&fresh));
                            (enqueue(state, fresh, callback, true), None)
                        }
                    }
                }
            }
        };

        if let Some((callback, outcome)) = ready {
            deliver(id, callback, outcome);
        }
        self.shared().wake.notify_one();
        Ok(id)
    }

    pub fn get_cached(
        &self,
        method: &RequestMethod,
        url: &url::Url,
    ) -> Result<Arc<RequestRecord>, RequestError> {
        let key = IdentityKey::new(method, url);
        self.shared().state.lock().cache.get(&key)
    }

    /// Removes a complete record from the cache.
    pub fn remove_cached(
        &self,
        method: &RequestMethod,
        url: &url::Url,
    ) -> Result<Arc<RequestRecord>, RequestError> {
        let key = IdentityKey::new(method, url);
        self.shared().state.lock().cache.remove(&key)
    }

    /// Runs the expiration sweep now and returns the purged keys.
    pub fn purge_expired(&self) -> Vec<IdentityKey> {
        self.shared().purge_expired()
    }

    pub fn stats(&self) -> SchedulerStats {
        let state = self.shared().state.lock();
        SchedulerStats {
            queued: state.queue.len(),
            outstanding: state.outstanding,
            cached: state.cache.len(),
            dispatched: state.dispatched,
        }
    }

    pub fn recorder(&self) -> &Recorder {
        &self.shared().recorder
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.shared().settings
    }

    /// Stops the background loop and waits for it to exit.
    ///
    /// In-flight requests still complete, but a failed attempt is not retried. Queued requests
    /// are not dispatched; their callbacks are dropped without being called.
    pub async fn shutdown(&self) {
        self.shared().shutdown.store(true, Ordering::Release);
        self.shared().wake.notify_one();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(error) = handle.await {
                error!(message = "Scheduler loop exited abnormally.", %error);
            }
        }
    }
}

impl<S, L> Scheduler<S, L> {
    fn shared(&self) -> &Shared {
        &self.core.shared
    }
}

impl<S, L> Drop for Scheduler<S, L> {
    fn drop(&mut self) {
        self.core.shared.shutdown.store(true, Ordering::Release);
        self.core.shared.wake.notify_one();
    }
}

fn prepare(spec: RequestSpec) -> Result<Arc<RequestRecord>, RequestError> {
    let record = RequestRecord::create(spec);
    record.mark_ready()?;
    Ok(record)
}

fn enqueue(
    state: &mut State,
    record: Arc<RequestRecord>,
    callback: Callback,
    cacheable: bool,
) -> RequestId {
    record.push_callback(callback);
    emit(RequestSubmitted {
        id: record.id(),
        key: record.key(),
        cacheable,
    });
    let id = record.id();
    state.queue.push_back(record);
    id
}
