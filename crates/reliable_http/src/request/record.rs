use std::borrow::Cow;
use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::time::Instant;

use super::{Callback, IdentityKey, Outcome, RequestDescriptor, RequestId, RequestSpec};
use crate::error::RequestError;
use crate::http::HttpError;
use crate::recorder::RequestSnapshot;
use crate::retries::{RetryAction, RetryLogic};

/// Lifecycle of a [`RequestRecord`].
///
/// `New` and `Preparing` only exist while the record is being built; seeing them anywhere else
/// is a scheduler defect.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
pub enum RequestState {
    New,
    Preparing,
    /// Queued, waiting on admission.
    Ready,
    /// Dispatched to the transport.
    Pending,
    /// Completion is running and callbacks are being delivered.
    Processing,
    Complete,
}

/// Result of handing a transport result to a record.
#[derive(Debug)]
pub enum Completion {
    /// The attempt failed and budget remains; the record must go back to the queue.
    Retry {
        attempt: u32,
        reason: Cow<'static, str>,
    },
    /// A terminal outcome was reached and all callbacks have been invoked.
    Delivered,
}

/// Result of trying to attach a callback to an existing record.
pub(crate) enum Attach {
    Attached,
    /// The record is complete and fresh; the caller hands the stored outcome to the callback
    /// once it holds no locks.
    Deliver(Callback, Outcome),
    /// The record is delivering or stale; the callback is handed back so a fresh record can
    /// take it.
    Rejected(Callback),
}

struct RecordInner {
    state: RequestState,
    attempted_retries: u32,
    index: u64,
    issued: Option<Instant>,
    completed: Option<Instant>,
    cache_expiration: Option<Instant>,
    outcome: Option<Outcome>,
    callbacks: VecDeque<Callback>,
}

/// One logical request and everything that happens to it.
///
/// The same `Arc<RequestRecord>` sits in the pending queue and in the cache.
pub struct RequestRecord {
    id: RequestId,
    key: IdentityKey,
    spec: RequestSpec,
    descriptor: RequestDescriptor,
    inner: Mutex<RecordInner>,
    // Held across the state change and callback drain of a completion.
    completion: Mutex<()>,
}

impl RequestRecord {
    pub(crate) fn create(spec: RequestSpec) -> Arc<Self> {
        let record = RequestRecord {
            id: RequestId::next(),
            key: spec.identity(),
            descriptor: spec.descriptor(),
            spec,
            inner: Mutex::new(RecordInner {
                state: RequestState::New,
                attempted_retries: 0,
                index: 0,
                issued: None,
                completed: None,
                cache_expiration: None,
                outcome: None,
                callbacks: VecDeque::new(),
            }),
            completion: Mutex::new(()),
        };
        record.inner.lock().state = RequestState::Preparing;
        Arc::new(record)
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn key(&self) -> &IdentityKey {
        &self.key
    }

    pub fn spec(&self) -> &RequestSpec {
        &self.spec
    }

    pub fn descriptor(&self) -> &RequestDescriptor {
        &self.descriptor
    }

    pub fn state(&self) -> RequestState {
        self.inner.lock().state
    }

    pub fn attempted_retries(&self) -> u32 {
        self.inner.lock().attempted_retries
    }

    pub fn index(&self) -> u64 {
        self.inner.lock().index
    }

    pub fn outcome(&self) -> Option<Outcome> {
        self.inner.lock().outcome.clone()
    }

    pub fn is_terminal(&self) -> bool {
        self.state() == RequestState::Complete
    }

    /// Complete and past its cache expiration.
    pub fn is_expired(&self, now: Instant) -> bool {
        let inner = self.inner.lock();
        inner.state == RequestState::Complete
            && inner.cache_expiration.is_some_and(|expiration| expiration <= now)
    }

    pub(crate) fn push_callback(&self, callback: Callback) {
        self.inner.lock().callbacks.push_back(callback);
    }

    /// Attaches a callback for coalescing.
    ///
    /// Queued or in-flight records accept it. A fresh complete record returns its stored
    /// outcome for immediate delivery. Records mid-delivery or already expired reject it.
    pub(crate) fn attach(&self, callback: Callback, now: Instant) -> Result<Attach, RequestError> {
        let mut inner = self.inner.lock();
        let state = inner.state;
        match state {
            RequestState::Ready | RequestState::Pending => {
                inner.callbacks.push_back(callback);
                Ok(Attach::Attached)
            }
            RequestState::Complete => {
                let fresh = inner
                    .cache_expiration
                    .is_some_and(|expiration| expiration > now);
                match inner.outcome.clone() {
                    Some(outcome) if fresh => Ok(Attach::Deliver(callback, outcome)),
                    _ => Ok(Attach::Rejected(callback)),
                }
            }
            RequestState::Processing => Ok(Attach::Rejected(callback)),
            state @ (RequestState::New | RequestState::Preparing) => Err(RequestError::Defect {
                message: format!(
                    "request {} for {} is observable in state {:?}",
                    self.id, self.key, state
                ),
            }),
        }
    }

    pub(crate) fn mark_ready(&self) -> Result<(), RequestError> {
        self.transition(&[RequestState::Preparing], RequestState::Ready)
    }

    pub(crate) fn mark_pending(&self, index: u64, issued: Instant) -> Result<(), RequestError> {
        self.transition(&[RequestState::Ready], RequestState::Pending)?;
        let mut inner = self.inner.lock();
        inner.index = index;
        inner.issued = Some(issued);
        Ok(())
    }

    fn transition(&self, from: &[RequestState], to: RequestState) -> Result<(), RequestError> {
        let mut inner = self.inner.lock();
        if !from.contains(&inner.state) {
            return Err(RequestError::Defect {
                message: format!(
                    "request {} cannot move from {:?} to {:?}",
                    self.id, inner.state, to
                ),
            });
        }
        inner.state = to;
        Ok(())
    }

    /// Drives the record with the result of one dispatch attempt.
    ///
    /// Either asks for a retry (budget left, the record is `Ready` again and the caller must
    /// re-queue it) or stores the terminal outcome, drains every callback in FIFO order and
    /// moves to `Complete`.
    pub(crate) fn complete<L: RetryLogic>(
        &self,
        result: Result<String, HttpError>,
        logic: &L,
    ) -> Result<Completion, RequestError> {
        let _completion = self.completion.lock();
        let now = Instant::now();

        let (callbacks, outcome) = {
            let mut inner = self.inner.lock();
            if inner.state != RequestState::Pending {
                return Err(RequestError::Defect {
                    message: format!(
                        "request {} completed while in state {:?}",
                        self.id, inner.state
                    ),
                });
            }
            inner.state = RequestState::Processing;

            let can_retry = inner.attempted_retries < self.spec.retries;
            let outcome = match result {
                Ok(body) => match logic.should_retry_response(&body) {
                    RetryAction::Retry(reason) if can_retry => {
                        inner.attempted_retries += 1;
                        inner.state = RequestState::Ready;
                        return Ok(Completion::Retry {
                            attempt: inner.attempted_retries,
                            reason,
                        });
                    }
                    _ => Ok(body),
                },
                Err(error) => match logic.classify_error(&error) {
                    RetryAction::Retry(reason) if can_retry => {
                        inner.attempted_retries += 1;
                        inner.state = RequestState::Ready;
                        return Ok(Completion::Retry {
                            attempt: inner.attempted_retries,
                            reason,
                        });
                    }
                    _ => Err(Arc::new(error)),
                },
            };

            if let Err(error) = &outcome {
                error!(
                    message = "Request failed.",
                    id = %self.id,
                    url = %self.spec.url,
                    attempts = inner.attempted_retries.saturating_add(1),
                    %error,
                );
            } else {
                debug!(
                    message = "Request completed.",
                    id = %self.id,
                    url = %self.spec.url,
                    latency_ms = inner.issued.map(|issued| now.duration_since(issued).as_millis()),
                );
            }

            // Failures are not worth serving from cache.
            let expiration = match outcome {
                Ok(_) => now + self.spec.cache_duration,
                Err(_) => now,
            };
            inner.completed = Some(now);
            inner.cache_expiration = Some(expiration);
            inner.outcome = Some(outcome.clone());
            (std::mem::take(&mut inner.callbacks), outcome)
        };

        for callback in callbacks {
            deliver(self.id, callback, outcome.clone());
        }

        self.inner.lock().state = RequestState::Complete;
        Ok(Completion::Delivered)
    }

    /// Detaches every waiting callback without invoking it.
    ///
    /// Dropping the returned callbacks drops whatever they captured, so a caller waiting on a
    /// channel observes it closing.
    pub(crate) fn abandon(&self) -> VecDeque<Callback> {
        std::mem::take(&mut self.inner.lock().callbacks)
    }

    /// Ends the record without a transport result: every waiting callback receives `error`.
    ///
    /// The record is left `Complete` and already expired, so the cache never serves it.
    pub(crate) fn abort(&self, error: HttpError) {
        let _completion = self.completion.lock();
        let now = Instant::now();
        let outcome: Outcome = Err(Arc::new(error));
        let callbacks = {
            let mut inner = self.inner.lock();
            inner.state = RequestState::Complete;
            inner.completed = Some(now);
            inner.cache_expiration = Some(now);
            inner.outcome = Some(outcome.clone());
            std::mem::take(&mut inner.callbacks)
        };
        for callback in callbacks {
            deliver(self.id, callback, outcome.clone());
        }
    }

    pub fn snapshot(&self) -> RequestSnapshot {
        let inner = self.inner.lock();
        RequestSnapshot {
            id: self.id,
            key: self.key.clone(),
            state: inner.state,
            method: self.spec.method.to_string(),
            url: self.spec.url.to_string(),
            target: self.spec.target.clone(),
            uri_template: self.spec.uri_template.clone(),
            parameters: self.spec.parameters.clone(),
            cache_duration: self.spec.cache_duration,
            timeout: self.spec.timeout,
            allowed_retries: self.spec.retries,
            attempted_retries: inner.attempted_retries,
            index: inner.index,
            latency: inner
                .issued
                .zip(inner.completed)
                .map(|(issued, completed)| completed.duration_since(issued)),
            response_text: inner
                .outcome
                .as_ref()
                .and_then(|outcome| outcome.as_ref().ok().cloned()),
            error: inner
                .outcome
                .as_ref()
                .and_then(|outcome| outcome.as_ref().err().map(|error| error.to_string())),
        }
    }
}

impl std::fmt::Debug for RequestRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestRecord")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Invokes one callback, isolating the caller's panic from everything else.
pub(crate) fn deliver(id: RequestId, callback: Callback, outcome: Outcome) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(move || callback(outcome))) {
        let reason = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        error!(message = "Error processing callback.", %id, %reason);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::retries::DefaultRetryLogic;
    use crate::test_utils::{spec, trace_init};

    fn pending(spec: RequestSpec) -> Arc<RequestRecord> {
        let record = RequestRecord::create(spec);
        record.mark_ready().unwrap();
        record.mark_pending(1, Instant::now()).unwrap();
        record
    }

    #[tokio::test]
    async fn success_stores_response_and_drains_callbacks_in_order() {
        trace_init();
        let record = pending(spec("https://example.com/a"));
        let seen = Arc::new(Mutex::new(Vec::new()));
        for n in 0..3 {
            let seen = Arc::clone(&seen);
            record.push_callback(Box::new(move |outcome: Outcome| {
                seen.lock().push((n, outcome.unwrap()));
            }));
        }

        let completion = record
            .complete(Ok("body".to_string()), &DefaultRetryLogic)
            .unwrap();

        assert!(matches!(completion, Completion::Delivered));
        assert_eq!(record.state(), RequestState::Complete);
        assert_eq!(
            *seen.lock(),
            vec![(0, "body".into()), (1, "body".into()), (2, "body".into())]
        );
        let snapshot = record.snapshot();
        assert_eq!(snapshot.response_text.as_deref(), Some("body"));
        assert!(snapshot.error.is_none());
    }

    #[tokio::test]
    async fn failure_with_budget_asks_for_retry_without_delivering() {
        let record = pending(spec("https://example.com/a"));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        record.push_callback(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let completion = record
            .complete(Err(HttpError::Timeout), &DefaultRetryLogic)
            .unwrap();

        assert!(matches!(completion, Completion::Retry { attempt: 1, .. }));
        assert_eq!(record.state(), RequestState::Ready);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(record.outcome().is_none());
    }

    #[tokio::test]
    async fn exhausted_budget_delivers_the_last_error() {
        let mut spec = spec("https://example.com/a");
        spec.retries = 0;
        let record = pending(spec);
        let got = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&got);
        record.push_callback(Box::new(move |outcome| *slot.lock() = Some(outcome)));

        record
            .complete(
                Err(HttpError::ServerError {
                    status: 500,
                    body: "boom".into(),
                }),
                &DefaultRetryLogic,
            )
            .unwrap();

        let outcome = got.lock().take().unwrap();
        assert_eq!(outcome.unwrap_err().status(), Some(500));
        assert_eq!(record.attempted_retries(), 0);
        assert!(record.is_terminal());
    }

    #[tokio::test]
    async fn panicking_callback_does_not_block_later_callbacks() {
        let record = pending(spec("https://example.com/a"));
        let calls = Arc::new(AtomicUsize::new(0));
        record.push_callback(Box::new(|_| panic!("consumer bug")));
        let counter = Arc::clone(&calls);
        record.push_callback(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        record
            .complete(Ok("ok".into()), &DefaultRetryLogic)
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(record.is_terminal());
    }

    #[tokio::test]
    async fn attach_rules_follow_the_lifecycle() {
        let mut cached = spec("https://example.com/a");
        cached.cache_duration = Duration::from_secs(60);
        let record = RequestRecord::create(cached);

        // still being built
        assert!(matches!(
            record.attach(Box::new(|_| {}), Instant::now()),
            Err(RequestError::Defect { .. })
        ));

        record.mark_ready().unwrap();
        assert!(matches!(
            record.attach(Box::new(|_| {}), Instant::now()),
            Ok(Attach::Attached)
        ));

        record.mark_pending(1, Instant::now()).unwrap();
        record.complete(Ok("hit".into()), &DefaultRetryLogic).unwrap();

        let got = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&got);
        match record
            .attach(Box::new(move |outcome| *slot.lock() = Some(outcome)), Instant::now())
            .unwrap()
        {
            Attach::Deliver(callback, outcome) => deliver(record.id(), callback, outcome),
            _ => panic!("fresh complete record must hand back its outcome"),
        }
        assert_eq!(got.lock().take().unwrap().unwrap(), "hit");

        let later = Instant::now() + Duration::from_secs(61);
        assert!(record.is_expired(later));
        assert!(matches!(
            record.attach(Box::new(|_| {}), later),
            Ok(Attach::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn completing_a_record_that_was_never_dispatched_is_a_defect() {
        let record = RequestRecord::create(spec("https://example.com/a"));
        record.mark_ready().unwrap();
        assert!(matches!(
            record.complete(Ok(String::new()), &DefaultRetryLogic),
            Err(RequestError::Defect { .. })
        ));
    }

    #[tokio::test]
    async fn final_failure_with_a_saturated_retry_count_is_delivered() {
        let mut spec = spec("https://example.com/a");
        spec.retries = u32::MAX;
        let record = pending(spec);
        record.inner.lock().attempted_retries = u32::MAX;
        let got = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&got);
        record.push_callback(Box::new(move |outcome| *slot.lock() = Some(outcome)));

        let completion = record
            .complete(Err(HttpError::Timeout), &DefaultRetryLogic)
            .unwrap();

        assert!(matches!(completion, Completion::Delivered));
        assert!(got.lock().take().unwrap().is_err());
        assert_eq!(record.attempted_retries(), u32::MAX);
    }

    #[tokio::test]
    async fn abandoned_callbacks_close_their_channels() {
        let record = RequestRecord::create(spec("https://example.com/a"));
        record.mark_ready().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel::<Outcome>();
        record.push_callback(Box::new(move |outcome| {
            let _ = tx.send(outcome);
        }));

        assert_eq!(record.abandon().len(), 1);
        assert!(record.abandon().is_empty());
        assert!(rx.await.is_err());
        assert_eq!(record.state(), RequestState::Ready);
    }

    #[tokio::test]
    async fn aborted_record_delivers_the_error_and_is_never_fresh() {
        let mut cached = spec("https://example.com/a");
        cached.cache_duration = Duration::from_secs(60);
        let record = RequestRecord::create(cached);
        record.mark_ready().unwrap();
        let got = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&got);
        record.push_callback(Box::new(move |outcome| *slot.lock() = Some(outcome)));

        record.abort(HttpError::Aborted {
            reason: "lost".into(),
        });

        let error = got.lock().take().unwrap().unwrap_err();
        assert_eq!(error.to_string(), "HTTP request aborted: lost");
        assert!(record.is_terminal());
        assert!(record.is_expired(Instant::now()));
    }
}
