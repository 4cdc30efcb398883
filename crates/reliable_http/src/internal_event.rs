//! Internal events emitted by the scheduler.
//!
//! Each event records its metrics through the `metrics` facade and logs a matching `tracing`
//! event under the `reliable_http::stats` target. Install any `metrics` recorder to collect them.
//!
//! | Metric | Kind |
//! |--------|------|
//! | `reliable_http_requests_submitted_total` | counter |
//! | `reliable_http_requests_coalesced_total` | counter |
//! | `reliable_http_requests_dispatched_total` | counter |
//! | `reliable_http_requests_retried_total` | counter |
//! | `reliable_http_requests_completed_total` | counter, labelled `outcome` |
//! | `reliable_http_cache_purged_total` | counter |
//! | `reliable_http_request_latency_seconds` | histogram |
//! | `reliable_http_queue_depth` | gauge |
//! | `reliable_http_outstanding` | gauge |
use std::time::Duration;

use metrics::{counter, gauge, histogram};

use crate::request::{IdentityKey, RequestId};

pub trait InternalEvent: Sized {
    fn emit(self);
}

pub fn emit(event: impl InternalEvent) {
    event.emit()
}

#[derive(Debug)]
pub struct RequestSubmitted<'a> {
    pub id: RequestId,
    pub key: &'a IdentityKey,
    pub cacheable: bool,
}

impl InternalEvent for RequestSubmitted<'_> {
    fn emit(self) {
        debug!(
            target: "reliable_http::stats",
            message = "Request submitted.",
            id = %self.id,
            key = %self.key,
            cacheable = self.cacheable,
        );
        counter!("reliable_http_requests_submitted_total").increment(1);
    }
}

/// A caller was attached to an existing record instead of issuing a new operation.
#[derive(Debug)]
pub struct RequestCoalesced<'a> {
    pub id: RequestId,
    pub key: &'a IdentityKey,
}

impl InternalEvent for RequestCoalesced<'_> {
    fn emit(self) {
        debug!(
            target: "reliable_http::stats",
            message = "Request coalesced.",
            id = %self.id,
            key = %self.key,
        );
        counter!("reliable_http_requests_coalesced_total").increment(1);
    }
}

#[derive(Debug)]
pub struct RequestDispatched<'a> {
    pub id: RequestId,
    pub index: u64,
    pub url: &'a url::Url,
    pub queued: usize,
    pub outstanding: usize,
}

impl InternalEvent for RequestDispatched<'_> {
    fn emit(self) {
        info!(
            target: "reliable_http::stats",
            message = "Dispatching request.",
            id = %self.id,
            index = self.index,
            url = %self.url,
            queued = self.queued,
            outstanding = self.outstanding,
        );
        counter!("reliable_http_requests_dispatched_total").increment(1);
        gauge!("reliable_http_queue_depth").set(self.queued as f64);
        gauge!("reliable_http_outstanding").set(self.outstanding as f64);
    }
}

#[derive(Debug)]
pub struct RequestRetried<'a> {
    pub id: RequestId,
    pub attempt: u32,
    pub allowed: u32,
    pub reason: &'a str,
    pub delay: Duration,
}

impl InternalEvent for RequestRetried<'_> {
    fn emit(self) {
        warn!(
            message = "Retrying request.",
            id = %self.id,
            attempt = self.attempt,
            allowed = self.allowed,
            reason = self.reason,
            delay_ms = self.delay.as_millis(),
        );
        counter!("reliable_http_requests_retried_total").increment(1);
    }
}

#[derive(Debug)]
pub struct RequestCompleted {
    pub id: RequestId,
    pub latency: Option<Duration>,
    pub failed: bool,
    pub outstanding: usize,
}

impl InternalEvent for RequestCompleted {
    fn emit(self) {
        let outcome = if self.failed { "error" } else { "success" };
        trace!(
            target: "reliable_http::stats",
            message = "Request finished.",
            id = %self.id,
            outcome,
            latency_ms = self.latency.map(|latency| latency.as_millis()),
        );
        counter!("reliable_http_requests_completed_total", "outcome" => outcome).increment(1);
        if let Some(latency) = self.latency {
            histogram!("reliable_http_request_latency_seconds").record(latency);
        }
        gauge!("reliable_http_outstanding").set(self.outstanding as f64);
    }
}

#[derive(Debug)]
pub struct CacheItemsPurged {
    pub count: usize,
    pub remaining: usize,
}

impl InternalEvent for CacheItemsPurged {
    fn emit(self) {
        info!(
            message = "Purged expired cache items.",
            count = self.count,
            remaining = self.remaining,
        );
        counter!("reliable_http_cache_purged_total").increment(self.count as u64);
    }
}
