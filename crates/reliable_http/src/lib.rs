//! Client-side HTTP request scheduling.
//!
//! This crate accepts logical requests (method, URL, headers, body, cache duration, timeout and
//! retry budget) and runs them against a transport under three simultaneous constraints:
//!
//! 1. **Max outstanding**: at most `max_outstanding` requests are dispatched but not yet complete.
//! 2. **Throttle window**: at most `N` dispatches inside any trailing window of duration `T`.
//! 3. **Cache/coalescing**: cacheable requests with the same identity share one network operation
//!    and are served from cache until their cache duration elapses.
//!
//! # Architecture
//! - A single background task (the scheduler loop) owns admission and cache expiration.
//! - Every dispatched operation is supervised by a timeout watchdog.
//! - Failures are retried at the tail of the queue until the per-request budget is exhausted;
//!   callbacks only ever observe the final outcome.
//!
//! # Basic Usage
//! ```no_run
//! use reliable_http::{RequestSpec, Scheduler, SchedulerSettings};
//! use reliable_http::reqwest_integration::ReqwestTransport;
//! use std::time::Duration;
//!
//! # async fn run() -> Result<(), reliable_http::RequestError> {
//! let scheduler = Scheduler::new(SchedulerSettings::default(), ReqwestTransport::new())?;
//! let spec = RequestSpec::builder()
//!     .url("https://example.com/items".parse().unwrap())
//!     .cache_duration(Duration::from_secs(5))
//!     .build();
//! let body = scheduler.request(spec).await?;
//! # drop(body);
//! scheduler.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Metrics
//! Emits counters, gauges and histograms through the `metrics` facade, see [`internal_event`].
#[macro_use]
extern crate tracing;

pub mod error;
pub mod http;
pub mod internal_event;
pub mod recorder;
pub mod reqwest_integration;
pub mod request;
pub mod retries;
pub mod scheduler;
#[cfg(test)]
pub(crate) mod test_utils;

pub use error::RequestError;
pub use crate::http::{HttpError, Transport};
pub use recorder::{Recorder, RequestSnapshot};
pub use request::{IdentityKey, Outcome, RequestDescriptor, RequestId, RequestMethod, RequestSpec};
pub use scheduler::{Scheduler, SchedulerSettings, SchedulerStats};

pub type Error = Box<dyn std::error::Error + Send + Sync + 'static>;
