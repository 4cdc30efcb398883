use std::sync::mpsc::{self, RecvTimeoutError};

use tokio::sync::oneshot;

use super::Scheduler;
use crate::error::RequestError;
use crate::http::Transport;
use crate::request::RequestSpec;
use crate::retries::RetryLogic;

impl<S, L> Scheduler<S, L>
where
    S: Transport,
    L: RetryLogic,
{
    /// Submits `spec` and blocks the calling thread until it completes.
    ///
    /// Waits at most `master_wait`, however long the request's own timeout is. Running out of
    /// that wait means the scheduler stopped making progress and yields
    /// [`RequestError::StalledRequest`]. Must not be called from inside an async task.
    pub fn request_blocking(&self, spec: RequestSpec) -> Result<String, RequestError> {
        let (tx, rx) = mpsc::sync_channel(1);
        let url = spec.url.clone();
        self.submit(spec, move |outcome| {
            let _ = tx.send(outcome);
        })?;

        let waited = self.settings().master_wait;
        match rx.recv_timeout(waited) {
            Ok(outcome) => Ok(outcome?),
            Err(RecvTimeoutError::Timeout) => {
                error!(message = "Request stalled.", %url, waited_ms = waited.as_millis());
                Err(RequestError::StalledRequest { waited })
            }
            Err(RecvTimeoutError::Disconnected) => Err(RequestError::ShuttingDown),
        }
    }

    /// Async counterpart of [`Scheduler::request_blocking`], with the same master wait.
    pub async fn request(&self, spec: RequestSpec) -> Result<String, RequestError> {
        let (tx, rx) = oneshot::channel();
        let url = spec.url.clone();
        self.submit(spec, move |outcome| {
            let _ = tx.send(outcome);
        })?;

        let waited = self.settings().master_wait;
        match tokio::time::timeout(waited, rx).await {
            Ok(Ok(outcome)) => Ok(outcome?),
            Ok(Err(_)) => Err(RequestError::ShuttingDown),
            Err(_) => {
                error!(message = "Request stalled.", %url, waited_ms = waited.as_millis());
                Err(RequestError::StalledRequest { waited })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use futures::future;
    use tower::service_fn;

    use super::*;
    use crate::SchedulerSettings;
    use crate::http::HttpError;
    use crate::request::RequestDescriptor;
    use crate::test_utils::{Scripted, spec, trace_init};

    fn hanging() -> impl Transport {
        service_fn(|_request: RequestDescriptor| future::pending::<Result<String, HttpError>>())
    }

    fn impatient() -> SchedulerSettings {
        SchedulerSettings::builder()
            .tick(Duration::from_millis(10))
            .master_wait(Duration::from_millis(200))
            .build()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn blocking_request_returns_the_body() {
        trace_init();
        let transport = Scripted::new(vec![Ok("pong".into())]);
        let scheduler = Arc::new(Scheduler::new(impatient(), transport.service()).unwrap());

        let worker = Arc::clone(&scheduler);
        let body = tokio::task::spawn_blocking(move || {
            worker.request_blocking(spec("https://example.com/ping"))
        })
        .await
        .unwrap()
        .unwrap();

        assert_eq!(body, "pong");
        scheduler.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn blocking_request_reraises_the_terminal_error() {
        let transport = Scripted::new(vec![Err(HttpError::ServerError {
            status: 503,
            body: "busy".into(),
        })]);
        let scheduler = Arc::new(Scheduler::new(impatient(), transport.service()).unwrap());
        let mut spec = spec("https://example.com/busy");
        spec.retries = 0;

        let worker = Arc::clone(&scheduler);
        let error = tokio::task::spawn_blocking(move || worker.request_blocking(spec))
            .await
            .unwrap()
            .unwrap_err();

        assert_eq!(error.http_error().and_then(HttpError::status), Some(503));
        scheduler.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn master_wait_below_timeout_reports_a_stalled_request() {
        let scheduler = Arc::new(Scheduler::new(impatient(), hanging()).unwrap());
        let mut spec = spec("https://example.com/never");
        spec.timeout = Duration::from_secs(5);

        let worker = Arc::clone(&scheduler);
        let error = tokio::task::spawn_blocking(move || worker.request_blocking(spec))
            .await
            .unwrap()
            .unwrap_err();

        assert!(error.is_stalled());
        assert_eq!(
            error.to_string(),
            "request stalled: no completion after 200ms"
        );
        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn async_request_reports_a_stalled_request() {
        let scheduler = Scheduler::new(impatient(), hanging()).unwrap();
        let mut spec = spec("https://example.com/never");
        spec.timeout = Duration::from_secs(5);

        let error = scheduler.request(spec).await.unwrap_err();
        assert!(matches!(error, RequestError::StalledRequest { waited } if waited == Duration::from_millis(200)));
        assert_eq!(scheduler.stats().outstanding, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn async_request_returns_the_body() {
        let transport = Scripted::new(vec![Ok("pong".into())]);
        let scheduler = Scheduler::new(impatient(), transport.service()).unwrap();
        let body = scheduler
            .request(spec("https://example.com/ping"))
            .await
            .unwrap();
        assert_eq!(body, "pong");
    }

    #[tokio::test(start_paused = true)]
    async fn requests_after_shutdown_are_refused() {
        let transport = Scripted::new(vec![]);
        let scheduler = Scheduler::new(impatient(), transport.service()).unwrap();
        scheduler.shutdown().await;
        assert!(matches!(
            scheduler.request(spec("https://example.com/ping")).await,
            Err(RequestError::ShuttingDown)
        ));
    }
}
