use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::{self, BoxFuture};
use parking_lot::Mutex;
use tower::service_fn;

use crate::http::HttpError;
use crate::request::{RequestDescriptor, RequestSpec};

pub fn trace_init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "reliable_http=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

/// A GET for `url` with no caching and the default retry budget.
pub fn spec(url: &str) -> RequestSpec {
    RequestSpec::builder().url(url.parse().unwrap()).build()
}

/// Scripted transport: each call pops the next result, answering `"ok"` once the script runs
/// out. Every call is counted and its url logged.
#[derive(Clone, Default)]
pub struct Scripted {
    script: Arc<Mutex<VecDeque<Result<String, HttpError>>>>,
    pub calls: Arc<AtomicUsize>,
    pub urls: Arc<Mutex<Vec<String>>>,
    latency: Duration,
}

impl Scripted {
    pub fn new(script: Vec<Result<String, HttpError>>) -> Self {
        Self {
            script: Arc::new(Mutex::new(script.into())),
            ..Default::default()
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn service(
        &self,
    ) -> impl tower::Service<
        RequestDescriptor,
        Response = String,
        Error = HttpError,
        Future = BoxFuture<'static, Result<String, HttpError>>,
    > + Clone
    + Send
    + Sync
    + 'static {
        let this = self.clone();
        service_fn(move |request: RequestDescriptor| {
            this.calls.fetch_add(1, Ordering::SeqCst);
            this.urls.lock().push(request.url.to_string());
            let next = this
                .script
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok("ok".to_string()));
            let latency = this.latency;
            let fut: BoxFuture<'static, Result<String, HttpError>> = if latency.is_zero() {
                Box::pin(future::ready(next))
            } else {
                Box::pin(async move {
                    tokio::time::sleep(latency).await;
                    next
                })
            };
            fut
        })
    }
}

pub fn transport_error(message: &str) -> HttpError {
    HttpError::Transport {
        source: message.to_string().into(),
    }
}
