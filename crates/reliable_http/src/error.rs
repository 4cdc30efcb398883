use std::sync::Arc;
use std::time::Duration;

use snafu::Snafu;

use crate::http::HttpError;
use crate::request::IdentityKey;

/// Errors surfaced by the scheduler, its cache and its facades.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum RequestError {
    /// The request reached a terminal failure after its retry budget was spent.
    #[snafu(display("request failed: {}", source))]
    Failed { source: Arc<HttpError> },

    /// An internal invariant was violated. This is a bug in the scheduler, not a caller error.
    #[snafu(display("scheduler defect: {}", message))]
    Defect { message: String },

    #[snafu(display("item for {} was not found in the cache", key))]
    NotFound { key: IdentityKey },

    /// Removing a record that has not completed would orphan its callbacks.
    #[snafu(display("item for {} is not complete and cannot be removed", key))]
    NotTerminal { key: IdentityKey },

    /// The synchronous wait expired without the scheduler completing the request.
    #[snafu(display("request stalled: no completion after {:?}", waited))]
    StalledRequest { waited: Duration },

    #[snafu(display("invalid configuration: {}", message))]
    InvalidConfiguration { message: String },

    #[snafu(display("no tokio runtime available to run the scheduler"))]
    NoRuntime,

    #[snafu(display("scheduler is shutting down"))]
    ShuttingDown,
}

impl RequestError {
    /// The transport failure behind a [`RequestError::Failed`], if any.
    pub fn http_error(&self) -> Option<&HttpError> {
        match self {
            RequestError::Failed { source } => Some(source),
            _ => None,
        }
    }

    pub const fn is_stalled(&self) -> bool {
        matches!(self, RequestError::StalledRequest { .. })
    }
}

impl From<Arc<HttpError>> for RequestError {
    fn from(source: Arc<HttpError>) -> Self {
        RequestError::Failed { source }
    }
}
