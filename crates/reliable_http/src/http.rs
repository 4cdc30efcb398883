use std::time::Duration;

use crate::Error as CrateError;
use crate::request::RequestDescriptor;
use snafu::Snafu;
use tower::Service;
use tower::timeout::error::Elapsed;

/// Anything that can execute a [`RequestDescriptor`] and yield the response body.
///
/// Implemented for every cloneable `tower::Service` of the right shape, so closures wrapped in
/// `tower::service_fn`, mocks and [`ReqwestTransport`](crate::reqwest_integration::ReqwestTransport)
/// all qualify. Dropping the response future aborts the operation.
pub trait Transport:
    Service<RequestDescriptor, Response = String, Error: Into<CrateError>, Future: Send + 'static>
    + Clone
    + Send
    + Sync
    + 'static
{
}

impl<T> Transport for T
where
    T: Service<RequestDescriptor, Response = String> + Clone + Send + Sync + 'static,
    T::Error: Into<CrateError>,
    T::Future: Send + 'static,
{
}

/// Failure of a single transport operation.
///
/// Transports return this (or any boxed error, which is classified with
/// [`HttpError::from_boxed`]). The scheduler decides from it whether the request is retried or
/// its callbacks receive the failure.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum HttpError {
    /// An error occurred during the transport of the request (e.g., network issue, DNS).
    #[snafu(display("HTTP transport error: {}", source))]
    Transport { source: CrateError },

    /// The watchdog aborted the operation because it exceeded its timeout.
    #[snafu(display("HTTP request cancelled after exceeding timeout of {:?}", timeout))]
    Cancelled { timeout: Duration },

    /// The transport itself reported a timeout.
    #[snafu(display("HTTP request timed out"))]
    Timeout,

    /// The server responded with a non-success status code.
    #[snafu(display("HTTP server error response (status {}): {}", status, body))]
    ServerError { status: u16, body: String },

    /// The request could not be built or is malformed. Retrying cannot fix this.
    #[snafu(display("Invalid HTTP request: {}", details))]
    InvalidRequest { details: String },

    /// The scheduler gave up on the request without a transport result.
    #[snafu(display("HTTP request aborted: {}", reason))]
    Aborted { reason: String },

    /// Other, unspecified HTTP client errors.
    #[snafu(display("Generic HTTP client error: {}", source))]
    ClientError { source: CrateError },
}

impl HttpError {
    /// Classifies an error coming out of the transport stack.
    ///
    /// `Elapsed` from the timeout layer becomes [`HttpError::Cancelled`], an `HttpError` is
    /// unwrapped as is, and anything else is treated as a transport failure.
    pub fn from_boxed(error: CrateError, timeout: Duration) -> Self {
        if error.is::<Elapsed>() {
            return HttpError::Cancelled { timeout };
        }
        match error.downcast::<HttpError>() {
            Ok(http_error) => *http_error,
            Err(source) => HttpError::Transport { source },
        }
    }

    pub const fn is_cancellation(&self) -> bool {
        matches!(self, HttpError::Cancelled { .. })
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            HttpError::ServerError { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elapsed_is_classified_as_cancellation() {
        let error = HttpError::from_boxed(Box::new(Elapsed::new()), Duration::from_secs(3));
        assert!(error.is_cancellation());
        assert_eq!(
            error.to_string(),
            "HTTP request cancelled after exceeding timeout of 3s"
        );
    }

    #[test]
    fn http_errors_pass_through_unchanged() {
        let boxed: CrateError = Box::new(HttpError::ServerError {
            status: 503,
            body: "busy".into(),
        });
        let error = HttpError::from_boxed(boxed, Duration::from_secs(1));
        assert_eq!(error.status(), Some(503));
    }

    #[test]
    fn unknown_errors_become_transport_errors() {
        let boxed: CrateError = "connection reset".into();
        let error = HttpError::from_boxed(boxed, Duration::from_secs(1));
        assert!(matches!(error, HttpError::Transport { .. }));
        assert!(!error.is_cancellation());
    }
}
