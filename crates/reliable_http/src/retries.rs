use std::{borrow::Cow, cmp, time::Duration};

use crate::http::HttpError;

/// Decision taken for a finished transport attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryAction {
    /// Indicate that this request should be retried with a reason
    Retry(Cow<'static, str>),
    /// Indicate that this request should not be retried with a reason
    DontRetry(Cow<'static, str>),
    /// Indicate that this request should not be retried but the request was successful
    Successful,
}

impl RetryAction {
    pub const fn is_retryable(&self) -> bool {
        matches!(self, RetryAction::Retry(_))
    }

    pub const fn is_not_retryable(&self) -> bool {
        matches!(self, RetryAction::DontRetry(_))
    }

    pub const fn is_successful(&self) -> bool {
        matches!(self, RetryAction::Successful)
    }
}

/// Defines the contract for determining which attempts should be retried.
///
/// The retry budget itself is owned by the request; the logic only says whether an
/// attempt is worth repeating.
///
/// # Example
/// ```rust
/// use reliable_http::http::HttpError;
/// use reliable_http::retries::{RetryAction, RetryLogic};
///
/// #[derive(Clone)]
/// struct OnlyServerErrors;
///
/// impl RetryLogic for OnlyServerErrors {
///     fn is_retriable_error(&self, error: &HttpError) -> bool {
///         error.status().is_some_and(|status| status >= 500)
///     }
///
///     fn should_retry_response(&self, body: &str) -> RetryAction {
///         if body.contains("retry-me") {
///             RetryAction::Retry("server asked for a retry".into())
///         } else {
///             RetryAction::Successful
///         }
///     }
/// }
/// ```
pub trait RetryLogic: Clone + Send + Sync + 'static {
    /// Determines if a failed attempt should be retried.
    fn is_retriable_error(&self, error: &HttpError) -> bool;

    /// Determines if a successful response should nevertheless be retried.
    ///
    /// Defaults to [`RetryAction::Successful`]. When the budget is exhausted a response marked
    /// for retry is delivered as it is.
    fn should_retry_response(&self, _body: &str) -> RetryAction {
        RetryAction::Successful
    }

    /// Maps a failed attempt onto a [`RetryAction`].
    fn classify_error(&self, error: &HttpError) -> RetryAction {
        if self.is_retriable_error(error) {
            RetryAction::Retry(Cow::Owned(error.to_string()))
        } else {
            RetryAction::DontRetry(Cow::Owned(error.to_string()))
        }
    }
}

/// Retries every transport failure, including watchdog cancellations, except requests
/// that cannot succeed because they are malformed or were aborted by the scheduler.
#[derive(Clone, Debug, Default)]
pub struct DefaultRetryLogic;

impl RetryLogic for DefaultRetryLogic {
    fn is_retriable_error(&self, error: &HttpError) -> bool {
        !matches!(
            error,
            HttpError::InvalidRequest { .. } | HttpError::Aborted { .. }
        )
    }
}

/// The jitter mode to use for retry backoff behavior.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum JitterMode {
    /// No jitter.
    #[default]
    None,

    /// Full jitter.
    ///
    /// The random delay is anywhere from 0 up to the maximum current delay calculated by the backoff
    /// strategy.
    Full,
}

/// Delay applied before a failed request re-enters the pending queue.
///
/// The default is no delay: the request goes straight back to the tail of the queue.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RetryBackoff {
    initial: Duration,
    max: Duration,
    jitter: JitterMode,
}

impl RetryBackoff {
    pub const fn none() -> Self {
        Self {
            initial: Duration::ZERO,
            max: Duration::ZERO,
            jitter: JitterMode::None,
        }
    }

    /// Doubling backoff starting at `initial`, never longer than `max`.
    pub const fn exponential(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            jitter: JitterMode::None,
        }
    }

    pub const fn jitter(mut self, jitter: JitterMode) -> Self {
        self.jitter = jitter;
        self
    }

    pub const fn is_none(&self) -> bool {
        self.initial.is_zero()
    }

    fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        let delay = self.initial.checked_mul(factor).unwrap_or(self.max);
        cmp::min(delay, self.max)
    }

    /// Delay before the `attempt`-th retry (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        if self.is_none() {
            return Duration::ZERO;
        }
        let base = self.base_delay(attempt);
        match self.jitter {
            JitterMode::None => base,
            JitterMode::Full => {
                if base.is_zero() {
                    return Duration::ZERO;
                }
                let random_millis = (rand::random::<f64>() * base.as_millis() as f64) as u64;
                Duration::from_millis(random_millis)
            }
        }
    }
}
