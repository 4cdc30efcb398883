//! Logical requests, their identity and the per-request record.

pub mod record;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bon::Builder;
use bytes::Bytes;
use http::{HeaderMap, Method};
use serde::Serialize;
use url::Url;

use crate::error::RequestError;
use crate::http::HttpError;

pub use record::{Completion, RequestRecord, RequestState};

/// Final result delivered to every callback of a record.
pub type Outcome = Result<String, Arc<HttpError>>;

/// Completion listener attached to a record. State the caller wants back is captured by the
/// closure.
pub type Callback = Box<dyn FnOnce(Outcome) + Send + 'static>;

/// Re-exported so callers do not need a direct `http` dependency.
pub type RequestMethod = Method;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_RETRIES: u32 = 2;

/// Payload encodings understood by the client layer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum ContentType {
    #[default]
    Json,
    Form,
    Xml,
    Text,
}

impl ContentType {
    pub const fn mime(self) -> &'static str {
        match self {
            ContentType::Json => "application/json",
            ContentType::Form => "application/x-www-form-urlencoded",
            ContentType::Xml => "text/xml",
            ContentType::Text => "text/plain",
        }
    }
}

/// A logical request as submitted by a caller.
///
/// # Example
///
/// ```rust
/// use reliable_http::RequestSpec;
/// use std::time::Duration;
///
/// let spec = RequestSpec::builder()
///     .url("https://example.com/quotes/EURUSD".parse().unwrap())
///     .cache_duration(Duration::from_secs(10))
///     .retries(3)
///     .build();
/// assert!(spec.is_cacheable());
/// ```
#[derive(Clone, Debug, Builder)]
pub struct RequestSpec {
    #[builder(default = Method::GET)]
    pub method: Method,
    pub url: Url,
    #[builder(default)]
    pub headers: HeaderMap,
    #[builder(into)]
    pub body: Option<Bytes>,
    #[builder(default)]
    pub request_content_type: ContentType,
    #[builder(default)]
    pub response_content_type: ContentType,
    /// Base address the url was composed from, kept for diagnostics.
    #[builder(into)]
    pub target: Option<String>,
    #[builder(into)]
    pub uri_template: Option<String>,
    #[builder(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
    #[builder(into)]
    pub user_agent: Option<String>,
    /// How long a successful response stays in the cache. Zero disables caching.
    #[builder(default)]
    pub cache_duration: Duration,
    /// Watchdog timeout applied to every dispatch attempt.
    #[builder(default = DEFAULT_TIMEOUT)]
    pub timeout: Duration,
    /// Number of retries allowed after the first attempt.
    #[builder(default = DEFAULT_RETRIES)]
    pub retries: u32,
}

impl RequestSpec {
    /// Bodies are never cached, and neither are PUT/POST requests.
    pub fn is_cacheable(&self) -> bool {
        !self.cache_duration.is_zero() && self.method != Method::PUT && self.method != Method::POST
    }

    pub fn identity(&self) -> IdentityKey {
        IdentityKey::new(&self.method, &self.url)
    }

    pub fn validate(&self) -> Result<(), RequestError> {
        let has_body = self.body.as_ref().is_some_and(|body| !body.is_empty());
        if has_body && !self.cache_duration.is_zero() {
            return Err(RequestError::InvalidConfiguration {
                message: format!(
                    "a request with a body cannot be cached ({} {})",
                    self.method, self.url
                ),
            });
        }
        if self.timeout.is_zero() {
            return Err(RequestError::InvalidConfiguration {
                message: format!("timeout must be greater than zero ({})", self.url),
            });
        }
        Ok(())
    }

    pub(crate) fn descriptor(&self) -> RequestDescriptor {
        RequestDescriptor {
            method: self.method.clone(),
            url: self.url.clone(),
            headers: self.headers.clone(),
            body: self.body.clone(),
            request_content_type: self.request_content_type,
            response_content_type: self.response_content_type,
            user_agent: self.user_agent.clone(),
        }
    }
}

/// What the transport is asked to execute for one dispatch attempt.
#[derive(Clone, Debug, PartialEq)]
pub struct RequestDescriptor {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub request_content_type: ContentType,
    pub response_content_type: ContentType,
    pub user_agent: Option<String>,
}

/// Normalized, case-insensitive method + URL used to key the cache.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct IdentityKey(String);

impl IdentityKey {
    pub fn new(method: &Method, url: &Url) -> Self {
        Self::from_parts(method.as_str(), url.as_str())
    }

    /// Builds a key from raw strings; `"GET"`, `"https://a/b/"` and `"get"`, `"HTTPS://A/B"`
    /// produce the same key.
    pub fn from_parts(method: &str, url: &str) -> Self {
        let url = url.trim().trim_end_matches('/');
        IdentityKey(format!("{} {}", method.trim(), url).to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque handle returned by `submit` for correlating a request with its record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct RequestId(u64);

impl RequestId {
    pub(crate) fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        RequestId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        s.parse().unwrap()
    }

    #[test]
    fn identity_is_case_and_trailing_slash_insensitive() {
        let a = IdentityKey::new(&Method::GET, &url("https://Example.com/Quotes/"));
        let b = IdentityKey::from_parts("get", "HTTPS://EXAMPLE.COM/quotes");
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "get https://example.com/quotes");
    }

    #[test]
    fn identity_differs_by_method() {
        let target = url("https://example.com/a");
        assert_ne!(
            IdentityKey::new(&Method::GET, &target),
            IdentityKey::new(&Method::DELETE, &target)
        );
    }

    #[test]
    fn put_and_post_are_never_cacheable() {
        for method in [Method::PUT, Method::POST] {
            let spec = RequestSpec::builder()
                .method(method)
                .url(url("https://example.com/a"))
                .cache_duration(Duration::from_secs(5))
                .build();
            assert!(!spec.is_cacheable());
        }

        let zero = RequestSpec::builder().url(url("https://example.com/a")).build();
        assert!(!zero.is_cacheable());
    }

    #[test]
    fn body_with_cache_duration_is_rejected() {
        let spec = RequestSpec::builder()
            .method(Method::PUT)
            .url(url("https://example.com/a"))
            .body(Bytes::from_static(b"{\"a\":1}"))
            .cache_duration(Duration::from_secs(5))
            .build();
        assert!(matches!(
            spec.validate(),
            Err(RequestError::InvalidConfiguration { .. })
        ));
    }

    #[test]
    fn builder_defaults() {
        let spec = RequestSpec::builder().url(url("https://example.com/a")).build();
        assert_eq!(spec.method, Method::GET);
        assert_eq!(spec.timeout, DEFAULT_TIMEOUT);
        assert_eq!(spec.retries, DEFAULT_RETRIES);
        assert!(spec.cache_duration.is_zero());
        assert!(spec.validate().is_ok());
    }
}
