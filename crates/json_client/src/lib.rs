//! JSON API client built on the `reliable_http` scheduler.
//!
//! Requests are described as a target, a URI template and a parameter map. Parameters fill
//! `{name}` placeholders first; whatever is left becomes the body of PUT/POST requests.
//!
//! ```no_run
//! use json_client::{ApiRequest, JsonClient, JsonClientConfig};
//! use serde_json::json;
//! use std::time::Duration;
//!
//! # async fn run() -> Result<(), json_client::ClientError> {
//! let client = JsonClient::new(JsonClientConfig::default())?;
//! let request = ApiRequest::builder()
//!     .target("https://api.example.com")
//!     .uri_template("/quotes/{symbol}")
//!     .parameter("symbol", json!("EURUSD"))
//!     .cache_duration(Duration::from_secs(5))
//!     .build();
//! let quote: serde_json::Value = client.request(request).await?;
//! # drop(quote);
//! # Ok(())
//! # }
//! ```

pub mod template;

use std::collections::BTreeMap;
use std::time::Duration;

use bon::Builder;
use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::Method;
use parking_lot::RwLock;
use reliable_http::request::ContentType;
use reliable_http::reqwest_integration::ReqwestTransport;
use reliable_http::{
    Outcome, RequestError, RequestId, RequestSnapshot, RequestSpec, Scheduler, SchedulerSettings,
    Transport,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use snafu::{ResultExt, Snafu};
use tracing::{debug, info};
use url::Url;

use crate::template::{UriTemplate, render};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ClientError {
    #[snafu(display("client initialization error: {}", message))]
    Initialization { message: String },

    #[snafu(display("{}", source))]
    Request { source: RequestError },

    #[snafu(display("invalid url '{}': {}", url, source))]
    InvalidUrl { url: String, source: url::ParseError },

    #[snafu(display("invalid header '{}': {}", name, message))]
    InvalidHeader { name: String, message: String },

    #[snafu(display("{:?} request bodies are not supported", content_type))]
    UnsupportedContentType { content_type: ContentType },

    #[snafu(display("JSON serialization error: {}", source))]
    Serialization { source: serde_json::Error },

    #[snafu(display("failed to deserialize response: {}. Body: {:.100}", source, body))]
    Deserialization {
        source: serde_json::Error,
        body: String,
    },
}

impl From<RequestError> for ClientError {
    fn from(source: RequestError) -> Self {
        ClientError::Request { source }
    }
}

impl ClientError {
    /// The scheduler error behind this failure, if any.
    pub fn request_error(&self) -> Option<&RequestError> {
        match self {
            ClientError::Request { source } => Some(source),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Builder)]
pub struct JsonClientConfig {
    #[builder(default)]
    pub scheduler: SchedulerSettings,
    #[builder(default = default_user_agent(), into)]
    pub user_agent: String,
    /// Used for the default transport when set.
    pub reqwest_client: Option<reqwest::Client>,
}

impl Default for JsonClientConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

fn default_user_agent() -> String {
    format!("json_client/{}", env!("CARGO_PKG_VERSION"))
}

/// One API call: where it goes, what it carries and how it is scheduled.
#[derive(Clone, Debug, Builder)]
pub struct ApiRequest {
    /// Filled one entry at a time with [`ApiRequestBuilder::parameter`].
    #[builder(field)]
    pub parameters: BTreeMap<String, Value>,
    #[builder(default = Method::GET)]
    pub method: Method,
    #[builder(into)]
    pub target: String,
    #[builder(default, into)]
    pub uri_template: String,
    #[builder(default)]
    pub request_content_type: ContentType,
    #[builder(default)]
    pub response_content_type: ContentType,
    #[builder(default)]
    pub cache_duration: Duration,
    #[builder(default = Duration::from_secs(30))]
    pub timeout: Duration,
    #[builder(default = 2)]
    pub retries: u32,
}

impl<S: api_request_builder::State> ApiRequestBuilder<S> {
    pub fn parameter(mut self, name: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(name.into(), value);
        self
    }
}

/// JSON client over a request scheduler.
///
/// Cheap to share behind an `Arc`; every method takes `&self`.
pub struct JsonClient<S = ReqwestTransport> {
    scheduler: Scheduler<S>,
    headers: RwLock<HeaderMap>,
    user_agent: String,
    template: UriTemplate,
}

impl JsonClient<ReqwestTransport> {
    /// Starts a client and its scheduler on the current tokio runtime.
    pub fn new(config: JsonClientConfig) -> Result<Self, ClientError> {
        let transport = match config.reqwest_client.clone() {
            Some(client) => ReqwestTransport::new_with_client(client),
            None => ReqwestTransport::new(),
        };
        Self::with_transport(config, transport)
    }
}

impl<S: Transport> JsonClient<S> {
    pub fn with_transport(config: JsonClientConfig, transport: S) -> Result<Self, ClientError> {
        let template = UriTemplate::new().map_err(|error| ClientError::Initialization {
            message: error.to_string(),
        })?;
        let scheduler = Scheduler::new(config.scheduler.clone(), transport)?;

        info!(
            target: "json_client",
            user_agent = %config.user_agent,
            max_outstanding = config.scheduler.max_outstanding,
            "JsonClient initialized"
        );
        debug!(target: "json_client", client_config = ?config, "Full client configuration");

        Ok(Self {
            scheduler,
            headers: RwLock::new(HeaderMap::new()),
            user_agent: config.user_agent,
            template,
        })
    }

    /// Sets a header sent with every subsequent request.
    pub fn set_header(&self, name: &str, value: &str) -> Result<(), ClientError> {
        let header = HeaderName::from_bytes(name.as_bytes()).map_err(|error| {
            ClientError::InvalidHeader {
                name: name.to_string(),
                message: error.to_string(),
            }
        })?;
        let value = HeaderValue::from_str(value).map_err(|error| ClientError::InvalidHeader {
            name: name.to_string(),
            message: error.to_string(),
        })?;
        self.headers.write().insert(header, value);
        Ok(())
    }

    pub fn remove_header(&self, name: &str) {
        self.headers.write().remove(name);
    }

    /// Expands the template, encodes leftover parameters and builds the scheduler request.
    pub fn prepare(&self, request: ApiRequest) -> Result<RequestSpec, ClientError> {
        let mut remaining = request.parameters.clone();
        let path = self.template.expand(&request.uri_template, &mut remaining);
        let body = encode_body(&request, &remaining)?;

        let raw = format!("{}{}", request.target, path);
        let raw = raw.trim_end_matches('/');
        let url = Url::parse(raw).context(InvalidUrlSnafu { url: raw })?;

        Ok(RequestSpec::builder()
            .method(request.method)
            .url(url)
            .headers(self.headers.read().clone())
            .maybe_body(body)
            .request_content_type(request.request_content_type)
            .response_content_type(request.response_content_type)
            .target(request.target)
            .uri_template(request.uri_template)
            .parameters(request.parameters)
            .user_agent(self.user_agent.clone())
            .cache_duration(request.cache_duration)
            .timeout(request.timeout)
            .retries(request.retries)
            .build())
    }

    /// Schedules `request` without waiting; `callback` receives the raw outcome.
    pub fn submit<F>(&self, request: ApiRequest, callback: F) -> Result<RequestId, ClientError>
    where
        F: FnOnce(Outcome) + Send + 'static,
    {
        let spec = self.prepare(request)?;
        Ok(self.scheduler.submit(spec, callback)?)
    }

    pub async fn request_text(&self, request: ApiRequest) -> Result<String, ClientError> {
        let spec = self.prepare(request)?;
        Ok(self.scheduler.request(spec).await?)
    }

    pub async fn request<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T, ClientError> {
        let body = self.request_text(request).await?;
        decode(body)
    }

    /// Blocking variant of [`JsonClient::request`]. Must not be called from inside an async
    /// task.
    pub fn request_blocking<T: DeserializeOwned>(
        &self,
        request: ApiRequest,
    ) -> Result<T, ClientError> {
        let spec = self.prepare(request)?;
        let body = self.scheduler.request_blocking(spec)?;
        decode(body)
    }

    pub fn start_recording(&self) {
        self.scheduler.recorder().start();
    }

    pub fn stop_recording(&self) {
        self.scheduler.recorder().stop();
    }

    pub fn is_recording(&self) -> bool {
        self.scheduler.recorder().is_recording()
    }

    pub fn clear_recording(&self) {
        self.scheduler.recorder().clear();
    }

    pub fn recording(&self) -> Vec<RequestSnapshot> {
        self.scheduler.recorder().requests()
    }

    pub fn scheduler(&self) -> &Scheduler<S> {
        &self.scheduler
    }

    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
    }
}

fn decode<T: DeserializeOwned>(body: String) -> Result<T, ClientError> {
    match serde_json::from_str(&body) {
        Ok(value) => Ok(value),
        Err(source) => Err(ClientError::Deserialization { source, body }),
    }
}

/// Turns parameters left over after template expansion into a request body.
fn encode_body(
    request: &ApiRequest,
    remaining: &BTreeMap<String, Value>,
) -> Result<Option<Bytes>, ClientError> {
    if remaining.is_empty() {
        return Ok(None);
    }

    let invalid = |message: String| ClientError::Request {
        source: RequestError::InvalidConfiguration { message },
    };
    let names = || remaining.keys().cloned().collect::<Vec<_>>().join(", ");

    if request.method != Method::PUT && request.method != Method::POST {
        return Err(invalid(format!(
            "unrecognized parameters for {}: {}",
            request.method,
            names()
        )));
    }

    match request.request_content_type {
        ContentType::Json => {
            let mut values = remaining.values();
            match (values.next(), values.next()) {
                (Some(value), None) => {
                    let body = serde_json::to_vec(value).context(SerializationSnafu)?;
                    Ok(Some(Bytes::from(body)))
                }
                _ => Err(invalid(format!(
                    "{} method with too many parameters: {}",
                    request.method,
                    names()
                ))),
            }
        }
        ContentType::Form => {
            let mut form = url::form_urlencoded::Serializer::new(String::new());
            for (name, value) in remaining {
                if !value.is_null() {
                    form.append_pair(name, &render(value));
                }
            }
            Ok(Some(Bytes::from(form.finish())))
        }
        content_type @ (ContentType::Xml | ContentType::Text) => {
            Err(ClientError::UnsupportedContentType { content_type })
        }
    }
}
