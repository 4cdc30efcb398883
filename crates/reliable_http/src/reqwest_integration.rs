use std::task::{Context, Poll};

use futures::future::BoxFuture;
use http::{HeaderValue, StatusCode, header};
use tower::Service;

use crate::http::HttpError;
use crate::request::RequestDescriptor;

/// A `tower::Service` wrapper for `reqwest::Client` that executes a [`RequestDescriptor`] and
/// reads the response body as text.
#[derive(Clone, Debug)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    pub fn new_with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn build(&self, request: RequestDescriptor) -> Result<reqwest::RequestBuilder, HttpError> {
        let mut builder = self
            .client
            .request(request.method, request.url)
            .headers(request.headers);

        if let Some(agent) = request.user_agent {
            let agent = HeaderValue::from_str(&agent).map_err(|error| HttpError::InvalidRequest {
                details: format!("Invalid user agent '{}': {}", agent, error),
            })?;
            builder = builder.header(header::USER_AGENT, agent);
        }
        builder = builder.header(header::ACCEPT, request.response_content_type.mime());

        if let Some(body) = request.body {
            builder = builder
                .header(header::CONTENT_TYPE, request.request_content_type.mime())
                .body(body);
        }
        Ok(builder)
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<RequestDescriptor> for ReqwestTransport {
    type Response = String;
    type Error = HttpError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: RequestDescriptor) -> Self::Future {
        let builder = match self.build(request) {
            Ok(builder) => builder,
            Err(error) => return Box::pin(async move { Err(error) }),
        };

        let request_future = builder.send();
        Box::pin(async move {
            let response = request_future.await.map_err(classify)?;
            let status = response.status();
            if !status.is_success() {
                let error_body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "Could not read error body".to_string());

                if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                    warn!(status = %status, error_body = %error_body, "Server error or rate limited");
                } else if status.is_client_error() {
                    error!(status = %status, error_body = %error_body, "Client error");
                }

                return Err(HttpError::ServerError {
                    status: status.as_u16(),
                    body: error_body,
                });
            }
            response.text().await.map_err(classify)
        })
    }
}

fn classify(error: reqwest::Error) -> HttpError {
    if error.is_timeout() {
        warn!(%error, "Request timed out");
        HttpError::Timeout
    } else if error.is_connect() {
        error!(%error, "Connection error");
        HttpError::Transport {
            source: Box::new(error),
        }
    } else if error.is_builder() {
        HttpError::InvalidRequest {
            details: error.to_string(),
        }
    } else {
        error!(%error, "Other reqwest error");
        HttpError::ClientError {
            source: Box::new(error),
        }
    }
}
