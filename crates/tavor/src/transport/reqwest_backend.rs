//! Event-loop transport on top of `reqwest`.

use super::{AsyncTransport, Method, Request, Response};
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::Client;
use std::sync::Arc;

/// Async HTTP transport. Clone is a cheap refcount bump on the inner
/// connection pool.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
    config: Arc<ClientConfig>,
}

impl ReqwestTransport {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let mut key = HeaderValue::from_str(&config.api_key)
            .map_err(|_| Error::Validation("API key is not a valid header value".into()))?;
        key.set_sensitive(true);
        headers.insert("X-API-Key", key);

        let client = Client::builder()
            .timeout(config.request_timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Transport(format!("http client: {e}")))?;

        tracing::debug!(
            base_url = %config.base_url,
            timeout_ms = config.request_timeout.as_millis() as u64,
            "reqwest transport initialized"
        );

        Ok(Self {
            client,
            config: Arc::new(config.clone()),
        })
    }

    fn map_error(request: &Request, error: reqwest::Error) -> Error {
        if error.is_timeout() {
            Error::Timeout(format!("{} {}: {error}", request.method, request.path))
        } else {
            Error::Transport(format!("{} {}: {error}", request.method, request.path))
        }
    }
}

#[async_trait::async_trait]
impl AsyncTransport for ReqwestTransport {
    async fn send(&self, request: &Request) -> Result<Response> {
        let url = self.config.url(&request.path);
        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Delete => reqwest::Method::DELETE,
        };
        tracing::trace!(method = %request.method, url = %url, "Sending request");

        let mut builder = self.client.request(method, url);
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Self::map_error(request, e))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| Self::map_error(request, e))?;

        Response::new(status, body).error_for_status()
    }
}
