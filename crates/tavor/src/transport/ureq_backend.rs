//! Blocking transport on top of `ureq`.

use super::{Method, Request, Response, StreamControl, Transport};
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use std::io::Read;
use std::time::Duration;

const STREAM_CHUNK_SIZE: usize = 8 * 1024;

/// Blocking HTTP transport.
///
/// Holds a pooled `ureq::Agent` and a copy of the client configuration.
/// Every request carries `X-API-Key` and `Content-Type: application/json`.
pub struct UreqTransport {
    agent: ureq::Agent,
    config: ClientConfig,
}

impl UreqTransport {
    pub fn new(config: &ClientConfig) -> Self {
        let agent = ureq::Agent::config_builder()
            .timeout_global(Some(config.request_timeout))
            .http_status_as_error(false)
            .build()
            .new_agent();

        tracing::debug!(
            base_url = %config.base_url,
            timeout_ms = config.request_timeout.as_millis() as u64,
            "ureq transport initialized"
        );

        Self {
            agent,
            config: config.clone(),
        }
    }

    fn call(
        &self,
        request: &Request,
        timeout: Option<Duration>,
    ) -> Result<ureq::http::Response<ureq::Body>> {
        let url = self.config.url(&request.path);
        tracing::trace!(method = %request.method, url = %url, "Sending request");

        let result = match request.method {
            Method::Get => self
                .authorize(self.agent.get(&url))
                .config()
                .timeout_global(timeout)
                .build()
                .call(),
            Method::Delete => self
                .authorize(self.agent.delete(&url))
                .config()
                .timeout_global(timeout)
                .build()
                .call(),
            Method::Post => {
                let builder = self
                    .authorize(self.agent.post(&url))
                    .config()
                    .timeout_global(timeout)
                    .build();
                match &request.body {
                    Some(body) => builder.send(serde_json::to_string(body)?),
                    None => builder.send_empty(),
                }
            }
        };

        result.map_err(|e| self.map_error(request, e))
    }

    fn authorize<B>(&self, builder: ureq::RequestBuilder<B>) -> ureq::RequestBuilder<B> {
        builder
            .header("X-API-Key", &self.config.api_key)
            .header("Content-Type", "application/json")
    }

    fn map_error(&self, request: &Request, error: ureq::Error) -> Error {
        match error {
            ureq::Error::Timeout(_) => {
                Error::Timeout(format!("{} {} timed out", request.method, request.path))
            }
            ureq::Error::Io(e) => Self::map_io_error(request, e),
            other => Error::Transport(format!("{} {}: {other}", request.method, request.path)),
        }
    }

    /// Body reads surface ureq errors wrapped in `io::Error`.
    fn map_io_error(request: &Request, error: std::io::Error) -> Error {
        let timed_out = error.kind() == std::io::ErrorKind::TimedOut
            || matches!(
                error.get_ref().and_then(|inner| inner.downcast_ref::<ureq::Error>()),
                Some(ureq::Error::Timeout(_))
            );
        if timed_out {
            Error::Timeout(format!("{} {}: {error}", request.method, request.path))
        } else {
            Error::Transport(format!("{} {}: {error}", request.method, request.path))
        }
    }
}

impl Transport for UreqTransport {
    fn send(&self, request: &Request) -> Result<Response> {
        let mut response = self.call(request, Some(self.config.request_timeout))?;
        let status = response.status().as_u16();
        let body = response
            .body_mut()
            .read_to_string()
            .map_err(|e| self.map_error(request, e))?;
        Response::new(status, body).error_for_status()
    }

    fn send_streaming(
        &self,
        request: &Request,
        timeout: Option<Duration>,
        sink: &mut dyn FnMut(&[u8]) -> Result<StreamControl>,
    ) -> Result<()> {
        let mut response = self.call(request, timeout)?;
        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let body = response.body_mut().read_to_string().unwrap_or_default();
            return Err(Error::remote(status, body));
        }

        let mut reader = response.into_body().into_reader();
        let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
        loop {
            let n = reader
                .read(&mut buf)
                .map_err(|e| Self::map_io_error(request, e))?;
            if n == 0 {
                return Ok(());
            }
            if sink(&buf[..n])? == StreamControl::Stop {
                tracing::trace!(path = %request.path, "Stream closed by consumer");
                return Ok(());
            }
        }
    }
}
