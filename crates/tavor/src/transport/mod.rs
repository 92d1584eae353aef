//! Transport adapters: "send an HTTP request, get a response".
//!
//! [`Transport`] is the blocking contract and [`AsyncTransport`] the
//! event-loop one. Both fail with [`Error::Transport`] on network failure,
//! [`Error::Timeout`] when the configured timeout is exceeded, and
//! [`Error::Remote`] on non-2xx responses.

use crate::config::RetryPolicy;
use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use std::time::{Duration, Instant};

#[cfg(feature = "async")]
mod reqwest_backend;
#[cfg(feature = "blocking")]
mod ureq_backend;

#[cfg(feature = "async")]
pub use reqwest_backend::ReqwestTransport;
#[cfg(feature = "blocking")]
pub use ureq_backend::UreqTransport;

/// HTTP methods used by the API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Delete,
}

impl Method {
    /// Safe to repeat without changing the outcome.
    pub fn is_idempotent(&self) -> bool {
        matches!(self, Self::Get | Self::Delete)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request relative to the configured base URL.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub method: Method,
    pub path: String,
    pub body: Option<Value>,
}

impl Request {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            path: path.into(),
            body: None,
        }
    }

    pub fn post(path: impl Into<String>, body: Option<Value>) -> Self {
        Self {
            method: Method::Post,
            path: path.into(),
            body,
        }
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self {
            method: Method::Delete,
            path: path.into(),
            body: None,
        }
    }
}

/// A raw HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub body: String,
}

impl Response {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Turn a non-2xx response into [`Error::Remote`].
    pub fn error_for_status(self) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(Error::remote(self.status, self.body))
        }
    }

    /// Decode the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_str(&self.body)?)
    }
}

/// Whether a streaming sink wants more chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamControl {
    Continue,
    Stop,
}

/// Blocking transport.
pub trait Transport: Send + Sync {
    /// Send a request and wait for the complete response.
    fn send(&self, request: &Request) -> Result<Response>;

    /// Send a request and feed the response body to `sink` as it arrives.
    ///
    /// `timeout` bounds the whole exchange, body included; `None` lets the
    /// stream stay open indefinitely. Non-2xx responses fail before the sink
    /// sees any data. The default implementation delivers the whole body in
    /// one chunk.
    fn send_streaming(
        &self,
        request: &Request,
        _timeout: Option<Duration>,
        sink: &mut dyn FnMut(&[u8]) -> Result<StreamControl>,
    ) -> Result<()> {
        let response = self.send(request)?.error_for_status()?;
        sink(response.body.as_bytes())?;
        Ok(())
    }
}

/// Event-loop transport.
#[cfg(feature = "async")]
#[async_trait::async_trait]
pub trait AsyncTransport: Send + Sync {
    /// Send a request and wait for the complete response.
    async fn send(&self, request: &Request) -> Result<Response>;
}

/// Send through a blocking transport, retrying idempotent requests on
/// retryable errors.
pub fn send_with_retry(
    transport: &dyn Transport,
    request: &Request,
    policy: &RetryPolicy,
) -> Result<Response> {
    let start = Instant::now();
    let mut attempt = 0u32;
    loop {
        let result = transport
            .send(request)
            .and_then(Response::error_for_status);
        match result {
            Ok(response) => {
                tracing::debug!(
                    method = %request.method,
                    path = %request.path,
                    status = response.status,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Request completed"
                );
                return Ok(response);
            }
            Err(e) if should_retry(request, &e, attempt, policy) => {
                let delay = policy.backoff.delay(attempt);
                attempt += 1;
                tracing::warn!(
                    method = %request.method,
                    path = %request.path,
                    attempt,
                    max_retries = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Request failed, retrying"
                );
                std::thread::sleep(delay);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Async counterpart of [`send_with_retry`].
#[cfg(feature = "async")]
pub async fn send_with_retry_async(
    transport: &dyn AsyncTransport,
    request: &Request,
    policy: &RetryPolicy,
) -> Result<Response> {
    let start = tokio::time::Instant::now();
    let mut attempt = 0u32;
    loop {
        let result = transport
            .send(request)
            .await
            .and_then(Response::error_for_status);
        match result {
            Ok(response) => {
                tracing::debug!(
                    method = %request.method,
                    path = %request.path,
                    status = response.status,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Request completed"
                );
                return Ok(response);
            }
            Err(e) if should_retry(request, &e, attempt, policy) => {
                let delay = policy.backoff.delay(attempt);
                attempt += 1;
                tracing::warn!(
                    method = %request.method,
                    path = %request.path,
                    attempt,
                    max_retries = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Request failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

fn should_retry(request: &Request, error: &Error, attempt: u32, policy: &RetryPolicy) -> bool {
    request.method.is_idempotent() && error.is_retryable() && attempt < policy.max_retries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Backoff;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct Scripted {
        replies: Mutex<VecDeque<Result<Response>>>,
        calls: Mutex<u32>,
    }

    impl Scripted {
        fn new(replies: Vec<Result<Response>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    impl Transport for Scripted {
        fn send(&self, _request: &Request) -> Result<Response> {
            *self.calls.lock().unwrap() += 1;
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Response::new(200, "{}")))
        }
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            backoff: Backoff::constant(Duration::from_millis(1)),
        }
    }

    #[test]
    fn test_retries_idempotent_request_on_5xx() {
        let transport = Scripted::new(vec![
            Ok(Response::new(503, "unavailable")),
            Err(Error::Transport("connection reset".into())),
            Ok(Response::new(200, r#"{"ok":true}"#)),
        ]);
        let response =
            send_with_retry(&transport, &Request::get("/x"), &fast_policy(2)).expect("retried");
        assert_eq!(response.status, 200);
        assert_eq!(transport.calls(), 3);
    }

    #[test]
    fn test_gives_up_after_max_retries() {
        let transport = Scripted::new(vec![
            Ok(Response::new(500, "")),
            Ok(Response::new(500, "")),
            Ok(Response::new(200, "")),
        ]);
        let err = send_with_retry(&transport, &Request::delete("/x"), &fast_policy(1)).unwrap_err();
        assert_eq!(err.status(), Some(500));
        assert_eq!(transport.calls(), 2);
    }

    #[test]
    fn test_never_retries_post() {
        let transport = Scripted::new(vec![Ok(Response::new(502, "bad gateway"))]);
        let err =
            send_with_retry(&transport, &Request::post("/x", None), &fast_policy(3)).unwrap_err();
        assert_eq!(err.status(), Some(502));
        assert_eq!(transport.calls(), 1);
    }

    #[test]
    fn test_never_retries_client_errors() {
        let transport = Scripted::new(vec![Ok(Response::new(404, r#"{"error":"gone"}"#))]);
        let err = send_with_retry(&transport, &Request::get("/x"), &fast_policy(3)).unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(transport.calls(), 1);
    }

    #[test]
    fn test_default_streaming_delivers_whole_body() {
        let transport = Scripted::new(vec![Ok(Response::new(200, "data: x\n\n"))]);
        let mut seen = Vec::new();
        transport
            .send_streaming(&Request::post("/x", None), None, &mut |chunk| {
                seen.extend_from_slice(chunk);
                Ok(StreamControl::Continue)
            })
            .unwrap();
        assert_eq!(seen, b"data: x\n\n");
    }

    #[test]
    fn test_method_idempotency() {
        assert!(Method::Get.is_idempotent());
        assert!(Method::Delete.is_idempotent());
        assert!(!Method::Post.is_idempotent());
        assert_eq!(Method::Delete.to_string(), "DELETE");
    }
}
