//! Shared fixtures: a recording transport scripted per route.
#![allow(dead_code)]

use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tavor::transport::{Method, Request, Response, StreamControl, Transport};
use tavor::{Backoff, Client, ClientConfig, Error, PollConfig, Result, RetryPolicy};

pub const BOX_ID: &str = "box-123";
pub const BOX_PATH: &str = "/api/v2/boxes/box-123";

/// One scripted answer.
#[derive(Debug, Clone)]
pub enum Reply {
    Status(u16, String),
    Unreachable,
}

pub fn ok(body: Value) -> Reply {
    Reply::Status(200, body.to_string())
}

pub fn status(code: u16, body: &str) -> Reply {
    Reply::Status(code, body.to_string())
}

pub fn no_content() -> Reply {
    Reply::Status(204, String::new())
}

/// `GET /api/v2/boxes/{id}` body for the test sandbox.
pub fn box_status(status: &str) -> Reply {
    ok(json!({
        "data": {
            "id": BOX_ID,
            "status": status,
            "timeout": 600,
            "created_at": "2026-01-01T00:00:00Z",
            "hostname": "box-123.tavor.app"
        }
    }))
}

pub fn created() -> Reply {
    ok(json!({ "id": BOX_ID }))
}

/// Transport that answers from per-route queues and records every request.
///
/// Each route pops replies in order; the last reply repeats. Unknown routes
/// answer 404.
#[derive(Default)]
pub struct MockTransport {
    routes: Mutex<HashMap<(Method, String), VecDeque<Reply>>>,
    calls: Mutex<Vec<Request>>,
    stream_timeouts: Mutex<Vec<Option<Duration>>>,
    chunk_size: usize,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            chunk_size: 5,
            ..Self::default()
        }
    }

    pub fn on(self, method: Method, path: &str, replies: impl IntoIterator<Item = Reply>) -> Self {
        self.routes
            .lock()
            .unwrap()
            .insert((method, path.to_string()), replies.into_iter().collect());
        self
    }

    pub fn calls(&self) -> Vec<Request> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, method: Method, path: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.method == method && r.path == path)
            .count()
    }

    /// Deadlines passed to `send_streaming`, in call order.
    pub fn stream_timeouts(&self) -> Vec<Option<Duration>> {
        self.stream_timeouts.lock().unwrap().clone()
    }

    pub fn last_body(&self, method: Method, path: &str) -> Option<Value> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|r| r.method == method && r.path == path)
            .and_then(|r| r.body.clone())
    }

    fn reply(&self, request: &Request) -> Result<Response> {
        self.calls.lock().unwrap().push(request.clone());
        let mut routes = self.routes.lock().unwrap();
        let reply = match routes.get_mut(&(request.method, request.path.clone())) {
            Some(queue) if queue.len() > 1 => queue.pop_front(),
            Some(queue) => queue.front().cloned(),
            None => None,
        };
        match reply {
            Some(Reply::Status(code, body)) => Ok(Response::new(code, body)),
            Some(Reply::Unreachable) => Err(Error::Transport("connection refused".into())),
            None => Ok(Response::new(404, r#"{"error":"not found"}"#)),
        }
    }
}

impl Transport for MockTransport {
    fn send(&self, request: &Request) -> Result<Response> {
        self.reply(request)
    }

    fn send_streaming(
        &self,
        request: &Request,
        timeout: Option<Duration>,
        sink: &mut dyn FnMut(&[u8]) -> Result<StreamControl>,
    ) -> Result<()> {
        self.stream_timeouts.lock().unwrap().push(timeout);
        let response = self.reply(request)?.error_for_status()?;
        for chunk in response.body.as_bytes().chunks(self.chunk_size) {
            if sink(chunk)? == StreamControl::Stop {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(feature = "async")]
#[async_trait::async_trait]
impl tavor::transport::AsyncTransport for MockTransport {
    async fn send(&self, request: &Request) -> Result<Response> {
        self.reply(request)
    }
}

/// Config with instant retries and a short readiness deadline.
pub fn config() -> ClientConfig {
    ClientConfig::builder()
        .api_key("sk-tavor-test")
        .base_url("http://sandbox.test")
        .retry(RetryPolicy {
            max_retries: 2,
            backoff: Backoff::constant(Duration::from_millis(1)),
        })
        .poll(PollConfig {
            timeout: Some(Duration::from_secs(5)),
            backoff: Backoff::constant(Duration::from_millis(1)),
        })
        .build()
        .expect("valid test config")
}

pub fn client(transport: &Arc<MockTransport>) -> Client {
    Client::with_transport(config(), transport.clone()).expect("client")
}
