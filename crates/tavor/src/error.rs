//! Error types for the Tavor SDK.

use crate::models::SandboxStatus;
use thiserror::Error;

/// Result type alias for Tavor operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while talking to the sandbox service.
#[derive(Debug, Error)]
pub enum Error {
    /// Network or connection failure before a response was received.
    #[error("transport error: {0}")]
    Transport(String),

    /// A deadline was exceeded (request timeout, readiness wait, command run).
    #[error("timed out: {0}")]
    Timeout(String),

    /// The service answered with a non-2xx status.
    #[error("remote error {status}: {message}")]
    Remote {
        /// HTTP status code
        status: u16,
        /// `error`/`message` field of the body, or the raw body
        message: String,
        /// Raw response body
        body: String,
    },

    /// Local input was rejected before anything was sent.
    #[error("validation error: {0}")]
    Validation(String),

    /// The sandbox reached a failure or stopped state while we waited on it.
    #[error(
        "sandbox {id} entered {status}{}",
        .details.as_deref().map(|d| format!(": {d}")).unwrap_or_default()
    )]
    SandboxFailed {
        /// Sandbox identifier
        id: String,
        /// Status reported by the service
        status: SandboxStatus,
        /// Failure details reported by the service
        details: Option<String>,
    },

    /// The caller cancelled a pending wait.
    #[error("operation cancelled")]
    Cancelled,

    /// The handle's sandbox has already been released.
    #[error("sandbox handle {0} is closed")]
    Closed(String),

    /// The service reported an error while running a command.
    #[error("command error: {0}")]
    Command(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Build a [`Error::Remote`] from a status code and raw body.
    ///
    /// The message is taken from the body's `error` or `message` field when
    /// the body is a JSON object, and falls back to the body text.
    pub fn remote(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        let message = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| {
                v.get("error")
                    .or_else(|| v.get("message"))
                    .and_then(|m| m.as_str())
                    .map(str::to_owned)
            })
            .unwrap_or_else(|| {
                if body.trim().is_empty() {
                    format!("HTTP {status}")
                } else {
                    body.trim().to_owned()
                }
            });
        Self::Remote {
            status,
            message,
            body,
        }
    }

    /// Whether a retry of the same request could succeed.
    ///
    /// Transport failures and 5xx responses are retryable; timeouts,
    /// validation failures, 4xx responses and terminal sandbox failures are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Remote { status, .. } => (500..600).contains(status),
            _ => false,
        }
    }

    /// HTTP status of a [`Error::Remote`], if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Remote { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// True for a `404 Not Found` from the service.
    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }

    /// True for `401`/`403` responses.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self.status(), Some(401) | Some(403))
    }
}
