//! Data types exchanged with the sandbox service.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Opaque identifier of a remote sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SandboxId(String);

impl SandboxId {
    /// Wrap a service-issued identifier.
    ///
    /// Identifiers end up in URL paths, so empty ids and ids containing
    /// `/`, `?` or `#` are rejected.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(Error::Validation("sandbox id must not be empty".into()));
        }
        if id.contains(['/', '?', '#']) {
            return Err(Error::Validation(format!(
                "sandbox id contains a reserved character: {id}"
            )));
        }
        Ok(Self(id))
    }

    /// Get the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SandboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Status of a sandbox as reported by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxStatus {
    Creating,
    Queued,
    Provisioning,
    Booting,
    Running,
    Paused,
    Stopped,
    Failed,
    Finished,
    Error,
}

impl SandboxStatus {
    /// Wire representation of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Queued => "queued",
            Self::Provisioning => "provisioning",
            Self::Booting => "booting",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
            Self::Finished => "finished",
            Self::Error => "error",
        }
    }

    /// Lifecycle phase this status belongs to.
    pub fn phase(&self) -> Phase {
        match self {
            Self::Creating | Self::Queued | Self::Provisioning | Self::Booting => Phase::Pending,
            Self::Running | Self::Paused => Phase::Running,
            Self::Stopped | Self::Finished => Phase::Stopped,
            Self::Failed | Self::Error => Phase::Failed,
        }
    }

    /// True once the sandbox can no longer become ready.
    pub fn is_terminal(&self) -> bool {
        self.phase().is_terminal()
    }
}

impl fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SandboxStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        serde_json::from_value(serde_json::Value::String(s.to_ascii_lowercase()))
            .map_err(|_| Error::Validation(format!("unknown sandbox status: {s}")))
    }
}

/// Coarse lifecycle phase of a sandbox.
///
/// Phases only move forward: `Pending < Running < {Stopped, Failed} < Destroyed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Requested but not yet running.
    Pending,
    /// Running (or paused).
    Running,
    /// Stopped or finished by the service.
    Stopped,
    /// Failed to start or crashed.
    Failed,
    /// Torn down by this client.
    Destroyed,
}

impl Phase {
    /// Ordering rank used to reject backward transitions.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Running => 1,
            Self::Stopped | Self::Failed => 2,
            Self::Destroyed => 3,
        }
    }

    /// True for phases from which the sandbox cannot become ready.
    pub fn is_terminal(&self) -> bool {
        self.rank() >= 2
    }

    /// Whether moving from `self` to `next` goes forward (or stays put).
    pub fn can_advance_to(&self, next: Phase) -> bool {
        next.rank() >= self.rank()
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Running => write!(f, "Running"),
            Self::Stopped => write!(f, "Stopped"),
            Self::Failed => write!(f, "Failed"),
            Self::Destroyed => write!(f, "Destroyed"),
        }
    }
}

/// A sandbox as described by the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sandbox {
    /// Sandbox identifier.
    pub id: SandboxId,
    /// Current status.
    pub status: SandboxStatus,
    /// Lifetime limit in seconds.
    #[serde(default)]
    pub timeout: Option<u64>,
    /// Creation timestamp.
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    /// User metadata attached at creation.
    #[serde(default)]
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
    /// Failure details, if any.
    #[serde(default)]
    pub details: Option<String>,
    /// Public hostname of the sandbox.
    #[serde(default)]
    pub hostname: Option<String>,
}

impl Sandbox {
    /// Public URL for reaching `port` inside the sandbox.
    pub fn public_url(&self, port: u16) -> Result<String> {
        match self.hostname.as_deref() {
            Some(host) if !host.is_empty() => Ok(format!("https://{port}-{host}")),
            _ => Err(Error::Validation(
                "sandbox has no hostname; ensure it is created and running".into(),
            )),
        }
    }
}

/// Status of a command run inside a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Queued,
    Running,
    Done,
    Failed,
    Error,
}

impl CommandStatus {
    /// True once the command has finished one way or another.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Error)
    }

    /// Exit code implied by a terminal status when the service sends none.
    pub fn implied_exit_code(&self) -> i32 {
        if *self == Self::Done {
            0
        } else {
            1
        }
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Result of a command execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    /// Command identifier assigned by the service.
    pub id: String,
    /// The command line that was run.
    pub command: String,
    /// Final status.
    pub status: CommandStatus,
    /// Standard output.
    pub stdout: String,
    /// Standard error.
    pub stderr: String,
    /// Process exit code, if known.
    pub exit_code: Option<i32>,
    /// When the command was queued.
    pub created_at: Option<DateTime<Utc>>,
    /// When the command finished, if the service reported it.
    pub finished_at: Option<DateTime<Utc>>,
}

impl CommandResult {
    /// Check if the command succeeded (exit code 0).
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Callback receiving one line of command output.
pub type OutputCallback = Box<dyn FnMut(&str) + Send>;

/// Options for [`run`](crate::SandboxHandle::run).
pub struct CommandOptions {
    /// Give up after this long (default: no limit).
    pub timeout: Option<Duration>,
    /// Interval between command status polls (default: 1s). Intervals
    /// below [`MIN_POLL_INTERVAL`](crate::config::MIN_POLL_INTERVAL) are
    /// raised to it.
    pub poll_interval: Duration,
    /// Receives stdout lines as they arrive.
    pub on_stdout: Option<OutputCallback>,
    /// Receives stderr lines as they arrive.
    pub on_stderr: Option<OutputCallback>,
}

impl Default for CommandOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            poll_interval: Duration::from_secs(1),
            on_stdout: None,
            on_stderr: None,
        }
    }
}

impl fmt::Debug for CommandOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandOptions")
            .field("timeout", &self.timeout)
            .field("poll_interval", &self.poll_interval)
            .field("on_stdout", &self.on_stdout.is_some())
            .field("on_stderr", &self.on_stderr.is_some())
            .finish()
    }
}

impl CommandOptions {
    /// Options with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the overall command timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the status poll interval.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Stream stdout lines to `f`.
    pub fn on_stdout(mut self, f: impl FnMut(&str) + Send + 'static) -> Self {
        self.on_stdout = Some(Box::new(f));
        self
    }

    /// Stream stderr lines to `f`.
    pub fn on_stderr(mut self, f: impl FnMut(&str) + Send + 'static) -> Self {
        self.on_stderr = Some(Box::new(f));
        self
    }

    /// True when output should be delivered incrementally.
    pub fn is_streaming(&self) -> bool {
        self.on_stdout.is_some() || self.on_stderr.is_some()
    }

    pub(crate) fn emit_stdout(&mut self, chunk: &str) {
        if let Some(cb) = self.on_stdout.as_mut() {
            for line in chunk.lines().filter(|l| !l.is_empty()) {
                cb(line);
            }
        }
    }

    pub(crate) fn emit_stderr(&mut self, chunk: &str) {
        if let Some(cb) = self.on_stderr.as_mut() {
            for line in chunk.lines().filter(|l| !l.is_empty()) {
                cb(line);
            }
        }
    }
}

/// A port inside a sandbox exposed on a public proxy port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExposedPort {
    /// Externally reachable port.
    pub proxy_port: u16,
    /// Port inside the sandbox.
    pub target_port: u16,
    /// When the mapping expires.
    pub expires_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_status_wire_values() {
        let all = [
            (SandboxStatus::Creating, "creating"),
            (SandboxStatus::Queued, "queued"),
            (SandboxStatus::Provisioning, "provisioning"),
            (SandboxStatus::Booting, "booting"),
            (SandboxStatus::Running, "running"),
            (SandboxStatus::Paused, "paused"),
            (SandboxStatus::Stopped, "stopped"),
            (SandboxStatus::Failed, "failed"),
            (SandboxStatus::Finished, "finished"),
            (SandboxStatus::Error, "error"),
        ];
        for (status, wire) in all {
            assert_eq!(status.as_str(), wire);
            assert_eq!(serde_json::to_value(status).unwrap(), wire);
            assert_eq!(wire.parse::<SandboxStatus>().unwrap(), status);
        }
        assert!("exploded".parse::<SandboxStatus>().is_err());
    }

    #[test]
    fn test_phase_mapping_and_order() {
        assert_eq!(SandboxStatus::Booting.phase(), Phase::Pending);
        assert_eq!(SandboxStatus::Paused.phase(), Phase::Running);
        assert_eq!(SandboxStatus::Finished.phase(), Phase::Stopped);
        assert_eq!(SandboxStatus::Error.phase(), Phase::Failed);

        assert!(Phase::Pending.can_advance_to(Phase::Running));
        assert!(Phase::Running.can_advance_to(Phase::Running));
        assert!(!Phase::Running.can_advance_to(Phase::Pending));
        assert!(!Phase::Failed.can_advance_to(Phase::Running));
        assert!(Phase::Failed.can_advance_to(Phase::Destroyed));
        assert!(!SandboxStatus::Running.is_terminal());
        assert!(SandboxStatus::Stopped.is_terminal());
    }

    #[test]
    fn test_sandbox_id_validation() {
        assert!(SandboxId::new("box-123").is_ok());
        assert!(matches!(SandboxId::new(""), Err(Error::Validation(_))));
        assert!(matches!(SandboxId::new("a/b"), Err(Error::Validation(_))));
        assert_eq!(SandboxId::new("box-1").unwrap().to_string(), "box-1");
    }

    #[test]
    fn test_sandbox_deserialize_minimal_and_full() {
        let minimal: Sandbox =
            serde_json::from_str(r#"{"id":"box-1","status":"queued"}"#).unwrap();
        assert_eq!(minimal.status, SandboxStatus::Queued);
        assert!(minimal.hostname.is_none());

        let full: Sandbox = serde_json::from_value(serde_json::json!({
            "id": "box-123",
            "status": "running",
            "timeout": 3600,
            "created_at": "2024-01-01T00:00:00Z",
            "details": null,
            "hostname": "box789.tavor.app",
            "metadata": {"env": "test"}
        }))
        .unwrap();
        assert_eq!(full.timeout, Some(3600));
        assert_eq!(
            full.created_at.unwrap().to_rfc3339(),
            "2024-01-01T00:00:00+00:00"
        );
        assert_eq!(full.metadata.unwrap()["env"], "test");
    }

    #[test]
    fn test_public_url() {
        let mut sandbox: Sandbox = serde_json::from_value(serde_json::json!({
            "id": "box-888",
            "status": "running",
            "hostname": "box888.tavor.app"
        }))
        .unwrap();
        assert_eq!(
            sandbox.public_url(8080).unwrap(),
            "https://8080-box888.tavor.app"
        );
        sandbox.hostname = None;
        assert!(matches!(sandbox.public_url(80), Err(Error::Validation(_))));
    }

    #[test]
    fn test_command_status_exit_codes() {
        assert!(CommandStatus::Done.is_terminal());
        assert!(!CommandStatus::Running.is_terminal());
        assert_eq!(CommandStatus::Done.implied_exit_code(), 0);
        assert_eq!(CommandStatus::Failed.implied_exit_code(), 1);
        assert_eq!(CommandStatus::Error.implied_exit_code(), 1);
    }

    #[test]
    fn test_command_options_emit_lines() {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&lines);
        let mut options = CommandOptions::new().on_stdout(move |l| {
            sink.lock().unwrap().push(l.to_string());
        });
        assert!(options.is_streaming());
        options.emit_stdout("one\ntwo\n\nthree");
        options.emit_stderr("ignored without callback\n");
        assert_eq!(*lines.lock().unwrap(), vec!["one", "two", "three"]);
        assert_eq!(CommandOptions::default().poll_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_exposed_port_deserialize() {
        let port: ExposedPort = serde_json::from_str(
            r#"{"proxy_port":41234,"target_port":8080,"expires_at":"2024-06-01T12:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(port.proxy_port, 41234);
        assert_eq!(port.target_port, 8080);
    }
}
