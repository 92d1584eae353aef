//! Backend-independent handle state: phase tracking, readiness decisions
//! and command output bookkeeping shared by the blocking and async handles.

use crate::api::{StreamEnd, StreamError, StreamOutput, StreamStart, StreamStatus};
use crate::error::{Error, Result};
use crate::models::{
    CommandOptions, CommandResult, CommandStatus, Phase, Sandbox, SandboxId, SandboxStatus,
};
use crate::poller::Poll;
use crate::sse::SseEvent;
use crate::transport::StreamControl;
use serde::de::DeserializeOwned;

/// What a handle knows about its sandbox.
#[derive(Debug)]
pub(crate) struct SessionState {
    id: SandboxId,
    latest: Option<Sandbox>,
    phase: Phase,
    released: bool,
}

impl SessionState {
    pub(crate) fn new(id: SandboxId) -> Self {
        Self {
            id,
            latest: None,
            phase: Phase::Pending,
            released: false,
        }
    }

    pub(crate) fn id(&self) -> &SandboxId {
        &self.id
    }

    pub(crate) fn latest(&self) -> Option<&Sandbox> {
        self.latest.as_ref()
    }

    pub(crate) fn phase(&self) -> Phase {
        self.phase
    }

    pub(crate) fn is_released(&self) -> bool {
        self.released
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.released {
            Err(Error::Closed(self.id.to_string()))
        } else {
            Ok(())
        }
    }

    /// Record a fresh description, ignoring anything that would move the
    /// phase backwards.
    pub(crate) fn observe(&mut self, sandbox: Sandbox) {
        let next = sandbox.status.phase();
        if !self.phase.can_advance_to(next) {
            tracing::warn!(
                sandbox_id = %self.id,
                observed = %sandbox.status,
                phase = %self.phase,
                "Discarding stale sandbox status"
            );
            return;
        }
        if next != self.phase {
            tracing::debug!(
                sandbox_id = %self.id,
                from = %self.phase,
                to = %next,
                status = %sandbox.status,
                "Sandbox phase changed"
            );
        }
        self.phase = next;
        self.latest = Some(sandbox);
    }

    /// Readiness verdict from the latest observation.
    pub(crate) fn readiness(&self) -> Result<Poll<()>> {
        match self.phase {
            Phase::Destroyed => Err(Error::Closed(self.id.to_string())),
            Phase::Stopped | Phase::Failed => {
                let (status, details) = self
                    .latest
                    .as_ref()
                    .map(|s| (s.status, s.details.clone()))
                    .unwrap_or((SandboxStatus::Failed, None));
                Err(Error::SandboxFailed {
                    id: self.id.to_string(),
                    status,
                    details,
                })
            }
            _ => match self.latest.as_ref().map(|s| s.status) {
                Some(SandboxStatus::Running) => Ok(Poll::Ready(())),
                _ => Ok(Poll::Pending),
            },
        }
    }

    pub(crate) fn mark_destroyed(&mut self) {
        self.released = true;
        self.phase = Phase::Destroyed;
    }

    pub(crate) fn mark_detached(&mut self) {
        self.released = true;
    }
}

fn payload<T: DeserializeOwned>(event: &SseEvent) -> Option<T> {
    match serde_json::from_str(&event.data) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::debug!(event = %event.event, error = %e, "Ignoring malformed stream payload");
            None
        }
    }
}

/// Accumulates a command's server-sent event stream.
#[derive(Debug)]
pub(crate) struct StreamedCommand {
    command: String,
    command_id: Option<String>,
    status: CommandStatus,
    exit_code: Option<i32>,
    stdout: String,
    stderr: String,
}

impl StreamedCommand {
    pub(crate) fn new(command: &str) -> Self {
        Self {
            command: command.to_owned(),
            command_id: None,
            status: CommandStatus::Queued,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    /// Apply one event. Returns `Stop` once the stream reports completion.
    pub(crate) fn apply(
        &mut self,
        event: &SseEvent,
        options: &mut CommandOptions,
    ) -> Result<StreamControl> {
        match event.event.as_str() {
            "start" => {
                if let Some(start) = payload::<StreamStart>(event) {
                    self.command_id = start.command_id;
                }
            }
            "output" => {
                if let Some(output) = payload::<StreamOutput>(event) {
                    if let Some(chunk) = output.stdout.filter(|s| !s.is_empty()) {
                        options.emit_stdout(&chunk);
                        self.stdout.push_str(&chunk);
                    }
                    if let Some(chunk) = output.stderr.filter(|s| !s.is_empty()) {
                        options.emit_stderr(&chunk);
                        self.stderr.push_str(&chunk);
                    }
                }
            }
            "status" => {
                if let Some(status) = payload::<StreamStatus>(event) {
                    self.status = status.status;
                    if status.exit_code.is_some() {
                        self.exit_code = status.exit_code;
                    }
                }
            }
            "end" => {
                if let Some(end) = payload::<StreamEnd>(event) {
                    match end.status.as_str() {
                        "error" => self.status = CommandStatus::Error,
                        "timeout" => {
                            return Err(Error::Timeout(format!(
                                "command timed out: {}",
                                self.command
                            )))
                        }
                        "success" if !self.status.is_terminal() => {
                            self.status = CommandStatus::Done
                        }
                        _ => {}
                    }
                    return Ok(StreamControl::Stop);
                }
            }
            "error" => {
                if let Some(error) = payload::<StreamError>(event) {
                    return Err(Error::Command(
                        error.error.unwrap_or_else(|| "unknown error".into()),
                    ));
                }
            }
            "timeout" => {
                if payload::<serde_json::Value>(event).is_some() {
                    return Err(Error::Timeout(format!("command timed out: {}", self.command)));
                }
            }
            other => tracing::trace!(event = other, "Ignoring unknown stream event"),
        }
        Ok(StreamControl::Continue)
    }

    /// Without a reported exit code, a terminal status implies one the same
    /// way a polled command record does; otherwise it stays unknown.
    pub(crate) fn into_result(self) -> CommandResult {
        let status = self.status;
        let exit_code = self
            .exit_code
            .or_else(|| status.is_terminal().then(|| status.implied_exit_code()));
        CommandResult {
            id: self.command_id.unwrap_or_default(),
            command: self.command,
            status,
            stdout: self.stdout,
            stderr: self.stderr,
            exit_code,
            created_at: None,
            finished_at: None,
        }
    }
}

/// Tracks how much polled output has already been handed to callbacks.
#[derive(Debug, Default)]
pub(crate) struct OutputCursor {
    stdout: usize,
    stderr: usize,
}

impl OutputCursor {
    /// Deliver whatever was appended since the previous call.
    pub(crate) fn deliver(
        &mut self,
        stdout: Option<&str>,
        stderr: Option<&str>,
        options: &mut CommandOptions,
    ) {
        if let Some(new) = Self::advance(&mut self.stdout, stdout) {
            options.emit_stdout(new);
        }
        if let Some(new) = Self::advance(&mut self.stderr, stderr) {
            options.emit_stderr(new);
        }
    }

    fn advance<'a>(seen: &mut usize, full: Option<&'a str>) -> Option<&'a str> {
        let full = full?;
        // Output that shrank or split a char is resent from the start.
        let new = full.get(*seen..).unwrap_or(full);
        *seen = full.len();
        (!new.is_empty()).then_some(new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn sandbox(status: SandboxStatus) -> Sandbox {
        Sandbox {
            id: SandboxId::new("box-1").unwrap(),
            status,
            timeout: None,
            created_at: None,
            metadata: None,
            details: None,
            hostname: None,
        }
    }

    fn event(name: &str, data: &str) -> SseEvent {
        SseEvent {
            event: name.into(),
            data: data.into(),
        }
    }

    #[test]
    fn test_phase_never_regresses() {
        let mut state = SessionState::new(SandboxId::new("box-1").unwrap());
        state.observe(sandbox(SandboxStatus::Running));
        state.observe(sandbox(SandboxStatus::Booting));
        assert_eq!(state.phase(), Phase::Running);
        assert_eq!(state.latest().unwrap().status, SandboxStatus::Running);

        state.observe(sandbox(SandboxStatus::Paused));
        assert_eq!(state.latest().unwrap().status, SandboxStatus::Paused);
        assert_eq!(state.readiness().unwrap(), Poll::Pending);
    }

    #[test]
    fn test_readiness_reports_failure_details() {
        let mut state = SessionState::new(SandboxId::new("box-1").unwrap());
        let mut failed = sandbox(SandboxStatus::Error);
        failed.details = Some("image pull failed".into());
        state.observe(failed);
        match state.readiness() {
            Err(Error::SandboxFailed { status, details, .. }) => {
                assert_eq!(status, SandboxStatus::Error);
                assert_eq!(details.as_deref(), Some("image pull failed"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_released_state_is_closed() {
        let mut state = SessionState::new(SandboxId::new("box-1").unwrap());
        assert!(state.ensure_open().is_ok());
        state.mark_destroyed();
        assert!(matches!(state.ensure_open(), Err(Error::Closed(_))));
        assert_eq!(state.phase(), Phase::Destroyed);
    }

    #[test]
    fn test_stream_accumulates_and_stops_at_end() {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = lines.clone();
        let mut options =
            CommandOptions::new().on_stdout(move |l| sink.lock().unwrap().push(l.to_string()));
        let mut cmd = StreamedCommand::new("ls");

        let events = [
            event("start", r#"{"command_id":"c9"}"#),
            event("output", r#"{"stdout":"a\nb\n"}"#),
            event("output", "not json"),
            event("output", r#"{"stderr":"warn\n"}"#),
            event("status", r#"{"status":"done","exit_code":0}"#),
        ];
        for e in &events {
            assert_eq!(cmd.apply(e, &mut options).unwrap(), StreamControl::Continue);
        }
        let end = cmd.apply(&event("end", r#"{"status":"success"}"#), &mut options).unwrap();
        assert_eq!(end, StreamControl::Stop);

        let result = cmd.into_result();
        assert_eq!(result.id, "c9");
        assert_eq!(result.stdout, "a\nb\n");
        assert_eq!(result.stderr, "warn\n");
        assert_eq!(result.status, CommandStatus::Done);
        assert!(result.success());
        assert_eq!(*lines.lock().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_stream_error_and_timeout_events() {
        let mut options = CommandOptions::new();
        let mut cmd = StreamedCommand::new("sleep 99");
        let err = cmd
            .apply(&event("end", r#"{"status":"timeout"}"#), &mut options)
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));

        let err = cmd.apply(&event("error", r#"{"error":"boom"}"#), &mut options).unwrap_err();
        assert!(matches!(err, Error::Command(msg) if msg == "boom"));

        let mut cmd = StreamedCommand::new("x");
        cmd.apply(&event("end", r#"{"status":"error"}"#), &mut options).unwrap();
        assert_eq!(cmd.into_result().status, CommandStatus::Error);
    }

    #[test]
    fn test_stream_exit_code_follows_status() {
        let mut options = CommandOptions::new();

        let mut failed = StreamedCommand::new("false");
        failed.apply(&event("status", r#"{"status":"failed"}"#), &mut options).unwrap();
        failed.apply(&event("end", r#"{"status":"success"}"#), &mut options).unwrap();
        let result = failed.into_result();
        assert_eq!(result.status, CommandStatus::Failed);
        assert_eq!(result.exit_code, Some(1));
        assert!(!result.success());

        let mut ended = StreamedCommand::new("true");
        ended.apply(&event("end", r#"{"status":"success"}"#), &mut options).unwrap();
        let result = ended.into_result();
        assert_eq!(result.status, CommandStatus::Done);
        assert_eq!(result.exit_code, Some(0));

        let cut_off = StreamedCommand::new("yes").into_result();
        assert_eq!(cut_off.status, CommandStatus::Queued);
        assert_eq!(cut_off.exit_code, None);
    }

    #[test]
    fn test_output_cursor_delivers_suffix_only() {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = lines.clone();
        let mut options =
            CommandOptions::new().on_stdout(move |l| sink.lock().unwrap().push(l.to_string()));
        let mut cursor = OutputCursor::default();

        cursor.deliver(Some("one\n"), None, &mut options);
        cursor.deliver(Some("one\n"), None, &mut options);
        cursor.deliver(Some("one\ntwo\n"), None, &mut options);
        assert_eq!(*lines.lock().unwrap(), vec!["one", "two"]);
    }
}
