//! Blocking client and sandbox handle.
//!
//! Every call runs on the calling thread. The default transport is
//! [`UreqTransport`](crate::transport::UreqTransport); tests and embedders
//! can supply their own through [`Client::with_transport`].

use crate::api::{
    self, CommandRecord, CreateBoxRequest, CreateBoxResponse, DataEnvelope, ExposePortRequest,
    ListEnvelope, QueueCommandRequest, QueuedCommand,
};
use crate::config::{Backoff, ClientConfig, PollConfig, SandboxConfig};
use crate::error::{Error, Result};
use crate::models::{
    CommandOptions, CommandResult, ExposedPort, Phase, Sandbox, SandboxId, SandboxStatus,
};
use crate::poller::{poll_until, CancelToken, Poll};
use crate::session::{SessionState, StreamedCommand};
use crate::sse::SseDecoder;
use crate::transport::{send_with_retry, Request, Response, StreamControl, Transport};
use std::sync::Arc;
use std::time::Instant;

/// Blocking entry point to the sandbox service.
///
/// Cloning is cheap; clones share the transport and configuration.
#[derive(Clone)]
pub struct Client {
    config: Arc<ClientConfig>,
    transport: Arc<dyn Transport>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").field("config", &self.config).finish_non_exhaustive()
    }
}

impl Client {
    /// Create a client using the `ureq` transport.
    #[cfg(feature = "blocking")]
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let transport = crate::transport::UreqTransport::new(&config);
        Self::with_transport(config, Arc::new(transport))
    }

    /// Create a client from `TAVOR_*` environment variables.
    #[cfg(feature = "blocking")]
    pub fn from_env() -> Result<Self> {
        Self::new(ClientConfig::from_env()?)
    }

    /// Create a client over a caller-supplied transport.
    pub fn with_transport(config: ClientConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            transport,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn send(&self, request: &Request) -> Result<Response> {
        send_with_retry(self.transport.as_ref(), request, &self.config.retry)
    }

    /// Request a new sandbox. The handle is returned as soon as the service
    /// accepts the request; call [`SandboxHandle::wait_until_ready`] before
    /// relying on it.
    pub fn create_sandbox(&self, config: &SandboxConfig) -> Result<SandboxHandle> {
        config.validate()?;
        let start = Instant::now();
        tracing::info!(
            cpu = ?config.cpu,
            mib_ram = ?config.mib_ram,
            timeout_secs = ?config.timeout,
            "Creating sandbox"
        );

        let body = serde_json::to_value(CreateBoxRequest::from(config))?;
        let created: CreateBoxResponse = self
            .send(&Request::post(api::BOXES_PATH, Some(body)))?
            .json()?;

        tracing::info!(
            sandbox_id = %created.id,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Sandbox created"
        );
        Ok(SandboxHandle::new(self.clone(), created.id))
    }

    /// Create a sandbox, run `f` with it and destroy it afterwards, whether
    /// or not `f` succeeded.
    pub fn with_sandbox<R>(
        &self,
        config: &SandboxConfig,
        f: impl FnOnce(&mut SandboxHandle) -> Result<R>,
    ) -> Result<R> {
        let mut handle = self.create_sandbox(config)?;
        let outcome = f(&mut handle);
        let teardown = handle.destroy();
        match (outcome, teardown) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(teardown)) => {
                tracing::warn!(
                    sandbox_id = %handle.id(),
                    error = %teardown,
                    "Sandbox teardown failed after error"
                );
                Err(e)
            }
        }
    }

    /// Take ownership of an existing sandbox. Dropping the handle destroys it.
    pub fn attach(&self, id: &str) -> Result<SandboxHandle> {
        Ok(SandboxHandle::new(self.clone(), SandboxId::new(id)?))
    }

    /// List sandboxes visible to the API key.
    pub fn list_sandboxes(&self) -> Result<Vec<Sandbox>> {
        let list: ListEnvelope<Sandbox> = self.send(&Request::get(api::BOXES_PATH))?.json()?;
        tracing::debug!(count = list.data.len(), "Listed sandboxes");
        Ok(list.data)
    }
}

/// Owner of one remote sandbox.
///
/// The sandbox is destroyed exactly once: by [`destroy`](Self::destroy),
/// by [`Client::with_sandbox`], or when the handle is dropped. Use
/// [`detach`](Self::detach) to keep it running instead.
#[derive(Debug)]
pub struct SandboxHandle {
    client: Client,
    state: SessionState,
}

impl SandboxHandle {
    fn new(client: Client, id: SandboxId) -> Self {
        Self {
            client,
            state: SessionState::new(id),
        }
    }

    pub fn id(&self) -> &SandboxId {
        self.state.id()
    }

    /// Last description received from the service.
    pub fn sandbox(&self) -> Option<&Sandbox> {
        self.state.latest()
    }

    pub fn phase(&self) -> Phase {
        self.state.phase()
    }

    /// True after a successful destroy or detach.
    pub fn is_released(&self) -> bool {
        self.state.is_released()
    }

    /// Fetch the current description from the service.
    pub fn refresh(&mut self) -> Result<&Sandbox> {
        self.state.ensure_open()?;
        let envelope: DataEnvelope<Sandbox> = self
            .client
            .send(&Request::get(api::box_path(self.state.id())))?
            .json()?;
        self.state.observe(envelope.data);
        self.state
            .latest()
            .ok_or_else(|| Error::Closed(self.state.id().to_string()))
    }

    /// Refresh and return the current status.
    pub fn status(&mut self) -> Result<SandboxStatus> {
        Ok(self.refresh()?.status)
    }

    /// Wait for `running` using the client's default polling settings.
    pub fn wait_until_ready(&mut self) -> Result<()> {
        let poll = self.client.config.poll;
        self.wait_until_ready_with(&poll, None)
    }

    /// Wait for `running`, failing with [`Error::SandboxFailed`] if the
    /// sandbox reaches a terminal status, [`Error::Timeout`] at the deadline
    /// and [`Error::Cancelled`] if `cancel` fires.
    pub fn wait_until_ready_with(
        &mut self,
        poll: &PollConfig,
        cancel: Option<&CancelToken>,
    ) -> Result<()> {
        self.state.ensure_open()?;
        let start = Instant::now();
        let id = self.state.id().clone();

        let outcome = poll_until(poll, cancel, "sandbox readiness", |attempt| {
            let status = self.refresh()?.status;
            tracing::debug!(sandbox_id = %id, attempt, status = %status, "Polled sandbox status");
            self.state.readiness()
        });

        match &outcome {
            Ok(()) => tracing::info!(
                sandbox_id = %id,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Sandbox ready"
            ),
            Err(e) => tracing::warn!(sandbox_id = %id, error = %e, "Sandbox did not become ready"),
        }
        outcome
    }

    /// Run a shell command and wait for it to finish.
    ///
    /// With output callbacks set the command is streamed and callbacks see
    /// lines as they are produced; otherwise the command is queued and its
    /// status polled every `options.poll_interval`.
    pub fn run(&mut self, command: &str, options: CommandOptions) -> Result<CommandResult> {
        self.run_with(command, options, None)
    }

    /// [`run`](Self::run) that fails with [`Error::Cancelled`] once `cancel`
    /// fires. A streamed command notices cancellation when the next chunk
    /// arrives.
    pub fn run_with(
        &mut self,
        command: &str,
        mut options: CommandOptions,
        cancel: Option<&CancelToken>,
    ) -> Result<CommandResult> {
        let poll = self.client.config.poll;
        self.wait_until_ready_with(&poll, cancel)?;
        let start = Instant::now();
        tracing::debug!(
            sandbox_id = %self.id(),
            command,
            streaming = options.is_streaming(),
            "Running command"
        );

        let result = if options.is_streaming() {
            self.run_streaming(command, &mut options, cancel)?
        } else {
            self.run_polling(command, &options, cancel)?
        };

        tracing::info!(
            sandbox_id = %self.id(),
            command_id = %result.id,
            status = %result.status,
            exit_code = ?result.exit_code,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Command finished"
        );
        Ok(result)
    }

    fn run_polling(
        &mut self,
        command: &str,
        options: &CommandOptions,
        cancel: Option<&CancelToken>,
    ) -> Result<CommandResult> {
        let body = serde_json::to_value(QueueCommandRequest {
            command,
            stream: false,
        })?;
        let queued: QueuedCommand = self
            .client
            .send(&Request::post(api::box_path(self.id()), Some(body)))?
            .json()?;

        let path = api::command_path(self.id(), &queued.id);
        let poll = PollConfig {
            timeout: options.timeout,
            backoff: Backoff::constant(options.poll_interval),
        };
        let client = &self.client;
        poll_until(&poll, cancel, "command", |_| {
            let record: CommandRecord = client.send(&Request::get(path.as_str()))?.json()?;
            Ok(if record.status.is_terminal() {
                Poll::Ready(record.into_result(command))
            } else {
                Poll::Pending
            })
        })
    }

    fn run_streaming(
        &mut self,
        command: &str,
        options: &mut CommandOptions,
        cancel: Option<&CancelToken>,
    ) -> Result<CommandResult> {
        let body = serde_json::to_value(QueueCommandRequest {
            command,
            stream: true,
        })?;
        let request = Request::post(api::box_path(self.id()), Some(body));
        let deadline = options.timeout;
        let start = Instant::now();
        let mut decoder = SseDecoder::new();
        let mut streamed = StreamedCommand::new(command);
        let mut ended = false;

        self.client
            .transport
            .send_streaming(&request, deadline, &mut |chunk| {
                for event in decoder.push(chunk) {
                    if streamed.apply(&event, options)? == StreamControl::Stop {
                        ended = true;
                        return Ok(StreamControl::Stop);
                    }
                }
                if cancel.is_some_and(CancelToken::is_cancelled) {
                    return Err(Error::Cancelled);
                }
                match deadline {
                    Some(limit) if start.elapsed() > limit => Err(Error::Timeout(format!(
                        "command did not finish within {limit:?}"
                    ))),
                    _ => Ok(StreamControl::Continue),
                }
            })?;

        if !ended {
            if let Some(event) = decoder.finish() {
                streamed.apply(&event, options)?;
            } else {
                tracing::debug!(sandbox_id = %self.id(), "Command stream closed without end event");
            }
        }
        Ok(streamed.into_result())
    }

    /// Pause the sandbox, preserving its state.
    pub fn pause(&mut self) -> Result<()> {
        self.state.ensure_open()?;
        self.client.send(&Request::post(api::pause_path(self.id()), None))?;
        tracing::info!(sandbox_id = %self.id(), "Sandbox paused");
        self.refresh().map(|_| ())
    }

    /// Resume a paused sandbox.
    pub fn resume(&mut self) -> Result<()> {
        self.state.ensure_open()?;
        self.client.send(&Request::post(api::resume_path(self.id()), None))?;
        tracing::info!(sandbox_id = %self.id(), "Sandbox resumed");
        self.refresh().map(|_| ())
    }

    /// Expose `port` inside the sandbox on a public proxy port.
    pub fn expose_port(&mut self, port: u16) -> Result<ExposedPort> {
        self.state.ensure_open()?;
        let body = serde_json::to_value(ExposePortRequest { port })?;
        let exposed: DataEnvelope<ExposedPort> = self
            .client
            .send(&Request::post(api::expose_port_path(self.id()), Some(body)))?
            .json()?;
        tracing::info!(
            sandbox_id = %self.id(),
            target_port = exposed.data.target_port,
            proxy_port = exposed.data.proxy_port,
            "Port exposed"
        );
        Ok(exposed.data)
    }

    /// Public URL for `port`, using a freshly fetched hostname.
    pub fn public_url(&mut self, port: u16) -> Result<String> {
        self.refresh()?.public_url(port)
    }

    /// Destroy the sandbox. Repeated calls are no-ops.
    ///
    /// A 404 counts as already destroyed. Any other failure leaves the handle
    /// unreleased so the call can be retried.
    pub fn destroy(&mut self) -> Result<()> {
        if self.state.is_released() {
            tracing::trace!(sandbox_id = %self.id(), "Sandbox already released");
            return Ok(());
        }
        match self.client.send(&Request::delete(api::box_path(self.id()))) {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {
                tracing::debug!(sandbox_id = %self.id(), "Sandbox already gone");
            }
            Err(e) => {
                tracing::error!(sandbox_id = %self.id(), error = %e, "Failed to destroy sandbox");
                return Err(e);
            }
        }
        self.state.mark_destroyed();
        tracing::info!(sandbox_id = %self.id(), "Sandbox destroyed");
        Ok(())
    }

    /// Give up ownership without destroying the sandbox.
    pub fn detach(mut self) -> SandboxId {
        self.state.mark_detached();
        tracing::debug!(sandbox_id = %self.id(), "Sandbox detached");
        self.state.id().clone()
    }
}

impl Drop for SandboxHandle {
    fn drop(&mut self) {
        if self.state.is_released() {
            return;
        }
        if let Err(e) = self.destroy() {
            tracing::warn!(
                sandbox_id = %self.id(),
                error = %e,
                "Best-effort sandbox teardown failed"
            );
        }
    }
}
