//! Async client and sandbox handle for tokio applications.
//!
//! Mirrors [`crate::client`] operation for operation. Waits suspend the task
//! instead of the thread, and can be cancelled with a
//! [`CancellationToken`].

use crate::api::{
    self, CommandRecord, CreateBoxRequest, CreateBoxResponse, DataEnvelope, ExposePortRequest,
    ListEnvelope, QueueCommandRequest, QueuedCommand,
};
use crate::config::{Backoff, ClientConfig, PollConfig, SandboxConfig};
use crate::error::{Error, Result};
use crate::models::{
    CommandOptions, CommandResult, ExposedPort, Phase, Sandbox, SandboxId, SandboxStatus,
};
use crate::poller::{AsyncPoller, Poll};
use crate::session::{OutputCursor, SessionState};
use crate::transport::{
    send_with_retry_async, AsyncTransport, ReqwestTransport, Request, Response,
};
use futures::future::BoxFuture;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Async entry point to the sandbox service.
#[derive(Clone)]
pub struct AsyncClient {
    config: Arc<ClientConfig>,
    transport: Arc<dyn AsyncTransport>,
}

impl std::fmt::Debug for AsyncClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncClient").field("config", &self.config).finish_non_exhaustive()
    }
}

impl AsyncClient {
    /// Create a client using the `reqwest` transport.
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let transport = ReqwestTransport::new(&config)?;
        Self::with_transport(config, Arc::new(transport))
    }

    /// Create a client from `TAVOR_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::new(ClientConfig::from_env()?)
    }

    pub fn with_transport(
        config: ClientConfig,
        transport: Arc<dyn AsyncTransport>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            transport,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    async fn send(&self, request: &Request) -> Result<Response> {
        send_with_retry_async(self.transport.as_ref(), request, &self.config.retry).await
    }

    /// Teardown request shared by `destroy` and drop. 404 counts as gone.
    async fn delete_box(&self, id: &SandboxId) -> Result<()> {
        match self.send(&Request::delete(api::box_path(id))).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => {
                tracing::debug!(sandbox_id = %id, "Sandbox already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Request a new sandbox.
    pub async fn create_sandbox(&self, config: &SandboxConfig) -> Result<AsyncSandboxHandle> {
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
            .send(&Request::post(api::BOXES_PATH, Some(body)))
            .await?
            .json()?;

        tracing::info!(
            sandbox_id = %created.id,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Sandbox created"
        );
        Ok(AsyncSandboxHandle::new(self.clone(), created.id))
    }

    /// Create a sandbox, run `f` with it and destroy it afterwards.
    ///
    /// ```no_run
    /// # async fn demo(client: tavor::AsyncClient) -> tavor::Result<()> {
    /// let out = client
    ///     .with_sandbox(&Default::default(), |sandbox| {
    ///         Box::pin(async move { sandbox.run("uname -a", Default::default()).await })
    ///     })
    ///     .await?;
    /// println!("{}", out.stdout);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn with_sandbox<R, F>(&self, config: &SandboxConfig, f: F) -> Result<R>
    where
        F: for<'a> FnOnce(&'a mut AsyncSandboxHandle) -> BoxFuture<'a, Result<R>>,
    {
        let mut handle = self.create_sandbox(config).await?;
        let outcome = f(&mut handle).await;
        let teardown = handle.destroy().await;
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

    /// Take ownership of an existing sandbox.
    pub fn attach(&self, id: &str) -> Result<AsyncSandboxHandle> {
        Ok(AsyncSandboxHandle::new(self.clone(), SandboxId::new(id)?))
    }

    /// List sandboxes visible to the API key.
    pub async fn list_sandboxes(&self) -> Result<Vec<Sandbox>> {
        let list: ListEnvelope<Sandbox> = self.send(&Request::get(api::BOXES_PATH)).await?.json()?;
        tracing::debug!(count = list.data.len(), "Listed sandboxes");
        Ok(list.data)
    }
}

/// Async owner of one remote sandbox.
///
/// Dropping an unreleased handle spawns its teardown on the current tokio
/// runtime. Prefer an explicit [`destroy`](Self::destroy) so failures are
/// visible.
#[derive(Debug)]
pub struct AsyncSandboxHandle {
    client: AsyncClient,
    state: SessionState,
}

impl AsyncSandboxHandle {
    fn new(client: AsyncClient, id: SandboxId) -> Self {
        Self {
            client,
            state: SessionState::new(id),
        }
    }

    pub fn id(&self) -> &SandboxId {
        self.state.id()
    }

    pub fn sandbox(&self) -> Option<&Sandbox> {
        self.state.latest()
    }

    pub fn phase(&self) -> Phase {
        self.state.phase()
    }

    pub fn is_released(&self) -> bool {
        self.state.is_released()
    }

    pub async fn refresh(&mut self) -> Result<&Sandbox> {
        self.state.ensure_open()?;
        let envelope: DataEnvelope<Sandbox> = self
            .client
            .send(&Request::get(api::box_path(self.state.id())))
            .await?
            .json()?;
        self.state.observe(envelope.data);
        self.state
            .latest()
            .ok_or_else(|| Error::Closed(self.state.id().to_string()))
    }

    pub async fn status(&mut self) -> Result<SandboxStatus> {
        Ok(self.refresh().await?.status)
    }

    /// Wait for `running` using the client's default polling settings.
    pub async fn wait_until_ready(&mut self) -> Result<()> {
        let poll = self.client.config.poll;
        self.wait_until_ready_with(&poll, None).await
    }

    /// Wait for `running` with explicit polling settings and cancellation.
    pub async fn wait_until_ready_with(
        &mut self,
        poll: &PollConfig,
        cancel: Option<&CancellationToken>,
    ) -> Result<()> {
        self.state.ensure_open()?;
        let start = Instant::now();
        let outcome = self.poll_ready(poll, cancel).await;
        match &outcome {
            Ok(()) => tracing::info!(
                sandbox_id = %self.id(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Sandbox ready"
            ),
            Err(e) => tracing::warn!(
                sandbox_id = %self.id(),
                error = %e,
                "Sandbox did not become ready"
            ),
        }
        outcome
    }

    async fn poll_ready(
        &mut self,
        poll: &PollConfig,
        cancel: Option<&CancellationToken>,
    ) -> Result<()> {
        let mut poller = AsyncPoller::new(*poll, cancel, "sandbox readiness");
        loop {
            poller.check()?;
            let status = poller.guard(self.refresh()).await??.status;
            tracing::debug!(
                sandbox_id = %self.id(),
                attempt = poller.attempt(),
                status = %status,
                "Polled sandbox status"
            );
            if let Poll::Ready(()) = self.state.readiness()? {
                return Ok(());
            }
            poller.wait().await?;
        }
    }

    /// Run a shell command and wait for it to finish.
    ///
    /// Output callbacks receive the lines added since the previous status
    /// poll.
    pub async fn run(&mut self, command: &str, options: CommandOptions) -> Result<CommandResult> {
        self.run_with(command, options, None).await
    }

    /// [`run`](Self::run) that stops waiting with [`Error::Cancelled`] once
    /// `cancel` fires. The command itself keeps running remotely until the
    /// sandbox is destroyed.
    pub async fn run_with(
        &mut self,
        command: &str,
        mut options: CommandOptions,
        cancel: Option<&CancellationToken>,
    ) -> Result<CommandResult> {
        let ready = self.client.config.poll;
        self.wait_until_ready_with(&ready, cancel).await?;
        let start = Instant::now();
        tracing::debug!(
            sandbox_id = %self.id(),
            command,
            streaming = options.is_streaming(),
            "Running command"
        );

        let body = serde_json::to_value(QueueCommandRequest {
            command,
            stream: false,
        })?;
        let queued: QueuedCommand = self
            .client
            .send(&Request::post(api::box_path(self.id()), Some(body)))
            .await?
            .json()?;

        let path = api::command_path(self.id(), &queued.id);
        let poll = PollConfig {
            timeout: options.timeout,
            backoff: Backoff::constant(options.poll_interval),
        };
        let mut poller = AsyncPoller::new(poll, cancel, "command");
        let mut cursor = OutputCursor::default();
        let result = loop {
            poller.check()?;
            let record: CommandRecord = poller
                .guard(self.client.send(&Request::get(path.as_str())))
                .await??
                .json()?;
            cursor.deliver(record.stdout.as_deref(), record.stderr.as_deref(), &mut options);
            if record.status.is_terminal() {
                break record.into_result(command);
            }
            poller.wait().await?;
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

    pub async fn pause(&mut self) -> Result<()> {
        self.state.ensure_open()?;
        self.client
            .send(&Request::post(api::pause_path(self.id()), None))
            .await?;
        tracing::info!(sandbox_id = %self.id(), "Sandbox paused");
        self.refresh().await.map(|_| ())
    }

    pub async fn resume(&mut self) -> Result<()> {
        self.state.ensure_open()?;
        self.client
            .send(&Request::post(api::resume_path(self.id()), None))
            .await?;
        tracing::info!(sandbox_id = %self.id(), "Sandbox resumed");
        self.refresh().await.map(|_| ())
    }

    pub async fn expose_port(&mut self, port: u16) -> Result<ExposedPort> {
        self.state.ensure_open()?;
        let body = serde_json::to_value(ExposePortRequest { port })?;
        let exposed: DataEnvelope<ExposedPort> = self
            .client
            .send(&Request::post(api::expose_port_path(self.id()), Some(body)))
            .await?
            .json()?;
        tracing::info!(
            sandbox_id = %self.id(),
            target_port = exposed.data.target_port,
            proxy_port = exposed.data.proxy_port,
            "Port exposed"
        );
        Ok(exposed.data)
    }

    pub async fn public_url(&mut self, port: u16) -> Result<String> {
        self.refresh().await?.public_url(port)
    }

    /// Destroy the sandbox. Repeated calls are no-ops; a failed call leaves
    /// the handle unreleased.
    pub async fn destroy(&mut self) -> Result<()> {
        if self.state.is_released() {
            tracing::trace!(sandbox_id = %self.id(), "Sandbox already released");
            return Ok(());
        }
        if let Err(e) = self.client.delete_box(self.state.id()).await {
            tracing::error!(sandbox_id = %self.id(), error = %e, "Failed to destroy sandbox");
            return Err(e);
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

impl Drop for AsyncSandboxHandle {
    fn drop(&mut self) {
        if self.state.is_released() {
            return;
        }
        let id = self.state.id().clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let client = self.client.clone();
                runtime.spawn(async move {
                    match client.delete_box(&id).await {
                        Ok(()) => tracing::info!(sandbox_id = %id, "Sandbox destroyed on drop"),
                        Err(e) => tracing::warn!(
                            sandbox_id = %id,
                            error = %e,
                            "Best-effort sandbox teardown failed"
                        ),
                    }
                });
            }
            Err(_) => {
                tracing::warn!(
                    sandbox_id = %id,
                    "Handle dropped outside a tokio runtime; sandbox not destroyed"
                );
            }
        }
        self.state.mark_destroyed();
    }
}
