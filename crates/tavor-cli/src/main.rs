//! `tavor` command-line client.
//!
//! Credentials come from `TAVOR_API_KEY` / `TAVOR_BASE_URL` (or the matching
//! flags). Logs go to stderr; command output and JSON go to stdout.
//! Ctrl-C cancels a pending readiness wait or a running command; sandboxes
//! created by the invocation are destroyed before exiting.

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use std::process::ExitCode;
use std::time::Duration;
use tavor::{
    AsyncClient, AsyncSandboxHandle, ClientConfig, CommandOptions, PollConfig, Sandbox,
    SandboxConfig,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "tavor", version, about = "Manage Tavor cloud sandboxes")]
struct Cli {
    /// API key
    #[arg(long, env = "TAVOR_API_KEY", hide_env_values = true)]
    api_key: String,

    /// Service base URL
    #[arg(long, env = "TAVOR_BASE_URL", default_value = tavor::config::DEFAULT_BASE_URL)]
    base_url: String,

    /// Seconds to wait for a sandbox to become ready
    #[arg(long, default_value_t = 300, global = true)]
    wait_timeout: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List sandboxes
    List,
    /// Create a sandbox and print it
    Create {
        #[command(flatten)]
        spec: SpecArgs,
        /// Return as soon as the service accepts the request
        #[arg(long)]
        no_wait: bool,
    },
    /// Run a command (in a fresh sandbox unless --id is given)
    Run {
        #[arg(value_name = "COMMAND")]
        command: String,
        /// Existing sandbox to run in
        #[arg(long)]
        id: Option<String>,
        #[command(flatten)]
        spec: SpecArgs,
    },
    /// Destroy a sandbox
    Destroy { id: String },
    /// Pause a sandbox
    Pause { id: String },
    /// Resume a paused sandbox
    Resume { id: String },
    /// Expose a port of a sandbox publicly
    Expose { id: String, port: u16 },
}

#[derive(Args, Debug, Default)]
struct SpecArgs {
    /// vCPUs
    #[arg(long)]
    cpu: Option<u32>,
    /// Memory in MiB
    #[arg(long)]
    mib_ram: Option<u32>,
    /// Sandbox lifetime in seconds
    #[arg(long)]
    timeout: Option<u64>,
    /// Metadata entry, repeatable
    #[arg(long = "metadata", value_name = "KEY=VALUE", value_parser = parse_key_val)]
    metadata: Vec<(String, String)>,
}

impl SpecArgs {
    /// Flags override `TAVOR_BOX_*` defaults.
    fn into_config(self) -> anyhow::Result<SandboxConfig> {
        let mut config = SandboxConfig::from_env();
        if self.cpu.is_some() {
            config.cpu = self.cpu;
        }
        if self.mib_ram.is_some() {
            config.mib_ram = self.mib_ram;
        }
        if self.timeout.is_some() {
            config.timeout = self.timeout;
        }
        for (key, value) in self.metadata {
            config
                .metadata
                .get_or_insert_with(Default::default)
                .insert(key, serde_json::Value::String(value));
        }
        config.validate()?;
        Ok(config)
    }
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got `{s}`"))
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("tavor=info".parse()?))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = ClientConfig::builder()
        .api_key(cli.api_key)
        .base_url(cli.base_url)
        .build()?;
    tracing::debug!(?config, "Configuration loaded");
    let client = AsyncClient::new(config)?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling");
            on_signal.cancel();
        }
    });

    let poll = PollConfig::default().with_timeout(Some(Duration::from_secs(cli.wait_timeout)));

    match cli.command {
        Command::List => {
            let sandboxes = client.list_sandboxes().await?;
            println!("{}", serde_json::to_string_pretty(&sandboxes)?);
        }
        Command::Create { spec, no_wait } => {
            let sandbox = create(&client, &spec.into_config()?, no_wait, &poll, &cancel).await?;
            println!("{}", serde_json::to_string_pretty(&sandbox)?);
        }
        Command::Run { command, id, spec } => {
            let code = run(&client, id.as_deref(), spec, &command, &poll, &cancel).await?;
            return Ok(ExitCode::from(u8::try_from(code).unwrap_or(1)));
        }
        Command::Destroy { id } => {
            client.attach(&id)?.destroy().await?;
            println!("destroyed {id}");
        }
        Command::Pause { id } => {
            let mut sandbox = client.attach(&id)?;
            let outcome = sandbox.pause().await;
            sandbox.detach();
            outcome?;
            println!("paused {id}");
        }
        Command::Resume { id } => {
            let mut sandbox = client.attach(&id)?;
            let outcome = sandbox.resume().await;
            sandbox.detach();
            outcome?;
            println!("resumed {id}");
        }
        Command::Expose { id, port } => {
            let mut sandbox = client.attach(&id)?;
            let outcome = sandbox.expose_port(port).await;
            sandbox.detach();
            println!("{}", serde_json::to_string_pretty(&outcome?)?);
        }
    }
    Ok(ExitCode::SUCCESS)
}

/// Create a sandbox and hand it over to the caller (detached).
///
/// Any failure after the create request destroys the sandbox before
/// returning.
async fn create(
    client: &AsyncClient,
    config: &SandboxConfig,
    no_wait: bool,
    poll: &PollConfig,
    cancel: &CancellationToken,
) -> anyhow::Result<Option<Sandbox>> {
    let mut sandbox = client.create_sandbox(config).await?;
    let settled = if no_wait {
        sandbox.refresh().await.map(|_| ())
    } else {
        sandbox.wait_until_ready_with(poll, Some(cancel)).await
    };
    if let Err(e) = settled {
        teardown(&mut sandbox).await;
        return Err(e).with_context(|| format!("sandbox {} not ready", sandbox.id()));
    }
    let described = sandbox.sandbox().cloned();
    sandbox.detach();
    Ok(described)
}

/// Run `command` in sandbox `id`, or in a fresh sandbox that is destroyed
/// afterwards. Returns the command's exit code.
async fn run(
    client: &AsyncClient,
    id: Option<&str>,
    spec: SpecArgs,
    command: &str,
    poll: &PollConfig,
    cancel: &CancellationToken,
) -> anyhow::Result<i32> {
    let mut sandbox = match id {
        Some(id) => client.attach(id)?,
        None => client.create_sandbox(&spec.into_config()?).await?,
    };
    let outcome = run_command(&mut sandbox, command, poll, cancel).await;
    if id.is_some() {
        sandbox.detach();
        return outcome;
    }
    match (outcome, sandbox.destroy().await) {
        (Ok(code), Ok(())) => Ok(code),
        (Ok(_), Err(e)) => Err(e.into()),
        (Err(e), teardown) => {
            if let Err(teardown) = teardown {
                tracing::error!(sandbox_id = %sandbox.id(), error = %teardown, "Cleanup failed");
            }
            Err(e)
        }
    }
}

async fn teardown(sandbox: &mut AsyncSandboxHandle) {
    if let Err(e) = sandbox.destroy().await {
        tracing::error!(sandbox_id = %sandbox.id(), error = %e, "Cleanup failed");
    }
}

/// Wait for the sandbox, run `command` with live output, return its exit code.
async fn run_command(
    sandbox: &mut AsyncSandboxHandle,
    command: &str,
    poll: &PollConfig,
    cancel: &CancellationToken,
) -> anyhow::Result<i32> {
    sandbox
        .wait_until_ready_with(poll, Some(cancel))
        .await
        .with_context(|| format!("sandbox {} not ready", sandbox.id()))?;
    let options = CommandOptions::new()
        .on_stdout(|line| println!("{line}"))
        .on_stderr(|line| eprintln!("{line}"));
    let result = sandbox.run_with(command, options, Some(cancel)).await?;
    Ok(result.exit_code.unwrap_or(1))
}
