//! # tavor
//!
//! Client SDK for Tavor cloud sandboxes: create a remote execution
//! environment, wait for it to boot, run shell commands in it and tear it
//! down again.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                        tavor (SDK)                       │
//! ├──────────────────────────────────────────────────────────┤
//! │                                                          │
//! │  ┌─────────────────┐     ┌──────────────────────────┐   │
//! │  │ Client /        │────▶│  SandboxHandle /         │   │
//! │  │ AsyncClient     │     │  AsyncSandboxHandle      │   │
//! │  │ - create()      │     │  - wait_until_ready()    │   │
//! │  │ - attach()      │     │  - run()                 │   │
//! │  │ - list()        │     │  - destroy()             │   │
//! │  └─────────────────┘     └──────────────────────────┘   │
//! │           │                          │                   │
//! │           ▼                          ▼                   │
//! │  ┌─────────────────┐     ┌──────────────────────────┐   │
//! │  │ Transport       │     │  Poller                  │   │
//! │  │ (ureq/reqwest)  │     │  deadline + backoff +    │   │
//! │  │ + retry         │     │  cancellation            │   │
//! │  └─────────────────┘     └──────────────────────────┘   │
//! │           │                                              │
//! └───────────┼──────────────────────────────────────────────┘
//!             │ HTTPS, X-API-Key
//!             ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │                  sandbox service /api/v2                 │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use tavor::{Client, CommandOptions, SandboxConfig};
//!
//! # fn example() -> tavor::Result<()> {
//! let client = Client::from_env()?;
//! let config = SandboxConfig::builder().cpu(2).mib_ram(2048).build()?;
//!
//! let result = client.with_sandbox(&config, |sandbox| {
//!     sandbox.wait_until_ready()?;
//!     sandbox.run("echo hello", CommandOptions::new())
//! })?;
//! println!("{}", result.stdout);
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - `blocking` (default): [`Client`] over a `ureq` transport
//! - `async`: [`AsyncClient`] over a `reqwest` transport, cancellable with
//!   `tokio_util::sync::CancellationToken`

pub mod api;
mod client;
pub mod config;
mod error;
pub mod models;
pub mod poller;
mod session;
pub mod sse;
pub mod transport;

#[cfg(feature = "async")]
mod async_client;

#[cfg(feature = "async")]
pub use async_client::{AsyncClient, AsyncSandboxHandle};
pub use client::{Client, SandboxHandle};
pub use config::{
    Backoff, ClientConfig, ClientConfigBuilder, PollConfig, RetryPolicy, SandboxConfig,
    SandboxConfigBuilder,
};
pub use error::{Error, Result};
pub use models::{
    CommandOptions, CommandResult, CommandStatus, ExposedPort, Phase, Sandbox, SandboxId,
    SandboxStatus,
};
pub use poller::CancelToken;
#[cfg(feature = "async")]
pub use tokio_util::sync::CancellationToken;
