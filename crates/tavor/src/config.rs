//! Client and sandbox configuration.
//!
//! Configuration can be built explicitly or loaded from the environment.
//!
//! | Variable | Default |
//! |----------|---------|
//! | `TAVOR_API_KEY` | required |
//! | `TAVOR_BASE_URL` | `https://api.tavor.dev` |
//! | `TAVOR_BOX_CPU` | unset (service default) |
//! | `TAVOR_BOX_MIB_RAM` | unset (service default) |
//! | `TAVOR_BOX_TIMEOUT` | `600` |

use crate::error::{Error, Result};
use std::fmt;
use std::time::Duration;

/// Default service endpoint.
pub const DEFAULT_BASE_URL: &str = "https://api.tavor.dev";

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default sandbox lifetime in seconds.
pub const DEFAULT_SANDBOX_TIMEOUT_SECS: u64 = 600;

/// Shortest sleep between status polls. Zero intervals are raised to this.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Exponential backoff schedule, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    /// Delay before the second attempt.
    pub initial: Duration,
    /// Upper bound for any delay.
    pub max: Duration,
    /// Growth factor per attempt (1.0 = constant interval).
    pub multiplier: f64,
}

impl Backoff {
    /// Exponential backoff doubling from `initial` up to `max`.
    pub fn exponential(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            multiplier: 2.0,
        }
    }

    /// Constant interval.
    pub fn constant(interval: Duration) -> Self {
        Self {
            initial: interval,
            max: interval,
            multiplier: 1.0,
        }
    }

    /// Delay after the given zero-based attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(64) as i32);
        let secs = self.initial.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

/// Retry policy for idempotent requests.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt (0 disables retrying).
    pub max_retries: u32,
    /// Delay schedule between attempts.
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff: Backoff::exponential(Duration::from_millis(200), Duration::from_secs(2)),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }
}

/// Polling schedule for lifecycle waits.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollConfig {
    /// Give up after this long (`None` waits forever).
    pub timeout: Option<Duration>,
    /// Delay schedule between status polls.
    pub backoff: Backoff,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            timeout: Some(Duration::from_secs(300)),
            backoff: Backoff::exponential(Duration::from_millis(500), Duration::from_secs(5)),
        }
    }
}

impl PollConfig {
    /// Same schedule with a different deadline.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Transport configuration, immutable once a client is built.
#[derive(Clone)]
pub struct ClientConfig {
    /// API key sent as `X-API-Key`.
    pub api_key: String,
    /// Base URL of the service, without trailing slash.
    pub base_url: String,
    /// Timeout for individual HTTP requests.
    pub request_timeout: Duration,
    /// Retry policy for idempotent requests.
    pub retry: RetryPolicy,
    /// Default schedule for `wait_until_ready`.
    pub poll: PollConfig,
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("api_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("request_timeout", &self.request_timeout)
            .field("retry", &self.retry)
            .field("poll", &self.poll)
            .finish()
    }
}

impl ClientConfig {
    /// Create a new config builder.
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    /// Load configuration from `TAVOR_API_KEY` and `TAVOR_BASE_URL`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut builder = Self::builder();
        if let Some(key) = get("TAVOR_API_KEY") {
            builder = builder.api_key(key);
        }
        if let Some(url) = get("TAVOR_BASE_URL") {
            builder = builder.base_url(url);
        }
        builder.build()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.api_key.trim().is_empty() {
            return Err(Error::Validation(
                "API key is required; set TAVOR_API_KEY or pass api_key".into(),
            ));
        }
        let url = url::Url::parse(&self.base_url)
            .map_err(|e| Error::Validation(format!("invalid base URL {}: {e}", self.base_url)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::Validation(format!(
                "base URL must be http or https: {}",
                self.base_url
            )));
        }
        if self.request_timeout.is_zero() {
            return Err(Error::Validation("request_timeout must be > 0".into()));
        }
        Ok(())
    }

    /// Absolute URL for an API path.
    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

/// Builder for [`ClientConfig`].
#[derive(Debug)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl Default for ClientConfigBuilder {
    fn default() -> Self {
        Self {
            config: ClientConfig {
                api_key: String::new(),
                base_url: DEFAULT_BASE_URL.to_string(),
                request_timeout: DEFAULT_REQUEST_TIMEOUT,
                retry: RetryPolicy::default(),
                poll: PollConfig::default(),
            },
        }
    }
}

impl ClientConfigBuilder {
    /// Set the API key.
    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.config.api_key = key.into();
        self
    }

    /// Set the base URL (a trailing slash is removed).
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.config.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    /// Set the per-request timeout.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Set the retry policy.
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.config.retry = retry;
        self
    }

    /// Set the default readiness polling schedule.
    pub fn poll(mut self, poll: PollConfig) -> Self {
        self.config.poll = poll;
        self
    }

    /// Build the configuration, validating all fields.
    pub fn build(self) -> Result<ClientConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Specification of a sandbox to create.
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxConfig {
    /// vCPU count (service default when unset).
    pub cpu: Option<u32>,
    /// Memory in MiB (service default when unset).
    pub mib_ram: Option<u32>,
    /// Lifetime in seconds (default: 600).
    pub timeout: Option<u64>,
    /// Free-form metadata.
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            cpu: None,
            mib_ram: None,
            timeout: Some(DEFAULT_SANDBOX_TIMEOUT_SECS),
            metadata: None,
        }
    }
}

impl SandboxConfig {
    /// Create a new config builder.
    pub fn builder() -> SandboxConfigBuilder {
        SandboxConfigBuilder::default()
    }

    /// Defaults overridden by `TAVOR_BOX_CPU`, `TAVOR_BOX_MIB_RAM` and
    /// `TAVOR_BOX_TIMEOUT`. Unparsable values are ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let default = Self::default();
        Self {
            cpu: get("TAVOR_BOX_CPU")
                .and_then(|v| v.trim().parse().ok())
                .or(default.cpu),
            mib_ram: get("TAVOR_BOX_MIB_RAM")
                .and_then(|v| v.trim().parse().ok())
                .or(default.mib_ram),
            timeout: get("TAVOR_BOX_TIMEOUT")
                .and_then(|v| v.trim().parse().ok())
                .or(default.timeout),
            metadata: None,
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.cpu == Some(0) {
            return Err(Error::Validation("cpu must be > 0".into()));
        }
        if self.mib_ram == Some(0) {
            return Err(Error::Validation("mib_ram must be > 0".into()));
        }
        if self.timeout == Some(0) {
            return Err(Error::Validation("timeout must be > 0".into()));
        }
        if let Some(metadata) = &self.metadata {
            if metadata.keys().any(|k| k.trim().is_empty()) {
                return Err(Error::Validation("metadata keys must not be empty".into()));
            }
        }
        Ok(())
    }
}

/// Builder for [`SandboxConfig`].
#[derive(Debug, Default)]
pub struct SandboxConfigBuilder {
    config: SandboxConfig,
}

impl SandboxConfigBuilder {
    /// Set the vCPU count.
    pub fn cpu(mut self, cpu: u32) -> Self {
        self.config.cpu = Some(cpu);
        self
    }

    /// Set memory in MiB.
    pub fn mib_ram(mut self, mib: u32) -> Self {
        self.config.mib_ram = Some(mib);
        self
    }

    /// Set the sandbox lifetime in seconds.
    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.config.timeout = Some(secs);
        self
    }

    /// Add one metadata entry.
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.config
            .metadata
            .get_or_insert_with(serde_json::Map::new)
            .insert(key.into(), value.into());
        self
    }

    /// Build the configuration, validating all fields.
    pub fn build(self) -> Result<SandboxConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
