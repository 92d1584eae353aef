//! Lifecycle poller: repeat a status check until it reports ready, the
//! deadline passes, or the caller cancels.
//!
//! Each iteration checks cancellation, then the deadline, then polls once, then
//! sleeps for `min(max(backoff(attempt), MIN_POLL_INTERVAL), remaining)`.
//! A zero timeout therefore fails before the first check. Sleeps are
//! interruptible: the blocking flavour waits on a [`CancelToken`] condition
//! variable, the async flavour races a tokio sleep against a
//! `CancellationToken`.

use crate::config::{PollConfig, MIN_POLL_INTERVAL};
use crate::error::{Error, Result};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Outcome of one check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Poll<T> {
    Ready(T),
    Pending,
}

/// Cancellation handle for blocking waits.
///
/// Clones share state; `cancel()` from any thread wakes a sleeping poller
/// immediately.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelState>,
}

#[derive(Debug, Default)]
struct CancelState {
    cancelled: Mutex<bool>,
    wake: Condvar,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation of every wait using this token.
    pub fn cancel(&self) {
        let mut cancelled = self
            .inner
            .cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *cancelled = true;
        self.inner.wake.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self
            .inner
            .cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep for `duration` unless cancelled first. Returns true if cancelled.
    pub fn sleep(&self, duration: Duration) -> bool {
        let guard = self
            .inner
            .cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = self
            .inner
            .wake
            .wait_timeout_while(guard, duration, |cancelled| !*cancelled)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

fn deadline_error(what: &str, timeout: Duration) -> Error {
    Error::Timeout(format!("{what} did not complete within {timeout:?}"))
}

/// Blocking poll loop state.
///
/// Use [`poll_until`] for the common case; drive a `Poller` directly when
/// the check needs to borrow state that a closure cannot hold.
#[derive(Debug)]
pub struct Poller<'a> {
    config: PollConfig,
    cancel: Option<&'a CancelToken>,
    what: &'a str,
    start: Instant,
    attempt: u32,
}

impl<'a> Poller<'a> {
    pub fn new(config: PollConfig, cancel: Option<&'a CancelToken>, what: &'a str) -> Self {
        Self {
            config,
            cancel,
            what,
            start: Instant::now(),
            attempt: 0,
        }
    }

    /// Number of completed waits.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Fail if cancelled or past the deadline.
    pub fn check(&self) -> Result<()> {
        if self.cancel.is_some_and(CancelToken::is_cancelled) {
            return Err(Error::Cancelled);
        }
        if let Some(timeout) = self.config.timeout {
            if self.start.elapsed() >= timeout {
                return Err(deadline_error(self.what, timeout));
            }
        }
        Ok(())
    }

    fn remaining(&self) -> Option<Duration> {
        self.config
            .timeout
            .map(|t| t.saturating_sub(self.start.elapsed()))
    }

    /// Sleep until the next attempt.
    pub fn wait(&mut self) -> Result<()> {
        let mut delay = self.config.backoff.delay(self.attempt).max(MIN_POLL_INTERVAL);
        if let Some(remaining) = self.remaining() {
            delay = delay.min(remaining);
        }
        self.attempt += 1;
        tracing::trace!(
            what = self.what,
            attempt = self.attempt,
            delay_ms = delay.as_millis() as u64,
            "Poll pending"
        );
        match self.cancel {
            Some(cancel) if cancel.sleep(delay) => Err(Error::Cancelled),
            Some(_) => Ok(()),
            None => {
                std::thread::sleep(delay);
                Ok(())
            }
        }
    }
}

/// Poll until [`Poll::Ready`], the deadline, or cancellation.
pub fn poll_until<T>(
    config: &PollConfig,
    cancel: Option<&CancelToken>,
    what: &str,
    mut step: impl FnMut(u32) -> Result<Poll<T>>,
) -> Result<T> {
    let mut poller = Poller::new(*config, cancel, what);
    loop {
        poller.check()?;
        if let Poll::Ready(value) = step(poller.attempt())? {
            return Ok(value);
        }
        poller.wait()?;
    }
}

#[cfg(feature = "async")]
pub use self::nonblocking::{poll_until_async, AsyncPoller};

#[cfg(feature = "async")]
mod nonblocking {
    use super::{deadline_error, Poll};
    use crate::config::{PollConfig, MIN_POLL_INTERVAL};
    use crate::error::{Error, Result};
    use std::future::Future;
    use tokio::time::{Duration, Instant};
    use tokio_util::sync::CancellationToken;

    /// Async poll loop state; see [`Poller`](super::Poller).
    #[derive(Debug)]
    pub struct AsyncPoller<'a> {
        config: PollConfig,
        cancel: Option<&'a CancellationToken>,
        what: &'a str,
        start: Instant,
        attempt: u32,
    }

    impl<'a> AsyncPoller<'a> {
        pub fn new(
            config: PollConfig,
            cancel: Option<&'a CancellationToken>,
            what: &'a str,
        ) -> Self {
            Self {
                config,
                cancel,
                what,
                start: Instant::now(),
                attempt: 0,
            }
        }

        pub fn attempt(&self) -> u32 {
            self.attempt
        }

        /// Fail if cancelled or past the deadline.
        pub fn check(&self) -> Result<()> {
            if self.cancel.is_some_and(CancellationToken::is_cancelled) {
                return Err(Error::Cancelled);
            }
            if let Some(timeout) = self.config.timeout {
                if self.start.elapsed() >= timeout {
                    return Err(deadline_error(self.what, timeout));
                }
            }
            Ok(())
        }

        fn remaining(&self) -> Option<Duration> {
            self.config
                .timeout
                .map(|t| t.saturating_sub(self.start.elapsed()))
        }

        /// Run one check, abandoning it on cancellation or deadline.
        ///
        /// Abandoning drops the in-flight future, which releases any connection
        /// it holds.
        pub async fn guard<F: Future>(&self, step: F) -> Result<F::Output> {
            let bounded = async {
                match self.remaining() {
                    Some(remaining) => tokio::time::timeout(remaining, step)
                        .await
                        .map_err(|_| {
                            deadline_error(self.what, self.config.timeout.unwrap_or_default())
                        }),
                    None => Ok(step.await),
                }
            };
            match self.cancel {
                Some(cancel) => tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(Error::Cancelled),
                    out = bounded => out,
                },
                None => bounded.await,
            }
        }

        /// Sleep until the next attempt.
        pub async fn wait(&mut self) -> Result<()> {
            let mut delay = self.config.backoff.delay(self.attempt).max(MIN_POLL_INTERVAL);
            if let Some(remaining) = self.remaining() {
                delay = delay.min(remaining);
            }
            self.attempt += 1;
            tracing::trace!(
                what = self.what,
                attempt = self.attempt,
                delay_ms = delay.as_millis() as u64,
                "Poll pending"
            );
            match self.cancel {
                Some(cancel) => tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(Error::Cancelled),
                    _ = tokio::time::sleep(delay) => Ok(()),
                },
                None => {
                    tokio::time::sleep(delay).await;
                    Ok(())
                }
            }
        }
    }

    /// Poll until [`Poll::Ready`], the deadline, or cancellation.
    pub async fn poll_until_async<T, F, Fut>(
        config: &PollConfig,
        cancel: Option<&CancellationToken>,
        what: &str,
        mut step: F,
    ) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<Poll<T>>>,
    {
        let mut poller = AsyncPoller::new(*config, cancel, what);
        loop {
            poller.check()?;
            if let Poll::Ready(value) = poller.guard(step(poller.attempt())).await?? {
                return Ok(value);
            }
            poller.wait().await?;
        }
    }
}
