//! Process-wide cooperative cancellation.
//!
//! One [`CancellationSignal`] is created at startup and cloned into every
//! worker and driver. It is monotonic: once set it never clears. Code that
//! may suspend calls [`CancellationSignal::checkpoint`] around network I/O
//! and uses [`CancellationSignal::sleep`] for polling delays, so a shutdown
//! request is observed within one poll interval.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{DeployError, DeployResult};

/// Set-once stop flag shared by every concurrent unit of the process.
#[derive(Debug, Clone, Default)]
pub struct CancellationSignal {
    token: CancellationToken,
}

impl CancellationSignal {
    /// Creates a new, unset signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the signal. Idempotent.
    pub fn cancel(&self) {
        if !self.token.is_cancelled() {
            tracing::debug!("Cancellation signal set");
        }
        self.token.cancel();
    }

    /// Returns true once the signal has been set.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Returns [`DeployError::Cancelled`] if the signal has been set.
    pub fn checkpoint(&self) -> DeployResult<()> {
        if self.token.is_cancelled() {
            Err(DeployError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Completes when the signal is set.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Sleeps for `duration` unless cancelled first.
    pub async fn sleep(&self, duration: Duration) -> DeployResult<()> {
        tokio::select! {
            biased;
            () = self.token.cancelled() => Err(DeployError::Cancelled),
            () = tokio::time::sleep(duration) => Ok(()),
        }
    }

    /// Drives `fut` to completion unless cancelled first.
    ///
    /// The future is dropped on cancellation, which aborts any in-flight
    /// network call it owns.
    pub async fn guard<F, T>(&self, fut: F) -> DeployResult<T>
    where
        F: Future<Output = DeployResult<T>>,
    {
        self.checkpoint()?;
        tokio::select! {
            biased;
            () = self.token.cancelled() => Err(DeployError::Cancelled),
            result = fut => result,
        }
    }
}
