//! Error types for swcfgd

use std::path::PathBuf;
use std::time::Duration;

use swcfg_common::RecordError;
use thiserror::Error;

/// Conditions that terminate the whole daemon.
#[derive(Error, Debug)]
pub enum FatalError {
    /// A newly spawned worker never acknowledged its start.
    #[error("Worker for device {device} did not start within {timeout:?}")]
    HandshakeTimeout {
        /// Device id of the worker.
        device: String,
        /// The handshake bound that expired.
        timeout: Duration,
    },

    /// An action worker stopped while the daemon was running.
    #[error("Action worker {action} terminated unexpectedly: {reason}")]
    ActionWorkerDied {
        /// Action name ("writer" or "cleaner").
        action: &'static str,
        /// Exit reason.
        reason: String,
    },

    /// Units were still running after both shutdown bounds.
    #[error("Shutdown stalled with {remaining} units still running")]
    ShutdownStalled {
        /// Number of units that did not finish.
        remaining: usize,
    },

    /// Device records could not be obtained.
    #[error("Record source error: {0}")]
    RecordSource(#[from] SourceError),

    /// At least one one-shot deployment attempt failed.
    #[error("{failed} of {total} deployments failed")]
    DeploymentFailed {
        /// Failed or crashed workers.
        failed: usize,
        /// Workers spawned in this run.
        total: usize,
    },
}

/// Errors of a [`crate::RecordSource`].
#[derive(Error, Debug)]
pub enum SourceError {
    /// The records file could not be read.
    #[error("Failed to read {path}: {source}")]
    Read {
        /// Path of the records file.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The records could not be decoded.
    #[error(transparent)]
    Parse(#[from] RecordError),
}

/// Result type for daemon level operations
pub type FatalResult<T> = std::result::Result<T, FatalError>;
