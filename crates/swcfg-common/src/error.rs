//! Error types for deployment attempts and configuration loading.
//!
//! All errors implement `std::error::Error` via `thiserror`. Cooperative
//! cancellation travels through the same `Result` channel as
//! [`DeployError::Cancelled`] so every handler can tell it apart from a fault.

use std::io;
use std::net::IpAddr;
use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for a single deployment attempt.
pub type DeployResult<T> = Result<T, DeployError>;

/// Result type alias for configuration handling.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Coarse classification of a [`DeployError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Shutdown was requested; not an error condition.
    Cancelled,
    /// Temporary condition; the next cycle retries naturally.
    Transient,
    /// Aborts this device's attempt only.
    DeviceFatal,
}

impl ErrorClass {
    /// Returns the class name as used in log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Cancelled => "cancelled",
            ErrorClass::Transient => "transient",
            ErrorClass::DeviceFatal => "device-fatal",
        }
    }
}

/// Errors raised while deploying to a single device.
#[derive(Debug, Error)]
pub enum DeployError {
    /// The process-wide cancellation signal was observed.
    #[error("Deployment cancelled by shutdown request")]
    Cancelled,

    /// No known address of the device answered.
    #[error("Device {device} unreachable on all addresses {addresses:?}")]
    Unreachable {
        /// Device id.
        device: String,
        /// Every address that was tried.
        addresses: Vec<IpAddr>,
    },

    /// A connection to one address failed or timed out.
    #[error("Connection to {address} failed: {message}")]
    Connection {
        /// The remote address or URL.
        address: String,
        /// Error message.
        message: String,
    },

    /// The record handed to a worker does not match the pinned identity.
    #[error("Device {field} changed from '{pinned}' to '{received}', refusing to continue")]
    IdentityMismatch {
        /// Which identity field differs ("id" or "usecase").
        field: &'static str,
        /// Value pinned at worker spawn.
        pinned: String,
        /// Value found in the record.
        received: String,
    },

    /// The REST API reported a revision state outside the known vocabulary.
    #[error("Unknown state for revision {revision}: '{state}'")]
    UnknownRevisionState {
        /// Revision id.
        revision: String,
        /// Reported state.
        state: String,
    },

    /// The revision entered a failed state.
    #[error("Revision {revision} failed with state '{state}'")]
    RevisionFailed {
        /// Revision id.
        revision: String,
        /// Reported state.
        state: String,
    },

    /// Another revision is being activated on the device.
    #[error("Revision {revision} is blocking with state '{state}'")]
    RevisionBlocked {
        /// The blocking revision id.
        revision: String,
        /// Its state.
        state: String,
    },

    /// A polling phase ran out of time.
    #[error("Timed out in phase {phase} for revision {revision}, last state '{state}'")]
    StateTimeout {
        /// Polling phase name.
        phase: &'static str,
        /// Revision id.
        revision: String,
        /// Last observed state.
        state: String,
    },

    /// The device answered with something we cannot use.
    #[error("Protocol error: {message}")]
    Protocol {
        /// Error message.
        message: String,
    },

    /// A CLI command did not complete.
    #[error("Command '{command}' failed: {message}")]
    Command {
        /// The command sent to the device.
        command: String,
        /// Error message.
        message: String,
    },

    /// Local I/O failed.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl DeployError {
    /// Creates a connection error.
    pub fn connection(address: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connection {
            address: address.into(),
            message: message.into(),
        }
    }

    /// Creates a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Creates a command error.
    pub fn command(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Command {
            command: command.into(),
            message: message.into(),
        }
    }

    /// Creates an identity mismatch error.
    pub fn identity_mismatch(
        field: &'static str,
        pinned: impl Into<String>,
        received: impl Into<String>,
    ) -> Self {
        Self::IdentityMismatch {
            field,
            pinned: pinned.into(),
            received: received.into(),
        }
    }

    /// Returns true if this is the cooperative cancellation outcome.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, DeployError::Cancelled)
    }

    /// Returns true if this error indicates a transient condition
    /// that may succeed on the next cycle.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DeployError::Connection { .. } | DeployError::Unreachable { .. }
        )
    }

    /// Classifies this error.
    pub fn class(&self) -> ErrorClass {
        if self.is_cancelled() {
            ErrorClass::Cancelled
        } else if self.is_transient() {
            ErrorClass::Transient
        } else {
            ErrorClass::DeviceFatal
        }
    }
}

/// Errors raised while decoding device records.
#[derive(Debug, Error)]
pub enum RecordError {
    /// The document is not a JSON object of device records.
    #[error("Invalid device records: {0}")]
    Json(#[from] serde_json::Error),

    /// A record is stored under a key other than its own id.
    #[error("Record keyed '{key}' carries mismatching id '{id}'")]
    KeyMismatch {
        /// The map key.
        key: String,
        /// The id inside the record.
        id: String,
    },
}

/// Errors raised while loading or validating the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file exists but could not be read.
    #[error("Failed to read config file {path}: {source}")]
    Read {
        /// Path of the file.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// The file is not valid TOML for [`crate::DeployConfig`].
    #[error("Failed to parse config file {path}: {message}")]
    Parse {
        /// Path of the file.
        path: PathBuf,
        /// Parser message.
        message: String,
    },

    /// A field holds an unusable value.
    #[error("Invalid configuration for {field}: {message}")]
    Invalid {
        /// The field that failed validation.
        field: String,
        /// Error message.
        message: String,
    },
}

impl ConfigError {
    /// Creates an invalid configuration error.
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DeployError::identity_mismatch("usecase", "core-switch", "access-switch");
        assert_eq!(
            err.to_string(),
            "Device usecase changed from 'core-switch' to 'access-switch', refusing to continue"
        );
    }

    #[test]
    fn test_unknown_state_display() {
        let err = DeployError::UnknownRevisionState {
            revision: "42".to_string(),
            state: "exploded".to_string(),
        };
        assert!(err.to_string().contains("'exploded'"));
    }

    #[test]
    fn test_classification() {
        assert_eq!(DeployError::Cancelled.class(), ErrorClass::Cancelled);
        assert_eq!(
            DeployError::connection("10.0.0.1", "refused").class(),
            ErrorClass::Transient
        );
        assert_eq!(
            DeployError::protocol("garbage").class(),
            ErrorClass::DeviceFatal
        );
        assert_eq!(
            DeployError::identity_mismatch("id", "a", "b").class(),
            ErrorClass::DeviceFatal
        );
    }

    #[test]
    fn test_cancelled_is_not_transient() {
        assert!(DeployError::Cancelled.is_cancelled());
        assert!(!DeployError::Cancelled.is_transient());
        assert!(!DeployError::protocol("x").is_cancelled());
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::invalid("rest.port", "must be > 0");
        assert_eq!(
            err.to_string(),
            "Invalid configuration for rest.port: must be > 0"
        );
    }
}
