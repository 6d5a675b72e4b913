//! Common infrastructure for the swcfg configuration deployer.
//!
//! This crate provides the pieces shared by the device drivers and the
//! deployment daemon:
//!
//! - [`error`]: the per-attempt error taxonomy ([`DeployError`])
//! - [`cancel`]: the process-wide cooperative [`CancellationSignal`]
//! - [`record`]: the typed [`DeviceRecord`] handed over by the render pipeline
//! - [`config`]: the TOML configuration file ([`DeployConfig`])
//! - [`stats`]: per-device deployment timestamps ([`DeployStats`])
//!
//! # Error classes
//!
//! | Class | Examples | Handling |
//! |-------|----------|----------|
//! | transient | connection refused, timeout | retried next cycle |
//! | device fatal | identity mismatch, unknown revision state | attempt aborted |
//! | cancelled | shutdown in progress | unwinds quietly |

pub mod cancel;
pub mod config;
pub mod error;
pub mod record;
pub mod stats;

pub use cancel::CancellationSignal;
pub use config::{DeployConfig, DriverKind};
pub use error::{ConfigError, ConfigResult, DeployError, DeployResult, ErrorClass, RecordError};
pub use record::{parse_records, AddressFamily, DeviceRecord, DeviceRecords, FamilyOrder};
pub use stats::{DeployStats, StatKind};
