//! Device deployment drivers for swcfg.
//!
//! A driver executes exactly one deployment attempt for one device record.
//! Two protocol families are supported:
//!
//! - [`SshCommitConfirmDriver`]: uploads the rendered text over SSH, stages
//!   it as a full override and uses `commit confirmed` so the device
//!   reverts on its own if it becomes unreachable
//! - [`RestRevisionDriver`]: stages the configuration in a server-side
//!   revision and walks it through the device's revision state machine
//!
//! Both drivers reach the device through small transport traits
//! ([`CliConnector`], [`RevisionApi`]) so the state machines can be
//! exercised without hardware.
//!
//! # Example
//!
//! ```ignore
//! use swcfg_drivers::DriverRegistry;
//!
//! let registry = DriverRegistry::from_config(&config, stats.clone());
//! if let Some(driver) = registry.get(&record.usecase) {
//!     driver.deploy(&record, &cancel).await?;
//! }
//! ```

mod driver;
pub mod rest;
pub mod ssh;

pub use driver::{DeployOutcome, DeviceDriver, DriverRegistry};
pub use rest::{
    Endpoint, HttpRevisionApi, RestRevisionDriver, RestSettings, RevisionApi, RevisionState,
    StateClass, StateRequest,
};
pub use ssh::{CliConnector, CliSession, RusshConnector, SshCommitConfirmDriver, SshSettings};
