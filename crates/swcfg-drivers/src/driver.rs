//! The driver trait and the usecase-to-driver registry.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use swcfg_common::{
    CancellationSignal, DeployConfig, DeployResult, DeployStats, DeviceRecord, DriverKind,
};

use crate::rest::{HttpRevisionApi, RestRevisionDriver, RestSettings};
use crate::ssh::{RusshConnector, SshCommitConfirmDriver, SshSettings};

/// How a successful attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployOutcome {
    /// The configuration was committed and confirmed.
    Committed,
    /// Only the login banner differed; the change was discarded.
    BannerOnly,
    /// Dry-deploy mode: the device was inspected but nothing was activated.
    DryRun,
}

impl DeployOutcome {
    /// Returns the outcome name as used in log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeployOutcome::Committed => "committed",
            DeployOutcome::BannerOnly => "banner-only",
            DeployOutcome::DryRun => "dry-run",
        }
    }
}

impl fmt::Display for DeployOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Executes a single deployment attempt for a device.
///
/// Implementations must observe `cancel` at every suspension point and
/// return [`swcfg_common::DeployError::Cancelled`] once it is set.
#[async_trait]
pub trait DeviceDriver: Send + Sync {
    /// Returns the protocol family implemented by this driver.
    fn kind(&self) -> DriverKind;

    /// Pushes `record` onto the device.
    async fn deploy(
        &self,
        record: &DeviceRecord,
        cancel: &CancellationSignal,
    ) -> DeployResult<DeployOutcome>;
}

/// Maps driver keys ("usecases") to driver instances.
#[derive(Clone, Default)]
pub struct DriverRegistry {
    drivers: HashMap<String, Arc<dyn DeviceDriver>>,
}

impl fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<&String> = self.drivers.keys().collect();
        keys.sort();
        f.debug_struct("DriverRegistry").field("keys", &keys).finish()
    }
}

impl DriverRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the registry from the `[drivers]` table.
    ///
    /// Every usecase of the same kind shares one driver instance.
    pub fn from_config(config: &DeployConfig, stats: DeployStats) -> Self {
        let ssh: Arc<dyn DeviceDriver> = Arc::new(SshCommitConfirmDriver::new(
            Arc::new(RusshConnector::from_config(config)),
            SshSettings::from_config(config),
            stats.clone(),
        ));
        let rest: Arc<dyn DeviceDriver> = Arc::new(RestRevisionDriver::new(
            Arc::new(HttpRevisionApi::from_config(config)),
            RestSettings::from_config(config),
            stats,
        ));

        let mut registry = Self::new();
        for (usecase, kind) in &config.drivers {
            let driver = match kind {
                DriverKind::SshCommitConfirm => ssh.clone(),
                DriverKind::RestRevision => rest.clone(),
            };
            registry.insert(usecase.clone(), driver);
        }

        tracing::debug!(drivers = ?registry, "Driver registry initialized");
        registry
    }

    /// Registers `driver` for `usecase`, replacing any previous entry.
    pub fn insert(&mut self, usecase: impl Into<String>, driver: Arc<dyn DeviceDriver>) {
        self.drivers.insert(usecase.into(), driver);
    }

    /// Returns the driver for `usecase`.
    pub fn get(&self, usecase: &str) -> Option<Arc<dyn DeviceDriver>> {
        self.drivers.get(usecase).cloned()
    }

    /// Returns true if a driver is registered for `usecase`.
    pub fn contains(&self, usecase: &str) -> bool {
        self.drivers.contains_key(usecase)
    }

    /// Returns the number of registered usecases.
    pub fn len(&self) -> usize {
        self.drivers.len()
    }

    /// Returns true if no usecase is registered.
    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }
}
