//! Long-lived per-device worker.
//!
//! A worker is pinned to one device id and driver key at spawn time. It
//! waits on its [`Mailbox`], deploys the freshest record it finds and, in
//! daemon mode, goes back to waiting. Exactly one worker exists per device,
//! so attempts on the same device never overlap.

use std::sync::Arc;
use std::time::Duration;

use swcfg_common::{CancellationSignal, DeployConfig, DeployError, DeployResult, DeviceRecord};
use swcfg_drivers::DeviceDriver;
use tokio::sync::oneshot;

use crate::mailbox::{Mailbox, Received};

/// How a worker ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// One-shot mode: the single attempt finished.
    Completed,
    /// The cancellation signal was observed.
    Cancelled,
    /// The reconciler dropped the mailbox.
    Retired,
}

impl WorkerExit {
    /// Returns the exit name as used in log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerExit::Completed => "completed",
            WorkerExit::Cancelled => "cancelled",
            WorkerExit::Retired => "retired",
        }
    }
}

/// Behaviour switches shared by all workers.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Loop until cancelled instead of exiting after one attempt.
    pub daemon: bool,
    /// Skip contacting devices entirely.
    pub no_deploy: bool,
    /// Mailbox wait slice.
    pub poll: Duration,
}

impl WorkerSettings {
    /// Extracts the worker settings from the daemon configuration.
    pub fn from_config(config: &DeployConfig) -> Self {
        Self {
            daemon: config.daemon,
            no_deploy: config.deploy.no_deploy,
            poll: config.mailbox_poll(),
        }
    }
}

/// Worker bound to a single device.
pub struct DeviceWorker {
    id: String,
    usecase: String,
    driver: Arc<dyn DeviceDriver>,
    mailbox: Mailbox,
    cancel: CancellationSignal,
    settings: WorkerSettings,
}

impl DeviceWorker {
    /// Creates a worker pinned to `id` and `usecase`.
    pub fn new(
        id: impl Into<String>,
        usecase: impl Into<String>,
        driver: Arc<dyn DeviceDriver>,
        mailbox: Mailbox,
        cancel: CancellationSignal,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            id: id.into(),
            usecase: usecase.into(),
            driver,
            mailbox,
            cancel,
            settings,
        }
    }

    /// Runs the worker, acknowledging the start through `started`.
    ///
    /// An identity mismatch ends the worker with an error in every mode;
    /// other attempt errors only end it in one-shot mode.
    pub async fn run(mut self, started: oneshot::Sender<()>) -> DeployResult<WorkerExit> {
        // The reconciler may already have given up waiting.
        let _ = started.send(());
        tracing::debug!(usecase = %self.usecase, "Worker started");

        loop {
            tracing::trace!("Waiting for new configuration");
            let received = tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    tracing::debug!("Honoring shutdown request");
                    return Ok(WorkerExit::Cancelled);
                }
                received = self.mailbox.recv_timeout(self.settings.poll) => received,
            };

            let record = match received {
                Received::Empty => continue,
                Received::Closed => {
                    tracing::info!("Device no longer desired, worker retiring");
                    return Ok(WorkerExit::Retired);
                }
                Received::Record { record, skipped } => {
                    if skipped > 0 {
                        tracing::debug!(skipped, "Skipped outdated configurations");
                    }
                    record
                }
            };

            match self.attempt(&record).await {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => {
                    tracing::info!("Attempt interrupted by shutdown");
                    return Ok(WorkerExit::Cancelled);
                }
                Err(e @ DeployError::IdentityMismatch { .. }) => {
                    tracing::error!(error = %e, "Refusing record for a different device");
                    return Err(e);
                }
                Err(e) if !self.settings.daemon => return Err(e),
                Err(e) => {
                    tracing::error!(error = %e, class = e.class().as_str(), "Deployment attempt failed");
                }
            }

            if !self.settings.daemon {
                return Ok(WorkerExit::Completed);
            }
        }
    }

    fn check_identity(&self, record: &DeviceRecord) -> DeployResult<()> {
        if record.id != self.id {
            return Err(DeployError::identity_mismatch("id", &self.id, &record.id));
        }
        if record.usecase != self.usecase {
            return Err(DeployError::identity_mismatch(
                "usecase",
                &self.usecase,
                &record.usecase,
            ));
        }
        Ok(())
    }

    /// One deployment attempt for `record`.
    async fn attempt(&self, record: &DeviceRecord) -> DeployResult<()> {
        self.check_identity(record)?;

        if !record.is_renderable() {
            tracing::info!("No rendered configuration yet, skipping");
            return Ok(());
        }
        if self.settings.no_deploy {
            tracing::debug!("Not deploying to devices as configured");
            return Ok(());
        }

        let outcome = self.driver.deploy(record, &self.cancel).await?;
        tracing::info!(%outcome, "Deployment attempt finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailbox::mailbox;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use swcfg_common::DriverKind;
    use swcfg_drivers::DeployOutcome;

    #[derive(Default)]
    struct RecordingDriver {
        serials: Mutex<Vec<String>>,
        fail: bool,
        /// Block until cancelled, like a driver polling a slow device.
        hang: bool,
    }

    #[async_trait]
    impl DeviceDriver for RecordingDriver {
        fn kind(&self) -> DriverKind {
            DriverKind::SshCommitConfirm
        }

        async fn deploy(
            &self,
            record: &DeviceRecord,
            cancel: &CancellationSignal,
        ) -> DeployResult<DeployOutcome> {
            self.serials.lock().unwrap().push(record.serial.clone());
            if self.hang {
                cancel.cancelled().await;
                return Err(DeployError::Cancelled);
            }
            if self.fail {
                return Err(DeployError::protocol("boom"));
            }
            Ok(DeployOutcome::Committed)
        }
    }

    fn record(id: &str, usecase: &str, serial: &str) -> Arc<DeviceRecord> {
        Arc::new(DeviceRecord {
            id: id.to_string(),
            serial: serial.to_string(),
            nodename: "sw-1".to_string(),
            usecase: usecase.to_string(),
            addresses: BTreeMap::new(),
            rendered: Some("system {}".to_string()),
            deploy: true,
            gateway: None,
        })
    }

    fn settings(daemon: bool) -> WorkerSettings {
        WorkerSettings {
            daemon,
            no_deploy: false,
            poll: Duration::from_secs(1),
        }
    }

    fn spawn(
        driver: Arc<RecordingDriver>,
        mailbox: Mailbox,
        cancel: &CancellationSignal,
        daemon: bool,
    ) -> tokio::task::JoinHandle<DeployResult<WorkerExit>> {
        let worker = DeviceWorker::new("d1", "access", driver, mailbox, cancel.clone(), settings(daemon));
        let (started_tx, _started_rx) = oneshot::channel();
        tokio::spawn(worker.run(started_tx))
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_shot_deploys_latest_record() {
        let driver = Arc::new(RecordingDriver::default());
        let (tx, rx) = mailbox();
        tx.put(record("d1", "access", "A"));
        tx.put(record("d1", "access", "B"));

        let cancel = CancellationSignal::new();
        let exit = spawn(driver.clone(), rx, &cancel, false).await.unwrap();

        assert_eq!(exit.unwrap(), WorkerExit::Completed);
        assert_eq!(*driver.serials.lock().unwrap(), vec!["B".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_identity_mismatch_never_invokes_driver() {
        let driver = Arc::new(RecordingDriver::default());
        let (tx, rx) = mailbox();
        tx.put(record("d1", "core", "A"));

        let cancel = CancellationSignal::new();
        let result = spawn(driver.clone(), rx, &cancel, true).await.unwrap();

        assert!(matches!(
            result,
            Err(DeployError::IdentityMismatch { field: "usecase", .. })
        ));
        assert!(driver.serials.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_waiting() {
        let driver = Arc::new(RecordingDriver::default());
        let (_tx, rx) = mailbox();
        let cancel = CancellationSignal::new();
        let handle = spawn(driver, rx, &cancel, true);

        tokio::time::sleep(Duration::from_secs(5)).await;
        cancel.cancel();
        assert_eq!(handle.await.unwrap().unwrap(), WorkerExit::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_attempt_is_not_an_error() {
        let driver = Arc::new(RecordingDriver {
            hang: true,
            ..Default::default()
        });
        let (tx, rx) = mailbox();
        tx.put(record("d1", "access", "A"));
        let cancel = CancellationSignal::new();
        let handle = spawn(driver, rx, &cancel, false);

        tokio::time::sleep(Duration::from_secs(5)).await;
        cancel.cancel();
        assert_eq!(handle.await.unwrap().unwrap(), WorkerExit::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_daemon_survives_attempt_errors() {
        let driver = Arc::new(RecordingDriver {
            fail: true,
            ..Default::default()
        });
        let (tx, rx) = mailbox();
        let cancel = CancellationSignal::new();
        let handle = spawn(driver.clone(), rx, &cancel, true);

        tx.put(record("d1", "access", "A"));
        tokio::time::sleep(Duration::from_secs(3)).await;
        tx.put(record("d1", "access", "B"));
        tokio::time::sleep(Duration::from_secs(3)).await;

        drop(tx);
        assert_eq!(handle.await.unwrap().unwrap(), WorkerExit::Retired);
        assert_eq!(driver.serials.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_shot_error_ends_worker() {
        let driver = Arc::new(RecordingDriver {
            fail: true,
            ..Default::default()
        });
        let (tx, rx) = mailbox();
        tx.put(record("d1", "access", "A"));
        let cancel = CancellationSignal::new();

        let result = spawn(driver, rx, &cancel, false).await.unwrap();
        assert!(matches!(result, Err(DeployError::Protocol { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrendered_record_is_skipped() {
        let driver = Arc::new(RecordingDriver::default());
        let (tx, rx) = mailbox();
        let mut unrendered = (*record("d1", "access", "A")).clone();
        unrendered.rendered = None;
        tx.put(Arc::new(unrendered));

        let cancel = CancellationSignal::new();
        let exit = spawn(driver.clone(), rx, &cancel, false).await.unwrap();
        assert_eq!(exit.unwrap(), WorkerExit::Completed);
        assert!(driver.serials.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_deploy_skips_driver() {
        let driver = Arc::new(RecordingDriver::default());
        let (tx, rx) = mailbox();
        tx.put(record("d1", "access", "A"));

        let cancel = CancellationSignal::new();
        let worker = DeviceWorker::new(
            "d1",
            "access",
            driver.clone(),
            rx,
            cancel.clone(),
            WorkerSettings {
                no_deploy: true,
                ..settings(false)
            },
        );
        let (started_tx, started_rx) = oneshot::channel();
        let exit = worker.run(started_tx).await.unwrap();

        assert_eq!(exit, WorkerExit::Completed);
        assert!(started_rx.await.is_ok());
        assert!(driver.serials.lock().unwrap().is_empty());
    }
}
