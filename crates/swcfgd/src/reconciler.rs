//! The control loop.
//!
//! Each cycle the reconciler fetches device records, works out which
//! devices should have a worker, retires and spawns workers to match, hands
//! the batch to the Writer and routes every record into its device's
//! mailbox. It never talks to devices itself.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use swcfg_common::{CancellationSignal, DeployConfig, DeployStats, DeviceRecord, DeviceRecords};
use swcfg_drivers::DriverRegistry;
use tokio::sync::{mpsc, oneshot};
use tracing::Instrument;

use crate::action::{self, Cleaner, Writer};
use crate::error::{FatalError, FatalResult};
use crate::mailbox::{mailbox, MailboxSender};
use crate::shutdown::{log_outcome, Unit, UnitOutcome, Units};
use crate::source::RecordSource;
use crate::worker::{DeviceWorker, WorkerExit, WorkerSettings};

/// Batches buffered between the reconciler and the Writer.
const WRITER_BACKLOG: usize = 2;

/// Reconciler parameters, resolved to durations.
#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    /// Loop until interrupted instead of running a single cycle.
    pub daemon: bool,
    /// Explicit device ids; replaces the per-record deploy flag when set.
    pub allowlist: Option<BTreeSet<String>>,
    /// Pause between daemon cycles.
    pub cycle_interval: Duration,
    /// Bound on a new worker acknowledging its start.
    pub handshake_timeout: Duration,
    /// Settings handed to every device worker.
    pub worker: WorkerSettings,
    /// Primary shutdown window.
    pub grace: Duration,
    /// Second, harder shutdown bound.
    pub hard: Duration,
    /// Directory the Writer and Cleaner operate on.
    pub output_dir: PathBuf,
    /// Session log directory purged by the Cleaner.
    pub session_log_dir: Option<PathBuf>,
    /// Cleaner pass interval.
    pub cleaner_interval: Duration,
    /// Age after which artifacts are purged.
    pub cleaner_max_age: Duration,
    /// Prometheus text file rewritten after every cycle.
    pub metrics_textfile: Option<PathBuf>,
}

impl ReconcilerSettings {
    /// Resolves the settings from the daemon configuration.
    pub fn from_config(config: &DeployConfig) -> Self {
        Self {
            daemon: config.daemon,
            allowlist: config
                .allowlist()
                .map(|ids| ids.iter().cloned().collect()),
            cycle_interval: config.cycle_interval(),
            handshake_timeout: config.handshake_timeout(),
            worker: WorkerSettings::from_config(config),
            grace: config.shutdown_grace(),
            hard: config.shutdown_hard(),
            output_dir: config.output_dir.clone(),
            session_log_dir: config.session_log_dir.clone(),
            cleaner_interval: Duration::from_secs(config.cleaner.interval_secs),
            cleaner_max_age: Duration::from_secs(config.cleaner.max_age_hours * 3600),
            metrics_textfile: config.metrics.textfile.clone(),
        }
    }
}

/// Device worker outcomes of a run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    /// Workers started.
    pub spawned: usize,
    /// Workers that finished their one-shot attempt.
    pub completed: usize,
    /// Workers stopped by the cancellation signal.
    pub cancelled: usize,
    /// Workers retired because their device left the desired set.
    pub retired: usize,
    /// Workers that returned an error or panicked.
    pub failed: usize,
}

impl RunSummary {
    fn record(&mut self, outcome: &UnitOutcome) {
        match outcome {
            UnitOutcome::Exited(WorkerExit::Completed) | UnitOutcome::Stopped => {
                self.completed += 1
            }
            UnitOutcome::Exited(WorkerExit::Cancelled) => self.cancelled += 1,
            UnitOutcome::Exited(WorkerExit::Retired) => self.retired += 1,
            UnitOutcome::Failed(_) | UnitOutcome::Crashed(_) => self.failed += 1,
        }
    }
}

/// Single control loop owning every worker of the process.
pub struct Reconciler {
    settings: ReconcilerSettings,
    source: Arc<dyn RecordSource>,
    drivers: DriverRegistry,
    stats: DeployStats,
    cancel: CancellationSignal,
    units: Units,
    /// Mailboxes of workers that still receive records.
    mailboxes: HashMap<String, MailboxSender>,
    /// Device ids with a live worker, including retiring ones.
    running: HashSet<String>,
    writer_tx: Option<mpsc::Sender<DeviceRecords>>,
    summary: RunSummary,
}

impl Reconciler {
    /// Creates a reconciler. Nothing runs until [`Reconciler::run`].
    pub fn new(
        settings: ReconcilerSettings,
        source: Arc<dyn RecordSource>,
        drivers: DriverRegistry,
        stats: DeployStats,
        cancel: CancellationSignal,
    ) -> Self {
        Self {
            settings,
            source,
            drivers,
            stats,
            cancel,
            units: Units::new(),
            mailboxes: HashMap::new(),
            running: HashSet::new(),
            writer_tx: None,
            summary: RunSummary::default(),
        }
    }

    /// Runs until done (one-shot), interrupted, or a fatal condition, then
    /// shuts every unit down.
    ///
    /// A stalled shutdown takes precedence over the error that caused it.
    pub async fn run(mut self) -> FatalResult<RunSummary> {
        tracing::info!(
            daemon = self.settings.daemon,
            drivers = self.drivers.len(),
            "Reconciler starting"
        );
        self.start_actions();

        let result = self.drive().await;
        if let Err(e) = &result {
            tracing::error!(error = %e, "Fatal condition, shutting down");
        }

        self.shutdown().await?;
        result?;

        tracing::info!(summary = ?self.summary, "Reconciler finished");
        Ok(self.summary)
    }

    fn start_actions(&mut self) {
        let (tx, rx) = mpsc::channel(WRITER_BACKLOG);
        self.writer_tx = Some(tx);
        let writer = Writer::new(self.settings.output_dir.clone(), rx);
        self.units.spawn(
            Unit::Action(action::WRITER),
            async move {
                match writer.run().await {
                    Ok(()) => UnitOutcome::Stopped,
                    Err(e) => UnitOutcome::Failed(e.to_string()),
                }
            }
            .instrument(tracing::info_span!("action", name = action::WRITER)),
        );

        let cleaner = Cleaner::new(
            self.settings.output_dir.clone(),
            self.settings.session_log_dir.clone(),
            self.settings.cleaner_interval,
            self.settings.cleaner_max_age,
            self.cancel.clone(),
        );
        self.units.spawn(
            Unit::Action(action::CLEANER),
            async move {
                match cleaner.run().await {
                    Ok(()) => UnitOutcome::Stopped,
                    Err(e) => UnitOutcome::Failed(e.to_string()),
                }
            }
            .instrument(tracing::info_span!("action", name = action::CLEANER)),
        );
    }

    async fn drive(&mut self) -> FatalResult<()> {
        loop {
            if self.cancel.is_cancelled() {
                tracing::info!("Interrupted, not starting another cycle");
                return Ok(());
            }

            self.cycle().await?;

            if !self.settings.daemon {
                return self.wait_for_workers().await;
            }
            if self.cancel.sleep(self.settings.cycle_interval).await.is_err() {
                tracing::info!("Interrupted between cycles");
                return Ok(());
            }
        }
    }

    /// One reconciliation pass.
    async fn cycle(&mut self) -> FatalResult<()> {
        self.reap()?;

        let records = match self.source.fetch().await {
            Ok(records) => records,
            Err(e) if self.settings.daemon => {
                tracing::warn!(error = %e, "Fetching device records failed, skipping cycle");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        self.stats.set_fetch();
        tracing::debug!(records = records.len(), "Fetched device records");

        let desired = self.desired(&records);
        self.retire(&desired);

        for id in &desired {
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            if self.mailboxes.contains_key(id) {
                continue;
            }
            if self.running.contains(id) {
                tracing::debug!(device = %id, "Previous worker still retiring, spawning later");
                continue;
            }
            if let Some(record) = records.get(id) {
                self.spawn_worker(record).await?;
            }
        }

        self.feed_writer(&records).await?;
        self.route(&records);
        self.export_metrics();
        Ok(())
    }

    /// Collects finished units without waiting.
    fn reap(&mut self) -> FatalResult<()> {
        while let Some((unit, outcome)) = self.units.try_next() {
            log_outcome(&unit, &outcome);
            match unit {
                Unit::Device(id) => {
                    self.running.remove(&id);
                    self.mailboxes.remove(&id);
                    self.summary.record(&outcome);
                }
                Unit::Action(name) => {
                    if self.settings.daemon {
                        return Err(FatalError::ActionWorkerDied {
                            action: name,
                            reason: outcome.to_string(),
                        });
                    }
                    if name == action::WRITER {
                        self.writer_tx = None;
                    }
                }
            }
        }
        Ok(())
    }

    /// Device ids that should have a worker this cycle.
    fn desired(&self, records: &DeviceRecords) -> BTreeSet<String> {
        match &self.settings.allowlist {
            Some(allowlist) => allowlist
                .iter()
                .filter(|id| match records.get(id.as_str()) {
                    Some(record) => self.has_driver(record),
                    None => {
                        tracing::warn!(device = %id, "Requested device not present in records");
                        false
                    }
                })
                .cloned()
                .collect(),
            None => records
                .values()
                .filter(|record| record.deploy && self.has_driver(record))
                .map(|record| record.id.clone())
                .collect(),
        }
    }

    fn has_driver(&self, record: &DeviceRecord) -> bool {
        if self.drivers.contains(&record.usecase) {
            return true;
        }
        tracing::warn!(
            device = %record.id,
            usecase = %record.usecase,
            "No driver for usecase, device not eligible"
        );
        false
    }

    /// Drops the mailbox of every worker whose device is no longer desired.
    ///
    /// The worker finishes a running attempt and then exits as retired.
    fn retire(&mut self, desired: &BTreeSet<String>) {
        let retiring: Vec<String> = self
            .mailboxes
            .keys()
            .filter(|id| !desired.contains(*id))
            .cloned()
            .collect();
        for id in retiring {
            tracing::info!(device = %id, "Device no longer eligible, retiring worker");
            self.mailboxes.remove(&id);
        }
    }

    async fn spawn_worker(&mut self, record: &DeviceRecord) -> FatalResult<()> {
        let Some(driver) = self.drivers.get(&record.usecase) else {
            return Ok(());
        };
        let id = record.id.clone();
        let (tx, rx) = mailbox();
        let (started_tx, started_rx) = oneshot::channel();

        let worker = DeviceWorker::new(
            id.clone(),
            record.usecase.clone(),
            driver,
            rx,
            self.cancel.clone(),
            self.settings.worker.clone(),
        );
        self.units.spawn(
            Unit::Device(id.clone()),
            async move {
                match worker.run(started_tx).await {
                    Ok(exit) => UnitOutcome::Exited(exit),
                    Err(e) => UnitOutcome::Failed(e.to_string()),
                }
            }
            .instrument(tracing::info_span!("worker", device = %id)),
        );
        self.running.insert(id.clone());
        self.mailboxes.insert(id.clone(), tx);
        self.summary.spawned += 1;

        await_handshake(&id, started_rx, self.settings.handshake_timeout).await?;
        tracing::info!(device = %id, usecase = %record.usecase, "Spawned worker");
        Ok(())
    }

    async fn feed_writer(&mut self, records: &DeviceRecords) -> FatalResult<()> {
        let Some(tx) = &self.writer_tx else {
            return Ok(());
        };
        let sent = tokio::select! {
            biased;
            () = self.cancel.cancelled() => {
                tracing::debug!("Shutdown requested while the writer is busy, dropping batch");
                return Ok(());
            }
            sent = tx.send(records.clone()) => sent.is_ok(),
        };
        if sent {
            return Ok(());
        }

        self.writer_tx = None;
        if self.settings.daemon {
            return Err(FatalError::ActionWorkerDied {
                action: action::WRITER,
                reason: "input closed".to_string(),
            });
        }
        tracing::warn!("Writer is gone, configurations are not persisted");
        Ok(())
    }

    /// Puts each record into its device's mailbox, if it has one.
    fn route(&self, records: &DeviceRecords) {
        for (id, record) in records {
            match self.mailboxes.get(id) {
                Some(tx) => {
                    if !tx.put(Arc::clone(record)) {
                        tracing::debug!(device = %id, "Worker exited before delivery");
                    }
                }
                None => tracing::trace!(device = %id, "No worker for record"),
            }
        }
    }

    fn export_metrics(&self) {
        let Some(path) = &self.settings.metrics_textfile else {
            return;
        };
        if let Err(e) = self.stats.write_textfile(path) {
            tracing::warn!(path = %path.display(), error = %e, "Failed to write metrics");
        }
    }

    /// One-shot mode: waits for every device worker to finish.
    async fn wait_for_workers(&mut self) -> FatalResult<()> {
        while !self.running.is_empty() {
            if self.cancel.sleep(self.settings.worker.poll).await.is_err() {
                tracing::info!(
                    remaining = self.running.len(),
                    "Interrupted while waiting for workers"
                );
                return Ok(());
            }
            self.reap()?;
        }

        if self.summary.failed > 0 {
            return Err(FatalError::DeploymentFailed {
                failed: self.summary.failed,
                total: self.summary.spawned,
            });
        }
        Ok(())
    }

    /// Stops intake, then drains every unit.
    async fn shutdown(&mut self) -> FatalResult<()> {
        self.writer_tx = None;
        let units = std::mem::take(&mut self.units);
        let outcomes = units
            .drain(&self.cancel, self.settings.grace, self.settings.hard)
            .await?;

        for (unit, outcome) in &outcomes {
            if let Unit::Device(id) = unit {
                self.running.remove(id);
                self.summary.record(outcome);
            }
        }
        self.mailboxes.clear();
        Ok(())
    }
}

/// Waits for a freshly spawned worker to acknowledge its start.
///
/// A worker that drops the acknowledgement unsent counts as not started.
async fn await_handshake(
    device: &str,
    started: oneshot::Receiver<()>,
    limit: Duration,
) -> FatalResult<()> {
    match tokio::time::timeout(limit, started).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(_)) | Err(_) => Err(FatalError::HandshakeTimeout {
            device: device.to_string(),
            timeout: limit,
        }),
    }
}
