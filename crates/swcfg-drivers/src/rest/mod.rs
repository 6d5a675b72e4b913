//! NVUE revision driver for Cumulus Linux devices.
//!
//! An attempt stages the target configuration in a fresh revision, applies
//! it with an auto-revert window, follows the revision through its state
//! machine and finally confirms and saves it. Every failure after the
//! revision was created cancels it again on a best-effort basis.

mod api;
mod http;
mod state;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use swcfg_common::{
    CancellationSignal, DeployConfig, DeployError, DeployResult, DeployStats, DeviceRecord,
    DriverKind, FamilyOrder, StatKind,
};
use tracing::instrument;

use crate::driver::{DeployOutcome, DeviceDriver};

pub use api::{Endpoint, RevisionApi, StateRequest};
pub use http::HttpRevisionApi;
pub use state::{RevisionState, StateClass};

/// Interval between two state polls.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Bound of the first wait-for-turn phase.
pub const WAIT_FOR_TURN_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound of the preprocessing phase.
pub const PREPROCESS_TIMEOUT: Duration = Duration::from_secs(60);

/// Bound of the confirm-to-applied phase.
pub const APPLIED_TIMEOUT: Duration = Duration::from_secs(60);

/// Bound of the save phase.
pub const SAVED_TIMEOUT: Duration = Duration::from_secs(60);

/// Settings of the REST revision driver.
#[derive(Debug, Clone)]
pub struct RestSettings {
    /// HTTPS port of the API.
    pub port: u16,
    /// DNS suffix appended to the node name.
    pub dns_parent: String,
    /// Auto-revert window of an applied but unconfirmed revision.
    pub rollback_timeout: Duration,
    /// Stage and diff only, never activate.
    pub dry_deploy: bool,
    /// Directory receiving revision diffs.
    pub session_log_dir: Option<PathBuf>,
}

impl RestSettings {
    /// Extracts the driver settings from the daemon configuration.
    pub fn from_config(config: &DeployConfig) -> Self {
        Self {
            port: config.rest.port,
            dns_parent: config.rest.dns_parent.clone(),
            rollback_timeout: config.rollback_timeout(),
            dry_deploy: config.deploy.dry_deploy,
            session_log_dir: config.session_log_dir.clone(),
        }
    }
}

/// One polling phase of an attempt.
#[derive(Debug, Clone, Copy)]
struct Phase {
    name: &'static str,
    /// States that keep the phase going; empty tolerates any non-failed state.
    good: &'static [StateClass],
    /// States that end the phase successfully.
    target: Option<StateClass>,
    /// `None` waits without bound.
    timeout: Option<Duration>,
}

/// How a polling phase ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PhaseEnd {
    /// A target state was observed.
    Reached(RevisionState),
    /// The revision moved on to a state outside the phase.
    Left(RevisionState),
    /// The phase bound expired; carries the last observed state.
    TimedOut(Option<RevisionState>),
}

/// Mutable context of one attempt.
struct Attempt<'a> {
    record: &'a DeviceRecord,
    endpoint: Endpoint,
    revision: String,
}

/// Deploys through the NVUE revision API.
pub struct RestRevisionDriver {
    api: Arc<dyn RevisionApi>,
    settings: RestSettings,
    stats: DeployStats,
}

impl RestRevisionDriver {
    /// Creates a driver talking to devices through `api`.
    pub fn new(api: Arc<dyn RevisionApi>, settings: RestSettings, stats: DeployStats) -> Self {
        Self {
            api,
            settings,
            stats,
        }
    }

    fn host(&self, record: &DeviceRecord) -> String {
        if self.settings.dns_parent.is_empty() {
            record.nodename.clone()
        } else {
            format!("{}.{}", record.nodename, self.settings.dns_parent)
        }
    }

    /// Finds an address where the API answers, IPv6 first.
    async fn resolve(
        &self,
        record: &DeviceRecord,
        cancel: &CancellationSignal,
    ) -> DeployResult<Endpoint> {
        let host = self.host(record);
        let addresses = record.addresses_in(FamilyOrder::V6First);

        for address in &addresses {
            let endpoint = Endpoint {
                host: host.clone(),
                address: *address,
                port: self.settings.port,
            };
            self.stats.update(&record.id, StatKind::Contact);

            match cancel.guard(self.api.probe(&endpoint)).await {
                Ok(()) => {
                    self.stats.update(&record.id, StatKind::Answer);
                    return Ok(endpoint);
                }
                Err(e) if e.is_transient() => {
                    tracing::debug!(%address, error = %e, "API unreachable, trying next address");
                }
                Err(e) => return Err(e),
            }
        }

        Err(DeployError::Unreachable {
            device: record.id.clone(),
            addresses,
        })
    }

    /// Fails if any revision on the device is currently being activated.
    async fn ensure_idle(&self, endpoint: &Endpoint, cancel: &CancellationSignal) -> DeployResult<()> {
        let revisions = cancel.guard(self.api.revisions(endpoint)).await?;
        for (revision, raw) in revisions {
            let state = RevisionState::parse(&revision, &raw)?;
            if state.is(StateClass::Blocking) {
                tracing::error!(%revision, %state, "Another revision is blocking");
                return Err(DeployError::RevisionBlocked {
                    revision,
                    state: raw,
                });
            }
        }
        Ok(())
    }

    /// Polls the revision until the phase ends.
    ///
    /// Unknown and failed states raise immediately. Connection errors are
    /// retried until the phase bound expires.
    async fn wait_for_state(
        &self,
        attempt: &Attempt<'_>,
        phase: Phase,
        cancel: &CancellationSignal,
    ) -> DeployResult<PhaseEnd> {
        tracing::debug!(
            phase = phase.name,
            timeout_secs = phase.timeout.map(|t| t.as_secs()),
            "Waiting for revision state change"
        );
        let started = tokio::time::Instant::now();
        let mut last = None;

        loop {
            cancel.checkpoint()?;
            match cancel
                .guard(self.api.revision_state(&attempt.endpoint, &attempt.revision))
                .await
            {
                Ok(raw) => {
                    let state = RevisionState::parse(&attempt.revision, &raw)?;
                    tracing::debug!(phase = phase.name, %state, "Polled revision state");

                    if state.is(StateClass::Failed) {
                        return Err(DeployError::RevisionFailed {
                            revision: attempt.revision.clone(),
                            state: raw,
                        });
                    }
                    if phase.target.is_some_and(|target| state.is(target)) {
                        return Ok(PhaseEnd::Reached(state));
                    }
                    last = Some(state);
                    if !phase.good.is_empty() && !phase.good.iter().any(|good| state.is(*good)) {
                        return Ok(PhaseEnd::Left(state));
                    }
                }
                Err(e) if e.is_transient() => {
                    tracing::debug!(phase = phase.name, error = %e, "Ignoring connection error while polling");
                }
                Err(e) => return Err(e),
            }

            if phase.timeout.is_some_and(|timeout| started.elapsed() >= timeout) {
                tracing::debug!(phase = phase.name, state = ?last, "Phase timed out");
                return Ok(PhaseEnd::TimedOut(last));
            }
            cancel.sleep(POLL_INTERVAL).await?;
        }
    }

    /// Polls until a target state of `phase` is reached.
    async fn require_state(
        &self,
        attempt: &Attempt<'_>,
        phase: Phase,
        cancel: &CancellationSignal,
    ) -> DeployResult<RevisionState> {
        match self.wait_for_state(attempt, phase, cancel).await? {
            PhaseEnd::Reached(state) => Ok(state),
            PhaseEnd::Left(state) | PhaseEnd::TimedOut(Some(state)) => {
                Err(self.timeout_error(attempt, phase, Some(state)))
            }
            PhaseEnd::TimedOut(None) => Err(self.timeout_error(attempt, phase, None)),
        }
    }

    fn timeout_error(&self, attempt: &Attempt<'_>, phase: Phase, state: Option<RevisionState>) -> DeployError {
        DeployError::StateTimeout {
            phase: phase.name,
            revision: attempt.revision.clone(),
            state: state.map_or_else(|| "unknown".to_string(), |s| s.to_string()),
        }
    }

    async fn write_diff_log(&self, attempt: &Attempt<'_>, diff: &str) {
        let Some(dir) = &self.settings.session_log_dir else {
            return;
        };
        let timestamp = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S+00:00");
        let path = dir.join(format!(
            "{}-{}-{}.json",
            attempt.record.nodename,
            attempt.revision.replace('/', "_"),
            timestamp
        ));

        let result = async {
            tokio::fs::create_dir_all(dir).await?;
            tokio::fs::write(&path, format!("{}\n", diff)).await
        }
        .await;
        match result {
            Ok(()) => tracing::debug!(path = %path.display(), "Wrote revision diff"),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to write revision diff"),
        }
    }

    /// Forces the revision to pending, then to confirm-failed.
    ///
    /// Runs even after cancellation. Failures are logged and swallowed.
    async fn cancel_revision(&self, attempt: &Attempt<'_>) {
        tracing::debug!(revision = %attempt.revision, "Cancelling revision");
        for state in [RevisionState::Pending, RevisionState::ConfirmFail] {
            let request = StateRequest::new(state.as_str());
            if let Err(e) = self
                .api
                .set_state(&attempt.endpoint, &attempt.revision, &request)
                .await
            {
                tracing::warn!(
                    revision = %attempt.revision,
                    %state,
                    error = %e,
                    "Failed to cancel revision"
                );
            }
        }
    }

    /// Steps from staging the revision to saving it.
    async fn run(
        &self,
        attempt: &mut Attempt<'_>,
        config: &serde_json::Value,
        cancel: &CancellationSignal,
    ) -> DeployResult<DeployOutcome> {
        let record = attempt.record;

        tracing::debug!(revision = %attempt.revision, "Staging revision");
        cancel
            .guard(self.api.clear_revision(&attempt.endpoint, &attempt.revision))
            .await?;
        cancel
            .guard(self.api.patch_config(&attempt.endpoint, &attempt.revision, config))
            .await?;
        self.stats.update(&record.id, StatKind::Update);

        let raw_diff = cancel
            .guard(self.api.diff(&attempt.endpoint, &attempt.revision))
            .await?;
        self.write_diff_log(attempt, &raw_diff).await;

        match serde_json::from_str::<serde_json::Value>(&raw_diff) {
            Ok(diff) if is_banner_only(&diff) => {
                tracing::info!(revision = %attempt.revision, "Only the pre-login message changed, not activating");
                self.cancel_revision(attempt).await;
                return Ok(DeployOutcome::BannerOnly);
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(revision = %attempt.revision, error = %e, "Failed to inspect revision diff");
            }
        }

        if self.settings.dry_deploy {
            tracing::info!(revision = %attempt.revision, "Dry deploy, not activating revision");
            self.cancel_revision(attempt).await;
            return Ok(DeployOutcome::DryRun);
        }

        let confirm_secs = self.settings.rollback_timeout.as_secs();
        cancel
            .guard(self.api.set_state(
                &attempt.endpoint,
                &attempt.revision,
                &StateRequest::new(RevisionState::Apply.as_str()).with_confirm(confirm_secs),
            ))
            .await?;
        self.stats.update(&record.id, StatKind::Commit);
        tracing::debug!(revision = %attempt.revision, confirm_secs, "Requested activation");

        let turn = Phase {
            name: "wait-for-turn",
            good: &[StateClass::WaitForTurn],
            target: None,
            timeout: Some(WAIT_FOR_TURN_TIMEOUT),
        };
        if let PhaseEnd::TimedOut(_) = self.wait_for_state(attempt, turn, cancel).await? {
            tracing::warn!(revision = %attempt.revision, "Revision is blocked by an earlier revision, waiting");
            let unbounded = Phase {
                timeout: None,
                ..turn
            };
            self.wait_for_state(attempt, unbounded, cancel).await?;
        }

        let preprocess = Phase {
            name: "preprocessing",
            good: &[StateClass::Preprocessing],
            target: None,
            timeout: Some(PREPROCESS_TIMEOUT),
        };
        if let PhaseEnd::TimedOut(state) = self.wait_for_state(attempt, preprocess, cancel).await? {
            return Err(self.timeout_error(attempt, preprocess, state));
        }

        let await_confirm = Phase {
            name: "await-confirm",
            good: &[StateClass::Reloading],
            target: Some(StateClass::AwaitConfirm),
            timeout: Some(self.settings.rollback_timeout),
        };
        self.require_state(attempt, await_confirm, cancel).await?;

        // Networking may have restarted with the new configuration.
        tracing::debug!(revision = %attempt.revision, "Reconnecting to confirm revision");
        attempt.endpoint = self.resolve(record, cancel).await?;

        tracing::info!(revision = %attempt.revision, "Confirming revision");
        cancel
            .guard(self.api.set_state(
                &attempt.endpoint,
                &attempt.revision,
                &StateRequest::new(RevisionState::ConfirmYes.as_str()),
            ))
            .await?;
        self.stats.update(&record.id, StatKind::Confirm);

        let applied = Phase {
            name: "applied",
            good: &[],
            target: Some(StateClass::Applied),
            timeout: Some(APPLIED_TIMEOUT),
        };
        self.require_state(attempt, applied, cancel).await?;

        tracing::debug!(revision = %attempt.revision, "Saving applied configuration");
        cancel
            .guard(self.api.set_state(
                &attempt.endpoint,
                "applied",
                &StateRequest::new("save"),
            ))
            .await?;

        let saved = Phase {
            name: "saved",
            good: &[StateClass::Applied, StateClass::Saving],
            target: Some(StateClass::Saved),
            timeout: Some(SAVED_TIMEOUT),
        };
        self.require_state(attempt, saved, cancel).await?;

        tracing::info!(revision = %attempt.revision, "Revision deployed and saved");
        Ok(DeployOutcome::Committed)
    }
}

/// Returns true if `diff` only touches `system.message.pre-login`.
pub fn is_banner_only(diff: &serde_json::Value) -> bool {
    fn single_key<'v>(value: &'v serde_json::Value, key: &str) -> Option<&'v serde_json::Value> {
        let object = value.as_object()?;
        if object.len() == 1 {
            object.get(key)
        } else {
            None
        }
    }

    single_key(diff, "system")
        .and_then(|system| single_key(system, "message"))
        .and_then(|message| single_key(message, "pre-login"))
        .is_some()
}

#[async_trait]
impl DeviceDriver for RestRevisionDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::RestRevision
    }

    #[instrument(skip_all, fields(device = %record.id, nodename = %record.nodename))]
    async fn deploy(
        &self,
        record: &DeviceRecord,
        cancel: &CancellationSignal,
    ) -> DeployResult<DeployOutcome> {
        let rendered = record
            .rendered
            .as_deref()
            .ok_or_else(|| DeployError::protocol("record carries no rendered configuration"))?;
        let config: serde_json::Value = serde_json::from_str(rendered)
            .map_err(|e| DeployError::protocol(format!("rendered configuration is not JSON: {}", e)))?;

        tracing::debug!("Starting deployment");
        let endpoint = self.resolve(record, cancel).await?;
        self.ensure_idle(&endpoint, cancel).await?;

        let revision = cancel.guard(self.api.create_revision(&endpoint)).await?;
        tracing::debug!(%revision, "Created revision");

        let mut attempt = Attempt {
            record,
            endpoint,
            revision,
        };
        match self.run(&mut attempt, &config, cancel).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                if e.is_cancelled() {
                    tracing::info!(revision = %attempt.revision, "Shutdown requested, cancelling revision");
                } else {
                    tracing::error!(revision = %attempt.revision, error = %e, "Deployment failed, cancelling revision");
                }
                self.cancel_revision(&attempt).await;
                Err(e)
            }
        }
    }
}
