//! SSH commit-confirm driver for Junos devices.
//!
//! One attempt runs in two sessions:
//!
//! 1. connect, upload the rendered text, `load override` it and inspect
//!    `show | compare`
//! 2. `commit confirmed <minutes>` and disconnect
//! 3. reconnect; if that works the device is still manageable and the
//!    final `commit` makes the change permanent
//!
//! If the reconnect fails nothing else is sent: the device reverts to the
//! previous configuration once the confirm timer expires.

mod diff;
mod transport;

use std::io::Write;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use swcfg_common::{
    CancellationSignal, DeployConfig, DeployError, DeployResult, DeployStats, DeviceRecord,
    DriverKind, FamilyOrder, StatKind,
};
use tracing::instrument;

use crate::driver::{DeployOutcome, DeviceDriver};

pub use diff::is_banner_only;
pub use transport::{RusshConnector, RusshSession};

/// Path on the device the rendered configuration is uploaded to.
pub const UPLOAD_PATH: &str = "/var/tmp/swcfg-upload.cfg";

/// Read timeout for commit commands, which may take minutes on small boxes.
pub const COMMIT_READ_TIMEOUT: Duration = Duration::from_secs(120);

/// Read timeout for every other command.
pub const COMMAND_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// An interactive CLI session on one device.
#[async_trait]
pub trait CliSession: Send {
    /// Copies `local` to `remote` on the device.
    async fn upload(&mut self, local: &Path, remote: &str) -> DeployResult<()>;

    /// Enters configuration mode.
    async fn config_mode(&mut self) -> DeployResult<()>;

    /// Sends one command and returns its output once the prompt reappears.
    async fn send_command(&mut self, command: &str, read_timeout: Duration)
        -> DeployResult<String>;

    /// Closes the session.
    async fn disconnect(&mut self) -> DeployResult<()>;
}

/// Opens authenticated CLI sessions.
#[async_trait]
pub trait CliConnector: Send + Sync {
    /// Connects to `address` on behalf of `record`.
    ///
    /// Unreachable addresses must be reported as
    /// [`DeployError::Connection`] so the caller can fall back to the next.
    async fn connect(
        &self,
        address: IpAddr,
        record: &DeviceRecord,
    ) -> DeployResult<Box<dyn CliSession>>;
}

/// Settings of the SSH commit-confirm driver.
#[derive(Debug, Clone)]
pub struct SshSettings {
    /// Minutes before an unconfirmed commit is reverted by the device.
    pub rollback_timeout_minutes: u64,
    /// Skip upload, load and both commits.
    pub dry_deploy: bool,
}

impl SshSettings {
    /// Extracts the driver settings from the daemon configuration.
    pub fn from_config(config: &DeployConfig) -> Self {
        Self {
            rollback_timeout_minutes: config.deploy.rollback_timeout_minutes,
            dry_deploy: config.deploy.dry_deploy,
        }
    }
}

/// Deploys by `commit confirmed` over an SSH CLI session.
pub struct SshCommitConfirmDriver {
    connector: Arc<dyn CliConnector>,
    settings: SshSettings,
    stats: DeployStats,
}

impl SshCommitConfirmDriver {
    /// Creates a driver using `connector` for every session.
    pub fn new(connector: Arc<dyn CliConnector>, settings: SshSettings, stats: DeployStats) -> Self {
        Self {
            connector,
            settings,
            stats,
        }
    }

    /// Opens a session on the first address that answers, IPv4 first.
    async fn connect(
        &self,
        record: &DeviceRecord,
        cancel: &CancellationSignal,
    ) -> DeployResult<Box<dyn CliSession>> {
        let addresses = record.addresses_in(FamilyOrder::V4First);
        for address in &addresses {
            cancel.checkpoint()?;
            tracing::debug!(%address, "Attempting to connect");
            self.stats.update(&record.id, StatKind::Contact);

            match cancel.guard(self.connector.connect(*address, record)).await {
                Ok(session) => {
                    self.stats.update(&record.id, StatKind::Answer);
                    return Ok(session);
                }
                Err(e) if e.is_transient() => {
                    tracing::debug!(%address, error = %e, "Failed to contact address, trying next");
                }
                Err(e) => return Err(e),
            }
        }

        Err(DeployError::Unreachable {
            device: record.id.clone(),
            addresses,
        })
    }

    /// Sends `command` and fails on any `error:` line in its output.
    async fn command(
        &self,
        session: &mut dyn CliSession,
        cancel: &CancellationSignal,
        command: &str,
        read_timeout: Duration,
    ) -> DeployResult<String> {
        cancel.checkpoint()?;
        let output = cancel
            .guard(session.send_command(command, read_timeout))
            .await?;
        check_output(command, &output)?;
        Ok(output)
    }

    async fn config_mode(
        &self,
        session: &mut dyn CliSession,
        cancel: &CancellationSignal,
    ) -> DeployResult<()> {
        cancel.checkpoint()?;
        cancel.guard(session.config_mode()).await
    }

    /// First session: stage the candidate, inspect it and commit with a
    /// rollback timer. Returns `None` when the commit was issued.
    async fn stage(
        &self,
        session: &mut dyn CliSession,
        record: &DeviceRecord,
        rendered: &str,
        cancel: &CancellationSignal,
    ) -> DeployResult<Option<DeployOutcome>> {
        if self.settings.dry_deploy {
            tracing::debug!("Dry deploy, not uploading configuration");
        } else {
            let mut upload = tempfile::NamedTempFile::new()?;
            writeln!(upload, "{}", rendered)?;
            upload.flush()?;

            cancel.checkpoint()?;
            cancel
                .guard(session.upload(upload.path(), UPLOAD_PATH))
                .await?;
            self.stats.update(&record.id, StatKind::Update);
            tracing::debug!("Configuration uploaded, applying");
        }

        self.config_mode(session, cancel).await?;
        if !self.settings.dry_deploy {
            let load = format!("load override {}", UPLOAD_PATH);
            self.command(session, cancel, &load, COMMAND_READ_TIMEOUT)
                .await?;
        }

        let diff = self
            .command(session, cancel, "show | compare", COMMAND_READ_TIMEOUT)
            .await?;
        if is_banner_only(&diff) {
            tracing::info!("Only the login banner changed, discarding candidate");
            self.command(session, cancel, "rollback 0", COMMAND_READ_TIMEOUT)
                .await?;
            return Ok(Some(DeployOutcome::BannerOnly));
        }

        if self.settings.dry_deploy {
            tracing::info!(diff = %diff.trim(), "Dry deploy, not committing");
            return Ok(Some(DeployOutcome::DryRun));
        }

        let commit = format!("commit confirmed {}", self.settings.rollback_timeout_minutes);
        self.command(session, cancel, &commit, COMMIT_READ_TIMEOUT)
            .await?;
        self.stats.update(&record.id, StatKind::Commit);
        Ok(None)
    }
}

/// Returns an error if the device reported one in `output`.
fn check_output(command: &str, output: &str) -> DeployResult<()> {
    let errors: Vec<&str> = output
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with("error:"))
        .collect();

    if errors.is_empty() {
        Ok(())
    } else {
        Err(DeployError::command(command, errors.join("; ")))
    }
}

#[async_trait]
impl DeviceDriver for SshCommitConfirmDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::SshCommitConfirm
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

        tracing::debug!("Starting deployment");
        let mut session = self.connect(record, cancel).await?;

        if let Some(outcome) = self.stage(session.as_mut(), record, rendered, cancel).await? {
            session.disconnect().await?;
            return Ok(outcome);
        }

        tracing::info!(
            minutes = self.settings.rollback_timeout_minutes,
            "Configuration committed, reconnecting to confirm"
        );
        session.disconnect().await?;
        drop(session);

        let mut session = match self.connect(record, cancel).await {
            Ok(session) => session,
            Err(e) => {
                if !e.is_cancelled() {
                    tracing::error!(
                        error = %e,
                        "Failed to reconnect, device will roll back on its own"
                    );
                }
                return Err(e);
            }
        };

        tracing::debug!("Device is still reachable, confirming commit");
        self.config_mode(session.as_mut(), cancel).await?;
        self.command(session.as_mut(), cancel, "commit", COMMIT_READ_TIMEOUT)
            .await?;
        self.stats.update(&record.id, StatKind::Confirm);

        session.disconnect().await?;
        tracing::info!("Configuration fully deployed");
        Ok(DeployOutcome::Committed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, VecDeque};
    use std::sync::Mutex;
    use swcfg_common::AddressFamily;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Connect(IpAddr),
        Upload(String),
        ConfigMode,
        Command(String),
        Disconnect,
    }

    #[derive(Default)]
    struct Script {
        calls: Vec<Call>,
        unreachable: Vec<IpAddr>,
        /// Connect attempts that fail regardless of address, counted down.
        failing_connects_after: Option<usize>,
        outputs: BTreeMap<String, VecDeque<String>>,
    }

    #[derive(Clone, Default)]
    struct FakeCli {
        script: Arc<Mutex<Script>>,
        cancel_on: Option<(String, CancellationSignal)>,
    }

    impl FakeCli {
        fn output(self, command: &str, text: &str) -> Self {
            self.script
                .lock()
                .unwrap()
                .outputs
                .entry(command.to_string())
                .or_default()
                .push_back(text.to_string());
            self
        }

        fn unreachable(self, address: &str) -> Self {
            self.script
                .lock()
                .unwrap()
                .unreachable
                .push(address.parse().unwrap());
            self
        }

        fn calls(&self) -> Vec<Call> {
            self.script.lock().unwrap().calls.clone()
        }

        fn commands(&self) -> Vec<String> {
            self.calls()
                .into_iter()
                .filter_map(|call| match call {
                    Call::Command(command) => Some(command),
                    _ => None,
                })
                .collect()
        }
    }

    struct FakeSession {
        cli: FakeCli,
    }

    #[async_trait]
    impl CliConnector for FakeCli {
        async fn connect(
            &self,
            address: IpAddr,
            _record: &DeviceRecord,
        ) -> DeployResult<Box<dyn CliSession>> {
            let mut script = self.script.lock().unwrap();
            script.calls.push(Call::Connect(address));

            let mut fail = script.unreachable.contains(&address);
            if let Some(remaining) = script.failing_connects_after.as_mut() {
                if *remaining == 0 {
                    fail = true;
                } else {
                    *remaining -= 1;
                }
            }
            if fail {
                return Err(DeployError::connection(address.to_string(), "timed out"));
            }
            Ok(Box::new(FakeSession { cli: self.clone() }))
        }
    }

    #[async_trait]
    impl CliSession for FakeSession {
        async fn upload(&mut self, local: &Path, remote: &str) -> DeployResult<()> {
            let content = std::fs::read_to_string(local)?;
            assert!(content.ends_with('\n'));
            let mut script = self.cli.script.lock().unwrap();
            script.calls.push(Call::Upload(remote.to_string()));
            Ok(())
        }

        async fn config_mode(&mut self) -> DeployResult<()> {
            self.cli.script.lock().unwrap().calls.push(Call::ConfigMode);
            Ok(())
        }

        async fn send_command(
            &mut self,
            command: &str,
            _read_timeout: Duration,
        ) -> DeployResult<String> {
            let output = {
                let mut script = self.cli.script.lock().unwrap();
                script.calls.push(Call::Command(command.to_string()));
                script
                    .outputs
                    .get_mut(command)
                    .and_then(VecDeque::pop_front)
                    .unwrap_or_default()
            };
            if let Some((trigger, cancel)) = &self.cli.cancel_on {
                if trigger == command {
                    cancel.cancel();
                }
            }
            Ok(output)
        }

        async fn disconnect(&mut self) -> DeployResult<()> {
            self.cli.script.lock().unwrap().calls.push(Call::Disconnect);
            Ok(())
        }
    }

    fn record() -> DeviceRecord {
        let mut addresses = BTreeMap::new();
        addresses.insert(AddressFamily::V4, vec!["10.0.0.5".parse().unwrap()]);
        addresses.insert(AddressFamily::V6, vec!["2001:db8::5".parse().unwrap()]);
        DeviceRecord {
            id: "d1".to_string(),
            serial: "JN1234".to_string(),
            nodename: "sw-hall-a".to_string(),
            usecase: "access-switch_juniper_ex3300-48p".to_string(),
            addresses,
            rendered: Some("system { host-name sw-hall-a; }".to_string()),
            deploy: true,
            gateway: None,
        }
    }

    fn driver(cli: &FakeCli, dry_deploy: bool) -> SshCommitConfirmDriver {
        SshCommitConfirmDriver::new(
            Arc::new(cli.clone()),
            SshSettings {
                rollback_timeout_minutes: 3,
                dry_deploy,
            },
            DeployStats::new().unwrap(),
        )
    }

    const REAL_DIFF: &str = "[edit system]\n-  host-name old;\n+  host-name sw-hall-a;\n";

    #[tokio::test]
    async fn test_full_commit_confirm() {
        let cli = FakeCli::default().output("show | compare", REAL_DIFF);
        let outcome = driver(&cli, false)
            .deploy(&record(), &CancellationSignal::new())
            .await
            .unwrap();

        assert_eq!(outcome, DeployOutcome::Committed);
        let v4: IpAddr = "10.0.0.5".parse().unwrap();
        assert_eq!(
            cli.calls(),
            vec![
                Call::Connect(v4),
                Call::Upload(UPLOAD_PATH.to_string()),
                Call::ConfigMode,
                Call::Command("load override /var/tmp/swcfg-upload.cfg".to_string()),
                Call::Command("show | compare".to_string()),
                Call::Command("commit confirmed 3".to_string()),
                Call::Disconnect,
                Call::Connect(v4),
                Call::ConfigMode,
                Call::Command("commit".to_string()),
                Call::Disconnect,
            ]
        );
    }

    #[tokio::test]
    async fn test_banner_only_rolls_back() {
        let cli = FakeCli::default().output(
            "show | compare",
            "[edit system login]\n-  message \"a\";\n+  message \"b\";\n",
        );
        let outcome = driver(&cli, false)
            .deploy(&record(), &CancellationSignal::new())
            .await
            .unwrap();

        assert_eq!(outcome, DeployOutcome::BannerOnly);
        let commands = cli.commands();
        assert_eq!(commands.last().unwrap(), "rollback 0");
        assert!(!commands.iter().any(|c| c.starts_with("commit")));
        assert_eq!(cli.calls().last(), Some(&Call::Disconnect));
    }

    #[tokio::test]
    async fn test_banner_only_with_edit_context_rolls_back() {
        let cli = FakeCli::default().output(
            "show | compare",
            "[edit system login]\n-  message \"a\";\n+  message \"b\";\n\n[edit]",
        );
        let outcome = driver(&cli, false)
            .deploy(&record(), &CancellationSignal::new())
            .await
            .unwrap();

        assert_eq!(outcome, DeployOutcome::BannerOnly);
        assert!(!cli.commands().iter().any(|c| c.starts_with("commit")));
    }

    #[tokio::test]
    async fn test_address_fallback_to_v6() {
        let cli = FakeCli::default()
            .unreachable("10.0.0.5")
            .output("show | compare", REAL_DIFF);
        driver(&cli, false)
            .deploy(&record(), &CancellationSignal::new())
            .await
            .unwrap();

        let v6: IpAddr = "2001:db8::5".parse().unwrap();
        assert_eq!(cli.calls()[1], Call::Connect(v6));
    }

    #[tokio::test]
    async fn test_all_addresses_unreachable() {
        let cli = FakeCli::default()
            .unreachable("10.0.0.5")
            .unreachable("2001:db8::5");
        let err = driver(&cli, false)
            .deploy(&record(), &CancellationSignal::new())
            .await
            .unwrap_err();

        assert!(matches!(err, DeployError::Unreachable { ref addresses, .. } if addresses.len() == 2));
        assert_eq!(cli.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_reconnect_failure_sends_no_rollback() {
        let cli = FakeCli::default().output("show | compare", REAL_DIFF);
        cli.script.lock().unwrap().failing_connects_after = Some(1);

        let err = driver(&cli, false)
            .deploy(&record(), &CancellationSignal::new())
            .await
            .unwrap_err();

        assert!(matches!(err, DeployError::Unreachable { .. }));
        let commands = cli.commands();
        assert_eq!(commands.last().unwrap(), "commit confirmed 3");
        assert!(!commands.iter().any(|c| c.starts_with("rollback")));
    }

    #[tokio::test]
    async fn test_dry_deploy_skips_writes() {
        let cli = FakeCli::default().output("show | compare", REAL_DIFF);
        let outcome = driver(&cli, true)
            .deploy(&record(), &CancellationSignal::new())
            .await
            .unwrap();

        assert_eq!(outcome, DeployOutcome::DryRun);
        assert!(!cli.calls().iter().any(|c| matches!(c, Call::Upload(_))));
        assert_eq!(cli.commands(), vec!["show | compare".to_string()]);
    }

    #[tokio::test]
    async fn test_cancel_stops_further_commands() {
        let cancel = CancellationSignal::new();
        let mut cli = FakeCli::default().output("show | compare", REAL_DIFF);
        cli.cancel_on = Some(("show | compare".to_string(), cancel.clone()));

        let err = driver(&cli, false)
            .deploy(&record(), &cancel)
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert_eq!(cli.commands().last().unwrap(), "show | compare");
        assert_ne!(cli.calls().last(), Some(&Call::Disconnect));
    }

    #[tokio::test]
    async fn test_load_error_aborts() {
        let cli = FakeCli::default().output(
            "load override /var/tmp/swcfg-upload.cfg",
            "error: syntax error at 'interfacez'\nload complete (1 errors)",
        );
        let err = driver(&cli, false)
            .deploy(&record(), &CancellationSignal::new())
            .await
            .unwrap_err();

        assert!(matches!(err, DeployError::Command { .. }));
        assert!(!cli.commands().iter().any(|c| c == "show | compare"));
    }

    #[tokio::test]
    async fn test_record_without_text() {
        let cli = FakeCli::default();
        let mut record = record();
        record.rendered = None;
        let err = driver(&cli, false)
            .deploy(&record, &CancellationSignal::new())
            .await
            .unwrap_err();

        assert!(matches!(err, DeployError::Protocol { .. }));
        assert!(cli.calls().is_empty());
    }

    #[test]
    fn test_check_output() {
        assert!(check_output("commit", "commit complete").is_ok());
        let err = check_output("commit", "error: configuration check-out failed").unwrap_err();
        assert!(err.to_string().contains("check-out failed"));
    }
}
