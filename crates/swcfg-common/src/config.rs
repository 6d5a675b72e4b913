//! Configuration file support for swcfgd.
//!
//! Loads and validates the deployer configuration from a TOML file.
//! Default location: `$XDG_CONFIG_HOME/swcfg/swcfgd.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

/// Deployment protocol a driver key maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DriverKind {
    /// Upload, `commit confirmed`, reconnect, confirm (Junos CLI over SSH).
    SshCommitConfirm,
    /// Revision based HTTP API (NVUE).
    RestRevision,
}

impl DriverKind {
    /// Returns the kind as written in the configuration file.
    pub fn as_str(&self) -> &'static str {
        match self {
            DriverKind::SshCommitConfirm => "ssh-commit-confirm",
            DriverKind::RestRevision => "rest-revision",
        }
    }
}

/// Device access settings shared by both protocols.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploySection {
    /// Login user on the devices.
    #[serde(default = "default_user")]
    pub user: String,

    /// Private key used for SSH logins.
    #[serde(default = "default_key")]
    pub key: PathBuf,

    /// Minutes before a device reverts an unconfirmed commit.
    #[serde(default = "default_rollback_timeout")]
    pub rollback_timeout_minutes: u64,

    /// Talk to devices but skip every irreversible write.
    #[serde(default)]
    pub dry_deploy: bool,

    /// Do not contact devices at all.
    #[serde(default)]
    pub no_deploy: bool,

    /// Per-address connection timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

/// Settings for the revision based REST API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestSection {
    /// HTTPS port of the API.
    #[serde(default = "default_rest_port")]
    pub port: u16,

    /// API password. Only accepted from the configuration file.
    #[serde(default)]
    pub password: String,

    /// DNS suffix appended to the node name for TLS host verification.
    #[serde(default)]
    pub dns_parent: String,
}

/// Reconciler pacing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingSection {
    /// Pause between daemon cycles in seconds.
    #[serde(default = "default_cycle_interval")]
    pub cycle_interval_secs: u64,

    /// Mailbox wait slice in milliseconds.
    #[serde(default = "default_mailbox_poll")]
    pub mailbox_poll_ms: u64,

    /// How long a new worker may take to acknowledge its start.
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
}

/// Shutdown bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownSection {
    /// Primary window for workers to finish after cancellation.
    #[serde(default = "default_grace")]
    pub grace_secs: u64,

    /// Additional bound before the process is force-terminated.
    #[serde(default = "default_hard")]
    pub hard_secs: u64,
}

/// Artifact retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanerSection {
    /// Seconds between purge passes.
    #[serde(default = "default_cleaner_interval")]
    pub interval_secs: u64,

    /// Artifacts older than this many hours are removed.
    #[serde(default = "default_max_age_hours")]
    pub max_age_hours: u64,
}

/// Statistics output.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSection {
    /// Prometheus text file rewritten after every cycle.
    #[serde(default)]
    pub textfile: Option<PathBuf>,
}

/// Complete swcfgd configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployConfig {
    /// Directory receiving rendered configuration artifacts.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// JSON file with the device records of the current inventory.
    #[serde(default = "default_records_path")]
    pub records_path: PathBuf,

    /// Directory for device session transcripts.
    #[serde(default)]
    pub session_log_dir: Option<PathBuf>,

    /// Keep reconciling instead of running a single pass.
    #[serde(default)]
    pub daemon: bool,

    /// Explicit allow-list; when non-empty it replaces the eligibility rule.
    #[serde(default)]
    pub devices: Vec<String>,

    /// Log verbosity (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Device access settings.
    #[serde(default)]
    pub deploy: DeploySection,

    /// REST API settings.
    #[serde(default)]
    pub rest: RestSection,

    /// Driver key to protocol table.
    #[serde(default = "default_drivers")]
    pub drivers: BTreeMap<String, DriverKind>,

    /// Reconciler pacing.
    #[serde(default)]
    pub timing: TimingSection,

    /// Shutdown bounds.
    #[serde(default)]
    pub shutdown: ShutdownSection,

    /// Artifact retention.
    #[serde(default)]
    pub cleaner: CleanerSection,

    /// Statistics output.
    #[serde(default)]
    pub metrics: MetricsSection,
}

// Default functions
fn default_user() -> String {
    "swcfg".to_string()
}

fn default_key() -> PathBuf {
    PathBuf::from("/etc/swcfg/id_ed25519")
}

fn default_rollback_timeout() -> u64 {
    3
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_rest_port() -> u16 {
    8765
}

fn default_cycle_interval() -> u64 {
    60
}

fn default_mailbox_poll() -> u64 {
    1000
}

fn default_handshake_timeout() -> u64 {
    5
}

fn default_grace() -> u64 {
    180
}

fn default_hard() -> u64 {
    60
}

fn default_cleaner_interval() -> u64 {
    3600
}

fn default_max_age_hours() -> u64 {
    24 * 7
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("/var/lib/swcfg/configs")
}

fn default_records_path() -> PathBuf {
    PathBuf::from("/var/lib/swcfg/records.json")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_drivers() -> BTreeMap<String, DriverKind> {
    [
        (
            "access-switch_juniper_ex3300-24t",
            DriverKind::SshCommitConfirm,
        ),
        (
            "access-switch_juniper_ex3300-48p",
            DriverKind::SshCommitConfirm,
        ),
        ("core-switch_mellanox_sn2410", DriverKind::RestRevision),
    ]
    .into_iter()
    .map(|(usecase, kind)| (usecase.to_string(), kind))
    .collect()
}

// Default implementations
impl Default for DeploySection {
    fn default() -> Self {
        Self {
            user: default_user(),
            key: default_key(),
            rollback_timeout_minutes: default_rollback_timeout(),
            dry_deploy: false,
            no_deploy: false,
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl Default for RestSection {
    fn default() -> Self {
        Self {
            port: default_rest_port(),
            password: String::new(),
            dns_parent: String::new(),
        }
    }
}

impl Default for TimingSection {
    fn default() -> Self {
        Self {
            cycle_interval_secs: default_cycle_interval(),
            mailbox_poll_ms: default_mailbox_poll(),
            handshake_timeout_secs: default_handshake_timeout(),
        }
    }
}

impl Default for ShutdownSection {
    fn default() -> Self {
        Self {
            grace_secs: default_grace(),
            hard_secs: default_hard(),
        }
    }
}

impl Default for CleanerSection {
    fn default() -> Self {
        Self {
            interval_secs: default_cleaner_interval(),
            max_age_hours: default_max_age_hours(),
        }
    }
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            records_path: default_records_path(),
            session_log_dir: None,
            daemon: false,
            devices: Vec::new(),
            log_level: default_log_level(),
            deploy: DeploySection::default(),
            rest: RestSection::default(),
            drivers: default_drivers(),
            timing: TimingSection::default(),
            shutdown: ShutdownSection::default(),
            cleaner: CleanerSection::default(),
            metrics: MetricsSection::default(),
        }
    }
}

impl DeployConfig {
    /// Load configuration from file, falling back to defaults if file not found
    pub fn load_or_default(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();

        match fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content).map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                message: e.to_string(),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "Config file not found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(ConfigError::Read {
                path: path.to_path_buf(),
                source: e,
            }),
        }
    }

    /// Returns the default configuration file location.
    pub fn default_path() -> PathBuf {
        let config_home = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))
            .unwrap_or_else(|| PathBuf::from("/etc"));
        config_home.join("swcfg").join("swcfgd.toml")
    }

    /// Rollback timeout as Duration
    pub fn rollback_timeout(&self) -> Duration {
        Duration::from_secs(self.deploy.rollback_timeout_minutes * 60)
    }

    /// Connection timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.deploy.connect_timeout_secs)
    }

    /// Pause between daemon cycles
    pub fn cycle_interval(&self) -> Duration {
        Duration::from_secs(self.timing.cycle_interval_secs)
    }

    /// Mailbox wait slice
    pub fn mailbox_poll(&self) -> Duration {
        Duration::from_millis(self.timing.mailbox_poll_ms)
    }

    /// Worker start handshake bound
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.timing.handshake_timeout_secs)
    }

    /// Primary shutdown window
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown.grace_secs)
    }

    /// Second shutdown bound
    pub fn shutdown_hard(&self) -> Duration {
        Duration::from_secs(self.shutdown.hard_secs)
    }

    /// Returns the explicit allow-list, if one is configured.
    pub fn allowlist(&self) -> Option<&[String]> {
        if self.devices.is_empty() {
            None
        } else {
            Some(&self.devices)
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.deploy.rollback_timeout_minutes == 0 {
            return Err(ConfigError::invalid(
                "deploy.rollback_timeout_minutes",
                "must be > 0",
            ));
        }

        if self.deploy.connect_timeout_secs == 0 {
            return Err(ConfigError::invalid(
                "deploy.connect_timeout_secs",
                "must be > 0",
            ));
        }

        if self.rest.port == 0 {
            return Err(ConfigError::invalid("rest.port", "must be > 0"));
        }

        let uses_rest = self
            .drivers
            .values()
            .any(|kind| *kind == DriverKind::RestRevision);
        if uses_rest && !self.deploy.no_deploy && self.rest.dns_parent.is_empty() {
            return Err(ConfigError::invalid(
                "rest.dns_parent",
                "required when a rest-revision driver is configured",
            ));
        }

        if self.timing.mailbox_poll_ms == 0 {
            return Err(ConfigError::invalid("timing.mailbox_poll_ms", "must be > 0"));
        }

        if self.timing.handshake_timeout_secs == 0 {
            return Err(ConfigError::invalid(
                "timing.handshake_timeout_secs",
                "must be > 0",
            ));
        }

        if self.cleaner.interval_secs == 0 {
            return Err(ConfigError::invalid("cleaner.interval_secs", "must be > 0"));
        }

        Ok(())
    }
}
