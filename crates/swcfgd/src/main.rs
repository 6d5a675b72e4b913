//! swcfgd entry point.
//!
//! Loads the configuration, builds the driver registry and statistics, and
//! hands control to the reconciler until it finishes or a signal arrives.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use swcfg_common::{CancellationSignal, DeployConfig, DeployStats};
use swcfg_drivers::DriverRegistry;
use swcfgd::{arm_watchdog, FatalError, JsonFileSource, Reconciler, ReconcilerSettings, RunSummary};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Slack added to the shutdown bounds before the watchdog fires.
const WATCHDOG_SLACK: Duration = Duration::from_secs(5);

/// Switch configuration deployment daemon
#[derive(Parser, Debug)]
#[command(name = "swcfgd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (default: $XDG_CONFIG_HOME/swcfg/swcfgd.toml)
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Keep running and redeploy every cycle
    #[arg(short = 'd', long)]
    daemon: bool,

    /// Inspect devices without committing anything
    #[arg(long)]
    dry_deploy: bool,

    /// Do not contact devices at all
    #[arg(long)]
    no_deploy: bool,

    /// Deploy only these device ids (repeatable)
    #[arg(long = "device", value_name = "ID")]
    devices: Vec<String>,

    /// Directory for rendered configurations
    #[arg(short = 'o', long)]
    output_dir: Option<PathBuf>,

    /// Device records file
    #[arg(short = 'r', long)]
    records: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long)]
    log_level: Option<String>,
}

impl Args {
    /// Applies command line overrides on top of the file configuration.
    fn apply(&self, config: &mut DeployConfig) {
        config.daemon |= self.daemon;
        config.deploy.dry_deploy |= self.dry_deploy;
        config.deploy.no_deploy |= self.no_deploy;
        if !self.devices.is_empty() {
            config.devices = self.devices.clone();
        }
        if let Some(dir) = &self.output_dir {
            config.output_dir = dir.clone();
        }
        if let Some(path) = &self.records {
            config.records_path = path.clone();
        }
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    match run(args).await {
        Ok(summary) => {
            info!(
                spawned = summary.spawned,
                completed = summary.completed,
                cancelled = summary.cancelled,
                retired = summary.retired,
                "swcfgd: Exiting normally"
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            if let Some(FatalError::ShutdownStalled { remaining }) = e.downcast_ref::<FatalError>() {
                error!(remaining, "swcfgd: Shutdown stalled, terminating");
                std::process::exit(1);
            }
            let message = format!("{:#}", e);
            error!(error = %message, "swcfgd: Exiting with error");
            eprintln!("swcfgd: {}", message);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> anyhow::Result<RunSummary> {
    let path = args.config.clone().unwrap_or_else(DeployConfig::default_path);
    let mut config = DeployConfig::load_or_default(&path)
        .with_context(|| format!("Failed to load configuration {}", path.display()))?;
    args.apply(&mut config);

    init_logging(&config.log_level)?;
    config.validate().context("Invalid configuration")?;

    info!(
        config = %path.display(),
        daemon = config.daemon,
        dry_deploy = config.deploy.dry_deploy,
        no_deploy = config.deploy.no_deploy,
        "swcfgd: Starting"
    );

    let stats = DeployStats::new().context("Failed to register statistics")?;
    let drivers = DriverRegistry::from_config(&config, stats.clone());
    let source = Arc::new(JsonFileSource::new(config.records_path.clone()));

    let cancel = CancellationSignal::new();
    setup_signal_handlers(cancel.clone());
    setup_watchdog(
        cancel.clone(),
        config.shutdown_grace() + config.shutdown_hard() + WATCHDOG_SLACK,
    );

    let reconciler = Reconciler::new(
        ReconcilerSettings::from_config(&config),
        source,
        drivers,
        stats,
        cancel,
    );
    Ok(reconciler.run().await?)
}

/// Installs the global subscriber; `RUST_LOG` overrides `level`.
fn init_logging(level: &str) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level)
            .with_context(|| format!("Invalid log level '{}'", level))?,
    };

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber).context("Failed to set logger")?;
    Ok(())
}

/// Sets `cancel` on SIGINT or SIGTERM.
fn setup_signal_handlers(cancel: CancellationSignal) {
    tokio::spawn(async move {
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(e) => {
                    warn!(error = %e, "swcfgd: Cannot listen for SIGTERM");
                    std::future::pending::<()>().await;
                }
            }
        };

        tokio::select! {
            result = signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!(error = %e, "swcfgd: Cannot listen for SIGINT");
                    return;
                }
                info!("swcfgd: Received SIGINT");
            }
            () = terminate => info!("swcfgd: Received SIGTERM"),
        }
        cancel.cancel();
    });
}

/// Arms the hard-exit watchdog as soon as shutdown begins.
fn setup_watchdog(cancel: CancellationSignal, bound: Duration) {
    tokio::spawn(async move {
        cancel.cancelled().await;
        arm_watchdog(bound);
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides() {
        let args = Args::parse_from([
            "swcfgd",
            "--daemon",
            "--no-deploy",
            "--device",
            "d1",
            "--device",
            "d2",
            "--records",
            "/tmp/records.json",
        ]);
        let mut config = DeployConfig::default();
        args.apply(&mut config);

        assert!(config.daemon);
        assert!(config.deploy.no_deploy);
        assert!(!config.deploy.dry_deploy);
        assert_eq!(config.devices, vec!["d1".to_string(), "d2".to_string()]);
        assert_eq!(config.records_path, PathBuf::from("/tmp/records.json"));
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_defaults_keep_file_values() {
        let args = Args::parse_from(["swcfgd"]);
        let mut config = DeployConfig::default();
        config.devices = vec!["d9".to_string()];
        config.daemon = true;
        args.apply(&mut config);

        assert!(config.daemon);
        assert_eq!(config.devices, vec!["d9".to_string()]);
    }
}
