//! Periodic purge of aged artifacts and session logs.

use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use swcfg_common::CancellationSignal;
use tokio::fs;

use super::writer::ARTIFACT_PREFIX;

/// What a single purge removed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PurgeReport {
    /// Aged `config-*` files and session logs.
    pub expired: usize,
    /// `config-*` links whose target is gone.
    pub dangling: usize,
}

/// Action worker removing old files until cancelled.
pub struct Cleaner {
    output_dir: PathBuf,
    session_log_dir: Option<PathBuf>,
    interval: Duration,
    max_age: Duration,
    cancel: CancellationSignal,
}

impl Cleaner {
    /// Creates a cleaner for the given directories.
    pub fn new(
        output_dir: impl Into<PathBuf>,
        session_log_dir: Option<PathBuf>,
        interval: Duration,
        max_age: Duration,
        cancel: CancellationSignal,
    ) -> Self {
        Self {
            output_dir: output_dir.into(),
            session_log_dir,
            interval,
            max_age,
            cancel,
        }
    }

    /// Purges now and then once per interval until cancelled.
    pub async fn run(self) -> io::Result<()> {
        loop {
            let report = self.purge().await?;
            if report != PurgeReport::default() {
                tracing::info!(
                    expired = report.expired,
                    dangling = report.dangling,
                    "Purged old artifacts"
                );
            }
            if self.cancel.sleep(self.interval).await.is_err() {
                tracing::debug!("Cleaner stopping");
                return Ok(());
            }
        }
    }

    /// Runs one purge pass over both directories.
    pub async fn purge(&self) -> io::Result<PurgeReport> {
        let cutoff = SystemTime::now()
            .checked_sub(self.max_age)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let mut report = PurgeReport::default();

        purge_dir(&self.output_dir, cutoff, true, &mut report).await?;
        if let Some(dir) = &self.session_log_dir {
            purge_dir(dir, cutoff, false, &mut report).await?;
        }
        Ok(report)
    }
}

async fn purge_dir(
    dir: &Path,
    cutoff: SystemTime,
    artifacts_only: bool,
    report: &mut PurgeReport,
) -> io::Result<()> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };

    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if artifacts_only && !name.starts_with(ARTIFACT_PREFIX) {
            continue;
        }

        let path = entry.path();
        match purge_entry(&path, cutoff).await {
            Ok(Some(Removed::Expired)) => report.expired += 1,
            Ok(Some(Removed::Dangling)) => report.dangling += 1,
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to purge file");
            }
        }
    }
    Ok(())
}

enum Removed {
    Expired,
    Dangling,
}

async fn purge_entry(path: &Path, cutoff: SystemTime) -> io::Result<Option<Removed>> {
    let meta = fs::symlink_metadata(path).await?;
    let file_type = meta.file_type();

    if file_type.is_symlink() {
        // metadata() follows the link
        return match fs::metadata(path).await {
            Ok(_) => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                fs::remove_file(path).await?;
                tracing::debug!(path = %path.display(), "Removed dangling link");
                Ok(Some(Removed::Dangling))
            }
            Err(e) => Err(e),
        };
    }

    if file_type.is_file() && meta.modified()? < cutoff {
        fs::remove_file(path).await?;
        tracing::debug!(path = %path.display(), "Removed expired file");
        return Ok(Some(Removed::Expired));
    }
    Ok(None)
}
