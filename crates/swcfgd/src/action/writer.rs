//! Persists rendered configurations to the output directory.

use std::io;
use std::path::{Path, PathBuf};

use swcfg_common::{DeviceRecord, DeviceRecords};
use tokio::fs;
use tokio::sync::mpsc;

/// File name prefix of every artifact the writer produces.
pub const ARTIFACT_PREFIX: &str = "config-";

/// Action worker writing `config-<serial>` plus a `config-<nodename>` link.
///
/// Batches arrive once per cycle. The writer ends when its channel closes;
/// any I/O error ends it with that error. A serial or node name that is not
/// a plain file name is logged and skipped for that record only.
pub struct Writer {
    output_dir: PathBuf,
    rx: mpsc::Receiver<DeviceRecords>,
}

impl Writer {
    /// Creates a writer fed by `rx`.
    pub fn new(output_dir: impl Into<PathBuf>, rx: mpsc::Receiver<DeviceRecords>) -> Self {
        Self {
            output_dir: output_dir.into(),
            rx,
        }
    }

    /// Consumes batches until the sending side is dropped.
    pub async fn run(mut self) -> io::Result<()> {
        fs::create_dir_all(&self.output_dir).await?;
        tracing::debug!(dir = %self.output_dir.display(), "Writer started");

        while let Some(batch) = self.rx.recv().await {
            let mut written = 0usize;
            for record in batch.values() {
                if !record.is_renderable() {
                    continue;
                }
                write_record(&self.output_dir, record).await?;
                written += 1;
            }
            tracing::debug!(written, "Wrote configuration batch");
        }

        tracing::debug!("Writer input closed");
        Ok(())
    }
}

/// Writes one record and refreshes its node name link.
async fn write_record(dir: &Path, record: &DeviceRecord) -> io::Result<()> {
    let Some(text) = record.rendered.as_deref() else {
        return Ok(());
    };

    if !is_plain_name(&record.serial) {
        tracing::warn!(device = %record.id, serial = %record.serial, "Serial is not a plain file name, not writing configuration");
        return Ok(());
    }

    let serial_name = format!("{}{}", ARTIFACT_PREFIX, record.serial);
    let target = dir.join(&serial_name);
    let tmp = dir.join(format!(".{}.tmp", serial_name));

    let mut contents = String::with_capacity(text.len() + 1);
    contents.push_str(text);
    contents.push('\n');
    fs::write(&tmp, contents).await?;
    fs::rename(&tmp, &target).await?;

    if record.nodename.is_empty() || record.nodename == record.serial {
        return Ok(());
    }
    if !is_plain_name(&record.nodename) {
        tracing::warn!(device = %record.id, nodename = %record.nodename, "Node name is not a plain file name, not linking");
        return Ok(());
    }
    let link = dir.join(format!("{}{}", ARTIFACT_PREFIX, record.nodename));
    update_link(&link, Path::new(&serial_name)).await
}

/// Returns true if `name` is usable as a single path component.
fn is_plain_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\\', '\0'])
}

/// Points `link` at the relative path `target`, replacing anything else there.
async fn update_link(link: &Path, target: &Path) -> io::Result<()> {
    match fs::symlink_metadata(link).await {
        Ok(meta) if meta.file_type().is_symlink() => {
            if fs::read_link(link).await? == target {
                return Ok(());
            }
        }
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    let file_name = link
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = link.with_file_name(format!(".{}.tmp", file_name));
    match fs::remove_file(&tmp).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    fs::symlink(target, &tmp).await?;
    fs::rename(&tmp, link).await?;
    tracing::debug!(link = %link.display(), target = %target.display(), "Updated node name link");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn record(id: &str, serial: &str, nodename: &str, text: Option<&str>) -> Arc<DeviceRecord> {
        Arc::new(DeviceRecord {
            id: id.to_string(),
            serial: serial.to_string(),
            nodename: nodename.to_string(),
            usecase: "access".to_string(),
            addresses: BTreeMap::new(),
            rendered: text.map(str::to_string),
            deploy: true,
            gateway: None,
        })
    }

    fn batch(records: Vec<Arc<DeviceRecord>>) -> DeviceRecords {
        records.into_iter().map(|r| (r.id.clone(), r)).collect()
    }

    async fn run_with(dir: &Path, batches: Vec<DeviceRecords>) -> io::Result<()> {
        let (tx, rx) = mpsc::channel(4);
        let writer = tokio::spawn(Writer::new(dir, rx).run());
        for b in batches {
            tx.send(b).await.unwrap();
        }
        drop(tx);
        writer.await.unwrap()
    }

    #[tokio::test]
    async fn test_writes_artifact_and_link() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("configs");

        run_with(&dir, vec![batch(vec![record("d1", "SN1", "sw-1", Some("system {}"))])])
            .await
            .unwrap();

        let written = std::fs::read_to_string(dir.join("config-SN1")).unwrap();
        assert_eq!(written, "system {}\n");
        assert_eq!(
            std::fs::read_link(dir.join("config-sw-1")).unwrap(),
            PathBuf::from("config-SN1")
        );
        assert_eq!(
            std::fs::read_to_string(dir.join("config-sw-1")).unwrap(),
            "system {}\n"
        );
    }

    #[tokio::test]
    async fn test_stale_link_is_replaced() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path();

        run_with(
            dir,
            vec![
                batch(vec![record("d1", "SN1", "sw-1", Some("a"))]),
                // Hardware swap, same node name
                batch(vec![record("d1", "SN2", "sw-1", Some("b"))]),
            ],
        )
        .await
        .unwrap();

        assert_eq!(
            std::fs::read_link(dir.join("config-sw-1")).unwrap(),
            PathBuf::from("config-SN2")
        );
        assert_eq!(std::fs::read_to_string(dir.join("config-SN1")).unwrap(), "a\n");
    }

    #[tokio::test]
    async fn test_regular_file_at_link_path_is_replaced() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("config-sw-1"), "old").unwrap();

        run_with(tmp.path(), vec![batch(vec![record("d1", "SN1", "sw-1", Some("a"))])])
            .await
            .unwrap();

        let meta = std::fs::symlink_metadata(tmp.path().join("config-sw-1")).unwrap();
        assert!(meta.file_type().is_symlink());
    }

    #[tokio::test]
    async fn test_unrendered_records_are_skipped() {
        let tmp = TempDir::new().unwrap();

        run_with(tmp.path(), vec![batch(vec![record("d1", "SN1", "sw-1", None)])])
            .await
            .unwrap();

        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_plain_name() {
        assert!(is_plain_name("SN1"));
        assert!(is_plain_name("sw-hall-a.noc"));
        assert!(!is_plain_name(""));
        assert!(!is_plain_name(".."));
        assert!(!is_plain_name("../etc/passwd"));
        assert!(!is_plain_name("a/b"));
    }

    #[tokio::test]
    async fn test_unsafe_names_are_skipped() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("configs");

        run_with(
            &dir,
            vec![batch(vec![
                record("d1", "../../escaped", "sw-1", Some("a")),
                record("d2", "SN2", "../sw-2", Some("b")),
                record("d3", "SN3", "sw-3", Some("c")),
            ])],
        )
        .await
        .unwrap();

        assert!(!tmp.path().join("escaped").exists());
        assert!(!tmp.path().join("config-..").exists());
        assert_eq!(std::fs::read_to_string(dir.join("config-SN2")).unwrap(), "b\n");
        assert!(std::fs::symlink_metadata(tmp.path().join("sw-2")).is_err());
        assert_eq!(std::fs::read_to_string(dir.join("config-sw-3")).unwrap(), "c\n");

        let mut names: Vec<String> = std::fs::read_dir(&dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["config-SN2", "config-SN3", "config-sw-3"]);
    }

    #[tokio::test]
    async fn test_io_error_ends_writer() {
        let tmp = TempDir::new().unwrap();
        let blocker = tmp.path().join("file");
        std::fs::write(&blocker, "").unwrap();

        let result = run_with(&blocker.join("configs"), vec![]).await;
        assert!(result.is_err());
    }
}
