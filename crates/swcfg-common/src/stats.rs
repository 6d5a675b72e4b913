//! Prometheus deployment timestamps.
//!
//! Every gauge holds the UNIX time at which a step last happened for a
//! device. The registry is private to [`DeployStats`] and exported either
//! by rendering it or by rewriting a node-exporter textfile.

use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;

use prometheus::{Encoder, Gauge, GaugeVec, Opts, Registry, TextEncoder};

/// Step of a deployment attempt that is stamped per device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatKind {
    /// A connection to the device was attempted.
    Contact,
    /// The device answered.
    Answer,
    /// New configuration was sent.
    Update,
    /// A commit was requested.
    Commit,
    /// The commit was confirmed.
    Confirm,
}

impl StatKind {
    /// All kinds in deployment order.
    pub const ALL: [StatKind; 5] = [
        StatKind::Contact,
        StatKind::Answer,
        StatKind::Update,
        StatKind::Commit,
        StatKind::Confirm,
    ];

    /// Returns the lowercase step name.
    pub fn as_str(&self) -> &'static str {
        match self {
            StatKind::Contact => "contact",
            StatKind::Answer => "answer",
            StatKind::Update => "update",
            StatKind::Commit => "commit",
            StatKind::Confirm => "confirm",
        }
    }

    fn index(&self) -> usize {
        match self {
            StatKind::Contact => 0,
            StatKind::Answer => 1,
            StatKind::Update => 2,
            StatKind::Commit => 3,
            StatKind::Confirm => 4,
        }
    }
}

/// Per-device deployment timestamps. Cheap to clone.
#[derive(Clone)]
pub struct DeployStats {
    steps: [GaugeVec; 5],
    fetch: Gauge,
    registry: Arc<Registry>,
}

impl std::fmt::Debug for DeployStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeployStats").finish_non_exhaustive()
    }
}

fn now_unix() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

impl DeployStats {
    /// Creates the gauges in a fresh registry.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let make_step = |kind: StatKind| -> Result<GaugeVec, prometheus::Error> {
            let gauge = GaugeVec::new(
                Opts::new(
                    format!("swcfg_{}", kind.as_str()),
                    format!(
                        "Last time {} has been performed on a given device",
                        kind.as_str()
                    ),
                ),
                &["device"],
            )?;
            registry.register(Box::new(gauge.clone()))?;
            Ok(gauge)
        };

        let steps = [
            make_step(StatKind::Contact)?,
            make_step(StatKind::Answer)?,
            make_step(StatKind::Update)?,
            make_step(StatKind::Commit)?,
            make_step(StatKind::Confirm)?,
        ];

        let fetch = Gauge::with_opts(Opts::new(
            "swcfg_fetch",
            "Last time device records have been fetched",
        ))?;
        registry.register(Box::new(fetch.clone()))?;

        Ok(Self {
            steps,
            fetch,
            registry: Arc::new(registry),
        })
    }

    /// Stamps `kind` for `device` with the current time.
    pub fn update(&self, device: &str, kind: StatKind) {
        self.steps[kind.index()]
            .with_label_values(&[device])
            .set(now_unix());
    }

    /// Stamps the record fetch with the current time.
    pub fn set_fetch(&self) {
        self.fetch.set(now_unix());
    }

    /// Returns the stamp of `kind` for `device`, or 0 if never set.
    pub fn get(&self, device: &str, kind: StatKind) -> f64 {
        self.steps[kind.index()]
            .get_metric_with_label_values(&[device])
            .map(|gauge| gauge.get())
            .unwrap_or(0.0)
    }

    /// Returns the fetch stamp, or 0 if never set.
    pub fn fetch(&self) -> f64 {
        self.fetch.get()
    }

    /// Renders the registry in the Prometheus text exposition format.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    /// Atomically rewrites `path` with the rendered registry.
    pub fn write_textfile(&self, path: &Path) -> io::Result<()> {
        let body = self
            .render()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;

        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        fs::write(&tmp, body)?;
        fs::rename(&tmp, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unset_is_zero() {
        let stats = DeployStats::new().unwrap();
        assert_eq!(stats.get("d1", StatKind::Commit), 0.0);
        assert_eq!(stats.fetch(), 0.0);
    }

    #[test]
    fn test_update_stamps_current_time() {
        let stats = DeployStats::new().unwrap();
        let before = now_unix();
        stats.update("d1", StatKind::Contact);

        assert!(stats.get("d1", StatKind::Contact) >= before);
        assert_eq!(stats.get("d1", StatKind::Answer), 0.0);
        assert_eq!(stats.get("d2", StatKind::Contact), 0.0);
    }

    #[test]
    fn test_independent_registries() {
        // A second instance must not collide with the first
        let a = DeployStats::new().unwrap();
        let b = DeployStats::new().unwrap();
        a.set_fetch();
        assert_eq!(b.fetch(), 0.0);
    }

    #[test]
    fn test_render() {
        let stats = DeployStats::new().unwrap();
        stats.update("sw-1", StatKind::Confirm);
        stats.set_fetch();

        let text = stats.render().unwrap();
        assert!(text.contains("swcfg_confirm{device=\"sw-1\"}"));
        assert!(text.contains("# TYPE swcfg_fetch gauge"));
    }

    #[test]
    fn test_write_textfile() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("swcfg.prom");
        let stats = DeployStats::new().unwrap();
        stats.update("sw-1", StatKind::Update);

        stats.write_textfile(&path).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("swcfg_update"));
        assert!(!dir.path().join("swcfg.prom.tmp").exists());
    }
}
