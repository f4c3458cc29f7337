use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use sweepcore::analysis::AnalyzerConfig;
use sweepcore::math::geo::GeoPoint;
use sweepcore::processing::AggregatorConfig;
use sweepcore::store::{JournalEngine, MemoryEngine, SpatialSignalStore};
use sweepcore::sweep::{CommandBackend, FrequencyTarget, HackRfBackend, ManagerConfig, SweepBackend};

/// Which program produces the sweep lines.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    Hackrf(HackRfBackend),
    Command(CommandBackend),
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Hackrf(HackRfBackend::default())
    }
}

impl BackendConfig {
    pub fn build(&self) -> Arc<dyn SweepBackend> {
        match self {
            BackendConfig::Hackrf(backend) => Arc::new(backend.clone()),
            BackendConfig::Command(backend) => Arc::new(backend.clone()),
        }
    }

    /// This binary's own `emit` subcommand, tuned by the manager's placeholders.
    pub fn emulator() -> anyhow::Result<Self> {
        let program = std::env::current_exe().context("locating simulator executable")?;
        let args = [
            "emit",
            "--start-mhz",
            "{start_mhz}",
            "--end-mhz",
            "{end_mhz}",
            "--bin-width-hz",
            "{bin_width_hz}",
        ]
        .iter()
        .map(|arg| arg.to_string())
        .collect::<Vec<_>>();
        let probe = vec![
            "emit".to_string(),
            "--sweeps".to_string(),
            "1".to_string(),
        ];
        Ok(BackendConfig::Command(
            CommandBackend::new(program, args).with_probe_args(probe),
        ))
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Append-only journal; an in-memory store is used when absent.
    pub journal: Option<PathBuf>,
    /// Signals older than this are removed after each run.
    pub retention_minutes: Option<i64>,
}

impl StoreConfig {
    pub fn open(&self) -> anyhow::Result<SpatialSignalStore> {
        match &self.journal {
            Some(path) => {
                let history = if path.exists() {
                    JournalEngine::load(path)
                        .with_context(|| format!("replaying journal {}", path.display()))?
                } else {
                    Vec::new()
                };
                let engine = JournalEngine::open(path)
                    .with_context(|| format!("opening journal {}", path.display()))?;
                Ok(SpatialSignalStore::restore(Box::new(engine), &history))
            }
            None => Ok(SpatialSignalStore::new(Box::new(MemoryEngine))),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    pub backend: BackendConfig,
    /// Target frequencies in MHz, dwelt on in order.
    pub frequencies: Vec<f64>,
    pub dwell_ms: u64,
    /// Persist open detections this often while running.
    pub persist_interval_ms: u64,
    pub run_seconds: u64,
    /// Where the receiver sits; detections are stored at this position.
    pub observer: GeoPoint,
    pub manager: ManagerConfig,
    pub aggregator: AggregatorConfig,
    pub store: StoreConfig,
    pub analyzer: AnalyzerConfig,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            backend: BackendConfig::default(),
            frequencies: vec![433.92],
            dwell_ms: 5_000,
            persist_interval_ms: 1_000,
            run_seconds: 10,
            observer: GeoPoint::new(51.5007, -0.1246),
            manager: ManagerConfig::default(),
            aggregator: AggregatorConfig::default(),
            store: StoreConfig::default(),
            analyzer: AnalyzerConfig::default(),
        }
    }
}

impl WorkflowConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path_ref = path.as_ref();
        let contents = fs::read_to_string(path_ref)
            .with_context(|| format!("reading workflow config {}", path_ref.display()))?;
        let config: WorkflowConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("parsing workflow config {}", path_ref.display()))?;
        Ok(config)
    }

    pub fn from_args(
        frequencies: Vec<f64>,
        dwell_ms: u64,
        run_seconds: u64,
        emulate: bool,
    ) -> anyhow::Result<Self> {
        let mut config = Self {
            dwell_ms,
            run_seconds,
            ..Default::default()
        };
        if !frequencies.is_empty() {
            config.frequencies = frequencies;
        }
        if emulate {
            config.backend = BackendConfig::emulator()?;
        }
        Ok(config)
    }

    pub fn targets(&self) -> Vec<FrequencyTarget> {
        self.frequencies
            .iter()
            .copied()
            .map(FrequencyTarget::mhz)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn config_from_args_keeps_defaults() {
        let cfg = WorkflowConfig::from_args(vec![915.0, 868.1], 2_000, 30, false).unwrap();
        assert_eq!(cfg.targets().len(), 2);
        assert_eq!(cfg.targets()[1].value, 868.1);
        assert!(matches!(cfg.backend, BackendConfig::Hackrf(_)));
        assert_eq!(cfg.aggregator.tolerance_mhz, 0.5);
    }

    #[test]
    fn config_load_reads_yaml() {
        let mut temp = NamedTempFile::new().unwrap();
        temp.write_all(
            b"backend:\n  kind: command\n  program: /bin/cat\n  args: [\"{start_mhz}\"]\nfrequencies: [2437.0]\ndwell_ms: 750\nmanager:\n  span_mhz: 10.0\nstore:\n  retention_minutes: 60\n",
        )
        .unwrap();
        let path = temp.into_temp_path();
        let cfg = WorkflowConfig::load(&path).unwrap();
        assert_eq!(cfg.frequencies, vec![2437.0]);
        assert_eq!(cfg.dwell_ms, 750);
        assert_eq!(cfg.manager.span_mhz, 10.0);
        assert_eq!(cfg.manager.bin_width_hz, 100_000);
        assert_eq!(cfg.store.retention_minutes, Some(60));
        match cfg.backend {
            BackendConfig::Command(backend) => assert_eq!(backend.args, vec!["{start_mhz}"]),
            other => panic!("unexpected backend {:?}", other),
        }
    }

    #[test]
    fn journal_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let store_config = StoreConfig {
            journal: Some(dir.path().join("signals.jsonl")),
            retention_minutes: None,
        };
        {
            let store = store_config.open().unwrap();
            store
                .store_signal(sweepcore::records::SignalObservation::new(
                    chrono::Utc::now(),
                    1.0,
                    1.0,
                    -50.0,
                    433.9,
                    "hackrf_sweep",
                ))
                .unwrap();
        }
        let store = store_config.open().unwrap();
        assert_eq!(store.statistics(None).unwrap().total_signals, 1);
    }
}
