use crate::workflow::config::WorkflowConfig;
use anyhow::{anyhow, Context};
use chrono::Duration as ChronoDuration;
use log::{debug, info, warn};
use serde::Serialize;
use serde_json::json;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use sweepcore::analysis::{
    AreaOfInterest, FlightAnalysis, FlightPathAnalyzer, FlightPoint, SignalCapture,
};
use sweepcore::processing::SignalAggregator;
use sweepcore::records::{SignalObservation, SignalRecord, SpectrumFrame};
use sweepcore::store::{CleanupReport, RadiusQuery, SpatialSignalStore, StoreStatistics};
use sweepcore::sweep::{
    DeviceLock, FrequencyTarget, HealthResult, SweepEvent, SweepFault, SweepManager, SweepState,
    SweepStatus, Subscription,
};
use sweepcore::telemetry::Metrics;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};

/// Counters kept by the ingest task.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestStats {
    pub frames: u64,
    pub detections_stored: u64,
    pub faults: Vec<SweepFault>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub final_state: SweepState,
    pub ingest: IngestStats,
    pub sweep_metrics: Metrics,
    pub store_metrics: Metrics,
    pub statistics: StoreStatistics,
    pub retention: Option<CleanupReport>,
}

/// Wires the sweep manager, aggregator, store and analyzer into one workflow.
pub struct Runner {
    config: WorkflowConfig,
    manager: SweepManager,
    store: SpatialSignalStore,
    aggregator: Mutex<SignalAggregator>,
    analyzer: FlightPathAnalyzer,
    stats: Mutex<IngestStats>,
    ingest: Mutex<Option<JoinHandle<()>>>,
    source: String,
}

fn locked<'a, T>(mutex: &'a Mutex<T>, what: &str) -> anyhow::Result<MutexGuard<'a, T>> {
    mutex.lock().map_err(|_| anyhow!("{} lock poisoned", what))
}

impl Runner {
    pub fn new(config: WorkflowConfig) -> anyhow::Result<Self> {
        let backend = config.backend.build();
        let source = backend.name().to_string();
        let manager = SweepManager::new(config.manager.clone(), backend, DeviceLock::new())
            .context("building sweep manager")?;
        let store = config.store.open()?;
        let aggregator = SignalAggregator::new(config.aggregator.clone())
            .context("building signal aggregator")?;
        let analyzer = FlightPathAnalyzer::new(config.analyzer.clone())
            .context("building flight analyzer")?;
        Ok(Self {
            config,
            manager,
            store,
            aggregator: Mutex::new(aggregator),
            analyzer,
            stats: Mutex::new(IngestStats::default()),
            ingest: Mutex::new(None),
            source,
        })
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    pub fn status(&self) -> SweepStatus {
        self.manager.status()
    }

    pub fn sweep_metrics(&self) -> Metrics {
        self.manager.metrics()
    }

    pub fn store_metrics(&self) -> Metrics {
        self.store.metrics()
    }

    pub fn ingest_stats(&self) -> anyhow::Result<IngestStats> {
        Ok(locked(&self.stats, "ingest stats")?.clone())
    }

    pub async fn health(&self) -> HealthResult {
        self.manager.check_health().await
    }

    /// Starts a cycle and the task feeding its frames into the aggregator.
    /// Returns `false` when the manager was not idle.
    pub async fn start(
        self: &Arc<Self>,
        targets: Vec<FrequencyTarget>,
        dwell_ms: u64,
    ) -> anyhow::Result<bool> {
        let events = self.manager.subscribe();
        let started = self
            .manager
            .start_cycle(targets, dwell_ms)
            .await
            .context("starting sweep cycle")?;
        if !started {
            info!("start ignored; manager is {}", self.manager.status().state);
            return Ok(false);
        }

        let runner = Arc::clone(self);
        let task = tokio::spawn(async move { runner.ingest(events).await });
        if let Some(previous) = locked(&self.ingest, "ingest task")?.replace(task) {
            previous.abort();
        }
        Ok(true)
    }

    /// Stops the sweep, then waits for the ingest task to persist what it holds.
    pub async fn stop(&self) -> anyhow::Result<()> {
        self.manager.stop_sweep().await.context("stopping sweep")?;
        let task = locked(&self.ingest, "ingest task")?.take();
        if let Some(task) = task {
            self.join_ingest(task).await;
        }
        Ok(())
    }

    /// Forces the manager back to idle from any state.
    pub async fn cleanup(&self) -> anyhow::Result<()> {
        self.manager.force_cleanup().await;
        let task = locked(&self.ingest, "ingest task")?.take();
        if let Some(task) = task {
            task.abort();
        }
        locked(&self.aggregator, "aggregator")?.flush();
        Ok(())
    }

    /// Runs the configured cycle for `duration`, or until the session fails.
    pub async fn run_for(self: &Arc<Self>, duration: Duration) -> anyhow::Result<RunSummary> {
        let started = self
            .start(self.config.targets(), self.config.dwell_ms)
            .await?;
        if !started {
            return Err(anyhow!(
                "sweep manager is {}, not idle",
                self.manager.status().state
            ));
        }

        let task = locked(&self.ingest, "ingest task")?.take();
        if let Some(mut task) = task {
            if timeout(duration, &mut task).await.is_err() {
                self.manager.stop_sweep().await.context("stopping sweep")?;
                self.join_ingest(task).await;
            } else {
                warn!("sweep session ended early in state {}", self.manager.status().state);
            }
        }

        let retention = self.apply_retention()?;
        Ok(RunSummary {
            final_state: self.manager.status().state,
            ingest: self.ingest_stats()?,
            sweep_metrics: self.manager.metrics(),
            store_metrics: self.store.metrics(),
            statistics: self.store.statistics(None).context("reading store statistics")?,
            retention,
        })
    }

    async fn join_ingest(&self, mut task: JoinHandle<()>) {
        let limit = Duration::from_millis(self.config.manager.stop_timeout_ms.max(1));
        if timeout(limit, &mut task).await.is_err() {
            warn!("ingest task did not finish within {:?}; aborting", limit);
            task.abort();
        }
    }

    async fn ingest(&self, mut events: Subscription) {
        let period = Duration::from_millis(self.config.persist_interval_ms.max(1));
        let mut persist = interval(period);
        persist.set_missed_tick_behavior(MissedTickBehavior::Delay);
        persist.tick().await;

        loop {
            tokio::select! {
                _ = persist.tick() => self.persist_or_warn(),
                event = events.recv() => {
                    let Some(event) = event else { break };
                    if !self.handle_event(event) {
                        break;
                    }
                }
            }
        }
        self.persist_or_warn();
        debug!("ingest task finished");
    }

    /// Returns false once the session is over.
    fn handle_event(&self, event: SweepEvent) -> bool {
        match event {
            SweepEvent::Spectrum(frame) => {
                if let Err(err) = self.absorb(&frame) {
                    warn!("dropping frame: {:#}", err);
                }
                true
            }
            SweepEvent::Error(fault) => {
                warn!("sweep fault {:?}: {}", fault.kind, fault.message);
                if let Ok(mut stats) = self.stats.lock() {
                    stats.faults.push(fault);
                }
                // A session fault is published right after the switch to Error.
                self.manager.status().state != SweepState::Error
            }
            SweepEvent::StatusChange(change) => {
                debug!("sweep {} -> {}", change.from, change.to);
                change.to != SweepState::Idle
            }
            SweepEvent::Status(_) | SweepEvent::CycleConfig(_) => true,
        }
    }

    fn absorb(&self, frame: &SpectrumFrame) -> anyhow::Result<()> {
        let mut aggregator = locked(&self.aggregator, "aggregator")?;
        if let Some(current) = self.manager.status().current_frequency {
            if aggregator.target() != Some(current) {
                self.persist(&mut aggregator)?;
                aggregator.set_target(current);
            }
        }
        aggregator.add_spectrum_data(frame);
        locked(&self.stats, "ingest stats")?.frames += 1;
        Ok(())
    }

    fn persist_or_warn(&self) {
        let result = locked(&self.aggregator, "aggregator")
            .and_then(|mut aggregator| self.persist(&mut aggregator));
        if let Err(err) = result {
            warn!("persisting detections failed: {:#}", err);
        }
    }

    /// Stores the open detections at the observer position and starts a fresh window.
    fn persist(&self, aggregator: &mut SignalAggregator) -> anyhow::Result<usize> {
        let Some(target) = aggregator.target() else {
            return Ok(0);
        };
        let detections =
            aggregator.aggregated_signals(target, self.config.aggregator.tolerance_mhz);
        if detections.is_empty() {
            return Ok(0);
        }

        let observer = self.config.observer;
        let observations = detections
            .iter()
            .map(|detection| {
                let mut observation = SignalObservation::new(
                    detection.last_seen,
                    observer.lat,
                    observer.lon,
                    detection.power as f64,
                    detection.frequency,
                    self.source.clone(),
                );
                observation.metadata = json!({
                    "target_mhz": target,
                    "count": detection.count,
                    "first_seen": detection.first_seen,
                });
                observation
            })
            .collect::<Vec<_>>();
        let stored = self
            .store
            .store_signals_batch(observations)
            .context("storing detections")?
            .len();
        aggregator.flush();
        aggregator.set_target(target);
        locked(&self.stats, "ingest stats")?.detections_stored += stored as u64;
        info!("stored {} detections near {:.3} MHz", stored, target);
        Ok(stored)
    }

    pub fn apply_retention(&self) -> anyhow::Result<Option<CleanupReport>> {
        let Some(minutes) = self.config.store.retention_minutes else {
            return Ok(None);
        };
        let report = self
            .store
            .cleanup_old_data(ChronoDuration::minutes(minutes))
            .context("applying retention")?;
        Ok(Some(report))
    }

    pub fn signals_near(&self, query: &RadiusQuery) -> anyhow::Result<Vec<SignalRecord>> {
        self.store
            .find_signals_in_radius(query)
            .context("querying signals")
    }

    pub fn statistics(&self, window: Option<ChronoDuration>) -> anyhow::Result<StoreStatistics> {
        self.store.statistics(window).context("reading store statistics")
    }

    pub fn analyze(
        &self,
        flight_path: &[FlightPoint],
        captures: &[SignalCapture],
        area: Option<&AreaOfInterest>,
    ) -> FlightAnalysis {
        self.analyzer.analyze(flight_path, captures, area)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::config::BackendConfig;
    use sweepcore::sweep::CommandBackend;
    use sweepcore::CoreError;

    const LINE: &str = "2024-03-01, 11:57:34.967805, 433000000, 435000000, 500000.00, 20, -90.5, -41.25, -85.0, -88.0";

    fn scripted_config() -> WorkflowConfig {
        let script = format!("while true; do echo '{}'; sleep 0.05; done", LINE);
        WorkflowConfig {
            backend: BackendConfig::Command(CommandBackend::new(
                "sh",
                vec!["-c".to_string(), script],
            )),
            frequencies: vec![433.92],
            dwell_ms: 60_000,
            persist_interval_ms: 150,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn run_stores_detections_at_observer() {
        let runner = Arc::new(Runner::new(scripted_config()).unwrap());
        let summary = runner.run_for(Duration::from_millis(900)).await.unwrap();

        assert_eq!(summary.final_state, SweepState::Idle);
        assert!(summary.ingest.frames > 0);
        assert!(summary.ingest.detections_stored > 0);
        assert!(summary.ingest.faults.is_empty());
        assert_eq!(
            summary.statistics.total_signals as u64,
            summary.ingest.detections_stored
        );

        let observer = runner.config().observer;
        let near = runner
            .signals_near(&RadiusQuery::new(observer.lat, observer.lon, 5.0))
            .unwrap();
        assert!(!near.is_empty());
        assert!((near[0].frequency - 433.75).abs() < 1e-9);
        assert_eq!(near[0].power, -41.25);
    }

    #[tokio::test]
    async fn second_start_is_refused_until_stopped() {
        let runner = Arc::new(Runner::new(scripted_config()).unwrap());
        let targets = runner.config().targets();
        assert!(runner.start(targets.clone(), 60_000).await.unwrap());
        assert!(!runner.start(targets.clone(), 60_000).await.unwrap());
        runner.stop().await.unwrap();
        assert_eq!(runner.status().state, SweepState::Idle);
        assert!(runner.start(targets, 60_000).await.unwrap());
        runner.cleanup().await.unwrap();
        assert_eq!(runner.status().state, SweepState::Idle);
    }

    #[tokio::test]
    async fn crash_is_reported_and_cleared() {
        let mut config = scripted_config();
        config.backend = BackendConfig::Command(CommandBackend::new(
            "sh",
            vec!["-c".to_string(), "echo 'hackrf_open() failed' >&2; exit 1".to_string()],
        ));
        let runner = Arc::new(Runner::new(config).unwrap());
        let summary = runner.run_for(Duration::from_secs(5)).await.unwrap();
        assert_eq!(summary.final_state, SweepState::Error);
        assert!(!summary.ingest.faults.is_empty());

        runner.cleanup().await.unwrap();
        assert_eq!(runner.status().state, SweepState::Idle);
    }

    #[tokio::test]
    async fn zero_analyzer_cell_size_is_refused() {
        let mut config = scripted_config();
        config.analyzer.cell_size_m = 0.0;
        let err = Runner::new(config).err().unwrap();
        assert!(matches!(
            err.downcast_ref::<CoreError>(),
            Some(CoreError::InvalidConfig(_))
        ));
    }
}
