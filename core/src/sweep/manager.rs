use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use chrono::Utc;

use crate::prelude::{CoreError, CoreResult, FaultKind};
use crate::sweep::backend::{SweepBackend, TunePlan};
use crate::sweep::backoff::CrashBackoff;
use crate::sweep::config::{CycleConfig, FrequencyTarget, ManagerConfig};
use crate::sweep::events::{EventBus, Subscription, SweepEvent, SweepFault};
use crate::sweep::health::{self, HealthResult};
use crate::sweep::lock::{DeviceLease, DeviceLock};
use crate::sweep::parser::parse_sweep_line;
use crate::sweep::process::SweepProcess;
use crate::sweep::state::{SweepState, SweepStatus};
use crate::telemetry::{LogManager, Metrics, MetricsRecorder};

/// State shared between the manager handle and its session task.
struct Shared {
    config: ManagerConfig,
    backend: Arc<dyn SweepBackend>,
    status: Mutex<SweepStatus>,
    bus: Arc<EventBus>,
    backoff: Mutex<CrashBackoff>,
    metrics: MetricsRecorder,
    logger: LogManager,
    lock: DeviceLock,
}

impl Shared {
    fn status(&self) -> SweepStatus {
        match self.status.lock() {
            Ok(status) => status.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn update_status(&self, apply: impl FnOnce(&mut SweepStatus)) {
        if let Ok(mut status) = self.status.lock() {
            apply(&mut status);
        }
    }

    async fn transition(&self, next: SweepState) -> CoreResult<()> {
        let (change, snapshot) = {
            let mut status = self
                .status
                .lock()
                .map_err(|_| CoreError::SubprocessCrash("status lock poisoned".into()))?;
            let change = status.transition(next)?;
            (change, status.clone())
        };
        self.logger
            .record(&format!("state {} -> {}", change.from, change.to));
        self.bus.publish(SweepEvent::StatusChange(change)).await;
        self.bus.publish(SweepEvent::Status(snapshot)).await;
        Ok(())
    }

    /// Applies `from -> next` only if the manager is still in `from`.
    async fn transition_from(&self, from: SweepState, next: SweepState) -> bool {
        if self.status().state != from {
            return false;
        }
        self.transition(next).await.is_ok()
    }

    /// Control path of cleanup: never waits on a subscriber.
    fn force_idle(&self) {
        let change = {
            let mut status = match self.status.lock() {
                Ok(status) => status,
                Err(poisoned) => poisoned.into_inner(),
            };
            status.force_idle().map(|change| (change, status.clone()))
        };
        if let Some((change, snapshot)) = change {
            self.logger
                .record(&format!("forced {} -> {}", change.from, change.to));
            self.bus.notify(SweepEvent::StatusChange(change));
            self.bus.notify(SweepEvent::Status(snapshot));
        }
    }

    async fn publish_status(&self) {
        self.bus.publish(SweepEvent::Status(self.status())).await;
    }

    async fn handle_line(&self, line: &str) {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return;
        }
        match parse_sweep_line(trimmed, self.backend.sample_rate()) {
            Ok(frame) => {
                self.metrics.record_frame();
                self.update_status(|status| {
                    status.frames_received += 1;
                    status.last_frame_at = Some(Utc::now());
                });
                self.bus.publish(SweepEvent::Spectrum(Arc::new(frame))).await;
            }
            Err(err) => {
                self.metrics.record_malformed();
                self.logger.detail(&format!("skipping sweep line: {}", err));
            }
        }
    }

    /// Moves to `Error` and tells subscribers why.
    async fn fail(&self, err: CoreError) {
        let kind = err.fault_kind().unwrap_or(FaultKind::SubprocessCrash);
        let message = err.to_string();
        self.metrics.record_crash();
        if let Ok(mut backoff) = self.backoff.lock() {
            backoff.record_crash(Instant::now());
        }
        self.logger
            .failure(&format!("sweep session failed ({:?}): {}", kind, message));
        self.update_status(|status| {
            status.last_error = Some(message.clone());
            status.pid = None;
        });
        if let Err(transition_err) = self.transition(SweepState::Error).await {
            self.logger.warn(&format!(
                "could not enter error state: {}",
                transition_err
            ));
        }
        self.bus
            .publish(SweepEvent::Error(SweepFault::new(kind, message)))
            .await;
    }
}

/// Handle to the background task driving one sweep session.
struct Session {
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Session {
    /// Signals cancellation and waits for the task; aborts it past `timeout`.
    async fn shutdown(mut self, timeout: Duration, logger: &LogManager) {
        let _ = self.cancel.send(true);
        if tokio::time::timeout(timeout, &mut self.task).await.is_err() {
            logger.warn("session task ignored cancellation, aborting");
            self.task.abort();
            let _ = self.task.await;
        }
    }
}

enum DwellOutcome {
    Elapsed,
    Cancelled,
}

/// Supervises the sweep subprocess and fans its frames out to subscribers.
///
/// Only one session runs at a time. A crashed session parks the manager in
/// `Error` until [`SweepManager::force_cleanup`] is called.
pub struct SweepManager {
    shared: Arc<Shared>,
    session: tokio::sync::Mutex<Option<Session>>,
}

impl SweepManager {
    pub fn new(
        config: ManagerConfig,
        backend: Arc<dyn SweepBackend>,
        lock: DeviceLock,
    ) -> CoreResult<Self> {
        config.validate()?;
        let bus = EventBus::new(
            config.channel_capacity,
            Duration::from_millis(config.delivery_timeout_ms),
        );
        let backoff = CrashBackoff::new(config.backoff.clone());
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                backend,
                status: Mutex::new(SweepStatus::default()),
                bus,
                backoff: Mutex::new(backoff),
                metrics: MetricsRecorder::new(),
                logger: LogManager::new("sweep"),
                lock,
            }),
            session: tokio::sync::Mutex::new(None),
        })
    }

    pub fn status(&self) -> SweepStatus {
        self.shared.status()
    }

    pub fn metrics(&self) -> Metrics {
        self.shared.metrics.snapshot()
    }

    pub fn subscribe(&self) -> Subscription {
        self.shared.bus.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.bus.subscriber_count()
    }

    /// Starts cycling through `frequencies` (MHz), dwelling `cycle_time_ms` on each.
    ///
    /// Returns `Ok(false)` without touching the hardware unless the manager is
    /// `Idle`.
    pub async fn start_cycle(
        &self,
        frequencies: Vec<FrequencyTarget>,
        cycle_time_ms: u64,
    ) -> CoreResult<bool> {
        let cycle = CycleConfig::new(frequencies, cycle_time_ms)?;
        let mut slot = self.session.lock().await;

        let state = self.shared.status().state;
        if state != SweepState::Idle {
            self.shared
                .logger
                .detail(&format!("start_cycle ignored while {}", state));
            return Ok(false);
        }
        if let Some(stale) = slot.take() {
            stale
                .shutdown(self.stop_timeout(), &self.shared.logger)
                .await;
        }

        let delay = {
            let backoff = self
                .shared
                .backoff
                .lock()
                .map_err(|_| CoreError::SubprocessCrash("backoff lock poisoned".into()))?;
            backoff.next_delay(Instant::now())
        };
        let delay = match delay {
            Ok(delay) => delay,
            Err(err) => {
                self.shared.logger.failure(&err.to_string());
                self.shared
                    .bus
                    .publish(SweepEvent::Error(SweepFault::new(
                        FaultKind::SubprocessCrash,
                        err.to_string(),
                    )))
                    .await;
                return Err(err);
            }
        };

        let lease = self.shared.lock.try_acquire().ok_or_else(|| {
            CoreError::DeviceUnavailable("sweep device is leased by another session".into())
        })?;

        self.shared.transition(SweepState::Initializing).await?;
        self.shared.update_status(|status| {
            status.frames_received = 0;
            status.last_frame_at = None;
            status.last_error = None;
        });
        self.shared.logger.record(&format!(
            "starting cycle over {} frequencies, {} ms dwell",
            cycle.frequencies.len(),
            cycle.cycle_time_ms
        ));

        let (cancel, cancel_rx) = watch::channel(false);
        let task = tokio::spawn(run_session(
            self.shared.clone(),
            cycle,
            delay,
            lease,
            cancel_rx,
        ));
        *slot = Some(Session { cancel, task });
        self.shared.metrics.record_session();
        Ok(true)
    }

    /// Stops the running session and waits until its subprocess is reaped.
    pub async fn stop_sweep(&self) -> CoreResult<()> {
        let mut slot = self.session.lock().await;
        let state = self.shared.status().state;
        if !state.is_active() {
            self.shared
                .logger
                .detail(&format!("stop_sweep ignored while {}", state));
            return Ok(());
        }

        self.shared.transition(SweepState::Stopping).await?;
        if let Some(session) = slot.take() {
            session
                .shutdown(self.stop_timeout(), &self.shared.logger)
                .await;
        }
        self.shared
            .transition_from(SweepState::Stopping, SweepState::Idle)
            .await;
        Ok(())
    }

    /// Tears down any session and returns to `Idle` from every state.
    pub async fn force_cleanup(&self) {
        let mut slot = self.session.lock().await;
        if let Some(session) = slot.take() {
            session
                .shutdown(self.stop_timeout(), &self.shared.logger)
                .await;
        }
        self.shared.force_idle();
    }

    /// Probes the device when no session owns it; otherwise judges the live
    /// session by the age of its last frame.
    pub async fn check_health(&self) -> HealthResult {
        let _slot = self.session.lock().await;
        let status = self.shared.status();
        if status.state.is_active() {
            return self.session_health(&status);
        }

        let Some(_lease) = self.shared.lock.try_acquire() else {
            return HealthResult::failed(
                FaultKind::DeviceUnavailable,
                "sweep device is leased by another session",
                Duration::ZERO,
                false,
            );
        };
        let timeout = Duration::from_millis(self.shared.config.health_timeout_ms);
        let result = health::probe(self.shared.backend.as_ref(), timeout).await;
        if result.healthy {
            self.shared.logger.record(&result.detail);
        } else {
            self.shared
                .logger
                .warn(&format!("health probe failed: {}", result.detail));
        }
        result
    }

    fn session_health(&self, status: &SweepStatus) -> HealthResult {
        let stale_after = Duration::from_millis(self.shared.config.health_stale_after_ms);
        match status.last_frame_at {
            Some(at) => {
                let age = (Utc::now() - at).to_std().unwrap_or_default();
                if age <= stale_after {
                    HealthResult::ok(
                        format!("session live, last frame {} ms ago", age.as_millis()),
                        Duration::ZERO,
                        false,
                    )
                } else {
                    HealthResult::failed(
                        FaultKind::Timeout,
                        format!("no frames for {} ms", age.as_millis()),
                        Duration::ZERO,
                        false,
                    )
                }
            }
            None if status.state == SweepState::Initializing => HealthResult::ok(
                "session initializing",
                Duration::ZERO,
                false,
            ),
            None => HealthResult::failed(
                FaultKind::Timeout,
                "session running but no frames yet",
                Duration::ZERO,
                false,
            ),
        }
    }

    fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.shared.config.stop_timeout_ms)
    }
}

impl Drop for SweepManager {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.session.try_lock() {
            if let Some(session) = slot.take() {
                let _ = session.cancel.send(true);
                session.task.abort();
            }
        }
    }
}

async fn run_session(
    shared: Arc<Shared>,
    mut cycle: CycleConfig,
    delay: Duration,
    _lease: DeviceLease,
    mut cancel: watch::Receiver<bool>,
) {
    if !delay.is_zero() {
        shared.logger.warn(&format!(
            "delaying sweep start {} ms after recent crashes",
            delay.as_millis()
        ));
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.changed() => return,
        }
    }

    let outcome = drive_cycle(&shared, &mut cycle, &mut cancel).await;
    let cancelled = *cancel.borrow();
    match outcome {
        Ok(()) => shared.logger.record("sweep session finished"),
        Err(err) if cancelled => shared
            .logger
            .detail(&format!("error during shutdown ignored: {}", err)),
        Err(err) => shared.fail(err).await,
    }
}

async fn drive_cycle(
    shared: &Shared,
    cycle: &mut CycleConfig,
    cancel: &mut watch::Receiver<bool>,
) -> CoreResult<()> {
    let dwell = Duration::from_millis(cycle.cycle_time_ms);
    let retune = cycle.frequencies.len() > 1;
    let mut process: Option<SweepProcess> = None;
    let mut lap = 0u64;

    let result = 'laps: loop {
        cycle.lap = lap;
        shared.bus.publish(SweepEvent::CycleConfig(cycle.clone())).await;

        for (index, target) in cycle.frequencies.iter().enumerate() {
            let stop_requested = *cancel.borrow();
            if stop_requested {
                break 'laps Ok(());
            }
            shared.update_status(|status| {
                status.current_frequency = Some(target.value);
                status.cycle_index = index;
                status.lap = lap;
            });

            if process.is_none() {
                let plan = TunePlan::for_target(target.value, &shared.config);
                shared.logger.detail(&format!(
                    "tuning {}-{} MHz for {} MHz",
                    plan.start_mhz, plan.end_mhz, target.value
                ));
                match SweepProcess::spawn(shared.backend.as_ref(), &plan) {
                    Ok(spawned) => {
                        let pid = spawned.pid();
                        shared.update_status(|status| status.pid = pid);
                        process = Some(spawned);
                    }
                    Err(err) => break 'laps Err(err),
                }
                shared
                    .transition_from(SweepState::Initializing, SweepState::Running)
                    .await;
            }
            shared.publish_status().await;

            let Some(live) = process.as_mut() else {
                break 'laps Err(CoreError::SubprocessCrash("sweep process missing".into()));
            };
            match dwell_on(shared, live, dwell, cancel).await {
                Ok(DwellOutcome::Elapsed) => {}
                Ok(DwellOutcome::Cancelled) => break 'laps Ok(()),
                Err(err) => break 'laps Err(err),
            }

            if retune {
                if let Some(done) = process.take() {
                    done.terminate().await;
                }
            }
        }

        if let Ok(mut backoff) = shared.backoff.lock() {
            backoff.record_success();
        }
        lap += 1;
    };

    if let Some(live) = process.take() {
        live.terminate().await;
    }
    shared.update_status(|status| status.pid = None);
    result
}

async fn dwell_on(
    shared: &Shared,
    process: &mut SweepProcess,
    dwell: Duration,
    cancel: &mut watch::Receiver<bool>,
) -> CoreResult<DwellOutcome> {
    let deadline = tokio::time::Instant::now() + dwell;
    let stall = Duration::from_millis(shared.config.stall_timeout_ms);
    loop {
        tokio::select! {
            _ = cancel.changed() => return Ok(DwellOutcome::Cancelled),
            _ = tokio::time::sleep_until(deadline) => return Ok(DwellOutcome::Elapsed),
            line = tokio::time::timeout(stall, process.next_line()) => match line {
                Ok(Ok(Some(line))) => shared.handle_line(&line).await,
                Ok(Ok(None)) => return Err(process.exit_fault().await),
                Ok(Err(err)) => {
                    return Err(CoreError::SubprocessCrash(format!(
                        "reading sweep output: {}",
                        err
                    )))
                }
                Err(_) => {
                    return Err(CoreError::Timeout(format!(
                        "no sweep output for {} ms",
                        stall.as_millis()
                    )))
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sweep::backend::CommandBackend;
    use crate::sweep::backoff::BackoffPolicy;
    use std::fs;

    const LINE: &str = "2024-03-01, 11:57:34.967805, 433000000, 435000000, 500000.00, 20, -90.5, -41.25, -85.0, -88.0";

    fn emitter_script() -> String {
        format!("while true; do echo '{}'; sleep 0.05; done", LINE)
    }

    fn test_config() -> ManagerConfig {
        ManagerConfig {
            stall_timeout_ms: 2_000,
            stop_timeout_ms: 2_000,
            health_timeout_ms: 2_000,
            backoff: BackoffPolicy {
                initial_delay_ms: 20,
                multiplier: 2.0,
                max_delay_ms: 100,
                max_consecutive_crashes: 3,
                reset_after_ms: 60_000,
            },
            ..Default::default()
        }
    }

    fn manager(script: &str) -> SweepManager {
        let backend = CommandBackend::new("sh", vec!["-c".into(), script.into()]);
        SweepManager::new(test_config(), Arc::new(backend), DeviceLock::new()).unwrap()
    }

    async fn wait_for_state(manager: &SweepManager, state: SweepState) -> bool {
        for _ in 0..200 {
            if manager.status().state == state {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[cfg(target_os = "linux")]
    fn process_alive(pid: u32) -> bool {
        std::path::Path::new(&format!("/proc/{}", pid)).exists()
    }

    #[tokio::test]
    async fn cycle_runs_emits_spectrum_and_stops_cleanly() {
        let manager = manager(&emitter_script());
        let mut events = manager.subscribe();

        assert!(manager
            .start_cycle(vec![FrequencyTarget::mhz(433.92)], 5_000)
            .await
            .unwrap());
        assert!(wait_for_state(&manager, SweepState::Running).await);

        let saw_spectrum = tokio::time::timeout(Duration::from_millis(5_000), async {
            while let Some(event) = events.recv().await {
                if let SweepEvent::Spectrum(frame) = event {
                    return frame.bin_count == 4;
                }
            }
            false
        })
        .await
        .unwrap_or(false);
        assert!(saw_spectrum);

        let pid = manager.status().pid;
        manager.stop_sweep().await.unwrap();
        assert_eq!(manager.status().state, SweepState::Idle);
        #[cfg(target_os = "linux")]
        if let Some(pid) = pid {
            assert!(!process_alive(pid));
        }

        while events.try_recv().is_some() {}
        tokio::time::sleep(Duration::from_millis(200)).await;
        while let Some(event) = events.try_recv() {
            assert!(!matches!(event, SweepEvent::Spectrum(_)));
        }
    }

    #[tokio::test]
    async fn second_start_is_rejected_without_spawning() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("spawns");
        let script = format!("echo spawned >> '{}'; {}", marker.display(), emitter_script());
        let manager = manager(&script);

        let targets = vec![FrequencyTarget::mhz(433.92)];
        assert!(manager.start_cycle(targets.clone(), 5_000).await.unwrap());
        assert!(wait_for_state(&manager, SweepState::Running).await);
        assert!(!manager.start_cycle(targets, 5_000).await.unwrap());
        tokio::time::sleep(Duration::from_millis(100)).await;

        let spawns = fs::read_to_string(&marker).unwrap();
        assert_eq!(spawns.lines().count(), 1);
        manager.stop_sweep().await.unwrap();
    }

    #[tokio::test]
    async fn crash_parks_manager_in_error_until_cleanup() {
        let manager = manager("echo 'No HackRF boards found.' >&2; exit 1");
        let mut events = manager.subscribe();
        let targets = vec![FrequencyTarget::mhz(915.0)];

        assert!(manager.start_cycle(targets.clone(), 1_000).await.unwrap());
        assert!(wait_for_state(&manager, SweepState::Error).await);

        let fault = tokio::time::timeout(Duration::from_secs(2), async {
            while let Some(event) = events.recv().await {
                if let SweepEvent::Error(fault) = event {
                    return Some(fault);
                }
            }
            None
        })
        .await
        .unwrap()
        .unwrap();
        assert_eq!(fault.kind, FaultKind::DeviceUnavailable);

        assert!(!manager.start_cycle(targets, 1_000).await.unwrap());
        manager.force_cleanup().await;
        assert_eq!(manager.status().state, SweepState::Idle);
        manager.force_cleanup().await;
        assert_eq!(manager.status().state, SweepState::Idle);
        assert_eq!(manager.metrics().crashes, 1);
    }

    #[tokio::test]
    async fn repeated_crashes_exhaust_backoff() {
        let manager = manager("exit 3");
        let targets = vec![FrequencyTarget::mhz(915.0)];
        for _ in 0..3 {
            assert!(manager.start_cycle(targets.clone(), 1_000).await.unwrap());
            assert!(wait_for_state(&manager, SweepState::Error).await);
            manager.force_cleanup().await;
        }
        assert!(matches!(
            manager.start_cycle(targets, 1_000).await,
            Err(CoreError::BackoffExhausted { crashes: 3 })
        ));
        assert_eq!(manager.status().state, SweepState::Idle);
    }

    #[tokio::test]
    async fn silent_process_is_reported_as_stall() {
        let backend = CommandBackend::new("sh", vec!["-c".into(), "exec sleep 30".into()]);
        let config = ManagerConfig {
            stall_timeout_ms: 150,
            ..test_config()
        };
        let manager = SweepManager::new(config, Arc::new(backend), DeviceLock::new()).unwrap();
        assert!(manager
            .start_cycle(vec![FrequencyTarget::mhz(100.0)], 5_000)
            .await
            .unwrap());
        assert!(wait_for_state(&manager, SweepState::Error).await);
        assert!(manager
            .status()
            .last_error
            .unwrap_or_default()
            .contains("no sweep output"));
        manager.force_cleanup().await;
    }

    #[tokio::test]
    async fn cycling_announces_each_lap() {
        let manager = manager(&emitter_script());
        let mut events = manager.subscribe();
        let targets = vec![FrequencyTarget::mhz(433.92), FrequencyTarget::mhz(868.0)];
        assert!(manager.start_cycle(targets, 100).await.unwrap());

        let laps = tokio::time::timeout(Duration::from_secs(5), async {
            let mut laps = Vec::new();
            while let Some(event) = events.recv().await {
                if let SweepEvent::CycleConfig(cycle) = event {
                    assert_eq!(cycle.frequencies.len(), 2);
                    laps.push(cycle.lap);
                    if laps.len() == 2 {
                        break;
                    }
                }
            }
            laps
        })
        .await
        .unwrap();
        assert_eq!(laps, vec![0, 1]);
        manager.stop_sweep().await.unwrap();
        assert_eq!(manager.status().state, SweepState::Idle);
    }

    #[tokio::test]
    async fn device_lock_is_exclusive_across_managers() {
        let lock = DeviceLock::new();
        let backend: Arc<dyn SweepBackend> = Arc::new(CommandBackend::new(
            "sh",
            vec!["-c".into(), emitter_script()],
        ));
        let first = SweepManager::new(test_config(), backend.clone(), lock.clone()).unwrap();
        let second = SweepManager::new(test_config(), backend, lock).unwrap();
        let targets = vec![FrequencyTarget::mhz(433.92)];

        assert!(first.start_cycle(targets.clone(), 5_000).await.unwrap());
        assert!(matches!(
            second.start_cycle(targets, 5_000).await,
            Err(CoreError::DeviceUnavailable(_))
        ));
        let health = second.check_health().await;
        assert_eq!(health.fault, Some(FaultKind::DeviceUnavailable));
        first.stop_sweep().await.unwrap();
    }

    #[tokio::test]
    async fn sweep_continues_without_subscribers() {
        let manager = manager(&emitter_script());
        let events = manager.subscribe();
        assert!(manager
            .start_cycle(vec![FrequencyTarget::mhz(433.92)], 5_000)
            .await
            .unwrap());
        drop(events);
        assert_eq!(manager.subscriber_count(), 0);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(manager.status().state, SweepState::Running);
        assert!(manager.status().frames_received > 0);
        manager.stop_sweep().await.unwrap();
    }

    #[tokio::test]
    async fn invalid_cycle_is_rejected() {
        let manager = manager(&emitter_script());
        assert!(matches!(
            manager.start_cycle(vec![], 1_000).await,
            Err(CoreError::InvalidConfig(_))
        ));
        assert_eq!(manager.status().state, SweepState::Idle);
    }

    #[tokio::test]
    async fn running_session_health_uses_frame_age() {
        let manager = manager(&emitter_script());
        assert!(manager
            .start_cycle(vec![FrequencyTarget::mhz(433.92)], 5_000)
            .await
            .unwrap());
        assert!(wait_for_state(&manager, SweepState::Running).await);
        tokio::time::sleep(Duration::from_millis(200)).await;
        let health = manager.check_health().await;
        assert!(health.healthy, "{:?}", health);
        assert!(!health.probed);
        manager.stop_sweep().await.unwrap();
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn force_cleanup_while_running_reaps_child() {
        let manager = manager(&emitter_script());
        assert!(manager
            .start_cycle(vec![FrequencyTarget::mhz(433.92)], 60_000)
            .await
            .unwrap());
        assert!(wait_for_state(&manager, SweepState::Running).await);
        let pid = manager.status().pid.unwrap();
        assert!(process_alive(pid));

        manager.force_cleanup().await;
        assert_eq!(manager.status().state, SweepState::Idle);
        assert_eq!(manager.status().pid, None);
        assert!(!process_alive(pid));
    }

    #[tokio::test]
    async fn force_cleanup_during_crash_delay_spawns_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("spawns");
        let script = format!("echo spawned >> '{}'; exit 1", marker.display());
        let config = ManagerConfig {
            backoff: BackoffPolicy {
                initial_delay_ms: 5_000,
                multiplier: 2.0,
                max_delay_ms: 5_000,
                max_consecutive_crashes: 3,
                reset_after_ms: 60_000,
            },
            ..test_config()
        };
        let backend = CommandBackend::new("sh", vec!["-c".into(), script]);
        let manager = SweepManager::new(config, Arc::new(backend), DeviceLock::new()).unwrap();
        let targets = vec![FrequencyTarget::mhz(915.0)];

        assert!(manager.start_cycle(targets.clone(), 1_000).await.unwrap());
        assert!(wait_for_state(&manager, SweepState::Error).await);
        manager.force_cleanup().await;

        assert!(manager.start_cycle(targets, 1_000).await.unwrap());
        assert_eq!(manager.status().state, SweepState::Initializing);
        manager.force_cleanup().await;
        assert_eq!(manager.status().state, SweepState::Idle);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fs::read_to_string(&marker).unwrap().lines().count(), 1);
    }

    #[tokio::test]
    async fn stalled_subscriber_cannot_block_cleanup() {
        let backend = CommandBackend::new(
            "sh",
            vec![
                "-c".into(),
                format!("while true; do echo '{}'; sleep 0.01; done", LINE),
            ],
        );
        let config = ManagerConfig {
            channel_capacity: 4,
            delivery_timeout_ms: 100,
            ..test_config()
        };
        let manager = SweepManager::new(config, Arc::new(backend), DeviceLock::new()).unwrap();
        let _stalled = manager.subscribe();
        assert!(manager
            .start_cycle(vec![FrequencyTarget::mhz(433.92)], 60_000)
            .await
            .unwrap());
        assert!(wait_for_state(&manager, SweepState::Running).await);
        tokio::time::sleep(Duration::from_millis(400)).await;

        let finished = tokio::time::timeout(Duration::from_secs(5), manager.force_cleanup()).await;
        assert!(finished.is_ok());
        assert_eq!(manager.status().state, SweepState::Idle);
        assert_eq!(manager.subscriber_count(), 0);
        assert!(manager.status().frames_received > 4);
    }

    #[tokio::test]
    async fn undecodable_output_line_is_skipped() {
        let script = format!(
            "printf '\\377\\376\\n'; while true; do echo '{}'; sleep 0.05; done",
            LINE
        );
        let manager = manager(&script);
        assert!(manager
            .start_cycle(vec![FrequencyTarget::mhz(433.92)], 60_000)
            .await
            .unwrap());
        assert!(wait_for_state(&manager, SweepState::Running).await);
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(manager.status().state, SweepState::Running);
        assert!(manager.status().frames_received > 0);
        let metrics = manager.metrics();
        assert_eq!(metrics.malformed_lines, 1);
        assert_eq!(metrics.crashes, 0);
        manager.stop_sweep().await.unwrap();
    }
}
