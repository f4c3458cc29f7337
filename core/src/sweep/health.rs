use chrono::{DateTime, Utc};
use serde::Serialize;
use std::process::ExitStatus;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::process::Child;

use crate::prelude::FaultKind;
use crate::sweep::backend::{classify_exit, classify_spawn_error, prepare, SweepBackend};
use crate::sweep::parser::parse_sweep_line;

/// Outcome of a health check.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HealthResult {
    pub healthy: bool,
    pub fault: Option<FaultKind>,
    pub detail: String,
    pub latency_ms: u64,
    /// False when health was inferred from a running session instead of a probe.
    pub probed: bool,
    pub checked_at: DateTime<Utc>,
}

impl HealthResult {
    pub fn ok(detail: impl Into<String>, latency: Duration, probed: bool) -> Self {
        Self {
            healthy: true,
            fault: None,
            detail: detail.into(),
            latency_ms: latency.as_millis() as u64,
            probed,
            checked_at: Utc::now(),
        }
    }

    pub fn failed(
        fault: FaultKind,
        detail: impl Into<String>,
        latency: Duration,
        probed: bool,
    ) -> Self {
        Self {
            healthy: false,
            fault: Some(fault),
            detail: detail.into(),
            latency_ms: latency.as_millis() as u64,
            probed,
            checked_at: Utc::now(),
        }
    }
}

async fn collect_probe(child: &mut Child) -> std::io::Result<(ExitStatus, String, String)> {
    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();
    let read_out = async {
        let mut text = String::new();
        if let Some(pipe) = stdout.as_mut() {
            pipe.read_to_string(&mut text).await?;
        }
        Ok::<_, std::io::Error>(text)
    };
    let read_err = async {
        let mut text = String::new();
        if let Some(pipe) = stderr.as_mut() {
            pipe.read_to_string(&mut text).await?;
        }
        Ok::<_, std::io::Error>(text)
    };
    let (out, err) = tokio::try_join!(read_out, read_err)?;
    let status = child.wait().await?;
    Ok((status, out, err))
}

/// Runs the backend's probe sweep under a hard timeout.
///
/// The probe child is killed and reaped on every path out of this function.
pub async fn probe(backend: &dyn SweepBackend, timeout: Duration) -> HealthResult {
    let started = Instant::now();
    let mut child = match prepare(backend.probe_command()).spawn() {
        Ok(child) => child,
        Err(err) => {
            return HealthResult::failed(
                classify_spawn_error(&err),
                format!("spawning {} probe: {}", backend.name(), err),
                started.elapsed(),
                true,
            )
        }
    };

    let outcome = tokio::time::timeout(timeout, collect_probe(&mut child)).await;
    if let Err(err) = child.kill().await {
        log::debug!("probe already exited: {}", err);
    }
    let latency = started.elapsed();

    match outcome {
        Err(_) => HealthResult::failed(
            FaultKind::Timeout,
            format!("probe did not finish within {} ms", timeout.as_millis()),
            latency,
            true,
        ),
        Ok(Err(err)) => HealthResult::failed(
            FaultKind::SubprocessCrash,
            format!("reading probe output: {}", err),
            latency,
            true,
        ),
        Ok(Ok((status, stdout, stderr))) => {
            if !status.success() {
                return HealthResult::failed(
                    classify_exit(&stderr),
                    format!("probe exited with {}: {}", status, stderr.trim()),
                    latency,
                    true,
                );
            }
            let frames = stdout
                .lines()
                .filter(|line| parse_sweep_line(line, backend.sample_rate()).is_ok())
                .count();
            if frames == 0 {
                HealthResult::failed(
                    FaultKind::SubprocessCrash,
                    "probe produced no sweep data",
                    latency,
                    true,
                )
            } else {
                HealthResult::ok(format!("probe returned {} frames", frames), latency, true)
            }
        }
    }
}
