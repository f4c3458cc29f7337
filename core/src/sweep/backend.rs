use serde::{Deserialize, Serialize};
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;

use crate::prelude::FaultKind;
use crate::sweep::config::ManagerConfig;

/// Band and gain settings handed to the sweep program for one target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunePlan {
    pub center_mhz: f64,
    pub start_mhz: u32,
    pub end_mhz: u32,
    pub bin_width_hz: u32,
    pub lna_gain: u32,
    pub vga_gain: u32,
    pub amp_enabled: bool,
}

impl TunePlan {
    /// Whole-MHz band of `span_mhz` centred on `center_mhz`.
    pub fn for_target(center_mhz: f64, config: &ManagerConfig) -> Self {
        let half = config.span_mhz / 2.0;
        let start = (center_mhz - half).floor().max(0.0) as u32;
        let mut end = (center_mhz + half).ceil() as u32;
        if end <= start {
            end = start + 1;
        }
        Self {
            center_mhz,
            start_mhz: start,
            end_mhz: end,
            bin_width_hz: config.bin_width_hz,
            lna_gain: config.lna_gain,
            vga_gain: config.vga_gain,
            amp_enabled: config.amp_enabled,
        }
    }

    fn substitute(&self, template: &str) -> String {
        template
            .replace("{start_mhz}", &self.start_mhz.to_string())
            .replace("{end_mhz}", &self.end_mhz.to_string())
            .replace("{center_mhz}", &self.center_mhz.to_string())
            .replace("{bin_width_hz}", &self.bin_width_hz.to_string())
            .replace("{lna_gain}", &self.lna_gain.to_string())
            .replace("{vga_gain}", &self.vga_gain.to_string())
    }
}

/// Builds the subprocess commands for a particular sweep program.
pub trait SweepBackend: Send + Sync {
    fn name(&self) -> &str;
    /// Long-running sweep over the plan's band.
    fn sweep_command(&self, plan: &TunePlan) -> Command;
    /// Bounded, minimal-bandwidth sweep used by health checks.
    fn probe_command(&self) -> Command;
    fn sample_rate(&self) -> f64 {
        20e6
    }
}

/// Applies the pipe and lifetime settings every sweep subprocess needs.
pub fn prepare(mut command: Command) -> Command {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    command
}

/// `hackrf_sweep` from the HackRF host tools.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HackRfBackend {
    pub program: PathBuf,
    #[serde(default)]
    pub serial: Option<String>,
}

impl Default for HackRfBackend {
    fn default() -> Self {
        Self {
            program: PathBuf::from("hackrf_sweep"),
            serial: None,
        }
    }
}

impl HackRfBackend {
    fn base_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        if let Some(serial) = &self.serial {
            command.arg("-d").arg(serial);
        }
        command
    }
}

impl SweepBackend for HackRfBackend {
    fn name(&self) -> &str {
        "hackrf_sweep"
    }

    fn sweep_command(&self, plan: &TunePlan) -> Command {
        let mut command = self.base_command();
        command
            .arg("-f")
            .arg(format!("{}:{}", plan.start_mhz, plan.end_mhz))
            .arg("-w")
            .arg(plan.bin_width_hz.to_string())
            .arg("-l")
            .arg(plan.lna_gain.to_string())
            .arg("-g")
            .arg(plan.vga_gain.to_string());
        if plan.amp_enabled {
            command.arg("-a").arg("1");
        }
        command
    }

    fn probe_command(&self) -> Command {
        let mut command = self.base_command();
        command
            .arg("-1")
            .arg("-f")
            .arg("2400:2420")
            .arg("-w")
            .arg("1000000");
        command
    }
}

/// Arbitrary program with `{start_mhz}`-style placeholders in its arguments.
///
/// Used for sweep emulators and scripted test doubles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandBackend {
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub probe_args: Vec<String>,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: f64,
}

fn default_sample_rate() -> f64 {
    20e6
}

impl CommandBackend {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args: args.clone(),
            probe_args: args,
            sample_rate: default_sample_rate(),
        }
    }

    pub fn with_probe_args(mut self, probe_args: Vec<String>) -> Self {
        self.probe_args = probe_args;
        self
    }
}

impl SweepBackend for CommandBackend {
    fn name(&self) -> &str {
        self.program.to_str().unwrap_or("command")
    }

    fn sweep_command(&self, plan: &TunePlan) -> Command {
        let mut command = Command::new(&self.program);
        command.args(self.args.iter().map(|arg| plan.substitute(arg)));
        command
    }

    fn probe_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.probe_args);
        command
    }

    fn sample_rate(&self) -> f64 {
        self.sample_rate
    }
}

const DEVICE_MARKERS: [&str; 7] = [
    "no hackrf boards found",
    "hackrf_error_not_found",
    "hackrf_open() failed",
    "resource busy",
    "permission denied",
    "access denied",
    "libusb_error",
];

/// Classifies a subprocess exit from its stderr text.
pub fn classify_exit(stderr: &str) -> FaultKind {
    let lowered = stderr.to_lowercase();
    if DEVICE_MARKERS.iter().any(|marker| lowered.contains(marker)) {
        FaultKind::DeviceUnavailable
    } else {
        FaultKind::SubprocessCrash
    }
}

/// Classifies a failure to launch the sweep program at all.
pub fn classify_spawn_error(err: &io::Error) -> FaultKind {
    match err.kind() {
        io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => FaultKind::DeviceUnavailable,
        _ => FaultKind::SubprocessCrash,
    }
}
