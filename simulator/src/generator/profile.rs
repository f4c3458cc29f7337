use anyhow::{ensure, Context};
use chrono::{DateTime, Utc};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::io::{self, Write};
use std::thread;
use std::time::Duration;

/// Narrowband transmitter painted on top of the noise floor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Emitter {
    pub frequency_mhz: f64,
    pub power_db: f32,
    /// Occupied bandwidth; bins inside it roll off linearly to the floor.
    #[serde(default = "default_emitter_width")]
    pub width_mhz: f64,
}

fn default_emitter_width() -> f64 {
    0.2
}

/// Configuration for generating synthetic `hackrf_sweep` output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    pub start_mhz: u32,
    pub end_mhz: u32,
    pub bin_width_hz: u32,
    /// Band covered by one output line, as the real tool prints 5 MHz blocks.
    pub segment_mhz: u32,
    pub noise_floor_db: f32,
    pub noise_jitter_db: f32,
    pub emitters: Vec<Emitter>,
    pub seed: u64,
    /// Stop after this many sweeps; run until the reader goes away otherwise.
    pub sweeps: Option<u64>,
    pub interval_ms: u64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            start_mhz: 424,
            end_mhz: 444,
            bin_width_hz: 100_000,
            segment_mhz: 5,
            noise_floor_db: -95.0,
            noise_jitter_db: 3.0,
            emitters: vec![Emitter {
                frequency_mhz: 433.92,
                power_db: -40.0,
                width_mhz: default_emitter_width(),
            }],
            seed: 0,
            sweeps: None,
            interval_ms: 200,
        }
    }
}

impl GeneratorConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(self.end_mhz > self.start_mhz, "end_mhz must exceed start_mhz");
        ensure!(self.bin_width_hz > 0, "bin_width_hz must be positive");
        ensure!(self.segment_mhz > 0, "segment_mhz must be positive");
        ensure!(
            (self.segment_mhz as u64 * 1_000_000) % self.bin_width_hz as u64 == 0,
            "segment of {} MHz is not a whole number of {} Hz bins",
            self.segment_mhz,
            self.bin_width_hz
        );
        ensure!(self.noise_jitter_db >= 0.0, "noise_jitter_db must not be negative");
        Ok(())
    }
}

/// Produces sweeps as `hackrf_sweep` CSV lines.
pub struct SweepLineGenerator {
    config: GeneratorConfig,
    rng: StdRng,
}

impl SweepLineGenerator {
    pub fn new(config: GeneratorConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let rng = StdRng::seed_from_u64(config.seed);
        Ok(Self { config, rng })
    }

    fn bin_power(&mut self, center_mhz: f64) -> f32 {
        let jitter = if self.config.noise_jitter_db > 0.0 {
            self.rng
                .gen_range(-self.config.noise_jitter_db..self.config.noise_jitter_db)
        } else {
            0.0
        };
        let floor = self.config.noise_floor_db + jitter;
        self.config
            .emitters
            .iter()
            .filter_map(|emitter| {
                let half = emitter.width_mhz.max(f64::EPSILON) / 2.0;
                let offset = (center_mhz - emitter.frequency_mhz).abs();
                if offset > half {
                    return None;
                }
                let rolloff = 1.0 - (offset / half) as f32;
                Some(floor + (emitter.power_db - floor).max(0.0) * rolloff)
            })
            .fold(floor, f32::max)
    }

    /// One full pass over the configured band.
    pub fn next_sweep(&mut self, at: DateTime<Utc>) -> Vec<String> {
        let date = at.format("%Y-%m-%d").to_string();
        let time = at.format("%H:%M:%S%.6f").to_string();
        let bin_hz = self.config.bin_width_hz as u64;
        let segment_hz = self.config.segment_mhz as u64 * 1_000_000;
        let end_hz = self.config.end_mhz as u64 * 1_000_000;

        let mut lines = Vec::new();
        let mut low = self.config.start_mhz as u64 * 1_000_000;
        while low < end_hz {
            let high = (low + segment_hz).min(end_hz);
            let bins = ((high - low) / bin_hz).max(1);
            let high = low + bins * bin_hz;
            let mut line = format!(
                "{}, {}, {}, {}, {:.2}, {}",
                date, time, low, high, bin_hz as f64, bins * 16
            );
            for index in 0..bins {
                let center_mhz = (low + index * bin_hz) as f64 / 1e6 + bin_hz as f64 / 2e6;
                let power = self.bin_power(center_mhz);
                line.push_str(&format!(", {:.2}", power));
            }
            lines.push(line);
            low = high;
        }
        lines
    }
}

/// Writes sweeps to `out` until the sweep budget is spent or the reader hangs up.
pub fn emit_sweeps<W: Write>(config: GeneratorConfig, out: &mut W) -> anyhow::Result<u64> {
    let interval = Duration::from_millis(config.interval_ms);
    let budget = config.sweeps;
    let mut generator = SweepLineGenerator::new(config)?;
    let mut emitted = 0u64;

    while budget.map_or(true, |limit| emitted < limit) {
        let lines = generator.next_sweep(Utc::now());
        let written = lines
            .iter()
            .try_for_each(|line| writeln!(out, "{}", line))
            .and_then(|_| out.flush());
        match written {
            Ok(()) => emitted += 1,
            Err(err) if err.kind() == io::ErrorKind::BrokenPipe => break,
            Err(err) => return Err(err).context("writing sweep lines"),
        }
        if !interval.is_zero() {
            thread::sleep(interval);
        }
    }
    Ok(emitted)
}
