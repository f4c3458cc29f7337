use chrono::{NaiveDateTime, TimeZone, Utc};

use crate::prelude::{CoreError, CoreResult};
use crate::records::SpectrumFrame;

/// Substituted for bins the driver reports as `-inf`/`nan`.
pub const NOISE_FLOOR_DB: f32 = -150.0;

const HEADER_FIELDS: usize = 6;

/// Parses one `hackrf_sweep` CSV line:
/// `date, time, hz_low, hz_high, hz_bin_width, num_samples, dB, dB, ...`.
pub fn parse_sweep_line(line: &str, sample_rate: f64) -> CoreResult<SpectrumFrame> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if fields.len() <= HEADER_FIELDS {
        return Err(CoreError::DataCorruption(format!(
            "expected more than {} fields, got {}",
            HEADER_FIELDS,
            fields.len()
        )));
    }

    let stamp = format!("{} {}", fields[0], fields[1]);
    let naive = NaiveDateTime::parse_from_str(&stamp, "%Y-%m-%d %H:%M:%S%.f")
        .map_err(|err| CoreError::DataCorruption(format!("timestamp '{}': {}", stamp, err)))?;
    let timestamp = Utc.from_utc_datetime(&naive);

    let hz_low = parse_number(fields[2], "hz_low")?;
    let hz_high = parse_number(fields[3], "hz_high")?;
    let bin_width = parse_number(fields[4], "hz_bin_width")?;
    fields[5]
        .parse::<u64>()
        .map_err(|_| CoreError::DataCorruption(format!("num_samples '{}'", fields[5])))?;

    let bins = fields[HEADER_FIELDS..]
        .iter()
        .map(|raw| {
            raw.parse::<f32>()
                .map(|value| if value.is_finite() { value } else { NOISE_FLOOR_DB })
                .map_err(|_| CoreError::DataCorruption(format!("bin value '{}'", raw)))
        })
        .collect::<CoreResult<Vec<f32>>>()?;

    if bin_width <= 0.0 {
        return Err(CoreError::DataCorruption("bin width must be positive".into()));
    }
    let expected = ((hz_high - hz_low) / bin_width).round() as usize;
    if expected != bins.len() {
        return Err(CoreError::DataCorruption(format!(
            "band {}..{} at {} Hz needs {} bins, line has {}",
            hz_low,
            hz_high,
            bin_width,
            expected,
            bins.len()
        )));
    }

    let frame = SpectrumFrame::new(hz_low, hz_high, bins, sample_rate, timestamp);
    frame.validate()?;
    Ok(frame)
}

fn parse_number(raw: &str, field: &str) -> CoreResult<f64> {
    raw.parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
        .ok_or_else(|| CoreError::DataCorruption(format!("{} '{}'", field, raw)))
}
