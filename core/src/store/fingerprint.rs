//! Approximate emitter identity.
//!
//! Signals sharing a source, a 1 MHz frequency bucket and a 10 dB power
//! bucket are attributed to the same device. Distinct emitters inside one
//! bucket collide; one emitter whose power drifts across a bucket edge splits.

/// Width of the frequency bucket in MHz.
pub const FREQUENCY_BUCKET_MHZ: f64 = 1.0;
/// Width of the power bucket in dB.
pub const POWER_BUCKET_DB: f64 = 10.0;

pub fn derive_device_id(source: &str, frequency_mhz: f64, power: f64) -> String {
    let frequency_bucket = (frequency_mhz / FREQUENCY_BUCKET_MHZ).floor() as i64;
    let power_bucket = (power / POWER_BUCKET_DB).floor() as i64;
    format!("{}-{}-{}", source, frequency_bucket, power_bucket)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nearby_readings_share_an_id() {
        assert_eq!(
            derive_device_id("hackrf", 433.92, -52.0),
            derive_device_id("hackrf", 433.10, -58.5)
        );
        assert_eq!(derive_device_id("hackrf", 433.92, -52.0), "hackrf-433--6");
    }

    #[test]
    fn power_or_source_changes_split_ids() {
        let base = derive_device_id("hackrf", 915.2, -41.0);
        assert_ne!(base, derive_device_id("hackrf", 915.2, -39.0));
        assert_ne!(base, derive_device_id("kismet", 915.2, -41.0));
        assert_ne!(base, derive_device_id("hackrf", 916.2, -41.0));
    }
}
