//! Single-link clustering of signal captures.
//!
//! Clustering compares every pair of captures, so cost grows with the square
//! of the capture count. Callers are expected to pass one flight's captures
//! (hundreds), not a whole archive.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::analysis::flight::SignalCapture;
use crate::math::geo::{haversine_m, GeoPoint};

/// Width of the frequency buckets used to pick a dominant frequency.
pub const FREQUENCY_BUCKET_MHZ: f64 = 100.0;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignalHotspot {
    pub position: GeoPoint,
    /// Largest member distance from the centroid, metres.
    pub radius: f64,
    /// 0..=1.
    pub intensity: f64,
    /// Lower edge of the busiest 100 MHz bucket.
    pub dominant_frequency: f64,
    pub device_count: usize,
    /// Lower edge of the altitude band with the strongest mean power.
    pub recommended_altitude: f64,
    pub capture_count: usize,
    pub total_signals: usize,
    pub average_power: f64,
}

/// Disjoint sets over capture indices.
struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(len: usize) -> Self {
        Self {
            parent: (0..len).collect(),
        }
    }

    fn find(&mut self, mut node: usize) -> usize {
        while self.parent[node] != node {
            self.parent[node] = self.parent[self.parent[node]];
            node = self.parent[node];
        }
        node
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            self.parent[ra.max(rb)] = ra.min(rb);
        }
    }
}

/// Groups captures transitively within `merge_m` of each other; groups are
/// returned in order of their first member.
fn cluster(captures: &[&SignalCapture], merge_m: f64) -> Vec<Vec<usize>> {
    let mut sets = UnionFind::new(captures.len());
    for i in 0..captures.len() {
        for j in (i + 1)..captures.len() {
            let distance = haversine_m(
                captures[i].lat,
                captures[i].lon,
                captures[j].lat,
                captures[j].lon,
            );
            if distance <= merge_m {
                sets.union(i, j);
            }
        }
    }

    let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for index in 0..captures.len() {
        let root = sets.find(index);
        groups.entry(root).or_default().push(index);
    }
    groups.into_values().collect()
}

/// Key with the largest value; ties go to the smallest key.
fn arg_max<K: Copy + Ord>(scores: &BTreeMap<K, f64>) -> Option<K> {
    scores
        .iter()
        .fold(None::<(K, f64)>, |best, (&key, &score)| match best {
            Some((_, top)) if top >= score => best,
            _ => Some((key, score)),
        })
        .map(|(key, _)| key)
}

fn summarize(members: &[&SignalCapture], altitude_band_m: f64) -> SignalHotspot {
    let count = members.len() as f64;
    let centroid = GeoPoint::with_altitude(
        members.iter().map(|c| c.lat).sum::<f64>() / count,
        members.iter().map(|c| c.lon).sum::<f64>() / count,
        members.iter().map(|c| c.altitude).sum::<f64>() / count,
    );
    let radius = members
        .iter()
        .map(|c| haversine_m(centroid.lat, centroid.lon, c.lat, c.lon))
        .fold(0.0, f64::max);

    let total_signals: usize = members.iter().map(|c| c.signal_count()).sum();
    let average_power = if total_signals > 0 {
        members.iter().map(|c| c.total_power()).sum::<f64>() / total_signals as f64
    } else {
        -100.0
    };
    let intensity =
        ((total_signals as f64 / 100.0) * (average_power + 100.0) / 100.0).clamp(0.0, 1.0);

    let mut buckets: BTreeMap<i64, f64> = BTreeMap::new();
    let mut devices = HashSet::new();
    let mut bands: BTreeMap<i64, (f64, usize)> = BTreeMap::new();
    for capture in members {
        let band = (capture.altitude / altitude_band_m).floor() as i64;
        for signal in &capture.signals {
            *buckets
                .entry((signal.frequency / FREQUENCY_BUCKET_MHZ).floor() as i64)
                .or_default() += 1.0;
            devices.insert(signal.id.as_str());
            let entry = bands.entry(band).or_default();
            entry.0 += signal.power;
            entry.1 += 1;
        }
    }
    let band_means: BTreeMap<i64, f64> = bands
        .into_iter()
        .map(|(band, (sum, n))| (band, sum / n as f64))
        .collect();

    SignalHotspot {
        position: centroid,
        radius,
        intensity,
        dominant_frequency: arg_max(&buckets)
            .map(|bucket| bucket as f64 * FREQUENCY_BUCKET_MHZ)
            .unwrap_or(0.0),
        device_count: devices.len(),
        recommended_altitude: arg_max(&band_means)
            .map(|band| band as f64 * altitude_band_m)
            .unwrap_or(centroid.altitude.unwrap_or(0.0)),
        capture_count: members.len(),
        total_signals,
        average_power,
    }
}

/// Hotspots from captures that heard anything, strongest first.
pub fn find_hotspots(
    captures: &[SignalCapture],
    merge_m: f64,
    min_captures: usize,
    altitude_band_m: f64,
) -> Vec<SignalHotspot> {
    let heard: Vec<&SignalCapture> = captures
        .iter()
        .filter(|capture| !capture.signals.is_empty())
        .collect();

    let mut hotspots: Vec<SignalHotspot> = cluster(&heard, merge_m)
        .into_iter()
        .filter(|group| group.len() >= min_captures)
        .map(|group| {
            let members: Vec<&SignalCapture> = group.iter().map(|&i| heard[i]).collect();
            summarize(&members, altitude_band_m)
        })
        .collect();
    hotspots.sort_by(|a, b| b.intensity.total_cmp(&a.intensity));
    hotspots
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::flight::CapturedSignal;
    use chrono::Utc;

    fn capture(lat: f64, altitude: f64, signals: &[(&str, f64, f64)]) -> SignalCapture {
        SignalCapture {
            lat,
            lon: 0.0,
            altitude,
            timestamp: Utc::now(),
            signals: signals
                .iter()
                .map(|(id, frequency, power)| CapturedSignal {
                    id: id.to_string(),
                    frequency: *frequency,
                    power: *power,
                })
                .collect(),
        }
    }

    // 0.0008 deg of latitude is about 89 m.
    const STEP: f64 = 0.0008;

    #[test]
    fn pairs_are_not_hotspots() {
        let captures = vec![
            capture(0.0, 30.0, &[("a", 433.9, -40.0)]),
            capture(STEP, 30.0, &[("a", 433.9, -40.0)]),
        ];
        assert!(find_hotspots(&captures, 100.0, 3, 10.0).is_empty());
    }

    #[test]
    fn chain_links_transitively() {
        let captures = vec![
            capture(0.0, 30.0, &[("a", 433.9, -40.0)]),
            capture(STEP, 30.0, &[("a", 433.9, -40.0)]),
            capture(2.0 * STEP, 30.0, &[("b", 915.0, -40.0)]),
            capture(1.0, 30.0, &[("c", 868.0, -40.0)]),
        ];
        let hotspots = find_hotspots(&captures, 100.0, 3, 10.0);
        assert_eq!(hotspots.len(), 1);
        let hotspot = &hotspots[0];
        assert_eq!(hotspot.capture_count, 3);
        assert_eq!(hotspot.device_count, 2);
        assert!((hotspot.position.lat - STEP).abs() < 1e-12);
        assert!(hotspot.radius > 85.0 && hotspot.radius < 95.0);
    }

    #[test]
    fn hotspot_figures() {
        let captures = vec![
            capture(0.0, 12.0, &[("a", 433.9, -40.0), ("b", 450.0, -60.0)]),
            capture(0.0001, 27.0, &[("c", 915.0, -20.0)]),
            capture(0.0002, 14.0, &[("a", 433.9, -50.0)]),
        ];
        let hotspot = &find_hotspots(&captures, 100.0, 3, 10.0)[0];
        assert_eq!(hotspot.total_signals, 4);
        assert!((hotspot.average_power - -42.5).abs() < 1e-9);
        let expected = (4.0 / 100.0) * (57.5 / 100.0);
        assert!((hotspot.intensity - expected).abs() < 1e-9);
        assert_eq!(hotspot.dominant_frequency, 400.0);
        assert_eq!(hotspot.device_count, 3);
        // Band 20..30 hears -20 dB on average, band 10..20 only -50 dB.
        assert_eq!(hotspot.recommended_altitude, 20.0);
    }

    #[test]
    fn intensity_saturates() {
        let loud: Vec<(&str, f64, f64)> = vec![("x", 100.0, -1.0); 200];
        let captures = vec![
            capture(0.0, 10.0, &loud),
            capture(0.0001, 10.0, &loud),
            capture(0.0002, 10.0, &loud),
        ];
        assert_eq!(find_hotspots(&captures, 100.0, 3, 10.0)[0].intensity, 1.0);
    }

    #[test]
    fn silent_captures_are_ignored() {
        let captures = vec![
            capture(0.0, 10.0, &[("a", 100.0, -50.0)]),
            capture(0.0001, 10.0, &[]),
            capture(0.0002, 10.0, &[("a", 100.0, -50.0)]),
        ];
        assert!(find_hotspots(&captures, 100.0, 3, 10.0).is_empty());
    }
}
