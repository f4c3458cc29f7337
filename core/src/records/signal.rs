use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A detected emission at a place and time, as handed to the store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignalObservation {
    /// Explicit device identity; derived from the signal fingerprint when absent.
    #[serde(default)]
    pub device_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub lat: f64,
    pub lon: f64,
    pub power: f64,
    /// Frequency in MHz.
    pub frequency: f64,
    pub source: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl SignalObservation {
    pub fn new(
        timestamp: DateTime<Utc>,
        lat: f64,
        lon: f64,
        power: f64,
        frequency: f64,
        source: impl Into<String>,
    ) -> Self {
        Self {
            device_id: None,
            timestamp,
            lat,
            lon,
            power,
            frequency,
            source: source.into(),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_device(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }
}

/// Persisted, append-only observation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignalRecord {
    pub id: u64,
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub lat: f64,
    pub lon: f64,
    pub grid_lat: i64,
    pub grid_lon: i64,
    pub power: f64,
    pub frequency: f64,
    pub source: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Rolling aggregate over every signal attributed to one approximate emitter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub avg_power: f64,
    pub freq_min: f64,
    pub freq_max: f64,
    pub signal_count: u64,
    pub last_lat: f64,
    pub last_lon: f64,
}

impl DeviceRecord {
    pub fn from_signal(signal: &SignalRecord) -> Self {
        Self {
            id: signal.device_id.clone(),
            kind: signal.source.clone(),
            first_seen: signal.timestamp,
            last_seen: signal.timestamp,
            avg_power: signal.power,
            freq_min: signal.frequency,
            freq_max: signal.frequency,
            signal_count: 1,
            last_lat: signal.lat,
            last_lon: signal.lon,
        }
    }
}

/// Co-occurrence edge supplied by a caller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelationshipEdge {
    pub source_device_id: String,
    pub target_device_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub strength: f64,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelationshipRecord {
    pub id: String,
    pub source_device_id: String,
    pub target_device_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub strength: f64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl RelationshipRecord {
    pub fn key(source: &str, target: &str, kind: &str) -> String {
        format!("{}:{}:{}", source, target, kind)
    }
}
