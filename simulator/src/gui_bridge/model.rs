use crate::workflow::runner::IngestStats;
use serde::{Deserialize, Serialize};
use sweepcore::store::{RadiusQuery, StoreStatistics};
use sweepcore::sweep::SweepStatus;
use sweepcore::telemetry::Metrics;

/// Body of `POST /start`; omitted fields fall back to the workflow config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StartRequest {
    pub frequencies: Option<Vec<f64>>,
    pub dwell_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartReply {
    pub started: bool,
    pub status: SweepStatus,
}

/// Query string of `GET /signals`; the observer position is used when no
/// centre is given.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalsQuery {
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    #[serde(default = "default_radius")]
    pub radius_m: f64,
    /// Only signals seen within this many minutes.
    pub minutes: Option<i64>,
    pub min_power: Option<f64>,
    pub limit: Option<usize>,
}

fn default_radius() -> f64 {
    100.0
}

impl SignalsQuery {
    pub fn to_radius_query(&self, default_lat: f64, default_lon: f64) -> RadiusQuery {
        let mut query = RadiusQuery::new(
            self.lat.unwrap_or(default_lat),
            self.lon.unwrap_or(default_lon),
            self.radius_m,
        );
        if let Some(minutes) = self.minutes {
            query = query.since(chrono::Utc::now() - chrono::Duration::minutes(minutes));
        }
        if let Some(min_power) = self.min_power {
            query = query.min_power(min_power);
        }
        if let Some(limit) = self.limit {
            query = query.limit(limit);
        }
        query
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsReply {
    pub sweep: Metrics,
    pub store: Metrics,
    pub ingest: IngestStats,
    pub statistics: StoreStatistics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReply {
    pub error: String,
}
