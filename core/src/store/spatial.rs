use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

use crate::math::geo::{haversine_m, GeoBounds, GeoPoint};
use crate::math::stats::StatsHelper;
use crate::prelude::{CoreError, CoreResult};
use crate::records::{
    DeviceRecord, RelationshipEdge, RelationshipRecord, SignalObservation, SignalRecord,
};
use crate::store::engine::{MemoryEngine, StorageEngine, WriteBatch};
use crate::store::fingerprint::derive_device_id;
use crate::store::grid::{GridCell, GridIndex};
use crate::telemetry::{LogManager, Metrics, MetricsRecorder};

/// Signals within `radius_meters` of a point, optionally narrowed by time and power.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RadiusQuery {
    pub lat: f64,
    pub lon: f64,
    pub radius_meters: f64,
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
    #[serde(default)]
    pub until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub min_power: Option<f64>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl RadiusQuery {
    pub fn new(lat: f64, lon: f64, radius_meters: f64) -> Self {
        Self {
            lat,
            lon,
            radius_meters,
            since: None,
            until: None,
            min_power: None,
            limit: None,
        }
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: DateTime<Utc>) -> Self {
        self.until = Some(until);
        self
    }

    pub fn min_power(mut self, min_power: f64) -> Self {
        self.min_power = Some(min_power);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn accepts(&self, signal: &SignalRecord) -> bool {
        self.since.map_or(true, |since| signal.timestamp >= since)
            && self.until.map_or(true, |until| signal.timestamp <= until)
            && self.min_power.map_or(true, |floor| signal.power >= floor)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StoreStatistics {
    pub total_signals: usize,
    pub total_devices: usize,
    pub total_relationships: usize,
    pub occupied_cells: usize,
    pub window_signals: usize,
    pub window_devices: usize,
    pub window_avg_power: Option<f64>,
    pub window_freq_min: Option<f64>,
    pub window_freq_max: Option<f64>,
    pub oldest_signal: Option<DateTime<Utc>>,
    pub newest_signal: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct CleanupReport {
    pub signals_removed: usize,
    pub devices_removed: usize,
    pub devices_refolded: usize,
    pub relationships_removed: usize,
}

/// Folds one more signal into a device aggregate.
fn fold_signal(device: &mut DeviceRecord, signal: &SignalRecord) {
    device.avg_power =
        StatsHelper::incremental_mean(device.avg_power, device.signal_count, signal.power);
    device.signal_count += 1;
    device.freq_min = device.freq_min.min(signal.frequency);
    device.freq_max = device.freq_max.max(signal.frequency);
    if signal.timestamp < device.first_seen {
        device.first_seen = signal.timestamp;
    }
    if signal.timestamp >= device.last_seen {
        device.last_seen = signal.timestamp;
        device.last_lat = signal.lat;
        device.last_lon = signal.lon;
    }
}

/// In-memory tables plus the indexes over them.
#[derive(Default)]
struct Tables {
    signals: BTreeMap<u64, SignalRecord>,
    grid: GridIndex,
    by_device: HashMap<String, BTreeSet<u64>>,
    devices: HashMap<String, DeviceRecord>,
    relationships: HashMap<String, RelationshipRecord>,
    next_id: u64,
}

impl Tables {
    fn apply(&mut self, batch: &WriteBatch) {
        for id in &batch.deleted_signals {
            if let Some(signal) = self.signals.remove(id) {
                self.grid
                    .remove(GridCell::of(signal.lat, signal.lon), signal.id);
                if let Some(ids) = self.by_device.get_mut(&signal.device_id) {
                    ids.remove(&signal.id);
                    if ids.is_empty() {
                        self.by_device.remove(&signal.device_id);
                    }
                }
            }
        }
        for signal in &batch.signals {
            self.grid.insert(
                GridCell {
                    lat: signal.grid_lat,
                    lon: signal.grid_lon,
                },
                signal.id,
            );
            self.by_device
                .entry(signal.device_id.clone())
                .or_default()
                .insert(signal.id);
            self.next_id = self.next_id.max(signal.id + 1);
            self.signals.insert(signal.id, signal.clone());
        }
        for id in &batch.deleted_devices {
            self.devices.remove(id);
        }
        for device in &batch.devices {
            self.devices.insert(device.id.clone(), device.clone());
        }
        for id in &batch.deleted_relationships {
            self.relationships.remove(id);
        }
        for relationship in &batch.relationships {
            self.relationships
                .insert(relationship.id.clone(), relationship.clone());
        }
    }

    /// Recomputes a device from the signals still attributed to it, in ingest order.
    fn refold_device(&self, device_id: &str, removed: &BTreeSet<u64>) -> Option<DeviceRecord> {
        let ids = self.by_device.get(device_id)?;
        let mut remaining = ids
            .iter()
            .filter(|id| !removed.contains(id))
            .filter_map(|id| self.signals.get(id));
        let first = remaining.next()?;
        let mut device = DeviceRecord::from_signal(first);
        if let Some(existing) = self.devices.get(device_id) {
            device.kind = existing.kind.clone();
        }
        for signal in remaining {
            fold_signal(&mut device, signal);
        }
        Some(device)
    }
}

struct Inner {
    tables: Tables,
    engine: Box<dyn StorageEngine>,
}

/// Grid-indexed store of signal observations and per-device aggregates.
///
/// Each public call holds the store lock for its own duration only and is
/// committed to the engine as one batch; nothing is applied when the engine
/// rejects it. Callers racing on the same device see their updates serialized
/// in lock order, with no isolation across calls.
pub struct SpatialSignalStore {
    inner: Mutex<Inner>,
    metrics: MetricsRecorder,
    logger: LogManager,
}

impl SpatialSignalStore {
    pub fn new(engine: Box<dyn StorageEngine>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                tables: Tables {
                    next_id: 1,
                    ..Default::default()
                },
                engine,
            }),
            metrics: MetricsRecorder::new(),
            logger: LogManager::new("store"),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Box::new(MemoryEngine))
    }

    /// Rebuilds the tables from previously committed batches, then keeps
    /// committing new ones to `engine`.
    pub fn restore(engine: Box<dyn StorageEngine>, history: &[WriteBatch]) -> Self {
        let store = Self::new(engine);
        if let Ok(mut inner) = store.inner.lock() {
            for batch in history {
                inner.tables.apply(batch);
            }
            store.logger.record(&format!(
                "restored {} signals, {} devices from {} batches",
                inner.tables.signals.len(),
                inner.tables.devices.len(),
                history.len()
            ));
        }
        store
    }

    fn lock(&self) -> CoreResult<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| CoreError::StoreIo("store lock poisoned".into()))
    }

    fn commit(inner: &mut Inner, batch: WriteBatch) -> CoreResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        inner.engine.commit(&batch)?;
        inner.tables.apply(&batch);
        Ok(())
    }

    pub fn metrics(&self) -> Metrics {
        self.metrics.snapshot()
    }

    pub fn store_signal(&self, observation: SignalObservation) -> CoreResult<SignalRecord> {
        self.store_signals_batch(vec![observation])?
            .pop()
            .ok_or_else(|| CoreError::StoreIo("store returned no record".into()))
    }

    /// Stores all observations or none. Device deltas are folded in memory first
    /// so a device hit many times in one batch is written once.
    pub fn store_signals_batch(
        &self,
        observations: Vec<SignalObservation>,
    ) -> CoreResult<Vec<SignalRecord>> {
        for (index, observation) in observations.iter().enumerate() {
            validate_observation(observation)
                .map_err(|reason| {
                    CoreError::DataCorruption(format!("signal {}: {}", index, reason))
                })?;
        }
        if observations.is_empty() {
            return Ok(Vec::new());
        }

        let mut inner = self.lock()?;
        let first_id = inner.tables.next_id;
        let mut records = Vec::with_capacity(observations.len());
        let mut deltas: HashMap<String, DeviceRecord> = HashMap::new();
        let mut touched = Vec::new();

        for (offset, observation) in observations.into_iter().enumerate() {
            let device_id = observation.device_id.clone().unwrap_or_else(|| {
                derive_device_id(&observation.source, observation.frequency, observation.power)
            });
            let cell = GridCell::of(observation.lat, observation.lon);
            let record = SignalRecord {
                id: first_id + offset as u64,
                device_id,
                timestamp: observation.timestamp,
                lat: observation.lat,
                lon: observation.lon,
                grid_lat: cell.lat,
                grid_lon: cell.lon,
                power: observation.power,
                frequency: observation.frequency,
                source: observation.source,
                metadata: observation.metadata,
            };

            match deltas.get_mut(&record.device_id) {
                Some(device) => fold_signal(device, &record),
                None => {
                    let device = match inner.tables.devices.get(&record.device_id) {
                        Some(existing) => {
                            let mut device = existing.clone();
                            fold_signal(&mut device, &record);
                            device
                        }
                        None => DeviceRecord::from_signal(&record),
                    };
                    touched.push(record.device_id.clone());
                    deltas.insert(record.device_id.clone(), device);
                }
            }
            records.push(record);
        }

        let devices = touched
            .iter()
            .filter_map(|id| deltas.remove(id))
            .collect::<Vec<_>>();
        let device_count = devices.len();
        let batch = WriteBatch {
            signals: records.clone(),
            devices,
            ..Default::default()
        };
        Self::commit(&mut inner, batch)?;
        drop(inner);

        self.metrics.record_stored(records.len());
        self.logger.detail(&format!(
            "stored {} signals across {} devices",
            records.len(),
            device_count
        ));
        Ok(records)
    }

    /// Exact radius search: grid cells first, haversine filter second.
    /// Results are ordered nearest first.
    pub fn find_signals_in_radius(&self, query: &RadiusQuery) -> CoreResult<Vec<SignalRecord>> {
        if !GeoPoint::new(query.lat, query.lon).is_valid() {
            return Err(CoreError::InvalidConfig(format!(
                "query centre {},{} out of range",
                query.lat, query.lon
            )));
        }
        if !query.radius_meters.is_finite() || query.radius_meters <= 0.0 {
            return Err(CoreError::InvalidConfig("radius must be positive".into()));
        }

        let inner = self.lock()?;
        let tables = &inner.tables;
        let mut hits: Vec<(f64, &SignalRecord)> = tables
            .grid
            .candidates_in_radius(query.lat, query.lon, query.radius_meters)
            .into_iter()
            .filter_map(|id| tables.signals.get(&id))
            .filter(|signal| query.accepts(signal))
            .map(|signal| {
                (
                    haversine_m(query.lat, query.lon, signal.lat, signal.lon),
                    signal,
                )
            })
            .filter(|(distance, _)| *distance <= query.radius_meters)
            .collect();
        hits.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.id.cmp(&b.1.id)));

        let limit = query.limit.unwrap_or(usize::MAX);
        Ok(hits
            .into_iter()
            .take(limit)
            .map(|(_, signal)| signal.clone())
            .collect())
    }

    /// Signals inside `bounds`, optionally only those at or after `since`, oldest first.
    pub fn find_signals_in_bounds(
        &self,
        bounds: &GeoBounds,
        since: Option<DateTime<Utc>>,
    ) -> CoreResult<Vec<SignalRecord>> {
        if !bounds.is_valid() {
            return Err(CoreError::InvalidConfig("bounds are inverted or non-finite".into()));
        }
        let inner = self.lock()?;
        let tables = &inner.tables;
        let mut ids = tables.grid.candidates_in_bounds(bounds);
        ids.sort_unstable();
        Ok(ids
            .into_iter()
            .filter_map(|id| tables.signals.get(&id))
            .filter(|signal| bounds.contains(signal.lat, signal.lon))
            .filter(|signal| since.map_or(true, |since| signal.timestamp >= since))
            .cloned()
            .collect())
    }

    /// Devices whose last known position lies inside `bounds`, most recent first.
    pub fn devices_in_area(&self, bounds: &GeoBounds) -> CoreResult<Vec<DeviceRecord>> {
        if !bounds.is_valid() {
            return Err(CoreError::InvalidConfig("bounds are inverted or non-finite".into()));
        }
        let inner = self.lock()?;
        let mut devices: Vec<DeviceRecord> = inner
            .tables
            .devices
            .values()
            .filter(|device| bounds.contains(device.last_lat, device.last_lon))
            .cloned()
            .collect();
        devices.sort_by(|a, b| b.last_seen.cmp(&a.last_seen).then(a.id.cmp(&b.id)));
        Ok(devices)
    }

    pub fn device(&self, id: &str) -> CoreResult<Option<DeviceRecord>> {
        Ok(self.lock()?.tables.devices.get(id).cloned())
    }

    pub fn signals_for_device(&self, id: &str) -> CoreResult<Vec<SignalRecord>> {
        let inner = self.lock()?;
        let tables = &inner.tables;
        Ok(tables
            .by_device
            .get(id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| tables.signals.get(id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Upserts co-occurrence edges keyed by `(source, target, type)`. The latest
    /// observation sets the strength; first/last seen widen.
    pub fn store_relationships(&self, edges: Vec<RelationshipEdge>) -> CoreResult<usize> {
        for (index, edge) in edges.iter().enumerate() {
            if edge.source_device_id.is_empty() || edge.target_device_id.is_empty() {
                return Err(CoreError::DataCorruption(format!(
                    "relationship {}: empty device id",
                    index
                )));
            }
            if !edge.strength.is_finite() {
                return Err(CoreError::DataCorruption(format!(
                    "relationship {}: non-finite strength",
                    index
                )));
            }
        }

        let mut inner = self.lock()?;
        let mut merged: BTreeMap<String, RelationshipRecord> = BTreeMap::new();
        for edge in edges {
            let id = RelationshipRecord::key(
                &edge.source_device_id,
                &edge.target_device_id,
                &edge.kind,
            );
            let current = merged
                .remove(&id)
                .or_else(|| inner.tables.relationships.get(&id).cloned());
            let record = match current {
                Some(mut existing) => {
                    if edge.observed_at >= existing.last_seen {
                        existing.strength = edge.strength;
                        existing.last_seen = edge.observed_at;
                    }
                    if edge.observed_at < existing.first_seen {
                        existing.first_seen = edge.observed_at;
                    }
                    existing
                }
                None => RelationshipRecord {
                    id: id.clone(),
                    source_device_id: edge.source_device_id,
                    target_device_id: edge.target_device_id,
                    kind: edge.kind,
                    strength: edge.strength,
                    first_seen: edge.observed_at,
                    last_seen: edge.observed_at,
                },
            };
            merged.insert(id, record);
        }

        let count = merged.len();
        let batch = WriteBatch {
            relationships: merged.into_values().collect(),
            ..Default::default()
        };
        Self::commit(&mut inner, batch)?;
        Ok(count)
    }

    pub fn relationships_for(&self, device_id: &str) -> CoreResult<Vec<RelationshipRecord>> {
        let inner = self.lock()?;
        let mut found: Vec<RelationshipRecord> = inner
            .tables
            .relationships
            .values()
            .filter(|r| r.source_device_id == device_id || r.target_device_id == device_id)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(found)
    }

    /// Totals plus figures for signals seen within `time_window` of now.
    pub fn statistics(&self, time_window: Option<Duration>) -> CoreResult<StoreStatistics> {
        self.statistics_at(Utc::now(), time_window)
    }

    pub fn statistics_at(
        &self,
        now: DateTime<Utc>,
        time_window: Option<Duration>,
    ) -> CoreResult<StoreStatistics> {
        let inner = self.lock()?;
        let tables = &inner.tables;
        let cutoff = time_window.map(|window| now - window);
        let in_window = |at: DateTime<Utc>| cutoff.map_or(true, |cutoff| at >= cutoff);

        let window_signals: Vec<&SignalRecord> = tables
            .signals
            .values()
            .filter(|signal| in_window(signal.timestamp))
            .collect();
        let powers: Vec<f64> = window_signals.iter().map(|signal| signal.power).collect();
        let window_freq_min = window_signals
            .iter()
            .map(|signal| signal.frequency)
            .reduce(f64::min);
        let window_freq_max = window_signals
            .iter()
            .map(|signal| signal.frequency)
            .reduce(f64::max);

        Ok(StoreStatistics {
            total_signals: tables.signals.len(),
            total_devices: tables.devices.len(),
            total_relationships: tables.relationships.len(),
            occupied_cells: tables.grid.occupied_cells(),
            window_signals: window_signals.len(),
            window_devices: tables
                .devices
                .values()
                .filter(|device| in_window(device.last_seen))
                .count(),
            window_avg_power: if powers.is_empty() {
                None
            } else {
                Some(StatsHelper::mean(&powers))
            },
            window_freq_min,
            window_freq_max,
            oldest_signal: tables.signals.values().map(|s| s.timestamp).min(),
            newest_signal: tables.signals.values().map(|s| s.timestamp).max(),
        })
    }

    /// Deletes signals older than `now - max_age`.
    pub fn cleanup_old_data(&self, max_age: Duration) -> CoreResult<CleanupReport> {
        self.cleanup_older_than(Utc::now() - max_age)
    }

    /// Deletes signals older than `cutoff` and refolds the devices they fed, so
    /// each device still matches the signals it has left. Devices left with no
    /// signals are dropped along with their relationships.
    pub fn cleanup_older_than(&self, cutoff: DateTime<Utc>) -> CoreResult<CleanupReport> {
        let mut inner = self.lock()?;
        let tables = &inner.tables;

        let removed: BTreeSet<u64> = tables
            .signals
            .values()
            .filter(|signal| signal.timestamp < cutoff)
            .map(|signal| signal.id)
            .collect();
        if removed.is_empty() {
            return Ok(CleanupReport::default());
        }

        let affected: BTreeSet<&str> = removed
            .iter()
            .filter_map(|id| tables.signals.get(id))
            .map(|signal| signal.device_id.as_str())
            .collect();

        let mut batch = WriteBatch {
            deleted_signals: removed.iter().copied().collect(),
            ..Default::default()
        };
        for device_id in affected {
            match tables.refold_device(device_id, &removed) {
                Some(device) => batch.devices.push(device),
                None => batch.deleted_devices.push(device_id.to_string()),
            }
        }
        batch.deleted_relationships = tables
            .relationships
            .values()
            .filter(|r| {
                batch.deleted_devices.contains(&r.source_device_id)
                    || batch.deleted_devices.contains(&r.target_device_id)
            })
            .map(|r| r.id.clone())
            .collect();

        let report = CleanupReport {
            signals_removed: batch.deleted_signals.len(),
            devices_removed: batch.deleted_devices.len(),
            devices_refolded: batch.devices.len(),
            relationships_removed: batch.deleted_relationships.len(),
        };
        Self::commit(&mut inner, batch)?;
        drop(inner);

        self.logger.record(&format!(
            "retention removed {} signals, {} devices",
            report.signals_removed, report.devices_removed
        ));
        Ok(report)
    }
}

fn validate_observation(observation: &SignalObservation) -> Result<(), String> {
    if !GeoPoint::new(observation.lat, observation.lon).is_valid() {
        return Err(format!(
            "position {},{} out of range",
            observation.lat, observation.lon
        ));
    }
    if !observation.power.is_finite() {
        return Err("power is not finite".into());
    }
    if !observation.frequency.is_finite() || observation.frequency <= 0.0 {
        return Err("frequency must be positive".into());
    }
    if observation.source.is_empty() {
        return Err("source is empty".into());
    }
    Ok(())
}
