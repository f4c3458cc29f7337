use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use crate::prelude::{CoreError, CoreResult};
use crate::records::{DeviceRecord, RelationshipRecord, SignalRecord};

/// Every change one store call makes, committed as a unit.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WriteBatch {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub signals: Vec<SignalRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub devices: Vec<DeviceRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub relationships: Vec<RelationshipRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deleted_signals: Vec<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deleted_devices: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deleted_relationships: Vec<String>,
}

impl WriteBatch {
    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
            && self.devices.is_empty()
            && self.relationships.is_empty()
            && self.deleted_signals.is_empty()
            && self.deleted_devices.is_empty()
            && self.deleted_relationships.is_empty()
    }
}

/// Durable side of the store. A batch either commits whole or not at all;
/// the store only applies a batch in memory after `commit` succeeds.
pub trait StorageEngine: Send {
    fn name(&self) -> &str;
    fn commit(&mut self, batch: &WriteBatch) -> CoreResult<()>;
}

/// Keeps nothing beyond the in-memory index.
#[derive(Debug, Default)]
pub struct MemoryEngine;

impl StorageEngine for MemoryEngine {
    fn name(&self) -> &str {
        "memory"
    }

    fn commit(&mut self, _batch: &WriteBatch) -> CoreResult<()> {
        Ok(())
    }
}

/// Destination of journal lines; must be able to cut a partial append back off.
trait JournalFile: Write + Send {
    fn truncate_to(&mut self, len: u64) -> io::Result<()>;
}

impl JournalFile for File {
    fn truncate_to(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }
}

/// Append-only journal, one JSON-encoded batch per line.
///
/// Each batch is written unbuffered in one call; a failed append is truncated
/// back to the last committed length so it can never surface on replay.
pub struct JournalEngine {
    path: PathBuf,
    file: Box<dyn JournalFile>,
    committed: u64,
}

impl JournalEngine {
    pub fn open<P: AsRef<Path>>(path: P) -> CoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|err| {
                    CoreError::StoreIo(format!("creating {}: {}", parent.display(), err))
                })?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|err| CoreError::StoreIo(format!("opening {}: {}", path.display(), err)))?;
        let committed = file
            .metadata()
            .map_err(|err| CoreError::StoreIo(format!("inspecting {}: {}", path.display(), err)))?
            .len();
        Ok(Self::with_file(path, Box::new(file), committed))
    }

    fn with_file(path: PathBuf, file: Box<dyn JournalFile>, committed: u64) -> Self {
        Self {
            path,
            file,
            committed,
        }
    }

    /// Reads every committed batch back in order. A missing file is an empty history.
    pub fn load<P: AsRef<Path>>(path: P) -> CoreResult<Vec<WriteBatch>> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(path)
            .map_err(|err| CoreError::StoreIo(format!("reading {}: {}", path.display(), err)))?;
        let mut batches = Vec::new();
        for (number, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|err| {
                CoreError::StoreIo(format!("reading {}: {}", path.display(), err))
            })?;
            if line.trim().is_empty() {
                continue;
            }
            let batch = serde_json::from_str(&line).map_err(|err| {
                CoreError::DataCorruption(format!(
                    "{} line {}: {}",
                    path.display(),
                    number + 1,
                    err
                ))
            })?;
            batches.push(batch);
        }
        Ok(batches)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StorageEngine for JournalEngine {
    fn name(&self) -> &str {
        "journal"
    }

    fn commit(&mut self, batch: &WriteBatch) -> CoreResult<()> {
        let mut line = serde_json::to_vec(batch)
            .map_err(|err| CoreError::StoreIo(format!("encoding batch: {}", err)))?;
        line.push(b'\n');
        let written = self
            .file
            .write_all(&line)
            .and_then(|_| self.file.flush());
        match written {
            Ok(()) => {
                self.committed += line.len() as u64;
                Ok(())
            }
            Err(err) => {
                if let Err(undo) = self.file.truncate_to(self.committed) {
                    log::error!(
                        "journal {} could not drop a failed append: {}",
                        self.path.display(),
                        undo
                    );
                }
                Err(CoreError::StoreIo(format!(
                    "writing {}: {}",
                    self.path.display(),
                    err
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn signal(id: u64) -> SignalRecord {
        SignalRecord {
            id,
            device_id: "hackrf-433--5".into(),
            timestamp: Utc::now(),
            lat: 1.0,
            lon: 2.0,
            grid_lat: 10_000,
            grid_lon: 20_000,
            power: -45.0,
            frequency: 433.9,
            source: "hackrf".into(),
            metadata: serde_json::Value::Null,
        }
    }

    #[test]
    fn journal_round_trips_batches_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store").join("journal.jsonl");
        {
            let mut engine = JournalEngine::open(&path).unwrap();
            for id in 1..=2 {
                let batch = WriteBatch {
                    signals: vec![signal(id)],
                    ..Default::default()
                };
                engine.commit(&batch).unwrap();
            }
        }
        let batches = JournalEngine::load(&path).unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[1].signals[0].id, 2);
    }

    /// In-memory journal file whose first write stops halfway with an error.
    struct FlakyFile {
        bytes: std::sync::Arc<std::sync::Mutex<Vec<u8>>>,
        fail_next: bool,
    }

    impl Write for FlakyFile {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let mut bytes = self.bytes.lock().unwrap();
            if self.fail_next {
                self.fail_next = false;
                bytes.extend_from_slice(&buf[..buf.len() / 2]);
                return Err(io::Error::new(io::ErrorKind::Other, "device full"));
            }
            bytes.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl JournalFile for FlakyFile {
        fn truncate_to(&mut self, len: u64) -> io::Result<()> {
            self.bytes.lock().unwrap().truncate(len as usize);
            Ok(())
        }
    }

    #[test]
    fn failed_append_never_reaches_the_journal() {
        let bytes = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let file = FlakyFile {
            bytes: bytes.clone(),
            fail_next: true,
        };
        let mut engine = JournalEngine::with_file("flaky.jsonl".into(), Box::new(file), 0);
        let rejected = WriteBatch {
            signals: vec![signal(1)],
            ..Default::default()
        };
        assert!(matches!(engine.commit(&rejected), Err(CoreError::StoreIo(_))));
        assert!(bytes.lock().unwrap().is_empty());

        let accepted = WriteBatch {
            signals: vec![signal(1)],
            deleted_signals: vec![9],
            ..Default::default()
        };
        engine.commit(&accepted).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("replay.jsonl");
        std::fs::write(&path, bytes.lock().unwrap().as_slice()).unwrap();
        let batches = JournalEngine::load(&path).unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].signals[0].id, 1);
        assert_eq!(batches[0].deleted_signals, vec![9]);
    }

    #[test]
    fn reopened_journal_appends_after_existing_batches() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.jsonl");
        for id in 1..=2 {
            let mut engine = JournalEngine::open(&path).unwrap();
            engine
                .commit(&WriteBatch {
                    signals: vec![signal(id)],
                    ..Default::default()
                })
                .unwrap();
        }
        let ids: Vec<u64> = JournalEngine::load(&path)
            .unwrap()
            .iter()
            .map(|batch| batch.signals[0].id)
            .collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn missing_journal_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(JournalEngine::load(dir.path().join("none.jsonl"))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn corrupt_journal_line_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.jsonl");
        std::fs::write(&path, "{not json}\n").unwrap();
        assert!(matches!(
            JournalEngine::load(&path),
            Err(CoreError::DataCorruption(_))
        ));
    }
}
