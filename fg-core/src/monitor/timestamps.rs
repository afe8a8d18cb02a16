//! Persisted alarm start times
//!
//! When a shutdown grace timer starts, its wall-clock start time is written
//! to disk so a daemon or BMC restart mid-countdown resumes with the
//! remaining delay instead of the full one. The on-disk format is a JSON
//! array of `[sensorPath, severityInt, directionInt, startMsSinceEpoch]`
//! records; writes go through a temp file and rename so a power loss
//! mid-write cannot corrupt the store.

use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::constants::files;
use crate::monitor::alarm::{AlarmDirection, AlarmKey, AlarmSeverity};

type Record = (String, i32, i32, u64);

pub struct AlarmTimestamps {
    path: PathBuf,
    timestamps: HashMap<AlarmKey, u64>,
}

impl AlarmTimestamps {
    /// Load any saved timestamps from `dir`. A file that cannot be parsed
    /// is deleted and the store starts empty.
    pub fn load(dir: &Path) -> Self {
        let path = dir.join(files::TIMESTAMPS);
        let mut store = Self {
            path,
            timestamps: HashMap::new(),
        };

        let content = match std::fs::read_to_string(&store.path) {
            Ok(content) => content,
            Err(_) => return store,
        };

        match serde_json::from_str::<Vec<Record>>(&content) {
            Ok(records) => {
                for (sensor_path, severity, direction, start_ms) in records {
                    match (
                        AlarmSeverity::from_int(severity),
                        AlarmDirection::from_int(direction),
                    ) {
                        (Some(severity), Some(direction)) => {
                            store.timestamps.insert(
                                AlarmKey::new(sensor_path, severity, direction),
                                start_ms,
                            );
                        }
                        _ => warn!(
                            sensor = %sensor_path,
                            severity,
                            direction,
                            "dropping persisted timestamp with unknown severity/direction"
                        ),
                    }
                }
            }
            Err(e) => {
                warn!(
                    path = %store.path.display(),
                    error = %e,
                    "unable to restore persisted alarm start times, starting empty"
                );
                let _ = std::fs::remove_file(&store.path);
            }
        }

        store
    }

    pub fn get(&self, key: &AlarmKey) -> Option<u64> {
        self.timestamps.get(key).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    /// Record a start time. An existing entry is kept as-is so a timer
    /// re-armed after a restart preserves its original start.
    pub fn add(&mut self, key: AlarmKey, start_ms: u64) {
        if let std::collections::hash_map::Entry::Vacant(entry) = self.timestamps.entry(key) {
            entry.insert(start_ms);
            self.save();
        }
    }

    pub fn erase(&mut self, key: &AlarmKey) {
        if self.timestamps.remove(key).is_some() {
            self.save();
        }
    }

    pub fn clear(&mut self) {
        if !self.timestamps.is_empty() {
            self.timestamps.clear();
            self.save();
        }
    }

    /// Drop entries whose alarm has no running timer. Used at startup to
    /// discard alarms that cleared during a restart.
    pub fn prune(&mut self, running: &HashSet<AlarmKey>) {
        let before = self.timestamps.len();
        self.timestamps.retain(|key, _| running.contains(key));
        if self.timestamps.len() != before {
            self.save();
        }
    }

    fn save(&self) {
        if let Some(parent) = self.path.parent() {
            if !parent.exists() {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    warn!(path = %parent.display(), error = %e, "cannot create persist directory");
                    return;
                }
            }
        }

        let records: Vec<Record> = self
            .timestamps
            .iter()
            .map(|(key, start_ms)| {
                (
                    key.sensor_path.clone(),
                    key.severity.as_int(),
                    key.direction.as_int(),
                    *start_ms,
                )
            })
            .collect();

        let json = match serde_json::to_string(&records) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "cannot serialize alarm start times");
                return;
            }
        };

        // Atomic write: temp file then rename, so a crash mid-write leaves
        // the previous file intact.
        let temp_path = self.path.with_extension("tmp");
        let result = std::fs::File::create(&temp_path)
            .and_then(|mut file| {
                file.write_all(json.as_bytes())?;
                file.sync_all()
            })
            .and_then(|_| std::fs::rename(&temp_path, &self.path));

        match result {
            Ok(()) => debug!(count = self.timestamps.len(), "alarm start times saved"),
            Err(e) => warn!(path = %self.path.display(), error = %e, "alarm start time save failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(sensor: &str) -> AlarmKey {
        AlarmKey::new(sensor, AlarmSeverity::HardShutdown, AlarmDirection::High)
    }

    #[test]
    fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();

        {
            let mut store = AlarmTimestamps::load(dir.path());
            store.add(key("/sensors/temperature/cpu0"), 1_000_000);
            store.add(
                AlarmKey::new(
                    "/sensors/temperature/dimm3",
                    AlarmSeverity::SoftShutdown,
                    AlarmDirection::Low,
                ),
                2_000_000,
            );
        }

        let store = AlarmTimestamps::load(dir.path());
        assert_eq!(store.get(&key("/sensors/temperature/cpu0")), Some(1_000_000));
        assert_eq!(
            store.get(&AlarmKey::new(
                "/sensors/temperature/dimm3",
                AlarmSeverity::SoftShutdown,
                AlarmDirection::Low,
            )),
            Some(2_000_000)
        );
    }

    #[test]
    fn test_add_keeps_existing_start() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = AlarmTimestamps::load(dir.path());
        store.add(key("/s"), 100);
        store.add(key("/s"), 200);
        assert_eq!(store.get(&key("/s")), Some(100));
    }

    #[test]
    fn test_erase_removes_persisted_entry() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = AlarmTimestamps::load(dir.path());
            store.add(key("/s"), 100);
            store.erase(&key("/s"));
        }
        let store = AlarmTimestamps::load(dir.path());
        assert_eq!(store.get(&key("/s")), None);
    }

    #[test]
    fn test_prune_drops_stopped_alarms() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = AlarmTimestamps::load(dir.path());
        store.add(key("/alive"), 1);
        store.add(key("/stale"), 2);

        let mut running = HashSet::new();
        running.insert(key("/alive"));
        store.prune(&running);

        assert_eq!(store.get(&key("/alive")), Some(1));
        assert_eq!(store.get(&key("/stale")), None);
    }

    #[test]
    fn test_corrupt_file_is_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(files::TIMESTAMPS);
        std::fs::write(&path, "not json at all").unwrap();

        let store = AlarmTimestamps::load(dir.path());
        assert!(store.is_empty());
        assert!(!path.exists());
    }
}
