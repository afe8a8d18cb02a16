//! Flight recorder
//!
//! A bounded in-memory ring of recent engine events: presence transitions,
//! target writes, alarm timer arms/disarms, parameter changes. SIGUSR1
//! serializes the ring (plus whatever state snapshot the daemon attaches)
//! to the dump file for `fanctl dump` / `fanctl query_dump`.

use std::collections::VecDeque;
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;

use crate::constants::defaults;

#[derive(Debug, Clone, Serialize)]
pub struct FlightRecord {
    /// Milliseconds since daemon start
    pub ms: u64,
    pub subsystem: String,
    pub message: String,
}

/// Bounded ring of recent events.
pub struct FlightRecorder {
    started: Instant,
    capacity: usize,
    entries: Mutex<VecDeque<FlightRecord>>,
}

impl FlightRecorder {
    pub fn new() -> Self {
        Self::with_capacity(defaults::FLIGHT_RECORDER_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            started: Instant::now(),
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Append an event, evicting the oldest when full.
    pub fn log(&self, subsystem: &str, message: impl Into<String>) {
        let record = FlightRecord {
            ms: self.started.elapsed().as_millis() as u64,
            subsystem: subsystem.to_string(),
            message: message.into(),
        };

        let mut entries = self.entries.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(record);
    }

    /// Snapshot the ring oldest-first.
    pub fn snapshot(&self) -> Vec<FlightRecord> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({ "events": self.snapshot() })
    }
}

impl Default for FlightRecorder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_eviction() {
        let recorder = FlightRecorder::with_capacity(3);
        for i in 0..5 {
            recorder.log("test", format!("event {}", i));
        }
        let events = recorder.snapshot();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].message, "event 2");
        assert_eq!(events[2].message, "event 4");
    }

    #[test]
    fn test_json_shape() {
        let recorder = FlightRecorder::with_capacity(4);
        recorder.log("presence", "fan0 present=false");
        let json = recorder.to_json();
        assert_eq!(json["events"][0]["subsystem"], "presence");
    }
}
