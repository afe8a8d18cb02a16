//! Recovery-action configuration (`recovery-action.json`)
//!
//! After a protective shutdown, the recovery monitor watches the tripping
//! sensor's Critical/Warning alarms: once the sensor stays untripped for the
//! configured stable countdown, the recovery systemd target is started.

use std::path::Path;

use fg_error::{FanGuardError, Result};
use serde::{Deserialize, Serialize};

use super::load_json;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// systemd unit started when a sensor proves stable again
    pub target: String,
    pub sensors: Vec<SensorRecovery>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorRecovery {
    pub path: String,
    pub thresholds: Vec<ThresholdCountdown>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdCountdown {
    /// Alarm property name, e.g. `CriticalAlarmHigh`
    pub alarm: String,
    /// Milliseconds the sensor must stay untripped
    #[serde(rename = "stableCountdown")]
    pub stable_countdown: u64,
}

impl RecoveryConfig {
    /// Countdowns configured for one sensor path.
    pub fn sensor(&self, path: &str) -> Option<&SensorRecovery> {
        self.sensors.iter().find(|s| s.path == path)
    }
}

/// Load and validate `recovery-action.json`.
pub fn load_recovery_config(path: &Path) -> Result<RecoveryConfig> {
    let config: RecoveryConfig = load_json(path)?;

    if config.target.is_empty() {
        return Err(FanGuardError::MissingConfig(format!(
            "{}: empty recovery target",
            path.display()
        )));
    }

    const KNOWN_ALARMS: &[&str] = &[
        "CriticalAlarmLow",
        "CriticalAlarmHigh",
        "WarningAlarmLow",
        "WarningAlarmHigh",
    ];

    for sensor in &config.sensors {
        for threshold in &sensor.thresholds {
            if !KNOWN_ALARMS.contains(&threshold.alarm.as_str()) {
                return Err(FanGuardError::InvalidConfig {
                    field: format!("sensors[{}].thresholds", sensor.path),
                    reason: format!("'{}' is not a recovery alarm property", threshold.alarm),
                });
            }
        }
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_lookup() {
        let config: RecoveryConfig = serde_json::from_str(
            r#"{
              "target": "obmc-chassis-poweron@0.target",
              "sensors": [
                { "path": "/xyz/openbmc_project/sensors/temperature/cpu0",
                  "thresholds": [
                    { "alarm": "CriticalAlarmHigh", "stableCountdown": 60000 }
                  ] }
              ]
            }"#,
        )
        .unwrap();

        let sensor = config
            .sensor("/xyz/openbmc_project/sensors/temperature/cpu0")
            .unwrap();
        assert_eq!(sensor.thresholds[0].stable_countdown, 60000);
        assert!(config.sensor("/nope").is_none());
    }

    #[test]
    fn test_rejects_unknown_alarm() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recovery-action.json");
        std::fs::write(
            &path,
            r#"{ "target": "t.target", "sensors": [
                 { "path": "/s", "thresholds": [ { "alarm": "HardShutdownAlarmHigh", "stableCountdown": 5 } ] } ] }"#,
        )
        .unwrap();
        assert!(load_recovery_config(&path).is_err());
    }
}
