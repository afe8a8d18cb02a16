//! Presence configuration (`presence.json`)

use std::path::{Path, PathBuf};

use fg_error::{FanGuardError, Result};
use serde::{Deserialize, Serialize};

use super::load_json;

/// Top-level presence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceConfig {
    /// Missing-fan reporting defaults
    #[serde(default)]
    pub reporting: ReportingConfig,
    pub fans: Vec<FanPresenceConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportingConfig {
    /// Seconds a fan must be missing with power on before an event log,
    /// applied to fans without their own override. Zero disables reporting.
    #[serde(default)]
    pub fan_missing_error_time: u64,
}

/// One fan's presence definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanPresenceConfig {
    /// Human-readable name published as PrettyName
    pub name: String,
    /// Inventory object path
    pub path: String,
    /// How sensor verdicts are fused
    #[serde(default)]
    pub rpolicy: PolicyKind,
    /// Per-fan missing-time override in seconds
    #[serde(default)]
    pub fan_missing_error_time: Option<u64>,
    /// Optional EEPROM device bound on plug
    #[serde(default)]
    pub eeprom: Option<EepromConfig>,
    /// Detection methods, in priority order for the fallback policy
    pub methods: Vec<PresenceMethod>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyKind {
    #[default]
    AnyOf,
    Fallback,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EepromConfig {
    /// Bus-address string as sysfs drivers name it, e.g. `32-0050`
    pub bus_address: String,
    /// I2C driver name, e.g. `at24`
    pub driver: String,
    #[serde(default = "default_bind_delay_ms")]
    pub bind_delay_ms: u64,
}

fn default_bind_delay_ms() -> u64 {
    crate::constants::defaults::EEPROM_BIND_DELAY_MS
}

/// One presence detection method.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PresenceMethod {
    /// Nonzero tach feedback on any of the named tach sensors
    Tach { sensors: Vec<String> },
    /// GPIO line level on a character device
    Gpio {
        /// Character device, e.g. `/dev/gpiochip0`
        devpath: PathBuf,
        /// Physical location for callout logs
        physpath: String,
        /// Line offset on the chip
        pin: u32,
        /// Level meaning "present" (default asserted-high)
        #[serde(default = "default_asserted_level")]
        asserted_level: u8,
    },
}

fn default_asserted_level() -> u8 {
    1
}

/// Load and validate `presence.json`.
pub fn load_presence_config(path: &Path) -> Result<PresenceConfig> {
    let config: PresenceConfig = load_json(path)?;

    if config.fans.is_empty() {
        return Err(FanGuardError::MissingConfig(format!(
            "{}: no fans defined",
            path.display()
        )));
    }

    for fan in &config.fans {
        if fan.methods.is_empty() {
            return Err(FanGuardError::InvalidConfig {
                field: format!("fans[{}].methods", fan.name),
                reason: "at least one presence method is required".into(),
            });
        }
        if !fan.path.starts_with('/') {
            return Err(FanGuardError::InvalidConfig {
                field: format!("fans[{}].path", fan.name),
                reason: "inventory path must be absolute".into(),
            });
        }
    }

    Ok(config)
}

impl FanPresenceConfig {
    /// Effective missing-time budget, if reporting is enabled for this fan.
    pub fn missing_time(&self, reporting: &ReportingConfig) -> Option<std::time::Duration> {
        let secs = self
            .fan_missing_error_time
            .unwrap_or(reporting.fan_missing_error_time);
        (secs > 0).then(|| std::time::Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> &'static str {
        r#"{
            "reporting": { "fan_missing_error_time": 20 },
            "fans": [
                {
                    "name": "fan0",
                    "path": "/xyz/openbmc_project/inventory/system/chassis/motherboard/fan0",
                    "rpolicy": "anyof",
                    "eeprom": { "bus_address": "32-0050", "driver": "at24" },
                    "methods": [
                        { "type": "tach", "sensors": ["fan0_0", "fan0_1"] },
                        { "type": "gpio", "devpath": "/dev/gpiochip0", "physpath": "fan0-presence", "pin": 5 }
                    ]
                },
                {
                    "name": "fan1",
                    "path": "/xyz/openbmc_project/inventory/system/chassis/motherboard/fan1",
                    "rpolicy": "fallback",
                    "fan_missing_error_time": 30,
                    "methods": [
                        { "type": "tach", "sensors": ["fan1_0"] }
                    ]
                }
            ]
        }"#
    }

    #[test]
    fn test_parse_sample() {
        let config: PresenceConfig = serde_json::from_str(sample()).unwrap();
        assert_eq!(config.fans.len(), 2);
        assert_eq!(config.fans[0].rpolicy, PolicyKind::AnyOf);
        assert_eq!(config.fans[1].rpolicy, PolicyKind::Fallback);

        let eeprom = config.fans[0].eeprom.as_ref().unwrap();
        assert_eq!(eeprom.bind_delay_ms, 1000);

        match &config.fans[0].methods[1] {
            PresenceMethod::Gpio { pin, asserted_level, .. } => {
                assert_eq!(*pin, 5);
                assert_eq!(*asserted_level, 1);
            }
            other => panic!("unexpected method {:?}", other),
        }
    }

    #[test]
    fn test_missing_time_override() {
        let config: PresenceConfig = serde_json::from_str(sample()).unwrap();
        assert_eq!(
            config.fans[0].missing_time(&config.reporting),
            Some(std::time::Duration::from_secs(20))
        );
        assert_eq!(
            config.fans[1].missing_time(&config.reporting),
            Some(std::time::Duration::from_secs(30))
        );
    }

    #[test]
    fn test_rejects_methodless_fan() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("presence.json");
        std::fs::write(
            &path,
            r#"{ "fans": [ { "name": "fan0", "path": "/inv/fan0", "methods": [] } ] }"#,
        )
        .unwrap();
        assert!(load_presence_config(&path).is_err());
    }
}
