//! Control configuration (`zones.json`)
//!
//! A zone names its fans, its events, and optional preconditions. Events
//! carry a property group, the signals that refresh it, an optional timer,
//! and the action list run on every trigger. Actions are tagged variants
//! whose parameters live in the config, so the file round-trips through
//! serde with no embedded code.

use std::path::Path;

use fg_error::{FanGuardError, Result};
use serde::{Deserialize, Serialize};

use super::load_json;
use crate::types::PropertyValue;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZonesConfig {
    pub zones: Vec<ZoneConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneConfig {
    pub zone: u32,
    pub full_speed: u64,
    pub default_floor: u64,
    #[serde(default)]
    pub default_ceiling: Option<u64>,
    /// Seconds before a requested increase is applied
    #[serde(default = "default_increase_delay")]
    pub increase_delay: u64,
    /// Seconds between decrease applications
    #[serde(default = "default_decrease_interval")]
    pub decrease_interval: u64,
    pub fans: Vec<ZoneFanConfig>,
    #[serde(default)]
    pub events: Vec<EventConfig>,
    #[serde(default)]
    pub preconditions: Vec<PreconditionConfig>,
}

fn default_increase_delay() -> u64 {
    5
}

fn default_decrease_interval() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneFanConfig {
    pub name: String,
    /// `FanSpeed` (RPM targets) or `FanPwm` (PWM targets)
    #[serde(default = "default_target_interface")]
    pub target_interface: String,
    /// Sensor object paths whose Target property this fan drives
    pub sensors: Vec<String>,
}

fn default_target_interface() -> String {
    "FanSpeed".into()
}

impl ZoneFanConfig {
    /// Full well-known name of the target interface.
    pub fn interface(&self) -> &'static str {
        match self.target_interface.as_str() {
            "FanPwm" => crate::constants::interfaces::CONTROL_FAN_PWM,
            _ => crate::constants::interfaces::CONTROL_FAN_SPEED,
        }
    }
}

/// One member of an event's property group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupMember {
    pub path: String,
    pub interface: String,
    pub property: String,
}

/// Bus signals an event subscribes to for its group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    PropertiesChanged,
    InterfacesAdded,
    NameOwnerChanged,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimerConfig {
    pub interval_ms: u64,
    #[serde(default)]
    pub repeating: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventConfig {
    pub name: String,
    pub group: Vec<GroupMember>,
    #[serde(default)]
    pub signals: Vec<SignalKind>,
    #[serde(default)]
    pub timer: Option<TimerConfig>,
    pub actions: Vec<ActionConfig>,
}

/// An ordered `value → speed` table row.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TableEntry {
    pub value: i64,
    pub speed: u64,
}

/// The rule-language verbs. Parameters come straight from config;
/// execution is a pure function over `(zone, group, params)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum ActionConfig {
    SetFloorFromAverage {
        table: Vec<TableEntry>,
    },
    SetCeilingFromAverage {
        table: Vec<TableEntry>,
    },
    CountStateBeforeSpeed {
        count: usize,
        state: PropertyValue,
        speed: u64,
    },
    SetNetIncreaseSpeed {
        state: i64,
        factor: i64,
        delta: u64,
    },
    SetNetDecreaseSpeed {
        state: i64,
        factor: i64,
        delta: u64,
    },
    MissingOwnerSpeed {
        speed: u64,
    },
    PcieCardFloors {
        #[serde(default = "default_settle_time")]
        settle_time: u64,
    },
    Modifier {
        expression: String,
        value: PropertyValue,
    },
    SetRequestSpeedBaseWithMax,
}

fn default_settle_time() -> u64 {
    crate::constants::defaults::PCIE_SETTLE_SECS
}

/// One `(path, interface, property) == expected` condition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertyCondition {
    pub path: String,
    pub interface: String,
    pub property: String,
    pub value: PropertyValue,
}

/// A precondition gates a set of contained events on a conjunction of
/// property conditions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreconditionConfig {
    pub name: String,
    pub conditions: Vec<PropertyCondition>,
    pub events: Vec<EventConfig>,
}

/// Load and validate `zones.json`.
pub fn load_zones_config(path: &Path) -> Result<ZonesConfig> {
    let config: ZonesConfig = load_json(path)?;

    if config.zones.is_empty() {
        return Err(FanGuardError::MissingConfig(format!(
            "{}: no zones defined",
            path.display()
        )));
    }

    for zone in &config.zones {
        if zone.fans.is_empty() {
            return Err(FanGuardError::InvalidConfig {
                field: format!("zones[{}].fans", zone.zone),
                reason: "a zone needs at least one fan".into(),
            });
        }
        if zone.default_floor > zone.full_speed {
            return Err(FanGuardError::InvalidConfig {
                field: format!("zones[{}].default_floor", zone.zone),
                reason: "floor exceeds full speed".into(),
            });
        }
        for event in zone
            .events
            .iter()
            .chain(zone.preconditions.iter().flat_map(|p| p.events.iter()))
        {
            validate_event(zone.zone, event)?;
        }
    }

    Ok(config)
}

fn validate_event(zone: u32, event: &EventConfig) -> Result<()> {
    if event.actions.is_empty() {
        return Err(FanGuardError::InvalidConfig {
            field: format!("zones[{}].events[{}].actions", zone, event.name),
            reason: "an event needs at least one action".into(),
        });
    }

    for action in &event.actions {
        match action {
            ActionConfig::SetFloorFromAverage { table }
            | ActionConfig::SetCeilingFromAverage { table } => {
                if table.is_empty() {
                    return Err(FanGuardError::InvalidConfig {
                        field: format!("zones[{}].events[{}].table", zone, event.name),
                        reason: "value/speed table is empty".into(),
                    });
                }
                if table.windows(2).any(|w| w[0].value >= w[1].value) {
                    return Err(FanGuardError::InvalidConfig {
                        field: format!("zones[{}].events[{}].table", zone, event.name),
                        reason: "table keys must be strictly increasing".into(),
                    });
                }
            }
            ActionConfig::SetNetIncreaseSpeed { factor, .. }
            | ActionConfig::SetNetDecreaseSpeed { factor, .. } => {
                if *factor <= 0 {
                    return Err(FanGuardError::InvalidConfig {
                        field: format!("zones[{}].events[{}].factor", zone, event.name),
                        reason: "factor must be positive".into(),
                    });
                }
            }
            ActionConfig::Modifier { expression, .. } => {
                if expression != "subtract" {
                    return Err(FanGuardError::InvalidConfig {
                        field: format!("zones[{}].events[{}].expression", zone, event.name),
                        reason: format!("unknown modifier expression '{}'", expression),
                    });
                }
            }
            _ => {}
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> &'static str {
        r#"{
          "zones": [
            {
              "zone": 0,
              "full_speed": 10500,
              "default_floor": 8000,
              "increase_delay": 5,
              "decrease_interval": 30,
              "fans": [
                { "name": "fan0", "target_interface": "FanSpeed",
                  "sensors": ["/xyz/openbmc_project/sensors/fan_tach/fan0_0"] }
              ],
              "events": [
                {
                  "name": "fan_presence",
                  "group": [
                    { "path": "/xyz/openbmc_project/inventory/system/chassis/motherboard/fan0",
                      "interface": "xyz.openbmc_project.Inventory.Item",
                      "property": "Present" }
                  ],
                  "signals": ["properties_changed", "interfaces_added"],
                  "actions": [
                    { "name": "count_state_before_speed", "count": 1, "state": false, "speed": 10500 }
                  ]
                },
                {
                  "name": "ambient_floor",
                  "group": [
                    { "path": "/xyz/openbmc_project/sensors/temperature/ambient",
                      "interface": "xyz.openbmc_project.Sensor.Value",
                      "property": "Value" }
                  ],
                  "signals": ["properties_changed"],
                  "timer": { "interval_ms": 30000, "repeating": true },
                  "actions": [
                    { "name": "set_floor_from_average",
                      "table": [ { "value": 27, "speed": 3500 }, { "value": 32, "speed": 4600 } ] }
                  ]
                }
              ],
              "preconditions": [
                {
                  "name": "chassis_up",
                  "conditions": [
                    { "path": "/xyz/openbmc_project/state/host0",
                      "interface": "xyz.openbmc_project.State.Host",
                      "property": "CurrentHostState",
                      "value": "xyz.openbmc_project.State.Host.HostState.Running" }
                  ],
                  "events": [
                    {
                      "name": "cpu_increase",
                      "group": [
                        { "path": "/xyz/openbmc_project/sensors/temperature/cpu0",
                          "interface": "xyz.openbmc_project.Sensor.Value",
                          "property": "Value" }
                      ],
                      "signals": ["properties_changed"],
                      "actions": [
                        { "name": "set_net_increase_speed", "state": 70, "factor": 1, "delta": 200 }
                      ]
                    }
                  ]
                }
              ]
            }
          ]
        }"#
    }

    #[test]
    fn test_parse_sample() {
        let config: ZonesConfig = serde_json::from_str(sample()).unwrap();
        let zone = &config.zones[0];
        assert_eq!(zone.full_speed, 10500);
        assert_eq!(zone.events.len(), 2);
        assert_eq!(zone.preconditions.len(), 1);
        assert_eq!(zone.fans[0].interface(), crate::constants::interfaces::CONTROL_FAN_SPEED);

        match &zone.events[0].actions[0] {
            ActionConfig::CountStateBeforeSpeed { count, state, speed } => {
                assert_eq!(*count, 1);
                assert_eq!(state, &PropertyValue::Bool(false));
                assert_eq!(*speed, 10500);
            }
            other => panic!("unexpected action {:?}", other),
        }
    }

    #[test]
    fn test_rejects_unsorted_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("zones.json");
        std::fs::write(
            &path,
            r#"{ "zones": [ { "zone": 0, "full_speed": 100, "default_floor": 10,
                "fans": [ { "name": "f", "sensors": ["/s"] } ],
                "events": [ { "name": "e", "group": [],
                  "actions": [ { "name": "set_floor_from_average",
                    "table": [ { "value": 5, "speed": 1 }, { "value": 5, "speed": 2 } ] } ] } ] } ] }"#,
        )
        .unwrap();
        assert!(load_zones_config(&path).is_err());
    }

    #[test]
    fn test_rejects_bad_modifier() {
        let bad = r#"{ "name": "modifier", "expression": "divide", "value": 2 }"#;
        let action: ActionConfig = serde_json::from_str(bad).unwrap();
        let event = EventConfig {
            name: "e".into(),
            group: vec![],
            signals: vec![],
            timer: None,
            actions: vec![action],
        };
        assert!(validate_event(0, &event).is_err());
    }
}
