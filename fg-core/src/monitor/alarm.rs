//! Alarm identities
//!
//! An alarm is identified by `(sensor path, severity, direction)`. The
//! severity decides the threshold interface watched and the grace handling:
//! HardShutdown and SoftShutdown feed the protective power-off path,
//! Critical and Warning feed the recovery path.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AlarmSeverity {
    HardShutdown,
    SoftShutdown,
    Critical,
    Warning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AlarmDirection {
    Low,
    High,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AlarmKey {
    pub sensor_path: String,
    pub severity: AlarmSeverity,
    pub direction: AlarmDirection,
}

impl AlarmKey {
    pub fn new(
        sensor_path: impl Into<String>,
        severity: AlarmSeverity,
        direction: AlarmDirection,
    ) -> Self {
        Self {
            sensor_path: sensor_path.into(),
            severity,
            direction,
        }
    }

    /// The alarm boolean property this key watches.
    pub fn property(&self) -> &'static str {
        self.severity.property(self.direction)
    }
}

impl AlarmSeverity {
    pub const SHUTDOWN: [AlarmSeverity; 2] =
        [AlarmSeverity::HardShutdown, AlarmSeverity::SoftShutdown];

    pub fn interface(&self) -> &'static str {
        use crate::constants::interfaces;
        match self {
            AlarmSeverity::HardShutdown => interfaces::THRESHOLD_HARD_SHUTDOWN,
            AlarmSeverity::SoftShutdown => interfaces::THRESHOLD_SOFT_SHUTDOWN,
            AlarmSeverity::Critical => interfaces::THRESHOLD_CRITICAL,
            AlarmSeverity::Warning => interfaces::THRESHOLD_WARNING,
        }
    }

    pub fn from_interface(interface: &str) -> Option<Self> {
        use crate::constants::interfaces;
        match interface {
            interfaces::THRESHOLD_HARD_SHUTDOWN => Some(AlarmSeverity::HardShutdown),
            interfaces::THRESHOLD_SOFT_SHUTDOWN => Some(AlarmSeverity::SoftShutdown),
            interfaces::THRESHOLD_CRITICAL => Some(AlarmSeverity::Critical),
            interfaces::THRESHOLD_WARNING => Some(AlarmSeverity::Warning),
            _ => None,
        }
    }

    pub fn property(&self, direction: AlarmDirection) -> &'static str {
        match (self, direction) {
            (AlarmSeverity::HardShutdown, AlarmDirection::Low) => "HardShutdownAlarmLow",
            (AlarmSeverity::HardShutdown, AlarmDirection::High) => "HardShutdownAlarmHigh",
            (AlarmSeverity::SoftShutdown, AlarmDirection::Low) => "SoftShutdownAlarmLow",
            (AlarmSeverity::SoftShutdown, AlarmDirection::High) => "SoftShutdownAlarmHigh",
            (AlarmSeverity::Critical, AlarmDirection::Low) => "CriticalAlarmLow",
            (AlarmSeverity::Critical, AlarmDirection::High) => "CriticalAlarmHigh",
            (AlarmSeverity::Warning, AlarmDirection::Low) => "WarningAlarmLow",
            (AlarmSeverity::Warning, AlarmDirection::High) => "WarningAlarmHigh",
        }
    }

    /// Map an alarm property name back to (severity, direction).
    pub fn from_property(property: &str) -> Option<(Self, AlarmDirection)> {
        for severity in [
            AlarmSeverity::HardShutdown,
            AlarmSeverity::SoftShutdown,
            AlarmSeverity::Critical,
            AlarmSeverity::Warning,
        ] {
            for direction in [AlarmDirection::Low, AlarmDirection::High] {
                if severity.property(direction) == property {
                    return Some((severity, direction));
                }
            }
        }
        None
    }

    /// Whether this severity drives the protective power-off path.
    pub fn is_shutdown(&self) -> bool {
        matches!(
            self,
            AlarmSeverity::HardShutdown | AlarmSeverity::SoftShutdown
        )
    }

    /// Stable integer used by the persisted timestamp format.
    pub fn as_int(&self) -> i32 {
        match self {
            AlarmSeverity::HardShutdown => 0,
            AlarmSeverity::SoftShutdown => 1,
            AlarmSeverity::Critical => 2,
            AlarmSeverity::Warning => 3,
        }
    }

    pub fn from_int(value: i32) -> Option<Self> {
        match value {
            0 => Some(AlarmSeverity::HardShutdown),
            1 => Some(AlarmSeverity::SoftShutdown),
            2 => Some(AlarmSeverity::Critical),
            3 => Some(AlarmSeverity::Warning),
            _ => None,
        }
    }
}

impl AlarmDirection {
    pub const BOTH: [AlarmDirection; 2] = [AlarmDirection::Low, AlarmDirection::High];

    pub fn as_int(&self) -> i32 {
        match self {
            AlarmDirection::Low => 0,
            AlarmDirection::High => 1,
        }
    }

    pub fn from_int(value: i32) -> Option<Self> {
        match value {
            0 => Some(AlarmDirection::Low),
            1 => Some(AlarmDirection::High),
            _ => None,
        }
    }
}

/// Event-log error identifier for an alarm transition.
pub fn error_name(key: &AlarmKey, asserted: bool) -> String {
    let suffix = if asserted { "" } else { "Clear" };
    format!(
        "xyz.openbmc_project.Sensor.Threshold.Error.{}{}",
        key.property(),
        suffix
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_property_round_trip() {
        for severity in [
            AlarmSeverity::HardShutdown,
            AlarmSeverity::SoftShutdown,
            AlarmSeverity::Critical,
            AlarmSeverity::Warning,
        ] {
            for direction in AlarmDirection::BOTH {
                let property = severity.property(direction);
                assert_eq!(
                    AlarmSeverity::from_property(property),
                    Some((severity, direction))
                );
            }
        }
        assert_eq!(AlarmSeverity::from_property("Value"), None);
    }

    #[test]
    fn test_int_round_trip() {
        for severity in [
            AlarmSeverity::HardShutdown,
            AlarmSeverity::SoftShutdown,
            AlarmSeverity::Critical,
            AlarmSeverity::Warning,
        ] {
            assert_eq!(AlarmSeverity::from_int(severity.as_int()), Some(severity));
        }
        for direction in AlarmDirection::BOTH {
            assert_eq!(
                AlarmDirection::from_int(direction.as_int()),
                Some(direction)
            );
        }
    }

    #[test]
    fn test_error_names() {
        let key = AlarmKey::new(
            "/xyz/openbmc_project/sensors/temperature/cpu0",
            AlarmSeverity::HardShutdown,
            AlarmDirection::High,
        );
        assert_eq!(
            error_name(&key, true),
            "xyz.openbmc_project.Sensor.Threshold.Error.HardShutdownAlarmHigh"
        );
        assert_eq!(
            error_name(&key, false),
            "xyz.openbmc_project.Sensor.Threshold.Error.HardShutdownAlarmHighClear"
        );
    }
}
