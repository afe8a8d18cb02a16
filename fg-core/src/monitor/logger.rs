//! Threshold alarm event logs
//!
//! Every alarm transition becomes an event log whose identifier encodes the
//! severity, direction, and whether the alarm asserted or cleared.
//! Severity: Critical when the transition powered the chassis off, Error on
//! assert, Informational on clear.

use std::collections::HashMap;

use crate::bus::BusFacade;
use crate::logging::{self, Severity};
use crate::monitor::alarm::{self, AlarmKey};

pub async fn log_alarm_transition(
    bus: &BusFacade,
    key: &AlarmKey,
    asserted: bool,
    sensor_value: Option<f64>,
    is_power_off: bool,
) {
    let error_name = alarm::error_name(key, asserted);

    let severity = if is_power_off {
        Severity::Critical
    } else if asserted {
        Severity::Error
    } else {
        Severity::Informational
    };

    let mut ad = HashMap::new();
    ad.insert("SENSOR_NAME".to_string(), key.sensor_path.clone());
    ad.insert("_PID".to_string(), logging::pid_string());
    if let Some(value) = sensor_value {
        ad.insert("SENSOR_VALUE".to_string(), value.to_string());
    }
    // Flagged as a system termination so service tooling can tell this
    // power-off apart from an orderly one.
    if is_power_off {
        ad.insert("SEVERITY_DETAIL".to_string(), "SYSTEM_TERM".to_string());
    }

    logging::create_event_log(bus, &error_name, severity, ad).await;
}
