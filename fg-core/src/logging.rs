//! Event-log emission
//!
//! Structured event logs go to the logging service's Create method. Failing
//! to emit a log is itself logged but never fatal; the protective paths must
//! keep running with or without the logging daemon.

use std::collections::HashMap;

use tracing::error;

use crate::bus::BusFacade;
use crate::constants::{interfaces, paths, services};

/// Event log severities understood by the logging service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Critical,
    Error,
    Warning,
    Informational,
}

impl Severity {
    pub fn as_dbus(&self) -> &'static str {
        match self {
            Severity::Critical => "xyz.openbmc_project.Logging.Entry.Level.Critical",
            Severity::Error => "xyz.openbmc_project.Logging.Entry.Level.Error",
            Severity::Warning => "xyz.openbmc_project.Logging.Entry.Level.Warning",
            Severity::Informational => "xyz.openbmc_project.Logging.Entry.Level.Informational",
        }
    }
}

/// Create an event log, swallowing (but tracing) any failure.
pub async fn create_event_log(
    bus: &BusFacade,
    error_name: &str,
    severity: Severity,
    additional_data: HashMap<String, String>,
) {
    let result = bus
        .call_method(
            services::LOGGING,
            paths::LOGGING,
            interfaces::LOGGING_CREATE,
            "Create",
            &(error_name, severity.as_dbus(), additional_data),
        )
        .await;

    if let Err(e) = result {
        error!(error_name, error = %e, "failed to create event log");
    }
}

/// Standard `_PID` metadata value for event logs.
pub fn pid_string() -> String {
    std::process::id().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_names() {
        assert!(Severity::Critical.as_dbus().ends_with("Critical"));
        assert!(Severity::Informational.as_dbus().ends_with("Informational"));
    }
}
