//! Unified error handling for Fanguard
//!
//! This crate provides a single error type used across all Fanguard
//! components. It uses thiserror for ergonomic error definitions with proper
//! Display and Error trait impls.
//!
//! Bus failures are reported as typed variants carrying the object path,
//! interface, property or method involved; callers never see raw transport
//! codes.

use std::io;
use std::path::PathBuf;

/// Result type alias using FanGuardError
pub type Result<T> = std::result::Result<T, FanGuardError>;

/// Unified error type for all Fanguard operations
#[derive(thiserror::Error, Debug)]
pub enum FanGuardError {
    // ============================================================================
    // I/O and File System Errors
    // ============================================================================
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to read file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: io::Error,
    },

    #[error("Failed to write file {path}: {source}")]
    FileWrite {
        path: PathBuf,
        source: io::Error,
    },

    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    // ============================================================================
    // Message Bus Errors
    // ============================================================================
    #[error("No service owns {interface} on {path}")]
    ServiceNotFound {
        path: String,
        interface: String,
    },

    #[error("Property {interface}.{property} unavailable on {path}: {reason}")]
    PropertyUnavailable {
        path: String,
        interface: String,
        property: String,
        reason: String,
    },

    #[error("Failed to write {interface}.{property} on {path}: {reason}")]
    PropertyWriteFailed {
        path: String,
        interface: String,
        property: String,
        reason: String,
    },

    #[error("Method call {interface}.{method} on {service}{path} failed: {reason}")]
    MethodCallFailed {
        service: String,
        path: String,
        interface: String,
        method: String,
        reason: String,
    },

    #[error("Unexpected reply body for {interface}.{method} on {path}: {reason}")]
    BadReply {
        path: String,
        interface: String,
        method: String,
        reason: String,
    },

    #[error("Bus connection error: {0}")]
    BusConnection(String),

    // ============================================================================
    // Fan Control Errors
    // ============================================================================
    #[error("Failed to write target {value} for fan {fan} on {path} ({interface}.{property}): {reason}")]
    TargetWriteFailed {
        fan: String,
        path: String,
        interface: String,
        property: String,
        value: u64,
        reason: String,
    },

    #[error("Zone {zone} has no event named {event}")]
    UnknownEvent {
        zone: u32,
        event: String,
    },

    // ============================================================================
    // GPIO Errors
    // ============================================================================
    #[error("Failed to open GPIO device {device}: {source}")]
    GpioOpen {
        device: PathBuf,
        source: io::Error,
    },

    #[error("GPIO ioctl failed on {device} line {line}: {reason}")]
    GpioIoctl {
        device: PathBuf,
        line: u32,
        reason: String,
    },

    // ============================================================================
    // Configuration Errors
    // ============================================================================
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("Invalid configuration value for {field}: {reason}")]
    InvalidConfig {
        field: String,
        reason: String,
    },

    #[error("Missing required configuration: {0}")]
    MissingConfig(String),

    // ============================================================================
    // Persisted State Errors
    // ============================================================================
    #[error("Corrupt persisted state in {path}: {reason}")]
    PersistCorrupt {
        path: PathBuf,
        reason: String,
    },

    // ============================================================================
    // Internal Errors
    // ============================================================================
    #[error("Internal error: {0}")]
    Internal(String),
}

impl FanGuardError {
    /// Create a config error from anything string-like
    pub fn config(msg: impl Into<String>) -> Self {
        FanGuardError::Config(msg.into())
    }

    /// Create an internal error from anything string-like
    pub fn internal(msg: impl Into<String>) -> Self {
        FanGuardError::Internal(msg.into())
    }

    /// True when the failure means the owning service is simply not on the
    /// bus (retryable on NameOwnerChanged).
    pub fn is_service_missing(&self) -> bool {
        matches!(self, FanGuardError::ServiceNotFound { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = FanGuardError::ServiceNotFound {
            path: "/xyz/openbmc_project/sensors/fan_tach/fan0_0".into(),
            interface: "xyz.openbmc_project.Sensor.Value".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("fan_tach/fan0_0"));
        assert!(msg.contains("Sensor.Value"));
        assert!(err.is_service_missing());
    }

    #[test]
    fn test_target_write_failed_carries_context() {
        let err = FanGuardError::TargetWriteFailed {
            fan: "fan2".into(),
            path: "/xyz/openbmc_project/sensors/fan_tach/fan2_0".into(),
            interface: "xyz.openbmc_project.Control.FanSpeed".into(),
            property: "Target".into(),
            value: 10500,
            reason: "connection reset".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("fan2"));
        assert!(msg.contains("10500"));
        assert!(!err.is_service_missing());
    }
}
