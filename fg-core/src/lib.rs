//! Fanguard Core Library
//!
//! BMC thermal management: fan presence detection, zone-based fan control,
//! and threshold-alarm shutdown protection.
//!
//! # Features
//!
//! - **Presence**: Per-fan tach/GPIO sensors fused by a redundancy policy,
//!   published to the inventory service, with EEPROM driver binding and
//!   delayed fan-missing event logs
//! - **Control**: Event-driven fan zones with floor/ceiling clamping,
//!   data-driven actions, preconditions, and target locks
//! - **Monitor**: Shutdown-threshold alarm grace timers that survive daemon
//!   restarts and end in a hard chassis power-off
//!
//! # Module Structure
//!
//! - `bus` - Typed message-bus façade (object mapper, properties, signals)
//! - `presence/` - Presence engine (sensors, policies, reporter)
//! - `control/` - Control engine (zones, events, actions, preconditions)
//! - `monitor/` - Shutdown monitor (alarms, timestamps, recovery)
//! - `config/` - JSON configuration types and loaders
//!
//! All subsystems share one bus connection and run on a single-threaded
//! cooperative runtime; they communicate with each other only through bus
//! signals so any one can be restarted independently.

// Grouped modules
pub mod config;
pub mod control;
pub mod monitor;
pub mod presence;

// Standalone modules
pub mod bus;
pub mod constants;
pub mod context;
pub mod flight_recorder;
pub mod logging;
pub mod power;
pub mod timer;
pub mod types;

// Re-export primary types
pub use bus::BusFacade;
pub use context::{Context, Params};
pub use flight_recorder::FlightRecorder;
pub use power::{PowerSource, PowerState};
pub use timer::{OneShotTimer, PeriodicTimer};
pub use types::PropertyValue;

// Re-export config types and loaders
pub use config::{
    load_pcie_cards, load_presence_config, load_recovery_config, load_zones_config,
    PcieCardMetadata, PresenceConfig, RecoveryConfig, ZonesConfig,
};

// Re-export engine entry points
pub use control::ControlEngine;
pub use monitor::{RecoveryMonitor, ShutdownDelays, ShutdownMonitor};
pub use presence::PresenceEngine;

// Re-export error types
pub use fg_error::{FanGuardError, Result};
