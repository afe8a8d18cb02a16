//! JSON configuration
//!
//! Four files under the config root drive the daemon:
//!
//! - `presence.json` — fans, their presence methods, redundancy policy,
//!   EEPROM descriptors, missing-fan reporting
//! - `zones.json` — fan zones, their fans, events, actions, preconditions
//! - `pcie-cards.json` — PCIe card id → cooling metadata
//! - `recovery-action.json` — per-sensor stable countdowns and the recovery
//!   systemd target
//!
//! Loading validates required keys up front so a malformed file is rejected
//! as a whole; the daemon then keeps running on its previous configuration.

mod pcie;
mod presence;
mod recovery;
mod zones;

pub use pcie::{load_pcie_cards, parse_hex_id, CardEntry, CardLookup, PcieCardMetadata};
pub use presence::{
    load_presence_config, EepromConfig, FanPresenceConfig, PolicyKind, PresenceConfig,
    PresenceMethod,
};
pub use recovery::{load_recovery_config, RecoveryConfig, SensorRecovery, ThresholdCountdown};
pub use zones::{
    load_zones_config, ActionConfig, EventConfig, GroupMember, PreconditionConfig,
    PropertyCondition, SignalKind, TableEntry, TimerConfig, ZoneConfig, ZoneFanConfig,
    ZonesConfig,
};

use std::path::Path;

use fg_error::{FanGuardError, Result};
use serde::de::DeserializeOwned;

/// Read and parse one JSON config file.
fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path).map_err(|source| FanGuardError::FileRead {
        path: path.to_path_buf(),
        source,
    })?;

    serde_json::from_str(&content).map_err(|e| {
        FanGuardError::config(format!("{}: {}", path.display(), e))
    })
}
