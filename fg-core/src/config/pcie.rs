//! PCIe card metadata (`pcie-cards.json`)
//!
//! Maps a card's `(vendor, device, subsystem vendor, subsystem)` id tuple to
//! either a floor index or a marker that the card carries its own
//! temperature sensor. IDs are hex strings in the file, matching how the
//! inventory publishes them.

use std::path::Path;

use fg_error::{FanGuardError, Result};
use serde::{Deserialize, Serialize};

use super::load_json;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PcieCardMetadata {
    pub cards: Vec<CardEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CardEntry {
    pub vendor_id: String,
    pub device_id: String,
    pub subsystem_vendor_id: String,
    pub subsystem_id: String,
    #[serde(default)]
    pub floor_index: Option<i32>,
    #[serde(default)]
    pub temp_sensor: bool,
}

/// Lookup outcome for a plugged card.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardLookup {
    /// Card demands at least this floor index
    FloorIndex(i32),
    /// Card has its own temperature sensor; no static floor
    HasTempSensor,
}

impl PcieCardMetadata {
    /// Find a card by id tuple.
    pub fn lookup(
        &self,
        vendor: u16,
        device: u16,
        subsystem_vendor: u16,
        subsystem: u16,
    ) -> Option<CardLookup> {
        self.cards.iter().find_map(|card| {
            let matches = parse_hex_id(&card.vendor_id) == Some(vendor)
                && parse_hex_id(&card.device_id) == Some(device)
                && parse_hex_id(&card.subsystem_vendor_id) == Some(subsystem_vendor)
                && parse_hex_id(&card.subsystem_id) == Some(subsystem);

            if !matches {
                return None;
            }

            if card.temp_sensor {
                Some(CardLookup::HasTempSensor)
            } else {
                card.floor_index.map(CardLookup::FloorIndex)
            }
        })
    }
}

/// Parse a `0x`-prefixed or bare hex id string.
pub fn parse_hex_id(s: &str) -> Option<u16> {
    let trimmed = s.trim().trim_start_matches("0x").trim_start_matches("0X");
    u16::from_str_radix(trimmed, 16).ok()
}

/// Load and validate `pcie-cards.json`.
pub fn load_pcie_cards(path: &Path) -> Result<PcieCardMetadata> {
    let metadata: PcieCardMetadata = load_json(path)?;

    for (i, card) in metadata.cards.iter().enumerate() {
        for (field, value) in [
            ("vendor_id", &card.vendor_id),
            ("device_id", &card.device_id),
            ("subsystem_vendor_id", &card.subsystem_vendor_id),
            ("subsystem_id", &card.subsystem_id),
        ] {
            if parse_hex_id(value).is_none() {
                return Err(FanGuardError::InvalidConfig {
                    field: format!("cards[{}].{}", i, field),
                    reason: format!("'{}' is not a hex id", value),
                });
            }
        }
        if !card.temp_sensor && card.floor_index.is_none() {
            return Err(FanGuardError::InvalidConfig {
                field: format!("cards[{}]", i),
                reason: "needs either floor_index or temp_sensor".into(),
            });
        }
    }

    Ok(metadata)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PcieCardMetadata {
        serde_json::from_str(
            r#"{
              "cards": [
                { "vendor_id": "0x10de", "device_id": "0x2204",
                  "subsystem_vendor_id": "0x10de", "subsystem_id": "0x1454",
                  "floor_index": 3 },
                { "vendor_id": "0x1014", "device_id": "0x0611",
                  "subsystem_vendor_id": "0x1014", "subsystem_id": "0x0622",
                  "temp_sensor": true }
              ]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_lookup_floor_index() {
        let meta = sample();
        assert_eq!(
            meta.lookup(0x10de, 0x2204, 0x10de, 0x1454),
            Some(CardLookup::FloorIndex(3))
        );
    }

    #[test]
    fn test_lookup_temp_sensor() {
        let meta = sample();
        assert_eq!(
            meta.lookup(0x1014, 0x0611, 0x1014, 0x0622),
            Some(CardLookup::HasTempSensor)
        );
    }

    #[test]
    fn test_lookup_unknown_card() {
        let meta = sample();
        assert_eq!(meta.lookup(0xffff, 0x0001, 0xffff, 0x0001), None);
    }

    #[test]
    fn test_parse_hex_id_forms() {
        assert_eq!(parse_hex_id("0x10de"), Some(0x10de));
        assert_eq!(parse_hex_id("10de"), Some(0x10de));
        assert_eq!(parse_hex_id("zz"), None);
    }
}
