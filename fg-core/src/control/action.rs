//! Control actions
//!
//! Actions are the verbs of the rule language: tagged variants whose
//! parameters come from configuration and whose side effects are confined
//! to the zone's state and pending deltas. The numeric helpers are plain
//! functions so the table and delta math is testable without a zone.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::{ActionConfig, CardLookup, PcieCardMetadata, TableEntry};
use crate::constants::{interfaces, params};
use crate::control::event::Event;
use crate::control::zone::Zone;
use crate::timer::OneShotTimer;
use crate::types::PropertyValue;

const POWER_STATE_ON: &str = "xyz.openbmc_project.State.Decorator.PowerState.State.On";

pub enum Action {
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
    PcieCardFloors(PcieCardFloors),
    Modifier {
        value: PropertyValue,
    },
    SetRequestSpeedBaseWithMax,
}

impl Action {
    /// Compile a config entry into a runtime action.
    pub fn from_config(config: &ActionConfig, cards: Option<Arc<PcieCardMetadata>>) -> Self {
        match config {
            ActionConfig::SetFloorFromAverage { table } => Action::SetFloorFromAverage {
                table: table.clone(),
            },
            ActionConfig::SetCeilingFromAverage { table } => Action::SetCeilingFromAverage {
                table: table.clone(),
            },
            ActionConfig::CountStateBeforeSpeed {
                count,
                state,
                speed,
            } => Action::CountStateBeforeSpeed {
                count: *count,
                state: state.clone(),
                speed: *speed,
            },
            ActionConfig::SetNetIncreaseSpeed {
                state,
                factor,
                delta,
            } => Action::SetNetIncreaseSpeed {
                state: *state,
                factor: (*factor).max(1),
                delta: *delta,
            },
            ActionConfig::SetNetDecreaseSpeed {
                state,
                factor,
                delta,
            } => Action::SetNetDecreaseSpeed {
                state: *state,
                factor: (*factor).max(1),
                delta: *delta,
            },
            ActionConfig::MissingOwnerSpeed { speed } => {
                Action::MissingOwnerSpeed { speed: *speed }
            }
            ActionConfig::PcieCardFloors { settle_time } => {
                Action::PcieCardFloors(PcieCardFloors::new(
                    Duration::from_secs(*settle_time),
                    cards,
                ))
            }
            ActionConfig::Modifier { value, .. } => Action::Modifier {
                value: value.clone(),
            },
            ActionConfig::SetRequestSpeedBaseWithMax => Action::SetRequestSpeedBaseWithMax,
        }
    }

    pub async fn run(&self, zone: &Arc<Zone>, event: &Event) {
        match self {
            Action::SetFloorFromAverage { table } => {
                let floor = match zone.group_average(event).await {
                    Some(mean) => floor_from_table(mean, table).unwrap_or(zone.default_floor()),
                    None => zone.default_floor(),
                };
                zone.set_floor(floor).await;
            }

            Action::SetCeilingFromAverage { table } => {
                if let Some(mean) = zone.group_average(event).await {
                    let prev = zone.swap_ceiling_mean(mean).await;
                    if let Some(ceiling) = ceiling_from_table(prev, mean, table) {
                        zone.set_ceiling(ceiling).await;
                    }
                }
            }

            Action::CountStateBeforeSpeed {
                count,
                state,
                speed,
            } => {
                let at_state = zone.group_count_matching(event, state).await;
                if at_state >= *count {
                    zone.set_speed(*speed).await;
                }
                zone.set_active_allow(event.group_id, at_state < *count).await;
            }

            Action::SetNetIncreaseSpeed {
                state,
                factor,
                delta,
            } => {
                let values = zone.group_values(event).await;
                let net = net_increase_delta(&values, *state, *factor, *delta);
                if net > 0 {
                    zone.request_speed_increase(net).await;
                }
            }

            Action::SetNetDecreaseSpeed {
                state,
                factor,
                delta,
            } => {
                let values = zone.group_values(event).await;
                if let Some(net) = net_decrease_delta(&values, *state, *factor, *delta) {
                    zone.request_speed_decrease(net).await;
                }
            }

            Action::MissingOwnerSpeed { speed } => {
                zone.update_services(event).await;
                let missing = zone.group_missing_owner(event).await;
                if missing {
                    zone.set_speed(*speed).await;
                }
                zone.set_active_allow(event.group_id, !missing).await;
            }

            Action::PcieCardFloors(pcie) => {
                pcie.run(zone, event).await;
            }

            Action::Modifier { value } => {
                let Some(amount) = value.numeric() else {
                    warn!("modifier value is not numeric");
                    return;
                };
                zone.apply_group_modifier(event, amount).await;
            }

            Action::SetRequestSpeedBaseWithMax => {
                let values = zone.group_values(event).await;
                let base = values
                    .iter()
                    .fold(0i64, |acc, v| acc.max(*v))
                    .max(0) as u64;
                // A base of 0 falls back to the current target speed.
                zone.set_request_base(base).await;
            }
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            Action::SetFloorFromAverage { .. } => "set_floor_from_average",
            Action::SetCeilingFromAverage { .. } => "set_ceiling_from_average",
            Action::CountStateBeforeSpeed { .. } => "count_state_before_speed",
            Action::SetNetIncreaseSpeed { .. } => "set_net_increase_speed",
            Action::SetNetDecreaseSpeed { .. } => "set_net_decrease_speed",
            Action::MissingOwnerSpeed { .. } => "missing_owner_speed",
            Action::PcieCardFloors(_) => "pcie_card_floors",
            Action::Modifier { .. } => "modifier",
            Action::SetRequestSpeedBaseWithMax => "set_request_speed_base_with_max",
        }
    }
}

// ============================================================================
// Table and delta math
// ============================================================================

/// First table entry whose key is strictly greater than the mean.
pub fn floor_from_table(mean: f64, table: &[TableEntry]) -> Option<u64> {
    table
        .iter()
        .find(|entry| (entry.value as f64) > mean)
        .map(|entry| entry.speed)
}

/// The ceiling moves only when the mean crosses a table-key boundary
/// relative to the previous mean: increasing picks the highest key crossed
/// upward, decreasing the lowest key crossed downward. `None` means the
/// ceiling stays where it is (no previous mean yet, or no key crossed).
pub fn ceiling_from_table(prev: Option<f64>, mean: f64, table: &[TableEntry]) -> Option<u64> {
    let prev = prev?;

    if mean > prev {
        table
            .iter()
            .filter(|e| (e.value as f64) > prev && (e.value as f64) <= mean)
            .next_back()
            .map(|e| e.speed)
    } else if mean < prev {
        table
            .iter()
            .find(|e| (e.value as f64) < prev && (e.value as f64) >= mean)
            .map(|e| e.speed)
    } else {
        None
    }
}

fn div_ceil_i64(a: i64, b: i64) -> i64 {
    debug_assert!(a >= 0 && b > 0);
    (a + b - 1) / b
}

/// Max over members at/above the threshold of `⌈(val − threshold)/factor⌉·Δ`.
pub fn net_increase_delta(values: &[i64], threshold: i64, factor: i64, delta: u64) -> u64 {
    values
        .iter()
        .filter(|v| **v >= threshold)
        .map(|v| div_ceil_i64(v - threshold, factor) as u64 * delta)
        .max()
        .unwrap_or(0)
}

/// Min over members below the threshold of `⌈(threshold − val)/factor⌉·Δ`.
/// `None` when no member is below the threshold.
pub fn net_decrease_delta(values: &[i64], threshold: i64, factor: i64, delta: u64) -> Option<u64> {
    values
        .iter()
        .filter(|v| **v < threshold)
        .map(|v| div_ceil_i64(threshold - *v, factor) as u64 * delta)
        .min()
}

// ============================================================================
// PCIe card floors
// ============================================================================

/// Settle-timer-debounced scan of powered-on PCIe slots: the plugged cards'
/// metadata decides the largest required floor index, published to the
/// shared parameter registry (or cleared when no card wants one).
pub struct PcieCardFloors {
    settle_time: Duration,
    cards: Option<Arc<PcieCardMetadata>>,
    inner: Mutex<PcieInner>,
}

#[derive(Default)]
struct PcieInner {
    settle_timer: OneShotTimer,
    /// slot path → card object path
    slot_cards: HashMap<String, String>,
    pcie_devices: Vec<String>,
    last_status: String,
}

impl PcieCardFloors {
    pub fn new(settle_time: Duration, cards: Option<Arc<PcieCardMetadata>>) -> Self {
        Self {
            settle_time,
            cards,
            inner: Mutex::new(PcieInner::default()),
        }
    }

    /// Debounce: each trigger restarts the settle timer; the scan runs once
    /// the slots stop changing.
    pub async fn run(&self, zone: &Arc<Zone>, event: &Event) {
        let zone = zone.clone();
        let event_index = event.index;
        let mut inner = self.inner.lock().await;
        inner
            .settle_timer
            .restart_once(self.settle_time, move || async move {
                zone.run_pcie_floor_scan(event_index).await;
            });
    }

    /// The actual scan, called from the zone once settled.
    pub async fn execute(&self, zone: &Arc<Zone>, event: &Event) {
        let Some(cards) = &self.cards else {
            warn!("pcie_card_floors configured without card metadata");
            return;
        };

        let mut hot_cards = 0usize;
        let mut temp_sensor_cards = 0usize;
        let mut uninteresting = 0usize;
        let mut floor_index: Option<i32> = None;

        for member in &event.group {
            if member.interface != interfaces::POWER_STATE {
                debug!(interface = %member.interface, "unexpected interface in PCIe floor group");
                continue;
            }

            let powered = zone
                .cached_value(member)
                .await
                .and_then(|v| v.as_str().map(|s| s == POWER_STATE_ON))
                .unwrap_or(false);
            if !powered {
                continue;
            }

            match self.lookup_slot_card(zone, cards, &member.path).await {
                Some(CardLookup::FloorIndex(index)) => {
                    hot_cards += 1;
                    floor_index = Some(floor_index.map_or(index, |f| f.max(index)));
                }
                Some(CardLookup::HasTempSensor) => temp_sensor_cards += 1,
                None => uninteresting += 1,
            }
        }

        let status = format!(
            "pcie floors: {} hot, {} with temp sensors, {} uninteresting",
            hot_cards, temp_sensor_cards, uninteresting
        );
        {
            let mut inner = self.inner.lock().await;
            if inner.last_status != status {
                zone.record(&status).await;
                inner.last_status = status;
            }
        }

        match floor_index {
            Some(index) => {
                zone.ctx()
                    .params
                    .set(params::PCIE_FLOOR_INDEX, PropertyValue::Int(index as i64));
            }
            None => zone.ctx().params.clear(params::PCIE_FLOOR_INDEX),
        }
    }

    /// Resolve the card plugged into `slot_path` and look up its id tuple.
    async fn lookup_slot_card(
        &self,
        zone: &Arc<Zone>,
        cards: &PcieCardMetadata,
        slot_path: &str,
    ) -> Option<CardLookup> {
        let card_path = self.card_for_slot(zone, slot_path).await?;

        let mut ids = [0u16; 4];
        for (slot, property) in [
            "Function0VendorId",
            "Function0DeviceId",
            "Function0SubsystemVendorId",
            "Function0SubsystemId",
        ]
        .iter()
        .enumerate()
        {
            let raw = zone
                .ctx()
                .bus
                .get_property::<String>(&card_path, interfaces::PCIE_DEVICE, property)
                .await
                .ok()?;
            ids[slot] = crate::config::parse_hex_id(&raw)?;
        }

        cards.lookup(ids[0], ids[1], ids[2], ids[3])
    }

    /// Find the PCIeDevice object under a slot, caching both the device
    /// list and per-slot answers.
    async fn card_for_slot(&self, zone: &Arc<Zone>, slot_path: &str) -> Option<String> {
        let mut inner = self.inner.lock().await;

        if let Some(card) = inner.slot_cards.get(slot_path) {
            return Some(card.clone());
        }

        if inner.pcie_devices.is_empty() {
            match zone
                .ctx()
                .bus
                .get_subtree_paths("/", interfaces::PCIE_DEVICE, 0)
                .await
            {
                Ok(paths) => inner.pcie_devices = paths,
                Err(e) => {
                    debug!(error = %e, "PCIe device discovery failed");
                    return None;
                }
            }
        }

        let prefix = format!("{}/", slot_path);
        let card = inner
            .pcie_devices
            .iter()
            .find(|path| path.starts_with(&prefix))?
            .clone();

        inner.slot_cards.insert(slot_path.to_string(), card.clone());
        Some(card)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> Vec<TableEntry> {
        vec![
            TableEntry {
                value: 8000,
                speed: 4000,
            },
            TableEntry {
                value: 9000,
                speed: 6000,
            },
            TableEntry {
                value: 10000,
                speed: 8000,
            },
        ]
    }

    #[test]
    fn test_floor_selects_first_greater_key() {
        let table = vec![
            TableEntry {
                value: 27,
                speed: 3500,
            },
            TableEntry {
                value: 32,
                speed: 4600,
            },
        ];
        assert_eq!(floor_from_table(25.0, &table), Some(3500));
        assert_eq!(floor_from_table(27.0, &table), Some(4600));
        assert_eq!(floor_from_table(30.0, &table), Some(4600));
        // Above every key: caller falls back to the default floor
        assert_eq!(floor_from_table(35.0, &table), None);
    }

    #[test]
    fn test_ceiling_boundary_trajectory() {
        // Tach means 7500 → 8500 → 9500 → 11000 → 8500 walk the ceiling
        // default → 4000 → 6000 → 8000 → 6000.
        let table = table();
        let mut prev = None;

        assert_eq!(ceiling_from_table(prev, 7500.0, &table), None);
        prev = Some(7500.0);

        assert_eq!(ceiling_from_table(prev, 8500.0, &table), Some(4000));
        prev = Some(8500.0);

        assert_eq!(ceiling_from_table(prev, 9500.0, &table), Some(6000));
        prev = Some(9500.0);

        assert_eq!(ceiling_from_table(prev, 11000.0, &table), Some(8000));
        prev = Some(11000.0);

        assert_eq!(ceiling_from_table(prev, 8500.0, &table), Some(6000));
    }

    #[test]
    fn test_ceiling_saturates_at_table_edges() {
        let table = table();
        // Already above the last key, still rising: no crossing, no change
        assert_eq!(ceiling_from_table(Some(11000.0), 12000.0, &table), None);
        // Dropping below the first key picks the first row and stays there
        assert_eq!(ceiling_from_table(Some(8500.0), 7000.0, &table), Some(4000));
        assert_eq!(ceiling_from_table(Some(7000.0), 6000.0, &table), None);
    }

    #[test]
    fn test_ceiling_unchanged_without_movement() {
        let table = table();
        assert_eq!(ceiling_from_table(Some(8500.0), 8500.0, &table), None);
    }

    #[test]
    fn test_net_increase_takes_max() {
        // Two sensors over threshold: deltas 2*100 and 5*100; max wins
        let values = vec![72, 75, 60];
        assert_eq!(net_increase_delta(&values, 70, 1, 100), 500);
        // Nobody over threshold
        assert_eq!(net_increase_delta(&values, 80, 1, 100), 0);
        // At the threshold exactly: no step needed
        assert_eq!(net_increase_delta(&[70], 70, 1, 100), 0);
    }

    #[test]
    fn test_net_increase_integer_ceiling() {
        // diff 5, factor 2: ceil(5/2) = 3 steps, not 2
        assert_eq!(net_increase_delta(&[75], 70, 2, 100), 300);
        // diff 4, factor 2: exactly 2 steps
        assert_eq!(net_increase_delta(&[74], 70, 2, 100), 200);
    }

    #[test]
    fn test_net_decrease_takes_min_nonzero() {
        // Below threshold by 3 and 8, factor 2: ceil gives 2 and 4 steps
        let values = vec![67, 62, 75];
        assert_eq!(net_decrease_delta(&values, 70, 2, 100), Some(200));
        // Nobody below threshold
        assert_eq!(net_decrease_delta(&[75, 80], 70, 2, 100), None);
    }
}
