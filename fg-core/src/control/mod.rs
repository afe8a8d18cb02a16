//! Fan control engine
//!
//! Owns the fan zones and their event machinery. Each zone is driven by
//! property-change signals and timer ticks through a data-driven action
//! pipeline; computed targets are clamped between the zone's floor and
//! ceiling and pushed to the fan sensors' Target properties.

pub mod action;
pub mod event;
pub mod fan;
pub mod precondition;
pub mod targeting;
pub mod zone;

use std::sync::Arc;

use fg_error::Result;

use crate::config::{PcieCardMetadata, ZonesConfig};
use crate::context::Context;

pub use action::Action;
pub use event::Event;
pub use targeting::{Push, Targeting};
pub use zone::Zone;

pub struct ControlEngine {
    zones: Vec<Arc<Zone>>,
}

impl ControlEngine {
    pub fn new(
        ctx: &Context,
        config: &ZonesConfig,
        cards: Option<Arc<PcieCardMetadata>>,
    ) -> Result<Self> {
        let zones = config
            .zones
            .iter()
            .map(|zone_config| Zone::new(ctx.clone(), zone_config, cards.as_ref()))
            .collect();
        Ok(Self { zones })
    }

    /// Initialize every zone: snapshots, subscriptions, init triggers,
    /// timers, preconditions.
    pub async fn start(&self) {
        for zone in &self.zones {
            zone.init().await;
        }
    }

    pub async fn shutdown(&self) {
        for zone in &self.zones {
            zone.shutdown().await;
        }
    }

    pub fn zones(&self) -> &[Arc<Zone>] {
        &self.zones
    }

    /// Zone state snapshot for the state dump.
    pub async fn snapshot(&self) -> serde_json::Value {
        let mut zones = Vec::new();
        for zone in &self.zones {
            zones.push(zone.snapshot().await);
        }
        serde_json::json!({ "zones": zones })
    }
}
