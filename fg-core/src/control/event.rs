//! Control events
//!
//! An event ties a property group to the signals that refresh it, an
//! optional timer, and the ordered action list run on every trigger. Events
//! contained in a precondition are `gated`: they only run while their
//! precondition holds.

use std::sync::Arc;

use crate::config::{EventConfig, GroupMember, PcieCardMetadata, SignalKind, TimerConfig};
use crate::control::action::Action;

/// Identifies a group for the active-allow map. Every event and every
/// precondition gets its own id.
pub type GroupId = usize;

pub struct Event {
    pub name: String,
    /// Position in the zone's event list
    pub index: usize,
    pub group_id: GroupId,
    pub group: Vec<GroupMember>,
    pub signals: Vec<SignalKind>,
    pub timer: Option<TimerConfig>,
    pub actions: Vec<Action>,
    /// True when a precondition controls this event's lifecycle
    pub gated: bool,
}

impl Event {
    pub fn from_config(
        config: &EventConfig,
        index: usize,
        group_id: GroupId,
        gated: bool,
        cards: Option<&Arc<PcieCardMetadata>>,
    ) -> Self {
        Self {
            name: config.name.clone(),
            index,
            group_id,
            group: config.group.clone(),
            signals: config.signals.clone(),
            timer: config.timer.clone(),
            actions: config
                .actions
                .iter()
                .map(|a| Action::from_config(a, cards.cloned()))
                .collect(),
            gated,
        }
    }

    /// Whether this event wants service-owner tracking.
    pub fn tracks_services(&self) -> bool {
        self.signals.contains(&SignalKind::NameOwnerChanged)
            || self
                .actions
                .iter()
                .any(|a| matches!(a, Action::MissingOwnerSpeed { .. }))
    }
}
