//! Preconditions
//!
//! A precondition gates a set of contained events on a conjunction of
//! property-equality conditions. While the conjunction holds, the contained
//! events are initialized (signals subscribed, actions run once, timers
//! armed); when it stops holding they are torn down and the zone is forced
//! to full speed.
//!
//! The equality predicate here is the single property-equality-conjunction
//! helper shared by every condition check in the service.

use crate::config::PropertyCondition;
use crate::control::event::GroupId;
use crate::types::{PropertyKey, PropertyValue};

pub struct Precondition {
    pub name: String,
    pub group_id: GroupId,
    pub conditions: Vec<PropertyCondition>,
    /// Indices into the zone's event list for the contained (gated) events
    pub event_indices: Vec<usize>,
}

impl PropertyCondition {
    pub fn key(&self) -> PropertyKey {
        PropertyKey::new(&self.path, &self.interface, &self.property)
    }
}

/// True iff every condition's property is cached and equals its expected
/// value. A missing property counts as not-equal.
pub fn properties_match<F>(conditions: &[PropertyCondition], lookup: F) -> bool
where
    F: Fn(&PropertyKey) -> Option<PropertyValue>,
{
    conditions.iter().all(|condition| {
        lookup(&condition.key())
            .map(|value| value.matches(&condition.value))
            .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn condition(path: &str, value: PropertyValue) -> PropertyCondition {
        PropertyCondition {
            path: path.into(),
            interface: "xyz.openbmc_project.State.Host".into(),
            property: "CurrentHostState".into(),
            value,
        }
    }

    #[test]
    fn test_all_conditions_must_hold() {
        let running = PropertyValue::Str("Running".into());
        let conditions = vec![
            condition("/state/host0", running.clone()),
            condition("/state/host1", running.clone()),
        ];

        let mut cache = HashMap::new();
        cache.insert(conditions[0].key(), running.clone());
        assert!(!properties_match(&conditions, |k| cache.get(k).cloned()));

        cache.insert(conditions[1].key(), running.clone());
        assert!(properties_match(&conditions, |k| cache.get(k).cloned()));

        cache.insert(conditions[1].key(), PropertyValue::Str("Off".into()));
        assert!(!properties_match(&conditions, |k| cache.get(k).cloned()));
    }

    #[test]
    fn test_missing_property_is_not_equal() {
        let conditions = vec![condition("/state/host0", PropertyValue::Bool(true))];
        assert!(!properties_match(&conditions, |_| None));
    }

    #[test]
    fn test_numeric_coercion_in_conditions() {
        let conditions = vec![condition("/state/host0", PropertyValue::Int(1))];
        let mut cache = HashMap::new();
        cache.insert(conditions[0].key(), PropertyValue::UInt(1));
        assert!(properties_match(&conditions, |k| cache.get(k).cloned()));
    }
}
