//! Shared daemon context
//!
//! One `Context` is built by the daemon and handed to every engine
//! constructor: the bus connection, the power-state tracker, the
//! process-wide parameter registry, and the flight recorder. Nothing in the
//! tree reaches for file-scope statics.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::bus::BusFacade;
use crate::flight_recorder::FlightRecorder;
use crate::power::PowerState;
use crate::types::PropertyValue;

/// Process-wide parameter registry.
///
/// Actions publish derived values here (the PCIe floor index) for other
/// actions and the state dump to consume.
#[derive(Clone, Default)]
pub struct Params {
    values: Arc<Mutex<HashMap<String, PropertyValue>>>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, name: &str, value: PropertyValue) {
        debug!(param = name, value = %value, "parameter set");
        self.values.lock().insert(name.to_string(), value);
    }

    pub fn get(&self, name: &str) -> Option<PropertyValue> {
        self.values.lock().get(name).cloned()
    }

    pub fn clear(&self, name: &str) {
        debug!(param = name, "parameter cleared");
        self.values.lock().remove(name);
    }

    pub fn snapshot(&self) -> HashMap<String, PropertyValue> {
        self.values.lock().clone()
    }
}

/// Everything an engine needs from the daemon.
#[derive(Clone)]
pub struct Context {
    pub bus: BusFacade,
    pub power: Arc<PowerState>,
    pub params: Params,
    pub recorder: Arc<FlightRecorder>,
}

impl Context {
    pub fn new(bus: BusFacade, power: Arc<PowerState>) -> Self {
        Self {
            bus,
            power,
            params: Params::new(),
            recorder: Arc::new(FlightRecorder::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_roundtrip() {
        let params = Params::new();
        assert!(params.get("pcie_floor_index").is_none());
        params.set("pcie_floor_index", PropertyValue::Int(3));
        assert_eq!(
            params.get("pcie_floor_index"),
            Some(PropertyValue::Int(3))
        );
        params.clear("pcie_floor_index");
        assert!(params.get("pcie_floor_index").is_none());
    }
}
