//! Zone fan output
//!
//! A zone fan is a named set of sensor objects whose `Target` property is
//! driven together. Writes are deduplicated against the last pushed value
//! and suppressed entirely while a target lock is held, unless the write is
//! the lock itself.

use fg_error::FanGuardError;
use tokio::sync::Mutex;
use tracing::{debug, error};
use zbus::zvariant::Value;

use crate::config::ZoneFanConfig;
use crate::context::Context;

pub struct ZoneFan {
    pub name: String,
    interface: &'static str,
    sensors: Vec<String>,
    cached: Mutex<Option<u64>>,
}

impl ZoneFan {
    pub fn new(config: &ZoneFanConfig) -> Self {
        Self {
            name: config.name.clone(),
            interface: config.interface(),
            sensors: config.sensors.clone(),
            cached: Mutex::new(None),
        }
    }

    /// Write `value` to every backing sensor's Target.
    ///
    /// No-op when the value matches the cache, or when a lock is held and
    /// this write is not the lock write itself. Transport failures are
    /// logged per sensor; the remaining sensors are still written.
    pub async fn set_target(&self, ctx: &Context, value: u64, locked: bool, lock_write: bool) {
        if locked && !lock_write {
            debug!(fan = %self.name, value, "target write suppressed by lock");
            return;
        }

        {
            let mut cached = self.cached.lock().await;
            if *cached == Some(value) {
                return;
            }
            *cached = Some(value);
        }

        for sensor in &self.sensors {
            let result = ctx
                .bus
                .set_property(sensor, self.interface, "Target", Value::from(value))
                .await;

            if let Err(e) = result {
                let err = FanGuardError::TargetWriteFailed {
                    fan: self.name.clone(),
                    path: sensor.clone(),
                    interface: self.interface.into(),
                    property: "Target".into(),
                    value,
                    reason: e.to_string(),
                };
                error!(error = %err, "fan target write failed");
            }
        }

        ctx.recorder
            .log("control", format!("{} target={}", self.name, value));
    }

    /// Last value pushed to hardware, if any.
    pub async fn cached_target(&self) -> Option<u64> {
        *self.cached.lock().await
    }
}
