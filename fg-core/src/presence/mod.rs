//! Fan presence engine
//!
//! Each configured fan runs one or more presence sensors whose verdicts are
//! fused by a redundancy policy into a single `Present` value published to
//! the inventory service. The policies:
//!
//! - **AnyOf**: present iff any sensor reports present. When at least one
//!   but not all sensors agree (with power on and the post-power-on settle
//!   window expired), the disagreeing sensors log a conflict once.
//! - **Fallback**: sensors are priority ordered; the first non-failed
//!   sensor's verdict wins. A higher-priority sensor reporting absent while
//!   a lower one reports present is deemed failed and drops out of the
//!   cascade.
//!
//! An optional EEPROM device is bound on absent→present and unbound on
//! present→absent. Fans with a missing-time budget feed the error reporter,
//! which raises a FanMissing event log if the fan stays absent with power on.

pub mod eeprom;
pub mod gpio;
pub mod reporter;
pub mod sensor;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use fg_error::Result;
use tokio::sync::Mutex;
use tracing::{info, warn};
use zbus::zvariant::{ObjectPath, Value};

use crate::config::{PolicyKind, PresenceConfig, PresenceMethod};
use crate::constants::{defaults, interfaces, paths};
use crate::context::Context;
use crate::logging::{self, Severity};
use crate::timer::OneShotTimer;

use eeprom::EepromDevice;
use reporter::ErrorReporter;
use sensor::{GpioSensor, PresenceSensor, TachSensor};

const GPIO_CALLOUT_ERROR: &str = "xyz.openbmc_project.Common.Callout.Error.GPIO";

/// Identity of a fan as the inventory sees it.
#[derive(Debug, Clone)]
pub struct FanIdent {
    /// PrettyName published alongside Present
    pub name: String,
    /// Inventory object path
    pub path: String,
}

/// Per-sensor cached policy state.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct SensorState {
    pub present: bool,
    /// Conflict-logged latch for AnyOf; failed latch for Fallback
    pub conflict: bool,
}

struct PolicyState {
    sensors: Vec<SensorState>,
    published: Option<bool>,
    power_settled: bool,
    settle_timer: OneShotTimer,
}

/// One fan with its sensors, policy, and optional EEPROM device.
pub struct FanPresence {
    ctx: Context,
    ident: FanIdent,
    kind: PolicyKind,
    sensors: Vec<Mutex<PresenceSensor>>,
    eeprom: Option<Mutex<EepromDevice>>,
    state: Mutex<PolicyState>,
}

impl FanPresence {
    /// Start all sensors, publish the initial verdict, and hook power
    /// transitions.
    pub async fn monitor(self: &Arc<Self>) {
        let initial: Vec<bool> = {
            let mut verdicts = Vec::with_capacity(self.sensors.len());
            for (index, sensor) in self.sensors.iter().enumerate() {
                let verdict = sensor.lock().await.start(self, index).await;
                verdicts.push(verdict);
            }
            verdicts
        };

        let (present, newly_failed) = {
            let mut state = self.state.lock().await;
            for (slot, verdict) in state.sensors.iter_mut().zip(initial.iter()) {
                slot.present = *verdict;
            }
            let (present, newly_failed) = self.evaluate(&mut state.sensors);
            state.published = Some(present);
            (present, newly_failed)
        };

        self.publish(present).await;
        self.report_failed(newly_failed).await;

        let fan = self.clone();
        self.ctx
            .power
            .add_callback(
                format!("{}-presence", self.ident.name),
                crate::power::power_callback(move |on| {
                    let fan = fan.clone();
                    async move { fan.power_changed(on).await }
                }),
            )
            .await;

        if self.ctx.power.is_power_on().await {
            self.restart_settle_timer().await;
        }

        if self.kind == PolicyKind::AnyOf && present {
            self.check_conflicts().await;
        }

        info!(
            fan = %self.ident.path,
            present,
            policy = ?self.kind,
            "fan presence monitoring started"
        );
    }

    /// A sensor's verdict flipped.
    pub async fn state_changed(self: &Arc<Self>, index: usize, present: bool) {
        let (publish, transitions, newly_failed) = {
            let mut state = self.state.lock().await;
            if index >= state.sensors.len() || state.sensors[index].present == present {
                return;
            }

            let old = state.published.unwrap_or(false);
            state.sensors[index].present = present;
            let (new, newly_failed) = self.evaluate(&mut state.sensors);

            let publish = if state.published != Some(new) {
                state.published = Some(new);
                Some(new)
            } else {
                None
            };

            // A plug event re-enables conflict logging for AnyOf.
            if self.kind == PolicyKind::AnyOf && new && !old {
                for slot in state.sensors.iter_mut() {
                    slot.conflict = false;
                }
            }

            (publish, (old, new), newly_failed)
        };

        let (old, new) = transitions;

        if let Some(present) = publish {
            self.ctx.recorder.log(
                "presence",
                format!("{} present={}", self.ident.path, present),
            );
            self.publish(present).await;
        }

        if new != old {
            if let Some(eeprom) = &self.eeprom {
                let mut eeprom = eeprom.lock().await;
                if new {
                    eeprom.bind();
                } else {
                    eeprom.unbind();
                }
            }
        }

        self.report_failed(newly_failed).await;

        if self.kind == PolicyKind::AnyOf && new && !old {
            self.check_conflicts().await;
        }
    }

    /// Policy fusion over the cached sensor states. Returns the published
    /// verdict and, for Fallback, any sensors newly deemed failed.
    fn evaluate(&self, sensors: &mut [SensorState]) -> (bool, Vec<usize>) {
        match self.kind {
            PolicyKind::AnyOf => (any_of_verdict(sensors), Vec::new()),
            PolicyKind::Fallback => fallback_verdict(sensors),
        }
    }

    /// Tell AnyOf sensors disagreeing with a present verdict to log a
    /// conflict, once per plug cycle, only after power has settled.
    async fn check_conflicts(self: &Arc<Self>) {
        if self.kind != PolicyKind::AnyOf {
            return;
        }

        let candidates = {
            let mut state = self.state.lock().await;
            if !state.power_settled {
                return;
            }

            let any = state.sensors.iter().any(|s| s.present);
            let all = state.sensors.iter().all(|s| s.present);
            if !any || all {
                return;
            }

            let mut candidates = Vec::new();
            for (index, slot) in state.sensors.iter_mut().enumerate() {
                if !slot.present && !slot.conflict {
                    slot.conflict = true;
                    candidates.push(index);
                }
            }
            candidates
        };

        self.report_failed(candidates).await;
    }

    async fn report_failed(&self, indices: Vec<usize>) {
        for index in indices {
            let sensor = self.sensors[index].lock().await;
            warn!(
                fan = %self.ident.path,
                sensor = %sensor.describe(),
                "presence sensor disagrees with policy verdict"
            );
            sensor.fail(&self.ident, &self.ctx).await;
        }
    }

    async fn power_changed(self: &Arc<Self>, on: bool) {
        if on {
            {
                let mut state = self.state.lock().await;
                for slot in state.sensors.iter_mut() {
                    slot.conflict = false;
                }
            }
            self.restart_settle_timer().await;
        } else {
            let mut state = self.state.lock().await;
            state.power_settled = false;
            state.settle_timer.disarm();
        }
    }

    /// Give the fans time to spin up before judging conflicts.
    async fn restart_settle_timer(self: &Arc<Self>) {
        let fan = self.clone();
        let mut state = self.state.lock().await;
        state.settle_timer.restart_once(
            Duration::from_secs(defaults::POWER_ON_DELAY_SECS),
            move || async move {
                fan.state.lock().await.power_settled = true;
                fan.check_conflicts().await;
            },
        );
    }

    /// Push `Present` and `PrettyName` to the inventory service.
    async fn publish(&self, present: bool) {
        let mut properties: HashMap<&str, Value<'_>> = HashMap::new();
        properties.insert("Present", Value::from(present));
        properties.insert("PrettyName", Value::from(self.ident.name.as_str()));

        let mut ifaces: HashMap<&str, HashMap<&str, Value<'_>>> = HashMap::new();
        ifaces.insert(interfaces::INVENTORY_ITEM, properties);

        let path = match ObjectPath::try_from(self.ident.path.as_str()) {
            Ok(p) => p,
            Err(e) => {
                warn!(fan = %self.ident.path, error = %e, "invalid inventory path");
                return;
            }
        };

        let mut objects: HashMap<ObjectPath<'_>, HashMap<&str, HashMap<&str, Value<'_>>>> =
            HashMap::new();
        objects.insert(path, ifaces);

        if let Err(e) = self
            .ctx
            .bus
            .lookup_and_call_method(
                paths::INVENTORY_ROOT,
                interfaces::INVENTORY_MANAGER,
                "Notify",
                &(objects,),
            )
            .await
        {
            warn!(fan = %self.ident.path, error = %e, "inventory presence update failed");
        }
    }

    /// Stop sensors and deregister from power tracking.
    pub async fn shutdown(&self) {
        for sensor in &self.sensors {
            sensor.lock().await.stop().await;
        }
        self.state.lock().await.settle_timer.disarm();
        self.ctx
            .power
            .remove_callback(&format!("{}-presence", self.ident.name))
            .await;
    }
}

// ============================================================================
// Policy fusion
// ============================================================================

pub(crate) fn any_of_verdict(sensors: &[SensorState]) -> bool {
    sensors.iter().any(|s| s.present)
}

/// Walk the priority order: the first non-failed sensor's verdict wins. A
/// sensor reporting absent while any lower-priority sensor reports present
/// is deemed failed (latched in its conflict bit) and the cascade falls
/// through.
pub(crate) fn fallback_verdict(sensors: &mut [SensorState]) -> (bool, Vec<usize>) {
    let mut newly_failed = Vec::new();

    for index in 0..sensors.len() {
        if sensors[index].conflict {
            continue;
        }
        if sensors[index].present {
            return (true, newly_failed);
        }
        if sensors[index + 1..].iter().any(|s| s.present) {
            sensors[index].conflict = true;
            newly_failed.push(index);
            continue;
        }
        return (false, newly_failed);
    }

    (false, newly_failed)
}

// ============================================================================
// Engine
// ============================================================================

/// Owns every fan's presence state and the missing-fan reporter.
pub struct PresenceEngine {
    fans: Vec<Arc<FanPresence>>,
    reporter: Option<Arc<ErrorReporter>>,
}

impl PresenceEngine {
    /// Build fans and sensors from config. A GPIO device that cannot be
    /// acquired degrades that sensor to Null with a callout event log; the
    /// rest of the configuration still loads.
    pub async fn new(ctx: &Context, config: &PresenceConfig) -> Result<Self> {
        let mut fans = Vec::with_capacity(config.fans.len());
        let mut reported = Vec::new();

        for fan_config in &config.fans {
            let ident = FanIdent {
                name: fan_config.name.clone(),
                path: fan_config.path.clone(),
            };

            let mut sensors = Vec::with_capacity(fan_config.methods.len());
            for method in &fan_config.methods {
                let sensor = match method {
                    PresenceMethod::Tach { sensors } => PresenceSensor::Tach(TachSensor::new(
                        ctx.clone(),
                        sensors.clone(),
                    )),
                    PresenceMethod::Gpio {
                        devpath,
                        physpath,
                        pin,
                        asserted_level,
                    } => match GpioSensor::new(
                        devpath.clone(),
                        physpath.clone(),
                        *pin,
                        *asserted_level,
                    ) {
                        Ok(sensor) => PresenceSensor::Gpio(sensor),
                        Err(e) => {
                            warn!(
                                fan = %ident.path,
                                device = %devpath.display(),
                                error = %e,
                                "GPIO presence sensor unavailable, substituting null"
                            );
                            let mut ad = HashMap::new();
                            ad.insert(
                                "CALLOUT_DEVICE_PATH".to_string(),
                                devpath.display().to_string(),
                            );
                            ad.insert("CALLOUT_GPIO_NUM".to_string(), pin.to_string());
                            ad.insert("_PID".to_string(), logging::pid_string());
                            logging::create_event_log(
                                &ctx.bus,
                                GPIO_CALLOUT_ERROR,
                                Severity::Critical,
                                ad,
                            )
                            .await;
                            PresenceSensor::Null {
                                reason: e.to_string(),
                            }
                        }
                    },
                };
                sensors.push(Mutex::new(sensor));
            }

            if let Some(missing_time) = fan_config.missing_time(&config.reporting) {
                reported.push((ident.path.clone(), missing_time));
            }

            let sensor_count = sensors.len();
            fans.push(Arc::new(FanPresence {
                ctx: ctx.clone(),
                ident,
                kind: fan_config.rpolicy,
                sensors,
                eeprom: fan_config
                    .eeprom
                    .as_ref()
                    .map(|e| Mutex::new(EepromDevice::new(e))),
                state: Mutex::new(PolicyState {
                    sensors: vec![SensorState::default(); sensor_count],
                    published: None,
                    power_settled: false,
                    settle_timer: OneShotTimer::new(),
                }),
            }));
        }

        let reporter = if reported.is_empty() {
            None
        } else {
            Some(ErrorReporter::new(ctx.clone(), reported))
        };

        Ok(Self { fans, reporter })
    }

    /// Start monitoring every fan and the missing-fan reporter.
    pub async fn start(&self) {
        for fan in &self.fans {
            fan.monitor().await;
        }
        if let Some(reporter) = &self.reporter {
            reporter.start().await;
        }
    }

    pub async fn shutdown(&self) {
        for fan in &self.fans {
            fan.shutdown().await;
        }
        if let Some(reporter) = &self.reporter {
            reporter.shutdown().await;
        }
    }

    /// Fan presence snapshot for the state dump.
    pub async fn snapshot(&self) -> serde_json::Value {
        let mut fans = Vec::new();
        for fan in &self.fans {
            let state = fan.state.lock().await;
            fans.push(serde_json::json!({
                "path": fan.ident.path,
                "name": fan.ident.name,
                "policy": format!("{:?}", fan.kind),
                "present": state.published,
                "sensors": state
                    .sensors
                    .iter()
                    .map(|s| serde_json::json!({ "present": s.present, "conflict": s.conflict }))
                    .collect::<Vec<_>>(),
            }));
        }
        serde_json::json!({ "fans": fans })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn states(presents: &[bool]) -> Vec<SensorState> {
        presents
            .iter()
            .map(|p| SensorState {
                present: *p,
                conflict: false,
            })
            .collect()
    }

    #[test]
    fn test_any_of_verdict() {
        assert!(!any_of_verdict(&states(&[false, false])));
        assert!(any_of_verdict(&states(&[false, true])));
        assert!(any_of_verdict(&states(&[true, true])));
    }

    #[test]
    fn test_fallback_first_present_wins() {
        let mut s = states(&[true, false]);
        let (verdict, failed) = fallback_verdict(&mut s);
        assert!(verdict);
        assert!(failed.is_empty());
    }

    #[test]
    fn test_fallback_all_absent() {
        let mut s = states(&[false, false]);
        let (verdict, failed) = fallback_verdict(&mut s);
        assert!(!verdict);
        assert!(failed.is_empty());
    }

    #[test]
    fn test_fallback_disagreement_fails_higher_priority() {
        // tach says absent, gpio says present: tach fails once, gpio wins
        let mut s = states(&[false, true]);
        let (verdict, failed) = fallback_verdict(&mut s);
        assert!(verdict);
        assert_eq!(failed, vec![0]);
        assert!(s[0].conflict);

        // Re-evaluating does not fail it again (no flapping)
        let (verdict, failed) = fallback_verdict(&mut s);
        assert!(verdict);
        assert!(failed.is_empty());
    }

    #[test]
    fn test_fallback_cascades_through_failures() {
        let mut s = states(&[false, false, true]);
        let (verdict, failed) = fallback_verdict(&mut s);
        assert!(verdict);
        assert_eq!(failed, vec![0, 1]);
    }

    #[test]
    fn test_fallback_failed_sensor_stays_skipped() {
        let mut s = states(&[false, true]);
        let _ = fallback_verdict(&mut s);

        // gpio drops out later: verdict follows gpio even though tach is
        // still absent-and-failed
        s[1].present = false;
        let (verdict, failed) = fallback_verdict(&mut s);
        assert!(!verdict);
        assert!(failed.is_empty());
    }
}
