//! Missing-fan error reporting
//!
//! Event logs for missing fans are created after a fan has been absent for
//! its configured missing-time budget while power is on. Timers never run
//! with power off; turning power on re-arms timers for any still-missing
//! fans. One log per absence: the latch resets on a presence transition or
//! a daemon restart.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::bus::{self, rules};
use crate::constants::interfaces;
use crate::context::Context;
use crate::logging::{self, Severity};
use crate::timer::OneShotTimer;
use crate::types::PropertyValue;

const FAN_MISSING_ERROR: &str = "xyz.openbmc_project.Fan.Error.FanMissing";

struct FanReportState {
    present: bool,
    /// One error per absence
    logged: bool,
    missing_time: Duration,
    timer: OneShotTimer,
}

pub struct ErrorReporter {
    ctx: Context,
    states: Mutex<HashMap<String, FanReportState>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ErrorReporter {
    pub fn new(ctx: Context, fans: Vec<(String, Duration)>) -> Arc<Self> {
        let states = fans
            .into_iter()
            .map(|(path, missing_time)| {
                (
                    path,
                    FanReportState {
                        present: true,
                        logged: false,
                        missing_time,
                        timer: OneShotTimer::new(),
                    },
                )
            })
            .collect();

        Arc::new(Self {
            ctx,
            states: Mutex::new(states),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub async fn start(self: &Arc<Self>) {
        let fan_paths: Vec<String> = self.states.lock().await.keys().cloned().collect();

        for path in &fan_paths {
            // Seed from inventory; an unreadable Present is treated as
            // present so a missing inventory service cannot trip errors.
            match self
                .ctx
                .bus
                .get_property::<bool>(path, interfaces::INVENTORY_ITEM, "Present")
                .await
            {
                Ok(present) => {
                    if let Some(state) = self.states.lock().await.get_mut(path) {
                        state.present = present;
                    }
                }
                Err(e) => debug!(fan = %path, error = %e, "initial Present read failed"),
            }

            let rule = rules::properties_changed(path, interfaces::INVENTORY_ITEM);
            match self.ctx.bus.subscribe(&rule).await {
                Ok(mut stream) => {
                    let reporter = self.clone();
                    let fan_path = path.clone();
                    self.tasks.lock().await.push(tokio::spawn(async move {
                        while let Some(Ok(msg)) = stream.next().await {
                            let Ok(parsed) = bus::read_properties_changed(&msg) else {
                                continue;
                            };
                            if let Some(present) = parsed
                                .changed
                                .get("Present")
                                .and_then(PropertyValue::from_variant)
                                .and_then(|v| v.as_bool())
                            {
                                reporter.presence_changed(&fan_path, present).await;
                            }
                        }
                    }));
                }
                Err(e) => warn!(fan = %path, error = %e, "presence subscription failed"),
            }
        }

        let reporter = self.clone();
        self.ctx
            .power
            .add_callback(
                "errorReporter",
                crate::power::power_callback(move |on| {
                    let reporter = reporter.clone();
                    async move { reporter.power_changed(on).await }
                }),
            )
            .await;

        if self.ctx.power.is_power_on().await {
            for path in fan_paths {
                self.check_fan(&path).await;
            }
        }
    }

    async fn presence_changed(self: &Arc<Self>, path: &str, present: bool) {
        {
            let mut states = self.states.lock().await;
            let Some(state) = states.get_mut(path) else {
                return;
            };
            if state.present != present {
                state.present = present;
                state.logged = false;
            }
        }
        self.check_fan(path).await;
    }

    async fn power_changed(self: &Arc<Self>, on: bool) {
        if on {
            let paths: Vec<String> = self.states.lock().await.keys().cloned().collect();
            for path in paths {
                self.check_fan(&path).await;
            }
        } else {
            // Disarm without resetting the logged latch.
            for state in self.states.lock().await.values_mut() {
                state.timer.disarm();
            }
        }
    }

    /// Arm the missing timer iff the fan is absent with power on; disarm
    /// otherwise.
    async fn check_fan(self: &Arc<Self>, path: &str) {
        let power_on = self.ctx.power.is_power_on().await;
        let mut states = self.states.lock().await;
        let Some(state) = states.get_mut(path) else {
            return;
        };

        if !state.present && power_on {
            if !state.logged && !state.timer.is_armed() {
                let reporter = self.clone();
                let fan_path = path.to_string();
                let seconds = state.missing_time.as_secs();
                state
                    .timer
                    .restart_once(state.missing_time, move || async move {
                        reporter.fan_missing_expired(&fan_path, seconds).await;
                    });
                debug!(fan = %path, seconds, "fan missing timer armed");
            }
        } else {
            state.timer.disarm();
        }
    }

    async fn fan_missing_expired(self: &Arc<Self>, path: &str, seconds: u64) {
        {
            let mut states = self.states.lock().await;
            let Some(state) = states.get_mut(path) else {
                return;
            };
            if state.logged {
                return;
            }
            state.logged = true;
        }

        error!(fan = %path, seconds, "fan missing past its time budget");
        self.ctx
            .recorder
            .log("presence", format!("{} missing for {}s", path, seconds));

        let mut ad = HashMap::new();
        ad.insert("FAN_PATH".to_string(), path.to_string());
        ad.insert("TIME_IN_SECONDS".to_string(), seconds.to_string());
        ad.insert("_PID".to_string(), logging::pid_string());
        logging::create_event_log(&self.ctx.bus, FAN_MISSING_ERROR, Severity::Error, ad).await;
    }

    pub async fn shutdown(&self) {
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        for state in self.states.lock().await.values_mut() {
            state.timer.disarm();
        }
        self.ctx.power.remove_callback("errorReporter").await;
    }
}
