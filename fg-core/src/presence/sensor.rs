//! Presence sensor variants
//!
//! A fan's presence is judged from one or more hardware signals. Each
//! sensor exposes `start` (arm notifications, return the initial verdict),
//! `stop`, `present` (offline query), and `fail` (log a conflict or
//! hardware event). The variants are a tagged enum; dispatch is a match.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::bus::{self, rules};
use crate::constants::{interfaces, paths};
use crate::context::Context;
use crate::logging::{self, Severity};
use crate::presence::gpio::LineEventHandle;
use crate::presence::{FanIdent, FanPresence};
use crate::types::PropertyValue;

const DETECTION_ERROR: &str = "xyz.openbmc_project.Fan.Presence.Error.Detection";
const GPIO_CALLOUT_ERROR: &str = "xyz.openbmc_project.Common.Callout.Error.GPIO";

pub enum PresenceSensor {
    Tach(TachSensor),
    Gpio(GpioSensor),
    /// Placeholder for hardware that could not be acquired; always absent.
    Null { reason: String },
}

impl PresenceSensor {
    /// Arm notifications and return the initial verdict.
    pub async fn start(&mut self, fan: &Arc<FanPresence>, index: usize) -> bool {
        match self {
            PresenceSensor::Tach(s) => s.start(fan, index).await,
            PresenceSensor::Gpio(s) => s.start(fan, index).await,
            PresenceSensor::Null { .. } => false,
        }
    }

    /// Stop issuing state-change notifications.
    pub async fn stop(&mut self) {
        match self {
            PresenceSensor::Tach(s) => s.stop(),
            PresenceSensor::Gpio(s) => s.stop(),
            PresenceSensor::Null { .. } => {}
        }
    }

    /// Offline presence query.
    pub async fn present(&self) -> bool {
        match self {
            PresenceSensor::Tach(s) => s.present(),
            PresenceSensor::Gpio(s) => s.present(),
            PresenceSensor::Null { .. } => false,
        }
    }

    /// Log that this sensor disagrees with the rest of its policy, or that
    /// its hardware is suspect.
    pub async fn fail(&self, fan: &FanIdent, ctx: &Context) {
        match self {
            PresenceSensor::Tach(s) => s.fail(fan, ctx).await,
            PresenceSensor::Gpio(s) => s.fail(fan, ctx).await,
            PresenceSensor::Null { reason } => {
                warn!(fan = %fan.path, reason, "null presence sensor flagged");
            }
        }
    }

    pub fn describe(&self) -> String {
        match self {
            PresenceSensor::Tach(s) => format!("tach[{}]", s.sensors.join(",")),
            PresenceSensor::Gpio(s) => format!("gpio[{}:{}]", s.device.display(), s.line),
            PresenceSensor::Null { reason } => format!("null[{}]", reason),
        }
    }
}

// ============================================================================
// Tach
// ============================================================================

/// Present iff any of the named tach sensors reads nonzero.
pub struct TachSensor {
    ctx: Context,
    sensors: Vec<String>,
    cache: Arc<Mutex<HashMap<String, f64>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl TachSensor {
    pub fn new(ctx: Context, sensors: Vec<String>) -> Self {
        Self {
            ctx,
            sensors,
            cache: Arc::new(Mutex::new(HashMap::new())),
            tasks: Vec::new(),
        }
    }

    async fn start(&mut self, fan: &Arc<FanPresence>, index: usize) -> bool {
        for name in &self.sensors {
            let path = format!("{}/{}", paths::FAN_TACH_ROOT, name);

            // Seed the cache; the sensor service may not be up yet.
            match self
                .ctx
                .bus
                .get_property::<f64>(&path, interfaces::SENSOR_VALUE, "Value")
                .await
            {
                Ok(value) => {
                    self.cache.lock().insert(name.clone(), value);
                }
                Err(e) => debug!(sensor = %path, error = %e, "initial tach read failed"),
            }

            let rule = rules::properties_changed(&path, interfaces::SENSOR_VALUE);
            let stream = match self.ctx.bus.subscribe(&rule).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(sensor = %path, error = %e, "tach subscription failed");
                    continue;
                }
            };

            self.tasks.push(tokio::spawn(Self::watch(
                stream,
                name.clone(),
                self.cache.clone(),
                fan.clone(),
                index,
            )));
        }

        self.present()
    }

    async fn watch(
        mut stream: zbus::MessageStream,
        name: String,
        cache: Arc<Mutex<HashMap<String, f64>>>,
        fan: Arc<FanPresence>,
        index: usize,
    ) {
        while let Some(Ok(msg)) = stream.next().await {
            let parsed = match bus::read_properties_changed(&msg) {
                Ok(p) => p,
                Err(_) => continue,
            };

            let Some(value) = parsed
                .changed
                .get("Value")
                .and_then(PropertyValue::from_variant)
                .and_then(|v| v.numeric())
            else {
                continue;
            };

            let (old_verdict, new_verdict) = {
                let mut cache = cache.lock();
                let old = cache.values().any(|v| *v != 0.0);
                cache.insert(name.clone(), value);
                let new = cache.values().any(|v| *v != 0.0);
                (old, new)
            };

            if old_verdict != new_verdict {
                fan.state_changed(index, new_verdict).await;
            }
        }
    }

    fn present(&self) -> bool {
        self.cache.lock().values().any(|v| *v != 0.0)
    }

    fn stop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }

    async fn fail(&self, fan: &FanIdent, ctx: &Context) {
        let mut ad = HashMap::new();
        ad.insert("CALLOUT_INVENTORY_PATH".to_string(), fan.path.clone());
        ad.insert("_PID".to_string(), logging::pid_string());
        logging::create_event_log(&ctx.bus, DETECTION_ERROR, Severity::Informational, ad).await;
    }
}

// ============================================================================
// GPIO
// ============================================================================

/// Wrapper giving the async reactor a borrowable fd for the shared line.
struct EventFd(Arc<LineEventHandle>);

impl std::os::fd::AsRawFd for EventFd {
    fn as_raw_fd(&self) -> std::os::fd::RawFd {
        use std::os::fd::AsRawFd;
        self.0.as_raw_fd()
    }
}

/// Present iff the requested line reads the configured asserted level.
pub struct GpioSensor {
    device: PathBuf,
    phys: String,
    line: u32,
    asserted: u8,
    handle: Arc<LineEventHandle>,
    task: Option<JoinHandle<()>>,
}

impl GpioSensor {
    /// Acquire the line. Failure here is surfaced to the engine, which
    /// substitutes a Null sensor and raises an event log.
    pub fn new(
        device: PathBuf,
        phys: String,
        line: u32,
        asserted: u8,
    ) -> fg_error::Result<Self> {
        let handle = LineEventHandle::open(&device, line)?;
        Ok(Self {
            device,
            phys,
            line,
            asserted,
            handle: Arc::new(handle),
            task: None,
        })
    }

    async fn start(&mut self, fan: &Arc<FanPresence>, index: usize) -> bool {
        let initial = self.present();

        let handle = self.handle.clone();
        let asserted = self.asserted;
        let fan = fan.clone();
        self.task = Some(tokio::spawn(async move {
            let async_fd = match AsyncFd::with_interest(EventFd(handle.clone()), Interest::READABLE)
            {
                Ok(fd) => fd,
                Err(e) => {
                    warn!(error = %e, "failed to register GPIO event fd");
                    return;
                }
            };

            let mut current = handle.level().map(|l| l == asserted).unwrap_or(false);

            loop {
                let mut guard = match async_fd.readable().await {
                    Ok(g) => g,
                    Err(_) => return,
                };

                loop {
                    match handle.read_event() {
                        Ok(Some(_)) => continue,
                        Ok(None) => {
                            guard.clear_ready();
                            break;
                        }
                        Err(e) => {
                            warn!(error = %e, "GPIO event read failed");
                            return;
                        }
                    }
                }

                let level = match handle.level() {
                    Ok(l) => l,
                    Err(e) => {
                        warn!(error = %e, "GPIO level read failed");
                        continue;
                    }
                };

                let state = level == asserted;
                if state != current {
                    current = state;
                    fan.state_changed(index, state).await;
                }
            }
        }));

        initial
    }

    fn present(&self) -> bool {
        self.handle
            .level()
            .map(|l| l == self.asserted)
            .unwrap_or(false)
    }

    fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    async fn fail(&self, fan: &FanIdent, ctx: &Context) {
        let mut ad = HashMap::new();
        ad.insert("CALLOUT_GPIO_NUM".to_string(), self.line.to_string());
        ad.insert("CALLOUT_ERRNO".to_string(), "0".to_string());
        ad.insert("CALLOUT_DEVICE_PATH".to_string(), self.phys.clone());
        ad.insert("CALLOUT_INVENTORY_PATH".to_string(), fan.path.clone());
        ad.insert("_PID".to_string(), logging::pid_string());
        logging::create_event_log(&ctx.bus, GPIO_CALLOUT_ERROR, Severity::Error, ad).await;
    }
}
