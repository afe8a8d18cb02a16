//! Threshold-alarm shutdown monitor
//!
//! Watches per-sensor "shutdown threshold tripped" booleans on the bus and
//! runs a grace-period timer per alarm. If the alarm does not clear in
//! time, the monitor requests a BMC dump, starts the hard chassis power-off
//! target, and emits a Critical event log. Timer start times persist across
//! daemon restarts so a restart mid-countdown resumes the remaining delay
//! rather than granting a fresh one.

pub mod alarm;
pub mod domain;
pub mod logger;
pub mod recovery;
pub mod timestamps;

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use futures::StreamExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::bus::{self, rules};
use crate::constants::{defaults, interfaces, paths, services, units};
use crate::context::Context;
use crate::timer::OneShotTimer;
use crate::types::PropertyValue;

pub use alarm::{AlarmDirection, AlarmKey, AlarmSeverity};
pub use domain::{DomainEvent, DomainEventSender};
pub use recovery::RecoveryMonitor;
pub use timestamps::AlarmTimestamps;

/// Grace periods per shutdown severity.
#[derive(Debug, Clone, Copy)]
pub struct ShutdownDelays {
    pub hard: Duration,
    pub soft: Duration,
}

impl Default for ShutdownDelays {
    fn default() -> Self {
        Self {
            hard: Duration::from_millis(defaults::HARD_SHUTDOWN_DELAY_MS),
            soft: Duration::from_millis(defaults::SOFT_SHUTDOWN_DELAY_MS),
        }
    }
}

impl ShutdownDelays {
    fn for_severity(&self, severity: AlarmSeverity) -> Duration {
        match severity {
            AlarmSeverity::HardShutdown => self.hard,
            _ => self.soft,
        }
    }
}

/// Delay left on a timer whose persisted start was `prev_start_ms`.
/// `None` means the persisted time is in the future (clock went backwards);
/// the caller uses the full configured delay and logs a warning.
pub fn remaining_delay(configured: Duration, prev_start_ms: u64, now_ms: u64) -> Option<Duration> {
    if now_ms <= prev_start_ms {
        return None;
    }
    let elapsed = now_ms - prev_start_ms;
    let configured_ms = configured.as_millis() as u64;
    Some(Duration::from_millis(configured_ms.saturating_sub(elapsed)))
}

fn wall_clock_ms() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub struct ShutdownMonitor {
    ctx: Context,
    delays: ShutdownDelays,
    alarms: Mutex<HashMap<AlarmKey, Option<OneShotTimer>>>,
    timestamps: Mutex<AlarmTimestamps>,
    domain: DomainEventSender,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ShutdownMonitor {
    pub fn new(
        ctx: Context,
        delays: ShutdownDelays,
        persist_dir: &Path,
        domain: DomainEventSender,
    ) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            delays,
            alarms: Mutex::new(HashMap::new()),
            timestamps: Mutex::new(AlarmTimestamps::load(persist_dir)),
            domain,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Discover alarms, reconcile persisted state, and start watching.
    pub async fn start(self: &Arc<Self>) {
        self.find_alarms().await;

        let monitor = self.clone();
        self.ctx
            .power
            .add_callback(
                "shutdownMon",
                crate::power::power_callback(move |on| {
                    let monitor = monitor.clone();
                    async move { monitor.power_changed(on).await }
                }),
            )
            .await;

        if self.ctx.power.is_power_on().await {
            self.check_alarms().await;

            // Persisted starts whose alarms cleared during the restart are
            // stale now.
            let running: HashSet<AlarmKey> = {
                let alarms = self.alarms.lock().await;
                alarms
                    .iter()
                    .filter(|(_, timer)| timer.as_ref().map(|t| t.is_armed()).unwrap_or(false))
                    .map(|(key, _)| key.clone())
                    .collect()
            };
            self.timestamps.lock().await.prune(&running);
        } else {
            self.timestamps.lock().await.clear();
        }

        for severity in AlarmSeverity::SHUTDOWN {
            let rule =
                rules::properties_changed_namespace(paths::SENSORS_ROOT, severity.interface());
            match self.ctx.bus.subscribe(&rule).await {
                Ok(mut stream) => {
                    let monitor = self.clone();
                    self.tasks.lock().await.push(tokio::spawn(async move {
                        while let Some(Ok(msg)) = stream.next().await {
                            monitor.properties_changed(&msg).await;
                        }
                    }));
                }
                Err(e) => error!(
                    interface = severity.interface(),
                    error = %e,
                    "shutdown alarm subscription failed"
                ),
            }
        }

        info!("shutdown alarm monitoring started");
    }

    pub async fn shutdown(&self) {
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        for timer in self.alarms.lock().await.values_mut().flatten() {
            timer.disarm();
        }
        self.ctx.power.remove_callback("shutdownMon").await;
    }

    /// Preseed the alarm map with both directions of every sensor that
    /// exposes a shutdown threshold interface.
    async fn find_alarms(&self) {
        for severity in AlarmSeverity::SHUTDOWN {
            let sensor_paths = match self
                .ctx
                .bus
                .get_subtree_paths("/", severity.interface(), 0)
                .await
            {
                Ok(paths) => paths,
                Err(e) => {
                    warn!(
                        interface = severity.interface(),
                        error = %e,
                        "shutdown threshold discovery failed"
                    );
                    continue;
                }
            };

            let mut alarms = self.alarms.lock().await;
            for path in sensor_paths {
                for direction in AlarmDirection::BOTH {
                    alarms
                        .entry(AlarmKey::new(path.clone(), severity, direction))
                        .or_insert(None);
                }
            }
        }

        info!(
            count = self.alarms.lock().await.len(),
            "shutdown alarms discovered"
        );
    }

    /// Read every known alarm property once and reconcile timers.
    async fn check_alarms(self: &Arc<Self>) {
        let keys: Vec<AlarmKey> = self.alarms.lock().await.keys().cloned().collect();

        for key in keys {
            let value = match self
                .ctx
                .bus
                .get_property::<bool>(&key.sensor_path, key.severity.interface(), key.property())
                .await
            {
                Ok(value) => value,
                Err(e) => {
                    // The sensor left the bus; nothing to reconcile.
                    info!(sensor = %key.sensor_path, error = %e, "alarm sensor not readable");
                    continue;
                }
            };
            self.check_alarm(value, key).await;
        }
    }

    async fn properties_changed(self: &Arc<Self>, msg: &zbus::Message) {
        if !self.ctx.power.is_power_on().await {
            return;
        }

        let Ok(parsed) = bus::read_properties_changed(msg) else {
            return;
        };
        let Some(severity) = AlarmSeverity::from_interface(&parsed.interface) else {
            return;
        };

        for direction in AlarmDirection::BOTH {
            let property = severity.property(direction);
            if let Some(value) = parsed
                .changed
                .get(property)
                .and_then(PropertyValue::from_variant)
                .and_then(|v| v.as_bool())
            {
                let key = AlarmKey::new(parsed.path.clone(), severity, direction);
                self.alarms.lock().await.entry(key.clone()).or_insert(None);
                self.check_alarm(value, key).await;
            }
        }
    }

    /// Start or stop the grace timer to match the alarm value.
    async fn check_alarm(self: &Arc<Self>, value: bool, key: AlarmKey) {
        let has_timer = {
            let alarms = self.alarms.lock().await;
            match alarms.get(&key) {
                Some(timer) => timer.as_ref().map(|t| t.is_armed()).unwrap_or(false),
                None => return,
            }
        };

        if value && !has_timer {
            self.start_timer(key).await;
        } else if !value && has_timer {
            self.stop_timer(key).await;
        }
    }

    async fn start_timer(self: &Arc<Self>, key: AlarmKey) {
        let sensor_value = self.read_sensor_value(&key.sensor_path).await;

        logger::log_alarm_transition(&self.ctx.bus, &key, true, sensor_value, false).await;

        let configured = self.delays.for_severity(key.severity);
        let now = wall_clock_ms();

        let delay = match self.timestamps.lock().await.get(&key) {
            Some(prev) => {
                info!(
                    alarm = key.property(),
                    sensor = %key.sensor_path,
                    start = prev,
                    "found previously running shutdown timer"
                );
                match remaining_delay(configured, prev, now) {
                    Some(remaining) => remaining,
                    None => {
                        warn!(
                            alarm = key.property(),
                            sensor = %key.sensor_path,
                            "saved start time is after current time, restarting full delay"
                        );
                        configured
                    }
                }
            }
            None => configured,
        };

        info!(
            alarm = key.property(),
            sensor = %key.sensor_path,
            delay_ms = delay.as_millis() as u64,
            "starting shutdown timer"
        );
        self.ctx.recorder.log(
            "monitor",
            format!("{} {} armed {}ms", key.sensor_path, key.property(), delay.as_millis()),
        );

        {
            let mut alarms = self.alarms.lock().await;
            let monitor = self.clone();
            let timer_key = key.clone();
            let mut timer = OneShotTimer::new();
            timer.restart_once(delay, move || async move {
                monitor.trigger_protection(timer_key).await;
            });
            alarms.insert(key.clone(), Some(timer));
        }

        // If the key is already persisted (restart case) the original
        // start time is kept.
        self.timestamps.lock().await.add(key, now);
    }

    async fn stop_timer(self: &Arc<Self>, key: AlarmKey) {
        let sensor_value = self.read_sensor_value(&key.sensor_path).await;

        logger::log_alarm_transition(&self.ctx.bus, &key, false, sensor_value, false).await;

        info!(
            alarm = key.property(),
            sensor = %key.sensor_path,
            "alarm cleared, stopping shutdown timer"
        );
        self.ctx.recorder.log(
            "monitor",
            format!("{} {} cleared", key.sensor_path, key.property()),
        );

        {
            let mut alarms = self.alarms.lock().await;
            if let Some(timer) = alarms.get_mut(&key) {
                if let Some(timer) = timer.as_mut() {
                    timer.disarm();
                }
                *timer = None;
            }
        }

        self.timestamps.lock().await.erase(&key);
    }

    /// The grace period ran out: dump, power off, log, announce.
    async fn trigger_protection(self: &Arc<Self>, key: AlarmKey) {
        let sensor_value = self.read_sensor_value(&key.sensor_path).await;

        error!(
            alarm = key.property(),
            sensor = %key.sensor_path,
            "shutdown timer expired, powering off the chassis"
        );
        self.ctx.recorder.log(
            "monitor",
            format!("{} {} expired, chassis power-off", key.sensor_path, key.property()),
        );

        self.create_bmc_dump().await;

        if let Err(e) = self
            .ctx
            .bus
            .call_method(
                services::SYSTEMD,
                paths::SYSTEMD,
                interfaces::SYSTEMD_MANAGER,
                "StartUnit",
                &(units::HARD_POWEROFF_TARGET, "replace"),
            )
            .await
        {
            // The alarm log below still goes out; the monitor keeps
            // watching.
            error!(error = %e, "failed to start the hard power-off target");
        }

        logger::log_alarm_transition(&self.ctx.bus, &key, true, sensor_value, true).await;

        self.timestamps.lock().await.erase(&key);
        self.alarms.lock().await.insert(key.clone(), None);

        let _ = self.domain.send(DomainEvent::SystemProtectionTriggered {
            sensor_path: key.sensor_path,
        });
    }

    async fn power_changed(self: &Arc<Self>, on: bool) {
        if on {
            self.check_alarms().await;
        } else {
            self.timestamps.lock().await.clear();
            for timer in self.alarms.lock().await.values_mut() {
                if let Some(timer) = timer.as_mut() {
                    timer.disarm();
                }
                *timer = None;
            }
        }
    }

    async fn read_sensor_value(&self, sensor_path: &str) -> Option<f64> {
        // Best-effort: the Value interface may not be mapped yet if the
        // sensor tripped immediately after creation.
        self.ctx
            .bus
            .get_property::<f64>(sensor_path, interfaces::SENSOR_VALUE, "Value")
            .await
            .ok()
    }

    async fn create_bmc_dump(&self) {
        let args: HashMap<&str, zbus::zvariant::Value<'_>> = HashMap::new();
        if let Err(e) = self
            .ctx
            .bus
            .call_method(
                services::DUMP_MANAGER,
                paths::DUMP_BMC,
                interfaces::DUMP_CREATE,
                "CreateDump",
                &(args,),
            )
            .await
        {
            error!(error = %e, "BMC dump creation failed");
        }
    }

    /// Alarm state snapshot for the state dump.
    pub async fn snapshot(&self) -> serde_json::Value {
        let alarms = self.alarms.lock().await;
        let entries: Vec<serde_json::Value> = alarms
            .iter()
            .map(|(key, timer)| {
                serde_json::json!({
                    "sensor": key.sensor_path,
                    "alarm": key.property(),
                    "timer_armed": timer.as_ref().map(|t| t.is_armed()).unwrap_or(false),
                })
            })
            .collect();
        serde_json::json!({ "alarms": entries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remaining_delay_mid_countdown() {
        // Restarted 10s into a 23s grace period: about 13s remain.
        let configured = Duration::from_secs(23);
        let remaining = remaining_delay(configured, 1_000_000, 1_010_000).unwrap();
        assert_eq!(remaining, Duration::from_secs(13));
    }

    #[test]
    fn test_remaining_delay_already_elapsed() {
        let configured = Duration::from_secs(23);
        let remaining = remaining_delay(configured, 1_000_000, 1_060_000).unwrap();
        assert_eq!(remaining, Duration::ZERO);
    }

    #[test]
    fn test_remaining_delay_clock_went_backwards() {
        let configured = Duration::from_secs(23);
        assert_eq!(remaining_delay(configured, 2_000_000, 1_000_000), None);
        assert_eq!(remaining_delay(configured, 1_000_000, 1_000_000), None);
    }

    #[test]
    fn test_default_delays() {
        let delays = ShutdownDelays::default();
        assert_eq!(
            delays.for_severity(AlarmSeverity::HardShutdown),
            Duration::from_millis(defaults::HARD_SHUTDOWN_DELAY_MS)
        );
        assert_eq!(
            delays.for_severity(AlarmSeverity::SoftShutdown),
            Duration::from_millis(defaults::SOFT_SHUTDOWN_DELAY_MS)
        );
    }
}
