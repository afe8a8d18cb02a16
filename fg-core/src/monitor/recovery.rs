//! Recovery alarms
//!
//! After a protective shutdown, the tripping sensor's Critical/Warning
//! alarms are watched with inverse semantics: while the sensor stays
//! untripped, a per-sensor stable countdown runs; a re-trip cancels it.
//! When the countdown survives, the configured recovery systemd target is
//! started, driving autonomous return to service.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bus::{self, rules};
use crate::config::RecoveryConfig;
use crate::constants::{interfaces, paths, services};
use crate::context::Context;
use crate::monitor::alarm::{AlarmDirection, AlarmKey, AlarmSeverity};
use crate::monitor::domain::{DomainEvent, DomainEventSender};
use crate::timer::OneShotTimer;
use crate::types::PropertyValue;

pub struct RecoveryMonitor {
    ctx: Context,
    config: RecoveryConfig,
    domain: DomainEventSender,
    watches: Mutex<HashMap<(String, AlarmSeverity), JoinHandle<()>>>,
    timers: Mutex<HashMap<AlarmKey, OneShotTimer>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RecoveryMonitor {
    pub fn new(ctx: Context, config: RecoveryConfig, domain: DomainEventSender) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            config,
            domain,
            watches: Mutex::new(HashMap::new()),
            timers: Mutex::new(HashMap::new()),
            task: Mutex::new(None),
        })
    }

    /// Listen for protection/recovery announcements.
    pub async fn start(self: &Arc<Self>) {
        let monitor = self.clone();
        let mut events = self.domain.subscribe();

        let task = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(DomainEvent::SystemProtectionTriggered { sensor_path }) => {
                        for severity in monitor.severities_for(&sensor_path) {
                            monitor.watch_sensor_alarm(&sensor_path, severity).await;
                        }
                    }
                    Ok(DomainEvent::SystemRecoveryTriggered {
                        sensor_path,
                        severity,
                    }) => {
                        monitor.stop_watch(&sensor_path, severity).await;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "recovery monitor lagged behind domain events");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        *self.task.lock().await = Some(task);
        info!(
            target = %self.config.target,
            sensors = self.config.sensors.len(),
            "recovery monitoring ready"
        );
    }

    pub async fn shutdown(&self) {
        if let Some(task) = self.task.lock().await.take() {
            task.abort();
        }
        for (_, watch) in self.watches.lock().await.drain() {
            watch.abort();
        }
        for timer in self.timers.lock().await.values_mut() {
            timer.disarm();
        }
    }

    /// Severities to watch for a sensor, derived from its configured
    /// threshold alarm names.
    fn severities_for(&self, sensor_path: &str) -> Vec<AlarmSeverity> {
        let Some(sensor) = self.config.sensor(sensor_path) else {
            debug!(sensor = %sensor_path, "no recovery config for sensor");
            return Vec::new();
        };

        let mut severities = Vec::new();
        for threshold in &sensor.thresholds {
            match AlarmSeverity::from_property(&threshold.alarm) {
                Some((severity, _)) if !severity.is_shutdown() => {
                    if !severities.contains(&severity) {
                        severities.push(severity);
                    }
                }
                _ => error!(
                    alarm = %threshold.alarm,
                    "threshold does not match a recovery alarm interface"
                ),
            }
        }
        severities
    }

    /// Install a watch on one sensor's recovery interface and evaluate the
    /// current alarm state once.
    async fn watch_sensor_alarm(self: &Arc<Self>, sensor_path: &str, severity: AlarmSeverity) {
        let watch_key = (sensor_path.to_string(), severity);
        if self.watches.lock().await.contains_key(&watch_key) {
            return;
        }

        let rule = rules::properties_changed(sensor_path, severity.interface());
        let mut stream = match self.ctx.bus.subscribe(&rule).await {
            Ok(stream) => stream,
            Err(e) => {
                error!(sensor = %sensor_path, error = %e, "recovery watch subscription failed");
                return;
            }
        };

        let monitor = self.clone();
        let path = sensor_path.to_string();
        let task = tokio::spawn(async move {
            while let Some(Ok(msg)) = stream.next().await {
                let Ok(parsed) = bus::read_properties_changed(&msg) else {
                    continue;
                };
                for direction in AlarmDirection::BOTH {
                    let property = severity.property(direction);
                    if let Some(value) = parsed
                        .changed
                        .get(property)
                        .and_then(PropertyValue::from_variant)
                        .and_then(|v| v.as_bool())
                    {
                        monitor
                            .check_recovery(AlarmKey::new(path.clone(), severity, direction), value)
                            .await;
                    }
                }
            }
        });
        self.watches.lock().await.insert(watch_key, task);

        info!(sensor = %sensor_path, severity = ?severity, "watching sensor for recovery");

        // Evaluate the current state: the sensor may already be stable.
        for direction in AlarmDirection::BOTH {
            if self
                .countdown_for(sensor_path, severity, direction)
                .is_none()
            {
                continue;
            }
            match self
                .ctx
                .bus
                .get_property::<bool>(
                    sensor_path,
                    severity.interface(),
                    severity.property(direction),
                )
                .await
            {
                Ok(value) => {
                    self.check_recovery(
                        AlarmKey::new(sensor_path.to_string(), severity, direction),
                        value,
                    )
                    .await;
                }
                Err(e) => debug!(sensor = %sensor_path, error = %e, "recovery alarm read failed"),
            }
        }
    }

    async fn stop_watch(&self, sensor_path: &str, severity: AlarmSeverity) {
        let removed = self
            .watches
            .lock()
            .await
            .remove(&(sensor_path.to_string(), severity));
        match removed {
            Some(task) => task.abort(),
            None => {
                error!(sensor = %sensor_path, severity = ?severity, "no recovery watch to remove")
            }
        }

        let mut timers = self.timers.lock().await;
        let stale: Vec<AlarmKey> = timers
            .keys()
            .filter(|key| key.sensor_path == sensor_path && key.severity == severity)
            .cloned()
            .collect();
        for key in stale {
            if let Some(mut timer) = timers.remove(&key) {
                timer.disarm();
            }
        }
    }

    /// Inverse alarm semantics: untripped starts the stable countdown,
    /// a re-trip cancels it.
    async fn check_recovery(self: &Arc<Self>, key: AlarmKey, tripped: bool) {
        let Some(countdown) = self.countdown_for(&key.sensor_path, key.severity, key.direction)
        else {
            return;
        };

        let mut timers = self.timers.lock().await;
        let armed = timers.get(&key).map(|t| t.is_armed()).unwrap_or(false);

        if !tripped && !armed {
            info!(
                sensor = %key.sensor_path,
                alarm = key.property(),
                countdown_ms = countdown.as_millis() as u64,
                "sensor stable, starting recovery countdown"
            );
            let monitor = self.clone();
            let timer_key = key.clone();
            let timer = timers.entry(key).or_default();
            timer.restart_once(countdown, move || async move {
                monitor.trigger_recovery(timer_key).await;
            });
        } else if tripped && armed {
            info!(
                sensor = %key.sensor_path,
                alarm = key.property(),
                "sensor tripped again, cancelling recovery countdown"
            );
            if let Some(timer) = timers.get_mut(&key) {
                timer.disarm();
            }
        }
    }

    async fn trigger_recovery(self: &Arc<Self>, key: AlarmKey) {
        info!(
            sensor = %key.sensor_path,
            alarm = key.property(),
            target = %self.config.target,
            "recovery countdown expired, starting recovery target"
        );
        self.ctx.recorder.log(
            "monitor",
            format!("{} stable, recovery via {}", key.sensor_path, self.config.target),
        );

        if let Err(e) = self
            .ctx
            .bus
            .call_method(
                services::SYSTEMD,
                paths::SYSTEMD,
                interfaces::SYSTEMD_MANAGER,
                "StartUnit",
                &(self.config.target.as_str(), "replace"),
            )
            .await
        {
            error!(target = %self.config.target, error = %e, "failed to start recovery target");
            return;
        }

        self.timers.lock().await.remove(&key);

        let _ = self.domain.send(DomainEvent::SystemRecoveryTriggered {
            sensor_path: key.sensor_path,
            severity: key.severity,
        });
    }

    /// The configured stable countdown for one alarm, if any.
    fn countdown_for(
        &self,
        sensor_path: &str,
        severity: AlarmSeverity,
        direction: AlarmDirection,
    ) -> Option<Duration> {
        let sensor = self.config.sensor(sensor_path)?;
        let property = severity.property(direction);
        sensor
            .thresholds
            .iter()
            .find(|t| t.alarm == property)
            .map(|t| Duration::from_millis(t.stable_countdown))
    }
}
