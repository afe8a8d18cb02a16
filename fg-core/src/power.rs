//! Chassis power-state tracking
//!
//! A process-wide tracker observes the power-good signal, caches the current
//! state, and fans change notifications out to named subscribers. Presence
//! and shutdown monitoring both key off it without duplicating bus
//! subscriptions.
//!
//! Two hardware conventions exist for "power is on": a legacy `pgood`
//! integer property, and the host-state enumeration where on means
//! `Running`. Both read the current state best-effort at construction
//! (treating a failed read as "power off", since the source service may not
//! have started yet) and watch both `PropertiesChanged` and
//! `InterfacesAdded` so a late-starting source is picked up.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::{self, rules, BusFacade};
use crate::constants::{interfaces, paths};
use crate::types::PropertyValue;

/// Host-state enumeration value meaning the host is up.
const HOST_STATE_RUNNING: &str = "xyz.openbmc_project.State.Host.HostState.Running";

pub type BoxFut = Pin<Box<dyn Future<Output = ()> + Send>>;

/// A named subscriber callback, invoked with the new state on transitions.
pub type PowerChangeFn = Arc<dyn Fn(bool) -> BoxFut + Send + Sync>;

/// Which hardware signal defines "power on".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerSource {
    /// Legacy `pgood` integer property
    PGood,
    /// Host state enumeration, on ⇔ Running
    HostState,
}

impl PowerSource {
    fn path(&self) -> &'static str {
        match self {
            PowerSource::PGood => paths::PGOOD,
            PowerSource::HostState => paths::HOST_STATE,
        }
    }

    fn interface(&self) -> &'static str {
        match self {
            PowerSource::PGood => interfaces::PGOOD,
            PowerSource::HostState => interfaces::HOST_STATE,
        }
    }

    fn property(&self) -> &'static str {
        match self {
            PowerSource::PGood => "pgood",
            PowerSource::HostState => "CurrentHostState",
        }
    }

    fn is_on(&self, value: &PropertyValue) -> bool {
        match self {
            PowerSource::PGood => value.numeric().map(|v| v != 0.0).unwrap_or(false),
            PowerSource::HostState => value.as_str() == Some(HOST_STATE_RUNNING),
        }
    }
}

/// Process-wide power state with transition callbacks.
pub struct PowerState {
    bus: BusFacade,
    source: PowerSource,
    powered: Mutex<bool>,
    callbacks: Mutex<Vec<(String, PowerChangeFn)>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PowerState {
    /// Build the tracker, read the initial state best-effort, and start
    /// watching for changes.
    pub async fn new(bus: BusFacade, source: PowerSource) -> Arc<Self> {
        let initial = match bus
            .get_property::<zbus::zvariant::OwnedValue>(
                source.path(),
                source.interface(),
                source.property(),
            )
            .await
        {
            Ok(value) => PropertyValue::from_variant(&value)
                .map(|v| source.is_on(&v))
                .unwrap_or(false),
            Err(e) => {
                // Source service not up yet; treat as powered off until the
                // InterfacesAdded watch sees it.
                debug!(error = %e, "initial power state read failed, assuming off");
                false
            }
        };

        info!(source = ?source, powered = initial, "power state tracker started");

        let state = Arc::new(Self {
            bus,
            source,
            powered: Mutex::new(initial),
            callbacks: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
        });

        state.clone().spawn_watches().await;
        state
    }

    /// Current cached power state.
    pub async fn is_power_on(&self) -> bool {
        *self.powered.lock().await
    }

    /// Register a transition callback under `name`. Callbacks run in
    /// subscription order.
    pub async fn add_callback(&self, name: impl Into<String>, f: PowerChangeFn) {
        self.callbacks.lock().await.push((name.into(), f));
    }

    /// Remove a callback by name. Unknown names are ignored.
    pub async fn remove_callback(&self, name: &str) {
        self.callbacks.lock().await.retain(|(n, _)| n != name);
    }

    /// Stop the bus watches.
    pub async fn shutdown(&self) {
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
    }

    async fn spawn_watches(self: Arc<Self>) {
        let props_rule = rules::properties_changed(self.source.path(), self.source.interface());
        let added_rule = rules::interfaces_added(self.source.path());

        let mut tasks = Vec::new();

        match self.bus.subscribe(&props_rule).await {
            Ok(mut stream) => {
                let state = self.clone();
                tasks.push(tokio::spawn(async move {
                    while let Some(Ok(msg)) = stream.next().await {
                        state.handle_properties_changed(&msg).await;
                    }
                }));
            }
            Err(e) => warn!(error = %e, "power state PropertiesChanged subscription failed"),
        }

        match self.bus.subscribe(&added_rule).await {
            Ok(mut stream) => {
                let state = self.clone();
                tasks.push(tokio::spawn(async move {
                    while let Some(Ok(msg)) = stream.next().await {
                        state.handle_interfaces_added(&msg).await;
                    }
                }));
            }
            Err(e) => warn!(error = %e, "power state InterfacesAdded subscription failed"),
        }

        *self.tasks.lock().await = tasks;
    }

    async fn handle_properties_changed(&self, msg: &zbus::Message) {
        let parsed = match bus::read_properties_changed(msg) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "unreadable power PropertiesChanged signal");
                return;
            }
        };

        if let Some(value) = parsed.changed.get(self.source.property()) {
            if let Some(v) = PropertyValue::from_variant(value) {
                self.set_power_state(self.source.is_on(&v)).await;
            }
        }
    }

    async fn handle_interfaces_added(&self, msg: &zbus::Message) {
        let parsed = match bus::read_interfaces_added(msg) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "unreadable power InterfacesAdded signal");
                return;
            }
        };

        if parsed.path != self.source.path() {
            return;
        }

        if let Some(props) = parsed.interfaces.get(self.source.interface()) {
            if let Some(value) = props.get(self.source.property()) {
                if let Some(v) = PropertyValue::from_variant(value) {
                    self.set_power_state(self.source.is_on(&v)).await;
                }
            }
        }
    }

    /// Update the cached state, invoking callbacks only on transition.
    async fn set_power_state(&self, on: bool) {
        {
            let mut powered = self.powered.lock().await;
            if *powered == on {
                return;
            }
            *powered = on;
        }

        info!(powered = on, "chassis power state changed");

        // Snapshot the callback list so a callback can add or remove
        // subscribers without deadlocking.
        let callbacks: Vec<PowerChangeFn> = self
            .callbacks
            .lock()
            .await
            .iter()
            .map(|(_, f)| f.clone())
            .collect();

        for callback in callbacks {
            callback(on).await;
        }
    }
}

/// Adapt an async closure into a [`PowerChangeFn`].
pub fn power_callback<F, Fut>(f: F) -> PowerChangeFn
where
    F: Fn(bool) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |on| Box::pin(f(on)) as BoxFut)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_predicates() {
        let s = PowerSource::PGood;
        assert!(s.is_on(&PropertyValue::Int(1)));
        assert!(!s.is_on(&PropertyValue::Int(0)));
        assert!(!s.is_on(&PropertyValue::Str("1".into())));

        let s = PowerSource::HostState;
        assert!(s.is_on(&PropertyValue::Str(HOST_STATE_RUNNING.into())));
        assert!(!s.is_on(&PropertyValue::Str(
            "xyz.openbmc_project.State.Host.HostState.Off".into()
        )));
    }
}
