//! Fan zones
//!
//! A zone is a set of fans driven to one target, bounded by a floor and a
//! ceiling. Events feed a property cache from bus signals and timers; their
//! actions move the floor, the ceiling, and the target through the
//! [`Targeting`] state machine. Targets reach the hardware only while every
//! group's active-allow flag agrees, and never below a held lock.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use zbus::zvariant::OwnedValue;

use crate::bus::{self, rules};
use crate::config::{GroupMember, PcieCardMetadata, SignalKind, ZoneConfig};
use crate::context::Context;
use crate::control::action::Action;
use crate::control::event::Event;
use crate::control::fan::ZoneFan;
use crate::control::precondition::{properties_match, Precondition};
use crate::control::targeting::{Push, Targeting};
use crate::timer::{OneShotTimer, PeriodicTimer};
use crate::types::{PropertyKey, PropertyValue};

#[derive(Debug, Clone)]
struct ServiceState {
    name: String,
    has_owner: bool,
}

struct ZoneState {
    targeting: Targeting,
    cache: HashMap<PropertyKey, PropertyValue>,
    /// Per-run modifier overlay consulted before the cache
    overlay: HashMap<PropertyKey, PropertyValue>,
    services: HashMap<(String, String), ServiceState>,
    inc_timer: OneShotTimer,
    dec_timer: PeriodicTimer,
    event_tasks: HashMap<usize, Vec<JoinHandle<()>>>,
    precond_tasks: Vec<JoinHandle<()>>,
    initialized: HashSet<usize>,
}

pub struct Zone {
    ctx: Context,
    num: u32,
    inc_delay: Duration,
    dec_interval: Duration,
    def_floor: u64,
    fans: Vec<ZoneFan>,
    events: Vec<Event>,
    preconditions: Vec<Precondition>,
    state: Mutex<ZoneState>,
}

impl Zone {
    pub fn new(
        ctx: Context,
        config: &ZoneConfig,
        cards: Option<&Arc<PcieCardMetadata>>,
    ) -> Arc<Self> {
        let def_ceiling = config.default_ceiling.unwrap_or(config.full_speed);

        let mut events = Vec::new();
        let mut preconditions = Vec::new();
        let mut group_id = 0usize;

        for event_config in &config.events {
            events.push(Event::from_config(
                event_config,
                events.len(),
                group_id,
                false,
                cards,
            ));
            group_id += 1;
        }

        for precond_config in &config.preconditions {
            let mut event_indices = Vec::new();
            let precond_group = group_id;
            group_id += 1;

            for event_config in &precond_config.events {
                event_indices.push(events.len());
                events.push(Event::from_config(
                    event_config,
                    events.len(),
                    group_id,
                    true,
                    cards,
                ));
                group_id += 1;
            }

            preconditions.push(Precondition {
                name: precond_config.name.clone(),
                group_id: precond_group,
                conditions: precond_config.conditions.clone(),
                event_indices,
            });
        }

        Arc::new(Self {
            ctx,
            num: config.zone,
            inc_delay: Duration::from_secs(config.increase_delay),
            dec_interval: Duration::from_secs(config.decrease_interval),
            def_floor: config.default_floor,
            fans: config.fans.iter().map(ZoneFan::new).collect(),
            events,
            preconditions,
            state: Mutex::new(ZoneState {
                targeting: Targeting::new(config.full_speed, config.default_floor, def_ceiling),
                cache: HashMap::new(),
                overlay: HashMap::new(),
                services: HashMap::new(),
                inc_timer: OneShotTimer::new(),
                dec_timer: PeriodicTimer::new(),
                event_tasks: HashMap::new(),
                precond_tasks: Vec::new(),
                initialized: HashSet::new(),
            }),
        })
    }

    pub fn ctx(&self) -> &Context {
        &self.ctx
    }

    pub fn number(&self) -> u32 {
        self.num
    }

    pub fn default_floor(&self) -> u64 {
        self.def_floor
    }

    /// Bring the zone up: snapshot properties, subscribe signals, run init
    /// triggers, arm timers, and evaluate preconditions.
    pub async fn init(self: &Arc<Self>) {
        info!(zone = self.num, "initializing fan zone");

        // Everything starts from a known-safe speed.
        self.set_full_speed().await;

        let ungated: Vec<usize> = self
            .events
            .iter()
            .filter(|e| !e.gated)
            .map(|e| e.index)
            .collect();
        for index in ungated {
            self.init_event(index).await;
        }

        {
            let zone = self.clone();
            let mut st = self.state.lock().await;
            st.dec_timer.restart(self.dec_interval, move || {
                let zone = zone.clone();
                async move { zone.dec_timer_expired().await }
            });
        }

        self.init_preconditions().await;
    }

    pub async fn shutdown(&self) {
        let mut st = self.state.lock().await;
        for (_, tasks) in st.event_tasks.drain() {
            for task in tasks {
                task.abort();
            }
        }
        for task in st.precond_tasks.drain(..) {
            task.abort();
        }
        st.inc_timer.disarm();
        st.dec_timer.disarm();
    }

    // ========================================================================
    // Speed control
    // ========================================================================

    async fn apply_push(&self, push: Push) {
        match push {
            Push::None => {}
            Push::Target { value, locked } => self.push_target(value, locked, false).await,
            Push::Lock(value) => self.push_target(value, true, true).await,
            Push::Unconditional(value) => self.push_target(value, false, true).await,
        }
    }

    async fn push_target(&self, value: u64, locked: bool, lock_write: bool) {
        for fan in &self.fans {
            fan.set_target(&self.ctx, value, locked, lock_write).await;
        }
    }

    pub async fn set_speed(self: &Arc<Self>, raw: u64) {
        let push = self.state.lock().await.targeting.set_speed(raw);
        self.apply_push(push).await;
    }

    pub async fn set_full_speed(self: &Arc<Self>) {
        let push = self.state.lock().await.targeting.set_full_speed();
        self.apply_push(push).await;
    }

    pub async fn set_active_allow(self: &Arc<Self>, group: usize, allow: bool) {
        let push = {
            let mut st = self.state.lock().await;
            let was = st.targeting.all_active();
            let push = st.targeting.set_active_allow(group, allow);
            if st.targeting.all_active() != was {
                debug!(
                    zone = self.num,
                    active = st.targeting.all_active(),
                    "automatic control gate changed"
                );
            }
            push
        };
        self.apply_push(push).await;
    }

    pub async fn lock_target(self: &Arc<Self>, value: u64) {
        let push = self.state.lock().await.targeting.lock(value);
        self.apply_push(push).await;
    }

    pub async fn unlock_target(self: &Arc<Self>, value: u64) {
        let push = {
            let mut st = self.state.lock().await;
            match st.targeting.unlock(value) {
                Some(push) => push,
                None => {
                    warn!(zone = self.num, value, "unlock without matching lock");
                    Push::None
                }
            }
        };
        self.apply_push(push).await;
    }

    pub async fn set_floor(self: &Arc<Self>, value: u64) {
        let push = self.state.lock().await.targeting.set_floor(value);
        self.apply_push(push).await;
    }

    pub async fn set_ceiling(self: &Arc<Self>, value: u64) {
        let push = self.state.lock().await.targeting.set_ceiling(value);
        self.apply_push(push).await;
    }

    pub async fn swap_ceiling_mean(&self, mean: f64) -> Option<f64> {
        self.state.lock().await.targeting.swap_ceiling_mean(mean)
    }

    pub async fn set_request_base(&self, base: u64) {
        self.state.lock().await.targeting.request_base = base;
    }

    /// Fold a new increase request into the pending delta. The increase
    /// delay timer batches requests; expiry applies the running max.
    pub async fn request_speed_increase(self: &Arc<Self>, delta: u64) {
        if delta == 0 {
            return;
        }
        let mut st = self.state.lock().await;
        st.targeting.request_increase(delta);
        if !st.inc_timer.is_armed() {
            let zone = self.clone();
            st.inc_timer
                .restart_once(self.inc_delay, move || async move {
                    zone.inc_timer_expired().await;
                });
        }
    }

    /// Fold a new decrease request into the pending delta, applied on the
    /// next decrease-interval tick.
    pub async fn request_speed_decrease(&self, delta: u64) {
        self.state.lock().await.targeting.request_decrease(delta);
    }

    async fn inc_timer_expired(self: &Arc<Self>) {
        let request = self.state.lock().await.targeting.take_increase();
        if let Some(raw) = request {
            debug!(zone = self.num, raw, "applying batched speed increase");
            self.set_speed(raw).await;
        }
    }

    async fn dec_timer_expired(self: &Arc<Self>) {
        let request = {
            let mut st = self.state.lock().await;
            let increase_armed = st.inc_timer.is_armed();
            st.targeting.take_decrease(increase_armed)
        };
        if let Some(raw) = request {
            debug!(zone = self.num, raw, "applying batched speed decrease");
            self.set_speed(raw).await;
        }
    }

    // ========================================================================
    // Property cache and group views
    // ========================================================================

    pub async fn cached_value(&self, member: &GroupMember) -> Option<PropertyValue> {
        let st = self.state.lock().await;
        lookup(&st, &member_key(member))
    }

    pub async fn set_cached_value(&self, key: PropertyKey, value: PropertyValue) {
        self.state.lock().await.cache.insert(key, value);
    }

    /// Numeric group values, truncated to integers for the delta math.
    pub async fn group_values(&self, event: &Event) -> Vec<i64> {
        let st = self.state.lock().await;
        event
            .group
            .iter()
            .filter_map(|m| lookup(&st, &member_key(m)).and_then(|v| v.as_i64()))
            .collect()
    }

    /// Mean over members holding numeric values; `None` when none do.
    pub async fn group_average(&self, event: &Event) -> Option<f64> {
        let st = self.state.lock().await;
        let values: Vec<f64> = event
            .group
            .iter()
            .filter_map(|m| lookup(&st, &member_key(m)).and_then(|v| v.numeric()))
            .collect();
        if values.is_empty() {
            return None;
        }
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }

    /// How many members currently hold exactly `state` (missing counts as
    /// not matching).
    pub async fn group_count_matching(&self, event: &Event, state: &PropertyValue) -> usize {
        let st = self.state.lock().await;
        event
            .group
            .iter()
            .filter(|m| {
                lookup(&st, &member_key(m))
                    .map(|v| v.matches(state))
                    .unwrap_or(false)
            })
            .count()
    }

    /// Subtract `amount` from each member's numeric value into the per-run
    /// overlay, preserving the numeric flavor.
    pub async fn apply_group_modifier(&self, event: &Event, amount: f64) {
        let mut st = self.state.lock().await;
        for member in &event.group {
            let key = member_key(member);
            let adjusted = match st.cache.get(&key) {
                Some(PropertyValue::Int(v)) => Some(PropertyValue::Int(v - amount as i64)),
                Some(PropertyValue::UInt(v)) => {
                    Some(PropertyValue::Int(*v as i64 - amount as i64))
                }
                Some(PropertyValue::Double(v)) => Some(PropertyValue::Double(v - amount)),
                _ => None,
            };
            if let Some(value) = adjusted {
                st.overlay.insert(key, value);
            }
        }
    }

    /// Refresh the service-owner map for a group via the object mapper.
    pub async fn update_services(&self, event: &Event) {
        let sources: HashSet<(String, String)> = event
            .group
            .iter()
            .map(|m| (m.path.clone(), m.interface.clone()))
            .collect();

        for (path, interface) in sources {
            let entry = match self.ctx.bus.get_service(&path, &interface).await {
                Ok(name) => {
                    let has_owner = self.ctx.bus.name_has_owner(&name).await.unwrap_or(false);
                    ServiceState { name, has_owner }
                }
                Err(_) => ServiceState {
                    name: String::new(),
                    has_owner: false,
                },
            };
            self.state
                .lock()
                .await
                .services
                .insert((path, interface), entry);
        }
    }

    /// True when any of the group's property sources has no bus owner.
    pub async fn group_missing_owner(&self, event: &Event) -> bool {
        let st = self.state.lock().await;
        event.group.iter().any(|m| {
            st.services
                .get(&(m.path.clone(), m.interface.clone()))
                .map(|s| !s.has_owner)
                .unwrap_or(true)
        })
    }

    pub async fn record(&self, message: &str) {
        self.ctx
            .recorder
            .log("control", format!("zone{}: {}", self.num, message));
    }

    // ========================================================================
    // Events
    // ========================================================================

    /// Snapshot group properties, subscribe the event's signals, arm its
    /// timer, and run its actions once.
    pub async fn init_event(self: &Arc<Self>, index: usize) {
        let Some(event) = self.events.get(index) else {
            return;
        };

        // Best-effort snapshot; a property missing from the bus simply
        // stays out of the cache.
        for member in &event.group {
            match self
                .ctx
                .bus
                .get_property::<OwnedValue>(&member.path, &member.interface, &member.property)
                .await
            {
                Ok(raw) => {
                    if let Some(value) = PropertyValue::from_variant(&raw) {
                        self.state
                            .lock()
                            .await
                            .cache
                            .insert(member_key(member), value);
                    }
                }
                Err(e) => debug!(
                    zone = self.num,
                    event = %event.name,
                    property = %member.property,
                    error = %e,
                    "initial property snapshot failed"
                ),
            }
        }

        if event.tracks_services() {
            self.update_services(event).await;
        }

        let mut tasks = Vec::new();

        for kind in &event.signals {
            match kind {
                SignalKind::PropertiesChanged => {
                    let sources: HashSet<(String, String)> = event
                        .group
                        .iter()
                        .map(|m| (m.path.clone(), m.interface.clone()))
                        .collect();
                    for (path, interface) in sources {
                        let rule = rules::properties_changed(&path, &interface);
                        if let Some(task) = self
                            .spawn_signal_task(&rule, index, SignalKind::PropertiesChanged)
                            .await
                        {
                            tasks.push(task);
                        }
                    }
                }
                SignalKind::InterfacesAdded => {
                    let paths: HashSet<String> =
                        event.group.iter().map(|m| m.path.clone()).collect();
                    for path in paths {
                        let rule = rules::interfaces_added(&path);
                        if let Some(task) = self
                            .spawn_signal_task(&rule, index, SignalKind::InterfacesAdded)
                            .await
                        {
                            tasks.push(task);
                        }
                    }
                }
                SignalKind::NameOwnerChanged => {
                    let names: HashSet<String> = {
                        let st = self.state.lock().await;
                        event
                            .group
                            .iter()
                            .filter_map(|m| {
                                st.services
                                    .get(&(m.path.clone(), m.interface.clone()))
                                    .filter(|s| !s.name.is_empty())
                                    .map(|s| s.name.clone())
                            })
                            .collect()
                    };
                    for name in names {
                        let rule = rules::name_owner_changed(&name);
                        if let Some(task) = self
                            .spawn_signal_task(&rule, index, SignalKind::NameOwnerChanged)
                            .await
                        {
                            tasks.push(task);
                        }
                    }
                }
            }
        }

        if let Some(timer) = &event.timer {
            let zone = self.clone();
            let interval = Duration::from_millis(timer.interval_ms);
            let repeating = timer.repeating;
            tasks.push(tokio::spawn(async move {
                if repeating {
                    let mut ticker = tokio::time::interval(interval);
                    ticker.tick().await;
                    loop {
                        ticker.tick().await;
                        zone.run_event_actions(index).await;
                    }
                } else {
                    tokio::time::sleep(interval).await;
                    zone.run_event_actions(index).await;
                }
            }));
        }

        {
            let mut st = self.state.lock().await;
            st.event_tasks.insert(index, tasks);
            st.initialized.insert(index);
        }

        self.run_event_actions(index).await;
    }

    /// Tear an event down: unsubscribe its signals and disarm its timer.
    /// The property cache keeps its last values.
    pub async fn remove_event(&self, index: usize) {
        let mut st = self.state.lock().await;
        if let Some(tasks) = st.event_tasks.remove(&index) {
            for task in tasks {
                task.abort();
            }
        }
        st.initialized.remove(&index);
    }

    async fn spawn_signal_task(
        self: &Arc<Self>,
        rule: &str,
        event_index: usize,
        kind: SignalKind,
    ) -> Option<JoinHandle<()>> {
        match self.ctx.bus.subscribe(rule).await {
            Ok(mut stream) => {
                let zone = self.clone();
                Some(tokio::spawn(async move {
                    while let Some(Ok(msg)) = stream.next().await {
                        zone.handle_signal(event_index, kind, &msg).await;
                    }
                }))
            }
            Err(e) => {
                error!(zone = self.num, rule, error = %e, "signal subscription failed");
                None
            }
        }
    }

    /// Refresh the cache from a signal payload, then run the event's
    /// actions.
    pub async fn handle_signal(
        self: &Arc<Self>,
        event_index: usize,
        kind: SignalKind,
        msg: &zbus::Message,
    ) {
        let Some(event) = self.events.get(event_index) else {
            return;
        };

        match kind {
            SignalKind::PropertiesChanged => {
                let Ok(parsed) = bus::read_properties_changed(msg) else {
                    return;
                };
                let mut st = self.state.lock().await;
                for member in &event.group {
                    if member.path == parsed.path && member.interface == parsed.interface {
                        if let Some(value) = parsed
                            .changed
                            .get(&member.property)
                            .and_then(PropertyValue::from_variant)
                        {
                            st.cache.insert(member_key(member), value);
                        }
                    }
                }
            }
            SignalKind::InterfacesAdded => {
                let Ok(parsed) = bus::read_interfaces_added(msg) else {
                    return;
                };
                let mut st = self.state.lock().await;
                for member in &event.group {
                    if member.path != parsed.path {
                        continue;
                    }
                    if let Some(value) = parsed
                        .interfaces
                        .get(&member.interface)
                        .and_then(|props| props.get(&member.property))
                        .and_then(PropertyValue::from_variant)
                    {
                        st.cache.insert(member_key(member), value);
                    }
                }
            }
            SignalKind::NameOwnerChanged => {
                let Ok((name, _old, new_owner)) = bus::read_name_owner_changed(msg) else {
                    return;
                };
                let mut st = self.state.lock().await;
                for service in st.services.values_mut() {
                    if service.name == name {
                        service.has_owner = !new_owner.is_empty();
                    }
                }
            }
        }

        self.run_event_actions(event_index).await;
    }

    /// Run an event's actions in configured order. Fan writes happen as
    /// the actions make them, after the cache update that triggered them.
    pub async fn run_event_actions(self: &Arc<Self>, index: usize) {
        {
            let mut st = self.state.lock().await;
            if !st.initialized.contains(&index) {
                return;
            }
            st.overlay.clear();
        }

        let Some(event) = self.events.get(index) else {
            return;
        };
        for action in &event.actions {
            action.run(self, event).await;
        }
    }

    /// Settle-timer callback target for PCIe floor scans.
    pub async fn run_pcie_floor_scan(self: &Arc<Self>, event_index: usize) {
        let Some(event) = self.events.get(event_index) else {
            return;
        };
        for action in &event.actions {
            if let Action::PcieCardFloors(pcie) = action {
                pcie.execute(self, event).await;
            }
        }
    }

    // ========================================================================
    // Preconditions
    // ========================================================================

    async fn init_preconditions(self: &Arc<Self>) {
        for (pindex, precond) in self.preconditions.iter().enumerate() {
            for condition in &precond.conditions {
                match self
                    .ctx
                    .bus
                    .get_property::<OwnedValue>(
                        &condition.path,
                        &condition.interface,
                        &condition.property,
                    )
                    .await
                {
                    Ok(raw) => {
                        if let Some(value) = PropertyValue::from_variant(&raw) {
                            self.state
                                .lock()
                                .await
                                .cache
                                .insert(condition.key(), value);
                        }
                    }
                    Err(e) => debug!(
                        zone = self.num,
                        precondition = %precond.name,
                        error = %e,
                        "initial precondition snapshot failed"
                    ),
                }
            }

            let sources: HashSet<(String, String)> = precond
                .conditions
                .iter()
                .map(|c| (c.path.clone(), c.interface.clone()))
                .collect();

            for (path, interface) in sources {
                let rule = rules::properties_changed(&path, &interface);
                match self.ctx.bus.subscribe(&rule).await {
                    Ok(mut stream) => {
                        let zone = self.clone();
                        let task = tokio::spawn(async move {
                            while let Some(Ok(msg)) = stream.next().await {
                                zone.handle_precondition_signal(pindex, &msg).await;
                            }
                        });
                        self.state.lock().await.precond_tasks.push(task);
                    }
                    Err(e) => error!(
                        zone = self.num,
                        error = %e,
                        "precondition subscription failed"
                    ),
                }
            }

            self.evaluate_precondition(pindex).await;
        }
    }

    async fn handle_precondition_signal(self: &Arc<Self>, pindex: usize, msg: &zbus::Message) {
        let Some(precond) = self.preconditions.get(pindex) else {
            return;
        };
        let Ok(parsed) = bus::read_properties_changed(msg) else {
            return;
        };

        {
            let mut st = self.state.lock().await;
            for condition in &precond.conditions {
                if condition.path == parsed.path && condition.interface == parsed.interface {
                    if let Some(value) = parsed
                        .changed
                        .get(&condition.property)
                        .and_then(PropertyValue::from_variant)
                    {
                        st.cache.insert(condition.key(), value);
                    }
                }
            }
        }

        self.evaluate_precondition(pindex).await;
    }

    /// Gate the contained events on the condition conjunction. Losing the
    /// precondition tears the events down and forces full speed.
    async fn evaluate_precondition(self: &Arc<Self>, pindex: usize) {
        let Some(precond) = self.preconditions.get(pindex) else {
            return;
        };

        let met = {
            let st = self.state.lock().await;
            properties_match(&precond.conditions, |key| lookup(&st, key))
        };

        if met {
            let pending: Vec<usize> = {
                let st = self.state.lock().await;
                precond
                    .event_indices
                    .iter()
                    .copied()
                    .filter(|i| !st.initialized.contains(i))
                    .collect()
            };
            for index in pending {
                self.init_event(index).await;
            }
        } else {
            debug!(
                zone = self.num,
                precondition = %precond.name,
                "precondition lost, removing events and forcing full speed"
            );
            for index in &precond.event_indices {
                self.remove_event(*index).await;
            }
            self.set_full_speed().await;
        }

        self.set_active_allow(precond.group_id, met).await;
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    pub async fn current_target(&self) -> u64 {
        self.state.lock().await.targeting.target
    }

    pub async fn current_floor(&self) -> u64 {
        self.state.lock().await.targeting.floor
    }

    pub async fn current_ceiling(&self) -> u64 {
        self.state.lock().await.targeting.ceiling
    }

    pub async fn snapshot(&self) -> serde_json::Value {
        let mut fans = Vec::new();
        for fan in &self.fans {
            fans.push(serde_json::json!({
                "name": fan.name,
                "target": fan.cached_target().await,
            }));
        }

        let st = self.state.lock().await;
        serde_json::json!({
            "zone": self.num,
            "floor": st.targeting.floor,
            "ceiling": st.targeting.ceiling,
            "target": st.targeting.target,
            "locks": st.targeting.locks(),
            "all_active": st.targeting.all_active(),
            "active": st
                .targeting
                .active_groups()
                .iter()
                .map(|(group, allow)| serde_json::json!({ "group": group, "allow": allow }))
                .collect::<Vec<_>>(),
            "fans": fans,
        })
    }
}

fn member_key(member: &GroupMember) -> PropertyKey {
    PropertyKey::new(&member.path, &member.interface, &member.property)
}

fn lookup(st: &ZoneState, key: &PropertyKey) -> Option<PropertyValue> {
    st.overlay
        .get(key)
        .cloned()
        .or_else(|| st.cache.get(key).cloned())
}
