//! Monitor domain events
//!
//! Protection and recovery decouple through a broadcast channel: the
//! shutdown monitor announces that it fired the protective target, the
//! recovery monitor reacts by watching the offending sensor, and announces
//! recovery in turn so the watch can be torn down.

use tokio::sync::broadcast;

use crate::monitor::alarm::AlarmSeverity;

#[derive(Debug, Clone)]
pub enum DomainEvent {
    SystemProtectionTriggered {
        sensor_path: String,
    },
    SystemRecoveryTriggered {
        sensor_path: String,
        severity: AlarmSeverity,
    },
}

pub type DomainEventSender = broadcast::Sender<DomainEvent>;
pub type DomainEventReceiver = broadcast::Receiver<DomainEvent>;

pub fn channel() -> (DomainEventSender, DomainEventReceiver) {
    broadcast::channel(16)
}
