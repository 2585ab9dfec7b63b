//! Lifecycle notifications.
//!
//! The registry reports every transition to a [`NotificationSink`]. Sinks are
//! fire-and-forget: they never call back into the registry and a failing
//! sink never affects lease state.

mod message;
mod webhook;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

pub use message::*;
pub use webhook::*;

/// Receives lease lifecycle events.
pub trait NotificationSink: Send + Sync {
    fn on_cursed(&self, subject_id: &str, duration_days: u32);
    fn on_reminder(&self, subject_id: &str, remaining_days: u32);
    fn on_expired(&self, subject_id: &str);
    fn on_atoned(&self, subject_id: &str);
}

/// A lifecycle event as a value, for buses and webhooks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LeaseEvent {
    Cursed { subject_id: String, duration_days: u32 },
    Reminder { subject_id: String, remaining_days: u32 },
    Expired { subject_id: String },
    Atoned { subject_id: String },
}

impl LeaseEvent {
    pub fn subject_id(&self) -> &str {
        match self {
            Self::Cursed { subject_id, .. }
            | Self::Reminder { subject_id, .. }
            | Self::Expired { subject_id }
            | Self::Atoned { subject_id } => subject_id,
        }
    }
}

/// Broadcast channel of lease events owned by whoever builds the registry.
///
/// Collaborators get their own receiver through [`subscribe`](Self::subscribe).
/// Events sent while nobody listens are dropped.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<LeaseEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LeaseEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: LeaseEvent) {
        // No receivers is not an error for a fire-and-forget bus.
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl NotificationSink for EventBus {
    fn on_cursed(&self, subject_id: &str, duration_days: u32) {
        self.publish(LeaseEvent::Cursed {
            subject_id: subject_id.to_string(),
            duration_days,
        });
    }

    fn on_reminder(&self, subject_id: &str, remaining_days: u32) {
        self.publish(LeaseEvent::Reminder {
            subject_id: subject_id.to_string(),
            remaining_days,
        });
    }

    fn on_expired(&self, subject_id: &str) {
        self.publish(LeaseEvent::Expired {
            subject_id: subject_id.to_string(),
        });
    }

    fn on_atoned(&self, subject_id: &str) {
        self.publish(LeaseEvent::Atoned {
            subject_id: subject_id.to_string(),
        });
    }
}

/// Logs every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn on_cursed(&self, subject_id: &str, duration_days: u32) {
        tracing::info!(subject_id, duration_days, "subject cursed");
    }

    fn on_reminder(&self, subject_id: &str, remaining_days: u32) {
        tracing::info!(subject_id, remaining_days, "curse reminder");
    }

    fn on_expired(&self, subject_id: &str) {
        tracing::info!(subject_id, "curse expired");
    }

    fn on_atoned(&self, subject_id: &str) {
        tracing::info!(subject_id, "curse atoned");
    }
}

/// Forwards each event to every inner sink in order.
#[derive(Clone, Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn NotificationSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl NotificationSink for FanoutSink {
    fn on_cursed(&self, subject_id: &str, duration_days: u32) {
        for sink in &self.sinks {
            sink.on_cursed(subject_id, duration_days);
        }
    }

    fn on_reminder(&self, subject_id: &str, remaining_days: u32) {
        for sink in &self.sinks {
            sink.on_reminder(subject_id, remaining_days);
        }
    }

    fn on_expired(&self, subject_id: &str) {
        for sink in &self.sinks {
            sink.on_expired(subject_id);
        }
    }

    fn on_atoned(&self, subject_id: &str) {
        for sink in &self.sinks {
            sink.on_atoned(subject_id);
        }
    }
}
