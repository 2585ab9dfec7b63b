use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use thiserror::Error;

use super::{LeaseEvent, NotificationSink};
use crate::config::Messages;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
}

pub type SendFuture = Pin<Box<dyn Future<Output = Result<(), NotifyError>> + Send + 'static>>;

/// Anything that can receive a text message: a guild member, a plain user,
/// a webhook. The core never needs to tell them apart.
pub trait Notifiable: Send + Sync {
    fn id(&self) -> &str;
    fn send(&self, message: String) -> SendFuture;
}

/// Looks up the recipient for a subject id.
pub trait Directory: Send + Sync {
    fn resolve(&self, subject_id: &str) -> Option<Arc<dyn Notifiable>>;
}

/// Turns lifecycle events into messages for the cursed subject.
pub struct MessageSink<D> {
    directory: D,
    messages: Messages,
}

impl<D: Directory> MessageSink<D> {
    pub fn new(directory: D, messages: Messages) -> Self {
        Self {
            directory,
            messages,
        }
    }

    /// The texts sent for an event, in order.
    pub fn render(&self, event: &LeaseEvent) -> Vec<String> {
        match event {
            LeaseEvent::Cursed { duration_days, .. } => vec![
                self.messages.curse.clone(),
                self.messages
                    .pact
                    .replace("{days}", &duration_days.to_string()),
            ],
            LeaseEvent::Reminder { remaining_days, .. } => vec![self
                .messages
                .reminder
                .replace("{days}", &remaining_days.to_string())],
            LeaseEvent::Expired { .. } => vec![self.messages.eliminate.clone()],
            LeaseEvent::Atoned { .. } => vec![self.messages.atone.clone()],
        }
    }

    fn deliver(&self, event: LeaseEvent) {
        let subject_id = event.subject_id().to_string();
        let Some(target) = self.directory.resolve(&subject_id) else {
            tracing::warn!(subject_id = %subject_id, "no recipient for subject, dropping message");
            return;
        };
        let texts = self.render(&event);
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(subject_id = %subject_id, "no async runtime, dropping message");
            return;
        };
        handle.spawn(async move {
            for text in texts {
                if let Err(e) = target.send(text).await {
                    tracing::warn!(subject_id = target.id(), "failed to send message: {}", e);
                    break;
                }
            }
        });
    }
}

impl<D: Directory> NotificationSink for MessageSink<D> {
    fn on_cursed(&self, subject_id: &str, duration_days: u32) {
        self.deliver(LeaseEvent::Cursed {
            subject_id: subject_id.to_string(),
            duration_days,
        });
    }

    fn on_reminder(&self, subject_id: &str, remaining_days: u32) {
        self.deliver(LeaseEvent::Reminder {
            subject_id: subject_id.to_string(),
            remaining_days,
        });
    }

    fn on_expired(&self, subject_id: &str) {
        self.deliver(LeaseEvent::Expired {
            subject_id: subject_id.to_string(),
        });
    }

    fn on_atoned(&self, subject_id: &str) {
        self.deliver(LeaseEvent::Atoned {
            subject_id: subject_id.to_string(),
        });
    }
}
