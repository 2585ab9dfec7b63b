//! Webhook delivery: stands in for the chat platform by posting each
//! message as JSON to a configured URL.

use std::sync::Arc;

use reqwest::Client;
use serde::Serialize;

use super::{Directory, Notifiable, SendFuture};

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    subject_id: &'a str,
    content: &'a str,
}

/// Resolves every subject to a [`WebhookNotifiable`] on the same URL.
#[derive(Debug, Clone)]
pub struct WebhookDirectory {
    client: Client,
    url: String,
}

impl WebhookDirectory {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            url: url.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Directory for WebhookDirectory {
    fn resolve(&self, subject_id: &str) -> Option<Arc<dyn Notifiable>> {
        Some(Arc::new(WebhookNotifiable {
            subject_id: subject_id.to_string(),
            client: self.client.clone(),
            url: self.url.clone(),
        }))
    }
}

#[derive(Debug, Clone)]
pub struct WebhookNotifiable {
    subject_id: String,
    client: Client,
    url: String,
}

impl Notifiable for WebhookNotifiable {
    fn id(&self) -> &str {
        &self.subject_id
    }

    fn send(&self, message: String) -> SendFuture {
        let client = self.client.clone();
        let url = self.url.clone();
        let subject_id = self.subject_id.clone();
        Box::pin(async move {
            client
                .post(&url)
                .json(&WebhookPayload {
                    subject_id: &subject_id,
                    content: &message,
                })
                .send()
                .await?
                .error_for_status()?;
            tracing::debug!(subject_id = %subject_id, "webhook message delivered");
            Ok(())
        })
    }
}
