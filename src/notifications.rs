//! Webhook notifications for finished runs.

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::NotificationConfig;

/// Notification event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum NotificationEvent {
    /// The run produced a fragment.
    Complete,
    /// The run ended without a usable result.
    Error,
}

/// Where a notification goes, parsed from a config value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum NotificationTarget {
    Webhook(String),
    Disabled,
}

impl NotificationTarget {
    /// Parses `"webhook:<url>"`, a bare http(s) URL, or `"none"`.
    pub fn parse(value: &str) -> Self {
        if let Some(url) = value.strip_prefix("webhook:") {
            if url.is_empty() {
                Self::Disabled
            } else {
                Self::Webhook(url.to_string())
            }
        } else if value.starts_with("http://") || value.starts_with("https://") {
            Self::Webhook(value.to_string())
        } else {
            if value != "none" {
                warn!("Ignoring unsupported notification target '{}'", value);
            }
            Self::Disabled
        }
    }
}

/// Payload POSTed to the webhook.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct NotificationDetails {
    pub event: NotificationEvent,
    pub run_id: Uuid,
    pub project_id: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox_url: Option<String>,
    pub timestamp: String,
}

impl NotificationDetails {
    pub fn complete(run_id: Uuid, project_id: &str, title: &str, sandbox_url: &str) -> Self {
        Self {
            event: NotificationEvent::Complete,
            run_id,
            project_id: project_id.to_string(),
            message: format!("Generated \"{title}\""),
            sandbox_url: Some(sandbox_url.to_string()),
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    pub fn error(run_id: Uuid, project_id: &str, message: &str) -> Self {
        Self {
            event: NotificationEvent::Error,
            run_id,
            project_id: project_id.to_string(),
            message: message.to_string(),
            sandbox_url: None,
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

/// Sends notifications based on configuration.
pub(crate) struct Notifier {
    config: NotificationConfig,
    client: reqwest::Client,
}

impl Notifier {
    pub fn new(config: NotificationConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn target(&self, event: NotificationEvent) -> NotificationTarget {
        let value = match event {
            NotificationEvent::Complete => self.config.on_complete.as_deref(),
            NotificationEvent::Error => self.config.on_error.as_deref(),
        };
        value.map_or(NotificationTarget::Disabled, NotificationTarget::parse)
    }

    /// Sends the notification for `details.event`.
    ///
    /// Delivery failures are logged and never fail the run.
    pub async fn notify(&self, details: &NotificationDetails) {
        if let NotificationTarget::Webhook(url) = self.target(details.event) {
            if let Err(e) = self.send_webhook(&url, details).await {
                warn!("Failed to send {:?} webhook: {:#}", details.event, e);
            }
        }
    }

    /// POST with retry on 5xx, 429 and network errors (1s, 2s, 4s backoff).
    #[allow(tail_expr_drop_order)]
    async fn send_webhook(&self, url: &str, details: &NotificationDetails) -> Result<()> {
        debug!("Sending webhook to {}", url);

        let max_attempts = 3;
        let mut last_error = None;

        for attempt in 0..max_attempts {
            if attempt > 0 {
                let delay_secs = 1u64 << attempt;
                debug!("Webhook retry {} after {}s", attempt + 1, delay_secs);
                tokio::time::sleep(std::time::Duration::from_secs(delay_secs)).await;
            }

            match self.client.post(url).json(details).send().await {
                Ok(response) if response.status().is_success() => {
                    debug!("Webhook delivered");
                    return Ok(());
                }
                Ok(response) => {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    if status.is_server_error() || status.as_u16() == 429 {
                        last_error = Some(format!("Webhook returned {status}: {body}"));
                        continue;
                    }
                    anyhow::bail!("Webhook returned error status {status}: {body}");
                }
                Err(e) => last_error = Some(e.to_string()),
            }
        }

        anyhow::bail!(
            "Webhook failed after {max_attempts} attempts: {}",
            last_error.unwrap_or_else(|| "unknown error".to_string())
        )
    }
}
