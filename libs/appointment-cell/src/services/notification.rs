// libs/appointment-cell/src/services/notification.rs
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use shared_config::SchedulingConfig;
use tracing::{debug, info, warn};

use crate::error::NotificationError;
use crate::models::NotificationEvent;

/// Receives booked/cancelled/rescheduled events after the change committed.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn notify(&self, event: &NotificationEvent) -> Result<(), NotificationError>;
}

/// Writes each event to the log. Used when no webhook is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

#[async_trait]
impl NotificationDispatcher for TracingNotifier {
    async fn notify(&self, event: &NotificationEvent) -> Result<(), NotificationError> {
        info!(
            appointment_id = %event.appointment_id,
            patient_id = %event.patient_id,
            specialist_id = %event.specialist_id,
            old_time = ?event.old_time,
            new_time = %event.new_time,
            "Appointment notification: {:?}", event.event_type
        );
        Ok(())
    }
}

/// POSTs each event as JSON to a configured endpoint.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                warn!("Falling back to default HTTP client for notifications: {}", e);
                Client::new()
            });

        Self { client, url: url.into() }
    }
}

#[async_trait]
impl NotificationDispatcher for WebhookNotifier {
    async fn notify(&self, event: &NotificationEvent) -> Result<(), NotificationError> {
        debug!("Posting {:?} notification for appointment {} to webhook", event.event_type, event.appointment_id);

        let response = self
            .client
            .post(&self.url)
            .json(event)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    NotificationError::Timeout
                } else {
                    NotificationError::Delivery(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(NotificationError::Delivery(format!("webhook responded with {}", status)));
        }

        Ok(())
    }
}

/// Pick the dispatcher the configuration asks for.
pub fn dispatcher_from_config(config: &SchedulingConfig) -> Arc<dyn NotificationDispatcher> {
    match config.notification_webhook_url.as_deref() {
        Some(url) if !url.trim().is_empty() => {
            info!("Appointment notifications will be posted to {}", url);
            Arc::new(WebhookNotifier::new(url.trim(), config.notification_timeout()))
        }
        _ => {
            info!("No notification webhook configured, logging appointment notifications");
            Arc::new(TracingNotifier)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NotificationType;
    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    fn event() -> NotificationEvent {
        NotificationEvent {
            event_type: NotificationType::Cancelled,
            appointment_id: Uuid::new_v4(),
            patient_id: Uuid::new_v4(),
            specialist_id: Uuid::new_v4(),
            old_time: None,
            new_time: Utc.with_ymd_and_hms(2025, 3, 10, 14, 0, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_tracing_notifier_never_fails() {
        assert!(TracingNotifier.notify(&event()).await.is_ok());
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let value = serde_json::to_value(event()).unwrap();
        assert_eq!(value["type"], "cancelled");
        assert!(value["old_time"].is_null());
    }
}
