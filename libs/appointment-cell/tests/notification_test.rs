use std::time::Duration;

use assert_matches::assert_matches;
use chrono::{TimeZone, Utc};
use serde_json::json;
use uuid::Uuid;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use appointment_cell::error::NotificationError;
use appointment_cell::models::{NotificationEvent, NotificationType};
use appointment_cell::services::{NotificationDispatcher, WebhookNotifier};

fn rescheduled() -> NotificationEvent {
    NotificationEvent {
        event_type: NotificationType::Rescheduled,
        appointment_id: Uuid::new_v4(),
        patient_id: Uuid::new_v4(),
        specialist_id: Uuid::new_v4(),
        old_time: Some(Utc.with_ymd_and_hms(2025, 3, 10, 14, 0, 0).unwrap()),
        new_time: Utc.with_ymd_and_hms(2025, 3, 11, 9, 0, 0).unwrap(),
    }
}

#[tokio::test]
async fn test_webhook_receives_event_json() {
    let server = MockServer::start().await;
    let event = rescheduled();

    Mock::given(method("POST"))
        .and(path("/hooks/appointments"))
        .and(body_partial_json(json!({
            "type": "rescheduled",
            "appointment_id": event.appointment_id,
            "old_time": "2025-03-10T14:00:00Z",
            "new_time": "2025-03-11T09:00:00Z"
        })))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;

    let notifier = WebhookNotifier::new(format!("{}/hooks/appointments", server.uri()), Duration::from_secs(2));
    notifier.notify(&event).await.unwrap();
}

#[tokio::test]
async fn test_webhook_error_status_is_delivery_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let notifier = WebhookNotifier::new(server.uri(), Duration::from_secs(2));
    assert_matches!(notifier.notify(&rescheduled()).await, Err(NotificationError::Delivery(_)));
}

#[tokio::test]
async fn test_slow_webhook_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
        .mount(&server)
        .await;

    let notifier = WebhookNotifier::new(server.uri(), Duration::from_millis(50));
    assert_matches!(notifier.notify(&rescheduled()).await, Err(NotificationError::Timeout));
}
