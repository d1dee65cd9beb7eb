#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use uuid::Uuid;

use appointment_cell::error::NotificationError;
use appointment_cell::models::{Actor, CreateAppointmentRequest, NotificationEvent};
use appointment_cell::services::{
    AppointmentBookingService, FixedClock, InMemoryGateway, NotificationDispatcher,
};
use shared_config::SchedulingConfig;

/// Wall clock at the start of every scenario.
pub fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap()
}

pub fn slot(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, day, hour, minute, 0).unwrap()
}

#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<NotificationEvent>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<NotificationEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Dispatch is detached from the operation, so wait for `count` events
    /// (or give up after a second and return what arrived).
    pub async fn wait_for(&self, count: usize) -> Vec<NotificationEvent> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        loop {
            let events = self.events();
            if events.len() >= count || tokio::time::Instant::now() >= deadline {
                return events;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl NotificationDispatcher for RecordingNotifier {
    async fn notify(&self, event: &NotificationEvent) -> Result<(), NotificationError> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

pub struct Harness {
    pub gateway: InMemoryGateway,
    pub clock: Arc<FixedClock>,
    pub notifier: Arc<RecordingNotifier>,
    pub service: Arc<AppointmentBookingService>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(SchedulingConfig::default())
    }

    pub fn with_config(config: SchedulingConfig) -> Self {
        let gateway = InMemoryGateway::new();
        let clock = Arc::new(FixedClock::new(start()));
        let notifier = Arc::new(RecordingNotifier::default());
        let service = Arc::new(AppointmentBookingService::new(
            Arc::new(gateway.clone()),
            clock.clone(),
            notifier.clone(),
            &config,
        ));
        Self { gateway, clock, notifier, service }
    }
}

pub fn patient(name: &str) -> Actor {
    Actor::patient(Uuid::new_v4(), name)
}

pub fn specialist() -> Actor {
    Actor::specialist(Uuid::new_v4(), "Dr. Elena Paz")
}

pub fn admin() -> Actor {
    Actor::admin(Uuid::new_v4(), "Front Desk")
}

pub fn booking_for(patient: &Actor, at: DateTime<Utc>) -> CreateAppointmentRequest {
    CreateAppointmentRequest {
        patient_id: patient.id.unwrap(),
        specialist_id: Uuid::new_v4(),
        scheduled_at: at,
        reason: Some("Foot pain when walking".to_string()),
        patient_notes: None,
    }
}
