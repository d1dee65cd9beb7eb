// libs/appointment-cell/src/services/conflict.rs
use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::GatewayError;
use crate::models::Appointment;
use crate::services::gateway::UnitOfWork;

/// Detects collisions on the single clinic-wide calendar.
///
/// Slots are discrete, so two appointments collide exactly when they start
/// at the same instant. The specialist is deliberately not part of the key.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConflictDetector;

impl ConflictDetector {
    pub fn new() -> Self {
        Self
    }

    /// Check for an active appointment at `candidate_time` other than
    /// `exclude_appointment_id`. Reads through the caller's unit of work so
    /// the answer has the same visibility as the write that follows.
    pub async fn has_conflict(
        &self,
        uow: &mut dyn UnitOfWork,
        candidate_time: DateTime<Utc>,
        exclude_appointment_id: Option<Uuid>,
    ) -> Result<bool, GatewayError> {
        debug!("Checking clinic calendar for conflicts at {}", candidate_time);

        let occupants = uow.find_active_appointments_at(candidate_time).await?;
        let conflicting: Vec<&Appointment> = occupants
            .iter()
            .filter(|existing| collides(candidate_time, existing, exclude_appointment_id))
            .collect();

        if !conflicting.is_empty() {
            warn!("Conflict detected at {} - {} active appointment(s) hold the slot",
                  candidate_time, conflicting.len());
        }

        Ok(!conflicting.is_empty())
    }
}

/// Whether `existing` blocks a booking at `candidate_time`.
pub fn collides(candidate_time: DateTime<Utc>, existing: &Appointment, exclude_appointment_id: Option<Uuid>) -> bool {
    Some(existing.id) != exclude_appointment_id
        && existing.occupies_slot()
        && existing.scheduled_at == candidate_time
}
