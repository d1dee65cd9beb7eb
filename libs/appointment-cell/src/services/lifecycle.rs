// libs/appointment-cell/src/services/lifecycle.rs
use tracing::{debug, warn};

use crate::error::AppointmentError;
use crate::models::{ActorRole, AppointmentStatus};

/// Owns the appointment status graph:
///
/// ```text
/// Booked ──► Completed   (staff only)
///    └─────► Cancelled   (anyone; patients subject to the protected window)
/// ```
///
/// `Completed` and `Cancelled` are terminal.
#[derive(Debug, Default, Clone, Copy)]
pub struct AppointmentStateMachine;

impl AppointmentStateMachine {
    pub fn new() -> Self {
        Self
    }

    /// Validate that `role` may move an appointment from `current` to `target`.
    pub fn validate_status_transition(
        &self,
        current: AppointmentStatus,
        target: AppointmentStatus,
        role: ActorRole,
    ) -> Result<(), AppointmentError> {
        debug!("Validating status transition from {} to {} by {:?}", current, target, role);

        if !self.valid_transitions(current, role).contains(&target) {
            warn!("Invalid status transition attempted: {} -> {} by {:?}", current, target, role);
            return Err(AppointmentError::InvalidTransition { from: current, to: target });
        }

        Ok(())
    }

    /// All statuses reachable from `current` for an actor with `role`.
    pub fn valid_transitions(&self, current: AppointmentStatus, role: ActorRole) -> Vec<AppointmentStatus> {
        match current {
            AppointmentStatus::Booked if role.is_staff() => vec![
                AppointmentStatus::Completed,
                AppointmentStatus::Cancelled,
            ],
            AppointmentStatus::Booked => vec![AppointmentStatus::Cancelled],
            // Terminal states - no transitions allowed
            AppointmentStatus::Completed | AppointmentStatus::Cancelled => vec![],
        }
    }

    /// Rescheduling keeps the status and is only possible while booked.
    pub fn ensure_reschedulable(&self, current: AppointmentStatus) -> Result<(), AppointmentError> {
        match current {
            AppointmentStatus::Booked => Ok(()),
            other => Err(AppointmentError::NotReschedulable(other)),
        }
    }

    /// Clinical records stay writable until the appointment is completed.
    pub fn ensure_clinically_open(&self, current: AppointmentStatus) -> Result<(), AppointmentError> {
        match current {
            AppointmentStatus::Completed => Err(AppointmentError::AppointmentClosed),
            _ => Ok(()),
        }
    }
}
