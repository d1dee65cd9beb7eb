use thiserror::Error;
use uuid::Uuid;

use crate::models::AppointmentStatus;

/// Failures reported by a persistence gateway.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// The active-slot uniqueness guard rejected the write.
    #[error("Active appointment slot already taken")]
    SlotTaken,

    #[error("Record not found: {0}")]
    RecordNotFound(String),

    #[error("Audit append rejected: {0}")]
    AuditRejected(String),

    #[error("Storage operation timed out")]
    Timeout,

    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    /// A concurrent unit changed what this one read. Safe to rerun.
    #[error("Concurrent change detected: {0}")]
    Contended(String),

    #[error("Stored data could not be decoded: {0}")]
    Corrupt(String),
}

/// First inconsistency found while verifying a sequence of audit events.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AuditChainError {
    #[error("Audit event {index} ({id}) does not link to its predecessor")]
    BrokenLink { index: usize, id: Uuid },

    #[error("Audit event {index} ({id}) does not match its recorded hash")]
    HashMismatch { index: usize, id: Uuid },
}

#[derive(Error, Debug)]
pub enum NotificationError {
    #[error("Notification delivery failed: {0}")]
    Delivery(String),

    #[error("Notification dispatch timed out")]
    Timeout,
}

/// Everything an appointment operation can report to its caller.
///
/// Business rejections render a message meant for the end user.
/// Infrastructure failures render a generic message and keep the
/// underlying cause as their `source` for operational logs.
#[derive(Error, Debug)]
pub enum AppointmentError {
    #[error("Appointment not found")]
    NotFound,

    #[error("The requested time slot is no longer available")]
    SlotUnavailable,

    #[error("Appointment cannot change from {from} to {to}")]
    InvalidTransition { from: AppointmentStatus, to: AppointmentStatus },

    #[error("Only booked appointments can be rescheduled (current status: {0})")]
    NotReschedulable(AppointmentStatus),

    #[error("Appointment is completed and can no longer be modified")]
    AppointmentClosed,

    #[error("Appointments cannot be cancelled less than {window_hours} hours before they start")]
    TooLateToCancel { window_hours: u32 },

    #[error("Appointments cannot be rescheduled less than {window_hours} hours before they start")]
    TooLateToReschedule { window_hours: u32 },

    #[error("Not authorized: {0}")]
    Forbidden(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Scheduling is temporarily unavailable, please retry")]
    StorageUnavailable(#[source] GatewayError),

    #[error("The change could not be recorded, please retry")]
    AuditWriteFailed(#[source] GatewayError),
}

impl AppointmentError {
    /// Stable machine-readable kind.
    pub fn kind(&self) -> &'static str {
        match self {
            AppointmentError::NotFound => "not_found",
            AppointmentError::SlotUnavailable => "slot_unavailable",
            AppointmentError::InvalidTransition { .. } => "invalid_transition",
            AppointmentError::NotReschedulable(_) => "not_reschedulable",
            AppointmentError::AppointmentClosed => "appointment_closed",
            AppointmentError::TooLateToCancel { .. } => "too_late_to_cancel",
            AppointmentError::TooLateToReschedule { .. } => "too_late_to_reschedule",
            AppointmentError::Forbidden(_) => "forbidden",
            AppointmentError::Validation(_) => "validation_error",
            AppointmentError::StorageUnavailable(_) => "storage_unavailable",
            AppointmentError::AuditWriteFailed(_) => "audit_write_failed",
        }
    }

    /// Infrastructure failures; safe for the caller to retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AppointmentError::StorageUnavailable(_) | AppointmentError::AuditWriteFailed(_)
        )
    }
}

impl From<GatewayError> for AppointmentError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::SlotTaken => AppointmentError::SlotUnavailable,
            GatewayError::RecordNotFound(_) => AppointmentError::NotFound,
            GatewayError::AuditRejected(_) => AppointmentError::AuditWriteFailed(err),
            other => AppointmentError::StorageUnavailable(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_gateway_errors_map_to_taxonomy() {
        assert_matches!(AppointmentError::from(GatewayError::SlotTaken), AppointmentError::SlotUnavailable);
        assert_matches!(
            AppointmentError::from(GatewayError::AuditRejected("disk full".into())),
            AppointmentError::AuditWriteFailed(_)
        );
        assert_matches!(
            AppointmentError::from(GatewayError::Timeout),
            AppointmentError::StorageUnavailable(GatewayError::Timeout)
        );

        let contended = AppointmentError::from(GatewayError::Contended("AUD02".into()));
        assert_matches!(contended, AppointmentError::StorageUnavailable(GatewayError::Contended(_)));
        assert!(contended.is_transient());
    }

    #[test]
    fn test_infrastructure_messages_do_not_leak_details() {
        let err = AppointmentError::from(GatewayError::Unavailable("connection refused to 10.0.0.5:5432".into()));
        assert!(err.is_transient());
        assert!(!err.to_string().contains("10.0.0.5"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_business_rejections_are_not_transient() {
        assert!(!AppointmentError::SlotUnavailable.is_transient());
        assert!(!AppointmentError::TooLateToCancel { window_hours: 24 }.is_transient());
        assert_eq!(AppointmentError::AppointmentClosed.kind(), "appointment_closed");
    }
}
