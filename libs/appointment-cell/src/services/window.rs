// libs/appointment-cell/src/services/window.rs
use chrono::{DateTime, Duration, Utc};

/// The period right before an appointment during which its patient can no
/// longer cancel or reschedule it. Staff are never subject to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtectedWindow {
    hours: u32,
}

impl Default for ProtectedWindow {
    fn default() -> Self {
        Self { hours: 24 }
    }
}

impl ProtectedWindow {
    pub fn new(hours: u32) -> Self {
        Self { hours }
    }

    pub fn hours(&self) -> u32 {
        self.hours
    }

    /// True when `appointment_time - now` is strictly shorter than the window.
    /// Appointments already in the past are always inside it.
    pub fn is_within_protected_window(&self, appointment_time: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        appointment_time - now < Duration::hours(i64::from(self.hours))
    }
}
