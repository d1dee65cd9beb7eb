// libs/appointment-cell/src/services/slot.rs
use chrono::{DateTime, Utc};

use crate::error::AppointmentError;

/// Clinic slot grid: every bookable time is a whole multiple of the slot
/// width counted from the Unix epoch (UTC midnight for widths dividing a day).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotPolicy {
    slot_minutes: u32,
}

impl SlotPolicy {
    pub fn new(slot_minutes: u32) -> Self {
        Self { slot_minutes: slot_minutes.max(1) }
    }

    pub fn is_aligned(&self, time: DateTime<Utc>) -> bool {
        let slot_seconds = i64::from(self.slot_minutes) * 60;
        time.timestamp_subsec_nanos() == 0 && time.timestamp().rem_euclid(slot_seconds) == 0
    }

    /// Reject a candidate start time that is off the grid or not in the future.
    pub fn validate(&self, candidate: DateTime<Utc>, now: DateTime<Utc>) -> Result<(), AppointmentError> {
        if !self.is_aligned(candidate) {
            return Err(AppointmentError::Validation(format!(
                "Appointments must start on a {}-minute slot boundary",
                self.slot_minutes
            )));
        }

        if candidate <= now {
            return Err(AppointmentError::Validation(
                "Appointment must be scheduled for a future time".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use chrono::{Duration, TimeZone};

    #[test]
    fn test_alignment() {
        let policy = SlotPolicy::new(30);
        let on_grid = Utc.with_ymd_and_hms(2025, 3, 10, 14, 30, 0).unwrap();
        assert!(policy.is_aligned(on_grid));
        assert!(!policy.is_aligned(on_grid + Duration::minutes(10)));
        assert!(!policy.is_aligned(on_grid + Duration::seconds(1)));
        assert!(!policy.is_aligned(on_grid + Duration::milliseconds(5)));
    }

    #[test]
    fn test_rejects_past_and_present() {
        let policy = SlotPolicy::new(30);
        let now = Utc.with_ymd_and_hms(2025, 3, 10, 14, 0, 0).unwrap();
        assert_matches!(policy.validate(now, now), Err(AppointmentError::Validation(_)));
        assert_matches!(policy.validate(now - Duration::minutes(30), now), Err(AppointmentError::Validation(_)));
        assert!(policy.validate(now + Duration::minutes(30), now).is_ok());
    }
}
