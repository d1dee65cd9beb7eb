// libs/appointment-cell/src/models.rs
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;
use chrono::{DateTime, Utc};
use std::fmt;

pub const APPOINTMENTS_TABLE: &str = "appointments";
pub const EVALUATIONS_TABLE: &str = "appointment_evaluations";
pub const ORTHOTICS_ORDERS_TABLE: &str = "orthotics_orders";
pub const PRESCRIPTIONS_TABLE: &str = "prescriptions";
pub const AUDIT_EVENTS_TABLE: &str = "audit_events";

// ==============================================================================
// CORE APPOINTMENT MODELS
// ==============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Appointment {
    pub id: Uuid,
    pub patient_id: Uuid,
    pub specialist_id: Uuid,
    /// Start of a fixed-width clinic slot.
    pub scheduled_at: DateTime<Utc>,
    pub status: AppointmentStatus,
    pub reason: Option<String>,
    pub patient_notes: Option<String>,
    pub specialist_notes: Option<String>,
    pub procedures_performed: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Appointment {
    /// Booked and completed appointments hold their slot; cancelled ones release it.
    pub fn occupies_slot(&self) -> bool {
        self.status.is_active()
    }

    pub fn is_owned_by(&self, actor: &Actor) -> bool {
        actor.id == Some(self.patient_id)
    }

    pub fn apply(&mut self, patch: &AppointmentPatch) {
        if let Some(scheduled_at) = patch.scheduled_at {
            self.scheduled_at = scheduled_at;
        }
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(notes) = &patch.specialist_notes {
            self.specialist_notes = Some(notes.clone());
        }
        if let Some(procedures) = &patch.procedures_performed {
            self.procedures_performed = Some(procedures.clone());
        }
        self.updated_at = patch.updated_at;
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentStatus {
    Booked,
    Completed,
    Cancelled,
}

impl AppointmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentStatus::Booked => "booked",
            AppointmentStatus::Completed => "completed",
            AppointmentStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, AppointmentStatus::Booked | AppointmentStatus::Completed)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AppointmentStatus::Completed | AppointmentStatus::Cancelled)
    }
}

impl fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Partial update of an appointment row. `None` leaves the column untouched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppointmentPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<AppointmentStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub specialist_notes: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub procedures_performed: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl AppointmentPatch {
    pub fn touch(updated_at: DateTime<Utc>) -> Self {
        Self {
            scheduled_at: None,
            status: None,
            specialist_notes: None,
            procedures_performed: None,
            updated_at,
        }
    }

    pub fn status(status: AppointmentStatus, updated_at: DateTime<Utc>) -> Self {
        Self { status: Some(status), ..Self::touch(updated_at) }
    }

    pub fn reschedule(scheduled_at: DateTime<Utc>, updated_at: DateTime<Utc>) -> Self {
        Self { scheduled_at: Some(scheduled_at), ..Self::touch(updated_at) }
    }
}

// ==============================================================================
// ACTORS
// ==============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActorRole {
    Patient,
    Specialist,
    Admin,
    System,
}

impl ActorRole {
    /// Map a role claim to an actor role. Unknown roles are not trusted.
    pub fn from_claim(role: &str) -> Option<Self> {
        match role.trim().to_ascii_lowercase().as_str() {
            "patient" => Some(ActorRole::Patient),
            "specialist" | "doctor" => Some(ActorRole::Specialist),
            "admin" | "receptionist" | "staff" => Some(ActorRole::Admin),
            "service_role" | "system" => Some(ActorRole::System),
            _ => None,
        }
    }

    /// Staff roles are exempt from the patient protected window.
    pub fn is_staff(&self) -> bool {
        !matches!(self, ActorRole::Patient)
    }
}

/// Whoever is driving an operation. `id` is `None` for system-initiated changes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Actor {
    pub id: Option<Uuid>,
    pub display_name: String,
    pub role: ActorRole,
}

impl Actor {
    pub fn new(id: Uuid, display_name: impl Into<String>, role: ActorRole) -> Self {
        Self { id: Some(id), display_name: display_name.into(), role }
    }

    pub fn patient(id: Uuid, display_name: impl Into<String>) -> Self {
        Self::new(id, display_name, ActorRole::Patient)
    }

    pub fn specialist(id: Uuid, display_name: impl Into<String>) -> Self {
        Self::new(id, display_name, ActorRole::Specialist)
    }

    pub fn admin(id: Uuid, display_name: impl Into<String>) -> Self {
        Self::new(id, display_name, ActorRole::Admin)
    }

    pub fn system() -> Self {
        Self { id: None, display_name: "system".to_string(), role: ActorRole::System }
    }

    pub fn is_patient(&self) -> bool {
        self.role == ActorRole::Patient
    }
}

// ==============================================================================
// REQUEST MODELS
// ==============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateAppointmentRequest {
    pub patient_id: Uuid,
    pub specialist_id: Uuid,
    pub scheduled_at: DateTime<Utc>,
    pub reason: Option<String>,
    pub patient_notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeStatusRequest {
    pub status: AppointmentStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RescheduleAppointmentRequest {
    pub new_time: DateTime<Utc>,
}

// ==============================================================================
// CLINICAL RECORD MODELS
// ==============================================================================

/// Clinical changes recorded against one appointment in a single call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClinicalUpdate {
    pub specialist_notes: Option<String>,
    pub procedures_performed: Option<String>,
    pub evaluation: Option<EvaluationInput>,
    pub orthotics_order: Option<OrthoticsOrderInput>,
    #[serde(default)]
    pub prescriptions: Vec<PrescriptionInput>,
}

impl ClinicalUpdate {
    pub fn touches_appointment(&self) -> bool {
        self.specialist_notes.is_some() || self.procedures_performed.is_some()
    }

    pub fn is_empty(&self) -> bool {
        !self.touches_appointment()
            && self.evaluation.is_none()
            && self.orthotics_order.is_none()
            && self.prescriptions.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvaluationInput {
    pub findings: Option<String>,
    pub diagnosis: Option<String>,
    pub treatment_plan: Option<String>,
}

/// One evaluation per appointment, upserted in place.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Evaluation {
    pub appointment_id: Uuid,
    pub findings: Option<String>,
    pub diagnosis: Option<String>,
    pub treatment_plan: Option<String>,
    pub recorded_by: Option<Uuid>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrthoticsOrderInput {
    pub device: String,
    pub specifications: Option<String>,
}

/// One orthotics order per appointment, upserted in place.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrthoticsOrder {
    pub appointment_id: Uuid,
    pub device: String,
    pub specifications: Option<String>,
    pub ordered_by: Option<Uuid>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PrescriptionInput {
    pub medication: String,
    pub dosage: Option<String>,
    pub instructions: Option<String>,
}

/// Prescription lines are only ever appended; past lines are never rewritten.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PrescriptionLine {
    pub id: Uuid,
    pub appointment_id: Uuid,
    pub medication: String,
    pub dosage: Option<String>,
    pub instructions: Option<String>,
    pub prescribed_by: Option<Uuid>,
    pub prescribed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClinicalUpdateOutcome {
    pub appointment: Appointment,
    pub evaluation: Option<Evaluation>,
    pub orthotics_order: Option<OrthoticsOrder>,
    pub prescriptions: Vec<PrescriptionLine>,
    pub audit_event_ids: Vec<Uuid>,
}

// ==============================================================================
// AUDIT MODELS
// ==============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Insert,
    Update,
    Delete,
}

/// What the recorder is asked to append; ids, timestamps and hashes are
/// filled in when the event is sealed.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditEventInput {
    pub table: String,
    pub record_id: Uuid,
    pub appointment_id: Option<Uuid>,
    pub action: AuditAction,
    pub actor_id: Option<Uuid>,
    pub actor_display_name: String,
    pub before: Option<Value>,
    pub after: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEvent {
    pub id: Uuid,
    pub table: String,
    pub record_id: Uuid,
    pub appointment_id: Option<Uuid>,
    pub action: AuditAction,
    pub actor_id: Option<Uuid>,
    /// Captured at write time so the trail stays readable if the actor changes later.
    pub actor_display_name: String,
    pub before: Option<Value>,
    pub after: Value,
    pub occurred_at: DateTime<Utc>,
    pub previous_hash: Option<String>,
    pub hash: String,
}

// ==============================================================================
// NOTIFICATION MODELS
// ==============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    Booked,
    Cancelled,
    Rescheduled,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotificationEvent {
    #[serde(rename = "type")]
    pub event_type: NotificationType,
    pub appointment_id: Uuid,
    pub patient_id: Uuid,
    pub specialist_id: Uuid,
    pub old_time: Option<DateTime<Utc>>,
    pub new_time: DateTime<Utc>,
}

impl NotificationEvent {
    pub fn for_appointment(event_type: NotificationType, appointment: &Appointment) -> Self {
        Self {
            event_type,
            appointment_id: appointment.id,
            patient_id: appointment.patient_id,
            specialist_id: appointment.specialist_id,
            old_time: None,
            new_time: appointment.scheduled_at,
        }
    }

    pub fn rescheduled(appointment: &Appointment, old_time: DateTime<Utc>) -> Self {
        Self {
            old_time: Some(old_time),
            ..Self::for_appointment(NotificationType::Rescheduled, appointment)
        }
    }
}
