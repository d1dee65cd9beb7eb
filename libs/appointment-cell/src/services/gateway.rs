// libs/appointment-cell/src/services/gateway.rs
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::GatewayError;
use crate::models::{
    Appointment, AppointmentPatch, AuditEvent, Evaluation, OrthoticsOrder, PrescriptionLine,
};

/// Entry point to the relational store holding the clinic calendar.
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    /// Open a unit of work. Everything done through it becomes visible to
    /// others on `commit` and is discarded on `rollback` or drop.
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, GatewayError>;
}

/// One atomic read-check-write sequence against the store.
///
/// Implementations must enforce the active-slot uniqueness guard on
/// `insert_appointment`/`update_appointment` (or at the latest on `commit`)
/// and report a violation as `GatewayError::SlotTaken`.
#[async_trait]
pub trait UnitOfWork: Send {
    /// Booked or completed appointments starting exactly at `time`.
    async fn find_active_appointments_at(&mut self, time: DateTime<Utc>) -> Result<Vec<Appointment>, GatewayError>;

    async fn get_appointment(&mut self, id: Uuid) -> Result<Option<Appointment>, GatewayError>;

    async fn insert_appointment(&mut self, appointment: Appointment) -> Result<Appointment, GatewayError>;

    async fn update_appointment(&mut self, id: Uuid, patch: AppointmentPatch) -> Result<Appointment, GatewayError>;

    async fn get_evaluation(&mut self, appointment_id: Uuid) -> Result<Option<Evaluation>, GatewayError>;

    async fn upsert_evaluation(&mut self, evaluation: Evaluation) -> Result<Evaluation, GatewayError>;

    async fn get_orthotics_order(&mut self, appointment_id: Uuid) -> Result<Option<OrthoticsOrder>, GatewayError>;

    async fn upsert_orthotics_order(&mut self, order: OrthoticsOrder) -> Result<OrthoticsOrder, GatewayError>;

    async fn insert_prescription(&mut self, line: PrescriptionLine) -> Result<PrescriptionLine, GatewayError>;

    /// Hash of the newest audit event visible to this unit of work.
    async fn latest_audit_hash(&mut self) -> Result<Option<String>, GatewayError>;

    async fn append_audit_event(&mut self, event: AuditEvent) -> Result<(), GatewayError>;

    async fn commit(self: Box<Self>) -> Result<(), GatewayError>;

    async fn rollback(self: Box<Self>);
}

/// Hands out a gateway bound to the caller's credentials.
pub trait GatewayProvider: Send + Sync {
    fn gateway_for(&self, auth_token: &str) -> Arc<dyn PersistenceGateway>;
}
