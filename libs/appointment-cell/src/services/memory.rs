// libs/appointment-cell/src/services/memory.rs
//
// In-process persistence gateway. Units of work hold the calendar lock for
// their whole lifetime (serializable by construction) and stage their writes.
// Commit applies the staged writes, then appends the audit events; if the
// append fails, the inverse of every applied write runs in reverse order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::GatewayError;
use crate::models::{
    Appointment, AppointmentPatch, AuditEvent, Evaluation, OrthoticsOrder, PrescriptionLine,
};
use crate::services::gateway::{GatewayProvider, PersistenceGateway, UnitOfWork};

#[derive(Debug, Default)]
struct CalendarState {
    appointments: HashMap<Uuid, Appointment>,
    evaluations: HashMap<Uuid, Evaluation>,
    orthotics_orders: HashMap<Uuid, OrthoticsOrder>,
    prescriptions: Vec<PrescriptionLine>,
    audit_log: Vec<AuditEvent>,
}

impl CalendarState {
    /// Active-slot uniqueness guard.
    fn slot_taken_by_other(&self, candidate: &Appointment) -> bool {
        candidate.occupies_slot()
            && self.appointments.values().any(|existing| {
                existing.id != candidate.id
                    && existing.occupies_slot()
                    && existing.scheduled_at == candidate.scheduled_at
            })
    }

    fn apply(&mut self, write: StagedWrite) -> Result<Compensation, GatewayError> {
        match write {
            StagedWrite::Appointment(appointment) => {
                if self.slot_taken_by_other(&appointment) {
                    return Err(GatewayError::SlotTaken);
                }
                let id = appointment.id;
                let previous = self.appointments.insert(id, appointment);
                Ok(Compensation::RestoreAppointment(id, previous))
            }
            StagedWrite::Evaluation(evaluation) => {
                let id = evaluation.appointment_id;
                let previous = self.evaluations.insert(id, evaluation);
                Ok(Compensation::RestoreEvaluation(id, previous))
            }
            StagedWrite::OrthoticsOrder(order) => {
                let id = order.appointment_id;
                let previous = self.orthotics_orders.insert(id, order);
                Ok(Compensation::RestoreOrthoticsOrder(id, previous))
            }
            StagedWrite::Prescription(line) => {
                let id = line.id;
                self.prescriptions.push(line);
                Ok(Compensation::RemovePrescription(id))
            }
        }
    }

    fn compensate(&mut self, compensation: Compensation) {
        match compensation {
            Compensation::RestoreAppointment(id, Some(previous)) => {
                self.appointments.insert(id, previous);
            }
            Compensation::RestoreAppointment(id, None) => {
                self.appointments.remove(&id);
            }
            Compensation::RestoreEvaluation(id, Some(previous)) => {
                self.evaluations.insert(id, previous);
            }
            Compensation::RestoreEvaluation(id, None) => {
                self.evaluations.remove(&id);
            }
            Compensation::RestoreOrthoticsOrder(id, Some(previous)) => {
                self.orthotics_orders.insert(id, previous);
            }
            Compensation::RestoreOrthoticsOrder(id, None) => {
                self.orthotics_orders.remove(&id);
            }
            Compensation::RemovePrescription(id) => {
                self.prescriptions.retain(|line| line.id != id);
            }
        }
    }
}

#[derive(Debug, Clone)]
enum StagedWrite {
    Appointment(Appointment),
    Evaluation(Evaluation),
    OrthoticsOrder(OrthoticsOrder),
    Prescription(PrescriptionLine),
}

/// Inverse of one applied write.
#[derive(Debug)]
enum Compensation {
    RestoreAppointment(Uuid, Option<Appointment>),
    RestoreEvaluation(Uuid, Option<Evaluation>),
    RestoreOrthoticsOrder(Uuid, Option<OrthoticsOrder>),
    RemovePrescription(Uuid),
}

#[derive(Debug, Default)]
struct FaultInjection {
    unavailable: AtomicBool,
    fail_audit_appends: AtomicBool,
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryGateway {
    state: Arc<Mutex<CalendarState>>,
    faults: Arc<FaultInjection>,
}

impl InMemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `begin` fail as if the store were down.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.faults.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make the audit phase of every subsequent commit fail.
    pub fn fail_audit_appends(&self, fail: bool) {
        self.faults.fail_audit_appends.store(fail, Ordering::SeqCst);
    }

    pub async fn appointments(&self) -> Vec<Appointment> {
        let mut rows: Vec<Appointment> = self.state.lock().await.appointments.values().cloned().collect();
        rows.sort_by_key(|row| (row.scheduled_at, row.created_at));
        rows
    }

    pub async fn appointment(&self, id: Uuid) -> Option<Appointment> {
        self.state.lock().await.appointments.get(&id).cloned()
    }

    pub async fn audit_events(&self) -> Vec<AuditEvent> {
        self.state.lock().await.audit_log.clone()
    }

    pub async fn evaluation(&self, appointment_id: Uuid) -> Option<Evaluation> {
        self.state.lock().await.evaluations.get(&appointment_id).cloned()
    }

    pub async fn orthotics_order(&self, appointment_id: Uuid) -> Option<OrthoticsOrder> {
        self.state.lock().await.orthotics_orders.get(&appointment_id).cloned()
    }

    pub async fn prescriptions(&self, appointment_id: Uuid) -> Vec<PrescriptionLine> {
        self.state
            .lock()
            .await
            .prescriptions
            .iter()
            .filter(|line| line.appointment_id == appointment_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl PersistenceGateway for InMemoryGateway {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, GatewayError> {
        if self.faults.unavailable.load(Ordering::SeqCst) {
            return Err(GatewayError::Unavailable("in-memory store marked unavailable".to_string()));
        }

        let guard = Arc::clone(&self.state).lock_owned().await;
        Ok(Box::new(InMemoryUnitOfWork {
            state: guard,
            faults: Arc::clone(&self.faults),
            staged: Vec::new(),
            staged_audit: Vec::new(),
        }))
    }
}

impl GatewayProvider for InMemoryGateway {
    fn gateway_for(&self, _auth_token: &str) -> Arc<dyn PersistenceGateway> {
        Arc::new(self.clone())
    }
}

struct InMemoryUnitOfWork {
    state: OwnedMutexGuard<CalendarState>,
    faults: Arc<FaultInjection>,
    staged: Vec<StagedWrite>,
    staged_audit: Vec<AuditEvent>,
}

impl InMemoryUnitOfWork {
    /// Latest version of an appointment as seen from inside this unit of work.
    fn current_appointment(&self, id: Uuid) -> Option<Appointment> {
        self.staged
            .iter()
            .rev()
            .find_map(|write| match write {
                StagedWrite::Appointment(row) if row.id == id => Some(row.clone()),
                _ => None,
            })
            .or_else(|| self.state.appointments.get(&id).cloned())
    }

    fn visible_appointment_ids(&self) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = self.state.appointments.keys().copied().collect();
        for write in &self.staged {
            if let StagedWrite::Appointment(row) = write {
                if !ids.contains(&row.id) {
                    ids.push(row.id);
                }
            }
        }
        ids
    }

    fn active_at(&self, time: DateTime<Utc>) -> Vec<Appointment> {
        self.visible_appointment_ids()
            .into_iter()
            .filter_map(|id| self.current_appointment(id))
            .filter(|row| row.occupies_slot() && row.scheduled_at == time)
            .collect()
    }

    fn ensure_slot_free(&self, candidate: &Appointment) -> Result<(), GatewayError> {
        if candidate.occupies_slot()
            && self.active_at(candidate.scheduled_at).iter().any(|row| row.id != candidate.id)
        {
            return Err(GatewayError::SlotTaken);
        }
        Ok(())
    }
}

#[async_trait]
impl UnitOfWork for InMemoryUnitOfWork {
    async fn find_active_appointments_at(&mut self, time: DateTime<Utc>) -> Result<Vec<Appointment>, GatewayError> {
        Ok(self.active_at(time))
    }

    async fn get_appointment(&mut self, id: Uuid) -> Result<Option<Appointment>, GatewayError> {
        Ok(self.current_appointment(id))
    }

    async fn insert_appointment(&mut self, appointment: Appointment) -> Result<Appointment, GatewayError> {
        self.ensure_slot_free(&appointment)?;
        self.staged.push(StagedWrite::Appointment(appointment.clone()));
        Ok(appointment)
    }

    async fn update_appointment(&mut self, id: Uuid, patch: AppointmentPatch) -> Result<Appointment, GatewayError> {
        let mut row = self
            .current_appointment(id)
            .ok_or_else(|| GatewayError::RecordNotFound(format!("appointment {}", id)))?;
        row.apply(&patch);
        self.ensure_slot_free(&row)?;
        self.staged.push(StagedWrite::Appointment(row.clone()));
        Ok(row)
    }

    async fn get_evaluation(&mut self, appointment_id: Uuid) -> Result<Option<Evaluation>, GatewayError> {
        Ok(self
            .staged
            .iter()
            .rev()
            .find_map(|write| match write {
                StagedWrite::Evaluation(row) if row.appointment_id == appointment_id => Some(row.clone()),
                _ => None,
            })
            .or_else(|| self.state.evaluations.get(&appointment_id).cloned()))
    }

    async fn upsert_evaluation(&mut self, evaluation: Evaluation) -> Result<Evaluation, GatewayError> {
        self.staged.push(StagedWrite::Evaluation(evaluation.clone()));
        Ok(evaluation)
    }

    async fn get_orthotics_order(&mut self, appointment_id: Uuid) -> Result<Option<OrthoticsOrder>, GatewayError> {
        Ok(self
            .staged
            .iter()
            .rev()
            .find_map(|write| match write {
                StagedWrite::OrthoticsOrder(row) if row.appointment_id == appointment_id => Some(row.clone()),
                _ => None,
            })
            .or_else(|| self.state.orthotics_orders.get(&appointment_id).cloned()))
    }

    async fn upsert_orthotics_order(&mut self, order: OrthoticsOrder) -> Result<OrthoticsOrder, GatewayError> {
        self.staged.push(StagedWrite::OrthoticsOrder(order.clone()));
        Ok(order)
    }

    async fn insert_prescription(&mut self, line: PrescriptionLine) -> Result<PrescriptionLine, GatewayError> {
        self.staged.push(StagedWrite::Prescription(line.clone()));
        Ok(line)
    }

    async fn latest_audit_hash(&mut self) -> Result<Option<String>, GatewayError> {
        Ok(self
            .staged_audit
            .last()
            .or_else(|| self.state.audit_log.last())
            .map(|event| event.hash.clone()))
    }

    async fn append_audit_event(&mut self, event: AuditEvent) -> Result<(), GatewayError> {
        self.staged_audit.push(event);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), GatewayError> {
        let InMemoryUnitOfWork { mut state, faults, staged, staged_audit } = *self;
        debug!("Committing {} write(s) and {} audit event(s)", staged.len(), staged_audit.len());

        // Step 1: apply the data writes, remembering how to undo each one
        let mut applied: Vec<Compensation> = Vec::with_capacity(staged.len());
        for write in staged {
            match state.apply(write) {
                Ok(compensation) => applied.push(compensation),
                Err(e) => {
                    warn!("Write rejected during commit, compensating {} applied write(s)", applied.len());
                    rollback_applied(&mut state, applied);
                    return Err(e);
                }
            }
        }

        // Step 2: append the audit trail; on failure undo step 1
        if faults.fail_audit_appends.load(Ordering::SeqCst) {
            warn!("Audit append failed, compensating {} applied write(s)", applied.len());
            rollback_applied(&mut state, applied);
            return Err(GatewayError::AuditRejected("audit log rejected the append".to_string()));
        }
        state.audit_log.extend(staged_audit);

        Ok(())
    }

    async fn rollback(self: Box<Self>) {
        debug!("Rolling back {} staged write(s)", self.staged.len());
    }
}

fn rollback_applied(state: &mut CalendarState, applied: Vec<Compensation>) {
    for compensation in applied.into_iter().rev() {
        state.compensate(compensation);
    }
}
