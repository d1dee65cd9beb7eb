// libs/appointment-cell/src/services/booking.rs
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use shared_config::SchedulingConfig;
use tracing::{debug, error, info, instrument, warn, Instrument};
use uuid::Uuid;

use crate::error::{AppointmentError, GatewayError};
use crate::models::{
    Actor, Appointment, AppointmentPatch, AppointmentStatus, AuditAction, AuditEvent,
    AuditEventInput, ClinicalUpdate, ClinicalUpdateOutcome, CreateAppointmentRequest, Evaluation,
    NotificationEvent, NotificationType, OrthoticsOrder, PrescriptionLine, EVALUATIONS_TABLE,
    ORTHOTICS_ORDERS_TABLE, PRESCRIPTIONS_TABLE,
};
use crate::services::audit::AuditTrailRecorder;
use crate::services::clock::Clock;
use crate::services::conflict::ConflictDetector;
use crate::services::gateway::{PersistenceGateway, UnitOfWork};
use crate::services::lifecycle::AppointmentStateMachine;
use crate::services::notification::NotificationDispatcher;
use crate::services::slot::SlotPolicy;
use crate::services::window::ProtectedWindow;

/// Attempts per operation when its unit loses a race on a row or on the
/// audit chain tip.
pub const MAX_UNIT_ATTEMPTS: u32 = 3;

/// Runs every appointment mutation as one unit of work: load, check, write,
/// audit, commit. Notifications go out only after the commit succeeded.
pub struct AppointmentBookingService {
    gateway: Arc<dyn PersistenceGateway>,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn NotificationDispatcher>,
    conflict_detector: ConflictDetector,
    protected_window: ProtectedWindow,
    state_machine: AppointmentStateMachine,
    slot_policy: SlotPolicy,
    audit: AuditTrailRecorder,
    storage_timeout: Duration,
    notification_timeout: Duration,
}

impl AppointmentBookingService {
    pub fn new(
        gateway: Arc<dyn PersistenceGateway>,
        clock: Arc<dyn Clock>,
        notifier: Arc<dyn NotificationDispatcher>,
        config: &SchedulingConfig,
    ) -> Self {
        Self {
            gateway,
            clock,
            notifier,
            conflict_detector: ConflictDetector::new(),
            protected_window: ProtectedWindow::new(config.protected_window_hours),
            state_machine: AppointmentStateMachine::new(),
            slot_policy: SlotPolicy::new(config.slot_duration_minutes),
            audit: AuditTrailRecorder::new(),
            storage_timeout: config.storage_timeout(),
            notification_timeout: config.notification_timeout(),
        }
    }

    /// Book a new appointment in a free slot.
    #[instrument(skip(self, request, actor), fields(actor_id = ?actor.id, role = ?actor.role))]
    pub async fn create_appointment(
        &self,
        request: CreateAppointmentRequest,
        actor: &Actor,
    ) -> Result<Appointment, AppointmentError> {
        info!("Booking appointment for patient {} with specialist {} at {}",
              request.patient_id, request.specialist_id, request.scheduled_at);

        if actor.is_patient() && actor.id != Some(request.patient_id) {
            warn!("Patient {:?} attempted to book for patient {}", actor.id, request.patient_id);
            return Err(AppointmentError::Forbidden("Patients can only book appointments for themselves".to_string()));
        }

        let now = self.clock.now();
        self.slot_policy.validate(request.scheduled_at, now)?;

        let mut attempt = 1;
        let appointment = loop {
            let mut uow = self.begin().await?;
            let outcome = self.create_in(uow.as_mut(), request.clone(), actor, now).await;
            match self.finish(uow, outcome).await {
                Err(e) if rerun_contended(&e, attempt) => attempt += 1,
                result => break result?,
            }
        };

        info!("Appointment {} booked for {}", appointment.id, appointment.scheduled_at);
        self.dispatch(NotificationEvent::for_appointment(NotificationType::Booked, &appointment));

        Ok(appointment)
    }

    async fn create_in(
        &self,
        uow: &mut dyn UnitOfWork,
        request: CreateAppointmentRequest,
        actor: &Actor,
        now: DateTime<Utc>,
    ) -> Result<Appointment, AppointmentError> {
        // Fast-path check; the store's uniqueness guard is authoritative
        if self.bounded("conflict_check", self.conflict_detector.has_conflict(uow, request.scheduled_at, None)).await? {
            warn!("Slot {} already taken", request.scheduled_at);
            return Err(AppointmentError::SlotUnavailable);
        }

        let appointment = Appointment {
            id: Uuid::new_v4(),
            patient_id: request.patient_id,
            specialist_id: request.specialist_id,
            scheduled_at: request.scheduled_at,
            status: AppointmentStatus::Booked,
            reason: request.reason,
            patient_notes: request.patient_notes,
            specialist_notes: None,
            procedures_performed: None,
            created_at: now,
            updated_at: now,
        };

        let created = self.bounded("insert_appointment", uow.insert_appointment(appointment)).await?;
        let audit_input = AuditEventInput::for_appointment(AuditAction::Insert, actor, None, &created)?;
        self.record_audit(uow, audit_input, now).await?;

        Ok(created)
    }

    /// Move a booked appointment to `target`.
    #[instrument(skip(self, actor), fields(actor_id = ?actor.id, role = ?actor.role))]
    pub async fn change_status(
        &self,
        appointment_id: Uuid,
        target: AppointmentStatus,
        actor: &Actor,
    ) -> Result<Appointment, AppointmentError> {
        debug!("Changing status of appointment {} to {}", appointment_id, target);

        let now = self.clock.now();
        let mut attempt = 1;
        let updated = loop {
            let mut uow = self.begin().await?;
            let outcome = self.change_status_in(uow.as_mut(), appointment_id, target, actor, now).await;
            match self.finish(uow, outcome).await {
                Err(e) if rerun_contended(&e, attempt) => attempt += 1,
                result => break result?,
            }
        };

        info!("Appointment {} is now {}", updated.id, updated.status);
        if updated.status == AppointmentStatus::Cancelled {
            self.dispatch(NotificationEvent::for_appointment(NotificationType::Cancelled, &updated));
        }

        Ok(updated)
    }

    async fn change_status_in(
        &self,
        uow: &mut dyn UnitOfWork,
        appointment_id: Uuid,
        target: AppointmentStatus,
        actor: &Actor,
        now: DateTime<Utc>,
    ) -> Result<Appointment, AppointmentError> {
        let current = self.load(uow, appointment_id, actor).await?;

        self.state_machine.validate_status_transition(current.status, target, actor.role)?;

        if actor.is_patient()
            && target == AppointmentStatus::Cancelled
            && self.protected_window.is_within_protected_window(current.scheduled_at, now)
        {
            warn!("Patient cancellation of {} rejected inside the protected window", appointment_id);
            return Err(AppointmentError::TooLateToCancel { window_hours: self.protected_window.hours() });
        }

        let updated = self
            .bounded("update_appointment", uow.update_appointment(appointment_id, AppointmentPatch::status(target, now)))
            .await?;
        let audit_input = AuditEventInput::for_appointment(AuditAction::Update, actor, Some(&current), &updated)?;
        self.record_audit(uow, audit_input, now).await?;

        Ok(updated)
    }

    /// Move a booked appointment to another free slot.
    #[instrument(skip(self, actor), fields(actor_id = ?actor.id, role = ?actor.role))]
    pub async fn reschedule_appointment(
        &self,
        appointment_id: Uuid,
        new_time: DateTime<Utc>,
        actor: &Actor,
    ) -> Result<Appointment, AppointmentError> {
        debug!("Rescheduling appointment {} to {}", appointment_id, new_time);

        let now = self.clock.now();
        let mut attempt = 1;
        let (updated, old_time) = loop {
            let mut uow = self.begin().await?;
            let outcome = self.reschedule_in(uow.as_mut(), appointment_id, new_time, actor, now).await;
            match self.finish(uow, outcome).await {
                Err(e) if rerun_contended(&e, attempt) => attempt += 1,
                result => break result?,
            }
        };

        info!("Appointment {} moved from {} to {}", updated.id, old_time, updated.scheduled_at);
        self.dispatch(NotificationEvent::rescheduled(&updated, old_time));

        Ok(updated)
    }

    async fn reschedule_in(
        &self,
        uow: &mut dyn UnitOfWork,
        appointment_id: Uuid,
        new_time: DateTime<Utc>,
        actor: &Actor,
        now: DateTime<Utc>,
    ) -> Result<(Appointment, DateTime<Utc>), AppointmentError> {
        let current = self.load(uow, appointment_id, actor).await?;

        self.state_machine.ensure_reschedulable(current.status)?;

        // Window is measured against the slot being given up
        if actor.is_patient() && self.protected_window.is_within_protected_window(current.scheduled_at, now) {
            warn!("Patient reschedule of {} rejected inside the protected window", appointment_id);
            return Err(AppointmentError::TooLateToReschedule { window_hours: self.protected_window.hours() });
        }

        self.slot_policy.validate(new_time, now)?;

        if self
            .bounded("conflict_check", self.conflict_detector.has_conflict(uow, new_time, Some(appointment_id)))
            .await?
        {
            warn!("Cannot move appointment {} to taken slot {}", appointment_id, new_time);
            return Err(AppointmentError::SlotUnavailable);
        }

        let updated = self
            .bounded("update_appointment", uow.update_appointment(appointment_id, AppointmentPatch::reschedule(new_time, now)))
            .await?;
        let audit_input = AuditEventInput::for_appointment(AuditAction::Update, actor, Some(&current), &updated)?;
        self.record_audit(uow, audit_input, now).await?;

        Ok((updated, current.scheduled_at))
    }

    /// Record notes, procedures, evaluation, orthotics and prescriptions for
    /// an appointment. Each changed artifact gets its own audit event.
    #[instrument(skip(self, update, actor), fields(actor_id = ?actor.id, role = ?actor.role))]
    pub async fn record_clinical_update(
        &self,
        appointment_id: Uuid,
        update: ClinicalUpdate,
        actor: &Actor,
    ) -> Result<ClinicalUpdateOutcome, AppointmentError> {
        debug!("Recording clinical update for appointment {}", appointment_id);

        if actor.is_patient() {
            warn!("Patient {:?} attempted a clinical update on {}", actor.id, appointment_id);
            return Err(AppointmentError::Forbidden("Only clinic staff can record clinical updates".to_string()));
        }
        validate_clinical_update(&update)?;

        let now = self.clock.now();
        let mut attempt = 1;
        let outcome = loop {
            let mut uow = self.begin().await?;
            let outcome = self.clinical_update_in(uow.as_mut(), appointment_id, update.clone(), actor, now).await;
            match self.finish(uow, outcome).await {
                Err(e) if rerun_contended(&e, attempt) => attempt += 1,
                result => break result?,
            }
        };

        info!("Clinical update recorded for appointment {} ({} audit event(s))",
              appointment_id, outcome.audit_event_ids.len());

        Ok(outcome)
    }

    async fn clinical_update_in(
        &self,
        uow: &mut dyn UnitOfWork,
        appointment_id: Uuid,
        update: ClinicalUpdate,
        actor: &Actor,
        now: DateTime<Utc>,
    ) -> Result<ClinicalUpdateOutcome, AppointmentError> {
        let current = self.load(uow, appointment_id, actor).await?;
        self.state_machine.ensure_clinically_open(current.status)?;

        let mut audit_event_ids = Vec::new();

        let appointment = if update.touches_appointment() {
            let patch = AppointmentPatch {
                specialist_notes: update.specialist_notes.clone(),
                procedures_performed: update.procedures_performed.clone(),
                ..AppointmentPatch::touch(now)
            };
            let updated = self.bounded("update_appointment", uow.update_appointment(appointment_id, patch)).await?;
            let input = AuditEventInput::for_appointment(AuditAction::Update, actor, Some(&current), &updated)?;
            audit_event_ids.push(self.record_audit(uow, input, now).await?.id);
            updated
        } else {
            current
        };

        let evaluation = match update.evaluation {
            Some(input) => {
                let before = self.bounded("get_evaluation", uow.get_evaluation(appointment_id)).await?;
                let evaluation = Evaluation {
                    appointment_id,
                    findings: input.findings,
                    diagnosis: input.diagnosis,
                    treatment_plan: input.treatment_plan,
                    recorded_by: actor.id,
                    updated_at: now,
                };
                let saved = self.bounded("upsert_evaluation", uow.upsert_evaluation(evaluation)).await?;
                let input = AuditEventInput::for_record(
                    EVALUATIONS_TABLE, appointment_id, appointment_id, upsert_action(&before),
                    actor, before.as_ref(), &saved,
                )?;
                audit_event_ids.push(self.record_audit(uow, input, now).await?.id);
                Some(saved)
            }
            None => None,
        };

        let orthotics_order = match update.orthotics_order {
            Some(input) => {
                let before = self.bounded("get_orthotics_order", uow.get_orthotics_order(appointment_id)).await?;
                let order = OrthoticsOrder {
                    appointment_id,
                    device: input.device,
                    specifications: input.specifications,
                    ordered_by: actor.id,
                    updated_at: now,
                };
                let saved = self.bounded("upsert_orthotics_order", uow.upsert_orthotics_order(order)).await?;
                let input = AuditEventInput::for_record(
                    ORTHOTICS_ORDERS_TABLE, appointment_id, appointment_id, upsert_action(&before),
                    actor, before.as_ref(), &saved,
                )?;
                audit_event_ids.push(self.record_audit(uow, input, now).await?.id);
                Some(saved)
            }
            None => None,
        };

        // Prescriptions are appended, never rewritten
        let mut prescriptions = Vec::with_capacity(update.prescriptions.len());
        for input in update.prescriptions {
            let line = PrescriptionLine {
                id: Uuid::new_v4(),
                appointment_id,
                medication: input.medication,
                dosage: input.dosage,
                instructions: input.instructions,
                prescribed_by: actor.id,
                prescribed_at: now,
            };
            let saved = self.bounded("insert_prescription", uow.insert_prescription(line)).await?;
            let input = AuditEventInput::for_record(
                PRESCRIPTIONS_TABLE, saved.id, appointment_id, AuditAction::Insert,
                actor, None, &saved,
            )?;
            audit_event_ids.push(self.record_audit(uow, input, now).await?.id);
            prescriptions.push(saved);
        }

        Ok(ClinicalUpdateOutcome {
            appointment,
            evaluation,
            orthotics_order,
            prescriptions,
            audit_event_ids,
        })
    }

    /// Read one appointment. Patients only see their own.
    #[instrument(skip(self, actor), fields(actor_id = ?actor.id, role = ?actor.role))]
    pub async fn get_appointment(&self, appointment_id: Uuid, actor: &Actor) -> Result<Appointment, AppointmentError> {
        debug!("Fetching appointment {}", appointment_id);

        let mut uow = self.begin().await?;
        let result = self.load(uow.as_mut(), appointment_id, actor).await;
        uow.rollback().await;

        result.map_err(|e| {
            log_failure("get_appointment", &e);
            e
        })
    }

    async fn load(
        &self,
        uow: &mut dyn UnitOfWork,
        appointment_id: Uuid,
        actor: &Actor,
    ) -> Result<Appointment, AppointmentError> {
        let appointment = self
            .bounded("get_appointment", uow.get_appointment(appointment_id))
            .await?
            .ok_or(AppointmentError::NotFound)?;

        if actor.is_patient() && !appointment.is_owned_by(actor) {
            warn!("Patient {:?} is not the owner of appointment {}", actor.id, appointment_id);
            return Err(AppointmentError::Forbidden("Patients can only access their own appointments".to_string()));
        }

        Ok(appointment)
    }

    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, AppointmentError> {
        self.bounded("begin", self.gateway.begin()).await.map_err(|e| {
            log_failure("begin", &e);
            e
        })
    }

    /// Commit on success, roll back on failure. A failed commit is reported
    /// through the same taxonomy as the checks it backs up.
    async fn finish<T>(
        &self,
        uow: Box<dyn UnitOfWork>,
        outcome: Result<T, AppointmentError>,
    ) -> Result<T, AppointmentError> {
        match outcome {
            Ok(value) => match self.bounded("commit", uow.commit()).await {
                Ok(()) => Ok(value),
                Err(e) => {
                    log_failure("commit", &e);
                    Err(e)
                }
            },
            Err(e) => {
                uow.rollback().await;
                log_failure("operation", &e);
                Err(e)
            }
        }
    }

    async fn record_audit(
        &self,
        uow: &mut dyn UnitOfWork,
        input: AuditEventInput,
        now: DateTime<Utc>,
    ) -> Result<AuditEvent, AppointmentError> {
        match tokio::time::timeout(self.storage_timeout, self.audit.record(uow, input, now)).await {
            Ok(result) => result,
            Err(_) => Err(AppointmentError::AuditWriteFailed(GatewayError::Timeout)),
        }
    }

    /// Bound a storage call by the configured timeout.
    async fn bounded<T, E, F>(&self, operation: &'static str, call: F) -> Result<T, AppointmentError>
    where
        F: Future<Output = Result<T, E>>,
        E: Into<AppointmentError>,
    {
        match tokio::time::timeout(self.storage_timeout, call).await {
            Ok(result) => result.map_err(Into::into),
            Err(_) => {
                error!(operation, timeout_ms = self.storage_timeout.as_millis() as u64, "Storage call timed out");
                Err(AppointmentError::StorageUnavailable(GatewayError::Timeout))
            }
        }
    }

    /// Hand a notification to a detached task. The caller's result never
    /// waits on or depends on delivery.
    fn dispatch(&self, event: NotificationEvent) {
        let notifier = Arc::clone(&self.notifier);
        let timeout = self.notification_timeout;

        tokio::spawn(
            async move {
                match tokio::time::timeout(timeout, notifier.notify(&event)).await {
                    Ok(Ok(())) => debug!("Notification {:?} sent for {}", event.event_type, event.appointment_id),
                    Ok(Err(e)) => warn!("Notification {:?} for {} failed: {}", event.event_type, event.appointment_id, e),
                    Err(_) => warn!("Notification {:?} for {} timed out", event.event_type, event.appointment_id),
                }
            }
            .in_current_span(),
        );
    }
}

/// Rerun a unit that lost a race, up to `MAX_UNIT_ATTEMPTS`. The rerun reads
/// fresh state, so it either succeeds or fails with the business outcome.
fn rerun_contended(err: &AppointmentError, attempt: u32) -> bool {
    let contended = matches!(err, AppointmentError::StorageUnavailable(GatewayError::Contended(_)));
    if contended && attempt < MAX_UNIT_ATTEMPTS {
        warn!(attempt, "Unit of work raced a concurrent change, rerunning");
        true
    } else {
        false
    }
}

fn upsert_action<T>(before: &Option<T>) -> AuditAction {
    if before.is_some() {
        AuditAction::Update
    } else {
        AuditAction::Insert
    }
}

fn validate_clinical_update(update: &ClinicalUpdate) -> Result<(), AppointmentError> {
    if update.is_empty() {
        return Err(AppointmentError::Validation("Clinical update contains no changes".to_string()));
    }
    if let Some(order) = &update.orthotics_order {
        if order.device.trim().is_empty() {
            return Err(AppointmentError::Validation("Orthotics order requires a device".to_string()));
        }
    }
    if update.prescriptions.iter().any(|line| line.medication.trim().is_empty()) {
        return Err(AppointmentError::Validation("Prescription lines require a medication".to_string()));
    }
    Ok(())
}

fn log_failure(operation: &str, err: &AppointmentError) {
    if err.is_transient() {
        let cause = std::error::Error::source(err).map(|source| source.to_string());
        error!(operation, kind = err.kind(), cause = ?cause, "Appointment operation failed: {}", err);
    } else {
        debug!(operation, kind = err.kind(), "Appointment operation rejected: {}", err);
    }
}
