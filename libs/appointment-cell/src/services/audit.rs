// libs/appointment-cell/src/services/audit.rs
//
// Append-only, hash-chained audit trail for every appointment mutation.
// Each event stores the hash of its predecessor, so rewriting or removing
// any past event breaks every hash after it.

use chrono::{DateTime, SubsecRound, Utc};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{error, info};
use uuid::Uuid;

use crate::error::{AppointmentError, AuditChainError, GatewayError};
use crate::models::{
    Actor, Appointment, AuditAction, AuditEvent, AuditEventInput, APPOINTMENTS_TABLE,
};
use crate::services::gateway::UnitOfWork;

#[derive(Debug, Default, Clone, Copy)]
pub struct AuditTrailRecorder;

impl AuditTrailRecorder {
    pub fn new() -> Self {
        Self
    }

    /// Seal `input` onto the end of the chain and append it inside `uow`.
    ///
    /// Any failure is reported as `AuditWriteFailed` so the enclosing
    /// operation rolls back instead of committing an unaudited change.
    pub async fn record(
        &self,
        uow: &mut dyn UnitOfWork,
        input: AuditEventInput,
        occurred_at: DateTime<Utc>,
    ) -> Result<AuditEvent, AppointmentError> {
        let previous_hash = uow.latest_audit_hash().await.map_err(|e| {
            error!(table = %input.table, record_id = %input.record_id, error = %e,
                   "Failed to read audit chain tip");
            AppointmentError::AuditWriteFailed(e)
        })?;

        let event = seal(input, previous_hash, occurred_at)
            .map_err(|e| AppointmentError::AuditWriteFailed(GatewayError::Corrupt(e.to_string())))?;

        uow.append_audit_event(event.clone()).await.map_err(|e| {
            error!(event_id = %event.id, table = %event.table, record_id = %event.record_id,
                   error = %e, "Audit append failed");
            AppointmentError::AuditWriteFailed(e)
        })?;

        info!(
            event_id = %event.id,
            table = %event.table,
            record_id = %event.record_id,
            action = ?event.action,
            actor_id = ?event.actor_id,
            actor = %event.actor_display_name,
            "AUDIT: staged {:?} on {}", event.action, event.table
        );

        Ok(event)
    }
}

impl AuditEventInput {
    pub fn for_record<T: Serialize>(
        table: &str,
        record_id: Uuid,
        appointment_id: Uuid,
        action: AuditAction,
        actor: &Actor,
        before: Option<&T>,
        after: &T,
    ) -> Result<Self, AppointmentError> {
        Ok(Self {
            table: table.to_string(),
            record_id,
            appointment_id: Some(appointment_id),
            action,
            actor_id: actor.id,
            actor_display_name: actor.display_name.clone(),
            before: before.map(snapshot).transpose()?,
            after: snapshot(after)?,
        })
    }

    pub fn for_appointment(
        action: AuditAction,
        actor: &Actor,
        before: Option<&Appointment>,
        after: &Appointment,
    ) -> Result<Self, AppointmentError> {
        Self::for_record(APPOINTMENTS_TABLE, after.id, after.id, action, actor, before, after)
    }
}

fn snapshot<T: Serialize>(value: &T) -> Result<Value, AppointmentError> {
    serde_json::to_value(value)
        .map_err(|e| AppointmentError::AuditWriteFailed(GatewayError::Corrupt(e.to_string())))
}

#[derive(Serialize)]
struct ChainedContent<'a> {
    previous_hash: Option<&'a str>,
    id: Uuid,
    table: &'a str,
    record_id: Uuid,
    appointment_id: Option<Uuid>,
    action: AuditAction,
    actor_id: Option<Uuid>,
    actor_display_name: &'a str,
    before: Option<&'a Value>,
    after: &'a Value,
    occurred_at: DateTime<Utc>,
}

/// SHA-256 over the predecessor hash and the event's content, hex encoded.
pub fn compute_hash(event: &AuditEvent) -> Result<String, serde_json::Error> {
    let content = ChainedContent {
        previous_hash: event.previous_hash.as_deref(),
        id: event.id,
        table: &event.table,
        record_id: event.record_id,
        appointment_id: event.appointment_id,
        action: event.action,
        actor_id: event.actor_id,
        actor_display_name: &event.actor_display_name,
        before: event.before.as_ref(),
        after: &event.after,
        occurred_at: event.occurred_at,
    };

    let bytes = serde_json::to_vec(&content)?;
    Ok(format!("{:x}", Sha256::digest(&bytes)))
}

/// Turn an input into a chained event. Timestamps are truncated to
/// microseconds, the precision the relational store keeps.
pub fn seal(
    input: AuditEventInput,
    previous_hash: Option<String>,
    occurred_at: DateTime<Utc>,
) -> Result<AuditEvent, serde_json::Error> {
    let mut event = AuditEvent {
        id: Uuid::new_v4(),
        table: input.table,
        record_id: input.record_id,
        appointment_id: input.appointment_id,
        action: input.action,
        actor_id: input.actor_id,
        actor_display_name: input.actor_display_name,
        before: input.before,
        after: input.after,
        occurred_at: occurred_at.trunc_subsecs(6),
        previous_hash,
        hash: String::new(),
    };
    event.hash = compute_hash(&event)?;
    Ok(event)
}

/// Verify that `events`, in append order, form an unbroken chain.
pub fn verify_chain(events: &[AuditEvent]) -> Result<(), AuditChainError> {
    let mut expected_previous: Option<&str> = events
        .first()
        .and_then(|first| first.previous_hash.as_deref());

    for (index, event) in events.iter().enumerate() {
        if event.previous_hash.as_deref() != expected_previous {
            return Err(AuditChainError::BrokenLink { index, id: event.id });
        }

        match compute_hash(event) {
            Ok(hash) if hash == event.hash => {}
            _ => return Err(AuditChainError::HashMismatch { index, id: event.id }),
        }

        expected_previous = Some(event.hash.as_str());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn input(n: u32) -> AuditEventInput {
        AuditEventInput {
            table: APPOINTMENTS_TABLE.to_string(),
            record_id: Uuid::new_v4(),
            appointment_id: None,
            action: AuditAction::Update,
            actor_id: Some(Uuid::new_v4()),
            actor_display_name: "Dr. Paz".to_string(),
            before: Some(json!({ "status": "booked" })),
            after: json!({ "status": "completed", "n": n }),
        }
    }

    fn chain(len: u32) -> Vec<AuditEvent> {
        let at = Utc.with_ymd_and_hms(2025, 3, 10, 14, 0, 0).unwrap();
        let mut events: Vec<AuditEvent> = Vec::new();
        for n in 0..len {
            let previous = events.last().map(|e| e.hash.clone());
            events.push(seal(input(n), previous, at).unwrap());
        }
        events
    }

    #[test]
    fn test_sealed_chain_verifies() {
        let events = chain(4);
        assert!(events[0].previous_hash.is_none());
        assert_eq!(events[1].previous_hash.as_deref(), Some(events[0].hash.as_str()));
        assert_eq!(verify_chain(&events), Ok(()));
    }

    #[test]
    fn test_edited_snapshot_is_detected() {
        let mut events = chain(3);
        events[1].after = json!({ "status": "cancelled" });
        assert_eq!(
            verify_chain(&events),
            Err(AuditChainError::HashMismatch { index: 1, id: events[1].id })
        );
    }

    #[test]
    fn test_removed_event_is_detected() {
        let mut events = chain(3);
        let removed = events.remove(1);
        assert_ne!(removed.id, events[1].id);
        assert_eq!(
            verify_chain(&events),
            Err(AuditChainError::BrokenLink { index: 1, id: events[1].id })
        );
    }

    #[test]
    fn test_actor_name_is_captured_at_write_time() {
        let appointment_id = Uuid::new_v4();
        let mut actor = Actor::admin(Uuid::new_v4(), "Reception Desk");
        let sealed = AuditEventInput::for_record(
            APPOINTMENTS_TABLE, appointment_id, appointment_id, AuditAction::Insert,
            &actor, None, &json!({ "id": appointment_id }),
        ).unwrap();

        actor.display_name = "Renamed".to_string();
        assert_eq!(sealed.actor_display_name, "Reception Desk");
        assert_eq!(sealed.appointment_id, Some(appointment_id));
    }
}
