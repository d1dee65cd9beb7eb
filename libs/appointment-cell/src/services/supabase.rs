// libs/appointment-cell/src/services/supabase.rs
//
// Persistence gateway over PostgREST. Reads go straight to the REST API with
// the caller's token so row-level security applies. Writes are staged in the
// unit of work and shipped on commit to `commit_appointment_unit`, which
// applies them and appends the audit events in one database transaction.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use shared_database::supabase::{DatabaseError, SupabaseClient};
use tracing::{debug, error};
use uuid::Uuid;

use crate::error::GatewayError;
use crate::models::{
    Appointment, AppointmentPatch, AuditEvent, Evaluation, OrthoticsOrder, PrescriptionLine,
    APPOINTMENTS_TABLE, AUDIT_EVENTS_TABLE, EVALUATIONS_TABLE, ORTHOTICS_ORDERS_TABLE,
    PRESCRIPTIONS_TABLE,
};
use crate::services::gateway::{GatewayProvider, PersistenceGateway, UnitOfWork};

pub const COMMIT_FUNCTION: &str = "commit_appointment_unit";

/// Raised by the commit function when an audit insert fails.
pub const AUDIT_REJECTED_STATE: &str = "AUD01";
/// Raised by the commit function when the audit chain moved since it was read.
pub const CHAIN_TIP_MOVED_STATE: &str = "AUD02";
/// Raised by the commit function when a row changed since the unit read it.
pub const STALE_ROW_STATE: &str = "APP01";

impl From<DatabaseError> for GatewayError {
    fn from(err: DatabaseError) -> Self {
        if err.is_unique_violation() {
            return GatewayError::SlotTaken;
        }
        match err.sql_state() {
            Some(AUDIT_REJECTED_STATE) => return GatewayError::AuditRejected(err.to_string()),
            Some(CHAIN_TIP_MOVED_STATE) | Some(STALE_ROW_STATE) => return GatewayError::Contended(err.to_string()),
            _ => {}
        }
        match err {
            DatabaseError::Timeout => GatewayError::Timeout,
            DatabaseError::NotFound(msg) => GatewayError::RecordNotFound(msg),
            DatabaseError::Decode(msg) => GatewayError::Corrupt(msg),
            other => GatewayError::Unavailable(other.to_string()),
        }
    }
}

fn to_row<T: Serialize>(row: &T) -> Result<Value, GatewayError> {
    serde_json::to_value(row).map_err(|e| GatewayError::Corrupt(e.to_string()))
}

/// Timestamp in the form PostgREST filters accept without URL escaping.
fn filter_timestamp(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

pub struct SupabaseGateway {
    client: Arc<SupabaseClient>,
    auth_token: String,
}

impl SupabaseGateway {
    pub fn new(client: Arc<SupabaseClient>, auth_token: impl Into<String>) -> Self {
        Self { client, auth_token: auth_token.into() }
    }
}

#[async_trait]
impl PersistenceGateway for SupabaseGateway {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, GatewayError> {
        Ok(Box::new(SupabaseUnitOfWork {
            client: Arc::clone(&self.client),
            auth_token: self.auth_token.clone(),
            writes: Vec::new(),
            appointments: Vec::new(),
            evaluations: Vec::new(),
            orthotics_orders: Vec::new(),
            audit_events: Vec::new(),
            read_appointments: HashMap::new(),
            read_evaluations: HashMap::new(),
            read_orthotics_orders: HashMap::new(),
            observed_tip: None,
        }))
    }
}

/// Builds a token-scoped gateway per request.
pub struct SupabaseGatewayProvider {
    client: Arc<SupabaseClient>,
}

impl SupabaseGatewayProvider {
    pub fn new(client: Arc<SupabaseClient>) -> Self {
        Self { client }
    }
}

impl GatewayProvider for SupabaseGatewayProvider {
    fn gateway_for(&self, auth_token: &str) -> Arc<dyn PersistenceGateway> {
        Arc::new(SupabaseGateway::new(Arc::clone(&self.client), auth_token))
    }
}

/// One write for the commit function. `expected` carries the version of the
/// row this unit read; the commit refuses the write if the stored row differs.
#[derive(Debug, Clone, Serialize)]
struct StagedWrite {
    table: &'static str,
    op: &'static str,
    row: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    expected: Option<Value>,
}

pub struct SupabaseUnitOfWork {
    client: Arc<SupabaseClient>,
    auth_token: String,
    writes: Vec<StagedWrite>,
    // Latest staged version of each touched row, read back before the store.
    appointments: Vec<Appointment>,
    evaluations: Vec<Evaluation>,
    orthotics_orders: Vec<OrthoticsOrder>,
    audit_events: Vec<AuditEvent>,
    // Rows as first read from the store, so every check in the unit sees one version.
    read_appointments: HashMap<Uuid, Option<Appointment>>,
    read_evaluations: HashMap<Uuid, Option<Evaluation>>,
    read_orthotics_orders: HashMap<Uuid, Option<OrthoticsOrder>>,
    /// Chain tip read from the store; `Some(None)` means the log was empty.
    observed_tip: Option<Option<String>>,
}

impl SupabaseUnitOfWork {
    async fn select<T: DeserializeOwned>(&self, path: String) -> Result<Vec<T>, GatewayError> {
        self.client
            .request::<Vec<T>>(Method::GET, &path, Some(&self.auth_token), None)
            .await
            .map_err(|e| {
                error!("Gateway read failed for {}: {}", path, e);
                GatewayError::from(e)
            })
    }

    fn stage<T: Serialize>(
        &mut self,
        table: &'static str,
        op: &'static str,
        row: &T,
        expected: Option<Value>,
    ) -> Result<(), GatewayError> {
        let row = to_row(row)?;
        self.writes.push(StagedWrite { table, op, row, expected });
        Ok(())
    }

    /// Replace the row of a write already staged for `key`, keeping its guard.
    fn restage<T: Serialize>(&mut self, table: &str, key: &str, id: Uuid, row: &T) -> Result<bool, GatewayError> {
        let keyed = json!(id);
        match self.writes.iter_mut().find(|w| w.table == table && w.row[key] == keyed) {
            Some(write) => {
                write.row = to_row(row)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn stored_appointment(&mut self, id: Uuid) -> Result<Option<Appointment>, GatewayError> {
        if let Some(row) = self.read_appointments.get(&id) {
            return Ok(row.clone());
        }
        let path = format!("/rest/v1/{}?id=eq.{}&limit=1", APPOINTMENTS_TABLE, id);
        let rows: Vec<Appointment> = self.select(path).await?;
        let row = rows.into_iter().next();
        self.read_appointments.insert(id, row.clone());
        Ok(row)
    }

    async fn stored_evaluation(&mut self, appointment_id: Uuid) -> Result<Option<Evaluation>, GatewayError> {
        if let Some(row) = self.read_evaluations.get(&appointment_id) {
            return Ok(row.clone());
        }
        let path = format!("/rest/v1/{}?appointment_id=eq.{}&limit=1", EVALUATIONS_TABLE, appointment_id);
        let rows: Vec<Evaluation> = self.select(path).await?;
        let row = rows.into_iter().next();
        self.read_evaluations.insert(appointment_id, row.clone());
        Ok(row)
    }

    async fn stored_orthotics_order(&mut self, appointment_id: Uuid) -> Result<Option<OrthoticsOrder>, GatewayError> {
        if let Some(row) = self.read_orthotics_orders.get(&appointment_id) {
            return Ok(row.clone());
        }
        let path = format!("/rest/v1/{}?appointment_id=eq.{}&limit=1", ORTHOTICS_ORDERS_TABLE, appointment_id);
        let rows: Vec<OrthoticsOrder> = self.select(path).await?;
        let row = rows.into_iter().next();
        self.read_orthotics_orders.insert(appointment_id, row.clone());
        Ok(row)
    }

    fn staged_appointment(&self, id: Uuid) -> Option<&Appointment> {
        self.appointments.iter().rev().find(|row| row.id == id)
    }

    fn remember_appointment(&mut self, appointment: Appointment) {
        self.appointments.retain(|row| row.id != appointment.id);
        self.appointments.push(appointment);
    }
}

#[async_trait]
impl UnitOfWork for SupabaseUnitOfWork {
    async fn find_active_appointments_at(&mut self, time: DateTime<Utc>) -> Result<Vec<Appointment>, GatewayError> {
        let path = format!(
            "/rest/v1/{}?scheduled_at=eq.{}&status=in.(booked,completed)",
            APPOINTMENTS_TABLE,
            filter_timestamp(time)
        );
        let stored: Vec<Appointment> = self.select(path).await?;

        let mut visible: Vec<Appointment> = stored
            .into_iter()
            .filter(|row| self.staged_appointment(row.id).is_none())
            .collect();
        visible.extend(self.appointments.iter().cloned());
        visible.retain(|row| row.occupies_slot() && row.scheduled_at == time);

        Ok(visible)
    }

    async fn get_appointment(&mut self, id: Uuid) -> Result<Option<Appointment>, GatewayError> {
        if let Some(row) = self.staged_appointment(id) {
            return Ok(Some(row.clone()));
        }
        self.stored_appointment(id).await
    }

    async fn insert_appointment(&mut self, appointment: Appointment) -> Result<Appointment, GatewayError> {
        self.stage(APPOINTMENTS_TABLE, "insert", &appointment, None)?;
        self.remember_appointment(appointment.clone());
        Ok(appointment)
    }

    async fn update_appointment(&mut self, id: Uuid, patch: AppointmentPatch) -> Result<Appointment, GatewayError> {
        let mut row = self
            .get_appointment(id)
            .await?
            .ok_or_else(|| GatewayError::RecordNotFound(format!("appointment {}", id)))?;
        // Guard on the version first read, before any patch from this unit.
        let expected = json!({ "updated_at": row.updated_at, "status": row.status });
        row.apply(&patch);

        // A row already staged in this unit (insert or update) keeps its write.
        if !self.restage(APPOINTMENTS_TABLE, "id", id, &row)? {
            self.stage(APPOINTMENTS_TABLE, "update", &row, Some(expected))?;
        }

        self.remember_appointment(row.clone());
        Ok(row)
    }

    async fn get_evaluation(&mut self, appointment_id: Uuid) -> Result<Option<Evaluation>, GatewayError> {
        if let Some(row) = self.evaluations.iter().rev().find(|row| row.appointment_id == appointment_id) {
            return Ok(Some(row.clone()));
        }
        self.stored_evaluation(appointment_id).await
    }

    async fn upsert_evaluation(&mut self, evaluation: Evaluation) -> Result<Evaluation, GatewayError> {
        let id = evaluation.appointment_id;
        if !self.restage(EVALUATIONS_TABLE, "appointment_id", id, &evaluation)? {
            let stored = self.stored_evaluation(id).await?;
            let expected = json!({ "updated_at": stored.map(|row| row.updated_at) });
            self.stage(EVALUATIONS_TABLE, "upsert", &evaluation, Some(expected))?;
        }
        self.evaluations.push(evaluation.clone());
        Ok(evaluation)
    }

    async fn get_orthotics_order(&mut self, appointment_id: Uuid) -> Result<Option<OrthoticsOrder>, GatewayError> {
        if let Some(row) = self.orthotics_orders.iter().rev().find(|row| row.appointment_id == appointment_id) {
            return Ok(Some(row.clone()));
        }
        self.stored_orthotics_order(appointment_id).await
    }

    async fn upsert_orthotics_order(&mut self, order: OrthoticsOrder) -> Result<OrthoticsOrder, GatewayError> {
        let id = order.appointment_id;
        if !self.restage(ORTHOTICS_ORDERS_TABLE, "appointment_id", id, &order)? {
            let stored = self.stored_orthotics_order(id).await?;
            let expected = json!({ "updated_at": stored.map(|row| row.updated_at) });
            self.stage(ORTHOTICS_ORDERS_TABLE, "upsert", &order, Some(expected))?;
        }
        self.orthotics_orders.push(order.clone());
        Ok(order)
    }

    async fn insert_prescription(&mut self, line: PrescriptionLine) -> Result<PrescriptionLine, GatewayError> {
        self.stage(PRESCRIPTIONS_TABLE, "insert", &line, None)?;
        Ok(line)
    }

    async fn latest_audit_hash(&mut self) -> Result<Option<String>, GatewayError> {
        if let Some(event) = self.audit_events.last() {
            return Ok(Some(event.hash.clone()));
        }
        if let Some(tip) = &self.observed_tip {
            return Ok(tip.clone());
        }

        #[derive(serde::Deserialize)]
        struct HashRow {
            hash: String,
        }

        let path = format!("/rest/v1/{}?select=hash&order=seq.desc&limit=1", AUDIT_EVENTS_TABLE);
        let rows: Vec<HashRow> = self.select(path).await?;
        let tip = rows.into_iter().next().map(|row| row.hash);
        self.observed_tip = Some(tip.clone());
        Ok(tip)
    }

    async fn append_audit_event(&mut self, event: AuditEvent) -> Result<(), GatewayError> {
        self.audit_events.push(event);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), GatewayError> {
        if self.writes.is_empty() && self.audit_events.is_empty() {
            return Ok(());
        }

        debug!("Committing {} write(s) and {} audit event(s) through {}",
               self.writes.len(), self.audit_events.len(), COMMIT_FUNCTION);

        let args = json!({
            "p_writes": self.writes,
            "p_audit_events": self.audit_events,
            "p_expected_tip": self.observed_tip.clone().flatten(),
        });

        self.client
            .rpc::<Value>(COMMIT_FUNCTION, args, Some(&self.auth_token))
            .await
            .map_err(|e| {
                error!("Unit of work commit failed: {}", e);
                GatewayError::from(e)
            })?;

        Ok(())
    }

    async fn rollback(self: Box<Self>) {
        debug!("Discarding {} staged write(s) and {} audit event(s)",
               self.writes.len(), self.audit_events.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use chrono::TimeZone;

    #[test]
    fn test_database_errors_map_to_gateway_errors() {
        let unique = DatabaseError::Constraint { code: "23505".into(), message: "duplicate key".into() };
        assert_matches!(GatewayError::from(unique), GatewayError::SlotTaken);

        let audit = DatabaseError::Api { status: 400, code: Some("AUD01".into()), message: "audit".into() };
        assert_matches!(GatewayError::from(audit), GatewayError::AuditRejected(_));

        let moved = DatabaseError::Api { status: 400, code: Some("AUD02".into()), message: "tip".into() };
        assert_matches!(GatewayError::from(moved), GatewayError::Contended(_));

        let stale = DatabaseError::Api { status: 400, code: Some("APP01".into()), message: "row".into() };
        assert_matches!(GatewayError::from(stale), GatewayError::Contended(_));

        assert_matches!(GatewayError::from(DatabaseError::Timeout), GatewayError::Timeout);
        assert_matches!(GatewayError::from(DatabaseError::Decode("bad".into())), GatewayError::Corrupt(_));
    }

    #[test]
    fn test_filter_timestamp_has_no_offset_sign() {
        let time = Utc.with_ymd_and_hms(2025, 3, 10, 14, 0, 0).unwrap();
        assert_eq!(filter_timestamp(time), "2025-03-10T14:00:00Z");
    }
}
