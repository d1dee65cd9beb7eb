// libs/appointment-cell/src/handlers.rs
use std::sync::Arc;

use axum::{
    extract::{Extension, Path, State},
    http::StatusCode,
    Json,
};
use serde_json::{json, Value};
use tracing::warn;
use uuid::Uuid;

use shared_config::AppConfig;
use shared_models::auth::User;
use shared_models::error::AppError;
use shared_utils::extractor::AuthContext;

use crate::error::AppointmentError;
use crate::models::{
    Actor, ActorRole, ChangeStatusRequest, ClinicalUpdate, CreateAppointmentRequest,
    RescheduleAppointmentRequest,
};
use crate::services::booking::AppointmentBookingService;
use crate::services::clock::Clock;
use crate::services::gateway::GatewayProvider;
use crate::services::notification::NotificationDispatcher;

/// Shared state behind the appointment routes.
#[derive(Clone)]
pub struct AppointmentState {
    pub config: Arc<AppConfig>,
    pub gateways: Arc<dyn GatewayProvider>,
    pub clock: Arc<dyn Clock>,
    pub notifier: Arc<dyn NotificationDispatcher>,
}

impl AppointmentState {
    pub fn new(
        config: Arc<AppConfig>,
        gateways: Arc<dyn GatewayProvider>,
        clock: Arc<dyn Clock>,
        notifier: Arc<dyn NotificationDispatcher>,
    ) -> Self {
        Self { config, gateways, clock, notifier }
    }

    /// Booking service whose storage calls run under the caller's token.
    pub fn booking_service(&self, auth_token: &str) -> AppointmentBookingService {
        AppointmentBookingService::new(
            self.gateways.gateway_for(auth_token),
            Arc::clone(&self.clock),
            Arc::clone(&self.notifier),
            &self.config.scheduling,
        )
    }
}

/// Resolve the authenticated user into the actor recorded on audit events.
/// Unrecognised roles get patient rights.
pub fn actor_from_user(user: &User) -> Result<Actor, AppError> {
    let id = Uuid::parse_str(&user.id)
        .map_err(|_| AppError::Auth("Token subject is not a valid user id".to_string()))?;

    let role = user
        .role
        .as_deref()
        .and_then(ActorRole::from_claim)
        .unwrap_or_else(|| {
            warn!("Unrecognised role {:?} for user {}, treating as patient", user.role, user.id);
            ActorRole::Patient
        });

    Ok(Actor::new(id, user.display_name(), role))
}

impl From<AppointmentError> for AppError {
    fn from(err: AppointmentError) -> Self {
        let code = err.kind();
        let message = err.to_string();
        match err {
            AppointmentError::NotFound => AppError::NotFound(message),
            AppointmentError::SlotUnavailable
            | AppointmentError::InvalidTransition { .. }
            | AppointmentError::NotReschedulable(_)
            | AppointmentError::AppointmentClosed => AppError::Conflict { code, message },
            AppointmentError::TooLateToCancel { .. }
            | AppointmentError::TooLateToReschedule { .. }
            | AppointmentError::Forbidden(_) => AppError::Forbidden { code, message },
            AppointmentError::Validation(detail) => AppError::Validation(detail),
            AppointmentError::StorageUnavailable(_) | AppointmentError::AuditWriteFailed(_) => {
                AppError::Unavailable { code, message }
            }
        }
    }
}

#[axum::debug_handler]
pub async fn create_appointment(
    State(state): State<AppointmentState>,
    Extension(auth): Extension<AuthContext>,
    Json(request): Json<CreateAppointmentRequest>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let actor = actor_from_user(&auth.user)?;

    let appointment = state
        .booking_service(&auth.token)
        .create_appointment(request, &actor)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "appointment": appointment,
            "message": "Appointment booked successfully"
        })),
    ))
}

#[axum::debug_handler]
pub async fn get_appointment(
    State(state): State<AppointmentState>,
    Extension(auth): Extension<AuthContext>,
    Path(appointment_id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    let actor = actor_from_user(&auth.user)?;

    let appointment = state
        .booking_service(&auth.token)
        .get_appointment(appointment_id, &actor)
        .await?;

    Ok(Json(json!({ "appointment": appointment })))
}

#[axum::debug_handler]
pub async fn change_status(
    State(state): State<AppointmentState>,
    Extension(auth): Extension<AuthContext>,
    Path(appointment_id): Path<Uuid>,
    Json(request): Json<ChangeStatusRequest>,
) -> Result<Json<Value>, AppError> {
    let actor = actor_from_user(&auth.user)?;

    let appointment = state
        .booking_service(&auth.token)
        .change_status(appointment_id, request.status, &actor)
        .await?;

    Ok(Json(json!({
        "success": true,
        "appointment": appointment,
        "message": format!("Appointment {}", appointment.status)
    })))
}

#[axum::debug_handler]
pub async fn reschedule_appointment(
    State(state): State<AppointmentState>,
    Extension(auth): Extension<AuthContext>,
    Path(appointment_id): Path<Uuid>,
    Json(request): Json<RescheduleAppointmentRequest>,
) -> Result<Json<Value>, AppError> {
    let actor = actor_from_user(&auth.user)?;

    let appointment = state
        .booking_service(&auth.token)
        .reschedule_appointment(appointment_id, request.new_time, &actor)
        .await?;

    Ok(Json(json!({
        "success": true,
        "appointment": appointment,
        "message": "Appointment rescheduled successfully"
    })))
}

#[axum::debug_handler]
pub async fn record_clinical_update(
    State(state): State<AppointmentState>,
    Extension(auth): Extension<AuthContext>,
    Path(appointment_id): Path<Uuid>,
    Json(update): Json<ClinicalUpdate>,
) -> Result<Json<Value>, AppError> {
    let actor = actor_from_user(&auth.user)?;

    let outcome = state
        .booking_service(&auth.token)
        .record_clinical_update(appointment_id, update, &actor)
        .await?;

    Ok(Json(json!({
        "success": true,
        "outcome": outcome
    })))
}
