use axum::{routing::get, Router};

use appointment_cell::handlers::AppointmentState;
use appointment_cell::router::appointment_routes;

pub fn create_router(state: AppointmentState) -> Router {
    Router::new()
        .route("/", get(|| async { "Clinic scheduling API is running!" }))
        .nest("/appointments", appointment_routes(state))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use appointment_cell::services::{InMemoryGateway, SystemClock, TracingNotifier};
    use axum::{body::Body, http::{Request, StatusCode}};
    use shared_config::{AppConfig, SchedulingConfig};
    use tower::ServiceExt;

    fn state() -> AppointmentState {
        let config = AppConfig {
            supabase_url: String::new(),
            supabase_anon_key: String::new(),
            supabase_jwt_secret: "secret".to_string(),
            api_port: 0,
            scheduling: SchedulingConfig::default(),
        };
        AppointmentState::new(
            Arc::new(config),
            Arc::new(InMemoryGateway::new()),
            Arc::new(SystemClock),
            Arc::new(TracingNotifier),
        )
    }

    #[tokio::test]
    async fn test_root_is_public() {
        let response = create_router(state())
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_appointments_require_a_token() {
        let uri = format!("/appointments/{}", uuid_like());
        let response = create_router(state())
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    fn uuid_like() -> &'static str {
        "5f0c3c1e-8f5a-4d7e-9c1b-2a3b4c5d6e7f"
    }
}
