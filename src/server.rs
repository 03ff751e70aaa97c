//! HTTP surface for the upstream event source and the scheduler/form
//! callbacks.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tracing::debug;
use uuid::Uuid;

use crate::automation::orchestrator::{InboundEvent, Orchestrator};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

/// Build the Axum router with the automation endpoints.
pub fn automation_routes(orchestrator: Arc<Orchestrator>) -> Router {
    let state = AppState { orchestrator };

    Router::new()
        .route("/health", get(health))
        .route("/api/events", post(handle_event))
        .route("/api/states/{id}/resume", post(resume_state))
        .route("/api/states/{id}/form", post(complete_form))
        .layer(ServiceBuilder::new().layer(CorsLayer::permissive()))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "autoflow"
    }))
}

/// Always 200: automation failures are reported in the outcome body and
/// never bounce the upstream message.
async fn handle_event(
    State(state): State<AppState>,
    Json(event): Json<InboundEvent>,
) -> impl IntoResponse {
    debug!(
        workspace_id = %event.workspace_id,
        phone_number = %event.phone_number,
        "Inbound event received"
    );
    let outcome = state.orchestrator.handle_inbound(&event).await;
    Json(outcome)
}

async fn resume_state(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    match Uuid::parse_str(&id) {
        Ok(id) => {
            let outcome = state.orchestrator.resume(id).await;
            (StatusCode::OK, Json(serde_json::json!(outcome)))
        }
        Err(_) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "Invalid state ID"})),
        ),
    }
}

async fn complete_form(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(fields): Json<serde_json::Map<String, serde_json::Value>>,
) -> impl IntoResponse {
    match Uuid::parse_str(&id) {
        Ok(id) => {
            let outcome = state.orchestrator.complete_subflow(id, fields).await;
            (StatusCode::OK, Json(serde_json::json!(outcome)))
        }
        Err(_) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "Invalid state ID"})),
        ),
    }
}
