use crate::models::HealthResponse;
use axum::Json;
use tracing::debug;

/// Health check endpoint
pub async fn health_check() -> Json<HealthResponse> {
    debug!("Health check requested");
    Json(HealthResponse {
        status: "ok".to_string(),
        message: "Server is running".to_string(),
    })
}

/// Readiness check endpoint
pub async fn ready_check() -> Json<HealthResponse> {
    debug!("Readiness check requested");
    let (status, message) = match crate::db::dbroom::get_db() {
        Some(_) => ("ok", "Service is ready"),
        None => ("degraded", "Database not initialized"),
    };
    Json(HealthResponse {
        status: status.to_string(),
        message: message.to_string(),
    })
}
