use axum::{
    extract::Request,
    http::StatusCode,
    middleware::Next,
    response::Response,
    Json,
};
use tracing::warn;

use crate::models::ErrorResponse;
use crate::services::auth_service;

/// Require a valid bearer token on HTTP routes and attach the resolved
/// identity to the request for downstream handlers.
pub async fn auth_middleware(
    mut req: Request,
    next: Next,
) -> Result<Response, (StatusCode, Json<ErrorResponse>)> {
    let token = auth_service::token_from_headers(req.headers());

    let identity = match auth_service::authenticate(token) {
        Ok(identity) => identity,
        Err(e) => {
            warn!("Request rejected: {}", e);
            return Err(unauthorized(e.reason()));
        }
    };

    req.extensions_mut().insert(identity);
    Ok(next.run(req).await)
}

fn unauthorized(reason: &str) -> (StatusCode, Json<ErrorResponse>) {
    let status = StatusCode::UNAUTHORIZED;
    (
        status,
        Json(ErrorResponse {
            code: status.as_u16(),
            status: status.to_string(),
            error: format!("Unauthorized: {}", reason),
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unauthorized_carries_error_body() {
        let (status, Json(body)) = unauthorized("AUTH_EXPIRED");
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body.code, 401);
        assert_eq!(body.status, StatusCode::UNAUTHORIZED.to_string());
        assert!(body.error.contains("AUTH_EXPIRED"));
    }
}
