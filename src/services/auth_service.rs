use axum::http::{self, HeaderMap};
use jsonwebtoken::{decode, errors::ErrorKind, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::config;
use crate::models::AuthError;

/// Identity resolved from a validated connection token.
/// Immutable for the lifetime of the connection it is attached to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub username: String,
}

/// Claims carried by a connection token.
#[derive(Debug, Serialize, Deserialize)]
pub struct TokenClaims {
    /// User id
    pub sub: String,
    pub username: String,
    /// Expiry, seconds since epoch
    pub exp: usize,
}

// Get the auth token from request headers: Authorization header first,
// then the auth_token cookie.
pub fn token_from_headers(headers: &HeaderMap) -> Option<String> {
    if let Some(auth_header) = headers.get(http::header::AUTHORIZATION) {
        let auth_str = auth_header.to_str().ok()?;
        return Some(
            auth_str
                .strip_prefix("Bearer ")
                .unwrap_or(auth_str)
                .to_string(),
        );
    }

    let cookie_header = headers.get(http::header::COOKIE)?.to_str().ok()?;
    for cookie in cookie::Cookie::split_parse(cookie_header).flatten() {
        if cookie.name() == "auth_token" {
            return Some(cookie.value().to_string());
        }
    }
    None
}

/// Validate a connection token against a secret and resolve the identity.
pub fn validate_identity(token: &str, secret: &str) -> Result<Identity, AuthError> {
    let validation = Validation::new(Algorithm::HS256);
    let decoding_key = DecodingKey::from_secret(secret.as_bytes());
    match decode::<TokenClaims>(token, &decoding_key, &validation) {
        Ok(token_data) => Ok(Identity {
            user_id: token_data.claims.sub,
            username: token_data.claims.username,
        }),
        Err(e) => match e.kind() {
            ErrorKind::ExpiredSignature => Err(AuthError::Expired),
            _ => Err(AuthError::Invalid),
        },
    }
}

/// Authenticate a connection handshake.
///
/// Runs exactly once per connection, before any room event is processed.
/// The specific failure reason lets the client distinguish "log in again"
/// from "session expired, refresh and retry".
pub fn authenticate(token: Option<String>) -> Result<Identity, AuthError> {
    let token = token.ok_or(AuthError::Missing)?;

    let config = config::get_config();
    let secret = match &config.auth_jwt_secret {
        Some(secret) => secret,
        None => {
            error!("Auth JWT secret not configured, rejecting connection");
            return Err(AuthError::Invalid);
        }
    };

    validate_identity(&token, secret)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &str = "test-secret";

    fn make_token(secret: &str, exp_offset_secs: i64) -> String {
        let exp = (chrono::Utc::now().timestamp() + exp_offset_secs) as usize;
        let claims = TokenClaims {
            sub: "user-1".to_string(),
            username: "ada".to_string(),
            exp,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn valid_token_resolves_identity() {
        let token = make_token(SECRET, 3600);
        let identity = validate_identity(&token, SECRET).unwrap();
        assert_eq!(identity.user_id, "user-1");
        assert_eq!(identity.username, "ada");
    }

    #[test]
    fn expired_token_is_distinguished() {
        let token = make_token(SECRET, -3600);
        assert_eq!(validate_identity(&token, SECRET), Err(AuthError::Expired));
    }

    #[test]
    fn wrong_secret_is_invalid() {
        let token = make_token("other-secret", 3600);
        assert_eq!(validate_identity(&token, SECRET), Err(AuthError::Invalid));
    }

    #[test]
    fn garbage_token_is_invalid() {
        assert_eq!(
            validate_identity("not-a-jwt", SECRET),
            Err(AuthError::Invalid)
        );
    }

    #[test]
    fn missing_token_is_distinguished() {
        assert_eq!(authenticate(None), Err(AuthError::Missing));
    }

    #[test]
    fn token_from_authorization_header() {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::AUTHORIZATION, "Bearer abc.def.ghi".parse().unwrap());
        assert_eq!(token_from_headers(&headers), Some("abc.def.ghi".to_string()));
    }

    #[test]
    fn token_from_cookie_fallback() {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::COOKIE,
            "theme=dark; auth_token=abc.def.ghi".parse().unwrap(),
        );
        assert_eq!(token_from_headers(&headers), Some("abc.def.ghi".to_string()));
    }
}
