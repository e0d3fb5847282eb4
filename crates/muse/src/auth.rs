//! Caller authentication.
//!
//! Two credentials are accepted, checked in order: a static service key in
//! the `apikey` header, or `Authorization: Bearer <jwt>` validated against
//! the configured HS256 secret. Requests carrying neither are rejected with
//! 401 before any other work happens.

use axum::{
    Json,
    extract::FromRequestParts,
    http::{StatusCode, header::AUTHORIZATION, request::Parts},
    response::{IntoResponse, Response},
};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::api::state::AppState;
use crate::settings::AuthSettings;

/// Identity the `apikey` header resolves to. Uploaded rows attributed to a
/// service key carry this id rather than a real user.
const SERVICE_IDENTITY: &str = "service";

/// Authentication errors.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing credentials: provide a bearer token or apikey header")]
    MissingCredentials,

    #[error("invalid authorization header format")]
    InvalidAuthHeader,

    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("invalid api key")]
    InvalidApiKey,

    #[error("internal auth error: {0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
struct AuthErrorResponse {
    error: String,
    error_code: &'static str,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, error_code) = match &self {
            AuthError::MissingCredentials => (StatusCode::UNAUTHORIZED, "missing_credentials"),
            AuthError::InvalidAuthHeader => (StatusCode::UNAUTHORIZED, "invalid_auth_header"),
            AuthError::InvalidToken(_) => (StatusCode::UNAUTHORIZED, "invalid_token"),
            AuthError::InvalidApiKey => (StatusCode::UNAUTHORIZED, "invalid_api_key"),
            AuthError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };

        let body = Json(AuthErrorResponse {
            error: self.to_string(),
            error_code,
        });

        (status, body).into_response()
    }
}

/// JWT claims expected on caller tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: i64,
}

/// Validated caller identity, injected into handlers as an extractor.
#[derive(Debug, Clone)]
pub struct CurrentUser {
    id: String,
}

impl CurrentUser {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_service(&self) -> bool {
        self.id == SERVICE_IDENTITY
    }
}

/// Validation state derived from [`AuthSettings`] at startup.
#[derive(Clone)]
pub struct AuthState {
    api_keys: Vec<String>,
    decoding_key: Option<DecodingKey>,
}

impl AuthState {
    pub fn new(settings: &AuthSettings) -> Self {
        let decoding_key = settings
            .jwt_secret
            .as_ref()
            .map(|s| DecodingKey::from_secret(s.as_bytes()));

        Self {
            api_keys: settings.api_keys.clone(),
            decoding_key,
        }
    }

    /// Validate an `apikey` header value against the configured keys.
    fn validate_api_key(&self, key: &str) -> Result<CurrentUser, AuthError> {
        if self.api_keys.iter().any(|k| k == key) {
            Ok(CurrentUser {
                id: SERVICE_IDENTITY.to_string(),
            })
        } else {
            Err(AuthError::InvalidApiKey)
        }
    }

    /// Validate a bearer JWT and extract the caller identity.
    fn validate_token(&self, token: &str) -> Result<CurrentUser, AuthError> {
        let decoding_key = self
            .decoding_key
            .as_ref()
            .ok_or_else(|| AuthError::Internal("no JWT secret configured".to_string()))?;

        let validation = Validation::new(Algorithm::HS256);
        let data = decode::<Claims>(token, decoding_key, &validation)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))?;

        debug!(user_id = %data.claims.sub, "authenticated bearer token");
        Ok(CurrentUser {
            id: data.claims.sub,
        })
    }
}

/// Extract a Bearer token from an Authorization header value.
fn bearer_token_from_header(header_value: &str) -> Result<&str, AuthError> {
    let mut parts = header_value.split_whitespace();
    let scheme = parts.next().ok_or(AuthError::InvalidAuthHeader)?;

    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AuthError::InvalidAuthHeader);
    }

    let token = parts.next().ok_or(AuthError::InvalidAuthHeader)?;
    if token.is_empty() || parts.next().is_some() {
        return Err(AuthError::InvalidAuthHeader);
    }

    Ok(token)
}

impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = AuthError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        if let Some(key) = parts.headers.get("apikey").and_then(|h| h.to_str().ok()) {
            return state.auth.validate_api_key(key);
        }

        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|h| h.to_str().ok())
            .ok_or(AuthError::MissingCredentials)?;

        let token = bearer_token_from_header(header)?;
        state.auth.validate_token(token)
    }
}
