//! HTTP surface of the credential authority
//!
//! Internal listener; bind it to loopback or a private network.
//!
//! - `/auth/claims/*` is open: it only validates credentials.
//! - `/auth/token/*` issues credentials and requires the configured service
//!   key as a bearer token. Without a configured key it refuses every caller.
//! - `/things` registration and removal require an admin credential as a
//!   bearer token. Admin credentials come from the token route above or from
//!   `thingbus token admin` with the signing secret.

use crate::auth::{
    Authority, AuthorityError, ErrorBody, JwtBody, PrincipalKind, ServiceKey, ThingClaims,
    ThingTokenRequest, TokenError, UserClaims, UserTokenRequest,
};
use crate::directory::{DeviceRegistry, DirectoryError};

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Clone)]
pub struct AuthorityApiState {
    pub authority: Arc<dyn Authority>,
    pub registry: Arc<DeviceRegistry>,
    /// Key required to issue credentials; issuance disabled when absent
    pub service_key: Option<ServiceKey>,
}

/// Errors returned by the authority surface
#[derive(Debug)]
pub enum ApiError {
    Authority(AuthorityError),
    Directory(DirectoryError),
    /// Missing or non-admin bearer credential
    Forbidden,
    /// Missing or wrong service key on an issuing route
    KeyRequired,
}

impl From<AuthorityError> for ApiError {
    fn from(e: AuthorityError) -> Self {
        ApiError::Authority(e)
    }
}

impl From<DirectoryError> for ApiError {
    fn from(e: DirectoryError) -> Self {
        match e {
            DirectoryError::Authority(e) => ApiError::Authority(e),
            other => ApiError::Directory(other),
        }
    }
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Authority(AuthorityError::Token(e @ TokenError::Signing(_))) => {
                (StatusCode::INTERNAL_SERVER_ERROR, e.code())
            }
            ApiError::Authority(AuthorityError::Token(e)) => (StatusCode::UNAUTHORIZED, e.code()),
            ApiError::Authority(AuthorityError::Unavailable(_)) => {
                (StatusCode::SERVICE_UNAVAILABLE, "unavailable")
            }
            ApiError::Directory(DirectoryError::InvalidThingId(_)) => {
                (StatusCode::BAD_REQUEST, "invalid_thing_id")
            }
            ApiError::Directory(DirectoryError::AlreadyRegistered(_)) => {
                (StatusCode::CONFLICT, "already_registered")
            }
            ApiError::Directory(DirectoryError::NotFound(_)) => (StatusCode::NOT_FOUND, "not_found"),
            ApiError::Directory(_) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
            ApiError::Forbidden => (StatusCode::FORBIDDEN, "forbidden"),
            ApiError::KeyRequired => (StatusCode::FORBIDDEN, "service_key_required"),
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::Authority(AuthorityError::Token(TokenError::Signing(detail))) => detail.clone(),
            ApiError::Authority(e) => e.to_string(),
            ApiError::Directory(e) => e.to_string(),
            ApiError::Forbidden => "admin credential required".to_string(),
            ApiError::KeyRequired => "service key required to issue credentials".to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        if status.is_server_error() {
            warn!(status = %status, error = %self.message(), "Authority request failed");
        }
        let body = ErrorBody {
            error: code.to_string(),
            message: self.message(),
        };
        (status, Json(body)).into_response()
    }
}

/// Authority routes plus thing registration
pub fn authority_router(state: AuthorityApiState) -> Router {
    Router::new()
        .route("/auth/token/admin", post(admin_token))
        .route("/auth/token/user", post(user_token))
        .route("/auth/token/thing", post(thing_token))
        .route("/auth/claims/user", post(user_claims))
        .route("/auth/claims/thing", post(thing_claims))
        .route("/things", post(register_thing))
        .route("/things/{id}", delete(remove_thing))
        .route("/health", get(health_handler))
        .with_state(state)
}

async fn health_handler() -> &'static str {
    "ok"
}

async fn admin_token(
    State(state): State<AuthorityApiState>,
    headers: HeaderMap,
) -> Result<Json<JwtBody>, ApiError> {
    require_service_key(&state, &headers)?;
    let jwt = state.authority.admin_token().await?;
    Ok(Json(JwtBody { jwt }))
}

async fn user_token(
    State(state): State<AuthorityApiState>,
    headers: HeaderMap,
    Json(req): Json<UserTokenRequest>,
) -> Result<Json<JwtBody>, ApiError> {
    require_service_key(&state, &headers)?;
    let jwt = state.authority.user_token(&req.user_id).await?;
    Ok(Json(JwtBody { jwt }))
}

async fn thing_token(
    State(state): State<AuthorityApiState>,
    headers: HeaderMap,
    Json(req): Json<ThingTokenRequest>,
) -> Result<Json<JwtBody>, ApiError> {
    require_service_key(&state, &headers)?;
    let jwt = state.authority.thing_token(&req.thing_id, &req.user_id).await?;
    Ok(Json(JwtBody { jwt }))
}

async fn user_claims(
    State(state): State<AuthorityApiState>,
    Json(req): Json<JwtBody>,
) -> Result<Json<UserClaims>, ApiError> {
    Ok(Json(state.authority.user_claims(&req.jwt).await?))
}

async fn thing_claims(
    State(state): State<AuthorityApiState>,
    Json(req): Json<JwtBody>,
) -> Result<Json<ThingClaims>, ApiError> {
    Ok(Json(state.authority.thing_claims(&req.jwt).await?))
}

async fn register_thing(
    State(state): State<AuthorityApiState>,
    headers: HeaderMap,
    Json(req): Json<ThingTokenRequest>,
) -> Result<(StatusCode, Json<JwtBody>), ApiError> {
    require_admin(&state, &headers).await?;
    let jwt = state.registry.register(&req.thing_id, &req.user_id).await?;
    Ok((StatusCode::CREATED, Json(JwtBody { jwt })))
}

async fn remove_thing(
    State(state): State<AuthorityApiState>,
    headers: HeaderMap,
    Path(thing_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    require_admin(&state, &headers).await?;
    state.registry.remove(&thing_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

fn require_service_key(state: &AuthorityApiState, headers: &HeaderMap) -> Result<(), ApiError> {
    let presented = bearer(headers).ok_or(ApiError::KeyRequired)?;
    match &state.service_key {
        Some(key) if key.matches(presented) => Ok(()),
        _ => {
            info!("Rejected credential issuance request");
            Err(ApiError::KeyRequired)
        }
    }
}

async fn require_admin(state: &AuthorityApiState, headers: &HeaderMap) -> Result<(), ApiError> {
    let token = bearer(headers).ok_or(ApiError::Forbidden)?;

    match state.authority.validate(PrincipalKind::Admin, token).await {
        Ok(_) => Ok(()),
        Err(AuthorityError::Unavailable(e)) => Err(AuthorityError::Unavailable(e).into()),
        Err(e) => {
            info!(error = %e, "Rejected registry request");
            Err(ApiError::Forbidden)
        }
    }
}
