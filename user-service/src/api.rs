use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AuthError;
use crate::service::{AuthService, RegisterInput};

#[derive(Clone)]
pub struct AppState {
    pub auth: Arc<AuthService>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl From<&AuthError> for StatusCode {
    fn from(err: &AuthError) -> Self {
        match err {
            AuthError::InvalidEmail | AuthError::WeakPassword | AuthError::EmptyName => {
                StatusCode::BAD_REQUEST
            }
            AuthError::EmailExists => StatusCode::CONFLICT,
            AuthError::InvalidCredentials
            | AuthError::InvalidToken
            | AuthError::TokenRevoked
            | AuthError::AccountLocked => StatusCode::UNAUTHORIZED,
            AuthError::UserNotFound => StatusCode::NOT_FOUND,
            AuthError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

fn error_response(err: AuthError) -> (StatusCode, Json<ErrorResponse>) {
    let status = StatusCode::from(&err);
    if matches!(err, AuthError::Io(_)) {
        tracing::error!("user-service request failed: {err}");
    }
    (status, Json(ErrorResponse { error: err.to_string() }))
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
        .route("/auth/logout", post(logout))
        .route("/auth/validate", post(validate))
        .route("/users/:id", get(get_user))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub user_id: Uuid,
}

async fn register(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> Result<Json<RegisterResponse>, (StatusCode, Json<ErrorResponse>)> {
    let user_id = state
        .auth
        .register(RegisterInput {
            email: request.email,
            password: request.password,
            name: request.name,
        })
        .await
        .map_err(error_response)?;
    Ok(Json(RegisterResponse { user_id }))
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub access: String,
    pub refresh: String,
    pub expires_at: chrono::DateTime<chrono::Utc>,
}

async fn login(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, (StatusCode, Json<ErrorResponse>)> {
    let output = state
        .auth
        .login(&request.email, &request.password)
        .await
        .map_err(error_response)?;
    Ok(Json(LoginResponse {
        access: output.tokens.access,
        refresh: output.tokens.refresh,
        expires_at: output.tokens.expires_at,
    }))
}

#[derive(Debug, Deserialize)]
pub struct LogoutRequest {
    pub access_token: String,
}

async fn logout(
    State(state): State<AppState>,
    Json(request): Json<LogoutRequest>,
) -> Result<StatusCode, (StatusCode, Json<ErrorResponse>)> {
    state
        .auth
        .logout(&request.access_token)
        .await
        .map_err(error_response)?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
pub struct ValidateRequest {
    pub access_token: String,
}

#[derive(Debug, Serialize)]
pub struct ValidateResponse {
    pub valid: bool,
    pub user_id: Option<Uuid>,
    pub email: Option<String>,
    pub jti: Option<String>,
}

/// `ValidateToken` never surfaces an error (§6): any failure collapses to
/// `valid=false`.
async fn validate(
    State(state): State<AppState>,
    Json(request): Json<ValidateRequest>,
) -> Json<ValidateResponse> {
    match state.auth.validate_token(&request.access_token).await {
        Ok(claims) => Json(ValidateResponse {
            valid: true,
            user_id: Some(claims.user_id),
            email: Some(claims.sub),
            jti: Some(claims.jti),
        }),
        Err(_) => Json(ValidateResponse {
            valid: false,
            user_id: None,
            email: None,
            jti: None,
        }),
    }
}

#[derive(Debug, Serialize)]
pub struct UserResponse {
    pub id: Uuid,
    pub name: String,
    pub email: String,
}

async fn get_user(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<UserResponse>, (StatusCode, Json<ErrorResponse>)> {
    let user = state.auth.get_user(id).await.map_err(error_response)?;
    Ok(Json(UserResponse {
        id: user.id,
        name: user.name,
        email: user.email,
    }))
}

async fn health_check() -> &'static str {
    "OK"
}
