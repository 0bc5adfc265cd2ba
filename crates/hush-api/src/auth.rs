use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use axum_extra::extract::WithRejection;

use hush_types::api::{LoginRequest, RegisterRequest};

use crate::{AppState, ServiceError, blocking};

/// Fresh ephemeral keypair; the client encrypts credentials with `public_key`.
pub async fn issue_session_key(State(state): State<AppState>) -> Result<impl IntoResponse, ServiceError> {
    let session = blocking(move || state.issue_session_key()).await?;
    Ok((StatusCode::CREATED, Json(session)))
}

pub async fn session_public_key(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    let key = blocking(move || state.session_public_key(&session_id)).await?;
    Ok(Json(key))
}

pub async fn register(
    State(state): State<AppState>,
    WithRejection(Json(req), _): WithRejection<Json<RegisterRequest>, ServiceError>,
) -> Result<impl IntoResponse, ServiceError> {
    let registered = blocking(move || state.register(req)).await?;
    Ok((StatusCode::CREATED, Json(registered)))
}

pub async fn login(
    State(state): State<AppState>,
    WithRejection(Json(req), _): WithRejection<Json<LoginRequest>, ServiceError>,
) -> Result<impl IntoResponse, ServiceError> {
    let session = blocking(move || state.login(req)).await?;
    Ok(Json(session))
}
