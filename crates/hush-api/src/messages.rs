use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use axum_extra::extract::WithRejection;
use uuid::Uuid;

use hush_types::api::PostMessageRequest;

use crate::middleware::Caller;
use crate::{AppState, ServiceError, blocking};

pub async fn post_message(
    State(state): State<AppState>,
    WithRejection(Path(conversation_id), _): WithRejection<Path<Uuid>, ServiceError>,
    Extension(Caller(caller)): Extension<Caller>,
    WithRejection(Json(req), _): WithRejection<Json<PostMessageRequest>, ServiceError>,
) -> Result<impl IntoResponse, ServiceError> {
    let sent = blocking(move || state.post_message(caller, conversation_id, req)).await?;
    Ok((StatusCode::CREATED, Json(sent)))
}

/// Every message of the conversation in the caller's partition, newest first.
pub async fn list_messages(
    State(state): State<AppState>,
    WithRejection(Path(conversation_id), _): WithRejection<Path<Uuid>, ServiceError>,
    Extension(Caller(caller)): Extension<Caller>,
) -> Result<impl IntoResponse, ServiceError> {
    let messages = blocking(move || state.list_messages(caller, conversation_id)).await?;
    Ok(Json(messages))
}

pub async fn mark_read(
    State(state): State<AppState>,
    WithRejection(Path((conversation_id, message_id)), _): WithRejection<Path<(Uuid, Uuid)>, ServiceError>,
    Extension(Caller(caller)): Extension<Caller>,
) -> Result<impl IntoResponse, ServiceError> {
    let status = blocking(move || state.mark_read(caller, conversation_id, message_id)).await?;
    Ok(Json(status))
}
