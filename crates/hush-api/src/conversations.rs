use axum::{
    Extension, Json,
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use axum_extra::extract::WithRejection;

use hush_types::api::{CreateConversationRequest, ListConversationsQuery};

use crate::middleware::Caller;
use crate::{AppState, ServiceError, blocking};

pub async fn create_conversation(
    State(state): State<AppState>,
    Extension(Caller(caller)): Extension<Caller>,
    WithRejection(Json(req), _): WithRejection<Json<CreateConversationRequest>, ServiceError>,
) -> Result<impl IntoResponse, ServiceError> {
    let created = blocking(move || state.create_conversation(caller, req)).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// One page of the caller's conversations, most recently active first.
pub async fn list_conversations(
    State(state): State<AppState>,
    Extension(Caller(caller)): Extension<Caller>,
    WithRejection(Query(query), _): WithRejection<Query<ListConversationsQuery>, ServiceError>,
) -> Result<impl IntoResponse, ServiceError> {
    let page = blocking(move || state.list_conversations(caller, query)).await?;
    Ok(Json(page))
}
