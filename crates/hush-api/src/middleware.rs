use axum::{
    extract::{Request, State},
    http::{HeaderMap, header},
    middleware::Next,
    response::Response,
};

use hush_types::models::UserId;

use crate::{AppState, ServiceError, blocking};

/// Header naming the key-exchange session a wrapped bearer token was
/// encrypted for.
pub const SESSION_HEADER: &str = "x-session-id";

/// Authenticated user, inserted as a request extension by `require_auth`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller(pub UserId);

/// Resolve the bearer token in the Authorization header to a user id.
pub async fn require_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ServiceError> {
    let token = bearer_token(req.headers())?.to_string();
    let session_id = req
        .headers()
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let user_id = blocking(move || state.authenticate(&token, session_id.as_deref())).await?;

    req.extensions_mut().insert(Caller(user_id));
    Ok(next.run(req).await)
}

fn bearer_token(headers: &HeaderMap) -> Result<&str, ServiceError> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ServiceError::Authentication("missing bearer token".into()))
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn bearer_token_extraction() {
        let mut headers = HeaderMap::new();
        assert!(bearer_token(&headers).is_err());

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert!(bearer_token(&headers).is_err());

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert!(bearer_token(&headers).is_err());

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc+/="));
        assert_eq!(bearer_token(&headers).unwrap(), "abc+/=");
    }
}
