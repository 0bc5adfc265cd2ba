use std::fmt;

use axum::{
    Json,
    extract::rejection::{JsonRejection, PathRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tracing::{error, warn};

use hush_crypto::{KeyError, TokenError};
use hush_types::api::ErrorBody;

/// Participant whose partition a protocol step touched. For create and read
/// the acting user is the sender side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Sender,
    Recipient,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Sender => "sender",
            Self::Recipient => "recipient",
        })
    }
}

/// Step of an indexing protocol at which the store failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStep {
    LoadSummary,
    ResolveKey,
    AppendMessage,
    ReplaceSummary,
    MarkRead,
}

impl SyncStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LoadSummary => "load-summary",
            Self::ResolveKey => "resolve-key",
            Self::AppendMessage => "append-message",
            Self::ReplaceSummary => "replace-summary",
            Self::MarkRead => "mark-read",
        }
    }

    /// Steps that run before the protocol writes anything.
    pub fn is_read_only(&self) -> bool {
        matches!(self, Self::LoadSummary | Self::ResolveKey)
    }
}

impl fmt::Display for SyncStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("store unavailable")]
    StoreUnavailable(#[source] anyhow::Error),

    #[error("conversation did not converge: {step} failed on the {side} side")]
    ConversationSync {
        step: SyncStep,
        side: Side,
        #[source]
        source: anyhow::Error,
    },

    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("decryption failed: {0}")]
    Decryption(String),
}

impl ServiceError {
    pub fn store(err: anyhow::Error) -> Self {
        Self::StoreUnavailable(err)
    }

    /// Adapter for `map_err` inside a multi-step protocol.
    pub fn sync(step: SyncStep, side: Side) -> impl FnOnce(anyhow::Error) -> Self {
        move |source| Self::ConversationSync { step, side, source }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Authentication(_) => "authentication",
            Self::Validation(_) => "validation",
            Self::NotFound(_) => "not-found",
            Self::StoreUnavailable(_) => "store-unavailable",
            Self::ConversationSync { .. } => "conversation-sync",
            Self::Encryption(_) => "encryption",
            Self::Decryption(_) => "decryption",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Authentication(_) => StatusCode::UNAUTHORIZED,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::ConversationSync { .. } => StatusCode::CONFLICT,
            Self::Encryption(_) | Self::Decryption(_) => StatusCode::UNPROCESSABLE_ENTITY,
        }
    }

    /// Whether re-driving the whole operation is safe. A sync failure after
    /// the first write needs reconciliation instead, since the prior ordering
    /// key read by a retry may already be stale.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::StoreUnavailable(_) => true,
            Self::ConversationSync { step, .. } => step.is_read_only(),
            _ => false,
        }
    }
}

impl From<KeyError> for ServiceError {
    fn from(err: KeyError) -> Self {
        match err {
            KeyError::KeyNotFound(_) => Self::Authentication("session key expired or unknown".into()),
            KeyError::InvalidKey(e) | KeyError::Encryption(e) => Self::Encryption(e),
            KeyError::Decryption(e) => Self::Decryption(e),
            KeyError::Vault(e) => Self::StoreUnavailable(e),
        }
    }
}

impl From<TokenError> for ServiceError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::InvalidToken => Self::Authentication("invalid session token".into()),
            TokenError::Encoding(e) => Self::Encryption(e),
        }
    }
}

// Malformed ids, bodies and query strings surface as validation failures so
// every error response carries the same JSON shape.

impl From<PathRejection> for ServiceError {
    fn from(rejection: PathRejection) -> Self {
        Self::Validation(rejection.body_text())
    }
}

impl From<JsonRejection> for ServiceError {
    fn from(rejection: JsonRejection) -> Self {
        Self::Validation(rejection.body_text())
    }
}

impl From<QueryRejection> for ServiceError {
    fn from(rejection: QueryRejection) -> Self {
        Self::Validation(rejection.body_text())
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let message = match &self {
            Self::StoreUnavailable(source) => {
                error!("Store failure: {:#}", source);
                "storage backend unavailable, retry later".to_string()
            }
            Self::ConversationSync { step, side, source } => {
                error!("Conversation sync failed at {} ({} side): {:#}", step, side, source);
                self.to_string()
            }
            Self::Encryption(e) => {
                warn!("Encryption failure: {}", e);
                "message could not be encrypted".to_string()
            }
            Self::Decryption(e) => {
                warn!("Decryption failure: {}", e);
                "payload could not be decrypted".to_string()
            }
            other => other.to_string(),
        };

        let body = ErrorBody {
            kind: self.kind().to_string(),
            message,
        };
        (self.status(), Json(body)).into_response()
    }
}
