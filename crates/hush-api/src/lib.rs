pub mod auth;
pub mod conversations;
pub mod error;
pub mod indexer;
pub mod messages;
pub mod middleware;
pub mod service;

#[cfg(test)]
mod testing;

use std::sync::Arc;

use tracing::error;

pub use error::ServiceError;
pub use service::ConversationService;

pub type AppState = Arc<ConversationService>;

/// Run blocking store or crypto work off the async runtime.
pub async fn blocking<T, F>(work: F) -> Result<T, ServiceError>
where
    F: FnOnce() -> Result<T, ServiceError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work).await.map_err(|e| {
        error!("spawn_blocking join error: {}", e);
        ServiceError::store(anyhow::anyhow!("worker task failed: {}", e))
    })?
}
