mod config;

use std::sync::Arc;

use axum::{
    Router,
    extract::{Query, State, WebSocketUpgrade},
    middleware,
    response::IntoResponse,
    routing::{get, post},
};
use axum_extra::extract::WithRejection;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use hush_api::middleware::require_auth;
use hush_api::{AppState, ConversationService, ServiceError, auth, blocking, conversations, messages};
use hush_crypto::{KeyExchange, SessionTokens};
use hush_db::Database;
use hush_gateway::{LiveChannel, connection};
use hush_types::api::LiveQuery;

use crate::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hush=debug,tower_http=debug".into()),
        )
        .init();

    let config = Config::from_env()?;
    info!("Starting with {:?}", config);

    // One SQLite file backs every partition, the identity table and the key vault
    let db = Arc::new(Database::open(&config.db_path)?);

    let service: AppState = Arc::new(ConversationService::new(
        db.clone(),
        db.clone(),
        KeyExchange::new(db, config.rsa_bits),
        SessionTokens::from_secret(&config.token_key),
        LiveChannel::new(),
        config.page_size,
    ));

    let public_routes = Router::new()
        .route("/keys/session", get(auth::issue_session_key))
        .route("/keys/session/{session_id}", get(auth::session_public_key))
        .route("/users/register", post(auth::register))
        .route("/users/login", post(auth::login))
        .route("/live", get(live_upgrade));

    let protected_routes = Router::new()
        .route(
            "/conversations",
            post(conversations::create_conversation).get(conversations::list_conversations),
        )
        .route(
            "/conversations/{conversation_id}/messages",
            post(messages::post_message).get(messages::list_messages),
        )
        .route(
            "/conversations/{conversation_id}/messages/{message_id}/read",
            post(messages::mark_read),
        )
        .layer(middleware::from_fn_with_state(service.clone(), require_auth));

    let app = Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .with_state(service)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = config.addr()?;
    info!("Hush server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Browsers cannot set headers on a WebSocket handshake, so the token rides
/// in the query string and is checked before the upgrade.
async fn live_upgrade(
    State(state): State<AppState>,
    WithRejection(Query(query), _): WithRejection<Query<LiveQuery>, ServiceError>,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, ServiceError> {
    let auth_state = state.clone();
    let user_id = blocking(move || auth_state.authenticate(&query.token, query.session_id.as_deref())).await?;

    let live = state.live().clone();
    Ok(ws.on_upgrade(move |socket| connection::handle_connection(socket, live, user_id)))
}
