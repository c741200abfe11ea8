use crate::config::ServerConfig;
use crate::db::{self, RuleStore};
use crate::dispatch::NotificationDispatcher;
use anyhow::Result;
use axum::{
    extract::State,
    http::StatusCode,
    middleware,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use serde_json::json;
use sqlx::SqlitePool;
use std::sync::Arc;
use tower_http::{
    compression::CompressionLayer,
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, warn, Level};
use watchman_channel::ChannelManager;

mod routes;

/// Server application state.
pub struct AppState {
    pub config: ServerConfig,
    pub pool: SqlitePool,
    pub rules: RuleStore,
    pub channel: ChannelManager,
    pub dispatcher: NotificationDispatcher,
}

impl AppState {
    pub fn new(pool: SqlitePool, channel: ChannelManager, config: ServerConfig) -> Self {
        let rules = RuleStore::new(pool.clone());
        let dispatcher = NotificationDispatcher::new(rules.clone(), channel.clone());
        Self {
            config,
            pool,
            rules,
            channel,
            dispatcher,
        }
    }
}

/// Start the HTTP server.
pub async fn start(pool: SqlitePool, channel: ChannelManager, config: ServerConfig) -> Result<()> {
    let addr = config.bind_addr;
    let state = Arc::new(AppState::new(pool, channel, config));

    let app = create_router(state);

    info!("Starting Axum HTTP server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Create the Axum router with all routes and middleware.
fn create_router(state: Arc<AppState>) -> Router {
    // Rule CRUD and logout mutate configuration or session state, so they
    // sit behind the operator bearer token.
    let management = routes::rules::router(state.clone())
        .merge(routes::channel::management_router(state.clone()))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            crate::auth::require_operator,
        ));

    Router::new()
        .route("/health", get(health_handler))
        .with_state(state.clone())
        .merge(routes::webhook::router(state.clone()))
        .merge(routes::channel::router(state))
        .merge(management)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
}

/// Simple health check endpoint (for load balancers).
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match db::health_check(&state.pool).await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({
                "status": "healthy",
                "service": "watchman-server",
                "version": env!("CARGO_PKG_VERSION"),
                "channel": state.channel.status(),
            })),
        ),
        Err(e) => {
            warn!("Health check failed: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "service": "watchman-server",
                    "version": env!("CARGO_PKG_VERSION"),
                    "error": format!("database error: {}", e),
                })),
            )
        }
    }
}
