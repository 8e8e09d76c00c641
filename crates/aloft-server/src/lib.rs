//! HTTP entry point for the Aloft PTT platform: wires the Control API (C9)
//! and Stream Hub (C8) on top of the Channel Store, Cache, Identity Verifier,
//! Permission Resolver, Permission Registrar, Push Fan-out and Channel Agent
//! crates.

pub mod api_channels;
pub mod api_ws;
pub mod config;
pub mod envelope;
pub mod middleware;

use axum::extract::DefaultBodyLimit;
use axum::routing::{delete, get, post, put};
use axum::{Extension, Router};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Request bodies above this size are rejected before touching a handler.
/// Audio chunks are base64-encoded and capped well below this by the agent,
/// so this only guards against malformed/hostile payloads.
const MAX_REQUEST_BODY_BYTES: usize = 2 * 1024 * 1024;

/// Shared state handed to every handler via `Extension`.
#[derive(Clone)]
pub struct AppState {
    pub pool: aloft_db::DbPool,
    pub cache: aloft_cache::ChannelCache,
    pub identity: Arc<aloft_identity::IdentityVerifier>,
    pub registrar: aloft_registrar::PermissionRegistrar,
    pub agents: aloft_agent::AgentRegistry,
    pub rate_limiter: Arc<middleware::RateLimiter>,
    pub cors_allowed_origins: Arc<Vec<String>>,
}

pub fn build_state(
    cfg: &config::Config,
    pool: aloft_db::DbPool,
    identity: aloft_identity::IdentityVerifier,
    registrar: aloft_registrar::PermissionRegistrar,
) -> AppState {
    let cache = aloft_cache::ChannelCache::with_ttls(
        std::time::Duration::from_secs(cfg.channel.cache_ttl_secs),
        std::time::Duration::from_secs(aloft_types::constants::LIST_CACHE_TTL_SECS),
    );
    let push = aloft_push::PushGateway::new(aloft_push::PushConfig {
        gateway_url: cfg.push.gateway_url.clone(),
        api_key: cfg.push.api_key.clone(),
    });
    let agents = aloft_agent::AgentRegistry::new(pool.clone(), push, cfg.server.websocket_base_url.clone());
    AppState {
        pool,
        cache,
        identity: Arc::new(identity),
        registrar,
        agents,
        rate_limiter: Arc::new(middleware::RateLimiter::new()),
        cors_allowed_origins: Arc::new(cfg.cors.allowed_origins.clone()),
    }
}

async fn health(Extension(state): Extension<Arc<AppState>>) -> axum::Json<serde_json::Value> {
    let db_ok = state.pool.get().is_ok();
    axum::Json(serde_json::json!({
        "status": if db_ok { "ok" } else { "degraded" },
        "services": {
            "database": if db_ok { "ok" } else { "unavailable" },
            "cache": "ok",
            "channels": "ok",
        },
        "version": env!("CARGO_PKG_VERSION"),
        "api_version": "v1",
    }))
}

/// Builds the full router: Control API under `/api/v1`, the stream upgrade
/// route, and an unauthenticated health check. Route layout follows the
/// external interface exactly: channel CRUD and membership are keyed by
/// channel UUID, transmissions are keyed by their own session_id (with the
/// channel UUID resolved from it for agent dispatch — see
/// `api_channels::resolve_session_channel`).
pub fn app(state: AppState) -> Router {
    let api = Router::new()
        .route("/channels", get(api_channels::list_channels))
        .route("/channels", post(api_channels::create_channel))
        .route("/channels/with-uuid", post(api_channels::create_channel_with_uuid))
        .route("/channels/{uuid}", get(api_channels::get_channel))
        .route("/channels/{uuid}", put(api_channels::update_channel))
        .route("/channels/{uuid}", delete(api_channels::delete_channel))
        .route("/channels/{uuid}/join", post(api_channels::join_channel))
        .route(
            "/channels/{uuid}/leave",
            post(api_channels::leave_channel).delete(api_channels::leave_channel),
        )
        .route("/channels/{uuid}/participants", get(api_channels::list_participants))
        .route(
            "/channels/{uuid}/update-token",
            put(api_channels::update_push_token).post(api_channels::update_push_token),
        )
        .route("/transmissions/start", post(api_channels::ptt_start))
        .route("/transmissions/{session_id}/chunk", post(api_channels::ptt_chunk))
        .route("/transmissions/{session_id}/end", post(api_channels::ptt_end))
        .route("/transmissions/active/{channel_uuid}", get(api_channels::ptt_active))
        .route("/transmissions/ws/{channel_uuid}", get(api_ws::ws_handler))
        .layer(axum::middleware::from_fn(middleware::auth_middleware));

    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", api)
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(axum::middleware::from_fn(middleware::rate_limit_middleware))
        .layer(axum::middleware::from_fn(middleware::cors_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(Extension(Arc::new(state)))
}
