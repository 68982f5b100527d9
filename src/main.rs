//! Souq Calls Server
//!
//! Real-time call signaling and session lifecycle for the marketplace chat
//! platform:
//!
//! 1. **Call setup**: Create audio/video call sessions between buyers and
//!    sellers, ring the callee over their live socket or a push
//!    notification, and track every attempt from `initiated` to a terminal
//!    state.
//!
//! 2. **Signaling relay**: Forward SDP offers/answers and ICE candidates
//!    between a call's participants. Media flows peer-to-peer; the server
//!    never touches it.
//!
//! 3. **Timeout supervision**: Unanswered calls become `missed` after the
//!    ringing deadline, dropped connections get a reconnect grace window,
//!    and old terminal sessions are archived.

mod api;
mod dispatch;
mod error;
mod groups;
mod handler;
mod lifecycle;
mod protocol;
mod session;
mod state;
mod store;
mod supervisor;

use axum::{
    extract::{State, WebSocketUpgrade},
    http::Method,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use clap::Parser;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use dispatch::PushClient;
use state::{AppState, CallConfig, GroupEndPolicy};
use store::SessionStore;

// ── CLI Arguments ─────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "souq-calls", version, about = "Call signaling and session server")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = 8080, env = "CALLS_PORT")]
    port: u16,

    /// Path to the SQLite session database (empty for in-memory)
    #[arg(long, default_value = "calls.db", env = "CALLS_DB_PATH")]
    db_path: String,

    /// Seconds an unanswered call rings before it is marked missed
    #[arg(long, default_value_t = 60, env = "RINGING_TIMEOUT_SECS")]
    ringing_timeout_secs: i64,

    /// Ringing sweep interval in seconds
    #[arg(long, default_value_t = 10, env = "SWEEP_INTERVAL_SECS")]
    sweep_interval_secs: u64,

    /// Seconds a disconnected participant may reconnect before the call ends
    #[arg(long, default_value_t = 30, env = "DISCONNECT_GRACE_SECS")]
    disconnect_grace_secs: u64,

    /// Days terminal sessions are kept before the retention sweep archives them
    #[arg(long, default_value_t = 30, env = "RETENTION_DAYS")]
    retention_days: i64,

    /// Retention sweep interval in seconds
    #[arg(long, default_value_t = 86_400, env = "RETENTION_SWEEP_INTERVAL_SECS")]
    retention_sweep_interval_secs: u64,

    /// Push provider endpoint URL. Unset disables push delivery.
    #[arg(long, env = "PUSH_ENDPOINT")]
    push_endpoint: Option<String>,

    /// Bearer token for the push provider
    #[arg(long, env = "PUSH_API_KEY")]
    push_api_key: Option<String>,

    /// Skip live-socket delivery so every invite exercises the push path
    #[arg(long, default_value_t = false, env = "FORCE_PUSH")]
    force_push: bool,

    /// When a group call ends after participants leave
    #[arg(long, value_enum, default_value = "last-two-leave", env = "GROUP_END_POLICY")]
    group_end_policy: GroupEndPolicy,
}

// ── Entry Point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "souq_calls=info,tower_http=info".into()),
        )
        .init();

    let args = Args::parse();

    let config = CallConfig {
        port: args.port,
        ringing_timeout_secs: args.ringing_timeout_secs,
        sweep_interval_secs: args.sweep_interval_secs,
        disconnect_grace_secs: args.disconnect_grace_secs,
        retention_days: args.retention_days,
        retention_sweep_interval_secs: args.retention_sweep_interval_secs,
        group_end_policy: args.group_end_policy,
        force_push: args.force_push,
    };

    // ── Storage ───────────────────────────────────────────────────────────

    let store = if args.db_path.trim().is_empty() {
        tracing::warn!("No database path configured, sessions are in-memory only");
        SessionStore::open(None)
    } else {
        tracing::info!(path = args.db_path.as_str(), "Opening session database");
        SessionStore::open(Some(&args.db_path))
    }
    .expect("Failed to open session database");

    // ── Push Provider ─────────────────────────────────────────────────────

    let push = match args.push_endpoint {
        Some(endpoint) => {
            tracing::info!(endpoint = endpoint.as_str(), "Push delivery enabled");
            PushClient::new(Some(endpoint), args.push_api_key)
        }
        None => {
            tracing::info!("Push delivery disabled (no endpoint configured)");
            PushClient::disabled()
        }
    };

    if config.force_push {
        tracing::warn!("Force-push mode: live-socket delivery is skipped");
    }

    let state = AppState::new(config, store, push);

    // Spawn the ringing and retention sweeps
    supervisor::spawn(state.clone());

    // Build router
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/calls", post(api::create_call))
        .route("/calls/:call_id", get(api::get_call))
        .route("/calls/:call_id/answer", post(api::answer_call))
        .route("/calls/:call_id/decline", post(api::decline_call))
        .route("/calls/:call_id/end", post(api::end_call))
        .route("/calls/:call_id/sync", post(api::sync_call))
        .route("/push/tokens", post(api::register_push_token))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = format!("0.0.0.0:{}", args.port);
    tracing::info!("Call server starting on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind address");

    axum::serve(listener, app)
        .await
        .expect("Server error");
}

// ── Route Handlers ────────────────────────────────────────────────────────────

/// WebSocket upgrade handler for client connections.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handler::handle_websocket(socket, state))
}

/// Health check endpoint.
async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "souq-calls",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Statistics endpoint.
async fn stats_handler(State(state): State<AppState>) -> impl IntoResponse {
    let counts = match state.store.status_counts() {
        Ok(counts) => counts,
        Err(e) => {
            tracing::error!(error = %e, "Failed to read session counts");
            Vec::new()
        }
    };
    let sessions_by_status: serde_json::Map<String, serde_json::Value> = counts
        .into_iter()
        .map(|(status, count)| (status, count.into()))
        .collect();

    Json(json!({
        "online_clients": state.online_count(),
        "active_rooms": state.active_room_count(),
        "active_sessions": state.store.active_count().unwrap_or(0),
        "sessions_by_status": sessions_by_status,
        "tracked_disconnects": state.disconnects.tracked_call_count(),
        "push_enabled": state.push.is_configured(),
    }))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_json_structure() {
        let json_val = json!({
            "status": "ok",
            "service": "souq-calls",
            "version": env!("CARGO_PKG_VERSION"),
        });
        assert_eq!(json_val["status"], "ok");
        assert_eq!(json_val["service"], "souq-calls");
    }

    #[test]
    fn test_args_defaults() {
        let args = Args::parse_from(["souq-calls"]);
        assert_eq!(args.port, 8080);
        assert_eq!(args.db_path, "calls.db");
        assert_eq!(args.ringing_timeout_secs, 60);
        assert_eq!(args.sweep_interval_secs, 10);
        assert_eq!(args.disconnect_grace_secs, 30);
        assert_eq!(args.retention_days, 30);
        assert_eq!(args.group_end_policy, GroupEndPolicy::LastTwoLeave);
        assert!(!args.force_push);
        assert!(args.push_endpoint.is_none());
    }
}
