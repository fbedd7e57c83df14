use std::future::Future;

use {
    axum::{
        Json, Router,
        extract::State,
        http::StatusCode,
        response::{IntoResponse, Response},
        routing::{get, post},
    },
    parley_engine::{Engine, Error as EngineError, ReconnectRequest},
    serde_json::json,
    tokio::net::TcpListener,
    tower_http::{
        cors::{Any, CorsLayer},
        trace::TraceLayer,
    },
    tracing::{info, warn},
};

#[derive(Clone)]
struct AppState {
    engine: Engine,
}

// ── Server startup ───────────────────────────────────────────────────────────

/// Build the router (shared between production startup and tests).
pub fn build_app(engine: Engine) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .route("/qr", get(qr_handler))
        .route("/send-pending", post(send_pending_handler))
        .route("/reconnect", post(reconnect_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { engine })
}

/// Serve the façade on `listener` until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    engine: Engine,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, "http façade listening");
    axum::serve(listener, build_app(engine))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

// ── Handlers ─────────────────────────────────────────────────────────────────

fn timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

async fn root_handler(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.engine.status();
    Json(json!({
        "status": "running",
        "aiApiUrl": status.ai_backend,
        "voiceApiUrl": status.voice_backend,
        "timestamp": timestamp(),
        "port": state.engine.config().server.port,
        "state": status.connection.state,
        "connected": status.connection.connected,
        "pendingMessages": status.pending_messages,
        "activeTimers": status.active_batches,
        "reconnectAttempts": status.connection.reconnect_attempts,
    }))
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.engine.status();
    Json(json!({
        "status": "healthy",
        "whatsappReady": status.connection.connected,
        "botUser": status.connection.user,
        "voiceBackendHealthy": status.voice_backend_healthy,
        "timestamp": timestamp(),
    }))
}

async fn stats_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.engine.stats())
}

async fn qr_handler(State(state): State<AppState>) -> Response {
    match state.engine.pairing_token() {
        Some(qr) => Json(json!({ "qr": qr })).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "no pairing code pending"),
    }
}

async fn send_pending_handler(State(state): State<AppState>) -> Response {
    match state.engine.flush_pending().await {
        Ok(report) => Json(json!({
            "message": "Pending messages sent",
            "delivered": report.delivered,
            "remaining": report.remaining,
        }))
        .into_response(),
        Err(EngineError::TransportDisconnected) => {
            error_response(StatusCode::SERVICE_UNAVAILABLE, "Bot not connected")
        },
        Err(e) => {
            warn!(error = %e, "manual flush failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
        },
    }
}

async fn reconnect_handler(State(state): State<AppState>) -> Response {
    match state.engine.request_reconnect() {
        ReconnectRequest::Initiated(_) => {
            Json(json!({ "message": "Reconnection initiated" })).into_response()
        },
        ReconnectRequest::AlreadyConnected => {
            Json(json!({ "message": "Already connected" })).into_response()
        },
        ReconnectRequest::LoggedOut => error_response(
            StatusCode::CONFLICT,
            "Logged out; restart with a fresh pairing",
        ),
    }
}
