//! Relay HTTP API
//!
//! Axum-based HTTP server for operators and for Slack slash commands.
//!
//! Each endpoint has a thin axum handler that delegates to an inner function
//! returning `(StatusCode, serde_json::Value)`, so the inner functions can be
//! tested without going through the router.
//!
//! Endpoints:
//! - GET  /health: store reachability and session count
//! - GET  /version: server version info
//! - GET  /sessions: registered sessions, without credentials
//! - POST /poll: run one polling cycle now and return its report
//! - POST /slack/commands: signed Slack slash-command webhook

use std::sync::Arc;

use anyhow::Result;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use chrono::Utc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use relay_core::config::HttpConfig;
use relay_core::SessionStore;

use crate::commands::{CommandHandler, SlashCommand};
use crate::signature;
use crate::subsystems::poller::PollingEngine;

pub const TIMESTAMP_HEADER: &str = "x-slack-request-timestamp";
pub const SIGNATURE_HEADER: &str = "x-slack-signature";

/// Shared state for all HTTP handlers
#[derive(Clone)]
pub struct HttpState {
    pub store: Arc<dyn SessionStore>,
    pub engine: Arc<PollingEngine>,
    pub commands: CommandHandler,
    pub signing_secret: String,
}

/// Build the Axum router with all endpoints
pub fn build_router(state: Arc<HttpState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        .route("/sessions", get(sessions_handler))
        .route("/poll", post(poll_handler))
        .route("/slack/commands", post(slack_commands_handler))
        .with_state(state)
}

/// Start the HTTP server on the configured address.
/// Gracefully shuts down when the broadcast shutdown signal fires.
pub async fn start_http_server(
    state: Arc<HttpState>,
    config: HttpConfig,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let addr = format!("{}:{}", config.host, config.port);

    let app = build_router(state);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Relay HTTP API listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            tracing::info!("HTTP server shutting down...");
        })
        .await?;

    Ok(())
}

// ============================================================================
// Inner (directly testable) business logic functions
// ============================================================================

pub async fn health_inner(store: &dyn SessionStore) -> (StatusCode, serde_json::Value) {
    match store.find_all().await {
        Ok(sessions) => (
            StatusCode::OK,
            serde_json::json!({
                "status": "healthy",
                "version": env!("CARGO_PKG_VERSION"),
                "store": store.name(),
                "sessions": sessions.len(),
            }),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            serde_json::json!({
                "status": "unhealthy",
                "store": store.name(),
                "error": e.to_string(),
            }),
        ),
    }
}

pub fn version_inner() -> serde_json::Value {
    serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": "relay/1",
    })
}

pub async fn sessions_inner(store: &dyn SessionStore) -> (StatusCode, serde_json::Value) {
    match store.find_all().await {
        Ok(sessions) => {
            let summaries: Vec<_> = sessions.iter().map(|s| s.summary()).collect();
            (
                StatusCode::OK,
                serde_json::json!({
                    "count": summaries.len(),
                    "sessions": summaries,
                }),
            )
        }
        Err(e) => error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// Runs a cycle immediately. It may overlap a scheduled one.
pub async fn poll_inner(engine: &Arc<PollingEngine>) -> (StatusCode, serde_json::Value) {
    tracing::info!("Manual polling cycle requested");
    match engine.run_cycle().await {
        Ok(report) => match serde_json::to_value(&report) {
            Ok(body) => (StatusCode::OK, body),
            Err(e) => error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        },
        Err(e) => error_body(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    }
}

/// Verifies the Slack signature, then runs the command.
///
/// Command failures still answer 200 so Slack shows the reply to the user.
pub async fn slack_command_inner(
    state: &HttpState,
    headers: &HeaderMap,
    body: &[u8],
    now_unix: i64,
) -> (StatusCode, serde_json::Value) {
    let timestamp = headers
        .get(TIMESTAMP_HEADER)
        .and_then(|v| v.to_str().ok());
    let sig = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());

    if let Err(e) = signature::verify(&state.signing_secret, timestamp, sig, body, now_unix) {
        tracing::warn!(error = %e, "Rejected slash command");
        return error_body(StatusCode::UNAUTHORIZED, e.to_string());
    }

    let cmd = parse_slash_command(body);
    if cmd.command.is_empty() || cmd.channel_id.is_empty() {
        return error_body(StatusCode::BAD_REQUEST, "command and channel_id are required");
    }

    let text = match state.commands.handle(&cmd).await {
        Ok(text) => text,
        Err(e) => {
            tracing::error!(command = %cmd.command, error = %e, "Slash command failed");
            "Sorry, something went wrong on my side. Please try again in a minute.".to_string()
        }
    };

    (StatusCode::OK, ephemeral(text))
}

// ============================================================================
// Axum handler wrappers (thin, delegate to inner functions)
// ============================================================================

pub async fn health_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let (status, body) = health_inner(state.store.as_ref()).await;
    (status, Json(body))
}

pub async fn version_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(version_inner()))
}

pub async fn sessions_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let (status, body) = sessions_inner(state.store.as_ref()).await;
    (status, Json(body))
}

pub async fn poll_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let (status, body) = poll_inner(&state.engine).await;
    (status, Json(body))
}

pub async fn slack_commands_handler(
    State(state): State<Arc<HttpState>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let (status, body) =
        slack_command_inner(&state, &headers, &body, Utc::now().timestamp()).await;
    (status, Json(body))
}

// ============================================================================
// Helpers
// ============================================================================

pub fn parse_slash_command(body: &[u8]) -> SlashCommand {
    let mut cmd = SlashCommand::default();
    for (key, value) in url::form_urlencoded::parse(body) {
        match key.as_ref() {
            "command" => cmd.command = value.into_owned(),
            "text" => cmd.text = value.into_owned(),
            "channel_id" => cmd.channel_id = value.into_owned(),
            _ => {}
        }
    }
    cmd
}

fn ephemeral(text: String) -> serde_json::Value {
    serde_json::json!({
        "response_type": "ephemeral",
        "text": text,
    })
}

fn error_body(status: StatusCode, msg: impl Into<String>) -> (StatusCode, serde_json::Value) {
    (
        status,
        serde_json::json!({
            "error": msg.into(),
            "status": "error",
        }),
    )
}

// ============================================================================
// Unit Tests: call inner functions directly
// ============================================================================
