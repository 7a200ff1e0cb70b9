//! Websocket push gateway.
//!
//! Clients connect to `/ws/{recipient_id}`; every open socket receives the
//! push frames addressed to that recipient until it closes. The gateway pings
//! each socket on a fixed interval and drops sockets that stay silent past
//! the pong timeout, so half-open connections do not count as online.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tokio::time::{Instant, MissedTickBehavior};

use courier_common::config::AppConfig;

use crate::channels::push::SessionRegistry;

/// Keepalive timing for push sockets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat {
    pub ping_interval: Duration,
    /// A socket with no inbound frame (pong or otherwise) for this long is closed.
    pub pong_timeout: Duration,
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(15),
            pong_timeout: Duration::from_secs(45),
        }
    }
}

impl Heartbeat {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            ping_interval: Duration::from_secs(config.push_ping_interval_secs.max(1)),
            pong_timeout: Duration::from_secs(config.push_pong_timeout_secs.max(1)),
        }
    }
}

#[derive(Clone)]
struct GatewayState {
    sessions: Arc<SessionRegistry>,
    heartbeat: Heartbeat,
}

pub fn router(sessions: Arc<SessionRegistry>) -> Router {
    router_with_heartbeat(sessions, Heartbeat::default())
}

pub fn router_with_heartbeat(sessions: Arc<SessionRegistry>, heartbeat: Heartbeat) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ws/{recipient_id}", get(connect))
        .with_state(GatewayState {
            sessions,
            heartbeat,
        })
}

async fn health_check() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "courier-notifier",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn connect(
    ws: WebSocketUpgrade,
    Path(recipient_id): Path<String>,
    State(state): State<GatewayState>,
) -> Response {
    ws.on_upgrade(move |socket| serve_session(socket, recipient_id, state))
}

async fn serve_session(mut socket: WebSocket, recipient_id: String, state: GatewayState) {
    let GatewayState {
        sessions,
        heartbeat,
    } = state;
    let (session_id, mut frames) = sessions.connect(&recipient_id).await;

    let mut pings = tokio::time::interval_at(
        Instant::now() + heartbeat.ping_interval,
        heartbeat.ping_interval,
    );
    pings.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            frame = frames.recv() => {
                let Some(text) = frame else { break };
                if socket.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    // Pongs and client pings both count; client text is ignored.
                    Some(Ok(_)) => last_seen = Instant::now(),
                }
            }
            _ = pings.tick() => {
                if last_seen.elapsed() >= heartbeat.pong_timeout {
                    tracing::debug!(
                        recipient = %recipient_id,
                        session = %session_id,
                        "Push session timed out"
                    );
                    break;
                }
                if socket.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    sessions.disconnect(&recipient_id, session_id).await;
}
