//! WebSocket surface: `/ws/jobs/{project_id}?token=...`.
//!
//! Connections authenticate at open time, subscribe to their project's
//! channel, and receive `{type, payload}` messages. Server pings every
//! 30 s and terminates connections that stop answering.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::bus::{BusEvent, EventBus, SendBuffer};

const CLOSE_BAD_PATH: u16 = 4000;
const CLOSE_UNAUTHORIZED: u16 = 4001;
const CLOSE_INTERNAL: u16 = 4500;

const HEARTBEAT: Duration = Duration::from_secs(30);
const SUBSCRIBER_BUFFER: usize = 256;

#[derive(Debug, Clone)]
pub struct AuthedUser {
    pub user_id: Uuid,
    pub organization_id: Uuid,
}

/// Token verification seam. User records live outside this system; the
/// implementation is injected by the host binary.
#[async_trait::async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, token: &str) -> Option<AuthedUser>;
}

#[derive(Clone)]
pub struct WsState {
    pub bus: Arc<EventBus>,
    pub auth: Arc<dyn Authenticator>,
}

pub fn router(state: WsState) -> Router {
    Router::new()
        .route("/ws/jobs/{project_id}", get(ws_handler))
        .with_state(state)
}

async fn ws_handler(
    Path(project_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<WsState>,
    ws: WebSocketUpgrade,
) -> Response {
    let token = params.get("token").cloned();
    ws.on_upgrade(move |socket| serve_connection(socket, state, project_id, token))
}

async fn close_with(mut socket: WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

async fn serve_connection(
    socket: WebSocket,
    state: WsState,
    raw_project_id: String,
    token: Option<String>,
) {
    let project_id: Uuid = match raw_project_id.parse() {
        Ok(id) => id,
        Err(_) => {
            close_with(socket, CLOSE_BAD_PATH, "invalid project path").await;
            return;
        }
    };

    let user = match token {
        Some(token) => match state.auth.authenticate(&token).await {
            Some(user) => user,
            None => {
                close_with(socket, CLOSE_UNAUTHORIZED, "authentication failed").await;
                return;
            }
        },
        None => {
            close_with(socket, CLOSE_UNAUTHORIZED, "missing token").await;
            return;
        }
    };

    if let Err(e) = run_subscription(socket, state, user, project_id).await {
        warn!(error = %e, %project_id, "WebSocket session ended with error");
    }
}

async fn run_subscription(
    socket: WebSocket,
    state: WsState,
    user: AuthedUser,
    project_id: Uuid,
) -> anyhow::Result<()> {
    let (mut sender, mut receiver) = socket.split();
    let mut events = state.bus.subscribe(user.organization_id, project_id);
    let mut buffer = SendBuffer::new(SUBSCRIBER_BUFFER);

    let connected = serde_json::json!({
        "type": "CONNECTED",
        "payload": { "projectId": project_id, "timestamp": Utc::now() }
    });
    sender.send(Message::Text(connected.to_string().into())).await?;

    let mut heartbeat = interval(HEARTBEAT);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    heartbeat.tick().await; // first tick is immediate
    let mut last_pong = Instant::now();

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        buffer.push(event);
                        while let Some(event) = buffer.pop() {
                            let text = serde_json::to_string(&event)?;
                            sender.send(Message::Text(text.into())).await?;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, %project_id, "Subscriber lagged; events dropped");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(reply) = handle_client_message(text.as_str(), &mut last_pong) {
                            sender.send(Message::Text(reply.into())).await?;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => last_pong = Instant::now(),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        let _ = sender
                            .send(Message::Close(Some(CloseFrame {
                                code: CLOSE_INTERNAL,
                                reason: "internal error".into(),
                            })))
                            .await;
                        return Err(e.into());
                    }
                }
            }
            _ = heartbeat.tick() => {
                // Terminate if the client has not answered since the
                // previous tick.
                if last_pong.elapsed() > HEARTBEAT * 2 {
                    debug!(%project_id, "No pong since previous tick; terminating");
                    break;
                }
                sender.send(Message::Ping(Vec::new().into())).await?;
            }
        }
    }

    Ok(())
}

/// Handle a client JSON frame. Returns an optional reply payload.
fn handle_client_message(text: &str, last_pong: &mut Instant) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    match value.get("type").and_then(|t| t.as_str()) {
        Some("PING") => {
            *last_pong = Instant::now();
            Some(
                serde_json::json!({
                    "type": "PONG",
                    "payload": { "timestamp": Utc::now() }
                })
                .to_string(),
            )
        }
        // Subscription is implicit in the path; acknowledge silently.
        Some("SUBSCRIBE") => None,
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_gets_pong_with_timestamp() {
        let mut last_pong = Instant::now() - Duration::from_secs(90);
        let reply = handle_client_message(r#"{"type":"PING"}"#, &mut last_pong).unwrap();
        let value: serde_json::Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(value["type"], "PONG");
        assert!(value["payload"]["timestamp"].is_string());
        assert!(last_pong.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_subscribe_and_garbage_are_silent() {
        let mut last_pong = Instant::now();
        assert!(handle_client_message(r#"{"type":"SUBSCRIBE"}"#, &mut last_pong).is_none());
        assert!(handle_client_message("not json", &mut last_pong).is_none());
        assert!(handle_client_message(r#"{"other":1}"#, &mut last_pong).is_none());
    }
}
