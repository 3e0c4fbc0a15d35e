//! WebSocket transport and the reverse-call router.
//!
//! Connected clients form the broadcast set for host-initiated `command`
//! round-trips. Inbound messages are routed per the protocol: a reply to a
//! pending reverse call resolves its awaiter; a `code` string becomes a
//! submission answered with a DISPATCH frame; anything else is MALFORMED.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::error::{PotatError, Result};
use crate::worker::{COMMAND_TIMEOUT, CommandRelay};

use super::AppState;
use super::auth::verify_token;
use super::types::{CLOSE_UNAUTHORIZED, Frame, HEARTBEAT_MESSAGES};

/// Interval between server heartbeats.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Registry of connected socket clients plus the pending reverse-call
/// table.
#[derive(Default)]
pub struct SocketHub {
    clients: RwLock<HashMap<Uuid, mpsc::UnboundedSender<Frame>>>,
    pending: Mutex<HashMap<String, oneshot::Sender<Value>>>,
}

impl SocketHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_clients(&self) -> bool {
        !self.clients.read().expect("client registry poisoned").is_empty()
    }

    fn register(&self, id: Uuid, tx: mpsc::UnboundedSender<Frame>) {
        self.clients
            .write()
            .expect("client registry poisoned")
            .insert(id, tx);
        tracing::info!(client = %id, "Socket client connected");
    }

    fn unregister(&self, id: Uuid) {
        self.clients
            .write()
            .expect("client registry poisoned")
            .remove(&id);
        tracing::info!(client = %id, "Socket client disconnected");
    }

    /// Send a frame to every connected client.
    pub fn broadcast(&self, frame: &Frame) {
        let clients = self.clients.read().expect("client registry poisoned");
        for tx in clients.values() {
            let _ = tx.send(frame.clone());
        }
    }

    /// Resolve a pending reverse call. Returns false for unknown ids.
    pub fn resolve_reply(&self, id: &str, message: Value) -> bool {
        let awaiter = self
            .pending
            .lock()
            .expect("pending table poisoned")
            .remove(id);
        match awaiter {
            Some(tx) => tx.send(message).is_ok(),
            None => false,
        }
    }

    /// Host-initiated round-trip: broadcast a DISPATCH frame and wait for
    /// the first client to answer with the same id.
    pub async fn reverse_call(&self, id: String, code: &str, msg: Value) -> Result<Value> {
        if !self.has_clients() {
            return Err(PotatError::NoSocketClient);
        }

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending table poisoned")
            .insert(id.clone(), tx);

        self.broadcast(&Frame::dispatch(serde_json::json!({
            "id": id,
            "code": code,
            "msg": msg,
        })));

        match tokio::time::timeout(COMMAND_TIMEOUT, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            _ => {
                self.pending
                    .lock()
                    .expect("pending table poisoned")
                    .remove(&id);
                Err(PotatError::CommandTimeout)
            }
        }
    }
}

#[async_trait::async_trait]
impl CommandRelay for SocketHub {
    fn has_clients(&self) -> bool {
        SocketHub::has_clients(self)
    }

    async fn relay(&self, id: &str, name: &str, msg: Value) -> Value {
        match self.reverse_call(id.to_string(), name, msg).await {
            Ok(reply) => reply,
            Err(e) => serde_json::json!({"error": e.to_string()}),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SocketQuery {
    #[serde(default)]
    auth: String,
}

/// `GET /socket` upgrade handler.
pub async fn socket_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SocketQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let authorized = verify_token(&state.settings.auth, &query.auth);
    ws.on_upgrade(move |socket| handle_socket(state, socket, authorized))
}

async fn handle_socket(state: Arc<AppState>, socket: WebSocket, authorized: bool) {
    let (mut sink, mut stream) = socket.split();

    if !authorized {
        let _ = sink
            .send(Message::Close(Some(CloseFrame {
                code: CLOSE_UNAUTHORIZED,
                reason: "unauthorized".into(),
            })))
            .await;
        return;
    }

    let client_id = Uuid::new_v4();
    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
    state.hub.register(client_id, tx.clone());

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    // The first tick fires immediately; skip it so heartbeats start 30s in.
    heartbeat.tick().await;
    let mut beat: usize = 0;

    loop {
        tokio::select! {
            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                if sink.send(Message::Text(frame.to_json().into())).await.is_err() {
                    break;
                }
            }

            _ = heartbeat.tick() => {
                beat = beat.wrapping_add(1);
                let frame = Frame::heartbeat(
                    chrono::Utc::now().timestamp_millis(),
                    HEARTBEAT_MESSAGES[beat % HEARTBEAT_MESSAGES.len()],
                );
                if sink.send(Message::Text(frame.to_json().into())).await.is_err() {
                    break;
                }
            }

            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        handle_inbound(&state, &tx, text.to_string());
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    // Pings are answered by axum; other frames are noise.
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    state.hub.unregister(client_id);
}

/// Route one inbound client message.
fn handle_inbound(state: &Arc<AppState>, tx: &mpsc::UnboundedSender<Frame>, text: String) {
    let Ok(message) = serde_json::from_str::<Value>(&text) else {
        let _ = tx.send(Frame::malformed());
        return;
    };

    let Some(id) = message.get("id").and_then(Value::as_str).map(String::from) else {
        let _ = tx.send(Frame::malformed());
        return;
    };

    // A reply to an outstanding reverse call wins over everything else.
    if state.hub.resolve_reply(&id, message.clone()) {
        return;
    }

    let code = message.get("code").cloned().unwrap_or(Value::Null);
    if !code.as_str().is_some_and(|c| !c.is_empty()) {
        let _ = tx.send(Frame::malformed());
        return;
    }

    // Evaluations can run for seconds; answer from a task so heartbeats
    // and other traffic keep flowing.
    let state = state.clone();
    let tx = tx.clone();
    tokio::spawn(async move {
        let msg = message.get("msg").cloned();
        let response = state.pipeline.submit(&code, msg.as_ref()).await.with_id(id);
        let data = serde_json::to_value(&response).unwrap_or(Value::Null);
        let _ = tx.send(Frame::dispatch(data));
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_reverse_call_without_clients_fails_fast() {
        let hub = SocketHub::new();
        let err = hub
            .reverse_call("rc-1".into(), "ping", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, PotatError::NoSocketClient));
    }

    #[tokio::test]
    async fn test_reverse_call_resolved_by_reply() {
        let hub = Arc::new(SocketHub::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.register(Uuid::new_v4(), tx);

        let caller = hub.clone();
        let call = tokio::spawn(async move {
            caller.reverse_call("rc-2".into(), "ping", json!({"text": "hi"})).await
        });

        // The broadcast frame reaches the registered client.
        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.opcode, super::super::types::opcode::DISPATCH);
        assert_eq!(frame.data["id"], "rc-2");
        assert_eq!(frame.data["code"], "ping");

        assert!(hub.resolve_reply("rc-2", json!({"id": "rc-2", "code": 200})));
        let reply = call.await.unwrap().unwrap();
        assert_eq!(reply["code"], 200);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reverse_call_times_out() {
        let hub = Arc::new(SocketHub::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        hub.register(Uuid::new_v4(), tx);

        let err = hub
            .reverse_call("rc-3".into(), "ping", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, PotatError::CommandTimeout));
        // The pending entry is cleaned up: a late reply resolves nothing.
        assert!(!hub.resolve_reply("rc-3", json!({})));
    }

    #[test]
    fn test_unknown_reply_id_ignored() {
        let hub = SocketHub::new();
        assert!(!hub.resolve_reply("never-seen", json!({})));
    }
}
