//! Worker processes and their supervision.
//!
//! The primary process owns a [`pool::WorkerPool`] of
//! [`supervisor`]-managed child processes. Children run the sandbox kernel
//! and talk to the parent over the newline-delimited JSON
//! [`protocol`]. The [`CommandBridge`] lives on the child side and carries
//! guest `command(...)` calls up to whatever [`CommandRelay`] the parent
//! wired in (the socket hub in production).

pub mod pool;
pub mod protocol;
pub mod spawn;
pub mod supervisor;
pub mod worker_main;

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::context;
use protocol::ChildMessage;

/// How the parent resolves a child-originated `command` round-trip.
#[async_trait::async_trait]
pub trait CommandRelay: Send + Sync {
    /// Whether any socket client is currently connected.
    fn has_clients(&self) -> bool;

    /// Broadcast the command to the connected clients and return the first
    /// reply, or an `{error}` object on failure/timeout. Never panics and
    /// never hangs past the reverse-call budget.
    async fn relay(&self, id: &str, name: &str, msg: Value) -> Value;
}

/// Reverse-call budget for one `command` round-trip.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Child-side bridge for guest `command(...)` calls.
///
/// Each call writes a [`ChildMessage::Command`] upstream and parks a
/// oneshot under its UUID until the parent's `CommandReply` lands or the
/// budget runs out. Single-threaded (the worker runs on a `LocalSet`), so
/// plain `Rc<RefCell<..>>` state is enough.
#[derive(Clone)]
pub struct CommandBridge {
    pending: Rc<RefCell<HashMap<String, oneshot::Sender<Value>>>>,
    outbound: mpsc::UnboundedSender<ChildMessage>,
}

impl CommandBridge {
    pub fn new(outbound: mpsc::UnboundedSender<ChildMessage>) -> Self {
        Self {
            pending: Rc::new(RefCell::new(HashMap::new())),
            outbound,
        }
    }

    /// Resolve a pending round-trip. Returns false for unknown ids
    /// (already timed out, or never ours).
    pub fn resolve(&self, id: &str, data: Value) -> bool {
        match self.pending.borrow_mut().remove(id) {
            Some(reply) => reply.send(data).is_ok(),
            None => false,
        }
    }

    /// Issue a command round-trip on behalf of the guest.
    ///
    /// `Err` carries the message to throw inside the guest.
    pub async fn call(&self, name: &str, text: &str, msg: &Value) -> Result<Value, String> {
        let id = Uuid::new_v4().to_string();

        let mut frame_msg = context::potat_context(msg);
        if !frame_msg.is_object() {
            frame_msg = Value::Object(serde_json::Map::new());
        }
        frame_msg["text"] = Value::String(text.to_string());

        let (tx, rx) = oneshot::channel();
        self.pending.borrow_mut().insert(id.clone(), tx);

        let sent = self.outbound.send(ChildMessage::Command {
            id: id.clone(),
            name: name.to_string(),
            msg: frame_msg,
        });
        if sent.is_err() {
            self.pending.borrow_mut().remove(&id);
            return Err("No client connected".to_string());
        }

        match tokio::time::timeout(COMMAND_TIMEOUT, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            _ => {
                self.pending.borrow_mut().remove(&id);
                Err("Command timed out".to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_bridge_resolves_reply() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let bridge = CommandBridge::new(tx);

        let caller = bridge.clone();
        let call = tokio::task::LocalSet::new();
        call.run_until(async move {
            let pending = tokio::task::spawn_local(async move {
                caller
                    .call("ping", "a b", &json!({"user": {"id": "1"}}))
                    .await
            });

            // The outbound frame carries the merged text.
            let outbound = rx.recv().await.unwrap();
            let id = match outbound {
                ChildMessage::Command { id, name, msg } => {
                    assert_eq!(name, "ping");
                    assert_eq!(msg["text"], "a b");
                    assert_eq!(msg["user"]["id"], "1");
                    id
                }
                other => panic!("expected Command, got {other:?}"),
            };

            assert!(bridge.resolve(&id, json!({"id": id, "code": 200})));
            let reply = pending.await.unwrap().unwrap();
            assert_eq!(reply["code"], 200);
        })
        .await;
    }

    #[tokio::test]
    async fn test_bridge_unknown_id_is_ignored() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let bridge = CommandBridge::new(tx);
        assert!(!bridge.resolve("nope", json!({})));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bridge_times_out() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let bridge = CommandBridge::new(tx);

        let local = tokio::task::LocalSet::new();
        local
            .run_until(async move {
                let err = bridge.call("ping", "", &json!({})).await.unwrap_err();
                assert_eq!(err, "Command timed out");
            })
            .await;
    }
}
