//! IPC protocol for worker subprocess communication.
//!
//! Messages are JSON-serialized and newline-delimited over the child's
//! stdin/stdout. Unlike a strict request/reply pipe, the stream is
//! bidirectional: the parent sends jobs and command replies down, the child
//! sends results up and may originate `command` round-trips of its own
//! while an evaluation is still running.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message from parent to worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParentMessage {
    /// Evaluate a snippet.
    Job {
        /// Request id, unique per child generation.
        id: u64,
        /// Untrusted source text.
        code: String,
        /// Caller context, if any.
        msg: Option<Value>,
        /// Whether a socket client is connected (gates the guest `command`
        /// capability).
        socket: bool,
    },

    /// Reply to a child-originated [`ChildMessage::Command`].
    CommandReply {
        id: String,
        /// The resolved reply, or an `{error}` object on timeout.
        data: Value,
    },

    /// Graceful shutdown request.
    Exit,
}

/// Message from worker to parent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChildMessage {
    /// Worker is initialized and accepting jobs.
    Ready,

    /// Evaluation finished; `result` is the stringified guest value
    /// (including 🚫-prefixed guest faults).
    Result { id: u64, result: String },

    /// Evaluation failed catastrophically (isolate death, not a guest
    /// fault).
    Error { id: u64, message: String },

    /// Guest invoked `command(...)`; the parent must broadcast it to the
    /// socket clients and reply with [`ParentMessage::CommandReply`].
    Command {
        id: String,
        name: String,
        /// Caller msg with `text` merged in, ready for the DISPATCH frame.
        msg: Value,
    },
}

impl ParentMessage {
    /// Serialize to a JSON line (with trailing newline).
    pub fn to_line(&self) -> String {
        let mut json = serde_json::to_string(self).expect("ParentMessage serialization failed");
        json.push('\n');
        json
    }

    /// Deserialize from a JSON line.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}

impl ChildMessage {
    /// Serialize to a JSON line (with trailing newline).
    pub fn to_line(&self) -> String {
        let mut json = serde_json::to_string(self).expect("ChildMessage serialization failed");
        json.push('\n');
        json
    }

    /// Deserialize from a JSON line.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}
