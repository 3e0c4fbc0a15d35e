//! Wire types for the WebSocket transport.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Frame opcodes, 4000–4007.
#[allow(dead_code)] // The full range is part of the protocol.
pub mod opcode {
    pub const RECEIVED_DATA: u16 = 4000;
    pub const RECONNECT: u16 = 4001;
    pub const UNKNOWN_ERROR: u16 = 4002;
    pub const INVALID_ORIGIN: u16 = 4003;
    pub const DISPATCH: u16 = 4004;
    pub const HEARTBEAT: u16 = 4005;
    pub const MALFORMED_DATA: u16 = 4006;
    pub const UNAUTHORIZED: u16 = 4007;
}

/// Close code used when the socket handshake fails auth.
pub const CLOSE_UNAUTHORIZED: u16 = opcode::UNAUTHORIZED;

/// Harmless strings rotated through heartbeat frames.
pub const HEARTBEAT_MESSAGES: &[&str] = &[
    "drink some water",
    "stretch your legs",
    "the potatoes are fine",
    "nothing to report",
    "still here",
    "all quiet on the socket front",
];

/// JSON envelope for every server-to-client message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub opcode: u16,
    pub data: Value,
}

impl Frame {
    pub fn dispatch(data: Value) -> Self {
        Self {
            opcode: opcode::DISPATCH,
            data,
        }
    }

    pub fn malformed() -> Self {
        Self {
            opcode: opcode::MALFORMED_DATA,
            data: json!({"message": "Malformed data"}),
        }
    }

    pub fn heartbeat(timestamp: i64, message: &str) -> Self {
        Self {
            opcode: opcode::HEARTBEAT,
            data: json!({"timestamp": timestamp, "message": message}),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("Frame serialization failed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_values() {
        assert_eq!(opcode::RECEIVED_DATA, 4000);
        assert_eq!(opcode::DISPATCH, 4004);
        assert_eq!(opcode::HEARTBEAT, 4005);
        assert_eq!(opcode::MALFORMED_DATA, 4006);
        assert_eq!(opcode::UNAUTHORIZED, 4007);
    }

    #[test]
    fn test_frame_roundtrip() {
        let frame = Frame::dispatch(json!({"id": "u1", "data": ["2"]}));
        let parsed: Frame = serde_json::from_str(&frame.to_json()).unwrap();
        assert_eq!(parsed.opcode, 4004);
        assert_eq!(parsed.data["id"], "u1");
    }

    #[test]
    fn test_heartbeat_shape() {
        let frame = Frame::heartbeat(1700000000000, HEARTBEAT_MESSAGES[0]);
        assert_eq!(frame.opcode, 4005);
        assert_eq!(frame.data["timestamp"], 1700000000000i64);
        assert!(frame.data["message"].is_string());
    }
}
