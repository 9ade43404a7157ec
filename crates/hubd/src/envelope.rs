//! Server-originated envelopes and the error taxonomy.
//!
//! Peer-originated envelopes never appear here: the hub forwards them
//! verbatim without parsing. Everything the hub itself puts on the wire
//! is one of the JSON event shapes below, sent as a text frame.

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use std::fmt;
use tungstenite::protocol::frame::coding::CloseCode;
use tungstenite::protocol::CloseFrame;
use tungstenite::Message;

/// `senderId` carried by every hub-originated event.
pub const SERVER_SENDER: &str = "server";

/// Error kinds the hub emits in `error` envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Malformed query, oversized frame, or duplicate client id.
    BadRequest,
    /// The token verifier rejected the bearer token.
    AuthFailed,
    /// The room is at capacity.
    RoomFull,
    /// The sender exceeded the per-connection message rate.
    RateLimited,
    /// The member's outbound queue overflowed.
    SlowConsumer,
    /// Any uncaught per-connection fault.
    Internal,
}

impl ErrorCode {
    /// Wire spelling of the code.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::BadRequest => "bad_request",
            ErrorCode::AuthFailed => "auth_failed",
            ErrorCode::RoomFull => "room_full",
            ErrorCode::RateLimited => "rate_limited",
            ErrorCode::SlowConsumer => "slow_consumer",
            ErrorCode::Internal => "internal",
        }
    }

    /// WebSocket close code used when this error terminates the connection.
    /// `RateLimited` never closes; its mapping is unused.
    pub fn close_code(self) -> u16 {
        match self {
            ErrorCode::BadRequest => 4001,
            ErrorCode::RoomFull => 4002,
            ErrorCode::AuthFailed => 4003,
            ErrorCode::SlowConsumer => 4004,
            ErrorCode::RateLimited | ErrorCode::Internal => 1011,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Close code sent when a room is reclaimed by the idle sweeper.
pub const CLOSE_IDLE_EXPIRED: u16 = 4000;
/// Close code sent to every live connection on graceful shutdown.
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// Event kinds the hub originates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A member entered the room.
    PeerJoined,
    /// A member left the room.
    PeerLeft,
    /// The hub rejected or dropped something.
    Error,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
enum EventPayload {
    Peer {
        #[serde(rename = "peerId")]
        peer_id: String,
        ts: String,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
}

/// A hub-originated envelope, serialized as a compact JSON text frame.
#[derive(Debug, Clone, Serialize)]
pub struct ServerEvent {
    #[serde(rename = "type")]
    kind: EventKind,
    #[serde(rename = "senderId")]
    sender_id: &'static str,
    #[serde(rename = "targetId")]
    target_id: String,
    payload: EventPayload,
}

fn now_ts() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

impl ServerEvent {
    /// Announce a new member to the room.
    pub fn peer_joined(peer_id: &str) -> Self {
        Self {
            kind: EventKind::PeerJoined,
            sender_id: SERVER_SENDER,
            target_id: "*".to_string(),
            payload: EventPayload::Peer {
                peer_id: peer_id.to_string(),
                ts: now_ts(),
            },
        }
    }

    /// Announce a departed member to the room.
    pub fn peer_left(peer_id: &str) -> Self {
        Self {
            kind: EventKind::PeerLeft,
            sender_id: SERVER_SENDER,
            target_id: "*".to_string(),
            payload: EventPayload::Peer {
                peer_id: peer_id.to_string(),
                ts: now_ts(),
            },
        }
    }

    /// An `error` envelope addressed to a specific client id, or `"*"`
    /// when the offender's id is not yet known.
    pub fn error(code: ErrorCode, target_id: &str, message: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Error,
            sender_id: SERVER_SENDER,
            target_id: target_id.to_string(),
            payload: EventPayload::Error {
                code,
                message: message.into(),
            },
        }
    }

    /// The event's kind.
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Encode as a WebSocket text frame.
    pub fn to_message(&self) -> Message {
        let json = serde_json::to_string(self).expect("serialize server event");
        Message::Text(json)
    }
}

/// A close frame with the given code and reason.
pub fn close_frame(code: u16, reason: &'static str) -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::from(code),
        reason: reason.into(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn peer_joined_matches_wire_shape() {
        let event = ServerEvent::peer_joined("B");
        let v: Value = serde_json::from_str(&serde_json::to_string(&event).unwrap()).unwrap();
        assert_eq!(v["type"], "peer_joined");
        assert_eq!(v["senderId"], "server");
        assert_eq!(v["targetId"], "*");
        assert_eq!(v["payload"]["peerId"], "B");
        assert!(v["payload"]["ts"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn peer_left_matches_wire_shape() {
        let event = ServerEvent::peer_left("A");
        let v: Value = serde_json::from_str(&serde_json::to_string(&event).unwrap()).unwrap();
        assert_eq!(v["type"], "peer_left");
        assert_eq!(v["payload"]["peerId"], "A");
    }

    #[test]
    fn error_event_carries_code_and_target() {
        let event = ServerEvent::error(ErrorCode::RoomFull, "E", "Room has reached max capacity (4).");
        let v: Value = serde_json::from_str(&serde_json::to_string(&event).unwrap()).unwrap();
        assert_eq!(v["type"], "error");
        assert_eq!(v["targetId"], "E");
        assert_eq!(v["payload"]["code"], "room_full");
        assert_eq!(v["payload"]["message"], "Room has reached max capacity (4).");
    }

    #[test]
    fn error_codes_serialize_snake_case() {
        for (code, expected) in [
            (ErrorCode::BadRequest, "\"bad_request\""),
            (ErrorCode::AuthFailed, "\"auth_failed\""),
            (ErrorCode::RoomFull, "\"room_full\""),
            (ErrorCode::RateLimited, "\"rate_limited\""),
            (ErrorCode::SlowConsumer, "\"slow_consumer\""),
            (ErrorCode::Internal, "\"internal\""),
        ] {
            assert_eq!(serde_json::to_string(&code).unwrap(), expected);
        }
    }

    #[test]
    fn close_codes_are_stable() {
        assert_eq!(ErrorCode::BadRequest.close_code(), 4001);
        assert_eq!(ErrorCode::RoomFull.close_code(), 4002);
        assert_eq!(ErrorCode::AuthFailed.close_code(), 4003);
        assert_eq!(ErrorCode::SlowConsumer.close_code(), 4004);
        assert_eq!(CLOSE_IDLE_EXPIRED, 4000);
    }

    #[test]
    fn to_message_is_text() {
        let msg = ServerEvent::peer_joined("X").to_message();
        assert!(matches!(msg, Message::Text(_)));
    }
}
