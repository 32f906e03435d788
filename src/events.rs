//! Wire events for the realtime channel.
//!
//! Every frame is `{"type": <event name>, "payload": {...}}`. Event names are
//! a stable wire contract shared with the server; the closed enums below make
//! them a compile-time enumeration instead of a string registry.

use crate::error::Result;
use crate::models::{CallSession, IceCandidate, TypingUser};
use log::debug;
use serde::{Deserialize, Serialize};

// ============================================================================
// Outbound (client -> server)
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ClientEvent {
    #[serde(rename = "authenticate")]
    Authenticate { token: String },

    #[serde(rename = "joinRoom")]
    JoinRoom { room_id: String },
    #[serde(rename = "leaveRoom")]
    LeaveRoom { room_id: String },
    #[serde(rename = "chat:message")]
    ChatMessage {
        room_id: String,
        content: String,
        attachment_id: Option<String>,
    },
    #[serde(rename = "chat:typing")]
    Typing { context_id: String },
    #[serde(rename = "chat:stopTyping")]
    StopTyping { context_id: String },

    #[serde(rename = "direct:join")]
    DirectJoin { conversation_id: String },
    #[serde(rename = "direct:leave")]
    DirectLeave { conversation_id: String },
    #[serde(rename = "direct:message")]
    DirectMessage {
        conversation_id: String,
        content: String,
        attachment_id: Option<String>,
    },

    #[serde(rename = "video:call:initiate")]
    CallInitiate {
        call_id: String,
        conversation_id: String,
        participant_id: String,
    },
    #[serde(rename = "video:call:accept")]
    CallAccept { call_id: String },
    #[serde(rename = "video:call:reject")]
    CallReject {
        call_id: String,
        reason: Option<String>,
    },
    #[serde(rename = "video:call:end")]
    CallEnd { call_id: String },
    #[serde(rename = "video:call:offer")]
    CallOffer { call_id: String, sdp: String },
    #[serde(rename = "video:call:answer")]
    CallAnswer { call_id: String, sdp: String },
    #[serde(rename = "video:call:ice-candidate")]
    CallIceCandidate {
        call_id: String,
        candidate: IceCandidate,
    },
    #[serde(rename = "video:call:status")]
    CallMediaStatus {
        call_id: String,
        is_muted: bool,
        is_camera_off: bool,
    },
}

impl ClientEvent {
    pub fn to_frame(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

// ============================================================================
// Inbound (server -> client)
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingMessage {
    pub message_id: String,
    pub context_id: String,
    pub sender: TypingUser,
    pub content: String,
    #[serde(default)]
    pub attachment_id: Option<String>,
    pub timestamp: i64,
}

/// Enumerated disconnect reasons carried by `connect_error`. Anything the
/// client does not recognize deserializes to `Unknown` and is treated as a
/// transient failure, never as an auth failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectCode {
    AuthExpired,
    AuthInvalid,
    ServerShutdown,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ServerEvent {
    #[serde(rename = "authenticated")]
    Authenticated,
    #[serde(rename = "connect_error")]
    ConnectError {
        code: DisconnectCode,
        #[serde(default)]
        message: Option<String>,
    },

    #[serde(rename = "chat:message")]
    ChatMessage(IncomingMessage),
    #[serde(rename = "chat:typing")]
    Typing {
        context_id: String,
        user: TypingUser,
    },
    #[serde(rename = "chat:stopTyping")]
    StopTyping {
        context_id: String,
        user_id: String,
    },
    #[serde(rename = "direct:message")]
    DirectMessage(IncomingMessage),
    #[serde(rename = "userJoined")]
    UserJoined { room_id: String, user: TypingUser },
    #[serde(rename = "userLeft")]
    UserLeft { room_id: String, user_id: String },
    #[serde(rename = "roomUsers")]
    RoomUsers {
        room_id: String,
        users: Vec<TypingUser>,
    },

    #[serde(rename = "video:call:incoming")]
    CallIncoming { call: CallSession },
    #[serde(rename = "video:call:accepted")]
    CallAccepted { call_id: String },
    #[serde(rename = "video:call:rejected")]
    CallRejected {
        call_id: String,
        #[serde(default)]
        reason: Option<String>,
    },
    #[serde(rename = "video:call:ended")]
    CallEnded { call_id: String },
    #[serde(rename = "video:call:offer")]
    CallOffer { call_id: String, sdp: String },
    #[serde(rename = "video:call:answer")]
    CallAnswer { call_id: String, sdp: String },
    #[serde(rename = "video:call:ice-candidate")]
    CallIceCandidate {
        call_id: String,
        candidate: IceCandidate,
    },
    #[serde(rename = "video:call:status")]
    CallMediaStatus {
        call_id: String,
        is_muted: bool,
        is_camera_off: bool,
    },
    #[serde(rename = "video:call:error")]
    CallError {
        #[serde(default)]
        call_id: Option<String>,
        message: String,
    },
}

impl ServerEvent {
    /// Parse an inbound frame. Malformed or unknown frames are logged and
    /// dropped; they never take the session down.
    pub fn from_frame(text: &str) -> Option<Self> {
        match serde_json::from_str(text) {
            Ok(event) => Some(event),
            Err(e) => {
                debug!("Dropping unparseable frame: {e}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_names_are_stable() {
        let frame = ClientEvent::JoinRoom {
            room_id: "r1".into(),
        }
        .to_frame()
        .unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "joinRoom");
        assert_eq!(value["payload"]["room_id"], "r1");

        let frame = ClientEvent::CallIceCandidate {
            call_id: "c1".into(),
            candidate: IceCandidate {
                candidate: "candidate:1".into(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
            },
        }
        .to_frame()
        .unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "video:call:ice-candidate");
    }

    #[test]
    fn inbound_frames_round_trip() {
        let frame = r#"{"type":"chat:typing","payload":{"context_id":"r1","user":{"user_id":"u1","username":"amy"}}}"#;
        match ServerEvent::from_frame(frame) {
            Some(ServerEvent::Typing { context_id, user }) => {
                assert_eq!(context_id, "r1");
                assert_eq!(user.username, "amy");
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn unknown_or_malformed_frames_are_dropped() {
        assert!(ServerEvent::from_frame("not json").is_none());
        assert!(ServerEvent::from_frame(r#"{"type":"mystery","payload":{}}"#).is_none());
    }

    #[test]
    fn unrecognized_disconnect_code_is_not_auth_flavored() {
        let frame = r#"{"type":"connect_error","payload":{"code":"ping_timeout"}}"#;
        match ServerEvent::from_frame(frame) {
            Some(ServerEvent::ConnectError { code, .. }) => {
                assert_eq!(code, DisconnectCode::Unknown);
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }
}
