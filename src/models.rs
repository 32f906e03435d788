//! Data models for LinkUp

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ============================================================================
// Credential
// ============================================================================

/// How long before the actual `exp` instant a token is already treated as
/// expired. Keeps a token from dying mid-request.
pub const EXPIRY_BUFFER: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Deserialize)]
pub struct TokenClaims {
    pub exp: i64,
    #[serde(default)]
    pub sub: Option<String>,
}

/// Bearer token plus its parsed expiry instant.
#[derive(Debug, Clone)]
pub struct Credential {
    pub token: String,
    pub user_id: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl Credential {
    /// Parse the claims segment of a JWT without verifying the signature.
    /// The server is the authority on validity; the client only needs `exp`
    /// to schedule refreshes. Returns `None` for anything undecodable.
    pub fn from_token(token: &str) -> Option<Self> {
        let claims = decode_claims(token)?;
        let expires_at = Utc.timestamp_opt(claims.exp, 0).single()?;
        Some(Self {
            token: token.to_string(),
            user_id: claims.sub,
            expires_at,
        })
    }

    /// True once `now` is within `buffer` of the expiry instant.
    pub fn expires_within(&self, buffer: Duration) -> bool {
        let remaining = self.expires_at - Utc::now();
        remaining <= chrono::Duration::from_std(buffer).unwrap_or(chrono::Duration::zero())
    }

    pub fn is_expired(&self) -> bool {
        self.expires_within(EXPIRY_BUFFER)
    }

    /// Time left until the actual `exp` instant, clamped at zero.
    pub fn time_until_expiry(&self) -> Duration {
        (self.expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
    }
}

fn decode_claims(token: &str) -> Option<TokenClaims> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload).ok()?;
    serde_json::from_slice(&bytes).ok()
}

// ============================================================================
// Channel
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

// ============================================================================
// Chat
// ============================================================================

/// The currently joined chat context. Exactly one is active at a time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatContext {
    None,
    Room(String),
    Conversation(String),
}

impl ChatContext {
    pub fn id(&self) -> Option<&str> {
        match self {
            ChatContext::None => None,
            ChatContext::Room(id) | ChatContext::Conversation(id) => Some(id),
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, ChatContext::None)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingUser {
    pub user_id: String,
    pub username: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

/// Outbound message payload. Dropped entirely when it carries neither text
/// nor an attachment reference.
#[derive(Debug, Clone, Default)]
pub struct OutgoingMessage {
    pub content: String,
    pub attachment_id: Option<String>,
}

impl OutgoingMessage {
    pub fn text(content: &str) -> Self {
        Self {
            content: content.to_string(),
            attachment_id: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.content.trim().is_empty() && self.attachment_id.is_none()
    }
}

// ============================================================================
// Calls
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Calling,
    Ringing,
    Active,
    Ended,
    Rejected,
    Failed,
}

impl CallStatus {
    /// No further transitions are possible from a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ended | Self::Rejected | Self::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallSession {
    pub id: String,
    pub conversation_id: String,
    pub initiator_id: String,
    pub participant_id: String,
    pub status: CallStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub connected_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_secs: Option<i64>,
}

impl CallSession {
    pub fn new_outgoing(conversation_id: &str, initiator_id: &str, participant_id: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            initiator_id: initiator_id.to_string(),
            participant_id: participant_id.to_string(),
            status: CallStatus::Calling,
            created_at: Utc::now(),
            connected_at: None,
            ended_at: None,
            duration_secs: None,
        }
    }
}

/// Local-only media flags, mirrored onto the active device tracks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MediaControls {
    pub is_muted: bool,
    pub is_camera_off: bool,
    pub is_speaker_muted: bool,
}

/// Mirrors the peer transport's own connection-state vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default)]
    pub sdp_mline_index: Option<u16>,
}
