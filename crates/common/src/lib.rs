// ================
// crates/common/src/lib.rs
// ================
//! Common types shared between the meetrelay server and its clients.
//! This module defines the session/membership domain model and the
//! opaque signaling envelope relayed between peers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque session identifier.
pub type SessionId = String;
/// Per-connection participant identifier, distinct from the user id:
/// a user reconnecting gets a new participant id.
pub type ParticipantId = String;
/// Stable user account identifier.
pub type UserId = String;

/// Lifecycle state of a session.
///
/// Legal transitions: `Scheduled -> Live`, `Scheduled -> Cancelled`,
/// `Live -> Ended`. `Ended` and `Cancelled` are terminal.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Scheduled,
    Live,
    Ended,
    Cancelled,
}

impl SessionStatus {
    /// Whether new joins are accepted in this state.
    pub fn is_joinable(self) -> bool {
        matches!(self, SessionStatus::Scheduled | SessionStatus::Live)
    }

    /// Whether this state admits no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Ended | SessionStatus::Cancelled)
    }
}

/// Per-session feature toggles.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SessionSettings {
    pub allow_chat: bool,
    pub allow_screen_share: bool,
    pub allow_recording: bool,
    /// Force `is_muted = true` on every new membership.
    pub mute_on_entry: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            allow_chat: true,
            allow_screen_share: true,
            allow_recording: true,
            mute_on_entry: false,
        }
    }
}

/// Durable session record as stored by the persistence collaborator.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SessionRecord {
    pub id: SessionId,
    /// Short human-enterable join code, unique across sessions.
    pub code: String,
    pub host_id: UserId,
    pub status: SessionStatus,
    /// 0 means no explicit limit; the server substitutes its
    /// configured default capacity.
    #[serde(default)]
    pub max_participants: usize,
    pub is_recording: bool,
    pub settings: SessionSettings,
}

impl SessionRecord {
    pub fn new(host_id: UserId, max_participants: usize) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            code: Uuid::new_v4().simple().to_string()[..10].to_uppercase(),
            host_id,
            status: SessionStatus::Scheduled,
            max_participants,
            is_recording: false,
            settings: SessionSettings::default(),
        }
    }
}

/// Connection health of a membership.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Reconnecting,
    Disconnected,
}

/// Role of a participant within one session.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Host,
    Participant,
}

/// One participant-in-session row. Disconnection is a state transition,
/// not deletion: the row survives with `left_at` set.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Membership {
    pub session_id: SessionId,
    pub participant_id: ParticipantId,
    pub user_id: UserId,
    pub display_name: String,
    pub role: Role,
    pub joined_at: DateTime<Utc>,
    pub left_at: Option<DateTime<Utc>>,
    pub is_muted: bool,
    pub is_video_enabled: bool,
    pub is_screen_sharing: bool,
    pub connection_status: ConnectionStatus,
}

/// Partial update to a membership's media flags. Absent fields are
/// left untouched; present fields are last-write-wins.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default)]
pub struct MediaStatePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_muted: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_video_enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_screen_sharing: Option<bool>,
}

impl MediaStatePatch {
    pub fn is_empty(&self) -> bool {
        self.is_muted.is_none()
            && self.is_video_enabled.is_none()
            && self.is_screen_sharing.is_none()
    }
}

/// Kind of peer-negotiation message being relayed.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

/// Point-to-point negotiation envelope. The `payload` is opaque: the
/// server forwards it verbatim and never parses it.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SignalEnvelope {
    pub kind: SignalKind,
    pub session_id: SessionId,
    pub from: ParticipantId,
    pub to: ParticipantId,
    pub payload: serde_json::Value,
}

/// Kind of chat message.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    #[default]
    Text,
    File,
    System,
}

/// A session-scoped chat message with its server-assigned id and
/// timestamp. The sender receives this canonical record back.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ChatMessage {
    pub id: String,
    pub session_id: SessionId,
    pub sender_id: ParticipantId,
    pub sender_name: String,
    pub content: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mentions: Option<Vec<UserId>>,
}
