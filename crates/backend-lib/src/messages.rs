// ================
// crates/backend-lib/src/messages.rs
// ================
//! WebSocket protocol messages.
//!
//! Inbound message kinds form a closed enum dispatched through an
//! exhaustive `match` in the router, so every kind the server accepts
//! is visible in one place and unknown kinds fail at parse time.

use meetrelay_common::{
    ChatMessage, MediaStatePatch, Membership, MessageType, ParticipantId, SessionId, UserId,
};
use serde::{Deserialize, Serialize};

/// Messages sent from client to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Join a session as a new or returning participant.
    Join {
        session_id: SessionId,
        participant_id: ParticipantId,
        display_name: String,
    },
    /// Voluntarily leave a session.
    Leave {
        session_id: SessionId,
        participant_id: ParticipantId,
    },
    /// Relay an SDP offer to a specific participant.
    SignalOffer {
        to: ParticipantId,
        payload: serde_json::Value,
    },
    /// Relay an SDP answer to a specific participant.
    SignalAnswer {
        to: ParticipantId,
        payload: serde_json::Value,
    },
    /// Relay an ICE candidate to a specific participant.
    SignalIceCandidate {
        to: ParticipantId,
        payload: serde_json::Value,
    },
    /// Patch the sender's media state.
    MediaStateChanged {
        #[serde(flatten)]
        patch: MediaStatePatch,
    },
    ScreenShareStarted {},
    ScreenShareStopped {},
    /// Send a chat message to the session.
    ChatSend {
        content: String,
        #[serde(default)]
        message_type: MessageType,
        #[serde(default)]
        reply_to_id: Option<String>,
        #[serde(default)]
        mentions: Option<Vec<UserId>>,
    },
    SessionStart { session_id: SessionId },
    SessionEnd { session_id: SessionId },
    SessionCancel { session_id: SessionId },
    RecordingStart { session_id: SessionId },
    RecordingStop {
        session_id: SessionId,
        recording_id: String,
    },
}

/// Messages sent from server to client: direct acknowledgements and
/// session-scoped broadcasts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Ack for a successful join: the caller's own record plus everyone
    /// else currently active. The joiner never appears in its own list.
    Joined {
        participant: Membership,
        existing_participants: Vec<Membership>,
    },
    /// Generic success ack.
    Ack { success: bool },
    /// Ack for a chat send carrying the canonical persisted record.
    ChatAck { message: ChatMessage },
    /// Error ack. Only auth failures also close the connection.
    Error { code: String, message: String },
    /// The inbound frame could not be parsed.
    MalformedMessage { err_msg: String },

    // Broadcasts
    ParticipantJoined { participant: Membership },
    ParticipantLeft {
        session_id: SessionId,
        participant_id: ParticipantId,
    },
    SessionStarted { session_id: SessionId },
    SessionEnded { session_id: SessionId },
    SessionCancelled { session_id: SessionId },
    MediaStateChanged {
        session_id: SessionId,
        participant_id: ParticipantId,
        is_muted: bool,
        is_video_enabled: bool,
        is_screen_sharing: bool,
    },
    ScreenShareStarted {
        session_id: SessionId,
        participant_id: ParticipantId,
    },
    ScreenShareStopped {
        session_id: SessionId,
        participant_id: ParticipantId,
    },
    ChatMessage { message: ChatMessage },
    RecordingStarted {
        session_id: SessionId,
        recording_id: String,
    },
    RecordingStopped {
        session_id: SessionId,
        recording_id: String,
    },
    /// Relayed negotiation envelopes addressed to this connection.
    /// Outbound type names mirror the inbound ones.
    SignalOffer {
        session_id: SessionId,
        from: ParticipantId,
        payload: serde_json::Value,
    },
    SignalAnswer {
        session_id: SessionId,
        from: ParticipantId,
        payload: serde_json::Value,
    },
    SignalIceCandidate {
        session_id: SessionId,
        from: ParticipantId,
        payload: serde_json::Value,
    },
}

impl ServerMessage {
    /// Build an error ack from an application error.
    pub fn from_error(err: &crate::error::AppError) -> Self {
        ServerMessage::Error {
            code: err.error_code().to_string(),
            message: err.sanitized_message(),
        }
    }
}
