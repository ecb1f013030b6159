// ==============
// crates/backend-lib/src/metrics.rs

//! Central place for metric keys
pub const WS_CONNECTION: &str = "ws.connection";
pub const WS_ACTIVE: &str = "ws.active";
pub const WS_AUTH_FAILED: &str = "ws.auth_failed";
pub const SESSION_ACTIVE: &str = "session.active";
pub const SESSION_RELEASED: &str = "session.released";
pub const SESSION_STARTED: &str = "session.started";
pub const SESSION_ENDED: &str = "session.ended";
pub const SESSION_CANCELLED: &str = "session.cancelled";
pub const PARTICIPANT_JOINED: &str = "participant.joined";
pub const PARTICIPANT_LEFT: &str = "participant.left";
pub const SIGNAL_RELAYED: &str = "signal.relayed";
pub const SIGNAL_TARGET_MISSING: &str = "signal.target_missing";
pub const CHAT_SENT: &str = "chat.sent";
pub const AUTH_TOKEN_ISSUED: &str = "auth.token.issued";
pub const AUTH_TOKEN_REVOKED: &str = "auth.token.revoked";
pub const AUTH_TOKEN_EXPIRED: &str = "auth.token.expired";
pub const AUTH_TOKEN_ACTIVE: &str = "auth.token.active";
