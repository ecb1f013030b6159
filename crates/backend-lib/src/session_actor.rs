// ============================
// crates/backend-lib/src/session_actor.rs
// ============================
//! Per-session actor: the one place membership, capacity, lifecycle
//! and broadcast ordering are decided.
//!
//! Every session that has at least one live connection is backed by a
//! single actor task. All mutating operations arrive as commands over
//! an mpsc channel, so capacity checks, membership mutation and the
//! resulting broadcasts are serialized per session without any lock
//! shared across sessions. Store writes happen inside the actor loop
//! before the in-memory commit, so observers never see a broadcast for
//! a state change that was not durably recorded.
use std::collections::HashMap;

use chrono::Utc;
use meetrelay_common::{
    ChatMessage, ConnectionStatus, MediaStatePatch, Membership, MessageType, ParticipantId, Role,
    SessionRecord, SessionStatus, SignalEnvelope, SignalKind, UserId,
};
use metrics::counter;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::AppError;
use crate::messages::ServerMessage;
use crate::metrics as keys;
use crate::store::Store;

/// Outbound channel of one connected participant.
pub type OutboundTx = mpsc::UnboundedSender<ServerMessage>;

/// Host-only lifecycle transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleAction {
    Start,
    End,
    Cancel,
}

/// Result of a successful join: the caller's own row plus everyone
/// else active at the instant the join was serialized.
#[derive(Debug, Clone)]
pub struct JoinOutcome {
    pub participant: Membership,
    pub existing_participants: Vec<Membership>,
}

/// Message sent *into* the actor
pub enum SessionCmd {
    Join {
        participant_id: ParticipantId,
        user_id: UserId,
        display_name: String,
        tx: OutboundTx,
        resp_tx: mpsc::UnboundedSender<Result<JoinOutcome, AppError>>,
    },
    Leave {
        participant_id: ParticipantId,
        /// Outbound channel of the connection requesting the leave.
        /// A leave from a connection that no longer owns the
        /// membership (a re-join swapped in a newer one) is ignored.
        tx: OutboundTx,
        resp_tx: mpsc::UnboundedSender<bool>,
    },
    Relay {
        envelope: SignalEnvelope,
        resp_tx: mpsc::UnboundedSender<Result<(), AppError>>,
    },
    UpdateMedia {
        participant_id: ParticipantId,
        patch: MediaStatePatch,
        resp_tx: mpsc::UnboundedSender<Result<Membership, AppError>>,
    },
    ScreenShare {
        participant_id: ParticipantId,
        active: bool,
        resp_tx: mpsc::UnboundedSender<Result<(), AppError>>,
    },
    Chat {
        sender_id: ParticipantId,
        content: String,
        message_type: MessageType,
        reply_to_id: Option<String>,
        mentions: Option<Vec<UserId>>,
        resp_tx: mpsc::UnboundedSender<Result<ChatMessage, AppError>>,
    },
    Transition {
        actor_user_id: UserId,
        action: LifecycleAction,
        resp_tx: mpsc::UnboundedSender<Result<SessionStatus, AppError>>,
    },
    Recording {
        actor_user_id: UserId,
        start: bool,
        recording_id: Option<String>,
        resp_tx: mpsc::UnboundedSender<Result<String, AppError>>,
    },
    Snapshot {
        resp_tx: mpsc::UnboundedSender<Vec<Membership>>,
    },
}

/// Handle that connection workers keep: the actor's command channel.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    pub cmd_tx: mpsc::UnboundedSender<SessionCmd>,
}

impl SessionHandle {
    pub async fn join(
        &self,
        participant_id: String,
        user_id: String,
        display_name: String,
        tx: OutboundTx,
    ) -> Result<JoinOutcome, AppError> {
        let (resp_tx, mut resp_rx) = mpsc::unbounded_channel();
        self.cmd_tx.send(SessionCmd::Join {
            participant_id,
            user_id,
            display_name,
            tx,
            resp_tx,
        })?;
        resp_rx
            .recv()
            .await
            .ok_or_else(|| AppError::Internal("session actor dropped reply".to_string()))?
    }

    /// Idempotent: returns `false` if the participant was already gone
    /// or the membership is owned by a newer connection.
    pub async fn leave(&self, participant_id: String, tx: OutboundTx) -> Result<bool, AppError> {
        let (resp_tx, mut resp_rx) = mpsc::unbounded_channel();
        self.cmd_tx.send(SessionCmd::Leave {
            participant_id,
            tx,
            resp_tx,
        })?;
        resp_rx
            .recv()
            .await
            .ok_or_else(|| AppError::Internal("session actor dropped reply".to_string()))
    }

    pub async fn relay(&self, envelope: SignalEnvelope) -> Result<(), AppError> {
        let (resp_tx, mut resp_rx) = mpsc::unbounded_channel();
        self.cmd_tx.send(SessionCmd::Relay { envelope, resp_tx })?;
        resp_rx
            .recv()
            .await
            .ok_or_else(|| AppError::Internal("session actor dropped reply".to_string()))?
    }

    pub async fn update_media(
        &self,
        participant_id: String,
        patch: MediaStatePatch,
    ) -> Result<Membership, AppError> {
        let (resp_tx, mut resp_rx) = mpsc::unbounded_channel();
        self.cmd_tx.send(SessionCmd::UpdateMedia {
            participant_id,
            patch,
            resp_tx,
        })?;
        resp_rx
            .recv()
            .await
            .ok_or_else(|| AppError::Internal("session actor dropped reply".to_string()))?
    }

    pub async fn screen_share(
        &self,
        participant_id: String,
        active: bool,
    ) -> Result<(), AppError> {
        let (resp_tx, mut resp_rx) = mpsc::unbounded_channel();
        self.cmd_tx.send(SessionCmd::ScreenShare {
            participant_id,
            active,
            resp_tx,
        })?;
        resp_rx
            .recv()
            .await
            .ok_or_else(|| AppError::Internal("session actor dropped reply".to_string()))?
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn chat(
        &self,
        sender_id: String,
        content: String,
        message_type: MessageType,
        reply_to_id: Option<String>,
        mentions: Option<Vec<UserId>>,
    ) -> Result<ChatMessage, AppError> {
        let (resp_tx, mut resp_rx) = mpsc::unbounded_channel();
        self.cmd_tx.send(SessionCmd::Chat {
            sender_id,
            content,
            message_type,
            reply_to_id,
            mentions,
            resp_tx,
        })?;
        resp_rx
            .recv()
            .await
            .ok_or_else(|| AppError::Internal("session actor dropped reply".to_string()))?
    }

    pub async fn transition(
        &self,
        actor_user_id: String,
        action: LifecycleAction,
    ) -> Result<SessionStatus, AppError> {
        let (resp_tx, mut resp_rx) = mpsc::unbounded_channel();
        self.cmd_tx.send(SessionCmd::Transition {
            actor_user_id,
            action,
            resp_tx,
        })?;
        resp_rx
            .recv()
            .await
            .ok_or_else(|| AppError::Internal("session actor dropped reply".to_string()))?
    }

    pub async fn recording(
        &self,
        actor_user_id: String,
        start: bool,
        recording_id: Option<String>,
    ) -> Result<String, AppError> {
        let (resp_tx, mut resp_rx) = mpsc::unbounded_channel();
        self.cmd_tx.send(SessionCmd::Recording {
            actor_user_id,
            start,
            recording_id,
            resp_tx,
        })?;
        resp_rx
            .recv()
            .await
            .ok_or_else(|| AppError::Internal("session actor dropped reply".to_string()))?
    }

    /// Current member rows, for tests and diagnostics.
    pub async fn snapshot(&self) -> Result<Vec<Membership>, AppError> {
        let (resp_tx, mut resp_rx) = mpsc::unbounded_channel();
        self.cmd_tx.send(SessionCmd::Snapshot { resp_tx })?;
        resp_rx
            .recv()
            .await
            .ok_or_else(|| AppError::Internal("session actor dropped reply".to_string()))
    }
}

struct Member {
    membership: Membership,
    tx: OutboundTx,
}

pub struct SessionActor {
    record: SessionRecord,
    members: HashMap<ParticipantId, Member>,
    store: Box<dyn Store>,
    max_chat_len: usize,
}

impl SessionActor {
    pub fn new(
        record: SessionRecord,
        store: impl Store + 'static,
        max_chat_len: usize,
    ) -> Self {
        SessionActor {
            record,
            members: HashMap::new(),
            store: Box::new(store),
            max_chat_len,
        }
    }

    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<SessionCmd>) {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                SessionCmd::Join {
                    participant_id,
                    user_id,
                    display_name,
                    tx,
                    resp_tx,
                } => {
                    let result = self
                        .handle_join(participant_id, user_id, display_name, tx)
                        .await;
                    let _ = resp_tx.send(result);
                },
                SessionCmd::Leave {
                    participant_id,
                    tx,
                    resp_tx,
                } => {
                    let left = self.handle_leave(&participant_id, &tx).await;
                    let _ = resp_tx.send(left);
                },
                SessionCmd::Relay { envelope, resp_tx } => {
                    let result = self.handle_relay(envelope);
                    let _ = resp_tx.send(result);
                },
                SessionCmd::UpdateMedia {
                    participant_id,
                    patch,
                    resp_tx,
                } => {
                    let result = self.handle_update_media(&participant_id, patch).await;
                    let _ = resp_tx.send(result);
                },
                SessionCmd::ScreenShare {
                    participant_id,
                    active,
                    resp_tx,
                } => {
                    let result = self.handle_screen_share(&participant_id, active).await;
                    let _ = resp_tx.send(result);
                },
                SessionCmd::Chat {
                    sender_id,
                    content,
                    message_type,
                    reply_to_id,
                    mentions,
                    resp_tx,
                } => {
                    let result = self
                        .handle_chat(&sender_id, content, message_type, reply_to_id, mentions)
                        .await;
                    let _ = resp_tx.send(result);
                },
                SessionCmd::Transition {
                    actor_user_id,
                    action,
                    resp_tx,
                } => {
                    let result = self.handle_transition(&actor_user_id, action).await;
                    let _ = resp_tx.send(result);
                },
                SessionCmd::Recording {
                    actor_user_id,
                    start,
                    recording_id,
                    resp_tx,
                } => {
                    let result = self
                        .handle_recording(&actor_user_id, start, recording_id)
                        .await;
                    let _ = resp_tx.send(result);
                },
                SessionCmd::Snapshot { resp_tx } => {
                    let rows = self
                        .members
                        .values()
                        .map(|m| m.membership.clone())
                        .collect();
                    let _ = resp_tx.send(rows);
                },
            }
        }
    }

    /// Send a broadcast to every member except `skip`.
    fn broadcast_except(&self, skip: Option<&str>, msg: &ServerMessage) {
        for (participant_id, member) in &self.members {
            if skip == Some(participant_id.as_str()) {
                continue;
            }
            // A closed channel means the connection is going away; the
            // disconnect reconciler will remove the member shortly.
            let _ = member.tx.send(msg.clone());
        }
    }

    async fn handle_join(
        &mut self,
        participant_id: ParticipantId,
        user_id: UserId,
        display_name: String,
        tx: OutboundTx,
    ) -> Result<JoinOutcome, AppError> {
        if !self.record.status.is_joinable() {
            return Err(AppError::SessionClosed);
        }

        let rejoin = self.members.contains_key(&participant_id);
        if !rejoin && self.members.len() >= self.record.max_participants {
            return Err(AppError::CapacityExceeded);
        }

        let role = if user_id == self.record.host_id {
            Role::Host
        } else {
            Role::Participant
        };

        let membership = match self.members.get(&participant_id) {
            // Re-join: keep the original row, refresh the connection.
            Some(existing) => {
                let mut row = existing.membership.clone();
                row.connection_status = ConnectionStatus::Connected;
                row.left_at = None;
                row.display_name = display_name;
                row
            },
            None => Membership {
                session_id: self.record.id.clone(),
                participant_id: participant_id.clone(),
                user_id,
                display_name,
                role,
                joined_at: Utc::now(),
                left_at: None,
                is_muted: self.record.settings.mute_on_entry,
                is_video_enabled: true,
                is_screen_sharing: false,
                connection_status: ConnectionStatus::Connected,
            },
        };

        // Persist before committing to memory; a store failure must
        // leave no trace and emit no broadcast.
        self.store.upsert_membership(&membership).await?;

        let existing_participants: Vec<Membership> = self
            .members
            .values()
            .filter(|m| m.membership.participant_id != participant_id)
            .map(|m| m.membership.clone())
            .collect();

        self.members.insert(
            participant_id.clone(),
            Member {
                membership: membership.clone(),
                tx,
            },
        );

        if !rejoin {
            self.broadcast_except(
                Some(&participant_id),
                &ServerMessage::ParticipantJoined {
                    participant: membership.clone(),
                },
            );
        }

        counter!(keys::PARTICIPANT_JOINED).increment(1);
        tracing::info!(
            session_id = %self.record.id,
            participant_id = %participant_id,
            rejoin,
            "participant joined"
        );

        Ok(JoinOutcome {
            participant: membership,
            existing_participants,
        })
    }

    /// Removing the member entry is the idempotence gate: the leave
    /// effect (store write + broadcast) runs only when the entry
    /// actually transitioned from present to absent. A leave from a
    /// connection whose channel no longer matches the member's is a
    /// stale disconnect racing a re-join, and must not evict the
    /// newer connection.
    async fn handle_leave(&mut self, participant_id: &str, tx: &OutboundTx) -> bool {
        let owns_membership = self
            .members
            .get(participant_id)
            .is_some_and(|m| m.tx.same_channel(tx));
        if !owns_membership {
            return false;
        }
        let Some(mut member) = self.members.remove(participant_id) else {
            return false;
        };

        member.membership.connection_status = ConnectionStatus::Disconnected;
        member.membership.left_at = Some(Utc::now());

        // Best-effort persistence: a store outage must not leave the
        // registry with a dangling member, so retry once and move on.
        if let Err(err) = self.store.upsert_membership(&member.membership).await {
            tracing::warn!(
                session_id = %self.record.id,
                participant_id,
                error = %err,
                "failed to persist leave, retrying"
            );
            if let Err(err) = self.store.upsert_membership(&member.membership).await {
                tracing::warn!(
                    session_id = %self.record.id,
                    participant_id,
                    error = %err,
                    "giving up on persisting leave"
                );
            }
        }

        self.broadcast_except(
            None,
            &ServerMessage::ParticipantLeft {
                session_id: self.record.id.clone(),
                participant_id: participant_id.to_string(),
            },
        );

        counter!(keys::PARTICIPANT_LEFT).increment(1);
        tracing::info!(
            session_id = %self.record.id,
            participant_id,
            "participant left"
        );
        true
    }

    /// Forward the envelope verbatim. A missing target is a normal,
    /// recoverable condition, not a connection-level failure.
    fn handle_relay(&self, envelope: SignalEnvelope) -> Result<(), AppError> {
        let SignalEnvelope {
            kind,
            session_id,
            from,
            to,
            payload,
        } = envelope;

        if !self.members.contains_key(&from) {
            return Err(AppError::NotAParticipant(self.record.id.clone()));
        }

        let Some(target) = self.members.get(&to) else {
            counter!(keys::SIGNAL_TARGET_MISSING).increment(1);
            return Err(AppError::TargetNotFound(to));
        };

        let msg = match kind {
            SignalKind::Offer => ServerMessage::SignalOffer {
                session_id,
                from,
                payload,
            },
            SignalKind::Answer => ServerMessage::SignalAnswer {
                session_id,
                from,
                payload,
            },
            SignalKind::IceCandidate => ServerMessage::SignalIceCandidate {
                session_id,
                from,
                payload,
            },
        };
        target.tx.send(msg).map_err(|_| AppError::TargetNotFound(to))?;

        counter!(keys::SIGNAL_RELAYED).increment(1);
        Ok(())
    }

    async fn handle_update_media(
        &mut self,
        participant_id: &str,
        patch: MediaStatePatch,
    ) -> Result<Membership, AppError> {
        // The screen-share setting gates the flag no matter which
        // message carried it.
        if patch.is_screen_sharing == Some(true) && !self.record.settings.allow_screen_share {
            return Err(AppError::Forbidden(
                "screen sharing is disabled for this session".to_string(),
            ));
        }

        let Some(member) = self.members.get(participant_id) else {
            return Err(AppError::NotAParticipant(self.record.id.clone()));
        };

        // Last-write-wins per field; unpatched fields stay untouched.
        let mut updated = member.membership.clone();
        if let Some(is_muted) = patch.is_muted {
            updated.is_muted = is_muted;
        }
        if let Some(is_video_enabled) = patch.is_video_enabled {
            updated.is_video_enabled = is_video_enabled;
        }
        if let Some(is_screen_sharing) = patch.is_screen_sharing {
            updated.is_screen_sharing = is_screen_sharing;
        }

        self.store.upsert_membership(&updated).await?;

        if let Some(member) = self.members.get_mut(participant_id) {
            member.membership = updated.clone();
        }

        self.broadcast_except(
            Some(participant_id),
            &ServerMessage::MediaStateChanged {
                session_id: self.record.id.clone(),
                participant_id: participant_id.to_string(),
                is_muted: updated.is_muted,
                is_video_enabled: updated.is_video_enabled,
                is_screen_sharing: updated.is_screen_sharing,
            },
        );

        Ok(updated)
    }

    async fn handle_screen_share(
        &mut self,
        participant_id: &str,
        active: bool,
    ) -> Result<(), AppError> {
        if !self.record.settings.allow_screen_share {
            return Err(AppError::Forbidden(
                "screen sharing is disabled for this session".to_string(),
            ));
        }

        // Persist through the same path as a media patch, but announce
        // with the dedicated screen-share events.
        let Some(member) = self.members.get(participant_id) else {
            return Err(AppError::NotAParticipant(self.record.id.clone()));
        };
        let mut updated = member.membership.clone();
        updated.is_screen_sharing = active;
        self.store.upsert_membership(&updated).await?;
        if let Some(member) = self.members.get_mut(participant_id) {
            member.membership = updated;
        }

        let msg = if active {
            ServerMessage::ScreenShareStarted {
                session_id: self.record.id.clone(),
                participant_id: participant_id.to_string(),
            }
        } else {
            ServerMessage::ScreenShareStopped {
                session_id: self.record.id.clone(),
                participant_id: participant_id.to_string(),
            }
        };
        self.broadcast_except(Some(participant_id), &msg);
        Ok(())
    }

    async fn handle_chat(
        &mut self,
        sender_id: &str,
        content: String,
        message_type: MessageType,
        reply_to_id: Option<String>,
        mentions: Option<Vec<UserId>>,
    ) -> Result<ChatMessage, AppError> {
        if !self.record.settings.allow_chat {
            return Err(AppError::Forbidden(
                "chat is disabled for this session".to_string(),
            ));
        }

        let Some(sender) = self.members.get(sender_id) else {
            return Err(AppError::NotAParticipant(self.record.id.clone()));
        };

        if content.len() > self.max_chat_len {
            return Err(AppError::ContentTooLong(self.max_chat_len));
        }

        let message = ChatMessage {
            id: Uuid::new_v4().to_string(),
            session_id: self.record.id.clone(),
            sender_id: sender_id.to_string(),
            sender_name: sender.membership.display_name.clone(),
            content,
            message_type,
            timestamp: Utc::now(),
            reply_to_id,
            mentions,
        };

        // Persist first so the echoed record is the canonical one.
        self.store.insert_message(&message).await?;

        // Chat echoes back to the sender, unlike media-state changes.
        self.broadcast_except(
            None,
            &ServerMessage::ChatMessage {
                message: message.clone(),
            },
        );

        counter!(keys::CHAT_SENT).increment(1);
        Ok(message)
    }

    async fn handle_transition(
        &mut self,
        actor_user_id: &str,
        action: LifecycleAction,
    ) -> Result<SessionStatus, AppError> {
        if actor_user_id != self.record.host_id {
            return Err(AppError::Forbidden(
                "only the host may change the session state".to_string(),
            ));
        }

        let next = match (self.record.status, action) {
            (SessionStatus::Scheduled, LifecycleAction::Start) => SessionStatus::Live,
            (SessionStatus::Scheduled, LifecycleAction::Cancel) => SessionStatus::Cancelled,
            (SessionStatus::Live, LifecycleAction::End) => SessionStatus::Ended,
            (status, _) if status.is_terminal() => return Err(AppError::SessionClosed),
            (status, action) => {
                return Err(AppError::InvalidInput(format!(
                    "cannot apply {action:?} while {status:?}"
                )))
            },
        };

        // Persist the transition before anyone observes it.
        self.store
            .update_session_status(&self.record.id, next)
            .await?;
        self.record.status = next;

        match next {
            SessionStatus::Live => {
                self.broadcast_except(
                    None,
                    &ServerMessage::SessionStarted {
                        session_id: self.record.id.clone(),
                    },
                );
                counter!(keys::SESSION_STARTED).increment(1);
            },
            SessionStatus::Cancelled => {
                self.broadcast_except(
                    None,
                    &ServerMessage::SessionCancelled {
                        session_id: self.record.id.clone(),
                    },
                );
                counter!(keys::SESSION_CANCELLED).increment(1);
            },
            SessionStatus::Ended => {
                self.broadcast_except(
                    None,
                    &ServerMessage::SessionEnded {
                        session_id: self.record.id.clone(),
                    },
                );
                self.disconnect_all().await;
                counter!(keys::SESSION_ENDED).increment(1);
            },
            SessionStatus::Scheduled => unreachable!("no transition targets Scheduled"),
        }

        tracing::info!(
            session_id = %self.record.id,
            status = ?next,
            "session transitioned"
        );
        Ok(next)
    }

    /// Mark every remaining membership disconnected and release the
    /// in-memory set. Runs after the session-ended broadcast so every
    /// member hears about the end before its channel is dropped.
    async fn disconnect_all(&mut self) {
        let now = Utc::now();
        for (participant_id, mut member) in self.members.drain() {
            member.membership.connection_status = ConnectionStatus::Disconnected;
            member.membership.left_at = Some(now);
            if let Err(err) = self.store.upsert_membership(&member.membership).await {
                tracing::warn!(
                    session_id = %self.record.id,
                    participant_id = %participant_id,
                    error = %err,
                    "failed to persist disconnect during session end"
                );
            }
        }
    }

    async fn handle_recording(
        &mut self,
        actor_user_id: &str,
        start: bool,
        recording_id: Option<String>,
    ) -> Result<String, AppError> {
        if !self.record.settings.allow_recording {
            return Err(AppError::Forbidden(
                "recording is disabled for this session".to_string(),
            ));
        }
        if actor_user_id != self.record.host_id {
            return Err(AppError::Forbidden(
                "only the host may control recording".to_string(),
            ));
        }

        self.store.set_recording(&self.record.id, start).await?;
        self.record.is_recording = start;

        let recording_id =
            recording_id.unwrap_or_else(|| format!("rec_{}", Uuid::new_v4().simple()));

        let msg = if start {
            ServerMessage::RecordingStarted {
                session_id: self.record.id.clone(),
                recording_id: recording_id.clone(),
            }
        } else {
            ServerMessage::RecordingStopped {
                session_id: self.record.id.clone(),
                recording_id: recording_id.clone(),
            }
        };
        self.broadcast_except(None, &msg);
        Ok(recording_id)
    }
}

/// Spawn a new session actor and return its handle
pub fn spawn_session_actor(
    record: SessionRecord,
    store: impl Store + 'static,
    max_chat_len: usize,
) -> SessionHandle {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let actor = SessionActor::new(record, store, max_chat_len);

    tokio::spawn(async move {
        actor.run(cmd_rx).await;
    });

    SessionHandle { cmd_tx }
}
