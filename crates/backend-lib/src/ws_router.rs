// ============================
// crates/backend-lib/src/ws_router.rs
// ============================
//! WebSocket router, connection gatekeeper and per-connection worker.
//!
//! Each client holds one persistent WebSocket. The bearer token is
//! presented as a query parameter and verified before the upgrade;
//! a connection that cannot be verified within the configured window
//! is rejected with no state created. After the upgrade, one worker
//! task owns the connection: it dispatches the closed set of inbound
//! message kinds and, on transport loss, runs the disconnect
//! reconciler exactly once.
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use meetrelay_common::{ParticipantId, SessionId, SignalEnvelope, SignalKind, UserId};
use metrics::{counter, gauge};
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::auth::Identity;
use crate::error::AppError;
use crate::messages::{ClientMessage, ServerMessage};
use crate::metrics as keys;
use crate::session_actor::{LifecycleAction, OutboundTx};
use crate::store::Store;
use crate::validation;
use crate::AppState;

/// Create the WebSocket router
pub fn create_router<S: Store + Clone + 'static>(state: Arc<AppState<S>>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(state)
}

#[derive(Deserialize)]
struct WsParams {
    token: Option<String>,
}

/// Handler for WebSocket connections. Authentication runs once, here,
/// before any session operation is possible.
async fn ws_handler<S: Store + Clone + 'static>(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<Arc<AppState<S>>>,
) -> Result<impl IntoResponse, AppError> {
    let token = params
        .token
        .ok_or_else(|| AppError::Auth("missing bearer token".to_string()))?;

    let window = Duration::from_secs(state.settings.auth_timeout_secs);
    let identity = match tokio::time::timeout(window, state.verifier.verify(&token)).await {
        Ok(result) => result,
        Err(_) => Err(AppError::Auth("authentication timed out".to_string())),
    };
    let identity = identity.inspect_err(|_| {
        counter!(keys::WS_AUTH_FAILED).increment(1);
    })?;

    counter!(keys::WS_CONNECTION).increment(1);

    Ok(ws.on_upgrade(move |socket| handle_connection(socket, state, identity)))
}

async fn handle_connection<S: Store + Clone + 'static>(
    socket: WebSocket,
    state: Arc<AppState<S>>,
    identity: Identity,
) {
    gauge!(keys::WS_ACTIVE).increment(1.0);

    let (mut ws_tx, mut ws_rx) = socket.split();

    // One outbound channel per connection: direct acks and session
    // broadcasts share it, so each client observes a single FIFO.
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ServerMessage>();

    let send_task = tokio::spawn(async move {
        while let Some(server_msg) = outbound_rx.recv().await {
            let json = match serde_json::to_string(&server_msg) {
                Ok(json) => json,
                Err(err) => {
                    tracing::error!(error = %err, "failed to serialize outbound message");
                    continue;
                },
            };
            if ws_tx.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    let mut worker = ConnectionWorker::new(state, identity, outbound_tx.clone());

    while let Some(Ok(message)) = ws_rx.next().await {
        match message {
            Message::Text(text) => {
                let response = match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(client_msg) => match worker.handle_message(client_msg).await {
                        Ok(response) => response,
                        Err(err) => ServerMessage::from_error(&err),
                    },
                    Err(err) => ServerMessage::MalformedMessage {
                        err_msg: err.to_string(),
                    },
                };
                if outbound_tx.send(response).is_err() {
                    break;
                }
            },
            Message::Close(_) => break,
            // Pings are answered by axum; binary frames are not part
            // of the protocol.
            _ => {},
        }
    }

    // Disconnect reconciliation: never raises, runs exactly once.
    worker.reconcile_disconnect().await;

    gauge!(keys::WS_ACTIVE).decrement(1.0);
    send_task.abort();
}

/// Per-connection worker: owns the connection's session binding and
/// dispatches every inbound message kind.
pub struct ConnectionWorker<S: Store + Clone + 'static> {
    state: Arc<AppState<S>>,
    identity: Identity,
    outbound: OutboundTx,
    /// The in-memory binding of this connection to a (session,
    /// participant) pair. `take()`-ing it is the atomic gate that
    /// guarantees the leave effect runs at most once per connection.
    binding: Option<(SessionId, ParticipantId)>,
}

impl<S: Store + Clone + 'static> ConnectionWorker<S> {
    pub fn new(state: Arc<AppState<S>>, identity: Identity, outbound: OutboundTx) -> Self {
        Self {
            state,
            identity,
            outbound,
            binding: None,
        }
    }

    pub fn user_id(&self) -> &UserId {
        &self.identity.user_id
    }

    /// Handle one inbound message and produce its acknowledgement.
    /// Errors are surfaced to the caller as error acks; none of them
    /// terminate the connection.
    pub async fn handle_message(
        &mut self,
        msg: ClientMessage,
    ) -> Result<ServerMessage, AppError> {
        match msg {
            ClientMessage::Join {
                session_id,
                participant_id,
                display_name,
            } => {
                validation::validate_session_id(&session_id)
                    .map_err(|e| AppError::InvalidInput(e.to_string()))?;
                validation::validate_participant_id(&participant_id)
                    .map_err(|e| AppError::InvalidInput(e.to_string()))?;
                let display_name = validation::validate_display_name(&display_name)
                    .map_err(|e| AppError::InvalidInput(e.to_string()))?
                    .to_string();

                // One membership per connection: a bound connection may
                // only re-join as itself. Anything else would orphan
                // the old membership and its capacity slot.
                if let Some((bound_session, bound_participant)) = &self.binding {
                    if *bound_session != session_id || *bound_participant != participant_id {
                        return Err(AppError::InvalidInput(
                            "connection is already bound to a session".to_string(),
                        ));
                    }
                }

                let handle = self
                    .state
                    .registry
                    .get_or_spawn(&session_id, &self.state.store)
                    .await?;
                let outcome = handle
                    .join(
                        participant_id.clone(),
                        self.identity.user_id.clone(),
                        display_name,
                        self.outbound.clone(),
                    )
                    .await?;

                self.binding = Some((session_id, participant_id));

                Ok(ServerMessage::Joined {
                    participant: outcome.participant,
                    existing_participants: outcome.existing_participants,
                })
            },
            ClientMessage::Leave {
                session_id,
                participant_id,
            } => {
                let matches_binding = self
                    .binding
                    .as_ref()
                    .is_some_and(|(s, p)| *s == session_id && *p == participant_id);
                if !matches_binding {
                    // Already left, or never joined: a no-op, not an error.
                    return Ok(ServerMessage::Ack { success: false });
                }

                let left = self.leave_bound().await;
                Ok(ServerMessage::Ack { success: left })
            },
            ClientMessage::SignalOffer { to, payload } => {
                self.relay(SignalKind::Offer, to, payload).await
            },
            ClientMessage::SignalAnswer { to, payload } => {
                self.relay(SignalKind::Answer, to, payload).await
            },
            ClientMessage::SignalIceCandidate { to, payload } => {
                self.relay(SignalKind::IceCandidate, to, payload).await
            },
            ClientMessage::MediaStateChanged { patch } => {
                let (session_id, participant_id) = self.bound()?;
                if patch.is_empty() {
                    return Ok(ServerMessage::Ack { success: true });
                }
                let handle = self
                    .state
                    .registry
                    .get(&session_id)
                    .ok_or(AppError::SessionClosed)?;
                handle.update_media(participant_id, patch).await?;
                Ok(ServerMessage::Ack { success: true })
            },
            ClientMessage::ScreenShareStarted {} => self.screen_share(true).await,
            ClientMessage::ScreenShareStopped {} => self.screen_share(false).await,
            ClientMessage::ChatSend {
                content,
                message_type,
                reply_to_id,
                mentions,
            } => {
                let (session_id, participant_id) = self.bound()?;
                let handle = self
                    .state
                    .registry
                    .get(&session_id)
                    .ok_or(AppError::SessionClosed)?;
                let message = handle
                    .chat(participant_id, content, message_type, reply_to_id, mentions)
                    .await?;
                Ok(ServerMessage::ChatAck { message })
            },
            ClientMessage::SessionStart { session_id } => {
                self.transition(session_id, LifecycleAction::Start).await
            },
            ClientMessage::SessionEnd { session_id } => {
                self.transition(session_id, LifecycleAction::End).await
            },
            ClientMessage::SessionCancel { session_id } => {
                self.transition(session_id, LifecycleAction::Cancel).await
            },
            ClientMessage::RecordingStart { session_id } => {
                let handle = self
                    .state
                    .registry
                    .get_or_spawn(&session_id, &self.state.store)
                    .await?;
                handle
                    .recording(self.identity.user_id.clone(), true, None)
                    .await?;
                Ok(ServerMessage::Ack { success: true })
            },
            ClientMessage::RecordingStop {
                session_id,
                recording_id,
            } => {
                let handle = self
                    .state
                    .registry
                    .get_or_spawn(&session_id, &self.state.store)
                    .await?;
                handle
                    .recording(self.identity.user_id.clone(), false, Some(recording_id))
                    .await?;
                Ok(ServerMessage::Ack { success: true })
            },
        }
    }

    fn bound(&self) -> Result<(SessionId, ParticipantId), AppError> {
        self.binding
            .clone()
            .ok_or_else(|| AppError::NotAParticipant("no session joined".to_string()))
    }

    /// Relay an envelope to another participant in the bound session.
    /// The sender and session come from the binding, never from the
    /// wire, so cross-session relay is impossible by construction.
    async fn relay(
        &self,
        kind: SignalKind,
        to: ParticipantId,
        payload: serde_json::Value,
    ) -> Result<ServerMessage, AppError> {
        let (session_id, participant_id) = self.bound()?;
        let handle = self
            .state
            .registry
            .get(&session_id)
            .ok_or(AppError::SessionClosed)?;

        let envelope = SignalEnvelope {
            kind,
            session_id,
            from: participant_id,
            to,
            payload,
        };
        handle.relay(envelope).await?;
        Ok(ServerMessage::Ack { success: true })
    }

    async fn screen_share(&self, active: bool) -> Result<ServerMessage, AppError> {
        let (session_id, participant_id) = self.bound()?;
        let handle = self
            .state
            .registry
            .get(&session_id)
            .ok_or(AppError::SessionClosed)?;
        handle.screen_share(participant_id, active).await?;
        Ok(ServerMessage::Ack { success: true })
    }

    async fn transition(
        &mut self,
        session_id: SessionId,
        action: LifecycleAction,
    ) -> Result<ServerMessage, AppError> {
        let handle = self
            .state
            .registry
            .get_or_spawn(&session_id, &self.state.store)
            .await?;
        let status = handle
            .transition(self.identity.user_id.clone(), action)
            .await?;

        if status.is_terminal() {
            self.state.registry.remove(&session_id);
            // An ended session disconnects everyone, including this
            // connection's own membership.
            if self
                .binding
                .as_ref()
                .is_some_and(|(bound, _)| *bound == session_id)
            {
                self.binding = None;
            }
        }
        Ok(ServerMessage::Ack { success: true })
    }

    /// Take the binding (at most once) and run the leave effect.
    async fn leave_bound(&mut self) -> bool {
        let Some((session_id, participant_id)) = self.binding.take() else {
            return false;
        };
        let Some(handle) = self.state.registry.get(&session_id) else {
            // Session already ended; its actor marked us disconnected.
            return false;
        };
        handle
            .leave(participant_id, self.outbound.clone())
            .await
            .unwrap_or(false)
    }

    /// Idempotent cleanup on transport loss. Failures are logged, not
    /// raised: there is no caller to raise to.
    pub async fn reconcile_disconnect(&mut self) {
        if self.binding.is_none() {
            return;
        }
        let bound = self.binding.clone();
        if !self.leave_bound().await {
            if let Some((session_id, participant_id)) = bound {
                tracing::debug!(
                    session_id = %session_id,
                    participant_id = %participant_id,
                    "disconnect reconciliation found membership already removed"
                );
            }
        }
    }
}
