//! End-to-end coordination flow exercised through the registry and
//! session actors, without real sockets: each simulated client is a
//! connection worker plus its outbound channel, exactly what the
//! WebSocket layer wires up per connection.
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use meetrelay_backend_lib::{
    auth::Identity,
    config::Settings,
    error::AppError,
    messages::{ClientMessage, ServerMessage},
    store::{FlatFileStore, Store},
    ws_router::ConnectionWorker,
    AppState,
};
use meetrelay_common::{
    ChatMessage, ConnectionStatus, Membership, MessageType, SessionRecord, SessionStatus,
};
use tempfile::TempDir;
use tokio::sync::mpsc::{self, UnboundedReceiver};

struct Client {
    worker: ConnectionWorker<FlatFileStore>,
    rx: UnboundedReceiver<ServerMessage>,
}

impl Client {
    fn new(state: &Arc<AppState<FlatFileStore>>, user_id: &str, name: &str) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let identity = Identity {
            user_id: user_id.to_string(),
            display_name: name.to_string(),
        };
        Client {
            worker: ConnectionWorker::new(state.clone(), identity, tx),
            rx,
        }
    }

    async fn join(&mut self, session_id: &str, participant_id: &str, name: &str) -> ServerMessage {
        self.worker
            .handle_message(ClientMessage::Join {
                session_id: session_id.to_string(),
                participant_id: participant_id.to_string(),
                display_name: name.to_string(),
            })
            .await
            .unwrap()
    }

    /// Pop the next broadcast this client received.
    fn next_event(&mut self) -> ServerMessage {
        self.rx.try_recv().expect("expected a pending event")
    }

    fn no_pending_events(&mut self) -> bool {
        self.rx.try_recv().is_err()
    }
}

async fn setup(capacity: usize) -> (Arc<AppState<FlatFileStore>>, SessionRecord, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let store = FlatFileStore::new(temp_dir.path()).unwrap();
    let record = SessionRecord::new("host-user".to_string(), capacity);
    store.put_session(&record).await.unwrap();
    let state = Arc::new(AppState::new(store, Settings::default()));
    (state, record, temp_dir)
}

#[tokio::test]
async fn full_session_scenario() {
    let (state, record, _tmp) = setup(2).await;
    let sid = record.id.clone();

    // A joins: succeeds with an empty snapshot.
    let mut a = Client::new(&state, "user-a", "Alice");
    match a.join(&sid, "pa", "Alice").await {
        ServerMessage::Joined {
            participant,
            existing_participants,
        } => {
            assert_eq!(participant.participant_id, "pa");
            assert_eq!(participant.connection_status, ConnectionStatus::Connected);
            assert!(existing_participants.is_empty());
        },
        other => panic!("Expected Joined, got {other:?}"),
    }

    // B joins: A is notified, B's snapshot contains A.
    let mut b = Client::new(&state, "user-b", "Bob");
    match b.join(&sid, "pb", "Bob").await {
        ServerMessage::Joined {
            existing_participants,
            ..
        } => {
            assert_eq!(existing_participants.len(), 1);
            assert_eq!(existing_participants[0].participant_id, "pa");
        },
        other => panic!("Expected Joined, got {other:?}"),
    }
    match a.next_event() {
        ServerMessage::ParticipantJoined { participant } => {
            assert_eq!(participant.participant_id, "pb");
        },
        other => panic!("Expected ParticipantJoined, got {other:?}"),
    }

    // C cannot join: session is at capacity.
    let mut c = Client::new(&state, "user-c", "Carol");
    let err = c
        .worker
        .handle_message(ClientMessage::Join {
            session_id: sid.clone(),
            participant_id: "pc".to_string(),
            display_name: "Carol".to_string(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::CapacityExceeded));

    // A sends an offer to B: B receives the payload verbatim.
    let payload = serde_json::json!({ "sdp": "v=0\r\no=- 46117 2 IN IP4 127.0.0.1" });
    let ack = a
        .worker
        .handle_message(ClientMessage::SignalOffer {
            to: "pb".to_string(),
            payload: payload.clone(),
        })
        .await
        .unwrap();
    assert!(matches!(ack, ServerMessage::Ack { success: true }));
    match b.next_event() {
        ServerMessage::SignalOffer { from, payload: received, .. } => {
            assert_eq!(from, "pa");
            assert_eq!(received, payload);
        },
        other => panic!("Expected SignalOffer, got {other:?}"),
    }

    // A's transport drops: B hears exactly one participant-left.
    a.worker.reconcile_disconnect().await;
    a.worker.reconcile_disconnect().await;
    match b.next_event() {
        ServerMessage::ParticipantLeft { participant_id, .. } => {
            assert_eq!(participant_id, "pa");
        },
        other => panic!("Expected ParticipantLeft, got {other:?}"),
    }
    assert!(b.no_pending_events());

    // Capacity was freed: C can now join.
    match c.join(&sid, "pc", "Carol").await {
        ServerMessage::Joined { .. } => {},
        other => panic!("Expected Joined, got {other:?}"),
    }
}

#[tokio::test]
async fn rejoin_does_not_consume_capacity() {
    let (state, record, _tmp) = setup(1).await;
    let sid = record.id.clone();

    let mut a = Client::new(&state, "user-a", "Alice");
    a.join(&sid, "pa", "Alice").await;

    // Same participant id re-joins; at capacity 1 this only works
    // because a re-join does not count as a second member.
    match a.join(&sid, "pa", "Alice").await {
        ServerMessage::Joined { participant, .. } => {
            assert_eq!(participant.participant_id, "pa");
        },
        other => panic!("Expected Joined, got {other:?}"),
    }

    let handle = state.registry.get(&sid).unwrap();
    assert_eq!(handle.snapshot().await.unwrap().len(), 1);
}

#[tokio::test]
async fn stale_disconnect_does_not_evict_rejoined_participant() {
    let (state, record, _tmp) = setup(4).await;
    let sid = record.id.clone();

    // First connection joins as pa, then the user reconnects and
    // re-joins as pa over a fresh connection.
    let mut old = Client::new(&state, "user-a", "Alice");
    old.join(&sid, "pa", "Alice").await;
    let mut fresh = Client::new(&state, "user-a", "Alice");
    fresh.join(&sid, "pa", "Alice").await;

    // The old transport's reconciliation arrives late; the membership
    // now belongs to the fresh connection and must survive.
    old.worker.reconcile_disconnect().await;

    let handle = state.registry.get(&sid).unwrap();
    let rows = handle.snapshot().await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].participant_id, "pa");
    assert_eq!(rows[0].connection_status, ConnectionStatus::Connected);
    assert!(fresh.no_pending_events());

    // The fresh connection's own disconnect still cleans up.
    fresh.worker.reconcile_disconnect().await;
    assert!(handle.snapshot().await.unwrap().is_empty());
}

#[tokio::test]
async fn media_patch_cannot_bypass_screen_share_gate() {
    let temp_dir = TempDir::new().unwrap();
    let store = FlatFileStore::new(temp_dir.path()).unwrap();
    let mut record = SessionRecord::new("host-user".to_string(), 4);
    record.settings.allow_screen_share = false;
    store.put_session(&record).await.unwrap();
    let state = Arc::new(AppState::new(store, Settings::default()));

    let mut a = Client::new(&state, "user-a", "Alice");
    a.join(&record.id, "pa", "Alice").await;

    let json = r#"{ "type": "media-state-changed", "is_screen_sharing": true }"#;
    let msg: ClientMessage = serde_json::from_str(json).unwrap();
    let err = a.worker.handle_message(msg).await.unwrap_err();
    assert!(matches!(err, AppError::Forbidden(_)));

    let handle = state.registry.get(&record.id).unwrap();
    let rows = handle.snapshot().await.unwrap();
    assert!(!rows[0].is_screen_sharing);
}

#[tokio::test]
async fn join_after_cancel_fails_with_session_closed() {
    let (state, record, _tmp) = setup(4).await;
    let sid = record.id.clone();

    let mut host = Client::new(&state, "host-user", "Host");
    let ack = host
        .worker
        .handle_message(ClientMessage::SessionCancel {
            session_id: sid.clone(),
        })
        .await
        .unwrap();
    assert!(matches!(ack, ServerMessage::Ack { success: true }));

    let mut late = Client::new(&state, "user-x", "Xavier");
    let err = late
        .worker
        .handle_message(ClientMessage::Join {
            session_id: sid,
            participant_id: "px".to_string(),
            display_name: "Xavier".to_string(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::SessionClosed));
}

#[tokio::test]
async fn non_host_lifecycle_actions_are_forbidden() {
    let (state, record, _tmp) = setup(4).await;
    let sid = record.id.clone();

    let mut guest = Client::new(&state, "not-the-host", "Guest");
    guest.join(&sid, "pg", "Guest").await;

    for msg in [
        ClientMessage::SessionStart {
            session_id: sid.clone(),
        },
        ClientMessage::SessionEnd {
            session_id: sid.clone(),
        },
        ClientMessage::SessionCancel {
            session_id: sid.clone(),
        },
    ] {
        let err = guest.worker.handle_message(msg).await.unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
    }

    // Status is unchanged in the durable record.
    let stored = state.store.get_session(&sid).await.unwrap();
    assert_eq!(stored.status, SessionStatus::Scheduled);
}

#[tokio::test]
async fn media_state_patch_round_trip() {
    let (state, record, _tmp) = setup(4).await;
    let sid = record.id.clone();

    let mut a = Client::new(&state, "user-a", "Alice");
    a.join(&sid, "pa", "Alice").await;
    let mut b = Client::new(&state, "user-b", "Bob");
    b.join(&sid, "pb", "Bob").await;
    let _ = a.next_event(); // B's join notification

    let json = r#"{ "type": "media-state-changed", "is_muted": true }"#;
    let msg: ClientMessage = serde_json::from_str(json).unwrap();
    a.worker.handle_message(msg).await.unwrap();

    // Fresh snapshot reflects the patched field, others untouched.
    let handle = state.registry.get(&sid).unwrap();
    let rows = handle.snapshot().await.unwrap();
    let row = rows.iter().find(|r| r.participant_id == "pa").unwrap();
    assert!(row.is_muted);
    assert!(row.is_video_enabled);
    assert!(!row.is_screen_sharing);

    // B saw the full resulting state; A got no echo.
    match b.next_event() {
        ServerMessage::MediaStateChanged {
            participant_id,
            is_muted,
            is_video_enabled,
            ..
        } => {
            assert_eq!(participant_id, "pa");
            assert!(is_muted);
            assert!(is_video_enabled);
        },
        other => panic!("Expected MediaStateChanged, got {other:?}"),
    }
    assert!(a.no_pending_events());
}

#[tokio::test]
async fn chat_echoes_to_sender_and_persists() {
    let (state, record, _tmp) = setup(4).await;
    let sid = record.id.clone();

    let mut a = Client::new(&state, "user-a", "Alice");
    a.join(&sid, "pa", "Alice").await;
    let mut b = Client::new(&state, "user-b", "Bob");
    b.join(&sid, "pb", "Bob").await;
    let _ = a.next_event();

    let ack = a
        .worker
        .handle_message(ClientMessage::ChatSend {
            content: "hello room".to_string(),
            message_type: MessageType::Text,
            reply_to_id: None,
            mentions: None,
        })
        .await
        .unwrap();
    let canonical = match ack {
        ServerMessage::ChatAck { message } => message,
        other => panic!("Expected ChatAck, got {other:?}"),
    };
    assert!(!canonical.id.is_empty());

    // Both A and B receive the broadcast, carrying the same id.
    match a.next_event() {
        ServerMessage::ChatMessage { message } => assert_eq!(message.id, canonical.id),
        other => panic!("Expected ChatMessage, got {other:?}"),
    }
    match b.next_event() {
        ServerMessage::ChatMessage { message } => assert_eq!(message.id, canonical.id),
        other => panic!("Expected ChatMessage, got {other:?}"),
    }

    let stored = state.store.messages(&sid).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].id, canonical.id);
}

#[tokio::test]
async fn chat_too_long_is_rejected_not_truncated() {
    let (state, record, _tmp) = setup(4).await;
    let sid = record.id.clone();

    let mut a = Client::new(&state, "user-a", "Alice");
    a.join(&sid, "pa", "Alice").await;

    let max = state.settings.max_chat_len;
    let err = a
        .worker
        .handle_message(ClientMessage::ChatSend {
            content: "x".repeat(max + 1),
            message_type: MessageType::Text,
            reply_to_id: None,
            mentions: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::ContentTooLong(_)));

    assert!(state.store.messages(&sid).await.unwrap().is_empty());
}

#[tokio::test]
async fn signal_to_departed_target_is_recoverable() {
    let (state, record, _tmp) = setup(4).await;
    let sid = record.id.clone();

    let mut a = Client::new(&state, "user-a", "Alice");
    a.join(&sid, "pa", "Alice").await;

    let err = a
        .worker
        .handle_message(ClientMessage::SignalIceCandidate {
            to: "gone".to_string(),
            payload: serde_json::json!({ "candidate": "..." }),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::TargetNotFound(_)));
}

#[tokio::test]
async fn session_end_disconnects_everyone() {
    let (state, record, _tmp) = setup(4).await;
    let sid = record.id.clone();

    let mut host = Client::new(&state, "host-user", "Host");
    host.join(&sid, "ph", "Host").await;
    let mut guest = Client::new(&state, "user-g", "Guest");
    guest.join(&sid, "pg", "Guest").await;
    let _ = host.next_event();

    host.worker
        .handle_message(ClientMessage::SessionStart {
            session_id: sid.clone(),
        })
        .await
        .unwrap();
    let _ = host.next_event(); // session-started
    let _ = guest.next_event();

    host.worker
        .handle_message(ClientMessage::SessionEnd {
            session_id: sid.clone(),
        })
        .await
        .unwrap();

    match guest.next_event() {
        ServerMessage::SessionEnded { session_id } => assert_eq!(session_id, sid),
        other => panic!("Expected SessionEnded, got {other:?}"),
    }

    // Registry released the session; memberships are disconnected.
    assert!(state.registry.get(&sid).is_none());
    let rows = state.store.memberships(&sid).await.unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows
        .iter()
        .all(|r| r.connection_status == ConnectionStatus::Disconnected && r.left_at.is_some()));

    let stored = state.store.get_session(&sid).await.unwrap();
    assert_eq!(stored.status, SessionStatus::Ended);
}

#[tokio::test]
async fn mute_on_entry_forces_muted_join() {
    let temp_dir = TempDir::new().unwrap();
    let store = FlatFileStore::new(temp_dir.path()).unwrap();
    let mut record = SessionRecord::new("host-user".to_string(), 4);
    record.settings.mute_on_entry = true;
    store.put_session(&record).await.unwrap();
    let state = Arc::new(AppState::new(store, Settings::default()));

    let mut a = Client::new(&state, "user-a", "Alice");
    match a.join(&record.id, "pa", "Alice").await {
        ServerMessage::Joined { participant, .. } => assert!(participant.is_muted),
        other => panic!("Expected Joined, got {other:?}"),
    }
}

#[tokio::test]
async fn chat_disabled_session_rejects_chat() {
    let temp_dir = TempDir::new().unwrap();
    let store = FlatFileStore::new(temp_dir.path()).unwrap();
    let mut record = SessionRecord::new("host-user".to_string(), 4);
    record.settings.allow_chat = false;
    store.put_session(&record).await.unwrap();
    let state = Arc::new(AppState::new(store, Settings::default()));

    let mut a = Client::new(&state, "user-a", "Alice");
    a.join(&record.id, "pa", "Alice").await;

    let err = a
        .worker
        .handle_message(ClientMessage::ChatSend {
            content: "hi".to_string(),
            message_type: MessageType::Text,
            reply_to_id: None,
            mentions: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Forbidden(_)));
}

#[tokio::test]
async fn recording_is_host_only() {
    let (state, record, _tmp) = setup(4).await;
    let sid = record.id.clone();

    let mut guest = Client::new(&state, "user-g", "Guest");
    guest.join(&sid, "pg", "Guest").await;

    let err = guest
        .worker
        .handle_message(ClientMessage::RecordingStart {
            session_id: sid.clone(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Forbidden(_)));

    let mut host = Client::new(&state, "host-user", "Host");
    host.join(&sid, "ph", "Host").await;
    let _ = guest.next_event(); // host's join notification

    let ack = host
        .worker
        .handle_message(ClientMessage::RecordingStart {
            session_id: sid.clone(),
        })
        .await
        .unwrap();
    assert!(matches!(ack, ServerMessage::Ack { success: true }));

    match guest.next_event() {
        ServerMessage::RecordingStarted { recording_id, .. } => {
            assert!(recording_id.starts_with("rec_"));
        },
        other => panic!("Expected RecordingStarted, got {other:?}"),
    }

    let stored = state.store.get_session(&sid).await.unwrap();
    assert!(stored.is_recording);
}

/// Store wrapper that injects membership-write outages on demand.
#[derive(Clone)]
struct OutageStore {
    inner: FlatFileStore,
    fail_membership_writes: Arc<AtomicBool>,
}

#[async_trait::async_trait]
impl Store for OutageStore {
    async fn get_session(&self, session_id: &str) -> Result<SessionRecord, AppError> {
        self.inner.get_session(session_id).await
    }

    async fn put_session(&self, record: &SessionRecord) -> Result<(), AppError> {
        self.inner.put_session(record).await
    }

    async fn upsert_membership(&self, membership: &Membership) -> Result<(), AppError> {
        if self.fail_membership_writes.load(Ordering::SeqCst) {
            return Err(AppError::StoreUnavailable("injected outage".to_string()));
        }
        self.inner.upsert_membership(membership).await
    }

    async fn insert_message(&self, message: &ChatMessage) -> Result<(), AppError> {
        self.inner.insert_message(message).await
    }

    async fn update_session_status(
        &self,
        session_id: &str,
        status: SessionStatus,
    ) -> Result<(), AppError> {
        self.inner.update_session_status(session_id, status).await
    }

    async fn set_recording(&self, session_id: &str, recording: bool) -> Result<(), AppError> {
        self.inner.set_recording(session_id, recording).await
    }
}

#[tokio::test]
async fn store_outage_during_join_leaves_no_trace() {
    let temp_dir = TempDir::new().unwrap();
    let fail = Arc::new(AtomicBool::new(false));
    let store = OutageStore {
        inner: FlatFileStore::new(temp_dir.path()).unwrap(),
        fail_membership_writes: fail.clone(),
    };
    let record = SessionRecord::new("host-user".to_string(), 4);
    store.put_session(&record).await.unwrap();
    let state = Arc::new(AppState::new(store, Settings::default()));
    let sid = record.id.clone();

    let (a_tx, mut a_rx) = mpsc::unbounded_channel();
    let identity = Identity {
        user_id: "user-a".to_string(),
        display_name: "Alice".to_string(),
    };
    let mut a = ConnectionWorker::new(state.clone(), identity, a_tx);
    a.handle_message(ClientMessage::Join {
        session_id: sid.clone(),
        participant_id: "pa".to_string(),
        display_name: "Alice".to_string(),
    })
    .await
    .unwrap();

    fail.store(true, Ordering::SeqCst);
    let (b_tx, _b_rx) = mpsc::unbounded_channel();
    let identity = Identity {
        user_id: "user-b".to_string(),
        display_name: "Bob".to_string(),
    };
    let mut b = ConnectionWorker::new(state.clone(), identity, b_tx);
    let err = b
        .handle_message(ClientMessage::Join {
            session_id: sid.clone(),
            participant_id: "pb".to_string(),
            display_name: "Bob".to_string(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::StoreUnavailable(_)));
    assert!(err.is_retryable());

    // The failed join left no member behind and A heard nothing.
    let handle = state.registry.get(&sid).unwrap();
    let rows = handle.snapshot().await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].participant_id, "pa");
    assert!(a_rx.try_recv().is_err());

    // Once the store recovers, the same join succeeds.
    fail.store(false, Ordering::SeqCst);
    let joined = b
        .handle_message(ClientMessage::Join {
            session_id: sid,
            participant_id: "pb".to_string(),
            display_name: "Bob".to_string(),
        })
        .await
        .unwrap();
    assert!(matches!(joined, ServerMessage::Joined { .. }));
    assert!(a_rx.try_recv().is_ok());
}

#[tokio::test]
async fn concurrent_joins_never_exceed_capacity() {
    let (state, record, _tmp) = setup(3).await;
    let sid = record.id.clone();

    let mut tasks = tokio::task::JoinSet::new();
    for i in 0..10 {
        let state = state.clone();
        let sid = sid.clone();
        tasks.spawn(async move {
            let (tx, _rx) = mpsc::unbounded_channel();
            let identity = Identity {
                user_id: format!("user-{i}"),
                display_name: format!("User {i}"),
            };
            let mut worker = ConnectionWorker::new(state, identity, tx);
            worker
                .handle_message(ClientMessage::Join {
                    session_id: sid,
                    participant_id: format!("p{i}"),
                    display_name: format!("User {i}"),
                })
                .await
        });
    }

    let mut admitted = 0;
    let mut rejected = 0;
    while let Some(result) = tasks.join_next().await {
        match result.unwrap() {
            Ok(ServerMessage::Joined { .. }) => admitted += 1,
            Err(AppError::CapacityExceeded) => rejected += 1,
            other => panic!("Unexpected outcome: {other:?}"),
        }
    }
    assert_eq!(admitted, 3);
    assert_eq!(rejected, 7);

    let handle = state.registry.get(&sid).unwrap();
    assert_eq!(handle.snapshot().await.unwrap().len(), 3);
}
