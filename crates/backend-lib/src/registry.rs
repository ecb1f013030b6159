// ============================
// crates/backend-lib/src/registry.rs
// ============================
//! Session registry: the server-wide index of live session actors.
//!
//! A sharded concurrent map keyed by session id, so lookups from many
//! connection workers never contend across sessions. Actors are
//! spawned lazily on first join by loading the session record from the
//! durable store, and removed once the session reaches a terminal
//! state.
use dashmap::DashMap;
use meetrelay_common::SessionId;
use metrics::{counter, gauge};

use crate::error::AppError;
use crate::metrics as keys;
use crate::session_actor::{spawn_session_actor, SessionHandle};
use crate::store::Store;

/// Registry of all sessions with at least one live connection.
pub struct SessionRegistry {
    sessions: DashMap<SessionId, SessionHandle>,
    max_chat_len: usize,
    default_max_participants: usize,
}

impl SessionRegistry {
    pub fn new(max_chat_len: usize, default_max_participants: usize) -> Self {
        SessionRegistry {
            sessions: DashMap::new(),
            max_chat_len,
            default_max_participants,
        }
    }

    /// Get the handle for a session, spawning its actor on first use.
    ///
    /// Loading the record and spawning race benignly: if two first
    /// joins arrive together, the loser of the entry race uses the
    /// winner's handle and its freshly spawned actor is dropped with
    /// its channel, stopping immediately.
    pub async fn get_or_spawn<S>(
        &self,
        session_id: &str,
        store: &S,
    ) -> Result<SessionHandle, AppError>
    where
        S: Store + Clone + 'static,
    {
        if let Some(handle) = self.sessions.get(session_id) {
            return Ok(handle.value().clone());
        }

        let mut record = store.get_session(session_id).await?;
        if record.status.is_terminal() {
            return Err(AppError::SessionClosed);
        }
        // Records without an explicit limit get the configured default.
        if record.max_participants == 0 {
            record.max_participants = self.default_max_participants;
        }

        let handle = match self.sessions.entry(session_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(entry) => entry.get().clone(),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let handle = spawn_session_actor(record, store.clone(), self.max_chat_len);
                entry.insert(handle.clone());
                gauge!(keys::SESSION_ACTIVE).set(self.sessions.len() as f64);
                handle
            },
        };

        Ok(handle)
    }

    /// Get a session handle by ID without spawning.
    pub fn get(&self, session_id: &str) -> Option<SessionHandle> {
        self.sessions.get(session_id).map(|entry| entry.value().clone())
    }

    /// Drop a session's handle once it is ended or cancelled. The
    /// actor drains its remaining commands and stops when the last
    /// sender goes away.
    pub fn remove(&self, session_id: &str) {
        if self.sessions.remove(session_id).is_some() {
            counter!(keys::SESSION_RELEASED).increment(1);
            gauge!(keys::SESSION_ACTIVE).set(self.sessions.len() as f64);
        }
    }

    /// Number of sessions currently backed by an actor.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
