// ============================
// crates/backend-lib/src/store.rs
// ============================
//! Durable-store abstraction with flat-file implementation.
//!
//! The core treats persistence as an external, fallible collaborator:
//! every call can return `StoreUnavailable` and callers are expected to
//! roll back in-memory effects before broadcasting.
use std::{
    fs,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use meetrelay_common::{ChatMessage, Membership, SessionId, SessionRecord, SessionStatus};
use tokio::{fs as tokio_fs, io::AsyncWriteExt};

use crate::error::AppError;

/// Trait for durable-store backends
#[async_trait]
pub trait Store: Send + Sync {
    /// Fetch a session record by id
    async fn get_session(&self, session_id: &str) -> Result<SessionRecord, AppError>;

    /// Create a session record (used by tests and tooling; the CRUD
    /// front end owns creation in production)
    async fn put_session(&self, record: &SessionRecord) -> Result<(), AppError>;

    /// Insert or update a membership row keyed by (session, participant)
    async fn upsert_membership(&self, membership: &Membership) -> Result<(), AppError>;

    /// Append a chat message to the session's message log
    async fn insert_message(&self, message: &ChatMessage) -> Result<(), AppError>;

    /// Update the lifecycle status of a session
    async fn update_session_status(
        &self,
        session_id: &str,
        status: SessionStatus,
    ) -> Result<(), AppError>;

    /// Flip the recording flag on a session
    async fn set_recording(&self, session_id: &str, recording: bool) -> Result<(), AppError>;
}

/// Flat-file implementation of the Store trait
///
/// Layout: `<root>/sessions/<id>/session.json`, `memberships.json`,
/// `messages.log` (one JSON line per message).
#[derive(Clone)]
pub struct FlatFileStore {
    root: PathBuf,
}

impl FlatFileStore {
    pub fn new<P: AsRef<Path>>(root: P) -> anyhow::Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join("sessions"))?;
        Ok(Self { root })
    }

    fn session_dir(&self, session_id: &str) -> PathBuf {
        self.root.join("sessions").join(session_id)
    }

    async fn read_session(&self, session_id: &str) -> Result<SessionRecord, AppError> {
        let path = self.session_dir(session_id).join("session.json");
        if !path.exists() {
            return Err(AppError::SessionNotFound(session_id.to_string()));
        }
        let content = tokio_fs::read_to_string(&path)
            .await
            .map_err(|e| AppError::StoreUnavailable(e.to_string()))?;
        serde_json::from_str(&content).map_err(|e| AppError::StoreUnavailable(e.to_string()))
    }

    async fn write_session(&self, record: &SessionRecord) -> Result<(), AppError> {
        let dir = self.session_dir(&record.id);
        tokio_fs::create_dir_all(&dir)
            .await
            .map_err(|e| AppError::StoreUnavailable(e.to_string()))?;
        let json = serde_json::to_string_pretty(record)?;
        tokio_fs::write(dir.join("session.json"), json)
            .await
            .map_err(|e| AppError::StoreUnavailable(e.to_string()))
    }

    async fn read_memberships(&self, session_id: &str) -> Result<Vec<Membership>, AppError> {
        let path = self.session_dir(session_id).join("memberships.json");
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = tokio_fs::read_to_string(&path)
            .await
            .map_err(|e| AppError::StoreUnavailable(e.to_string()))?;
        serde_json::from_str(&content).map_err(|e| AppError::StoreUnavailable(e.to_string()))
    }
}

#[async_trait]
impl Store for FlatFileStore {
    async fn get_session(&self, session_id: &str) -> Result<SessionRecord, AppError> {
        self.read_session(session_id).await
    }

    async fn put_session(&self, record: &SessionRecord) -> Result<(), AppError> {
        self.write_session(record).await
    }

    /// Upsert keyed by participant id: a re-join updates the existing
    /// row instead of creating a duplicate.
    async fn upsert_membership(&self, membership: &Membership) -> Result<(), AppError> {
        let mut rows = self.read_memberships(&membership.session_id).await?;
        match rows
            .iter_mut()
            .find(|r| r.participant_id == membership.participant_id)
        {
            Some(row) => *row = membership.clone(),
            None => rows.push(membership.clone()),
        }

        let dir = self.session_dir(&membership.session_id);
        tokio_fs::create_dir_all(&dir)
            .await
            .map_err(|e| AppError::StoreUnavailable(e.to_string()))?;
        let json = serde_json::to_string_pretty(&rows)?;
        tokio_fs::write(dir.join("memberships.json"), json)
            .await
            .map_err(|e| AppError::StoreUnavailable(e.to_string()))
    }

    /// Append a JSON line to `messages.log`.
    async fn insert_message(&self, message: &ChatMessage) -> Result<(), AppError> {
        let dir = self.session_dir(&message.session_id);
        tokio_fs::create_dir_all(&dir)
            .await
            .map_err(|e| AppError::StoreUnavailable(e.to_string()))?;

        let json = serde_json::to_string(message)?;
        let mut file = tokio_fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("messages.log"))
            .await
            .map_err(|e| AppError::StoreUnavailable(e.to_string()))?;

        file.write_all(json.as_bytes())
            .await
            .map_err(|e| AppError::StoreUnavailable(e.to_string()))?;
        file.write_all(b"\n")
            .await
            .map_err(|e| AppError::StoreUnavailable(e.to_string()))?;
        Ok(())
    }

    async fn update_session_status(
        &self,
        session_id: &str,
        status: SessionStatus,
    ) -> Result<(), AppError> {
        let mut record = self.read_session(session_id).await?;
        record.status = status;
        self.write_session(&record).await
    }

    async fn set_recording(&self, session_id: &str, recording: bool) -> Result<(), AppError> {
        let mut record = self.read_session(session_id).await?;
        record.is_recording = recording;
        self.write_session(&record).await
    }
}

/// Store handle used by tests to observe persisted rows.
impl FlatFileStore {
    pub async fn memberships(&self, session_id: &SessionId) -> Result<Vec<Membership>, AppError> {
        self.read_memberships(session_id).await
    }

    pub async fn messages(&self, session_id: &SessionId) -> Result<Vec<ChatMessage>, AppError> {
        let path = self.session_dir(session_id).join("messages.log");
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = tokio_fs::read_to_string(&path)
            .await
            .map_err(|e| AppError::StoreUnavailable(e.to_string()))?;
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(AppError::from))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use meetrelay_common::{ConnectionStatus, MessageType, Role};
    use tempfile::TempDir;

    fn membership(session_id: &str, participant_id: &str) -> Membership {
        Membership {
            session_id: session_id.to_string(),
            participant_id: participant_id.to_string(),
            user_id: "u1".to_string(),
            display_name: "Alice".to_string(),
            role: Role::Participant,
            joined_at: Utc::now(),
            left_at: None,
            is_muted: false,
            is_video_enabled: true,
            is_screen_sharing: false,
            connection_status: ConnectionStatus::Connected,
        }
    }

    #[tokio::test]
    async fn test_session_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let store = FlatFileStore::new(temp_dir.path()).unwrap();

        let record = SessionRecord::new("host-1".to_string(), 4);
        store.put_session(&record).await.unwrap();

        let loaded = store.get_session(&record.id).await.unwrap();
        assert_eq!(loaded.id, record.id);
        assert_eq!(loaded.host_id, "host-1");
        assert_eq!(loaded.max_participants, 4);
    }

    #[tokio::test]
    async fn test_missing_session_is_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let store = FlatFileStore::new(temp_dir.path()).unwrap();

        let err = store.get_session("nope").await.unwrap_err();
        assert!(matches!(err, AppError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn test_upsert_membership_updates_in_place() {
        let temp_dir = TempDir::new().unwrap();
        let store = FlatFileStore::new(temp_dir.path()).unwrap();

        let mut row = membership("s1", "p1");
        store.upsert_membership(&row).await.unwrap();

        row.is_muted = true;
        store.upsert_membership(&row).await.unwrap();

        let rows = store.memberships(&"s1".to_string()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].is_muted);
    }

    #[tokio::test]
    async fn test_status_update_persists() {
        let temp_dir = TempDir::new().unwrap();
        let store = FlatFileStore::new(temp_dir.path()).unwrap();

        let record = SessionRecord::new("host-1".to_string(), 4);
        store.put_session(&record).await.unwrap();
        store
            .update_session_status(&record.id, SessionStatus::Live)
            .await
            .unwrap();

        let loaded = store.get_session(&record.id).await.unwrap();
        assert_eq!(loaded.status, SessionStatus::Live);
    }

    #[tokio::test]
    async fn test_message_log_appends() {
        let temp_dir = TempDir::new().unwrap();
        let store = FlatFileStore::new(temp_dir.path()).unwrap();

        for i in 0..3 {
            let message = ChatMessage {
                id: format!("m{i}"),
                session_id: "s1".to_string(),
                sender_id: "p1".to_string(),
                sender_name: "Alice".to_string(),
                content: format!("hello {i}"),
                message_type: MessageType::Text,
                timestamp: Utc::now(),
                reply_to_id: None,
                mentions: None,
            };
            store.insert_message(&message).await.unwrap();
        }

        let messages = store.messages(&"s1".to_string()).await.unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[2].content, "hello 2");
    }
}
