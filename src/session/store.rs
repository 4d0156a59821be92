//! Destination for sessions the phone receives
//!
//! [`SessionStore`] is the collaborator the link server hands every complete
//! message to. [`JsonFileSessionStore`] keeps one `{session_id}.json` file
//! per session under a directory per receive date.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{HeartRateSample, MovementSample, SessionSummary};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Session already stored: {0}")]
    Duplicate(Uuid),
}

/// A received session as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceivedSession {
    pub session_id: Uuid,
    pub device_address: String,
    pub received_at: DateTime<Utc>,
    /// Absent when the message carried no well-formed summary.
    pub summary: Option<SessionSummary>,
    pub heart_rate_data: Vec<HeartRateSample>,
    pub movement_data: Vec<MovementSample>,
    /// The message exactly as reassembled.
    pub message: Value,
}

impl ReceivedSession {
    /// Pick the well-known parts out of a reassembled message. Unknown or
    /// malformed parts are kept only in `message`.
    pub fn from_message(
        session_id: Uuid,
        device_address: String,
        received_at: DateTime<Utc>,
        body: Map<String, Value>,
    ) -> Self {
        let summary = body
            .get("summary")
            .and_then(|v| serde_json::from_value(v.clone()).ok());
        let full_data = body.get("fullData");
        let heart_rate_data = full_data
            .and_then(|f| f.get("heartRateData"))
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();
        let movement_data = full_data
            .and_then(|f| f.get("movementData"))
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();

        Self {
            session_id,
            device_address,
            received_at,
            summary,
            heart_rate_data,
            movement_data,
            message: Value::Object(body),
        }
    }
}

#[async_trait]
pub trait SessionStore: Send + Sync + 'static {
    async fn save(&self, session_id: Uuid, session: ReceivedSession) -> Result<(), StoreError>;
}

/// Keeps sessions in memory. Used by tests and the demo.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<Uuid, ReceivedSession>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, session_id: &Uuid) -> Option<ReceivedSession> {
        self.sessions.read().await.get(session_id).cloned()
    }

    pub async fn list(&self) -> Vec<ReceivedSession> {
        let mut sessions: Vec<_> = self.sessions.read().await.values().cloned().collect();
        sessions.sort_by_key(|s| s.received_at);
        sessions
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn save(&self, session_id: Uuid, session: ReceivedSession) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&session_id) {
            return Err(StoreError::Duplicate(session_id));
        }
        sessions.insert(session_id, session);
        Ok(())
    }
}

/// Writes `{root}/{yyyy-mm-dd}/{session_id}.json`.
pub struct JsonFileSessionStore {
    root: PathBuf,
}

impl JsonFileSessionStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, session: &ReceivedSession) -> PathBuf {
        self.root
            .join(session.received_at.format("%Y-%m-%d").to_string())
            .join(format!("{}.json", session.session_id))
    }

    /// Load every stored session, oldest first.
    pub fn load_all(&self) -> Result<Vec<ReceivedSession>, StoreError> {
        let mut sessions = Vec::new();
        if !self.root.exists() {
            return Ok(sessions);
        }
        for day in std::fs::read_dir(&self.root)? {
            let day = day?.path();
            if !day.is_dir() {
                continue;
            }
            for entry in std::fs::read_dir(&day)? {
                let path = entry?.path();
                if path.extension().and_then(|ext| ext.to_str()) == Some("json") {
                    let data = std::fs::read(&path)?;
                    sessions.push(serde_json::from_slice::<ReceivedSession>(&data)?);
                }
            }
        }
        sessions.sort_by_key(|s| s.received_at);
        Ok(sessions)
    }
}

#[async_trait]
impl SessionStore for JsonFileSessionStore {
    async fn save(&self, session_id: Uuid, session: ReceivedSession) -> Result<(), StoreError> {
        let path = self.path_for(&session);
        if tokio::fs::try_exists(&path).await? {
            return Err(StoreError::Duplicate(session_id));
        }
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let json = serde_json::to_vec_pretty(&session)?;
        tokio::fs::write(&path, json).await?;
        log::info!("Stored session {} at {}", session_id, path.display());
        Ok(())
    }
}
