//! Session persistence seam.
//!
//! The core never relies on persistence for correctness; it only consumes
//! the [`SessionStore`] trait. [`InMemorySessionStore`] is the canonical
//! implementation — sessions, an append-only event log, and a per-session
//! KV state map behind a `tokio::sync::RwLock`. Data is lost when the
//! process exits; durable backends are adapters living outside the core.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::event::now_ms;

/// One persisted session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Unique session id.
    pub id: String,
    /// Application the session belongs to.
    pub app_name: String,
    /// Owning user.
    pub user_id: String,
    /// Agent bound to the session.
    pub agent_id: String,
    /// Free-form metadata.
    pub metadata: Value,
    /// Creation time, milliseconds since the epoch.
    pub created_at: i64,
    /// Last update time, milliseconds since the epoch.
    pub updated_at: i64,
}

/// Request to create a session.
#[derive(Debug, Clone, Default)]
pub struct CreateSession {
    /// Application name.
    pub app_name: String,
    /// Owning user.
    pub user_id: String,
    /// Agent bound to the session.
    pub agent_id: String,
    /// Free-form metadata.
    pub metadata: Value,
}

/// One entry of a session's append-only event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    /// Unique event id.
    pub event_id: String,
    /// Invocation (one `send`) the event belongs to.
    pub invocation_id: String,
    /// Agent that produced the event.
    pub agent_id: String,
    /// Logical author (user, assistant, tool name).
    pub author: String,
    /// Event content.
    pub content: Value,
    /// Free-form metadata.
    pub metadata: Value,
    /// Wall-clock milliseconds.
    pub timestamp: i64,
}

impl SessionEvent {
    /// Create an event with a fresh id and the current timestamp.
    #[must_use]
    pub fn new(
        invocation_id: impl Into<String>,
        agent_id: impl Into<String>,
        author: impl Into<String>,
        content: Value,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4().simple().to_string(),
            invocation_id: invocation_id.into(),
            agent_id: agent_id.into(),
            author: author.into(),
            content,
            metadata: Value::Null,
            timestamp: now_ms(),
        }
    }
}

/// Filter for reading a session's event log.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Only events from this agent.
    pub agent_id: Option<String>,
    /// Only events from this author.
    pub author: Option<String>,
    /// At most this many events, newest last.
    pub limit: Option<usize>,
}

/// Filter for listing sessions.
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    /// Only sessions of this application.
    pub app_name: Option<String>,
    /// Only sessions of this user.
    pub user_id: Option<String>,
}

/// Persistence seam for sessions, event logs, and per-session state.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Create a session.
    async fn create(&self, request: CreateSession) -> Result<SessionRecord>;

    /// Fetch a session by id.
    async fn get(&self, session_id: &str) -> Result<Option<SessionRecord>>;

    /// Replace a session's metadata and bump `updated_at`.
    async fn update(&self, session_id: &str, metadata: Value) -> Result<()>;

    /// Delete a session with its event log and state.
    async fn delete(&self, session_id: &str) -> Result<()>;

    /// List sessions matching a filter, oldest first.
    async fn list(&self, filter: &SessionFilter) -> Result<Vec<SessionRecord>>;

    /// Append one event to a session's log.
    async fn append_event(&self, session_id: &str, event: SessionEvent) -> Result<()>;

    /// Read a session's event log through a filter, in append order.
    async fn events(&self, session_id: &str, filter: &EventFilter) -> Result<Vec<SessionEvent>>;

    /// Merge a key into the session's state map.
    async fn put_state(&self, session_id: &str, key: &str, value: Value) -> Result<()>;

    /// Snapshot of the session's state map.
    async fn state(&self, session_id: &str) -> Result<HashMap<String, Value>>;
}

struct StoredSession {
    record: SessionRecord,
    events: Vec<SessionEvent>,
    state: HashMap<String, Value>,
}

/// In-memory [`SessionStore`] backed by `tokio::sync::RwLock`.
///
/// Concurrent readers proceed simultaneously; writes take exclusive access.
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<String, StoredSession>>,
}

impl std::fmt::Debug for InMemorySessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemorySessionStore").finish_non_exhaustive()
    }
}

impl InMemorySessionStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create(&self, request: CreateSession) -> Result<SessionRecord> {
        let now = now_ms();
        let record = SessionRecord {
            id: Uuid::new_v4().simple().to_string(),
            app_name: request.app_name,
            user_id: request.user_id,
            agent_id: request.agent_id,
            metadata: request.metadata,
            created_at: now,
            updated_at: now,
        };
        self.sessions.write().await.insert(
            record.id.clone(),
            StoredSession {
                record: record.clone(),
                events: Vec::new(),
                state: HashMap::new(),
            },
        );
        Ok(record)
    }

    async fn get(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        Ok(self
            .sessions
            .read()
            .await
            .get(session_id)
            .map(|s| s.record.clone()))
    }

    async fn update(&self, session_id: &str, metadata: Value) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| Error::Validation(format!("unknown session '{session_id}'")))?;
        session.record.metadata = metadata;
        session.record.updated_at = now_ms();
        Ok(())
    }

    async fn delete(&self, session_id: &str) -> Result<()> {
        self.sessions
            .write()
            .await
            .remove(session_id)
            .map(|_| ())
            .ok_or_else(|| Error::Validation(format!("unknown session '{session_id}'")))
    }

    async fn list(&self, filter: &SessionFilter) -> Result<Vec<SessionRecord>> {
        let sessions = self.sessions.read().await;
        let mut records: Vec<SessionRecord> = sessions
            .values()
            .filter(|s| {
                filter
                    .app_name
                    .as_deref()
                    .is_none_or(|a| s.record.app_name == a)
                    && filter
                        .user_id
                        .as_deref()
                        .is_none_or(|u| s.record.user_id == u)
            })
            .map(|s| s.record.clone())
            .collect();
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }

    async fn append_event(&self, session_id: &str, event: SessionEvent) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| Error::Validation(format!("unknown session '{session_id}'")))?;
        session.events.push(event);
        session.record.updated_at = now_ms();
        Ok(())
    }

    async fn events(&self, session_id: &str, filter: &EventFilter) -> Result<Vec<SessionEvent>> {
        let sessions = self.sessions.read().await;
        let session = sessions
            .get(session_id)
            .ok_or_else(|| Error::Validation(format!("unknown session '{session_id}'")))?;
        let matched: Vec<SessionEvent> = session
            .events
            .iter()
            .filter(|e| {
                filter.agent_id.as_deref().is_none_or(|a| e.agent_id == a)
                    && filter.author.as_deref().is_none_or(|a| e.author == a)
            })
            .cloned()
            .collect();
        Ok(match filter.limit {
            Some(n) if n < matched.len() => matched[matched.len() - n..].to_vec(),
            _ => matched,
        })
    }

    async fn put_state(&self, session_id: &str, key: &str, value: Value) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| Error::Validation(format!("unknown session '{session_id}'")))?;
        session.state.insert(key.to_string(), value);
        Ok(())
    }

    async fn state(&self, session_id: &str) -> Result<HashMap<String, Value>> {
        let sessions = self.sessions.read().await;
        let session = sessions
            .get(session_id)
            .ok_or_else(|| Error::Validation(format!("unknown session '{session_id}'")))?;
        Ok(session.state.clone())
    }
}
