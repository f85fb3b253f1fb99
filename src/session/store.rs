//! In-memory session store.
//!
//! Sessions are isolated: history, entity state, and expiry are all scoped
//! to one session id. Records are kept behind `Arc` and replaced wholesale
//! on mutation, so concurrent readers always see a consistent snapshot and
//! never a half-applied turn.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::SessionSettings;
use crate::entity::{EntityTracker, EntityUpdate};
use crate::error::SessionError;
use crate::messages::SessionId;
use crate::metrics::get_metrics;
use crate::session::mirror::SessionMirror;

// ============================================================================
// Messages
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    User,
    Assistant,
    System,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
            ChatRole::System => "system",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    pub at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            at: Utc::now(),
        }
    }
}

/// Reject user text the pipeline will not accept: empty input and input
/// beyond the configured length cap.
pub fn validate_user_text(text: &str, max_len: usize) -> Result<(), SessionError> {
    if text.trim().is_empty() {
        return Err(SessionError::EmptyMessage);
    }
    if text.chars().count() > max_len {
        return Err(SessionError::MessageTooLong {
            got: text.chars().count(),
            max: max_len,
        });
    }
    Ok(())
}

// ============================================================================
// Records
// ============================================================================

/// One session's state. Immutable once published; the store swaps in a new
/// record on every mutation.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub session_id: SessionId,
    pub messages: VecDeque<ChatMessage>,
    pub entities: EntityTracker,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub turns: u64,
}

impl SessionRecord {
    fn new(session_id: SessionId) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            messages: VecDeque::new(),
            entities: EntityTracker::new(),
            created_at: now,
            last_active: now,
            turns: 0,
        }
    }

    /// The last `n` messages in conversation order.
    pub fn context(&self, n: usize) -> Vec<&ChatMessage> {
        let skip = self.messages.len().saturating_sub(n);
        self.messages.iter().skip(skip).collect()
    }

    fn expired(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        self.last_active + ttl < now
    }
}

/// Summary returned by the session inspection endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub message_count: usize,
    pub turns: u64,
    pub entities: EntityTracker,
}

// ============================================================================
// Store
// ============================================================================

pub struct SessionStore {
    sessions: RwLock<HashMap<SessionId, Arc<SessionRecord>>>,
    settings: SessionSettings,
    mirror: Option<SessionMirror>,
}

impl SessionStore {
    pub fn new(settings: SessionSettings, mirror: Option<SessionMirror>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            settings,
            mirror,
        }
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Resolve the session for a turn, creating it when absent. `None`
    /// always starts a fresh session.
    pub fn ensure_session(&self, session_id: Option<SessionId>) -> SessionId {
        let id = session_id.unwrap_or_default();
        let mut sessions = self.sessions.write();
        if !sessions.contains_key(&id) {
            sessions.insert(id, Arc::new(SessionRecord::new(id)));
            debug!(session_id = %id, "session created");
            get_metrics().active_sessions.set(sessions.len() as i64);
        }
        id
    }

    /// Append a message, trimming history to the configured window. User
    /// messages advance the turn counter.
    pub fn append(
        &self,
        session_id: SessionId,
        role: ChatRole,
        content: impl Into<String>,
    ) -> Result<(), SessionError> {
        let message = ChatMessage::new(role, content);
        {
            let mut sessions = self.sessions.write();
            let record = sessions
                .get(&session_id)
                .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;

            let mut next = SessionRecord::clone(record);
            next.messages.push_back(message.clone());
            while next.messages.len() > self.settings.window {
                next.messages.pop_front();
            }
            next.last_active = message.at;
            if role == ChatRole::User {
                next.turns += 1;
            }
            sessions.insert(session_id, Arc::new(next));
        }
        if let Some(mirror) = &self.mirror {
            mirror.record(session_id, &message);
        }
        Ok(())
    }

    /// Apply one turn's entity updates as a single batch.
    pub fn apply_entities(
        &self,
        session_id: SessionId,
        updates: &[EntityUpdate],
    ) -> Result<(), SessionError> {
        if updates.is_empty() {
            return Ok(());
        }
        let mut sessions = self.sessions.write();
        let record = sessions
            .get(&session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        let mut next = SessionRecord::clone(record);
        next.entities.apply(updates);
        sessions.insert(session_id, Arc::new(next));
        Ok(())
    }

    /// Consistent point-in-time view of a session.
    pub fn snapshot(&self, session_id: SessionId) -> Option<Arc<SessionRecord>> {
        self.sessions.read().get(&session_id).cloned()
    }

    pub fn info(&self, session_id: SessionId) -> Option<SessionInfo> {
        let record = self.snapshot(session_id)?;
        Some(SessionInfo {
            session_id: record.session_id,
            created_at: record.created_at,
            last_active: record.last_active,
            message_count: record.messages.len(),
            turns: record.turns,
            entities: record.entities.clone(),
        })
    }

    pub fn remove(&self, session_id: SessionId) -> bool {
        let mut sessions = self.sessions.write();
        let removed = sessions.remove(&session_id).is_some();
        if removed {
            get_metrics().active_sessions.set(sessions.len() as i64);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Drop every session idle past the TTL. Returns how many were removed.
    pub fn sweep_now(&self) -> usize {
        let ttl = Duration::minutes(self.settings.ttl_minutes as i64);
        let now = Utc::now();
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|_, record| !record.expired(ttl, now));
        let removed = before - sessions.len();
        if removed > 0 {
            info!(removed, remaining = sessions.len(), "swept expired sessions");
            get_metrics().active_sessions.set(sessions.len() as i64);
        }
        removed
    }

    /// Background expiry loop at the configured sweep interval.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        let period = std::time::Duration::from_secs(self.settings.sweep_interval_secs.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                store.sweep_now();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityCategory;

    fn test_settings(window: usize, ttl_minutes: u64) -> SessionSettings {
        SessionSettings {
            window,
            ttl_minutes,
            sweep_interval_secs: 60,
            max_message_len: 500,
        }
    }

    #[test]
    fn history_is_bounded_by_window() {
        let store = SessionStore::new(test_settings(3, 30), None);
        let id = store.ensure_session(None);
        for i in 0..5 {
            store
                .append(id, ChatRole::User, format!("message {i}"))
                .unwrap();
        }
        let record = store.snapshot(id).unwrap();
        assert_eq!(record.messages.len(), 3);
        assert_eq!(record.messages.front().unwrap().content, "message 2");
        assert_eq!(record.turns, 5);
    }

    #[test]
    fn context_returns_last_n_in_order() {
        let store = SessionStore::new(test_settings(30, 30), None);
        let id = store.ensure_session(None);
        for i in 0..5 {
            store
                .append(id, ChatRole::User, format!("message {i}"))
                .unwrap();
        }
        let record = store.snapshot(id).unwrap();
        let tail: Vec<&str> = record.context(2).iter().map(|m| m.content.as_str()).collect();
        assert_eq!(tail, ["message 3", "message 4"]);
        assert_eq!(record.context(10).len(), 5);
    }

    #[test]
    fn ensure_session_is_idempotent() {
        let store = SessionStore::new(test_settings(30, 30), None);
        let id = store.ensure_session(None);
        store.append(id, ChatRole::User, "hello").unwrap();
        let same = store.ensure_session(Some(id));
        assert_eq!(same, id);
        assert_eq!(store.snapshot(id).unwrap().messages.len(), 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn append_to_unknown_session_fails() {
        let store = SessionStore::new(test_settings(30, 30), None);
        let err = store
            .append(SessionId::new(), ChatRole::User, "hello")
            .unwrap_err();
        assert!(matches!(err, SessionError::NotFound(_)));
    }

    #[test]
    fn entity_state_is_per_session() {
        let store = SessionStore::new(test_settings(30, 30), None);
        let a = store.ensure_session(None);
        let b = store.ensure_session(None);
        store
            .apply_entities(a, &[EntityUpdate::single(EntityCategory::Metric, "oee")])
            .unwrap();
        assert_eq!(
            store.snapshot(a).unwrap().entities.get(EntityCategory::Metric),
            ["oee"]
        );
        assert!(store.snapshot(b).unwrap().entities.is_empty());
    }

    #[test]
    fn sweep_removes_only_expired_sessions() {
        let store = SessionStore::new(test_settings(30, 0), None);
        let id = store.ensure_session(None);
        store.append(id, ChatRole::User, "hello").unwrap();
        // ttl of zero minutes expires immediately.
        assert_eq!(store.sweep_now(), 1);
        assert!(store.snapshot(id).is_none());
    }

    #[test]
    fn snapshot_is_stable_across_later_writes() {
        let store = SessionStore::new(test_settings(30, 30), None);
        let id = store.ensure_session(None);
        store.append(id, ChatRole::User, "first").unwrap();
        let before = store.snapshot(id).unwrap();
        store.append(id, ChatRole::Assistant, "second").unwrap();
        assert_eq!(before.messages.len(), 1);
        assert_eq!(store.snapshot(id).unwrap().messages.len(), 2);
    }

    #[test]
    fn validates_user_text() {
        assert!(matches!(
            validate_user_text("   ", 500),
            Err(SessionError::EmptyMessage)
        ));
        let long = "x".repeat(501);
        assert!(matches!(
            validate_user_text(&long, 500),
            Err(SessionError::MessageTooLong { got: 501, max: 500 })
        ));
        assert!(validate_user_text("scrap rate by line", 500).is_ok());
    }
}
