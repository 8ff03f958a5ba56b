//! Conversation session manager.
//!
//! Conversations live in a `DashMap` keyed by id. Each entry carries its own
//! `tokio::sync::Mutex`, so appends to one conversation are serialized while
//! different conversations never contend. The number of stored messages is
//! capped; the oldest are dropped first and the loss is reported through
//! `HistorySnapshot::truncated` / `dropped`.
//!
//! The map itself is bounded too. Before a new conversation is created,
//! entries idle for longer than the TTL are removed, then the least recently
//! used ones until there is room under `max_conversations`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use modelsmith_common::Message;
use serde::Serialize;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::SessionSection;
use crate::errors::SessionError;

struct ConversationState {
    messages: VecDeque<Message>,
    dropped: usize,
    context: Option<serde_json::Value>,
}

struct Conversation {
    owner: String,
    created_at: DateTime<Utc>,
    /// Milliseconds since the manager's epoch at the last access.
    last_active: AtomicU64,
    state: Mutex<ConversationState>,
}

/// Point-in-time copy of a conversation.
#[derive(Debug, Clone, Serialize)]
pub struct HistorySnapshot {
    pub conversation_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub messages: Vec<Message>,
    /// True once any message has been dropped to honor the cap.
    pub truncated: bool,
    pub dropped: usize,
    pub context: Option<serde_json::Value>,
}

pub struct SessionManager {
    conversations: DashMap<Uuid, Arc<Conversation>>,
    max_messages: usize,
    max_conversations: usize,
    idle_ttl: Option<Duration>,
    epoch: Instant,
}

impl SessionManager {
    /// Manager with a per-conversation message cap and no bound on the
    /// number of conversations.
    pub fn new(max_messages: usize) -> Self {
        Self::with_limits(max_messages, usize::MAX, None)
    }

    pub fn with_limits(
        max_messages: usize,
        max_conversations: usize,
        idle_ttl: Option<Duration>,
    ) -> Self {
        Self {
            conversations: DashMap::new(),
            max_messages,
            max_conversations,
            idle_ttl,
            epoch: Instant::now(),
        }
    }

    pub fn from_config(config: &SessionSection) -> Self {
        Self::with_limits(
            config.max_messages,
            config.max_conversations,
            config.idle_ttl(),
        )
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn touch(&self, conversation: &Conversation) {
        conversation.last_active.store(self.now_ms(), Ordering::Relaxed);
    }

    /// Make room for one more conversation.
    fn evict(&self) {
        let now = self.now_ms();
        if let Some(ttl) = self.idle_ttl {
            let ttl_ms = ttl.as_millis() as u64;
            let before = self.conversations.len();
            self.conversations.retain(|_, c| {
                now.saturating_sub(c.last_active.load(Ordering::Relaxed)) <= ttl_ms
            });
            let expired = before.saturating_sub(self.conversations.len());
            if expired > 0 {
                tracing::debug!(expired, "Dropped idle conversations");
            }
        }

        let len = self.conversations.len();
        if len < self.max_conversations {
            return;
        }
        let mut by_age: Vec<(u64, Uuid)> = self
            .conversations
            .iter()
            .map(|entry| (entry.last_active.load(Ordering::Relaxed), *entry.key()))
            .collect();
        by_age.sort_unstable();
        let excess = len + 1 - self.max_conversations.min(len + 1);
        for (_, id) in by_age.into_iter().take(excess) {
            self.conversations.remove(&id);
        }
        tracing::debug!(evicted = excess, "Evicted least recently used conversations");
    }

    /// Return `id` if it names a conversation of `owner`, creating it under
    /// that id when unknown. Without an id a fresh conversation is created.
    pub fn open(&self, owner: &str, id: Option<Uuid>) -> Result<Uuid, SessionError> {
        let id = id.unwrap_or_else(Uuid::new_v4);
        if !self.conversations.contains_key(&id) {
            self.evict();
        }
        let entry = self
            .conversations
            .entry(id)
            .or_insert_with(|| {
                tracing::debug!(conversation_id = %id, owner, "Opened conversation");
                Arc::new(Conversation {
                    owner: owner.to_string(),
                    created_at: Utc::now(),
                    last_active: AtomicU64::new(self.now_ms()),
                    state: Mutex::new(ConversationState {
                        messages: VecDeque::new(),
                        dropped: 0,
                        context: None,
                    }),
                })
            })
            .clone();
        if entry.owner != owner {
            return Err(SessionError::Forbidden { id });
        }
        self.touch(&entry);
        Ok(id)
    }

    fn get(&self, id: Uuid, owner: &str) -> Result<Arc<Conversation>, SessionError> {
        // Clone the Arc out so no map shard lock is held across an await.
        let conversation = self
            .conversations
            .get(&id)
            .map(|c| c.value().clone())
            .ok_or(SessionError::NotFound { id })?;
        if conversation.owner != owner {
            return Err(SessionError::Forbidden { id });
        }
        self.touch(&conversation);
        Ok(conversation)
    }

    /// Append a message, dropping the oldest ones beyond the cap.
    /// Returns the number of stored messages afterwards.
    pub async fn append(
        &self,
        id: Uuid,
        owner: &str,
        message: Message,
    ) -> Result<usize, SessionError> {
        let conversation = self.get(id, owner)?;
        let mut state = conversation.state.lock().await;
        state.messages.push_back(message);
        while state.messages.len() > self.max_messages {
            state.messages.pop_front();
            state.dropped += 1;
        }
        if state.dropped > 0 {
            tracing::debug!(
                conversation_id = %id,
                dropped = state.dropped,
                "Conversation history truncated"
            );
        }
        Ok(state.messages.len())
    }

    /// Replace the free-form context attached to a conversation.
    pub async fn set_context(
        &self,
        id: Uuid,
        owner: &str,
        context: serde_json::Value,
    ) -> Result<(), SessionError> {
        let conversation = self.get(id, owner)?;
        conversation.state.lock().await.context = Some(context);
        Ok(())
    }

    pub async fn history(&self, id: Uuid, owner: &str) -> Result<HistorySnapshot, SessionError> {
        let conversation = self.get(id, owner)?;
        let state = conversation.state.lock().await;
        Ok(HistorySnapshot {
            conversation_id: id,
            created_at: conversation.created_at,
            messages: state.messages.iter().cloned().collect(),
            truncated: state.dropped > 0,
            dropped: state.dropped,
            context: state.context.clone(),
        })
    }

    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modelsmith_common::Role;

    #[tokio::test]
    async fn test_open_creates_and_reopens() {
        let sessions = SessionManager::new(10);
        let id = sessions.open("alice", None).unwrap();
        assert_eq!(sessions.open("alice", Some(id)).unwrap(), id);
        assert_eq!(sessions.len(), 1);
    }

    #[tokio::test]
    async fn test_open_unknown_id_creates_under_that_id() {
        let sessions = SessionManager::new(10);
        let id = Uuid::new_v4();
        assert_eq!(sessions.open("alice", Some(id)).unwrap(), id);
        let snapshot = sessions.history(id, "alice").await.unwrap();
        assert!(snapshot.messages.is_empty());
    }

    #[tokio::test]
    async fn test_other_owner_is_forbidden() {
        let sessions = SessionManager::new(10);
        let id = sessions.open("alice", None).unwrap();
        assert!(matches!(
            sessions.open("bob", Some(id)),
            Err(SessionError::Forbidden { .. })
        ));
        assert!(matches!(
            sessions.append(id, "bob", Message::user("hi")).await,
            Err(SessionError::Forbidden { .. })
        ));
        assert!(matches!(
            sessions.history(id, "bob").await,
            Err(SessionError::Forbidden { .. })
        ));
    }

    #[tokio::test]
    async fn test_history_of_unknown_conversation() {
        let sessions = SessionManager::new(10);
        assert!(matches!(
            sessions.history(Uuid::new_v4(), "alice").await,
            Err(SessionError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_append_preserves_order() {
        let sessions = SessionManager::new(10);
        let id = sessions.open("alice", None).unwrap();
        sessions.append(id, "alice", Message::user("one")).await.unwrap();
        sessions
            .append(id, "alice", Message::assistant("two"))
            .await
            .unwrap();
        let snapshot = sessions.history(id, "alice").await.unwrap();
        let texts: Vec<_> = snapshot.messages.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["one", "two"]);
        assert_eq!(snapshot.messages[1].role, Role::Assistant);
        assert!(!snapshot.truncated);
    }

    #[tokio::test]
    async fn test_cap_drops_oldest_and_flags_truncation() {
        let sessions = SessionManager::new(3);
        let id = sessions.open("alice", None).unwrap();
        for i in 0..5 {
            sessions
                .append(id, "alice", Message::user(format!("m{}", i)))
                .await
                .unwrap();
        }
        let snapshot = sessions.history(id, "alice").await.unwrap();
        let texts: Vec<_> = snapshot.messages.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["m2", "m3", "m4"]);
        assert!(snapshot.truncated);
        assert_eq!(snapshot.dropped, 2);
    }

    #[tokio::test]
    async fn test_concurrent_appends_lose_nothing() {
        let sessions = Arc::new(SessionManager::new(1000));
        let id = sessions.open("alice", None).unwrap();
        let mut handles = Vec::new();
        for i in 0..50 {
            let sessions = sessions.clone();
            handles.push(tokio::spawn(async move {
                sessions
                    .append(id, "alice", Message::user(format!("m{}", i)))
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        let snapshot = sessions.history(id, "alice").await.unwrap();
        assert_eq!(snapshot.messages.len(), 50);
        let mut texts: Vec<_> = snapshot.messages.iter().map(|m| m.text.clone()).collect();
        texts.sort();
        texts.dedup();
        assert_eq!(texts.len(), 50);
    }

    #[tokio::test]
    async fn test_conversation_count_is_bounded() {
        let sessions = SessionManager::with_limits(10, 3, None);
        let first = sessions.open("alice", None).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        let second = sessions.open("alice", None).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        let third = sessions.open("alice", None).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        // Using the first one makes the second the least recently used.
        sessions.history(first, "alice").await.unwrap();
        std::thread::sleep(Duration::from_millis(5));

        let fourth = sessions.open("bob", None).unwrap();
        assert_eq!(sessions.len(), 3);
        assert!(matches!(
            sessions.history(second, "alice").await,
            Err(SessionError::NotFound { .. })
        ));
        for id in [first, third] {
            assert!(sessions.history(id, "alice").await.is_ok());
        }
        assert!(sessions.history(fourth, "bob").await.is_ok());
    }

    #[tokio::test]
    async fn test_idle_conversations_expire() {
        let sessions = SessionManager::with_limits(10, 100, Some(Duration::from_millis(20)));
        let stale = sessions.open("alice", None).unwrap();
        std::thread::sleep(Duration::from_millis(60));
        let fresh = sessions.open("alice", None).unwrap();
        assert_eq!(sessions.len(), 1);
        assert!(sessions.history(stale, "alice").await.is_err());
        assert!(sessions.history(fresh, "alice").await.is_ok());
    }

    #[tokio::test]
    async fn test_reopening_existing_conversation_never_evicts() {
        let sessions = SessionManager::with_limits(10, 1, None);
        let id = sessions.open("alice", None).unwrap();
        assert_eq!(sessions.open("alice", Some(id)).unwrap(), id);
        assert_eq!(sessions.len(), 1);
    }

    #[tokio::test]
    async fn test_set_context_is_visible_in_history() {
        let sessions = SessionManager::new(10);
        let id = sessions.open("alice", None).unwrap();
        sessions
            .set_context(id, "alice", serde_json::json!({"company": "Acme"}))
            .await
            .unwrap();
        let snapshot = sessions.history(id, "alice").await.unwrap();
        assert_eq!(snapshot.context.unwrap()["company"], "Acme");
    }
}
