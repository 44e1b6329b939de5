//! In-process stores for `--ephemeral` runs and tests.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use super::{ExecutionStore, MessageStore, Result, SessionStore, UserStore};
use crate::error::CourierError;
use crate::models::{AgentSession, Direction, ExecutionRecord, MessageRecord, User};

fn poisoned<T>(_: T) -> CourierError {
    CourierError::Persistence("store lock poisoned".to_string())
}

fn page<T: Clone>(mut rows: Vec<T>, limit: i64, offset: i64) -> Vec<T> {
    let offset = offset.max(0) as usize;
    let limit = limit.max(0) as usize;
    if offset >= rows.len() {
        return Vec::new();
    }
    rows.drain(..offset);
    rows.truncate(limit);
    rows
}

#[derive(Default)]
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<String, AgentSession>>,
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create(&self, session: &AgentSession) -> Result<()> {
        let mut sessions = self.sessions.lock().map_err(poisoned)?;
        if sessions.contains_key(&session.agent_id) {
            return Err(CourierError::AlreadyExists(session.agent_id.clone()));
        }
        sessions.insert(session.agent_id.clone(), session.clone());
        Ok(())
    }

    async fn update(&self, session: &AgentSession) -> Result<()> {
        let mut sessions = self.sessions.lock().map_err(poisoned)?;
        // UPDATE of a missing row is a no-op, same as Postgres.
        if let Some(existing) = sessions.get_mut(&session.agent_id) {
            if existing.id == session.id {
                *existing = session.clone();
                existing.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn delete(&self, agent_id: &str) -> Result<()> {
        self.sessions.lock().map_err(poisoned)?.remove(agent_id);
        Ok(())
    }

    async fn get_by_agent(&self, agent_id: &str) -> Result<Option<AgentSession>> {
        Ok(self.sessions.lock().map_err(poisoned)?.get(agent_id).cloned())
    }

    async fn get_by_owner_and_agent(
        &self,
        owner_user_id: &str,
        agent_id: &str,
    ) -> Result<Option<AgentSession>> {
        Ok(self
            .sessions
            .lock()
            .map_err(poisoned)?
            .get(agent_id)
            .filter(|s| s.owner_user_id == owner_user_id)
            .cloned())
    }

    async fn list(&self) -> Result<Vec<AgentSession>> {
        let mut rows: Vec<AgentSession> =
            self.sessions.lock().map_err(poisoned)?.values().cloned().collect();
        rows.sort_by_key(|s| s.created_at);
        Ok(rows)
    }
}

#[derive(Default)]
pub struct MemoryMessageStore {
    messages: Mutex<Vec<MessageRecord>>,
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn create(&self, message: &MessageRecord) -> Result<()> {
        self.messages.lock().map_err(poisoned)?.push(message.clone());
        Ok(())
    }

    async fn list_by_session(
        &self,
        session_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<MessageRecord>> {
        let rows: Vec<MessageRecord> = self
            .messages
            .lock()
            .map_err(poisoned)?
            .iter()
            .rev()
            .filter(|m| m.session_id == session_id)
            .cloned()
            .collect();
        Ok(page(rows, limit, offset))
    }

    async fn count_by_agent_and_direction(
        &self,
        agent_id: &str,
        direction: Direction,
    ) -> Result<i64> {
        let count = self
            .messages
            .lock()
            .map_err(poisoned)?
            .iter()
            .filter(|m| m.agent_id == agent_id && m.direction == direction)
            .count();
        Ok(count as i64)
    }
}

#[derive(Default)]
pub struct MemoryExecutionStore {
    executions: Mutex<Vec<ExecutionRecord>>,
}

#[async_trait]
impl ExecutionStore for MemoryExecutionStore {
    async fn create(&self, execution: &ExecutionRecord) -> Result<()> {
        self.executions.lock().map_err(poisoned)?.push(execution.clone());
        Ok(())
    }

    async fn list_by_session(
        &self,
        session_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ExecutionRecord>> {
        let rows: Vec<ExecutionRecord> = self
            .executions
            .lock()
            .map_err(poisoned)?
            .iter()
            .rev()
            .filter(|e| e.session_id == session_id)
            .cloned()
            .collect();
        Ok(page(rows, limit, offset))
    }
}

#[derive(Default)]
pub struct MemoryUserStore {
    users: Mutex<HashMap<String, User>>,
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn create(&self, user: &User) -> Result<()> {
        let mut users = self.users.lock().map_err(poisoned)?;
        if users.contains_key(&user.user_id) || users.values().any(|u| u.api_key == user.api_key) {
            return Err(CourierError::AlreadyExists(user.user_id.clone()));
        }
        users.insert(user.user_id.clone(), user.clone());
        Ok(())
    }

    async fn get_by_api_key(&self, api_key: &str) -> Result<Option<User>> {
        Ok(self
            .users
            .lock()
            .map_err(poisoned)?
            .values()
            .find(|u| u.api_key == api_key)
            .cloned())
    }

    async fn get_by_id(&self, user_id: &str) -> Result<Option<User>> {
        Ok(self.users.lock().map_err(poisoned)?.get(user_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewSession, SessionStatus};

    fn new_session(owner: &str, agent: &str) -> AgentSession {
        AgentSession::new(
            owner,
            NewSession {
                agent_id: agent.to_string(),
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_session_create_rejects_duplicate_agent() {
        let store = MemorySessionStore::default();
        store.create(&new_session("admin", "a1")).await.unwrap();
        let err = store.create(&new_session("other", "a1")).await.unwrap_err();
        assert!(matches!(err, CourierError::AlreadyExists(ref a) if a == "a1"));
    }

    #[tokio::test]
    async fn test_session_owner_scoped_lookup() {
        let store = MemorySessionStore::default();
        store.create(&new_session("alice", "a1")).await.unwrap();
        assert!(store.get_by_owner_and_agent("alice", "a1").await.unwrap().is_some());
        assert!(store.get_by_owner_and_agent("bob", "a1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_session_update_replaces_record() {
        let store = MemorySessionStore::default();
        let mut s = new_session("admin", "a1");
        store.create(&s).await.unwrap();

        s.status = SessionStatus::Connected;
        s.phone_number = Some("15550001111".into());
        store.update(&s).await.unwrap();

        let stored = store.get_by_agent("a1").await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Connected);
        assert_eq!(stored.phone_number.as_deref(), Some("15550001111"));
        assert!(stored.updated_at >= s.updated_at);
    }

    #[tokio::test]
    async fn test_update_after_delete_does_not_resurrect() {
        let store = MemorySessionStore::default();
        let s = new_session("admin", "a1");
        store.create(&s).await.unwrap();
        store.delete("a1").await.unwrap();
        store.update(&s).await.unwrap();
        assert!(store.get_by_agent("a1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_message_counts_by_direction() {
        let store = MemoryMessageStore::default();
        let sid = Uuid::new_v4();
        store
            .create(&MessageRecord::incoming(sid, "a1", "m1", "111", None, "hi"))
            .await
            .unwrap();
        store
            .create(&MessageRecord::incoming(sid, "a1", "m2", "111", None, "again"))
            .await
            .unwrap();
        store
            .create(&MessageRecord::outgoing(sid, "a1", "m3", None, "111", "hello"))
            .await
            .unwrap();
        store
            .create(&MessageRecord::incoming(sid, "a2", "m4", "222", None, "other agent"))
            .await
            .unwrap();

        assert_eq!(store.count_by_agent_and_direction("a1", Direction::Incoming).await.unwrap(), 2);
        assert_eq!(store.count_by_agent_and_direction("a1", Direction::Outgoing).await.unwrap(), 1);
        assert_eq!(store.count_by_agent_and_direction("zz", Direction::Incoming).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_message_listing_is_newest_first_and_paged() {
        let store = MemoryMessageStore::default();
        let sid = Uuid::new_v4();
        for i in 0..5 {
            let id = format!("m{}", i);
            store
                .create(&MessageRecord::incoming(sid, "a1", &id, "111", None, "x"))
                .await
                .unwrap();
        }
        let first = store.list_by_session(sid, 2, 0).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].message_id.as_deref(), Some("m4"));
        let tail = store.list_by_session(sid, 10, 4).await.unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].message_id.as_deref(), Some("m0"));
        assert!(store.list_by_session(sid, 10, 9).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_user_lookup_by_key() {
        let store = MemoryUserStore::default();
        store.create(&User::new("admin", "secret")).await.unwrap();
        let found = store.get_by_api_key("secret").await.unwrap().unwrap();
        assert_eq!(found.user_id, "admin");
        assert!(store.get_by_api_key("nope").await.unwrap().is_none());
        assert!(store.create(&User::new("admin", "other")).await.is_err());
    }
}
