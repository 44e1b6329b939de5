//! Persistence seams
//!
//! The orchestrator and the execution proxy only see these traits. `postgres`
//! is the production implementation; `memory` backs `--ephemeral` runs and
//! the test suites.

use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::CourierError;
use crate::models::{AgentSession, Direction, ExecutionRecord, MessageRecord, User};

pub mod memory;
pub mod postgres;

pub use memory::{MemoryExecutionStore, MemoryMessageStore, MemorySessionStore, MemoryUserStore};
pub use postgres::{PgExecutionStore, PgMessageStore, PgSessionStore, PgUserStore};

pub type Result<T> = std::result::Result<T, CourierError>;

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert a new session. Fails with `AlreadyExists` on a duplicate agent id.
    async fn create(&self, session: &AgentSession) -> Result<()>;

    /// Write back the full record, stamping `updated_at`.
    async fn update(&self, session: &AgentSession) -> Result<()>;

    async fn delete(&self, agent_id: &str) -> Result<()>;

    async fn get_by_agent(&self, agent_id: &str) -> Result<Option<AgentSession>>;

    async fn get_by_owner_and_agent(
        &self,
        owner_user_id: &str,
        agent_id: &str,
    ) -> Result<Option<AgentSession>>;

    async fn list(&self) -> Result<Vec<AgentSession>>;
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn create(&self, message: &MessageRecord) -> Result<()>;

    /// Newest first.
    async fn list_by_session(
        &self,
        session_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<MessageRecord>>;

    async fn count_by_agent_and_direction(&self, agent_id: &str, direction: Direction)
        -> Result<i64>;
}

#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn create(&self, execution: &ExecutionRecord) -> Result<()>;

    /// Newest first.
    async fn list_by_session(
        &self,
        session_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ExecutionRecord>>;
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn create(&self, user: &User) -> Result<()>;

    async fn get_by_api_key(&self, api_key: &str) -> Result<Option<User>>;

    async fn get_by_id(&self, user_id: &str) -> Result<Option<User>>;
}

/// The four stores, bundled for wiring.
#[derive(Clone)]
pub struct Stores {
    pub sessions: Arc<dyn SessionStore>,
    pub messages: Arc<dyn MessageStore>,
    pub executions: Arc<dyn ExecutionStore>,
    pub users: Arc<dyn UserStore>,
}

impl Stores {
    pub fn postgres(pool: sqlx::PgPool) -> Self {
        Self {
            sessions: Arc::new(PgSessionStore::new(pool.clone())),
            messages: Arc::new(PgMessageStore::new(pool.clone())),
            executions: Arc::new(PgExecutionStore::new(pool.clone())),
            users: Arc::new(PgUserStore::new(pool)),
        }
    }

    pub fn memory() -> Self {
        Self {
            sessions: Arc::new(MemorySessionStore::default()),
            messages: Arc::new(MemoryMessageStore::default()),
            executions: Arc::new(MemoryExecutionStore::default()),
            users: Arc::new(MemoryUserStore::default()),
        }
    }
}
