use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use super::{ExecutionStore, MessageStore, Result, SessionStore, UserStore};
use crate::error::CourierError;
use crate::models::{AgentSession, Direction, ExecutionRecord, MessageRecord, User};

/// PostgreSQL SQLSTATE for unique_violation.
const UNIQUE_VIOLATION: &str = "23505";

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .and_then(|db| db.code())
        .map(|code| code == UNIQUE_VIOLATION)
        .unwrap_or(false)
}

// ============================================================================
// Sessions
// ============================================================================

pub struct PgSessionStore {
    pool: PgPool,
}

impl PgSessionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn create(&self, s: &AgentSession) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO sessions (
                id, owner_user_id, agent_id, display_name, phone_number,
                pairing_code, pairing_code_image, last_pairing_code_issued_at,
                status, connected_at, disconnected_at, backend_url, backend_api_key,
                session_metadata, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(s.id)
        .bind(&s.owner_user_id)
        .bind(&s.agent_id)
        .bind(&s.display_name)
        .bind(&s.phone_number)
        .bind(&s.pairing_code)
        .bind(&s.pairing_code_image)
        .bind(s.last_pairing_code_issued_at)
        .bind(s.status.as_str())
        .bind(s.connected_at)
        .bind(s.disconnected_at)
        .bind(&s.backend_url)
        .bind(&s.backend_api_key)
        .bind(&s.session_metadata)
        .bind(s.created_at)
        .bind(s.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(CourierError::AlreadyExists(s.agent_id.clone())),
            Err(e) => Err(e.into()),
        }
    }

    async fn update(&self, s: &AgentSession) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE sessions SET
                display_name = $2, phone_number = $3, pairing_code = $4,
                pairing_code_image = $5, last_pairing_code_issued_at = $6, status = $7,
                connected_at = $8, disconnected_at = $9, backend_url = $10,
                backend_api_key = $11, session_metadata = $12, updated_at = $13
            WHERE id = $1
            "#,
        )
        .bind(s.id)
        .bind(&s.display_name)
        .bind(&s.phone_number)
        .bind(&s.pairing_code)
        .bind(&s.pairing_code_image)
        .bind(s.last_pairing_code_issued_at)
        .bind(s.status.as_str())
        .bind(s.connected_at)
        .bind(s.disconnected_at)
        .bind(&s.backend_url)
        .bind(&s.backend_api_key)
        .bind(&s.session_metadata)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, agent_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM sessions WHERE agent_id = $1")
            .bind(agent_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_by_agent(&self, agent_id: &str) -> Result<Option<AgentSession>> {
        let row = sqlx::query_as::<_, AgentSession>("SELECT * FROM sessions WHERE agent_id = $1")
            .bind(agent_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn get_by_owner_and_agent(
        &self,
        owner_user_id: &str,
        agent_id: &str,
    ) -> Result<Option<AgentSession>> {
        let row = sqlx::query_as::<_, AgentSession>(
            "SELECT * FROM sessions WHERE owner_user_id = $1 AND agent_id = $2",
        )
        .bind(owner_user_id)
        .bind(agent_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn list(&self) -> Result<Vec<AgentSession>> {
        let rows = sqlx::query_as::<_, AgentSession>("SELECT * FROM sessions ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }
}

// ============================================================================
// Messages
// ============================================================================

pub struct PgMessageStore {
    pool: PgPool,
}

impl PgMessageStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MessageStore for PgMessageStore {
    async fn create(&self, m: &MessageRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO messages (
                id, session_id, agent_id, message_id, from_number, to_number,
                text, message_type, direction, status, metadata, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(m.id)
        .bind(m.session_id)
        .bind(&m.agent_id)
        .bind(&m.message_id)
        .bind(&m.from_number)
        .bind(&m.to_number)
        .bind(&m.text)
        .bind(&m.message_type)
        .bind(m.direction.as_str())
        .bind(&m.status)
        .bind(&m.metadata)
        .bind(m.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_by_session(
        &self,
        session_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<MessageRecord>> {
        let rows = sqlx::query_as::<_, MessageRecord>(
            "SELECT * FROM messages WHERE session_id = $1 ORDER BY created_at DESC LIMIT $2 OFFSET $3",
        )
        .bind(session_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn count_by_agent_and_direction(
        &self,
        agent_id: &str,
        direction: Direction,
    ) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*)::bigint FROM messages WHERE agent_id = $1 AND direction = $2",
        )
        .bind(agent_id)
        .bind(direction.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}

// ============================================================================
// Executions
// ============================================================================

pub struct PgExecutionStore {
    pool: PgPool,
}

impl PgExecutionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ExecutionStore for PgExecutionStore {
    async fn create(&self, e: &ExecutionRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO executions (
                id, session_id, agent_id, user_message, response_body,
                execution_time_ms, status, error_message, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(e.id)
        .bind(e.session_id)
        .bind(&e.agent_id)
        .bind(&e.user_message)
        .bind(&e.response_body)
        .bind(e.execution_time_ms)
        .bind(e.status.as_str())
        .bind(&e.error_message)
        .bind(e.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_by_session(
        &self,
        session_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ExecutionRecord>> {
        let rows = sqlx::query_as::<_, ExecutionRecord>(
            "SELECT * FROM executions WHERE session_id = $1 ORDER BY created_at DESC LIMIT $2 OFFSET $3",
        )
        .bind(session_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

// ============================================================================
// Users
// ============================================================================

pub struct PgUserStore {
    pool: PgPool,
}

impl PgUserStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn create(&self, u: &User) -> Result<()> {
        let result = sqlx::query(
            "INSERT INTO users (user_id, api_key, created_at, updated_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(&u.user_id)
        .bind(&u.api_key)
        .bind(u.created_at)
        .bind(u.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(CourierError::AlreadyExists(u.user_id.clone())),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_by_api_key(&self, api_key: &str) -> Result<Option<User>> {
        let row = sqlx::query_as::<_, User>("SELECT * FROM users WHERE api_key = $1")
            .bind(api_key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn get_by_id(&self, user_id: &str) -> Result<Option<User>> {
        let row = sqlx::query_as::<_, User>("SELECT * FROM users WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }
}
