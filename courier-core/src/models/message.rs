use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Incoming,
    Outgoing,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Incoming => "incoming",
            Direction::Outgoing => "outgoing",
        }
    }
}

impl TryFrom<String> for Direction {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "incoming" => Ok(Direction::Incoming),
            "outgoing" => Ok(Direction::Outgoing),
            other => Err(format!("unknown message direction: {}", other)),
        }
    }
}

/// Append-only log entry for a chat message observed or sent by an agent.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub id: Uuid,
    pub session_id: Uuid,
    pub agent_id: String,
    pub message_id: Option<String>,
    pub from_number: Option<String>,
    pub to_number: Option<String>,
    pub text: Option<String>,
    pub message_type: String,
    #[sqlx(try_from = "String")]
    pub direction: Direction,
    pub status: String,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl MessageRecord {
    pub fn incoming(
        session_id: Uuid,
        agent_id: &str,
        message_id: &str,
        from: &str,
        to: Option<&str>,
        text: &str,
    ) -> Self {
        Self::build(session_id, agent_id, Direction::Incoming, "received", message_id, Some(from), to, text)
    }

    pub fn outgoing(
        session_id: Uuid,
        agent_id: &str,
        message_id: &str,
        from: Option<&str>,
        to: &str,
        text: &str,
    ) -> Self {
        Self::build(session_id, agent_id, Direction::Outgoing, "sent", message_id, from, Some(to), text)
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        session_id: Uuid,
        agent_id: &str,
        direction: Direction,
        status: &str,
        message_id: &str,
        from: Option<&str>,
        to: Option<&str>,
        text: &str,
    ) -> Self {
        let present = |v: &str| (!v.is_empty()).then(|| v.to_string());
        Self {
            id: Uuid::new_v4(),
            session_id,
            agent_id: agent_id.to_string(),
            message_id: present(message_id),
            from_number: from.and_then(present),
            to_number: to.and_then(present),
            text: present(text),
            message_type: "text".to_string(),
            direction,
            status: status.to_string(),
            metadata: serde_json::json!({}),
            created_at: Utc::now(),
        }
    }
}

/// Counts shown on the session detail view.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageStats {
    pub incoming: i64,
    pub responded: i64,
}
