use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failed => "failed",
        }
    }
}

impl TryFrom<String> for ExecutionStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "success" => Ok(ExecutionStatus::Success),
            "failed" => Ok(ExecutionStatus::Failed),
            other => Err(format!("unknown execution status: {}", other)),
        }
    }
}

/// Append-only log entry for one call to the agent backend.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    pub id: Uuid,
    pub session_id: Uuid,
    pub agent_id: String,
    pub user_message: Option<String>,
    pub response_body: Option<String>,
    pub execution_time_ms: i64,
    #[sqlx(try_from = "String")]
    pub status: ExecutionStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ExecutionRecord {
    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }

    /// Reply text from a successful execution: `response`, else `message`.
    ///
    /// Returns `None` for failed records, non-JSON bodies and empty replies.
    pub fn reply(&self) -> Option<String> {
        if !self.is_success() {
            return None;
        }
        let body = self.response_body.as_deref()?;
        let parsed: serde_json::Value = serde_json::from_str(body).ok()?;
        let obj = parsed.as_object()?;

        ["response", "message"].iter().find_map(|key| {
            obj.get(*key)
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        })
    }
}
