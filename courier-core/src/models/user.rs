use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// API principal for the HTTP front door.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub user_id: String,
    #[serde(skip_serializing, default)]
    pub api_key: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn new(user_id: &str, api_key: &str) -> Self {
        let now = Utc::now();
        Self {
            user_id: user_id.to_string(),
            api_key: api_key.to_string(),
            created_at: now,
            updated_at: now,
        }
    }
}
