use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::transport::Address;

/// Key in `session_metadata` holding the paired device address.
pub const METADATA_DEVICE_KEY: &str = "jid";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Initializing,
    WaitingScan,
    QrTimeout,
    Connected,
    Disconnected,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Initializing => "initializing",
            SessionStatus::WaitingScan => "waiting_scan",
            SessionStatus::QrTimeout => "qr_timeout",
            SessionStatus::Connected => "connected",
            SessionStatus::Disconnected => "disconnected",
        }
    }

    /// States in which a pairing code is expected to be on screen.
    pub fn is_pairing(&self) -> bool {
        matches!(self, SessionStatus::WaitingScan | SessionStatus::QrTimeout)
    }

    /// States restored on startup.
    pub fn should_restore(&self) -> bool {
        matches!(
            self,
            SessionStatus::Connected | SessionStatus::Initializing | SessionStatus::WaitingScan
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for SessionStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "initializing" => Ok(SessionStatus::Initializing),
            "waiting_scan" => Ok(SessionStatus::WaitingScan),
            "qr_timeout" => Ok(SessionStatus::QrTimeout),
            "connected" => Ok(SessionStatus::Connected),
            "disconnected" => Ok(SessionStatus::Disconnected),
            other => Err(format!("unknown session status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct AgentSession {
    pub id: Uuid,
    pub owner_user_id: String,
    pub agent_id: String,
    pub display_name: Option<String>,
    pub phone_number: Option<String>,
    pub pairing_code: Option<String>,
    pub pairing_code_image: Option<String>,
    pub last_pairing_code_issued_at: Option<DateTime<Utc>>,
    #[sqlx(try_from = "String")]
    pub status: SessionStatus,
    pub connected_at: Option<DateTime<Utc>>,
    pub disconnected_at: Option<DateTime<Utc>>,
    pub backend_url: Option<String>,
    #[serde(skip_serializing, default)]
    pub backend_api_key: Option<String>,
    pub session_metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Caller-supplied fields for a new session.
#[derive(Debug, Clone, Default)]
pub struct NewSession {
    pub agent_id: String,
    pub display_name: Option<String>,
    pub backend_api_key: Option<String>,
    pub backend_url: Option<String>,
}

impl AgentSession {
    pub fn new(owner_user_id: &str, req: NewSession) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner_user_id: owner_user_id.to_string(),
            agent_id: req.agent_id,
            display_name: non_empty(req.display_name),
            phone_number: None,
            pairing_code: None,
            pairing_code_image: None,
            last_pairing_code_issued_at: None,
            status: SessionStatus::Initializing,
            connected_at: None,
            disconnected_at: None,
            backend_url: non_empty(req.backend_url),
            backend_api_key: non_empty(req.backend_api_key),
            session_metadata: serde_json::json!({}),
            created_at: now,
            updated_at: now,
        }
    }

    /// Address of the paired device recorded on pairing success, if any.
    pub fn paired_address(&self) -> Option<Address> {
        self.session_metadata
            .get(METADATA_DEVICE_KEY)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .and_then(|s| s.parse().ok())
    }

    pub fn set_paired_address(&mut self, address: &Address) {
        if !self.session_metadata.is_object() {
            self.session_metadata = serde_json::json!({});
        }
        if let Some(obj) = self.session_metadata.as_object_mut() {
            obj.insert(
                METADATA_DEVICE_KEY.to_string(),
                serde_json::Value::String(address.to_string()),
            );
        }
    }

    pub fn clear_pairing_material(&mut self) {
        self.pairing_code = None;
        self.pairing_code_image = None;
    }

    /// True when the last code is older than `max_age` (or was never issued).
    pub fn pairing_code_is_stale(&self, now: DateTime<Utc>, max_age: std::time::Duration) -> bool {
        match self.last_pairing_code_issued_at {
            Some(issued) => {
                let age = now.signed_duration_since(issued);
                age.to_std().map(|a| a >= max_age).unwrap_or(false)
            }
            None => true,
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
