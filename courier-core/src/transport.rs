//! Messaging-network transport seam
//!
//! The orchestrator never speaks the network protocol itself. It drives a
//! `DeviceConnection` (one paired or pairing device) obtained from a
//! `ConnectionFactory` (the device store). The concrete implementation lives
//! in `courier-server::bridge`; tests use in-process fakes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Server part of a regular user address.
pub const USER_SERVER: &str = "s.whatsapp.net";
/// Server part of a network-internal alias address.
pub const ALIAS_SERVER: &str = "lid";
/// Server part of an alias address for hosted accounts.
pub const HOSTED_ALIAS_SERVER: &str = "hosted.lid";
/// Server part of a group chat address.
pub const GROUP_SERVER: &str = "g.us";

// ============================================================================
// Address
// ============================================================================

/// A network address: `user[:device]@server`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address {
    pub user: String,
    pub server: String,
    pub device: u16,
}

impl Address {
    pub fn new(user: impl Into<String>, server: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            server: server.into(),
            device: 0,
        }
    }

    pub fn user(phone: impl Into<String>) -> Self {
        Self::new(phone, USER_SERVER)
    }

    pub fn with_device(mut self, device: u16) -> Self {
        self.device = device;
        self
    }

    pub fn is_alias(&self) -> bool {
        self.server == ALIAS_SERVER || self.server == HOSTED_ALIAS_SERVER
    }

    pub fn is_group(&self) -> bool {
        self.server == GROUP_SERVER
    }

    pub fn is_empty(&self) -> bool {
        self.user.is_empty()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.device > 0 {
            write!(f, "{}:{}@{}", self.user, self.device, self.server)
        } else {
            write!(f, "{}@{}", self.user, self.server)
        }
    }
}

impl FromStr for Address {
    type Err = TransportError;

    /// Accepts `user@server`, `user:device@server`, `user.agent:device@server`
    /// and a bare `user` (assumed to live on the user server).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(TransportError::InvalidAddress(s.to_string()));
        }
        let (local, server) = match s.split_once('@') {
            Some((local, server)) if !server.is_empty() => (local, server),
            Some(_) => return Err(TransportError::InvalidAddress(s.to_string())),
            None => (s, USER_SERVER),
        };
        let (user_part, device) = match local.split_once(':') {
            Some((user, device)) => {
                let device = device
                    .parse::<u16>()
                    .map_err(|_| TransportError::InvalidAddress(s.to_string()))?;
                (user, device)
            }
            None => (local, 0),
        };
        // Drop the legacy `.agent` suffix.
        let user = user_part.split('.').next().unwrap_or(user_part);
        if user.is_empty() {
            return Err(TransportError::InvalidAddress(s.to_string()));
        }
        Ok(Self {
            user: user.to_string(),
            server: server.to_string(),
            device,
        })
    }
}

impl TryFrom<String> for Address {
    type Error = TransportError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Address> for String {
    fn from(value: Address) -> Self {
        value.to_string()
    }
}

// ============================================================================
// Events
// ============================================================================

/// Items on a connection's pairing-code stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "code", rename_all = "snake_case")]
pub enum PairingEvent {
    Code(String),
    Timeout,
}

/// Chat presence states the gateway emits while an agent is working.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatPresence {
    Composing,
    Paused,
}

/// Body of an inbound message. Only text bodies are routed to agents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageContent {
    Conversation {
        text: String,
    },
    ExtendedText {
        text: String,
        #[serde(default)]
        mentioned: Vec<String>,
    },
    Other {
        kind: String,
    },
}

impl MessageContent {
    /// Plain text of the message, or `None` for non-text or empty bodies.
    pub fn text(&self) -> Option<&str> {
        match self {
            MessageContent::Conversation { text } | MessageContent::ExtendedText { text, .. } => {
                Some(text.as_str()).filter(|t| !t.is_empty())
            }
            MessageContent::Other { .. } => None,
        }
    }

    /// Structured mention list (raw address strings).
    pub fn mentioned(&self) -> &[String] {
        match self {
            MessageContent::ExtendedText { mentioned, .. } => mentioned,
            _ => &[],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub id: String,
    pub chat: Address,
    pub sender: Address,
    pub is_group: bool,
    pub is_from_me: bool,
    pub content: MessageContent,
}

/// Items on a connection's general event stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ConnectionEvent {
    Connected,
    LoggedOut,
    PairSuccess { identity: DeviceIdentity },
    Message(InboundMessage),
}

/// What the device store knows about the device behind a connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Primary address; `None` until the device has been paired.
    pub address: Option<Address>,
    /// Network-internal alias of the account, when known.
    pub alias: Option<Address>,
    /// Display name the account advertises to contacts.
    pub push_name: Option<String>,
}

impl DeviceIdentity {
    pub fn is_paired(&self) -> bool {
        self.address.as_ref().map(|a| !a.is_empty()).unwrap_or(false)
    }

    pub fn phone(&self) -> Option<&str> {
        self.address.as_ref().map(|a| a.user.as_str())
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("connection is closed")]
    Closed,

    #[error("request timed out after {0}s")]
    Timeout(u64),

    #[error("bridge rejected request: {0}")]
    Rejected(String),

    #[error("bridge protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

// ============================================================================
// Traits
// ============================================================================

/// One device connection to the messaging network.
#[async_trait]
pub trait DeviceConnection: Send + Sync {
    /// Start (or restart) the connect handshake. For an unpaired device this
    /// begins emitting pairing codes.
    async fn connect(&self) -> Result<(), TransportError>;

    async fn disconnect(&self);

    fn is_connected(&self) -> bool;

    fn identity(&self) -> DeviceIdentity;

    /// Send a text message, returning the network message id.
    async fn send_message(&self, to: &Address, text: &str) -> Result<String, TransportError>;

    async fn send_presence(&self, to: &Address, presence: ChatPresence) -> Result<(), TransportError>;

    /// Look up the primary address behind an alias address.
    async fn resolve_alias(&self, alias: &Address) -> Result<Option<Address>, TransportError>;

    /// Subscribe to pairing codes. Subscribing again closes earlier receivers.
    fn pairing_events(&self) -> mpsc::UnboundedReceiver<PairingEvent>;

    /// Subscribe to connection events. Subscribing again closes earlier receivers.
    fn events(&self) -> mpsc::UnboundedReceiver<ConnectionEvent>;
}

/// The device store: creates and resolves device connections.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// A fresh, unpaired device.
    async fn new_connection(&self) -> Result<Arc<dyn DeviceConnection>, TransportError>;

    /// A stored device by its exact address, or `None` if unknown.
    async fn resolve_by_identifier(
        &self,
        address: &Address,
    ) -> Result<Option<Arc<dyn DeviceConnection>>, TransportError>;

    /// Addresses of every stored, paired device.
    async fn list_devices(&self) -> Result<Vec<Address>, TransportError>;

    /// Remove a paired device from the store.
    async fn delete_device(&self, address: &Address) -> Result<(), TransportError>;

    /// The most recently assigned stored device for a phone number.
    async fn resolve_by_phone(
        &self,
        phone: &str,
    ) -> Result<Option<Arc<dyn DeviceConnection>>, TransportError> {
        let devices = self.list_devices().await?;
        match latest_device_for_phone(&devices, phone) {
            Some(address) => self.resolve_by_identifier(&address).await,
            None => Ok(None),
        }
    }
}

/// Pick the device with the highest device index for `phone`.
pub fn latest_device_for_phone(devices: &[Address], phone: &str) -> Option<Address> {
    devices
        .iter()
        .filter(|d| d.user == phone && !d.is_alias())
        .max_by_key(|d| d.device)
        .cloned()
}
