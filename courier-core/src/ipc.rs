//! Bridge IPC protocol
//!
//! Wire format between the gateway and the messaging-protocol sidecar: a
//! 4-byte little-endian length prefix followed by a MessagePack payload
//! (named fields). The gateway sends `RequestFrame`s; the sidecar answers with
//! `BridgeFrame::Response` carrying the same id, and pushes pairing codes and
//! connection events on attached streams.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::codec::LengthDelimitedCodec;

use crate::transport::{Address, ChatPresence, ConnectionEvent, DeviceIdentity, PairingEvent};

/// Protocol revision sent with `Hello`.
pub const PROTOCOL_VERSION: u32 = 1;

pub fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder().little_endian().new_codec()
}

pub fn encode<T: Serialize>(value: &T) -> Result<Bytes, rmp_serde::encode::Error> {
    rmp_serde::to_vec_named(value).map(Bytes::from)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, rmp_serde::decode::Error> {
    rmp_serde::from_slice(bytes)
}

// ============================================================================
// Gateway -> sidecar
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BridgeRequest {
    Hello {
        version: u32,
    },
    /// Allocate a fresh, unpaired device.
    NewDevice,
    /// Look up a stored device by exact address.
    ResolveDevice {
        address: Address,
    },
    ListDevices,
    DeleteDevice {
        address: Address,
    },
    /// Bind this stream to a device handle. Pushed frames for the device are
    /// delivered on the attached stream only.
    Attach {
        handle: String,
    },
    Connect,
    Disconnect,
    SendMessage {
        to: Address,
        text: String,
    },
    SendPresence {
        to: Address,
        presence: ChatPresence,
    },
    ResolveAlias {
        alias: Address,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: u64,
    pub request: BridgeRequest,
}

// ============================================================================
// Sidecar -> gateway
// ============================================================================

/// A device as the sidecar reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub handle: String,
    #[serde(default)]
    pub identity: DeviceIdentity,
    #[serde(default)]
    pub connected: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeReply {
    Ack,
    Device { device: DeviceInfo },
    MaybeDevice { device: Option<DeviceInfo> },
    Devices { addresses: Vec<Address> },
    MessageSent { message_id: String },
    Alias { address: Option<Address> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BridgeFrame {
    Response {
        id: u64,
        #[serde(default)]
        reply: Option<BridgeReply>,
        #[serde(default)]
        error: Option<String>,
    },
    Pairing {
        event: PairingEvent,
    },
    Event {
        event: ConnectionEvent,
    },
    /// The sidecar's view of the device identity changed.
    Identity {
        identity: DeviceIdentity,
    },
}

impl BridgeFrame {
    pub fn ok(id: u64, reply: BridgeReply) -> Self {
        BridgeFrame::Response {
            id,
            reply: Some(reply),
            error: None,
        }
    }

    pub fn err(id: u64, msg: impl Into<String>) -> Self {
        BridgeFrame::Response {
            id,
            reply: None,
            error: Some(msg.into()),
        }
    }
}
