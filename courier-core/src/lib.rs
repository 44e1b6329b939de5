pub mod agent_client;
pub mod config;
pub mod db;
pub mod error;
pub mod ipc;
pub mod models;
pub mod render;
pub mod store;
pub mod transport;

pub use agent_client::{
    build_execute_url, AgentBackend, AgentClientError, BackendCall, BackendResponse,
    HttpAgentClient,
};
pub use config::CourierConfig;
pub use error::CourierError;
pub use render::{CodeRenderer, QrPngRenderer, RenderError};
pub use store::{ExecutionStore, MessageStore, SessionStore, Stores, UserStore};
pub use transport::{
    Address, ConnectionEvent, ConnectionFactory, DeviceConnection, DeviceIdentity, PairingEvent,
    TransportError,
};
