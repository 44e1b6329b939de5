//! Shared fakes for the courier-server integration tests.
//!
//! `FakeConnection` records what the orchestrator does to it and lets a test
//! push pairing codes and connection events as if they came from the network.
//! `FakeFactory` hands out fakes and plays the device store.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use courier_core::agent_client::{AgentBackend, AgentClientError, BackendCall, BackendResponse};
use courier_core::config::{AgentBackendConfig, PairingConfig};
use courier_core::models::{AgentSession, NewSession, SessionStatus};
use courier_core::render::QrPngRenderer;
use courier_core::store::Stores;
use courier_core::transport::{
    Address, ChatPresence, ConnectionEvent, ConnectionFactory, DeviceConnection, DeviceIdentity,
    PairingEvent, TransportError,
};
use courier_server::subsystems::execution::ExecutionProxy;
use courier_server::subsystems::sessions::SessionManager;
use tokio::sync::mpsc;
use tokio::time::Instant;

// ============================================================================
// FakeConnection
// ============================================================================

#[derive(Default)]
pub struct FakeConnection {
    pub connects: AtomicUsize,
    pub disconnects: AtomicUsize,
    /// Remaining connect calls that fail.
    fail_connects: AtomicUsize,
    connected: AtomicBool,
    /// Emitted on the pairing stream by the next successful connect.
    code_on_connect: Mutex<Option<String>>,
    pub connect_times: Mutex<Vec<Instant>>,
    identity: Mutex<DeviceIdentity>,
    pairing_tx: Mutex<Option<mpsc::UnboundedSender<PairingEvent>>>,
    events_tx: Mutex<Option<mpsc::UnboundedSender<ConnectionEvent>>>,
    pub sent: Mutex<Vec<(Address, String)>>,
    pub presences: Mutex<Vec<ChatPresence>>,
    pub aliases: Mutex<HashMap<Address, Address>>,
}

impl FakeConnection {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A device that is already paired to `address`.
    pub fn paired(address: Address) -> Arc<Self> {
        let conn = Self::default();
        conn.set_identity(DeviceIdentity {
            address: Some(address),
            ..Default::default()
        });
        Arc::new(conn)
    }

    pub fn fail_next_connects(&self, n: usize) {
        self.fail_connects.store(n, Ordering::SeqCst);
    }

    pub fn code_on_next_connect(&self, code: &str) {
        *self.code_on_connect.lock().unwrap() = Some(code.to_string());
    }

    pub fn set_identity(&self, identity: DeviceIdentity) {
        *self.identity.lock().unwrap() = identity;
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn push_pairing(&self, event: PairingEvent) -> bool {
        match self.pairing_tx.lock().unwrap().as_ref() {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    pub fn push_event(&self, event: ConnectionEvent) -> bool {
        match self.events_tx.lock().unwrap().as_ref() {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl DeviceConnection for FakeConnection {
    async fn connect(&self) -> Result<(), TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.connect_times.lock().unwrap().push(Instant::now());

        let remaining = self.fail_connects.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_connects.store(remaining - 1, Ordering::SeqCst);
            return Err(TransportError::Rejected("network unreachable".to_string()));
        }

        if let Some(code) = self.code_on_connect.lock().unwrap().take() {
            self.push_pairing(PairingEvent::Code(code));
        }
        Ok(())
    }

    async fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn identity(&self) -> DeviceIdentity {
        self.identity.lock().unwrap().clone()
    }

    async fn send_message(&self, to: &Address, text: &str) -> Result<String, TransportError> {
        let mut sent = self.sent.lock().unwrap();
        sent.push((to.clone(), text.to_string()));
        Ok(format!("OUT-{}", sent.len()))
    }

    async fn send_presence(&self, _to: &Address, presence: ChatPresence) -> Result<(), TransportError> {
        self.presences.lock().unwrap().push(presence);
        Ok(())
    }

    async fn resolve_alias(&self, alias: &Address) -> Result<Option<Address>, TransportError> {
        Ok(self.aliases.lock().unwrap().get(alias).cloned())
    }

    fn pairing_events(&self) -> mpsc::UnboundedReceiver<PairingEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.pairing_tx.lock().unwrap() = Some(tx);
        rx
    }

    fn events(&self) -> mpsc::UnboundedReceiver<ConnectionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.events_tx.lock().unwrap() = Some(tx);
        rx
    }
}

// ============================================================================
// FakeFactory
// ============================================================================

#[derive(Default)]
pub struct FakeFactory {
    pub new_calls: AtomicUsize,
    /// Handed out by `new_connection` before falling back to a fresh fake.
    queued: Mutex<VecDeque<Arc<FakeConnection>>>,
    pub handed_out: Mutex<Vec<Arc<FakeConnection>>>,
    stored: Mutex<HashMap<Address, Arc<FakeConnection>>>,
    pub deleted: Mutex<Vec<Address>>,
}

impl FakeFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn queue(&self, conn: Arc<FakeConnection>) {
        self.queued.lock().unwrap().push_back(conn);
    }

    pub fn store_device(&self, address: Address, conn: Arc<FakeConnection>) {
        self.stored.lock().unwrap().insert(address, conn);
    }

    pub fn new_count(&self) -> usize {
        self.new_calls.load(Ordering::SeqCst)
    }

    pub fn last(&self) -> Arc<FakeConnection> {
        self.handed_out
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no connection handed out")
    }
}

#[async_trait]
impl ConnectionFactory for FakeFactory {
    async fn new_connection(&self) -> Result<Arc<dyn DeviceConnection>, TransportError> {
        self.new_calls.fetch_add(1, Ordering::SeqCst);
        let conn = self
            .queued
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(FakeConnection::new);
        self.handed_out.lock().unwrap().push(conn.clone());
        Ok(conn)
    }

    async fn resolve_by_identifier(
        &self,
        address: &Address,
    ) -> Result<Option<Arc<dyn DeviceConnection>>, TransportError> {
        let conn = self.stored.lock().unwrap().get(address).cloned();
        Ok(conn.map(|c| {
            self.handed_out.lock().unwrap().push(c.clone());
            c as Arc<dyn DeviceConnection>
        }))
    }

    async fn list_devices(&self) -> Result<Vec<Address>, TransportError> {
        Ok(self.stored.lock().unwrap().keys().cloned().collect())
    }

    async fn delete_device(&self, address: &Address) -> Result<(), TransportError> {
        self.deleted.lock().unwrap().push(address.clone());
        self.stored.lock().unwrap().remove(address);
        Ok(())
    }
}

// ============================================================================
// Backends
// ============================================================================

/// Backend for tests that never route a message to an agent.
pub struct OfflineBackend;

#[async_trait]
impl AgentBackend for OfflineBackend {
    async fn execute(&self, call: &BackendCall) -> Result<BackendResponse, AgentClientError> {
        Err(AgentClientError::InvalidUrl(call.base_url.clone()))
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub stores: Stores,
    pub factory: Arc<FakeFactory>,
    pub manager: Arc<SessionManager>,
}

pub fn test_pairing() -> PairingConfig {
    PairingConfig {
        first_code_wait_seconds: 15,
        reconnect_code_wait_seconds: 2,
        stale_code_seconds: 50,
        connect_attempts: 5,
        connect_backoff_seconds: 2,
    }
}

pub fn harness(backend: Arc<dyn AgentBackend>) -> Harness {
    harness_with(backend, test_pairing(), AgentBackendConfig::default())
}

pub fn harness_with(
    backend: Arc<dyn AgentBackend>,
    pairing: PairingConfig,
    agent_backend: AgentBackendConfig,
) -> Harness {
    harness_on(Stores::memory(), backend, pairing, agent_backend)
}

/// Harness over caller-supplied stores.
pub fn harness_on(
    stores: Stores,
    backend: Arc<dyn AgentBackend>,
    pairing: PairingConfig,
    agent_backend: AgentBackendConfig,
) -> Harness {
    let factory = FakeFactory::new();
    let proxy = Arc::new(ExecutionProxy::new(
        stores.sessions.clone(),
        stores.executions.clone(),
        backend,
        agent_backend,
    ));
    let manager = SessionManager::new(
        stores.clone(),
        factory.clone(),
        proxy,
        Arc::new(QrPngRenderer),
        pairing,
    );
    Harness {
        stores,
        factory,
        manager,
    }
}

pub fn new_session(agent_id: &str) -> NewSession {
    NewSession {
        agent_id: agent_id.to_string(),
        display_name: Some("Helper Bot".to_string()),
        backend_api_key: Some("agent-key".to_string()),
        backend_url: None,
    }
}

/// Insert a session record directly, bypassing the orchestrator.
pub async fn seed(stores: &Stores, agent_id: &str, status: SessionStatus) -> AgentSession {
    let mut session = AgentSession::new("admin", new_session(agent_id));
    session.status = status;
    stores.sessions.create(&session).await.unwrap();
    session
}

pub async fn status_of(stores: &Stores, agent_id: &str) -> Option<SessionStatus> {
    stores
        .sessions
        .get_by_agent(agent_id)
        .await
        .unwrap()
        .map(|s| s.status)
}

/// Poll `check` until it holds, giving background tasks a chance to run.
pub async fn wait_until<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
