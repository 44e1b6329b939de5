//! Session orchestrator
//!
//! Owns the live connection registry and drives every agent session through
//! its lifecycle:
//! - Pairing: listens on the pairing-code stream, renders codes, persists
//!   `waiting_scan` / `qr_timeout` and re-issues the handshake on timeout
//! - Events: one pump per live connection turns `connected`, `pair_success`,
//!   `logged_out` and inbound messages into durable state and replies
//! - Recovery: `reconnect_session` re-attaches an agent to its stored device
//!   (by address, then by phone, then a fresh device) with bounded retry
//!
//! Background tasks only mutate durable state and log; they never return
//! errors to a caller.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use courier_core::config::PairingConfig;
use courier_core::models::{
    AgentSession, Direction, MessageRecord, MessageStats, NewSession, SessionStatus,
};
use courier_core::render::CodeRenderer;
use courier_core::store::Stores;
use courier_core::transport::{
    ChatPresence, ConnectionEvent, ConnectionFactory, DeviceConnection, DeviceIdentity,
    InboundMessage, PairingEvent, TransportError,
};
use courier_core::CourierError;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio_retry::Retry;

use super::execution::{extract_reply, ExecutionProxy};
use super::mention::{self, MentionContext};
use super::registry::{ConnectionRegistry, Registration};

type Result<T> = std::result::Result<T, CourierError>;

/// Session plus message counters, for the detail view.
#[derive(Debug, Clone, Serialize)]
pub struct SessionDetail {
    pub session: AgentSession,
    pub stats: MessageStats,
}

pub struct SessionManager {
    stores: Stores,
    factory: Arc<dyn ConnectionFactory>,
    proxy: Arc<ExecutionProxy>,
    renderer: Arc<dyn CodeRenderer>,
    pairing: PairingConfig,
    registry: ConnectionRegistry,
}

impl SessionManager {
    pub fn new(
        stores: Stores,
        factory: Arc<dyn ConnectionFactory>,
        proxy: Arc<ExecutionProxy>,
        renderer: Arc<dyn CodeRenderer>,
        pairing: PairingConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            stores,
            factory,
            proxy,
            renderer,
            pairing,
            registry: ConnectionRegistry::new(),
        })
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn proxy(&self) -> &Arc<ExecutionProxy> {
        &self.proxy
    }

    // ========================================================================
    // Caller-invoked operations
    // ========================================================================

    /// Create a session, start pairing, and wait briefly for the first code.
    pub async fn create_session(
        self: &Arc<Self>,
        owner: &str,
        req: NewSession,
    ) -> Result<AgentSession> {
        let agent_id = req.agent_id.clone();
        if self.stores.sessions.get_by_agent(&agent_id).await?.is_some() {
            return Err(CourierError::AlreadyExists(agent_id));
        }

        let conn = self.factory.new_connection().await?;
        let session = AgentSession::new(owner, req);
        if let Err(e) = self.stores.sessions.create(&session).await {
            // A concurrent create may have won after the check above.
            conn.disconnect().await;
            return Err(e);
        }

        let conn = self.register(&agent_id, conn);
        let (first_code_tx, first_code_rx) = oneshot::channel();
        self.spawn_pairing_listener(&agent_id, &conn, Some(first_code_tx));

        if let Err(e) = conn.connect().await {
            tracing::error!(agent_id = %agent_id, error = %e, "Initial connect failed");
            if let Some(mut detached) = self.registry.remove(&agent_id) {
                detached.stop_tasks();
            }
            conn.disconnect().await;
            return Err(e.into());
        }

        if tokio::time::timeout(self.pairing.first_code_wait(), first_code_rx)
            .await
            .is_err()
        {
            tracing::debug!(agent_id = %agent_id, "No pairing code within the initial wait");
        }

        tracing::info!(agent_id = %agent_id, owner, "Session created");
        Ok(self.reread(&agent_id).await.unwrap_or(session))
    }

    /// Read a session, refreshing a stale pairing code in the background.
    pub async fn get_session(self: &Arc<Self>, agent_id: &str) -> Result<AgentSession> {
        let session = self
            .stores
            .sessions
            .get_by_agent(agent_id)
            .await?
            .ok_or_else(|| CourierError::NotFound(agent_id.to_string()))?;

        let stale_after = self.pairing.stale_code_after();
        if session.status.is_pairing()
            && session.pairing_code_is_stale(Utc::now(), stale_after)
            && self.registry.try_begin_refresh(agent_id, stale_after)
        {
            self.spawn_refresh(agent_id);
        }

        Ok(session)
    }

    /// Re-attach the agent to a device and make sure it is connected.
    pub async fn reconnect_session(self: &Arc<Self>, agent_id: &str) -> Result<AgentSession> {
        let session = self
            .stores
            .sessions
            .get_by_agent(agent_id)
            .await?
            .ok_or_else(|| CourierError::NotFound(agent_id.to_string()))?;

        let conn = match self.registry.get(agent_id) {
            Some(conn) => conn,
            None => {
                let candidate = self.resolve_connection(&session).await?;
                self.register(agent_id, candidate)
            }
        };

        let first_code = if conn.identity().is_paired() {
            None
        } else {
            let (tx, rx) = oneshot::channel();
            self.spawn_pairing_listener(agent_id, &conn, Some(tx));
            Some(rx)
        };

        if !conn.is_connected() {
            self.connect_with_retry(agent_id, &conn).await?;
        }

        if let Some(rx) = first_code {
            let _ = tokio::time::timeout(self.pairing.reconnect_code_wait(), rx).await;
        }

        tracing::info!(agent_id, "Session reconnected");
        Ok(self.reread(agent_id).await.unwrap_or(session))
    }

    /// Tear down the live connection and delete the durable record.
    pub async fn delete_session(&self, agent_id: &str) -> Result<()> {
        if let Some(mut detached) = self.registry.remove(agent_id) {
            detached.stop_tasks();
            let identity = detached.conn.identity();
            detached.conn.disconnect().await;

            match identity.address.filter(|a| !a.is_empty()) {
                Some(address) => match self.factory.delete_device(&address).await {
                    Ok(()) => tracing::info!(agent_id, device = %address, "Deleted paired device"),
                    Err(e) => {
                        tracing::warn!(agent_id, device = %address, error = %e, "Failed to delete paired device")
                    }
                },
                None => tracing::debug!(agent_id, "Device never paired, skipping device deletion"),
            }
        }
        self.registry.forget_refresh(agent_id);

        self.stores.sessions.delete(agent_id).await?;
        tracing::info!(agent_id, "Session deleted");
        Ok(())
    }

    /// Schedule a reconnect for every session that should be live. Returns the
    /// number scheduled.
    pub async fn initialize_sessions(self: &Arc<Self>) -> Result<usize> {
        let sessions = self.stores.sessions.list().await?;
        let mut scheduled = 0;

        for session in sessions.into_iter().filter(|s| s.status.should_restore()) {
            let this = Arc::clone(self);
            let agent_id = session.agent_id;
            tokio::spawn(async move {
                match this.reconnect_session(&agent_id).await {
                    Ok(s) => tracing::info!(agent_id = %agent_id, status = %s.status, "Session restored"),
                    Err(e) => tracing::warn!(agent_id = %agent_id, error = %e, "Session restore failed"),
                }
            });
            scheduled += 1;
        }

        tracing::info!(scheduled, "Session restoration scheduled");
        Ok(scheduled)
    }

    pub async fn session_detail(self: &Arc<Self>, agent_id: &str) -> Result<SessionDetail> {
        let session = self.get_session(agent_id).await?;
        let stats = self.message_stats(agent_id).await;
        Ok(SessionDetail { session, stats })
    }

    /// Incoming and answered message counts. A failed count reports 0.
    pub async fn message_stats(&self, agent_id: &str) -> MessageStats {
        MessageStats {
            incoming: self.count_messages(agent_id, Direction::Incoming).await,
            responded: self.count_messages(agent_id, Direction::Outgoing).await,
        }
    }

    async fn count_messages(&self, agent_id: &str, direction: Direction) -> i64 {
        match self
            .stores
            .messages
            .count_by_agent_and_direction(agent_id, direction)
            .await
        {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(agent_id, direction = direction.as_str(), error = %e, "Message count failed");
                0
            }
        }
    }

    // ========================================================================
    // Connection plumbing
    // ========================================================================

    /// Register `conn` for the agent. If another connection won the race it is
    /// returned instead and `conn` is dropped. The event pump is attached only
    /// for a fresh registration.
    fn register(
        self: &Arc<Self>,
        agent_id: &str,
        conn: Arc<dyn DeviceConnection>,
    ) -> Arc<dyn DeviceConnection> {
        match self.registry.insert_if_absent(agent_id, conn) {
            Registration::Inserted(conn) => {
                self.attach_event_pump(agent_id, &conn);
                conn
            }
            Registration::Existing(conn) => {
                tracing::debug!(agent_id, "Connection already registered, using it");
                conn
            }
        }
    }

    /// Stored device by address, else by phone, else a fresh device.
    async fn resolve_connection(&self, session: &AgentSession) -> Result<Arc<dyn DeviceConnection>> {
        let agent_id = session.agent_id.as_str();

        if let Some(address) = session.paired_address() {
            match self.factory.resolve_by_identifier(&address).await {
                Ok(Some(conn)) => {
                    tracing::info!(agent_id, device = %address, "Resolved device by stored address");
                    return Ok(conn);
                }
                Ok(None) => tracing::debug!(agent_id, device = %address, "Stored address unknown to device store"),
                Err(e) => tracing::warn!(agent_id, device = %address, error = %e, "Lookup by stored address failed"),
            }
        }

        if let Some(phone) = session.phone_number.as_deref().filter(|p| !p.is_empty()) {
            match self.factory.resolve_by_phone(phone).await {
                Ok(Some(conn)) => {
                    tracing::info!(agent_id, phone, "Resolved device by phone number");
                    return Ok(conn);
                }
                Ok(None) => tracing::debug!(agent_id, phone, "No stored device for phone number"),
                Err(e) => tracing::warn!(agent_id, phone, error = %e, "Lookup by phone number failed"),
            }
        }

        tracing::info!(agent_id, "No stored device, allocating a new one");
        Ok(self.factory.new_connection().await?)
    }

    /// Connect with linear backoff: `attempt * step` between attempts, no
    /// sleep after the last.
    async fn connect_with_retry(&self, agent_id: &str, conn: &Arc<dyn DeviceConnection>) -> Result<()> {
        let attempts = self.pairing.connect_attempts.max(1);
        let step = self.pairing.connect_backoff_step();
        let strategy = (1..attempts as u32).map(move |n| step * n);

        let mut attempt = 0usize;
        let result = Retry::spawn(strategy, || {
            attempt += 1;
            let n = attempt;
            let conn = Arc::clone(conn);
            async move {
                conn.connect().await.map_err(|e| {
                    tracing::warn!(agent_id, attempt = n, error = %e, "Connect attempt failed");
                    e
                })
            }
        })
        .await;

        result.map_err(|e: TransportError| {
            CourierError::Connection(format!(
                "failed to connect after {} attempts: {}",
                attempts, e
            ))
        })
    }

    fn spawn_refresh(self: &Arc<Self>, agent_id: &str) {
        let this = Arc::clone(self);
        let agent_id = agent_id.to_string();
        tokio::spawn(async move {
            match this.registry.get(&agent_id) {
                Some(conn) => {
                    tracing::info!(agent_id = %agent_id, "Refreshing stale pairing code");
                    if let Err(e) = conn.connect().await {
                        tracing::warn!(agent_id = %agent_id, error = %e, "Pairing refresh failed");
                    }
                }
                None => {
                    tracing::info!(agent_id = %agent_id, "No live connection for stale session, reconnecting");
                    if let Err(e) = this.reconnect_session(&agent_id).await {
                        tracing::warn!(agent_id = %agent_id, error = %e, "Pairing refresh reconnect failed");
                    }
                }
            }
        });
    }

    // ========================================================================
    // Pairing listener
    // ========================================================================

    /// Listen for pairing codes until the stream closes, the session is
    /// deleted, or the registry aborts the task.
    fn spawn_pairing_listener(
        self: &Arc<Self>,
        agent_id: &str,
        conn: &Arc<dyn DeviceConnection>,
        first_code: Option<oneshot::Sender<()>>,
    ) {
        // Subscribe before the caller connects so the first code is not missed.
        let mut codes = conn.pairing_events();
        let this = Arc::clone(self);
        let listener_conn = Arc::clone(conn);
        let agent = agent_id.to_string();

        let listener = tokio::spawn(async move {
            let mut first_code = first_code;
            while let Some(event) = codes.recv().await {
                match event {
                    PairingEvent::Code(code) => {
                        if !this.on_pairing_code(&agent, &code).await {
                            break;
                        }
                        if let Some(tx) = first_code.take() {
                            let _ = tx.send(());
                        }
                    }
                    PairingEvent::Timeout => {
                        if !this.on_pairing_timeout(&agent).await {
                            break;
                        }
                        let conn = Arc::clone(&listener_conn);
                        let agent = agent.clone();
                        tokio::spawn(async move {
                            if let Err(e) = conn.connect().await {
                                tracing::warn!(agent_id = %agent, error = %e, "Re-issuing handshake after timeout failed");
                            }
                        });
                    }
                }
            }
            tracing::debug!(agent_id = %agent, "Pairing listener stopped");
        });

        self.registry.set_listener(agent_id, conn, listener);
    }

    /// Returns false once the session record is gone.
    async fn on_pairing_code(&self, agent_id: &str, code: &str) -> bool {
        let image = match self.renderer.render(code) {
            Ok(image) => Some(image),
            Err(e) => {
                tracing::warn!(agent_id, error = %e, "Failed to render pairing code");
                None
            }
        };
        let code = code.to_string();
        let exists = self
            .update_logged(agent_id, "pairing code", move |s| {
                s.pairing_code = Some(code);
                s.pairing_code_image = image;
                s.status = SessionStatus::WaitingScan;
                s.last_pairing_code_issued_at = Some(Utc::now());
            })
            .await;
        if exists {
            tracing::info!(agent_id, "New pairing code issued");
        }
        exists
    }

    /// Returns false once the session record is gone.
    async fn on_pairing_timeout(&self, agent_id: &str) -> bool {
        let exists = self
            .update_logged(agent_id, "pairing timeout", |s| {
                s.clear_pairing_material();
                s.status = SessionStatus::QrTimeout;
            })
            .await;
        if exists {
            tracing::info!(agent_id, "Pairing code expired, re-issuing handshake");
        }
        exists
    }

    // ========================================================================
    // Event pump
    // ========================================================================

    fn attach_event_pump(self: &Arc<Self>, agent_id: &str, conn: &Arc<dyn DeviceConnection>) {
        let mut events = conn.events();
        let this = Arc::clone(self);
        let pump_conn = Arc::clone(conn);
        let agent = agent_id.to_string();

        let pump = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    ConnectionEvent::Connected => this.on_connected(&agent, &pump_conn).await,
                    ConnectionEvent::PairSuccess { identity } => {
                        this.on_pair_success(&agent, &identity).await
                    }
                    ConnectionEvent::LoggedOut => {
                        this.on_logged_out(&agent, &pump_conn).await;
                        break;
                    }
                    ConnectionEvent::Message(msg) => {
                        let this = Arc::clone(&this);
                        let conn = Arc::clone(&pump_conn);
                        let agent = agent.clone();
                        tokio::spawn(async move {
                            this.handle_message(&agent, conn, msg).await;
                        });
                    }
                }
            }
        });

        self.registry.set_pump(agent_id, conn, pump);
    }

    async fn on_connected(&self, agent_id: &str, conn: &Arc<dyn DeviceConnection>) {
        let identity = conn.identity();
        self.update_logged(agent_id, "connected", move |s| {
            s.status = SessionStatus::Connected;
            s.connected_at = Some(Utc::now());
            s.clear_pairing_material();
            if s.phone_number.is_none() {
                s.phone_number = identity.phone().map(str::to_string);
            }
            if s.paired_address().is_none() {
                if let Some(address) = identity.address.as_ref().filter(|a| !a.is_empty()) {
                    s.set_paired_address(address);
                }
            }
        })
        .await;
        self.registry.forget_refresh(agent_id);
        tracing::info!(agent_id, "Connected");
    }

    async fn on_pair_success(&self, agent_id: &str, identity: &DeviceIdentity) {
        let Some(address) = identity.address.clone().filter(|a| !a.is_empty()) else {
            tracing::warn!(agent_id, "Pair success without a device address");
            return;
        };
        self.update_logged(agent_id, "pair success", move |s| {
            s.phone_number = Some(address.user.clone());
            s.set_paired_address(&address);
        })
        .await;
        tracing::info!(agent_id, "Device paired");
    }

    async fn on_logged_out(&self, agent_id: &str, conn: &Arc<dyn DeviceConnection>) {
        self.update_logged(agent_id, "logged out", |s| {
            s.status = SessionStatus::Disconnected;
            s.disconnected_at = Some(Utc::now());
        })
        .await;
        if !self.registry.remove_if_same(agent_id, conn) {
            tracing::debug!(agent_id, "Logged-out connection was already replaced");
        }
        tracing::info!(agent_id, "Logged out");
    }

    // ========================================================================
    // Inbound message dispatch
    // ========================================================================

    async fn handle_message(
        self: Arc<Self>,
        agent_id: &str,
        conn: Arc<dyn DeviceConnection>,
        msg: InboundMessage,
    ) {
        if msg.is_from_me {
            return;
        }
        let Some(text) = msg.content.text().map(str::to_string) else {
            return;
        };

        let session = match self.stores.sessions.get_by_agent(agent_id).await {
            Ok(Some(session)) => session,
            Ok(None) => {
                tracing::warn!(agent_id, message_id = %msg.id, "Message for unknown session dropped");
                return;
            }
            Err(e) => {
                tracing::error!(agent_id, error = %e, "Session lookup failed, message dropped");
                return;
            }
        };

        let identity = conn.identity();
        let own_phone = identity
            .phone()
            .map(str::to_string)
            .or_else(|| session.phone_number.clone());

        let incoming = MessageRecord::incoming(
            session.id,
            agent_id,
            &msg.id,
            &msg.sender.user,
            own_phone.as_deref(),
            &text,
        );
        if let Err(e) = self.stores.messages.create(&incoming).await {
            tracing::warn!(agent_id, error = %e, "Failed to record incoming message");
        }

        if msg.is_group || msg.chat.is_group() {
            let ctx = self
                .mention_context(agent_id, &conn, &session, &identity, own_phone, &msg, &text)
                .await;
            match mention::resolve(&ctx) {
                Some(reason) => tracing::debug!(agent_id, ?reason, "Group message addressed to agent"),
                None => {
                    tracing::debug!(agent_id, chat = %msg.chat, "Group message not addressed to agent");
                    return;
                }
            }
        }

        if let Err(e) = conn.send_presence(&msg.chat, ChatPresence::Composing).await {
            tracing::debug!(agent_id, error = %e, "Failed to send composing presence");
        }
        let result = self
            .proxy
            .execute(agent_id, &text, Some(&msg.sender.user), None)
            .await;
        if let Err(e) = conn.send_presence(&msg.chat, ChatPresence::Paused).await {
            tracing::debug!(agent_id, error = %e, "Failed to send paused presence");
        }

        let record = match result {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(agent_id, error = %e, "Agent execution failed, no reply sent");
                return;
            }
        };
        let Some(reply) = extract_reply(&record) else {
            tracing::debug!(agent_id, execution_id = %record.id, "Agent returned no reply");
            return;
        };

        match conn.send_message(&msg.chat, &reply).await {
            Ok(message_id) => {
                let outgoing = MessageRecord::outgoing(
                    session.id,
                    agent_id,
                    &message_id,
                    identity.phone(),
                    &msg.chat.to_string(),
                    &reply,
                );
                if let Err(e) = self.stores.messages.create(&outgoing).await {
                    tracing::warn!(agent_id, error = %e, "Failed to record outgoing message");
                }
                tracing::info!(agent_id, chat = %msg.chat, "Reply sent");
            }
            Err(e) => tracing::warn!(agent_id, chat = %msg.chat, error = %e, "Failed to send reply"),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn mention_context(
        &self,
        agent_id: &str,
        conn: &Arc<dyn DeviceConnection>,
        session: &AgentSession,
        identity: &DeviceIdentity,
        own_phone: Option<String>,
        msg: &InboundMessage,
        text: &str,
    ) -> MentionContext {
        let mut ctx = MentionContext {
            own_phone,
            own_alias: identity.alias.clone(),
            display_name: identity
                .push_name
                .clone()
                .filter(|n| !n.trim().is_empty())
                .or_else(|| session.display_name.clone()),
            text: text.to_string(),
            mentioned: MentionContext::parse_mentions(msg.content.mentioned()),
            resolved_aliases: HashMap::new(),
        };

        for alias in ctx.aliases_to_resolve() {
            match conn.resolve_alias(&alias).await {
                Ok(Some(primary)) => {
                    ctx.resolved_aliases.insert(alias, primary);
                }
                Ok(None) => tracing::debug!(agent_id, alias = %alias, "Alias not in directory"),
                Err(e) => {
                    tracing::warn!(agent_id, alias = %alias, error = %e, "Alias lookup failed, treating as no match")
                }
            }
        }
        ctx
    }

    // ========================================================================
    // Durable state helpers
    // ========================================================================

    async fn reread(&self, agent_id: &str) -> Option<AgentSession> {
        match self.stores.sessions.get_by_agent(agent_id).await {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!(agent_id, error = %e, "Re-read of session failed, using snapshot");
                None
            }
        }
    }

    /// Re-read the record, apply `f`, write it back. `Ok(None)` if the session
    /// no longer exists.
    async fn mutate_session<F>(&self, agent_id: &str, f: F) -> Result<Option<AgentSession>>
    where
        F: FnOnce(&mut AgentSession),
    {
        let Some(mut session) = self.stores.sessions.get_by_agent(agent_id).await? else {
            return Ok(None);
        };
        f(&mut session);
        self.stores.sessions.update(&session).await?;
        Ok(Some(session))
    }

    /// Apply `f` and log failures. Returns false only if the session no
    /// longer exists.
    async fn update_logged<F>(&self, agent_id: &str, what: &str, f: F) -> bool
    where
        F: FnOnce(&mut AgentSession),
    {
        match self.mutate_session(agent_id, f).await {
            Ok(Some(_)) => true,
            Ok(None) => {
                tracing::debug!(agent_id, what, "Session gone, update skipped");
                false
            }
            Err(e) => {
                tracing::error!(agent_id, what, error = %e, "Failed to persist session update");
                true
            }
        }
    }
}
