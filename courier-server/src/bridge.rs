//! Unix-socket bridge to the messaging-protocol sidecar
//!
//! Frames are 4-byte little-endian length prefixed MessagePack (see
//! `courier_core::ipc`). Factory calls open a short-lived stream per request.
//! Each `BridgeConnection` owns one stream bound to a device handle with
//! `attach`; a reader task correlates responses by request id and turns pushed
//! frames into pairing codes and connection events.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use courier_core::ipc::{
    self, BridgeFrame, BridgeReply, BridgeRequest, DeviceInfo, RequestFrame, PROTOCOL_VERSION,
};
use courier_core::transport::{
    Address, ChatPresence, ConnectionEvent, ConnectionFactory, DeviceConnection, DeviceIdentity,
    PairingEvent, TransportError,
};
use futures::{SinkExt, StreamExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, FramedRead, FramedWrite, LengthDelimitedCodec};

type Reply = Result<BridgeReply, String>;

fn protocol_error(e: impl std::fmt::Display) -> TransportError {
    TransportError::Protocol(e.to_string())
}

fn unexpected(reply: BridgeReply) -> TransportError {
    TransportError::Protocol(format!("unexpected reply: {:?}", reply))
}

// ============================================================================
// Factory
// ============================================================================

#[derive(Debug, Clone)]
pub struct BridgeFactory {
    socket_path: PathBuf,
    request_timeout: Duration,
}

impl BridgeFactory {
    pub fn new(socket_path: impl AsRef<Path>, request_timeout: Duration) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            request_timeout,
        }
    }

    /// Check that the sidecar is reachable and speaks our protocol revision.
    pub async fn hello(&self) -> Result<(), TransportError> {
        match self
            .oneshot(BridgeRequest::Hello {
                version: PROTOCOL_VERSION,
            })
            .await?
        {
            BridgeReply::Ack => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// One request on a fresh stream.
    async fn oneshot(&self, request: BridgeRequest) -> Result<BridgeReply, TransportError> {
        tokio::time::timeout(self.request_timeout, self.exchange(request))
            .await
            .map_err(|_| TransportError::Timeout(self.request_timeout.as_secs()))?
    }

    async fn exchange(&self, request: BridgeRequest) -> Result<BridgeReply, TransportError> {
        let stream = UnixStream::connect(&self.socket_path).await?;
        let mut framed = Framed::new(stream, ipc::codec());
        let frame = RequestFrame { id: 1, request };
        framed.send(ipc::encode(&frame).map_err(protocol_error)?).await?;

        while let Some(bytes) = framed.next().await {
            let bytes = bytes?;
            match ipc::decode::<BridgeFrame>(&bytes).map_err(protocol_error)? {
                BridgeFrame::Response { id: 1, reply, error } => {
                    return response_to_reply(reply, error);
                }
                other => tracing::trace!(?other, "Ignoring frame on request stream"),
            }
        }
        Err(TransportError::Closed)
    }

    async fn open(&self, device: DeviceInfo) -> Result<Arc<dyn DeviceConnection>, TransportError> {
        let conn = BridgeConnection::attach(&self.socket_path, self.request_timeout, device).await?;
        Ok(Arc::new(conn))
    }
}

fn response_to_reply(
    reply: Option<BridgeReply>,
    error: Option<String>,
) -> Result<BridgeReply, TransportError> {
    match (reply, error) {
        (_, Some(error)) => Err(TransportError::Rejected(error)),
        (Some(reply), None) => Ok(reply),
        (None, None) => Ok(BridgeReply::Ack),
    }
}

#[async_trait]
impl ConnectionFactory for BridgeFactory {
    async fn new_connection(&self) -> Result<Arc<dyn DeviceConnection>, TransportError> {
        match self.oneshot(BridgeRequest::NewDevice).await? {
            BridgeReply::Device { device } => self.open(device).await,
            other => Err(unexpected(other)),
        }
    }

    async fn resolve_by_identifier(
        &self,
        address: &Address,
    ) -> Result<Option<Arc<dyn DeviceConnection>>, TransportError> {
        let reply = self
            .oneshot(BridgeRequest::ResolveDevice {
                address: address.clone(),
            })
            .await?;
        match reply {
            BridgeReply::MaybeDevice { device: Some(device) } | BridgeReply::Device { device } => {
                self.open(device).await.map(Some)
            }
            BridgeReply::MaybeDevice { device: None } => Ok(None),
            other => Err(unexpected(other)),
        }
    }

    async fn list_devices(&self) -> Result<Vec<Address>, TransportError> {
        match self.oneshot(BridgeRequest::ListDevices).await? {
            BridgeReply::Devices { addresses } => Ok(addresses),
            other => Err(unexpected(other)),
        }
    }

    async fn delete_device(&self, address: &Address) -> Result<(), TransportError> {
        match self
            .oneshot(BridgeRequest::DeleteDevice {
                address: address.clone(),
            })
            .await?
        {
            BridgeReply::Ack => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}

// ============================================================================
// Connection
// ============================================================================

/// State shared between a connection and its reader task.
#[derive(Default)]
struct Shared {
    pending: Mutex<HashMap<u64, oneshot::Sender<Reply>>>,
    identity: Mutex<DeviceIdentity>,
    connected: AtomicBool,
    pairing_tx: Mutex<Option<mpsc::UnboundedSender<PairingEvent>>>,
    events_tx: Mutex<Option<mpsc::UnboundedSender<ConnectionEvent>>>,
}

impl Shared {
    fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
        m.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn dispatch(&self, frame: BridgeFrame) {
        match frame {
            BridgeFrame::Response { id, reply, error } => {
                let waiter = Self::lock(&self.pending).remove(&id);
                match waiter {
                    Some(tx) => {
                        let result = match (reply, error) {
                            (_, Some(error)) => Err(error),
                            (reply, None) => Ok(reply.unwrap_or(BridgeReply::Ack)),
                        };
                        let _ = tx.send(result);
                    }
                    None => tracing::debug!(id, "Response for unknown request id"),
                }
            }
            BridgeFrame::Pairing { event } => {
                if let Some(tx) = Self::lock(&self.pairing_tx).as_ref() {
                    let _ = tx.send(event);
                }
            }
            BridgeFrame::Identity { identity } => {
                *Self::lock(&self.identity) = identity;
            }
            BridgeFrame::Event { event } => {
                match &event {
                    ConnectionEvent::Connected => self.connected.store(true, Ordering::SeqCst),
                    ConnectionEvent::LoggedOut => self.connected.store(false, Ordering::SeqCst),
                    ConnectionEvent::PairSuccess { identity } => {
                        *Self::lock(&self.identity) = identity.clone();
                    }
                    ConnectionEvent::Message(_) => {}
                }
                if let Some(tx) = Self::lock(&self.events_tx).as_ref() {
                    let _ = tx.send(event);
                }
            }
        }
    }

    /// The stream is gone: fail waiters and close subscriber streams.
    fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        Self::lock(&self.pending).clear();
        Self::lock(&self.pairing_tx).take();
        Self::lock(&self.events_tx).take();
    }
}

pub struct BridgeConnection {
    handle: String,
    shared: Arc<Shared>,
    writer: tokio::sync::Mutex<FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>>,
    next_id: AtomicU64,
    request_timeout: Duration,
    reader: JoinHandle<()>,
}

impl BridgeConnection {
    /// Open a stream and bind it to `device`.
    pub async fn attach(
        socket_path: &Path,
        request_timeout: Duration,
        device: DeviceInfo,
    ) -> Result<Self, TransportError> {
        let stream = UnixStream::connect(socket_path).await?;
        let (read, write) = stream.into_split();

        let shared = Arc::new(Shared {
            identity: Mutex::new(device.identity),
            connected: AtomicBool::new(device.connected),
            ..Default::default()
        });
        let reader = tokio::spawn(read_loop(
            FramedRead::new(read, ipc::codec()),
            Arc::clone(&shared),
            device.handle.clone(),
        ));

        let conn = Self {
            handle: device.handle,
            shared,
            writer: tokio::sync::Mutex::new(FramedWrite::new(write, ipc::codec())),
            next_id: AtomicU64::new(1),
            request_timeout,
            reader,
        };

        match conn
            .request(BridgeRequest::Attach {
                handle: conn.handle.clone(),
            })
            .await?
        {
            BridgeReply::Ack => {}
            other => return Err(unexpected(other)),
        }
        tracing::debug!(handle = %conn.handle, "Attached to bridge device");
        Ok(conn)
    }

    async fn request(&self, request: BridgeRequest) -> Result<BridgeReply, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        Shared::lock(&self.shared.pending).insert(id, tx);

        let bytes = ipc::encode(&RequestFrame { id, request }).map_err(protocol_error)?;
        if let Err(e) = self.writer.lock().await.send(bytes).await {
            Shared::lock(&self.shared.pending).remove(&id);
            return Err(e.into());
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Err(_) => {
                Shared::lock(&self.shared.pending).remove(&id);
                Err(TransportError::Timeout(self.request_timeout.as_secs()))
            }
            Ok(Err(_)) => Err(TransportError::Closed),
            Ok(Ok(Err(message))) => Err(TransportError::Rejected(message)),
            Ok(Ok(Ok(reply))) => Ok(reply),
        }
    }

    async fn expect_ack(&self, request: BridgeRequest) -> Result<(), TransportError> {
        match self.request(request).await? {
            BridgeReply::Ack => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}

async fn read_loop(
    mut frames: FramedRead<OwnedReadHalf, LengthDelimitedCodec>,
    shared: Arc<Shared>,
    handle: String,
) {
    while let Some(frame) = frames.next().await {
        match frame {
            Ok(bytes) => match ipc::decode::<BridgeFrame>(&bytes) {
                Ok(frame) => shared.dispatch(frame),
                Err(e) => tracing::warn!(handle = %handle, error = %e, "Undecodable bridge frame skipped"),
            },
            Err(e) => {
                tracing::error!(handle = %handle, error = %e, "Bridge frame error");
                break;
            }
        }
    }
    tracing::debug!(handle = %handle, "Bridge stream closed");
    shared.close();
}

impl Drop for BridgeConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[async_trait]
impl DeviceConnection for BridgeConnection {
    async fn connect(&self) -> Result<(), TransportError> {
        self.expect_ack(BridgeRequest::Connect).await
    }

    async fn disconnect(&self) {
        if let Err(e) = self.expect_ack(BridgeRequest::Disconnect).await {
            tracing::debug!(handle = %self.handle, error = %e, "Disconnect request failed");
        }
        self.shared.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    fn identity(&self) -> DeviceIdentity {
        Shared::lock(&self.shared.identity).clone()
    }

    async fn send_message(&self, to: &Address, text: &str) -> Result<String, TransportError> {
        match self
            .request(BridgeRequest::SendMessage {
                to: to.clone(),
                text: text.to_string(),
            })
            .await?
        {
            BridgeReply::MessageSent { message_id } => Ok(message_id),
            other => Err(unexpected(other)),
        }
    }

    async fn send_presence(&self, to: &Address, presence: ChatPresence) -> Result<(), TransportError> {
        self.expect_ack(BridgeRequest::SendPresence {
            to: to.clone(),
            presence,
        })
        .await
    }

    async fn resolve_alias(&self, alias: &Address) -> Result<Option<Address>, TransportError> {
        match self
            .request(BridgeRequest::ResolveAlias {
                alias: alias.clone(),
            })
            .await?
        {
            BridgeReply::Alias { address } => Ok(address),
            other => Err(unexpected(other)),
        }
    }

    fn pairing_events(&self) -> mpsc::UnboundedReceiver<PairingEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *Shared::lock(&self.shared.pairing_tx) = Some(tx);
        rx
    }

    fn events(&self) -> mpsc::UnboundedReceiver<ConnectionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *Shared::lock(&self.shared.events_tx) = Some(tx);
        rx
    }
}
