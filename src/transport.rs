//! Messenger: point-to-point delivery between member addresses
//!
//! Guarantees per sender-recipient pair: FIFO delivery, duplicate discard by
//! sequence number, and view-aware filtering of stale traffic. Delivery to
//! an unreachable recipient fails loudly to the caller; retry policy always
//! belongs to the caller so join/leave stay idempotent and re-driveable.
//!
//! Two implementations: [`TcpMessenger`] frames envelopes over TCP with a
//! u32 length prefix, and [`InProcessMessenger`] runs whole clusters inside
//! one process for tests and embedding.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::TransportConfig;
use crate::error::{MembershipResult, TransportError};
use crate::identity::MemberIdentifier;
use crate::messages::{Envelope, ProtocolMessage};
use crate::view::ViewId;

/// Shared stamp of the locally installed view id.
///
/// Written by the service on every install, read by the messenger when
/// stamping outbound envelopes and by the receive filter when judging
/// staleness.
#[derive(Debug, Default)]
pub struct ViewStamp(AtomicU64);

impl ViewStamp {
    pub fn new() -> Arc<Self> {
        Arc::new(Self(AtomicU64::new(0)))
    }

    pub fn current(&self) -> ViewId {
        ViewId(self.0.load(Ordering::Acquire))
    }

    /// Record an installed view. Never moves backwards.
    pub fn advance(&self, view_id: ViewId) {
        self.0.fetch_max(view_id.0, Ordering::AcqRel);
    }
}

/// Point-to-point reliable, ordered delivery between member addresses.
#[async_trait]
pub trait Messenger: Send + Sync {
    fn local_identity(&self) -> &MemberIdentifier;

    /// Deliver one message to `target`. Failure is surfaced, not retried.
    async fn send(
        &self,
        target: &MemberIdentifier,
        message: ProtocolMessage,
    ) -> MembershipResult<()>;
}

/// Per-sender duplicate and staleness filtering at the delivery point.
#[derive(Debug)]
pub struct ReceiveFilter {
    view_stamp: Arc<ViewStamp>,
    stale_view_tolerance: u64,
    last_sequence: HashMap<MemberIdentifier, u64>,
}

impl ReceiveFilter {
    pub fn new(view_stamp: Arc<ViewStamp>, stale_view_tolerance: u64) -> Self {
        Self {
            view_stamp,
            stale_view_tolerance,
            last_sequence: HashMap::new(),
        }
    }

    /// Returns `true` if the envelope should be delivered. Duplicates and
    /// stale envelopes are dropped idempotently and logged, never errored.
    pub fn admit(&mut self, envelope: &Envelope) -> bool {
        if let Some(&last) = self.last_sequence.get(&envelope.sender) {
            if envelope.sequence <= last {
                debug!(
                    sender = %envelope.sender,
                    sequence = envelope.sequence,
                    kind = envelope.payload.kind(),
                    "dropping duplicate envelope"
                );
                return false;
            }
        }

        if !envelope.payload.is_bootstrap() {
            let installed = self.view_stamp.current();
            let lag = envelope.view_id_at_send.lag_behind(installed);
            if lag > self.stale_view_tolerance {
                debug!(
                    sender = %envelope.sender,
                    sent_at = %envelope.view_id_at_send,
                    installed = %installed,
                    kind = envelope.payload.kind(),
                    "dropping stale envelope"
                );
                return false;
            }
        }

        self.last_sequence
            .insert(envelope.sender.clone(), envelope.sequence);
        true
    }

    /// Forget a departed sender so a re-joined process starts fresh.
    pub fn forget(&mut self, sender: &MemberIdentifier) {
        self.last_sequence.remove(sender);
    }
}

/// Inbound side of a messenger: raw envelopes plus the filter that guards
/// them. `recv` only yields envelopes that pass the filter.
pub struct Inbound {
    rx: mpsc::Receiver<Envelope>,
    filter: ReceiveFilter,
}

impl Inbound {
    pub fn new(rx: mpsc::Receiver<Envelope>, filter: ReceiveFilter) -> Self {
        Self { rx, filter }
    }

    pub async fn recv(&mut self) -> Option<Envelope> {
        while let Some(envelope) = self.rx.recv().await {
            if self.filter.admit(&envelope) {
                return Some(envelope);
            }
        }
        None
    }

    pub fn filter_mut(&mut self) -> &mut ReceiveFilter {
        &mut self.filter
    }
}

// ---------------------------------------------------------------------------
// TCP messenger
// ---------------------------------------------------------------------------

type FrameSender = mpsc::Sender<Vec<u8>>;

/// TCP transport: one outbound connection per target, established on demand,
/// length-prefixed bincode frames.
pub struct TcpMessenger {
    local: MemberIdentifier,
    config: TransportConfig,
    view_stamp: Arc<ViewStamp>,
    sequence: AtomicU64,
    connections: tokio::sync::Mutex<HashMap<MemberIdentifier, FrameSender>>,
    inbound_tx: mpsc::Sender<Envelope>,
}

impl TcpMessenger {
    /// Bind the listener and start the accept loop. The identity is
    /// finalized from the actually bound port (so port 0 works), and is
    /// returned alongside the messenger and the inbound envelope stream.
    pub async fn bind(
        mut data: crate::identity::MemberData,
        config: TransportConfig,
        view_stamp: Arc<ViewStamp>,
        stale_view_tolerance: u64,
    ) -> MembershipResult<(Arc<Self>, Inbound, MemberIdentifier)> {
        let listener =
            TcpListener::bind(config.bind_address)
                .await
                .map_err(|e| TransportError::Bind {
                    addr: config.bind_address.to_string(),
                    reason: e.to_string(),
                })?;
        let bound: SocketAddr = listener.local_addr().map_err(|e| TransportError::Bind {
            addr: config.bind_address.to_string(),
            reason: e.to_string(),
        })?;
        data.port = bound.port();
        let local = MemberIdentifier::new(data);

        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_buffer);
        let filter = ReceiveFilter::new(Arc::clone(&view_stamp), stale_view_tolerance);

        let messenger = Arc::new(Self {
            local: local.clone(),
            config: config.clone(),
            view_stamp,
            sequence: AtomicU64::new(0),
            connections: tokio::sync::Mutex::new(HashMap::new()),
            inbound_tx: inbound_tx.clone(),
        });

        let max_frame = config.max_frame_size;
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let tx = inbound_tx.clone();
                        tokio::spawn(async move {
                            if let Err(e) = read_frames(stream, tx, max_frame).await {
                                debug!(peer = %peer, error = %e, "inbound connection closed");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed, stopping listener");
                        break;
                    }
                }
            }
        });

        Ok((messenger, Inbound::new(inbound_rx, filter), local))
    }

    async fn writer_for(&self, target: &MemberIdentifier) -> MembershipResult<FrameSender> {
        let mut connections = self.connections.lock().await;
        if let Some(tx) = connections.get(target) {
            if !tx.is_closed() {
                return Ok(tx.clone());
            }
            connections.remove(target);
        }

        let addr = format!("{}:{}", target.host(), target.port());
        let stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| TransportError::ConnectionFailed {
                target: addr.clone(),
                reason: "connect timeout".into(),
            })?
            .map_err(|e| TransportError::ConnectionFailed {
                target: addr.clone(),
                reason: e.to_string(),
            })?;

        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(64);
        tokio::spawn(async move {
            let mut stream = stream;
            while let Some(frame) = rx.recv().await {
                if stream.write_all(&frame).await.is_err() {
                    break;
                }
                if stream.flush().await.is_err() {
                    break;
                }
            }
        });

        connections.insert(target.clone(), tx.clone());
        Ok(tx)
    }

    /// Drop the cached connection to a departed member.
    pub async fn disconnect(&self, target: &MemberIdentifier) {
        self.connections.lock().await.remove(target);
    }
}

#[async_trait]
impl Messenger for TcpMessenger {
    fn local_identity(&self) -> &MemberIdentifier {
        &self.local
    }

    async fn send(
        &self,
        target: &MemberIdentifier,
        message: ProtocolMessage,
    ) -> MembershipResult<()> {
        let envelope = Envelope::new(
            self.local.clone(),
            self.view_stamp.current(),
            self.sequence.fetch_add(1, Ordering::AcqRel),
            message,
        );
        let frame = envelope.encode(self.config.max_frame_size)?;

        let tx = self.writer_for(target).await?;
        tx.send(frame).await.map_err(|_| {
            TransportError::SendFailed {
                target: target.to_string(),
                reason: "connection closed".into(),
            }
        })?;
        Ok(())
    }
}

async fn read_frames(
    mut stream: TcpStream,
    inbound: mpsc::Sender<Envelope>,
    max_frame_size: usize,
) -> std::io::Result<()> {
    let mut buffer = BytesMut::new();
    loop {
        let mut len_bytes = [0u8; 4];
        match stream.read_exact(&mut len_bytes).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        }
        let len = u32::from_be_bytes(len_bytes) as usize;
        if len > max_frame_size {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("frame of {} bytes exceeds limit", len),
            ));
        }
        buffer.clear();
        buffer.resize(len, 0);
        stream.read_exact(&mut buffer).await?;

        match Envelope::decode(&buffer) {
            Ok(envelope) => {
                if inbound.send(envelope).await.is_err() {
                    return Ok(());
                }
            }
            Err(e) => {
                // Incompatible versions are rejected, not crashed on
                warn!(error = %e, "rejecting undecodable frame");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// In-process messenger
// ---------------------------------------------------------------------------

struct NetworkInner {
    endpoints: HashMap<MemberIdentifier, mpsc::Sender<Envelope>>,
    /// Members cut off to simulate crashes and partitions
    disconnected: HashSet<MemberIdentifier>,
    /// Pairs (a, b) that cannot reach each other, to simulate partitions
    severed: HashSet<(MemberIdentifier, MemberIdentifier)>,
}

/// Channel-backed fabric connecting [`InProcessMessenger`] endpoints.
#[derive(Clone)]
pub struct InProcessNetwork {
    inner: Arc<parking_lot::Mutex<NetworkInner>>,
}

impl InProcessNetwork {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(parking_lot::Mutex::new(NetworkInner {
                endpoints: HashMap::new(),
                disconnected: HashSet::new(),
                severed: HashSet::new(),
            })),
        }
    }

    /// Attach a member to the fabric.
    pub fn register(
        &self,
        identity: MemberIdentifier,
        view_stamp: Arc<ViewStamp>,
        stale_view_tolerance: u64,
        buffer: usize,
    ) -> (Arc<InProcessMessenger>, Inbound) {
        let (tx, rx) = mpsc::channel(buffer);
        self.inner
            .lock()
            .endpoints
            .insert(identity.clone(), tx);
        let filter = ReceiveFilter::new(Arc::clone(&view_stamp), stale_view_tolerance);
        let messenger = Arc::new(InProcessMessenger {
            local: identity,
            network: self.clone(),
            view_stamp,
            sequence: AtomicU64::new(0),
        });
        (messenger, Inbound::new(rx, filter))
    }

    /// Simulate a crash: the member neither receives nor sends.
    pub fn disconnect(&self, member: &MemberIdentifier) {
        self.inner.lock().disconnected.insert(member.clone());
    }

    pub fn reconnect(&self, member: &MemberIdentifier) {
        self.inner.lock().disconnected.remove(member);
    }

    /// Simulate a partition: traffic between `a` and `b` fails both ways.
    pub fn sever(&self, a: &MemberIdentifier, b: &MemberIdentifier) {
        let mut inner = self.inner.lock();
        inner.severed.insert((a.clone(), b.clone()));
        inner.severed.insert((b.clone(), a.clone()));
    }

    pub fn heal(&self, a: &MemberIdentifier, b: &MemberIdentifier) {
        let mut inner = self.inner.lock();
        inner.severed.remove(&(a.clone(), b.clone()));
        inner.severed.remove(&(b.clone(), a.clone()));
    }

    fn route(&self, from: &MemberIdentifier, to: &MemberIdentifier) -> Result<mpsc::Sender<Envelope>, TransportError> {
        let inner = self.inner.lock();
        if inner.disconnected.contains(from) || inner.disconnected.contains(to) {
            return Err(TransportError::SendFailed {
                target: to.to_string(),
                reason: "endpoint disconnected".into(),
            });
        }
        if inner.severed.contains(&(from.clone(), to.clone())) {
            return Err(TransportError::SendFailed {
                target: to.to_string(),
                reason: "link severed".into(),
            });
        }
        inner
            .endpoints
            .get(to)
            .cloned()
            .ok_or_else(|| TransportError::UnknownRecipient {
                target: to.to_string(),
            })
    }
}

impl Default for InProcessNetwork {
    fn default() -> Self {
        Self::new()
    }
}

/// Messenger endpoint on an [`InProcessNetwork`].
pub struct InProcessMessenger {
    local: MemberIdentifier,
    network: InProcessNetwork,
    view_stamp: Arc<ViewStamp>,
    sequence: AtomicU64,
}

#[async_trait]
impl Messenger for InProcessMessenger {
    fn local_identity(&self) -> &MemberIdentifier {
        &self.local
    }

    async fn send(
        &self,
        target: &MemberIdentifier,
        message: ProtocolMessage,
    ) -> MembershipResult<()> {
        let envelope = Envelope::new(
            self.local.clone(),
            self.view_stamp.current(),
            self.sequence.fetch_add(1, Ordering::AcqRel),
            message,
        );
        let tx = self.network.route(&self.local, target)?;
        tx.send(envelope)
            .await
            .map_err(|_| TransportError::SendFailed {
                target: target.to_string(),
                reason: "endpoint dropped".into(),
            })?;
        Ok(())
    }
}
