//! Locator discovery service
//!
//! A lightly-stateful bootstrap oracle, reachable independently of the live
//! membership protocol. It caches the highest-view-id view it has ever been
//! told about and answers `GetView` so joiners and recovering members can
//! find the current coordinator even when the process they last knew as
//! coordinator is gone. The locator never mutates a view; a caller holding
//! an older view than the locator's answer can self-detect that it is stale.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

use crate::error::{MembershipError, MembershipResult, TransportError, WireError};
use crate::identity::{MemberComparator, MemberIdentifier};
use crate::messages::{Envelope, ProtocolMessage};
use crate::view::MembershipView;

/// Passive cache of the newest view observed from any source.
#[derive(Default)]
pub struct Locator {
    latest: RwLock<Option<MembershipView>>,
}

impl Locator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Record a reported view, keeping whichever has the highest view id.
    pub fn record_view(&self, view: MembershipView) {
        let mut latest = self.latest.write();
        match latest.as_ref() {
            Some(current) if current.view_id() >= view.view_id() => {}
            _ => {
                debug!(view = %view, "locator recorded newer view");
                *latest = Some(view);
            }
        }
    }

    /// The highest-view-id view seen so far.
    pub fn get_view(&self) -> Option<MembershipView> {
        self.latest.read().clone()
    }

    /// Convenience for joiners: the coordinator of the newest known view.
    pub fn coordinator(&self, comparator: &dyn MemberComparator) -> Option<MemberIdentifier> {
        self.latest
            .read()
            .as_ref()
            .and_then(|v| v.coordinator_of(comparator).cloned())
    }
}

/// TCP endpoint serving a [`Locator`] cache.
pub struct LocatorServer {
    locator: Arc<Locator>,
    bound: SocketAddr,
}

impl LocatorServer {
    /// Bind and start answering `GetView` requests. Members also push
    /// `View` reports at this endpoint to keep the cache fresh.
    pub async fn bind(locator: Arc<Locator>, addr: SocketAddr) -> MembershipResult<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TransportError::Bind {
                addr: addr.to_string(),
                reason: e.to_string(),
            })?;
        let bound = listener.local_addr().map_err(|e| TransportError::Bind {
            addr: addr.to_string(),
            reason: e.to_string(),
        })?;

        // Identity stamped on locator replies; locators are not members
        let identity = MemberIdentifier::new(crate::identity::MemberData::new(
            bound.ip().to_string(),
            bound.port(),
        ));

        let cache = Arc::clone(&locator);
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let cache = Arc::clone(&cache);
                        let identity = identity.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(stream, cache, identity).await {
                                debug!(peer = %peer, error = %e, "locator connection closed");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "locator accept failed, stopping");
                        break;
                    }
                }
            }
        });

        Ok(Self { locator, bound })
    }

    pub fn address(&self) -> SocketAddr {
        self.bound
    }

    pub fn locator(&self) -> &Arc<Locator> {
        &self.locator
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    cache: Arc<Locator>,
    identity: MemberIdentifier,
) -> std::io::Result<()> {
    loop {
        let envelope = match read_locator_frame(&mut stream).await? {
            Some(envelope) => envelope,
            None => return Ok(()),
        };
        match envelope.payload {
            ProtocolMessage::GetView => {
                let latest = cache.get_view();
                let latest_id = latest
                    .as_ref()
                    .map(|v| v.view_id())
                    .unwrap_or_default();
                let response = Envelope::new(
                    identity.clone(),
                    // Carry the highest view id we have seen so a stale
                    // caller can self-detect during a split
                    latest_id,
                    0,
                    ProtocolMessage::GetViewResponse { view: latest },
                );
                let frame = response
                    .encode(MAX_LOCATOR_FRAME)
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
                stream.write_all(&frame).await?;
                stream.flush().await?;
            }
            ProtocolMessage::View { view } => {
                cache.record_view(view);
            }
            other => {
                debug!(kind = other.kind(), "locator ignoring message");
            }
        }
    }
}

const MAX_LOCATOR_FRAME: usize = 4 * 1024 * 1024;

async fn read_locator_frame(stream: &mut TcpStream) -> std::io::Result<Option<Envelope>> {
    let mut len_bytes = [0u8; 4];
    match stream.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_LOCATOR_FRAME {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "locator frame too large",
        ));
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Envelope::decode(&body)
        .map(Some)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

/// One-shot client query against a locator endpoint.
pub async fn locator_get_view(
    addr: SocketAddr,
    requester: MemberIdentifier,
    timeout: Duration,
) -> MembershipResult<Option<MembershipView>> {
    let result = tokio::time::timeout(timeout, async {
        let mut stream = TcpStream::connect(addr)
            .await
            .map_err(|e| TransportError::ConnectionFailed {
                target: addr.to_string(),
                reason: e.to_string(),
            })?;
        let request = Envelope::new(
            requester,
            crate::view::ViewId::initial(),
            0,
            ProtocolMessage::GetView,
        );
        let frame = request.encode(MAX_LOCATOR_FRAME)?;
        stream
            .write_all(&frame)
            .await
            .map_err(|e| TransportError::SendFailed {
                target: addr.to_string(),
                reason: e.to_string(),
            })?;

        let envelope = read_locator_frame(&mut stream)
            .await
            .map_err(|e| WireError::Decode(e.to_string()))?
            .ok_or(TransportError::Closed)?;
        match envelope.payload {
            ProtocolMessage::GetViewResponse { view } => Ok(view),
            other => Err(MembershipError::DiscoveryFailed(format!(
                "unexpected locator reply: {}",
                other.kind()
            ))),
        }
    })
    .await;

    match result {
        Ok(inner) => inner,
        Err(_) => Err(MembershipError::DiscoveryFailed(format!(
            "locator {} timed out",
            addr
        ))),
    }
}

/// Push an installed view at a locator endpoint, best effort.
pub async fn locator_report_view(
    addr: SocketAddr,
    reporter: MemberIdentifier,
    view: MembershipView,
    timeout: Duration,
) -> MembershipResult<()> {
    let result = tokio::time::timeout(timeout, async {
        let mut stream = TcpStream::connect(addr)
            .await
            .map_err(|e| TransportError::ConnectionFailed {
                target: addr.to_string(),
                reason: e.to_string(),
            })?;
        let view_id = view.view_id();
        let report = Envelope::new(reporter, view_id, 0, ProtocolMessage::View { view });
        let frame = report.encode(MAX_LOCATOR_FRAME)?;
        stream
            .write_all(&frame)
            .await
            .map_err(|e| TransportError::SendFailed {
                target: addr.to_string(),
                reason: e.to_string(),
            })?;
        stream.flush().await.map_err(|e| TransportError::SendFailed {
            target: addr.to_string(),
            reason: e.to_string(),
        })?;
        Ok(())
    })
    .await;

    match result {
        Ok(inner) => inner,
        Err(_) => Err(MembershipError::DiscoveryFailed(format!(
            "locator {} timed out",
            addr
        ))),
    }
}

/// How a process discovers the newest view and reports installs.
///
/// Production deployments point at TCP locators ([`LocatorSet`]); embedded
/// and test clusters can share a [`Locator`] cache directly.
#[async_trait::async_trait]
pub trait ViewDiscovery: Send + Sync {
    /// Highest-view-id view known to the discovery source.
    async fn latest_view(
        &self,
        requester: &MemberIdentifier,
    ) -> MembershipResult<Option<MembershipView>>;

    /// Report an installed view, best effort.
    async fn report_view(&self, reporter: &MemberIdentifier, view: &MembershipView);
}

#[async_trait::async_trait]
impl ViewDiscovery for Locator {
    async fn latest_view(
        &self,
        _requester: &MemberIdentifier,
    ) -> MembershipResult<Option<MembershipView>> {
        Ok(self.get_view())
    }

    async fn report_view(&self, _reporter: &MemberIdentifier, view: &MembershipView) {
        self.record_view(view.clone());
    }
}

/// A set of TCP locator endpoints queried in turn.
pub struct LocatorSet {
    pub addrs: Vec<SocketAddr>,
    pub timeout: Duration,
}

#[async_trait::async_trait]
impl ViewDiscovery for LocatorSet {
    async fn latest_view(
        &self,
        requester: &MemberIdentifier,
    ) -> MembershipResult<Option<MembershipView>> {
        let mut best: Option<MembershipView> = None;
        let mut last_error = None;
        for addr in &self.addrs {
            match locator_get_view(*addr, requester.clone(), self.timeout).await {
                Ok(Some(view)) => {
                    if best
                        .as_ref()
                        .map(|b| view.view_id() > b.view_id())
                        .unwrap_or(true)
                    {
                        best = Some(view);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    debug!(locator = %addr, error = %e, "locator query failed");
                    last_error = Some(e);
                }
            }
        }
        match (best, last_error) {
            (Some(view), _) => Ok(Some(view)),
            (None, Some(e)) => Err(e),
            (None, _) => Ok(None),
        }
    }

    async fn report_view(&self, reporter: &MemberIdentifier, view: &MembershipView) {
        for addr in &self.addrs {
            if let Err(e) =
                locator_report_view(*addr, reporter.clone(), view.clone(), self.timeout).await
            {
                debug!(locator = %addr, error = %e, "view report failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{LexicographicComparator, MemberData};

    fn member(host: &str) -> MemberIdentifier {
        MemberIdentifier::new(MemberData::new(host, 9000))
    }

    #[test]
    fn test_cache_keeps_highest_view() {
        let locator = Locator::new();
        let a = member("a");
        let b = member("b");
        let cmp = LexicographicComparator;

        let v0 = MembershipView::initial(a.clone());
        let v1 = v0.with_member_added(b, a.clone(), &cmp);

        locator.record_view(v1.clone());
        // An older view arriving late never wins
        locator.record_view(v0);
        assert_eq!(locator.get_view().unwrap().view_id(), v1.view_id());
    }

    #[test]
    fn test_coordinator_lookup() {
        let locator = Locator::new();
        let cmp = LexicographicComparator;
        let a = member("a");
        let b = member("b");
        let view = MembershipView::initial(b.clone()).with_member_added(a.clone(), b, &cmp);
        locator.record_view(view);
        assert_eq!(locator.coordinator(&cmp), Some(a));
    }

    #[tokio::test]
    async fn test_server_round_trip() {
        let locator = Locator::new();
        let a = member("a");
        locator.record_view(MembershipView::initial(a.clone()));

        let server = LocatorServer::bind(locator, "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();

        let view = locator_get_view(server.address(), member("joiner"), Duration::from_secs(2))
            .await
            .unwrap()
            .unwrap();
        assert!(view.contains(&a));
    }

    #[tokio::test]
    async fn test_empty_cache_returns_none() {
        let server = LocatorServer::bind(Locator::new(), "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let view = locator_get_view(server.address(), member("joiner"), Duration::from_secs(2))
            .await
            .unwrap();
        assert!(view.is_none());
    }

    #[tokio::test]
    async fn test_reported_views_update_cache() {
        let locator = Locator::new();
        let server = LocatorServer::bind(Arc::clone(&locator), "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();

        let a = member("a");
        let view = MembershipView::initial(a.clone());
        locator_report_view(server.address(), a.clone(), view, Duration::from_secs(2))
            .await
            .unwrap();

        // The report is one-way; poll briefly for the cache to pick it up
        for _ in 0..50 {
            if locator.get_view().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(locator.get_view().unwrap().contains(&a));
    }
}
