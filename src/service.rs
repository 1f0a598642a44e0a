//! Membership service facade
//!
//! Binds the messenger, failure detector, coordinator and health monitor
//! into the per-process membership endpoint. Collaborators (storage,
//! rebalancing, transactions) subscribe to view-change events and query the
//! cached view; they never touch the protocol directly. The cached view is
//! replaced wholesale on each install and reads never wait on the
//! coordinator's queue.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::config::MembershipConfig;
use crate::coordinator::{Coordinator, CoordinatorHandle, SuspicionOutcome, ViewChangeRequest};
use crate::detector::{FailureDetector, FinalChecker, Suspicion};
use crate::error::{MembershipError, MembershipResult};
use crate::health::{HealthMonitor, HealthVerdict, LossAction};
use crate::identity::{MemberComparator, MemberIdentifier};
use crate::locator::ViewDiscovery;
use crate::messages::{Envelope, JoinOutcome, ProtocolMessage};
use crate::transport::{Inbound, Messenger, ViewStamp};
use crate::view::{MembershipView, ViewDelta};

/// Notification delivered to collaborators on every installed view.
#[derive(Debug, Clone)]
pub struct ViewChangeEvent {
    pub old: Option<Arc<MembershipView>>,
    pub new: Arc<MembershipView>,
    pub delta: ViewDelta,
}

struct ServiceState {
    current: RwLock<Option<Arc<MembershipView>>>,
    coordinator: Mutex<Option<CoordinatorHandle>>,
    /// Coordinator the in-flight join was sent to, with its reply slot;
    /// responses from anyone else are superseded-attempt stragglers
    pending_join: Mutex<Option<(MemberIdentifier, oneshot::Sender<JoinOutcome>)>>,
    /// Suspects with a resolution already in flight; duplicate reports
    /// are dropped instead of queuing redundant final checks
    inflight_suspicions: Mutex<HashSet<MemberIdentifier>>,
    reconnect_rx: Mutex<Option<mpsc::Receiver<()>>>,
    stopped: AtomicBool,
}

/// Per-process membership endpoint.
pub struct MembershipService {
    local: MemberIdentifier,
    config: MembershipConfig,
    comparator: Arc<dyn MemberComparator>,
    messenger: Arc<dyn Messenger>,
    discovery: Arc<dyn ViewDiscovery>,
    view_stamp: Arc<ViewStamp>,
    detector: Arc<FailureDetector>,
    final_checker: Arc<FinalChecker>,
    health: Arc<HealthMonitor>,
    events: broadcast::Sender<ViewChangeEvent>,
    reconnect_tx: mpsc::Sender<()>,
    state: ServiceState,
    shutdown_tx: watch::Sender<bool>,
}

impl MembershipService {
    /// Assemble a service around an already-bound messenger. `start` must be
    /// called with the matching inbound stream and escalation receiver.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local: MemberIdentifier,
        config: MembershipConfig,
        comparator: Arc<dyn MemberComparator>,
        messenger: Arc<dyn Messenger>,
        discovery: Arc<dyn ViewDiscovery>,
        view_stamp: Arc<ViewStamp>,
        health: HealthMonitor,
    ) -> (Arc<Self>, mpsc::Receiver<Suspicion>) {
        let (detector, escalations) = FailureDetector::new(
            local.clone(),
            config.detector.clone(),
            Arc::clone(&messenger),
        );
        let final_checker = FinalChecker::new(Arc::clone(&messenger), config.detector.clone());
        let (events, _) = broadcast::channel(64);
        let (reconnect_tx, reconnect_rx) = mpsc::channel(1);
        let (shutdown_tx, _) = watch::channel(false);

        let service = Arc::new(Self {
            local,
            config,
            comparator,
            messenger,
            discovery,
            view_stamp,
            detector,
            final_checker,
            health: Arc::new(health),
            events,
            reconnect_tx,
            state: ServiceState {
                current: RwLock::new(None),
                coordinator: Mutex::new(None),
                pending_join: Mutex::new(None),
                inflight_suspicions: Mutex::new(HashSet::new()),
                reconnect_rx: Mutex::new(Some(reconnect_rx)),
                stopped: AtomicBool::new(false),
            },
            shutdown_tx,
        });
        (service, escalations)
    }

    /// Start the background tasks: inbound dispatch, the probe cycle, and
    /// escalation routing.
    pub fn start(
        self: &Arc<Self>,
        mut inbound: Inbound,
        mut escalations: mpsc::Receiver<Suspicion>,
    ) {
        let dispatch = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    envelope = inbound.recv() => match envelope {
                        Some(envelope) => dispatch.dispatch(envelope).await,
                        None => break,
                    },
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        let detector = Arc::clone(&self.detector);
        tokio::spawn(detector.run(self.shutdown_tx.subscribe()));

        let router = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    suspicion = escalations.recv() => match suspicion {
                        Some(suspicion) => router.route_suspicion(suspicion).await,
                        None => break,
                    },
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        // Quorum-loss rejoins run here, signalled by `install`, so the
        // install path never awaits `join` itself
        if let Some(mut reconnects) = self.state.reconnect_rx.lock().take() {
            let rejoiner = Arc::clone(self);
            let mut shutdown = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        signal = reconnects.recv() => match signal {
                            Some(()) => {
                                if let Err(e) = rejoiner.join().await {
                                    warn!(error = %e, "reconnect after quorum loss failed");
                                }
                            }
                            None => break,
                        },
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    }

    /// Found a fresh cluster with the local process as sole member and
    /// coordinator: view 0.
    pub async fn bootstrap(self: &Arc<Self>) -> MembershipResult<Arc<MembershipView>> {
        self.ensure_running()?;
        let view = MembershipView::initial(self.local.clone());
        info!(view = %view, "bootstrapping new cluster");
        self.install(view).await;
        self.current_view()
            .ok_or(MembershipError::ServiceStopped)
    }

    /// Join an existing cluster: discover the newest view through the
    /// configured discovery source, target the comparator-first member as
    /// coordinator, and retry with jittered backoff against freshly
    /// discovered coordinators on timeout.
    pub async fn join(self: &Arc<Self>) -> MembershipResult<Arc<MembershipView>> {
        self.ensure_running()?;
        let mut last_seen: Option<crate::view::ViewId> = None;

        for attempt in 0..self.config.join.join_attempts {
            if attempt > 0 {
                let base = self.config.join.retry_backoff;
                let jitter = rand::thread_rng().gen_range(0..=base.as_millis() as u64);
                tokio::time::sleep(base + Duration::from_millis(jitter)).await;
            }

            let known = match self.discovery.latest_view(&self.local).await {
                Ok(view) => view,
                Err(e) => {
                    debug!(attempt, error = %e, "discovery attempt failed");
                    continue;
                }
            };
            let known = match known {
                Some(view) => view,
                None => {
                    // The bootstrapper may not have reported yet; retry
                    debug!(attempt, "no view known to discovery yet");
                    continue;
                }
            };
            last_seen = Some(known.view_id());

            // Idempotent reconciliation: a previous attempt may have
            // completed after we timed out
            if known.contains(&self.local) {
                info!(view = %known, "already admitted, adopting discovered view");
                self.install(known).await;
                return self
                    .current_view()
                    .ok_or(MembershipError::ServiceStopped);
            }

            let coordinator = match known.coordinator_of(self.comparator.as_ref()) {
                Some(c) => c.clone(),
                None => continue,
            };

            let (tx, rx) = oneshot::channel();
            *self.state.pending_join.lock() = Some((coordinator.clone(), tx));

            debug!(attempt, coordinator = %coordinator, "sending join request");
            if let Err(e) = self
                .messenger
                .send(
                    &coordinator,
                    ProtocolMessage::JoinRequest {
                        candidate: self.local.clone(),
                    },
                )
                .await
            {
                debug!(coordinator = %coordinator, error = %e, "join send failed");
                continue;
            }

            match tokio::time::timeout(self.config.join.join_timeout, rx).await {
                Ok(Ok(JoinOutcome::Accepted { view })) => {
                    self.install(view).await;
                    return self
                        .current_view()
                        .ok_or(MembershipError::ServiceStopped);
                }
                Ok(Ok(JoinOutcome::Rejected { reason })) => {
                    return Err(MembershipError::JoinRejected(reason));
                }
                Ok(Err(_)) | Err(_) => {
                    // Abandon this attempt and re-discover; a late
                    // acceptance is reconciled via the locator on the next
                    // pass
                    debug!(attempt, coordinator = %coordinator, "join attempt timed out");
                    self.state.pending_join.lock().take();
                }
            }
        }

        match last_seen {
            Some(view_id) => Err(MembershipError::ViewInstallTimeout(view_id.next())),
            None => Err(MembershipError::DiscoveryFailed(
                "no locator has observed a view; bootstrap a cluster first".into(),
            )),
        }
    }

    /// Voluntary departure. Idempotent; safe to call when already absent.
    pub async fn leave(self: &Arc<Self>) -> MembershipResult<()> {
        let handle = self.state.coordinator.lock().clone();
        if let Some(handle) = handle {
            // We are the coordinator: produce the view without us, then
            // stand down. The comparator-next survivor takes over and
            // re-broadcasts.
            handle
                .request(ViewChangeRequest::Leave {
                    member: self.local.clone(),
                })
                .await?;
        } else if let Some(view) = self.current_view() {
            if let Some(coordinator) = view.coordinator_of(self.comparator.as_ref()) {
                self.messenger
                    .send(
                        coordinator,
                        ProtocolMessage::Leave {
                            member: self.local.clone(),
                        },
                    )
                    .await?;
            }
        }
        self.stop();
        Ok(())
    }

    /// Stop background processing. The cached view stays readable.
    pub fn stop(&self) {
        if !self.state.stopped.swap(true, Ordering::AcqRel) {
            info!(member = %self.local, "membership service stopping");
            self.state.coordinator.lock().take();
            let _ = self.shutdown_tx.send(true);
        }
    }

    // -- collaborator-facing queries -------------------------------------

    pub fn local_identity(&self) -> &MemberIdentifier {
        &self.local
    }

    /// The most recently installed view; never blocks on the coordinator.
    pub fn current_view(&self) -> Option<Arc<MembershipView>> {
        self.state.current.read().clone()
    }

    pub fn is_member(&self, member: &MemberIdentifier) -> bool {
        self.current_view()
            .map(|v| v.contains(member))
            .unwrap_or(false)
    }

    pub fn current_coordinator(&self) -> Option<MemberIdentifier> {
        self.current_view()
            .and_then(|v| v.coordinator_of(self.comparator.as_ref()).cloned())
    }

    pub fn is_coordinator(&self) -> bool {
        self.current_coordinator()
            .map(|c| c == self.local)
            .unwrap_or(false)
    }

    /// Whether quorum loss has put the process in degraded read-only mode.
    pub fn is_degraded(&self) -> bool {
        self.health.is_degraded()
    }

    pub fn is_stopped(&self) -> bool {
        self.state.stopped.load(Ordering::Acquire)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ViewChangeEvent> {
        self.events.subscribe()
    }

    /// The current view rendered as JSON, for consoles and debug surfaces.
    pub fn dump_view(&self) -> Option<String> {
        self.current_view()
            .and_then(|v| serde_json::to_string_pretty(v.as_ref()).ok())
    }

    // -- internals -------------------------------------------------------

    fn ensure_running(&self) -> MembershipResult<()> {
        if self.is_stopped() {
            Err(MembershipError::ServiceStopped)
        } else {
            Ok(())
        }
    }

    async fn dispatch(self: &Arc<Self>, envelope: Envelope) {
        // Any traffic from a member is evidence of liveness
        self.detector.record_evidence(&envelope.sender);

        match envelope.payload {
            ProtocolMessage::JoinRequest { candidate } => {
                let handle = self.state.coordinator.lock().clone();
                match handle {
                    Some(handle) => {
                        // The coordinator replies to the candidate itself;
                        // resolution is serialized behind its queue. Spawned
                        // so the dispatch loop keeps draining while the
                        // request resolves.
                        tokio::spawn(async move {
                            let _ = handle
                                .request(ViewChangeRequest::Join { candidate })
                                .await;
                        });
                    }
                    None => {
                        debug!(
                            candidate = %candidate,
                            "join request received while not coordinator, ignoring"
                        );
                    }
                }
            }
            ProtocolMessage::JoinResponse(outcome) => {
                // Only the coordinator the in-flight attempt targeted may
                // resolve it; stragglers from abandoned attempts are noise
                let mut slot = self.state.pending_join.lock();
                match slot.as_ref() {
                    Some((coordinator, _)) if *coordinator == envelope.sender => {
                        if let Some((_, waiter)) = slot.take() {
                            let _ = waiter.send(outcome);
                        }
                    }
                    Some(_) => {
                        debug!(
                            sender = %envelope.sender,
                            "dropping join response from a superseded attempt"
                        );
                    }
                    None => {}
                }
            }
            ProtocolMessage::Leave { member } => {
                let handle = self.state.coordinator.lock().clone();
                if let Some(handle) = handle {
                    tokio::spawn(async move {
                        let _ = handle.request(ViewChangeRequest::Leave { member }).await;
                    });
                }
            }
            ProtocolMessage::View { view } => {
                self.install(view).await;
            }
            ProtocolMessage::Suspect { suspect, reporter } => {
                if suspect == self.local {
                    // Defend ourselves: answer with liveness evidence
                    let _ = self
                        .messenger
                        .send(
                            &reporter,
                            ProtocolMessage::FinalCheckResult {
                                target: self.local.clone(),
                                alive: true,
                            },
                        )
                        .await;
                    return;
                }
                self.detector.note_remote_suspicion(&suspect);
                let suspicion = Suspicion {
                    suspect,
                    reporter,
                    view_id: self.view_stamp.current(),
                    raised_at: std::time::SystemTime::now(),
                };
                // Resolution runs a final check that is answered back
                // through this very dispatch loop, so it must not block it
                let service = Arc::clone(self);
                tokio::spawn(async move {
                    service.route_suspicion(suspicion).await;
                });
            }
            ProtocolMessage::FinalCheckRequest { target } => {
                let alive = target == self.local;
                let _ = self
                    .messenger
                    .send(
                        &envelope.sender,
                        ProtocolMessage::FinalCheckResult { target, alive },
                    )
                    .await;
            }
            ProtocolMessage::FinalCheckResult { target, alive } => {
                if alive {
                    self.detector.record_evidence(&target);
                }
                self.final_checker.resolve(&target, alive);
            }
            ProtocolMessage::GetView => {
                let view = self.current_view().map(|v| (*v).clone());
                let _ = self
                    .messenger
                    .send(&envelope.sender, ProtocolMessage::GetViewResponse { view })
                    .await;
            }
            ProtocolMessage::GetViewResponse { view } => {
                if let Some(view) = view {
                    // Recovery path: adopt if newer, ignored otherwise
                    self.install(view).await;
                }
            }
            ProtocolMessage::Ping { nonce } => {
                let _ = self
                    .messenger
                    .send(&envelope.sender, ProtocolMessage::Pong { nonce })
                    .await;
            }
            ProtocolMessage::Pong { nonce } => {
                self.detector.handle_pong(nonce);
            }
        }
    }

    /// Install a view: monotonic check, wholesale swap of the cached copy,
    /// role management, listener fan-out, locator reporting and quorum
    /// re-evaluation.
    async fn install(self: &Arc<Self>, view: MembershipView) {
        let new = Arc::new(view);
        let old = {
            let mut current = self.state.current.write();
            if let Some(existing) = current.as_ref() {
                if new.view_id() <= existing.view_id() {
                    debug!(
                        incoming = %new.view_id(),
                        installed = %existing.view_id(),
                        "ignoring non-increasing view"
                    );
                    return;
                }
            }
            let old = current.take();
            *current = Some(Arc::clone(&new));
            old
        };

        self.view_stamp.advance(new.view_id());
        self.detector.update_targets(&new);

        let delta = match old.as_ref() {
            Some(old) => new.delta_from(old, self.comparator.as_ref()),
            None => ViewDelta {
                added: new.members().to_vec(),
                removed: Vec::new(),
                coordinator_changed: true,
            },
        };
        info!(view = %new, added = delta.added.len(), removed = delta.removed.len(), "view installed");

        if !new.contains(&self.local) {
            if old.as_ref().map(|o| o.contains(&self.local)).unwrap_or(false) {
                warn!(view = %new, "expelled from the cluster by this view");
            }
            // An expelled process must not keep minting views on a lineage
            // that has moved on without it
            if self.state.coordinator.lock().take().is_some() {
                info!(view = %new, "relinquishing coordinator role after expulsion");
            }
        } else {
            self.manage_coordinator_role(&new);
        }

        let _ = self.events.send(ViewChangeEvent {
            old,
            new: Arc::clone(&new),
            delta,
        });

        // Keep locators current, best effort
        let discovery = Arc::clone(&self.discovery);
        let reporter = self.local.clone();
        let report = Arc::clone(&new);
        tokio::spawn(async move {
            discovery.report_view(&reporter, report.as_ref()).await;
        });

        match self.health.evaluate(&new) {
            HealthVerdict::Healthy => {}
            HealthVerdict::QuorumLost(LossAction::Shutdown) => {
                self.stop();
            }
            HealthVerdict::QuorumLost(LossAction::Degrade) => {
                // Flag already set by the monitor; collaborators observe it
            }
            HealthVerdict::QuorumLost(LossAction::Reconnect) => {
                // Full slot means a rejoin is already pending
                let _ = self.reconnect_tx.try_send(());
            }
        }
    }

    /// Assume or relinquish coordination based on the freshly installed
    /// view. The member ranked first by the comparator coordinates; a
    /// successor re-broadcasts the last known view before serving.
    fn manage_coordinator_role(self: &Arc<Self>, view: &Arc<MembershipView>) {
        let ours = view
            .coordinator_of(self.comparator.as_ref())
            .map(|c| c == &self.local)
            .unwrap_or(false);

        if ours {
            // A takeover mid-lineage re-broadcasts first; the founding view
            // has nobody to reconcile
            self.assume_coordination(view, view.view_id().0 > 0);
        } else if self.state.coordinator.lock().take().is_some() {
            info!(view = %view, "relinquishing coordinator role");
        }
    }

    /// Spawn the coordinator actor seeded with `view` if none is running.
    fn assume_coordination(
        self: &Arc<Self>,
        view: &Arc<MembershipView>,
        takeover: bool,
    ) -> CoordinatorHandle {
        let mut guard = self.state.coordinator.lock();
        if let Some(handle) = guard.as_ref() {
            return handle.clone();
        }
        info!(view = %view, takeover, "assuming coordinator role");
        let handle = Coordinator::spawn(
            self.local.clone(),
            self.config.clone(),
            Arc::clone(&self.comparator),
            Arc::clone(&self.messenger),
            Arc::clone(&self.final_checker),
            Arc::clone(view),
            takeover,
        );
        *guard = Some(handle.clone());
        handle
    }

    /// Deliver a suspicion to whoever can resolve it. Normally that is the
    /// coordinator; when the coordinator itself is the suspect, the
    /// next-ranked member assumes the role (the final check still guards
    /// against removing a live coordinator) and everyone else forwards the
    /// report to that successor. At most one resolution runs per suspect:
    /// every member re-reports a broadcast suspicion, and N-1 redundant
    /// final checks would stall the coordinator's queue.
    async fn route_suspicion(self: &Arc<Self>, suspicion: Suspicion) {
        let suspect = suspicion.suspect.clone();
        if !self.state.inflight_suspicions.lock().insert(suspect.clone()) {
            debug!(suspect = %suspect, "suspicion already in flight, dropping duplicate");
            return;
        }
        self.deliver_suspicion(suspicion).await;
        self.state.inflight_suspicions.lock().remove(&suspect);
    }

    async fn deliver_suspicion(self: &Arc<Self>, suspicion: Suspicion) {
        let handle = self.state.coordinator.lock().clone();
        if let Some(handle) = handle {
            if let Ok(outcome) = handle.process_suspicion(suspicion).await {
                debug!(outcome = ?outcome, "suspicion resolved");
            }
            return;
        }

        let view = match self.current_view() {
            Some(view) => view,
            None => return,
        };
        let coordinator = match view.coordinator_of(self.comparator.as_ref()) {
            Some(c) => c.clone(),
            None => return,
        };

        let target = if coordinator == suspicion.suspect {
            let successor = view
                .members()
                .iter()
                .filter(|m| **m != suspicion.suspect)
                .min_by(|a, b| self.comparator.cmp(a, b))
                .cloned();
            match successor {
                Some(successor) if successor == self.local => {
                    // The suspected coordinator cannot depose itself; we
                    // are next in line, so resolve the suspicion ourselves
                    info!(suspect = %suspicion.suspect, "suspected coordinator, assuming succession");
                    let handle = self.assume_coordination(&view, true);
                    if let Ok(outcome) = handle.process_suspicion(suspicion).await {
                        debug!(outcome = ?outcome, "succession suspicion resolved");
                        if matches!(outcome, SuspicionOutcome::Cleared) {
                            // The sitting coordinator answered its final
                            // check; stand down
                            self.state.coordinator.lock().take();
                        }
                    }
                    return;
                }
                Some(successor) => successor,
                None => return,
            }
        } else {
            coordinator
        };

        let _ = self
            .messenger
            .send(
                &target,
                ProtocolMessage::Suspect {
                    suspect: suspicion.suspect,
                    reporter: suspicion.reporter,
                },
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DetectorConfig;
    use crate::error::JoinRejection;
    use crate::health::{MajorityOfLastView, MinimumMembers};
    use crate::identity::{
        DefaultIdentifierFactory, LexicographicComparator, MemberData, MemberIdentifierFactory,
    };
    use crate::locator::Locator;
    use crate::transport::InProcessNetwork;
    use crate::view::ViewId;
    use std::sync::atomic::AtomicUsize;

    fn fast_config() -> MembershipConfig {
        MembershipConfig {
            detector: DetectorConfig {
                probe_interval: Duration::from_millis(30),
                probe_timeout: Duration::from_millis(20),
                missed_probe_threshold: 2,
                final_check_window: Duration::from_millis(50),
                final_check_attempts: 1,
                final_check_timeout: Duration::from_millis(100),
                ..DetectorConfig::default()
            },
            join: crate::config::JoinConfig {
                join_timeout: Duration::from_millis(500),
                join_attempts: 3,
                retry_backoff: Duration::from_millis(50),
                ..crate::config::JoinConfig::default()
            },
            ..MembershipConfig::default()
        }
    }

    fn spawn_member(
        network: &InProcessNetwork,
        locator: &Arc<Locator>,
        host: &str,
        health: HealthMonitor,
    ) -> Arc<MembershipService> {
        spawn_member_with(network, locator, host, health, fast_config())
    }

    fn spawn_member_with(
        network: &InProcessNetwork,
        locator: &Arc<Locator>,
        host: &str,
        health: HealthMonitor,
        config: MembershipConfig,
    ) -> Arc<MembershipService> {
        let data = MemberData::new(host, 9000);
        let identity = DefaultIdentifierFactory.create(data);
        let view_stamp = ViewStamp::new();
        let (messenger, inbound) = network.register(
            identity.clone(),
            Arc::clone(&view_stamp),
            config.stale_view_tolerance,
            config.transport.inbound_buffer,
        );
        let (service, escalations) = MembershipService::new(
            identity,
            config,
            DefaultIdentifierFactory.comparator(),
            messenger,
            Arc::clone(locator) as Arc<dyn ViewDiscovery>,
            view_stamp,
            health,
        );
        service.start(inbound, escalations);
        service
    }

    async fn await_view<F>(service: &Arc<MembershipService>, mut predicate: F)
    where
        F: FnMut(&MembershipView) -> bool,
    {
        for _ in 0..200 {
            if let Some(view) = service.current_view() {
                if predicate(&view) {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "view predicate never satisfied; current: {:?}",
            service.current_view()
        );
    }

    #[tokio::test]
    async fn test_bootstrap_then_sequential_joins() {
        let network = InProcessNetwork::new();
        let locator = Locator::new();

        let a = spawn_member(&network, &locator, "a", HealthMonitor::permissive());
        let v0 = a.bootstrap().await.unwrap();
        assert_eq!(v0.view_id(), ViewId(0));
        assert!(a.is_coordinator());

        let b = spawn_member(&network, &locator, "b", HealthMonitor::permissive());
        let v1 = b.join().await.unwrap();
        assert_eq!(v1.view_id(), ViewId(1));
        assert!(v1.contains(b.local_identity()));

        let c = spawn_member(&network, &locator, "c", HealthMonitor::permissive());
        let v2 = c.join().await.unwrap();
        assert_eq!(v2.view_id(), ViewId(2));
        assert_eq!(v2.members().len(), 3);

        // Every member converges on the same coordinator
        await_view(&a, |v| v.view_id() == ViewId(2)).await;
        assert_eq!(a.current_coordinator(), b.current_coordinator());
        assert_eq!(b.current_coordinator(), c.current_coordinator());
        assert_eq!(a.current_coordinator().unwrap(), *a.local_identity());
    }

    #[tokio::test]
    async fn test_is_member_queries() {
        let network = InProcessNetwork::new();
        let locator = Locator::new();
        let a = spawn_member(&network, &locator, "a", HealthMonitor::permissive());
        a.bootstrap().await.unwrap();
        let b = spawn_member(&network, &locator, "b", HealthMonitor::permissive());
        b.join().await.unwrap();

        await_view(&a, |v| v.members().len() == 2).await;
        assert!(a.is_member(b.local_identity()));
        assert!(a.is_member(a.local_identity()));

        let stranger = DefaultIdentifierFactory.create(MemberData::new("stranger", 1));
        assert!(!a.is_member(&stranger));
    }

    #[tokio::test]
    async fn test_join_without_any_view_fails() {
        let network = InProcessNetwork::new();
        let locator = Locator::new();
        let lonely = spawn_member(&network, &locator, "x", HealthMonitor::permissive());
        let err = lonely.join().await.unwrap_err();
        assert!(matches!(err, MembershipError::DiscoveryFailed(_)));
    }

    #[tokio::test]
    async fn test_view_change_events_carry_delta() {
        let network = InProcessNetwork::new();
        let locator = Locator::new();
        let a = spawn_member(&network, &locator, "a", HealthMonitor::permissive());
        a.bootstrap().await.unwrap();
        let mut events = a.subscribe();

        let b = spawn_member(&network, &locator, "b", HealthMonitor::permissive());
        b.join().await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.new.view_id(), ViewId(1));
        assert_eq!(event.delta.added, vec![b.local_identity().clone()]);
        assert!(event.delta.removed.is_empty());
    }

    #[tokio::test]
    async fn test_leave_produces_view_without_member() {
        let network = InProcessNetwork::new();
        let locator = Locator::new();
        let a = spawn_member(&network, &locator, "a", HealthMonitor::permissive());
        a.bootstrap().await.unwrap();
        let b = spawn_member(&network, &locator, "b", HealthMonitor::permissive());
        b.join().await.unwrap();
        await_view(&a, |v| v.members().len() == 2).await;

        let b_id = b.local_identity().clone();
        b.leave().await.unwrap();

        await_view(&a, |v| !v.contains(&b_id)).await;
        assert!(b.is_stopped());
        let view = a.current_view().unwrap();
        // Voluntary departure is not shunned
        assert!(!view.is_shunned(&b_id, 100));
    }

    #[tokio::test]
    async fn test_stale_view_message_never_regresses_state() {
        let network = InProcessNetwork::new();
        let locator = Locator::new();
        let a = spawn_member(&network, &locator, "a", HealthMonitor::permissive());
        a.bootstrap().await.unwrap();
        let b = spawn_member(&network, &locator, "b", HealthMonitor::permissive());
        b.join().await.unwrap();
        await_view(&a, |v| v.view_id() == ViewId(1)).await;

        // Jam an old view directly through the install path
        let old = MembershipView::initial(a.local_identity().clone());
        a.install(old).await;
        assert_eq!(a.current_view().unwrap().view_id(), ViewId(1));
    }

    #[tokio::test]
    async fn test_dump_view_is_json() {
        let network = InProcessNetwork::new();
        let locator = Locator::new();
        let a = spawn_member(&network, &locator, "a", HealthMonitor::permissive());
        a.bootstrap().await.unwrap();
        let dump = a.dump_view().unwrap();
        assert!(dump.contains("view_id"));
    }

    #[tokio::test]
    async fn test_quorum_shutdown_policy_stops_service() {
        let network = InProcessNetwork::new();
        let locator = Locator::new();
        // Majority of the last view: tolerates the single-member bootstrap
        // view, trips once the two-member cluster halves
        let a = spawn_member(
            &network,
            &locator,
            "a",
            HealthMonitor::new(Arc::new(MajorityOfLastView::new()), LossAction::Shutdown),
        );
        a.bootstrap().await.unwrap();
        let b = spawn_member(&network, &locator, "b", HealthMonitor::permissive());
        b.join().await.unwrap();
        await_view(&a, |v| v.members().len() == 2).await;
        assert!(!a.is_stopped());

        // b crashes; the detector escalates and the view shrinks below
        // quorum
        network.disconnect(b.local_identity());
        for _ in 0..400 {
            if a.is_stopped() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(a.is_stopped());
    }

    #[tokio::test]
    async fn test_reconnect_policy_rejoins_after_quorum_loss() {
        let network = InProcessNetwork::new();
        let locator = Locator::new();
        let a = spawn_member(&network, &locator, "a", HealthMonitor::permissive());
        a.bootstrap().await.unwrap();
        let b = spawn_member(
            &network,
            &locator,
            "b",
            HealthMonitor::new(Arc::new(MinimumMembers(2)), LossAction::Reconnect),
        );
        b.join().await.unwrap();
        await_view(&b, |v| v.members().len() == 2).await;

        // Losing the peer trips the policy; the rejoin finds the surviving
        // lineage through the locator and carries on
        a.leave().await.unwrap();
        await_view(&b, |v| v.members().len() == 1).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!b.is_stopped());
        assert!(b.is_member(b.local_identity()));
    }

    #[tokio::test]
    async fn test_expelled_member_relinquishes_coordination() {
        let network = InProcessNetwork::new();
        let locator = Locator::new();
        let a = spawn_member(&network, &locator, "a", HealthMonitor::permissive());
        a.bootstrap().await.unwrap();
        assert!(a.is_coordinator());

        // A successor lineage that has moved on without a
        let cmp = LexicographicComparator;
        let b = DefaultIdentifierFactory.create(MemberData::new("b", 9000));
        let v0 = a.current_view().unwrap();
        let v1 = v0.with_member_added(b.clone(), b.clone(), &cmp);
        let v2 = v1.with_member_removed(a.local_identity(), b);
        a.install(v2).await;
        assert!(!a.is_member(a.local_identity()));

        // The expelled process must not mint views on the old lineage: a
        // candidate knocking on it gets no admission
        let x = DefaultIdentifierFactory.create(MemberData::new("x", 9000));
        let (messenger_x, mut inbound_x) = network.register(x.clone(), ViewStamp::new(), 1, 16);
        messenger_x
            .send(
                a.local_identity(),
                ProtocolMessage::JoinRequest { candidate: x },
            )
            .await
            .unwrap();
        let reply = tokio::time::timeout(Duration::from_millis(300), inbound_x.recv()).await;
        assert!(reply.is_err(), "expelled member answered a join: {:?}", reply);
    }

    #[tokio::test]
    async fn test_join_response_from_wrong_sender_is_ignored() {
        let network = InProcessNetwork::new();
        let locator = Locator::new();

        // A coordinator that never answers, known to the locator
        let silent = DefaultIdentifierFactory.create(MemberData::new("a", 9000));
        let (_messenger_a, mut inbound_a) =
            network.register(silent.clone(), ViewStamp::new(), 1, 16);
        locator.record_view(MembershipView::initial(silent));

        // An impostor answering in its place
        let impostor = DefaultIdentifierFactory.create(MemberData::new("z", 9000));
        let (messenger_z, _inbound_z) =
            network.register(impostor, ViewStamp::new(), 1, 16);

        let b = spawn_member(&network, &locator, "b", HealthMonitor::permissive());
        let b_id = b.local_identity().clone();
        let spoofer = tokio::spawn(async move {
            while let Some(envelope) = inbound_a.recv().await {
                if matches!(envelope.payload, ProtocolMessage::JoinRequest { .. }) {
                    let _ = messenger_z
                        .send(
                            &b_id,
                            ProtocolMessage::JoinResponse(JoinOutcome::Rejected {
                                reason: JoinRejection::DuplicateIdentity,
                            }),
                        )
                        .await;
                }
            }
        });

        // The spoofed rejection must not resolve the attempt; exhausting
        // the silent coordinator times the join out instead
        let err = b.join().await.unwrap_err();
        assert!(matches!(err, MembershipError::ViewInstallTimeout(_)));
        spoofer.abort();
    }

    #[tokio::test]
    async fn test_duplicate_suspicion_reports_run_one_final_check() {
        let network = InProcessNetwork::new();
        let locator = Locator::new();
        // Probing quiesced: the only final checks come from forwarded
        // reports
        let mut config = fast_config();
        config.detector.probe_interval = Duration::from_secs(60);
        let a = spawn_member_with(&network, &locator, "a", HealthMonitor::permissive(), config);
        a.bootstrap().await.unwrap();

        let b = DefaultIdentifierFactory.create(MemberData::new("b", 9000));
        let (messenger_b, mut inbound_b) = network.register(b.clone(), ViewStamp::new(), 1, 64);
        messenger_b
            .send(
                a.local_identity(),
                ProtocolMessage::JoinRequest {
                    candidate: b.clone(),
                },
            )
            .await
            .unwrap();

        // b answers final checks and counts them
        let checks = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&checks);
        let mb = Arc::clone(&messenger_b);
        let responder = tokio::spawn(async move {
            while let Some(envelope) = inbound_b.recv().await {
                if let ProtocolMessage::FinalCheckRequest { target } = envelope.payload {
                    counted.fetch_add(1, Ordering::SeqCst);
                    let _ = mb
                        .send(
                            &envelope.sender,
                            ProtocolMessage::FinalCheckResult {
                                target,
                                alive: true,
                            },
                        )
                        .await;
                }
            }
        });
        await_view(&a, |v| v.members().len() == 2).await;

        let reporter = DefaultIdentifierFactory.create(MemberData::new("c", 9000));
        let (messenger_c, _inbound_c) =
            network.register(reporter.clone(), ViewStamp::new(), 1, 16);
        for _ in 0..3 {
            messenger_c
                .send(
                    a.local_identity(),
                    ProtocolMessage::Suspect {
                        suspect: b.clone(),
                        reporter: reporter.clone(),
                    },
                )
                .await
                .unwrap();
        }

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(checks.load(Ordering::SeqCst), 1);
        assert!(a.is_member(&b));
        responder.abort();
    }
}
