//! View coordinator
//!
//! The single authority, per installed view, for producing the next view.
//! All view-change requests funnel through one queue and are resolved
//! strictly one at a time, broadcast included; this serialization is what
//! keeps the cluster-wide view id strictly increasing with at most one view
//! per id.
//!
//! Coordinator identity is derived, never elected: the comparator-first
//! member of the current view. A successor taking over after the incumbent
//! is removed re-broadcasts the last known view before accepting new
//! mutations, so stragglers reconcile and no two writers ever overlap.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::MembershipConfig;
use crate::detector::{FinalChecker, Suspicion};
use crate::error::{JoinRejection, MembershipError, MembershipResult};
use crate::identity::{MemberComparator, MemberIdentifier, MIN_SUPPORTED_VERSION};
use crate::messages::{JoinOutcome, ProtocolMessage};
use crate::transport::Messenger;
use crate::view::MembershipView;

/// A request to change the membership view; consumed exactly once.
#[derive(Debug, Clone)]
pub enum ViewChangeRequest {
    Join { candidate: MemberIdentifier },
    Leave { member: MemberIdentifier },
    Remove { member: MemberIdentifier, reason: String },
}

/// Outcome of a serialized view-change request.
#[derive(Debug, Clone)]
pub enum ViewChangeOutcome {
    /// A new view was produced and broadcast
    Installed(Arc<MembershipView>),
    /// The request was a no-op (already absent member, duplicate removal)
    Unchanged(Arc<MembershipView>),
    /// A join was refused
    Rejected(JoinRejection),
}

/// Outcome of suspicion processing.
#[derive(Debug, Clone)]
pub enum SuspicionOutcome {
    /// The final check confirmed liveness; no view change
    Cleared,
    /// The final check failed; the suspect was removed and shunned
    Escalated(Arc<MembershipView>),
}

enum Command {
    Change {
        request: ViewChangeRequest,
        reply: oneshot::Sender<ViewChangeOutcome>,
    },
    Suspicion {
        suspicion: Suspicion,
        reply: oneshot::Sender<SuspicionOutcome>,
    },
    CurrentView {
        reply: oneshot::Sender<Arc<MembershipView>>,
    },
}

/// Handle for submitting requests to the coordinator's serialized queue.
#[derive(Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::Sender<Command>,
}

impl CoordinatorHandle {
    pub async fn request(&self, request: ViewChangeRequest) -> MembershipResult<ViewChangeOutcome> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Change { request, reply })
            .await
            .map_err(|_| MembershipError::ServiceStopped)?;
        rx.await.map_err(|_| MembershipError::ServiceStopped)
    }

    pub async fn process_suspicion(
        &self,
        suspicion: Suspicion,
    ) -> MembershipResult<SuspicionOutcome> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Suspicion { suspicion, reply })
            .await
            .map_err(|_| MembershipError::ServiceStopped)?;
        rx.await.map_err(|_| MembershipError::ServiceStopped)
    }

    /// The coordinator's authoritative view (observed through the queue, so
    /// it reflects all requests resolved so far).
    pub async fn authoritative_view(&self) -> MembershipResult<Arc<MembershipView>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::CurrentView { reply })
            .await
            .map_err(|_| MembershipError::ServiceStopped)?;
        rx.await.map_err(|_| MembershipError::ServiceStopped)
    }
}

/// The single-writer state machine owning the authoritative view.
pub struct Coordinator {
    local: MemberIdentifier,
    config: MembershipConfig,
    comparator: Arc<dyn MemberComparator>,
    messenger: Arc<dyn Messenger>,
    final_checker: Arc<FinalChecker>,
    view: Arc<MembershipView>,
}

impl Coordinator {
    /// Spawn the coordinator task over `initial_view`. When `takeover` is
    /// set the last known view is re-broadcast before the queue is drained.
    pub fn spawn(
        local: MemberIdentifier,
        config: MembershipConfig,
        comparator: Arc<dyn MemberComparator>,
        messenger: Arc<dyn Messenger>,
        final_checker: Arc<FinalChecker>,
        initial_view: Arc<MembershipView>,
        takeover: bool,
    ) -> CoordinatorHandle {
        let (tx, rx) = mpsc::channel(64);
        let coordinator = Self {
            local,
            config,
            comparator,
            messenger,
            final_checker,
            view: initial_view,
        };
        tokio::spawn(coordinator.run(rx, takeover));
        CoordinatorHandle { tx }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Command>, takeover: bool) {
        if takeover {
            info!(view = %self.view, "assuming coordination, re-broadcasting last known view");
            self.broadcast_view().await;
        }

        // One command at a time, fully resolved (broadcast included) before
        // the next is taken
        while let Some(command) = rx.recv().await {
            match command {
                Command::Change { request, reply } => {
                    let outcome = self.apply(request).await;
                    let _ = reply.send(outcome);
                }
                Command::Suspicion { suspicion, reply } => {
                    let outcome = self.resolve_suspicion(suspicion).await;
                    let _ = reply.send(outcome);
                }
                Command::CurrentView { reply } => {
                    let _ = reply.send(Arc::clone(&self.view));
                }
            }
        }
    }

    async fn apply(&mut self, request: ViewChangeRequest) -> ViewChangeOutcome {
        match request {
            ViewChangeRequest::Join { candidate } => self.admit(candidate).await,
            ViewChangeRequest::Leave { member } => {
                if !self.view.contains(&member) {
                    // Idempotent: already absent
                    return ViewChangeOutcome::Unchanged(Arc::clone(&self.view));
                }
                info!(member = %member, "member leaving");
                let next = Arc::new(
                    self.view
                        .with_member_removed(&member, self.local.clone()),
                );
                self.install_and_broadcast(next.clone()).await;
                ViewChangeOutcome::Installed(next)
            }
            ViewChangeRequest::Remove { member, reason } => {
                if !self.view.contains(&member) {
                    debug!(member = %member, "duplicate removal ignored");
                    return ViewChangeOutcome::Unchanged(Arc::clone(&self.view));
                }
                warn!(member = %member, reason = %reason, "removing member");
                let next = Arc::new(self.view.with_member_shunned(
                    &member,
                    self.local.clone(),
                    self.config.shun_history_limit,
                ));
                self.install_and_broadcast(next.clone()).await;
                ViewChangeOutcome::Installed(next)
            }
        }
    }

    async fn admit(&mut self, candidate: MemberIdentifier) -> ViewChangeOutcome {
        if let Some(rejection) = self.vet(&candidate) {
            info!(candidate = %candidate, reason = %rejection, "join rejected");
            let _ = self
                .messenger
                .send(
                    &candidate,
                    ProtocolMessage::JoinResponse(JoinOutcome::Rejected {
                        reason: rejection.clone(),
                    }),
                )
                .await;
            return ViewChangeOutcome::Rejected(rejection);
        }

        let next = Arc::new(self.view.with_member_added(
            candidate.clone(),
            self.local.clone(),
            self.comparator.as_ref(),
        ));
        info!(candidate = %candidate, view = %next, "join accepted");
        self.install_and_broadcast(next.clone()).await;

        let _ = self
            .messenger
            .send(
                &candidate,
                ProtocolMessage::JoinResponse(JoinOutcome::Accepted {
                    view: (*next).clone(),
                }),
            )
            .await;
        ViewChangeOutcome::Installed(next)
    }

    fn vet(&self, candidate: &MemberIdentifier) -> Option<JoinRejection> {
        if self.view.contains(candidate)
            || self
                .view
                .is_shunned(candidate, self.config.shun_expiry_views)
        {
            return Some(JoinRejection::DuplicateIdentity);
        }
        if candidate.version() < MIN_SUPPORTED_VERSION {
            return Some(JoinRejection::IncompatibleVersion {
                candidate: candidate.version(),
                min_supported: MIN_SUPPORTED_VERSION,
            });
        }
        if self.view.members().len() >= self.config.max_members {
            return Some(JoinRejection::CapacityExceeded {
                limit: self.config.max_members,
            });
        }
        None
    }

    async fn resolve_suspicion(&mut self, suspicion: Suspicion) -> SuspicionOutcome {
        if !self.view.contains(&suspicion.suspect) {
            debug!(suspect = %suspicion.suspect, "suspect already out of the view");
            return SuspicionOutcome::Cleared;
        }

        info!(
            suspect = %suspicion.suspect,
            reporter = %suspicion.reporter,
            "running final check"
        );
        if self.final_checker.check(&suspicion.suspect).await {
            return SuspicionOutcome::Cleared;
        }

        let next = Arc::new(self.view.with_member_shunned(
            &suspicion.suspect,
            self.local.clone(),
            self.config.shun_history_limit,
        ));
        warn!(suspect = %suspicion.suspect, view = %next, "final check failed, member removed");
        self.install_and_broadcast(next.clone()).await;
        SuspicionOutcome::Escalated(next)
    }

    /// Adopt `next` as authoritative and broadcast it to every member of the
    /// new view, ourselves included — the local install rides the same
    /// `View` message path every other member uses. Per-member delivery
    /// failures are logged, not fatal; the failure detector owns
    /// unreachable members.
    async fn install_and_broadcast(&mut self, next: Arc<MembershipView>) {
        self.view = Arc::clone(&next);
        self.broadcast_view().await;
    }

    async fn broadcast_view(&self) {
        for member in self.view.members() {
            if let Err(e) = self
                .messenger
                .send(
                    member,
                    ProtocolMessage::View {
                        view: (*self.view).clone(),
                    },
                )
                .await
            {
                debug!(member = %member, error = %e, "view broadcast delivery failed");
            }
        }
    }
}
