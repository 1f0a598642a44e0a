//! Partition / quorum policy
//!
//! After every installed view the health monitor evaluates an injectable
//! quorum predicate. When the predicate fails, one of the configured loss
//! actions applies: shut the local process down, continue degraded in
//! read-only mode, or attempt reconnection as a fresh joiner. Collaborators
//! pick the split-brain behavior appropriate to their deployment.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::view::MembershipView;

/// Injectable quorum predicate.
pub trait QuorumPolicy: Send + Sync {
    fn has_quorum(&self, view: &MembershipView) -> bool;

    fn describe(&self) -> String;
}

/// Quorum holds while the view has at least `n` members.
///
/// `MinimumMembers(1)` is the out-of-the-box value, which never fails for a
/// non-empty view: quorum enforcement is opt-in.
pub struct MinimumMembers(pub usize);

impl QuorumPolicy for MinimumMembers {
    fn has_quorum(&self, view: &MembershipView) -> bool {
        view.members().len() >= self.0
    }

    fn describe(&self) -> String {
        format!("at least {} member(s)", self.0)
    }
}

/// Quorum holds while the view retains a strict majority of the previous
/// view's membership. The first evaluated view always passes.
pub struct MajorityOfLastView {
    last_size: Mutex<Option<usize>>,
}

impl MajorityOfLastView {
    pub fn new() -> Self {
        Self {
            last_size: Mutex::new(None),
        }
    }
}

impl Default for MajorityOfLastView {
    fn default() -> Self {
        Self::new()
    }
}

impl QuorumPolicy for MajorityOfLastView {
    fn has_quorum(&self, view: &MembershipView) -> bool {
        let mut last = self.last_size.lock();
        let passed = match *last {
            Some(previous) => view.members().len() * 2 > previous,
            None => true,
        };
        *last = Some(view.members().len());
        passed
    }

    fn describe(&self) -> String {
        "majority of the previously installed view".into()
    }
}

/// Quorum holds while every configured redundancy zone still has at least
/// one member carrying that zone role.
pub struct RedundancyZones {
    pub zones: Vec<String>,
}

impl QuorumPolicy for RedundancyZones {
    fn has_quorum(&self, view: &MembershipView) -> bool {
        self.zones.iter().all(|zone| {
            view.members()
                .iter()
                .any(|m| m.roles().iter().any(|r| r == zone))
        })
    }

    fn describe(&self) -> String {
        format!("one member per zone of {:?}", self.zones)
    }
}

/// What to do when quorum is lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossAction {
    /// Stop serving entirely; a stale minority coordinator must not keep
    /// answering
    Shutdown,
    /// Keep running read-only; collaborators observe the degraded flag
    Degrade,
    /// Leave and rejoin through the locators as a fresh member
    Reconnect,
}

/// Verdict handed back to the service after an evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthVerdict {
    Healthy,
    QuorumLost(LossAction),
}

/// Evaluates the quorum policy after each installed view.
pub struct HealthMonitor {
    policy: Arc<dyn QuorumPolicy>,
    loss_action: LossAction,
    degraded: AtomicBool,
}

impl HealthMonitor {
    pub fn new(policy: Arc<dyn QuorumPolicy>, loss_action: LossAction) -> Self {
        Self {
            policy,
            loss_action,
            degraded: AtomicBool::new(false),
        }
    }

    /// Out-of-the-box monitor: quorum enforcement effectively off.
    pub fn permissive() -> Self {
        Self::new(Arc::new(MinimumMembers(1)), LossAction::Degrade)
    }

    pub fn evaluate(&self, view: &MembershipView) -> HealthVerdict {
        if self.policy.has_quorum(view) {
            if self.degraded.swap(false, Ordering::AcqRel) {
                info!(view = %view, "quorum restored, leaving degraded mode");
            }
            return HealthVerdict::Healthy;
        }

        match self.loss_action {
            LossAction::Shutdown => {
                error!(
                    view = %view,
                    policy = %self.policy.describe(),
                    "quorum lost, shutting down"
                );
            }
            LossAction::Degrade => {
                self.degraded.store(true, Ordering::Release);
                warn!(
                    view = %view,
                    policy = %self.policy.describe(),
                    "quorum lost, entering degraded read-only mode"
                );
            }
            LossAction::Reconnect => {
                warn!(
                    view = %view,
                    policy = %self.policy.describe(),
                    "quorum lost, will rejoin through locators"
                );
            }
        }
        HealthVerdict::QuorumLost(self.loss_action)
    }

    /// Whether the local process is currently degraded read-only.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }
}
