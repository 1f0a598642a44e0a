//! Failure detection
//!
//! Each member periodically pings its ring neighbors in the current view.
//! A peer missing a configured number of consecutive pongs becomes
//! suspected; the suspicion is broadcast so any member (including the
//! suspect) can answer with evidence of liveness. A suspicion that outlives
//! its clearing window is handed to the coordinator, which runs the final
//! check before any removal. The two-stage design keeps a live-but-slow
//! member from being removed on a single missed heartbeat.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::DetectorConfig;
use crate::identity::MemberIdentifier;
use crate::messages::ProtocolMessage;
use crate::transport::Messenger;
use crate::view::{MembershipView, ViewId};

/// A provisional, unconfirmed report that a member may be unreachable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Suspicion {
    pub suspect: MemberIdentifier,
    pub reporter: MemberIdentifier,
    /// View under which the suspicion was raised
    pub view_id: ViewId,
    pub raised_at: SystemTime,
}

#[derive(Debug)]
struct PendingPing {
    target: MemberIdentifier,
    sent_at: Instant,
}

#[derive(Debug)]
struct LocalSuspicion {
    raised_at: Instant,
    escalated: bool,
}

#[derive(Debug, Default)]
struct DetectorState {
    /// Ring neighbors currently probed
    targets: Vec<MemberIdentifier>,
    /// Full member list of the current view, for suspicion broadcasts
    members: Vec<MemberIdentifier>,
    misses: HashMap<MemberIdentifier, u32>,
    pending_pings: HashMap<u64, PendingPing>,
    suspicions: HashMap<MemberIdentifier, LocalSuspicion>,
    next_nonce: u64,
    view_id: ViewId,
}

/// Periodic liveness prober with suspicion escalation.
pub struct FailureDetector {
    local: MemberIdentifier,
    config: DetectorConfig,
    messenger: Arc<dyn Messenger>,
    state: Mutex<DetectorState>,
    /// Suspicions that survived their clearing window, for the service to
    /// route to the coordinator
    escalation_tx: mpsc::Sender<Suspicion>,
}

impl FailureDetector {
    pub fn new(
        local: MemberIdentifier,
        config: DetectorConfig,
        messenger: Arc<dyn Messenger>,
    ) -> (Arc<Self>, mpsc::Receiver<Suspicion>) {
        let (escalation_tx, escalation_rx) = mpsc::channel(32);
        let detector = Arc::new(Self {
            local,
            config,
            messenger,
            state: Mutex::new(DetectorState::default()),
            escalation_tx,
        });
        (detector, escalation_rx)
    }

    /// Reconfigure probe targets from a freshly installed view: the
    /// `probe_fanout` members following us in member order, wrapping.
    pub fn update_targets(&self, view: &MembershipView) {
        let members = view.members();
        let mut targets = Vec::new();
        if let Some(pos) = members.iter().position(|m| m == &self.local) {
            let n = members.len();
            for step in 1..n {
                if targets.len() >= self.config.probe_fanout {
                    break;
                }
                targets.push(members[(pos + step) % n].clone());
            }
        }

        let mut state = self.state.lock();
        state.view_id = view.view_id();
        // Members no longer probed or no longer in the view lose their
        // bookkeeping
        state.misses.retain(|m, _| targets.contains(m));
        state
            .suspicions
            .retain(|m, _| view.contains(m));
        state.targets = targets;
        state.members = members.to_vec();
    }

    /// Any inbound traffic from a member is evidence of liveness.
    pub fn record_evidence(&self, member: &MemberIdentifier) {
        let mut state = self.state.lock();
        state.misses.remove(member);
        if state.suspicions.remove(member).is_some() {
            info!(member = %member, "suspicion cleared by liveness evidence");
        }
    }

    /// A pong arrived for one of our pings.
    pub fn handle_pong(&self, nonce: u64) {
        let mut state = self.state.lock();
        if let Some(pending) = state.pending_pings.remove(&nonce) {
            state.misses.remove(&pending.target);
            if state.suspicions.remove(&pending.target).is_some() {
                info!(member = %pending.target, "suspicion cleared by pong");
            }
        }
    }

    /// A suspicion raised elsewhere; track it so evidence can clear it
    /// locally without consulting the coordinator.
    pub fn note_remote_suspicion(&self, suspect: &MemberIdentifier) {
        let mut state = self.state.lock();
        state
            .suspicions
            .entry(suspect.clone())
            .or_insert_with(|| LocalSuspicion {
                raised_at: Instant::now(),
                // Remote reporters drive their own escalation
                escalated: true,
            });
    }

    /// Drive one probe round: expire stale pings, raise or escalate
    /// suspicions, then ping every target.
    pub async fn tick(&self) {
        let (members, newly_suspected, escalations, pings) = {
            let mut state = self.state.lock();
            let now = Instant::now();

            // Expired pings count as misses
            let timeout = self.config.probe_timeout;
            let expired: Vec<u64> = state
                .pending_pings
                .iter()
                .filter(|(_, p)| now.duration_since(p.sent_at) >= timeout)
                .map(|(nonce, _)| *nonce)
                .collect();
            let mut newly_suspected = Vec::new();
            for nonce in expired {
                let pending = state.pending_pings.remove(&nonce).expect("just listed");
                let misses = state.misses.entry(pending.target.clone()).or_insert(0);
                *misses += 1;
                if *misses >= self.config.missed_probe_threshold
                    && !state.suspicions.contains_key(&pending.target)
                {
                    state.suspicions.insert(
                        pending.target.clone(),
                        LocalSuspicion {
                            raised_at: now,
                            escalated: false,
                        },
                    );
                    newly_suspected.push(pending.target.clone());
                }
            }

            // Suspicions past their clearing window escalate once
            let window = self.config.final_check_window;
            let view_id = state.view_id;
            let mut escalations = Vec::new();
            for (suspect, suspicion) in state.suspicions.iter_mut() {
                if !suspicion.escalated && now.duration_since(suspicion.raised_at) >= window {
                    suspicion.escalated = true;
                    escalations.push(Suspicion {
                        suspect: suspect.clone(),
                        reporter: self.local.clone(),
                        view_id,
                        raised_at: SystemTime::now(),
                    });
                }
            }

            // Queue this round's pings
            let mut pings = Vec::new();
            let targets = state.targets.clone();
            for target in targets {
                if state.suspicions.contains_key(&target) {
                    continue;
                }
                let nonce = state.next_nonce;
                state.next_nonce += 1;
                state.pending_pings.insert(
                    nonce,
                    PendingPing {
                        target: target.clone(),
                        sent_at: now,
                    },
                );
                pings.push((target, nonce));
            }

            (state.members.clone(), newly_suspected, escalations, pings)
        };

        for suspect in newly_suspected {
            warn!(suspect = %suspect, "missed probe threshold reached, broadcasting suspicion");
            // Best effort: failures here involve exactly the connectivity
            // being reported on
            for member in &members {
                if member == &self.local {
                    continue;
                }
                let _ = self
                    .messenger
                    .send(
                        member,
                        ProtocolMessage::Suspect {
                            suspect: suspect.clone(),
                            reporter: self.local.clone(),
                        },
                    )
                    .await;
            }
        }

        for suspicion in escalations {
            debug!(suspect = %suspicion.suspect, "suspicion survived clearing window, escalating");
            if self.escalation_tx.send(suspicion).await.is_err() {
                return;
            }
        }

        for (target, nonce) in pings {
            if let Err(e) = self
                .messenger
                .send(&target, ProtocolMessage::Ping { nonce })
                .await
            {
                debug!(target = %target, error = %e, "probe send failed");
            }
        }
    }

    /// Run the probe cycle until `shutdown` resolves.
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.probe_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => self.tick().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    pub fn is_suspected(&self, member: &MemberIdentifier) -> bool {
        self.state.lock().suspicions.contains_key(member)
    }
}

/// Direct, higher-priority connectivity probe used before any removal.
///
/// Sends `FinalCheckRequest` straight at the suspect; a suspect that answers
/// is alive and is never removed for that suspicion instance.
pub struct FinalChecker {
    messenger: Arc<dyn Messenger>,
    config: DetectorConfig,
    pending: Mutex<HashMap<MemberIdentifier, Vec<oneshot::Sender<bool>>>>,
}

impl FinalChecker {
    pub fn new(messenger: Arc<dyn Messenger>, config: DetectorConfig) -> Arc<Self> {
        Arc::new(Self {
            messenger,
            config,
            pending: Mutex::new(HashMap::new()),
        })
    }

    /// Run the final check: up to `final_check_attempts` direct probes, each
    /// with its own timeout. Returns whether the target proved alive.
    pub async fn check(&self, target: &MemberIdentifier) -> bool {
        for attempt in 0..self.config.final_check_attempts {
            let (tx, rx) = oneshot::channel();
            self.pending
                .lock()
                .entry(target.clone())
                .or_default()
                .push(tx);

            let sent = self
                .messenger
                .send(
                    target,
                    ProtocolMessage::FinalCheckRequest {
                        target: target.clone(),
                    },
                )
                .await
                .is_ok();

            if sent {
                match tokio::time::timeout(self.config.final_check_timeout, rx).await {
                    Ok(Ok(alive)) => {
                        if alive {
                            info!(target = %target, attempt, "final check passed");
                            return true;
                        }
                    }
                    _ => {
                        debug!(target = %target, attempt, "final check attempt timed out");
                    }
                }
            } else {
                debug!(target = %target, attempt, "final check send failed");
            }
        }
        self.pending.lock().remove(target);
        warn!(target = %target, "final check failed");
        false
    }

    /// Route an inbound `FinalCheckResult` to whoever is waiting on it.
    pub fn resolve(&self, target: &MemberIdentifier, alive: bool) {
        if let Some(waiters) = self.pending.lock().remove(target) {
            for waiter in waiters {
                let _ = waiter.send(alive);
            }
        }
    }
}
