//! Membership views
//!
//! A view is the agreed-upon, versioned snapshot of cluster membership at a
//! point in logical time. Views are immutable values: every change produces
//! a fresh instance with the view id bumped by exactly one. Members removed
//! from a view move into a bounded shun history that rejects stale
//! re-admission and duplicate-removal traffic.

use serde::{Deserialize, Serialize};

use crate::identity::{MemberComparator, MemberIdentifier};

/// Monotonically increasing view identifier
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct ViewId(pub u64);

impl ViewId {
    pub fn initial() -> Self {
        Self(0)
    }

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// How many installs `self` lags behind `other`; zero if not behind
    pub fn lag_behind(self, other: ViewId) -> u64 {
        other.0.saturating_sub(self.0)
    }
}

impl std::fmt::Display for ViewId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// A removed member retained to reject its stale traffic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShunRecord {
    pub member: MemberIdentifier,
    /// View at which the member was shunned; used for expiry
    pub shunned_at_view: ViewId,
}

/// Immutable, versioned membership snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipView {
    view_id: ViewId,
    creator: MemberIdentifier,
    members: Vec<MemberIdentifier>,
    shunned: Vec<ShunRecord>,
}

impl MembershipView {
    /// The first view of a cluster: the founding member alone, view id 0.
    pub fn initial(founder: MemberIdentifier) -> Self {
        Self {
            view_id: ViewId::initial(),
            creator: founder.clone(),
            members: vec![founder],
            shunned: Vec::new(),
        }
    }

    pub fn view_id(&self) -> ViewId {
        self.view_id
    }

    pub fn creator(&self) -> &MemberIdentifier {
        &self.creator
    }

    pub fn members(&self) -> &[MemberIdentifier] {
        &self.members
    }

    pub fn shunned(&self) -> &[ShunRecord] {
        &self.shunned
    }

    pub fn contains(&self, member: &MemberIdentifier) -> bool {
        self.members.contains(member)
    }

    /// Whether the member is in the shun history and not yet expired
    pub fn is_shunned(&self, member: &MemberIdentifier, expiry_views: u64) -> bool {
        self.shunned
            .iter()
            .any(|r| &r.member == member && r.shunned_at_view.lag_behind(self.view_id) <= expiry_views)
    }

    /// The coordinator of this view: the comparator-first member.
    /// Pure function of the member list and the comparator.
    pub fn coordinator_of(&self, comparator: &dyn MemberComparator) -> Option<&MemberIdentifier> {
        self.members
            .iter()
            .min_by(|a, b| comparator.cmp(a, b))
    }

    /// Successor view admitting `candidate`. Caller has already vetted the
    /// candidate (duplicates, version, capacity).
    pub fn with_member_added(
        &self,
        candidate: MemberIdentifier,
        creator: MemberIdentifier,
        comparator: &dyn MemberComparator,
    ) -> Self {
        let mut members = self.members.clone();
        members.push(candidate);
        members.sort_by(|a, b| comparator.cmp(a, b));
        Self {
            view_id: self.view_id.next(),
            creator,
            members,
            shunned: self.shunned.clone(),
        }
    }

    /// Successor view without `member` (voluntary leave; not shunned).
    pub fn with_member_removed(&self, member: &MemberIdentifier, creator: MemberIdentifier) -> Self {
        let members = self
            .members
            .iter()
            .filter(|m| *m != member)
            .cloned()
            .collect();
        Self {
            view_id: self.view_id.next(),
            creator,
            members,
            shunned: self.shunned.clone(),
        }
    }

    /// Successor view with `member` removed and added to the shun history.
    pub fn with_member_shunned(
        &self,
        member: &MemberIdentifier,
        creator: MemberIdentifier,
        history_limit: usize,
    ) -> Self {
        let next_id = self.view_id.next();
        let members: Vec<_> = self
            .members
            .iter()
            .filter(|m| *m != member)
            .cloned()
            .collect();
        let mut shunned = self.shunned.clone();
        shunned.push(ShunRecord {
            member: member.clone(),
            shunned_at_view: next_id,
        });
        // Bounded history, oldest out first
        while shunned.len() > history_limit {
            shunned.remove(0);
        }
        Self {
            view_id: next_id,
            creator,
            members,
            shunned,
        }
    }

    /// Difference between a previously installed view and this one.
    pub fn delta_from(&self, old: &MembershipView, comparator: &dyn MemberComparator) -> ViewDelta {
        let added = self
            .members
            .iter()
            .filter(|m| !old.contains(m))
            .cloned()
            .collect();
        let removed = old
            .members
            .iter()
            .filter(|m| !self.contains(m))
            .cloned()
            .collect();
        let coordinator_changed =
            old.coordinator_of(comparator) != self.coordinator_of(comparator);
        ViewDelta {
            added,
            removed,
            coordinator_changed,
        }
    }
}

impl std::fmt::Display for MembershipView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[", self.view_id)?;
        for (i, m) in self.members.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", m)?;
        }
        write!(f, "]")
    }
}

/// What changed between two installed views
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewDelta {
    pub added: Vec<MemberIdentifier>,
    pub removed: Vec<MemberIdentifier>,
    pub coordinator_changed: bool,
}
