//! Member identity for the membership service
//!
//! Identities are opaque to the protocol core: the embedding system supplies
//! a factory that builds identifiers and a comparator that totally orders
//! them. The comparator ordering is what makes coordinator selection
//! deterministic on every member.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Protocol version spoken by this build.
pub const PROTOCOL_VERSION: u16 = 1;

/// Oldest protocol version still admitted into the cluster.
pub const MIN_SUPPORTED_VERSION: u16 = 1;

/// Raw facts about a process, supplied by the embedding system when the
/// process starts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemberData {
    /// Host the process is reachable on
    pub host: String,
    /// Membership port
    pub port: u16,
    /// Uniquifying token so a restarted process on the same host:port is a
    /// distinct member
    pub token: Uuid,
    /// Optional logical name
    pub name: Option<String>,
    /// Roles advertised to collaborators (redundancy zones, server groups)
    pub roles: Vec<String>,
    /// Protocol version the process speaks
    pub version: u16,
}

impl MemberData {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            token: Uuid::new_v4(),
            name: None,
            roles: Vec::new(),
            version: PROTOCOL_VERSION,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_roles(mut self, roles: Vec<String>) -> Self {
        self.roles = roles;
        self
    }
}

/// Immutable identity of a cluster member.
///
/// Equality is structural over `(host, port, token)`; ordering is *not*
/// derived here but supplied by the configured [`MemberComparator`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberIdentifier {
    data: MemberData,
}

impl MemberIdentifier {
    pub fn new(data: MemberData) -> Self {
        Self { data }
    }

    pub fn host(&self) -> &str {
        &self.data.host
    }

    pub fn port(&self) -> u16 {
        self.data.port
    }

    pub fn token(&self) -> Uuid {
        self.data.token
    }

    pub fn name(&self) -> Option<&str> {
        self.data.name.as_deref()
    }

    pub fn roles(&self) -> &[String] {
        &self.data.roles
    }

    pub fn version(&self) -> u16 {
        self.data.version
    }

    pub fn data(&self) -> &MemberData {
        &self.data
    }
}

impl PartialEq for MemberIdentifier {
    fn eq(&self, other: &Self) -> bool {
        self.data.host == other.data.host
            && self.data.port == other.data.port
            && self.data.token == other.data.token
    }
}

impl Eq for MemberIdentifier {}

impl std::hash::Hash for MemberIdentifier {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.data.host.hash(state);
        self.data.port.hash(state);
        self.data.token.hash(state);
    }
}

impl fmt::Display for MemberIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.data.name {
            Some(name) => write!(f, "{}({}:{})", name, self.data.host, self.data.port),
            None => write!(f, "{}:{}", self.data.host, self.data.port),
        }
    }
}

/// Total order over member identifiers.
///
/// The member ranked first by this order in a view is that view's
/// coordinator, so every member must be configured with the same comparator.
pub trait MemberComparator: Send + Sync {
    fn cmp(&self, a: &MemberIdentifier, b: &MemberIdentifier) -> Ordering;
}

/// Builds identifiers and supplies the comparator that orders them.
pub trait MemberIdentifierFactory: Send + Sync {
    /// Create a new identifier instance from raw member facts
    fn create(&self, data: MemberData) -> MemberIdentifier;

    /// The comparator for identifiers produced by this factory
    fn comparator(&self) -> Arc<dyn MemberComparator>;
}

/// Default ordering: lexicographic over `(host, port, token)`.
#[derive(Debug, Default)]
pub struct LexicographicComparator;

impl MemberComparator for LexicographicComparator {
    fn cmp(&self, a: &MemberIdentifier, b: &MemberIdentifier) -> Ordering {
        a.host()
            .cmp(b.host())
            .then_with(|| a.port().cmp(&b.port()))
            .then_with(|| a.token().cmp(&b.token()))
    }
}

/// Default factory: identity passthrough plus [`LexicographicComparator`].
#[derive(Debug, Default)]
pub struct DefaultIdentifierFactory;

impl MemberIdentifierFactory for DefaultIdentifierFactory {
    fn create(&self, data: MemberData) -> MemberIdentifier {
        MemberIdentifier::new(data)
    }

    fn comparator(&self) -> Arc<dyn MemberComparator> {
        Arc::new(LexicographicComparator)
    }
}
