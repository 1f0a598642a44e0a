//! Error types for the membership service

use thiserror::Error;

use crate::identity::MemberIdentifier;
use crate::view::ViewId;

/// Result type for membership operations
pub type MembershipResult<T> = Result<T, MembershipError>;

/// Main error type for membership operations
#[derive(Error, Debug, Clone)]
pub enum MembershipError {
    /// A join request was turned down by the coordinator
    #[error("join rejected: {0}")]
    JoinRejected(JoinRejection),

    /// A new view was proposed but acceptance did not arrive in time
    #[error("view install timed out waiting for view {0}")]
    ViewInstallTimeout(ViewId),

    /// The configured quorum predicate failed after a view install
    #[error("quorum lost at view {view_id}: {members} member(s) remaining")]
    QuorumLost { view_id: ViewId, members: usize },

    /// Transport-level failure, surfaced to the caller; retry is a caller
    /// decision
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Wire encode/decode failure
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// The operation requires the local process to be coordinator
    #[error("not the coordinator (current coordinator: {0:?})")]
    NotCoordinator(Option<MemberIdentifier>),

    /// No locator produced a usable view
    #[error("discovery failed: {0}")]
    DiscoveryFailed(String),

    /// The service has been stopped
    #[error("membership service stopped")]
    ServiceStopped,
}

/// Reasons a coordinator refuses a join
#[derive(Error, Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum JoinRejection {
    /// The candidate is already a member, or still in the shun history
    #[error("duplicate identity")]
    DuplicateIdentity,

    /// The candidate speaks a protocol version outside the supported range
    #[error("incompatible version {candidate} (supported >= {min_supported})")]
    IncompatibleVersion { candidate: u16, min_supported: u16 },

    /// The cluster is at its configured capacity
    #[error("cluster at capacity ({limit} members)")]
    CapacityExceeded { limit: usize },
}

/// Transport-level errors
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("failed to bind {addr}: {reason}")]
    Bind { addr: String, reason: String },

    #[error("connection to {target} failed: {reason}")]
    ConnectionFailed { target: String, reason: String },

    #[error("send to {target} failed: {reason}")]
    SendFailed { target: String, reason: String },

    #[error("recipient {target} is unknown to the transport")]
    UnknownRecipient { target: String },

    #[error("transport closed")]
    Closed,
}

/// Wire format errors
#[derive(Error, Debug, Clone)]
pub enum WireError {
    #[error("encode failed: {0}")]
    Encode(String),

    #[error("decode failed: {0}")]
    Decode(String),

    #[error("incompatible wire version {received} (supported {min}..={max})")]
    IncompatibleVersion { received: u16, min: u16, max: u16 },

    #[error("frame of {size} bytes exceeds limit of {limit}")]
    FrameTooLarge { size: usize, limit: usize },
}
