//! Wire protocol messages
//!
//! Every message travels inside an [`Envelope`] carrying the sender, the
//! view id the sender believed current, a per-sender sequence number and a
//! wire version marker. Frames on the wire are a u32 big-endian length
//! prefix followed by the bincode-encoded envelope. Each message kind has a
//! fixed field layout; unknown or incompatible versions are rejected at
//! decode, never crashed on.

use serde::{Deserialize, Serialize};

use crate::error::{JoinRejection, WireError};
use crate::identity::MemberIdentifier;
use crate::view::{MembershipView, ViewId};

/// Wire version emitted by this build
pub const WIRE_VERSION: u16 = 1;

/// Oldest wire version this build still decodes
pub const MIN_WIRE_VERSION: u16 = 1;

/// Protocol payloads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProtocolMessage {
    /// A candidate asks the coordinator to be admitted
    JoinRequest { candidate: MemberIdentifier },
    /// Coordinator's answer to a join request
    JoinResponse(JoinOutcome),
    /// A member announces its voluntary departure
    Leave { member: MemberIdentifier },
    /// Coordinator broadcasts a newly prepared view
    View { view: MembershipView },
    /// A reporter believes the suspect may be unreachable
    Suspect {
        suspect: MemberIdentifier,
        reporter: MemberIdentifier,
    },
    /// Direct, higher-priority connectivity probe of a suspect
    FinalCheckRequest { target: MemberIdentifier },
    /// Outcome of a final check
    FinalCheckResult {
        target: MemberIdentifier,
        alive: bool,
    },
    /// Ask a locator (or member) for the newest view it knows
    GetView,
    /// Answer to [`ProtocolMessage::GetView`]
    GetViewResponse { view: Option<MembershipView> },
    /// Liveness probe
    Ping { nonce: u64 },
    /// Liveness probe answer
    Pong { nonce: u64 },
}

impl ProtocolMessage {
    /// Short tag for logging
    pub fn kind(&self) -> &'static str {
        match self {
            ProtocolMessage::JoinRequest { .. } => "JoinRequest",
            ProtocolMessage::JoinResponse(_) => "JoinResponse",
            ProtocolMessage::Leave { .. } => "Leave",
            ProtocolMessage::View { .. } => "View",
            ProtocolMessage::Suspect { .. } => "Suspect",
            ProtocolMessage::FinalCheckRequest { .. } => "FinalCheckRequest",
            ProtocolMessage::FinalCheckResult { .. } => "FinalCheckResult",
            ProtocolMessage::GetView => "GetView",
            ProtocolMessage::GetViewResponse { .. } => "GetViewResponse",
            ProtocolMessage::Ping { .. } => "Ping",
            ProtocolMessage::Pong { .. } => "Pong",
        }
    }

    /// Bootstrap traffic is exempt from stale-view filtering: joiners and
    /// locator clients have no installed view yet.
    pub fn is_bootstrap(&self) -> bool {
        matches!(
            self,
            ProtocolMessage::JoinRequest { .. }
                | ProtocolMessage::JoinResponse(_)
                | ProtocolMessage::GetView
                | ProtocolMessage::GetViewResponse { .. }
        )
    }
}

/// Coordinator's decision on a join
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JoinOutcome {
    Accepted { view: MembershipView },
    Rejected { reason: JoinRejection },
}

/// Transport envelope around every protocol message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Identity of the sending process
    pub sender: MemberIdentifier,
    /// View id the sender had installed when it sent this
    pub view_id_at_send: ViewId,
    /// Per-sender sequence number, for duplicate detection
    pub sequence: u64,
    /// Wire version marker
    pub wire_version: u16,
    /// The message itself
    pub payload: ProtocolMessage,
}

impl Envelope {
    pub fn new(
        sender: MemberIdentifier,
        view_id_at_send: ViewId,
        sequence: u64,
        payload: ProtocolMessage,
    ) -> Self {
        Self {
            sender,
            view_id_at_send,
            sequence,
            wire_version: WIRE_VERSION,
            payload,
        }
    }

    /// Encode to a length-prefixed wire frame.
    pub fn encode(&self, max_frame_size: usize) -> Result<Vec<u8>, WireError> {
        let body = bincode::serialize(self).map_err(|e| WireError::Encode(e.to_string()))?;
        if body.len() > max_frame_size {
            return Err(WireError::FrameTooLarge {
                size: body.len(),
                limit: max_frame_size,
            });
        }
        let mut frame = Vec::with_capacity(4 + body.len());
        frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    /// Decode a frame body (length prefix already stripped). Rejects
    /// envelopes carrying an unsupported wire version.
    pub fn decode(body: &[u8]) -> Result<Self, WireError> {
        let envelope: Envelope =
            bincode::deserialize(body).map_err(|e| WireError::Decode(e.to_string()))?;
        if envelope.wire_version < MIN_WIRE_VERSION || envelope.wire_version > WIRE_VERSION {
            return Err(WireError::IncompatibleVersion {
                received: envelope.wire_version,
                min: MIN_WIRE_VERSION,
                max: WIRE_VERSION,
            });
        }
        Ok(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::MemberData;

    fn member(host: &str) -> MemberIdentifier {
        MemberIdentifier::new(MemberData::new(host, 7000))
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let sender = member("a");
        let envelope = Envelope::new(
            sender.clone(),
            ViewId(3),
            42,
            ProtocolMessage::Ping { nonce: 7 },
        );
        let frame = envelope.encode(1024 * 1024).unwrap();
        let len = u32::from_be_bytes(frame[0..4].try_into().unwrap()) as usize;
        assert_eq!(len, frame.len() - 4);

        let decoded = Envelope::decode(&frame[4..]).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_incompatible_version_rejected() {
        let mut envelope = Envelope::new(member("a"), ViewId(0), 0, ProtocolMessage::GetView);
        envelope.wire_version = 99;
        let body = bincode::serialize(&envelope).unwrap();
        let err = Envelope::decode(&body).unwrap_err();
        assert!(matches!(
            err,
            WireError::IncompatibleVersion { received: 99, .. }
        ));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let view = MembershipView::initial(member("a"));
        let envelope = Envelope::new(
            member("a"),
            ViewId(0),
            0,
            ProtocolMessage::View { view },
        );
        let err = envelope.encode(8).unwrap_err();
        assert!(matches!(err, WireError::FrameTooLarge { .. }));
    }

    #[test]
    fn test_bootstrap_classification() {
        assert!(ProtocolMessage::GetView.is_bootstrap());
        assert!(ProtocolMessage::JoinRequest {
            candidate: member("x")
        }
        .is_bootstrap());
        assert!(!ProtocolMessage::Ping { nonce: 1 }.is_bootstrap());
    }
}
