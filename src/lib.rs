//! Group membership for distributed processes.
//!
//! Processes agree on an ordered, versioned membership view. A single
//! coordinator (the comparator-first member of the current view) serializes
//! all view changes; every other member learns of changes through broadcast
//! view installs. Failed members are detected in two stages (neighbor
//! probing, then a direct final check by the coordinator) and shunned so
//! their stale identity cannot rejoin. Locators cache the newest view so
//! joining processes can find the cluster without a static member list.
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use membership::{
//!     DefaultIdentifierFactory, HealthMonitor, InProcessNetwork, Locator,
//!     MemberData, MemberIdentifierFactory, MembershipConfig,
//!     MembershipService, ViewDiscovery, ViewStamp,
//! };
//!
//! # async fn demo() -> membership::MembershipResult<()> {
//! let network = InProcessNetwork::new();
//! let locator = Locator::new();
//! let config = MembershipConfig::default();
//!
//! let identity = DefaultIdentifierFactory.create(MemberData::new("node-a", 7100));
//! let view_stamp = ViewStamp::new();
//! let (messenger, inbound) = network.register(
//!     identity.clone(),
//!     Arc::clone(&view_stamp),
//!     config.stale_view_tolerance,
//!     config.transport.inbound_buffer,
//! );
//! let (service, escalations) = MembershipService::new(
//!     identity,
//!     config,
//!     DefaultIdentifierFactory.comparator(),
//!     messenger,
//!     locator as Arc<dyn ViewDiscovery>,
//!     view_stamp,
//!     HealthMonitor::permissive(),
//! );
//! service.start(inbound, escalations);
//! let view = service.bootstrap().await?;
//! println!("founded cluster at {view}");
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod coordinator;
pub mod detector;
pub mod error;
pub mod health;
pub mod identity;
pub mod locator;
pub mod messages;
pub mod service;
pub mod transport;
pub mod view;

pub use config::{DetectorConfig, JoinConfig, MembershipConfig, TransportConfig};
pub use coordinator::{
    Coordinator, CoordinatorHandle, SuspicionOutcome, ViewChangeOutcome, ViewChangeRequest,
};
pub use detector::{FailureDetector, FinalChecker, Suspicion};
pub use error::{
    JoinRejection, MembershipError, MembershipResult, TransportError, WireError,
};
pub use health::{
    HealthMonitor, HealthVerdict, LossAction, MajorityOfLastView, MinimumMembers, QuorumPolicy,
    RedundancyZones,
};
pub use identity::{
    DefaultIdentifierFactory, LexicographicComparator, MemberComparator, MemberData,
    MemberIdentifier, MemberIdentifierFactory, MIN_SUPPORTED_VERSION, PROTOCOL_VERSION,
};
pub use locator::{Locator, LocatorServer, LocatorSet, ViewDiscovery};
pub use messages::{Envelope, JoinOutcome, ProtocolMessage, MIN_WIRE_VERSION, WIRE_VERSION};
pub use service::{MembershipService, ViewChangeEvent};
pub use transport::{
    InProcessMessenger, InProcessNetwork, Inbound, Messenger, ReceiveFilter, TcpMessenger,
    ViewStamp,
};
pub use view::{MembershipView, ShunRecord, ViewDelta, ViewId};
