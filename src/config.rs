//! Configuration for the membership service
//!
//! Follows the layered-config shape used elsewhere in the codebase: one
//! top-level struct holding per-component sections, each with a `Default`
//! that is safe for local testing.

use std::net::SocketAddr;
use std::time::Duration;

/// Top-level membership configuration
#[derive(Debug, Clone)]
pub struct MembershipConfig {
    /// Join/retry behavior for this process
    pub join: JoinConfig,
    /// Failure detection tuning
    pub detector: DetectorConfig,
    /// Transport tuning
    pub transport: TransportConfig,
    /// Locator endpoints used for bootstrap and recovery
    pub locators: Vec<SocketAddr>,
    /// Maximum number of members admitted into a view
    pub max_members: usize,
    /// How many removed members the shun history retains
    pub shun_history_limit: usize,
    /// A shunned member may be re-admitted once this many views have passed
    pub shun_expiry_views: u64,
    /// How many views behind an envelope's view-id may lag before it is
    /// dropped as stale
    pub stale_view_tolerance: u64,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            join: JoinConfig::default(),
            detector: DetectorConfig::default(),
            transport: TransportConfig::default(),
            locators: Vec::new(),
            max_members: 1000,
            shun_history_limit: 500,
            shun_expiry_views: 100,
            stale_view_tolerance: 1,
        }
    }
}

/// Join behavior
#[derive(Debug, Clone)]
pub struct JoinConfig {
    /// How long one join request may wait for acceptance
    pub join_timeout: Duration,
    /// Attempts before giving up, each against a freshly discovered
    /// coordinator
    pub join_attempts: usize,
    /// Base backoff between attempts; actual sleep is jittered
    pub retry_backoff: Duration,
    /// Timeout for a single locator query
    pub locator_timeout: Duration,
}

impl Default for JoinConfig {
    fn default() -> Self {
        Self {
            join_timeout: Duration::from_secs(10),
            join_attempts: 5,
            retry_backoff: Duration::from_millis(500),
            locator_timeout: Duration::from_secs(3),
        }
    }
}

/// Failure detector tuning
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Interval between probe rounds
    pub probe_interval: Duration,
    /// How long to wait for a pong before counting a miss
    pub probe_timeout: Duration,
    /// Ring neighbors probed each round
    pub probe_fanout: usize,
    /// Consecutive misses before a peer becomes suspected
    pub missed_probe_threshold: u32,
    /// How long a suspicion may wait for clearing evidence before the final
    /// check runs
    pub final_check_window: Duration,
    /// Direct final-check probes before the suspect is handed to the
    /// coordinator for removal
    pub final_check_attempts: u32,
    /// Timeout for each final-check probe
    pub final_check_timeout: Duration,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(1),
            probe_timeout: Duration::from_millis(500),
            probe_fanout: 2,
            missed_probe_threshold: 3,
            final_check_window: Duration::from_secs(2),
            final_check_attempts: 2,
            final_check_timeout: Duration::from_secs(1),
        }
    }
}

/// Transport tuning
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Bind address for the TCP messenger
    pub bind_address: SocketAddr,
    /// Largest accepted wire frame
    pub max_frame_size: usize,
    /// Inbound queue depth per process
    pub inbound_buffer: usize,
    /// Timeout for establishing an outbound connection
    pub connect_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:0".parse().expect("static addr"),
            max_frame_size: 1024 * 1024,
            inbound_buffer: 256,
            connect_timeout: Duration::from_secs(5),
        }
    }
}
