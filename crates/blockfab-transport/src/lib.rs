#![forbid(unsafe_code)]
//! Connection plumbing shared by the server's uplinks and the user-mode
//! client: bounded-retry connects, framed request/reply I/O, the alt-server
//! registry and the discovery/failover engine.

use std::time::Duration;

pub mod altservers;
pub mod discover;
pub mod error;
pub mod tcp;

pub use altservers::{AltServer, AltServerRegistry, BEST_COUNT_MAX, NUMBER_SERVERS, RTT_WINDOW};
pub use discover::{
    BetterPeer, CurrentPeer, CycleOutcome, Discovery, HungWatch, ImageIdentity, ProbeSchedule,
};
pub use error::TransportError;
pub use tcp::{BlockConnection, ConnReader, ConnWriter};

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Floor for connect/read/write timeouts; the effective timeout is
/// `max(2 * current_rtt, MIN_SOCKET_TIMEOUT)`.
pub const MIN_SOCKET_TIMEOUT: Duration = Duration::from_secs(2);

/// A connection with no traffic for this long is considered dead.
pub const SOCKET_KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(45);

/// Idle interval after which a keepalive is emitted on an uplink.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Maximum connect attempts against one peer.
pub const CONNECT_RETRIES: u32 = 4;

/// Marker RTT recorded in the window after a failed probe, microseconds.
pub const RTT_UNREACHABLE: u64 = 0x7FF_FFFF;

/// Probe cadence in seconds for the three discovery modes.
pub const PROBE_STARTUP: u64 = 4;
pub const PROBE_NORMAL: u64 = 22;
pub const PROBE_PANIC: u64 = 2;

/// Number of one-second ticks the engine stays in startup cadence.
pub const STARTUP_MODE_DURATION: u64 = 120;

/// Panic cycles without any reachable peer before outstanding requests are
/// failed back to the consumer.
pub const PROBE_COUNT_TIMEOUT: u32 = 8;

/// Size of the fixed-offset test read used for RTT measurement. The offset
/// is always zero; a randomized offset would thrash the upstream cache.
pub const RTT_BLOCK_SIZE: u32 = 4096;

/// Effective socket timeout derived from the current server's RTT.
pub fn rtt_timeout(current_rtt_us: u64) -> Duration {
    MIN_SOCKET_TIMEOUT.max(Duration::from_micros(current_rtt_us.saturating_mul(2)))
}
