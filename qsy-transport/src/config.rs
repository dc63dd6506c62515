//! Configuration structures for the transport workers.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use qsy_core::protocol::{KEEP_ALIVE_INTERVAL, MULTICAST_GROUP, MULTICAST_PORT};

/// Liveness monitor parameters.
#[derive(Clone, Debug)]
pub struct KeepAliveConfig {
    /// Heartbeat period nodes are expected to keep.
    pub keepalive_interval: Duration,

    /// Slack applied to the interval before a heartbeat counts as missed.
    pub tolerance_factor: f64,

    /// Consecutive missed purge rounds before a node is reported.
    pub max_misses: u32,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: KEEP_ALIVE_INTERVAL,
            tolerance_factor: 1.5,
            max_misses: 5,
        }
    }
}

impl KeepAliveConfig {
    /// Longest silence tolerated between two heartbeats.
    pub fn max_allowed_gap(&self) -> Duration {
        self.keepalive_interval.mul_f64(self.tolerance_factor)
    }

    /// Period of the purge loop: one and a half allowed gaps.
    pub fn purge_period(&self) -> Duration {
        self.max_allowed_gap().mul_f64(1.5)
    }

    /// Override the expected heartbeat period.
    pub fn with_interval(mut self, keepalive_interval: Duration) -> Self {
        self.keepalive_interval = keepalive_interval;
        self
    }

    /// Override the tolerance factor.
    pub fn with_tolerance_factor(mut self, tolerance_factor: f64) -> Self {
        self.tolerance_factor = tolerance_factor;
        self
    }

    /// Override the miss threshold.
    pub fn with_max_misses(mut self, max_misses: u32) -> Self {
        self.max_misses = max_misses;
        self
    }
}

/// Where discovery datagrams are received.
#[derive(Clone, Debug)]
pub struct DiscoveryConfig {
    /// Local address the UDP socket binds to.
    pub bind_address: SocketAddr,

    /// Group to join. `None` keeps a plain unicast socket.
    pub multicast_group: Option<Ipv4Addr>,

    /// Local interface the group is joined on.
    pub interface: Ipv4Addr,

    /// Pause after a failed receive before the next one.
    pub error_backoff: Duration,

    /// Failed receives in a row after which the worker stops.
    pub max_receive_errors: u32,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from((Ipv4Addr::UNSPECIFIED, MULTICAST_PORT)),
            multicast_group: Some(MULTICAST_GROUP),
            interface: Ipv4Addr::UNSPECIFIED,
            error_backoff: Duration::from_millis(100),
            max_receive_errors: 50,
        }
    }
}

impl DiscoveryConfig {
    /// Plain UDP socket on `bind_address`, no group membership.
    pub fn unicast(bind_address: SocketAddr) -> Self {
        Self {
            bind_address,
            multicast_group: None,
            ..Self::default()
        }
    }

    /// Join the default group on a specific interface.
    pub fn with_interface(mut self, interface: Ipv4Addr) -> Self {
        self.interface = interface;
        self
    }

    /// Set the pause after a failed receive.
    pub fn with_error_backoff(mut self, error_backoff: Duration) -> Self {
        self.error_backoff = error_backoff;
        self
    }

    /// Set how many failed receives in a row stop the worker.
    pub fn with_max_receive_errors(mut self, max_receive_errors: u32) -> Self {
        self.max_receive_errors = max_receive_errors;
        self
    }
}

/// Outbound command writer parameters.
#[derive(Clone, Debug)]
pub struct SenderConfig {
    /// Write attempts per frame before the command is dropped.
    pub max_write_attempts: u32,

    /// Upper bound on a single write attempt.
    pub write_timeout: Duration,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            max_write_attempts: 256,
            write_timeout: Duration::from_millis(100),
        }
    }
}
