//! Terminal configuration.

use std::time::Duration;

use qsy_core::protocol::TCP_PORT;
use qsy_routine::ExecutorConfig;
use qsy_transport::{DiscoveryConfig, KeepAliveConfig, SenderConfig};

/// Everything needed to start a [`crate::Terminal`].
#[derive(Clone, Debug)]
pub struct TerminalConfig {
    /// TCP port every node listens on for the control connection.
    pub node_port: u16,

    /// Upper bound on opening the control connection after a Hello.
    pub connect_timeout: Duration,

    /// Discovery socket.
    pub discovery: DiscoveryConfig,

    /// Liveness monitor.
    pub keepalive: KeepAliveConfig,

    /// Outbound writer.
    pub sender: SenderConfig,

    /// Routine executors.
    pub executor: ExecutorConfig,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            node_port: TCP_PORT,
            connect_timeout: Duration::from_secs(2),
            discovery: DiscoveryConfig::default(),
            keepalive: KeepAliveConfig::default(),
            sender: SenderConfig::default(),
            executor: ExecutorConfig::default(),
        }
    }
}

impl TerminalConfig {
    /// Set the node control port.
    pub fn with_node_port(mut self, node_port: u16) -> Self {
        self.node_port = node_port;
        self
    }

    /// Set the connection timeout.
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Replace the discovery configuration.
    pub fn with_discovery(mut self, discovery: DiscoveryConfig) -> Self {
        self.discovery = discovery;
        self
    }

    /// Replace the liveness configuration.
    pub fn with_keepalive(mut self, keepalive: KeepAliveConfig) -> Self {
        self.keepalive = keepalive;
        self
    }

    /// Replace the sender configuration.
    pub fn with_sender(mut self, sender: SenderConfig) -> Self {
        self.sender = sender;
        self
    }

    /// Replace the executor configuration.
    pub fn with_executor(mut self, executor: ExecutorConfig) -> Self {
        self.executor = executor;
        self
    }
}
