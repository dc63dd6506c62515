//! Discovery worker: receives Hello datagrams from the multicast group.
//!
//! The worker only publishes while discovery is open (see
//! [`MulticastReceiver::accept_packets`]) and reports each physical id once
//! until the id is released with [`MulticastReceiver::remove_node`] or
//! [`MulticastReceiver::reset`].
//!
//! A failed receive is reported as a `WorkerError` and retried after
//! `DiscoveryConfig::error_backoff`. After `max_receive_errors` failures in a
//! row the worker stops.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use qsy_core::{InternalEvent, PacketType, PhysicalId, Publisher, TimeProvider, decode};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::DiscoveryConfig;
use crate::error::TransportResult;

const WORKER: &str = "multicast-receiver";

/// Datagrams longer than a frame are read far enough to be rejected by length.
const RECV_BUFFER: usize = 64;

/// State shared between the handle and the receive loop.
#[derive(Default)]
struct DiscoveryState {
    accepting: AtomicBool,
    reported: Mutex<HashSet<PhysicalId>>,
}

/// Handle to the running discovery worker.
pub struct MulticastReceiver {
    local_addr: SocketAddr,
    state: Arc<DiscoveryState>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MulticastReceiver {
    /// Bind the discovery socket described by `config` and start receiving.
    ///
    /// Discovery starts closed; call `accept_packets(true)` to open it.
    pub async fn bind<T: TimeProvider>(
        config: &DiscoveryConfig,
        time: T,
        publisher: Publisher<InternalEvent>,
    ) -> TransportResult<Self> {
        let socket = UdpSocket::bind(config.bind_address).await?;
        if let Some(group) = config.multicast_group {
            socket.join_multicast_v4(group, config.interface)?;
            info!(%group, interface = %config.interface, "joined discovery group");
        }
        Self::from_socket(socket, config, time, publisher)
    }

    /// Start the worker on an already bound socket.
    ///
    /// Only the error handling settings of `config` apply; the socket is used
    /// as given.
    pub fn from_socket<T: TimeProvider>(
        socket: UdpSocket,
        config: &DiscoveryConfig,
        time: T,
        publisher: Publisher<InternalEvent>,
    ) -> TransportResult<Self> {
        let local_addr = socket.local_addr()?;
        let state = Arc::new(DiscoveryState::default());
        let shutdown = CancellationToken::new();

        let task = tokio::spawn(discovery_loop(
            socket,
            state.clone(),
            ErrorPolicy {
                backoff: config.error_backoff,
                max_errors: config.max_receive_errors,
            },
            time,
            publisher,
            shutdown.clone(),
        ));
        debug!(%local_addr, "discovery worker started");

        Ok(Self {
            local_addr,
            state,
            shutdown,
            task: Mutex::new(Some(task)),
        })
    }

    /// Open or close the discovery window.
    pub fn accept_packets(&self, accept: bool) {
        self.state.accepting.store(accept, Ordering::Release);
        debug!(accept, "discovery window toggled");
    }

    /// Whether Hello datagrams are currently published.
    pub fn is_accepting(&self) -> bool {
        self.state.accepting.load(Ordering::Acquire)
    }

    /// Forget that `physical_id` was reported, so its next Hello is published again.
    pub fn remove_node(&self, physical_id: PhysicalId) {
        self.state.reported.lock().remove(&physical_id);
    }

    /// Forget every reported id.
    pub fn reset(&self) {
        self.state.reported.lock().clear();
    }

    /// Whether the receive loop is still running.
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Address the discovery socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop the worker and wait for it to exit. Idempotent.
    pub async fn close(&self) {
        self.shutdown.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "discovery worker ended abnormally");
            }
        }
    }
}

impl Drop for MulticastReceiver {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct ErrorPolicy {
    backoff: Duration,
    max_errors: u32,
}

async fn discovery_loop<T: TimeProvider>(
    socket: UdpSocket,
    state: Arc<DiscoveryState>,
    policy: ErrorPolicy,
    time: T,
    publisher: Publisher<InternalEvent>,
    shutdown: CancellationToken,
) {
    let mut buffer = [0u8; RECV_BUFFER];
    let mut consecutive_errors = 0u32;

    loop {
        let received = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = socket.recv_from(&mut buffer) => received,
        };

        let (size, from) = match received {
            Ok(received) => {
                consecutive_errors = 0;
                received
            }
            Err(e) => {
                consecutive_errors += 1;
                warn!(error = %e, consecutive_errors, "discovery receive failed");
                publisher.publish(InternalEvent::WorkerError {
                    worker: WORKER,
                    message: e.to_string(),
                });
                if consecutive_errors >= policy.max_errors {
                    error!(consecutive_errors, "discovery socket keeps failing, stopping worker");
                    break;
                }
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = time.sleep(policy.backoff) => {}
                }
                continue;
            }
        };

        if !state.accepting.load(Ordering::Acquire) {
            continue;
        }

        let packet = match decode(&buffer[..size], from.ip()) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(%from, error = %e, "dropping malformed discovery datagram");
                continue;
            }
        };

        if packet.kind() != PacketType::Hello {
            trace!(%from, kind = ?packet.kind(), "ignoring non-hello datagram");
            continue;
        }

        if state.reported.lock().insert(packet.physical_id()) {
            debug!(physical_id = packet.physical_id(), %from, "node discovered");
            publisher.publish(InternalEvent::IncomingPacket(packet));
        }
    }

    debug!("discovery worker stopped");
}
