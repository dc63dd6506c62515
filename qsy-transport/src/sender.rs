//! Outbound worker: drains one FIFO of commands onto the node streams.
//!
//! The worker owns the write half of every node connection, keyed by
//! physical id. Commands for unknown ids are dropped silently (the node may
//! have just disconnected). A frame that cannot be fully written within the
//! attempt budget is logged and dropped; the node itself stays registered.

use std::collections::HashMap;
use std::io;

use parking_lot::Mutex;
use qsy_core::protocol::PACKET_SIZE;
use qsy_core::{PacketType, PhysicalId, QsyPacket, encode};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::SenderConfig;
use crate::error::{TransportError, TransportResult};

const WORKER: &str = "sender";

enum SenderCommand {
    AddNode {
        physical_id: PhysicalId,
        writer: OwnedWriteHalf,
    },
    RemoveNode {
        physical_id: PhysicalId,
    },
    Send(QsyPacket),
}

/// Cloneable producer side of the outbound queue.
#[derive(Clone)]
pub struct SenderHandle {
    queue: mpsc::UnboundedSender<SenderCommand>,
}

impl SenderHandle {
    /// Queue a packet for delivery. Only command packets are written.
    pub fn send(&self, packet: QsyPacket) {
        if self.queue.send(SenderCommand::Send(packet)).is_err() {
            trace!(physical_id = packet.physical_id(), "sender closed, packet dropped");
        }
    }

    /// Hand the write half of a node connection to the worker.
    pub fn add_node(&self, physical_id: PhysicalId, writer: OwnedWriteHalf) -> TransportResult<()> {
        self.queue
            .send(SenderCommand::AddNode {
                physical_id,
                writer,
            })
            .map_err(|_| TransportError::Closed { worker: WORKER })
    }

    /// Drop the write half of a node connection. No-op for unknown ids.
    pub fn remove_node(&self, physical_id: PhysicalId) {
        let _ = self.queue.send(SenderCommand::RemoveNode { physical_id });
    }
}

/// Owner of the outbound worker.
pub struct Sender {
    handle: SenderHandle,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Sender {
    /// Spawn the worker.
    pub fn spawn(config: SenderConfig) -> Self {
        let (queue, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(send_loop(rx, config, shutdown.clone()));

        Self {
            handle: SenderHandle { queue },
            shutdown,
            task: Mutex::new(Some(task)),
        }
    }

    /// Producer handle.
    pub fn handle(&self) -> SenderHandle {
        self.handle.clone()
    }

    /// Queue a packet for delivery.
    pub fn send(&self, packet: QsyPacket) {
        self.handle.send(packet);
    }

    /// See [`SenderHandle::add_node`].
    pub fn add_node(&self, physical_id: PhysicalId, writer: OwnedWriteHalf) -> TransportResult<()> {
        self.handle.add_node(physical_id, writer)
    }

    /// See [`SenderHandle::remove_node`].
    pub fn remove_node(&self, physical_id: PhysicalId) {
        self.handle.remove_node(physical_id);
    }

    /// Stop the worker and wait for it to exit, dropping every write half.
    /// Idempotent.
    pub async fn close(&self) {
        self.shutdown.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "sender ended abnormally");
            }
        }
    }
}

impl Drop for Sender {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn send_loop(
    mut queue: mpsc::UnboundedReceiver<SenderCommand>,
    config: SenderConfig,
    shutdown: CancellationToken,
) {
    let mut writers: HashMap<PhysicalId, OwnedWriteHalf> = HashMap::new();

    loop {
        let command = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            command = queue.recv() => match command {
                Some(command) => command,
                None => break,
            },
        };

        match command {
            SenderCommand::AddNode {
                physical_id,
                writer,
            } => {
                writers.insert(physical_id, writer);
            }
            SenderCommand::RemoveNode { physical_id } => {
                if let Some(mut writer) = writers.remove(&physical_id) {
                    let _ = writer.shutdown().await;
                    debug!(physical_id, "node writer removed");
                }
            }
            SenderCommand::Send(packet) => {
                if packet.kind() != PacketType::Command {
                    warn!(%packet, "sender only writes command packets");
                    continue;
                }
                let physical_id = packet.physical_id();
                let Some(writer) = writers.get_mut(&physical_id) else {
                    trace!(physical_id, "no connection for command, dropped");
                    continue;
                };
                let frame = encode(&packet);
                match write_frame(writer, &frame, &config).await {
                    Ok(()) => trace!(physical_id, %packet, "command written"),
                    Err(e) => warn!(physical_id, error = %e, "command dropped"),
                }
            }
        }
    }

    debug!(open_writers = writers.len(), "sender stopped");
}

/// Write one frame, retrying partial or timed-out writes within the budget.
async fn write_frame(
    writer: &mut OwnedWriteHalf,
    frame: &[u8; PACKET_SIZE],
    config: &SenderConfig,
) -> io::Result<()> {
    let mut written = 0;
    let mut attempts = 0;

    while written < frame.len() {
        if attempts >= config.max_write_attempts {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!(
                    "wrote {} of {} bytes in {} attempts",
                    written, PACKET_SIZE, attempts
                ),
            ));
        }
        attempts += 1;

        match tokio::time::timeout(config.write_timeout, writer.write(&frame[written..])).await {
            Ok(Ok(0)) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(Ok(n)) => written += n,
            Ok(Err(e))
                if matches!(
                    e.kind(),
                    io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
                ) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {}
        }
    }

    Ok(())
}
