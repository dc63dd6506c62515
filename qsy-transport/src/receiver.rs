//! Inbound worker: one task multiplexes every node stream.
//!
//! ```text
//!   add_node / remove_node
//!          │
//!          ▼
//!   ┌──────────────┐      ┌──────────────────────────────┐
//!   │ command queue│ ───► │ receive loop                 │
//!   └──────────────┘      │  StreamMap<PhysicalId,       │ ──► IncomingPacket
//!                         │    FramedRead<QsyCodec>>     │ ──► ConnectionLost
//!                         └──────────────────────────────┘
//! ```
//!
//! Registration requests are applied before the next frame is polled, and
//! inserting a stream wakes the loop, so a new node is observed immediately.
//! Only keepalive and touche frames are forwarded; a node stream that ends or
//! fails publishes [`InternalEvent::ConnectionLost`] exactly once.

use std::pin::Pin;

use futures::stream::{self, Stream, StreamExt};
use parking_lot::Mutex;
use qsy_core::{InternalEvent, MalformedPacket, PacketType, PhysicalId, Publisher, QsyPacket};
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::StreamMap;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::codec::QsyCodec;
use crate::error::{TransportError, TransportResult};

const WORKER: &str = "receiver";

enum ReceiverCommand {
    AddNode {
        physical_id: PhysicalId,
        reader: OwnedReadHalf,
    },
    RemoveNode {
        physical_id: PhysicalId,
    },
}

enum NodeItem {
    Frame(Result<QsyPacket, MalformedPacket>),
    Failed(String),
    Closed,
}

type NodeStream = Pin<Box<dyn Stream<Item = NodeItem> + Send>>;

/// Handle to the running receive loop.
pub struct Receiver {
    commands: mpsc::UnboundedSender<ReceiverCommand>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Receiver {
    /// Spawn the receive loop publishing onto `publisher`.
    pub fn spawn(publisher: Publisher<InternalEvent>) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(receive_loop(rx, publisher, shutdown.clone()));

        Self {
            commands,
            shutdown,
            task: Mutex::new(Some(task)),
        }
    }

    /// Start reading frames from a node connection.
    ///
    /// Registering an id that is already present replaces its stream.
    pub fn add_node(&self, physical_id: PhysicalId, reader: OwnedReadHalf) -> TransportResult<()> {
        self.commands
            .send(ReceiverCommand::AddNode {
                physical_id,
                reader,
            })
            .map_err(|_| TransportError::Closed { worker: WORKER })
    }

    /// Stop reading from a node and drop its read half. No-op for unknown ids.
    pub fn remove_node(&self, physical_id: PhysicalId) {
        let _ = self
            .commands
            .send(ReceiverCommand::RemoveNode { physical_id });
    }

    /// Stop the loop and wait for it to exit. Idempotent.
    pub async fn close(&self) {
        self.shutdown.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "receiver ended abnormally");
            }
        }
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn node_stream(physical_id: PhysicalId, reader: OwnedReadHalf) -> TransportResult<NodeStream> {
    let peer = reader.peer_addr()?;
    trace!(physical_id, %peer, "node stream registered");

    let frames = FramedRead::new(reader, QsyCodec::new(peer.ip())).map(|item| match item {
        Ok(frame) => NodeItem::Frame(frame),
        Err(e) => NodeItem::Failed(e.to_string()),
    });
    Ok(frames.chain(stream::once(async { NodeItem::Closed })).boxed())
}

async fn receive_loop(
    mut commands: mpsc::UnboundedReceiver<ReceiverCommand>,
    publisher: Publisher<InternalEvent>,
    shutdown: CancellationToken,
) {
    let mut streams: StreamMap<PhysicalId, NodeStream> = StreamMap::new();

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,

            command = commands.recv() => match command {
                Some(ReceiverCommand::AddNode { physical_id, reader }) => {
                    match node_stream(physical_id, reader) {
                        Ok(stream) => {
                            streams.insert(physical_id, stream);
                        }
                        Err(e) => {
                            warn!(physical_id, error = %e, "cannot read from node");
                            publisher.publish(InternalEvent::ConnectionLost { physical_id });
                        }
                    }
                }
                Some(ReceiverCommand::RemoveNode { physical_id }) => {
                    if streams.remove(&physical_id).is_some() {
                        debug!(physical_id, "node stream removed");
                    }
                }
                None => break,
            },

            Some((physical_id, item)) = streams.next(), if !streams.is_empty() => {
                match item {
                    NodeItem::Frame(Ok(packet)) => match packet.kind() {
                        PacketType::Keepalive | PacketType::Touche => {
                            trace!(physical_id, %packet, "frame received");
                            publisher.publish(InternalEvent::IncomingPacket(packet));
                        }
                        kind => {
                            warn!(physical_id, ?kind, "dropping unexpected frame type");
                        }
                    },
                    NodeItem::Frame(Err(e)) => {
                        warn!(physical_id, error = %e, "dropping malformed frame");
                    }
                    NodeItem::Failed(message) => {
                        warn!(physical_id, error = %message, "node stream failed");
                        streams.remove(&physical_id);
                        publisher.publish(InternalEvent::ConnectionLost { physical_id });
                    }
                    NodeItem::Closed => {
                        debug!(physical_id, "node closed its stream");
                        streams.remove(&physical_id);
                        publisher.publish(InternalEvent::ConnectionLost { physical_id });
                    }
                }
            }
        }
    }

    debug!(open_streams = streams.len(), "receiver stopped");
}
