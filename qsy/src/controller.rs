//! The terminal's dispatch task.
//!
//! ```text
//!  Terminal API ──ControlRequest──┐
//!                                 ▼
//!  workers ───InternalEvent──► controller ───ExternalEvent──► subscribers
//!                                 │
//!             node registry, workers, active executor
//! ```
//!
//! A single task owns the node registry, the worker handles and the active
//! executor. API calls reach it as [`ControlRequest`]s answered over oneshot
//! channels, worker output arrives on the internal bus, and outbound TCP
//! connects run on their own tasks and report back through a channel. Every
//! mutation of terminal state therefore happens on this one task.

use std::collections::HashSet;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use qsy_core::{
    CommandArgs, EventBus, ExecutionEvent, ExecutionId, InternalEvent, PacketType, PhysicalId,
    Publisher, QsyPacket, Subscription, TimeProvider, TokioTimeProvider,
};
use qsy_routine::{
    CommandSink, Executor, ExecutorContext, NodeAssociation, PlayerExecution, Routine, StepCounter,
};
use qsy_transport::{
    KeepAlive, MulticastReceiver, Receiver, Sender, SenderHandle, TransportResult,
};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::TerminalConfig;
use crate::error::{TerminalError, TerminalResult};
use crate::events::{ExternalEvent, InterruptionReason, ToucheArgs};
use crate::node::{Node, NodeRegistry};

/// Calls from the terminal handle into the controller.
pub(crate) enum ControlRequest {
    SearchNodes {
        accept: bool,
        reply: oneshot::Sender<()>,
    },
    SendCommand {
        args: CommandArgs,
        reply: oneshot::Sender<TerminalResult<bool>>,
    },
    StartRoutine {
        routine: Box<Routine>,
        reply: oneshot::Sender<TerminalResult<ExecutionId>>,
    },
    StartPlayer {
        execution: PlayerExecution,
        reply: oneshot::Sender<TerminalResult<ExecutionId>>,
    },
    StopRoutine {
        reply: oneshot::Sender<bool>,
    },
    ConnectedNodes {
        reply: oneshot::Sender<Vec<PhysicalId>>,
    },
}

/// Outcome of a connect attempt triggered by a Hello.
struct Connection {
    physical_id: PhysicalId,
    address: SocketAddr,
    result: io::Result<TcpStream>,
}

/// Executor command port backed by the sender queue.
struct NodeCommands(SenderHandle);

impl CommandSink for NodeCommands {
    fn command(&self, packet: QsyPacket) {
        self.0.send(packet);
    }
}

/// Running workers and the bus they publish on.
struct Workers {
    internal: EventBus<InternalEvent>,
    multicast: MulticastReceiver,
    receiver: Receiver,
    sender: Sender,
    keepalive: KeepAlive<TokioTimeProvider>,
}

impl Workers {
    /// Start every worker. Workers already running are closed again if a
    /// later one fails to start.
    async fn start(
        config: &TerminalConfig,
        time: &TokioTimeProvider,
    ) -> TerminalResult<(Self, Subscription<InternalEvent>)> {
        let internal = EventBus::new("internal");
        let events = internal.subscribe();

        let receiver = Receiver::spawn(internal.publisher());
        let sender = Sender::spawn(config.sender.clone());
        let keepalive = KeepAlive::spawn(
            config.keepalive.clone(),
            time.clone(),
            internal.publisher(),
        );

        let multicast = match MulticastReceiver::bind(
            &config.discovery,
            time.clone(),
            internal.publisher(),
        )
        .await
        {
            Ok(multicast) => multicast,
            Err(e) => {
                error!(error = %e, bind = %config.discovery.bind_address, "discovery socket failed, tearing down");
                receiver.close().await;
                sender.close().await;
                keepalive.close().await;
                internal.close();
                return Err(e.into());
            }
        };

        Ok((
            Self {
                internal,
                multicast,
                receiver,
                sender,
                keepalive,
            },
            events,
        ))
    }
}

/// Handle the terminal keeps on a running controller.
pub(crate) struct ControllerHandle {
    pub(crate) requests: mpsc::UnboundedSender<ControlRequest>,
    pub(crate) discovery_address: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl ControllerHandle {
    /// Tear the controller down and wait until it is gone.
    pub(crate) async fn stop(self) {
        self.shutdown.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "controller ended abnormally");
        }
    }

    /// Ask the controller to tear down without waiting.
    pub(crate) fn cancel(&self) {
        self.shutdown.cancel();
    }
}

pub(crate) struct Controller {
    config: TerminalConfig,
    time: TokioTimeProvider,
    workers: Workers,
    external: Publisher<ExternalEvent>,
    nodes: NodeRegistry,
    connecting: HashSet<PhysicalId>,
    connections: mpsc::UnboundedSender<Connection>,
    executor: Option<Executor<TokioTimeProvider>>,
    /// Executors that finished on their own but were replaced before their
    /// `Finished` event was dispatched.
    retired: HashSet<ExecutionId>,
    counter: StepCounter,
    last_execution: u64,
}

impl Controller {
    /// Start the workers and spawn the dispatch task.
    pub(crate) async fn spawn(
        config: TerminalConfig,
        external: Publisher<ExternalEvent>,
    ) -> TerminalResult<ControllerHandle> {
        let time = TokioTimeProvider::new();
        let (workers, events) = Workers::start(&config, &time).await?;
        let discovery_address = workers.multicast.local_addr();

        let (requests, requests_rx) = mpsc::unbounded_channel();
        let (connections, connections_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let controller = Self {
            config,
            time,
            workers,
            external,
            nodes: NodeRegistry::default(),
            connecting: HashSet::new(),
            connections,
            executor: None,
            retired: HashSet::new(),
            counter: StepCounter::new(),
            last_execution: 0,
        };
        let task = tokio::spawn(controller.run(
            requests_rx,
            connections_rx,
            events,
            shutdown.clone(),
        ));

        Ok(ControllerHandle {
            requests,
            discovery_address,
            shutdown,
            task,
        })
    }

    async fn run(
        mut self,
        mut requests: mpsc::UnboundedReceiver<ControlRequest>,
        mut connections: mpsc::UnboundedReceiver<Connection>,
        mut events: Subscription<InternalEvent>,
        shutdown: CancellationToken,
    ) {
        debug!("controller started");
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(request) = requests.recv() => self.on_request(request),
                Some(connection) = connections.recv() => self.on_connection(connection),
                event = events.recv() => match event {
                    Some(event) => self.on_event(event),
                    None => {
                        error!("internal bus closed unexpectedly");
                        break;
                    }
                },
            }
        }
        self.shut_down().await;
    }

    // =========================================================================
    // API requests
    // =========================================================================

    fn on_request(&mut self, request: ControlRequest) {
        match request {
            ControlRequest::SearchNodes { accept, reply } => {
                self.workers.multicast.accept_packets(accept);
                info!(accept, "node search toggled");
                let _ = reply.send(());
            }
            ControlRequest::SendCommand { args, reply } => {
                let _ = reply.send(self.send_command(&args));
            }
            ControlRequest::StartRoutine { routine, reply } => {
                let _ = reply.send(self.start_custom_routine(*routine));
            }
            ControlRequest::StartPlayer { execution, reply } => {
                let _ = reply.send(self.start_player_execution(execution));
            }
            ControlRequest::StopRoutine { reply } => {
                let _ = reply.send(self.interrupt(InterruptionReason::RoutineStopped));
            }
            ControlRequest::ConnectedNodes { reply } => {
                let _ = reply.send(self.nodes.ids());
            }
        }
    }

    /// Queue a command unless the node belongs to the running executor.
    fn send_command(&self, args: &CommandArgs) -> TerminalResult<bool> {
        let packet = QsyPacket::command(args)?;
        let physical_id = packet.physical_id();

        if let Some(executor) = &self.executor {
            if executor.contains(physical_id) && !executor.is_terminated() {
                debug!(physical_id, execution = %executor.id(), "command suppressed, node is in a routine");
                return Ok(false);
            }
        }

        self.workers.sender.send(packet);
        Ok(true)
    }

    fn start_custom_routine(&mut self, routine: Routine) -> TerminalResult<ExecutionId> {
        routine.validate()?;
        let association = self.associate(routine.number_of_nodes)?;
        let config = self.config.executor.clone();
        info!(name = %routine.name, steps = routine.steps.len(), "starting custom routine");
        Ok(self.launch(association, move |id, association, context| {
            Executor::custom(id, association, routine, config, context)
        }))
    }

    fn start_player_execution(&mut self, execution: PlayerExecution) -> TerminalResult<ExecutionId> {
        execution.validate()?;
        let association = self.associate(execution.node_count)?;
        let config = self.config.executor.clone();
        info!(
            players = execution.players.len(),
            steps = execution.step_count,
            wait_for_all = execution.wait_for_all,
            "starting player execution"
        );
        Ok(self.launch(association, move |id, association, context| {
            Executor::player(id, association, execution, config, context)
        }))
    }

    /// Bind `required` logical nodes to the lowest connected physical ids.
    fn associate(&self, required: usize) -> TerminalResult<NodeAssociation> {
        NodeAssociation::lowest(self.nodes.ids(), required).ok_or(TerminalError::NotEnoughNodes {
            required,
            connected: self.nodes.len(),
        })
    }

    fn launch<F>(&mut self, association: NodeAssociation, build: F) -> ExecutionId
    where
        F: FnOnce(
            ExecutionId,
            NodeAssociation,
            ExecutorContext<TokioTimeProvider>,
        ) -> Executor<TokioTimeProvider>,
    {
        self.interrupt(InterruptionReason::NewRoutineStarted);

        self.last_execution += 1;
        let id = ExecutionId(self.last_execution);
        let context = ExecutorContext {
            time: self.time.clone(),
            sink: Arc::new(NodeCommands(self.workers.sender.handle())),
            counter: self.counter.clone(),
            publisher: self.workers.internal.publisher(),
        };
        self.executor = Some(build(id, association, context));
        id
    }

    /// Close the active executor. Returns whether one was interrupted.
    fn interrupt(&mut self, reason: InterruptionReason) -> bool {
        let Some(executor) = self.executor.take() else {
            return false;
        };
        if executor.close() {
            info!(execution = %executor.id(), ?reason, "execution interrupted");
            self.external.publish(ExternalEvent::ExecutionInterrupted {
                execution: executor.id(),
                reason,
            });
            true
        } else {
            // Finished on its own; its Finished event is still on the bus.
            self.retired.insert(executor.id());
            false
        }
    }

    // =========================================================================
    // Worker events
    // =========================================================================

    fn on_event(&mut self, event: InternalEvent) {
        match event {
            InternalEvent::IncomingPacket(packet) => self.on_packet(packet),
            InternalEvent::KeepAliveError { physical_id } => {
                warn!(physical_id, "node stopped sending keepalives");
                self.disconnect(physical_id);
            }
            InternalEvent::ConnectionLost { physical_id } => {
                info!(physical_id, "node connection lost");
                self.disconnect(physical_id);
            }
            InternalEvent::Execution(event) => self.on_execution(event),
            InternalEvent::WorkerError { worker, message } => {
                error!(worker, %message, "worker error");
            }
        }
    }

    fn on_packet(&mut self, packet: QsyPacket) {
        match packet.kind() {
            PacketType::Hello => self.on_hello(packet),
            PacketType::Touche => self.on_touche(packet),
            PacketType::Keepalive => self.workers.keepalive.keep_alive(packet.physical_id()),
            PacketType::Command => trace!(%packet, "inbound command ignored"),
        }
    }

    fn on_hello(&mut self, packet: QsyPacket) {
        let physical_id = packet.physical_id();
        if self.nodes.contains(physical_id) || self.connecting.contains(&physical_id) {
            trace!(physical_id, "hello from known node");
            return;
        }
        let Some(ip) = packet.source() else {
            warn!(physical_id, "hello without source address");
            return;
        };

        let address = SocketAddr::new(ip, self.config.node_port);
        self.connecting.insert(physical_id);
        debug!(physical_id, %address, "connecting to node");

        let time = self.time.clone();
        let timeout = self.config.connect_timeout;
        let connections = self.connections.clone();
        tokio::spawn(async move {
            let result = match time.timeout(timeout, TcpStream::connect(address)).await {
                Ok(result) => result,
                Err(_) => Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "node connection timed out",
                )),
            };
            let _ = connections.send(Connection {
                physical_id,
                address,
                result,
            });
        });
    }

    fn on_connection(&mut self, connection: Connection) {
        let Connection {
            physical_id,
            address,
            result,
        } = connection;
        self.connecting.remove(&physical_id);

        let stream = match result {
            Ok(stream) => stream,
            Err(e) => {
                warn!(physical_id, %address, error = %e, "could not connect to node");
                self.workers.multicast.remove_node(physical_id);
                return;
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!(physical_id, error = %e, "TCP_NODELAY not set");
        }

        let (reader, writer) = stream.into_split();
        if let Err(e) = self.register(physical_id, reader, writer) {
            warn!(physical_id, %address, error = %e, "could not register node");
            self.workers.multicast.remove_node(physical_id);
            return;
        }

        self.nodes.insert(Node {
            physical_id,
            address,
        });
        info!(physical_id, %address, connected = self.nodes.len(), "node connected");
        self.external.publish(ExternalEvent::ConnectedNode {
            physical_id,
            address,
        });
    }

    fn register(
        &self,
        physical_id: PhysicalId,
        reader: OwnedReadHalf,
        writer: OwnedWriteHalf,
    ) -> TransportResult<()> {
        self.workers.sender.add_node(physical_id, writer)?;
        if let Err(e) = self.workers.receiver.add_node(physical_id, reader) {
            self.workers.sender.remove_node(physical_id);
            return Err(e);
        }
        self.workers.keepalive.new_node(physical_id);
        Ok(())
    }

    fn on_touche(&mut self, packet: QsyPacket) {
        let physical_id = packet.physical_id();
        if !self.nodes.contains(physical_id) {
            trace!(physical_id, "touche from unknown node");
            return;
        }

        self.workers.keepalive.touche(physical_id);
        if let Some(executor) = &self.executor {
            executor.touche(physical_id, packet.step(), packet.color());
        }
        self.external.publish(ExternalEvent::Touche(ToucheArgs {
            physical_id,
            delay: packet.delay(),
            color: packet.color(),
        }));
    }

    /// Drop a node from every subsystem, interrupting its routine first.
    fn disconnect(&mut self, physical_id: PhysicalId) {
        let Some(node) = self.nodes.remove(physical_id) else {
            trace!(physical_id, "node already disconnected");
            return;
        };

        if self
            .executor
            .as_ref()
            .is_some_and(|executor| executor.contains(physical_id))
        {
            self.interrupt(InterruptionReason::DisconnectedNode);
        }

        self.workers.keepalive.remove_node(physical_id);
        self.workers.sender.remove_node(physical_id);
        self.workers.receiver.remove_node(physical_id);
        self.workers.multicast.remove_node(physical_id);

        info!(physical_id, address = %node.address, connected = self.nodes.len(), "node disconnected");
        self.external.publish(ExternalEvent::DisconnectedNode {
            physical_id,
            address: node.address,
        });
    }

    fn on_execution(&mut self, event: ExecutionEvent) {
        let execution = event.execution();
        let active = self.executor.as_ref().map(Executor::id) == Some(execution);
        if !active && !self.retired.contains(&execution) {
            trace!(%execution, ?event, "event from a replaced execution dropped");
            return;
        }

        let external = match event {
            ExecutionEvent::Started { execution } => ExternalEvent::ExecutionStarted { execution },
            ExecutionEvent::StepTimeOut { execution, step } => {
                ExternalEvent::StepTimeOut { execution, step }
            }
            ExecutionEvent::Finished { execution } => {
                if active {
                    self.executor = None;
                } else {
                    self.retired.remove(&execution);
                }
                ExternalEvent::ExecutionFinished { execution }
            }
        };
        self.external.publish(external);
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    /// Input workers first, then the executor, then the nodes.
    async fn shut_down(mut self) {
        debug!("controller shutting down");
        self.workers.receiver.close().await;
        self.workers.sender.close().await;
        self.workers.multicast.close().await;
        self.workers.keepalive.close().await;

        self.interrupt(InterruptionReason::Closed);

        for node in self.nodes.drain() {
            debug!(physical_id = node.physical_id, address = %node.address, "node released");
        }
        self.workers.internal.close();
        debug!("controller stopped");
    }
}
