//! Terminal tests against fake nodes on loopback.
//!
//! A fake node binds a TCP listener on the terminal's node port, announces
//! itself with a unicast Hello to the discovery socket and then speaks the
//! 16-byte frame protocol on the accepted control connection.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use qsy::{
    Color, CommandArgs, DiscoveryConfig, ExecutionId, ExecutorConfig, ExternalEvent,
    InterruptionReason, KeepAliveConfig, NodeConfiguration, PacketType, PhysicalId,
    PlayerExecution, QsyPacket, Routine, Step, Subscription, Terminal, TerminalConfig,
    TerminalError, ToucheArgs, decode, encode,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(3);

struct FakeNode {
    physical_id: PhysicalId,
    ip: Ipv4Addr,
    listener: TcpListener,
    udp: UdpSocket,
    stream: Option<TcpStream>,
}

impl FakeNode {
    async fn listen(physical_id: PhysicalId, ip: Ipv4Addr, port: u16) -> Self {
        let listener = TcpListener::bind((ip, port)).await.expect("bind node port");
        let udp = UdpSocket::bind((ip, 0)).await.expect("bind node udp");
        Self {
            physical_id,
            ip,
            listener,
            udp,
            stream: None,
        }
    }

    fn port(&self) -> u16 {
        self.listener.local_addr().expect("local addr").port()
    }

    fn address(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(self.ip), self.port())
    }

    async fn announce(&self, discovery: SocketAddr) {
        let hello = encode(&QsyPacket::new(PacketType::Hello, self.physical_id));
        self.udp.send_to(&hello, discovery).await.expect("send hello");
    }

    async fn accept(&mut self) {
        let (stream, _) = timeout(WAIT, self.listener.accept())
            .await
            .expect("terminal did not connect")
            .expect("accept");
        self.stream = Some(stream);
    }

    fn stream(&mut self) -> &mut TcpStream {
        self.stream.as_mut().expect("node not connected")
    }

    async fn write(&mut self, packet: QsyPacket) {
        let frame = encode(&packet);
        self.stream().write_all(&frame).await.expect("write frame");
    }

    async fn touch(&mut self, step: u16, color: Color) {
        let packet = QsyPacket::new(PacketType::Touche, self.physical_id)
            .with_color(color)
            .with_step(step);
        self.write(packet).await;
    }

    async fn heartbeat(&mut self) {
        self.write(QsyPacket::new(PacketType::Keepalive, self.physical_id))
            .await;
    }

    async fn read_command(&mut self) -> QsyPacket {
        let ip = IpAddr::V4(self.ip);
        let mut frame = [0u8; 16];
        timeout(WAIT, self.stream().read_exact(&mut frame))
            .await
            .expect("no command received")
            .expect("read frame");
        decode(&frame, ip).expect("valid frame")
    }

    /// Next command that lights the node for a step.
    async fn read_step_command(&mut self) -> QsyPacket {
        loop {
            let packet = self.read_command().await;
            if packet.step() != 0 && !packet.color().is_off() {
                return packet;
            }
        }
    }

    fn disconnect(&mut self) {
        self.stream = None;
    }
}

fn config(node_port: u16) -> TerminalConfig {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    TerminalConfig::default()
        .with_node_port(node_port)
        .with_connect_timeout(Duration::from_millis(500))
        .with_discovery(DiscoveryConfig::unicast(SocketAddr::from((
            Ipv4Addr::LOCALHOST,
            0,
        ))))
        .with_keepalive(KeepAliveConfig::default().with_interval(Duration::from_secs(10)))
        .with_executor(ExecutorConfig::default().with_pre_init(vec![]))
}

async fn next(events: &mut Subscription<ExternalEvent>) -> ExternalEvent {
    timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event bus closed")
}

async fn wait_for(
    events: &mut Subscription<ExternalEvent>,
    matches: impl Fn(&ExternalEvent) -> bool,
) -> ExternalEvent {
    loop {
        let event = next(events).await;
        if matches(&event) {
            return event;
        }
    }
}

async fn connect(terminal: &Terminal, events: &mut Subscription<ExternalEvent>, node: &mut FakeNode) {
    let discovery = terminal.discovery_address().await.expect("terminal running");
    node.announce(discovery).await;
    node.accept().await;

    let event = wait_for(events, |e| matches!(e, ExternalEvent::ConnectedNode { .. })).await;
    assert_eq!(
        event,
        ExternalEvent::ConnectedNode {
            physical_id: node.physical_id,
            address: node.address(),
        }
    );
}

/// Terminal with discovery open and `nodes` connected.
async fn running(nodes: &mut [&mut FakeNode]) -> (Terminal, Subscription<ExternalEvent>) {
    let terminal = Terminal::new(config(nodes[0].port()));
    let mut events = terminal.subscribe();
    terminal.start().await.expect("start");
    terminal.search_nodes().await.expect("search");
    for node in nodes.iter_mut() {
        connect(&terminal, &mut events, node).await;
    }
    (terminal, events)
}

fn single_node_routine() -> Routine {
    Routine {
        players_count: 1,
        number_of_nodes: 1,
        total_timeout: 0,
        name: "single".to_string(),
        steps: vec![Step::new(
            "0",
            0,
            false,
            vec![NodeConfiguration::new(0, 0, Color::YELLOW)],
        )],
    }
}

#[tokio::test]
async fn test_lifecycle() {
    let terminal = Terminal::new(config(3000));
    let mut events = terminal.subscribe();

    assert_eq!(terminal.connected_nodes().await, 0);
    assert!(matches!(
        terminal.search_nodes().await,
        Err(TerminalError::NotRunning)
    ));

    terminal.start().await.expect("start");
    terminal.start().await.expect("second start is a no-op");
    assert!(terminal.is_running().await);
    let discovery = terminal.discovery_address().await.expect("bound");
    assert_ne!(discovery.port(), 0);
    assert_eq!(terminal.connected_nodes().await, 0);

    terminal.close().await;
    terminal.close().await;
    assert!(!terminal.is_running().await);
    assert_eq!(terminal.discovery_address().await, None);

    terminal.start().await.expect("start after close is a no-op");
    assert!(!terminal.is_running().await);
    assert!(matches!(
        terminal
            .send_command(CommandArgs::new(1, Color::RED, 0, 0))
            .await,
        Err(TerminalError::Closed)
    ));

    let end = timeout(WAIT, events.recv()).await.expect("subscription ended");
    assert_eq!(end, None);
}

#[tokio::test]
async fn test_start_failure_tears_down() {
    let taken = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0))
        .await
        .expect("bind");
    let address = taken.local_addr().expect("addr");

    let terminal = Terminal::new(config(3000).with_discovery(DiscoveryConfig::unicast(address)));
    let result = terminal.start().await;
    assert!(matches!(result, Err(TerminalError::Transport(_))));
    assert!(!terminal.is_running().await);
}

#[tokio::test]
async fn test_discovery_window_gates_connections() {
    let mut node = FakeNode::listen(7, Ipv4Addr::LOCALHOST, 0).await;
    let terminal = Terminal::new(config(node.port()));
    let mut events = terminal.subscribe();
    terminal.start().await.expect("start");

    let discovery = terminal.discovery_address().await.expect("running");
    node.announce(discovery).await;
    assert!(
        timeout(Duration::from_millis(300), node.listener.accept())
            .await
            .is_err(),
        "connected while discovery was closed"
    );

    terminal.search_nodes().await.expect("search");
    connect(&terminal, &mut events, &mut node).await;
    assert_eq!(terminal.connected_node_ids().await, vec![7]);
    assert_eq!(terminal.connected_nodes().await, 1);

    // A repeated Hello does not open a second connection.
    node.announce(discovery).await;
    assert!(
        timeout(Duration::from_millis(300), node.listener.accept())
            .await
            .is_err()
    );

    terminal.finalize_nodes_searching().await.expect("finalize");
    terminal.close().await;
}

#[tokio::test]
async fn test_touche_is_published() {
    let mut node = FakeNode::listen(7, Ipv4Addr::LOCALHOST, 0).await;
    let (terminal, mut events) = running(&mut [&mut node]).await;

    node.touch(0, Color::BLUE).await;
    let event = wait_for(&mut events, |e| matches!(e, ExternalEvent::Touche(_))).await;
    assert_eq!(
        event,
        ExternalEvent::Touche(ToucheArgs {
            physical_id: 7,
            delay: 0,
            color: Color::BLUE,
        })
    );

    terminal.close().await;
}

#[tokio::test]
async fn test_send_command_reaches_node() {
    let mut node = FakeNode::listen(7, Ipv4Addr::LOCALHOST, 0).await;
    let (terminal, _events) = running(&mut [&mut node]).await;

    let queued = terminal
        .send_command(CommandArgs::new(7, Color::RED, 120, 0).with_touch(true))
        .await
        .expect("send");
    assert!(queued);

    let command = node.read_command().await;
    assert_eq!(command.kind(), PacketType::Command);
    assert_eq!(command.physical_id(), 7);
    assert_eq!(command.color(), Color::RED);
    assert_eq!(command.delay(), 120);
    assert!(command.touch_enabled());
    assert!(!command.sound_enabled());

    let invalid = terminal
        .send_command(CommandArgs::new(70_000, Color::RED, 0, 0))
        .await;
    assert!(matches!(invalid, Err(TerminalError::Wire(_))));

    // Unknown nodes are accepted and dropped by the sender.
    assert!(terminal
        .send_command(CommandArgs::new(99, Color::RED, 0, 0))
        .await
        .expect("send"));

    terminal.close().await;
}

#[tokio::test]
async fn test_socket_close_disconnects_and_rediscovers() {
    let mut node = FakeNode::listen(7, Ipv4Addr::LOCALHOST, 0).await;
    let (terminal, mut events) = running(&mut [&mut node]).await;

    node.disconnect();
    let event = wait_for(&mut events, |e| {
        matches!(e, ExternalEvent::DisconnectedNode { .. })
    })
    .await;
    assert_eq!(
        event,
        ExternalEvent::DisconnectedNode {
            physical_id: 7,
            address: node.address(),
        }
    );
    assert_eq!(terminal.connected_nodes().await, 0);

    // The discovery window is still open and the id was released.
    connect(&terminal, &mut events, &mut node).await;
    assert_eq!(terminal.connected_node_ids().await, vec![7]);

    terminal.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_silent_node_is_disconnected() {
    let mut node = FakeNode::listen(7, Ipv4Addr::LOCALHOST, 0).await;
    let config = config(node.port()).with_keepalive(
        KeepAliveConfig::default()
            .with_interval(Duration::from_millis(40))
            .with_max_misses(2),
    );
    let terminal = Terminal::new(config);
    let mut events = terminal.subscribe();
    terminal.start().await.expect("start");
    terminal.search_nodes().await.expect("search");
    connect(&terminal, &mut events, &mut node).await;

    // Heartbeats keep it registered.
    for _ in 0..30 {
        node.heartbeat().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    while let Some(event) = events.try_recv() {
        assert!(
            !matches!(event, ExternalEvent::DisconnectedNode { .. }),
            "node with heartbeats was disconnected"
        );
    }
    assert_eq!(terminal.connected_nodes().await, 1);

    // Silence gets it removed and its socket closed.
    let event = wait_for(&mut events, |e| {
        matches!(e, ExternalEvent::DisconnectedNode { .. })
    })
    .await;
    assert!(matches!(
        event,
        ExternalEvent::DisconnectedNode { physical_id: 7, .. }
    ));

    let mut buffer = [0u8; 16];
    let read = timeout(WAIT, node.stream().read(&mut buffer))
        .await
        .expect("socket not closed");
    assert!(matches!(read, Ok(0) | Err(_)));

    terminal.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_two_node_routine() {
    let mut a = FakeNode::listen(1, Ipv4Addr::LOCALHOST, 0).await;
    let mut b = FakeNode::listen(2, Ipv4Addr::new(127, 0, 0, 2), a.port()).await;
    let (terminal, mut events) = running(&mut [&mut a, &mut b]).await;

    let routine = Routine {
        players_count: 1,
        number_of_nodes: 2,
        total_timeout: 0,
        name: "or-then-and".to_string(),
        steps: vec![
            Step::new(
                "0|1",
                0,
                false,
                vec![
                    NodeConfiguration::new(0, 0, Color::RED),
                    NodeConfiguration::new(1, 0, Color::RED),
                ],
            ),
            Step::new(
                "0&1",
                300,
                true,
                vec![
                    NodeConfiguration::new(0, 0, Color::GREEN),
                    NodeConfiguration::new(1, 0, Color::GREEN),
                ],
            ),
        ],
    };

    let execution = terminal
        .start_custom_routine(routine)
        .await
        .expect("routine accepted");
    assert_eq!(
        wait_for(&mut events, |e| matches!(e, ExternalEvent::ExecutionStarted { .. })).await,
        ExternalEvent::ExecutionStarted { execution }
    );

    let first = a.read_step_command().await;
    assert_eq!(first.color(), Color::RED);
    assert_eq!(b.read_step_command().await.step(), first.step());

    // Nodes in a routine are not available to other callers.
    let queued = terminal
        .send_command(CommandArgs::new(1, Color::WHITE, 0, 0))
        .await
        .expect("send");
    assert!(!queued);

    a.touch(first.step(), Color::RED).await;
    let second = a.read_step_command().await;
    assert_eq!(second.color(), Color::GREEN);
    assert_ne!(second.step(), first.step());
    assert_eq!(b.read_step_command().await.step(), second.step());

    a.touch(second.step(), Color::GREEN).await;
    assert_eq!(
        wait_for(&mut events, |e| matches!(e, ExternalEvent::StepTimeOut { .. })).await,
        ExternalEvent::StepTimeOut { execution, step: 2 }
    );
    assert_eq!(
        next(&mut events).await,
        ExternalEvent::ExecutionFinished { execution }
    );

    // B was never touched in step 2 and is turned off.
    loop {
        let packet = b.read_command().await;
        if packet.color().is_off() {
            assert_eq!(packet.step(), 0);
            break;
        }
    }

    assert!(terminal
        .send_command(CommandArgs::new(1, Color::WHITE, 0, 0))
        .await
        .expect("send"));
    terminal.close().await;
}

#[tokio::test]
async fn test_rejected_executions() {
    let mut node = FakeNode::listen(7, Ipv4Addr::LOCALHOST, 0).await;
    let (terminal, _events) = running(&mut [&mut node]).await;

    let mut too_big = single_node_routine();
    too_big.number_of_nodes = 2;
    too_big.steps[0].expression = "0|1".to_string();
    too_big.steps[0]
        .node_configurations
        .push(NodeConfiguration::new(1, 0, Color::YELLOW));
    assert!(matches!(
        terminal.start_custom_routine(too_big).await,
        Err(TerminalError::NotEnoughNodes {
            required: 2,
            connected: 1
        })
    ));

    let mut broken = single_node_routine();
    broken.steps[0].expression = "0&".to_string();
    assert!(matches!(
        terminal.start_custom_routine(broken).await,
        Err(TerminalError::InvalidExecution(_))
    ));

    let no_players = PlayerExecution {
        node_count: 1,
        players: vec![],
        wait_for_all: false,
        step_delay: 0,
        step_timeout: 0,
        stop_on_timeout: false,
        step_count: 1,
        execution_timeout: 0,
    };
    assert!(matches!(
        terminal.start_player_execution(no_players).await,
        Err(TerminalError::InvalidExecution(_))
    ));

    assert!(!terminal.stop_routine().await.expect("stop"));
    terminal.close().await;
}

#[tokio::test]
async fn test_stop_and_replace_routine() {
    let mut node = FakeNode::listen(7, Ipv4Addr::LOCALHOST, 0).await;
    let (terminal, mut events) = running(&mut [&mut node]).await;

    let first = terminal
        .start_custom_routine(single_node_routine())
        .await
        .expect("start");
    assert_eq!(
        next(&mut events).await,
        ExternalEvent::ExecutionStarted { execution: first }
    );
    assert!(terminal.stop_routine().await.expect("stop"));
    assert_eq!(
        next(&mut events).await,
        ExternalEvent::ExecutionInterrupted {
            execution: first,
            reason: InterruptionReason::RoutineStopped,
        }
    );
    assert!(!terminal.stop_routine().await.expect("stop"));

    let second = terminal
        .start_custom_routine(single_node_routine())
        .await
        .expect("start");
    assert_eq!(
        next(&mut events).await,
        ExternalEvent::ExecutionStarted { execution: second }
    );
    let third = terminal
        .start_custom_routine(single_node_routine())
        .await
        .expect("start");
    assert_ne!(second, third);
    assert_eq!(
        next(&mut events).await,
        ExternalEvent::ExecutionInterrupted {
            execution: second,
            reason: InterruptionReason::NewRoutineStarted,
        }
    );
    assert_eq!(
        next(&mut events).await,
        ExternalEvent::ExecutionStarted { execution: third }
    );

    // Losing a node of the routine interrupts it before the node is reported.
    node.disconnect();
    assert_eq!(
        next(&mut events).await,
        ExternalEvent::ExecutionInterrupted {
            execution: third,
            reason: InterruptionReason::DisconnectedNode,
        }
    );
    assert!(matches!(
        next(&mut events).await,
        ExternalEvent::DisconnectedNode { physical_id: 7, .. }
    ));

    terminal.close().await;
}

#[tokio::test]
async fn test_close_interrupts_routine() {
    let mut node = FakeNode::listen(7, Ipv4Addr::LOCALHOST, 0).await;
    let (terminal, mut events) = running(&mut [&mut node]).await;

    let execution = terminal
        .start_custom_routine(single_node_routine())
        .await
        .expect("start");
    assert_eq!(
        next(&mut events).await,
        ExternalEvent::ExecutionStarted { execution }
    );

    terminal.close().await;
    assert_eq!(
        next(&mut events).await,
        ExternalEvent::ExecutionInterrupted {
            execution,
            reason: InterruptionReason::Closed,
        }
    );
    let end = timeout(WAIT, events.recv()).await.expect("subscription ended");
    assert_eq!(end, None);
}

#[tokio::test]
async fn test_player_execution() {
    let mut node = FakeNode::listen(7, Ipv4Addr::LOCALHOST, 0).await;
    let (terminal, mut events) = running(&mut [&mut node]).await;

    let execution = terminal
        .start_player_execution(PlayerExecution {
            node_count: 1,
            players: vec![Color::MAGENTA],
            wait_for_all: false,
            step_delay: 0,
            step_timeout: 0,
            stop_on_timeout: false,
            step_count: 1,
            execution_timeout: 0,
        })
        .await
        .expect("start");
    assert_eq!(execution, ExecutionId(1));
    assert_eq!(
        next(&mut events).await,
        ExternalEvent::ExecutionStarted { execution }
    );

    let command = node.read_step_command().await;
    assert_eq!(command.color(), Color::MAGENTA);
    node.touch(command.step(), Color::MAGENTA).await;

    assert!(matches!(next(&mut events).await, ExternalEvent::Touche(_)));
    assert_eq!(
        next(&mut events).await,
        ExternalEvent::ExecutionFinished { execution }
    );

    terminal.close().await;
}
