//! Collaborator-facing terminal API.

use std::net::SocketAddr;

use qsy_core::{CommandArgs, EventBus, ExecutionId, PhysicalId, Subscription};
use qsy_routine::{PlayerExecution, Routine};
use tokio::sync::{Mutex, oneshot};
use tracing::{debug, info};

use crate::config::TerminalConfig;
use crate::controller::{ControlRequest, Controller, ControllerHandle};
use crate::error::{TerminalError, TerminalResult};
use crate::events::ExternalEvent;

enum Lifecycle {
    Stopped,
    Running(ControllerHandle),
    Closed,
}

/// Entry point for driving a set of QSY nodes.
///
/// A terminal starts stopped. [`Terminal::start`] binds the discovery socket
/// and spawns the workers; [`Terminal::search_nodes`] opens the discovery
/// window so announced nodes get connected; routines then run over the
/// connected nodes. [`Terminal::close`] is final: a closed terminal cannot be
/// started again and its subscriptions end.
///
/// # Example
///
/// ```rust,ignore
/// use qsy::{Terminal, TerminalConfig, ExternalEvent};
///
/// let terminal = Terminal::new(TerminalConfig::default());
/// let mut events = terminal.subscribe();
/// terminal.start().await?;
/// terminal.search_nodes().await?;
///
/// while let Some(event) = events.recv().await {
///     if let ExternalEvent::ConnectedNode { physical_id, .. } = event {
///         println!("node {physical_id} connected");
///     }
/// }
/// ```
pub struct Terminal {
    config: TerminalConfig,
    external: EventBus<ExternalEvent>,
    lifecycle: Mutex<Lifecycle>,
}

impl Terminal {
    /// Create a stopped terminal. Must be called inside a tokio runtime.
    pub fn new(config: TerminalConfig) -> Self {
        Self {
            config,
            external: EventBus::new("external"),
            lifecycle: Mutex::new(Lifecycle::Stopped),
        }
    }

    /// Start every worker.
    ///
    /// No-op when already running or closed. If a worker fails to start, the
    /// ones already running are torn down and the error is returned.
    pub async fn start(&self) -> TerminalResult<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if !matches!(*lifecycle, Lifecycle::Stopped) {
            debug!("start ignored, terminal not stopped");
            return Ok(());
        }

        let handle = Controller::spawn(self.config.clone(), self.external.publisher()).await?;
        info!(discovery = %handle.discovery_address, "terminal started");
        *lifecycle = Lifecycle::Running(handle);
        Ok(())
    }

    /// Stop every worker, interrupt the running routine, release the nodes
    /// and end all subscriptions. Idempotent.
    pub async fn close(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        match std::mem::replace(&mut *lifecycle, Lifecycle::Closed) {
            Lifecycle::Running(handle) => handle.stop().await,
            Lifecycle::Stopped => {}
            Lifecycle::Closed => return,
        }
        self.external.close();
        info!("terminal closed");
    }

    /// Whether the workers are running.
    pub async fn is_running(&self) -> bool {
        matches!(*self.lifecycle.lock().await, Lifecycle::Running(_))
    }

    /// Open the discovery window: Hello datagrams from new nodes are
    /// connected until [`Terminal::finalize_nodes_searching`] is called.
    pub async fn search_nodes(&self) -> TerminalResult<()> {
        self.request(|reply| ControlRequest::SearchNodes {
            accept: true,
            reply,
        })
        .await
    }

    /// Close the discovery window.
    pub async fn finalize_nodes_searching(&self) -> TerminalResult<()> {
        self.request(|reply| ControlRequest::SearchNodes {
            accept: false,
            reply,
        })
        .await
    }

    /// Send a light command to a node.
    ///
    /// Returns `Ok(false)` when the node belongs to the running routine; the
    /// routine owns it until it ends.
    ///
    /// # Errors
    ///
    /// [`TerminalError::Wire`] when the arguments do not fit the frame.
    pub async fn send_command(&self, args: CommandArgs) -> TerminalResult<bool> {
        self.request(|reply| ControlRequest::SendCommand { args, reply })
            .await?
    }

    /// Validate and start a designed routine, interrupting any running one.
    pub async fn start_custom_routine(&self, routine: Routine) -> TerminalResult<ExecutionId> {
        self.request(|reply| ControlRequest::StartRoutine {
            routine: Box::new(routine),
            reply,
        })
        .await?
    }

    /// Validate and start a player game, interrupting any running routine.
    pub async fn start_player_execution(
        &self,
        execution: PlayerExecution,
    ) -> TerminalResult<ExecutionId> {
        self.request(|reply| ControlRequest::StartPlayer { execution, reply })
            .await?
    }

    /// Interrupt the running routine. Returns whether one was running.
    pub async fn stop_routine(&self) -> TerminalResult<bool> {
        self.request(|reply| ControlRequest::StopRoutine { reply })
            .await
    }

    /// Number of connected nodes; 0 while the terminal is not running.
    pub async fn connected_nodes(&self) -> usize {
        self.connected_node_ids().await.len()
    }

    /// Ids of the connected nodes in ascending order.
    pub async fn connected_node_ids(&self) -> Vec<PhysicalId> {
        self.request(|reply| ControlRequest::ConnectedNodes { reply })
            .await
            .unwrap_or_default()
    }

    /// Subscribe to terminal events from now on.
    pub fn subscribe(&self) -> Subscription<ExternalEvent> {
        self.external.subscribe()
    }

    /// Address the discovery socket is bound to, while running.
    pub async fn discovery_address(&self) -> Option<SocketAddr> {
        match &*self.lifecycle.lock().await {
            Lifecycle::Running(handle) => Some(handle.discovery_address),
            _ => None,
        }
    }

    async fn request<R>(
        &self,
        request: impl FnOnce(oneshot::Sender<R>) -> ControlRequest,
    ) -> TerminalResult<R> {
        let requests = match &*self.lifecycle.lock().await {
            Lifecycle::Running(handle) => handle.requests.clone(),
            Lifecycle::Stopped => return Err(TerminalError::NotRunning),
            Lifecycle::Closed => return Err(TerminalError::Closed),
        };

        let (reply, response) = oneshot::channel();
        requests
            .send(request(reply))
            .map_err(|_| TerminalError::Closed)?;
        response.await.map_err(|_| TerminalError::Closed)
    }
}

impl Drop for Terminal {
    fn drop(&mut self) {
        if let Lifecycle::Running(handle) = self.lifecycle.get_mut() {
            handle.cancel();
        }
    }
}
