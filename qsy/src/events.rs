//! Events published to terminal subscribers.

use std::net::SocketAddr;

use qsy_core::{Color, ExecutionId, PhysicalId};

/// Payload of an external touche notification.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ToucheArgs {
    /// Node that was touched.
    pub physical_id: PhysicalId,
    /// Delay field reported by the node, in milliseconds.
    pub delay: u32,
    /// Color the node showed when touched.
    pub color: Color,
}

/// Why an execution was interrupted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InterruptionReason {
    /// Another routine was started and replaced it.
    NewRoutineStarted,
    /// `stop_routine` was called.
    RoutineStopped,
    /// The terminal was closed.
    Closed,
    /// One of its nodes disconnected.
    DisconnectedNode,
}

/// Everything a terminal subscriber can observe.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExternalEvent {
    /// A node answered discovery and its control connection is open.
    ConnectedNode {
        /// Node id.
        physical_id: PhysicalId,
        /// Control connection address.
        address: SocketAddr,
    },
    /// A node was removed after a liveness or socket failure.
    DisconnectedNode {
        /// Node id.
        physical_id: PhysicalId,
        /// Control connection address.
        address: SocketAddr,
    },
    /// A node was touched, whether or not a routine is running.
    Touche(ToucheArgs),
    /// The attention pattern ended and the first step started.
    ExecutionStarted {
        /// Execution id.
        execution: ExecutionId,
    },
    /// The execution ended on its own.
    ExecutionFinished {
        /// Execution id.
        execution: ExecutionId,
    },
    /// A step ran out of time.
    StepTimeOut {
        /// Execution id.
        execution: ExecutionId,
        /// 1-based step index.
        step: usize,
    },
    /// The execution was stopped before it ended.
    ExecutionInterrupted {
        /// Execution id.
        execution: ExecutionId,
        /// What stopped it.
        reason: InterruptionReason,
    },
}
