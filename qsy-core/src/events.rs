//! Events exchanged between workers and the orchestrator.

use std::fmt;

use crate::packet::{PhysicalId, QsyPacket};

/// Identifies one executor run, so that late events from a replaced executor
/// can be told apart from the active one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExecutionId(pub u64);

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "exec-{}", self.0)
    }
}

/// Lifecycle notifications emitted by an executor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExecutionEvent {
    /// The attention pattern finished and step 1 was entered.
    Started {
        /// Emitting executor.
        execution: ExecutionId,
    },
    /// The routine reached its natural end or a timeout ended it.
    Finished {
        /// Emitting executor.
        execution: ExecutionId,
    },
    /// A step timer fired before the step's condition was met.
    StepTimeOut {
        /// Emitting executor.
        execution: ExecutionId,
        /// 1-based index of the step within the routine.
        step: usize,
    },
}

impl ExecutionEvent {
    /// Executor the event comes from.
    pub fn execution(&self) -> ExecutionId {
        match self {
            ExecutionEvent::Started { execution }
            | ExecutionEvent::Finished { execution }
            | ExecutionEvent::StepTimeOut { execution, .. } => *execution,
        }
    }
}

/// Everything published on the internal bus.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InternalEvent {
    /// A frame decoded from the multicast group or a node stream.
    IncomingPacket(QsyPacket),
    /// A node missed too many heartbeats.
    KeepAliveError {
        /// Silent node.
        physical_id: PhysicalId,
    },
    /// A node stream hit end-of-file or a read error.
    ConnectionLost {
        /// Node whose socket failed.
        physical_id: PhysicalId,
    },
    /// Executor lifecycle.
    Execution(ExecutionEvent),
    /// A worker hit an unexpected failure and kept running (or stopped).
    WorkerError {
        /// Worker name.
        worker: &'static str,
        /// Rendered error.
        message: String,
    },
}

impl From<ExecutionEvent> for InternalEvent {
    fn from(event: ExecutionEvent) -> Self {
        InternalEvent::Execution(event)
    }
}
