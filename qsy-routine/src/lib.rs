//! # qsy-routine
//!
//! Routines and the state machine that plays them on QSY nodes.
//!
//! - [`Routine`], [`Step`], [`NodeConfiguration`]: the designed routine and
//!   its JSON form
//! - [`ExpressionTree`]: boolean step conditions over logical ids
//! - [`Executor`]: the per-execution state machine (pre-init, steps,
//!   timeouts, finish/interrupt)
//! - [`StepSource`]: what feeds steps to an executor; [`RoutineSteps`] for a
//!   designed routine, [`PlayerSteps`] for the random player game
//! - [`StepCounter`]: the shared step sequence numbers that let stale
//!   touches be recognized
//!
//! The executor never talks to the network directly: commands leave through
//! a [`CommandSink`] and lifecycle events through the internal event bus.

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

mod association;
mod error;
mod executor;
mod expression;
mod routine;
mod sequence;
mod steps;

pub use association::NodeAssociation;
pub use error::{ExpressionError, RoutineError};
pub use executor::{
    Blink, CommandSink, ExecutionState, Executor, ExecutorConfig, ExecutorContext,
};
pub use expression::{ExpressionTree, referenced_ids};
pub use routine::{MAX_DELAY, NodeConfiguration, Routine, Step};
pub use sequence::{MAX_STEP_SEQUENCE, StepCounter};
pub use steps::{PlayerExecution, PlayerSteps, RoutineSteps, StepOutcome, StepSource};
