//! Error types for routine parsing and validation.

use std::collections::BTreeSet;

use thiserror::Error;

/// Reasons a step expression fails to parse.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExpressionError {
    /// Nothing but whitespace.
    #[error("empty expression")]
    Empty,

    /// A character that is neither an id, an operator nor a parenthesis.
    #[error("unknown token {token:?} at position {position}")]
    UnknownToken {
        /// Offending text.
        token: String,
        /// Byte offset in the expression.
        position: usize,
    },

    /// Parentheses do not pair up.
    #[error("unbalanced parentheses")]
    UnbalancedParentheses,

    /// A logical id not below the routine's node count.
    #[error("logical id {id} out of range for {node_count} nodes")]
    IdOutOfRange {
        /// The id as written.
        id: u64,
        /// Number of logical nodes of the routine.
        node_count: usize,
    },

    /// An operator lacks an operand (`"0&"`, `"|1"`, `"()"`).
    #[error("operator is missing an operand")]
    MissingOperand,

    /// Two operands without an operator between them (`"0 1"`, `"0(1)"`).
    #[error("operands are missing an operator")]
    MissingOperator,
}

/// Structural problems in a routine or a player execution request.
#[derive(Debug, Error)]
pub enum RoutineError {
    /// `playersCount` is zero.
    #[error("players count must be greater than 0")]
    NoPlayers,

    /// `numberOfNodes` is zero.
    #[error("number of nodes must be greater than 0")]
    NoNodes,

    /// A step expression does not parse.
    #[error("step {step}: {source}")]
    InvalidExpression {
        /// 1-based step index.
        step: usize,
        /// Parser error.
        #[source]
        source: ExpressionError,
    },

    /// A node configuration uses an id outside the routine.
    #[error("step {step}: configured logical id {id} out of range for {node_count} nodes")]
    ConfigurationOutOfRange {
        /// 1-based step index.
        step: usize,
        /// Offending logical id.
        id: usize,
        /// Number of logical nodes of the routine.
        node_count: usize,
    },

    /// The same logical id is configured twice in one step.
    #[error("step {step}: logical id {id} configured more than once")]
    DuplicateConfiguration {
        /// 1-based step index.
        step: usize,
        /// Repeated logical id.
        id: usize,
    },

    /// The expression and the node configurations name different ids.
    #[error("step {step}: expression references {referenced:?} but configures {configured:?}")]
    ConfigurationMismatch {
        /// 1-based step index.
        step: usize,
        /// Ids the expression references.
        referenced: BTreeSet<usize>,
        /// Ids the step configures.
        configured: BTreeSet<usize>,
    },

    /// A node delay that does not fit the 32-bit wire field.
    #[error("step {step}: delay {delay} ms for logical id {id} exceeds {max} ms")]
    DelayOutOfRange {
        /// 1-based step index.
        step: usize,
        /// Logical id carrying the delay.
        id: usize,
        /// Configured delay in milliseconds.
        delay: u64,
        /// Largest delay a command can carry.
        max: u64,
    },

    /// A player execution request that cannot run.
    #[error("invalid player execution: {reason}")]
    InvalidPlayerExecution {
        /// What is wrong with the request.
        reason: &'static str,
    },

    /// Routine JSON could not be read or written.
    #[error("routine JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
