//! Routine definitions.
//!
//! A [`Routine`] is what a trainer designs: an ordered list of [`Step`]s,
//! each lighting some logical nodes and waiting for a boolean condition over
//! which of them were touched. The JSON shape is:
//!
//! ```json
//! {
//!   "playersCount": 1,
//!   "numberOfNodes": 2,
//!   "totalTimeOut": 0,
//!   "name": "warmup",
//!   "steps": [{
//!     "expression": "0|1",
//!     "timeOut": 1500,
//!     "stopOnTimeout": false,
//!     "nodesConfigurations": [
//!       { "id": 0, "delay": 0, "color": { "red": 15, "green": 0, "blue": 0 } },
//!       { "id": 1, "delay": 250, "color": { "red": 0, "green": 0, "blue": 15 } }
//!     ]
//!   }]
//! }
//! ```
//!
//! Times and delays are milliseconds. Reading and writing files is left to
//! the caller.

use std::collections::BTreeSet;
use std::time::Duration;

use qsy_core::Color;
use serde::{Deserialize, Serialize};

use crate::error::RoutineError;
use crate::expression::{ExpressionTree, referenced_ids};

/// A named sequence of steps over a fixed number of logical nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Routine {
    /// Players taking part.
    #[serde(alias = "playerCount")]
    pub players_count: u8,

    /// Logical nodes the routine addresses, ids `0..number_of_nodes`.
    pub number_of_nodes: usize,

    /// Whole-routine timeout in milliseconds; 0 disables it.
    #[serde(rename = "totalTimeOut")]
    pub total_timeout: u64,

    /// Display name.
    pub name: String,

    /// Steps in execution order.
    pub steps: Vec<Step>,
}

/// One phase of a routine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    /// Completion condition over logical ids.
    pub expression: String,

    /// Step timeout in milliseconds, counted after the longest configured
    /// delay; 0 waits forever.
    #[serde(rename = "timeOut")]
    pub timeout: u64,

    /// End the whole routine when this step times out.
    pub stop_on_timeout: bool,

    /// Nodes lit when the step starts.
    #[serde(rename = "nodesConfigurations")]
    pub node_configurations: Vec<NodeConfiguration>,
}

/// Largest node delay in milliseconds; the command frame carries it in 32 bits.
pub const MAX_DELAY: u64 = u32::MAX as u64;

/// How one logical node lights up in a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfiguration {
    /// Logical id.
    pub id: usize,

    /// Milliseconds the node waits before lighting up.
    pub delay: u64,

    /// Color shown.
    pub color: Color,
}

impl NodeConfiguration {
    /// Configuration for `id`.
    pub fn new(id: usize, delay: u64, color: Color) -> Self {
        Self { id, delay, color }
    }
}

impl Step {
    /// Build a step.
    pub fn new(
        expression: impl Into<String>,
        timeout: u64,
        stop_on_timeout: bool,
        node_configurations: Vec<NodeConfiguration>,
    ) -> Self {
        Self {
            expression: expression.into(),
            timeout,
            stop_on_timeout,
            node_configurations,
        }
    }

    /// Step timeout, `None` when disabled.
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout > 0).then(|| Duration::from_millis(self.timeout))
    }

    /// Longest configured delay.
    pub fn max_delay(&self) -> Duration {
        let max = self
            .node_configurations
            .iter()
            .map(|config| config.delay)
            .max()
            .unwrap_or(0);
        Duration::from_millis(max)
    }

    fn validate(&self, index: usize, node_count: usize) -> Result<(), RoutineError> {
        ExpressionTree::parse(&self.expression, node_count).map_err(|source| {
            RoutineError::InvalidExpression {
                step: index,
                source,
            }
        })?;
        let referenced =
            referenced_ids(&self.expression).map_err(|source| RoutineError::InvalidExpression {
                step: index,
                source,
            })?;

        let mut configured = BTreeSet::new();
        for config in &self.node_configurations {
            if config.id >= node_count {
                return Err(RoutineError::ConfigurationOutOfRange {
                    step: index,
                    id: config.id,
                    node_count,
                });
            }
            if config.delay > MAX_DELAY {
                return Err(RoutineError::DelayOutOfRange {
                    step: index,
                    id: config.id,
                    delay: config.delay,
                    max: MAX_DELAY,
                });
            }
            if !configured.insert(config.id) {
                return Err(RoutineError::DuplicateConfiguration {
                    step: index,
                    id: config.id,
                });
            }
        }

        if referenced != configured {
            return Err(RoutineError::ConfigurationMismatch {
                step: index,
                referenced,
                configured,
            });
        }
        Ok(())
    }
}

impl Routine {
    /// Routine-wide timeout, `None` when disabled.
    pub fn total_timeout(&self) -> Option<Duration> {
        (self.total_timeout > 0).then(|| Duration::from_millis(self.total_timeout))
    }

    /// Structural check run before a routine is executed or stored.
    ///
    /// Every step expression must parse with ids below `number_of_nodes`,
    /// and must reference exactly the ids the step configures.
    pub fn validate(&self) -> Result<(), RoutineError> {
        if self.players_count == 0 {
            return Err(RoutineError::NoPlayers);
        }
        if self.number_of_nodes == 0 {
            return Err(RoutineError::NoNodes);
        }
        for (i, step) in self.steps.iter().enumerate() {
            step.validate(i + 1, self.number_of_nodes)?;
        }
        Ok(())
    }

    /// Decode and validate a routine.
    pub fn from_json(json: &str) -> Result<Self, RoutineError> {
        let routine: Routine = serde_json::from_str(json)?;
        routine.validate()?;
        Ok(routine)
    }

    /// Validate and encode a routine (pretty printed).
    pub fn to_json(&self) -> Result<String, RoutineError> {
        self.validate()?;
        Ok(serde_json::to_string_pretty(self)?)
    }
}
