//! Where an executor's steps come from.
//!
//! The executor itself is policy free; a [`StepSource`] decides which step
//! comes next and gets told about touches and timeouts. [`RoutineSteps`]
//! replays a designed [`Routine`]; [`PlayerSteps`] generates random steps
//! for the player game and keeps the per-step winners.

use std::time::Duration;

use qsy_core::Color;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::RoutineError;
use crate::routine::{MAX_DELAY, NodeConfiguration, Routine, Step};

/// Supplies steps to an executor and observes how they end.
pub trait StepSource: Send + 'static {
    /// The next step, or `None` when the routine is over.
    fn next_step(&mut self) -> Option<Step>;

    /// A node of the current step was touched.
    fn on_touche(&mut self, _logical_id: usize, _color: Color) {}

    /// The current step timed out.
    fn on_step_timeout(&mut self) {}

    /// Per-step outcomes recorded so far.
    fn outcomes(&self) -> Vec<StepOutcome> {
        Vec::new()
    }
}

/// How one step of a player game ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepOutcome {
    /// 1-based step index.
    pub step: usize,
    /// Color of the player who touched first; `None` if the step timed out.
    pub winner: Option<Color>,
}

/// Steps of a designed routine, in order.
pub struct RoutineSteps {
    steps: std::vec::IntoIter<Step>,
}

impl RoutineSteps {
    /// Replay the steps of `routine`.
    pub fn new(routine: Routine) -> Self {
        Self {
            steps: routine.steps.into_iter(),
        }
    }
}

impl StepSource for RoutineSteps {
    fn next_step(&mut self) -> Option<Step> {
        self.steps.next()
    }
}

/// Parameters of a player game.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerExecution {
    /// Logical nodes in play.
    pub node_count: usize,
    /// One color per player.
    pub players: Vec<Color>,
    /// Step ends when every player touched (AND) rather than the first (OR).
    pub wait_for_all: bool,
    /// Delay applied to every lit node, in milliseconds.
    pub step_delay: u64,
    /// Step timeout in milliseconds; 0 disables it.
    pub step_timeout: u64,
    /// End the game when a step times out.
    pub stop_on_timeout: bool,
    /// Number of steps; 0 plays until the execution timeout.
    pub step_count: usize,
    /// Whole-game timeout in milliseconds; 0 disables it.
    pub execution_timeout: u64,
}

impl PlayerExecution {
    /// Reject requests that cannot run or would never end.
    pub fn validate(&self) -> Result<(), RoutineError> {
        let reason = if self.node_count == 0 {
            "number of nodes must be greater than 0"
        } else if self.players.is_empty() {
            "at least one player is required"
        } else if self.players.len() > self.node_count {
            "more players than nodes"
        } else if self.step_delay > MAX_DELAY {
            "step delay does not fit in a command"
        } else if self.step_count == 0 && self.execution_timeout == 0 {
            "unlimited steps require an execution timeout"
        } else {
            return Ok(());
        };
        Err(RoutineError::InvalidPlayerExecution { reason })
    }

    /// Whole-game timeout, `None` when disabled.
    pub fn execution_timeout(&self) -> Option<Duration> {
        (self.execution_timeout > 0).then(|| Duration::from_millis(self.execution_timeout))
    }
}

/// Random steps for the player game.
///
/// Each step gives every player a distinct random logical node lit in the
/// player's color, joined with `&` or `|`.
pub struct PlayerSteps {
    execution: PlayerExecution,
    step_index: usize,
    outcomes: Vec<StepOutcome>,
    rng: StdRng,
}

impl PlayerSteps {
    /// Generator seeded from the operating system.
    pub fn new(execution: PlayerExecution) -> Self {
        Self::with_rng(execution, StdRng::from_os_rng())
    }

    /// Generator with an explicit random source.
    pub fn with_rng(execution: PlayerExecution, rng: StdRng) -> Self {
        Self {
            execution,
            step_index: 0,
            outcomes: Vec::new(),
            rng,
        }
    }

    fn has_next_step(&self) -> bool {
        self.execution.step_count == 0 || self.step_index < self.execution.step_count
    }

    fn record(&mut self, winner: Option<Color>) {
        if self.outcomes.len() < self.step_index {
            self.outcomes.push(StepOutcome {
                step: self.step_index,
                winner,
            });
        }
    }
}

impl StepSource for PlayerSteps {
    fn next_step(&mut self) -> Option<Step> {
        if !self.has_next_step() {
            return None;
        }

        let operator = if self.execution.wait_for_all { "&" } else { "|" };
        let mut free: Vec<usize> = (0..self.execution.node_count).collect();
        let mut configurations = Vec::with_capacity(self.execution.players.len());
        let mut ids = Vec::with_capacity(self.execution.players.len());

        for &color in &self.execution.players {
            if free.is_empty() {
                break;
            }
            let id = free.swap_remove(self.rng.random_range(0..free.len()));
            configurations.push(NodeConfiguration::new(id, self.execution.step_delay, color));
            ids.push(id.to_string());
        }

        self.step_index += 1;
        Some(Step::new(
            ids.join(operator),
            self.execution.step_timeout,
            self.execution.stop_on_timeout,
            configurations,
        ))
    }

    fn on_touche(&mut self, _logical_id: usize, color: Color) {
        self.record(Some(color));
    }

    fn on_step_timeout(&mut self) {
        self.record(None);
    }

    fn outcomes(&self) -> Vec<StepOutcome> {
        self.outcomes.clone()
    }
}
