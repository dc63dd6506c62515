//! The routine state machine.
//!
//! ```text
//!   PreInit ──pattern done──► Running(step 1) ──► Running(step 2) ──► … ──► Finished
//!      │                           │
//!      └──────── close() ──────────┴──────────────────────────────────────► Interrupted
//! ```
//!
//! - **PreInit** blinks an attention pattern on every involved node, then
//!   publishes `Started` and enters the first step. Closing aborts it.
//! - **Entering a step** draws a fresh sequence number from the shared
//!   [`StepCounter`], sends one command per configured node and arms the step
//!   timer for `timeout + max delay`.
//! - **A touche** only counts if it carries the active step's sequence number.
//!   When the step condition becomes true the step is finalized (untouched
//!   nodes forced off, touched vector cleared, timer disarmed) and the next
//!   step is entered, or the routine finishes.
//! - **A step timeout** only acts if it still belongs to the active step. It
//!   finalizes the step and either advances or, with `stop_on_timeout` or no
//!   steps left, finishes.
//! - **The execution timeout** finishes the routine from any step.
//!
//! Every transition runs under the executor's single lock, from reading the
//! state to sending the commands it implies, so a touche and a timer firing
//! together are serialized. Finishing and interrupting are idempotent and
//! always turn every involved node off.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use qsy_core::{
    Color, CommandArgs, ExecutionEvent, ExecutionId, InternalEvent, PhysicalId, Publisher,
    QsyPacket, TimeProvider,
};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::association::NodeAssociation;
use crate::expression::ExpressionTree;
use crate::routine::{Routine, Step};
use crate::sequence::StepCounter;
use crate::steps::{PlayerExecution, PlayerSteps, RoutineSteps, StepOutcome, StepSource};

/// Narrow port the executor sends node commands through.
pub trait CommandSink: Send + Sync + 'static {
    /// Deliver one command packet.
    fn command(&self, packet: QsyPacket);
}

/// One flash of the attention pattern: lit for `duration`, then dark for `duration`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Blink {
    /// Color shown.
    pub color: Color,
    /// Time lit, and time dark afterwards.
    pub duration: Duration,
}

impl Blink {
    /// A blink of `color` lasting `millis` milliseconds.
    pub const fn new(color: Color, millis: u64) -> Self {
        Self {
            color,
            duration: Duration::from_millis(millis),
        }
    }
}

/// Executor tuning.
#[derive(Clone, Debug)]
pub struct ExecutorConfig {
    /// Attention pattern played before the first step.
    pub pre_init: Vec<Blink>,

    /// Touch sensor flag on step commands.
    pub touch_enabled: bool,

    /// Sound flag on step commands.
    pub sound_enabled: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            pre_init: vec![
                Blink::new(Color::RED, 500),
                Blink::new(Color::RED, 500),
                Blink::new(Color::GREEN, 150),
                Blink::new(Color::GREEN, 150),
            ],
            touch_enabled: true,
            sound_enabled: false,
        }
    }
}

impl ExecutorConfig {
    /// Replace the attention pattern; an empty pattern starts immediately.
    pub fn with_pre_init(mut self, pre_init: Vec<Blink>) -> Self {
        self.pre_init = pre_init;
        self
    }

    /// Set the sound flag on step commands.
    pub fn with_sound(mut self, sound_enabled: bool) -> Self {
        self.sound_enabled = sound_enabled;
        self
    }
}

/// Collaborators an executor is wired to.
#[derive(Clone)]
pub struct ExecutorContext<T> {
    /// Clock used for every timer.
    pub time: T,
    /// Where commands go.
    pub sink: Arc<dyn CommandSink>,
    /// Shared step sequence counter.
    pub counter: StepCounter,
    /// Where lifecycle events go.
    pub publisher: Publisher<InternalEvent>,
}

/// Observable state of an executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    /// Playing the attention pattern.
    PreInit,
    /// Waiting on step `step` (1-based).
    Running {
        /// Active step index.
        step: usize,
    },
    /// Ended on its own: completed, or a timeout ended it.
    Finished,
    /// Ended by `close()`.
    Interrupted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    PreInit,
    Running,
    Finished,
    Interrupted,
}

struct ActiveStep {
    index: usize,
    sequence: u16,
    tree: ExpressionTree,
    configured: Vec<usize>,
    stop_on_timeout: bool,
    timer: Option<AbortHandle>,
}

struct RunState {
    phase: Phase,
    touched: Vec<bool>,
    entered: usize,
    active: Option<ActiveStep>,
    source: Box<dyn StepSource>,
    execution_timer: Option<AbortHandle>,
}

struct Shared<T> {
    id: ExecutionId,
    association: NodeAssociation,
    config: ExecutorConfig,
    execution_timeout: Option<Duration>,
    context: ExecutorContext<T>,
    pre_init: CancellationToken,
    state: Mutex<RunState>,
}

/// Handle to one routine execution.
///
/// The executor runs on its own tasks; the handle feeds it touches and
/// closes it. Dropping the handle does not stop a running execution.
pub struct Executor<T: TimeProvider> {
    shared: Arc<Shared<T>>,
}

impl<T: TimeProvider> Executor<T> {
    /// Start an execution over `association`, drawing steps from `source`.
    ///
    /// The attention pattern starts right away on a spawned task.
    pub fn start(
        id: ExecutionId,
        association: NodeAssociation,
        source: Box<dyn StepSource>,
        execution_timeout: Option<Duration>,
        config: ExecutorConfig,
        context: ExecutorContext<T>,
    ) -> Self {
        let node_count = association.len();
        let shared = Arc::new(Shared {
            id,
            association,
            config,
            execution_timeout,
            context,
            pre_init: CancellationToken::new(),
            state: Mutex::new(RunState {
                phase: Phase::PreInit,
                touched: vec![false; node_count],
                entered: 0,
                active: None,
                source,
                execution_timer: None,
            }),
        });

        info!(execution = %id, nodes = ?shared.association.physical_ids(), "execution starting");
        tokio::spawn(pre_init(shared.clone()));
        Self { shared }
    }

    /// Run a designed routine.
    pub fn custom(
        id: ExecutionId,
        association: NodeAssociation,
        routine: Routine,
        config: ExecutorConfig,
        context: ExecutorContext<T>,
    ) -> Self {
        let execution_timeout = routine.total_timeout();
        Self::start(
            id,
            association,
            Box::new(RoutineSteps::new(routine)),
            execution_timeout,
            config,
            context,
        )
    }

    /// Run a player game.
    pub fn player(
        id: ExecutionId,
        association: NodeAssociation,
        execution: PlayerExecution,
        config: ExecutorConfig,
        context: ExecutorContext<T>,
    ) -> Self {
        let execution_timeout = execution.execution_timeout();
        Self::start(
            id,
            association,
            Box::new(PlayerSteps::new(execution)),
            execution_timeout,
            config,
            context,
        )
    }

    /// Identifier of this execution.
    pub fn id(&self) -> ExecutionId {
        self.shared.id
    }

    /// Feed a touche from `physical_id` tagged with step sequence `step`.
    ///
    /// Returns whether the touche was counted; stale sequence numbers,
    /// unknown nodes and touches outside a running step are ignored.
    pub fn touche(&self, physical_id: PhysicalId, step: u16, color: Color) -> bool {
        self.shared.touche(physical_id, step, color)
    }

    /// Whether the physical node takes part in this execution.
    pub fn contains(&self, physical_id: PhysicalId) -> bool {
        self.shared.association.contains(physical_id)
    }

    /// Interrupt the execution and turn its nodes off.
    ///
    /// Returns `true` only for the call that actually interrupted it; closing
    /// a finished or already closed execution is a no-op.
    pub fn close(&self) -> bool {
        self.shared.interrupt()
    }

    /// Current state.
    pub fn state(&self) -> ExecutionState {
        let state = self.shared.state.lock();
        match state.phase {
            Phase::PreInit => ExecutionState::PreInit,
            Phase::Running => ExecutionState::Running {
                step: state.entered,
            },
            Phase::Finished => ExecutionState::Finished,
            Phase::Interrupted => ExecutionState::Interrupted,
        }
    }

    /// Whether the execution reached a terminal state.
    pub fn is_terminated(&self) -> bool {
        matches!(
            self.state(),
            ExecutionState::Finished | ExecutionState::Interrupted
        )
    }

    /// Sequence number of the active step.
    pub fn current_sequence(&self) -> Option<u16> {
        self.shared
            .state
            .lock()
            .active
            .as_ref()
            .map(|active| active.sequence)
    }

    /// Snapshot of the touched vector, index = logical id.
    pub fn touched(&self) -> Vec<bool> {
        self.shared.state.lock().touched.clone()
    }

    /// Per-step outcomes recorded by the step source (player games).
    pub fn step_outcomes(&self) -> Vec<StepOutcome> {
        self.shared.state.lock().source.outcomes()
    }

    /// Nodes taking part, in logical order.
    pub fn association(&self) -> &NodeAssociation {
        &self.shared.association
    }
}

async fn pre_init<T: TimeProvider>(shared: Arc<Shared<T>>) {
    let pattern = shared.config.pre_init.clone();
    let play = async {
        for blink in &pattern {
            if !shared.blink(blink.color) {
                break;
            }
            shared.context.time.sleep(blink.duration).await?;
            if !shared.blink(Color::OFF) {
                break;
            }
            shared.context.time.sleep(blink.duration).await?;
        }
        Ok::<(), qsy_core::TimeError>(())
    };

    tokio::select! {
        _ = shared.pre_init.cancelled() => {
            trace!(execution = %shared.id, "attention pattern aborted");
        }
        played = play => {
            if let Err(e) = played {
                warn!(execution = %shared.id, error = %e, "attention pattern cut short");
            }
            shared.begin();
        }
    }
}

impl<T: TimeProvider> Shared<T> {
    fn publish(&self, event: ExecutionEvent) {
        self.context.publisher.publish(event.into());
    }

    fn send(&self, physical_id: PhysicalId, color: Color, delay: u64, step: u16, touch: bool) {
        let args = CommandArgs::new(u32::from(physical_id), color, delay, step)
            .with_touch(touch)
            .with_sound(touch && self.config.sound_enabled);
        match QsyPacket::command(&args) {
            Ok(packet) => self.context.sink.command(packet),
            Err(e) => warn!(execution = %self.id, physical_id, error = %e, "command not sent"),
        }
    }

    /// Same color on every involved node, no delay, outside any step.
    fn broadcast(&self, color: Color) {
        for &physical_id in self.association.physical_ids() {
            self.send(physical_id, color, 0, 0, false);
        }
    }

    /// One pattern frame, sent only while still in pre-init.
    fn blink(&self, color: Color) -> bool {
        let state = self.state.lock();
        if state.phase != Phase::PreInit {
            return false;
        }
        self.broadcast(color);
        true
    }

    fn begin(self: &Arc<Self>) {
        let mut state = self.state.lock();
        if state.phase != Phase::PreInit {
            return;
        }
        state.phase = Phase::Running;
        self.publish(ExecutionEvent::Started { execution: self.id });
        debug!(execution = %self.id, "execution started");

        if let Some(timeout) = self.execution_timeout {
            let shared = Arc::clone(self);
            let timer = tokio::spawn(async move {
                if shared.context.time.sleep(timeout).await.is_ok() {
                    shared.execution_timed_out();
                }
            });
            state.execution_timer = Some(timer.abort_handle());
        }

        self.advance(&mut state);
    }

    fn advance(self: &Arc<Self>, state: &mut RunState) {
        match state.source.next_step() {
            Some(step) => self.enter_step(state, step),
            None => self.finish(state),
        }
    }

    fn enter_step(self: &Arc<Self>, state: &mut RunState, step: Step) {
        let tree = match ExpressionTree::parse(&step.expression, self.association.len()) {
            Ok(tree) => tree,
            Err(e) => {
                error!(execution = %self.id, expression = %step.expression, error = %e, "step expression rejected");
                self.context.publisher.publish(InternalEvent::WorkerError {
                    worker: "executor",
                    message: e.to_string(),
                });
                self.finish(state);
                return;
            }
        };

        let sequence = self.context.counter.next();
        state.entered += 1;

        let mut configured = Vec::with_capacity(step.node_configurations.len());
        for config in &step.node_configurations {
            let Some(physical_id) = self.association.physical(config.id) else {
                warn!(execution = %self.id, logical_id = config.id, "configured node not associated");
                continue;
            };
            self.send(
                physical_id,
                config.color,
                config.delay,
                sequence,
                self.config.touch_enabled,
            );
            configured.push(config.id);
        }

        let timer = step.timeout().map(|timeout| {
            let after = timeout + step.max_delay();
            let shared = Arc::clone(self);
            tokio::spawn(async move {
                if shared.context.time.sleep(after).await.is_ok() {
                    shared.step_timed_out(sequence);
                }
            })
            .abort_handle()
        });

        debug!(execution = %self.id, step = state.entered, sequence, expression = %tree, "step entered");
        state.active = Some(ActiveStep {
            index: state.entered,
            sequence,
            tree,
            configured,
            stop_on_timeout: step.stop_on_timeout,
            timer,
        });
    }

    fn touche(self: &Arc<Self>, physical_id: PhysicalId, step: u16, color: Color) -> bool {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.phase != Phase::Running {
            return false;
        }
        let Some(logical_id) = self.association.logical(physical_id) else {
            return false;
        };
        let Some(active) = state.active.as_ref().filter(|active| active.sequence == step) else {
            trace!(execution = %self.id, physical_id, step, "stale touche ignored");
            return false;
        };

        state.touched[logical_id] = true;
        let complete = active.tree.evaluate(&state.touched);
        state.source.on_touche(logical_id, color);
        trace!(execution = %self.id, physical_id, logical_id, step, complete, "touche counted");

        if complete {
            self.finalize_step(state);
            self.advance(state);
        }
        true
    }

    fn step_timed_out(self: &Arc<Self>, sequence: u16) {
        let mut state = self.state.lock();
        if state.phase != Phase::Running {
            return;
        }
        let (index, stop) = match &state.active {
            Some(active) if active.sequence == sequence => (active.index, active.stop_on_timeout),
            _ => return,
        };

        debug!(execution = %self.id, step = index, "step timed out");
        self.publish(ExecutionEvent::StepTimeOut {
            execution: self.id,
            step: index,
        });
        state.source.on_step_timeout();
        self.finalize_step(&mut state);

        if stop {
            self.finish(&mut state);
        } else {
            self.advance(&mut state);
        }
    }

    fn execution_timed_out(self: &Arc<Self>) {
        let mut state = self.state.lock();
        if state.phase != Phase::Running {
            return;
        }
        debug!(execution = %self.id, "execution timed out");
        self.finalize_step(&mut state);
        self.finish(&mut state);
    }

    /// Turn off configured nodes that were not touched, clear the touched
    /// vector and disarm the step timer.
    fn finalize_step(&self, state: &mut RunState) {
        let Some(active) = state.active.take() else {
            return;
        };
        if let Some(timer) = active.timer {
            timer.abort();
        }
        for &logical_id in &active.configured {
            if !state.touched.get(logical_id).copied().unwrap_or(false) {
                if let Some(physical_id) = self.association.physical(logical_id) {
                    self.send(physical_id, Color::OFF, 0, 0, false);
                }
            }
        }
        state.touched.fill(false);
    }

    /// Stop every timer and turn every involved node off.
    fn shut_down(&self, state: &mut RunState) {
        self.pre_init.cancel();
        if let Some(timer) = state.execution_timer.take() {
            timer.abort();
        }
        if let Some(active) = state.active.take() {
            if let Some(timer) = active.timer {
                timer.abort();
            }
        }
        state.touched.fill(false);
        self.broadcast(Color::OFF);
    }

    fn finish(&self, state: &mut RunState) {
        if matches!(state.phase, Phase::Finished | Phase::Interrupted) {
            return;
        }
        state.phase = Phase::Finished;
        self.shut_down(state);
        info!(execution = %self.id, steps = state.entered, "execution finished");
        self.publish(ExecutionEvent::Finished { execution: self.id });
    }

    fn interrupt(&self) -> bool {
        let mut state = self.state.lock();
        if matches!(state.phase, Phase::Finished | Phase::Interrupted) {
            return false;
        }
        state.phase = Phase::Interrupted;
        self.shut_down(&mut state);
        info!(execution = %self.id, steps = state.entered, "execution interrupted");
        true
    }
}
