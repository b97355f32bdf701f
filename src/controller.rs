//! Round state machine driving distribute → compute → merge until
//! convergence or the round limit.

use std::collections::BTreeSet;
use std::fmt;

use crate::aggregator::{Aggregator, ConvergenceSignal, MergeStrategy, RoundProgress};
use crate::codec;
use crate::config::{ShardFailurePolicy, TerminationConfig};
use crate::error::{DiapError, Result};
use crate::partial::{PartialComputation, ShardId};
use crate::shard::{ShardOutcome, ShardSet};

/// Phases of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundPhase {
    Idle,
    Distributing,
    AwaitingPartials,
    Merging,
    ContinueNextRound,
    Finalizing,
    Done,
}

impl fmt::Display for RoundPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Terminal output of a run.
#[derive(Debug, Clone)]
pub struct RunResult<S, O> {
    /// Final global state.
    pub state: S,
    /// Algorithm-specific outputs.
    pub output: O,
    /// Number of completed rounds.
    pub iterations: u32,
    /// Whether the run stopped because the convergence predicate held.
    pub converged: bool,
    /// Shards retired under [`ShardFailurePolicy::Degrade`].
    pub missing_shards: BTreeSet<ShardId>,
}

/// Drives one iterative computation over a [`ShardSet`].
///
/// The global state is owned here between rounds and replaced after every
/// merge; shards only ever see it by shared reference.
pub struct RoundController<C, M>
where
    M: MergeStrategy,
    C: PartialComputation<Input = M::State>,
{
    computation: C,
    aggregator: Aggregator<M>,
    termination: TerminationConfig,
    phase: RoundPhase,
    transitions: Vec<RoundPhase>,
    state: Option<M::State>,
    pending: Vec<ShardOutcome>,
    iterations: u32,
    converged: bool,
    result: Option<RunResult<M::State, M::Output>>,
}

impl<C, M> RoundController<C, M>
where
    M: MergeStrategy,
    C: PartialComputation<Input = M::State>,
{
    pub fn new(
        computation: C,
        strategy: M,
        shards: BTreeSet<ShardId>,
        termination: TerminationConfig,
    ) -> Result<Self> {
        termination.validate()?;
        if computation.output_variant() != strategy.input_variant() {
            return Err(DiapError::VariantMismatch {
                expected: strategy.input_variant(),
                found: computation.output_variant(),
            });
        }
        if shards.is_empty() {
            return Err(DiapError::InvalidConfig(
                "a run needs at least one shard".into(),
            ));
        }
        Ok(Self {
            computation,
            aggregator: Aggregator::new(strategy, shards),
            termination,
            phase: RoundPhase::Idle,
            transitions: vec![RoundPhase::Idle],
            state: None,
            pending: Vec::new(),
            iterations: 0,
            converged: false,
            result: None,
        })
    }

    pub fn phase(&self) -> RoundPhase {
        self.phase
    }

    /// Every phase entered so far, starting with `Idle`.
    pub fn transitions(&self) -> &[RoundPhase] {
        &self.transitions
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    pub fn aggregator(&self) -> &Aggregator<M> {
        &self.aggregator
    }

    pub fn state(&self) -> Option<&M::State> {
        self.state.as_ref()
    }

    pub fn start(&mut self, initial: M::State) -> Result<()> {
        if self.phase != RoundPhase::Idle {
            return Err(DiapError::InvalidState(format!(
                "cannot start a run in phase {}",
                self.phase
            )));
        }
        self.state = Some(initial);
        self.enter(RoundPhase::Distributing);
        Ok(())
    }

    /// Perform one transition and return the phase entered.
    pub fn step(&mut self, shards: &mut ShardSet<C::Local>) -> Result<RoundPhase> {
        match self.phase {
            RoundPhase::Idle => Err(DiapError::InvalidState(
                "start() must be called before step()".into(),
            )),
            RoundPhase::Distributing => {
                let state = self.current_state()?;
                let snapshot = if shards.wire_boundary() {
                    codec::round_trip(state)?
                } else {
                    state.clone()
                };
                let round = self.aggregator.round();
                tracing::debug!(round, shards = shards.active_ids().len(), "distributing global state");
                self.pending = shards.compute(&self.computation, &snapshot, round);
                Ok(self.enter(RoundPhase::AwaitingPartials))
            }
            RoundPhase::AwaitingPartials => {
                let mut partials = Vec::with_capacity(self.pending.len());
                for (shard, outcome) in std::mem::take(&mut self.pending) {
                    match outcome {
                        Ok(partial) => partials.push(partial),
                        Err(err) => match self.termination.shard_failure {
                            ShardFailurePolicy::Fatal => {
                                return Err(DiapError::shard_failure(shard, err));
                            }
                            ShardFailurePolicy::Degrade => {
                                tracing::warn!(shard = shard.0, error = %err, "retiring failed shard");
                                self.aggregator.mark_missing(shard)?;
                                shards.retire(shard);
                            }
                        },
                    }
                }
                self.aggregator.submit_all(partials)?;
                Ok(self.enter(RoundPhase::Merging))
            }
            RoundPhase::Merging => {
                let (next, signal) = self.aggregator.merge(self.current_state()?)?;
                self.iterations += 1;
                self.converged = signal.is_converged(self.termination.convergence_threshold);
                self.state = Some(next);
                log_round(self.iterations, signal, self.converged);
                if self.converged || self.iterations >= self.termination.max_iterations {
                    Ok(self.enter(RoundPhase::Finalizing))
                } else {
                    Ok(self.enter(RoundPhase::ContinueNextRound))
                }
            }
            RoundPhase::ContinueNextRound => {
                self.aggregator.advance_round()?;
                Ok(self.enter(RoundPhase::Distributing))
            }
            RoundPhase::Finalizing => {
                let progress = RoundProgress {
                    iterations: self.iterations,
                    converged: self.converged,
                    missing_shards: self.aggregator.missing(),
                };
                let state = self.current_state()?.clone();
                let output = self.aggregator.finalize_result(&state, &progress)?;
                tracing::info!(
                    iterations = self.iterations,
                    converged = self.converged,
                    missing = progress.missing_shards.len(),
                    "run finished"
                );
                self.result = Some(RunResult {
                    state,
                    output,
                    iterations: self.iterations,
                    converged: self.converged,
                    missing_shards: progress.missing_shards,
                });
                Ok(self.enter(RoundPhase::Done))
            }
            RoundPhase::Done => Ok(RoundPhase::Done),
        }
    }

    /// Start from `initial` and step until the run is done.
    pub fn run(
        mut self,
        shards: &mut ShardSet<C::Local>,
        initial: M::State,
    ) -> Result<RunResult<M::State, M::Output>> {
        self.start(initial)?;
        while self.step(shards)? != RoundPhase::Done {}
        self.into_result()
    }

    pub fn into_result(self) -> Result<RunResult<M::State, M::Output>> {
        self.result.ok_or_else(|| {
            DiapError::InvalidState("run has not reached the Done phase".into())
        })
    }

    fn current_state(&self) -> Result<&M::State> {
        self.state
            .as_ref()
            .ok_or_else(|| DiapError::InvalidState("no global state has been set".into()))
    }

    fn enter(&mut self, phase: RoundPhase) -> RoundPhase {
        self.phase = phase;
        self.transitions.push(phase);
        phase
    }
}

fn log_round(iteration: u32, signal: ConvergenceSignal, converged: bool) {
    match signal {
        ConvergenceSignal::Measure(measure) => {
            tracing::info!(iteration, measure, converged, "round merged")
        }
        other => tracing::info!(iteration, signal = ?other, converged, "round merged"),
    }
}
