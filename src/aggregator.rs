//! Master-side accumulation and merge of per-shard partial results.

use std::collections::{BTreeMap, BTreeSet};

use parking_lot::Mutex;
use rayon::prelude::*;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{DiapError, Result};
use crate::fields::Variant;
use crate::partial::{PartialResult, ShardId};

/// Per-round verdict produced by a merge.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, serde::Deserialize)]
pub enum ConvergenceSignal {
    /// Nothing left to do (finished flag, no pending queries).
    Finished,
    /// Another round is required.
    Continue,
    /// A progress measure compared against the convergence threshold.
    Measure(f64),
}

impl ConvergenceSignal {
    pub fn is_converged(self, threshold: f64) -> bool {
        match self {
            ConvergenceSignal::Finished => true,
            ConvergenceSignal::Continue => false,
            ConvergenceSignal::Measure(value) => value <= threshold,
        }
    }
}

/// Bookkeeping handed to [`MergeStrategy::finalize`].
#[derive(Debug, Clone, PartialEq)]
pub struct RoundProgress {
    /// Completed rounds.
    pub iterations: u32,
    pub converged: bool,
    pub missing_shards: BTreeSet<ShardId>,
}

/// Algorithm-specific merge rule.
///
/// `merge` receives the partials in ascending [`ShardId`] order so any
/// floating-point accumulation is independent of arrival order.
pub trait MergeStrategy: Sync {
    type State: Clone + Send + Sync + Serialize + DeserializeOwned;
    type Output;

    fn input_variant(&self) -> Variant;

    fn merge(
        &self,
        current: &Self::State,
        partials: &[&PartialResult],
    ) -> Result<(Self::State, ConvergenceSignal)>;

    /// Build the terminal output from the final state and the partials of
    /// the last merged round.
    fn finalize(
        &self,
        state: &Self::State,
        partials: &[&PartialResult],
        progress: &RoundProgress,
    ) -> Result<Self::Output>;
}

/// Contributions collected for the open round. Shared by [`Aggregator`] and
/// [`crate::exchange::KeyedExchange`].
#[derive(Debug)]
pub(crate) struct Contributions {
    variant: Variant,
    expected: BTreeSet<ShardId>,
    missing: BTreeSet<ShardId>,
    round: u32,
    partials: BTreeMap<ShardId, PartialResult>,
}

impl Contributions {
    pub(crate) fn new(variant: Variant, expected: BTreeSet<ShardId>, round: u32) -> Self {
        Self {
            variant,
            expected,
            missing: BTreeSet::new(),
            round,
            partials: BTreeMap::new(),
        }
    }

    pub(crate) fn add(&mut self, shard: ShardId, partial: PartialResult) -> Result<()> {
        if partial.shard() != shard || !self.expected.contains(&shard) {
            return Err(DiapError::UnexpectedShard { shard });
        }
        if partial.round() != self.round {
            return Err(DiapError::StaleContribution {
                shard,
                expected: self.round,
                found: partial.round(),
            });
        }
        if partial.variant() != self.variant {
            return Err(DiapError::VariantMismatch {
                expected: self.variant,
                found: partial.variant(),
            });
        }
        if self.partials.contains_key(&shard) {
            return Err(DiapError::DuplicateShardContribution {
                shard,
                round: self.round,
            });
        }
        self.partials.insert(shard, partial);
        Ok(())
    }

    pub(crate) fn outstanding(&self) -> Vec<ShardId> {
        self.expected
            .iter()
            .filter(|id| !self.partials.contains_key(id))
            .copied()
            .collect()
    }

    pub(crate) fn ensure_complete(&self) -> Result<()> {
        if self.expected.is_empty() {
            return Err(DiapError::InvalidState(format!(
                "round {} has no contributing shards left",
                self.round
            )));
        }
        let missing = self.outstanding();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(DiapError::IncompleteRound {
                round: self.round,
                missing,
            })
        }
    }

    pub(crate) fn ordered(&self) -> Vec<&PartialResult> {
        self.partials.values().collect()
    }

    pub(crate) fn mark_missing(&mut self, shard: ShardId) -> Result<()> {
        if !self.expected.remove(&shard) {
            return Err(DiapError::UnexpectedShard { shard });
        }
        self.partials.remove(&shard);
        self.missing.insert(shard);
        Ok(())
    }

    pub(crate) fn advance(&mut self) {
        self.partials.clear();
        self.round += 1;
    }

    pub(crate) fn round(&self) -> u32 {
        self.round
    }

    pub(crate) fn expected(&self) -> &BTreeSet<ShardId> {
        &self.expected
    }

    pub(crate) fn missing(&self) -> &BTreeSet<ShardId> {
        &self.missing
    }
}

struct AggregatorState<S> {
    contributions: Contributions,
    merged: Option<(S, ConvergenceSignal)>,
}

/// Collects one partial per expected shard and merges them once the round
/// barrier is satisfied.
///
/// `add_partial_result` may be called concurrently from worker threads.
/// Calling [`Aggregator::merge`] twice in the same round returns the cached
/// result of the first call.
pub struct Aggregator<M: MergeStrategy> {
    strategy: M,
    inner: Mutex<AggregatorState<M::State>>,
}

impl<M: MergeStrategy> Aggregator<M> {
    pub fn new(strategy: M, expected: BTreeSet<ShardId>) -> Self {
        Self::starting_at(strategy, expected, 0)
    }

    pub fn starting_at(strategy: M, expected: BTreeSet<ShardId>, round: u32) -> Self {
        let variant = strategy.input_variant();
        Self {
            strategy,
            inner: Mutex::new(AggregatorState {
                contributions: Contributions::new(variant, expected, round),
                merged: None,
            }),
        }
    }

    pub fn strategy(&self) -> &M {
        &self.strategy
    }

    pub fn round(&self) -> u32 {
        self.inner.lock().contributions.round()
    }

    pub fn expected(&self) -> BTreeSet<ShardId> {
        self.inner.lock().contributions.expected().clone()
    }

    pub fn missing(&self) -> BTreeSet<ShardId> {
        self.inner.lock().contributions.missing().clone()
    }

    pub fn outstanding(&self) -> Vec<ShardId> {
        self.inner.lock().contributions.outstanding()
    }

    pub fn is_complete(&self) -> bool {
        self.inner.lock().contributions.ensure_complete().is_ok()
    }

    pub fn add_partial_result(&self, shard: ShardId, partial: PartialResult) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.merged.is_some() {
            return Err(DiapError::DuplicateShardContribution {
                shard,
                round: inner.contributions.round(),
            });
        }
        inner.contributions.add(shard, partial)?;
        tracing::debug!(
            shard = shard.0,
            round = inner.contributions.round(),
            outstanding = inner.contributions.outstanding().len(),
            "accepted partial result"
        );
        Ok(())
    }

    /// Submit many partials concurrently.
    pub fn submit_all(&self, partials: Vec<PartialResult>) -> Result<()> {
        partials
            .into_par_iter()
            .try_for_each(|partial| self.add_partial_result(partial.shard(), partial))
    }

    /// Drop `shard` from the expected set for the rest of the run.
    pub fn mark_missing(&self, shard: ShardId) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.merged.is_some() {
            return Err(DiapError::InvalidState(format!(
                "cannot drop shard {shard} after round {} was merged",
                inner.contributions.round()
            )));
        }
        inner.contributions.mark_missing(shard)
    }

    /// Merge the open round into the next global state.
    pub fn merge(&self, current: &M::State) -> Result<(M::State, ConvergenceSignal)> {
        let mut inner = self.inner.lock();
        if let Some(cached) = inner.merged.as_ref() {
            return Ok(cached.clone());
        }
        inner.contributions.ensure_complete()?;
        let partials = inner.contributions.ordered();
        let merged = self.strategy.merge(current, &partials)?;
        tracing::debug!(
            round = inner.contributions.round(),
            shards = partials.len(),
            signal = ?merged.1,
            "merged round"
        );
        inner.merged = Some(merged.clone());
        Ok(merged)
    }

    /// Produce the terminal output.
    ///
    /// The open round must be merged and `progress` must count between one
    /// and `round + 1` merged rounds. The aggregator does not know the
    /// termination config: callers finalize only once the run has converged
    /// or hit its round limit, as [`crate::RoundController`] does.
    pub fn finalize_result(&self, state: &M::State, progress: &RoundProgress) -> Result<M::Output> {
        let inner = self.inner.lock();
        let round = inner.contributions.round();
        if inner.merged.is_none() {
            return Err(DiapError::InvalidState(format!(
                "round {round} must be merged before finalizing"
            )));
        }
        if progress.iterations == 0 || progress.iterations > round + 1 {
            return Err(DiapError::InvalidState(format!(
                "progress reports {} merged rounds but the aggregator is in round {round}",
                progress.iterations
            )));
        }
        let partials = inner.contributions.ordered();
        self.strategy.finalize(state, &partials, progress)
    }

    /// Close the merged round and open the next one.
    pub fn advance_round(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.merged.is_none() {
            return Err(DiapError::InvalidState(format!(
                "round {} has not been merged",
                inner.contributions.round()
            )));
        }
        inner.merged = None;
        inner.contributions.advance();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::{FieldId, FieldValue, NamedFields};
    use crate::numeric::CompensatedSum;

    /// Sums a scalar across shards.
    struct ScalarSum;

    impl MergeStrategy for ScalarSum {
        type State = f64;
        type Output = f64;

        fn input_variant(&self) -> Variant {
            Variant::InitPotential
        }

        fn merge(&self, _current: &f64, partials: &[&PartialResult]) -> Result<(f64, ConvergenceSignal)> {
            let mut sum = CompensatedSum::default();
            for partial in partials {
                sum.add(partial.fields().scalar(FieldId::PartialPotential)?);
            }
            Ok((sum.value(), ConvergenceSignal::Finished))
        }

        fn finalize(&self, state: &f64, _: &[&PartialResult], _: &RoundProgress) -> Result<f64> {
            Ok(*state)
        }
    }

    fn potential(shard: u32, round: u32, value: f64) -> PartialResult {
        let fields = NamedFields::new(Variant::InitPotential)
            .with(FieldId::PartialPotential, FieldValue::Scalar(value))
            .expect("valid");
        PartialResult::new(ShardId(shard), round, fields)
    }

    fn expected(n: u32) -> BTreeSet<ShardId> {
        (0..n).map(ShardId).collect()
    }

    #[test]
    fn merge_waits_for_every_shard() {
        let aggregator = Aggregator::new(ScalarSum, expected(3));
        aggregator.add_partial_result(ShardId(0), potential(0, 0, 1.0)).expect("add");
        aggregator.add_partial_result(ShardId(2), potential(2, 0, 2.0)).expect("add");
        match aggregator.merge(&0.0).unwrap_err() {
            DiapError::IncompleteRound { round, missing } => {
                assert_eq!(round, 0);
                assert_eq!(missing, vec![ShardId(1)]);
            }
            other => panic!("unexpected error {other}"),
        }
        aggregator.add_partial_result(ShardId(1), potential(1, 0, 3.0)).expect("add");
        let (first, signal) = aggregator.merge(&0.0).expect("merge");
        assert_eq!(first, 6.0);
        assert_eq!(signal, ConvergenceSignal::Finished);
        // Second merge without new submissions returns the cached result.
        let (second, _) = aggregator.merge(&100.0).expect("merge again");
        assert_eq!(second, first);
    }

    #[test]
    fn duplicate_stale_and_foreign_contributions_are_rejected() {
        let aggregator = Aggregator::new(ScalarSum, expected(2));
        aggregator.add_partial_result(ShardId(0), potential(0, 0, 1.0)).expect("add");
        let err = aggregator.add_partial_result(ShardId(0), potential(0, 0, 1.0)).unwrap_err();
        assert!(matches!(
            err,
            DiapError::DuplicateShardContribution { shard: ShardId(0), round: 0 }
        ));
        let err = aggregator.add_partial_result(ShardId(1), potential(1, 3, 1.0)).unwrap_err();
        assert!(matches!(err, DiapError::StaleContribution { .. }));
        let err = aggregator.add_partial_result(ShardId(5), potential(5, 0, 1.0)).unwrap_err();
        assert!(matches!(err, DiapError::UnexpectedShard { shard: ShardId(5) }));

        let wrong = NamedFields::new(Variant::InitCounts)
            .with(FieldId::NObservations, FieldValue::Count(3))
            .expect("valid");
        let err = aggregator
            .add_partial_result(ShardId(1), PartialResult::new(ShardId(1), 0, wrong))
            .unwrap_err();
        assert!(matches!(err, DiapError::VariantMismatch { .. }));
    }

    #[test]
    fn concurrent_submission_is_order_independent() {
        let values: Vec<f64> = (0..64).map(|i| 1.0 / (i as f64 + 1.0) * 1e8_f64.powi(i % 3)).collect();
        let forward = Aggregator::new(ScalarSum, expected(64));
        std::thread::scope(|scope| {
            for (i, value) in values.iter().enumerate() {
                let aggregator = &forward;
                scope.spawn(move || {
                    aggregator
                        .add_partial_result(ShardId(i as u32), potential(i as u32, 0, *value))
                        .expect("add");
                });
            }
        });
        let reversed = Aggregator::new(ScalarSum, expected(64));
        for (i, value) in values.iter().enumerate().rev() {
            reversed
                .add_partial_result(ShardId(i as u32), potential(i as u32, 0, *value))
                .expect("add");
        }
        let a = forward.merge(&0.0).expect("merge").0;
        let b = reversed.merge(&0.0).expect("merge").0;
        assert_eq!(a.to_bits(), b.to_bits());
    }

    #[test]
    fn finalize_needs_a_merge_and_consistent_progress() {
        let aggregator = Aggregator::new(ScalarSum, expected(1));
        let progress = |iterations| RoundProgress {
            iterations,
            converged: true,
            missing_shards: BTreeSet::new(),
        };
        aggregator.add_partial_result(ShardId(0), potential(0, 0, 2.5)).expect("add");
        let err = aggregator.finalize_result(&0.0, &progress(1)).unwrap_err();
        assert!(matches!(err, DiapError::InvalidState(_)));

        let (state, _) = aggregator.merge(&0.0).expect("merge");
        for bogus in [0, 2] {
            let err = aggregator.finalize_result(&state, &progress(bogus)).unwrap_err();
            assert!(matches!(err, DiapError::InvalidState(_)), "iterations = {bogus}");
        }
        assert_eq!(aggregator.finalize_result(&state, &progress(1)).expect("finalize"), 2.5);
    }

    #[test]
    fn missing_shard_is_dropped_from_barrier() {
        let aggregator = Aggregator::new(ScalarSum, expected(3));
        aggregator.add_partial_result(ShardId(0), potential(0, 0, 1.0)).expect("add");
        aggregator.add_partial_result(ShardId(1), potential(1, 0, 1.0)).expect("add");
        aggregator.mark_missing(ShardId(2)).expect("mark");
        assert_eq!(aggregator.merge(&0.0).expect("merge").0, 2.0);
        assert_eq!(aggregator.missing(), [ShardId(2)].into_iter().collect());
        aggregator.advance_round().expect("advance");
        assert_eq!(aggregator.round(), 1);
        assert_eq!(aggregator.outstanding(), vec![ShardId(0), ShardId(1)]);
    }
}
