//! Algorithm families built on the round protocol.
//!
//! Single-step iterative algorithms (k-means Lloyd rounds, moments, boosted
//! stumps) run under a [`crate::RoundController`]. Multi-step pipelines
//! (initialisation, DBSCAN) chain local steps, aggregators and keyed
//! exchanges through a [`Pipeline`].

pub mod dbscan;
pub mod gbt;
pub mod init;
pub mod kmeans;
pub mod moments;

use std::collections::BTreeSet;

use crate::aggregator::{Aggregator, ConvergenceSignal, MergeStrategy, RoundProgress};
use crate::config::ShardFailurePolicy;
use crate::error::Result;
use crate::exchange::{KeyedCollection, KeyedExchange, KeyedMerge};
use crate::partial::{PartialComputation, PartialResult, ShardId};
use crate::shard::{settle, ShardSet};

/// Partials of one pipeline step together with the round they belong to.
#[derive(Debug)]
pub(crate) struct Gathered {
    round: u32,
    contributors: BTreeSet<ShardId>,
    partials: Vec<PartialResult>,
}

/// Sequencer for multi-step pipelines: every local step opens a new round.
pub(crate) struct Pipeline<'s, L> {
    shards: &'s mut ShardSet<L>,
    policy: ShardFailurePolicy,
    round: u32,
}

impl<'s, L: Send + Sync> Pipeline<'s, L> {
    pub(crate) fn new(shards: &'s mut ShardSet<L>, policy: ShardFailurePolicy) -> Self {
        Self {
            shards,
            policy,
            round: 0,
        }
    }

    pub(crate) fn round(&self) -> u32 {
        self.round
    }

    /// Run `step` with the same input on every active shard.
    pub(crate) fn broadcast<C>(&mut self, step: &C, input: &C::Input) -> Result<Gathered>
    where
        C: PartialComputation<Local = L>,
    {
        let round = self.round;
        let outcomes = self.shards.compute(step, input, round);
        self.gather(round, outcomes)
    }

    /// Run `step` on every active shard with the entry routed to it.
    pub(crate) fn deliver<C>(&mut self, step: &C, inputs: &KeyedCollection<C::Input>) -> Result<Gathered>
    where
        C: PartialComputation<Local = L>,
    {
        let round = self.round;
        let outcomes = self.shards.compute_keyed(step, inputs, round)?;
        self.gather(round, outcomes)
    }

    fn gather(&mut self, round: u32, outcomes: Vec<crate::shard::ShardOutcome>) -> Result<Gathered> {
        let partials = settle(outcomes, self.policy, self.shards)?;
        self.round += 1;
        Ok(Gathered {
            round,
            contributors: partials.iter().map(PartialResult::shard).collect(),
            partials,
        })
    }
}

/// Merge a gathered step through an [`Aggregator`].
pub(crate) fn merge_gathered<M: MergeStrategy>(
    strategy: M,
    current: &M::State,
    gathered: Gathered,
) -> Result<(M::State, ConvergenceSignal)> {
    let aggregator = Aggregator::starting_at(strategy, gathered.contributors, gathered.round);
    aggregator.submit_all(gathered.partials)?;
    aggregator.merge(current)
}

/// Route a gathered step through a [`KeyedExchange`].
pub(crate) fn exchange_gathered<K: KeyedMerge>(
    strategy: K,
    gathered: Gathered,
) -> Result<KeyedCollection<K::Value>> {
    let exchange = KeyedExchange::new(strategy, gathered.contributors, gathered.round);
    exchange.submit_all(gathered.partials)?;
    exchange.merge_keyed()
}

/// Merge a single-round step and build its terminal output.
pub(crate) fn finalize_gathered<M: MergeStrategy>(
    strategy: M,
    current: &M::State,
    gathered: Gathered,
) -> Result<(M::State, M::Output)> {
    let aggregator = Aggregator::starting_at(strategy, gathered.contributors, gathered.round);
    aggregator.submit_all(gathered.partials)?;
    let (state, signal) = aggregator.merge(current)?;
    let progress = RoundProgress {
        iterations: 1,
        converged: signal.is_converged(0.0),
        missing_shards: aggregator.missing(),
    };
    let output = aggregator.finalize_result(&state, &progress)?;
    Ok((state, output))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::error::DiapError;
    use crate::exchange::shuffle;
    use crate::fields::{FieldId, FieldValue, NamedFields, Variant};
    use crate::partial::{LocalStep, ShardContext};
    use ndarray::Array2;

    type Inbox = Vec<(ShardId, FieldValue)>;

    /// Shard 2 addresses one value to shard 0; everyone else sends nothing.
    struct SendFromTwo;

    impl PartialComputation for SendFromTwo {
        type Input = ();
        type Local = Inbox;

        fn output_variant(&self) -> Variant {
            Variant::DbscanHalo
        }

        fn compute(&self, ctx: ShardContext<'_, Inbox>, _: &()) -> Result<LocalStep<Inbox>> {
            let mut outgoing = BTreeMap::new();
            if ctx.shard == ShardId(2) {
                outgoing.insert(ShardId(0), FieldValue::Indices(vec![42, 43]));
            }
            let fields = NamedFields::new(Variant::DbscanHalo)
                .with(FieldId::HaloData, FieldValue::Keyed(outgoing))?
                .with(FieldId::HaloDataIndices, FieldValue::Keyed(BTreeMap::new()))?;
            Ok(LocalStep::fields(fields))
        }
    }

    struct RouteHalo;

    impl KeyedMerge for RouteHalo {
        type Value = Inbox;

        fn input_variant(&self) -> Variant {
            Variant::DbscanHalo
        }

        fn merge_keyed(
            &self,
            partials: &[&PartialResult],
            active: &BTreeSet<ShardId>,
        ) -> Result<KeyedCollection<Inbox>> {
            shuffle(partials, FieldId::HaloData, active)
        }
    }

    /// Keeps whatever was delivered as the shard's carried state.
    struct Record;

    impl PartialComputation for Record {
        type Input = Inbox;
        type Local = Inbox;

        fn output_variant(&self) -> Variant {
            Variant::InitCounts
        }

        fn compute(&self, _: ShardContext<'_, Inbox>, input: &Inbox) -> Result<LocalStep<Inbox>> {
            let fields = NamedFields::new(Variant::InitCounts)
                .with(FieldId::NObservations, FieldValue::Count(input.len() as u64))?;
            Ok(LocalStep::with_carry(fields, input.clone()))
        }
    }

    fn four_shards() -> ShardSet<Inbox> {
        let data = Array2::zeros((8, 1));
        ShardSet::split_rows(&data, 4)
            .expect("split")
            .with_wire_boundary(true)
    }

    #[test]
    fn routed_value_is_the_next_input_of_shard_zero_only() {
        let mut shards = four_shards();
        let mut pipeline = Pipeline::new(&mut shards, ShardFailurePolicy::Fatal);
        let sent = pipeline.broadcast(&SendFromTwo, &()).expect("send");
        let routed = exchange_gathered(RouteHalo, sent).expect("route");
        let received = pipeline.deliver(&Record, &routed).expect("deliver");
        assert_eq!(received.partials.len(), 4);
        assert_eq!(received.round, 1);

        assert_eq!(
            shards.carry(ShardId(0)),
            Some(&vec![(ShardId(2), FieldValue::Indices(vec![42, 43]))])
        );
        for other in 1..4 {
            assert_eq!(shards.carry(ShardId(other)), Some(&Vec::new()), "shard {other}");
        }
    }

    #[test]
    fn delivery_with_a_stray_or_missing_entry_fails_routing() {
        let mut shards = four_shards();
        let mut pipeline = Pipeline::new(&mut shards, ShardFailurePolicy::Fatal);

        let missing: KeyedCollection<Inbox> = (0..3).map(|i| (ShardId(i), Vec::new())).collect();
        let err = pipeline.deliver(&Record, &missing).unwrap_err();
        assert!(matches!(err, DiapError::RoutingFailure { shard: ShardId(3), .. }), "{err}");

        let stray: KeyedCollection<Inbox> = [0, 1, 2, 3, 7]
            .into_iter()
            .map(|i| (ShardId(i), Vec::new()))
            .collect();
        let err = pipeline.deliver(&Record, &stray).unwrap_err();
        assert!(matches!(err, DiapError::RoutingFailure { shard: ShardId(7), .. }), "{err}");

        assert!(shards.carry(ShardId(0)).is_none());
    }
}
