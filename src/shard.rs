//! In-process local-shard driver.
//!
//! A [`ShardSet`] owns every shard's table and carried state and runs a
//! [`PartialComputation`] on all active shards in parallel. It stands in for
//! the worker nodes of a real deployment: nothing is shared between shards
//! except the read-only input snapshot.

use std::collections::BTreeSet;

use ndarray::{s, Axis};
use rayon::prelude::*;

use crate::config::ShardFailurePolicy;
use crate::error::{DiapError, Result};
use crate::exchange::KeyedCollection;
use crate::partial::{LocalStep, PartialComputation, PartialResult, ShardContext, ShardId};
use crate::table::NumericTable;
use crate::DataMatrix;

struct Shard<L> {
    id: ShardId,
    data: NumericTable,
    carry: Option<L>,
    active: bool,
}

/// Outcome of one step on one shard.
pub type ShardOutcome = (ShardId, Result<PartialResult>);

/// The shards taking part in a run.
pub struct ShardSet<L = ()> {
    shards: Vec<Shard<L>>,
    wire_boundary: bool,
    #[cfg(test)]
    reverse_outcomes: bool,
}

impl<L: Send + Sync> ShardSet<L> {
    /// Shards numbered `0..tables.len()`.
    pub fn new(tables: Vec<NumericTable>) -> Self {
        let shards = tables
            .into_iter()
            .enumerate()
            .map(|(i, data)| Shard {
                id: ShardId(i as u32),
                data,
                carry: None,
                active: true,
            })
            .collect();
        Self {
            shards,
            wire_boundary: false,
            #[cfg(test)]
            reverse_outcomes: false,
        }
    }

    /// Shards with externally assigned identifiers.
    pub fn from_shards(tables: Vec<(ShardId, NumericTable)>) -> Result<Self> {
        let mut seen = BTreeSet::new();
        let mut shards = Vec::with_capacity(tables.len());
        for (id, data) in tables {
            if !seen.insert(id) {
                return Err(DiapError::InvalidConfig(format!(
                    "shard {id} registered more than once"
                )));
            }
            shards.push(Shard {
                id,
                data,
                carry: None,
                active: true,
            });
        }
        shards.sort_by_key(|shard| shard.id);
        Ok(Self {
            shards,
            wire_boundary: false,
            #[cfg(test)]
            reverse_outcomes: false,
        })
    }

    /// Partition `data` into `n_shards` contiguous row blocks whose sizes
    /// differ by at most one row.
    pub fn split_rows(data: &DataMatrix, n_shards: usize) -> Result<Self> {
        if n_shards == 0 {
            return Err(DiapError::InvalidConfig(
                "shard count must be greater than zero".into(),
            ));
        }
        let n = data.nrows();
        let base = n / n_shards;
        let extra = n % n_shards;
        let mut start = 0usize;
        let mut tables = Vec::with_capacity(n_shards);
        for i in 0..n_shards {
            let len = base + usize::from(i < extra);
            tables.push(NumericTable::Dense(
                data.slice(s![start..start + len, ..]).to_owned(),
            ));
            start += len;
        }
        Ok(Self::new(tables))
    }

    /// Round-trip every partial through the wire codec, as a remote worker would.
    pub fn with_wire_boundary(mut self, enabled: bool) -> Self {
        self.wire_boundary = enabled;
        self
    }

    pub fn wire_boundary(&self) -> bool {
        self.wire_boundary
    }

    /// Hand step outcomes back in descending shard order.
    #[cfg(test)]
    pub(crate) fn with_reversed_outcomes(mut self) -> Self {
        self.reverse_outcomes = true;
        self
    }

    #[cfg(test)]
    fn reverses_outcomes(&self) -> bool {
        self.reverse_outcomes
    }

    #[cfg(not(test))]
    fn reverses_outcomes(&self) -> bool {
        false
    }

    fn order_outcomes(&self, mut outcomes: Vec<ShardOutcome>) -> Vec<ShardOutcome> {
        if self.reverses_outcomes() {
            outcomes.reverse();
        }
        outcomes
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    pub fn active_ids(&self) -> BTreeSet<ShardId> {
        self.shards
            .iter()
            .filter(|shard| shard.active)
            .map(|shard| shard.id)
            .collect()
    }

    /// Permanently exclude a shard from later steps.
    pub fn retire(&mut self, id: ShardId) {
        if let Some(shard) = self.shards.iter_mut().find(|shard| shard.id == id) {
            shard.active = false;
            shard.carry = None;
        }
    }

    pub fn table(&self, id: ShardId) -> Option<&NumericTable> {
        self.shards
            .iter()
            .find(|shard| shard.id == id)
            .map(|shard| &shard.data)
    }

    pub fn tables(&self) -> impl Iterator<Item = (ShardId, &NumericTable)> + '_ {
        self.shards.iter().map(|shard| (shard.id, &shard.data))
    }

    pub fn total_rows(&self) -> usize {
        self.shards
            .iter()
            .filter(|shard| shard.active)
            .map(|shard| shard.data.nrows())
            .sum()
    }

    pub fn carry(&self, id: ShardId) -> Option<&L> {
        self.shards
            .iter()
            .find(|shard| shard.id == id)
            .and_then(|shard| shard.carry.as_ref())
    }

    /// Replace every shard table, e.g. after standardisation.
    pub fn map_tables<F>(&mut self, f: F) -> Result<()>
    where
        F: Fn(ShardId, &NumericTable) -> Result<NumericTable> + Sync,
    {
        self.shards.par_iter_mut().try_for_each(|shard| {
            shard.data = f(shard.id, &shard.data)?;
            Ok(())
        })
    }

    /// Run `f` over the same tables with a different carried-state type.
    ///
    /// Carried state of both stages is dropped; retirements made inside the
    /// stage stick.
    pub fn with_stage<M, T, F>(&mut self, f: F) -> T
    where
        M: Send + Sync,
        F: FnOnce(&mut ShardSet<M>) -> T,
    {
        let mut staged = ShardSet {
            shards: std::mem::take(&mut self.shards)
                .into_iter()
                .map(Shard::restage)
                .collect(),
            wire_boundary: self.wire_boundary,
            #[cfg(test)]
            reverse_outcomes: self.reverse_outcomes,
        };
        let out = f(&mut staged);
        self.shards = staged.shards.into_iter().map(Shard::restage).collect();
        out
    }

    /// Column count shared by the non-empty active shards.
    pub fn feature_dim(&self) -> Result<usize> {
        let mut dim = None;
        for shard in self.shards.iter().filter(|s| s.active && s.data.nrows() > 0) {
            match dim {
                None => dim = Some(shard.data.ncols()),
                Some(expected) if expected != shard.data.ncols() => {
                    return Err(DiapError::InvalidInputShape {
                        shard: shard.id,
                        expected,
                        found: shard.data.ncols(),
                    });
                }
                Some(_) => {}
            }
        }
        dim.ok_or_else(|| DiapError::InvalidData("every active shard is empty".into()))
    }

    pub fn retired_ids(&self) -> BTreeSet<ShardId> {
        self.shards
            .iter()
            .filter(|shard| !shard.active)
            .map(|shard| shard.id)
            .collect()
    }

    /// Run `step` on every active shard with the same `input`.
    pub fn compute<C>(&mut self, step: &C, input: &C::Input, round: u32) -> Vec<ShardOutcome>
    where
        C: PartialComputation<Local = L>,
    {
        let wire = self.wire_boundary;
        let outcomes = self
            .shards
            .par_iter_mut()
            .filter(|shard| shard.active)
            .map(|shard| (shard.id, run_one(step, shard, input, round, wire)))
            .collect();
        self.order_outcomes(outcomes)
    }

    /// Run `step` on every active shard with the entry addressed to it.
    ///
    /// Every active shard must have exactly one entry and no entry may be
    /// addressed to a shard outside the active set.
    pub fn compute_keyed<C>(
        &mut self,
        step: &C,
        inputs: &KeyedCollection<C::Input>,
        round: u32,
    ) -> Result<Vec<ShardOutcome>>
    where
        C: PartialComputation<Local = L>,
    {
        let active = self.active_ids();
        if let Some(stray) = inputs.keys().find(|id| !active.contains(id)) {
            return Err(DiapError::RoutingFailure {
                shard: stray,
                reason: "entry addressed to a shard that is not active".into(),
            });
        }
        if let Some(&missing) = active.iter().find(|id| inputs.get(**id).is_none()) {
            return Err(DiapError::RoutingFailure {
                shard: missing,
                reason: "no keyed entry delivered before the next local step".into(),
            });
        }
        let wire = self.wire_boundary;
        let outcomes = self
            .shards
            .par_iter_mut()
            .filter(|shard| shard.active)
            .filter_map(|shard| {
                let input = inputs.get(shard.id)?;
                Some((shard.id, run_one(step, shard, input, round, wire)))
            })
            .collect();
        Ok(self.order_outcomes(outcomes))
    }
}

impl<L> Shard<L> {
    fn restage<M>(self) -> Shard<M> {
        Shard {
            id: self.id,
            data: self.data,
            carry: None,
            active: self.active,
        }
    }
}

fn run_one<C: PartialComputation>(
    step: &C,
    shard: &mut Shard<C::Local>,
    input: &C::Input,
    round: u32,
    wire: bool,
) -> Result<PartialResult> {
    let ctx = ShardContext {
        shard: shard.id,
        round,
        data: &shard.data,
        prior: shard.carry.as_ref(),
    };
    let LocalStep { fields, carry } = step.compute(ctx, input)?;
    if fields.variant() != step.output_variant() {
        return Err(DiapError::VariantMismatch {
            expected: step.output_variant(),
            found: fields.variant(),
        });
    }
    if let Some(carry) = carry {
        shard.carry = Some(carry);
    }
    let partial = PartialResult::new(shard.id, round, fields);
    if wire {
        PartialResult::unpack(&partial.pack()?)
    } else {
        Ok(partial)
    }
}

/// Collect successful partials, turning the first failure into a fatal
/// [`DiapError::ShardFailure`].
pub fn require_all(outcomes: Vec<ShardOutcome>) -> Result<Vec<PartialResult>> {
    let mut partials = Vec::with_capacity(outcomes.len());
    for (shard, outcome) in outcomes {
        partials.push(outcome.map_err(|err| DiapError::shard_failure(shard, err))?);
    }
    Ok(partials)
}

/// Apply `policy` to the outcomes of a step outside a [`crate::RoundController`].
///
/// Under [`ShardFailurePolicy::Degrade`] failing shards are retired and the
/// surviving partials returned; at least one shard must survive.
pub fn settle<L: Send + Sync>(
    outcomes: Vec<ShardOutcome>,
    policy: ShardFailurePolicy,
    shards: &mut ShardSet<L>,
) -> Result<Vec<PartialResult>> {
    if policy == ShardFailurePolicy::Fatal {
        return require_all(outcomes);
    }
    let mut partials = Vec::with_capacity(outcomes.len());
    for (shard, outcome) in outcomes {
        match outcome {
            Ok(partial) => partials.push(partial),
            Err(err) => {
                tracing::warn!(shard = shard.0, error = %err, "retiring failed shard");
                shards.retire(shard);
            }
        }
    }
    if partials.is_empty() {
        return Err(DiapError::InvalidState(
            "every shard failed; nothing left to aggregate".into(),
        ));
    }
    Ok(partials)
}

/// Stack the rows of several tables (in the given order) into one matrix.
pub(crate) fn stack_rows(dim: usize, blocks: &[&DataMatrix]) -> Result<DataMatrix> {
    let views: Vec<_> = blocks
        .iter()
        .filter(|block| block.nrows() > 0)
        .map(|block| block.view())
        .collect();
    if views.is_empty() {
        return Ok(DataMatrix::zeros((0, dim)));
    }
    ndarray::concatenate(Axis(0), &views)
        .map_err(|err| DiapError::InvalidData(format!("cannot stack row blocks: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::{FieldId, FieldValue, NamedFields, Variant};
    use ndarray::Array2;

    struct RowCount;

    impl PartialComputation for RowCount {
        type Input = u64;
        type Local = u64;

        fn output_variant(&self) -> Variant {
            Variant::InitCounts
        }

        fn compute(&self, ctx: ShardContext<'_, u64>, input: &u64) -> Result<LocalStep<u64>> {
            let seen = ctx.prior.copied().unwrap_or(0) + 1;
            let fields = NamedFields::new(Variant::InitCounts).with(
                FieldId::NObservations,
                FieldValue::Count(ctx.data.nrows() as u64 * input),
            )?;
            Ok(LocalStep::with_carry(fields, seen))
        }
    }

    #[test]
    fn split_rows_balances_blocks() {
        let data = Array2::from_shape_fn((10, 2), |(i, j)| (i * 2 + j) as f64);
        let shards: ShardSet = ShardSet::split_rows(&data, 3).expect("split");
        let sizes: Vec<usize> = shards.tables().map(|(_, t)| t.nrows()).collect();
        assert_eq!(sizes, vec![4, 3, 3]);
        assert_eq!(shards.total_rows(), 10);
        let last = shards.table(ShardId(2)).expect("shard 2").row(2);
        assert_eq!(last.to_vec(), vec![18.0, 19.0]);
    }

    #[test]
    fn carry_survives_between_steps() {
        let data = Array2::zeros((5, 1));
        let mut shards = ShardSet::split_rows(&data, 2).expect("split").with_wire_boundary(true);
        for round in 0..3 {
            let partials = require_all(shards.compute(&RowCount, &2, round)).expect("compute");
            assert_eq!(partials.len(), 2);
        }
        assert_eq!(shards.carry(ShardId(0)), Some(&3));
    }

    #[test]
    fn stage_keeps_retirements_and_drops_carry() {
        let data = Array2::zeros((6, 1));
        let mut shards: ShardSet = ShardSet::split_rows(&data, 3).expect("split");
        let total = shards.with_stage(|staged: &mut ShardSet<u64>| {
            let outcomes = staged.compute(&RowCount, &1, 0);
            let partials = settle(outcomes, ShardFailurePolicy::Degrade, staged).expect("settle");
            staged.retire(ShardId(2));
            assert_eq!(staged.carry(ShardId(0)), Some(&1));
            partials.len()
        });
        assert_eq!(total, 3);
        assert_eq!(shards.retired_ids(), [ShardId(2)].into_iter().collect());
        assert_eq!(shards.total_rows(), 4);
        assert_eq!(shards.feature_dim().expect("dim"), 1);
    }

    #[test]
    fn keyed_compute_requires_an_entry_per_shard() {
        let data = Array2::zeros((4, 1));
        let mut shards = ShardSet::split_rows(&data, 2).expect("split");
        let mut inputs = KeyedCollection::new();
        inputs.insert(ShardId(0), 1u64);
        let err = shards.compute_keyed(&RowCount, &inputs, 0).unwrap_err();
        assert!(matches!(err, DiapError::RoutingFailure { shard: ShardId(1), .. }));

        inputs.insert(ShardId(1), 1);
        inputs.insert(ShardId(9), 1);
        let err = shards.compute_keyed(&RowCount, &inputs, 0).unwrap_err();
        assert!(matches!(err, DiapError::RoutingFailure { shard: ShardId(9), .. }));
    }
}
