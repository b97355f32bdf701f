//! Low-order moments (count, mean, variance, min, max) merged across shards
//! with Chan's pairwise update, plus z-score standardisation of shards.

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::aggregator::{ConvergenceSignal, MergeStrategy, RoundProgress};
use crate::config::{ShardFailurePolicy, TerminationConfig};
use crate::controller::{RoundController, RunResult};
use crate::error::{DiapError, Result};
use crate::fields::{FieldId, FieldValue, NamedFields, Variant};
use crate::numeric::CompensatedSum;
use crate::partial::{LocalStep, PartialComputation, PartialResult, ShardContext};
use crate::shard::ShardSet;
use crate::table::NumericTable;

/// Settings for a standalone moments run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MomentsConfig {
    pub shard_failure: ShardFailurePolicy,
}

/// Running moments of a set of rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Moments {
    pub n: u64,
    pub mean: Vec<f64>,
    /// Sum of squared deviations from `mean`.
    pub m2: Vec<f64>,
    pub min: Vec<f64>,
    pub max: Vec<f64>,
}

impl Moments {
    pub fn empty(dim: usize) -> Self {
        Self {
            n: 0,
            mean: vec![0.0; dim],
            m2: vec![0.0; dim],
            min: vec![f64::INFINITY; dim],
            max: vec![f64::NEG_INFINITY; dim],
        }
    }

    pub fn dim(&self) -> usize {
        self.mean.len()
    }

    /// Two-pass moments of one table.
    pub fn of_table(table: &NumericTable, dim: usize) -> Self {
        let n = table.nrows();
        let mut moments = Self::empty(dim);
        if n == 0 {
            return moments;
        }
        let mut sums = vec![CompensatedSum::default(); dim];
        for i in 0..n {
            let row = table.row(i);
            for (j, &x) in row.iter().enumerate() {
                sums[j].add(x);
                moments.min[j] = moments.min[j].min(x);
                moments.max[j] = moments.max[j].max(x);
            }
        }
        moments.n = n as u64;
        moments.mean = sums.iter().map(|s| s.value() / n as f64).collect();
        let mut m2 = vec![CompensatedSum::default(); dim];
        for i in 0..n {
            for (j, &x) in table.row(i).iter().enumerate() {
                let d = x - moments.mean[j];
                m2[j].add(d * d);
            }
        }
        moments.m2 = m2.iter().map(CompensatedSum::value).collect();
        moments
    }

    /// Chan et al. pairwise combination.
    pub fn combine(&self, other: &Moments) -> Result<Moments> {
        if self.dim() != other.dim() {
            return Err(DiapError::InvalidData(format!(
                "cannot combine moments of width {} and {}",
                self.dim(),
                other.dim()
            )));
        }
        if other.n == 0 {
            return Ok(self.clone());
        }
        if self.n == 0 {
            return Ok(other.clone());
        }
        let (na, nb) = (self.n as f64, other.n as f64);
        let n = na + nb;
        let mut out = Moments::empty(self.dim());
        out.n = self.n + other.n;
        for j in 0..self.dim() {
            let delta = other.mean[j] - self.mean[j];
            out.mean[j] = self.mean[j] + delta * nb / n;
            out.m2[j] = self.m2[j] + other.m2[j] + delta * delta * na * nb / n;
            out.min[j] = self.min[j].min(other.min[j]);
            out.max[j] = self.max[j].max(other.max[j]);
        }
        Ok(out)
    }

    /// Population variance per column; zero when empty.
    pub fn variance(&self) -> Vec<f64> {
        if self.n == 0 {
            return vec![0.0; self.dim()];
        }
        self.m2.iter().map(|m| m / self.n as f64).collect()
    }

    pub fn summary(&self) -> MomentsSummary {
        let variance = self.variance();
        MomentsSummary {
            n: self.n,
            mean: self.mean.clone(),
            std: variance.iter().map(|v| v.max(0.0).sqrt()).collect(),
            variance,
            min: self.min.clone(),
            max: self.max.clone(),
        }
    }

    fn from_partial(partial: &PartialResult) -> Result<Moments> {
        let fields = partial.fields();
        let n = fields.count(FieldId::NObservations)?;
        let sum = fields.vector(FieldId::PartialSum)?;
        let m2 = fields.vector(FieldId::PartialSumSquaresCentered)?;
        let min = fields.vector(FieldId::PartialMinimum)?;
        let max = fields.vector(FieldId::PartialMaximum)?;
        let dim = sum.len();
        if [m2.len(), min.len(), max.len()].iter().any(|&len| len != dim) {
            return Err(DiapError::InvalidData(format!(
                "shard {} sent moment vectors of unequal length",
                partial.shard()
            )));
        }
        let mean = if n == 0 {
            vec![0.0; dim]
        } else {
            sum.iter().map(|s| s / n as f64).collect()
        };
        Ok(Moments {
            n,
            mean,
            m2: m2.clone(),
            min: min.clone(),
            max: max.clone(),
        })
    }
}

/// Final per-column statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MomentsSummary {
    pub n: u64,
    pub mean: Vec<f64>,
    pub variance: Vec<f64>,
    pub std: Vec<f64>,
    pub min: Vec<f64>,
    pub max: Vec<f64>,
}

/// Local step: one shard's count, sum, centred sum of squares and range.
pub struct MomentsStep;

impl PartialComputation for MomentsStep {
    type Input = Moments;
    type Local = ();

    fn output_variant(&self) -> Variant {
        Variant::MomentsPartial
    }

    fn compute(&self, ctx: ShardContext<'_, ()>, input: &Moments) -> Result<LocalStep<()>> {
        ctx.expect_columns(input.dim())?;
        let local = Moments::of_table(ctx.data, input.dim());
        let sum = local.mean.iter().map(|m| m * local.n as f64).collect();
        let fields = NamedFields::new(Variant::MomentsPartial)
            .with(FieldId::NObservations, FieldValue::Count(local.n))?
            .with(FieldId::PartialSum, FieldValue::Vector(sum))?
            .with(FieldId::PartialSumSquaresCentered, FieldValue::Vector(local.m2))?
            .with(FieldId::PartialMinimum, FieldValue::Vector(local.min))?
            .with(FieldId::PartialMaximum, FieldValue::Vector(local.max))?;
        Ok(LocalStep::fields(fields))
    }
}

/// Folds shard moments into the running state; one round suffices.
pub struct MomentsMerge;

impl MergeStrategy for MomentsMerge {
    type State = Moments;
    type Output = MomentsSummary;

    fn input_variant(&self) -> Variant {
        Variant::MomentsPartial
    }

    fn merge(&self, current: &Moments, partials: &[&PartialResult]) -> Result<(Moments, ConvergenceSignal)> {
        let mut merged = current.clone();
        for partial in partials {
            merged = merged.combine(&Moments::from_partial(partial)?)?;
        }
        Ok((merged, ConvergenceSignal::Finished))
    }

    fn finalize(&self, state: &Moments, _: &[&PartialResult], _: &RoundProgress) -> Result<MomentsSummary> {
        Ok(state.summary())
    }
}

/// Moments of every column across the active shards.
pub fn compute_moments(
    shards: &mut ShardSet,
    policy: ShardFailurePolicy,
) -> Result<RunResult<Moments, MomentsSummary>> {
    let dim = shards.feature_dim()?;
    let termination = TerminationConfig {
        max_iterations: 1,
        shard_failure: policy,
        ..TerminationConfig::default()
    };
    let controller = RoundController::new(MomentsStep, MomentsMerge, shards.active_ids(), termination)?;
    let result = controller.run(shards, Moments::empty(dim))?;
    tracing::info!(rows = result.state.n, columns = dim, "moments computed");
    Ok(result)
}

/// Replace each shard table with its z-scores under `summary`.
///
/// Sparse tables become dense since centring destroys sparsity. Constant
/// columns are divided by a floor of `1e-6` instead of zero.
pub fn standardize_shards(shards: &mut ShardSet, summary: &MomentsSummary) -> Result<()> {
    standardize_shards_except(shards, summary, &[])
}

/// Like [`standardize_shards`], but columns listed in `untouched` keep
/// their raw values (e.g. a regression target).
pub fn standardize_shards_except(
    shards: &mut ShardSet,
    summary: &MomentsSummary,
    untouched: &[usize],
) -> Result<()> {
    let dim = summary.mean.len();
    if let Some(&column) = untouched.iter().find(|&&j| j >= dim) {
        return Err(DiapError::InvalidConfig(format!(
            "column {column} cannot be kept raw: tables have {dim} columns"
        )));
    }
    let scale: Vec<f64> = summary.variance.iter().map(|v| v.max(1e-12).sqrt()).collect();
    shards.map_tables(|shard, table| {
        if table.nrows() == 0 {
            return Ok(NumericTable::Dense(Array2::zeros((0, dim))));
        }
        if table.ncols() != dim {
            return Err(DiapError::InvalidInputShape {
                shard,
                expected: dim,
                found: table.ncols(),
            });
        }
        let mut data = table.dense().into_owned();
        for mut row in data.rows_mut() {
            for (j, x) in row.iter_mut().enumerate() {
                if !untouched.contains(&j) {
                    *x = (*x - summary.mean[j]) / scale[j];
                }
            }
        }
        Ok(NumericTable::Dense(data))
    })
}
