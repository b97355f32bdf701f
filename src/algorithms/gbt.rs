//! Gradient-boosted regression stumps with squared loss.
//!
//! A moments pass supplies per-column ranges (for uniform bin edges) and the
//! target mean (the base score). Each round every shard bins its features,
//! accumulates residual sums and counts per bin and reports them; the master
//! adds the histograms, picks the split with the largest squared-error
//! reduction and appends one stump. Shards keep their running predictions so
//! a round only applies the stumps added since the previous one.

use ndarray::{Array2, ArrayView1};
use serde::{Deserialize, Serialize};

use super::moments::compute_moments;
use crate::aggregator::{ConvergenceSignal, MergeStrategy, RoundProgress};
use crate::config::TerminationConfig;
use crate::controller::{RoundController, RunResult};
use crate::error::{DiapError, Result};
use crate::fields::{FieldId, FieldValue, NamedFields, Variant};
use crate::numeric::CompensatedSum;
use crate::partial::{LocalStep, PartialComputation, PartialResult, ShardContext};
use crate::shard::ShardSet;
use crate::table::NumericTable;

/// Boosting parameters. `termination.max_iterations` caps the number of stumps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GbtConfig {
    /// Column holding the regression target; every other column is a feature.
    pub target_column: usize,
    pub n_bins: usize,
    pub learning_rate: f64,
    pub min_observations_in_leaf: u64,
    pub termination: TerminationConfig,
}

impl Default for GbtConfig {
    fn default() -> Self {
        Self {
            target_column: 0,
            n_bins: 32,
            learning_rate: 0.1,
            min_observations_in_leaf: 5,
            termination: TerminationConfig {
                max_iterations: 50,
                convergence_threshold: 1e-6,
                ..TerminationConfig::default()
            },
        }
    }
}

impl GbtConfig {
    pub fn validate(&self) -> Result<()> {
        if self.n_bins < 2 {
            return Err(DiapError::InvalidConfig("n_bins must be at least 2".into()));
        }
        if !(self.learning_rate > 0.0 && self.learning_rate <= 1.0) {
            return Err(DiapError::InvalidConfig(
                "learning_rate must be in (0, 1]".into(),
            ));
        }
        if self.min_observations_in_leaf == 0 {
            return Err(DiapError::InvalidConfig(
                "min_observations_in_leaf must be at least 1".into(),
            ));
        }
        self.termination.validate()
    }
}

/// Uniform bin edges per column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Binning {
    pub lower: Vec<f64>,
    pub width: Vec<f64>,
    pub n_bins: usize,
}

impl Binning {
    fn from_range(min: &[f64], max: &[f64], n_bins: usize) -> Self {
        let width = min
            .iter()
            .zip(max)
            .map(|(lo, hi)| {
                let w = (hi - lo) / n_bins as f64;
                if w.is_finite() && w > 0.0 {
                    w
                } else {
                    0.0
                }
            })
            .collect();
        Self {
            lower: min.iter().map(|lo| if lo.is_finite() { *lo } else { 0.0 }).collect(),
            width,
            n_bins,
        }
    }

    pub fn bin(&self, column: usize, x: f64) -> usize {
        let width = self.width[column];
        if width == 0.0 || !x.is_finite() {
            return 0;
        }
        let raw = ((x - self.lower[column]) / width).floor();
        if raw <= 0.0 {
            0
        } else {
            (raw as usize).min(self.n_bins - 1)
        }
    }

    /// Upper edge of `bin`.
    fn edge(&self, column: usize, bin: usize) -> f64 {
        self.lower[column] + (bin + 1) as f64 * self.width[column]
    }
}

/// A depth-one regression tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stump {
    pub feature: usize,
    /// Rows whose bin is at most `split_bin` go left.
    pub split_bin: usize,
    /// Upper edge of `split_bin`, for reporting.
    pub threshold: f64,
    pub left: f64,
    pub right: f64,
    pub gain: f64,
}

impl Stump {
    fn value(&self, binning: &Binning, row: &ArrayView1<f64>) -> f64 {
        if binning.bin(self.feature, row[self.feature]) <= self.split_bin {
            self.left
        } else {
            self.right
        }
    }
}

/// Global boosting state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GbtState {
    pub base_score: f64,
    pub learning_rate: f64,
    pub target_column: usize,
    pub n_columns: usize,
    pub binning: Binning,
    pub stumps: Vec<Stump>,
    /// Mean squared residual before each round's stump.
    pub training_loss: Vec<f64>,
}

/// Trained ensemble.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GbtModel {
    pub base_score: f64,
    pub target_column: usize,
    pub n_columns: usize,
    pub binning: Binning,
    pub stumps: Vec<Stump>,
    pub training_loss: Vec<f64>,
}

impl GbtModel {
    /// Prediction for a full-width row (the target column is ignored).
    pub fn predict(&self, row: &ArrayView1<f64>) -> f64 {
        self.base_score
            + self
                .stumps
                .iter()
                .map(|stump| stump.value(&self.binning, row))
                .sum::<f64>()
    }

    pub fn predict_table(&self, table: &NumericTable) -> Result<Vec<f64>> {
        if table.nrows() > 0 && table.ncols() != self.n_columns {
            return Err(DiapError::InvalidData(format!(
                "model expects {} columns, table has {}",
                self.n_columns,
                table.ncols()
            )));
        }
        Ok((0..table.nrows())
            .map(|i| self.predict(&table.row(i).view()))
            .collect())
    }
}

/// Running predictions of one shard.
#[derive(Debug, Clone, Default)]
pub struct GbtCarry {
    applied: usize,
    predictions: Vec<f64>,
}

struct GbtStep;

impl PartialComputation for GbtStep {
    type Input = GbtState;
    type Local = GbtCarry;

    fn output_variant(&self) -> Variant {
        Variant::GbtHistograms
    }

    fn compute(&self, ctx: ShardContext<'_, GbtCarry>, state: &GbtState) -> Result<LocalStep<GbtCarry>> {
        ctx.expect_columns(state.n_columns)?;
        let n = ctx.data.nrows();
        let mut carry = ctx.prior.cloned().unwrap_or_else(|| GbtCarry {
            applied: 0,
            predictions: vec![state.base_score; n],
        });
        let n_bins = state.binning.n_bins;
        let mut cells = vec![CompensatedSum::default(); state.n_columns * n_bins];
        let mut counts = vec![0u64; state.n_columns * n_bins];
        let mut sse = CompensatedSum::default();
        for i in 0..n {
            let row = ctx.data.row(i);
            let row = row.view();
            for stump in state.stumps.iter().skip(carry.applied) {
                carry.predictions[i] += stump.value(&state.binning, &row);
            }
            let residual = row[state.target_column] - carry.predictions[i];
            sse.add(residual * residual);
            for column in (0..state.n_columns).filter(|&c| c != state.target_column) {
                let cell = column * n_bins + state.binning.bin(column, row[column]);
                cells[cell].add(residual);
                counts[cell] += 1;
            }
        }
        carry.applied = state.stumps.len();
        let histograms = Array2::from_shape_fn((cells.len(), 2), |(cell, j)| {
            if j == 0 {
                cells[cell].value()
            } else {
                counts[cell] as f64
            }
        });
        let fields = NamedFields::new(Variant::GbtHistograms)
            .with(FieldId::NObservations, FieldValue::Count(n as u64))?
            .with(FieldId::Histograms, FieldValue::Dense(histograms))?
            .with(FieldId::PartialObjectiveFunction, FieldValue::Scalar(sse.value()))?;
        Ok(LocalStep::with_carry(fields, carry))
    }
}

struct GbtMerge {
    min_leaf: u64,
}

struct Split {
    feature: usize,
    bin: usize,
    gain: f64,
    left: (f64, f64),
    right: (f64, f64),
}

impl MergeStrategy for GbtMerge {
    type State = GbtState;
    type Output = GbtModel;

    fn input_variant(&self) -> Variant {
        Variant::GbtHistograms
    }

    fn merge(&self, current: &GbtState, partials: &[&PartialResult]) -> Result<(GbtState, ConvergenceSignal)> {
        let n_bins = current.binning.n_bins;
        let cells = current.n_columns * n_bins;
        let mut sums = vec![CompensatedSum::default(); cells];
        let mut counts = vec![0.0f64; cells];
        let mut sse = CompensatedSum::default();
        let mut n = 0u64;
        for partial in partials {
            let fields = partial.fields();
            let histograms = fields.dense(FieldId::Histograms)?;
            if histograms.dim() != (cells, 2) {
                return Err(DiapError::InvalidData(format!(
                    "shard {} sent histograms of shape {:?}, expected ({cells}, 2)",
                    partial.shard(),
                    histograms.dim()
                )));
            }
            for cell in 0..cells {
                sums[cell].add(histograms[(cell, 0)]);
                counts[cell] += histograms[(cell, 1)];
            }
            sse.add(fields.scalar(FieldId::PartialObjectiveFunction)?);
            n += fields.count(FieldId::NObservations)?;
        }
        let mut next = current.clone();
        if n == 0 {
            return Ok((next, ConvergenceSignal::Finished));
        }
        let total_n = n as f64;
        next.training_loss.push(sse.value() / total_n);

        let mut best: Option<Split> = None;
        for feature in (0..current.n_columns).filter(|&c| c != current.target_column) {
            let base = feature * n_bins;
            let total: f64 = {
                let mut s = CompensatedSum::default();
                (0..n_bins).for_each(|b| s.add(sums[base + b].value()));
                s.value()
            };
            let mut left_sum = CompensatedSum::default();
            let mut left_n = 0.0;
            for bin in 0..n_bins - 1 {
                left_sum.add(sums[base + bin].value());
                left_n += counts[base + bin];
                let right_n = total_n - left_n;
                if left_n < self.min_leaf as f64 || right_n < self.min_leaf as f64 {
                    continue;
                }
                let sl = left_sum.value();
                let sr = total - sl;
                let gain = sl * sl / left_n + sr * sr / right_n - total * total / total_n;
                if best.as_ref().map_or(true, |b| gain > b.gain) {
                    best = Some(Split {
                        feature,
                        bin,
                        gain,
                        left: (sl, left_n),
                        right: (sr, right_n),
                    });
                }
            }
        }
        match best {
            Some(split) if split.gain > 0.0 => {
                let lr = current.learning_rate;
                let stump = Stump {
                    feature: split.feature,
                    split_bin: split.bin,
                    threshold: current.binning.edge(split.feature, split.bin),
                    left: lr * split.left.0 / split.left.1,
                    right: lr * split.right.0 / split.right.1,
                    gain: split.gain,
                };
                tracing::debug!(
                    feature = stump.feature,
                    threshold = stump.threshold,
                    gain = stump.gain,
                    "stump added"
                );
                next.stumps.push(stump);
                Ok((next, ConvergenceSignal::Measure(split.gain / total_n)))
            }
            _ => Ok((next, ConvergenceSignal::Finished)),
        }
    }

    fn finalize(&self, state: &GbtState, _: &[&PartialResult], _: &RoundProgress) -> Result<GbtModel> {
        Ok(GbtModel {
            base_score: state.base_score,
            target_column: state.target_column,
            n_columns: state.n_columns,
            binning: state.binning.clone(),
            stumps: state.stumps.clone(),
            training_loss: state.training_loss.clone(),
        })
    }
}

/// Fit boosted stumps to `config.target_column` of the active shards.
pub fn train_boosted(shards: &mut ShardSet, config: &GbtConfig) -> Result<RunResult<GbtState, GbtModel>> {
    config.validate()?;
    let n_columns = shards.feature_dim()?;
    if n_columns < 2 || config.target_column >= n_columns {
        return Err(DiapError::InvalidConfig(format!(
            "target column {} needs a table with at least one other column (found {n_columns})",
            config.target_column
        )));
    }
    let summary = compute_moments(shards, config.termination.shard_failure)?.output;
    let initial = GbtState {
        base_score: summary.mean[config.target_column],
        learning_rate: config.learning_rate,
        target_column: config.target_column,
        n_columns,
        binning: Binning::from_range(&summary.min, &summary.max, config.n_bins),
        stumps: Vec::new(),
        training_loss: Vec::new(),
    };
    let termination = config.termination.clone();
    let min_leaf = config.min_observations_in_leaf;
    let mut result = shards.with_stage(|staged: &mut ShardSet<GbtCarry>| -> Result<RunResult<GbtState, GbtModel>> {
        RoundController::new(GbtStep, GbtMerge { min_leaf }, staged.active_ids(), termination)?
            .run(staged, initial)
    })?;
    result.missing_shards = shards.retired_ids();
    tracing::info!(
        stumps = result.output.stumps.len(),
        iterations = result.iterations,
        converged = result.converged,
        "boosting finished"
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Column 0 is the target: +5 when feature 1 is at least 0.5, else -5.
    fn step_data() -> Array2<f64> {
        Array2::from_shape_fn((100, 3), |(i, j)| match j {
            0 => {
                if i >= 50 {
                    5.0
                } else {
                    -5.0
                }
            }
            1 => i as f64 / 100.0,
            _ => ((i * 37) % 100) as f64 / 100.0,
        })
    }

    fn config() -> GbtConfig {
        GbtConfig {
            target_column: 0,
            n_bins: 10,
            learning_rate: 0.5,
            min_observations_in_leaf: 1,
            termination: TerminationConfig {
                max_iterations: 20,
                convergence_threshold: 1e-6,
                ..TerminationConfig::default()
            },
        }
    }

    #[test]
    fn stumps_learn_a_step_function() {
        let data = step_data();
        let mut shards = ShardSet::split_rows(&data, 3).expect("split");
        let result = train_boosted(&mut shards, &config()).expect("train");
        let model = result.output;
        assert!(result.converged);
        assert!(result.iterations <= 20);
        assert!(model.base_score.abs() < 1e-9);
        assert_eq!(model.stumps[0].feature, 1);
        assert_eq!(model.stumps[0].split_bin, 4);
        assert!(model.training_loss.windows(2).all(|w| w[1] < w[0]));
        let predictions = model
            .predict_table(&NumericTable::Dense(data.clone()))
            .expect("predict");
        for (i, p) in predictions.iter().enumerate() {
            assert!((p - data[(i, 0)]).abs() < 1e-3, "row {i}: {p}");
        }
    }

    #[test]
    fn shard_count_does_not_change_the_ensemble() {
        let data = step_data();
        let mut one = ShardSet::split_rows(&data, 1).expect("split");
        let mut five = ShardSet::split_rows(&data, 5).expect("split").with_wire_boundary(true);
        let a = train_boosted(&mut one, &config()).expect("train").output;
        let b = train_boosted(&mut five, &config()).expect("train").output;
        assert_eq!(a.stumps.len(), b.stumps.len());
        for (x, y) in a.stumps.iter().zip(&b.stumps) {
            assert_eq!((x.feature, x.split_bin), (y.feature, y.split_bin));
            assert!((x.left - y.left).abs() < 1e-9);
            assert!((x.right - y.right).abs() < 1e-9);
        }
    }

    #[test]
    fn target_outside_the_table_is_rejected() {
        let mut shards = ShardSet::split_rows(&step_data(), 2).expect("split");
        let cfg = GbtConfig {
            target_column: 3,
            ..config()
        };
        assert!(matches!(
            train_boosted(&mut shards, &cfg),
            Err(DiapError::InvalidConfig(_))
        ));
    }
}
