//! Distributed Lloyd iterations.
//!
//! Each shard assigns its rows to the nearest centroid and reports per-cluster
//! counts and coordinate sums, its share of the objective and its farthest
//! rows. The master turns the sums into new centroids and reseeds clusters
//! that lost every row with the globally farthest candidates.

use ndarray::Array2;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::init::{initialize, InitConfig};
use crate::aggregator::{ConvergenceSignal, MergeStrategy, RoundProgress};
use crate::config::{ResultsToCompute, TerminationConfig};
use crate::controller::{RoundController, RunResult};
use crate::error::{DiapError, Result};
use crate::exchange::KeyedCollection;
use crate::fields::{FieldId, FieldKind, FieldValue, NamedFields, Variant};
use crate::numeric::CompensatedSum;
use crate::partial::{LocalStep, PartialComputation, PartialResult, ShardContext, ShardId};
use crate::shard::ShardSet;
use crate::table::NumericTable;
use crate::DataMatrix;

/// Configurable knobs for a distributed k-means run.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct KMeansConfig {
    /// Number of centroids to optimise.
    pub k: usize,
    pub init: InitConfig,
    /// Round limit, shift tolerance, optional outputs and failure policy.
    pub termination: TerminationConfig,
}

impl Default for KMeansConfig {
    fn default() -> Self {
        Self {
            k: 8,
            init: InitConfig::default(),
            termination: TerminationConfig::default(),
        }
    }
}

impl KMeansConfig {
    pub fn validate(&self) -> Result<()> {
        if self.k == 0 {
            return Err(DiapError::InvalidConfig(
                "k must be greater than zero".into(),
            ));
        }
        self.init.validate()?;
        self.termination.validate()
    }
}

/// Global state between Lloyd rounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KMeansState {
    pub centroids: DataMatrix,
    /// Objective of the previous centroids; infinite before the first round.
    pub objective: f64,
    /// Rows assigned to each of the previous centroids.
    pub cluster_sizes: Vec<u64>,
}

impl KMeansState {
    /// State before any round has been merged.
    pub fn new(centroids: DataMatrix) -> Self {
        Self {
            centroids,
            objective: f64::INFINITY,
            cluster_sizes: Vec::new(),
        }
    }
}

/// Terminal k-means outputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KMeansOutput {
    pub centroids: DataMatrix,
    /// Sum of squared distances to the closest centroid.
    pub objective: Option<f64>,
    /// Per-shard cluster labels, when requested.
    pub assignments: Option<KeyedCollection<Vec<i64>>>,
    /// Rows assigned to each centroid in the last round.
    pub cluster_sizes: Vec<u64>,
}

/// Local Lloyd step.
pub struct KMeansStep {
    pub results: ResultsToCompute,
}

impl KMeansStep {
    /// Run the step on a `KMeansInput` record, as a remote worker would.
    pub fn compute_from_input(&self, shard: ShardId, round: u32, input: &NamedFields) -> Result<PartialResult> {
        if input.variant() != Variant::KMeansInput {
            return Err(DiapError::VariantMismatch {
                expected: Variant::KMeansInput,
                found: input.variant(),
            });
        }
        let data = match input.get(FieldId::Data)? {
            FieldValue::Dense(m) => NumericTable::Dense(m.clone()),
            FieldValue::Sparse(t) => NumericTable::Sparse(t.clone()),
            other => {
                return Err(DiapError::FieldKindMismatch {
                    variant: Variant::KMeansInput,
                    field: FieldId::Data,
                    expected: FieldKind::Table,
                    found: other.kind(),
                })
            }
        };
        let state = KMeansState::new(input.dense(FieldId::InputCentroids)?.clone());
        let ctx = ShardContext {
            shard,
            round,
            data: &data,
            prior: None,
        };
        let step = self.compute(ctx, &state)?;
        Ok(PartialResult::new(shard, round, step.fields))
    }
}

fn closest_centroid(data: &NumericTable, row: usize, centroids: &DataMatrix, norms: &[f64]) -> (usize, f64) {
    let mut best = (0usize, f64::INFINITY);
    for (cid, centroid) in centroids.outer_iter().enumerate() {
        let d = data.squared_distance(row, &centroid, norms[cid]);
        if d < best.1 {
            best = (cid, d);
        }
    }
    best
}

impl PartialComputation for KMeansStep {
    type Input = KMeansState;
    type Local = ();

    fn output_variant(&self) -> Variant {
        Variant::KMeansPartial
    }

    fn compute(&self, ctx: ShardContext<'_, ()>, state: &KMeansState) -> Result<LocalStep<()>> {
        let (k, dim) = state.centroids.dim();
        if k == 0 {
            return Err(DiapError::InvalidState("no centroids to assign to".into()));
        }
        ctx.expect_columns(dim)?;
        let data = ctx.data;
        let n = data.nrows();
        let norms: Vec<f64> = state.centroids.outer_iter().map(|c| c.dot(&c)).collect();
        let nearest: Vec<(usize, f64)> = (0..n)
            .into_par_iter()
            .map(|i| closest_centroid(data, i, &state.centroids, &norms))
            .collect();

        let mut counts = vec![0u64; k];
        let mut sums = vec![CompensatedSum::default(); k * dim];
        let mut objective = CompensatedSum::default();
        for (i, &(cid, d)) in nearest.iter().enumerate() {
            counts[cid] += 1;
            objective.add(d);
            match data {
                NumericTable::Dense(m) => {
                    for (j, &x) in m.row(i).iter().enumerate() {
                        sums[cid * dim + j].add(x);
                    }
                }
                NumericTable::Sparse(t) => {
                    for (j, x) in t.row(i) {
                        sums[cid * dim + j].add(x);
                    }
                }
            }
        }
        let sums = Array2::from_shape_fn((k, dim), |(c, j)| sums[c * dim + j].value());

        // Farthest rows first; ties keep row order.
        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by(|&a, &b| nearest[b].1.total_cmp(&nearest[a].1).then(a.cmp(&b)));
        order.truncate(k);
        let distances: Vec<f64> = order.iter().map(|&i| nearest[i].1).collect();
        let mut candidates = Array2::zeros((order.len(), dim));
        for (slot, &i) in order.iter().enumerate() {
            candidates.row_mut(slot).assign(&data.row(i));
        }

        let mut fields = NamedFields::new(Variant::KMeansPartial)
            .with(FieldId::NObservations, FieldValue::Counts(counts))?
            .with(FieldId::PartialSums, FieldValue::Dense(sums))?
            .with(FieldId::PartialObjectiveFunction, FieldValue::Scalar(objective.value()))?
            .with(FieldId::PartialCandidatesDistances, FieldValue::Vector(distances))?
            .with(FieldId::PartialCandidatesCentroids, FieldValue::Dense(candidates))?;
        if self.results.contains(ResultsToCompute::ASSIGNMENTS) {
            let labels = nearest.iter().map(|&(cid, _)| cid as i64).collect();
            fields.set(FieldId::PartialAssignments, FieldValue::Labels(labels))?;
        }
        Ok(LocalStep::fields(fields))
    }
}

/// Master rule of a Lloyd round.
pub struct KMeansMerge {
    pub k: usize,
    pub dim: usize,
    pub results: ResultsToCompute,
}

struct MergedCounts<'p> {
    counts: Vec<u64>,
    sums: Vec<CompensatedSum>,
    objective: CompensatedSum,
    /// `(distance, shard, position, row)` of every candidate.
    candidates: Vec<(f64, ShardId, usize, ndarray::ArrayView1<'p, f64>)>,
}

impl KMeansMerge {
    fn accumulate<'p>(&self, partials: &[&'p PartialResult]) -> Result<MergedCounts<'p>> {
        let (k, dim) = (self.k, self.dim);
        let mut merged = MergedCounts {
            counts: vec![0; k],
            sums: vec![CompensatedSum::default(); k * dim],
            objective: CompensatedSum::default(),
            candidates: Vec::new(),
        };
        for &partial in partials {
            let shard = partial.shard();
            let fields = partial.fields();
            let counts = fields.counts(FieldId::NObservations)?;
            let sums = fields.dense(FieldId::PartialSums)?;
            if counts.len() != k || sums.dim() != (k, dim) {
                return Err(DiapError::InvalidData(format!(
                    "shard {shard} reported {} counts and {:?} sums for {k} clusters of width {dim}",
                    counts.len(),
                    sums.dim()
                )));
            }
            for cid in 0..k {
                merged.counts[cid] += counts[cid];
                for j in 0..dim {
                    merged.sums[cid * dim + j].add(sums[(cid, j)]);
                }
            }
            merged.objective.add(fields.scalar(FieldId::PartialObjectiveFunction)?);
            let distances = fields.vector(FieldId::PartialCandidatesDistances)?;
            let rows = fields.dense(FieldId::PartialCandidatesCentroids)?;
            if distances.len() != rows.nrows() || (rows.nrows() > 0 && rows.ncols() != dim) {
                return Err(DiapError::InvalidData(format!(
                    "shard {shard} sent {} candidate distances for a {:?} candidate table",
                    distances.len(),
                    rows.dim()
                )));
            }
            for (pos, (&d, row)) in distances.iter().zip(rows.outer_iter()).enumerate() {
                merged.candidates.push((d, shard, pos, row));
            }
        }
        merged
            .candidates
            .sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));
        Ok(merged)
    }
}

impl MergeStrategy for KMeansMerge {
    type State = KMeansState;
    type Output = KMeansOutput;

    fn input_variant(&self) -> Variant {
        Variant::KMeansPartial
    }

    fn merge(&self, current: &KMeansState, partials: &[&PartialResult]) -> Result<(KMeansState, ConvergenceSignal)> {
        if current.centroids.dim() != (self.k, self.dim) {
            return Err(DiapError::InvalidState(format!(
                "state holds {:?} centroids, expected ({}, {})",
                current.centroids.dim(),
                self.k,
                self.dim
            )));
        }
        let merged = self.accumulate(partials)?;
        let mut centroids = current.centroids.clone();
        let mut spare = merged.candidates.iter();
        let mut max_shift = 0.0f64;
        let mut reseeded = 0usize;
        for cid in 0..self.k {
            let count = merged.counts[cid];
            let mut row = centroids.row_mut(cid);
            if count > 0 {
                for j in 0..self.dim {
                    let next = merged.sums[cid * self.dim + j].value() / count as f64;
                    max_shift = max_shift.max((row[j] - next).abs());
                    row[j] = next;
                }
            } else if let Some((_, _, _, candidate)) = spare.next() {
                for j in 0..self.dim {
                    max_shift = max_shift.max((row[j] - candidate[j]).abs());
                }
                row.assign(candidate);
                reseeded += 1;
            }
        }
        if reseeded > 0 {
            tracing::debug!(reseeded, "empty clusters reseeded from farthest rows");
        }
        let state = KMeansState {
            centroids,
            objective: merged.objective.value(),
            cluster_sizes: merged.counts,
        };
        Ok((state, ConvergenceSignal::Measure(max_shift)))
    }

    fn finalize(&self, state: &KMeansState, partials: &[&PartialResult], _: &RoundProgress) -> Result<KMeansOutput> {
        let assignments = if self.results.contains(ResultsToCompute::ASSIGNMENTS) {
            let mut labels = KeyedCollection::new();
            for partial in partials {
                let shard_labels = partial.fields().labels(FieldId::PartialAssignments)?;
                labels.route(partial.shard(), shard_labels.clone())?;
            }
            Some(labels)
        } else {
            None
        };
        Ok(KMeansOutput {
            centroids: state.centroids.clone(),
            objective: self
                .results
                .contains(ResultsToCompute::OBJECTIVE_FUNCTION)
                .then_some(state.objective),
            assignments,
            cluster_sizes: state.cluster_sizes.clone(),
        })
    }
}

/// Initialise centroids with `config.init`, then run Lloyd rounds.
pub fn train_distributed(
    shards: &mut ShardSet,
    config: &KMeansConfig,
) -> Result<RunResult<KMeansState, KMeansOutput>> {
    config.validate()?;
    if shards.total_rows() < config.k {
        return Err(DiapError::InvalidConfig(format!(
            "dataset has {} samples but k = {}; add more data or decrease k",
            shards.total_rows(),
            config.k
        )));
    }
    let initial = initialize(shards, config.k, &config.init, config.termination.shard_failure)?;
    train_from_centroids(shards, initial, config)
}

/// Run Lloyd rounds starting from `centroids`.
pub fn train_from_centroids(
    shards: &mut ShardSet,
    centroids: DataMatrix,
    config: &KMeansConfig,
) -> Result<RunResult<KMeansState, KMeansOutput>> {
    config.validate()?;
    let (k, dim) = centroids.dim();
    if k != config.k {
        return Err(DiapError::InvalidConfig(format!(
            "{k} initial centroids given for k = {}",
            config.k
        )));
    }
    let results = config.termination.results_to_compute;
    let controller = RoundController::new(
        KMeansStep { results },
        KMeansMerge { k, dim, results },
        shards.active_ids(),
        config.termination.clone(),
    )?;
    let mut result = controller.run(shards, KMeansState::new(centroids))?;
    result.missing_shards = shards.retired_ids();
    tracing::info!(
        k,
        iterations = result.iterations,
        converged = result.converged,
        objective = result.state.objective,
        "k-means finished"
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::Aggregator;
    use crate::config::ShardFailurePolicy;
    use crate::data::{generate_clustered_points, random_centers};
    use crate::shard::require_all;
    use crate::table::CsrTable;
    use ndarray::array;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn three_shards_of_blobs() -> DataMatrix {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let centers = random_centers(5, 3, 20.0, &mut rng);
        generate_clustered_points(60, &centers, 0.8, &mut rng).expect("generate")
    }

    fn config(results: ResultsToCompute) -> KMeansConfig {
        KMeansConfig {
            k: 5,
            termination: TerminationConfig {
                max_iterations: 10,
                convergence_threshold: 1e-4,
                results_to_compute: results,
                ..TerminationConfig::default()
            },
            ..KMeansConfig::default()
        }
    }

    #[test]
    fn three_shards_five_clusters_within_round_limit() {
        let data = three_shards_of_blobs();
        let mut shards = ShardSet::split_rows(&data, 3).expect("split");
        assert_eq!(shards.total_rows(), 300);
        let cfg = config(ResultsToCompute::ALL);
        let result = train_distributed(&mut shards, &cfg).expect("train");
        assert!(result.iterations <= 10);
        assert_eq!(result.state.centroids.dim(), (5, 3));
        let output = result.output;
        assert_eq!(output.cluster_sizes.iter().sum::<u64>(), 300);
        assert_eq!(result.state.cluster_sizes, output.cluster_sizes);
        let assignments = output.assignments.expect("assignments requested");
        assert_eq!(assignments.len(), 3);
        assert_eq!(assignments.get(ShardId(0)).expect("shard 0").len(), 100);
        assert!(output.objective.expect("objective").is_finite());

        let mut wired = ShardSet::split_rows(&data, 3).expect("split").with_wire_boundary(true);
        let again = train_distributed(&mut wired, &cfg).expect("train");
        assert_eq!(again.iterations, result.iterations);
        for (a, b) in again.state.centroids.iter().zip(result.state.centroids.iter()) {
            assert!((a - b).abs() < 1e-9);
        }
    }

    #[test]
    fn reversed_arrival_is_bit_identical_end_to_end() {
        let data = three_shards_of_blobs();
        let cfg = config(ResultsToCompute::ALL);
        // One worker thread makes arrival order follow outcome order.
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(1)
            .build()
            .expect("pool");
        let (forward, backward) = pool.install(|| {
            let mut ascending = ShardSet::split_rows(&data, 3).expect("split");
            let mut descending = ShardSet::split_rows(&data, 3)
                .expect("split")
                .with_reversed_outcomes();
            (
                train_distributed(&mut ascending, &cfg).expect("ascending"),
                train_distributed(&mut descending, &cfg).expect("descending"),
            )
        });
        assert_eq!(forward.iterations, backward.iterations);
        for (a, b) in forward.state.centroids.iter().zip(backward.state.centroids.iter()) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
        assert_eq!(
            forward.output.objective.map(f64::to_bits),
            backward.output.objective.map(f64::to_bits)
        );
        assert_eq!(forward.output.cluster_sizes, backward.output.cluster_sizes);
        assert_eq!(forward.output.assignments, backward.output.assignments);
    }

    #[test]
    fn reversed_submission_order_gives_same_centroids() {
        let data = three_shards_of_blobs();
        let mut shards = ShardSet::split_rows(&data, 3).expect("split");
        let initial = data.select(ndarray::Axis(0), &[0, 61, 122, 183, 244]);
        let results = ResultsToCompute::OBJECTIVE_FUNCTION;
        let merge = || KMeansMerge { k: 5, dim: 3, results };
        let mut forward = KMeansState::new(initial.clone());
        let mut backward = forward.clone();
        for round in 0..10 {
            let step = KMeansStep { results };
            let a = Aggregator::starting_at(merge(), shards.active_ids(), round);
            for partial in require_all(shards.compute(&step, &forward, round)).expect("compute") {
                a.add_partial_result(partial.shard(), partial).expect("add");
            }
            let b = Aggregator::starting_at(merge(), shards.active_ids(), round);
            let mut partials = require_all(shards.compute(&step, &backward, round)).expect("compute");
            partials.sort_by_key(|p| std::cmp::Reverse(p.shard()));
            for partial in partials {
                b.add_partial_result(partial.shard(), partial).expect("add");
            }
            forward = a.merge(&forward).expect("merge").0;
            backward = b.merge(&backward).expect("merge").0;
        }
        for (x, y) in forward.centroids.iter().zip(backward.centroids.iter()) {
            assert!((x - y).abs() < 1e-9);
        }
        assert_eq!(forward.objective.to_bits(), backward.objective.to_bits());
    }

    #[test]
    fn sparse_and_dense_shards_agree() {
        let data = three_shards_of_blobs();
        let dense = ShardSet::split_rows(&data, 3).expect("split");
        let sparse_tables = dense
            .tables()
            .map(|(id, table)| (id, NumericTable::Sparse(CsrTable::from_dense(&table.dense()))))
            .collect();
        let mut sparse = ShardSet::from_shards(sparse_tables).expect("shards");
        let mut dense = dense;
        let initial = data.select(ndarray::Axis(0), &[5, 70, 130, 190, 250]);
        let cfg = config(ResultsToCompute::OBJECTIVE_FUNCTION);
        let a = train_from_centroids(&mut dense, initial.clone(), &cfg).expect("dense");
        let b = train_from_centroids(&mut sparse, initial, &cfg).expect("sparse");
        assert_eq!(a.iterations, b.iterations);
        for (x, y) in a.state.centroids.iter().zip(b.state.centroids.iter()) {
            assert!((x - y).abs() < 1e-9);
        }
    }

    #[test]
    fn empty_cluster_is_reseeded_with_farthest_row() {
        let data = array![[0.0, 0.0], [0.0, 1.0], [10.0, 10.0]];
        let mut shards = ShardSet::split_rows(&data, 2).expect("split");
        let cfg = KMeansConfig {
            k: 2,
            termination: TerminationConfig {
                max_iterations: 1,
                ..TerminationConfig::default()
            },
            ..KMeansConfig::default()
        };
        let result = train_from_centroids(&mut shards, array![[0.0, 0.5], [1000.0, 1000.0]], &cfg)
            .expect("train");
        assert_eq!(result.state.centroids.row(1).to_vec(), vec![10.0, 10.0]);
        assert!((result.state.centroids[(0, 0)] - 10.0 / 3.0).abs() < 1e-12);
        assert_eq!(result.output.cluster_sizes, vec![3, 0]);
    }

    #[test]
    fn finalize_reports_sizes_carried_by_the_merge() {
        let merge = KMeansMerge {
            k: 2,
            dim: 1,
            results: ResultsToCompute::OBJECTIVE_FUNCTION,
        };
        let state = KMeansState {
            centroids: array![[0.0], [5.0]],
            objective: 4.0,
            cluster_sizes: vec![7, 2],
        };
        let progress = RoundProgress {
            iterations: 3,
            converged: true,
            missing_shards: Default::default(),
        };
        let output = merge.finalize(&state, &[], &progress).expect("finalize");
        assert_eq!(output.cluster_sizes, vec![7, 2]);
        assert_eq!(output.objective, Some(4.0));
        assert!(output.assignments.is_none());
    }

    #[test]
    fn named_input_is_checked() {
        let step = KMeansStep {
            results: ResultsToCompute::ASSIGNMENTS,
        };
        let input = NamedFields::new(Variant::KMeansInput)
            .with(FieldId::Data, FieldValue::Dense(array![[1.0, 2.0, 3.0]]))
            .and_then(|f| f.with(FieldId::InputCentroids, FieldValue::Dense(array![[0.0, 0.0]])))
            .expect("valid");
        let err = step.compute_from_input(ShardId(3), 0, &input).unwrap_err();
        assert!(matches!(err, DiapError::InvalidInputShape { shard: ShardId(3), expected: 2, found: 3 }));

        let mut input = NamedFields::new(Variant::KMeansInput);
        let err = input.set_by_name("partialSums", FieldValue::Dense(array![[1.0]])).unwrap_err();
        assert!(matches!(err, DiapError::UnsupportedIdentifier { .. }));

        let input = NamedFields::new(Variant::KMeansInput)
            .with(FieldId::Data, FieldValue::Sparse(CsrTable::from_dense(&array![[1.0, 0.0], [0.0, 3.0]])))
            .and_then(|f| f.with(FieldId::InputCentroids, FieldValue::Dense(array![[0.0, 0.0], [0.0, 3.0]])))
            .expect("valid");
        let partial = step.compute_from_input(ShardId(0), 0, &input).expect("compute");
        assert_eq!(partial.fields().labels(FieldId::PartialAssignments).expect("labels"), &vec![0, 1]);
        assert_eq!(partial.fields().counts(FieldId::NObservations).expect("counts"), &vec![1, 1]);
    }

    #[test]
    fn degraded_shard_is_reported_missing() {
        let data = three_shards_of_blobs();
        let mut tables: Vec<(ShardId, NumericTable)> = ShardSet::<()>::split_rows(&data, 3)
            .expect("split")
            .tables()
            .map(|(id, t)| (id, t.clone()))
            .collect();
        tables[2].1 = NumericTable::Dense(Array2::zeros((4, 2)));
        let mut shards = ShardSet::from_shards(tables).expect("shards");
        let mut cfg = config(ResultsToCompute::OBJECTIVE_FUNCTION);
        cfg.termination.shard_failure = ShardFailurePolicy::Degrade;
        let initial = data.select(ndarray::Axis(0), &[0, 61, 122, 183, 199]);
        let result = train_from_centroids(&mut shards, initial, &cfg).expect("train");
        assert_eq!(result.missing_shards, [ShardId(2)].into_iter().collect());
        assert_eq!(result.output.cluster_sizes.iter().sum::<u64>(), 200);
    }
}
