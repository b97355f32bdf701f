//! Distributed centroid initialisation.
//!
//! Every method starts by counting rows per shard and drawing the first
//! centre(s) uniformly on the master. `kmeans++` then adds one centre per
//! round: shards report their D² potential, the master picks a shard in
//! proportion to it and that shard samples one row. `parallel-plus`
//! oversamples `oversampling_factor * k` rows per round for a few rounds,
//! rates the candidates by how many rows they attract and reduces them to
//! `k` with a weighted k-means++ pass on the master.

use std::fmt;

use ndarray::Array2;
use rand::distributions::{Distribution, WeightedIndex};
use rand::seq::index;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use super::{exchange_gathered, merge_gathered, Pipeline};
use crate::aggregator::{ConvergenceSignal, MergeStrategy, RoundProgress};
use crate::config::ShardFailurePolicy;
use crate::error::{DiapError, Result};
use crate::exchange::{KeyedCollection, KeyedMerge};
use crate::fields::{FieldId, FieldValue, NamedFields, Variant};
use crate::numeric::{master_rng, shard_rng, CompensatedSum};
use crate::partial::{LocalStep, PartialComputation, PartialResult, ShardContext, ShardId};
use crate::shard::{stack_rows, ShardSet};
use crate::{squared_distance, DataMatrix};

/// Centroid initialisation strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum InitMethod {
    #[serde(rename = "random")]
    Random,
    #[default]
    #[serde(rename = "kmeans++")]
    KMeansPlusPlus,
    #[serde(rename = "parallel-plus")]
    ParallelPlus,
}

impl fmt::Display for InitMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitMethod::Random => write!(f, "random"),
            InitMethod::KMeansPlusPlus => write!(f, "kmeans++"),
            InitMethod::ParallelPlus => write!(f, "parallel-plus"),
        }
    }
}

impl std::str::FromStr for InitMethod {
    type Err = DiapError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "random" => Ok(Self::Random),
            "kmeans++" | "k-means++" => Ok(Self::KMeansPlusPlus),
            "parallel-plus" | "kmeans||" | "k-means||" => Ok(Self::ParallelPlus),
            other => Err(DiapError::InvalidConfig(format!(
                "unsupported init method '{other}'"
            ))),
        }
    }
}

/// Knobs for the initialisation pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InitConfig {
    pub method: InitMethod,
    /// Expected candidates per `parallel-plus` round, as a multiple of `k`.
    pub oversampling_factor: f64,
    /// Oversampling rounds of `parallel-plus`.
    pub rounds: u32,
    pub seed: u64,
}

impl Default for InitConfig {
    fn default() -> Self {
        Self {
            method: InitMethod::default(),
            oversampling_factor: 0.5,
            rounds: 5,
            seed: 42,
        }
    }
}

impl InitConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.oversampling_factor.is_finite() && self.oversampling_factor > 0.0) {
            return Err(DiapError::InvalidConfig(
                "oversampling_factor must be a positive number".into(),
            ));
        }
        if self.method == InitMethod::ParallelPlus && self.rounds == 0 {
            return Err(DiapError::InvalidConfig(
                "parallel-plus needs at least one oversampling round".into(),
            ));
        }
        Ok(())
    }
}

/// Shard-local D² state: distance of every row to its closest candidate.
#[derive(Debug, Clone, Default)]
pub struct InitLocal {
    min_distances: Vec<f64>,
    /// Candidates already folded into `min_distances`.
    applied: usize,
}

/// Rows a shard must contribute in the next sampling step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SampleRequest {
    /// Exactly these local rows.
    Rows(Vec<u64>),
    /// This many rows drawn without replacement in proportion to D².
    Weighted(usize),
}

struct CountStep;

impl PartialComputation for CountStep {
    type Input = ();
    type Local = InitLocal;

    fn output_variant(&self) -> Variant {
        Variant::InitCounts
    }

    fn compute(&self, ctx: ShardContext<'_, InitLocal>, _: &()) -> Result<LocalStep<InitLocal>> {
        let fields = NamedFields::new(Variant::InitCounts)
            .with(FieldId::NObservations, FieldValue::Count(ctx.data.nrows() as u64))?;
        Ok(LocalStep::fields(fields))
    }
}

struct PotentialStep;

impl PartialComputation for PotentialStep {
    type Input = DataMatrix;
    type Local = InitLocal;

    fn output_variant(&self) -> Variant {
        Variant::InitPotential
    }

    fn compute(&self, ctx: ShardContext<'_, InitLocal>, centers: &DataMatrix) -> Result<LocalStep<InitLocal>> {
        ctx.expect_columns(centers.ncols())?;
        let n = ctx.data.nrows();
        let mut local = ctx.prior.cloned().unwrap_or_else(|| InitLocal {
            min_distances: vec![f64::INFINITY; n],
            applied: 0,
        });
        if local.applied > centers.nrows() {
            return Err(DiapError::InvalidState(format!(
                "shard {} has seen {} candidates but only {} were sent",
                ctx.shard,
                local.applied,
                centers.nrows()
            )));
        }
        for center in centers.outer_iter().skip(local.applied) {
            let norm = center.dot(&center);
            for (i, slot) in local.min_distances.iter_mut().enumerate() {
                let d = ctx.data.squared_distance(i, &center, norm);
                if d < *slot {
                    *slot = d;
                }
            }
        }
        local.applied = centers.nrows();
        let mut potential = CompensatedSum::default();
        local.min_distances.iter().for_each(|&d| potential.add(d));
        let fields = NamedFields::new(Variant::InitPotential)
            .with(FieldId::PartialPotential, FieldValue::Scalar(potential.value()))?;
        Ok(LocalStep::with_carry(fields, local))
    }
}

struct SampleStep {
    seed: u64,
}

impl PartialComputation for SampleStep {
    type Input = SampleRequest;
    type Local = InitLocal;

    fn output_variant(&self) -> Variant {
        Variant::InitSamples
    }

    fn compute(&self, ctx: ShardContext<'_, InitLocal>, request: &SampleRequest) -> Result<LocalStep<InitLocal>> {
        let n = ctx.data.nrows();
        let rows: Vec<usize> = match request {
            SampleRequest::Rows(rows) => {
                let rows: Vec<usize> = rows.iter().map(|&r| r as usize).collect();
                if let Some(bad) = rows.iter().find(|&&r| r >= n) {
                    return Err(DiapError::InvalidData(format!(
                        "shard {} asked for row {bad} but holds {n}",
                        ctx.shard
                    )));
                }
                rows
            }
            SampleRequest::Weighted(0) => Vec::new(),
            SampleRequest::Weighted(amount) => {
                let weights = &ctx.prior_or_invalid("weighted sampling")?.min_distances;
                let positive: Vec<usize> = (0..weights.len()).filter(|&i| weights[i] > 0.0).collect();
                let amount = (*amount).min(positive.len());
                let mut rng = shard_rng(self.seed, ctx.shard, ctx.round);
                let picked = index::sample_weighted(&mut rng, positive.len(), |i| weights[positive[i]], amount)
                    .map_err(|err| DiapError::InvalidData(format!("shard {}: {err}", ctx.shard)))?;
                let mut rows: Vec<usize> = picked.into_iter().map(|i| positive[i]).collect();
                rows.sort_unstable();
                rows
            }
        };
        let mut sample = Array2::zeros((rows.len(), ctx.data.ncols()));
        for (slot, &row) in rows.iter().enumerate() {
            sample.row_mut(slot).assign(&ctx.data.row(row));
        }
        let fields = NamedFields::new(Variant::InitSamples)
            .with(FieldId::PartialCentroids, FieldValue::Dense(sample))?;
        Ok(LocalStep::fields(fields))
    }
}

struct RatingStep;

impl PartialComputation for RatingStep {
    type Input = DataMatrix;
    type Local = InitLocal;

    fn output_variant(&self) -> Variant {
        Variant::InitRatings
    }

    fn compute(&self, ctx: ShardContext<'_, InitLocal>, candidates: &DataMatrix) -> Result<LocalStep<InitLocal>> {
        ctx.expect_columns(candidates.ncols())?;
        let norms: Vec<f64> = candidates.outer_iter().map(|c| c.dot(&c)).collect();
        let mut ratings = vec![0u64; candidates.nrows()];
        for i in 0..ctx.data.nrows() {
            let mut best = (0usize, f64::INFINITY);
            for (c, candidate) in candidates.outer_iter().enumerate() {
                let d = ctx.data.squared_distance(i, &candidate, norms[c]);
                if d < best.1 {
                    best = (c, d);
                }
            }
            if let Some(slot) = ratings.get_mut(best.0) {
                *slot += 1;
            }
        }
        let fields = NamedFields::new(Variant::InitRatings)
            .with(FieldId::CandidateRatings, FieldValue::Counts(ratings))?;
        Ok(LocalStep::fields(fields))
    }
}

/// Picks `amount` rows uniformly from the union of all shards.
struct UniformRows {
    amount: usize,
    seed: u64,
    round: u32,
}

impl KeyedMerge for UniformRows {
    type Value = SampleRequest;

    fn input_variant(&self) -> Variant {
        Variant::InitCounts
    }

    fn merge_keyed(
        &self,
        partials: &[&PartialResult],
        active: &std::collections::BTreeSet<ShardId>,
    ) -> Result<KeyedCollection<SampleRequest>> {
        let mut counts = Vec::with_capacity(partials.len());
        for partial in partials {
            counts.push((partial.shard(), partial.fields().count(FieldId::NObservations)?));
        }
        let total: u64 = counts.iter().map(|(_, n)| n).sum();
        if total < self.amount as u64 {
            return Err(DiapError::InvalidConfig(format!(
                "initialisation requires k <= n (k={}, n={total})",
                self.amount
            )));
        }
        let mut rng = master_rng(self.seed, self.round);
        let mut picks = index::sample(&mut rng, total as usize, self.amount).into_vec();
        picks.sort_unstable();
        let mut routed: KeyedCollection<SampleRequest> = KeyedCollection::new();
        let mut start = 0u64;
        let mut next = picks.iter().peekable();
        for (shard, n) in counts {
            let mut rows = Vec::new();
            while let Some(&&pick) = next.peek() {
                if (pick as u64) >= start + n {
                    break;
                }
                rows.push(pick as u64 - start);
                next.next();
            }
            start += n;
            routed.route(shard, SampleRequest::Rows(rows))?;
        }
        for &shard in active {
            if routed.get(shard).is_none() {
                routed.route(shard, SampleRequest::Rows(Vec::new()))?;
            }
        }
        Ok(routed)
    }
}

/// How many D²-weighted rows to request in total.
#[derive(Debug, Clone, Copy)]
enum Quota {
    /// One row, from a shard chosen in proportion to its potential.
    Single,
    /// About this many rows, spread in proportion to shard potentials.
    Oversample(f64),
}

struct PotentialQuota {
    quota: Quota,
    seed: u64,
    round: u32,
}

impl KeyedMerge for PotentialQuota {
    type Value = SampleRequest;

    fn input_variant(&self) -> Variant {
        Variant::InitPotential
    }

    fn merge_keyed(
        &self,
        partials: &[&PartialResult],
        active: &std::collections::BTreeSet<ShardId>,
    ) -> Result<KeyedCollection<SampleRequest>> {
        let mut potentials = Vec::with_capacity(partials.len());
        let mut total = CompensatedSum::default();
        for partial in partials {
            let phi = partial.fields().scalar(FieldId::PartialPotential)?;
            total.add(phi);
            potentials.push((partial.shard(), phi));
        }
        let total = total.value();
        tracing::debug!(round = self.round, potential = total, "d2 potential merged");
        let mut rng = master_rng(self.seed, self.round);
        let mut routed: KeyedCollection<SampleRequest> =
            active.iter().map(|&id| (id, SampleRequest::Weighted(0))).collect();
        if total <= 0.0 {
            return Ok(routed);
        }
        match self.quota {
            Quota::Single => {
                let target = rng.gen::<f64>() * total;
                let mut seen = 0.0;
                let chosen = potentials
                    .iter()
                    .filter(|(_, phi)| *phi > 0.0)
                    .find(|(_, phi)| {
                        seen += phi;
                        seen > target
                    })
                    .or_else(|| potentials.iter().rev().find(|(_, phi)| *phi > 0.0));
                if let Some(&(shard, _)) = chosen {
                    routed.insert(shard, SampleRequest::Weighted(1));
                }
            }
            Quota::Oversample(expected) => {
                for (shard, phi) in potentials {
                    let share = expected * phi / total;
                    let whole = share.floor();
                    let extra = usize::from(rng.gen::<f64>() < share - whole);
                    routed.insert(shard, SampleRequest::Weighted(whole as usize + extra));
                }
            }
        }
        Ok(routed)
    }
}

/// Appends every shard's sampled rows to the candidate set.
struct CollectSamples {
    dim: usize,
}

impl MergeStrategy for CollectSamples {
    type State = DataMatrix;
    type Output = DataMatrix;

    fn input_variant(&self) -> Variant {
        Variant::InitSamples
    }

    fn merge(&self, current: &DataMatrix, partials: &[&PartialResult]) -> Result<(DataMatrix, ConvergenceSignal)> {
        let mut blocks = vec![current];
        for partial in partials {
            let rows = partial.fields().dense(FieldId::PartialCentroids)?;
            if rows.nrows() > 0 && rows.ncols() != self.dim {
                return Err(DiapError::InvalidInputShape {
                    shard: partial.shard(),
                    expected: self.dim,
                    found: rows.ncols(),
                });
            }
            blocks.push(rows);
        }
        Ok((stack_rows(self.dim, &blocks)?, ConvergenceSignal::Finished))
    }

    fn finalize(&self, state: &DataMatrix, _: &[&PartialResult], _: &RoundProgress) -> Result<DataMatrix> {
        Ok(state.clone())
    }
}

/// Adds up candidate ratings.
struct SumRatings;

impl MergeStrategy for SumRatings {
    type State = Vec<u64>;
    type Output = Vec<u64>;

    fn input_variant(&self) -> Variant {
        Variant::InitRatings
    }

    fn merge(&self, current: &Vec<u64>, partials: &[&PartialResult]) -> Result<(Vec<u64>, ConvergenceSignal)> {
        let mut total = current.clone();
        for partial in partials {
            let ratings = partial.fields().counts(FieldId::CandidateRatings)?;
            if ratings.len() != total.len() {
                return Err(DiapError::InvalidData(format!(
                    "shard {} rated {} candidates, expected {}",
                    partial.shard(),
                    ratings.len(),
                    total.len()
                )));
            }
            total.iter_mut().zip(ratings).for_each(|(t, r)| *t += r);
        }
        Ok((total, ConvergenceSignal::Finished))
    }

    fn finalize(&self, state: &Vec<u64>, _: &[&PartialResult], _: &RoundProgress) -> Result<Vec<u64>> {
        Ok(state.clone())
    }
}

/// Choose `k` initial centroids from the rows of every active shard.
pub fn initialize(
    shards: &mut ShardSet,
    k: usize,
    config: &InitConfig,
    policy: ShardFailurePolicy,
) -> Result<DataMatrix> {
    config.validate()?;
    if k == 0 {
        return Err(DiapError::InvalidConfig("k must be greater than zero".into()));
    }
    let dim = shards.feature_dim()?;
    let centroids = shards.with_stage(|staged: &mut ShardSet<InitLocal>| -> Result<DataMatrix> {
        let mut pipeline = Pipeline::new(staged, policy);
        match config.method {
            InitMethod::Random => uniform(&mut pipeline, k, dim, config.seed),
            InitMethod::KMeansPlusPlus => {
                let first = uniform(&mut pipeline, 1, dim, config.seed)?;
                fill_sequentially(&mut pipeline, first, k, config.seed)
            }
            InitMethod::ParallelPlus => parallel_plus(&mut pipeline, k, dim, config),
        }
    })?;
    tracing::info!(method = %config.method, k, "initial centroids chosen");
    Ok(centroids)
}

fn uniform(pipeline: &mut Pipeline<'_, InitLocal>, amount: usize, dim: usize, seed: u64) -> Result<DataMatrix> {
    let counts = pipeline.broadcast(&CountStep, &())?;
    let round = counts.round;
    let requests = exchange_gathered(UniformRows { amount, seed, round }, counts)?;
    let samples = pipeline.deliver(&SampleStep { seed }, &requests)?;
    let empty = DataMatrix::zeros((0, dim));
    Ok(merge_gathered(CollectSamples { dim }, &empty, samples)?.0)
}

/// One D²-sampling round: potential, keyed quota, sampling, collection.
fn sample_round(
    pipeline: &mut Pipeline<'_, InitLocal>,
    centers: &DataMatrix,
    quota: Quota,
    seed: u64,
) -> Result<DataMatrix> {
    let potentials = pipeline.broadcast(&PotentialStep, centers)?;
    let round = potentials.round;
    let requests = exchange_gathered(PotentialQuota { quota, seed, round }, potentials)?;
    let samples = pipeline.deliver(&SampleStep { seed }, &requests)?;
    let dim = centers.ncols();
    Ok(merge_gathered(CollectSamples { dim }, centers, samples)?.0)
}

fn fill_sequentially(
    pipeline: &mut Pipeline<'_, InitLocal>,
    mut centers: DataMatrix,
    k: usize,
    seed: u64,
) -> Result<DataMatrix> {
    while centers.nrows() < k {
        let next = sample_round(pipeline, &centers, Quota::Single, seed)?;
        if next.nrows() == centers.nrows() {
            return Err(DiapError::InvalidData(format!(
                "only {} distinct points available for k = {k}",
                centers.nrows()
            )));
        }
        centers = next;
    }
    Ok(centers)
}

fn parallel_plus(
    pipeline: &mut Pipeline<'_, InitLocal>,
    k: usize,
    dim: usize,
    config: &InitConfig,
) -> Result<DataMatrix> {
    let mut candidates = uniform(pipeline, 1, dim, config.seed)?;
    let expected = config.oversampling_factor * k as f64;
    for _ in 0..config.rounds {
        candidates = sample_round(pipeline, &candidates, Quota::Oversample(expected), config.seed)?;
        tracing::debug!(candidates = candidates.nrows(), "oversampling round done");
    }
    if candidates.nrows() < k {
        candidates = fill_sequentially(pipeline, candidates, k, config.seed)?;
    }
    if candidates.nrows() == k {
        return Ok(candidates);
    }
    let ratings = pipeline.broadcast(&RatingStep, &candidates)?;
    let zero = vec![0u64; candidates.nrows()];
    let weights = merge_gathered(SumRatings, &zero, ratings)?.0;
    let mut rng = master_rng(config.seed, pipeline.round());
    reduce_candidates(&candidates, &weights, k, &mut rng)
}

/// Weighted k-means++ over the candidate set.
pub(crate) fn reduce_candidates(
    candidates: &DataMatrix,
    weights: &[u64],
    k: usize,
    rng: &mut ChaCha8Rng,
) -> Result<DataMatrix> {
    let n = candidates.nrows();
    if k > n {
        return Err(DiapError::InvalidConfig(format!(
            "cannot reduce {n} candidates to k = {k}"
        )));
    }
    let mut centroids = Array2::zeros((k, candidates.ncols()));
    let mut taken = vec![false; n];
    let scores: Vec<f64> = weights.iter().map(|&w| w as f64).collect();
    let first = pick_weighted(&scores, &taken, rng);
    taken[first] = true;
    centroids.row_mut(0).assign(&candidates.row(first));
    let mut distances: Vec<f64> = candidates
        .outer_iter()
        .map(|row| squared_distance(&row, &candidates.row(first)))
        .collect();
    for cid in 1..k {
        let scores: Vec<f64> = distances.iter().zip(weights).map(|(d, &w)| d * w as f64).collect();
        let idx = pick_weighted(&scores, &taken, rng);
        taken[idx] = true;
        centroids.row_mut(cid).assign(&candidates.row(idx));
        for (slot, row) in distances.iter_mut().zip(candidates.outer_iter()) {
            let d = squared_distance(&row, &centroids.row(cid));
            if d < *slot {
                *slot = d;
            }
        }
    }
    Ok(centroids)
}

/// Index drawn in proportion to `scores`; falls back to the first untaken
/// entry when every score is zero.
fn pick_weighted(scores: &[f64], taken: &[bool], rng: &mut ChaCha8Rng) -> usize {
    let masked: Vec<f64> = scores
        .iter()
        .zip(taken)
        .map(|(&s, &t)| if t || !s.is_finite() { 0.0 } else { s.max(0.0) })
        .collect();
    match WeightedIndex::new(&masked) {
        Ok(dist) => dist.sample(rng),
        Err(_) => taken.iter().position(|t| !t).unwrap_or(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{generate_clustered_points, random_centers};
    use rand::SeedableRng;

    fn blobs(seed: u64) -> DataMatrix {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let centers = random_centers(4, 2, 50.0, &mut rng);
        generate_clustered_points(30, &centers, 0.5, &mut rng).expect("generate")
    }

    fn is_data_row(data: &DataMatrix, row: ndarray::ArrayView1<f64>) -> bool {
        data.outer_iter().any(|r| r == row)
    }

    #[test]
    fn every_method_picks_k_rows_of_the_data() {
        let data = blobs(1);
        for method in [InitMethod::Random, InitMethod::KMeansPlusPlus, InitMethod::ParallelPlus] {
            let mut shards = ShardSet::split_rows(&data, 3).expect("split");
            let config = InitConfig {
                method,
                ..InitConfig::default()
            };
            let centroids = initialize(&mut shards, 4, &config, ShardFailurePolicy::Fatal).expect("init");
            assert_eq!(centroids.shape(), &[4, 2], "{method}");
            for row in centroids.outer_iter() {
                assert!(is_data_row(&data, row), "{method} produced a foreign row");
            }
        }
    }

    #[test]
    fn seeding_is_reproducible() {
        let data = blobs(2);
        let config = InitConfig {
            method: InitMethod::ParallelPlus,
            seed: 9,
            ..InitConfig::default()
        };
        let run = || {
            let mut shards = ShardSet::split_rows(&data, 4).expect("split").with_wire_boundary(true);
            initialize(&mut shards, 4, &config, ShardFailurePolicy::Fatal).expect("init")
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn too_few_rows_is_rejected() {
        let data = Array2::from_shape_fn((3, 2), |(i, j)| (i + j) as f64);
        let mut shards = ShardSet::split_rows(&data, 2).expect("split");
        let config = InitConfig {
            method: InitMethod::Random,
            ..InitConfig::default()
        };
        let err = initialize(&mut shards, 5, &config, ShardFailurePolicy::Fatal).unwrap_err();
        assert!(matches!(err, DiapError::InvalidConfig(_)));
    }

    #[test]
    fn duplicate_points_cannot_fill_k() {
        let data = Array2::from_elem((6, 2), 1.0);
        let mut shards = ShardSet::split_rows(&data, 2).expect("split");
        let err = initialize(&mut shards, 2, &InitConfig::default(), ShardFailurePolicy::Fatal).unwrap_err();
        assert!(matches!(err, DiapError::InvalidData(_)));
    }

    #[test]
    fn method_names_parse() {
        assert_eq!("K-Means++".parse::<InitMethod>().expect("parse"), InitMethod::KMeansPlusPlus);
        assert_eq!("parallel-plus".parse::<InitMethod>().expect("parse"), InitMethod::ParallelPlus);
        assert!("forgy".parse::<InitMethod>().is_err());
    }
}
