//! Distributed DBSCAN.
//!
//! 1. Shards report row counts and bounding boxes; the master assigns global
//!    row ids (shard order) and shares the boxes.
//! 2. Every shard sends the rows lying within `epsilon` of another shard's box
//!    to that shard (halo exchange).
//! 3. With its halo in hand a shard knows the full neighbourhood of its own
//!    rows: it finds its core rows, clusters them locally and reports the
//!    core rows that touch the halo together with the cross-shard edges.
//! 4. The master joins local clusters across shards with a union-find and
//!    routes the global cluster numbers back; shards label their rows.
//!
//! Cluster numbers follow the smallest global id of their core rows. A border
//! row joins the cluster of its core neighbour with the smallest global id;
//! noise is labelled `-1`.

use std::collections::{BTreeMap, BTreeSet};

use ndarray::{Array2, ArrayView1};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::{exchange_gathered, finalize_gathered, merge_gathered, Pipeline};
use crate::aggregator::{ConvergenceSignal, MergeStrategy, RoundProgress};
use crate::config::{ResultsToCompute, ShardFailurePolicy};
use crate::error::{DiapError, Result};
use crate::exchange::{shuffle, KeyedCollection, KeyedMerge};
use crate::fields::{FieldId, FieldValue, NamedFields, Variant};
use crate::partial::{LocalStep, PartialComputation, PartialResult, ShardContext, ShardId};
use crate::shard::{stack_rows, ShardSet};
use crate::{squared_distance, DataMatrix};

/// DBSCAN parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DbscanConfig {
    /// Neighbourhood radius (euclidean, inclusive).
    pub epsilon: f64,
    /// Neighbours, the row itself included, needed for a core row.
    pub min_observations: usize,
    pub results_to_compute: ResultsToCompute,
    pub shard_failure: ShardFailurePolicy,
}

impl Default for DbscanConfig {
    fn default() -> Self {
        Self {
            epsilon: 0.5,
            min_observations: 5,
            results_to_compute: ResultsToCompute::ASSIGNMENTS | ResultsToCompute::CORE_INDICES,
            shard_failure: ShardFailurePolicy::default(),
        }
    }
}

impl DbscanConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.epsilon.is_finite() && self.epsilon > 0.0) {
            return Err(DiapError::InvalidConfig(
                "epsilon must be a positive number".into(),
            ));
        }
        if self.min_observations == 0 {
            return Err(DiapError::InvalidConfig(
                "min_observations must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Terminal DBSCAN outputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbscanOutput {
    pub n_clusters: u64,
    /// Per-shard labels, `-1` for noise.
    pub assignments: Option<KeyedCollection<Vec<i64>>>,
    /// Sorted global ids of every core row.
    pub core_indices: Option<Vec<u64>>,
}

/// Global placement of one shard's rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardBlock {
    /// Global id of the shard's first row.
    pub offset: u64,
    pub rows: u64,
    /// Bounding box; empty for an empty shard.
    pub lower: Vec<f64>,
    pub upper: Vec<f64>,
}

impl ShardBlock {
    fn squared_gap(&self, point: &ArrayView1<f64>) -> Option<f64> {
        if self.rows == 0 {
            return None;
        }
        let mut total = 0.0;
        for ((&x, &lo), &hi) in point.iter().zip(&self.lower).zip(&self.upper) {
            let gap = if x < lo {
                lo - x
            } else if x > hi {
                x - hi
            } else {
                0.0
            };
            total += gap * gap;
        }
        Some(total)
    }
}

/// Rows a shard received from its neighbours.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Halo {
    /// Global id of the receiving shard's first row.
    pub offset: u64,
    pub rows: DataMatrix,
    /// Global id of each halo row.
    pub ids: Vec<u64>,
}

/// Master verdict for one shard after the cluster merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterLabeling {
    /// Global cluster of each local cluster.
    pub local_to_global: Vec<i64>,
    /// Global cluster of the core rows among the shard's halo.
    pub halo_cores: BTreeMap<u64, i64>,
}

/// Shard-local memory between the core search and the final labelling.
#[derive(Debug, Clone, Default)]
pub struct DbscanCarry {
    offset: u64,
    /// Local cluster of each core row, `-1` otherwise.
    local_cluster: Vec<i64>,
    /// Global id of the closest-numbered own core neighbour of each non-core row.
    own_core: Vec<Option<u64>>,
    /// Halo neighbours of each non-core row.
    halo_neighbours: Vec<Vec<u64>>,
}

/// Disjoint-set forest with union by rank and path halving.
struct DisjointSets {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl DisjointSets {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            rank: vec![0; n],
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
    }

    /// Number every set by the order of its first member.
    fn labels(&mut self) -> (Vec<i64>, u64) {
        let mut ids: BTreeMap<usize, i64> = BTreeMap::new();
        let mut labels = Vec::with_capacity(self.parent.len());
        for x in 0..self.parent.len() {
            let root = self.find(x);
            let next = ids.len() as i64;
            labels.push(*ids.entry(root).or_insert(next));
        }
        (labels, ids.len() as u64)
    }
}

struct BoundsStep {
    dim: usize,
}

impl PartialComputation for BoundsStep {
    type Input = ();
    type Local = DbscanCarry;

    fn output_variant(&self) -> Variant {
        Variant::DbscanBounds
    }

    fn compute(&self, ctx: ShardContext<'_, DbscanCarry>, _: &()) -> Result<LocalStep<DbscanCarry>> {
        ctx.expect_columns(self.dim)?;
        let n = ctx.data.nrows();
        let bounds = if n == 0 {
            Array2::zeros((0, self.dim))
        } else {
            let data = ctx.data.dense();
            let mut bounds = Array2::zeros((2, self.dim));
            for j in 0..self.dim {
                let column = data.column(j);
                bounds[(0, j)] = column.fold(f64::INFINITY, |a, &b| a.min(b));
                bounds[(1, j)] = column.fold(f64::NEG_INFINITY, |a, &b| a.max(b));
            }
            bounds
        };
        let fields = NamedFields::new(Variant::DbscanBounds)
            .with(FieldId::NObservations, FieldValue::Count(n as u64))?
            .with(FieldId::BoundingBox, FieldValue::Dense(bounds))?;
        Ok(LocalStep::fields(fields))
    }
}

/// Lays shards out in id order and records their boxes.
struct BoundsMerge;

impl MergeStrategy for BoundsMerge {
    type State = KeyedCollection<ShardBlock>;
    type Output = KeyedCollection<ShardBlock>;

    fn input_variant(&self) -> Variant {
        Variant::DbscanBounds
    }

    fn merge(
        &self,
        _: &KeyedCollection<ShardBlock>,
        partials: &[&PartialResult],
    ) -> Result<(KeyedCollection<ShardBlock>, ConvergenceSignal)> {
        let mut layout = KeyedCollection::new();
        let mut offset = 0u64;
        for partial in partials {
            let rows = partial.fields().count(FieldId::NObservations)?;
            let bounds = partial.fields().dense(FieldId::BoundingBox)?;
            let (lower, upper) = if rows == 0 {
                (Vec::new(), Vec::new())
            } else if bounds.nrows() == 2 {
                (bounds.row(0).to_vec(), bounds.row(1).to_vec())
            } else {
                return Err(DiapError::InvalidData(format!(
                    "shard {} sent a bounding box with {} rows",
                    partial.shard(),
                    bounds.nrows()
                )));
            };
            layout.route(partial.shard(), ShardBlock { offset, rows, lower, upper })?;
            offset += rows;
        }
        Ok((layout, ConvergenceSignal::Finished))
    }

    fn finalize(
        &self,
        state: &KeyedCollection<ShardBlock>,
        _: &[&PartialResult],
        _: &RoundProgress,
    ) -> Result<KeyedCollection<ShardBlock>> {
        Ok(state.clone())
    }
}

struct HaloStep {
    epsilon: f64,
}

impl PartialComputation for HaloStep {
    type Input = KeyedCollection<ShardBlock>;
    type Local = DbscanCarry;

    fn output_variant(&self) -> Variant {
        Variant::DbscanHalo
    }

    fn compute(
        &self,
        ctx: ShardContext<'_, DbscanCarry>,
        layout: &KeyedCollection<ShardBlock>,
    ) -> Result<LocalStep<DbscanCarry>> {
        let own = layout.get(ctx.shard).ok_or_else(|| DiapError::RoutingFailure {
            shard: ctx.shard,
            reason: "shard missing from the global layout".into(),
        })?;
        let data = ctx.data.dense();
        let eps2 = self.epsilon * self.epsilon;
        let mut rows_for: BTreeMap<ShardId, Vec<usize>> = BTreeMap::new();
        for (i, row) in data.outer_iter().enumerate() {
            for (other, block) in layout.iter().filter(|(id, _)| *id != ctx.shard) {
                if matches!(block.squared_gap(&row), Some(gap) if gap <= eps2) {
                    rows_for.entry(other).or_default().push(i);
                }
            }
        }
        let mut halo = BTreeMap::new();
        let mut halo_ids = BTreeMap::new();
        for (other, rows) in rows_for {
            let ids = rows.iter().map(|&i| own.offset + i as u64).collect();
            halo.insert(other, FieldValue::Dense(data.select(ndarray::Axis(0), &rows)));
            halo_ids.insert(other, FieldValue::Indices(ids));
        }
        let fields = NamedFields::new(Variant::DbscanHalo)
            .with(FieldId::HaloData, FieldValue::Keyed(halo))?
            .with(FieldId::HaloDataIndices, FieldValue::Keyed(halo_ids))?;
        Ok(LocalStep::fields(fields))
    }
}

/// Delivers the halo rows to their destination shards.
struct HaloMerge<'a> {
    dim: usize,
    layout: &'a KeyedCollection<ShardBlock>,
}

impl KeyedMerge for HaloMerge<'_> {
    type Value = Halo;

    fn input_variant(&self) -> Variant {
        Variant::DbscanHalo
    }

    fn merge_keyed(&self, partials: &[&PartialResult], active: &BTreeSet<ShardId>) -> Result<KeyedCollection<Halo>> {
        let rows = shuffle(partials, FieldId::HaloData, active)?;
        let mut ids = shuffle(partials, FieldId::HaloDataIndices, active)?;
        let mut routed = KeyedCollection::new();
        for (destination, inbox) in rows {
            let id_inbox = ids.remove(destination).unwrap_or_default();
            if id_inbox.len() != inbox.len() {
                return Err(DiapError::RoutingFailure {
                    shard: destination,
                    reason: "halo rows and halo ids come from different sources".into(),
                });
            }
            let mut blocks = Vec::with_capacity(inbox.len());
            let mut all_ids = Vec::new();
            for ((source, block), (id_source, block_ids)) in inbox.iter().zip(&id_inbox) {
                let (FieldValue::Dense(block), FieldValue::Indices(block_ids)) = (block, block_ids) else {
                    return Err(DiapError::InvalidData(format!(
                        "shard {source} sent a malformed halo block"
                    )));
                };
                if source != id_source || block.nrows() != block_ids.len() {
                    return Err(DiapError::InvalidData(format!(
                        "shard {source} sent {} halo rows with {} ids",
                        block.nrows(),
                        block_ids.len()
                    )));
                }
                blocks.push(block);
                all_ids.extend_from_slice(block_ids);
            }
            let offset = self.layout.get(destination).map(|b| b.offset).unwrap_or_default();
            let halo = Halo {
                offset,
                rows: stack_rows(self.dim, &blocks)?,
                ids: all_ids,
            };
            routed.route(destination, halo)?;
        }
        Ok(routed)
    }
}

struct Neighbours {
    own: Vec<usize>,
    halo: Vec<usize>,
}

impl Neighbours {
    fn count(&self) -> usize {
        self.own.len() + self.halo.len()
    }
}

struct CoreSearchStep {
    epsilon: f64,
    min_observations: usize,
}

impl PartialComputation for CoreSearchStep {
    type Input = Halo;
    type Local = DbscanCarry;

    fn output_variant(&self) -> Variant {
        Variant::DbscanLocal
    }

    fn compute(&self, ctx: ShardContext<'_, DbscanCarry>, halo: &Halo) -> Result<LocalStep<DbscanCarry>> {
        let data = ctx.data.dense();
        let n = data.nrows();
        let eps2 = self.epsilon * self.epsilon;
        let neighbours: Vec<Neighbours> = (0..n)
            .into_par_iter()
            .map(|i| {
                let point = data.row(i);
                Neighbours {
                    own: (0..n)
                        .filter(|&j| squared_distance(&point, &data.row(j)) <= eps2)
                        .collect(),
                    halo: (0..halo.rows.nrows())
                        .filter(|&h| squared_distance(&point, &halo.rows.row(h)) <= eps2)
                        .collect(),
                }
            })
            .collect();
        let core: Vec<bool> = neighbours
            .iter()
            .map(|nb| nb.count() >= self.min_observations)
            .collect();

        let mut sets = DisjointSets::new(n);
        for (i, nb) in neighbours.iter().enumerate().filter(|(i, _)| core[*i]) {
            for &j in nb.own.iter().filter(|&&j| core[j]) {
                sets.union(i, j);
            }
        }
        let mut root_label: BTreeMap<usize, i64> = BTreeMap::new();
        let mut local_cluster = vec![-1i64; n];
        for i in (0..n).filter(|&i| core[i]) {
            let root = sets.find(i);
            let next = root_label.len() as i64;
            local_cluster[i] = *root_label.entry(root).or_insert(next);
        }

        let mut boundary_ids = Vec::new();
        let mut boundary_clusters = Vec::new();
        let mut edges = BTreeSet::new();
        let mut own_core = vec![None; n];
        let mut halo_neighbours = vec![Vec::new(); n];
        for (i, nb) in neighbours.iter().enumerate() {
            if core[i] {
                if !nb.halo.is_empty() {
                    boundary_ids.push(halo.offset + i as u64);
                    boundary_clusters.push(local_cluster[i]);
                    for &h in &nb.halo {
                        edges.insert((local_cluster[i], halo.ids[h]));
                    }
                }
            } else {
                own_core[i] = nb
                    .own
                    .iter()
                    .find(|&&j| core[j])
                    .map(|&j| halo.offset + j as u64);
                halo_neighbours[i] = nb.halo.iter().map(|&h| halo.ids[h]).collect();
            }
        }
        let (edge_clusters, edge_targets): (Vec<i64>, Vec<u64>) = edges.into_iter().unzip();
        tracing::debug!(
            shard = ctx.shard.0,
            cores = core.iter().filter(|c| **c).count(),
            local_clusters = root_label.len(),
            cross_edges = edge_targets.len(),
            "local core search done"
        );
        let fields = NamedFields::new(Variant::DbscanLocal)
            .with(FieldId::NClusters, FieldValue::Count(root_label.len() as u64))?
            .with(FieldId::CoreBoundaryIndices, FieldValue::Indices(boundary_ids))?
            .with(FieldId::CoreBoundaryClusters, FieldValue::Labels(boundary_clusters))?
            .with(FieldId::CrossEdgeClusters, FieldValue::Labels(edge_clusters))?
            .with(FieldId::CrossEdgeTargets, FieldValue::Indices(edge_targets))?;
        let carry = DbscanCarry {
            offset: halo.offset,
            local_cluster,
            own_core,
            halo_neighbours,
        };
        Ok(LocalStep::with_carry(fields, carry))
    }
}

/// Joins local clusters across shards and numbers them globally.
struct ClusterMerge<'a> {
    /// Global ids of the halo rows each shard received.
    halo_ids: &'a BTreeMap<ShardId, Vec<u64>>,
}

impl KeyedMerge for ClusterMerge<'_> {
    type Value = ClusterLabeling;

    fn input_variant(&self) -> Variant {
        Variant::DbscanLocal
    }

    fn merge_keyed(
        &self,
        partials: &[&PartialResult],
        active: &BTreeSet<ShardId>,
    ) -> Result<KeyedCollection<ClusterLabeling>> {
        let mut base = BTreeMap::new();
        let mut nodes = 0usize;
        for partial in partials {
            base.insert(partial.shard(), nodes);
            nodes += partial.fields().count(FieldId::NClusters)? as usize;
        }
        let mut boundary: BTreeMap<u64, usize> = BTreeMap::new();
        for partial in partials {
            let fields = partial.fields();
            let ids = fields.indices(FieldId::CoreBoundaryIndices)?;
            let clusters = fields.labels(FieldId::CoreBoundaryClusters)?;
            if ids.len() != clusters.len() {
                return Err(DiapError::InvalidData(format!(
                    "shard {} sent {} boundary cores with {} clusters",
                    partial.shard(),
                    ids.len(),
                    clusters.len()
                )));
            }
            for (&id, &cluster) in ids.iter().zip(clusters) {
                boundary.insert(id, node(&base, partial, cluster, nodes)?);
            }
        }
        let mut sets = DisjointSets::new(nodes);
        for partial in partials {
            let fields = partial.fields();
            let clusters = fields.labels(FieldId::CrossEdgeClusters)?;
            let targets = fields.indices(FieldId::CrossEdgeTargets)?;
            for (&cluster, target) in clusters.iter().zip(targets) {
                if let Some(&other) = boundary.get(target) {
                    sets.union(node(&base, partial, cluster, nodes)?, other);
                }
            }
        }
        let (labels, n_clusters) = sets.labels();
        tracing::info!(clusters = n_clusters, local_clusters = nodes, "clusters joined across shards");

        let mut routed = KeyedCollection::new();
        for partial in partials {
            let shard = partial.shard();
            let start = base.get(&shard).copied().unwrap_or_default();
            let count = partial.fields().count(FieldId::NClusters)? as usize;
            let halo_cores = self
                .halo_ids
                .get(&shard)
                .map(|ids| {
                    ids.iter()
                        .filter_map(|id| boundary.get(id).map(|&n| (*id, labels[n])))
                        .collect()
                })
                .unwrap_or_default();
            let labeling = ClusterLabeling {
                local_to_global: labels[start..start + count].to_vec(),
                halo_cores,
            };
            routed.route(shard, labeling)?;
        }
        debug_assert!(routed.keys().all(|id| active.contains(&id)));
        Ok(routed)
    }
}

fn node(base: &BTreeMap<ShardId, usize>, partial: &PartialResult, cluster: i64, nodes: usize) -> Result<usize> {
    let start = base.get(&partial.shard()).copied().unwrap_or_default();
    usize::try_from(cluster)
        .ok()
        .map(|c| start + c)
        .filter(|&n| n < nodes)
        .ok_or_else(|| DiapError::InvalidData(format!(
            "shard {} referenced unknown local cluster {cluster}",
            partial.shard()
        )))
}

struct AssignStep;

impl PartialComputation for AssignStep {
    type Input = ClusterLabeling;
    type Local = DbscanCarry;

    fn output_variant(&self) -> Variant {
        Variant::DbscanAssignments
    }

    fn compute(&self, ctx: ShardContext<'_, DbscanCarry>, labeling: &ClusterLabeling) -> Result<LocalStep<DbscanCarry>> {
        let carry = ctx.prior_or_invalid("final labelling")?;
        let global_of = |local: i64| -> Result<i64> {
            usize::try_from(local)
                .ok()
                .and_then(|l| labeling.local_to_global.get(l).copied())
                .ok_or_else(|| DiapError::RoutingFailure {
                    shard: ctx.shard,
                    reason: format!("no global cluster for local cluster {local}"),
                })
        };
        let n = carry.local_cluster.len();
        let mut labels = Vec::with_capacity(n);
        let mut cores = Vec::new();
        for i in 0..n {
            if carry.local_cluster[i] >= 0 {
                cores.push(carry.offset + i as u64);
                labels.push(global_of(carry.local_cluster[i])?);
                continue;
            }
            let halo_best = carry.halo_neighbours[i]
                .iter()
                .filter_map(|id| labeling.halo_cores.get(id).map(|&label| (*id, label)))
                .min();
            let own_best = match carry.own_core[i] {
                Some(id) => Some((id, global_of(carry.local_cluster[(id - carry.offset) as usize])?)),
                None => None,
            };
            let label = match (own_best, halo_best) {
                (Some(a), Some(b)) => a.min(b).1,
                (Some(a), None) | (None, Some(a)) => a.1,
                (None, None) => -1,
            };
            labels.push(label);
        }
        let fields = NamedFields::new(Variant::DbscanAssignments)
            .with(FieldId::Assignments, FieldValue::Labels(labels))?
            .with(FieldId::CoreIndices, FieldValue::Indices(cores))?;
        Ok(LocalStep::fields(fields))
    }
}

struct CollectAssignments {
    results: ResultsToCompute,
}

impl MergeStrategy for CollectAssignments {
    type State = u64;
    type Output = DbscanOutput;

    fn input_variant(&self) -> Variant {
        Variant::DbscanAssignments
    }

    fn merge(&self, n_clusters: &u64, _: &[&PartialResult]) -> Result<(u64, ConvergenceSignal)> {
        Ok((*n_clusters, ConvergenceSignal::Finished))
    }

    fn finalize(&self, n_clusters: &u64, partials: &[&PartialResult], _: &RoundProgress) -> Result<DbscanOutput> {
        let mut assignments = KeyedCollection::new();
        let mut core_indices = Vec::new();
        for partial in partials {
            assignments.route(partial.shard(), partial.fields().labels(FieldId::Assignments)?.clone())?;
            core_indices.extend_from_slice(partial.fields().indices(FieldId::CoreIndices)?);
        }
        core_indices.sort_unstable();
        Ok(DbscanOutput {
            n_clusters: *n_clusters,
            assignments: self
                .results
                .contains(ResultsToCompute::ASSIGNMENTS)
                .then_some(assignments),
            core_indices: self
                .results
                .contains(ResultsToCompute::CORE_INDICES)
                .then_some(core_indices),
        })
    }
}

/// Cluster the rows of every active shard.
pub fn cluster(shards: &mut ShardSet, config: &DbscanConfig) -> Result<DbscanOutput> {
    config.validate()?;
    let dim = shards.feature_dim()?;
    let output = shards.with_stage(|staged: &mut ShardSet<DbscanCarry>| -> Result<DbscanOutput> {
        let mut pipeline = Pipeline::new(staged, config.shard_failure);

        let bounds = pipeline.broadcast(&BoundsStep { dim }, &())?;
        let (layout, _) = merge_gathered(BoundsMerge, &KeyedCollection::new(), bounds)?;

        let halo_step = HaloStep { epsilon: config.epsilon };
        let outgoing = pipeline.broadcast(&halo_step, &layout)?;
        let halos = exchange_gathered(HaloMerge { dim, layout: &layout }, outgoing)?;
        let halo_ids: BTreeMap<ShardId, Vec<u64>> =
            halos.iter().map(|(id, halo)| (id, halo.ids.clone())).collect();

        let search = CoreSearchStep {
            epsilon: config.epsilon,
            min_observations: config.min_observations,
        };
        let local = pipeline.deliver(&search, &halos)?;
        let labelings = exchange_gathered(ClusterMerge { halo_ids: &halo_ids }, local)?;
        let n_clusters = labelings
            .iter()
            .flat_map(|(_, l)| l.local_to_global.iter())
            .max()
            .map_or(0, |&max| max as u64 + 1);

        let assigned = pipeline.deliver(&AssignStep, &labelings)?;
        let collect = CollectAssignments {
            results: config.results_to_compute,
        };
        Ok(finalize_gathered(collect, &n_clusters, assigned)?.1)
    })?;
    tracing::info!(
        clusters = output.n_clusters,
        epsilon = config.epsilon,
        min_observations = config.min_observations,
        "dbscan finished"
    );
    Ok(output)
}
