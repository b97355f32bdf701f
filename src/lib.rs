//! Distributed iterative aggregation rounds for clustering and boosting.
//!
//! The crate models the map-reduce style protocol shared by distributed
//! k-means, k-means initialisation, DBSCAN, low-order moments and gradient
//! boosted stumps: every shard computes a [`PartialResult`] over its own
//! rows, an [`Aggregator`] merges the partials once all shards reported, and a
//! [`RoundController`] redistributes the new global state until the run
//! converges or hits its round limit. A [`KeyedExchange`] covers the steps
//! whose master output must be routed back to individual shards.
//!
//! Shards run in parallel on rayon; partial submission is thread-safe and the
//! merge always folds shard contributions in ascending [`ShardId`] order, so
//! results do not depend on which shard finishes first.

pub mod aggregator;
pub mod algorithms;
pub mod codec;
pub mod config;
pub mod controller;
pub mod data;
pub mod error;
pub mod exchange;
pub mod fields;
pub mod numeric;
pub mod partial;
pub mod shard;
pub mod table;

use ndarray::Array2;

pub use aggregator::{Aggregator, ConvergenceSignal, MergeStrategy, RoundProgress};
pub use config::{ResultsToCompute, ShardFailurePolicy, TerminationConfig};
pub use controller::{RoundController, RoundPhase, RunResult};
pub use data::{generate_clustered_points, generate_points, DataLoader};
pub use error::{DiapError, Result};
pub use exchange::{KeyedCollection, KeyedExchange, KeyedMerge};
pub use fields::{FieldId, FieldKind, FieldValue, NamedFields, Variant};
pub use partial::{LocalStep, PartialComputation, PartialResult, ShardContext, ShardId};
pub use shard::ShardSet;
pub use table::{squared_distance, CsrTable, NumericTable};

/// Dense data representation used across the crate (rows = samples, columns = features).
pub type DataMatrix = Array2<f64>;

