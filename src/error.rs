//! Error type shared by the protocol components and the algorithm families.

use crate::fields::{FieldId, FieldKind, Variant};
use crate::partial::ShardId;
use thiserror::Error;

/// Error type used by operations in this crate.
///
/// Protocol violations always name the shard and/or field identifier that
/// caused them so a failed distributed run can be traced back to its source.
#[derive(Debug, Error)]
pub enum DiapError {
    #[error("invalid input shape on shard {shard}: expected {expected} columns, found {found}")]
    InvalidInputShape {
        shard: ShardId,
        expected: usize,
        found: usize,
    },
    #[error("field '{field}' is not supported by {variant}")]
    UnsupportedIdentifier { variant: Variant, field: String },
    #[error("field '{field}' of {variant} expects a {expected} value, got {found}")]
    FieldKindMismatch {
        variant: Variant,
        field: FieldId,
        expected: FieldKind,
        found: FieldKind,
    },
    #[error("field '{field}' of {variant} has not been set")]
    MissingField { variant: Variant, field: FieldId },
    #[error("partial result of {found} cannot be merged by an aggregator expecting {expected}")]
    VariantMismatch { expected: Variant, found: Variant },
    #[error("shard {shard} already contributed to round {round}")]
    DuplicateShardContribution { shard: ShardId, round: u32 },
    #[error("shard {shard} is not registered with this aggregator")]
    UnexpectedShard { shard: ShardId },
    #[error("shard {shard} submitted a partial for round {found} while round {expected} is open")]
    StaleContribution {
        shard: ShardId,
        expected: u32,
        found: u32,
    },
    #[error("round {round} is incomplete; still waiting on shards {missing:?}")]
    IncompleteRound { round: u32, missing: Vec<ShardId> },
    #[error("routing failure for shard {shard}: {reason}")]
    RoutingFailure { shard: ShardId, reason: String },
    #[error("shard {shard} failed: {source}")]
    ShardFailure {
        shard: ShardId,
        #[source]
        source: Box<DiapError>,
    },
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("invalid data: {0}")]
    InvalidData(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    ParseFloat(#[from] std::num::ParseFloatError),
    #[error(transparent)]
    Parquet(#[from] parquet::errors::ParquetError),
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
    #[error(transparent)]
    Codec(#[from] bincode::Error),
}

impl DiapError {
    /// Wrap an error raised while computing on `shard`.
    pub fn shard_failure(shard: ShardId, source: DiapError) -> Self {
        match source {
            already @ DiapError::ShardFailure { .. } => already,
            other => DiapError::ShardFailure {
                shard,
                source: Box::new(other),
            },
        }
    }
}

/// Convenient alias for results produced by this crate.
pub type Result<T> = std::result::Result<T, DiapError>;
