//! Shard identifiers, partial results and the local computation contract.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::codec;
use crate::error::{DiapError, Result};
use crate::fields::{FieldId, FieldValue, NamedFields, Variant};
use crate::table::NumericTable;

/// Identifier of a data partition / worker node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ShardId(pub u32);

impl ShardId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for ShardId {
    fn from(value: u32) -> Self {
        ShardId(value)
    }
}

/// One shard's contribution to one round. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialResult {
    shard: ShardId,
    round: u32,
    fields: NamedFields,
}

impl PartialResult {
    pub fn new(shard: ShardId, round: u32, fields: NamedFields) -> Self {
        Self {
            shard,
            round,
            fields,
        }
    }

    pub fn shard(&self) -> ShardId {
        self.shard
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    pub fn variant(&self) -> Variant {
        self.fields.variant()
    }

    pub fn fields(&self) -> &NamedFields {
        &self.fields
    }

    pub fn get(&self, field: FieldId) -> Result<&FieldValue> {
        self.fields.get(field)
    }

    pub fn into_fields(self) -> NamedFields {
        self.fields
    }

    pub fn pack(&self) -> Result<Vec<u8>> {
        codec::pack(self)
    }

    /// Decode a partial and re-validate its fields against the allow-list.
    pub fn unpack(bytes: &[u8]) -> Result<Self> {
        let partial: PartialResult = codec::unpack(bytes)?;
        partial.fields.validate()?;
        Ok(partial)
    }
}

/// What a shard sees while computing.
pub struct ShardContext<'a, L> {
    pub shard: ShardId,
    pub round: u32,
    pub data: &'a NumericTable,
    /// State left behind by an earlier step on the same shard.
    pub prior: Option<&'a L>,
}

impl<'a, L> ShardContext<'a, L> {
    /// Fail with [`DiapError::InvalidInputShape`] unless the shard data has
    /// `expected` columns. Empty shards are accepted whatever their width.
    pub fn expect_columns(&self, expected: usize) -> Result<()> {
        if self.data.nrows() > 0 && self.data.ncols() != expected {
            return Err(DiapError::InvalidInputShape {
                shard: self.shard,
                expected,
                found: self.data.ncols(),
            });
        }
        Ok(())
    }

    pub fn prior_or_invalid(&self, step: &str) -> Result<&'a L> {
        self.prior.ok_or_else(|| {
            DiapError::InvalidState(format!(
                "shard {} has no carried state; {step} must run after its predecessor",
                self.shard
            ))
        })
    }
}

/// Output of one local step.
#[derive(Debug, Clone)]
pub struct LocalStep<L> {
    pub fields: NamedFields,
    /// Replaces the shard's carried state when set.
    pub carry: Option<L>,
}

impl<L> LocalStep<L> {
    pub fn fields(fields: NamedFields) -> Self {
        Self {
            fields,
            carry: None,
        }
    }

    pub fn with_carry(fields: NamedFields, carry: L) -> Self {
        Self {
            fields,
            carry: Some(carry),
        }
    }
}

/// A data-parallel computation over a single shard.
///
/// Implementations must be pure functions of the shard data, the input
/// snapshot and the carried state: no cross-shard communication.
pub trait PartialComputation: Sync {
    /// Snapshot handed to the shard (global state or a keyed delivery).
    type Input: Sync;
    /// State carried between steps on the same shard.
    type Local: Send + Sync;

    /// Variant of the records this step produces.
    fn output_variant(&self) -> Variant;

    fn compute(
        &self,
        ctx: ShardContext<'_, Self::Local>,
        input: &Self::Input,
    ) -> Result<LocalStep<Self::Local>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn partial_round_trips_through_codec() {
        let fields = NamedFields::new(Variant::KMeansPartial)
            .with(FieldId::NObservations, FieldValue::Counts(vec![3, 0, 7]))
            .and_then(|f| f.with(FieldId::PartialSums, FieldValue::Dense(array![[1.0, 2.0], [0.0, 0.0], [-4.5, 1e-9]])))
            .and_then(|f| f.with(FieldId::PartialObjectiveFunction, FieldValue::Scalar(12.25)))
            .and_then(|f| f.with(FieldId::PartialAssignments, FieldValue::Labels(vec![0, 2, -1])))
            .and_then(|f| f.with(FieldId::PartialCandidatesDistances, FieldValue::Vector(vec![9.0])))
            .and_then(|f| f.with(FieldId::PartialCandidatesCentroids, FieldValue::Dense(array![[5.0, 5.0]])))
            .expect("valid record");
        let partial = PartialResult::new(ShardId(4), 2, fields);
        let bytes = partial.pack().expect("pack");
        let decoded = PartialResult::unpack(&bytes).expect("unpack");
        assert_eq!(decoded, partial);
        assert_eq!(decoded.shard(), ShardId(4));
        assert_eq!(decoded.round(), 2);
        for &(field, _) in Variant::KMeansPartial.fields() {
            assert_eq!(decoded.get(field).expect("field"), partial.get(field).expect("field"));
        }
    }

    #[test]
    fn shape_check_names_the_shard() {
        let data = NumericTable::Dense(array![[1.0, 2.0, 3.0]]);
        let ctx: ShardContext<'_, ()> = ShardContext {
            shard: ShardId(7),
            round: 0,
            data: &data,
            prior: None,
        };
        match ctx.expect_columns(2).unwrap_err() {
            DiapError::InvalidInputShape { shard, expected, found } => {
                assert_eq!(shard, ShardId(7));
                assert_eq!((expected, found), (2, 3));
            }
            other => panic!("unexpected error {other}"),
        }
    }
}
