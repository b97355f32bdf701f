//! Closed, per-variant allow-lists of named fields.
//!
//! Every record exchanged between shards and the master is a [`NamedFields`]
//! value tagged with a [`Variant`]. The variant fixes which [`FieldId`]s may
//! appear and what [`FieldKind`] each one holds; any other identifier is
//! rejected with [`DiapError::UnsupportedIdentifier`].

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{DiapError, Result};
use crate::partial::ShardId;
use crate::table::CsrTable;
use crate::DataMatrix;

/// Identifier of a named field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FieldId {
    Data,
    InputCentroids,
    NObservations,
    PartialSums,
    PartialObjectiveFunction,
    PartialAssignments,
    PartialCandidatesDistances,
    PartialCandidatesCentroids,
    PartialPotential,
    PartialCentroids,
    CandidateRatings,
    BoundingBox,
    HaloData,
    HaloDataIndices,
    NClusters,
    CoreBoundaryIndices,
    CoreBoundaryClusters,
    CrossEdgeClusters,
    CrossEdgeTargets,
    Assignments,
    CoreIndices,
    PartialSum,
    PartialSumSquaresCentered,
    PartialMinimum,
    PartialMaximum,
    Histograms,
}

impl FieldId {
    pub const ALL: &'static [FieldId] = &[
        FieldId::Data,
        FieldId::InputCentroids,
        FieldId::NObservations,
        FieldId::PartialSums,
        FieldId::PartialObjectiveFunction,
        FieldId::PartialAssignments,
        FieldId::PartialCandidatesDistances,
        FieldId::PartialCandidatesCentroids,
        FieldId::PartialPotential,
        FieldId::PartialCentroids,
        FieldId::CandidateRatings,
        FieldId::BoundingBox,
        FieldId::HaloData,
        FieldId::HaloDataIndices,
        FieldId::NClusters,
        FieldId::CoreBoundaryIndices,
        FieldId::CoreBoundaryClusters,
        FieldId::CrossEdgeClusters,
        FieldId::CrossEdgeTargets,
        FieldId::Assignments,
        FieldId::CoreIndices,
        FieldId::PartialSum,
        FieldId::PartialSumSquaresCentered,
        FieldId::PartialMinimum,
        FieldId::PartialMaximum,
        FieldId::Histograms,
    ];

    pub fn name(self) -> &'static str {
        match self {
            FieldId::Data => "data",
            FieldId::InputCentroids => "inputCentroids",
            FieldId::NObservations => "nObservations",
            FieldId::PartialSums => "partialSums",
            FieldId::PartialObjectiveFunction => "partialObjectiveFunction",
            FieldId::PartialAssignments => "partialAssignments",
            FieldId::PartialCandidatesDistances => "partialCandidatesDistances",
            FieldId::PartialCandidatesCentroids => "partialCandidatesCentroids",
            FieldId::PartialPotential => "partialPotential",
            FieldId::PartialCentroids => "partialCentroids",
            FieldId::CandidateRatings => "candidateRatings",
            FieldId::BoundingBox => "boundingBox",
            FieldId::HaloData => "haloData",
            FieldId::HaloDataIndices => "haloDataIndices",
            FieldId::NClusters => "nClusters",
            FieldId::CoreBoundaryIndices => "coreBoundaryIndices",
            FieldId::CoreBoundaryClusters => "coreBoundaryClusters",
            FieldId::CrossEdgeClusters => "crossEdgeClusters",
            FieldId::CrossEdgeTargets => "crossEdgeTargets",
            FieldId::Assignments => "assignments",
            FieldId::CoreIndices => "coreIndices",
            FieldId::PartialSum => "partialSum",
            FieldId::PartialSumSquaresCentered => "partialSumSquaresCentered",
            FieldId::PartialMinimum => "partialMinimum",
            FieldId::PartialMaximum => "partialMaximum",
            FieldId::Histograms => "histograms",
        }
    }

    pub fn from_name(name: &str) -> Option<FieldId> {
        FieldId::ALL.iter().copied().find(|id| id.name() == name)
    }
}

impl fmt::Display for FieldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Semantic type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldKind {
    /// Dense or CSR table.
    Table,
    Dense,
    Sparse,
    Vector,
    Counts,
    Indices,
    Labels,
    Scalar,
    Count,
    Keyed,
}

impl FieldKind {
    fn accepts(self, found: FieldKind) -> bool {
        self == found || (self == FieldKind::Table && matches!(found, FieldKind::Dense | FieldKind::Sparse))
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldKind::Table => "table",
            FieldKind::Dense => "dense table",
            FieldKind::Sparse => "sparse table",
            FieldKind::Vector => "vector",
            FieldKind::Counts => "count vector",
            FieldKind::Indices => "index list",
            FieldKind::Labels => "label list",
            FieldKind::Scalar => "scalar",
            FieldKind::Count => "count",
            FieldKind::Keyed => "keyed collection",
        };
        f.write_str(name)
    }
}

/// Value stored under a [`FieldId`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Dense(DataMatrix),
    Sparse(CsrTable),
    Vector(Vec<f64>),
    Counts(Vec<u64>),
    Indices(Vec<u64>),
    Labels(Vec<i64>),
    Scalar(f64),
    Count(u64),
    Keyed(BTreeMap<ShardId, FieldValue>),
}

impl FieldValue {
    pub fn kind(&self) -> FieldKind {
        match self {
            FieldValue::Dense(_) => FieldKind::Dense,
            FieldValue::Sparse(_) => FieldKind::Sparse,
            FieldValue::Vector(_) => FieldKind::Vector,
            FieldValue::Counts(_) => FieldKind::Counts,
            FieldValue::Indices(_) => FieldKind::Indices,
            FieldValue::Labels(_) => FieldKind::Labels,
            FieldValue::Scalar(_) => FieldKind::Scalar,
            FieldValue::Count(_) => FieldKind::Count,
            FieldValue::Keyed(_) => FieldKind::Keyed,
        }
    }
}

/// Record layout of one step of one algorithm family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Variant {
    KMeansInput,
    KMeansPartial,
    InitCounts,
    InitPotential,
    InitSamples,
    InitRatings,
    DbscanBounds,
    DbscanHalo,
    DbscanLocal,
    DbscanAssignments,
    MomentsPartial,
    GbtHistograms,
}

impl Variant {
    pub const ALL: &'static [Variant] = &[
        Variant::KMeansInput,
        Variant::KMeansPartial,
        Variant::InitCounts,
        Variant::InitPotential,
        Variant::InitSamples,
        Variant::InitRatings,
        Variant::DbscanBounds,
        Variant::DbscanHalo,
        Variant::DbscanLocal,
        Variant::DbscanAssignments,
        Variant::MomentsPartial,
        Variant::GbtHistograms,
    ];

    /// The allow-list of this variant.
    pub fn fields(self) -> &'static [(FieldId, FieldKind)] {
        use FieldId as F;
        use FieldKind as K;
        match self {
            Variant::KMeansInput => &[(F::Data, K::Table), (F::InputCentroids, K::Dense)],
            Variant::KMeansPartial => &[
                (F::NObservations, K::Counts),
                (F::PartialSums, K::Dense),
                (F::PartialObjectiveFunction, K::Scalar),
                (F::PartialAssignments, K::Labels),
                (F::PartialCandidatesDistances, K::Vector),
                (F::PartialCandidatesCentroids, K::Dense),
            ],
            Variant::InitCounts => &[(F::NObservations, K::Count)],
            Variant::InitPotential => &[(F::PartialPotential, K::Scalar)],
            Variant::InitSamples => &[(F::PartialCentroids, K::Dense)],
            Variant::InitRatings => &[(F::CandidateRatings, K::Counts)],
            Variant::DbscanBounds => &[(F::NObservations, K::Count), (F::BoundingBox, K::Dense)],
            Variant::DbscanHalo => &[(F::HaloData, K::Keyed), (F::HaloDataIndices, K::Keyed)],
            Variant::DbscanLocal => &[
                (F::NClusters, K::Count),
                (F::CoreBoundaryIndices, K::Indices),
                (F::CoreBoundaryClusters, K::Labels),
                (F::CrossEdgeClusters, K::Labels),
                (F::CrossEdgeTargets, K::Indices),
            ],
            Variant::DbscanAssignments => {
                &[(F::Assignments, K::Labels), (F::CoreIndices, K::Indices)]
            }
            Variant::MomentsPartial => &[
                (F::NObservations, K::Count),
                (F::PartialSum, K::Vector),
                (F::PartialSumSquaresCentered, K::Vector),
                (F::PartialMinimum, K::Vector),
                (F::PartialMaximum, K::Vector),
            ],
            Variant::GbtHistograms => &[
                (F::NObservations, K::Count),
                (F::Histograms, K::Dense),
                (F::PartialObjectiveFunction, K::Scalar),
            ],
        }
    }

    pub fn kind_of(self, field: FieldId) -> Option<FieldKind> {
        self.fields()
            .iter()
            .find(|(id, _)| *id == field)
            .map(|(_, kind)| *kind)
    }

    pub fn supports(self, field: FieldId) -> bool {
        self.kind_of(field).is_some()
    }

    fn check(self, field: FieldId) -> Result<FieldKind> {
        self.kind_of(field)
            .ok_or_else(|| DiapError::UnsupportedIdentifier {
                variant: self,
                field: field.name().to_string(),
            })
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A record whose keys are restricted to the allow-list of its [`Variant`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedFields {
    variant: Variant,
    values: BTreeMap<FieldId, FieldValue>,
}

macro_rules! typed_getter {
    ($name:ident, $variant:ident, $ty:ty) => {
        pub fn $name(&self, field: FieldId) -> Result<&$ty> {
            match self.get(field)? {
                FieldValue::$variant(inner) => Ok(inner),
                other => Err(DiapError::FieldKindMismatch {
                    variant: self.variant,
                    field,
                    expected: FieldKind::$variant,
                    found: other.kind(),
                }),
            }
        }
    };
}

impl NamedFields {
    pub fn new(variant: Variant) -> Self {
        Self {
            variant,
            values: BTreeMap::new(),
        }
    }

    pub fn variant(&self) -> Variant {
        self.variant
    }

    /// Store `value` under `field` after checking the allow-list and kind.
    pub fn set(&mut self, field: FieldId, value: FieldValue) -> Result<()> {
        let expected = self.variant.check(field)?;
        let found = value.kind();
        if !expected.accepts(found) {
            return Err(DiapError::FieldKindMismatch {
                variant: self.variant,
                field,
                expected,
                found,
            });
        }
        self.values.insert(field, value);
        Ok(())
    }

    /// Builder form of [`NamedFields::set`].
    pub fn with(mut self, field: FieldId, value: FieldValue) -> Result<Self> {
        self.set(field, value)?;
        Ok(self)
    }

    pub fn get(&self, field: FieldId) -> Result<&FieldValue> {
        self.get_opt(field)?.ok_or(DiapError::MissingField {
            variant: self.variant,
            field,
        })
    }

    /// Like [`NamedFields::get`] but an allowed, unset field yields `None`.
    pub fn get_opt(&self, field: FieldId) -> Result<Option<&FieldValue>> {
        self.variant.check(field)?;
        Ok(self.values.get(&field))
    }

    /// String-keyed lookup used at external boundaries.
    pub fn get_by_name(&self, name: &str) -> Result<&FieldValue> {
        match FieldId::from_name(name) {
            Some(field) => self.get(field),
            None => Err(DiapError::UnsupportedIdentifier {
                variant: self.variant,
                field: name.to_string(),
            }),
        }
    }

    pub fn set_by_name(&mut self, name: &str, value: FieldValue) -> Result<()> {
        match FieldId::from_name(name) {
            Some(field) => self.set(field, value),
            None => Err(DiapError::UnsupportedIdentifier {
                variant: self.variant,
                field: name.to_string(),
            }),
        }
    }

    pub fn contains(&self, field: FieldId) -> bool {
        self.values.contains_key(&field)
    }

    pub fn field_ids(&self) -> impl Iterator<Item = FieldId> + '_ {
        self.values.keys().copied()
    }

    /// Re-check every stored field, e.g. after crossing a process boundary.
    pub fn validate(&self) -> Result<()> {
        for (field, value) in &self.values {
            let expected = self.variant.check(*field)?;
            if !expected.accepts(value.kind()) {
                return Err(DiapError::FieldKindMismatch {
                    variant: self.variant,
                    field: *field,
                    expected,
                    found: value.kind(),
                });
            }
        }
        Ok(())
    }

    typed_getter!(dense, Dense, DataMatrix);
    typed_getter!(vector, Vector, Vec<f64>);
    typed_getter!(counts, Counts, Vec<u64>);
    typed_getter!(indices, Indices, Vec<u64>);
    typed_getter!(labels, Labels, Vec<i64>);
    typed_getter!(keyed, Keyed, BTreeMap<ShardId, FieldValue>);

    pub fn scalar(&self, field: FieldId) -> Result<f64> {
        match self.get(field)? {
            FieldValue::Scalar(v) => Ok(*v),
            other => Err(self.mismatch(field, FieldKind::Scalar, other)),
        }
    }

    pub fn count(&self, field: FieldId) -> Result<u64> {
        match self.get(field)? {
            FieldValue::Count(v) => Ok(*v),
            other => Err(self.mismatch(field, FieldKind::Count, other)),
        }
    }

    fn mismatch(&self, field: FieldId, expected: FieldKind, found: &FieldValue) -> DiapError {
        DiapError::FieldKindMismatch {
            variant: self.variant,
            field,
            expected,
            found: found.kind(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn sample_value(kind: FieldKind) -> FieldValue {
        match kind {
            FieldKind::Table | FieldKind::Dense => FieldValue::Dense(Array2::zeros((1, 1))),
            FieldKind::Sparse => FieldValue::Sparse(CsrTable::from_dense(&Array2::zeros((1, 1)))),
            FieldKind::Vector => FieldValue::Vector(vec![0.5]),
            FieldKind::Counts => FieldValue::Counts(vec![1]),
            FieldKind::Indices => FieldValue::Indices(vec![3]),
            FieldKind::Labels => FieldValue::Labels(vec![-1]),
            FieldKind::Scalar => FieldValue::Scalar(1.0),
            FieldKind::Count => FieldValue::Count(2),
            FieldKind::Keyed => FieldValue::Keyed(BTreeMap::new()),
        }
    }

    #[test]
    fn unknown_identifiers_rejected_for_every_variant() {
        for &variant in Variant::ALL {
            let mut record = NamedFields::new(variant);
            for &field in FieldId::ALL {
                if variant.supports(field) {
                    continue;
                }
                let err = record.set(field, FieldValue::Scalar(0.0)).unwrap_err();
                assert!(
                    matches!(err, DiapError::UnsupportedIdentifier { .. }),
                    "{variant} accepted {field}"
                );
                let err = record.get(field).unwrap_err();
                assert!(matches!(err, DiapError::UnsupportedIdentifier { .. }));
            }
            let err = record.get_by_name("notAField").unwrap_err();
            assert!(matches!(err, DiapError::UnsupportedIdentifier { .. }));
            let err = record
                .set_by_name("notAField", FieldValue::Count(1))
                .unwrap_err();
            assert!(matches!(err, DiapError::UnsupportedIdentifier { .. }));
        }
    }

    #[test]
    fn allowed_fields_accept_their_kind_only() {
        for &variant in Variant::ALL {
            let mut record = NamedFields::new(variant);
            for &(field, kind) in variant.fields() {
                let err = record.get(field).unwrap_err();
                assert!(matches!(err, DiapError::MissingField { .. }));
                record.set(field, sample_value(kind)).expect("allowed field");
                let wrong = if kind == FieldKind::Count {
                    FieldValue::Scalar(1.0)
                } else {
                    FieldValue::Count(1)
                };
                let err = record.set(field, wrong).unwrap_err();
                assert!(matches!(err, DiapError::FieldKindMismatch { .. }));
            }
            record.validate().expect("record stays valid");
        }
    }

    #[test]
    fn table_kind_accepts_dense_and_sparse() {
        let mut record = NamedFields::new(Variant::KMeansInput);
        let dense = Array2::from_elem((2, 2), 1.0);
        record
            .set(FieldId::Data, FieldValue::Sparse(CsrTable::from_dense(&dense)))
            .expect("sparse data");
        record
            .set(FieldId::Data, FieldValue::Dense(dense))
            .expect("dense data");
        assert_eq!(record.dense(FieldId::Data).expect("dense").nrows(), 2);
    }
}
