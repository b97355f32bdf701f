//! Numeric tables held by shards and carried inside partial results.

use std::borrow::Cow;

use ndarray::{Array1, Array2, ArrayView1, Zip};
use serde::{Deserialize, Serialize};

use crate::error::{DiapError, Result};
use crate::DataMatrix;

/// Squared euclidean distance between two rows of the same length.
pub fn squared_distance(a: &ArrayView1<f64>, b: &ArrayView1<f64>) -> f64 {
    Zip::from(a).and(b).fold(0.0, |acc, x, y| acc + (x - y) * (x - y))
}

/// Compressed sparse row table (rows = samples, columns = features).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CsrTable {
    ncols: usize,
    row_offsets: Vec<usize>,
    col_indices: Vec<usize>,
    values: Vec<f64>,
}

impl CsrTable {
    /// Build a CSR table, validating offsets and column indices.
    pub fn new(
        ncols: usize,
        row_offsets: Vec<usize>,
        col_indices: Vec<usize>,
        values: Vec<f64>,
    ) -> Result<Self> {
        if row_offsets.first().copied() != Some(0) {
            return Err(DiapError::InvalidData(
                "csr row offsets must start with 0".into(),
            ));
        }
        if row_offsets.windows(2).any(|w| w[0] > w[1]) {
            return Err(DiapError::InvalidData(
                "csr row offsets must be non-decreasing".into(),
            ));
        }
        let nnz = row_offsets.last().copied().unwrap_or(0);
        if nnz != col_indices.len() || nnz != values.len() {
            return Err(DiapError::InvalidData(format!(
                "csr table declares {nnz} non-zeros but holds {} indices and {} values",
                col_indices.len(),
                values.len()
            )));
        }
        if let Some(&bad) = col_indices.iter().find(|&&c| c >= ncols) {
            return Err(DiapError::InvalidData(format!(
                "csr column index {bad} out of range for {ncols} columns"
            )));
        }
        Ok(Self {
            ncols,
            row_offsets,
            col_indices,
            values,
        })
    }

    /// Convert a dense matrix, dropping exact zeros.
    pub fn from_dense(dense: &DataMatrix) -> Self {
        let mut row_offsets = Vec::with_capacity(dense.nrows() + 1);
        let mut col_indices = Vec::new();
        let mut values = Vec::new();
        row_offsets.push(0);
        for row in dense.rows() {
            for (col, &value) in row.iter().enumerate() {
                if value != 0.0 {
                    col_indices.push(col);
                    values.push(value);
                }
            }
            row_offsets.push(values.len());
        }
        Self {
            ncols: dense.ncols(),
            row_offsets,
            col_indices,
            values,
        }
    }

    pub fn nrows(&self) -> usize {
        self.row_offsets.len() - 1
    }

    pub fn ncols(&self) -> usize {
        self.ncols
    }

    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    /// Non-zero `(column, value)` pairs of row `i`.
    pub fn row(&self, i: usize) -> impl Iterator<Item = (usize, f64)> + '_ {
        let range = self.row_offsets[i]..self.row_offsets[i + 1];
        self.col_indices[range.clone()]
            .iter()
            .copied()
            .zip(self.values[range].iter().copied())
    }

    pub fn to_dense(&self) -> DataMatrix {
        let mut dense = Array2::zeros((self.nrows(), self.ncols));
        for i in 0..self.nrows() {
            for (col, value) in self.row(i) {
                dense[(i, col)] = value;
            }
        }
        dense
    }

    /// Squared euclidean distance between row `i` and a dense point whose
    /// squared norm is `point_norm`.
    pub fn squared_distance(&self, i: usize, point: &ArrayView1<f64>, point_norm: f64) -> f64 {
        let mut total = point_norm;
        for (col, value) in self.row(i) {
            total += value * value - 2.0 * value * point[col];
        }
        total.max(0.0)
    }
}

/// Shard-local data: either a dense or a CSR table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NumericTable {
    Dense(DataMatrix),
    Sparse(CsrTable),
}

impl NumericTable {
    pub fn nrows(&self) -> usize {
        match self {
            NumericTable::Dense(m) => m.nrows(),
            NumericTable::Sparse(t) => t.nrows(),
        }
    }

    pub fn ncols(&self) -> usize {
        match self {
            NumericTable::Dense(m) => m.ncols(),
            NumericTable::Sparse(t) => t.ncols(),
        }
    }

    /// Owned dense copy of row `i`.
    pub fn row(&self, i: usize) -> Array1<f64> {
        match self {
            NumericTable::Dense(m) => m.row(i).to_owned(),
            NumericTable::Sparse(t) => {
                let mut row = Array1::zeros(t.ncols());
                for (col, value) in t.row(i) {
                    row[col] = value;
                }
                row
            }
        }
    }

    /// Dense view of the whole table, converting sparse storage on demand.
    pub fn dense(&self) -> Cow<'_, DataMatrix> {
        match self {
            NumericTable::Dense(m) => Cow::Borrowed(m),
            NumericTable::Sparse(t) => Cow::Owned(t.to_dense()),
        }
    }

    /// Squared euclidean distance between row `i` and `point`.
    pub fn squared_distance(&self, i: usize, point: &ArrayView1<f64>, point_norm: f64) -> f64 {
        match self {
            NumericTable::Dense(m) => squared_distance(&m.row(i), point),
            NumericTable::Sparse(t) => t.squared_distance(i, point, point_norm),
        }
    }
}

impl From<DataMatrix> for NumericTable {
    fn from(value: DataMatrix) -> Self {
        NumericTable::Dense(value)
    }
}

impl From<CsrTable> for NumericTable {
    fn from(value: CsrTable) -> Self {
        NumericTable::Sparse(value)
    }
}
