//! Loading shard tables from disk and generating synthetic data.

use std::fs::File;
use std::path::{Path, PathBuf};

use csv::ReaderBuilder;
use ndarray::{Array2, ArrayView1, ArrayViewMut1};
use ndarray_rand::rand_distr::{Distribution, Normal, Uniform};
use ndarray_rand::RandomExt;
use parquet::file::reader::{FileReader, SerializedFileReader};
use parquet::record::{Field, Row};
use rand::Rng;
use rand_chacha::ChaCha8Rng;

use crate::error::{DiapError, Result};
use crate::shard::ShardSet;
use crate::table::NumericTable;
use crate::DataMatrix;

/// Input file formats understood by [`DataLoader`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputFormat {
    Csv,
    Parquet,
}

impl InputFormat {
    /// Guess the format from a file extension, defaulting to CSV.
    pub fn infer(path: &Path) -> InputFormat {
        match path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
            .as_deref()
        {
            Some("parquet") | Some("pq") => InputFormat::Parquet,
            _ => InputFormat::Csv,
        }
    }
}

/// Loads numeric tables from CSV/Parquet into [`DataMatrix`] values.
pub struct DataLoader;

impl DataLoader {
    pub fn load<P: AsRef<Path>>(path: P, format: Option<InputFormat>) -> Result<DataMatrix> {
        let path = path.as_ref();
        match format.unwrap_or_else(|| InputFormat::infer(path)) {
            InputFormat::Csv => Self::load_csv(path),
            InputFormat::Parquet => Self::load_parquet(path),
        }
    }

    /// Load one file per shard; shard ids follow the order of `paths`.
    pub fn load_shards(paths: &[PathBuf], format: Option<InputFormat>) -> Result<ShardSet> {
        if paths.is_empty() {
            return Err(DiapError::InvalidConfig(
                "at least one shard file is required".into(),
            ));
        }
        let mut tables = Vec::with_capacity(paths.len());
        let mut width: Option<usize> = None;
        for path in paths {
            let table = Self::load(path, format)?;
            if table.nrows() > 0 {
                match width {
                    Some(expected) if expected != table.ncols() => {
                        return Err(DiapError::InvalidData(format!(
                            "{} has {} columns but earlier shards have {expected}",
                            path.display(),
                            table.ncols()
                        )));
                    }
                    _ => width = Some(table.ncols()),
                }
            }
            tracing::debug!(path = ?path, rows = table.nrows(), "loaded shard file");
            tables.push(NumericTable::Dense(table));
        }
        Ok(ShardSet::new(tables))
    }

    /// Load a CSV file with a header row and numeric columns.
    pub fn load_csv<P: AsRef<Path>>(path: P) -> Result<DataMatrix> {
        let mut rdr = ReaderBuilder::new().has_headers(true).from_path(path)?;
        let mut values: Vec<f64> = Vec::new();
        let mut width = None;
        let mut rows = 0usize;
        for record in rdr.records() {
            let record = record?;
            match width {
                Some(expected) if expected != record.len() => {
                    return Err(DiapError::InvalidData(format!(
                        "row {rows} has {} fields, expected {expected}",
                        record.len()
                    )));
                }
                None => width = Some(record.len()),
                _ => {}
            }
            for field in record.iter() {
                values.push(field.trim().parse()?);
            }
            rows += 1;
        }
        let Some(dim) = width else {
            return Ok(Array2::zeros((0, 0)));
        };
        Array2::from_shape_vec((rows, dim), values)
            .map_err(|err| DiapError::InvalidData(format!("csv shape error: {err}")))
    }

    /// Load a Parquet file containing only numeric columns.
    pub fn load_parquet<P: AsRef<Path>>(path: P) -> Result<DataMatrix> {
        let file = File::open(path)?;
        let reader = SerializedFileReader::new(file)?;
        let rows: Vec<Row> = reader
            .get_row_iter(None)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let Some(first) = rows.first() else {
            return Ok(Array2::zeros((0, 0)));
        };
        let width = first.len();
        let mut data = Array2::zeros((rows.len(), width));
        for (i, row) in rows.iter().enumerate() {
            if row.len() != width {
                return Err(DiapError::InvalidData(format!(
                    "parquet row {i} has {} columns, expected {width}",
                    row.len()
                )));
            }
            for (j, (_, field)) in row.get_column_iter().enumerate() {
                data[(i, j)] = numeric_field(field, j)?;
            }
        }
        Ok(data)
    }
}

fn numeric_field(field: &Field, column: usize) -> Result<f64> {
    let value = match field {
        Field::Double(v) => *v,
        Field::Float(v) => *v as f64,
        Field::Long(v) => *v as f64,
        Field::Int(v) => *v as f64,
        Field::Short(v) => *v as f64,
        Field::Byte(v) => *v as f64,
        Field::ULong(v) => *v as f64,
        Field::UInt(v) => *v as f64,
        Field::UShort(v) => *v as f64,
        Field::UByte(v) => *v as f64,
        Field::Bool(v) => f64::from(u8::from(*v)),
        Field::Null => {
            return Err(DiapError::InvalidData(format!(
                "column {column} contains NULL"
            )))
        }
        other => {
            return Err(DiapError::InvalidData(format!(
                "unsupported parquet value in column {column}: {other:?}"
            )))
        }
    };
    Ok(value)
}

/// Uniform data in the unit hypercube.
pub fn generate_points(n: usize, dim: usize, rng: &mut ChaCha8Rng) -> DataMatrix {
    Array2::random_using((n, dim), Uniform::new(0.0, 1.0), rng)
}

/// Gaussian blobs around `centers`, `n_per_cluster` rows each, rows grouped
/// by cluster.
pub fn generate_clustered_points(
    n_per_cluster: usize,
    centers: &DataMatrix,
    spread: f64,
    rng: &mut ChaCha8Rng,
) -> Result<DataMatrix> {
    let normal = Normal::new(0.0, spread)
        .map_err(|err| DiapError::InvalidConfig(format!("invalid spread {spread}: {err}")))?;
    let mut points = Array2::zeros((n_per_cluster * centers.nrows(), centers.ncols()));
    for (cluster, center) in centers.outer_iter().enumerate() {
        for i in 0..n_per_cluster {
            jitter(&center, points.row_mut(cluster * n_per_cluster + i), &normal, rng);
        }
    }
    Ok(points)
}

/// `k` centers drawn uniformly from `[0, scale)^dim`.
pub fn random_centers(k: usize, dim: usize, scale: f64, rng: &mut ChaCha8Rng) -> DataMatrix {
    Array2::from_shape_fn((k, dim), |_| rng.gen::<f64>() * scale)
}

fn jitter<R: Rng + ?Sized>(
    center: &ArrayView1<f64>,
    mut row: ArrayViewMut1<'_, f64>,
    normal: &Normal<f64>,
    rng: &mut R,
) {
    for (value, &c) in row.iter_mut().zip(center.iter()) {
        *value = c + normal.sample(rng);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use std::io::Write;

    #[test]
    fn csv_round_trip_and_width_check() {
        let dir = std::env::temp_dir().join(format!("shard-rounds-csv-{}", std::process::id()));
        std::fs::create_dir_all(&dir).expect("tmp dir");
        let good = dir.join("good.csv");
        let mut file = File::create(&good).expect("create");
        writeln!(file, "x,y\n1.0,2.0\n3.5, -4\n").expect("write");
        let data = DataLoader::load_csv(&good).expect("load");
        assert_eq!(data.shape(), &[2, 2]);
        assert_eq!(data[(1, 1)], -4.0);

        let bad = dir.join("bad.csv");
        std::fs::write(&bad, "x,y\n1,2\n3,4,5\n").expect("write");
        assert!(DataLoader::load_csv(&bad).is_err());

        let shards = DataLoader::load_shards(&[good.clone(), good], None).expect("shards");
        assert_eq!(shards.len(), 2);
        assert_eq!(shards.total_rows(), 4);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn clustered_points_have_expected_shape() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let centers = random_centers(4, 3, 10.0, &mut rng);
        let points = generate_clustered_points(25, &centers, 0.1, &mut rng).expect("generate");
        assert_eq!(points.shape(), &[100, 3]);
        let first = points.row(0);
        assert!(crate::squared_distance(&first, &centers.row(0)) < 1.0);
        assert_eq!(InputFormat::infer(Path::new("a/b.PQ")), InputFormat::Parquet);
    }
}
