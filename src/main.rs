use std::path::{Path, PathBuf};
use std::process;
use std::str::FromStr;
use std::time::Instant;

use clap::{Parser, ValueEnum};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::ThreadPoolBuilder;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info};
use tracing_subscriber::FmtSubscriber;

use shard_rounds::algorithms::dbscan::{self, DbscanConfig};
use shard_rounds::algorithms::gbt::{self, GbtConfig};
use shard_rounds::algorithms::init::{InitConfig, InitMethod};
use shard_rounds::algorithms::kmeans::{self, KMeansConfig};
use shard_rounds::algorithms::moments::{compute_moments, standardize_shards_except, MomentsConfig};
use shard_rounds::data::{random_centers, InputFormat};
use shard_rounds::{
    generate_clustered_points, generate_points, DataLoader, DataMatrix, DiapError, KeyedCollection,
    Result as DiapResult, ResultsToCompute, ShardFailurePolicy, ShardSet, TerminationConfig,
};

#[derive(Parser, Debug)]
#[command(name = "shard-rounds")]
#[command(about = "Run sharded k-means, DBSCAN, moments or boosted stumps in aggregation rounds", long_about = None)]
struct Args {
    /// Algorithm to run
    #[arg(short, long, value_enum, default_value_t = Algorithm::Kmeans)]
    algorithm: Algorithm,

    /// Number of shards a single input (or synthetic data) is split into
    #[arg(long, default_value_t = 4)]
    shards: usize,

    /// Number of clusters (k-means; also the synthetic blob count)
    #[arg(short, long, default_value_t = 4)]
    k: usize,

    /// Number of points to generate when not using --input
    #[arg(short = 'n', long, default_value_t = 100_000)]
    points: usize,

    /// Dimensionality of points when generating
    #[arg(short, long, default_value_t = 2)]
    dim: usize,

    /// Maximum number of rounds (k-means) or stumps (gbt)
    #[arg(short, long, default_value_t = 50)]
    iterations: u32,

    /// RNG seed for data generation and initialisation
    #[arg(long, default_value_t = 42u64)]
    seed: u64,

    /// Input dataset(s); several files are loaded as one shard each
    #[arg(long, num_args = 1..)]
    input: Vec<PathBuf>,

    /// Explicitly specify the input file format (default: auto-detect from extension)
    #[arg(long, value_enum)]
    format: Option<FormatArg>,

    /// JSON file with `kmeans`, `dbscan` and `gbt` sections; replaces the algorithm flags
    #[arg(long)]
    config: Option<PathBuf>,

    /// Output file for the run summary (JSON)
    #[arg(short, long, default_value = "rounds_result.json")]
    output: PathBuf,

    /// Optional per-row labels (CSV: shard,row,cluster)
    #[arg(long)]
    assignments: Option<PathBuf>,

    /// k-means initialisation method
    #[arg(long, value_parser = parse_init_method, default_value = "kmeans++")]
    init: InitMethod,

    /// parallel-plus oversampling factor (multiple of k per round)
    #[arg(long, default_value_t = 0.5)]
    oversampling: f64,

    /// parallel-plus oversampling rounds
    #[arg(long, default_value_t = 5)]
    init_rounds: u32,

    /// Convergence threshold (centroid shift for k-means, gain per row for gbt)
    #[arg(long, default_value_t = 1e-6)]
    tol: f64,

    /// DBSCAN neighbourhood radius
    #[arg(long, default_value_t = 0.5)]
    epsilon: f64,

    /// DBSCAN neighbours (self included) required for a core row
    #[arg(long, default_value_t = 5)]
    min_observations: usize,

    /// Boosting shrinkage
    #[arg(long, default_value_t = 0.1)]
    learning_rate: f64,

    /// Histogram bins per feature for boosting
    #[arg(long, default_value_t = 32)]
    bins: usize,

    /// Column holding the regression target for boosting
    #[arg(long, default_value_t = 0)]
    target_column: usize,

    /// Whether to z-score standardize inputs prior to training
    #[arg(long, default_value_t = false)]
    standardize: bool,

    /// Retire failing shards instead of aborting
    #[arg(long, default_value_t = false)]
    degrade: bool,

    /// Round-trip every partial result through the binary codec
    #[arg(long, default_value_t = false)]
    wire: bool,

    /// Override Rayon global thread pool size
    #[arg(long)]
    threads: Option<usize>,

    /// Verbosity: set RUST_LOG style level (info, debug, warn)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum Algorithm {
    Kmeans,
    Dbscan,
    Gbt,
    Moments,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum FormatArg {
    Csv,
    Parquet,
}

impl From<FormatArg> for InputFormat {
    fn from(format: FormatArg) -> Self {
        match format {
            FormatArg::Csv => InputFormat::Csv,
            FormatArg::Parquet => InputFormat::Parquet,
        }
    }
}

/// Contents of `--config`.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    kmeans: KMeansConfig,
    dbscan: DbscanConfig,
    gbt: GbtConfig,
    moments: MomentsConfig,
}

fn main() {
    let args = Args::parse();
    if let Err(err) = init_logging(&args.log_level) {
        eprintln!("failed to initialise logging: {err}");
    }

    if let Err(err) = run(args) {
        error!(error = %err, "run failed");
        process::exit(1);
    }
}

fn init_logging(level: &str) -> Result<(), String> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(match level {
            "trace" => tracing::Level::TRACE,
            "debug" => tracing::Level::DEBUG,
            "warn" => tracing::Level::WARN,
            "error" => tracing::Level::ERROR,
            _ => tracing::Level::INFO,
        })
        .finish();
    tracing::subscriber::set_global_default(subscriber).map_err(|err| err.to_string())
}

fn run(args: Args) -> DiapResult<()> {
    if let Some(threads) = args.threads {
        ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()
            .map_err(|err| {
                DiapError::InvalidConfig(format!("failed to configure rayon threadpool: {err}"))
            })?;
        info!(threads, "configured rayon global thread pool");
    }

    let configs = match args.config.as_ref() {
        Some(path) => {
            info!(path = ?path, "loading algorithm configuration");
            serde_json::from_str::<FileConfig>(&std::fs::read_to_string(path)?)?
        }
        None => configs_from_flags(&args),
    };
    let policy = match args.algorithm {
        Algorithm::Kmeans => configs.kmeans.termination.shard_failure,
        Algorithm::Dbscan => configs.dbscan.shard_failure,
        Algorithm::Gbt => configs.gbt.termination.shard_failure,
        Algorithm::Moments => configs.moments.shard_failure,
    };

    let mut rng = ChaCha8Rng::seed_from_u64(args.seed);
    let mut shards = load_shards(&args, &mut rng)?.with_wire_boundary(args.wire);
    info!(
        algorithm = ?args.algorithm,
        shards = shards.len(),
        rows = shards.total_rows(),
        "starting run"
    );

    let standardization = if args.standardize {
        let summary = compute_moments(&mut shards, policy)?.output;
        let untouched: &[usize] = match args.algorithm {
            Algorithm::Gbt => std::slice::from_ref(&configs.gbt.target_column),
            _ => &[],
        };
        standardize_shards_except(&mut shards, &summary, untouched)?;
        info!(?untouched, "applied z-score standardization to input features");
        Some(json!({ "mean": summary.mean, "std": summary.std }))
    } else {
        None
    };

    let start = Instant::now();
    let (report, labels) = match args.algorithm {
        Algorithm::Kmeans => {
            let config = &configs.kmeans;
            let result = kmeans::train_distributed(&mut shards, config)?;
            let centroids: Vec<Vec<f64>> = result
                .output
                .centroids
                .outer_iter()
                .map(|row| row.to_vec())
                .collect();
            let report = json!({
                "k": config.k,
                "init": config.init.method.to_string(),
                "iterations": result.iterations,
                "converged": result.converged,
                "objective": result.output.objective,
                "cluster_sizes": result.output.cluster_sizes,
                "centroids": centroids,
                "missing_shards": result.missing_shards,
            });
            (report, result.output.assignments)
        }
        Algorithm::Dbscan => {
            let output = dbscan::cluster(&mut shards, &configs.dbscan)?;
            let report = json!({
                "epsilon": configs.dbscan.epsilon,
                "min_observations": configs.dbscan.min_observations,
                "n_clusters": output.n_clusters,
                "core_count": output.core_indices.as_ref().map(Vec::len),
                "missing_shards": shards.retired_ids(),
            });
            (report, output.assignments)
        }
        Algorithm::Gbt => {
            let result = gbt::train_boosted(&mut shards, &configs.gbt)?;
            let report = json!({
                "iterations": result.iterations,
                "converged": result.converged,
                "model": serde_json::to_value(&result.output)?,
                "missing_shards": result.missing_shards,
            });
            (report, None)
        }
        Algorithm::Moments => {
            let result = compute_moments(&mut shards, policy)?;
            let report = json!({
                "summary": serde_json::to_value(&result.output)?,
                "missing_shards": result.missing_shards,
            });
            (report, None)
        }
    };
    let elapsed = start.elapsed().as_secs_f64();
    info!(took_seconds = elapsed, "run finished");

    write_result(&args, &shards, report, standardization, elapsed)?;
    if let Some(path) = args.assignments.as_ref() {
        match labels.as_ref() {
            Some(labels) => write_assignments(path, labels)?,
            None => info!(?args.algorithm, "no per-row labels to write"),
        }
    }
    Ok(())
}

fn configs_from_flags(args: &Args) -> FileConfig {
    let shard_failure = if args.degrade {
        ShardFailurePolicy::Degrade
    } else {
        ShardFailurePolicy::Fatal
    };
    let results_to_compute = if args.assignments.is_some() {
        ResultsToCompute::ASSIGNMENTS | ResultsToCompute::OBJECTIVE_FUNCTION
    } else {
        ResultsToCompute::OBJECTIVE_FUNCTION
    };
    let termination = TerminationConfig {
        max_iterations: args.iterations,
        convergence_threshold: args.tol,
        results_to_compute,
        shard_failure,
    };
    FileConfig {
        kmeans: KMeansConfig {
            k: args.k,
            init: InitConfig {
                method: args.init,
                oversampling_factor: args.oversampling,
                rounds: args.init_rounds,
                seed: args.seed,
            },
            termination: termination.clone(),
        },
        dbscan: DbscanConfig {
            epsilon: args.epsilon,
            min_observations: args.min_observations,
            results_to_compute: ResultsToCompute::ASSIGNMENTS | ResultsToCompute::CORE_INDICES,
            shard_failure,
        },
        gbt: GbtConfig {
            target_column: args.target_column,
            n_bins: args.bins,
            learning_rate: args.learning_rate,
            termination,
            ..GbtConfig::default()
        },
        moments: MomentsConfig { shard_failure },
    }
}

fn load_shards(args: &Args, rng: &mut ChaCha8Rng) -> DiapResult<ShardSet> {
    let format = args.format.map(InputFormat::from);
    match args.input.as_slice() {
        [] => {
            if let Some(requested) = args.format {
                info!(?requested, "ignoring --format because synthetic data will be generated");
            }
            let data = synthetic(args, rng)?;
            ShardSet::split_rows(&data, args.shards)
        }
        [single] => {
            info!(path = ?single, ?format, shards = args.shards, "loading input data");
            let data = DataLoader::load(single, format)?;
            ShardSet::split_rows(&data, args.shards)
        }
        many => {
            info!(files = many.len(), "loading one shard per input file");
            DataLoader::load_shards(many, format)
        }
    }
}

fn synthetic(args: &Args, rng: &mut ChaCha8Rng) -> DiapResult<DataMatrix> {
    match args.algorithm {
        Algorithm::Kmeans | Algorithm::Dbscan => {
            let blobs = args.k.max(1);
            info!(points = args.points, dim = args.dim, blobs, "generating synthetic blobs");
            let centers = random_centers(blobs, args.dim, 10.0 * blobs as f64, rng);
            generate_clustered_points(args.points / blobs, &centers, 1.0, rng)
        }
        Algorithm::Gbt => {
            let dim = args.dim.max(2);
            if args.target_column >= dim {
                return Err(DiapError::InvalidConfig(format!(
                    "target column {} is outside the generated {dim} columns",
                    args.target_column
                )));
            }
            info!(points = args.points, dim, "generating synthetic regression data");
            let mut data = generate_points(args.points, dim, rng);
            for mut row in data.outer_iter_mut() {
                let target: f64 = (0..dim)
                    .filter(|&j| j != args.target_column)
                    .map(|j| if row[j] > 0.5 { j as f64 } else { -(j as f64) })
                    .sum();
                row[args.target_column] = target;
            }
            Ok(data)
        }
        Algorithm::Moments => {
            info!(points = args.points, dim = args.dim, "generating synthetic uniform data");
            Ok(generate_points(args.points, args.dim, rng))
        }
    }
}

fn write_result(
    args: &Args,
    shards: &ShardSet,
    report: Value,
    standardization: Option<Value>,
    elapsed_secs: f64,
) -> DiapResult<()> {
    let dump = json!({
        "algorithm": format!("{:?}", args.algorithm).to_lowercase(),
        "shards": shards.len(),
        "rows": shards.total_rows(),
        "seed": args.seed,
        "elapsed_seconds": elapsed_secs,
        "standardized": args.standardize,
        "wire_boundary": args.wire,
        "result": report,
        "data_source": if args.input.is_empty() {
            json!({
                "type": "synthetic",
                "points": args.points,
                "dim": args.dim,
            })
        } else {
            json!({
                "type": "file",
                "paths": args.input.iter().map(|p| p.display().to_string()).collect::<Vec<_>>(),
                "format": args.format.map(|f| format!("{f:?}").to_lowercase()),
            })
        },
        "config_path": args.config.as_ref().map(|p| p.display().to_string()),
        "assignments_path": args.assignments.as_ref().map(|p| p.display().to_string()),
        "standardization": standardization,
    });

    std::fs::write(&args.output, serde_json::to_string_pretty(&dump)?)?;
    info!(path = ?args.output, "wrote run summary");
    Ok(())
}

fn write_assignments(path: &Path, labels: &KeyedCollection<Vec<i64>>) -> DiapResult<()> {
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(["shard", "row", "cluster"])?;
    for (shard, shard_labels) in labels.iter() {
        for (row, cluster) in shard_labels.iter().enumerate() {
            writer.write_record([shard.to_string(), row.to_string(), cluster.to_string()])?;
        }
    }
    writer.flush()?;
    info!(path = ?path, "wrote assignments CSV");
    Ok(())
}

fn parse_init_method(raw: &str) -> Result<InitMethod, String> {
    InitMethod::from_str(raw).map_err(|err| err.to_string())
}
