//! Glyco CLI - Command-line interface for Glyco Flux
//!
//! Commands:
//! - metrics: Compute per-subject glycemic statistics from a readings CSV
//! - evaluate: Cross-validate classifiers on readings plus subject metadata
//! - folds: Print the stratified fold assignment for subject metadata

use chrono::{DateTime, NaiveDateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use glyco_flux::classifier::{Classifier, KNearestNeighbors, MajorityClass, NearestCentroid};
use glyco_flux::config::PipelineConfig;
use glyco_flux::metrics::MetricsEngine;
use glyco_flux::pipeline::GlycoProcessor;
use glyco_flux::reducer::ReductionMethod;
use glyco_flux::types::{CovariateRow, GlucoseValue, Label, Reading, SubjectId};
use glyco_flux::validation::make_folds;
use glyco_flux::{GlycoError, GLYCO_VERSION, PRODUCER_NAME};

/// Glyco - glycemic metrics and label evaluation for CGM cohorts
#[derive(Parser)]
#[command(name = "glyco")]
#[command(author = "Glyco Flux contributors")]
#[command(version = GLYCO_VERSION)]
#[command(
    about = "Compute CGM glycemic metrics and evaluate diagnosis classifiers",
    long_about = None
)]
struct Cli {
    /// Pipeline configuration (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compute per-subject metrics (readings CSV -> metrics CSV)
    Metrics {
        /// Readings CSV with subject_id,timestamp,glucose (use - for stdin)
        #[arg(short, long)]
        readings: PathBuf,

        /// Output file path (use - for stdout)
        #[arg(short, long, default_value = "-")]
        output: PathBuf,

        /// Exclude malformed subjects instead of failing
        #[arg(long)]
        isolate: bool,
    },

    /// Cross-validate classifiers (readings + metadata CSV -> JSON report)
    Evaluate {
        /// Readings CSV with subject_id,timestamp,glucose (use - for stdin)
        #[arg(short, long)]
        readings: PathBuf,

        /// Metadata CSV with subject_id, the label column and numeric covariates
        #[arg(short, long)]
        metadata: PathBuf,

        /// Output file path (use - for stdout)
        #[arg(short, long, default_value = "-")]
        output: PathBuf,

        /// Name of the label column in the metadata
        #[arg(long, default_value = "label")]
        label_column: String,

        /// Metadata columns to use as covariates
        #[arg(long, value_delimiter = ',')]
        covariates: Vec<String>,

        /// Number of folds
        #[arg(long)]
        folds: Option<usize>,

        /// Fold shuffling seed
        #[arg(long)]
        seed: Option<u64>,

        /// Reduce the features on each training fold first
        #[arg(long)]
        reduce: Option<Reduction>,

        /// Components kept when reducing
        #[arg(long)]
        components: Option<usize>,

        /// Classifiers to evaluate (default: all)
        #[arg(long, value_delimiter = ',')]
        classifiers: Vec<ClassifierKind>,

        /// Neighbours for the knn classifier
        #[arg(long, default_value = "3")]
        knn_k: usize,

        /// Label permutations for the permutation test
        #[arg(long)]
        permutations: Option<usize>,

        /// Evaluate folds in parallel
        #[arg(long)]
        parallel: bool,

        /// Exclude malformed subjects instead of failing
        #[arg(long)]
        isolate: bool,
    },

    /// Print the stratified fold assignment (metadata CSV -> JSON)
    Folds {
        /// Metadata CSV with subject_id and the label column
        #[arg(short, long)]
        metadata: PathBuf,

        /// Name of the label column in the metadata
        #[arg(long, default_value = "label")]
        label_column: String,

        /// Number of folds
        #[arg(long)]
        folds: Option<usize>,

        /// Fold shuffling seed
        #[arg(long)]
        seed: Option<u64>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Reduction {
    /// Principal components
    Pca,
    /// Linear discriminants
    Lda,
}

#[derive(Clone, Copy, ValueEnum)]
enum ClassifierKind {
    /// Most frequent training label
    Majority,
    /// Closest class centroid
    Centroid,
    /// k-nearest neighbours
    Knn,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!(
                "{}",
                serde_json::to_string(&CliError::from(e))
                    .unwrap_or_else(|_| "Unknown error".to_string())
            );
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), GlycoCliError> {
    let config = match &cli.config {
        Some(path) => PipelineConfig::from_json(&fs::read_to_string(path)?)?,
        None => PipelineConfig::default(),
    };

    match cli.command {
        Commands::Metrics {
            readings,
            output,
            isolate,
        } => cmd_metrics(config, &readings, &output, isolate),
        Commands::Evaluate {
            readings,
            metadata,
            output,
            label_column,
            covariates,
            folds,
            seed,
            reduce,
            components,
            classifiers,
            knn_k,
            permutations,
            parallel,
            isolate,
        } => {
            let mut config = config;
            if !covariates.is_empty() {
                config.features.covariate_columns = covariates;
            }
            if let Some(folds) = folds {
                config.validation.folds = folds;
            }
            if let Some(seed) = seed {
                config.validation.seed = seed;
            }
            if let Some(reduce) = reduce {
                config.validation.reduce_first = true;
                config.validation.reduction = match reduce {
                    Reduction::Pca => ReductionMethod::Pca,
                    Reduction::Lda => ReductionMethod::Discriminant,
                };
            }
            if let Some(components) = components {
                config.validation.components = components;
            }
            if let Some(permutations) = permutations {
                config.validation.permutations = permutations;
            }
            config.validation.parallel |= parallel;
            if isolate {
                config.error_policy = glyco_flux::ErrorPolicy::IsolateSubject;
            }
            cmd_evaluate(
                config,
                &readings,
                &metadata,
                &output,
                &label_column,
                &classifiers,
                knn_k,
            )
        }
        Commands::Folds {
            metadata,
            label_column,
            folds,
            seed,
        } => cmd_folds(
            &metadata,
            &label_column,
            folds.unwrap_or(config.validation.folds),
            seed.unwrap_or(config.validation.seed),
        ),
    }
}

fn cmd_metrics(
    mut config: PipelineConfig,
    readings: &Path,
    output: &Path,
    isolate: bool,
) -> Result<(), GlycoCliError> {
    if isolate {
        config.error_policy = glyco_flux::ErrorPolicy::IsolateSubject;
    }
    let names = MetricsEngine::new(config.metrics.clone()).statistic_names();
    let readings = parse_readings(&read_input(readings)?)?;
    if readings.is_empty() {
        return Err(GlycoCliError::NoReadings);
    }

    let mut processor = GlycoProcessor::with_config(config)?;
    let batch = processor.metrics(&readings)?;
    for failure in &batch.failures {
        log::warn!("subject {} excluded: {}", failure.subject_id, failure.error);
    }

    let mut writer = csv::Writer::from_writer(Vec::new());
    let mut header = vec!["subject_id".to_string()];
    header.extend(names.iter().cloned());
    writer.write_record(&header)?;
    for metrics in &batch.metrics {
        let mut record = vec![metrics.subject_id.clone()];
        for name in &names {
            record.push(metrics.get(name).map(|v| v.to_string()).unwrap_or_default());
        }
        writer.write_record(&record)?;
    }
    let data = writer
        .into_inner()
        .map_err(|e| GlycoCliError::Io(e.into_error()))?;

    write_output(output, &String::from_utf8_lossy(&data))
}

fn cmd_evaluate(
    config: PipelineConfig,
    readings: &Path,
    metadata: &Path,
    output: &Path,
    label_column: &str,
    classifiers: &[ClassifierKind],
    knn_k: usize,
) -> Result<(), GlycoCliError> {
    let readings = parse_readings(&read_input(readings)?)?;
    if readings.is_empty() {
        return Err(GlycoCliError::NoReadings);
    }
    let (labels, covariates) = parse_metadata(&fs::read_to_string(metadata)?, label_column)?;

    let kinds = if classifiers.is_empty() {
        vec![ClassifierKind::Majority, ClassifierKind::Centroid, ClassifierKind::Knn]
    } else {
        classifiers.to_vec()
    };
    let boxed: Vec<Box<dyn Classifier>> = kinds
        .iter()
        .map(|kind| -> Box<dyn Classifier> {
            match kind {
                ClassifierKind::Majority => Box::new(MajorityClass),
                ClassifierKind::Centroid => Box::new(NearestCentroid),
                ClassifierKind::Knn => Box::new(KNearestNeighbors::new(knn_k)),
            }
        })
        .collect();
    let refs: Vec<&dyn Classifier> = boxed.iter().map(|c| c.as_ref()).collect();

    let mut processor = GlycoProcessor::with_config(config)?;
    let report = processor.process_with(&readings, &covariates, &labels, &refs)?;
    write_output(output, &format!("{}\n", report))
}

#[derive(serde::Serialize)]
struct FoldAssignment {
    subject_id: SubjectId,
    label: Label,
    fold: usize,
}

#[derive(serde::Serialize)]
struct FoldReport {
    producer: String,
    version: String,
    folds: usize,
    seed: u64,
    shortfalls: Vec<glyco_flux::validation::ClassShortfall>,
    assignment: Vec<FoldAssignment>,
}

fn cmd_folds(
    metadata: &Path,
    label_column: &str,
    k: usize,
    seed: u64,
) -> Result<(), GlycoCliError> {
    let (labels, _) = parse_metadata(&fs::read_to_string(metadata)?, label_column)?;
    let subject_ids: Vec<SubjectId> = labels.keys().cloned().collect();
    let label_list: Vec<Label> = labels.values().cloned().collect();

    let folds = make_folds(&label_list, k, seed)?;
    let assignment = folds
        .assignment()
        .into_iter()
        .zip(subject_ids.into_iter().zip(label_list))
        .map(|(fold, (subject_id, label))| FoldAssignment {
            subject_id,
            label,
            fold,
        })
        .collect();

    let report = FoldReport {
        producer: PRODUCER_NAME.to_string(),
        version: GLYCO_VERSION.to_string(),
        folds: folds.k(),
        seed: folds.seed(),
        shortfalls: folds.shortfalls().to_vec(),
        assignment,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn read_input(path: &Path) -> Result<String, GlycoCliError> {
    if path.to_string_lossy() == "-" {
        if atty::is(atty::Stream::Stdin) {
            return Err(GlycoCliError::NoReadings);
        }
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        Ok(buffer)
    } else {
        Ok(fs::read_to_string(path)?)
    }
}

fn write_output(path: &Path, data: &str) -> Result<(), GlycoCliError> {
    if path.to_string_lossy() == "-" {
        print!("{}", data);
    } else {
        fs::write(path, data)?;
    }
    Ok(())
}

/// RFC 3339, or a naive `YYYY-MM-DD HH:MM[:SS]` taken as UTC
fn parse_timestamp(field: &str) -> Option<DateTime<Utc>> {
    let field = field.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(field) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(field, format).ok())
        .map(|naive| naive.and_utc())
}

fn parse_readings(data: &str) -> Result<Vec<Reading>, GlycoCliError> {
    let mut reader = csv::Reader::from_reader(data.as_bytes());
    let headers = reader.headers()?.clone();
    let column = |name: &str| {
        headers
            .iter()
            .position(|h| h.trim().eq_ignore_ascii_case(name))
            .ok_or_else(|| GlycoCliError::Format(format!("readings CSV has no {} column", name)))
    };
    let subject = column("subject_id")?;
    let timestamp = column("timestamp")?;
    let glucose = column("glucose")?;

    let mut readings = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = record?;
        let field = |i: usize| record.get(i).unwrap_or("");
        let ts = parse_timestamp(field(timestamp)).ok_or_else(|| {
            GlycoCliError::Format(format!(
                "row {}: unreadable timestamp {:?}",
                line + 1,
                field(timestamp)
            ))
        })?;
        readings.push(Reading {
            subject_id: field(subject).trim().to_string(),
            timestamp: ts,
            glucose_value: GlucoseValue::parse(field(glucose)),
        });
    }
    Ok(readings)
}

type Metadata = (BTreeMap<SubjectId, Label>, Vec<CovariateRow>);

fn parse_metadata(data: &str, label_column: &str) -> Result<Metadata, GlycoCliError> {
    let mut reader = csv::Reader::from_reader(data.as_bytes());
    let headers: Vec<String> = reader.headers()?.iter().map(|h| h.trim().to_string()).collect();
    let subject = headers
        .iter()
        .position(|h| h == "subject_id")
        .ok_or_else(|| GlycoCliError::Format("metadata CSV has no subject_id column".to_string()))?;
    let label = headers.iter().position(|h| h == label_column).ok_or_else(|| {
        GlycoCliError::Format(format!("metadata CSV has no {} column", label_column))
    })?;

    let mut labels = BTreeMap::new();
    let mut covariates = Vec::new();
    for record in reader.records() {
        let record = record?;
        let subject_id = record.get(subject).unwrap_or("").trim().to_string();
        let value = record.get(label).unwrap_or("").trim();
        if !value.is_empty() {
            labels.insert(subject_id.clone(), value.to_string());
        }

        let mut row = CovariateRow::new(&subject_id);
        for (j, name) in headers.iter().enumerate() {
            if j == subject || j == label {
                continue;
            }
            let cell = record.get(j).unwrap_or("").trim();
            row = row.with(name, cell.parse::<f64>().ok());
        }
        covariates.push(row);
    }
    Ok((labels, covariates))
}

// Error types

#[derive(Debug)]
enum GlycoCliError {
    Io(io::Error),
    Compute(GlycoError),
    Json(serde_json::Error),
    Csv(csv::Error),
    Format(String),
    NoReadings,
}

impl From<io::Error> for GlycoCliError {
    fn from(e: io::Error) -> Self {
        GlycoCliError::Io(e)
    }
}

impl From<GlycoError> for GlycoCliError {
    fn from(e: GlycoError) -> Self {
        GlycoCliError::Compute(e)
    }
}

impl From<serde_json::Error> for GlycoCliError {
    fn from(e: serde_json::Error) -> Self {
        GlycoCliError::Json(e)
    }
}

impl From<csv::Error> for GlycoCliError {
    fn from(e: csv::Error) -> Self {
        GlycoCliError::Csv(e)
    }
}

#[derive(serde::Serialize)]
struct CliError {
    code: String,
    message: String,
    hint: Option<String>,
}

impl From<GlycoCliError> for CliError {
    fn from(e: GlycoCliError) -> Self {
        match e {
            GlycoCliError::Io(e) => CliError {
                code: "IO_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check file paths and permissions".to_string()),
            },
            GlycoCliError::Compute(e) => {
                let (code, hint) = match &e {
                    GlycoError::MalformedReading { .. } | GlycoError::NoData { .. } => (
                        "DATA_QUALITY",
                        "Fix the reading or rerun with --isolate to exclude the subject",
                    ),
                    GlycoError::EmptyJoin { .. } => (
                        "EMPTY_JOIN",
                        "Check that readings and metadata use the same subject ids",
                    ),
                    GlycoError::Config(_) => ("CONFIG_ERROR", "Check the --config file"),
                    GlycoError::DeadlineExceeded { .. } => {
                        ("DEADLINE_EXCEEDED", "Reduce folds or permutations")
                    }
                    GlycoError::Classifier { .. } | GlycoError::Fold { .. } => (
                        "FOLD_ERROR",
                        "Check the fold's class balance or choose fewer components",
                    ),
                    _ => ("COMPUTE_ERROR", "Check input data and options"),
                };
                CliError {
                    code: code.to_string(),
                    message: e.to_string(),
                    hint: Some(hint.to_string()),
                }
            }
            GlycoCliError::Json(e) => CliError {
                code: "JSON_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check JSON syntax".to_string()),
            },
            GlycoCliError::Csv(e) => CliError {
                code: "CSV_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check CSV quoting and column counts".to_string()),
            },
            GlycoCliError::Format(msg) => CliError {
                code: "PARSE_ERROR".to_string(),
                message: msg,
                hint: Some("Readings need subject_id,timestamp,glucose columns".to_string()),
            },
            GlycoCliError::NoReadings => CliError {
                code: "NO_READINGS".to_string(),
                message: "No readings found in input".to_string(),
                hint: Some("Pass a readings CSV file or pipe one into stdin".to_string()),
            },
        }
    }
}
