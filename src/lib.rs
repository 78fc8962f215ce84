//! Glyco Flux - glycemic metrics and diagnosis-label evaluation for CGM cohorts
//!
//! Glyco Flux turns raw continuous glucose monitoring readings into per-subject
//! glycemic statistics and evaluates how well those statistics predict a
//! clinical label through a deterministic pipeline: cleaning → metrics →
//! feature table → (optional) dimensionality reduction → stratified
//! cross-validation → report encoding.
//!
//! ## Modules
//!
//! - **Metrics**: reading cleaning and per-subject threshold statistics
//! - **Evaluation**: feature tables, PCA/LDA reduction, pluggable classifiers
//!   and the cross-validation harness

pub mod classifier;
pub mod cleaner;
pub mod config;
pub mod encoder;
pub mod error;
pub mod evaluation;
pub mod features;
pub mod metrics;
pub mod pipeline;
pub mod reducer;
pub mod types;
pub mod validation;

pub use classifier::{Classifier, FittedModel, KNearestNeighbors, MajorityClass, NearestCentroid};
pub use cleaner::{clean, Cleaner};
pub use config::PipelineConfig;
pub use encoder::ReportEncoder;
pub use error::GlycoError;
pub use evaluation::{
    accuracy, agreement_statistic, confusion, no_information_rate, ConfusionMatrix,
    EvaluationReport,
};
pub use features::{FeatureSchema, FeatureTable, Standardizer};
pub use metrics::{above_percent, below_percent, median, MetricsEngine};
pub use pipeline::{evaluate_cohort, GlycoProcessor};
pub use reducer::{DimensionalityReducer, ReducedComponents, ReducerModel, ReductionMethod};
pub use types::{
    CleanedReading, CovariateRow, ErrorPolicy, Label, MissingPolicy, Reading, SubjectId,
    SubjectMetrics,
};
pub use validation::{evaluate, make_folds, CrossValidationHarness, EvaluationResult, FoldSet};

/// Glyco Flux version embedded in all report payloads
pub const GLYCO_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Producer name for report payloads
pub const PRODUCER_NAME: &str = "glyco-flux";
