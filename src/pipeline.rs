//! Pipeline orchestration
//!
//! This module provides the public API for Glyco Flux.
//! It orchestrates the full pipeline from raw readings to the JSON report.

use crate::classifier::{Classifier, KNearestNeighbors, MajorityClass, NearestCentroid};
use crate::cleaner::{CleanOutcome, Cleaner};
use crate::config::PipelineConfig;
use crate::encoder::ReportEncoder;
use crate::error::GlycoError;
use crate::features::{FeatureSchema, FeatureTable};
use crate::metrics::{InMemoryMetricsCache, MetricsBatch, MetricsCache, MetricsEngine};
use crate::reducer::ReductionMethod;
use crate::types::{
    CovariateRow, ExcludedSubject, ImputedCell, Label, Reading, SubjectFailure, SubjectId,
};
use crate::validation::{
    CrossValidationHarness, EvaluationResult, FoldSet, HarnessOptions, PermutationTest,
};
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Instant;

/// Reduction settings an evaluation ran with
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EvaluationSettings {
    pub reduce_first: bool,
    pub reduction: ReductionMethod,
    pub components: usize,
}

/// Cross-validation outcome of one classifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifierEvaluation {
    pub result: EvaluationResult,
    pub permutation: Option<PermutationTest>,
}

/// Everything the pipeline learned about a cohort
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CohortEvaluation {
    /// Rows of the evaluated feature table
    pub subjects: usize,
    pub columns: Vec<String>,
    /// Subjects dropped by cleaning or metrics under `ErrorPolicy::IsolateSubject`
    pub failures: Vec<SubjectFailure>,
    /// Subjects dropped for missing covariates
    pub excluded: Vec<ExcludedSubject>,
    pub imputed: Vec<ImputedCell>,
    pub folds: FoldSet,
    pub settings: EvaluationSettings,
    pub results: Vec<ClassifierEvaluation>,
}

/// Reference classifiers evaluated when the caller supplies none
pub fn default_classifiers() -> Vec<Box<dyn Classifier>> {
    vec![
        Box::new(MajorityClass),
        Box::new(NearestCentroid),
        Box::new(KNearestNeighbors::default()),
    ]
}

/// Run the full pipeline and return the JSON report.
///
/// # Arguments
/// * `readings` - Raw readings of every subject, in any order
/// * `covariates` - Optional clinical covariates per subject
/// * `labels` - Diagnosis label per subject; unlabelled subjects are left out
/// * `config` - Pipeline configuration
///
/// # Example
/// ```ignore
/// let report = evaluate_cohort(&readings, &covariates, &labels, &PipelineConfig::default())?;
/// ```
pub fn evaluate_cohort(
    readings: &[Reading],
    covariates: &[CovariateRow],
    labels: &BTreeMap<SubjectId, Label>,
    config: &PipelineConfig,
) -> Result<String, GlycoError> {
    let mut processor = GlycoProcessor::with_config(config.clone())?;
    processor.process(readings, covariates, labels)
}

/// Stateful processor holding configuration and an optional metrics cache.
///
/// Use this when the same cohort is evaluated repeatedly (for example with
/// different classifiers) so metrics are computed once per subject.
pub struct GlycoProcessor {
    config: PipelineConfig,
    cleaner: Cleaner,
    engine: MetricsEngine,
    encoder: ReportEncoder,
    cache: Option<InMemoryMetricsCache>,
    deadline: Option<Instant>,
}

impl Default for GlycoProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl GlycoProcessor {
    /// Create a new processor with default settings
    pub fn new() -> Self {
        Self::from_parts(PipelineConfig::default())
    }

    /// Create a processor from a validated configuration
    pub fn with_config(config: PipelineConfig) -> Result<Self, GlycoError> {
        config.validate()?;
        Ok(Self::from_parts(config))
    }

    /// Create a processor from a JSON configuration
    pub fn from_json(json: &str) -> Result<Self, GlycoError> {
        Ok(Self::from_parts(PipelineConfig::from_json(json)?))
    }

    fn from_parts(config: PipelineConfig) -> Self {
        Self {
            cleaner: Cleaner::new(&config.cleaner),
            engine: MetricsEngine::new(config.metrics.clone()),
            encoder: ReportEncoder::new(),
            cache: None,
            deadline: None,
            config,
        }
    }

    /// Memoize subject metrics across calls
    pub fn with_metrics_cache(mut self) -> Self {
        self.cache = Some(InMemoryMetricsCache::default());
        self
    }

    /// Fail evaluation once `deadline` has passed
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Use a fixed report instance ID
    pub fn with_instance_id(mut self, instance_id: String) -> Self {
        self.encoder = ReportEncoder::with_instance_id(instance_id);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Number of memoized subjects (0 without a cache)
    pub fn cached_subjects(&self) -> usize {
        self.cache.as_ref().map_or(0, InMemoryMetricsCache::len)
    }

    /// Numeric columns the feature table will carry
    pub fn schema(&self) -> FeatureSchema {
        let features = &self.config.features;
        let metric_columns = if features.metric_columns.is_empty() {
            self.engine.statistic_names()
        } else {
            features.metric_columns.clone()
        };
        FeatureSchema::new(metric_columns, features.covariate_columns.clone())
    }

    /// Stage 1: clean raw readings
    pub fn clean(&self, readings: &[Reading]) -> Result<CleanOutcome, GlycoError> {
        self.cleaner.clean_batch(readings, self.config.error_policy)
    }

    /// Stages 1-2: clean readings and compute per-subject metrics
    pub fn metrics(&mut self, readings: &[Reading]) -> Result<MetricsBatch, GlycoError> {
        let cleaned = self.clean(readings)?;
        let cache = self.cache.as_mut().map(|c| c as &mut dyn MetricsCache);
        let mut batch =
            self.engine
                .compute_batch_with(&cleaned.readings, self.config.error_policy, cache)?;

        let mut failures = cleaned.failures;
        failures.append(&mut batch.failures);
        failures.sort_by(|a, b| a.subject_id.cmp(&b.subject_id));
        batch.failures = failures;
        Ok(batch)
    }

    /// Stages 1-3: build the feature table
    pub fn feature_table(
        &mut self,
        readings: &[Reading],
        covariates: &[CovariateRow],
        labels: &BTreeMap<SubjectId, Label>,
    ) -> Result<(FeatureTable, Vec<SubjectFailure>), GlycoError> {
        let batch = self.metrics(readings)?;
        let table = FeatureTable::build(
            &batch.metrics,
            covariates,
            labels,
            &self.schema(),
            self.config.features.missing_policy,
        )?;
        info!(
            "feature table: {} subjects x {} columns ({} excluded, {} imputed cells)",
            table.n_rows(),
            table.n_columns(),
            table.excluded().len(),
            table.imputed().len()
        );
        Ok((table, batch.failures))
    }

    /// Stages 1-4: cross-validate each classifier over the same folds
    pub fn evaluate(
        &mut self,
        readings: &[Reading],
        covariates: &[CovariateRow],
        labels: &BTreeMap<SubjectId, Label>,
        classifiers: &[&dyn Classifier],
    ) -> Result<CohortEvaluation, GlycoError> {
        if classifiers.is_empty() {
            return Err(GlycoError::InvalidInput(
                "at least one classifier is required".to_string(),
            ));
        }
        let (table, failures) = self.feature_table(readings, covariates, labels)?;
        let validation = &self.config.validation;

        let options = HarnessOptions {
            standardize: true,
            reduction: validation.reduction,
            components: validation.components,
            parallel: validation.parallel,
            deadline: self.deadline,
        };
        let subjects = table.n_rows();
        let columns = table.columns().to_vec();
        let excluded = table.excluded().to_vec();
        let imputed = table.imputed().to_vec();

        let mut harness = CrossValidationHarness::with_options(table, options);
        let folds = harness
            .make_folds(validation.folds, validation.seed)?
            .clone();
        let evaluated = harness.evaluate_grid(classifiers, validation.reduce_first)?;

        let mut results = Vec::with_capacity(evaluated.len());
        for (result, classifier) in evaluated.into_iter().zip(classifiers) {
            let permutation = if validation.permutations > 0 {
                Some(harness.permutation_test(
                    *classifier,
                    validation.reduce_first,
                    validation.permutations,
                    validation.seed,
                )?)
            } else {
                None
            };
            results.push(ClassifierEvaluation {
                result,
                permutation,
            });
        }

        Ok(CohortEvaluation {
            subjects,
            columns,
            failures,
            excluded,
            imputed,
            folds,
            settings: EvaluationSettings {
                reduce_first: validation.reduce_first,
                reduction: validation.reduction,
                components: validation.components,
            },
            results,
        })
    }

    /// Evaluate the reference classifiers and encode the report
    pub fn process(
        &mut self,
        readings: &[Reading],
        covariates: &[CovariateRow],
        labels: &BTreeMap<SubjectId, Label>,
    ) -> Result<String, GlycoError> {
        let classifiers = default_classifiers();
        let refs: Vec<&dyn Classifier> = classifiers.iter().map(|c| c.as_ref()).collect();
        self.process_with(readings, covariates, labels, &refs)
    }

    /// Evaluate the given classifiers and encode the report
    pub fn process_with(
        &mut self,
        readings: &[Reading],
        covariates: &[CovariateRow],
        labels: &BTreeMap<SubjectId, Label>,
        classifiers: &[&dyn Classifier],
    ) -> Result<String, GlycoError> {
        let evaluation = self.evaluate(readings, covariates, labels, classifiers)?;
        self.encoder.encode_to_json(&evaluation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ErrorPolicy, MissingPolicy};
    use chrono::{Duration, TimeZone, Utc};
    use pretty_assertions::assert_eq;

    /// Twelve subjects: six with readings 100..150, six with readings 170..220
    fn sample_cohort() -> (Vec<Reading>, BTreeMap<SubjectId, Label>) {
        let start = Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap();
        let mut readings = Vec::new();
        let mut labels = BTreeMap::new();
        for s in 0..12 {
            let subject = format!("S{:02}", s);
            let (base, label) = if s < 6 {
                (100.0, "non-diabetic")
            } else {
                (170.0, "potential-diabetic")
            };
            for k in 0..6 {
                readings.push(Reading::numeric(
                    &subject,
                    start + Duration::minutes(5 * k),
                    base + 10.0 * k as f64 + s as f64 * 0.5,
                ));
            }
            labels.insert(subject, label.to_string());
        }
        (readings, labels)
    }

    #[test]
    fn test_evaluate_cohort() {
        let (readings, labels) = sample_cohort();
        let json = evaluate_cohort(&readings, &[], &labels, &PipelineConfig::default()).unwrap();

        let payload: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(payload["report_version"], "1.0.0");
        assert_eq!(payload["producer"]["name"], "glyco-flux");
        assert_eq!(payload["quality"]["subjects"], 12);
        assert_eq!(payload["provenance"]["folds"], 6);

        let evaluations = payload["evaluations"].as_array().unwrap();
        assert_eq!(evaluations.len(), 3);
        assert_eq!(evaluations[1]["classifier"], "nearest_centroid");
        assert_eq!(evaluations[1]["accuracy"]["mean"], 1.0);
    }

    #[test]
    fn test_sentinel_marker_scenario() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 15, 8, 0, 0).unwrap();
        let readings = vec![
            Reading::marker("S1", t0, "low"),
            Reading::numeric("S1", t0 + Duration::minutes(5), 150.0),
        ];
        let mut processor = GlycoProcessor::new();
        let batch = processor.metrics(&readings).unwrap();

        assert_eq!(batch.metrics.len(), 1);
        assert_eq!(batch.metrics[0].get("above_140"), Some(50.0));
        assert_eq!(batch.metrics[0].get("median"), Some(94.5));
    }

    #[test]
    fn test_isolate_malformed_subject() {
        let (mut readings, labels) = sample_cohort();
        let t0 = Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap();
        readings.push(Reading::marker("S03", t0, "sensor error"));

        let mut abort = GlycoProcessor::new();
        assert!(matches!(
            abort.metrics(&readings),
            Err(GlycoError::MalformedReading { .. })
        ));

        let config = PipelineConfig {
            error_policy: ErrorPolicy::IsolateSubject,
            ..PipelineConfig::default()
        };
        let mut isolate = GlycoProcessor::with_config(config).unwrap();
        let (table, failures) = isolate.feature_table(&readings, &[], &labels).unwrap();

        assert_eq!(table.n_rows(), 11);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].subject_id, "S03");
    }

    #[test]
    fn test_covariates_imputed_and_dropped() {
        let (readings, labels) = sample_cohort();
        let covariates: Vec<CovariateRow> = (1..12)
            .map(|s| CovariateRow::new(&format!("S{:02}", s)).with("bmi", Some(20.0 + s as f64)))
            .collect();

        let mut config = PipelineConfig::default();
        config.features.covariate_columns = vec!["bmi".to_string()];
        let mut processor = GlycoProcessor::with_config(config.clone()).unwrap();
        let (table, _) = processor
            .feature_table(&readings, &covariates, &labels)
            .unwrap();
        assert_eq!(table.n_rows(), 12);
        assert_eq!(table.imputed().len(), 1);
        assert_eq!(table.imputed()[0].subject_id, "S00");
        assert_eq!(table.imputed()[0].value, 26.0);

        config.features.missing_policy = MissingPolicy::Drop;
        let mut processor = GlycoProcessor::with_config(config).unwrap();
        let (table, _) = processor
            .feature_table(&readings, &covariates, &labels)
            .unwrap();
        assert_eq!(table.n_rows(), 11);
        assert_eq!(table.excluded()[0].subject_id, "S00");
    }

    #[test]
    fn test_metrics_cache_reused() {
        let (readings, labels) = sample_cohort();
        let mut processor = GlycoProcessor::new().with_metrics_cache();
        let classifiers = default_classifiers();
        let first: Vec<&dyn Classifier> = vec![classifiers[0].as_ref()];
        let second: Vec<&dyn Classifier> = vec![classifiers[1].as_ref()];

        processor.evaluate(&readings, &[], &labels, &first).unwrap();
        assert_eq!(processor.cached_subjects(), 12);
        let evaluation = processor.evaluate(&readings, &[], &labels, &second).unwrap();
        assert_eq!(processor.cached_subjects(), 12);
        assert_eq!(evaluation.results[0].result.classifier, "nearest_centroid");
    }

    #[test]
    fn test_schema_defaults_to_engine_statistics() {
        let processor = GlycoProcessor::new();
        assert_eq!(
            processor.schema().metric_columns,
            vec!["above_140", "above_180", "above_250", "below_54", "below_70", "median"]
        );
    }

    #[test]
    fn test_reduce_first_with_permutations() {
        let (readings, labels) = sample_cohort();
        let mut config = PipelineConfig::default();
        config.validation.folds = 3;
        config.validation.reduce_first = true;
        config.validation.permutations = 9;
        let mut processor = GlycoProcessor::with_config(config)
            .unwrap()
            .with_instance_id("fixed".to_string());

        let evaluation = processor
            .evaluate(&readings, &[], &labels, &[&NearestCentroid])
            .unwrap();
        let permutation = evaluation.results[0].permutation.as_ref().unwrap();
        assert_eq!(permutation.permuted.len(), 9);
        assert!(evaluation.settings.reduce_first);
        assert_eq!(evaluation.folds.k(), 3);
    }

    #[test]
    fn test_no_labels_is_empty_join() {
        let (readings, _) = sample_cohort();
        let mut processor = GlycoProcessor::new();
        assert!(matches!(
            processor.feature_table(&readings, &[], &BTreeMap::new()),
            Err(GlycoError::EmptyJoin { .. })
        ));
    }

    #[test]
    fn test_invalid_config_json() {
        assert!(GlycoProcessor::from_json("not valid json").is_err());
        assert!(GlycoProcessor::from_json(r#"{"validation": {"folds": 1}}"#).is_err());
    }
}
