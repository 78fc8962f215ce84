//! Report encoding
//!
//! This module encodes cohort evaluations into JSON report payloads with
//! producer and provenance metadata.

use crate::error::GlycoError;
use crate::evaluation::EvaluationReport;
use crate::pipeline::CohortEvaluation;
use crate::reducer::{ComponentClamp, ReductionMethod};
use crate::types::{ExcludedSubject, ImputedCell, Label, SubjectFailure, SubjectId};
use crate::validation::{ClassShortfall, PermutationTest, Summary};
use crate::{GLYCO_VERSION, PRODUCER_NAME};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Current report schema version
pub const REPORT_VERSION: &str = "1.0.0";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportProducer {
    pub name: String,
    pub version: String,
    pub instance_id: String,
}

/// How the evaluation was run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportProvenance {
    pub computed_at_utc: String,
    pub folds: usize,
    pub seed: u64,
    pub reduce_first: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reduction: Option<ReductionMethod>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub components: Option<usize>,
}

/// Data-quality record of the evaluated cohort
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportQuality {
    pub subjects: usize,
    pub failures: Vec<SubjectFailure>,
    pub excluded: Vec<ExcludedSubject>,
    pub imputed: Vec<ImputedCell>,
    pub shortfalls: Vec<ClassShortfall>,
    pub flags: Vec<String>,
}

/// Held-out predictions of one fold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportFold {
    pub fold: usize,
    pub accuracy: f64,
    pub agreement: f64,
    pub no_information_rate: f64,
    pub subject_ids: Vec<SubjectId>,
    pub predicted: Vec<Label>,
    pub actual: Vec<Label>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reduction_clamp: Option<ComponentClamp>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportEvaluation {
    pub classifier: String,
    pub accuracy: Summary,
    pub agreement: Summary,
    pub pooled: EvaluationReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permutation: Option<PermutationTest>,
    pub folds: Vec<ReportFold>,
}

/// Top-level report payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportPayload {
    pub report_version: String,
    pub producer: ReportProducer,
    pub provenance: ReportProvenance,
    pub quality: ReportQuality,
    pub columns: Vec<String>,
    pub evaluations: Vec<ReportEvaluation>,
}

/// Report encoder for producing JSON payloads
pub struct ReportEncoder {
    instance_id: String,
}

impl Default for ReportEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ReportEncoder {
    /// Create a new encoder with a unique instance ID
    pub fn new() -> Self {
        Self {
            instance_id: Uuid::new_v4().to_string(),
        }
    }

    /// Create an encoder with a specific instance ID
    pub fn with_instance_id(instance_id: String) -> Self {
        Self { instance_id }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Encode a cohort evaluation into a report payload
    pub fn encode(&self, evaluation: &CohortEvaluation) -> Result<ReportPayload, GlycoError> {
        if evaluation.results.is_empty() {
            return Err(GlycoError::InvalidInput(
                "no classifier results to encode".to_string(),
            ));
        }

        let producer = ReportProducer {
            name: PRODUCER_NAME.to_string(),
            version: GLYCO_VERSION.to_string(),
            instance_id: self.instance_id.clone(),
        };

        let settings = &evaluation.settings;
        let provenance = ReportProvenance {
            computed_at_utc: Utc::now().to_rfc3339(),
            folds: evaluation.folds.k(),
            seed: evaluation.folds.seed(),
            reduce_first: settings.reduce_first,
            reduction: settings.reduce_first.then_some(settings.reduction),
            components: settings.reduce_first.then_some(settings.components),
        };

        let evaluations = evaluation
            .results
            .iter()
            .map(|entry| {
                let result = &entry.result;
                ReportEvaluation {
                    classifier: result.classifier.clone(),
                    accuracy: result.accuracy,
                    agreement: result.agreement,
                    pooled: result.pooled.clone(),
                    permutation: entry.permutation.clone(),
                    folds: result
                        .folds
                        .iter()
                        .map(|f| ReportFold {
                            fold: f.fold,
                            accuracy: f.accuracy,
                            agreement: f.agreement,
                            no_information_rate: f.no_information_rate,
                            subject_ids: f.subject_ids.clone(),
                            predicted: f.predicted.clone(),
                            actual: f.actual.clone(),
                            reduction_clamp: f.reduction_clamp,
                        })
                        .collect(),
                }
            })
            .collect();

        Ok(ReportPayload {
            report_version: REPORT_VERSION.to_string(),
            producer,
            provenance,
            quality: self.build_quality(evaluation),
            columns: evaluation.columns.clone(),
            evaluations,
        })
    }

    /// Encode to JSON string
    pub fn encode_to_json(&self, evaluation: &CohortEvaluation) -> Result<String, GlycoError> {
        let payload = self.encode(evaluation)?;
        serde_json::to_string_pretty(&payload).map_err(GlycoError::Json)
    }

    fn build_quality(&self, evaluation: &CohortEvaluation) -> ReportQuality {
        let mut flags = Vec::new();
        if !evaluation.failures.is_empty() {
            flags.push("subject_failures".to_string());
        }
        if !evaluation.excluded.is_empty() {
            flags.push("excluded_subjects".to_string());
        }
        if !evaluation.imputed.is_empty() {
            flags.push("imputed_covariates".to_string());
        }
        if !evaluation.folds.shortfalls().is_empty() {
            flags.push("class_shortfall".to_string());
        }
        let clamped = evaluation
            .results
            .iter()
            .flat_map(|entry| entry.result.folds.iter())
            .any(|f| f.reduction_clamp.is_some());
        if clamped {
            flags.push("component_clamp".to_string());
        }

        ReportQuality {
            subjects: evaluation.subjects,
            failures: evaluation.failures.clone(),
            excluded: evaluation.excluded.clone(),
            imputed: evaluation.imputed.clone(),
            shortfalls: evaluation.folds.shortfalls().to_vec(),
            flags,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::NearestCentroid;
    use crate::features::FeatureTable;
    use crate::pipeline::{ClassifierEvaluation, EvaluationSettings};
    use crate::validation::{evaluate, make_folds, HarnessOptions};
    use ndarray::Array2;

    fn make_test_evaluation() -> CohortEvaluation {
        let labels: Vec<Label> = (0..8)
            .map(|i| if i < 4 { "control" } else { "case" }.to_string())
            .collect();
        let values = Array2::from_shape_fn((8, 2), |(i, j)| {
            (if i < 4 { 0.0 } else { 5.0 }) + (i % 4) as f64 * 0.1 + j as f64
        });
        let table = FeatureTable::new(
            vec!["above_140".to_string(), "median".to_string()],
            (0..8).map(|i| format!("S{}", i)).collect(),
            labels,
            values,
        )
        .unwrap();
        let folds = make_folds(table.labels(), 4, 123).unwrap();
        let result = evaluate(
            &table,
            &folds,
            &NearestCentroid,
            false,
            &HarnessOptions::default(),
        )
        .unwrap();

        CohortEvaluation {
            subjects: table.n_rows(),
            columns: table.columns().to_vec(),
            failures: vec![SubjectFailure {
                subject_id: "S9".to_string(),
                error: "no data".to_string(),
            }],
            excluded: Vec::new(),
            imputed: Vec::new(),
            folds,
            settings: EvaluationSettings {
                reduce_first: false,
                reduction: ReductionMethod::Pca,
                components: 2,
            },
            results: vec![ClassifierEvaluation {
                result,
                permutation: None,
            }],
        }
    }

    #[test]
    fn test_encode_report_payload() {
        let evaluation = make_test_evaluation();
        let encoder = ReportEncoder::with_instance_id("test-instance".to_string());
        let payload = encoder.encode(&evaluation).unwrap();

        assert_eq!(payload.report_version, REPORT_VERSION);
        assert_eq!(payload.producer.name, PRODUCER_NAME);
        assert_eq!(payload.producer.version, GLYCO_VERSION);
        assert_eq!(payload.producer.instance_id, "test-instance");

        assert_eq!(payload.provenance.folds, 4);
        assert_eq!(payload.provenance.seed, 123);
        assert_eq!(payload.provenance.reduction, None);

        assert_eq!(payload.quality.subjects, 8);
        assert_eq!(payload.quality.flags, vec!["subject_failures".to_string()]);

        assert_eq!(payload.evaluations.len(), 1);
        let evaluation = &payload.evaluations[0];
        assert_eq!(evaluation.classifier, "nearest_centroid");
        assert_eq!(evaluation.folds.len(), 4);
        assert_eq!(evaluation.accuracy.mean, 1.0);
    }

    #[test]
    fn test_encode_to_json() {
        let evaluation = make_test_evaluation();
        let encoder = ReportEncoder::new();
        let json = encoder.encode_to_json(&evaluation).unwrap();

        // Verify it's valid JSON
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert!(parsed.get("report_version").is_some());
        assert!(parsed.get("producer").is_some());
        assert!(parsed.get("provenance").is_some());
        assert!(parsed.get("quality").is_some());
        assert!(parsed["evaluations"][0]["pooled"]["confusion"].is_object());
        assert!(parsed["provenance"].get("reduction").is_none());
    }

    #[test]
    fn test_empty_results_rejected() {
        let mut evaluation = make_test_evaluation();
        evaluation.results.clear();
        assert!(ReportEncoder::new().encode(&evaluation).is_err());
    }
}
