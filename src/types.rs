//! Core types for the Glyco Flux pipeline
//!
//! This module defines the data structures that flow through each stage of the
//! pipeline: raw readings, cleaned readings, per-subject metrics and the
//! bookkeeping records (exclusions, imputations, failures) produced on the way.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Subject identifier used as the join key across tables
pub type SubjectId = String;

/// Categorical diagnosis label (e.g. "non-diabetic")
pub type Label = String;

/// Glucose value as reported by the device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GlucoseValue {
    /// Numeric reading in mg/dL
    Numeric(f64),
    /// Non-numeric marker token (e.g. "Low" for below the detection limit)
    Marker(String),
}

impl GlucoseValue {
    /// Interpret a raw text field: numbers become `Numeric`, anything else a `Marker`
    pub fn parse(field: &str) -> Option<Self> {
        let trimmed = field.trim();
        if trimmed.is_empty() {
            return None;
        }
        match trimmed.parse::<f64>() {
            Ok(value) => Some(GlucoseValue::Numeric(value)),
            Err(_) => Some(GlucoseValue::Marker(trimmed.to_string())),
        }
    }
}

/// Raw CGM reading as supplied by the ingestion collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub subject_id: SubjectId,
    pub timestamp: DateTime<Utc>,
    /// `None` only for malformed input; the cleaner rejects it
    pub glucose_value: Option<GlucoseValue>,
}

impl Reading {
    pub fn numeric(subject_id: &str, timestamp: DateTime<Utc>, value: f64) -> Self {
        Self {
            subject_id: subject_id.to_string(),
            timestamp,
            glucose_value: Some(GlucoseValue::Numeric(value)),
        }
    }

    pub fn marker(subject_id: &str, timestamp: DateTime<Utc>, token: &str) -> Self {
        Self {
            subject_id: subject_id.to_string(),
            timestamp,
            glucose_value: Some(GlucoseValue::Marker(token.to_string())),
        }
    }
}

/// Reading with sentinel markers replaced by the imputation constant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanedReading {
    pub subject_id: SubjectId,
    pub timestamp: DateTime<Utc>,
    /// Always finite (mg/dL)
    pub glucose_value: f64,
    /// True when the value was substituted for a below-detection marker
    pub imputed: bool,
}

/// Per-subject glycemic statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectMetrics {
    pub subject_id: SubjectId,
    /// Statistic name (e.g. `above_140`, `median`) to value, in name order
    pub statistics: BTreeMap<String, f64>,
    /// Number of cleaned readings the row was computed from
    pub reading_count: usize,
    /// Timestamps of samples synthesized by interpolation (time-weighted statistics only)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub synthesized: Vec<DateTime<Utc>>,
}

impl SubjectMetrics {
    pub fn get(&self, statistic: &str) -> Option<f64> {
        self.statistics.get(statistic).copied()
    }
}

/// Clinical covariates for one subject (age, BMI, height, weight, ...)
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CovariateRow {
    pub subject_id: SubjectId,
    pub values: BTreeMap<String, Option<f64>>,
}

impl CovariateRow {
    pub fn new(subject_id: &str) -> Self {
        Self {
            subject_id: subject_id.to_string(),
            values: BTreeMap::new(),
        }
    }

    pub fn with(mut self, column: &str, value: Option<f64>) -> Self {
        self.values.insert(column.to_string(), value);
        self
    }
}

/// How data-quality errors in one subject affect a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// The first data-quality error fails the whole batch
    #[default]
    Abort,
    /// The affected subject is excluded and reported; the batch continues
    IsolateSubject,
}

/// How missing covariate values are resolved when building a feature table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingPolicy {
    /// Fill with the column mean over observed rows
    #[default]
    ImputeMean,
    /// Exclude the row and record the subject
    Drop,
}

/// Subject excluded from a batch because of a data-quality error
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectFailure {
    pub subject_id: SubjectId,
    pub error: String,
}

/// Subject excluded from a feature table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExcludedSubject {
    pub subject_id: SubjectId,
    pub reason: String,
}

/// Covariate cell filled by mean imputation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImputedCell {
    pub subject_id: SubjectId,
    pub column: String,
    pub value: f64,
}
