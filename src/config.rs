//! Pipeline configuration
//!
//! Every section has defaults so a partial JSON document (or `{}`) is a valid
//! configuration. `PipelineConfig::validate` rejects settings the stages
//! cannot honour before any data is touched.

use crate::error::GlycoError;
use crate::reducer::ReductionMethod;
use crate::types::{ErrorPolicy, MissingPolicy};
use serde::{Deserialize, Serialize};

/// Default imputation constant for below-detection readings (mg/dL)
pub const DEFAULT_SENTINEL_VALUE: f64 = 39.0;

/// Cleaner settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanerConfig {
    /// Value substituted for below-detection markers
    pub sentinel_value: f64,
    /// Marker tokens recognized as below-detection (case-insensitive)
    pub sentinel_tokens: Vec<String>,
}

impl Default for CleanerConfig {
    fn default() -> Self {
        Self {
            sentinel_value: DEFAULT_SENTINEL_VALUE,
            sentinel_tokens: vec!["low".to_string()],
        }
    }
}

/// Linear-in-time resampling used by the time-weighted statistics
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeWeighting {
    /// Grid spacing in minutes
    pub step_minutes: f64,
    /// Gaps longer than this are left unfilled
    pub max_gap_minutes: f64,
}

impl Default for TimeWeighting {
    fn default() -> Self {
        Self {
            step_minutes: 5.0,
            max_gap_minutes: 30.0,
        }
    }
}

/// Metrics engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub thresholds_above: Vec<f64>,
    pub thresholds_below: Vec<f64>,
    /// Adds mean, sd, cv, min, max and reading count
    pub extended: bool,
    /// Adds `tw_above_*` / `tw_below_*` computed on a resampled grid
    pub time_weighting: Option<TimeWeighting>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            thresholds_above: vec![140.0, 180.0, 250.0],
            thresholds_below: vec![54.0, 70.0],
            extended: false,
            time_weighting: None,
        }
    }
}

/// Feature table settings
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    /// Metric columns to use; empty means every statistic the metrics config defines
    pub metric_columns: Vec<String>,
    /// Covariate columns joined from the metadata (e.g. age, bmi)
    pub covariate_columns: Vec<String>,
    pub missing_policy: MissingPolicy,
}

/// Cross-validation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    pub folds: usize,
    pub seed: u64,
    /// Fit the reducer on each training fold before the classifier
    pub reduce_first: bool,
    pub reduction: ReductionMethod,
    pub components: usize,
    /// Evaluate folds on the rayon thread pool
    pub parallel: bool,
    /// Label permutations for the permutation test (0 disables it)
    pub permutations: usize,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            folds: 6,
            seed: 123,
            reduce_first: false,
            reduction: ReductionMethod::Pca,
            components: 2,
            parallel: false,
            permutations: 0,
        }
    }
}

/// Complete pipeline configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub cleaner: CleanerConfig,
    pub metrics: MetricsConfig,
    pub features: FeatureConfig,
    pub validation: ValidationConfig,
    pub error_policy: ErrorPolicy,
}

impl PipelineConfig {
    /// Load configuration from JSON
    pub fn from_json(json: &str) -> Result<Self, GlycoError> {
        let config: PipelineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to JSON
    pub fn to_json(&self) -> Result<String, GlycoError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Check settings that would otherwise fail deep inside a stage
    pub fn validate(&self) -> Result<(), GlycoError> {
        if !self.cleaner.sentinel_value.is_finite() {
            return Err(GlycoError::Config(
                "cleaner.sentinel_value must be finite".to_string(),
            ));
        }

        let thresholds = self
            .metrics
            .thresholds_above
            .iter()
            .chain(self.metrics.thresholds_below.iter());
        for threshold in thresholds {
            if !threshold.is_finite() {
                return Err(GlycoError::Config(format!(
                    "threshold {} is not finite",
                    threshold
                )));
            }
        }

        if let Some(weighting) = &self.metrics.time_weighting {
            let positive = |minutes: f64| minutes.is_finite() && minutes > 0.0;
            if !positive(weighting.step_minutes) || !positive(weighting.max_gap_minutes) {
                return Err(GlycoError::Config(
                    "time_weighting step and max gap must be positive".to_string(),
                ));
            }
        }

        if self.validation.folds < 2 {
            return Err(GlycoError::Config(format!(
                "validation.folds must be at least 2, got {}",
                self.validation.folds
            )));
        }

        if self.validation.reduce_first && self.validation.components == 0 {
            return Err(GlycoError::Config(
                "validation.components must be positive when reduce_first is set".to_string(),
            ));
        }

        Ok(())
    }
}
