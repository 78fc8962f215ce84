//! Reading cleaning
//!
//! This module turns raw device readings into cleaned readings:
//! - Below-detection markers replaced with the configured sentinel value
//! - Non-finite or unrecognized values rejected as malformed
//! - Output order and length match the input

use crate::config::{CleanerConfig, DEFAULT_SENTINEL_VALUE};
use crate::error::GlycoError;
use crate::types::{CleanedReading, ErrorPolicy, GlucoseValue, Reading, SubjectFailure};
use log::{debug, warn};
use std::collections::{BTreeMap, HashSet};

/// Result of cleaning a batch under an error policy
#[derive(Debug, Clone, Default)]
pub struct CleanOutcome {
    /// Cleaned readings of every subject that passed, in input order
    pub readings: Vec<CleanedReading>,
    /// Subjects excluded under `ErrorPolicy::IsolateSubject`
    pub failures: Vec<SubjectFailure>,
    /// Number of readings whose value was substituted
    pub imputed: usize,
}

/// Cleaner for converting raw readings to cleaned readings
#[derive(Debug, Clone)]
pub struct Cleaner {
    sentinel_value: f64,
    sentinel_tokens: Vec<String>,
}

impl Default for Cleaner {
    fn default() -> Self {
        Self::new(&CleanerConfig::default())
    }
}

impl Cleaner {
    /// Create a cleaner from configuration
    pub fn new(config: &CleanerConfig) -> Self {
        Self {
            sentinel_value: config.sentinel_value,
            sentinel_tokens: config
                .sentinel_tokens
                .iter()
                .map(|token| token.trim().to_lowercase())
                .collect(),
        }
    }

    /// Create a cleaner with the default marker tokens and a custom sentinel value
    pub fn with_sentinel_value(sentinel_value: f64) -> Self {
        Self {
            sentinel_value,
            ..Self::default()
        }
    }

    pub fn sentinel_value(&self) -> f64 {
        self.sentinel_value
    }

    /// Whether a marker token denotes a below-detection reading
    pub fn is_sentinel(&self, token: &str) -> bool {
        let normalized = token.trim().to_lowercase();
        self.sentinel_tokens.iter().any(|t| *t == normalized)
    }

    /// Clean every reading, failing on the first malformed one
    pub fn clean(&self, readings: &[Reading]) -> Result<Vec<CleanedReading>, GlycoError> {
        readings
            .iter()
            .enumerate()
            .map(|(index, reading)| self.clean_one(index, reading))
            .collect()
    }

    /// Clean a batch, honouring the data-quality error policy
    pub fn clean_batch(
        &self,
        readings: &[Reading],
        policy: ErrorPolicy,
    ) -> Result<CleanOutcome, GlycoError> {
        if policy == ErrorPolicy::Abort {
            let cleaned = self.clean(readings)?;
            let imputed = cleaned.iter().filter(|r| r.imputed).count();
            return Ok(CleanOutcome {
                readings: cleaned,
                failures: Vec::new(),
                imputed,
            });
        }

        let mut cleaned = Vec::with_capacity(readings.len());
        // First error per subject, keyed for deterministic reporting order
        let mut failed: BTreeMap<String, String> = BTreeMap::new();

        for (index, reading) in readings.iter().enumerate() {
            match self.clean_one(index, reading) {
                Ok(c) => cleaned.push(c),
                Err(e) => {
                    failed
                        .entry(reading.subject_id.clone())
                        .or_insert_with(|| e.to_string());
                }
            }
        }

        let failed_ids: HashSet<&str> = failed.keys().map(String::as_str).collect();
        cleaned.retain(|r| !failed_ids.contains(r.subject_id.as_str()));

        for (subject_id, error) in &failed {
            warn!("excluding subject {} from cleaning: {}", subject_id, error);
        }

        let imputed = cleaned.iter().filter(|r| r.imputed).count();
        debug!(
            "cleaned {} readings ({} imputed, {} subjects excluded)",
            cleaned.len(),
            imputed,
            failed.len()
        );

        Ok(CleanOutcome {
            readings: cleaned,
            failures: failed
                .into_iter()
                .map(|(subject_id, error)| SubjectFailure { subject_id, error })
                .collect(),
            imputed,
        })
    }

    fn clean_one(&self, index: usize, reading: &Reading) -> Result<CleanedReading, GlycoError> {
        let malformed = |detail: String| GlycoError::MalformedReading {
            subject_id: reading.subject_id.clone(),
            index,
            detail,
        };

        let (glucose_value, imputed) = match &reading.glucose_value {
            Some(GlucoseValue::Numeric(value)) if value.is_finite() => (*value, false),
            Some(GlucoseValue::Numeric(value)) => {
                return Err(malformed(format!("non-finite value {}", value)));
            }
            Some(GlucoseValue::Marker(token)) if self.is_sentinel(token) => {
                (self.sentinel_value, true)
            }
            Some(GlucoseValue::Marker(token)) => {
                return Err(malformed(format!("unrecognized marker {:?}", token)));
            }
            None => return Err(malformed("missing glucose value".to_string())),
        };

        Ok(CleanedReading {
            subject_id: reading.subject_id.clone(),
            timestamp: reading.timestamp,
            glucose_value,
            imputed,
        })
    }
}

/// Clean readings with the default marker tokens, substituting `sentinel_value`
pub fn clean(readings: &[Reading], sentinel_value: f64) -> Result<Vec<CleanedReading>, GlycoError> {
    Cleaner::with_sentinel_value(sentinel_value).clean(readings)
}

/// Clean readings with the default sentinel value (39 mg/dL)
pub fn clean_default(readings: &[Reading]) -> Result<Vec<CleanedReading>, GlycoError> {
    clean(readings, DEFAULT_SENTINEL_VALUE)
}
