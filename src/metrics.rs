//! Glycemic metrics
//!
//! This module derives per-subject statistics from cleaned readings:
//! - Percent of readings above / below each configured threshold
//! - Median glucose
//! - Optional extended summary (mean, sd, cv, min, max, count)
//! - Optional time-weighted percentages on a linearly resampled grid
//!
//! Unweighted percentages count every reading once regardless of spacing.

use crate::config::{MetricsConfig, TimeWeighting};
use crate::error::GlycoError;
use crate::types::{CleanedReading, ErrorPolicy, SubjectFailure, SubjectMetrics};
use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Name of the median statistic
pub const MEDIAN: &str = "median";

/// Column name for a percent-above statistic (e.g. `above_140`)
pub fn above_name(threshold: f64) -> String {
    format!("above_{}", threshold)
}

/// Column name for a percent-below statistic (e.g. `below_70`)
pub fn below_name(threshold: f64) -> String {
    format!("below_{}", threshold)
}

/// Percent of values strictly greater than `threshold`
pub fn above_percent(values: &[f64], threshold: f64) -> Option<f64> {
    percent_where(values, |v| v > threshold)
}

/// Percent of values strictly less than `threshold`
pub fn below_percent(values: &[f64], threshold: f64) -> Option<f64> {
    percent_where(values, |v| v < threshold)
}

fn percent_where(values: &[f64], predicate: impl Fn(f64) -> bool) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let count = values.iter().filter(|v| predicate(**v)).count();
    Some(count as f64 / values.len() as f64 * 100.0)
}

/// Median of the values; the mean of the two middle values for even counts
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

/// Metrics computed over a batch of subjects
#[derive(Debug, Clone, Default)]
pub struct MetricsBatch {
    /// One row per subject, ordered by subject id
    pub metrics: Vec<SubjectMetrics>,
    /// Subjects excluded under `ErrorPolicy::IsolateSubject`
    pub failures: Vec<SubjectFailure>,
}

/// Engine computing the configured statistic set
#[derive(Debug, Clone, Default)]
pub struct MetricsEngine {
    config: MetricsConfig,
}

impl MetricsEngine {
    pub fn new(config: MetricsConfig) -> Self {
        Self { config }
    }

    /// Engine with only the threshold statistics and the median
    pub fn with_thresholds(thresholds_above: &[f64], thresholds_below: &[f64]) -> Self {
        Self::new(MetricsConfig {
            thresholds_above: thresholds_above.to_vec(),
            thresholds_below: thresholds_below.to_vec(),
            extended: false,
            time_weighting: None,
        })
    }

    pub fn config(&self) -> &MetricsConfig {
        &self.config
    }

    /// Names of every statistic this engine produces, in column order
    pub fn statistic_names(&self) -> Vec<String> {
        let mut names = BTreeSet::new();
        for t in &self.config.thresholds_above {
            names.insert(above_name(*t));
        }
        for t in &self.config.thresholds_below {
            names.insert(below_name(*t));
        }
        names.insert(MEDIAN.to_string());
        if self.config.extended {
            for name in ["mean", "sd", "cv", "min", "max", "readings"] {
                names.insert(name.to_string());
            }
        }
        if self.config.time_weighting.is_some() {
            for t in &self.config.thresholds_above {
                names.insert(format!("tw_{}", above_name(*t)));
            }
            for t in &self.config.thresholds_below {
                names.insert(format!("tw_{}", below_name(*t)));
            }
        }
        names.into_iter().collect()
    }

    /// Compute metrics for one subject from that subject's readings
    pub fn compute(
        &self,
        subject_id: &str,
        readings: &[CleanedReading],
    ) -> Result<SubjectMetrics, GlycoError> {
        if readings.is_empty() {
            return Err(GlycoError::NoData {
                subject_id: subject_id.to_string(),
                statistic: "all statistics".to_string(),
            });
        }
        if let Some(other) = readings.iter().find(|r| r.subject_id != subject_id) {
            return Err(GlycoError::InvalidInput(format!(
                "reading for subject {} passed to metrics of subject {}",
                other.subject_id, subject_id
            )));
        }

        let values: Vec<f64> = readings.iter().map(|r| r.glucose_value).collect();
        let mut statistics = BTreeMap::new();

        for t in &self.config.thresholds_above {
            statistics.insert(above_name(*t), above_percent(&values, *t).unwrap_or(0.0));
        }
        for t in &self.config.thresholds_below {
            statistics.insert(below_name(*t), below_percent(&values, *t).unwrap_or(0.0));
        }
        if let Some(m) = median(&values) {
            statistics.insert(MEDIAN.to_string(), m);
        }

        if self.config.extended {
            insert_extended(&mut statistics, &values);
        }

        let mut synthesized = Vec::new();
        if let Some(weighting) = &self.config.time_weighting {
            let grid = resample_linear(readings, weighting);
            let grid_values: Vec<f64> = grid.iter().map(|s| s.value).collect();
            for t in &self.config.thresholds_above {
                statistics.insert(
                    format!("tw_{}", above_name(*t)),
                    above_percent(&grid_values, *t).unwrap_or(0.0),
                );
            }
            for t in &self.config.thresholds_below {
                statistics.insert(
                    format!("tw_{}", below_name(*t)),
                    below_percent(&grid_values, *t).unwrap_or(0.0),
                );
            }
            synthesized = grid
                .iter()
                .filter(|s| s.synthesized)
                .map(|s| s.timestamp)
                .collect();
        }

        Ok(SubjectMetrics {
            subject_id: subject_id.to_string(),
            statistics,
            reading_count: readings.len(),
            synthesized,
        })
    }

    /// Compute metrics for every subject in a mixed batch of readings
    pub fn compute_batch(
        &self,
        readings: &[CleanedReading],
        policy: ErrorPolicy,
    ) -> Result<MetricsBatch, GlycoError> {
        self.compute_batch_with(readings, policy, None)
    }

    /// `compute_batch`, memoizing each subject in `cache` when one is given
    pub fn compute_batch_with(
        &self,
        readings: &[CleanedReading],
        policy: ErrorPolicy,
        mut cache: Option<&mut dyn MetricsCache>,
    ) -> Result<MetricsBatch, GlycoError> {
        let mut by_subject: BTreeMap<&str, Vec<CleanedReading>> = BTreeMap::new();
        for reading in readings {
            by_subject
                .entry(reading.subject_id.as_str())
                .or_default()
                .push(reading.clone());
        }

        let mut batch = MetricsBatch::default();
        for (subject_id, subject_readings) in by_subject {
            let computed = match cache.as_deref_mut() {
                Some(cache) => self.compute_cached(subject_id, &subject_readings, cache),
                None => self.compute(subject_id, &subject_readings),
            };
            match computed {
                Ok(metrics) => {
                    debug!(
                        "computed {} statistics for subject {} from {} readings",
                        metrics.statistics.len(),
                        subject_id,
                        metrics.reading_count
                    );
                    batch.metrics.push(metrics);
                }
                Err(e) if policy == ErrorPolicy::IsolateSubject && e.is_data_quality() => {
                    warn!("excluding subject {} from metrics: {}", subject_id, e);
                    batch.failures.push(SubjectFailure {
                        subject_id: subject_id.to_string(),
                        error: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            "computed metrics for {} subjects ({} excluded)",
            batch.metrics.len(),
            batch.failures.len()
        );
        Ok(batch)
    }

    /// Compute metrics for one subject, consulting and filling `cache`
    pub fn compute_cached(
        &self,
        subject_id: &str,
        readings: &[CleanedReading],
        cache: &mut dyn MetricsCache,
    ) -> Result<SubjectMetrics, GlycoError> {
        let key = CacheKey::new(readings, &self.config);
        if let Some(hit) = cache.get(&key) {
            debug!("metrics cache hit for subject {}", subject_id);
            return Ok(hit);
        }
        let metrics = self.compute(subject_id, readings)?;
        cache.put(key, metrics.clone());
        Ok(metrics)
    }
}

/// Compute threshold percentages and the median for one subject's readings
pub fn compute_subject_metrics(
    subject_id: &str,
    readings: &[CleanedReading],
    thresholds_above: &[f64],
    thresholds_below: &[f64],
) -> Result<SubjectMetrics, GlycoError> {
    MetricsEngine::with_thresholds(thresholds_above, thresholds_below).compute(subject_id, readings)
}

fn insert_extended(statistics: &mut BTreeMap<String, f64>, values: &[f64]) {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let sd = if values.len() > 1 {
        let ss: f64 = values.iter().map(|v| (v - mean).powi(2)).sum();
        (ss / (n - 1.0)).sqrt()
    } else {
        0.0
    };
    let cv = if mean != 0.0 { sd / mean * 100.0 } else { 0.0 };
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    statistics.insert("mean".to_string(), mean);
    statistics.insert("sd".to_string(), sd);
    statistics.insert("cv".to_string(), cv);
    statistics.insert("min".to_string(), min);
    statistics.insert("max".to_string(), max);
    statistics.insert("readings".to_string(), n);
}

/// One point of a resampled series
#[derive(Debug, Clone, PartialEq)]
pub struct GridSample {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    /// True when the value was interpolated rather than observed
    pub synthesized: bool,
}

/// Resample readings onto a regular grid anchored at the first reading.
///
/// Grid points that coincide with a reading take its value. Points strictly
/// between two readings are linearly interpolated in time when the gap between
/// those readings is at most `max_gap_minutes`; otherwise they are skipped.
/// Readings sharing a timestamp keep the first occurrence.
pub fn resample_linear(readings: &[CleanedReading], weighting: &TimeWeighting) -> Vec<GridSample> {
    let mut sorted: Vec<&CleanedReading> = readings.iter().collect();
    sorted.sort_by_key(|r| r.timestamp);
    sorted.dedup_by_key(|r| r.timestamp);

    let Some(first) = sorted.first() else {
        return Vec::new();
    };
    let last = sorted[sorted.len() - 1];

    let step_ms = ((weighting.step_minutes * 60_000.0).round() as i64).max(1);
    let max_gap_ms = (weighting.max_gap_minutes * 60_000.0).round() as i64;
    let origin = first.timestamp;
    let span_ms = (last.timestamp - origin).num_milliseconds();

    let mut samples = Vec::new();
    let mut segment = 0;
    let mut offset_ms = 0;
    while offset_ms <= span_ms {
        let t = origin + Duration::milliseconds(offset_ms);
        while segment + 1 < sorted.len() && sorted[segment + 1].timestamp <= t {
            segment += 1;
        }
        let left = sorted[segment];
        if left.timestamp == t {
            samples.push(GridSample {
                timestamp: t,
                value: left.glucose_value,
                synthesized: false,
            });
        } else if let Some(right) = sorted.get(segment + 1) {
            let gap_ms = (right.timestamp - left.timestamp).num_milliseconds();
            if gap_ms <= max_gap_ms {
                let fraction = (t - left.timestamp).num_milliseconds() as f64 / gap_ms as f64;
                samples.push(GridSample {
                    timestamp: t,
                    value: left.glucose_value
                        + fraction * (right.glucose_value - left.glucose_value),
                    synthesized: true,
                });
            }
        }
        offset_ms += step_ms;
    }

    samples
}

/// Content-addressed key for memoized metrics
///
/// Two keys are equal only when their readings and configuration are.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// `(subject_id, timestamp millis, value bits)` sorted
    readings: Vec<(String, i64, u64)>,
    thresholds_above: Vec<u64>,
    thresholds_below: Vec<u64>,
    extended: bool,
    time_weighting: Option<(u64, u64)>,
}

impl CacheKey {
    /// Key from the reading set (order-insensitive) and the metrics configuration
    pub fn new(readings: &[CleanedReading], config: &MetricsConfig) -> Self {
        let mut entries: Vec<(String, i64, u64)> = readings
            .iter()
            .map(|r| {
                (
                    r.subject_id.clone(),
                    r.timestamp.timestamp_millis(),
                    r.glucose_value.to_bits(),
                )
            })
            .collect();
        entries.sort_unstable();

        Self {
            readings: entries,
            thresholds_above: config.thresholds_above.iter().map(|t| t.to_bits()).collect(),
            thresholds_below: config.thresholds_below.iter().map(|t| t.to_bits()).collect(),
            extended: config.extended,
            time_weighting: config
                .time_weighting
                .map(|w| (w.step_minutes.to_bits(), w.max_gap_minutes.to_bits())),
        }
    }
}

/// Storage for memoized subject metrics
pub trait MetricsCache {
    fn get(&self, key: &CacheKey) -> Option<SubjectMetrics>;
    fn put(&mut self, key: CacheKey, metrics: SubjectMetrics);
}

/// Process-local metrics cache
#[derive(Debug, Default)]
pub struct InMemoryMetricsCache {
    entries: HashMap<CacheKey, SubjectMetrics>,
}

impl InMemoryMetricsCache {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl MetricsCache for InMemoryMetricsCache {
    fn get(&self, key: &CacheKey) -> Option<SubjectMetrics> {
        self.entries.get(key).cloned()
    }

    fn put(&mut self, key: CacheKey, metrics: SubjectMetrics) {
        self.entries.insert(key, metrics);
    }
}
