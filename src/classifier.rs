//! Classifier capability
//!
//! The harness only sees `Classifier` and `FittedModel`; any model library can
//! be plugged in behind them. The reference implementations here are small,
//! deterministic baselines.

use crate::error::GlycoError;
use crate::types::Label;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use std::collections::BTreeMap;

/// A model-fitting algorithm
pub trait Classifier: Send + Sync {
    /// Short name used in reports
    fn name(&self) -> String;

    /// Fit on rows of `features` with one label per row
    fn fit(
        &self,
        features: ArrayView2<'_, f64>,
        labels: &[Label],
    ) -> Result<Box<dyn FittedModel>, GlycoError>;
}

/// A fitted model able to label new rows
pub trait FittedModel: Send {
    fn predict(&self, features: ArrayView2<'_, f64>) -> Result<Vec<Label>, GlycoError>;
}

fn check_training_set(features: ArrayView2<'_, f64>, labels: &[Label]) -> Result<(), GlycoError> {
    if features.nrows() == 0 {
        return Err(GlycoError::InvalidInput(
            "cannot fit a classifier on zero rows".to_string(),
        ));
    }
    if features.nrows() != labels.len() {
        return Err(GlycoError::InvalidInput(format!(
            "{} feature rows but {} labels",
            features.nrows(),
            labels.len()
        )));
    }
    Ok(())
}

fn check_width(expected: usize, features: ArrayView2<'_, f64>) -> Result<(), GlycoError> {
    if features.ncols() != expected {
        return Err(GlycoError::InvalidInput(format!(
            "model fit on {} features cannot predict rows with {}",
            expected,
            features.ncols()
        )));
    }
    Ok(())
}

/// Most frequent label; ties go to the smallest label
fn majority(labels: &[Label]) -> Label {
    let mut counts: BTreeMap<&Label, usize> = BTreeMap::new();
    for label in labels {
        *counts.entry(label).or_default() += 1;
    }
    let mut best: Option<(&Label, usize)> = None;
    for (label, count) in counts {
        if best.map_or(true, |(_, c)| count > c) {
            best = Some((label, count));
        }
    }
    best.map(|(label, _)| label.clone()).unwrap_or_default()
}

fn squared_distance(a: ArrayView1<'_, f64>, b: ArrayView1<'_, f64>) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y).powi(2)).sum()
}

/// Always predicts the most frequent training label
#[derive(Debug, Clone, Copy, Default)]
pub struct MajorityClass;

struct MajorityModel {
    label: Label,
}

impl Classifier for MajorityClass {
    fn name(&self) -> String {
        "majority".to_string()
    }

    fn fit(
        &self,
        features: ArrayView2<'_, f64>,
        labels: &[Label],
    ) -> Result<Box<dyn FittedModel>, GlycoError> {
        check_training_set(features, labels)?;
        Ok(Box::new(MajorityModel {
            label: majority(labels),
        }))
    }
}

impl FittedModel for MajorityModel {
    fn predict(&self, features: ArrayView2<'_, f64>) -> Result<Vec<Label>, GlycoError> {
        Ok(vec![self.label.clone(); features.nrows()])
    }
}

/// Assigns the label of the closest class centroid
#[derive(Debug, Clone, Copy, Default)]
pub struct NearestCentroid;

struct CentroidModel {
    labels: Vec<Label>,
    centroids: Array2<f64>,
}

impl Classifier for NearestCentroid {
    fn name(&self) -> String {
        "nearest_centroid".to_string()
    }

    fn fit(
        &self,
        features: ArrayView2<'_, f64>,
        labels: &[Label],
    ) -> Result<Box<dyn FittedModel>, GlycoError> {
        check_training_set(features, labels)?;

        let mut rows_by_class: BTreeMap<&Label, Vec<usize>> = BTreeMap::new();
        for (i, label) in labels.iter().enumerate() {
            rows_by_class.entry(label).or_default().push(i);
        }

        let mut centroids = Array2::<f64>::zeros((rows_by_class.len(), features.ncols()));
        let mut class_labels = Vec::with_capacity(rows_by_class.len());
        for (c, (label, rows)) in rows_by_class.into_iter().enumerate() {
            let mean: Array1<f64> = features
                .select(Axis(0), &rows)
                .mean_axis(Axis(0))
                .unwrap_or_else(|| Array1::zeros(features.ncols()));
            centroids.row_mut(c).assign(&mean);
            class_labels.push(label.clone());
        }

        Ok(Box::new(CentroidModel {
            labels: class_labels,
            centroids,
        }))
    }
}

impl FittedModel for CentroidModel {
    fn predict(&self, features: ArrayView2<'_, f64>) -> Result<Vec<Label>, GlycoError> {
        check_width(self.centroids.ncols(), features)?;
        Ok(features
            .outer_iter()
            .map(|row| {
                let mut best = 0;
                let mut best_distance = f64::INFINITY;
                for (c, centroid) in self.centroids.outer_iter().enumerate() {
                    let d = squared_distance(row, centroid);
                    if d < best_distance {
                        best = c;
                        best_distance = d;
                    }
                }
                self.labels[best].clone()
            })
            .collect())
    }
}

/// k-nearest neighbours with Euclidean distance and majority vote
#[derive(Debug, Clone, Copy)]
pub struct KNearestNeighbors {
    pub k: usize,
}

impl Default for KNearestNeighbors {
    fn default() -> Self {
        Self { k: 3 }
    }
}

impl KNearestNeighbors {
    pub fn new(k: usize) -> Self {
        Self { k }
    }
}

struct NeighborsModel {
    k: usize,
    features: Array2<f64>,
    labels: Vec<Label>,
}

impl Classifier for KNearestNeighbors {
    fn name(&self) -> String {
        format!("knn_{}", self.k)
    }

    fn fit(
        &self,
        features: ArrayView2<'_, f64>,
        labels: &[Label],
    ) -> Result<Box<dyn FittedModel>, GlycoError> {
        check_training_set(features, labels)?;
        if self.k == 0 {
            return Err(GlycoError::InvalidInput(
                "k-nearest neighbours needs k >= 1".to_string(),
            ));
        }
        Ok(Box::new(NeighborsModel {
            k: self.k.min(labels.len()),
            features: features.to_owned(),
            labels: labels.to_vec(),
        }))
    }
}

impl FittedModel for NeighborsModel {
    fn predict(&self, features: ArrayView2<'_, f64>) -> Result<Vec<Label>, GlycoError> {
        check_width(self.features.ncols(), features)?;
        Ok(features
            .outer_iter()
            .map(|row| {
                let mut distances: Vec<(f64, usize)> = self
                    .features
                    .outer_iter()
                    .enumerate()
                    .map(|(i, train)| (squared_distance(row, train), i))
                    .collect();
                // Equal distances fall back to training order
                distances.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
                let nearest: Vec<Label> = distances
                    .iter()
                    .take(self.k)
                    .map(|(_, i)| self.labels[*i].clone())
                    .collect();
                majority(&nearest)
            })
            .collect())
    }
}
