//! Evaluation statistics
//!
//! Confusion matrices over an explicit label vocabulary and the statistics
//! derived from them: accuracy, chance-corrected agreement (Cohen's kappa),
//! no-information rate, per-class sensitivity/specificity and the exact
//! binomial test of accuracy against the no-information rate.

use crate::error::GlycoError;
use crate::types::Label;
use serde::{Deserialize, Serialize};
use statrs::distribution::{Binomial, DiscreteCDF};
use std::collections::{BTreeSet, HashMap};

/// Counts of (actual, predicted) label pairs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    labels: Vec<Label>,
    /// `counts[actual][predicted]`
    counts: Vec<Vec<usize>>,
}

impl ConfusionMatrix {
    /// Empty matrix over a vocabulary (sorted, duplicates removed)
    pub fn empty(vocabulary: &[Label]) -> Self {
        let labels: Vec<Label> = vocabulary
            .iter()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let size = labels.len();
        Self {
            labels,
            counts: vec![vec![0; size]; size],
        }
    }

    /// Tabulate predictions against actual labels over `vocabulary`
    pub fn new(
        predicted: &[Label],
        actual: &[Label],
        vocabulary: &[Label],
    ) -> Result<Self, GlycoError> {
        if predicted.len() != actual.len() {
            return Err(GlycoError::InvalidInput(format!(
                "{} predictions for {} actual labels",
                predicted.len(),
                actual.len()
            )));
        }
        let mut matrix = Self::empty(vocabulary);
        let index: HashMap<&str, usize> = matrix
            .labels
            .iter()
            .enumerate()
            .map(|(i, l)| (l.as_str(), i))
            .collect();
        let position = |label: &Label| {
            index
                .get(label.as_str())
                .copied()
                .ok_or_else(|| GlycoError::LabelMismatch {
                    label: label.clone(),
                })
        };

        for (p, a) in predicted.iter().zip(actual.iter()) {
            let row = position(a)?;
            let column = position(p)?;
            matrix.counts[row][column] += 1;
        }
        Ok(matrix)
    }

    pub fn labels(&self) -> &[Label] {
        &self.labels
    }

    /// Count of rows with the given actual and predicted labels
    pub fn count(&self, actual: &str, predicted: &str) -> usize {
        let row = self.labels.iter().position(|l| l == actual);
        let column = self.labels.iter().position(|l| l == predicted);
        match (row, column) {
            (Some(r), Some(c)) => self.counts[r][c],
            _ => 0,
        }
    }

    pub fn total(&self) -> usize {
        self.counts.iter().flatten().sum()
    }

    pub fn correct(&self) -> usize {
        (0..self.labels.len()).map(|i| self.counts[i][i]).sum()
    }

    fn actual_total(&self, i: usize) -> usize {
        self.counts[i].iter().sum()
    }

    fn predicted_total(&self, j: usize) -> usize {
        self.counts.iter().map(|row| row[j]).sum()
    }

    /// Element-wise sum of two matrices over the same vocabulary
    pub fn merge(&self, other: &ConfusionMatrix) -> Result<ConfusionMatrix, GlycoError> {
        if self.labels != other.labels {
            return Err(GlycoError::InvalidInput(
                "cannot merge confusion matrices over different vocabularies".to_string(),
            ));
        }
        let mut merged = self.clone();
        for (row, other_row) in merged.counts.iter_mut().zip(other.counts.iter()) {
            for (cell, other_cell) in row.iter_mut().zip(other_row.iter()) {
                *cell += other_cell;
            }
        }
        Ok(merged)
    }
}

/// Confusion matrix over the labels observed in `actual`
pub fn confusion(predicted: &[Label], actual: &[Label]) -> Result<ConfusionMatrix, GlycoError> {
    ConfusionMatrix::new(predicted, actual, actual)
}

/// Confusion matrix over an explicit shared vocabulary
pub fn confusion_with_vocabulary(
    predicted: &[Label],
    actual: &[Label],
    vocabulary: &[Label],
) -> Result<ConfusionMatrix, GlycoError> {
    ConfusionMatrix::new(predicted, actual, vocabulary)
}

/// Share of correct predictions (0 for an empty matrix)
pub fn accuracy(cm: &ConfusionMatrix) -> f64 {
    let total = cm.total();
    if total == 0 {
        return 0.0;
    }
    cm.correct() as f64 / total as f64
}

/// Cohen's kappa: (p_o - p_e) / (1 - p_e).
///
/// Returns 0 when chance agreement is already 1 (a single class in both
/// predictions and actual labels) or the matrix is empty.
pub fn agreement_statistic(cm: &ConfusionMatrix) -> f64 {
    let total = cm.total();
    if total == 0 {
        return 0.0;
    }
    let n = total as f64;
    let observed = cm.correct() as f64 / n;
    let expected: f64 = (0..cm.labels.len())
        .map(|i| (cm.actual_total(i) as f64 / n) * (cm.predicted_total(i) as f64 / n))
        .sum();
    if (1.0 - expected).abs() < f64::EPSILON {
        return 0.0;
    }
    (observed - expected) / (1.0 - expected)
}

/// Proportion of the majority class among actual labels
pub fn no_information_rate(cm: &ConfusionMatrix) -> f64 {
    let total = cm.total();
    if total == 0 {
        return 0.0;
    }
    let largest = (0..cm.labels.len())
        .map(|i| cm.actual_total(i))
        .max()
        .unwrap_or(0);
    largest as f64 / total as f64
}

/// One-sided exact binomial p-value that accuracy exceeds the no-information rate
pub fn accuracy_p_value(cm: &ConfusionMatrix) -> Result<f64, GlycoError> {
    let total = cm.total() as u64;
    let correct = cm.correct() as u64;
    let nir = no_information_rate(cm);
    if total == 0 || correct == 0 || nir >= 1.0 {
        return Ok(1.0);
    }
    let binomial = Binomial::new(nir, total)
        .map_err(|e| GlycoError::InvalidInput(format!("binomial test: {}", e)))?;
    // P(X >= correct) = P(X > correct - 1)
    Ok(binomial.sf(correct - 1))
}

/// Per-class one-vs-rest statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassStatistics {
    pub label: Label,
    /// Number of rows whose actual label is this class
    pub support: usize,
    /// True positive rate (None when the class has no actual rows)
    pub sensitivity: Option<f64>,
    /// True negative rate (None when every row belongs to the class)
    pub specificity: Option<f64>,
}

pub fn class_statistics(cm: &ConfusionMatrix) -> Vec<ClassStatistics> {
    let total = cm.total();
    (0..cm.labels.len())
        .map(|i| {
            let support = cm.actual_total(i);
            let true_positive = cm.counts[i][i];
            let false_positive = cm.predicted_total(i) - true_positive;
            let negatives = total - support;
            let true_negative = negatives - false_positive;
            ClassStatistics {
                label: cm.labels[i].clone(),
                support,
                sensitivity: (support > 0).then(|| true_positive as f64 / support as f64),
                specificity: (negatives > 0).then(|| true_negative as f64 / negatives as f64),
            }
        })
        .collect()
}

/// Summary of one confusion matrix
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub confusion: ConfusionMatrix,
    pub accuracy: f64,
    pub agreement: f64,
    pub no_information_rate: f64,
    /// P(accuracy > no-information rate), exact binomial
    pub accuracy_p_value: f64,
    pub classes: Vec<ClassStatistics>,
}

impl EvaluationReport {
    pub fn from_confusion(confusion: ConfusionMatrix) -> Result<Self, GlycoError> {
        Ok(Self {
            accuracy: accuracy(&confusion),
            agreement: agreement_statistic(&confusion),
            no_information_rate: no_information_rate(&confusion),
            accuracy_p_value: accuracy_p_value(&confusion)?,
            classes: class_statistics(&confusion),
            confusion,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(values: &[&str]) -> Vec<Label> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_confusion_counts() {
        let actual = labels(&["a", "a", "b", "b", "b"]);
        let predicted = labels(&["a", "b", "b", "b", "a"]);
        let cm = confusion(&predicted, &actual).unwrap();

        assert_eq!(cm.labels(), &["a", "b"]);
        assert_eq!(cm.count("a", "a"), 1);
        assert_eq!(cm.count("a", "b"), 1);
        assert_eq!(cm.count("b", "b"), 2);
        assert_eq!(cm.count("b", "a"), 1);
        assert_eq!(cm.total(), 5);
        assert_eq!(accuracy(&cm), 0.6);
        assert_eq!(no_information_rate(&cm), 0.6);
    }

    #[test]
    fn test_kappa_known_value() {
        // p_o = 0.7, p_e = 0.5*0.6 + 0.5*0.4 = 0.5 -> kappa 0.4
        let actual = labels(&["a", "a", "a", "a", "a", "b", "b", "b", "b", "b"]);
        let predicted = labels(&["a", "a", "a", "a", "b", "a", "a", "b", "b", "b"]);
        let cm = confusion(&predicted, &actual).unwrap();

        assert!((accuracy(&cm) - 0.7).abs() < 1e-12);
        assert!((agreement_statistic(&cm) - 0.4).abs() < 1e-12);
    }

    #[test]
    fn test_perfect_and_chance_agreement() {
        let actual = labels(&["a", "b", "a", "b"]);
        let cm = confusion(&actual, &actual).unwrap();
        assert_eq!(agreement_statistic(&cm), 1.0);

        let constant = labels(&["a", "a", "a", "a"]);
        let cm = confusion(&constant, &actual).unwrap();
        assert_eq!(agreement_statistic(&cm), 0.0);

        let single = labels(&["a", "a"]);
        let cm = confusion(&single, &single).unwrap();
        assert_eq!(agreement_statistic(&cm), 0.0);
    }

    #[test]
    fn test_label_outside_vocabulary() {
        let actual = labels(&["a", "b"]);
        let predicted = labels(&["a", "c"]);
        match confusion(&predicted, &actual) {
            Err(GlycoError::LabelMismatch { label }) => assert_eq!(label, "c"),
            other => panic!("expected LabelMismatch, got {:?}", other),
        }

        let vocabulary = labels(&["a", "b", "c"]);
        let cm = confusion_with_vocabulary(&predicted, &actual, &vocabulary).unwrap();
        assert_eq!(cm.count("b", "c"), 1);
    }

    #[test]
    fn test_length_mismatch() {
        assert!(matches!(
            confusion(&labels(&["a"]), &labels(&["a", "b"])),
            Err(GlycoError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_binomial_p_value() {
        // 9 of 10 correct with NIR 0.5: P(X >= 9) = 11 / 1024
        let actual = labels(&["a", "a", "a", "a", "a", "b", "b", "b", "b", "b"]);
        let predicted = labels(&["a", "a", "a", "a", "a", "b", "b", "b", "b", "a"]);
        let cm = confusion(&predicted, &actual).unwrap();

        let p = accuracy_p_value(&cm).unwrap();
        assert!((p - 11.0 / 1024.0).abs() < 1e-9);
    }

    #[test]
    fn test_class_statistics() {
        let actual = labels(&["a", "a", "b", "b", "b"]);
        let predicted = labels(&["a", "b", "b", "b", "a"]);
        let stats = class_statistics(&confusion(&predicted, &actual).unwrap());

        assert_eq!(stats[0].label, "a");
        assert_eq!(stats[0].support, 2);
        assert_eq!(stats[0].sensitivity, Some(0.5));
        assert!((stats[0].specificity.unwrap() - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_merge() {
        let vocabulary = labels(&["a", "b"]);
        let first =
            confusion_with_vocabulary(&labels(&["a"]), &labels(&["a"]), &vocabulary).unwrap();
        let second =
            confusion_with_vocabulary(&labels(&["a"]), &labels(&["b"]), &vocabulary).unwrap();

        let merged = first.merge(&second).unwrap();
        assert_eq!(merged.total(), 2);
        assert_eq!(merged.count("b", "a"), 1);

        let other = confusion(&labels(&["x"]), &labels(&["x"])).unwrap();
        assert!(first.merge(&other).is_err());
    }

    #[test]
    fn test_report_from_confusion() {
        let actual = labels(&["a", "b", "a", "b"]);
        let report =
            EvaluationReport::from_confusion(confusion(&actual, &actual).unwrap()).unwrap();
        assert_eq!(report.accuracy, 1.0);
        assert_eq!(report.agreement, 1.0);
        assert_eq!(report.no_information_rate, 0.5);
        assert!((report.accuracy_p_value - 1.0 / 16.0).abs() < 1e-9);
    }
}
