//! Stratified cross-validation
//!
//! Folds are built once from the labels with an explicit seed. Each fold is
//! then evaluated independently: standardization and the optional reducer are
//! fit on the training rows only, the classifier is fit on the training rows
//! and scored on the held-out rows. Fold results are reduced in fold-index
//! order, so parallel completion order never changes the aggregate.

use crate::classifier::Classifier;
use crate::error::GlycoError;
use crate::evaluation::{
    accuracy, agreement_statistic, confusion_with_vocabulary, no_information_rate,
    ConfusionMatrix, EvaluationReport,
};
use crate::features::{FeatureTable, Standardizer};
use crate::reducer::{ComponentClamp, DimensionalityReducer, ReductionMethod};
use crate::types::{Label, SubjectId};
use log::{debug, info, warn};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Instant;

/// One held-out partition of the rows
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fold {
    pub index: usize,
    /// Row indices, ascending
    pub members: Vec<usize>,
}

/// A label class too small to appear in every fold
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassShortfall {
    pub label: Label,
    pub members: usize,
    /// Folds that received no member of this class
    pub folds_without: usize,
}

/// Disjoint folds covering every row exactly once
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FoldSet {
    seed: u64,
    rows: usize,
    folds: Vec<Fold>,
    shortfalls: Vec<ClassShortfall>,
}

impl FoldSet {
    pub fn k(&self) -> usize {
        self.folds.len()
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Number of rows partitioned
    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn folds(&self) -> &[Fold] {
        &self.folds
    }

    pub fn shortfalls(&self) -> &[ClassShortfall] {
        &self.shortfalls
    }

    /// Rows held out by fold `index`
    pub fn test_indices(&self, index: usize) -> Result<Vec<usize>, GlycoError> {
        self.folds
            .get(index)
            .map(|f| f.members.clone())
            .ok_or_else(|| GlycoError::InvalidInput(format!("no fold {}", index)))
    }

    /// Rows used for training when fold `index` is held out, ascending
    pub fn train_indices(&self, index: usize) -> Result<Vec<usize>, GlycoError> {
        if index >= self.folds.len() {
            return Err(GlycoError::InvalidInput(format!("no fold {}", index)));
        }
        let mut rows: Vec<usize> = self
            .folds
            .iter()
            .filter(|f| f.index != index)
            .flat_map(|f| f.members.iter().copied())
            .collect();
        rows.sort_unstable();
        Ok(rows)
    }

    /// Fold index of every row
    pub fn assignment(&self) -> Vec<usize> {
        let mut assignment = vec![0; self.rows];
        for fold in &self.folds {
            for &row in &fold.members {
                assignment[row] = fold.index;
            }
        }
        assignment
    }
}

/// Build `k` stratified folds over `labels`.
///
/// Classes are visited in label order. Within a class the row indices are
/// shuffled with a `ChaCha8Rng` seeded from `seed` and dealt round-robin, the
/// dealing position carrying over from one class to the next.
pub fn make_folds(labels: &[Label], k: usize, seed: u64) -> Result<FoldSet, GlycoError> {
    if k < 2 {
        return Err(GlycoError::InvalidInput(format!(
            "at least 2 folds are required, got {}",
            k
        )));
    }
    if k > labels.len() {
        return Err(GlycoError::InvalidInput(format!(
            "{} folds requested for {} rows",
            k,
            labels.len()
        )));
    }

    let mut rows_by_class: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (i, label) in labels.iter().enumerate() {
        rows_by_class.entry(label.as_str()).or_default().push(i);
    }

    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut members: Vec<Vec<usize>> = vec![Vec::new(); k];
    let mut shortfalls = Vec::new();
    let mut position = 0;

    for (label, mut rows) in rows_by_class {
        if rows.len() < k {
            let shortfall = GlycoError::InsufficientClassMembers {
                label: label.to_string(),
                members: rows.len(),
                folds: k,
            };
            warn!("{}; distributing best-effort", shortfall);
            shortfalls.push(ClassShortfall {
                label: label.to_string(),
                members: rows.len(),
                folds_without: k - rows.len(),
            });
        }
        rows.shuffle(&mut rng);
        for row in rows {
            members[position % k].push(row);
            position += 1;
        }
    }

    let folds = members
        .into_iter()
        .enumerate()
        .map(|(index, mut rows)| {
            rows.sort_unstable();
            Fold {
                index,
                members: rows,
            }
        })
        .collect();

    Ok(FoldSet {
        seed,
        rows: labels.len(),
        folds,
        shortfalls,
    })
}

/// Mean and sample variance of a per-fold statistic
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub mean: f64,
    pub variance: f64,
}

impl Summary {
    pub fn of(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self {
                mean: 0.0,
                variance: 0.0,
            };
        }
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let variance = if values.len() > 1 {
            values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0)
        } else {
            0.0
        };
        Self { mean, variance }
    }
}

/// Outcome of one held-out fold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FoldResult {
    pub fold: usize,
    pub accuracy: f64,
    pub agreement: f64,
    pub no_information_rate: f64,
    pub subject_ids: Vec<SubjectId>,
    pub predicted: Vec<Label>,
    pub actual: Vec<Label>,
    pub confusion: ConfusionMatrix,
    /// Set when the reducer could not fit the requested components
    pub reduction_clamp: Option<ComponentClamp>,
}

/// Aggregated cross-validation outcome for one classifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub classifier: String,
    pub folds: Vec<FoldResult>,
    pub accuracy: Summary,
    pub agreement: Summary,
    /// Statistics over every out-of-fold prediction
    pub pooled: EvaluationReport,
    pub shortfalls: Vec<ClassShortfall>,
}

/// Options shared by every fold evaluation
#[derive(Debug, Clone, Copy)]
pub struct HarnessOptions {
    /// Standardize with parameters fit on each training fold
    pub standardize: bool,
    pub reduction: ReductionMethod,
    pub components: usize,
    /// Evaluate folds on the rayon thread pool
    pub parallel: bool,
    /// Checked before each fold starts
    pub deadline: Option<Instant>,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            standardize: true,
            reduction: ReductionMethod::Pca,
            components: 2,
            parallel: false,
            deadline: None,
        }
    }
}

/// Evaluate a single fold: fit on every other fold, score on this one
pub fn evaluate_fold(
    data: &FeatureTable,
    folds: &FoldSet,
    fold: usize,
    classifier: &dyn Classifier,
    reduce_first: bool,
    options: &HarnessOptions,
    vocabulary: &[Label],
) -> Result<FoldResult, GlycoError> {
    if let Some(deadline) = options.deadline {
        if Instant::now() >= deadline {
            return Err(GlycoError::DeadlineExceeded { fold });
        }
    }
    fit_and_score(data, folds, fold, classifier, reduce_first, options, vocabulary)
        .map_err(|e| e.in_fold(fold))
}

fn fit_and_score(
    data: &FeatureTable,
    folds: &FoldSet,
    fold: usize,
    classifier: &dyn Classifier,
    reduce_first: bool,
    options: &HarnessOptions,
    vocabulary: &[Label],
) -> Result<FoldResult, GlycoError> {
    let train = data.select(&folds.train_indices(fold)?)?;
    let test = data.select(&folds.test_indices(fold)?)?;

    let (train, test) = if options.standardize {
        let standardizer = Standardizer::fit(&train)?;
        (standardizer.apply(&train)?, standardizer.apply(&test)?)
    } else {
        (train, test)
    };

    let (train, test, reduction_clamp) = if reduce_first {
        let model = DimensionalityReducer::fit_with(options.reduction, &train, options.components)?;
        (model.transform(&train)?, model.transform(&test)?, model.clamp())
    } else {
        (train, test, None)
    };

    let classifier_error = |e: GlycoError| GlycoError::Classifier {
        fold,
        message: e.to_string(),
    };
    let model = classifier
        .fit(train.values(), train.labels())
        .map_err(classifier_error)?;
    let predicted = model.predict(test.values()).map_err(classifier_error)?;
    if predicted.len() != test.n_rows() {
        return Err(GlycoError::Classifier {
            fold,
            message: format!(
                "{} predictions for {} held-out rows",
                predicted.len(),
                test.n_rows()
            ),
        });
    }

    let confusion = confusion_with_vocabulary(&predicted, test.labels(), vocabulary)?;
    let result = FoldResult {
        fold,
        accuracy: accuracy(&confusion),
        agreement: agreement_statistic(&confusion),
        no_information_rate: no_information_rate(&confusion),
        subject_ids: test.subject_ids().to_vec(),
        predicted,
        actual: test.labels().to_vec(),
        confusion,
        reduction_clamp,
    };
    debug!(
        "fold {}: {} train / {} test rows, accuracy {:.3}, agreement {:.3}",
        fold,
        train.n_rows(),
        result.subject_ids.len(),
        result.accuracy,
        result.agreement
    );
    Ok(result)
}

/// Reduce fold results (in any order) to the aggregate result
pub fn aggregate(
    classifier: &str,
    mut folds: Vec<FoldResult>,
    vocabulary: &[Label],
    shortfalls: &[ClassShortfall],
) -> Result<EvaluationResult, GlycoError> {
    folds.sort_by_key(|f| f.fold);

    let mut pooled = ConfusionMatrix::empty(vocabulary);
    for fold in &folds {
        pooled = pooled.merge(&fold.confusion)?;
    }

    let accuracies: Vec<f64> = folds.iter().map(|f| f.accuracy).collect();
    let agreements: Vec<f64> = folds.iter().map(|f| f.agreement).collect();

    Ok(EvaluationResult {
        classifier: classifier.to_string(),
        accuracy: Summary::of(&accuracies),
        agreement: Summary::of(&agreements),
        pooled: EvaluationReport::from_confusion(pooled)?,
        shortfalls: shortfalls.to_vec(),
        folds,
    })
}

/// Cross-validate `classifier` over `folds`
pub fn evaluate(
    data: &FeatureTable,
    folds: &FoldSet,
    classifier: &dyn Classifier,
    reduce_first: bool,
    options: &HarnessOptions,
) -> Result<EvaluationResult, GlycoError> {
    if folds.rows() != data.n_rows() {
        return Err(GlycoError::InvalidInput(format!(
            "folds cover {} rows but the table has {}",
            folds.rows(),
            data.n_rows()
        )));
    }
    let vocabulary = data.label_vocabulary();

    let results: Vec<FoldResult> = if options.parallel {
        (0..folds.k())
            .into_par_iter()
            .map(|i| evaluate_fold(data, folds, i, classifier, reduce_first, options, &vocabulary))
            .collect::<Result<_, _>>()?
    } else {
        (0..folds.k())
            .map(|i| evaluate_fold(data, folds, i, classifier, reduce_first, options, &vocabulary))
            .collect::<Result<_, _>>()?
    };

    let result = aggregate(&classifier.name(), results, &vocabulary, folds.shortfalls())?;
    info!(
        "{}: accuracy {:.3} (var {:.4}), agreement {:.3} over {} folds",
        result.classifier,
        result.accuracy.mean,
        result.accuracy.variance,
        result.agreement.mean,
        folds.k()
    );
    Ok(result)
}

/// Label-permutation test of mean cross-validated accuracy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermutationTest {
    pub observed: f64,
    pub permuted: Vec<f64>,
    /// (1 + #{permuted >= observed}) / (1 + permutations)
    pub p_value: f64,
}

/// Compare observed accuracy with accuracy under seeded label permutations.
///
/// The fold structure is reused unchanged for every permutation.
pub fn permutation_test(
    data: &FeatureTable,
    folds: &FoldSet,
    classifier: &dyn Classifier,
    reduce_first: bool,
    options: &HarnessOptions,
    permutations: usize,
    seed: u64,
) -> Result<PermutationTest, GlycoError> {
    let observed = evaluate(data, folds, classifier, reduce_first, options)?
        .accuracy
        .mean;

    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let shuffled: Vec<Vec<Label>> = (0..permutations)
        .map(|_| {
            let mut labels = data.labels().to_vec();
            labels.shuffle(&mut rng);
            labels
        })
        .collect();

    let score = |labels: &Vec<Label>| -> Result<f64, GlycoError> {
        let permuted = data.with_labels(labels.clone())?;
        Ok(evaluate(&permuted, folds, classifier, reduce_first, options)?
            .accuracy
            .mean)
    };
    let permuted: Vec<f64> = if options.parallel {
        shuffled.par_iter().map(score).collect::<Result<_, _>>()?
    } else {
        shuffled.iter().map(score).collect::<Result<_, _>>()?
    };

    let at_least = permuted.iter().filter(|&&p| p >= observed).count();
    let p_value = (1 + at_least) as f64 / (1 + permutations) as f64;
    info!(
        "permutation test: observed {:.3}, p = {:.4} over {} permutations",
        observed, p_value, permutations
    );

    Ok(PermutationTest {
        observed,
        permuted,
        p_value,
    })
}

/// Lifecycle of a harness
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HarnessState {
    Unfitted,
    Folded,
    Evaluated,
}

/// Cross-validation over one feature table snapshot.
///
/// Folds must be built before evaluation; once built they are reused by every
/// subsequent `evaluate` call, whatever the classifier.
pub struct CrossValidationHarness {
    data: FeatureTable,
    options: HarnessOptions,
    folds: Option<FoldSet>,
    state: HarnessState,
}

impl CrossValidationHarness {
    pub fn new(data: FeatureTable) -> Self {
        Self::with_options(data, HarnessOptions::default())
    }

    pub fn with_options(data: FeatureTable, options: HarnessOptions) -> Self {
        Self {
            data,
            options,
            folds: None,
            state: HarnessState::Unfitted,
        }
    }

    pub fn state(&self) -> HarnessState {
        self.state
    }

    pub fn data(&self) -> &FeatureTable {
        &self.data
    }

    pub fn options(&self) -> &HarnessOptions {
        &self.options
    }

    pub fn folds(&self) -> Option<&FoldSet> {
        self.folds.as_ref()
    }

    /// Build stratified folds from the table labels
    pub fn make_folds(&mut self, k: usize, seed: u64) -> Result<&FoldSet, GlycoError> {
        let folds = make_folds(self.data.labels(), k, seed)?;
        self.install(folds)
    }

    /// Use externally built folds
    pub fn set_folds(&mut self, folds: FoldSet) -> Result<&FoldSet, GlycoError> {
        if folds.rows() != self.data.n_rows() {
            return Err(GlycoError::InvalidInput(format!(
                "folds cover {} rows but the table has {}",
                folds.rows(),
                self.data.n_rows()
            )));
        }
        self.install(folds)
    }

    fn install(&mut self, folds: FoldSet) -> Result<&FoldSet, GlycoError> {
        self.state = HarnessState::Folded;
        Ok(self.folds.insert(folds))
    }

    fn ready_folds(&self) -> Result<&FoldSet, GlycoError> {
        self.folds.as_ref().ok_or_else(|| {
            GlycoError::HarnessState("folds must be built before evaluation".to_string())
        })
    }

    /// Cross-validate one classifier over the current folds
    pub fn evaluate(
        &mut self,
        classifier: &dyn Classifier,
        reduce_first: bool,
    ) -> Result<EvaluationResult, GlycoError> {
        let folds = self.ready_folds()?;
        let result = evaluate(&self.data, folds, classifier, reduce_first, &self.options)?;
        self.state = HarnessState::Evaluated;
        Ok(result)
    }

    /// Cross-validate several classifiers over the same folds
    pub fn evaluate_grid(
        &mut self,
        classifiers: &[&dyn Classifier],
        reduce_first: bool,
    ) -> Result<Vec<EvaluationResult>, GlycoError> {
        let folds = self.ready_folds()?;
        let results: Vec<EvaluationResult> = if self.options.parallel {
            classifiers
                .par_iter()
                .map(|c| evaluate(&self.data, folds, *c, reduce_first, &self.options))
                .collect::<Result<_, _>>()?
        } else {
            classifiers
                .iter()
                .map(|c| evaluate(&self.data, folds, *c, reduce_first, &self.options))
                .collect::<Result<_, _>>()?
        };
        self.state = HarnessState::Evaluated;
        Ok(results)
    }

    /// Permutation test over the current folds
    pub fn permutation_test(
        &self,
        classifier: &dyn Classifier,
        reduce_first: bool,
        permutations: usize,
        seed: u64,
    ) -> Result<PermutationTest, GlycoError> {
        let folds = self.ready_folds()?;
        permutation_test(
            &self.data,
            folds,
            classifier,
            reduce_first,
            &self.options,
            permutations,
            seed,
        )
    }
}
