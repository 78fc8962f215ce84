//! Error types for Glyco Flux

use thiserror::Error;

/// Errors that can occur during computation
#[derive(Debug, Error)]
pub enum GlycoError {
    #[error("Malformed reading for subject {subject_id} at index {index}: {detail}")]
    MalformedReading {
        subject_id: String,
        index: usize,
        detail: String,
    },

    #[error("No data for {statistic} (subject {subject_id})")]
    NoData {
        subject_id: String,
        statistic: String,
    },

    #[error(
        "No subject ids shared between metrics ({metrics_subjects} subjects) \
         and labels ({label_subjects} subjects)"
    )]
    EmptyJoin {
        metrics_subjects: usize,
        label_subjects: usize,
    },

    #[error("Column {column} has no observed values to impute from")]
    EmptyColumn { column: String },

    #[error("Missing column {column} for subject {subject_id}")]
    MissingColumn { subject_id: String, column: String },

    #[error("Label class {label} has {members} members, fewer than the {folds} requested folds")]
    InsufficientClassMembers {
        label: String,
        members: usize,
        folds: usize,
    },

    #[error("Label {label} is not part of the shared label vocabulary")]
    LabelMismatch { label: String },

    #[error("Requested {requested} components but only {feasible} are feasible")]
    DegenerateReduction { requested: usize, feasible: usize },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Harness is not ready: {0}")]
    HarnessState(String),

    #[error("Deadline exceeded before fold {fold}")]
    DeadlineExceeded { fold: usize },

    #[error("Classifier error in fold {fold}: {message}")]
    Classifier { fold: usize, message: String },

    #[error("Fold {fold}: {source}")]
    Fold {
        fold: usize,
        #[source]
        source: Box<GlycoError>,
    },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GlycoError {
    /// Subject the error refers to, when it is subject-scoped
    pub fn subject_id(&self) -> Option<&str> {
        match self {
            GlycoError::MalformedReading { subject_id, .. }
            | GlycoError::NoData { subject_id, .. }
            | GlycoError::MissingColumn { subject_id, .. } => Some(subject_id.as_str()),
            _ => None,
        }
    }

    /// Fold the error arose in, when it arose while evaluating a fold
    pub fn fold(&self) -> Option<usize> {
        match self {
            GlycoError::DeadlineExceeded { fold }
            | GlycoError::Classifier { fold, .. }
            | GlycoError::Fold { fold, .. } => Some(*fold),
            _ => None,
        }
    }

    /// Attach a fold index unless the error already carries one
    pub fn in_fold(self, fold: usize) -> Self {
        if self.fold().is_some() {
            self
        } else {
            GlycoError::Fold {
                fold,
                source: Box::new(self),
            }
        }
    }

    /// Whether the error is a data-quality problem confined to one subject
    pub fn is_data_quality(&self) -> bool {
        matches!(
            self,
            GlycoError::MalformedReading { .. } | GlycoError::NoData { .. }
        )
    }
}
