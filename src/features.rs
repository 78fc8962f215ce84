//! Feature table construction
//!
//! This module joins per-subject metrics with clinical covariates and labels
//! into a numeric feature matrix:
//! - Explicit schema of standardizable columns (no type inference)
//! - Missing covariates imputed or dropped, always recorded
//! - Standardization fit on one table and applied to another
//! - CSV interchange

use crate::error::GlycoError;
use crate::types::{
    CovariateRow, ExcludedSubject, ImputedCell, Label, MissingPolicy, SubjectId, SubjectMetrics,
};
use log::{debug, info, warn};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::io::{Read, Write};

/// Columns below this standard deviation are centered but not scaled
const MIN_SCALE: f64 = 1e-12;

/// Declared numeric columns of a feature table
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FeatureSchema {
    /// Statistic names taken from `SubjectMetrics`
    pub metric_columns: Vec<String>,
    /// Covariate names taken from `CovariateRow`
    pub covariate_columns: Vec<String>,
}

impl FeatureSchema {
    pub fn new(metric_columns: Vec<String>, covariate_columns: Vec<String>) -> Self {
        Self {
            metric_columns,
            covariate_columns,
        }
    }

    /// All numeric columns, metrics first
    pub fn columns(&self) -> Vec<String> {
        self.metric_columns
            .iter()
            .chain(self.covariate_columns.iter())
            .cloned()
            .collect()
    }

    fn validate(&self) -> Result<(), GlycoError> {
        let columns = self.columns();
        if columns.is_empty() {
            return Err(GlycoError::InvalidInput(
                "feature schema declares no numeric columns".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for column in &columns {
            if column == "subject_id" || column == "label" {
                return Err(GlycoError::InvalidInput(format!(
                    "{} is reserved and cannot be a numeric column",
                    column
                )));
            }
            if !seen.insert(column.as_str()) {
                return Err(GlycoError::InvalidInput(format!(
                    "column {} declared twice",
                    column
                )));
            }
        }
        Ok(())
    }
}

/// Per-subject numeric feature matrix with labels
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureTable {
    columns: Vec<String>,
    subject_ids: Vec<SubjectId>,
    labels: Vec<Label>,
    values: Array2<f64>,
    excluded: Vec<ExcludedSubject>,
    imputed: Vec<ImputedCell>,
}

impl FeatureTable {
    /// Assemble a table from its parts
    pub fn new(
        columns: Vec<String>,
        subject_ids: Vec<SubjectId>,
        labels: Vec<Label>,
        values: Array2<f64>,
    ) -> Result<Self, GlycoError> {
        if values.ncols() != columns.len() {
            return Err(GlycoError::InvalidInput(format!(
                "{} columns declared for a matrix with {} columns",
                columns.len(),
                values.ncols()
            )));
        }
        if values.nrows() != subject_ids.len() || labels.len() != subject_ids.len() {
            return Err(GlycoError::InvalidInput(format!(
                "row count mismatch: {} values, {} subject ids, {} labels",
                values.nrows(),
                subject_ids.len(),
                labels.len()
            )));
        }
        Ok(Self {
            columns,
            subject_ids,
            labels,
            values,
            excluded: Vec::new(),
            imputed: Vec::new(),
        })
    }

    /// Join metrics, covariates and labels on subject id.
    ///
    /// Metrics are inner-joined with labels; covariates are left-joined. Rows
    /// keep the order of `metrics`.
    pub fn build(
        metrics: &[SubjectMetrics],
        covariates: &[CovariateRow],
        labels: &BTreeMap<SubjectId, Label>,
        schema: &FeatureSchema,
        missing_policy: MissingPolicy,
    ) -> Result<Self, GlycoError> {
        schema.validate()?;

        let mut seen = HashSet::new();
        for row in metrics {
            if !seen.insert(row.subject_id.as_str()) {
                return Err(GlycoError::InvalidInput(format!(
                    "subject {} has more than one metrics row",
                    row.subject_id
                )));
            }
        }

        let joined: Vec<&SubjectMetrics> = metrics
            .iter()
            .filter(|m| labels.contains_key(&m.subject_id))
            .collect();
        if joined.is_empty() {
            return Err(GlycoError::EmptyJoin {
                metrics_subjects: metrics.len(),
                label_subjects: labels.len(),
            });
        }
        if joined.len() < metrics.len() {
            debug!(
                "{} subjects have metrics but no label",
                metrics.len() - joined.len()
            );
        }

        let covariate_index: HashMap<&str, &CovariateRow> = covariates
            .iter()
            .map(|row| (row.subject_id.as_str(), row))
            .collect();

        // Raw rows: metric values are mandatory, covariates may be missing
        let mut raw_rows: Vec<(SubjectId, Vec<Option<f64>>)> = Vec::with_capacity(joined.len());
        for m in &joined {
            let mut row =
                Vec::with_capacity(schema.metric_columns.len() + schema.covariate_columns.len());
            for column in &schema.metric_columns {
                let value = m.get(column).ok_or_else(|| GlycoError::MissingColumn {
                    subject_id: m.subject_id.clone(),
                    column: column.clone(),
                })?;
                row.push(Some(value));
            }
            let covariate_row = covariate_index.get(m.subject_id.as_str());
            for column in &schema.covariate_columns {
                let value = covariate_row
                    .and_then(|r| r.values.get(column).copied().flatten())
                    .filter(|v| v.is_finite());
                row.push(value);
            }
            raw_rows.push((m.subject_id.clone(), row));
        }

        let columns = schema.columns();
        let first_covariate = schema.metric_columns.len();
        let mut excluded = Vec::new();
        let mut imputed = Vec::new();

        match missing_policy {
            MissingPolicy::Drop => {
                raw_rows.retain(|(subject_id, row)| {
                    let missing: Vec<&str> = row
                        .iter()
                        .enumerate()
                        .filter(|(_, v)| v.is_none())
                        .map(|(j, _)| columns[j].as_str())
                        .collect();
                    if missing.is_empty() {
                        return true;
                    }
                    let reason = format!("missing covariates: {}", missing.join(", "));
                    warn!("excluding subject {}: {}", subject_id, reason);
                    excluded.push(ExcludedSubject {
                        subject_id: subject_id.clone(),
                        reason,
                    });
                    false
                });
                if raw_rows.is_empty() {
                    return Err(GlycoError::InvalidInput(
                        "every joined subject was excluded for missing covariates".to_string(),
                    ));
                }
            }
            MissingPolicy::ImputeMean => {
                for j in first_covariate..columns.len() {
                    let observed: Vec<f64> =
                        raw_rows.iter().filter_map(|(_, row)| row[j]).collect();
                    if observed.len() == raw_rows.len() {
                        continue;
                    }
                    if observed.is_empty() {
                        return Err(GlycoError::EmptyColumn {
                            column: columns[j].clone(),
                        });
                    }
                    let mean = observed.iter().sum::<f64>() / observed.len() as f64;
                    for (subject_id, row) in raw_rows.iter_mut() {
                        if row[j].is_none() {
                            row[j] = Some(mean);
                            imputed.push(ImputedCell {
                                subject_id: subject_id.clone(),
                                column: columns[j].clone(),
                                value: mean,
                            });
                        }
                    }
                    info!(
                        "imputed {} missing values of {} with mean {:.3}",
                        raw_rows.len() - observed.len(),
                        columns[j],
                        mean
                    );
                }
            }
        }

        let n = raw_rows.len();
        let p = columns.len();
        let mut values = Array2::<f64>::zeros((n, p));
        let mut subject_ids = Vec::with_capacity(n);
        let mut row_labels = Vec::with_capacity(n);
        for (i, (subject_id, row)) in raw_rows.into_iter().enumerate() {
            for (j, value) in row.into_iter().enumerate() {
                // Every cell is Some after the missing policy ran
                values[[i, j]] = value.unwrap_or(f64::NAN);
            }
            row_labels.push(labels[&subject_id].clone());
            subject_ids.push(subject_id);
        }

        let mut table = Self::new(columns, subject_ids, row_labels, values)?;
        table.excluded = excluded;
        table.imputed = imputed;
        Ok(table)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn subject_ids(&self) -> &[SubjectId] {
        &self.subject_ids
    }

    pub fn labels(&self) -> &[Label] {
        &self.labels
    }

    pub fn values(&self) -> ArrayView2<'_, f64> {
        self.values.view()
    }

    /// Subjects removed by the `Drop` missing policy
    pub fn excluded(&self) -> &[ExcludedSubject] {
        &self.excluded
    }

    /// Cells filled by the `ImputeMean` missing policy
    pub fn imputed(&self) -> &[ImputedCell] {
        &self.imputed
    }

    pub fn n_rows(&self) -> usize {
        self.values.nrows()
    }

    pub fn n_columns(&self) -> usize {
        self.values.ncols()
    }

    pub fn column(&self, name: &str) -> Option<ArrayView1<'_, f64>> {
        let j = self.columns.iter().position(|c| c == name)?;
        Some(self.values.column(j))
    }

    /// Sorted distinct labels
    pub fn label_vocabulary(&self) -> Vec<Label> {
        self.labels
            .iter()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Snapshot of the given rows, in the given order
    pub fn select(&self, rows: &[usize]) -> Result<Self, GlycoError> {
        if let Some(bad) = rows.iter().find(|&&i| i >= self.n_rows()) {
            return Err(GlycoError::InvalidInput(format!(
                "row {} out of range for a table of {} rows",
                bad,
                self.n_rows()
            )));
        }
        Ok(Self {
            columns: self.columns.clone(),
            subject_ids: rows.iter().map(|&i| self.subject_ids[i].clone()).collect(),
            labels: rows.iter().map(|&i| self.labels[i].clone()).collect(),
            values: self.values.select(Axis(0), rows),
            excluded: Vec::new(),
            imputed: Vec::new(),
        })
    }

    /// Copy of the table with replaced labels (same row order)
    pub fn with_labels(&self, labels: Vec<Label>) -> Result<Self, GlycoError> {
        if labels.len() != self.n_rows() {
            return Err(GlycoError::InvalidInput(format!(
                "{} labels for a table of {} rows",
                labels.len(),
                self.n_rows()
            )));
        }
        Ok(Self {
            labels,
            ..self.clone()
        })
    }

    /// Copy of the table with new numeric columns (same rows and labels)
    pub fn with_values(
        &self,
        columns: Vec<String>,
        values: Array2<f64>,
    ) -> Result<Self, GlycoError> {
        let mut table = Self::new(
            columns,
            self.subject_ids.clone(),
            self.labels.clone(),
            values,
        )?;
        table.excluded = self.excluded.clone();
        table.imputed = self.imputed.clone();
        Ok(table)
    }

    /// Standardize every numeric column with parameters fit on this table
    pub fn standardize(&self) -> Result<(Self, Standardizer), GlycoError> {
        let standardizer = Standardizer::fit(self)?;
        let table = standardizer.apply(self)?;
        Ok((table, standardizer))
    }

    /// Write the table as CSV: `subject_id,<columns...>,label`
    pub fn write_csv<W: Write>(&self, writer: W) -> Result<(), GlycoError> {
        let mut csv_writer = csv::Writer::from_writer(writer);

        let mut header = Vec::with_capacity(self.columns.len() + 2);
        header.push("subject_id".to_string());
        header.extend(self.columns.iter().cloned());
        header.push("label".to_string());
        csv_writer.write_record(&header)?;

        for (i, row) in self.values.outer_iter().enumerate() {
            let mut record = Vec::with_capacity(header.len());
            record.push(self.subject_ids[i].clone());
            record.extend(row.iter().map(|v| v.to_string()));
            record.push(self.labels[i].clone());
            csv_writer.write_record(&record)?;
        }

        csv_writer.flush()?;
        Ok(())
    }

    /// Read a table written by `write_csv`
    pub fn read_csv<R: Read>(reader: R) -> Result<Self, GlycoError> {
        let mut csv_reader = csv::Reader::from_reader(reader);
        let headers = csv_reader.headers()?.clone();
        let n_fields = headers.len();

        if n_fields < 3
            || &headers[0] != "subject_id"
            || &headers[n_fields - 1] != "label"
        {
            return Err(GlycoError::InvalidInput(
                "feature CSV must have subject_id first, label last and at least one column"
                    .to_string(),
            ));
        }
        let columns: Vec<String> = headers
            .iter()
            .skip(1)
            .take(n_fields - 2)
            .map(str::to_string)
            .collect();

        let mut subject_ids = Vec::new();
        let mut labels = Vec::new();
        let mut flat = Vec::new();
        for record in csv_reader.records() {
            let record = record?;
            let subject_id = record[0].to_string();
            for (j, column) in columns.iter().enumerate() {
                let field = &record[j + 1];
                let value: f64 = field.trim().parse().map_err(|_| {
                    GlycoError::InvalidInput(format!(
                        "subject {} column {}: {:?} is not a number",
                        subject_id, column, field
                    ))
                })?;
                flat.push(value);
            }
            labels.push(record[n_fields - 1].to_string());
            subject_ids.push(subject_id);
        }

        let values = Array2::from_shape_vec((subject_ids.len(), columns.len()), flat)
            .map_err(|e| GlycoError::InvalidInput(e.to_string()))?;
        Self::new(columns, subject_ids, labels, values)
    }
}

/// Column centering and scaling parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Standardizer {
    columns: Vec<String>,
    means: Array1<f64>,
    scales: Array1<f64>,
}

impl Standardizer {
    /// Fit column means and sample standard deviations
    pub fn fit(table: &FeatureTable) -> Result<Self, GlycoError> {
        if table.n_rows() == 0 {
            return Err(GlycoError::InvalidInput(
                "cannot standardize an empty table".to_string(),
            ));
        }
        let values = table.values();
        let means = values
            .mean_axis(Axis(0))
            .ok_or_else(|| GlycoError::InvalidInput("empty table".to_string()))?;

        let mut scales = if table.n_rows() > 1 {
            values.std_axis(Axis(0), 1.0)
        } else {
            Array1::ones(table.n_columns())
        };
        for (j, scale) in scales.iter_mut().enumerate() {
            if !(scale.is_finite() && *scale > MIN_SCALE) {
                warn!(
                    "column {} has no variance; centering without scaling",
                    table.columns[j]
                );
                *scale = 1.0;
            }
        }

        Ok(Self {
            columns: table.columns.clone(),
            means,
            scales,
        })
    }

    /// Apply the fitted parameters to a table with the same columns
    pub fn apply(&self, table: &FeatureTable) -> Result<FeatureTable, GlycoError> {
        if table.columns != self.columns {
            return Err(GlycoError::InvalidInput(
                "standardizer columns do not match the table".to_string(),
            ));
        }
        let standardized = (&table.values - &self.means) / &self.scales;
        table.with_values(table.columns.clone(), standardized)
    }

    pub fn means(&self) -> ArrayView1<'_, f64> {
        self.means.view()
    }

    pub fn scales(&self) -> ArrayView1<'_, f64> {
        self.scales.view()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use pretty_assertions::assert_eq;

    fn metrics_row(subject: &str, above: f64, median: f64) -> SubjectMetrics {
        let mut statistics = BTreeMap::new();
        statistics.insert("above_140".to_string(), above);
        statistics.insert("median".to_string(), median);
        SubjectMetrics {
            subject_id: subject.to_string(),
            statistics,
            reading_count: 10,
            synthesized: Vec::new(),
        }
    }

    fn schema() -> FeatureSchema {
        FeatureSchema::new(
            vec!["above_140".to_string(), "median".to_string()],
            vec!["age".to_string(), "bmi".to_string()],
        )
    }

    fn fixture() -> (Vec<SubjectMetrics>, Vec<CovariateRow>, BTreeMap<SubjectId, Label>) {
        let metrics = vec![
            metrics_row("S1", 10.0, 100.0),
            metrics_row("S2", 20.0, 110.0),
            metrics_row("S3", 30.0, 120.0),
            metrics_row("S4", 40.0, 130.0),
        ];
        let covariates = vec![
            CovariateRow::new("S1").with("age", Some(30.0)).with("bmi", Some(22.0)),
            CovariateRow::new("S2").with("age", Some(40.0)).with("bmi", Some(24.0)),
            CovariateRow::new("S3").with("age", Some(50.0)).with("bmi", Some(29.0)),
        ];
        let mut labels = BTreeMap::new();
        labels.insert("S1".to_string(), "non-diabetic".to_string());
        labels.insert("S2".to_string(), "non-diabetic".to_string());
        labels.insert("S3".to_string(), "potential-diabetic".to_string());
        labels.insert("S4".to_string(), "potential-diabetic".to_string());
        (metrics, covariates, labels)
    }

    #[test]
    fn test_impute_mean_fills_missing_row() {
        let (metrics, covariates, labels) = fixture();
        let table = FeatureTable::build(
            &metrics,
            &covariates,
            &labels,
            &schema(),
            MissingPolicy::ImputeMean,
        )
        .unwrap();

        assert_eq!(table.n_rows(), 4);
        assert_eq!(table.column("age").unwrap()[3], 40.0);
        assert_eq!(table.column("bmi").unwrap()[3], 25.0);
        assert_eq!(table.imputed().len(), 2);
        assert!(table.imputed().iter().all(|c| c.subject_id == "S4"));
        assert!(table.excluded().is_empty());
    }

    #[test]
    fn test_drop_removes_and_records_row() {
        let (metrics, covariates, labels) = fixture();
        let table =
            FeatureTable::build(&metrics, &covariates, &labels, &schema(), MissingPolicy::Drop)
                .unwrap();

        assert_eq!(table.subject_ids(), &["S1", "S2", "S3"]);
        assert_eq!(table.excluded().len(), 1);
        assert_eq!(table.excluded()[0].subject_id, "S4");
        assert!(table.imputed().is_empty());
    }

    #[test]
    fn test_inner_join_on_labels() {
        let (metrics, covariates, mut labels) = fixture();
        labels.remove("S2");
        labels.insert("S99".to_string(), "non-diabetic".to_string());

        let table = FeatureTable::build(
            &metrics,
            &covariates,
            &labels,
            &schema(),
            MissingPolicy::ImputeMean,
        )
        .unwrap();
        assert_eq!(table.subject_ids(), &["S1", "S3", "S4"]);
    }

    #[test]
    fn test_empty_join() {
        let (metrics, covariates, _) = fixture();
        let mut labels = BTreeMap::new();
        labels.insert("X1".to_string(), "non-diabetic".to_string());

        let result =
            FeatureTable::build(&metrics, &covariates, &labels, &schema(), MissingPolicy::Drop);
        assert!(matches!(result, Err(GlycoError::EmptyJoin { .. })));
    }

    #[test]
    fn test_missing_metric_column() {
        let (metrics, covariates, labels) = fixture();
        let schema = FeatureSchema::new(vec!["below_70".to_string()], vec![]);

        match FeatureTable::build(&metrics, &covariates, &labels, &schema, MissingPolicy::Drop) {
            Err(GlycoError::MissingColumn { subject_id, column }) => {
                assert_eq!(subject_id, "S1");
                assert_eq!(column, "below_70");
            }
            other => panic!("expected MissingColumn, got {:?}", other),
        }
    }

    #[test]
    fn test_unobserved_covariate_cannot_be_imputed() {
        let (metrics, covariates, labels) = fixture();
        let schema = FeatureSchema::new(vec!["median".to_string()], vec!["height".to_string()]);

        let result =
            FeatureTable::build(&metrics, &covariates, &labels, &schema, MissingPolicy::ImputeMean);
        assert!(matches!(result, Err(GlycoError::EmptyColumn { .. })));
    }

    #[test]
    fn test_standardize() {
        let table = FeatureTable::new(
            vec!["a".to_string(), "b".to_string()],
            vec!["S1".to_string(), "S2".to_string(), "S3".to_string()],
            vec!["x".to_string(), "y".to_string(), "x".to_string()],
            array![[1.0, 5.0], [2.0, 5.0], [3.0, 5.0]],
        )
        .unwrap();

        let (standardized, scaler) = table.standardize().unwrap();

        assert_eq!(standardized.column("a").unwrap().to_vec(), vec![-1.0, 0.0, 1.0]);
        // zero-variance column is centered only
        assert_eq!(standardized.column("b").unwrap().to_vec(), vec![0.0, 0.0, 0.0]);
        assert_eq!(scaler.means().to_vec(), vec![2.0, 5.0]);
        assert_eq!(standardized.labels(), table.labels());
    }

    #[test]
    fn test_standardizer_applies_training_parameters() {
        let train = FeatureTable::new(
            vec!["a".to_string()],
            vec!["S1".to_string(), "S2".to_string()],
            vec!["x".to_string(), "y".to_string()],
            array![[0.0], [2.0]],
        )
        .unwrap();
        let test = FeatureTable::new(
            vec!["a".to_string()],
            vec!["S3".to_string()],
            vec!["x".to_string()],
            array![[10.0]],
        )
        .unwrap();

        let scaler = Standardizer::fit(&train).unwrap();
        let applied = scaler.apply(&test).unwrap();

        // mean 1, sample sd sqrt(2)
        let expected = 9.0 / 2.0_f64.sqrt();
        assert!((applied.values()[[0, 0]] - expected).abs() < 1e-12);
    }

    #[test]
    fn test_select_and_vocabulary() {
        let (metrics, covariates, labels) = fixture();
        let table = FeatureTable::build(
            &metrics,
            &covariates,
            &labels,
            &schema(),
            MissingPolicy::ImputeMean,
        )
        .unwrap();

        let subset = table.select(&[3, 0]).unwrap();
        assert_eq!(subset.subject_ids(), &["S4", "S1"]);
        assert_eq!(subset.values()[[0, 0]], 40.0);
        assert_eq!(
            table.label_vocabulary(),
            vec!["non-diabetic".to_string(), "potential-diabetic".to_string()]
        );
        assert!(table.select(&[7]).is_err());
    }

    #[test]
    fn test_csv_round_trip() {
        let (metrics, covariates, labels) = fixture();
        let table =
            FeatureTable::build(&metrics, &covariates, &labels, &schema(), MissingPolicy::Drop)
                .unwrap();

        let mut buffer = Vec::new();
        table.write_csv(&mut buffer).unwrap();
        let text = String::from_utf8(buffer.clone()).unwrap();
        assert!(text.starts_with("subject_id,above_140,median,age,bmi,label\n"));

        let loaded = FeatureTable::read_csv(buffer.as_slice()).unwrap();
        assert_eq!(loaded.columns(), table.columns());
        assert_eq!(loaded.subject_ids(), table.subject_ids());
        assert_eq!(loaded.labels(), table.labels());
        assert_eq!(loaded.values(), table.values());
    }

    #[test]
    fn test_reserved_column_names() {
        let (metrics, covariates, labels) = fixture();
        let schema = FeatureSchema::new(vec!["median".to_string()], vec!["label".to_string()]);
        let result =
            FeatureTable::build(&metrics, &covariates, &labels, &schema, MissingPolicy::Drop);
        assert!(matches!(result, Err(GlycoError::InvalidInput(_))));
    }
}
