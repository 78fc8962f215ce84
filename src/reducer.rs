//! Dimensionality reduction
//!
//! Two deterministic linear reductions over the numeric columns of a feature
//! table:
//! - Principal components (unsupervised, maximal variance, uncorrelated scores)
//! - Fisher linear discriminants (label-aware)
//!
//! Models are fit on one table and applied to others, so held-out rows are
//! projected with training loadings only.

use crate::error::GlycoError;
use crate::features::FeatureTable;
use log::{debug, warn};
use nalgebra::{DMatrix, SymmetricEigen};
use ndarray::{Array1, Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Relative ridge added to the within-class scatter before inversion
const DISCRIMINANT_RIDGE: f64 = 1e-6;

/// A reduced table: same subjects and labels, component columns
pub type ReducedComponents = FeatureTable;

/// Reduction algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReductionMethod {
    /// Principal component analysis
    #[default]
    Pca,
    /// Fisher linear discriminant analysis
    Discriminant,
}

impl ReductionMethod {
    fn component_prefix(&self) -> &'static str {
        match self {
            ReductionMethod::Pca => "PC",
            ReductionMethod::Discriminant => "LD",
        }
    }
}

/// Requested component count reduced to the feasible rank
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentClamp {
    pub requested: usize,
    pub feasible: usize,
}

/// Fitted reduction model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReducerModel {
    method: ReductionMethod,
    input_columns: Vec<String>,
    means: Array1<f64>,
    /// One column per component (n_features x k)
    loadings: Array2<f64>,
    explained_variance: Vec<f64>,
    explained_variance_ratio: Vec<f64>,
    clamp: Option<ComponentClamp>,
}

impl ReducerModel {
    pub fn method(&self) -> ReductionMethod {
        self.method
    }

    pub fn components(&self) -> usize {
        self.loadings.ncols()
    }

    pub fn component_names(&self) -> Vec<String> {
        let prefix = self.method.component_prefix();
        (1..=self.components())
            .map(|i| format!("{}{}", prefix, i))
            .collect()
    }

    pub fn loadings(&self) -> ArrayView2<'_, f64> {
        self.loadings.view()
    }

    /// Variance of each component's scores over the fitting sample
    /// (discriminant ratio for the discriminant method)
    pub fn explained_variance(&self) -> &[f64] {
        &self.explained_variance
    }

    /// Each component's share of the total
    pub fn explained_variance_ratio(&self) -> &[f64] {
        &self.explained_variance_ratio
    }

    /// Set when fewer components than requested were feasible
    pub fn clamp(&self) -> Option<ComponentClamp> {
        self.clamp
    }

    /// Project a table onto the fitted components
    pub fn transform(&self, table: &FeatureTable) -> Result<ReducedComponents, GlycoError> {
        if table.columns() != self.input_columns.as_slice() {
            return Err(GlycoError::InvalidInput(
                "table columns do not match the columns the reducer was fit on".to_string(),
            ));
        }
        let centered = &table.values() - &self.means;
        let scores = centered.dot(&self.loadings);
        table.with_values(self.component_names(), scores)
    }

    /// Map principal component scores back to the input columns
    pub fn inverse_transform(
        &self,
        components: &ReducedComponents,
    ) -> Result<FeatureTable, GlycoError> {
        if self.method != ReductionMethod::Pca {
            return Err(GlycoError::InvalidInput(
                "inverse transform is only defined for principal components".to_string(),
            ));
        }
        if components.columns() != self.component_names().as_slice() {
            return Err(GlycoError::InvalidInput(
                "component columns do not match the model".to_string(),
            ));
        }
        let reconstructed = components.values().dot(&self.loadings.t()) + &self.means;
        components.with_values(self.input_columns.clone(), reconstructed)
    }
}

/// Entry points for fitting reduction models
pub struct DimensionalityReducer;

impl DimensionalityReducer {
    /// Fit `k` principal components
    pub fn fit(table: &FeatureTable, k: usize) -> Result<ReducerModel, GlycoError> {
        Self::fit_with(ReductionMethod::Pca, table, k)
    }

    /// Fit `k` linear discriminants
    pub fn fit_discriminant(table: &FeatureTable, k: usize) -> Result<ReducerModel, GlycoError> {
        Self::fit_with(ReductionMethod::Discriminant, table, k)
    }

    pub fn fit_with(
        method: ReductionMethod,
        table: &FeatureTable,
        k: usize,
    ) -> Result<ReducerModel, GlycoError> {
        let n = table.n_rows();
        let p = table.n_columns();
        if k == 0 {
            return Err(GlycoError::InvalidInput(
                "at least one component must be requested".to_string(),
            ));
        }
        if n < 2 {
            return Err(GlycoError::InvalidInput(format!(
                "reduction needs at least 2 rows, got {}",
                n
            )));
        }

        match method {
            ReductionMethod::Pca => fit_pca(table, clamp_components(k, p.min(n - 1))),
            ReductionMethod::Discriminant => {
                let classes = table.label_vocabulary().len();
                if classes < 2 {
                    return Err(GlycoError::InvalidInput(
                        "discriminant reduction needs at least 2 label classes".to_string(),
                    ));
                }
                fit_discriminant(table, clamp_components(k, p.min(n - 1).min(classes - 1)))
            }
        }
    }

    /// Project a table with a fitted model
    pub fn transform(
        model: &ReducerModel,
        table: &FeatureTable,
    ) -> Result<ReducedComponents, GlycoError> {
        model.transform(table)
    }
}

fn clamp_components(requested: usize, feasible: usize) -> (usize, Option<ComponentClamp>) {
    if requested > feasible {
        let note = GlycoError::DegenerateReduction {
            requested,
            feasible,
        };
        warn!("{}; clamping to {}", note, feasible);
        (
            feasible,
            Some(ComponentClamp {
                requested,
                feasible,
            }),
        )
    } else {
        (requested, None)
    }
}

fn fit_pca(
    table: &FeatureTable,
    (k, clamp): (usize, Option<ComponentClamp>),
) -> Result<ReducerModel, GlycoError> {
    let values = table.values();
    let n = values.nrows();
    let means = column_means(values)?;
    let centered = &values - &means;
    let covariance = centered.t().dot(&centered) / (n as f64 - 1.0);

    let (eigenvalues, eigenvectors) = sorted_symmetric_eigen(&covariance);
    let total: f64 = eigenvalues.iter().map(|v| v.max(0.0)).sum();

    let loadings = leading_columns(&eigenvectors, k);
    let explained_variance: Vec<f64> = eigenvalues.iter().take(k).map(|v| v.max(0.0)).collect();
    let explained_variance_ratio = ratios(&explained_variance, total);

    debug!(
        "fit {} principal components over {} rows, variance ratio {:?}",
        k, n, explained_variance_ratio
    );

    Ok(ReducerModel {
        method: ReductionMethod::Pca,
        input_columns: table.columns().to_vec(),
        means,
        loadings,
        explained_variance,
        explained_variance_ratio,
        clamp,
    })
}

fn fit_discriminant(
    table: &FeatureTable,
    (k, clamp): (usize, Option<ComponentClamp>),
) -> Result<ReducerModel, GlycoError> {
    let values = table.values();
    let p = values.ncols();
    let means = column_means(values)?;

    let mut rows_by_class: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (i, label) in table.labels().iter().enumerate() {
        rows_by_class.entry(label.as_str()).or_default().push(i);
    }

    let mut within = Array2::<f64>::zeros((p, p));
    let mut between = Array2::<f64>::zeros((p, p));
    for rows in rows_by_class.values() {
        let class_values = values.select(Axis(0), rows);
        let class_mean = column_means(class_values.view())?;
        let centered = &class_values - &class_mean;
        within = within + centered.t().dot(&centered);

        let offset = (&class_mean - &means).insert_axis(Axis(1));
        between = between + offset.dot(&offset.t()) * rows.len() as f64;
    }

    let trace = within.diag().sum();
    let ridge = DISCRIMINANT_RIDGE * (trace / p as f64).max(1.0);
    for j in 0..p {
        within[[j, j]] += ridge;
    }

    let sw = to_dmatrix(&within);
    let sb = to_dmatrix(&between);
    let cholesky = sw.cholesky().ok_or_else(|| {
        GlycoError::InvalidInput("within-class scatter is not positive definite".to_string())
    })?;
    let l = cholesky.l();

    // A = L^-1 Sb L^-T is symmetric with the same eigenvalues as Sw^-1 Sb
    let l_inv_sb = l
        .solve_lower_triangular(&sb)
        .ok_or_else(|| GlycoError::InvalidInput("singular within-class scatter".to_string()))?;
    let a = l
        .solve_lower_triangular(&l_inv_sb.transpose())
        .ok_or_else(|| GlycoError::InvalidInput("singular within-class scatter".to_string()))?;
    let a = (&a + a.transpose()) * 0.5;

    let (eigenvalues, eigenvectors) = sorted_symmetric_eigen(&from_dmatrix(&a));
    let v = to_dmatrix(&leading_columns(&eigenvectors, k));
    let directions = l
        .transpose()
        .solve_upper_triangular(&v)
        .ok_or_else(|| GlycoError::InvalidInput("singular within-class scatter".to_string()))?;

    let mut loadings = from_dmatrix(&directions);
    fix_signs(&mut loadings);

    let total: f64 = eigenvalues.iter().map(|v| v.max(0.0)).sum();
    let explained_variance: Vec<f64> = eigenvalues.iter().take(k).map(|v| v.max(0.0)).collect();
    let explained_variance_ratio = ratios(&explained_variance, total);

    debug!(
        "fit {} discriminants over {} classes, ratio {:?}",
        k,
        rows_by_class.len(),
        explained_variance_ratio
    );

    Ok(ReducerModel {
        method: ReductionMethod::Discriminant,
        input_columns: table.columns().to_vec(),
        means,
        loadings,
        explained_variance,
        explained_variance_ratio,
        clamp,
    })
}

fn column_means(values: ArrayView2<'_, f64>) -> Result<Array1<f64>, GlycoError> {
    values
        .mean_axis(Axis(0))
        .ok_or_else(|| GlycoError::InvalidInput("cannot average an empty matrix".to_string()))
}

/// Eigen-decomposition of a symmetric matrix, eigenvalues descending.
///
/// Eigenvector signs are fixed so the largest-magnitude entry of each vector
/// is positive.
fn sorted_symmetric_eigen(matrix: &Array2<f64>) -> (Vec<f64>, Array2<f64>) {
    let eigen = SymmetricEigen::new(to_dmatrix(matrix));
    let p = matrix.nrows();

    let mut order: Vec<usize> = (0..p).collect();
    order.sort_by(|&a, &b| {
        eigen.eigenvalues[b]
            .total_cmp(&eigen.eigenvalues[a])
            .then(a.cmp(&b))
    });

    let eigenvalues = order.iter().map(|&i| eigen.eigenvalues[i]).collect();
    let mut vectors = Array2::<f64>::zeros((p, p));
    for (target, &source) in order.iter().enumerate() {
        for row in 0..p {
            vectors[[row, target]] = eigen.eigenvectors[(row, source)];
        }
    }
    fix_signs(&mut vectors);
    (eigenvalues, vectors)
}

fn fix_signs(vectors: &mut Array2<f64>) {
    for mut column in vectors.columns_mut() {
        let mut pivot = 0.0_f64;
        for value in column.iter() {
            if value.abs() > pivot.abs() {
                pivot = *value;
            }
        }
        if pivot < 0.0 {
            column.mapv_inplace(|v| -v);
        }
    }
}

fn leading_columns(vectors: &Array2<f64>, k: usize) -> Array2<f64> {
    vectors.slice(ndarray::s![.., ..k]).to_owned()
}

fn ratios(values: &[f64], total: f64) -> Vec<f64> {
    values
        .iter()
        .map(|v| if total > 0.0 { v / total } else { 0.0 })
        .collect()
}

fn to_dmatrix(matrix: &Array2<f64>) -> DMatrix<f64> {
    DMatrix::from_fn(matrix.nrows(), matrix.ncols(), |i, j| matrix[[i, j]])
}

fn from_dmatrix(matrix: &DMatrix<f64>) -> Array2<f64> {
    Array2::from_shape_fn((matrix.nrows(), matrix.ncols()), |(i, j)| matrix[(i, j)])
}
