//! Covariate residualization
//!
//! Every feature row is projected once onto the orthogonal complement of
//! the covariate subspace (intercept included) and scaled to unit norm.
//! After that the correlation between two prepared rows is a plain inner
//! product, and equals their partial correlation given the covariates.
//!
//! The categorical model replaces the variant-side residual by an
//! orthonormal basis of residualized group indicators.

use crate::core::error::{NumericError, NumericResult};
use crate::core::matrix::{ChunkedMatrix, MatrixChunk};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rayon::prelude::*;

/// Relative norm below which a vector counts as lying in the covariate span
pub const RANK_TOLERANCE: f64 = 1e-8;

/// Lower-triangular Cholesky factor of a sample error covariance
///
/// Rows are whitened by solving `L y = x`.
#[derive(Debug, Clone)]
pub struct Whitening {
    factor: Array2<f64>,
}

impl Whitening {
    /// Factor an `n x n` symmetric positive definite covariance
    pub fn from_covariance(sigma: ArrayView2<'_, f64>) -> NumericResult<Self> {
        let n = sigma.nrows();
        let mut l = Array2::<f64>::zeros((n, n));

        for j in 0..n {
            let mut diag = sigma[[j, j]];
            for k in 0..j {
                diag -= l[[j, k]] * l[[j, k]];
            }
            if !diag.is_finite() || diag <= 0.0 {
                return Err(NumericError::NotPositiveDefinite(j));
            }
            let ljj = diag.sqrt();
            l[[j, j]] = ljj;

            for i in (j + 1)..n {
                let mut sum = 0.5 * (sigma[[i, j]] + sigma[[j, i]]);
                for k in 0..j {
                    sum -= l[[i, k]] * l[[j, k]];
                }
                l[[i, j]] = sum / ljj;
            }
        }

        Ok(Self { factor: l })
    }

    /// Number of samples the factor applies to
    pub fn dim(&self) -> usize {
        self.factor.nrows()
    }

    /// Whiten one row in place (forward substitution)
    pub fn apply(&self, row: &mut [f64]) {
        let n = row.len().min(self.dim());
        for i in 0..n {
            let mut sum = row[i];
            for k in 0..i {
                sum -= self.factor[[i, k]] * row[k];
            }
            row[i] = sum / self.factor[[i, i]];
        }
    }
}

/// Orthonormal basis of {intercept, covariates}, built once per run
#[derive(Debug, Clone)]
pub struct CovariateSpace {
    basis: Array2<f64>,
    whitening: Option<Whitening>,
    n_covariates: usize,
    n_samples: usize,
}

impl CovariateSpace {
    /// Build the basis by modified Gram-Schmidt
    ///
    /// Fails with [`NumericError::RankDeficient`] when a covariate is
    /// constant, duplicated or a linear combination of earlier ones.
    pub fn new(covariates: &ChunkedMatrix, whitening: Option<Whitening>) -> NumericResult<Self> {
        let n = covariates.n_samples();
        let mut vectors: Vec<(String, Vec<f64>)> = Vec::with_capacity(covariates.n_features() + 1);
        vectors.push(("intercept".to_string(), vec![1.0; n]));
        for chunk in covariates.chunks() {
            for (id, row) in chunk.ids.iter().zip(chunk.data.rows()) {
                let mut values = row.to_vec();
                if !impute_row_mean(&mut values) {
                    return Err(NumericError::RankDeficient { covariate: id.clone() });
                }
                vectors.push((id.clone(), values));
            }
        }

        let mut basis: Vec<Vec<f64>> = Vec::with_capacity(vectors.len());
        for (name, mut v) in vectors {
            if let Some(w) = &whitening {
                w.apply(&mut v);
            }
            let original = norm(&v);
            orthogonalize(&mut v, &basis);
            let residual = norm(&v);
            if original == 0.0 || residual <= RANK_TOLERANCE * original {
                return Err(NumericError::RankDeficient { covariate: name });
            }
            v.iter_mut().for_each(|x| *x /= residual);
            basis.push(v);
        }

        let mut matrix = Array2::<f64>::zeros((basis.len(), n));
        for (mut dst, src) in matrix.rows_mut().into_iter().zip(&basis) {
            dst.assign(&ArrayView1::from(&src[..]));
        }

        Ok(Self {
            basis: matrix,
            whitening,
            n_covariates: covariates.n_features(),
            n_samples: n,
        })
    }

    /// Covariates excluding the intercept
    pub fn n_covariates(&self) -> usize {
        self.n_covariates
    }

    pub fn n_samples(&self) -> usize {
        self.n_samples
    }

    /// Orthonormal basis rows (intercept first)
    pub fn basis(&self) -> ArrayView2<'_, f64> {
        self.basis.view()
    }

    /// Residualize one row; missing cells are imputed with the row mean
    ///
    /// Returns the residual and its norm, or `None` when no cell is observed.
    pub fn residualize(&self, row: ArrayView1<'_, f64>) -> Option<(Array1<f64>, f64)> {
        let mut values = row.to_vec();
        if !impute_row_mean(&mut values) {
            return None;
        }
        if let Some(w) = &self.whitening {
            w.apply(&mut values);
        }
        let mut residual = Array1::from(values);
        let projection = self.basis.dot(&residual);
        residual -= &self.basis.t().dot(&projection);
        let n = residual.dot(&residual).sqrt();
        Some((residual, n))
    }

    /// Residualize and row-normalize one chunk
    pub fn prepare_chunk(&self, chunk: MatrixChunk<'_>) -> PreparedChunk {
        let rows = chunk.n_rows();
        let n = self.n_samples;
        let mut data = Array2::<f64>::zeros((rows, n));
        let mut testable = vec![false; rows];
        let mut norms = vec![0.0; rows];

        for (i, row) in chunk.data.rows().into_iter().enumerate() {
            let mut values = row.to_vec();
            if !impute_row_mean(&mut values) {
                continue;
            }
            if let Some(w) = &self.whitening {
                w.apply(&mut values);
            }
            data.row_mut(i).assign(&ArrayView1::from(&values[..]));
        }

        // Batch projection: R = X - (X B^T) B
        let raw_norms: Vec<f64> = data.rows().into_iter().map(|r| r.dot(&r).sqrt()).collect();
        let projection = data.dot(&self.basis.t());
        data -= &projection.dot(&self.basis);

        for (i, mut row) in data.axis_iter_mut(Axis(0)).enumerate() {
            let residual = row.dot(&row).sqrt();
            if raw_norms[i] > 0.0 && residual > RANK_TOLERANCE * raw_norms[i] {
                row.mapv_inplace(|x| x / residual);
                norms[i] = residual;
                testable[i] = true;
            } else {
                row.fill(0.0);
            }
        }

        PreparedChunk {
            index: chunk.index,
            row_offset: chunk.row_offset,
            data,
            norms,
            testable,
            groups: None,
        }
    }

    /// Decompose one chunk of categorical variants into group bases
    ///
    /// Each row's distinct values are groups; the indicators of every
    /// non-baseline group are residualized and orthonormalized. Missing
    /// cells take the most frequent group.
    pub fn decompose_groups_chunk(&self, chunk: MatrixChunk<'_>) -> PreparedChunk {
        let rows = chunk.n_rows();
        let n = self.n_samples;
        let mut bases: Vec<Vec<Vec<f64>>> = Vec::with_capacity(rows);

        for row in chunk.data.rows() {
            let mut values = row.to_vec();
            if !impute_row_mode(&mut values) {
                bases.push(Vec::new());
                continue;
            }

            let mut levels = values.clone();
            levels.sort_by(|a, b| a.total_cmp(b));
            levels.dedup();

            let mut kept: Vec<Vec<f64>> = Vec::new();
            for level in levels.iter().skip(1) {
                let mut indicator: Vec<f64> =
                    values.iter().map(|&x| if x == *level { 1.0 } else { 0.0 }).collect();
                let original = norm(&indicator);
                orthogonalize_rows(&mut indicator, self.basis.view());
                orthogonalize(&mut indicator, &kept);
                let residual = norm(&indicator);
                if residual > RANK_TOLERANCE * original {
                    indicator.iter_mut().for_each(|x| *x /= residual);
                    kept.push(indicator);
                }
            }
            bases.push(kept);
        }

        let width = bases.iter().map(|b| b.len()).max().unwrap_or(0);
        let mut slots = vec![Array2::<f64>::zeros((rows, n)); width];
        let mut df = vec![0usize; rows];
        for (i, kept) in bases.iter().enumerate() {
            df[i] = kept.len();
            for (slot, vector) in slots.iter_mut().zip(kept) {
                slot.row_mut(i).assign(&ArrayView1::from(&vector[..]));
            }
        }

        PreparedChunk {
            index: chunk.index,
            row_offset: chunk.row_offset,
            data: Array2::zeros((rows, 0)),
            norms: vec![0.0; rows],
            testable: df.iter().map(|&d| d > 0).collect(),
            groups: Some(GroupBasis { slots, df }),
        }
    }
}

/// Orthonormal group-indicator vectors of categorical variants
///
/// `slots[j]` row `i` is the `j`-th basis vector of variant `i`, zero when
/// `j >= df[i]`.
#[derive(Debug, Clone)]
pub struct GroupBasis {
    pub slots: Vec<Array2<f64>>,
    pub df: Vec<usize>,
}

/// A residualized chunk ready for block products
#[derive(Debug, Clone)]
pub struct PreparedChunk {
    pub index: usize,
    pub row_offset: usize,
    /// Unit-norm residual rows; untestable rows are zero
    pub data: Array2<f64>,
    /// Residual norms before normalization
    pub norms: Vec<f64>,
    pub testable: Vec<bool>,
    pub groups: Option<GroupBasis>,
}

impl PreparedChunk {
    pub fn n_rows(&self) -> usize {
        self.testable.len()
    }

    pub fn untestable(&self) -> usize {
        self.testable.iter().filter(|t| !**t).count()
    }
}

/// All chunks of one matrix after preprocessing
#[derive(Debug, Clone)]
pub struct PreparedMatrix {
    pub chunks: Vec<PreparedChunk>,
    pub n_features: usize,
}

impl PreparedMatrix {
    /// Prepare every chunk of `matrix` in parallel
    pub fn build<F>(matrix: &ChunkedMatrix, prepare: F) -> Self
    where
        F: Fn(MatrixChunk<'_>) -> PreparedChunk + Sync,
    {
        let chunks = (0..matrix.n_chunks())
            .into_par_iter()
            .filter_map(|i| matrix.chunk(i))
            .map(|c| prepare(c))
            .collect();
        Self {
            chunks,
            n_features: matrix.n_features(),
        }
    }

    /// Rows that cannot be tested
    pub fn untestable(&self) -> usize {
        self.chunks.iter().map(|c| c.untestable()).sum()
    }
}

fn norm(v: &[f64]) -> f64 {
    v.iter().map(|x| x * x).sum::<f64>().sqrt()
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Two passes of modified Gram-Schmidt against orthonormal `basis`
fn orthogonalize(v: &mut [f64], basis: &[Vec<f64>]) {
    for _ in 0..2 {
        for b in basis {
            let c = dot(v, b);
            v.iter_mut().zip(b).for_each(|(x, y)| *x -= c * y);
        }
    }
}

fn orthogonalize_rows(v: &mut [f64], basis: ArrayView2<'_, f64>) {
    for _ in 0..2 {
        for b in basis.rows() {
            let c: f64 = v.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
            v.iter_mut().zip(b.iter()).for_each(|(x, y)| *x -= c * y);
        }
    }
}

/// Replace `NaN` cells with the mean of the observed cells
///
/// Returns `false` when no cell is observed.
fn impute_row_mean(values: &mut [f64]) -> bool {
    let (sum, count) = values
        .iter()
        .filter(|v| !v.is_nan())
        .fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    if count == 0 {
        return false;
    }
    if count < values.len() {
        let mean = sum / count as f64;
        values.iter_mut().filter(|v| v.is_nan()).for_each(|v| *v = mean);
    }
    true
}

/// Replace `NaN` cells with the most frequent observed value (smallest on ties)
fn impute_row_mode(values: &mut [f64]) -> bool {
    let mut observed: Vec<f64> = values.iter().copied().filter(|v| !v.is_nan()).collect();
    if observed.is_empty() {
        return false;
    }
    if observed.len() == values.len() {
        return true;
    }
    observed.sort_by(|a, b| a.total_cmp(b));

    let mut mode = observed[0];
    let mut best = 0;
    let mut start = 0;
    while start < observed.len() {
        let end = observed[start..].iter().position(|&x| x != observed[start]).map_or(observed.len(), |p| start + p);
        if end - start > best {
            best = end - start;
            mode = observed[start];
        }
        start = end;
    }
    values.iter_mut().filter(|v| v.is_nan()).for_each(|v| *v = mode);
    true
}
