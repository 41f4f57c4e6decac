//! Association models
//!
//! A model is chosen once from [`ModelKind`] and then drives both the
//! preprocessing of each matrix and the statistic of every row pair of a
//! chunk pair. The scanning pipeline only sees the [`AssociationModel`]
//! trait.

use crate::core::error::{ConfigError, NumericError, NumericResult};
use crate::core::matrix::ChunkedMatrix;
use crate::core::residual::{CovariateSpace, PreparedChunk, PreparedMatrix};
use crate::core::stats::{anova_test, linear_test};
use ndarray::Array2;
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;

/// Statistical model selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelKind {
    /// Additive linear model, t-test on the slope
    #[default]
    Linear,
    /// Linear model with a known sample error covariance
    LinearErrorCovariance,
    /// Variant values as groups, F-test (ANOVA)
    Categorical,
}

impl ModelKind {
    pub fn name(&self) -> &'static str {
        match self {
            ModelKind::Linear => "linear",
            ModelKind::LinearErrorCovariance => "linear-error-covariance",
            ModelKind::Categorical => "categorical",
        }
    }

    /// Build the model strategy for this kind
    pub fn build(&self) -> Box<dyn AssociationModel> {
        match self {
            ModelKind::Linear | ModelKind::LinearErrorCovariance => Box::new(LinearModel),
            ModelKind::Categorical => Box::new(AnovaModel),
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ModelKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "linear" => Ok(ModelKind::Linear),
            "linear-error-covariance" => Ok(ModelKind::LinearErrorCovariance),
            "categorical" | "anova" => Ok(ModelKind::Categorical),
            other => Err(ConfigError::UnknownModel(other.to_string())),
        }
    }
}

/// Per-pair results of one chunk pair
///
/// Untestable pairs carry a `NaN` p-value.
#[derive(Debug, Clone)]
pub struct BlockStatistics {
    pub statistic: Array2<f64>,
    pub pvalue: Array2<f64>,
    pub effect_size: Array2<f64>,
}

impl BlockStatistics {
    fn untestable(rows: usize, cols: usize) -> Self {
        Self {
            statistic: Array2::from_elem((rows, cols), f64::NAN),
            pvalue: Array2::from_elem((rows, cols), f64::NAN),
            effect_size: Array2::from_elem((rows, cols), f64::NAN),
        }
    }

    pub fn dim(&self) -> (usize, usize) {
        self.pvalue.dim()
    }
}

/// Pluggable statistic computation
pub trait AssociationModel: Send + Sync {
    /// Residual degrees of freedom of the model before variant terms
    fn residual_df(&self, space: &CovariateSpace) -> NumericResult<usize> {
        let used = space.n_covariates() + 2;
        if space.n_samples() <= used {
            return Err(NumericError::InsufficientSamples {
                samples: space.n_samples(),
                covariates: space.n_covariates(),
            });
        }
        Ok(space.n_samples() - used)
    }

    fn prepare_variants(&self, variants: &ChunkedMatrix, space: &CovariateSpace) -> PreparedMatrix {
        PreparedMatrix::build(variants, |c| space.prepare_chunk(c))
    }

    fn prepare_traits(&self, traits: &ChunkedMatrix, space: &CovariateSpace) -> PreparedMatrix {
        PreparedMatrix::build(traits, |c| space.prepare_chunk(c))
    }

    /// Statistics for every (variant row, trait row) pair of two chunks
    fn test_block(
        &self,
        variants: &PreparedChunk,
        traits: &PreparedChunk,
        space: &CovariateSpace,
    ) -> BlockStatistics;
}

/// Linear regression of trait on variant given covariates
///
/// Also serves the error-covariance model, whose whitening happens in the
/// covariate space.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinearModel;

impl AssociationModel for LinearModel {
    fn test_block(
        &self,
        variants: &PreparedChunk,
        traits: &PreparedChunk,
        space: &CovariateSpace,
    ) -> BlockStatistics {
        let (rows, cols) = (variants.n_rows(), traits.n_rows());
        let mut block = BlockStatistics::untestable(rows, cols);
        let df = match self.residual_df(space) {
            Ok(df) => df as f64,
            Err(_) => return block,
        };

        let correlations = variants.data.dot(&traits.data.t());

        for i in 0..rows {
            if !variants.testable[i] {
                continue;
            }
            for j in 0..cols {
                if !traits.testable[j] {
                    continue;
                }
                let stat = linear_test(correlations[[i, j]], df, variants.norms[i], traits.norms[j]);
                block.statistic[[i, j]] = stat.statistic;
                block.pvalue[[i, j]] = stat.pvalue;
                block.effect_size[[i, j]] = stat.effect_size;
            }
        }
        block
    }
}

/// One-way ANOVA of trait on variant groups given covariates
#[derive(Debug, Clone, Copy, Default)]
pub struct AnovaModel;

impl AssociationModel for AnovaModel {
    fn prepare_variants(&self, variants: &ChunkedMatrix, space: &CovariateSpace) -> PreparedMatrix {
        PreparedMatrix::build(variants, |c| space.decompose_groups_chunk(c))
    }

    fn test_block(
        &self,
        variants: &PreparedChunk,
        traits: &PreparedChunk,
        space: &CovariateSpace,
    ) -> BlockStatistics {
        let (rows, cols) = (variants.n_rows(), traits.n_rows());
        let mut block = BlockStatistics::untestable(rows, cols);
        let Some(groups) = &variants.groups else {
            return block;
        };

        // Explained fraction: sum of squared projections on the group basis
        let mut explained = Array2::<f64>::zeros((rows, cols));
        for slot in &groups.slots {
            let projection = slot.dot(&traits.data.t());
            explained += &projection.mapv(|x| x * x);
        }

        let base = space.n_samples() as f64 - 1.0 - space.n_covariates() as f64;
        for i in 0..rows {
            if !variants.testable[i] {
                continue;
            }
            let df1 = groups.df[i] as f64;
            let df2 = base - df1;
            if df2 <= 0.0 {
                continue;
            }
            for j in 0..cols {
                if !traits.testable[j] {
                    continue;
                }
                let stat = anova_test(explained[[i, j]], df1, df2);
                block.statistic[[i, j]] = stat.statistic;
                block.pvalue[[i, j]] = stat.pvalue;
                block.effect_size[[i, j]] = stat.effect_size;
            }
        }
        block
    }
}
