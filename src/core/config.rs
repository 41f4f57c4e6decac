//! Run configuration
//!
//! Options are plain serde structs so that a run can be described by a
//! TOML file (`camelCase` keys) and then overridden from the command line.
//!
//! ```toml
//! model = "linear"
//! pvalueThreshold = 1e-5
//! pvalueThresholdLocal = 1e-3
//! distanceRadius = 1000000
//! exactFDR = true
//!
//! [input]
//! delimiter = ","
//! missingToken = "NaN"
//! ```

use crate::core::error::{ConfigError, ConfigResult};
use crate::core::fdr::DEFAULT_HISTOGRAM_BINS;
use crate::core::matrix::DEFAULT_CHUNK_SIZE;
use crate::core::model::ModelKind;
use crate::core::output::Category;
use serde::Deserialize;
use std::path::Path;

/// Default p-value threshold for every category
pub const DEFAULT_PVALUE_THRESHOLD: f64 = 1e-5;

/// Default local window radius in base pairs
pub const DEFAULT_DISTANCE_RADIUS: i64 = 1_000_000;

/// Options of one association scan
///
/// Thresholds gate the raw p-value of each tested pair; q-values are only
/// computed afterwards for the pairs that passed.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct RunConfig {
    pub model: ModelKind,
    /// Threshold of the `all` category, and fallback for the others
    pub pvalue_threshold: f64,
    pub pvalue_threshold_local: Option<f64>,
    pub pvalue_threshold_distant: Option<f64>,
    /// Extension of trait intervals on both sides, in base pairs
    pub distance_radius: i64,
    /// Feature rows per chunk
    pub chunk_size: usize,
    /// Exact Benjamini-Hochberg (true) or histogram estimate (false)
    #[serde(rename = "exactFDR", alias = "exactFdr")]
    pub exact_fdr: bool,
    /// Report the tested p-value histogram of every category
    pub histogram_enabled: bool,
    pub histogram_bins: usize,
    pub verbose: bool,
    /// Worker threads, 0 for all cores
    pub threads: usize,
    /// Track the smallest p-value of every variant and trait
    pub min_pvalue_by_feature: bool,
    /// Text layout of input matrices
    pub input: MatrixFileOptions,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            model: ModelKind::default(),
            pvalue_threshold: DEFAULT_PVALUE_THRESHOLD,
            pvalue_threshold_local: None,
            pvalue_threshold_distant: None,
            distance_radius: DEFAULT_DISTANCE_RADIUS,
            chunk_size: DEFAULT_CHUNK_SIZE,
            exact_fdr: true,
            histogram_enabled: false,
            histogram_bins: DEFAULT_HISTOGRAM_BINS,
            verbose: false,
            threads: 0,
            min_pvalue_by_feature: false,
            input: MatrixFileOptions::default(),
        }
    }
}

impl RunConfig {
    /// Parse a TOML configuration
    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        toml::from_str(content).map_err(|e| ConfigError::File(e.to_string()))
    }

    /// Read and parse a TOML configuration file
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::File(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }

    /// Reject values outside their documented ranges
    pub fn validate(&self) -> ConfigResult<()> {
        check_threshold("pvalueThreshold", self.pvalue_threshold)?;
        if let Some(t) = self.pvalue_threshold_local {
            check_threshold("pvalueThresholdLocal", t)?;
        }
        if let Some(t) = self.pvalue_threshold_distant {
            check_threshold("pvalueThresholdDistant", t)?;
        }
        if self.distance_radius < 0 {
            return Err(ConfigError::NegativeRadius(self.distance_radius));
        }
        if self.chunk_size == 0 {
            return Err(ConfigError::ChunkSize);
        }
        if self.histogram_bins == 0 {
            return Err(ConfigError::HistogramBins);
        }
        self.input.delimiter_byte()?;
        Ok(())
    }

    /// Threshold applied to pairs of `category`
    pub fn threshold(&self, category: Category) -> f64 {
        match category {
            Category::All => self.pvalue_threshold,
            Category::Local => self.pvalue_threshold_local.unwrap_or(self.pvalue_threshold),
            Category::Distant => self.pvalue_threshold_distant.unwrap_or(self.pvalue_threshold),
        }
    }

    /// Validated radius as an unsigned distance
    pub fn radius(&self) -> u64 {
        self.distance_radius.max(0) as u64
    }
}

fn check_threshold(name: &'static str, value: f64) -> ConfigResult<()> {
    if value > 0.0 && value <= 1.0 {
        Ok(())
    } else {
        Err(ConfigError::Threshold { name, value })
    }
}

/// Layout of a delimited text matrix
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct MatrixFileOptions {
    pub delimiter: char,
    /// Leading lines to skip; the first is the sample header
    pub skip_rows: usize,
    /// Leading columns to skip; the first is the feature id
    pub skip_columns: usize,
    /// Cell text meaning "missing"; empty cells are always missing
    pub missing_token: String,
}

impl Default for MatrixFileOptions {
    fn default() -> Self {
        Self {
            delimiter: '\t',
            skip_rows: 1,
            skip_columns: 1,
            missing_token: "NA".to_string(),
        }
    }
}

impl MatrixFileOptions {
    /// Delimiter as a single byte
    pub fn delimiter_byte(&self) -> ConfigResult<u8> {
        if self.delimiter.is_ascii() {
            Ok(self.delimiter as u8)
        } else {
            Err(ConfigError::Delimiter(self.delimiter))
        }
    }

    pub fn comma_separated() -> Self {
        Self {
            delimiter: ',',
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = RunConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.exact_fdr);
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.input.delimiter_byte().unwrap(), b'\t');
    }

    #[test]
    fn test_threshold_fallback() {
        let config = RunConfig {
            pvalue_threshold: 0.01,
            pvalue_threshold_local: Some(0.05),
            ..RunConfig::default()
        };
        assert_eq!(config.threshold(Category::All), 0.01);
        assert_eq!(config.threshold(Category::Local), 0.05);
        assert_eq!(config.threshold(Category::Distant), 0.01);
    }

    #[test]
    fn test_validate_rejects() {
        let bad = [
            RunConfig {
                pvalue_threshold: 0.0,
                ..RunConfig::default()
            },
            RunConfig {
                pvalue_threshold: 1.5,
                ..RunConfig::default()
            },
            RunConfig {
                pvalue_threshold_distant: Some(f64::NAN),
                ..RunConfig::default()
            },
            RunConfig {
                distance_radius: -1,
                ..RunConfig::default()
            },
            RunConfig {
                chunk_size: 0,
                ..RunConfig::default()
            },
            RunConfig {
                histogram_bins: 0,
                ..RunConfig::default()
            },
        ];
        for config in &bad {
            assert!(config.validate().is_err(), "{:?}", config);
        }
        assert!(matches!(
            RunConfig {
                distance_radius: -5,
                ..RunConfig::default()
            }
            .validate(),
            Err(ConfigError::NegativeRadius(-5))
        ));
    }

    #[test]
    fn test_from_toml() {
        let config = RunConfig::from_toml_str(
            r#"
            model = "categorical"
            pvalueThreshold = 0.001
            pvalueThresholdDistant = 1e-8
            distanceRadius = 500
            chunkSize = 64
            exactFDR = false
            histogramEnabled = true

            [input]
            delimiter = ","
            missingToken = "."
            "#,
        )
        .unwrap();
        assert_eq!(config.model, ModelKind::Categorical);
        assert_eq!(config.threshold(Category::Distant), 1e-8);
        assert_eq!(config.threshold(Category::Local), 0.001);
        assert_eq!(config.radius(), 500);
        assert_eq!(config.chunk_size, 64);
        assert!(!config.exact_fdr);
        assert!(config.histogram_enabled);
        assert_eq!(config.input.delimiter, ',');
        assert_eq!(config.input.missing_token, ".");
        assert_eq!(config.input.skip_rows, 1);
    }

    #[test]
    fn test_from_toml_rejects_unknown_keys() {
        assert!(RunConfig::from_toml_str("pvalueTreshold = 0.1").is_err());
        assert!(RunConfig::from_toml_str("model = \"probit\"").is_err());
    }
}
