//! Error types for FastEQTL
//!
//! Defines all error types used throughout the library.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for FastEQTL operations
#[derive(Debug, Error)]
pub enum EqtlError {
    /// Malformed matrix or annotation input
    #[error("Input format error: {0}")]
    InputFormat(#[from] InputFormatError),

    /// Sample dimension mismatch between matrices
    #[error("Alignment error: {0}")]
    Alignment(#[from] AlignmentError),

    /// Invalid run configuration
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Fatal numeric failure during preprocessing
    #[error("Numeric error: {0}")]
    Numeric(#[from] NumericError),

    /// Output sink failure during scanning or finalization
    #[error("Output error: {0}")]
    Sink(#[from] SinkError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while reading matrices and position annotations
#[derive(Debug, Error)]
pub enum InputFormatError {
    /// Row has a different number of values than the first row
    #[error("Row '{id}' has {found} values, expected {expected}")]
    RaggedRow {
        id: String,
        expected: usize,
        found: usize,
    },

    /// Feature identifier appears twice in one matrix
    #[error("Duplicate feature identifier '{0}'")]
    DuplicateId(String),

    /// Feature identifier that cannot be written to a tab-separated output
    #[error("Feature identifier {0:?} contains a tab or line break")]
    InvalidId(String),

    /// Header width does not match the data width
    #[error("Header lists {found} samples, data rows carry {expected}")]
    HeaderWidth { expected: usize, found: usize },

    /// Unparsable numeric token
    #[error("Invalid number '{value}' at line {line}, column {column}")]
    InvalidNumber {
        line: usize,
        column: usize,
        value: String,
    },

    /// Line with too few fields
    #[error("Too few fields at line {line}: expected at least {expected}, found {found}")]
    TooFewFields {
        line: usize,
        expected: usize,
        found: usize,
    },

    /// Field delimiter is not a single byte
    #[error("Unsupported delimiter {0:?}")]
    Delimiter(char),

    /// Invalid UTF-8 in a text field
    #[error("Invalid UTF-8 at line {0}")]
    InvalidUtf8(usize),

    /// Input file not found
    #[error("Input file not found: {0}")]
    FileNotFound(PathBuf),

    /// Matrix that must be square is not
    #[error("Matrix '{name}' must be {expected}x{expected}, got {rows}x{columns}")]
    NotSquare {
        name: String,
        expected: usize,
        rows: usize,
        columns: usize,
    },

    /// I/O error during parsing
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Sample alignment failures across the variant, trait and covariate matrices
#[derive(Debug, Error)]
pub enum AlignmentError {
    #[error("{matrix} matrix has {found} samples, variant matrix has {expected}")]
    SampleCount {
        matrix: String,
        expected: usize,
        found: usize,
    },

    #[error("{matrix} matrix sample {column} is '{found}', variant matrix has '{expected}'")]
    SampleId {
        matrix: String,
        column: usize,
        expected: String,
        found: String,
    },
}

/// Invalid configuration values
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name} must lie in (0, 1], got {value}")]
    Threshold { name: &'static str, value: f64 },

    #[error("distanceRadius must be non-negative, got {0}")]
    NegativeRadius(i64),

    #[error("chunkSize must be positive")]
    ChunkSize,

    #[error("histogramBins must be positive")]
    HistogramBins,

    #[error("Delimiter must be a single ASCII character, got {0:?}")]
    Delimiter(char),

    #[error("Model '{0}' requires an error covariance matrix")]
    MissingErrorCovariance(&'static str),

    #[error("Error covariance matrix is only used by the linear-error-covariance model")]
    UnexpectedErrorCovariance,

    #[error("Unknown model '{0}'")]
    UnknownModel(String),

    #[error("Failed to read configuration file: {0}")]
    File(String),
}

/// Numeric failures
///
/// Only the preprocessing variants are fatal; degenerate rows found
/// during scanning are skipped and counted instead.
#[derive(Debug, Error)]
pub enum NumericError {
    /// Covariate subspace is rank deficient
    #[error("Covariate {covariate} is constant or collinear with earlier covariates")]
    RankDeficient { covariate: String },

    /// Error covariance is not symmetric positive definite
    #[error("Error covariance matrix is not positive definite (pivot {0})")]
    NotPositiveDefinite(usize),

    /// Not enough samples left for the residual degrees of freedom
    #[error("{samples} samples leave no residual degrees of freedom after {covariates} covariates")]
    InsufficientSamples { samples: usize, covariates: usize },

    /// Thread pool could not be created
    #[error("Failed to create thread pool: {0}")]
    ThreadPool(String),
}

/// Output sink failure, naming every output left incomplete
#[derive(Debug, Error)]
#[error("Failed writing {sink} output: {source}; incomplete outputs: {incomplete:?}")]
pub struct SinkError {
    pub sink: String,
    pub incomplete: Vec<PathBuf>,
    #[source]
    pub source: std::io::Error,
}

/// Result type alias for FastEQTL operations
pub type Result<T> = std::result::Result<T, EqtlError>;

/// Result type alias for input parsing operations
pub type InputResult<T> = std::result::Result<T, InputFormatError>;

/// Result type alias for numeric preprocessing
pub type NumericResult<T> = std::result::Result<T, NumericError>;

/// Result type alias for configuration validation
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
