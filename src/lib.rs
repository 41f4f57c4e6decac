//! FastEQTL - Streaming variant-trait association scanning
//!
//! Tests every variant against every trait (or, with positions, splits the
//! pairs into local and distant sets) under a linear, error-covariance or
//! ANOVA model, keeping memory bounded by the chunk size.
//!
//! # Features
//!
//! - Block matrix products over residualized, unit-norm chunks
//! - Parallel chunk-pair evaluation with rayon
//! - Per-category p-value thresholds with exact or histogram-based FDR
//! - Plain or compressed (gzip, bzip2) text input
//!
//! # Example
//!
//! ```ignore
//! use fast_eqtl::{read_matrix, MatrixFileOptions, Orchestrator, OutputTargets, RunConfig, ScanInputs};
//!
//! let options = MatrixFileOptions::default();
//! let variants = read_matrix("genotypes.txt", &options, 2000)?;
//! let traits = read_matrix("expression.txt", &options, 2000)?;
//!
//! let mut orchestrator = Orchestrator::new(RunConfig::default());
//! let summary = orchestrator.run(
//!     ScanInputs::new(variants, traits),
//!     &OutputTargets::with_prefix("results"),
//! )?;
//! println!("{} associations", summary.accepted_records());
//! ```

pub mod core;
pub mod formats;

// Re-export commonly used types
pub use core::{
    AssociationRecord, Category, ChunkedMatrix, EqtlError, InputFiles, MatrixFileOptions,
    ModelKind, Orchestrator, OutputTargets, PositionIndex, RunConfig, RunState, ScanInputs,
    ScanSummary,
};
pub use formats::{read_matrix, read_positions};
