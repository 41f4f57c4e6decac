//! Core association scanning functionality
//!
//! This module contains the chunked matrix store, covariate residualizer,
//! association models, proximity classifier, output sinks, FDR correction
//! and the run orchestrator.

pub mod config;
pub mod engine;
mod error;
pub mod fdr;
pub mod io;
pub mod matrix;
pub mod model;
pub mod orchestrator;
pub mod output;
pub mod position;
pub mod proximity;
pub mod residual;
pub mod stats;

pub use config::{MatrixFileOptions, RunConfig};
pub use engine::{CancelToken, FeatureMinima, ScanTally};
pub use error::{
    AlignmentError, ConfigError, ConfigResult, EqtlError, InputFormatError, InputResult,
    NumericError, NumericResult, Result, SinkError,
};
pub use fdr::{ExactFdr, FdrCorrector, HistogramFdr, PvalueHistogram};
pub use io::{detect_compression, CompressionFormat, IoStrategy, LineReader, SourceKind, TextReader};
pub use matrix::{ChunkedMatrix, MatrixBuilder, MatrixChunk, DEFAULT_CHUNK_SIZE};
pub use model::{AnovaModel, AssociationModel, BlockStatistics, LinearModel, ModelKind};
pub use orchestrator::{
    CategorySummary, InputFiles, MinPvalues, Orchestrator, OutputTargets, RunState, ScanInputs,
    ScanSummary, SinkLayer,
};
pub use output::{AssociationRecord, Category, RecordSink, SinkOutput, SinkTarget, OUTPUT_HEADER};
pub use position::{normalize_chrom_key, PositionIndex, TraitInterval, VariantPosition};
pub use proximity::ProximityClassifier;
pub use residual::{CovariateSpace, PreparedChunk, PreparedMatrix, Whitening};
