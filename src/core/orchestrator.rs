//! Run orchestration
//!
//! A run walks through a fixed sequence of states:
//!
//! ```text
//! INIT -> LOADING -> PREPROCESS -> SCANNING -> FINALIZE -> DONE
//!   \________\___________\____________\___________\-----> FAILED
//! ```
//!
//! Input, alignment and configuration errors are raised before any sink
//! is opened. Sinks live only inside SCANNING and FINALIZE: on success
//! they are consumed into final outputs, on failure they are dropped,
//! which removes their spool files.

use crate::core::config::RunConfig;
use crate::core::engine::{CancelToken, CategoryChannel, FeatureMinima, ScanEngine, ScanPlan, ScanTally};
use crate::core::error::{ConfigError, InputFormatError, NumericError, Result, SinkError};
use crate::core::fdr::PvalueHistogram;
use crate::core::matrix::ChunkedMatrix;
use crate::core::model::{ModelKind, AssociationModel};
use crate::core::output::{open_sink, AssociationRecord, Category, RecordSink, SinkOutput, SinkTarget};
use crate::core::position::PositionIndex;
use crate::core::proximity::ProximityClassifier;
use crate::core::residual::{CovariateSpace, Whitening};
use crate::formats::matrix::{read_matrix, read_square_matrix};
use crate::formats::positions::read_positions;
use log::{debug, error, info, warn};
use ndarray::Array2;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Lifecycle state of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Init,
    Loading,
    Preprocess,
    Scanning,
    Finalize,
    Done,
    Failed,
}

impl RunState {
    pub fn name(&self) -> &'static str {
        match self {
            RunState::Init => "INIT",
            RunState::Loading => "LOADING",
            RunState::Preprocess => "PREPROCESS",
            RunState::Scanning => "SCANNING",
            RunState::Finalize => "FINALIZE",
            RunState::Done => "DONE",
            RunState::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Done | RunState::Failed)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// In-memory inputs of a run
#[derive(Debug, Clone)]
pub struct ScanInputs {
    pub variants: ChunkedMatrix,
    pub traits: ChunkedMatrix,
    pub covariates: Option<ChunkedMatrix>,
    /// Proximity mode when present
    pub positions: Option<PositionIndex>,
    /// Sample error covariance of the `linear-error-covariance` model
    pub error_covariance: Option<Array2<f64>>,
}

impl ScanInputs {
    pub fn new(variants: ChunkedMatrix, traits: ChunkedMatrix) -> Self {
        Self {
            variants,
            traits,
            covariates: None,
            positions: None,
            error_covariance: None,
        }
    }

    pub fn with_covariates(mut self, covariates: ChunkedMatrix) -> Self {
        self.covariates = Some(covariates);
        self
    }

    pub fn with_positions(mut self, positions: PositionIndex) -> Self {
        self.positions = Some(positions);
        self
    }

    pub fn with_error_covariance(mut self, sigma: Array2<f64>) -> Self {
        self.error_covariance = Some(sigma);
        self
    }
}

/// File inputs of a run
#[derive(Debug, Clone, Default)]
pub struct InputFiles {
    pub variants: PathBuf,
    pub traits: PathBuf,
    pub covariates: Option<PathBuf>,
    /// Both position files enable proximity mode
    pub variant_positions: Option<PathBuf>,
    pub trait_positions: Option<PathBuf>,
    pub error_covariance: Option<PathBuf>,
}

/// Destination of each category
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputTargets {
    pub all: SinkTarget,
    pub local: SinkTarget,
    pub distant: SinkTarget,
}

impl OutputTargets {
    /// Keep every category's records in memory
    pub fn memory() -> Self {
        Self {
            all: SinkTarget::Memory,
            local: SinkTarget::Memory,
            distant: SinkTarget::Memory,
        }
    }

    /// Files named `<prefix>.<category>.tsv`
    pub fn with_prefix<P: AsRef<Path>>(prefix: P) -> Self {
        let prefix = prefix.as_ref().to_string_lossy().into_owned();
        let file = |category: Category| SinkTarget::File(PathBuf::from(format!("{}.{}.tsv", prefix, category)));
        Self {
            all: file(Category::All),
            local: file(Category::Local),
            distant: file(Category::Distant),
        }
    }

    pub fn target(&self, category: Category) -> &SinkTarget {
        match category {
            Category::All => &self.all,
            Category::Local => &self.local,
            Category::Distant => &self.distant,
        }
    }
}

/// Outcome of one category
#[derive(Debug, Clone)]
pub struct CategorySummary {
    pub category: Category,
    pub threshold: f64,
    pub tested: u64,
    pub accepted: usize,
    /// Tested p-value histogram, when enabled
    pub histogram: Option<PvalueHistogram>,
    pub output: SinkOutput,
}

/// Smallest tested p-value per feature, `NaN` when never tested
#[derive(Debug, Clone, Default)]
pub struct MinPvalues {
    pub variants: Vec<(String, f64)>,
    pub traits: Vec<(String, f64)>,
}

/// Result of a finished run
#[derive(Debug, Clone)]
pub struct ScanSummary {
    pub model: ModelKind,
    pub proximity: bool,
    pub n_samples: usize,
    pub n_variants: usize,
    pub n_traits: usize,
    pub n_covariates: usize,
    pub untestable_variants: usize,
    pub untestable_traits: usize,
    pub categories: Vec<CategorySummary>,
    /// Pairs with a degenerate feature row
    pub skipped_pairs: u64,
    /// Pairs without a known position (proximity mode)
    pub excluded_pairs: u64,
    /// Cancelled before all chunk pairs were scanned; outputs are incomplete
    pub aborted: bool,
    pub min_pvalues: Option<MinPvalues>,
    pub elapsed: Duration,
}

impl ScanSummary {
    pub fn category(&self, category: Category) -> Option<&CategorySummary> {
        self.categories.iter().find(|c| c.category == category)
    }

    /// In-memory records of `category`
    pub fn records(&self, category: Category) -> &[AssociationRecord] {
        self.category(category).map(|c| c.output.records()).unwrap_or(&[])
    }

    pub fn tested_pairs(&self) -> u64 {
        self.categories.iter().map(|c| c.tested).sum()
    }

    pub fn accepted_records(&self) -> usize {
        self.categories.iter().map(|c| c.accepted).sum()
    }
}

/// Wrapper applied to every sink a run opens, e.g. to tee or count records
pub type SinkLayer = Box<dyn Fn(Category, Box<dyn RecordSink>) -> Box<dyn RecordSink> + Send + Sync>;

/// Drives one run through its states
pub struct Orchestrator {
    config: RunConfig,
    state: RunState,
    cancel: CancelToken,
    sink_layer: Option<SinkLayer>,
}

impl Orchestrator {
    pub fn new(config: RunConfig) -> Self {
        Self {
            config,
            state: RunState::Init,
            cancel: CancelToken::new(),
            sink_layer: None,
        }
    }

    /// Wrap every sink opened by later runs with `layer`
    pub fn with_sink_layer<F>(mut self, layer: F) -> Self
    where
        F: Fn(Category, Box<dyn RecordSink>) -> Box<dyn RecordSink> + Send + Sync + 'static,
    {
        self.sink_layer = Some(Box::new(layer));
        self
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Token aborting the scan between chunk pairs
    ///
    /// A request aborts the running scan, or the next one if no scan is
    /// running. It is cleared when a run ends, so the orchestrator stays
    /// reusable.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Run on in-memory matrices
    pub fn run(&mut self, inputs: ScanInputs, outputs: &OutputTargets) -> Result<ScanSummary> {
        let started = Instant::now();
        let result = self
            .start()
            .and_then(|()| self.execute(inputs, outputs, started));
        self.settle(result)
    }

    /// Load inputs from files, then run
    pub fn run_files(&mut self, files: &InputFiles, outputs: &OutputTargets) -> Result<ScanSummary> {
        let started = Instant::now();
        let result = self
            .start()
            .and_then(|()| self.load_files(files))
            .and_then(|inputs| self.execute(inputs, outputs, started));
        self.settle(result)
    }

    fn transition(&mut self, next: RunState) {
        debug!("Run state {} -> {}", self.state, next);
        self.state = next;
    }

    /// INIT: validate the configuration, then enter LOADING
    fn start(&mut self) -> Result<()> {
        self.state = RunState::Init;
        self.config.validate()?;
        self.transition(RunState::Loading);
        Ok(())
    }

    fn settle(&mut self, result: Result<ScanSummary>) -> Result<ScanSummary> {
        self.cancel.reset();
        match result {
            Ok(summary) => {
                self.transition(RunState::Done);
                Ok(summary)
            }
            Err(e) => {
                error!("Run failed in state {}: {}", self.state, e);
                self.transition(RunState::Failed);
                Err(e)
            }
        }
    }

    fn load_files(&self, files: &InputFiles) -> Result<ScanInputs> {
        let options = &self.config.input;
        let chunk_size = self.config.chunk_size;

        info!("Loading variants from {:?}", files.variants);
        let variants = read_matrix(&files.variants, options, chunk_size)?;
        info!("Loading traits from {:?}", files.traits);
        let traits = read_matrix(&files.traits, options, chunk_size)?;

        let mut inputs = ScanInputs::new(variants, traits);
        if let Some(path) = &files.covariates {
            info!("Loading covariates from {:?}", path);
            inputs.covariates = Some(read_matrix(path, options, chunk_size)?);
        }
        if let (Some(vpos), Some(tpos)) = (&files.variant_positions, &files.trait_positions) {
            info!("Loading positions from {:?} and {:?}", vpos, tpos);
            inputs.positions = Some(read_positions(vpos, tpos)?);
        }
        if let Some(path) = &files.error_covariance {
            info!("Loading error covariance from {:?}", path);
            let n = inputs.variants.n_samples();
            inputs.error_covariance = Some(read_square_matrix(path, options, n)?);
        }
        Ok(inputs)
    }

    fn execute(&mut self, inputs: ScanInputs, outputs: &OutputTargets, started: Instant) -> Result<ScanSummary> {
        let config = self.config.clone();

        // LOADING: shape the stores and check alignment
        let variants = inputs.variants.rechunk(config.chunk_size);
        let traits = inputs.traits.rechunk(config.chunk_size);
        let n_samples = variants.n_samples();
        let covariates = inputs
            .covariates
            .unwrap_or_else(|| ChunkedMatrix::empty(n_samples));
        variants.check_aligned(&traits, "trait")?;
        variants.check_aligned(&covariates, "covariate")?;

        match (config.model, &inputs.error_covariance) {
            (ModelKind::LinearErrorCovariance, None) => {
                return Err(ConfigError::MissingErrorCovariance(config.model.name()).into());
            }
            (ModelKind::LinearErrorCovariance, Some(sigma)) => {
                let (rows, columns) = sigma.dim();
                if rows != n_samples || columns != n_samples {
                    return Err(InputFormatError::NotSquare {
                        name: "error covariance".to_string(),
                        expected: n_samples,
                        rows,
                        columns,
                    }
                    .into());
                }
            }
            (_, Some(_)) => return Err(ConfigError::UnexpectedErrorCovariance.into()),
            (_, None) => {}
        }

        let proximity = inputs.positions.is_some();
        info!(
            "Loaded {} variants, {} traits, {} covariates over {} samples ({} mode)",
            variants.n_features(),
            traits.n_features(),
            covariates.n_features(),
            n_samples,
            if proximity { "proximity" } else { "exhaustive" }
        );
        for (label, matrix) in [("variant", &variants), ("trait", &traits)] {
            if matrix.missing_cells() > 0 {
                warn!("{} missing cells in the {} matrix are imputed", matrix.missing_cells(), label);
            }
        }

        // PREPROCESS
        self.transition(RunState::Preprocess);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.threads)
            .build()
            .map_err(|e| NumericError::ThreadPool(e.to_string()))?;

        let whitening = inputs
            .error_covariance
            .as_ref()
            .map(|sigma| Whitening::from_covariance(sigma.view()))
            .transpose()?;
        let space = CovariateSpace::new(&covariates, whitening)?;
        let model: Box<dyn AssociationModel> = config.model.build();
        let df = model.residual_df(&space)?;
        info!("Model {} with {} residual degrees of freedom", config.model, df);

        let (prepared_variants, prepared_traits) = pool.install(|| {
            (
                model.prepare_variants(&variants, &space),
                model.prepare_traits(&traits, &space),
            )
        });
        let untestable_variants = prepared_variants.untestable();
        let untestable_traits = prepared_traits.untestable();
        if untestable_variants > 0 || untestable_traits > 0 {
            warn!(
                "{} variants and {} traits have no variance left after covariates; their pairs are skipped",
                untestable_variants, untestable_traits
            );
        }

        let classifier = inputs
            .positions
            .as_ref()
            .map(|positions| ProximityClassifier::new(positions, &variants, &traits, config.radius()));
        if let Some(c) = &classifier {
            info!(
                "Proximity radius {} bp; positions for {}/{} variants and {}/{} traits",
                c.radius(),
                c.positioned_variants(),
                variants.n_features(),
                c.positioned_traits(),
                traits.n_features()
            );
        }

        // SCANNING
        self.transition(RunState::Scanning);
        let categories: &[Category] = if proximity {
            &[Category::Local, Category::Distant]
        } else {
            &[Category::All]
        };
        let planned: Vec<PathBuf> = categories
            .iter()
            .filter_map(|c| match outputs.target(*c) {
                SinkTarget::File(path) => Some(path.clone()),
                SinkTarget::Memory => None,
            })
            .collect();

        let mut channels = Vec::with_capacity(categories.len());
        for &category in categories {
            let sink = open_sink(category, outputs.target(category)).map_err(|source| SinkError {
                sink: category.to_string(),
                incomplete: planned.clone(),
                source,
            })?;
            let sink = match &self.sink_layer {
                Some(layer) => layer(category, sink),
                None => sink,
            };
            channels.push(CategoryChannel::new(
                category,
                config.threshold(category),
                sink,
                config.exact_fdr,
            ));
        }

        let plan = ScanPlan {
            model: model.as_ref(),
            space: &space,
            variants: &prepared_variants,
            traits: &prepared_traits,
            variant_ids: variants.feature_ids(),
            trait_ids: traits.feature_ids(),
            classifier: classifier.as_ref(),
        };
        let engine = ScanEngine::new(
            plan,
            &channels,
            config.histogram_bins,
            config.min_pvalue_by_feature,
            self.cancel.clone(),
        );
        let tally: ScanTally = engine.run(&pool).map_err(|failure| SinkError {
            sink: failure.sink,
            incomplete: planned.clone(),
            source: failure.source,
        })?;
        if tally.aborted {
            warn!("Scan cancelled; outputs only hold the chunk pairs scanned so far: {:?}", planned);
        }
        info!(
            "Scanned {} chunk pairs: {} pairs tested, {} skipped, {} excluded",
            tally.chunk_pairs,
            tally.tested_pairs(),
            tally.skipped_pairs,
            tally.excluded_pairs
        );

        // FINALIZE
        self.transition(RunState::Finalize);
        let mut summaries = Vec::with_capacity(channels.len());
        let mut remaining = planned;
        for (channel, counts) in channels.into_iter().zip(&tally.categories) {
            let category = channel.category();
            let threshold = channel.threshold();
            let sink = channel.sink_name();
            let output = channel.finish(&counts.histogram).map_err(|source| SinkError {
                sink,
                incomplete: remaining.clone(),
                source,
            })?;
            if let SinkOutput::File { path, .. } = &output {
                remaining.retain(|p| p != path);
            }
            info!(
                "{}: {} tested, {} accepted at p <= {}",
                category,
                counts.tested,
                output.len(),
                threshold
            );
            summaries.push(CategorySummary {
                category,
                threshold,
                tested: counts.tested,
                accepted: output.len(),
                histogram: config.histogram_enabled.then(|| counts.histogram.clone()),
                output,
            });
        }

        let min_pvalues = tally.minima.map(|FeatureMinima { variants: v, traits: t }| MinPvalues {
            variants: variants.feature_ids().iter().cloned().zip(v).collect(),
            traits: traits.feature_ids().iter().cloned().zip(t).collect(),
        });

        Ok(ScanSummary {
            model: config.model,
            proximity,
            n_samples,
            n_variants: variants.n_features(),
            n_traits: traits.n_features(),
            n_covariates: covariates.n_features(),
            untestable_variants,
            untestable_traits,
            categories: summaries,
            skipped_pairs: tally.skipped_pairs,
            excluded_pairs: tally.excluded_pairs,
            aborted: tally.aborted,
            min_pvalues,
            elapsed: started.elapsed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::{AlignmentError, EqtlError};
    use crate::core::matrix::MatrixBuilder;

    fn matrix(samples: &[&str], rows: Vec<(&str, Vec<f64>)>) -> ChunkedMatrix {
        let mut builder = MatrixBuilder::new(4).with_sample_ids(samples.iter().map(|s| s.to_string()).collect());
        for (id, values) in rows {
            builder.push_row(id, &values).unwrap();
        }
        builder.build().unwrap()
    }

    fn config(threshold: f64) -> RunConfig {
        RunConfig {
            pvalue_threshold: threshold,
            threads: 2,
            ..RunConfig::default()
        }
    }

    #[test]
    fn test_state_names() {
        assert_eq!(RunState::Preprocess.to_string(), "PREPROCESS");
        assert!(RunState::Failed.is_terminal());
        assert!(!RunState::Scanning.is_terminal());
    }

    #[test]
    fn test_perfect_correlation_run() {
        let samples = ["a", "b", "c", "d"];
        let inputs = ScanInputs::new(
            matrix(&samples, vec![("rs1", vec![0.0, 1.0, 2.0, 3.0])]),
            matrix(&samples, vec![("GENE", vec![0.0, 1.0, 2.0, 3.0])]),
        );
        let mut orchestrator = Orchestrator::new(config(0.05));
        let summary = orchestrator.run(inputs, &OutputTargets::memory()).unwrap();

        assert_eq!(orchestrator.state(), RunState::Done);
        let records = summary.records(Category::All);
        assert_eq!(records.len(), 1);
        assert!(records[0].pvalue < 1e-10);
        assert_eq!(summary.tested_pairs(), 1);
        assert!(!summary.aborted);
    }

    #[test]
    fn test_reordered_samples_fail_before_scanning() {
        let inputs = ScanInputs::new(
            matrix(&["a", "b", "c", "d"], vec![("rs1", vec![0.0, 1.0, 2.0, 3.0])]),
            matrix(&["b", "a", "c", "d"], vec![("GENE", vec![1.0, 0.0, 2.0, 3.0])]),
        );
        let mut orchestrator = Orchestrator::new(config(0.05));
        let err = orchestrator.run(inputs, &OutputTargets::memory()).unwrap_err();

        assert!(matches!(err, EqtlError::Alignment(AlignmentError::SampleId { column: 1, .. })));
        assert_eq!(orchestrator.state(), RunState::Failed);
    }

    #[test]
    fn test_invalid_config_fails_in_init() {
        let samples = ["a", "b", "c", "d"];
        let inputs = ScanInputs::new(
            matrix(&samples, vec![("rs1", vec![0.0, 1.0, 2.0, 3.0])]),
            matrix(&samples, vec![("GENE", vec![0.0, 1.0, 2.0, 3.0])]),
        );
        let mut orchestrator = Orchestrator::new(RunConfig {
            distance_radius: -1,
            ..RunConfig::default()
        });
        let err = orchestrator.run(inputs, &OutputTargets::memory()).unwrap_err();
        assert!(matches!(err, EqtlError::Config(ConfigError::NegativeRadius(-1))));
        assert_eq!(orchestrator.state(), RunState::Failed);
    }

    #[test]
    fn test_error_covariance_requirements() {
        let samples = ["a", "b", "c", "d", "e"];
        let v = matrix(&samples, vec![("rs1", vec![0.0, 1.0, 2.0, 3.0, 1.0])]);
        let t = matrix(&samples, vec![("GENE", vec![0.5, 1.0, 2.5, 3.0, 0.0])]);

        let mut missing = Orchestrator::new(RunConfig {
            model: ModelKind::LinearErrorCovariance,
            ..config(0.05)
        });
        let err = missing
            .run(ScanInputs::new(v.clone(), t.clone()), &OutputTargets::memory())
            .unwrap_err();
        assert!(matches!(err, EqtlError::Config(ConfigError::MissingErrorCovariance(_))));

        let mut unexpected = Orchestrator::new(config(0.05));
        let err = unexpected
            .run(
                ScanInputs::new(v.clone(), t.clone()).with_error_covariance(Array2::eye(5)),
                &OutputTargets::memory(),
            )
            .unwrap_err();
        assert!(matches!(err, EqtlError::Config(ConfigError::UnexpectedErrorCovariance)));

        let mut wrong_size = Orchestrator::new(RunConfig {
            model: ModelKind::LinearErrorCovariance,
            ..config(0.05)
        });
        let err = wrong_size
            .run(
                ScanInputs::new(v, t).with_error_covariance(Array2::eye(4)),
                &OutputTargets::memory(),
            )
            .unwrap_err();
        assert!(matches!(err, EqtlError::InputFormat(InputFormatError::NotSquare { .. })));
    }

    #[test]
    fn test_identity_error_covariance_matches_linear() {
        let samples = ["a", "b", "c", "d", "e", "f"];
        let v = matrix(&samples, vec![("rs1", vec![0.0, 1.0, 2.0, 1.0, 0.0, 2.0])]);
        let t = matrix(&samples, vec![("GENE", vec![0.3, 1.1, 2.4, 0.7, 0.2, 1.5])]);

        let linear = Orchestrator::new(config(1.0))
            .run(ScanInputs::new(v.clone(), t.clone()), &OutputTargets::memory())
            .unwrap();
        let whitened = Orchestrator::new(RunConfig {
            model: ModelKind::LinearErrorCovariance,
            ..config(1.0)
        })
        .run(
            ScanInputs::new(v, t).with_error_covariance(Array2::eye(6)),
            &OutputTargets::memory(),
        )
        .unwrap();

        let a = &linear.records(Category::All)[0];
        let b = &whitened.records(Category::All)[0];
        assert!((a.pvalue - b.pvalue).abs() < 1e-12);
        assert!((a.effect_size - b.effect_size).abs() < 1e-12);
    }

    #[test]
    fn test_rank_deficient_covariates_fail() {
        let samples = ["a", "b", "c", "d", "e"];
        let inputs = ScanInputs::new(
            matrix(&samples, vec![("rs1", vec![0.0, 1.0, 2.0, 3.0, 1.0])]),
            matrix(&samples, vec![("GENE", vec![0.5, 1.0, 2.5, 3.0, 0.0])]),
        )
        .with_covariates(matrix(
            &samples,
            vec![("age", vec![1.0, 2.0, 3.0, 4.0, 5.0]), ("age2", vec![2.0, 4.0, 6.0, 8.0, 10.0])],
        ));
        let mut orchestrator = Orchestrator::new(config(0.05));
        let err = orchestrator.run(inputs, &OutputTargets::memory()).unwrap_err();
        assert!(matches!(
            err,
            EqtlError::Numeric(NumericError::RankDeficient { ref covariate }) if covariate == "age2"
        ));
        assert_eq!(orchestrator.state(), RunState::Failed);
    }

    #[test]
    fn test_output_targets_with_prefix() {
        let targets = OutputTargets::with_prefix("out/run1");
        assert_eq!(targets.local, SinkTarget::File(PathBuf::from("out/run1.local.tsv")));
        assert_eq!(targets.target(Category::All), &SinkTarget::File(PathBuf::from("out/run1.all.tsv")));
    }
}
