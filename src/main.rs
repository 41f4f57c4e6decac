//! FastEQTL CLI entry point
//!
//! Streaming variant-trait association scanning.

use anyhow::Context;
use clap::{Parser, ValueEnum};
use fast_eqtl::core::{MinPvalues, PvalueHistogram};
use fast_eqtl::{Category, InputFiles, ModelKind, Orchestrator, OutputTargets, RunConfig, ScanSummary};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Association model (CLI enum)
#[derive(Clone, Copy, Debug, ValueEnum)]
enum ModelArg {
    /// Additive linear model, t-test on the slope
    #[value(name = "linear")]
    Linear,
    /// Linear model with a sample error covariance matrix
    #[value(name = "linear-error-covariance")]
    LinearErrorCovariance,
    /// Variant values as groups, ANOVA F-test
    #[value(name = "categorical")]
    Categorical,
}

impl From<ModelArg> for ModelKind {
    fn from(arg: ModelArg) -> Self {
        match arg {
            ModelArg::Linear => ModelKind::Linear,
            ModelArg::LinearErrorCovariance => ModelKind::LinearErrorCovariance,
            ModelArg::Categorical => ModelKind::Categorical,
        }
    }
}

#[derive(Parser)]
#[command(name = "fast-eqtl")]
#[command(about = "Streaming variant-trait association scanner")]
#[command(version)]
#[command(author = "FastEQTL Contributors")]
struct Cli {
    /// Variant matrix (variants x samples)
    variants: PathBuf,
    /// Trait matrix (traits x samples)
    traits: PathBuf,
    /// Output prefix; writes <prefix>.<category>.tsv
    output: PathBuf,

    /// Covariate matrix (covariates x samples)
    #[arg(short = 'c', long)]
    covariates: Option<PathBuf>,
    /// Variant positions (id chrom pos); enables local/distant mode with --trait-positions
    #[arg(long = "variant-positions", requires = "trait_positions")]
    variant_positions: Option<PathBuf>,
    /// Trait intervals (id chrom start end)
    #[arg(long = "trait-positions", requires = "variant_positions")]
    trait_positions: Option<PathBuf>,
    /// Sample error covariance (samples x samples), for linear-error-covariance
    #[arg(long = "error-covariance")]
    error_covariance: Option<PathBuf>,

    /// TOML configuration file; flags override its values
    #[arg(long)]
    config: Option<PathBuf>,
    /// Association model
    #[arg(short = 'm', long)]
    model: Option<ModelArg>,
    /// P-value threshold (all pairs, and default for local/distant)
    #[arg(short = 'p', long = "pvalue-threshold")]
    pvalue_threshold: Option<f64>,
    /// P-value threshold for local pairs
    #[arg(long = "pvalue-threshold-local")]
    pvalue_threshold_local: Option<f64>,
    /// P-value threshold for distant pairs
    #[arg(long = "pvalue-threshold-distant")]
    pvalue_threshold_distant: Option<f64>,
    /// Local window radius in base pairs
    #[arg(short = 'r', long = "distance-radius", allow_hyphen_values = true)]
    distance_radius: Option<i64>,
    /// Feature rows per chunk
    #[arg(long = "chunk-size")]
    chunk_size: Option<usize>,
    /// Estimate q-values from the p-value histogram instead of exactly
    #[arg(long = "approximate-fdr")]
    approximate_fdr: bool,
    /// Write the tested p-value histogram of every category
    #[arg(long)]
    histogram: bool,
    /// Number of histogram bins
    #[arg(long = "histogram-bins")]
    histogram_bins: Option<usize>,
    /// Write the smallest p-value of every variant and trait
    #[arg(long = "min-pvalue-by-feature")]
    min_pvalue_by_feature: bool,
    /// Number of threads (default: number of CPUs)
    #[arg(short = 't', long)]
    threads: Option<usize>,
    /// Field delimiter of input matrices
    #[arg(short = 'd', long)]
    delimiter: Option<char>,
    /// Missing-value token of input matrices
    #[arg(long = "missing-token")]
    missing_token: Option<String>,
    /// Leading lines to skip in input matrices (first is the header)
    #[arg(long = "skip-rows")]
    skip_rows: Option<usize>,
    /// Leading columns to skip in input matrices (first is the id)
    #[arg(long = "skip-columns")]
    skip_columns: Option<usize>,
    /// Report progress
    #[arg(short = 'v', long)]
    verbose: bool,
}

impl Cli {
    /// Configuration file values, overridden by flags
    fn run_config(&self) -> anyhow::Result<RunConfig> {
        let mut config = match &self.config {
            Some(path) => RunConfig::from_toml_file(path)?,
            None => RunConfig::default(),
        };

        if let Some(model) = self.model {
            config.model = model.into();
        }
        if let Some(p) = self.pvalue_threshold {
            config.pvalue_threshold = p;
        }
        if self.pvalue_threshold_local.is_some() {
            config.pvalue_threshold_local = self.pvalue_threshold_local;
        }
        if self.pvalue_threshold_distant.is_some() {
            config.pvalue_threshold_distant = self.pvalue_threshold_distant;
        }
        if let Some(radius) = self.distance_radius {
            config.distance_radius = radius;
        }
        if let Some(size) = self.chunk_size {
            config.chunk_size = size;
        }
        if self.approximate_fdr {
            config.exact_fdr = false;
        }
        if self.histogram {
            config.histogram_enabled = true;
        }
        if let Some(bins) = self.histogram_bins {
            config.histogram_bins = bins;
        }
        if self.min_pvalue_by_feature {
            config.min_pvalue_by_feature = true;
        }
        if let Some(threads) = self.threads {
            config.threads = threads;
        }
        if let Some(delimiter) = self.delimiter {
            config.input.delimiter = delimiter;
        }
        if let Some(token) = &self.missing_token {
            config.input.missing_token = token.clone();
        }
        if let Some(rows) = self.skip_rows {
            config.input.skip_rows = rows;
        }
        if let Some(columns) = self.skip_columns {
            config.input.skip_columns = columns;
        }
        if self.verbose {
            config.verbose = true;
        }
        Ok(config)
    }

    fn input_files(&self) -> InputFiles {
        InputFiles {
            variants: self.variants.clone(),
            traits: self.traits.clone(),
            covariates: self.covariates.clone(),
            variant_positions: self.variant_positions.clone(),
            trait_positions: self.trait_positions.clone(),
            error_covariance: self.error_covariance.clone(),
        }
    }
}

/// Sibling file of the output prefix: `<prefix>.<suffix>`
fn prefixed(prefix: &Path, suffix: &str) -> PathBuf {
    PathBuf::from(format!("{}.{}", prefix.display(), suffix))
}

fn write_histogram(path: &Path, histogram: &PvalueHistogram) -> anyhow::Result<()> {
    let mut out = BufWriter::new(File::create(path).with_context(|| format!("creating {:?}", path))?);
    writeln!(out, "bin_start\tbin_end\tcount")?;
    for (b, count) in histogram.counts().iter().enumerate() {
        let (lo, hi) = histogram.edges(b);
        writeln!(out, "{}\t{}\t{}", lo, hi, count)?;
    }
    out.flush()?;
    Ok(())
}

fn write_min_pvalues(path: &Path, header: &str, values: &[(String, f64)]) -> anyhow::Result<()> {
    let mut out = BufWriter::new(File::create(path).with_context(|| format!("creating {:?}", path))?);
    writeln!(out, "{}\tmin_pvalue", header)?;
    for (id, p) in values {
        if p.is_nan() {
            writeln!(out, "{}\tNA", id)?;
        } else {
            writeln!(out, "{}\t{}", id, p)?;
        }
    }
    out.flush()?;
    Ok(())
}

fn write_extras(prefix: &Path, summary: &ScanSummary) -> anyhow::Result<()> {
    for category in &summary.categories {
        if let Some(histogram) = &category.histogram {
            let path = prefixed(prefix, &format!("{}.histogram.tsv", category.category));
            write_histogram(&path, histogram)?;
        }
    }
    if let Some(MinPvalues { variants, traits }) = &summary.min_pvalues {
        write_min_pvalues(&prefixed(prefix, "variant_min_pvalue.tsv"), "variant", variants)?;
        write_min_pvalues(&prefixed(prefix, "trait_min_pvalue.tsv"), "trait", traits)?;
    }
    Ok(())
}

fn print_statistics(summary: &ScanSummary) {
    eprintln!("\n=== Scan Statistics ===");
    eprintln!("Model:           {}", summary.model);
    eprintln!("Samples:         {}", summary.n_samples);
    eprintln!("Variants:        {}", summary.n_variants);
    eprintln!("Traits:          {}", summary.n_traits);
    eprintln!("Covariates:      {}", summary.n_covariates);
    eprintln!("Skipped pairs:   {}", summary.skipped_pairs);
    if summary.proximity {
        eprintln!("Excluded pairs:  {}", summary.excluded_pairs);
    }
    for category in [Category::All, Category::Local, Category::Distant] {
        if let Some(c) = summary.category(category) {
            eprintln!(
                "{:<8} tested: {}, accepted: {} (p <= {})",
                format!("{}:", category),
                c.tested,
                c.accepted,
                c.threshold
            );
        }
    }
    eprintln!("Time elapsed:    {:.2}s", summary.elapsed.as_secs_f64());
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.run_config()?;

    let filter = if config.verbose { "info" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();

    let start = Instant::now();
    eprintln!("Scanning {:?} against {:?} ({} model)", cli.variants, cli.traits, config.model);

    let mut orchestrator = Orchestrator::new(config);
    let summary = orchestrator.run_files(&cli.input_files(), &OutputTargets::with_prefix(&cli.output))?;

    write_extras(&cli.output, &summary)?;
    print_statistics(&summary);
    log::info!("Finished in {:.2}s", start.elapsed().as_secs_f64());
    Ok(())
}
