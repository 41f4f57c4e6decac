//! Chunk-pair scan
//!
//! For one variant chunk at a time, every trait chunk is evaluated on the
//! worker pool. Each evaluation computes a block of statistics, assigns a
//! category to every pair, counts tested p-values into per-thread
//! histogram shards and appends passing records to the category's sink.
//! The only state shared between workers is the sinks (locked per batch),
//! the cancel flag and the per-feature minima (atomics).

use crate::core::fdr::{ExactFdr, FdrCorrector, HistogramFdr, PvalueHistogram};
use crate::core::model::AssociationModel;
use crate::core::output::{open_sink, AssociationRecord, Category, RecordSink, SinkOutput, SinkTarget};
use crate::core::proximity::ProximityClassifier;
use crate::core::residual::{CovariateSpace, PreparedChunk, PreparedMatrix};
use log::{debug, info};
use parking_lot::Mutex;
use rayon::prelude::*;
use std::cell::RefCell;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thread_local::ThreadLocal;

/// Cooperative abort flag, checked between chunk-pair evaluations
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// Clear a pending request
    pub fn reset(&self) {
        self.0.store(false, Ordering::Relaxed);
    }
}

/// Output channel of one category: threshold, sink and, for exact FDR,
/// the p-values of every accepted record
pub struct CategoryChannel {
    category: Category,
    threshold: f64,
    sink: Box<dyn RecordSink>,
    accepted: Option<Mutex<Vec<f64>>>,
}

impl CategoryChannel {
    pub fn open(category: Category, threshold: f64, target: &SinkTarget, exact_fdr: bool) -> io::Result<Self> {
        Ok(Self::new(category, threshold, open_sink(category, target)?, exact_fdr))
    }

    pub fn new(category: Category, threshold: f64, sink: Box<dyn RecordSink>, exact_fdr: bool) -> Self {
        Self {
            category,
            threshold,
            sink,
            accepted: exact_fdr.then(|| Mutex::new(Vec::new())),
        }
    }

    pub fn category(&self) -> Category {
        self.category
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn sink_name(&self) -> String {
        self.sink.name()
    }

    pub fn path(&self) -> Option<&Path> {
        self.sink.path()
    }

    /// Records accepted so far
    pub fn accepted(&self) -> usize {
        self.sink.len()
    }

    fn emit(&self, records: &[AssociationRecord]) -> io::Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        self.sink.append(records)?;
        if let Some(accepted) = &self.accepted {
            accepted.lock().extend(records.iter().map(|r| r.pvalue));
        }
        Ok(())
    }

    /// Compute q-values against `histogram` (all tested p-values of this
    /// category) and write the final output
    pub fn finish(self, histogram: &PvalueHistogram) -> io::Result<SinkOutput> {
        let fdr: Box<dyn FdrCorrector> = match self.accepted {
            Some(accepted) => Box::new(ExactFdr::new(accepted.into_inner(), histogram.total())),
            None => Box::new(HistogramFdr::new(histogram.clone(), self.threshold)),
        };
        self.sink.finish(fdr.as_ref())
    }
}

/// Sink write failure inside the scan
#[derive(Debug)]
pub struct SinkFailure {
    pub sink: String,
    pub source: io::Error,
}

/// Everything one scan reads
pub struct ScanPlan<'a> {
    pub model: &'a dyn AssociationModel,
    pub space: &'a CovariateSpace,
    pub variants: &'a PreparedMatrix,
    pub traits: &'a PreparedMatrix,
    pub variant_ids: &'a [String],
    pub trait_ids: &'a [String],
    /// Proximity mode when present, exhaustive mode otherwise
    pub classifier: Option<&'a ProximityClassifier>,
}

/// Counts of one category after the scan
#[derive(Debug, Clone)]
pub struct CategoryTally {
    pub category: Category,
    pub tested: u64,
    pub histogram: PvalueHistogram,
}

/// Smallest tested p-value of every variant and trait; `NaN` if never tested
#[derive(Debug, Clone, Default)]
pub struct FeatureMinima {
    pub variants: Vec<f64>,
    pub traits: Vec<f64>,
}

/// Aggregated result of a scan
#[derive(Debug, Clone)]
pub struct ScanTally {
    pub categories: Vec<CategoryTally>,
    /// Pairs with an untestable (degenerate) feature row
    pub skipped_pairs: u64,
    /// Pairs without a known position in proximity mode
    pub excluded_pairs: u64,
    pub chunk_pairs: u64,
    pub aborted: bool,
    pub minima: Option<FeatureMinima>,
}

impl ScanTally {
    pub fn category(&self, category: Category) -> Option<&CategoryTally> {
        self.categories.iter().find(|c| c.category == category)
    }

    pub fn tested_pairs(&self) -> u64 {
        self.categories.iter().map(|c| c.tested).sum()
    }
}

/// Per-thread counters, merged after the scan
struct Shard {
    tested: [u64; Category::COUNT],
    histograms: Vec<PvalueHistogram>,
    skipped: u64,
    excluded: u64,
    chunk_pairs: u64,
}

impl Shard {
    fn new(bins: usize) -> Self {
        Self {
            tested: [0; Category::COUNT],
            histograms: (0..Category::COUNT).map(|_| PvalueHistogram::new(bins)).collect(),
            skipped: 0,
            excluded: 0,
            chunk_pairs: 0,
        }
    }
}

/// Lock-free running minimum of a non-negative f64
///
/// Bit patterns of non-negative floats order like their values.
struct AtomicMin(Vec<AtomicU64>);

impl AtomicMin {
    fn new(len: usize) -> Self {
        Self((0..len).map(|_| AtomicU64::new(f64::INFINITY.to_bits())).collect())
    }

    fn update(&self, index: usize, p: f64) {
        self.0[index].fetch_min(p.abs().to_bits(), Ordering::Relaxed);
    }

    fn into_values(self) -> Vec<f64> {
        self.0
            .into_iter()
            .map(|bits| {
                let v = f64::from_bits(bits.into_inner());
                if v.is_infinite() {
                    f64::NAN
                } else {
                    v
                }
            })
            .collect()
    }
}

/// Chunk-pair scan driver
pub struct ScanEngine<'a> {
    plan: ScanPlan<'a>,
    channels: &'a [CategoryChannel],
    /// Category index -> channel index
    routes: [Option<usize>; Category::COUNT],
    histogram_bins: usize,
    cancel: CancelToken,
    minima: Option<(AtomicMin, AtomicMin)>,
}

impl<'a> ScanEngine<'a> {
    pub fn new(
        plan: ScanPlan<'a>,
        channels: &'a [CategoryChannel],
        histogram_bins: usize,
        track_minima: bool,
        cancel: CancelToken,
    ) -> Self {
        let mut routes = [None; Category::COUNT];
        for (i, channel) in channels.iter().enumerate() {
            routes[channel.category.index()] = Some(i);
        }
        let minima = track_minima.then(|| {
            (
                AtomicMin::new(plan.variants.n_features),
                AtomicMin::new(plan.traits.n_features),
            )
        });
        Self {
            plan,
            channels,
            routes,
            histogram_bins,
            cancel,
            minima,
        }
    }

    /// Run the nested chunk loop on `pool`
    ///
    /// Returns early with the partial tally when cancelled.
    pub fn run(self, pool: &rayon::ThreadPool) -> Result<ScanTally, SinkFailure> {
        let shards: ThreadLocal<RefCell<Shard>> = ThreadLocal::new();
        let n_variant_chunks = self.plan.variants.chunks.len();
        let mut aborted = false;

        for (k, variant_chunk) in self.plan.variants.chunks.iter().enumerate() {
            if self.cancel.is_cancelled() {
                aborted = true;
                break;
            }
            info!(
                "Scanning variant chunk {}/{} ({} rows)",
                k + 1,
                n_variant_chunks,
                variant_chunk.n_rows()
            );

            pool.install(|| {
                self.plan.traits.chunks.par_iter().try_for_each(|trait_chunk| {
                    if self.cancel.is_cancelled() {
                        return Ok(());
                    }
                    let shard = shards.get_or(|| RefCell::new(Shard::new(self.histogram_bins)));
                    self.scan_pair(variant_chunk, trait_chunk, shard)
                })
            })?;
        }
        if self.cancel.is_cancelled() {
            aborted = true;
        }

        Ok(self.merge(shards, aborted))
    }

    /// Evaluate one variant chunk against one trait chunk
    fn scan_pair(
        &self,
        variants: &PreparedChunk,
        traits: &PreparedChunk,
        shard: &RefCell<Shard>,
    ) -> Result<(), SinkFailure> {
        let block = self.plan.model.test_block(variants, traits, self.plan.space);
        let categories = self.plan.classifier.map(|c| {
            c.categorize_block(variants.row_offset, variants.n_rows(), traits.index, traits.n_rows())
        });
        let mut batches: Vec<Vec<AssociationRecord>> = vec![Vec::new(); self.channels.len()];

        {
            let mut shard = shard.borrow_mut();
            shard.chunk_pairs += 1;
            let (rows, cols) = block.dim();
            for i in 0..rows {
                let v_row = variants.row_offset + i;
                for j in 0..cols {
                    let t_row = traits.row_offset + j;
                    let category = match &categories {
                        Some(categories) => match categories[[i, j]] {
                            Some(category) => category,
                            None => {
                                shard.excluded += 1;
                                continue;
                            }
                        },
                        None => Category::All,
                    };

                    let p = block.pvalue[[i, j]];
                    if p.is_nan() {
                        shard.skipped += 1;
                        continue;
                    }

                    let slot = category.index();
                    shard.tested[slot] += 1;
                    shard.histograms[slot].add(p);
                    if let Some((min_v, min_t)) = &self.minima {
                        min_v.update(v_row, p);
                        min_t.update(t_row, p);
                    }

                    let Some(route) = self.routes[slot] else {
                        continue;
                    };
                    if p <= self.channels[route].threshold {
                        batches[route].push(AssociationRecord {
                            variant: self.plan.variant_ids[v_row].clone(),
                            trait_id: self.plan.trait_ids[t_row].clone(),
                            statistic: block.statistic[[i, j]],
                            pvalue: p,
                            qvalue: f64::NAN,
                            effect_size: block.effect_size[[i, j]],
                        });
                    }
                }
            }
        }

        for (channel, batch) in self.channels.iter().zip(&batches) {
            channel.emit(batch).map_err(|source| SinkFailure {
                sink: channel.sink_name(),
                source,
            })?;
        }
        Ok(())
    }

    fn merge(self, shards: ThreadLocal<RefCell<Shard>>, aborted: bool) -> ScanTally {
        let mut total = Shard::new(self.histogram_bins);
        for shard in shards.into_iter() {
            let shard = shard.into_inner();
            for slot in 0..Category::COUNT {
                total.tested[slot] += shard.tested[slot];
                total.histograms[slot].merge(&shard.histograms[slot]);
            }
            total.skipped += shard.skipped;
            total.excluded += shard.excluded;
            total.chunk_pairs += shard.chunk_pairs;
        }
        debug!(
            "Merged scan shards: {} chunk pairs, {} skipped, {} excluded",
            total.chunk_pairs, total.skipped, total.excluded
        );

        let categories = self
            .channels
            .iter()
            .map(|channel| {
                let slot = channel.category.index();
                CategoryTally {
                    category: channel.category,
                    tested: total.tested[slot],
                    histogram: total.histograms[slot].clone(),
                }
            })
            .collect();

        let minima = self.minima.map(|(v, t)| FeatureMinima {
            variants: v.into_values(),
            traits: t.into_values(),
        });

        ScanTally {
            categories,
            skipped_pairs: total.skipped,
            excluded_pairs: total.excluded,
            chunk_pairs: total.chunk_pairs,
            aborted,
            minima,
        }
    }
}
