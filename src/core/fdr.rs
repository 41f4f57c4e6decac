//! P-value histogram and Benjamini-Hochberg correction
//!
//! Two interchangeable correctors turn raw p-values of accepted records
//! into q-values:
//!
//! - [`ExactFdr`] keeps the sorted p-values of every accepted record. With
//!   a raw p-value threshold, accepted records are exactly the smallest
//!   p-values of their category, so their ranks among all tested pairs are
//!   known. The step-up minimum runs over the accepted records only; with a
//!   threshold of 1 this is textbook Benjamini-Hochberg.
//! - [`HistogramFdr`] only keeps bin counts and bounds a p-value's rank
//!   from below by the counts of the lower bins. It only uses bins that hold
//!   accepted p-values, so it bounds the same quantity as [`ExactFdr`] for
//!   any threshold. Memory is bounded by the number of bins, at the cost of
//!   larger q-values.

/// Default number of histogram bins
pub const DEFAULT_HISTOGRAM_BINS: usize = 100;

/// Equal-width histogram of p-values over [0, 1]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PvalueHistogram {
    counts: Vec<u64>,
}

impl PvalueHistogram {
    pub fn new(bins: usize) -> Self {
        Self {
            counts: vec![0; bins.max(1)],
        }
    }

    pub fn bins(&self) -> usize {
        self.counts.len()
    }

    /// Bin holding `p`; p = 1 falls in the last bin
    pub fn bin_of(&self, p: f64) -> usize {
        let bins = self.counts.len();
        let b = (p.clamp(0.0, 1.0) * bins as f64) as usize;
        b.min(bins - 1)
    }

    /// Count one tested p-value
    pub fn add(&mut self, p: f64) {
        let b = self.bin_of(p);
        self.counts[b] += 1;
    }

    /// Add the counts of another histogram with the same bins
    pub fn merge(&mut self, other: &PvalueHistogram) {
        for (a, b) in self.counts.iter_mut().zip(&other.counts) {
            *a += b;
        }
    }

    /// Total number of counted p-values
    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    pub fn counts(&self) -> &[u64] {
        &self.counts
    }

    /// Lower and upper edge of bin `b`
    pub fn edges(&self, b: usize) -> (f64, f64) {
        let bins = self.counts.len() as f64;
        (b as f64 / bins, (b + 1) as f64 / bins)
    }

    /// Counts of bins `0..=b`
    pub fn cumulative(&self) -> Vec<u64> {
        self.counts
            .iter()
            .scan(0u64, |acc, c| {
                *acc += c;
                Some(*acc)
            })
            .collect()
    }
}

/// Adjust raw p-values of accepted records to q-values
pub trait FdrCorrector: Send + Sync {
    fn q_value(&self, p: f64) -> f64;
}

/// Exact Benjamini-Hochberg from the sorted accepted p-values
#[derive(Debug, Clone)]
pub struct ExactFdr {
    sorted: Vec<f64>,
    /// q-value at each sorted position (step-up cumulative minimum)
    adjusted: Vec<f64>,
}

impl ExactFdr {
    /// `accepted` are the p-values of all accepted records of a category,
    /// `tested` the number of tested pairs of that category.
    pub fn new(mut accepted: Vec<f64>, tested: u64) -> Self {
        accepted.retain(|p| !p.is_nan());
        accepted.sort_by(|a, b| a.total_cmp(b));
        let m = tested.max(accepted.len() as u64) as f64;

        let mut adjusted = vec![0.0; accepted.len()];
        let mut running = 1.0f64;
        for i in (0..accepted.len()).rev() {
            // Ties share the rank of the last tied position
            let q = accepted[i] * m / (i + 1) as f64;
            running = running.min(q);
            adjusted[i] = running.max(accepted[i]);
        }

        Self {
            sorted: accepted,
            adjusted,
        }
    }
}

impl FdrCorrector for ExactFdr {
    fn q_value(&self, p: f64) -> f64 {
        // Last position with sorted[i] <= p
        let rank = self.sorted.partition_point(|&x| x <= p);
        if rank == 0 {
            return p.clamp(0.0, 1.0);
        }
        self.adjusted[rank - 1]
    }
}

/// Approximate Benjamini-Hochberg from histogram counts
///
/// Every candidate term is an upper bound of an exact step-up term over
/// accepted p-values, so the estimate never falls below the [`ExactFdr`]
/// q-value of the same category and threshold.
#[derive(Debug, Clone)]
pub struct HistogramFdr {
    histogram: PvalueHistogram,
    cumulative: Vec<u64>,
    /// Minimum over accepted bins `b..` of `upper_edge * m / cumulative`
    tail_min: Vec<f64>,
    total: f64,
}

impl HistogramFdr {
    /// `histogram` counts every tested p-value of a category, `threshold`
    /// is the raw p-value threshold its records were accepted with.
    pub fn new(histogram: PvalueHistogram, threshold: f64) -> Self {
        let cumulative = histogram.cumulative();
        let total = histogram.total() as f64;
        let bins = histogram.bins();
        let threshold = threshold.clamp(0.0, 1.0);
        let threshold_bin = histogram.bin_of(threshold);

        let mut tail_min = vec![1.0_f64; bins + 1];
        for b in (0..bins).rev() {
            let upper = histogram.edges(b).1;
            let edge_q = if upper <= threshold && cumulative[b] > 0 {
                // Whole bin accepted: the largest value up to here has rank cumulative[b]
                upper * total / cumulative[b] as f64
            } else if b == threshold_bin && b > 0 && cumulative[b - 1] > 0 {
                // Largest accepted value is <= threshold with rank >= cumulative[b - 1]
                threshold * total / cumulative[b - 1] as f64
            } else {
                1.0
            };
            tail_min[b] = tail_min[b + 1].min(edge_q);
        }

        Self {
            histogram,
            cumulative,
            tail_min,
            total,
        }
    }
}

impl FdrCorrector for HistogramFdr {
    fn q_value(&self, p: f64) -> f64 {
        let b = self.histogram.bin_of(p);
        let below = if b == 0 { 0 } else { self.cumulative[b - 1] };
        let q = (p * self.total / (below + 1) as f64)
            .min(self.tail_min[b])
            .min(1.0);
        q.max(p)
    }
}
