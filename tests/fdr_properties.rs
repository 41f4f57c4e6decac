//! FDR correction property tests
//!
//! Tests for the p-value histogram, exact Benjamini-Hochberg and the
//! histogram-based estimate.

use fast_eqtl::core::{ExactFdr, FdrCorrector, HistogramFdr, PvalueHistogram};
use proptest::prelude::*;

// ============================================================================
// Generators
// ============================================================================

fn arb_pvalue() -> impl Strategy<Value = f64> {
    prop_oneof![
        0.0f64..=1.0,
        (1u32..300).prop_map(|e| 10f64.powi(-(e as i32))),
        Just(0.0),
        Just(1.0),
    ]
}

fn arb_pvalues() -> impl Strategy<Value = Vec<f64>> {
    prop::collection::vec(arb_pvalue(), 1..400)
}

/// Textbook step-up adjustment over every tested p-value
fn reference_q(all: &[f64], p: f64) -> f64 {
    let mut sorted = all.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let m = sorted.len() as f64;
    let mut best: f64 = 1.0;
    for (i, &x) in sorted.iter().enumerate() {
        if x >= p {
            best = best.min(x * m / (i + 1) as f64);
        }
    }
    best.max(p).min(1.0)
}

fn histogram_of(pvalues: &[f64], bins: usize) -> PvalueHistogram {
    let mut h = PvalueHistogram::new(bins);
    for &p in pvalues {
        h.add(p);
    }
    h
}

// ============================================================================
// Property Tests
// ============================================================================

proptest! {
    /// Property: merged shards count every p-value exactly once
    #[test]
    fn test_histogram_merge_counts(pvalues in arb_pvalues(), bins in 1usize..200, split in 0usize..400) {
        let split = split.min(pvalues.len());
        let mut left = histogram_of(&pvalues[..split], bins);
        let right = histogram_of(&pvalues[split..], bins);
        left.merge(&right);

        prop_assert_eq!(left.total(), pvalues.len() as u64);
        prop_assert_eq!(left, histogram_of(&pvalues, bins));
    }

    /// Property: exact q-values lie in [p, 1]
    #[test]
    fn test_exact_q_bounds(pvalues in arb_pvalues(), threshold in 0.001f64..=1.0) {
        let accepted: Vec<f64> = pvalues.iter().copied().filter(|&p| p <= threshold).collect();
        let fdr = ExactFdr::new(accepted.clone(), pvalues.len() as u64);
        for &p in &accepted {
            let q = fdr.q_value(p);
            prop_assert!(q >= p, "q {} < p {}", q, p);
            prop_assert!(q <= 1.0);
        }
    }

    /// Property: exact q-values are non-decreasing in p
    #[test]
    fn test_exact_q_monotone(pvalues in arb_pvalues(), threshold in 0.001f64..=1.0) {
        let mut accepted: Vec<f64> = pvalues.iter().copied().filter(|&p| p <= threshold).collect();
        let fdr = ExactFdr::new(accepted.clone(), pvalues.len() as u64);
        accepted.sort_by(|a, b| a.total_cmp(b));
        for pair in accepted.windows(2) {
            prop_assert!(fdr.q_value(pair[0]) <= fdr.q_value(pair[1]));
        }
    }

    /// Property: with every p-value accepted, exact q-values are textbook BH
    #[test]
    fn test_exact_matches_full_list(pvalues in arb_pvalues()) {
        let fdr = ExactFdr::new(pvalues.clone(), pvalues.len() as u64);
        for &p in &pvalues {
            let expected = reference_q(&pvalues, p);
            prop_assert!((fdr.q_value(p) - expected).abs() <= 1e-12);
        }
    }

    /// Property: a threshold only ever raises q-values
    #[test]
    fn test_threshold_never_lowers_q(pvalues in arb_pvalues(), threshold in 0.001f64..=1.0) {
        let accepted: Vec<f64> = pvalues.iter().copied().filter(|&p| p <= threshold).collect();
        let partial = ExactFdr::new(accepted.clone(), pvalues.len() as u64);
        let full = ExactFdr::new(pvalues.clone(), pvalues.len() as u64);
        for &p in &accepted {
            prop_assert!(partial.q_value(p) + 1e-12 >= full.q_value(p));
        }
    }

    /// Property: histogram q-values lie in [p, 1] and never undercut exact ones
    #[test]
    fn test_histogram_q_conservative(pvalues in arb_pvalues(), bins in 1usize..200) {
        let approx = HistogramFdr::new(histogram_of(&pvalues, bins), 1.0);
        let exact = ExactFdr::new(pvalues.clone(), pvalues.len() as u64);
        for &p in &pvalues {
            let q = approx.q_value(p);
            prop_assert!(q >= p && q <= 1.0);
            prop_assert!(q + 1e-12 >= exact.q_value(p), "approx {} < exact {}", q, exact.q_value(p));
        }
    }

    /// Property: under a threshold, histogram q-values of accepted records
    /// never undercut exact ones computed from the accepted set
    #[test]
    fn test_histogram_q_conservative_under_threshold(
        pvalues in arb_pvalues(),
        bins in 1usize..200,
        threshold in 0.001f64..1.0,
    ) {
        let accepted: Vec<f64> = pvalues.iter().copied().filter(|&p| p <= threshold).collect();
        let approx = HistogramFdr::new(histogram_of(&pvalues, bins), threshold);
        let exact = ExactFdr::new(accepted.clone(), pvalues.len() as u64);
        for &p in &accepted {
            let q = approx.q_value(p);
            prop_assert!(q >= p && q <= 1.0);
            prop_assert!(q + 1e-12 >= exact.q_value(p), "approx {} < exact {}", q, exact.q_value(p));
        }
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[test]
fn test_single_bin_histogram() {
    let h = histogram_of(&[0.2, 0.4, 0.9], 1);
    assert_eq!(h.counts(), &[3]);
    let fdr = HistogramFdr::new(h, 1.0);
    // Rank of 0.2 is only known to be at least 1
    assert!((fdr.q_value(0.2) - 0.6).abs() < 1e-12);
    let exact = ExactFdr::new(vec![0.2, 0.4, 0.9], 3);
    assert!((exact.q_value(0.2) - 0.6).abs() < 1e-12);
}

#[test]
fn test_exact_without_accepted_values() {
    let fdr = ExactFdr::new(Vec::new(), 100);
    assert_eq!(fdr.q_value(0.5), 0.5);
}
