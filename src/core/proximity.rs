//! Local / distant classification of variant-trait pairs
//!
//! A pair is local when both features sit on the same chromosome and the
//! variant falls inside the trait interval extended by `radius` on both
//! sides (inclusive). Pairs with an unknown position on either side are
//! not classified at all.
//!
//! Block classification uses rust-lapper for O(log n + k) window queries:
//! each trait chunk keeps one interval tree of extended trait windows per
//! chromosome, and every variant of a chunk is a point query.

use crate::core::matrix::ChunkedMatrix;
use crate::core::output::Category;
use crate::core::position::{normalize_chrom_key, PositionIndex};
use ndarray::Array2;
use rust_lapper::{Interval, Lapper};
use std::collections::HashMap;

/// Extended trait window; value is the global trait row
pub type TraitWindow = Interval<u64, usize>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Span {
    chrom: u32,
    start: u64,
    end: u64,
}

/// Classifier over the rows of one variant and one trait matrix
pub struct ProximityClassifier {
    radius: u64,
    variant_pos: Vec<Option<(u32, u64)>>,
    trait_span: Vec<Option<Span>>,
    /// Trait chunk -> chromosome -> window tree
    windows: Vec<HashMap<u32, Lapper<u64, usize>>>,
    trait_chunk_size: usize,
}

impl ProximityClassifier {
    /// Resolve positions for every row and build the window trees
    pub fn new(
        positions: &PositionIndex,
        variants: &ChunkedMatrix,
        traits: &ChunkedMatrix,
        radius: u64,
    ) -> Self {
        let mut chrom_ids: HashMap<String, u32> = HashMap::new();
        let mut chrom_id = |chrom: &str| -> u32 {
            let key = normalize_chrom_key(chrom);
            let next = chrom_ids.len() as u32;
            *chrom_ids.entry(key).or_insert(next)
        };

        let variant_pos: Vec<Option<(u32, u64)>> = variants
            .feature_ids()
            .iter()
            .map(|id| positions.variant(id).map(|p| (chrom_id(&p.chrom), p.pos)))
            .collect();

        let trait_span: Vec<Option<Span>> = traits
            .feature_ids()
            .iter()
            .map(|id| {
                positions.trait_interval(id).map(|t| Span {
                    chrom: chrom_id(&t.chrom),
                    start: t.start,
                    end: t.end,
                })
            })
            .collect();

        let trait_chunk_size = traits.chunk_size();
        let windows = traits
            .chunks()
            .map(|chunk| {
                let mut by_chrom: HashMap<u32, Vec<TraitWindow>> = HashMap::new();
                for row in chunk.row_offset..chunk.row_offset + chunk.n_rows() {
                    if let Some(span) = trait_span[row] {
                        by_chrom.entry(span.chrom).or_default().push(Interval {
                            start: span.start.saturating_sub(radius),
                            stop: span.end.saturating_add(radius).saturating_add(1),
                            val: row,
                        });
                    }
                }
                by_chrom
                    .into_iter()
                    .map(|(chrom, intervals)| (chrom, Lapper::new(intervals)))
                    .collect()
            })
            .collect();

        Self {
            radius,
            variant_pos,
            trait_span,
            windows,
            trait_chunk_size,
        }
    }

    pub fn radius(&self) -> u64 {
        self.radius
    }

    /// Variants with a known position
    pub fn positioned_variants(&self) -> usize {
        self.variant_pos.iter().filter(|p| p.is_some()).count()
    }

    /// Traits with a known interval
    pub fn positioned_traits(&self) -> usize {
        self.trait_span.iter().filter(|p| p.is_some()).count()
    }

    /// Classify one pair by global row indexes
    pub fn classify(&self, variant_row: usize, trait_row: usize) -> Option<Category> {
        let (chrom, pos) = (*self.variant_pos.get(variant_row)?)?;
        let span = (*self.trait_span.get(trait_row)?)?;

        let local = chrom == span.chrom
            && pos >= span.start.saturating_sub(self.radius)
            && pos <= span.end.saturating_add(self.radius);
        Some(if local { Category::Local } else { Category::Distant })
    }

    /// Categories of all pairs of a variant row range and a trait chunk
    ///
    /// `None` marks pairs excluded for lack of a position.
    pub fn categorize_block(
        &self,
        variant_offset: usize,
        variant_rows: usize,
        trait_chunk: usize,
        trait_rows: usize,
    ) -> Array2<Option<Category>> {
        let trait_offset = trait_chunk * self.trait_chunk_size;
        let mut block = Array2::from_elem((variant_rows, trait_rows), None);

        for j in 0..trait_rows {
            if self.trait_span[trait_offset + j].is_none() {
                continue;
            }
            for i in 0..variant_rows {
                if self.variant_pos[variant_offset + i].is_some() {
                    block[[i, j]] = Some(Category::Distant);
                }
            }
        }

        let Some(trees) = self.windows.get(trait_chunk) else {
            return block;
        };
        for i in 0..variant_rows {
            let Some((chrom, pos)) = self.variant_pos[variant_offset + i] else {
                continue;
            };
            if let Some(tree) = trees.get(&chrom) {
                for window in tree.find(pos, pos + 1) {
                    block[[i, window.val - trait_offset]] = Some(Category::Local);
                }
            }
        }
        block
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(radius: u64) -> ProximityClassifier {
        let variants = ChunkedMatrix::from_rows(
            vec![
                ("rs_in", [0.0, 1.0]),
                ("rs_edge", [0.0, 1.0]),
                ("rs_past", [0.0, 1.0]),
                ("rs_other_chrom", [0.0, 1.0]),
                ("rs_unplaced", [0.0, 1.0]),
            ],
            2,
        )
        .unwrap();
        let traits =
            ChunkedMatrix::from_rows(vec![("GENE", [0.0, 1.0]), ("GENE2", [0.0, 1.0])], 1).unwrap();

        let mut positions = PositionIndex::new();
        positions.insert_variant("rs_in", "chr1", 1500);
        positions.insert_variant("rs_edge", "chr1", 2000 + radius);
        positions.insert_variant("rs_past", "1", 2000 + radius + 1);
        positions.insert_variant("rs_other_chrom", "chr2", 1500);
        positions.insert_trait("GENE", "chr1", 1000, 2000);
        positions.insert_trait("GENE2", "chr2", 100_000, 100_010);

        ProximityClassifier::new(&positions, &variants, &traits, radius)
    }

    #[test]
    fn test_boundary_is_inclusive() {
        let c = setup(100);
        assert_eq!(c.classify(0, 0), Some(Category::Local));
        assert_eq!(c.classify(1, 0), Some(Category::Local));
        assert_eq!(c.classify(2, 0), Some(Category::Distant));
        assert_eq!(c.classify(3, 0), Some(Category::Distant));
        assert_eq!(c.classify(4, 0), None);
    }

    #[test]
    fn test_left_boundary() {
        let variants = ChunkedMatrix::from_rows(vec![("a", [0.0]), ("b", [0.0])], 4).unwrap();
        let traits = ChunkedMatrix::from_rows(vec![("g", [0.0])], 4).unwrap();
        let mut positions = PositionIndex::new();
        positions.insert_variant("a", "chr3", 900);
        positions.insert_variant("b", "chr3", 899);
        positions.insert_trait("g", "chr3", 1000, 1200);

        let c = ProximityClassifier::new(&positions, &variants, &traits, 100);
        assert_eq!(c.classify(0, 0), Some(Category::Local));
        assert_eq!(c.classify(1, 0), Some(Category::Distant));
    }

    #[test]
    fn test_block_agrees_with_pairwise() {
        let c = setup(100);
        for (v_offset, v_rows) in [(0usize, 2usize), (2, 2), (4, 1)] {
            for t_chunk in 0..2 {
                let block = c.categorize_block(v_offset, v_rows, t_chunk, 1);
                for i in 0..v_rows {
                    assert_eq!(block[[i, 0]], c.classify(v_offset + i, t_chunk));
                }
            }
        }
    }

    #[test]
    fn test_zero_radius() {
        let c = setup(0);
        assert_eq!(c.classify(1, 0), Some(Category::Local));
        assert_eq!(c.classify(2, 0), Some(Category::Distant));
        assert_eq!(c.positioned_variants(), 4);
        assert_eq!(c.positioned_traits(), 2);
    }
}
