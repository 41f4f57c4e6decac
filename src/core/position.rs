//! Genomic positions of variants and traits
//!
//! Variants sit at a single coordinate, traits span an interval. Lookups
//! are by feature identifier; chromosome names are compared after
//! normalization so `chr1`, `Chr1` and `1` refer to the same sequence.

use std::collections::HashMap;

/// Position of a variant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantPosition {
    pub chrom: String,
    pub pos: u64,
}

/// Interval of a trait (gene body, probe, peak)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraitInterval {
    pub chrom: String,
    pub start: u64,
    pub end: u64,
}

/// Feature identifier -> genomic coordinate
#[derive(Debug, Clone, Default)]
pub struct PositionIndex {
    variants: HashMap<String, VariantPosition>,
    traits: HashMap<String, TraitInterval>,
}

impl PositionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a variant position; a repeated id replaces the earlier entry
    pub fn insert_variant(&mut self, id: impl Into<String>, chrom: impl Into<String>, pos: u64) {
        self.variants.insert(
            id.into(),
            VariantPosition {
                chrom: chrom.into(),
                pos,
            },
        );
    }

    /// Record a trait interval; `start` and `end` are swapped if reversed
    pub fn insert_trait(&mut self, id: impl Into<String>, chrom: impl Into<String>, start: u64, end: u64) {
        self.traits.insert(
            id.into(),
            TraitInterval {
                chrom: chrom.into(),
                start: start.min(end),
                end: start.max(end),
            },
        );
    }

    pub fn variant(&self, id: &str) -> Option<&VariantPosition> {
        self.variants.get(id)
    }

    pub fn trait_interval(&self, id: &str) -> Option<&TraitInterval> {
        self.traits.get(id)
    }

    pub fn n_variants(&self) -> usize {
        self.variants.len()
    }

    pub fn n_traits(&self) -> usize {
        self.traits.len()
    }
}

/// Normalize chromosome name for flexible matching
///
/// Converts to lowercase and removes the `chr` prefix.
pub fn normalize_chrom_key(chrom: &str) -> String {
    let lower = chrom.to_lowercase();
    match lower.strip_prefix("chr") {
        Some(rest) => rest.to_string(),
        None => lower,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup() {
        let mut index = PositionIndex::new();
        index.insert_variant("rs1", "chr1", 1000);
        index.insert_trait("GENE1", "chr1", 2000, 1500);

        assert_eq!(index.variant("rs1").unwrap().pos, 1000);
        let gene = index.trait_interval("GENE1").unwrap();
        assert_eq!((gene.start, gene.end), (1500, 2000));
        assert!(index.variant("rs2").is_none());
        assert_eq!(index.n_variants(), 1);
        assert_eq!(index.n_traits(), 1);
    }

    #[test]
    fn test_chrom_name_variants() {
        assert_eq!(normalize_chrom_key("chr1"), "1");
        assert_eq!(normalize_chrom_key("CHR1"), "1");
        assert_eq!(normalize_chrom_key("Chr1"), "1");
        assert_eq!(normalize_chrom_key("1"), "1");
        assert_eq!(normalize_chrom_key("chrX"), "x");
    }
}
