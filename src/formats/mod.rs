//! File format adapters
//!
//! Readers for delimited text matrices and position annotations.

pub mod matrix;
pub mod positions;

pub use matrix::{read_matrix, read_matrix_from, read_square_matrix};
pub use positions::{read_positions, read_trait_positions, read_variant_positions};
