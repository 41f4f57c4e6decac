//! Chunked feature-by-sample matrix store
//!
//! A matrix is held as a sequence of dense row blocks so that every stage
//! downstream (residualization, block products, output) works on a bounded
//! slice of features at a time. Stores are immutable once built and cheap
//! to clone, so one store can be shared read-only across concurrent runs.

use crate::core::error::{AlignmentError, InputFormatError, InputResult};
use ndarray::{Array2, ArrayView1, ArrayView2};
use std::collections::HashSet;
use std::sync::Arc;

/// Default number of feature rows per chunk
pub const DEFAULT_CHUNK_SIZE: usize = 2000;

/// Immutable chunked matrix of features (rows) by samples (columns)
///
/// Missing cells are stored as `NaN`.
#[derive(Debug, Clone)]
pub struct ChunkedMatrix {
    feature_ids: Arc<[String]>,
    sample_ids: Option<Arc<[String]>>,
    chunks: Arc<[Array2<f64>]>,
    chunk_size: usize,
    n_samples: usize,
    missing_cells: usize,
}

/// Borrowed view of one chunk
#[derive(Debug, Clone, Copy)]
pub struct MatrixChunk<'a> {
    /// Chunk position in the sequence
    pub index: usize,
    /// Global index of the first row of this chunk
    pub row_offset: usize,
    /// Feature identifiers of the rows in this chunk
    pub ids: &'a [String],
    /// Dense rows x samples block
    pub data: ArrayView2<'a, f64>,
}

impl<'a> MatrixChunk<'a> {
    pub fn n_rows(&self) -> usize {
        self.data.nrows()
    }
}

impl ChunkedMatrix {
    /// Build a matrix from `(id, values)` rows
    pub fn from_rows<I, S, V>(rows: I, chunk_size: usize) -> InputResult<Self>
    where
        I: IntoIterator<Item = (S, V)>,
        S: Into<String>,
        V: AsRef<[f64]>,
    {
        let mut builder = MatrixBuilder::new(chunk_size);
        for (id, values) in rows {
            builder.push_row(id, values.as_ref())?;
        }
        builder.build()
    }

    /// An empty matrix (no features) over `n_samples` samples
    pub fn empty(n_samples: usize) -> Self {
        Self {
            feature_ids: Arc::from(Vec::new()),
            sample_ids: None,
            chunks: Arc::from(Vec::new()),
            chunk_size: DEFAULT_CHUNK_SIZE,
            n_samples,
            missing_cells: 0,
        }
    }

    /// Total number of features (rows)
    pub fn n_features(&self) -> usize {
        self.feature_ids.len()
    }

    /// Number of samples (columns)
    pub fn n_samples(&self) -> usize {
        self.n_samples
    }

    /// Number of chunks
    pub fn n_chunks(&self) -> usize {
        self.chunks.len()
    }

    /// Maximum rows per chunk
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Number of cells that were missing in the source
    pub fn missing_cells(&self) -> usize {
        self.missing_cells
    }

    /// Sample identifiers, when the source carried a header
    pub fn sample_ids(&self) -> Option<&[String]> {
        self.sample_ids.as_deref()
    }

    /// All feature identifiers in row order
    pub fn feature_ids(&self) -> &[String] {
        &self.feature_ids
    }

    /// Identifier of the feature at global row `index`
    pub fn feature_id(&self, index: usize) -> Option<&str> {
        self.feature_ids.get(index).map(|s| s.as_str())
    }

    /// View of chunk `index`
    pub fn chunk(&self, index: usize) -> Option<MatrixChunk<'_>> {
        let data = self.chunks.get(index)?;
        let row_offset = index * self.chunk_size;
        Some(MatrixChunk {
            index,
            row_offset,
            ids: &self.feature_ids[row_offset..row_offset + data.nrows()],
            data: data.view(),
        })
    }

    /// Lazy iterator over all chunks; each call starts from the first chunk
    pub fn chunks(&self) -> impl Iterator<Item = MatrixChunk<'_>> + '_ {
        (0..self.chunks.len()).filter_map(move |i| self.chunk(i))
    }

    /// View of the row at global index `index`
    pub fn row(&self, index: usize) -> Option<ArrayView1<'_, f64>> {
        if index >= self.n_features() {
            return None;
        }
        let chunk = &self.chunks[index / self.chunk_size];
        Some(chunk.row(index % self.chunk_size))
    }

    /// Same rows, partitioned into chunks of `chunk_size` rows
    pub fn rechunk(&self, chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        if chunk_size == self.chunk_size {
            return self.clone();
        }

        let n = self.n_samples;
        let mut chunks = Vec::with_capacity(self.n_features().div_ceil(chunk_size));
        let mut start = 0;
        while start < self.n_features() {
            let rows = chunk_size.min(self.n_features() - start);
            let mut block = Array2::zeros((rows, n));
            for (offset, mut dst) in block.rows_mut().into_iter().enumerate() {
                if let Some(src) = self.row(start + offset) {
                    dst.assign(&src);
                }
            }
            chunks.push(block);
            start += rows;
        }

        Self {
            feature_ids: Arc::clone(&self.feature_ids),
            sample_ids: self.sample_ids.clone(),
            chunks: Arc::from(chunks),
            chunk_size,
            n_samples: n,
            missing_cells: self.missing_cells,
        }
    }

    /// Check that `other` has the same sample columns, in the same order
    ///
    /// Sample identifiers are compared only when both matrices carry them.
    pub fn check_aligned(&self, other: &ChunkedMatrix, label: &str) -> Result<(), AlignmentError> {
        if other.n_samples != self.n_samples {
            return Err(AlignmentError::SampleCount {
                matrix: label.to_string(),
                expected: self.n_samples,
                found: other.n_samples,
            });
        }

        if let (Some(ours), Some(theirs)) = (self.sample_ids(), other.sample_ids()) {
            if let Some(column) = ours.iter().zip(theirs).position(|(a, b)| a != b) {
                return Err(AlignmentError::SampleId {
                    matrix: label.to_string(),
                    column: column + 1,
                    expected: ours[column].clone(),
                    found: theirs[column].clone(),
                });
            }
        }

        Ok(())
    }
}

/// Builder producing an immutable [`ChunkedMatrix`] row by row
#[derive(Debug)]
pub struct MatrixBuilder {
    chunk_size: usize,
    sample_ids: Option<Vec<String>>,
    feature_ids: Vec<String>,
    seen: HashSet<String>,
    n_samples: Option<usize>,
    pending: Vec<f64>,
    pending_rows: usize,
    chunks: Vec<Array2<f64>>,
    missing_cells: usize,
}

impl MatrixBuilder {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            sample_ids: None,
            feature_ids: Vec::new(),
            seen: HashSet::new(),
            n_samples: None,
            pending: Vec::new(),
            pending_rows: 0,
            chunks: Vec::new(),
            missing_cells: 0,
        }
    }

    /// Declare the sample identifiers; fixes the sample count
    pub fn with_sample_ids(mut self, ids: Vec<String>) -> Self {
        self.n_samples = Some(ids.len());
        self.sample_ids = Some(ids);
        self
    }

    /// Sample count fixed so far, if any
    pub fn n_samples(&self) -> Option<usize> {
        self.n_samples
    }

    /// Append one feature row
    pub fn push_row(&mut self, id: impl Into<String>, values: &[f64]) -> InputResult<()> {
        let id = id.into();
        if id.contains(['\t', '\n', '\r']) {
            return Err(InputFormatError::InvalidId(id));
        }

        match self.n_samples {
            Some(expected) if expected != values.len() => {
                if self.feature_ids.is_empty() && self.sample_ids.is_some() {
                    return Err(InputFormatError::HeaderWidth {
                        expected: values.len(),
                        found: expected,
                    });
                }
                return Err(InputFormatError::RaggedRow {
                    id,
                    expected,
                    found: values.len(),
                });
            }
            Some(_) => {}
            None => self.n_samples = Some(values.len()),
        }

        if !self.seen.insert(id.clone()) {
            return Err(InputFormatError::DuplicateId(id));
        }

        self.missing_cells += values.iter().filter(|v| v.is_nan()).count();
        self.pending.extend_from_slice(values);
        self.pending_rows += 1;
        self.feature_ids.push(id);

        if self.pending_rows == self.chunk_size {
            self.flush_chunk();
        }
        Ok(())
    }

    fn flush_chunk(&mut self) {
        if self.pending_rows == 0 {
            return;
        }
        let n = self.n_samples.unwrap_or(0);
        let mut block = Array2::zeros((self.pending_rows, n));
        if n > 0 {
            for (mut dst, src) in block.rows_mut().into_iter().zip(self.pending.chunks_exact(n)) {
                dst.assign(&ArrayView1::from(src));
            }
        }
        self.chunks.push(block);
        self.pending.clear();
        self.pending_rows = 0;
    }

    /// Finish building
    pub fn build(mut self) -> InputResult<ChunkedMatrix> {
        self.flush_chunk();
        Ok(ChunkedMatrix {
            feature_ids: Arc::from(self.feature_ids),
            sample_ids: self.sample_ids.map(Arc::from),
            chunks: Arc::from(self.chunks),
            chunk_size: self.chunk_size,
            n_samples: self.n_samples.unwrap_or(0),
            missing_cells: self.missing_cells,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_chunks_partition_rows() {
        let rows = (0..5).map(|i| (format!("f{}", i), vec![i as f64, 1.0, 2.0]));
        let matrix = ChunkedMatrix::from_rows(rows, 2).unwrap();

        assert_eq!(matrix.n_features(), 5);
        assert_eq!(matrix.n_samples(), 3);
        assert_eq!(matrix.n_chunks(), 3);

        let sizes: Vec<usize> = matrix.chunks().map(|c| c.n_rows()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);

        let last = matrix.chunk(2).unwrap();
        assert_eq!(last.row_offset, 4);
        assert_eq!(last.ids, &["f4".to_string()]);
        assert_eq!(last.data[[0, 0]], 4.0);
    }

    #[test]
    fn test_chunks_restartable() {
        let matrix = ChunkedMatrix::from_rows(vec![("a", [1.0, 2.0]), ("b", [3.0, 4.0])], 1).unwrap();
        let first: Vec<usize> = matrix.chunks().map(|c| c.index).collect();
        let second: Vec<usize> = matrix.chunks().map(|c| c.index).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_ragged_row_rejected() {
        let mut builder = MatrixBuilder::new(10);
        builder.push_row("a", &[1.0, 2.0, 3.0]).unwrap();
        let err = builder.push_row("b", &[1.0, 2.0]).unwrap_err();
        assert!(matches!(err, InputFormatError::RaggedRow { expected: 3, found: 2, .. }));
    }

    #[test]
    fn test_header_width_mismatch() {
        let mut builder = MatrixBuilder::new(10).with_sample_ids(ids(&["s1", "s2"]));
        let err = builder.push_row("a", &[1.0, 2.0, 3.0]).unwrap_err();
        assert!(matches!(err, InputFormatError::HeaderWidth { .. }));
    }

    #[test]
    fn test_id_with_tab_rejected() {
        let mut builder = MatrixBuilder::new(10);
        let err = builder.push_row("rs1\tA", &[1.0]).unwrap_err();
        assert!(matches!(err, InputFormatError::InvalidId(id) if id == "rs1\tA"));
        assert!(builder.push_row("rs1:A", &[1.0]).is_ok());
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let err = ChunkedMatrix::from_rows(vec![("a", [1.0]), ("a", [2.0])], 4).unwrap_err();
        assert!(matches!(err, InputFormatError::DuplicateId(id) if id == "a"));
    }

    #[test]
    fn test_missing_cells_counted() {
        let matrix =
            ChunkedMatrix::from_rows(vec![("a", [1.0, f64::NAN]), ("b", [f64::NAN, f64::NAN])], 4).unwrap();
        assert_eq!(matrix.missing_cells(), 3);
    }

    #[test]
    fn test_rechunk_preserves_rows() {
        let rows = (0..7).map(|i| (format!("f{}", i), vec![i as f64, -(i as f64)]));
        let matrix = ChunkedMatrix::from_rows(rows, 3).unwrap();
        let rechunked = matrix.rechunk(2);

        assert_eq!(rechunked.n_chunks(), 4);
        for i in 0..7 {
            assert_eq!(matrix.row(i), rechunked.row(i));
        }
        assert_eq!(rechunked.feature_id(6), Some("f6"));
    }

    #[test]
    fn test_alignment_checks_ids_and_order() {
        let mut a = MatrixBuilder::new(4).with_sample_ids(ids(&["s1", "s2", "s3"]));
        a.push_row("v", &[1.0, 2.0, 3.0]).unwrap();
        let a = a.build().unwrap();

        let mut b = MatrixBuilder::new(4).with_sample_ids(ids(&["s1", "s3", "s2"]));
        b.push_row("t", &[1.0, 2.0, 3.0]).unwrap();
        let b = b.build().unwrap();

        let err = a.check_aligned(&b, "trait").unwrap_err();
        assert!(matches!(err, AlignmentError::SampleId { column: 2, .. }));

        let short = ChunkedMatrix::from_rows(vec![("t", [1.0, 2.0])], 4).unwrap();
        assert!(matches!(
            a.check_aligned(&short, "trait"),
            Err(AlignmentError::SampleCount { expected: 3, found: 2, .. })
        ));

        // No header on one side: counts only
        let anonymous = ChunkedMatrix::from_rows(vec![("t", [1.0, 2.0, 3.0])], 4).unwrap();
        assert!(a.check_aligned(&anonymous, "trait").is_ok());
    }

    #[test]
    fn test_empty_matrix() {
        let matrix = ChunkedMatrix::empty(5);
        assert_eq!(matrix.n_features(), 0);
        assert_eq!(matrix.n_samples(), 5);
        assert_eq!(matrix.chunks().count(), 0);
    }
}
