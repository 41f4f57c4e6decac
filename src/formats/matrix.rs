//! Delimited text matrices
//!
//! Layout: `skip_rows` leading lines, the first of which is the sample
//! header, then one line per feature. The first of the `skip_columns`
//! leading columns is the feature id. The header may or may not carry a
//! corner cell above the id column; both are accepted.
//!
//! ```text
//! id      s1      s2      s3
//! rs1     0       1       2
//! rs2     1       NA      0
//! ```

use crate::core::config::MatrixFileOptions;
use crate::core::{InputFormatError, InputResult};
use crate::core::io::{LineReader, TextReader};
use crate::core::matrix::{ChunkedMatrix, MatrixBuilder};
use memchr::memchr;
use ndarray::Array2;
use std::io::BufRead;
use std::path::Path;

/// Field boundaries of one line, split on `delimiter`
fn split_fields(line: &[u8], delimiter: u8, bounds: &mut Vec<(usize, usize)>) {
    bounds.clear();
    let mut start = 0;
    loop {
        match memchr(delimiter, &line[start..]) {
            Some(offset) => {
                bounds.push((start, start + offset));
                start += offset + 1;
            }
            None => {
                bounds.push((start, line.len()));
                break;
            }
        }
    }
}

fn field_str(line: &[u8], (start, end): (usize, usize), line_number: usize) -> InputResult<&str> {
    std::str::from_utf8(&line[start..end])
        .map(str::trim)
        .map_err(|_| InputFormatError::InvalidUtf8(line_number))
}

/// Parse one cell; empty cells and the missing token become `NaN`
fn parse_cell(text: &str, missing: &str, line: usize, column: usize) -> InputResult<f64> {
    if text.is_empty() || text == missing {
        return Ok(f64::NAN);
    }
    text.parse::<f64>().map_err(|_| InputFormatError::InvalidNumber {
        line,
        column,
        value: text.to_string(),
    })
}

/// Read a matrix file, plain or compressed
pub fn read_matrix<P: AsRef<Path>>(
    path: P,
    options: &MatrixFileOptions,
    chunk_size: usize,
) -> InputResult<ChunkedMatrix> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(InputFormatError::FileNotFound(path.to_path_buf()));
    }
    let reader = TextReader::open_auto(path)?;
    read_matrix_from(reader, options, chunk_size)
}

/// Read a matrix from any buffered reader
pub fn read_matrix_from<R: BufRead>(
    reader: R,
    options: &MatrixFileOptions,
    chunk_size: usize,
) -> InputResult<ChunkedMatrix> {
    let delimiter = options
        .delimiter_byte()
        .map_err(|_| InputFormatError::Delimiter(options.delimiter))?;
    let mut lines = LineReader::new(reader);
    let mut bounds = Vec::with_capacity(256);

    // Header: first of the skipped lines
    let mut header: Option<Vec<String>> = None;
    for skipped in 0..options.skip_rows {
        let line_number = lines.line_number() + 1;
        let Some(line) = lines.next_line() else { break };
        let line = line?;
        if skipped == 0 {
            split_fields(line, delimiter, &mut bounds);
            let fields = bounds
                .iter()
                .map(|b| field_str(line, *b, line_number).map(str::to_string))
                .collect::<InputResult<Vec<_>>>()?;
            header = Some(fields);
        }
    }

    let mut builder = MatrixBuilder::new(chunk_size);
    let mut values: Vec<f64> = Vec::new();
    let mut data_rows = 0usize;

    loop {
        let line_number = lines.line_number() + 1;
        let Some(line) = lines.next_line() else { break };
        let line = line?;
        if line.iter().all(|b| b.is_ascii_whitespace()) {
            continue;
        }
        split_fields(line, delimiter, &mut bounds);
        if bounds.len() <= options.skip_columns && options.skip_columns > 0 {
            return Err(InputFormatError::TooFewFields {
                line: line_number,
                expected: options.skip_columns + 1,
                found: bounds.len(),
            });
        }

        if data_rows == 0 {
            if let Some(names) = header.take() {
                let ids = header_sample_ids(names, bounds.len(), options.skip_columns)?;
                builder = builder.with_sample_ids(ids);
            }
        }

        let id = if options.skip_columns > 0 {
            field_str(line, bounds[0], line_number)?.to_string()
        } else {
            format!("row{}", data_rows + 1)
        };

        values.clear();
        for (k, b) in bounds.iter().enumerate().skip(options.skip_columns) {
            let text = field_str(line, *b, line_number)?;
            values.push(parse_cell(text, &options.missing_token, line_number, k + 1)?);
        }
        builder.push_row(id, &values)?;
        data_rows += 1;
    }

    // Header only: keep the sample ids of an empty matrix
    if let Some(names) = header {
        builder = builder.with_sample_ids(names.into_iter().skip(options.skip_columns).collect());
    }

    builder.build()
}

/// Sample ids of a header line, with or without the corner cell
fn header_sample_ids(names: Vec<String>, data_width: usize, skip_columns: usize) -> InputResult<Vec<String>> {
    let samples = data_width - skip_columns;
    if names.len() == data_width {
        Ok(names.into_iter().skip(skip_columns).collect())
    } else if names.len() == samples {
        Ok(names)
    } else if skip_columns > 1 && names.len() == samples + 1 {
        // Corner cell above the id column only
        Ok(names.into_iter().skip(1).collect())
    } else {
        Err(InputFormatError::HeaderWidth {
            expected: samples,
            found: names.len(),
        })
    }
}

/// Read a square `n x n` matrix, such as a sample error covariance
pub fn read_square_matrix<P: AsRef<Path>>(
    path: P,
    options: &MatrixFileOptions,
    n: usize,
) -> InputResult<Array2<f64>> {
    let path = path.as_ref();
    let matrix = read_matrix(path, options, n.max(1))?;
    if matrix.n_features() != n || matrix.n_samples() != n {
        return Err(InputFormatError::NotSquare {
            name: path.display().to_string(),
            expected: n,
            rows: matrix.n_features(),
            columns: matrix.n_samples(),
        });
    }

    let mut dense = Array2::zeros((n, n));
    for i in 0..n {
        if let Some(row) = matrix.row(i) {
            dense.row_mut(i).assign(&row);
        }
    }
    Ok(dense)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};
    use tempfile::NamedTempFile;

    fn read(text: &str, options: &MatrixFileOptions) -> InputResult<ChunkedMatrix> {
        read_matrix_from(Cursor::new(text.as_bytes().to_vec()), options, 2)
    }

    #[test]
    fn test_read_with_corner_cell() {
        let m = read("id\ts1\ts2\ts3\nrs1\t0\t1\t2\nrs2\t1\tNA\t\nrs3\t2\t2\t0\n", &MatrixFileOptions::default()).unwrap();
        assert_eq!(m.n_features(), 3);
        assert_eq!(m.n_samples(), 3);
        assert_eq!(m.n_chunks(), 2);
        assert_eq!(m.sample_ids().unwrap(), &["s1", "s2", "s3"]);
        assert_eq!(m.feature_ids(), &["rs1", "rs2", "rs3"]);
        assert_eq!(m.missing_cells(), 2);
        let row = m.row(1).unwrap();
        assert_eq!(row[0], 1.0);
        assert!(row[1].is_nan() && row[2].is_nan());
    }

    #[test]
    fn test_read_without_corner_cell() {
        let m = read("s1\ts2\nrs1\t0.5\t1e-3\n", &MatrixFileOptions::default()).unwrap();
        assert_eq!(m.sample_ids().unwrap(), &["s1", "s2"]);
        assert_eq!(m.row(0).unwrap()[1], 1e-3);
    }

    #[test]
    fn test_read_comma_and_crlf() {
        let m = read("id,a,b\r\ng1,1,2\r\n\r\ng2,3,4\r\n", &MatrixFileOptions::comma_separated()).unwrap();
        assert_eq!(m.n_features(), 2);
        assert_eq!(m.row(1).unwrap()[1], 4.0);
    }

    #[test]
    fn test_custom_missing_token() {
        let options = MatrixFileOptions {
            missing_token: ".".to_string(),
            ..MatrixFileOptions::default()
        };
        let m = read("id\ta\tb\ng\t.\t1\n", &options).unwrap();
        assert!(m.row(0).unwrap()[0].is_nan());
        assert!(read("id\ta\tb\ng\tNA\t1\n", &options).is_err());
    }

    #[test]
    fn test_extra_skipped_rows_and_columns() {
        let options = MatrixFileOptions {
            skip_rows: 2,
            skip_columns: 2,
            ..MatrixFileOptions::default()
        };
        let text = "id\tchr\ts1\ts2\n# comment line\nrs1\tchr1\t0\t1\n";
        let m = read(text, &options).unwrap();
        assert_eq!(m.sample_ids().unwrap(), &["s1", "s2"]);
        assert_eq!(m.n_samples(), 2);
    }

    #[test]
    fn test_ragged_row_rejected() {
        let err = read("id\ta\tb\ng1\t1\t2\ng2\t1\n", &MatrixFileOptions::default()).unwrap_err();
        assert!(matches!(err, InputFormatError::RaggedRow { .. }));
    }

    #[test]
    fn test_bad_number_rejected() {
        let err = read("id\ta\tb\ng1\t1\tabc\n", &MatrixFileOptions::default()).unwrap_err();
        assert!(matches!(err, InputFormatError::InvalidNumber { line: 2, column: 3, .. }));
    }

    #[test]
    fn test_header_width_rejected() {
        let err = read("id\ta\tb\tc\td\ng1\t1\t2\n", &MatrixFileOptions::default()).unwrap_err();
        assert!(matches!(err, InputFormatError::HeaderWidth { expected: 2, found: 5 }));
    }

    #[test]
    fn test_header_only_matrix() {
        let m = read("id\ts1\ts2\n", &MatrixFileOptions::default()).unwrap();
        assert_eq!(m.n_features(), 0);
        assert_eq!(m.sample_ids().unwrap(), &["s1", "s2"]);
    }

    #[test]
    fn test_square_matrix() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "id\ta\tb\na\t2\t0.5\nb\t0.5\t1\n").unwrap();
        let sigma = read_square_matrix(file.path(), &MatrixFileOptions::default(), 2).unwrap();
        assert_eq!(sigma[[0, 1]], 0.5);
        assert!(matches!(
            read_square_matrix(file.path(), &MatrixFileOptions::default(), 3),
            Err(InputFormatError::NotSquare { .. })
        ));
    }

    #[test]
    fn test_missing_file() {
        let err = read_matrix("/nonexistent/matrix.txt", &MatrixFileOptions::default(), 10).unwrap_err();
        assert!(matches!(err, InputFormatError::FileNotFound(_)));
    }
}
