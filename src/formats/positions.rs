//! Position annotation files
//!
//! Both files start with a header line and are whitespace delimited:
//!
//! ```text
//! snpid   chr     pos             geneid  chr     start   end
//! rs1     chr1    10500           GENE1   chr1    12000   14000
//! ```

use crate::core::{InputFormatError, InputResult};
use crate::core::io::{LineReader, TextReader};
use crate::core::position::PositionIndex;
use std::path::Path;

fn open(path: &Path) -> InputResult<LineReader<TextReader>> {
    if !path.exists() {
        return Err(InputFormatError::FileNotFound(path.to_path_buf()));
    }
    Ok(LineReader::new(TextReader::open_auto(path)?))
}

fn parse_coordinate(text: &str, line: usize, column: usize) -> InputResult<u64> {
    text.parse::<u64>().map_err(|_| InputFormatError::InvalidNumber {
        line,
        column,
        value: text.to_string(),
    })
}

/// Visit the fields of every data line after the header
fn for_each_record<F>(path: &Path, min_fields: usize, mut visit: F) -> InputResult<usize>
where
    F: FnMut(&[&str], usize) -> InputResult<()>,
{
    let mut lines = open(path)?;
    let mut records = 0;

    loop {
        let line_number = lines.line_number() + 1;
        let Some(line) = lines.next_line() else { break };
        let line = line?;
        if line_number == 1 {
            continue;
        }
        let text = std::str::from_utf8(line).map_err(|_| InputFormatError::InvalidUtf8(line_number))?;
        let fields: Vec<&str> = text.split_ascii_whitespace().collect();
        if fields.is_empty() {
            continue;
        }
        if fields.len() < min_fields {
            return Err(InputFormatError::TooFewFields {
                line: line_number,
                expected: min_fields,
                found: fields.len(),
            });
        }
        visit(&fields, line_number)?;
        records += 1;
    }
    Ok(records)
}

/// Add `id chrom pos` records to `index`
pub fn read_variant_positions<P: AsRef<Path>>(path: P, index: &mut PositionIndex) -> InputResult<usize> {
    for_each_record(path.as_ref(), 3, |fields, line| {
        let pos = parse_coordinate(fields[2], line, 3)?;
        index.insert_variant(fields[0], fields[1], pos);
        Ok(())
    })
}

/// Add `id chrom start end` records to `index`
pub fn read_trait_positions<P: AsRef<Path>>(path: P, index: &mut PositionIndex) -> InputResult<usize> {
    for_each_record(path.as_ref(), 4, |fields, line| {
        let start = parse_coordinate(fields[2], line, 3)?;
        let end = parse_coordinate(fields[3], line, 4)?;
        index.insert_trait(fields[0], fields[1], start, end);
        Ok(())
    })
}

/// Build a position index from a variant and a trait annotation file
pub fn read_positions<P: AsRef<Path>>(variant_path: P, trait_path: P) -> InputResult<PositionIndex> {
    let mut index = PositionIndex::new();
    read_variant_positions(variant_path, &mut index)?;
    read_trait_positions(trait_path, &mut index)?;
    Ok(index)
}
