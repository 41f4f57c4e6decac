//! Association records and per-category output sinks
//!
//! During the scan, passing records are appended to a spool as soon as a
//! block is done. Only after the scan, once every tested p-value has been
//! counted, can q-values be computed; [`RecordSink::finish`] then rewrites
//! the spooled records into the final output with the q-value column
//! filled in. A record is always written as one whole line under the
//! sink lock, so concurrent workers never interleave partial records.

use crate::core::fdr::FdrCorrector;
use crate::core::io::DEFAULT_BUFFER_SIZE;
use parking_lot::Mutex;
use std::fmt;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Column header of every output stream
pub const OUTPUT_HEADER: &str = "variant\ttrait\tstatistic\tpvalue\tqvalue\teffect_size";

/// Token written for undefined values
pub const MISSING_VALUE: &str = "NA";

/// Output category of a tested pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Category {
    /// Exhaustive mode: every pair
    All,
    /// Variant within the radius of the trait interval
    Local,
    /// Everything else with known positions
    Distant,
}

impl Category {
    /// Number of categories
    pub const COUNT: usize = 3;

    /// Dense index for per-category tables
    pub fn index(&self) -> usize {
        match self {
            Category::All => 0,
            Category::Local => 1,
            Category::Distant => 2,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Category::All => "all",
            Category::Local => "local",
            Category::Distant => "distant",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One accepted variant-trait association
#[derive(Debug, Clone, PartialEq)]
pub struct AssociationRecord {
    pub variant: String,
    pub trait_id: String,
    pub statistic: f64,
    pub pvalue: f64,
    /// `NaN` until the run is finalized
    pub qvalue: f64,
    /// `NaN` when the model has no effect size
    pub effect_size: f64,
}

impl AssociationRecord {
    /// Append the record as one tab-separated line
    pub fn write_line(&self, out: &mut String) {
        use std::fmt::Write as _;
        let _ = writeln!(
            out,
            "{}\t{}\t{}\t{}\t{}\t{}",
            self.variant,
            self.trait_id,
            FormatValue(self.statistic),
            FormatValue(self.pvalue),
            FormatValue(self.qvalue),
            FormatValue(self.effect_size),
        );
    }

    /// Parse a line written by [`write_line`](Self::write_line)
    pub fn parse_line(line: &str) -> Option<Self> {
        let mut fields = line.split('\t');
        let record = Self {
            variant: fields.next()?.to_string(),
            trait_id: fields.next()?.to_string(),
            statistic: parse_value(fields.next()?)?,
            pvalue: parse_value(fields.next()?)?,
            qvalue: parse_value(fields.next()?)?,
            effect_size: parse_value(fields.next()?)?,
        };
        if fields.next().is_some() {
            return None;
        }
        Some(record)
    }
}

/// Shortest round-tripping text; `NaN` as `NA`
struct FormatValue(f64);

impl fmt::Display for FormatValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_nan() {
            f.write_str(MISSING_VALUE)
        } else {
            write!(f, "{}", self.0)
        }
    }
}

fn parse_value(token: &str) -> Option<f64> {
    if token == MISSING_VALUE {
        return Some(f64::NAN);
    }
    token.parse().ok()
}

/// Where a category's records end up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkTarget {
    /// Delimited text file
    File(PathBuf),
    /// Records returned in the run summary
    Memory,
}

/// Final state of a finished sink
#[derive(Debug, Clone)]
pub enum SinkOutput {
    File { path: PathBuf, records: usize },
    Memory(Vec<AssociationRecord>),
}

impl SinkOutput {
    pub fn len(&self) -> usize {
        match self {
            SinkOutput::File { records, .. } => *records,
            SinkOutput::Memory(records) => records.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// In-memory records, empty for file outputs
    pub fn records(&self) -> &[AssociationRecord] {
        match self {
            SinkOutput::File { .. } => &[],
            SinkOutput::Memory(records) => records,
        }
    }
}

/// Append-only destination of one category
pub trait RecordSink: Send + Sync {
    /// Human-readable name used in error reports
    fn name(&self) -> String;

    /// Final output file, if any
    fn path(&self) -> Option<&Path>;

    /// Append a batch of records; each record is written whole
    fn append(&self, records: &[AssociationRecord]) -> io::Result<()>;

    /// Records appended so far
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fill in q-values and produce the final output
    fn finish(self: Box<Self>, fdr: &dyn FdrCorrector) -> io::Result<SinkOutput>;
}

/// Open a sink for `category` at `target`
pub fn open_sink(category: Category, target: &SinkTarget) -> io::Result<Box<dyn RecordSink>> {
    match target {
        SinkTarget::Memory => Ok(Box::new(MemorySink::new(category))),
        SinkTarget::File(path) => Ok(Box::new(FileSink::create(category, path)?)),
    }
}

/// Sink keeping records in memory
pub struct MemorySink {
    category: Category,
    records: Mutex<Vec<AssociationRecord>>,
}

impl MemorySink {
    pub fn new(category: Category) -> Self {
        Self {
            category,
            records: Mutex::new(Vec::new()),
        }
    }
}

impl RecordSink for MemorySink {
    fn name(&self) -> String {
        format!("{} (memory)", self.category)
    }

    fn path(&self) -> Option<&Path> {
        None
    }

    fn append(&self, records: &[AssociationRecord]) -> io::Result<()> {
        self.records.lock().extend_from_slice(records);
        Ok(())
    }

    fn len(&self) -> usize {
        self.records.lock().len()
    }

    fn finish(self: Box<Self>, fdr: &dyn FdrCorrector) -> io::Result<SinkOutput> {
        let mut records = self.records.into_inner();
        for record in &mut records {
            record.qvalue = fdr.q_value(record.pvalue);
        }
        Ok(SinkOutput::Memory(records))
    }
}

struct Spool {
    writer: BufWriter<NamedTempFile>,
    records: usize,
}

/// Sink spooling to a temporary file next to the final output
///
/// The spool is removed when the sink is dropped, so an unfinished sink
/// never leaves a file behind. The final file is only created by
/// [`finish`](RecordSink::finish).
pub struct FileSink {
    category: Category,
    path: PathBuf,
    spool: Mutex<Spool>,
}

impl FileSink {
    pub fn create(category: Category, path: &Path) -> io::Result<Self> {
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let temp = tempfile::Builder::new()
            .prefix(".eqtl-spool-")
            .tempfile_in(dir)?;
        Ok(Self {
            category,
            path: path.to_path_buf(),
            spool: Mutex::new(Spool {
                writer: BufWriter::with_capacity(DEFAULT_BUFFER_SIZE, temp),
                records: 0,
            }),
        })
    }
}

impl RecordSink for FileSink {
    fn name(&self) -> String {
        format!("{} ({})", self.category, self.path.display())
    }

    fn path(&self) -> Option<&Path> {
        Some(&self.path)
    }

    fn append(&self, records: &[AssociationRecord]) -> io::Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut batch = String::with_capacity(records.len() * 64);
        for record in records {
            record.write_line(&mut batch);
        }
        let mut spool = self.spool.lock();
        spool.writer.write_all(batch.as_bytes())?;
        spool.records += records.len();
        Ok(())
    }

    fn len(&self) -> usize {
        self.spool.lock().records
    }

    fn finish(self: Box<Self>, fdr: &dyn FdrCorrector) -> io::Result<SinkOutput> {
        let Spool { writer, records } = self.spool.into_inner();
        let mut temp = writer.into_inner().map_err(|e| e.into_error())?;
        temp.seek(SeekFrom::Start(0))?;

        let mut out = BufWriter::with_capacity(DEFAULT_BUFFER_SIZE, File::create(&self.path)?);
        writeln!(out, "{}", OUTPUT_HEADER)?;

        let reader = BufReader::with_capacity(DEFAULT_BUFFER_SIZE, temp.as_file_mut());
        let mut line_buf = String::with_capacity(128);
        for line in reader.lines() {
            let line = line?;
            let mut record = AssociationRecord::parse_line(&line).ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidData, format!("corrupt spool record: {}", line))
            })?;
            record.qvalue = fdr.q_value(record.pvalue);
            line_buf.clear();
            record.write_line(&mut line_buf);
            out.write_all(line_buf.as_bytes())?;
        }
        out.flush()?;

        Ok(SinkOutput::File {
            path: self.path,
            records,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::fdr::ExactFdr;
    use std::io::Read;
    use tempfile::tempdir;

    fn record(variant: &str, p: f64) -> AssociationRecord {
        AssociationRecord {
            variant: variant.to_string(),
            trait_id: "GENE".to_string(),
            statistic: 4.25,
            pvalue: p,
            qvalue: f64::NAN,
            effect_size: -0.5,
        }
    }

    #[test]
    fn test_line_format() {
        let mut line = String::new();
        record("rs1", 0.001).write_line(&mut line);
        assert_eq!(line, "rs1\tGENE\t4.25\t0.001\tNA\t-0.5\n");

        let parsed = AssociationRecord::parse_line(line.trim_end()).unwrap();
        assert_eq!(parsed.variant, "rs1");
        assert_eq!(parsed.pvalue, 0.001);
        assert!(parsed.qvalue.is_nan());
    }

    #[test]
    fn test_line_keeps_infinite_statistic() {
        let mut rec = record("rs1", 0.0);
        rec.statistic = f64::INFINITY;
        let mut line = String::new();
        rec.write_line(&mut line);
        let parsed = AssociationRecord::parse_line(line.trim_end()).unwrap();
        assert_eq!(parsed.statistic, f64::INFINITY);
    }

    #[test]
    fn test_parse_rejects_short_line() {
        assert!(AssociationRecord::parse_line("rs1\tGENE\t1.0").is_none());
        assert!(AssociationRecord::parse_line("rs1\tGENE\tx\t0.1\tNA\t1").is_none());
    }

    #[test]
    fn test_memory_sink() {
        let sink = open_sink(Category::All, &SinkTarget::Memory).unwrap();
        sink.append(&[record("rs1", 0.01), record("rs2", 0.02)]).unwrap();
        assert_eq!(sink.len(), 2);

        let fdr = ExactFdr::new(vec![0.01, 0.02], 4);
        let output = sink.finish(&fdr).unwrap();
        assert_eq!(output.len(), 2);
        for rec in output.records() {
            assert!(rec.qvalue >= rec.pvalue);
        }
    }

    #[test]
    fn test_file_sink_writes_on_finish_only() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("local.tsv");
        let sink = open_sink(Category::Local, &SinkTarget::File(path.clone())).unwrap();
        sink.append(&[record("rs1", 0.01)]).unwrap();
        sink.append(&[record("rs2", 0.04)]).unwrap();
        assert!(!path.exists());

        let fdr = ExactFdr::new(vec![0.01, 0.04], 4);
        let output = sink.finish(&fdr).unwrap();
        assert_eq!(output.len(), 2);

        let mut content = String::new();
        File::open(&path).unwrap().read_to_string(&mut content).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines[0], OUTPUT_HEADER);
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[1], "rs1\tGENE\t4.25\t0.01\t0.04\t-0.5");
        assert_eq!(lines[2], "rs2\tGENE\t4.25\t0.04\t0.08\t-0.5");

        // Spool is gone, only the final file is left
        let entries = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[test]
    fn test_dropped_file_sink_leaves_nothing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("all.tsv");
        {
            let sink = open_sink(Category::All, &SinkTarget::File(path.clone())).unwrap();
            sink.append(&[record("rs1", 0.01)]).unwrap();
        }
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_concurrent_appends_are_whole_lines() {
        use rayon::prelude::*;

        let dir = tempdir().unwrap();
        let path = dir.path().join("all.tsv");
        let sink = open_sink(Category::All, &SinkTarget::File(path.clone())).unwrap();
        (0..64).into_par_iter().for_each(|i| {
            let batch: Vec<_> = (0..50).map(|j| record(&format!("rs{}_{}", i, j), 0.001)).collect();
            sink.append(&batch).unwrap();
        });
        sink.finish(&ExactFdr::new(vec![0.001; 3200], 3200)).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().skip(1).collect();
        assert_eq!(lines.len(), 3200);
        assert!(lines.iter().all(|l| AssociationRecord::parse_line(l).is_some()));
    }
}
