//! Input sources for matrix and annotation files
//!
//! A [`TextReader`] hides whether a file is read through a plain buffer,
//! a memory map or a gzip/bzip2 decoder; parsers only see `BufRead`.
//! [`LineReader`] walks it line by line with one reused buffer and keeps
//! the 1-based line number for error messages.

use log::debug;
use memmap2::Mmap;
use std::fmt;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Cursor, Read};
use std::path::Path;

/// Buffer size for readers and spool writers (128KB)
pub const DEFAULT_BUFFER_SIZE: usize = 128 * 1024;

/// Buffer size for plain files above `LARGE_FILE_SIZE` (1MB)
pub const LARGE_BUFFER_SIZE: usize = 1024 * 1024;

/// Plain files of at least this size are larger-buffered (10MB)
pub const LARGE_FILE_SIZE: u64 = 10 * 1024 * 1024;

/// Plain files of at least this size are memory mapped (100MB)
pub const MMAP_THRESHOLD: u64 = 100 * 1024 * 1024;

/// How a plain (uncompressed) file is read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IoStrategy {
    /// Buffered reads with the given buffer size
    Buffered(usize),
    /// Map the whole file
    MemoryMapped,
    /// Choose by file size
    #[default]
    Auto,
}

/// Compression of an input file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionFormat {
    Plain,
    Gzip,
    Bzip2,
}

/// Detect compression from the `.gz` / `.bz2` extension, then magic bytes
///
/// Files too short to carry a magic number are plain.
pub fn detect_compression(path: &Path) -> io::Result<CompressionFormat> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("gz") => return Ok(CompressionFormat::Gzip),
        Some("bz2") => return Ok(CompressionFormat::Bzip2),
        _ => {}
    }

    let mut magic = [0u8; 3];
    let n = File::open(path)?.take(3).read(&mut magic)?;
    Ok(match &magic[..n] {
        [0x1f, 0x8b, ..] => CompressionFormat::Gzip,
        b"BZh" => CompressionFormat::Bzip2,
        _ => CompressionFormat::Plain,
    })
}

/// Which decoding path a [`TextReader`] took
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Buffered,
    Mapped,
    Gzip,
    Bzip2,
}

impl SourceKind {
    pub fn is_compressed(&self) -> bool {
        matches!(self, SourceKind::Gzip | SourceKind::Bzip2)
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SourceKind::Buffered => "buffered",
            SourceKind::Mapped => "memory-mapped",
            SourceKind::Gzip => "gzip",
            SourceKind::Bzip2 => "bzip2",
        })
    }
}

/// Buffered text input of one file
pub struct TextReader {
    inner: Box<dyn BufRead + Send>,
    kind: SourceKind,
}

impl TextReader {
    /// Open `path`, decompressing if needed; `strategy` applies to plain files
    pub fn open<P: AsRef<Path>>(path: P, strategy: IoStrategy) -> io::Result<Self> {
        let path = path.as_ref();
        let format = detect_compression(path)?;
        let file = File::open(path)?;

        let (inner, kind): (Box<dyn BufRead + Send>, SourceKind) = match format {
            CompressionFormat::Gzip => (
                Box::new(BufReader::with_capacity(
                    DEFAULT_BUFFER_SIZE,
                    flate2::read::MultiGzDecoder::new(file),
                )),
                SourceKind::Gzip,
            ),
            CompressionFormat::Bzip2 => (
                Box::new(BufReader::with_capacity(
                    DEFAULT_BUFFER_SIZE,
                    bzip2::read::BzDecoder::new(file),
                )),
                SourceKind::Bzip2,
            ),
            CompressionFormat::Plain => {
                let size = file.metadata()?.len();
                let buffer = match strategy {
                    IoStrategy::MemoryMapped => None,
                    IoStrategy::Auto if size >= MMAP_THRESHOLD => None,
                    IoStrategy::Auto if size >= LARGE_FILE_SIZE => Some(LARGE_BUFFER_SIZE),
                    IoStrategy::Auto => Some(DEFAULT_BUFFER_SIZE),
                    IoStrategy::Buffered(capacity) => Some(capacity),
                };
                match buffer {
                    Some(capacity) => (
                        Box::new(BufReader::with_capacity(capacity, file)),
                        SourceKind::Buffered,
                    ),
                    None => {
                        // SAFETY: inputs are not modified while a run reads them
                        let map = unsafe { Mmap::map(&file)? };
                        (Box::new(Cursor::new(map)), SourceKind::Mapped)
                    }
                }
            }
        };

        debug!("Reading {:?} ({})", path, kind);
        Ok(Self { inner, kind })
    }

    /// Open with [`IoStrategy::Auto`]
    pub fn open_auto<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        Self::open(path, IoStrategy::Auto)
    }

    pub fn kind(&self) -> SourceKind {
        self.kind
    }
}

impl Read for TextReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl BufRead for TextReader {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        self.inner.fill_buf()
    }

    fn consume(&mut self, amt: usize) {
        self.inner.consume(amt)
    }
}

/// Line-by-line reader over raw bytes, reusing one buffer
pub struct LineReader<R: BufRead> {
    reader: R,
    buffer: Vec<u8>,
    line_number: usize,
}

impl<R: BufRead> LineReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buffer: Vec::with_capacity(4096),
            line_number: 0,
        }
    }

    /// Next line without its `\n` or `\r\n` terminator
    pub fn next_line(&mut self) -> Option<io::Result<&[u8]>> {
        self.buffer.clear();
        match self.reader.read_until(b'\n', &mut self.buffer) {
            Ok(0) => None,
            Ok(_) => {
                self.line_number += 1;
                let end = match self.buffer.as_slice() {
                    [.., b'\r', b'\n'] => self.buffer.len() - 2,
                    [.., b'\n'] => self.buffer.len() - 1,
                    _ => self.buffer.len(),
                };
                Some(Ok(&self.buffer[..end]))
            }
            Err(e) => Some(Err(e)),
        }
    }

    /// 1-based number of the line last returned, 0 before the first
    pub fn line_number(&self) -> usize {
        self.line_number
    }
}
