// Segment and sequence file I/O
// One segment per line, plain or gzip-compressed; output as wrapped FASTA

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;

use anyhow::{bail, Context, Result};
use flate2::read::MultiGzDecoder;
use gasm_common::Segment;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Default FASTA line width for [`write_fasta`]
pub const FASTA_LINE_WIDTH: usize = 80;

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |last| last + 1);
    &bytes[start..end]
}

/// Line-oriented segment reader.
///
/// Blank lines and lines starting with `>` or `#` are skipped; surrounding
/// whitespace is trimmed. Every remaining line is one segment.
pub struct SegmentReader<R> {
    reader: BufReader<R>,
    buffer: Vec<u8>,
    line: usize,
}

impl<R: Read> SegmentReader<R> {
    pub fn new(reader: R) -> Self {
        SegmentReader {
            reader: BufReader::with_capacity(1 << 20, reader),
            buffer: Vec::with_capacity(256),
            line: 0,
        }
    }

    /// Next segment, or `None` at end of input.
    pub fn read_segment(&mut self) -> Result<Option<Segment>> {
        loop {
            self.buffer.clear();
            let read = self
                .reader
                .read_until(b'\n', &mut self.buffer)
                .with_context(|| format!("failed to read line {}", self.line + 1))?;
            if read == 0 {
                return Ok(None);
            }
            self.line += 1;

            let trimmed = trim_ascii(&self.buffer);
            if trimmed.is_empty() || trimmed[0] == b'>' || trimmed[0] == b'#' {
                continue;
            }
            return Ok(Some(trimmed.to_vec()));
        }
    }

    /// Read every remaining segment, requiring equal lengths.
    pub fn read_all(&mut self) -> Result<Vec<Segment>> {
        let mut segments: Vec<Segment> = Vec::new();
        while let Some(segment) = self.read_segment()? {
            if let Some(first) = segments.first() {
                if first.len() != segment.len() {
                    bail!(
                        "segment on line {} has length {}, expected {}",
                        self.line,
                        segment.len(),
                        first.len()
                    );
                }
            }
            segments.push(segment);
        }
        Ok(segments)
    }
}

impl<R: Read> Iterator for SegmentReader<R> {
    type Item = Result<Segment>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_segment().transpose()
    }
}

/// Open a segment file, transparently decompressing gzip input.
pub fn open_segments(path: &Path) -> Result<SegmentReader<Box<dyn Read + Send>>> {
    let mut file =
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut head = Vec::with_capacity(GZIP_MAGIC.len());
    (&mut file)
        .take(GZIP_MAGIC.len() as u64)
        .read_to_end(&mut head)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let is_gzip = head == GZIP_MAGIC;
    let stream = std::io::Cursor::new(head).chain(file);

    let reader: Box<dyn Read + Send> = if is_gzip {
        Box::new(MultiGzDecoder::new(stream))
    } else {
        Box::new(stream)
    };
    Ok(SegmentReader::new(reader))
}

/// Read all segments from `path`.
pub fn read_segments(path: &Path) -> Result<Vec<Segment>> {
    open_segments(path)?
        .read_all()
        .with_context(|| format!("invalid segment file {}", path.display()))
}

/// Write one segment per line.
pub fn write_segments<W: Write>(writer: W, segments: &[Segment]) -> Result<()> {
    let mut writer = BufWriter::new(writer);
    for segment in segments {
        writer.write_all(segment)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(())
}

/// Write `sequence` as a single FASTA record wrapped at `line_width`.
pub fn write_fasta<W: Write>(
    writer: W,
    name: &str,
    sequence: &[u8],
    line_width: usize,
) -> Result<()> {
    let mut writer = BufWriter::new(writer);
    writeln!(writer, ">{name}")?;
    for line in sequence.chunks(line_width.max(1)) {
        writer.write_all(line)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(())
}
