//! Splitting of oversized spectrum files into worker-sized chunks.
//!
//! Chunks are all-or-nothing per source file: any failure returns no
//! chunks, and whatever partial files were already written are the
//! caller's to discard. Chunk names are a deterministic function of the
//! source name and a 1-based sequence number, so repeated runs over
//! identical inputs produce identical output.

use std::fs;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::mgf::{MgfError, MgfIndex};
use crate::progress::ProgressSink;

const BEGIN_IONS: &str = "BEGIN IONS";
const END_IONS: &str = "END IONS";

#[derive(Debug)]
pub enum SplitError {
    NotFound(PathBuf),
    Io(io::Error),
    /// Allocation failed while buffering a spectrum block.
    OutOfMemory,
    /// A completed chunk failed to index.
    Index(MgfError),
}

impl std::fmt::Display for SplitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SplitError::NotFound(path) => write!(f, "file {} not found", path.display()),
            SplitError::Io(e) => write!(f, "IO error while reading/writing the file: {}", e),
            SplitError::OutOfMemory => f.write_str(
                "ran out of memory while buffering spectra; \
                 lower max_spectra_per_chunk or split the file manually",
            ),
            SplitError::Index(e) => write!(f, "failed to index a chunk: {}", e),
        }
    }
}

impl std::error::Error for SplitError {}

impl From<io::Error> for SplitError {
    fn from(residual: io::Error) -> Self {
        Self::Io(residual)
    }
}

/// One completed chunk: the file on disk plus its freshly built index.
/// The index is also persisted as a sibling artifact.
#[derive(Debug)]
pub struct SplitChunk {
    pub path: PathBuf,
    pub index: MgfIndex,
}

/// Path of the `sequence`-th chunk (1-based) of `source`.
pub fn chunk_path(source: &Path, sequence: usize) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    source.with_file_name(format!("{}_{}.mgf", stem, sequence))
}

/// Split `source` into chunks of at most `max_spectra` spectra each.
///
/// File-level header lines are replayed at the top of every chunk so
/// each chunk stands alone. Every completed chunk is indexed and its
/// index persisted next to it. Chunk progress is reported through the
/// sink's secondary counter.
pub fn split_file(
    source: &Path,
    max_spectra: usize,
    sink: &dyn ProgressSink,
) -> Result<Vec<SplitChunk>, SplitError> {
    let max_spectra = max_spectra.max(1);

    let total = count_spectra(source)?;
    let expected_chunks = (total + max_spectra - 1) / max_spectra;
    sink.set_secondary_indeterminate(false);
    sink.reset_secondary();
    sink.set_secondary_max(expected_chunks);

    let mut reader = BufReader::new(open(source)?);

    let mut header: Vec<String> = Vec::new();
    let mut block = String::new();
    let mut in_spectrum = false;
    let mut seen_first_spectrum = false;

    let mut writer: Option<BufWriter<fs::File>> = None;
    let mut current_path = PathBuf::new();
    let mut spectra_in_chunk = 0;
    let mut sequence = 0;
    let mut chunks: Vec<SplitChunk> = Vec::new();

    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            break;
        }
        let text = line.trim();

        if text == BEGIN_IONS {
            in_spectrum = true;
            seen_first_spectrum = true;
            block.clear();
            push_line(&mut block, &line)?;
        } else if in_spectrum {
            push_line(&mut block, &line)?;
            if text == END_IONS {
                in_spectrum = false;
                if writer.is_none() {
                    sequence += 1;
                    current_path = chunk_path(source, sequence);
                    writer = Some(open_chunk(&current_path, &header)?);
                }
                if let Some(out) = writer.as_mut() {
                    out.write_all(block.as_bytes())?;
                }
                spectra_in_chunk += 1;
                if spectra_in_chunk == max_spectra {
                    if let Some(out) = writer.take() {
                        chunks.push(close_chunk(out, &current_path)?);
                        sink.set_secondary_current(chunks.len());
                    }
                    spectra_in_chunk = 0;
                }
            }
        } else if !seen_first_spectrum {
            // file-level header, replayed into every chunk
            header.push(line.clone());
        }
        // stray lines between spectra carry no information; skip them
    }

    if in_spectrum && !block.is_empty() {
        // unterminated trailing spectrum; carry it over as-is
        if writer.is_none() {
            sequence += 1;
            current_path = chunk_path(source, sequence);
            writer = Some(open_chunk(&current_path, &header)?);
        }
        if let Some(out) = writer.as_mut() {
            out.write_all(block.as_bytes())?;
        }
    }
    if let Some(out) = writer.take() {
        chunks.push(close_chunk(out, &current_path)?);
        sink.set_secondary_current(chunks.len());
    }

    Ok(chunks)
}

fn open(source: &Path) -> Result<fs::File, SplitError> {
    fs::File::open(source).map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            SplitError::NotFound(source.to_path_buf())
        } else {
            SplitError::Io(e)
        }
    })
}

/// Fast pre-scan counting `BEGIN IONS` markers, so the secondary
/// counter can carry a real maximum.
fn count_spectra(source: &Path) -> Result<usize, SplitError> {
    let mut reader = BufReader::new(open(source)?);
    let mut count = 0;
    let mut buffer: Vec<u8> = Vec::new();
    loop {
        buffer.clear();
        if reader.read_until(b'\n', &mut buffer)? == 0 {
            break;
        }
        if buffer.starts_with(BEGIN_IONS.as_bytes()) {
            count += 1;
        }
    }
    Ok(count)
}

fn open_chunk(path: &Path, header: &[String]) -> Result<BufWriter<fs::File>, SplitError> {
    let mut writer = BufWriter::new(fs::File::create(path)?);
    for line in header {
        writer.write_all(line.as_bytes())?;
    }
    Ok(writer)
}

fn push_line(block: &mut String, line: &str) -> Result<(), SplitError> {
    block
        .try_reserve(line.len())
        .map_err(|_| SplitError::OutOfMemory)?;
    block.push_str(line);
    Ok(())
}

fn close_chunk(mut writer: BufWriter<fs::File>, path: &Path) -> Result<SplitChunk, SplitError> {
    writer.flush()?;
    drop(writer);
    let index = MgfIndex::build(path).map_err(SplitError::Index)?;
    index.write_sibling(path).map_err(SplitError::Index)?;
    Ok(SplitChunk {
        path: path.to_path_buf(),
        index,
    })
}
