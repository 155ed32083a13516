//! Streaming primitives for Mascot Generic Format (MGF) peak lists.
//!
//! Everything here works in a single pass over the file: indexing never
//! loads more than one line, and the repair passes never buffer more
//! than one spectrum block. Repairs write a sibling temp file which is
//! flushed and renamed over the original before anyone re-reads it.

use std::fs;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use fnv::{FnvHashMap, FnvHashSet};
use serde::{Deserialize, Serialize};

const BEGIN_IONS: &str = "BEGIN IONS";
const END_IONS: &str = "END IONS";
const TITLE_KEY: &str = "TITLE=";

/// Suffix appended to a chunk's full file name for its index artifact.
pub const INDEX_SUFFIX: &str = ".idx";

#[derive(Debug)]
pub enum MgfError {
    Io(io::Error),
    Json(serde_json::Error),
    MalformedPeakLine,
    MalformedHeaderLine(String),
}

impl std::fmt::Display for MgfError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MgfError::Io(e) => write!(f, "IO error: {}", e),
            MgfError::Json(e) => write!(f, "index artifact error: {}", e),
            MgfError::MalformedPeakLine => f.write_str("encountered a malformed peak line"),
            MgfError::MalformedHeaderLine(line) => {
                write!(f, "encountered a malformed header line: {}", line)
            }
        }
    }
}

impl std::error::Error for MgfError {}

impl From<io::Error> for MgfError {
    fn from(residual: io::Error) -> Self {
        Self::Io(residual)
    }
}

impl From<serde_json::Error> for MgfError {
    fn from(residual: serde_json::Error) -> Self {
        Self::Json(residual)
    }
}

/// Summary of one MGF file, built in a single streaming pass.
///
/// An index is never patched in place: after any rewrite of the
/// underlying file it must be rebuilt with [`MgfIndex::build`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MgfIndex {
    /// File name (not the full path) of the indexed file.
    pub file_name: String,
    /// Total number of spectra.
    pub n_spectra: usize,
    /// Number of spectra carrying a non-empty title. Always less than
    /// or equal to `n_spectra`.
    pub n_titled: usize,
    /// Titles seen more than once, with their occurrence counts.
    pub duplicated_titles: FnvHashMap<String, usize>,
    /// False if any peak line carries a zero intensity, the signature
    /// of data that was never peak-picked.
    pub peak_picked: bool,
    /// Largest per-spectrum peak count observed. Zero means the file
    /// holds no fragmentation data at all.
    pub max_peak_count: usize,
}

impl MgfIndex {
    /// Index `path` by streaming over it once.
    pub fn build(path: &Path) -> Result<MgfIndex, MgfError> {
        let file = fs::File::open(path)?;
        let mut reader = BufReader::new(file);

        let mut n_spectra = 0;
        let mut n_titled = 0;
        let mut title_counts: FnvHashMap<String, usize> = FnvHashMap::default();
        let mut peak_picked = true;
        let mut max_peak_count = 0;

        let mut in_spectrum = false;
        let mut peaks = 0;

        let mut line = String::new();
        loop {
            line.clear();
            if reader.read_line(&mut line)? == 0 {
                break;
            }
            let text = line.trim();
            if text.is_empty() {
                continue;
            }

            if text == BEGIN_IONS {
                in_spectrum = true;
                peaks = 0;
                n_spectra += 1;
            } else if text == END_IONS {
                in_spectrum = false;
                max_peak_count = max_peak_count.max(peaks);
            } else if in_spectrum {
                if let Some(value) = text.strip_prefix(TITLE_KEY) {
                    let value = value.trim();
                    if !value.is_empty() {
                        n_titled += 1;
                        *title_counts.entry(value.to_string()).or_insert(0) += 1;
                    }
                } else if text.contains('=') {
                    // other scan headers (PEPMASS, CHARGE, RTINSECONDS, ...)
                } else if text.starts_with(|c: char| c.is_ascii_digit()) {
                    let (_, intensity) = parse_peak(text)?;
                    if intensity == 0.0 {
                        peak_picked = false;
                    }
                    peaks += 1;
                } else {
                    return Err(MgfError::MalformedHeaderLine(text.to_string()));
                }
            }
            // lines outside any spectrum are file-level headers; nothing
            // in the index depends on them
        }
        if in_spectrum {
            // unterminated trailing spectrum still counts
            max_peak_count = max_peak_count.max(peaks);
        }

        title_counts.retain(|_, count| *count > 1);

        Ok(MgfIndex {
            file_name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            n_spectra,
            n_titled,
            duplicated_titles: title_counts,
            peak_picked,
            max_peak_count,
        })
    }

    pub fn has_duplicated_titles(&self) -> bool {
        !self.duplicated_titles.is_empty()
    }

    /// Persist this index as a sibling artifact next to `mgf`.
    pub fn write_sibling(&self, mgf: &Path) -> Result<PathBuf, MgfError> {
        let path = index_path(mgf);
        let mut writer = BufWriter::new(fs::File::create(&path)?);
        serde_json::to_writer(&mut writer, self)?;
        writer.flush()?;
        Ok(path)
    }

    /// Read an index artifact written by [`MgfIndex::write_sibling`].
    pub fn read(path: &Path) -> Result<MgfIndex, MgfError> {
        let reader = BufReader::new(fs::File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }
}

/// Path of the sibling index artifact for `mgf`.
pub fn index_path(mgf: &Path) -> PathBuf {
    let mut name = mgf
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(INDEX_SUFFIX);
    mgf.with_file_name(name)
}

fn parse_peak(line: &str) -> Result<(f64, f64), MgfError> {
    let mut columns = line.split_ascii_whitespace();
    let mz = columns
        .next()
        .and_then(|c| c.parse::<f64>().ok())
        .ok_or(MgfError::MalformedPeakLine)?;
    let intensity = columns
        .next()
        .and_then(|c| c.parse::<f64>().ok())
        .ok_or(MgfError::MalformedPeakLine)?;
    // a third charge column may be present; it does not matter here
    Ok((mz, intensity))
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

fn replace_file(tmp: &Path, path: &Path, mut writer: BufWriter<fs::File>) -> Result<(), MgfError> {
    // the rewrite must be fully on disk before anyone re-indexes it
    writer.flush()?;
    drop(writer);
    fs::rename(tmp, path)?;
    Ok(())
}

fn is_empty_title(text: &str) -> bool {
    text.strip_prefix(TITLE_KEY)
        .map(|v| v.trim().is_empty())
        .unwrap_or(false)
}

/// Rewrite `path`, inserting a synthesized `TITLE=Spectrum {n}` header
/// into every spectrum without one. Returns the number of titles
/// inserted.
pub fn add_missing_titles(path: &Path) -> Result<usize, MgfError> {
    let mut reader = BufReader::new(fs::File::open(path)?);
    let tmp = tmp_path(path);
    let mut writer = BufWriter::new(fs::File::create(&tmp)?);

    let mut block: Vec<String> = Vec::new();
    let mut in_spectrum = false;
    let mut has_title = false;
    let mut ordinal = 0;
    let mut inserted = 0;

    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            break;
        }
        let text = line.trim();
        if text == BEGIN_IONS {
            in_spectrum = true;
            has_title = false;
            ordinal += 1;
            block.clear();
            block.push(line.clone());
        } else if in_spectrum {
            if let Some(value) = text.strip_prefix(TITLE_KEY) {
                if !value.trim().is_empty() {
                    has_title = true;
                }
            }
            block.push(line.clone());
            if text == END_IONS {
                if !has_title {
                    inserted += 1;
                    insert_title(&mut block, ordinal);
                }
                for kept in &block {
                    writer.write_all(kept.as_bytes())?;
                }
                block.clear();
                in_spectrum = false;
            }
        } else {
            writer.write_all(line.as_bytes())?;
        }
    }
    if in_spectrum {
        if !has_title {
            inserted += 1;
            insert_title(&mut block, ordinal);
        }
        for kept in &block {
            writer.write_all(kept.as_bytes())?;
        }
    }

    replace_file(&tmp, path, writer)?;
    Ok(inserted)
}

fn insert_title(block: &mut Vec<String>, ordinal: usize) {
    // an empty TITLE= header counts as untitled; drop it rather than
    // leave two title lines behind
    block.retain(|l| !is_empty_title(l.trim()));
    block.insert(1, format!("TITLE=Spectrum {}\n", ordinal));
}

/// Rewrite `path`, appending an `_{n}` suffix to the second and later
/// occurrences of every duplicated title. The first occurrence keeps
/// its title untouched. Returns the number of titles renamed.
pub fn rename_duplicate_titles(path: &Path) -> Result<usize, MgfError> {
    let mut reader = BufReader::new(fs::File::open(path)?);
    let tmp = tmp_path(path);
    let mut writer = BufWriter::new(fs::File::create(&tmp)?);

    let mut seen: FnvHashMap<String, usize> = FnvHashMap::default();
    let mut renamed = 0;

    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            break;
        }
        let text = line.trim();
        match text.strip_prefix(TITLE_KEY).map(str::trim) {
            Some(title) if !title.is_empty() => {
                let occurrence = seen.entry(title.to_string()).or_insert(0);
                *occurrence += 1;
                if *occurrence > 1 {
                    renamed += 1;
                    writeln!(writer, "TITLE={}_{}", title, occurrence)?;
                } else {
                    writer.write_all(line.as_bytes())?;
                }
            }
            _ => writer.write_all(line.as_bytes())?,
        }
    }

    replace_file(&tmp, path, writer)?;
    Ok(renamed)
}

/// Rewrite `path`, keeping only the first spectrum for every duplicated
/// title. Untitled spectra are always kept. Returns the number of
/// spectra removed.
pub fn remove_duplicate_titles(path: &Path) -> Result<usize, MgfError> {
    let mut reader = BufReader::new(fs::File::open(path)?);
    let tmp = tmp_path(path);
    let mut writer = BufWriter::new(fs::File::create(&tmp)?);

    let mut seen: FnvHashSet<String> = FnvHashSet::default();
    let mut block: Vec<String> = Vec::new();
    let mut in_spectrum = false;
    let mut block_title: Option<String> = None;
    let mut removed = 0;

    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            break;
        }
        let text = line.trim();
        if text == BEGIN_IONS {
            in_spectrum = true;
            block_title = None;
            block.clear();
            block.push(line.clone());
        } else if in_spectrum {
            if let Some(value) = text.strip_prefix(TITLE_KEY) {
                let value = value.trim();
                if !value.is_empty() {
                    block_title = Some(value.to_string());
                }
            }
            block.push(line.clone());
            if text == END_IONS {
                in_spectrum = false;
                let duplicate = match block_title.take() {
                    Some(title) => !seen.insert(title),
                    None => false,
                };
                if duplicate {
                    removed += 1;
                } else {
                    for kept in &block {
                        writer.write_all(kept.as_bytes())?;
                    }
                }
                block.clear();
            }
        } else {
            writer.write_all(line.as_bytes())?;
        }
    }

    replace_file(&tmp, path, writer)?;
    Ok(removed)
}
