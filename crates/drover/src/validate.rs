//! Pre-dispatch validation of spectrum files.
//!
//! Every file handed to a search engine must have unique, present
//! spectrum titles and actual MS2 content. Depending on policy, a
//! defective file is either repaired in place or excluded from the run.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::mgf::{self, MgfError, MgfIndex};
use crate::progress::ProgressSink;

/// What to do with spectra that carry no title.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissingTitlePolicy {
    /// Exclude the file from the run.
    #[default]
    Fail,
    /// Insert synthesized titles and re-index.
    Insert,
}

/// What to do with duplicated spectrum titles.
///
/// Note the asymmetry with [`MissingTitlePolicy`]: under `Fail`,
/// duplicated titles are reported but the file is still accepted.
/// Duplicates alone never exclude a file; only missing titles and
/// missing MS2 content do.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicateTitlePolicy {
    /// Warn and keep the file as-is.
    #[default]
    Fail,
    /// Append a disambiguating suffix to later occurrences, re-index.
    Rename,
    /// Keep only the first spectrum per title, re-index.
    Drop,
}

/// Outcome of validating one spectrum file.
#[derive(Debug)]
pub enum Validation {
    /// The file (possibly rewritten in place) is fit for dispatch.
    Accepted(MgfIndex),
    /// The file is excluded from the run; a report line naming the
    /// reason has already been emitted.
    Rejected,
}

impl Validation {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Validation::Accepted(_))
    }
}

/// Validate `path`, repairing it in place where policy allows.
///
/// Clean input is left byte-identical: no rewrite happens unless a
/// policy actually triggers. Every rewrite is followed by a full
/// rebuild of the index.
pub fn validate_file(
    path: &Path,
    missing: MissingTitlePolicy,
    duplicate: DuplicateTitlePolicy,
    sink: &dyn ProgressSink,
) -> Result<Validation, MgfError> {
    sink.append_line(
        &format!("Validating spectrum file: {}", path.display()),
        false,
        true,
    );

    let mut index = MgfIndex::build(path)?;

    if index.n_titled < index.n_spectra {
        match missing {
            MissingTitlePolicy::Fail => {
                let condition = if index.n_titled == 0 {
                    "No spectrum titles found in file"
                } else {
                    "Spectrum titles missing in file"
                };
                sink.append_line(
                    &format!(
                        "Warning: {}: {}. Titles are mandatory, \
                         see the missing_titles option. File will be ignored.",
                        condition,
                        path.display()
                    ),
                    true,
                    true,
                );
                return Ok(Validation::Rejected);
            }
            MissingTitlePolicy::Insert => {
                sink.append_line(
                    &format!("Adding missing spectrum titles in file: {}", path.display()),
                    false,
                    true,
                );
                let inserted = mgf::add_missing_titles(path)?;
                log::trace!("{}: inserted {} titles", path.display(), inserted);
                index = MgfIndex::build(path)?;
            }
        }
    }

    if !index.peak_picked {
        sink.append_line(
            &format!(
                "Warning: The file '{}' contains zero intensity peaks. \
                 It is highly recommended to apply peak picking before starting a search.",
                index.file_name
            ),
            false,
            true,
        );
    }

    if index.max_peak_count == 0 {
        sink.append_line(
            &format!(
                "Warning: No MS2 spectra found in file: {}. File will be ignored.",
                index.file_name
            ),
            true,
            true,
        );
        return Ok(Validation::Rejected);
    }

    if index.has_duplicated_titles() {
        sink.append_line(
            &format!(
                "Warning: The file '{}' contains non-unique spectrum titles.",
                index.file_name
            ),
            false,
            true,
        );
        match duplicate {
            DuplicateTitlePolicy::Fail => {
                // advisory only; duplicates do not exclude a file
            }
            DuplicateTitlePolicy::Rename => {
                sink.append_line(
                    &format!(
                        "Renaming duplicated spectrum titles in file: {}",
                        path.display()
                    ),
                    false,
                    true,
                );
                let renamed = mgf::rename_duplicate_titles(path)?;
                log::trace!("{}: renamed {} titles", path.display(), renamed);
                index = MgfIndex::build(path)?;
            }
            DuplicateTitlePolicy::Drop => {
                sink.append_line(
                    &format!(
                        "Removing spectra with duplicated titles in file: {}",
                        path.display()
                    ),
                    false,
                    true,
                );
                let removed = mgf::remove_duplicate_titles(path)?;
                log::trace!("{}: removed {} spectra", path.display(), removed);
                index = MgfIndex::build(path)?;
            }
        }
    }

    Ok(Validation::Accepted(index))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::progress::MemorySink;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn spectrum(title: Option<&str>, peaks: &[(f64, f64)]) -> String {
        let mut block = String::from("BEGIN IONS\n");
        if let Some(title) = title {
            block.push_str(&format!("TITLE={}\n", title));
        }
        block.push_str("PEPMASS=500.2 1200.0\n");
        for (mz, intensity) in peaks {
            block.push_str(&format!("{} {}\n", mz, intensity));
        }
        block.push_str("END IONS\n");
        block
    }

    fn write_mgf(dir: &TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, content).unwrap();
        path
    }

    const PEAKS: &[(f64, f64)] = &[(100.1, 250.0), (101.2, 300.5)];

    #[test]
    fn test_clean_file_accepted_unmodified() {
        let dir = TempDir::new().unwrap();
        let content = format!(
            "{}{}",
            spectrum(Some("scan=1"), PEAKS),
            spectrum(Some("scan=2"), PEAKS)
        );
        let path = write_mgf(&dir, "clean.mgf", &content);

        let sink = MemorySink::new();
        let outcome = validate_file(
            &path,
            MissingTitlePolicy::Fail,
            DuplicateTitlePolicy::Fail,
            &sink,
        )
        .unwrap();

        assert!(outcome.is_accepted());
        // no rewrite may happen on clean input
        assert_eq!(fs::read_to_string(&path).unwrap(), content);
        assert!(sink.error_lines().is_empty());
    }

    #[test]
    fn test_missing_title_fail_rejects_without_mutation() {
        let dir = TempDir::new().unwrap();
        let content = format!(
            "{}{}",
            spectrum(Some("scan=1"), PEAKS),
            spectrum(None, PEAKS)
        );
        let path = write_mgf(&dir, "untitled.mgf", &content);

        let sink = MemorySink::new();
        let outcome = validate_file(
            &path,
            MissingTitlePolicy::Fail,
            DuplicateTitlePolicy::Fail,
            &sink,
        )
        .unwrap();

        assert!(!outcome.is_accepted());
        assert_eq!(fs::read_to_string(&path).unwrap(), content);
        assert!(sink
            .error_lines()
            .iter()
            .any(|l| l.contains("Spectrum titles missing")));
    }

    #[test]
    fn test_missing_title_insert_repairs_and_reindexes() {
        let dir = TempDir::new().unwrap();
        let content = format!(
            "{}{}",
            spectrum(None, PEAKS),
            spectrum(Some("scan=2"), PEAKS)
        );
        let path = write_mgf(&dir, "untitled.mgf", &content);

        let sink = MemorySink::new();
        let outcome = validate_file(
            &path,
            MissingTitlePolicy::Insert,
            DuplicateTitlePolicy::Fail,
            &sink,
        )
        .unwrap();

        match outcome {
            Validation::Accepted(index) => {
                assert_eq!(index.n_titled, index.n_spectra);
            }
            Validation::Rejected => panic!("expected acceptance after title insertion"),
        }
        assert!(fs::read_to_string(&path)
            .unwrap()
            .contains("TITLE=Spectrum 1"));
    }

    #[test]
    fn test_no_ms2_content_rejects() {
        let dir = TempDir::new().unwrap();
        let path = write_mgf(&dir, "empty.mgf", &spectrum(Some("scan=1"), &[]));

        let sink = MemorySink::new();
        let outcome = validate_file(
            &path,
            MissingTitlePolicy::Fail,
            DuplicateTitlePolicy::Fail,
            &sink,
        )
        .unwrap();

        assert!(!outcome.is_accepted());
        assert!(sink
            .error_lines()
            .iter()
            .any(|l| l.contains("No MS2 spectra")));
    }

    #[test]
    fn test_zero_intensity_is_advisory_only() {
        let dir = TempDir::new().unwrap();
        let path = write_mgf(
            &dir,
            "profile.mgf",
            &spectrum(Some("scan=1"), &[(100.1, 0.0), (101.2, 42.0)]),
        );

        let sink = MemorySink::new();
        let outcome = validate_file(
            &path,
            MissingTitlePolicy::Fail,
            DuplicateTitlePolicy::Fail,
            &sink,
        )
        .unwrap();

        assert!(outcome.is_accepted());
        assert!(sink
            .reports()
            .iter()
            .any(|r| r.text.contains("zero intensity") && !r.is_error));
    }

    #[test]
    fn test_duplicates_under_fail_warn_but_accept() {
        let dir = TempDir::new().unwrap();
        let content = format!("{}{}", spectrum(Some("A"), PEAKS), spectrum(Some("A"), PEAKS));
        let path = write_mgf(&dir, "dups.mgf", &content);

        let sink = MemorySink::new();
        let outcome = validate_file(
            &path,
            MissingTitlePolicy::Fail,
            DuplicateTitlePolicy::Fail,
            &sink,
        )
        .unwrap();

        assert!(outcome.is_accepted());
        assert_eq!(fs::read_to_string(&path).unwrap(), content);
        assert!(sink
            .reports()
            .iter()
            .any(|r| r.text.contains("non-unique spectrum titles")));
    }

    #[test]
    fn test_duplicates_dropped() {
        let dir = TempDir::new().unwrap();
        let content = format!(
            "{}{}{}",
            spectrum(Some("A"), PEAKS),
            spectrum(Some("A"), PEAKS),
            spectrum(Some("B"), PEAKS)
        );
        let path = write_mgf(&dir, "dups.mgf", &content);

        let sink = MemorySink::new();
        let outcome = validate_file(
            &path,
            MissingTitlePolicy::Fail,
            DuplicateTitlePolicy::Drop,
            &sink,
        )
        .unwrap();

        match outcome {
            Validation::Accepted(index) => {
                assert_eq!(index.n_spectra, 2);
                assert!(!index.has_duplicated_titles());
            }
            Validation::Rejected => panic!("expected acceptance after dedup"),
        }
        let titles: Vec<String> = fs::read_to_string(&path)
            .unwrap()
            .lines()
            .filter_map(|l| l.strip_prefix("TITLE=").map(str::to_string))
            .collect();
        assert_eq!(titles, vec!["A".to_string(), "B".to_string()]);
    }

    #[test]
    fn test_duplicates_renamed() {
        let dir = TempDir::new().unwrap();
        let content = format!("{}{}", spectrum(Some("A"), PEAKS), spectrum(Some("A"), PEAKS));
        let path = write_mgf(&dir, "dups.mgf", &content);

        let sink = MemorySink::new();
        let outcome = validate_file(
            &path,
            MissingTitlePolicy::Fail,
            DuplicateTitlePolicy::Rename,
            &sink,
        )
        .unwrap();

        match outcome {
            Validation::Accepted(index) => {
                assert_eq!(index.n_spectra, 2);
                assert!(!index.has_duplicated_titles());
            }
            Validation::Rejected => panic!("expected acceptance after rename"),
        }
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let sink = MemorySink::new();
        let result = validate_file(
            &dir.path().join("nope.mgf"),
            MissingTitlePolicy::Fail,
            DuplicateTitlePolicy::Fail,
            &sink,
        );
        assert!(result.is_err());
    }
}
