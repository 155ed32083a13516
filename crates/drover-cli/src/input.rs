use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

use anyhow::{ensure, Context};
use clap::ArgMatches;
use drover_core::process::OutputMode;
use drover_core::validate::{DuplicateTitlePolicy, MissingTitlePolicy};
use serde::{Deserialize, Serialize};

/// Resolved run configuration - defaults applied, overrides folded in
#[derive(Serialize)]
pub struct RunConfig {
    pub version: String,
    pub mgf_paths: Vec<String>,
    pub engines: Vec<EngineEntry>,
    pub output_directory: PathBuf,
    /// Files above this size (in MiB) are split before dispatch.
    pub max_file_size_mb: u64,
    pub max_spectra_per_chunk: usize,
    pub missing_titles: MissingTitlePolicy,
    pub duplicate_titles: DuplicateTitlePolicy,
    pub threads: usize,
}

/// One search engine to drive. An entry being present means the engine
/// is enabled; the argument vector is passed through untouched, with
/// the surviving spectrum file paths appended.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct EngineEntry {
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_directory: Option<String>,
    #[serde(default)]
    pub output: OutputModeOption,
}

/// Serializable selector for the output-parsing strategy.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum OutputModeOption {
    #[default]
    LineRelay,
    TokenStream,
    StructuredProgress {
        marker: String,
    },
}

impl OutputModeOption {
    pub fn to_mode(&self) -> OutputMode {
        match self {
            OutputModeOption::LineRelay => OutputMode::LineRelay,
            OutputModeOption::TokenStream => OutputMode::TokenStream,
            OutputModeOption::StructuredProgress { marker } => OutputMode::StructuredProgress {
                marker: marker.clone(),
            },
        }
    }
}

/// Input parameters deserialized from the JSON configuration file
#[derive(Deserialize)]
pub struct Input {
    engines: Vec<EngineEntry>,
    mgf_paths: Option<Vec<String>>,
    output_directory: Option<String>,
    max_file_size_mb: Option<u64>,
    max_spectra_per_chunk: Option<usize>,
    missing_titles: Option<MissingTitlePolicy>,
    duplicate_titles: Option<DuplicateTitlePolicy>,
    threads: Option<usize>,
}

impl Input {
    pub fn from_arguments(matches: ArgMatches) -> anyhow::Result<Self> {
        let path = matches
            .get_one::<String>("parameters")
            .expect("required parameters");
        let mut input = Input::load(path)
            .with_context(|| format!("Failed to read parameters from `{path}`"))?;

        // Handle JSON configuration overrides
        if let Some(output_directory) = matches.get_one::<String>("output_directory") {
            log::trace!("overriding `output_directory` parameter.");
            input.output_directory = Some(output_directory.into());
        }
        if let Some(mgf_paths) = matches.get_many::<String>("mgf_paths") {
            log::trace!("overriding `mgf_paths` parameter.");
            input.mgf_paths = Some(mgf_paths.into_iter().map(|p| p.into()).collect());
        }
        if let Some(threads) = matches.get_one::<u16>("threads").copied() {
            log::trace!("overriding `threads` parameter.");
            input.threads = Some(threads as usize);
        }

        ensure!(
            input.output_directory.is_some(),
            "`output_directory` must be set. For more information try '--help'"
        );
        ensure!(
            input.mgf_paths.is_some(),
            "`mgf_paths` must be set. For more information try '--help'"
        );

        Ok(input)
    }

    pub fn load(path: &str) -> anyhow::Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }

    pub fn build(self) -> anyhow::Result<RunConfig> {
        ensure!(
            !self.engines.is_empty(),
            "`engines` must list at least one search engine. For more information try '--help'"
        );
        let mgf_paths = self.mgf_paths.unwrap_or_default();
        ensure!(
            !mgf_paths.is_empty(),
            "`mgf_paths` must list at least one spectrum file. For more information try '--help'"
        );

        let max_spectra_per_chunk = self.max_spectra_per_chunk.unwrap_or(25_000);
        ensure!(
            max_spectra_per_chunk > 0,
            "`max_spectra_per_chunk` must be greater than zero"
        );

        let max_file_size_mb = self.max_file_size_mb.unwrap_or(200);
        if max_file_size_mb < 10 {
            log::warn!(
                "max_file_size_mb is set to {} MB; most engines handle far larger files",
                max_file_size_mb
            );
        }

        let output_directory = match self.output_directory {
            Some(path) => {
                let path = PathBuf::from(path);
                std::fs::create_dir_all(&path)?;
                path
            }
            None => std::env::current_dir()?,
        };

        Ok(RunConfig {
            version: clap::crate_version!().into(),
            mgf_paths,
            engines: self.engines,
            output_directory,
            max_file_size_mb,
            max_spectra_per_chunk,
            missing_titles: self.missing_titles.unwrap_or_default(),
            duplicate_titles: self.duplicate_titles.unwrap_or_default(),
            threads: self.threads.unwrap_or_else(num_cpus::get),
        })
    }
}
