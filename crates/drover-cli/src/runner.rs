use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Context;
use log::info;
use rayon::prelude::*;
use sysinfo::{System, SystemExt};

use drover_core::process::{ProcessRun, RunState};
use drover_core::progress::ProgressSink;
use drover_core::split;
use drover_core::validate::{self, Validation};

use crate::input::{EngineEntry, RunConfig};

const BYTES_PER_MB: u64 = 1_048_576;
const INPUT_LIST_NAME: &str = "drover_input.txt";

pub struct Runner {
    pub parameters: RunConfig,
    start: Instant,
}

/// What happened across all engine invocations of one run.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub completed: usize,
    pub canceled: usize,
    pub failed: usize,
    /// The spectrum files that were actually handed to the engines,
    /// after validation and splitting.
    pub dispatched_files: Vec<PathBuf>,
}

impl Runner {
    pub fn new(parameters: RunConfig) -> anyhow::Result<Self> {
        let mut system = System::default();
        system.refresh_all();
        info!("drover v{}", parameters.version);
        info!(
            "os: {}, memory: {} MB, cpus: {}",
            system.long_os_version().unwrap_or_default(),
            system.total_memory() / BYTES_PER_MB,
            num_cpus::get()
        );

        Ok(Self {
            parameters,
            start: Instant::now(),
        })
    }

    /// Normalize the input files, then fan one supervisor per engine
    /// out over the worker pool. The sink is shared by every
    /// supervisor; a cancellation raised by any of them is visible to
    /// all.
    pub fn run(&self, sink: &dyn ProgressSink) -> anyhow::Result<RunSummary> {
        self.write_config()?;
        let inputs = self.prepare_inputs(sink)?;

        sink.append_line(
            &format!("Current spectrum input (listed in {}):", INPUT_LIST_NAME),
            false,
            true,
        );
        for path in &inputs {
            sink.append_line(&path.display().to_string(), false, true);
        }
        self.write_input_list(&inputs)?;
        sink.append_blank_line();

        let outcomes: Vec<RunState> = self
            .parameters
            .engines
            .par_iter()
            .map(|engine| self.dispatch(engine, &inputs, sink))
            .collect();

        let mut summary = RunSummary {
            dispatched_files: inputs,
            ..RunSummary::default()
        };
        for outcome in outcomes {
            match outcome {
                RunState::Completed => summary.completed += 1,
                RunState::Canceled => summary.canceled += 1,
                _ => summary.failed += 1,
            }
        }

        info!(
            "run finished in {:#?}: {} completed, {} canceled, {} failed",
            self.start.elapsed(),
            summary.completed,
            summary.canceled,
            summary.failed
        );
        if sink.is_canceled() {
            sink.append_line("Run canceled.", true, true);
        }
        Ok(summary)
    }

    /// Validate every input file, then split the ones above the size
    /// threshold. Files that fail validation or splitting are reported
    /// and excluded; the run continues with the rest.
    fn prepare_inputs(&self, sink: &dyn ProgressSink) -> anyhow::Result<Vec<PathBuf>> {
        let mut accepted: Vec<PathBuf> = Vec::new();
        for path in &self.parameters.mgf_paths {
            let path = Path::new(path);
            if !path.is_file() {
                sink.append_line(
                    &format!(
                        "Spectrum file not found: {}. File will be ignored.",
                        path.display()
                    ),
                    true,
                    true,
                );
                continue;
            }
            match validate::validate_file(
                path,
                self.parameters.missing_titles,
                self.parameters.duplicate_titles,
                sink,
            ) {
                Ok(Validation::Accepted(_)) => accepted.push(path.to_path_buf()),
                Ok(Validation::Rejected) => {
                    // the validator already reported why
                }
                Err(e) => {
                    sink.append_line(
                        &format!(
                            "Failed to read {}: {}. File will be ignored.",
                            path.display(),
                            e
                        ),
                        true,
                        true,
                    );
                }
            }
        }

        let threshold = self.parameters.max_file_size_mb * BYTES_PER_MB;
        let mut inputs: Vec<PathBuf> = Vec::new();
        let mut oversized: Vec<PathBuf> = Vec::new();
        for path in accepted {
            let size = std::fs::metadata(&path)
                .with_context(|| format!("Failed to stat {}", path.display()))?
                .len();
            if size > threshold {
                oversized.push(path);
            } else {
                inputs.push(path);
            }
        }

        if !oversized.is_empty() {
            sink.append_blank_line();
            sink.append_line(
                "Spectrum files require splitting. \
                 (See options: max_file_size_mb and max_spectra_per_chunk.)",
                false,
                true,
            );
            for source in &oversized {
                sink.append_line(
                    &format!("Splitting {}. Please wait...", source.display()),
                    false,
                    true,
                );
                match split::split_file(source, self.parameters.max_spectra_per_chunk, sink) {
                    Ok(chunks) => inputs.extend(chunks.into_iter().map(|c| c.path)),
                    Err(e) => {
                        // all-or-nothing per source file
                        sink.append_line(
                            &format!(
                                "Splitting of {} failed: {}. File will be ignored.",
                                source.display(),
                                e
                            ),
                            true,
                            true,
                        );
                    }
                }
            }
        }

        anyhow::ensure!(
            !inputs.is_empty(),
            "no spectrum files left to search after validation"
        );
        Ok(inputs)
    }

    fn dispatch(&self, engine: &EngineEntry, inputs: &[PathBuf], sink: &dyn ProgressSink) -> RunState {
        let mut command = Vec::with_capacity(1 + engine.args.len() + inputs.len());
        command.push(engine.path.clone());
        command.extend(engine.args.iter().cloned());
        command.extend(inputs.iter().map(|p| p.display().to_string()));

        let mut run = ProcessRun::new(&engine.name, command, engine.output.to_mode());
        if let Some(dir) = &engine.working_directory {
            run = run.working_dir(dir);
        }

        sink.append_line(&format!("Starting {}.", engine.name), false, true);
        match run.run(sink) {
            Ok(state) => state,
            Err(e) => {
                // already surfaced on the sink by the supervisor
                log::error!("{}: {}", engine.name, e);
                RunState::Failed
            }
        }
    }

    // Record the resolved configuration next to the results, so a run
    // can be reproduced later
    fn write_config(&self) -> anyhow::Result<()> {
        let path = self.parameters.output_directory.join("drover.run.json");
        let writer = BufWriter::new(
            File::create(&path)
                .with_context(|| format!("Failed to create {}", path.display()))?,
        );
        serde_json::to_writer_pretty(writer, &self.parameters)?;
        Ok(())
    }

    fn write_input_list(&self, inputs: &[PathBuf]) -> anyhow::Result<()> {
        let path = self.parameters.output_directory.join(INPUT_LIST_NAME);
        let mut writer = BufWriter::new(
            File::create(&path)
                .with_context(|| format!("Failed to create {}", path.display()))?,
        );
        for input in inputs {
            writeln!(writer, "{}", input.display())?;
        }
        writer.flush()?;
        Ok(())
    }
}
