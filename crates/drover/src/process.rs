//! Supervision of one external search-engine process.
//!
//! A [`ProcessRun`] owns the whole lifecycle of a single invocation:
//! spawn, stream interpretation, cancellation and reaping. Supervisors
//! are independent of one another; the progress sink is the only thing
//! they share. Cancellation is cooperative: the flag is polled at loop
//! boundaries only, so a cancel request takes effect within one line
//! (or token) of process output rather than instantly.

use std::io::{self, BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use log::{trace, warn};

use crate::progress::{format_duration, ProgressSink};

/// Marker pair some engines wrap a structured failure in, inside
/// otherwise free-text console output.
pub const ERROR_ENVELOPE_OPEN: &str = "<CompomicsError>";
pub const ERROR_ENVELOPE_CLOSE: &str = "</CompomicsError>";

/// How a supervised process's console output is interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputMode {
    /// Relay whole lines, watching for the error envelope.
    LineRelay,
    /// Whitespace- and backspace-delimited tokens from tools that
    /// redraw their progress in place; a token repeating (part of) its
    /// predecessor is suppressed.
    TokenStream,
    /// Relay lines verbatim until `marker` is seen, then treat
    /// `current/total` lines as secondary counter updates.
    StructuredProgress { marker: String },
}

/// Lifecycle of one run. `Created -> Running -> {Completed, Canceled,
/// Failed}`; the three right-hand states are terminal.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RunState {
    Created,
    Running,
    Completed,
    Canceled,
    Failed,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Canceled | RunState::Failed
        )
    }
}

#[derive(Debug)]
pub enum ProcessError {
    /// The OS refused to start the process.
    Spawn(io::Error),
    /// The process could not be reaped after a natural exit.
    Wait(io::Error),
    /// `run` was called on a run that already left the `Created` state.
    AlreadyStarted,
}

impl std::fmt::Display for ProcessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessError::Spawn(e) => write!(f, "failed to start process: {}", e),
            ProcessError::Wait(e) => write!(f, "failed to wait for process: {}", e),
            ProcessError::AlreadyStarted => f.write_str("process was already started"),
        }
    }
}

impl std::error::Error for ProcessError {}

/// One external process invocation.
pub struct ProcessRun {
    name: String,
    command: Vec<String>,
    working_dir: Option<PathBuf>,
    mode: OutputMode,
    state: RunState,
    elapsed: Option<Duration>,
}

impl ProcessRun {
    /// `command` is the full argument vector, program first. The
    /// supervisor does not interpret the arguments beyond handing them
    /// to the OS.
    pub fn new(name: impl Into<String>, command: Vec<String>, mode: OutputMode) -> Self {
        Self {
            name: name.into(),
            command,
            working_dir: None,
            mode,
            state: RunState::Created,
            elapsed: None,
        }
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Elapsed wall-clock time, available once the run is terminal.
    pub fn elapsed(&self) -> Option<Duration> {
        self.elapsed
    }

    /// Spawn the process and stream its output into `sink` until the
    /// stream ends or cancellation is observed.
    ///
    /// Exactly one spawn is attempted. A spawn failure is surfaced both
    /// on the sink and as a hard error. After end-of-stream the shared
    /// cancellation flag decides between killing the child (state
    /// `Canceled`) and awaiting its natural exit (state `Completed`,
    /// with a completion line carrying the elapsed duration). Stream
    /// read failures are reported but do not cancel the run.
    pub fn run(&mut self, sink: &dyn ProgressSink) -> Result<RunState, ProcessError> {
        if self.state != RunState::Created {
            return Err(ProcessError::AlreadyStarted);
        }
        let start = Instant::now();

        let (program, args) = match self.command.split_first() {
            Some(parts) => parts,
            None => {
                self.state = RunState::Failed;
                return Err(ProcessError::Spawn(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "empty command",
                )));
            }
        };
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped());
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.state = RunState::Failed;
                sink.append_line(
                    &format!("{} failed to start: {}", self.name, e),
                    true,
                    true,
                );
                return Err(ProcessError::Spawn(e));
            }
        };
        self.state = RunState::Running;
        trace!("{}: spawned pid {}", self.name, child.id());

        if let Some(stdout) = child.stdout.take() {
            let reader = BufReader::new(stdout);
            match &self.mode {
                OutputMode::LineRelay => relay_lines(reader, sink),
                OutputMode::TokenStream => relay_tokens(reader, sink),
                OutputMode::StructuredProgress { marker } => {
                    relay_structured(reader, marker, sink)
                }
            }
            // the reader (and with it the pipe) is closed here on
            // every path, canceled or not
        }

        if sink.is_canceled() {
            // one termination request, whether the cancel came from the
            // user or from an error envelope; killing a child that
            // already exited is a no-op
            if let Err(e) = child.kill() {
                trace!("{}: kill after cancel: {}", self.name, e);
            }
            if let Err(e) = child.wait() {
                trace!("{}: reap after kill: {}", self.name, e);
            }
            self.elapsed = Some(start.elapsed());
            self.state = RunState::Canceled;
            return Ok(self.state);
        }

        let status = match child.wait() {
            Ok(status) => status,
            Err(e) => {
                self.state = RunState::Failed;
                return Err(ProcessError::Wait(e));
            }
        };
        let elapsed = start.elapsed();
        self.elapsed = Some(elapsed);
        if !status.success() {
            warn!("{} exited with {}", self.name, status);
        }

        sink.append_blank_line();
        sink.append_line(
            &format!("{} finished ({}).", self.name, format_duration(elapsed)),
            false,
            true,
        );
        self.state = RunState::Completed;
        Ok(self.state)
    }
}

/// Default strategy: one report unit per line, with error-envelope
/// detection. A detected envelope forwards the inner text flagged as an
/// error and requests cancellation for the whole run.
fn relay_lines<R: BufRead>(mut reader: R, sink: &dyn ProgressSink) {
    let mut line = String::new();
    loop {
        if sink.is_canceled() {
            break;
        }
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                // pipe flakiness is not a tool failure; report and stop
                // reading without canceling the run
                sink.append_line(&format!("error reading process output: {}", e), true, true);
                break;
            }
        }
        let text = line.trim_end_matches(|c| c == '\r' || c == '\n');
        if let Some(open) = text.find(ERROR_ENVELOPE_OPEN) {
            let inner = &text[open + ERROR_ENVELOPE_OPEN.len()..];
            let inner = match inner.find(ERROR_ENVELOPE_CLOSE) {
                Some(close) => &inner[..close],
                None => inner,
            };
            sink.append_blank_line();
            sink.append_line(inner, true, true);
            sink.request_cancel();
        } else {
            sink.append_line(text, false, true);
        }
    }
}

/// Strategy for chatty tools that redraw progress in place: tokens are
/// delimited by whitespace or backspaces, and a token already contained
/// in its predecessor is dropped. A token carrying a percentage stays
/// on the current line until it reports 100%.
fn relay_tokens<R: BufRead>(mut reader: R, sink: &dyn ProgressSink) {
    let mut last = String::new();
    loop {
        if sink.is_canceled() {
            break;
        }
        match next_token(&mut reader) {
            Ok(None) => break,
            Ok(Some(token)) => {
                if !last.contains(&token) {
                    let end_of_line = !token.contains('%') || token.contains("100%");
                    sink.append_line(&format!("{} ", token), false, end_of_line);
                }
                last = token;
            }
            Err(e) => {
                sink.append_line(&format!("error reading process output: {}", e), true, true);
                break;
            }
        }
    }
}

fn next_token<R: BufRead>(reader: &mut R) -> io::Result<Option<String>> {
    let mut token: Vec<u8> = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        if reader.read(&mut byte)? == 0 {
            break;
        }
        match byte[0] {
            b' ' | b'\t' | b'\r' | b'\n' | 0x08 => {
                if !token.is_empty() {
                    break;
                }
            }
            other => token.push(other),
        }
    }
    if token.is_empty() {
        Ok(None)
    } else {
        Ok(Some(String::from_utf8_lossy(&token).into_owned()))
    }
}

/// Strategy for tools that switch to `current/total` countdown lines
/// after a marker line. Counter lines feed the secondary counter and
/// are suppressed from the textual report; everything else is relayed.
fn relay_structured<R: BufRead>(mut reader: R, marker: &str, sink: &dyn ProgressSink) {
    let mut counting = false;
    let mut known_total: Option<usize> = None;
    let mut line = String::new();
    loop {
        if sink.is_canceled() {
            break;
        }
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                sink.append_line(&format!("error reading process output: {}", e), true, true);
                break;
            }
        }
        let text = line.trim_end_matches(|c| c == '\r' || c == '\n');
        if counting {
            if let Some((current, total)) = parse_counter(text) {
                if known_total != Some(total) {
                    sink.set_secondary_max(total);
                    known_total = Some(total);
                }
                sink.set_secondary_current(current);
                continue;
            }
            // lines that do not parse as counters fall through and are
            // relayed like any other output
        }
        sink.append_line(text, false, true);
        if text.starts_with(marker) {
            counting = true;
            sink.reset_secondary();
            sink.set_secondary_indeterminate(false);
        }
    }
    sink.set_secondary_indeterminate(true);
}

fn parse_counter(line: &str) -> Option<(usize, usize)> {
    let (current, total) = line.split_once('/')?;
    Some((
        current.trim().parse().ok()?,
        total.trim().parse().ok()?,
    ))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::progress::MemorySink;

    fn shell(name: &str, script: &str, mode: OutputMode) -> ProcessRun {
        ProcessRun::new(
            name,
            vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()],
            mode,
        )
    }

    #[test]
    fn test_silent_success_completes() {
        let sink = MemorySink::new();
        let mut run = shell("quiet", "exit 0", OutputMode::LineRelay);
        assert_eq!(run.state(), RunState::Created);

        let state = run.run(&sink).unwrap();
        assert_eq!(state, RunState::Completed);
        assert!(run.state().is_terminal());
        assert!(run.elapsed().is_some());

        let reports = sink.reports();
        let completion = reports.last().unwrap();
        assert!(completion.text.starts_with("quiet finished ("));
        assert!(!sink.is_canceled());
    }

    #[test]
    fn test_lines_relayed_in_order() {
        let sink = MemorySink::new();
        let mut run = shell("echo", "printf 'a\\nb\\n'", OutputMode::LineRelay);
        run.run(&sink).unwrap();

        let lines: Vec<String> = sink.reports().into_iter().map(|r| r.text).collect();
        assert_eq!(&lines[..2], &["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_error_envelope_cancels_run() {
        let sink = MemorySink::new();
        let mut run = shell(
            "engine",
            "echo '<CompomicsError>disk full</CompomicsError>'; sleep 5",
            OutputMode::LineRelay,
        );

        let state = run.run(&sink).unwrap();
        assert_eq!(state, RunState::Canceled);
        assert!(sink.is_canceled());
        assert_eq!(sink.error_lines(), vec!["disk full".to_string()]);
    }

    #[test]
    fn test_cancellation_before_output_kills_child() {
        let sink = MemorySink::new();
        sink.request_cancel();

        let start = std::time::Instant::now();
        let mut run = shell("slow", "sleep 30", OutputMode::LineRelay);
        let state = run.run(&sink).unwrap();

        assert_eq!(state, RunState::Canceled);
        // the child must have been killed, not awaited
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_spawn_failure() {
        let sink = MemorySink::new();
        let mut run = ProcessRun::new(
            "ghost",
            vec!["/nonexistent/definitely-not-a-binary".to_string()],
            OutputMode::LineRelay,
        );

        match run.run(&sink) {
            Err(ProcessError::Spawn(_)) => {}
            other => panic!("expected spawn failure, got {:?}", other.map(|_| ())),
        }
        assert_eq!(run.state(), RunState::Failed);
        assert!(!sink.error_lines().is_empty());
    }

    #[test]
    fn test_run_is_single_shot() {
        let sink = MemorySink::new();
        let mut run = shell("quiet", "exit 0", OutputMode::LineRelay);
        run.run(&sink).unwrap();

        match run.run(&sink) {
            Err(ProcessError::AlreadyStarted) => {}
            other => panic!("expected AlreadyStarted, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_token_stream_collapses_redraws() {
        let sink = MemorySink::new();
        let mut run = shell("chatty", "echo 'abc ab abc'", OutputMode::TokenStream);
        run.run(&sink).unwrap();

        let tokens: Vec<String> = sink
            .reports()
            .into_iter()
            .map(|r| r.text)
            .filter(|t| !t.is_empty() && !t.starts_with("chatty finished"))
            .collect();
        // 'ab' repeats part of 'abc' and is dropped; the second 'abc'
        // is new relative to 'ab' and comes through
        assert_eq!(tokens, vec!["abc ".to_string(), "abc ".to_string()]);
    }

    #[test]
    fn test_token_stream_percentages_stay_in_place() {
        let sink = MemorySink::new();
        let mut run = shell("chatty", "echo '10% 50% 100%'", OutputMode::TokenStream);
        run.run(&sink).unwrap();

        let reports = sink.reports();
        let ten = reports.iter().find(|r| r.text == "10% ").unwrap();
        assert!(!ten.end_of_line);
        let done = reports.iter().find(|r| r.text == "100% ").unwrap();
        assert!(done.end_of_line);
    }

    #[test]
    fn test_structured_progress_updates_counter() {
        let sink = MemorySink::new();
        let script = "echo starting; \
                      echo 'writing output file: out.mzML'; \
                      echo ' 1/20'; echo ' 5/20'; \
                      echo done";
        let mut run = shell(
            "converter",
            script,
            OutputMode::StructuredProgress {
                marker: "writing output file:".to_string(),
            },
        );
        run.run(&sink).unwrap();

        let lines: Vec<String> = sink.reports().into_iter().map(|r| r.text).collect();
        assert!(lines.contains(&"starting".to_string()));
        assert!(lines.contains(&"writing output file: out.mzML".to_string()));
        assert!(lines.contains(&"done".to_string()));
        // counter lines never reach the textual report
        assert!(!lines.iter().any(|l| l.contains("1/20")));

        let secondary = sink.secondary();
        assert_eq!(secondary.max, 20);
        assert_eq!(secondary.current, 5);
        // the counter returns to indeterminate at end-of-stream
        assert!(secondary.indeterminate);
    }

    #[test]
    fn test_empty_command_fails() {
        let sink = MemorySink::new();
        let mut run = ProcessRun::new("empty", Vec::new(), OutputMode::LineRelay);
        assert!(run.run(&sink).is_err());
        assert_eq!(run.state(), RunState::Failed);
    }
}
