use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Receiver for run feedback, shared by every component of a run.
///
/// Validators, splitters and process supervisors all report through the
/// same sink, and all of them poll the same cancellation flag.
/// Implementations must be shareable across worker threads: each
/// [`append_line`](ProgressSink::append_line) call is one report unit
/// and must reach the output intact, never interleaved with units from
/// other threads. No ordering is guaranteed between threads.
pub trait ProgressSink: Send + Sync {
    /// Append one report unit. `end_of_line` is false for in-place
    /// progress fragments that should not terminate the current line.
    fn append_line(&self, text: &str, is_error: bool, end_of_line: bool);

    /// Terminate the current line without content.
    fn append_blank_line(&self);

    fn is_canceled(&self) -> bool;

    /// Request cooperative cancellation. Producers poll
    /// [`is_canceled`](ProgressSink::is_canceled) at loop boundaries
    /// only, so the request takes effect within one line or token of
    /// process output, not instantly.
    fn request_cancel(&self);

    /// Upper bound for the secondary counter, used for sub-task
    /// progress such as split-chunk counts.
    fn set_secondary_max(&self, max: usize);

    fn set_secondary_current(&self, value: usize);

    fn reset_secondary(&self);

    fn set_secondary_indeterminate(&self, indeterminate: bool);
}

/// Sink writing report units to the console.
///
/// Normal report units go to stdout, error units to stderr. A single
/// lock is held for the duration of each write so that concurrent
/// supervisors never interleave inside one report unit.
#[derive(Default)]
pub struct CliSink {
    canceled: AtomicBool,
    secondary_current: AtomicUsize,
    secondary_max: AtomicUsize,
    secondary_indeterminate: AtomicBool,
    write_lock: Mutex<()>,
}

impl CliSink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProgressSink for CliSink {
    fn append_line(&self, text: &str, is_error: bool, end_of_line: bool) {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        if is_error {
            let mut err = io::stderr().lock();
            let _ = if end_of_line {
                writeln!(err, "{}", text)
            } else {
                write!(err, "{}", text).and_then(|_| err.flush())
            };
        } else {
            let mut out = io::stdout().lock();
            let _ = if end_of_line {
                writeln!(out, "{}", text)
            } else {
                write!(out, "{}", text).and_then(|_| out.flush())
            };
        }
    }

    fn append_blank_line(&self) {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut out = io::stdout().lock();
        let _ = writeln!(out);
    }

    fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    fn request_cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
    }

    fn set_secondary_max(&self, max: usize) {
        self.secondary_max.store(max, Ordering::Relaxed);
    }

    fn set_secondary_current(&self, value: usize) {
        self.secondary_current.store(value, Ordering::Relaxed);
        if self.secondary_indeterminate.load(Ordering::Relaxed) {
            return;
        }
        let max = self.secondary_max.load(Ordering::Relaxed);
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut out = io::stdout().lock();
        let _ = write!(out, "\r{} / {}", value, max).and_then(|_| out.flush());
        if value >= max && max > 0 {
            let _ = writeln!(out);
        }
    }

    fn reset_secondary(&self) {
        self.secondary_current.store(0, Ordering::Relaxed);
    }

    fn set_secondary_indeterminate(&self, indeterminate: bool) {
        self.secondary_indeterminate
            .store(indeterminate, Ordering::Relaxed);
    }
}

/// One recorded report unit, as captured by [`MemorySink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub text: String,
    pub is_error: bool,
    pub end_of_line: bool,
}

/// Secondary counter state, as captured by [`MemorySink`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Secondary {
    pub current: usize,
    pub max: usize,
    pub indeterminate: bool,
}

/// Sink recording every report unit in memory.
///
/// Useful in tests and for embedders that post-process run output
/// instead of printing it.
#[derive(Default)]
pub struct MemorySink {
    canceled: AtomicBool,
    reports: Mutex<Vec<Report>>,
    secondary: Mutex<Secondary>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all report units recorded so far.
    pub fn reports(&self) -> Vec<Report> {
        self.reports
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Text of every unit flagged as an error.
    pub fn error_lines(&self) -> Vec<String> {
        self.reports()
            .into_iter()
            .filter(|r| r.is_error)
            .map(|r| r.text)
            .collect()
    }

    pub fn secondary(&self) -> Secondary {
        self.secondary
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl ProgressSink for MemorySink {
    fn append_line(&self, text: &str, is_error: bool, end_of_line: bool) {
        self.reports
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Report {
                text: text.to_string(),
                is_error,
                end_of_line,
            });
    }

    fn append_blank_line(&self) {
        self.append_line("", false, true);
    }

    fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    fn request_cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
    }

    fn set_secondary_max(&self, max: usize) {
        self.secondary
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .max = max;
    }

    fn set_secondary_current(&self, value: usize) {
        self.secondary
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .current = value;
    }

    fn reset_secondary(&self) {
        self.secondary
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .current = 0;
    }

    fn set_secondary_indeterminate(&self, indeterminate: bool) {
        self.secondary
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .indeterminate = indeterminate;
    }
}

/// Render an elapsed duration for completion report lines.
pub fn format_duration(duration: Duration) -> String {
    let millis = duration.as_millis();
    if millis < 1_000 {
        format!("{} ms", millis)
    } else if millis < 60_000 {
        format!("{:.1} s", duration.as_secs_f64())
    } else {
        let secs = duration.as_secs();
        format!("{} min {} s", secs / 60, secs % 60)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(0)), "0 ms");
        assert_eq!(format_duration(Duration::from_millis(847)), "847 ms");
        assert_eq!(format_duration(Duration::from_millis(2_500)), "2.5 s");
        assert_eq!(format_duration(Duration::from_secs(312)), "5 min 12 s");
    }

    #[test]
    fn test_memory_sink_records_units() {
        let sink = MemorySink::new();
        sink.append_line("hello", false, true);
        sink.append_line("boom", true, true);
        sink.append_blank_line();

        let reports = sink.reports();
        assert_eq!(reports.len(), 3);
        assert_eq!(reports[0].text, "hello");
        assert!(!reports[0].is_error);
        assert_eq!(sink.error_lines(), vec!["boom".to_string()]);
    }

    #[test]
    fn test_cancellation_flag() {
        let sink = MemorySink::new();
        assert!(!sink.is_canceled());
        sink.request_cancel();
        assert!(sink.is_canceled());
        // setting it twice is harmless
        sink.request_cancel();
        assert!(sink.is_canceled());
    }

    #[test]
    fn test_secondary_counter() {
        let sink = MemorySink::new();
        sink.set_secondary_max(20);
        sink.set_secondary_current(5);
        assert_eq!(
            sink.secondary(),
            Secondary {
                current: 5,
                max: 20,
                indeterminate: false
            }
        );
        sink.reset_secondary();
        assert_eq!(sink.secondary().current, 0);
        sink.set_secondary_indeterminate(true);
        assert!(sink.secondary().indeterminate);
    }
}
