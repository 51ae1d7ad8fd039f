//! Category/level logging for the emulation core.
//!
//! Every log line carries a category name and a numeric level; a line is
//! emitted only when its level is at or below the category's runtime
//! threshold (lower = more severe). The shell's `log <category> <level>`
//! command adjusts thresholds while the machine runs, which is how
//! logpoints are silenced or opened up without rebuilding.
//!
//! Output goes to registered [`LogSink`]s. The default sink writes to
//! stderr; tests install a [`CaptureSink`] and assert on the captured
//! lines.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock};

// ---------------------------------------------------------------------------
// Levels — lower = more severe
// ---------------------------------------------------------------------------

/// Conventional level for errors.
pub const ERROR: u8 = 10;
/// Conventional level for warnings.
pub const WARN: u8 = 20;
/// Conventional level for informational messages.
pub const INFO: u8 = 30;
/// Conventional level for debug output.
pub const DEBUG: u8 = 40;
/// Conventional level for very verbose tracing.
pub const TRACE: u8 = 50;

/// Threshold applied to categories that were never configured.
const DEFAULT_THRESHOLD: u8 = INFO;

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

/// An output sink for formatted log lines.
pub trait LogSink: Send {
    /// Writes one complete log line (no trailing newline).
    fn write_line(&self, line: &str);
}

/// A [`LogSink`] that writes to the process stderr stream.
pub struct StderrSink;

impl LogSink for StderrSink {
    fn write_line(&self, line: &str) {
        eprintln!("{line}");
    }
}

/// A [`LogSink`] that accumulates lines in memory for test assertions.
#[derive(Clone, Default)]
pub struct CaptureSink {
    lines: Arc<Mutex<Vec<String>>>,
}

impl CaptureSink {
    /// Creates an empty capture sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of every line captured so far.
    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().expect("capture sink poisoned").clone()
    }

    /// Returns true if any captured line contains `needle`.
    #[must_use]
    pub fn contains(&self, needle: &str) -> bool {
        self.lines().iter().any(|l| l.contains(needle))
    }
}

impl LogSink for CaptureSink {
    fn write_line(&self, line: &str) {
        self.lines.lock().expect("capture sink poisoned").push(line.to_owned());
    }
}

// ---------------------------------------------------------------------------
// Global logger state
// ---------------------------------------------------------------------------

struct Logger {
    sinks: Vec<Box<dyn LogSink>>,
    thresholds: HashMap<String, u8>,
}

impl Logger {
    fn threshold(&self, category: &str) -> u8 {
        self.thresholds.get(category).copied().unwrap_or(DEFAULT_THRESHOLD)
    }
}

fn logger() -> &'static Mutex<Logger> {
    static LOGGER: OnceLock<Mutex<Logger>> = OnceLock::new();
    LOGGER.get_or_init(|| {
        Mutex::new(Logger {
            sinks: vec![Box::new(StderrSink)],
            thresholds: HashMap::new(),
        })
    })
}

/// Sets the runtime threshold for `category`.
///
/// Messages in `category` with `level <= threshold` are emitted.
pub fn set_threshold(category: &str, threshold: u8) {
    let mut lg = logger().lock().expect("logger poisoned");
    lg.thresholds.insert(category.to_owned(), threshold);
}

/// Returns the current threshold for `category`.
#[must_use]
pub fn threshold(category: &str) -> u8 {
    logger().lock().expect("logger poisoned").threshold(category)
}

/// Returns true if a message at `level` in `category` would be emitted.
#[must_use]
pub fn enabled(category: &str, level: u8) -> bool {
    level <= threshold(category)
}

/// Replaces all sinks with `sink`. Returns nothing; the previous sinks are
/// dropped.
pub fn set_sink(sink: Box<dyn LogSink>) {
    let mut lg = logger().lock().expect("logger poisoned");
    lg.sinks = vec![sink];
}

/// Adds an additional sink alongside the existing ones.
pub fn add_sink(sink: Box<dyn LogSink>) {
    let mut lg = logger().lock().expect("logger poisoned");
    lg.sinks.push(sink);
}

/// Implementation detail for [`clog!`]. Not public API.
#[doc(hidden)]
pub fn _log(category: &str, level: u8, args: fmt::Arguments<'_>) {
    let lg = logger().lock().expect("logger poisoned");
    if level > lg.threshold(category) {
        return;
    }
    let line = format!("[{category}] {args}");
    for sink in &lg.sinks {
        sink.write_line(&line);
    }
}

/// Logs a message in `category` at `level`.
#[macro_export]
macro_rules! clog {
    ($category:expr, $level:expr, $($arg:tt)*) => {
        $crate::log::_log($category, $level, format_args!($($arg)*))
    };
}

/// Logs an error-level message.
#[macro_export]
macro_rules! cerr {
    ($category:expr, $($arg:tt)*) => { $crate::clog!($category, $crate::log::ERROR, $($arg)*) };
}

/// Logs a warning-level message.
#[macro_export]
macro_rules! cwarn {
    ($category:expr, $($arg:tt)*) => { $crate::clog!($category, $crate::log::WARN, $($arg)*) };
}

/// Logs an info-level message.
#[macro_export]
macro_rules! cinfo {
    ($category:expr, $($arg:tt)*) => { $crate::clog!($category, $crate::log::INFO, $($arg)*) };
}

/// Logs a debug-level message.
#[macro_export]
macro_rules! cdebug {
    ($category:expr, $($arg:tt)*) => { $crate::clog!($category, $crate::log::DEBUG, $($arg)*) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_filtering() {
        let capture = CaptureSink::new();
        set_sink(Box::new(capture.clone()));
        set_threshold("filter-test", 25);

        crate::clog!("filter-test", 20, "kept {}", 1);
        crate::clog!("filter-test", 30, "dropped");

        assert!(capture.contains("kept 1"));
        assert!(!capture.contains("dropped"));
        set_sink(Box::new(StderrSink));
    }

    #[test]
    fn unconfigured_category_uses_default() {
        assert!(enabled("never-configured", ERROR));
        assert!(!enabled("never-configured", TRACE));
    }
}
