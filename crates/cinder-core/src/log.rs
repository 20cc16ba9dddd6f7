// SPDX-License-Identifier: CEPL-1.0
//! Logging capability passed explicitly into every component.
//!
//! Components hold a [`Logger`], a cheap clone of a shared [`LogSink`] plus
//! the name of the component emitting the record. The default sink forwards
//! to `tracing`; tests install a [`CaptureSink`] and inspect what was logged.

use std::fmt;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    /// Unrecoverable for the caller. Logged, never acted upon by the sink.
    Fatal,
}

pub trait LogSink: Send + Sync {
    fn log(&self, level: Level, component: &'static str, args: fmt::Arguments<'_>);
}

/// Forwards records to the global `tracing` subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn log(&self, level: Level, component: &'static str, args: fmt::Arguments<'_>) {
        match level {
            Level::Trace => tracing::trace!(component, "{args}"),
            Level::Debug => tracing::debug!(component, "{args}"),
            Level::Info => tracing::info!(component, "{args}"),
            Level::Warn => tracing::warn!(component, "{args}"),
            Level::Error => tracing::error!(component, "{args}"),
            Level::Fatal => tracing::error!(component, fatal = true, "{args}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub level: Level,
    pub component: &'static str,
    pub message: String,
}

/// Keeps every record in memory.
#[derive(Debug, Default)]
pub struct CaptureSink {
    records: Mutex<Vec<Record>>,
}

impl CaptureSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn records(&self) -> Vec<Record> {
        self.lock().clone()
    }

    pub fn count(&self, level: Level) -> usize {
        self.lock().iter().filter(|r| r.level == level).count()
    }

    /// True if any record at `level` contains `needle`.
    pub fn contains(&self, level: Level, needle: &str) -> bool {
        self.lock()
            .iter()
            .any(|r| r.level == level && r.message.contains(needle))
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Record>> {
        // A panic while holding the lock only loses log lines.
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl LogSink for CaptureSink {
    fn log(&self, level: Level, component: &'static str, args: fmt::Arguments<'_>) {
        self.lock().push(Record {
            level,
            component,
            message: args.to_string(),
        });
    }
}

/// A component-scoped handle onto a shared sink.
#[derive(Clone)]
pub struct Logger {
    sink: Arc<dyn LogSink>,
    component: &'static str,
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("component", &self.component)
            .finish_non_exhaustive()
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::tracing()
    }
}

impl Logger {
    pub fn new(sink: Arc<dyn LogSink>) -> Self {
        Self {
            sink,
            component: "cinder",
        }
    }

    pub fn tracing() -> Self {
        Self::new(Arc::new(TracingSink))
    }

    /// Same sink, different component name.
    pub fn scoped(&self, component: &'static str) -> Self {
        Self {
            sink: Arc::clone(&self.sink),
            component,
        }
    }

    pub fn component(&self) -> &'static str {
        self.component
    }

    pub fn log(&self, level: Level, args: fmt::Arguments<'_>) {
        self.sink.log(level, self.component, args);
    }

    pub fn trace(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Trace, args);
    }

    pub fn debug(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Debug, args);
    }

    pub fn info(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Info, args);
    }

    pub fn warn(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Warn, args);
    }

    pub fn error(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Error, args);
    }

    pub fn fatal(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Fatal, args);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scoped_logger_tags_records_with_component() {
        let sink = CaptureSink::new();
        let root = Logger::new(sink.clone());
        let device = root.scoped("device");

        device.info(format_args!("swapchain ready {}x{}", 800, 600));
        root.fatal(format_args!("no device"));

        let records = sink.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].component, "device");
        assert_eq!(records[0].message, "swapchain ready 800x600");
        assert_eq!(records[1].level, Level::Fatal);
        assert_eq!(records[1].component, "cinder");
    }

    #[test]
    fn capture_sink_filters_by_level() {
        let sink = CaptureSink::new();
        let log = Logger::new(sink.clone()).scoped("command");
        log.warn(format_args!("dropped while recording"));
        log.debug(format_args!("freed"));

        assert_eq!(sink.count(Level::Warn), 1);
        assert!(sink.contains(Level::Warn, "recording"));
        assert!(!sink.contains(Level::Debug, "recording"));

        sink.clear();
        assert!(sink.records().is_empty());
    }
}
