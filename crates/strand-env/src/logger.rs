// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Structured logging subsystem.
//!
//! Components report through a shared `Logger` rather than printing.
//! Items carry the caller's source location so a sink can point back at
//! the submitting code.

use std::panic::Location;
use std::sync::{Arc, Mutex};

/// Severity of a log item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Info,
    Warn,
    Error,
}

/// One structured log record.
#[derive(Debug, Clone)]
pub struct LogItem {
    pub level: LogLevel,
    pub contents: String,
    /// Source location of the code that submitted the item.
    pub origin: &'static Location<'static>,
    /// Rendered error that triggered the item, if any.
    pub cause: Option<String>,
}

impl LogItem {
    #[track_caller]
    pub fn new(level: LogLevel, contents: impl Into<String>) -> Self {
        Self {
            level,
            contents: contents.into(),
            origin: Location::caller(),
            cause: None,
        }
    }

    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }
}

/// Thread-safe log sink.
pub trait Logger: Send + Sync + 'static {
    fn push(&self, item: LogItem);

    #[track_caller]
    fn trace(&self, contents: &str) {
        self.push(LogItem::new(LogLevel::Trace, contents));
    }

    #[track_caller]
    fn info(&self, contents: &str) {
        self.push(LogItem::new(LogLevel::Info, contents));
    }

    #[track_caller]
    fn warn(&self, contents: &str) {
        self.push(LogItem::new(LogLevel::Warn, contents));
    }

    #[track_caller]
    fn error(&self, contents: &str) {
        self.push(LogItem::new(LogLevel::Error, contents));
    }
}

/// Discards everything.
pub struct NullLogger;

impl NullLogger {
    pub fn shared() -> Arc<dyn Logger> {
        Arc::new(NullLogger)
    }
}

impl Logger for NullLogger {
    fn push(&self, _item: LogItem) {}
}

/// Collects items in memory; the test-suites' sink.
#[derive(Default)]
pub struct BufferLogger {
    items: Mutex<Vec<LogItem>>,
}

impl BufferLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain all collected items.
    pub fn take(&self) -> Vec<LogItem> {
        std::mem::take(&mut self.items.lock().unwrap())
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Logger for BufferLogger {
    fn push(&self, item: LogItem) {
        self.items.lock().unwrap().push(item);
    }
}
