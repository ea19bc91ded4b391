// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! The seam between the coordinator and a script interpreter.
//!
//! The coordinator never touches interpreter internals: it spawns
//! threads from compiled functions, resumes them, and hands them a
//! [`LambdaOps`] table for the operations scripts may call back into.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use strand_env::LogLevel;
use strand_value::Value;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ScriptError {
    #[error("script compile failed: {0}")]
    Compile(String),

    #[error("script thread spawn failed: {0}")]
    Spawn(String),

    #[error("clock is not installed in the environment")]
    ClockMissing,
}

/// Compiled script function. Opaque to the coordinator; the owning host
/// downcasts it back on spawn.
#[derive(Clone)]
pub struct ScriptFn {
    inner: Arc<dyn Any + Send + Sync>,
}

impl ScriptFn {
    pub fn new<T: Any + Send + Sync>(inner: T) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.inner.clone().downcast().ok()
    }
}

impl fmt::Debug for ScriptFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ScriptFn")
    }
}

/// Handle to a script-side object held in the interpreter's registry.
/// Dropping releases the registry slot through the host's releaser.
pub struct ScriptRef {
    index: u64,
    release: Option<Box<dyn FnOnce(u64) + Send>>,
}

impl ScriptRef {
    pub fn new<F>(index: u64, release: F) -> Self
    where
        F: FnOnce(u64) + Send + 'static,
    {
        Self {
            index,
            release: Some(Box::new(release)),
        }
    }

    pub fn index(&self) -> u64 {
        self.index
    }
}

impl Drop for ScriptRef {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release(self.index);
        }
    }
}

impl fmt::Debug for ScriptRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptRef").field("index", &self.index).finish()
    }
}

/// What a thread is resumed with.
#[derive(Debug)]
pub enum ResumeArg {
    /// First resume: the registry index of the script-visible context
    /// object.
    Context(u64),
    /// A received value, delivered to a thread paused in `recv`.
    Value(Value),
    /// Wake-up with nothing to deliver (e.g. after `sleep`).
    Wake,
}

/// How a resume ended.
#[derive(Debug)]
pub enum ThreadOutcome {
    /// The script ran to completion.
    Exited,
    /// The script yielded; it is paused and resumable.
    Yielded,
    /// The script raised an error.
    Aborted(String),
}

/// Operations a running script may call back into. Implemented by the
/// coordinator for the duration of one resume.
pub trait LambdaOps {
    /// Pop the next input value. `None` means the queue is empty and the
    /// caller must yield; the coordinator resumes it with the next value.
    fn recv(&mut self) -> Option<Value>;

    /// Forward `value` to the output taker.
    fn send(&mut self, value: Value);

    /// Schedule a wake-up `ms` milliseconds from now. The caller must
    /// yield after a successful return.
    fn sleep(&mut self, ms: u64) -> Result<(), ScriptError>;

    fn log(&mut self, level: LogLevel, message: &str);

    /// Registry index of the lambda's memoized user-data table,
    /// allocating it on first use.
    fn udata(&mut self) -> u64;
}

/// Interpreter-owned cooperative thread.
pub trait ScriptThread: Send {
    fn resume(&mut self, ops: &mut dyn LambdaOps, arg: ResumeArg) -> ThreadOutcome;
}

/// The interpreter behind the seam.
pub trait ScriptHost: Send + Sync + 'static {
    /// Spawn a fresh thread from a compiled function.
    fn spawn(&self, func: &ScriptFn) -> Result<Box<dyn ScriptThread>, ScriptError>;

    /// Build the script-visible context object and return its registry
    /// handle.
    fn register_context(&self) -> ScriptRef;

    /// Allocate a fresh script-visible table.
    fn new_table(&self) -> ScriptRef;

    /// Hint that a garbage-collection pass is worthwhile.
    fn collect(&self);
}
