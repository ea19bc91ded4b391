// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Scripted lambda coordination.
//!
//! A lambda pairs an interpreter-owned cooperative thread with the
//! runtime's queues: it receives values from a maker, resumes the script
//! to consume them, and forwards produced values to a taker. The
//! interpreter itself stays behind the [`ScriptHost`] seam; `vm` ships a
//! small scripted host the test-suites drive everything with.

mod context;
mod lambda;
mod script;
mod thread;
pub mod vm;

pub use context::{AsyncScriptContext, ScriptScope, SyncScriptContext};
pub use lambda::{compile_on, Lambda};
pub use script::{
    LambdaOps, ResumeArg, ScriptError, ScriptFn, ScriptHost, ScriptRef, ScriptThread,
    ThreadOutcome,
};
