// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! In-memory scripted host.
//!
//! A tiny line-oriented script language sufficient to exercise every
//! coordinator path without embedding a real interpreter; the
//! test-suites drive lambdas through it. One directive per line:
//!
//! ```text
//! recv              # pop next input (yield until one arrives)
//! recv integer      # pop next input, abort unless it is an integer
//! send last         # forward the last received value
//! send null         # forward a null
//! send int 42
//! send real 1.5
//! send text hello
//! sleep 100         # wake up 100ms later
//! log info hello    # trace/info/warn/error
//! bump counter      # udata[counter] = udata[counter] + 1
//! send udata counter
//! fail boom         # abort with a message
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use strand_env::LogLevel;
use strand_value::{Value, ValueKind};

use crate::script::{
    LambdaOps, ResumeArg, ScriptError, ScriptFn, ScriptHost, ScriptRef, ScriptThread,
    ThreadOutcome,
};

#[derive(Debug, Clone)]
enum Step {
    Recv { expect: Option<ValueKind> },
    SendLast,
    SendValue(Value),
    SendUdata(String),
    Sleep(u64),
    Log(LogLevel, String),
    Bump(String),
    Fail(String),
}

struct VmProgram {
    steps: Vec<Step>,
}

fn parse(source: &str) -> Result<Vec<Step>, ScriptError> {
    let mut steps = Vec::new();
    for (n, raw) in source.lines().enumerate() {
        let line = match raw.find('#') {
            Some(i) => raw[..i].trim(),
            None => raw.trim(),
        };
        if line.is_empty() {
            continue;
        }
        let bad = || ScriptError::Compile(format!("line {}: unknown directive '{line}'", n + 1));

        let mut words = line.split_whitespace();
        let step = match words.next() {
            Some("recv") => match words.next() {
                None => Step::Recv { expect: None },
                Some(kind) => Step::Recv {
                    expect: Some(ValueKind::parse(kind).ok_or_else(bad)?),
                },
            },
            Some("send") => match words.next() {
                Some("last") => Step::SendLast,
                Some("null") => Step::SendValue(Value::Null),
                Some("int") => Step::SendValue(Value::Integer(
                    words.next().and_then(|w| w.parse().ok()).ok_or_else(bad)?,
                )),
                Some("real") => Step::SendValue(Value::Real(
                    words.next().and_then(|w| w.parse().ok()).ok_or_else(bad)?,
                )),
                Some("text") => Step::SendValue(Value::text(
                    &words.collect::<Vec<_>>().join(" "),
                )),
                Some("udata") => Step::SendUdata(words.next().ok_or_else(bad)?.to_string()),
                _ => return Err(bad()),
            },
            Some("sleep") => Step::Sleep(
                words.next().and_then(|w| w.parse().ok()).ok_or_else(bad)?,
            ),
            Some("log") => {
                let level = match words.next() {
                    Some("trace") => LogLevel::Trace,
                    Some("info") => LogLevel::Info,
                    Some("warn") => LogLevel::Warn,
                    Some("error") => LogLevel::Error,
                    _ => return Err(bad()),
                };
                Step::Log(level, words.collect::<Vec<_>>().join(" "))
            }
            Some("bump") => Step::Bump(words.next().ok_or_else(bad)?.to_string()),
            Some("fail") => Step::Fail(words.collect::<Vec<_>>().join(" ")),
            _ => return Err(bad()),
        };
        steps.push(step);
    }
    Ok(steps)
}

/// Registry tables shared between the host and its threads.
struct VmShared {
    tables: Mutex<HashMap<u64, HashMap<String, f64>>>,
    live_refs: AtomicU64,
}

impl VmShared {
    fn bump(&self, index: u64, key: &str) -> f64 {
        let mut tables = self.tables.lock().unwrap();
        let table = tables.entry(index).or_default();
        let slot = table.entry(key.to_string()).or_insert(0.0);
        *slot += 1.0;
        *slot
    }

    fn read(&self, index: u64, key: &str) -> f64 {
        self.tables
            .lock()
            .unwrap()
            .get(&index)
            .and_then(|t| t.get(key))
            .copied()
            .unwrap_or(0.0)
    }
}

/// Scripted host implementing [`ScriptHost`] over parsed step programs.
pub struct VmHost {
    shared: Arc<VmShared>,
    next_index: AtomicU64,
    collects: AtomicU64,
}

impl VmHost {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(VmShared {
                tables: Mutex::new(HashMap::new()),
                live_refs: AtomicU64::new(0),
            }),
            next_index: AtomicU64::new(1),
            collects: AtomicU64::new(0),
        }
    }

    /// Compile `source` into a spawnable function.
    pub fn compile(&self, source: &str) -> Result<ScriptFn, ScriptError> {
        Ok(ScriptFn::new(VmProgram {
            steps: parse(source)?,
        }))
    }

    /// Garbage-collection hints received so far.
    pub fn collect_count(&self) -> u64 {
        self.collects.load(Ordering::Acquire)
    }

    /// Registry handles currently alive.
    pub fn live_refs(&self) -> u64 {
        self.shared.live_refs.load(Ordering::Acquire)
    }

    fn alloc_ref(&self) -> ScriptRef {
        let index = self.next_index.fetch_add(1, Ordering::AcqRel);
        self.shared.live_refs.fetch_add(1, Ordering::AcqRel);
        let shared = self.shared.clone();
        ScriptRef::new(index, move |index| {
            shared.tables.lock().unwrap().remove(&index);
            shared.live_refs.fetch_sub(1, Ordering::AcqRel);
        })
    }
}

impl Default for VmHost {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptHost for VmHost {
    fn spawn(&self, func: &ScriptFn) -> Result<Box<dyn ScriptThread>, ScriptError> {
        let program = func
            .downcast::<VmProgram>()
            .ok_or_else(|| ScriptError::Spawn("function was not compiled by this host".into()))?;
        Ok(Box::new(VmThread {
            program,
            shared: self.shared.clone(),
            pc: 0,
            last: None,
        }))
    }

    fn register_context(&self) -> ScriptRef {
        self.alloc_ref()
    }

    fn new_table(&self) -> ScriptRef {
        let handle = self.alloc_ref();
        self.shared
            .tables
            .lock()
            .unwrap()
            .insert(handle.index(), HashMap::new());
        handle
    }

    fn collect(&self) {
        self.collects.fetch_add(1, Ordering::AcqRel);
    }
}

struct VmThread {
    program: Arc<VmProgram>,
    shared: Arc<VmShared>,
    pc: usize,
    last: Option<Value>,
}

impl ScriptThread for VmThread {
    fn resume(&mut self, ops: &mut dyn LambdaOps, arg: ResumeArg) -> ThreadOutcome {
        match arg {
            // The context object itself lives with the coordinator; the
            // vm only needs to know the run started.
            ResumeArg::Context(_) | ResumeArg::Wake => {}
            ResumeArg::Value(value) => match self.program.steps.get(self.pc) {
                Some(Step::Recv { expect }) => {
                    if let Some(kind) = expect {
                        if value.kind() != *kind {
                            return ThreadOutcome::Aborted(format!(
                                "expected {kind}, got {}",
                                value.kind()
                            ));
                        }
                    }
                    self.last = Some(value);
                    self.pc += 1;
                }
                _ => {
                    return ThreadOutcome::Aborted(
                        "resumed with a value while not receiving".into(),
                    )
                }
            },
        }

        loop {
            let Some(step) = self.program.steps.get(self.pc) else {
                return ThreadOutcome::Exited;
            };
            match step {
                Step::Recv { expect } => match ops.recv() {
                    Some(value) => {
                        if let Some(kind) = expect {
                            if value.kind() != *kind {
                                return ThreadOutcome::Aborted(format!(
                                    "expected {kind}, got {}",
                                    value.kind()
                                ));
                            }
                        }
                        self.last = Some(value);
                        self.pc += 1;
                    }
                    None => return ThreadOutcome::Yielded,
                },
                Step::SendLast => {
                    ops.send(self.last.clone().unwrap_or(Value::Null));
                    self.pc += 1;
                }
                Step::SendValue(value) => {
                    ops.send(value.clone());
                    self.pc += 1;
                }
                Step::SendUdata(key) => {
                    let index = ops.udata();
                    ops.send(Value::Real(self.shared.read(index, key)));
                    self.pc += 1;
                }
                Step::Sleep(ms) => match ops.sleep(*ms) {
                    Ok(()) => {
                        self.pc += 1;
                        return ThreadOutcome::Yielded;
                    }
                    Err(error) => return ThreadOutcome::Aborted(error.to_string()),
                },
                Step::Log(level, message) => {
                    ops.log(*level, message);
                    self.pc += 1;
                }
                Step::Bump(key) => {
                    let index = ops.udata();
                    self.shared.bump(index, key);
                    self.pc += 1;
                }
                Step::Fail(message) => return ThreadOutcome::Aborted(message.clone()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Ops stub recording interactions.
    struct StubOps {
        inputs: Vec<Value>,
        sent: Vec<Value>,
        logged: Vec<(LogLevel, String)>,
        awaiting: bool,
        udata_index: u64,
    }

    impl StubOps {
        fn with_inputs(inputs: Vec<Value>) -> Self {
            Self {
                inputs,
                sent: Vec::new(),
                logged: Vec::new(),
                awaiting: false,
                udata_index: 99,
            }
        }
    }

    impl LambdaOps for StubOps {
        fn recv(&mut self) -> Option<Value> {
            if self.inputs.is_empty() {
                self.awaiting = true;
                None
            } else {
                Some(self.inputs.remove(0))
            }
        }
        fn send(&mut self, value: Value) {
            self.sent.push(value);
        }
        fn sleep(&mut self, _ms: u64) -> Result<(), ScriptError> {
            Ok(())
        }
        fn log(&mut self, level: LogLevel, message: &str) {
            self.logged.push((level, message.to_string()));
        }
        fn udata(&mut self) -> u64 {
            self.udata_index
        }
    }

    fn spawn(host: &VmHost, source: &str) -> Box<dyn ScriptThread> {
        let func = host.compile(source).unwrap();
        host.spawn(&func).unwrap()
    }

    #[test]
    fn compile_rejects_unknown_directives() {
        let host = VmHost::new();
        assert!(matches!(
            host.compile("explode everything"),
            Err(ScriptError::Compile(_))
        ));
        assert!(matches!(
            host.compile("recv widget"),
            Err(ScriptError::Compile(_))
        ));
    }

    #[test]
    fn comments_and_blank_lines_are_skipped() {
        let host = VmHost::new();
        assert!(host.compile("# just a comment\n\nsend null  # trailing").is_ok());
    }

    #[test]
    fn echo_program_runs_to_exit() {
        let host = VmHost::new();
        let mut thread = spawn(&host, "recv\nsend last");
        let mut ops = StubOps::with_inputs(vec![Value::Integer(42)]);

        assert!(matches!(
            thread.resume(&mut ops, ResumeArg::Context(1)),
            ThreadOutcome::Exited
        ));
        assert_eq!(ops.sent, vec![Value::Integer(42)]);
    }

    #[test]
    fn recv_yields_on_empty_queue_and_resumes_with_value() {
        let host = VmHost::new();
        let mut thread = spawn(&host, "recv\nrecv integer\nsend last");
        let mut ops = StubOps::with_inputs(vec![Value::Null]);

        assert!(matches!(
            thread.resume(&mut ops, ResumeArg::Context(1)),
            ThreadOutcome::Yielded
        ));
        assert!(ops.awaiting);

        assert!(matches!(
            thread.resume(&mut ops, ResumeArg::Value(Value::Integer(7))),
            ThreadOutcome::Exited
        ));
        assert_eq!(ops.sent, vec![Value::Integer(7)]);
    }

    #[test]
    fn type_expectation_mismatch_aborts() {
        let host = VmHost::new();
        let mut thread = spawn(&host, "recv integer");
        let mut ops = StubOps::with_inputs(vec![Value::Null]);

        match thread.resume(&mut ops, ResumeArg::Context(1)) {
            ThreadOutcome::Aborted(message) => {
                assert_eq!(message, "expected integer, got null");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn sleep_yields_and_wake_continues() {
        let host = VmHost::new();
        let mut thread = spawn(&host, "sleep 50\nsend null");
        let mut ops = StubOps::with_inputs(Vec::new());

        assert!(matches!(
            thread.resume(&mut ops, ResumeArg::Context(1)),
            ThreadOutcome::Yielded
        ));
        assert!(matches!(
            thread.resume(&mut ops, ResumeArg::Wake),
            ThreadOutcome::Exited
        ));
        assert_eq!(ops.sent, vec![Value::Null]);
    }

    #[test]
    fn bump_and_send_udata_use_host_tables() {
        let host = VmHost::new();
        let mut thread = spawn(&host, "bump temp\nbump temp\nsend udata temp");
        let mut ops = StubOps::with_inputs(Vec::new());

        assert!(matches!(
            thread.resume(&mut ops, ResumeArg::Context(1)),
            ThreadOutcome::Exited
        ));
        assert_eq!(ops.sent, vec![Value::Real(2.0)]);
    }

    #[test]
    fn fail_aborts_with_message() {
        let host = VmHost::new();
        let mut thread = spawn(&host, "fail boom town");
        let mut ops = StubOps::with_inputs(Vec::new());

        match thread.resume(&mut ops, ResumeArg::Context(1)) {
            ThreadOutcome::Aborted(message) => assert_eq!(message, "boom town"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn registry_refs_release_on_drop() {
        let host = VmHost::new();
        assert_eq!(host.live_refs(), 0);
        let a = host.register_context();
        let b = host.new_table();
        assert_eq!(host.live_refs(), 2);
        drop(a);
        drop(b);
        assert_eq!(host.live_refs(), 0);
    }
}
