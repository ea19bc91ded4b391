// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! The lambda coordinator.
//!
//! A lambda observes a maker for input values. Every delivery runs on
//! the script context: the value joins the input queue and the resume
//! decision procedure decides whether to hand it to a paused thread,
//! leave it for a sleeper, or spawn a fresh thread. Script aborts are
//! logged and counted; the next input spawns a fresh run.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use strand_env::{Clock, Env, EnvError, EnvExt, LogItem, LogLevel, Logger, NullLogger};
use strand_future::{Completer, Promise, PromiseError};
use strand_notify::{Maker, NullTaker, Observer, Taker};
use strand_sched::{SyncScope, TaskQueue, TaskQueueExt};
use strand_value::Value;

use crate::context::ScriptScope;
use crate::script::{LambdaOps, ResumeArg, ScriptError, ScriptFn, ScriptHost, ScriptRef, ThreadOutcome};
use crate::thread::LambdaThread;

struct LambdaState {
    recvq: VecDeque<Value>,
    recv_count: u64,
    thread: Option<LambdaThread>,
    ctx_ref: Option<ScriptRef>,
    udata: Option<ScriptRef>,
    awaiting_value: bool,
}

/// Coordinates one scripted lambda.
pub struct Lambda {
    clock: Option<Arc<dyn Clock>>,
    concurrency: Arc<dyn TaskQueue<SyncScope>>,
    logger: Arc<dyn Logger>,
    maker: Arc<Maker<Value>>,
    taker: Arc<dyn Taker<Value>>,
    ctx: Arc<dyn TaskQueue<ScriptScope>>,
    func: ScriptFn,
    state: Mutex<LambdaState>,
    exit_count: AtomicU64,
    abort_count: AtomicU64,
    self_weak: Weak<Lambda>,
}

impl Lambda {
    /// Build a lambda from the environment and subscribe it to the
    /// maker. Requires a sync queue and a script context; clock, logger,
    /// maker and taker are optional with null defaults.
    pub fn new(env: &dyn Env, func: ScriptFn) -> Result<Arc<Self>, EnvError> {
        let clock = env.get::<Arc<dyn Clock>>().ok();
        let concurrency = env.get::<Arc<dyn TaskQueue<SyncScope>>>()?;
        let logger = env.get_or::<Arc<dyn Logger>>(NullLogger::shared());
        let maker = env.get_or::<Arc<Maker<Value>>>(Arc::new(Maker::new("strand::NullMaker")));
        let taker = env.get_or::<Arc<dyn Taker<Value>>>(Arc::new(NullTaker));
        let ctx = env.get::<Arc<dyn TaskQueue<ScriptScope>>>()?;

        let lambda = Arc::new_cyclic(|weak| Lambda {
            clock,
            concurrency,
            logger,
            maker,
            taker,
            ctx,
            func,
            state: Mutex::new(LambdaState {
                recvq: VecDeque::new(),
                recv_count: 0,
                thread: None,
                ctx_ref: None,
                udata: None,
                awaiting_value: false,
            }),
            exit_count: AtomicU64::new(0),
            abort_count: AtomicU64::new(0),
            self_weak: weak.clone(),
        });

        lambda
            .maker
            .target()
            .subscribe(Arc::downgrade(&lambda) as Weak<dyn Observer<Value>>);
        Ok(lambda)
    }

    /// Completed thread lifetimes.
    pub fn exit_count(&self) -> u64 {
        self.exit_count.load(Ordering::Acquire)
    }

    /// Aborted thread lifetimes.
    pub fn abort_count(&self) -> u64 {
        self.abort_count.load(Ordering::Acquire)
    }

    fn deliver(&self, value: Value) {
        // Delivery holds a strong handle so a value already published
        // reaches the script even if external owners drop meanwhile.
        let Some(strong) = self.self_weak.upgrade() else {
            return;
        };
        self.ctx.exec(move |scope| {
            let mut st = strong.state.lock().unwrap();
            st.recvq.push_back(value);
            st.recv_count += 1;
            Lambda::resume(&strong, &mut *st, scope);
        });
    }

    /// The resume decision procedure. Runs on the script context with
    /// the state lock held.
    fn resume(this: &Arc<Self>, st: &mut LambdaState, scope: &mut ScriptScope) {
        if st.recvq.is_empty() {
            // nothing to feed; resume again when the next value arrives
            return;
        }
        if st.ctx_ref.is_none() {
            st.ctx_ref = Some(scope.host().register_context());
        }

        if st.awaiting_value && st.thread.is_some() {
            // thread paused in recv: hand it the next value
            let value = st.recvq.pop_front().unwrap();
            st.awaiting_value = false;
            let mut thread = st.thread.take().unwrap();
            let outcome = {
                let mut ops = OpsAdapter {
                    lambda: this,
                    st: &mut *st,
                    scope: &mut *scope,
                };
                thread.resume(&mut ops, ResumeArg::Value(value))
            };
            this.after_run(st, thread, outcome);
        } else if st.thread.is_some() {
            // paused for another reason (sleep): whoever yielded resumes
        } else {
            let raw = match scope.host().spawn(&this.func) {
                Ok(raw) => raw,
                Err(error) => {
                    this.logger.push(
                        LogItem::new(LogLevel::Error, "failed to spawn a script thread")
                            .with_cause(error.to_string()),
                    );
                    return;
                }
            };
            let mut thread = LambdaThread::new(raw, st.recvq.len(), st.recv_count);
            let ctx_index = st.ctx_ref.as_ref().unwrap().index();
            let outcome = {
                let mut ops = OpsAdapter {
                    lambda: this,
                    st: &mut *st,
                    scope: &mut *scope,
                };
                thread.resume(&mut ops, ResumeArg::Context(ctx_index))
            };
            this.after_run(st, thread, outcome);
        }
    }

    fn wake_sleeper(this: &Arc<Self>, scope: &mut ScriptScope) {
        let mut st = this.state.lock().unwrap();
        let Some(mut thread) = st.thread.take() else {
            return;
        };
        let outcome = {
            let mut ops = OpsAdapter {
                lambda: this,
                st: &mut *st,
                scope: &mut *scope,
            };
            thread.resume(&mut ops, ResumeArg::Wake)
        };
        this.after_run(&mut st, thread, outcome);
    }

    fn after_run(&self, st: &mut LambdaState, thread: LambdaThread, outcome: ThreadOutcome) {
        match outcome {
            ThreadOutcome::Yielded => {
                st.thread = Some(thread);
            }
            ThreadOutcome::Exited => {
                self.exit_count.fetch_add(1, Ordering::AcqRel);
                self.try_resume(st, &thread);
            }
            ThreadOutcome::Aborted(message) => {
                self.logger.push(LogItem::new(LogLevel::Error, message));
                self.abort_count.fetch_add(1, Ordering::AcqRel);
                self.try_resume(st, &thread);
            }
        }
    }

    /// After a thread finishes: schedule another resume iff the input
    /// queue was touched during the run and is still non-empty.
    fn try_resume(&self, st: &LambdaState, thread: &LambdaThread) {
        let no_pop = thread.recvq_len_at_spawn == st.recvq.len();
        let no_push = thread.recv_count_at_spawn == st.recv_count;
        if (no_pop && no_push) || st.recvq.is_empty() {
            return;
        }
        let weak = self.self_weak.clone();
        self.ctx.exec(move |scope| {
            if let Some(lambda) = weak.upgrade() {
                let mut st = lambda.state.lock().unwrap();
                Lambda::resume(&lambda, &mut *st, scope);
            }
        });
    }
}

impl Observer<Value> for Lambda {
    fn notify(&self, value: &Value) {
        self.deliver(value.clone());
    }

    fn notify_moved(&self, value: Value) {
        self.deliver(value);
    }
}

/// The script-visible operation table for one resume.
struct OpsAdapter<'a> {
    lambda: &'a Arc<Lambda>,
    st: &'a mut LambdaState,
    scope: &'a mut ScriptScope,
}

impl LambdaOps for OpsAdapter<'_> {
    fn recv(&mut self) -> Option<Value> {
        match self.st.recvq.pop_front() {
            Some(value) => Some(value),
            None => {
                self.st.awaiting_value = true;
                None
            }
        }
    }

    fn send(&mut self, value: Value) {
        let taker = self.lambda.taker.clone();
        self.lambda.concurrency.exec(move |_| taker.take(value));
    }

    fn sleep(&mut self, ms: u64) -> Result<(), ScriptError> {
        let clock = self
            .lambda
            .clock
            .as_ref()
            .ok_or(ScriptError::ClockMissing)?;
        let at = clock.now().after(ms);
        let weak = self.lambda.self_weak.clone();
        self.lambda.ctx.exec_at(at, move |scope| {
            if let Some(lambda) = weak.upgrade() {
                Lambda::wake_sleeper(&lambda, scope);
            }
        });
        Ok(())
    }

    fn log(&mut self, level: LogLevel, message: &str) {
        self.lambda.logger.push(LogItem::new(level, message));
    }

    fn udata(&mut self) -> u64 {
        if self.st.udata.is_none() {
            self.st.udata = Some(self.scope.host().new_table());
        }
        self.st.udata.as_ref().unwrap().index()
    }
}

/// Compile a script on its context, resolving the promise with the
/// compiled function or the compile error.
pub fn compile_on<F>(ctx: &Arc<dyn TaskQueue<ScriptScope>>, compile: F) -> Promise<ScriptFn>
where
    F: FnOnce(&Arc<dyn ScriptHost>) -> Result<ScriptFn, ScriptError> + Send + 'static,
{
    let comp = Completer::new();
    let promise = comp.promise();
    ctx.exec(move |scope| match compile(scope.host()) {
        Ok(func) => comp.complete(func),
        Err(error) => comp.fail(PromiseError::Failed(error.to_string())),
    });
    promise
}
