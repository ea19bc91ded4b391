// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Script execution contexts.
//!
//! Script tasks run with a [`ScriptScope`] giving them the host. The
//! sync flavor forwards every task to the sync worker; the async flavor
//! batches tasks and drains each batch sequentially on the pool. Both
//! count live tasks and hint interpreter garbage collection whenever the
//! count strikes zero.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use strand_sched::{AsyncScope, SyncScope, Task, TaskQueue};

use crate::script::ScriptHost;

/// Scope parameter passed to script tasks.
pub struct ScriptScope {
    host: Arc<dyn ScriptHost>,
}

impl ScriptScope {
    pub(crate) fn new(host: Arc<dyn ScriptHost>) -> Self {
        Self { host }
    }

    pub fn host(&self) -> &Arc<dyn ScriptHost> {
        &self.host
    }
}

struct SyncCtxInner {
    queue: Arc<dyn TaskQueue<SyncScope>>,
    host: Arc<dyn ScriptHost>,
    live: AtomicU64,
}

/// Script context running every task on the sync worker.
#[derive(Clone)]
pub struct SyncScriptContext {
    inner: Arc<SyncCtxInner>,
}

impl SyncScriptContext {
    pub fn new(queue: Arc<dyn TaskQueue<SyncScope>>, host: Arc<dyn ScriptHost>) -> Self {
        Self {
            inner: Arc::new(SyncCtxInner {
                queue,
                host,
                live: AtomicU64::new(0),
            }),
        }
    }

    /// Tasks pushed and not yet finished.
    pub fn live(&self) -> u64 {
        self.inner.live.load(Ordering::Acquire)
    }
}

impl TaskQueue<ScriptScope> for SyncScriptContext {
    fn push(&self, task: Task<ScriptScope>) {
        self.inner.live.fetch_add(1, Ordering::AcqRel);
        let inner = self.inner.clone();
        self.inner.queue.push(Task::with_origin(
            task.run_at(),
            task.origin(),
            move |_: &mut SyncScope| {
                let mut scope = ScriptScope::new(inner.host.clone());
                task.run(&mut scope);
                if inner.live.fetch_sub(1, Ordering::AcqRel) == 1 {
                    inner.host.collect();
                }
            },
        ));
    }
}

struct AsyncCtxInner {
    queue: Arc<dyn TaskQueue<AsyncScope>>,
    host: Arc<dyn ScriptHost>,
    live: AtomicU64,
    pending: Mutex<Vec<Task<ScriptScope>>>,
}

impl AsyncCtxInner {
    fn consume(&self) {
        let batch = std::mem::take(&mut *self.pending.lock().unwrap());
        let mut scope = ScriptScope::new(self.host.clone());
        for task in batch {
            task.run(&mut scope);
            self.live.fetch_sub(1, Ordering::AcqRel);
        }
        if self.live.load(Ordering::Acquire) == 0 {
            self.host.collect();
        }
    }
}

/// Script context batching tasks onto the worker pool. The first push of
/// a batch schedules one consume job; tasks arriving while it drains
/// form the next batch.
#[derive(Clone)]
pub struct AsyncScriptContext {
    inner: Arc<AsyncCtxInner>,
}

impl AsyncScriptContext {
    pub fn new(queue: Arc<dyn TaskQueue<AsyncScope>>, host: Arc<dyn ScriptHost>) -> Self {
        Self {
            inner: Arc::new(AsyncCtxInner {
                queue,
                host,
                live: AtomicU64::new(0),
                pending: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn live(&self) -> u64 {
        self.inner.live.load(Ordering::Acquire)
    }
}

impl TaskQueue<ScriptScope> for AsyncScriptContext {
    fn push(&self, task: Task<ScriptScope>) {
        self.inner.live.fetch_add(1, Ordering::AcqRel);
        let run_at = task.run_at();
        let origin = task.origin();

        let first = {
            let mut pending = self.inner.pending.lock().unwrap();
            let first = pending.is_empty();
            pending.push(task);
            first
        };

        if first {
            let inner = self.inner.clone();
            self.inner
                .queue
                .push(Task::with_origin(run_at, origin, move |_: &mut AsyncScope| {
                    inner.consume();
                }));
        }
    }
}
