// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Parallel executor: a worker pool plus the batching async context.
//!
//! The pool drives one shared queue from several threads. The async
//! context layered on top batches submissions: the first push schedules
//! a single consume job, which drains the whole batch sequentially on
//! one worker. Tasks arriving mid-consume form the next batch.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use strand_env::{Clock, LogItem, LogLevel, Logger, Tick};

use crate::queue::{Driver, PriorityTaskQueue};
use crate::task::{panic_message, Task, TaskQueue};

/// Scope parameter passed to every async task. Constructed only by pool
/// drivers.
pub struct AsyncScope {
    _private: (),
}

impl AsyncScope {
    pub(crate) fn new() -> Self {
        Self { _private: () }
    }
}

struct PoolDriver {
    scope: AsyncScope,
    clock: Arc<dyn Clock>,
    logger: Arc<dyn Logger>,
    alive: Arc<AtomicBool>,
}

impl Driver<AsyncScope> for PoolDriver {
    fn begin_busy(&mut self) {
        self.clock.refresh();
    }

    fn drive(&mut self, task: Task<AsyncScope>) {
        let origin = task.origin();
        let scope = &mut self.scope;
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| task.run(scope))) {
            self.logger.push(
                LogItem::new(LogLevel::Error, format!("async task panicked, submitted at {origin}"))
                    .with_cause(panic_message(payload.as_ref())),
            );
        }
    }

    fn tick(&self) -> Tick {
        self.clock.now()
    }

    fn idle_interruption(&self) -> bool {
        !self.alive.load(Ordering::Acquire)
    }
}

/// N worker threads driving one shared queue.
pub struct WorkerPool {
    queue: Arc<PriorityTaskQueue<AsyncScope>>,
    alive: Arc<AtomicBool>,
    threads: Vec<thread::JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `workers` threads. Zero means one: the async context's
    /// batch-ordering contract assumes at least one consumer.
    pub fn spawn(workers: usize, clock: Arc<dyn Clock>, logger: Arc<dyn Logger>) -> Self {
        let workers = workers.max(1);
        let queue = Arc::new(PriorityTaskQueue::new());
        let alive = Arc::new(AtomicBool::new(true));

        let mut threads = Vec::with_capacity(workers);
        for id in 0..workers {
            let queue = queue.clone();
            let alive = alive.clone();
            let clock = clock.clone();
            let logger = logger.clone();
            threads.push(
                thread::Builder::new()
                    .name(format!("strand-worker-{}", id))
                    .spawn(move || {
                        let mut driver = PoolDriver {
                            scope: AsyncScope::new(),
                            clock,
                            logger,
                            alive,
                        };
                        queue.drive(&mut driver);
                    })
                    .expect("failed to spawn pool worker thread"),
            );
        }

        Self {
            queue,
            alive,
            threads,
        }
    }

    pub fn queue(&self) -> Arc<PriorityTaskQueue<AsyncScope>> {
        self.queue.clone()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::Release);
        self.queue.close();
        self.queue.wake();
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

struct BatchState {
    pending: Vec<Task<AsyncScope>>,
}

struct PoolInner {
    batch: Mutex<BatchState>,
    live: AtomicU64,
    logger: Arc<dyn Logger>,
    on_drained: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

impl PoolInner {
    fn consume(&self, scope: &mut AsyncScope) {
        let batch = std::mem::take(&mut self.batch.lock().unwrap().pending);
        for task in batch {
            let origin = task.origin();
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| task.run(scope))) {
                self.logger.push(
                    LogItem::new(
                        LogLevel::Error,
                        format!("batched task panicked, submitted at {origin}"),
                    )
                    .with_cause(panic_message(payload.as_ref())),
                );
            }
            self.live.fetch_sub(1, Ordering::AcqRel);
        }
        if self.live.load(Ordering::Acquire) == 0 {
            if let Some(hook) = self.on_drained.lock().unwrap().as_ref() {
                hook();
            }
        }
    }
}

/// Batching async context over a worker pool's queue.
///
/// Within one batch tasks run in submission order on a single worker;
/// batches themselves run in submission order unless the backing pool
/// was started with more than one consumer.
pub struct AsyncPool {
    backing: Arc<dyn TaskQueue<AsyncScope>>,
    inner: Arc<PoolInner>,
}

impl AsyncPool {
    pub fn new(backing: Arc<dyn TaskQueue<AsyncScope>>, logger: Arc<dyn Logger>) -> Self {
        Self {
            backing,
            inner: Arc::new(PoolInner {
                batch: Mutex::new(BatchState {
                    pending: Vec::new(),
                }),
                live: AtomicU64::new(0),
                logger,
                on_drained: Mutex::new(None),
            }),
        }
    }

    /// Hook invoked on the consuming worker whenever the live-task count
    /// strikes zero after a batch.
    pub fn set_drained_hook<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.inner.on_drained.lock().unwrap() = Some(Box::new(hook));
    }

    /// Tasks pushed and not yet finished.
    pub fn live(&self) -> u64 {
        self.inner.live.load(Ordering::Acquire)
    }
}

impl TaskQueue<AsyncScope> for AsyncPool {
    fn push(&self, task: Task<AsyncScope>) {
        self.inner.live.fetch_add(1, Ordering::AcqRel);
        let run_at = task.run_at();

        let first = {
            let mut batch = self.inner.batch.lock().unwrap();
            let first = batch.pending.is_empty();
            batch.pending.push(task);
            first
        };

        if first {
            let inner = self.inner.clone();
            self.backing
                .push(Task::at(run_at, move |scope| inner.consume(scope)));
        }
    }
}
