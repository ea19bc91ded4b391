// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Single-threaded cooperative executor.
//!
//! All sync tasks run on one logical worker; no two overlap. The worker
//! refreshes the shared clock once per busy cycle, so tasks in one cycle
//! agree on `now`. Task panics are logged with the submitter's origin
//! and never take the worker down.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use strand_env::{Clock, LogItem, LogLevel, Logger, Tick};

use crate::queue::{Driver, PriorityTaskQueue};
use crate::task::{panic_message, Task};

/// Scope parameter passed to every sync task. Constructed only by sync
/// drivers, which guarantees sync tasks never run concurrently.
pub struct SyncScope {
    _private: (),
}

impl SyncScope {
    pub(crate) fn new() -> Self {
        Self { _private: () }
    }
}

struct SyncDriver {
    scope: SyncScope,
    clock: Arc<dyn Clock>,
    logger: Arc<dyn Logger>,
    alive: Arc<AtomicBool>,
}

impl Driver<SyncScope> for SyncDriver {
    fn begin_busy(&mut self) {
        self.clock.refresh();
    }

    fn drive(&mut self, task: Task<SyncScope>) {
        let origin = task.origin();
        let scope = &mut self.scope;
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| task.run(scope))) {
            self.logger.push(
                LogItem::new(LogLevel::Error, format!("sync task panicked, submitted at {origin}"))
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

/// Owns the sync worker thread and its queue. Dropping shuts the worker
/// down; tasks still queued at that point are discarded with the queue.
pub struct SyncWorker {
    queue: Arc<PriorityTaskQueue<SyncScope>>,
    alive: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl SyncWorker {
    pub fn spawn(clock: Arc<dyn Clock>, logger: Arc<dyn Logger>) -> Self {
        let queue = Arc::new(PriorityTaskQueue::new());
        let alive = Arc::new(AtomicBool::new(true));

        let thread = {
            let queue = queue.clone();
            let alive = alive.clone();
            thread::Builder::new()
                .name("strand-sync".to_string())
                .spawn(move || {
                    let mut driver = SyncDriver {
                        scope: SyncScope::new(),
                        clock,
                        logger,
                        alive,
                    };
                    queue.drive(&mut driver);
                })
                .expect("failed to spawn sync worker thread")
        };

        Self {
            queue,
            alive,
            thread: Some(thread),
        }
    }

    /// Submission handle for producers.
    pub fn queue(&self) -> Arc<PriorityTaskQueue<SyncScope>> {
        self.queue.clone()
    }
}

impl Drop for SyncWorker {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::Release);
        self.queue.close();
        self.queue.wake();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Drive `queue` on the calling thread until it drains.
///
/// This is how an embedding frame loop hosts the sync context without a
/// dedicated worker thread; the test-suites use it to settle pending
/// work deterministically.
pub fn drive_until_empty(
    queue: &PriorityTaskQueue<SyncScope>,
    clock: &Arc<dyn Clock>,
    logger: &Arc<dyn Logger>,
) {
    struct UntilEmpty<'a> {
        inner: SyncDriver,
        queue: &'a PriorityTaskQueue<SyncScope>,
    }

    impl Driver<SyncScope> for UntilEmpty<'_> {
        fn begin_busy(&mut self) {
            self.inner.begin_busy();
        }
        fn drive(&mut self, task: Task<SyncScope>) {
            self.inner.drive(task);
        }
        fn tick(&self) -> Tick {
            self.inner.tick()
        }
        fn idle_interruption(&self) -> bool {
            self.queue.size() == 0
        }
    }

    let mut driver = UntilEmpty {
        inner: SyncDriver {
            scope: SyncScope::new(),
            clock: clock.clone(),
            logger: logger.clone(),
            alive: Arc::new(AtomicBool::new(true)),
        },
        queue,
    };
    queue.drive(&mut driver);
}
