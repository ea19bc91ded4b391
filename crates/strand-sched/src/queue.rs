// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Priority task queue with a pluggable driver.
//!
//! Tasks order by scheduled tick, ties by submission. The queue itself
//! owns no thread: a driver calls [`PriorityTaskQueue::drive`] on
//! whatever worker it controls and decides when to stop, how to run a
//! task, and what the current tick is.

use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;
use std::panic::Location;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

use strand_env::Tick;

use crate::task::{Task, TaskQueue};

/// Worker-side policy for [`PriorityTaskQueue::drive`].
pub trait Driver<P> {
    /// A busy cycle is starting; tasks may run until [`Driver::end_busy`].
    fn begin_busy(&mut self) {}

    /// The busy cycle ended; the queue is about to sleep.
    fn end_busy(&mut self) {}

    /// Execute one task. Panics the task raises must not escape; the
    /// driver decides whether to log or re-raise them.
    fn drive(&mut self, task: Task<P>);

    /// The driver's monotonic clock.
    fn tick(&self) -> Tick;

    /// Stop driving entirely at the next idle boundary.
    fn idle_interruption(&self) -> bool;

    /// Pause between tasks within one busy cycle.
    fn task_interruption(&self) -> bool {
        false
    }
}

struct Entry<P> {
    run_at: Tick,
    seq: u64,
    task: Task<P>,
}

impl<P> PartialEq for Entry<P> {
    fn eq(&self, other: &Self) -> bool {
        self.run_at == other.run_at && self.seq == other.seq
    }
}

impl<P> Eq for Entry<P> {}

impl<P> PartialOrd for Entry<P> {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl<P> Ord for Entry<P> {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (self.run_at, self.seq).cmp(&(other.run_at, other.seq))
    }
}

struct QueueState<P> {
    heap: BinaryHeap<Reverse<Entry<P>>>,
    next_seq: u64,
    closed: bool,
}

type PushErrorHook = Box<dyn Fn(&'static Location<'static>) + Send + Sync>;

/// Min-heap task queue: multi-producer, driven by an external worker.
pub struct PriorityTaskQueue<P> {
    state: Mutex<QueueState<P>>,
    cv: Condvar,
    size: AtomicU64,
    on_push_error: Mutex<Option<PushErrorHook>>,
}

impl<P> PriorityTaskQueue<P> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                heap: BinaryHeap::new(),
                next_seq: 0,
                closed: false,
            }),
            cv: Condvar::new(),
            size: AtomicU64::new(0),
            on_push_error: Mutex::new(None),
        }
    }

    /// Replace the hook invoked when a push is rejected. The default
    /// hook does nothing.
    pub fn set_push_error_hook<F>(&self, hook: F)
    where
        F: Fn(&'static Location<'static>) + Send + Sync + 'static,
    {
        *self.on_push_error.lock().unwrap() = Some(Box::new(hook));
    }

    /// Tasks pushed and not yet finished executing.
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    /// Reject all future pushes. Already-queued tasks stay queued.
    pub fn close(&self) {
        self.state.lock().unwrap().closed = true;
        self.cv.notify_all();
    }

    /// Wake a driver blocked in [`PriorityTaskQueue::drive`].
    pub fn wake(&self) {
        let _state = self.state.lock().unwrap();
        self.cv.notify_all();
    }

    /// Block until the heap is empty or `timeout` elapses. Returns
    /// whether the heap was empty on return.
    pub fn wait_for_empty(&self, timeout: Duration) -> bool {
        let state = self.state.lock().unwrap();
        let (state, _result) = self
            .cv
            .wait_timeout_while(state, timeout, |s| !s.heap.is_empty())
            .unwrap();
        state.heap.is_empty()
    }

    fn sleeping(state: &QueueState<P>, now: Tick) -> bool {
        match state.heap.peek() {
            Some(Reverse(entry)) => entry.run_at > now,
            None => true,
        }
    }

    fn next_awake(state: &QueueState<P>) -> Option<Tick> {
        state.heap.peek().map(|Reverse(entry)| entry.run_at)
    }

    /// Run the drive loop on the calling worker until the driver
    /// requests an idle interruption.
    pub fn drive<D: Driver<P>>(&self, driver: &mut D) {
        while !driver.idle_interruption() {
            driver.begin_busy();
            while !driver.task_interruption() {
                let mut state = self.state.lock().unwrap();
                if Self::sleeping(&state, driver.tick()) {
                    break;
                }
                let Reverse(entry) = state.heap.pop().unwrap();
                drop(state);

                driver.drive(entry.task);
                self.size.fetch_sub(1, Ordering::AcqRel);
            }
            driver.end_busy();

            let mut state = self.state.lock().unwrap();
            self.cv.notify_all();

            let until = Self::next_awake(&state);
            loop {
                if driver.idle_interruption() || !Self::sleeping(&state, driver.tick()) {
                    break;
                }
                let improved = match (until, Self::next_awake(&state)) {
                    (None, Some(_)) => true,
                    (Some(u), Some(n)) => n < u,
                    (_, None) => false,
                };
                if improved {
                    break;
                }
                match until {
                    Some(at) => {
                        let wait = at.duration_since(driver.tick());
                        let (guard, result) = self.cv.wait_timeout(state, wait).unwrap();
                        state = guard;
                        if result.timed_out() {
                            break;
                        }
                    }
                    None => {
                        state = self.cv.wait(state).unwrap();
                    }
                }
            }
        }
    }

    fn reject(&self, origin: &'static Location<'static>) {
        if let Some(hook) = self.on_push_error.lock().unwrap().as_ref() {
            hook(origin);
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, QueueState<P>> {
        self.state.lock().unwrap()
    }
}

impl<P> Default for PriorityTaskQueue<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: 'static> TaskQueue<P> for PriorityTaskQueue<P> {
    fn push(&self, task: Task<P>) {
        let origin = task.origin();
        {
            let mut state = self.lock_state();
            if state.closed {
                drop(state);
                self.reject(origin);
                return;
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            state.heap.push(Reverse(Entry {
                run_at: task.run_at(),
                seq,
                task,
            }));
            self.size.fetch_add(1, Ordering::AcqRel);
            self.cv.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskQueueExt;
    use std::sync::atomic::{AtomicBool, AtomicU32};
    use std::sync::Arc;

    /// Minimal driver over a settable tick; stops when `stop` is set.
    struct TestDriver {
        now: Tick,
        stop: Arc<AtomicBool>,
    }

    impl TestDriver {
        fn new(stop: Arc<AtomicBool>) -> Self {
            Self {
                now: Tick::ZERO,
                stop,
            }
        }
    }

    impl Driver<u32> for TestDriver {
        fn drive(&mut self, task: Task<u32>) {
            let mut scope = 0u32;
            task.run(&mut scope);
        }

        fn tick(&self) -> Tick {
            self.now
        }

        fn idle_interruption(&self) -> bool {
            self.stop.load(Ordering::Acquire)
        }
    }

    #[test]
    fn push_and_drive_runs_task() {
        let queue = PriorityTaskQueue::<u32>::new();
        let stop = Arc::new(AtomicBool::new(false));
        let ran = Arc::new(AtomicU32::new(0));

        let ran2 = ran.clone();
        let stop2 = stop.clone();
        queue.exec(move |_| {
            ran2.fetch_add(1, Ordering::Relaxed);
            stop2.store(true, Ordering::Release);
        });

        let mut driver = TestDriver::new(stop);
        queue.drive(&mut driver);
        assert_eq!(ran.load(Ordering::Relaxed), 1);
        assert_eq!(queue.size(), 0);
    }

    #[test]
    fn equal_ticks_run_in_submission_order() {
        let queue = PriorityTaskQueue::<u32>::new();
        let stop = Arc::new(AtomicBool::new(false));
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..4u32 {
            let order = order.clone();
            queue.exec_at(Tick::from_millis(5), move |_| {
                order.lock().unwrap().push(i);
            });
        }
        let stop2 = stop.clone();
        queue.exec_at(Tick::from_millis(5), move |_| {
            stop2.store(true, Ordering::Release);
        });

        let mut driver = TestDriver::new(stop);
        driver.now = Tick::from_millis(5);
        queue.drive(&mut driver);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn delayed_task_waits_for_its_tick() {
        let queue = PriorityTaskQueue::<u32>::new();
        let stop = Arc::new(AtomicBool::new(false));
        let ran_late = Arc::new(AtomicU32::new(0));
        let ran_now = Arc::new(AtomicU32::new(0));

        let late = ran_late.clone();
        queue.exec_at(Tick::from_millis(1000), move |_| {
            late.fetch_add(1, Ordering::Relaxed);
        });
        let now = ran_now.clone();
        queue.exec_at(Tick::ZERO, move |_| {
            now.fetch_add(1, Ordering::Relaxed);
        });

        // First pass at tick 0: only the immediate task runs.
        struct OnePass {
            now: Tick,
            done: bool,
        }
        impl Driver<u32> for OnePass {
            fn drive(&mut self, task: Task<u32>) {
                let mut scope = 0u32;
                task.run(&mut scope);
            }
            fn tick(&self) -> Tick {
                self.now
            }
            fn idle_interruption(&self) -> bool {
                self.done
            }
            fn end_busy(&mut self) {
                self.done = true;
            }
        }

        let mut driver = OnePass {
            now: Tick::ZERO,
            done: false,
        };
        queue.drive(&mut driver);
        assert_eq!(ran_now.load(Ordering::Relaxed), 1);
        assert_eq!(ran_late.load(Ordering::Relaxed), 0);

        // Second pass after the tick advanced: the delayed task runs.
        let mut driver = OnePass {
            now: Tick::from_millis(1000),
            done: false,
        };
        queue.drive(&mut driver);
        assert_eq!(ran_late.load(Ordering::Relaxed), 1);
        let _ = stop;
    }

    #[test]
    fn chaotic_cross_thread_pushes_all_run() {
        const THREADS: u32 = 16;
        const PER_THREAD: u32 = 100;

        let queue = Arc::new(PriorityTaskQueue::<u32>::new());
        let stop = Arc::new(AtomicBool::new(false));
        let counter = Arc::new(AtomicU32::new(0));
        let exited = Arc::new(AtomicU32::new(0));

        let mut producers = Vec::new();
        for _ in 0..THREADS {
            let queue = queue.clone();
            let counter = counter.clone();
            let exited = exited.clone();
            let stop = stop.clone();
            producers.push(std::thread::spawn(move || {
                for _ in 0..PER_THREAD {
                    let counter = counter.clone();
                    queue.exec(move |_| {
                        counter.fetch_add(1, Ordering::Relaxed);
                    });
                }
                let exited = exited.clone();
                let stop = stop.clone();
                queue.exec(move |_| {
                    if exited.fetch_add(1, Ordering::AcqRel) + 1 == THREADS {
                        stop.store(true, Ordering::Release);
                    }
                });
            }));
        }
        for p in producers {
            p.join().unwrap();
        }

        let mut driver = TestDriver::new(stop);
        queue.drive(&mut driver);
        assert_eq!(counter.load(Ordering::Relaxed), THREADS * PER_THREAD);
    }

    #[test]
    fn wake_unblocks_a_sleeping_driver() {
        let queue = Arc::new(PriorityTaskQueue::<u32>::new());
        let stop = Arc::new(AtomicBool::new(false));

        let worker = {
            let queue = queue.clone();
            let stop = stop.clone();
            std::thread::spawn(move || {
                let mut driver = TestDriver::new(stop);
                queue.drive(&mut driver);
            })
        };

        // Let the driver reach its untimed sleep, then interrupt.
        std::thread::sleep(Duration::from_millis(20));
        stop.store(true, Ordering::Release);
        queue.wake();
        worker.join().unwrap();
    }

    #[test]
    fn wait_for_empty_observes_drain() {
        let queue = Arc::new(PriorityTaskQueue::<u32>::new());
        let stop = Arc::new(AtomicBool::new(false));

        for _ in 0..100 {
            queue.exec(|_| {});
        }

        let worker = {
            let queue = queue.clone();
            let stop = stop.clone();
            std::thread::spawn(move || {
                let mut driver = TestDriver::new(stop);
                queue.drive(&mut driver);
            })
        };

        assert!(queue.wait_for_empty(Duration::from_secs(1)));
        stop.store(true, Ordering::Release);
        queue.wake();
        worker.join().unwrap();
    }

    #[test]
    fn wait_for_empty_when_already_empty() {
        let queue = PriorityTaskQueue::<u32>::new();
        assert!(queue.wait_for_empty(Duration::from_millis(10)));
    }

    #[test]
    fn closed_queue_reports_to_hook() {
        let queue = PriorityTaskQueue::<u32>::new();
        let rejected = Arc::new(AtomicU32::new(0));
        let rejected2 = rejected.clone();
        queue.set_push_error_hook(move |_origin| {
            rejected2.fetch_add(1, Ordering::Relaxed);
        });

        queue.close();
        queue.exec(|_| {});
        assert_eq!(rejected.load(Ordering::Relaxed), 1);
        assert_eq!(queue.size(), 0);
    }
}
