// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Tasks and the submission contract.
//!
//! Every task records the source location it was submitted from, so a
//! driver can point back at the submitter when a task fails.

use std::any::Any;
use std::fmt;
use std::panic::Location;
use std::sync::{Arc, Weak};

use strand_env::Tick;

/// One-shot closure scheduled at a tick. `P` is the scope parameter the
/// executing context passes in.
pub struct Task<P> {
    run_at: Tick,
    action: Box<dyn FnOnce(&mut P) + Send>,
    origin: &'static Location<'static>,
}

impl<P> Task<P> {
    /// Task eligible to run immediately.
    #[track_caller]
    pub fn new<F>(action: F) -> Self
    where
        F: FnOnce(&mut P) + Send + 'static,
    {
        Self::at(Tick::ZERO, action)
    }

    /// Task eligible once the driving clock reaches `run_at`.
    #[track_caller]
    pub fn at<F>(run_at: Tick, action: F) -> Self
    where
        F: FnOnce(&mut P) + Send + 'static,
    {
        Self::with_origin(run_at, Location::caller(), action)
    }

    /// Task carrying an explicit origin; used by wrapping queues to keep
    /// pointing at the original submitter.
    pub fn with_origin<F>(
        run_at: Tick,
        origin: &'static Location<'static>,
        action: F,
    ) -> Self
    where
        F: FnOnce(&mut P) + Send + 'static,
    {
        Self {
            run_at,
            action: Box::new(action),
            origin,
        }
    }

    pub fn run_at(&self) -> Tick {
        self.run_at
    }

    /// Where the task was submitted from.
    pub fn origin(&self) -> &'static Location<'static> {
        self.origin
    }

    /// Consume the task, running its action.
    pub fn run(self, scope: &mut P) {
        (self.action)(scope)
    }
}

impl<P> fmt::Debug for Task<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("run_at", &self.run_at)
            .field("origin", &self.origin)
            .finish()
    }
}

/// Thread-safe task sink.
pub trait TaskQueue<P>: Send + Sync {
    fn push(&self, task: Task<P>);
}

/// Submission sugar available on every queue, sized or not.
pub trait TaskQueueExt<P>: TaskQueue<P> {
    /// Push a task that runs as soon as possible.
    #[track_caller]
    fn exec<F>(&self, action: F)
    where
        F: FnOnce(&mut P) + Send + 'static,
    {
        self.push(Task::new(action));
    }

    /// Push a task that becomes eligible at `run_at`.
    #[track_caller]
    fn exec_at<F>(&self, run_at: Tick, action: F)
    where
        F: FnOnce(&mut P) + Send + 'static,
    {
        self.push(Task::at(run_at, action));
    }
}

impl<P, Q: TaskQueue<P> + ?Sized> TaskQueueExt<P> for Q {}

/// Routes to a primary queue while it is alive, then to a fallback.
///
/// Lets a long-lived producer keep one handle across the lifetime of a
/// replaceable front queue (e.g. a frame loop that may be torn down
/// while its submitters survive).
pub struct SwitchingQueue<P> {
    primary: Weak<dyn TaskQueue<P>>,
    fallback: Arc<dyn TaskQueue<P>>,
}

impl<P> SwitchingQueue<P> {
    pub fn new(primary: Weak<dyn TaskQueue<P>>, fallback: Arc<dyn TaskQueue<P>>) -> Self {
        Self { primary, fallback }
    }
}

impl<P: 'static> TaskQueue<P> for SwitchingQueue<P> {
    fn push(&self, task: Task<P>) {
        match self.primary.upgrade() {
            Some(primary) => primary.push(task),
            None => self.fallback.push(task),
        }
    }
}

/// Best-effort rendering of a panic payload for logging.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "opaque panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder(Mutex<Vec<&'static str>>);

    impl TaskQueue<u32> for Recorder {
        fn push(&self, task: Task<u32>) {
            let mut scope = 0u32;
            task.run(&mut scope);
            self.0.lock().unwrap().push("ran");
        }
    }

    #[test]
    fn task_records_origin() {
        let task: Task<u32> = Task::new(|_| {});
        assert!(task.origin().file().ends_with("task.rs"));
        assert_eq!(task.run_at(), Tick::ZERO);
    }

    #[test]
    fn exec_pushes_immediate_task() {
        let queue = Recorder(Mutex::new(Vec::new()));
        queue.exec(|scope| *scope += 1);
        assert_eq!(queue.0.lock().unwrap().len(), 1);
    }

    #[test]
    fn switching_queue_prefers_live_primary() {
        let primary = Arc::new(Recorder(Mutex::new(Vec::new())));
        let fallback = Arc::new(Recorder(Mutex::new(Vec::new())));
        let switching = SwitchingQueue::new(
            Arc::downgrade(&primary) as Weak<dyn TaskQueue<u32>>,
            fallback.clone() as Arc<dyn TaskQueue<u32>>,
        );

        switching.exec(|_| {});
        assert_eq!(primary.0.lock().unwrap().len(), 1);
        assert_eq!(fallback.0.lock().unwrap().len(), 0);

        drop(primary);
        switching.exec(|_| {});
        assert_eq!(fallback.0.lock().unwrap().len(), 1);
    }

    #[test]
    fn panic_message_extracts_strings() {
        let boxed: Box<dyn Any + Send> = Box::new("static panic");
        assert_eq!(panic_message(boxed.as_ref()), "static panic");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned panic"));
        assert_eq!(panic_message(boxed.as_ref()), "owned panic");
        let boxed: Box<dyn Any + Send> = Box::new(17u8);
        assert_eq!(panic_message(boxed.as_ref()), "opaque panic payload");
    }
}
