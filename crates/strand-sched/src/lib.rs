// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Task scheduling for the strand runtime.
//!
//! A task is a one-shot closure with a scheduled tick. Producers push
//! tasks into queues; a driver worker pops the earliest due task and
//! runs it. Two executors are built on the queue: a single-threaded
//! cooperative sync worker and a batching async pool.

mod pool;
mod queue;
mod sync;
mod task;

pub use pool::{AsyncPool, AsyncScope, WorkerPool};
pub use queue::{Driver, PriorityTaskQueue};
pub use sync::{drive_until_empty, SyncScope, SyncWorker};
pub use task::{panic_message, SwitchingQueue, Task, TaskQueue, TaskQueueExt};
