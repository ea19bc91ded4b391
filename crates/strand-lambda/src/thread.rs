// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Thread wrapper tracking the state machine around a script thread.

use crate::script::{LambdaOps, ResumeArg, ScriptThread, ThreadOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ThreadState {
    Paused,
    Running,
    Exited,
    Aborted,
}

/// A spawned script thread plus the input-queue snapshot taken when it
/// was attached; the try-resume rule compares against the snapshot.
pub(crate) struct LambdaThread {
    raw: Box<dyn ScriptThread>,
    state: ThreadState,
    pub(crate) recvq_len_at_spawn: usize,
    pub(crate) recv_count_at_spawn: u64,
}

impl LambdaThread {
    pub(crate) fn new(
        raw: Box<dyn ScriptThread>,
        recvq_len_at_spawn: usize,
        recv_count_at_spawn: u64,
    ) -> Self {
        Self {
            raw,
            state: ThreadState::Paused,
            recvq_len_at_spawn,
            recv_count_at_spawn,
        }
    }

    #[allow(dead_code)]
    pub(crate) fn state(&self) -> ThreadState {
        self.state
    }

    /// Resume the script. If it yields, responsibility to resume again
    /// belongs to whoever caused the yield.
    pub(crate) fn resume(&mut self, ops: &mut dyn LambdaOps, arg: ResumeArg) -> ThreadOutcome {
        debug_assert_eq!(self.state, ThreadState::Paused, "resume on a non-paused thread");
        self.state = ThreadState::Running;
        let outcome = self.raw.resume(ops, arg);
        self.state = match &outcome {
            ThreadOutcome::Exited => ThreadState::Exited,
            ThreadOutcome::Yielded => ThreadState::Paused,
            ThreadOutcome::Aborted(_) => ThreadState::Aborted,
        };
        outcome
    }
}
