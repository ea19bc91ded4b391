// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Cooperative locking for the strand runtime.
//!
//! The mutex never blocks a thread: acquisition yields a promise that
//! resolves with a token once the lock is granted, and dropping the
//! token releases it.

mod mutex;

pub use mutex::{CoopMutex, Token};
