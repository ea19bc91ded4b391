// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Service environment for the strand runtime.
//!
//! Hosts the type-indexed service locator that wires components together,
//! plus the two subsystems nearly everything depends on: the monotonic
//! clock and the structured logger.

mod clock;
mod env;
mod logger;

pub use clock::{Clock, ManualClock, Tick, WallClock};
pub use env::{Env, EnvBuilder, EnvError, EnvExt, FixedEnv, FixedEnvBuilder, LazyEnv, NullEnv, SharedAny};
pub use logger::{BufferLogger, LogItem, LogLevel, Logger, NullLogger};
