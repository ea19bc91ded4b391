// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Single-shot deferred values.
//!
//! A `Completer` resolves its `Promise` exactly once with a value or an
//! error; listeners attached before resolution fire then, listeners
//! attached after fire immediately. Dropping the last completer of a
//! pending promise resolves it with [`PromiseError::Forgotten`].

mod promise;

pub use promise::{Completer, Outcome, Promise, PromiseError};
