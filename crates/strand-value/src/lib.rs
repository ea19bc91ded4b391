// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Immutable value messages exchanged by lambdas.
//!
//! A value is a cheap-to-clone tagged union; buffers and objects share
//! their payload. Equality is structural except for opaque shared data,
//! which compares by pointer.

mod value;

pub use value::{ByteBuf, Record, RecordBuilder, SharedData, Value, ValueError, ValueKind};
