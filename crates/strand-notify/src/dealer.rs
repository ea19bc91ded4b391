// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Dealer halves of a value pipeline.
//!
//! A `Maker` is the broadcast (input) side, a `Taker` the consume
//! (output) side. Makers can be chained so a child republishes whatever
//! its parent produces.

use std::sync::Arc;

use crate::observer::{Forwarder, Target};

/// Named broadcast source for produced values.
pub struct Maker<T> {
    name: &'static str,
    target: Arc<Target<T>>,
    _relay: Option<Arc<Forwarder<T>>>,
}

impl<T: Send + Sync + 'static> Maker<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            target: Arc::new(Target::new()),
            _relay: None,
        }
    }

    /// A maker that republishes everything `parent` produces, in
    /// addition to its own notifications.
    pub fn chained(name: &'static str, parent: &Maker<T>) -> Self {
        let target = Arc::new(Target::new());
        let relay = Forwarder::between(&parent.target, target.clone());
        Self {
            name,
            target,
            _relay: Some(relay),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The target observers subscribe to.
    pub fn target(&self) -> &Arc<Target<T>> {
        &self.target
    }

    pub fn notify(&self, value: &T) {
        self.target.notify(value);
    }

    pub fn notify_move(&self, value: T) {
        self.target.notify_move(value);
    }
}

/// Consumer of produced values.
pub trait Taker<T>: Send + Sync {
    fn take(&self, value: T);
}

/// Discards everything it is given.
pub struct NullTaker;

impl<T> Taker<T> for NullTaker {
    fn take(&self, _value: T) {}
}

/// A taker that is itself a broadcast source: taken values are
/// republished to its subscribers by move.
pub struct FanoutTaker<T> {
    target: Arc<Target<T>>,
}

impl<T: Send + Sync + 'static> FanoutTaker<T> {
    pub fn new() -> Self {
        Self {
            target: Arc::new(Target::new()),
        }
    }

    pub fn target(&self) -> &Arc<Target<T>> {
        &self.target
    }
}

impl<T: Send + Sync + 'static> Default for FanoutTaker<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + Sync + 'static> Taker<T> for FanoutTaker<T> {
    fn take(&self, value: T) {
        self.target.notify_move(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::Observer;
    use std::sync::{Mutex, Weak};

    #[derive(Default)]
    struct Sink {
        seen: Mutex<Vec<u32>>,
    }

    impl Observer<u32> for Sink {
        fn notify(&self, value: &u32) {
            self.seen.lock().unwrap().push(*value);
        }
    }

    #[test]
    fn maker_broadcasts_to_subscribers() {
        let maker = Maker::new("test maker");
        let sink = Arc::new(Sink::default());
        maker
            .target()
            .subscribe(Arc::downgrade(&sink) as Weak<dyn Observer<u32>>);

        maker.notify(&1);
        maker.notify_move(2);
        assert_eq!(*sink.seen.lock().unwrap(), vec![1, 2]);
        assert_eq!(maker.name(), "test maker");
    }

    #[test]
    fn chained_maker_republishes_parent_values() {
        let parent = Maker::new("parent");
        let child = Maker::chained("child", &parent);
        let sink = Arc::new(Sink::default());
        child
            .target()
            .subscribe(Arc::downgrade(&sink) as Weak<dyn Observer<u32>>);

        parent.notify(&10);
        child.notify(&20);
        assert_eq!(*sink.seen.lock().unwrap(), vec![10, 20]);
    }

    #[test]
    fn fanout_taker_republishes_by_move() {
        let taker = FanoutTaker::new();
        let sink = Arc::new(Sink::default());
        taker
            .target()
            .subscribe(Arc::downgrade(&sink) as Weak<dyn Observer<u32>>);

        taker.take(33);
        assert_eq!(*sink.seen.lock().unwrap(), vec![33]);
    }

    #[test]
    fn null_taker_accepts_anything() {
        NullTaker.take(5u32);
        NullTaker.take("text");
    }
}
