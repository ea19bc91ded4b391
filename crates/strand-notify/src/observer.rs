// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Observer pattern with lifecycle safety.
//!
//! Targets hold observers weakly: dropping an observer unsubscribes it,
//! dropping a target delivers a destruction notice to every survivor.
//! Subscribing or broadcasting from inside a callback on the same target
//! is a usage error, detected in debug builds.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// Receiver of broadcasts from a [`Target`].
pub trait Observer<T>: Send + Sync {
    fn notify(&self, value: &T);

    /// Move-delivery; used when this observer is the sole subscriber.
    fn notify_moved(&self, value: T) {
        self.notify(&value);
    }

    /// The observed target is being destroyed.
    fn notify_destruction(&self) {}
}

/// Broadcast source. Observers subscribed after a broadcast started are
/// not part of that broadcast.
pub struct Target<T> {
    observers: Mutex<Vec<Weak<dyn Observer<T>>>>,
    notifying: AtomicBool,
}

/// Clears the re-entrancy flag even if an observer panics.
struct NotifyGuard<'a>(&'a AtomicBool);

impl Drop for NotifyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<T> Target<T> {
    pub fn new() -> Self {
        Self {
            observers: Mutex::new(Vec::new()),
            notifying: AtomicBool::new(false),
        }
    }

    /// Subscribe `observer` for future broadcasts. It stays subscribed
    /// while the `Arc` it came from is alive.
    pub fn subscribe(&self, observer: Weak<dyn Observer<T>>) {
        debug_assert!(
            !self.notifying.load(Ordering::Acquire),
            "do not subscribe from an observer callback"
        );
        self.observers.lock().unwrap().push(observer);
    }

    /// Whether at least one live observer is subscribed.
    pub fn observed(&self) -> bool {
        self.observers
            .lock()
            .unwrap()
            .iter()
            .any(|w| w.strong_count() > 0)
    }

    /// Broadcast by reference to every live observer, in subscription order.
    pub fn notify(&self, value: &T) {
        let live = self.snapshot();
        let _guard = self.begin_notify();
        for obs in &live {
            obs.notify(value);
        }
    }

    /// Broadcast, delivering by move when exactly one observer is live.
    pub fn notify_move(&self, value: T) {
        let live = self.snapshot();
        let _guard = self.begin_notify();
        if live.len() == 1 {
            live.into_iter().next().unwrap().notify_moved(value);
        } else {
            for obs in &live {
                obs.notify(&value);
            }
        }
    }

    /// Upgrade the current subscriber list, pruning dead entries.
    fn snapshot(&self) -> Vec<Arc<dyn Observer<T>>> {
        let mut observers = self.observers.lock().unwrap();
        observers.retain(|w| w.strong_count() > 0);
        observers.iter().filter_map(Weak::upgrade).collect()
    }

    fn begin_notify(&self) -> NotifyGuard<'_> {
        let was = self.notifying.swap(true, Ordering::AcqRel);
        debug_assert!(!was, "do not broadcast from an observer callback");
        NotifyGuard(&self.notifying)
    }
}

impl<T> Default for Target<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for Target<T> {
    fn drop(&mut self) {
        let live = self.snapshot();
        let _guard = self.begin_notify();
        for obs in &live {
            obs.notify_destruction();
        }
    }
}

/// Relays broadcasts from a source target into a destination target,
/// preserving move-delivery.
pub struct Forwarder<T> {
    dst: Arc<Target<T>>,
}

impl<T: Send + Sync> Forwarder<T> {
    /// Create a forwarder and subscribe it to `src`. The returned `Arc`
    /// keeps the relay alive.
    pub fn between(src: &Target<T>, dst: Arc<Target<T>>) -> Arc<Self>
    where
        T: 'static,
    {
        let fwd = Arc::new(Self { dst });
        src.subscribe(Arc::downgrade(&fwd) as Weak<dyn Observer<T>>);
        fwd
    }
}

impl<T: Send + Sync> Observer<T> for Forwarder<T> {
    fn notify(&self, value: &T) {
        self.dst.notify(value);
    }

    fn notify_moved(&self, value: T) {
        self.dst.notify_move(value);
    }
}
