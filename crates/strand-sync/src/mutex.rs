// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Token-based cooperative mutex.
//!
//! Holding a [`Token`] is holding the lock; the last clone dropping
//! releases it. Inclusive (shared) grants hand every concurrent
//! inclusive locker a clone of one token; exclusive grants stand alone.
//! Waiters queue FIFO, except that inclusive requests arriving while the
//! tail of the queue is inclusive coalesce onto that tail grant. An
//! exclusive waiter behind a popular inclusive tail can therefore wait
//! arbitrarily long; callers that need strict turn-taking should lock
//! exclusively throughout.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};

use strand_future::{Completer, Outcome, Promise, PromiseError};
use strand_sched::TaskQueue;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mode {
    Inclusive,
    Exclusive,
}

/// Lock ownership handle. Clones share one grant; the grant is released
/// when the last clone drops.
#[derive(Clone)]
pub struct Token {
    permit: Arc<Permit>,
}

struct Permit {
    core: Weak<MutexCore>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        if let Some(core) = self.core.upgrade() {
            MutexCore::unlock(&core);
        }
    }
}

struct LockState {
    current: Weak<Permit>,
    pends: VecDeque<Completer<Token>>,
    last_inclusive: bool,
}

struct MutexCore {
    state: Mutex<LockState>,
    #[cfg(debug_assertions)]
    home: std::thread::ThreadId,
}

impl MutexCore {
    fn assert_home(&self) {
        #[cfg(debug_assertions)]
        debug_assert_eq!(
            std::thread::current().id(),
            self.home,
            "cooperative mutex used from a foreign thread"
        );
    }

    fn mint(core: &Arc<MutexCore>, st: &mut LockState) -> Token {
        let permit = Arc::new(Permit {
            core: Arc::downgrade(core),
        });
        st.current = Arc::downgrade(&permit);
        Token { permit }
    }

    fn unlock(core: &Arc<MutexCore>) {
        core.assert_home();
        let granted = {
            let mut st = core.state.lock().unwrap();
            st.current = Weak::new();
            match st.pends.pop_front() {
                None => None,
                Some(comp) => {
                    let token = Self::mint(core, &mut st);
                    Some((comp, token))
                }
            }
        };
        // Completing runs grant listeners; do that outside the state lock
        // so a listener may lock or unlock again.
        if let Some((comp, token)) = granted {
            comp.complete(token);
        }
    }
}

/// Cooperative mutex ordering exclusive and inclusive lockers.
pub struct CoopMutex {
    core: Arc<MutexCore>,
}

impl CoopMutex {
    pub fn new() -> Self {
        Self {
            core: Arc::new(MutexCore {
                state: Mutex::new(LockState {
                    current: Weak::new(),
                    pends: VecDeque::new(),
                    last_inclusive: false,
                }),
                #[cfg(debug_assertions)]
                home: std::thread::current().id(),
            }),
        }
    }

    /// Acquire inclusively. The promise resolves with a token once every
    /// earlier exclusive holder is gone; concurrent inclusive lockers
    /// share one grant.
    pub fn lock(&self) -> Promise<Token> {
        self.lock_mode(Mode::Inclusive)
    }

    /// Acquire exclusively.
    pub fn lock_ex(&self) -> Promise<Token> {
        self.lock_mode(Mode::Exclusive)
    }

    /// Inclusive acquire that returns `None` instead of waiting.
    pub fn try_lock(&self) -> Option<Token> {
        self.try_lock_mode(Mode::Inclusive)
    }

    /// Exclusive acquire that returns `None` instead of waiting.
    pub fn try_lock_ex(&self) -> Option<Token> {
        self.try_lock_mode(Mode::Exclusive)
    }

    fn lock_mode(&self, mode: Mode) -> Promise<Token> {
        self.core.assert_home();
        let mut st = self.core.state.lock().unwrap();
        let current = st.current.upgrade();

        match mode {
            Mode::Inclusive => {
                if st.last_inclusive {
                    if st.pends.is_empty() {
                        if let Some(permit) = &current {
                            return Promise::resolved(Token {
                                permit: permit.clone(),
                            });
                        }
                    } else {
                        // Coalesce onto the inclusive tail grant.
                        return st.pends.back().unwrap().promise();
                    }
                }
                st.last_inclusive = true;
            }
            Mode::Exclusive => {
                st.last_inclusive = false;
            }
        }

        if current.is_some() {
            let comp = Completer::new();
            let promise = comp.promise();
            st.pends.push_back(comp);
            return promise;
        }
        let token = MutexCore::mint(&self.core, &mut st);
        Promise::resolved(token)
    }

    fn try_lock_mode(&self, mode: Mode) -> Option<Token> {
        self.core.assert_home();
        let mut st = self.core.state.lock().unwrap();
        if !st.pends.is_empty() {
            return None;
        }

        let current = st.current.upgrade();
        match mode {
            Mode::Inclusive => {
                if let Some(permit) = current {
                    return st.last_inclusive.then(|| Token { permit });
                }
                st.last_inclusive = true;
            }
            Mode::Exclusive => {
                if current.is_some() {
                    return None;
                }
                st.last_inclusive = false;
            }
        }
        Some(MutexCore::mint(&self.core, &mut st))
    }

    /// Acquire inclusively, run `f` on the async queue, resolve on the
    /// sync queue, releasing the token once the returned promise
    /// resolves.
    pub fn run_async<T, A, S, F>(
        &self,
        aq: &Arc<dyn TaskQueue<A>>,
        sq: &Arc<dyn TaskQueue<S>>,
        f: F,
    ) -> Promise<T>
    where
        T: Send + Sync + 'static,
        A: 'static,
        S: 'static,
        F: FnOnce(&mut A) -> Result<T, PromiseError> + Send + 'static,
    {
        self.run_async_mode(Mode::Inclusive, aq, sq, f)
    }

    /// Exclusive variant of [`CoopMutex::run_async`].
    pub fn run_async_ex<T, A, S, F>(
        &self,
        aq: &Arc<dyn TaskQueue<A>>,
        sq: &Arc<dyn TaskQueue<S>>,
        f: F,
    ) -> Promise<T>
    where
        T: Send + Sync + 'static,
        A: 'static,
        S: 'static,
        F: FnOnce(&mut A) -> Result<T, PromiseError> + Send + 'static,
    {
        self.run_async_mode(Mode::Exclusive, aq, sq, f)
    }

    fn run_async_mode<T, A, S, F>(
        &self,
        mode: Mode,
        aq: &Arc<dyn TaskQueue<A>>,
        sq: &Arc<dyn TaskQueue<S>>,
        f: F,
    ) -> Promise<T>
    where
        T: Send + Sync + 'static,
        A: 'static,
        S: 'static,
        F: FnOnce(&mut A) -> Result<T, PromiseError> + Send + 'static,
    {
        let comp = Completer::new();
        let ret = comp.promise();
        let result = ret.clone();
        let aq = aq.clone();
        let sq = sq.clone();
        self.lock_mode(mode).listen(move |outcome| match outcome {
            Outcome::Value(token) => {
                result.attach(token.clone());
                comp.run_async(&aq, &sq, f);
            }
            Outcome::Error(error) => comp.fail(error.clone()),
        });
        ret
    }
}

impl Default for CoopMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CoopMutex {
    fn drop(&mut self) {
        // Dropping the queued completers resolves every pending grant
        // with a forgotten error.
        let pends = std::mem::take(&mut self.core.state.lock().unwrap().pends);
        drop(pends);
    }
}
