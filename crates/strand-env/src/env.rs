// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Type-indexed service locator.
//!
//! Components ask the environment for their collaborators by handle type
//! (usually `Arc<dyn Trait>`). `LazyEnv` constructs services on first
//! lookup from registered factories and caches them; lookups that miss
//! fall through to an optional parent environment.

use std::any::{type_name, Any, TypeId};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use indexmap::IndexMap;

/// Shared handle as stored in an environment. The concrete type behind
/// the `Any` is the registered handle type itself (e.g. `Arc<dyn Logger>`).
pub type SharedAny = Arc<dyn Any + Send + Sync>;

/// Factory invocations nested deeper than this are assumed cyclic.
const MAX_FACTORY_NESTING: u32 = 1000;

#[derive(Debug, Clone, thiserror::Error)]
pub enum EnvError {
    #[error("missing dependency: {0}")]
    Missing(&'static str),

    #[error("dependency {name} could not be constructed: {reason}")]
    Construction { name: &'static str, reason: String },

    #[error("dependency stored under an unexpected type: {0}")]
    WrongType(&'static str),
}

/// A lookup source for shared service handles.
pub trait Env: Send + Sync + 'static {
    /// Fetch the handle registered for `key`. `name` is the handle's type
    /// name, used for diagnostics only.
    fn get_dyn(&self, key: TypeId, name: &'static str) -> Result<SharedAny, EnvError>;
}

/// Typed sugar over [`Env::get_dyn`].
pub trait EnvExt: Env {
    /// Fetch the handle registered for `H`, cloning it out.
    fn get<H>(&self) -> Result<H, EnvError>
    where
        H: Clone + Send + Sync + 'static,
    {
        let any = self.get_dyn(TypeId::of::<H>(), type_name::<H>())?;
        any.downcast_ref::<H>()
            .cloned()
            .ok_or(EnvError::WrongType(type_name::<H>()))
    }

    /// Like [`EnvExt::get`], but fall back to `default` on any failure.
    fn get_or<H>(&self, default: H) -> H
    where
        H: Clone + Send + Sync + 'static,
    {
        self.get().unwrap_or(default)
    }
}

impl<E: Env + ?Sized> EnvExt for E {}

/// Environment with nothing in it. Terminates fallback chains.
pub struct NullEnv;

impl NullEnv {
    pub fn shared() -> Arc<dyn Env> {
        Arc::new(NullEnv)
    }
}

impl Env for NullEnv {
    fn get_dyn(&self, _key: TypeId, name: &'static str) -> Result<SharedAny, EnvError> {
        Err(EnvError::Missing(name))
    }
}

type Factory = Arc<dyn Fn(&dyn Env) -> Result<SharedAny, EnvError> + Send + Sync>;

enum Slot {
    Ready(SharedAny),
    Pending(Factory),
}

/// Lazily-constructing environment.
///
/// A factory receives the environment itself so it can request its own
/// dependencies; the result replaces the factory for later lookups.
/// Mutually-dependent factories recurse until the nesting guard trips.
pub struct LazyEnv {
    slots: Mutex<IndexMap<TypeId, Slot>>,
    fallback: Option<Arc<dyn Env>>,
    nest: AtomicU32,
}

impl LazyEnv {
    pub fn builder() -> EnvBuilder {
        EnvBuilder::default()
    }
}

impl Env for LazyEnv {
    fn get_dyn(&self, key: TypeId, name: &'static str) -> Result<SharedAny, EnvError> {
        let factory = {
            let slots = self.slots.lock().unwrap();
            match slots.get(&key) {
                Some(Slot::Ready(handle)) => return Ok(handle.clone()),
                Some(Slot::Pending(factory)) => factory.clone(),
                None => {
                    drop(slots);
                    return match &self.fallback {
                        Some(parent) => parent.get_dyn(key, name),
                        None => Err(EnvError::Missing(name)),
                    };
                }
            }
        };

        let nest = self.nest.fetch_add(1, Ordering::Relaxed);
        debug_assert!(nest < MAX_FACTORY_NESTING, "cyclic dependency detected: {name}");
        let built = factory(self);
        self.nest.fetch_sub(1, Ordering::Relaxed);
        let handle = built?;

        let mut slots = self.slots.lock().unwrap();
        match slots.get(&key) {
            // Another looker-up raced us to construction; keep theirs.
            Some(Slot::Ready(existing)) => Ok(existing.clone()),
            _ => {
                slots.insert(key, Slot::Ready(handle.clone()));
                Ok(handle)
            }
        }
    }
}

/// Builder for [`LazyEnv`].
#[derive(Default)]
pub struct EnvBuilder {
    slots: IndexMap<TypeId, Slot>,
    fallback: Option<Arc<dyn Env>>,
}

impl EnvBuilder {
    /// Register an already-constructed handle.
    pub fn ready<H>(mut self, handle: H) -> Self
    where
        H: Clone + Send + Sync + 'static,
    {
        self.slots.insert(TypeId::of::<H>(), Slot::Ready(Arc::new(handle)));
        self
    }

    /// Register a factory invoked on first lookup of `H`.
    pub fn factory<H, F>(mut self, factory: F) -> Self
    where
        H: Clone + Send + Sync + 'static,
        F: Fn(&dyn Env) -> Result<H, EnvError> + Send + Sync + 'static,
    {
        let factory: Factory = Arc::new(move |env| {
            let handle = factory(env)?;
            Ok(Arc::new(handle) as SharedAny)
        });
        self.slots.insert(TypeId::of::<H>(), Slot::Pending(factory));
        self
    }

    /// Consult `parent` for keys not registered here.
    pub fn fallback(mut self, parent: Arc<dyn Env>) -> Self {
        self.fallback = Some(parent);
        self
    }

    pub fn build(self) -> Arc<LazyEnv> {
        Arc::new(LazyEnv {
            slots: Mutex::new(self.slots),
            fallback: self.fallback,
            nest: AtomicU32::new(0),
        })
    }
}

/// Immutable environment with a frozen handle set.
pub struct FixedEnv {
    slots: IndexMap<TypeId, SharedAny>,
}

impl FixedEnv {
    pub fn builder() -> FixedEnvBuilder {
        FixedEnvBuilder::default()
    }
}

impl Env for FixedEnv {
    fn get_dyn(&self, key: TypeId, name: &'static str) -> Result<SharedAny, EnvError> {
        self.slots
            .get(&key)
            .cloned()
            .ok_or(EnvError::Missing(name))
    }
}

/// Builder for [`FixedEnv`].
#[derive(Default)]
pub struct FixedEnvBuilder {
    slots: IndexMap<TypeId, SharedAny>,
}

impl FixedEnvBuilder {
    pub fn ready<H>(mut self, handle: H) -> Self
    where
        H: Clone + Send + Sync + 'static,
    {
        self.slots.insert(TypeId::of::<H>(), Arc::new(handle));
        self
    }

    /// Copy the handle registered for `H` out of `src`, forcing lazy
    /// construction if needed.
    pub fn take<H>(mut self, src: &dyn Env) -> Result<Self, EnvError>
    where
        H: Clone + Send + Sync + 'static,
    {
        let handle = src.get::<H>()?;
        self.slots.insert(TypeId::of::<H>(), Arc::new(handle));
        Ok(self)
    }

    pub fn build(self) -> Arc<FixedEnv> {
        Arc::new(FixedEnv { slots: self.slots })
    }
}
