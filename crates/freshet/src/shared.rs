//! Session-scoped shared instances.
//!
//! Several contributions running inside one session execution (parallel
//! dependency branches, successive page loads) often need the same expensive
//! intermediate object - a connection, a computed index, an accumulation
//! buffer. The [`SharedScope`] memoizes such objects for the lifetime of one
//! session: the factory for a key runs exactly once, every branch observes the
//! same instance.
//!
//! Clearing the scope releases the `Rc`s but never "disposes" the stored
//! values beyond that; a value owning a real resource is the caller's job to
//! shut down.

use std::any::{Any, TypeId};
use std::borrow::Cow;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::rc::Rc;

// --- SessionClosed ---

/// A value-returning call was made on a session whose disposal completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionClosed;

impl fmt::Display for SessionClosed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session is disposed")
    }
}

impl Error for SessionClosed {}

// --- SharedKey ---

/// Key of a shared instance: the stored type plus a name.
///
/// Embedding the type makes key collisions across independent contributors
/// impossible as long as each picks its own name for its own type.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SharedKey {
    type_id: TypeId,
    name: Cow<'static, str>,
}

impl SharedKey {
    pub fn of<V: 'static>(name: impl Into<Cow<'static, str>>) -> Self {
        Self {
            type_id: TypeId::of::<V>(),
            name: name.into(),
        }
    }
}

// --- SharedScope ---

/// The per-session cache of shared instances.
///
/// Lookups and inserts happen inside one critical section (a `RefCell` borrow
/// that never spans an await), so two branches racing on first access cannot
/// both run the factory. The factory itself must not touch the scope again.
pub struct SharedScope {
    entries: RefCell<HashMap<SharedKey, Rc<dyn Any>>>,
    closed: Cell<bool>,
}

impl SharedScope {
    pub fn new() -> Self {
        Self {
            entries: RefCell::new(HashMap::new()),
            closed: Cell::new(false),
        }
    }

    /// Return the instance stored under `key`, running `factory` exactly once
    /// per session if it is absent.
    pub fn get_or_create<V: 'static>(
        &self,
        key: SharedKey,
        factory: impl FnOnce() -> V,
    ) -> Result<Rc<V>, SessionClosed> {
        if self.closed.get() {
            return Err(SessionClosed);
        }
        let mut entries = self.entries.borrow_mut();
        if let Some(existing) = entries.get(&key) {
            // The key embeds the stored type, so the downcast cannot fail.
            if let Ok(value) = existing.clone().downcast::<V>() {
                return Ok(value);
            }
        }
        let value = Rc::new(factory());
        entries.insert(key, value.clone());
        Ok(value)
    }

    /// Overwrite (or create) the instance stored under `key`.
    pub fn set<V: 'static>(&self, key: SharedKey, value: V) -> Result<Rc<V>, SessionClosed> {
        if self.closed.get() {
            return Err(SessionClosed);
        }
        let value = Rc::new(value);
        self.entries.borrow_mut().insert(key, value.clone());
        Ok(value)
    }

    /// Drop all entries and reject any further access.
    pub fn dispose(&self) {
        self.closed.set(true);
        self.entries.borrow_mut().clear();
    }

    pub fn is_disposed(&self) -> bool {
        self.closed.get()
    }
}

impl Default for SharedScope {
    fn default() -> Self {
        Self::new()
    }
}
