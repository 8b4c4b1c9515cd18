//! Cancellation scopes.
//!
//! A [`CancelScope`] owns the right to cancel; [`CancelToken`]s are cheap
//! observers handed to producers and loops. Scopes form a tree: cancelling a
//! parent cancels every linked child, cancelling a child never touches the
//! parent. Cancellation is cooperative - a token is polled or awaited, running
//! code is never aborted from the outside.

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll, Waker};

struct CancelInner {
    cancelled: AtomicBool,
    /// Wakers of pending [`Cancelled`] futures; woken and drained on cancel.
    wakers: RefCell<Vec<Option<Waker>>>,
    /// One-shot callbacks, slot-addressed so a registration can detach.
    callbacks: RefCell<Vec<Option<Box<dyn FnOnce()>>>>,
    children: RefCell<Vec<Weak<CancelInner>>>,
}

impl CancelInner {
    fn new() -> Rc<Self> {
        Rc::new(Self {
            cancelled: AtomicBool::new(false),
            wakers: RefCell::new(Vec::new()),
            callbacks: RefCell::new(Vec::new()),
            children: RefCell::new(Vec::new()),
        })
    }

    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        // Take everything out of the cells before running any foreign code:
        // callbacks may re-enter (detach a registration, cancel a child).
        let wakers = std::mem::take(&mut *self.wakers.borrow_mut());
        let callbacks = std::mem::take(&mut *self.callbacks.borrow_mut());
        let children = std::mem::take(&mut *self.children.borrow_mut());
        for waker in wakers.into_iter().flatten() {
            waker.wake();
        }
        for callback in callbacks.into_iter().flatten() {
            callback();
        }
        for child in children {
            if let Some(child) = child.upgrade() {
                child.cancel();
            }
        }
    }
}

// --- CancelScope ---

/// The owning side of a cancellation lifetime.
pub struct CancelScope {
    inner: Rc<CancelInner>,
}

impl CancelScope {
    pub fn new() -> Self {
        Self {
            inner: CancelInner::new(),
        }
    }

    /// Create a scope whose token is cancelled when `parent` cancels.
    ///
    /// The link is one-way: cancelling the child leaves the parent (and its
    /// other children) untouched.
    pub fn child_of(parent: &CancelToken) -> Self {
        let scope = Self::new();
        if parent.is_cancelled() {
            scope.cancel();
        } else {
            parent
                .inner
                .children
                .borrow_mut()
                .push(Rc::downgrade(&scope.inner));
        }
        scope
    }

    pub fn token(&self) -> CancelToken {
        CancelToken {
            inner: self.inner.clone(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Cancel this scope: wakes every pending wait, runs registered callbacks
    /// once, then cascades to child scopes. Idempotent.
    pub fn cancel(&self) {
        self.inner.cancel();
    }
}

impl Default for CancelScope {
    fn default() -> Self {
        Self::new()
    }
}

// --- CancelToken ---

/// Observer handle for a [`CancelScope`].
#[derive(Clone)]
pub struct CancelToken {
    inner: Rc<CancelInner>,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// A future resolving once the token is cancelled. Never resolves for a
    /// token whose scope outlives the caller.
    pub fn cancelled(&self) -> Cancelled {
        Cancelled {
            inner: self.inner.clone(),
            slot: None,
        }
    }

    /// Register a one-shot callback to run on cancellation.
    ///
    /// If the token is already cancelled the callback runs immediately. The
    /// returned registration detaches the callback without running it.
    pub fn on_cancel(&self, callback: impl FnOnce() + 'static) -> CancelRegistration {
        if self.is_cancelled() {
            callback();
            return CancelRegistration {
                inner: Weak::new(),
                slot: 0,
            };
        }
        let mut callbacks = self.inner.callbacks.borrow_mut();
        let slot = callbacks.len();
        callbacks.push(Some(Box::new(callback)));
        CancelRegistration {
            inner: Rc::downgrade(&self.inner),
            slot,
        }
    }
}

/// Handle to a callback registered with [`CancelToken::on_cancel`].
pub struct CancelRegistration {
    inner: Weak<CancelInner>,
    slot: usize,
}

impl CancelRegistration {
    /// Remove the callback so it never runs. No-op after cancellation.
    pub fn detach(self) {
        if let Some(inner) = self.inner.upgrade() {
            if let Some(entry) = inner.callbacks.borrow_mut().get_mut(self.slot) {
                entry.take();
            }
        }
    }
}

/// Future returned by [`CancelToken::cancelled`].
pub struct Cancelled {
    inner: Rc<CancelInner>,
    slot: Option<usize>,
}

impl Future for Cancelled {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if this.inner.cancelled.load(Ordering::SeqCst) {
            return Poll::Ready(());
        }
        let mut wakers = this.inner.wakers.borrow_mut();
        match this.slot {
            Some(slot) => wakers[slot] = Some(cx.waker().clone()),
            None => {
                wakers.push(Some(cx.waker().clone()));
                this.slot = Some(wakers.len() - 1);
            }
        }
        Poll::Pending
    }
}

// --- ScopeGuard ---

/// Cancels a scope when dropped.
///
/// Ties a scope's lifetime to a stream or async block: when the owner is
/// dropped mid-flight, everything observing the scope's token unwinds.
pub struct ScopeGuard {
    scope: CancelScope,
}

impl ScopeGuard {
    pub fn new(scope: CancelScope) -> Self {
        Self { scope }
    }

    pub fn token(&self) -> CancelToken {
        self.scope.token()
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        self.scope.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn test_cancel_is_idempotent() {
        let scope = CancelScope::new();
        let count = Rc::new(Cell::new(0));
        let count_clone = count.clone();
        let _registration = scope.token().on_cancel(move || {
            count_clone.set(count_clone.get() + 1);
        });

        scope.cancel();
        scope.cancel();

        assert!(scope.is_cancelled());
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn test_parent_cancels_child_not_reverse() {
        let parent = CancelScope::new();
        let child = CancelScope::child_of(&parent.token());
        let sibling = CancelScope::child_of(&parent.token());

        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
        assert!(!sibling.is_cancelled());

        parent.cancel();
        assert!(sibling.is_cancelled());
    }

    #[test]
    fn test_parent_cancel_fires_all_registrations() {
        let parent = CancelScope::new();
        let first = Rc::new(Cell::new(false));
        let second = Rc::new(Cell::new(false));
        let first_clone = first.clone();
        let second_clone = second.clone();
        let _a = parent.token().on_cancel(move || first_clone.set(true));
        let _b = parent.token().on_cancel(move || second_clone.set(true));

        parent.cancel();

        assert!(first.get());
        assert!(second.get());
    }

    #[test]
    fn test_detached_registration_never_runs() {
        let scope = CancelScope::new();
        let fired = Rc::new(Cell::new(false));
        let fired_clone = fired.clone();
        let registration = scope.token().on_cancel(move || fired_clone.set(true));

        registration.detach();
        scope.cancel();

        assert!(!fired.get());
    }

    #[test]
    fn test_registration_on_cancelled_token_runs_immediately() {
        let scope = CancelScope::new();
        scope.cancel();

        let fired = Rc::new(Cell::new(false));
        let fired_clone = fired.clone();
        let _registration = scope.token().on_cancel(move || fired_clone.set(true));

        assert!(fired.get());
    }

    #[test]
    fn test_child_of_cancelled_parent_starts_cancelled() {
        let parent = CancelScope::new();
        parent.cancel();
        let child = CancelScope::child_of(&parent.token());
        assert!(child.is_cancelled());
    }

    #[test]
    fn test_cancelled_future_resolves() {
        use futures_executor::LocalPool;
        use futures_util::task::LocalSpawnExt;

        let mut pool = LocalPool::new();
        let scope = CancelScope::new();
        let token = scope.token();
        let resolved = Rc::new(Cell::new(false));
        let resolved_clone = resolved.clone();

        pool.spawner()
            .spawn_local(async move {
                token.cancelled().await;
                resolved_clone.set(true);
            })
            .unwrap();

        pool.run_until_stalled();
        assert!(!resolved.get());

        scope.cancel();
        pool.run_until_stalled();
        assert!(resolved.get());
    }

    #[test]
    fn test_scope_guard_cancels_on_drop() {
        let scope = CancelScope::new();
        let token = scope.token();
        let guard = ScopeGuard::new(scope);
        assert!(!token.is_cancelled());
        drop(guard);
        assert!(token.is_cancelled());
    }
}
