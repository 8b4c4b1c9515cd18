//! Dependency tracking.
//!
//! A [`Dependency`] is an opaque handle representing "something keeps this
//! session alive and may trigger re-executions". The session only cares about
//! the identity of the set: when the last handle is unregistered and nothing
//! is pending, the session completes.
//!
//! [`Upstreams`] is the per-session store for the dependencies that are
//! themselves feeds. Most sessions have none, so the store is created lazily
//! on first access (a single initialize-if-absent, no lock). Each tracked
//! upstream gets one forwarding loop that records the latest snapshot and
//! notifies the session; whether that warrants a re-run is the session's
//! decision, not the store's.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::StreamExt;
use tracing::trace;

use crate::context::FeedState;
use crate::feed::FeedId;
use crate::runtime::TaskLoop;
use crate::session::Session;
use crate::snapshot::Snapshot;

// --- Dependency ---

static NEXT_DEPENDENCY_ID: AtomicU64 = AtomicU64::new(0);

/// Opaque handle identifying one registered dependency.
///
/// Handles compare by identity, never by what they point at, so a dependency
/// can be unregistered without holding the upstream alive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Dependency(u64);

impl Dependency {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self(NEXT_DEPENDENCY_ID.fetch_add(1, Ordering::Relaxed))
    }
}

// --- UpdatePolicy ---

/// How a session reacts to an upstream publishing a new snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdatePolicy {
    /// Re-run the producer on every upstream snapshot.
    Always,
    /// Re-run only when the upstream revision advanced past the last one the
    /// store recorded.
    WhenChanged,
}

// --- Upstreams ---

struct UpstreamEntry {
    dependency: Dependency,
    /// `Rc<RefCell<Option<Snapshot<U>>>>` behind `dyn Any`; the feed id keys
    /// the entry, so the erased type is fixed per key.
    latest: Rc<dyn Any>,
    /// Revision of the newest upstream snapshot an execution has read via
    /// `watch` (0 = none yet). Lets the session's update policy skip
    /// notifications for snapshots it already consumed.
    observed_revision: Rc<Cell<u64>>,
    _forward: TaskLoop,
}

/// Lazily-created store of feed-dependencies for one session.
pub(crate) struct Upstreams {
    entries: RefCell<HashMap<FeedId, UpstreamEntry>>,
    disposed: Cell<bool>,
}

impl Upstreams {
    pub(crate) fn new() -> Rc<Self> {
        Rc::new(Self {
            entries: RefCell::new(HashMap::new()),
            disposed: Cell::new(false),
        })
    }

    /// Latest snapshot of `state`, tracking it as a dependency of `session`
    /// on first access.
    pub(crate) fn watch<U: Clone + 'static>(
        &self,
        session: &Session,
        state: &Rc<FeedState<U>>,
    ) -> Option<Snapshot<U>> {
        if self.disposed.get() {
            return None;
        }
        let feed_id = state.feed_id();
        if let Some(entry) = self.entries.borrow().get(&feed_id) {
            let latest = entry
                .latest
                .clone()
                .downcast::<RefCell<Option<Snapshot<U>>>>()
                .ok()?;
            let snapshot = latest.borrow().clone();
            if let Some(snapshot) = &snapshot {
                entry.observed_revision.set(snapshot.revision());
            }
            return snapshot;
        }

        trace!(?feed_id, "tracking upstream feed");
        let dependency = Dependency::new();
        session.register_dependency(dependency);
        let latest: Rc<RefCell<Option<Snapshot<U>>>> = Rc::new(RefCell::new(None));
        let observed_revision = Rc::new(Cell::new(0));
        let forward = TaskLoop::new(session.spawner(), {
            let mut updates = state.subscribe();
            let latest = latest.clone();
            let observed_revision = observed_revision.clone();
            let session = session.clone();
            async move {
                while let Some(snapshot) = updates.next().await {
                    let changed = snapshot.revision() > observed_revision.get();
                    *latest.borrow_mut() = Some(snapshot);
                    session.on_parent_updated(changed);
                }
                // Upstream completed: it no longer keeps this session alive.
                session.unregister_dependency(dependency);
            }
        });
        self.entries.borrow_mut().insert(
            feed_id,
            UpstreamEntry {
                dependency,
                latest,
                observed_revision,
                _forward: forward,
            },
        );
        // Nothing observed yet; the forwarding loop re-runs us once the
        // upstream produces.
        None
    }

    /// Drop every upstream subscription. Safe to call when some forwarding
    /// loops already completed on their own.
    pub(crate) fn dispose(&self) {
        self.disposed.set(true);
        self.entries.borrow_mut().clear();
    }

    #[cfg(test)]
    pub(crate) fn tracked(&self) -> usize {
        self.entries.borrow().len()
    }
}
