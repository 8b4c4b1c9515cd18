//! The owning context of feed states.
//!
//! A [`FeedContext`] is the unit of bulk teardown: it owns the executor
//! handle, a root cancellation scope every session links to, and a cache of
//! [`FeedState`]s keyed by feed identity (optionally scoped to an owner
//! reference), so resubscribing to the same logical source reuses the
//! existing session instead of duplicating work. Disposing the context
//! deterministically tears down everything it created.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use futures_channel::mpsc;
use futures_util::StreamExt;
use tracing::{debug, trace};

use crate::feed::{Feed, FeedId, SnapshotStream};
use crate::runtime::{Spawner, TaskLoop};
use crate::scope::{CancelScope, CancelToken};
use crate::session::Session;
use crate::shared::SessionClosed;
use crate::snapshot::Snapshot;

const SUBSCRIBER_CAPACITY: usize = 32;

// --- FeedContext ---

#[derive(Clone, PartialEq, Eq, Hash)]
struct StateKey {
    /// Owner identity (`Rc` pointer), `None` for context-wide states.
    owner: Option<usize>,
    feed: FeedId,
}

struct ContextInner {
    spawner: Spawner,
    scope: CancelScope,
    states: RefCell<HashMap<StateKey, Rc<dyn Any>>>,
    disposed: Cell<bool>,
}

/// One consumer-facing scope of feed states.
#[derive(Clone)]
pub struct FeedContext {
    inner: Rc<ContextInner>,
}

impl FeedContext {
    pub fn new(spawner: Spawner) -> Self {
        Self {
            inner: Rc::new(ContextInner {
                spawner,
                scope: CancelScope::new(),
                states: RefCell::new(HashMap::new()),
                disposed: Cell::new(false),
            }),
        }
    }

    pub fn spawner(&self) -> &Spawner {
        &self.inner.spawner
    }

    /// Parent token for every session opened within this context.
    pub fn token(&self) -> CancelToken {
        self.inner.scope.token()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.get()
    }

    /// Get or create the cached state of `feed` within this context.
    pub fn source<T, F>(&self, feed: &F) -> Result<Rc<FeedState<T>>, SessionClosed>
    where
        T: Clone + 'static,
        F: Feed<T>,
    {
        self.state_for(None, feed)
    }

    /// Like [`source`](Self::source), but keyed by `owner`'s identity as
    /// well: two owners get independent states of the same feed, one owner
    /// always gets its state back.
    pub fn source_for_owner<O, T, F>(
        &self,
        owner: &Rc<O>,
        feed: &F,
    ) -> Result<Rc<FeedState<T>>, SessionClosed>
    where
        O: 'static,
        T: Clone + 'static,
        F: Feed<T>,
    {
        self.state_for(Some(Rc::as_ptr(owner) as usize), feed)
    }

    fn state_for<T, F>(
        &self,
        owner: Option<usize>,
        feed: &F,
    ) -> Result<Rc<FeedState<T>>, SessionClosed>
    where
        T: Clone + 'static,
        F: Feed<T>,
    {
        if self.is_disposed() {
            return Err(SessionClosed);
        }
        let key = StateKey {
            owner,
            feed: feed.id(),
        };
        if let Some(entry) = self.inner.states.borrow().get(&key) {
            // The key carries the feed identity, so the type always matches.
            if let Ok(state) = entry.clone().downcast::<FeedState<T>>() {
                return Ok(state);
            }
        }
        let state = FeedState::open(self, feed);
        self.inner
            .states
            .borrow_mut()
            .insert(key, state.clone() as Rc<dyn Any>);
        Ok(state)
    }

    /// Tear down every state and session this context created. Idempotent.
    pub fn dispose(&self) {
        if self.inner.disposed.replace(true) {
            return;
        }
        debug!("context disposed");
        // Cancelling the root scope disposes every session through its
        // parent link; clearing the map releases the states and their pumps.
        self.inner.scope.cancel();
        self.inner.states.borrow_mut().clear();
    }
}

// --- FeedState ---

/// The cached, shareable side of one feed within one context.
///
/// Holds a single long-lived session, retains the latest snapshot for late
/// subscribers and fans updates out to everyone subscribed.
pub struct FeedState<T> {
    feed_id: FeedId,
    session: Session,
    current: Rc<RefCell<Option<Snapshot<T>>>>,
    subscribers: Rc<RefCell<Vec<mpsc::Sender<Snapshot<T>>>>>,
    completed: Rc<Cell<bool>>,
    _pump: TaskLoop,
}

impl<T: Clone + 'static> FeedState<T> {
    fn open<F: Feed<T>>(context: &FeedContext, feed: &F) -> Rc<Self> {
        let stream = feed.open(context);
        let session = stream.session().clone();
        let current = Rc::new(RefCell::new(None));
        let subscribers: Rc<RefCell<Vec<mpsc::Sender<Snapshot<T>>>>> =
            Rc::new(RefCell::new(Vec::new()));
        let completed = Rc::new(Cell::new(false));

        let pump = TaskLoop::new(context.spawner(), {
            let current = current.clone();
            let subscribers = subscribers.clone();
            let completed = completed.clone();
            let mut stream = stream;
            async move {
                while let Some(snapshot) = stream.next().await {
                    *current.borrow_mut() = Some(snapshot.clone());
                    subscribers.borrow_mut().retain_mut(|tx| {
                        match tx.try_send(snapshot.clone()) {
                            Ok(()) => true,
                            Err(error) if error.is_disconnected() => false,
                            // Full: the subscriber lags; snapshots are whole
                            // states, skipping intermediates is sound.
                            Err(_) => true,
                        }
                    });
                }
                trace!("feed state completed");
                completed.set(true);
                // Closing the fanout channels completes every subscriber.
                subscribers.borrow_mut().clear();
            }
        });

        Rc::new(Self {
            feed_id: feed.id(),
            session,
            current,
            subscribers,
            completed,
            _pump: pump,
        })
    }

    pub fn feed_id(&self) -> FeedId {
        self.feed_id
    }

    /// The session backing this state.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// The latest snapshot, if any was produced yet.
    pub fn current(&self) -> Option<Snapshot<T>> {
        self.current.borrow().clone()
    }

    /// Subscribe to this state's snapshots.
    ///
    /// The current snapshot (if any) is replayed first; the stream then
    /// follows every update and ends when the state's session completes.
    pub fn subscribe(&self) -> SnapshotStream<T> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        if let Some(current) = self.current.borrow().clone() {
            let mut tx = tx.clone();
            tx.try_send(current).ok();
        }
        if !self.completed.get() {
            self.subscribers.borrow_mut().push(tx);
        }
        rx.boxed_local()
    }
}
