//! Feeds: reusable descriptions of how to produce a sequence of snapshots.
//!
//! A feed holds no live state. Opening it within a context creates one
//! [`Session`] per call; the returned [`SessionStream`] owns the session loop
//! and disposes the session when dropped, so an abandoned subscription never
//! leaks work.

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use futures_channel::mpsc;
use futures_util::FutureExt;
use futures_util::future::LocalBoxFuture;
use futures_util::stream::{LocalBoxStream, Stream, StreamExt};
use ulid::Ulid;

use crate::context::FeedContext;
use crate::dependency::{Dependency, UpdatePolicy};
use crate::runtime::TaskLoop;
use crate::scope::{CancelToken, Cancelled};
use crate::session::{Execution, ExecuteReason, ProduceFn, Session, spawn_session};
use crate::snapshot::{Fault, Snapshot, SnapshotUpdate};

/// Boxed stream of snapshots, the subscriber-facing shape of every feed.
pub type SnapshotStream<T> = LocalBoxStream<'static, Snapshot<T>>;

// --- FeedId ---

/// Identity of a feed description.
///
/// Two opens of the same feed share the id (and therefore a cached state
/// within one context); distinct feeds never collide.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FeedId(Ulid);

impl FeedId {
    pub(crate) fn new() -> Self {
        Self(Ulid::new())
    }
}

// --- Feed ---

/// A reusable description of how to produce snapshots of a `T`.
pub trait Feed<T: Clone + 'static>: 'static {
    fn id(&self) -> FeedId;

    /// Open one subscription: creates a dedicated session within `context`
    /// and returns its output stream.
    fn open(&self, context: &FeedContext) -> SessionStream<T>;
}

// --- SessionStream ---

/// Output stream of one session.
///
/// Owns the session loop and any auxiliary loops (trigger forwarders);
/// dropping the stream disposes the session, cancelling whatever it was
/// doing.
pub struct SessionStream<T> {
    receiver: mpsc::Receiver<Snapshot<T>>,
    session: Session,
    _task: TaskLoop,
    _extra_loops: Vec<TaskLoop>,
}

impl<T> SessionStream<T> {
    pub(crate) fn new(
        receiver: mpsc::Receiver<Snapshot<T>>,
        session: Session,
        task: TaskLoop,
        extra_loops: Vec<TaskLoop>,
    ) -> Self {
        Self {
            receiver,
            session,
            _task: task,
            _extra_loops: extra_loops,
        }
    }

    /// The session backing this subscription.
    pub fn session(&self) -> &Session {
        &self.session
    }
}

impl<T> Stream for SessionStream<T> {
    type Item = Snapshot<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.receiver).poll_next(cx)
    }
}

impl<T> Drop for SessionStream<T> {
    fn drop(&mut self) {
        self.session.dispose();
    }
}

// --- Cancellable ---

/// Stream adapter that ends as soon as a token is cancelled, even while the
/// inner stream is pending.
#[pin_project::pin_project]
pub struct Cancellable<S> {
    #[pin]
    inner: S,
    cancelled: Cancelled,
}

impl<S> Cancellable<S> {
    pub fn new(inner: S, token: &CancelToken) -> Self {
        Self {
            inner,
            cancelled: token.cancelled(),
        }
    }
}

impl<S: Stream> Stream for Cancellable<S> {
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        if Pin::new(this.cancelled).poll(cx).is_ready() {
            return Poll::Ready(None);
        }
        this.inner.poll_next(cx)
    }
}

// --- Trigger ---

/// An external pulse source: refresh buttons, timers, "load more" requests.
///
/// Pulses fan out to every subscribed session. Subscriptions are bounded(1):
/// a pending pulse already covers any newer one, and a disconnected
/// subscriber is pruned on the next pulse.
#[derive(Clone)]
pub struct Trigger {
    subscribers: Rc<RefCell<Vec<mpsc::Sender<()>>>>,
}

impl Trigger {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            subscribers: Rc::new(RefCell::new(Vec::new())),
        }
    }

    /// Fire the trigger once.
    pub fn pulse(&self) {
        self.subscribers.borrow_mut().retain_mut(|tx| {
            match tx.try_send(()) {
                Ok(()) => true,
                Err(error) if error.is_disconnected() => false,
                // Full: a pulse is already pending, which is equivalent.
                Err(_) => true,
            }
        });
    }

    fn subscribe(&self) -> mpsc::Receiver<()> {
        let (tx, rx) = mpsc::channel(1);
        self.subscribers.borrow_mut().push(tx);
        rx
    }
}

/// Register `trigger` as a dependency of `session`: every pulse requests an
/// execution with `reason`, and the dependency is released when the trigger
/// is dropped (completing the session if it was the last one).
pub(crate) fn attach_trigger(
    session: &Session,
    trigger: &Trigger,
    reason: ExecuteReason,
) -> TaskLoop {
    let dependency = Dependency::new();
    session.register_dependency(dependency);
    let mut pulses = trigger.subscribe();
    TaskLoop::new(session.spawner(), {
        let session = session.clone();
        async move {
            while let Some(()) = pulses.next().await {
                session.execute(reason);
            }
            session.unregister_dependency(dependency);
        }
    })
}

// --- CustomFeed ---

type SourceFn<T> = Rc<dyn Fn(CancelToken) -> SnapshotStream<T>>;

/// Feed over a raw asynchronous snapshot sequence.
///
/// The source is re-created per session; its snapshots are re-stamped with
/// the session's own revisions so ordering stays session-monotonic. The
/// session completes when the source ends.
pub struct CustomFeed<T> {
    id: FeedId,
    source: SourceFn<T>,
}

impl<T: Clone + 'static> CustomFeed<T> {
    pub fn new(source: impl Fn(CancelToken) -> SnapshotStream<T> + 'static) -> Self {
        Self {
            id: FeedId::new(),
            source: Rc::new(source),
        }
    }
}

impl<T: Clone + 'static> Feed<T> for CustomFeed<T> {
    fn id(&self) -> FeedId {
        self.id
    }

    fn open(&self, context: &FeedContext) -> SessionStream<T> {
        let source = self.source.clone();
        let producer: ProduceFn<T> = Rc::new(move |execution: Execution<T>| {
            let source = source.clone();
            async move {
                let token = execution.token();
                let mut raw = Cancellable::new(source(token.clone()), &token);
                while let Some(snapshot) = raw.next().await {
                    if !execution.publish(SnapshotUpdate::replace(snapshot)).await {
                        break;
                    }
                }
                Ok(None)
            }
            .boxed_local()
        });
        spawn_session(
            context.spawner(),
            &context.token(),
            UpdatePolicy::Always,
            |_| Vec::new(),
            producer,
        )
    }
}

// --- AsyncFeed ---

type LoadFn<T> = Rc<dyn Fn(CancelToken) -> LocalBoxFuture<'static, Result<Option<T>, Fault>>>;

/// Feed over a single-shot async value.
///
/// Without a refresh trigger the session completes right after the first
/// load; with one it stays alive and re-runs on every pulse.
pub struct AsyncFeed<T> {
    id: FeedId,
    load: LoadFn<T>,
    refresh: Option<Trigger>,
}

impl<T: Clone + 'static> AsyncFeed<T> {
    pub fn new(
        load: impl Fn(CancelToken) -> LocalBoxFuture<'static, Result<Option<T>, Fault>> + 'static,
    ) -> Self {
        Self {
            id: FeedId::new(),
            load: Rc::new(load),
            refresh: None,
        }
    }

    /// Re-run the loader whenever `refresh` pulses.
    pub fn with_refresh(mut self, refresh: Trigger) -> Self {
        self.refresh = Some(refresh);
        self
    }
}

impl<T: Clone + 'static> Feed<T> for AsyncFeed<T> {
    fn id(&self) -> FeedId {
        self.id
    }

    fn open(&self, context: &FeedContext) -> SessionStream<T> {
        let load = self.load.clone();
        let producer: ProduceFn<T> = Rc::new(move |execution: Execution<T>| {
            let load = load.clone();
            async move {
                match load(execution.token()).await? {
                    Some(value) => Ok(Some(SnapshotUpdate::value(value))),
                    None => Ok(Some(SnapshotUpdate::absent())),
                }
            }
            .boxed_local()
        });
        let refresh = self.refresh.clone();
        spawn_session(
            context.spawner(),
            &context.token(),
            UpdatePolicy::Always,
            move |session: &Session| match refresh {
                Some(trigger) => vec![attach_trigger(session, &trigger, ExecuteReason::Refresh)],
                None => Vec::new(),
            },
            producer,
        )
    }
}

// --- ComputedFeed ---

/// Feed driven by a custom producer with full access to its session.
///
/// This is the escape hatch for derived values: the producer can watch other
/// feed states through [`Session::watch`] (re-running when they change,
/// filtered by the configured [`UpdatePolicy`]), use the shared-instance
/// cache and publish intermediate snapshots.
pub struct ComputedFeed<T> {
    id: FeedId,
    producer: ProduceFn<T>,
    update_policy: UpdatePolicy,
}

impl<T: Clone + 'static> ComputedFeed<T> {
    pub fn new(
        produce: impl Fn(Execution<T>) -> LocalBoxFuture<'static, Result<Option<SnapshotUpdate<T>>, Fault>>
        + 'static,
    ) -> Self {
        Self {
            id: FeedId::new(),
            producer: Rc::new(produce),
            update_policy: UpdatePolicy::Always,
        }
    }

    /// How sessions of this feed react to upstream updates.
    pub fn with_update_policy(mut self, update_policy: UpdatePolicy) -> Self {
        self.update_policy = update_policy;
        self
    }
}

impl<T: Clone + 'static> Feed<T> for ComputedFeed<T> {
    fn id(&self) -> FeedId {
        self.id
    }

    fn open(&self, context: &FeedContext) -> SessionStream<T> {
        spawn_session(
            context.spawner(),
            &context.token(),
            self.update_policy,
            |_| Vec::new(),
            self.producer.clone(),
        )
    }
}
