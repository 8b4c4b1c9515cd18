//! The execution session.
//!
//! A session is the live side of one feed subscription: it serializes all
//! producer executions, owns the cancellation lifetime, hosts the dependency
//! set and the shared-instance cache, and publishes the resulting snapshots
//! in order.
//!
//! # Execution requests
//!
//! Requests go through an explicit state machine instead of ad hoc flags:
//!
//! ```text
//! Idle --execute--> Scheduled --loop picks up--> Running
//! Running --execute--> RunningWithPending (reasons merged, never queued twice)
//! RunningWithPending --run finishes--> Scheduled (picked up immediately)
//! Running --run finishes--> Idle
//! ```
//!
//! `Scheduled` refines the Idle->Running edge for a cooperative runtime: the
//! request is accepted but the loop has not resumed yet. At most one producer
//! execution is ever in flight per session.
//!
//! # Completion
//!
//! A session whose dependency set is empty while no execution is running or
//! scheduled completes its output stream: nothing can trigger another value.
//! A pending request postpones completion until it resolves. Completion is
//! distinct from cancellation - a cancelled execution publishes nothing.

use std::cell::{Cell, OnceCell, RefCell};
use std::rc::Rc;

use futures_channel::mpsc;
use futures_util::future::LocalBoxFuture;
use futures_util::stream::StreamExt;
use futures_util::{FutureExt, SinkExt, select};
use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::context::FeedState;
use crate::dependency::{Dependency, UpdatePolicy, Upstreams};
use crate::feed::SessionStream;
use crate::runtime::{NamedChannel, Spawner, TaskLoop};
use crate::scope::{CancelRegistration, CancelScope, CancelToken};
use crate::shared::{SessionClosed, SharedKey, SharedScope};
use crate::snapshot::{Fault, Snapshot, SnapshotUpdate};

// --- ExecuteReason ---

/// Why a producer run was requested.
///
/// The variants are ordered by specificity; coalescing two requests keeps the
/// most specific one (`Refresh` > `DependencyChanged` > `Initial`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ExecuteReason {
    /// First run after the session was opened.
    Initial,
    /// An upstream dependency published a new snapshot.
    DependencyChanged,
    /// An external refresh was requested.
    Refresh,
}

impl ExecuteReason {
    /// Deterministic coalescing rule: most specific reason wins.
    pub fn merge(self, other: ExecuteReason) -> ExecuteReason {
        self.max(other)
    }
}

// --- RunState ---

/// Observable execution state of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    Idle,
    /// A request was accepted; the session loop has not picked it up yet.
    Scheduled(ExecuteReason),
    Running,
    /// A request arrived while a run was in flight; it starts right after.
    RunningWithPending(ExecuteReason),
}

// --- Session ---

pub(crate) struct SessionCore {
    spawner: Spawner,
    scope: CancelScope,
    /// Registration on the parent token; detached first thing on disposal.
    parent_registration: RefCell<Option<CancelRegistration>>,
    disposed: Cell<bool>,
    run_state: Cell<RunState>,
    /// Impulse to the session loop; bounded(1), a pending impulse covers all.
    wake: NamedChannel<()>,
    dependencies: RefCell<SmallVec<[Dependency; 2]>>,
    /// Feed-dependency store, created on first use - most sessions have none.
    upstreams: OnceCell<Rc<Upstreams>>,
    shared: SharedScope,
    update_policy: UpdatePolicy,
}

/// Cheap clonable handle to one execution session.
#[derive(Clone)]
pub struct Session {
    core: Rc<SessionCore>,
}

impl Session {
    fn new(
        spawner: Spawner,
        parent: &CancelToken,
        update_policy: UpdatePolicy,
        wake: NamedChannel<()>,
    ) -> Self {
        let session = Self {
            core: Rc::new(SessionCore {
                spawner,
                scope: CancelScope::child_of(parent),
                parent_registration: RefCell::new(None),
                disposed: Cell::new(false),
                run_state: Cell::new(RunState::Idle),
                wake,
                dependencies: RefCell::new(SmallVec::new()),
                upstreams: OnceCell::new(),
                shared: SharedScope::new(),
                update_policy,
            }),
        };
        // Parent cancellation tears the whole session down, not only its
        // token. The registration is detached on disposal so a disposed
        // session no longer reacts to the parent.
        let registration = parent.on_cancel({
            let weak = Rc::downgrade(&session.core);
            move || {
                if let Some(core) = weak.upgrade() {
                    Session { core }.dispose();
                }
            }
        });
        *session.core.parent_registration.borrow_mut() = Some(registration);
        session
    }

    /// Token cancelled when this session ends (or its parent cancels).
    pub fn token(&self) -> CancelToken {
        self.core.scope.token()
    }

    pub fn is_disposed(&self) -> bool {
        self.core.disposed.get()
    }

    /// Current request state, mostly useful for diagnostics and tests.
    pub fn run_state(&self) -> RunState {
        self.core.run_state.get()
    }

    pub(crate) fn spawner(&self) -> &Spawner {
        &self.core.spawner
    }

    /// Request a producer run. Ignored on a disposed session. A request
    /// arriving while a run is in flight is coalesced with any pending one,
    /// never queued twice and never run concurrently.
    pub fn execute(&self, reason: ExecuteReason) {
        if self.is_disposed() {
            return;
        }
        let next = match self.core.run_state.get() {
            RunState::Idle => {
                self.core.wake.send_or_drop(());
                RunState::Scheduled(reason)
            }
            RunState::Scheduled(pending) => RunState::Scheduled(pending.merge(reason)),
            RunState::Running => RunState::RunningWithPending(reason),
            RunState::RunningWithPending(pending) => {
                RunState::RunningWithPending(pending.merge(reason))
            }
        };
        self.core.run_state.set(next);
    }

    /// Add `dependency` to the live set. No-op when disposed.
    pub fn register_dependency(&self, dependency: Dependency) {
        if self.is_disposed() {
            return;
        }
        self.core.dependencies.borrow_mut().push(dependency);
    }

    /// Remove `dependency` from the live set. Removing the last one nudges
    /// the loop, which completes the session unless a new dependency or an
    /// execution request showed up in the meantime. No-op when disposed.
    pub fn unregister_dependency(&self, dependency: Dependency) {
        if self.is_disposed() {
            return;
        }
        let became_empty = {
            let mut dependencies = self.core.dependencies.borrow_mut();
            match dependencies.iter().position(|d| *d == dependency) {
                Some(index) => {
                    dependencies.remove(index);
                    dependencies.is_empty()
                }
                None => false,
            }
        };
        if became_empty {
            self.core.wake.send_or_drop(());
        }
    }

    pub fn dependency_count(&self) -> usize {
        self.core.dependencies.borrow().len()
    }

    /// Get or create an instance shared across all executions of this
    /// session. Fails once the session is disposed.
    pub fn shared<V: 'static>(
        &self,
        key: SharedKey,
        factory: impl FnOnce() -> V,
    ) -> Result<Rc<V>, SessionClosed> {
        if self.is_disposed() {
            return Err(SessionClosed);
        }
        self.core.shared.get_or_create(key, factory)
    }

    /// Overwrite a shared instance. Fails once the session is disposed.
    pub fn set_shared<V: 'static>(
        &self,
        key: SharedKey,
        value: V,
    ) -> Result<Rc<V>, SessionClosed> {
        if self.is_disposed() {
            return Err(SessionClosed);
        }
        self.core.shared.set(key, value)
    }

    /// Read the latest snapshot of an upstream feed state, registering it as
    /// a dependency of this session on first access. Returns `None` until the
    /// upstream has produced something (a dependency update re-runs us then).
    pub fn watch<U: Clone + 'static>(&self, state: &Rc<FeedState<U>>) -> Option<Snapshot<U>> {
        if self.is_disposed() {
            return None;
        }
        let upstreams = self.core.upstreams.get_or_init(Upstreams::new);
        upstreams.watch(self, state)
    }

    /// Called by the upstream store when a parent feed published a snapshot.
    /// Whether that warrants a re-run is this session's policy, not the
    /// store's.
    pub(crate) fn on_parent_updated(&self, changed: bool) {
        match self.core.update_policy {
            UpdatePolicy::Always => self.execute(ExecuteReason::DependencyChanged),
            UpdatePolicy::WhenChanged => {
                if changed {
                    self.execute(ExecuteReason::DependencyChanged);
                }
            }
        }
    }

    /// Tear the session down. Idempotent; concurrent and repeated calls
    /// collapse to one effect. Never panics past disposal.
    pub fn dispose(&self) {
        if self.core.disposed.replace(true) {
            return;
        }
        debug!("session disposed");
        if let Some(registration) = self.core.parent_registration.borrow_mut().take() {
            registration.detach();
        }
        self.core.scope.cancel();
        self.core.dependencies.borrow_mut().clear();
        if let Some(upstreams) = self.core.upstreams.get() {
            upstreams.dispose();
        }
        self.core.shared.dispose();
    }

    // Loop-side transitions. These run on the session loop only, between
    // awaits, so each read-modify-write is uninterruptible.

    fn begin_execution(&self) -> Option<ExecuteReason> {
        match self.core.run_state.get() {
            RunState::Scheduled(reason) => {
                self.core.run_state.set(RunState::Running);
                Some(reason)
            }
            _ => None,
        }
    }

    fn finish_execution(&self) {
        match self.core.run_state.get() {
            RunState::RunningWithPending(pending) => {
                self.core.run_state.set(RunState::Scheduled(pending));
            }
            RunState::Running => self.core.run_state.set(RunState::Idle),
            // Disposal raced the run; leave the state alone.
            _ => {}
        }
    }

    fn should_complete(&self) -> bool {
        !self.is_disposed()
            && self.core.run_state.get() == RunState::Idle
            && self.core.dependencies.borrow().is_empty()
    }
}

// --- Execution ---

/// Producer-facing view of one execution.
#[derive(Clone)]
pub struct Execution<T> {
    session: Session,
    reason: ExecuteReason,
    publisher: Publisher<T>,
}

impl<T: Clone + 'static> Execution<T> {
    pub fn reason(&self) -> ExecuteReason {
        self.reason
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn token(&self) -> CancelToken {
        self.session.token()
    }

    /// Publish an intermediate snapshot update. Returns `false` when the
    /// subscriber is gone and the producer should stop.
    pub async fn publish(&self, update: SnapshotUpdate<T>) -> bool {
        self.publisher.publish(update).await
    }
}

#[derive(Clone)]
struct Publisher<T> {
    current: Rc<RefCell<Snapshot<T>>>,
    out: mpsc::Sender<Snapshot<T>>,
}

impl<T: Clone> Publisher<T> {
    async fn publish(&self, update: SnapshotUpdate<T>) -> bool {
        let next = self.current.borrow().apply(update);
        *self.current.borrow_mut() = next.clone();
        self.out.clone().send(next).await.is_ok()
    }
}

/// One producer run: receives the execution handle, returns the final update
/// (or `None` when everything was already published through the handle).
pub type ProduceFn<T> =
    Rc<dyn Fn(Execution<T>) -> LocalBoxFuture<'static, Result<Option<SnapshotUpdate<T>>, Fault>>>;

// --- session loop ---

const OUTPUT_CAPACITY: usize = 8;

/// Open a session: spawns its loop, issues the initial execution request and
/// returns the output stream (which owns the loop and disposes the session
/// when dropped).
pub(crate) fn spawn_session<T: Clone + 'static>(
    spawner: &Spawner,
    parent: &CancelToken,
    update_policy: UpdatePolicy,
    init: impl FnOnce(&Session) -> Vec<TaskLoop>,
    producer: ProduceFn<T>,
) -> SessionStream<T> {
    let (wake_tx, wake_rx) = NamedChannel::new("session.wake", 1);
    let session = Session::new(spawner.clone(), parent, update_policy, wake_tx);
    let (out_tx, out_rx) = mpsc::channel(OUTPUT_CAPACITY);
    let publisher = Publisher {
        current: Rc::new(RefCell::new(Snapshot::initial())),
        out: out_tx,
    };

    let extra_loops = init(&session);
    session.execute(ExecuteReason::Initial);

    let task = TaskLoop::new(spawner, {
        let session = session.clone();
        async move {
            let token = session.token();
            let mut wake_rx = wake_rx.fuse();
            trace!("session loop started");
            'session: loop {
                {
                    let mut cancelled = token.cancelled().fuse();
                    select! {
                        _ = cancelled => break 'session,
                        wake = wake_rx.next() => {
                            if wake.is_none() {
                                break 'session;
                            }
                        }
                    }
                }

                while let Some(reason) = session.begin_execution() {
                    trace!(?reason, "execution started");
                    if !publisher.publish(SnapshotUpdate::progress(true)).await {
                        session.dispose();
                        break 'session;
                    }

                    let execution = Execution {
                        session: session.clone(),
                        reason,
                        publisher: publisher.clone(),
                    };
                    let outcome = {
                        let mut produce = producer(execution).fuse();
                        let mut cancelled = token.cancelled().fuse();
                        select! {
                            result = produce => Some(result),
                            _ = cancelled => None,
                        }
                    };

                    let delivered = match outcome {
                        // Cancelled: no snapshot for this round.
                        None => break 'session,
                        Some(Ok(Some(update))) => publisher.publish(update).await,
                        // Producer already published through the handle.
                        Some(Ok(None)) => true,
                        Some(Err(fault)) => {
                            publisher.publish(SnapshotUpdate::fault(fault)).await
                        }
                    };
                    if !delivered {
                        session.dispose();
                        break 'session;
                    }
                    session.finish_execution();
                }

                if session.should_complete() {
                    trace!("session completed");
                    break 'session;
                }
            }
            // Completed or torn down either way; disposal is idempotent and
            // closing the output ends the subscriber stream.
            session.dispose();
            trace!("session loop ended");
        }
    });

    SessionStream::new(out_rx, session, task, extra_loops)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_executor::LocalPool;
    use std::cell::Cell;
    use std::rc::Rc;

    fn pool_and_spawner() -> (LocalPool, Spawner) {
        let pool = LocalPool::new();
        let spawner: Spawner = Rc::new(pool.spawner());
        (pool, spawner)
    }

    fn collect<T: Clone + 'static>(
        spawner: &Spawner,
        mut stream: SessionStream<T>,
    ) -> (Rc<RefCell<Vec<Snapshot<T>>>>, Rc<Cell<bool>>, TaskLoop) {
        let snapshots = Rc::new(RefCell::new(Vec::new()));
        let ended = Rc::new(Cell::new(false));
        let task = TaskLoop::new(spawner, {
            let snapshots = snapshots.clone();
            let ended = ended.clone();
            async move {
                while let Some(snapshot) = stream.next().await {
                    snapshots.borrow_mut().push(snapshot);
                }
                ended.set(true);
            }
        });
        (snapshots, ended, task)
    }

    fn value_producer(values: Rc<Cell<u32>>) -> ProduceFn<u32> {
        Rc::new(move |_execution: Execution<u32>| {
            let values = values.clone();
            async move {
                let value = values.get();
                values.set(value + 1);
                Ok(Some(SnapshotUpdate::value(value)))
            }
            .boxed_local()
        })
    }

    #[test]
    fn test_initial_execution_publishes_progress_then_value() {
        let (mut pool, spawner) = pool_and_spawner();
        let parent = CancelScope::new();
        let stream = spawn_session(
            &spawner,
            &parent.token(),
            UpdatePolicy::Always,
            |_| Vec::new(),
            value_producer(Rc::new(Cell::new(7))),
        );
        let (snapshots, ended, _task) = collect(&spawner, stream);

        pool.run_until_stalled();

        let snapshots = snapshots.borrow();
        assert_eq!(snapshots.len(), 2);
        assert!(snapshots[0].is_in_progress());
        assert!(snapshots[0].value().is_none());
        assert_eq!(snapshots[1].value(), Some(&7));
        assert!(!snapshots[1].is_in_progress());
        // No dependencies, nothing pending: the stream completes.
        assert!(ended.get());
    }

    #[test]
    fn test_executions_never_overlap() {
        let (mut pool, spawner) = pool_and_spawner();
        let parent = CancelScope::new();
        let concurrent = Rc::new(Cell::new(0u32));
        let max_concurrent = Rc::new(Cell::new(0u32));
        let runs = Rc::new(Cell::new(0u32));
        // Each execution parks on the gate, so requests pile up mid-run.
        let (gate_tx, gate_rx) = mpsc::channel::<()>(16);
        let gate_rx = Rc::new(RefCell::new(gate_rx));

        let producer: ProduceFn<u32> = Rc::new({
            let concurrent = concurrent.clone();
            let max_concurrent = max_concurrent.clone();
            let runs = runs.clone();
            let gate_rx = gate_rx.clone();
            move |_execution| {
                let concurrent = concurrent.clone();
                let max_concurrent = max_concurrent.clone();
                let runs = runs.clone();
                let gate_rx = gate_rx.clone();
                async move {
                    concurrent.set(concurrent.get() + 1);
                    max_concurrent.set(max_concurrent.get().max(concurrent.get()));
                    gate_rx.borrow_mut().next().await;
                    concurrent.set(concurrent.get() - 1);
                    runs.set(runs.get() + 1);
                    Ok(Some(SnapshotUpdate::value(runs.get())))
                }
                .boxed_local()
            }
        });

        let stream = spawn_session(
            &spawner,
            &parent.token(),
            UpdatePolicy::Always,
            |session: &Session| {
                // A dependency keeps the session alive across executions.
                session.register_dependency(Dependency::new());
                Vec::new()
            },
            producer,
        );
        let session = stream.session().clone();
        let (_snapshots, _ended, _task) = collect(&spawner, stream);

        let mut gate_tx = gate_tx;
        for _ in 0..5 {
            session.execute(ExecuteReason::Refresh);
            session.execute(ExecuteReason::DependencyChanged);
            gate_tx.try_send(()).unwrap();
            pool.run_until_stalled();
        }
        gate_tx.try_send(()).unwrap();
        pool.run_until_stalled();

        assert_eq!(max_concurrent.get(), 1);
        assert!(runs.get() >= 2);
    }

    #[test]
    fn test_requests_while_running_coalesce_to_one_followup() {
        let (mut pool, spawner) = pool_and_spawner();
        let parent = CancelScope::new();
        let reasons = Rc::new(RefCell::new(Vec::new()));
        let (gate_tx, gate_rx) = mpsc::channel::<()>(16);
        let gate_rx = Rc::new(RefCell::new(gate_rx));

        let producer: ProduceFn<u32> = Rc::new({
            let reasons = reasons.clone();
            let gate_rx = gate_rx.clone();
            move |execution: Execution<u32>| {
                let reasons = reasons.clone();
                let gate_rx = gate_rx.clone();
                async move {
                    reasons.borrow_mut().push(execution.reason());
                    gate_rx.borrow_mut().next().await;
                    Ok(Some(SnapshotUpdate::value(0)))
                }
                .boxed_local()
            }
        });

        let stream = spawn_session(
            &spawner,
            &parent.token(),
            UpdatePolicy::Always,
            |session: &Session| {
                session.register_dependency(Dependency::new());
                Vec::new()
            },
            producer,
        );
        let session = stream.session().clone();
        let (_snapshots, _ended, _task) = collect(&spawner, stream);

        // Let the initial run start and park on the gate, then pile requests
        // onto it.
        pool.run_until_stalled();
        assert_eq!(session.run_state(), RunState::Running);
        session.execute(ExecuteReason::DependencyChanged);
        session.execute(ExecuteReason::Refresh);
        session.execute(ExecuteReason::DependencyChanged);
        assert_eq!(
            session.run_state(),
            RunState::RunningWithPending(ExecuteReason::Refresh)
        );

        let mut gate_tx = gate_tx;
        gate_tx.try_send(()).unwrap();
        pool.run_until_stalled();
        gate_tx.try_send(()).unwrap();
        pool.run_until_stalled();

        assert_eq!(
            &*reasons.borrow(),
            &[ExecuteReason::Initial, ExecuteReason::Refresh]
        );
        assert_eq!(session.run_state(), RunState::Idle);
    }

    #[test]
    fn test_dispose_is_idempotent() {
        let (mut pool, spawner) = pool_and_spawner();
        let parent = CancelScope::new();
        let stream = spawn_session(
            &spawner,
            &parent.token(),
            UpdatePolicy::Always,
            |_| Vec::new(),
            value_producer(Rc::new(Cell::new(0))),
        );
        let session = stream.session().clone();
        let (_snapshots, _ended, _task) = collect(&spawner, stream);
        pool.run_until_stalled();

        session.dispose();
        session.dispose();
        assert!(session.is_disposed());

        // Disposed sessions ignore everything silently.
        session.execute(ExecuteReason::Refresh);
        session.register_dependency(Dependency::new());
        assert_eq!(session.dependency_count(), 0);
        assert_eq!(
            session.shared(SharedKey::of::<u32>("k"), || 1u32),
            Err(SessionClosed)
        );
    }

    #[test]
    fn test_last_dependency_removal_completes_session() {
        let (mut pool, spawner) = pool_and_spawner();
        let parent = CancelScope::new();
        let dependency = Dependency::new();
        let stream = spawn_session(
            &spawner,
            &parent.token(),
            UpdatePolicy::Always,
            {
                let dependency = dependency;
                move |session: &Session| {
                    session.register_dependency(dependency);
                    Vec::new()
                }
            },
            value_producer(Rc::new(Cell::new(0))),
        );
        let session = stream.session().clone();
        let (_snapshots, ended, _task) = collect(&spawner, stream);

        pool.run_until_stalled();
        assert!(!ended.get());

        session.unregister_dependency(dependency);
        pool.run_until_stalled();
        assert!(ended.get());

        // Registration after completion does not revive the session.
        session.register_dependency(Dependency::new());
        assert_eq!(session.dependency_count(), 0);
        assert!(session.is_disposed());
    }

    #[test]
    fn test_reregistration_before_nudge_keeps_session_alive() {
        let (mut pool, spawner) = pool_and_spawner();
        let parent = CancelScope::new();
        let dependency = Dependency::new();
        let stream = spawn_session(
            &spawner,
            &parent.token(),
            UpdatePolicy::Always,
            {
                let dependency = dependency;
                move |session: &Session| {
                    session.register_dependency(dependency);
                    Vec::new()
                }
            },
            value_producer(Rc::new(Cell::new(0))),
        );
        let session = stream.session().clone();
        let (_snapshots, ended, _task) = collect(&spawner, stream);
        pool.run_until_stalled();

        // Remove and re-register before the loop observes the empty set.
        session.unregister_dependency(dependency);
        session.register_dependency(Dependency::new());
        pool.run_until_stalled();

        assert!(!ended.get());
        assert!(!session.is_disposed());
    }

    #[test]
    fn test_parent_cancellation_disposes_session() {
        let (mut pool, spawner) = pool_and_spawner();
        let parent = CancelScope::new();
        let stream = spawn_session(
            &spawner,
            &parent.token(),
            UpdatePolicy::Always,
            |session: &Session| {
                session.register_dependency(Dependency::new());
                Vec::new()
            },
            value_producer(Rc::new(Cell::new(0))),
        );
        let session = stream.session().clone();
        let session_token = session.token();
        let (_snapshots, ended, _task) = collect(&spawner, stream);
        pool.run_until_stalled();

        // The parent's other listeners still fire, and the parent itself is
        // only cancelled because we cancel it - not by the session.
        let other_fired = Rc::new(Cell::new(false));
        let other_clone = other_fired.clone();
        let _other = parent.token().on_cancel(move || other_clone.set(true));

        parent.cancel();
        pool.run_until_stalled();

        assert!(session.is_disposed());
        assert!(session_token.is_cancelled());
        assert!(other_fired.get());
        assert!(ended.get());
    }

    #[test]
    fn test_session_disposal_does_not_cancel_parent() {
        let (mut pool, spawner) = pool_and_spawner();
        let parent = CancelScope::new();
        let stream = spawn_session(
            &spawner,
            &parent.token(),
            UpdatePolicy::Always,
            |_| Vec::new(),
            value_producer(Rc::new(Cell::new(0))),
        );
        let session = stream.session().clone();
        let (_snapshots, _ended, _task) = collect(&spawner, stream);
        session.dispose();
        pool.run_until_stalled();

        assert!(!parent.is_cancelled());
    }

    #[test]
    fn test_fault_keeps_session_usable() {
        let (mut pool, spawner) = pool_and_spawner();
        let parent = CancelScope::new();
        let attempts = Rc::new(Cell::new(0u32));

        let producer: ProduceFn<u32> = Rc::new({
            let attempts = attempts.clone();
            move |_execution| {
                let attempts = attempts.clone();
                async move {
                    let attempt = attempts.get();
                    attempts.set(attempt + 1);
                    if attempt == 0 {
                        Err(Fault::message("first load failed"))
                    } else {
                        Ok(Some(SnapshotUpdate::value(attempt)))
                    }
                }
                .boxed_local()
            }
        });

        let stream = spawn_session(
            &spawner,
            &parent.token(),
            UpdatePolicy::Always,
            |session: &Session| {
                session.register_dependency(Dependency::new());
                Vec::new()
            },
            producer,
        );
        let session = stream.session().clone();
        let (snapshots, _ended, _task) = collect(&spawner, stream);
        pool.run_until_stalled();

        {
            let snapshots = snapshots.borrow();
            let faulted = snapshots.last().unwrap();
            assert!(faulted.fault().is_some());
            assert!(faulted.value().is_none());
        }

        session.execute(ExecuteReason::Refresh);
        pool.run_until_stalled();

        let snapshots = snapshots.borrow();
        let recovered = snapshots.last().unwrap();
        assert!(recovered.fault().is_none());
        assert_eq!(recovered.value(), Some(&1));
    }

    #[test]
    fn test_cancelled_execution_publishes_nothing() {
        let (mut pool, spawner) = pool_and_spawner();
        let parent = CancelScope::new();

        // Producer that never resolves; only cancellation can end it.
        let producer: ProduceFn<u32> = Rc::new(|_execution| {
            async move {
                std::future::pending::<()>().await;
                Ok(None)
            }
            .boxed_local()
        });

        let stream = spawn_session(
            &spawner,
            &parent.token(),
            UpdatePolicy::Always,
            |_| Vec::new(),
            producer,
        );
        let session = stream.session().clone();
        let (snapshots, ended, _task) = collect(&spawner, stream);
        pool.run_until_stalled();

        assert_eq!(snapshots.borrow().len(), 1); // only the progress snapshot
        session.dispose();
        pool.run_until_stalled();

        assert!(ended.get());
        assert_eq!(snapshots.borrow().len(), 1);
    }

    #[test]
    fn test_shared_factory_runs_once_across_concurrent_branches() {
        let (mut pool, spawner) = pool_and_spawner();
        let parent = CancelScope::new();
        let factory_calls = Rc::new(Cell::new(0u32));

        let producer: ProduceFn<u32> = Rc::new({
            let factory_calls = factory_calls.clone();
            move |execution: Execution<u32>| {
                let factory_calls = factory_calls.clone();
                async move {
                    let session = execution.session().clone();
                    let mut branches = Vec::new();
                    for _ in 0..4 {
                        let session = session.clone();
                        let factory_calls = factory_calls.clone();
                        branches.push(async move {
                            session
                                .shared(SharedKey::of::<String>("resource"), || {
                                    factory_calls.set(factory_calls.get() + 1);
                                    String::from("shared")
                                })
                                .unwrap()
                        });
                    }
                    let instances = futures_util::future::join_all(branches).await;
                    let all_same = instances
                        .windows(2)
                        .all(|pair| Rc::ptr_eq(&pair[0], &pair[1]));
                    assert!(all_same);
                    Ok(Some(SnapshotUpdate::value(instances.len() as u32)))
                }
                .boxed_local()
            }
        });

        let stream = spawn_session(
            &spawner,
            &parent.token(),
            UpdatePolicy::Always,
            |_| Vec::new(),
            producer,
        );
        let (snapshots, _ended, _task) = collect(&spawner, stream);
        pool.run_until_stalled();

        assert_eq!(factory_calls.get(), 1);
        assert_eq!(snapshots.borrow().last().unwrap().value(), Some(&4));
    }

    #[test]
    fn test_when_changed_policy_filters_stale_notifications() {
        let (mut pool, spawner) = pool_and_spawner();
        let parent = CancelScope::new();
        let stream = spawn_session(
            &spawner,
            &parent.token(),
            UpdatePolicy::WhenChanged,
            |session: &Session| {
                session.register_dependency(Dependency::new());
                Vec::new()
            },
            value_producer(Rc::new(Cell::new(0))),
        );
        let session = stream.session().clone();
        let (_snapshots, _ended, _task) = collect(&spawner, stream);
        pool.run_until_stalled();
        assert_eq!(session.run_state(), RunState::Idle);

        // An upstream notification for a snapshot this session already
        // consumed does not schedule a run; a fresh one does.
        session.on_parent_updated(false);
        assert_eq!(session.run_state(), RunState::Idle);
        session.on_parent_updated(true);
        assert_eq!(
            session.run_state(),
            RunState::Scheduled(ExecuteReason::DependencyChanged)
        );
    }

    #[test]
    fn test_reason_merge_keeps_most_specific() {
        use ExecuteReason::*;
        assert_eq!(Initial.merge(DependencyChanged), DependencyChanged);
        assert_eq!(DependencyChanged.merge(Refresh), Refresh);
        assert_eq!(Refresh.merge(Initial), Refresh);
        assert_eq!(Initial.merge(Initial), Initial);
    }
}
