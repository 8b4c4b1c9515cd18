//! Task and channel plumbing.
//!
//! The engine never owns a thread pool: every loop is spawned on the
//! caller-supplied [`LocalSpawn`] executor and suspends only while awaiting
//! its own channels or producer I/O.

use std::fmt;
use std::future::Future;
use std::rc::Rc;

use futures_channel::mpsc;
use futures_util::SinkExt;
use futures_util::future::RemoteHandle;
use futures_util::task::{LocalSpawn, LocalSpawnExt};
use tracing::{error, warn};

/// Shared handle to the executor driving this engine instance.
pub type Spawner = Rc<dyn LocalSpawn>;

// --- TaskLoop ---

/// Encapsulates a detached async loop.
///
/// Keeps task spawning in ONE place rather than scattered throughout the
/// codebase: if something holds a `TaskLoop`, it owns a running loop, and
/// dropping the `TaskLoop` cancels it at the next suspension point.
pub struct TaskLoop {
    _handle: Option<RemoteHandle<()>>,
}

impl TaskLoop {
    /// Spawn the loop. The future should contain the loop body (typically a
    /// `select!` over channels).
    pub fn new(spawner: &Spawner, future: impl Future<Output = ()> + 'static) -> Self {
        match spawner.spawn_local_with_handle(future) {
            Ok(handle) => Self {
                _handle: Some(handle),
            },
            Err(spawn_error) => {
                error!("failed to spawn task loop: {spawn_error}");
                Self { _handle: None }
            }
        }
    }
}

// --- NamedChannel ---

/// Error returned by [`NamedChannel::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelError {
    /// Channel is closed (receiver dropped).
    Closed,
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelError::Closed => write!(f, "channel closed"),
        }
    }
}

/// Wrapper around `mpsc::Sender` with a name for observability.
///
/// All intra-engine communication goes through this wrapper so a stuck or
/// dropping channel can be identified in logs.
pub struct NamedChannel<T> {
    inner: mpsc::Sender<T>,
    name: &'static str,
    capacity: usize,
}

impl<T> Clone for NamedChannel<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            name: self.name,
            capacity: self.capacity,
        }
    }
}

impl<T> NamedChannel<T> {
    /// Create a named bounded channel.
    pub fn new(name: &'static str, capacity: usize) -> (Self, mpsc::Receiver<T>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                inner: tx,
                name,
                capacity,
            },
            rx,
        )
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Async send: waits for capacity, fails only when the receiver is gone.
    pub async fn send(&self, value: T) -> Result<(), ChannelError> {
        self.inner
            .clone()
            .send(value)
            .await
            .map_err(|_| ChannelError::Closed)
    }

    /// Fire-and-forget send. Dropping is acceptable for impulse-style
    /// messages (a pending impulse already covers the new one); every drop is
    /// logged for observability.
    pub fn send_or_drop(&self, value: T) {
        if let Err(send_error) = self.inner.clone().try_send(value) {
            if send_error.is_disconnected() {
                warn!(
                    channel = self.name,
                    "send_or_drop on disconnected channel (capacity {})", self.capacity
                );
            }
        }
    }

    /// Try send with an explicit result, for sync call sites that must know.
    pub fn try_send(&self, value: T) -> Result<(), mpsc::TrySendError<T>> {
        self.inner.clone().try_send(value)
    }

    /// True once the receiver has been dropped.
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}
