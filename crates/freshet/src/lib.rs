//! freshet - a reactive feed engine.
//!
//! A *feed* describes how to produce an asynchronous sequence of immutable
//! value snapshots. Opening a feed within a [`FeedContext`] creates a
//! [`Session`] that serializes producer executions, tracks the dependencies
//! that keep it alive, re-runs the producer when one of them changes and
//! delivers the resulting [`Snapshot`]s in order. On top of the session
//! engine, [`PaginatedFeed`] turns a page-at-a-time loader into one
//! continuously growing list feed.
//!
//! The engine owns no threads: everything runs on a caller-supplied
//! `LocalSpawn` executor, and all cancellation is cooperative.

pub mod context;
pub mod dependency;
pub mod feed;
pub mod paginated;
pub mod runtime;
pub mod scope;
pub mod session;
pub mod shared;
pub mod snapshot;

pub use context::{FeedContext, FeedState};
pub use dependency::{Dependency, UpdatePolicy};
pub use feed::{
    AsyncFeed, Cancellable, ComputedFeed, CustomFeed, Feed, FeedId, SessionStream, SnapshotStream,
    Trigger,
};
pub use paginated::{Page, PageInfo, PaginatedFeed};
pub use runtime::{ChannelError, NamedChannel, Spawner, TaskLoop};
pub use scope::{CancelRegistration, CancelScope, CancelToken, Cancelled, ScopeGuard};
pub use session::{ExecuteReason, Execution, RunState, Session};
pub use shared::{SessionClosed, SharedKey, SharedScope};
pub use snapshot::{Fault, Snapshot, SnapshotUpdate};
