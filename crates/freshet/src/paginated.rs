//! Cursor-based pagination on top of the session engine.
//!
//! A [`PaginatedFeed`] turns a page-at-a-time loader into one continuously
//! growing list feed. Every page request is one session execution, the
//! accumulated list lives in the session's shared-instance cache, and pages
//! are appended strictly in the order their cursors were issued: a page that
//! arrives ahead of its predecessor is staged, never spliced in early.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use futures_util::FutureExt;
use futures_util::future::LocalBoxFuture;
use tracing::trace;

use crate::context::FeedContext;
use crate::dependency::UpdatePolicy;
use crate::feed::{Feed, FeedId, SessionStream, Trigger, attach_trigger};
use crate::scope::CancelToken;
use crate::session::{Execution, ExecuteReason, ProduceFn, Session, spawn_session};
use crate::shared::SharedKey;
use crate::snapshot::{Fault, SnapshotUpdate};

const DEFAULT_PAGE_SIZE: u32 = 20;

// --- Page / PageInfo ---

/// One loaded page: its items plus the cursor of the next page, or `None`
/// when there are no more pages.
#[derive(Clone, Debug)]
pub struct Page<C, T> {
    items: Vec<T>,
    next: Option<C>,
}

impl<C, T> Page<C, T> {
    pub fn new(items: Vec<T>, next: Option<C>) -> Self {
        Self { items, next }
    }

    /// The terminal page: nothing more to load.
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            next: None,
        }
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn next_cursor(&self) -> Option<&C> {
        self.next.as_ref()
    }
}

/// Addressing info handed to index-based loaders.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageInfo {
    pub page_index: u32,
    pub desired_page_size: u32,
}

// --- accumulation ---

/// Ordered accumulation of loaded pages.
///
/// Pages are keyed by the sequence number their cursor was issued under;
/// `staged` holds pages whose predecessors have not been applied yet, so
/// repeated or out-of-order loads can never interleave items.
struct PageAccum<C, T> {
    items: Vec<T>,
    staged: BTreeMap<u64, Vec<T>>,
    /// Sequence number of the next page to apply.
    apply_seq: u64,
    /// Sequence number the next load will be issued under.
    load_seq: u64,
    /// Cursor for the next load; `None` once the terminal page was seen.
    cursor: Option<C>,
    started: bool,
}

impl<C: Clone, T: Clone> PageAccum<C, T> {
    fn new(first: C) -> Self {
        Self {
            items: Vec::new(),
            staged: BTreeMap::new(),
            apply_seq: 0,
            load_seq: 0,
            cursor: Some(first),
            started: false,
        }
    }

    fn reset(&mut self, first: C) {
        *self = Self::new(first);
    }

    fn is_terminal(&self) -> bool {
        self.started && self.cursor.is_none()
    }

    /// Stage a loaded page and fold every contiguous staged page into the
    /// accumulated list. A sequence already applied is ignored (a repeated
    /// request), a gap keeps later pages staged.
    fn accept(&mut self, seq: u64, items: Vec<T>) {
        if seq < self.apply_seq {
            return;
        }
        self.staged.entry(seq).or_insert(items);
        while let Some(items) = self.staged.remove(&self.apply_seq) {
            self.items.extend(items);
            self.apply_seq += 1;
        }
    }
}

// --- PaginatedFeed ---

type CursorLoadFn<C, T> =
    Rc<dyn Fn(C, u32, CancelToken) -> LocalBoxFuture<'static, Result<Page<C, T>, Fault>>>;

/// A list feed fed by a cursor-based page loader.
///
/// `more()` pulses request the next page; `refresh()` pulses discard the
/// accumulation and restart from the first cursor, published as one atomic
/// snapshot. A failed page load keeps both the accumulated list and the
/// cursor, so the next request retries from the last successful position.
pub struct PaginatedFeed<C, T> {
    id: FeedId,
    first: C,
    desired_page_size: u32,
    load: CursorLoadFn<C, T>,
    more: Trigger,
    refresh: Trigger,
}

impl<C: Clone + 'static, T: Clone + 'static> PaginatedFeed<C, T> {
    /// Cursor mode: `first` addresses the first page, the loader returns each
    /// page together with the cursor of the next one. An empty page is
    /// terminal.
    pub fn by_cursor(
        first: C,
        load: impl Fn(C, u32, CancelToken) -> LocalBoxFuture<'static, Result<Page<C, T>, Fault>>
        + 'static,
    ) -> Self {
        Self {
            id: FeedId::new(),
            first,
            desired_page_size: DEFAULT_PAGE_SIZE,
            load: Rc::new(load),
            more: Trigger::new(),
            refresh: Trigger::new(),
        }
    }

    pub fn with_page_size(mut self, desired_page_size: u32) -> Self {
        self.desired_page_size = desired_page_size;
        self
    }

    /// Trigger requesting the next page on every open session.
    pub fn more(&self) -> Trigger {
        self.more.clone()
    }

    /// Trigger restarting the accumulation from the first cursor.
    pub fn refresh(&self) -> Trigger {
        self.refresh.clone()
    }

    pub fn request_more(&self) {
        self.more.pulse();
    }

    pub fn request_refresh(&self) {
        self.refresh.pulse();
    }

    fn accum_key() -> SharedKey {
        SharedKey::of::<RefCell<PageAccum<C, T>>>("paginated.accum")
    }
}

impl<T: Clone + 'static> PaginatedFeed<u32, T> {
    /// Index mode, built on cursor mode: pages are addressed by a zero-based
    /// index, a full page advances the index by one, an empty page is
    /// terminal and a short page is appended but terminal.
    pub fn by_index(
        load: impl Fn(PageInfo, CancelToken) -> LocalBoxFuture<'static, Result<Vec<T>, Fault>>
        + 'static,
    ) -> Self {
        Self::by_cursor(0, move |page_index, desired_page_size, token| {
            let page = load(
                PageInfo {
                    page_index,
                    desired_page_size,
                },
                token,
            );
            async move {
                let items = page.await?;
                if items.is_empty() {
                    Ok(Page::empty())
                } else if (items.len() as u32) < desired_page_size {
                    Ok(Page::new(items, None))
                } else {
                    Ok(Page::new(items, Some(page_index + 1)))
                }
            }
            .boxed_local()
        })
    }
}

impl<C: Clone + 'static, T: Clone + 'static> Feed<Vec<T>> for PaginatedFeed<C, T> {
    fn id(&self) -> FeedId {
        self.id
    }

    fn open(&self, context: &FeedContext) -> SessionStream<Vec<T>> {
        let first = self.first.clone();
        let load = self.load.clone();
        let desired_page_size = self.desired_page_size;

        let producer: ProduceFn<Vec<T>> = Rc::new(move |execution: Execution<Vec<T>>| {
            let first = first.clone();
            let load = load.clone();
            async move {
                let session = execution.session().clone();
                let Ok(accum) =
                    session.shared(Self::accum_key(), || RefCell::new(PageAccum::new(first.clone())))
                else {
                    return Ok(None);
                };

                if execution.reason() == ExecuteReason::Refresh {
                    trace!("pagination restarted");
                    accum.borrow_mut().reset(first);
                } else if !accum.borrow().started {
                    // Surface the empty list while the first page loads.
                    if !execution.publish(SnapshotUpdate::value(Vec::new())).await {
                        return Ok(None);
                    }
                }

                let (seq, cursor) = {
                    let accum = accum.borrow();
                    match accum.cursor.clone() {
                        Some(cursor) if !accum.is_terminal() => (accum.load_seq, cursor),
                        // No more pages: re-emit the accumulated list as is.
                        _ => return Ok(Some(SnapshotUpdate::value(accum.items.clone()))),
                    }
                };

                let page = load(cursor, desired_page_size, execution.token()).await?;

                let mut accum = accum.borrow_mut();
                accum.started = true;
                if page.items.is_empty() {
                    accum.cursor = None;
                } else {
                    accum.cursor = page.next;
                    accum.accept(seq, page.items);
                    accum.load_seq = seq + 1;
                }
                Ok(Some(SnapshotUpdate::value(accum.items.clone())))
            }
            .boxed_local()
        });

        let more = self.more.clone();
        let refresh = self.refresh.clone();
        spawn_session(
            context.spawner(),
            &context.token(),
            UpdatePolicy::Always,
            move |session: &Session| {
                vec![
                    attach_trigger(session, &more, ExecuteReason::DependencyChanged),
                    attach_trigger(session, &refresh, ExecuteReason::Refresh),
                ]
            },
            producer,
        )
    }
}
