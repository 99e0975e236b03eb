//! In-memory collaborators for tests, demos and the CLI.
//!
//! [`InMemoryDataStore`] is a local cache whose snapshot stream emits on
//! every change. [`InMemoryRemoteSource`] serves pages the test pushes ahead
//! of time and lets the test observe when its load-after subscription
//! starts and when it is cancelled.

use std::sync::{Arc, Mutex};

use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::error::FeedError;
use crate::position::ScrollPositionStore;
use crate::remote::{LoadOutcome, LoadState, LoadStatus, RemoteHooks, RemoteSource};
use crate::source::{LoadFuture, LocalSnapshots, LocalSource, SharedLocalSource, slice_page};

// ── Data store ──────────────────────────────────────────────────────

/// Shared, observable list of items.
pub struct InMemoryDataStore<T> {
    items: Arc<watch::Sender<Arc<Vec<T>>>>,
}

impl<T> Clone for InMemoryDataStore<T> {
    fn clone(&self) -> Self {
        Self {
            items: Arc::clone(&self.items),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Default for InMemoryDataStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync + 'static> InMemoryDataStore<T> {
    pub fn new() -> Self {
        Self::with_items(Vec::new())
    }

    pub fn with_items(items: Vec<T>) -> Self {
        Self {
            items: Arc::new(watch::Sender::new(Arc::new(items))),
        }
    }

    /// Insert `items` at the front, or replace everything when `refresh`.
    pub fn insert_before(&self, items: Vec<T>, refresh: bool) {
        self.update(|current| {
            if refresh {
                items
            } else {
                items.into_iter().chain(current.iter().cloned()).collect()
            }
        });
    }

    /// Insert `items` at the back, or replace everything when `refresh`.
    pub fn insert_after(&self, items: Vec<T>, refresh: bool) {
        self.update(|current| {
            if refresh {
                items
            } else {
                current.iter().cloned().chain(items).collect()
            }
        });
    }

    pub fn replace(&self, items: Vec<T>) {
        self.update(|_| items);
    }

    fn update(&self, f: impl FnOnce(&[T]) -> Vec<T>) {
        self.items.send_modify(|current| {
            let next = f(current.as_slice());
            *current = Arc::new(next);
        });
    }

    pub fn items(&self, offset: u64, count: usize) -> Vec<T> {
        slice_page(&self.items.borrow(), offset, count)
    }

    pub fn len(&self) -> usize {
        self.items.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn item_at(&self, offset: u64) -> Option<T> {
        usize::try_from(offset)
            .ok()
            .and_then(|i| self.items.borrow().get(i).cloned())
    }

    /// Local snapshot stream: one snapshot now and one after every change.
    /// Snapshots read the live contents.
    pub fn snapshots(&self) -> LocalSnapshots<T> {
        let store = self.clone();
        let changes = self.items.subscribe();
        futures::stream::unfold((store, changes, true), |(store, mut changes, first)| async move {
            if !first && changes.changed().await.is_err() {
                return None;
            }
            let source: SharedLocalSource<T> = Arc::new(store.clone());
            Some((source, (store, changes, false)))
        })
        .boxed()
    }
}

impl<T: Clone + PartialEq + Send + Sync + 'static> InMemoryDataStore<T> {
    pub fn offset_of(&self, item: &T) -> Option<u64> {
        self.items
            .borrow()
            .iter()
            .position(|candidate| candidate == item)
            .map(|i| i as u64)
    }
}

impl<T: Clone + Send + Sync + 'static> LocalSource<T> for InMemoryDataStore<T> {
    fn load(&self, position: u64, count: usize) -> LoadFuture<'_, Vec<T>> {
        let page = self.items(position, count);
        Box::pin(async move { Ok(page) })
    }
}

// ── Remote source ───────────────────────────────────────────────────

/// Unbounded FIFO shared between the test and the hooks.
struct Queue<X> {
    tx: mpsc::UnboundedSender<X>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<X>>,
}

impl<X> Queue<X> {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    fn push(&self, item: X) {
        // The queue owns its receiver, so the send cannot fail.
        let _ = self.tx.send(item);
    }

    async fn pop(&self) -> Option<X> {
        self.rx.lock().await.recv().await
    }
}

struct RemoteState<T> {
    store: InMemoryDataStore<T>,
    pages_after: Queue<(Vec<T>, bool)>,
    pages_before: Queue<(Vec<T>, bool)>,
    refresh_content: Queue<Vec<T>>,
    after_started: Queue<LoadState>,
    after_cancelled: Queue<LoadState>,
}

/// Remote source backed by queued pages that land in an
/// [`InMemoryDataStore`].
///
/// - The after boundary is a raw hook: it records its [`LoadState`], then
///   pops one pushed page per signal until a page marked last.
/// - The before boundary pops one page per signal through
///   [`RemoteHooks::on_each_load_before`].
/// - A refresh replaces the store with the next refresh content and
///   recentres on position 0.
pub struct InMemoryRemoteSource<T> {
    state: Arc<RemoteState<T>>,
}

impl<T> Clone for InMemoryRemoteSource<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> InMemoryRemoteSource<T> {
    pub fn new(store: InMemoryDataStore<T>) -> Self {
        Self {
            state: Arc::new(RemoteState {
                store,
                pages_after: Queue::new(),
                pages_before: Queue::new(),
                refresh_content: Queue::new(),
                after_started: Queue::new(),
                after_cancelled: Queue::new(),
            }),
        }
    }

    pub fn push_page_after(&self, items: Vec<T>, last: bool) {
        self.state.pages_after.push((items, last));
    }

    pub fn push_page_before(&self, items: Vec<T>, last: bool) {
        self.state.pages_before.push((items, last));
    }

    pub fn set_refresh_content(&self, items: Vec<T>) {
        self.state.refresh_content.push(items);
    }

    /// Wait for the next load-after subscription to start.
    pub async fn await_on_load_after(&self) -> Option<LoadState> {
        self.state.after_started.pop().await
    }

    /// Wait for the next load-after subscription to be cancelled.
    pub async fn await_on_load_after_cancelled(&self) -> Option<LoadState> {
        self.state.after_cancelled.pop().await
    }
}

/// Records a cancelled subscription unless disarmed.
struct CancelWatch<T> {
    state: Arc<RemoteState<T>>,
    load_state: LoadState,
    armed: bool,
}

impl<T> Drop for CancelWatch<T> {
    fn drop(&mut self) {
        if self.armed {
            self.state.after_cancelled.push(self.load_state);
        }
    }
}

impl<T: Clone + Send + Sync + 'static> RemoteSource for InMemoryRemoteSource<T> {
    fn register(&self, hooks: &mut RemoteHooks, initial_position: u64, page_size: usize) {
        debug!(initial_position, page_size, "in-memory remote registered");

        let state = Arc::clone(&self.state);
        hooks.on_load_after(move |load_state, mut signals| {
            let state = Arc::clone(&state);
            async move {
                let mut guard = CancelWatch {
                    state: Arc::clone(&state),
                    load_state,
                    armed: true,
                };
                state.after_started.push(load_state);
                while signals.recv().await.is_some() {
                    signals.report(LoadStatus::Loading);
                    let Some((page, last)) = state.pages_after.pop().await else {
                        break;
                    };
                    state.store.insert_after(page, false);
                    if last {
                        break;
                    }
                    signals.report(LoadStatus::Idle);
                }
                guard.armed = false;
            }
        });

        let state = Arc::clone(&self.state);
        hooks.on_each_load_before(move |_| {
            let state = Arc::clone(&state);
            async move {
                let (page, last) = state.pages_before.pop().await.ok_or(FeedError::Closed)?;
                state.store.insert_before(page, false);
                let outcome = if last {
                    LoadOutcome::Complete
                } else {
                    LoadOutcome::More
                };
                Ok::<_, FeedError>(outcome)
            }
        });

        let state = Arc::clone(&self.state);
        hooks.on_refresh(move |_| {
            let state = Arc::clone(&state);
            async move {
                let page = state.refresh_content.pop().await.ok_or(FeedError::Closed)?;
                state.store.insert_after(page, true);
                Ok::<u64, FeedError>(0)
            }
        });
    }
}

// ── Scroll position ─────────────────────────────────────────────────

/// Scroll position store that tracks the item at the saved position, so the
/// restored offset follows that item when data is inserted before it.
pub struct InMemoryScrollPositionStore<T> {
    store: InMemoryDataStore<T>,
    initial_position: u64,
    current: Mutex<Option<T>>,
}

impl<T: Clone + PartialEq + Send + Sync + 'static> InMemoryScrollPositionStore<T> {
    pub fn new(store: InMemoryDataStore<T>, initial_position: u64) -> Self {
        Self {
            store,
            initial_position,
            current: Mutex::new(None),
        }
    }
}

impl<T: Clone + PartialEq + Send + Sync + 'static> ScrollPositionStore for InMemoryScrollPositionStore<T> {
    fn load(&self, refresh: bool) -> LoadFuture<'_, u64> {
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        if current.is_none() || refresh {
            *current = self.store.item_at(self.initial_position);
        }
        let position = current
            .as_ref()
            .and_then(|item| self.store.offset_of(item))
            .unwrap_or(0);
        Box::pin(async move { Ok(position) })
    }

    fn save(&self, position: u64) -> LoadFuture<'_, ()> {
        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = self.store.item_at(position);
        Box::pin(async { Ok(()) })
    }
}
