//! The feed engine.
//!
//! [`Feed`] is a lazily started stream of [`FeedData`] events for one
//! generation. On first poll it resolves the initial anchor, registers the
//! remote hooks, and then serves the current load window for every local
//! snapshot:
//!
//! ```text
//! snapshot ─▶ read [window.start, max(initial, window.size)) ─▶ Initial
//!                    │ empty                                   │
//!                    ▼                                         ├─ before: BoundaryLoader ─▶ Prepend … ─▶ remote.load_before
//!              remote.load_after                               └─ after:  BoundaryLoader ─▶ Append  … ─▶ remote.load_after
//! ```
//!
//! Each serving pass runs in its own [`TaskScope`]; a new snapshot or a
//! completed refresh shuts the previous pass down (cancelling and joining
//! its tasks) before the next one reads anything, so a stale load can never
//! emit into the new window.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use futures::{FutureExt, Stream, StreamExt};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use crate::error::FeedError;
use crate::loader::{BoundaryLoader, Direction, LoadRange, PageSink, preferred_direction};
use crate::options::FeedOptions;
use crate::remote::{
    LoadStates, Recentre, RefreshSlot, RemoteCoordinator, RemoteHooks, SharedRemoteSource,
    StatusSender, status_channel,
};
use crate::scope::{TaskScope, WeakScope};
use crate::source::{LoadFuture, LocalSnapshots, LocalSource, SharedLocalSource};
use crate::window::{LoadWindow, compute_window, initial_window};

/// Capacity of the consumer event channel.
pub(crate) const EVENT_BUFFER: usize = 64;

/// How a batch of items changes the consumer's list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FeedEventKind {
    /// Replace the list. `first_visible_position` is the index the
    /// consumer should scroll to.
    Initial { first_visible_position: usize },
    /// Insert before the current first item.
    Prepend,
    /// Insert after the current last item.
    Append,
}

/// Consumer-facing controls bound to the serving pass that emitted them.
pub trait Callbacks: Send + Sync {
    /// Report the viewport, relative to the consumer's list.
    /// Non-blocking; repeated calls with the same window are free.
    fn update_visible_window(&self, first_visible_position: usize, visible_item_count: usize);

    /// Refresh in place around the current window.
    fn refresh(&self) -> LoadFuture<'_, ()>;
}

/// One emission of a feed.
pub struct FeedData<T> {
    pub kind: FeedEventKind,
    pub items: Vec<T>,
    pub callbacks: Arc<dyn Callbacks>,
    /// Generation that produced this emission.
    pub generation: u64,
}

impl<T> FeedData<T> {
    pub fn map<R>(self, f: impl FnMut(T) -> R) -> FeedData<R> {
        FeedData {
            kind: self.kind,
            items: self.items.into_iter().map(f).collect(),
            callbacks: self.callbacks,
            generation: self.generation,
        }
    }

    pub fn is_initial(&self) -> bool {
        matches!(self.kind, FeedEventKind::Initial { .. })
    }
}

impl<T: Clone> Clone for FeedData<T> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            items: self.items.clone(),
            callbacks: Arc::clone(&self.callbacks),
            generation: self.generation,
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for FeedData<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedData")
            .field("kind", &self.kind)
            .field("items", &self.items)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

/// Item mapping for streams of feed results.
pub trait FeedStreamExt<T>: Stream<Item = Result<FeedData<T>, FeedError>> + Sized {
    fn map_items<R, F>(self, mut f: F) -> impl Stream<Item = Result<FeedData<R>, FeedError>>
    where
        F: FnMut(T) -> R,
    {
        self.map(move |result| result.map(|data| data.map(&mut f)))
    }
}

impl<T, S> FeedStreamExt<T> for S where S: Stream<Item = Result<FeedData<T>, FeedError>> {}

// ── Builder ─────────────────────────────────────────────────────────

type OffsetProvider = Box<dyn FnOnce() -> BoxFuture<'static, u64> + Send>;

/// Configures and creates a [`Feed`].
pub struct FeedBuilder<T> {
    snapshots: LocalSnapshots<T>,
    remote: SharedRemoteSource,
    options: FeedOptions,
    initial_offset: Option<OffsetProvider>,
    generation: u64,
    status: Option<StatusSender>,
}

impl<T: Send + 'static> FeedBuilder<T> {
    pub fn new(snapshots: LocalSnapshots<T>, remote: SharedRemoteSource, options: FeedOptions) -> Self {
        Self {
            snapshots,
            remote,
            options,
            initial_offset: None,
            generation: 0,
            status: None,
        }
    }

    /// Provider of the anchor position, awaited once when the feed starts.
    /// Defaults to position 0.
    pub fn initial_offset<F, Fut>(mut self, provider: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = u64> + Send + 'static,
    {
        self.initial_offset = Some(Box::new(move || provider().boxed()));
        self
    }

    /// Generation number stamped on every emission.
    pub fn generation(mut self, generation: u64) -> Self {
        self.generation = generation;
        self
    }

    pub(crate) fn status(mut self, status: StatusSender) -> Self {
        self.status = Some(status);
        self
    }

    pub fn build(self) -> Result<Feed<T>, FeedError> {
        self.options.validate()?;
        let (events_tx, events) = mpsc::channel(EVENT_BUFFER);
        let token = CancellationToken::new();
        let status = self.status.unwrap_or_else(status_channel);
        debug!(generation = self.generation, page_size = self.options.page_size, "feed built");
        let driver = Driver {
            snapshots: self.snapshots,
            remote: self.remote,
            options: self.options,
            initial_offset: self.initial_offset,
            generation: self.generation,
            status: Arc::clone(&status),
            events: events_tx,
            token: token.clone(),
        };
        Ok(Feed {
            stream: DrivenStream::new(events, driver.run().boxed(), token),
            status,
        })
    }
}

/// Create a feed over `snapshots` backed by `remote`, anchored at 0.
pub fn feed<T: Send + 'static>(
    snapshots: LocalSnapshots<T>,
    remote: SharedRemoteSource,
    options: FeedOptions,
) -> Result<Feed<T>, FeedError> {
    FeedBuilder::new(snapshots, remote, options).build()
}

// ── Feed stream ─────────────────────────────────────────────────────

/// Stream of [`FeedData`] for one generation.
///
/// Nothing runs until the first poll. The stream yields a local-read error
/// at most once and then ends; otherwise it stays open until dropped.
/// Dropping the feed cancels every task it started.
pub struct Feed<T> {
    stream: DrivenStream<Result<FeedData<T>, FeedError>>,
    status: StatusSender,
}

impl<T> Feed<T> {
    /// Remote load status for this feed.
    pub fn load_states(&self) -> watch::Receiver<LoadStates> {
        self.status.subscribe()
    }

    /// Stop the feed. Events already queued are still yielded.
    pub fn cancel(&self) {
        self.stream.cancel();
    }
}

impl<T: Send + 'static> Stream for Feed<T> {
    type Item = Result<FeedData<T>, FeedError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.stream).poll_next(cx)
    }
}

/// Channel-backed stream whose producer task is spawned on first poll and
/// cancelled when the stream is dropped.
pub(crate) struct DrivenStream<I> {
    events: mpsc::Receiver<I>,
    driver: Option<BoxFuture<'static, ()>>,
    task: Option<JoinHandle<()>>,
    token: CancellationToken,
}

impl<I> DrivenStream<I> {
    pub(crate) fn new(
        events: mpsc::Receiver<I>,
        driver: BoxFuture<'static, ()>,
        token: CancellationToken,
    ) -> Self {
        Self {
            events,
            driver: Some(driver),
            task: None,
            token,
        }
    }

    pub(crate) fn cancel(&self) {
        self.token.cancel();
    }
}

impl<I> Stream for DrivenStream<I> {
    type Item = I;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<I>> {
        if let Some(driver) = self.driver.take() {
            self.task = Some(tokio::spawn(driver));
        }
        self.events.poll_recv(cx)
    }
}

impl<I> Drop for DrivenStream<I> {
    fn drop(&mut self) {
        self.token.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// ── Driver ──────────────────────────────────────────────────────────

struct Driver<T> {
    snapshots: LocalSnapshots<T>,
    remote: SharedRemoteSource,
    options: FeedOptions,
    initial_offset: Option<OffsetProvider>,
    generation: u64,
    status: StatusSender,
    events: mpsc::Sender<Result<FeedData<T>, FeedError>>,
    token: CancellationToken,
}

impl<T: Send + 'static> Driver<T> {
    async fn run(self) {
        let Driver {
            mut snapshots,
            remote,
            options,
            initial_offset,
            generation,
            status,
            events,
            token,
        } = self;
        let root = TaskScope::root("generation", token.clone());

        let anchor = match initial_offset {
            Some(provider) => tokio::select! {
                biased;
                _ = token.cancelled() => return,
                anchor = provider() => anchor,
            },
            None => 0,
        };

        let mut hooks = RemoteHooks::new(options.retry.clone());
        remote.register(&mut hooks, anchor, options.page_size);
        let coordinator = Arc::new(RemoteCoordinator::with_status(
            hooks,
            token.child_token(),
            status,
        ));
        coordinator.start().await;

        let window = initial_window(anchor, options.initial_load_size);
        info!(generation, anchor, %window, "feed generation started");

        let engine = Arc::new(Engine {
            options,
            generation,
            events,
            coordinator: Arc::clone(&coordinator),
            viewport: Arc::new(Mutex::new(Viewport {
                window,
                starting_offset: window.start,
                anchor,
                serving: 0,
            })),
            token: token.clone(),
        });

        let mut refresh_slot = coordinator.refresh_slot();
        let mut current: Option<SharedLocalSource<T>> = None;
        let mut serving: Option<Arc<TaskScope>> = None;
        let mut snapshots_open = true;
        let mut awaiting_refresh = false;

        loop {
            let restart = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                snapshot = snapshots.next(), if snapshots_open => match snapshot {
                    Some(source) => {
                        current = Some(source);
                        true
                    }
                    None => {
                        debug!(generation, "local snapshot stream ended");
                        snapshots_open = false;
                        false
                    }
                },
                changed = refresh_slot.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let slot = *refresh_slot.borrow_and_update();
                    match slot {
                        RefreshSlot::Ready(_) => {
                            // This restart serves the deferred snapshot too.
                            awaiting_refresh = false;
                            true
                        }
                        RefreshSlot::Idle => std::mem::take(&mut awaiting_refresh),
                        RefreshSlot::Pending => false,
                    }
                }
            };
            if !restart {
                continue;
            }

            if let Some(scope) = serving.take() {
                scope.shutdown().await;
            }
            let Some(source) = current.clone() else {
                continue;
            };
            if *refresh_slot.borrow() == RefreshSlot::Pending {
                // Serve once the refresh settles so the recentred window is used.
                trace!(generation, "snapshot arrived during refresh; waiting");
                awaiting_refresh = true;
                continue;
            }

            let recentre = coordinator.take_recentre();
            let scope = root.child("window");
            let scope_id = engine.begin_scope(recentre);
            let weak = scope.downgrade();
            let serve_engine = Arc::clone(&engine);
            scope.spawn(async move {
                if let Err(err) = serve(&serve_engine, weak, scope_id, source, recentre.is_some()).await {
                    serve_engine.fail(err).await;
                }
            });
            serving = Some(scope);
        }

        if let Some(scope) = serving.take() {
            scope.shutdown().await;
        }
        root.shutdown().await;
        debug!(generation, "feed generation stopped");
    }
}

/// Window state shared by the driver and the current callbacks.
struct Viewport {
    window: LoadWindow,
    /// Absolute position of the consumer's list index 0.
    starting_offset: u64,
    /// Absolute position of the first visible item.
    anchor: u64,
    /// Id of the serving pass whose callbacks are live.
    serving: u64,
}

struct Engine<T> {
    options: FeedOptions,
    generation: u64,
    events: mpsc::Sender<Result<FeedData<T>, FeedError>>,
    coordinator: Arc<RemoteCoordinator>,
    viewport: Arc<Mutex<Viewport>>,
    token: CancellationToken,
}

impl<T: Send + 'static> Engine<T> {
    fn viewport(&self) -> std::sync::MutexGuard<'_, Viewport> {
        self.viewport.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start a new serving pass, applying a completed refresh if there is
    /// one. Callbacks of earlier passes go stale.
    fn begin_scope(&self, recentre: Option<Recentre>) -> u64 {
        let mut viewport = self.viewport();
        if let Some(recentre) = recentre {
            viewport.anchor = recentre.shift(viewport.anchor);
            viewport.window = recentre.to;
            debug!(window = %recentre.to, anchor = viewport.anchor, "window recentred by refresh");
        }
        viewport.serving += 1;
        viewport.serving
    }

    async fn emit(
        &self,
        kind: FeedEventKind,
        items: Vec<T>,
        callbacks: &Arc<dyn Callbacks>,
    ) -> Result<(), FeedError> {
        let data = FeedData {
            kind,
            items,
            callbacks: Arc::clone(callbacks),
            generation: self.generation,
        };
        self.events.send(Ok(data)).await.map_err(|_| FeedError::Closed)
    }

    /// End the generation after an unrecoverable error.
    async fn fail(&self, err: FeedError) {
        if err == FeedError::Closed {
            trace!(generation = self.generation, "consumer gone; stopping feed");
        } else {
            error!(generation = self.generation, error = %err, "local source failed; ending feed");
            let _ = self.events.send(Err(err)).await;
        }
        self.token.cancel();
    }
}

async fn read<T>(source: &dyn LocalSource<T>, position: u64, count: usize) -> Result<Vec<T>, FeedError> {
    source.load(position, count).await.map_err(|err| match err {
        FeedError::LocalRead { .. } => err,
        other => FeedError::local_read(position, count, other.to_string()),
    })
}

/// Serve the current window from `source`: initial read, then one boundary
/// consumer per direction.
async fn serve<T: Send + 'static>(
    engine: &Arc<Engine<T>>,
    scope: WeakScope,
    scope_id: u64,
    source: SharedLocalSource<T>,
    recentred: bool,
) -> Result<(), FeedError> {
    let (window, anchor) = {
        let viewport = engine.viewport();
        (viewport.window, viewport.anchor)
    };
    let page_size = engine.options.page_size;
    let count = engine.options.initial_load_size.max(window.size);
    let items = read(&*source, window.start, count).await?;
    if items.is_empty() {
        debug!(%window, "local source empty; requesting remote data");
        engine.coordinator.load_after().await;
        return Ok(());
    }

    let range = LoadRange {
        start: window.start,
        end: window.start + items.len() as u64,
    };
    let loader = Arc::new(BoundaryLoader::new(
        range,
        page_size,
        window.start > 0,
        items.len() >= page_size,
    ));
    engine.viewport().starting_offset = window.start;

    let callbacks: Arc<dyn Callbacks> = Arc::new(ScopeCallbacks {
        scope: scope.clone(),
        scope_id,
        loader: Arc::clone(&loader),
        coordinator: Arc::clone(&engine.coordinator),
        viewport: Arc::clone(&engine.viewport),
        prefetch: engine.options.effective_prefetch(),
    });
    // An anchor past the end of the data still has to index into `items`.
    let first_visible_position = anchor
        .saturating_sub(window.start)
        .min(items.len() as u64 - 1) as usize;
    debug!(?range, first_visible_position, "initial load");
    engine
        .emit(
            FeedEventKind::Initial {
                first_visible_position,
            },
            items,
            &callbacks,
        )
        .await?;

    for direction in [Direction::Before, Direction::After] {
        let sink = ScopeSink {
            engine: Arc::clone(engine),
            source: Arc::clone(&source),
            callbacks: Arc::clone(&callbacks),
            scope_id,
        };
        let loader = Arc::clone(&loader);
        scope.spawn(async move {
            match loader.consume(direction, &sink).await {
                Ok(()) => match direction {
                    Direction::Before => sink.engine.coordinator.load_before().await,
                    Direction::After => sink.engine.coordinator.load_after().await,
                },
                Err(err) => sink.engine.fail(err).await,
            }
        });
    }

    if recentred {
        let preferred = preferred_direction(anchor, range, engine.options.item_order);
        debug!(%preferred, "priming boundary after refresh");
        scope.spawn(async move {
            loader.request(preferred, window).await;
        });
    }
    Ok(())
}

/// Reads boundary pages for one serving pass and emits them.
struct ScopeSink<T> {
    engine: Arc<Engine<T>>,
    source: SharedLocalSource<T>,
    callbacks: Arc<dyn Callbacks>,
    scope_id: u64,
}

impl<T: Send + 'static> PageSink for ScopeSink<T> {
    fn load_page(&self, direction: Direction, position: u64, count: usize) -> LoadFuture<'_, usize> {
        Box::pin(async move {
            let items = read(&*self.source, position, count).await?;
            let loaded = items.len();
            if loaded == 0 {
                return Ok(0);
            }
            let kind = match direction {
                Direction::Before => {
                    let mut viewport = self.engine.viewport();
                    if viewport.serving == self.scope_id {
                        viewport.starting_offset = viewport.starting_offset.saturating_sub(loaded as u64);
                    }
                    FeedEventKind::Prepend
                }
                Direction::After => FeedEventKind::Append,
            };
            self.engine.emit(kind, items, &self.callbacks).await?;
            Ok(loaded)
        })
    }
}

struct ScopeCallbacks {
    scope: WeakScope,
    scope_id: u64,
    loader: Arc<BoundaryLoader>,
    coordinator: Arc<RemoteCoordinator>,
    viewport: Arc<Mutex<Viewport>>,
    prefetch: usize,
}

impl Callbacks for ScopeCallbacks {
    fn update_visible_window(&self, first_visible_position: usize, visible_item_count: usize) {
        let window = {
            let mut viewport = self.viewport.lock().unwrap_or_else(|e| e.into_inner());
            if viewport.serving != self.scope_id {
                trace!(scope_id = self.scope_id, "stale callbacks; viewport update ignored");
                return;
            }
            let window = compute_window(
                viewport.starting_offset,
                first_visible_position,
                visible_item_count,
                self.prefetch,
            );
            viewport.anchor = viewport.starting_offset + first_visible_position as u64;
            if window == viewport.window {
                return;
            }
            viewport.window = window;
            window
        };
        debug!(%window, first_visible_position, visible_item_count, "load window changed");
        let loader = Arc::clone(&self.loader);
        self.scope.spawn(async move {
            loader.request_if_needed(window).await;
        });
    }

    fn refresh(&self) -> LoadFuture<'_, ()> {
        Box::pin(async move {
            let window = self
                .viewport
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .window;
            self.coordinator.refresh(window).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::EmptyRemoteSource;
    use crate::source::{FnLocalSource, local_source_of, single_snapshot};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(2);

    fn vec_feed(items: Vec<i32>, options: FeedOptions) -> FeedBuilder<i32> {
        FeedBuilder::new(
            single_snapshot(local_source_of(items)),
            Arc::new(EmptyRemoteSource),
            options,
        )
    }

    async fn next(feed: &mut Feed<i32>) -> FeedData<i32> {
        tokio::time::timeout(WAIT, feed.next())
            .await
            .expect("timed out waiting for event")
            .expect("feed ended")
            .expect("feed failed")
    }

    async fn assert_quiet(feed: &mut Feed<i32>) {
        let next = tokio::time::timeout(Duration::from_millis(50), feed.next()).await;
        assert!(next.is_err(), "unexpected event: {:?}", next.ok());
    }

    #[tokio::test]
    async fn nothing_runs_before_first_poll() {
        let reads = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&reads);
        let source = FnLocalSource::new(move |_: u64, _: usize| {
            r.fetch_add(1, Ordering::SeqCst);
            async { Ok::<Vec<i32>, FeedError>(vec![1]) }
        });
        let mut feed = FeedBuilder::new(
            single_snapshot(source),
            Arc::new(EmptyRemoteSource),
            FeedOptions::new(3),
        )
        .build()
        .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(reads.load(Ordering::SeqCst), 0);

        next(&mut feed).await;
        assert_eq!(reads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalid_options_are_rejected_at_build() {
        assert!(vec_feed(vec![1], FeedOptions::new(0)).build().is_err());
    }

    #[tokio::test]
    async fn prepend_moves_starting_offset() {
        let options = FeedOptions::new(3)
            .with_initial_load_size(3)
            .with_prefetch_distance(0);
        let mut feed = vec_feed((1..=9).collect(), options)
            .initial_offset(|| async { 7 })
            .build()
            .unwrap();

        let initial = next(&mut feed).await;
        assert_eq!(initial.items, vec![7, 8, 9]);
        assert_eq!(
            initial.kind,
            FeedEventKind::Initial {
                first_visible_position: 1
            }
        );

        initial.callbacks.update_visible_window(0, 3);
        let prepend = next(&mut feed).await;
        assert_eq!(prepend.kind, FeedEventKind::Prepend);
        assert_eq!(prepend.items, vec![4, 5, 6]);

        // Index 0 is now position 3, so this window reaches position 2.
        prepend.callbacks.update_visible_window(0, 3);
        let prepend = next(&mut feed).await;
        assert_eq!(prepend.items, vec![1, 2, 3]);
        assert_quiet(&mut feed).await;
    }

    #[tokio::test]
    async fn local_read_failure_ends_stream_with_error() {
        let source = FnLocalSource::new(|position: u64, count: usize| async move {
            if position == 0 {
                Ok((0..count as i32).collect::<Vec<i32>>())
            } else {
                Err(FeedError::local_read(position, count, "corrupt page"))
            }
        });
        let mut feed = FeedBuilder::new(
            single_snapshot(source),
            Arc::new(EmptyRemoteSource),
            FeedOptions::new(3).with_initial_load_size(3),
        )
        .build()
        .unwrap();

        let initial = next(&mut feed).await;
        initial.callbacks.update_visible_window(2, 3);
        let err = tokio::time::timeout(WAIT, feed.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(err.is_fatal());
        let end = tokio::time::timeout(WAIT, feed.next()).await.unwrap();
        assert!(end.is_none());
    }

    #[tokio::test]
    async fn map_items_transforms_payload() {
        let feed = vec_feed(vec![1, 2, 3], FeedOptions::new(3)).build().unwrap();
        let mut mapped = Box::pin(feed.map_items(|n| n.to_string()));
        let data = tokio::time::timeout(WAIT, mapped.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(data.items, vec!["1", "2", "3"]);
        assert!(data.is_initial());
    }

    #[tokio::test]
    async fn generation_is_stamped_on_events() {
        let mut feed = vec_feed(vec![1], FeedOptions::new(3))
            .generation(4)
            .build()
            .unwrap();
        assert_eq!(next(&mut feed).await.generation, 4);
    }
}
