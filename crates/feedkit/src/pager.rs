//! Generation control: full refresh and initial-position resolution.
//!
//! A [`FeedPager`] owns the generation counter. Its stream builds a fresh
//! [`Feed`](crate::feed::Feed) for every generation and drops the previous
//! one, so a full refresh tears down the engine, both boundary loaders and
//! the remote coordinator together while consumers keep reading from one
//! uninterrupted stream.
//!
//! How a generation picks its anchor is a [`StartPolicy`]:
//!
//! - [`StartPolicy::Immediate`] awaits an offset provider for every
//!   generation.
//! - [`StartPolicy::ResolveThenStart`] awaits a resolver once, remembers its
//!   [`InitialPosition`] (offset plus the [`ItemKey`] the consumer uses to
//!   restore its scroll state), and forgets it on the first full refresh.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use futures::{FutureExt, Stream, StreamExt};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::FeedError;
use crate::feed::{Callbacks, DrivenStream, EVENT_BUFFER, FeedBuilder, FeedData};
use crate::options::FeedOptions;
use crate::position::{ScrollPositionStore, initial_offset};
use crate::remote::{LoadStates, SharedRemoteSource, StatusSender, status_channel};
use crate::source::LocalSnapshots;

/// Opaque key of the item a consumer should scroll to after the first load.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ItemKey(String);

impl ItemKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ItemKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for ItemKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

impl From<u64> for ItemKey {
    fn from(key: u64) -> Self {
        Self(key.to_string())
    }
}

/// Where the first generation starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitialPosition {
    pub offset: u64,
    pub item_key: Option<ItemKey>,
}

impl InitialPosition {
    pub fn new(offset: u64) -> Self {
        Self {
            offset,
            item_key: None,
        }
    }

    pub fn with_item_key(mut self, key: impl Into<ItemKey>) -> Self {
        self.item_key = Some(key.into());
        self
    }
}

/// Offset provider. The flag is `true` for generations started by a full
/// refresh.
type OffsetFn = Arc<dyn Fn(bool) -> BoxFuture<'static, u64> + Send + Sync>;
type ResolveFn = Arc<dyn Fn() -> BoxFuture<'static, Option<InitialPosition>> + Send + Sync>;

/// How each generation picks its anchor.
#[derive(Clone)]
pub enum StartPolicy {
    Immediate(OffsetFn),
    ResolveThenStart(ResolveFn),
}

impl fmt::Debug for StartPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Immediate(_) => f.write_str("Immediate"),
            Self::ResolveThenStart(_) => f.write_str("ResolveThenStart"),
        }
    }
}

impl Default for StartPolicy {
    fn default() -> Self {
        Self::immediate()
    }
}

impl StartPolicy {
    /// Always start at position 0.
    pub fn immediate() -> Self {
        Self::Immediate(Arc::new(|_| async { 0 }.boxed()))
    }

    /// Await `provider` at the start of every generation.
    pub fn at_offset<F, Fut>(provider: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = u64> + Send + 'static,
    {
        Self::Immediate(Arc::new(move |_| provider().boxed()))
    }

    /// Start where `store` says; generations after a full refresh ask the
    /// store with `refresh = true`.
    pub fn from_store(store: Arc<dyn ScrollPositionStore>) -> Self {
        Self::Immediate(Arc::new(move |refresh| {
            let store = Arc::clone(&store);
            async move { initial_offset(&*store, refresh).await }.boxed()
        }))
    }

    /// Resolve the first generation's position (and item key) with
    /// `resolver`; `None` starts at position 0.
    pub fn resolve_then_start<F, Fut>(resolver: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<InitialPosition>> + Send + 'static,
    {
        Self::ResolveThenStart(Arc::new(move || resolver().boxed()))
    }
}

enum Resolution {
    Unresolved,
    Resolved(Option<InitialPosition>),
    /// Forgotten by a full refresh.
    Cleared,
}

/// State shared by the pager, its streams and its connections.
struct Control {
    start: StartPolicy,
    resolution: tokio::sync::Mutex<Resolution>,
    generation: watch::Sender<u64>,
    link: Mutex<Link>,
}

/// What the connection knows about the feed the consumer is looking at.
#[derive(Default)]
struct Link {
    generation: u64,
    callbacks: Option<Arc<dyn Callbacks>>,
    anchored: bool,
    pending_refresh: bool,
    item_key: Option<ItemKey>,
}

impl Control {
    fn link(&self) -> std::sync::MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn current_generation(&self) -> u64 {
        *self.generation.borrow()
    }

    fn advance(&self) -> u64 {
        let mut next = 0;
        self.generation.send_modify(|generation| {
            *generation += 1;
            next = *generation;
        });
        next
    }

    async fn start_position(&self, generation: u64) -> (u64, Option<ItemKey>) {
        match &self.start {
            StartPolicy::Immediate(provider) => (provider(generation > 0).await, None),
            StartPolicy::ResolveThenStart(resolver) => {
                let mut resolution = self.resolution.lock().await;
                let position = match &*resolution {
                    Resolution::Unresolved => {
                        let position = resolver().await;
                        debug!(?position, "initial position resolved");
                        *resolution = Resolution::Resolved(position.clone());
                        position
                    }
                    Resolution::Resolved(position) => position.clone(),
                    Resolution::Cleared => None,
                };
                position.map_or((0, None), |p| (p.offset, p.item_key))
            }
        }
    }

    fn begin_generation(&self, generation: u64, item_key: Option<ItemKey>) {
        let mut link = self.link();
        link.generation = generation;
        link.callbacks = None;
        link.anchored = false;
        link.item_key = item_key;
    }

    fn observe<T>(&self, data: &FeedData<T>) {
        let mut link = self.link();
        if data.generation != link.generation {
            link.generation = data.generation;
            link.anchored = false;
        }
        link.callbacks = Some(Arc::clone(&data.callbacks));
    }
}

// ── Pager ───────────────────────────────────────────────────────────

type SnapshotFactory<T> = Arc<dyn Fn() -> LocalSnapshots<T> + Send + Sync>;

/// Restartable feed: one [`Feed`](crate::feed::Feed) per generation.
pub struct FeedPager<T> {
    snapshots: SnapshotFactory<T>,
    remote: SharedRemoteSource,
    options: FeedOptions,
    status: StatusSender,
    control: Arc<Control>,
}

impl<T> Clone for FeedPager<T> {
    fn clone(&self) -> Self {
        Self {
            snapshots: Arc::clone(&self.snapshots),
            remote: Arc::clone(&self.remote),
            options: self.options.clone(),
            status: Arc::clone(&self.status),
            control: Arc::clone(&self.control),
        }
    }
}

impl<T: Send + 'static> FeedPager<T> {
    /// `snapshots` is called once per generation for a fresh local
    /// snapshot stream.
    pub fn new<S>(
        snapshots: S,
        remote: SharedRemoteSource,
        options: FeedOptions,
        start: StartPolicy,
    ) -> Result<Self, FeedError>
    where
        S: Fn() -> LocalSnapshots<T> + Send + Sync + 'static,
    {
        options.validate()?;
        Ok(Self {
            snapshots: Arc::new(snapshots),
            remote,
            options,
            status: status_channel(),
            control: Arc::new(Control {
                start,
                resolution: tokio::sync::Mutex::new(Resolution::Unresolved),
                generation: watch::Sender::new(0),
                link: Mutex::new(Link::default()),
            }),
        })
    }

    /// Events of the current generation, switching to each new generation
    /// as it starts. Nothing runs until the first poll.
    pub fn stream(&self) -> PagerStream<T> {
        let (events_tx, events) = mpsc::channel(EVENT_BUFFER);
        let token = CancellationToken::new();
        let driver = drive(self.clone(), events_tx, token.clone()).boxed();
        PagerStream {
            inner: DrivenStream::new(events, driver, token),
        }
    }

    pub fn connection(&self) -> FeedConnection {
        FeedConnection {
            control: Arc::clone(&self.control),
        }
    }

    /// Remote load status of whichever generation is live.
    pub fn load_states(&self) -> watch::Receiver<LoadStates> {
        self.status.subscribe()
    }

    pub fn generation(&self) -> u64 {
        self.control.current_generation()
    }
}

/// Stream returned by [`FeedPager::stream`].
pub struct PagerStream<T> {
    inner: DrivenStream<Result<FeedData<T>, FeedError>>,
}

impl<T: Send + 'static> Stream for PagerStream<T> {
    type Item = Result<FeedData<T>, FeedError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

async fn drive<T: Send + 'static>(
    pager: FeedPager<T>,
    events: mpsc::Sender<Result<FeedData<T>, FeedError>>,
    token: CancellationToken,
) {
    let control = Arc::clone(&pager.control);
    let mut generations = control.generation.subscribe();

    'generations: loop {
        let generation = *generations.borrow_and_update();
        let (offset, item_key) = tokio::select! {
            biased;
            _ = token.cancelled() => return,
            changed = generations.changed() => {
                if changed.is_err() {
                    return;
                }
                continue 'generations;
            }
            position = control.start_position(generation) => position,
        };
        control.begin_generation(generation, item_key);
        pager.status.send_replace(LoadStates::default());
        info!(generation, offset, "pager generation starting");

        let feed = FeedBuilder::new((pager.snapshots)(), Arc::clone(&pager.remote), pager.options.clone())
            .initial_offset(move || async move { offset })
            .generation(generation)
            .status(Arc::clone(&pager.status))
            .build();
        let mut feed = match feed {
            Ok(feed) => feed,
            Err(err) => {
                let _ = events.send(Err(err)).await;
                return;
            }
        };

        let mut feed_open = true;
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => return,
                changed = generations.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    debug!(generation, "generation superseded");
                    continue 'generations;
                }
                item = feed.next(), if feed_open => match item {
                    Some(Ok(data)) => {
                        control.observe(&data);
                        if events.send(Ok(data)).await.is_err() {
                            return;
                        }
                    }
                    Some(Err(err)) => {
                        if events.send(Err(err)).await.is_err() {
                            return;
                        }
                    }
                    None => {
                        trace!(generation, "feed ended; waiting for a new generation");
                        feed_open = false;
                    }
                },
            }
        }
    }
}

// ── Connection ──────────────────────────────────────────────────────

/// Consumer-side handle for the controls that outlive a single emission.
#[derive(Clone)]
pub struct FeedConnection {
    control: Arc<Control>,
}

/// Completes a full refresh when run. Dropping it abandons the refresh.
#[derive(Debug)]
pub struct RefreshAction {
    tx: oneshot::Sender<()>,
}

impl RefreshAction {
    pub fn run(self) {
        let _ = self.tx.send(());
    }
}

impl FeedConnection {
    /// Item to scroll to once the first generation has rendered. Cleared by
    /// a full refresh.
    pub fn initial_item_key(&self) -> Option<ItemKey> {
        self.control.link().item_key.clone()
    }

    /// Report the viewport to the latest emission's callbacks. The first
    /// report of a generation anchors it and runs any deferred
    /// [`refresh_in_place`](Self::refresh_in_place).
    pub fn update_visible_window(&self, first_visible_position: usize, visible_item_count: usize) {
        let (callbacks, pending) = {
            let mut link = self.control.link();
            let Some(callbacks) = link.callbacks.clone() else {
                trace!("no emission yet; viewport update ignored");
                return;
            };
            link.anchored = true;
            (callbacks, std::mem::take(&mut link.pending_refresh))
        };
        callbacks.update_visible_window(first_visible_position, visible_item_count);
        if !pending {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                debug!("running deferred refresh");
                runtime.spawn(async move {
                    if let Err(err) = callbacks.refresh().await {
                        warn!(error = %err, "deferred refresh failed");
                    }
                });
            }
            Err(_) => {
                warn!("no runtime for deferred refresh; keeping it pending");
                self.control.link().pending_refresh = true;
            }
        }
    }

    /// Refresh around the current viewport. Before the consumer has
    /// reported a viewport the anchor is unknown, so the refresh is deferred
    /// until the first [`update_visible_window`](Self::update_visible_window).
    pub async fn refresh_in_place(&self) -> Result<(), FeedError> {
        let callbacks = {
            let mut link = self.control.link();
            match (&link.callbacks, link.anchored) {
                (Some(callbacks), true) => Arc::clone(callbacks),
                _ => {
                    debug!("refresh deferred until the viewport is known");
                    link.pending_refresh = true;
                    return Ok(());
                }
            }
        };
        callbacks.refresh().await
    }

    /// Discard everything and restart from a new generation.
    ///
    /// `trigger` receives a [`RefreshAction`]; the new generation starts
    /// once the action runs (typically after the caller has invalidated the
    /// local cache). Returns [`FeedError::RefreshCancelled`] if the action
    /// is dropped without running.
    pub async fn refresh<F>(&self, trigger: F) -> Result<(), FeedError>
    where
        F: FnOnce(RefreshAction),
    {
        self.control.link().item_key = None;
        *self.control.resolution.lock().await = Resolution::Cleared;

        let (tx, rx) = oneshot::channel();
        trigger(RefreshAction { tx });
        rx.await.map_err(|_| FeedError::RefreshCancelled)?;

        let generation = self.control.advance();
        info!(generation, "full refresh");
        Ok(())
    }
}
