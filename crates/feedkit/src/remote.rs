//! Remote source hooks and the coordinator that drives them.
//!
//! A [`RemoteSource`] registers up to three hooks on [`RemoteHooks`]: one per
//! boundary direction and one for refresh. Boundary hooks run as long-lived
//! subscriptions that receive a signal every time the engine runs out of
//! local data in that direction; the hook fetches from the remote, writes
//! into the local cache, and the resulting cache snapshot drives the next
//! emission.
//!
//! [`RemoteCoordinator::refresh`] is the cancel-and-restart entry point. Old
//! subscriptions are cancelled and joined before the replacements start, so
//! a boundary signal sent after a refresh began is always observed by the
//! post-refresh subscription. The refresh hook's adjusted window start is
//! handed to the engine through a single-slot rendezvous.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::FeedError;
use crate::loader::Direction;
use crate::retry::RetryConfig;
use crate::window::LoadWindow;

/// Boxed future returned by registered hooks.
pub type HookFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Why a boundary subscription was (re)started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    /// First subscription of the generation.
    Initial,
    /// Restarted by a refresh.
    Refresh,
    /// Re-invoked after a failed fetch.
    Retry,
}

/// Result of a single boundary fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// More data may exist in this direction.
    More,
    /// The remote has no more data in this direction.
    Complete,
}

/// Observable state of one remote operation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LoadStatus {
    #[default]
    Idle,
    Loading,
    Complete,
    Error(FeedError),
}

impl LoadStatus {
    pub fn is_loading(&self) -> bool {
        matches!(self, Self::Loading)
    }

    pub fn error(&self) -> Option<&FeedError> {
        match self {
            Self::Error(err) => Some(err),
            _ => None,
        }
    }
}

/// Remote load status for both boundaries and refresh.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LoadStates {
    pub before: LoadStatus,
    pub after: LoadStatus,
    pub refresh: LoadStatus,
}

impl LoadStates {
    pub fn get(&self, direction: Direction) -> &LoadStatus {
        match direction {
            Direction::Before => &self.before,
            Direction::After => &self.after,
        }
    }

    fn set(&mut self, direction: Direction, status: LoadStatus) {
        match direction {
            Direction::Before => self.before = status,
            Direction::After => self.after = status,
        }
    }
}

pub(crate) type StatusSender = Arc<watch::Sender<LoadStates>>;

pub(crate) fn status_channel() -> StatusSender {
    Arc::new(watch::Sender::new(LoadStates::default()))
}

/// Signal stream handed to a boundary hook.
///
/// `recv` resolves once per boundary signal and returns `None` when the
/// subscription is torn down.
pub struct BoundarySignals {
    direction: Direction,
    signals: mpsc::Receiver<()>,
    status: StatusSender,
}

impl BoundarySignals {
    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub async fn recv(&mut self) -> Option<()> {
        self.signals.recv().await
    }

    /// Publish a status for this direction.
    pub fn report(&self, status: LoadStatus) {
        let direction = self.direction;
        self.status.send_modify(|states| states.set(direction, status));
    }
}

type BoundaryHook = Arc<dyn Fn(LoadState, BoundarySignals) -> HookFuture<()> + Send + Sync>;
type RefreshHook = Arc<dyn Fn(LoadWindow) -> HookFuture<Result<u64, FeedError>> + Send + Sync>;

/// Hook registry filled in by [`RemoteSource::register`].
pub struct RemoteHooks {
    retry: RetryConfig,
    before: Option<BoundaryHook>,
    after: Option<BoundaryHook>,
    refresh: Option<RefreshHook>,
}

impl Default for RemoteHooks {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl RemoteHooks {
    pub fn new(retry: RetryConfig) -> Self {
        Self {
            retry,
            before: None,
            after: None,
            refresh: None,
        }
    }

    /// Register a raw hook for the before boundary. The hook owns its signal
    /// loop; returning from it marks the direction complete.
    pub fn on_load_before<F, Fut>(&mut self, hook: F)
    where
        F: Fn(LoadState, BoundarySignals) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.before = Some(raw_hook(hook));
    }

    /// Register a raw hook for the after boundary.
    pub fn on_load_after<F, Fut>(&mut self, hook: F)
    where
        F: Fn(LoadState, BoundarySignals) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.after = Some(raw_hook(hook));
    }

    /// Register a per-signal fetch for the before boundary.
    ///
    /// Status is published automatically and failures are retried per the
    /// feed's [`RetryConfig`].
    pub fn on_each_load_before<F, Fut>(&mut self, hook: F)
    where
        F: Fn(LoadState) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<LoadOutcome, FeedError>> + Send + 'static,
    {
        self.before = Some(each_signal_hook(hook, self.retry.clone()));
    }

    /// Register a per-signal fetch for the after boundary.
    pub fn on_each_load_after<F, Fut>(&mut self, hook: F)
    where
        F: Fn(LoadState) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<LoadOutcome, FeedError>> + Send + 'static,
    {
        self.after = Some(each_signal_hook(hook, self.retry.clone()));
    }

    /// Register the refresh hook. It receives the current window and
    /// returns the start position the window should be recentred on.
    pub fn on_refresh<F, Fut>(&mut self, hook: F)
    where
        F: Fn(LoadWindow) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<u64, FeedError>> + Send + 'static,
    {
        self.refresh = Some(Arc::new(
            move |window: LoadWindow| -> HookFuture<Result<u64, FeedError>> { Box::pin(hook(window)) },
        ));
    }

    pub fn has_boundary_hook(&self, direction: Direction) -> bool {
        match direction {
            Direction::Before => self.before.is_some(),
            Direction::After => self.after.is_some(),
        }
    }

    pub fn has_refresh_hook(&self) -> bool {
        self.refresh.is_some()
    }
}

fn raw_hook<F, Fut>(hook: F) -> BoundaryHook
where
    F: Fn(LoadState, BoundarySignals) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(
        move |state: LoadState, signals: BoundarySignals| -> HookFuture<()> {
            Box::pin(hook(state, signals))
        },
    )
}

fn each_signal_hook<F, Fut>(hook: F, retry: RetryConfig) -> BoundaryHook
where
    F: Fn(LoadState) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<LoadOutcome, FeedError>> + Send + 'static,
{
    let hook = Arc::new(hook);
    Arc::new(move |state: LoadState, mut signals: BoundarySignals| -> HookFuture<()> {
        let hook = Arc::clone(&hook);
        let retry = retry.clone();
        Box::pin(async move {
            let direction = signals.direction();
            let mut next_state = state;
            while signals.recv().await.is_some() {
                signals.report(LoadStatus::Loading);
                match fetch_with_retry(&*hook, next_state, &retry, direction).await {
                    Ok(LoadOutcome::More) => {
                        signals.report(LoadStatus::Idle);
                        next_state = state;
                    }
                    Ok(LoadOutcome::Complete) => {
                        debug!(%direction, "remote reported end of data");
                        signals.report(LoadStatus::Complete);
                        break;
                    }
                    Err(err) => {
                        warn!(%direction, error = %err, "remote fetch failed");
                        signals.report(LoadStatus::Error(err));
                        next_state = LoadState::Retry;
                    }
                }
            }
        })
    })
}

async fn fetch_with_retry<F, Fut>(
    hook: &F,
    state: LoadState,
    retry: &RetryConfig,
    direction: Direction,
) -> Result<LoadOutcome, FeedError>
where
    F: Fn(LoadState) -> Fut,
    Fut: Future<Output = Result<LoadOutcome, FeedError>>,
{
    let mut attempt = 0;
    let mut state = state;
    loop {
        match hook(state).await {
            Ok(outcome) => return Ok(outcome),
            Err(err) if attempt < retry.max_retries => {
                let delay = retry.delay_for_attempt(attempt);
                warn!(
                    %direction,
                    attempt = attempt + 1,
                    max_retries = retry.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "remote fetch failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
                state = LoadState::Retry;
            }
            Err(err) => return Err(err),
        }
    }
}

/// A remote data source.
///
/// `register` is called once per generation with the generation's initial
/// position and page size.
pub trait RemoteSource: Send + Sync {
    fn register(&self, hooks: &mut RemoteHooks, initial_position: u64, page_size: usize);
}

/// Shared handle to a remote source.
pub type SharedRemoteSource = Arc<dyn RemoteSource>;

/// A remote source that never loads anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyRemoteSource;

impl RemoteSource for EmptyRemoteSource {
    fn register(&self, _hooks: &mut RemoteHooks, _initial_position: u64, _page_size: usize) {}
}

// ── Coordinator ─────────────────────────────────────────────────────

/// Window movement produced by a completed refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Recentre {
    /// Window the refresh was requested for.
    pub(crate) from: LoadWindow,
    /// Window to serve next.
    pub(crate) to: LoadWindow,
}

impl Recentre {
    /// Apply the refresh's position shift to `position`.
    pub(crate) fn shift(&self, position: u64) -> u64 {
        let delta = self.to.start as i64 - self.from.start as i64;
        (position as i64).saturating_add(delta).max(0) as u64
    }
}

/// Refresh rendezvous between [`RemoteCoordinator::refresh`] and the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RefreshSlot {
    Idle,
    /// A refresh hook is running.
    Pending,
    /// Recentred window waiting to be consumed.
    Ready(Recentre),
}

struct Subscription {
    signal_tx: mpsc::Sender<()>,
    token: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Subscriptions {
    before: Option<Subscription>,
    after: Option<Subscription>,
}

impl Subscriptions {
    fn slot(&mut self, direction: Direction) -> &mut Option<Subscription> {
        match direction {
            Direction::Before => &mut self.before,
            Direction::After => &mut self.after,
        }
    }
}

/// Manages remote subscriptions for one generation.
pub struct RemoteCoordinator {
    before: Option<BoundaryHook>,
    after: Option<BoundaryHook>,
    refresh_hook: Option<RefreshHook>,
    subscriptions: Mutex<Subscriptions>,
    refresh_lock: Mutex<()>,
    slot: watch::Sender<RefreshSlot>,
    status: StatusSender,
    token: CancellationToken,
}

impl RemoteCoordinator {
    /// Create a coordinator whose subscriptions stop when `token` is
    /// cancelled. Call [`start`](Self::start) to launch them.
    pub fn new(hooks: RemoteHooks, token: CancellationToken) -> Self {
        Self::with_status(hooks, token, status_channel())
    }

    pub(crate) fn with_status(hooks: RemoteHooks, token: CancellationToken, status: StatusSender) -> Self {
        Self {
            before: hooks.before,
            after: hooks.after,
            refresh_hook: hooks.refresh,
            subscriptions: Mutex::new(Subscriptions::default()),
            refresh_lock: Mutex::new(()),
            slot: watch::Sender::new(RefreshSlot::Idle),
            status,
            token,
        }
    }

    pub fn load_states(&self) -> watch::Receiver<LoadStates> {
        self.status.subscribe()
    }

    /// Launch both boundary subscriptions with [`LoadState::Initial`].
    pub async fn start(&self) {
        self.resubscribe(LoadState::Initial).await;
    }

    /// Signal the before boundary. Ignored without a hook or once the
    /// subscription has finished.
    pub async fn load_before(&self) {
        self.signal(Direction::Before).await;
    }

    /// Signal the after boundary.
    pub async fn load_after(&self) {
        self.signal(Direction::After).await;
    }

    async fn signal(&self, direction: Direction) {
        let tx = {
            let mut subscriptions = self.subscriptions.lock().await;
            subscriptions
                .slot(direction)
                .as_ref()
                .map(|s| s.signal_tx.clone())
        };
        let Some(tx) = tx else {
            trace!(%direction, "no remote hook; signal ignored");
            return;
        };
        if tx.send(()).await.is_err() {
            trace!(%direction, "remote subscription closed; signal ignored");
        }
    }

    /// Cancel and join the current subscriptions, then start new ones.
    async fn resubscribe(&self, state: LoadState) {
        let mut subscriptions = self.subscriptions.lock().await;
        for direction in [Direction::Before, Direction::After] {
            if let Some(old) = subscriptions.slot(direction).take() {
                old.token.cancel();
                if let Err(err) = old.task.await {
                    debug!(%direction, error = %err, "remote subscription ended abnormally");
                }
            }
        }
        if self.token.is_cancelled() {
            return;
        }
        for direction in [Direction::Before, Direction::After] {
            let hook = match direction {
                Direction::Before => self.before.as_ref(),
                Direction::After => self.after.as_ref(),
            };
            if let Some(hook) = hook {
                self.set_status(direction, LoadStatus::Idle);
                *subscriptions.slot(direction) = Some(self.subscribe(direction, hook, state));
            }
        }
        debug!(?state, "remote subscriptions started");
    }

    fn subscribe(&self, direction: Direction, hook: &BoundaryHook, state: LoadState) -> Subscription {
        let (signal_tx, signal_rx) = mpsc::channel(1);
        let token = self.token.child_token();
        let run = hook(
            state,
            BoundarySignals {
                direction,
                signals: signal_rx,
                status: Arc::clone(&self.status),
            },
        );
        let cancel = token.clone();
        let status = Arc::clone(&self.status);
        let task = tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    trace!(%direction, ?state, "remote subscription cancelled");
                }
                _ = run => {
                    // A finished hook means the direction has no more data.
                    status.send_modify(|states| states.set(direction, LoadStatus::Complete));
                }
            }
        });
        Subscription {
            signal_tx,
            token,
            task,
        }
    }

    fn set_status(&self, direction: Direction, status: LoadStatus) {
        self.status.send_modify(|states| states.set(direction, status));
    }

    fn set_refresh_status(&self, status: LoadStatus) {
        self.status.send_modify(|states| states.refresh = status);
    }

    /// Run the refresh protocol for `window`.
    ///
    /// Only one refresh runs at a time, and a refresh does not start until
    /// the previous one's recentred window has been consumed. On failure the
    /// slot is cleared and the previous window stays in effect.
    pub async fn refresh(&self, window: LoadWindow) -> Result<(), FeedError> {
        let Some(hook) = self.refresh_hook.clone() else {
            debug!("no refresh hook registered; refresh ignored");
            return Ok(());
        };
        if self.token.is_cancelled() {
            return Err(FeedError::Closed);
        }
        let _in_flight = self.refresh_lock.lock().await;

        let mut slot = self.slot.subscribe();
        tokio::select! {
            biased;
            _ = self.token.cancelled() => return Err(FeedError::Closed),
            idle = slot.wait_for(|s| *s == RefreshSlot::Idle) => {
                idle.map_err(|_| FeedError::Closed)?;
            }
        }
        let mut pending = PendingRefresh::arm(&self.slot);

        info!(%window, "refresh started");
        self.resubscribe(LoadState::Refresh).await;
        self.set_refresh_status(LoadStatus::Loading);

        let result = tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(FeedError::Closed),
            result = hook(window) => result,
        };
        match result {
            Ok(new_start) => {
                let refreshed = LoadWindow::new(new_start, window.size);
                pending.resolve(Recentre {
                    from: window,
                    to: refreshed,
                });
                self.set_refresh_status(LoadStatus::Idle);
                debug!(%refreshed, "refresh complete");
                Ok(())
            }
            Err(err) => {
                drop(pending);
                warn!(error = %err, "refresh failed");
                self.set_refresh_status(LoadStatus::Error(err.clone()));
                Err(match err {
                    FeedError::Refresh(_) | FeedError::Closed => err,
                    other => FeedError::Refresh(other.to_string()),
                })
            }
        }
    }

    pub(crate) fn refresh_slot(&self) -> watch::Receiver<RefreshSlot> {
        self.slot.subscribe()
    }

    /// Consume the result of a completed refresh.
    pub(crate) fn take_recentre(&self) -> Option<Recentre> {
        let mut taken = None;
        self.slot.send_if_modified(|slot| match *slot {
            RefreshSlot::Ready(recentre) => {
                taken = Some(recentre);
                *slot = RefreshSlot::Idle;
                true
            }
            _ => false,
        });
        taken
    }
}

impl Drop for RemoteCoordinator {
    fn drop(&mut self) {
        let subscriptions = self.subscriptions.get_mut();
        for subscription in [subscriptions.before.take(), subscriptions.after.take()]
            .into_iter()
            .flatten()
        {
            subscription.token.cancel();
            subscription.task.abort();
        }
    }
}

/// Marks the refresh slot pending; clears it again unless resolved.
struct PendingRefresh<'a> {
    slot: &'a watch::Sender<RefreshSlot>,
    resolved: bool,
}

impl<'a> PendingRefresh<'a> {
    fn arm(slot: &'a watch::Sender<RefreshSlot>) -> Self {
        slot.send_replace(RefreshSlot::Pending);
        Self {
            slot,
            resolved: false,
        }
    }

    fn resolve(&mut self, recentre: Recentre) {
        self.slot.send_replace(RefreshSlot::Ready(recentre));
        self.resolved = true;
    }
}

impl Drop for PendingRefresh<'_> {
    fn drop(&mut self) {
        if !self.resolved {
            self.slot.send_if_modified(|slot| {
                if *slot == RefreshSlot::Pending {
                    *slot = RefreshSlot::Idle;
                    true
                } else {
                    false
                }
            });
        }
    }
}
