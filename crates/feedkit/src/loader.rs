//! Boundary loading from the local source.
//!
//! A [`BoundaryLoader`] tracks the range of positions currently backed by
//! emitted items and decides, for every new [`LoadWindow`], whether the
//! window has reached the start or end of that range. Each direction has a
//! signal channel drained by its own consumption loop, so at most one local
//! read per direction is ever outstanding while the two directions proceed
//! independently.
//!
//! ```text
//! update_visible_window ──▶ request_if_needed(window)
//!                                │ (direction mutex)
//!                                ▼
//!                     signal ──▶ consume(direction, sink) ──▶ sink.load_page()
//! ```
//!
//! Every read-modify-write of a direction's bound and `finished` flag
//! happens under that direction's mutex. The consumption loop holds the
//! mutex for the whole page read, so a viewport update racing with a
//! completing load always evaluates against the updated bound.

use std::fmt;

use tokio::sync::{Mutex, mpsc};
use tracing::{debug, trace};

use crate::error::FeedError;
use crate::options::ItemOrder;
use crate::source::LoadFuture;
use crate::window::LoadWindow;

/// A boundary of the loaded range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Toward position 0 (prepend).
    Before,
    /// Away from position 0 (append).
    After,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Before => f.write_str("before"),
            Self::After => f.write_str("after"),
        }
    }
}

/// Positions currently backed by loaded data: `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadRange {
    pub start: u64,
    pub end: u64,
}

/// Receives the page reads decided by a [`BoundaryLoader`].
///
/// `load_page` reads `count` items at `position`, emits them, and returns
/// how many items the local source actually produced.
pub trait PageSink: Send + Sync {
    fn load_page(&self, direction: Direction, position: u64, count: usize) -> LoadFuture<'_, usize>;
}

struct DirectionState {
    /// `start` of the loaded range for `Before`, `end` for `After`.
    bound: u64,
    finished: bool,
}

struct DirectionLoader {
    state: Mutex<DirectionState>,
    signal_tx: mpsc::Sender<()>,
    signal_rx: Mutex<Option<mpsc::Receiver<()>>>,
}

impl DirectionLoader {
    fn new(bound: u64, finished: bool) -> Self {
        // One slot: a pending signal already covers any later request.
        let (signal_tx, signal_rx) = mpsc::channel(1);
        Self {
            state: Mutex::new(DirectionState { bound, finished }),
            signal_tx,
            signal_rx: Mutex::new(Some(signal_rx)),
        }
    }
}

/// Per-scope boundary state machine for both directions.
pub struct BoundaryLoader {
    page_size: usize,
    before: DirectionLoader,
    after: DirectionLoader,
}

impl BoundaryLoader {
    /// Create a loader for the range produced by an initial read.
    ///
    /// `load_before` / `load_after` are `false` when that direction is
    /// already known to be at the edge of the local data.
    pub fn new(range: LoadRange, page_size: usize, load_before: bool, load_after: bool) -> Self {
        Self {
            page_size,
            before: DirectionLoader::new(range.start, !load_before),
            after: DirectionLoader::new(range.end, !load_after),
        }
    }

    fn direction(&self, direction: Direction) -> &DirectionLoader {
        match direction {
            Direction::Before => &self.before,
            Direction::After => &self.after,
        }
    }

    /// Current loaded range (waits for in-flight page reads).
    pub async fn load_range(&self) -> LoadRange {
        let start = self.before.state.lock().await.bound;
        let end = self.after.state.lock().await.bound;
        LoadRange { start, end }
    }

    pub async fn is_finished(&self, direction: Direction) -> bool {
        self.direction(direction).state.lock().await.finished
    }

    /// Signal each direction whose edge the window has reached.
    pub async fn request_if_needed(&self, window: LoadWindow) {
        self.request(Direction::Before, window).await;
        self.request(Direction::After, window).await;
    }

    /// Evaluate a single direction against `window`. Returns whether the
    /// window reached that boundary.
    pub async fn request(&self, direction: Direction, window: LoadWindow) -> bool {
        let loader = self.direction(direction);
        let state = loader.state.lock().await;
        if state.finished {
            return false;
        }
        let intrudes = match direction {
            Direction::Before => window.start <= state.bound,
            Direction::After => window.end() >= state.bound,
        };
        if !intrudes {
            return false;
        }
        match loader.signal_tx.try_send(()) {
            Ok(()) => trace!(%direction, %window, bound = state.bound, "boundary signalled"),
            Err(mpsc::error::TrySendError::Full(())) => {
                trace!(%direction, "boundary signal already pending")
            }
            Err(mpsc::error::TrySendError::Closed(())) => {
                trace!(%direction, "boundary consumer gone")
            }
        }
        true
    }

    /// Run the consumption loop for `direction` until it finishes.
    ///
    /// Returns `Ok(())` once the direction reached the edge of the local
    /// data (the caller then asks the remote source for more). Local read
    /// errors are returned as-is. May only be called once per direction.
    pub async fn consume(&self, direction: Direction, sink: &dyn PageSink) -> Result<(), FeedError> {
        let loader = self.direction(direction);
        let Some(mut signals) = loader.signal_rx.lock().await.take() else {
            return Ok(());
        };
        if loader.state.lock().await.finished {
            return Ok(());
        }
        while signals.recv().await.is_some() {
            let mut state = loader.state.lock().await;
            if state.finished {
                break;
            }
            match direction {
                Direction::Before => {
                    let new_start = state.bound.saturating_sub(self.page_size as u64);
                    let count = (state.bound - new_start) as usize;
                    if count > 0 {
                        debug!(%direction, position = new_start, count, "loading page");
                        sink.load_page(direction, new_start, count).await?;
                        state.bound = new_start;
                    }
                    if new_start == 0 {
                        state.finished = true;
                    }
                }
                Direction::After => {
                    let position = state.bound;
                    debug!(%direction, position, count = self.page_size, "loading page");
                    let loaded = sink.load_page(direction, position, self.page_size).await?;
                    state.bound += loaded as u64;
                    if loaded < self.page_size {
                        state.finished = true;
                    }
                }
            }
            if state.finished {
                debug!(%direction, bound = state.bound, "local data exhausted");
                break;
            }
        }
        Ok(())
    }
}

/// Which boundary to serve first after a refresh recentred the window on
/// `anchor`: the nearer edge of `range`, with ties resolved by `order`.
pub fn preferred_direction(anchor: u64, range: LoadRange, order: ItemOrder) -> Direction {
    let to_start = anchor.saturating_sub(range.start);
    let to_end = range.end.saturating_sub(anchor);
    match to_start.cmp(&to_end) {
        std::cmp::Ordering::Less => Direction::Before,
        std::cmp::Ordering::Greater => Direction::After,
        std::cmp::Ordering::Equal => match order {
            ItemOrder::Ascending => Direction::After,
            ItemOrder::Descending => Direction::Before,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    /// Records page requests against a fixed dataset of `total` items.
    struct RecordingSink {
        total: u64,
        calls: StdMutex<Vec<(Direction, u64, usize)>>,
    }

    impl RecordingSink {
        fn new(total: u64) -> Arc<Self> {
            Arc::new(Self {
                total,
                calls: StdMutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<(Direction, u64, usize)> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl PageSink for RecordingSink {
        fn load_page(&self, direction: Direction, position: u64, count: usize) -> LoadFuture<'_, usize> {
            self.calls.lock().unwrap().push((direction, position, count));
            let available = self.total.saturating_sub(position).min(count as u64) as usize;
            Box::pin(async move { Ok(available) })
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    fn spawn_consumer(
        loader: &Arc<BoundaryLoader>,
        sink: &Arc<RecordingSink>,
        direction: Direction,
    ) -> tokio::task::JoinHandle<Result<(), FeedError>> {
        let loader = Arc::clone(loader);
        let sink = Arc::clone(sink);
        tokio::spawn(async move { loader.consume(direction, &*sink).await })
    }

    #[tokio::test]
    async fn after_loads_next_page_when_window_reaches_end() {
        let loader = Arc::new(BoundaryLoader::new(LoadRange { start: 0, end: 3 }, 3, false, true));
        let sink = RecordingSink::new(5);
        let handle = spawn_consumer(&loader, &sink, Direction::After);

        loader.request_if_needed(LoadWindow::new(0, 9)).await;
        handle.await.unwrap().unwrap();

        assert_eq!(sink.calls(), vec![(Direction::After, 3, 3)]);
        assert_eq!(loader.load_range().await, LoadRange { start: 0, end: 5 });
        assert!(loader.is_finished(Direction::After).await);
    }

    #[tokio::test]
    async fn window_inside_range_requests_nothing() {
        let loader = Arc::new(BoundaryLoader::new(LoadRange { start: 10, end: 20 }, 5, true, true));
        let sink = RecordingSink::new(100);
        let before = spawn_consumer(&loader, &sink, Direction::Before);
        let after = spawn_consumer(&loader, &sink, Direction::After);

        loader.request_if_needed(LoadWindow::new(11, 8)).await;
        settle().await;

        assert!(sink.calls().is_empty());
        before.abort();
        after.abort();
    }

    #[tokio::test]
    async fn before_clamps_at_zero_and_finishes() {
        let loader = Arc::new(BoundaryLoader::new(LoadRange { start: 2, end: 4 }, 3, true, false));
        let sink = RecordingSink::new(4);
        let handle = spawn_consumer(&loader, &sink, Direction::Before);

        loader.request_if_needed(LoadWindow::new(1, 5)).await;
        handle.await.unwrap().unwrap();

        assert_eq!(sink.calls(), vec![(Direction::Before, 0, 2)]);
        assert_eq!(loader.load_range().await.start, 0);
        assert!(loader.is_finished(Direction::Before).await);
    }

    #[tokio::test]
    async fn finished_direction_ignores_signals() {
        let loader = BoundaryLoader::new(LoadRange { start: 0, end: 3 }, 3, false, true);
        let sink = RecordingSink::new(3);
        // Starting at 0 means the before direction is pre-finished.
        loader.request_if_needed(LoadWindow::new(0, 2)).await;
        loader.consume(Direction::Before, &*sink).await.unwrap();
        assert!(sink.calls().is_empty());
    }

    #[tokio::test]
    async fn repeated_requests_coalesce_into_one_page() {
        let loader = Arc::new(BoundaryLoader::new(LoadRange { start: 0, end: 10 }, 10, false, true));
        let sink = RecordingSink::new(1000);

        // Queue several requests before the consumer starts.
        for _ in 0..5 {
            loader.request_if_needed(LoadWindow::new(5, 5)).await;
        }
        let handle = spawn_consumer(&loader, &sink, Direction::After);
        settle().await;

        assert_eq!(sink.calls(), vec![(Direction::After, 10, 10)]);
        // Same window again no longer reaches the new end.
        loader.request_if_needed(LoadWindow::new(5, 5)).await;
        settle().await;
        assert_eq!(sink.calls().len(), 1);
        handle.abort();
    }

    #[tokio::test]
    async fn directions_progress_independently() {
        let loader = Arc::new(BoundaryLoader::new(LoadRange { start: 50, end: 60 }, 10, true, true));
        let sink = RecordingSink::new(1000);
        let before = spawn_consumer(&loader, &sink, Direction::Before);
        let after = spawn_consumer(&loader, &sink, Direction::After);

        loader.request_if_needed(LoadWindow::new(45, 20)).await;
        settle().await;

        let mut calls = sink.calls();
        calls.sort_by_key(|(_, position, _)| *position);
        assert_eq!(
            calls,
            vec![(Direction::Before, 40, 10), (Direction::After, 60, 10)]
        );
        assert_eq!(loader.load_range().await, LoadRange { start: 40, end: 70 });
        before.abort();
        after.abort();
    }

    #[tokio::test]
    async fn failed_read_leaves_bound_untouched() {
        struct FailingSink;
        impl PageSink for FailingSink {
            fn load_page(&self, _: Direction, position: u64, count: usize) -> LoadFuture<'_, usize> {
                Box::pin(async move { Err(FeedError::local_read(position, count, "io")) })
            }
        }

        let loader = BoundaryLoader::new(LoadRange { start: 0, end: 5 }, 5, false, true);
        loader.request_if_needed(LoadWindow::new(0, 6)).await;
        let err = loader.consume(Direction::After, &FailingSink).await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(loader.load_range().await.end, 5);
    }

    #[tokio::test]
    async fn single_direction_request_leaves_other_alone() {
        let loader = BoundaryLoader::new(LoadRange { start: 10, end: 20 }, 5, true, true);
        assert!(loader.request(Direction::After, LoadWindow::new(5, 20)).await);
        assert!(!loader.request(Direction::After, LoadWindow::new(12, 2)).await);
        assert!(!BoundaryLoader::new(LoadRange { start: 0, end: 3 }, 5, false, false)
            .request(Direction::Before, LoadWindow::new(0, 3))
            .await);
    }

    #[test]
    fn preferred_direction_picks_nearer_edge() {
        let range = LoadRange { start: 10, end: 30 };
        assert_eq!(preferred_direction(12, range, ItemOrder::Ascending), Direction::Before);
        assert_eq!(preferred_direction(28, range, ItemOrder::Descending), Direction::After);
    }

    #[test]
    fn preferred_direction_tie_follows_item_order() {
        let range = LoadRange { start: 10, end: 30 };
        assert_eq!(preferred_direction(20, range, ItemOrder::Ascending), Direction::After);
        assert_eq!(preferred_direction(20, range, ItemOrder::Descending), Direction::Before);
    }
}
