//! Local source abstraction.
//!
//! A [`LocalSource`] answers "give me `count` items starting at `position`"
//! from the local cache. Changes to the cache are announced by emitting a
//! new source on a [`LocalSnapshots`] stream; the engine restarts window
//! serving for every emission.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::stream::BoxStream;

use crate::error::FeedError;

/// Boxed future returned by the collaborator traits.
///
/// Type alias to keep trait signatures readable while staying dyn-compatible.
pub type LoadFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, FeedError>> + Send + 'a>>;

/// Read access to the local cache by absolute position.
///
/// Implementations may return fewer than `count` items only at the edge of
/// the dataset, and must tolerate overlapping reads.
pub trait LocalSource<T>: Send + Sync {
    fn load(&self, position: u64, count: usize) -> LoadFuture<'_, Vec<T>>;
}

/// Shared handle to a local source snapshot.
pub type SharedLocalSource<T> = Arc<dyn LocalSource<T>>;

/// Stream of local source snapshots. Emits once immediately and again each
/// time the backing storage changes shape.
pub type LocalSnapshots<T> = BoxStream<'static, SharedLocalSource<T>>;

/// A fixed in-memory list.
#[derive(Debug, Clone)]
pub struct VecSource<T> {
    items: Arc<Vec<T>>,
}

impl<T> VecSource<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self {
            items: Arc::new(items),
        }
    }
}

impl<T: Clone + Send + Sync> LocalSource<T> for VecSource<T> {
    fn load(&self, position: u64, count: usize) -> LoadFuture<'_, Vec<T>> {
        let page = slice_page(&self.items, position, count);
        Box::pin(async move { Ok(page) })
    }
}

/// Build a [`VecSource`] from anything iterable.
pub fn local_source_of<T, I>(items: I) -> VecSource<T>
where
    I: IntoIterator<Item = T>,
{
    VecSource::new(items.into_iter().collect())
}

/// Wrap a single unchanging source as a snapshot stream that emits once and
/// then stays open.
pub fn single_snapshot<T, S>(source: S) -> LocalSnapshots<T>
where
    T: 'static,
    S: LocalSource<T> + 'static,
{
    use futures::StreamExt;
    let shared: SharedLocalSource<T> = Arc::new(source);
    futures::stream::once(async move { shared })
        .chain(futures::stream::pending())
        .boxed()
}

/// A local source backed by a closure.
///
/// ```ignore
/// let source = FnLocalSource::new(move |position, count| {
///     let db = db.clone();
///     async move { db.items(position, count).await }
/// });
/// ```
pub struct FnLocalSource<F>(F);

impl<F> FnLocalSource<F> {
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<T, F, Fut> LocalSource<T> for FnLocalSource<F>
where
    F: Fn(u64, usize) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Vec<T>, FeedError>> + Send + 'static,
{
    fn load(&self, position: u64, count: usize) -> LoadFuture<'_, Vec<T>> {
        Box::pin((self.0)(position, count))
    }
}

/// Copy `count` items starting at `position` out of `items`.
pub(crate) fn slice_page<T: Clone>(items: &[T], position: u64, count: usize) -> Vec<T> {
    let start = usize::try_from(position).unwrap_or(usize::MAX).min(items.len());
    let end = start.saturating_add(count).min(items.len());
    items[start..end].to_vec()
}
