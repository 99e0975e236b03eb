//! Consumer-side list that applies feed emissions.

use std::sync::Arc;

use tracing::trace;

use crate::error::FeedError;
use crate::feed::{Callbacks, FeedData, FeedEventKind};

/// One row of a [`FeedList`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEntry<T> {
    Item(T),
    Delete(T),
    Update { previous: T, current: T },
}

impl<T> FeedEntry<T> {
    /// The item to display: the current value, or the deleted one.
    pub fn item(&self) -> &T {
        match self {
            Self::Item(current) | Self::Update { current, .. } => current,
            Self::Delete(previous) => previous,
        }
    }
}

/// Materialized view of a feed.
///
/// [`submit`](Self::submit) applies each emission in order and remembers
/// its callbacks, so viewport reports always reach the serving pass that
/// produced the latest data.
pub struct FeedList<T> {
    entries: Vec<FeedEntry<T>>,
    callbacks: Option<Arc<dyn Callbacks>>,
    generation: Option<u64>,
}

impl<T> Default for FeedList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> FeedList<T> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            callbacks: None,
            generation: None,
        }
    }

    /// Apply one emission and return how the list changed.
    pub fn submit(&mut self, data: FeedData<T>) -> FeedEventKind {
        self.callbacks = Some(data.callbacks);
        self.generation = Some(data.generation);
        let entries = data.items.into_iter().map(FeedEntry::Item);
        match data.kind {
            FeedEventKind::Initial { .. } => {
                self.entries.clear();
                self.entries.extend(entries);
            }
            FeedEventKind::Prepend => {
                self.entries.splice(0..0, entries);
            }
            FeedEventKind::Append => self.entries.extend(entries),
        }
        data.kind
    }

    pub fn entries(&self) -> &[FeedEntry<T>] {
        &self.entries
    }

    pub fn items(&self) -> impl Iterator<Item = &T> {
        self.entries.iter().map(FeedEntry::item)
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.entries.get(index).map(FeedEntry::item)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Generation of the latest emission, if any.
    pub fn generation(&self) -> Option<u64> {
        self.generation
    }

    pub fn update_visible_window(&self, first_visible_position: usize, visible_item_count: usize) {
        match &self.callbacks {
            Some(callbacks) => {
                callbacks.update_visible_window(first_visible_position, visible_item_count)
            }
            None => trace!("viewport reported before the first emission"),
        }
    }

    /// Refresh in place. A list that has not received anything yet has
    /// nothing to refresh.
    pub async fn refresh(&self) -> Result<(), FeedError> {
        match &self.callbacks {
            Some(callbacks) => callbacks.refresh().await,
            None => Ok(()),
        }
    }
}
