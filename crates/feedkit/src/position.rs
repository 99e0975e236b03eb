//! Persisted scroll positions.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::warn;

use crate::source::LoadFuture;

/// Remembers where the consumer was scrolled to.
///
/// `load(true)` is asked when a generation starts after a full refresh;
/// stores that want a refreshed feed to open at the top return 0 there.
pub trait ScrollPositionStore: Send + Sync {
    fn load(&self, refresh: bool) -> LoadFuture<'_, u64>;
    fn save(&self, position: u64) -> LoadFuture<'_, ()>;
}

/// A store that always starts at one position and keeps the last save in
/// memory.
#[derive(Debug, Default)]
pub struct FixedScrollPositionStore {
    position: AtomicU64,
}

impl FixedScrollPositionStore {
    pub fn new(position: u64) -> Self {
        Self {
            position: AtomicU64::new(position),
        }
    }

    pub fn position(&self) -> u64 {
        self.position.load(Ordering::SeqCst)
    }
}

impl ScrollPositionStore for FixedScrollPositionStore {
    fn load(&self, _refresh: bool) -> LoadFuture<'_, u64> {
        let position = self.position();
        Box::pin(async move { Ok(position) })
    }

    fn save(&self, position: u64) -> LoadFuture<'_, ()> {
        self.position.store(position, Ordering::SeqCst);
        Box::pin(async { Ok(()) })
    }
}

/// Read the starting offset from `store`, falling back to 0 when it fails.
pub async fn initial_offset(store: &dyn ScrollPositionStore, refresh: bool) -> u64 {
    match store.load(refresh).await {
        Ok(position) => position,
        Err(err) => {
            warn!(error = %err, refresh, "scroll position unavailable; starting at 0");
            0
        }
    }
}
