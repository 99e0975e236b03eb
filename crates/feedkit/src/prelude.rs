//! Convenience re-exports for common `feedkit` types.
//!
//! ```ignore
//! use feedkit::prelude::*;
//! ```
//!
//! Loader internals ([`BoundaryLoader`](crate::loader::BoundaryLoader)) and
//! the trace layer are left out; import those from their modules.

// ── Core types ──────────────────────────────────────────────────────
pub use crate::error::FeedError;
pub use crate::options::{FeedOptions, ItemOrder};
pub use crate::retry::RetryConfig;
pub use crate::window::{LoadWindow, compute_window};

// ── Sources ─────────────────────────────────────────────────────────
pub use crate::remote::{
    BoundarySignals, EmptyRemoteSource, LoadOutcome, LoadState, LoadStates, LoadStatus,
    RemoteHooks, RemoteSource, SharedRemoteSource,
};
pub use crate::source::{
    FnLocalSource, LoadFuture, LocalSnapshots, LocalSource, SharedLocalSource, VecSource,
    local_source_of, single_snapshot,
};

// ── Feeds ───────────────────────────────────────────────────────────
pub use crate::feed::{Callbacks, Feed, FeedBuilder, FeedData, FeedEventKind, FeedStreamExt, feed};
pub use crate::list::{FeedEntry, FeedList};
pub use crate::pager::{
    FeedConnection, FeedPager, InitialPosition, ItemKey, RefreshAction, StartPolicy,
};
pub use crate::position::{FixedScrollPositionStore, ScrollPositionStore};

// ── Test doubles ────────────────────────────────────────────────────
pub use crate::testing::{InMemoryDataStore, InMemoryRemoteSource, InMemoryScrollPositionStore};
