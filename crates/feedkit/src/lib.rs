//! Windowed, bidirectional incremental loading for ordered feeds.
//!
//! `feedkit` keeps a bounded window of items around what a consumer is
//! looking at. Items come from a local cache addressed by absolute position
//! ([`LocalSource`](source::LocalSource)); a remote source fills the cache
//! when either edge of the dataset is reached and can refresh the cache in
//! place around the current window. The consumer sees one stream of
//! mutation events: `Initial` replaces the list, `Prepend` and `Append` grow
//! it at either end.
//!
//! # Getting started
//!
//! ```ignore
//! use std::sync::Arc;
//!
//! use feedkit::prelude::*;
//! use futures::StreamExt;
//!
//! let store = InMemoryDataStore::with_items((0..100).collect::<Vec<u32>>());
//! let mut feed = feed(store.snapshots(), Arc::new(EmptyRemoteSource), FeedOptions::new(20))?;
//!
//! let mut list = FeedList::new();
//! while let Some(data) = feed.next().await {
//!     list.submit(data?);
//!     list.update_visible_window(list.len().saturating_sub(5), 5);
//! }
//! ```
//!
//! # Where to find things
//!
//! - **Window arithmetic:** [`LoadWindow`](window::LoadWindow) and
//!   [`compute_window`](window::compute_window).
//! - **Local data:** the [`LocalSource`](source::LocalSource) trait and the
//!   [`LocalSnapshots`](source::LocalSnapshots) stream the engine restarts
//!   on.
//! - **Remote data:** implement [`RemoteSource`](remote::RemoteSource) and
//!   register hooks on [`RemoteHooks`](remote::RemoteHooks). Load progress
//!   is published as [`LoadStates`](remote::LoadStates).
//! - **One generation:** [`Feed`](feed::Feed), built with
//!   [`FeedBuilder`](feed::FeedBuilder) or [`feed()`](feed::feed).
//! - **Full refresh and initial position:** [`FeedPager`](pager::FeedPager)
//!   with a [`StartPolicy`](pager::StartPolicy), controlled through
//!   [`FeedConnection`](pager::FeedConnection).
//! - **Consumer list:** [`FeedList`](list::FeedList).
//! - **Tests and demos:** the in-memory doubles in [`testing`].
//! - **Logs:** [`FeedTraceLayer`](trace::FeedTraceLayer).

pub mod error;
pub mod feed;
pub mod list;
pub mod loader;
pub mod options;
pub mod pager;
pub mod position;
pub mod prelude;
pub mod remote;
pub mod retry;
pub mod source;
pub mod testing;
pub mod trace;
pub mod window;

mod scope;

pub use error::FeedError;
pub use feed::{Feed, FeedData, FeedEventKind, feed};
pub use options::FeedOptions;
pub use window::LoadWindow;
