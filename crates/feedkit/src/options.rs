//! Feed configuration.
//!
//! [`FeedOptions`] controls page sizes, prefetch distance and the size of the
//! first load of each generation. Only `page_size` is required; the other
//! sizes derive from it.
//!
//! ```
//! use feedkit::options::{FeedOptions, ItemOrder};
//!
//! let options = FeedOptions::new(3)
//!     .with_initial_load_size(3)
//!     .with_prefetch_distance(0)
//!     .with_item_order(ItemOrder::Descending);
//! assert_eq!(options.page_size, 3);
//! ```
//!
//! Options can also be loaded from JSON, where omitted sizes follow the same
//! derivation rules:
//!
//! ```
//! use feedkit::options::FeedOptions;
//!
//! let options = FeedOptions::from_json_str(r#"{"page_size": 10}"#).unwrap();
//! assert_eq!(options.prefetch_distance, 10);
//! assert_eq!(options.initial_load_size, 30);
//! ```

use std::path::Path;

use serde::Deserialize;

use crate::error::FeedError;
use crate::retry::RetryConfig;

/// Default number of items fetched per boundary page.
pub const DEFAULT_PAGE_SIZE: usize = 20;

/// Order of items in the dataset relative to the remote source's natural
/// order. Decides which boundary wins a tie after a refresh recentres the
/// window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemOrder {
    /// Newer items append. Ties resolve toward the end.
    #[default]
    Ascending,
    /// Newer items prepend. Ties resolve toward the start.
    Descending,
}

/// Configuration for a [`Feed`](crate::feed::Feed).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawFeedOptions")]
pub struct FeedOptions {
    /// Items requested from the local source per boundary page.
    pub page_size: usize,
    /// Extra margin on each side of the viewport that should stay loaded.
    pub prefetch_distance: usize,
    /// Items read for the first load of each window-serving scope.
    pub initial_load_size: usize,
    /// Tie-break policy for refresh recentring.
    pub item_order: ItemOrder,
    /// Automatic retry of failing remote boundary hooks.
    pub retry: RetryConfig,
}

impl Default for FeedOptions {
    fn default() -> Self {
        Self::new(DEFAULT_PAGE_SIZE)
    }
}

impl FeedOptions {
    /// Options for `page_size`, with prefetch of one page and an initial
    /// load of three pages.
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size,
            prefetch_distance: page_size,
            initial_load_size: page_size * 3,
            item_order: ItemOrder::Ascending,
            retry: RetryConfig::default(),
        }
    }

    pub fn with_prefetch_distance(mut self, distance: usize) -> Self {
        self.prefetch_distance = distance;
        self
    }

    pub fn with_initial_load_size(mut self, size: usize) -> Self {
        self.initial_load_size = size;
        self
    }

    pub fn with_item_order(mut self, order: ItemOrder) -> Self {
        self.item_order = order;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Prefetch distance used for viewport windows. Never zero, so a
    /// viewport that touches the loaded edge still counts as intruding.
    pub fn effective_prefetch(&self) -> usize {
        self.prefetch_distance.max(1)
    }

    pub fn validate(&self) -> Result<(), FeedError> {
        if self.page_size == 0 {
            return Err(FeedError::InvalidOptions("page_size must be > 0".into()));
        }
        if self.initial_load_size == 0 {
            return Err(FeedError::InvalidOptions(
                "initial_load_size must be > 0".into(),
            ));
        }
        if self.retry.multiplier < 1.0 {
            return Err(FeedError::InvalidOptions(
                "retry.multiplier must be >= 1.0".into(),
            ));
        }
        Ok(())
    }

    /// Parse and validate options from a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, FeedError> {
        let options: FeedOptions = serde_json::from_str(json)?;
        options.validate()?;
        Ok(options)
    }

    /// Load options from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, FeedError> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            FeedError::Config(format!("reading {}: {e}", path.as_ref().display()))
        })?;
        Self::from_json_str(&text)
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawFeedOptions {
    #[serde(default)]
    page_size: Option<usize>,
    #[serde(default)]
    prefetch_distance: Option<usize>,
    #[serde(default)]
    initial_load_size: Option<usize>,
    #[serde(default)]
    item_order: ItemOrder,
    #[serde(default)]
    retry: RetryConfig,
}

impl TryFrom<RawFeedOptions> for FeedOptions {
    type Error = String;

    fn try_from(raw: RawFeedOptions) -> Result<Self, Self::Error> {
        let page_size = raw.page_size.unwrap_or(DEFAULT_PAGE_SIZE);
        if page_size == 0 {
            return Err("page_size must be > 0".into());
        }
        Ok(Self {
            page_size,
            prefetch_distance: raw.prefetch_distance.unwrap_or(page_size),
            initial_load_size: raw.initial_load_size.unwrap_or(page_size * 3),
            item_order: raw.item_order,
            retry: raw.retry,
        })
    }
}
