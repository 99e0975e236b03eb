//! Error taxonomy for feeds.
//!
//! Remote failures are recoverable and stay local to their direction (or to
//! the pending refresh). Local-source failures are fatal to the generation
//! that observed them. Cancellation is never an error: tasks that observe it
//! unwind silently.

use thiserror::Error;

/// Errors produced by the feed engine and its collaborators.
///
/// `Clone` so that the latest error for a direction can be published on a
/// [`watch`](tokio::sync::watch) channel alongside the other load states.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeedError {
    #[error("invalid load window: {0}")]
    InvalidWindow(String),
    #[error("invalid feed options: {0}")]
    InvalidOptions(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("local source read failed at position {position} (count {count}): {message}")]
    LocalRead {
        position: u64,
        count: usize,
        message: String,
    },
    #[error("remote fetch failed: {0}")]
    Remote(String),
    #[error("refresh failed: {0}")]
    Refresh(String),
    #[error("full refresh was abandoned before its refresh action ran")]
    RefreshCancelled,
    #[error("feed closed")]
    Closed,
}

impl FeedError {
    /// Convenience constructor for remote hook failures.
    pub fn remote(message: impl Into<String>) -> Self {
        Self::Remote(message.into())
    }

    /// Wrap an arbitrary local-source failure with the range being read.
    pub fn local_read(position: u64, count: usize, message: impl Into<String>) -> Self {
        Self::LocalRead {
            position,
            count,
            message: message.into(),
        }
    }

    /// Whether this error ends the generation that produced it.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::LocalRead { .. } | Self::Closed)
    }
}

impl From<std::io::Error> for FeedError {
    fn from(err: std::io::Error) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<serde_json::Error> for FeedError {
    fn from(err: serde_json::Error) -> Self {
        Self::Config(err.to_string())
    }
}
