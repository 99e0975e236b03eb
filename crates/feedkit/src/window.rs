//! Load window arithmetic.
//!
//! A [`LoadWindow`] is the half-open range of absolute positions the engine
//! intends to have loaded. It is recomputed from every viewport report with
//! [`compute_window`] and compared by value; a window that did not change
//! never triggers boundary work.

use std::fmt;

use crate::error::FeedError;

/// Half-open range `[start, start + size)` of item positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct LoadWindow {
    pub start: u64,
    pub size: usize,
}

impl LoadWindow {
    /// The empty window at position 0.
    pub const EMPTY: LoadWindow = LoadWindow { start: 0, size: 0 };

    pub fn new(start: u64, size: usize) -> Self {
        Self { start, size }
    }

    /// Build a window from signed values, rejecting negative components.
    pub fn checked(start: i64, size: i64) -> Result<Self, FeedError> {
        if size < 0 {
            return Err(FeedError::InvalidWindow(format!(
                "size must not be negative: {size}"
            )));
        }
        if start < 0 {
            return Err(FeedError::InvalidWindow(format!(
                "start must not be negative: {start}"
            )));
        }
        Ok(Self::new(start as u64, size as usize))
    }

    /// One past the last position in the window.
    pub fn end(&self) -> u64 {
        self.start + self.size as u64
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn contains(&self, position: u64) -> bool {
        position >= self.start && position < self.end()
    }
}

impl fmt::Display for LoadWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end())
    }
}

/// Compute the window for a viewport.
///
/// `starting_offset` is the absolute position of the consumer's list index
/// 0, `first_visible_position` and `visible_item_count` are relative to that
/// list. The window extends `prefetch_distance` on both sides of the visible
/// range. When the left margin would cross position 0 the start is clamped
/// and the clipped part of the margin is added to the size, so the right
/// edge keeps its full allowance.
pub fn compute_window(
    starting_offset: u64,
    first_visible_position: usize,
    visible_item_count: usize,
    prefetch_distance: usize,
) -> LoadWindow {
    let raw_start =
        starting_offset as i64 + first_visible_position as i64 - prefetch_distance as i64;
    let clamped_start = raw_start.max(0);
    let prefetch_at_start = (prefetch_distance as i64 + clamped_start - raw_start) as usize;
    LoadWindow {
        start: clamped_start as u64,
        size: visible_item_count + prefetch_at_start + prefetch_distance,
    }
}

/// Window loaded for a fresh generation: `initial_load_size` items centred
/// on `anchor`, clamped at position 0.
pub fn initial_window(anchor: u64, initial_load_size: usize) -> LoadWindow {
    LoadWindow {
        start: anchor.saturating_sub((initial_load_size / 2) as u64),
        size: initial_load_size,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn end_is_start_plus_size() {
        for (start, size) in [(0u64, 0usize), (0, 5), (17, 3), (1_000_000, 60)] {
            assert_eq!(LoadWindow::new(start, size).end(), start + size as u64);
        }
    }

    #[test]
    fn negative_size_is_rejected() {
        assert!(matches!(
            LoadWindow::checked(3, -1),
            Err(FeedError::InvalidWindow(_))
        ));
        assert!(LoadWindow::checked(-3, 1).is_err());
        assert_eq!(LoadWindow::checked(3, 2).unwrap(), LoadWindow::new(3, 2));
    }

    #[test]
    fn equality_is_by_start_and_size() {
        assert_eq!(LoadWindow::new(4, 2), LoadWindow::new(4, 2));
        assert_ne!(LoadWindow::new(4, 2), LoadWindow::new(4, 3));
        assert_ne!(LoadWindow::new(4, 2), LoadWindow::new(5, 2));
    }

    #[test]
    fn window_away_from_zero_is_symmetric() {
        let w = compute_window(100, 10, 5, 3);
        assert_eq!(w, LoadWindow::new(107, 11));
        assert_eq!(w.end(), 118);
    }

    #[test]
    fn window_never_starts_negative() {
        for first in 0..10 {
            for prefetch in 0..10 {
                let w = compute_window(0, first, 4, prefetch);
                let raw = first as i64 - prefetch as i64;
                assert_eq!(w.start as i64, raw.max(0));
            }
        }
    }

    #[test]
    fn clipped_prefetch_is_folded_into_size() {
        for offset in 0..4u64 {
            for first in 0..6usize {
                for prefetch in 0..6usize {
                    let visible = 3;
                    let raw = offset as i64 + first as i64 - prefetch as i64;
                    let w = compute_window(offset, first, visible, prefetch);
                    if raw <= 0 {
                        let clipped = (-raw) as usize;
                        assert_eq!(w.start, 0);
                        assert_eq!(w.size, visible + 2 * prefetch + clipped);
                    } else {
                        assert_eq!(w.size, visible + 2 * prefetch);
                    }
                }
            }
        }
    }

    #[test]
    fn exactly_at_zero_gets_two_prefetch_margins() {
        let w = compute_window(0, 3, 3, 3);
        assert_eq!(w, LoadWindow::new(0, 9));
    }

    #[test]
    fn initial_window_centres_on_anchor() {
        assert_eq!(initial_window(50, 20), LoadWindow::new(40, 20));
        assert_eq!(initial_window(2, 3), LoadWindow::new(1, 3));
        assert_eq!(initial_window(3, 60), LoadWindow::new(0, 60));
    }

    #[test]
    fn display_is_half_open() {
        assert_eq!(LoadWindow::new(2, 3).to_string(), "[2, 5)");
    }
}
