//! Ack trackers bind message acknowledgement to persistable source
//! positions.
//!
//! A source reader requests a [`Bookmark`] slot before each fetch, fills
//! it with the driver's position descriptor, and tracks the resulting
//! message. When the message's outstanding acks drop to zero the tracker
//! decides whether (and when) to persist the bookmark, according to one of
//! four strategies selected by [`AckTrackerFactory`]:
//!
//! - **Instant**: each processed ack saves that message's position.
//! - **InstantBookmarkless**: window accounting only, nothing saved.
//! - **Consecutive**: out-of-order acks, positions saved in arrival order.
//! - **Batched**: positions handed to a callback in batches, by size,
//!   timeout, or shutdown.

mod bookmark;
mod tracker;

pub use bookmark::{Bookmark, BookmarkData, BookmarkRef};
pub use tracker::{AckTracker, AckedRecord, OnBatchAcked};

use std::sync::Arc;

/// Selects and builds the ack tracking strategy of a source.
#[derive(Clone)]
pub enum AckTrackerFactory {
    Instant,
    InstantBookmarkless,
    Consecutive,
    Batched {
        /// Flush an unfilled batch this many milliseconds after its first
        /// record. Non-positive means no timeout.
        timeout_ms: i64,
        batch_size: usize,
        on_batch_acked: OnBatchAcked,
    },
}

impl AckTrackerFactory {
    /// Build a tracker for a source whose window admits at most
    /// `window_size` outstanding messages.
    pub fn create(&self, window_size: usize) -> Arc<AckTracker> {
        match self {
            AckTrackerFactory::Instant => AckTracker::new_instant(),
            AckTrackerFactory::InstantBookmarkless => AckTracker::new_bookmarkless(),
            AckTrackerFactory::Consecutive => AckTracker::new_consecutive(window_size),
            AckTrackerFactory::Batched {
                timeout_ms,
                batch_size,
                on_batch_acked,
            } => AckTracker::new_batched(*timeout_ms, *batch_size, on_batch_acked.clone()),
        }
    }
}

impl std::fmt::Debug for AckTrackerFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Instant => f.write_str("Instant"),
            Self::InstantBookmarkless => f.write_str("InstantBookmarkless"),
            Self::Consecutive => f.write_str("Consecutive"),
            Self::Batched {
                timeout_ms,
                batch_size,
                ..
            } => f
                .debug_struct("Batched")
                .field("timeout_ms", timeout_ms)
                .field("batch_size", batch_size)
                .finish_non_exhaustive(),
        }
    }
}
