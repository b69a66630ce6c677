//! The in-flight log record and its lifecycle.
//!
//! A [`LogMessage`] is reference counted through a single packed atomic
//! word which also carries the count of outstanding acknowledgements and
//! two sticky outcome flags ([`cell::RefAckCell`]). Threads that process a
//! message start a [`refcache`] session so that their ref/ack traffic is
//! batched into one atomic update. Messages are shared copy-on-write:
//! [`MsgRef::clone_cow`] produces a writable twin whose acknowledgement is
//! chained back to the original.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

pub mod cell;
pub mod nv;
pub mod pri;
pub mod refcache;
pub mod tags;

mod msg;

pub use msg::{flags, LogMessage, MsgRef, Stamp, UnixTime};

/// Outcome of a message acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckType {
    /// The destination finished with the message.
    Processed,
    /// The destination is shutting down or draining; the message was not
    /// delivered and its position must not be committed.
    Suspended,
    /// The destination gave up on the message.
    Aborted,
}

/// Per-path-edge options that travel with a message through the pipeline.
#[derive(Debug, Clone, Copy)]
pub struct PathOptions {
    /// The consumer on this edge participates in acknowledgement.
    pub ack_needed: bool,
    /// The sender must not proceed until this message is acked.
    pub flow_control_requested: bool,
}

impl Default for PathOptions {
    fn default() -> Self {
        Self {
            ack_needed: true,
            flow_control_requested: false,
        }
    }
}

impl PathOptions {
    /// Options of an edge that takes no part in acknowledgement.
    pub const NO_ACK: PathOptions = PathOptions {
        ack_needed: false,
        flow_control_requested: false,
    };
}

/// Identifies the ack tracker record a tracked message belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckToken {
    pub tracker_id: u64,
    pub seq: u64,
}

/// Hook invoked when a message transitions from "acks pending" to "all
/// acks received", with the combined outcome.
pub type AckHook = Arc<dyn Fn(&MsgRef, AckType) + Send + Sync>;

/// Process-wide state threaded through message constructors: the host id,
/// the monotonically increasing receipt id, and the name/tag registries.
pub struct Context {
    host_id: AtomicU32,
    rcptid: AtomicU64,
    tz_offset_secs: i32,
    values: nv::Registry,
    tags: tags::Registry,
}

impl Context {
    pub fn new() -> Arc<Context> {
        let tz_offset_secs = time::UtcOffset::current_local_offset()
            .map(|offset| offset.whole_seconds())
            .unwrap_or(0);

        Arc::new(Context {
            host_id: AtomicU32::new(0),
            rcptid: AtomicU64::new(1),
            tz_offset_secs,
            values: nv::Registry::new(),
            tags: tags::Registry::new(),
        })
    }

    /// The process host id. Written once at boot, from the persist store.
    pub fn host_id(&self) -> u32 {
        self.host_id.load(Ordering::Relaxed)
    }

    pub fn set_host_id(&self, host_id: u32) {
        self.host_id.store(host_id, Ordering::Relaxed);
    }

    pub fn next_rcptid(&self) -> u64 {
        self.rcptid.fetch_add(1, Ordering::Relaxed)
    }

    pub fn tz_offset_secs(&self) -> i32 {
        self.tz_offset_secs
    }

    pub fn values(&self) -> &nv::Registry {
        &self.values
    }

    pub fn tags(&self) -> &tags::Registry {
        &self.tags
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid value name '{0}'")]
    InvalidValueName(String),
    #[error("tag id {0} exceeds the maximum of {max}", max = tags::MAX_TAG_ID)]
    TagOverflow(u16),
}

pub type Result<T> = std::result::Result<T, Error>;
