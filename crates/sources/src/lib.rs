//! Source-side flow of the pipeline: window-controlled posting, the
//! cooperative reader loop, and the consumer-side writer contract.
//!
//! A driver reads records through a [`proto::LogProtoServer`], turns them
//! into messages, and posts them through a [`LogSource`], which debits the
//! source window and binds each message to its ack tracker record. Acks
//! flow back from writers through the message's hook, refilling the window
//! and waking the [`LogReader`] when it had suspended on back-pressure.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub mod kv;
pub mod proto;
pub mod proto_text;
pub mod reader;
pub mod syslog;
pub mod writer;

mod source;
mod window;

pub use reader::{LogReader, ReaderEvent, ReaderHandle};
pub use source::{LogSource, Pipe};
pub use window::WindowCounter;
pub use writer::{LogWriter, QueueWriter};

/// Cross-component signal routed to the control pipe, which decides
/// whether to tear down and rebuild the reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyCode {
    Close,
    ReadError,
    WriteError,
    FileMoved,
}

/// Process shutdown flag; all fetch and flush loops check it between
/// iterations.
#[derive(Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn new() -> ShutdownFlag {
        ShutdownFlag::default()
    }

    pub fn request_quit(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_quit(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OptionsError {
    #[error("init_window_size must be at least 1")]
    ZeroWindow,
    #[error("fetch_limit must be at least 1")]
    ZeroFetchLimit,
}

/// Options of a [`LogSource`].
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct SourceOptions {
    /// Initial outstanding-message credit of the source window.
    pub init_window_size: usize,
    /// Identity reported to the metrics collaborator.
    pub stats_id: String,
    pub stats_instance: String,
}

impl Default for SourceOptions {
    fn default() -> Self {
        SourceOptions {
            init_window_size: 100,
            stats_id: String::new(),
            stats_instance: String::new(),
        }
    }
}

impl SourceOptions {
    pub fn validate(&self) -> Result<(), OptionsError> {
        if self.init_window_size == 0 {
            return Err(OptionsError::ZeroWindow);
        }
        Ok(())
    }
}

/// Options of a [`LogReader`].
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct ReaderOptions {
    /// Messages fetched per reader run before yielding back to the loop.
    pub fetch_limit: usize,
    /// Run fetches on the blocking thread pool instead of inline.
    pub threaded: bool,
    /// Post zero-length records instead of skipping them.
    pub empty_lines: bool,
    /// Discard transport aux data (peer addresses, extra k/v pairs).
    pub ignore_aux_data: bool,
    /// Keep unparsable records as raw payload instead of dropping them.
    pub store_on_parse_error: bool,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        ReaderOptions {
            fetch_limit: 10,
            threaded: false,
            empty_lines: false,
            ignore_aux_data: false,
            store_on_parse_error: true,
        }
    }
}

impl ReaderOptions {
    pub fn validate(&self) -> Result<(), OptionsError> {
        if self.fetch_limit == 0 {
            return Err(OptionsError::ZeroFetchLimit);
        }
        Ok(())
    }
}
