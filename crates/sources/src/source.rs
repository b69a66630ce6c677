use crate::window::WindowCounter;
use crate::SourceOptions;
use acks::{AckTracker, AckTrackerFactory, BookmarkRef};
use message::{AckType, MsgRef, PathOptions};
use std::sync::{Arc, RwLock};

/// A downstream element able to consume posted messages.
pub trait Pipe: Send + Sync {
    fn queue(&self, msg: MsgRef, path_options: &PathOptions);
}

type WakeupFn = Arc<dyn Fn() + Send + Sync>;

/// The entry point of messages into the pipeline.
///
/// Owns the source window and the ack tracker. `post` debits the window,
/// binds the message to its tracker record, and installs the ack hook
/// which refills the window and wakes the reader, possibly from a
/// consumer thread.
pub struct LogSource {
    options: SourceOptions,
    window: WindowCounter,
    ack_tracker: Arc<AckTracker>,
    downstream: Arc<dyn Pipe>,
    wakeup: RwLock<Option<WakeupFn>>,
}

impl LogSource {
    pub fn new(
        options: SourceOptions,
        tracker_factory: &AckTrackerFactory,
        downstream: Arc<dyn Pipe>,
    ) -> Arc<LogSource> {
        let window = WindowCounter::new(options.init_window_size);
        let ack_tracker = tracker_factory.create(options.init_window_size);
        Arc::new(LogSource {
            options,
            window,
            ack_tracker,
            downstream,
            wakeup: RwLock::new(None),
        })
    }

    pub fn options(&self) -> &SourceOptions {
        &self.options
    }

    pub fn ack_tracker(&self) -> &Arc<AckTracker> {
        &self.ack_tracker
    }

    /// Current free window credit.
    pub fn window_size(&self) -> usize {
        self.window.get()
    }

    /// Whether the reader may post further messages.
    pub fn free_to_send(&self) -> bool {
        self.window.is_free()
    }

    /// Install the callable invoked when the window reopens. Called by the
    /// reader (or driver) which owns this source's fetching.
    pub fn set_wakeup(&self, wakeup: WakeupFn) {
        *self.wakeup.write().unwrap() = Some(wakeup);
    }

    /// Shorthand for requesting the tracker's current bookmark slot.
    pub fn request_bookmark(&self) -> BookmarkRef {
        self.ack_tracker.request_bookmark()
    }

    /// Post one message downstream.
    ///
    /// Consumes the caller's handle; the caller is expected to run inside
    /// a producer refcache session and may not assume anything about the
    /// message's liveness afterwards. An exhausted window does not fail
    /// the post, the reader just must not fetch again until woken.
    pub fn post(self: &Arc<Self>, mut msg: MsgRef) {
        self.window.sub();

        let body = msg
            .get_mut()
            .expect("a posted message must be exclusively owned by its producer");
        self.ack_tracker.track_msg(body);
        body.set_ack_hook(self.ack_hook());

        let path_options = PathOptions::default();
        // The window credit is held by one pending ack until the consumer
        // side fully acknowledges the message.
        msg.add_ack(&path_options);

        tracing::trace!(
            rcptid = msg.rcptid(),
            stats_id = %self.options.stats_id,
            window = self.window.get(),
            "message posted",
        );
        self.downstream.queue(msg, &path_options);
    }

    /// Stop persisting bookmark positions; used on shutdown to discard
    /// uncommitted progress.
    pub fn disable_bookmark_saving(&self) {
        self.ack_tracker.disable_bookmark_saving();
    }

    /// Flush tracker state which is not bound to in-flight messages.
    pub fn deinit(&self) {
        self.ack_tracker.deinit();
    }

    /// The ack path of this source: forward the outcome to the tracker,
    /// refill the window, and wake the reader. Runs on whichever thread
    /// delivered the final ack.
    fn ack_hook(self: &Arc<Self>) -> message::AckHook {
        let source = Arc::downgrade(self);
        Arc::new(move |msg: &MsgRef, ack_type: AckType| {
            let Some(source) = source.upgrade() else {
                // The source was torn down with messages still in flight;
                // their positions are not committed.
                tracing::debug!(rcptid = msg.rcptid(), "ack for a dropped source");
                return;
            };
            source.ack_tracker.manage_msg_ack(msg, ack_type);
            source.window.add(1);
            let wakeup = source.wakeup.read().unwrap().clone();
            if let Some(wakeup) = wakeup {
                wakeup();
            }
        })
    }
}
