use crate::Pipe;
use message::{AckType, MsgRef, PathOptions};
use std::collections::VecDeque;
use std::sync::Mutex;

/// Obligations of any destination that participates in the ack chain.
///
/// For every message received with `path_options.ack_needed`, a writer
/// must eventually call exactly one of `ack(Processed)`, `ack(Aborted)`,
/// or `ack(Suspended)` before dropping its handle. The ack may be deferred
/// across I/O completion, but a message must not be held past shutdown
/// without acking; `Suspended` is the correct outcome during a graceful
/// drain. A writer that needs to mutate a shared message upgrades it with
/// [`MsgRef::make_writable`] first.
pub trait LogWriter: Pipe {
    /// Ack all in-flight messages as suspended and release them; called on
    /// shutdown.
    fn drain(&self);
}

/// In-memory writer-side queue: a bounded fifo of undelivered messages
/// plus a backlog of delivered-but-unacked ones.
///
/// Pushing releases the flow-control ack immediately for paths that did
/// not request flow control; flow-controlled paths stay unacked until the
/// writer confirms delivery via [`QueueWriter::ack_backlog`].
pub struct QueueWriter {
    capacity: usize,
    inner: Mutex<Inner>,
}

struct Inner {
    queue: VecDeque<(MsgRef, PathOptions)>,
    backlog: VecDeque<(MsgRef, PathOptions)>,
}

impl QueueWriter {
    pub fn new(capacity: usize) -> QueueWriter {
        QueueWriter {
            capacity,
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                backlog: VecDeque::new(),
            }),
        }
    }

    /// Append one message. Returns false when the queue is full; the
    /// message is then untouched and the caller decides its fate.
    pub fn push_tail(&self, msg: MsgRef, path_options: &PathOptions) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.queue.len() >= self.capacity {
            return false;
        }

        // Messages become shared state once queued; later mutation must go
        // through a copy-on-write clone.
        msg.write_protect();

        let onward = if path_options.ack_needed && !path_options.flow_control_requested {
            // Without flow control the sender only needs to know we queued
            // the message; break the ack chain here.
            msg.break_ack(path_options)
        } else {
            *path_options
        };
        inner.queue.push_back((msg, onward));
        true
    }

    /// Pop the oldest undelivered message, optionally parking it on the
    /// backlog until its delivery is confirmed.
    pub fn pop_head(&self, push_to_backlog: bool) -> Option<(MsgRef, PathOptions)> {
        let mut inner = self.inner.lock().unwrap();
        let (msg, path_options) = inner.queue.pop_front()?;
        if push_to_backlog {
            inner.backlog.push_back((msg.clone(), path_options));
        }
        Some((msg, path_options))
    }

    /// Confirm delivery of the `n` oldest backlog messages.
    pub fn ack_backlog(&self, n: usize) {
        for _ in 0..n {
            let Some((msg, path_options)) = self.inner.lock().unwrap().backlog.pop_front() else {
                break;
            };
            msg.ack(&path_options, AckType::Processed);
        }
    }

    /// Move the backlog back in front of the queue for redelivery, e.g.
    /// after the destination connection was rebuilt.
    pub fn rewind_backlog(&self) {
        let mut inner = self.inner.lock().unwrap();
        let backlog = std::mem::take(&mut inner.backlog);
        for entry in backlog.into_iter().rev() {
            inner.queue.push_front(entry);
        }
    }

    pub fn queue_len(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    pub fn backlog_len(&self) -> usize {
        self.inner.lock().unwrap().backlog.len()
    }
}

impl Pipe for QueueWriter {
    fn queue(&self, msg: MsgRef, path_options: &PathOptions) {
        if !self.push_tail(msg.clone(), path_options) {
            tracing::warn!(
                rcptid = msg.rcptid(),
                capacity = self.capacity,
                "destination queue is full, dropping message",
            );
            msg.drop_msg(path_options, AckType::Processed);
        }
    }
}

impl LogWriter for QueueWriter {
    fn drain(&self) {
        let (queue, backlog) = {
            let mut inner = self.inner.lock().unwrap();
            (
                std::mem::take(&mut inner.queue),
                std::mem::take(&mut inner.backlog),
            )
        };
        for (msg, path_options) in backlog.into_iter().chain(queue) {
            msg.ack(&path_options, AckType::Suspended);
        }
    }
}
