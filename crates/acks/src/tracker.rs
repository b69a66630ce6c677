use crate::bookmark::BookmarkRef;
use message::{AckToken, AckType, LogMessage};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

static NEXT_TRACKER_ID: AtomicU64 = AtomicU64::new(1);

/// Batch-completion callback of the batched tracker. The callback is
/// expected to call [`BookmarkRef::save`] on the records it wants
/// persisted; the tracker destroys the records once it returns.
pub type OnBatchAcked = Arc<dyn Fn(&[AckedRecord]) + Send + Sync>;

/// A fully acknowledged record handed to the batch callback.
pub struct AckedRecord {
    bookmark: BookmarkRef,
}

impl AckedRecord {
    pub fn bookmark(&self) -> &BookmarkRef {
        &self.bookmark
    }
}

/// Binds message acknowledgement to bookmark persistence for one source.
///
/// The reader side (request/track) runs on the source's thread; the ack
/// side may run on any consumer thread. All book-keeping is O(1) under a
/// per-tracker lock, and bookmark `save` callbacks run outside the lock
/// only for the batched strategy (the batch callback), inline otherwise.
pub struct AckTracker {
    id: u64,
    saving_disabled: Arc<AtomicBool>,
    state: Mutex<State>,
    weak_self: Weak<AckTracker>,
    runtime: Option<tokio::runtime::Handle>,
}

enum State {
    Instant(InstantState),
    Bookmarkless(BookmarklessState),
    Consecutive(ConsecutiveState),
    Batched(BatchedState),
}

struct InstantState {
    pending: BookmarkRef,
    next_seq: u64,
    in_flight: HashMap<u64, BookmarkRef>,
}

struct BookmarklessState {
    sentinel: BookmarkRef,
    next_seq: u64,
}

struct ConsecutiveState {
    pending: BookmarkRef,
    capacity: usize,
    /// Sequence assigned to the next tracked message (write head).
    head_seq: u64,
    /// Sequence of the oldest in-flight record (read head).
    tail_seq: u64,
    ring: VecDeque<RingSlot>,
}

struct RingSlot {
    bookmark: BookmarkRef,
    acked: Option<AckType>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Filling,
    Flushing,
}

struct BatchedState {
    batch_size: usize,
    timeout: Option<Duration>,
    on_batch_acked: OnBatchAcked,
    pending: BookmarkRef,
    next_seq: u64,
    in_flight: HashMap<u64, BookmarkRef>,
    batch: Vec<BookmarkRef>,
    phase: Phase,
    timer: Option<tokio::task::JoinHandle<()>>,
    /// Generation of the armed timer; a stale timer fire is ignored.
    epoch: u64,
}

enum FlushReason {
    BatchFull,
    Timer(u64),
    Deinit,
}

impl AckTracker {
    fn new(state_of: impl FnOnce(&Arc<AtomicBool>) -> State, runtime: bool) -> Arc<AckTracker> {
        let saving_disabled = Arc::new(AtomicBool::new(false));
        let state = state_of(&saving_disabled);
        Arc::new_cyclic(|weak_self| AckTracker {
            id: NEXT_TRACKER_ID.fetch_add(1, Ordering::Relaxed),
            saving_disabled,
            state: Mutex::new(state),
            weak_self: weak_self.clone(),
            runtime: if runtime {
                tokio::runtime::Handle::try_current().ok()
            } else {
                None
            },
        })
    }

    pub(crate) fn new_instant() -> Arc<AckTracker> {
        Self::new(
            |disabled| {
                State::Instant(InstantState {
                    pending: BookmarkRef::new_slot(disabled.clone()),
                    next_seq: 0,
                    in_flight: HashMap::new(),
                })
            },
            false,
        )
    }

    pub(crate) fn new_bookmarkless() -> Arc<AckTracker> {
        Self::new(
            |disabled| {
                State::Bookmarkless(BookmarklessState {
                    sentinel: BookmarkRef::new_slot(disabled.clone()),
                    next_seq: 0,
                })
            },
            false,
        )
    }

    pub(crate) fn new_consecutive(capacity: usize) -> Arc<AckTracker> {
        Self::new(
            |disabled| {
                State::Consecutive(ConsecutiveState {
                    pending: BookmarkRef::new_slot(disabled.clone()),
                    capacity,
                    head_seq: 0,
                    tail_seq: 0,
                    ring: VecDeque::with_capacity(capacity),
                })
            },
            false,
        )
    }

    pub(crate) fn new_batched(
        timeout_ms: i64,
        batch_size: usize,
        on_batch_acked: OnBatchAcked,
    ) -> Arc<AckTracker> {
        // A non-positive timeout means "flush on size or deinit only".
        let timeout = u64::try_from(timeout_ms)
            .ok()
            .filter(|timeout| *timeout > 0)
            .map(Duration::from_millis);
        Self::new(
            |disabled| {
                State::Batched(BatchedState {
                    batch_size: std::cmp::max(batch_size, 1),
                    timeout,
                    on_batch_acked,
                    pending: BookmarkRef::new_slot(disabled.clone()),
                    next_seq: 0,
                    in_flight: HashMap::new(),
                    batch: Vec::new(),
                    phase: Phase::Idle,
                    timer: None,
                    epoch: 0,
                })
            },
            true,
        )
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// The slot the reader fills with its position before posting the
    /// message read from there. Returns the same slot until the next
    /// [`AckTracker::track_msg`].
    pub fn request_bookmark(&self) -> BookmarkRef {
        let mut state = self.state.lock().unwrap();
        match &mut *state {
            State::Instant(instant) => instant.pending.clone(),
            State::Bookmarkless(bookmarkless) => bookmarkless.sentinel.clone(),
            State::Consecutive(consecutive) => consecutive.pending.clone(),
            State::Batched(batched) => {
                if batched.phase == Phase::Idle {
                    batched.phase = Phase::Filling;
                    self.arm_timer(batched);
                }
                batched.pending.clone()
            }
        }
    }

    /// Bind `msg` to the current bookmark slot and prepare a fresh one.
    pub fn track_msg(&self, msg: &mut LogMessage) {
        let seq = {
            let mut state = self.state.lock().unwrap();
            match &mut *state {
                State::Instant(instant) => {
                    let seq = instant.next_seq;
                    instant.next_seq += 1;
                    let slot = std::mem::replace(
                        &mut instant.pending,
                        BookmarkRef::new_slot(self.saving_disabled.clone()),
                    );
                    instant.in_flight.insert(seq, slot);
                    seq
                }
                State::Bookmarkless(bookmarkless) => {
                    let seq = bookmarkless.next_seq;
                    bookmarkless.next_seq += 1;
                    seq
                }
                State::Consecutive(consecutive) => {
                    debug_assert!(
                        consecutive.ring.len() < consecutive.capacity,
                        "source window must bound in-flight records"
                    );
                    let seq = consecutive.head_seq;
                    consecutive.head_seq += 1;
                    let slot = std::mem::replace(
                        &mut consecutive.pending,
                        BookmarkRef::new_slot(self.saving_disabled.clone()),
                    );
                    consecutive.ring.push_back(RingSlot {
                        bookmark: slot,
                        acked: None,
                    });
                    seq
                }
                State::Batched(batched) => {
                    let seq = batched.next_seq;
                    batched.next_seq += 1;
                    let slot = std::mem::replace(
                        &mut batched.pending,
                        BookmarkRef::new_slot(self.saving_disabled.clone()),
                    );
                    batched.in_flight.insert(seq, slot);
                    seq
                }
            }
        };
        msg.set_ack_token(AckToken {
            tracker_id: self.id,
            seq,
        });
    }

    /// Handle the final acknowledgement of a tracked message.
    pub fn manage_msg_ack(&self, msg: &LogMessage, ack_type: AckType) {
        let token = msg.ack_token().expect("acked message was never tracked");
        assert_eq!(
            token.tracker_id, self.id,
            "message is tracked by a different tracker"
        );

        let mut flush = false;
        {
            let mut state = self.state.lock().unwrap();
            match &mut *state {
                State::Instant(instant) => {
                    let Some(bookmark) = instant.in_flight.remove(&token.seq) else {
                        debug_assert!(false, "instant record acked twice");
                        return;
                    };
                    if ack_type == AckType::Processed {
                        bookmark.save();
                    }
                    bookmark.destroy();
                }
                State::Bookmarkless(_) => {}
                State::Consecutive(consecutive) => {
                    consecutive.mark_acked(token.seq, ack_type);
                    consecutive.save_contiguous_prefix();
                }
                State::Batched(batched) => {
                    let Some(bookmark) = batched.in_flight.remove(&token.seq) else {
                        debug_assert!(false, "batched record acked twice");
                        return;
                    };
                    if ack_type == AckType::Processed {
                        batched.batch.push(bookmark);
                        flush = batched.batch.len() >= batched.batch_size;
                    } else {
                        // Failed outcomes never join a batch.
                        bookmark.destroy();
                    }
                }
            }
        }
        if flush {
            self.flush_batch(FlushReason::BatchFull);
        }
    }

    /// After this call every save on bookmarks owned by this tracker is a
    /// no-op; used on source shutdown to discard uncommitted progress.
    pub fn disable_bookmark_saving(&self) {
        self.saving_disabled.store(true, Ordering::Release);
        tracing::debug!(tracker = self.id, "bookmark saving disabled");
    }

    /// Flush any pending batch. Must be called before dropping a batched
    /// tracker; a no-op for the other strategies.
    pub fn deinit(&self) {
        self.flush_batch(FlushReason::Deinit);
    }

    fn arm_timer(&self, batched: &mut BatchedState) {
        let Some(timeout) = batched.timeout else {
            return;
        };
        let Some(runtime) = &self.runtime else {
            tracing::warn!(
                tracker = self.id,
                "batched tracker built outside a runtime, flush timeout disabled"
            );
            return;
        };
        batched.epoch += 1;
        let epoch = batched.epoch;
        let weak = self.weak_self.clone();
        batched.timer = Some(runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(tracker) = weak.upgrade() {
                tracker.flush_batch(FlushReason::Timer(epoch));
            }
        }));
    }

    fn flush_batch(&self, reason: FlushReason) {
        let (on_batch_acked, records) = {
            let mut state = self.state.lock().unwrap();
            let State::Batched(batched) = &mut *state else {
                return;
            };
            if let FlushReason::Timer(epoch) = reason {
                if epoch != batched.epoch {
                    return;
                }
            }
            if batched.phase == Phase::Flushing {
                return;
            }
            if let Some(timer) = batched.timer.take() {
                timer.abort();
            }
            if batched.batch.is_empty() && !matches!(reason, FlushReason::Deinit) {
                batched.phase = Phase::Idle;
                return;
            }
            batched.phase = Phase::Flushing;
            let records: Vec<AckedRecord> = batched
                .batch
                .drain(..)
                .map(|bookmark| AckedRecord { bookmark })
                .collect();
            (batched.on_batch_acked.clone(), records)
        };

        // The callback runs outside the tracker lock; acking threads may
        // queue further records meanwhile.
        on_batch_acked(&records);
        for record in &records {
            record.bookmark.destroy();
        }

        let mut state = self.state.lock().unwrap();
        if let State::Batched(batched) = &mut *state {
            if batched.batch.is_empty() {
                batched.phase = Phase::Idle;
            } else {
                batched.phase = Phase::Filling;
                self.arm_timer(batched);
            }
        }
    }
}

impl ConsecutiveState {
    fn mark_acked(&mut self, seq: u64, ack_type: AckType) {
        debug_assert!(
            seq >= self.tail_seq && seq < self.head_seq,
            "consecutive ack outside the in-flight window"
        );
        let index = (seq - self.tail_seq) as usize;
        let slot = &mut self.ring[index];
        debug_assert!(slot.acked.is_none(), "consecutive record acked twice");
        slot.acked = Some(ack_type);
    }

    /// Save and release every contiguous acked record at the read head.
    /// Failed records advance the head without saving; the next processed
    /// record commits its own (later) position.
    fn save_contiguous_prefix(&mut self) {
        while matches!(self.ring.front(), Some(slot) if slot.acked.is_some()) {
            let slot = self.ring.pop_front().unwrap();
            if slot.acked == Some(AckType::Processed) {
                slot.bookmark.save();
            }
            slot.bookmark.destroy();
            self.tail_seq += 1;
        }
    }
}

impl Drop for AckTracker {
    fn drop(&mut self) {
        if let Ok(state) = self.state.get_mut() {
            if let State::Batched(batched) = state {
                if let Some(timer) = batched.timer.take() {
                    timer.abort();
                }
                debug_assert!(
                    batched.batch.is_empty(),
                    "batched tracker dropped with an unflushed batch, call deinit"
                );
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bookmark::BookmarkData;
    use crate::AckTrackerFactory;
    use message::{Context, MsgRef};
    use std::sync::atomic::AtomicU32;

    struct CountingBookmark {
        saves: Arc<AtomicU32>,
        destroys: Arc<AtomicU32>,
    }

    impl BookmarkData for CountingBookmark {
        fn save(&mut self) {
            self.saves.fetch_add(1, Ordering::SeqCst);
        }
        fn destroy(&mut self) {
            self.destroys.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct LabelledBookmark {
        label: &'static str,
        saved: Arc<Mutex<Vec<&'static str>>>,
    }

    impl BookmarkData for LabelledBookmark {
        fn save(&mut self) {
            self.saved.lock().unwrap().push(self.label);
        }
    }

    fn counters() -> (Arc<AtomicU32>, Arc<AtomicU32>) {
        (Arc::new(AtomicU32::new(0)), Arc::new(AtomicU32::new(0)))
    }

    fn fill_counting(
        bookmark: &BookmarkRef,
        saves: &Arc<AtomicU32>,
        destroys: &Arc<AtomicU32>,
    ) {
        bookmark.fill(CountingBookmark {
            saves: saves.clone(),
            destroys: destroys.clone(),
        });
    }

    fn track_one(tracker: &AckTracker, ctx: &Arc<Context>) -> MsgRef {
        let mut msg = message::LogMessage::new_empty(ctx);
        tracker.track_msg(msg.get_mut().expect("fresh message is unique"));
        msg
    }

    #[test]
    fn test_instant_same_slot_until_tracked() {
        let ctx = Context::new();
        let tracker = AckTrackerFactory::Instant.create(10);

        let bm1 = tracker.request_bookmark();
        let bm2 = tracker.request_bookmark();
        assert!(bm1.same_slot(&bm2));

        let msg = track_one(&tracker, &ctx);
        assert_eq!(msg.ack_token().unwrap().tracker_id, tracker.id());

        let bm3 = tracker.request_bookmark();
        assert!(!bm3.same_slot(&bm1));
        tracker.manage_msg_ack(&msg, AckType::Processed);
    }

    #[test]
    fn test_instant_saves_each_processed_position() {
        let ctx = Context::new();
        let tracker = AckTrackerFactory::Instant.create(10);
        let (saves, destroys) = counters();

        for _ in 0..2 {
            let bookmark = tracker.request_bookmark();
            fill_counting(&bookmark, &saves, &destroys);
            let msg = track_one(&tracker, &ctx);
            tracker.manage_msg_ack(&msg, AckType::Processed);
        }

        assert_eq!(saves.load(Ordering::SeqCst), 2);
        assert_eq!(destroys.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_instant_failed_outcomes_skip_save() {
        let ctx = Context::new();
        let tracker = AckTrackerFactory::Instant.create(10);
        let (saves, destroys) = counters();

        for ack_type in [AckType::Aborted, AckType::Suspended] {
            let bookmark = tracker.request_bookmark();
            fill_counting(&bookmark, &saves, &destroys);
            let msg = track_one(&tracker, &ctx);
            tracker.manage_msg_ack(&msg, ack_type);
        }

        assert_eq!(saves.load(Ordering::SeqCst), 0);
        assert_eq!(destroys.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_bookmarkless_same_sentinel_forever() {
        let ctx = Context::new();
        let tracker = AckTrackerFactory::InstantBookmarkless.create(10);
        let (saves, destroys) = counters();

        let bm1 = tracker.request_bookmark();
        fill_counting(&bm1, &saves, &destroys);
        let msg1 = track_one(&tracker, &ctx);
        let bm2 = tracker.request_bookmark();
        let msg2 = track_one(&tracker, &ctx);
        assert!(bm1.same_slot(&bm2));

        tracker.manage_msg_ack(&msg1, AckType::Processed);
        tracker.manage_msg_ack(&msg2, AckType::Processed);
        // The sentinel is never saved nor destroyed.
        assert_eq!(saves.load(Ordering::SeqCst), 0);
        assert_eq!(destroys.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_consecutive_saves_in_arrival_order() {
        let ctx = Context::new();
        let tracker = AckTrackerFactory::Consecutive.create(10);
        let saved = Arc::new(Mutex::new(Vec::new()));

        let mut msgs = Vec::new();
        for label in ["m1", "m2", "m3"] {
            tracker.request_bookmark().fill(LabelledBookmark {
                label,
                saved: saved.clone(),
            });
            msgs.push(track_one(&tracker, &ctx));
        }

        // m2 completes first: nothing may be saved yet.
        tracker.manage_msg_ack(&msgs[1], AckType::Processed);
        assert!(saved.lock().unwrap().is_empty());

        // m1 completes: the contiguous prefix m1, m2 is saved in order.
        tracker.manage_msg_ack(&msgs[0], AckType::Processed);
        assert_eq!(*saved.lock().unwrap(), vec!["m1", "m2"]);

        tracker.manage_msg_ack(&msgs[2], AckType::Processed);
        assert_eq!(*saved.lock().unwrap(), vec!["m1", "m2", "m3"]);
    }

    #[test]
    fn test_consecutive_failed_record_advances_without_save() {
        let ctx = Context::new();
        let tracker = AckTrackerFactory::Consecutive.create(10);
        let saved = Arc::new(Mutex::new(Vec::new()));

        let mut msgs = Vec::new();
        for label in ["m1", "m2"] {
            tracker.request_bookmark().fill(LabelledBookmark {
                label,
                saved: saved.clone(),
            });
            msgs.push(track_one(&tracker, &ctx));
        }

        tracker.manage_msg_ack(&msgs[0], AckType::Aborted);
        tracker.manage_msg_ack(&msgs[1], AckType::Processed);
        // The aborted m1 is skipped; m2 commits its own later position.
        assert_eq!(*saved.lock().unwrap(), vec!["m2"]);
    }

    #[test]
    fn test_disable_bookmark_saving() {
        let ctx = Context::new();
        let tracker = AckTrackerFactory::Instant.create(10);
        let (saves, destroys) = counters();

        let bookmark = tracker.request_bookmark();
        fill_counting(&bookmark, &saves, &destroys);
        let msg = track_one(&tracker, &ctx);

        tracker.disable_bookmark_saving();
        tracker.manage_msg_ack(&msg, AckType::Processed);
        assert_eq!(saves.load(Ordering::SeqCst), 0);
        assert_eq!(destroys.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_batched_size_one_flushes_synchronously() {
        let ctx = Context::new();
        let acked = Arc::new(AtomicBool::new(false));
        let acked_in_cb = acked.clone();
        let tracker = AckTrackerFactory::Batched {
            timeout_ms: 0,
            batch_size: 1,
            on_batch_acked: Arc::new(move |records| {
                assert_eq!(records.len(), 1);
                acked_in_cb.store(true, Ordering::SeqCst);
            }),
        }
        .create(10);

        let bm1 = tracker.request_bookmark();
        let bm2 = tracker.request_bookmark();
        assert!(bm1.same_slot(&bm2));

        let msg = track_one(&tracker, &ctx);
        assert!(!acked.load(Ordering::SeqCst));
        let bm3 = tracker.request_bookmark();
        assert!(!bm3.same_slot(&bm1));

        tracker.manage_msg_ack(&msg, AckType::Processed);
        assert!(acked.load(Ordering::SeqCst));
    }

    fn save_all_cb() -> OnBatchAcked {
        Arc::new(|records: &[AckedRecord]| {
            for record in records {
                record.bookmark().save();
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_batched_timeout_flushes_partial_batch() {
        let ctx = Context::new();
        let tracker = AckTrackerFactory::Batched {
            timeout_ms: 500,
            batch_size: 3,
            on_batch_acked: save_all_cb(),
        }
        .create(10);
        let (saves, destroys) = counters();

        for _ in 0..2 {
            let bookmark = tracker.request_bookmark();
            fill_counting(&bookmark, &saves, &destroys);
            let msg = track_one(&tracker, &ctx);
            tracker.manage_msg_ack(&msg, AckType::Processed);
        }
        // Batch of 3 not reached: nothing flushed yet.
        assert_eq!(saves.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(saves.load(Ordering::SeqCst), 2);
        assert_eq!(destroys.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batched_deinit_flushes_partial_batch() {
        let ctx = Context::new();
        let cb_called = Arc::new(AtomicBool::new(false));
        let cb_called_in_cb = cb_called.clone();
        let tracker = AckTrackerFactory::Batched {
            timeout_ms: 2000,
            batch_size: 3,
            on_batch_acked: Arc::new(move |records: &[AckedRecord]| {
                cb_called_in_cb.store(true, Ordering::SeqCst);
                for record in records {
                    record.bookmark().save();
                }
            }),
        }
        .create(10);
        let (saves, destroys) = counters();

        for _ in 0..2 {
            let bookmark = tracker.request_bookmark();
            fill_counting(&bookmark, &saves, &destroys);
            let msg = track_one(&tracker, &ctx);
            tracker.manage_msg_ack(&msg, AckType::Processed);
        }

        tracker.deinit();
        assert!(cb_called.load(Ordering::SeqCst));
        assert_eq!(saves.load(Ordering::SeqCst), 2);
        assert_eq!(destroys.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batched_size_flush_disarms_timer() {
        let ctx = Context::new();
        let flushes = Arc::new(AtomicU32::new(0));
        let flushes_in_cb = flushes.clone();
        let tracker = AckTrackerFactory::Batched {
            timeout_ms: 500,
            batch_size: 2,
            on_batch_acked: Arc::new(move |_records| {
                flushes_in_cb.fetch_add(1, Ordering::SeqCst);
            }),
        }
        .create(10);

        for _ in 0..2 {
            tracker.request_bookmark();
            let msg = track_one(&tracker, &ctx);
            tracker.manage_msg_ack(&msg, AckType::Processed);
        }
        assert_eq!(flushes.load(Ordering::SeqCst), 1);

        // The armed timer was cancelled by the size flush; waiting past
        // the timeout must not flush an empty batch again.
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(flushes.load(Ordering::SeqCst), 1);
    }
}
