//! Thread-local deferral of ref/ack counter traffic.
//!
//! A message typically passes through several stages on one thread, each
//! of which refs, unrefs, and acks it. Paying an atomic RMW per call
//! dominates the cost of the counter, so a thread brackets its work on a
//! message with a session: while the session is active, ref/unref and
//! add_ack/ack calls for that message only adjust thread-local deltas,
//! folded into the packed cell in a single update when the session ends.
//!
//! The producer variant additionally pre-biases both counters by
//! [`cell::BIAS`] so that consumer threads which run ahead of the
//! producer's fold can never observe a zero count and free or ack-complete
//! the message early.
//!
//! Sessions are `!Send` guards: they must start and end on one thread, and
//! cannot be held across an await point in a work-stealing runtime.

use crate::cell::BIAS;
use crate::{msg, AckType, MsgRef, PathOptions};
use std::cell::RefCell;
use std::marker::PhantomData;
use std::ptr::NonNull;

struct CacheState {
    msg: NonNull<msg::LogMessage>,
    refs: i32,
    acks: i32,
    abort: bool,
    suspend: bool,
    ack_needed: bool,
}

thread_local! {
    static CACHE: RefCell<Option<CacheState>> = const { RefCell::new(None) };
}

/// An active refcache session. Dropping it folds the cached deltas into
/// the message's packed cell and fires the ack hook when the pending ack
/// count reached zero under this session.
pub struct RefCacheSession {
    _not_send: PhantomData<*const ()>,
}

/// Start caching for the thread that created `msg`, before any consumer
/// can see it. Panics if this thread already has an active session.
pub fn start_producer(msg: &MsgRef) -> RefCacheSession {
    let ptr = msg::raw_ptr(msg);
    // The producer has just created this message; pre-bias both counters
    // so consumer-side cached decrements stay positive until our fold.
    msg::cell_of(ptr).update(BIAS, BIAS, false, false);

    CACHE.with(|cache| {
        let mut cache = cache.borrow_mut();
        assert!(
            cache.is_none(),
            "refcache session already active on this thread"
        );
        *cache = Some(CacheState {
            msg: ptr,
            refs: -BIAS,
            acks: -BIAS,
            abort: false,
            suspend: false,
            ack_needed: true,
        });
    });
    RefCacheSession {
        _not_send: PhantomData,
    }
}

/// Start caching for a thread that received `msg` from another thread.
/// May run on several consumer threads at once for the same message.
pub fn start_consumer(msg: &MsgRef, path_options: &PathOptions) -> RefCacheSession {
    CACHE.with(|cache| {
        let mut cache = cache.borrow_mut();
        assert!(
            cache.is_none(),
            "refcache session already active on this thread"
        );
        *cache = Some(CacheState {
            msg: msg::raw_ptr(msg),
            refs: 0,
            acks: 0,
            abort: false,
            suspend: false,
            ack_needed: path_options.ack_needed,
        });
    });
    RefCacheSession {
        _not_send: PhantomData,
    }
}

impl Drop for RefCacheSession {
    fn drop(&mut self) {
        stop();
    }
}

fn stop() {
    // Fold the cached ack delta first. The refs stay cached so that the
    // ack hook below may ref/unref the message without freeing it.
    let (ptr, acks, abort, suspend, ack_needed) = CACHE.with(|cache| {
        let mut cache = cache.borrow_mut();
        let state = cache.as_mut().expect("refcache session is active");

        // A delta at the bias boundary means the cache window was too
        // small: the pre-biased counter could have been driven to zero by
        // consumers despite the bias. The ref lower bound admits one extra
        // decrement: a producer session legitimately net-consumes its own
        // creating reference when the pipeline drops the message inline
        // (queue overflow, filtered out).
        assert!(
            state.acks < BIAS - 1 && state.acks >= -BIAS,
            "refcache ack window exceeded"
        );
        assert!(
            state.refs < BIAS - 1 && state.refs >= -(BIAS + 1),
            "refcache ref window exceeded"
        );

        let acks = std::mem::take(&mut state.acks);
        let abort = std::mem::take(&mut state.abort);
        let suspend = std::mem::take(&mut state.suspend);
        (state.msg, acks, abort, suspend, state.ack_needed)
    });

    let cell = msg::cell_of(ptr);
    let old = cell.update(0, acks, abort, suspend);

    if acks != 0 && old.acks() as i32 == -acks && ack_needed {
        let outcome = if suspend {
            AckType::Suspended
        } else if abort {
            AckType::Aborted
        } else {
            old.outcome()
        };
        // Safety: our cached (biased) refs still hold the message alive.
        unsafe { msg::invoke_hook(ptr, outcome) };

        CACHE.with(|cache| {
            let cache = cache.borrow();
            let state = cache.as_ref().expect("session still active during hook");
            assert!(
                state.acks == 0,
                "the ack hook may not alter ack counts, they already dropped to zero"
            );
        });
    }

    // Deactivate the session and fold the net ref delta; this either frees
    // the message (we held its last references) or leaves it to the other
    // holders.
    let refs = CACHE.with(|cache| {
        cache
            .borrow_mut()
            .take()
            .expect("session still active")
            .refs
    });
    let old = cell.update(refs, 0, false, false);
    if old.refs() as i32 == -refs {
        // Safety: the count reached zero, nothing else references the body.
        unsafe { msg::free(ptr) };
    }
}

fn with_active<R>(ptr: *const msg::LogMessage, f: impl FnOnce(&mut CacheState) -> R) -> Option<R> {
    CACHE.with(|cache| {
        let mut cache = cache.borrow_mut();
        match cache.as_mut() {
            Some(state) if state.msg.as_ptr() as *const _ == ptr => Some(f(state)),
            _ => None,
        }
    })
}

pub(crate) fn cached_ref(ptr: *const msg::LogMessage) -> bool {
    with_active(ptr, |state| state.refs += 1).is_some()
}

pub(crate) fn cached_unref(ptr: *const msg::LogMessage) -> bool {
    with_active(ptr, |state| state.refs -= 1).is_some()
}

pub(crate) fn cached_add_ack(ptr: *const msg::LogMessage) -> bool {
    with_active(ptr, |state| {
        state.acks += 1;
        state.ack_needed = true;
    })
    .is_some()
}

pub(crate) fn cached_ack(ptr: *const msg::LogMessage, ack_type: AckType) -> bool {
    with_active(ptr, |state| {
        state.acks -= 1;
        state.abort |= ack_type == AckType::Aborted;
        state.suspend |= ack_type == AckType::Suspended;
    })
    .is_some()
}

/// Net ref delta this thread has cached for the message at `ptr` (zero
/// when no session covers it).
pub(crate) fn cached_ref_delta(ptr: *const msg::LogMessage) -> i32 {
    with_active(ptr, |state| state.refs).unwrap_or(0)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{Context, LogMessage};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn set_counting_hook(msg: &mut MsgRef, calls: &Arc<AtomicU32>) {
        let calls = calls.clone();
        msg.get_mut()
            .expect("unique during setup")
            .set_ack_hook(Arc::new(move |_msg, _t| {
                calls.fetch_add(1, Ordering::SeqCst);
            }));
    }

    #[test]
    fn test_producer_session_folds_to_net_effect() {
        let ctx = Context::new();
        let msg = LogMessage::new_empty(&ctx);

        {
            let _session = start_producer(&msg);
            // Cached traffic: two clones dropped, one ack cycle.
            let a = msg.clone();
            let b = msg.clone();
            msg.add_ack(&PathOptions::default());
            msg.ack(&PathOptions::default(), AckType::Processed);
            drop(a);
            drop(b);
        }

        let snapshot = crate::msg::cell_of(crate::msg::raw_ptr(&msg)).load();
        assert_eq!(snapshot.refs(), 1);
        assert_eq!(snapshot.acks(), 0);
    }

    #[test]
    fn test_hook_fires_once_with_combined_outcome() {
        let ctx = Context::new();
        let calls = Arc::new(AtomicU32::new(0));
        let mut msg = LogMessage::new_empty(&ctx);
        set_counting_hook(&mut msg, &calls);
        let opts = PathOptions::default();

        // Three consumers; one suspends. The hook must fire exactly once
        // even though acks arrive via both the cache and the slow path.
        msg.add_ack(&opts);
        msg.add_ack(&opts);
        msg.add_ack(&opts);

        msg.ack(&opts, AckType::Processed);
        {
            let _session = start_consumer(&msg, &opts);
            msg.ack(&opts, AckType::Suspended);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        msg.ack(&opts, AckType::Processed);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_consumer_session_is_transparent() {
        let ctx = Context::new();
        let msg = LogMessage::new_empty(&ctx);
        let baseline = crate::msg::cell_of(crate::msg::raw_ptr(&msg)).load();

        {
            let _session = start_consumer(&msg, &PathOptions::default());
            let a = msg.clone();
            let b = a.clone();
            drop(a);
            drop(b);
        }

        let after = crate::msg::cell_of(crate::msg::raw_ptr(&msg)).load();
        assert_eq!(baseline, after);
    }

    #[test]
    fn test_hook_fires_at_session_stop() {
        // A consumer that runs entirely within the producer's own thread:
        // its ack is cached, and the hook only fires when the producer
        // session folds and the pending count truly reaches zero.
        let ctx = Context::new();
        let calls = Arc::new(AtomicU32::new(0));
        let mut msg = LogMessage::new_empty(&ctx);
        set_counting_hook(&mut msg, &calls);
        let opts = PathOptions::default();

        {
            let _session = start_producer(&msg);
            let downstream = msg.clone();
            msg.add_ack(&opts);
            downstream.ack(&opts, AckType::Processed);
            drop(downstream);
            assert_eq!(calls.load(Ordering::SeqCst), 0);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[should_panic(expected = "refcache session already active")]
    fn test_nested_sessions_rejected() {
        let ctx = Context::new();
        let msg = LogMessage::new_empty(&ctx);
        let _outer = start_producer(&msg);
        let _inner = start_consumer(&msg, &PathOptions::default());
    }

    #[test]
    fn test_slow_path_for_other_messages() {
        let ctx = Context::new();
        let covered = LogMessage::new_empty(&ctx);
        let other = LogMessage::new_empty(&ctx);

        let _session = start_producer(&covered);
        // Traffic on a message not covered by the session goes straight to
        // its cell.
        let clone = other.clone();
        assert_eq!(crate::msg::cell_of(crate::msg::raw_ptr(&other)).load().refs(), 2);
        drop(clone);
        assert_eq!(crate::msg::cell_of(crate::msg::raw_ptr(&other)).load().refs(), 1);
    }
}
