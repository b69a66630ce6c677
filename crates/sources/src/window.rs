use std::sync::atomic::{AtomicUsize, Ordering};

/// Flow-control credit of a source: how many more un-acked messages it may
/// have outstanding. Debited on post, refilled from the ack path.
pub struct WindowCounter {
    value: AtomicUsize,
}

impl WindowCounter {
    pub fn new(initial: usize) -> WindowCounter {
        WindowCounter {
            value: AtomicUsize::new(initial),
        }
    }

    pub fn get(&self) -> usize {
        self.value.load(Ordering::Acquire)
    }

    pub fn is_free(&self) -> bool {
        self.get() > 0
    }

    /// Debit one credit. Saturates at zero: a post that empties the window
    /// still succeeds, the reader is responsible for not reading further
    /// until woken.
    pub fn sub(&self) {
        let _ = self
            .value
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |value| {
                Some(value.saturating_sub(1))
            });
    }

    pub fn add(&self, credits: usize) {
        self.value.fetch_add(credits, Ordering::AcqRel);
    }
}
