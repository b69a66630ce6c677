use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Driver-defined position descriptor held by a bookmark slot.
///
/// `save` persists the position and must be idempotent; `destroy` releases
/// any driver-specific resources and runs exactly once, when the tracker
/// is done with the record.
pub trait BookmarkData: Send {
    fn save(&mut self);

    fn destroy(&mut self) {}
}

/// One bookmark slot owned by an ack tracker.
pub struct Bookmark {
    data: Option<Box<dyn BookmarkData>>,
}

/// Shared handle of a [`Bookmark`] slot. The reader fills the slot with
/// its current position before posting the message it read from there;
/// slot identity is stable until the tracker hands it to a message.
#[derive(Clone)]
pub struct BookmarkRef {
    slot: Arc<Mutex<Bookmark>>,
    saving_disabled: Arc<AtomicBool>,
}

impl BookmarkRef {
    /// A fresh empty slot whose saves honor the tracker-wide disable flag.
    pub(crate) fn new_slot(saving_disabled: Arc<AtomicBool>) -> BookmarkRef {
        BookmarkRef {
            slot: Arc::new(Mutex::new(Bookmark { data: None })),
            saving_disabled,
        }
    }

    /// Fill the slot with the driver's position descriptor, replacing any
    /// prior content.
    pub fn fill(&self, data: impl BookmarkData + 'static) {
        self.slot.lock().unwrap().data = Some(Box::new(data));
    }

    pub fn is_filled(&self) -> bool {
        self.slot.lock().unwrap().data.is_some()
    }

    /// Whether `self` and `other` are handles of the same slot.
    pub fn same_slot(&self, other: &BookmarkRef) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot)
    }

    /// Persist the position. A no-op for unfilled slots and after the
    /// owning tracker disabled bookmark saving.
    pub fn save(&self) {
        if self.saving_disabled.load(Ordering::Acquire) {
            tracing::trace!("bookmark saving is disabled, skipping save");
            return;
        }
        if let Some(data) = self.slot.lock().unwrap().data.as_mut() {
            data.save();
        }
    }

    /// Release the slot's driver resources.
    pub(crate) fn destroy(&self) {
        if let Some(mut data) = self.slot.lock().unwrap().data.take() {
            data.destroy();
        }
    }
}

impl std::fmt::Debug for BookmarkRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BookmarkRef")
            .field("filled", &self.is_filled())
            .finish()
    }
}
