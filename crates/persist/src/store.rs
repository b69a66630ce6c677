use super::{EntryHandle, Error, MappedEntry, PersistStore, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// In-process [`PersistStore`]. Backs tests and sources which opted out of
/// durable state; the file-backed store lives with the process frontend.
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    next_handle: AtomicU64,
    commits: AtomicU64,
}

struct Entry {
    handle: EntryHandle,
    buf: Arc<Mutex<Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            commits: AtomicU64::new(0),
        }
    }

    /// Number of commits performed. Observed by tests.
    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PersistStore for MemoryStore {
    fn alloc_entry(&self, name: &str, size: usize) -> Result<EntryHandle> {
        let mut entries = self.entries.lock().unwrap();
        if entries.contains_key(name) {
            return Err(Error::EntryExists(name.to_string()));
        }
        let handle = EntryHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        entries.insert(
            name.to_string(),
            Entry {
                handle,
                buf: Arc::new(Mutex::new(vec![0; size])),
            },
        );
        Ok(handle)
    }

    fn lookup_entry(&self, name: &str) -> Option<(EntryHandle, usize, u8)> {
        let entries = self.entries.lock().unwrap();
        let entry = entries.get(name)?;
        let buf = entry.buf.lock().unwrap();
        let version = buf.first().copied().unwrap_or(0);
        Some((entry.handle, buf.len(), version))
    }

    fn map_entry(&self, handle: EntryHandle) -> Result<MappedEntry> {
        let entries = self.entries.lock().unwrap();
        entries
            .values()
            .find(|entry| entry.handle == handle)
            .map(|entry| MappedEntry::new(entry.buf.clone()))
            .ok_or(Error::EntryNotFound)
    }

    fn commit(&self) -> Result<()> {
        self.commits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
