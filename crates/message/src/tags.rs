//! Message tags: a dense bitset keyed by small interned tag ids.
//!
//! Ids below 64 live inline in a single word; larger ids spill to a heap
//! allocated bitmap which is shared between clones and copied on first
//! mutation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Interned tag id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TagId(pub u16);

/// Largest permitted tag id.
pub const MAX_TAG_ID: u16 = 8159;

const WORD_BITS: usize = 64;

/// Process-wide tag name <-> id intern table.
pub struct Registry {
    inner: RwLock<RegistryInner>,
}

struct RegistryInner {
    by_name: HashMap<String, TagId>,
    names: Vec<Arc<str>>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry {
            inner: RwLock::new(RegistryInner {
                by_name: HashMap::new(),
                names: Vec::new(),
            }),
        }
    }

    /// Intern `name`, allocating the next id when new.
    pub fn id(&self, name: &str) -> crate::Result<TagId> {
        if let Some(id) = self.inner.read().unwrap().by_name.get(name) {
            return Ok(*id);
        }
        let mut inner = self.inner.write().unwrap();
        if let Some(id) = inner.by_name.get(name) {
            return Ok(*id);
        }
        let next = inner.names.len() as u16;
        if next > MAX_TAG_ID {
            return Err(crate::Error::TagOverflow(next));
        }
        let id = TagId(next);
        inner.names.push(name.into());
        inner.by_name.insert(name.to_string(), id);
        Ok(id)
    }

    pub fn name(&self, id: TagId) -> Option<Arc<str>> {
        self.inner.read().unwrap().names.get(id.0 as usize).cloned()
    }
}

/// The per-message tag bitset.
#[derive(Debug, Clone, Default)]
pub struct TagSet {
    inline: u64,
    spill: Option<Arc<Vec<u64>>>,
}

impl TagSet {
    pub fn new() -> TagSet {
        TagSet::default()
    }

    /// Set or clear `id`. Fails on ids beyond [`MAX_TAG_ID`], leaving the
    /// set unchanged.
    pub fn set(&mut self, id: TagId, on: bool) -> crate::Result<()> {
        if id.0 > MAX_TAG_ID {
            return Err(crate::Error::TagOverflow(id.0));
        }
        let index = id.0 as usize;

        if self.spill.is_none() && index < WORD_BITS {
            set_bit(std::slice::from_mut(&mut self.inline), index, on);
            return Ok(());
        }

        let words_needed = index / WORD_BITS + 1;
        let spill = self
            .spill
            .get_or_insert_with(|| Arc::new(vec![self.inline]));
        // Shared spills are copied on first mutation.
        let words = Arc::make_mut(spill);
        if words.len() < words_needed {
            words.resize(words_needed, 0);
        }
        set_bit(words, index, on);
        Ok(())
    }

    pub fn get(&self, id: TagId) -> bool {
        let index = id.0 as usize;
        match &self.spill {
            None => index < WORD_BITS && self.inline & (1 << index) != 0,
            Some(words) => {
                let word = index / WORD_BITS;
                word < words.len() && words[word] & (1 << (index % WORD_BITS)) != 0
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        match &self.spill {
            None => self.inline == 0,
            Some(words) => words.iter().all(|word| *word == 0),
        }
    }

    /// Invoke `f` with every set tag id, in increasing order.
    pub fn for_each(&self, mut f: impl FnMut(TagId)) {
        let words: &[u64] = match &self.spill {
            None => std::slice::from_ref(&self.inline),
            Some(words) => words,
        };
        for (at, word) in words.iter().enumerate() {
            let mut word = *word;
            let mut bit = 0;
            while word != 0 {
                if word & 1 != 0 {
                    f(TagId((at * WORD_BITS + bit) as u16));
                }
                word >>= 1;
                bit += 1;
            }
        }
    }
}

fn set_bit(words: &mut [u64], index: usize, on: bool) {
    let mask = 1u64 << (index % WORD_BITS);
    if on {
        words[index / WORD_BITS] |= mask;
    } else {
        words[index / WORD_BITS] &= !mask;
    }
}
