//! Name-value store backing the message payload.
//!
//! Value names are interned process-wide into small integer handles by the
//! [`Registry`]; each message carries an [`NvTable`] mapping handles to
//! byte values. The table is append-only up to a byte budget: a value that
//! would exceed the budget is dropped (and logged), the message is still
//! delivered without it.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Interned handle of a value name. Handle zero is "none".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NvHandle(u16);

impl NvHandle {
    pub const NONE: NvHandle = NvHandle(0);

    pub fn is_none(&self) -> bool {
        self.0 == 0
    }

    fn index(&self) -> usize {
        (self.0 - 1) as usize
    }
}

// Built-in handles, in registration order so their values are stable.
pub const HOST: NvHandle = NvHandle(1);
pub const HOST_FROM: NvHandle = NvHandle(2);
pub const MESSAGE: NvHandle = NvHandle(3);
pub const PROGRAM: NvHandle = NvHandle(4);
pub const PID: NvHandle = NvHandle(5);
pub const MSGID: NvHandle = NvHandle(6);
pub const SOURCE: NvHandle = NvHandle(7);
pub const LEGACY_MSGHDR: NvHandle = NvHandle(8);

const BUILTINS: &[(&str, NvHandle)] = &[
    ("HOST", HOST),
    ("HOST_FROM", HOST_FROM),
    ("MESSAGE", MESSAGE),
    ("PROGRAM", PROGRAM),
    ("PID", PID),
    ("MSGID", MSGID),
    ("SOURCE", SOURCE),
    ("LEGACY_MSGHDR", LEGACY_MSGHDR),
];

const ALIASES: &[(&str, NvHandle)] = &[
    ("MSG", MESSAGE),
    ("MSGONLY", MESSAGE),
    ("FULLHOST", HOST),
    ("FULLHOST_FROM", HOST_FROM),
];

/// Prefix marking a name as belonging to a structured-data element.
pub const SDATA_PREFIX: &str = ".SDATA.";

/// Highest numbered match slot.
pub const MATCH_SLOTS: usize = 256;

struct NameInfo {
    name: Arc<str>,
    sdata: bool,
}

struct Inner {
    by_name: HashMap<String, NvHandle>,
    names: Vec<NameInfo>,
}

/// Process-wide name -> handle intern table.
pub struct Registry {
    inner: RwLock<Inner>,
    match_handles: Vec<NvHandle>,
}

impl Registry {
    pub fn new() -> Registry {
        let mut inner = Inner {
            by_name: HashMap::new(),
            names: Vec::new(),
        };
        for (name, expected) in BUILTINS {
            let handle = inner.register(name);
            assert_eq!(handle, *expected);
        }
        for (alias, target) in ALIASES {
            inner.by_name.insert(alias.to_string(), *target);
        }

        // Numbered match slots $0..$255 are pre-registered so lookup by
        // index never takes the registration path.
        let match_handles = (0..MATCH_SLOTS)
            .map(|slot| inner.register(&slot.to_string()))
            .collect();

        Registry {
            inner: RwLock::new(inner),
            match_handles,
        }
    }

    /// Look up `name`, registering it when new. Names are restricted to
    /// alphanumerics plus `_`, `.` and `-`.
    pub fn handle(&self, name: &str) -> crate::Result<NvHandle> {
        if !is_valid_name(name) {
            return Err(crate::Error::InvalidValueName(name.to_string()));
        }
        if let Some(handle) = self.inner.read().unwrap().by_name.get(name) {
            return Ok(*handle);
        }
        let mut inner = self.inner.write().unwrap();
        // Raced registration resolves to the first writer's handle.
        if let Some(handle) = inner.by_name.get(name) {
            return Ok(*handle);
        }
        Ok(inner.register(name))
    }

    /// Look up `name` without registering it.
    pub fn get_handle(&self, name: &str) -> Option<NvHandle> {
        self.inner.read().unwrap().by_name.get(name).copied()
    }

    pub fn name(&self, handle: NvHandle) -> Option<Arc<str>> {
        let inner = self.inner.read().unwrap();
        inner.names.get(handle.index()).map(|info| info.name.clone())
    }

    /// Whether `handle` names a structured-data field.
    pub fn is_sdata(&self, handle: NvHandle) -> bool {
        let inner = self.inner.read().unwrap();
        inner
            .names
            .get(handle.index())
            .map(|info| info.sdata)
            .unwrap_or(false)
    }

    /// Whether `handle` is one of the numbered match slots.
    pub fn is_match_slot(&self, handle: NvHandle) -> bool {
        self.match_handles.contains(&handle)
    }

    /// Handle of numbered match slot `slot`.
    pub fn match_handle(&self, slot: usize) -> NvHandle {
        self.match_handles[slot]
    }
}

impl Inner {
    fn register(&mut self, name: &str) -> NvHandle {
        let handle = NvHandle(u16::try_from(self.names.len() + 1).expect("registry full"));
        self.names.push(NameInfo {
            name: name.into(),
            sdata: name.starts_with(SDATA_PREFIX),
        });
        self.by_name.insert(name.to_string(), handle);
        handle
    }
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'.' || b == b'-')
}

/// Append-only handle -> bytes table with a byte budget.
///
/// A value is either stored directly or is an indirect reference to a
/// substring of another (direct) value, the way parsers bind match slots
/// into the message they matched on without copying.
#[derive(Clone)]
pub struct NvTable {
    budget: usize,
    used: usize,
    entries: Vec<Entry>,
}

#[derive(Clone)]
struct Entry {
    handle: NvHandle,
    value: NvValue,
}

#[derive(Clone)]
enum NvValue {
    Direct(Box<[u8]>),
    Indirect {
        ref_handle: NvHandle,
        ofs: u16,
        len: u16,
    },
}

impl NvValue {
    fn stored_len(&self) -> usize {
        match self {
            NvValue::Direct(value) => value.len(),
            NvValue::Indirect { .. } => 0,
        }
    }
}

impl NvTable {
    pub const DEFAULT_BUDGET: usize = 64 * 1024;

    pub fn new(budget: usize) -> NvTable {
        NvTable {
            budget,
            used: 0,
            entries: Vec::new(),
        }
    }

    fn position(&self, handle: NvHandle) -> Option<usize> {
        self.entries.iter().position(|entry| entry.handle == handle)
    }

    fn replace(&mut self, handle: NvHandle, value: NvValue) {
        match self.position(handle) {
            Some(at) => self.entries[at].value = value,
            None => self.entries.push(Entry { handle, value }),
        }
    }

    /// Store `value` under `handle`, replacing any prior value. Returns
    /// false when the byte budget would be exceeded; the table is then
    /// unchanged.
    pub fn set(&mut self, handle: NvHandle, value: &[u8]) -> bool {
        debug_assert!(!handle.is_none());
        let freed = self
            .position(handle)
            .map(|at| self.entries[at].value.stored_len())
            .unwrap_or(0);

        if self.used - freed + value.len() > self.budget {
            return false;
        }
        self.used = self.used - freed + value.len();
        self.replace(handle, NvValue::Direct(value.into()));
        true
    }

    /// Bind `handle` to a substring of the (direct) value stored under
    /// `ref_handle`. The reference resolves against the current value,
    /// costs no budget, and reads as empty if the referenced value goes
    /// away.
    pub fn set_indirect(&mut self, handle: NvHandle, ref_handle: NvHandle, ofs: u16, len: u16) {
        debug_assert!(!handle.is_none());
        if handle == ref_handle {
            return;
        }
        let freed = self
            .position(handle)
            .map(|at| self.entries[at].value.stored_len())
            .unwrap_or(0);
        self.used -= freed;
        self.replace(
            handle,
            NvValue::Indirect {
                ref_handle,
                ofs,
                len,
            },
        );
    }

    pub fn unset(&mut self, handle: NvHandle) {
        if let Some(at) = self.position(handle) {
            let entry = self.entries.remove(at);
            self.used -= entry.value.stored_len();
        }
    }

    fn resolve(&self, value: &NvValue) -> Option<&[u8]> {
        match value {
            NvValue::Direct(_) => unreachable!("resolve is only called for indirect values"),
            NvValue::Indirect {
                ref_handle,
                ofs,
                len,
            } => {
                // Indirect chains do not resolve; the target must hold a
                // direct value.
                let target = self
                    .entries
                    .iter()
                    .find(|entry| entry.handle == *ref_handle)?;
                let NvValue::Direct(bytes) = &target.value else {
                    return None;
                };
                let start = std::cmp::min(*ofs as usize, bytes.len());
                let end = std::cmp::min(start + *len as usize, bytes.len());
                Some(&bytes[start..end])
            }
        }
    }

    pub fn get(&self, handle: NvHandle) -> Option<&[u8]> {
        let entry = self.entries.iter().find(|entry| entry.handle == handle)?;
        match &entry.value {
            NvValue::Direct(value) => Some(value),
            indirect => Some(self.resolve(indirect).unwrap_or(b"")),
        }
    }

    pub fn is_set(&self, handle: NvHandle) -> bool {
        self.position(handle).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (NvHandle, &[u8])> {
        self.entries.iter().map(|entry| {
            let value = match &entry.value {
                NvValue::Direct(value) => &**value,
                indirect => self.resolve(indirect).unwrap_or(b""),
            };
            (entry.handle, value)
        })
    }

    pub fn used_bytes(&self) -> usize {
        self.used
    }
}
