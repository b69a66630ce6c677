use crate::cell::RefAckCell;
use crate::nv::{self, NvHandle, NvTable};
use crate::tags::{TagId, TagSet};
use crate::{refcache, AckHook, AckToken, AckType, Context, PathOptions};
use std::mem::ManuallyDrop;
use std::net::SocketAddr;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Seconds / microseconds / local offset of one message timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnixTime {
    pub sec: i64,
    pub usec: u32,
    pub gmtoff_secs: i32,
}

impl UnixTime {
    pub const UNSET: UnixTime = UnixTime {
        sec: -1,
        usec: 0,
        gmtoff_secs: 0,
    };

    pub fn is_set(&self) -> bool {
        self.sec >= 0
    }

    pub fn now(gmtoff_secs: i32) -> UnixTime {
        let elapsed = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        UnixTime {
            sec: elapsed.as_secs() as i64,
            usec: elapsed.subsec_micros(),
            gmtoff_secs,
        }
    }
}

/// The three message timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stamp {
    /// Event time, as parsed from the message.
    Stamp = 0,
    /// Reception time.
    Recvd = 1,
    /// Time of the first egress attempt; starts unset.
    Processed = 2,
}

/// Message state bits.
pub mod flags {
    /// The message originates on this host.
    pub const LOCAL: u32 = 0x0001;
    /// The message was generated by the engine itself.
    pub const INTERNAL: u32 = 0x0002;
    /// Periodic mark message.
    pub const MARK: u32 = 0x0004;
    /// The hostname field was built by chaining relay hostnames.
    pub const CHAINED_HOSTNAME: u32 = 0x0008;
}

const DEFAULT_PRI: u8 = 1 << 3 | 5; // user.notice
const MARK_PRI: u8 = 5 << 3 | 6; // syslog.info

const SDATA_MAX: usize = 255;

/// One log record in flight.
///
/// Constructors hand out a [`MsgRef`]; `&mut LogMessage` access afterwards
/// goes through [`MsgRef::get_mut`] (unique handles) or
/// [`MsgRef::make_writable`] (clones when write-protected).
pub struct LogMessage {
    ctx: Arc<Context>,

    payload: Arc<NvTable>,
    tags: TagSet,
    sdata: Arc<Vec<NvHandle>>,
    num_matches: u16,

    timestamps: [UnixTime; 3],
    pri: u8,
    host_id: u32,
    rcptid: u64,
    saddr: Option<SocketAddr>,
    daddr: Option<SocketAddr>,
    proto: i32,
    flags: u32,

    /// Non-zero forbids in-place mutation; writers must clone first.
    protect_cnt: AtomicU32,
    original: Option<MsgRef>,
    ack_hook: Option<AckHook>,
    ack_token: Option<AckToken>,

    pub(crate) cell: RefAckCell,
}

impl LogMessage {
    fn new_body(ctx: &Arc<Context>, payload_budget: usize) -> LogMessage {
        let now = UnixTime::now(ctx.tz_offset_secs());
        LogMessage {
            ctx: ctx.clone(),
            payload: Arc::new(NvTable::new(payload_budget)),
            tags: TagSet::new(),
            sdata: Arc::new(Vec::new()),
            num_matches: 0,
            timestamps: [now, now, UnixTime::UNSET],
            pri: DEFAULT_PRI,
            host_id: ctx.host_id(),
            rcptid: ctx.next_rcptid(),
            saddr: None,
            daddr: None,
            proto: 0,
            flags: 0,
            protect_cnt: AtomicU32::new(0),
            original: None,
            ack_hook: None,
            ack_token: None,
            cell: RefAckCell::new(1),
        }
    }

    /// An empty message with a small payload table.
    pub fn new_empty(ctx: &Arc<Context>) -> MsgRef {
        MsgRef::from_body(Self::new_body(ctx, 256))
    }

    /// A message sized for a raw record of `raw_len` bytes, to be populated
    /// by a parser.
    pub fn new(ctx: &Arc<Context>, raw_len: usize, saddr: Option<SocketAddr>) -> MsgRef {
        let mut body = Self::new_body(ctx, std::cmp::max(256, raw_len * 2));
        body.saddr = saddr;
        MsgRef::from_body(body)
    }

    /// A message considered local to this host.
    pub fn new_local(ctx: &Arc<Context>) -> MsgRef {
        let mut body = Self::new_body(ctx, 256);
        body.flags |= flags::LOCAL;
        MsgRef::from_body(body)
    }

    /// A message originating from the engine itself.
    pub fn new_internal(ctx: &Arc<Context>, pri: u8, text: &str) -> MsgRef {
        let mut body = Self::new_body(ctx, std::cmp::max(256, text.len() * 2));
        body.flags |= flags::LOCAL | flags::INTERNAL;
        body.pri = pri;
        body.set_value(nv::PROGRAM, b"rill");
        body.set_value(nv::PID, std::process::id().to_string().as_bytes());
        body.set_value(nv::MESSAGE, text.as_bytes());
        MsgRef::from_body(body)
    }

    /// A periodic `-- MARK --` message.
    pub fn new_mark(ctx: &Arc<Context>) -> MsgRef {
        let mut body = Self::new_body(ctx, 256);
        body.flags |= flags::LOCAL | flags::MARK | flags::INTERNAL;
        body.pri = MARK_PRI;
        body.set_value(nv::MESSAGE, b"-- MARK --");
        MsgRef::from_body(body)
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    fn log_value_updates(&self) -> bool {
        // Internal messages are populated from within the logging machinery
        // itself; tracing them would recurse.
        self.flags & flags::INTERNAL == 0
    }

    /// Store `value` under `handle`. A value that would exceed the payload
    /// budget is dropped; the message is delivered without it.
    pub fn set_value(&mut self, handle: NvHandle, value: &[u8]) {
        assert!(
            !self.is_write_protected(),
            "set_value on a write-protected message"
        );
        if handle.is_none() {
            return;
        }

        if tracing::enabled!(tracing::Level::TRACE) && self.log_value_updates() {
            tracing::trace!(
                name = self.ctx.values().name(handle).as_deref().unwrap_or("?"),
                value = %String::from_utf8_lossy(value),
                rcptid = self.rcptid,
                "setting value",
            );
        }

        let new_entry = !self.payload.is_set(handle);
        if !Arc::make_mut(&mut self.payload).set(handle, value) {
            tracing::info!(
                name = self.ctx.values().name(handle).as_deref().unwrap_or("?"),
                rcptid = self.rcptid,
                "cannot store value, message payload budget reached",
            );
            return;
        }

        if new_entry && self.ctx.values().is_sdata(handle) {
            if self.sdata.len() == SDATA_MAX {
                tracing::error!(
                    rcptid = self.rcptid,
                    "structured-data element limit of {SDATA_MAX} reached, dropping element",
                );
            } else {
                Arc::make_mut(&mut self.sdata).push(handle);
            }
        }

        if handle == nv::PROGRAM || handle == nv::PID {
            self.unset_value(nv::LEGACY_MSGHDR);
        }
    }

    /// Bind `handle` to a substring of another value without copying;
    /// parsers use this for match slots over the message they matched.
    pub fn set_value_indirect(
        &mut self,
        handle: NvHandle,
        ref_handle: NvHandle,
        ofs: u16,
        len: u16,
    ) {
        assert!(
            !self.is_write_protected(),
            "set_value_indirect on a write-protected message"
        );
        if handle.is_none() {
            return;
        }
        let new_entry = !self.payload.is_set(handle);
        Arc::make_mut(&mut self.payload).set_indirect(handle, ref_handle, ofs, len);
        if new_entry && self.ctx.values().is_sdata(handle) && self.sdata.len() < SDATA_MAX {
            Arc::make_mut(&mut self.sdata).push(handle);
        }
        if handle == nv::PROGRAM || handle == nv::PID {
            self.unset_value(nv::LEGACY_MSGHDR);
        }
    }

    pub fn set_value_by_name(&mut self, name: &str, value: &[u8]) {
        match self.ctx.values().handle(name) {
            Ok(handle) => self.set_value(handle, value),
            Err(error) => {
                tracing::error!(%error, "cannot store value under invalid name");
            }
        }
    }

    pub fn unset_value(&mut self, handle: NvHandle) {
        Arc::make_mut(&mut self.payload).unset(handle);
        if handle == nv::PROGRAM || handle == nv::PID {
            self.unset_value(nv::LEGACY_MSGHDR);
        }
    }

    pub fn get_value(&self, handle: NvHandle) -> &[u8] {
        self.payload.get(handle).unwrap_or(b"")
    }

    pub fn get_value_by_name(&self, name: &str) -> &[u8] {
        match self.ctx.values().get_handle(name) {
            Some(handle) => self.get_value(handle),
            None => b"",
        }
    }

    pub fn values(&self) -> impl Iterator<Item = (NvHandle, &[u8])> {
        self.payload.iter()
    }

    /// Handles of the structured-data elements, in insertion order.
    pub fn sdata_handles(&self) -> &[NvHandle] {
        &self.sdata
    }

    /// Render the structured-data fields as RFC5424 SD-ELEMENTs:
    /// `[elem param="value"...]` per element, in insertion order.
    pub fn format_sdata(&self) -> String {
        let mut out = String::new();
        let mut open_element: Option<String> = None;

        for handle in self.sdata.iter() {
            let Some(name) = self.ctx.values().name(*handle) else {
                continue;
            };
            let Some(qualified) = name.strip_prefix(nv::SDATA_PREFIX) else {
                continue;
            };
            let (element, param) = match qualified.rsplit_once('.') {
                Some(split) => split,
                None => (qualified, ""),
            };

            if open_element.as_deref() != Some(element) {
                if open_element.is_some() {
                    out.push(']');
                }
                out.push('[');
                out.push_str(element);
                open_element = Some(element.to_string());
            }
            out.push(' ');
            out.push_str(param);
            out.push_str("=\"");
            for ch in String::from_utf8_lossy(self.get_value(*handle)).chars() {
                if matches!(ch, '"' | '\\' | ']') {
                    out.push('\\');
                }
                out.push(ch);
            }
            out.push('"');
        }
        if open_element.is_some() {
            out.push(']');
        }
        out
    }

    /// Fill any values of `self` which are unset from `context`; later
    /// messages of the slice take precedence.
    pub fn merge_context(&mut self, context: &[MsgRef]) {
        for msg in context.iter().rev() {
            let values: Vec<(NvHandle, Vec<u8>)> = msg
                .values()
                .filter(|(handle, _)| !self.payload.is_set(*handle))
                .map(|(handle, value)| (handle, value.to_vec()))
                .collect();
            for (handle, value) in values {
                self.set_value(handle, &value);
            }
        }
    }

    pub fn set_match(&mut self, slot: usize, value: &[u8]) {
        assert!(slot < nv::MATCH_SLOTS);
        if slot as u16 >= self.num_matches {
            self.num_matches = slot as u16 + 1;
        }
        self.set_value(self.ctx.values().match_handle(slot), value);
    }

    pub fn set_match_indirect(&mut self, slot: usize, ref_handle: NvHandle, ofs: u16, len: u16) {
        assert!(slot < nv::MATCH_SLOTS);
        if slot as u16 >= self.num_matches {
            self.num_matches = slot as u16 + 1;
        }
        self.set_value_indirect(self.ctx.values().match_handle(slot), ref_handle, ofs, len);
    }

    pub fn get_match(&self, slot: usize) -> &[u8] {
        assert!(slot < nv::MATCH_SLOTS);
        self.get_value(self.ctx.values().match_handle(slot))
    }

    pub fn clear_matches(&mut self) {
        for slot in 0..self.num_matches as usize {
            self.set_value(self.ctx.values().match_handle(slot), b"");
        }
        self.num_matches = 0;
    }

    pub fn num_matches(&self) -> usize {
        self.num_matches as usize
    }

    pub fn set_tag(&mut self, id: TagId, on: bool) {
        assert!(
            !self.is_write_protected(),
            "set_tag on a write-protected message"
        );
        if let Err(error) = self.tags.set(id, on) {
            tracing::error!(%error, rcptid = self.rcptid, "maximum number of tags reached");
        }
    }

    pub fn set_tag_by_name(&mut self, name: &str, on: bool) {
        match self.ctx.tags().id(name) {
            Ok(id) => self.set_tag(id, on),
            Err(error) => {
                tracing::error!(%error, rcptid = self.rcptid, "maximum number of tags reached");
            }
        }
    }

    pub fn is_tag(&self, id: TagId) -> bool {
        self.tags.get(id)
    }

    pub fn is_tag_by_name(&self, name: &str) -> bool {
        match self.ctx.tags().id(name) {
            Ok(id) => self.tags.get(id),
            Err(_) => false,
        }
    }

    pub fn tags_foreach(&self, f: impl FnMut(TagId)) {
        self.tags.for_each(f)
    }

    pub fn stamp(&self, which: Stamp) -> UnixTime {
        self.timestamps[which as usize]
    }

    pub fn set_stamp(&mut self, which: Stamp, stamp: UnixTime) {
        self.timestamps[which as usize] = stamp;
    }

    pub fn pri(&self) -> u8 {
        self.pri
    }

    pub fn set_pri(&mut self, pri: u8) {
        self.pri = pri;
    }

    pub fn host_id(&self) -> u32 {
        self.host_id
    }

    pub fn rcptid(&self) -> u64 {
        self.rcptid
    }

    pub fn saddr(&self) -> Option<SocketAddr> {
        self.saddr
    }

    pub fn set_saddr(&mut self, saddr: Option<SocketAddr>) {
        self.saddr = saddr;
    }

    pub fn daddr(&self) -> Option<SocketAddr> {
        self.daddr
    }

    pub fn set_daddr(&mut self, daddr: Option<SocketAddr>) {
        self.daddr = daddr;
    }

    pub fn proto(&self) -> i32 {
        self.proto
    }

    pub fn set_proto(&mut self, proto: i32) {
        self.proto = proto;
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn set_flag(&mut self, flag: u32) {
        self.flags |= flag;
    }

    pub fn is_write_protected(&self) -> bool {
        self.protect_cnt.load(Ordering::Acquire) > 0
    }

    pub fn ack_token(&self) -> Option<AckToken> {
        self.ack_token
    }

    pub fn set_ack_token(&mut self, token: AckToken) {
        self.ack_token = Some(token);
    }

    pub fn set_ack_hook(&mut self, hook: AckHook) {
        self.ack_hook = Some(hook);
    }

    pub fn original(&self) -> Option<&MsgRef> {
        self.original.as_ref()
    }
}

/// Shared handle of a [`LogMessage`].
///
/// Cloning and dropping adjust the packed reference count (through the
/// thread's refcache session when one is active for this message); the
/// body is freed when the count reaches zero.
pub struct MsgRef {
    ptr: NonNull<LogMessage>,
}

// Safety: the body is only mutated through `get_mut` (which proves the
// handle is unique, including this thread's cached delta) and all other
// shared state within it is atomic or behind locks.
unsafe impl Send for MsgRef {}
unsafe impl Sync for MsgRef {}

impl MsgRef {
    fn from_body(body: LogMessage) -> MsgRef {
        let ptr = NonNull::new(Box::into_raw(Box::new(body))).expect("Box pointers are non-null");
        MsgRef { ptr }
    }

    pub(crate) fn as_ptr(&self) -> *const LogMessage {
        self.ptr.as_ptr()
    }

    fn cell(&self) -> &RefAckCell {
        &self.body().cell
    }

    fn body(&self) -> &LogMessage {
        // Safety: the handle keeps the body alive, and shared access is the
        // default for a published message.
        unsafe { self.ptr.as_ref() }
    }

    /// Exclusive access to the body, available while this handle is the
    /// only reference (counting this thread's cached ref delta).
    pub fn get_mut(&mut self) -> Option<&mut LogMessage> {
        let total = self.cell().load().refs() as i64
            + refcache::cached_ref_delta(self.as_ptr()) as i64;
        if total == 1 {
            // Safety: sole reference, so no aliasing borrow can exist.
            Some(unsafe { self.ptr.as_mut() })
        } else {
            None
        }
    }

    /// Exclusive access to a message which may be shared or protected:
    /// write-protected messages are first replaced by a copy-on-write
    /// clone, exactly as consumers are required to do before mutating.
    pub fn make_writable(&mut self, path_options: &PathOptions) -> &mut LogMessage {
        if self.is_write_protected() {
            *self = self.clone_cow(path_options);
        }
        self.get_mut()
            .expect("an unprotected message must be exclusively owned before mutation")
    }

    /// Forbid in-place mutation of this message until a matching
    /// [`MsgRef::write_unprotect`].
    pub fn write_protect(&self) {
        self.body().protect_cnt.fetch_add(1, Ordering::AcqRel);
    }

    pub fn write_unprotect(&self) {
        let old = self.body().protect_cnt.fetch_sub(1, Ordering::AcqRel);
        assert!(old > 0, "unbalanced write_unprotect");
    }

    /// Clone this message copy-on-write. The clone shares the payload,
    /// tags, and sdata of the original; if `path_options.ack_needed`, an
    /// ack of the clone forwards the same outcome to the original.
    pub fn clone_cow(&self, path_options: &PathOptions) -> MsgRef {
        self.write_protect();
        let src = self.body();

        tracing::trace!(rcptid = src.rcptid, "message cloned");

        let ack_hook: Option<AckHook> = if path_options.ack_needed {
            Some(Arc::new(|msg: &MsgRef, ack_type: AckType| {
                let original = msg.original().expect("clone ack hook requires an original");
                original.ack(&PathOptions::default(), ack_type);
            }))
        } else {
            None
        };

        let clone = MsgRef::from_body(LogMessage {
            ctx: src.ctx.clone(),
            payload: src.payload.clone(),
            tags: src.tags.clone(),
            sdata: src.sdata.clone(),
            num_matches: src.num_matches,
            timestamps: src.timestamps,
            pri: src.pri,
            host_id: src.host_id,
            rcptid: src.rcptid,
            saddr: src.saddr,
            daddr: src.daddr,
            proto: src.proto,
            flags: src.flags,
            protect_cnt: AtomicU32::new(0),
            original: Some(self.clone()),
            ack_hook,
            ack_token: src.ack_token,
            cell: RefAckCell::new(1),
        });
        clone.add_ack(path_options);
        clone
    }

    /// Register one more pending acknowledgement.
    pub fn add_ack(&self, path_options: &PathOptions) {
        if !path_options.ack_needed {
            return;
        }
        if refcache::cached_add_ack(self.as_ptr()) {
            return;
        }
        self.cell().update(0, 1, false, false);
    }

    /// Acknowledge this message. When the pending ack count drops to zero
    /// the ack hook fires once, with the combined outcome
    /// (suspended > aborted > processed).
    pub fn ack(&self, path_options: &PathOptions, ack_type: AckType) {
        if !path_options.ack_needed {
            return;
        }
        if refcache::cached_ack(self.as_ptr(), ack_type) {
            return;
        }

        let old = self.cell().update(
            0,
            -1,
            ack_type == AckType::Aborted,
            ack_type == AckType::Suspended,
        );
        debug_assert!(old.acks() >= 1, "ack without a matching add_ack");
        if old.acks() == 1 {
            let outcome = match ack_type {
                AckType::Suspended => AckType::Suspended,
                AckType::Aborted => AckType::Aborted,
                AckType::Processed => old.outcome(),
            };
            self.invoke_ack_hook(outcome);
        }
    }

    /// Ack and consume in one step; used by destinations which cannot
    /// process the message.
    pub fn drop_msg(self, path_options: &PathOptions, ack_type: AckType) {
        self.ack(path_options, ack_type);
    }

    /// Break out of an acknowledgement chain: ack the message now and
    /// return path options for further consumers which no longer
    /// participate. Not permitted on flow-controlled paths, where an early
    /// ack would mean message loss.
    pub fn break_ack(&self, path_options: &PathOptions) -> PathOptions {
        assert!(
            !path_options.flow_control_requested,
            "cannot break the ack chain of a flow-controlled path"
        );
        self.ack(path_options, AckType::Processed);
        PathOptions {
            ack_needed: false,
            ..*path_options
        }
    }

    fn invoke_ack_hook(&self, outcome: AckType) {
        let hook = self.body().ack_hook.clone();
        if let Some(hook) = hook {
            hook(self, outcome);
        }
    }
}

impl Clone for MsgRef {
    fn clone(&self) -> MsgRef {
        if !refcache::cached_ref(self.as_ptr()) {
            let old = self.cell().update(1, 0, false, false);
            debug_assert!(old.refs() >= 1, "clone of a dead message");
        }
        MsgRef { ptr: self.ptr }
    }
}

impl Drop for MsgRef {
    fn drop(&mut self) {
        if refcache::cached_unref(self.as_ptr()) {
            return;
        }
        let old = self.cell().update(-1, 0, false, false);
        debug_assert!(old.refs() >= 1, "drop of a dead message");
        if old.refs() == 1 {
            // Safety: the count reached zero, this was the last handle.
            unsafe { free(self.ptr) }
        }
    }
}

impl std::ops::Deref for MsgRef {
    type Target = LogMessage;

    fn deref(&self) -> &LogMessage {
        self.body()
    }
}

impl std::fmt::Debug for MsgRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MsgRef")
            .field("rcptid", &self.rcptid())
            .field("cell", &self.body().cell)
            .finish()
    }
}

pub(crate) unsafe fn free(ptr: NonNull<LogMessage>) {
    drop(Box::from_raw(ptr.as_ptr()));
}

pub(crate) fn cell_of<'a>(ptr: NonNull<LogMessage>) -> &'a RefAckCell {
    // Safety: callers hold the message alive (refcache sessions bias or
    // anchor the count for their whole duration).
    unsafe { &ptr.as_ref().cell }
}

/// Invoke the ack hook of the message at `ptr` without adjusting its
/// reference count.
pub(crate) unsafe fn invoke_hook(ptr: NonNull<LogMessage>, outcome: AckType) {
    let borrowed = ManuallyDrop::new(MsgRef { ptr });
    borrowed.invoke_ack_hook(outcome);
}

pub(crate) fn raw_ptr(msg: &MsgRef) -> NonNull<LogMessage> {
    msg.ptr
}
