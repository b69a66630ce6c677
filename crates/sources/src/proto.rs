//! Contracts between the reader and its collaborators: the framed-bytes
//! parser (proto), fd readiness (poll events), the message parser, and the
//! control pipe which reacts to notify codes.

use crate::NotifyCode;
use acks::BookmarkRef;
use bytes::Bytes;
use message::{Context, LogMessage, MsgRef};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// I/O readiness interest or observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IoCondition {
    pub input: bool,
    pub output: bool,
}

impl IoCondition {
    pub const IN: IoCondition = IoCondition {
        input: true,
        output: false,
    };
    pub const OUT: IoCondition = IoCondition {
        input: false,
        output: true,
    };
}

/// What the reader should poll for next, decided by the proto.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepareAction {
    /// Arm fd watches with the given conditions.
    PollIo(IoCondition),
    /// Skip polling, schedule a fetch on the next loop tick (the proto has
    /// buffered data to deliver).
    ForceSchedule,
    /// Nothing to do until an external wakeup.
    Suspend,
}

#[derive(Debug, Clone, Copy)]
pub struct Prepared {
    pub action: PrepareAction,
    /// Close the connection when no message arrives for this long.
    pub idle_timeout: Option<Duration>,
}

impl Prepared {
    pub fn poll_in() -> Prepared {
        Prepared {
            action: PrepareAction::PollIo(IoCondition::IN),
            idle_timeout: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtoStatus {
    Success,
    Again,
    Eof,
    Error,
}

/// Result of one fetch attempt.
pub enum Fetched {
    /// A complete record. May be empty (an empty line).
    Data(Bytes),
    /// No more records right now.
    NoData,
    Eof,
    Error,
}

/// Transport metadata accompanying one fetched record.
#[derive(Debug, Default)]
pub struct AuxData {
    pub peer_addr: Option<SocketAddr>,
    pub local_addr: Option<SocketAddr>,
    /// Transport tag (socket protocol number).
    pub proto: i32,
    values: Vec<(String, Vec<u8>)>,
}

impl AuxData {
    pub fn add_value(&mut self, name: &str, value: &[u8]) {
        self.values.push((name.to_string(), value.to_vec()));
    }

    pub fn values(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.values
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_slice()))
    }

    pub fn reinit(&mut self) {
        *self = AuxData::default();
    }
}

/// Parses framed bytes into records; implemented per transport driver.
///
/// `fetch` fills the bookmark slot with the position of the returned
/// record before yielding it, and honors `may_read` for multi-read
/// control: a proto which must not issue more than one read per readiness
/// event clears it after the first read.
pub trait LogProtoServer: Send {
    fn handshake_in_progress(&self) -> bool {
        false
    }

    fn handshake(&mut self) -> ProtoStatus {
        ProtoStatus::Success
    }

    fn prepare(&mut self) -> Prepared;

    fn fetch(
        &mut self,
        bookmark: &BookmarkRef,
        may_read: &mut bool,
        aux: Option<&mut AuxData>,
    ) -> Fetched;
}

/// Arms and suspends fd readiness watches for the reader. Readiness is
/// delivered by sending [`crate::ReaderEvent::Readable`] to the reader's
/// handle.
pub trait PollEvents: Send {
    fn update_watches(&mut self, cond: IoCondition);

    fn suspend_watches(&mut self);
}

/// Receives reader notify codes; decides reopen/teardown policy.
pub trait ControlPipe: Send + Sync {
    fn notify(&self, code: NotifyCode);
}

#[derive(Debug, thiserror::Error)]
#[error("malformed record: {0}")]
pub struct ParseError(pub String);

/// Builds a [`LogMessage`] from one raw record.
pub trait MessageParser: Send + Sync {
    fn parse(
        &self,
        ctx: &Arc<Context>,
        data: &[u8],
        saddr: Option<SocketAddr>,
    ) -> Result<MsgRef, ParseError>;
}

/// Parser of last resort: the whole record becomes the MESSAGE value.
pub struct PlainTextParser;

impl MessageParser for PlainTextParser {
    fn parse(
        &self,
        ctx: &Arc<Context>,
        data: &[u8],
        saddr: Option<SocketAddr>,
    ) -> Result<MsgRef, ParseError> {
        let mut msg = LogMessage::new(ctx, data.len(), saddr);
        let line = match data {
            [head @ .., b'\n'] => head,
            whole => whole,
        };
        msg.get_mut()
            .expect("fresh message is unique")
            .set_value(message::nv::MESSAGE, line);
        Ok(msg)
    }
}
