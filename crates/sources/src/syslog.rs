//! BSD-syslog line parser: `<pri>timestamp host tag[pid]: message`.
//!
//! Tolerant in the way relays must be: a missing or malformed priority
//! falls back to user.notice, a missing timestamp leaves the event stamp
//! at reception time, and anything unrecognized ends up in MESSAGE rather
//! than failing the record.

use crate::proto::{MessageParser, ParseError};
use message::{nv, Context, LogMessage, MsgRef, Stamp, UnixTime};
use std::net::SocketAddr;
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;

const DEFAULT_PRI: u8 = 1 << 3 | 5; // user.notice
const MAX_PRI: u16 = 191;
const TAG_MAX: usize = 32;

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct SyslogOptions {
    /// The transport carries no hostname field (e.g. /dev/log).
    pub no_hostname: bool,
    /// Keep the undistorted `program[pid]:` prefix for legacy templates.
    pub keep_legacy_msghdr: bool,
}

impl Default for SyslogOptions {
    fn default() -> Self {
        SyslogOptions {
            no_hostname: false,
            keep_legacy_msghdr: true,
        }
    }
}

pub struct SyslogParser {
    options: SyslogOptions,
}

impl SyslogParser {
    pub fn new(options: SyslogOptions) -> SyslogParser {
        SyslogParser { options }
    }
}

impl MessageParser for SyslogParser {
    fn parse(
        &self,
        ctx: &Arc<Context>,
        data: &[u8],
        saddr: Option<SocketAddr>,
    ) -> Result<MsgRef, ParseError> {
        let line = match data {
            [head @ .., b'\n'] => head,
            whole => whole,
        };
        if line.is_empty() {
            return Err(ParseError("empty message".to_string()));
        }

        let text = String::from_utf8_lossy(line);
        let mut msg = LogMessage::new(ctx, line.len(), saddr);
        let body = msg.get_mut().expect("fresh message is unique");

        let mut rest = text.as_ref();
        if let Some((pri, after)) = parse_pri(rest) {
            body.set_pri(pri);
            rest = after;
        }

        let recvd = body.stamp(Stamp::Recvd);
        match parse_timestamp(rest, &recvd) {
            Some((stamp, after)) => {
                body.set_stamp(Stamp::Stamp, stamp);
                rest = after.trim_start_matches(' ');
                if !self.options.no_hostname {
                    let (host, after) = take_token(rest);
                    if !host.is_empty() {
                        body.set_value(nv::HOST, host.as_bytes());
                    }
                    rest = after.trim_start_matches(' ');
                }
            }
            None => {
                // No timestamp: the whole line is header-less content and
                // the event time is the reception time.
            }
        }

        if let Some(header) = parse_msg_header(rest) {
            body.set_value(nv::PROGRAM, header.program.as_bytes());
            if let Some(pid) = header.pid {
                body.set_value(nv::PID, pid.as_bytes());
            }
            // PROGRAM and PID invalidate the legacy header, so it is
            // stored last.
            if self.options.keep_legacy_msghdr {
                body.set_value(nv::LEGACY_MSGHDR, header.raw.as_bytes());
            }
            rest = header.rest;
        }

        body.set_value(nv::MESSAGE, rest.as_bytes());
        Ok(msg)
    }
}

/// Parse a `<NNN>` priority prefix; values above 191 are not a priority.
fn parse_pri(input: &str) -> Option<(u8, &str)> {
    let rest = input.strip_prefix('<')?;
    let end = rest.find('>')?;
    if end == 0 || end > 3 {
        return None;
    }
    let pri: u16 = rest[..end].parse().ok()?;
    if pri > MAX_PRI {
        return None;
    }
    Some((pri as u8, &rest[end + 1..]))
}

const MONTHS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

fn parse_timestamp<'a>(input: &'a str, recvd: &UnixTime) -> Option<(UnixTime, &'a str)> {
    parse_rfc3339_timestamp(input).or_else(|| parse_bsd_timestamp(input, recvd))
}

/// ISO timestamp as produced by `$ISODATE` senders, ended by a space.
fn parse_rfc3339_timestamp(input: &str) -> Option<(UnixTime, &str)> {
    let token_len = input.find(' ').unwrap_or(input.len());
    let token = &input[..token_len];
    let parsed = time::OffsetDateTime::parse(token, &Rfc3339).ok()?;
    Some((
        UnixTime {
            sec: parsed.unix_timestamp(),
            usec: parsed.microsecond(),
            gmtoff_secs: parsed.offset().whole_seconds(),
        },
        &input[token_len..],
    ))
}

/// Classic `Mmm dd hh:mm:ss`. The year is not on the wire; the reception
/// time's year applies.
fn parse_bsd_timestamp<'a>(input: &'a str, recvd: &UnixTime) -> Option<(UnixTime, &'a str)> {
    if input.len() < 15 || !input.is_char_boundary(15) {
        return None;
    }
    let (stamp, rest) = input.split_at(15);
    let bytes = stamp.as_bytes();

    let month = MONTHS.iter().position(|name| stamp.starts_with(name))? as u8 + 1;
    if bytes[3] != b' ' || bytes[6] != b' ' || bytes[9] != b':' || bytes[12] != b':' {
        return None;
    }
    let day: u8 = stamp[4..6].trim_start().parse().ok()?;
    let hour: u8 = stamp[7..9].parse().ok()?;
    let minute: u8 = stamp[10..12].parse().ok()?;
    let second: u8 = stamp[13..15].parse().ok()?;

    let recvd_time = time::OffsetDateTime::from_unix_timestamp(recvd.sec)
        .ok()?
        .to_offset(time::UtcOffset::from_whole_seconds(recvd.gmtoff_secs).ok()?);
    let date = time::Date::from_calendar_date(
        recvd_time.year(),
        time::Month::try_from(month).ok()?,
        day,
    )
    .ok()?;
    let moment = date
        .with_hms(hour, minute, second)
        .ok()?
        .assume_offset(recvd_time.offset());

    Some((
        UnixTime {
            sec: moment.unix_timestamp(),
            usec: 0,
            gmtoff_secs: recvd.gmtoff_secs,
        },
        rest,
    ))
}

fn take_token(input: &str) -> (&str, &str) {
    let end = input.find(' ').unwrap_or(input.len());
    input.split_at(end)
}

struct MsgHeader<'a> {
    program: &'a str,
    pid: Option<&'a str>,
    /// The verbatim `program[pid]: ` prefix.
    raw: &'a str,
    rest: &'a str,
}

fn is_tag_char(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || matches!(byte, b'_' | b'-' | b'.' | b'/' | b'(' | b')')
}

/// Parse the `program[pid]:` message header, if present.
fn parse_msg_header(input: &str) -> Option<MsgHeader<'_>> {
    let bytes = input.as_bytes();
    let mut i = 0;
    while i < bytes.len() && i < TAG_MAX && is_tag_char(bytes[i]) {
        i += 1;
    }
    if i == 0 {
        return None;
    }
    let program = &input[..i];

    let mut pid = None;
    let mut at = i;
    if bytes.get(at) == Some(&b'[') {
        let close = input[at..].find(']')? + at;
        pid = Some(&input[at + 1..close]);
        at = close + 1;
    }
    if bytes.get(at) != Some(&b':') {
        return None;
    }
    at += 1;
    let raw = &input[..at];
    let rest = input[at..].strip_prefix(' ').unwrap_or(&input[at..]);
    Some(MsgHeader {
        program,
        pid,
        raw,
        rest,
    })
}
