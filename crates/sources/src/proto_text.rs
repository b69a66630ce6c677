//! Newline-framed proto server over a byte stream.
//!
//! Buffers reads from the underlying transport and hands out one record
//! per line. Each fetched record fills the tracker's bookmark slot with
//! the stream offset to resume from, through a driver-installed filler.

use crate::proto::{Fetched, LogProtoServer, Prepared, AuxData, PrepareAction, IoCondition};
use acks::BookmarkRef;
use bytes::Bytes;
use std::io::Read;

const READ_CHUNK: usize = 8 * 1024;

/// Installed by the driver to translate a resume offset into its own
/// bookmark payload.
pub type BookmarkFiller = Box<dyn Fn(&BookmarkRef, u64) + Send>;

pub struct TextProtoServer {
    transport: Box<dyn Read + Send>,
    buffer: Vec<u8>,
    /// Stream offset of `buffer[0]`.
    base_offset: u64,
    /// Bytes of `buffer` already handed out as records.
    consumed: usize,
    eof: bool,
    eof_delivered: bool,
    /// Whether more than one transport read may happen per fetch job.
    multi_read: bool,
    bookmark_filler: Option<BookmarkFiller>,
}

impl TextProtoServer {
    pub fn new(transport: Box<dyn Read + Send>) -> TextProtoServer {
        TextProtoServer {
            transport,
            buffer: Vec::new(),
            base_offset: 0,
            consumed: 0,
            eof: false,
            eof_delivered: false,
            multi_read: true,
            bookmark_filler: None,
        }
    }

    /// Restrict the proto to a single transport read per readiness event;
    /// used by transports where a second read would block.
    pub fn single_read(mut self) -> TextProtoServer {
        self.multi_read = false;
        self
    }

    /// Resume from a persisted position: reads continue at `offset`.
    pub fn starting_at(mut self, offset: u64) -> TextProtoServer {
        self.base_offset = offset;
        self
    }

    pub fn set_bookmark_filler(&mut self, filler: BookmarkFiller) {
        self.bookmark_filler = Some(filler);
    }

    /// Stream offset of the next unconsumed byte.
    pub fn pending_offset(&self) -> u64 {
        self.base_offset + self.consumed as u64
    }

    fn has_buffered_record(&self) -> bool {
        let pending = &self.buffer[self.consumed..];
        !pending.is_empty() && (pending.contains(&b'\n') || self.eof)
    }

    /// Take the next buffered line, or the unterminated trailing record
    /// once the transport hit EOF.
    fn take_record(&mut self) -> Option<(Bytes, u64)> {
        let pending = &self.buffer[self.consumed..];
        let line_len = match pending.iter().position(|byte| *byte == b'\n') {
            Some(newline) => newline + 1,
            None if self.eof && !pending.is_empty() => pending.len(),
            None => return None,
        };

        let record_end = match pending[line_len - 1] {
            b'\n' => line_len - 1,
            _ => line_len,
        };
        let record = Bytes::copy_from_slice(&pending[..record_end]);
        self.consumed += line_len;
        let resume_offset = self.base_offset + self.consumed as u64;

        // Compact once everything buffered was handed out.
        if self.consumed == self.buffer.len() {
            self.base_offset += self.consumed as u64;
            self.buffer.clear();
            self.consumed = 0;
        }
        Some((record, resume_offset))
    }

    fn fill_bookmark(&self, bookmark: &BookmarkRef, resume_offset: u64) {
        if let Some(filler) = &self.bookmark_filler {
            filler(bookmark, resume_offset);
        }
    }
}

impl LogProtoServer for TextProtoServer {
    fn prepare(&mut self) -> Prepared {
        let action = if self.has_buffered_record() {
            // Buffered input is deliverable without polling.
            PrepareAction::ForceSchedule
        } else if self.eof {
            if self.eof_delivered {
                // The close notification is out; nothing further to poll.
                PrepareAction::Suspend
            } else {
                PrepareAction::ForceSchedule
            }
        } else {
            PrepareAction::PollIo(IoCondition::IN)
        };
        Prepared {
            action,
            idle_timeout: None,
        }
    }

    fn fetch(
        &mut self,
        bookmark: &BookmarkRef,
        may_read: &mut bool,
        _aux: Option<&mut AuxData>,
    ) -> Fetched {
        loop {
            if let Some((record, resume_offset)) = self.take_record() {
                self.fill_bookmark(bookmark, resume_offset);
                return Fetched::Data(record);
            }
            if self.eof {
                self.eof_delivered = true;
                return Fetched::Eof;
            }
            if !*may_read {
                return Fetched::NoData;
            }
            if !self.multi_read {
                *may_read = false;
            }

            let mut chunk = [0u8; READ_CHUNK];
            match self.transport.read(&mut chunk) {
                Ok(0) => self.eof = true,
                Ok(n) => self.buffer.extend_from_slice(&chunk[..n]),
                Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => {
                    return Fetched::NoData;
                }
                Err(error) if error.kind() == std::io::ErrorKind::Interrupted => {}
                Err(error) => {
                    tracing::error!(%error, "transport read failed");
                    return Fetched::Error;
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;
    use std::sync::{Arc, Mutex};

    fn slot() -> BookmarkRef {
        acks::AckTrackerFactory::InstantBookmarkless
            .create(1)
            .request_bookmark()
    }

    fn new_proto(content: &str) -> TextProtoServer {
        TextProtoServer::new(Box::new(Cursor::new(content.as_bytes().to_vec())))
    }

    fn fetch_all(proto: &mut TextProtoServer) -> (Vec<String>, bool) {
        let bookmark = slot();
        let mut records = Vec::new();
        loop {
            let mut may_read = true;
            match proto.fetch(&bookmark, &mut may_read, None) {
                Fetched::Data(record) => {
                    records.push(String::from_utf8_lossy(&record).into_owned())
                }
                Fetched::Eof => return (records, true),
                Fetched::NoData => return (records, false),
                Fetched::Error => panic!("unexpected read error"),
            }
        }
    }

    #[test]
    fn test_lines_framed_and_eof() {
        let mut proto = new_proto("one\ntwo\nthree\n");
        let (records, eof) = fetch_all(&mut proto);
        assert_eq!(records, vec!["one", "two", "three"]);
        assert!(eof);
    }

    #[test]
    fn test_unterminated_trailing_record_delivered_at_eof() {
        let mut proto = new_proto("one\npartial");
        let (records, eof) = fetch_all(&mut proto);
        assert_eq!(records, vec!["one", "partial"]);
        assert!(eof);
    }

    #[test]
    fn test_empty_lines_are_records() {
        let mut proto = new_proto("a\n\nb\n");
        let (records, _) = fetch_all(&mut proto);
        assert_eq!(records, vec!["a", "", "b"]);
    }

    #[test]
    fn test_bookmark_carries_resume_offsets() {
        let offsets = Arc::new(Mutex::new(Vec::new()));
        let offsets_in_filler = offsets.clone();

        let mut proto = new_proto("one\ntwo\n");
        proto.set_bookmark_filler(Box::new(move |_bookmark, offset| {
            offsets_in_filler.lock().unwrap().push(offset);
        }));
        fetch_all(&mut proto);

        // Each record's bookmark holds the offset to resume from: the
        // byte after its newline.
        assert_eq!(*offsets.lock().unwrap(), vec![4, 8]);
    }

    #[test]
    fn test_starting_at_biases_offsets() {
        let offsets = Arc::new(Mutex::new(Vec::new()));
        let offsets_in_filler = offsets.clone();

        let mut proto = new_proto("abc\n").starting_at(100);
        proto.set_bookmark_filler(Box::new(move |_bookmark, offset| {
            offsets_in_filler.lock().unwrap().push(offset);
        }));
        fetch_all(&mut proto);
        assert_eq!(*offsets.lock().unwrap(), vec![104]);
    }

    #[test]
    fn test_single_read_honors_may_read() {
        /// Yields one byte per read, so a record spans several reads.
        struct TrickleReader {
            content: Vec<u8>,
            at: usize,
        }
        impl Read for TrickleReader {
            fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
                if self.at == self.content.len() {
                    return Ok(0);
                }
                buf[0] = self.content[self.at];
                self.at += 1;
                Ok(1)
            }
        }

        let mut proto = TextProtoServer::new(Box::new(TrickleReader {
            content: b"ab\n".to_vec(),
            at: 0,
        }))
        .single_read();

        let bookmark = slot();
        // One read per fetch: the first two fetches buffer 'a' and 'b'
        // without a complete record.
        for _ in 0..2 {
            let mut may_read = true;
            assert!(matches!(
                proto.fetch(&bookmark, &mut may_read, None),
                Fetched::NoData
            ));
            assert!(!may_read);
        }
        let mut may_read = true;
        match proto.fetch(&bookmark, &mut may_read, None) {
            Fetched::Data(record) => assert_eq!(&record[..], b"ab"),
            _ => panic!("expected the completed record"),
        }
    }

    #[test]
    fn test_prepare_schedules_buffered_input() {
        let mut proto = new_proto("one\ntwo\n");
        // Nothing buffered yet: poll the transport.
        assert!(matches!(
            proto.prepare().action,
            PrepareAction::PollIo(IoCondition { input: true, .. })
        ));

        let bookmark = slot();
        let mut may_read = true;
        proto.fetch(&bookmark, &mut may_read, None);
        // "two\n" is still buffered.
        assert!(matches!(
            proto.prepare().action,
            PrepareAction::ForceSchedule
        ));
    }

    #[test]
    fn test_read_error_reported() {
        struct FailingReader;
        impl Read for FailingReader {
            fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
                Err(std::io::Error::new(std::io::ErrorKind::Other, "broken pipe"))
            }
        }
        let mut proto = TextProtoServer::new(Box::new(FailingReader));
        let bookmark = slot();
        let mut may_read = true;
        assert!(matches!(
            proto.fetch(&bookmark, &mut may_read, None),
            Fetched::Error
        ));
    }
}
