//! Reader-loop behavior: fetch batching, back-pressure suspension and
//! wakeup, notify codes, handshake, idle timeout, and deferred close.

use acks::{AckTrackerFactory, BookmarkRef};
use bytes::Bytes;
use message::{AckType, Context, MsgRef, PathOptions};
use sources::proto::{
    AuxData, ControlPipe, Fetched, IoCondition, LogProtoServer, PlainTextParser, PollEvents,
    PrepareAction, Prepared, ProtoStatus,
};
use sources::{
    LogReader, LogSource, NotifyCode, Pipe, ReaderHandle, ReaderOptions, ShutdownFlag,
    SourceOptions,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

struct ScriptedProto {
    records: VecDeque<Fetched>,
    handshake_rounds: usize,
    idle_timeout: Option<Duration>,
    aux_values: Vec<(String, Vec<u8>)>,
}

impl ScriptedProto {
    fn with_records(records: Vec<Fetched>) -> ScriptedProto {
        ScriptedProto {
            records: records.into(),
            handshake_rounds: 0,
            idle_timeout: None,
            aux_values: Vec::new(),
        }
    }

    fn data(text: &str) -> Fetched {
        Fetched::Data(Bytes::copy_from_slice(text.as_bytes()))
    }
}

impl LogProtoServer for ScriptedProto {
    fn handshake_in_progress(&self) -> bool {
        self.handshake_rounds > 0
    }

    fn handshake(&mut self) -> ProtoStatus {
        self.handshake_rounds -= 1;
        ProtoStatus::Success
    }

    fn prepare(&mut self) -> Prepared {
        let action = if !self.records.is_empty() || self.handshake_rounds > 0 {
            PrepareAction::ForceSchedule
        } else if self.idle_timeout.is_some() {
            PrepareAction::PollIo(IoCondition::IN)
        } else {
            PrepareAction::Suspend
        };
        Prepared {
            action,
            idle_timeout: self.idle_timeout,
        }
    }

    fn fetch(
        &mut self,
        _bookmark: &BookmarkRef,
        _may_read: &mut bool,
        aux: Option<&mut AuxData>,
    ) -> Fetched {
        let fetched = self.records.pop_front().unwrap_or(Fetched::NoData);
        if let (Some(aux), Fetched::Data(_)) = (aux, &fetched) {
            for (name, value) in &self.aux_values {
                aux.add_value(name, value);
            }
        }
        fetched
    }
}

struct NullPoll;

impl PollEvents for NullPoll {
    fn update_watches(&mut self, _cond: IoCondition) {}
    fn suspend_watches(&mut self) {}
}

#[derive(Default)]
struct CollectingPipe {
    received: Mutex<Vec<(MsgRef, PathOptions)>>,
    notify: Notify,
}

impl Pipe for CollectingPipe {
    fn queue(&self, msg: MsgRef, path_options: &PathOptions) {
        self.received.lock().unwrap().push((msg, *path_options));
        self.notify.notify_one();
    }
}

impl CollectingPipe {
    fn len(&self) -> usize {
        self.received.lock().unwrap().len()
    }

    fn take(&self, at: usize) -> (MsgRef, PathOptions) {
        let received = self.received.lock().unwrap();
        let (msg, path_options) = &received[at];
        (msg.clone(), *path_options)
    }

    fn message_texts(&self) -> Vec<String> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .map(|(msg, _)| String::from_utf8_lossy(msg.get_value(message::nv::MESSAGE)).into())
            .collect()
    }

    async fn wait_for(&self, n: usize) {
        tokio::time::timeout(Duration::from_secs(30), async {
            while self.len() < n {
                self.notify.notified().await;
            }
        })
        .await
        .expect("destination did not receive the expected messages");
    }
}

#[derive(Default)]
struct RecordingControl {
    codes: Mutex<Vec<NotifyCode>>,
    notify: Notify,
}

impl ControlPipe for RecordingControl {
    fn notify(&self, code: NotifyCode) {
        self.codes.lock().unwrap().push(code);
        self.notify.notify_one();
    }
}

impl RecordingControl {
    async fn wait_for_code(&self) -> NotifyCode {
        tokio::time::timeout(Duration::from_secs(30), async {
            loop {
                if let Some(code) = self.codes.lock().unwrap().first().copied() {
                    return code;
                }
                self.notify.notified().await;
            }
        })
        .await
        .expect("control pipe saw no notify code")
    }
}

struct ReaderHarness {
    source: Arc<LogSource>,
    dst: Arc<CollectingPipe>,
    control: Arc<RecordingControl>,
    handle: ReaderHandle,
    join: tokio::task::JoinHandle<()>,
}

fn start_reader(proto: ScriptedProto, window: usize, options: ReaderOptions) -> ReaderHarness {
    let ctx = Context::new();
    let dst = Arc::new(CollectingPipe::default());
    let control = Arc::new(RecordingControl::default());
    let shutdown = ShutdownFlag::new();

    let source = LogSource::new(
        SourceOptions {
            init_window_size: window,
            ..Default::default()
        },
        &AckTrackerFactory::InstantBookmarkless,
        dst.clone(),
    );

    let (mut reader, handle) = LogReader::new(
        &ctx,
        source.clone(),
        options,
        Arc::new(PlainTextParser),
        control.clone(),
        shutdown.clone(),
    );
    reader.set_name("test-reader");
    reader.open(Box::new(proto), Box::new(NullPoll));
    let join = tokio::spawn(reader.run());

    ReaderHarness {
        source,
        dst,
        control,
        handle,
        join,
    }
}

async fn stop(harness: ReaderHarness) {
    harness.handle.stop().await;
    harness.join.await.unwrap();
}

#[tokio::test]
async fn test_fetch_posts_records_in_order() {
    let proto = ScriptedProto::with_records(vec![
        ScriptedProto::data("one"),
        ScriptedProto::data("two"),
        ScriptedProto::data("three"),
    ]);
    let harness = start_reader(proto, 10, ReaderOptions::default());

    harness.dst.wait_for(3).await;
    assert_eq!(harness.dst.message_texts(), vec!["one", "two", "three"]);
    // The destination holds the acks, so three window credits are out.
    assert_eq!(harness.source.window_size(), 7);
    stop(harness).await;
}

#[tokio::test]
async fn test_empty_lines_skipped_by_default() {
    let proto = ScriptedProto::with_records(vec![
        ScriptedProto::data("one"),
        ScriptedProto::data(""),
        ScriptedProto::data("two"),
    ]);
    let harness = start_reader(proto, 10, ReaderOptions::default());

    harness.dst.wait_for(2).await;
    assert_eq!(harness.dst.message_texts(), vec!["one", "two"]);
    stop(harness).await;
}

#[tokio::test]
async fn test_empty_lines_posted_when_enabled() {
    let proto = ScriptedProto::with_records(vec![
        ScriptedProto::data("one"),
        ScriptedProto::data(""),
    ]);
    let options = ReaderOptions {
        empty_lines: true,
        ..Default::default()
    };
    let harness = start_reader(proto, 10, options);

    harness.dst.wait_for(2).await;
    assert_eq!(harness.dst.message_texts(), vec!["one", ""]);
    stop(harness).await;
}

#[tokio::test]
async fn test_window_exhaustion_suspends_until_acked() {
    let records = (0..4).map(|at| ScriptedProto::data(&format!("m{at}"))).collect();
    let harness = start_reader(ScriptedProto::with_records(records), 2, ReaderOptions::default());

    // Only two fit through the window.
    harness.dst.wait_for(2).await;
    assert_eq!(harness.source.window_size(), 0);
    assert_eq!(harness.dst.len(), 2);

    // Acking refills the window and wakes the suspended reader.
    for at in 0..2 {
        let (msg, path_options) = harness.dst.take(at);
        msg.ack(&path_options, AckType::Processed);
    }
    harness.dst.wait_for(4).await;
    assert_eq!(
        harness.dst.message_texts(),
        vec!["m0", "m1", "m2", "m3"]
    );
    stop(harness).await;
}

#[tokio::test]
async fn test_fetch_limit_rearms_via_immediate_check() {
    let records = (0..5).map(|at| ScriptedProto::data(&format!("m{at}"))).collect();
    let options = ReaderOptions {
        fetch_limit: 2,
        ..Default::default()
    };
    let harness = start_reader(ScriptedProto::with_records(records), 10, options);

    // Three reader runs are needed; the immediate-check rearm drives them
    // without any external readiness events.
    harness.dst.wait_for(5).await;
    stop(harness).await;
}

#[tokio::test]
async fn test_eof_routes_close_to_control() {
    let proto = ScriptedProto::with_records(vec![ScriptedProto::data("last"), Fetched::Eof]);
    let harness = start_reader(proto, 10, ReaderOptions::default());

    harness.dst.wait_for(1).await;
    assert_eq!(harness.control.wait_for_code().await, NotifyCode::Close);
    stop(harness).await;
}

#[tokio::test]
async fn test_read_error_routes_to_control() {
    let proto = ScriptedProto::with_records(vec![Fetched::Error]);
    let harness = start_reader(proto, 10, ReaderOptions::default());

    assert_eq!(harness.control.wait_for_code().await, NotifyCode::ReadError);
    stop(harness).await;
}

#[tokio::test]
async fn test_handshake_completes_before_fetch() {
    let mut proto = ScriptedProto::with_records(vec![ScriptedProto::data("after-handshake")]);
    proto.handshake_rounds = 2;
    let harness = start_reader(proto, 10, ReaderOptions::default());

    harness.dst.wait_for(1).await;
    assert_eq!(harness.dst.message_texts(), vec!["after-handshake"]);
    stop(harness).await;
}

#[tokio::test]
async fn test_aux_values_attached_to_message() {
    let mut proto = ScriptedProto::with_records(vec![ScriptedProto::data("payload")]);
    proto.aux_values = vec![("SOURCEIP".to_string(), b"10.0.0.9".to_vec())];
    let harness = start_reader(proto, 10, ReaderOptions::default());

    harness.dst.wait_for(1).await;
    let (msg, _) = harness.dst.take(0);
    assert_eq!(msg.get_value_by_name("SOURCEIP"), b"10.0.0.9");
    stop(harness).await;
}

#[tokio::test]
async fn test_aux_values_ignored_when_configured() {
    let mut proto = ScriptedProto::with_records(vec![ScriptedProto::data("payload")]);
    proto.aux_values = vec![("SOURCEIP".to_string(), b"10.0.0.9".to_vec())];
    let options = ReaderOptions {
        ignore_aux_data: true,
        ..Default::default()
    };
    let harness = start_reader(proto, 10, options);

    harness.dst.wait_for(1).await;
    let (msg, _) = harness.dst.take(0);
    assert_eq!(msg.get_value_by_name("SOURCEIP"), b"");
    stop(harness).await;
}

#[tokio::test(start_paused = true)]
async fn test_idle_timeout_closes_connection() {
    let mut proto = ScriptedProto::with_records(vec![]);
    proto.idle_timeout = Some(Duration::from_secs(5));
    let harness = start_reader(proto, 10, ReaderOptions::default());

    // No input ever arrives; the idle timer must fire and request a
    // close.
    assert_eq!(harness.control.wait_for_code().await, NotifyCode::Close);
    assert_eq!(harness.dst.len(), 0);
    stop(harness).await;
}

#[tokio::test]
async fn test_close_proto_detaches_connection() {
    let proto = ScriptedProto::with_records(vec![ScriptedProto::data("one")]);
    let harness = start_reader(proto, 10, ReaderOptions::default());
    harness.dst.wait_for(1).await;

    harness.handle.close_proto().await;
    // Readiness on the closed connection is ignored.
    harness.handle.notify_readable(IoCondition::IN);
    harness.handle.schedule_fetch();
    tokio::task::yield_now().await;
    assert_eq!(harness.dst.len(), 1);
    stop(harness).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_threaded_fetch_mode() {
    let records = (0..3).map(|at| ScriptedProto::data(&format!("m{at}"))).collect();
    let options = ReaderOptions {
        threaded: true,
        ..Default::default()
    };
    let harness = start_reader(ScriptedProto::with_records(records), 10, options);

    harness.dst.wait_for(3).await;
    assert_eq!(harness.dst.message_texts(), vec!["m0", "m1", "m2"]);
    stop(harness).await;
}

#[tokio::test]
async fn test_shutdown_flag_stops_fetching() {
    let proto = ScriptedProto::with_records(vec![ScriptedProto::data("never-read")]);
    let ctx = Context::new();
    let dst = Arc::new(CollectingPipe::default());
    let control = Arc::new(RecordingControl::default());
    let shutdown = ShutdownFlag::new();
    shutdown.request_quit();

    let source = LogSource::new(
        SourceOptions::default(),
        &AckTrackerFactory::InstantBookmarkless,
        dst.clone(),
    );
    let (mut reader, handle) = LogReader::new(
        &ctx,
        source,
        ReaderOptions::default(),
        Arc::new(PlainTextParser),
        control,
        shutdown,
    );
    reader.open(Box::new(proto), Box::new(NullPoll));
    let join = tokio::spawn(reader.run());

    handle.schedule_fetch();
    tokio::task::yield_now().await;
    assert_eq!(dst.len(), 0);

    handle.stop().await;
    join.await.unwrap();
}
