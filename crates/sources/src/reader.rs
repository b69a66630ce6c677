use crate::proto::{
    AuxData, ControlPipe, Fetched, IoCondition, LogProtoServer, MessageParser, PollEvents,
    PrepareAction, ProtoStatus,
};
use crate::{LogSource, NotifyCode, ReaderOptions, ShutdownFlag};
use message::{nv, refcache, Context, LogMessage};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, Instant};

/// Events delivered to the reader actor.
pub enum ReaderEvent {
    /// The driver's fd became ready.
    Readable(IoCondition),
    /// Run a fetch on the next loop tick without waiting for readiness.
    RestartFetch,
    /// The source window reopened; posted by the ack path, from any
    /// thread.
    Wakeup,
    /// Close the proto and poll events. Replies once the reader actually
    /// dropped them.
    CloseProto { reply: oneshot::Sender<()> },
    /// Shut the actor down.
    Stop { reply: oneshot::Sender<()> },
}

/// Cheap cloneable address of a running [`LogReader`].
#[derive(Clone)]
pub struct ReaderHandle {
    tx: mpsc::UnboundedSender<ReaderEvent>,
}

impl ReaderHandle {
    pub fn wakeup(&self) {
        // A send to a stopped reader is fine, acks can arrive after
        // deinit.
        let _ = self.tx.send(ReaderEvent::Wakeup);
    }

    pub fn notify_readable(&self, cond: IoCondition) {
        let _ = self.tx.send(ReaderEvent::Readable(cond));
    }

    pub fn schedule_fetch(&self) {
        let _ = self.tx.send(ReaderEvent::RestartFetch);
    }

    /// Close the reader's proto from any task, waiting until the reader
    /// has dropped it. When the reader is mid-fetch the close is performed
    /// right after the running fetch job finishes.
    pub async fn close_proto(&self) {
        let (reply, done) = oneshot::channel();
        if self.tx.send(ReaderEvent::CloseProto { reply }).is_ok() {
            let _ = done.await;
        }
    }

    /// Blocking variant of [`ReaderHandle::close_proto`] for driver worker
    /// threads.
    pub fn close_proto_blocking(&self) {
        let (reply, done) = oneshot::channel();
        if self.tx.send(ReaderEvent::CloseProto { reply }).is_ok() {
            let _ = done.blocking_recv();
        }
    }

    pub async fn stop(&self) {
        let (reply, done) = oneshot::channel();
        if self.tx.send(ReaderEvent::Stop { reply }).is_ok() {
            let _ = done.await;
        }
    }
}

struct FetchOutput {
    notify: Option<NotifyCode>,
    hit_fetch_limit: bool,
}

/// Environment a fetch job runs against; shipped to the blocking pool in
/// threaded mode.
#[derive(Clone)]
struct FetchEnv {
    ctx: Arc<Context>,
    source: Arc<LogSource>,
    parser: Arc<dyn MessageParser>,
    options: ReaderOptions,
    shutdown: ShutdownFlag,
    peer_addr: Option<SocketAddr>,
    local_addr: Option<SocketAddr>,
}

/// The cooperative fetch loop of one source connection.
///
/// Runs as an actor: fd readiness, restart ticks, wakeups, and close
/// requests arrive as [`ReaderEvent`]s; the idle timeout is an armed
/// deadline inside the loop. Between events the reader decides what to
/// poll for next via the proto's `prepare`, suspending entirely while the
/// source window is exhausted.
pub struct LogReader {
    env: FetchEnv,
    control: Arc<dyn ControlPipe>,
    name: Option<String>,

    proto: Option<Box<dyn LogProtoServer>>,
    poll_events: Option<Box<dyn PollEvents>>,

    rx: mpsc::UnboundedReceiver<ReaderEvent>,
    self_tx: mpsc::UnboundedSender<ReaderEvent>,

    suspended: bool,
    immediate_check: bool,
    idle_deadline: Option<Instant>,
}

impl LogReader {
    pub fn new(
        ctx: &Arc<Context>,
        source: Arc<LogSource>,
        options: ReaderOptions,
        parser: Arc<dyn MessageParser>,
        control: Arc<dyn ControlPipe>,
        shutdown: ShutdownFlag,
    ) -> (LogReader, ReaderHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ReaderHandle { tx: tx.clone() };

        // The ack path wakes us whenever window credit returns.
        let wakeup = handle.clone();
        source.set_wakeup(Arc::new(move || wakeup.wakeup()));

        let reader = LogReader {
            env: FetchEnv {
                ctx: ctx.clone(),
                source,
                parser,
                options,
                shutdown,
                peer_addr: None,
                local_addr: None,
            },
            control,
            name: None,
            proto: None,
            poll_events: None,
            rx,
            self_tx: tx,
            suspended: false,
            immediate_check: false,
            idle_deadline: None,
        };
        (reader, handle)
    }

    pub fn set_name(&mut self, name: &str) {
        self.name = Some(name.to_string());
    }

    pub fn set_peer_addr(&mut self, addr: Option<SocketAddr>) {
        self.env.peer_addr = addr;
    }

    pub fn set_local_addr(&mut self, addr: Option<SocketAddr>) {
        self.env.local_addr = addr;
    }

    /// Schedule a fetch for the first tick regardless of readiness; used
    /// by drivers whose proto buffers an initial payload.
    pub fn set_immediate_check(&mut self) {
        self.immediate_check = true;
    }

    /// Attach the connection. Must be called before [`LogReader::run`].
    pub fn open(&mut self, proto: Box<dyn LogProtoServer>, poll_events: Box<dyn PollEvents>) {
        self.proto = Some(proto);
        self.poll_events = Some(poll_events);
    }

    fn is_opened(&self) -> bool {
        self.proto.is_some() && self.poll_events.is_some()
    }

    /// Drive the reader until stopped.
    pub async fn run(mut self) {
        self.update_watches();
        loop {
            let idle_deadline = self.idle_deadline;
            tokio::select! {
                maybe_event = self.rx.recv() => {
                    match maybe_event {
                        None => break,
                        Some(event) => {
                            if !self.handle_event(event).await {
                                break;
                            }
                        }
                    }
                }
                _ = tokio::time::sleep_until(
                    idle_deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(86400)),
                ), if idle_deadline.is_some() => {
                    self.on_idle_timeout();
                }
            }
        }
        tracing::debug!(name = self.name.as_deref().unwrap_or(""), "reader stopped");
    }

    async fn handle_event(&mut self, event: ReaderEvent) -> bool {
        match event {
            ReaderEvent::Readable(_) | ReaderEvent::RestartFetch => {
                // If shutdown is requested, outstanding input is left for
                // the next configuration to process.
                if !self.env.shutdown.is_quit() && self.is_opened() {
                    self.run_fetch_job().await;
                }
            }
            ReaderEvent::Wakeup => {
                if self.suspended {
                    self.update_watches();
                }
            }
            ReaderEvent::CloseProto { reply } => {
                self.close_proto_now();
                let _ = reply.send(());
            }
            ReaderEvent::Stop { reply } => {
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    async fn run_fetch_job(&mut self) {
        self.disable_watches();
        let Some(mut proto) = self.proto.take() else {
            return;
        };

        let (proto, output) = if self.env.options.threaded {
            let env = self.env.clone();
            tokio::task::spawn_blocking(move || {
                let output = fetch_cycle(proto.as_mut(), &env);
                (proto, output)
            })
            .await
            .expect("fetch job must not panic")
        } else {
            let output = fetch_cycle(proto.as_mut(), &self.env);
            (proto, output)
        };
        self.proto = Some(proto);
        self.work_finished(output);
    }

    fn work_finished(&mut self, output: FetchOutput) {
        if output.hit_fetch_limit {
            // There may well be more buffered input; check again on the
            // next tick instead of waiting for readiness.
            self.immediate_check = true;
        }
        if let Some(code) = output.notify {
            tracing::debug!(?code, name = self.name.as_deref().unwrap_or(""), "reader notify");
            self.control.notify(code);
        }
        self.update_watches();
    }

    /// Set watches state so we are polling for whatever comes next.
    fn update_watches(&mut self) {
        self.disable_watches();
        if !self.is_opened() {
            return;
        }
        if !self.env.source.free_to_send() {
            self.suspend_until_awoken();
            return;
        }

        let prepared = self.proto.as_mut().expect("reader is opened").prepare();
        if let Some(timeout) = prepared.idle_timeout {
            self.idle_deadline = Some(Instant::now() + timeout);
        }
        if self.immediate_check {
            self.force_check_in_next_poll();
            return;
        }
        match prepared.action {
            PrepareAction::PollIo(cond) => {
                self.poll_events
                    .as_mut()
                    .expect("reader is opened")
                    .update_watches(cond);
            }
            PrepareAction::ForceSchedule => self.force_check_in_next_poll(),
            PrepareAction::Suspend => self.suspend_until_awoken(),
        }
    }

    fn disable_watches(&mut self) {
        if let Some(poll_events) = &mut self.poll_events {
            poll_events.suspend_watches();
        }
        self.idle_deadline = None;
    }

    fn suspend_until_awoken(&mut self) {
        self.immediate_check = false;
        self.suspended = true;
    }

    fn force_check_in_next_poll(&mut self) {
        self.immediate_check = false;
        self.suspended = false;
        let _ = self.self_tx.send(ReaderEvent::RestartFetch);
    }

    fn on_idle_timeout(&mut self) {
        self.idle_deadline = None;
        tracing::info!(
            name = self.name.as_deref().unwrap_or(""),
            "source idle timeout elapsed, closing connection",
        );
        self.control.notify(NotifyCode::Close);
    }

    fn close_proto_now(&mut self) {
        self.disable_watches();
        self.proto = None;
        self.poll_events = None;
        self.suspended = false;
        self.immediate_check = false;
        tracing::debug!(name = self.name.as_deref().unwrap_or(""), "proto closed");
    }
}

/// One reader run: drain the proto up to `fetch_limit` records, posting
/// each to the source. Returns the notify code to route to the control
/// pipe, if any.
fn fetch_cycle(proto: &mut dyn LogProtoServer, env: &FetchEnv) -> FetchOutput {
    if proto.handshake_in_progress() {
        let notify = match proto.handshake() {
            ProtoStatus::Eof => Some(NotifyCode::Close),
            ProtoStatus::Error => Some(NotifyCode::ReadError),
            ProtoStatus::Success | ProtoStatus::Again => None,
        };
        return FetchOutput {
            notify,
            hit_fetch_limit: false,
        };
    }

    let mut aux_storage = (!env.options.ignore_aux_data).then(AuxData::default);
    // may_read implements multi-read control: a proto which must not read
    // again within this job clears it after its first read.
    let mut may_read = true;
    let mut msg_count = 0;

    while msg_count < env.options.fetch_limit && !env.shutdown.is_quit() {
        if let Some(aux) = aux_storage.as_mut() {
            aux.reinit();
        }
        let bookmark = env.source.request_bookmark();

        match proto.fetch(&bookmark, &mut may_read, aux_storage.as_mut()) {
            Fetched::Eof => {
                return FetchOutput {
                    notify: Some(NotifyCode::Close),
                    hit_fetch_limit: false,
                }
            }
            Fetched::Error => {
                return FetchOutput {
                    notify: Some(NotifyCode::ReadError),
                    hit_fetch_limit: false,
                }
            }
            Fetched::NoData => break,
            Fetched::Data(record) => {
                if record.is_empty() && !env.options.empty_lines {
                    continue;
                }
                msg_count += 1;
                if !handle_record(env, &record, aux_storage.as_ref()) {
                    // The window just closed, don't generate further
                    // messages.
                    break;
                }
            }
        }
    }

    FetchOutput {
        notify: None,
        hit_fetch_limit: msg_count == env.options.fetch_limit,
    }
}

/// Build and post one message; returns whether the source may take more.
fn handle_record(env: &FetchEnv, record: &[u8], aux: Option<&AuxData>) -> bool {
    let saddr = aux.and_then(|aux| aux.peer_addr).or(env.peer_addr);

    let mut msg = match env.parser.parse(&env.ctx, record, saddr) {
        Ok(msg) => msg,
        Err(error) => {
            tracing::debug!(
                %error,
                input = %String::from_utf8_lossy(record),
                "cannot parse message",
            );
            if !env.options.store_on_parse_error {
                return env.source.free_to_send();
            }
            let mut raw = LogMessage::new(&env.ctx, record.len(), saddr);
            raw.get_mut()
                .expect("fresh message is unique")
                .set_value(nv::MESSAGE, record);
            raw
        }
    };

    tracing::debug!(
        input = %String::from_utf8_lossy(record),
        rcptid = msg.rcptid(),
        "incoming log entry",
    );

    {
        let body = msg.get_mut().expect("fresh message is unique");
        body.set_saddr(saddr);
        body.set_daddr(aux.and_then(|aux| aux.local_addr).or(env.local_addr));
        if let Some(aux) = aux {
            body.set_proto(aux.proto);
        }
    }

    let session = refcache::start_producer(&msg);
    if let Some(aux) = aux {
        let body = msg.get_mut().expect("producer owns the message");
        for (name, value) in aux.values() {
            body.set_value_by_name(name, value);
        }
    }
    env.source.post(msg);
    drop(session);

    env.source.free_to_send()
}
