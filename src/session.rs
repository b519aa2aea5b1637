//! The session: one connection's worth of multiplexed streams.
//!
//! A `Session` owns the transport, the codecs, and the stream table, and
//! runs as a single cooperative task: all decode, state mutation, and
//! outbound writes happen inline on that task, so none of the protocol
//! state needs a lock. Applications talk to it through a cloneable
//! `SessionHandle` backed by a command channel; per-request completion
//! arrives on oneshot channels, pushed streams on a dedicated channel,
//! and the close outcome on a watch.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, warn};

use crate::codec::{FrameDecoder, FrameEncoder, FrameEvent};
use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::frame::{
    GoAwayStatus, SettingsFrame, StreamStatus, DEFAULT_INITIAL_WINDOW_SIZE, MAX_DATA_CHUNK,
    SESSION_STREAM_ID,
};
use crate::origin::Origin;
use crate::request::Request;
use crate::response::{PushedResponse, Response};
use crate::settings::{ids, SettingsStore};
use crate::stream::{Stream, StreamTable};

/// How many queued commands the handle side may buffer.
const COMMAND_CHANNEL_CAPACITY: usize = 32;

/// Default limit on concurrently open local streams until the peer's
/// first SETTINGS says otherwise.
const DEFAULT_REMOTE_MAX_CONCURRENT: u32 = 100;

/// How a session ended.
#[derive(Debug, Clone)]
pub enum CloseOutcome {
    /// The session shut down in an orderly fashion.
    Clean(Origin),
    /// The session terminated because of the contained error.
    Failed(Arc<Error>),
}

#[derive(Debug)]
enum Command {
    Queue {
        request: Request,
        response_tx: oneshot::Sender<Result<Response>>,
        op_id: u64,
    },
    Cancel {
        op_id: u64,
    },
    Close {
        status: GoAwayStatus,
    },
}

enum Exit {
    /// Peer closed the transport after a GOAWAY drain completed.
    Drained,
    /// Application-initiated close (or every handle dropped).
    Closed(GoAwayStatus),
}

/// Observability state shared with handles.
struct SessionShared {
    connected: AtomicBool,
    received_goaway: AtomicBool,
    active: AtomicBool,
    was_active: AtomicBool,
    capacity: AtomicU32,
    latency_micros: AtomicU64,
}

/// Cross-task interface to a running session.
///
/// Session states: OPEN = connected ∧ ¬goaway-received; DRAINING =
/// connected ∧ goaway-received; CLOSED = ¬open; ACTIVE once a complete
/// reply has been received.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    shared: Arc<SessionShared>,
    close_rx: watch::Receiver<Option<CloseOutcome>>,
    capacity_rx: watch::Receiver<u32>,
    next_op_id: Arc<AtomicU64>,
}

impl SessionHandle {
    /// Queue a request onto the session. The stream id is assigned by the
    /// session task once capacity permits.
    pub async fn queue(&self, request: Request) -> Result<RequestHandle> {
        let (response_tx, response_rx) = oneshot::channel();
        let op_id = self.next_op_id.fetch_add(1, Ordering::Relaxed);
        self.commands
            .send(Command::Queue {
                request,
                response_tx,
                op_id,
            })
            .await
            .map_err(|_| Error::closed("session task is gone"))?;
        Ok(RequestHandle {
            response_rx,
            op_id,
            commands: self.commands.clone(),
        })
    }

    /// Close the session: all active streams terminate with a session
    /// error, a GOAWAY is sent, and the transport is shut down.
    pub async fn close(&self, status: GoAwayStatus) -> Result<()> {
        self.commands
            .send(Command::Close { status })
            .await
            .map_err(|_| Error::closed("session task is gone"))
    }

    /// Resolves exactly once, when the session terminates.
    pub async fn closed(&self) -> CloseOutcome {
        let mut rx = self.close_rx.clone();
        loop {
            if let Some(outcome) = rx.borrow().clone() {
                return outcome;
            }
            if rx.changed().await.is_err() {
                return CloseOutcome::Failed(Arc::new(Error::closed("session task dropped")));
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    pub fn is_open(&self) -> bool {
        self.is_connected() && !self.shared.received_goaway.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        !self.is_open()
    }

    pub fn is_draining(&self) -> bool {
        self.is_connected() && self.shared.received_goaway.load(Ordering::SeqCst)
    }

    pub fn is_disconnected(&self) -> bool {
        !self.is_connected()
    }

    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::SeqCst)
    }

    pub fn was_active(&self) -> bool {
        self.shared.was_active.load(Ordering::SeqCst)
    }

    /// Additional requests the session currently has room for.
    pub fn capacity(&self) -> u32 {
        self.shared.capacity.load(Ordering::SeqCst)
    }

    /// Watch capacity changes (for pool integration).
    pub fn capacity_updates(&self) -> watch::Receiver<u32> {
        self.capacity_rx.clone()
    }

    /// Most recent ping round-trip time, once measured.
    pub fn latency(&self) -> Option<Duration> {
        match self.shared.latency_micros.load(Ordering::SeqCst) {
            0 => None,
            micros => Some(Duration::from_micros(micros)),
        }
    }
}

/// Completion handle for one queued request.
pub struct RequestHandle {
    response_rx: oneshot::Receiver<Result<Response>>,
    op_id: u64,
    commands: mpsc::Sender<Command>,
}

impl RequestHandle {
    /// Await the complete response.
    pub async fn response(self) -> Result<Response> {
        self.response_rx
            .await
            .map_err(|_| Error::closed("session terminated before reply"))?
    }

    /// Cancel the request: RST_STREAM(CANCEL) if the stream is open, a
    /// silent drop if it was still queued.
    pub async fn cancel(&self) {
        let _ = self.commands.send(Command::Cancel { op_id: self.op_id }).await;
    }
}

/// A client-side SPDY/3.1 session over a connected transport.
pub struct Session<T> {
    transport: T,
    origin: Origin,
    config: SessionConfig,
    store: SettingsStore,

    decoder: FrameDecoder,
    encoder: FrameEncoder,
    read_buf: BytesMut,

    streams: StreamTable,
    /// Queued local streams that have no id yet.
    pending: VecDeque<Stream>,

    commands: mpsc::Receiver<Command>,
    shared: Arc<SessionShared>,
    close_tx: watch::Sender<Option<CloseOutcome>>,
    capacity_tx: watch::Sender<u32>,
    push_tx: mpsc::UnboundedSender<PushedResponse>,

    next_stream_id: u32,
    next_ping_id: u32,
    last_good_remote_id: u32,

    session_send_window: i32,
    session_receive_window: i32,
    initial_send_window: i32,
    initial_receive_window: i32,

    local_max_concurrent: u32,
    remote_max_concurrent: u32,

    sent_pings: BTreeMap<u32, Instant>,
    latency: Option<Duration>,

    received_goaway: bool,
    sent_goaway: bool,
    active: bool,
}

impl<T> Session<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Create a session over an already-connected transport.
    ///
    /// Returns the session (drive it with [`Session::run`], typically via
    /// `tokio::spawn`), the application handle, and the channel on which
    /// completed server pushes are delivered.
    pub fn new(
        transport: T,
        origin: Origin,
        config: SessionConfig,
        store: SettingsStore,
    ) -> (
        Self,
        SessionHandle,
        mpsc::UnboundedReceiver<PushedResponse>,
    ) {
        let config = config.validated();
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (close_tx, close_rx) = watch::channel(None);
        let (capacity_tx, capacity_rx) = watch::channel(DEFAULT_REMOTE_MAX_CONCURRENT);
        let (push_tx, push_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(SessionShared {
            connected: AtomicBool::new(true),
            received_goaway: AtomicBool::new(false),
            active: AtomicBool::new(false),
            was_active: AtomicBool::new(false),
            capacity: AtomicU32::new(DEFAULT_REMOTE_MAX_CONCURRENT),
            latency_micros: AtomicU64::new(0),
        });

        let handle = SessionHandle {
            commands: command_tx,
            shared: Arc::clone(&shared),
            close_rx,
            capacity_rx,
            next_op_id: Arc::new(AtomicU64::new(1)),
        };

        let session = Self {
            transport,
            origin,
            store,
            decoder: FrameDecoder::new(config.max_header_size),
            encoder: FrameEncoder::new(),
            read_buf: BytesMut::with_capacity(config.read_buffer_size),
            streams: StreamTable::new(),
            pending: VecDeque::new(),
            commands: command_rx,
            shared,
            close_tx,
            capacity_tx,
            push_tx,
            next_stream_id: 1,
            next_ping_id: 1,
            last_good_remote_id: 0,
            session_send_window: DEFAULT_INITIAL_WINDOW_SIZE,
            session_receive_window: config.session_receive_window,
            initial_send_window: DEFAULT_INITIAL_WINDOW_SIZE,
            initial_receive_window: config.stream_receive_window,
            local_max_concurrent: config.max_push_streams,
            remote_max_concurrent: DEFAULT_REMOTE_MAX_CONCURRENT,
            sent_pings: BTreeMap::new(),
            latency: None,
            received_goaway: false,
            sent_goaway: false,
            active: false,
            config,
        };

        (session, handle, push_rx)
    }

    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    /// Most recent ping round-trip time, once measured.
    pub fn latency(&self) -> Option<Duration> {
        self.latency
    }

    /// Drive the session to completion. Resolves when the transport
    /// closes or the session is torn down; the same outcome is also
    /// published to [`SessionHandle::closed`].
    pub async fn run(mut self) -> CloseOutcome {
        let outcome = match self.drive().await {
            Ok(Exit::Drained) => {
                self.terminate_all(|| Error::closed("session drained"));
                CloseOutcome::Clean(self.origin.clone())
            }
            Ok(Exit::Closed(status)) => self.close_with_status(status).await,
            Err(error) => self.teardown(error).await,
        };
        self.shared.connected.store(false, Ordering::SeqCst);
        if self.close_tx.send(Some(outcome.clone())).is_err() {
            debug!("no close listeners remain");
        }
        outcome
    }

    async fn drive(&mut self) -> Result<Exit> {
        self.startup().await?;
        let mut events = Vec::new();
        loop {
            // Completed streams may have freed concurrency slots.
            if !self.pending.is_empty() {
                self.dispatch_pending().await?;
            }
            if self.read_buf.capacity() - self.read_buf.len() < 4096 {
                self.read_buf.reserve(self.config.read_buffer_size);
            }
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Close { status }) => return Ok(Exit::Closed(status)),
                    Some(command) => self.handle_command(command).await?,
                    None => return Ok(Exit::Closed(GoAwayStatus::Ok)),
                },
                read = self.transport.read_buf(&mut self.read_buf) => {
                    if read? == 0 {
                        if self.received_goaway && self.streams.is_empty() && self.pending.is_empty() {
                            return Ok(Exit::Drained);
                        }
                        return Err(Error::closed("transport closed by peer"));
                    }
                    events.clear();
                    self.decoder.decode(&mut self.read_buf, &mut events)?;
                    for event in events.drain(..) {
                        self.handle_event(event).await?;
                    }
                }
            }
        }
    }

    /// Initial frame sequence: SETTINGS, then PING, then the session
    /// window credit. Write order is the wire order.
    async fn startup(&mut self) -> Result<()> {
        let mut settings = SettingsFrame::new();
        settings.set(
            ids::INITIAL_WINDOW_SIZE,
            self.config.stream_receive_window as u32,
        );
        let frame = self.encoder.encode_settings(&settings);
        self.write_frame(frame).await?;

        self.send_ping().await?;

        let delta = self.config.session_receive_window - DEFAULT_INITIAL_WINDOW_SIZE;
        if delta > 0 {
            let frame = self.encoder.encode_window_update(SESSION_STREAM_ID, delta);
            self.write_frame(frame).await?;
        }

        self.publish_capacity();
        Ok(())
    }

    async fn handle_command(&mut self, command: Command) -> Result<()> {
        match command {
            Command::Queue {
                request,
                response_tx,
                op_id,
            } => {
                if self.received_goaway || self.sent_goaway {
                    if response_tx
                        .send(Err(Error::closed("session is draining")))
                        .is_err()
                    {
                        debug!("request abandoned before refusal");
                    }
                    return Ok(());
                }
                let headers = request.to_spdy_headers();
                let stream = Stream::local(
                    op_id,
                    request.priority,
                    headers,
                    request.body,
                    response_tx,
                    self.config.max_header_size,
                );
                self.pending.push_back(stream);
                self.dispatch_pending().await
            }
            Command::Cancel { op_id } => self.cancel_operation(op_id).await,
            Command::Close { .. } => unreachable!("close handled by the drive loop"),
        }
    }

    /// Open queued streams while the concurrency limit allows.
    async fn dispatch_pending(&mut self) -> Result<()> {
        while !self.received_goaway
            && !self.sent_goaway
            && self.streams.local_size() < self.remote_max_concurrent as usize
        {
            let Some(mut stream) = self.pending.pop_front() else {
                break;
            };
            let id = self.next_stream_id;
            self.next_stream_id += 2;

            let headers = stream.take_request_headers();
            let last = !stream.has_pending_data();
            let frame =
                self.encoder
                    .encode_syn_stream(id, 0, stream.priority(), last, false, &headers)?;
            self.write_frame(frame).await?;

            stream.open(id, self.initial_send_window, self.config.stream_receive_window);
            if last {
                stream.close_locally();
            }
            self.streams.add(stream);
            self.publish_capacity();

            if !last {
                self.send_stream_data(id).await?;
            }
        }
        Ok(())
    }

    async fn cancel_operation(&mut self, op_id: u64) -> Result<()> {
        if let Some(pos) = self.pending.iter().position(|s| s.op_id() == Some(op_id)) {
            if let Some(mut stream) = self.pending.remove(pos) {
                stream.close(Error::Canceled);
            }
            return Ok(());
        }
        if let Some(id) = self.streams.find_by_op(op_id) {
            self.send_rst(id, StreamStatus::Cancel).await?;
            if let Some(mut stream) = self.streams.remove(id) {
                stream.close(Error::Canceled);
            }
            self.publish_capacity();
            self.dispatch_pending().await?;
        }
        Ok(())
    }

    async fn handle_event(&mut self, event: FrameEvent) -> Result<()> {
        match event {
            FrameEvent::Data {
                stream_id,
                last,
                payload,
            } => self.on_data(stream_id, last, payload).await,
            FrameEvent::SynStream {
                stream_id,
                associated_stream_id,
                priority,
                last,
                unidirectional,
            } => {
                self.on_syn_stream(stream_id, associated_stream_id, priority, last, unidirectional)
                    .await
            }
            FrameEvent::SynReply { stream_id, last } => self.on_syn_reply(stream_id, last).await,
            FrameEvent::RstStream { stream_id, status } => {
                self.on_rst_stream(stream_id, status);
                Ok(())
            }
            FrameEvent::Settings { clear_persisted } => {
                if clear_persisted {
                    self.store.clear(&self.origin);
                }
                Ok(())
            }
            FrameEvent::Setting(setting) => self.on_setting(setting).await,
            FrameEvent::SettingsEnd => Ok(()),
            FrameEvent::Ping { id } => self.on_ping(id).await,
            FrameEvent::GoAway {
                last_good_stream_id,
                status,
            } => {
                self.on_goaway(last_good_stream_id, status);
                Ok(())
            }
            FrameEvent::Headers { stream_id, last } => self.on_headers(stream_id, last).await,
            FrameEvent::WindowUpdate { stream_id, delta } => {
                self.on_window_update(stream_id, delta).await
            }
            FrameEvent::Header {
                stream_id,
                name,
                value,
            } => self.on_header(stream_id, name, value).await,
            FrameEvent::HeadersEnd { stream_id } => {
                self.remove_if_closed(stream_id);
                Ok(())
            }
            FrameEvent::Skipped { stream_id, reason } => self.on_skipped(stream_id, reason).await,
        }
    }

    /// Inbound DATA. The checks run in a fixed order; the first failure
    /// ends processing of the frame.
    async fn on_data(&mut self, stream_id: u32, last: bool, payload: Bytes) -> Result<()> {
        let len = payload.len() as i32;

        if len > self.session_receive_window {
            return Err(Error::session(
                GoAwayStatus::ProtocolError,
                "session flow control violated",
            ));
        }

        if self.streams.get(stream_id).is_none() {
            if stream_id < self.last_good_remote_id {
                self.send_rst(stream_id, StreamStatus::ProtocolError).await?;
            } else if !self.sent_goaway {
                self.send_rst(stream_id, StreamStatus::InvalidStream).await?;
            }
            return Ok(());
        }

        let failed_check = self.streams.get(stream_id).and_then(|s| {
            if s.is_closed_remotely() {
                Some(StreamStatus::StreamAlreadyClosed)
            } else if s.is_local() && !s.has_received_reply() {
                Some(StreamStatus::ProtocolError)
            } else if s.receive_window() < len {
                Some(StreamStatus::FlowControlError)
            } else {
                None
            }
        });
        if let Some(status) = failed_check {
            self.send_rst(stream_id, status).await?;
            self.terminate_stream(stream_id, status);
            return Ok(());
        }

        // Session window: deduct, and restore to the configured initial
        // once half is consumed.
        self.session_receive_window -= len;
        if self.session_receive_window <= self.config.session_receive_window / 2 {
            let delta = self.config.session_receive_window - self.session_receive_window;
            self.session_receive_window += delta;
            let frame = self.encoder.encode_window_update(SESSION_STREAM_ID, delta);
            self.write_frame(frame).await?;
        }

        // Stream window: same shape, then deliver.
        let mut restore = None;
        if let Some(stream) = self.streams.get_mut(stream_id) {
            stream.reduce_receive_window(len);
            if stream.receive_window() <= self.initial_receive_window / 2 {
                let delta = self.initial_receive_window - stream.receive_window();
                stream.increase_receive_window(delta);
                restore = Some(delta);
            }
            stream.on_data(&payload);
            if last {
                stream.close_remotely();
            }
        }
        if let Some(delta) = restore {
            let frame = self.encoder.encode_window_update(stream_id, delta);
            self.write_frame(frame).await?;
        }

        if last {
            self.remove_if_closed(stream_id);
        }
        Ok(())
    }

    async fn on_syn_stream(
        &mut self,
        stream_id: u32,
        associated_stream_id: u32,
        priority: u8,
        last: bool,
        unidirectional: bool,
    ) -> Result<()> {
        if stream_id <= self.last_good_remote_id {
            return Err(Error::session(
                GoAwayStatus::ProtocolError,
                "pushed stream id not monotonically increasing",
            ));
        }
        if stream_id % 2 != 0 {
            return Err(Error::session(
                GoAwayStatus::ProtocolError,
                "pushed stream id must be even",
            ));
        }
        if self.received_goaway
            || self.streams.remote_size() >= self.local_max_concurrent as usize
        {
            self.send_rst(stream_id, StreamStatus::RefusedStream).await?;
            return Ok(());
        }

        let mut stream = Stream::pushed(
            priority,
            associated_stream_id,
            unidirectional,
            self.push_tx.clone(),
            self.config.max_header_size,
        );
        stream.open(stream_id, self.initial_send_window, self.initial_receive_window);
        if last {
            stream.close_remotely();
        }
        self.last_good_remote_id = stream_id;
        self.streams.add(stream);
        Ok(())
    }

    async fn on_syn_reply(&mut self, stream_id: u32, last: bool) -> Result<()> {
        enum Check {
            Missing,
            Duplicate,
            Accepted,
        }
        let check = match self.streams.get_mut(stream_id) {
            None => Check::Missing,
            Some(stream) => match stream.on_reply() {
                Err(_) => Check::Duplicate,
                Ok(()) => {
                    if last {
                        // Removal is deferred until the header block ends.
                        stream.close_remotely();
                    }
                    Check::Accepted
                }
            },
        };
        match check {
            Check::Missing => {
                self.send_rst(stream_id, StreamStatus::InvalidStream).await?;
            }
            Check::Duplicate => {
                self.send_rst(stream_id, StreamStatus::StreamInUse).await?;
                self.terminate_stream(stream_id, StreamStatus::StreamInUse);
            }
            Check::Accepted => {
                self.set_active();
            }
        }
        Ok(())
    }

    /// Never answer a RST with a RST.
    fn on_rst_stream(&mut self, stream_id: u32, status: StreamStatus) {
        self.terminate_stream(stream_id, status);
    }

    async fn on_setting(&mut self, setting: crate::settings::Setting) -> Result<()> {
        if setting.persisted {
            return Err(Error::session(
                GoAwayStatus::ProtocolError,
                "server sent a persisted setting",
            ));
        }

        match setting.id {
            ids::MAX_CONCURRENT_STREAMS => {
                let previous = self.remote_max_concurrent;
                self.remote_max_concurrent = setting.value;
                self.publish_capacity();
                if setting.value > previous {
                    self.dispatch_pending().await?;
                }
            }
            ids::INITIAL_WINDOW_SIZE => {
                let new_window = setting.value.min(i32::MAX as u32) as i32;
                let delta = new_window - self.initial_send_window;
                self.initial_send_window = new_window;
                for id in self.streams.ids() {
                    let adjusted = match self.streams.get_mut(id) {
                        Some(stream) if !stream.is_closed_locally() => {
                            stream.increase_send_window(delta);
                            true
                        }
                        _ => false,
                    };
                    if adjusted && delta > 0 {
                        self.send_stream_data(id).await?;
                    }
                }
            }
            _ => {}
        }

        if setting.persist_value {
            self.store.set(&self.origin, setting.id, setting.value);
        }
        Ok(())
    }

    async fn on_ping(&mut self, id: u32) -> Result<()> {
        if id % 2 == 0 {
            // Peer-initiated: echo immediately.
            let frame = self.encoder.encode_ping(id);
            self.write_frame(frame).await?;
        } else if let Some(sent_at) = self.sent_pings.remove(&id) {
            let latency = sent_at.elapsed();
            self.latency = Some(latency);
            // Floor of one microsecond so "measured" is distinguishable.
            self.shared
                .latency_micros
                .store((latency.as_micros() as u64).max(1), Ordering::SeqCst);
        }
        Ok(())
    }

    fn on_goaway(&mut self, last_good_stream_id: u32, status: GoAwayStatus) {
        self.received_goaway = true;
        self.shared.received_goaway.store(true, Ordering::SeqCst);

        // Streams the peer will never process terminate now; accepted
        // in-flight streams keep going (the session is draining).
        for id in self.streams.ids() {
            let refused = self
                .streams
                .get(id)
                .is_some_and(|s| s.is_local() && id > last_good_stream_id);
            if refused {
                if let Some(mut stream) = self.streams.remove(id) {
                    stream.close(Error::session(status, "stream refused by goaway"));
                }
            }
        }
        for mut stream in self.pending.drain(..) {
            stream.close(Error::session(status, "session is draining"));
        }
        self.publish_capacity();
    }

    async fn on_headers(&mut self, stream_id: u32, last: bool) -> Result<()> {
        enum Check {
            Missing,
            AlreadyClosed,
            Accepted,
        }
        let check = match self.streams.get_mut(stream_id) {
            None => Check::Missing,
            Some(stream) if stream.is_closed_remotely() => Check::AlreadyClosed,
            Some(stream) => {
                if last {
                    stream.close_remotely();
                }
                Check::Accepted
            }
        };
        match check {
            Check::Missing => {
                self.send_rst(stream_id, StreamStatus::InvalidStream).await?;
            }
            Check::AlreadyClosed => {
                self.send_rst(stream_id, StreamStatus::InvalidStream).await?;
                self.terminate_stream(stream_id, StreamStatus::InvalidStream);
            }
            Check::Accepted => {}
        }
        Ok(())
    }

    async fn on_window_update(&mut self, stream_id: u32, delta: i32) -> Result<()> {
        if stream_id == SESSION_STREAM_ID {
            if self.session_send_window > i32::MAX - delta {
                return Err(Error::session(
                    GoAwayStatus::ProtocolError,
                    "session send window overflow",
                ));
            }
            self.session_send_window += delta;
            // Fair drain in stream-id order while credit remains.
            for id in self.streams.ids() {
                if self.session_send_window <= 0 {
                    break;
                }
                self.send_stream_data(id).await?;
            }
            return Ok(());
        }

        // Ignore updates for unknown or locally-closed streams.
        let send_window = match self.streams.get(stream_id) {
            Some(stream) if !stream.is_closed_locally() => stream.send_window(),
            _ => return Ok(()),
        };
        if send_window > i32::MAX - delta {
            self.send_rst(stream_id, StreamStatus::FlowControlError)
                .await?;
            self.terminate_stream(stream_id, StreamStatus::FlowControlError);
            return Ok(());
        }
        if let Some(stream) = self.streams.get_mut(stream_id) {
            stream.increase_send_window(delta);
        }
        self.send_stream_data(stream_id).await
    }

    async fn on_header(&mut self, stream_id: u32, name: String, value: String) -> Result<()> {
        // The stream was looked up when its header frame arrived, but a
        // mid-block reset can remove it before the pairs finish decoding.
        let result = match self.streams.get_mut(stream_id) {
            None => {
                debug!(stream = stream_id, "header for absent stream dropped");
                return Ok(());
            }
            Some(stream) => stream.on_header(name, value),
        };
        if let Err(status) = result {
            self.send_rst(stream_id, status).await?;
            self.terminate_stream(stream_id, status);
        }
        Ok(())
    }

    async fn on_skipped(&mut self, stream_id: u32, reason: &'static str) -> Result<()> {
        debug!(stream = stream_id, reason, "frame skipped");
        if stream_id != SESSION_STREAM_ID && self.streams.get(stream_id).is_some() {
            self.send_rst(stream_id, StreamStatus::ProtocolError).await?;
            self.terminate_stream(stream_id, StreamStatus::ProtocolError);
        }
        Ok(())
    }

    /// Drain a stream's pending body while both windows have credit.
    async fn send_stream_data(&mut self, stream_id: u32) -> Result<()> {
        loop {
            let (chunk, last) = {
                let Some(stream) = self.streams.get_mut(stream_id) else {
                    return Ok(());
                };
                if stream.is_closed_locally() || !stream.has_pending_data() {
                    return Ok(());
                }
                let window = stream.send_window().min(self.session_send_window);
                if window <= 0 {
                    return Ok(());
                }
                let chunk = stream.take_chunk((window as usize).min(MAX_DATA_CHUNK));
                stream.debit_send_window(chunk.len() as i32);
                let last = !stream.has_pending_data();
                (chunk, last)
            };

            self.session_send_window -= chunk.len() as i32;
            let frame = self.encoder.encode_data(stream_id, last, chunk);
            self.write_frame(frame).await?;

            if last {
                if let Some(stream) = self.streams.get_mut(stream_id) {
                    stream.close_locally();
                }
                self.remove_if_closed(stream_id);
                return Ok(());
            }
        }
    }

    async fn send_ping(&mut self) -> Result<()> {
        let id = self.next_ping_id;
        self.next_ping_id += 2;
        let frame = self.encoder.encode_ping(id);
        self.write_frame(frame).await?;
        // Timestamp once the write has completed.
        self.sent_pings.insert(id, Instant::now());
        Ok(())
    }

    async fn send_rst(&mut self, stream_id: u32, status: StreamStatus) -> Result<()> {
        debug!(stream = stream_id, ?status, "sending RST_STREAM");
        let frame = self.encoder.encode_rst_stream(stream_id, status);
        self.write_frame(frame).await
    }

    async fn write_frame(&mut self, frame: BytesMut) -> Result<()> {
        self.transport.write_all(&frame).await?;
        self.transport.flush().await?;
        Ok(())
    }

    fn set_active(&mut self) {
        self.active = true;
        self.shared.active.store(true, Ordering::SeqCst);
        self.shared.was_active.store(true, Ordering::SeqCst);
    }

    fn publish_capacity(&self) {
        let capacity = self
            .remote_max_concurrent
            .saturating_sub(self.streams.local_size() as u32);
        self.shared.capacity.store(capacity, Ordering::SeqCst);
        // A send error just means no pool is watching; the atomic still
        // serves the handle.
        let _ = self.capacity_tx.send(capacity);
    }

    /// Remove and deliver a stream that has reached CLOSED.
    fn remove_if_closed(&mut self, stream_id: u32) {
        let closed = self
            .streams
            .get(stream_id)
            .is_some_and(|s| s.is_closed());
        if closed {
            if let Some(mut stream) = self.streams.remove(stream_id) {
                stream.complete();
            }
            self.publish_capacity();
        }
    }

    /// Remove a stream and fail its operation with a stream error.
    fn terminate_stream(&mut self, stream_id: u32, status: StreamStatus) {
        if let Some(mut stream) = self.streams.remove(stream_id) {
            stream.close(Error::stream(stream_id, status));
            self.publish_capacity();
        }
    }

    fn terminate_all(&mut self, mut make_error: impl FnMut() -> Error) {
        for id in self.streams.ids() {
            if let Some(mut stream) = self.streams.remove(id) {
                stream.close(make_error());
            }
        }
        for mut stream in self.pending.drain(..) {
            stream.close(make_error());
        }
        self.publish_capacity();
    }

    /// Orderly session-wide close with a GOAWAY.
    async fn close_with_status(&mut self, status: GoAwayStatus) -> CloseOutcome {
        let frame = self.encoder.encode_goaway(self.last_good_remote_id, status);
        if let Err(e) = self.write_frame(frame).await {
            debug!(%e, "could not send GOAWAY during close");
        }
        self.sent_goaway = true;
        self.terminate_all(|| Error::session(status, "session closed"));
        if let Err(e) = self.transport.shutdown().await {
            debug!(%e, "transport shutdown failed");
        }
        match status {
            GoAwayStatus::Ok => CloseOutcome::Clean(self.origin.clone()),
            status => CloseOutcome::Failed(Arc::new(Error::session(status, "session closed"))),
        }
    }

    /// Fatal teardown. Protocol-level failures still announce themselves
    /// with a GOAWAY; transport failures cannot.
    async fn teardown(&mut self, error: Error) -> CloseOutcome {
        let goaway_status = match &error {
            Error::Session { status, .. } => Some(*status),
            Error::Frame(_) => Some(GoAwayStatus::ProtocolError),
            _ => None,
        };
        match goaway_status {
            Some(status) => {
                error!(%error, "session error, closing with GOAWAY");
                let frame = self.encoder.encode_goaway(self.last_good_remote_id, status);
                if let Err(e) = self.write_frame(frame).await {
                    debug!(%e, "could not send GOAWAY during teardown");
                }
                self.sent_goaway = true;
                self.terminate_all(|| Error::session(status, "session terminated"));
            }
            None => {
                warn!(%error, "transport failure, closing session");
                let message = error.to_string();
                self.terminate_all(|| Error::closed(message.clone()));
            }
        }
        if let Err(e) = self.transport.shutdown().await {
            debug!(%e, "transport shutdown failed");
        }
        CloseOutcome::Failed(Arc::new(error))
    }
}
