//! Connection state machine and public surface.
//!
//! A [`Connection`] wraps two spawned tasks: the reader, which owns the
//! input transport, the frame decoder and the HPACK decoder; and the
//! writer ([`crate::writer`]), which owns the output transport and the
//! HPACK encoder. The application talks to streams through
//! [`StreamHandle`]s; remote-initiated streams arrive via [`accept`]
//! after the configured listener admitted them.
//!
//! [`accept`]: Connection::accept

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, warn};

use crate::error::{Error, ProtoError, Result};
use crate::flow::FlowWindow;
use crate::frame::{
    ErrorCode, Frame, FrameHeader, FrameReader, CONNECTION_PREFACE, DEFAULT_INITIAL_WINDOW_SIZE,
};
use crate::headers::{self, HeaderField};
use crate::hpack::{self, HpackError, HuffmanStrategy};
use crate::settings::Settings;
use crate::stream::{credit_stream, ResetReason, StreamHandle, StreamRecord, StreamState};
use crate::writer::{ControlCmd, WorkCmd, Writer};

/// Which side of the connection this endpoint plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Verdict of the stream listener for a remote-initiated stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamDecision {
    Accept,
    Refuse,
}

/// Callback invoked synchronously from the reader on the validated
/// leading header list of each remote-initiated stream.
pub type StreamListener = Box<dyn FnMut(&[HeaderField]) -> StreamDecision + Send>;

/// Connection-level WINDOW_UPDATE replenish threshold.
const CONN_REPLENISH: u32 = DEFAULT_INITIAL_WINDOW_SIZE / 2;

/// Closed stream ids retained to absorb late frames.
const CLOSED_RETENTION: usize = 32;

/// Shared state between the reader task, the writer task, the
/// [`Connection`] handle and every [`StreamHandle`].
pub(crate) struct ConnShared {
    pub(crate) role: Role,
    pub(crate) control_tx: mpsc::UnboundedSender<ControlCmd>,
    pub(crate) work_tx: mpsc::Sender<WorkCmd>,
    streams: Mutex<StreamTable>,
    conn_recv_window: Mutex<FlowWindow>,
    conn_unacked: AtomicU32,
    /// Effective local INITIAL_WINDOW_SIZE (post-ACK) for new streams.
    pub(crate) local_initial_window: AtomicU32,
    closed: Mutex<Option<ErrorCode>>,
    pub(crate) closed_notify: Notify,
}

pub(crate) struct StreamTable {
    pub(crate) map: HashMap<u32, Arc<StreamRecord>>,
    pub(crate) next_local_id: u32,
    pub(crate) highest_remote: u32,
    pub(crate) last_processed_remote: u32,
    pub(crate) recently_closed: VecDeque<u32>,
    pub(crate) goaway_sent: bool,
    pub(crate) goaway_received: Option<(u32, ErrorCode)>,
    pub(crate) remote_active: usize,
}

impl StreamTable {
    fn new(role: Role) -> Self {
        Self {
            map: HashMap::new(),
            next_local_id: match role {
                Role::Client => 1,
                Role::Server => 2,
            },
            highest_remote: 0,
            last_processed_remote: 0,
            recently_closed: VecDeque::new(),
            goaway_sent: false,
            goaway_received: None,
            remote_active: 0,
        }
    }

    pub(crate) fn note_closed(&mut self, id: u32) {
        if self.recently_closed.len() >= CLOSED_RETENTION {
            self.recently_closed.pop_front();
        }
        self.recently_closed.push_back(id);
    }

    fn is_recently_closed(&self, id: u32) -> bool {
        self.recently_closed.contains(&id)
    }
}

impl ConnShared {
    pub(crate) fn lock_streams(&self) -> MutexGuard<'_, StreamTable> {
        self.streams.lock().expect("stream table poisoned")
    }

    pub(crate) fn closed_code(&self) -> Option<ErrorCode> {
        *self.closed.lock().expect("closed flag poisoned")
    }

    /// Record the close reason; only the first writer wins.
    pub(crate) fn set_closed(&self, code: ErrorCode) -> bool {
        let mut closed = self.closed.lock().expect("closed flag poisoned");
        if closed.is_none() {
            *closed = Some(code);
            true
        } else {
            false
        }
    }

    /// Fail every live stream with the connection's close reason.
    pub(crate) fn fail_all(&self, code: ErrorCode) {
        let records: Vec<Arc<StreamRecord>> =
            self.lock_streams().map.values().cloned().collect();
        for record in records {
            record.fail(ResetReason::Connection(code));
        }
    }

    /// True when `id` belongs to the peer's parity class.
    pub(crate) fn is_remote_id(&self, id: u32) -> bool {
        let odd = id % 2 == 1;
        match self.role {
            Role::Server => odd,
            Role::Client => !odd,
        }
    }

    pub(crate) fn send_rst(&self, id: u32, code: ErrorCode) {
        let _ = self.control_tx.send(ControlCmd::Rst { id, code });
    }

    pub(crate) fn send_window_update(&self, id: u32, increment: u32) {
        let _ = self
            .control_tx
            .send(ControlCmd::WindowUpdate { id, increment });
    }

    /// Account consumed octets against the connection receive window,
    /// emitting a WINDOW_UPDATE once past the replenish threshold.
    pub(crate) fn credit_connection(&self, n: u32) {
        if n == 0 {
            return;
        }
        let total = self.conn_unacked.fetch_add(n, Ordering::AcqRel) + n;
        if total >= CONN_REPLENISH {
            let credit = self.conn_unacked.swap(0, Ordering::AcqRel);
            if credit == 0 {
                return;
            }
            let _ = self
                .conn_recv_window
                .lock()
                .expect("connection window poisoned")
                .grant(credit, 0);
            self.send_window_update(0, credit);
        }
    }

    /// Drop the table entry for a terminated stream, remembering the id
    /// briefly to absorb late frames.
    pub(crate) fn retire_stream(&self, id: u32, remote_initiated: bool) {
        let mut table = self.lock_streams();
        if table.map.remove(&id).is_some() {
            if remote_initiated {
                table.remote_active = table.remote_active.saturating_sub(1);
            }
            table.note_closed(id);
        }
    }
}

/// Configuration for a new connection.
pub struct ConnectionBuilder {
    role: Role,
    settings: Settings,
    huffman: HuffmanStrategy,
    header_list_limit: Option<u32>,
    listener: Option<StreamListener>,
    accept_capacity: usize,
}

impl ConnectionBuilder {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            settings: Settings::default(),
            huffman: HuffmanStrategy::default(),
            header_list_limit: None,
            listener: None,
            accept_capacity: 32,
        }
    }

    pub fn server() -> Self {
        Self::new(Role::Server)
    }

    pub fn client() -> Self {
        Self::new(Role::Client)
    }

    /// Settings advertised in the handshake SETTINGS frame.
    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    pub fn huffman_strategy(mut self, strategy: HuffmanStrategy) -> Self {
        self.huffman = strategy;
        self
    }

    /// Cap the decoded size of a received header list (RFC 7541 sizes:
    /// name + value + 32 per field). Advertised as MAX_HEADER_LIST_SIZE
    /// and enforced locally with a REFUSED_STREAM reset.
    pub fn header_list_size_limit(mut self, octets: u32) -> Self {
        self.header_list_limit = Some(octets);
        self
    }

    /// Accept/refuse callback for remote-initiated streams. The default
    /// accepts everything.
    pub fn stream_listener(
        mut self,
        listener: impl FnMut(&[HeaderField]) -> StreamDecision + Send + 'static,
    ) -> Self {
        self.listener = Some(Box::new(listener));
        self
    }

    /// Capacity of the queue feeding [`Connection::accept`].
    pub fn accept_queue(mut self, capacity: usize) -> Self {
        self.accept_capacity = capacity.max(1);
        self
    }

    /// Run the connection preface exchange and spawn the reader and
    /// writer tasks. The caller passes a connected transport, split into
    /// its read and write halves.
    pub async fn handshake<R, W>(mut self, input: R, mut output: W) -> Result<Connection>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        if let Some(limit) = self.header_list_limit {
            self.settings.max_header_list_size = Some(limit);
        }
        self.settings.validate()?;

        let mut frames = FrameReader::new(input);

        // RFC 7540 section 3.5: the client opens with the 24-octet magic,
        // both sides follow with SETTINGS as their first frame.
        match self.role {
            Role::Client => {
                output.write_all(CONNECTION_PREFACE).await?;
                output.write_all(&self.settings.to_frame().serialize()).await?;
                output.flush().await?;
            }
            Role::Server => {
                output.write_all(&self.settings.to_frame().serialize()).await?;
                output.flush().await?;
                let preface = frames.read_exact_raw(CONNECTION_PREFACE.len()).await?;
                if &preface[..] != CONNECTION_PREFACE {
                    return Err(Error::connection(
                        ErrorCode::ProtocolError,
                        "invalid connection preface",
                    ));
                }
            }
        }

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (work_tx, work_rx) = mpsc::channel(64);
        let (accept_tx, accept_rx) = mpsc::channel(self.accept_capacity);

        let shared = Arc::new(ConnShared {
            role: self.role,
            control_tx,
            work_tx,
            streams: Mutex::new(StreamTable::new(self.role)),
            conn_recv_window: Mutex::new(FlowWindow::new(DEFAULT_INITIAL_WINDOW_SIZE)),
            conn_unacked: AtomicU32::new(0),
            local_initial_window: AtomicU32::new(DEFAULT_INITIAL_WINDOW_SIZE),
            closed: Mutex::new(None),
            closed_notify: Notify::new(),
        });

        let writer = Writer::new(output, control_rx, work_rx, Arc::clone(&shared), self.huffman);
        tokio::spawn(writer.run());

        let reader = Reader {
            frames,
            shared: Arc::clone(&shared),
            decoder: hpack::Decoder::new(),
            local: Settings::default(),
            pending_local: VecDeque::from([self.settings.clone()]),
            remote: Settings::default(),
            list_limit: self.settings.max_header_list_size.map(|n| n as usize),
            cont: None,
            listener: self
                .listener
                .unwrap_or_else(|| Box::new(|_| StreamDecision::Accept)),
            accept_tx,
        };
        tokio::spawn(reader.run());

        Ok(Connection { shared, accept_rx })
    }
}

/// An established HTTP/2 connection.
pub struct Connection {
    shared: Arc<ConnShared>,
    accept_rx: mpsc::Receiver<StreamHandle>,
}

impl Connection {
    pub fn builder(role: Role) -> ConnectionBuilder {
        ConnectionBuilder::new(role)
    }

    /// Await the next accepted remote-initiated stream. Returns `None`
    /// once the connection is closed.
    pub async fn accept(&mut self) -> Option<StreamHandle> {
        self.accept_rx.recv().await
    }

    /// Initiate a stream (client: odd ids, server: even ids). Fails once
    /// a GOAWAY was received or the connection closed.
    pub fn open_stream(&self) -> Result<StreamHandle> {
        if let Some(code) = self.shared.closed_code() {
            return Err(Error::closed(code));
        }
        let mut table = self.shared.lock_streams();
        if let Some((_, code)) = table.goaway_received {
            return Err(Error::closed(code));
        }
        let id = table.next_local_id;
        table.next_local_id += 2;
        let target = self.shared.local_initial_window.load(Ordering::Acquire);
        let record = StreamRecord::new(id, StreamState::Idle, target);
        table.map.insert(id, Arc::clone(&record));
        drop(table);

        Ok(StreamHandle {
            id,
            record,
            conn: Arc::clone(&self.shared),
            remote_initiated: false,
        })
    }

    /// Graceful shutdown: GOAWAY(NO_ERROR), drain the writer, close the
    /// output. Outstanding streams fail with the close reason.
    pub fn close(&self) {
        let last = {
            let mut table = self.shared.lock_streams();
            table.goaway_sent = true;
            table.last_processed_remote
        };
        let _ = self.shared.control_tx.send(ControlCmd::GoAway {
            last_stream_id: last,
            code: ErrorCode::NoError,
            debug_data: Bytes::new(),
        });
        self.shared.set_closed(ErrorCode::NoError);
        self.shared.fail_all(ErrorCode::NoError);
        self.shared.closed_notify.notify_waiters();
    }

    /// The GOAWAY the peer sent, if any.
    pub fn goaway_received(&self) -> Option<(u32, ErrorCode)> {
        self.shared.lock_streams().goaway_received
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed_code().is_some()
    }

    /// Await connection termination, returning the close reason.
    pub async fn closed(&self) -> ErrorCode {
        loop {
            let notified = self.shared.closed_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(code) = self.shared.closed_code() {
                return code;
            }
            notified.await;
        }
    }
}

/// In-progress header block spanning HEADERS/PUSH_PROMISE plus
/// CONTINUATION frames.
struct ContState {
    id: u32,
    end_stream: bool,
    buf: BytesMut,
    /// Set when the block belongs to a PUSH_PROMISE (the promised id).
    promised: Option<u32>,
}

/// Where an unknown stream id falls relative to the connection history.
enum UnknownStream {
    Idle,
    RecentlyClosed,
    Old,
}

struct Reader<R> {
    frames: FrameReader<R>,
    shared: Arc<ConnShared>,
    decoder: hpack::Decoder,
    /// Local settings in effect (acknowledged by the peer).
    local: Settings,
    /// Sent but not yet acknowledged settings, oldest first.
    pending_local: VecDeque<Settings>,
    /// The peer's settings as last received.
    remote: Settings,
    list_limit: Option<usize>,
    cont: Option<ContState>,
    listener: StreamListener,
    accept_tx: mpsc::Sender<StreamHandle>,
}

impl<R: AsyncRead + Unpin> Reader<R> {
    async fn run(mut self) {
        loop {
            if self.shared.closed_code().is_some() {
                break;
            }

            // The notified future borrows shared state, so keep it
            // scoped away from dispatch below.
            let next = {
                let closed = self.shared.closed_notify.notified();
                tokio::pin!(closed);
                closed.as_mut().enable();
                if self.shared.closed_code().is_some() {
                    break;
                }
                tokio::select! {
                    biased;
                    _ = &mut closed => None,
                    result = self.frames.read_frame() => Some(result),
                }
            };
            let Some(result) = next else { continue };

            match result {
                Ok(Some((header, payload))) => {
                    if let Err(proto) = self.dispatch(header, payload).await {
                        match proto {
                            ProtoError::Stream { id, code } => self.reset_stream(id, code),
                            ProtoError::Connection { code, reason } => {
                                self.fatal(code, reason);
                                break;
                            }
                        }
                    }
                }
                Ok(None) => {
                    self.on_eof();
                    break;
                }
                Err(Error::Connection { code, reason }) => {
                    self.fatal(code, reason);
                    break;
                }
                Err(e) => {
                    self.fatal(ErrorCode::InternalError, format!("transport failure: {e}"));
                    break;
                }
            }
        }
        debug!("reader task finished");
    }

    /// Classify, validate and apply one inbound frame.
    async fn dispatch(&mut self, header: FrameHeader, payload: Bytes) -> std::result::Result<(), ProtoError> {
        // While a header block is open, only CONTINUATION for the same
        // stream may arrive; anything else kills the connection.
        if let Some(cont) = &self.cont {
            match header.frame_type {
                crate::frame::FrameType::Continuation if header.stream_id == cont.id => {}
                _ => {
                    return Err(ProtoError::conn(
                        ErrorCode::ProtocolError,
                        "frame interleaved inside a header block",
                    ))
                }
            }
        }

        let payload_len = header.length;
        match Frame::parse(&header, payload)? {
            Frame::Settings(frame) => self.on_settings(frame)?,
            Frame::Ping(frame) => {
                if !frame.ack {
                    let _ = self.shared.control_tx.send(ControlCmd::PingAck(frame.data));
                }
            }
            Frame::GoAway(frame) => self.on_goaway(frame.last_stream_id, frame.error_code),
            Frame::WindowUpdate(frame) => self.on_window_update(frame.stream_id, frame.increment)?,
            Frame::RstStream(frame) => self.on_rst(frame.stream_id, frame.error_code)?,
            Frame::Priority(frame) => {
                // Parsed for validity; priority trees are not modeled.
                debug!("ignoring PRIORITY for stream {}", frame.stream_id);
            }
            Frame::Data(frame) => self.on_data(frame.stream_id, frame.data, payload_len, frame.end_stream)?,
            Frame::Headers(frame) => {
                if frame.end_headers {
                    self.finish_block(frame.stream_id, frame.end_stream, frame.fragment, None)
                        .await?;
                } else {
                    self.cont = Some(ContState {
                        id: frame.stream_id,
                        end_stream: frame.end_stream,
                        buf: BytesMut::from(&frame.fragment[..]),
                        promised: None,
                    });
                }
            }
            Frame::PushPromise(frame) => self.on_push_promise(frame).await?,
            Frame::Continuation(frame) => {
                let Some(mut cont) = self.cont.take() else {
                    return Err(ProtoError::conn(
                        ErrorCode::ProtocolError,
                        "CONTINUATION without an open header block",
                    ));
                };
                cont.buf.extend_from_slice(&frame.fragment);
                let cap = self.cont_cap();
                if cont.buf.len() > cap {
                    return Err(ProtoError::conn(
                        ErrorCode::EnhanceYourCalm,
                        "header block exceeds accumulation cap",
                    ));
                }
                if frame.end_headers {
                    let block = cont.buf.freeze();
                    self.finish_block(cont.id, cont.end_stream, block, cont.promised)
                        .await?;
                } else {
                    self.cont = Some(cont);
                }
            }
            Frame::Unknown { frame_type, .. } => {
                debug!("ignoring unknown frame type {frame_type:#x}");
            }
        }
        Ok(())
    }

    fn cont_cap(&self) -> usize {
        self.list_limit
            .map(|limit| limit.saturating_mul(4))
            .unwrap_or(0)
            .max(64 * 1024)
    }

    fn on_settings(&mut self, frame: crate::frame::SettingsFrame) -> std::result::Result<(), ProtoError> {
        if frame.ack {
            match self.pending_local.pop_front() {
                Some(settings) => {
                    self.decoder
                        .set_max_size_limit(settings.header_table_size as usize);
                    self.frames.set_max_frame_size(settings.max_frame_size);
                    self.shared
                        .local_initial_window
                        .store(settings.initial_window_size, Ordering::Release);
                    self.local = settings;
                }
                None => warn!("SETTINGS ACK without outstanding settings"),
            }
            return Ok(());
        }

        self.remote.apply(&frame)?;
        let _ = self
            .shared
            .control_tx
            .send(ControlCmd::ApplyRemoteSettings(self.remote.clone()));
        Ok(())
    }

    fn on_goaway(&mut self, last_stream_id: u32, code: ErrorCode) {
        debug!("GOAWAY received: last={last_stream_id} code={code:?}");
        let doomed: Vec<Arc<StreamRecord>> = {
            let mut table = self.shared.lock_streams();
            table.goaway_received = Some((last_stream_id, code));
            table
                .map
                .values()
                .filter(|r| !self.shared.is_remote_id(r.id) && r.id > last_stream_id)
                .cloned()
                .collect()
        };
        // Streams above the advertised id will never be processed; those
        // at or below it may run to completion.
        for record in doomed {
            record.fail(ResetReason::Remote(ErrorCode::RefusedStream));
            self.shared.retire_stream(record.id, false);
        }
    }

    fn on_window_update(&mut self, id: u32, increment: u32) -> std::result::Result<(), ProtoError> {
        if id == 0 {
            let _ = self
                .shared
                .control_tx
                .send(ControlCmd::ConnCredit { increment });
            return Ok(());
        }
        let known = self.shared.lock_streams().map.contains_key(&id);
        if known {
            let _ = self.shared.control_tx.send(ControlCmd::StreamCredit {
                id,
                increment,
                open: true,
            });
            return Ok(());
        }
        match self.classify_unknown(id) {
            UnknownStream::Idle => Err(ProtoError::conn(
                ErrorCode::ProtocolError,
                "WINDOW_UPDATE on idle stream",
            )),
            UnknownStream::RecentlyClosed => {
                // The stream just went away, but the writer may still be
                // parked on this window; let the credit through.
                let _ = self.shared.control_tx.send(ControlCmd::StreamCredit {
                    id,
                    increment,
                    open: false,
                });
                Ok(())
            }
            UnknownStream::Old => Err(ProtoError::conn(
                ErrorCode::StreamClosed,
                "WINDOW_UPDATE on long-closed stream",
            )),
        }
    }

    fn on_rst(&mut self, id: u32, code: ErrorCode) -> std::result::Result<(), ProtoError> {
        let record = self.shared.lock_streams().map.get(&id).cloned();
        if let Some(record) = record {
            record.fail(ResetReason::Remote(code));
            self.shared
                .retire_stream(id, self.shared.is_remote_id(id));
            return Ok(());
        }
        match self.classify_unknown(id) {
            UnknownStream::Idle => Err(ProtoError::conn(
                ErrorCode::ProtocolError,
                "RST_STREAM on idle stream",
            )),
            UnknownStream::RecentlyClosed => {
                debug!("ignoring RST_STREAM for recently closed stream {id}");
                Ok(())
            }
            UnknownStream::Old => Err(ProtoError::conn(
                ErrorCode::StreamClosed,
                "RST_STREAM on long-closed stream",
            )),
        }
    }

    fn on_data(
        &mut self,
        id: u32,
        data: Bytes,
        payload_len: u32,
        end_stream: bool,
    ) -> std::result::Result<(), ProtoError> {
        // The whole payload, padding included, counts against flow
        // control at both scopes.
        {
            let mut window = self
                .shared
                .conn_recv_window
                .lock()
                .expect("connection window poisoned");
            if window.consume(payload_len).is_err() {
                return Err(ProtoError::conn(
                    ErrorCode::FlowControlError,
                    "connection receive window underflow",
                ));
            }
        }

        let record = self.shared.lock_streams().map.get(&id).cloned();
        let Some(record) = record else {
            // Credit the connection window back; nobody will consume this.
            self.shared.credit_connection(payload_len);
            return match self.classify_unknown(id) {
                UnknownStream::Idle => Err(ProtoError::conn(
                    ErrorCode::ProtocolError,
                    "DATA on idle stream",
                )),
                UnknownStream::RecentlyClosed => {
                    Err(ProtoError::stream(id, ErrorCode::StreamClosed))
                }
                UnknownStream::Old => Err(ProtoError::conn(
                    ErrorCode::StreamClosed,
                    "DATA on long-closed stream",
                )),
            };
        };

        let padding = payload_len - data.len() as u32;
        let mut closed_now = false;
        {
            let mut inner = record.lock();
            if !inner.state.peer_may_send() {
                drop(inner);
                self.shared.credit_connection(payload_len);
                return Err(ProtoError::stream(id, ErrorCode::StreamClosed));
            }
            if inner.recv_window.consume(payload_len).is_err() {
                drop(inner);
                self.shared.credit_connection(payload_len);
                return Err(ProtoError::stream(id, ErrorCode::FlowControlError));
            }
            if !data.is_empty() {
                inner.recv_buf.push_back(data);
            }
            if end_stream {
                inner.remote_end = true;
                inner.state = inner.state.on_recv_end_stream();
                closed_now = inner.state.is_closed() && inner.reset.is_none();
            }
        }
        // Padding octets never reach the application; re-credit them now.
        if padding > 0 {
            credit_stream(&record, &self.shared, padding);
            self.shared.credit_connection(padding);
        }
        record.readable.notify_waiters();
        if closed_now {
            self.shared.retire_stream(id, self.shared.is_remote_id(id));
        }
        Ok(())
    }

    async fn on_push_promise(
        &mut self,
        frame: crate::frame::PushPromiseFrame,
    ) -> std::result::Result<(), ProtoError> {
        if self.shared.role == Role::Server {
            return Err(ProtoError::conn(
                ErrorCode::ProtocolError,
                "PUSH_PROMISE received by server",
            ));
        }
        if !self.local.enable_push {
            return Err(ProtoError::conn(
                ErrorCode::ProtocolError,
                "PUSH_PROMISE with push disabled",
            ));
        }
        let associated = self
            .shared
            .lock_streams()
            .map
            .contains_key(&frame.stream_id);
        if !associated {
            return Err(ProtoError::conn(
                ErrorCode::ProtocolError,
                "PUSH_PROMISE on unknown stream",
            ));
        }
        {
            let mut table = self.shared.lock_streams();
            if frame.promised_stream_id <= table.highest_remote
                || !self.shared.is_remote_id(frame.promised_stream_id)
            {
                return Err(ProtoError::conn(
                    ErrorCode::ProtocolError,
                    "PUSH_PROMISE with invalid promised id",
                ));
            }
            table.highest_remote = frame.promised_stream_id;
            table.note_closed(frame.promised_stream_id);
        }

        if frame.end_headers {
            self.finish_block(
                frame.stream_id,
                false,
                frame.fragment,
                Some(frame.promised_stream_id),
            )
            .await?;
        } else {
            self.cont = Some(ContState {
                id: frame.stream_id,
                end_stream: false,
                buf: BytesMut::from(&frame.fragment[..]),
                promised: Some(frame.promised_stream_id),
            });
        }
        Ok(())
    }

    /// A complete header block arrived: decode, validate, route.
    async fn finish_block(
        &mut self,
        id: u32,
        end_stream: bool,
        block: Bytes,
        promised: Option<u32>,
    ) -> std::result::Result<(), ProtoError> {
        let fields = match self.decoder.decode(&block, self.list_limit) {
            Ok(fields) => fields,
            Err(HpackError::ListTooLarge) => {
                // The dynamic table is still synchronized; refuse just
                // the stream.
                let refused = promised.unwrap_or(id);
                warn!("header list over limit on stream {refused}");
                if promised.is_none() {
                    self.note_remote_header_progress(id);
                }
                return Err(ProtoError::stream(refused, ErrorCode::RefusedStream));
            }
            Err(e) => {
                return Err(ProtoError::conn(
                    ErrorCode::CompressionError,
                    format!("header block decode failed: {e}"),
                ));
            }
        };

        if let Some(promised_id) = promised {
            // Conformance only: the promise parsed and the codec state is
            // consistent; the engine does not surface pushed streams.
            debug!("refusing pushed stream {promised_id}");
            self.shared.send_rst(promised_id, ErrorCode::RefusedStream);
            return Ok(());
        }

        let record = self.shared.lock_streams().map.get(&id).cloned();
        if let Some(record) = record {
            return self.deliver_headers(&record, fields, end_stream);
        }

        // Unknown id: on a server this may open a stream. A client never
        // sees legitimate HEADERS on an id it did not open, because
        // pushes arrive as PUSH_PROMISE and are refused there.
        match self.classify_unknown(id) {
            UnknownStream::Idle
                if self.shared.is_remote_id(id) && self.shared.role == Role::Server =>
            {
                self.open_remote_stream(id, fields, end_stream).await
            }
            UnknownStream::Idle => Err(ProtoError::conn(
                ErrorCode::ProtocolError,
                "HEADERS on idle stream",
            )),
            UnknownStream::RecentlyClosed => Err(ProtoError::stream(id, ErrorCode::StreamClosed)),
            UnknownStream::Old => Err(ProtoError::conn(
                ErrorCode::StreamClosed,
                "HEADERS on long-closed stream",
            )),
        }
    }

    /// Leading headers or trailers for a stream we already track.
    fn deliver_headers(
        &mut self,
        record: &Arc<StreamRecord>,
        fields: Vec<HeaderField>,
        end_stream: bool,
    ) -> std::result::Result<(), ProtoError> {
        let id = record.id;
        let closed_now = {
            let mut inner = record.lock();
            if inner.state == StreamState::Idle {
                // A stream we opened locally but have not spoken on yet;
                // the peer has nothing to respond to.
                return Err(ProtoError::conn(
                    ErrorCode::ProtocolError,
                    "HEADERS on idle stream",
                ));
            }
            if !inner.state.peer_may_send() {
                return Err(ProtoError::stream(id, ErrorCode::StreamClosed));
            }

            if !inner.recv_headers {
                // First block from the peer on this stream.
                let check = match self.shared.role {
                    Role::Client => headers::validate_response(&fields),
                    Role::Server => headers::validate_request(&fields),
                };
                if check.is_err() {
                    return Err(ProtoError::stream(id, ErrorCode::ProtocolError));
                }
                inner.recv_headers = true;
                inner.headers = Some(fields);
            } else {
                // A second block is only legal as trailers, which must
                // end the stream.
                if !end_stream || headers::validate_trailers(&fields).is_err() {
                    return Err(ProtoError::stream(id, ErrorCode::ProtocolError));
                }
                inner.trailers = Some(fields);
            }
            if end_stream {
                inner.remote_end = true;
                inner.state = inner.state.on_recv_end_stream();
            }
            inner.state.is_closed() && inner.reset.is_none()
        };
        record.readable.notify_waiters();
        if closed_now {
            self.shared.retire_stream(id, self.shared.is_remote_id(id));
        }
        Ok(())
    }

    /// Leading HEADERS on an unseen remote-parity id: create the stream,
    /// consult the listener, hand the handle to the application.
    async fn open_remote_stream(
        &mut self,
        id: u32,
        fields: Vec<HeaderField>,
        end_stream: bool,
    ) -> std::result::Result<(), ProtoError> {
        self.note_remote_header_progress(id);

        {
            let table = self.shared.lock_streams();
            if table.goaway_sent {
                drop(table);
                // We are shutting down; refuse without error.
                self.shared.send_rst(id, ErrorCode::RefusedStream);
                self.shared.lock_streams().note_closed(id);
                return Ok(());
            }
            if let Some(max) = self.local.max_concurrent_streams {
                if table.remote_active >= max as usize {
                    drop(table);
                    self.shared.send_rst(id, ErrorCode::RefusedStream);
                    self.shared.lock_streams().note_closed(id);
                    return Ok(());
                }
            }
        }

        let check = match self.shared.role {
            Role::Server => headers::validate_request(&fields),
            Role::Client => headers::validate_response(&fields),
        };
        if let Err(e) = check {
            debug!("rejecting stream {id}: {e}");
            self.shared.lock_streams().note_closed(id);
            return Err(ProtoError::stream(id, ErrorCode::ProtocolError));
        }

        if (self.listener)(&fields) == StreamDecision::Refuse {
            self.shared.send_rst(id, ErrorCode::RefusedStream);
            self.shared.lock_streams().note_closed(id);
            return Ok(());
        }

        let target = self.shared.local_initial_window.load(Ordering::Acquire);
        let record = StreamRecord::new(id, StreamState::open_remote(end_stream), target);
        {
            let mut inner = record.lock();
            inner.recv_headers = true;
            inner.headers = Some(fields);
            inner.remote_end = end_stream;
        }
        {
            let mut table = self.shared.lock_streams();
            table.map.insert(id, Arc::clone(&record));
            table.remote_active += 1;
        }

        let handle = StreamHandle {
            id,
            record: Arc::clone(&record),
            conn: Arc::clone(&self.shared),
            remote_initiated: true,
        };
        if let Err(returned) = self.accept_tx.send(handle).await {
            // Nobody is accepting streams anymore; refuse this one
            // without letting the handle's drop-cancel fire first.
            record.fail(ResetReason::Local(ErrorCode::RefusedStream));
            self.shared.send_rst(id, ErrorCode::RefusedStream);
            self.shared.retire_stream(id, true);
            drop(returned);
        }
        Ok(())
    }

    /// Track the highest remote-initiated id whose HEADERS we processed,
    /// for GOAWAY accuracy.
    fn note_remote_header_progress(&self, id: u32) {
        if self.shared.is_remote_id(id) {
            let mut table = self.shared.lock_streams();
            if id > table.highest_remote {
                table.highest_remote = id;
            }
            if id > table.last_processed_remote {
                table.last_processed_remote = id;
            }
        }
    }

    fn classify_unknown(&self, id: u32) -> UnknownStream {
        let table = self.shared.lock_streams();
        let never_seen = if self.shared.is_remote_id(id) {
            id > table.highest_remote
        } else {
            id >= table.next_local_id
        };
        if never_seen {
            UnknownStream::Idle
        } else if table.is_recently_closed(id) {
            UnknownStream::RecentlyClosed
        } else {
            UnknownStream::Old
        }
    }

    /// Stream-scope fault: reset the stream, keep the connection.
    fn reset_stream(&mut self, id: u32, code: ErrorCode) {
        debug!("resetting stream {id}: {code:?}");
        self.shared.send_rst(id, code);
        let record = self.shared.lock_streams().map.get(&id).cloned();
        if let Some(record) = record {
            record.fail(ResetReason::Local(code));
            self.shared.retire_stream(id, self.shared.is_remote_id(id));
        } else {
            self.shared.lock_streams().note_closed(id);
        }
    }

    /// Connection-scope fault: GOAWAY with the last processed remote id,
    /// fail everything, stop.
    fn fatal(&mut self, code: ErrorCode, reason: String) {
        error!("connection error {code:?}: {reason}");
        let last = {
            let mut table = self.shared.lock_streams();
            table.goaway_sent = true;
            table.last_processed_remote
        };
        let _ = self.shared.control_tx.send(ControlCmd::GoAway {
            last_stream_id: last,
            code,
            debug_data: Bytes::from(reason),
        });
        self.teardown(code);
    }

    /// Clean EOF from the peer at a frame boundary.
    fn on_eof(&mut self) {
        let code = self
            .shared
            .lock_streams()
            .goaway_received
            .map(|(_, code)| code)
            .unwrap_or(ErrorCode::NoError);
        debug!("transport EOF, closing with {code:?}");
        let last = self.shared.lock_streams().last_processed_remote;
        let _ = self.shared.control_tx.send(ControlCmd::GoAway {
            last_stream_id: last,
            code: ErrorCode::NoError,
            debug_data: Bytes::new(),
        });
        self.teardown(code);
    }

    fn teardown(&mut self, code: ErrorCode) {
        self.shared.set_closed(code);
        self.shared.fail_all(code);
        self.shared.closed_notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_table_retention_is_bounded() {
        let mut table = StreamTable::new(Role::Server);
        for id in 1..=100u32 {
            table.note_closed(id);
        }
        assert_eq!(table.recently_closed.len(), CLOSED_RETENTION);
        assert!(!table.is_recently_closed(1));
        assert!(table.is_recently_closed(100));
    }

    #[test]
    fn local_id_parity_follows_role() {
        assert_eq!(StreamTable::new(Role::Client).next_local_id, 1);
        assert_eq!(StreamTable::new(Role::Server).next_local_id, 2);
    }
}
