//! Egress scheduler: the single task that owns the output transport.
//!
//! Ordering: connection control frames are emitted as soon as their
//! command is dequeued and always outrank buffered DATA; leading HEADERS
//! are emitted at dequeue time and therefore also precede DATA; DATA is
//! drained round-robin across streams with buffered payload and positive
//! windows, each chunk capped by min(stream window, connection window,
//! peer MAX_FRAME_SIZE). A stream whose budget hits zero is parked until
//! a WINDOW_UPDATE credits it. Fair bandwidth among streams with equal
//! windows is not guaranteed.
//!
//! The HPACK encoder lives here so its dynamic table evolves in exactly
//! the order blocks are emitted.

use std::collections::{HashMap, VecDeque};
use std::ops::ControlFlow;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::buffer::BufferPool;
use crate::connection::ConnShared;
use crate::error::{ProtoError, Result};
use crate::flow::FlowWindow;
use crate::frame::{
    ContinuationFrame, DataFrame, ErrorCode, GoAwayFrame, HeadersFrame, PingFrame, RstStreamFrame,
    SettingsFrame, WindowUpdateFrame,
};
use crate::headers::HeaderField;
use crate::hpack;
use crate::settings::Settings;
use crate::stream::ResetReason;

/// Commands with strict priority over headers and data.
#[derive(Debug)]
pub(crate) enum ControlCmd {
    PingAck([u8; 8]),
    /// Emit SETTINGS-ACK, then apply the peer's settings; one command so
    /// the ACK always precedes any frame using the new values.
    ApplyRemoteSettings(Settings),
    WindowUpdate { id: u32, increment: u32 },
    Rst { id: u32, code: ErrorCode },
    /// Peer WINDOW_UPDATE on stream 0.
    ConnCredit { increment: u32 },
    /// Peer WINDOW_UPDATE on a stream. `open` is false when the stream
    /// was already retired; such credits only apply to send state that
    /// still exists (parked data), never create new state.
    StreamCredit { id: u32, increment: u32, open: bool },
    /// Emit GOAWAY, drain, close the output and exit.
    GoAway {
        last_stream_id: u32,
        code: ErrorCode,
        debug_data: Bytes,
    },
}

/// Stream work: submission order is preserved per stream.
#[derive(Debug)]
pub(crate) enum WorkCmd {
    Headers {
        id: u32,
        fields: Vec<HeaderField>,
        end_stream: bool,
    },
    Data {
        id: u32,
        chunk: Bytes,
        end_stream: bool,
    },
    Trailers { id: u32, fields: Vec<HeaderField> },
}

enum QueuedItem {
    Data { chunk: Bytes, end_stream: bool },
    Trailers(Vec<HeaderField>),
}

struct SendStream {
    window: FlowWindow,
    queue: VecDeque<QueuedItem>,
    in_ready: bool,
}

/// How many recently reset stream ids to remember so late work commands
/// for them are dropped instead of framed.
const RESET_MEMORY: usize = 128;

pub(crate) struct Writer<W> {
    output: W,
    control_rx: mpsc::UnboundedReceiver<ControlCmd>,
    work_rx: mpsc::Receiver<WorkCmd>,
    shared: Arc<ConnShared>,
    encoder: hpack::Encoder,
    pool: BufferPool,
    conn_window: FlowWindow,
    remote: Settings,
    streams: HashMap<u32, SendStream>,
    ready: VecDeque<u32>,
    resets: VecDeque<u32>,
    /// Credits that arrived before the stream's first work command
    /// (control is drained ahead of work, so this ordering is possible).
    orphan_credits: VecDeque<(u32, u32)>,
    work_open: bool,
    control_open: bool,
}

impl<W: AsyncWrite + Unpin> Writer<W> {
    pub(crate) fn new(
        output: W,
        control_rx: mpsc::UnboundedReceiver<ControlCmd>,
        work_rx: mpsc::Receiver<WorkCmd>,
        shared: Arc<ConnShared>,
        huffman: hpack::HuffmanStrategy,
    ) -> Self {
        let remote = Settings::default();
        Self {
            output,
            control_rx,
            work_rx,
            shared,
            encoder: hpack::Encoder::with_strategy(huffman),
            pool: BufferPool::new(remote.max_frame_size),
            conn_window: FlowWindow::new(crate::frame::DEFAULT_INITIAL_WINDOW_SIZE),
            remote,
            streams: HashMap::new(),
            ready: VecDeque::new(),
            resets: VecDeque::new(),
            orphan_credits: VecDeque::new(),
            work_open: true,
            control_open: true,
        }
    }

    pub(crate) async fn run(mut self) {
        match self.drive().await {
            Ok(()) => debug!("writer task finished"),
            Err(e) => {
                error!("writer transport failure: {e}");
                self.shared.set_closed(ErrorCode::InternalError);
                self.shared.fail_all(ErrorCode::InternalError);
            }
        }
        // Whoever stopped us set the real close reason; this is the
        // fallback for a silent exit (all senders dropped).
        self.shared.set_closed(ErrorCode::NoError);
        self.shared.closed_notify.notify_waiters();
    }

    async fn drive(&mut self) -> Result<()> {
        loop {
            // Drain whatever is immediately available, control first.
            while let Ok(cmd) = self.control_rx.try_recv() {
                if let ControlFlow::Break(()) = self.handle_control(cmd).await? {
                    return Ok(());
                }
            }
            while let Ok(cmd) = self.work_rx.try_recv() {
                self.handle_work(cmd).await?;
            }

            self.pump().await?;
            self.output.flush().await?;

            if !self.control_open && !self.work_open {
                return Ok(());
            }

            tokio::select! {
                biased;
                cmd = self.control_rx.recv(), if self.control_open => match cmd {
                    Some(cmd) => {
                        if let ControlFlow::Break(()) = self.handle_control(cmd).await? {
                            return Ok(());
                        }
                    }
                    None => self.control_open = false,
                },
                cmd = self.work_rx.recv(), if self.work_open => match cmd {
                    Some(cmd) => self.handle_work(cmd).await?,
                    None => self.work_open = false,
                },
            }
        }
    }

    async fn handle_control(&mut self, cmd: ControlCmd) -> Result<ControlFlow<()>> {
        match cmd {
            ControlCmd::PingAck(data) => {
                self.output
                    .write_all(&PingFrame::ack(data).serialize())
                    .await?;
            }
            ControlCmd::ApplyRemoteSettings(new) => {
                // ACK first: no later frame may depend on the new values
                // without the peer having seen the acknowledgement.
                self.output
                    .write_all(&SettingsFrame::ack().serialize())
                    .await?;
                if let Err(proto) = self.apply_remote_settings(new) {
                    return self.fail_connection(proto).await;
                }
            }
            ControlCmd::WindowUpdate { id, increment } => {
                self.output
                    .write_all(&WindowUpdateFrame::new(id, increment).serialize())
                    .await?;
            }
            ControlCmd::Rst { id, code } => {
                self.streams.remove(&id);
                self.note_reset(id);
                self.output
                    .write_all(&RstStreamFrame::new(id, code).serialize())
                    .await?;
            }
            ControlCmd::ConnCredit { increment } => {
                if let Err(proto) = self.conn_window.grant(increment, 0) {
                    return self.fail_connection(proto).await;
                }
                self.wake_all();
            }
            ControlCmd::StreamCredit { id, increment, open } => {
                if !open && !self.streams.contains_key(&id) {
                    // Work for this stream may still be in flight behind
                    // us; hold the credit until its send state appears.
                    if self.orphan_credits.len() >= RESET_MEMORY {
                        self.orphan_credits.pop_front();
                    }
                    self.orphan_credits.push_back((id, increment));
                    return Ok(ControlFlow::Continue(()));
                }
                let stream = self.send_stream(id);
                match stream.window.grant(increment, id) {
                    Ok(()) => self.wake(id),
                    Err(_) => {
                        // Stream-scope overflow: reset the stream, keep
                        // the connection.
                        self.streams.remove(&id);
                        self.note_reset(id);
                        self.fail_stream(id, ErrorCode::FlowControlError);
                        self.output
                            .write_all(
                                &RstStreamFrame::new(id, ErrorCode::FlowControlError).serialize(),
                            )
                            .await?;
                    }
                }
            }
            ControlCmd::GoAway {
                last_stream_id,
                code,
                debug_data,
            } => {
                if code == ErrorCode::NoError {
                    // Graceful shutdown: let sendable data drain first.
                    self.pump().await?;
                }
                self.output
                    .write_all(
                        &GoAwayFrame::new(last_stream_id, code)
                            .with_debug(debug_data)
                            .serialize(),
                    )
                    .await?;
                self.output.flush().await?;
                let _ = self.output.shutdown().await;
                return Ok(ControlFlow::Break(()));
            }
        }
        Ok(ControlFlow::Continue(()))
    }

    async fn handle_work(&mut self, cmd: WorkCmd) -> Result<()> {
        match cmd {
            WorkCmd::Headers {
                id,
                fields,
                end_stream,
            } => {
                if self.is_reset(id) {
                    return Ok(());
                }
                let block = self.encoder.encode(&fields);
                self.write_header_block(id, block, end_stream).await?;
                if end_stream {
                    self.streams.remove(&id);
                }
            }
            WorkCmd::Data {
                id,
                chunk,
                end_stream,
            } => {
                if self.is_reset(id) {
                    return Ok(());
                }
                self.send_stream(id)
                    .queue
                    .push_back(QueuedItem::Data { chunk, end_stream });
                self.wake(id);
            }
            WorkCmd::Trailers { id, fields } => {
                if self.is_reset(id) {
                    return Ok(());
                }
                self.send_stream(id)
                    .queue
                    .push_back(QueuedItem::Trailers(fields));
                self.wake(id);
            }
        }
        Ok(())
    }

    /// Emit buffered DATA/trailers round-robin while budgets allow.
    async fn pump(&mut self) -> Result<()> {
        while let Some(id) = self.ready.pop_front() {
            enum Plan {
                Skip,
                EmptyData { end_stream: bool },
                Data { part: Bytes, end_stream: bool },
                Trailers(Vec<HeaderField>),
            }

            let plan = {
                let conn_avail = self.conn_window.available();
                let max_frame = self.remote.max_frame_size;
                let Some(stream) = self.streams.get_mut(&id) else {
                    continue;
                };
                stream.in_ready = false;
                match stream.queue.front_mut() {
                    None => Plan::Skip,
                    Some(QueuedItem::Trailers(_)) => {
                        let Some(QueuedItem::Trailers(fields)) = stream.queue.pop_front() else {
                            unreachable!()
                        };
                        Plan::Trailers(fields)
                    }
                    Some(QueuedItem::Data { chunk, end_stream }) => {
                        if chunk.is_empty() {
                            let end_stream = *end_stream;
                            stream.queue.pop_front();
                            Plan::EmptyData { end_stream }
                        } else {
                            let budget = (chunk.len() as u32)
                                .min(stream.window.available())
                                .min(conn_avail)
                                .min(max_frame);
                            if budget == 0 {
                                // Parked until a WINDOW_UPDATE wakes it.
                                continue;
                            }
                            let part = chunk.split_to(budget as usize);
                            let end_stream = *end_stream && chunk.is_empty();
                            if chunk.is_empty() {
                                stream.queue.pop_front();
                            }
                            stream
                                .window
                                .consume(budget)
                                .expect("stream budget checked");
                            self.conn_window
                                .consume(budget)
                                .expect("connection budget checked");
                            Plan::Data { part, end_stream }
                        }
                    }
                }
            };

            match plan {
                Plan::Skip => {}
                Plan::EmptyData { end_stream } => {
                    self.write_data_frame(DataFrame::new(id, Bytes::new()).end_stream(end_stream))
                        .await?;
                    self.finish_or_wake(id, end_stream);
                }
                Plan::Data { part, end_stream } => {
                    let released = part.len() as u32;
                    self.write_data_frame(DataFrame::new(id, part).end_stream(end_stream))
                        .await?;
                    self.release_capacity(id, released);
                    self.finish_or_wake(id, end_stream);
                }
                Plan::Trailers(fields) => {
                    let block = self.encoder.encode(&fields);
                    self.write_header_block(id, block, true).await?;
                    self.finish_or_wake(id, true);
                }
            }
        }
        Ok(())
    }

    /// Emit one header block as HEADERS + CONTINUATION frames, split by
    /// the peer's MAX_FRAME_SIZE.
    async fn write_header_block(
        &mut self,
        id: u32,
        block: Bytes,
        end_stream: bool,
    ) -> Result<()> {
        let max_frame = self.remote.max_frame_size as usize;
        let mut rest = block;
        let first_len = rest.len().min(max_frame);
        let first = rest.split_to(first_len);

        let headers = HeadersFrame::new(id, first)
            .end_stream(end_stream)
            .end_headers(rest.is_empty());
        let mut buf = self.pool.checkout();
        headers.serialize_into(&mut buf);
        self.output.write_all(&buf).await?;
        self.pool.checkin(buf);

        while !rest.is_empty() {
            let len = rest.len().min(max_frame);
            let fragment = rest.split_to(len);
            let cont = ContinuationFrame::new(id, fragment, rest.is_empty());
            let mut buf = self.pool.checkout();
            cont.serialize_into(&mut buf);
            self.output.write_all(&buf).await?;
            self.pool.checkin(buf);
        }
        Ok(())
    }

    async fn write_data_frame(&mut self, frame: DataFrame) -> Result<()> {
        let mut buf = self.pool.checkout();
        frame.serialize_into(&mut buf);
        self.output.write_all(&buf).await?;
        self.pool.checkin(buf);
        Ok(())
    }

    /// Return emitted bytes to the stream's submission budget so a parked
    /// `write_data` resumes.
    fn release_capacity(&self, id: u32, n: u32) {
        let record = {
            let table = self.shared.lock_streams();
            table.map.get(&id).cloned()
        };
        if let Some(record) = record {
            record.send_capacity.add_permits(n as usize);
        }
    }

    fn apply_remote_settings(&mut self, new: Settings) -> std::result::Result<(), ProtoError> {
        let old = std::mem::replace(&mut self.remote, new.clone());

        if new.header_table_size != old.header_table_size {
            self.encoder
                .set_max_table_size(new.header_table_size as usize);
        }
        if new.max_frame_size != old.max_frame_size {
            self.pool.set_max_frame_size(new.max_frame_size);
        }

        let delta = new.initial_window_size as i32 - old.initial_window_size as i32;
        if delta != 0 {
            for stream in self.streams.values_mut() {
                stream.window.adjust(delta)?;
            }
            if delta > 0 {
                self.wake_all();
            }
        }
        Ok(())
    }

    /// Connection-scope fault detected on the writer side: emit GOAWAY,
    /// tear down, stop the task.
    async fn fail_connection(&mut self, proto: ProtoError) -> Result<ControlFlow<()>> {
        let (code, reason) = match proto {
            ProtoError::Connection { code, reason } => (code, reason),
            ProtoError::Stream { code, .. } => (code, String::new()),
        };
        error!("connection failed in writer: {code:?} {reason}");
        let last = self.shared.lock_streams().last_processed_remote;
        self.output
            .write_all(
                &GoAwayFrame::new(last, code)
                    .with_debug(Bytes::from(reason))
                    .serialize(),
            )
            .await?;
        self.output.flush().await?;
        let _ = self.output.shutdown().await;
        self.shared.set_closed(code);
        self.shared.fail_all(code);
        self.shared.closed_notify.notify_waiters();
        Ok(ControlFlow::Break(()))
    }

    fn fail_stream(&self, id: u32, code: ErrorCode) {
        let record = {
            let table = self.shared.lock_streams();
            table.map.get(&id).cloned()
        };
        if let Some(record) = record {
            record.fail(ResetReason::Local(code));
        }
    }

    fn send_stream(&mut self, id: u32) -> &mut SendStream {
        let initial = self.remote.initial_window_size;
        let mut held = 0u32;
        if !self.streams.contains_key(&id) {
            for &(cid, inc) in &self.orphan_credits {
                if cid == id {
                    held = held.saturating_add(inc);
                }
            }
            self.orphan_credits.retain(|&(cid, _)| cid != id);
        }
        let stream = self.streams.entry(id).or_insert_with(|| SendStream {
            window: FlowWindow::new(initial),
            queue: VecDeque::new(),
            in_ready: false,
        });
        if held > 0 {
            let _ = stream.window.grant(held, id);
        }
        stream
    }

    /// Drop the send state once the final frame of a stream went out;
    /// nothing may legally follow END_STREAM.
    fn finish_or_wake(&mut self, id: u32, finished: bool) {
        if finished {
            self.streams.remove(&id);
        } else {
            self.wake(id);
        }
    }

    fn wake(&mut self, id: u32) {
        if let Some(stream) = self.streams.get_mut(&id) {
            if !stream.in_ready && !stream.queue.is_empty() {
                stream.in_ready = true;
                self.ready.push_back(id);
            }
        }
    }

    fn wake_all(&mut self) {
        let ids: Vec<u32> = self.streams.keys().copied().collect();
        for id in ids {
            self.wake(id);
        }
    }

    fn note_reset(&mut self, id: u32) {
        if self.resets.len() >= RESET_MEMORY {
            self.resets.pop_front();
        }
        self.resets.push_back(id);
    }

    fn is_reset(&self, id: u32) -> bool {
        self.resets.contains(&id)
    }
}
