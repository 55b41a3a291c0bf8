//! Stream lifecycle and the per-stream application API.
//!
//! [`StreamState`] is the RFC 7540 section 5.1 machine. [`StreamRecord`]
//! is the shared runtime state a stream carries between the reader task,
//! the writer task and the application handle. [`StreamHandle`] is the
//! application surface: leading headers, data, trailers, cancel.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::{Buf, Bytes};
use tokio::sync::{Notify, Semaphore};

use crate::connection::ConnShared;
use crate::error::{Error, Result};
use crate::flow::FlowWindow;
use crate::frame::ErrorCode;
use crate::headers::{self, HeaderField};
use crate::writer::WorkCmd;

/// Largest DATA payload submitted to the writer in one piece.
pub(crate) const DATA_CHUNK: usize = 16_384;

/// Per-stream cap on bytes queued toward the writer; `write_data` suspends
/// beyond this until the writer drains.
pub(crate) const SEND_CAPACITY: usize = 65_535;

/// RFC 7540 section 5.1 stream states.
///
/// The reserved states exist for completeness; this engine never enters
/// them because it does not emit PUSH_PROMISE and refuses received ones
/// before reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    ReservedLocal,
    ReservedRemote,
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
}

impl StreamState {
    /// Local endpoint sends its leading HEADERS on an idle stream.
    pub fn open_local(end_stream: bool) -> Self {
        if end_stream {
            Self::HalfClosedLocal
        } else {
            Self::Open
        }
    }

    /// Remote endpoint opens a stream with its leading HEADERS.
    pub fn open_remote(end_stream: bool) -> Self {
        if end_stream {
            Self::HalfClosedRemote
        } else {
            Self::Open
        }
    }

    /// Transition after we send END_STREAM.
    pub fn on_send_end_stream(self) -> Self {
        match self {
            Self::Open => Self::HalfClosedLocal,
            Self::HalfClosedRemote => Self::Closed,
            other => other,
        }
    }

    /// Transition after the peer's END_STREAM arrives.
    pub fn on_recv_end_stream(self) -> Self {
        match self {
            Self::Open => Self::HalfClosedRemote,
            Self::HalfClosedLocal => Self::Closed,
            other => other,
        }
    }

    /// Whether the peer is still allowed to send DATA/trailers.
    pub fn peer_may_send(self) -> bool {
        matches!(self, Self::Open | Self::HalfClosedLocal)
    }

    pub fn is_closed(self) -> bool {
        self == Self::Closed
    }
}

/// Why a stream stopped early.
#[derive(Debug, Clone, Copy)]
pub(crate) enum ResetReason {
    /// We reset it (cancel, validation failure, listener refusal).
    Local(ErrorCode),
    /// The peer sent RST_STREAM.
    Remote(ErrorCode),
    /// The connection went away underneath the stream.
    Connection(ErrorCode),
}

impl ResetReason {
    pub(crate) fn to_error(self, id: u32) -> Error {
        match self {
            Self::Local(code) | Self::Remote(code) => Error::reset(id, code),
            Self::Connection(code) => Error::closed(code),
        }
    }
}

/// Shared per-stream runtime state.
pub(crate) struct StreamRecord {
    pub(crate) id: u32,
    pub(crate) inner: Mutex<StreamInner>,
    /// Wakes pending reads on data/headers/end-of-stream/reset.
    pub(crate) readable: Notify,
    /// Byte permits bounding data queued toward the writer.
    pub(crate) send_capacity: Semaphore,
    /// Receive window size we maintain for this stream.
    pub(crate) recv_target: u32,
}

pub(crate) struct StreamInner {
    pub(crate) state: StreamState,
    /// The peer's leading header list has been received (even if the
    /// application already took it).
    pub(crate) recv_headers: bool,
    pub(crate) headers: Option<Vec<HeaderField>>,
    pub(crate) trailers: Option<Vec<HeaderField>>,
    pub(crate) recv_buf: VecDeque<Bytes>,
    pub(crate) recv_window: FlowWindow,
    /// Consumed-but-uncredited octets awaiting a WINDOW_UPDATE.
    pub(crate) unacked: u32,
    pub(crate) remote_end: bool,
    pub(crate) reset: Option<ResetReason>,
    pub(crate) sent_headers: bool,
    pub(crate) sent_end: bool,
}

impl StreamRecord {
    pub(crate) fn new(id: u32, state: StreamState, recv_target: u32) -> Arc<Self> {
        Arc::new(Self {
            id,
            inner: Mutex::new(StreamInner {
                state,
                recv_headers: false,
                headers: None,
                trailers: None,
                recv_buf: VecDeque::new(),
                recv_window: FlowWindow::new(recv_target),
                unacked: 0,
                remote_end: false,
                reset: None,
                sent_headers: false,
                sent_end: false,
            }),
            readable: Notify::new(),
            send_capacity: Semaphore::new(SEND_CAPACITY),
            recv_target,
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, StreamInner> {
        self.inner.lock().expect("stream state poisoned")
    }

    /// Terminate the stream with `reason`, waking pending operations.
    /// A stream that already finished cleanly is left alone.
    pub(crate) fn fail(&self, reason: ResetReason) {
        {
            let mut inner = self.lock();
            let finished = inner.state.is_closed() && inner.reset.is_none();
            if inner.reset.is_some() || finished {
                return;
            }
            inner.reset = Some(reason);
            inner.state = StreamState::Closed;
        }
        self.send_capacity.close();
        self.readable.notify_waiters();
    }
}

/// Account `n` freshly consumed octets against the stream's receive
/// window, emitting a WINDOW_UPDATE once half the window is unacked.
pub(crate) fn credit_stream(record: &StreamRecord, conn: &ConnShared, n: u32) {
    if n == 0 {
        return;
    }
    let mut inner = record.lock();
    inner.unacked += n;
    let threshold = (record.recv_target / 2).max(1);
    if inner.unacked >= threshold {
        let increment = inner.unacked;
        inner.unacked = 0;
        // Re-crediting what we consumed cannot overflow the window.
        let _ = inner.recv_window.grant(increment, record.id);
        drop(inner);
        conn.send_window_update(record.id, increment);
    }
}

/// Application handle for one stream.
///
/// Reads surface protocol order: leading header list, zero or more data
/// chunks, optional trailers, end-of-stream. Writes must start with
/// [`write_headers`]. Dropping the handle cancels the stream with CANCEL
/// unless it already terminated.
///
/// [`write_headers`]: StreamHandle::write_headers
pub struct StreamHandle {
    pub(crate) id: u32,
    pub(crate) record: Arc<StreamRecord>,
    pub(crate) conn: Arc<ConnShared>,
    pub(crate) remote_initiated: bool,
}

impl StreamHandle {
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Await the peer's leading header list.
    pub async fn read_headers(&self) -> Result<Vec<HeaderField>> {
        loop {
            let notified = self.record.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut inner = self.record.lock();
                if let Some(fields) = inner.headers.take() {
                    return Ok(fields);
                }
                if let Some(reset) = inner.reset {
                    return Err(reset.to_error(self.id));
                }
                if inner.remote_end {
                    return Err(Error::InvalidUsage("stream ended without headers"));
                }
            }
            notified.await;
        }
    }

    /// Read body data into `buf`. Returns 0 once the peer half-closed
    /// cleanly and all buffered data was consumed.
    pub async fn read_data(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            let notified = self.record.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut inner = self.record.lock();
                if let Some(reset) = inner.reset {
                    return Err(reset.to_error(self.id));
                }
                if let Some(chunk) = inner.recv_buf.front_mut() {
                    let n = buf.len().min(chunk.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    if n == chunk.len() {
                        inner.recv_buf.pop_front();
                    } else {
                        chunk.advance(n);
                    }
                    drop(inner);
                    credit_stream(&self.record, &self.conn, n as u32);
                    self.conn.credit_connection(n as u32);
                    return Ok(n);
                }
                if inner.remote_end {
                    return Ok(0);
                }
            }
            notified.await;
        }
    }

    /// Take the trailing header list. Legal only after end-of-stream has
    /// been observed via [`read_data`] returning 0.
    ///
    /// [`read_data`]: StreamHandle::read_data
    pub fn read_trailers(&self) -> Result<Option<Vec<HeaderField>>> {
        let mut inner = self.record.lock();
        if let Some(reset) = inner.reset {
            return Err(reset.to_error(self.id));
        }
        if !inner.remote_end || !inner.recv_buf.is_empty() {
            return Err(Error::InvalidUsage(
                "trailers read before end of stream",
            ));
        }
        Ok(inner.trailers.take())
    }

    /// Send the leading header list. Mandatory first write on a stream.
    pub async fn write_headers(
        &self,
        fields: Vec<HeaderField>,
        end_stream: bool,
    ) -> Result<()> {
        self.check_open()?;
        // Reject before framing: a malformed list never reaches the wire.
        let check = if self.remote_initiated {
            headers::validate_response(&fields)
        } else {
            headers::validate_request(&fields)
        };
        check.map_err(|e| Error::MalformedHeader(e.0.to_string()))?;

        {
            let mut inner = self.record.lock();
            if let Some(reset) = inner.reset {
                return Err(reset.to_error(self.id));
            }
            if inner.sent_headers {
                return Err(Error::InvalidUsage("headers already sent"));
            }
            inner.sent_headers = true;
            if inner.state == StreamState::Idle {
                inner.state = StreamState::open_local(end_stream);
            } else if end_stream {
                inner.state = inner.state.on_send_end_stream();
            }
            inner.sent_end = end_stream;
        }

        self.send_work(WorkCmd::Headers {
            id: self.id,
            fields,
            end_stream,
        })
        .await?;
        self.retire_if_done();
        Ok(())
    }

    /// Send body data. Suspends while the writer-side budget is exhausted
    /// and resumes as the writer drains (ultimately on WINDOW_UPDATE).
    pub async fn write_data(&self, buf: &[u8], end_stream: bool) -> Result<()> {
        self.check_open()?;
        {
            let inner = self.record.lock();
            if let Some(reset) = inner.reset {
                return Err(reset.to_error(self.id));
            }
            if !inner.sent_headers {
                return Err(Error::InvalidUsage("data before headers"));
            }
            if inner.sent_end {
                return Err(Error::InvalidUsage("data after end of stream"));
            }
        }

        if buf.is_empty() {
            // A zero-length DATA frame is only worth sending for its
            // END_STREAM flag.
            if end_stream {
                self.send_work(WorkCmd::Data {
                    id: self.id,
                    chunk: Bytes::new(),
                    end_stream: true,
                })
                .await?;
                self.mark_sent_end();
            }
            return Ok(());
        }

        let last_index = (buf.len() - 1) / DATA_CHUNK;
        for (index, chunk) in buf.chunks(DATA_CHUNK).enumerate() {
            let permit = self
                .record
                .send_capacity
                .acquire_many(chunk.len() as u32)
                .await;
            match permit {
                Ok(permit) => permit.forget(),
                // Semaphore closed: the stream was reset mid-write.
                Err(_) => return Err(self.terminal_error()),
            }
            self.send_work(WorkCmd::Data {
                id: self.id,
                chunk: Bytes::copy_from_slice(chunk),
                end_stream: end_stream && index == last_index,
            })
            .await?;
        }

        if end_stream {
            self.mark_sent_end();
        }
        Ok(())
    }

    /// Send a trailing header list, implying end-of-stream. Legal only
    /// after the leading headers went out without END_STREAM.
    pub async fn write_trailers(&self, fields: Vec<HeaderField>) -> Result<()> {
        self.check_open()?;
        headers::validate_trailers(&fields)
            .map_err(|e| Error::MalformedHeader(e.0.to_string()))?;
        {
            let inner = self.record.lock();
            if let Some(reset) = inner.reset {
                return Err(reset.to_error(self.id));
            }
            if !inner.sent_headers {
                return Err(Error::InvalidUsage("trailers before headers"));
            }
            if inner.sent_end {
                return Err(Error::InvalidUsage("trailers after end of stream"));
            }
        }

        self.send_work(WorkCmd::Trailers {
            id: self.id,
            fields,
        })
        .await?;
        self.mark_sent_end();
        Ok(())
    }

    /// Reset the stream with `code`. Idempotent; a no-op once the stream
    /// already terminated.
    pub fn cancel(&self, code: ErrorCode) {
        let should_reset = {
            let mut inner = self.record.lock();
            if inner.reset.is_some() || inner.state.is_closed() {
                false
            } else {
                inner.reset = Some(ResetReason::Local(code));
                inner.state = StreamState::Closed;
                true
            }
        };
        if should_reset {
            self.record.send_capacity.close();
            self.record.readable.notify_waiters();
            self.conn.send_rst(self.id, code);
            self.conn.retire_stream(self.id, self.remote_initiated);
        }
    }

    fn check_open(&self) -> Result<()> {
        if let Some(code) = self.conn.closed_code() {
            return Err(Error::closed(code));
        }
        Ok(())
    }

    /// The error a terminated stream owes its caller.
    fn terminal_error(&self) -> Error {
        let inner = self.record.lock();
        match inner.reset {
            Some(reset) => reset.to_error(self.id),
            None => Error::closed(
                self.conn.closed_code().unwrap_or(ErrorCode::InternalError),
            ),
        }
    }

    async fn send_work(&self, cmd: WorkCmd) -> Result<()> {
        self.conn
            .work_tx
            .send(cmd)
            .await
            .map_err(|_| self.terminal_error())
    }

    fn mark_sent_end(&self) {
        {
            let mut inner = self.record.lock();
            inner.sent_end = true;
            inner.state = inner.state.on_send_end_stream();
        }
        self.retire_if_done();
    }

    /// Drop the table entry once both directions have finished cleanly.
    fn retire_if_done(&self) {
        let done = {
            let inner = self.record.lock();
            inner.state.is_closed() && inner.reset.is_none()
        };
        if done {
            self.conn.retire_stream(self.id, self.remote_initiated);
        }
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.cancel(ErrorCode::Cancel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_transitions() {
        assert_eq!(StreamState::open_local(false), StreamState::Open);
        assert_eq!(StreamState::open_local(true), StreamState::HalfClosedLocal);
        assert_eq!(StreamState::open_remote(false), StreamState::Open);
        assert_eq!(
            StreamState::open_remote(true),
            StreamState::HalfClosedRemote
        );
    }

    #[test]
    fn end_stream_in_both_directions_closes() {
        let state = StreamState::Open;
        let state = state.on_recv_end_stream();
        assert_eq!(state, StreamState::HalfClosedRemote);
        let state = state.on_send_end_stream();
        assert_eq!(state, StreamState::Closed);

        let state = StreamState::Open.on_send_end_stream();
        assert_eq!(state, StreamState::HalfClosedLocal);
        assert_eq!(state.on_recv_end_stream(), StreamState::Closed);
    }

    #[test]
    fn closed_is_terminal() {
        let closed = StreamState::Closed;
        assert_eq!(closed.on_send_end_stream(), StreamState::Closed);
        assert_eq!(closed.on_recv_end_stream(), StreamState::Closed);
    }

    #[test]
    fn peer_may_send_only_while_remote_open() {
        assert!(StreamState::Open.peer_may_send());
        assert!(StreamState::HalfClosedLocal.peer_may_send());
        assert!(!StreamState::HalfClosedRemote.peer_may_send());
        assert!(!StreamState::Closed.peer_may_send());
        assert!(!StreamState::Idle.peer_may_send());
    }

    #[test]
    fn fail_is_sticky_but_skips_clean_completion() {
        let record = StreamRecord::new(1, StreamState::Open, 65_535);
        record.fail(ResetReason::Remote(ErrorCode::Cancel));
        record.fail(ResetReason::Connection(ErrorCode::ProtocolError));
        let inner = record.lock();
        assert!(matches!(
            inner.reset,
            Some(ResetReason::Remote(ErrorCode::Cancel))
        ));
        drop(inner);

        let clean = StreamRecord::new(3, StreamState::Closed, 65_535);
        clean.fail(ResetReason::Connection(ErrorCode::ProtocolError));
        assert!(clean.lock().reset.is_none());
    }
}
