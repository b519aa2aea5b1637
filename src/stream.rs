//! Per-stream state machine and the indexed stream table.

use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::error::{Error, Result};
use crate::frame::StreamStatus;
use crate::response::{PushedResponse, Response};

/// Where a finished stream delivers its accumulated response.
pub(crate) enum Delivery {
    /// Locally-initiated stream backing one queued request.
    Local {
        op_id: u64,
        response_tx: Option<oneshot::Sender<Result<Response>>>,
    },
    /// Server-pushed stream; completed pushes go to the session's push
    /// channel.
    Pushed {
        associated_stream_id: u32,
        push_tx: mpsc::UnboundedSender<PushedResponse>,
    },
}

/// One logical channel within the session.
///
/// Lifecycle: IDLE (id unassigned for local streams) → OPEN →
/// HALF_CLOSED_{LOCAL,REMOTE} → CLOSED, tracked as two half-closed flags.
/// A stream sits in the table iff it is neither fully closed nor reset.
pub(crate) struct Stream {
    id: u32,
    local: bool,
    priority: u8,
    send_window: i32,
    receive_window: i32,
    closed_local: bool,
    closed_remote: bool,
    received_reply: bool,
    delivery: Delivery,
    /// SPDY request headers, taken when the stream is opened on the wire.
    request_headers: Vec<(String, String)>,
    /// Outbound body not yet cleared by flow control.
    pending_body: Bytes,
    pending_offset: usize,
    /// Accumulated reply headers and body.
    headers: Vec<(String, String)>,
    header_size: usize,
    max_header_size: usize,
    body: BytesMut,
}

impl Stream {
    /// A locally-initiated stream; remains IDLE until `open` assigns an id.
    pub(crate) fn local(
        op_id: u64,
        priority: u8,
        request_headers: Vec<(String, String)>,
        body: Bytes,
        response_tx: oneshot::Sender<Result<Response>>,
        max_header_size: usize,
    ) -> Self {
        Self {
            id: 0,
            local: true,
            priority,
            send_window: 0,
            receive_window: 0,
            closed_local: false,
            closed_remote: false,
            received_reply: false,
            delivery: Delivery::Local {
                op_id,
                response_tx: Some(response_tx),
            },
            request_headers,
            pending_body: body,
            pending_offset: 0,
            headers: Vec::new(),
            header_size: 0,
            max_header_size,
            body: BytesMut::new(),
        }
    }

    /// A server-pushed stream. Unidirectional pushes begin half-closed
    /// locally.
    pub(crate) fn pushed(
        priority: u8,
        associated_stream_id: u32,
        unidirectional: bool,
        push_tx: mpsc::UnboundedSender<PushedResponse>,
        max_header_size: usize,
    ) -> Self {
        Self {
            id: 0,
            local: false,
            priority,
            send_window: 0,
            receive_window: 0,
            closed_local: unidirectional,
            closed_remote: false,
            received_reply: false,
            delivery: Delivery::Pushed {
                associated_stream_id,
                push_tx,
            },
            request_headers: Vec::new(),
            pending_body: Bytes::new(),
            pending_offset: 0,
            headers: Vec::new(),
            header_size: 0,
            max_header_size,
            body: BytesMut::new(),
        }
    }

    /// Assign the wire id and flow-control windows; IDLE → OPEN.
    pub(crate) fn open(&mut self, id: u32, initial_send_window: i32, initial_receive_window: i32) {
        self.id = id;
        self.send_window = initial_send_window;
        self.receive_window = initial_receive_window;
    }

    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    pub(crate) fn is_local(&self) -> bool {
        self.local
    }

    pub(crate) fn priority(&self) -> u8 {
        self.priority
    }

    pub(crate) fn op_id(&self) -> Option<u64> {
        match &self.delivery {
            Delivery::Local { op_id, .. } => Some(*op_id),
            Delivery::Pushed { .. } => None,
        }
    }

    pub(crate) fn has_received_reply(&self) -> bool {
        self.received_reply
    }

    /// Records the reply. A second reply on the same stream is an error.
    pub(crate) fn on_reply(&mut self) -> std::result::Result<(), StreamStatus> {
        if self.received_reply {
            return Err(StreamStatus::StreamInUse);
        }
        self.received_reply = true;
        Ok(())
    }

    /// Accumulate one decompressed header pair, bounded by the configured
    /// maximum.
    pub(crate) fn on_header(
        &mut self,
        name: String,
        value: String,
    ) -> std::result::Result<(), StreamStatus> {
        self.header_size += name.len() + value.len();
        if self.header_size > self.max_header_size {
            return Err(StreamStatus::ProtocolError);
        }
        self.headers.push((name, value));
        Ok(())
    }

    pub(crate) fn on_data(&mut self, payload: &[u8]) {
        self.body.extend_from_slice(payload);
    }

    pub(crate) fn close_locally(&mut self) {
        self.closed_local = true;
    }

    pub(crate) fn close_remotely(&mut self) {
        self.closed_remote = true;
    }

    pub(crate) fn is_closed_locally(&self) -> bool {
        self.closed_local
    }

    pub(crate) fn is_closed_remotely(&self) -> bool {
        self.closed_remote
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed_local && self.closed_remote
    }

    pub(crate) fn send_window(&self) -> i32 {
        self.send_window
    }

    pub(crate) fn receive_window(&self) -> i32 {
        self.receive_window
    }

    pub(crate) fn reduce_receive_window(&mut self, n: i32) {
        self.receive_window -= n;
    }

    pub(crate) fn increase_receive_window(&mut self, n: i32) {
        self.receive_window += n;
    }

    pub(crate) fn increase_send_window(&mut self, n: i32) {
        self.send_window = self.send_window.saturating_add(n);
    }

    pub(crate) fn debit_send_window(&mut self, n: i32) {
        self.send_window -= n;
    }

    pub(crate) fn take_request_headers(&mut self) -> Vec<(String, String)> {
        std::mem::take(&mut self.request_headers)
    }

    pub(crate) fn has_pending_data(&self) -> bool {
        self.pending_offset < self.pending_body.len()
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.pending_body.len() - self.pending_offset
    }

    /// Slice off the next outbound chunk of at most `max` bytes.
    pub(crate) fn take_chunk(&mut self, max: usize) -> Bytes {
        let n = max.min(self.pending_len());
        let chunk = self
            .pending_body
            .slice(self.pending_offset..self.pending_offset + n);
        self.pending_offset += n;
        chunk
    }

    /// Terminal success: deliver the accumulated response.
    pub(crate) fn complete(&mut self) {
        let headers = std::mem::take(&mut self.headers);
        let body = std::mem::take(&mut self.body).freeze();
        let response = Response::new(headers, body);
        match &mut self.delivery {
            Delivery::Local { response_tx, .. } => {
                if let Some(tx) = response_tx.take() {
                    if tx.send(Ok(response)).is_err() {
                        debug!(stream = self.id, "response receiver dropped");
                    }
                }
            }
            Delivery::Pushed {
                associated_stream_id,
                push_tx,
            } => {
                let pushed = PushedResponse {
                    stream_id: self.id,
                    associated_stream_id: *associated_stream_id,
                    response,
                };
                if push_tx.send(pushed).is_err() {
                    debug!(stream = self.id, "push receiver dropped, discarding");
                }
            }
        }
    }

    /// Terminal failure: notify the associated operation.
    pub(crate) fn close(&mut self, error: Error) {
        match &mut self.delivery {
            Delivery::Local { response_tx, .. } => {
                if let Some(tx) = response_tx.take() {
                    if tx.send(Err(error)).is_err() {
                        debug!(stream = self.id, "response receiver dropped");
                    }
                }
            }
            Delivery::Pushed { .. } => {
                debug!(stream = self.id, %error, "pushed stream terminated");
            }
        }
    }
}

/// Indexed collection of active streams with separate local/remote counts.
///
/// Keyed by stream id; iteration is in ascending id order, which the
/// session relies on for fair window distribution. Mid-iteration removal
/// is done against an id snapshot.
#[derive(Default)]
pub(crate) struct StreamTable {
    streams: std::collections::BTreeMap<u32, Stream>,
    local_count: usize,
    remote_count: usize,
}

impl StreamTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn get(&self, id: u32) -> Option<&Stream> {
        self.streams.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: u32) -> Option<&mut Stream> {
        self.streams.get_mut(&id)
    }

    pub(crate) fn add(&mut self, stream: Stream) {
        if stream.is_local() {
            self.local_count += 1;
        } else {
            self.remote_count += 1;
        }
        let previous = self.streams.insert(stream.id(), stream);
        debug_assert!(previous.is_none(), "stream id reused");
    }

    pub(crate) fn remove(&mut self, id: u32) -> Option<Stream> {
        let stream = self.streams.remove(&id)?;
        if stream.is_local() {
            self.local_count -= 1;
        } else {
            self.remote_count -= 1;
        }
        Some(stream)
    }

    pub(crate) fn local_size(&self) -> usize {
        self.local_count
    }

    pub(crate) fn remote_size(&self) -> usize {
        self.remote_count
    }

    pub(crate) fn size(&self) -> usize {
        self.streams.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Stream ids in ascending order; safe to remove entries while walking
    /// the snapshot.
    pub(crate) fn ids(&self) -> Vec<u32> {
        self.streams.keys().copied().collect()
    }

    pub(crate) fn find_by_op(&self, op_id: u64) -> Option<u32> {
        self.streams
            .values()
            .find(|s| s.op_id() == Some(op_id))
            .map(|s| s.id())
    }
}
