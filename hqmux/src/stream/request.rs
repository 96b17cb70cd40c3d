//! Request-stream transport: per-request glue between a codec, a
//! transaction and a QUIC stream.
//!
//! The transport owns buffered reads and writes, flow-control interaction
//! with the scheduler, and delivery-acknowledgment tracking. A
//! bidirectional stream has one id; a pushed stream may carry only an
//! ingress id.

use bytes::{Buf, Bytes, BytesMut};
use http::HeaderMap;
use std::collections::BTreeSet;
use std::time::Instant;
use tracing::{debug, error, warn};

use crate::codec::{RequestCodec, RequestEvent};
use crate::error::{CodecError, ExceptionDirection, SessionError, StreamException};
use crate::priority::StreamPriority;
use crate::txn::Transaction;
use hqmux_x::{QuicSocket, StreamId};

/// Coalesces the codec's end-of-message with the transport's end-of-stream;
/// the transaction hears about ingress EOM exactly once, after both.
#[derive(Debug, Default)]
pub(crate) struct EomGate {
    codec: bool,
    transport: bool,
    fired: bool,
}

impl EomGate {
    fn arm(&mut self, codec: bool) -> bool {
        if codec {
            self.codec = true;
        } else {
            self.transport = true;
        }
        if self.codec && self.transport && !self.fired {
            self.fired = true;
            true
        } else {
            false
        }
    }

    pub(crate) fn codec_eom_seen(&self) -> bool {
        self.codec
    }
}

/// How a delivery event at a given offset was classified.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum DeliveryKind {
    Headers,
    Body(u64),
    LastByte,
    Unexpected,
}

pub(crate) struct RequestStream {
    ingress_id: Option<StreamId>,
    egress_id: Option<StreamId>,
    pub(crate) codec: Box<dyn RequestCodec>,
    pub(crate) txn: Box<dyn Transaction>,

    pub(crate) read_buf: BytesMut,
    pub(crate) read_eof: bool,
    pub(crate) write_buf: BytesMut,
    pub(crate) pending_eom: bool,
    pub(crate) ingress_error: bool,
    pub(crate) eom_gate: EomGate,
    pub(crate) detached: bool,
    pub(crate) pushed: bool,
    pub(crate) priority: StreamPriority,

    /// Egress stream offset just past the most recently framed headers.
    egress_headers_stream_offset: u64,
    egress_headers_ack_offset: Option<u64>,
    egress_body_ack_offsets: BTreeSet<u64>,
    last_byte_ack_offset: Option<u64>,
    pub(crate) active_delivery_callbacks: u32,

    pub(crate) bytes_written: u64,
    first_header_byte_sent: bool,
    first_body_byte_sent: bool,
    pub(crate) ingress_push_id: Option<u64>,
    pub(crate) created_at: Instant,
}

impl RequestStream {
    pub(crate) fn new_bidirectional(
        id: StreamId,
        codec: Box<dyn RequestCodec>,
        txn: Box<dyn Transaction>,
    ) -> Self {
        Self::new(Some(id), Some(id), codec, txn, false)
    }

    pub(crate) fn new_ingress_push(
        id: StreamId,
        codec: Box<dyn RequestCodec>,
        txn: Box<dyn Transaction>,
    ) -> Self {
        Self::new(Some(id), None, codec, txn, true)
    }

    fn new(
        ingress_id: Option<StreamId>,
        egress_id: Option<StreamId>,
        codec: Box<dyn RequestCodec>,
        txn: Box<dyn Transaction>,
        pushed: bool,
    ) -> Self {
        Self {
            ingress_id,
            egress_id,
            codec,
            txn,
            read_buf: BytesMut::new(),
            read_eof: false,
            write_buf: BytesMut::new(),
            pending_eom: false,
            ingress_error: false,
            eom_gate: EomGate::default(),
            detached: false,
            pushed,
            priority: StreamPriority::default(),
            egress_headers_stream_offset: 0,
            egress_headers_ack_offset: None,
            egress_body_ack_offsets: BTreeSet::new(),
            last_byte_ack_offset: None,
            active_delivery_callbacks: 0,
            bytes_written: 0,
            first_header_byte_sent: false,
            first_body_byte_sent: false,
            ingress_push_id: None,
            created_at: Instant::now(),
        }
    }

    /// The stream's primary id: egress for bidirectional streams, ingress
    /// for ingress-only push streams.
    pub(crate) fn stream_id(&self) -> StreamId {
        self.egress_id
            .or(self.ingress_id)
            .expect("stream transport without any id")
    }

    pub(crate) fn ingress_id(&self) -> Option<StreamId> {
        self.ingress_id
    }

    pub(crate) fn egress_id(&self) -> Option<StreamId> {
        self.egress_id
    }

    pub(crate) fn is_using(&self, id: StreamId) -> bool {
        self.ingress_id == Some(id) || self.egress_id == Some(id)
    }

    /// Egress offset of the next byte this stream would hand the transport,
    /// counting bytes the transport has accepted plus our own write buffer.
    fn stream_write_byte_offset(&self, sock: &dyn QuicSocket) -> u64 {
        let id = match self.egress_id {
            Some(id) => id,
            None => return self.write_buf.len() as u64,
        };
        let committed = sock
            .stream_write_offset(id)
            .unwrap_or(0)
            .saturating_add(sock.stream_write_buffered_bytes(id).unwrap_or(0));
        committed + self.write_buf.len() as u64
    }

    /// Frame headers through the codec and arm the header-delivery
    /// callback one byte before the new egress offset.
    pub(crate) fn send_headers(
        &mut self,
        sock: &mut dyn QuicSocket,
        msg: &crate::message::HttpMessage,
        include_eom: bool,
    ) -> Result<bool, StreamException> {
        debug_assert!(self.egress_id.is_some(), "send_headers on ingress-only stream");
        let old_offset = self.stream_write_byte_offset(sock);
        let framed = self
            .codec
            .generate_header(msg, include_eom)
            .map_err(codec_egress_exception)?;
        self.write_buf.extend_from_slice(&framed);
        let new_offset = self.stream_write_byte_offset(sock);
        self.egress_headers_stream_offset = new_offset;

        if msg.is_response() && new_offset > old_offset && !self.first_header_byte_sent {
            self.first_header_byte_sent = true;
        }

        self.pending_eom = include_eom;

        // Track the last egress header byte so the handler hears about the
        // receiver acking the header section. 1xx responses are interim and
        // are not tracked.
        let final_message = msg.is_request()
            || msg.status().map(|s| s.as_u16() >= 200).unwrap_or(false);
        if new_offset > 0 && final_message {
            self.arm_headers_ack(sock, new_offset - 1)?;
        }

        Ok(self.write_buf.has_remaining() || self.pending_eom)
    }

    /// Append framed body bytes.
    pub(crate) fn send_body(
        &mut self,
        body: Bytes,
        include_eom: bool,
    ) -> Result<bool, StreamException> {
        debug_assert!(self.egress_id.is_some(), "send_body on ingress-only stream");
        let framed = self
            .codec
            .generate_body(body, include_eom)
            .map_err(codec_egress_exception)?;
        if !framed.is_empty() && !self.first_body_byte_sent {
            self.first_body_byte_sent = true;
        }
        self.write_buf.extend_from_slice(&framed);
        if include_eom {
            self.pending_eom = true;
        }
        Ok(true)
    }

    /// Frame trailers (if any) and the framing-layer end of message.
    pub(crate) fn send_eom(
        &mut self,
        trailers: Option<&HeaderMap>,
    ) -> Result<bool, StreamException> {
        debug_assert!(self.egress_id.is_some(), "send_eom on ingress-only stream");
        if let Some(trailers) = trailers {
            let framed = self
                .codec
                .generate_trailers(trailers)
                .map_err(codec_egress_exception)?;
            self.write_buf.extend_from_slice(&framed);
        }
        let framed = self.codec.generate_eom().map_err(codec_egress_exception)?;
        self.write_buf.extend_from_slice(&framed);
        // Even when the codec frames nothing, the transport FIN must go out.
        self.pending_eom = true;
        Ok(true)
    }

    /// Arm a delivery callback for an egress body offset (relative to the
    /// end of headers). Offsets are converted to absolute stream offsets
    /// and tracked for ack routing.
    pub(crate) fn track_egress_body_delivery(
        &mut self,
        sock: &mut dyn QuicSocket,
        body_offset: u64,
    ) -> Result<(), StreamException> {
        let stream_offset = self.egress_headers_stream_offset + body_offset;
        // Delivery fires on the last byte, so track one before the offset.
        self.arm_body_ack(sock, stream_offset - 1)
    }

    fn arm_stream_ack(
        &mut self,
        sock: &mut dyn QuicSocket,
        stream_offset: u64,
    ) -> Result<(), StreamException> {
        let id = self.egress_id.expect("delivery callback without egress");
        if let Err(err) = sock.register_delivery_callback(id, stream_offset) {
            error!(stream = %id, offset = stream_offset, %err,
                "failed to register delivery callback");
            return Err(StreamException::new(
                ExceptionDirection::IngressAndEgress,
                SessionError::Network,
                format!("failed to register delivery callback: {err}"),
            ));
        }
        self.active_delivery_callbacks += 1;
        // Keeps the transaction alive until the transport acks or cancels.
        self.txn.increment_pending_byte_events();
        Ok(())
    }

    fn arm_headers_ack(
        &mut self,
        sock: &mut dyn QuicSocket,
        stream_offset: u64,
    ) -> Result<(), StreamException> {
        self.arm_stream_ack(sock, stream_offset)?;
        self.egress_headers_ack_offset = Some(stream_offset);
        Ok(())
    }

    fn arm_body_ack(
        &mut self,
        sock: &mut dyn QuicSocket,
        stream_offset: u64,
    ) -> Result<(), StreamException> {
        self.arm_stream_ack(sock, stream_offset)?;
        self.egress_body_ack_offsets.insert(stream_offset);
        Ok(())
    }

    /// Arm the last-byte callback after an EOM write was fully accepted.
    pub(crate) fn arm_last_byte_ack(
        &mut self,
        sock: &mut dyn QuicSocket,
    ) -> Result<(), StreamException> {
        let id = self.egress_id.expect("eom write without egress");
        let offset = sock
            .stream_write_offset(id)
            .map_err(|err| {
                StreamException::new(
                    ExceptionDirection::IngressAndEgress,
                    SessionError::Network,
                    format!("write offset unavailable: {err}"),
                )
            })?
            .saturating_sub(1);
        self.arm_stream_ack(sock, offset)?;
        self.last_byte_ack_offset = Some(offset);
        Ok(())
    }

    /// Route a delivery acknowledgment by offset.
    pub(crate) fn on_delivery_ack(&mut self, offset: u64) -> DeliveryKind {
        debug_assert!(self.active_delivery_callbacks > 0);
        self.active_delivery_callbacks = self.active_delivery_callbacks.saturating_sub(1);
        self.txn.decrement_pending_byte_events();

        if self.egress_headers_ack_offset == Some(offset) {
            self.egress_headers_ack_offset = None;
            self.txn.on_last_egress_header_byte_acked();
            return DeliveryKind::Headers;
        }
        if self.egress_body_ack_offsets.remove(&offset) {
            let body_offset = offset - self.egress_headers_stream_offset;
            self.txn.on_egress_body_bytes_acked(body_offset);
            return DeliveryKind::Body(body_offset);
        }
        if self.last_byte_ack_offset == Some(offset) {
            self.last_byte_ack_offset = None;
            self.txn.on_egress_last_byte_acked();
            return DeliveryKind::LastByte;
        }
        error!(offset, "unexpected delivery ack offset");
        DeliveryKind::Unexpected
    }

    /// Route a delivery cancellation by offset.
    pub(crate) fn on_canceled(&mut self, offset: u64) -> DeliveryKind {
        debug_assert!(self.active_delivery_callbacks > 0);
        self.active_delivery_callbacks = self.active_delivery_callbacks.saturating_sub(1);
        self.txn.decrement_pending_byte_events();

        if self.egress_headers_ack_offset == Some(offset) {
            self.egress_headers_ack_offset = None;
            return DeliveryKind::Headers;
        }
        if self.egress_body_ack_offsets.remove(&offset) {
            let body_offset = offset - self.egress_headers_stream_offset;
            self.txn.on_egress_body_delivery_canceled(body_offset);
            return DeliveryKind::Body(body_offset);
        }
        if self.last_byte_ack_offset == Some(offset) {
            self.last_byte_ack_offset = None;
            return DeliveryKind::LastByte;
        }
        warn!(offset, "unexpected delivery cancel offset");
        DeliveryKind::Unexpected
    }

    /// Feed the accumulated read buffer to the codec until it blocks,
    /// consumes everything, or errors.
    ///
    /// Returns the parsed events and whether unconsumed bytes remain.
    pub(crate) fn process_read_data(
        &mut self,
    ) -> Result<(Vec<RequestEvent>, bool), CodecError> {
        let mut events = Vec::new();
        if self.eom_gate.codec_eom_seen() && !self.read_buf.is_empty() {
            debug!(len = self.read_buf.len(), "data after message end");
            return Err(CodecError::stream(
                crate::error::ErrorCode::MessageError,
                "unexpected data after request",
            ));
        }
        while !self.ingress_error && !self.read_buf.is_empty() {
            let before = self.read_buf.len();
            let mut parsed = self.codec.on_ingress(&mut self.read_buf)?;
            let consumed = before - self.read_buf.len();
            let produced = !parsed.is_empty();
            events.append(&mut parsed);
            if consumed == 0 && !produced {
                break;
            }
        }
        Ok((events, !self.read_buf.is_empty()))
    }

    /// Codec EOM observed; fire the gate if transport EOM already arrived.
    pub(crate) fn on_codec_eom(&mut self) {
        if self.eom_gate.arm(true) {
            self.txn.on_ingress_eom();
        }
    }

    /// Transport FIN fully parsed; fire the gate if the codec finished too.
    pub(crate) fn on_ingress_eof(&mut self) {
        if self.eom_gate.arm(false) {
            self.txn.on_ingress_eom();
        }
    }

    /// Whether the transaction should be offered buffer room this pass.
    ///
    /// Wanted when the stream is enqueued and either flow control has room
    /// beyond what is buffered and the transaction has body, or all body is
    /// out and only the EOM remains queued.
    pub(crate) fn wants_on_write_ready(&self, can_send: u64, enqueued: bool) -> bool {
        enqueued
            && ((can_send > self.write_buf.len() as u64 && self.txn.has_pending_body())
                || (!self.txn.has_pending_body() && self.txn.is_egress_eom_queued()))
    }

    pub(crate) fn has_pending_body(&self, enqueued: bool) -> bool {
        !self.write_buf.is_empty() || (enqueued && self.txn.has_pending_body())
    }

    pub(crate) fn has_pending_eom(&self, enqueued: bool) -> bool {
        self.pending_eom || (enqueued && self.txn.is_egress_eom_queued())
    }

    pub(crate) fn has_pending_egress(&self, enqueued: bool) -> bool {
        !self.write_buf.is_empty() || self.pending_eom || enqueued
    }

    /// Forget all outstanding delivery callbacks. Used when the socket is
    /// closed underneath the stream and no ack or cancel will ever fire.
    pub(crate) fn cancel_delivery_callbacks(&mut self) {
        while self.active_delivery_callbacks > 0 {
            self.active_delivery_callbacks -= 1;
            self.txn.decrement_pending_byte_events();
        }
        self.egress_headers_ack_offset = None;
        self.egress_body_ack_offsets.clear();
        self.last_byte_ack_offset = None;
    }

    /// Discard buffered ingress and stop feeding the codec.
    pub(crate) fn abort_ingress(&mut self) {
        debug!(stream = %self.stream_id(), "aborting ingress");
        self.ingress_error = true;
        self.read_buf.clear();
    }

    /// Discard buffered egress.
    pub(crate) fn abort_egress(&mut self) {
        debug!(stream = %self.stream_id(), "aborting egress");
        self.write_buf.clear();
        self.pending_eom = false;
    }

    /// Deliver an exception to the transaction and abort the named halves.
    pub(crate) fn error_on_transaction(&mut self, ex: StreamException) {
        let direction = ex.direction;
        if !self.detached {
            self.txn.on_error(ex);
        }
        if direction.is_ingress() {
            self.abort_ingress();
        }
        if direction.is_egress() {
            self.abort_egress();
        }
    }

    /// Detach eligibility. `enqueued` is the priority queue's view.
    pub(crate) fn is_detach_ready(&self, enqueued: bool) -> bool {
        (self.detached || self.txn.is_complete())
            && self.read_buf.is_empty()
            && self.write_buf.is_empty()
            && !self.pending_eom
            && !enqueued
            && self.active_delivery_callbacks == 0
    }
}

fn codec_egress_exception(err: CodecError) -> StreamException {
    StreamException::new(
        ExceptionDirection::IngressAndEgress,
        SessionError::Write,
        format!("egress framing failed: {err}"),
    )
    .with_code(err.code)
}
