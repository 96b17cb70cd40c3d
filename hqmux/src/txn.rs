//! The transaction interface.
//!
//! The transaction object is the per-request state machine owned by the
//! HTTP layer above this crate; it dispatches to user handlers and enforces
//! message sequencing. The session core only needs the surface below: it
//! feeds ingress events in, asks for egress bytes when the scheduler has
//! budget, and reports delivery and error outcomes.
//!
//! Transactions address the session by stream id; they hold no references
//! into it.

use bytes::Bytes;
use http::HeaderMap;

use crate::error::StreamException;
use crate::message::HttpMessage;
use hqmux_x::StreamId;

/// Body bytes handed back by a transaction when the scheduler offers it
/// write budget.
#[derive(Debug, Default)]
pub struct WriteChunk {
    pub body: Bytes,
    /// The message ends after this chunk (trailers excluded).
    pub eom: bool,
}

/// The per-request/response state object the core hands data to and
/// receives framed output from.
pub trait Transaction {
    // Ingress events.
    fn on_ingress_headers_complete(&mut self, msg: HttpMessage);
    fn on_ingress_body(&mut self, body: Bytes);
    fn on_ingress_trailers(&mut self, trailers: HeaderMap);
    fn on_ingress_eom(&mut self);
    fn on_ingress_timeout(&mut self);
    fn on_error(&mut self, ex: StreamException);
    fn on_goaway(&mut self, code: crate::error::ErrorCode);

    // Egress production.
    /// Offered up to `max_body` bytes of buffer room at bandwidth share
    /// `ratio`; return body bytes to frame now. An empty chunk with
    /// `eom == false` means nothing to send at the moment.
    fn on_write_ready(&mut self, max_body: usize, ratio: f64) -> WriteChunk;

    fn pause_egress(&mut self);
    fn resume_egress(&mut self);

    // Egress state queries.
    fn has_pending_body(&self) -> bool;
    fn is_egress_eom_queued(&self) -> bool;
    fn is_egress_complete(&self) -> bool;
    fn is_egress_paused(&self) -> bool;
    fn is_ingress_started(&self) -> bool;

    // Delivery events.
    fn on_last_egress_header_byte_acked(&mut self);
    fn on_egress_body_bytes_acked(&mut self, body_offset: u64);
    fn on_egress_body_delivery_canceled(&mut self, body_offset: u64);
    fn on_egress_last_byte_acked(&mut self);

    /// Partial-reliability ingress notifications.
    fn on_ingress_body_peek(&mut self, body_offset: u64, data: Bytes);
    fn on_ingress_body_skipped(&mut self, body_offset: u64);
    fn on_ingress_body_rejected(&mut self, body_offset: u64);

    /// Keep the transaction alive across an outstanding delivery callback.
    fn increment_pending_byte_events(&mut self);
    fn decrement_pending_byte_events(&mut self);

    /// Both directions are complete from the transaction's point of view;
    /// the transport may detach once its own buffers drain.
    fn is_complete(&self) -> bool;
}

/// Creates transactions for peer-initiated streams.
pub trait TransactionFactory {
    /// A new transaction for a peer-opened request stream, or a pushed
    /// response stream when `pushed` is set.
    fn new_transaction(&mut self, id: StreamId, pushed: bool) -> Box<dyn Transaction>;
}
