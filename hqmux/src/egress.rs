//! Egress scheduler: per-loop draining of control and request streams
//! under the connection egress budget.
//!
//! Control streams are written first, in registry order; whatever budget
//! remains is offered to request streams in the priority queue's order,
//! each capped by its stream flow-control window. Backpressured bytes are
//! re-prepended to the stream's write buffer and the stream stays
//! enqueued for the next writeability callback.

use bytes::{Bytes, BytesMut};
use tracing::{debug, error};

use crate::error::SessionError;
use crate::session::Session;
use crate::stream_type::UniStreamType;
use hqmux_x::StreamId;

/// Put bytes the transport refused back at the head of a write buffer.
fn reprepend(buf: &mut BytesMut, head: Bytes) {
    if head.is_empty() {
        return;
    }
    let mut joined = BytesMut::with_capacity(head.len() + buf.len());
    joined.extend_from_slice(&head);
    joined.extend_from_slice(buf);
    *buf = joined;
}

impl Session {
    /// Write all non-empty control streams, in registry order, within
    /// `max_egress`. Returns the bytes written.
    pub(crate) fn write_control_streams(&mut self, max_egress: u64) -> u64 {
        let mut remaining = max_egress;
        let types: Vec<UniStreamType> = self.registry.control.keys().copied().collect();
        for stream_type in types {
            if remaining == 0 {
                break;
            }
            let empty = self
                .registry
                .find_control(stream_type)
                .map(|ctrl| ctrl.write_buf.is_empty())
                .unwrap_or(true);
            if empty {
                continue;
            }
            let sent = self.control_stream_write_impl(stream_type, remaining);
            debug_assert!(sent <= remaining);
            remaining -= sent;
        }
        max_egress - remaining
    }

    fn control_stream_write_impl(&mut self, stream_type: UniStreamType, max_egress: u64) -> u64 {
        let Some(ctrl) = self.registry.find_control(stream_type) else {
            return 0;
        };
        let egress_id = ctrl.egress_id;

        let flow = match self.sock.as_deref() {
            Some(sock) => sock.stream_flow_control(egress_id),
            None => return 0,
        };
        let window = match flow {
            Ok(flow) => flow.send_window_available,
            Err(err) => {
                error!(stream = %egress_id, %err, "flow control error on control stream");
                let kind = SessionError::from_quic(&err);
                self.handle_control_egress_error(stream_type, err, kind);
                return 0;
            }
        };

        let can_send = window.min(max_egress);
        let Some(ctrl) = self.registry.find_control_mut(stream_type) else {
            return 0;
        };
        let send_len = can_send.min(ctrl.write_buf.len() as u64);
        if send_len == 0 {
            return 0;
        }
        let chunk = ctrl.write_buf.split_to(send_len as usize).freeze();
        debug!(stream = %egress_id, try_to_send = send_len, window, "control stream write");

        let result = match self.sock.as_deref_mut() {
            Some(sock) => sock.write_chain(egress_id, chunk, false),
            None => return 0,
        };
        match result {
            Ok(leftover) => {
                let sent = send_len - leftover.len() as u64;
                if !leftover.is_empty() {
                    if let Some(ctrl) = self.registry.find_control_mut(stream_type) {
                        reprepend(&mut ctrl.write_buf, leftover);
                    }
                }
                sent
            }
            Err(err) => {
                // A write error on a control stream is fatal no matter
                // what the underlying reason was.
                self.handle_control_egress_error(stream_type, err, SessionError::Write);
                0
            }
        }
    }

    /// Offer the budget to the priority queue's next batch of request
    /// streams. Returns the remaining budget.
    pub(crate) fn write_request_streams(&mut self, max_egress: u64) -> u64 {
        let mut remaining = max_egress;
        let batch = self.queue.next_egress();
        let count = batch.len();
        for (index, (id, ratio)) in batch.into_iter().enumerate() {
            let sent = self.request_stream_write_impl(id, remaining, ratio);
            debug_assert!(sent <= remaining);
            remaining -= sent;
            if remaining == 0 {
                if index + 1 < count {
                    debug!("more to send than the transport could take");
                }
                break;
            }
        }
        remaining
    }

    /// One scheduler pass over a single request stream.
    fn request_stream_write_impl(&mut self, id: StreamId, max_egress: u64, ratio: f64) -> u64 {
        let Some(stream) = self.registry.streams.get_mut(&id) else {
            return 0;
        };
        let Some(egress_id) = stream.egress_id() else {
            return 0;
        };
        let flow = match self.sock.as_deref() {
            Some(sock) => sock.stream_flow_control(egress_id),
            None => return 0,
        };
        let window = match flow {
            Ok(flow) => flow.send_window_available,
            Err(err) => {
                error!(stream = %egress_id, %err, "flow control error on request stream");
                self.handle_write_error(id, err);
                return 0;
            }
        };
        let can_send = window.min(max_egress);

        // Top the write buffer up from the transaction when there is room
        // beyond what is already buffered (or only the EOM remains).
        let enqueued = self.queue.is_enqueued(id);
        let Some(stream) = self.registry.streams.get_mut(&id) else {
            return 0;
        };
        if stream.wants_on_write_ready(can_send, enqueued) {
            let max_body = (can_send as usize).saturating_sub(stream.write_buf.len());
            debug!(stream = %id, can_send, max_body, ratio, "asking transaction for bytes");
            let chunk = stream.txn.on_write_ready(max_body, ratio);
            if !chunk.body.is_empty() || chunk.eom {
                if let Err(ex) = stream.send_body(chunk.body, chunk.eom) {
                    self.error_on_transaction_id(id, ex);
                    return 0;
                }
            }
            let Some(stream) = self.registry.streams.get_mut(&id) else {
                return 0;
            };
            if stream.write_buf.is_empty() && !stream.pending_eom {
                // Rate limited: nothing materialized this pass.
                self.queue.clear_pending_egress(id);
                return 0;
            }
        }

        let Some(stream) = self.registry.streams.get_mut(&id) else {
            return 0;
        };
        let send_len = can_send.min(stream.write_buf.len() as u64);
        let chunk = stream.write_buf.split_to(send_len as usize).freeze();
        let send_eof = stream.pending_eom && !stream.has_pending_body(enqueued);
        if send_len == 0 && !send_eof {
            // Window exhausted before anything could move.
            return 0;
        }
        debug!(stream = %id, try_to_send = send_len, window, send_eof, "request stream write");

        let result = match self.sock.as_deref_mut() {
            Some(sock) => sock.write_chain(egress_id, chunk, send_eof),
            None => return 0,
        };
        let sent = match result {
            Ok(leftover) => {
                let sent = send_len - leftover.len() as u64;
                let full_write = leftover.is_empty();
                let Some(stream) = self.registry.streams.get_mut(&id) else {
                    return sent;
                };
                reprepend(&mut stream.write_buf, leftover);
                if full_write && send_eof {
                    // Hold the transaction open until the final delivery
                    // callback fires.
                    stream.pending_eom = false;
                    let armed = match self.sock.as_deref_mut() {
                        Some(sock) => stream.arm_last_byte_ack(sock),
                        None => Ok(()),
                    };
                    if let Err(ex) = armed {
                        self.error_on_transaction_id(id, ex);
                        return sent;
                    }
                }
                sent
            }
            Err(err) => {
                self.handle_write_error(id, err);
                return 0;
            }
        };

        let Some(stream) = self.registry.streams.get_mut(&id) else {
            return sent;
        };
        stream.bytes_written += sent;

        let flow_control_blocked = sent == window && !send_eof;
        // An abort above may have cleared the queue entry already.
        let still_enqueued = self.queue.is_enqueued(id);
        let Some(stream) = self.registry.streams.get_mut(&id) else {
            return sent;
        };
        // Backpressured streams stay enqueued so they are revisited on the
        // next writeability notification; only fully drained streams leave
        // the queue.
        let idle = stream.write_buf.is_empty()
            && !stream.pending_eom
            && !stream.txn.has_pending_body()
            && !stream.txn.is_egress_eom_queued();
        if still_enqueued && idle {
            self.queue.clear_pending_egress(id);
        }
        let Some(stream) = self.registry.streams.get_mut(&id) else {
            return sent;
        };
        if flow_control_blocked && !stream.txn.is_egress_complete() {
            debug!(stream = %id, "transaction flow control blocked");
            stream.txn.pause_egress();
        }
        sent
    }
}
