//! The session dispatcher: event-loop entry point for one connection.
//!
//! The session owns the socket handle, the stream registry, the egress
//! priority queue, the unidirectional dispatcher and the drain state. The
//! embedding event loop feeds it transport callbacks and runs
//! [`Session::run_loop_callback`] whenever [`Session::needs_loop_callback`]
//! reports true; everything else happens inside those entry points on a
//! single thread.
//!
//! Lifetime: created post-handshake, destroyed exactly once when the drain
//! state machine reports DONE, no streams remain, and no loop callback is
//! scheduled. Because drops can be requested from inside transport
//! callbacks, the drop path is split: `drop_connection` runs synchronously,
//! `drop_connection_async` queues the drop for the next loop turn so the
//! caller's stack is never freed underneath it.

use bytes::Bytes;
use http::HeaderMap;
use std::collections::BTreeSet;
use tracing::{debug, error, info, warn};

use crate::codec::{CodecFactory, ControlEvent, RequestEvent};
use crate::config::SessionConfig;
use crate::dialect::Dialect;
use crate::dispatch::{Classified, UniDispatcher};
use crate::drain::DrainState;
use crate::error::{
    control_stream_error, direction_name, CodecError, ErrorCode, ExceptionDirection, Result,
    SessionError, StreamException,
};
use crate::message::HttpMessage;
use crate::priority::EgressQueue;
use crate::registry::StreamRegistry;
use crate::settings::{Setting, SettingsSnapshot};
use crate::stream::{ControlStream, RequestStream};
use crate::stream_type::UniStreamType;
use crate::txn::{Transaction, TransactionFactory};
use crate::version;
use hqmux_x::{
    LocalErrorCode, QuicError, QuicSocket, StreamDirection, StreamId, StreamTransportInfo,
    TransportDirection, TransportInfo, MAX_STREAM_ID,
};

/// Where a session-level error was observed, for classification and logs.
enum ErrorSource {
    Control(UniStreamType),
    Request(StreamId),
}

pub struct Session {
    pub(crate) sock: Option<Box<dyn QuicSocket>>,
    pub(crate) direction: TransportDirection,
    pub(crate) config: SessionConfig,
    pub(crate) codecs: Box<dyn CodecFactory>,
    txns: Box<dyn TransactionFactory>,
    pub(crate) queue: Box<dyn EgressQueue>,
    pub(crate) registry: StreamRegistry,
    dispatcher: UniDispatcher,

    pub(crate) dialect: Option<Dialect>,
    alpn: String,
    pub(crate) drain_state: DrainState,
    pub(crate) egress_settings: SettingsSnapshot,
    pub(crate) ingress_settings: SettingsSnapshot,
    received_settings: bool,

    /// Highest peer-initiated stream id observed; the second GOAWAY's limit.
    pub(crate) max_incoming_stream_id: u64,
    /// Peer-advertised GOAWAY limit (upstream sessions only).
    pub(crate) max_allowed_stream_id: u64,

    /// Drop scheduled for the next loop turn (reentrancy-safe drop path).
    pending_drop: Option<(QuicError, String, SessionError)>,

    /// Connection egress budget for the current loop turn.
    pub(crate) max_to_send: u64,
    pub(crate) scheduled_write: bool,
    loop_scheduled: bool,
    in_loop_callback: bool,
    reads_per_loop: u32,
    pub(crate) pending_process_read: BTreeSet<StreamId>,

    in_on_stop_sending: bool,
    dropping: bool,
    destroyed: bool,
    replay_safe: bool,
    pub(crate) writes_paused: bool,
    txns_served: u64,
}

impl Session {
    pub fn new(
        sock: Box<dyn QuicSocket>,
        direction: TransportDirection,
        config: SessionConfig,
        codecs: Box<dyn CodecFactory>,
        txns: Box<dyn TransactionFactory>,
        queue: Box<dyn EgressQueue>,
    ) -> Self {
        let egress_settings = SettingsSnapshot::egress_from_config(&config);
        Self {
            sock: Some(sock),
            direction,
            config,
            codecs,
            txns,
            queue,
            registry: StreamRegistry::new(),
            dispatcher: UniDispatcher::new(),
            dialect: None,
            alpn: String::new(),
            drain_state: DrainState::None,
            egress_settings,
            ingress_settings: SettingsSnapshot::default(),
            received_settings: false,
            max_incoming_stream_id: 0,
            max_allowed_stream_id: MAX_STREAM_ID,
            pending_drop: None,
            max_to_send: 0,
            scheduled_write: false,
            loop_scheduled: false,
            in_loop_callback: false,
            reads_per_loop: 0,
            pending_process_read: BTreeSet::new(),
            in_on_stop_sending: false,
            dropping: false,
            destroyed: false,
            replay_safe: false,
            writes_paused: false,
            txns_served: 0,
        }
    }

    // ------------------------------------------------------------------
    // Read-only state for the embedding.

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub fn needs_loop_callback(&self) -> bool {
        self.loop_scheduled && !self.destroyed
    }

    pub fn drain_state(&self) -> DrainState {
        self.drain_state
    }

    pub fn dialect(&self) -> Option<Dialect> {
        self.dialect
    }

    pub fn alpn(&self) -> &str {
        &self.alpn
    }

    pub fn num_streams(&self) -> usize {
        self.registry.num_streams()
    }

    pub fn transactions_served(&self) -> u64 {
        self.txns_served
    }

    pub fn received_settings(&self) -> bool {
        self.received_settings
    }

    pub fn is_in_loop_callback(&self) -> bool {
        self.in_loop_callback
    }

    /// Bytes this stream has handed to the transport so far.
    pub fn bytes_written(&self, id: StreamId) -> Option<u64> {
        self.registry.find_stream(id).map(|stream| stream.bytes_written)
    }

    /// Read-only connection transport snapshot.
    pub fn get_current_transport_info(&self) -> Option<TransportInfo> {
        self.sock.as_ref().map(|sock| sock.transport_info())
    }

    /// Read-only per-stream transport snapshot.
    pub fn get_current_stream_transport_info(&self, id: StreamId) -> Option<StreamTransportInfo> {
        self.sock
            .as_ref()
            .and_then(|sock| sock.stream_transport_info(id).ok())
    }

    // ------------------------------------------------------------------
    // Bring-up.

    /// Map the negotiated application protocol to a dialect and bring up
    /// the egress control streams. Returns false (and drops the
    /// connection) when the protocol is unsupported or bring-up fails.
    pub fn on_transport_ready(&mut self) -> bool {
        let alpn = self.sock.as_ref().and_then(|sock| sock.app_protocol());
        let dialect = alpn.as_deref().and_then(Dialect::from_alpn);
        let (Some(alpn), Some(dialect)) = (alpn, dialect) else {
            error!("next protocol not supported");
            self.on_connection_error(
                QuicError::Local(LocalErrorCode::ConnectFailed),
                "ALPN not supported",
            );
            return false;
        };
        info!(%alpn, %dialect, direction = %self.direction, "transport ready");
        self.alpn = alpn;
        self.dialect = Some(dialect);

        if !dialect.create_egress_control_streams(self) {
            return false;
        }
        // Apply defaults until the peer's SETTINGS arrive.
        dialect.apply_settings(self, &[]);

        // A shutdown may have been requested before transport-ready; kick
        // the GOAWAY logic now that the control stream exists.
        if self.drain_state == DrainState::Pending {
            dialect.send_goaway(self);
        }
        true
    }

    /// Handshake became replay-safe (0-RTT sessions).
    pub fn on_replay_safe(&mut self) {
        debug!("replay safe");
        self.replay_safe = true;
    }

    pub fn is_replay_safe(&self) -> bool {
        self.replay_safe
    }

    // ------------------------------------------------------------------
    // Transaction-facing operations.

    /// Open a new bidirectional request stream for `txn`.
    ///
    /// Returns `None` once the session is past CLOSE_SENT / FIRST_GOAWAY /
    /// DONE or the socket has gone bad.
    pub fn new_transaction(&mut self, txn: Box<dyn Transaction>) -> Option<StreamId> {
        if !self.drain_state.allows_new_transactions() {
            debug!(drain = %self.drain_state, "new_transaction after drain");
            return None;
        }
        if !self.sock.as_ref().map(|sock| sock.good()).unwrap_or(false) {
            debug!("new_transaction after socket went bad");
            return None;
        }
        let id = match self.sock.as_deref_mut()?.create_bidirectional_stream() {
            Ok(id) => id,
            Err(err) => {
                debug!(%err, "failed to create new stream");
                return None;
            }
        };
        if self.create_stream_transport(id, txn) {
            if let Some(sock) = self.sock.as_deref_mut() {
                sock.set_read_interest(id, true);
            }
            self.set_new_transaction_pause_state(id);
            Some(id)
        } else {
            self.abort_raw_stream(
                ExceptionDirection::IngressAndEgress,
                id,
                ErrorCode::InternalError,
            );
            None
        }
    }

    /// Frame headers for `id` through the per-stream codec.
    pub fn send_headers(&mut self, id: StreamId, msg: &HttpMessage, include_eom: bool) -> Result<()> {
        if let Some(dialect) = self.dialect {
            // For the legacy v1 dialect, sending `Connection: close`
            // initiates shutdown.
            dialect.check_sending_goaway(self, msg);
        }
        let Some(sock) = self.sock.as_deref_mut() else {
            return Err(SessionError::Dropped);
        };
        let Some(stream) = self.registry.streams.get_mut(&id) else {
            return Err(SessionError::StreamAbort);
        };
        let outcome = if stream.pushed && msg.is_request() {
            // Push promises travel on the parent's path; ingress push
            // streams never frame one themselves.
            return Err(SessionError::StreamAbort);
        } else {
            stream.send_headers(sock, msg, include_eom)
        };
        match outcome {
            Ok(notify) => {
                self.flush_qpack_encoder_instructions();
                if notify {
                    self.notify_pending_egress(id);
                }
                Ok(())
            }
            Err(ex) => {
                let kind = ex.kind;
                self.error_on_transaction_id(id, ex);
                Err(kind)
            }
        }
    }

    /// Append framed body bytes for `id`.
    pub fn send_body(&mut self, id: StreamId, body: Bytes, include_eom: bool) -> Result<()> {
        let Some(stream) = self.registry.streams.get_mut(&id) else {
            return Err(SessionError::StreamAbort);
        };
        match stream.send_body(body, include_eom) {
            Ok(_) => {
                self.flush_qpack_encoder_instructions();
                self.notify_pending_egress(id);
                Ok(())
            }
            Err(ex) => {
                let kind = ex.kind;
                self.error_on_transaction_id(id, ex);
                Err(kind)
            }
        }
    }

    /// Frame trailers (if given) and the end of message for `id`.
    pub fn send_eom(&mut self, id: StreamId, trailers: Option<&HeaderMap>) -> Result<()> {
        let Some(stream) = self.registry.streams.get_mut(&id) else {
            return Err(SessionError::StreamAbort);
        };
        match stream.send_eom(trailers) {
            Ok(_) => {
                self.flush_qpack_encoder_instructions();
                self.notify_pending_egress(id);
                Ok(())
            }
            Err(ex) => {
                let kind = ex.kind;
                self.error_on_transaction_id(id, ex);
                Err(kind)
            }
        }
    }

    /// Abort both halves of `id` with `code` and drain its buffers.
    pub fn send_abort(&mut self, id: StreamId, code: ErrorCode) {
        let Some(stream) = self.registry.find_stream_mut(id) else {
            return;
        };
        let ingress = stream.ingress_id();
        let egress = stream.egress_id();
        stream.abort_egress();
        if let Some(ingress_id) = ingress {
            if let Some(dialect) = self.dialect {
                dialect.abort_stream(self, ingress_id);
            }
            if let Some(sock) = self.sock.as_deref_mut() {
                let _ = sock.stop_sending(ingress_id, code.to_code());
            }
        }
        if let Some(egress_id) = egress {
            if let Some(sock) = self.sock.as_deref_mut() {
                let _ = sock.reset_stream(egress_id, code.to_code());
            }
        }
        self.queue.clear_pending_egress(id);
    }

    /// Arm a delivery callback for an egress body offset on `id`. The
    /// transaction hears `on_egress_body_bytes_acked` (or the cancel
    /// counterpart) when the receiver acknowledges that byte.
    pub fn track_egress_body_delivery(&mut self, id: StreamId, body_offset: u64) -> Result<()> {
        let Some(sock) = self.sock.as_deref_mut() else {
            return Err(SessionError::Dropped);
        };
        let Some(stream) = self.registry.streams.get_mut(&id) else {
            return Err(SessionError::StreamAbort);
        };
        match stream.track_egress_body_delivery(sock, body_offset) {
            Ok(()) => Ok(()),
            Err(ex) => {
                let kind = ex.kind;
                self.error_on_transaction_id(id, ex);
                Err(kind)
            }
        }
    }

    /// The transaction layer is done with `id`; detach and erase once
    /// buffers drain and delivery callbacks settle.
    pub fn detach_transaction(&mut self, id: StreamId) {
        if let Some(stream) = self.registry.streams.get_mut(&id) {
            stream.detached = true;
        }
        self.check_stream_for_detach(id);
        self.check_for_shutdown();
    }

    /// Per-transaction timer fired: abort ingress and tell the transaction.
    pub fn transaction_timeout_expired(&mut self, id: StreamId) {
        let Some(stream) = self.registry.find_stream_mut(id) else {
            return;
        };
        let ingress = stream.ingress_id();
        stream.abort_ingress();
        stream.txn.on_ingress_timeout();
        if let Some(ingress_id) = ingress {
            if let Some(dialect) = self.dialect {
                dialect.abort_stream(self, ingress_id);
            }
            if let Some(sock) = self.sock.as_deref_mut() {
                let _ = sock.stop_sending(ingress_id, ErrorCode::InternalError.to_code());
            }
        }
    }

    // ------------------------------------------------------------------
    // Shutdown.

    /// Enter the PENDING drain state and send the first GOAWAY when the
    /// dialect has a control stream. Idempotent.
    pub fn notify_pending_shutdown(&mut self) {
        self.drain_impl();
    }

    /// Enter PENDING, collapse to DONE where the dialect allows, and
    /// quiesce.
    pub fn close_when_idle(&mut self) {
        self.drain_impl();
        if self.dialect == Some(Dialect::V1) {
            self.drain_state = DrainState::Done;
        }
        self.cleanup_pending_streams();
        self.check_for_shutdown();
    }

    /// Synchronous hard drop.
    pub fn drop_connection(&mut self, msg: &str) {
        let msg = if msg.is_empty() { "Stopping" } else { msg };
        self.drop_connection_sync(
            QuicError::Application(ErrorCode::NoError.to_code()),
            msg.to_string(),
            SessionError::Dropped,
        );
    }

    /// Queue a drop for the next loop turn. Safe to call from inside any
    /// transport callback.
    pub fn drop_connection_async(&mut self, err: QuicError, msg: impl Into<String>, kind: SessionError) {
        if self.pending_drop.is_none() {
            self.pending_drop = Some((err, msg.into(), kind));
            self.schedule_loop_callback();
        } else {
            debug!("session already scheduled to be dropped");
        }
    }

    fn drop_connection_sync(&mut self, err: QuicError, msg: String, kind: SessionError) {
        // `dropping` guards against drop -> on_error -> drop re-entry;
        // DONE alone is not enough because a drop can arrive while state
        // from an outer callback is still on the stack.
        if self.dropping {
            debug!("already dropping");
            return;
        }
        self.dropping = true;
        debug!(%kind, %msg, "dropping connection");
        if self.registry.num_streams() > 0 {
            if let Some(mut sock) = self.sock.take() {
                sock.close(Some((err, msg)));
            }
            self.error_all_transactions(kind, "Dropped connection");
        } else if let Some(mut sock) = self.sock.take() {
            sock.close(None);
        }
        self.drain_state = DrainState::Done;
        self.loop_scheduled = false;
        self.pending_drop = None;
        self.check_for_shutdown();
        debug_assert_eq!(self.registry.num_streams(), 0);
    }

    /// Surface an error to every open transaction exactly once.
    fn error_all_transactions(&mut self, kind: SessionError, msg: &str) {
        let ids = self.registry.request_ids();
        for id in ids {
            self.queue.remove(id);
            if let Some(stream) = self.registry.streams.get_mut(&id) {
                // The socket is gone; outstanding delivery callbacks will
                // never fire.
                stream.cancel_delivery_callbacks();
                stream.error_on_transaction(StreamException::new(
                    ExceptionDirection::IngressAndEgress,
                    kind,
                    msg,
                ));
                stream.detached = true;
            }
        }
    }

    pub(crate) fn drain_impl(&mut self) {
        if self.drain_state != DrainState::None {
            debug!("already draining");
            return;
        }
        self.drain_state = DrainState::Pending;
        if let Some(dialect) = self.dialect {
            dialect.send_goaway(self);
        }
    }

    /// Quiescence check: advance upstream drains, sweep detachable
    /// streams, and self-destroy once DONE with nothing left.
    pub(crate) fn check_for_shutdown(&mut self) {
        // Upstream sessions with a control stream need not wait to send
        // GOAWAYs; they stop creating streams and finish what is in
        // flight, processing server GOAWAYs meanwhile.
        if self.dialect != Some(Dialect::V1)
            && self.direction == TransportDirection::Upstream
            && self.drain_state == DrainState::Pending
        {
            self.drain_state = DrainState::Done;
        }

        let ids = self.registry.request_ids();
        for id in ids {
            self.check_stream_for_detach(id);
        }

        if self.drain_state == DrainState::Done
            && self.registry.num_streams() == 0
            && !self.loop_scheduled
            && !self.destroyed
        {
            self.cleanup_pending_streams();
            if let Some(mut sock) = self.sock.take() {
                sock.close(None);
            }
            info!("session destroyed");
            self.destroyed = true;
        }
    }

    fn check_stream_for_detach(&mut self, id: StreamId) {
        let enqueued = self.queue.is_enqueued(id);
        let ready = self
            .registry
            .streams
            .get(&id)
            .map(|stream| stream.is_detach_ready(enqueued))
            .unwrap_or(false);
        if ready {
            self.detach_stream_transport(id);
        }
    }

    fn detach_stream_transport(&mut self, id: StreamId) {
        let age_ms = self
            .registry
            .streams
            .get(&id)
            .map(|stream| stream.created_at.elapsed().as_millis() as u64)
            .unwrap_or(0);
        debug!(stream = %id, age_ms, "detaching stream transport");
        let ids: Vec<StreamId> = self
            .registry
            .streams
            .get(&id)
            .map(|stream| [stream.ingress_id(), stream.egress_id()])
            .map(|pair| pair.into_iter().flatten().collect())
            .unwrap_or_default();
        for sid in ids {
            self.clear_stream_callbacks(sid);
        }
        self.registry.erase_stream(id);
        self.queue.remove(id);
        self.pending_process_read.remove(&id);
        if self.registry.num_streams() == 0 {
            self.cleanup_pending_streams();
        }
    }

    /// Detach callbacks from ids the dispatcher still owns; run at
    /// shutdown so half-classified streams do not leak interest.
    fn cleanup_pending_streams(&mut self) {
        for id in self.dispatcher.pending_ids() {
            self.clear_stream_callbacks(id);
            self.dispatcher.release(id);
        }
    }

    fn clear_stream_callbacks(&mut self, id: StreamId) {
        if let Some(sock) = self.sock.as_deref_mut() {
            sock.set_read_interest(id, false);
            sock.set_peek_interest(id, false);
        } else {
            debug!("attempt to clear callbacks on closed socket");
        }
    }

    // ------------------------------------------------------------------
    // Transport callbacks: stream arrival.

    pub fn on_new_bidirectional_stream(&mut self, id: StreamId) {
        debug!(stream = %id, "new bidirectional stream");
        if self.destroyed {
            return;
        }
        let Some(dialect) = self.dialect else {
            error!("stream arrived before transport ready");
            return;
        };
        if !dialect.check_new_stream(self, id) {
            return;
        }
        debug_assert!(self.registry.find_non_detached_stream_mut(id).is_none());
        let txn = self.txns.new_transaction(id, false);
        if self.create_stream_transport(id, txn) {
            if let Some(sock) = self.sock.as_deref_mut() {
                sock.set_read_interest(id, true);
            }
            self.max_incoming_stream_id = self.max_incoming_stream_id.max(id.value());
        }
    }

    pub fn on_new_unidirectional_stream(&mut self, id: StreamId) {
        debug!(stream = %id, "new unidirectional stream");
        if self.destroyed {
            return;
        }
        let Some(dialect) = self.dialect else {
            error!("stream arrived before transport ready");
            return;
        };
        if !dialect.check_new_stream(self, id) {
            return;
        }
        debug_assert!(self.registry.find_stream(id).is_none());
        // Control or push, but the preface has not been read yet; the
        // dispatcher owns the id until it classifies.
        self.dispatcher.take_temporary_ownership(id);
        if let Some(sock) = self.sock.as_deref_mut() {
            sock.set_peek_interest(id, true);
        }
    }

    fn create_stream_transport(&mut self, id: StreamId, txn: Box<dyn Transaction>) -> bool {
        if !self.sock.as_ref().map(|sock| sock.good()).unwrap_or(false) {
            debug!(stream = %id, "refusing transaction on closing session");
            return false;
        }
        if self.registry.find_stream(id).is_some() {
            debug!(stream = %id, "refusing duplicate stream transport");
            return false;
        }
        if let Some(window) = self.config.receive_stream_window {
            if let Some(sock) = self.sock.as_deref_mut() {
                let _ = sock.set_stream_flow_control_window(id, window);
            }
        }
        let codec = self.codecs.create_request_codec(id);
        let stream = RequestStream::new_bidirectional(id, codec, txn);
        let priority = stream.priority;
        self.registry.insert_request(id, stream);
        self.queue.insert(id, priority);
        self.txns_served += 1;
        if self.drain_state != DrainState::None {
            if let Some(dialect) = self.dialect {
                dialect.send_goaway_on_request_stream(self, id);
            }
        }
        true
    }

    // ------------------------------------------------------------------
    // Transport callbacks: unidirectional preface dispatch.

    /// Peek notification for a stream the dispatcher owns.
    pub fn on_peek_available(&mut self, id: StreamId) {
        if self.destroyed {
            return;
        }
        if !self.dispatcher.owns(id) {
            debug!(stream = %id, "peek on stream the dispatcher does not own");
            return;
        }
        let Some(dialect) = self.dialect else {
            return;
        };
        let data = match self.sock.as_deref_mut().map(|sock| sock.peek(id)) {
            Some(Ok(data)) => data,
            Some(Err(err)) => {
                self.on_read_error(id, err);
                return;
            }
            None => return,
        };
        match self.dispatcher.classify(dialect, &data) {
            Classified::NeedMore => {}
            Classified::Unknown(tag) => {
                warn!(stream = %id, tag, "unknown unidirectional stream preface");
                self.reject_stream(id);
            }
            Classified::Control { stream_type, consumed } => {
                self.dispatcher.release(id);
                if let Some(sock) = self.sock.as_deref_mut() {
                    let _ = sock.consume(id, consumed);
                }
                if self.bind_ingress_control_stream(id, stream_type) {
                    if let Some(sock) = self.sock.as_deref_mut() {
                        let _ = sock.set_control_stream(id);
                        sock.set_peek_interest(id, false);
                        sock.set_read_interest(id, true);
                    }
                    // The transport only notifies for future arrivals;
                    // drain anything that came in with the preface now.
                    self.read_control_stream(id);
                }
            }
            Classified::Push { push_id, consumed } => {
                self.dispatcher.release(id);
                if let Some(sock) = self.sock.as_deref_mut() {
                    let _ = sock.consume(id, consumed);
                }
                self.bind_ingress_push_stream(id, push_id);
            }
        }
    }

    /// Install the ingress half of the control stream for `stream_type`.
    fn bind_ingress_control_stream(&mut self, id: StreamId, stream_type: UniStreamType) -> bool {
        let Some(ctrl) = self.registry.find_control_mut(stream_type) else {
            // Egress control streams are created at bring-up; a peer
            // stream with no egress counterpart means bring-up never ran.
            error!(stream = %id, %stream_type, "ingress control stream without egress");
            self.drop_connection_async(
                QuicError::Application(ErrorCode::InternalError.to_code()),
                "control stream before bring-up",
                SessionError::Connection,
            );
            return false;
        };
        if ctrl.ingress_codec.is_some() {
            error!(%stream_type, "duplicate ingress control stream");
            self.drop_connection_async(
                QuicError::Application(ErrorCode::StreamCreationError.to_code()),
                "wrong number of control streams",
                SessionError::Connection,
            );
            return false;
        }
        let codec = self.codecs.create_control_codec(stream_type);
        let Some(ctrl) = self.registry.find_control_mut(stream_type) else {
            return false;
        };
        let bound = ctrl.bind_ingress(id, codec);
        debug_assert!(bound);
        let age_ms = ctrl.created_at.elapsed().as_millis() as u64;
        self.registry.index_control_ingress(id, stream_type);
        debug!(stream = %id, %stream_type, age_ms, "bound ingress control stream");
        true
    }

    fn bind_ingress_push_stream(&mut self, id: StreamId, push_id: u64) {
        let push_allowed = self.direction == TransportDirection::Upstream
            && self.dialect == Some(Dialect::H3)
            && self.config.enable_push;
        if !push_allowed {
            warn!(stream = %id, push_id, "push stream not allowed here");
            self.reject_stream(id);
            return;
        }
        if let Some(window) = self.config.receive_stream_window {
            if let Some(sock) = self.sock.as_deref_mut() {
                let _ = sock.set_stream_flow_control_window(id, window);
            }
        }
        let codec = self.codecs.create_request_codec(id);
        let txn = self.txns.new_transaction(id, true);
        let mut stream = RequestStream::new_ingress_push(id, codec, txn);
        stream.ingress_push_id = Some(push_id);
        self.registry.insert_request(id, stream);
        if let Some(sock) = self.sock.as_deref_mut() {
            sock.set_peek_interest(id, false);
            sock.set_read_interest(id, true);
        }
        debug!(stream = %id, push_id, "bound ingress push stream");
    }

    /// Reject an unidentifiable unidirectional stream: STOP_SENDING with
    /// an unknown-stream-type error, then detach all callbacks. The peer
    /// resets the stream on receipt.
    fn reject_stream(&mut self, id: StreamId) {
        if let Some(sock) = self.sock.as_deref_mut() {
            let _ = sock.stop_sending(id, ErrorCode::StreamCreationError.to_code());
            sock.set_peek_interest(id, false);
            sock.set_read_interest(id, false);
        }
        self.dispatcher.release(id);
    }

    // ------------------------------------------------------------------
    // Transport callbacks: reads.

    pub fn on_read_available(&mut self, id: StreamId) {
        if self.destroyed {
            return;
        }
        if self.registry.control_type_for_id(id).is_some() {
            self.read_control_stream(id);
            return;
        }
        // Reads-per-loop cap: skipped streams are picked up on the next
        // turn, preventing read starvation of writes and timers.
        if self.reads_per_loop >= self.config.max_reads_per_loop {
            debug!(stream = %id, "skipping read, per-loop cap reached");
            return;
        }
        self.reads_per_loop += 1;
        self.read_request_stream(id);
        self.schedule_loop_callback();
    }

    fn read_request_stream(&mut self, id: StreamId) {
        if self.registry.find_ingress_stream_mut(id, false).is_none() {
            debug_assert!(self.registry.find_stream(id).is_some());
            return;
        }
        let read = match self.sock.as_deref_mut() {
            Some(sock) => sock.read(id),
            None => return,
        };
        let (data, eof) = match read {
            Ok(read) => read,
            Err(err) => {
                error!(stream = %id, %err, "synchronous read error");
                self.on_read_error(id, err);
                return;
            }
        };
        let Some(stream) = self.registry.find_ingress_stream_mut(id, false) else {
            return;
        };
        stream.read_eof = eof;
        if data.is_empty() && !eof {
            debug!(stream = %id, "blank read, ignoring");
            return;
        }
        debug!(stream = %id, len = data.len(), eof, "buffered read data");
        stream.read_buf.extend_from_slice(&data);
        // Processing happens in the loop callback, after all reads.
        self.pending_process_read.insert(id);
    }

    fn read_control_stream(&mut self, id: StreamId) {
        let Some(stream_type) = self.registry.control_type_for_id(id) else {
            error!(stream = %id, "read available on unknown control stream");
            return;
        };
        let read = match self.sock.as_deref_mut() {
            Some(sock) => sock.read(id),
            None => return,
        };
        let (data, eof) = match read {
            Ok(read) => read,
            Err(err) => {
                let kind = SessionError::from_quic(&err);
                self.handle_session_error(
                    ErrorSource::Control(stream_type),
                    StreamDirection::Ingress,
                    control_stream_error(err),
                    kind,
                );
                return;
            }
        };
        let Some(ctrl) = self.registry.find_control_mut(stream_type) else {
            return;
        };
        debug!(stream = %id, len = data.len(), eof, "control stream read");
        ctrl.read_buf.extend_from_slice(&data);
        ctrl.read_eof = eof;
        self.process_control_read(stream_type);
    }

    fn process_control_read(&mut self, stream_type: UniStreamType) {
        loop {
            let Some(ctrl) = self.registry.find_control_mut(stream_type) else {
                return;
            };
            let Some(codec) = ctrl.ingress_codec.as_mut() else {
                return;
            };
            if ctrl.read_buf.is_empty() {
                break;
            }
            let before = ctrl.read_buf.len();
            let events = match codec.on_ingress(&mut ctrl.read_buf) {
                Ok(events) => events,
                Err(err) => {
                    self.handle_session_error(
                        ErrorSource::Control(stream_type),
                        StreamDirection::Ingress,
                        QuicError::Application(err.code.to_code()),
                        SessionError::Connection,
                    );
                    return;
                }
            };
            let consumed = before - ctrl.read_buf.len();
            let produced = !events.is_empty();
            for event in events {
                self.dispatch_control_event(stream_type, event);
                if self.destroyed || self.pending_drop.is_some() {
                    return;
                }
            }
            if consumed == 0 && !produced {
                break;
            }
        }

        let eof = self
            .registry
            .find_control_mut(stream_type)
            .map(|ctrl| ctrl.read_eof && ctrl.read_buf.is_empty())
            .unwrap_or(false);
        if eof {
            let result = self
                .registry
                .find_control_mut(stream_type)
                .and_then(|ctrl| ctrl.ingress_codec.as_mut())
                .map(|codec| codec.on_ingress_eof());
            if let Some(Err(err)) = result {
                self.handle_session_error(
                    ErrorSource::Control(stream_type),
                    StreamDirection::Ingress,
                    QuicError::Application(err.code.to_code()),
                    SessionError::Connection,
                );
            }
        }

        // Instructions on a QPACK stream may have unblocked header parsing
        // on request streams; revisit any with buffered ingress.
        if stream_type.is_qpack() {
            let stalled: Vec<StreamId> = self
                .registry
                .streams
                .iter()
                .filter(|(_, stream)| !stream.read_buf.is_empty() && !stream.detached)
                .map(|(id, _)| *id)
                .collect();
            if !stalled.is_empty() {
                self.pending_process_read.extend(stalled);
                self.schedule_loop_callback();
            }
        }
    }

    fn dispatch_control_event(&mut self, stream_type: UniStreamType, event: ControlEvent) {
        match event {
            ControlEvent::Settings(settings) => self.on_settings(&settings),
            ControlEvent::Goaway(last_good) => self.on_goaway(last_good),
            ControlEvent::Skipped(frame_type) => {
                debug!(%stream_type, frame_type, "skipped control frame");
            }
        }
    }

    fn on_settings(&mut self, settings: &[Setting]) {
        debug!(count = settings.len(), "got SETTINGS");
        self.ingress_settings.apply(settings);
        if let Some(dialect) = self.dialect {
            dialect.on_settings(self, settings);
        }
        self.received_settings = true;
    }

    /// Inbound GOAWAY. Idempotent: repeated GOAWAYs only ever narrow the
    /// limit and never roll the drain state back.
    fn on_goaway(&mut self, last_good_stream_id: u64) {
        debug_assert_eq!(self.direction, TransportDirection::Upstream);
        debug_assert_ne!(self.dialect, Some(Dialect::V1));
        info!(last_good_stream_id, "got GOAWAY");
        self.max_allowed_stream_id = self.max_allowed_stream_id.min(last_good_stream_id);
        // Drain existing streams; refuse new ones.
        self.drain_impl();

        let ids = self.registry.request_ids();
        for id in ids {
            let beyond = self.beyond_goaway_limit(id.value(), self.max_allowed_stream_id);
            if let Some(stream) = self.registry.find_non_detached_stream_mut(id) {
                stream.txn.on_goaway(ErrorCode::NoError);
                if beyond {
                    // Initiated locally but never processed remotely.
                    stream.error_on_transaction(StreamException::new(
                        ExceptionDirection::IngressAndEgress,
                        SessionError::StreamUnacknowledged,
                        "stream beyond GOAWAY limit",
                    ));
                    self.queue.clear_pending_egress(id);
                }
            }
        }

        self.drain_state = match self.drain_state {
            DrainState::None | DrainState::Pending => DrainState::FirstGoaway,
            DrainState::FirstGoaway => DrainState::Done,
            other => other,
        };
        self.check_for_shutdown();
    }

    /// Comparison against a GOAWAY limit; strictly-greater by default,
    /// configurable to inclusive while the spec text is in flux.
    pub(crate) fn beyond_goaway_limit(&self, id: u64, limit: u64) -> bool {
        if self.config.goaway_inclusive {
            id >= limit
        } else {
            id > limit
        }
    }

    pub(crate) fn goaway_stream_id(&self) -> u64 {
        version::goaway_stream_id(self.drain_state, self.max_incoming_stream_id)
    }

    /// The first GOAWAY was delivered; queue the narrower second one. The
    /// second ack completes the drain.
    pub(crate) fn on_goaway_ack(&mut self) {
        debug!(drain = %self.drain_state, "GOAWAY delivered to remote");
        match self.drain_state {
            DrainState::FirstGoaway => {
                if let Some(dialect) = self.dialect {
                    dialect.send_goaway(self);
                }
            }
            DrainState::SecondGoaway => {
                self.drain_state = DrainState::Done;
            }
            _ => {}
        }
        self.schedule_loop_callback();
    }

    // ------------------------------------------------------------------
    // Transport callbacks: request-stream read processing.

    /// Drain the pending-read set, feeding each stream's codec.
    pub(crate) fn process_read_data(&mut self) {
        while let Some(id) = self.pending_process_read.pop_first() {
            let Some(stream) = self.registry.find_ingress_stream_mut(id, true) else {
                // Processing one stream can delete others.
                continue;
            };
            if stream.detached {
                debug!(stream = %id, "discarding pending read data for detached stream");
                stream.read_buf.clear();
                stream.read_eof = false;
                continue;
            }
            let result = stream.process_read_data();
            match result {
                Ok((events, _blocked)) => {
                    for event in events {
                        self.dispatch_request_event(id, event);
                        if self.destroyed {
                            return;
                        }
                    }
                    if let Some(stream) = self.registry.find_ingress_stream_mut(id, false) {
                        if stream.ingress_error {
                            stream.abort_ingress();
                        } else if stream.read_buf.is_empty() && stream.read_eof {
                            stream.on_ingress_eof();
                        }
                    }
                }
                Err(err) => self.handle_request_codec_error(id, err),
            }
        }
    }

    fn dispatch_request_event(&mut self, id: StreamId, event: RequestEvent) {
        match event {
            RequestEvent::MessageBegin => {}
            RequestEvent::HeadersComplete(msg) => {
                if let Some(dialect) = self.dialect {
                    dialect.headers_complete(self, &msg);
                }
                if let Some(stream) = self.registry.find_ingress_stream_mut(id, false) {
                    if let Some(push_id) = stream.ingress_push_id {
                        debug!(stream = %id, push_id, "headers for pushed response");
                    }
                    stream.txn.on_ingress_headers_complete(msg);
                }
            }
            RequestEvent::Body(body) => {
                if let Some(stream) = self.registry.find_ingress_stream_mut(id, false) {
                    stream.txn.on_ingress_body(body);
                }
            }
            RequestEvent::Trailers(trailers) => {
                if let Some(stream) = self.registry.find_ingress_stream_mut(id, false) {
                    stream.txn.on_ingress_trailers(trailers);
                }
            }
            RequestEvent::MessageComplete => {
                if let Some(stream) = self.registry.find_ingress_stream_mut(id, false) {
                    stream.on_codec_eom();
                }
            }
            RequestEvent::PushPromiseBegin(push_id) => {
                if let Some(stream) = self.registry.find_ingress_stream_mut(id, false) {
                    stream.ingress_push_id = Some(push_id);
                }
            }
        }
    }

    fn handle_request_codec_error(&mut self, id: StreamId, err: CodecError) {
        if err.connection_level {
            self.handle_session_error(
                ErrorSource::Request(id),
                StreamDirection::Ingress,
                QuicError::Application(err.code.to_code()),
                SessionError::Connection,
            );
            return;
        }
        warn!(stream = %id, %err, "request codec error");
        let ex = StreamException::new(
            ExceptionDirection::Ingress,
            SessionError::Parse,
            err.message.clone(),
        )
        .with_code(err.code);
        if let Some(stream) = self.registry.find_ingress_stream_mut(id, false) {
            stream.ingress_error = true;
            stream.error_on_transaction(ex);
        }
    }

    // ------------------------------------------------------------------
    // Transport callbacks: errors and flow control.

    pub fn on_read_error(&mut self, id: StreamId, err: QuicError) {
        debug!(stream = %id, %err, "read error");
        if let Some(stream_type) = self.registry.control_type_for_id(id) {
            let kind = SessionError::from_quic(&err);
            self.handle_session_error(
                ErrorSource::Control(stream_type),
                StreamDirection::Ingress,
                control_stream_error(err),
                kind,
            );
            return;
        }
        match err {
            QuicError::Application(code) => {
                let error_code =
                    ErrorCode::from_code(code).unwrap_or(ErrorCode::GeneralProtocolError);
                if self.registry.find_non_detached_stream_mut(id).is_some() {
                    self.on_reset_stream(id, error_code);
                } else {
                    debug!(stream = %id, %error_code, "application read error for detached stream");
                }
            }
            QuicError::Local(code) => {
                let kind = if code == LocalErrorCode::ConnectFailed {
                    SessionError::Connect
                } else {
                    SessionError::Shutdown
                };
                self.error_on_transaction_id(
                    id,
                    StreamException::new(
                        ExceptionDirection::IngressAndEgress,
                        kind,
                        format!("got read error: {err}"),
                    ),
                );
            }
            QuicError::Transport(_) => {
                self.error_on_transaction_id(
                    id,
                    StreamException::new(
                        ExceptionDirection::IngressAndEgress,
                        SessionError::ConnectionReset,
                        format!("got read error: {err}"),
                    ),
                );
            }
        }
    }

    /// Peer reset: translate the application error, pick a reply error,
    /// and abort.
    fn on_reset_stream(&mut self, id: StreamId, error_code: ErrorCode) {
        let Some(stream) = self.registry.find_non_detached_stream_mut(id) else {
            return;
        };
        let reply = if self.direction == TransportDirection::Upstream {
            // Upstream ingress closed: cancel this request.
            ErrorCode::RequestCancelled
        } else if !stream.txn.is_ingress_started() {
            // No ingress delivered yet; the peer may safely retry.
            ErrorCode::RequestRejected
        } else {
            ErrorCode::NoError
        };
        let kind = if error_code == ErrorCode::RequestRejected {
            SessionError::StreamUnacknowledged
        } else {
            SessionError::StreamAbort
        };
        let ex = StreamException::new(
            ExceptionDirection::IngressAndEgress,
            kind,
            format!("peer reset with {error_code}"),
        )
        .with_code(error_code);
        self.error_on_transaction_id(id, ex);
        self.send_abort(id, reply);
    }

    /// STOP_SENDING from the peer. A synchronous drop from inside this
    /// callback is forbidden; anything fatal goes through the async path.
    pub fn on_stop_sending(&mut self, id: StreamId, error_code: u64) {
        self.in_on_stop_sending = true;
        let code = ErrorCode::from_code(error_code).unwrap_or(ErrorCode::GeneralProtocolError);
        debug!(stream = %id, %code, "stop sending");
        if self.registry.find_stream(id).is_some() {
            self.handle_write_error(id, QuicError::Application(error_code));
        }
        self.in_on_stop_sending = false;
    }

    pub(crate) fn handle_write_error(&mut self, id: StreamId, err: QuicError) {
        let ex = match err {
            QuicError::Application(code) => {
                // An application code here came from the peer (most
                // likely STOP_SENDING); logically a stream abort, not a
                // write failure.
                let error_code =
                    ErrorCode::from_code(code).unwrap_or(ErrorCode::GeneralProtocolError);
                let kind = if error_code == ErrorCode::RequestRejected {
                    SessionError::StreamUnacknowledged
                } else {
                    SessionError::StreamAbort
                };
                StreamException::new(
                    ExceptionDirection::IngressAndEgress,
                    kind,
                    format!("got error: {err}"),
                )
                .with_code(error_code)
            }
            QuicError::Local(_) | QuicError::Transport(_) => StreamException::new(
                ExceptionDirection::IngressAndEgress,
                SessionError::Write,
                format!("got error: {err}"),
            ),
        };
        self.send_abort(id, ErrorCode::RequestCancelled);
        self.error_on_transaction_id(id, ex);
    }

    pub(crate) fn error_on_transaction_id(&mut self, id: StreamId, ex: StreamException) {
        self.queue.clear_pending_egress(id);
        if let Some(stream) = self.registry.find_stream_mut(id) {
            stream.error_on_transaction(ex);
        }
    }

    /// Classify an error on a critical stream and drop when required.
    ///
    /// Errors detected inside read or write callbacks always take the
    /// async-drop path so the caller's state is not freed mid-traversal.
    fn handle_session_error(
        &mut self,
        source: ErrorSource,
        dir: StreamDirection,
        err: QuicError,
        kind: SessionError,
    ) {
        let (is_control, label) = match &source {
            ErrorSource::Control(stream_type) => (true, format!("control stream {stream_type}")),
            ErrorSource::Request(id) => (false, format!("request stream {id}")),
        };
        let (should_drop, mut app_error) = match err {
            // Expected when the peer resets a control stream, a control
            // codec detects a connection-level error, or a stream codec
            // reports a compression error. Always drop.
            QuicError::Application(code) => (
                true,
                ErrorCode::from_code(code).unwrap_or(ErrorCode::GeneralProtocolError),
            ),
            // NO_ERROR is the socket closing cleanly underneath us.
            QuicError::Local(code) => (code != LocalErrorCode::NoError, ErrorCode::NoError),
            QuicError::Transport(_) => (true, ErrorCode::NoError),
        };
        debug!(%label, dir = direction_name(dir), %err, should_drop, "session error");
        if !should_drop {
            return;
        }
        if is_control && app_error == ErrorCode::NoError {
            // Local or transport failure on a critical stream.
            app_error = ErrorCode::ClosedCriticalStream;
        }
        let msg = if is_control {
            "HTTP error on control stream"
        } else {
            "HTTP error on request stream"
        };
        self.drop_connection_async(QuicError::Application(app_error.to_code()), msg, kind);
    }

    /// Connection-level error from the transport.
    pub fn on_connection_error(&mut self, err: QuicError, msg: &str) {
        debug_assert!(
            !self.in_on_stop_sending,
            "connection error during stop-sending handling"
        );
        info!(%err, %msg, "connection error");
        let kind = SessionError::from_quic(&err);
        self.drop_connection_sync(err, msg.to_string(), kind);
    }

    /// The transport closed cleanly underneath the session.
    pub fn on_connection_end(&mut self) {
        if self.destroyed {
            return;
        }
        self.drop_connection_sync(
            QuicError::Local(LocalErrorCode::NoError),
            "connection ended".to_string(),
            SessionError::Shutdown,
        );
    }

    pub fn on_flow_control_update(&mut self, id: StreamId) {
        debug!(stream = %id, "flow control update");
        let flow = match self.sock.as_deref() {
            Some(sock) => match sock.stream_flow_control(id) {
                Ok(flow) => flow,
                Err(err) => {
                    debug!(stream = %id, %err, "flow control query failed");
                    return;
                }
            },
            None => return,
        };
        if self.registry.control_type_for_id(id).is_some() {
            if flow.send_window_available > 0 {
                self.schedule_write();
            }
            return;
        }
        let enqueued = self.queue.is_enqueued(id);
        let Some(stream) = self.registry.find_egress_stream_mut(id, false) else {
            debug!(stream = %id, "flow control update for unknown stream");
            return;
        };
        if flow.send_window_available > 0
            || (!stream.has_pending_body(enqueued) && stream.has_pending_eom(enqueued))
        {
            let pending = stream.has_pending_egress(enqueued);
            let resume = !stream.detached && stream.txn.is_egress_paused();
            if resume {
                stream.txn.resume_egress();
            }
            if pending {
                self.queue.signal_pending_egress(id);
            }
            self.schedule_write();
        }
    }

    // ------------------------------------------------------------------
    // Transport callbacks: writes and delivery.

    /// Writeability callback carrying this turn's connection egress budget.
    pub fn on_connection_write_ready(&mut self, max_to_send: u64) {
        debug!(max_to_send, "connection write ready");
        self.scheduled_write = false;
        self.max_to_send = max_to_send;
        self.schedule_loop_callback();
    }

    pub fn on_connection_write_error(&mut self, err: QuicError) {
        self.scheduled_write = false;
        // A connection error callback generally follows; nothing to do.
        debug!(%err, "connection write error");
    }

    pub fn on_delivery_ack(&mut self, id: StreamId, offset: u64) {
        debug!(stream = %id, offset, "delivery ack");
        if self.registry.control_type_for_id(id).is_some() {
            // The only delivery callback armed on a control stream tracks
            // GOAWAY delivery.
            self.on_goaway_ack();
            return;
        }
        if let Some(stream) = self.registry.find_egress_stream_mut(id, true) {
            stream.on_delivery_ack(offset);
        } else {
            error!(stream = %id, offset, "delivery ack for erased stream");
        }
    }

    pub fn on_canceled(&mut self, id: StreamId, offset: u64) {
        debug!(stream = %id, offset, "delivery canceled");
        if self.registry.control_type_for_id(id).is_some() {
            // GOAWAY delivery is off the table; accelerate draining.
            self.drain_state = DrainState::Done;
            self.schedule_loop_callback();
            return;
        }
        if let Some(stream) = self.registry.find_egress_stream_mut(id, true) {
            stream.on_canceled(offset);
        } else {
            warn!(stream = %id, offset, "cancel for erased stream");
        }
    }

    // ------------------------------------------------------------------
    // Transport callbacks: partial reliability.

    pub fn on_partial_data_available(&mut self, id: StreamId, stream_offset: u64, data: Bytes) {
        let Some(stream) = self.registry.find_non_detached_stream_mut(id) else {
            debug!(stream = %id, "partial data for missing stream");
            return;
        };
        match stream.codec.on_ingress_data_available(stream_offset) {
            Ok(body_offset) => stream.txn.on_ingress_body_peek(body_offset, data),
            Err(err) => debug!(stream = %id, %err, "stale peek offset"),
        }
    }

    pub fn on_data_expired(&mut self, id: StreamId, stream_offset: u64) {
        let Some(stream) = self.registry.find_non_detached_stream_mut(id) else {
            return;
        };
        match stream.codec.on_ingress_data_expired(stream_offset) {
            Ok(body_offset) => stream.txn.on_ingress_body_skipped(body_offset),
            Err(err) => debug!(stream = %id, %err, "stale skip offset"),
        }
    }

    pub fn on_data_rejected(&mut self, id: StreamId, stream_offset: u64) {
        let Some(stream) = self.registry.find_non_detached_stream_mut(id) else {
            return;
        };
        match stream.codec.on_ingress_data_rejected(stream_offset) {
            Ok(body_offset) => stream.txn.on_ingress_body_rejected(body_offset),
            Err(err) => debug!(stream = %id, %err, "stale reject offset"),
        }
    }

    // ------------------------------------------------------------------
    // Timers.

    /// Session idle timer fired.
    pub fn timeout_expired(&mut self) {
        if self.registry.num_streams() > 0 {
            debug!("ignoring session timeout with streams open");
            return;
        }
        info!("idle timeout, closing when idle");
        self.close_when_idle();
    }

    // ------------------------------------------------------------------
    // The loop callback.

    /// One turn of the event loop: drain reads, run the dialect post-read
    /// hook, write control streams then request streams under the egress
    /// budget, and finish with the quiescence check.
    pub fn run_loop_callback(&mut self) {
        if self.destroyed {
            return;
        }
        self.in_loop_callback = true;
        self.loop_scheduled = false;
        let budget_at_entry = self.max_to_send;

        if let Some((err, msg, kind)) = self.pending_drop.take() {
            self.drop_connection_sync(err, msg, kind);
            self.finish_loop(budget_at_entry);
            return;
        }

        self.reads_per_loop = 0;

        // Reads before writes, with the dialect hook between them.
        self.process_read_data();
        if let Some(dialect) = self.dialect {
            dialect.read_data_processed(self);
        }

        // Control streams first, then request streams under what remains.
        let written = self.write_control_streams(self.max_to_send);
        self.max_to_send = self.max_to_send.saturating_sub(written);
        if !self.queue.is_empty() && self.max_to_send > 0 {
            self.max_to_send = self.write_request_streams(self.max_to_send);
        }
        // Anything further waits for the next writeability callback.
        self.max_to_send = 0;

        if !self.queue.is_empty() {
            self.schedule_write();
        }
        if !self.pending_process_read.is_empty() {
            self.schedule_loop_callback();
        }
        self.finish_loop(budget_at_entry);
    }

    fn finish_loop(&mut self, budget_at_entry: u64) {
        if budget_at_entry > 0 && !self.destroyed && !self.dropping {
            if self.queue.is_empty() {
                // Everything written; let transactions produce more.
                self.resume_transactions();
            } else {
                // The socket is backpressuring.
                self.pause_transactions();
            }
        }
        self.check_for_shutdown();
        self.in_loop_callback = false;
    }

    // ------------------------------------------------------------------
    // Scheduling plumbing.

    /// Request a writeability callback for the connection, once.
    pub(crate) fn schedule_write(&mut self) {
        if self.scheduled_write {
            return;
        }
        self.scheduled_write = true;
        if let Some(sock) = self.sock.as_deref_mut() {
            sock.notify_pending_write();
        }
    }

    pub(crate) fn schedule_loop_callback(&mut self) {
        self.loop_scheduled = true;
    }

    pub(crate) fn notify_pending_egress(&mut self, id: StreamId) {
        self.queue.signal_pending_egress(id);
        self.schedule_write();
    }

    // ------------------------------------------------------------------
    // Pause/resume.

    /// Stop read notifications on every ingress stream (ingress limiter).
    pub fn pause_reads(&mut self) {
        let ids: Vec<StreamId> = self
            .registry
            .streams
            .values()
            .filter_map(|stream| stream.ingress_id())
            .collect();
        if let Some(sock) = self.sock.as_deref_mut() {
            for id in ids {
                sock.pause_read(id);
            }
        }
    }

    /// Resume read notifications on every ingress stream.
    pub fn resume_reads(&mut self) {
        let ids: Vec<StreamId> = self
            .registry
            .streams
            .values()
            .filter_map(|stream| stream.ingress_id())
            .collect();
        if let Some(sock) = self.sock.as_deref_mut() {
            for id in ids {
                sock.resume_read(id);
            }
        }
        self.schedule_loop_callback();
    }

    pub(crate) fn pause_transactions(&mut self) {
        self.writes_paused = true;
        for stream in self.registry.streams.values_mut() {
            if stream.egress_id().is_some() && !stream.detached {
                stream.txn.pause_egress();
            }
        }
    }

    pub(crate) fn resume_transactions(&mut self) {
        for (id, stream) in self.registry.streams.iter_mut() {
            if stream.detached || stream.txn.is_egress_complete() {
                continue;
            }
            let window = self
                .sock
                .as_deref()
                .and_then(|sock| sock.stream_flow_control(*id).ok())
                .map(|flow| flow.send_window_available)
                .unwrap_or(0);
            if window > 0 {
                stream.txn.resume_egress();
            }
        }
        self.writes_paused = false;
    }

    /// New transactions start egress-paused when the connection has no
    /// buffer space or send window.
    fn set_new_transaction_pause_state(&mut self, id: StreamId) {
        let mut pause_new = self.writes_paused;
        if !pause_new {
            if let Some(sock) = self.sock.as_deref() {
                let no_buffer = sock
                    .connection_buffer_available()
                    .map(|available| available == 0)
                    .unwrap_or(false);
                let no_window = sock
                    .connection_flow_control()
                    .map(|flow| flow.send_window_available == 0)
                    .unwrap_or(false);
                pause_new = no_buffer || no_window;
            }
        }
        if pause_new {
            debug!(stream = %id, "starting egress paused");
            if let Some(stream) = self.registry.streams.get_mut(&id) {
                stream.txn.pause_egress();
            }
        }
    }

    // ------------------------------------------------------------------
    // Control-stream bring-up helpers (called by the dialect strategy).

    pub(crate) fn create_egress_control_stream(&mut self, stream_type: UniStreamType) -> bool {
        let created = match self.sock.as_deref_mut() {
            Some(sock) => sock.create_unidirectional_stream(),
            None => return false,
        };
        let id = match created {
            Ok(id) => id,
            Err(err) => {
                error!(%stream_type, %err, "failed to create unidirectional stream");
                self.on_connection_error(
                    QuicError::Local(LocalErrorCode::ConnectFailed),
                    "failed to create unidirectional stream",
                );
                return false;
            }
        };
        if let Some(sock) = self.sock.as_deref_mut() {
            let _ = sock.set_control_stream(id);
        }
        let mut ctrl = ControlStream::new(stream_type, id);
        ctrl.generate_preface();
        if stream_type.is_control() {
            ctrl.egress_codec = Some(self.codecs.create_control_codec(stream_type));
        }
        debug!(stream = %id, %stream_type, "created egress control stream");
        self.registry.insert_control(ctrl);
        true
    }

    /// Abort a raw stream id that never became a transport (acceptance
    /// rejections). Sends STOP_SENDING on peer-readable halves and resets
    /// writable halves.
    pub(crate) fn abort_raw_stream(
        &mut self,
        dir: ExceptionDirection,
        id: StreamId,
        code: ErrorCode,
    ) {
        let peer_readable =
            id.is_bidirectional() || id.is_peer_initiated(self.direction);
        let self_writable =
            id.is_bidirectional() || id.is_self_initiated(self.direction);
        if dir.is_ingress() && peer_readable {
            if let Some(dialect) = self.dialect {
                dialect.abort_stream(self, id);
            }
            if let Some(sock) = self.sock.as_deref_mut() {
                let _ = sock.stop_sending(id, code.to_code());
            }
        }
        if dir.is_egress() && self_writable {
            if let Some(sock) = self.sock.as_deref_mut() {
                let _ = sock.reset_stream(id, code.to_code());
            }
        }
    }

    // ------------------------------------------------------------------
    // QPACK instruction plumbing.

    /// Move pending encoder-stream instructions onto the encoder stream.
    pub(crate) fn flush_qpack_encoder_instructions(&mut self) {
        let instructions = self
            .codecs
            .qpack()
            .and_then(|qpack| qpack.drain_encoder_instructions());
        if let Some(instructions) = instructions {
            if let Some(ctrl) = self.registry.find_control_mut(UniStreamType::QpackEncoder) {
                ctrl.write_buf.extend_from_slice(&instructions);
                self.schedule_write();
            }
        }
    }

    /// Move pending decoder-stream instructions (header acks) onto the
    /// decoder stream.
    pub(crate) fn flush_qpack_decoder_instructions(&mut self) {
        let instructions = self
            .codecs
            .qpack()
            .and_then(|qpack| qpack.drain_decoder_instructions());
        if let Some(instructions) = instructions {
            if let Some(ctrl) = self.registry.find_control_mut(UniStreamType::QpackDecoder) {
                ctrl.write_buf.extend_from_slice(&instructions);
            }
        }
    }

    /// Session-error entry point shared with the egress scheduler.
    pub(crate) fn handle_control_egress_error(
        &mut self,
        stream_type: UniStreamType,
        err: QuicError,
        kind: SessionError,
    ) {
        self.handle_session_error(
            ErrorSource::Control(stream_type),
            StreamDirection::Egress,
            control_stream_error(err),
            kind,
        );
    }
}
