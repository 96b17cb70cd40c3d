//! Shared test support: a scripted socket, toy codecs, and a recording
//! transaction layer.
//!
//! The toy wire format keeps parsing honest without dragging in a real
//! codec: every frame is `[tag u8][len u32 BE][payload]`. Request streams
//! use tags `H` (headers), `D` (data), `T` (trailers), `E` (end of
//! message); control streams use `S` (settings) and `G` (goaway, 8-byte BE
//! stream id payload).

#![allow(dead_code)]

use bytes::{BufMut, Bytes, BytesMut};
use http::HeaderMap;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use hqmux::codec::{
    CodecFactory, ControlCodec, ControlEvent, QpackApi, RequestCodec, RequestEvent,
};
use hqmux::error::CodecError;
use hqmux::message::HttpMessage;
use hqmux::priority::UrgencyQueue;
use hqmux::settings::{Setting, SettingId, SettingsSnapshot};
use hqmux::txn::{Transaction, TransactionFactory, WriteChunk};
use hqmux::{ErrorCode, Session, SessionConfig, StreamException, UniStreamType};
use hqmux_x::{
    varint, CongestionControl, FlowControlState, LocalErrorCode, QuicError, QuicResult,
    QuicSocket, StreamId, StreamTransportInfo, TransportDirection, TransportInfo,
};

// ---------------------------------------------------------------------
// Frame builders for the toy wire format.

pub fn frame(tag: u8, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(5 + payload.len());
    buf.put_u8(tag);
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(payload);
    buf.freeze()
}

pub fn header_frame(payload: &str) -> Bytes {
    frame(b'H', payload.as_bytes())
}

pub fn data_frame(payload: &[u8]) -> Bytes {
    frame(b'D', payload)
}

pub fn eom_frame() -> Bytes {
    frame(b'E', &[])
}

pub fn goaway_frame(stream_id: u64) -> Bytes {
    frame(b'G', &stream_id.to_be_bytes())
}

pub fn settings_frame(entries: &[(u8, u64)]) -> Bytes {
    let mut payload = Vec::new();
    for (id, value) in entries {
        payload.push(*id);
        payload.extend_from_slice(&value.to_be_bytes());
    }
    frame(b'S', &payload)
}

pub fn preface_bytes(value: u64) -> Bytes {
    let mut buf = BytesMut::new();
    varint::encode(value, &mut buf).unwrap();
    buf.freeze()
}

fn parse_frame(buf: &[u8]) -> Option<(u8, usize, usize)> {
    if buf.len() < 5 {
        return None;
    }
    let tag = buf[0];
    let len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
    if buf.len() < 5 + len {
        return None;
    }
    Some((tag, 5, len))
}

// ---------------------------------------------------------------------
// Mock socket.

#[derive(Default)]
pub struct ReadState {
    pub buf: BytesMut,
    pub eof: bool,
}

pub struct SockState {
    pub good: bool,
    pub alpn: Option<String>,
    pub direction: TransportDirection,
    next_bidi: u64,
    next_uni: u64,
    pub created_bidi: Vec<StreamId>,
    pub created_uni: Vec<StreamId>,
    pub control_marked: Vec<StreamId>,
    pub reads: HashMap<StreamId, ReadState>,
    /// (stream, bytes accepted, eom) in write order.
    pub write_log: Vec<(StreamId, usize, bool)>,
    pub written: HashMap<StreamId, BytesMut>,
    pub fin_sent: Vec<StreamId>,
    /// Per-stream cap on bytes accepted by a single write_chain call.
    pub write_accept_limit: HashMap<StreamId, usize>,
    pub resets: Vec<(StreamId, u64)>,
    pub stop_sendings: Vec<(StreamId, u64)>,
    pub delivery_callbacks: Vec<(StreamId, u64)>,
    pub conn_flow: FlowControlState,
    pub stream_flow: HashMap<StreamId, FlowControlState>,
    pub default_stream_flow: FlowControlState,
    pub conn_buffer_available: u64,
    pub read_interest: HashMap<StreamId, bool>,
    pub peek_interest: HashMap<StreamId, bool>,
    pub notify_pending_write_calls: usize,
    pub closed: Option<Option<(QuicError, String)>>,
    write_offsets: HashMap<StreamId, u64>,
}

impl SockState {
    pub fn new(direction: TransportDirection, alpn: &str) -> Self {
        // Self-initiated stream id sequences per RFC 9000 Section 2.1.
        let (next_bidi, next_uni) = match direction {
            TransportDirection::Upstream => (0, 2),
            TransportDirection::Downstream => (1, 3),
        };
        Self {
            good: true,
            alpn: Some(alpn.to_string()),
            direction,
            next_bidi,
            next_uni,
            created_bidi: Vec::new(),
            created_uni: Vec::new(),
            control_marked: Vec::new(),
            reads: HashMap::new(),
            write_log: Vec::new(),
            written: HashMap::new(),
            fin_sent: Vec::new(),
            write_accept_limit: HashMap::new(),
            resets: Vec::new(),
            stop_sendings: Vec::new(),
            delivery_callbacks: Vec::new(),
            conn_flow: FlowControlState {
                send_window_available: u64::MAX / 2,
                receive_window_available: u64::MAX / 2,
            },
            stream_flow: HashMap::new(),
            default_stream_flow: FlowControlState {
                send_window_available: u64::MAX / 2,
                receive_window_available: u64::MAX / 2,
            },
            conn_buffer_available: 1 << 20,
            read_interest: HashMap::new(),
            peek_interest: HashMap::new(),
            notify_pending_write_calls: 0,
            closed: None,
            write_offsets: HashMap::new(),
        }
    }

    pub fn push_read(&mut self, id: StreamId, data: Bytes, eof: bool) {
        let state = self.reads.entry(id).or_default();
        state.buf.extend_from_slice(&data);
        state.eof |= eof;
    }

    pub fn written_bytes(&self, id: StreamId) -> Vec<u8> {
        self.written
            .get(&id)
            .map(|buf| buf.to_vec())
            .unwrap_or_default()
    }

    pub fn total_written(&self) -> usize {
        self.write_log.iter().map(|(_, len, _)| len).sum()
    }
}

pub struct MockSocket {
    pub state: Rc<RefCell<SockState>>,
}

impl QuicSocket for MockSocket {
    fn good(&self) -> bool {
        self.state.borrow().good
    }

    fn app_protocol(&self) -> Option<String> {
        self.state.borrow().alpn.clone()
    }

    fn create_bidirectional_stream(&mut self) -> QuicResult<StreamId> {
        let mut state = self.state.borrow_mut();
        if !state.good {
            return Err(QuicError::Local(LocalErrorCode::ConnectionClosed));
        }
        let id = StreamId(state.next_bidi);
        state.next_bidi += 4;
        state.created_bidi.push(id);
        Ok(id)
    }

    fn create_unidirectional_stream(&mut self) -> QuicResult<StreamId> {
        let mut state = self.state.borrow_mut();
        if !state.good {
            return Err(QuicError::Local(LocalErrorCode::ConnectionClosed));
        }
        let id = StreamId(state.next_uni);
        state.next_uni += 4;
        state.created_uni.push(id);
        Ok(id)
    }

    fn set_control_stream(&mut self, id: StreamId) -> QuicResult<()> {
        self.state.borrow_mut().control_marked.push(id);
        Ok(())
    }

    fn read(&mut self, id: StreamId) -> QuicResult<(Bytes, bool)> {
        let mut state = self.state.borrow_mut();
        let read = state.reads.entry(id).or_default();
        let data = read.buf.split().freeze();
        let eof = read.eof;
        Ok((data, eof))
    }

    fn peek(&mut self, id: StreamId) -> QuicResult<Bytes> {
        let mut state = self.state.borrow_mut();
        let read = state.reads.entry(id).or_default();
        Ok(Bytes::copy_from_slice(&read.buf))
    }

    fn consume(&mut self, id: StreamId, amount: usize) -> QuicResult<()> {
        let mut state = self.state.borrow_mut();
        let read = state.reads.entry(id).or_default();
        if read.buf.len() < amount {
            return Err(QuicError::Local(LocalErrorCode::InternalError));
        }
        let _ = read.buf.split_to(amount);
        Ok(())
    }

    fn write_chain(&mut self, id: StreamId, data: Bytes, eom: bool) -> QuicResult<Bytes> {
        let mut state = self.state.borrow_mut();
        if !state.good {
            return Err(QuicError::Local(LocalErrorCode::ConnectionClosed));
        }
        let cap = state
            .write_accept_limit
            .get(&id)
            .copied()
            .unwrap_or(usize::MAX);
        let accepted = data.len().min(cap);
        let leftover = data.slice(accepted..);
        state
            .written
            .entry(id)
            .or_default()
            .extend_from_slice(&data[..accepted]);
        *state.write_offsets.entry(id).or_default() += accepted as u64;
        let fin = eom && leftover.is_empty();
        if fin {
            state.fin_sent.push(id);
        }
        state.write_log.push((id, accepted, fin));
        Ok(leftover)
    }

    fn reset_stream(&mut self, id: StreamId, error_code: u64) -> QuicResult<()> {
        self.state.borrow_mut().resets.push((id, error_code));
        Ok(())
    }

    fn stop_sending(&mut self, id: StreamId, error_code: u64) -> QuicResult<()> {
        self.state.borrow_mut().stop_sendings.push((id, error_code));
        Ok(())
    }

    fn register_delivery_callback(&mut self, id: StreamId, offset: u64) -> QuicResult<()> {
        self.state.borrow_mut().delivery_callbacks.push((id, offset));
        Ok(())
    }

    fn stream_write_offset(&self, id: StreamId) -> QuicResult<u64> {
        Ok(self
            .state
            .borrow()
            .write_offsets
            .get(&id)
            .copied()
            .unwrap_or(0))
    }

    fn stream_write_buffered_bytes(&self, _id: StreamId) -> QuicResult<u64> {
        Ok(0)
    }

    fn connection_flow_control(&self) -> QuicResult<FlowControlState> {
        Ok(self.state.borrow().conn_flow)
    }

    fn stream_flow_control(&self, id: StreamId) -> QuicResult<FlowControlState> {
        let state = self.state.borrow();
        Ok(state
            .stream_flow
            .get(&id)
            .copied()
            .unwrap_or(state.default_stream_flow))
    }

    fn set_stream_flow_control_window(&mut self, id: StreamId, size: u64) -> QuicResult<()> {
        let mut state = self.state.borrow_mut();
        let default = state.default_stream_flow;
        let flow = state.stream_flow.entry(id).or_insert(default);
        flow.receive_window_available = size;
        Ok(())
    }

    fn connection_buffer_available(&self) -> QuicResult<u64> {
        Ok(self.state.borrow().conn_buffer_available)
    }

    fn set_read_interest(&mut self, id: StreamId, interested: bool) {
        self.state.borrow_mut().read_interest.insert(id, interested);
    }

    fn set_peek_interest(&mut self, id: StreamId, interested: bool) {
        self.state.borrow_mut().peek_interest.insert(id, interested);
    }

    fn pause_read(&mut self, _id: StreamId) {}

    fn resume_read(&mut self, _id: StreamId) {}

    fn notify_pending_write(&mut self) {
        self.state.borrow_mut().notify_pending_write_calls += 1;
    }

    fn transport_info(&self) -> TransportInfo {
        TransportInfo {
            congestion_control: CongestionControl::Cubic,
            ..Default::default()
        }
    }

    fn stream_transport_info(&self, _id: StreamId) -> QuicResult<StreamTransportInfo> {
        Ok(StreamTransportInfo::default())
    }

    fn close(&mut self, error: Option<(QuicError, String)>) {
        let mut state = self.state.borrow_mut();
        state.good = false;
        state.closed = Some(error);
    }
}

// ---------------------------------------------------------------------
// Toy request codec.

pub struct TestRequestCodec;

impl TestRequestCodec {
    fn parse_headers(payload: &[u8]) -> HttpMessage {
        let text = String::from_utf8_lossy(payload);
        let close = text.contains(";close");
        let mut msg = if text.starts_with("RSP") {
            HttpMessage::response(http::StatusCode::OK)
        } else {
            HttpMessage::request(http::Method::GET, http::Uri::from_static("/"))
        };
        if close {
            msg = msg.with_header(http::header::CONNECTION, "close");
        }
        msg
    }
}

impl RequestCodec for TestRequestCodec {
    fn on_ingress(&mut self, buf: &mut BytesMut) -> Result<Vec<RequestEvent>, CodecError> {
        let mut events = Vec::new();
        while let Some((tag, header, len)) = parse_frame(buf) {
            let payload = buf[header..header + len].to_vec();
            match tag {
                b'H' => {
                    events.push(RequestEvent::MessageBegin);
                    events.push(RequestEvent::HeadersComplete(Self::parse_headers(&payload)));
                }
                b'D' => events.push(RequestEvent::Body(Bytes::from(payload))),
                b'T' => events.push(RequestEvent::Trailers(HeaderMap::new())),
                b'E' => events.push(RequestEvent::MessageComplete),
                b'X' => {
                    return Err(CodecError::connection(
                        ErrorCode::GeneralProtocolError,
                        "poisoned frame",
                    ))
                }
                _ => {
                    return Err(CodecError::stream(
                        ErrorCode::FrameError,
                        format!("unknown frame tag {tag}"),
                    ))
                }
            }
            let _ = buf.split_to(header + len);
        }
        Ok(events)
    }

    fn on_ingress_eof(&mut self) -> Result<Vec<RequestEvent>, CodecError> {
        Ok(Vec::new())
    }

    fn generate_header(
        &mut self,
        msg: &HttpMessage,
        include_eom: bool,
    ) -> Result<Bytes, CodecError> {
        let mut payload = if msg.is_request() {
            "REQ".to_string()
        } else {
            "RSP".to_string()
        };
        if !msg.wants_keepalive() {
            payload.push_str(";close");
        }
        let mut out = BytesMut::new();
        out.extend_from_slice(&header_frame(&payload));
        if include_eom {
            out.extend_from_slice(&eom_frame());
        }
        Ok(out.freeze())
    }

    fn generate_body(&mut self, body: Bytes, include_eom: bool) -> Result<Bytes, CodecError> {
        let mut out = BytesMut::new();
        out.extend_from_slice(&data_frame(&body));
        if include_eom {
            out.extend_from_slice(&eom_frame());
        }
        Ok(out.freeze())
    }

    fn generate_trailers(&mut self, _trailers: &HeaderMap) -> Result<Bytes, CodecError> {
        Ok(frame(b'T', &[]))
    }

    fn generate_eom(&mut self) -> Result<Bytes, CodecError> {
        Ok(eom_frame())
    }

    fn generate_push_promise(
        &mut self,
        _push_id: u64,
        _msg: &HttpMessage,
    ) -> Result<Bytes, CodecError> {
        Ok(frame(b'P', &[]))
    }

    fn generate_goaway(&mut self) -> Result<Bytes, CodecError> {
        Ok(Bytes::new())
    }

    fn on_ingress_data_available(&mut self, stream_offset: u64) -> Result<u64, CodecError> {
        Ok(stream_offset)
    }

    fn on_ingress_data_expired(&mut self, stream_offset: u64) -> Result<u64, CodecError> {
        Ok(stream_offset)
    }

    fn on_ingress_data_rejected(&mut self, stream_offset: u64) -> Result<u64, CodecError> {
        Ok(stream_offset)
    }
}

// ---------------------------------------------------------------------
// Toy control codec.

pub struct TestControlCodec;

impl ControlCodec for TestControlCodec {
    fn on_ingress(&mut self, buf: &mut BytesMut) -> Result<Vec<ControlEvent>, CodecError> {
        let mut events = Vec::new();
        while let Some((tag, header, len)) = parse_frame(buf) {
            let payload = buf[header..header + len].to_vec();
            match tag {
                b'S' => {
                    let mut settings = Vec::new();
                    for entry in payload.chunks_exact(9) {
                        let value = u64::from_be_bytes(entry[1..9].try_into().unwrap());
                        settings.push(Setting {
                            id: SettingId::from_wire(entry[0] as u64),
                            value,
                        });
                    }
                    events.push(ControlEvent::Settings(settings));
                }
                b'G' => {
                    let bytes: [u8; 8] = payload
                        .get(..8)
                        .and_then(|slice| slice.try_into().ok())
                        .ok_or_else(|| {
                            CodecError::connection(ErrorCode::FrameError, "short goaway")
                        })?;
                    events.push(ControlEvent::Goaway(u64::from_be_bytes(bytes)));
                }
                other => events.push(ControlEvent::Skipped(other as u64)),
            }
            let _ = buf.split_to(header + len);
        }
        Ok(events)
    }

    fn on_ingress_eof(&mut self) -> Result<(), CodecError> {
        Err(CodecError::connection(
            ErrorCode::ClosedCriticalStream,
            "control stream closed",
        ))
    }

    fn generate_settings(&mut self, settings: &SettingsSnapshot) -> Result<Bytes, CodecError> {
        let entries: Vec<(u8, u64)> = settings
            .to_list()
            .into_iter()
            .map(|setting| (setting.id.to_wire() as u8, setting.value))
            .collect();
        Ok(settings_frame(&entries))
    }

    fn generate_goaway(&mut self, last_stream_id: u64) -> Result<Bytes, CodecError> {
        Ok(goaway_frame(last_stream_id))
    }
}

/// Ingress codec for the peer's QPACK streams: swallows instructions.
pub struct QpackIngressCodec;

impl ControlCodec for QpackIngressCodec {
    fn on_ingress(&mut self, buf: &mut BytesMut) -> Result<Vec<ControlEvent>, CodecError> {
        buf.clear();
        Ok(Vec::new())
    }

    fn on_ingress_eof(&mut self) -> Result<(), CodecError> {
        Err(CodecError::connection(
            ErrorCode::ClosedCriticalStream,
            "qpack stream closed",
        ))
    }

    fn generate_settings(&mut self, _settings: &SettingsSnapshot) -> Result<Bytes, CodecError> {
        Ok(Bytes::new())
    }

    fn generate_goaway(&mut self, _last_stream_id: u64) -> Result<Bytes, CodecError> {
        Ok(Bytes::new())
    }
}

// ---------------------------------------------------------------------
// QPACK state recorder.

#[derive(Default)]
pub struct QpackState {
    pub applied: Vec<(u64, u64)>,
    pub decoder_table_capacity: Option<u64>,
    pub max_blocking: Option<u64>,
    pub encoder_instructions: VecDeque<Bytes>,
    pub decoder_instructions: VecDeque<Bytes>,
    pub insert_count_increments: VecDeque<Bytes>,
    pub cancelled: Vec<StreamId>,
}

pub struct TestQpack {
    pub state: Rc<RefCell<QpackState>>,
}

impl QpackApi for TestQpack {
    fn apply_settings(&mut self, table_capacity: u64, blocked_streams: u64) {
        self.state
            .borrow_mut()
            .applied
            .push((table_capacity, blocked_streams));
    }

    fn set_decoder_table_capacity(&mut self, capacity: u64) {
        self.state.borrow_mut().decoder_table_capacity = Some(capacity);
    }

    fn set_max_blocking(&mut self, blocked_streams: u64) {
        self.state.borrow_mut().max_blocking = Some(blocked_streams);
    }

    fn drain_encoder_instructions(&mut self) -> Option<Bytes> {
        self.state.borrow_mut().encoder_instructions.pop_front()
    }

    fn drain_decoder_instructions(&mut self) -> Option<Bytes> {
        self.state.borrow_mut().decoder_instructions.pop_front()
    }

    fn encode_insert_count_increment(&mut self) -> Option<Bytes> {
        self.state.borrow_mut().insert_count_increments.pop_front()
    }

    fn encode_cancel_stream(&mut self, id: StreamId) -> Bytes {
        self.state.borrow_mut().cancelled.push(id);
        Bytes::from_static(b"CANCEL")
    }
}

pub struct TestCodecFactory {
    pub qpack: Option<TestQpack>,
}

impl CodecFactory for TestCodecFactory {
    fn create_request_codec(&mut self, _id: StreamId) -> Box<dyn RequestCodec> {
        Box::new(TestRequestCodec)
    }

    fn create_control_codec(&mut self, stream_type: UniStreamType) -> Box<dyn ControlCodec> {
        if stream_type.is_qpack() {
            Box::new(QpackIngressCodec)
        } else {
            Box::new(TestControlCodec)
        }
    }

    fn qpack(&mut self) -> Option<&mut dyn QpackApi> {
        self.qpack
            .as_mut()
            .map(|qpack| qpack as &mut dyn QpackApi)
    }
}

// ---------------------------------------------------------------------
// Recording transaction.

#[derive(Debug, PartialEq)]
pub enum TxnEvent {
    HeadersComplete { close: bool },
    Body(usize),
    Trailers,
    Eom,
    Timeout,
    Error(hqmux::SessionError),
    Goaway,
    HeaderAck,
    BodyAck(u64),
    BodyCancel(u64),
    LastByteAck,
    BodyPeek(u64),
    BodySkipped(u64),
    BodyRejected(u64),
    Paused,
    Resumed,
}

#[derive(Default)]
pub struct TxnState {
    pub events: Vec<TxnEvent>,
    pub body_remaining: usize,
    pub eom_queued: bool,
    pub complete: bool,
    pub ingress_started: bool,
    pub egress_paused: bool,
    pub egress_complete: bool,
    pub pending_byte_events: i64,
}

impl TxnState {
    pub fn errors(&self) -> Vec<hqmux::SessionError> {
        self.events
            .iter()
            .filter_map(|event| match event {
                TxnEvent::Error(kind) => Some(*kind),
                _ => None,
            })
            .collect()
    }
}

pub struct RecordingTransaction {
    pub state: Rc<RefCell<TxnState>>,
}

impl Transaction for RecordingTransaction {
    fn on_ingress_headers_complete(&mut self, msg: HttpMessage) {
        let mut state = self.state.borrow_mut();
        state.ingress_started = true;
        state.events.push(TxnEvent::HeadersComplete {
            close: !msg.wants_keepalive(),
        });
    }

    fn on_ingress_body(&mut self, body: Bytes) {
        let mut state = self.state.borrow_mut();
        state.ingress_started = true;
        state.events.push(TxnEvent::Body(body.len()));
    }

    fn on_ingress_trailers(&mut self, _trailers: HeaderMap) {
        self.state.borrow_mut().events.push(TxnEvent::Trailers);
    }

    fn on_ingress_eom(&mut self) {
        self.state.borrow_mut().events.push(TxnEvent::Eom);
    }

    fn on_ingress_timeout(&mut self) {
        self.state.borrow_mut().events.push(TxnEvent::Timeout);
    }

    fn on_error(&mut self, ex: StreamException) {
        let mut state = self.state.borrow_mut();
        state.events.push(TxnEvent::Error(ex.kind));
        state.complete = true;
        state.egress_complete = true;
    }

    fn on_goaway(&mut self, _code: ErrorCode) {
        self.state.borrow_mut().events.push(TxnEvent::Goaway);
    }

    fn on_write_ready(&mut self, max_body: usize, _ratio: f64) -> WriteChunk {
        let mut state = self.state.borrow_mut();
        let take = state.body_remaining.min(max_body);
        state.body_remaining -= take;
        let eom = state.eom_queued && state.body_remaining == 0;
        if eom {
            state.eom_queued = false;
            state.egress_complete = true;
        }
        WriteChunk {
            body: Bytes::from(vec![b'b'; take]),
            eom,
        }
    }

    fn pause_egress(&mut self) {
        let mut state = self.state.borrow_mut();
        if !state.egress_paused {
            state.egress_paused = true;
            state.events.push(TxnEvent::Paused);
        }
    }

    fn resume_egress(&mut self) {
        let mut state = self.state.borrow_mut();
        if state.egress_paused {
            state.egress_paused = false;
            state.events.push(TxnEvent::Resumed);
        }
    }

    fn has_pending_body(&self) -> bool {
        self.state.borrow().body_remaining > 0
    }

    fn is_egress_eom_queued(&self) -> bool {
        let state = self.state.borrow();
        state.eom_queued && state.body_remaining == 0
    }

    fn is_egress_complete(&self) -> bool {
        self.state.borrow().egress_complete
    }

    fn is_egress_paused(&self) -> bool {
        self.state.borrow().egress_paused
    }

    fn is_ingress_started(&self) -> bool {
        self.state.borrow().ingress_started
    }

    fn on_last_egress_header_byte_acked(&mut self) {
        self.state.borrow_mut().events.push(TxnEvent::HeaderAck);
    }

    fn on_egress_body_bytes_acked(&mut self, body_offset: u64) {
        self.state
            .borrow_mut()
            .events
            .push(TxnEvent::BodyAck(body_offset));
    }

    fn on_egress_body_delivery_canceled(&mut self, body_offset: u64) {
        self.state
            .borrow_mut()
            .events
            .push(TxnEvent::BodyCancel(body_offset));
    }

    fn on_egress_last_byte_acked(&mut self) {
        self.state.borrow_mut().events.push(TxnEvent::LastByteAck);
    }

    fn on_ingress_body_peek(&mut self, body_offset: u64, _data: Bytes) {
        self.state
            .borrow_mut()
            .events
            .push(TxnEvent::BodyPeek(body_offset));
    }

    fn on_ingress_body_skipped(&mut self, body_offset: u64) {
        self.state
            .borrow_mut()
            .events
            .push(TxnEvent::BodySkipped(body_offset));
    }

    fn on_ingress_body_rejected(&mut self, body_offset: u64) {
        self.state
            .borrow_mut()
            .events
            .push(TxnEvent::BodyRejected(body_offset));
    }

    fn increment_pending_byte_events(&mut self) {
        self.state.borrow_mut().pending_byte_events += 1;
    }

    fn decrement_pending_byte_events(&mut self) {
        self.state.borrow_mut().pending_byte_events -= 1;
    }

    fn is_complete(&self) -> bool {
        self.state.borrow().complete
    }
}

#[derive(Default)]
pub struct TxnFactoryState {
    /// Transactions created for peer-initiated streams, in arrival order.
    pub created: Vec<(StreamId, bool, Rc<RefCell<TxnState>>)>,
}

impl TxnFactoryState {
    pub fn txn_for(&self, id: StreamId) -> Rc<RefCell<TxnState>> {
        self.created
            .iter()
            .find(|(sid, _, _)| *sid == id)
            .map(|(_, _, state)| state.clone())
            .expect("no transaction created for stream")
    }
}

pub struct TestTxnFactory {
    pub state: Rc<RefCell<TxnFactoryState>>,
}

impl TransactionFactory for TestTxnFactory {
    fn new_transaction(&mut self, id: StreamId, pushed: bool) -> Box<dyn Transaction> {
        let txn_state = Rc::new(RefCell::new(TxnState::default()));
        self.state
            .borrow_mut()
            .created
            .push((id, pushed, txn_state.clone()));
        Box::new(RecordingTransaction { state: txn_state })
    }
}

// ---------------------------------------------------------------------
// Harness.

pub struct Harness {
    pub session: Session,
    pub sock: Rc<RefCell<SockState>>,
    pub qpack: Rc<RefCell<QpackState>>,
    pub txns: Rc<RefCell<TxnFactoryState>>,
}

impl Harness {
    /// Build a session, run transport-ready, and hand back the mock
    /// handles.
    pub fn new(direction: TransportDirection, alpn: &str) -> Self {
        Self::with_config(direction, alpn, SessionConfig::default())
    }

    pub fn with_config(direction: TransportDirection, alpn: &str, config: SessionConfig) -> Self {
        let sock = Rc::new(RefCell::new(SockState::new(direction, alpn)));
        let qpack = Rc::new(RefCell::new(QpackState::default()));
        let txns = Rc::new(RefCell::new(TxnFactoryState::default()));

        let has_qpack = alpn.starts_with("h3");
        let codecs = TestCodecFactory {
            qpack: has_qpack.then(|| TestQpack {
                state: qpack.clone(),
            }),
        };
        let mut session = Session::new(
            Box::new(MockSocket { state: sock.clone() }),
            direction,
            config,
            Box::new(codecs),
            Box::new(TestTxnFactory {
                state: txns.clone(),
            }),
            Box::new(UrgencyQueue::new()),
        );
        assert!(session.on_transport_ready(), "transport bring-up failed");
        Self {
            session,
            sock,
            qpack,
            txns,
        }
    }

    /// Run loop callbacks until the session stops asking for them.
    pub fn run_loops(&mut self) {
        let mut guard = 0;
        while self.session.needs_loop_callback() {
            self.session.run_loop_callback();
            guard += 1;
            assert!(guard < 64, "loop callback did not settle");
        }
    }

    /// Deliver a writeability callback and drain the loop.
    pub fn write_ready(&mut self, budget: u64) {
        self.session.on_connection_write_ready(budget);
        self.run_loops();
    }

    /// New recording transaction handle for locally-initiated requests.
    pub fn local_txn(&self) -> (Rc<RefCell<TxnState>>, Box<dyn Transaction>) {
        let state = Rc::new(RefCell::new(TxnState::default()));
        (
            state.clone(),
            Box::new(RecordingTransaction { state }),
        )
    }

    /// Feed bytes to a stream and fire its read callback.
    pub fn deliver(&mut self, id: StreamId, data: Bytes, eof: bool) {
        self.sock.borrow_mut().push_read(id, data, eof);
        self.session.on_read_available(id);
        self.run_loops();
    }

    /// Open a peer unidirectional stream carrying `preface` and classify
    /// it.
    pub fn open_peer_uni(&mut self, id: StreamId, preface: Bytes) {
        self.session.on_new_unidirectional_stream(id);
        self.sock.borrow_mut().push_read(id, preface, false);
        self.session.on_peek_available(id);
        self.run_loops();
    }

    /// The control stream's egress id (first created unidirectional
    /// stream).
    pub fn control_egress_id(&self) -> StreamId {
        self.sock.borrow().created_uni[0]
    }
}
