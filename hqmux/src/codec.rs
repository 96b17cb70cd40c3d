//! Pluggable codec interfaces.
//!
//! The session core treats all HTTP framing as opaque translation: bytes in,
//! events out on ingress; messages in, bytes out on egress. One codec family
//! per dialect implements these traits (HTTP/1.x framing for the legacy v1
//! dialect, the framed stream codec plus QPACK for HTTP/3); the core never
//! looks inside the bytes.
//!
//! Ingress parsing returns events instead of invoking callbacks, so a codec
//! never holds a reference back into the session. This is what lets control
//! stream parsing target session-level handlers while a reentrant egress
//! write (say, a GOAWAY queued in response to a received SETTINGS) goes to
//! the stream's own write buffer with no codec juggling.

use bytes::{Bytes, BytesMut};
use http::HeaderMap;

use crate::error::CodecError;
use crate::message::HttpMessage;
use crate::settings::{Setting, SettingsSnapshot};
use crate::stream_type::UniStreamType;
use hqmux_x::StreamId;

/// Event produced while parsing a request stream.
#[derive(Debug)]
pub enum RequestEvent {
    MessageBegin,
    HeadersComplete(HttpMessage),
    Body(Bytes),
    Trailers(HeaderMap),
    MessageComplete,
    /// A push promise is starting; subsequent header events belong to it.
    PushPromiseBegin(u64),
}

/// Event produced while parsing a control stream.
#[derive(Debug)]
pub enum ControlEvent {
    Settings(Vec<Setting>),
    Goaway(u64),
    /// A recognized but uninteresting frame (PRIORITY_UPDATE and friends).
    Skipped(u64),
}

/// Byte-in/event-out and message-in/byte-out translator for one request
/// stream.
pub trait RequestCodec {
    /// Parse as much of `buf` as possible, consuming parsed bytes in place.
    ///
    /// A codec that needs more data returns with bytes left unconsumed and
    /// no events; the transport buffers the remainder until the next read.
    fn on_ingress(&mut self, buf: &mut BytesMut) -> Result<Vec<RequestEvent>, CodecError>;

    /// The peer finished the stream.
    fn on_ingress_eof(&mut self) -> Result<Vec<RequestEvent>, CodecError>;

    fn generate_header(
        &mut self,
        msg: &HttpMessage,
        include_eom: bool,
    ) -> Result<Bytes, CodecError>;

    fn generate_body(&mut self, body: Bytes, include_eom: bool) -> Result<Bytes, CodecError>;

    fn generate_trailers(&mut self, trailers: &HeaderMap) -> Result<Bytes, CodecError>;

    /// Framing-layer end of message. May be empty for codecs whose EOM is
    /// carried by the transport FIN alone.
    fn generate_eom(&mut self) -> Result<Bytes, CodecError>;

    fn generate_push_promise(
        &mut self,
        push_id: u64,
        msg: &HttpMessage,
    ) -> Result<Bytes, CodecError>;

    /// Mark the codec as draining. Legacy framed codecs add
    /// `Connection: close` to the next generated message; framed dialects
    /// return no bytes.
    fn generate_goaway(&mut self) -> Result<Bytes, CodecError>;

    /// Translate a transport stream offset into a body offset, for the
    /// partial-reliability peek path.
    fn on_ingress_data_available(&mut self, stream_offset: u64) -> Result<u64, CodecError>;

    /// Translate an expired-data offset into a body offset.
    fn on_ingress_data_expired(&mut self, stream_offset: u64) -> Result<u64, CodecError>;

    /// Translate a rejected-data offset into a body offset.
    fn on_ingress_data_rejected(&mut self, stream_offset: u64) -> Result<u64, CodecError>;
}

/// Translator for one ingress control stream (or QPACK stream, whose
/// instructions produce no events).
pub trait ControlCodec {
    fn on_ingress(&mut self, buf: &mut BytesMut) -> Result<Vec<ControlEvent>, CodecError>;

    /// The peer finished the stream. Closing a critical stream is a
    /// connection error; codecs signal that by returning `Err`.
    fn on_ingress_eof(&mut self) -> Result<(), CodecError>;

    fn generate_settings(&mut self, settings: &SettingsSnapshot) -> Result<Bytes, CodecError>;

    fn generate_goaway(&mut self, last_stream_id: u64) -> Result<Bytes, CodecError>;
}

/// Shared QPACK compression state, owned by the codec factory and consulted
/// by the session for settings plumbing and stream lifecycle side effects.
pub trait QpackApi {
    /// Apply the peer's SETTINGS to the encoder side.
    fn apply_settings(&mut self, table_capacity: u64, blocked_streams: u64);

    /// Configure the local decoder table capacity (from our SETTINGS).
    fn set_decoder_table_capacity(&mut self, capacity: u64);

    /// Configure the local decoder's max blocked streams.
    fn set_max_blocking(&mut self, blocked_streams: u64);

    /// Encoder-stream instructions produced since the last drain.
    fn drain_encoder_instructions(&mut self) -> Option<Bytes>;

    /// Decoder-stream instructions (header acks) produced since the last
    /// drain.
    fn drain_decoder_instructions(&mut self) -> Option<Bytes>;

    /// Pending insert-count increment, if the decoder accumulated one.
    fn encode_insert_count_increment(&mut self) -> Option<Bytes>;

    /// Cancel instruction for an aborted stream's header block.
    fn encode_cancel_stream(&mut self, id: StreamId) -> Bytes;
}

/// Factory producing the codecs for the negotiated dialect.
pub trait CodecFactory {
    fn create_request_codec(&mut self, id: StreamId) -> Box<dyn RequestCodec>;

    /// Create the ingress codec for a classified unidirectional stream.
    fn create_control_codec(&mut self, stream_type: UniStreamType) -> Box<dyn ControlCodec>;

    /// The shared QPACK state, for dialects that have one.
    fn qpack(&mut self) -> Option<&mut dyn QpackApi>;
}
