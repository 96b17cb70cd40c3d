//! hqmux-x: Transport Bridge Interface for the HTTP-over-QUIC Session Core
//!
//! This crate is the seam between the session core (`hqmux`) and whatever
//! QUIC transport the embedding process runs. The session core never talks
//! to a socket directly; it consumes the [`QuicSocket`] trait and is driven
//! through its own callback entry points by the event loop that owns the
//! transport.
//!
//! ## Design
//! - **Sans-io**: nothing here blocks or polls. Reads, writes, peeks and
//!   flow-control queries are synchronous calls into transport state; the
//!   transport notifies the session of readiness through the session's own
//!   `on_*` methods.
//! - **Zero-copy**: all payloads travel as `bytes::Bytes`.
//! - **Three-class errors**: every fallible transport operation reports a
//!   [`QuicError`] that is either local, transport-level, or an application
//!   error code from the peer. The session core's error taxonomy depends on
//!   this distinction.

#![forbid(unsafe_code)]

pub mod varint;

use bytes::Bytes;
use std::time::Duration;

/// Unique identifier for a stream within a connection.
///
/// The two least significant bits encode initiator and directionality
/// (RFC 9000 Section 2.1):
/// - Bit 0: initiator (0 = client, 1 = server)
/// - Bit 1: direction (0 = bidirectional, 1 = unidirectional)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u64);

/// Maximum stream id representable in a QUIC varint (2^62 - 1).
///
/// This is the limit carried by the first GOAWAY of a graceful shutdown.
pub const MAX_STREAM_ID: u64 = varint::VARINT_MAX;

impl StreamId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    pub fn is_bidirectional(&self) -> bool {
        (self.0 & 0x02) == 0
    }

    pub fn is_unidirectional(&self) -> bool {
        (self.0 & 0x02) != 0
    }

    pub fn is_client_initiated(&self) -> bool {
        (self.0 & 0x01) == 0
    }

    pub fn is_server_initiated(&self) -> bool {
        (self.0 & 0x01) != 0
    }

    /// True if the peer of an endpoint with the given role opened this stream.
    pub fn is_peer_initiated(&self, direction: TransportDirection) -> bool {
        match direction {
            TransportDirection::Upstream => self.is_server_initiated(),
            TransportDirection::Downstream => self.is_client_initiated(),
        }
    }

    /// True if an endpoint with the given role opened this stream itself.
    pub fn is_self_initiated(&self, direction: TransportDirection) -> bool {
        !self.is_peer_initiated(direction)
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for StreamId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Which end of the connection a session plays.
///
/// An upstream session is the client side (it initiates requests); a
/// downstream session is the server side (it serves them).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportDirection {
    Upstream,
    Downstream,
}

impl TransportDirection {
    pub fn is_upstream(self) -> bool {
        matches!(self, TransportDirection::Upstream)
    }

    pub fn is_downstream(self) -> bool {
        matches!(self, TransportDirection::Downstream)
    }
}

impl std::fmt::Display for TransportDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportDirection::Upstream => write!(f, "upstream"),
            TransportDirection::Downstream => write!(f, "downstream"),
        }
    }
}

/// Half of a stream, from the session's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamDirection {
    Ingress,
    Egress,
}

/// Locally-generated transport error conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LocalErrorCode {
    /// Graceful local close; never escalated to a connection drop.
    #[error("no error")]
    NoError,

    /// Handshake or stream-creation failure.
    #[error("connect failed")]
    ConnectFailed,

    /// Operation on a stream the transport does not know about.
    #[error("stream does not exist")]
    StreamNotExists,

    /// Operation on a closed connection.
    #[error("connection closed")]
    ConnectionClosed,

    /// The transport refused to arm a requested callback.
    #[error("callback not available")]
    CallbackNotAvailable,

    /// Catch-all for transport-internal failures.
    #[error("internal error")]
    InternalError,
}

/// Error reported by a [`QuicSocket`] operation.
///
/// The three classes matter to the session core: application errors carry a
/// peer-assigned HTTP error code, local errors describe this endpoint's
/// transport state, and transport errors are QUIC protocol failures below
/// the HTTP layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QuicError {
    #[error("local error: {0}")]
    Local(LocalErrorCode),

    #[error("transport error code {0:#x}")]
    Transport(u64),

    #[error("application error code {0:#x}")]
    Application(u64),
}

impl QuicError {
    pub fn is_application(&self) -> bool {
        matches!(self, QuicError::Application(_))
    }

    pub fn as_application_code(&self) -> Option<u64> {
        match self {
            QuicError::Application(code) => Some(*code),
            _ => None,
        }
    }

    pub fn as_local_code(&self) -> Option<LocalErrorCode> {
        match self {
            QuicError::Local(code) => Some(*code),
            _ => None,
        }
    }
}

/// Result type for socket operations.
pub type QuicResult<T> = std::result::Result<T, QuicError>;

/// Flow control snapshot for the connection or for a single stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlowControlState {
    /// Bytes this endpoint may still send before hitting the peer's limit.
    pub send_window_available: u64,

    /// Bytes the peer may still send before hitting this endpoint's limit.
    pub receive_window_available: u64,
}

/// Congestion control algorithm in use on the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CongestionControl {
    #[default]
    Cubic,
    NewReno,
    Bbr,
    None,
}

impl std::fmt::Display for CongestionControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CongestionControl::Cubic => write!(f, "cubic"),
            CongestionControl::NewReno => write!(f, "newreno"),
            CongestionControl::Bbr => write!(f, "bbr"),
            CongestionControl::None => write!(f, "none"),
        }
    }
}

/// Connection-level transport statistics snapshot.
#[derive(Debug, Clone, Default)]
pub struct TransportInfo {
    pub srtt: Duration,
    pub rttvar: Duration,
    pub congestion_window: u64,
    pub mss: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_retransmitted: u64,
    pub pto_count: u64,
    pub congestion_control: CongestionControl,
}

/// Per-stream transport statistics snapshot.
#[derive(Debug, Clone, Default)]
pub struct StreamTransportInfo {
    /// Total time the stream head was blocked behind a loss hole.
    pub total_head_of_line_blocked_time: Duration,

    /// Number of distinct head-of-line blocking events.
    pub hol_blocked_count: u64,

    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// The QUIC transport abstraction the session core consumes.
///
/// Implementations wrap a real QUIC connection (or, in tests, a scripted
/// mock). The session calls these methods synchronously from inside its own
/// callback entry points; none of them may block.
///
/// ## Readiness signalling
/// The socket does not call the session back directly. Instead:
/// - `set_read_interest` / `set_peek_interest` tell the transport which
///   streams the session wants `on_read_available` / `on_peek_available`
///   notifications for;
/// - `notify_pending_write` asks for a single future
///   `on_connection_write_ready(budget)` callback;
/// - `register_delivery_callback` asks for `on_delivery_ack(id, offset)` or
///   `on_canceled(id, offset)` when the peer acknowledges (or the stream
///   abandons) the byte at `offset`.
pub trait QuicSocket {
    /// Whether the connection is usable for new streams and writes.
    fn good(&self) -> bool;

    /// Application protocol negotiated during the handshake, if any.
    fn app_protocol(&self) -> Option<String>;

    fn create_bidirectional_stream(&mut self) -> QuicResult<StreamId>;

    fn create_unidirectional_stream(&mut self) -> QuicResult<StreamId>;

    /// Mark a stream as a protocol control stream. Control streams are
    /// exempt from transport-level idle teardown.
    fn set_control_stream(&mut self, id: StreamId) -> QuicResult<()>;

    /// Read all currently buffered data. Returns the data and whether the
    /// peer finished the stream.
    fn read(&mut self, id: StreamId) -> QuicResult<(Bytes, bool)>;

    /// Look at buffered data without consuming it.
    fn peek(&mut self, id: StreamId) -> QuicResult<Bytes>;

    /// Consume `amount` bytes previously observed via `peek`.
    fn consume(&mut self, id: StreamId, amount: usize) -> QuicResult<()>;

    /// Write a chain of bytes, optionally finishing the stream.
    ///
    /// Returns the suffix the transport refused to accept (empty when the
    /// full chain was taken). Callers are expected to respect flow control,
    /// so a non-empty leftover is unusual but must be handled.
    fn write_chain(&mut self, id: StreamId, data: Bytes, eom: bool) -> QuicResult<Bytes>;

    fn reset_stream(&mut self, id: StreamId, error_code: u64) -> QuicResult<()>;

    fn stop_sending(&mut self, id: StreamId, error_code: u64) -> QuicResult<()>;

    /// Arm a delivery callback for the byte at `offset` on `id`.
    fn register_delivery_callback(&mut self, id: StreamId, offset: u64) -> QuicResult<()>;

    /// Next write offset for the stream (bytes handed to the transport).
    fn stream_write_offset(&self, id: StreamId) -> QuicResult<u64>;

    /// Bytes accepted by the transport but not yet packetized.
    fn stream_write_buffered_bytes(&self, id: StreamId) -> QuicResult<u64>;

    fn connection_flow_control(&self) -> QuicResult<FlowControlState>;

    fn stream_flow_control(&self, id: StreamId) -> QuicResult<FlowControlState>;

    /// Set the receive flow-control window for a stream.
    fn set_stream_flow_control_window(&mut self, id: StreamId, size: u64) -> QuicResult<()>;

    /// Bytes of connection-level write buffer space still available.
    fn connection_buffer_available(&self) -> QuicResult<u64>;

    fn set_read_interest(&mut self, id: StreamId, interested: bool);

    fn set_peek_interest(&mut self, id: StreamId, interested: bool);

    fn pause_read(&mut self, id: StreamId);

    fn resume_read(&mut self, id: StreamId);

    /// Request one writeability callback for the connection.
    fn notify_pending_write(&mut self);

    fn transport_info(&self) -> TransportInfo;

    fn stream_transport_info(&self, id: StreamId) -> QuicResult<StreamTransportInfo>;

    /// Close the connection. `None` means a graceful, error-free close.
    fn close(&mut self, error: Option<(QuicError, String)>);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_id_direction_bits() {
        assert!(StreamId(0).is_bidirectional());
        assert!(StreamId(0).is_client_initiated());
        assert!(StreamId(1).is_server_initiated());
        assert!(StreamId(2).is_unidirectional());
        assert!(StreamId(3).is_unidirectional());
        assert!(StreamId(3).is_server_initiated());
        assert!(StreamId(4).is_bidirectional());
    }

    #[test]
    fn stream_id_peer_initiated_depends_on_role() {
        let client_bidi = StreamId(0);
        assert!(client_bidi.is_peer_initiated(TransportDirection::Downstream));
        assert!(!client_bidi.is_peer_initiated(TransportDirection::Upstream));
        assert!(client_bidi.is_self_initiated(TransportDirection::Upstream));

        let server_uni = StreamId(3);
        assert!(server_uni.is_peer_initiated(TransportDirection::Upstream));
        assert!(!server_uni.is_peer_initiated(TransportDirection::Downstream));
    }

    #[test]
    fn quic_error_classes() {
        assert!(QuicError::Application(0x0103).is_application());
        assert_eq!(QuicError::Application(0x0103).as_application_code(), Some(0x0103));
        assert_eq!(
            QuicError::Local(LocalErrorCode::NoError).as_local_code(),
            Some(LocalErrorCode::NoError)
        );
        assert_eq!(QuicError::Transport(7).as_application_code(), None);
    }
}
