//! Error types and error code mappings.
//!
//! Two layers of errors live here. [`ErrorCode`] is the HTTP/3 application
//! error code space (RFC 9114 Section 8.1) carried on the wire in
//! RESET_STREAM, STOP_SENDING and CONNECTION_CLOSE frames. [`SessionError`]
//! is the session-level taxonomy surfaced to the connection observer and to
//! transactions when something goes wrong: it classifies *why* rather than
//! *what code went on the wire*.

use hqmux_x::{LocalErrorCode, QuicError, StreamDirection};

/// HTTP/3 application error codes (RFC 9114 Section 8.1).
///
/// Connection errors close the whole connection; stream errors reset only
/// the affected stream. The session core also uses `StreamCreationError`
/// for the legacy dialects' "wrong stream" rejections, for unknown
/// unidirectional stream types, and for duplicate control streams, as
/// RFC 9114 Sections 6.2 and 6.2.1 direct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum ErrorCode {
    /// H3_NO_ERROR: the connection or stream needs to close, but there is
    /// no error to signal.
    NoError = 0x0100,

    /// H3_GENERAL_PROTOCOL_ERROR: peer violated protocol requirements in a
    /// way that does not match a more specific code.
    GeneralProtocolError = 0x0101,

    /// H3_INTERNAL_ERROR: an internal error in the HTTP stack.
    InternalError = 0x0102,

    /// H3_STREAM_CREATION_ERROR: the peer created a stream that will not
    /// be accepted.
    StreamCreationError = 0x0103,

    /// H3_CLOSED_CRITICAL_STREAM: a stream required by the connection was
    /// closed or reset.
    ClosedCriticalStream = 0x0104,

    /// H3_FRAME_UNEXPECTED: a frame not permitted in the current state.
    FrameUnexpected = 0x0105,

    /// H3_FRAME_ERROR: a frame that fails layout or size requirements.
    FrameError = 0x0106,

    /// H3_EXCESSIVE_LOAD: the peer is generating excessive load.
    ExcessiveLoad = 0x0107,

    /// H3_ID_ERROR: a stream id or push id was used incorrectly.
    IdError = 0x0108,

    /// H3_SETTINGS_ERROR: an error in the payload of a SETTINGS frame.
    SettingsError = 0x0109,

    /// H3_MISSING_SETTINGS: no SETTINGS frame at the start of the control
    /// stream.
    MissingSettings = 0x010a,

    /// H3_REQUEST_REJECTED: the request was rejected without any
    /// application processing.
    RequestRejected = 0x010b,

    /// H3_REQUEST_CANCELLED: the request or its response is cancelled.
    RequestCancelled = 0x010c,

    /// H3_REQUEST_INCOMPLETE: the stream terminated without a fully formed
    /// request.
    RequestIncomplete = 0x010d,

    /// H3_MESSAGE_ERROR: a malformed HTTP message.
    MessageError = 0x010e,

    /// H3_CONNECT_ERROR: a CONNECT tunnel was reset or abnormally closed.
    ConnectError = 0x010f,

    /// H3_VERSION_FALLBACK: the operation cannot be served over this
    /// version; retry over HTTP/1.1.
    VersionFallback = 0x0110,

    /// H3_QPACK_DECOMPRESSION_FAILED: an encoded field section could not
    /// be interpreted.
    QpackDecompressionFailed = 0x0200,

    /// H3_QPACK_ENCODER_STREAM_ERROR: an encoder instruction could not be
    /// interpreted.
    QpackEncoderStreamError = 0x0201,

    /// H3_QPACK_DECODER_STREAM_ERROR: a decoder instruction could not be
    /// interpreted.
    QpackDecoderStreamError = 0x0202,
}

impl ErrorCode {
    pub fn to_code(self) -> u64 {
        self as u64
    }

    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            0x0100 => Some(Self::NoError),
            0x0101 => Some(Self::GeneralProtocolError),
            0x0102 => Some(Self::InternalError),
            0x0103 => Some(Self::StreamCreationError),
            0x0104 => Some(Self::ClosedCriticalStream),
            0x0105 => Some(Self::FrameUnexpected),
            0x0106 => Some(Self::FrameError),
            0x0107 => Some(Self::ExcessiveLoad),
            0x0108 => Some(Self::IdError),
            0x0109 => Some(Self::SettingsError),
            0x010a => Some(Self::MissingSettings),
            0x010b => Some(Self::RequestRejected),
            0x010c => Some(Self::RequestCancelled),
            0x010d => Some(Self::RequestIncomplete),
            0x010e => Some(Self::MessageError),
            0x010f => Some(Self::ConnectError),
            0x0110 => Some(Self::VersionFallback),
            0x0200 => Some(Self::QpackDecompressionFailed),
            0x0201 => Some(Self::QpackEncoderStreamError),
            0x0202 => Some(Self::QpackDecoderStreamError),
            _ => None,
        }
    }

    /// Whether this code, when detected locally, requires a connection-level
    /// abort rather than a stream reset.
    pub fn is_connection_error(self) -> bool {
        matches!(
            self,
            Self::GeneralProtocolError
                | Self::InternalError
                | Self::StreamCreationError
                | Self::ClosedCriticalStream
                | Self::FrameUnexpected
                | Self::ExcessiveLoad
                | Self::IdError
                | Self::SettingsError
                | Self::MissingSettings
                | Self::QpackDecompressionFailed
                | Self::QpackEncoderStreamError
                | Self::QpackDecoderStreamError
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::NoError => "H3_NO_ERROR",
            Self::GeneralProtocolError => "H3_GENERAL_PROTOCOL_ERROR",
            Self::InternalError => "H3_INTERNAL_ERROR",
            Self::StreamCreationError => "H3_STREAM_CREATION_ERROR",
            Self::ClosedCriticalStream => "H3_CLOSED_CRITICAL_STREAM",
            Self::FrameUnexpected => "H3_FRAME_UNEXPECTED",
            Self::FrameError => "H3_FRAME_ERROR",
            Self::ExcessiveLoad => "H3_EXCESSIVE_LOAD",
            Self::IdError => "H3_ID_ERROR",
            Self::SettingsError => "H3_SETTINGS_ERROR",
            Self::MissingSettings => "H3_MISSING_SETTINGS",
            Self::RequestRejected => "H3_REQUEST_REJECTED",
            Self::RequestCancelled => "H3_REQUEST_CANCELLED",
            Self::RequestIncomplete => "H3_REQUEST_INCOMPLETE",
            Self::MessageError => "H3_MESSAGE_ERROR",
            Self::ConnectError => "H3_CONNECT_ERROR",
            Self::VersionFallback => "H3_VERSION_FALLBACK",
            Self::QpackDecompressionFailed => "H3_QPACK_DECOMPRESSION_FAILED",
            Self::QpackEncoderStreamError => "H3_QPACK_ENCODER_STREAM_ERROR",
            Self::QpackDecoderStreamError => "H3_QPACK_DECODER_STREAM_ERROR",
        };
        f.write_str(name)
    }
}

/// Session-level error taxonomy.
///
/// These are the dispositions delivered to the connection observer and to
/// still-open transactions when the session fails a stream or drops the
/// connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// Handshake or stream-creation failure.
    #[error("connect error")]
    Connect,

    /// Transport-level framing or crypto failure below HTTP.
    #[error("connection reset")]
    ConnectionReset,

    /// Connection-level protocol violation (critical stream error).
    #[error("connection error")]
    Connection,

    /// The connection was dropped locally.
    #[error("connection dropped")]
    Dropped,

    /// Graceful local shutdown.
    #[error("shutdown")]
    Shutdown,

    /// A write was rejected by the transport.
    #[error("write error")]
    Write,

    /// The transport refused to arm a delivery callback.
    #[error("network error")]
    Network,

    /// A timer fired on the stream or session.
    #[error("timeout")]
    Timeout,

    /// The peer aborted the stream.
    #[error("stream abort")]
    StreamAbort,

    /// The stream was never processed by the peer; safe to retry.
    #[error("stream unacknowledged")]
    StreamUnacknowledged,

    /// The codec rejected ingress on a request stream.
    #[error("parse error")]
    Parse,
}

impl SessionError {
    /// Classify a transport error reported by the socket.
    pub fn from_quic(err: &QuicError) -> Self {
        match err {
            QuicError::Application(_) => SessionError::ConnectionReset,
            QuicError::Local(LocalErrorCode::ConnectFailed) => SessionError::Connect,
            QuicError::Local(_) => SessionError::Shutdown,
            QuicError::Transport(_) => SessionError::ConnectionReset,
        }
    }
}

/// Which halves of a stream an exception terminates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionDirection {
    Ingress,
    Egress,
    IngressAndEgress,
}

impl ExceptionDirection {
    pub fn is_ingress(self) -> bool {
        !matches!(self, ExceptionDirection::Egress)
    }

    pub fn is_egress(self) -> bool {
        !matches!(self, ExceptionDirection::Ingress)
    }
}

/// Error delivered to a transaction.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind} on transaction ({message})")]
pub struct StreamException {
    pub direction: ExceptionDirection,
    pub kind: SessionError,
    /// Application error code observed on the wire, when one exists.
    pub code: Option<ErrorCode>,
    pub message: String,
}

impl StreamException {
    pub fn new(direction: ExceptionDirection, kind: SessionError, message: impl Into<String>) -> Self {
        Self {
            direction,
            kind,
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(mut self, code: ErrorCode) -> Self {
        self.code = Some(code);
        self
    }
}

/// Error produced by a codec collaborator.
///
/// `connection_level` distinguishes failures that must tear down the whole
/// connection (compression state corruption, control-framing violations)
/// from per-stream parse failures.
#[derive(Debug, Clone, thiserror::Error)]
#[error("codec error {code}: {message}")]
pub struct CodecError {
    pub code: ErrorCode,
    pub connection_level: bool,
    pub message: String,
}

impl CodecError {
    pub fn stream(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            connection_level: false,
            message: message.into(),
        }
    }

    pub fn connection(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            connection_level: true,
            message: message.into(),
        }
    }
}

/// Result alias for session-core operations.
pub type Result<T> = std::result::Result<T, SessionError>;

/// Convert an application error code on a control stream to the code used
/// when dropping the connection. Any application error observed on a
/// control stream becomes `ClosedCriticalStream`; local and transport
/// errors pass through unchanged.
pub(crate) fn control_stream_error(err: QuicError) -> QuicError {
    match err {
        QuicError::Application(_) => {
            QuicError::Application(ErrorCode::ClosedCriticalStream.to_code())
        }
        other => other,
    }
}

/// Direction tag used when reporting which half of a control stream failed.
pub(crate) fn direction_name(dir: StreamDirection) -> &'static str {
    match dir {
        StreamDirection::Ingress => "ingress",
        StreamDirection::Egress => "egress",
    }
}
