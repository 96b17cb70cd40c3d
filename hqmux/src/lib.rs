//! HTTP-over-QUIC session core.
//!
//! This crate implements the per-connection state machine that multiplexes
//! HTTP request/response transactions over a single QUIC connection. It sits
//! between a QUIC socket abstraction ([`hqmux_x::QuicSocket`]) delivering
//! byte streams, flow-control updates and delivery acknowledgments, and an
//! HTTP transaction layer producing and consuming HTTP messages.
//!
//! Three wire dialects are supported, selected by the application protocol
//! negotiated during the handshake:
//! - legacy framed v1 (`h1q-fb`, `h1q`, `hq-27`): no control stream, drain
//!   driven by the `Connection: close` header;
//! - legacy framed v2 (`h1q-fb-v2`): a single control stream;
//! - HTTP/3 (`h3-fb-05`, `h3-27`): control stream plus QPACK encoder and
//!   decoder streams.
//!
//! The core is sans-io and single-threaded: the embedding event loop drives
//! [`Session`] through its transport callback methods and runs
//! [`Session::run_loop_callback`] whenever [`Session::needs_loop_callback`]
//! reports true. The session never blocks and never spawns.
//!
//! Out of scope, consumed through traits: the QUIC transport itself
//! ([`hqmux_x::QuicSocket`]), the HTTP codec family ([`codec`]), the
//! transaction object ([`txn`]), and the egress priority queue
//! ([`priority`]).

#![forbid(unsafe_code)]

pub mod codec;
pub mod config;
pub mod dialect;
pub mod drain;
pub mod error;
pub mod message;
pub mod priority;
pub mod session;
pub mod settings;
pub mod stream_type;
pub mod txn;

mod dispatch;
mod egress;
mod registry;
mod stream;
mod version;

pub use config::SessionConfig;
pub use dialect::Dialect;
pub use drain::DrainState;
pub use error::{ErrorCode, Result, SessionError, StreamException};
pub use message::HttpMessage;
pub use session::Session;
pub use settings::SettingsSnapshot;
pub use stream_type::UniStreamType;
