//! Wire dialect selection from the negotiated application protocol.

/// Application protocol labels mapped to the legacy framed v1 dialect.
pub const ALPN_H1Q_FB: &str = "h1q-fb";
pub const ALPN_H1Q: &str = "h1q";
pub const ALPN_HQ_DRAFT: &str = "hq-27";

/// Label for the legacy framed v2 dialect.
pub const ALPN_H1Q_FB_V2: &str = "h1q-fb-v2";

/// Labels for the HTTP/3 dialect.
pub const ALPN_H3_FB_DRAFT: &str = "h3-fb-05";
pub const ALPN_H3_DRAFT: &str = "h3-27";

/// The three wire dialects the session supports.
///
/// All per-dialect behavior is dispatched through the strategy methods in
/// `version.rs`; nothing else in the crate matches on this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// Legacy framed v1: no control stream, drain driven by
    /// `Connection: close`.
    V1,

    /// Legacy framed v2: a single control stream.
    V2,

    /// HTTP/3: control stream plus QPACK encoder and decoder streams.
    H3,
}

impl Dialect {
    /// Map a negotiated application protocol label to a dialect.
    pub fn from_alpn(alpn: &str) -> Option<Self> {
        match alpn {
            ALPN_H1Q_FB | ALPN_H1Q | ALPN_HQ_DRAFT => Some(Dialect::V1),
            ALPN_H1Q_FB_V2 => Some(Dialect::V2),
            ALPN_H3_FB_DRAFT | ALPN_H3_DRAFT => Some(Dialect::H3),
            _ => None,
        }
    }

    /// Whether the dialect runs a control stream at all.
    pub fn has_control_stream(self) -> bool {
        !matches!(self, Dialect::V1)
    }
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dialect::V1 => write!(f, "h1q-v1"),
            Dialect::V2 => write!(f, "h1q-v2"),
            Dialect::H3 => write!(f, "h3"),
        }
    }
}
