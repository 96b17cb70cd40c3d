//! Unidirectional stream type identification (RFC 9114 Section 6.2).
//!
//! Every unidirectional stream begins with a variable-length integer naming
//! its type. Which tags are accepted depends on the negotiated dialect; the
//! legacy framed v2 dialect reuses the control tag for its single control
//! stream and knows no others.

use bytes::BufMut;
use hqmux_x::varint;

/// Unidirectional stream types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u64)]
pub enum UniStreamType {
    /// Control stream (RFC 9114 Section 6.2.1), carrying SETTINGS and
    /// GOAWAY. Also the single control stream of the legacy v2 dialect.
    Control = 0x00,

    /// Server push stream (RFC 9114 Section 6.2.2).
    Push = 0x01,

    /// QPACK encoder stream (RFC 9204 Section 4.2).
    QpackEncoder = 0x02,

    /// QPACK decoder stream (RFC 9204 Section 4.2).
    QpackDecoder = 0x03,
}

impl UniStreamType {
    pub fn from_wire(value: u64) -> Option<Self> {
        match value {
            0x00 => Some(Self::Control),
            0x01 => Some(Self::Push),
            0x02 => Some(Self::QpackEncoder),
            0x03 => Some(Self::QpackDecoder),
            _ => None,
        }
    }

    pub fn to_wire(self) -> u64 {
        self as u64
    }

    pub fn is_control(self) -> bool {
        matches!(self, Self::Control)
    }

    pub fn is_qpack(self) -> bool {
        matches!(self, Self::QpackEncoder | Self::QpackDecoder)
    }
}

impl std::fmt::Display for UniStreamType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Control => write!(f, "control"),
            Self::Push => write!(f, "push"),
            Self::QpackEncoder => write!(f, "qpack-encoder"),
            Self::QpackDecoder => write!(f, "qpack-decoder"),
        }
    }
}

/// Write a stream-type preface, returning the encoded length.
pub fn write_preface<B: BufMut>(stream_type: UniStreamType, buf: &mut B) -> usize {
    // Stream type tags are all below the one-byte varint limit.
    varint::encode(stream_type.to_wire(), buf).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn preface_roundtrip() {
        for stream_type in [
            UniStreamType::Control,
            UniStreamType::Push,
            UniStreamType::QpackEncoder,
            UniStreamType::QpackDecoder,
        ] {
            let mut buf = BytesMut::new();
            let written = write_preface(stream_type, &mut buf);
            assert_eq!(written, 1);
            let (tag, consumed) = varint::decode(&buf).unwrap();
            assert_eq!(consumed, written);
            assert_eq!(UniStreamType::from_wire(tag), Some(stream_type));
        }
    }

    #[test]
    fn unknown_tag() {
        assert_eq!(UniStreamType::from_wire(0x5f), None);
        assert_eq!(UniStreamType::from_wire(0x21), None);
    }
}
