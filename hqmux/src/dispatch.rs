//! Unidirectional-stream dispatcher.
//!
//! A newly observed unidirectional ingress stream has no identity until its
//! preface varint has been read. The dispatcher takes temporary ownership
//! of the id, peeks at the stream head on every peek notification, and
//! classifies it: a known tag is handed back to the session for codec
//! installation, an unknown tag is rejected with STOP_SENDING, and an
//! incomplete preface leaves the peek armed for the next notification.
//!
//! Peeks never consume; repeated notifications re-parse the same prefix,
//! so overlapping data is harmless.

use std::collections::HashSet;
use tracing::debug;

use crate::dialect::Dialect;
use crate::stream_type::UniStreamType;
use crate::version;
use hqmux_x::{varint, StreamId};

/// Outcome of parsing a peeked stream head.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Classified {
    /// A control-family stream; `consumed` covers the type varint.
    Control {
        stream_type: UniStreamType,
        consumed: usize,
    },
    /// A push stream; `consumed` covers type and push id varints.
    Push { push_id: u64, consumed: usize },
    /// Tag the dialect does not recognize.
    Unknown(u64),
    /// Not enough bytes peeked yet.
    NeedMore,
}

#[derive(Default)]
pub(crate) struct UniDispatcher {
    pending: HashSet<StreamId>,
}

impl UniDispatcher {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn take_temporary_ownership(&mut self, id: StreamId) {
        debug!(stream = %id, "dispatcher owning new unidirectional stream");
        self.pending.insert(id);
    }

    pub(crate) fn owns(&self, id: StreamId) -> bool {
        self.pending.contains(&id)
    }

    pub(crate) fn release(&mut self, id: StreamId) {
        self.pending.remove(&id);
    }

    /// Ids still waiting for a preface; cleaned up at shutdown.
    pub(crate) fn pending_ids(&self) -> Vec<StreamId> {
        self.pending.iter().copied().collect()
    }

    /// Classify the peeked head of a pending stream.
    pub(crate) fn classify(&self, dialect: Dialect, data: &[u8]) -> Classified {
        let Some((tag, tag_len)) = varint::decode(data) else {
            return Classified::NeedMore;
        };
        let Some(stream_type) = version::parse_stream_preface(dialect, tag) else {
            return Classified::Unknown(tag);
        };
        if stream_type == UniStreamType::Push {
            // The push preface carries the push id right after the tag.
            let Some((push_id, id_len)) = varint::decode(&data[tag_len..]) else {
                return Classified::NeedMore;
            };
            return Classified::Push {
                push_id,
                consumed: tag_len + id_len,
            };
        }
        Classified::Control {
            stream_type,
            consumed: tag_len,
        }
    }
}
