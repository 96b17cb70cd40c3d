//! Control-stream transport.
//!
//! One per dialect-required unidirectional type. The egress half always
//! exists after bring-up and starts with the stream-type preface; the
//! ingress half is bound only after the peer opens the corresponding
//! stream and its preface is classified. Delivery acknowledgments on a
//! control stream signal GOAWAY delivery, not transaction byte events.

use bytes::BytesMut;
use std::time::Instant;

use crate::codec::ControlCodec;
use crate::stream_type::{self, UniStreamType};
use hqmux_x::StreamId;

pub(crate) struct ControlStream {
    pub(crate) stream_type: UniStreamType,
    pub(crate) egress_id: StreamId,
    pub(crate) ingress_id: Option<StreamId>,
    pub(crate) egress_codec: Option<Box<dyn ControlCodec>>,
    pub(crate) ingress_codec: Option<Box<dyn ControlCodec>>,
    pub(crate) write_buf: BytesMut,
    pub(crate) read_buf: BytesMut,
    pub(crate) read_eof: bool,
    pub(crate) created_at: Instant,
}

impl ControlStream {
    pub(crate) fn new(stream_type: UniStreamType, egress_id: StreamId) -> Self {
        Self {
            stream_type,
            egress_id,
            ingress_id: None,
            egress_codec: None,
            ingress_codec: None,
            write_buf: BytesMut::new(),
            read_buf: BytesMut::new(),
            read_eof: false,
            created_at: Instant::now(),
        }
    }

    /// Queue the stream-type varint that prefaces every unidirectional
    /// stream.
    pub(crate) fn generate_preface(&mut self) {
        stream_type::write_preface(self.stream_type, &mut self.write_buf);
    }

    pub(crate) fn is_using(&self, id: StreamId) -> bool {
        self.egress_id == id || self.ingress_id == Some(id)
    }

    /// Bind the peer's stream of this type. Returns false if one is
    /// already bound; a second ingress control stream of the same type is
    /// a connection error the caller must raise.
    pub(crate) fn bind_ingress(
        &mut self,
        id: StreamId,
        codec: Box<dyn ControlCodec>,
    ) -> bool {
        if self.ingress_codec.is_some() {
            return false;
        }
        self.ingress_id = Some(id);
        self.ingress_codec = Some(codec);
        true
    }
}
