//! Stream registry: indexes request, control and push stream transports by
//! stream id and by role.
//!
//! Invariant: a stream id appears in at most one table. Request streams
//! (including pushed ones) are keyed by their primary id; control streams
//! are keyed by unidirectional type with a secondary index from ingress id
//! to type. Erasure is idempotent.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::stream::{ControlStream, RequestStream};
use crate::stream_type::UniStreamType;
use hqmux_x::StreamId;

#[derive(Default)]
pub(crate) struct StreamRegistry {
    pub(crate) streams: HashMap<StreamId, RequestStream>,
    /// Egress-indexed; BTreeMap so the control write pass has a stable
    /// order (accepted starvation risk, control traffic is bounded).
    pub(crate) control: BTreeMap<UniStreamType, ControlStream>,
    control_ingress_index: HashMap<StreamId, UniStreamType>,
    pub(crate) push_streams: HashSet<StreamId>,
}

impl StreamRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Number of request streams (pushed included); control streams do not
    /// count toward session liveness.
    pub(crate) fn num_streams(&self) -> usize {
        self.streams.len()
    }

    pub(crate) fn insert_request(&mut self, id: StreamId, stream: RequestStream) {
        debug_assert!(!self.contains_id(id), "stream id {id} already registered");
        if stream.pushed {
            self.push_streams.insert(id);
        }
        self.streams.insert(id, stream);
    }

    pub(crate) fn insert_control(&mut self, stream: ControlStream) {
        debug_assert!(!self.control.contains_key(&stream.stream_type));
        self.control.insert(stream.stream_type, stream);
    }

    fn contains_id(&self, id: StreamId) -> bool {
        self.streams.contains_key(&id)
            || self.control_ingress_index.contains_key(&id)
            || self.control.values().any(|ctrl| ctrl.is_using(id))
    }

    pub(crate) fn find_stream(&self, id: StreamId) -> Option<&RequestStream> {
        self.streams.values().find(|stream| stream.is_using(id))
    }

    pub(crate) fn find_stream_mut(&mut self, id: StreamId) -> Option<&mut RequestStream> {
        self.streams.values_mut().find(|stream| stream.is_using(id))
    }

    pub(crate) fn find_non_detached_stream_mut(
        &mut self,
        id: StreamId,
    ) -> Option<&mut RequestStream> {
        self.find_stream_mut(id).filter(|stream| !stream.detached)
    }

    pub(crate) fn find_ingress_stream_mut(
        &mut self,
        id: StreamId,
        include_detached: bool,
    ) -> Option<&mut RequestStream> {
        self.streams
            .values_mut()
            .find(|stream| stream.ingress_id() == Some(id))
            .filter(|stream| include_detached || !stream.detached)
    }

    pub(crate) fn find_egress_stream_mut(
        &mut self,
        id: StreamId,
        include_detached: bool,
    ) -> Option<&mut RequestStream> {
        self.streams
            .values_mut()
            .find(|stream| stream.egress_id() == Some(id))
            .filter(|stream| include_detached || !stream.detached)
    }

    pub(crate) fn find_control(&self, stream_type: UniStreamType) -> Option<&ControlStream> {
        self.control.get(&stream_type)
    }

    pub(crate) fn find_control_mut(
        &mut self,
        stream_type: UniStreamType,
    ) -> Option<&mut ControlStream> {
        self.control.get_mut(&stream_type)
    }

    /// Resolve a stream id to the control stream using it: the ingress
    /// index first, then the egress ids.
    pub(crate) fn control_type_for_id(&self, id: StreamId) -> Option<UniStreamType> {
        if let Some(stream_type) = self.control_ingress_index.get(&id) {
            return Some(*stream_type);
        }
        self.control
            .values()
            .find(|ctrl| ctrl.is_using(id))
            .map(|ctrl| ctrl.stream_type)
    }

    /// Record the ingress id of a bound control stream for reverse lookup.
    pub(crate) fn index_control_ingress(&mut self, id: StreamId, stream_type: UniStreamType) {
        self.control_ingress_index.insert(id, stream_type);
    }

    /// Remove a request stream. Idempotent; returns whether anything was
    /// erased.
    pub(crate) fn erase_stream(&mut self, id: StreamId) -> bool {
        let erased = self.streams.remove(&id).is_some();
        self.push_streams.remove(&id) || erased
    }

    pub(crate) fn request_ids(&self) -> Vec<StreamId> {
        self.streams.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{RequestCodec, RequestEvent};
    use crate::error::CodecError;
    use crate::message::HttpMessage;
    use crate::txn::{Transaction, WriteChunk};
    use bytes::{Bytes, BytesMut};
    use http::HeaderMap;

    struct NullCodec;

    impl RequestCodec for NullCodec {
        fn on_ingress(&mut self, buf: &mut BytesMut) -> Result<Vec<RequestEvent>, CodecError> {
            buf.clear();
            Ok(Vec::new())
        }
        fn on_ingress_eof(&mut self) -> Result<Vec<RequestEvent>, CodecError> {
            Ok(Vec::new())
        }
        fn generate_header(
            &mut self,
            _msg: &HttpMessage,
            _include_eom: bool,
        ) -> Result<Bytes, CodecError> {
            Ok(Bytes::new())
        }
        fn generate_body(&mut self, body: Bytes, _include_eom: bool) -> Result<Bytes, CodecError> {
            Ok(body)
        }
        fn generate_trailers(&mut self, _trailers: &HeaderMap) -> Result<Bytes, CodecError> {
            Ok(Bytes::new())
        }
        fn generate_eom(&mut self) -> Result<Bytes, CodecError> {
            Ok(Bytes::new())
        }
        fn generate_push_promise(
            &mut self,
            _push_id: u64,
            _msg: &HttpMessage,
        ) -> Result<Bytes, CodecError> {
            Ok(Bytes::new())
        }
        fn generate_goaway(&mut self) -> Result<Bytes, CodecError> {
            Ok(Bytes::new())
        }
        fn on_ingress_data_available(&mut self, offset: u64) -> Result<u64, CodecError> {
            Ok(offset)
        }
        fn on_ingress_data_expired(&mut self, offset: u64) -> Result<u64, CodecError> {
            Ok(offset)
        }
        fn on_ingress_data_rejected(&mut self, offset: u64) -> Result<u64, CodecError> {
            Ok(offset)
        }
    }

    struct NullTxn;

    impl Transaction for NullTxn {
        fn on_ingress_headers_complete(&mut self, _msg: HttpMessage) {}
        fn on_ingress_body(&mut self, _body: Bytes) {}
        fn on_ingress_trailers(&mut self, _trailers: HeaderMap) {}
        fn on_ingress_eom(&mut self) {}
        fn on_ingress_timeout(&mut self) {}
        fn on_error(&mut self, _ex: crate::error::StreamException) {}
        fn on_goaway(&mut self, _code: crate::error::ErrorCode) {}
        fn on_write_ready(&mut self, _max_body: usize, _ratio: f64) -> WriteChunk {
            WriteChunk::default()
        }
        fn pause_egress(&mut self) {}
        fn resume_egress(&mut self) {}
        fn has_pending_body(&self) -> bool {
            false
        }
        fn is_egress_eom_queued(&self) -> bool {
            false
        }
        fn is_egress_complete(&self) -> bool {
            true
        }
        fn is_egress_paused(&self) -> bool {
            false
        }
        fn is_ingress_started(&self) -> bool {
            false
        }
        fn on_last_egress_header_byte_acked(&mut self) {}
        fn on_egress_body_bytes_acked(&mut self, _body_offset: u64) {}
        fn on_egress_body_delivery_canceled(&mut self, _body_offset: u64) {}
        fn on_egress_last_byte_acked(&mut self) {}
        fn on_ingress_body_peek(&mut self, _body_offset: u64, _data: Bytes) {}
        fn on_ingress_body_skipped(&mut self, _body_offset: u64) {}
        fn on_ingress_body_rejected(&mut self, _body_offset: u64) {}
        fn increment_pending_byte_events(&mut self) {}
        fn decrement_pending_byte_events(&mut self) {}
        fn is_complete(&self) -> bool {
            false
        }
    }

    fn request_stream(id: u64) -> RequestStream {
        RequestStream::new_bidirectional(StreamId(id), Box::new(NullCodec), Box::new(NullTxn))
    }

    #[test]
    fn request_lookup_and_erase() {
        let mut registry = StreamRegistry::new();
        registry.insert_request(StreamId(0), request_stream(0));
        assert_eq!(registry.num_streams(), 1);
        assert!(registry.find_stream(StreamId(0)).is_some());
        assert!(registry.find_stream(StreamId(4)).is_none());

        assert!(registry.erase_stream(StreamId(0)));
        assert!(!registry.erase_stream(StreamId(0)), "erase is idempotent");
        assert_eq!(registry.num_streams(), 0);
    }

    #[test]
    fn control_lookup_by_type_and_id() {
        let mut registry = StreamRegistry::new();
        registry.insert_control(ControlStream::new(UniStreamType::Control, StreamId(3)));

        assert!(registry.find_control(UniStreamType::Control).is_some());
        assert!(registry.find_control(UniStreamType::QpackEncoder).is_none());
        assert_eq!(
            registry.control_type_for_id(StreamId(3)),
            Some(UniStreamType::Control)
        );
        registry.index_control_ingress(StreamId(7), UniStreamType::Control);
        assert_eq!(
            registry.control_type_for_id(StreamId(7)),
            Some(UniStreamType::Control)
        );
        assert_eq!(registry.control_type_for_id(StreamId(11)), None);
    }

    #[test]
    fn control_iteration_order_is_stable() {
        let mut registry = StreamRegistry::new();
        registry.insert_control(ControlStream::new(UniStreamType::QpackDecoder, StreamId(11)));
        registry.insert_control(ControlStream::new(UniStreamType::Control, StreamId(3)));
        registry.insert_control(ControlStream::new(UniStreamType::QpackEncoder, StreamId(7)));

        let order: Vec<UniStreamType> = registry.control.keys().copied().collect();
        assert_eq!(
            order,
            vec![
                UniStreamType::Control,
                UniStreamType::QpackEncoder,
                UniStreamType::QpackDecoder,
            ]
        );
    }
}
