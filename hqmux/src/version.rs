//! Per-dialect policy: the strategy behind every dialect-dependent decision.
//!
//! All behavior that differs between the legacy framed dialects and HTTP/3
//! is dispatched through the methods in this module. Nothing outside it
//! matches on [`Dialect`].

use tracing::{debug, error, warn};

use crate::dialect::Dialect;
use crate::drain::DrainState;
use crate::error::{ErrorCode, ExceptionDirection};
use crate::message::HttpMessage;
use crate::session::Session;
use crate::settings::Setting;
use crate::stream_type::UniStreamType;
use hqmux_x::{StreamId, TransportDirection, MAX_STREAM_ID};

/// QPACK defaults applied until the peer's SETTINGS arrive.
const DEFAULT_INGRESS_HEADER_TABLE_SIZE: u64 = 4096;
const DEFAULT_INGRESS_QPACK_BLOCKED_STREAMS: u64 = 100;

/// Dialect-specific enumeration of accepted unidirectional stream tags.
pub(crate) fn parse_stream_preface(dialect: Dialect, preface: u64) -> Option<UniStreamType> {
    let stream_type = UniStreamType::from_wire(preface)?;
    match dialect {
        // V1 has no unidirectional streams at all; prefaces never parse.
        Dialect::V1 => None,
        Dialect::V2 => stream_type.is_control().then_some(stream_type),
        Dialect::H3 => Some(stream_type),
    }
}

impl Dialect {
    /// Accept/reject predicate for newly observed peer-initiated streams.
    /// Rejected ids are aborted with a wrong-stream error and never enter
    /// the registry.
    pub(crate) fn check_new_stream(self, session: &mut Session, id: StreamId) -> bool {
        match self {
            Dialect::V1 => {
                // Legacy single-direction: no unidirectional streams, no
                // server-initiated streams.
                if id.is_unidirectional() || id.is_server_initiated() {
                    session.abort_raw_stream(
                        ExceptionDirection::IngressAndEgress,
                        id,
                        ErrorCode::StreamCreationError,
                    );
                    return false;
                }
                true
            }
            Dialect::V2 | Dialect::H3 => {
                if id.is_bidirectional() && id.is_server_initiated() {
                    session.abort_raw_stream(
                        ExceptionDirection::IngressAndEgress,
                        id,
                        ErrorCode::StreamCreationError,
                    );
                    return false;
                }
                // While draining, cancel streams beyond the advertised
                // GOAWAY limit. Downstream streams may legitimately arrive
                // out of order below the high-water mark.
                if session.drain_state != DrainState::None {
                    let rejected = match session.direction {
                        TransportDirection::Upstream => {
                            session.beyond_goaway_limit(id.value(), session.max_allowed_stream_id)
                        }
                        TransportDirection::Downstream => {
                            id.is_bidirectional()
                                && session.beyond_goaway_limit(
                                    id.value(),
                                    session.max_incoming_stream_id,
                                )
                        }
                    };
                    if rejected {
                        session.abort_raw_stream(
                            ExceptionDirection::IngressAndEgress,
                            id,
                            ErrorCode::RequestRejected,
                        );
                        return false;
                    }
                }
                true
            }
        }
    }

    /// Bring up the dialect's egress control streams at transport-ready.
    pub(crate) fn create_egress_control_streams(self, session: &mut Session) -> bool {
        match self {
            Dialect::V1 => true,
            Dialect::V2 => {
                if !session.create_egress_control_stream(UniStreamType::Control) {
                    return false;
                }
                session.schedule_write();
                true
            }
            Dialect::H3 => {
                if !session.create_egress_control_stream(UniStreamType::Control)
                    || !session.create_egress_control_stream(UniStreamType::QpackEncoder)
                    || !session.create_egress_control_stream(UniStreamType::QpackDecoder)
                {
                    return false;
                }
                self.send_settings(session);
                session.schedule_write();
                true
            }
        }
    }

    /// Configure QPACK from the peer's settings (HTTP/3 only).
    pub(crate) fn apply_settings(self, session: &mut Session, settings: &[Setting]) {
        if self != Dialect::H3 {
            return;
        }
        let mut table_size = DEFAULT_INGRESS_HEADER_TABLE_SIZE;
        let mut blocked = DEFAULT_INGRESS_QPACK_BLOCKED_STREAMS;
        for setting in settings {
            match setting.id {
                crate::settings::SettingId::QpackMaxTableCapacity => table_size = setting.value,
                crate::settings::SettingId::QpackBlockedStreams => blocked = setting.value,
                _ => {}
            }
        }
        if let Some(qpack) = session.codecs.qpack() {
            qpack.apply_settings(table_size, blocked);
        }
        debug!(table_size, blocked, "applied peer settings");
    }

    /// Handle an inbound SETTINGS list.
    pub(crate) fn on_settings(self, session: &mut Session, settings: &[Setting]) {
        match self {
            Dialect::V1 | Dialect::V2 => {
                warn!(dialect = %self, "unexpected SETTINGS");
            }
            Dialect::H3 => self.apply_settings(session, settings),
        }
    }

    /// Emit a SETTINGS frame on the control stream (HTTP/3 only).
    pub(crate) fn send_settings(self, session: &mut Session) {
        if self != Dialect::H3 {
            return;
        }
        let egress = session.egress_settings;
        if let Some(qpack) = session.codecs.qpack() {
            qpack.set_decoder_table_capacity(egress.qpack_max_table_capacity);
            qpack.set_max_blocking(egress.qpack_blocked_streams);
        }
        let Some(ctrl) = session.registry.find_control_mut(UniStreamType::Control) else {
            error!("control stream missing at send_settings");
            return;
        };
        let Some(codec) = ctrl.egress_codec.as_mut() else {
            error!("control stream has no egress codec");
            return;
        };
        match codec.generate_settings(&egress) {
            Ok(frame) => {
                ctrl.write_buf.extend_from_slice(&frame);
                session.schedule_write();
            }
            Err(err) => error!(%err, "failed to generate SETTINGS"),
        }
    }

    /// Emit a GOAWAY for the current quiescence limit and advance drain.
    ///
    /// V1 emits no frame; its drain is header-driven, so request-stream
    /// codecs are marked draining instead. The control-stream dialects only
    /// send GOAWAY downstream.
    pub(crate) fn send_goaway(self, session: &mut Session) {
        match self {
            Dialect::V1 => {
                let ids = session.registry.request_ids();
                for id in ids {
                    if let Some(stream) = session.registry.streams.get_mut(&id) {
                        if let Err(err) = stream.codec.generate_goaway() {
                            warn!(stream = %id, %err, "codec refused goaway mark");
                        }
                    }
                }
            }
            Dialect::V2 | Dialect::H3 => goaway_send(session),
        }
    }

    /// V1 marks a freshly created request stream as draining so its next
    /// message carries `Connection: close`.
    pub(crate) fn send_goaway_on_request_stream(self, session: &mut Session, id: StreamId) {
        if self != Dialect::V1 {
            return;
        }
        if let Some(stream) = session.registry.streams.get_mut(&id) {
            if let Err(err) = stream.codec.generate_goaway() {
                warn!(stream = %id, %err, "codec refused goaway mark");
            }
        }
    }

    /// Dialect action when a full header section arrives on a request
    /// stream.
    pub(crate) fn headers_complete(self, session: &mut Session, msg: &HttpMessage) {
        match self {
            Dialect::V1 => {
                // Drain on receipt of a `Connection: close` header.
                if session.drain_state == DrainState::Done {
                    return;
                }
                if !msg.wants_keepalive() {
                    if session.drain_state == DrainState::CloseSent {
                        session.drain_state = DrainState::Done;
                    } else {
                        if session.drain_state == DrainState::None {
                            session.drain_impl();
                        }
                        session.drain_state = DrainState::CloseReceived;
                    }
                }
            }
            Dialect::V2 => {}
            Dialect::H3 => {
                // Flush header acknowledgments the decoder queued while
                // parsing this section.
                session.flush_qpack_decoder_instructions();
                let pending = session
                    .registry
                    .find_control(UniStreamType::QpackDecoder)
                    .map(|ctrl| !ctrl.write_buf.is_empty())
                    .unwrap_or(false);
                if pending {
                    session.schedule_write();
                }
            }
        }
    }

    /// V1 egress-side drain: sending a message with `Connection: close`
    /// advances the close handshake.
    pub(crate) fn check_sending_goaway(self, session: &mut Session, msg: &HttpMessage) {
        if self != Dialect::V1 {
            return;
        }
        if session.drain_state == DrainState::None && !msg.wants_keepalive() {
            session.notify_pending_shutdown();
        }
        if session.drain_state == DrainState::CloseReceived {
            session.drain_state = DrainState::Done;
        } else if session.drain_state == DrainState::Pending {
            session.drain_state = DrainState::CloseSent;
        }
    }

    /// Post-read side effects: flush QPACK insert-count increments
    /// (HTTP/3 only). Runs in the loop before control streams are written,
    /// so no extra write scheduling is needed.
    pub(crate) fn read_data_processed(self, session: &mut Session) {
        if self != Dialect::H3 {
            return;
        }
        let increment = session
            .codecs
            .qpack()
            .and_then(|qpack| qpack.encode_insert_count_increment());
        if let Some(increment) = increment {
            if let Some(ctrl) = session.registry.find_control_mut(UniStreamType::QpackDecoder) {
                ctrl.write_buf.extend_from_slice(&increment);
            }
        }
    }

    /// Ingress abort side effects: emit a QPACK cancel for the stream's
    /// header block (HTTP/3 only).
    pub(crate) fn abort_stream(self, session: &mut Session, id: StreamId) {
        if self != Dialect::H3 {
            return;
        }
        let cancel = session
            .codecs
            .qpack()
            .map(|qpack| qpack.encode_cancel_stream(id));
        if let Some(cancel) = cancel {
            if let Some(ctrl) = session.registry.find_control_mut(UniStreamType::QpackDecoder) {
                ctrl.write_buf.extend_from_slice(&cancel);
                session.schedule_write();
            }
        }
    }
}

/// GOAWAY emission shared by the control-stream dialects.
///
/// The first GOAWAY carries the maximum representable stream id; the second
/// carries the highest accepted peer-initiated id. A delivery callback is
/// registered just past the GOAWAY bytes; its acknowledgment drives the
/// next drain transition.
fn goaway_send(session: &mut Session) {
    if session.direction == TransportDirection::Upstream {
        return;
    }
    if session.drain_state == DrainState::Done {
        return;
    }
    debug_assert!(matches!(
        session.drain_state,
        DrainState::Pending | DrainState::FirstGoaway
    ));

    let goaway_id = session.goaway_stream_id();
    let Some(ctrl) = session.registry.find_control_mut(UniStreamType::Control) else {
        error!("control stream missing at send_goaway");
        session.drain_state = DrainState::Done;
        return;
    };
    let egress_id = ctrl.egress_id;
    let Some(codec) = ctrl.egress_codec.as_mut() else {
        session.drain_state = DrainState::Done;
        return;
    };
    let frame = match codec.generate_goaway(goaway_id) {
        Ok(frame) if !frame.is_empty() => frame,
        _ => {
            // Shortcut to shutdown.
            error!("error generating GOAWAY");
            session.drain_state = DrainState::Done;
            return;
        }
    };
    ctrl.write_buf.extend_from_slice(&frame);
    let queued = ctrl.write_buf.len() as u64;

    let Some(sock) = session.sock.as_deref_mut() else {
        session.drain_state = DrainState::Done;
        return;
    };
    let offsets = sock
        .stream_write_offset(egress_id)
        .and_then(|write_offset| {
            sock.stream_write_buffered_bytes(egress_id)
                .map(|buffered| write_offset + buffered)
        });
    let committed = match offsets {
        Ok(committed) => committed,
        Err(err) => {
            error!(%err, "error generating GOAWAY");
            session.drain_state = DrainState::Done;
            return;
        }
    };
    debug!(goaway_id, "generated GOAWAY");

    if let Err(err) = sock.register_delivery_callback(egress_id, committed + queued) {
        error!(%err, "failed to arm GOAWAY delivery callback");
        session.drain_state = DrainState::Done;
        return;
    }
    session.schedule_write();
    session.drain_state = if session.drain_state == DrainState::Pending {
        DrainState::FirstGoaway
    } else {
        DrainState::SecondGoaway
    };
}

/// The limit to advertise in the next GOAWAY.
pub(crate) fn goaway_stream_id(drain_state: DrainState, max_incoming_stream_id: u64) -> u64 {
    if matches!(drain_state, DrainState::None | DrainState::Pending) {
        MAX_STREAM_ID
    } else {
        max_incoming_stream_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preface_acceptance_by_dialect() {
        assert_eq!(parse_stream_preface(Dialect::V1, 0x00), None);
        assert_eq!(
            parse_stream_preface(Dialect::V2, 0x00),
            Some(UniStreamType::Control)
        );
        assert_eq!(parse_stream_preface(Dialect::V2, 0x02), None);
        assert_eq!(
            parse_stream_preface(Dialect::H3, 0x03),
            Some(UniStreamType::QpackDecoder)
        );
        assert_eq!(parse_stream_preface(Dialect::H3, 0x5f), None);
    }

    #[test]
    fn goaway_limit_widens_then_narrows() {
        assert_eq!(goaway_stream_id(DrainState::Pending, 8), MAX_STREAM_ID);
        assert_eq!(goaway_stream_id(DrainState::FirstGoaway, 8), 8);
        assert_eq!(goaway_stream_id(DrainState::SecondGoaway, 8), 8);
    }
}
