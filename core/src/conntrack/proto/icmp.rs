//! ICMP classification.
//!
//! Id-bearing query messages (echo, timestamp, information, address mask) are
//! tracked like any other flow: the identifier plays the role of a port, and
//! the reply type is the "inverse" of the request type. Error messages never
//! form connections of their own; instead the early path digs out the embedded
//! IPv4 datagram and associates the error with the connection that datagram
//! belongs to.

use crate::config::TimeoutConfig;
use crate::conntrack::conn::{ConnDir, L4State, Status};
use crate::conntrack::pdu::IpContext;
use crate::conntrack::proto::{classifier_for, EarlyVerdict, PacketOutcome, ProtoClassifier};
use crate::conntrack::tuple::Tuple;
use crate::conntrack::{Hook, TrackerShared};
use crate::memory::pktbuf::PktBuf;
use crate::protocols::packet::icmp::{
    internet_checksum, Icmp, ICMP_ADDRESS, ICMP_ADDRESS_REPLY, ICMP_ECHO, ICMP_ECHO_REPLY,
    ICMP_INFO_REPLY, ICMP_INFO_REQUEST, ICMP_TIMESTAMP, ICMP_TIMESTAMP_REPLY,
};
use crate::protocols::packet::ipv4::Ipv4;
use crate::protocols::packet::Packet;

use std::sync::Arc;

use anyhow::Result;

/// Maps a query type to its counterpart in the mirror direction, in both
/// directions. Types absent from this map have no meaningful inverse.
fn invert_type(msg_type: u8) -> Option<u8> {
    match msg_type {
        ICMP_ECHO => Some(ICMP_ECHO_REPLY),
        ICMP_ECHO_REPLY => Some(ICMP_ECHO),
        ICMP_TIMESTAMP => Some(ICMP_TIMESTAMP_REPLY),
        ICMP_TIMESTAMP_REPLY => Some(ICMP_TIMESTAMP),
        ICMP_INFO_REQUEST => Some(ICMP_INFO_REPLY),
        ICMP_INFO_REPLY => Some(ICMP_INFO_REQUEST),
        ICMP_ADDRESS => Some(ICMP_ADDRESS_REPLY),
        ICMP_ADDRESS_REPLY => Some(ICMP_ADDRESS),
        _ => None,
    }
}

/// Only request types may open a connection; replies and errors cannot.
fn valid_new(msg_type: u8) -> bool {
    matches!(
        msg_type,
        ICMP_ECHO | ICMP_TIMESTAMP | ICMP_INFO_REQUEST | ICMP_ADDRESS
    )
}

#[inline]
fn pack_type_code(msg_type: u8, code: u8) -> u16 {
    ((msg_type as u16) << 8) | code as u16
}

pub(crate) struct IcmpClassifier;

impl ProtoClassifier for IcmpClassifier {
    fn name(&self) -> &'static str {
        "icmp"
    }

    /// The identifier acts as the source id; type and code pack into the
    /// destination id.
    fn pkt_to_ids(&self, buf: &PktBuf, ctxt: &IpContext) -> Result<(u16, u16)> {
        let view = ctxt.l4_view(buf);
        let icmp = Icmp::parse_from(&view)?;
        Ok((icmp.echo_id(), pack_type_code(icmp.msg_type(), icmp.code())))
    }

    fn invert_ids(&self, src_id: u16, dst_id: u16) -> Option<(u16, u16)> {
        let inv = invert_type((dst_id >> 8) as u8)?;
        Some((src_id, pack_type_code(inv, dst_id as u8)))
    }

    fn new_state(&self, buf: &PktBuf, ctxt: &IpContext) -> Option<L4State> {
        let view = ctxt.l4_view(buf);
        match Icmp::parse_from(&view) {
            Ok(icmp) if valid_new(icmp.msg_type()) => Some(L4State::Icmp),
            _ => None,
        }
    }

    fn packet(
        &self,
        _state: &mut L4State,
        _buf: &PktBuf,
        _ctxt: &IpContext,
        _dir: ConnDir,
        _status: Status,
        timeouts: &TimeoutConfig,
    ) -> PacketOutcome {
        PacketOutcome::Valid {
            timeout_ms: timeouts.icmp,
            assured: false,
        }
    }

    /// Error messages are resolved against the connection of the datagram
    /// embedded in their payload; they pass through the specialized path
    /// below instead of lookup-or-create.
    fn early(
        &self,
        shared: &Arc<TrackerShared>,
        buf: &PktBuf,
        ctxt: &IpContext,
        hook: Hook,
    ) -> Option<EarlyVerdict> {
        let view = ctxt.l4_view(buf);
        let icmp = match Icmp::parse_from(&view) {
            Ok(icmp) => icmp,
            Err(_) => return Some(EarlyVerdict::Untracked),
        };
        if !icmp.is_error() {
            return None;
        }

        // Checksum the ICMP portion before trusting the embedded bytes.
        let l4_len = ctxt.end_offset.saturating_sub(ctxt.l4_offset);
        match buf.get_data_slice(ctxt.l4_offset, l4_len) {
            Ok(slice) if internet_checksum(slice) == 0 => {}
            _ => {
                log::debug!("ICMP error with bad checksum, not tracking");
                return Some(EarlyVerdict::Untracked);
            }
        }

        let inner_ip = match Ipv4::parse_from(&icmp) {
            Ok(inner) => inner,
            Err(_) => return Some(EarlyVerdict::Untracked),
        };
        let inner_ctxt = IpContext::new_embedded(&inner_ip, ctxt.end_offset);
        if inner_ctxt.frag_offset > 0 {
            return Some(EarlyVerdict::Untracked);
        }

        let clf = classifier_for(inner_ctxt.proto);
        let (src_id, dst_id) = match clf.pkt_to_ids(buf, &inner_ctxt) {
            Ok(ids) => ids,
            Err(_) => return Some(EarlyVerdict::Untracked),
        };
        let inner_tuple = Tuple {
            src_addr: inner_ctxt.src,
            dst_addr: inner_ctxt.dst,
            src_id,
            dst_id,
            proto: inner_ctxt.proto,
        };

        // The embedded datagram is the one *we* sent; the error travels back
        // toward its sender, so the flow it belongs to is found under the
        // inverse tuple.
        if let Some((inv_src, inv_dst)) = clf.invert_ids(src_id, dst_id) {
            let inverted = Tuple {
                src_addr: inner_tuple.dst_addr,
                dst_addr: inner_tuple.src_addr,
                src_id: inv_src,
                dst_id: inv_dst,
                proto: inner_tuple.proto,
            };
            if let Some((handle, dir)) = shared.find(&inverted) {
                return Some(EarlyVerdict::Attach(handle, dir));
            }
        }

        // Locally generated errors reference the tuple exactly as sent.
        if matches!(hook, Hook::LocalOut) {
            if let Some((handle, dir)) = shared.find(&inner_tuple) {
                return Some(EarlyVerdict::Attach(handle, dir));
            }
        }
        Some(EarlyVerdict::Untracked)
    }
}
