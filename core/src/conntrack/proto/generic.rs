//! Fallback classification for unrecognized layer-4 protocols.
//!
//! Tracks on addresses and protocol number alone: endpoint identifiers are
//! zero, inversion is the identity, and every packet is a valid member of the
//! flow.

use crate::config::TimeoutConfig;
use crate::conntrack::conn::{ConnDir, L4State, Status};
use crate::conntrack::pdu::IpContext;
use crate::conntrack::proto::{PacketOutcome, ProtoClassifier};
use crate::memory::pktbuf::PktBuf;

use anyhow::Result;

pub(crate) struct GenericClassifier;

impl ProtoClassifier for GenericClassifier {
    fn name(&self) -> &'static str {
        "generic"
    }

    fn pkt_to_ids(&self, _buf: &PktBuf, _ctxt: &IpContext) -> Result<(u16, u16)> {
        Ok((0, 0))
    }

    fn invert_ids(&self, src_id: u16, dst_id: u16) -> Option<(u16, u16)> {
        Some((dst_id, src_id))
    }

    fn new_state(&self, _buf: &PktBuf, _ctxt: &IpContext) -> Option<L4State> {
        Some(L4State::Generic)
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
            timeout_ms: timeouts.generic,
            assured: false,
        }
    }
}
