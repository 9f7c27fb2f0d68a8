//! UDP connection classification.
//!
//! UDP has no handshake; a "connection" is a pair of endpoints exchanging
//! datagrams. Flows that have only ever been seen in one direction get a short
//! timeout; once traffic flows both ways the flow is promoted to assured and
//! given the longer stream timeout.

use crate::config::TimeoutConfig;
use crate::conntrack::conn::{ConnDir, L4State, Status};
use crate::conntrack::pdu::IpContext;
use crate::conntrack::proto::{PacketOutcome, ProtoClassifier};
use crate::memory::pktbuf::PktBuf;
use crate::protocols::packet::udp::Udp;
use crate::protocols::packet::Packet;

use anyhow::Result;

pub(crate) struct UdpClassifier;

impl ProtoClassifier for UdpClassifier {
    fn name(&self) -> &'static str {
        "udp"
    }

    fn pkt_to_ids(&self, buf: &PktBuf, ctxt: &IpContext) -> Result<(u16, u16)> {
        let view = ctxt.l4_view(buf);
        let udp = Udp::parse_from(&view)?;
        Ok((udp.src_port(), udp.dst_port()))
    }

    fn invert_ids(&self, src_id: u16, dst_id: u16) -> Option<(u16, u16)> {
        Some((dst_id, src_id))
    }

    fn new_state(&self, _buf: &PktBuf, _ctxt: &IpContext) -> Option<L4State> {
        Some(L4State::Udp)
    }

    fn packet(
        &self,
        _state: &mut L4State,
        _buf: &PktBuf,
        _ctxt: &IpContext,
        _dir: ConnDir,
        status: Status,
        timeouts: &TimeoutConfig,
    ) -> PacketOutcome {
        if status.intersects(Status::SeenReply) {
            PacketOutcome::Valid {
                timeout_ms: timeouts.udp_stream,
                assured: true,
            }
        } else {
            PacketOutcome::Valid {
                timeout_ms: timeouts.udp_unreplied,
                assured: false,
            }
        }
    }
}
