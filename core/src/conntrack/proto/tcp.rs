//! TCP connection classification.
//!
//! Tracks the TCP handshake and teardown with a coarse state machine: enough
//! to distinguish half-open, established, and closing flows and to pick an
//! appropriate inactivity timeout for each phase. Sequence numbers are not
//! tracked; this is flow classification, not reassembly.

use crate::config::TimeoutConfig;
use crate::conntrack::conn::{ConnDir, L4State, Status};
use crate::conntrack::pdu::IpContext;
use crate::conntrack::proto::{PacketOutcome, ProtoClassifier};
use crate::memory::pktbuf::PktBuf;
use crate::protocols::packet::tcp::{Tcp, ACK, FIN, RST, SYN};
use crate::protocols::packet::Packet;

use anyhow::Result;

/// TCP flow phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    /// Initial SYN seen from the originator.
    SynSent,
    /// SYN/ACK seen from the responder.
    SynRecv,
    /// Three-way handshake completed.
    Established,
    /// First FIN seen.
    FinWait,
    /// The first FIN has been acknowledged.
    CloseWait,
    /// Both sides have sent FIN.
    LastAck,
    /// Final ACK seen; lingering to absorb stragglers.
    TimeWait,
    /// Reset or fully closed.
    Close,
}

impl TcpState {
    /// The inactivity timeout appropriate for this phase.
    pub(crate) fn timeout_ms(&self, timeouts: &TimeoutConfig) -> u64 {
        match self {
            TcpState::SynSent => timeouts.tcp_syn_sent,
            TcpState::SynRecv => timeouts.tcp_syn_recv,
            TcpState::Established => timeouts.tcp_established,
            TcpState::FinWait => timeouts.tcp_fin_wait,
            TcpState::CloseWait => timeouts.tcp_close_wait,
            TcpState::LastAck => timeouts.tcp_last_ack,
            TcpState::TimeWait => timeouts.tcp_time_wait,
            TcpState::Close => timeouts.tcp_close,
        }
    }
}

/// Computes the next state for a segment with `flags` traveling in `dir`.
/// Returns `None` for segments that cannot belong to a flow in `state`.
fn transition(state: TcpState, dir: ConnDir, flags: u8) -> Option<TcpState> {
    if flags & RST != 0 {
        return Some(TcpState::Close);
    }
    match state {
        TcpState::SynSent => match dir {
            // Retransmitted SYN.
            ConnDir::Original if flags & SYN != 0 && flags & ACK == 0 => Some(TcpState::SynSent),
            ConnDir::Reply if flags & (SYN | ACK) == (SYN | ACK) => Some(TcpState::SynRecv),
            _ => None,
        },
        TcpState::SynRecv => match dir {
            ConnDir::Original if flags & SYN != 0 => Some(TcpState::SynRecv),
            ConnDir::Original if flags & ACK != 0 => Some(TcpState::Established),
            ConnDir::Reply if flags & (SYN | ACK) == (SYN | ACK) => Some(TcpState::SynRecv),
            _ => None,
        },
        TcpState::Established => {
            if flags & SYN != 0 {
                // A fresh SYN inside an established flow is out of place.
                None
            } else if flags & FIN != 0 {
                Some(TcpState::FinWait)
            } else {
                Some(TcpState::Established)
            }
        }
        TcpState::FinWait => {
            if flags & FIN != 0 {
                Some(TcpState::LastAck)
            } else if flags & ACK != 0 {
                Some(TcpState::CloseWait)
            } else {
                Some(TcpState::FinWait)
            }
        }
        TcpState::CloseWait => {
            if flags & FIN != 0 {
                Some(TcpState::LastAck)
            } else {
                Some(TcpState::CloseWait)
            }
        }
        TcpState::LastAck => {
            if flags & ACK != 0 {
                Some(TcpState::TimeWait)
            } else {
                Some(TcpState::LastAck)
            }
        }
        TcpState::TimeWait => Some(TcpState::TimeWait),
        TcpState::Close => Some(TcpState::Close),
    }
}

fn tcp_ports(buf: &PktBuf, ctxt: &IpContext) -> Result<(u16, u16)> {
    let view = ctxt.l4_view(buf);
    let tcp = Tcp::parse_from(&view)?;
    Ok((tcp.src_port(), tcp.dst_port()))
}

fn tcp_flags(buf: &PktBuf, ctxt: &IpContext) -> Result<u8> {
    let view = ctxt.l4_view(buf);
    let tcp = Tcp::parse_from(&view)?;
    Ok(tcp.flags())
}

pub(crate) struct TcpClassifier;

impl ProtoClassifier for TcpClassifier {
    fn name(&self) -> &'static str {
        "tcp"
    }

    fn pkt_to_ids(&self, buf: &PktBuf, ctxt: &IpContext) -> Result<(u16, u16)> {
        tcp_ports(buf, ctxt)
    }

    fn invert_ids(&self, src_id: u16, dst_id: u16) -> Option<(u16, u16)> {
        Some((dst_id, src_id))
    }

    /// Only a bare SYN may open a connection; picking up flows mid-stream
    /// would leave the state machine guessing.
    fn new_state(&self, buf: &PktBuf, ctxt: &IpContext) -> Option<L4State> {
        match tcp_flags(buf, ctxt) {
            Ok(flags) if flags & SYN != 0 && flags & ACK == 0 && flags & RST == 0 => {
                Some(L4State::Tcp(TcpState::SynSent))
            }
            _ => None,
        }
    }

    fn packet(
        &self,
        state: &mut L4State,
        buf: &PktBuf,
        ctxt: &IpContext,
        dir: ConnDir,
        _status: Status,
        timeouts: &TimeoutConfig,
    ) -> PacketOutcome {
        let flags = match tcp_flags(buf, ctxt) {
            Ok(flags) => flags,
            Err(_) => return PacketOutcome::Invalid,
        };
        let current = match state {
            L4State::Tcp(s) => *s,
            _ => return PacketOutcome::Invalid,
        };
        match transition(current, dir, flags) {
            Some(next) => {
                *state = L4State::Tcp(next);
                PacketOutcome::Valid {
                    timeout_ms: next.timeout_ms(timeouts),
                    assured: next == TcpState::Established,
                }
            }
            None => PacketOutcome::Invalid,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_tcp_handshake_reaches_established() {
        let mut s = TcpState::SynSent;
        s = transition(s, ConnDir::Reply, SYN | ACK).unwrap();
        assert_eq!(s, TcpState::SynRecv);
        s = transition(s, ConnDir::Original, ACK).unwrap();
        assert_eq!(s, TcpState::Established);
    }

    #[test]
    fn core_tcp_teardown() {
        let mut s = TcpState::Established;
        s = transition(s, ConnDir::Original, FIN | ACK).unwrap();
        assert_eq!(s, TcpState::FinWait);
        s = transition(s, ConnDir::Reply, ACK).unwrap();
        assert_eq!(s, TcpState::CloseWait);
        s = transition(s, ConnDir::Reply, FIN | ACK).unwrap();
        assert_eq!(s, TcpState::LastAck);
        s = transition(s, ConnDir::Original, ACK).unwrap();
        assert_eq!(s, TcpState::TimeWait);
    }

    #[test]
    fn core_tcp_rst_closes_from_any_state() {
        for s in [TcpState::SynSent, TcpState::Established, TcpState::FinWait] {
            assert_eq!(transition(s, ConnDir::Reply, RST), Some(TcpState::Close));
        }
    }

    #[test]
    fn core_tcp_rejects_stray_segments() {
        // Data from the responder before the handshake answer.
        assert_eq!(transition(TcpState::SynSent, ConnDir::Reply, ACK), None);
        // A new SYN inside an established flow.
        assert_eq!(
            transition(TcpState::Established, ConnDir::Original, SYN),
            None
        );
    }
}
