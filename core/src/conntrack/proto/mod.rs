//! Per-protocol classification.
//!
//! Each layer-4 protocol the tracker understands is represented by a
//! classifier: it extracts the protocol-specific half of a tuple from packet
//! bytes, inverts those fields for the reply direction, vets the first packet
//! of a would-be connection, and drives per-packet state transitions.
//! Unrecognized protocols fall back to [generic::GenericClassifier], which
//! tracks on addresses and protocol number alone.

pub(crate) mod generic;
pub(crate) mod icmp;
pub(crate) mod tcp;
pub(crate) mod udp;

use crate::config::TimeoutConfig;
use crate::conntrack::conn::{ConnDir, ConnHandle, L4State, Status};
use crate::conntrack::pdu::IpContext;
use crate::conntrack::{Hook, TrackerShared};
use crate::memory::pktbuf::PktBuf;
use crate::protocols::packet::icmp::ICMP_PROTOCOL;
use crate::protocols::packet::tcp::TCP_PROTOCOL;
use crate::protocols::packet::udp::UDP_PROTOCOL;

use std::sync::Arc;

use anyhow::Result;

/// Result of a per-packet state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PacketOutcome {
    /// The packet fits the flow; extend the deadline by `timeout_ms`, and
    /// optionally promote the connection to assured.
    Valid { timeout_ms: u64, assured: bool },
    /// The packet does not fit the flow; sever its association and let it
    /// pass untracked.
    Invalid,
}

/// Result of a classifier's early-handling hook.
pub(crate) enum EarlyVerdict {
    /// The packet belongs to an existing connection (e.g. an ICMP error
    /// referencing it); attach and accept.
    Attach(ConnHandle, ConnDir),
    /// The packet is claimed but carries no trackable association (e.g. a
    /// malformed or unmatched ICMP error); accept untracked.
    Untracked,
}

/// A per-protocol classifier.
pub(crate) trait ProtoClassifier: Send + Sync {
    fn name(&self) -> &'static str;

    /// Extracts the protocol-specific endpoint identifiers `(src_id, dst_id)`
    /// from the layer-4 header. Fails on truncated headers.
    fn pkt_to_ids(&self, buf: &PktBuf, ctxt: &IpContext) -> Result<(u16, u16)>;

    /// Inverts the protocol-specific identifiers for the reply direction.
    /// Returns `None` if the protocol has no meaningful inverse (some ICMP
    /// types).
    fn invert_ids(&self, src_id: u16, dst_id: u16) -> Option<(u16, u16)>;

    /// Called once when a packet would create a new connection. Returns the
    /// initial protocol state, or `None` to refuse creation (e.g. a TCP first
    /// packet without SYN).
    fn new_state(&self, buf: &PktBuf, ctxt: &IpContext) -> Option<L4State>;

    /// Per-packet state transition for an existing (or just-created) flow.
    fn packet(
        &self,
        state: &mut L4State,
        buf: &PktBuf,
        ctxt: &IpContext,
        dir: ConnDir,
        status: Status,
        timeouts: &TimeoutConfig,
    ) -> PacketOutcome;

    /// Protocol-specific early handling that bypasses the normal
    /// lookup-or-create path. Returning `Some` claims the packet.
    fn early(
        &self,
        shared: &Arc<TrackerShared>,
        buf: &PktBuf,
        ctxt: &IpContext,
        hook: Hook,
    ) -> Option<EarlyVerdict> {
        let _ = (shared, buf, ctxt, hook);
        None
    }
}

/// Returns the classifier for `proto`, falling back to the generic
/// pass-through classifier for unrecognized protocols.
pub(crate) fn classifier_for(proto: u8) -> &'static dyn ProtoClassifier {
    match proto {
        TCP_PROTOCOL => &tcp::TcpClassifier,
        UDP_PROTOCOL => &udp::UdpClassifier,
        ICMP_PROTOCOL => &icmp::IcmpClassifier,
        _ => &generic::GenericClassifier,
    }
}
