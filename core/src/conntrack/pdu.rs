//! Parsed packet context and the packet/connection association.

use crate::conntrack::conn::{ConnDir, ConnHandle, PendingConn};
use crate::memory::pktbuf::PktBuf;
use crate::protocols::packet::ipv4::Ipv4;
use crate::protocols::packet::{Packet, PacketParseError};

use std::net::Ipv4Addr;

use anyhow::{bail, Result};

/// Parsed network-layer context used for connection tracking.
#[derive(Debug, Clone, Copy)]
pub struct IpContext {
    /// Source address.
    pub(crate) src: Ipv4Addr,
    /// Destination address.
    pub(crate) dst: Ipv4Addr,
    /// Layer-4 protocol number.
    pub(crate) proto: u8,
    /// Offset into the buffer where the layer-4 header begins.
    pub(crate) l4_offset: usize,
    /// One past the last byte of this datagram within the buffer.
    pub(crate) end_offset: usize,
    /// Fragment offset in units of 8 bytes.
    pub(crate) frag_offset: u16,
    /// More Fragments flag.
    pub(crate) more_frags: bool,
}

impl IpContext {
    /// Parses context from a raw IPv4 buffer. The full datagram (as declared
    /// by the total-length field) must be present.
    pub fn new(buf: &PktBuf) -> Result<Self> {
        let ipv4 = Ipv4::parse_from(buf)?;
        if ipv4.total_length() as usize > buf.data_len() {
            bail!(PacketParseError::MalformedHeader);
        }
        Ok(IpContext {
            src: ipv4.src_addr(),
            dst: ipv4.dst_addr(),
            proto: ipv4.protocol(),
            l4_offset: ipv4.next_header_offset(),
            end_offset: ipv4.total_length() as usize,
            frag_offset: ipv4.fragment_offset(),
            more_frags: ipv4.mf(),
        })
    }

    /// Builds context for a datagram embedded in an ICMP error payload, which
    /// is legitimately truncated; the usable end is capped at the enclosing
    /// datagram's end.
    pub(crate) fn new_embedded(ipv4: &Ipv4, outer_end: usize) -> Self {
        IpContext {
            src: ipv4.src_addr(),
            dst: ipv4.dst_addr(),
            proto: ipv4.protocol(),
            l4_offset: ipv4.next_header_offset(),
            end_offset: outer_end,
            frag_offset: ipv4.fragment_offset(),
            more_frags: ipv4.mf(),
        }
    }

    /// Returns the source address.
    #[inline]
    pub fn src_addr(&self) -> Ipv4Addr {
        self.src
    }

    /// Returns the destination address.
    #[inline]
    pub fn dst_addr(&self) -> Ipv4Addr {
        self.dst
    }

    /// Returns the layer-4 protocol number.
    #[inline]
    pub fn protocol(&self) -> u8 {
        self.proto
    }

    /// `true` if this datagram is any fragment of a larger one.
    #[inline]
    pub(crate) fn is_fragment(&self) -> bool {
        self.frag_offset > 0 || self.more_frags
    }

    /// A parse root positioned at this context's layer-4 header.
    #[inline]
    pub(crate) fn l4_view<'a>(&self, buf: &'a PktBuf) -> L4View<'a> {
        L4View {
            buf,
            offset: self.l4_offset,
            proto: self.proto,
        }
    }
}

/// Adapter rooting the parse chain at a layer-4 header, used both for the
/// outer datagram and for datagrams embedded in ICMP error payloads.
pub(crate) struct L4View<'a> {
    buf: &'a PktBuf,
    offset: usize,
    proto: u8,
}

impl<'a> Packet<'a> for L4View<'a> {
    fn buf(&self) -> &PktBuf {
        self.buf
    }

    fn header_len(&self) -> usize {
        0
    }

    fn next_header_offset(&self) -> usize {
        self.offset
    }

    fn next_header(&self) -> Option<usize> {
        Some(self.proto as usize)
    }

    fn parse_from(_outer: &'a impl Packet<'a>) -> Result<Self>
    where
        Self: Sized,
    {
        bail!(PacketParseError::InvalidProtocol)
    }
}

/// The connection a packet has been classified against.
pub(crate) enum PacketConn {
    /// A provisional record owned by this packet; implicitly the original
    /// direction.
    Pending(PendingConn),
    /// A confirmed record, plus the direction this packet travels relative to
    /// the first-seen packet.
    Confirmed(ConnHandle, ConnDir),
}

/// A packet moving through the tracker, carrying its connection association
/// so every subsystem that sees the packet sees the same classification.
pub struct TrackedPacket {
    pub(crate) buf: PktBuf,
    pub(crate) ctxt: IpContext,
    pub(crate) assoc: Option<PacketConn>,
}

impl TrackedPacket {
    /// Wraps a raw IPv4 datagram. Fails if the buffer does not hold a complete
    /// IPv4 header; such packets simply never participate in tracking.
    pub fn new(data: Vec<u8>) -> Result<Self> {
        let buf = PktBuf::new(data);
        let ctxt = IpContext::new(&buf)?;
        Ok(TrackedPacket {
            buf,
            ctxt,
            assoc: None,
        })
    }

    /// Returns the parsed network-layer context.
    #[inline]
    pub fn ctxt(&self) -> &IpContext {
        &self.ctxt
    }

    /// Returns the underlying buffer.
    #[inline]
    pub fn buf(&self) -> &PktBuf {
        &self.buf
    }

    /// Returns the confirmed connection this packet belongs to, if any.
    pub fn connection(&self) -> Option<&ConnHandle> {
        match &self.assoc {
            Some(PacketConn::Confirmed(handle, _)) => Some(handle),
            _ => None,
        }
    }

    /// Returns the packet's direction relative to its connection's
    /// first-seen packet.
    pub fn direction(&self) -> Option<ConnDir> {
        match &self.assoc {
            Some(PacketConn::Pending(_)) => Some(ConnDir::Original),
            Some(PacketConn::Confirmed(_, dir)) => Some(*dir),
            None => None,
        }
    }

    /// `true` if the packet is associated with a connection (confirmed or
    /// provisional).
    #[inline]
    pub fn is_tracked(&self) -> bool {
        self.assoc.is_some()
    }

    /// Severs the packet's association: it passes through untracked. A
    /// provisional record dropped here releases its live-entry slot.
    pub fn sever(&mut self) {
        self.assoc = None;
    }
}
