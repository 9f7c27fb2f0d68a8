//! ICMP packet.

use crate::memory::pktbuf::PktBuf;
use crate::protocols::packet::{Packet, PacketHeader, PacketParseError};
use crate::utils::types::*;

use anyhow::{bail, Result};

/// ICMP assigned protocol number.
pub const ICMP_PROTOCOL: u8 = 1;
const ICMP_HEADER_LEN: usize = 8;

// ICMP message types.
pub const ICMP_ECHO_REPLY: u8 = 0;
pub const ICMP_DEST_UNREACH: u8 = 3;
pub const ICMP_SOURCE_QUENCH: u8 = 4;
pub const ICMP_REDIRECT: u8 = 5;
pub const ICMP_ECHO: u8 = 8;
pub const ICMP_TIME_EXCEEDED: u8 = 11;
pub const ICMP_PARAMETERPROB: u8 = 12;
pub const ICMP_TIMESTAMP: u8 = 13;
pub const ICMP_TIMESTAMP_REPLY: u8 = 14;
pub const ICMP_INFO_REQUEST: u8 = 15;
pub const ICMP_INFO_REPLY: u8 = 16;
pub const ICMP_ADDRESS: u8 = 17;
pub const ICMP_ADDRESS_REPLY: u8 = 18;

/// An ICMP packet.
///
/// The `rest_of_header` field is interpreted as an identifier/sequence pair,
/// which is only meaningful for id-bearing query messages (echo, timestamp,
/// information, address mask). For error messages the payload carries the
/// embedded IPv4 datagram that triggered the error.
#[derive(Debug)]
pub struct Icmp<'a> {
    /// Fixed header.
    header: IcmpHeader,
    /// Offset to `header` from the start of `buf`.
    offset: usize,
    /// Packet buffer.
    buf: &'a PktBuf,
}

impl<'a> Icmp<'a> {
    /// Returns the ICMP message type.
    #[inline]
    pub fn msg_type(&self) -> u8 {
        self.header.msg_type
    }

    /// Returns the ICMP message code.
    #[inline]
    pub fn code(&self) -> u8 {
        self.header.code
    }

    /// Returns the ICMP checksum.
    #[inline]
    pub fn checksum(&self) -> u16 {
        self.header.checksum.into()
    }

    /// Returns the identifier of a query message.
    #[inline]
    pub fn echo_id(&self) -> u16 {
        self.header.echo_id.into()
    }

    /// Returns the sequence number of a query message.
    #[inline]
    pub fn echo_seq(&self) -> u16 {
        self.header.echo_seq.into()
    }

    /// Returns `true` if this message type carries an embedded IPv4 datagram
    /// describing the packet that triggered an error.
    #[inline]
    pub fn is_error(&self) -> bool {
        matches!(
            self.msg_type(),
            ICMP_DEST_UNREACH
                | ICMP_SOURCE_QUENCH
                | ICMP_REDIRECT
                | ICMP_TIME_EXCEEDED
                | ICMP_PARAMETERPROB
        )
    }
}

impl<'a> Packet<'a> for Icmp<'a> {
    fn buf(&self) -> &PktBuf {
        self.buf
    }

    fn header_len(&self) -> usize {
        ICMP_HEADER_LEN
    }

    fn next_header_offset(&self) -> usize {
        self.offset + self.header_len()
    }

    fn next_header(&self) -> Option<usize> {
        // Error payloads embed the offending IPv4 datagram.
        None
    }

    fn parse_from(outer: &'a impl Packet<'a>) -> Result<Self>
    where
        Self: Sized,
    {
        let offset = outer.next_header_offset();
        if let Ok(header) = outer.buf().get_data::<IcmpHeader>(offset) {
            match outer.next_header() {
                Some(proto) if proto == ICMP_PROTOCOL as usize => Ok(Icmp {
                    header: unsafe { *header },
                    offset,
                    buf: outer.buf(),
                }),
                _ => bail!(PacketParseError::InvalidProtocol),
            }
        } else {
            bail!(PacketParseError::InvalidRead)
        }
    }
}

/// ICMP header, with the "rest of header" word laid out as an echo
/// identifier/sequence pair.
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
struct IcmpHeader {
    msg_type: u8,
    code: u8,
    checksum: u16be,
    echo_id: u16be,
    echo_seq: u16be,
}

impl PacketHeader for IcmpHeader {
    fn length(&self) -> usize {
        ICMP_HEADER_LEN
    }
}

/// Computes the Internet checksum (RFC 1071) over `data`.
pub(crate) fn internet_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u32::from(u16::from_be_bytes([chunk[0], chunk[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(u16::from_be_bytes([*last, 0]));
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}
