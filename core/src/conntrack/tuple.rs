//! Directional flow tuples.
//!
//! A [Tuple] is the identity of one direction of a flow: source and
//! destination address, protocol-specific endpoint identifiers (ports for TCP
//! and UDP, the identifier and type/code word for ICMP), and the protocol
//! number. A connection is keyed by two tuples, the original direction as
//! first seen and its reply mirror.
//!
//! Tuples double as masks: expectation patterns and helper registrations match
//! candidates field-wise under a bitwise AND with a mask tuple.

use std::fmt;
use std::net::Ipv4Addr;

use serde::Serialize;

/// The identity of one direction of a flow.
#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq, Serialize)]
pub struct Tuple {
    /// Sender address.
    pub src_addr: Ipv4Addr,
    /// Receiver address.
    pub dst_addr: Ipv4Addr,
    /// Protocol-specific sender identifier (e.g. source port, ICMP echo id).
    pub src_id: u16,
    /// Protocol-specific receiver identifier (e.g. destination port, ICMP
    /// type/code).
    pub dst_id: u16,
    /// Layer-4 protocol number.
    pub proto: u8,
}

impl Tuple {
    /// A mask that requires every field to match exactly.
    pub const EXACT: Tuple = Tuple {
        src_addr: Ipv4Addr::new(255, 255, 255, 255),
        dst_addr: Ipv4Addr::new(255, 255, 255, 255),
        src_id: 0xffff,
        dst_id: 0xffff,
        proto: 0xff,
    };

    /// Returns `true` if `self` and `other` are equal after AND-ing every
    /// field of both with the corresponding field of `mask`.
    pub fn masked_eq(&self, other: &Tuple, mask: &Tuple) -> bool {
        let m_src = u32::from(mask.src_addr);
        let m_dst = u32::from(mask.dst_addr);
        u32::from(self.src_addr) & m_src == u32::from(other.src_addr) & m_src
            && u32::from(self.dst_addr) & m_dst == u32::from(other.dst_addr) & m_dst
            && self.src_id & mask.src_id == other.src_id & mask.src_id
            && self.dst_id & mask.dst_id == other.dst_id & mask.dst_id
            && self.proto & mask.proto == other.proto & mask.proto
    }

    /// Returns the field-wise AND of two masks.
    pub fn mask_and(&self, other: &Tuple) -> Tuple {
        Tuple {
            src_addr: Ipv4Addr::from(u32::from(self.src_addr) & u32::from(other.src_addr)),
            dst_addr: Ipv4Addr::from(u32::from(self.dst_addr) & u32::from(other.dst_addr)),
            src_id: self.src_id & other.src_id,
            dst_id: self.dst_id & other.dst_id,
            proto: self.proto & other.proto,
        }
    }
}

impl fmt::Display for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} -> ", self.src_addr, self.src_id)?;
        write!(f, "{}:{}", self.dst_addr, self.dst_id)?;
        write!(f, " protocol {}", self.proto)?;
        Ok(())
    }
}

/// Maps a tuple to a bucket index in `[0, nb_buckets)`.
///
/// FNV-1a over the tuple's fields in a fixed source-then-destination order: a
/// pure function of the field values, so reply-direction lookups always land
/// on the same bucket algorithm as forward lookups, and order-sensitive, so
/// that a tuple and its own inverse rarely share a bucket.
#[inline]
pub(crate) fn bucket(tuple: &Tuple, nb_buckets: usize) -> usize {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0100_0000_01b3;

    let mut hash = FNV_OFFSET;
    let mut mix = |byte: u8| {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    };
    for b in tuple.src_addr.octets() {
        mix(b);
    }
    for b in tuple.src_id.to_be_bytes() {
        mix(b);
    }
    for b in tuple.dst_addr.octets() {
        mix(b);
    }
    for b in tuple.dst_id.to_be_bytes() {
        mix(b);
    }
    mix(tuple.proto);
    (hash % nb_buckets as u64) as usize
}
