//! Packet buffer ownership.

pub mod pktbuf;
