//! A standalone, concurrent connection-tracking engine for IPv4 traffic.
//!
//! Flowtrack maintains a hash-indexed table of bidirectional flow records, each
//! keyed by two directional tuples (the original direction as first seen, and
//! its reply mirror). It supports tuple-based lookup, two-phase insertion
//! (provisional records become externally visible only on confirmation),
//! expectation tracking for related connections, pluggable per-application
//! helpers, and timeout-based eviction with early drop under capacity
//! pressure. It is the state-tracking core of a stateful firewall, NAT
//! gateway, or load balancer, packaged as a library.
//!
//! A minimal packet walk looks like:
//!
//! ```rust,no_run
//! use flowtrack_core::config::default_config;
//! use flowtrack_core::conntrack::pdu::TrackedPacket;
//! use flowtrack_core::conntrack::{ConnTracker, Hook};
//!
//! let tracker = ConnTracker::new(&default_config());
//! let raw: Vec<u8> = vec![]; // an IPv4 datagram
//! if let Ok(mut pkt) = TrackedPacket::new(raw) {
//!     tracker.track(&mut pkt, Hook::PreRouting);
//!     // ... address translation, routing, filtering ...
//!     tracker.confirm_packet(&mut pkt);
//! }
//! ```
//!
//! Packets that fail to parse are simply never associated with a connection;
//! the tracker never fails a caller on behalf of a single malformed packet.

pub mod config;
pub mod conntrack;
pub mod memory;
pub mod protocols;
mod stats;
pub mod utils;

pub use self::conntrack::conn::{Conn, ConnDir, ConnHandle, PendingConn, Status};
pub use self::conntrack::pdu::{IpContext, TrackedPacket};
pub use self::conntrack::tuple::Tuple;
pub use self::conntrack::helper::{Helper, HelperVerdict};
pub use self::conntrack::{ConnTrackError, ConnTracker, Defrag, Hook, Verdict};
pub use self::memory::pktbuf::PktBuf;
pub use self::stats::{snapshot, TrackerStats};
