//! Application-protocol helpers.
//!
//! A helper attaches to connections whose reply tuple matches its registered
//! pattern and inspects every subsequent packet, typically to register
//! expectations for related flows (FTP data channels and the like).

use crate::conntrack::conn::{Conn, ConnDir, ConnHandle};
use crate::conntrack::pdu::IpContext;
use crate::conntrack::tuple::Tuple;
use crate::memory::pktbuf::PktBuf;

/// Helper's judgement on a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelperVerdict {
    /// Packet conforms to the application protocol.
    Valid,
    /// Packet does not conform; the helper is detached from the connection
    /// and the packet passes unhindered.
    Invalid,
}

/// An application-protocol helper.
///
/// Implementations must tolerate concurrent invocation, including two packets
/// of the same connection racing through inspection; any per-connection state
/// a helper keeps needs its own synchronization.
pub trait Helper: Send + Sync {
    /// Unique name, used for lookup and logging.
    fn name(&self) -> &'static str;

    /// Pattern tuple a connection's reply identity must match for this helper
    /// to attach. Wildcarded fields are zero.
    fn tuple(&self) -> Tuple;

    /// Mask selecting which fields of [`tuple`](Helper::tuple) must match.
    fn mask(&self) -> Tuple;

    /// Inspects a packet on a connection this helper is attached to.
    fn help(
        &self,
        buf: &PktBuf,
        ctxt: &IpContext,
        conn: &ConnHandle,
        dir: ConnDir,
    ) -> HelperVerdict;

    /// Called once when an attached connection is destroyed.
    fn on_destroy(&self, _conn: &Conn) {}
}
