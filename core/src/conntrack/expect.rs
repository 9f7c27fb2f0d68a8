//! Expectations: tuples (with wildcard masks) that an established connection
//! announces it is about to cause, so the matching new flow is linked back to
//! its master instead of being treated as unrelated.

use crate::conntrack::conn::{ConnHandle, PendingConn};
use crate::conntrack::tuple::Tuple;

use std::fmt;
use std::sync::Arc;

/// Invoked on the provisional record of a flow that fulfilled an expectation,
/// after the master link is in place. Runs outside the table lock.
pub type ExpectCallback = Box<dyn FnOnce(&mut PendingConn) + Send + Sync>;

/// A registered expectation.
pub(crate) struct Expectation {
    /// Pattern tuple; wildcarded fields are zero.
    pub(crate) tuple: Tuple,
    /// Mask selecting which fields of `tuple` must match.
    pub(crate) mask: Tuple,
    /// The connection that announced this expectation.
    pub(crate) master: ConnHandle,
    /// One-shot setup hook, consumed on fulfillment.
    pub(crate) callback: Option<ExpectCallback>,
}

impl Expectation {
    /// `true` if `tuple` fulfills this expectation.
    #[inline]
    pub(crate) fn matches(&self, tuple: &Tuple) -> bool {
        self.tuple.masked_eq(tuple, &self.mask)
    }

    /// `true` if another expectation's pattern overlaps this one: some
    /// concrete tuple could fulfill both.
    pub(crate) fn clashes_with(&self, tuple: &Tuple, mask: &Tuple) -> bool {
        let common = self.mask.mask_and(mask);
        self.tuple.masked_eq(tuple, &common)
    }

    /// `true` if this expectation belongs to `master`.
    #[inline]
    pub(crate) fn owned_by(&self, master: &ConnHandle) -> bool {
        Arc::ptr_eq(&self.master, master)
    }
}

impl fmt::Debug for Expectation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Expectation")
            .field("tuple", &self.tuple)
            .field("mask", &self.mask)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conntrack::conn::{Conn, L4State, Status};
    use std::net::Ipv4Addr;

    fn tuple(src_id: u16, dst_id: u16) -> Tuple {
        Tuple {
            src_addr: Ipv4Addr::new(10, 0, 0, 1),
            dst_addr: Ipv4Addr::new(10, 0, 0, 2),
            src_id,
            dst_id,
            proto: 6,
        }
    }

    fn port_wildcard_mask() -> Tuple {
        Tuple {
            src_addr: Ipv4Addr::new(255, 255, 255, 255),
            dst_addr: Ipv4Addr::new(255, 255, 255, 255),
            src_id: 0,
            dst_id: 0xffff,
            proto: 0xff,
        }
    }

    fn master() -> ConnHandle {
        let mut reply = tuple(21, 1000);
        std::mem::swap(&mut reply.src_addr, &mut reply.dst_addr);
        Conn::confirmed(
            tuple(1000, 21),
            reply,
            Status::none(),
            60_000,
            60_000,
            L4State::Generic,
            None,
            None,
            None,
        )
    }

    #[test]
    fn core_expect_masked_match() {
        let exp = Expectation {
            tuple: tuple(0, 2021),
            mask: port_wildcard_mask(),
            master: master(),
            callback: None,
        };
        assert!(exp.matches(&tuple(40000, 2021)));
        assert!(exp.matches(&tuple(1, 2021)));
        assert!(!exp.matches(&tuple(40000, 2022)));
    }

    #[test]
    fn core_expect_clash_detection() {
        let exp = Expectation {
            tuple: tuple(0, 2021),
            mask: port_wildcard_mask(),
            master: master(),
            callback: None,
        };
        // Same pattern from another master clashes.
        assert!(exp.clashes_with(&tuple(0, 2021), &port_wildcard_mask()));
        // An exact tuple that the wildcard covers clashes too.
        assert!(exp.clashes_with(&tuple(40000, 2021), &Tuple::EXACT));
        // Disjoint destination port cannot overlap.
        assert!(!exp.clashes_with(&tuple(0, 9999), &port_wildcard_mask()));
    }
}
