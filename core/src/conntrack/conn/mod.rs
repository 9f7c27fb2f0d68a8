//! Connection records.
//!
//! A connection exists in one of two type-distinguished phases. A
//! [PendingConn] is provisional: it is not in the lookup table, its reply
//! tuple may still be rewritten (e.g. by address translation), and it is owned
//! by the packet that created it. Confirmation converts it into a [Conn]
//! behind an [`Arc`] handle; from that point the tuples are immutable, the
//! record is discoverable under both of them, and its lifetime is governed by
//! reference counting: the table, any packets in flight, and master links all
//! hold shares, and the record is destroyed exactly once when the last share
//! drops.

use crate::conntrack::helper::Helper;
pub use crate::conntrack::proto::tcp::TcpState;
use crate::conntrack::tuple::Tuple;
use crate::conntrack::TrackerShared;

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use bitmask_enum::bitmask;

/// Shared-ownership handle to a confirmed connection.
pub type ConnHandle = Arc<Conn>;

/// Callback run when a confirmed connection is destroyed (its last reference
/// dropped), for companion subsystems to clean up.
pub type DestroyCallback = Arc<dyn Fn(&Conn) + Send + Sync>;

/// Connection status bits.
#[bitmask(u8)]
pub enum Status {
    /// A packet has been seen in the reply direction.
    SeenReply,
    /// Traffic has flowed both ways; exempt from early drop.
    Assured,
    /// The record is (or has been) inserted in the lookup table.
    Confirmed,
    /// The record was created to satisfy another connection's expectation.
    Expected,
    /// The record has been unlinked from the table and awaits destruction.
    Dying,
}

/// The two halves of a bidirectional flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnDir {
    /// The direction of the first-seen packet.
    Original,
    /// The mirror direction.
    Reply,
}

impl ConnDir {
    /// Returns `true` for the original direction.
    #[inline]
    pub fn is_original(&self) -> bool {
        matches!(self, ConnDir::Original)
    }
}

/// Per-protocol connection state, opaque to the table logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum L4State {
    Tcp(TcpState),
    Udp,
    Icmp,
    Generic,
}

/// A confirmed connection record.
///
/// Tuples are fixed at confirmation time; everything mutable lives behind
/// atomics or a leaf mutex so that records can be shared outside the table
/// lock.
pub struct Conn {
    /// The flow identity as first seen.
    original: Tuple,
    /// The expected mirror identity.
    reply: Tuple,
    /// Status bit-set.
    status: AtomicU8,
    /// Relative inactivity timeout (in milliseconds).
    timeout_ms: AtomicU64,
    /// Absolute deadline (milliseconds since tracker start).
    expires_at_ms: AtomicU64,
    /// Bumped on every reschedule; stale timer entries observe a mismatch and
    /// become no-ops.
    generation: AtomicU64,
    /// Per-protocol state.
    l4: Mutex<L4State>,
    /// Parent connection, if this one fulfilled an expectation.
    master: Option<ConnHandle>,
    /// Application-protocol helper claimed at creation, cleared on helper
    /// unregistration.
    helper: Mutex<Option<Arc<dyn Helper>>>,
    /// Destruction notification.
    destroy_cb: Option<DestroyCallback>,
}

impl Conn {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn confirmed(
        original: Tuple,
        reply: Tuple,
        status: Status,
        timeout_ms: u64,
        expires_at_ms: u64,
        l4: L4State,
        master: Option<ConnHandle>,
        helper: Option<Arc<dyn Helper>>,
        destroy_cb: Option<DestroyCallback>,
    ) -> ConnHandle {
        Arc::new(Conn {
            original,
            reply,
            status: AtomicU8::new((status | Status::Confirmed).bits),
            timeout_ms: AtomicU64::new(timeout_ms),
            expires_at_ms: AtomicU64::new(expires_at_ms),
            generation: AtomicU64::new(0),
            l4: Mutex::new(l4),
            master,
            helper: Mutex::new(helper),
            destroy_cb,
        })
    }

    /// The flow identity as first seen.
    #[inline]
    pub fn original(&self) -> &Tuple {
        &self.original
    }

    /// The expected mirror identity.
    #[inline]
    pub fn reply(&self) -> &Tuple {
        &self.reply
    }

    /// Current status bits.
    #[inline]
    pub fn status(&self) -> Status {
        Status::from(self.status.load(Ordering::Acquire))
    }

    #[inline]
    pub fn is_confirmed(&self) -> bool {
        self.status().intersects(Status::Confirmed)
    }

    #[inline]
    pub fn is_assured(&self) -> bool {
        self.status().intersects(Status::Assured)
    }

    #[inline]
    pub fn seen_reply(&self) -> bool {
        self.status().intersects(Status::SeenReply)
    }

    #[inline]
    pub fn is_expected(&self) -> bool {
        self.status().intersects(Status::Expected)
    }

    #[inline]
    pub(crate) fn is_dying(&self) -> bool {
        self.status().intersects(Status::Dying)
    }

    /// Sets the dying bit. Returns `true` if this call made the transition,
    /// so exactly one caller unlinks the record.
    pub(crate) fn mark_dying(&self) -> bool {
        let prev = Status::from(self.status.fetch_or(Status::Dying.bits, Ordering::AcqRel));
        !prev.intersects(Status::Dying)
    }

    #[inline]
    pub(crate) fn set_status(&self, bits: Status) {
        self.status.fetch_or(bits.bits, Ordering::AcqRel);
    }

    /// The connection this one was expected by, if any.
    pub fn master(&self) -> Option<&ConnHandle> {
        self.master.as_ref()
    }

    /// The helper claimed by this connection, if any.
    pub fn helper(&self) -> Option<Arc<dyn Helper>> {
        self.helper.lock().unwrap().clone()
    }

    pub(crate) fn clear_helper(&self) {
        *self.helper.lock().unwrap() = None;
    }

    /// Matches `tuple` against both directions.
    pub(crate) fn dir_of(&self, tuple: &Tuple) -> Option<ConnDir> {
        if self.original == *tuple {
            Some(ConnDir::Original)
        } else if self.reply == *tuple {
            Some(ConnDir::Reply)
        } else {
            None
        }
    }

    #[inline]
    pub(crate) fn expires_at_ms(&self) -> u64 {
        self.expires_at_ms.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Reschedules the deadline: publish the new absolute expiry, then retire
    /// every previously scheduled firing by bumping the generation. The timer
    /// wheel re-checks both before acting, which closes the race with an
    /// in-flight expiry.
    pub(crate) fn reschedule(&self, now_ms: u64, timeout_ms: u64) -> (u64, u64) {
        let expires = now_ms + timeout_ms;
        self.timeout_ms.store(timeout_ms, Ordering::Release);
        self.expires_at_ms.store(expires, Ordering::Release);
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        (generation, expires)
    }

    pub(crate) fn l4(&self) -> &Mutex<L4State> {
        &self.l4
    }
}

impl Drop for Conn {
    fn drop(&mut self) {
        if let Some(helper) = self.helper.lock().unwrap().take() {
            helper.on_destroy(self);
        }
        if let Some(cb) = self.destroy_cb.take() {
            cb(self);
        }
    }
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("original", &self.original)
            .field("reply", &self.reply)
            .field("status", &self.status.load(Ordering::Relaxed))
            .finish()
    }
}

struct PendingInner {
    original: Tuple,
    reply: Tuple,
    status: Status,
    timeout_ms: u64,
    l4: L4State,
    master: Option<ConnHandle>,
    helper: Option<Arc<dyn Helper>>,
}

/// A provisional connection record, not yet visible in the lookup table.
///
/// Created when a packet matches no existing connection. The reply tuple may
/// be rewritten until confirmation; dropping an unconfirmed record releases
/// its slot in the live-entry budget.
pub struct PendingConn {
    shared: Arc<TrackerShared>,
    inner: Option<PendingInner>,
}

impl PendingConn {
    pub(crate) fn new(
        shared: Arc<TrackerShared>,
        original: Tuple,
        reply: Tuple,
        timeout_ms: u64,
        l4: L4State,
    ) -> Self {
        PendingConn {
            shared,
            inner: Some(PendingInner {
                original,
                reply,
                status: Status::none(),
                timeout_ms,
                l4,
                master: None,
                helper: None,
            }),
        }
    }

    fn inner(&self) -> &PendingInner {
        self.inner.as_ref().expect("unconfirmed record already consumed")
    }

    fn inner_mut(&mut self) -> &mut PendingInner {
        self.inner.as_mut().expect("unconfirmed record already consumed")
    }

    /// The flow identity as first seen.
    pub fn original(&self) -> &Tuple {
        &self.inner().original
    }

    /// The reply tuple this record will be indexed under once confirmed.
    pub fn reply(&self) -> &Tuple {
        &self.inner().reply
    }

    /// Rewrites the reply tuple. Only possible before confirmation; this is
    /// the seam address translation uses to retarget the mirror direction.
    pub fn set_reply_tuple(&mut self, reply: Tuple) {
        self.inner_mut().reply = reply;
    }

    /// Status bits accumulated so far.
    pub fn status(&self) -> Status {
        self.inner().status
    }

    /// `true` if this record fulfilled another connection's expectation.
    pub fn is_expected(&self) -> bool {
        self.inner().status.intersects(Status::Expected)
    }

    /// The expectant connection, if this record fulfilled an expectation.
    pub fn master(&self) -> Option<&ConnHandle> {
        self.inner().master.as_ref()
    }

    /// The helper claimed at creation, if any.
    pub fn helper(&self) -> Option<&Arc<dyn Helper>> {
        self.inner().helper.as_ref()
    }

    /// Rewrites the relative timeout that will be armed at confirmation.
    pub fn set_timeout_ms(&mut self, timeout_ms: u64) {
        self.inner_mut().timeout_ms = timeout_ms;
    }

    pub(crate) fn set_status(&mut self, bits: Status) {
        self.inner_mut().status |= bits;
    }

    pub(crate) fn set_master(&mut self, master: ConnHandle) {
        self.inner_mut().master = Some(master);
    }

    pub(crate) fn set_helper(&mut self, helper: Arc<dyn Helper>) {
        self.inner_mut().helper = Some(helper);
    }

    pub(crate) fn l4_mut(&mut self) -> &mut L4State {
        &mut self.inner_mut().l4
    }

    /// Consumes the provisional state for table insertion. The live-entry slot
    /// transfers to the confirmed record, so `Drop` no longer releases it.
    pub(crate) fn into_parts(
        mut self,
    ) -> (
        Tuple,
        Tuple,
        Status,
        u64,
        L4State,
        Option<ConnHandle>,
        Option<Arc<dyn Helper>>,
    ) {
        let inner = self
            .inner
            .take()
            .expect("unconfirmed record already consumed");
        (
            inner.original,
            inner.reply,
            inner.status,
            inner.timeout_ms,
            inner.l4,
            inner.master,
            inner.helper,
        )
    }
}

impl Drop for PendingConn {
    fn drop(&mut self) {
        if self.inner.is_some() {
            self.shared.forget_unconfirmed();
        }
    }
}

impl std::fmt::Debug for PendingConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.inner {
            Some(inner) => f
                .debug_struct("PendingConn")
                .field("original", &inner.original)
                .field("reply", &inner.reply)
                .finish(),
            None => f.write_str("PendingConn(consumed)"),
        }
    }
}
