//! Connection tracking.
//!
//! The tracker maintains a hash-indexed table of bidirectional flow records.
//! Each confirmed record is indexed under both of its tuples, so a packet in
//! either direction finds the same record. New flows pass through a two-phase
//! lifecycle: [`track`](ConnTracker::track) hands the packet a provisional
//! record invisible to other packets, and
//! [`confirm_packet`](ConnTracker::confirm_packet), called once the packet has
//! cleared the caller's intermediate processing (address translation, filter
//! verdicts), publishes it to the table.

pub mod conn;
pub mod expect;
pub mod helper;
pub mod pdu;
pub(crate) mod proto;
mod timerwheel;
pub mod tuple;

use self::conn::{Conn, ConnDir, ConnHandle, DestroyCallback, PendingConn, Status};
use self::expect::{ExpectCallback, Expectation};
use self::helper::{Helper, HelperVerdict};
use self::pdu::{IpContext, PacketConn, TrackedPacket};
use self::proto::{classifier_for, EarlyVerdict, PacketOutcome};
use self::timerwheel::TimerWheel;
use self::tuple::Tuple;
use crate::config::{ConnTrackConfig, TrackerConfig};
use crate::memory::pktbuf::PktBuf;
use crate::stats::{StatExt, CONFIRM_RACES, EARLY_DROPS, FULL_DROPS, NEW_CONNS, TIMED_OUT};

use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{bounded, tick, Sender};
use crossbeam::select;
use thiserror::Error;

/// Traversal point a packet is seen at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hook {
    PreRouting,
    LocalIn,
    Forward,
    LocalOut,
    PostRouting,
}

/// The tracker's judgement on a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Continue processing the packet.
    Accept,
    /// Discard the packet.
    Drop,
    /// The tracker has taken ownership of the packet (e.g. stashed a
    /// fragment); the caller must stop processing it.
    Stolen,
}

#[derive(Error, Debug)]
pub enum ConnTrackError {
    #[error("connection table is full")]
    TableFull,
    #[error("tuple has no reply-direction inverse")]
    NoInverse,
    #[error("protocol refused to open a connection")]
    Refused,
    #[error("a confirmed connection already owns this flow")]
    Collision,
    #[error("an overlapping expectation is held by another connection")]
    ExpectBusy,
    #[error("no matching expectation")]
    NoSuchExpectation,
    #[error("a helper with this name is already registered")]
    HelperExists,
}

/// IPv4 reassembly provider. The tracker itself never reassembles; without a
/// registered provider, fragments pass through untracked.
pub trait Defrag: Send + Sync {
    /// Offers a fragment. Returns the complete raw datagram once all pieces
    /// have arrived, or `None` to take ownership of the fragment and wait.
    fn reassemble(&self, buf: &PktBuf, ctxt: &IpContext) -> Option<Vec<u8>>;
}

/// Table state guarded by the tracker's single reader-writer lock.
///
/// Expectations and helper registrations live under the same lock as the
/// hash chains: every mutation that consults one of them also touches the
/// others, and a single lock keeps their views consistent.
struct TableInner {
    /// Hash chains. Confirmed records appear in the bucket of each of their
    /// two tuples; new records are prepended, so a chain's tail is its oldest
    /// entry.
    buckets: Vec<VecDeque<ConnHandle>>,
    /// Registered expectations, each consumed by the first flow fulfilling it.
    expectations: Vec<Expectation>,
    /// Registered application-protocol helpers.
    helpers: Vec<Arc<dyn Helper>>,
}

/// State shared between the tracker handle, provisional records, and the
/// reaper thread.
pub(crate) struct TrackerShared {
    config: TrackerConfig,
    table: RwLock<TableInner>,
    wheel: Mutex<TimerWheel>,
    /// Live records, confirmed and provisional. Bounds table occupancy
    /// without taking the table lock on the unconfirmed-drop path.
    live: AtomicUsize,
    /// Rotates the bucket early drop samples first.
    rr_bucket: AtomicUsize,
    start_ts: Instant,
    destroy_cb: Mutex<Option<DestroyCallback>>,
    defrag: Option<Arc<dyn Defrag>>,
}

impl TrackerShared {
    /// Milliseconds elapsed since the tracker was created. All deadlines are
    /// relative to this clock.
    pub(crate) fn now_ms(&self) -> u64 {
        self.start_ts.elapsed().as_millis() as u64
    }

    /// Looks up a non-dying connection by tuple, in either direction.
    pub(crate) fn find(&self, tuple: &Tuple) -> Option<(ConnHandle, ConnDir)> {
        let inner = self.table.read().unwrap();
        for conn in &inner.buckets[tuple::bucket(tuple, self.config.nb_buckets)] {
            if conn.is_dying() {
                continue;
            }
            if let Some(dir) = conn.dir_of(tuple) {
                return Some((conn.clone(), dir));
            }
        }
        None
    }

    /// Claims a live-entry slot, failing when the table is at capacity.
    fn reserve_slot(&self) -> bool {
        let mut cur = self.live.load(Ordering::Acquire);
        loop {
            if cur >= self.config.max_entries {
                return false;
            }
            match self
                .live
                .compare_exchange_weak(cur, cur + 1, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(observed) => cur = observed,
            }
        }
    }

    /// Releases the slot held by a provisional record that was dropped
    /// without confirmation.
    pub(crate) fn forget_unconfirmed(&self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
    }

    /// Creates a provisional record for a flow with no table entry. Binds a
    /// matching expectation (consuming it) or a matching helper, in that
    /// order of preference.
    fn init_conntrack(
        self: &Arc<Self>,
        clf: &'static dyn proto::ProtoClassifier,
        tuple: Tuple,
        buf: &PktBuf,
        ctxt: &IpContext,
    ) -> Result<PendingConn, ConnTrackError> {
        let (inv_src, inv_dst) = clf
            .invert_ids(tuple.src_id, tuple.dst_id)
            .ok_or(ConnTrackError::NoInverse)?;
        let reply = Tuple {
            src_addr: tuple.dst_addr,
            dst_addr: tuple.src_addr,
            src_id: inv_src,
            dst_id: inv_dst,
            proto: tuple.proto,
        };
        let l4 = clf.new_state(buf, ctxt).ok_or(ConnTrackError::Refused)?;

        if !self.reserve_slot() {
            let hint = tuple::bucket(&tuple, self.config.nb_buckets);
            if !(self.early_drop(hint) && self.reserve_slot()) {
                return Err(ConnTrackError::TableFull);
            }
        }
        NEW_CONNS.inc();

        let mut pending = PendingConn::new(
            Arc::clone(self),
            tuple,
            reply,
            self.config.timeouts.generic,
            l4,
        );
        let callback = {
            let mut inner = self.table.write().unwrap();
            let matched = inner
                .expectations
                .iter()
                .position(|exp| exp.matches(pending.original()));
            let helper = inner
                .helpers
                .iter()
                .find(|h| h.tuple().masked_eq(pending.reply(), &h.mask()))
                .cloned();
            if let Some(helper) = helper {
                pending.set_helper(helper);
            }
            if let Some(pos) = matched {
                let exp = inner.expectations.remove(pos);
                pending.set_status(Status::Expected);
                pending.set_master(exp.master);
                exp.callback
            } else {
                None
            }
        };
        // The expectant's setup hook runs outside the table lock so it may
        // itself register expectations or query the table.
        if let Some(callback) = callback {
            callback(&mut pending);
        }
        Ok(pending)
    }

    /// Publishes a provisional record to the table. Fails if a concurrent
    /// packet confirmed the same flow first; at most one record ever owns a
    /// tuple pair.
    pub(crate) fn confirm(&self, pending: PendingConn) -> Result<ConnHandle, ConnTrackError> {
        let (original, reply, status, timeout_ms, l4, master, helper) = pending.into_parts();
        let now = self.now_ms();
        let nb_buckets = self.config.nb_buckets;
        let bucket_orig = tuple::bucket(&original, nb_buckets);
        let bucket_repl = tuple::bucket(&reply, nb_buckets);

        let mut inner = self.table.write().unwrap();
        let taken = inner.buckets[bucket_orig]
            .iter()
            .chain(inner.buckets[bucket_repl].iter())
            .any(|conn| {
                !conn.is_dying()
                    && (conn.dir_of(&original).is_some() || conn.dir_of(&reply).is_some())
            });
        if taken {
            drop(inner);
            // The slot transferred out of the provisional record above; give
            // it back since no confirmed record takes it over.
            self.forget_unconfirmed();
            CONFIRM_RACES.inc();
            return Err(ConnTrackError::Collision);
        }

        let destroy_cb = self.destroy_cb.lock().unwrap().clone();
        let handle = Conn::confirmed(
            original,
            reply,
            status,
            timeout_ms,
            now + timeout_ms,
            l4,
            master,
            helper,
            destroy_cb,
        );
        inner.buckets[bucket_orig].push_front(handle.clone());
        inner.buckets[bucket_repl].push_front(handle.clone());
        drop(inner);

        self.wheel
            .lock()
            .unwrap()
            .insert(&handle, handle.generation(), now + timeout_ms);
        Ok(handle)
    }

    /// Extends (or shortens) a connection's deadline from now. The previous
    /// timer is retired before the new one arms; a deadline can never move
    /// backwards past activity the tracker has already credited.
    pub(crate) fn refresh(&self, conn: &ConnHandle, timeout_ms: u64) {
        if conn.is_dying() {
            return;
        }
        let (generation, expires) = conn.reschedule(self.now_ms(), timeout_ms);
        self.wheel.lock().unwrap().insert(conn, generation, expires);
    }

    /// Unlinks a confirmed record from both hash chains and drops the
    /// expectations it registered. The caller must hold the write lock and
    /// have won the dying transition.
    fn unlink(&self, inner: &mut TableInner, conn: &ConnHandle) {
        let nb_buckets = self.config.nb_buckets;
        let bucket_orig = tuple::bucket(conn.original(), nb_buckets);
        let bucket_repl = tuple::bucket(conn.reply(), nb_buckets);
        let mut removed = 0;
        for bucket in [bucket_orig, bucket_repl] {
            let before = inner.buckets[bucket].len();
            inner.buckets[bucket].retain(|c| !Arc::ptr_eq(c, conn));
            removed += before - inner.buckets[bucket].len();
            if bucket_orig == bucket_repl {
                break;
            }
        }
        assert_eq!(removed, 2, "confirmed entry missing from hash chain");
        inner.expectations.retain(|exp| !exp.owned_by(conn));
        self.live.fetch_sub(1, Ordering::AcqRel);
    }

    /// Removes a confirmed connection from the table. Idempotent; packets
    /// still holding the handle keep it alive until they drop it.
    pub(crate) fn kill(&self, conn: &ConnHandle) {
        let mut inner = self.table.write().unwrap();
        if conn.mark_dying() {
            self.unlink(&mut inner, conn);
        }
    }

    /// Evicts the oldest unassured connection from a sampled bucket to make
    /// room. Tries one rotating bucket, then the caller's target bucket;
    /// bounded work regardless of table size.
    fn early_drop(&self, hint: usize) -> bool {
        // The victim handle outlives the lock guard: if this was its last
        // reference, destruction callbacks run unlocked.
        let mut reclaimed = None;
        let mut inner = self.table.write().unwrap();
        let nb_buckets = inner.buckets.len();
        let rotated = self.rr_bucket.fetch_add(1, Ordering::Relaxed) % nb_buckets;
        for bucket in [rotated, hint] {
            let victim = inner.buckets[bucket]
                .iter()
                .rev()
                .find(|conn| !conn.is_assured() && !conn.is_dying())
                .cloned();
            if let Some(victim) = victim {
                if victim.mark_dying() {
                    self.unlink(&mut inner, &victim);
                    EARLY_DROPS.inc();
                    reclaimed = Some(victim);
                    break;
                }
            }
        }
        drop(inner);
        reclaimed.is_some()
    }

    /// Reclaims connections whose deadline has passed as of `now_ms`.
    pub(crate) fn sweep(&self, now_ms: u64) {
        let fired = self.wheel.lock().unwrap().expired(now_ms);
        if fired.is_empty() {
            return;
        }
        let mut reclaimed = Vec::with_capacity(fired.len());
        let mut inner = self.table.write().unwrap();
        for conn in fired {
            // A refresh may have slipped in after the wheel drained this
            // entry; the rescheduled timer covers it.
            if conn.expires_at_ms() > now_ms || !conn.mark_dying() {
                continue;
            }
            self.unlink(&mut inner, &conn);
            TIMED_OUT.inc();
            reclaimed.push(conn);
        }
        drop(inner);
        // Last references may drop here, with the table unlocked.
        drop(reclaimed);
    }

    /// Removes every confirmed connection matching `pred`. Returns the number
    /// removed.
    fn remove_matching(&self, pred: &dyn Fn(&Conn) -> bool) -> usize {
        let mut inner = self.table.write().unwrap();
        let mut victims: Vec<ConnHandle> = vec![];
        for bucket in &inner.buckets {
            for conn in bucket {
                if !conn.is_dying()
                    && pred(conn)
                    && !victims.iter().any(|v| Arc::ptr_eq(v, conn))
                {
                    victims.push(conn.clone());
                }
            }
        }
        let mut removed = 0;
        for victim in &victims {
            if victim.mark_dying() {
                self.unlink(&mut inner, victim);
                removed += 1;
            }
        }
        drop(inner);
        drop(victims);
        removed
    }
}

struct Reaper {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

/// A connection-tracking table.
///
/// All methods take `&self`; the tracker may be shared across threads (e.g.
/// behind an [`Arc`]) and processes packets from any of them.
pub struct ConnTracker {
    shared: Arc<TrackerShared>,
    reaper: Mutex<Option<Reaper>>,
}

impl ConnTracker {
    /// Creates a tracker sized by `config`.
    pub fn new(config: &ConnTrackConfig) -> Self {
        Self::build(config, None)
    }

    /// Creates a tracker that hands fragments to `defrag` for reassembly.
    pub fn with_defrag(config: &ConnTrackConfig, defrag: Arc<dyn Defrag>) -> Self {
        Self::build(config, Some(defrag))
    }

    fn build(config: &ConnTrackConfig, defrag: Option<Arc<dyn Defrag>>) -> Self {
        let resolved = TrackerConfig::from(config);
        let wheel = TimerWheel::new(resolved.timeouts.max_timeout(), resolved.timeout_resolution);
        let shared = Arc::new(TrackerShared {
            table: RwLock::new(TableInner {
                buckets: vec![VecDeque::new(); resolved.nb_buckets],
                expectations: vec![],
                helpers: vec![],
            }),
            wheel: Mutex::new(wheel),
            live: AtomicUsize::new(0),
            rr_bucket: AtomicUsize::new(0),
            start_ts: Instant::now(),
            destroy_cb: Mutex::new(None),
            defrag,
            config: resolved,
        });
        ConnTracker {
            shared,
            reaper: Mutex::new(None),
        }
    }

    /// Classifies a packet against the table: associates it with its
    /// connection, creating a provisional record for the first packet of a
    /// new flow, and advances per-protocol state.
    ///
    /// Returns [`Verdict::Drop`] only when the table is full and no room
    /// could be made. Malformed or untrackable packets pass with no
    /// association.
    pub fn track(&self, pkt: &mut TrackedPacket, hook: Hook) -> Verdict {
        // A packet re-entering at a later traversal point (e.g. loopback)
        // already carries its classification; running the state machine again
        // would credit one packet twice.
        if pkt.is_tracked() {
            return Verdict::Accept;
        }

        if pkt.ctxt.is_fragment() {
            match &self.shared.defrag {
                None => return Verdict::Accept,
                Some(defrag) => match defrag.reassemble(&pkt.buf, &pkt.ctxt) {
                    None => return Verdict::Stolen,
                    Some(data) => match TrackedPacket::new(data) {
                        Ok(whole) if !whole.ctxt.is_fragment() => {
                            pkt.buf = whole.buf;
                            pkt.ctxt = whole.ctxt;
                        }
                        _ => return Verdict::Accept,
                    },
                },
            }
        }

        let clf = classifier_for(pkt.ctxt.proto);
        if let Some(early) = clf.early(&self.shared, &pkt.buf, &pkt.ctxt, hook) {
            if let EarlyVerdict::Attach(handle, dir) = early {
                pkt.assoc = Some(PacketConn::Confirmed(handle, dir));
            }
            return Verdict::Accept;
        }

        let (src_id, dst_id) = match clf.pkt_to_ids(&pkt.buf, &pkt.ctxt) {
            Ok(ids) => ids,
            Err(_) => return Verdict::Accept,
        };
        let tuple = Tuple {
            src_addr: pkt.ctxt.src,
            dst_addr: pkt.ctxt.dst,
            src_id,
            dst_id,
            proto: pkt.ctxt.proto,
        };
        if let Some((handle, dir)) = self.shared.find(&tuple) {
            if !dir.is_original() {
                handle.set_status(Status::SeenReply);
            }
            pkt.assoc = Some(PacketConn::Confirmed(handle, dir));
        } else {
            match self.shared.init_conntrack(clf, tuple, &pkt.buf, &pkt.ctxt) {
                Ok(pending) => pkt.assoc = Some(PacketConn::Pending(pending)),
                Err(ConnTrackError::TableFull) => {
                    if FULL_DROPS.inc() % 256 == 0 {
                        log::error!("connection table full, dropping packet");
                    }
                    return Verdict::Drop;
                }
                Err(_) => return Verdict::Accept,
            }
        }

        let timeouts = &self.shared.config.timeouts;
        let outcome = match pkt.assoc.as_mut() {
            None => return Verdict::Accept,
            Some(PacketConn::Pending(pending)) => {
                let status = pending.status();
                clf.packet(
                    pending.l4_mut(),
                    &pkt.buf,
                    &pkt.ctxt,
                    ConnDir::Original,
                    status,
                    timeouts,
                )
            }
            Some(PacketConn::Confirmed(handle, dir)) => {
                let status = handle.status();
                let mut l4 = handle.l4().lock().unwrap();
                clf.packet(&mut l4, &pkt.buf, &pkt.ctxt, *dir, status, timeouts)
            }
        };

        match outcome {
            PacketOutcome::Invalid => {
                // The packet does not fit the flow: it passes untracked and
                // the connection's state stands.
                pkt.sever();
            }
            PacketOutcome::Valid {
                timeout_ms,
                assured,
            } => {
                let mut helper_rejected = false;
                match pkt.assoc.as_mut() {
                    Some(PacketConn::Pending(pending)) => pending.set_timeout_ms(timeout_ms),
                    Some(PacketConn::Confirmed(handle, dir)) => {
                        if assured {
                            handle.set_status(Status::Assured);
                        }
                        self.shared.refresh(handle, timeout_ms);
                        let dir = *dir;
                        if let Some(helper) = handle.helper() {
                            helper_rejected = helper.help(&pkt.buf, &pkt.ctxt, handle, dir)
                                == HelperVerdict::Invalid;
                        }
                    }
                    None => {}
                }
                // A helper rejection is handled like a protocol-invalid
                // packet: the packet passes unassociated and the connection
                // (helper included) stands.
                if helper_rejected {
                    pkt.sever();
                }
            }
        }
        Verdict::Accept
    }

    /// Publishes the packet's provisional record, making the connection
    /// discoverable by other packets. Packets on already-confirmed (or no)
    /// connections pass through unchanged.
    ///
    /// Returns [`Verdict::Drop`] if a concurrent packet confirmed an
    /// identical flow first.
    pub fn confirm_packet(&self, pkt: &mut TrackedPacket) -> Verdict {
        match pkt.assoc.take() {
            Some(PacketConn::Pending(pending)) => match self.shared.confirm(pending) {
                Ok(handle) => {
                    if let Some(helper) = handle.helper() {
                        if helper.help(&pkt.buf, &pkt.ctxt, &handle, ConnDir::Original)
                            == HelperVerdict::Invalid
                        {
                            // The connection is in the table; only this
                            // packet's association is dropped.
                            return Verdict::Accept;
                        }
                    }
                    pkt.assoc = Some(PacketConn::Confirmed(handle, ConnDir::Original));
                    Verdict::Accept
                }
                Err(_) => Verdict::Drop,
            },
            other => {
                pkt.assoc = other;
                Verdict::Accept
            }
        }
    }

    /// Looks up a connection by tuple, in either direction.
    pub fn find(&self, tuple: &Tuple) -> Option<(ConnHandle, ConnDir)> {
        self.shared.find(tuple)
    }

    /// Extends a connection's deadline by `timeout_ms` from now.
    pub fn refresh(&self, conn: &ConnHandle, timeout_ms: u64) {
        self.shared.refresh(conn, timeout_ms);
    }

    /// Removes a connection from the table immediately.
    pub fn kill(&self, conn: &ConnHandle) {
        self.shared.kill(conn);
    }

    /// Announces that `master` is about to cause a related flow matching
    /// `tuple` under `mask`. The first such flow is linked to `master` and
    /// `callback` runs on its provisional record.
    ///
    /// A connection holds at most one expectation; registering again replaces
    /// the previous one. Fails without side effects if another connection
    /// holds an expectation some flow could fulfill ambiguously.
    pub fn expect_related(
        &self,
        master: &ConnHandle,
        tuple: Tuple,
        mask: Tuple,
        callback: Option<ExpectCallback>,
    ) -> Result<(), ConnTrackError> {
        let mut inner = self.shared.table.write().unwrap();
        if inner
            .expectations
            .iter()
            .any(|exp| !exp.owned_by(master) && exp.clashes_with(&tuple, &mask))
        {
            return Err(ConnTrackError::ExpectBusy);
        }
        inner.expectations.retain(|exp| !exp.owned_by(master));
        inner.expectations.push(Expectation {
            tuple,
            mask,
            master: master.clone(),
            callback,
        });
        Ok(())
    }

    /// Withdraws `master`'s expectation, if it has one.
    pub fn unexpect_related(&self, master: &ConnHandle) -> Result<(), ConnTrackError> {
        let mut inner = self.shared.table.write().unwrap();
        let pos = inner
            .expectations
            .iter()
            .position(|exp| exp.owned_by(master))
            .ok_or(ConnTrackError::NoSuchExpectation)?;
        inner.expectations.remove(pos);
        Ok(())
    }

    /// Registers an application-protocol helper. New connections whose reply
    /// tuple matches the helper's pattern have it attached at creation.
    pub fn register_helper(&self, helper: Arc<dyn Helper>) -> Result<(), ConnTrackError> {
        let mut inner = self.shared.table.write().unwrap();
        if inner.helpers.iter().any(|h| h.name() == helper.name()) {
            return Err(ConnTrackError::HelperExists);
        }
        inner.helpers.push(helper);
        Ok(())
    }

    /// Unregisters a helper by name, detaching it from every connection it is
    /// attached to and dropping those connections' expectations.
    pub fn unregister_helper(&self, name: &str) {
        let mut inner = self.shared.table.write().unwrap();
        inner.helpers.retain(|h| h.name() != name);
        let mut affected: Vec<ConnHandle> = vec![];
        for bucket in &inner.buckets {
            for conn in bucket {
                if conn.helper().is_some_and(|h| h.name() == name)
                    && !affected.iter().any(|c| Arc::ptr_eq(c, conn))
                {
                    affected.push(conn.clone());
                }
            }
        }
        for conn in &affected {
            conn.clear_helper();
        }
        inner
            .expectations
            .retain(|exp| !affected.iter().any(|conn| exp.owned_by(conn)));
    }

    /// Returns the pre-translation destination of the flow `tuple` belongs
    /// to, as `(address, id)`. This is what a transparent proxy asks to learn
    /// where a redirected socket was originally headed.
    pub fn original_dst(&self, tuple: &Tuple) -> Option<(Ipv4Addr, u16)> {
        let (conn, _) = self.shared.find(tuple)?;
        Some((conn.original().dst_addr, conn.original().dst_id))
    }

    /// Removes every confirmed connection matching `pred`. Returns the number
    /// removed.
    pub fn selective_cleanup<F>(&self, pred: F) -> usize
    where
        F: Fn(&Conn) -> bool,
    {
        self.shared.remove_matching(&pred)
    }

    /// Removes all confirmed connections.
    pub fn drain(&self) {
        let removed = self.shared.remove_matching(&|_| true);
        log::info!("drained {} connections", removed);
    }

    /// Number of confirmed connections in the table.
    pub fn conn_count(&self) -> usize {
        let inner = self.shared.table.read().unwrap();
        // Each confirmed record appears under both of its tuples.
        inner.buckets.iter().map(|b| b.len()).sum::<usize>() / 2
    }

    /// Reclaims connections whose deadline has passed.
    pub fn check_timeouts(&self) {
        self.shared.sweep(self.shared.now_ms());
    }

    #[cfg(test)]
    pub(crate) fn sweep(&self, now_ms: u64) {
        self.shared.sweep(now_ms);
    }

    /// Installs a callback run exactly once per connection, when a confirmed
    /// record is destroyed. Applies to connections confirmed afterward.
    pub fn set_destroy_hook(&self, cb: DestroyCallback) {
        *self.shared.destroy_cb.lock().unwrap() = Some(cb);
    }

    /// Starts a background thread that reclaims timed-out connections every
    /// timeout-resolution period. Idempotent; the thread stops when the
    /// tracker is dropped.
    pub fn spawn_reaper(&self) {
        let mut guard = self.reaper.lock().unwrap();
        if guard.is_some() {
            return;
        }
        let shared = Arc::clone(&self.shared);
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let period = self.shared.config.timeout_resolution;
        let handle = std::thread::spawn(move || {
            let ticker = tick(Duration::from_millis(period));
            loop {
                select! {
                    recv(ticker) -> _ => shared.sweep(shared.now_ms()),
                    recv(stop_rx) -> _ => break,
                }
            }
        });
        *guard = Some(Reaper {
            stop: stop_tx,
            handle,
        });
    }
}

impl Drop for ConnTracker {
    fn drop(&mut self) {
        if let Some(reaper) = self.reaper.lock().unwrap().take() {
            // Closing the stop channel wakes the reaper's select.
            drop(reaper.stop);
            let _ = reaper.handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_config;
    use crate::conntrack::conn::{L4State, TcpState};
    use crate::protocols::packet::icmp::internet_checksum;
    use crate::protocols::packet::tcp::{ACK, FIN, RST, SYN};
    use std::sync::atomic::AtomicUsize;

    const CLIENT: [u8; 4] = [10, 0, 0, 1];
    const SERVER: [u8; 4] = [10, 0, 0, 2];
    const OTHER: [u8; 4] = [10, 0, 0, 3];

    fn small_config(max_entries: usize, nb_buckets: usize) -> ConnTrackConfig {
        let mut config = default_config();
        config.nb_buckets = Some(nb_buckets);
        config.max_entries = Some(max_entries);
        config
    }

    fn ipv4_datagram(proto: u8, src: [u8; 4], dst: [u8; 4], payload: &[u8]) -> Vec<u8> {
        let total = 20 + payload.len();
        let mut p = vec![0u8; total];
        p[0] = 0x45;
        p[2..4].copy_from_slice(&(total as u16).to_be_bytes());
        p[8] = 64;
        p[9] = proto;
        p[12..16].copy_from_slice(&src);
        p[16..20].copy_from_slice(&dst);
        p[20..].copy_from_slice(payload);
        p
    }

    fn udp_header(sport: u16, dport: u16) -> Vec<u8> {
        let mut u = vec![0u8; 8];
        u[0..2].copy_from_slice(&sport.to_be_bytes());
        u[2..4].copy_from_slice(&dport.to_be_bytes());
        u[4..6].copy_from_slice(&8u16.to_be_bytes());
        u
    }

    fn udp_pkt(src: [u8; 4], dst: [u8; 4], sport: u16, dport: u16) -> TrackedPacket {
        TrackedPacket::new(ipv4_datagram(17, src, dst, &udp_header(sport, dport))).unwrap()
    }

    fn tcp_pkt(src: [u8; 4], dst: [u8; 4], sport: u16, dport: u16, flags: u8) -> TrackedPacket {
        let mut t = vec![0u8; 20];
        t[0..2].copy_from_slice(&sport.to_be_bytes());
        t[2..4].copy_from_slice(&dport.to_be_bytes());
        t[12] = 5 << 4;
        t[13] = flags;
        TrackedPacket::new(ipv4_datagram(6, src, dst, &t)).unwrap()
    }

    fn tuple(src: [u8; 4], dst: [u8; 4], src_id: u16, dst_id: u16, proto: u8) -> Tuple {
        Tuple {
            src_addr: src.into(),
            dst_addr: dst.into(),
            src_id,
            dst_id,
            proto,
        }
    }

    fn confirmed_udp_flow(tracker: &ConnTracker, sport: u16, dport: u16) -> ConnHandle {
        let mut pkt = udp_pkt(CLIENT, SERVER, sport, dport);
        assert_eq!(tracker.track(&mut pkt, Hook::PreRouting), Verdict::Accept);
        assert_eq!(tracker.confirm_packet(&mut pkt), Verdict::Accept);
        pkt.connection().unwrap().clone()
    }

    #[test]
    fn core_udp_flow_lifecycle() {
        let tracker = ConnTracker::new(&small_config(64, 16));
        let orig = tuple(CLIENT, SERVER, 1000, 53, 17);
        let reply = tuple(SERVER, CLIENT, 53, 1000, 17);

        let mut pkt = udp_pkt(CLIENT, SERVER, 1000, 53);
        assert_eq!(tracker.track(&mut pkt, Hook::PreRouting), Verdict::Accept);
        assert!(pkt.is_tracked());
        // Provisional records are invisible to lookups.
        assert!(tracker.find(&orig).is_none());

        assert_eq!(tracker.confirm_packet(&mut pkt), Verdict::Accept);
        let (conn, dir) = tracker.find(&orig).unwrap();
        assert_eq!(dir, ConnDir::Original);
        let (same, dir) = tracker.find(&reply).unwrap();
        assert!(Arc::ptr_eq(&conn, &same));
        assert_eq!(dir, ConnDir::Reply);
        assert!(!conn.seen_reply());
        assert!(!conn.is_assured());

        let mut rep = udp_pkt(SERVER, CLIENT, 53, 1000);
        assert_eq!(tracker.track(&mut rep, Hook::PreRouting), Verdict::Accept);
        assert!(Arc::ptr_eq(rep.connection().unwrap(), &conn));
        assert_eq!(rep.direction(), Some(ConnDir::Reply));
        assert!(conn.seen_reply());
        assert!(conn.is_assured());
        assert_eq!(tracker.conn_count(), 1);
    }

    #[test]
    fn core_unconfirmed_drop_releases_slot() {
        let tracker = ConnTracker::new(&small_config(1, 4));
        let mut pkt = udp_pkt(CLIENT, SERVER, 1000, 53);
        assert_eq!(tracker.track(&mut pkt, Hook::PreRouting), Verdict::Accept);
        // The flow never confirms (e.g. dropped by a filter); its slot must
        // come back.
        drop(pkt);

        let mut pkt = udp_pkt(CLIENT, SERVER, 2000, 53);
        assert_eq!(tracker.track(&mut pkt, Hook::PreRouting), Verdict::Accept);
        assert!(pkt.is_tracked());
    }

    #[test]
    fn core_early_drop_evicts_oldest_unassured() {
        let tracker = ConnTracker::new(&small_config(2, 1));
        let first = confirmed_udp_flow(&tracker, 1001, 53);
        let _second = confirmed_udp_flow(&tracker, 1002, 53);
        assert_eq!(tracker.conn_count(), 2);

        // Table is at capacity; the oldest unassured entry makes way.
        let mut pkt = udp_pkt(CLIENT, SERVER, 1003, 53);
        assert_eq!(tracker.track(&mut pkt, Hook::PreRouting), Verdict::Accept);
        assert!(pkt.is_tracked());
        assert_eq!(tracker.confirm_packet(&mut pkt), Verdict::Accept);
        assert_eq!(tracker.conn_count(), 2);
        assert!(tracker.find(first.original()).is_none());
        assert!(tracker.find(&tuple(CLIENT, SERVER, 1002, 53, 17)).is_some());
    }

    #[test]
    fn core_table_full_drops_when_all_assured() {
        let tracker = ConnTracker::new(&small_config(1, 1));
        let conn = confirmed_udp_flow(&tracker, 1001, 53);
        let mut rep = udp_pkt(SERVER, CLIENT, 53, 1001);
        tracker.track(&mut rep, Hook::PreRouting);
        assert!(conn.is_assured());

        let mut pkt = udp_pkt(CLIENT, SERVER, 1002, 53);
        assert_eq!(tracker.track(&mut pkt, Hook::PreRouting), Verdict::Drop);
        assert!(!pkt.is_tracked());
        assert_eq!(tracker.conn_count(), 1);
    }

    #[test]
    fn core_expectation_fulfilled_links_master() {
        let tracker = ConnTracker::new(&small_config(64, 16));
        let master = confirmed_udp_flow(&tracker, 2000, 21);

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_cb = fired.clone();
        let mut mask = Tuple::EXACT;
        mask.src_id = 0;
        tracker
            .expect_related(
                &master,
                tuple(SERVER, CLIENT, 0, 3000, 17),
                mask,
                Some(Box::new(move |pending| {
                    fired_cb.fetch_add(1, Ordering::Relaxed);
                    pending.set_timeout_ms(5_000);
                })),
            )
            .unwrap();

        let mut pkt = udp_pkt(SERVER, CLIENT, 4000, 3000);
        assert_eq!(tracker.track(&mut pkt, Hook::PreRouting), Verdict::Accept);
        assert_eq!(tracker.confirm_packet(&mut pkt), Verdict::Accept);
        let conn = pkt.connection().unwrap();
        assert!(conn.is_expected());
        assert!(Arc::ptr_eq(conn.master().unwrap(), &master));
        assert_eq!(fired.load(Ordering::Relaxed), 1);

        // Expectations are one-shot.
        let mut again = udp_pkt(SERVER, CLIENT, 4001, 3000);
        tracker.track(&mut again, Hook::PreRouting);
        tracker.confirm_packet(&mut again);
        assert!(!again.connection().unwrap().is_expected());
        assert_eq!(fired.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn core_expectation_clash_leaves_state_unchanged() {
        let tracker = ConnTracker::new(&small_config(64, 16));
        let master1 = confirmed_udp_flow(&tracker, 2000, 21);
        let master2 = confirmed_udp_flow(&tracker, 2001, 21);

        let mut mask = Tuple::EXACT;
        mask.src_id = 0;
        let pattern = tuple(SERVER, CLIENT, 0, 3000, 17);
        tracker
            .expect_related(&master1, pattern, mask, None)
            .unwrap();
        assert!(matches!(
            tracker.expect_related(&master2, pattern, mask, None),
            Err(ConnTrackError::ExpectBusy)
        ));

        // The original expectation still fires.
        let mut pkt = udp_pkt(SERVER, CLIENT, 4000, 3000);
        tracker.track(&mut pkt, Hook::PreRouting);
        tracker.confirm_packet(&mut pkt);
        assert!(Arc::ptr_eq(
            pkt.connection().unwrap().master().unwrap(),
            &master1
        ));
    }

    #[test]
    fn core_expectation_replaces_own() {
        let tracker = ConnTracker::new(&small_config(64, 16));
        let master = confirmed_udp_flow(&tracker, 2000, 21);

        let mut mask = Tuple::EXACT;
        mask.src_id = 0;
        tracker
            .expect_related(&master, tuple(SERVER, CLIENT, 0, 3000, 17), mask, None)
            .unwrap();
        // A connection holds one expectation; re-registering retargets it.
        tracker
            .expect_related(
                &master,
                tuple(SERVER, CLIENT, 4000, 3000, 17),
                Tuple::EXACT,
                None,
            )
            .unwrap();

        // A flow the wildcard would have matched no longer does.
        let mut pkt = udp_pkt(SERVER, CLIENT, 5000, 3000);
        tracker.track(&mut pkt, Hook::PreRouting);
        tracker.confirm_packet(&mut pkt);
        assert!(!pkt.connection().unwrap().is_expected());

        let mut pkt = udp_pkt(SERVER, CLIENT, 4000, 3000);
        tracker.track(&mut pkt, Hook::PreRouting);
        tracker.confirm_packet(&mut pkt);
        assert!(pkt.connection().unwrap().is_expected());
    }

    #[test]
    fn core_unexpect_withdraws() {
        let tracker = ConnTracker::new(&small_config(64, 16));
        let master = confirmed_udp_flow(&tracker, 2000, 21);
        let pattern = tuple(SERVER, CLIENT, 4000, 3000, 17);
        tracker
            .expect_related(&master, pattern, Tuple::EXACT, None)
            .unwrap();
        tracker.unexpect_related(&master).unwrap();
        assert!(matches!(
            tracker.unexpect_related(&master),
            Err(ConnTrackError::NoSuchExpectation)
        ));

        let mut pkt = udp_pkt(SERVER, CLIENT, 4000, 3000);
        tracker.track(&mut pkt, Hook::PreRouting);
        tracker.confirm_packet(&mut pkt);
        assert!(!pkt.connection().unwrap().is_expected());
    }

    #[test]
    fn core_expectations_die_with_master() {
        let tracker = ConnTracker::new(&small_config(64, 16));
        let master = confirmed_udp_flow(&tracker, 2000, 21);
        tracker
            .expect_related(
                &master,
                tuple(SERVER, CLIENT, 4000, 3000, 17),
                Tuple::EXACT,
                None,
            )
            .unwrap();
        tracker.kill(&master);

        let mut pkt = udp_pkt(SERVER, CLIENT, 4000, 3000);
        tracker.track(&mut pkt, Hook::PreRouting);
        tracker.confirm_packet(&mut pkt);
        assert!(!pkt.connection().unwrap().is_expected());
    }

    struct TestHelper {
        helps: AtomicUsize,
        destroys: AtomicUsize,
        reject: std::sync::atomic::AtomicBool,
    }

    impl TestHelper {
        fn new() -> Arc<Self> {
            Arc::new(TestHelper {
                helps: AtomicUsize::new(0),
                destroys: AtomicUsize::new(0),
                reject: std::sync::atomic::AtomicBool::new(false),
            })
        }
    }

    impl Helper for TestHelper {
        fn name(&self) -> &'static str {
            "test-ctl"
        }

        // Attach to flows whose reply comes from the server's port 21.
        fn tuple(&self) -> Tuple {
            tuple(SERVER, [0, 0, 0, 0], 21, 0, 17)
        }

        fn mask(&self) -> Tuple {
            Tuple {
                src_addr: [255, 255, 255, 255].into(),
                dst_addr: [0, 0, 0, 0].into(),
                src_id: 0xffff,
                dst_id: 0,
                proto: 0xff,
            }
        }

        fn help(
            &self,
            _buf: &PktBuf,
            _ctxt: &IpContext,
            _conn: &ConnHandle,
            _dir: ConnDir,
        ) -> HelperVerdict {
            self.helps.fetch_add(1, Ordering::Relaxed);
            if self.reject.load(Ordering::Relaxed) {
                HelperVerdict::Invalid
            } else {
                HelperVerdict::Valid
            }
        }

        fn on_destroy(&self, _conn: &Conn) {
            self.destroys.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn core_helper_lifecycle() {
        let tracker = ConnTracker::new(&small_config(64, 16));
        let helper = TestHelper::new();
        tracker.register_helper(helper.clone()).unwrap();
        assert!(matches!(
            tracker.register_helper(helper.clone()),
            Err(ConnTrackError::HelperExists)
        ));

        let conn = confirmed_udp_flow(&tracker, 3000, 21);
        assert!(conn.helper().is_some());
        // Inspected the first packet at confirmation.
        assert_eq!(helper.helps.load(Ordering::Relaxed), 1);

        let mut pkt = udp_pkt(CLIENT, SERVER, 3000, 21);
        tracker.track(&mut pkt, Hook::PreRouting);
        assert_eq!(helper.helps.load(Ordering::Relaxed), 2);
        drop(pkt);

        // A non-conforming packet passes unassociated; the helper stays on.
        helper.reject.store(true, Ordering::Relaxed);
        let mut pkt = udp_pkt(CLIENT, SERVER, 3000, 21);
        assert_eq!(tracker.track(&mut pkt, Hook::PreRouting), Verdict::Accept);
        assert!(!pkt.is_tracked());
        assert!(conn.helper().is_some());

        tracker.drain();
        drop(pkt);
        drop(conn);
        assert_eq!(helper.destroys.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn core_helper_invalid_severs_association() {
        let tracker = ConnTracker::new(&small_config(64, 16));
        let helper = TestHelper::new();
        helper.reject.store(true, Ordering::Relaxed);
        tracker.register_helper(helper.clone()).unwrap();

        // The helper rejects the first packet at confirmation: the flow is
        // published, but the packet itself passes unassociated.
        let mut pkt = udp_pkt(CLIENT, SERVER, 3000, 21);
        assert_eq!(tracker.track(&mut pkt, Hook::PreRouting), Verdict::Accept);
        assert_eq!(tracker.confirm_packet(&mut pkt), Verdict::Accept);
        assert!(!pkt.is_tracked());

        let (conn, _) = tracker.find(&tuple(CLIENT, SERVER, 3000, 21, 17)).unwrap();
        assert!(conn.helper().is_some());

        // Later rejected packets are severed the same way; the connection and
        // its helper stand.
        let mut pkt = udp_pkt(CLIENT, SERVER, 3000, 21);
        assert_eq!(tracker.track(&mut pkt, Hook::PreRouting), Verdict::Accept);
        assert!(!pkt.is_tracked());
        assert!(conn.helper().is_some());
        assert_eq!(tracker.conn_count(), 1);
    }

    #[test]
    fn core_helper_unregister_detaches() {
        let tracker = ConnTracker::new(&small_config(64, 16));
        let helper = TestHelper::new();
        tracker.register_helper(helper.clone()).unwrap();

        let conn = confirmed_udp_flow(&tracker, 3000, 21);
        tracker
            .expect_related(
                &conn,
                tuple(SERVER, CLIENT, 4000, 3000, 17),
                Tuple::EXACT,
                None,
            )
            .unwrap();
        tracker.unregister_helper("test-ctl");
        assert!(conn.helper().is_none());

        // The detached connection's expectations went with it.
        let mut pkt = udp_pkt(SERVER, CLIENT, 4000, 3000);
        tracker.track(&mut pkt, Hook::PreRouting);
        tracker.confirm_packet(&mut pkt);
        assert!(!pkt.connection().unwrap().is_expected());

        // And new flows no longer pick the helper up.
        let later = confirmed_udp_flow(&tracker, 3001, 21);
        assert!(later.helper().is_none());
    }

    #[test]
    fn core_helper_destroy_notification() {
        let tracker = ConnTracker::new(&small_config(64, 16));
        let helper = TestHelper::new();
        tracker.register_helper(helper.clone()).unwrap();
        let conn = confirmed_udp_flow(&tracker, 3000, 21);
        tracker.drain();
        drop(conn);
        assert_eq!(helper.destroys.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn core_confirm_collision_single_owner() {
        let tracker = ConnTracker::new(&small_config(64, 16));
        let mut pkt1 = udp_pkt(CLIENT, SERVER, 1000, 53);
        let mut pkt2 = udp_pkt(CLIENT, SERVER, 1000, 53);
        tracker.track(&mut pkt1, Hook::PreRouting);
        tracker.track(&mut pkt2, Hook::PreRouting);

        assert_eq!(tracker.confirm_packet(&mut pkt1), Verdict::Accept);
        assert_eq!(tracker.confirm_packet(&mut pkt2), Verdict::Drop);
        assert!(!pkt2.is_tracked());
        assert_eq!(tracker.conn_count(), 1);
    }

    #[test]
    fn core_confirm_collision_threaded() {
        let tracker = Arc::new(ConnTracker::new(&default_config()));
        std::thread::scope(|scope| {
            for _ in 0..8 {
                let tracker = Arc::clone(&tracker);
                scope.spawn(move || {
                    let mut pkt = udp_pkt(CLIENT, SERVER, 1000, 53);
                    tracker.track(&mut pkt, Hook::PreRouting);
                    tracker.confirm_packet(&mut pkt);
                });
            }
        });
        assert_eq!(tracker.conn_count(), 1);
    }

    #[test]
    fn core_timeout_reclaims_idle_flow() {
        let tracker = ConnTracker::new(&small_config(64, 16));
        let conn = confirmed_udp_flow(&tracker, 1000, 53);
        let orig = *conn.original();

        // Unreplied UDP keeps its 30s deadline.
        tracker.sweep(29_000);
        assert!(tracker.find(&orig).is_some());
        tracker.sweep(31_000);
        assert!(tracker.find(&orig).is_none());
        assert_eq!(tracker.conn_count(), 0);
    }

    #[test]
    fn core_refresh_outlives_stale_timer() {
        let tracker = ConnTracker::new(&small_config(64, 16));
        let conn = confirmed_udp_flow(&tracker, 1000, 53);
        let orig = *conn.original();

        tracker.refresh(&conn, 60_000);
        // The original 30s timer fires but must not reclaim the flow.
        tracker.sweep(31_000);
        assert!(tracker.find(&orig).is_some());
        tracker.sweep(61_000);
        assert!(tracker.find(&orig).is_none());
    }

    #[test]
    fn core_destroy_hook_fires_once() {
        let tracker = ConnTracker::new(&small_config(64, 16));
        let destroyed = Arc::new(AtomicUsize::new(0));
        let counter = destroyed.clone();
        tracker.set_destroy_hook(Arc::new(move |_conn: &Conn| {
            counter.fetch_add(1, Ordering::Relaxed);
        }));

        let conn = confirmed_udp_flow(&tracker, 1000, 53);
        tracker.drain();
        assert_eq!(destroyed.load(Ordering::Relaxed), 0);
        // Destruction happens when the last handle drops.
        drop(conn);
        assert_eq!(destroyed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn core_original_dst_reports_pretranslation_target() {
        let tracker = ConnTracker::new(&small_config(64, 16));
        confirmed_udp_flow(&tracker, 1000, 53);
        let reply = tuple(SERVER, CLIENT, 53, 1000, 17);
        assert_eq!(
            tracker.original_dst(&reply),
            Some((SERVER.into(), 53))
        );
        assert!(tracker.original_dst(&tuple(OTHER, CLIENT, 1, 2, 17)).is_none());
    }

    #[test]
    fn core_selective_cleanup_by_predicate() {
        let tracker = ConnTracker::new(&small_config(64, 16));
        confirmed_udp_flow(&tracker, 1000, 53);
        let mut pkt = udp_pkt(CLIENT, OTHER, 1000, 53);
        tracker.track(&mut pkt, Hook::PreRouting);
        tracker.confirm_packet(&mut pkt);
        assert_eq!(tracker.conn_count(), 2);

        let other: Ipv4Addr = OTHER.into();
        let removed = tracker.selective_cleanup(|conn| conn.original().dst_addr == other);
        assert_eq!(removed, 1);
        assert_eq!(tracker.conn_count(), 1);
        assert!(tracker.find(&tuple(CLIENT, OTHER, 1000, 53, 17)).is_none());
    }

    #[test]
    fn core_tcp_handshake_states() {
        let tracker = ConnTracker::new(&small_config(64, 16));

        // A flow cannot open mid-stream.
        let mut stray = tcp_pkt(CLIENT, SERVER, 1000, 80, ACK);
        assert_eq!(tracker.track(&mut stray, Hook::PreRouting), Verdict::Accept);
        assert!(!stray.is_tracked());

        let mut syn = tcp_pkt(CLIENT, SERVER, 1000, 80, SYN);
        tracker.track(&mut syn, Hook::PreRouting);
        tracker.confirm_packet(&mut syn);
        let conn = syn.connection().unwrap().clone();
        assert_eq!(*conn.l4().lock().unwrap(), L4State::Tcp(TcpState::SynSent));

        let mut synack = tcp_pkt(SERVER, CLIENT, 80, 1000, SYN | ACK);
        tracker.track(&mut synack, Hook::PreRouting);
        assert_eq!(*conn.l4().lock().unwrap(), L4State::Tcp(TcpState::SynRecv));

        let mut ack = tcp_pkt(CLIENT, SERVER, 1000, 80, ACK);
        tracker.track(&mut ack, Hook::PreRouting);
        assert_eq!(
            *conn.l4().lock().unwrap(),
            L4State::Tcp(TcpState::Established)
        );
        assert!(conn.is_assured());

        let mut rst = tcp_pkt(SERVER, CLIENT, 80, 1000, RST);
        tracker.track(&mut rst, Hook::PreRouting);
        assert_eq!(*conn.l4().lock().unwrap(), L4State::Tcp(TcpState::Close));
    }

    #[test]
    fn core_tcp_stray_segment_passes_untracked() {
        let tracker = ConnTracker::new(&small_config(64, 16));
        let mut syn = tcp_pkt(CLIENT, SERVER, 1000, 80, SYN);
        tracker.track(&mut syn, Hook::PreRouting);
        tracker.confirm_packet(&mut syn);
        let conn = syn.connection().unwrap().clone();

        // A FIN before the handshake answer fits no transition; the packet
        // passes untracked and the flow's state stands.
        let mut bogus = tcp_pkt(SERVER, CLIENT, 80, 1000, FIN);
        assert_eq!(tracker.track(&mut bogus, Hook::PreRouting), Verdict::Accept);
        assert!(!bogus.is_tracked());
        assert_eq!(*conn.l4().lock().unwrap(), L4State::Tcp(TcpState::SynSent));
    }

    #[test]
    fn core_track_reentry_is_idempotent() {
        let tracker = ConnTracker::new(&small_config(64, 16));
        let mut syn = tcp_pkt(CLIENT, SERVER, 1000, 80, SYN);
        tracker.track(&mut syn, Hook::PreRouting);
        tracker.confirm_packet(&mut syn);
        let conn = syn.connection().unwrap().clone();
        let mut synack = tcp_pkt(SERVER, CLIENT, 80, 1000, SYN | ACK);
        tracker.track(&mut synack, Hook::PreRouting);
        let mut ack = tcp_pkt(CLIENT, SERVER, 1000, 80, ACK);
        tracker.track(&mut ack, Hook::PreRouting);
        assert_eq!(
            *conn.l4().lock().unwrap(),
            L4State::Tcp(TcpState::Established)
        );

        // One FIN traversing two hooks is still one FIN; the second entry
        // must not advance the state machine again.
        let mut fin = tcp_pkt(CLIENT, SERVER, 1000, 80, FIN);
        assert_eq!(tracker.track(&mut fin, Hook::PreRouting), Verdict::Accept);
        assert_eq!(*conn.l4().lock().unwrap(), L4State::Tcp(TcpState::FinWait));
        assert_eq!(tracker.track(&mut fin, Hook::LocalIn), Verdict::Accept);
        assert_eq!(*conn.l4().lock().unwrap(), L4State::Tcp(TcpState::FinWait));
    }

    #[test]
    fn core_fragment_passes_untracked_without_defrag() {
        let tracker = ConnTracker::new(&small_config(64, 16));
        let mut data = ipv4_datagram(17, CLIENT, SERVER, &udp_header(1000, 53));
        data[6] = 0x20; // More Fragments
        let mut pkt = TrackedPacket::new(data).unwrap();
        assert_eq!(tracker.track(&mut pkt, Hook::PreRouting), Verdict::Accept);
        assert!(!pkt.is_tracked());
    }

    struct StubDefrag {
        whole: Mutex<Option<Vec<u8>>>,
    }

    impl Defrag for StubDefrag {
        fn reassemble(&self, _buf: &PktBuf, _ctxt: &IpContext) -> Option<Vec<u8>> {
            self.whole.lock().unwrap().take()
        }
    }

    #[test]
    fn core_defrag_steals_then_tracks_whole() {
        let whole = ipv4_datagram(17, CLIENT, SERVER, &udp_header(1000, 53));
        let defrag = Arc::new(StubDefrag {
            whole: Mutex::new(None),
        });
        let tracker = ConnTracker::with_defrag(&small_config(64, 16), defrag.clone());

        let mut frag = ipv4_datagram(17, CLIENT, SERVER, &udp_header(1000, 53));
        frag[6] = 0x20;
        let mut pkt = TrackedPacket::new(frag.clone()).unwrap();
        assert_eq!(tracker.track(&mut pkt, Hook::PreRouting), Verdict::Stolen);

        *defrag.whole.lock().unwrap() = Some(whole);
        frag[6] = 0; // last fragment
        frag[7] = 1;
        let mut pkt = TrackedPacket::new(frag).unwrap();
        assert_eq!(tracker.track(&mut pkt, Hook::PreRouting), Verdict::Accept);
        assert!(pkt.is_tracked());
    }

    fn icmp_echo(src: [u8; 4], dst: [u8; 4], msg_type: u8, id: u16) -> TrackedPacket {
        let mut icmp = vec![0u8; 8];
        icmp[0] = msg_type;
        icmp[4..6].copy_from_slice(&id.to_be_bytes());
        let csum = internet_checksum(&icmp);
        icmp[2..4].copy_from_slice(&csum.to_be_bytes());
        TrackedPacket::new(ipv4_datagram(1, src, dst, &icmp)).unwrap()
    }

    #[test]
    fn core_icmp_echo_pair_tracked() {
        let tracker = ConnTracker::new(&small_config(64, 16));
        let mut req = icmp_echo(CLIENT, SERVER, 8, 0x1234);
        assert_eq!(tracker.track(&mut req, Hook::PreRouting), Verdict::Accept);
        tracker.confirm_packet(&mut req);
        let conn = req.connection().unwrap().clone();

        let mut rep = icmp_echo(SERVER, CLIENT, 0, 0x1234);
        assert_eq!(tracker.track(&mut rep, Hook::PreRouting), Verdict::Accept);
        assert!(Arc::ptr_eq(rep.connection().unwrap(), &conn));
        assert_eq!(rep.direction(), Some(ConnDir::Reply));
    }

    #[test]
    fn core_icmp_stray_reply_untracked() {
        let tracker = ConnTracker::new(&small_config(64, 16));
        let mut rep = icmp_echo(SERVER, CLIENT, 0, 0x9999);
        assert_eq!(tracker.track(&mut rep, Hook::PreRouting), Verdict::Accept);
        assert!(!rep.is_tracked());
    }

    fn icmp_error(src: [u8; 4], embedded: &[u8], corrupt: bool) -> TrackedPacket {
        // Destination unreachable (port unreachable) quoting `embedded`.
        let mut icmp = vec![0u8; 8 + embedded.len()];
        icmp[0] = 3;
        icmp[1] = 3;
        icmp[8..].copy_from_slice(embedded);
        let csum = internet_checksum(&icmp);
        icmp[2..4].copy_from_slice(&csum.to_be_bytes());
        if corrupt {
            icmp[7] ^= 0xff;
        }
        let dst = if src == SERVER { CLIENT } else { SERVER };
        TrackedPacket::new(ipv4_datagram(1, src, dst, &icmp)).unwrap()
    }

    #[test]
    fn core_icmp_error_attaches_to_referenced_flow() {
        let tracker = ConnTracker::new(&small_config(64, 16));
        let conn = confirmed_udp_flow(&tracker, 1000, 53);

        // The server rejects the original datagram; the error it sends back
        // belongs to the flow, reply direction.
        let quoted = ipv4_datagram(17, CLIENT, SERVER, &udp_header(1000, 53));
        let mut err = icmp_error(SERVER, &quoted, false);
        assert_eq!(tracker.track(&mut err, Hook::PreRouting), Verdict::Accept);
        assert!(Arc::ptr_eq(err.connection().unwrap(), &conn));
        assert_eq!(err.direction(), Some(ConnDir::Reply));
    }

    #[test]
    fn core_icmp_error_bad_checksum_untracked() {
        let tracker = ConnTracker::new(&small_config(64, 16));
        confirmed_udp_flow(&tracker, 1000, 53);
        let quoted = ipv4_datagram(17, CLIENT, SERVER, &udp_header(1000, 53));
        let mut err = icmp_error(SERVER, &quoted, true);
        assert_eq!(tracker.track(&mut err, Hook::PreRouting), Verdict::Accept);
        assert!(!err.is_tracked());
    }

    #[test]
    fn core_icmp_error_unknown_flow_untracked() {
        let tracker = ConnTracker::new(&small_config(64, 16));
        let quoted = ipv4_datagram(17, CLIENT, SERVER, &udp_header(7777, 53));
        let mut err = icmp_error(SERVER, &quoted, false);
        assert_eq!(tracker.track(&mut err, Hook::PreRouting), Verdict::Accept);
        assert!(!err.is_tracked());
    }

    #[test]
    fn core_reaper_thread_stops_on_drop() {
        let tracker = ConnTracker::new(&small_config(64, 16));
        tracker.spawn_reaper();
        confirmed_udp_flow(&tracker, 1000, 53);
        drop(tracker);
    }
}
