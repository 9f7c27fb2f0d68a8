//! Timeout tracking.

use crate::conntrack::conn::{Conn, ConnHandle};

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

/// Tracks connection expiration with an array of time-period buckets.
///
/// Entries are weak references paired with the generation the timer was armed
/// at. A refresh bumps the connection's generation and re-inserts it; the
/// stale entry left behind is discarded when its bucket is drained. This makes
/// rescheduling O(1) with no removal from the old bucket.
pub(super) struct TimerWheel {
    /// Period between timeout checks (in milliseconds).
    period: u64,
    /// Index of the next bucket to expire.
    next_bucket: u64,
    /// List of timers.
    timers: Vec<VecDeque<(Weak<Conn>, u64)>>,
}

impl TimerWheel {
    /// Creates a new `TimerWheel` covering timeouts up to `max_timeout` with a
    /// check period of `timeout_resolution`, both in milliseconds.
    pub(super) fn new(max_timeout: u64, timeout_resolution: u64) -> Self {
        if timeout_resolution > max_timeout {
            panic!("Timeout check period must be smaller than maximum inactivity timeout")
        }
        TimerWheel {
            period: timeout_resolution,
            next_bucket: 0,
            timers: vec![VecDeque::new(); (max_timeout / timeout_resolution) as usize + 1],
        }
    }

    /// Arms (or re-arms) the timer for a connection. `generation` must be the
    /// value returned by the reschedule that produced `expires_at_ms`.
    #[inline]
    pub(super) fn insert(&mut self, conn: &ConnHandle, generation: u64, expires_at_ms: u64) {
        let timer_index = (expires_at_ms / self.period) as usize % self.timers.len();
        log::debug!("Inserting into index: {}, {:?}", timer_index, expires_at_ms);
        self.timers[timer_index].push_back((Arc::downgrade(conn), generation));
    }

    /// Drains buckets due at `now_ms` and returns the connections whose
    /// timers have genuinely fired. Stale entries (rescheduled, dying, or
    /// already destroyed connections) are dropped; not-yet-due entries are
    /// re-inserted at their current expiry.
    pub(super) fn expired(&mut self, now_ms: u64) -> Vec<ConnHandle> {
        let period = self.period;
        let nb_buckets = self.timers.len() as u64;
        let mut fired: Vec<ConnHandle> = vec![];
        let mut not_expired: Vec<(usize, (Weak<Conn>, u64))> = vec![];
        let check_time = now_ms / period * period;
        let last_expire_bucket = check_time / period;

        for expire_bucket in self.next_bucket..last_expire_bucket {
            let list = &mut self.timers[(expire_bucket % nb_buckets) as usize];
            for (weak, generation) in list.drain(..) {
                let conn = match weak.upgrade() {
                    Some(conn) => conn,
                    None => continue,
                };
                if conn.generation() != generation || conn.is_dying() {
                    continue;
                }
                let expire_time = conn.expires_at_ms();
                if expire_time < check_time {
                    fired.push(conn);
                } else {
                    let timer_index = (expire_time / period % nb_buckets) as usize;
                    not_expired.push((timer_index, (weak, generation)));
                }
            }
            for (timer_index, entry) in not_expired.drain(..) {
                self.timers[timer_index].push_back(entry);
            }
        }
        self.next_bucket = last_expire_bucket;
        fired
    }
}
