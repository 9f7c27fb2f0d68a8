//! Global tracker counters.

use std::sync::atomic::{AtomicU64, Ordering};

pub(crate) static NEW_CONNS: AtomicU64 = AtomicU64::new(0);
pub(crate) static EARLY_DROPS: AtomicU64 = AtomicU64::new(0);
pub(crate) static CONFIRM_RACES: AtomicU64 = AtomicU64::new(0);
pub(crate) static FULL_DROPS: AtomicU64 = AtomicU64::new(0);
pub(crate) static TIMED_OUT: AtomicU64 = AtomicU64::new(0);

pub(crate) trait StatExt {
    fn inc(&self) -> u64;
}

impl StatExt for AtomicU64 {
    #[inline]
    fn inc(&self) -> u64 {
        self.fetch_add(1, Ordering::Relaxed)
    }
}

/// Point-in-time copy of the tracker's global counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrackerStats {
    /// Connections created (provisional records handed out).
    pub new_conns: u64,
    /// Unassured connections evicted to make room under table pressure.
    pub early_drops: u64,
    /// Confirmations that lost the race to a concurrent identical flow.
    pub confirm_races: u64,
    /// Packets dropped because the table was full.
    pub full_drops: u64,
    /// Connections reclaimed by timeout.
    pub timed_out: u64,
}

/// Snapshots the global counters.
pub fn snapshot() -> TrackerStats {
    TrackerStats {
        new_conns: NEW_CONNS.load(Ordering::Relaxed),
        early_drops: EARLY_DROPS.load(Ordering::Relaxed),
        confirm_races: CONFIRM_RACES.load(Ordering::Relaxed),
        full_drops: FULL_DROPS.load(Ordering::Relaxed),
        timed_out: TIMED_OUT.load(Ordering::Relaxed),
    }
}
