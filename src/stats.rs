//! Atomic counters for pool- and client-level statistics.
//!
//! Every field is an independent `Atomic*`, updated with `Ordering::Relaxed`
//! and never guarded by a mutex — per-field snapshots are each individually
//! meaningful, so there's nothing to keep consistent across a pair of reads.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Per-pool counters: one per server's [`crate::pool::Pool`].
#[derive(Default, Debug)]
pub struct PoolStats {
    acquire_count: AtomicU64,
    acquire_wait_count: AtomicU64,
    acquire_wait_time_ns: AtomicU64,
    acquire_errors: AtomicU64,
    created_conns: AtomicU64,
    destroyed_conns: AtomicU64,
    total_conns: AtomicI64,
    idle_conns: AtomicI64,
    active_conns: AtomicI64,
}

/// Point-in-time snapshot of [`PoolStats`], one atomic load per field.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStatsSnapshot {
    pub acquire_count: u64,
    pub acquire_wait_count: u64,
    pub acquire_wait_time_ns: u64,
    pub acquire_errors: u64,
    pub created_conns: u64,
    pub destroyed_conns: u64,
    pub total_conns: i64,
    pub idle_conns: i64,
    pub active_conns: i64,
}

impl PoolStats {
    pub fn record_acquire(&self) {
        self.acquire_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_acquire_wait(&self, wait_ns: u64) {
        self.acquire_wait_count.fetch_add(1, Ordering::Relaxed);
        self.acquire_wait_time_ns.fetch_add(wait_ns, Ordering::Relaxed);
    }

    pub fn record_acquire_error(&self) {
        self.acquire_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_created(&self) {
        self.created_conns.fetch_add(1, Ordering::Relaxed);
        self.total_conns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_destroyed(&self) {
        self.destroyed_conns.fetch_add(1, Ordering::Relaxed);
        self.total_conns.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_idle_to_active(&self) {
        self.idle_conns.fetch_sub(1, Ordering::Relaxed);
        self.active_conns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_active_to_idle(&self) {
        self.active_conns.fetch_sub(1, Ordering::Relaxed);
        self.idle_conns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_new_active(&self) {
        self.active_conns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_active_destroyed(&self) {
        self.active_conns.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_idle_destroyed(&self) {
        self.idle_conns.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PoolStatsSnapshot {
        PoolStatsSnapshot {
            acquire_count: self.acquire_count.load(Ordering::Relaxed),
            acquire_wait_count: self.acquire_wait_count.load(Ordering::Relaxed),
            acquire_wait_time_ns: self.acquire_wait_time_ns.load(Ordering::Relaxed),
            acquire_errors: self.acquire_errors.load(Ordering::Relaxed),
            created_conns: self.created_conns.load(Ordering::Relaxed),
            destroyed_conns: self.destroyed_conns.load(Ordering::Relaxed),
            total_conns: self.total_conns.load(Ordering::Relaxed),
            idle_conns: self.idle_conns.load(Ordering::Relaxed),
            active_conns: self.active_conns.load(Ordering::Relaxed),
        }
    }
}

/// Aggregate client-level counters: one per [`crate::client::Client`].
///
/// Tracks `GetHits` alone rather than a `CacheHits`/`CacheMisses` pair —
/// sufficient to validate hit/miss behavior end to end without doubling the
/// counter surface for a distinction the core doesn't otherwise need.
#[derive(Default, Debug)]
pub struct ClientStats {
    gets: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    increments: AtomicU64,
    get_hits: AtomicU64,
    errors: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ClientStatsSnapshot {
    pub gets: u64,
    pub sets: u64,
    pub deletes: u64,
    pub increments: u64,
    pub get_hits: u64,
    pub errors: u64,
}

impl ClientStats {
    pub fn record_get(&self, hit: bool) {
        self.gets.fetch_add(1, Ordering::Relaxed);
        if hit {
            self.get_hits.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_set(&self) {
        self.sets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_increment(&self) {
        self.increments.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ClientStatsSnapshot {
        ClientStatsSnapshot {
            gets: self.gets.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            increments: self.increments.load(Ordering::Relaxed),
            get_hits: self.get_hits.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}
