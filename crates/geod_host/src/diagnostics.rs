use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for the runtime's failure paths.
#[derive(Debug, Default)]
pub struct Diagnostics {
    lock_timeouts: AtomicU64,
    load_failures: AtomicU64,
    deferred_unloads: AtomicU64,
    abandoned_threads: AtomicU64,
    evictions: AtomicU64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DiagnosticsSnapshot {
    pub lock_timeouts: u64,
    pub load_failures: u64,
    pub deferred_unloads: u64,
    pub abandoned_threads: u64,
    pub evictions: u64,
}

impl Diagnostics {
    pub fn lock_timeout(&self) {
        self.lock_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn load_failure(&self) {
        self.load_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn deferred_unload(&self) {
        self.deferred_unloads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn abandoned(&self, threads: usize) {
        self.abandoned_threads
            .fetch_add(threads as u64, Ordering::Relaxed);
    }

    pub fn eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            lock_timeouts: self.lock_timeouts.load(Ordering::Relaxed),
            load_failures: self.load_failures.load(Ordering::Relaxed),
            deferred_unloads: self.deferred_unloads.load(Ordering::Relaxed),
            abandoned_threads: self.abandoned_threads.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    pub fn clear(&self) {
        for counter in [
            &self.lock_timeouts,
            &self.load_failures,
            &self.deferred_unloads,
            &self.abandoned_threads,
            &self.evictions,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
