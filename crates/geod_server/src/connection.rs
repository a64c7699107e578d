//! Per-connection bookkeeping.
//!
//! The accept path creates a context and hands the socket to a worker; the
//! worker marks the context finished after closing the socket. Only the
//! housekeeper removes contexts, and only finished ones.

use geod_host::Protocol;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionStatus {
    Running = 0,
    FinishedOk = 1,
    Error = 2,
}

impl ConnectionStatus {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => ConnectionStatus::FinishedOk,
            2 => ConnectionStatus::Error,
            _ => ConnectionStatus::Running,
        }
    }
}

#[derive(Debug)]
pub struct ConnectionContext {
    id: u64,
    protocol: Protocol,
    peer: SocketAddr,
    accepted_at: Instant,
    status: AtomicU8,
    exec_micros: AtomicU64,
}

impl ConnectionContext {
    pub fn new(id: u64, protocol: Protocol, peer: SocketAddr) -> Self {
        Self {
            id,
            protocol,
            peer,
            accepted_at: Instant::now(),
            status: AtomicU8::new(ConnectionStatus::Running as u8),
            exec_micros: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn is_finished(&self) -> bool {
        self.status() != ConnectionStatus::Running
    }

    /// Marks the connection finished. Only the first call has an effect;
    /// the status never returns to running.
    pub fn finish(&self, status: ConnectionStatus) -> bool {
        if status == ConnectionStatus::Running || self.is_finished() {
            return false;
        }
        let elapsed = self.accepted_at.elapsed().as_micros() as u64;
        self.exec_micros.store(elapsed, Ordering::Relaxed);
        self.status
            .compare_exchange(
                ConnectionStatus::Running as u8,
                status as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn exec_time(&self) -> Duration {
        Duration::from_micros(self.exec_micros.load(Ordering::Relaxed))
    }
}

/// Finished connections collected by one reap pass.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct ReapSummary {
    pub finished_ok: u64,
    pub failed: u64,
    pub exec_total: Duration,
}

impl ReapSummary {
    pub fn count(&self) -> u64 {
        self.finished_ok + self.failed
    }
}

#[derive(Debug, Default)]
struct Entries {
    list: Vec<Arc<ConnectionContext>>,
    /// Where the next reap pass resumes.
    cursor: usize,
}

/// Connection contexts of one listener.
#[derive(Debug, Default)]
pub struct ConnectionList {
    entries: Mutex<Entries>,
    next_id: AtomicU64,
}

impl ConnectionList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, protocol: Protocol, peer: SocketAddr) -> Arc<ConnectionContext> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let ctx = Arc::new(ConnectionContext::new(id, protocol, peer));
        self.entries.lock().list.push(ctx.clone());
        ctx
    }

    pub fn len(&self) -> usize {
        self.entries.lock().list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().list.is_empty()
    }

    pub fn alive(&self) -> usize {
        self.entries
            .lock()
            .list
            .iter()
            .filter(|c| !c.is_finished())
            .count()
    }

    /// Removes finished contexts, examining at most `scan_limit` entries.
    ///
    /// Each pass resumes where the previous one stopped and wraps around, so
    /// long-lived connections at the front cannot hide finished ones behind
    /// them.
    pub fn reap(&self, scan_limit: usize) -> ReapSummary {
        let mut summary = ReapSummary::default();
        let mut guard = self.entries.lock();
        let Entries { list, cursor } = &mut *guard;
        let budget = scan_limit.min(list.len());
        let mut i = *cursor;
        for _ in 0..budget {
            if list.is_empty() {
                break;
            }
            if i >= list.len() {
                i = 0;
            }
            match list[i].status() {
                ConnectionStatus::Running => i += 1,
                status => {
                    let ctx = list.swap_remove(i);
                    summary.exec_total += ctx.exec_time();
                    if status == ConnectionStatus::FinishedOk {
                        summary.finished_ok += 1;
                    } else {
                        summary.failed += 1;
                    }
                }
            }
        }
        *cursor = i;
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    #[test]
    fn status_is_monotonic() {
        let ctx = ConnectionContext::new(1, Protocol::Http, peer());
        assert!(!ctx.finish(ConnectionStatus::Running));
        assert!(ctx.finish(ConnectionStatus::Error));
        assert!(!ctx.finish(ConnectionStatus::FinishedOk));
        assert_eq!(ctx.status(), ConnectionStatus::Error);
    }

    #[test]
    fn reap_removes_only_finished() {
        let list = ConnectionList::new();
        let ctxs: Vec<_> = (0..6).map(|_| list.register(Protocol::Http, peer())).collect();
        ctxs[0].finish(ConnectionStatus::FinishedOk);
        ctxs[2].finish(ConnectionStatus::Error);
        ctxs[5].finish(ConnectionStatus::FinishedOk);

        let summary = list.reap(100);
        assert_eq!(summary.finished_ok, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(list.len(), 3);
        assert_eq!(list.alive(), 3);
        assert_eq!(list.reap(100).count(), 0);
    }

    #[test]
    fn reap_respects_scan_limit() {
        let list = ConnectionList::new();
        for _ in 0..10 {
            list.register(Protocol::Control, peer())
                .finish(ConnectionStatus::FinishedOk);
        }
        assert_eq!(list.reap(4).count(), 4);
        assert_eq!(list.len(), 6);
        assert_eq!(list.reap(100).count(), 6);
        assert!(list.is_empty());
    }

    #[test]
    fn reap_reaches_finished_entries_behind_long_lived_ones() {
        let list = ConnectionList::new();
        let sessions: Vec<_> = (0..128).map(|_| list.register(Protocol::Ws, peer())).collect();
        for _ in 0..50 {
            list.register(Protocol::Http, peer())
                .finish(ConnectionStatus::FinishedOk);
        }

        let mut reaped = 0;
        for _ in 0..3 {
            reaped += list.reap(128).count();
        }
        assert_eq!(reaped, 50);
        assert_eq!(list.len(), 128);
        assert_eq!(list.alive(), 128);

        sessions[3].finish(ConnectionStatus::Error);
        let summary = (0..2).map(|_| list.reap(128)).fold(0, |n, s| n + s.failed);
        assert_eq!(summary, 1);
        assert_eq!(list.len(), 127);
    }

    #[test]
    fn ids_are_unique() {
        let list = ConnectionList::new();
        let a = list.register(Protocol::Ws, peer());
        let b = list.register(Protocol::Ws, peer());
        assert_ne!(a.id(), b.id());
    }
}
