//! Long-running threads owned by a module.
//!
//! Cancellation is cooperative: the host clears `keep_running` under the
//! thread's control lock and wakes it. A thread that does not exit in time
//! is abandoned, never killed.

use crate::error::HostError;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Control block shared between the host and one own-thread.
#[derive(Debug)]
pub struct ThreadControl {
    keep_running: Mutex<bool>,
    wakeup: Condvar,
    running: AtomicBool,
}

impl ThreadControl {
    fn new() -> Self {
        Self {
            keep_running: Mutex::new(true),
            wakeup: Condvar::new(),
            running: AtomicBool::new(true),
        }
    }

    pub fn keep_running(&self) -> bool {
        *self.keep_running.lock()
    }

    /// Sleeps up to `timeout` or until a stop is requested. Returns whether
    /// the thread should keep going.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut keep = self.keep_running.lock();
        if *keep {
            self.wakeup.wait_for(&mut keep, timeout);
        }
        *keep
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn request_stop(&self, lock_timeout: Duration) -> bool {
        match self.keep_running.try_lock_for(lock_timeout) {
            Some(mut keep) => {
                *keep = false;
                self.wakeup.notify_all();
                true
            }
            None => false,
        }
    }

    fn exited(&self) {
        self.running.store(false, Ordering::Release);
    }
}

struct ExitGuard(Arc<ThreadControl>);

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.0.exited();
    }
}

struct OwnThread {
    name: String,
    control: Arc<ThreadControl>,
    handle: Option<JoinHandle<()>>,
}

/// Outcome of stopping a module's own threads.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    pub joined: usize,
    pub abandoned: usize,
}

/// All own-threads of one module.
pub struct OwnThreadSet {
    threads: Mutex<Vec<OwnThread>>,
    limit: usize,
}

impl OwnThreadSet {
    pub fn new(limit: usize) -> Self {
        Self {
            threads: Mutex::new(Vec::new()),
            limit,
        }
    }

    /// Spawns `body` on a named thread and registers it. The thread counts as
    /// running from the moment it is registered.
    pub fn spawn<F>(&self, module: &str, name: &str, body: F) -> Result<(), HostError>
    where
        F: FnOnce(&ThreadControl) + Send + 'static,
    {
        let mut threads = self.threads.lock();
        threads.retain(|t| t.control.is_running());
        if threads.len() >= self.limit {
            return Err(HostError::ThreadLimit {
                module: module.to_string(),
                limit: self.limit,
            });
        }

        let control = Arc::new(ThreadControl::new());
        let thread_control = control.clone();
        let handle = thread::Builder::new()
            .name(format!("{}-{}", module, name))
            .spawn(move || {
                let _guard = ExitGuard(thread_control.clone());
                body(&thread_control);
            })?;

        debug!("Module {} started own thread {}", module, name);
        threads.push(OwnThread {
            name: name.to_string(),
            control,
            handle: Some(handle),
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.threads.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.lock().is_empty()
    }

    pub fn running_count(&self) -> usize {
        self.threads
            .lock()
            .iter()
            .filter(|t| t.control.is_running())
            .count()
    }

    pub fn names(&self) -> Vec<String> {
        self.threads.lock().iter().map(|t| t.name.clone()).collect()
    }

    /// Asks every thread to stop, waits a bounded time, joins the ones that
    /// exited and abandons the rest.
    ///
    /// Each round tries every control lock with `timeout`; up to `max_retry`
    /// rounds are made for threads whose lock could not be taken.
    pub fn shutdown(&self, module: &str, timeout: Duration, max_retry: u32) -> ShutdownReport {
        let threads = std::mem::take(&mut *self.threads.lock());
        if threads.is_empty() {
            return ShutdownReport::default();
        }

        let mut signalled = vec![false; threads.len()];
        for round in 0..max_retry.max(1) {
            for (thread, done) in threads.iter().zip(signalled.iter_mut()) {
                if !*done {
                    *done = thread.control.request_stop(timeout);
                }
            }
            if signalled.iter().all(|s| *s) {
                break;
            }
            warn!(
                "Module {}: {} own thread(s) not signalled after round {}",
                module,
                signalled.iter().filter(|s| !**s).count(),
                round + 1
            );
        }

        let deadline = Instant::now() + timeout * max_retry.max(1);
        while threads.iter().any(|t| t.control.is_running()) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }

        let mut report = ShutdownReport::default();
        for mut thread in threads {
            if thread.control.is_running() {
                error!(
                    "Module {}: own thread {} did not stop; abandoning it",
                    module, thread.name
                );
                report.abandoned += 1;
                continue;
            }
            if let Some(handle) = thread.handle.take() {
                if handle.join().is_err() {
                    warn!("Module {}: own thread {} panicked", module, thread.name);
                }
            }
            report.joined += 1;
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn cooperative_threads_are_joined() {
        let set = OwnThreadSet::new(4);
        let ticks = Arc::new(AtomicUsize::new(0));
        for name in ["a", "b"] {
            let ticks = ticks.clone();
            set.spawn("m", name, move |ctl| {
                while ctl.wait_timeout(Duration::from_millis(10)) {
                    ticks.fetch_add(1, Ordering::Relaxed);
                }
            })
            .unwrap();
        }
        assert_eq!(set.running_count(), 2);

        let report = set.shutdown("m", Duration::from_millis(100), 5);
        assert_eq!(report, ShutdownReport { joined: 2, abandoned: 0 });
        assert!(set.is_empty());
    }

    #[test]
    fn stuck_thread_is_abandoned() {
        let set = OwnThreadSet::new(4);
        set.spawn("m", "stuck", |_ctl| thread::sleep(Duration::from_millis(800)))
            .unwrap();

        let report = set.shutdown("m", Duration::from_millis(10), 2);
        assert_eq!(report, ShutdownReport { joined: 0, abandoned: 1 });
    }

    #[test]
    fn thread_limit_is_enforced() {
        let set = OwnThreadSet::new(1);
        set.spawn("m", "one", |ctl| while ctl.wait_timeout(Duration::from_millis(10)) {})
            .unwrap();
        let err = set.spawn("m", "two", |_| {}).unwrap_err();
        assert!(matches!(err, HostError::ThreadLimit { limit: 1, .. }));
        set.shutdown("m", Duration::from_millis(100), 5);
    }

    #[test]
    fn finished_threads_free_their_slot() {
        let set = OwnThreadSet::new(1);
        set.spawn("m", "short", |_| {}).unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while set.running_count() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        set.spawn("m", "next", |_| {}).unwrap();
        let report = set.shutdown("m", Duration::from_millis(100), 5);
        assert_eq!(report.abandoned, 0);
    }
}
