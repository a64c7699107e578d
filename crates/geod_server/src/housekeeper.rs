//! Periodic maintenance: idle eviction, connection reaping, statistics and
//! module rescans.

use crate::config::HousekeeperConfig;
use crate::listener::ListenerSocket;
use crate::server::ServerShared;
use geod_host::Registry;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, error, info, trace};

const SLEEP_SLICE: Duration = Duration::from_secs(1);

/// What one maintenance cycle did.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CycleReport {
    pub modules_evicted: usize,
    pub aux_evicted: bool,
    pub connections_reaped: u64,
    pub cache_purged: usize,
    /// Modules registered by a rescan, if one was requested.
    pub rescanned: Option<usize>,
}

/// Runs one maintenance cycle as of `now`.
pub fn run_cycle(
    registry: &Registry,
    listeners: &[Arc<ListenerSocket>],
    config: &HousekeeperConfig,
    now: Instant,
) -> CycleReport {
    let mut report = CycleReport {
        modules_evicted: registry.evict_idle(now),
        aux_evicted: registry.host().aux().evict_idle(now, config.aux_idle_timeout),
        ..CycleReport::default()
    };

    for listener in listeners {
        let reaped = listener.connections().reap(config.reap_scan_limit);
        report.connections_reaped += reaped.count();
        let alive = listener.connections().alive();
        let mut stats = listener.stats();
        stats.record_reap(&reaped);
        let sample = stats.tick(alive);
        trace!("{} tick: {:?}", listener.protocol(), sample);
    }

    let cache = registry.host().cache();
    if cache.root().is_dir() {
        match cache.purge_expired(SystemTime::now()) {
            Ok(purged) => report.cache_purged = purged,
            Err(e) => debug!("Cache purge failed: {}", e),
        }
    }

    if registry.take_reload_request() {
        info!("Rescanning module directory");
        report.rescanned = Some(registry.scan_and_register());
    }

    report
}

/// The maintenance thread.
pub struct Housekeeper {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Housekeeper {
    pub fn start(shared: Arc<ServerShared>) -> std::io::Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let handle = std::thread::Builder::new()
            .name("housekeeper".to_string())
            .spawn(move || {
                let cycle = Duration::from_secs(shared.config.housekeeper.cycle_secs.max(1));
                let mut last_cycle = Instant::now();
                while flag.load(Ordering::Acquire) {
                    std::thread::sleep(SLEEP_SLICE);
                    if last_cycle.elapsed() < cycle {
                        continue;
                    }
                    last_cycle = Instant::now();
                    let report = run_cycle(
                        &shared.registry,
                        &shared.listeners,
                        &shared.config.housekeeper,
                        last_cycle,
                    );
                    if report.modules_evicted > 0 || report.aux_evicted {
                        debug!("Housekeeper cycle: {:?}", report);
                    }
                }
                debug!("Housekeeper stopped");
            })?;
        Ok(Self {
            running,
            handle: Some(handle),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Stops the thread and waits for its current cycle to end.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Housekeeper thread panicked");
            }
        }
    }
}

impl Drop for Housekeeper {
    fn drop(&mut self) {
        self.stop();
    }
}
