//! The module table and every lifecycle transition.
//!
//! All mutation of module slots goes through one table lock that is always
//! taken with a timeout; a timeout is reported as a transient error and the
//! caller retries later. Module code (init, register, event, finish) runs
//! with the lock held only where the transition needs it to be atomic;
//! own-thread shutdown and `finish` run after the lock is released.

use crate::abi::{Capabilities, EventContext, EventKind, EventReply};
use crate::cache::CacheDir;
use crate::context::{ModuleContext, ModuleId, RequestHandler};
use crate::diagnostics::Diagnostics;
use crate::error::{HostError, LoadError};
use crate::host::HostInterface;
use crate::loader::{LibraryHandle, ModuleLoader};
use crate::own_thread::ShutdownReport;
use crate::routes::{Protocol, RouteIndex};
use crate::state::ModuleState;
use crate::terrain::AuxResource;
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, error, info, warn};

/// Tunables of the module runtime.
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub lock_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub shutdown_max_retry: u32,
    /// STANDBY negotiations allowed before TERMINATE is sent.
    pub standby_attempts: u32,
    pub idle_timeout: Duration,
    pub max_routes: usize,
    pub max_own_threads: usize,
    pub max_modules: usize,
    pub cache_dir: PathBuf,
    pub cache_max_age: Duration,
    pub module_config: HashMap<String, HashMap<String, String>>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_millis(20),
            shutdown_timeout: Duration::from_millis(100),
            shutdown_max_retry: 5,
            standby_attempts: 3,
            idle_timeout: Duration::from_secs(60),
            max_routes: 32,
            max_own_threads: 4,
            max_modules: 64,
            cache_dir: PathBuf::from("var/cache"),
            cache_max_age: Duration::from_secs(3600),
            module_config: HashMap::new(),
        }
    }
}

struct ModuleRecord {
    context: Arc<ModuleContext>,
    state: ModuleState,
    library: Option<Box<dyn LibraryHandle>>,
    capabilities: Option<Arc<Capabilities>>,
    refcount: u32,
    last_used: Instant,
    file_mtime: Option<SystemTime>,
    shutdown_attempts: u32,
    registered: bool,
}

impl ModuleRecord {
    fn new(context: Arc<ModuleContext>) -> Self {
        Self {
            context,
            state: ModuleState::None,
            library: None,
            capabilities: None,
            refcount: 0,
            last_used: Instant::now(),
            file_mtime: None,
            shutdown_attempts: 0,
            registered: false,
        }
    }

    fn name(&self) -> &str {
        self.context.name()
    }

    fn set_state(&mut self, next: ModuleState) {
        if !self.state.can_transition_to(next) {
            warn!(
                "Module {}: unexpected transition {} -> {}",
                self.name(),
                self.state,
                next
            );
            debug_assert!(false, "illegal transition {} -> {}", self.state, next);
        }
        debug!("Module {}: {} -> {}", self.name(), self.state, next);
        self.state = next;
    }
}

/// Public view of one module slot.
#[derive(Debug, Clone, Serialize)]
pub struct ModuleInfo {
    pub id: ModuleId,
    pub name: String,
    pub state: ModuleState,
    pub refcount: u32,
    pub idle_secs: u64,
    pub library_loaded: bool,
    pub shutdown_attempts: u32,
    pub own_threads: usize,
    pub routes: HashMap<Protocol, Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnloadOutcome {
    Unloaded,
    /// The module asked for more time; try again on a later sweep.
    Deferred,
    /// Still referenced by a connection.
    InUse,
    /// Nothing to unload.
    NotLoaded,
}

/// A module kept RUNNING for the duration of one connection. Dropping the
/// lease releases the reference.
pub struct ModuleLease<'a> {
    registry: &'a Registry,
    context: Arc<ModuleContext>,
    capabilities: Arc<Capabilities>,
}

impl ModuleLease<'_> {
    pub fn id(&self) -> ModuleId {
        self.context.id()
    }

    pub fn context(&self) -> &Arc<ModuleContext> {
        &self.context
    }

    pub fn handler(&self, protocol: Protocol) -> Option<RequestHandler> {
        self.context.handler(protocol)
    }

    pub fn host(&self) -> &HostInterface {
        &self.registry.host
    }
}

impl fmt::Debug for ModuleLease<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleLease")
            .field("id", &self.context.id())
            .field("module", &self.context.name())
            .finish()
    }
}

impl Drop for ModuleLease<'_> {
    fn drop(&mut self) {
        self.registry.release(&self.context, &self.capabilities);
    }
}

/// Owns every module slot.
pub struct Registry {
    config: HostConfig,
    loader: Arc<dyn ModuleLoader>,
    host: Arc<HostInterface>,
    routes: Arc<RouteIndex>,
    table: Mutex<Vec<ModuleRecord>>,
    contexts: RwLock<Vec<Arc<ModuleContext>>>,
    diagnostics: Arc<Diagnostics>,
    reload_requested: AtomicBool,
}

impl Registry {
    pub fn new(config: HostConfig, loader: Arc<dyn ModuleLoader>, aux: AuxResource) -> Self {
        let routes = Arc::new(RouteIndex::new());
        let cache = CacheDir::new(&config.cache_dir, config.cache_max_age);
        let host = Arc::new(HostInterface::new(&config, routes.clone(), cache, aux));
        Self {
            config,
            loader,
            host,
            routes,
            table: Mutex::new(Vec::new()),
            contexts: RwLock::new(Vec::new()),
            diagnostics: Arc::new(Diagnostics::default()),
            reload_requested: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn host(&self) -> &Arc<HostInterface> {
        &self.host
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    fn lock_table(&self) -> Result<MutexGuard<'_, Vec<ModuleRecord>>, HostError> {
        self.table
            .try_lock_for(self.config.lock_timeout)
            .ok_or_else(|| {
                self.diagnostics.lock_timeout();
                debug!("Module table lock timed out");
                HostError::LockTimeout {
                    what: "module table",
                    timeout_ms: self.config.lock_timeout.as_millis() as u64,
                }
            })
    }

    // ------------------------------------------------------------------------
    // Discovery and registration
    // ------------------------------------------------------------------------

    /// Discovers module files not yet in the table, loads them and runs their
    /// registration. Returns how many new modules were registered.
    pub fn scan_and_register(&self) -> usize {
        let names = match self.loader.discover() {
            Ok(names) => names,
            Err(e) => {
                error!("Module discovery failed: {}", e);
                return 0;
            }
        };

        let mut table = match self.lock_table() {
            Ok(table) => table,
            Err(e) => {
                warn!("Module rescan postponed: {}", e);
                self.request_reload();
                return 0;
            }
        };
        let mut registered = 0;
        for name in names {
            if table.iter().any(|r| r.name() == name) {
                continue;
            }
            if table.len() >= self.config.max_modules {
                warn!(
                    "Module limit of {} reached; ignoring {}",
                    self.config.max_modules, name
                );
                continue;
            }

            let id = table.len();
            let context = Arc::new(ModuleContext::new(id, name.as_str(), self.config.max_own_threads));
            table.push(ModuleRecord::new(context.clone()));
            self.contexts.write().push(context);

            let record = &mut table[id];
            match self
                .load_locked(record)
                .and_then(|()| self.register_locked(record))
            {
                Ok(()) => registered += 1,
                Err(e) => warn!("Module {} not registered: {}", name, e),
            }
        }

        if registered > 0 {
            info!("Registered {} new module(s)", registered);
        }
        registered
    }

    /// Runs the module's `register`. A failure tears the module down and
    /// leaves it DISABLED.
    fn register_locked(&self, record: &mut ModuleRecord) -> Result<(), HostError> {
        let Some(caps) = record.capabilities.clone() else {
            return Err(HostError::Unavailable {
                module: record.name().to_string(),
            });
        };
        let code = (caps.register)(&record.context, &self.host);
        if code < 0 {
            let name = record.name().to_string();
            record.capabilities = None;
            let library = record.library.take();
            return Err(self.abort_load(
                record,
                caps,
                library,
                true,
                LoadError::RegisterFailed { name, code },
            ));
        }
        record.registered = true;
        info!(
            "Module {} registered (http: {}, ws: {}, control: {})",
            record.name(),
            record.context.routes().paths(Protocol::Http).len(),
            record.context.routes().paths(Protocol::Ws).len(),
            record.context.routes().paths(Protocol::Control).len()
        );
        Ok(())
    }

    pub fn request_reload(&self) {
        self.reload_requested.store(true, Ordering::SeqCst);
    }

    /// Clears and returns the pending reload request.
    pub fn take_reload_request(&self) -> bool {
        self.reload_requested.swap(false, Ordering::SeqCst)
    }

    // ------------------------------------------------------------------------
    // load
    // ------------------------------------------------------------------------

    pub fn load(&self, id: ModuleId) -> Result<(), HostError> {
        let mut table = self.lock_table()?;
        let record = table.get_mut(id).ok_or(HostError::UnknownModule(id))?;
        if record.state.is_resident() {
            return Ok(());
        }
        if record.state == ModuleState::ShuttingDown {
            return Err(HostError::Unavailable {
                module: record.name().to_string(),
            });
        }
        self.load_locked(record)
    }

    fn disable(&self, record: &mut ModuleRecord, err: LoadError) -> HostError {
        error!("Module {} disabled: {}", record.name(), err);
        self.diagnostics.load_failure();
        record.set_state(ModuleState::Disabled);
        HostError::Load(err)
    }

    /// Undoes a load that failed after the library was opened: stops the
    /// threads the module already spawned, optionally runs `finish`, closes
    /// the library and marks the module DISABLED.
    fn abort_load(
        &self,
        record: &mut ModuleRecord,
        caps: Arc<Capabilities>,
        library: Option<Box<dyn LibraryHandle>>,
        run_finish: bool,
        err: LoadError,
    ) -> HostError {
        let context = record.context.clone();
        let report = context.threads().shutdown(
            context.name(),
            self.config.shutdown_timeout,
            self.config.shutdown_max_retry,
        );
        if run_finish {
            (caps.finish)(&context);
        }
        context.clear_handlers();
        drop(caps);
        self.close_library(&context, library, report);
        self.disable(record, err)
    }

    /// A library whose threads were abandoned may still be executing; it is
    /// leaked instead of closed.
    fn close_library(
        &self,
        context: &ModuleContext,
        library: Option<Box<dyn LibraryHandle>>,
        report: ShutdownReport,
    ) {
        if report.abandoned > 0 {
            self.diagnostics.abandoned(report.abandoned);
            error!(
                "Module {}: {} own thread(s) abandoned; its library stays mapped",
                context.name(),
                report.abandoned
            );
            std::mem::forget(library);
        } else {
            drop(library);
        }
    }

    fn load_locked(&self, record: &mut ModuleRecord) -> Result<(), HostError> {
        let name = record.name().to_string();
        record.last_used = Instant::now();

        let mtime = match self.loader.modified(&name) {
            Ok(mtime) => mtime,
            Err(e) => {
                if record.state == ModuleState::Disabled {
                    return Err(HostError::Disabled { module: name });
                }
                return Err(self.disable(
                    record,
                    LoadError::MissingFile {
                        name: name.clone(),
                        reason: e.to_string(),
                    },
                ));
            }
        };

        if record.state == ModuleState::Disabled && record.file_mtime == Some(mtime) {
            return Err(HostError::Unchanged { module: name });
        }
        record.file_mtime = Some(mtime);
        record.set_state(ModuleState::Loading);

        let library = match self.loader.open(&name) {
            Ok(library) => library,
            Err(e) => return Err(self.disable(record, e)),
        };
        let caps = match Capabilities::resolve(library.as_ref(), &name) {
            Ok(caps) => caps,
            Err(e) => return Err(self.disable(record, e)),
        };
        record.set_state(ModuleState::Loaded);

        let code = (caps.init)(&record.context, &self.host);
        if code < 0 {
            return Err(self.abort_load(
                record,
                Arc::new(caps),
                Some(library),
                false,
                LoadError::InitFailed { name, code },
            ));
        }

        record.library = Some(library);
        record.capabilities = Some(Arc::new(caps));
        record.shutdown_attempts = 0;
        record.set_state(ModuleState::Initialized);
        info!("Module {} loaded", name);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // start / stop
    // ------------------------------------------------------------------------

    /// Takes a reference on the module for one connection, loading it first
    /// if needed.
    pub fn start(&self, id: ModuleId) -> Result<ModuleLease<'_>, HostError> {
        let mut table = self.lock_table()?;
        let record = table.get_mut(id).ok_or(HostError::UnknownModule(id))?;

        if record.state == ModuleState::ShuttingDown {
            return Err(HostError::Unavailable {
                module: record.name().to_string(),
            });
        }
        if record.state.needs_load() {
            self.load_locked(record)?;
        }
        if !record.registered {
            self.register_locked(record)?;
        }

        let caps = match record.capabilities.clone() {
            Some(caps) => caps,
            None => {
                return Err(HostError::Unavailable {
                    module: record.name().to_string(),
                })
            }
        };
        record.last_used = Instant::now();

        if let Some(thread_init) = &caps.thread_init {
            if thread_init(&record.context) != 0 {
                warn!("Module {} thread init failed", record.name());
                return Err(HostError::ThreadInit {
                    module: record.name().to_string(),
                });
            }
        }

        if record.state != ModuleState::Running {
            record.set_state(ModuleState::Running);
        }
        record.refcount += 1;

        Ok(ModuleLease {
            registry: self,
            context: record.context.clone(),
            capabilities: caps,
        })
    }

    /// Releases a reference taken by [`start`](Self::start) without a lease.
    /// Prefer dropping the lease.
    pub fn stop(&self, id: ModuleId) -> Result<(), HostError> {
        let (context, caps) = {
            let table = self.lock_table()?;
            let record = table.get(id).ok_or(HostError::UnknownModule(id))?;
            match &record.capabilities {
                Some(caps) if record.refcount > 0 => (record.context.clone(), caps.clone()),
                _ => return Ok(()),
            }
        };
        self.release(&context, &caps);
        Ok(())
    }

    fn release(&self, context: &ModuleContext, caps: &Capabilities) {
        if let Some(thread_finish) = &caps.thread_finish {
            thread_finish(context);
        }

        let retries = self.config.shutdown_max_retry.max(1);
        for attempt in 1..=retries {
            match self.lock_table() {
                Ok(mut table) => {
                    let Some(record) = table.get_mut(context.id()) else {
                        return;
                    };
                    record.last_used = Instant::now();
                    if record.refcount == 0 {
                        warn!("Module {} released more often than started", record.name());
                        return;
                    }
                    record.refcount -= 1;
                    if record.refcount == 0
                        && record.state == ModuleState::Running
                        && record.context.threads().running_count() == 0
                    {
                        record.set_state(ModuleState::Initialized);
                    }
                    return;
                }
                Err(_) => debug!(
                    "Module {} release waiting for table lock ({}/{})",
                    context.name(),
                    attempt,
                    retries
                ),
            }
        }
        error!(
            "Module {}: reference could not be released; it will stay loaded",
            context.name()
        );
    }

    // ------------------------------------------------------------------------
    // unload
    // ------------------------------------------------------------------------

    /// Unloads the module if no connection uses it.
    ///
    /// A RUNNING module is first asked to stand by through its event hook.
    /// A busy reply defers the unload; once `standby_attempts` deferrals
    /// were spent the module is told to terminate and unloaded regardless.
    pub fn unload(&self, id: ModuleId) -> Result<UnloadOutcome, HostError> {
        let (context, caps, library) = {
            let mut table = self.lock_table()?;
            let record = table.get_mut(id).ok_or(HostError::UnknownModule(id))?;
            if record.refcount > 0 {
                return Ok(UnloadOutcome::InUse);
            }

            match record.state {
                ModuleState::Running => {
                    if !self.negotiate_standby(record) {
                        return Ok(UnloadOutcome::Deferred);
                    }
                }
                ModuleState::Initialized | ModuleState::Loaded => {}
                _ => return Ok(UnloadOutcome::NotLoaded),
            }

            record.set_state(ModuleState::ShuttingDown);
            (
                record.context.clone(),
                record.capabilities.take(),
                record.library.take(),
            )
        };

        let report = context.threads().shutdown(
            context.name(),
            self.config.shutdown_timeout,
            self.config.shutdown_max_retry,
        );
        if let Some(caps) = caps {
            (caps.finish)(&context);
        }
        context.clear_handlers();
        self.close_library(&context, library, report);

        let mut table = self.table.lock();
        if let Some(record) = table.get_mut(id) {
            record.shutdown_attempts = 0;
            record.set_state(ModuleState::Unloaded);
        }
        self.diagnostics.eviction();
        info!("Module {} unloaded", context.name());
        Ok(UnloadOutcome::Unloaded)
    }

    /// Returns true when the module consented (or must be terminated).
    fn negotiate_standby(&self, record: &mut ModuleRecord) -> bool {
        let Some(event) = record.capabilities.as_ref().and_then(|c| c.event.clone()) else {
            return true;
        };
        let ctx = EventContext {
            attempt: record.shutdown_attempts,
        };

        if record.shutdown_attempts > self.config.standby_attempts {
            warn!(
                "Module {} did not stand by after {} attempts; terminating",
                record.name(),
                record.shutdown_attempts
            );
            event(&record.context, EventKind::Terminate, &ctx);
            return true;
        }

        match EventReply::from_status(event(&record.context, EventKind::Standby, &ctx)) {
            EventReply::Ready => true,
            EventReply::Busy => {
                record.shutdown_attempts += 1;
                self.diagnostics.deferred_unload();
                debug!(
                    "Module {} busy; unload deferred (attempt {})",
                    record.name(),
                    record.shutdown_attempts
                );
                false
            }
        }
    }

    /// Unloads every idle module whose last use is older than the idle timeout.
    pub fn evict_idle(&self, now: Instant) -> usize {
        let candidates: Vec<ModuleId> = match self.lock_table() {
            Ok(table) => table
                .iter()
                .filter(|r| {
                    r.refcount == 0
                        && matches!(r.state, ModuleState::Initialized | ModuleState::Running)
                        && now.saturating_duration_since(r.last_used) > self.config.idle_timeout
                })
                .map(|r| r.context.id())
                .collect(),
            Err(e) => {
                debug!("Idle sweep skipped: {}", e);
                return 0;
            }
        };

        let mut evicted = 0;
        for id in candidates {
            match self.unload(id) {
                Ok(UnloadOutcome::Unloaded) => evicted += 1,
                Ok(_) => {}
                Err(e) => debug!("Idle unload of module {} skipped: {}", id, e),
            }
        }
        evicted
    }

    /// Unloads everything for process exit. Busy modules are pushed through
    /// the standby budget until they are terminated.
    pub fn shutdown_all(&self) {
        let ids: Vec<ModuleId> = self.contexts.read().iter().map(|c| c.id()).collect();
        for id in ids {
            for _ in 0..=self.config.standby_attempts + 1 {
                match self.unload(id) {
                    Ok(UnloadOutcome::Deferred) => continue,
                    Ok(UnloadOutcome::InUse) => {
                        warn!("Module {} still in use at shutdown", id);
                        break;
                    }
                    Ok(_) => break,
                    Err(e) => {
                        warn!("Module {} unload at shutdown failed: {}", id, e);
                        if !e.is_transient() {
                            break;
                        }
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Lookup and introspection
    // ------------------------------------------------------------------------

    pub fn contexts(&self) -> Vec<Arc<ModuleContext>> {
        self.contexts.read().clone()
    }

    pub fn module_count(&self) -> usize {
        self.contexts.read().len()
    }

    pub fn find(&self, name: &str) -> Option<ModuleId> {
        self.contexts
            .read()
            .iter()
            .find(|c| c.name() == name)
            .map(|c| c.id())
    }

    pub fn resolve(&self, protocol: Protocol, path: &str) -> Option<ModuleId> {
        match protocol {
            Protocol::Http => self.routes.lookup(path),
            _ => self.routes.resolve(protocol, path, &self.contexts.read()),
        }
    }

    pub fn resolve_command(&self, words: &[&str]) -> Option<(ModuleId, usize)> {
        self.routes.resolve_command(words, &self.contexts.read())
    }

    pub fn module_snapshot(&self) -> Result<Vec<ModuleInfo>, HostError> {
        let now = Instant::now();
        let table = self.lock_table()?;
        Ok(table
            .iter()
            .map(|r| ModuleInfo {
                id: r.context.id(),
                name: r.name().to_string(),
                state: r.state,
                refcount: r.refcount,
                idle_secs: now.saturating_duration_since(r.last_used).as_secs(),
                library_loaded: r.library.is_some(),
                shutdown_attempts: r.shutdown_attempts,
                own_threads: r.context.threads().running_count(),
                routes: Protocol::ALL
                    .iter()
                    .filter(|p| r.context.routes().is_registered(**p))
                    .map(|p| (*p, r.context.routes().paths(*p).to_vec()))
                    .collect(),
            })
            .collect())
    }

    pub fn state(&self, id: ModuleId) -> Result<ModuleState, HostError> {
        let table = self.lock_table()?;
        table
            .get(id)
            .map(|r| r.state)
            .ok_or(HostError::UnknownModule(id))
    }
}
