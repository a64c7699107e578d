use crate::own_thread::OwnThreadSet;
use crate::request::Request;
use crate::routes::{ModuleRoutes, Protocol};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Index of a module slot; stable for the life of the process.
pub type ModuleId = usize;

/// Handles one request routed to a module.
pub type RequestHandler = Arc<dyn Fn(&ModuleContext, &mut Request<'_>) + Send + Sync>;

/// The part of a module slot that modules and the dispatcher see.
///
/// Route arrays are written once during registration and never mutated
/// afterwards, so readers need no lock. Handlers are replaced on every load.
pub struct ModuleContext {
    id: ModuleId,
    name: String,
    routes: ModuleRoutes,
    handlers: RwLock<HashMap<Protocol, RequestHandler>>,
    threads: OwnThreadSet,
}

impl ModuleContext {
    pub(crate) fn new(id: ModuleId, name: impl Into<String>, max_own_threads: usize) -> Self {
        Self {
            id,
            name: name.into(),
            routes: ModuleRoutes::default(),
            handlers: RwLock::new(HashMap::new()),
            threads: OwnThreadSet::new(max_own_threads),
        }
    }

    pub fn id(&self) -> ModuleId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn routes(&self) -> &ModuleRoutes {
        &self.routes
    }

    pub fn threads(&self) -> &OwnThreadSet {
        &self.threads
    }

    pub fn handler(&self, protocol: Protocol) -> Option<RequestHandler> {
        self.handlers.read().get(&protocol).cloned()
    }

    pub(crate) fn set_handler(&self, protocol: Protocol, handler: RequestHandler) {
        self.handlers.write().insert(protocol, handler);
    }

    /// Drops every handler; they point into the library being unloaded.
    pub(crate) fn clear_handlers(&self) {
        self.handlers.write().clear();
    }
}

impl fmt::Debug for ModuleContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleContext")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("routes", &self.routes)
            .finish()
    }
}
