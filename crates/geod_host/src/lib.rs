//! Module host runtime for the geod daemon.
//!
//! Loads feature modules (shared libraries or in-process symbol tables),
//! drives their lifecycle under a timed table lock, tracks the threads they
//! own, and indexes the routes they claim so the connection dispatcher can
//! find the module responsible for a request.

pub mod abi;
pub mod cache;
pub mod context;
pub mod diagnostics;
pub mod error;
pub mod host;
pub mod lifecycle;
pub mod loader;
pub mod own_thread;
pub mod request;
pub mod routes;
pub mod state;
pub mod terrain;

pub use abi::{
    Capabilities, Capability, EventContext, EventHook, EventKind, EventReply, Module, ModuleError,
    Symbol, ThreadHooks,
};
pub use cache::{CacheDir, CacheFile};
pub use context::{ModuleContext, ModuleId, RequestHandler};
pub use diagnostics::{Diagnostics, DiagnosticsSnapshot};
pub use error::{HostError, LoadError};
pub use host::{HostInterface, LogLevel};
pub use lifecycle::{HostConfig, ModuleInfo, ModuleLease, Registry, UnloadOutcome};
pub use loader::{DylibLoader, LibraryHandle, ModuleLoader, StaticLoader, SymbolTable};
pub use own_thread::{OwnThreadSet, ShutdownReport, ThreadControl};
pub use request::{Request, Transport};
pub use routes::{Protocol, RouteIndex};
pub use state::ModuleState;
pub use terrain::{AuxLibrary, AuxLoader, AuxResource, DylibAuxLoader, TerrainInfo};

#[doc(hidden)]
pub mod __private {
    pub use once_cell::sync::Lazy;

    use std::os::raw::c_int;
    use std::panic::{catch_unwind, AssertUnwindSafe};

    /// Runs a module entry point, turning errors and panics into a negative status.
    pub fn guard<F>(f: F) -> c_int
    where
        F: FnOnce() -> Result<(), crate::ModuleError>,
    {
        match catch_unwind(AssertUnwindSafe(f)) {
            Ok(Ok(())) => crate::abi::STATUS_OK,
            Ok(Err(e)) => {
                tracing::error!("module entry point failed: {}", e);
                crate::abi::STATUS_FAILED
            }
            Err(_) => {
                tracing::error!("module entry point panicked");
                crate::abi::STATUS_FAILED
            }
        }
    }

    /// Same as [`guard`] for entry points without a status.
    pub fn guard_unit<F: FnOnce()>(f: F) {
        if catch_unwind(AssertUnwindSafe(f)).is_err() {
            tracing::error!("module entry point panicked");
        }
    }
}
