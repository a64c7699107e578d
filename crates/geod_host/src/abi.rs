//! The module boundary: exported symbol names, the capability set the host
//! resolves from a library, and the safe traits a module implements.
//!
//! A module written in Rust implements [`Module`] (plus optionally
//! [`ThreadHooks`] and [`EventHook`]) and exports it with
//! [`export_module!`](crate::export_module). The macro emits `extern "C"`
//! entry points under the names in [`Symbol::export_name`].

use crate::context::ModuleContext;
use crate::error::LoadError;
use crate::host::HostInterface;
use crate::loader::LibraryHandle;
use std::os::raw::c_int;
use std::sync::Arc;
use thiserror::Error;

pub const STATUS_OK: c_int = 0;
pub const STATUS_FAILED: c_int = -1;
pub const STATUS_BUSY: c_int = 1;

/// Every symbol the host looks up in a module library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Symbol {
    Register,
    Init,
    Finish,
    ThreadInit,
    ThreadFinish,
    Event,
}

impl Symbol {
    /// Mandatory symbols first, in resolution order.
    pub const ALL: [Symbol; 6] = [
        Symbol::Init,
        Symbol::Finish,
        Symbol::Register,
        Symbol::ThreadInit,
        Symbol::ThreadFinish,
        Symbol::Event,
    ];

    pub const fn export_name(self) -> &'static str {
        match self {
            Symbol::Register => "geod_module_register",
            Symbol::Init => "geod_module_init",
            Symbol::Finish => "geod_module_finish",
            Symbol::ThreadInit => "geod_module_thread_init",
            Symbol::ThreadFinish => "geod_module_thread_finish",
            Symbol::Event => "geod_module_event",
        }
    }

    pub const fn is_mandatory(self) -> bool {
        matches!(self, Symbol::Register | Symbol::Init | Symbol::Finish)
    }
}

/// Lifecycle event delivered to a module before it is unloaded.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Sleep = 1,
    Standby = 2,
    Terminate = 3,
}

/// Extra information handed to the event hook.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct EventContext {
    /// How many shutdown negotiations were already deferred by the module.
    pub attempt: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventReply {
    Ready,
    Busy,
}

impl EventReply {
    pub fn from_status(code: c_int) -> Self {
        if code == STATUS_OK {
            EventReply::Ready
        } else {
            EventReply::Busy
        }
    }

    pub fn status(self) -> c_int {
        match self {
            EventReply::Ready => STATUS_OK,
            EventReply::Busy => STATUS_BUSY,
        }
    }
}

#[derive(Error, Debug)]
pub enum ModuleError {
    #[error("{0}")]
    Failed(String),
    #[error(transparent)]
    Host(#[from] crate::error::HostError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// ============================================================================
// Resolved capabilities
// ============================================================================

pub type EntryFn = Arc<dyn Fn(&ModuleContext, &HostInterface) -> c_int + Send + Sync>;
pub type FinishFn = Arc<dyn Fn(&ModuleContext) + Send + Sync>;
pub type ThreadHookFn = Arc<dyn Fn(&ModuleContext) -> c_int + Send + Sync>;
pub type EventFn = Arc<dyn Fn(&ModuleContext, EventKind, &EventContext) -> c_int + Send + Sync>;

/// One resolved entry point.
#[derive(Clone)]
pub enum Capability {
    Register(EntryFn),
    Init(EntryFn),
    Finish(FinishFn),
    ThreadInit(ThreadHookFn),
    ThreadFinish(ThreadHookFn),
    Event(EventFn),
}

impl Capability {
    pub fn symbol(&self) -> Symbol {
        match self {
            Capability::Register(_) => Symbol::Register,
            Capability::Init(_) => Symbol::Init,
            Capability::Finish(_) => Symbol::Finish,
            Capability::ThreadInit(_) => Symbol::ThreadInit,
            Capability::ThreadFinish(_) => Symbol::ThreadFinish,
            Capability::Event(_) => Symbol::Event,
        }
    }
}

impl std::fmt::Debug for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Capability({})", self.symbol().export_name())
    }
}

/// The full capability set of a loaded module.
#[derive(Clone)]
pub struct Capabilities {
    pub register: EntryFn,
    pub init: EntryFn,
    pub finish: FinishFn,
    pub thread_init: Option<ThreadHookFn>,
    pub thread_finish: Option<ThreadHookFn>,
    pub event: Option<EventFn>,
}

impl Capabilities {
    /// Resolves every symbol from `library`. A missing mandatory symbol fails
    /// the whole resolution.
    pub fn resolve(library: &dyn LibraryHandle, module: &str) -> Result<Self, LoadError> {
        let missing = |symbol: Symbol| LoadError::MissingSymbol {
            name: module.to_string(),
            symbol: symbol.export_name(),
        };

        let init = match library.resolve(Symbol::Init) {
            Some(Capability::Init(f)) => f,
            _ => return Err(missing(Symbol::Init)),
        };
        let finish = match library.resolve(Symbol::Finish) {
            Some(Capability::Finish(f)) => f,
            _ => return Err(missing(Symbol::Finish)),
        };
        let register = match library.resolve(Symbol::Register) {
            Some(Capability::Register(f)) => f,
            _ => return Err(missing(Symbol::Register)),
        };

        let thread_init = match library.resolve(Symbol::ThreadInit) {
            Some(Capability::ThreadInit(f)) => Some(f),
            _ => None,
        };
        let thread_finish = match library.resolve(Symbol::ThreadFinish) {
            Some(Capability::ThreadFinish(f)) => Some(f),
            _ => None,
        };
        let event = match library.resolve(Symbol::Event) {
            Some(Capability::Event(f)) => Some(f),
            _ => None,
        };

        Ok(Self {
            register,
            init,
            finish,
            thread_init,
            thread_finish,
            event,
        })
    }
}

// ============================================================================
// Safe module traits
// ============================================================================

/// Mandatory module entry points.
pub trait Module: Send + Sync {
    /// Claims routes and command names. Called once after the first load.
    fn register(&self, module: &ModuleContext, host: &HostInterface) -> Result<(), ModuleError>;

    /// Prepares the module. Called on every load; may set handlers and spawn
    /// own threads.
    fn init(&self, module: &ModuleContext, host: &HostInterface) -> Result<(), ModuleError>;

    /// Releases whatever `init` acquired. Own threads are already stopped.
    fn finish(&self, module: &ModuleContext);
}

/// Optional per-connection hooks.
pub trait ThreadHooks: Send + Sync {
    fn thread_init(&self, module: &ModuleContext) -> Result<(), ModuleError>;
    fn thread_finish(&self, module: &ModuleContext);
}

/// Optional shutdown negotiation hook.
pub trait EventHook: Send + Sync {
    fn on_event(&self, module: &ModuleContext, kind: EventKind, ctx: &EventContext) -> EventReply;
}

/// Exports a [`Module`] implementation from a `cdylib`.
///
/// ```ignore
/// #[derive(Default)]
/// struct Tiles;
/// impl geod_host::Module for Tiles { /* ... */ }
/// geod_host::export_module!(Tiles);
/// // with optional hooks:
/// // geod_host::export_module!(Tiles, thread_hooks, event);
/// ```
///
/// The type must implement `Default`. One instance lives for as long as the
/// library stays loaded.
#[macro_export]
macro_rules! export_module {
    ($ty:ty $(, $hook:ident)* $(,)?) => {
        static __GEOD_MODULE: $crate::__private::Lazy<$ty> =
            $crate::__private::Lazy::new(<$ty as ::core::default::Default>::default);

        #[no_mangle]
        #[allow(improper_ctypes_definitions)]
        pub extern "C" fn geod_module_register(
            module: &$crate::ModuleContext,
            host: &$crate::HostInterface,
        ) -> ::std::os::raw::c_int {
            $crate::__private::guard(|| $crate::Module::register(&*__GEOD_MODULE, module, host))
        }

        #[no_mangle]
        #[allow(improper_ctypes_definitions)]
        pub extern "C" fn geod_module_init(
            module: &$crate::ModuleContext,
            host: &$crate::HostInterface,
        ) -> ::std::os::raw::c_int {
            $crate::__private::guard(|| $crate::Module::init(&*__GEOD_MODULE, module, host))
        }

        #[no_mangle]
        #[allow(improper_ctypes_definitions)]
        pub extern "C" fn geod_module_finish(module: &$crate::ModuleContext) {
            $crate::__private::guard_unit(|| $crate::Module::finish(&*__GEOD_MODULE, module))
        }

        $( $crate::export_module!(@$hook $ty); )*
    };
    (@thread_hooks $ty:ty) => {
        #[no_mangle]
        #[allow(improper_ctypes_definitions)]
        pub extern "C" fn geod_module_thread_init(
            module: &$crate::ModuleContext,
        ) -> ::std::os::raw::c_int {
            $crate::__private::guard(|| $crate::ThreadHooks::thread_init(&*__GEOD_MODULE, module))
        }

        #[no_mangle]
        #[allow(improper_ctypes_definitions)]
        pub extern "C" fn geod_module_thread_finish(
            module: &$crate::ModuleContext,
        ) -> ::std::os::raw::c_int {
            $crate::__private::guard_unit(|| $crate::ThreadHooks::thread_finish(&*__GEOD_MODULE, module));
            0
        }
    };
    (@event $ty:ty) => {
        #[no_mangle]
        #[allow(improper_ctypes_definitions)]
        pub extern "C" fn geod_module_event(
            module: &$crate::ModuleContext,
            kind: $crate::EventKind,
            ctx: &$crate::EventContext,
        ) -> ::std::os::raw::c_int {
            let mut reply = $crate::EventReply::Busy;
            $crate::__private::guard_unit(|| {
                reply = $crate::EventHook::on_event(&*__GEOD_MODULE, module, kind, ctx);
            });
            reply.status()
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mandatory_symbols_resolve_first() {
        let mandatory: Vec<_> = Symbol::ALL.iter().take_while(|s| s.is_mandatory()).collect();
        assert_eq!(mandatory.len(), 3);
        assert!(Symbol::ALL[3..].iter().all(|s| !s.is_mandatory()));
    }

    #[test]
    fn event_reply_status_mapping() {
        assert_eq!(EventReply::from_status(0), EventReply::Ready);
        assert_eq!(EventReply::from_status(1), EventReply::Busy);
        assert_eq!(EventReply::from_status(-1), EventReply::Busy);
        assert_eq!(EventReply::from_status(EventReply::Busy.status()), EventReply::Busy);
    }
}
