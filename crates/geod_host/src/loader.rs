//! Where module code comes from.
//!
//! [`DylibLoader`] opens shared libraries from a directory. [`StaticLoader`]
//! serves modules linked into the process, which is how the daemon's tests
//! and embedded builds provide modules.

use crate::abi::{
    Capability, EventContext, EventHook, EventKind, Module, Symbol, ThreadHooks, STATUS_OK,
};
use crate::context::ModuleContext;
use crate::error::LoadError;
use crate::host::HostInterface;
use libloading::Library;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::os::raw::c_int;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, warn};

/// A source of module libraries.
pub trait ModuleLoader: Send + Sync {
    /// Names of every module currently available, in a stable order.
    fn discover(&self) -> io::Result<Vec<String>>;

    /// Modification time of the module's file.
    fn modified(&self, name: &str) -> io::Result<SystemTime>;

    /// Opens the module. The handle stays valid until dropped.
    fn open(&self, name: &str) -> Result<Box<dyn LibraryHandle>, LoadError>;
}

/// An opened module library.
pub trait LibraryHandle: Send + Sync {
    fn resolve(&self, symbol: Symbol) -> Option<Capability>;
}

// ============================================================================
// Shared libraries
// ============================================================================

/// Loads `*.so` / `*.dylib` / `*.dll` files from one directory.
#[derive(Debug, Clone)]
pub struct DylibLoader {
    directory: PathBuf,
}

impl DylibLoader {
    pub fn new(directory: impl AsRef<Path>) -> Self {
        Self {
            directory: directory.as_ref().to_path_buf(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn is_library(path: &Path) -> bool {
        matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("so" | "dylib" | "dll")
        )
    }
}

impl ModuleLoader for DylibLoader {
    fn discover(&self) -> io::Result<Vec<String>> {
        if !self.directory.exists() {
            warn!(
                "Module directory does not exist: {}",
                self.directory.display()
            );
            return Ok(Vec::new());
        }

        let mut names = Vec::new();
        for entry in fs::read_dir(&self.directory)? {
            let path = entry?.path();
            if path.is_file() && Self::is_library(&path) {
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        debug!(
            "Discovered {} module file(s) in {}",
            names.len(),
            self.directory.display()
        );
        Ok(names)
    }

    fn modified(&self, name: &str) -> io::Result<SystemTime> {
        fs::metadata(self.directory.join(name))?.modified()
    }

    fn open(&self, name: &str) -> Result<Box<dyn LibraryHandle>, LoadError> {
        let path = self.directory.join(name);
        let library = unsafe {
            Library::new(&path).map_err(|e| LoadError::Open {
                name: name.to_string(),
                reason: e.to_string(),
            })?
        };
        Ok(Box::new(DylibHandle { library }))
    }
}

type RawEntry = unsafe extern "C" fn(&ModuleContext, &HostInterface) -> c_int;
type RawFinish = unsafe extern "C" fn(&ModuleContext);
type RawThreadHook = unsafe extern "C" fn(&ModuleContext) -> c_int;
type RawEvent = unsafe extern "C" fn(&ModuleContext, EventKind, &EventContext) -> c_int;

struct DylibHandle {
    library: Library,
}

impl DylibHandle {
    /// Copies a function pointer out of the library. The pointer is only valid
    /// while the library stays open; the lifecycle guarantees no capability
    /// outlives its handle.
    fn function<T: Copy>(&self, symbol: Symbol) -> Option<T> {
        unsafe {
            self.library
                .get::<T>(symbol.export_name().as_bytes())
                .ok()
                .map(|s| *s)
        }
    }
}

impl LibraryHandle for DylibHandle {
    fn resolve(&self, symbol: Symbol) -> Option<Capability> {
        match symbol {
            Symbol::Register => self.function::<RawEntry>(symbol).map(|f| {
                Capability::Register(Arc::new(move |m: &ModuleContext, h: &HostInterface| unsafe {
                    f(m, h)
                }))
            }),
            Symbol::Init => self.function::<RawEntry>(symbol).map(|f| {
                Capability::Init(Arc::new(move |m: &ModuleContext, h: &HostInterface| unsafe {
                    f(m, h)
                }))
            }),
            Symbol::Finish => self.function::<RawFinish>(symbol).map(|f| {
                Capability::Finish(Arc::new(move |m: &ModuleContext| unsafe { f(m) }))
            }),
            Symbol::ThreadInit => self.function::<RawThreadHook>(symbol).map(|f| {
                Capability::ThreadInit(Arc::new(move |m: &ModuleContext| unsafe { f(m) }))
            }),
            Symbol::ThreadFinish => self.function::<RawThreadHook>(symbol).map(|f| {
                Capability::ThreadFinish(Arc::new(move |m: &ModuleContext| unsafe { f(m) }))
            }),
            Symbol::Event => self.function::<RawEvent>(symbol).map(|f| {
                Capability::Event(Arc::new(
                    move |m: &ModuleContext, k: EventKind, c: &EventContext| unsafe { f(m, k, c) },
                ))
            }),
        }
    }
}

// ============================================================================
// In-process modules
// ============================================================================

/// A fixed symbol table standing in for an opened library.
#[derive(Clone, Default)]
pub struct SymbolTable {
    symbols: HashMap<Symbol, Capability>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, capability: Capability) -> Self {
        self.symbols.insert(capability.symbol(), capability);
        self
    }

    pub fn without(mut self, symbol: Symbol) -> Self {
        self.symbols.remove(&symbol);
        self
    }

    /// Mandatory entry points backed by a [`Module`].
    pub fn from_module<M: Module + 'static>(module: Arc<M>) -> Self {
        let register = module.clone();
        let init = module.clone();
        let finish = module;
        Self::new()
            .with(Capability::Register(Arc::new(
                move |m: &ModuleContext, h: &HostInterface| status(register.register(m, h)),
            )))
            .with(Capability::Init(Arc::new(
                move |m: &ModuleContext, h: &HostInterface| status(init.init(m, h)),
            )))
            .with(Capability::Finish(Arc::new(move |m: &ModuleContext| {
                finish.finish(m)
            })))
    }

    pub fn with_thread_hooks<H: ThreadHooks + 'static>(self, hooks: Arc<H>) -> Self {
        let finish = hooks.clone();
        self.with(Capability::ThreadInit(Arc::new(move |m: &ModuleContext| {
            status(hooks.thread_init(m))
        })))
        .with(Capability::ThreadFinish(Arc::new(move |m: &ModuleContext| {
            finish.thread_finish(m);
            STATUS_OK
        })))
    }

    pub fn with_event_hook<E: EventHook + 'static>(self, hook: Arc<E>) -> Self {
        self.with(Capability::Event(Arc::new(
            move |m: &ModuleContext, kind: EventKind, ctx: &EventContext| {
                hook.on_event(m, kind, ctx).status()
            },
        )))
    }
}

fn status(result: Result<(), crate::abi::ModuleError>) -> c_int {
    match result {
        Ok(()) => STATUS_OK,
        Err(e) => {
            warn!("module entry point failed: {}", e);
            crate::abi::STATUS_FAILED
        }
    }
}

impl LibraryHandle for SymbolTable {
    fn resolve(&self, symbol: Symbol) -> Option<Capability> {
        self.symbols.get(&symbol).cloned()
    }
}

type Factory = Arc<dyn Fn() -> SymbolTable + Send + Sync>;

struct StaticEntry {
    name: String,
    factory: Factory,
    modified: SystemTime,
}

/// Serves modules built into the process. Every `open` calls the module's
/// factory, so module state starts fresh after an unload.
#[derive(Default)]
pub struct StaticLoader {
    entries: RwLock<Vec<StaticEntry>>,
}

impl StaticLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a module. Replacing counts as a file change.
    pub fn insert<F>(&self, name: &str, factory: F)
    where
        F: Fn() -> SymbolTable + Send + Sync + 'static,
    {
        let mut entries = self.entries.write();
        let factory: Factory = Arc::new(factory);
        match entries.iter_mut().find(|e| e.name == name) {
            Some(entry) => {
                entry.factory = factory;
                entry.modified = SystemTime::now();
            }
            None => entries.push(StaticEntry {
                name: name.to_string(),
                factory,
                modified: SystemTime::now(),
            }),
        }
    }

    /// Builder form of [`insert`](Self::insert).
    pub fn with_module<F>(self, name: &str, factory: F) -> Self
    where
        F: Fn() -> SymbolTable + Send + Sync + 'static,
    {
        self.insert(name, factory);
        self
    }

    pub fn remove(&self, name: &str) {
        self.entries.write().retain(|e| e.name != name);
    }
}

impl ModuleLoader for StaticLoader {
    fn discover(&self) -> io::Result<Vec<String>> {
        Ok(self.entries.read().iter().map(|e| e.name.clone()).collect())
    }

    fn modified(&self, name: &str) -> io::Result<SystemTime> {
        self.entries
            .read()
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.modified)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, name.to_string()))
    }

    fn open(&self, name: &str) -> Result<Box<dyn LibraryHandle>, LoadError> {
        let factory = self
            .entries
            .read()
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.factory.clone())
            .ok_or_else(|| LoadError::Open {
                name: name.to_string(),
                reason: "no such built-in module".to_string(),
            })?;
        Ok(Box::new(factory()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;

    #[test]
    fn dylib_discovery_filters_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["tiles.so", "stats.dylib", "win.dll", "notes.txt", "README"] {
            File::create(dir.path().join(name)).unwrap();
        }
        fs::create_dir(dir.path().join("nested.so")).unwrap();

        let loader = DylibLoader::new(dir.path());
        assert_eq!(
            loader.discover().unwrap(),
            vec!["stats.dylib", "tiles.so", "win.dll"]
        );
        assert!(loader.modified("tiles.so").is_ok());
        assert!(loader.modified("absent.so").is_err());
    }

    #[test]
    fn dylib_discovery_tolerates_missing_directory() {
        let loader = DylibLoader::new("/nonexistent/geod/modules");
        assert!(loader.discover().unwrap().is_empty());
    }

    #[test]
    fn opening_a_non_library_fails() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("broken.so"), b"not an elf").unwrap();
        let loader = DylibLoader::new(dir.path());
        assert!(matches!(loader.open("broken.so"), Err(LoadError::Open { .. })));
    }

    #[test]
    fn static_loader_replacement_updates_mtime() {
        let loader = StaticLoader::new().with_module("a", SymbolTable::new);
        let first = loader.modified("a").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        loader.insert("a", SymbolTable::new);
        assert!(loader.modified("a").unwrap() > first);
        assert_eq!(loader.discover().unwrap(), vec!["a"]);

        loader.remove("a");
        assert!(loader.discover().unwrap().is_empty());
        assert!(loader.open("a").is_err());
    }

    #[test]
    fn symbol_table_without_drops_a_capability() {
        let table = SymbolTable::new()
            .with(Capability::Finish(Arc::new(|_: &ModuleContext| {})))
            .without(Symbol::Finish);
        assert!(table.resolve(Symbol::Finish).is_none());
    }
}
