//! The auxiliary terrain library shared by map-producing modules.
//!
//! It is loaded when the first module calls `map_start`, reference counted,
//! and unloaded by the housekeeper once nobody has used it for a while.

use crate::error::{HostError, LoadError};
use libloading::Library;
use parking_lot::Mutex;
use serde::Serialize;
use std::os::raw::c_int;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Terrain sample at one coordinate.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct TerrainInfo {
    pub elevation: f32,
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub precip: u8,
    pub temp: u8,
}

pub trait AuxLibrary: Send {
    fn terrain_at(&mut self, lat: f32, lon: f32) -> TerrainInfo;
}

pub trait AuxLoader: Send + Sync {
    fn open(&self) -> Result<Box<dyn AuxLibrary>, LoadError>;
}

/// Opens the terrain library from a shared object exporting `mapgen_init`,
/// `mapgen_finish` and `mapgen_get_terrain_info`.
#[derive(Debug, Clone)]
pub struct DylibAuxLoader {
    path: PathBuf,
}

impl DylibAuxLoader {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

type MapgenInit = unsafe extern "C" fn() -> c_int;
type MapgenFinish = unsafe extern "C" fn();
type MapgenTerrain = unsafe extern "C" fn(f32, f32) -> TerrainInfo;

struct DylibAux {
    finish: MapgenFinish,
    terrain: MapgenTerrain,
    _library: Library,
}

impl AuxLoader for DylibAuxLoader {
    fn open(&self) -> Result<Box<dyn AuxLibrary>, LoadError> {
        let name = self.path.display().to_string();
        let missing = |symbol: &'static str| LoadError::MissingSymbol {
            name: name.clone(),
            symbol,
        };

        unsafe {
            let library = Library::new(&self.path).map_err(|e| LoadError::Open {
                name: name.clone(),
                reason: e.to_string(),
            })?;
            let init: MapgenInit = *library
                .get::<MapgenInit>(b"mapgen_init")
                .map_err(|_| missing("mapgen_init"))?;
            let finish: MapgenFinish = *library
                .get::<MapgenFinish>(b"mapgen_finish")
                .map_err(|_| missing("mapgen_finish"))?;
            let terrain: MapgenTerrain = *library
                .get::<MapgenTerrain>(b"mapgen_get_terrain_info")
                .map_err(|_| missing("mapgen_get_terrain_info"))?;

            let code = init();
            if code < 0 {
                return Err(LoadError::InitFailed { name, code });
            }
            Ok(Box::new(DylibAux {
                finish,
                terrain,
                _library: library,
            }))
        }
    }
}

impl AuxLibrary for DylibAux {
    fn terrain_at(&mut self, lat: f32, lon: f32) -> TerrainInfo {
        unsafe { (self.terrain)(lat, lon) }
    }
}

impl Drop for DylibAux {
    fn drop(&mut self) {
        unsafe { (self.finish)() }
    }
}

struct AuxState {
    library: Option<Box<dyn AuxLibrary>>,
    users: u32,
    last_used: Instant,
}

pub struct AuxResource {
    loader: Option<Box<dyn AuxLoader>>,
    state: Mutex<AuxState>,
}

impl AuxResource {
    pub fn new(loader: Box<dyn AuxLoader>) -> Self {
        Self {
            loader: Some(loader),
            state: Mutex::new(AuxState {
                library: None,
                users: 0,
                last_used: Instant::now(),
            }),
        }
    }

    /// No auxiliary library configured; every `start` fails.
    pub fn disabled() -> Self {
        Self {
            loader: None,
            state: Mutex::new(AuxState {
                library: None,
                users: 0,
                last_used: Instant::now(),
            }),
        }
    }

    pub fn start(&self) -> Result<(), HostError> {
        let loader = self.loader.as_ref().ok_or(HostError::AuxUnavailable)?;
        let mut state = self.state.lock();
        if state.library.is_none() {
            state.library = Some(loader.open()?);
            info!("Auxiliary terrain library loaded");
        }
        state.users += 1;
        state.last_used = Instant::now();
        Ok(())
    }

    pub fn stop(&self) {
        let mut state = self.state.lock();
        if state.users == 0 {
            warn!("map_stop called without a matching map_start");
            return;
        }
        state.users -= 1;
        state.last_used = Instant::now();
    }

    /// Samples the terrain; `None` unless the library is loaded.
    pub fn terrain_at(&self, lat: f32, lon: f32) -> Option<TerrainInfo> {
        let mut state = self.state.lock();
        state.last_used = Instant::now();
        state.library.as_mut().map(|lib| lib.terrain_at(lat, lon))
    }

    pub fn is_loaded(&self) -> bool {
        self.state.lock().library.is_some()
    }

    pub fn users(&self) -> u32 {
        self.state.lock().users
    }

    /// Unloads the library if unused and idle longer than `idle_timeout`.
    pub fn evict_idle(&self, now: Instant, idle_timeout: Duration) -> bool {
        let mut state = self.state.lock();
        if state.library.is_none() || state.users > 0 {
            return false;
        }
        if now.saturating_duration_since(state.last_used) <= idle_timeout {
            return false;
        }
        state.library = None;
        debug!("Auxiliary terrain library unloaded after idling");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FlatTerrain;

    impl AuxLibrary for FlatTerrain {
        fn terrain_at(&mut self, lat: f32, _lon: f32) -> TerrainInfo {
            TerrainInfo {
                elevation: lat * 10.0,
                b: 255,
                ..TerrainInfo::default()
            }
        }
    }

    struct CountingLoader(Arc<AtomicUsize>);

    impl AuxLoader for CountingLoader {
        fn open(&self) -> Result<Box<dyn AuxLibrary>, LoadError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FlatTerrain))
        }
    }

    #[test]
    fn loads_once_and_evicts_when_idle() {
        let opens = Arc::new(AtomicUsize::new(0));
        let aux = AuxResource::new(Box::new(CountingLoader(opens.clone())));
        assert!(aux.terrain_at(1.0, 1.0).is_none());

        aux.start().unwrap();
        aux.start().unwrap();
        assert_eq!(opens.load(Ordering::SeqCst), 1);
        assert_eq!(aux.terrain_at(2.0, 0.0).map(|t| t.elevation), Some(20.0));

        let later = Instant::now() + Duration::from_secs(120);
        aux.stop();
        assert!(!aux.evict_idle(later, Duration::from_secs(60)), "still in use");
        aux.stop();
        assert!(!aux.evict_idle(Instant::now(), Duration::from_secs(60)), "not idle yet");
        assert!(aux.evict_idle(later, Duration::from_secs(60)));
        assert!(!aux.is_loaded());

        aux.start().unwrap();
        assert_eq!(opens.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unbalanced_stop_is_ignored() {
        let aux = AuxResource::new(Box::new(CountingLoader(Arc::new(AtomicUsize::new(0)))));
        aux.stop();
        assert_eq!(aux.users(), 0);
    }

    #[test]
    fn missing_library_file_fails_to_open() {
        let loader = DylibAuxLoader::new("/nonexistent/libmapgen.so");
        assert!(matches!(loader.open(), Err(LoadError::Open { .. })));
    }
}
