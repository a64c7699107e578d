use crate::context::ModuleId;
use thiserror::Error;

/// Reasons a module failed to load. Any of these leaves the module DISABLED.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("module file for {name} is not accessible: {reason}")]
    MissingFile { name: String, reason: String },
    #[error("failed to open module library {name}: {reason}")]
    Open { name: String, reason: String },
    #[error("module {name} does not export mandatory symbol {symbol}")]
    MissingSymbol { name: String, symbol: &'static str },
    #[error("module {name} init returned {code}")]
    InitFailed { name: String, code: i32 },
    #[error("module {name} register returned {code}")]
    RegisterFailed { name: String, code: i32 },
}

#[derive(Error, Debug)]
pub enum HostError {
    #[error("timed out after {timeout_ms}ms waiting for the {what} lock")]
    LockTimeout { what: &'static str, timeout_ms: u64 },
    #[error("module {module} is temporarily unavailable")]
    Unavailable { module: String },
    #[error("module {module} is disabled")]
    Disabled { module: String },
    #[error("module {module} is disabled and its file has not changed")]
    Unchanged { module: String },
    #[error("unknown module id {0}")]
    UnknownModule(ModuleId),
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error("thread init failed for module {module}")]
    ThreadInit { module: String },
    #[error("module {module} already owns {limit} threads")]
    ThreadLimit { module: String, limit: usize },
    #[error("auxiliary library is not configured")]
    AuxUnavailable,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HostError {
    /// Transient errors mean "try again later"; the caller should not treat
    /// the module as broken.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            HostError::LockTimeout { .. } | HostError::Unavailable { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(HostError::LockTimeout { what: "module table", timeout_ms: 20 }.is_transient());
        assert!(HostError::Unavailable { module: "x".into() }.is_transient());
        assert!(!HostError::Disabled { module: "x".into() }.is_transient());
        assert!(!HostError::Load(LoadError::MissingSymbol {
            name: "x".into(),
            symbol: "geod_module_init",
        })
        .is_transient());
    }

    #[test]
    fn messages_name_the_module() {
        let err = HostError::from(LoadError::InitFailed { name: "tiles".into(), code: -2 });
        assert_eq!(err.to_string(), "module tiles init returned -2");
    }
}
