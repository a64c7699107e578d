use serde::Serialize;
use std::fmt;

/// Lifecycle state of a module slot.
///
/// The declaration order matters: every state below `Initialized` means
/// "not usable yet, load on demand".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModuleState {
    None,
    Unloaded,
    Loading,
    Loaded,
    Initialized,
    Running,
    ShuttingDown,
    Disabled,
}

impl ModuleState {
    pub fn label(self) -> &'static str {
        match self {
            ModuleState::None => "NONE",
            ModuleState::Unloaded => "UNLOADED",
            ModuleState::Loading => "LOADING",
            ModuleState::Loaded => "LOADED",
            ModuleState::Initialized => "INITIALIZED",
            ModuleState::Running => "RUNNING",
            ModuleState::ShuttingDown => "SHUTTING_DOWN",
            ModuleState::Disabled => "DISABLED",
        }
    }

    /// True when the library is open and its capabilities resolved.
    pub fn is_resident(self) -> bool {
        matches!(
            self,
            ModuleState::Loaded | ModuleState::Initialized | ModuleState::Running
        )
    }

    /// True when a `start` must load the library first.
    pub fn needs_load(self) -> bool {
        self < ModuleState::Initialized || self == ModuleState::Disabled
    }

    pub fn can_transition_to(self, next: ModuleState) -> bool {
        use ModuleState::*;
        match (self, next) {
            (None | Unloaded | Disabled, Loading) => true,
            (Loading | Loaded, Disabled) => true,
            // Registration runs after init.
            (Initialized, Disabled) => true,
            // A vanished file is noticed before the open.
            (None | Unloaded | Disabled, Disabled) => true,
            (Loading, Loaded) => true,
            (Loaded, Initialized) => true,
            (Initialized, Running) => true,
            (Running, Initialized) => true,
            (Initialized | Running, ShuttingDown) => true,
            (ShuttingDown, Unloaded) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::ModuleState::*;

    #[test]
    fn load_path_is_legal() {
        for (from, to) in [
            (None, Loading),
            (Loading, Loaded),
            (Loaded, Initialized),
            (Initialized, Running),
            (Running, Initialized),
            (Running, ShuttingDown),
            (ShuttingDown, Unloaded),
            (Unloaded, Loading),
            (Disabled, Loading),
            (Loaded, Disabled),
            (Initialized, Disabled),
        ] {
            assert!(from.can_transition_to(to), "{} -> {}", from, to);
        }
    }

    #[test]
    fn shortcuts_are_rejected() {
        for (from, to) in [
            (None, Running),
            (Unloaded, Initialized),
            (ShuttingDown, Running),
            (Disabled, Running),
            (Running, Unloaded),
            (Initialized, Loading),
            (Running, Disabled),
        ] {
            assert!(!from.can_transition_to(to), "{} -> {}", from, to);
        }
    }

    #[test]
    fn needs_load_covers_unusable_states() {
        assert!(None.needs_load());
        assert!(Unloaded.needs_load());
        assert!(Disabled.needs_load());
        assert!(!Initialized.needs_load());
        assert!(!Running.needs_load());
        assert!(!ShuttingDown.needs_load());
    }
}
