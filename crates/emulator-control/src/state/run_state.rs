use std::fmt;

/// Lifecycle state of a [`Session`](crate::Session).
///
/// `Created -> Configured -> Running -> Stopped | Faulted -> Closed`. A stopped
/// session may run again; a faulted one stays inspectable until closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum SessionState {
    /// Opened, nothing configured yet.
    #[default]
    Created,
    /// Accepting memory, register and hook setup.
    Configured,
    /// Inside `run()`; reachable from hooks only.
    Running,
    /// Last run ended normally; registers hold the halt-point state.
    Stopped,
    /// Last run ended on an unrecoverable fault.
    Faulted,
    /// Resources released; every further operation fails.
    Closed,
}

impl SessionState {
    /// Returns `true` while memory, registers and hooks may still be touched.
    #[must_use]
    pub const fn is_open(self) -> bool {
        !matches!(self, Self::Closed)
    }

    /// Returns `true` when `run()` may be called from this state.
    #[must_use]
    pub const fn can_run(self) -> bool {
        matches!(self, Self::Configured | Self::Stopped)
    }

    /// Lowercase name used in diagnostics.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Configured => "configured",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Faulted => "faulted",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::SessionState;

    #[test]
    fn session_state_default_is_created() {
        assert_eq!(SessionState::default(), SessionState::Created);
    }

    #[test]
    fn only_configured_and_stopped_sessions_can_run() {
        assert!(!SessionState::Created.can_run());
        assert!(SessionState::Configured.can_run());
        assert!(!SessionState::Running.can_run());
        assert!(SessionState::Stopped.can_run());
        assert!(!SessionState::Faulted.can_run());
        assert!(!SessionState::Closed.can_run());
    }

    #[test]
    fn closed_is_the_only_terminal_state() {
        assert!(SessionState::Faulted.is_open());
        assert!(!SessionState::Closed.is_open());
    }
}
