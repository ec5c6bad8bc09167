use std::fmt;

use thiserror::Error;

use crate::{AccessKind, Arch, HookHandle, Mode, RegId, SessionState};

/// Fault classes reported in [`StopReason::Fault`](crate::StopReason::Fault).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum FaultKind {
    /// Guest touched unmapped memory and no hook resolved it.
    Unmapped(AccessKind),
    /// Guest touched mapped memory without the needed permission.
    Protected(AccessKind),
    /// Engine could not decode or execute the instruction at PC.
    InvalidInstruction,
    /// A hook callback returned an error.
    Hook,
    /// Any other error raised by the engine while stepping.
    Engine,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unmapped(access) => write!(f, "unmapped {access}"),
            Self::Protected(access) => write!(f, "protected {access}"),
            Self::InvalidInstruction => f.write_str("invalid instruction"),
            Self::Hook => f.write_str("hook failure"),
            Self::Engine => f.write_str("engine error"),
        }
    }
}

/// Every failure surfaced by this crate.
///
/// Configuration errors come back from the call that caused them and leave the
/// session untouched. Errors raised while running end the run and move the
/// session to [`SessionState::Faulted`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Malformed size, range, permission or callback request.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// Host access touched an address outside every mapped region.
    #[error("memory not mapped at {0:#x}")]
    UnmappedMemory(u64),
    /// Host access needed a permission the covering region lacks.
    #[error("permission denied at {0:#x}")]
    PermissionDenied(u64),
    /// Register id is not part of the session's layout.
    #[error("unknown register {0}")]
    UnknownRegister(RegId),
    /// Hook handle is not (or no longer) registered.
    #[error("unknown hook handle {0}")]
    UnknownHandle(HookHandle),
    /// Operation is not legal in the current lifecycle state.
    #[error("cannot {operation} while session is {state}")]
    InvalidState {
        /// Lifecycle state at the time of the call.
        state: SessionState,
        /// Operation that was refused.
        operation: &'static str,
    },
    /// Engine does not support the requested architecture/mode pair.
    #[error("engine does not support {arch} with mode {mode:?}")]
    UnsupportedArch {
        /// Requested architecture.
        arch: Arch,
        /// Requested mode flags.
        mode: Mode,
    },
    /// Backing storage for a region could not be allocated.
    #[error("cannot allocate {size:#x} bytes of guest memory")]
    OutOfMemory {
        /// Requested region size.
        size: u64,
    },
    /// Guest access to unmapped memory that no hook resolved.
    #[error("unmapped {kind} of {size} bytes at {address:#x}")]
    UnmappedMemoryAccess {
        /// Kind of the faulting access.
        kind: AccessKind,
        /// First byte of the access.
        address: u64,
        /// Access size in bytes.
        size: usize,
    },
    /// Guest access to a mapped region lacking the needed permission.
    #[error("protected {kind} of {size} bytes at {address:#x}")]
    ProtectedMemoryAccess {
        /// Kind of the faulting access.
        kind: AccessKind,
        /// First byte of the access.
        address: u64,
        /// Access size in bytes.
        size: usize,
    },
    /// Engine could not decode or execute the instruction at `address`.
    #[error("invalid instruction at {address:#x}")]
    InvalidInstruction {
        /// Program counter of the rejected instruction.
        address: u64,
    },
    /// A hook callback failed; the run was aborted.
    #[error("hook {handle} failed: {source}")]
    Hook {
        /// Handle of the failing hook.
        handle: HookHandle,
        /// Error returned by the callback.
        source: Box<Error>,
    },
}

impl Error {
    /// Fault class this error is reported as when it ends a run.
    #[must_use]
    pub const fn fault_kind(&self) -> FaultKind {
        match self {
            Self::UnmappedMemoryAccess { kind, .. } => FaultKind::Unmapped(*kind),
            Self::ProtectedMemoryAccess { kind, .. } => FaultKind::Protected(*kind),
            Self::InvalidInstruction { .. } => FaultKind::InvalidInstruction,
            Self::Hook { .. } => FaultKind::Hook,
            Self::InvalidArgument(_)
            | Self::UnmappedMemory(_)
            | Self::PermissionDenied(_)
            | Self::UnknownRegister(_)
            | Self::UnknownHandle(_)
            | Self::InvalidState { .. }
            | Self::UnsupportedArch { .. }
            | Self::OutOfMemory { .. } => FaultKind::Engine,
        }
    }

    /// Unwraps nested hook failures down to the original cause.
    #[must_use]
    pub fn root_cause(&self) -> &Self {
        match self {
            Self::Hook { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Error, FaultKind};
    use crate::{AccessKind, HookHandle, RegId, SessionState};

    #[test]
    fn guest_faults_map_to_their_fault_kind() {
        let unmapped = Error::UnmappedMemoryAccess {
            kind: AccessKind::Write,
            address: 0xAAAA_AAAA,
            size: 4,
        };
        assert_eq!(unmapped.fault_kind(), FaultKind::Unmapped(AccessKind::Write));
        assert_eq!(
            Error::InvalidInstruction { address: 0 }.fault_kind(),
            FaultKind::InvalidInstruction
        );
        assert_eq!(
            Error::UnknownRegister(RegId(3)).fault_kind(),
            FaultKind::Engine
        );
    }

    #[test]
    fn hook_errors_keep_their_cause() {
        let nested = Error::Hook {
            handle: HookHandle(2),
            source: Box::new(Error::Hook {
                handle: HookHandle(1),
                source: Box::new(Error::UnknownRegister(RegId(7))),
            }),
        };
        assert_eq!(nested.fault_kind(), FaultKind::Hook);
        assert_eq!(nested.root_cause(), &Error::UnknownRegister(RegId(7)));
        assert_eq!(
            std::error::Error::source(&nested).map(ToString::to_string),
            Some("hook hook#1 failed: unknown register reg#7".to_string())
        );
    }

    #[test]
    fn messages_name_the_offending_address_and_state() {
        let unmapped = Error::UnmappedMemoryAccess {
            kind: AccessKind::Fetch,
            address: 0x1000,
            size: 1,
        };
        assert_eq!(unmapped.to_string(), "unmapped fetch of 1 bytes at 0x1000");
        let state = Error::InvalidState {
            state: SessionState::Closed,
            operation: "run",
        };
        assert_eq!(state.to_string(), "cannot run while session is closed");
    }

    #[test]
    fn fault_kinds_render_in_words() {
        assert_eq!(
            FaultKind::Unmapped(AccessKind::Write).to_string(),
            "unmapped write"
        );
        assert_eq!(
            FaultKind::Protected(AccessKind::Fetch).to_string(),
            "protected fetch"
        );
        assert_eq!(FaultKind::InvalidInstruction.to_string(), "invalid instruction");
        assert_eq!(FaultKind::Hook.to_string(), "hook failure");
    }
}
