//! Session, memory-map, register and hook-dispatch layer for pluggable CPU
//! emulation engines.

/// Major version of the control API.
pub const VERSION_MAJOR: u32 = 1;
/// Minor version of the control API.
pub const VERSION_MINOR: u32 = 0;

/// Guest architecture tags and mode flags.
pub mod arch;
pub use arch::{Arch, Mode};

/// Guest memory regions, permissions and access checks.
pub mod memory;
pub use memory::{AccessKind, MemoryMap, MemoryRegion, Permissions, RegionId};

/// Register bank and session lifecycle state.
pub mod state;
pub use state::{RegId, RegisterBank, RegisterLayout, RegisterSpec, SessionState};

/// Error taxonomy and fault classes.
pub mod fault;
pub use fault::{Error, FaultKind};

/// Run requests, stop reasons, stop handles and register contexts.
pub mod api;
pub use api::{Context, RunRequest, StopHandle, StopReason};

/// Hook events, callbacks, registry and dispatcher.
pub mod hooks;
pub use hooks::{
    AddressRange, DispatchResult, Event, EventKind, HookCallback, HookHandle, HookRegistry,
    HookResult, InsnId, MemoryAccess,
};

/// Session view handed to hooks.
pub mod machine;
pub use machine::Machine;

/// Stepping-engine contract and the engine-facing access path.
pub mod engine;
pub use engine::{Cpu, StepOutcome, SteppingEngine};

/// Emulation session lifecycle and run loop.
pub mod session;
pub use session::Session;

#[cfg(test)]
use proptest as _;
#[cfg(test)]
use rstest as _;
