//! Hook events, typed callbacks, the hook registry and the dispatcher.
//!
//! Each [`EventKind`] has one payload shape and accepts one callback shape:
//!
//! | kind | callback | result |
//! |------|----------|--------|
//! | `BlockEnter`, `InstructionEnter` | [`HookCallback::Code`] | `()` |
//! | `MemoryRead`, `MemoryWrite` | [`HookCallback::MemoryAccess`] | `()` |
//! | `Memory*Unmapped` | [`HookCallback::MemoryFault`] | `bool` resolved |
//! | `PortIn` | [`HookCallback::PortIn`] | value for the guest |
//! | `PortOut` | [`HookCallback::PortOut`] | `()` |
//! | `Interrupt` | [`HookCallback::Interrupt`] | `()` |

use std::cell::RefCell;
use std::fmt;
use std::ops::RangeInclusive;
use std::rc::Rc;

use crate::{AccessKind, Error, Machine};

/// Dispatch of events to matching callbacks.
pub mod dispatch;
/// Registration table of hooks.
pub mod registry;

pub use dispatch::DispatchResult;
pub use registry::{HookEntry, HookRegistry};

/// Opaque handle identifying one registered hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HookHandle(pub u64);

impl fmt::Display for HookHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hook#{}", self.0)
    }
}

/// Engine-defined instruction identifier used to filter `InstructionEnter`
/// hooks (for example the id of `syscall` or `in`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InsnId(pub u32);

/// Inclusive address filter. A range whose `begin` is greater than its `end`
/// matches every address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressRange {
    /// First matching address.
    pub begin: u64,
    /// Last matching address.
    pub end: u64,
}

impl AddressRange {
    /// Matches every address.
    pub const ALL: Self = Self { begin: 1, end: 0 };

    /// Creates a filter for `[begin, end]`.
    #[must_use]
    pub const fn new(begin: u64, end: u64) -> Self {
        Self { begin, end }
    }

    /// Filter for a single address.
    #[must_use]
    pub const fn at(address: u64) -> Self {
        Self::new(address, address)
    }

    /// Returns `true` for the match-all sentinel.
    #[must_use]
    pub const fn is_all(&self) -> bool {
        self.begin > self.end
    }

    /// Returns `true` when `address` passes the filter.
    #[must_use]
    pub const fn matches(&self, address: u64) -> bool {
        self.is_all() || (self.begin <= address && address <= self.end)
    }
}

impl Default for AddressRange {
    fn default() -> Self {
        Self::ALL
    }
}

impl From<RangeInclusive<u64>> for AddressRange {
    fn from(range: RangeInclusive<u64>) -> Self {
        Self::new(*range.start(), *range.end())
    }
}

/// Closed set of events a hook can be registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum EventKind {
    /// A new basic block is about to execute.
    BlockEnter,
    /// An instruction is about to execute.
    InstructionEnter,
    /// Guest data read from mapped memory.
    MemoryRead,
    /// Guest data write to mapped memory.
    MemoryWrite,
    /// Guest data read from unmapped memory.
    MemoryReadUnmapped,
    /// Guest data write to unmapped memory.
    MemoryWriteUnmapped,
    /// Instruction fetch from unmapped memory.
    MemoryFetchUnmapped,
    /// Port input instruction.
    PortIn,
    /// Port output instruction.
    PortOut,
    /// Interrupt or exception raised by the guest.
    Interrupt,
}

impl EventKind {
    /// Kind of the unmapped-access event raised for `access`.
    #[must_use]
    pub const fn unmapped(access: AccessKind) -> Self {
        match access {
            AccessKind::Read => Self::MemoryReadUnmapped,
            AccessKind::Write => Self::MemoryWriteUnmapped,
            AccessKind::Fetch => Self::MemoryFetchUnmapped,
        }
    }
}

/// One emulation-time event with its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    /// Entering the block at `address` of `size` bytes.
    BlockEnter {
        /// First address of the block.
        address: u64,
        /// Block length in bytes, when the engine knows it.
        size: u32,
    },
    /// About to execute the instruction at `address`.
    InstructionEnter {
        /// Address of the instruction.
        address: u64,
        /// Encoded length in bytes.
        size: u32,
        /// Engine instruction id, used by filtered hooks.
        insn: Option<InsnId>,
    },
    /// Guest read of `size` bytes at `address`.
    MemoryRead {
        /// First byte read.
        address: u64,
        /// Read size in bytes.
        size: usize,
    },
    /// Guest write of `value` (`size` bytes) at `address`.
    MemoryWrite {
        /// First byte written.
        address: u64,
        /// Write size in bytes.
        size: usize,
        /// Written value, decoded with the session byte order.
        value: u64,
    },
    /// Guest access to unmapped memory.
    MemoryUnmapped {
        /// Kind of the failing access.
        access: AccessKind,
        /// First byte of the access.
        address: u64,
        /// Access size in bytes.
        size: usize,
        /// Value being written; zero for reads and fetches.
        value: u64,
    },
    /// Guest reads `size` bytes from `port`.
    PortIn {
        /// Address of the port instruction.
        address: u64,
        /// Port number.
        port: u32,
        /// Access size in bytes.
        size: u8,
    },
    /// Guest writes `value` (`size` bytes) to `port`.
    PortOut {
        /// Address of the port instruction.
        address: u64,
        /// Port number.
        port: u32,
        /// Access size in bytes.
        size: u8,
        /// Written value.
        value: u64,
    },
    /// Guest raised interrupt `number`.
    Interrupt {
        /// PC when the interrupt was raised.
        address: u64,
        /// Interrupt or exception number.
        number: u32,
    },
}

impl Event {
    /// Kind used to select hooks for this event.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::BlockEnter { .. } => EventKind::BlockEnter,
            Self::InstructionEnter { .. } => EventKind::InstructionEnter,
            Self::MemoryRead { .. } => EventKind::MemoryRead,
            Self::MemoryWrite { .. } => EventKind::MemoryWrite,
            Self::MemoryUnmapped { access, .. } => EventKind::unmapped(*access),
            Self::PortIn { .. } => EventKind::PortIn,
            Self::PortOut { .. } => EventKind::PortOut,
            Self::Interrupt { .. } => EventKind::Interrupt,
        }
    }

    /// Address matched against each hook's [`AddressRange`]: the accessed
    /// address for memory events, the instruction address otherwise.
    #[must_use]
    pub const fn match_key(&self) -> u64 {
        match *self {
            Self::BlockEnter { address, .. }
            | Self::InstructionEnter { address, .. }
            | Self::MemoryRead { address, .. }
            | Self::MemoryWrite { address, .. }
            | Self::MemoryUnmapped { address, .. }
            | Self::PortIn { address, .. }
            | Self::PortOut { address, .. }
            | Self::Interrupt { address, .. } => address,
        }
    }

    /// Instruction id carried by `InstructionEnter`.
    #[must_use]
    pub const fn insn(&self) -> Option<InsnId> {
        match *self {
            Self::InstructionEnter { insn, .. } => insn,
            _ => None,
        }
    }
}

/// Payload handed to memory access and memory fault callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryAccess {
    /// Kind of access.
    pub kind: AccessKind,
    /// First byte of the access.
    pub address: u64,
    /// Access size in bytes.
    pub size: usize,
    /// Written value for writes; zero otherwise.
    pub value: u64,
}

/// Result type returned by every hook callback.
pub type HookResult<T = ()> = Result<T, Error>;

/// Callback shape for block and instruction events: `(machine, address, size)`.
pub type CodeHookFn = dyn FnMut(&mut Machine<'_>, u64, u32) -> HookResult;
/// Callback shape for traced memory reads and writes.
pub type MemoryAccessHookFn = dyn FnMut(&mut Machine<'_>, MemoryAccess) -> HookResult;
/// Callback shape for unmapped accesses; `Ok(true)` means the access is now
/// resolved and should be retried.
pub type MemoryFaultHookFn = dyn FnMut(&mut Machine<'_>, MemoryAccess) -> HookResult<bool>;
/// Callback shape for port input: `(machine, port, size)` returning the value.
pub type PortInHookFn = dyn FnMut(&mut Machine<'_>, u32, u8) -> HookResult<u64>;
/// Callback shape for port output: `(machine, port, size, value)`.
pub type PortOutHookFn = dyn FnMut(&mut Machine<'_>, u32, u8, u64) -> HookResult;
/// Callback shape for interrupts: `(machine, number)`.
pub type InterruptHookFn = dyn FnMut(&mut Machine<'_>, u32) -> HookResult;

/// A registered callback, tagged by shape.
///
/// Callbacks are reference counted so a dispatch already in flight keeps
/// every matched callback alive even if a hook unregisters it.
#[derive(Clone)]
pub enum HookCallback {
    /// Block or instruction trace.
    Code(Rc<RefCell<CodeHookFn>>),
    /// Memory read or write trace.
    MemoryAccess(Rc<RefCell<MemoryAccessHookFn>>),
    /// Unmapped memory resolution.
    MemoryFault(Rc<RefCell<MemoryFaultHookFn>>),
    /// Port input responder.
    PortIn(Rc<RefCell<PortInHookFn>>),
    /// Port output trace.
    PortOut(Rc<RefCell<PortOutHookFn>>),
    /// Interrupt trace.
    Interrupt(Rc<RefCell<InterruptHookFn>>),
}

impl HookCallback {
    /// Wraps a block or instruction callback.
    pub fn code<F>(f: F) -> Self
    where
        F: FnMut(&mut Machine<'_>, u64, u32) -> HookResult + 'static,
    {
        Self::Code(Rc::new(RefCell::new(f)))
    }

    /// Wraps a memory read/write callback.
    pub fn memory_access<F>(f: F) -> Self
    where
        F: FnMut(&mut Machine<'_>, MemoryAccess) -> HookResult + 'static,
    {
        Self::MemoryAccess(Rc::new(RefCell::new(f)))
    }

    /// Wraps an unmapped-access callback.
    pub fn memory_fault<F>(f: F) -> Self
    where
        F: FnMut(&mut Machine<'_>, MemoryAccess) -> HookResult<bool> + 'static,
    {
        Self::MemoryFault(Rc::new(RefCell::new(f)))
    }

    /// Wraps a port input callback.
    pub fn port_in<F>(f: F) -> Self
    where
        F: FnMut(&mut Machine<'_>, u32, u8) -> HookResult<u64> + 'static,
    {
        Self::PortIn(Rc::new(RefCell::new(f)))
    }

    /// Wraps a port output callback.
    pub fn port_out<F>(f: F) -> Self
    where
        F: FnMut(&mut Machine<'_>, u32, u8, u64) -> HookResult + 'static,
    {
        Self::PortOut(Rc::new(RefCell::new(f)))
    }

    /// Wraps an interrupt callback.
    pub fn interrupt<F>(f: F) -> Self
    where
        F: FnMut(&mut Machine<'_>, u32) -> HookResult + 'static,
    {
        Self::Interrupt(Rc::new(RefCell::new(f)))
    }

    /// Returns `true` when this callback shape serves `kind`.
    #[must_use]
    pub const fn accepts(&self, kind: EventKind) -> bool {
        matches!(
            (self, kind),
            (
                Self::Code(_),
                EventKind::BlockEnter | EventKind::InstructionEnter
            ) | (
                Self::MemoryAccess(_),
                EventKind::MemoryRead | EventKind::MemoryWrite
            ) | (
                Self::MemoryFault(_),
                EventKind::MemoryReadUnmapped
                    | EventKind::MemoryWriteUnmapped
                    | EventKind::MemoryFetchUnmapped
            ) | (Self::PortIn(_), EventKind::PortIn)
                | (Self::PortOut(_), EventKind::PortOut)
                | (Self::Interrupt(_), EventKind::Interrupt)
        )
    }

    const fn shape(&self) -> &'static str {
        match self {
            Self::Code(_) => "code",
            Self::MemoryAccess(_) => "memory-access",
            Self::MemoryFault(_) => "memory-fault",
            Self::PortIn(_) => "port-in",
            Self::PortOut(_) => "port-out",
            Self::Interrupt(_) => "interrupt",
        }
    }
}

impl fmt::Debug for HookCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HookCallback::{}", self.shape())
    }
}
