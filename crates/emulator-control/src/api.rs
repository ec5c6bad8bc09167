//! Host-facing request and result types for driving a session.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::{Arch, FaultKind, Mode, RegId};

/// Parameters of one [`Session::run`](crate::Session::run) call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct RunRequest {
    /// Address execution starts from.
    pub start: u64,
    /// Stop with [`StopReason::Completed`] when the PC reaches this address.
    pub end: Option<u64>,
    /// Wall-clock limit; [`Duration::ZERO`] means unbounded.
    pub timeout: Duration,
    /// Instruction limit; zero means unbounded.
    pub count: u64,
}

impl RunRequest {
    /// Unbounded run starting at `start`.
    #[must_use]
    pub const fn new(start: u64) -> Self {
        Self {
            start,
            end: None,
            timeout: Duration::ZERO,
            count: 0,
        }
    }

    /// Stops when the PC reaches `end`.
    #[must_use]
    pub const fn until(mut self, end: u64) -> Self {
        self.end = Some(end);
        self
    }

    /// Stops after `timeout` of wall-clock time.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Stops after `count` retired instructions.
    #[must_use]
    pub const fn with_count(mut self, count: u64) -> Self {
        self.count = count;
        self
    }
}

/// Why a run returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum StopReason {
    /// PC reached the requested end address, or the engine halted the guest.
    Completed,
    /// Wall-clock limit elapsed.
    Timeout,
    /// Instruction limit reached.
    InstructionLimit,
    /// [`StopHandle::stop`] was called.
    ExplicitStop,
    /// Run ended with an error of this class.
    Fault(FaultKind),
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => f.write_str("completed"),
            Self::Timeout => f.write_str("timeout"),
            Self::InstructionLimit => f.write_str("instruction limit"),
            Self::ExplicitStop => f.write_str("explicit stop"),
            Self::Fault(kind) => write!(f, "fault ({kind})"),
        }
    }
}

/// Thread-safe stop request flag shared with a session.
///
/// Clones refer to the same flag, so a handle may be moved to another thread
/// or captured by a hook and used to end the current run at the next
/// instruction boundary.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    requested: Arc<AtomicBool>,
}

impl StopHandle {
    /// Creates a flag with no stop requested.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests the current run to stop. Has no effect when nothing runs,
    /// since every run clears the flag on entry.
    pub fn stop(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    /// Returns `true` once [`StopHandle::stop`] was called during this run.
    #[must_use]
    pub fn is_stop_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    pub(crate) fn clear(&self) {
        self.requested.store(false, Ordering::SeqCst);
    }
}

/// Register snapshot taken by [`Session::save_context`](crate::Session::save_context).
///
/// Memory is not part of a context.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct Context {
    /// Architecture of the session the snapshot came from.
    pub arch: Arch,
    /// Mode of the session the snapshot came from.
    pub mode: Mode,
    /// Register values in id order.
    pub values: Vec<(RegId, u64)>,
}

impl Context {
    /// Saved value of `id`, if the layout has it.
    #[must_use]
    pub fn value(&self, id: RegId) -> Option<u64> {
        self.values
            .iter()
            .find(|(reg, _)| *reg == id)
            .map(|(_, value)| *value)
    }
}
