//! Guest memory map: mapped regions, permissions and access checks.

/// Permission sets and access kinds.
pub mod access;
/// Region table and byte-level reads/writes.
pub mod map;

pub use access::{AccessKind, Permissions};
pub use map::{MemoryMap, MemoryRegion, RegionId};
