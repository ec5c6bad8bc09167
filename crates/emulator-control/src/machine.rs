//! Mutable view of a session handed to hook callbacks and engines.

use crate::hooks::{AddressRange, EventKind, HookCallback, HookHandle, HookRegistry, InsnId};
use crate::{
    Arch, Error, MemoryMap, MemoryRegion, Mode, Permissions, RegId, RegionId, RegisterBank,
    StopHandle,
};

/// Session state reachable from inside a run.
///
/// Callbacks receive a `Machine` for the duration of one invocation. Through it
/// they can inspect and change memory, registers and the hook table, and
/// request a stop. Changes are visible to the engine as soon as the callback
/// returns.
pub struct Machine<'a> {
    memory: &'a mut MemoryMap,
    registers: &'a mut RegisterBank,
    hooks: &'a mut HookRegistry,
    stop: &'a StopHandle,
    arch: Arch,
    mode: Mode,
}

impl<'a> Machine<'a> {
    pub(crate) fn new(
        memory: &'a mut MemoryMap,
        registers: &'a mut RegisterBank,
        hooks: &'a mut HookRegistry,
        stop: &'a StopHandle,
        arch: Arch,
        mode: Mode,
    ) -> Self {
        Self {
            memory,
            registers,
            hooks,
            stop,
            arch,
            mode,
        }
    }

    /// Guest architecture.
    #[must_use]
    pub const fn arch(&self) -> Arch {
        self.arch
    }

    /// Guest mode flags.
    #[must_use]
    pub const fn mode(&self) -> Mode {
        self.mode
    }

    /// Maps a zero-filled region.
    ///
    /// # Errors
    ///
    /// See [`MemoryMap::map`].
    pub fn mem_map(&mut self, base: u64, size: u64, perms: Permissions) -> Result<RegionId, Error> {
        self.memory.map(base, size, perms)
    }

    /// Unmaps the region exactly matching `[base, base + size)`.
    ///
    /// # Errors
    ///
    /// See [`MemoryMap::unmap`].
    pub fn mem_unmap(&mut self, base: u64, size: u64) -> Result<(), Error> {
        self.memory.unmap(base, size)
    }

    /// Replaces the permissions of the region exactly matching `[base, base + size)`.
    ///
    /// # Errors
    ///
    /// See [`MemoryMap::protect`].
    pub fn mem_protect(&mut self, base: u64, size: u64, perms: Permissions) -> Result<(), Error> {
        self.memory.protect(base, size, perms)
    }

    /// Reads guest memory. No hooks fire.
    ///
    /// # Errors
    ///
    /// See [`MemoryMap::read`].
    pub fn mem_read(&self, addr: u64, len: usize) -> Result<Vec<u8>, Error> {
        self.memory.read(addr, len)
    }

    /// Writes guest memory. No hooks fire.
    ///
    /// # Errors
    ///
    /// See [`MemoryMap::write`].
    pub fn mem_write(&mut self, addr: u64, bytes: &[u8]) -> Result<(), Error> {
        self.memory.write(addr, bytes)
    }

    /// Writes guest memory ignoring permissions.
    ///
    /// # Errors
    ///
    /// See [`MemoryMap::load`].
    pub fn mem_load(&mut self, addr: u64, bytes: &[u8]) -> Result<(), Error> {
        self.memory.load(addr, bytes)
    }

    /// Snapshot of the mapped regions.
    #[must_use]
    pub fn mem_regions(&self) -> Vec<MemoryRegion> {
        self.memory.regions()
    }

    /// Reads one register.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownRegister`] for ids outside the layout.
    pub fn reg_read(&self, id: RegId) -> Result<u64, Error> {
        self.registers.read(id)
    }

    /// Writes one register, truncated to its width. Writing the PC redirects
    /// execution once the callback returns.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownRegister`] for ids outside the layout.
    pub fn reg_write(&mut self, id: RegId, value: u64) -> Result<(), Error> {
        self.registers.write(id, value)
    }

    /// Current program counter.
    ///
    /// # Errors
    ///
    /// Fails only if the engine layout lacks its own PC register.
    pub fn pc(&self) -> Result<u64, Error> {
        self.registers.read(self.registers.pc())
    }

    /// Registers a hook. It first fires for events raised after the current
    /// callback returns.
    ///
    /// # Errors
    ///
    /// See [`HookRegistry::register`].
    pub fn add_hook(
        &mut self,
        kind: EventKind,
        range: AddressRange,
        callback: HookCallback,
    ) -> Result<HookHandle, Error> {
        self.hooks.register(kind, range, None, callback)
    }

    /// Registers an `InstructionEnter` hook restricted to instruction `insn`.
    ///
    /// # Errors
    ///
    /// See [`HookRegistry::register`].
    pub fn add_instruction_hook(
        &mut self,
        range: AddressRange,
        insn: InsnId,
        callback: HookCallback,
    ) -> Result<HookHandle, Error> {
        self.hooks
            .register(EventKind::InstructionEnter, range, Some(insn), callback)
    }

    /// Unregisters a hook, including the one currently running.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownHandle`] when `handle` is not registered.
    pub fn remove_hook(&mut self, handle: HookHandle) -> Result<(), Error> {
        self.hooks.unregister(handle)
    }

    /// Requests the run to end at the next instruction boundary.
    pub fn stop(&self) {
        log::debug!("stop requested from hook");
        self.stop.stop();
    }

    /// Returns `true` once a stop was requested for the current run.
    #[must_use]
    pub fn is_stop_requested(&self) -> bool {
        self.stop.is_stop_requested()
    }

    pub(crate) fn pc_id(&self) -> RegId {
        self.registers.pc()
    }

    pub(crate) fn hooks(&self) -> &HookRegistry {
        self.hooks
    }

    pub(crate) fn memory(&self) -> &MemoryMap {
        self.memory
    }

    pub(crate) fn memory_mut(&mut self) -> &mut MemoryMap {
        self.memory
    }
}
