//! Emulation session: lifecycle, host-side configuration and the bounded run loop.

use std::time::Instant;

use crate::engine::{Cpu, StepOutcome, SteppingEngine};
use crate::hooks::{AddressRange, EventKind, HookCallback, HookHandle, HookRegistry, InsnId};
use crate::{
    Arch, Context, Error, Machine, MemoryMap, MemoryRegion, Mode, Permissions, RegId, RegionId,
    RegisterBank, RunRequest, SessionState, StopHandle, StopReason,
};

/// One guest machine driven by a stepping engine.
///
/// A session owns the guest memory map, the register bank and the hook table.
/// Every operation fails with [`Error::InvalidState`] once the session is
/// closed. The first memory or hook mutation in `Created` moves the session to
/// `Configured`.
pub struct Session<E> {
    engine: E,
    arch: Arch,
    mode: Mode,
    state: SessionState,
    memory: MemoryMap,
    registers: RegisterBank,
    hooks: HookRegistry,
    stop: StopHandle,
    last_stop: Option<StopReason>,
    last_error: Option<Error>,
}

impl<E: SteppingEngine> Session<E> {
    /// Opens a session emulating `arch` in `mode` on `engine`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedArch`] when the engine rejects the pair, or
    /// [`Error::InvalidArgument`] when its register layout is malformed.
    pub fn open(engine: E, arch: Arch, mode: Mode) -> Result<Self, Error> {
        if !engine.supports(arch, mode) {
            return Err(Error::UnsupportedArch { arch, mode });
        }
        let registers = RegisterBank::new(engine.register_layout(arch, mode))?;
        log::debug!(
            "opened {arch} session in mode {mode:?} with {} registers",
            registers.len()
        );
        Ok(Self {
            engine,
            arch,
            mode,
            state: SessionState::Created,
            memory: MemoryMap::new(),
            registers,
            hooks: HookRegistry::new(),
            stop: StopHandle::new(),
            last_stop: None,
            last_error: None,
        })
    }

    /// Marks a freshly opened session as configured.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] unless the session is `Created` or
    /// already `Configured`.
    pub fn configure(&mut self) -> Result<(), Error> {
        match self.state {
            SessionState::Created => {
                self.transition(SessionState::Configured);
                Ok(())
            }
            SessionState::Configured => Ok(()),
            state => Err(Error::InvalidState {
                state,
                operation: "configure",
            }),
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

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Engine driving this session.
    #[must_use]
    pub const fn engine(&self) -> &E {
        &self.engine
    }

    /// Reason the last run ended, if any run happened.
    #[must_use]
    pub const fn last_stop_reason(&self) -> Option<StopReason> {
        self.last_stop
    }

    /// Error that ended the last run, if it faulted.
    #[must_use]
    pub const fn last_error(&self) -> Option<&Error> {
        self.last_error.as_ref()
    }

    /// Maps a zero-filled region of `size` bytes at `base`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] once closed, otherwise see
    /// [`MemoryMap::map`].
    pub fn mem_map(&mut self, base: u64, size: u64, perms: Permissions) -> Result<RegionId, Error> {
        self.ensure_open("map memory")?;
        let id = self.memory.map(base, size, perms)?;
        self.touch();
        Ok(id)
    }

    /// Unmaps the region exactly matching `[base, base + size)`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] once closed, otherwise see
    /// [`MemoryMap::unmap`].
    pub fn mem_unmap(&mut self, base: u64, size: u64) -> Result<(), Error> {
        self.ensure_open("unmap memory")?;
        self.memory.unmap(base, size)?;
        self.touch();
        Ok(())
    }

    /// Replaces the permissions of the region exactly matching
    /// `[base, base + size)`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] once closed, otherwise see
    /// [`MemoryMap::protect`].
    pub fn mem_protect(&mut self, base: u64, size: u64, perms: Permissions) -> Result<(), Error> {
        self.ensure_open("protect memory")?;
        self.memory.protect(base, size, perms)?;
        self.touch();
        Ok(())
    }

    /// Reads guest memory, honoring read permission.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] once closed, otherwise see
    /// [`MemoryMap::read`].
    pub fn mem_read(&self, addr: u64, len: usize) -> Result<Vec<u8>, Error> {
        self.ensure_open("read memory")?;
        self.memory.read(addr, len)
    }

    /// Writes guest memory, honoring write permission.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] once closed, otherwise see
    /// [`MemoryMap::write`].
    pub fn mem_write(&mut self, addr: u64, bytes: &[u8]) -> Result<(), Error> {
        self.ensure_open("write memory")?;
        self.memory.write(addr, bytes)?;
        self.touch();
        Ok(())
    }

    /// Loads code or data into mapped memory regardless of permissions.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] once closed, otherwise see
    /// [`MemoryMap::load`].
    pub fn mem_load(&mut self, addr: u64, bytes: &[u8]) -> Result<(), Error> {
        self.ensure_open("load memory")?;
        self.memory.load(addr, bytes)?;
        self.touch();
        Ok(())
    }

    /// Snapshot of the mapped regions sorted by base address.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] once closed.
    pub fn mem_regions(&self) -> Result<Vec<MemoryRegion>, Error> {
        self.ensure_open("list memory regions")?;
        Ok(self.memory.regions())
    }

    /// Reads one register.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] once closed, or
    /// [`Error::UnknownRegister`] for ids outside the layout.
    pub fn reg_read(&self, id: RegId) -> Result<u64, Error> {
        self.ensure_open("read a register")?;
        self.registers.read(id)
    }

    /// Writes one register, truncated to its declared width.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] once closed, or
    /// [`Error::UnknownRegister`] for ids outside the layout.
    pub fn reg_write(&mut self, id: RegId, value: u64) -> Result<(), Error> {
        self.ensure_open("write a register")?;
        self.registers.write(id, value)
    }

    /// Looks up a register id by its case-insensitive name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] once closed.
    pub fn reg_id(&self, name: &str) -> Result<Option<RegId>, Error> {
        self.ensure_open("look up a register")?;
        Ok(self.registers.id_of(name))
    }

    /// Registers a hook for `kind` events whose key falls in `range`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] once closed, otherwise see
    /// [`HookRegistry::register`].
    pub fn add_hook(
        &mut self,
        kind: EventKind,
        range: AddressRange,
        callback: HookCallback,
    ) -> Result<HookHandle, Error> {
        self.ensure_open("add a hook")?;
        let handle = self.hooks.register(kind, range, None, callback)?;
        self.touch();
        Ok(handle)
    }

    /// Registers an `InstructionEnter` hook that only fires for `insn`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] once closed, otherwise see
    /// [`HookRegistry::register`].
    pub fn add_instruction_hook(
        &mut self,
        range: AddressRange,
        insn: InsnId,
        callback: HookCallback,
    ) -> Result<HookHandle, Error> {
        self.ensure_open("add a hook")?;
        let handle = self
            .hooks
            .register(EventKind::InstructionEnter, range, Some(insn), callback)?;
        self.touch();
        Ok(handle)
    }

    /// Unregisters a hook.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] once closed, or
    /// [`Error::UnknownHandle`] when `handle` is not registered.
    pub fn remove_hook(&mut self, handle: HookHandle) -> Result<(), Error> {
        self.ensure_open("remove a hook")?;
        self.hooks.unregister(handle)?;
        self.touch();
        Ok(())
    }

    /// Requests the current run to stop at the next instruction boundary.
    pub fn stop(&self) {
        self.stop.stop();
    }

    /// Stop flag that can be moved to another thread.
    #[must_use]
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Captures every register value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] once closed.
    pub fn save_context(&self) -> Result<Context, Error> {
        self.ensure_open("save a context")?;
        Ok(Context {
            arch: self.arch,
            mode: self.mode,
            values: self.registers.snapshot(),
        })
    }

    /// Restores registers captured by [`Session::save_context`]. Memory is
    /// left untouched.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] once closed,
    /// [`Error::InvalidArgument`] for a context of another architecture or
    /// mode, or [`Error::UnknownRegister`] when it names a register outside
    /// the layout.
    pub fn restore_context(&mut self, context: &Context) -> Result<(), Error> {
        self.ensure_open("restore a context")?;
        if context.arch != self.arch || context.mode != self.mode {
            return Err(Error::InvalidArgument(
                "context was saved from a different architecture or mode",
            ));
        }
        self.registers.restore(&context.values)
    }

    /// Runs the guest from `request.start` until a stop condition is met.
    ///
    /// Stop conditions are checked before every instruction, in this order:
    /// stop requested, PC at `end`, instruction limit, timeout. An engine
    /// halt ends the run as [`StopReason::Completed`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] unless the session is `Configured` or
    /// `Stopped` and `start` is mapped executable, and
    /// [`Error::InvalidArgument`] when `start` or `end` is wider than the
    /// program counter. Any fault raised while running is returned after the
    /// session moves to `Faulted`.
    pub fn run(&mut self, request: &RunRequest) -> Result<StopReason, Error> {
        if !self.state.can_run() {
            return Err(Error::InvalidState {
                state: self.state,
                operation: "run",
            });
        }
        let pc_mask = self
            .registers
            .spec(self.registers.pc())
            .map_or(u64::MAX, |spec| spec.mask());
        if request.start & !pc_mask != 0 || request.end.is_some_and(|end| end & !pc_mask != 0) {
            return Err(Error::InvalidArgument(
                "run bounds do not fit the program counter",
            ));
        }
        if self
            .memory
            .check(request.start, 1, Permissions::EXEC)
            .is_err()
        {
            return Err(Error::InvalidState {
                state: self.state,
                operation: "run from a start address that is not mapped executable",
            });
        }

        self.stop.clear();
        self.registers.write(self.registers.pc(), request.start)?;
        self.last_stop = None;
        self.last_error = None;
        self.transition(SessionState::Running);
        log::debug!(
            "run from {:#x} (end {:?}, timeout {:?}, count {})",
            request.start,
            request.end,
            request.timeout,
            request.count
        );

        let started = Instant::now();
        let outcome = {
            let machine = Machine::new(
                &mut self.memory,
                &mut self.registers,
                &mut self.hooks,
                &self.stop,
                self.arch,
                self.mode,
            );
            let mut cpu = Cpu::new(machine);
            drive(&mut self.engine, &mut cpu, request, started)
        };

        match outcome {
            Ok(reason) => {
                log::debug!("run stopped: {reason} after {:?}", started.elapsed());
                self.last_stop = Some(reason);
                self.transition(SessionState::Stopped);
                Ok(reason)
            }
            Err(error) => {
                log::warn!("run faulted: {error}");
                self.last_stop = Some(StopReason::Fault(error.fault_kind()));
                self.last_error = Some(error.clone());
                self.transition(SessionState::Faulted);
                Err(error)
            }
        }
    }

    /// Releases all memory and hooks. The session rejects every later call.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if the session is already closed.
    pub fn close(&mut self) -> Result<(), Error> {
        self.ensure_open("close")?;
        self.memory.clear();
        self.hooks.clear();
        self.transition(SessionState::Closed);
        Ok(())
    }

    fn ensure_open(&self, operation: &'static str) -> Result<(), Error> {
        if self.state.is_open() {
            Ok(())
        } else {
            Err(Error::InvalidState {
                state: self.state,
                operation,
            })
        }
    }

    fn touch(&mut self) {
        if self.state == SessionState::Created {
            self.transition(SessionState::Configured);
        }
    }

    fn transition(&mut self, next: SessionState) {
        log::trace!("session {} -> {next}", self.state);
        self.state = next;
    }
}

/// Steps `engine` until a stop condition holds. A fault latched by the
/// [`Cpu`] wins over whatever the engine returned.
fn drive<E: SteppingEngine>(
    engine: &mut E,
    cpu: &mut Cpu<'_>,
    request: &RunRequest,
    started: Instant,
) -> Result<StopReason, Error> {
    let begun = engine.begin(cpu);
    if let Some(fault) = cpu.take_fault() {
        return Err(fault);
    }
    begun?;

    let mut retired: u64 = 0;
    loop {
        if let Some(reason) = boundary_stop(cpu, request, retired, started)? {
            return Ok(reason);
        }
        let stepped = engine.step(cpu);
        if let Some(fault) = cpu.take_fault() {
            return Err(fault);
        }
        match stepped? {
            StepOutcome::Continue => retired += 1,
            StepOutcome::Halted => return Ok(StopReason::Completed),
        }
    }
}

fn boundary_stop(
    cpu: &Cpu<'_>,
    request: &RunRequest,
    retired: u64,
    started: Instant,
) -> Result<Option<StopReason>, Error> {
    if cpu.halt_requested() {
        return Ok(Some(StopReason::ExplicitStop));
    }
    if request.end == Some(cpu.pc()?) {
        return Ok(Some(StopReason::Completed));
    }
    if request.count != 0 && retired >= request.count {
        return Ok(Some(StopReason::InstructionLimit));
    }
    if !request.timeout.is_zero() && started.elapsed() >= request.timeout {
        return Ok(Some(StopReason::Timeout));
    }
    Ok(None)
}
