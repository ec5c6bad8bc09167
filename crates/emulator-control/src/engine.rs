//! Contract between a session and the instruction-stepping engine plugged into it.
//!
//! An engine decodes and executes guest instructions. It owns no guest state:
//! memory, registers and hooks live in the session and are reached through a
//! [`Cpu`], which also raises hook events in the required order.

use crate::hooks::{dispatch, DispatchResult, Event, InsnId};
use crate::{AccessKind, Arch, Error, Machine, Mode, Permissions, RegId, RegisterLayout};

/// Result of executing one instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepOutcome {
    /// Instruction retired; the run loop continues.
    Continue,
    /// Guest executed a halt; the run ends as completed.
    Halted,
}

/// Instruction-stepping engine plugged into a [`Session`](crate::Session).
pub trait SteppingEngine {
    /// Returns `true` when this engine can emulate `arch` in `mode`.
    fn supports(&self, arch: Arch, mode: Mode) -> bool;

    /// Register enumeration for a supported `arch`/`mode` pair.
    fn register_layout(&self, arch: Arch, mode: Mode) -> RegisterLayout;

    /// Called once at the start of every run, after the PC is set.
    ///
    /// # Errors
    ///
    /// Any error aborts the run before the first instruction.
    fn begin(&mut self, _cpu: &mut Cpu<'_>) -> Result<(), Error> {
        Ok(())
    }

    /// Executes the instruction at the current PC.
    ///
    /// Engines raise `BlockEnter` and `InstructionEnter` through
    /// [`Cpu::enter_block`] and [`Cpu::enter_instruction`] before executing,
    /// and perform every guest access through the [`Cpu`].
    ///
    /// # Errors
    ///
    /// Returns the fault that ends the run.
    fn step(&mut self, cpu: &mut Cpu<'_>) -> Result<StepOutcome, Error>;
}

/// Guest-side access path used by engines while a run is in progress.
///
/// Memory accesses check coverage and permissions, give unmapped-access hooks
/// one chance to fix the fault, fire trace hooks, then touch memory. The first
/// fault is latched; later events are not dispatched.
pub struct Cpu<'a> {
    machine: Machine<'a>,
    fault: Option<Error>,
}

impl<'a> Cpu<'a> {
    pub(crate) fn new(machine: Machine<'a>) -> Self {
        Self {
            machine,
            fault: None,
        }
    }

    /// Guest architecture.
    #[must_use]
    pub const fn arch(&self) -> Arch {
        self.machine.arch()
    }

    /// Guest mode flags.
    #[must_use]
    pub const fn mode(&self) -> Mode {
        self.machine.mode()
    }

    /// Session state shared with hooks.
    pub fn machine(&mut self) -> &mut Machine<'a> {
        &mut self.machine
    }

    /// Current program counter.
    ///
    /// # Errors
    ///
    /// Fails only if the layout lacks its PC register.
    pub fn pc(&self) -> Result<u64, Error> {
        self.machine.pc()
    }

    /// Moves the program counter.
    ///
    /// # Errors
    ///
    /// Fails only if the layout lacks its PC register.
    pub fn set_pc(&mut self, pc: u64) -> Result<(), Error> {
        let id = self.machine.pc_id();
        self.machine.reg_write(id, pc)
    }

    /// Reads a register.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownRegister`] for ids outside the layout.
    pub fn reg_read(&self, id: RegId) -> Result<u64, Error> {
        self.machine.reg_read(id)
    }

    /// Writes a register, truncated to its width.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownRegister`] for ids outside the layout.
    pub fn reg_write(&mut self, id: RegId, value: u64) -> Result<(), Error> {
        self.machine.reg_write(id, value)
    }

    /// Returns `true` once a stop was requested; engines running long internal
    /// loops may poll this.
    #[must_use]
    pub fn halt_requested(&self) -> bool {
        self.machine.is_stop_requested()
    }

    /// Fetches `len` instruction bytes at `addr`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnmappedMemoryAccess`] when no hook maps the bytes, or
    /// [`Error::ProtectedMemoryAccess`] when they are not executable.
    pub fn fetch(&mut self, addr: u64, len: usize) -> Result<Vec<u8>, Error> {
        self.guard(AccessKind::Fetch, addr, len, 0)?;
        self.machine
            .memory()
            .read_with(addr, len, Some(Permissions::EXEC))
            .map_err(|error| self.access_fault(AccessKind::Fetch, addr, len, error))
    }

    /// Guest data read of `len` bytes at `addr`, firing `MemoryRead` hooks.
    ///
    /// # Errors
    ///
    /// Same as [`Cpu::fetch`] for readable memory, plus hook failures.
    pub fn read_memory(&mut self, addr: u64, len: usize) -> Result<Vec<u8>, Error> {
        self.guard(AccessKind::Read, addr, len, 0)?;
        self.notify(&Event::MemoryRead {
            address: addr,
            size: len,
        })?;
        self.machine
            .memory()
            .read_with(addr, len, Some(Permissions::READ))
            .map_err(|error| self.access_fault(AccessKind::Read, addr, len, error))
    }

    /// Guest data write of `bytes` at `addr`, firing `MemoryWrite` hooks.
    ///
    /// # Errors
    ///
    /// Same as [`Cpu::fetch`] for writable memory, plus hook failures.
    pub fn write_memory(&mut self, addr: u64, bytes: &[u8]) -> Result<(), Error> {
        let value = self.mode().decode_uint(bytes);
        self.guard(AccessKind::Write, addr, bytes.len(), value)?;
        self.notify(&Event::MemoryWrite {
            address: addr,
            size: bytes.len(),
            value,
        })?;
        self.machine
            .memory_mut()
            .write_with(addr, bytes, Some(Permissions::WRITE))
            .map_err(|error| self.access_fault(AccessKind::Write, addr, bytes.len(), error))
    }

    /// Reads a `size`-byte integer in the session byte order.
    ///
    /// # Errors
    ///
    /// See [`Cpu::read_memory`].
    pub fn read_uint(&mut self, addr: u64, size: usize) -> Result<u64, Error> {
        let bytes = self.read_memory(addr, size)?;
        Ok(self.mode().decode_uint(&bytes))
    }

    /// Writes the low `size` bytes of `value` in the session byte order.
    ///
    /// # Errors
    ///
    /// See [`Cpu::write_memory`].
    pub fn write_uint(&mut self, addr: u64, value: u64, size: usize) -> Result<(), Error> {
        let bytes = self.mode().encode_uint(value, size);
        self.write_memory(addr, &bytes)
    }

    /// Raises `BlockEnter` for the block starting at `address`.
    ///
    /// # Errors
    ///
    /// Returns the first hook failure.
    pub fn enter_block(&mut self, address: u64, size: u32) -> Result<(), Error> {
        self.notify(&Event::BlockEnter { address, size }).map(drop)
    }

    /// Raises `InstructionEnter` for the instruction at `address`.
    ///
    /// # Errors
    ///
    /// Returns the first hook failure.
    pub fn enter_instruction(
        &mut self,
        address: u64,
        size: u32,
        insn: Option<InsnId>,
    ) -> Result<(), Error> {
        self.notify(&Event::InstructionEnter {
            address,
            size,
            insn,
        })
        .map(drop)
    }

    /// Raises `PortIn` for the instruction at the current PC and returns the
    /// value the guest reads.
    ///
    /// # Errors
    ///
    /// Returns the first hook failure.
    pub fn port_in(&mut self, port: u32, size: u8) -> Result<u64, Error> {
        let address = self.pc()?;
        match self.notify(&Event::PortIn {
            address,
            port,
            size,
        })? {
            DispatchResult::Value(value) => Ok(value),
            DispatchResult::Continue | DispatchResult::Resolved => Ok(0),
        }
    }

    /// Raises `PortOut` for the instruction at the current PC.
    ///
    /// # Errors
    ///
    /// Returns the first hook failure.
    pub fn port_out(&mut self, port: u32, size: u8, value: u64) -> Result<(), Error> {
        let address = self.pc()?;
        self.notify(&Event::PortOut {
            address,
            port,
            size,
            value,
        })
        .map(drop)
    }

    /// Raises `Interrupt` at the current PC.
    ///
    /// # Errors
    ///
    /// Returns the first hook failure.
    pub fn interrupt(&mut self, number: u32) -> Result<(), Error> {
        let address = self.pc()?;
        self.notify(&Event::Interrupt { address, number }).map(drop)
    }

    /// Dispatches `event` to the matching hooks.
    ///
    /// # Errors
    ///
    /// Returns the latched fault without dispatching if the run already
    /// faulted; otherwise latches and returns the dispatch failure.
    pub fn notify(&mut self, event: &Event) -> Result<DispatchResult, Error> {
        if let Some(fault) = &self.fault {
            return Err(fault.clone());
        }
        dispatch::dispatch(&mut self.machine, event).map_err(|error| self.latch(error))
    }

    /// Fault latched during this run, if any.
    #[must_use]
    pub const fn fault(&self) -> Option<&Error> {
        self.fault.as_ref()
    }

    /// Removes and returns the latched fault.
    pub fn take_fault(&mut self) -> Option<Error> {
        self.fault.take()
    }

    /// Checks coverage and permission for a guest access. An unmapped access
    /// raises the matching `Memory*Unmapped` event once; a resolving hook gets
    /// exactly one retry.
    fn guard(&mut self, kind: AccessKind, addr: u64, len: usize, value: u64) -> Result<(), Error> {
        let perm = kind.required_permission();
        let mut retried = false;
        loop {
            match self.machine.memory().check(addr, len, perm) {
                Ok(()) => return Ok(()),
                Err(Error::UnmappedMemory(_)) if !retried => {
                    retried = true;
                    self.notify(&Event::MemoryUnmapped {
                        access: kind,
                        address: addr,
                        size: len,
                        value,
                    })?;
                    log::trace!("retrying {kind} at {addr:#x} after hook resolution");
                }
                Err(error) => return Err(self.access_fault(kind, addr, len, error)),
            }
        }
    }

    fn access_fault(&mut self, kind: AccessKind, address: u64, size: usize, error: Error) -> Error {
        let fault = match error {
            Error::UnmappedMemory(_) => Error::UnmappedMemoryAccess {
                kind,
                address,
                size,
            },
            Error::PermissionDenied(_) => Error::ProtectedMemoryAccess {
                kind,
                address,
                size,
            },
            other => other,
        };
        self.latch(fault)
    }

    fn latch(&mut self, error: Error) -> Error {
        if let Some(fault) = &self.fault {
            return fault.clone();
        }
        log::debug!("run fault latched: {error}");
        self.fault = Some(error.clone());
        error
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use super::Cpu;
    use crate::hooks::{AddressRange, EventKind, HookCallback, HookRegistry, InsnId};
    use crate::{
        AccessKind, Arch, Error, Machine, MemoryMap, Mode, Permissions, RegId, RegisterBank,
        RegisterLayout, RegisterSpec, StopHandle,
    };

    struct Parts {
        memory: MemoryMap,
        registers: RegisterBank,
        hooks: HookRegistry,
        stop: StopHandle,
        mode: Mode,
    }

    impl Parts {
        fn new(mode: Mode) -> Self {
            let layout = RegisterLayout {
                pc: RegId(0),
                registers: vec![
                    RegisterSpec::new(RegId(0), "pc", 32),
                    RegisterSpec::new(RegId(1), "acc", 32),
                ],
            };
            Self {
                memory: MemoryMap::new(),
                registers: RegisterBank::new(layout).expect("valid layout"),
                hooks: HookRegistry::new(),
                stop: StopHandle::new(),
                mode,
            }
        }

        fn cpu(&mut self) -> Cpu<'_> {
            Cpu::new(Machine::new(
                &mut self.memory,
                &mut self.registers,
                &mut self.hooks,
                &self.stop,
                Arch::Mips,
                self.mode,
            ))
        }

        fn count(&mut self, kind: EventKind) -> Rc<Cell<u32>> {
            let count = Rc::new(Cell::new(0));
            let seen = Rc::clone(&count);
            let callback = match kind {
                EventKind::MemoryRead | EventKind::MemoryWrite => {
                    HookCallback::memory_access(move |_, _| {
                        seen.set(seen.get() + 1);
                        Ok(())
                    })
                }
                _ => HookCallback::memory_fault(move |_, _| {
                    seen.set(seen.get() + 1);
                    Ok(false)
                }),
            };
            self.hooks
                .register(kind, AddressRange::ALL, None, callback)
                .expect("valid");
            count
        }
    }

    #[test]
    fn integers_follow_the_session_byte_order() {
        let mut parts = Parts::new(Mode::BITS_32 | Mode::BIG_ENDIAN);
        parts.memory.map(0x1000, 0x100, Permissions::ALL).expect("free");
        let mut cpu = parts.cpu();

        cpu.write_uint(0x1000, 0x1122_3344, 4).expect("writable");
        assert_eq!(
            cpu.machine().mem_read(0x1000, 4),
            Ok(vec![0x11, 0x22, 0x33, 0x44])
        );
        assert_eq!(cpu.read_uint(0x1000, 2), Ok(0x1122));
    }

    #[test]
    fn traced_accesses_fire_hooks_before_touching_memory() {
        let mut parts = Parts::new(Mode::BITS_32);
        parts.memory.map(0x1000, 0x100, Permissions::ALL).expect("free");
        let reads = parts.count(EventKind::MemoryRead);
        let writes = parts.count(EventKind::MemoryWrite);
        let mut cpu = parts.cpu();

        cpu.write_memory(0x1004, &[1, 2]).expect("writable");
        cpu.read_memory(0x1004, 2).expect("readable");
        cpu.fetch(0x1004, 2).expect("executable");

        assert_eq!(reads.get(), 1);
        assert_eq!(writes.get(), 1);
    }

    #[test]
    fn unresolved_unmapped_access_dispatches_once_then_latches() {
        let mut parts = Parts::new(Mode::BITS_32);
        let faults = parts.count(EventKind::MemoryReadUnmapped);
        let mut cpu = parts.cpu();

        let expected = Error::UnmappedMemoryAccess {
            kind: AccessKind::Read,
            address: 0x8000,
            size: 4,
        };
        assert_eq!(cpu.read_uint(0x8000, 4), Err(expected.clone()));
        assert_eq!(cpu.read_uint(0x9000, 4), Err(expected.clone()));
        assert_eq!(cpu.interrupt(3), Err(expected.clone()));
        assert_eq!(faults.get(), 1);
        assert_eq!(cpu.take_fault(), Some(expected));
    }

    #[test]
    fn resolving_without_mapping_faults_after_one_retry() {
        let mut parts = Parts::new(Mode::BITS_32);
        let calls = Rc::new(Cell::new(0));
        let seen = Rc::clone(&calls);
        parts
            .hooks
            .register(
                EventKind::MemoryWriteUnmapped,
                AddressRange::ALL,
                None,
                HookCallback::memory_fault(move |_, _| {
                    seen.set(seen.get() + 1);
                    Ok(true)
                }),
            )
            .expect("valid");
        let mut cpu = parts.cpu();

        assert_eq!(
            cpu.write_uint(0x4000, 7, 4),
            Err(Error::UnmappedMemoryAccess {
                kind: AccessKind::Write,
                address: 0x4000,
                size: 4,
            })
        );
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn permission_failures_become_protected_access_faults() {
        let mut parts = Parts::new(Mode::BITS_32);
        parts.memory.map(0x1000, 0x100, Permissions::READ).expect("free");
        let mut cpu = parts.cpu();

        assert_eq!(
            cpu.fetch(0x1000, 1),
            Err(Error::ProtectedMemoryAccess {
                kind: AccessKind::Fetch,
                address: 0x1000,
                size: 1,
            })
        );
    }

    #[test]
    fn port_input_defaults_to_zero_and_pc_moves() {
        let mut parts = Parts::new(Mode::BITS_32);
        parts
            .hooks
            .register(
                EventKind::InstructionEnter,
                AddressRange::ALL,
                Some(InsnId(1)),
                HookCallback::code(|machine, _, _| machine.reg_write(RegId(1), 9)),
            )
            .expect("valid");
        let mut cpu = parts.cpu();

        assert_eq!(cpu.port_in(0x60, 1), Ok(0));
        cpu.set_pc(0x2000).expect("pc register");
        assert_eq!(cpu.pc(), Ok(0x2000));
        cpu.enter_instruction(0x2000, 1, Some(InsnId(2)))
            .expect("no hooks fail");
        assert_eq!(cpu.reg_read(RegId(1)), Ok(0));
        cpu.enter_instruction(0x2000, 1, Some(InsnId(1)))
            .expect("no hooks fail");
        assert_eq!(cpu.reg_read(RegId(1)), Ok(9));
    }

    #[test]
    fn port_and_interrupt_hooks_filter_on_the_current_pc() {
        let mut parts = Parts::new(Mode::BITS_32);
        let ports = Rc::new(Cell::new(0));
        let seen = Rc::clone(&ports);
        parts
            .hooks
            .register(
                EventKind::PortOut,
                AddressRange::new(0x1000, 0x10FF),
                None,
                HookCallback::port_out(move |_, port, _, _| {
                    seen.set(port);
                    Ok(())
                }),
            )
            .expect("valid");
        parts
            .hooks
            .register(
                EventKind::PortIn,
                AddressRange::at(0x1000),
                None,
                HookCallback::port_in(|_, _, _| Ok(0x42)),
            )
            .expect("valid");
        parts
            .hooks
            .register(
                EventKind::Interrupt,
                AddressRange::at(0x2000),
                None,
                HookCallback::interrupt(|machine, number| {
                    machine.reg_write(RegId(1), u64::from(number))
                }),
            )
            .expect("valid");
        let mut cpu = parts.cpu();

        cpu.set_pc(0x1000).expect("pc register");
        assert_eq!(cpu.port_in(0x60, 1), Ok(0x42));
        cpu.port_out(0x46, 1, 0).expect("no hooks fail");
        assert_eq!(ports.get(), 0x46);
        cpu.interrupt(0x80).expect("no hooks fail");
        assert_eq!(cpu.reg_read(RegId(1)), Ok(0));

        cpu.set_pc(0x2000).expect("pc register");
        assert_eq!(cpu.port_in(0x60, 1), Ok(0));
        cpu.interrupt(0x80).expect("no hooks fail");
        assert_eq!(cpu.reg_read(RegId(1)), Ok(0x80));
    }
}
