//! Shared fixtures: a tiny x86-flavoured stepping engine and session helpers.

#![allow(dead_code)]

use emulator_control::{
    Arch, Cpu, Error, InsnId, Mode, Permissions, RegId, RegisterLayout, RegisterSpec, Session,
    StepOutcome, SteppingEngine,
};

pub const EAX: RegId = RegId(0);
pub const ECX: RegId = RegId(1);
pub const EDX: RegId = RegId(2);
pub const EBX: RegId = RegId(3);
pub const EIP: RegId = RegId(8);

/// Base of the code region mapped by [`loaded_session`].
pub const CODE_BASE: u64 = 0x100_0000;
/// Size of the code region mapped by [`loaded_session`].
pub const CODE_SIZE: u64 = 2 * 1024 * 1024;

pub const INC_ECX: u8 = 0x41;
pub const DEC_EDX: u8 = 0x4A;
pub const NOP: u8 = 0x90;
pub const HLT: u8 = 0xF4;
/// `jmp rel8`
pub const JMP: u8 = 0xEB;
/// `in al, imm8`
pub const IN: u8 = 0xE4;
/// `out imm8, al`
pub const OUT: u8 = 0xE6;
/// `int imm8`
pub const INT: u8 = 0xCD;
/// `mov [addr32], ecx`
pub const STORE_ECX: u8 = 0x89;
/// `mov ecx, [addr32]`
pub const LOAD_ECX: u8 = 0x8B;

/// Decodes a handful of one- and multi-byte opcodes. Every instruction raises
/// `InstructionEnter` with its opcode as the instruction id; the first
/// instruction of a run and every jump target raise `BlockEnter`.
#[derive(Debug, Default)]
pub struct TinyEngine {
    block_pending: bool,
    pub executed: u64,
}

fn length(opcode: u8) -> Option<u64> {
    match opcode {
        INC_ECX | DEC_EDX | NOP | HLT => Some(1),
        JMP | IN | OUT | INT => Some(2),
        STORE_ECX | LOAD_ECX => Some(5),
        _ => None,
    }
}

impl SteppingEngine for TinyEngine {
    fn supports(&self, arch: Arch, mode: Mode) -> bool {
        arch == Arch::X86 && mode == Mode::BITS_32
    }

    fn register_layout(&self, _arch: Arch, _mode: Mode) -> RegisterLayout {
        RegisterLayout {
            pc: EIP,
            registers: vec![
                RegisterSpec::new(EAX, "eax", 32),
                RegisterSpec::new(ECX, "ecx", 32),
                RegisterSpec::new(EDX, "edx", 32),
                RegisterSpec::new(EBX, "ebx", 32),
                RegisterSpec::new(EIP, "eip", 32),
            ],
        }
    }

    fn begin(&mut self, _cpu: &mut Cpu<'_>) -> Result<(), Error> {
        self.block_pending = true;
        Ok(())
    }

    fn step(&mut self, cpu: &mut Cpu<'_>) -> Result<StepOutcome, Error> {
        let pc = cpu.pc()?;
        let opcode = cpu.fetch(pc, 1)?[0];
        let len = length(opcode).ok_or(Error::InvalidInstruction { address: pc })?;

        if self.block_pending {
            self.block_pending = false;
            cpu.enter_block(pc, 0)?;
        }
        cpu.enter_instruction(pc, len as u32, Some(InsnId(u32::from(opcode))))?;
        if cpu.pc()? != pc {
            // A hook redirected execution.
            self.block_pending = true;
            return Ok(StepOutcome::Continue);
        }

        let operands = cpu.fetch(pc + 1, (len - 1) as usize)?;
        let imm8 = operands.first().copied().unwrap_or_default();
        let addr32 = || u64::from(u32::from_le_bytes([operands[0], operands[1], operands[2], operands[3]]));
        let mut next = pc + len;
        let mut outcome = StepOutcome::Continue;

        match opcode {
            INC_ECX => {
                let ecx = cpu.reg_read(ECX)?;
                cpu.reg_write(ECX, ecx.wrapping_add(1))?;
            }
            DEC_EDX => {
                let edx = cpu.reg_read(EDX)?;
                cpu.reg_write(EDX, edx.wrapping_sub(1))?;
            }
            NOP => {}
            HLT => outcome = StepOutcome::Halted,
            JMP => {
                next = next.wrapping_add(imm8 as i8 as i64 as u64);
                self.block_pending = true;
            }
            IN => {
                let value = cpu.port_in(u32::from(imm8), 1)?;
                cpu.reg_write(EAX, value)?;
            }
            OUT => {
                let value = cpu.reg_read(EAX)? & 0xFF;
                cpu.port_out(u32::from(imm8), 1, value)?;
            }
            INT => cpu.interrupt(u32::from(imm8))?,
            STORE_ECX => {
                let ecx = cpu.reg_read(ECX)?;
                cpu.write_uint(addr32(), ecx, 4)?;
            }
            LOAD_ECX => {
                let value = cpu.read_uint(addr32(), 4)?;
                cpu.reg_write(ECX, value)?;
            }
            _ => return Err(Error::InvalidInstruction { address: pc }),
        }

        cpu.set_pc(next)?;
        self.executed += 1;
        Ok(outcome)
    }
}

/// Session with no memory mapped yet.
pub fn new_session() -> Session<TinyEngine> {
    Session::open(TinyEngine::default(), Arch::X86, Mode::BITS_32).expect("x86-32 is supported")
}

/// Session with 2 MiB of RWX memory at [`CODE_BASE`] holding `code`.
pub fn loaded_session(code: &[u8]) -> Session<TinyEngine> {
    let mut session = new_session();
    session
        .mem_map(CODE_BASE, CODE_SIZE, Permissions::ALL)
        .expect("code region is free");
    session.mem_write(CODE_BASE, code).expect("code region is writable");
    session
}
