//! Guest architecture tags and mode flags selected when a session is opened.

use std::fmt;

use bitflags::bitflags;

/// Guest instruction-set family a session emulates.
///
/// The tag only selects the engine and register layout; no architecture
/// semantics live in this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum Arch {
    /// 32-bit ARM (ARM and Thumb instruction sets).
    Arm,
    /// AArch64.
    Arm64,
    /// MIPS.
    Mips,
    /// x86 in 16, 32 or 64-bit mode.
    X86,
    /// PowerPC.
    Ppc,
    /// SPARC.
    Sparc,
    /// Motorola 68000 family.
    M68k,
    /// RISC-V.
    RiscV,
}

impl Arch {
    /// Every architecture tag in declaration order.
    pub const ALL: [Self; 8] = [
        Self::Arm,
        Self::Arm64,
        Self::Mips,
        Self::X86,
        Self::Ppc,
        Self::Sparc,
        Self::M68k,
        Self::RiscV,
    ];

    /// Short lowercase name used in logs and error messages.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Arm => "arm",
            Self::Arm64 => "arm64",
            Self::Mips => "mips",
            Self::X86 => "x86",
            Self::Ppc => "ppc",
            Self::Sparc => "sparc",
            Self::M68k => "m68k",
            Self::RiscV => "riscv",
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

bitflags! {
    /// Mode flags refining an [`Arch`]: bit width, endianness and ISA variant.
    ///
    /// The empty set means little-endian with the architecture's default width.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
    pub struct Mode: u32 {
        /// Big-endian byte order for multi-byte guest values.
        const BIG_ENDIAN = 1 << 30;
        /// 16-bit operating mode.
        const BITS_16 = 1 << 1;
        /// 32-bit operating mode.
        const BITS_32 = 1 << 2;
        /// 64-bit operating mode.
        const BITS_64 = 1 << 3;
        /// ARM Thumb instruction set.
        const THUMB = 1 << 4;
        /// ARM Cortex-M profile.
        const MCLASS = 1 << 5;
        /// MIPS microMIPS encoding.
        const MICRO = 1 << 6;
    }
}

impl Default for Mode {
    fn default() -> Self {
        Self::empty()
    }
}

impl Mode {
    /// Returns `true` when multi-byte guest values are stored big-endian.
    #[must_use]
    pub const fn is_big_endian(self) -> bool {
        self.contains(Self::BIG_ENDIAN)
    }

    /// Decodes up to eight bytes into an integer using this mode's byte order.
    ///
    /// Bytes beyond the eighth are ignored.
    #[must_use]
    pub fn decode_uint(self, bytes: &[u8]) -> u64 {
        let bytes = &bytes[..bytes.len().min(8)];
        if self.is_big_endian() {
            bytes
                .iter()
                .fold(0, |acc, byte| (acc << 8) | u64::from(*byte))
        } else {
            bytes
                .iter()
                .rev()
                .fold(0, |acc, byte| (acc << 8) | u64::from(*byte))
        }
    }

    /// Encodes the low `size` bytes of `value` using this mode's byte order.
    ///
    /// `size` is clamped to eight.
    #[must_use]
    pub fn encode_uint(self, value: u64, size: usize) -> Vec<u8> {
        let size = size.min(8);
        let le = value.to_le_bytes();
        let mut bytes = le[..size].to_vec();
        if self.is_big_endian() {
            bytes.reverse();
        }
        bytes
    }
}
