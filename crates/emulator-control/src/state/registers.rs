use std::collections::BTreeMap;
use std::fmt;

use crate::Error;

/// Architecture-specific register identifier, as enumerated by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct RegId(pub u32);

impl fmt::Display for RegId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "reg#{}", self.0)
    }
}

/// One architecturally visible register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegisterSpec {
    /// Identifier used by `reg_read`/`reg_write`.
    pub id: RegId,
    /// Conventional register name (`"rax"`, `"r0"`, `"pc"`).
    pub name: &'static str,
    /// Storage width in bits (`1..=64`).
    pub bits: u32,
}

impl RegisterSpec {
    /// Creates a register descriptor.
    #[must_use]
    pub const fn new(id: RegId, name: &'static str, bits: u32) -> Self {
        Self { id, name, bits }
    }

    /// Mask covering the declared width.
    #[must_use]
    pub const fn mask(&self) -> u64 {
        if self.bits >= 64 {
            u64::MAX
        } else {
            (1 << self.bits) - 1
        }
    }
}

/// Register enumeration an engine supplies for one architecture/mode pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterLayout {
    /// Register holding the guest program counter.
    pub pc: RegId,
    /// All registers, in the engine's preferred order.
    pub registers: Vec<RegisterSpec>,
}

/// Register file of one session.
///
/// Every value is stored as a `u64` truncated to the declared width. Narrow
/// views of a wider register are the engine's concern and are not modelled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterBank {
    pc: RegId,
    slots: BTreeMap<RegId, Slot>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Slot {
    spec: RegisterSpec,
    value: u64,
}

impl RegisterBank {
    /// Builds a zeroed bank from an engine-supplied layout.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] when an id repeats, a width is
    /// outside `1..=64`, or the program counter is missing from the layout.
    pub fn new(layout: RegisterLayout) -> Result<Self, Error> {
        let mut slots = BTreeMap::new();
        for spec in layout.registers {
            if spec.bits == 0 || spec.bits > 64 {
                return Err(Error::InvalidArgument("register width must be 1..=64 bits"));
            }
            if slots.insert(spec.id, Slot { spec, value: 0 }).is_some() {
                return Err(Error::InvalidArgument("duplicate register id in layout"));
            }
        }
        if !slots.contains_key(&layout.pc) {
            return Err(Error::InvalidArgument("program counter missing from layout"));
        }

        Ok(Self {
            pc: layout.pc,
            slots,
        })
    }

    /// Identifier of the program counter register.
    #[must_use]
    pub const fn pc(&self) -> RegId {
        self.pc
    }

    /// Reads a register.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownRegister`] when `id` is not part of the layout.
    pub fn read(&self, id: RegId) -> Result<u64, Error> {
        self.slots
            .get(&id)
            .map(|slot| slot.value)
            .ok_or(Error::UnknownRegister(id))
    }

    /// Writes a register, truncating `value` to the register width.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownRegister`] when `id` is not part of the layout.
    pub fn write(&mut self, id: RegId, value: u64) -> Result<(), Error> {
        let slot = self
            .slots
            .get_mut(&id)
            .ok_or(Error::UnknownRegister(id))?;
        slot.value = value & slot.spec.mask();
        Ok(())
    }

    /// Looks a register up by its conventional name.
    #[must_use]
    pub fn id_of(&self, name: &str) -> Option<RegId> {
        self.slots
            .values()
            .find(|slot| slot.spec.name.eq_ignore_ascii_case(name))
            .map(|slot| slot.spec.id)
    }

    /// Descriptor for `id`, when it exists.
    #[must_use]
    pub fn spec(&self, id: RegId) -> Option<RegisterSpec> {
        self.slots.get(&id).map(|slot| slot.spec)
    }

    /// Number of registers in the bank.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns `true` for a bank without registers (never the case for a
    /// bank built by [`RegisterBank::new`]).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Every register value in id order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(RegId, u64)> {
        self.slots.iter().map(|(id, slot)| (*id, slot.value)).collect()
    }

    /// Writes back values captured by [`RegisterBank::snapshot`].
    ///
    /// Nothing is written unless every id is known.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownRegister`] for the first id missing from the
    /// layout.
    pub fn restore(&mut self, values: &[(RegId, u64)]) -> Result<(), Error> {
        if let Some((id, _)) = values.iter().find(|(id, _)| !self.slots.contains_key(id)) {
            return Err(Error::UnknownRegister(*id));
        }
        for (id, value) in values {
            self.write(*id, *value)?;
        }
        Ok(())
    }
}
