use super::{AddressRange, EventKind, HookCallback, HookHandle, InsnId};
use crate::Error;

/// One registered hook.
#[derive(Debug, Clone)]
pub struct HookEntry {
    /// Handle returned at registration.
    pub handle: HookHandle,
    /// Event kind the hook listens for.
    pub kind: EventKind,
    /// Address filter; port and interrupt hooks filter on the instruction address.
    pub range: AddressRange,
    /// Instruction-id filter for `InstructionEnter` hooks.
    pub insn: Option<InsnId>,
    /// Callback invoked on a match.
    pub callback: HookCallback,
}

impl HookEntry {
    fn matches(&self, kind: EventKind, key: u64, insn: Option<InsnId>) -> bool {
        self.kind == kind
            && self.range.matches(key)
            && (self.insn.is_none() || self.insn == insn)
    }
}

/// Table of registered hooks, kept in registration order.
#[derive(Debug)]
pub struct HookRegistry {
    entries: Vec<HookEntry>,
    next_handle: u64,
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HookRegistry {
    /// Creates an empty registry. The first handle issued is `hook#1`.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_handle: 1,
        }
    }

    /// Registers `callback` for events of `kind` whose match key falls in
    /// `range`. `insn` further restricts `InstructionEnter` hooks to one
    /// instruction id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] when the callback shape does not
    /// serve `kind`, or when `insn` is set on any kind other than
    /// `InstructionEnter`.
    pub fn register(
        &mut self,
        kind: EventKind,
        range: AddressRange,
        insn: Option<InsnId>,
        callback: HookCallback,
    ) -> Result<HookHandle, Error> {
        if !callback.accepts(kind) {
            return Err(Error::InvalidArgument(
                "callback shape does not match event kind",
            ));
        }
        if insn.is_some() && kind != EventKind::InstructionEnter {
            return Err(Error::InvalidArgument(
                "instruction filter requires an instruction hook",
            ));
        }

        let handle = HookHandle(self.next_handle);
        self.next_handle += 1;
        log::debug!("registered {handle} for {kind:?} in {range:?}");
        self.entries.push(HookEntry {
            handle,
            kind,
            range,
            insn,
            callback,
        });
        Ok(handle)
    }

    /// Removes a hook. Dispatches already in flight still run it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownHandle`] when `handle` is not registered.
    pub fn unregister(&mut self, handle: HookHandle) -> Result<(), Error> {
        let index = self
            .entries
            .iter()
            .position(|entry| entry.handle == handle)
            .ok_or(Error::UnknownHandle(handle))?;
        self.entries.remove(index);
        log::debug!("unregistered {handle}");
        Ok(())
    }

    /// Snapshot of the hooks matching an event, in registration order.
    #[must_use]
    pub fn lookup(
        &self,
        kind: EventKind,
        key: u64,
        insn: Option<InsnId>,
    ) -> Vec<(HookHandle, HookCallback)> {
        self.entries
            .iter()
            .filter(|entry| entry.matches(kind, key, insn))
            .map(|entry| (entry.handle, entry.callback.clone()))
            .collect()
    }

    /// Returns `true` when `handle` is registered.
    #[must_use]
    pub fn contains(&self, handle: HookHandle) -> bool {
        self.entries.iter().any(|entry| entry.handle == handle)
    }

    /// Registered hooks in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &HookEntry> {
        self.entries.iter()
    }

    /// Number of registered hooks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when no hook is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops every hook. Handles are never reused.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
