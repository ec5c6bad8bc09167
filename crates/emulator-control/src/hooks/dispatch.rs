//! Delivery of one [`Event`] to every matching hook.

use super::{Event, HookCallback, MemoryAccess};
use crate::{AccessKind, Error, Machine};

/// Outcome of dispatching one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatchResult {
    /// Every matching hook ran; emulation proceeds.
    Continue,
    /// An unmapped-access hook fixed the fault; the access is retried once.
    Resolved,
    /// Value supplied for a port input, already truncated to the port width.
    Value(u64),
}

/// Invokes every hook matching `event`, in registration order.
///
/// Matches are resolved before the first callback runs, so hooks added or
/// removed by a callback only affect later events.
///
/// - Trace events run every match and yield [`DispatchResult::Continue`].
/// - Unmapped events stop at the first hook returning `true` and yield
///   [`DispatchResult::Resolved`].
/// - Port input yields the value of the last matching hook, or zero when no
///   hook matches.
///
/// # Errors
///
/// Returns [`Error::Hook`] wrapping the first callback failure, which aborts
/// the remaining callbacks. An unmapped event that no hook resolves yields
/// [`Error::UnmappedMemoryAccess`].
///
/// # Panics
///
/// Panics if a callback is re-entered while it is already running.
pub fn dispatch(machine: &mut Machine<'_>, event: &Event) -> Result<DispatchResult, Error> {
    let matches = machine
        .hooks()
        .lookup(event.kind(), event.match_key(), event.insn());
    log::trace!("dispatching {event:?} to {} hook(s)", matches.len());

    let mut result = match event {
        Event::PortIn { .. } => DispatchResult::Value(0),
        _ => DispatchResult::Continue,
    };
    for (handle, callback) in matches {
        let wrap = |source: Error| Error::Hook {
            handle,
            source: Box::new(source),
        };
        match (&callback, *event) {
            (
                HookCallback::Code(f),
                Event::BlockEnter { address, size } | Event::InstructionEnter { address, size, .. },
            ) => {
                (*f.borrow_mut())(&mut *machine, address, size).map_err(wrap)?;
            }
            (HookCallback::MemoryAccess(f), Event::MemoryRead { address, size }) => {
                let access = MemoryAccess {
                    kind: AccessKind::Read,
                    address,
                    size,
                    value: 0,
                };
                (*f.borrow_mut())(&mut *machine, access).map_err(wrap)?;
            }
            (HookCallback::MemoryAccess(f), Event::MemoryWrite { address, size, value }) => {
                let access = MemoryAccess {
                    kind: AccessKind::Write,
                    address,
                    size,
                    value,
                };
                (*f.borrow_mut())(&mut *machine, access).map_err(wrap)?;
            }
            (
                HookCallback::MemoryFault(f),
                Event::MemoryUnmapped {
                    access,
                    address,
                    size,
                    value,
                },
            ) => {
                let access = MemoryAccess {
                    kind: access,
                    address,
                    size,
                    value,
                };
                if (*f.borrow_mut())(&mut *machine, access).map_err(wrap)? {
                    log::debug!("{handle} resolved {access:?}");
                    return Ok(DispatchResult::Resolved);
                }
            }
            (HookCallback::PortIn(f), Event::PortIn { port, size, .. }) => {
                let value = (*f.borrow_mut())(&mut *machine, port, size).map_err(wrap)?;
                result = DispatchResult::Value(value & width_mask(size));
            }
            (
                HookCallback::PortOut(f),
                Event::PortOut {
                    port, size, value, ..
                },
            ) => {
                (*f.borrow_mut())(&mut *machine, port, size, value).map_err(wrap)?;
            }
            (HookCallback::Interrupt(f), Event::Interrupt { number, .. }) => {
                (*f.borrow_mut())(&mut *machine, number).map_err(wrap)?;
            }
            (callback, event) => {
                log::warn!("{handle} has shape {callback:?} but matched {event:?}");
            }
        }
    }

    if let Event::MemoryUnmapped {
        access,
        address,
        size,
        ..
    } = *event
    {
        return Err(Error::UnmappedMemoryAccess {
            kind: access,
            address,
            size,
        });
    }
    Ok(result)
}

fn width_mask(size: u8) -> u64 {
    match size {
        0 => 0,
        1..=7 => (1 << (u32::from(size) * 8)) - 1,
        _ => u64::MAX,
    }
}
