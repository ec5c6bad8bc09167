//! Register file and session lifecycle state.

/// Register identifiers, engine-supplied layouts and the register bank.
pub mod registers;
/// Session lifecycle state machine.
pub mod run_state;

pub use registers::{RegId, RegisterBank, RegisterLayout, RegisterSpec};
pub use run_state::SessionState;
