//! Controller lifecycle state machine.
//!
//! ```text
//! STOPPED -> STARTED <-[SUSPENDING]-> SUSPENDED -> STOPPED
//! ```
//!
//! `SUSPENDING` is the async in-flight leg of `STARTED -> SUSPENDED`: the
//! controller asks every queue to suspend and stays in `SUSPENDING` until
//! all of them report back, at which point it moves itself to
//! `SUSPENDED`. `STARTED -> STOPPED` direct is allowed but unsafe (it
//! does not wait for outstanding I/O), matching the original's note that
//! callers should route through `SUSPENDED` for a clean shutdown.

use crate::error::{CtrlError, CtrlResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtrlState {
    Stopped,
    Started,
    Suspending,
    Suspended,
}

impl CtrlState {
    /// True if `to` is a legal next state from `self`.
    pub fn can_transition_to(self, to: CtrlState) -> bool {
        use CtrlState::*;
        matches!(
            (self, to),
            (Stopped, Started)
            | (Stopped, Suspended)
            | (Started, Suspending)
            | (Started, Stopped)
            | (Suspending, Suspended)
            | (Suspending, Stopped)
            | (Suspended, Stopped)
            | (Suspended, Started)
        )
    }
}

/// Validates and applies a transition, returning the rejected pair as an
/// error rather than silently ignoring it.
pub fn transition(current: &mut CtrlState, to: CtrlState) -> CtrlResult<()> {
    if !current.can_transition_to(to) {
        return Err(CtrlError::InvalidTransition { from: *current, to });
    }
    *current = to;
    Ok(())
}
