//! Select instructions: start/end bracket a saved-state frame, and
//! `try_channel` arms the next channel operation so a blocked or closed
//! case falls through to the next one instead of suspending the select.

use crate::coroutine::Coroutine;

use super::{jump_target, SELECT_ERROR};

pub fn start(co: &mut Coroutine) {
    co.saved = Some(co.snapshot());
}

/// Arm the next send/receive as a select case; its failure target is
/// `pc + offset`.
pub fn try_channel(co: &mut Coroutine, pc: usize, offset: i32) -> Result<(), &'static str> {
    if co.is_evaluating_channel {
        return Err(SELECT_ERROR);
    }
    co.is_evaluating_channel = true;
    co.select_jump_pc = jump_target(pc, offset);
    Ok(())
}

/// Unify the exit paths of a select block: restore the saved state and
/// stop evaluating.
pub fn check(co: &mut Coroutine) {
    if let Some(snap) = co.saved {
        co.restore(snap);
    }
    co.is_evaluating_channel = false;
}

pub fn end(co: &mut Coroutine) {
    co.saved = None;
}

/// The armed case could not complete: restore the snapshot and continue
/// at the next case. A blocked case additionally parks the coroutine.
pub fn fail_case(co: &mut Coroutine, blocked: bool) {
    if let Some(snap) = co.saved {
        co.restore(snap);
    }
    co.pc = co.select_jump_pc;
    co.is_evaluating_channel = false;
    co.is_locked = blocked;
}
