//! Task instructions: spawn a coroutine at a bytecode PC.

use crate::coroutine::Coroutine;
use crate::scheduler::Scheduler;

/// Queue a new coroutine starting at `pc`; it becomes runnable next round.
pub fn spawn_at(sched: &mut Scheduler, pc: usize) -> u32 {
    let id = sched.next_id();
    sched.spawn(Coroutine::new(id, pc))
}
