//! Cooperative coroutine scheduler.
//!
//! Live coroutines sit in an indexed ready list that `process()` walks in
//! insertion order. Freshly spawned coroutines wait in a spawn queue and
//! join the ready list at the top of the next round, so a spawn from round
//! N first runs in round N+1. Finished coroutines are marked and swept
//! after the round, which keeps indices stable while iterating.

use crate::coroutine::Coroutine;

#[derive(Debug, Default)]
pub struct Scheduler {
    pub coroutines: Vec<Coroutine>,
    pub spawned: Vec<Coroutine>,
    next_id: u32,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Queue a coroutine for the next round.
    pub fn spawn(&mut self, co: Coroutine) -> u32 {
        let id = co.id;
        tracing::debug!(id, pc = co.pc, "coroutine spawned");
        self.spawned.push(co);
        id
    }

    /// Move the spawn queue onto the ready list, most recent first.
    pub fn admit_spawned(&mut self) {
        while let Some(co) = self.spawned.pop() {
            self.coroutines.push(co);
        }
    }

    /// Mark every live coroutine killed and drop pending spawns. A pending
    /// panic in a killed coroutine is abandoned; the kill drains its
    /// defers and removes it.
    pub fn kill_all(&mut self) {
        for co in &mut self.coroutines {
            if !co.removed {
                co.is_killed = true;
                co.is_panicking = false;
                co.pending_unwind = true;
            }
        }
        self.spawned.clear();
    }

    /// Drop coroutines marked for removal.
    pub fn sweep(&mut self) {
        self.coroutines.retain(|co| !co.removed);
    }

    pub fn has_live(&self) -> bool {
        self.coroutines.iter().any(|co| !co.removed) || !self.spawned.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_waits_for_next_round() {
        let mut sched = Scheduler::new();
        let id = sched.next_id();
        sched.spawn(Coroutine::new(id, 5));
        assert!(sched.coroutines.is_empty());
        assert!(sched.has_live());

        sched.admit_spawned();
        assert_eq!(sched.coroutines.len(), 1);
        assert!(sched.spawned.is_empty());
    }

    #[test]
    fn test_admit_is_lifo() {
        let mut sched = Scheduler::new();
        sched.spawn(Coroutine::new(0, 0));
        sched.spawn(Coroutine::new(1, 0));
        sched.admit_spawned();
        assert_eq!(sched.coroutines[0].id, 1);
        assert_eq!(sched.coroutines[1].id, 0);
    }

    #[test]
    fn test_kill_all_and_sweep() {
        let mut sched = Scheduler::new();
        sched.spawn(Coroutine::new(0, 0));
        sched.admit_spawned();
        sched.spawn(Coroutine::new(1, 0));

        sched.kill_all();
        assert!(sched.spawned.is_empty());
        assert!(sched.coroutines[0].is_killed);
        assert!(sched.coroutines[0].pending_unwind);

        sched.coroutines[0].removed = true;
        sched.sweep();
        assert!(!sched.has_live());
    }
}
