//! Coroutine state: four typed value stacks, four local arenas, call
//! frames with per-frame defer and exception-handler LIFOs, and the flags
//! the scheduler and unwinder steer by.

use smallvec::SmallVec;

use crate::object::{Obj, Val};

/// One call-stack entry.
///
/// The per-kind `*_locals` fields snapshot the caller's reservation at call
/// time; returning subtracts them from the arena bases to land back on the
/// caller's locals.
#[derive(Debug, Clone, Default)]
pub struct Frame {
    pub ret_pc: usize,
    pub int_locals: usize,
    pub float_locals: usize,
    pub string_locals: usize,
    pub object_locals: usize,
    /// Pending deferred PCs, innermost last.
    pub defers: SmallVec<[usize; 4]>,
    /// Exception handler PCs, innermost last.
    pub handlers: SmallVec<[usize; 2]>,
}

/// Saved coroutine state for channel-select evaluation: stack tops and
/// locals bases, restored when a case fails or at `check_channel`.
#[derive(Debug, Clone, Copy)]
pub struct SelectSnapshot {
    pub int_sp: usize,
    pub float_sp: usize,
    pub string_sp: usize,
    pub object_sp: usize,
    pub int_locals_pos: usize,
    pub float_locals_pos: usize,
    pub string_locals_pos: usize,
    pub object_locals_pos: usize,
}

#[derive(Debug, Default)]
pub struct Coroutine {
    pub id: u32,
    pub pc: usize,

    pub int_stack: Vec<i32>,
    pub float_stack: Vec<f32>,
    pub string_stack: Vec<String>,
    pub object_stack: Vec<Obj>,

    pub int_locals: Vec<i32>,
    pub float_locals: Vec<f32>,
    pub string_locals: Vec<String>,
    pub object_locals: Vec<Obj>,
    pub int_locals_pos: usize,
    pub float_locals_pos: usize,
    pub string_locals_pos: usize,
    pub object_locals_pos: usize,
    /// Reservation made so far by the current frame, per kind.
    pub int_local_size: usize,
    pub float_local_size: usize,
    pub string_local_size: usize,
    pub object_local_size: usize,

    pub frames: Vec<Frame>,

    pub is_panicking: bool,
    pub is_killed: bool,
    pub is_locked: bool,
    pub is_evaluating_channel: bool,
    pub select_jump_pc: usize,
    pub saved: Option<SelectSnapshot>,

    /// Set when the coroutine was killed from outside (kill_all, panic
    /// escalation): its next step enters the unwind path instead of
    /// fetching at `pc`.
    pub pending_unwind: bool,
    /// Mark-for-removal; swept at end of round.
    pub removed: bool,
}

impl Coroutine {
    pub fn new(id: u32, pc: usize) -> Self {
        let mut co = Self { id, pc, ..Self::default() };
        co.frames.push(Frame::default());
        co
    }

    /// Push a call frame: snapshot the current per-kind reservations,
    /// advance the locals bases past them, and start the callee at zero
    /// reservation.
    pub fn push_frame(&mut self, ret_pc: usize) {
        self.frames.push(Frame {
            ret_pc,
            int_locals: self.int_local_size,
            float_locals: self.float_local_size,
            string_locals: self.string_local_size,
            object_locals: self.object_local_size,
            defers: SmallVec::new(),
            handlers: SmallVec::new(),
        });
        self.int_locals_pos += self.int_local_size;
        self.float_locals_pos += self.float_local_size;
        self.string_locals_pos += self.string_local_size;
        self.object_locals_pos += self.object_local_size;
        self.int_local_size = 0;
        self.float_local_size = 0;
        self.string_local_size = 0;
        self.object_local_size = 0;
    }

    /// Pop the current frame and restore the caller's locals bases and
    /// reservations.
    pub fn pop_frame(&mut self) -> Option<Frame> {
        let frame = self.frames.pop()?;
        self.int_locals_pos = self.int_locals_pos.saturating_sub(frame.int_locals);
        self.float_locals_pos = self.float_locals_pos.saturating_sub(frame.float_locals);
        self.string_locals_pos = self.string_locals_pos.saturating_sub(frame.string_locals);
        self.object_locals_pos = self.object_locals_pos.saturating_sub(frame.object_locals);
        self.int_local_size = frame.int_locals;
        self.float_local_size = frame.float_locals;
        self.string_local_size = frame.string_locals;
        self.object_local_size = frame.object_locals;
        Some(frame)
    }

    #[inline]
    pub fn current_frame_mut(&mut self) -> Option<&mut Frame> {
        self.frames.last_mut()
    }

    pub fn snapshot(&self) -> SelectSnapshot {
        SelectSnapshot {
            int_sp: self.int_stack.len(),
            float_sp: self.float_stack.len(),
            string_sp: self.string_stack.len(),
            object_sp: self.object_stack.len(),
            int_locals_pos: self.int_locals_pos,
            float_locals_pos: self.float_locals_pos,
            string_locals_pos: self.string_locals_pos,
            object_locals_pos: self.object_locals_pos,
        }
    }

    pub fn restore(&mut self, snap: SelectSnapshot) {
        self.int_stack.truncate(snap.int_sp);
        self.float_stack.truncate(snap.float_sp);
        self.string_stack.truncate(snap.string_sp);
        self.object_stack.truncate(snap.object_sp);
        self.int_locals_pos = snap.int_locals_pos;
        self.float_locals_pos = snap.float_locals_pos;
        self.string_locals_pos = snap.string_locals_pos;
        self.object_locals_pos = snap.object_locals_pos;
    }

    // Stack accessors. Underflow is a VM bug, never a script error; the
    // sentinel default keeps the machine deterministic if it ever happens.

    #[inline]
    pub fn pop_int(&mut self) -> i32 {
        self.int_stack.pop().unwrap_or_default()
    }

    #[inline]
    pub fn pop_float(&mut self) -> f32 {
        self.float_stack.pop().unwrap_or_default()
    }

    #[inline]
    pub fn pop_string(&mut self) -> String {
        self.string_stack.pop().unwrap_or_default()
    }

    #[inline]
    pub fn pop_object(&mut self) -> Obj {
        self.object_stack.pop().unwrap_or_default()
    }

    /// Push a typed value onto the stack of its kind.
    pub fn push_val(&mut self, v: Val) {
        match v {
            Val::Int(v) => self.int_stack.push(v),
            Val::Float(v) => self.float_stack.push(v),
            Val::Str(v) => self.string_stack.push(v),
            Val::Obj(v) => self.object_stack.push(v),
        }
    }

    /// Widen the current frame's reservation for one kind, doubling the
    /// arena when the base plus reservation outgrows it.
    pub fn reserve_int_locals(&mut self, n: usize) {
        self.int_local_size += n;
        let need = self.int_locals_pos + self.int_local_size;
        if self.int_locals.len() < need {
            let grown = need.max(self.int_locals.len() * 2);
            self.int_locals.resize(grown, 0);
        }
    }

    pub fn reserve_float_locals(&mut self, n: usize) {
        self.float_local_size += n;
        let need = self.float_locals_pos + self.float_local_size;
        if self.float_locals.len() < need {
            let grown = need.max(self.float_locals.len() * 2);
            self.float_locals.resize(grown, 0.0);
        }
    }

    pub fn reserve_string_locals(&mut self, n: usize) {
        self.string_local_size += n;
        let need = self.string_locals_pos + self.string_local_size;
        if self.string_locals.len() < need {
            let grown = need.max(self.string_locals.len() * 2);
            self.string_locals.resize(grown, String::new());
        }
    }

    pub fn reserve_object_locals(&mut self, n: usize) {
        self.object_local_size += n;
        let need = self.object_locals_pos + self.object_local_size;
        if self.object_locals.len() < need {
            let grown = need.max(self.object_locals.len() * 2);
            self.object_locals.resize(grown, Obj::Null);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_locals_bookkeeping() {
        let mut co = Coroutine::new(0, 0);
        co.reserve_int_locals(3);
        co.reserve_string_locals(1);
        assert_eq!(co.int_locals_pos, 0);
        assert_eq!(co.int_local_size, 3);

        co.push_frame(17);
        assert_eq!(co.int_locals_pos, 3);
        assert_eq!(co.string_locals_pos, 1);
        assert_eq!(co.int_local_size, 0);

        co.reserve_int_locals(2);
        assert!(co.int_locals.len() >= 5);

        let frame = co.pop_frame().unwrap();
        assert_eq!(frame.ret_pc, 17);
        assert_eq!(co.int_locals_pos, 0);
        assert_eq!(co.int_local_size, 3);
        assert_eq!(co.string_locals_pos, 0);
    }

    #[test]
    fn test_arena_doubles() {
        let mut co = Coroutine::new(0, 0);
        co.reserve_int_locals(4);
        let first = co.int_locals.len();
        co.reserve_int_locals(1);
        assert!(co.int_locals.len() >= first.max(5));
    }

    #[test]
    fn test_snapshot_restore() {
        let mut co = Coroutine::new(0, 0);
        co.int_stack.push(1);
        co.string_stack.push("keep".into());
        let snap = co.snapshot();
        co.int_stack.push(2);
        co.string_stack.push("drop".into());
        co.object_stack.push(Obj::Null);
        co.restore(snap);
        assert_eq!(co.int_stack, vec![1]);
        assert_eq!(co.string_stack, vec!["keep".to_string()]);
        assert!(co.object_stack.is_empty());
    }

    #[test]
    fn test_underflow_yields_sentinels() {
        let mut co = Coroutine::new(0, 0);
        assert_eq!(co.pop_int(), 0);
        assert_eq!(co.pop_string(), "");
        assert!(co.pop_object().is_null());
    }
}
