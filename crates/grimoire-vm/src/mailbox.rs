//! Global mailboxes: type-partitioned queues that carry arguments from a
//! spawner to a freshly spawned coroutine.
//!
//! Each kind has an in/out buffer pair. Writers (`globalPush_*`,
//! `push_context`, event arguments) append to the out buffer; readers
//! (`globalPop_*`) drain the in buffer. The pairs are swapped at the top
//! of every round, so producers and consumers never see the same buffer
//! within one tick and spawn arguments become visible exactly when the
//! spawned task first runs.
//!
//! Panic messages ride a dedicated string queue that is not swapped: a
//! raise and the catch (or escalation) that consumes it can be rounds
//! apart.

use std::collections::VecDeque;
use std::mem;

use crate::object::Obj;

#[derive(Debug, Default)]
pub struct Mailbox {
    int_in: VecDeque<i32>,
    int_out: VecDeque<i32>,
    float_in: VecDeque<f32>,
    float_out: VecDeque<f32>,
    string_in: VecDeque<String>,
    string_out: VecDeque<String>,
    object_in: VecDeque<Obj>,
    object_out: VecDeque<Obj>,
    panics: Vec<String>,
}

impl Mailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Swap every in/out pair; called once per round.
    pub fn swap(&mut self) {
        mem::swap(&mut self.int_in, &mut self.int_out);
        mem::swap(&mut self.float_in, &mut self.float_out);
        mem::swap(&mut self.string_in, &mut self.string_out);
        mem::swap(&mut self.object_in, &mut self.object_out);
    }

    pub fn push_int(&mut self, v: i32) {
        self.int_out.push_back(v);
    }

    pub fn push_float(&mut self, v: f32) {
        self.float_out.push_back(v);
    }

    pub fn push_string(&mut self, v: String) {
        self.string_out.push_back(v);
    }

    pub fn push_object(&mut self, v: Obj) {
        self.object_out.push_back(v);
    }

    pub fn pop_int(&mut self) -> Option<i32> {
        self.int_in.pop_front()
    }

    pub fn pop_float(&mut self) -> Option<f32> {
        self.float_in.pop_front()
    }

    pub fn pop_string(&mut self) -> Option<String> {
        self.string_in.pop_front()
    }

    pub fn pop_object(&mut self) -> Option<Obj> {
        self.object_in.pop_front()
    }

    pub fn push_panic(&mut self, msg: String) {
        self.panics.push(msg);
    }

    pub fn take_panic(&mut self) -> Option<String> {
        self.panics.pop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pushes_invisible_until_swap() {
        let mut mb = Mailbox::new();
        mb.push_int(1);
        mb.push_int(2);
        assert_eq!(mb.pop_int(), None);

        mb.swap();
        assert_eq!(mb.pop_int(), Some(1));
        assert_eq!(mb.pop_int(), Some(2));
        assert_eq!(mb.pop_int(), None);
    }

    #[test]
    fn test_swap_rotates_buffers() {
        let mut mb = Mailbox::new();
        mb.push_string("a".into());
        mb.swap();
        mb.push_string("b".into());
        assert_eq!(mb.pop_string().as_deref(), Some("a"));
        mb.swap();
        assert_eq!(mb.pop_string().as_deref(), Some("b"));
    }

    #[test]
    fn test_panic_slot_survives_swap() {
        let mut mb = Mailbox::new();
        mb.push_panic("boom".into());
        mb.swap();
        assert_eq!(mb.take_panic().as_deref(), Some("boom"));
        assert_eq!(mb.take_panic(), None);
    }
}
