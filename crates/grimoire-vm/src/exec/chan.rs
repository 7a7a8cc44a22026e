//! Channel instructions: send, receive, close.
//!
//! Send expects the channel on top of the object stack and the value on
//! top of its kind's stack; receive expects only the channel. Operands
//! stay on the stacks while the operation would block, so the instruction
//! can be retried verbatim next round.

use grimoire_common::bytecode::Kind;

use crate::channel::{RecvResult, SendResult};
use crate::coroutine::Coroutine;
use crate::object::{Obj, Val};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChanIo {
    Ok,
    Block,
    Closed,
}

/// The channel itself sits on top of the object stack, so an object value
/// being sent is the slot beneath it.
fn peek_send_val(co: &Coroutine, kind: Kind) -> Val {
    match kind {
        Kind::Int => Val::Int(co.int_stack.last().copied().unwrap_or_default()),
        Kind::Float => Val::Float(co.float_stack.last().copied().unwrap_or_default()),
        Kind::Str => Val::Str(co.string_stack.last().cloned().unwrap_or_default()),
        Kind::Obj => {
            let len = co.object_stack.len();
            let v = if len >= 2 { co.object_stack[len - 2].clone() } else { Obj::Null };
            Val::Obj(v)
        }
    }
}

fn drop_val(co: &mut Coroutine, kind: Kind) {
    match kind {
        Kind::Int => {
            co.pop_int();
        }
        Kind::Float => {
            co.pop_float();
        }
        Kind::Str => {
            co.pop_string();
        }
        Kind::Obj => {
            co.pop_object();
        }
    }
}

pub fn send(co: &mut Coroutine, kind: Kind) -> ChanIo {
    let ch = match co.object_stack.last() {
        Some(Obj::Channel(c)) => c.clone(),
        _ => {
            co.pop_object();
            drop_val(co, kind);
            return ChanIo::Closed;
        }
    };
    let value = peek_send_val(co, kind);
    let result = ch.borrow_mut().try_send(value);
    match result {
        SendResult::Sent => {
            co.pop_object();
            drop_val(co, kind);
            ChanIo::Ok
        }
        SendResult::WouldBlock => ChanIo::Block,
        SendResult::Closed => {
            co.pop_object();
            drop_val(co, kind);
            ChanIo::Closed
        }
    }
}

pub fn receive(co: &mut Coroutine) -> ChanIo {
    let ch = match co.object_stack.last() {
        Some(Obj::Channel(c)) => c.clone(),
        _ => {
            co.pop_object();
            return ChanIo::Closed;
        }
    };
    let result = ch.borrow_mut().try_recv();
    match result {
        RecvResult::Value(v) => {
            co.pop_object();
            co.push_val(v);
            ChanIo::Ok
        }
        RecvResult::WouldBlock => ChanIo::Block,
        RecvResult::Closed => {
            co.pop_object();
            ChanIo::Closed
        }
    }
}

/// Close the channel on top of the object stack, orphaning it for all
/// holders.
pub fn close(co: &mut Coroutine) -> Result<(), &'static str> {
    match co.pop_object() {
        Obj::Channel(c) => {
            c.borrow_mut().close();
            Ok(())
        }
        _ => Err(super::CHANNEL_ERROR),
    }
}
