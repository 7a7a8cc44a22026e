//! Host bridge: primitive libraries, the primitive-call ABI and the
//! host-plane error type.
//!
//! Host errors are VM misuse surfaced straight to the caller; they never
//! enter the script-level exception machinery.

use thiserror::Error;

use grimoire_common::serialize::SerializeError;

use crate::object::{Obj, Val};

#[derive(Debug, Error)]
pub enum HostError {
    #[error("no bytecode loaded")]
    NotLoaded,
    #[error("bytecode image has no entry point")]
    MissingEntry,
    #[error("unknown event `{0}`")]
    UnknownEvent(String),
    #[error("unknown variable `{0}`")]
    UnknownVariable(String),
    #[error("variable `{0}` has a different type")]
    VariableTypeMismatch(String),
    #[error("primitive index {0} out of range")]
    UnknownPrimitive(u32),
    #[error("primitive `{prim}` references unregistered library {library}")]
    UnknownLibrary { prim: String, library: u16 },
    #[error("class index {0} out of range")]
    UnknownClass(u32),
    #[error("invalid opcode {opcode} at instr {pc}")]
    InvalidOpcode { opcode: u8, pc: usize },
    #[error("instruction index {0} out of range")]
    PcOutOfRange(usize),
    #[error("malformed bytecode image: {0}")]
    Image(#[from] SerializeError),
}

/// A primitive library. Registered with [`crate::vm::Vm::add_library`]
/// before `load`; the bytecode's primitive table refers to libraries by
/// registration index.
pub trait Library {
    fn name(&self) -> &str;

    /// Run one primitive to completion. Primitives are synchronous and
    /// must not block; an `Err` message becomes a script-level exception
    /// in the calling coroutine.
    fn call(&mut self, primitive: &str, call: &mut Call<'_>) -> Result<(), String>;
}

/// Call handle passed to a primitive: typed parameter access, one typed
/// return slot, and task spawning via queued context objects.
pub struct Call<'a> {
    args: &'a [Val],
    ret: Option<Val>,
    contexts: Vec<Obj>,
}

impl<'a> Call<'a> {
    pub(crate) fn new(args: &'a [Val]) -> Self {
        Self { args, ret: None, contexts: Vec::new() }
    }

    pub(crate) fn finish(self) -> (Option<Val>, Vec<Obj>) {
        (self.ret, self.contexts)
    }

    pub fn arg_count(&self) -> usize {
        self.args.len()
    }

    pub fn get_int(&self, i: usize) -> i32 {
        match self.args.get(i) {
            Some(Val::Int(v)) => *v,
            _ => 0,
        }
    }

    pub fn get_float(&self, i: usize) -> f32 {
        match self.args.get(i) {
            Some(Val::Float(v)) => *v,
            _ => 0.0,
        }
    }

    pub fn get_string(&self, i: usize) -> &str {
        match self.args.get(i) {
            Some(Val::Str(v)) => v,
            _ => "",
        }
    }

    pub fn get_object(&self, i: usize) -> Obj {
        match self.args.get(i) {
            Some(Val::Obj(v)) => v.clone(),
            _ => Obj::Null,
        }
    }

    pub fn set_int(&mut self, v: i32) {
        self.ret = Some(Val::Int(v));
    }

    pub fn set_float(&mut self, v: f32) {
        self.ret = Some(Val::Float(v));
    }

    pub fn set_string(&mut self, v: impl Into<String>) {
        self.ret = Some(Val::Str(v.into()));
    }

    pub fn set_object(&mut self, v: Obj) {
        self.ret = Some(Val::Obj(v));
    }

    /// Queue a context object onto the outgoing object mailbox, where a
    /// task spawned by this primitive's caller can pop it next round.
    pub fn push_context(&mut self, c: Obj) {
        self.contexts.push(c);
    }
}
