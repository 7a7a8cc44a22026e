//! Virtual machine main structure.
//!
//! [`Vm::process`] drives one scheduling round: swap the mailboxes, admit
//! the spawn queue, then walk the ready list in index order, running each
//! coroutine until it yields, blocks on a channel, finishes, or the VM
//! panics. The dispatch loop keeps scalar opcodes inline and routes the
//! structured families through [`crate::exec`].

use std::cell::RefCell;
use std::ffi::c_void;
use std::mem;
use std::rc::Rc;

use tracing::debug;

use grimoire_common::bytecode::{Bytecode, Kind};
use grimoire_common::instruction::Opcode;
use grimoire_common::serialize;

use crate::channel::Channel;
use crate::coroutine::Coroutine;
use crate::exec;
use crate::exec::array::IndexMode;
use crate::exec::call::RetStep;
use crate::exec::chan::ChanIo;
use crate::exec::unwind::Unwound;
use crate::exec::{jump_target, CHANNEL_ERROR, ZERO_DIVISION_ERROR};
use crate::host::{Call, HostError, Library};
use crate::mailbox::Mailbox;
use crate::object::{Instance, Obj, Val};
use crate::scheduler::Scheduler;
use crate::trace as backtrace;

/// Why a coroutine left the dispatch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecResult {
    Continue,
    Yield,
    /// Blocked on a channel; the PC stays on the instruction.
    Block,
    /// Marked for removal.
    Done,
}

macro_rules! arith_int {
    ($co:expr, $m:ident) => {{
        let b = $co.pop_int();
        let a = $co.pop_int();
        $co.int_stack.push(a.$m(b));
    }};
}

macro_rules! arith_float {
    ($co:expr, $op:tt) => {{
        let b = $co.pop_float();
        let a = $co.pop_float();
        $co.float_stack.push(a $op b);
    }};
}

macro_rules! cmp_int {
    ($co:expr, $op:tt) => {{
        let b = $co.pop_int();
        let a = $co.pop_int();
        $co.int_stack.push((a $op b) as i32);
    }};
}

macro_rules! cmp_float {
    ($co:expr, $op:tt) => {{
        let b = $co.pop_float();
        let a = $co.pop_float();
        $co.int_stack.push((a $op b) as i32);
    }};
}

macro_rules! cmp_str {
    ($co:expr, $op:tt) => {{
        let b = $co.pop_string();
        let a = $co.pop_string();
        $co.int_stack.push((a $op b) as i32);
    }};
}

/// Four type-partitioned global variable arrays.
#[derive(Debug, Default)]
pub struct Globals {
    pub ints: Vec<i32>,
    pub floats: Vec<f32>,
    pub strs: Vec<String>,
    pub objs: Vec<Obj>,
}

/// VM state that can be borrowed independently of the scheduler.
#[derive(Debug)]
pub struct VmState {
    pub globals: Globals,
    pub mailbox: Mailbox,
    pub running: bool,
    pub panicking: bool,
    pub panic_message: String,
}

impl VmState {
    pub fn new() -> Self {
        Self {
            globals: Globals::default(),
            mailbox: Mailbox::new(),
            running: true,
            panicking: false,
            panic_message: String::new(),
        }
    }
}

impl Default for VmState {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Vm {
    bytecode: Option<Rc<Bytecode>>,
    pub scheduler: Scheduler,
    pub state: VmState,
    libraries: Vec<Box<dyn Library>>,
}

impl Vm {
    pub fn new() -> Self {
        Self {
            bytecode: None,
            scheduler: Scheduler::new(),
            state: VmState::new(),
            libraries: Vec::new(),
        }
    }

    /// Register a primitive library. All libraries must be registered
    /// before `load`; the bytecode's primitive table refers to them by
    /// registration index.
    pub fn add_library(&mut self, lib: Box<dyn Library>) {
        debug!(name = lib.name(), index = self.libraries.len(), "library registered");
        self.libraries.push(lib);
    }

    pub fn bytecode(&self) -> Option<&Bytecode> {
        self.bytecode.as_deref()
    }

    pub fn load(&mut self, bc: Bytecode) -> Result<(), HostError> {
        for prim in &bc.primitives {
            if prim.library as usize >= self.libraries.len() {
                return Err(HostError::UnknownLibrary {
                    prim: prim.name.clone(),
                    library: prim.library,
                });
            }
        }
        self.state.globals = Globals {
            ints: vec![0; bc.globals.ints as usize],
            floats: vec![0.0; bc.globals.floats as usize],
            strs: vec![String::new(); bc.globals.strs as usize],
            objs: vec![Obj::Null; bc.globals.objs as usize],
        };
        debug!(opcodes = bc.code.len(), events = bc.events.len(), "bytecode loaded");
        self.bytecode = Some(Rc::new(bc));
        Ok(())
    }

    /// Decode and load a serialized bytecode image.
    pub fn load_image(&mut self, bytes: &[u8]) -> Result<(), HostError> {
        let bc = serialize::decode(bytes)?;
        self.load(bc)
    }

    /// Seed the root coroutine at the `main` event (or the start of the
    /// instruction stream).
    pub fn spawn(&mut self) -> Result<u32, HostError> {
        let bc = self.bytecode.as_ref().ok_or(HostError::NotLoaded)?;
        if bc.code.is_empty() {
            return Err(HostError::MissingEntry);
        }
        let entry = bc.event_pc("main").unwrap_or(0) as usize;
        Ok(exec::task::spawn_at(&mut self.scheduler, entry))
    }

    /// Seed a coroutine at a labeled event. The host pushes event
    /// arguments through the mailbox before the next round.
    pub fn spawn_event(&mut self, name: &str) -> Result<u32, HostError> {
        let bc = self.bytecode.as_ref().ok_or(HostError::NotLoaded)?;
        let pc = bc
            .event_pc(name)
            .ok_or_else(|| HostError::UnknownEvent(name.to_string()))?;
        Ok(exec::task::spawn_at(&mut self.scheduler, pc as usize))
    }

    /// Queue a context object for the next spawned task.
    pub fn push_context(&mut self, c: Obj) {
        self.state.mailbox.push_object(c);
    }

    pub fn has_coroutines(&self) -> bool {
        self.scheduler.has_live()
    }

    pub fn is_panicking(&self) -> bool {
        self.state.panicking
    }

    pub fn panic_message(&self) -> &str {
        &self.state.panic_message
    }

    pub fn is_running(&self) -> bool {
        self.state.running
    }

    /// Cooperative cancellation: clearing the flag makes every coroutine
    /// stop at its next instruction boundary, PC intact.
    pub fn set_running(&mut self, running: bool) {
        self.state.running = running;
    }

    /// Drive one scheduling round.
    pub fn process(&mut self) -> Result<(), HostError> {
        let bc = self.bytecode.clone().ok_or(HostError::NotLoaded)?;
        self.state.mailbox.swap();
        self.scheduler.admit_spawned();

        let mut idx = 0;
        while idx < self.scheduler.coroutines.len() {
            if !self.state.running {
                break;
            }
            let mut co = mem::take(&mut self.scheduler.coroutines[idx]);
            let step = self.step_coroutine(&mut co, &bc);
            self.scheduler.coroutines[idx] = co;
            step?;
            idx += 1;
        }

        self.scheduler.sweep();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Host variable access
    // ------------------------------------------------------------------

    fn variable_index(&self, name: &str, kind: Kind) -> Result<usize, HostError> {
        let bc = self.bytecode.as_ref().ok_or(HostError::NotLoaded)?;
        let def = bc
            .variables
            .get(name)
            .ok_or_else(|| HostError::UnknownVariable(name.to_string()))?;
        if def.mask & kind.mask_bit() == 0 {
            return Err(HostError::VariableTypeMismatch(name.to_string()));
        }
        Ok(def.index as usize)
    }

    pub fn get_int_variable(&self, name: &str) -> Result<i32, HostError> {
        let idx = self.variable_index(name, Kind::Int)?;
        Ok(self.state.globals.ints.get(idx).copied().unwrap_or_default())
    }

    pub fn set_int_variable(&mut self, name: &str, v: i32) -> Result<(), HostError> {
        let idx = self.variable_index(name, Kind::Int)?;
        if let Some(slot) = self.state.globals.ints.get_mut(idx) {
            *slot = v;
        }
        Ok(())
    }

    /// Booleans live in the integer partition.
    pub fn get_bool_variable(&self, name: &str) -> Result<bool, HostError> {
        Ok(self.get_int_variable(name)? != 0)
    }

    pub fn set_bool_variable(&mut self, name: &str, v: bool) -> Result<(), HostError> {
        self.set_int_variable(name, v as i32)
    }

    pub fn get_float_variable(&self, name: &str) -> Result<f32, HostError> {
        let idx = self.variable_index(name, Kind::Float)?;
        Ok(self.state.globals.floats.get(idx).copied().unwrap_or_default())
    }

    pub fn set_float_variable(&mut self, name: &str, v: f32) -> Result<(), HostError> {
        let idx = self.variable_index(name, Kind::Float)?;
        if let Some(slot) = self.state.globals.floats.get_mut(idx) {
            *slot = v;
        }
        Ok(())
    }

    pub fn get_string_variable(&self, name: &str) -> Result<String, HostError> {
        let idx = self.variable_index(name, Kind::Str)?;
        Ok(self.state.globals.strs.get(idx).cloned().unwrap_or_default())
    }

    pub fn set_string_variable(&mut self, name: &str, v: String) -> Result<(), HostError> {
        let idx = self.variable_index(name, Kind::Str)?;
        if let Some(slot) = self.state.globals.strs.get_mut(idx) {
            *slot = v;
        }
        Ok(())
    }

    pub fn get_object_variable(&self, name: &str) -> Result<Obj, HostError> {
        let idx = self.variable_index(name, Kind::Obj)?;
        Ok(self.state.globals.objs.get(idx).cloned().unwrap_or_default())
    }

    pub fn set_object_variable(&mut self, name: &str, v: Obj) -> Result<(), HostError> {
        let idx = self.variable_index(name, Kind::Obj)?;
        if let Some(slot) = self.state.globals.objs.get_mut(idx) {
            *slot = v;
        }
        Ok(())
    }

    /// Raw host pointers ride the object partition as opaque handles.
    pub fn get_pointer_variable(&self, name: &str) -> Result<*mut c_void, HostError> {
        match self.get_object_variable(name)? {
            Obj::Host(p) => Ok(p),
            Obj::Null => Ok(std::ptr::null_mut()),
            _ => Err(HostError::VariableTypeMismatch(name.to_string())),
        }
    }

    pub fn set_pointer_variable(&mut self, name: &str, p: *mut c_void) -> Result<(), HostError> {
        self.set_object_variable(name, Obj::Host(p))
    }

    // ------------------------------------------------------------------
    // Exceptions
    // ------------------------------------------------------------------

    fn raise(&mut self, co: &mut Coroutine, bc: &Bytecode, msg: impl Into<String>) -> ExecResult {
        let msg = msg.into();
        let trace = backtrace::render(bc, co.pc, &co.frames);
        debug!(message = %msg, %trace, "script exception raised");
        co.is_panicking = true;
        self.state.mailbox.push_panic(msg);
        match exec::unwind::unwind_panic(co) {
            Unwound::Continue => ExecResult::Continue,
            Unwound::Escalate => self.escalate(co),
        }
    }

    /// A panic left a root frame: the whole VM goes down.
    fn escalate(&mut self, co: &mut Coroutine) -> ExecResult {
        let message = self.state.mailbox.take_panic().unwrap_or_default();
        debug!(%message, "panic reached a root frame; killing all coroutines");
        self.state.panicking = true;
        self.state.panic_message = message;
        self.scheduler.kill_all();
        co.removed = true;
        ExecResult::Done
    }

    fn script(
        &mut self,
        co: &mut Coroutine,
        bc: &Bytecode,
        r: Result<(), &'static str>,
    ) -> ExecResult {
        match r {
            Ok(()) => ExecResult::Continue,
            Err(msg) => self.raise(co, bc, msg),
        }
    }

    // ------------------------------------------------------------------
    // Channels
    // ------------------------------------------------------------------

    fn chan_op(
        &mut self,
        co: &mut Coroutine,
        bc: &Bytecode,
        kind: Option<Kind>,
        pc: usize,
    ) -> ExecResult {
        let io = match kind {
            Some(kind) => exec::chan::send(co, kind),
            None => exec::chan::receive(co),
        };
        match io {
            ChanIo::Ok => {
                co.is_evaluating_channel = false;
                ExecResult::Continue
            }
            ChanIo::Block => {
                if co.is_evaluating_channel {
                    // Armed select case: move on to the next case, parked.
                    exec::select::fail_case(co, true);
                    ExecResult::Block
                } else {
                    co.pc = pc;
                    co.is_locked = true;
                    ExecResult::Block
                }
            }
            ChanIo::Closed => {
                if co.is_evaluating_channel {
                    exec::select::fail_case(co, false);
                    ExecResult::Continue
                } else {
                    self.raise(co, bc, CHANNEL_ERROR)
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Primitive calls
    // ------------------------------------------------------------------

    fn primitive_call(
        &mut self,
        co: &mut Coroutine,
        bc: &Bytecode,
        idx: u32,
    ) -> Result<ExecResult, HostError> {
        let prim = bc
            .primitives
            .get(idx as usize)
            .ok_or(HostError::UnknownPrimitive(idx))?;
        let lib = self
            .libraries
            .get_mut(prim.library as usize)
            .ok_or_else(|| HostError::UnknownLibrary {
                prim: prim.name.clone(),
                library: prim.library,
            })?;

        let mut args = Vec::with_capacity(prim.signature.params.len());
        for &kind in prim.signature.params.iter().rev() {
            args.push(match kind {
                Kind::Int => Val::Int(co.pop_int()),
                Kind::Float => Val::Float(co.pop_float()),
                Kind::Str => Val::Str(co.pop_string()),
                Kind::Obj => Val::Obj(co.pop_object()),
            });
        }
        args.reverse();

        let mut call = Call::new(&args);
        let outcome = lib.call(&prim.name, &mut call);
        let (ret, contexts) = call.finish();
        for c in contexts {
            self.state.mailbox.push_object(c);
        }

        match outcome {
            Ok(()) => {
                match (prim.signature.ret, ret) {
                    (Some(_), Some(v)) => co.push_val(v),
                    (Some(kind), None) => co.push_val(Val::default_for(kind)),
                    (None, _) => {}
                }
                Ok(ExecResult::Continue)
            }
            Err(msg) => Ok(self.raise(co, bc, msg)),
        }
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// Run one coroutine until it suspends.
    fn step_coroutine(
        &mut self,
        co: &mut Coroutine,
        bc: &Bytecode,
    ) -> Result<ExecResult, HostError> {
        co.is_locked = false;
        loop {
            if !self.state.running {
                return Ok(ExecResult::Yield);
            }
            if co.removed {
                return Ok(ExecResult::Done);
            }
            if co.pending_unwind {
                // Killed from outside: behave as if the PC sat on a
                // terminal `unwind`.
                co.pending_unwind = false;
                if exec::unwind::continue_kill(co) {
                    return Ok(ExecResult::Done);
                }
                continue;
            }

            let pc = co.pc;
            let inst = *bc.code.get(pc).ok_or(HostError::PcOutOfRange(pc))?;
            co.pc = pc + 1;

            let result = match inst.opcode() {
                Opcode::Nop => ExecResult::Continue,

                Opcode::ConstInt => {
                    let v = bc.iconsts.get(inst.value() as usize).copied().unwrap_or_default();
                    co.int_stack.push(v);
                    ExecResult::Continue
                }
                Opcode::ConstFloat => {
                    let v = bc.fconsts.get(inst.value() as usize).copied().unwrap_or_default();
                    co.float_stack.push(v);
                    ExecResult::Continue
                }
                Opcode::ConstStr => {
                    let v = bc.sconsts.get(inst.value() as usize).cloned().unwrap_or_default();
                    co.string_stack.push(v);
                    ExecResult::Continue
                }

                Opcode::LoadLocalInt => {
                    let idx = co.int_locals_pos + inst.value() as usize;
                    let v = co.int_locals.get(idx).copied().unwrap_or_default();
                    co.int_stack.push(v);
                    ExecResult::Continue
                }
                Opcode::LoadLocalFloat => {
                    let idx = co.float_locals_pos + inst.value() as usize;
                    let v = co.float_locals.get(idx).copied().unwrap_or_default();
                    co.float_stack.push(v);
                    ExecResult::Continue
                }
                Opcode::LoadLocalStr => {
                    let idx = co.string_locals_pos + inst.value() as usize;
                    let v = co.string_locals.get(idx).cloned().unwrap_or_default();
                    co.string_stack.push(v);
                    ExecResult::Continue
                }
                Opcode::LoadLocalObj => {
                    let idx = co.object_locals_pos + inst.value() as usize;
                    let v = co.object_locals.get(idx).cloned().unwrap_or_default();
                    co.object_stack.push(v);
                    ExecResult::Continue
                }
                Opcode::StoreLocalInt => {
                    let idx = co.int_locals_pos + inst.value() as usize;
                    let v = co.pop_int();
                    if idx >= co.int_locals.len() {
                        co.int_locals.resize(idx + 1, 0);
                    }
                    co.int_locals[idx] = v;
                    ExecResult::Continue
                }
                Opcode::StoreLocalFloat => {
                    let idx = co.float_locals_pos + inst.value() as usize;
                    let v = co.pop_float();
                    if idx >= co.float_locals.len() {
                        co.float_locals.resize(idx + 1, 0.0);
                    }
                    co.float_locals[idx] = v;
                    ExecResult::Continue
                }
                Opcode::StoreLocalStr => {
                    let idx = co.string_locals_pos + inst.value() as usize;
                    let v = co.pop_string();
                    if idx >= co.string_locals.len() {
                        co.string_locals.resize(idx + 1, String::new());
                    }
                    co.string_locals[idx] = v;
                    ExecResult::Continue
                }
                Opcode::StoreLocalObj => {
                    let idx = co.object_locals_pos + inst.value() as usize;
                    let v = co.pop_object();
                    if idx >= co.object_locals.len() {
                        co.object_locals.resize(idx + 1, Obj::Null);
                    }
                    co.object_locals[idx] = v;
                    ExecResult::Continue
                }
                Opcode::LocalStackInt => {
                    co.reserve_int_locals(inst.value() as usize);
                    ExecResult::Continue
                }
                Opcode::LocalStackFloat => {
                    co.reserve_float_locals(inst.value() as usize);
                    ExecResult::Continue
                }
                Opcode::LocalStackStr => {
                    co.reserve_string_locals(inst.value() as usize);
                    ExecResult::Continue
                }
                Opcode::LocalStackObj => {
                    co.reserve_object_locals(inst.value() as usize);
                    ExecResult::Continue
                }

                Opcode::LoadGlobalInt => {
                    let v = self.state.globals.ints.get(inst.value() as usize).copied();
                    co.int_stack.push(v.unwrap_or_default());
                    ExecResult::Continue
                }
                Opcode::LoadGlobalFloat => {
                    let v = self.state.globals.floats.get(inst.value() as usize).copied();
                    co.float_stack.push(v.unwrap_or_default());
                    ExecResult::Continue
                }
                Opcode::LoadGlobalStr => {
                    let v = self.state.globals.strs.get(inst.value() as usize).cloned();
                    co.string_stack.push(v.unwrap_or_default());
                    ExecResult::Continue
                }
                Opcode::LoadGlobalObj => {
                    let v = self.state.globals.objs.get(inst.value() as usize).cloned();
                    co.object_stack.push(v.unwrap_or_default());
                    ExecResult::Continue
                }
                Opcode::StoreGlobalInt => {
                    let v = co.pop_int();
                    if let Some(slot) = self.state.globals.ints.get_mut(inst.value() as usize) {
                        *slot = v;
                    }
                    ExecResult::Continue
                }
                Opcode::StoreGlobalFloat => {
                    let v = co.pop_float();
                    if let Some(slot) = self.state.globals.floats.get_mut(inst.value() as usize) {
                        *slot = v;
                    }
                    ExecResult::Continue
                }
                Opcode::StoreGlobalStr => {
                    let v = co.pop_string();
                    if let Some(slot) = self.state.globals.strs.get_mut(inst.value() as usize) {
                        *slot = v;
                    }
                    ExecResult::Continue
                }
                Opcode::StoreGlobalObj => {
                    let v = co.pop_object();
                    if let Some(slot) = self.state.globals.objs.get_mut(inst.value() as usize) {
                        *slot = v;
                    }
                    ExecResult::Continue
                }

                Opcode::CopyInt => {
                    let v = co.int_stack.last().copied().unwrap_or_default();
                    co.int_stack.push(v);
                    ExecResult::Continue
                }
                Opcode::CopyFloat => {
                    let v = co.float_stack.last().copied().unwrap_or_default();
                    co.float_stack.push(v);
                    ExecResult::Continue
                }
                Opcode::CopyStr => {
                    let v = co.string_stack.last().cloned().unwrap_or_default();
                    co.string_stack.push(v);
                    ExecResult::Continue
                }
                Opcode::CopyObj => {
                    let v = co.object_stack.last().cloned().unwrap_or_default();
                    co.object_stack.push(v);
                    ExecResult::Continue
                }
                Opcode::SwapInt => {
                    let len = co.int_stack.len();
                    if len >= 2 {
                        co.int_stack.swap(len - 1, len - 2);
                    }
                    ExecResult::Continue
                }
                Opcode::SwapFloat => {
                    let len = co.float_stack.len();
                    if len >= 2 {
                        co.float_stack.swap(len - 1, len - 2);
                    }
                    ExecResult::Continue
                }
                Opcode::SwapStr => {
                    let len = co.string_stack.len();
                    if len >= 2 {
                        co.string_stack.swap(len - 1, len - 2);
                    }
                    ExecResult::Continue
                }
                Opcode::SwapObj => {
                    let len = co.object_stack.len();
                    if len >= 2 {
                        co.object_stack.swap(len - 1, len - 2);
                    }
                    ExecResult::Continue
                }
                Opcode::ShiftStackInt => {
                    let n = inst.signed_value();
                    let len = co.int_stack.len();
                    if n < 0 {
                        co.int_stack.truncate(len.saturating_sub(-n as usize));
                    } else {
                        co.int_stack.resize(len + n as usize, 0);
                    }
                    ExecResult::Continue
                }
                Opcode::ShiftStackFloat => {
                    let n = inst.signed_value();
                    let len = co.float_stack.len();
                    if n < 0 {
                        co.float_stack.truncate(len.saturating_sub(-n as usize));
                    } else {
                        co.float_stack.resize(len + n as usize, 0.0);
                    }
                    ExecResult::Continue
                }
                Opcode::ShiftStackStr => {
                    let n = inst.signed_value();
                    let len = co.string_stack.len();
                    if n < 0 {
                        co.string_stack.truncate(len.saturating_sub(-n as usize));
                    } else {
                        co.string_stack.resize(len + n as usize, String::new());
                    }
                    ExecResult::Continue
                }
                Opcode::ShiftStackObj => {
                    let n = inst.signed_value();
                    let len = co.object_stack.len();
                    if n < 0 {
                        co.object_stack.truncate(len.saturating_sub(-n as usize));
                    } else {
                        co.object_stack.resize(len + n as usize, Obj::Null);
                    }
                    ExecResult::Continue
                }

                Opcode::AddInt => {
                    arith_int!(co, wrapping_add);
                    ExecResult::Continue
                }
                Opcode::SubInt => {
                    arith_int!(co, wrapping_sub);
                    ExecResult::Continue
                }
                Opcode::MulInt => {
                    arith_int!(co, wrapping_mul);
                    ExecResult::Continue
                }
                Opcode::DivInt => {
                    let b = co.pop_int();
                    let a = co.pop_int();
                    if b == 0 {
                        self.raise(co, bc, ZERO_DIVISION_ERROR)
                    } else {
                        co.int_stack.push(a.wrapping_div(b));
                        ExecResult::Continue
                    }
                }
                Opcode::ModInt => {
                    let b = co.pop_int();
                    let a = co.pop_int();
                    if b == 0 {
                        self.raise(co, bc, ZERO_DIVISION_ERROR)
                    } else {
                        co.int_stack.push(a.wrapping_rem(b));
                        ExecResult::Continue
                    }
                }
                Opcode::NegInt => {
                    let a = co.pop_int();
                    co.int_stack.push(a.wrapping_neg());
                    ExecResult::Continue
                }
                Opcode::IncInt => {
                    if let Some(v) = co.int_stack.last_mut() {
                        *v = v.wrapping_add(1);
                    }
                    ExecResult::Continue
                }
                Opcode::DecInt => {
                    if let Some(v) = co.int_stack.last_mut() {
                        *v = v.wrapping_sub(1);
                    }
                    ExecResult::Continue
                }

                Opcode::AddFloat => {
                    arith_float!(co, +);
                    ExecResult::Continue
                }
                Opcode::SubFloat => {
                    arith_float!(co, -);
                    ExecResult::Continue
                }
                Opcode::MulFloat => {
                    arith_float!(co, *);
                    ExecResult::Continue
                }
                Opcode::DivFloat => {
                    let b = co.pop_float();
                    let a = co.pop_float();
                    if b == 0.0 {
                        self.raise(co, bc, ZERO_DIVISION_ERROR)
                    } else {
                        co.float_stack.push(a / b);
                        ExecResult::Continue
                    }
                }
                Opcode::ModFloat => {
                    let b = co.pop_float();
                    let a = co.pop_float();
                    if b == 0.0 {
                        self.raise(co, bc, ZERO_DIVISION_ERROR)
                    } else {
                        co.float_stack.push(a % b);
                        ExecResult::Continue
                    }
                }
                Opcode::NegFloat => {
                    let a = co.pop_float();
                    co.float_stack.push(-a);
                    ExecResult::Continue
                }
                Opcode::IncFloat => {
                    if let Some(v) = co.float_stack.last_mut() {
                        *v += 1.0;
                    }
                    ExecResult::Continue
                }
                Opcode::DecFloat => {
                    if let Some(v) = co.float_stack.last_mut() {
                        *v -= 1.0;
                    }
                    ExecResult::Continue
                }

                Opcode::EqInt => {
                    cmp_int!(co, ==);
                    ExecResult::Continue
                }
                Opcode::NeInt => {
                    cmp_int!(co, !=);
                    ExecResult::Continue
                }
                Opcode::LtInt => {
                    cmp_int!(co, <);
                    ExecResult::Continue
                }
                Opcode::LeInt => {
                    cmp_int!(co, <=);
                    ExecResult::Continue
                }
                Opcode::GtInt => {
                    cmp_int!(co, >);
                    ExecResult::Continue
                }
                Opcode::GeInt => {
                    cmp_int!(co, >=);
                    ExecResult::Continue
                }
                Opcode::EqFloat => {
                    cmp_float!(co, ==);
                    ExecResult::Continue
                }
                Opcode::NeFloat => {
                    cmp_float!(co, !=);
                    ExecResult::Continue
                }
                Opcode::LtFloat => {
                    cmp_float!(co, <);
                    ExecResult::Continue
                }
                Opcode::LeFloat => {
                    cmp_float!(co, <=);
                    ExecResult::Continue
                }
                Opcode::GtFloat => {
                    cmp_float!(co, >);
                    ExecResult::Continue
                }
                Opcode::GeFloat => {
                    cmp_float!(co, >=);
                    ExecResult::Continue
                }
                Opcode::EqStr => {
                    cmp_str!(co, ==);
                    ExecResult::Continue
                }
                Opcode::NeStr => {
                    cmp_str!(co, !=);
                    ExecResult::Continue
                }
                Opcode::LtStr => {
                    cmp_str!(co, <);
                    ExecResult::Continue
                }
                Opcode::LeStr => {
                    cmp_str!(co, <=);
                    ExecResult::Continue
                }
                Opcode::GtStr => {
                    cmp_str!(co, >);
                    ExecResult::Continue
                }
                Opcode::GeStr => {
                    cmp_str!(co, >=);
                    ExecResult::Continue
                }
                Opcode::EqObj => {
                    let b = co.pop_object();
                    let a = co.pop_object();
                    co.int_stack.push(a.ref_eq(&b) as i32);
                    ExecResult::Continue
                }
                Opcode::NeObj => {
                    let b = co.pop_object();
                    let a = co.pop_object();
                    co.int_stack.push(!a.ref_eq(&b) as i32);
                    ExecResult::Continue
                }

                Opcode::AndInt => {
                    let b = co.pop_int();
                    let a = co.pop_int();
                    co.int_stack.push((a != 0 && b != 0) as i32);
                    ExecResult::Continue
                }
                Opcode::OrInt => {
                    let b = co.pop_int();
                    let a = co.pop_int();
                    co.int_stack.push((a != 0 || b != 0) as i32);
                    ExecResult::Continue
                }
                Opcode::NotInt => {
                    let a = co.pop_int();
                    co.int_stack.push((a == 0) as i32);
                    ExecResult::Continue
                }

                Opcode::ConcatStr => {
                    let b = co.pop_string();
                    let mut a = co.pop_string();
                    a.push_str(&b);
                    co.string_stack.push(a);
                    ExecResult::Continue
                }

                Opcode::IntToFloat => {
                    let v = co.pop_int();
                    co.float_stack.push(v as f32);
                    ExecResult::Continue
                }
                Opcode::FloatToInt => {
                    let v = co.pop_float();
                    co.int_stack.push(v as i32);
                    ExecResult::Continue
                }
                Opcode::IntToStr => {
                    let v = co.pop_int();
                    co.string_stack.push(v.to_string());
                    ExecResult::Continue
                }
                Opcode::FloatToStr => {
                    let v = co.pop_float();
                    co.string_stack.push(v.to_string());
                    ExecResult::Continue
                }

                Opcode::Jump => {
                    co.pc = jump_target(pc, inst.signed_value());
                    ExecResult::Continue
                }
                Opcode::JumpEq => {
                    let b = co.pop_int();
                    let a = co.pop_int();
                    if a == b {
                        co.pc = jump_target(pc, inst.signed_value());
                    }
                    ExecResult::Continue
                }
                Opcode::JumpNe => {
                    let b = co.pop_int();
                    let a = co.pop_int();
                    if a != b {
                        co.pc = jump_target(pc, inst.signed_value());
                    }
                    ExecResult::Continue
                }

                Opcode::Call => {
                    exec::call::enter(co, inst.value() as usize);
                    ExecResult::Continue
                }
                Opcode::AnonCall => {
                    let target = co.pop_int().max(0) as usize;
                    exec::call::enter(co, target);
                    ExecResult::Continue
                }
                Opcode::PrimitiveCall => self.primitive_call(co, bc, inst.value())?,
                Opcode::Return => match exec::call::ret(co) {
                    RetStep::Continue => ExecResult::Continue,
                    RetStep::Removed => ExecResult::Done,
                },

                Opcode::Task => {
                    exec::task::spawn_at(&mut self.scheduler, inst.value() as usize);
                    ExecResult::Continue
                }
                Opcode::AnonTask => {
                    let target = co.pop_int().max(0) as usize;
                    exec::task::spawn_at(&mut self.scheduler, target);
                    ExecResult::Continue
                }
                Opcode::Yield => ExecResult::Yield,
                Opcode::Kill => {
                    co.is_killed = true;
                    if exec::unwind::continue_kill(co) {
                        ExecResult::Done
                    } else {
                        ExecResult::Continue
                    }
                }
                Opcode::KillAll => {
                    debug!(by = co.id, "kill_all issued");
                    self.scheduler.kill_all();
                    co.is_killed = true;
                    co.is_panicking = false;
                    co.pending_unwind = true;
                    ExecResult::Yield
                }

                Opcode::GlobalPushInt => {
                    let n = inst.value() as usize;
                    let at = co.int_stack.len().saturating_sub(n);
                    for v in co.int_stack.split_off(at) {
                        self.state.mailbox.push_int(v);
                    }
                    ExecResult::Continue
                }
                Opcode::GlobalPushFloat => {
                    let n = inst.value() as usize;
                    let at = co.float_stack.len().saturating_sub(n);
                    for v in co.float_stack.split_off(at) {
                        self.state.mailbox.push_float(v);
                    }
                    ExecResult::Continue
                }
                Opcode::GlobalPushStr => {
                    let n = inst.value() as usize;
                    let at = co.string_stack.len().saturating_sub(n);
                    for v in co.string_stack.split_off(at) {
                        self.state.mailbox.push_string(v);
                    }
                    ExecResult::Continue
                }
                Opcode::GlobalPushObj => {
                    let n = inst.value() as usize;
                    let at = co.object_stack.len().saturating_sub(n);
                    for v in co.object_stack.split_off(at) {
                        self.state.mailbox.push_object(v);
                    }
                    ExecResult::Continue
                }
                Opcode::GlobalPopInt => {
                    co.int_stack.push(self.state.mailbox.pop_int().unwrap_or_default());
                    ExecResult::Continue
                }
                Opcode::GlobalPopFloat => {
                    co.float_stack.push(self.state.mailbox.pop_float().unwrap_or_default());
                    ExecResult::Continue
                }
                Opcode::GlobalPopStr => {
                    co.string_stack.push(self.state.mailbox.pop_string().unwrap_or_default());
                    ExecResult::Continue
                }
                Opcode::GlobalPopObj => {
                    co.object_stack.push(self.state.mailbox.pop_object().unwrap_or_default());
                    ExecResult::Continue
                }

                Opcode::NewChannel => {
                    let kind = Kind::from_u8(inst.v1()).unwrap_or(Kind::Int);
                    let cap = inst.v2() as usize;
                    let ch = Channel::new(kind, cap);
                    co.object_stack.push(Obj::Channel(Rc::new(RefCell::new(ch))));
                    ExecResult::Continue
                }
                Opcode::CloseChannel => {
                    let r = exec::chan::close(co);
                    self.script(co, bc, r)
                }
                Opcode::SendInt => self.chan_op(co, bc, Some(Kind::Int), pc),
                Opcode::SendFloat => self.chan_op(co, bc, Some(Kind::Float), pc),
                Opcode::SendStr => self.chan_op(co, bc, Some(Kind::Str), pc),
                Opcode::SendObj => self.chan_op(co, bc, Some(Kind::Obj), pc),
                Opcode::ReceiveInt
                | Opcode::ReceiveFloat
                | Opcode::ReceiveStr
                | Opcode::ReceiveObj => self.chan_op(co, bc, None, pc),

                Opcode::TryChannel => {
                    let r = exec::select::try_channel(co, pc, inst.signed_value());
                    self.script(co, bc, r)
                }
                Opcode::CheckChannel => {
                    exec::select::check(co);
                    ExecResult::Continue
                }
                Opcode::StartSelectChannel => {
                    exec::select::start(co);
                    ExecResult::Continue
                }
                Opcode::EndSelectChannel => {
                    exec::select::end(co);
                    ExecResult::Continue
                }

                Opcode::Raise => {
                    let msg = co.pop_string();
                    self.raise(co, bc, msg)
                }
                Opcode::Try => {
                    exec::unwind::do_try(co, pc, inst.signed_value());
                    ExecResult::Continue
                }
                Opcode::Catch => {
                    exec::unwind::do_catch(co, pc, inst.signed_value(), &mut self.state.mailbox);
                    ExecResult::Continue
                }
                Opcode::Defer => {
                    exec::unwind::do_defer(co, pc, inst.signed_value());
                    ExecResult::Continue
                }
                Opcode::Unwind => {
                    if co.is_panicking {
                        match exec::unwind::unwind_panic(co) {
                            Unwound::Continue => ExecResult::Continue,
                            Unwound::Escalate => self.escalate(co),
                        }
                    } else if co.is_killed {
                        if exec::unwind::continue_kill(co) {
                            ExecResult::Done
                        } else {
                            ExecResult::Continue
                        }
                    } else {
                        match exec::call::ret(co) {
                            RetStep::Continue => ExecResult::Continue,
                            RetStep::Removed => ExecResult::Done,
                        }
                    }
                }

                Opcode::ArrayInt => {
                    let arr = exec::array::build(&mut co.int_stack, inst.value() as usize);
                    co.object_stack.push(Obj::Ints(arr));
                    ExecResult::Continue
                }
                Opcode::ArrayFloat => {
                    let arr = exec::array::build(&mut co.float_stack, inst.value() as usize);
                    co.object_stack.push(Obj::Floats(arr));
                    ExecResult::Continue
                }
                Opcode::ArrayStr => {
                    let arr = exec::array::build(&mut co.string_stack, inst.value() as usize);
                    co.object_stack.push(Obj::Strs(arr));
                    ExecResult::Continue
                }
                Opcode::ArrayObj => {
                    let arr = exec::array::build(&mut co.object_stack, inst.value() as usize);
                    co.object_stack.push(Obj::Objs(arr));
                    ExecResult::Continue
                }
                Opcode::IndexInt => {
                    let r = exec::array::index_int(co, IndexMode::Ref);
                    self.script(co, bc, r)
                }
                Opcode::IndexFloat => {
                    let r = exec::array::index_float(co, IndexMode::Ref);
                    self.script(co, bc, r)
                }
                Opcode::IndexStr => {
                    let r = exec::array::index_str(co, IndexMode::Ref);
                    self.script(co, bc, r)
                }
                Opcode::IndexObj => {
                    let r = exec::array::index_obj(co, IndexMode::Ref);
                    self.script(co, bc, r)
                }
                Opcode::Index2Int => {
                    let r = exec::array::index_int(co, IndexMode::Value);
                    self.script(co, bc, r)
                }
                Opcode::Index2Float => {
                    let r = exec::array::index_float(co, IndexMode::Value);
                    self.script(co, bc, r)
                }
                Opcode::Index2Str => {
                    let r = exec::array::index_str(co, IndexMode::Value);
                    self.script(co, bc, r)
                }
                Opcode::Index2Obj => {
                    let r = exec::array::index_obj(co, IndexMode::Value);
                    self.script(co, bc, r)
                }
                Opcode::Index3Int => {
                    let r = exec::array::index_int(co, IndexMode::Both);
                    self.script(co, bc, r)
                }
                Opcode::Index3Float => {
                    let r = exec::array::index_float(co, IndexMode::Both);
                    self.script(co, bc, r)
                }
                Opcode::Index3Str => {
                    let r = exec::array::index_str(co, IndexMode::Both);
                    self.script(co, bc, r)
                }
                Opcode::Index3Obj => {
                    let r = exec::array::index_obj(co, IndexMode::Both);
                    self.script(co, bc, r)
                }
                Opcode::LengthInt => {
                    let r = exec::array::length_int(co);
                    self.script(co, bc, r)
                }
                Opcode::LengthFloat => {
                    let r = exec::array::length_float(co);
                    self.script(co, bc, r)
                }
                Opcode::LengthStr => {
                    let r = exec::array::length_str(co);
                    self.script(co, bc, r)
                }
                Opcode::LengthObj => {
                    let r = exec::array::length_obj(co);
                    self.script(co, bc, r)
                }
                Opcode::ConcatArrayInt => {
                    let r = exec::array::concat_int(co);
                    self.script(co, bc, r)
                }
                Opcode::ConcatArrayFloat => {
                    let r = exec::array::concat_float(co);
                    self.script(co, bc, r)
                }
                Opcode::ConcatArrayStr => {
                    let r = exec::array::concat_str(co);
                    self.script(co, bc, r)
                }
                Opcode::ConcatArrayObj => {
                    let r = exec::array::concat_obj(co);
                    self.script(co, bc, r)
                }
                Opcode::AppendInt => {
                    let r = exec::array::append_int(co);
                    self.script(co, bc, r)
                }
                Opcode::AppendFloat => {
                    let r = exec::array::append_float(co);
                    self.script(co, bc, r)
                }
                Opcode::AppendStr => {
                    let r = exec::array::append_str(co);
                    self.script(co, bc, r)
                }
                Opcode::AppendObj => {
                    let r = exec::array::append_obj(co);
                    self.script(co, bc, r)
                }
                Opcode::PrependInt => {
                    let r = exec::array::prepend_int(co);
                    self.script(co, bc, r)
                }
                Opcode::PrependFloat => {
                    let r = exec::array::prepend_float(co);
                    self.script(co, bc, r)
                }
                Opcode::PrependStr => {
                    let r = exec::array::prepend_str(co);
                    self.script(co, bc, r)
                }
                Opcode::PrependObj => {
                    let r = exec::array::prepend_obj(co);
                    self.script(co, bc, r)
                }
                Opcode::ArrayEqInt => {
                    let r = exec::array::array_eq_int(co);
                    self.script(co, bc, r)
                }
                Opcode::ArrayEqFloat => {
                    let r = exec::array::array_eq_float(co);
                    self.script(co, bc, r)
                }
                Opcode::ArrayEqStr => {
                    let r = exec::array::array_eq_str(co);
                    self.script(co, bc, r)
                }
                Opcode::ArrayEqObj => {
                    let r = exec::array::array_eq_obj(co);
                    self.script(co, bc, r)
                }

                Opcode::New => {
                    let idx = inst.value();
                    let class = bc
                        .classes
                        .get(idx as usize)
                        .ok_or(HostError::UnknownClass(idx))?;
                    let inst_obj = Instance::from_class(idx, class);
                    co.object_stack.push(Obj::Instance(Rc::new(RefCell::new(inst_obj))));
                    ExecResult::Continue
                }
                Opcode::FieldLoadInt => {
                    let r = exec::object::field_load_int(co, inst.value() as usize);
                    self.script(co, bc, r)
                }
                Opcode::FieldLoadFloat => {
                    let r = exec::object::field_load_float(co, inst.value() as usize);
                    self.script(co, bc, r)
                }
                Opcode::FieldLoadStr => {
                    let r = exec::object::field_load_str(co, inst.value() as usize);
                    self.script(co, bc, r)
                }
                Opcode::FieldLoadObj => {
                    let r = exec::object::field_load_obj(co, inst.value() as usize);
                    self.script(co, bc, r)
                }
                Opcode::FieldStoreInt => {
                    let r = exec::object::field_store_int(co, inst.value() as usize);
                    self.script(co, bc, r)
                }
                Opcode::FieldStoreFloat => {
                    let r = exec::object::field_store_float(co, inst.value() as usize);
                    self.script(co, bc, r)
                }
                Opcode::FieldStoreStr => {
                    let r = exec::object::field_store_str(co, inst.value() as usize);
                    self.script(co, bc, r)
                }
                Opcode::FieldStoreObj => {
                    let r = exec::object::field_store_obj(co, inst.value() as usize);
                    self.script(co, bc, r)
                }
                Opcode::RefStoreInt => {
                    let r = exec::object::ref_store_int(co);
                    self.script(co, bc, r)
                }
                Opcode::RefStoreFloat => {
                    let r = exec::object::ref_store_float(co);
                    self.script(co, bc, r)
                }
                Opcode::RefStoreStr => {
                    let r = exec::object::ref_store_str(co);
                    self.script(co, bc, r)
                }
                Opcode::RefStoreObj => {
                    let r = exec::object::ref_store_obj(co);
                    self.script(co, bc, r)
                }

                Opcode::Invalid => {
                    return Err(HostError::InvalidOpcode { opcode: inst.0 as u8, pc });
                }
            };

            match result {
                ExecResult::Continue => {}
                other => return Ok(other),
            }
        }
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}
