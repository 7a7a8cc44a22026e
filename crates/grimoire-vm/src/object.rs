//! Runtime value containers.
//!
//! The object stack holds [`Obj`] cells: typed arrays, class instances,
//! channels, write-through slot references and opaque host handles. All
//! containers are VM-owned and shared through `Rc`; the VM is
//! single-threaded, so `RefCell` gives interior mutability without locks.

use std::cell::RefCell;
use std::ffi::c_void;
use std::rc::Rc;

use grimoire_common::bytecode::{ClassDef, Kind};

use crate::channel::Channel;

pub type ArrRef<T> = Rc<RefCell<Vec<T>>>;
pub type InstanceRef = Rc<RefCell<Instance>>;
pub type ChannelRef = Rc<RefCell<Channel>>;

/// One cell of the object stack / object locals / object globals.
#[derive(Debug, Clone, Default)]
pub enum Obj {
    #[default]
    Null,
    Ints(ArrRef<i32>),
    Floats(ArrRef<f32>),
    Strs(ArrRef<String>),
    Objs(ArrRef<Obj>),
    Instance(InstanceRef),
    Channel(ChannelRef),
    Slot(SlotRef),
    /// Opaque host pointer, set and read only through the host bridge.
    Host(*mut c_void),
}

impl Obj {
    pub fn ints(values: Vec<i32>) -> Self {
        Obj::Ints(Rc::new(RefCell::new(values)))
    }

    pub fn floats(values: Vec<f32>) -> Self {
        Obj::Floats(Rc::new(RefCell::new(values)))
    }

    pub fn strs(values: Vec<String>) -> Self {
        Obj::Strs(Rc::new(RefCell::new(values)))
    }

    pub fn objs(values: Vec<Obj>) -> Self {
        Obj::Objs(Rc::new(RefCell::new(values)))
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Obj::Null)
    }

    /// Reference equality: two cells are equal when they point at the same
    /// container (or are both null / the same host pointer).
    pub fn ref_eq(&self, other: &Obj) -> bool {
        match (self, other) {
            (Obj::Null, Obj::Null) => true,
            (Obj::Ints(a), Obj::Ints(b)) => Rc::ptr_eq(a, b),
            (Obj::Floats(a), Obj::Floats(b)) => Rc::ptr_eq(a, b),
            (Obj::Strs(a), Obj::Strs(b)) => Rc::ptr_eq(a, b),
            (Obj::Objs(a), Obj::Objs(b)) => Rc::ptr_eq(a, b),
            (Obj::Instance(a), Obj::Instance(b)) => Rc::ptr_eq(a, b),
            (Obj::Channel(a), Obj::Channel(b)) => Rc::ptr_eq(a, b),
            (Obj::Host(a), Obj::Host(b)) => a == b,
            _ => false,
        }
    }
}

/// A single value crossing a typed boundary: channel elements, mailbox
/// entries and primitive arguments.
#[derive(Debug, Clone)]
pub enum Val {
    Int(i32),
    Float(f32),
    Str(String),
    Obj(Obj),
}

impl Val {
    pub fn kind(&self) -> Kind {
        match self {
            Val::Int(_) => Kind::Int,
            Val::Float(_) => Kind::Float,
            Val::Str(_) => Kind::Str,
            Val::Obj(_) => Kind::Obj,
        }
    }

    pub fn default_for(kind: Kind) -> Val {
        match kind {
            Kind::Int => Val::Int(0),
            Kind::Float => Val::Float(0.0),
            Kind::Str => Val::Str(String::new()),
            Kind::Obj => Val::Obj(Obj::Null),
        }
    }
}

/// Class instance with fields partitioned by kind; the field index in a
/// field opcode is positional within that kind.
#[derive(Debug, Clone, Default)]
pub struct Instance {
    pub class: u32,
    pub ints: Vec<i32>,
    pub floats: Vec<f32>,
    pub strs: Vec<String>,
    pub objs: Vec<Obj>,
}

impl Instance {
    /// Allocate an instance with every field default-initialized for its
    /// declared kind.
    pub fn from_class(class_idx: u32, class: &ClassDef) -> Self {
        Self {
            class: class_idx,
            ints: vec![0; class.field_count(Kind::Int)],
            floats: vec![0.0; class.field_count(Kind::Float)],
            strs: vec![String::new(); class.field_count(Kind::Str)],
            objs: vec![Obj::Null; class.field_count(Kind::Obj)],
        }
    }
}

/// Write-through reference to one array slot, produced by the index
/// opcodes and consumed by `refStore`.
#[derive(Debug, Clone)]
pub enum SlotRef {
    Int(ArrRef<i32>, usize),
    Float(ArrRef<f32>, usize),
    Str(ArrRef<String>, usize),
    Obj(ArrRef<Obj>, usize),
}

/// Structural equality for object arrays: element-wise reference equality.
pub fn obj_array_eq(a: &[Obj], b: &[Obj]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.ref_eq(y))
}
