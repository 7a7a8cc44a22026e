//! The Grimoire bytecode virtual machine.
//!
//! A [`vm::Vm`] loads one immutable [`bytecode::Bytecode`] artifact and
//! runs any number of cooperative coroutines over it. The host drives the
//! scheduler one round at a time with [`vm::Vm::process`]; coroutines
//! suspend on `yield`, on channel operations that cannot proceed, and when
//! they finish or the VM panics. Exception unwinding, deferred blocks and
//! channel select are handled per-coroutine, see [`exec::unwind`] and
//! [`exec::select`].

pub mod channel;
pub mod coroutine;
pub mod exec;
pub mod host;
pub mod mailbox;
pub mod object;
pub mod scheduler;
pub mod trace;
pub mod vm;

// Re-export from grimoire-common so embedders need a single crate.
pub use grimoire_common::bytecode;
pub use grimoire_common::instruction;
pub use grimoire_common::serialize;

pub use host::{Call, HostError, Library};
pub use object::{Obj, Val};
pub use vm::Vm;
