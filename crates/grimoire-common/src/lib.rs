//! Shared bytecode definitions for the Grimoire compiler and VM.
//!
//! The compiler produces a [`bytecode::Bytecode`] artifact; the VM consumes
//! it. This crate owns the artifact layout, the 32-bit instruction word
//! encoding and the binary image format, so both sides agree on them.

pub mod bytecode;
pub mod instruction;
pub mod serialize;

pub use bytecode::{Bytecode, Kind};
pub use instruction::{Instruction, Opcode};
