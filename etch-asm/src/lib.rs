//! Instruction set, operand encoding, and opcode table for the Etch register VM.
//!
//! This crate is the analogue of `fuel_asm` in this workspace's teacher: it
//! defines the atomic, dependency-free wire format the execution engine
//! (`etch-vm`) decodes and dispatches on. It has no notion of a running VM,
//! a heap, or a value — only of bytes and operand shapes.

#![warn(missing_docs)]
#![deny(unused_must_use)]

mod error;
mod instruction;
mod opcode;
mod operand;
mod types;

pub use error::DecodeError;
pub use instruction::{opcode_format, Instruction};
pub use opcode::Opcode;
pub use operand::{Abc, Abx, Ax, AsBx, CallOperands, OperandFormat};
pub use types::{BuiltinId, ConstIdx, FuncIdx, Imm16, Imm8, RegisterId, SImm16};

static_assertions::const_assert!(core::mem::size_of::<Instruction>() <= 16);
