//! Operand formats. Every instruction uses exactly one of these five shapes.
//!
//! <https://github.com/FuelLabs/fuel-vm> encodes a fixed 32-bit word per
//! instruction (`op:8, ra:6, rb:6, rc:6, rd:6, imm...`); this instruction set
//! instead keeps the opcode byte and format tag explicit in the stream (see
//! `etch_asm::codec` in the `etch-vm` crate) and varies the tail width by
//! format, since destination-heavy opcodes (`Call`) need more bits than simple
//! register moves.

use crate::types::{BuiltinId, ConstIdx, FuncIdx, Imm16, RegisterId, SImm16};

/// Which of the five operand shapes an instruction's tail is encoded in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum OperandFormat {
    /// Destination register `A` plus two operand registers `B`, `C`.
    Abc = 0,
    /// `A` plus an unsigned 16-bit immediate (constant index or packed small value).
    Abx = 1,
    /// `A` plus a signed 16-bit immediate (relative jump offset).
    AsBx = 2,
    /// A 32-bit payload packing several small operands.
    Ax = 3,
    /// `A` (result register) + 16-bit function index + 8-bit arg count + 8-bit result count.
    Call = 4,
}

impl OperandFormat {
    /// Width, in bytes, of the format-specific tail that follows `opcode, A, format`.
    pub const fn tail_len(self) -> usize {
        match self {
            OperandFormat::Abc => 2,
            OperandFormat::Abx => 2,
            OperandFormat::AsBx => 2,
            OperandFormat::Ax => 4,
            OperandFormat::Call => 4,
        }
    }

    /// Decode a format tag byte as read from the instruction stream.
    pub const fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(OperandFormat::Abc),
            1 => Some(OperandFormat::Abx),
            2 => Some(OperandFormat::AsBx),
            3 => Some(OperandFormat::Ax),
            4 => Some(OperandFormat::Call),
            _ => None,
        }
    }
}

/// `A`, `B`, `C` register triple. `B`/`C` are unused (0) when an opcode is unary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Abc {
    pub a: RegisterId,
    pub b: RegisterId,
    pub c: RegisterId,
}

/// `A` plus a 16-bit immediate, most often a constant-pool or field-name index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Abx {
    pub a: RegisterId,
    pub bx: Imm16,
}

impl Abx {
    pub const fn const_idx(self) -> ConstIdx {
        self.bx
    }
}

/// `A` plus a signed 16-bit relative jump offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AsBx {
    pub a: RegisterId,
    pub s_bx: SImm16,
}

/// Four packed 8-bit fields, or three 8-bit fields plus a 16-bit signed offset.
/// Interpreted per-opcode (see [`crate::instruction::Instruction`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Ax {
    pub raw: u32,
}

impl Ax {
    pub const fn from_fields4(a: u8, b: u8, c: u8, d: u8) -> Self {
        Ax {
            raw: (a as u32) << 24 | (b as u32) << 16 | (c as u32) << 8 | (d as u32),
        }
    }

    pub const fn fields4(self) -> (u8, u8, u8, u8) {
        (
            (self.raw >> 24) as u8,
            (self.raw >> 16) as u8,
            (self.raw >> 8) as u8,
            self.raw as u8,
        )
    }

    pub const fn from_fields_offset(a: u8, b: u8, s_offset: i16) -> Self {
        Ax {
            raw: (a as u32) << 24 | (b as u32) << 16 | (s_offset as u16 as u32),
        }
    }

    pub const fn fields_offset(self) -> (u8, u8, i16) {
        (
            (self.raw >> 24) as u8,
            (self.raw >> 16) as u8,
            self.raw as u16 as i16,
        )
    }
}

/// Call-family tail: callee index plus argument/result counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CallOperands {
    pub a: RegisterId,
    pub func_idx: FuncIdx,
    pub num_args: u8,
    pub num_results: u8,
}

impl CallOperands {
    pub const fn builtin_id(self) -> BuiltinId {
        self.func_idx
    }
}
