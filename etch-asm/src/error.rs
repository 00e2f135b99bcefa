//! Decode-time errors. These are always fatal to the load that produced them
//! (see `spec.md` §7, "Load errors (codec)").

use crate::operand::OperandFormat;

/// Everything that can go wrong turning bytes back into an [`Instruction`](crate::Instruction).
#[derive(Debug, thiserror::Error, PartialEq, Eq, Clone, Copy)]
pub enum DecodeError {
    /// Fewer bytes remained than the format's tail requires.
    #[error("instruction stream truncated")]
    Truncated,
    /// The opcode byte doesn't name any known [`Opcode`](crate::Opcode).
    #[error("unknown opcode byte 0x{0:02x}")]
    UnknownOpcode(u8),
    /// The format byte isn't one of the five known tags.
    #[error("unknown operand format byte 0x{0:02x}")]
    UnknownFormat(u8),
    /// The stream claims a format other than the opcode's canonical one.
    #[error("opcode 0x{opcode:02x} expects format {expected:?}, stream says {found:?}")]
    FormatMismatch {
        opcode: u8,
        expected: OperandFormat,
        found: OperandFormat,
    },
}
