//! Runtime and load-time error types (`spec.md` §7).
//!
//! Mirrors the split in the teacher's own `error.rs`: a load-time error type
//! that's always fatal to the load that produced it, and a panic-reason
//! type for the handful of conditions the core treats as fatal assertions
//! rather than recoverable `Nil`/`Err` values.

use std::fmt;

/// Everything that can reject a program image at load time (`spec.md` §7
/// "Load errors (codec)").
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("bad magic bytes: expected \"ETCH\", found {0:?}")]
    BadMagic([u8; 4]),
    #[error("unknown VM type byte 0x{0:02x}")]
    UnknownVmType(u8),
    #[error("version mismatch: this build reads format {expected}, image is {found}")]
    VersionMismatch { expected: u32, found: u32 },
    #[error("corrupt constant tag 0x{0:02x}")]
    CorruptValueTag(u8),
    #[error("debug info count ({debug_count}) does not match instruction count ({instruction_count})")]
    DebugInfoCountMismatch { debug_count: u32, instruction_count: u32 },
    #[error("unexpected end of file while reading {0}")]
    Truncated(&'static str),
    #[error("instruction decode failed at offset {offset}: {source}")]
    Instruction { offset: usize, #[source] source: etch_asm::DecodeError },
    #[error("invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),
    #[error("unknown function kind byte 0x{0:02x}")]
    UnknownFunctionKind(u8),
}

/// Fatal conditions the dispatch loop raises instead of producing a `Nil`/
/// `Err` value (`spec.md` §7). These correspond to the teacher's
/// `PanicReason`: a small, `Copy`, `Display`-able enum, not a `std::error::Error`
/// chain, since panics carry no source error to wrap.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum Panic {
    #[display(fmt = "array index {index} out of bounds (len {len})")]
    ArrayIndexOutOfBounds { index: i64, len: usize },
    #[display(fmt = "string index {index} out of bounds (len {len})")]
    StringIndexOutOfBounds { index: i64, len: usize },
    #[display(fmt = "heap invariant violated: {0}")]
    HeapInvariant(String),
    #[display(fmt = "yield outside a coroutine context")]
    YieldOutsideCoroutine,
    #[display(fmt = "spawn requires a named function, not an anonymous block")]
    SpawnRequiresFunction,
    #[display(fmt = "defer stack underflow in ExecDefers/DeferEnd")]
    DeferStackUnderflow,
    #[display(fmt = "attempted to resume a coroutine that does not exist")]
    UnknownCoroutine,
    #[display(fmt = "aborted by debugger hook: {0}")]
    Aborted(String),
}

impl std::error::Error for Panic {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_display_is_human_readable() {
        let p = Panic::ArrayIndexOutOfBounds { index: -1, len: 3 };
        assert!(format!("{p}").contains("out of bounds"));
    }
}
