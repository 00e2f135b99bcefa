//! Execution engine and managed heap for the Etch register VM.
//!
//! This crate is the analogue of `fuel-vm` in this workspace's teacher: it
//! takes the wire-level instruction set defined by [`etch_asm`] and gives it
//! somewhere to run — a tagged value model, a reference-counted heap with
//! cycle detection, a register-file call stack, cooperative coroutines, and
//! a binary codec for program images. Unlike the teacher, there is no
//! transaction/consensus layer here: `Vm::execute` just runs a program to
//! completion (or to a debugger pause) and returns an exit code.

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![deny(unused_must_use)]

mod arith;
mod builtins;
mod call;
mod cast;
mod channel;
mod codec;
mod config;
mod coroutine;
mod error;
mod frame;
mod globals;
mod heap;
mod hooks;
mod output;
mod program;
mod value;
mod vm;

pub use call::{ArgQueue, HostContext, HostFn, HostRegistry, PortableValue};
pub use channel::{Channel, ChannelTable, RecvOutcome, SendOutcome};
pub use codec::{load, load_header, save, Header, FLAG_DEBUG, FLAG_VERBOSE};
pub use config::{GcMode, VmConfig};
pub use coroutine::{Coroutine, CoroutineState, CoroutineTable};
pub use error::{LoadError, Panic};
pub use frame::{Frame, FramePool};
pub use globals::Globals;
pub use heap::{CycleScan, CycleStats, FrameBudget, Heap, PendingFree};
pub use hooks::{Debugger, HookAction, Hooks, Profiler, ReplaySource, Tracer};
pub use output::OutputBuffer;
pub use program::{DebugInfo, FunctionEntry, FunctionKind, FunctionLifetime, LiveRange, Program};
pub use value::{ChannelId, CoroutineId, EtchString, HeapId, Value, ValueTag};
pub use vm::Vm;

/// Reserved builtin ids and the pure helpers they dispatch to (`spec.md` §6.3).
pub mod builtin {
    pub use crate::builtins::{
        array_new, deref, is_err, is_none, is_ok, is_some, new_ref, parse_bool, parse_float,
        parse_int, stringify, Builtin,
    };
}

/// Value arithmetic, comparison, and cast helpers (`spec.md` §4.A, §4.D).
pub mod ops {
    pub use crate::arith::{add, array_contains, div, eq, le, lt, mul, neg, rem, sub};
    pub use crate::cast::cast;
}
