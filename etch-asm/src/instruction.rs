//! Typed instruction values and their byte encoding.
//!
//! Encoding mirrors `spec.md` §6.1 step 10: `opcode byte + A byte + format
//! byte + format-specific tail`. The `A` byte is redundant with the payload
//! structs below for `Call`-format instructions (which carry their own `a`
//! field) but is always present in the stream so a reader can skip an
//! instruction without knowing its opcode.

use crate::error::DecodeError;
use crate::opcode::Opcode;
use crate::operand::{Abc, Abx, AsBx, Ax, CallOperands, OperandFormat};

macro_rules! instruction_enum {
    ($($variant:ident ( $payload:ty ) = $opcode:expr),* $(,)?) => {
        /// A single decoded instruction. One variant per [`Opcode`].
        #[derive(Debug, Clone, Copy, PartialEq)]
        #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
        pub enum Instruction {
            $(
                #[allow(missing_docs)]
                $variant($payload),
            )*
        }

        impl Instruction {
            /// The opcode this instruction dispatches on.
            pub const fn opcode(&self) -> Opcode {
                match self {
                    $(Instruction::$variant(_) => $opcode,)*
                }
            }
        }
    };
}

instruction_enum! {
    Move(Abc) = Opcode::Move,
    LoadK(Abx) = Opcode::LoadK,
    LoadBool(Abc) = Opcode::LoadBool,
    LoadNil(Abc) = Opcode::LoadNil,

    GetGlobal(Abx) = Opcode::GetGlobal,
    SetGlobal(Abx) = Opcode::SetGlobal,
    InitGlobal(Abx) = Opcode::InitGlobal,

    Add(Abc) = Opcode::Add,
    AddInt(Abc) = Opcode::AddInt,
    AddFloat(Abc) = Opcode::AddFloat,
    AddI(Abc) = Opcode::AddI,
    Sub(Abc) = Opcode::Sub,
    SubInt(Abc) = Opcode::SubInt,
    SubFloat(Abc) = Opcode::SubFloat,
    SubI(Abc) = Opcode::SubI,
    Mul(Abc) = Opcode::Mul,
    MulInt(Abc) = Opcode::MulInt,
    MulFloat(Abc) = Opcode::MulFloat,
    MulI(Abc) = Opcode::MulI,
    Div(Abc) = Opcode::Div,
    DivInt(Abc) = Opcode::DivInt,
    DivFloat(Abc) = Opcode::DivFloat,
    Mod(Abc) = Opcode::Mod,
    ModInt(Abc) = Opcode::ModInt,
    ModFloat(Abc) = Opcode::ModFloat,
    Neg(Abc) = Opcode::Neg,

    MulAdd(Ax) = Opcode::MulAdd,
    AddAdd(Ax) = Opcode::AddAdd,

    Eq(Abc) = Opcode::Eq,
    Lt(Abc) = Opcode::Lt,
    Le(Abc) = Opcode::Le,
    EqStore(Abc) = Opcode::EqStore,
    LtStore(Abc) = Opcode::LtStore,
    LeStore(Abc) = Opcode::LeStore,
    EqI(Abc) = Opcode::EqI,
    LtI(Abc) = Opcode::LtI,
    LeI(Abc) = Opcode::LeI,
    LtJmp(Ax) = Opcode::LtJmp,
    CmpJmp(Ax) = Opcode::CmpJmp,

    Not(Abc) = Opcode::Not,
    And(Abc) = Opcode::And,
    Or(Abc) = Opcode::Or,
    AndI(Abc) = Opcode::AndI,
    OrI(Abc) = Opcode::OrI,
    In(Abc) = Opcode::In,
    NotIn(Abc) = Opcode::NotIn,

    WrapSome(Abc) = Opcode::WrapSome,
    LoadNone(Abc) = Opcode::LoadNone,
    WrapOk(Abc) = Opcode::WrapOk,
    WrapErr(Abc) = Opcode::WrapErr,
    TestTag(Abc) = Opcode::TestTag,
    UnwrapOption(Abc) = Opcode::UnwrapOption,
    UnwrapResult(Abc) = Opcode::UnwrapResult,

    NewArray(Abx) = Opcode::NewArray,
    GetIndex(Abc) = Opcode::GetIndex,
    SetIndex(Abc) = Opcode::SetIndex,
    GetIndexInt(Abc) = Opcode::GetIndexInt,
    SetIndexInt(Abc) = Opcode::SetIndexInt,
    GetIndexImm(Abc) = Opcode::GetIndexImm,
    SetIndexImm(Abc) = Opcode::SetIndexImm,
    Len(Abc) = Opcode::Len,
    Slice(Abc) = Opcode::Slice,
    ConcatArray(Abc) = Opcode::ConcatArray,
    NewTable(Abx) = Opcode::NewTable,
    GetField(Ax) = Opcode::GetField,
    SetField(Ax) = Opcode::SetField,
    SetRef(Abc) = Opcode::SetRef,

    NewRef(Abc) = Opcode::NewRef,
    IncRef(Abc) = Opcode::IncRef,
    DecRef(Abc) = Opcode::DecRef,
    NewWeak(Abc) = Opcode::NewWeak,
    WeakToStrong(Abc) = Opcode::WeakToStrong,
    CheckCycles(Abc) = Opcode::CheckCycles,

    Jmp(AsBx) = Opcode::Jmp,
    Test(Abc) = Opcode::Test,
    TestSet(Abc) = Opcode::TestSet,
    Return(Abc) = Opcode::Return,
    NoOp(Abc) = Opcode::NoOp,
    ForPrep(AsBx) = Opcode::ForPrep,
    ForLoop(AsBx) = Opcode::ForLoop,
    ForIntPrep(AsBx) = Opcode::ForIntPrep,
    ForIntLoop(AsBx) = Opcode::ForIntLoop,
    IncTest(Ax) = Opcode::IncTest,

    Arg(Abc) = Opcode::Arg,
    ArgImm(Abx) = Opcode::ArgImm,
    Call(CallOperands) = Opcode::Call,
    CallBuiltin(CallOperands) = Opcode::CallBuiltin,
    CallHost(CallOperands) = Opcode::CallHost,
    CallFFI(CallOperands) = Opcode::CallFFI,
    TailCall(CallOperands) = Opcode::TailCall,

    PushDefer(AsBx) = Opcode::PushDefer,
    ExecDefers(Abc) = Opcode::ExecDefers,
    DeferEnd(Abc) = Opcode::DeferEnd,

    Yield(Abc) = Opcode::Yield,
    Spawn(CallOperands) = Opcode::Spawn,
    Resume(Abc) = Opcode::Resume,
    ChannelNew(Abx) = Opcode::ChannelNew,
    ChannelSend(Abc) = Opcode::ChannelSend,
    ChannelRecv(Abc) = Opcode::ChannelRecv,
    ChannelClose(Abc) = Opcode::ChannelClose,

    Cast(Abc) = Opcode::Cast,
}

impl Instruction {
    /// The operand format this instruction's opcode is encoded with.
    pub const fn format(&self) -> OperandFormat {
        opcode_format(self.opcode())
    }

    /// The `A` register, for formats that carry one (everything but `Call`,
    /// which reports its own result register through [`CallOperands::a`]).
    pub const fn a(&self) -> u8 {
        match self.format() {
            OperandFormat::Abc => match self {
                Instruction::Move(o)
                | Instruction::LoadBool(o)
                | Instruction::LoadNil(o)
                | Instruction::Add(o)
                | Instruction::AddInt(o)
                | Instruction::AddFloat(o)
                | Instruction::AddI(o)
                | Instruction::Sub(o)
                | Instruction::SubInt(o)
                | Instruction::SubFloat(o)
                | Instruction::SubI(o)
                | Instruction::Mul(o)
                | Instruction::MulInt(o)
                | Instruction::MulFloat(o)
                | Instruction::MulI(o)
                | Instruction::Div(o)
                | Instruction::DivInt(o)
                | Instruction::DivFloat(o)
                | Instruction::Mod(o)
                | Instruction::ModInt(o)
                | Instruction::ModFloat(o)
                | Instruction::Neg(o)
                | Instruction::Eq(o)
                | Instruction::Lt(o)
                | Instruction::Le(o)
                | Instruction::EqStore(o)
                | Instruction::LtStore(o)
                | Instruction::LeStore(o)
                | Instruction::EqI(o)
                | Instruction::LtI(o)
                | Instruction::LeI(o)
                | Instruction::Not(o)
                | Instruction::And(o)
                | Instruction::Or(o)
                | Instruction::AndI(o)
                | Instruction::OrI(o)
                | Instruction::In(o)
                | Instruction::NotIn(o)
                | Instruction::WrapSome(o)
                | Instruction::LoadNone(o)
                | Instruction::WrapOk(o)
                | Instruction::WrapErr(o)
                | Instruction::TestTag(o)
                | Instruction::UnwrapOption(o)
                | Instruction::UnwrapResult(o)
                | Instruction::GetIndex(o)
                | Instruction::SetIndex(o)
                | Instruction::GetIndexInt(o)
                | Instruction::SetIndexInt(o)
                | Instruction::GetIndexImm(o)
                | Instruction::SetIndexImm(o)
                | Instruction::Len(o)
                | Instruction::Slice(o)
                | Instruction::ConcatArray(o)
                | Instruction::SetRef(o)
                | Instruction::NewRef(o)
                | Instruction::IncRef(o)
                | Instruction::DecRef(o)
                | Instruction::NewWeak(o)
                | Instruction::WeakToStrong(o)
                | Instruction::CheckCycles(o)
                | Instruction::Test(o)
                | Instruction::TestSet(o)
                | Instruction::Return(o)
                | Instruction::NoOp(o)
                | Instruction::Arg(o)
                | Instruction::Yield(o)
                | Instruction::Resume(o)
                | Instruction::ChannelSend(o)
                | Instruction::ChannelRecv(o)
                | Instruction::ChannelClose(o)
                | Instruction::Cast(o)
                | Instruction::ExecDefers(o)
                | Instruction::DeferEnd(o) => o.a,
                _ => 0,
            },
            OperandFormat::Abx => match self {
                Instruction::LoadK(o)
                | Instruction::GetGlobal(o)
                | Instruction::SetGlobal(o)
                | Instruction::InitGlobal(o)
                | Instruction::NewArray(o)
                | Instruction::NewTable(o)
                | Instruction::ArgImm(o)
                | Instruction::ChannelNew(o) => o.a,
                _ => 0,
            },
            OperandFormat::AsBx => match self {
                Instruction::Jmp(o)
                | Instruction::ForPrep(o)
                | Instruction::ForLoop(o)
                | Instruction::ForIntPrep(o)
                | Instruction::ForIntLoop(o)
                | Instruction::PushDefer(o) => o.a,
                _ => 0,
            },
            OperandFormat::Ax => match self {
                Instruction::MulAdd(o) | Instruction::AddAdd(o) | Instruction::IncTest(o) => {
                    o.fields4().0
                }
                Instruction::LtJmp(o) | Instruction::CmpJmp(o) => o.fields_offset().0,
                Instruction::GetField(o) | Instruction::SetField(o) => o.fields4().0,
                _ => 0,
            },
            OperandFormat::Call => match self {
                Instruction::Call(o)
                | Instruction::CallBuiltin(o)
                | Instruction::CallHost(o)
                | Instruction::CallFFI(o)
                | Instruction::TailCall(o)
                | Instruction::Spawn(o) => o.a,
                _ => 0,
            },
        }
    }

    /// Encode as `opcode, A, format, tail...`, per `spec.md` §6.1 step 10.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.opcode().to_byte());
        out.push(self.a());
        out.push(self.format() as u8);
        encode_tail(self, out);
    }

    /// Decode one instruction from the front of `buf`, returning the number
    /// of bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<(Instruction, usize), DecodeError> {
        if buf.len() < 3 {
            return Err(DecodeError::Truncated);
        }
        let op_byte = buf[0];
        let a = buf[1];
        let format =
            OperandFormat::from_tag(buf[2]).ok_or(DecodeError::UnknownFormat(buf[2]))?;
        let opcode = opcode_from_byte(op_byte).ok_or(DecodeError::UnknownOpcode(op_byte))?;
        if format != opcode_format(opcode) {
            return Err(DecodeError::FormatMismatch {
                opcode: op_byte,
                expected: opcode_format(opcode),
                found: format,
            });
        }
        let tail_len = format.tail_len();
        let tail = buf
            .get(3..3 + tail_len)
            .ok_or(DecodeError::Truncated)?;
        let instr = decode_tail(opcode, a, format, tail)?;
        Ok((instr, 3 + tail_len))
    }
}

/// Canonical opcode → format table. Every opcode has exactly one valid format.
pub const fn opcode_format(op: Opcode) -> OperandFormat {
    use Opcode::*;
    match op {
        Move | LoadBool | LoadNil | Add | AddInt | AddFloat | AddI | Sub | SubInt | SubFloat
        | SubI | Mul | MulInt | MulFloat | MulI | Div | DivInt | DivFloat | Mod | ModInt
        | ModFloat | Neg | Eq | Lt | Le | EqStore | LtStore | LeStore | EqI | LtI | LeI | Not
        | And | Or | AndI | OrI | In | NotIn | WrapSome | LoadNone | WrapOk | WrapErr | TestTag
        | UnwrapOption | UnwrapResult | GetIndex | SetIndex | GetIndexInt | SetIndexInt
        | GetIndexImm | SetIndexImm | Len | Slice | ConcatArray | SetRef | NewRef | IncRef
        | DecRef | NewWeak | WeakToStrong | CheckCycles | Test | TestSet | Return | NoOp | Arg
        | Yield | Resume | ChannelSend | ChannelRecv | ChannelClose | Cast | ExecDefers
        | DeferEnd => OperandFormat::Abc,

        LoadK | GetGlobal | SetGlobal | InitGlobal | NewArray | NewTable | ArgImm
        | ChannelNew => OperandFormat::Abx,

        Jmp | ForPrep | ForLoop | ForIntPrep | ForIntLoop | PushDefer => OperandFormat::AsBx,

        MulAdd | AddAdd | LtJmp | CmpJmp | IncTest | GetField | SetField => OperandFormat::Ax,

        Call | CallBuiltin | CallHost | CallFFI | TailCall | Spawn => OperandFormat::Call,
    }
}

const fn opcode_from_byte(b: u8) -> Option<Opcode> {
    use Opcode::*;
    // A linear scan is fine: this table is built once per decode and the
    // opcode space is small relative to a single cache line fetch.
    const TABLE: &[Opcode] = &[
        Move, LoadK, LoadBool, LoadNil, GetGlobal, SetGlobal, InitGlobal, Add, AddInt, AddFloat,
        AddI, Sub, SubInt, SubFloat, SubI, Mul, MulInt, MulFloat, MulI, Div, DivInt, DivFloat,
        Mod, ModInt, ModFloat, Neg, MulAdd, AddAdd, Eq, Lt, Le, EqStore, LtStore, LeStore, EqI,
        LtI, LeI, LtJmp, CmpJmp, Not, And, Or, AndI, OrI, In, NotIn, WrapSome, LoadNone, WrapOk,
        WrapErr, TestTag, UnwrapOption, UnwrapResult, NewArray, GetIndex, SetIndex, GetIndexInt,
        SetIndexInt, GetIndexImm, SetIndexImm, Len, Slice, ConcatArray, NewTable, GetField,
        SetField, SetRef, NewRef, IncRef, DecRef, NewWeak, WeakToStrong, CheckCycles, Jmp, Test,
        TestSet, Return, NoOp, ForPrep, ForLoop, ForIntPrep, ForIntLoop, IncTest, Arg, ArgImm,
        Call, CallBuiltin, CallHost, CallFFI, TailCall, PushDefer, ExecDefers, DeferEnd, Yield,
        Spawn, Resume, ChannelNew, ChannelSend, ChannelRecv, ChannelClose, Cast,
    ];
    let mut i = 0;
    while i < TABLE.len() {
        if TABLE[i] as u8 == b {
            return Some(TABLE[i]);
        }
        i += 1;
    }
    None
}

fn encode_tail(instr: &Instruction, out: &mut Vec<u8>) {
    match instr.format() {
        OperandFormat::Abc => {
            let (b, c) = abc_bc(instr);
            out.push(b);
            out.push(c);
        }
        OperandFormat::Abx => {
            out.extend_from_slice(&abx_bx(instr).to_le_bytes());
        }
        OperandFormat::AsBx => {
            out.extend_from_slice(&asbx_sbx(instr).to_le_bytes());
        }
        OperandFormat::Ax => {
            out.extend_from_slice(&ax_raw(instr).to_le_bytes());
        }
        OperandFormat::Call => {
            let c = call_operands(instr);
            out.extend_from_slice(&c.func_idx.to_le_bytes());
            out.push(c.num_args);
            out.push(c.num_results);
        }
    }
}

fn abc_bc(instr: &Instruction) -> (u8, u8) {
    macro_rules! bc {
        ($o:expr) => {
            ($o.b, $o.c)
        };
    }
    match instr {
        Instruction::Move(o)
        | Instruction::LoadBool(o)
        | Instruction::LoadNil(o)
        | Instruction::Add(o)
        | Instruction::AddInt(o)
        | Instruction::AddFloat(o)
        | Instruction::AddI(o)
        | Instruction::Sub(o)
        | Instruction::SubInt(o)
        | Instruction::SubFloat(o)
        | Instruction::SubI(o)
        | Instruction::Mul(o)
        | Instruction::MulInt(o)
        | Instruction::MulFloat(o)
        | Instruction::MulI(o)
        | Instruction::Div(o)
        | Instruction::DivInt(o)
        | Instruction::DivFloat(o)
        | Instruction::Mod(o)
        | Instruction::ModInt(o)
        | Instruction::ModFloat(o)
        | Instruction::Neg(o)
        | Instruction::Eq(o)
        | Instruction::Lt(o)
        | Instruction::Le(o)
        | Instruction::EqStore(o)
        | Instruction::LtStore(o)
        | Instruction::LeStore(o)
        | Instruction::EqI(o)
        | Instruction::LtI(o)
        | Instruction::LeI(o)
        | Instruction::Not(o)
        | Instruction::And(o)
        | Instruction::Or(o)
        | Instruction::AndI(o)
        | Instruction::OrI(o)
        | Instruction::In(o)
        | Instruction::NotIn(o)
        | Instruction::WrapSome(o)
        | Instruction::LoadNone(o)
        | Instruction::WrapOk(o)
        | Instruction::WrapErr(o)
        | Instruction::TestTag(o)
        | Instruction::UnwrapOption(o)
        | Instruction::UnwrapResult(o)
        | Instruction::GetIndex(o)
        | Instruction::SetIndex(o)
        | Instruction::GetIndexInt(o)
        | Instruction::SetIndexInt(o)
        | Instruction::GetIndexImm(o)
        | Instruction::SetIndexImm(o)
        | Instruction::Len(o)
        | Instruction::Slice(o)
        | Instruction::ConcatArray(o)
        | Instruction::SetRef(o)
        | Instruction::NewRef(o)
        | Instruction::IncRef(o)
        | Instruction::DecRef(o)
        | Instruction::NewWeak(o)
        | Instruction::WeakToStrong(o)
        | Instruction::CheckCycles(o)
        | Instruction::Test(o)
        | Instruction::TestSet(o)
        | Instruction::Return(o)
        | Instruction::NoOp(o)
        | Instruction::Arg(o)
        | Instruction::Yield(o)
        | Instruction::Resume(o)
        | Instruction::ChannelSend(o)
        | Instruction::ChannelRecv(o)
        | Instruction::ChannelClose(o)
        | Instruction::Cast(o)
        | Instruction::ExecDefers(o)
        | Instruction::DeferEnd(o) => bc!(o),
        _ => unreachable!("non-ABC instruction passed to abc_bc"),
    }
}

fn abx_bx(instr: &Instruction) -> u16 {
    match instr {
        Instruction::LoadK(o)
        | Instruction::GetGlobal(o)
        | Instruction::SetGlobal(o)
        | Instruction::InitGlobal(o)
        | Instruction::NewArray(o)
        | Instruction::NewTable(o)
        | Instruction::ArgImm(o)
        | Instruction::ChannelNew(o) => o.bx,
        _ => unreachable!("non-ABx instruction passed to abx_bx"),
    }
}

fn asbx_sbx(instr: &Instruction) -> i16 {
    match instr {
        Instruction::Jmp(o)
        | Instruction::ForPrep(o)
        | Instruction::ForLoop(o)
        | Instruction::ForIntPrep(o)
        | Instruction::ForIntLoop(o)
        | Instruction::PushDefer(o) => o.s_bx,
        _ => unreachable!("non-AsBx instruction passed to asbx_sbx"),
    }
}

fn ax_raw(instr: &Instruction) -> u32 {
    match instr {
        Instruction::MulAdd(o)
        | Instruction::AddAdd(o)
        | Instruction::LtJmp(o)
        | Instruction::CmpJmp(o)
        | Instruction::IncTest(o)
        | Instruction::GetField(o)
        | Instruction::SetField(o) => o.raw,
        _ => unreachable!("non-Ax instruction passed to ax_raw"),
    }
}

fn call_operands(instr: &Instruction) -> CallOperands {
    match instr {
        Instruction::Call(o)
        | Instruction::CallBuiltin(o)
        | Instruction::CallHost(o)
        | Instruction::CallFFI(o)
        | Instruction::TailCall(o)
        | Instruction::Spawn(o) => *o,
        _ => unreachable!("non-Call instruction passed to call_operands"),
    }
}

fn decode_tail(
    opcode: Opcode,
    a: u8,
    format: OperandFormat,
    tail: &[u8],
) -> Result<Instruction, DecodeError> {
    use Opcode::*;
    Ok(match format {
        OperandFormat::Abc => {
            let abc = Abc { a, b: tail[0], c: tail[1] };
            build_abc(opcode, abc)?
        }
        OperandFormat::Abx => {
            let bx = u16::from_le_bytes([tail[0], tail[1]]);
            build_abx(opcode, Abx { a, bx })?
        }
        OperandFormat::AsBx => {
            let s_bx = i16::from_le_bytes([tail[0], tail[1]]);
            build_asbx(opcode, AsBx { a, s_bx })?
        }
        OperandFormat::Ax => {
            let raw = u32::from_le_bytes([tail[0], tail[1], tail[2], tail[3]]);
            build_ax(opcode, Ax { raw })?
        }
        OperandFormat::Call => {
            let func_idx = u16::from_le_bytes([tail[0], tail[1]]);
            let call = CallOperands { a, func_idx, num_args: tail[2], num_results: tail[3] };
            build_call(opcode, call)?
        }
    })
}

fn build_abc(op: Opcode, o: Abc) -> Result<Instruction, DecodeError> {
    use Opcode::*;
    Ok(match op {
        Move => Instruction::Move(o),
        LoadBool => Instruction::LoadBool(o),
        LoadNil => Instruction::LoadNil(o),
        Add => Instruction::Add(o),
        AddInt => Instruction::AddInt(o),
        AddFloat => Instruction::AddFloat(o),
        AddI => Instruction::AddI(o),
        Sub => Instruction::Sub(o),
        SubInt => Instruction::SubInt(o),
        SubFloat => Instruction::SubFloat(o),
        SubI => Instruction::SubI(o),
        Mul => Instruction::Mul(o),
        MulInt => Instruction::MulInt(o),
        MulFloat => Instruction::MulFloat(o),
        MulI => Instruction::MulI(o),
        Div => Instruction::Div(o),
        DivInt => Instruction::DivInt(o),
        DivFloat => Instruction::DivFloat(o),
        Mod => Instruction::Mod(o),
        ModInt => Instruction::ModInt(o),
        ModFloat => Instruction::ModFloat(o),
        Neg => Instruction::Neg(o),
        Eq => Instruction::Eq(o),
        Lt => Instruction::Lt(o),
        Le => Instruction::Le(o),
        EqStore => Instruction::EqStore(o),
        LtStore => Instruction::LtStore(o),
        LeStore => Instruction::LeStore(o),
        EqI => Instruction::EqI(o),
        LtI => Instruction::LtI(o),
        LeI => Instruction::LeI(o),
        Not => Instruction::Not(o),
        And => Instruction::And(o),
        Or => Instruction::Or(o),
        AndI => Instruction::AndI(o),
        OrI => Instruction::OrI(o),
        In => Instruction::In(o),
        NotIn => Instruction::NotIn(o),
        WrapSome => Instruction::WrapSome(o),
        LoadNone => Instruction::LoadNone(o),
        WrapOk => Instruction::WrapOk(o),
        WrapErr => Instruction::WrapErr(o),
        TestTag => Instruction::TestTag(o),
        UnwrapOption => Instruction::UnwrapOption(o),
        UnwrapResult => Instruction::UnwrapResult(o),
        GetIndex => Instruction::GetIndex(o),
        SetIndex => Instruction::SetIndex(o),
        GetIndexInt => Instruction::GetIndexInt(o),
        SetIndexInt => Instruction::SetIndexInt(o),
        GetIndexImm => Instruction::GetIndexImm(o),
        SetIndexImm => Instruction::SetIndexImm(o),
        Len => Instruction::Len(o),
        Slice => Instruction::Slice(o),
        ConcatArray => Instruction::ConcatArray(o),
        SetRef => Instruction::SetRef(o),
        NewRef => Instruction::NewRef(o),
        IncRef => Instruction::IncRef(o),
        DecRef => Instruction::DecRef(o),
        NewWeak => Instruction::NewWeak(o),
        WeakToStrong => Instruction::WeakToStrong(o),
        CheckCycles => Instruction::CheckCycles(o),
        Test => Instruction::Test(o),
        TestSet => Instruction::TestSet(o),
        Return => Instruction::Return(o),
        NoOp => Instruction::NoOp(o),
        Arg => Instruction::Arg(o),
        Yield => Instruction::Yield(o),
        Resume => Instruction::Resume(o),
        ChannelSend => Instruction::ChannelSend(o),
        ChannelRecv => Instruction::ChannelRecv(o),
        ChannelClose => Instruction::ChannelClose(o),
        Cast => Instruction::Cast(o),
        ExecDefers => Instruction::ExecDefers(o),
        DeferEnd => Instruction::DeferEnd(o),
        _ => return Err(DecodeError::FormatMismatch { opcode: op as u8, expected: opcode_format(op), found: OperandFormat::Abc }),
    })
}

fn build_abx(op: Opcode, o: Abx) -> Result<Instruction, DecodeError> {
    use Opcode::*;
    Ok(match op {
        LoadK => Instruction::LoadK(o),
        GetGlobal => Instruction::GetGlobal(o),
        SetGlobal => Instruction::SetGlobal(o),
        InitGlobal => Instruction::InitGlobal(o),
        NewArray => Instruction::NewArray(o),
        NewTable => Instruction::NewTable(o),
        ArgImm => Instruction::ArgImm(o),
        ChannelNew => Instruction::ChannelNew(o),
        _ => return Err(DecodeError::FormatMismatch { opcode: op as u8, expected: opcode_format(op), found: OperandFormat::Abx }),
    })
}

fn build_asbx(op: Opcode, o: AsBx) -> Result<Instruction, DecodeError> {
    use Opcode::*;
    Ok(match op {
        Jmp => Instruction::Jmp(o),
        ForPrep => Instruction::ForPrep(o),
        ForLoop => Instruction::ForLoop(o),
        ForIntPrep => Instruction::ForIntPrep(o),
        ForIntLoop => Instruction::ForIntLoop(o),
        PushDefer => Instruction::PushDefer(o),
        _ => return Err(DecodeError::FormatMismatch { opcode: op as u8, expected: opcode_format(op), found: OperandFormat::AsBx }),
    })
}

fn build_ax(op: Opcode, o: Ax) -> Result<Instruction, DecodeError> {
    use Opcode::*;
    Ok(match op {
        MulAdd => Instruction::MulAdd(o),
        AddAdd => Instruction::AddAdd(o),
        LtJmp => Instruction::LtJmp(o),
        CmpJmp => Instruction::CmpJmp(o),
        IncTest => Instruction::IncTest(o),
        GetField => Instruction::GetField(o),
        SetField => Instruction::SetField(o),
        _ => return Err(DecodeError::FormatMismatch { opcode: op as u8, expected: opcode_format(op), found: OperandFormat::Ax }),
    })
}

fn build_call(op: Opcode, o: CallOperands) -> Result<Instruction, DecodeError> {
    use Opcode::*;
    Ok(match op {
        Call => Instruction::Call(o),
        CallBuiltin => Instruction::CallBuiltin(o),
        CallHost => Instruction::CallHost(o),
        CallFFI => Instruction::CallFFI(o),
        TailCall => Instruction::TailCall(o),
        Spawn => Instruction::Spawn(o),
        _ => return Err(DecodeError::FormatMismatch { opcode: op as u8, expected: opcode_format(op), found: OperandFormat::Call }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_abc() {
        let i = Instruction::AddInt(Abc { a: 2, b: 0, c: 1 });
        let mut buf = Vec::new();
        i.encode(&mut buf);
        assert_eq!(buf.len(), 5);
        let (decoded, len) = Instruction::decode(&buf).unwrap();
        assert_eq!(len, buf.len());
        assert_eq!(decoded, i);
    }

    #[test]
    fn round_trips_call() {
        let i = Instruction::Call(CallOperands { a: 3, func_idx: 7, num_args: 2, num_results: 1 });
        let mut buf = Vec::new();
        i.encode(&mut buf);
        assert_eq!(buf.len(), 7);
        let (decoded, len) = Instruction::decode(&buf).unwrap();
        assert_eq!(len, buf.len());
        assert_eq!(decoded, i);
    }

    #[test]
    fn round_trips_ax_fused_mul_add() {
        let i = Instruction::MulAdd(Ax::from_fields4(5, 0, 1, 2));
        let mut buf = Vec::new();
        i.encode(&mut buf);
        let (decoded, _) = Instruction::decode(&buf).unwrap();
        assert_eq!(decoded, i);
    }

    #[test]
    fn rejects_truncated_stream() {
        let buf = [Opcode::Add.to_byte(), 0];
        assert!(matches!(Instruction::decode(&buf), Err(DecodeError::Truncated)));
    }

    #[test]
    fn rejects_unknown_opcode() {
        let buf = [0xff, 0, 0, 0, 0];
        assert!(matches!(Instruction::decode(&buf), Err(DecodeError::UnknownOpcode(0xff))));
    }
}
