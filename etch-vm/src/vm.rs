//! The fetch-decode-execute loop and call protocol (`spec.md` §4.G, §4.H).
//!
//! `Vm` owns every runtime structure and drives them through one
//! instruction at a time, the way the teacher's `Interpreter::execute`
//! drives its own opcode match — except this loop runs to completion inline
//! rather than yielding control back to a surrounding transaction executor.

use std::any::Any;

use etch_asm::{FuncIdx, Instruction, RegisterId};

use crate::builtins::Builtin;
use crate::call::{ArgQueue, HostContext, HostRegistry, PortableValue};
use crate::channel::{ChannelTable, RecvOutcome, SendOutcome};
use crate::config::{GcMode, VmConfig};
use crate::coroutine::{Coroutine, CoroutineState, CoroutineTable};
use crate::error::Panic;
use crate::frame::{Frame, FramePool};
use crate::globals::Globals;
use crate::heap::{FrameBudget, Heap, PendingFree};
use crate::hooks::{HookAction, Hooks};
use crate::output::OutputBuffer;
use crate::program::{FunctionKind, Program};
use crate::value::{CoroutineId, HeapId, Value, ValueTag};

/// What happened on the last [`Vm::step`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepOutcome {
    Continue,
    /// A debugger hook asked to pause; the instruction that triggered it has
    /// not executed (its pc is rewound so the next `step` retries it).
    Paused,
}

/// The running VM: program image, heap, call stack, and every auxiliary
/// table the instruction set reaches into (`spec.md` §6.2).
pub struct Vm {
    program: Program,
    heap: Heap,
    frame_pool: FramePool,
    frames: Vec<Frame>,
    globals: Globals,
    arg_queue: ArgQueue,
    output: OutputBuffer,
    coroutines: CoroutineTable,
    channels: ChannelTable,
    hosts: HostRegistry,
    gc_mode: GcMode,
    hooks: Hooks,
    host_user_data: Box<dyn Any>,
    /// `(coroutine id, call-stack depth before it was pushed)`, set only
    /// while a `Resume` mini-loop is driving that coroutine's own immediate
    /// frame. `Yield`/blocking channel ops are only legal while this frame
    /// is the top of the stack (`spec.md` §4.I simplification recorded in
    /// `DESIGN.md`: a coroutine can't yield through a nested native call).
    active_coroutine: Option<(CoroutineId, usize)>,
    rng_state: u64,
    exit_code: i64,
}

impl Vm {
    /// The only way to build a `Vm` (`spec.md` §6.2): no builder, no partial
    /// construction.
    pub fn new(program: Program, config: VmConfig, host_fns: HostRegistry) -> Self {
        Vm {
            program,
            heap: Heap::new(),
            frame_pool: FramePool::new(),
            frames: Vec::new(),
            globals: Globals::new(),
            arg_queue: ArgQueue::new(),
            output: OutputBuffer::new(config.output_flush_threshold),
            coroutines: CoroutineTable::new(),
            channels: ChannelTable::new(),
            hosts: host_fns,
            gc_mode: config.gc_mode,
            hooks: config.hooks,
            host_user_data: Box::new(()),
            active_coroutine: None,
            rng_state: 0x9e3779b97f4a7c15,
            exit_code: 0,
        }
    }

    pub fn output(&self) -> &[u8] {
        self.output.flushed()
    }

    pub fn globals(&self) -> &Globals {
        &self.globals
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    fn entry_max_register(&self) -> usize {
        self.program
            .functions
            .iter()
            .find_map(|f| match &f.kind {
                FunctionKind::Native { start_pc, max_register, .. }
                    if *start_pc == self.program.entry_point =>
                {
                    Some(*max_register as usize)
                }
                _ => None,
            })
            .unwrap_or(16)
    }

    /// Runs the program's entry point to completion (or until a debugger
    /// hook pauses it), flushing output before returning.
    pub fn execute(&mut self) -> i64 {
        let max_register = self.entry_max_register();
        let mut frame = self.frame_pool.take(max_register);
        frame.pc = self.program.entry_point;
        frame.result_register = None;
        self.frames.push(frame);
        self.drive_to_exhaustion();
        self.output.flush();
        self.exit_code
    }

    /// Resumes a run previously stopped by a debugger `Pause`.
    pub fn continue_after_pause(&mut self) -> i64 {
        self.drive_to_exhaustion();
        self.output.flush();
        self.exit_code
    }

    fn drive_to_exhaustion(&mut self) {
        loop {
            if self.frames.is_empty() {
                break;
            }
            match self.step() {
                Ok(StepOutcome::Continue) => {}
                Ok(StepOutcome::Paused) => break,
                Err(panic) => {
                    tracing::warn!(%panic, "vm halted on panic");
                    self.exit_code = -1;
                    self.frames.clear();
                    break;
                }
            }
        }
    }

    fn cur_frame(&self) -> &Frame {
        self.frames.last().expect("no active frame")
    }

    fn cur_frame_mut(&mut self) -> &mut Frame {
        self.frames.last_mut().expect("no active frame")
    }

    fn fetch(&mut self) -> (u32, Instruction) {
        let frame = self.cur_frame_mut();
        let pc = frame.pc;
        frame.pc += 1;
        (pc, *self.program.instruction(pc))
    }

    /// One instruction, honoring debugger hooks. Used only by the top-level
    /// driving loop; nested synchronous sub-runs (destructors, defer
    /// chains, coroutine resume) use [`Vm::step_inner`] instead, since a
    /// debugger pause mid-destructor has nowhere sensible to suspend to.
    fn step(&mut self) -> Result<StepOutcome, Panic> {
        let (pc, instr) = self.fetch();
        match self.hooks.before_instruction(pc, &instr) {
            HookAction::Abort(msg) => return Err(Panic::Aborted(msg)),
            HookAction::Pause => {
                self.cur_frame_mut().pc = pc;
                return Ok(StepOutcome::Paused);
            }
            HookAction::Continue => {}
        }
        tracing::trace!(pc, ?instr, "dispatch");
        self.dispatch(pc, instr)?;
        self.maybe_scan_cycles();
        Ok(StepOutcome::Continue)
    }

    /// Runs instructions, ignoring debugger hooks, until the call stack
    /// drops back to `depth`. Used for destructor invocation, defer
    /// draining, and the `Resume` mini-loop — all of which must run to a
    /// well-defined stopping point, not an interactive one.
    fn run_to_depth(&mut self, depth: usize) -> Result<(), Panic> {
        while self.frames.len() > depth {
            let (pc, instr) = self.fetch();
            self.dispatch(pc, instr)?;
        }
        Ok(())
    }

    fn maybe_scan_cycles(&mut self) {
        match self.gc_mode {
            GcMode::Eager => {
                if self.heap.record_op() {
                    let roots = self.collect_roots();
                    let scan = self.heap.begin_cycle_scan(false);
                    let mut scan = scan;
                    self.heap.run_slice(&mut scan, None);
                    let found = !scan.sccs_is_empty();
                    let stats = self.heap.sweep_cycles(scan, &roots);
                    self.heap.on_scan_result(found || stats.components_found > 0);
                }
            }
            GcMode::FrameBudgeted { budget_us } => {
                if self.heap.record_op() {
                    let roots = self.collect_roots();
                    let budget = FrameBudget::new(budget_us);
                    let mut scan = self.heap.begin_cycle_scan(false);
                    self.heap.run_slice(&mut scan, Some(&budget));
                    if !scan.in_progress {
                        let stats = self.heap.sweep_cycles(scan, &roots);
                        self.heap.on_scan_result(stats.components_found > 0);
                    }
                }
            }
        }
    }

    fn collect_roots(&self) -> Vec<HeapId> {
        let mut roots = Vec::new();
        for frame in &self.frames {
            for v in &frame.registers {
                if let Some(id) = v.heap_id() {
                    roots.push(id);
                }
            }
        }
        for co in self.coroutines.iter() {
            for v in &co.frame.registers {
                if let Some(id) = v.heap_id() {
                    roots.push(id);
                }
            }
        }
        for v in self.globals.values() {
            if let Some(id) = v.heap_id() {
                roots.push(id);
            }
        }
        roots
    }

    fn dispatch(&mut self, pc: u32, instr: Instruction) -> Result<(), Panic> {
        use Instruction as I;
        match instr {
            I::Move(o) => {
                let v = self.cur_frame().get(o.b);
                self.cur_frame_mut().set(o.a, v);
            }
            I::LoadK(o) => {
                let v = self.program.constant(o.const_idx()).clone();
                self.cur_frame_mut().set(o.a, v);
            }
            I::LoadBool(o) => self.cur_frame_mut().set(o.a, Value::Bool(o.b != 0)),
            I::LoadNil(o) => self.cur_frame_mut().set(o.a, Value::Nil),

            I::GetGlobal(o) => {
                let name = self.const_name(o.const_idx());
                let v = self.globals.get(&name);
                self.cur_frame_mut().set(o.a, v);
            }
            I::SetGlobal(o) => {
                let name = self.const_name(o.const_idx());
                let v = self.cur_frame().get(o.a);
                let hook = self.hooks.on_global_write(&name, &v);
                if let HookAction::Abort(msg) = hook {
                    return Err(Panic::Aborted(msg));
                }
                self.globals.set(name, v);
            }
            I::InitGlobal(o) => {
                let name = self.const_name(o.const_idx());
                let v = self.cur_frame().get(o.a);
                self.globals.init(name, v);
            }

            I::Add(o) | I::AddInt(o) | I::AddFloat(o) => {
                let v = self.add_values(self.cur_frame().get(o.b), self.cur_frame().get(o.c));
                self.cur_frame_mut().set(o.a, v);
            }
            I::Sub(o) | I::SubInt(o) | I::SubFloat(o) => self.binop(o, crate::arith::sub),
            I::Mul(o) | I::MulInt(o) | I::MulFloat(o) => self.binop(o, crate::arith::mul),
            I::Div(o) | I::DivInt(o) | I::DivFloat(o) => self.binop(o, crate::arith::div),
            I::Mod(o) | I::ModInt(o) | I::ModFloat(o) => self.binop(o, crate::arith::rem),
            I::Neg(o) => {
                let v = crate::arith::neg(&self.cur_frame().get(o.b));
                self.cur_frame_mut().set(o.a, v);
            }
            I::AddI(o) => self.imm_binop(o, crate::arith::add),
            I::SubI(o) => self.imm_binop(o, crate::arith::sub),
            I::MulI(o) => self.imm_binop(o, crate::arith::mul),

            I::MulAdd(o) => {
                let (a, b, c, _d) = o.fields4();
                let acc = self.cur_frame().get(a);
                let product = crate::arith::mul(&self.cur_frame().get(b), &self.cur_frame().get(c));
                self.cur_frame_mut().set(a, crate::arith::add(&acc, &product));
            }
            I::AddAdd(o) => {
                let (a, b, c, d) = o.fields4();
                let sum = crate::arith::add(
                    &crate::arith::add(&self.cur_frame().get(b), &self.cur_frame().get(c)),
                    &self.cur_frame().get(d),
                );
                self.cur_frame_mut().set(a, sum);
            }

            I::Eq(o) => {
                let predicate = self.values_eq(&self.cur_frame().get(o.b), &self.cur_frame().get(o.c));
                let skip = if o.a == 0 { predicate } else { !predicate };
                if skip {
                    self.skip_next();
                }
            }
            I::Lt(o) => self.skip_cmp(pc, o, crate::arith::lt),
            I::Le(o) => self.skip_cmp(pc, o, crate::arith::le),
            I::EqStore(o) => {
                let v = Value::Bool(self.values_eq(&self.cur_frame().get(o.b), &self.cur_frame().get(o.c)));
                self.cur_frame_mut().set(o.a, v);
            }
            I::LtStore(o) => self.store_cmp(o, crate::arith::lt),
            I::LeStore(o) => self.store_cmp(o, crate::arith::le),
            I::EqI(o) => {
                let v = Value::Bool(self.values_eq(&self.cur_frame().get(o.b), &Value::Int(o.c as i8 as i64)));
                self.cur_frame_mut().set(o.a, v);
            }
            I::LtI(o) => self.imm_cmp(o, crate::arith::lt),
            I::LeI(o) => self.imm_cmp(o, crate::arith::le),
            I::LtJmp(o) => {
                let (a, b, s_bx) = o.fields_offset();
                if crate::arith::lt(&self.cur_frame().get(a), &self.cur_frame().get(b)) {
                    self.jump_from(s_bx);
                }
            }
            I::CmpJmp(o) => {
                let (a, b, kind, _d) = o.fields4();
                let lhs = self.cur_frame().get(a);
                let rhs = self.cur_frame().get(b);
                let hit = match kind {
                    0 => self.values_eq(&lhs, &rhs),
                    1 => !self.values_eq(&lhs, &rhs),
                    2 => crate::arith::lt(&lhs, &rhs),
                    3 => crate::arith::le(&lhs, &rhs),
                    4 => !crate::arith::le(&lhs, &rhs),
                    5 => !crate::arith::lt(&lhs, &rhs),
                    _ => false,
                };
                if hit {
                    self.skip_next();
                }
            }

            I::Not(o) => {
                let v = Value::Bool(!self.cur_frame().get(o.b).is_truthy());
                self.cur_frame_mut().set(o.a, v);
            }
            I::And(o) => {
                let v = Value::Bool(self.cur_frame().get(o.b).is_truthy() && self.cur_frame().get(o.c).is_truthy());
                self.cur_frame_mut().set(o.a, v);
            }
            I::Or(o) => {
                let v = Value::Bool(self.cur_frame().get(o.b).is_truthy() || self.cur_frame().get(o.c).is_truthy());
                self.cur_frame_mut().set(o.a, v);
            }
            I::AndI(o) => {
                let v = Value::Bool(self.cur_frame().get(o.b).is_truthy() && o.c != 0);
                self.cur_frame_mut().set(o.a, v);
            }
            I::OrI(o) => {
                let v = Value::Bool(self.cur_frame().get(o.b).is_truthy() || o.c != 0);
                self.cur_frame_mut().set(o.a, v);
            }
            I::In(o) => {
                let v = Value::Bool(self.container_has(o.c, o.b));
                self.cur_frame_mut().set(o.a, v);
            }
            I::NotIn(o) => {
                let v = Value::Bool(!self.container_has(o.c, o.b));
                self.cur_frame_mut().set(o.a, v);
            }

            I::WrapSome(o) => {
                let v = Value::Some(Box::new(self.cur_frame().get(o.b)));
                self.cur_frame_mut().set(o.a, v);
            }
            I::LoadNone(o) => self.cur_frame_mut().set(o.a, Value::None),
            I::WrapOk(o) => {
                let v = Value::Ok(Box::new(self.cur_frame().get(o.b)));
                self.cur_frame_mut().set(o.a, v);
            }
            I::WrapErr(o) => {
                let v = Value::Err(Box::new(self.cur_frame().get(o.b)));
                self.cur_frame_mut().set(o.a, v);
            }
            I::TestTag(o) => {
                let want = ValueTag::from_u8(o.c);
                let is_match = want.is_some_and(|tag| self.cur_frame().get(o.b).tag() == tag);
                let skip = if o.a == 0 { is_match } else { !is_match };
                if skip {
                    self.skip_next();
                }
            }
            I::UnwrapOption(o) => {
                let v = match self.cur_frame().get(o.b) {
                    Value::Some(inner) => *inner,
                    _ => Value::Nil,
                };
                self.cur_frame_mut().set(o.a, v);
            }
            I::UnwrapResult(o) => {
                let v = match self.cur_frame().get(o.b) {
                    Value::Ok(inner) | Value::Err(inner) => *inner,
                    _ => Value::Nil,
                };
                self.cur_frame_mut().set(o.a, v);
            }

            I::NewArray(o) => {
                let id = self.heap.alloc_array(o.bx as usize);
                self.cur_frame_mut().set(o.a, Value::Array(id));
            }
            I::GetIndex(o) | I::GetIndexInt(o) => {
                let idx = self.cur_frame().get(o.c);
                let v = self.array_get(o.b, idx)?;
                self.cur_frame_mut().set(o.a, v);
            }
            I::SetIndex(o) | I::SetIndexInt(o) => {
                let idx = self.cur_frame().get(o.c);
                let v = self.cur_frame().get(o.a);
                self.array_set(o.b, idx, v)?;
            }
            I::GetIndexImm(o) => {
                let v = self.array_get(o.b, Value::Int(o.c as i64))?;
                self.cur_frame_mut().set(o.a, v);
            }
            I::SetIndexImm(o) => {
                let v = self.cur_frame().get(o.a);
                self.array_set(o.b, Value::Int(o.c as i64), v)?;
            }
            I::Len(o) => {
                let v = match self.cur_frame().get(o.b) {
                    Value::Array(id) => Value::Int(self.heap.array_len(id) as i64),
                    Value::String(s) => Value::Int(s.len() as i64),
                    _ => Value::Int(0),
                };
                self.cur_frame_mut().set(o.a, v);
            }
            I::Slice(o) => {
                let start = match self.cur_frame().get(o.c) {
                    Value::Int(i) => i.max(0) as usize,
                    _ => 0,
                };
                let items = match self.cur_frame().get(o.b) {
                    Value::Array(id) => self.heap.array_items(id),
                    _ => Vec::new(),
                };
                let sliced = items.into_iter().skip(start).collect::<Vec<_>>();
                let id = self.alloc_array_from(sliced);
                self.cur_frame_mut().set(o.a, Value::Array(id));
            }
            I::ConcatArray(o) => {
                let mut items = match self.cur_frame().get(o.b) {
                    Value::Array(id) => self.heap.array_items(id),
                    _ => Vec::new(),
                };
                let mut rhs = match self.cur_frame().get(o.c) {
                    Value::Array(id) => self.heap.array_items(id),
                    _ => Vec::new(),
                };
                items.append(&mut rhs);
                let id = self.alloc_array_from(items);
                self.cur_frame_mut().set(o.a, Value::Array(id));
            }
            I::NewTable(o) => {
                let destructor = if o.bx == u16::MAX { None } else { Some(o.bx as FuncIdx) };
                let id = self.heap.alloc_table(destructor);
                self.cur_frame_mut().set(o.a, Value::Table(id));
            }
            I::GetField(o) => {
                let (a, b, c, d) = o.fields4();
                let name = self.const_name(field_idx(c, d));
                let v = match self.cur_frame().get(b) {
                    Value::Table(id) => self.heap.get_table_field(id, &name),
                    _ => Value::Nil,
                };
                self.cur_frame_mut().set(a, v);
            }
            I::SetField(o) => {
                let (a, b, c, d) = o.fields4();
                let name = self.const_name(field_idx(c, d));
                let v = self.cur_frame().get(b);
                if let Value::Table(id) = self.cur_frame().get(a) {
                    if let Some(pf) = self.heap.set_table_field(id, name.into(), v) {
                        self.drain_pending_free(pf)?;
                    }
                }
            }
            I::SetRef(o) => {
                let v = self.cur_frame().get(o.b);
                if let Value::Ref(id) = self.cur_frame().get(o.a) {
                    if let Some(pf) = self.heap.set_ref_cell(id, v) {
                        self.drain_pending_free(pf)?;
                    }
                }
            }

            I::NewRef(o) => {
                let v = match o.c {
                    0 => {
                        let destructor = match self.cur_frame().get(o.b) {
                            Value::Int(i) if i >= 0 => Some(i as FuncIdx),
                            _ => None,
                        };
                        Value::Table(self.heap.alloc_table(destructor))
                    }
                    2 => {
                        let n = match self.cur_frame().get(o.b) {
                            Value::Int(i) => i.max(0) as usize,
                            _ => 0,
                        };
                        Value::Array(self.heap.alloc_array(n))
                    }
                    _ => {
                        let init = self.cur_frame().get(o.b);
                        Value::Ref(self.heap.alloc_ref_cell(init))
                    }
                };
                self.cur_frame_mut().set(o.a, v);
            }
            I::IncRef(o) => self.do_inc_ref(self.cur_frame().get(o.a)),
            I::DecRef(o) => {
                let v = self.cur_frame().get(o.a);
                self.do_dec_ref(v)?;
            }
            I::NewWeak(o) => {
                let target = self.cur_frame().get(o.b);
                let id = self.heap.alloc_weak(&target);
                self.cur_frame_mut().set(o.a, Value::Weak(id));
            }
            I::WeakToStrong(o) => {
                let weak_id = match self.cur_frame().get(o.b) {
                    Value::Weak(id) => id,
                    _ => 0,
                };
                let promoted = self.heap.weak_to_strong(weak_id);
                let v = if promoted == 0 {
                    Value::Nil
                } else {
                    let kind = self.heap.weak_kind(weak_id).unwrap_or(ValueTag::Ref);
                    Heap::value_for(kind, promoted)
                };
                self.cur_frame_mut().set(o.a, v);
            }
            I::CheckCycles(o) => {
                let force_full = o.b != 0;
                let roots = self.collect_roots();
                let mut scan = self.heap.begin_cycle_scan(force_full);
                self.heap.run_slice(&mut scan, None);
                self.heap.sweep_cycles(scan, &roots);
            }

            I::Jmp(o) => self.jump_from(o.s_bx),
            I::Test(o) => {
                let want = o.a != 0;
                if self.cur_frame().get(o.b).is_truthy() != want {
                    self.skip_next();
                }
            }
            I::TestSet(o) => {
                let want = o.c != 0;
                let b = self.cur_frame().get(o.b);
                if b.is_truthy() == want {
                    self.cur_frame_mut().set(o.a, b);
                } else {
                    self.skip_next();
                }
            }
            I::Return(o) => self.do_return(o.a),
            I::NoOp(_) => {}
            I::ForPrep(o) => self.for_prep(o, false),
            I::ForLoop(o) => self.for_loop(o, false),
            I::ForIntPrep(o) => self.for_prep(o, true),
            I::ForIntLoop(o) => self.for_loop(o, true),
            I::IncTest(o) => {
                let (a, b, s_bx) = o.fields_offset();
                let next = match self.cur_frame().get(a) {
                    Value::Int(i) => i + 1,
                    _ => 1,
                };
                self.cur_frame_mut().set(a, Value::Int(next));
                let bound = match self.cur_frame().get(b) {
                    Value::Int(i) => i,
                    _ => 0,
                };
                if next < bound {
                    self.jump_from(s_bx);
                }
            }

            I::Arg(o) => {
                let v = self.cur_frame().get(o.a);
                self.arg_queue.push(v);
            }
            I::ArgImm(o) => {
                let v = self.program.constant(o.const_idx()).clone();
                self.arg_queue.push(v);
            }
            I::Call(o) => self.do_call(o.a, o.func_idx, o.num_args, o.num_results, false)?,
            I::TailCall(o) => self.do_call(o.a, o.func_idx, o.num_args, o.num_results, true)?,
            I::CallHost(o) => self.do_call_host(o.a, o.func_idx, o.num_args, o.num_results)?,
            I::CallFFI(o) => {
                tracing::warn!(func_idx = o.func_idx, "CFFI calls are not resolved by this build");
                self.arg_queue.take(o.num_args as usize);
                self.cur_frame_mut().set(o.a, Value::Nil);
            }
            I::CallBuiltin(o) => self.do_call_builtin(o.a, o.func_idx, o.num_args)?,

            I::PushDefer(o) => {
                let body_pc = (self.cur_frame().pc as i64 + o.s_bx as i64) as u32;
                self.cur_frame_mut().push_defer(body_pc);
            }
            I::ExecDefers(_) => {
                if let Some(body_pc) = self.cur_frame_mut().pop_defer() {
                    let resume_pc = self.cur_frame().pc;
                    let frame = self.cur_frame_mut();
                    frame.defer_return_pc = Some(resume_pc);
                    frame.pc = body_pc;
                }
            }
            I::DeferEnd(_) => {
                if let Some(next) = self.cur_frame_mut().pop_defer() {
                    self.cur_frame_mut().pc = next;
                } else if let Some(resume) = self.cur_frame_mut().defer_return_pc.take() {
                    self.cur_frame_mut().pc = resume;
                } else {
                    self.do_return(0);
                }
            }

            I::Yield(o) => {
                let v = self.cur_frame().get(o.a);
                self.do_yield(v)?;
            }
            I::Spawn(o) => self.do_spawn(o.a, o.func_idx, o.num_args)?,
            I::Resume(o) => self.do_resume(o.a, o.b)?,
            I::ChannelNew(o) => {
                let id = self.channels.new_channel(o.bx as usize);
                self.cur_frame_mut().set(o.a, Value::Channel(id));
            }
            I::ChannelSend(o) => self.do_channel_send(o.a, o.b, o.c)?,
            I::ChannelRecv(o) => self.do_channel_recv(o.a, o.b)?,
            I::ChannelClose(o) => {
                if let Value::Channel(id) = self.cur_frame().get(o.a) {
                    if let Some(chan) = self.channels.get_mut(id) {
                        chan.close();
                    }
                }
            }

            I::Cast(o) => {
                let dest = ValueTag::from_u8(o.c).unwrap_or(ValueTag::Nil);
                let v = crate::cast::cast(&self.cur_frame().get(o.b), dest);
                self.cur_frame_mut().set(o.a, v);
            }
        }
        Ok(())
    }

    fn const_name(&self, idx: u16) -> crate::value::EtchString {
        match self.program.constant(idx) {
            Value::String(s) => s.clone(),
            Value::TypeDesc(s) => s.clone(),
            _ => {
                tracing::warn!(idx, "constant used as a name is not a string");
                "".into()
            }
        }
    }

    fn binop(&mut self, o: etch_asm::Abc, f: fn(&Value, &Value) -> Value) {
        let v = f(&self.cur_frame().get(o.b), &self.cur_frame().get(o.c));
        self.cur_frame_mut().set(o.a, v);
    }

    /// `Add`'s heap-aware variant: `crate::arith::add` has no heap access, so
    /// the array `+` concatenation case (`spec.md` §4.A) is handled here,
    /// the same way `ConcatArray` builds its result array.
    fn add_values(&mut self, a: Value, b: Value) -> Value {
        match (&a, &b) {
            (Value::Array(lhs), Value::Array(rhs)) => {
                let mut items = self.heap.array_items(*lhs);
                let mut rhs_items = self.heap.array_items(*rhs);
                items.append(&mut rhs_items);
                let id = self.alloc_array_from(items);
                Value::Array(id)
            }
            _ => crate::arith::add(&a, &b),
        }
    }

    fn imm_binop(&mut self, o: etch_asm::Abc, f: fn(&Value, &Value) -> Value) {
        let v = f(&self.cur_frame().get(o.b), &Value::Int(o.c as i8 as i64));
        self.cur_frame_mut().set(o.a, v);
    }

    fn imm_cmp(&mut self, o: etch_asm::Abc, f: fn(&Value, &Value) -> bool) {
        let v = Value::Bool(f(&self.cur_frame().get(o.b), &Value::Int(o.c as i8 as i64)));
        self.cur_frame_mut().set(o.a, v);
    }

    fn store_cmp(&mut self, o: etch_asm::Abc, f: fn(&Value, &Value) -> bool) {
        let v = Value::Bool(f(&self.cur_frame().get(o.b), &self.cur_frame().get(o.c)));
        self.cur_frame_mut().set(o.a, v);
    }

    /// `Eq`-family equality, heap-aware for the one case [`crate::arith::eq`]
    /// can't see on its own: a `Weak` whose target has since been freed
    /// compares equal to `Nil`/`None` (`spec.md` §8 invariant 3 and its
    /// weak-reference-nullification scenario). Everything else delegates
    /// straight to [`crate::arith::eq`].
    fn values_eq(&self, a: &Value, b: &Value) -> bool {
        match (a, b) {
            (Value::Weak(id), Value::Nil | Value::None) | (Value::Nil | Value::None, Value::Weak(id)) => {
                self.heap.weak_is_nullified(*id)
            }
            _ => crate::arith::eq(a, b),
        }
    }

    /// Skip-style comparison: `a` is the polarity (0 = skip-if-true), `b`/`c`
    /// the operand registers. A hit skips exactly the next instruction,
    /// typically a compiler-emitted `Jmp`.
    fn skip_cmp(&mut self, _pc: u32, o: etch_asm::Abc, f: fn(&Value, &Value) -> bool) {
        let predicate = f(&self.cur_frame().get(o.b), &self.cur_frame().get(o.c));
        let skip = if o.a == 0 { predicate } else { !predicate };
        if skip {
            self.skip_next();
        }
    }

    fn skip_next(&mut self) {
        self.cur_frame_mut().pc += 1;
    }

    /// `pc` is instruction-index based (`Program::instruction` indexes
    /// directly into the decoded vector), so jump targets are just index
    /// arithmetic relative to the instruction after the jump.
    fn jump_from(&mut self, s_bx: i16) {
        let frame = self.cur_frame_mut();
        frame.pc = (frame.pc as i64 + s_bx as i64) as u32;
    }

    fn container_has(&self, container_reg: RegisterId, needle_reg: RegisterId) -> bool {
        let needle = self.cur_frame().get(needle_reg);
        match self.cur_frame().get(container_reg) {
            Value::Array(id) => self.heap.array_contains(id, &needle),
            Value::Table(id) => match &needle {
                Value::String(s) => self.heap.table_has_key(id, s),
                _ => false,
            },
            _ => false,
        }
    }

    fn array_get(&self, array_reg: RegisterId, idx: Value) -> Result<Value, Panic> {
        let Value::Int(i) = idx else { return Ok(Value::Nil) };
        match self.cur_frame().get(array_reg) {
            Value::Array(id) => {
                let len = self.heap.array_len(id);
                if i < 0 || i as usize >= len {
                    return Err(Panic::ArrayIndexOutOfBounds { index: i, len });
                }
                Ok(self.heap.get_array_index(id, i as usize).unwrap_or(Value::Nil))
            }
            Value::String(s) => {
                if i < 0 || i as usize >= s.len() {
                    return Err(Panic::StringIndexOutOfBounds { index: i, len: s.len() });
                }
                Ok(Value::Char(s.as_bytes()[i as usize]))
            }
            _ => Ok(Value::Nil),
        }
    }

    fn array_set(&mut self, array_reg: RegisterId, idx: Value, v: Value) -> Result<(), Panic> {
        let Value::Int(i) = idx else { return Ok(()) };
        if let Value::Array(id) = self.cur_frame().get(array_reg) {
            let len = self.heap.array_len(id);
            if i < 0 || i as usize >= len {
                return Err(Panic::ArrayIndexOutOfBounds { index: i, len });
            }
            if let Some(pf) = self.heap.set_array_index(id, i as usize, v) {
                self.drain_pending_free(pf)?;
            }
        }
        Ok(())
    }

    fn alloc_array_from(&mut self, items: Vec<Value>) -> HeapId {
        let id = self.heap.alloc_array(items.len());
        for (i, v) in items.into_iter().enumerate() {
            self.heap.set_array_index(id, i, v);
        }
        id
    }

    /// Lua-style numeric `for`: registers `a`(counter), `a+1`(limit),
    /// `a+2`(step), `a+3`(visible loop variable). `ForPrep` normalizes the
    /// counter once and jumps straight to the matching `ForLoop`'s bound
    /// check, so a zero-iteration loop never enters its body.
    fn for_prep(&mut self, o: etch_asm::AsBx, int_fast_path: bool) {
        let counter = self.cur_frame().get(o.a);
        let step = self.cur_frame().get(o.a + 2);
        let adjusted = if int_fast_path {
            match (counter, step) {
                (Value::Int(c), Value::Int(s)) => Value::Int(c - s),
                _ => Value::Int(0),
            }
        } else {
            crate::arith::sub(&counter, &step)
        };
        self.cur_frame_mut().set(o.a, adjusted);
        self.jump_from(o.s_bx);
    }

    fn for_loop(&mut self, o: etch_asm::AsBx, int_fast_path: bool) {
        let counter = self.cur_frame().get(o.a);
        let limit = self.cur_frame().get(o.a + 1);
        let step = self.cur_frame().get(o.a + 2);
        let next = if int_fast_path {
            match (counter, step) {
                (Value::Int(c), Value::Int(s)) => Value::Int(c + s),
                _ => Value::Int(0),
            }
        } else {
            crate::arith::add(&counter, &step)
        };
        let step_positive = match step {
            Value::Int(s) => s >= 0,
            Value::Float(s) => s >= 0.0,
            _ => true,
        };
        let continues = if step_positive { crate::arith::le(&next, &limit) } else { crate::arith::le(&limit, &next) };
        self.cur_frame_mut().set(o.a, next.clone());
        if continues {
            self.cur_frame_mut().set(o.a + 3, next);
            self.jump_from(o.s_bx);
        }
    }

    // --- reference counting / destructors -------------------------------

    fn do_inc_ref(&mut self, v: Value) {
        match v {
            Value::Table(id) | Value::Array(id) | Value::Ref(id) | Value::Closure(id) => self.heap.inc_ref(id),
            Value::Coroutine(id) => self.coroutines.inc_ref(id),
            _ => {}
        }
    }

    fn do_dec_ref(&mut self, v: Value) -> Result<(), Panic> {
        match v {
            Value::Table(id) | Value::Array(id) | Value::Ref(id) | Value::Closure(id) => {
                if let Some(pf) = self.heap.dec_ref(id) {
                    self.drain_pending_free(pf)?;
                }
            }
            Value::Coroutine(id) => {
                if let Some(co) = self.coroutines.dec_ref(id) {
                    self.run_abandoned_coroutine_defers(co)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn drain_pending_free(&mut self, first: PendingFree) -> Result<(), Panic> {
        let mut worklist = vec![first];
        while let Some(pf) = worklist.pop() {
            if let Some(func_idx) = pf.destructor {
                self.run_function_to_completion(func_idx, vec![Value::Table(pf.id)])?;
            }
            worklist.extend(self.heap.finish_free(pf.id));
        }
        Ok(())
    }

    /// Pushes a fresh native frame, runs it to completion, and discards its
    /// result — used for destructors, which are invoked for their effects.
    fn run_function_to_completion(&mut self, func_idx: FuncIdx, args: Vec<Value>) -> Result<(), Panic> {
        let entry = self.program.function(func_idx).clone();
        let FunctionKind::Native { start_pc, max_register, .. } = entry.kind else {
            tracing::warn!(func_idx, "destructor target is not a native function; skipping");
            return Ok(());
        };
        let mut frame = self.frame_pool.take(max_register as usize);
        for (i, v) in args.into_iter().enumerate() {
            frame.set(i as RegisterId, v);
        }
        frame.pc = start_pc;
        frame.result_register = None;
        let depth_before = self.frames.len();
        self.frames.push(frame);
        self.run_to_depth(depth_before)
    }

    /// Runs a just-abandoned coroutine's remaining defers, in its own
    /// frame (preserving captured register state), then discards it —
    /// there is no caller left to resume.
    fn run_abandoned_coroutine_defers(&mut self, mut co: Coroutine) -> Result<(), Panic> {
        let Some(first_pc) = co.frame.pop_defer() else { return Ok(()) };
        co.frame.pc = first_pc;
        co.frame.result_register = None;
        co.frame.defer_return_pc = None;
        let depth_before = self.frames.len();
        self.frames.push(co.frame);
        self.run_to_depth(depth_before)
    }

    // --- call protocol ---------------------------------------------------

    fn do_return(&mut self, a: RegisterId) {
        let ret_val = self.cur_frame().get(a);
        let popped = self.frames.pop().expect("Return with no active frame");
        if let Some((id, base_depth)) = self.active_coroutine {
            if self.frames.len() == base_depth {
                if let Some(co) = self.coroutines.get_mut(id) {
                    co.final_return = ret_val;
                    co.state = CoroutineState::Completed;
                }
                self.frame_pool.recycle(popped);
                return;
            }
        }
        if let Some(caller) = self.frames.last_mut() {
            if let Some(reg) = popped.result_register {
                caller.set(reg, ret_val);
            }
        } else {
            self.exit_code = match ret_val {
                Value::Int(i) => i,
                _ => 0,
            };
        }
        self.frame_pool.recycle(popped);
    }

    fn do_call(&mut self, a: RegisterId, func_idx: FuncIdx, num_args: u8, num_results: u8, tail: bool) -> Result<(), Panic> {
        let entry = self.program.function(func_idx).clone();
        match entry.kind {
            FunctionKind::Native { start_pc, max_register, .. } => {
                let args = self.arg_queue.take(num_args as usize);
                if tail {
                    let frame = self.cur_frame_mut();
                    frame.registers.clear();
                    frame.registers.resize(max_register as usize, Value::Nil);
                    for (i, v) in args.into_iter().enumerate() {
                        frame.set(i as RegisterId, v);
                    }
                    frame.pc = start_pc;
                    frame.defer_stack.clear();
                    frame.defer_return_pc = None;
                } else {
                    let mut frame = self.frame_pool.take(max_register as usize);
                    for (i, v) in args.into_iter().enumerate() {
                        frame.set(i as RegisterId, v);
                    }
                    frame.pc = start_pc;
                    frame.result_register = if num_results > 0 { Some(a) } else { None };
                    self.hooks.on_call_enter(&entry.name, start_pc);
                    self.frames.push(frame);
                }
            }
            FunctionKind::Builtin { builtin_id } => self.do_call_builtin(a, builtin_id, num_args)?,
            FunctionKind::Host => self.do_call_host(a, func_idx, num_args, num_results)?,
            FunctionKind::CffiSym { .. } => {
                tracing::warn!(func_idx, "CFFI calls are not resolved by this build");
                self.arg_queue.take(num_args as usize);
                self.cur_frame_mut().set(a, Value::Nil);
            }
        }
        Ok(())
    }

    fn do_call_host(&mut self, a: RegisterId, func_idx: FuncIdx, num_args: u8, _num_results: u8) -> Result<(), Panic> {
        let entry = self.program.function(func_idx).clone();
        let args = self.arg_queue.take(num_args as usize);
        let portable: Vec<PortableValue> = args.iter().map(PortableValue::from_value).collect();
        let result = match self.hosts.get(&entry.name) {
            Some(f) => {
                let mut ctx = HostContext { user_data: self.host_user_data.as_mut() };
                f(&mut ctx, &portable).into_value()
            }
            None => {
                tracing::warn!(name = %entry.name, "unregistered host function");
                Value::Nil
            }
        };
        self.cur_frame_mut().set(a, result);
        Ok(())
    }

    fn do_call_builtin(&mut self, a: RegisterId, builtin_id: u16, num_args: u8) -> Result<(), Panic> {
        let Some(builtin) = Builtin::from_id(builtin_id) else {
            tracing::warn!(builtin_id, "unknown builtin id");
            self.cur_frame_mut().set(a, Value::Nil);
            return Ok(());
        };
        match builtin {
            Builtin::Print => {
                let args = self.arg_queue.take(num_args as usize);
                for v in &args {
                    let s = crate::builtins::stringify(v);
                    self.output.append(s.as_bytes(), &mut self.hooks);
                }
                self.output.append(b"\n", &mut self.hooks);
                self.cur_frame_mut().set(a, Value::Nil);
            }
            Builtin::New => {
                let mut args = self.arg_queue.take(num_args.max(1) as usize);
                let v = args.pop().unwrap_or(Value::Nil);
                let v = crate::builtins::new_ref(&mut self.heap, v);
                self.cur_frame_mut().set(a, v);
            }
            Builtin::Deref => {
                let mut args = self.arg_queue.take(num_args.max(1) as usize);
                let v = args.pop().unwrap_or(Value::Nil);
                let v = crate::builtins::deref(&self.heap, &v);
                self.cur_frame_mut().set(a, v);
            }
            Builtin::Seed => {
                let mut args = self.arg_queue.take(num_args.max(1) as usize);
                let seed = match args.pop() {
                    Some(Value::Int(i)) => i as u64,
                    _ => 0,
                };
                self.rng_state = seed | 1;
                self.cur_frame_mut().set(a, Value::Nil);
            }
            Builtin::Rand => {
                self.arg_queue.take(num_args as usize);
                self.rng_state ^= self.rng_state << 13;
                self.rng_state ^= self.rng_state >> 7;
                self.rng_state ^= self.rng_state << 17;
                let unit = (self.rng_state >> 11) as f64 / (1u64 << 53) as f64;
                self.cur_frame_mut().set(a, Value::Float(unit));
            }
            Builtin::ArrayNew => {
                let mut args = self.arg_queue.take(num_args.max(1) as usize);
                let size = match args.pop() {
                    Some(Value::Int(i)) => i,
                    _ => 0,
                };
                let v = crate::builtins::array_new(&mut self.heap, size);
                self.cur_frame_mut().set(a, v);
            }
            Builtin::ReadFile => {
                let mut args = self.arg_queue.take(num_args.max(1) as usize);
                let v = match args.pop() {
                    Some(Value::String(path)) => match std::fs::read_to_string(path.as_ref()) {
                        Ok(contents) => Value::Some(Box::new(Value::String(contents.into()))),
                        Err(_) => Value::None,
                    },
                    _ => Value::None,
                };
                self.cur_frame_mut().set(a, v);
            }
            Builtin::ParseInt | Builtin::ParseFloat | Builtin::ParseBool => {
                let mut args = self.arg_queue.take(num_args.max(1) as usize);
                let arg = args.pop().unwrap_or(Value::Nil);
                let v = match builtin {
                    Builtin::ParseInt => crate::builtins::parse_int(&arg),
                    Builtin::ParseFloat => crate::builtins::parse_float(&arg),
                    _ => crate::builtins::parse_bool(&arg),
                };
                self.cur_frame_mut().set(a, v);
            }
            Builtin::IsSome | Builtin::IsNone | Builtin::IsOk | Builtin::IsErr => {
                let mut args = self.arg_queue.take(num_args.max(1) as usize);
                let arg = args.pop().unwrap_or(Value::Nil);
                let v = match builtin {
                    Builtin::IsSome => crate::builtins::is_some(&arg),
                    Builtin::IsNone => crate::builtins::is_none(&arg),
                    Builtin::IsOk => crate::builtins::is_ok(&arg),
                    _ => crate::builtins::is_err(&arg),
                };
                self.cur_frame_mut().set(a, v);
            }
            Builtin::MakeClosure => {
                let mut args = self.arg_queue.take(num_args as usize);
                if args.is_empty() {
                    self.cur_frame_mut().set(a, Value::Nil);
                    return Ok(());
                }
                let func_idx = match args.remove(0) {
                    Value::Int(i) if i >= 0 => i as FuncIdx,
                    _ => {
                        self.cur_frame_mut().set(a, Value::Nil);
                        return Ok(());
                    }
                };
                let id = self.heap.alloc_closure(func_idx, args);
                self.cur_frame_mut().set(a, Value::Closure(id));
            }
            Builtin::InvokeClosure => {
                let mut args = self.arg_queue.take(num_args as usize);
                if args.is_empty() {
                    self.cur_frame_mut().set(a, Value::Nil);
                    return Ok(());
                }
                let Value::Closure(cid) = args.remove(0) else {
                    self.cur_frame_mut().set(a, Value::Nil);
                    return Ok(());
                };
                let Some(func_idx) = self.heap.closure_func_idx(cid) else {
                    self.cur_frame_mut().set(a, Value::Nil);
                    return Ok(());
                };
                let captures = self.heap.closure_captures(cid).to_vec();
                let entry = self.program.function(func_idx).clone();
                let FunctionKind::Native { start_pc, max_register, .. } = entry.kind else {
                    self.cur_frame_mut().set(a, Value::Nil);
                    return Ok(());
                };
                let mut frame = self.frame_pool.take(max_register as usize);
                let mut i: RegisterId = 0;
                for v in captures.into_iter().chain(args) {
                    frame.set(i, v);
                    i += 1;
                }
                frame.pc = start_pc;
                frame.result_register = Some(a);
                self.frames.push(frame);
            }
        }
        Ok(())
    }

    // --- coroutines --------------------------------------------------------

    fn do_spawn(&mut self, a: RegisterId, func_idx: FuncIdx, num_args: u8) -> Result<(), Panic> {
        let entry = self.program.function(func_idx).clone();
        let FunctionKind::Native { start_pc, max_register, .. } = entry.kind else {
            return Err(Panic::SpawnRequiresFunction);
        };
        let args = self.arg_queue.take(num_args as usize);
        let mut frame = self.frame_pool.take(max_register as usize);
        for (i, v) in args.into_iter().enumerate() {
            frame.set(i as RegisterId, v);
        }
        frame.pc = start_pc;
        let parent = self.active_coroutine.map(|(id, _)| id);
        let id = self.coroutines.spawn(func_idx, frame, parent);
        self.cur_frame_mut().set(a, Value::Coroutine(id));
        Ok(())
    }

    fn do_yield(&mut self, value: Value) -> Result<(), Panic> {
        let (id, base_depth) = self.active_coroutine.ok_or(Panic::YieldOutsideCoroutine)?;
        if self.frames.len() != base_depth + 1 {
            return Err(Panic::YieldOutsideCoroutine);
        }
        let frame = self.frames.pop().expect("checked len above");
        let co = self.coroutines.get_mut(id).expect("active coroutine must exist");
        co.last_yielded = value;
        co.frame = frame;
        co.state = CoroutineState::Suspended;
        self.active_coroutine = None;
        Ok(())
    }

    fn do_resume(&mut self, a: RegisterId, co_reg: RegisterId) -> Result<(), Panic> {
        let co_id = match self.cur_frame().get(co_reg) {
            Value::Coroutine(id) => id,
            _ => return Err(Panic::UnknownCoroutine),
        };
        let co = self.coroutines.get_mut(co_id).ok_or(Panic::UnknownCoroutine)?;
        match co.state {
            CoroutineState::Dead => {
                let msg = Value::String("coroutine is dead".into());
                self.cur_frame_mut().set(a, Value::Err(Box::new(msg)));
                return Ok(());
            }
            CoroutineState::Running => return Err(Panic::UnknownCoroutine),
            CoroutineState::Suspended | CoroutineState::Completed => {}
        }

        let frame = std::mem::replace(&mut co.frame, Frame::default());
        co.state = CoroutineState::Running;
        let base_depth = self.frames.len();
        self.frames.push(frame);
        let prev_active = self.active_coroutine.replace((co_id, base_depth));
        self.run_to_depth(base_depth)?;
        self.active_coroutine = prev_active;

        if let Some(co) = self.coroutines.get_mut(co_id) {
            match co.state {
                CoroutineState::Suspended => {
                    let v = co.last_yielded.clone();
                    self.cur_frame_mut().set(a, Value::Ok(Box::new(v)));
                }
                CoroutineState::Completed => {
                    let v = co.final_return.clone();
                    co.state = CoroutineState::Dead;
                    self.cur_frame_mut().set(a, Value::Ok(Box::new(v)));
                }
                _ => {}
            }
        }
        Ok(())
    }

    // --- channels ------------------------------------------------------

    fn do_channel_send(&mut self, a: RegisterId, chan_reg: RegisterId, value_reg: RegisterId) -> Result<(), Panic> {
        let Value::Channel(id) = self.cur_frame().get(chan_reg) else {
            self.cur_frame_mut().set(a, Value::Bool(false));
            return Ok(());
        };
        let v = self.cur_frame().get(value_reg);
        let outcome = match self.channels.get_mut(id) {
            Some(chan) => chan.try_send(v),
            None => SendOutcome::Closed,
        };
        match outcome {
            SendOutcome::Sent => self.cur_frame_mut().set(a, Value::Bool(true)),
            SendOutcome::Closed => self.cur_frame_mut().set(a, Value::Bool(false)),
            SendOutcome::WouldBlock => {
                if self.in_coroutine_immediate_frame() {
                    self.rewind_current_instruction();
                    self.do_yield(Value::Nil)?;
                } else {
                    self.cur_frame_mut().set(a, Value::Bool(false));
                }
            }
        }
        Ok(())
    }

    fn do_channel_recv(&mut self, a: RegisterId, chan_reg: RegisterId) -> Result<(), Panic> {
        let Value::Channel(id) = self.cur_frame().get(chan_reg) else {
            self.cur_frame_mut().set(a, Value::None);
            return Ok(());
        };
        let Some(chan) = self.channels.get_mut(id) else {
            self.cur_frame_mut().set(a, Value::None);
            return Ok(());
        };
        match chan.try_recv() {
            Ok(Some(v)) => self.cur_frame_mut().set(a, Value::Some(Box::new(v))),
            Err(RecvOutcome::Done) => self.cur_frame_mut().set(a, Value::None),
            Err(RecvOutcome::WouldBlock) => {
                if self.in_coroutine_immediate_frame() {
                    chan.mark_receiver_waiting();
                    self.rewind_current_instruction();
                    self.do_yield(Value::Nil)?;
                } else {
                    self.cur_frame_mut().set(a, Value::None);
                }
            }
        }
        Ok(())
    }

    fn in_coroutine_immediate_frame(&self) -> bool {
        matches!(self.active_coroutine, Some((_, depth)) if self.frames.len() == depth + 1)
    }

    /// Rewinds the current frame's `pc` back over the instruction currently
    /// being dispatched, so a suspend-and-retry channel op re-executes the
    /// same instruction on the next `Resume`.
    fn rewind_current_instruction(&mut self) {
        self.cur_frame_mut().pc -= 1;
    }
}

const fn field_idx(hi: u8, lo: u8) -> u16 {
    (hi as u16) << 8 | (lo as u16)
}
