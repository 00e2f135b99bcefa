//! End-to-end arithmetic dispatch: hand-assembled programs exercising the
//! generic, fused, and immediate-operand opcode families together, the way
//! a compiler's output for a small expression would look.

use etch_asm::{Abc, Abx, Ax, CallOperands, Instruction};
use etch_vm::{FunctionEntry, FunctionKind, HostRegistry, Program, Value, Vm, VmConfig};

fn native_program(
    constants: Vec<Value>,
    instructions: Vec<Instruction>,
    max_register: u8,
) -> Program {
    let mut p = Program::default();
    p.source_filename = "arithmetic.etch".into();
    p.entry_point = 0;
    p.constants = constants;
    let end_pc = instructions.len() as u32;
    p.instructions = instructions;
    p.functions.push(FunctionEntry {
        name: "main".into(),
        base_name: "main".into(),
        kind: FunctionKind::Native { start_pc: 0, end_pc, max_register },
        param_types: Vec::new(),
        return_type: "Int".into(),
    });
    p.function_index.push("main".into());
    p
}

/// `6 * 7`, printed and returned as the exit code, the canonical "does the
/// dispatch loop actually run" smoke test.
#[test]
fn multiplies_and_prints_the_answer() {
    let program = native_program(
        vec![Value::Int(6), Value::Int(7)],
        vec![
            Instruction::LoadK(Abx { a: 0, bx: 0 }),
            Instruction::LoadK(Abx { a: 1, bx: 1 }),
            Instruction::Mul(Abc { a: 2, b: 0, c: 1 }),
            Instruction::Arg(Abc { a: 2, b: 0, c: 0 }),
            Instruction::CallBuiltin(CallOperands { a: 3, func_idx: 0, num_args: 1, num_results: 0 }),
            Instruction::Return(Abc { a: 2, b: 0, c: 0 }),
        ],
        4,
    );

    let mut vm = Vm::new(program, VmConfig::default(), HostRegistry::new());
    let exit_code = vm.execute();
    assert_eq!(exit_code, 42);
    assert_eq!(vm.output(), b"42\n");
}

/// The fused `MulAdd` opcode (`spec.md` §4.D): `acc += b * c`, computing
/// `30 + 3*4 == 42` in one instruction instead of a `Mul` plus an `Add`.
#[test]
fn fused_mul_add_matches_separate_ops() {
    let program = native_program(
        vec![Value::Int(30), Value::Int(3), Value::Int(4)],
        vec![
            Instruction::LoadK(Abx { a: 0, bx: 0 }),
            Instruction::LoadK(Abx { a: 1, bx: 1 }),
            Instruction::LoadK(Abx { a: 2, bx: 2 }),
            Instruction::MulAdd(Ax::from_fields4(0, 1, 2, 0)),
            Instruction::Return(Abc { a: 0, b: 0, c: 0 }),
        ],
        3,
    );

    let mut vm = Vm::new(program, VmConfig::default(), HostRegistry::new());
    assert_eq!(vm.execute(), 42);
}

/// Immediate-operand arithmetic (`AddI`) and wrapping overflow both read
/// straight off `spec.md` §4.D: mismatched/overflowing math never traps.
#[test]
fn add_immediate_wraps_on_overflow() {
    let program = native_program(
        vec![Value::Int(i64::MAX)],
        vec![
            Instruction::LoadK(Abx { a: 0, bx: 0 }),
            Instruction::AddI(Abc { a: 1, b: 0, c: 1 }),
            Instruction::Return(Abc { a: 1, b: 0, c: 0 }),
        ],
        2,
    );

    let mut vm = Vm::new(program, VmConfig::default(), HostRegistry::new());
    assert_eq!(vm.execute(), i64::MIN);
}
