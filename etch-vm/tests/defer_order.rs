//! `PushDefer`/`ExecDefers`/`DeferEnd` run a frame's deferred bodies in
//! LIFO order (`spec.md` §4.J, §8): three defers pushed in program order
//! print in the reverse order they were registered.

use etch_asm::{Abc, Abx, AsBx, CallOperands, Instruction};
use etch_vm::{FunctionEntry, FunctionKind, HostRegistry, Program, Value, Vm, VmConfig};

fn native_program(constants: Vec<Value>, instructions: Vec<Instruction>, max_register: u8) -> Program {
    let mut p = Program::default();
    p.source_filename = "defer_order.etch".into();
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

#[test]
fn three_defers_run_in_reverse_registration_order() {
    // idx: 0 PushDefer->A(12), 1 PushDefer->B(9), 2 PushDefer->C(6),
    // 3 ExecDefers, 4 LoadK 1, 5 Return, 6..8 body C, 9..11 body B, 12..14 body A.
    let program = native_program(
        vec![Value::String("C".into()), Value::String("B".into()), Value::String("A".into()), Value::Int(1)],
        vec![
            Instruction::PushDefer(AsBx { a: 0, s_bx: 11 }), // -> body A at idx 12
            Instruction::PushDefer(AsBx { a: 0, s_bx: 7 }),  // -> body B at idx 9
            Instruction::PushDefer(AsBx { a: 0, s_bx: 3 }),  // -> body C at idx 6
            Instruction::ExecDefers(Abc { a: 0, b: 0, c: 0 }),
            Instruction::LoadK(Abx { a: 0, bx: 3 }),         // resumed here once all defers drain
            Instruction::Return(Abc { a: 0, b: 0, c: 0 }),
            Instruction::ArgImm(Abx { a: 0, bx: 0 }),        // body C: push "C"
            Instruction::CallBuiltin(CallOperands { a: 1, func_idx: 0, num_args: 1, num_results: 0 }),
            Instruction::DeferEnd(Abc { a: 0, b: 0, c: 0 }),
            Instruction::ArgImm(Abx { a: 0, bx: 1 }),        // body B: push "B"
            Instruction::CallBuiltin(CallOperands { a: 1, func_idx: 0, num_args: 1, num_results: 0 }),
            Instruction::DeferEnd(Abc { a: 0, b: 0, c: 0 }),
            Instruction::ArgImm(Abx { a: 0, bx: 2 }),        // body A: push "A"
            Instruction::CallBuiltin(CallOperands { a: 1, func_idx: 0, num_args: 1, num_results: 0 }),
            Instruction::DeferEnd(Abc { a: 0, b: 0, c: 0 }),
        ],
        2,
    );

    let mut vm = Vm::new(program, VmConfig::default(), HostRegistry::new());
    let exit = vm.execute();
    assert_eq!(vm.output(), b"C\nB\nA\n");
    assert_eq!(exit, 1);
}
